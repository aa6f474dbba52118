//! Registry mapping custom-field labels to local columns.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use casesync_core::{
    column_matches_label, derive_column_name, physical_columns, truncate_to_micros,
    with_numeric_suffix, DeclaredType, FieldCatalogEntry,
};
use casesync_storage::{CatalogStore, StoreError, UsageDelta};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

/// Suffixes tried before a label is reported as unplaceable.
const MAX_SUFFIX: u32 = 1_000;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("field catalog store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("field catalog corrupt: {0}")]
    Corrupt(String),
    #[error("no free column for label {label:?}")]
    Exhausted { label: String },
}

impl CatalogError {
    /// Store and corruption failures end the run; an unplaceable label only skips that field.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CatalogError::Exhausted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub entry: FieldCatalogEntry,
    /// The entry was inserted by this call.
    pub created: bool,
    /// The label is known under a different declared type; the stored type wins.
    pub type_conflict: bool,
}

#[derive(Debug, Default)]
pub struct FieldCatalog {
    entries: HashMap<String, FieldCatalogEntry>,
    pending: BTreeMap<String, UsageDelta>,
}

impl FieldCatalog {
    /// Loads and validates every persisted entry.
    pub async fn bootstrap<S>(store: &S) -> Result<Self, CatalogError>
    where
        S: CatalogStore + ?Sized,
    {
        let entries = store.load_catalog().await?;
        validate(&entries)?;
        debug!(entries = entries.len(), "field catalog loaded");
        Ok(Self {
            entries: entries.into_iter().map(|e| (e.label.clone(), e)).collect(),
            pending: BTreeMap::new(),
        })
    }

    pub fn get(&self, label: &str) -> Option<&FieldCatalogEntry> {
        self.entries.get(label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FieldCatalogEntry> {
        self.entries.values()
    }

    /// Returns the entry for `label`, creating it on first sight.
    pub async fn resolve<S>(
        &mut self,
        store: &S,
        label: &str,
        declared_type: DeclaredType,
        now: DateTime<Utc>,
    ) -> Result<Resolution, CatalogError>
    where
        S: CatalogStore + ?Sized,
    {
        if let Some(entry) = self.entries.get(label) {
            return Ok(self.resolution(entry.clone(), false, declared_type));
        }

        let now = truncate_to_micros(now);
        let mut attempt = 1;
        loop {
            let column = self
                .free_column(label, declared_type, attempt)
                .ok_or_else(|| CatalogError::Exhausted {
                    label: label.to_string(),
                })?;
            let candidate = FieldCatalogEntry {
                label: label.to_string(),
                declared_type,
                local_column: column,
                usage_count: 0,
                first_seen_at: now,
                last_seen_at: now,
            };

            match store.insert_catalog_entry(&candidate).await {
                Ok(stored) => {
                    if !column_matches_label(&stored.local_column, &stored.label) {
                        return Err(CatalogError::Corrupt(format!(
                            "label {:?} stored with column {:?}",
                            stored.label, stored.local_column
                        )));
                    }
                    let created = stored == candidate;
                    if created {
                        debug!(label, column = %stored.local_column, "new catalog entry");
                    }
                    self.entries.insert(stored.label.clone(), stored.clone());
                    return Ok(self.resolution(stored, created, declared_type));
                }
                Err(StoreError::ColumnTaken { column }) => {
                    debug!(label, column = %column, "column claimed concurrently; reloading catalog");
                    for entry in store.load_catalog().await? {
                        self.entries.entry(entry.label.clone()).or_insert(entry);
                    }
                    if let Some(entry) = self.entries.get(label) {
                        return Ok(self.resolution(entry.clone(), false, declared_type));
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Buffers one observation of `label`. Only non-empty payloads count towards materialization.
    pub fn record_usage(&mut self, label: &str, had_non_empty: bool, seen_at: DateTime<Utc>) {
        let seen_at = truncate_to_micros(seen_at);
        let increment = i64::from(had_non_empty);
        let delta = self
            .pending
            .entry(label.to_string())
            .or_insert_with(|| UsageDelta {
                label: label.to_string(),
                increment: 0,
                last_seen_at: seen_at,
            });
        delta.increment += increment;
        delta.last_seen_at = delta.last_seen_at.max(seen_at);

        if let Some(entry) = self.entries.get_mut(label) {
            entry.usage_count += increment;
            entry.last_seen_at = entry.last_seen_at.max(seen_at);
        }
    }

    /// Writes buffered usage as atomic increments.
    pub async fn flush<S>(&mut self, store: &S) -> Result<(), CatalogError>
    where
        S: CatalogStore + ?Sized,
    {
        if self.pending.is_empty() {
            return Ok(());
        }
        let deltas = self.pending.values().cloned().collect::<Vec<_>>();
        store.record_catalog_usage(&deltas).await?;
        self.pending.clear();
        Ok(())
    }

    fn resolution(
        &self,
        entry: FieldCatalogEntry,
        created: bool,
        declared_type: DeclaredType,
    ) -> Resolution {
        let type_conflict = entry.declared_type != declared_type;
        if type_conflict {
            warn!(
                label = %entry.label,
                catalog_type = %entry.declared_type,
                observed_type = %declared_type,
                "declared type differs from catalog; keeping catalog type"
            );
        }
        Resolution {
            entry,
            created,
            type_conflict,
        }
    }

    /// First derived column (plain, then `_2`, `_3`, ...) at or after `from` that clashes with
    /// no other entry's physical columns.
    fn free_column(&self, label: &str, declared_type: DeclaredType, from: u32) -> Option<String> {
        let taken = self
            .entries
            .values()
            .filter(|e| e.label != label)
            .flat_map(|e| {
                let mut cols = e.physical_columns();
                cols.push(e.local_column.clone());
                cols
            })
            .collect::<BTreeSet<_>>();
        let base = derive_column_name(label);

        (from.max(1)..=MAX_SUFFIX)
            .map(|n| match n {
                1 => base.clone(),
                n => with_numeric_suffix(&base, n),
            })
            .find(|candidate| {
                !taken.contains(candidate)
                    && physical_columns(candidate, declared_type)
                        .iter()
                        .all(|c| !taken.contains(c))
            })
    }
}

fn validate(entries: &[FieldCatalogEntry]) -> Result<(), CatalogError> {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    for entry in entries {
        if !column_matches_label(&entry.local_column, &entry.label) {
            return Err(CatalogError::Corrupt(format!(
                "label {:?} maps to {:?}, which is not derived from it",
                entry.label, entry.local_column
            )));
        }
        if let Some(other) = owners.insert(entry.local_column.as_str(), entry.label.as_str()) {
            return Err(CatalogError::Corrupt(format!(
                "labels {:?} and {:?} share column {:?}",
                other, entry.label, entry.local_column
            )));
        }
    }
    Ok(())
}
