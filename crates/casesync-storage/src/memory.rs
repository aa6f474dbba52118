//! In-memory store with the same upsert and DDL semantics as [`crate::PgStore`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use casesync_core::{EntityKind, FieldCatalogEntry, LocalRecord, SqlValue, SyncRun};
use tokio::sync::Mutex;

use crate::{
    base_columns, is_bookkeeping_column, CatalogStore, DdlStatement, RecordStore, RunStore,
    StoreError, UsageDelta,
};

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: BTreeMap<String, String>,
    indexes: BTreeSet<String>,
    rows: BTreeMap<String, LocalRecord>,
}

impl MemoryTable {
    fn new() -> Self {
        Self {
            columns: base_columns()
                .into_iter()
                .map(|(name, sql_type)| (name.to_string(), sql_type.to_string()))
                .collect(),
            indexes: BTreeSet::new(),
            rows: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    catalog: BTreeMap<String, FieldCatalogEntry>,
    tables: HashMap<EntityKind, MemoryTable>,
    runs: Vec<SyncRun>,
}

impl MemoryState {
    fn table_mut(&mut self, kind: EntityKind) -> &mut MemoryTable {
        self.tables.entry(kind).or_insert_with(MemoryTable::new)
    }

    fn table_for_name_mut(&mut self, table: &str) -> Result<&mut MemoryTable, StoreError> {
        let kind = EntityKind::ALL
            .into_iter()
            .find(|k| k.table_name() == table)
            .ok_or_else(|| StoreError::Ddl(format!("relation {table:?} does not exist")))?;
        Ok(self.table_mut(kind))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    transactional_ddl: bool,
    failing_columns: Mutex<HashSet<String>>,
    catalog_unavailable: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transactional_ddl(mut self, enabled: bool) -> Self {
        self.transactional_ddl = enabled;
        self
    }

    /// Makes every DDL statement touching `column` fail.
    pub async fn fail_ddl_for(&self, column: impl Into<String>) {
        self.failing_columns.lock().await.insert(column.into());
    }

    pub async fn set_catalog_unavailable(&self, unavailable: bool) {
        *self.catalog_unavailable.lock().await = unavailable;
    }

    pub async fn catalog_entry(&self, label: &str) -> Option<FieldCatalogEntry> {
        self.state.lock().await.catalog.get(label).cloned()
    }

    /// Writes a catalog row directly, bypassing insert-if-absent.
    pub async fn put_catalog_entry(&self, entry: FieldCatalogEntry) {
        self.state
            .lock()
            .await
            .catalog
            .insert(entry.label.clone(), entry);
    }

    pub async fn records(&self, kind: EntityKind) -> Vec<LocalRecord> {
        let mut state = self.state.lock().await;
        state.table_mut(kind).rows.values().cloned().collect()
    }

    pub async fn indexes(&self, kind: EntityKind) -> BTreeSet<String> {
        let mut state = self.state.lock().await;
        state.table_mut(kind).indexes.clone()
    }

    pub async fn runs(&self) -> Vec<SyncRun> {
        self.state.lock().await.runs.clone()
    }

    async fn check_catalog_available(&self) -> Result<(), StoreError> {
        if *self.catalog_unavailable.lock().await {
            return Err(StoreError::Unavailable("field_catalog".to_string()));
        }
        Ok(())
    }

    async fn apply_statement(
        &self,
        state: &mut MemoryState,
        statement: &DdlStatement,
    ) -> Result<(), StoreError> {
        if self.failing_columns.lock().await.contains(statement.column()) {
            return Err(StoreError::Ddl(format!("{statement}: injected failure")));
        }
        let table = state.table_for_name_mut(statement.table())?;
        match statement {
            DdlStatement::AddColumn {
                column, sql_type, ..
            } => {
                table
                    .columns
                    .entry(column.clone())
                    .or_insert_with(|| sql_type.clone());
            }
            DdlStatement::CreateIndex { index, column, .. } => {
                if !table.columns.contains_key(column) {
                    return Err(StoreError::Ddl(format!(
                        "{statement}: column {column:?} does not exist"
                    )));
                }
                table.indexes.insert(index.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn load_catalog(&self) -> Result<Vec<FieldCatalogEntry>, StoreError> {
        self.check_catalog_available().await?;
        Ok(self.state.lock().await.catalog.values().cloned().collect())
    }

    async fn insert_catalog_entry(
        &self,
        entry: &FieldCatalogEntry,
    ) -> Result<FieldCatalogEntry, StoreError> {
        self.check_catalog_available().await?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.catalog.get(&entry.label) {
            return Ok(existing.clone());
        }
        if state
            .catalog
            .values()
            .any(|e| e.local_column == entry.local_column)
        {
            return Err(StoreError::ColumnTaken {
                column: entry.local_column.clone(),
            });
        }
        state.catalog.insert(entry.label.clone(), entry.clone());
        Ok(entry.clone())
    }

    async fn record_catalog_usage(&self, usage: &[UsageDelta]) -> Result<(), StoreError> {
        self.check_catalog_available().await?;
        let mut state = self.state.lock().await;
        for delta in usage {
            if let Some(entry) = state.catalog.get_mut(&delta.label) {
                entry.usage_count += delta.increment;
                entry.last_seen_at = entry.last_seen_at.max(delta.last_seen_at);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn live_columns(&self, kind: EntityKind) -> Result<BTreeSet<String>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.table_mut(kind).columns.keys().cloned().collect())
    }

    fn supports_transactional_ddl(&self) -> bool {
        self.transactional_ddl
    }

    async fn execute_ddl_batch(&self, statements: &[DdlStatement]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut staged = MemoryState {
            catalog: BTreeMap::new(),
            tables: state.tables.clone(),
            runs: Vec::new(),
        };
        for statement in statements {
            self.apply_statement(&mut staged, statement).await?;
        }
        state.tables = staged.tables;
        Ok(())
    }

    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        self.apply_statement(&mut state, statement).await
    }

    async fn load_record(
        &self,
        kind: EntityKind,
        remote_id: &str,
    ) -> Result<Option<LocalRecord>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.table_mut(kind).rows.get(remote_id).cloned())
    }

    async fn upsert_record(&self, record: &LocalRecord) -> Result<(), StoreError> {
        let remote_id = record.remote_id.clone().ok_or_else(|| {
            StoreError::Corrupt(format!("record {} has no remote id to upsert on", record.id))
        })?;
        let mut state = self.state.lock().await;
        let table = state.table_mut(record.kind);
        if let Some(column) = record
            .values
            .keys()
            .find(|c| !is_bookkeeping_column(c) && !table.columns.contains_key(*c))
        {
            return Err(StoreError::UnknownColumn {
                table: record.kind.table_name().to_string(),
                column: column.clone(),
            });
        }

        match table.rows.get_mut(&remote_id) {
            Some(stored) => {
                for (column, value) in &record.values {
                    if !stored.local_owned.contains(column) {
                        stored.values.insert(column.clone(), value.clone());
                    }
                }
                stored.last_synced_at = record.last_synced_at;
            }
            None => {
                let mut fresh = record.clone();
                fresh.local_owned.clear();
                table.rows.insert(remote_id, fresh);
            }
        }
        Ok(())
    }

    async fn apply_local_edit(
        &self,
        kind: EntityKind,
        remote_id: &str,
        column: &str,
        value: SqlValue,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let table = state.table_mut(kind);
        if !table.columns.contains_key(column) {
            return Err(StoreError::UnknownColumn {
                table: kind.table_name().to_string(),
                column: column.to_string(),
            });
        }
        let stored = table
            .rows
            .get_mut(remote_id)
            .ok_or_else(|| StoreError::NotFound {
                kind,
                remote_id: remote_id.to_string(),
            })?;
        stored.values.insert(column.to_string(), value);
        stored.local_owned.insert(column.to_string());
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn save_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => state.runs.push(run.clone()),
        }
        Ok(())
    }

    async fn latest_run(&self, kind: EntityKind) -> Result<Option<SyncRun>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.kind == kind)
            .max_by_key(|r| r.started_at)
            .cloned())
    }
}
