use casesync_core::{truncate_to_micros, LocalRecord, RemoteRow, SqlValue};
use casesync_storage::{RecordStore, StoreError};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("loading {remote_id}: {source}")]
    Load {
        remote_id: String,
        #[source]
        source: StoreError,
    },
    #[error("writing {remote_id}: {source}")]
    Write {
        remote_id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub record: LocalRecord,
    /// False when the stored row already held every supplied value; nothing is written then.
    pub changed: bool,
}

fn same_value(stored: Option<&SqlValue>, incoming: &SqlValue) -> bool {
    match stored {
        Some(stored) => stored == incoming,
        None => incoming.is_null(),
    }
}

/// Computes the row that sync should leave behind for `remote`.
///
/// Supplied columns overwrite stored ones (NULL included) unless local-owned. Columns the
/// remote row does not mention are left as stored.
pub fn merge(remote: &RemoteRow, existing: Option<&LocalRecord>, now: DateTime<Utc>) -> MergeOutcome {
    let Some(existing) = existing else {
        return MergeOutcome {
            record: LocalRecord::from_remote(remote, now),
            changed: true,
        };
    };

    let mut record = existing.clone();
    let mut changed = false;
    for (column, value) in &remote.values {
        if existing.is_local_owned(column) || same_value(existing.value(column), value) {
            continue;
        }
        record.values.insert(column.clone(), value.clone());
        changed = true;
    }
    if changed {
        record.last_synced_at = Some(truncate_to_micros(now));
    }
    MergeOutcome { record, changed }
}

/// Loads, merges and writes one row. Unchanged rows are not written.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeEngine;

impl MergeEngine {
    pub async fn apply<S>(
        &self,
        store: &S,
        remote: &RemoteRow,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, MergeError>
    where
        S: RecordStore + ?Sized,
    {
        let existing = store
            .load_record(remote.kind, &remote.remote_id)
            .await
            .map_err(|source| MergeError::Load {
                remote_id: remote.remote_id.clone(),
                source,
            })?;
        let outcome = merge(remote, existing.as_ref(), now);
        if outcome.changed {
            store
                .upsert_record(&outcome.record)
                .await
                .map_err(|source| MergeError::Write {
                    remote_id: remote.remote_id.clone(),
                    source,
                })?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::str::FromStr;

    use bigdecimal::BigDecimal;
    use casesync_core::EntityKind;
    use casesync_storage::{DdlStatement, MemoryStore};
    use chrono::Duration;

    use super::*;

    fn row(values: &[(&str, SqlValue)]) -> RemoteRow {
        RemoteRow {
            kind: EntityKind::Matters,
            remote_id: "m-1".into(),
            values: values
                .iter()
                .map(|(c, v)| (c.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn decimal(raw: &str) -> SqlValue {
        SqlValue::Decimal(BigDecimal::from_str(raw).unwrap())
    }

    async fn store_with_rel_value() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .execute_ddl(&DdlStatement::AddColumn {
                table: "matters".into(),
                column: "rel_value".into(),
                sql_type: "NUMERIC(18,2)".into(),
            })
            .await
            .unwrap();
        store
    }

    #[test]
    fn new_rows_take_every_value() {
        let now = Utc::now();
        let outcome = merge(&row(&[("rel_value", decimal("212000.00"))]), None, now);
        assert!(outcome.changed);
        assert_eq!(outcome.record.value("rel_value"), Some(&decimal("212000.00")));
        assert_eq!(outcome.record.last_synced_at, Some(truncate_to_micros(now)));
    }

    #[test]
    fn identical_input_is_a_no_op() {
        let t0 = Utc::now();
        let input = row(&[("rel_value", decimal("212000.00")), ("name", SqlValue::Null)]);
        let first = merge(&input, None, t0);
        let second = merge(&input, Some(&first.record), t0 + Duration::hours(1));
        assert!(!second.changed);
        assert_eq!(second.record, first.record);
    }

    #[test]
    fn local_owned_columns_are_never_touched() {
        let t0 = Utc::now();
        let mut stored = merge(&row(&[("rel_value", decimal("212000.00"))]), None, t0).record;
        stored.values.insert("rel_value".into(), decimal("250000.00"));
        stored.local_owned.insert("rel_value".into());

        for incoming in [decimal("212000.00"), SqlValue::Null, decimal("1.00")] {
            let outcome = merge(&row(&[("rel_value", incoming)]), Some(&stored), t0);
            assert_eq!(outcome.record.value("rel_value"), Some(&decimal("250000.00")));
            assert!(!outcome.changed);
        }
    }

    #[test]
    fn empty_remote_value_overwrites_and_absent_field_does_not() {
        let t0 = Utc::now();
        let stored = merge(
            &row(&[
                ("rel_value", decimal("212000.00")),
                ("notes", SqlValue::Text("keep".into())),
            ]),
            None,
            t0,
        )
        .record;

        let outcome = merge(&row(&[("rel_value", SqlValue::Null)]), Some(&stored), t0);
        assert!(outcome.changed);
        assert_eq!(outcome.record.value("rel_value"), Some(&SqlValue::Null));
        assert_eq!(outcome.record.value("notes"), Some(&SqlValue::Text("keep".into())));
    }

    #[tokio::test]
    async fn repeated_sync_leaves_store_byte_identical() {
        let store = store_with_rel_value().await;
        let input = row(&[("rel_value", decimal("212000.00"))]);
        let t0 = Utc::now();

        let first = MergeEngine.apply(&store, &input, t0).await.unwrap();
        assert!(first.changed);
        let after_first = store.records(EntityKind::Matters).await;

        let second = MergeEngine
            .apply(&store, &input, t0 + Duration::minutes(5))
            .await
            .unwrap();
        assert!(!second.changed);
        assert_eq!(store.records(EntityKind::Matters).await, after_first);
        assert_eq!(after_first.len(), 1);
    }

    #[tokio::test]
    async fn local_edit_survives_resync() {
        let store = store_with_rel_value().await;
        let input = row(&[("rel_value", decimal("212000.00"))]);
        MergeEngine.apply(&store, &input, Utc::now()).await.unwrap();
        store
            .apply_local_edit(EntityKind::Matters, "m-1", "rel_value", decimal("199999.99"))
            .await
            .unwrap();

        MergeEngine.apply(&store, &input, Utc::now()).await.unwrap();
        let records = store.records(EntityKind::Matters).await;
        assert_eq!(records[0].value("rel_value"), Some(&decimal("199999.99")));
    }

    #[tokio::test]
    async fn write_failures_name_the_record() {
        let store = MemoryStore::new();
        let err = MergeEngine
            .apply(&store, &row(&[("unknown_col", SqlValue::Null)]), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Write { ref remote_id, .. } if remote_id == "m-1"));
    }
}
