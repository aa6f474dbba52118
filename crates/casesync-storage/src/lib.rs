//! Store boundary for casesync: field catalog, entity tables and sync-run audit records.
//!
//! Components receive these stores as explicit handles. [`PgStore`] backs production runs;
//! [`MemoryStore`] backs tests and dry runs.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use casesync_core::{EntityKind, FieldCatalogEntry, LocalRecord, SqlValue, SyncRun};
use chrono::{DateTime, Utc};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{build_upsert_sql, PgStore};

pub const CRATE_NAME: &str = "casesync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("column {column} is already mapped to another label")]
    ColumnTaken { column: String },
    #[error("unknown column {column} on {table}")]
    UnknownColumn { table: String, column: String },
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("record not found: {kind}/{remote_id}")]
    NotFound { kind: EntityKind, remote_id: String },
    #[error("ddl statement failed: {0}")]
    Ddl(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
}

/// Buffered usage for one catalog label, written as an atomic increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageDelta {
    pub label: String,
    pub increment: i64,
    pub last_seen_at: DateTime<Utc>,
}

/// Additive schema change. Nothing here can drop, retype or tighten a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlStatement {
    AddColumn {
        table: String,
        column: String,
        sql_type: String,
    },
    CreateIndex {
        table: String,
        index: String,
        column: String,
    },
}

impl DdlStatement {
    pub fn table(&self) -> &str {
        match self {
            DdlStatement::AddColumn { table, .. } | DdlStatement::CreateIndex { table, .. } => table,
        }
    }

    pub fn column(&self) -> &str {
        match self {
            DdlStatement::AddColumn { column, .. } | DdlStatement::CreateIndex { column, .. } => column,
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            DdlStatement::AddColumn {
                table,
                column,
                sql_type,
            } => format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {} NULL",
                quote_ident(table),
                quote_ident(column),
                sql_type
            ),
            DdlStatement::CreateIndex {
                table,
                index,
                column,
            } => format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(index),
                quote_ident(table),
                quote_ident(column)
            ),
        }
    }
}

impl fmt::Display for DdlStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Identifiers produced by the catalog are lower-case ASCII, digits and `_`.
pub fn is_safe_identifier(ident: &str) -> bool {
    !ident.is_empty()
        && ident.len() <= casesync_core::IDENTIFIER_LIMIT
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Fixed columns of every entity table and their SQL types.
pub fn base_columns() -> Vec<(&'static str, &'static str)> {
    vec![
        ("id", "UUID"),
        ("remote_id", "TEXT"),
        ("name", "TEXT"),
        ("status", "TEXT"),
        ("client_ref_id", "TEXT"),
        ("client_ref_name", "TEXT"),
        ("remote_created_at", "TIMESTAMPTZ"),
        ("remote_updated_at", "TIMESTAMPTZ"),
        ("local_owned_fields", "TEXT[]"),
        ("last_synced_at", "TIMESTAMPTZ"),
        ("created_at", "TIMESTAMPTZ"),
        ("updated_at", "TIMESTAMPTZ"),
    ]
}

/// Columns managed by the store itself rather than written from record values.
pub fn is_bookkeeping_column(column: &str) -> bool {
    matches!(
        column,
        "id" | "remote_id" | "local_owned_fields" | "last_synced_at" | "created_at" | "updated_at"
    )
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load_catalog(&self) -> Result<Vec<FieldCatalogEntry>, StoreError>;

    /// Inserts `entry` unless its label exists, returning whichever row is stored afterwards.
    async fn insert_catalog_entry(
        &self,
        entry: &FieldCatalogEntry,
    ) -> Result<FieldCatalogEntry, StoreError>;

    async fn record_catalog_usage(&self, usage: &[UsageDelta]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn live_columns(&self, kind: EntityKind) -> Result<BTreeSet<String>, StoreError>;

    fn supports_transactional_ddl(&self) -> bool;

    /// Applies every statement or none of them.
    async fn execute_ddl_batch(&self, statements: &[DdlStatement]) -> Result<(), StoreError>;

    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<(), StoreError>;

    async fn load_record(
        &self,
        kind: EntityKind,
        remote_id: &str,
    ) -> Result<Option<LocalRecord>, StoreError>;

    /// Insert-or-update keyed on the remote id. Columns listed in the stored row's
    /// local-owned set keep their stored values.
    async fn upsert_record(&self, record: &LocalRecord) -> Result<(), StoreError>;

    /// Edit made through the CRUD layer: writes the value and marks the column local-owned.
    async fn apply_local_edit(
        &self,
        kind: EntityKind,
        remote_id: &str,
        column: &str,
        value: SqlValue,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, run: &SyncRun) -> Result<(), StoreError>;

    async fn latest_run(&self, kind: EntityKind) -> Result<Option<SyncRun>, StoreError>;
}

/// Everything a sync pipeline writes to. Implemented for any type providing all three stores.
pub trait SyncStore: CatalogStore + RecordStore + RunStore {}

impl<T: CatalogStore + RecordStore + RunStore> SyncStore for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_is_additive_and_idempotent() {
        let add = DdlStatement::AddColumn {
            table: "matters".into(),
            column: "rel_value".into(),
            sql_type: "NUMERIC(18,2)".into(),
        };
        assert_eq!(
            add.to_sql(),
            r#"ALTER TABLE "matters" ADD COLUMN IF NOT EXISTS "rel_value" NUMERIC(18,2) NULL"#
        );

        let index = DdlStatement::CreateIndex {
            table: "matters".into(),
            index: "idx_matters_qi_ref_id".into(),
            column: "qi_ref_id".into(),
        };
        assert_eq!(
            index.to_sql(),
            r#"CREATE INDEX IF NOT EXISTS "idx_matters_qi_ref_id" ON "matters" ("qi_ref_id")"#
        );
    }

    #[test]
    fn identifiers_are_validated_and_quoted() {
        assert!(is_safe_identifier("rel_value_2"));
        assert!(!is_safe_identifier("Rel Value"));
        assert!(!is_safe_identifier("x\"; DROP TABLE matters; --"));
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn base_columns_cover_well_known_columns() {
        let names = base_columns().into_iter().map(|(n, _)| n).collect::<Vec<_>>();
        for column in casesync_core::WELL_KNOWN_COLUMNS {
            assert!(names.contains(column), "{column} missing from base table");
        }
    }
}
