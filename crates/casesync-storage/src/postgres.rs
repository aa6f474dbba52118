//! PostgreSQL store. Entity tables gain columns at runtime, so every row query here is
//! built from the live column list rather than checked at compile time.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use casesync_core::{EntityKind, FieldCatalogEntry, LocalRecord, SqlValue, SyncRun};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row, TypeInfo};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    is_bookkeeping_column, is_safe_identifier, quote_ident, CatalogStore, DdlStatement,
    RecordStore, RunStore, StoreError, UsageDelta,
};

const CATALOG_COLUMN_UNIQUE: &str = "field_catalog_local_column_key";

/// Storage class of a live column, needed to bind typed NULLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnClass {
    Text,
    Numeric,
    Timestamp,
    Boolean,
    Other,
}

impl ColumnClass {
    fn from_data_type(data_type: &str) -> Self {
        match data_type {
            "text" | "character varying" => ColumnClass::Text,
            "numeric" => ColumnClass::Numeric,
            "timestamp with time zone" => ColumnClass::Timestamp,
            "boolean" => ColumnClass::Boolean,
            _ => ColumnClass::Other,
        }
    }
}

pub struct PgStore {
    pool: PgPool,
    column_classes: RwLock<HashMap<EntityKind, HashMap<String, ColumnClass>>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            column_classes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Creates the catalog, run and base entity tables.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn refresh_columns(
        &self,
        kind: EntityKind,
    ) -> Result<HashMap<String, ColumnClass>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name, data_type::text AS data_type
              FROM information_schema.columns
             WHERE table_schema = current_schema()
               AND table_name = $1
            "#,
        )
        .bind(kind.table_name())
        .fetch_all(&self.pool)
        .await?;

        let mut classes = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            classes.insert(name, ColumnClass::from_data_type(&data_type));
        }
        self.column_classes
            .write()
            .await
            .insert(kind, classes.clone());
        Ok(classes)
    }

    async fn classes_for(
        &self,
        kind: EntityKind,
        columns: &[&str],
    ) -> Result<HashMap<String, ColumnClass>, StoreError> {
        if let Some(cached) = self.column_classes.read().await.get(&kind) {
            if columns.iter().all(|c| cached.contains_key(*c)) {
                return Ok(cached.clone());
            }
        }
        self.refresh_columns(kind).await
    }
}

/// `INSERT .. ON CONFLICT (remote_id) DO UPDATE` for the given value columns.
///
/// Parameters: `$1` id, `$2` remote id, `$3` last-synced timestamp, then one per column.
/// The update arm re-reads `local_owned_fields` from the stored row so a CRUD edit that
/// lands between load and write still wins.
pub fn build_upsert_sql(table: &str, columns: &[&str]) -> String {
    let table_q = quote_ident(table);
    let mut insert_cols = vec![
        quote_ident("id"),
        quote_ident("remote_id"),
        quote_ident("last_synced_at"),
    ];
    insert_cols.extend(columns.iter().map(|c| quote_ident(c)));
    let placeholders = (1..=insert_cols.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut updates = vec![format!(
        "{col} = EXCLUDED.{col}",
        col = quote_ident("last_synced_at")
    )];
    for column in columns {
        let col = quote_ident(column);
        updates.push(format!(
            "{col} = CASE WHEN '{column}' = ANY({table_q}.\"local_owned_fields\") THEN {table_q}.{col} ELSE EXCLUDED.{col} END"
        ));
    }
    updates.push(format!("{} = NOW()", quote_ident("updated_at")));

    format!(
        "INSERT INTO {table_q} ({}) VALUES ({placeholders}) ON CONFLICT ({}) DO UPDATE SET {}",
        insert_cols.join(", "),
        quote_ident("remote_id"),
        updates.join(", ")
    )
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q SqlValue,
    class: ColumnClass,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => match class {
            ColumnClass::Numeric => query.bind(None::<BigDecimal>),
            ColumnClass::Timestamp => query.bind(None::<DateTime<Utc>>),
            ColumnClass::Boolean => query.bind(None::<bool>),
            ColumnClass::Text | ColumnClass::Other => query.bind(None::<String>),
        },
        SqlValue::Text(s) => query.bind(s.as_str()),
        SqlValue::Decimal(d) => query.bind(d.clone()),
        SqlValue::Timestamp(ts) => query.bind(*ts),
        SqlValue::Boolean(b) => query.bind(*b),
    }
}

fn decode_record(kind: EntityKind, row: &PgRow) -> Result<LocalRecord, StoreError> {
    let mut values = BTreeMap::new();
    for column in row.columns() {
        let name = column.name();
        if is_bookkeeping_column(name) {
            continue;
        }
        let value = match column.type_info().name() {
            "NUMERIC" => row
                .try_get::<Option<BigDecimal>, _>(name)?
                .map(SqlValue::Decimal),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(name)?
                .map(SqlValue::Timestamp),
            "BOOL" => row.try_get::<Option<bool>, _>(name)?.map(SqlValue::Boolean),
            "TEXT" | "VARCHAR" => row.try_get::<Option<String>, _>(name)?.map(SqlValue::Text),
            other => {
                return Err(StoreError::Corrupt(format!(
                    "column {name} on {kind} has unsupported type {other}"
                )))
            }
        };
        values.insert(name.to_string(), value.unwrap_or(SqlValue::Null));
    }

    let local_owned: Vec<String> = row.try_get("local_owned_fields")?;
    Ok(LocalRecord {
        id: row.try_get("id")?,
        kind,
        remote_id: row.try_get("remote_id")?,
        values,
        local_owned: local_owned.into_iter().collect(),
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

fn decode_catalog_entry(row: &PgRow) -> Result<FieldCatalogEntry, StoreError> {
    let declared_type: String = row.try_get("declared_type")?;
    Ok(FieldCatalogEntry {
        label: row.try_get("label")?,
        declared_type: declared_type
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("field_catalog.declared_type: {e}")))?,
        local_column: row.try_get("local_column")?,
        usage_count: row.try_get("usage_count")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn checked_ident(ident: &str) -> Result<(), StoreError> {
    if is_safe_identifier(ident) {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(ident.to_string()))
    }
}

fn checked_statement(statement: &DdlStatement) -> Result<String, StoreError> {
    checked_ident(statement.table())?;
    checked_ident(statement.column())?;
    if let DdlStatement::CreateIndex { index, .. } = statement {
        checked_ident(index)?;
    }
    Ok(statement.to_sql())
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn load_catalog(&self) -> Result<Vec<FieldCatalogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT label, declared_type, local_column, usage_count, first_seen_at, last_seen_at
              FROM field_catalog
             ORDER BY first_seen_at, label
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("loading field_catalog: {e}")))?;

        rows.iter().map(decode_catalog_entry).collect()
    }

    async fn insert_catalog_entry(
        &self,
        entry: &FieldCatalogEntry,
    ) -> Result<FieldCatalogEntry, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO field_catalog
                (label, declared_type, local_column, usage_count, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (label) DO NOTHING
            RETURNING label, declared_type, local_column, usage_count, first_seen_at, last_seen_at
            "#,
        )
        .bind(&entry.label)
        .bind(entry.declared_type.as_str())
        .bind(&entry.local_column)
        .bind(entry.usage_count)
        .bind(entry.first_seen_at)
        .bind(entry.last_seen_at)
        .fetch_optional(&self.pool)
        .await;

        let row = match inserted {
            Ok(Some(row)) => row,
            Ok(None) => {
                sqlx::query(
                    r#"
                    SELECT label, declared_type, local_column, usage_count, first_seen_at, last_seen_at
                      FROM field_catalog
                     WHERE label = $1
                    "#,
                )
                .bind(&entry.label)
                .fetch_one(&self.pool)
                .await?
            }
            Err(sqlx::Error::Database(db))
                if db.is_unique_violation() && db.constraint() == Some(CATALOG_COLUMN_UNIQUE) =>
            {
                return Err(StoreError::ColumnTaken {
                    column: entry.local_column.clone(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        decode_catalog_entry(&row)
    }

    async fn record_catalog_usage(&self, usage: &[UsageDelta]) -> Result<(), StoreError> {
        if usage.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for delta in usage {
            sqlx::query(
                r#"
                UPDATE field_catalog
                   SET usage_count = usage_count + $2,
                       last_seen_at = GREATEST(last_seen_at, $3)
                 WHERE label = $1
                "#,
            )
            .bind(&delta.label)
            .bind(delta.increment)
            .bind(delta.last_seen_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn live_columns(&self, kind: EntityKind) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.refresh_columns(kind).await?.into_keys().collect())
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    async fn execute_ddl_batch(&self, statements: &[DdlStatement]) -> Result<(), StoreError> {
        let sql = statements
            .iter()
            .map(checked_statement)
            .collect::<Result<Vec<_>, _>>()?;
        let mut tx = self.pool.begin().await?;
        for statement in &sql {
            debug!(statement = %statement, "applying ddl");
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        self.column_classes.write().await.clear();
        Ok(())
    }

    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<(), StoreError> {
        let sql = checked_statement(statement)?;
        debug!(statement = %sql, "applying ddl");
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Ddl(format!("{sql}: {e}")))?;
        self.column_classes.write().await.clear();
        Ok(())
    }

    async fn load_record(
        &self,
        kind: EntityKind,
        remote_id: &str,
    ) -> Result<Option<LocalRecord>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE remote_id = $1",
            quote_ident(kind.table_name())
        );
        let row = sqlx::query(&sql)
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_record(kind, &r)).transpose()
    }

    async fn upsert_record(&self, record: &LocalRecord) -> Result<(), StoreError> {
        let remote_id = record.remote_id.as_deref().ok_or_else(|| {
            StoreError::Corrupt(format!("record {} has no remote id to upsert on", record.id))
        })?;
        let columns = record
            .values
            .keys()
            .map(String::as_str)
            .filter(|c| !is_bookkeeping_column(c))
            .collect::<Vec<_>>();
        for column in &columns {
            checked_ident(column)?;
        }

        let classes = self.classes_for(record.kind, &columns).await?;
        let sql = build_upsert_sql(record.kind.table_name(), &columns);
        let mut query = sqlx::query(&sql)
            .bind(record.id)
            .bind(remote_id)
            .bind(record.last_synced_at);
        for column in &columns {
            let class = classes.get(*column).copied().ok_or_else(|| StoreError::UnknownColumn {
                table: record.kind.table_name().to_string(),
                column: column.to_string(),
            })?;
            let value = &record.values[*column];
            query = bind_value(query, value, class);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn apply_local_edit(
        &self,
        kind: EntityKind,
        remote_id: &str,
        column: &str,
        value: SqlValue,
    ) -> Result<(), StoreError> {
        checked_ident(column)?;
        let classes = self.classes_for(kind, &[column]).await?;
        let class = classes
            .get(column)
            .copied()
            .ok_or_else(|| StoreError::UnknownColumn {
                table: kind.table_name().to_string(),
                column: column.to_string(),
            })?;
        let sql = format!(
            "UPDATE {table} SET {col} = $1, local_owned_fields = CASE WHEN $2 = ANY(local_owned_fields) THEN local_owned_fields ELSE array_append(local_owned_fields, $2) END, updated_at = NOW() WHERE remote_id = $3",
            table = quote_ident(kind.table_name()),
            col = quote_ident(column),
        );
        let query = bind_value(sqlx::query(&sql), &value, class)
            .bind(column)
            .bind(remote_id);
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind,
                remote_id: remote_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn save_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let summary = serde_json::to_value(run)?;
        sqlx::query(
            r#"
            INSERT INTO sync_runs (id, kind, started_at, completed_at, state, summary)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
               SET completed_at = EXCLUDED.completed_at,
                   state = EXCLUDED.state,
                   summary = EXCLUDED.summary
            "#,
        )
        .bind(run.id)
        .bind(run.kind.as_str())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.state.as_str())
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_run(&self, kind: EntityKind) -> Result<Option<SyncRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT summary
              FROM sync_runs
             WHERE kind = $1
             ORDER BY started_at DESC
             LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let summary: serde_json::Value = row.try_get("summary")?;
                Ok(Some(serde_json::from_value(summary)?))
            }
            None => Ok(None),
        }
    }
}
