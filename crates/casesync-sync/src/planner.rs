//! Additive schema evolution: materializes catalog entries as nullable columns.

use std::collections::BTreeSet;

use casesync_core::{ref_id_column, DeclaredType, EntityKind, FieldCatalogEntry, IDENTIFIER_LIMIT};
use casesync_storage::{is_safe_identifier, DdlStatement, RecordStore};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStatement {
    pub label: String,
    pub statement: DdlStatement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub kind: EntityKind,
    pub statements: Vec<PlannedStatement>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn ddl(&self) -> Vec<DdlStatement> {
        self.statements.iter().map(|p| p.statement.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SchemaPlanner {
    threshold: i64,
}

impl Default for SchemaPlanner {
    fn default() -> Self {
        Self { threshold: 1 }
    }
}

impl SchemaPlanner {
    pub fn new(threshold: i64) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// Statements adding every column of qualifying entries that is not yet live.
    ///
    /// Only `ADD COLUMN IF NOT EXISTS ... NULL` and `CREATE INDEX IF NOT EXISTS` are ever
    /// produced. Planning against a schema that already has every column yields an empty plan.
    pub fn plan<'a>(
        &self,
        kind: EntityKind,
        entries: impl IntoIterator<Item = &'a FieldCatalogEntry>,
        live_columns: &BTreeSet<String>,
    ) -> MigrationPlan {
        let table = kind.table_name();
        let mut entries = entries
            .into_iter()
            .filter(|e| e.usage_count >= self.threshold)
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.local_column.cmp(&b.local_column));

        let mut statements = Vec::new();
        let mut planned = BTreeSet::new();
        for entry in entries {
            for column in entry.physical_columns() {
                if live_columns.contains(&column) || !planned.insert(column.clone()) {
                    continue;
                }
                if !is_safe_identifier(&column) {
                    warn!(label = %entry.label, column, "skipping unsafe column identifier");
                    continue;
                }
                statements.push(PlannedStatement {
                    label: entry.label.clone(),
                    statement: DdlStatement::AddColumn {
                        table: table.to_string(),
                        column: column.clone(),
                        sql_type: entry.sql_type().to_string(),
                    },
                });
                if entry.declared_type == DeclaredType::Reference
                    && column == ref_id_column(&entry.local_column)
                {
                    statements.push(PlannedStatement {
                        label: entry.label.clone(),
                        statement: DdlStatement::CreateIndex {
                            table: table.to_string(),
                            index: index_name(table, &column),
                            column,
                        },
                    });
                }
            }
        }

        MigrationPlan { kind, statements }
    }
}

/// `idx_<table>_<column>`, shortened with a hash when it would exceed the identifier limit.
pub fn index_name(table: &str, column: &str) -> String {
    let name = format!("idx_{table}_{column}");
    if name.len() <= IDENTIFIER_LIMIT {
        return name;
    }
    let digest = hex::encode(Sha256::digest(format!("{table}.{column}").as_bytes()));
    let mut short = name;
    short.truncate(IDENTIFIER_LIMIT - 9);
    format!("{}_{}", short.trim_end_matches('_'), &digest[..8])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStatement {
    pub label: String,
    pub statement: DdlStatement,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub applied: Vec<PlannedStatement>,
    pub failed: Vec<FailedStatement>,
    pub transactional: bool,
}

impl MigrationOutcome {
    pub fn columns_added(&self) -> usize {
        self.applied
            .iter()
            .filter(|p| matches!(p.statement, DdlStatement::AddColumn { .. }))
            .count()
    }
}

/// Runs `plan` in one transaction when the store allows it, else statement by statement.
/// Individual failures are reported, never raised.
pub async fn execute_plan<S>(store: &S, plan: &MigrationPlan) -> MigrationOutcome
where
    S: RecordStore + ?Sized,
{
    if plan.is_empty() {
        return MigrationOutcome::default();
    }

    if store.supports_transactional_ddl() {
        match store.execute_ddl_batch(&plan.ddl()).await {
            Ok(()) => {
                info!(kind = %plan.kind, statements = plan.statements.len(), "schema evolved in one transaction");
                return MigrationOutcome {
                    applied: plan.statements.clone(),
                    failed: Vec::new(),
                    transactional: true,
                };
            }
            Err(err) => {
                warn!(kind = %plan.kind, error = %err, "transactional migration failed; applying statements individually");
            }
        }
    }

    let mut outcome = MigrationOutcome::default();
    for planned in &plan.statements {
        match store.execute_ddl(&planned.statement).await {
            Ok(()) => outcome.applied.push(planned.clone()),
            Err(err) => {
                warn!(
                    kind = %plan.kind,
                    label = %planned.label,
                    statement = %planned.statement,
                    error = %err,
                    "migration statement failed"
                );
                outcome.failed.push(FailedStatement {
                    label: planned.label.clone(),
                    statement: planned.statement.clone(),
                    message: err.to_string(),
                });
            }
        }
    }
    info!(
        kind = %plan.kind,
        applied = outcome.applied.len(),
        failed = outcome.failed.len(),
        "schema evolved statement by statement"
    );
    outcome
}
