//! Core domain model for casesync: remote entities, custom fields, catalog entries and sync runs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "casesync-core";

/// Postgres truncates identifiers beyond this many bytes.
pub const IDENTIFIER_LIMIT: usize = 63;

/// Longest base column derived from a label. Leaves room for `_ref_name` plus a `_NNN` suffix.
pub const MAX_BASE_COLUMN_LEN: usize = 50;

/// Most recent errors retained on a [`SyncRun`].
pub const MAX_RECORDED_ERRORS: usize = 50;

/// Columns every entity table carries regardless of the catalog.
pub const WELL_KNOWN_COLUMNS: &[&str] = &[
    "id",
    "remote_id",
    "name",
    "status",
    "client_ref_id",
    "client_ref_name",
    "remote_created_at",
    "remote_updated_at",
    "local_owned_fields",
    "last_synced_at",
    "created_at",
    "updated_at",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("unknown entity kind: {0}")]
    UnknownKind(String),
    #[error("unknown declared type: {0}")]
    UnknownDeclaredType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Matters,
    Contacts,
    Tasks,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Matters, EntityKind::Contacts, EntityKind::Tasks];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Matters => "matters",
            EntityKind::Contacts => "contacts",
            EntityKind::Tasks => "tasks",
        }
    }

    pub fn table_name(&self) -> &'static str {
        self.as_str()
    }

    /// Collection path relative to the remote API base URL.
    pub fn remote_path(&self) -> &'static str {
        match self {
            EntityKind::Matters => "matters.json",
            EntityKind::Contacts => "contacts.json",
            EntityKind::Tasks => "tasks.json",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "matter" | "matters" => Ok(EntityKind::Matters),
            "contact" | "contacts" => Ok(EntityKind::Contacts),
            "task" | "tasks" => Ok(EntityKind::Tasks),
            other => Err(ModelError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclaredType {
    Text,
    Currency,
    Date,
    Boolean,
    Reference,
}

impl DeclaredType {
    /// Maps the remote system's field-type vocabulary; anything unrecognised is text.
    pub fn from_remote_type(field_type: &str) -> Self {
        match field_type.trim().to_ascii_lowercase().as_str() {
            "currency" | "money" => DeclaredType::Currency,
            "date" | "time" | "datetime" => DeclaredType::Date,
            "checkbox" | "boolean" => DeclaredType::Boolean,
            "contact" | "matter" | "reference" => DeclaredType::Reference,
            _ => DeclaredType::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeclaredType::Text => "text",
            DeclaredType::Currency => "currency",
            DeclaredType::Date => "date",
            DeclaredType::Boolean => "boolean",
            DeclaredType::Reference => "reference",
        }
    }

    /// SQL type of each physical column backing a field of this type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            DeclaredType::Text | DeclaredType::Reference => "TEXT",
            DeclaredType::Currency => "NUMERIC(18,2)",
            DeclaredType::Date => "TIMESTAMPTZ",
            DeclaredType::Boolean => "BOOLEAN",
        }
    }
}

impl fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeclaredType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(DeclaredType::Text),
            "currency" => Ok(DeclaredType::Currency),
            "date" => Ok(DeclaredType::Date),
            "boolean" => Ok(DeclaredType::Boolean),
            "reference" => Ok(DeclaredType::Reference),
            other => Err(ModelError::UnknownDeclaredType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceValue {
    pub id: String,
    pub name: Option<String>,
}

/// Payload of a custom field as delivered by the remote system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RawValue {
    Text(String),
    Number(serde_json::Number),
    Boolean(bool),
    Timestamp(String),
    Reference(ReferenceValue),
}

impl RawValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, RawValue::Text(s) | RawValue::Timestamp(s) if s.trim().is_empty())
    }
}

/// One labelled custom field on a remote entity.
///
/// `raw_value: None` means the field was sent without a payload. A field missing from
/// [`RemoteEntity::custom_fields`] altogether is "absent", which is a different thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    pub label: String,
    pub declared_type: DeclaredType,
    pub raw_value: Option<RawValue>,
}

impl CustomFieldValue {
    pub fn new(label: impl Into<String>, declared_type: DeclaredType, raw_value: RawValue) -> Self {
        Self {
            label: label.into(),
            declared_type,
            raw_value: Some(raw_value),
        }
    }

    pub fn empty(label: impl Into<String>, declared_type: DeclaredType) -> Self {
        Self {
            label: label.into(),
            declared_type,
            raw_value: None,
        }
    }

    pub fn has_payload(&self) -> bool {
        self.raw_value.as_ref().is_some_and(|v| !v.is_empty())
    }
}

/// Record fetched from the practice-management system. Never mutated after fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub remote_id: String,
    pub kind: EntityKind,
    pub name: Option<String>,
    pub status: Option<String>,
    pub client: Option<ReferenceValue>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub custom_fields: Vec<CustomFieldValue>,
}

impl RemoteEntity {
    pub fn new(kind: EntityKind, remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            kind,
            name: None,
            status: None,
            client: None,
            created_at: None,
            updated_at: None,
            custom_fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: CustomFieldValue) -> Self {
        self.custom_fields.push(field);
        self
    }

    pub fn field(&self, label: &str) -> Option<&CustomFieldValue> {
        self.custom_fields.iter().find(|f| f.label == label)
    }
}

fn is_reserved_column(name: &str) -> bool {
    WELL_KNOWN_COLUMNS.contains(&name)
}

/// Deterministic column name for a custom-field label.
///
/// Lower-cases, collapses non-alphanumeric runs to `_`, and keeps the result clear of
/// well-known columns. Over-long names are truncated and tagged with a label hash so two
/// labels sharing a long prefix still map apart.
pub fn derive_column_name(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_separator = false;
    for c in label.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(c);
        } else {
            pending_separator = true;
        }
    }

    if out.is_empty() {
        out.push_str("field");
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "f_");
    }
    if is_reserved_column(&out)
        || is_reserved_column(&ref_id_column(&out))
        || is_reserved_column(&ref_name_column(&out))
    {
        out.push_str("_cf");
    }

    if out.len() > MAX_BASE_COLUMN_LEN {
        let digest = hex::encode(Sha256::digest(label.as_bytes()));
        out.truncate(MAX_BASE_COLUMN_LEN - 9);
        let kept = out.trim_end_matches('_').len();
        out.truncate(kept);
        out.push('_');
        out.push_str(&digest[..8]);
    }
    out
}

pub fn with_numeric_suffix(base: &str, n: u32) -> String {
    format!("{base}_{n}")
}

/// True when `column` is the derived name for `label`, or that name with a `_N` (N >= 2) suffix.
pub fn column_matches_label(column: &str, label: &str) -> bool {
    let derived = derive_column_name(label);
    if column == derived {
        return true;
    }
    column
        .strip_prefix(derived.as_str())
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|n| n.parse::<u32>().ok())
        .is_some_and(|n| n >= 2)
}

pub fn ref_id_column(base: &str) -> String {
    format!("{base}_ref_id")
}

pub fn ref_name_column(base: &str) -> String {
    format!("{base}_ref_name")
}

/// Physical table columns backing a catalog column of the given type.
pub fn physical_columns(base: &str, declared_type: DeclaredType) -> Vec<String> {
    match declared_type {
        DeclaredType::Reference => vec![ref_id_column(base), ref_name_column(base)],
        _ => vec![base.to_string()],
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldCatalogEntry {
    pub label: String,
    pub declared_type: DeclaredType,
    pub local_column: String,
    pub usage_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl FieldCatalogEntry {
    pub fn sql_type(&self) -> &'static str {
        self.declared_type.sql_type()
    }

    pub fn physical_columns(&self) -> Vec<String> {
        physical_columns(&self.local_column, self.declared_type)
    }
}

/// Typed value of one local column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Text(String),
    Decimal(BigDecimal),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn text(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(s) if !s.is_empty() => SqlValue::Text(s.to_string()),
            _ => SqlValue::Null,
        }
    }

    pub fn timestamp(value: Option<DateTime<Utc>>) -> Self {
        value
            .map(|ts| SqlValue::Timestamp(truncate_to_micros(ts)))
            .unwrap_or(SqlValue::Null)
    }
}

/// Postgres keeps microseconds; values are truncated so reloaded rows compare equal.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let micros = ts.nanosecond() / 1_000 * 1_000;
    ts.with_nanosecond(micros).unwrap_or(ts)
}

/// Coerced remote values for one entity, keyed by physical column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub kind: EntityKind,
    pub remote_id: String,
    pub values: BTreeMap<String, SqlValue>,
}

/// Canonical relational row for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: Uuid,
    pub kind: EntityKind,
    pub remote_id: Option<String>,
    pub values: BTreeMap<String, SqlValue>,
    /// Columns last written by a person through the CRUD layer; sync never overwrites them.
    pub local_owned: BTreeSet<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl LocalRecord {
    pub fn from_remote(row: &RemoteRow, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: row.kind,
            remote_id: Some(row.remote_id.clone()),
            values: row.values.clone(),
            local_owned: BTreeSet::new(),
            last_synced_at: Some(truncate_to_micros(now)),
        }
    }

    pub fn value(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column)
    }

    pub fn is_local_owned(&self, column: &str) -> bool {
        self.local_owned.contains(column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Fetching,
    Coercing,
    Evolving,
    Merging,
    Failed,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Fetching => "fetching",
            SyncState::Coercing => "coercing",
            SyncState::Evolving => "evolving",
            SyncState::Merging => "merging",
            SyncState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Fetch,
    Coercion,
    MigrationStatement,
    Merge,
    Catalog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub class: ErrorClass,
    pub remote_id: Option<String>,
    pub field_label: Option<String>,
    pub column: Option<String>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl RecordError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            remote_id: None,
            field_label: None,
            column: None,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn for_record(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    pub fn for_field(mut self, label: impl Into<String>) -> Self {
        self.field_label = Some(label.into());
        self
    }

    pub fn for_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = match self.class {
            ErrorClass::Fetch => "fetch",
            ErrorClass::Coercion => "coercion",
            ErrorClass::MigrationStatement => "migration",
            ErrorClass::Merge => "merge",
            ErrorClass::Catalog => "catalog",
        };
        write!(f, "[{class}]")?;
        if let Some(remote_id) = &self.remote_id {
            write!(f, " record={remote_id}")?;
        }
        if let Some(label) = &self.field_label {
            write!(f, " field={label:?}")?;
        }
        if let Some(column) = &self.column {
            write!(f, " column={column}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Audit summary of one orchestrator pass over a single entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub kind: EntityKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub state: SyncState,
    pub cancelled: bool,
    pub pages_processed: u32,
    pub records_seen: u64,
    pub records_upserted: u64,
    pub records_unchanged: u64,
    pub new_fields_discovered: u32,
    pub columns_materialized: u32,
    pub type_conflicts: u64,
    pub errors: VecDeque<RecordError>,
    pub errors_total: u64,
    pub updated_since: Option<DateTime<Utc>>,
    /// Start of the earliest run this one continues; `None` when it began a fresh pass.
    #[serde(default)]
    pub watermark: Option<DateTime<Utc>>,
    /// Cursor of the first page not processed; `None` once the collection was exhausted.
    pub resume_cursor: Option<String>,
    pub fatal_error: Option<String>,
}

impl SyncRun {
    pub fn start(kind: EntityKind, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            started_at: now,
            completed_at: None,
            state: SyncState::Fetching,
            cancelled: false,
            pages_processed: 0,
            records_seen: 0,
            records_upserted: 0,
            records_unchanged: 0,
            new_fields_discovered: 0,
            columns_materialized: 0,
            type_conflicts: 0,
            errors: VecDeque::new(),
            errors_total: 0,
            updated_since: None,
            watermark: None,
            resume_cursor: None,
            fatal_error: None,
        }
    }

    /// Appends an error, evicting the oldest once [`MAX_RECORDED_ERRORS`] are held.
    pub fn record_error(&mut self, error: RecordError) {
        self.errors_total += 1;
        if self.errors.len() >= MAX_RECORDED_ERRORS {
            self.errors.pop_front();
        }
        self.errors.push_back(error);
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.state = SyncState::Idle;
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.state = SyncState::Failed;
        self.fatal_error = Some(message.into());
        self.completed_at = Some(now);
    }

    pub fn is_failed(&self) -> bool {
        self.state == SyncState::Failed
    }

    /// A run that finished and drained every page; the next run can sync incrementally.
    pub fn exhausted(&self) -> bool {
        self.state == SyncState::Idle
            && self.completed_at.is_some()
            && !self.cancelled
            && self.resume_cursor.is_none()
    }

    /// Earliest instant the pass this run belongs to could have missed updates from.
    pub fn chain_start(&self) -> DateTime<Utc> {
        self.watermark.unwrap_or(self.started_at)
    }

    pub fn errors_for_field<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a RecordError> {
        self.errors
            .iter()
            .filter(move |e| e.field_label.as_deref() == Some(label))
    }
}
