//! Remote record sources: the practice-management HTTP client plus fixture-backed sources.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use casesync_core::{
    CustomFieldValue, DeclaredType, EntityKind, RawValue, ReferenceValue, RemoteEntity,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;

mod http;

pub use http::{
    classify_reqwest_error, classify_status, parse_retry_after, BackoffPolicy, Credentials,
    RemoteClientConfig, RemoteRecordClient, RetryDisposition,
};

pub const CRATE_NAME: &str = "casesync-remote";

/// Position in a remote collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// 1-based page number, used when the envelope reports a total count.
    Page(u32),
    /// Opaque next-page token or URL handed back by the server.
    Token(String),
}

impl Cursor {
    pub fn encode(&self) -> String {
        match self {
            Cursor::Page(n) => format!("page:{n}"),
            Cursor::Token(t) => format!("token:{t}"),
        }
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        if let Some(n) = encoded.strip_prefix("page:") {
            return n.parse().ok().map(Cursor::Page);
        }
        encoded
            .strip_prefix("token:")
            .filter(|t| !t.is_empty())
            .map(|t| Cursor::Token(t.to_string()))
    }

    fn page_number(cursor: Option<&Cursor>) -> u32 {
        match cursor {
            Some(Cursor::Page(n)) => *n,
            _ => 1,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub kind: EntityKind,
    pub cursor: Option<Cursor>,
    pub updated_since: Option<DateTime<Utc>>,
}

impl PageRequest {
    pub fn first(kind: EntityKind) -> Self {
        Self {
            kind,
            cursor: None,
            updated_since: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemotePage {
    pub records: Vec<RemoteEntity>,
    pub next_cursor: Option<Cursor>,
    pub total: Option<u64>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("still rate limited on {url} after {attempts} attempts")]
    RateLimited { url: String, attempts: usize },
    #[error("unauthorized for {url} after token refresh")]
    Unauthorized { url: String },
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),
    #[error("invalid response envelope: {0}")]
    Envelope(String),
    #[error("invalid client configuration: {0}")]
    Config(String),
    #[error("fixture error: {0}")]
    Fixture(String),
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetches one page. Implementations must be free of side effects so a page can be retried.
    async fn fetch_page(&self, request: &PageRequest) -> Result<RemotePage, FetchError>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Vec<WireEntity>,
    #[serde(default)]
    meta: Option<EnvelopeMeta>,
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeMeta {
    #[serde(default)]
    paging: Option<Paging>,
    #[serde(default)]
    records: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireEntity {
    id: JsonValue,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    display_number: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    client: Option<JsonValue>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    custom_field_values: Vec<WireCustomField>,
}

#[derive(Debug, Deserialize)]
struct WireCustomField {
    field_name: String,
    #[serde(default)]
    field_type: Option<String>,
    #[serde(default)]
    value: JsonValue,
}

/// Parses a collection envelope into typed entities and the cursor of the following page.
pub fn parse_envelope(
    kind: EntityKind,
    body: &[u8],
    current: Option<&Cursor>,
    page_size: u32,
) -> Result<RemotePage, FetchError> {
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| FetchError::Envelope(e.to_string()))?;
    let meta = envelope.meta.unwrap_or_default();

    let records = envelope
        .data
        .into_iter()
        .map(|wire| entity_from_wire(kind, wire))
        .collect::<Result<Vec<_>, _>>()?;

    let next_token = meta
        .paging
        .and_then(|p| p.next)
        .filter(|n| !n.trim().is_empty());
    let next_cursor = match (next_token, meta.records) {
        (Some(token), _) => Some(Cursor::Token(token)),
        (None, Some(total)) => {
            let page = Cursor::page_number(current);
            let consumed = u64::from(page) * u64::from(page_size.max(1));
            (consumed < total && !records.is_empty()).then(|| Cursor::Page(page + 1))
        }
        (None, None) => None,
    };

    Ok(RemotePage {
        records,
        next_cursor,
        total: meta.records,
    })
}

fn json_id(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn reference_from_object(map: &Map<String, JsonValue>) -> Option<ReferenceValue> {
    let id = map.get("id").and_then(json_id)?;
    let name = ["name", "display_name", "label", "option"]
        .iter()
        .find_map(|key| map.get(*key).and_then(JsonValue::as_str))
        .map(str::to_string);
    Some(ReferenceValue { id, name })
}

/// Tags a JSON payload with the variant its declared type implies. `null` means "no payload".
pub fn raw_value_from_json(declared_type: DeclaredType, value: &JsonValue) -> Option<RawValue> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) if declared_type == DeclaredType::Date => {
            Some(RawValue::Timestamp(s.clone()))
        }
        JsonValue::String(s) => Some(RawValue::Text(s.clone())),
        JsonValue::Number(n) => Some(RawValue::Number(n.clone())),
        JsonValue::Bool(b) => Some(RawValue::Boolean(*b)),
        JsonValue::Object(map) => reference_from_object(map)
            .map(RawValue::Reference)
            .or_else(|| {
                ["name", "option", "label"]
                    .iter()
                    .find_map(|key| map.get(*key).and_then(JsonValue::as_str))
                    .map(|s| RawValue::Text(s.to_string()))
            }),
        JsonValue::Array(items) => {
            let parts = items
                .iter()
                .filter_map(|item| match item {
                    JsonValue::String(s) => Some(s.clone()),
                    JsonValue::Object(map) => ["name", "option", "label"]
                        .iter()
                        .find_map(|key| map.get(*key).and_then(JsonValue::as_str))
                        .map(str::to_string),
                    JsonValue::Null => None,
                    other => Some(other.to_string()),
                })
                .collect::<Vec<_>>();
            (!parts.is_empty()).then(|| RawValue::Text(parts.join(", ")))
        }
    }
}

/// Lenient timestamp parse for top-level attributes; unparseable values are dropped.
pub fn parse_remote_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn entity_from_wire(kind: EntityKind, wire: WireEntity) -> Result<RemoteEntity, FetchError> {
    let remote_id = json_id(&wire.id)
        .ok_or_else(|| FetchError::Envelope(format!("{kind} record without an id: {}", wire.id)))?;
    let client = wire.client.as_ref().and_then(|c| match c {
        JsonValue::Object(map) => reference_from_object(map),
        other => json_id(other).map(|id| ReferenceValue { id, name: None }),
    });
    let custom_fields = wire
        .custom_field_values
        .into_iter()
        .map(|field| {
            let declared_type = field
                .field_type
                .as_deref()
                .map(DeclaredType::from_remote_type)
                .unwrap_or(DeclaredType::Text);
            let raw_value = raw_value_from_json(declared_type, &field.value);
            CustomFieldValue {
                label: field.field_name,
                declared_type,
                raw_value,
            }
        })
        .collect();

    Ok(RemoteEntity {
        remote_id,
        kind,
        name: wire.name.or(wire.display_number),
        status: wire.status,
        client,
        created_at: wire.created_at.as_deref().and_then(parse_remote_timestamp),
        updated_at: wire.updated_at.as_deref().and_then(parse_remote_timestamp),
        custom_fields,
    })
}

/// Serves envelope files laid out as `<root>/<kind>/page-<n>.json`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
    page_size: u32,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>, page_size: u32) -> Self {
        Self {
            root: root.into(),
            page_size,
        }
    }

    pub fn page_path(&self, kind: EntityKind, page: u32) -> PathBuf {
        self.root.join(kind.as_str()).join(format!("page-{page}.json"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl RecordSource for FixtureSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RemotePage, FetchError> {
        let page = match &request.cursor {
            None => 1,
            Some(Cursor::Page(n)) => *n,
            Some(Cursor::Token(t)) => {
                let path = self.root.join(request.kind.as_str()).join(t);
                return self.read_page(request, &path).await;
            }
        };
        let path = self.page_path(request.kind, page);
        if page == 1 && !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(RemotePage {
                records: Vec::new(),
                next_cursor: None,
                total: Some(0),
            });
        }
        self.read_page(request, &path).await
    }
}

impl FixtureSource {
    async fn read_page(&self, request: &PageRequest, path: &Path) -> Result<RemotePage, FetchError> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| FetchError::Fixture(format!("reading {}: {e}", path.display())))?;
        parse_envelope(request.kind, &body, request.cursor.as_ref(), self.page_size)
    }
}

/// In-memory pages per entity kind, with injectable failures. Records every request served.
#[derive(Debug, Default)]
pub struct StaticSource {
    pages: HashMap<EntityKind, Vec<Result<Vec<RemoteEntity>, String>>>,
    requests: Mutex<Vec<PageRequest>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, kind: EntityKind, records: Vec<RemoteEntity>) -> Self {
        self.pages.entry(kind).or_default().push(Ok(records));
        self
    }

    /// Appends a page whose fetch fails with an exhausted-retries HTTP error.
    pub fn with_failed_page(mut self, kind: EntityKind, message: impl Into<String>) -> Self {
        self.pages.entry(kind).or_default().push(Err(message.into()));
        self
    }

    pub async fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl RecordSource for StaticSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RemotePage, FetchError> {
        self.requests.lock().await.push(request.clone());
        let pages = self.pages.get(&request.kind).map(Vec::as_slice).unwrap_or(&[]);
        let page = Cursor::page_number(request.cursor.as_ref());
        let index = page.saturating_sub(1) as usize;
        let next_cursor = (index + 1 < pages.len()).then(|| Cursor::Page(page + 1));
        match pages.get(index) {
            None => Ok(RemotePage {
                records: Vec::new(),
                next_cursor: None,
                total: None,
            }),
            Some(Ok(records)) => Ok(RemotePage {
                records: records.clone(),
                next_cursor,
                total: None,
            }),
            Some(Err(message)) => Err(FetchError::HttpStatus {
                status: 503,
                url: format!("static://{}/page-{page}: {message}", request.kind),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matter_envelope(meta: JsonValue) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "data": [{
                "id": 1031,
                "display_number": "00042-Smith",
                "status": "Open",
                "client": {"id": 77, "name": "Smith Family Trust"},
                "created_at": "2024-03-01T09:30:00-05:00",
                "custom_field_values": [
                    {"field_name": "Rel Value", "field_type": "currency", "value": 212000},
                    {"field_name": "Closing Date", "field_type": "date", "value": "2024-04-15"},
                    {"field_name": "QI", "field_type": "contact", "value": {"id": 9, "name": "Acme QI"}},
                    {"field_name": "Reverse Exchange", "field_type": "checkbox", "value": null},
                    {"field_name": "Notes", "field_type": "text_area"}
                ]
            }],
            "meta": meta
        }))
        .unwrap()
    }

    #[test]
    fn envelope_maps_custom_fields_onto_tagged_values() {
        let page = parse_envelope(EntityKind::Matters, &matter_envelope(json!({})), None, 50).unwrap();
        let matter = &page.records[0];
        assert_eq!(matter.remote_id, "1031");
        assert_eq!(matter.name.as_deref(), Some("00042-Smith"));
        assert_eq!(matter.client.as_ref().map(|c| c.id.as_str()), Some("77"));
        assert_eq!(
            matter.created_at.map(|t| t.to_rfc3339()),
            Some("2024-03-01T14:30:00+00:00".to_string())
        );

        let rel = matter.field("Rel Value").unwrap();
        assert_eq!(rel.declared_type, DeclaredType::Currency);
        assert!(matches!(rel.raw_value, Some(RawValue::Number(_))));
        assert!(matches!(
            matter.field("Closing Date").unwrap().raw_value,
            Some(RawValue::Timestamp(_))
        ));
        assert_eq!(
            matter.field("QI").unwrap().raw_value,
            Some(RawValue::Reference(ReferenceValue {
                id: "9".into(),
                name: Some("Acme QI".into())
            }))
        );
        assert_eq!(matter.field("Reverse Exchange").unwrap().raw_value, None);
        assert_eq!(matter.field("Notes").unwrap().raw_value, None);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn next_cursor_prefers_server_token_then_total_count() {
        let with_token = matter_envelope(json!({"paging": {"next": "https://api.example/matters.json?page_token=abc"}}));
        let page = parse_envelope(EntityKind::Matters, &with_token, None, 1).unwrap();
        assert_eq!(
            page.next_cursor,
            Some(Cursor::Token("https://api.example/matters.json?page_token=abc".into()))
        );

        let with_total = matter_envelope(json!({"records": 3}));
        let page = parse_envelope(EntityKind::Matters, &with_total, Some(&Cursor::Page(2)), 1).unwrap();
        assert_eq!(page.next_cursor, Some(Cursor::Page(3)));
        let last = parse_envelope(EntityKind::Matters, &with_total, Some(&Cursor::Page(3)), 1).unwrap();
        assert_eq!(last.next_cursor, None);
    }

    #[test]
    fn envelope_without_ids_is_rejected() {
        let body = br#"{"data": [{"name": "no id"}]}"#;
        assert!(matches!(
            parse_envelope(EntityKind::Contacts, body, None, 10),
            Err(FetchError::Envelope(_))
        ));
    }

    #[test]
    fn cursor_round_trips_through_text() {
        for cursor in [Cursor::Page(4), Cursor::Token("opaque==".into())] {
            assert_eq!(Cursor::decode(&cursor.encode()), Some(cursor));
        }
        assert_eq!(Cursor::decode("token:"), None);
        assert_eq!(Cursor::decode("bogus"), None);
    }

    #[test]
    fn multi_select_arrays_render_as_text() {
        let value = json!([{"option": "Forward"}, {"option": "Improvement"}]);
        assert_eq!(
            raw_value_from_json(DeclaredType::Text, &value),
            Some(RawValue::Text("Forward, Improvement".into()))
        );
        assert_eq!(raw_value_from_json(DeclaredType::Text, &json!([])), None);
    }

    #[tokio::test]
    async fn fixture_source_walks_numbered_pages() {
        let dir = tempfile::tempdir().unwrap();
        let source = FixtureSource::new(dir.path(), 1);
        std::fs::create_dir_all(dir.path().join("matters")).unwrap();
        std::fs::write(source.page_path(EntityKind::Matters, 1), matter_envelope(json!({"records": 2}))).unwrap();
        std::fs::write(source.page_path(EntityKind::Matters, 2), matter_envelope(json!({"records": 2}))).unwrap();

        let first = source.fetch_page(&PageRequest::first(EntityKind::Matters)).await.unwrap();
        assert_eq!(first.next_cursor, Some(Cursor::Page(2)));
        let second = source
            .fetch_page(&PageRequest {
                kind: EntityKind::Matters,
                cursor: first.next_cursor,
                updated_since: None,
            })
            .await
            .unwrap();
        assert_eq!(second.next_cursor, None);

        let empty = source.fetch_page(&PageRequest::first(EntityKind::Tasks)).await.unwrap();
        assert!(empty.records.is_empty());
    }

    #[tokio::test]
    async fn static_source_serves_pages_and_failures_in_order() {
        let source = StaticSource::new()
            .with_page(EntityKind::Tasks, vec![RemoteEntity::new(EntityKind::Tasks, "t-1")])
            .with_failed_page(EntityKind::Tasks, "upstream down");

        let first = source.fetch_page(&PageRequest::first(EntityKind::Tasks)).await.unwrap();
        assert_eq!(first.records.len(), 1);
        let second = source
            .fetch_page(&PageRequest {
                kind: EntityKind::Tasks,
                cursor: first.next_cursor,
                updated_since: None,
            })
            .await;
        assert!(matches!(second, Err(FetchError::HttpStatus { status: 503, .. })));
        assert_eq!(source.requests().await.len(), 2);
    }
}
