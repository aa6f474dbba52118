use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{parse_envelope, Cursor, FetchError, PageRequest, RecordSource, RemotePage};

/// Custom-field and attribute selection requested on every collection call.
const FIELDS: &str = "id,name,display_number,status,client{id,name},created_at,updated_at,\
custom_field_values{id,field_name,field_type,value}";

/// Tokens expiring within this window are refreshed before the next request.
const REFRESH_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on how long a server-supplied `Retry-After` is honored.
    pub max_retry_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_retry_after: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn delay_for(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_retry_after),
            None => self.delay_for_attempt(attempt_index),
        }
    }
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            ..Self::default()
        }
    }

    pub fn expires_soon(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|at| at <= now + chrono::Duration::seconds(REFRESH_SKEW_SECS))
            .unwrap_or(false)
    }

    fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RemoteClientConfig {
    pub base_url: String,
    pub token_url: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub page_size: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api/v4".to_string(),
            token_url: None,
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("casesync/{}", env!("CARGO_PKG_VERSION"))),
            page_size: 200,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Sequential, authenticated client for the practice-management collection endpoints.
#[derive(Debug)]
pub struct RemoteRecordClient {
    client: reqwest::Client,
    config: RemoteClientConfig,
    credentials: Mutex<Credentials>,
}

impl RemoteRecordClient {
    pub fn new(config: RemoteClientConfig, credentials: Credentials) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Url::parse(&config.base_url)
            .with_context(|| format!("parsing remote base url {}", config.base_url))?;

        Ok(Self {
            client,
            config,
            credentials: Mutex::new(credentials),
        })
    }

    pub fn config(&self) -> &RemoteClientConfig {
        &self.config
    }

    /// Absolute `next` links are followed only on the configured origin; anything else is
    /// sent back as an opaque `page_token` so the bearer token never leaves that host.
    pub fn page_url(&self, request: &PageRequest) -> Result<Url, FetchError> {
        let base = self.config.base_url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}/{}", request.kind.remote_path()))
            .map_err(|e| FetchError::Config(e.to_string()))?;

        if let Some(Cursor::Token(token)) = &request.cursor {
            let absolute = token.starts_with("http://") || token.starts_with("https://");
            if let Some(next) = Url::parse(token).ok().filter(|_| absolute) {
                if next.origin() == url.origin() {
                    return Ok(next);
                }
                warn!(next = %token, "next link points at another origin; sending it as page_token");
            }
        }

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("fields", FIELDS);
            query.append_pair("limit", &self.config.page_size.to_string());
            query.append_pair("order", "id(asc)");
            if let Some(since) = request.updated_since {
                query.append_pair("updated_since", &since.to_rfc3339());
            }
            match &request.cursor {
                Some(Cursor::Page(n)) => {
                    query.append_pair("page", &n.to_string());
                }
                Some(Cursor::Token(token)) => {
                    query.append_pair("page_token", token);
                }
                None => {}
            }
        }
        Ok(url)
    }

    async fn access_token(&self) -> Result<String, FetchError> {
        let mut credentials = self.credentials.lock().await;
        if credentials.expires_soon(Utc::now()) && credentials.can_refresh() {
            info!("access token near expiry; refreshing ahead of request");
            self.refresh_locked(&mut credentials).await?;
        }
        Ok(credentials.access_token.clone())
    }

    /// Exchanges the refresh token. Returns `false` when no refresh is possible.
    async fn refresh(&self) -> Result<bool, FetchError> {
        let mut credentials = self.credentials.lock().await;
        if !credentials.can_refresh() || self.config.token_url.is_none() {
            return Ok(false);
        }
        self.refresh_locked(&mut credentials).await?;
        Ok(true)
    }

    async fn refresh_locked(&self, credentials: &mut Credentials) -> Result<(), FetchError> {
        let token_url = self
            .config
            .token_url
            .as_deref()
            .ok_or_else(|| FetchError::TokenRefresh("no token url configured".to_string()))?;
        let refresh_token = credentials
            .refresh_token
            .clone()
            .ok_or_else(|| FetchError::TokenRefresh("no refresh token configured".to_string()))?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
        ];
        if let Some(id) = &credentials.client_id {
            form.push(("client_id", id.clone()));
        }
        if let Some(secret) = &credentials.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let resp = self
            .client
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| FetchError::TokenRefresh(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::TokenRefresh(format!(
                "token endpoint answered {}",
                status.as_u16()
            )));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::TokenRefresh(e.to_string()))?;

        credentials.access_token = token.access_token;
        if let Some(rotated) = token.refresh_token {
            credentials.refresh_token = Some(rotated);
        }
        credentials.expires_at = token
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        debug!(expires_at = ?credentials.expires_at, "access token refreshed");
        Ok(())
    }

    async fn get_with_retries(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        let backoff = self.config.backoff;
        let mut attempt = 0usize;
        let mut refreshed = false;

        loop {
            let token = self.access_token().await?;
            let resp_result = self
                .client
                .get(url.clone())
                .bearer_auth(&token)
                .header(ACCEPT, "application/json")
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if status == StatusCode::UNAUTHORIZED {
                        if refreshed || !self.refresh().await? {
                            return Err(FetchError::Unauthorized {
                                url: url.to_string(),
                            });
                        }
                        warn!("access token rejected; retrying once with refreshed token");
                        refreshed = true;
                        continue;
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        let hint = parse_retry_after(resp.headers(), Utc::now());
                        let delay = backoff.delay_for(attempt, hint);
                        warn!(
                            status = status.as_u16(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retryable response; backing off"
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(FetchError::RateLimited {
                            url: url.to_string(),
                            attempts: attempt + 1,
                        });
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(attempt, error = %err, "request failed; backing off");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl RecordSource for RemoteRecordClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RemotePage, FetchError> {
        let url = self.page_url(request)?;
        let span = info_span!(
            "remote_fetch",
            kind = %request.kind,
            cursor = ?request.cursor,
        );
        async move {
            let body = self.get_with_retries(url).await?;
            let page = parse_envelope(
                request.kind,
                &body,
                request.cursor.as_ref(),
                self.config.page_size,
            )?;
            debug!(records = page.records.len(), has_next = page.next_cursor.is_some(), "page fetched");
            Ok(page)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use axum::extract::State;
    use axum::http::{header, HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use casesync_core::EntityKind;
    use serde_json::json;

    use super::*;

    #[derive(Clone, Default)]
    struct Hits {
        collection: Arc<AtomicUsize>,
        token: Arc<AtomicUsize>,
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn two_matters() -> serde_json::Value {
        json!({
            "data": [
                {"id": 1, "display_number": "00001-A", "custom_field_values": []},
                {"id": 2, "display_number": "00002-B", "custom_field_values": []}
            ],
            "meta": {"records": 2}
        })
    }

    fn client_for(base_url: &str, backoff: BackoffPolicy, credentials: Credentials) -> RemoteRecordClient {
        RemoteRecordClient::new(
            RemoteClientConfig {
                base_url: base_url.to_string(),
                token_url: Some(format!("{base_url}/oauth/token")),
                timeout: Duration::from_secs(10),
                user_agent: None,
                page_size: 50,
                backoff,
            },
            credentials,
        )
        .unwrap()
    }

    fn quick_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            max_retry_after: Duration::from_secs(5),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_retry_after: Duration::from_secs(3),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.delay_for(0, Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(policy.delay_for(0, Some(Duration::from_secs(600))), Duration::from_secs(3));
    }

    #[test]
    fn retry_after_accepts_seconds_and_http_dates() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "2".parse().unwrap());
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(2)));

        headers.insert(RETRY_AFTER, "Wed, 01 May 2024 12:00:30 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(30)));

        headers.insert(RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after(&headers, now), None);
    }

    #[test]
    fn credentials_refresh_inside_skew_window() {
        let now = Utc::now();
        let mut credentials = Credentials::bearer("t");
        assert!(!credentials.expires_soon(now));
        credentials.expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(credentials.expires_soon(now));
        credentials.expires_at = Some(now + chrono::Duration::seconds(600));
        assert!(!credentials.expires_soon(now));
        assert!(!format!("{credentials:?}").contains("\"t\""));
    }

    #[test]
    fn page_url_carries_paging_and_incremental_filter() {
        let client = client_for("http://api.test/api/v4/", quick_backoff(), Credentials::bearer("t"));
        let since = DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let url = client
            .page_url(&PageRequest {
                kind: EntityKind::Matters,
                cursor: Some(Cursor::Page(3)),
                updated_since: Some(since),
            })
            .unwrap();
        assert_eq!(url.path(), "/api/v4/matters.json");
        let pairs = url.query_pairs().into_owned().collect::<Vec<_>>();
        assert!(pairs.contains(&("page".into(), "3".into())));
        assert!(pairs.contains(&("limit".into(), "50".into())));
        assert!(pairs.contains(&("updated_since".into(), "2024-05-01T00:00:00+00:00".into())));

        let next = client
            .page_url(&PageRequest {
                kind: EntityKind::Matters,
                cursor: Some(Cursor::Token("http://api.test/api/v4/matters.json?page_token=z".into())),
                updated_since: None,
            })
            .unwrap();
        assert_eq!(next.as_str(), "http://api.test/api/v4/matters.json?page_token=z");
    }

    #[test]
    fn next_link_on_another_origin_is_not_followed() {
        let client = client_for("http://api.test/api/v4/", quick_backoff(), Credentials::bearer("t"));
        let foreign = "https://other.test/matters.json?page_token=z";
        let url = client
            .page_url(&PageRequest {
                kind: EntityKind::Matters,
                cursor: Some(Cursor::Token(foreign.into())),
                updated_since: None,
            })
            .unwrap();
        assert_eq!(url.host_str(), Some("api.test"));
        assert_eq!(url.path(), "/api/v4/matters.json");
        let pairs = url.query_pairs().into_owned().collect::<Vec<_>>();
        assert!(pairs.contains(&("page_token".into(), foreign.into())));

        let other_port = client
            .page_url(&PageRequest {
                kind: EntityKind::Matters,
                cursor: Some(Cursor::Token("http://api.test:8443/api/v4/matters.json".into())),
                updated_since: None,
            })
            .unwrap();
        assert_eq!(other_port.port(), None);
    }

    async fn rate_limited_once(State(hits): State<Hits>) -> Response {
        if hits.collection.fetch_add(1, Ordering::SeqCst) == 0 {
            return (AxumStatus::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "2")], "slow down").into_response();
        }
        Json(two_matters()).into_response()
    }

    #[tokio::test]
    async fn rate_limit_honors_retry_after_and_retries_the_same_page_once() {
        let hits = Hits::default();
        let router = Router::new()
            .route("/matters.json", get(rate_limited_once))
            .with_state(hits.clone());
        let base = serve(router).await;
        let client = client_for(&base, quick_backoff(), Credentials::bearer("t"));

        let started = Instant::now();
        let page = client.fetch_page(&PageRequest::first(EntityKind::Matters)).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(hits.collection.load(Ordering::SeqCst), 2);
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].remote_id, "1");
        assert_eq!(page.records[1].remote_id, "2");
    }

    async fn always_unavailable(State(hits): State<Hits>) -> Response {
        hits.collection.fetch_add(1, Ordering::SeqCst);
        AxumStatus::SERVICE_UNAVAILABLE.into_response()
    }

    #[tokio::test]
    async fn server_errors_exhaust_the_retry_budget() {
        let hits = Hits::default();
        let router = Router::new()
            .route("/contacts.json", get(always_unavailable))
            .with_state(hits.clone());
        let base = serve(router).await;
        let client = client_for(&base, quick_backoff(), Credentials::bearer("t"));

        let err = client
            .fetch_page(&PageRequest::first(EntityKind::Contacts))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.collection.load(Ordering::SeqCst), 3);
    }

    async fn needs_fresh_token(State(hits): State<Hits>, headers: AxumHeaders) -> Response {
        hits.collection.fetch_add(1, Ordering::SeqCst);
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            == Some("Bearer fresh");
        if authorized {
            Json(two_matters()).into_response()
        } else {
            AxumStatus::UNAUTHORIZED.into_response()
        }
    }

    async fn issue_token(State(hits): State<Hits>) -> Json<serde_json::Value> {
        hits.token.fetch_add(1, Ordering::SeqCst);
        Json(json!({"access_token": "fresh", "refresh_token": "rotated", "expires_in": 3600}))
    }

    async fn reject_everything(State(hits): State<Hits>) -> Response {
        hits.collection.fetch_add(1, Ordering::SeqCst);
        AxumStatus::UNAUTHORIZED.into_response()
    }

    #[tokio::test]
    async fn unauthorized_triggers_a_single_refresh() {
        let hits = Hits::default();
        let router = Router::new()
            .route("/matters.json", get(needs_fresh_token))
            .route("/oauth/token", post(issue_token))
            .with_state(hits.clone());
        let base = serve(router).await;
        let credentials = Credentials {
            access_token: "stale".into(),
            refresh_token: Some("r1".into()),
            ..Credentials::default()
        };
        let client = client_for(&base, quick_backoff(), credentials);

        let page = client.fetch_page(&PageRequest::first(EntityKind::Matters)).await.unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(hits.token.load(Ordering::SeqCst), 1);
        assert_eq!(hits.collection.load(Ordering::SeqCst), 2);
        assert_eq!(
            client.credentials.lock().await.refresh_token.as_deref(),
            Some("rotated")
        );
    }

    #[tokio::test]
    async fn second_unauthorized_is_fatal() {
        let hits = Hits::default();
        let router = Router::new()
            .route("/matters.json", get(reject_everything))
            .route("/oauth/token", post(issue_token))
            .with_state(hits.clone());
        let base = serve(router).await;
        let credentials = Credentials {
            access_token: "stale".into(),
            refresh_token: Some("r1".into()),
            ..Credentials::default()
        };
        let client = client_for(&base, quick_backoff(), credentials);

        let err = client
            .fetch_page(&PageRequest::first(EntityKind::Matters))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unauthorized { .. }));
        assert_eq!(hits.token.load(Ordering::SeqCst), 1);
        assert_eq!(hits.collection.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unauthorized_without_refresh_token_fails_immediately() {
        let hits = Hits::default();
        let router = Router::new()
            .route("/matters.json", get(reject_everything))
            .with_state(hits.clone());
        let base = serve(router).await;
        let client = client_for(&base, quick_backoff(), Credentials::bearer("stale"));

        let err = client
            .fetch_page(&PageRequest::first(EntityKind::Matters))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unauthorized { .. }));
        assert_eq!(hits.collection.load(Ordering::SeqCst), 1);
    }
}
