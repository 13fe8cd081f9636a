//! Transmission RPC client.
//!
//! Every request must carry the server's CSRF session token in `X-Transmission-Session-Id`.
//! A missing or stale token is answered with `409 Conflict`, and that 409 response carries the
//! token to use next. The client keeps the last token it saw and retries on 409 at most twice,
//! three attempts in total. Transport failures are never retried.

use crate::config::TransmissionConfig;
use crate::format::format_bitrate;
use crate::snapshot::TransmissionReport;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const SESSION_ID_HEADER: &str = "X-Transmission-Session-Id";
const MAX_ATTEMPTS: u32 = 3;
const TORRENT_FIELDS: [&str; 7] = [
    "id",
    "name",
    "status",
    "rateDownload",
    "rateUpload",
    "percentDone",
    "errorString",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Stopped,
    CheckWait,
    Check,
    DownloadWait,
    Downloading,
    SeedWait,
    Seeding,
    Unknown,
}

impl TransferStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => TransferStatus::Stopped,
            1 => TransferStatus::CheckWait,
            2 => TransferStatus::Check,
            3 => TransferStatus::DownloadWait,
            4 => TransferStatus::Downloading,
            5 => TransferStatus::SeedWait,
            6 => TransferStatus::Seeding,
            _ => TransferStatus::Unknown,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, TransferStatus::Downloading | TransferStatus::Seeding)
    }
}

/// Aggregate session figures. Rates are bits per second.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub download_bps: f64,
    pub upload_bps: f64,
    pub download: String,
    pub upload: String,
    pub active_count: u64,
    pub paused_count: u64,
    pub total_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferItem {
    pub id: i64,
    pub name: String,
    pub status: TransferStatus,
    pub download_bps: f64,
    pub upload_bps: f64,
    pub percent_done: f64,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(StatusCode),
    #[error("session token rejected after {0} attempts")]
    Rejected(u32),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("rpc result '{0}'")]
    Result(String),
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SessionStatsArgs {
    active_torrent_count: u64,
    paused_torrent_count: u64,
    torrent_count: u64,
    download_speed: f64,
    upload_speed: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TorrentGetArgs {
    torrents: Vec<RawTorrent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawTorrent {
    id: i64,
    name: String,
    status: i64,
    rate_download: f64,
    rate_upload: f64,
    percent_done: f64,
    error_string: String,
}

pub struct TransmissionClient {
    http: Client,
    url: String,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
    session_id: Mutex<Option<String>>,
}

impl TransmissionClient {
    /// `None` when no endpoint is configured: the integration is disabled and never calls out.
    pub fn from_config(cfg: &TransmissionConfig, timeout: Duration, http: Client) -> Option<Self> {
        let url = cfg.url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        Some(Self {
            http,
            url: url.to_string(),
            username: cfg
                .username
                .as_ref()
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty()),
            password: cfg.resolve_password(),
            timeout,
            session_id: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub async fn cached_session_id(&self) -> Option<String> {
        self.session_id.lock().await.clone()
    }

    pub async fn session_stats(&self) -> Option<SessionSummary> {
        let args = self.call("session-stats", json!({})).await?;
        let stats: SessionStatsArgs = parse_arguments("session-stats", args)?;
        let download_bps = stats.download_speed.max(0.0) * 8.0;
        let upload_bps = stats.upload_speed.max(0.0) * 8.0;
        Some(SessionSummary {
            download_bps,
            upload_bps,
            download: format_bitrate(download_bps),
            upload: format_bitrate(upload_bps),
            active_count: stats.active_torrent_count,
            paused_count: stats.paused_torrent_count,
            total_count: stats.torrent_count,
        })
    }

    /// Items currently downloading or seeding.
    pub async fn active_items(&self) -> Option<Vec<TransferItem>> {
        let args = self
            .call("torrent-get", json!({ "fields": TORRENT_FIELDS }))
            .await?;
        let list: TorrentGetArgs = parse_arguments("torrent-get", args)?;
        let items = list
            .torrents
            .into_iter()
            .map(|t| TransferItem {
                id: t.id,
                name: t.name,
                status: TransferStatus::from_code(t.status),
                download_bps: t.rate_download.max(0.0) * 8.0,
                upload_bps: t.rate_upload.max(0.0) * 8.0,
                percent_done: (t.percent_done * 1000.0).round() / 10.0,
                error: Some(t.error_string).filter(|e| !e.is_empty()),
            })
            .filter(|item| item.status.is_active())
            .collect();
        Some(items)
    }

    pub async fn report(&self) -> TransmissionReport {
        let (session, items) = tokio::join!(self.session_stats(), self.active_items());
        match session {
            Some(session) => TransmissionReport {
                enabled: true,
                error: None,
                session: Some(session),
                active: items.unwrap_or_default(),
            },
            None => TransmissionReport::unreachable(),
        }
    }

    async fn call(&self, method: &str, arguments: Value) -> Option<Value> {
        match self.call_with_session(method, &arguments).await {
            Ok(args) => Some(args),
            Err(err) => {
                debug!(method, url = %self.url, error = %err, "transmission rpc call failed");
                None
            }
        }
    }

    async fn call_with_session(&self, method: &str, arguments: &Value) -> Result<Value, RpcError> {
        let body = json!({ "method": method, "arguments": arguments });
        let mut token = self.session_id.lock().await.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let response = self.send(&body, token.as_deref()).await?;
            let fresh = session_id_from(&response);

            if response.status() != StatusCode::CONFLICT {
                if let Some(fresh) = fresh {
                    *self.session_id.lock().await = Some(fresh);
                }
                return read_result(response).await;
            }

            let Some(fresh) = fresh else {
                return Err(RpcError::Rejected(attempt));
            };
            let repeated = attempt > 1 && token.as_deref() == Some(fresh.as_str());
            *self.session_id.lock().await = Some(fresh.clone());
            if attempt >= MAX_ATTEMPTS || repeated {
                return Err(RpcError::Rejected(attempt));
            }
            token = Some(fresh);
        }
    }

    async fn send(&self, body: &Value, token: Option<&str>) -> Result<Response, RpcError> {
        let mut req = self.http.post(&self.url).timeout(self.timeout).json(body);
        if let Some(token) = token {
            req = req.header(SESSION_ID_HEADER, token);
        }
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_deref());
        }
        Ok(req.send().await?)
    }
}

fn session_id_from(response: &Response) -> Option<String> {
    response
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

async fn read_result(response: Response) -> Result<Value, RpcError> {
    let status = response.status();
    if !status.is_success() {
        return Err(RpcError::Status(status));
    }
    let text = response.text().await?;
    let parsed: RpcResponse =
        serde_json::from_str(&text).map_err(|err| RpcError::Malformed(err.to_string()))?;
    if parsed.result != "success" {
        return Err(RpcError::Result(parsed.result));
    }
    Ok(parsed.arguments)
}

fn parse_arguments<T: for<'de> Deserialize<'de>>(method: &str, args: Value) -> Option<T> {
    match serde_json::from_value(args) {
        Ok(v) => Some(v),
        Err(err) => {
            debug!(method, error = %err, "unexpected transmission arguments");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Behaviour = dyn Fn(usize, Option<&str>, &Value) -> AxumResponse + Send + Sync;

    struct FakeRpc {
        requests: AtomicUsize,
        behaviour: Box<Behaviour>,
        saw_auth: AtomicUsize,
    }

    async fn rpc_handler(
        State(fake): State<Arc<FakeRpc>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> AxumResponse {
        let n = fake.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if headers.contains_key("authorization") {
            fake.saw_auth.fetch_add(1, Ordering::SeqCst);
        }
        let token = headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok());
        (fake.behaviour)(n, token, &body)
    }

    async fn spawn_fake<F>(behaviour: F) -> (Arc<FakeRpc>, String)
    where
        F: Fn(usize, Option<&str>, &Value) -> AxumResponse + Send + Sync + 'static,
    {
        let fake = Arc::new(FakeRpc {
            requests: AtomicUsize::new(0),
            behaviour: Box::new(behaviour),
            saw_auth: AtomicUsize::new(0),
        });
        let app = Router::new()
            .route("/transmission/rpc", post(rpc_handler))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (fake, format!("http://{addr}/transmission/rpc"))
    }

    fn client_for(url: &str) -> TransmissionClient {
        let cfg = TransmissionConfig {
            url: Some(url.to_string()),
            ..TransmissionConfig::default()
        };
        TransmissionClient::from_config(&cfg, Duration::from_secs(2), Client::new())
            .expect("client enabled")
    }

    fn conflict(token: &str) -> AxumResponse {
        (
            axum::http::StatusCode::CONFLICT,
            [(SESSION_ID_HEADER, token.to_string())],
            "",
        )
            .into_response()
    }

    fn success(arguments: Value) -> AxumResponse {
        Json(json!({ "result": "success", "arguments": arguments })).into_response()
    }

    fn stats_body() -> Value {
        json!({
            "activeTorrentCount": 2,
            "pausedTorrentCount": 1,
            "torrentCount": 3,
            "downloadSpeed": 125000,
            "uploadSpeed": 1000
        })
    }

    #[test]
    fn disabled_without_url() {
        let cfg = TransmissionConfig::default();
        assert!(
            TransmissionClient::from_config(&cfg, Duration::from_secs(1), Client::new()).is_none()
        );
        let blank = TransmissionConfig {
            url: Some("   ".to_string()),
            ..TransmissionConfig::default()
        };
        assert!(
            TransmissionClient::from_config(&blank, Duration::from_secs(1), Client::new())
                .is_none()
        );
    }

    #[test]
    fn status_codes_map_to_enum() {
        assert_eq!(TransferStatus::from_code(0), TransferStatus::Stopped);
        assert_eq!(TransferStatus::from_code(4), TransferStatus::Downloading);
        assert_eq!(TransferStatus::from_code(6), TransferStatus::Seeding);
        assert_eq!(TransferStatus::from_code(42), TransferStatus::Unknown);
        assert!(TransferStatus::Seeding.is_active());
        assert!(!TransferStatus::SeedWait.is_active());
    }

    #[tokio::test]
    async fn rejection_then_success_caches_token() {
        let (fake, url) = spawn_fake(|_, token, _| match token {
            Some("abc") => success(stats_body()),
            _ => conflict("abc"),
        })
        .await;
        let client = client_for(&url);

        let summary = client.session_stats().await.expect("second attempt succeeds");
        assert_eq!(summary.download_bps, 1_000_000.0);
        assert_eq!(summary.download, "1.00 Mbps");
        assert_eq!(summary.upload_bps, 8_000.0);
        assert_eq!(summary.active_count, 2);
        assert_eq!(summary.paused_count, 1);
        assert_eq!(fake.requests.load(Ordering::SeqCst), 2);
        assert_eq!(client.cached_session_id().await.as_deref(), Some("abc"));

        client.session_stats().await.expect("cached token accepted");
        assert_eq!(fake.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn three_rejections_give_up_without_fourth_attempt() {
        let (fake, url) = spawn_fake(|n, _, _| conflict(&format!("token-{n}"))).await;
        let client = client_for(&url);

        assert!(client.session_stats().await.is_none());
        assert_eq!(fake.requests.load(Ordering::SeqCst), 3);
        assert_eq!(client.cached_session_id().await.as_deref(), Some("token-3"));
    }

    #[tokio::test]
    async fn repeated_token_rejection_stops_early() {
        let (fake, url) = spawn_fake(|_, _, _| conflict("same")).await;
        let client = client_for(&url);

        assert!(client.session_stats().await.is_none());
        assert_eq!(fake.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn third_attempt_result_is_returned() {
        let (fake, url) = spawn_fake(|n, _, _| {
            if n < 3 {
                conflict(&format!("token-{n}"))
            } else {
                success(stats_body())
            }
        })
        .await;
        let client = client_for(&url);

        assert!(client.session_stats().await.is_some());
        assert_eq!(fake.requests.load(Ordering::SeqCst), 3);
        assert_eq!(client.cached_session_id().await.as_deref(), Some("token-2"));
    }

    #[tokio::test]
    async fn transport_failure_is_not_retried() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = client_for(&format!("http://{addr}/transmission/rpc"));

        assert!(client.session_stats().await.is_none());
        assert!(client.cached_session_id().await.is_none());
        let report = client.report().await;
        assert!(report.enabled);
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn malformed_and_failed_results_are_none() {
        let (_fake, url) = spawn_fake(|_, _, body| {
            if body["method"] == "session-stats" {
                "not json".into_response()
            } else {
                Json(json!({ "result": "no such method" })).into_response()
            }
        })
        .await;
        let client = client_for(&url);

        assert!(client.session_stats().await.is_none());
        assert!(client.active_items().await.is_none());
    }

    #[tokio::test]
    async fn active_items_keeps_downloading_and_seeding() {
        let (_fake, url) = spawn_fake(|_, _, body| {
            assert_eq!(body["method"], "torrent-get");
            success(json!({
                "torrents": [
                    { "id": 1, "name": "debian.iso", "status": 4, "rateDownload": 1000,
                      "rateUpload": 0, "percentDone": 0.4567, "errorString": "" },
                    { "id": 2, "name": "paused", "status": 0, "rateDownload": 0,
                      "rateUpload": 0, "percentDone": 1.0, "errorString": "" },
                    { "id": 3, "name": "seed", "status": 6, "rateDownload": 0,
                      "rateUpload": 250, "percentDone": 1.0, "errorString": "tracker down" }
                ]
            }))
        })
        .await;
        let client = client_for(&url);

        let items = client.active_items().await.expect("items");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "debian.iso");
        assert_eq!(items[0].status, TransferStatus::Downloading);
        assert_eq!(items[0].download_bps, 8000.0);
        assert_eq!(items[0].percent_done, 45.7);
        assert_eq!(items[1].status, TransferStatus::Seeding);
        assert_eq!(items[1].error.as_deref(), Some("tracker down"));
    }

    #[tokio::test]
    async fn basic_auth_is_sent_when_configured() {
        let (fake, url) = spawn_fake(|_, _, _| success(stats_body())).await;
        let cfg = TransmissionConfig {
            url: Some(url),
            username: Some("pi".to_string()),
            password: Some("raspberry".to_string()),
            password_env: "RPIMON_TEST_UNSET_PASSWORD_ENV".to_string(),
        };
        let client =
            TransmissionClient::from_config(&cfg, Duration::from_secs(2), Client::new()).unwrap();

        assert!(client.session_stats().await.is_some());
        assert_eq!(fake.saw_auth.load(Ordering::SeqCst), 1);
    }
}
