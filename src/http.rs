use crate::collector::StatsCollector;
use crate::metrics::Metrics;
use crate::snapshot::{now_unix_ms, DeviceClass};
use crate::store::{SampleQuery, StorageQuery, Store, StoreError};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<StatsCollector>,
    pub store: Store,
    pub metrics: Arc<Metrics>,
    pub default_limit: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    pub limit: Option<usize>,
    pub range_seconds: Option<u64>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageHistoryParams {
    pub device_type: Option<String>,
    pub device_fs: Option<String>,
    pub limit: Option<usize>,
    pub range_seconds: Option<u64>,
    pub format: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/history", get(history_handler))
        .route("/api/storage/history", get(storage_history_handler))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.collector.collect().await)
}

async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Response {
    // A time range wins over a row limit.
    let query = match params.range_seconds {
        Some(range) => SampleQuery::Since {
            since_ms: since_ms(range),
        },
        None => SampleQuery::Latest {
            limit: params.limit.unwrap_or(state.default_limit),
        },
    };
    let csv = wants_csv(params.format.as_deref());
    let store = state.store.clone();

    let result = tokio::task::spawn_blocking(move || {
        if csv {
            store.export_samples_delimited(query, ',').map(Export::Csv)
        } else {
            store
                .query_samples(query)
                .map(|rows| Export::Json(serde_json::to_value(rows)))
        }
    })
    .await;
    export_response(result, "metrics.csv")
}

async fn storage_history_handler(
    State(state): State<AppState>,
    Query(params): Query<StorageHistoryParams>,
) -> Response {
    let device_type = match params.device_type.as_deref() {
        None | Some("") => None,
        Some(raw) => match DeviceClass::parse(raw) {
            Some(class) => Some(class),
            None => {
                return bad_request(format!("unknown deviceType {raw:?}, expected HDD or SD"));
            }
        },
    };
    let (since_ms, limit) = match params.range_seconds {
        Some(range) => (Some(since_ms(range)), None),
        None => (None, Some(params.limit.unwrap_or(state.default_limit))),
    };
    let query = StorageQuery {
        device_type,
        device_fs: params.device_fs.filter(|fs| !fs.is_empty()),
        since_ms,
        limit,
    };
    let csv = wants_csv(params.format.as_deref());
    let store = state.store.clone();

    let result = tokio::task::spawn_blocking(move || {
        if csv {
            store.export_storage_delimited(&query, ',').map(Export::Csv)
        } else {
            store
                .query_storage_samples(&query)
                .map(|rows| Export::Json(serde_json::to_value(rows)))
        }
    })
    .await;
    export_response(result, "storage_metrics.csv")
}

enum Export {
    Csv(String),
    Json(Result<serde_json::Value, serde_json::Error>),
}

fn export_response(
    result: Result<Result<Export, StoreError>, tokio::task::JoinError>,
    filename: &'static str,
) -> Response {
    match result {
        Ok(Ok(Export::Csv(body))) => {
            let disposition = format!("attachment; filename=\"{filename}\"");
            (
                StatusCode::OK,
                [
                    (CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                    (axum::http::header::CONTENT_DISPOSITION, disposition),
                ],
                body,
            )
                .into_response()
        }
        Ok(Ok(Export::Json(Ok(value)))) => Json(value).into_response(),
        Ok(Ok(Export::Json(Err(err)))) => internal_error(err.to_string()),
        Ok(Err(err)) => internal_error(err.to_string()),
        Err(err) => internal_error(err.to_string()),
    }
}

fn internal_error(message: String) -> Response {
    error!(error = %message, "history query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody { error: message }),
    )
        .into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: message })).into_response()
}

fn wants_csv(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.eq_ignore_ascii_case("csv"))
}

fn since_ms(range_seconds: u64) -> i64 {
    let range_ms = i64::try_from(range_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
    now_unix_ms().saturating_sub(range_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertThreshold;
    use crate::collector::CollectorOptions;
    use crate::collectors::testing::static_sources;
    use crate::store::{Sample, StorageSample};
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app_state() -> AppState {
        let collector = StatsCollector::new(
            static_sources(),
            None,
            CollectorOptions {
                command_timeout: Duration::from_millis(200),
                public_ip_timeout: Duration::from_millis(200),
                rpc_timeout: Duration::from_millis(200),
                memory_alerts: AlertThreshold::default(),
                storage_alerts: AlertThreshold::default(),
            },
        );
        AppState {
            collector: Arc::new(collector),
            store: Store::open_in_memory().unwrap(),
            metrics: Metrics::new().unwrap(),
            default_limit: 2,
        }
    }

    fn seed(store: &Store) {
        let now = now_unix_ms();
        for (i, age_s) in [3_600_i64, 120, 60, 0].iter().enumerate() {
            store
                .append_sample(&Sample {
                    ts_ms: now - age_s * 1000,
                    cpu_load1: i as f64,
                    ..Sample::default()
                })
                .unwrap();
        }
        let storage = |fs: &str, ty: &str, ts_ms: i64| StorageSample {
            ts_ms,
            device_fs: fs.to_string(),
            mount: "/mnt, data".to_string(),
            device_type: ty.to_string(),
            total_bytes: 100,
            used_bytes: 40,
            use_percent: 40.0,
        };
        store
            .append_storage_samples(&[
                storage("/dev/sda1", "HDD", now - 1000),
                storage("/dev/mmcblk0p2", "SD", now - 1000),
                storage("/dev/sda1", "HDD", now),
            ])
            .unwrap();
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (status, _, body) = get(build_router(app_state()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn stats_returns_snapshot_json() {
        let (status, _, body) = get(build_router(app_state()), "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["memory"]["total_mb"], 3793);
        assert_eq!(value["disk"]["used"], "N/A");
        assert_eq!(value["storage"][0]["class"], "SD");
        assert_eq!(value["transmission"]["enabled"], false);
    }

    #[tokio::test]
    async fn history_defaults_to_latest_rows() {
        let state = app_state();
        seed(&state.store);
        let (status, _, body) = get(build_router(state), "/api/history").await;
        assert_eq!(status, StatusCode::OK);
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["cpu_load1"], 2.0);
        assert_eq!(rows[1]["cpu_load1"], 3.0);
    }

    #[tokio::test]
    async fn history_range_overrides_limit() {
        let state = app_state();
        seed(&state.store);
        let (_, _, body) = get(build_router(state), "/api/history?limit=1&rangeSeconds=300").await;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn history_csv_export() {
        let state = app_state();
        seed(&state.store);
        let (status, content_type, body) =
            get(build_router(state), "/api/history?limit=10&format=csv").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/csv"));
        let mut lines = body.lines();
        assert!(lines.next().unwrap().starts_with("ts_ms,cpu_load1"));
        assert_eq!(lines.count(), 4);
    }

    #[tokio::test]
    async fn storage_history_filters_and_escapes() {
        let state = app_state();
        seed(&state.store);
        let app = build_router(state);

        let (_, _, body) = get(app.clone(), "/api/storage/history?deviceType=hdd&limit=10").await;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r["device_type"] == "HDD"));

        let (_, _, body) = get(
            app.clone(),
            "/api/storage/history?deviceFs=/dev/mmcblk0p2&format=csv&limit=10",
        )
        .await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"/mnt, data\""));

        let (status, _, _) = get(app, "/api/storage/history?deviceType=tape").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_counts_scrapes() {
        let state = app_state();
        let metrics = state.metrics.clone();
        let app = build_router(state);
        let (status, content_type, body) = get(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/plain; version=0.0.4"));
        assert!(body.contains("rpimon_cpu_load1"));
        assert_eq!(metrics.scrape_count_total.get(), 1.0);
    }
}
