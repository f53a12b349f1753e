//! Read-only JSON operator API over the property store and run reports.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use pmr_core::{
    Confidence, Fingerprint, LifecycleRecord, MarketGapFlag, PriceHistoryPoint, PropertyEntity,
    ScanCursor,
};
use pmr_storage::{PropertyStore, StoreError};
use pmr_sync::SourceRegistry;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pmr-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PropertyStore>,
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(store: Arc<dyn PropertyStore>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            workspace_root: workspace_root.into(),
        }
    }
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Store(StoreError),
    Internal(anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Store(err) => {
                warn!(error = %err, "store error while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            Self::Internal(err) => {
                warn!(error = %format!("{err:#}"), "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct PropertyView {
    pub property: PropertyEntity,
    pub fingerprint: Option<Fingerprint>,
    pub market_gap: Option<MarketGapFlag>,
    pub lifecycle: Option<LifecycleRecord>,
}

#[derive(Debug, Serialize)]
pub struct MatchView {
    pub property_id: Uuid,
    pub score: u8,
    pub confidence: Confidence,
    pub reasons: Vec<String>,
    pub updated_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct DailyResetView {
    pub today: NaiveDate,
    pub last_reset: Option<NaiveDate>,
    pub reset_pending: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReportRow {
    pub run_id: String,
    pub stage: Option<String>,
    pub has_parquet_manifest: bool,
}

#[derive(Debug, Deserialize, Default)]
struct MarketGapQuery {
    min_confidence: Option<Confidence>,
    #[serde(default)]
    pending_only: bool,
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ops/scan-cursors", get(scan_cursors_handler))
        .route("/ops/daily-reset", get(daily_reset_handler))
        .route("/ops/sources", get(sources_handler))
        .route("/ops/runs", get(runs_handler))
        .route("/properties/{id}", get(property_handler))
        .route("/properties/{id}/history", get(history_handler))
        .route("/properties/{id}/matches", get(matches_handler))
        .route("/market-gaps", get(market_gaps_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("PMR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "operator api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn scan_cursors_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ScanCursor>> {
    Ok(Json(state.store.list_scan_cursors().await?))
}

async fn daily_reset_handler(State(state): State<Arc<AppState>>) -> ApiResult<DailyResetView> {
    let today = Utc::now().date_naive();
    let last_reset = state.store.daily_reset_marker().await?;
    Ok(Json(DailyResetView {
        today,
        last_reset,
        reset_pending: last_reset.map_or(true, |d| d < today),
    }))
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match SourceRegistry::load(&state.workspace_root.join("sources.yaml")) {
        Ok(registry) => Json(registry.sources).into_response(),
        Err(err) => ApiError::Internal(err).into_response(),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Vec<RunReportRow>> {
    let limit = query.limit.unwrap_or(20).max(1);
    Ok(Json(load_runs(&state.workspace_root.join("reports"), limit)?))
}

async fn load_property(state: &AppState, id: Uuid) -> Result<PropertyEntity, ApiError> {
    state
        .store
        .get_property(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("property {id} not found")))
}

async fn property_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> ApiResult<PropertyView> {
    let property = load_property(&state, id).await?;
    let fingerprint = state.store.get_fingerprint(id).await?;
    let market_gap = state.store.get_market_gap_flag(id).await?;
    let lifecycle = state
        .store
        .get_lifecycle_record(&property.source_key(), property.generation)
        .await?;
    Ok(Json(PropertyView {
        property,
        fingerprint,
        market_gap,
        lifecycle,
    }))
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> ApiResult<Vec<PriceHistoryPoint>> {
    load_property(&state, id).await?;
    Ok(Json(state.store.price_history(id).await?))
}

async fn matches_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> ApiResult<Vec<MatchView>> {
    load_property(&state, id).await?;
    let mut matches: Vec<MatchView> = state
        .store
        .match_edges_for(id)
        .await?
        .into_iter()
        .map(|edge| MatchView {
            property_id: if edge.primary_id == id { edge.matched_id } else { edge.primary_id },
            score: edge.score,
            confidence: edge.confidence,
            reasons: edge.reasons,
            updated_at: edge.updated_at,
        })
        .collect();
    matches.sort_by(|a, b| b.score.cmp(&a.score).then(a.property_id.cmp(&b.property_id)));
    Ok(Json(matches))
}

async fn market_gaps_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MarketGapQuery>,
) -> ApiResult<Vec<MarketGapFlag>> {
    let min = query.min_confidence.unwrap_or(Confidence::Low);
    let mut flags: Vec<MarketGapFlag> = state
        .store
        .list_market_gap_flags()
        .await?
        .into_iter()
        .filter(|f| f.is_active() && f.confidence >= min && (!query.pending_only || !f.notified))
        .collect();
    flags.sort_by(|a, b| {
        b.gap_percentage
            .partial_cmp(&a.gap_percentage)
            .unwrap_or(Ordering::Equal)
    });
    Ok(Json(flags))
}

/// Most recent run directories under `reports_root`, newest first.
fn load_runs(reports_root: &Path, limit: usize) -> anyhow::Result<Vec<RunReportRow>> {
    if !reports_root.exists() {
        return Ok(vec![]);
    }
    let mut entries = std::fs::read_dir(reports_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    entries.reverse();

    let mut runs = Vec::new();
    for e in entries.into_iter().take(limit) {
        let summary_path = e.path().join("summary.json");
        let stage = if summary_path.exists() {
            let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&summary_path)?)?;
            v.get("stage").and_then(|s| s.as_str()).map(ToString::to_string)
        } else {
            None
        };
        runs.push(RunReportRow {
            run_id: e.file_name().to_string_lossy().to_string(),
            stage,
            has_parquet_manifest: e.path().join("snapshots/manifest.json").exists(),
        });
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use pmr_storage::MemoryStore;
    use tower::ServiceExt;

    fn empty_app() -> Router {
        let dir = std::env::temp_dir();
        app(AppState::new(Arc::new(MemoryStore::new()), dir))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = get_json(empty_app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn daily_reset_is_pending_before_first_run() {
        let (status, body) = get_json(empty_app(), "/ops/daily-reset").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["last_reset"].is_null());
        assert_eq!(body["reset_pending"], true);
    }

    #[tokio::test]
    async fn unknown_property_is_not_found() {
        let uri = format!("/properties/{}", Uuid::from_u128(7));
        let (status, body) = get_json(empty_app(), &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn malformed_property_id_is_rejected() {
        let resp = empty_app()
            .oneshot(axum::http::Request::builder().uri("/properties/not-a-uuid").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn runs_listing_reads_stage_from_summary() {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path().join("run-a");
        std::fs::create_dir_all(run.join("snapshots")).unwrap();
        std::fs::write(run.join("summary.json"), r#"{"stage":"market_gap","summary":{}}"#).unwrap();
        std::fs::write(run.join("snapshots/manifest.json"), "{}").unwrap();

        let runs = load_runs(dir.path(), 5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].stage.as_deref(), Some("market_gap"));
        assert!(runs[0].has_parquet_manifest);
        assert!(load_runs(&dir.path().join("missing"), 5).unwrap().is_empty());
    }
}
