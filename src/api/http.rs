//! HTTP API Server
//!
//! Admin REST API of the monitor: liveness, in-flight batch jobs, file
//! status, the consistency sweep and repairs from a good copy.

use std::sync::Arc;
use std::time::Instant;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::monitor::{MonitorServer, PendingBatch};
use crate::protocol::CorrectionReply;
use crate::reconcile::{FileReport, PendingCorrection, SweepReport};

/// Shared application state
pub struct AppState {
    pub node_id: String,
    pub monitor: Arc<MonitorServer>,
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, node_id: String, monitor: Arc<MonitorServer>) -> Self {
        let state = Arc::new(AppState {
            node_id,
            monitor,
            started: Instant::now(),
        });
        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    fn create_router(state: Arc<AppState>, cors: bool) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/replicas", get(handle_replicas))
            .route("/replicas/:replica_id/missing", get(handle_missing))
            .route("/replicas/:replica_id/corrupt", get(handle_corrupt))
            .route("/batches", get(handle_batches))
            .route("/files/:filename", get(handle_file))
            .route("/sweep", post(handle_sweep))
            .route("/replicas/:replica_id/files/:filename/correct", post(handle_correct))
            .route("/replicas/:replica_id/files/:filename/upload", post(handle_upload))
            .with_state(state)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        if cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Transport(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub known_replicas: usize,
    pub live_replicas: usize,
    pub files: u64,
    pub uptime_seconds: u64,
}

/// One replica as seen by the monitor
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicaResponse {
    pub id: String,
    pub name: String,
    pub replica_type: String,
    pub alive: bool,
    pub last_seen_ms_ago: Option<u64>,
    pub checksum_updated: Option<DateTime<Utc>>,
    pub filelist_updated: Option<DateTime<Utc>>,
}

/// In-flight work
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchesResponse {
    pub in_flight: usize,
    pub corrections_pending: usize,
    pub batches: Vec<PendingBatch>,
    pub corrections: Vec<PendingCorrection>,
}

/// Correction request
#[derive(Debug, Serialize, Deserialize)]
pub struct CorrectRequest {
    pub credentials: String,
}

/// Outcome of a repair
#[derive(Debug, Serialize, Deserialize)]
pub struct RepairResponse {
    pub filename: String,
    pub replica_id: String,
    /// Size of the copy taken out of the replica, if one was removed
    pub removed_bytes: Option<usize>,
}

/// File listing for one replica
#[derive(Debug, Serialize, Deserialize)]
pub struct FileListResponse {
    pub replica_id: String,
    pub files: Vec<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error wrapper turning crate errors into HTTP responses
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::UnknownReplica(_) => (StatusCode::NOT_FOUND, "REPLICA_NOT_FOUND"),
            Error::UnknownFile(_) | Error::FileNotFound(_) => (StatusCode::NOT_FOUND, "FILE_NOT_FOUND"),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            Error::ConsistencyConflict { .. } => (StatusCode::CONFLICT, "NO_CANONICAL_CHECKSUM"),
            Error::RepairFailed(_) => (StatusCode::BAD_GATEWAY, "REPAIR_FAILED"),
            Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("API request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let monitor = &state.monitor;
    let store = monitor.engine().store();
    let live = monitor.liveness().running_replicas().await;

    Ok(Json(HealthResponse {
        healthy: true,
        node_id: state.node_id.clone(),
        known_replicas: store.replicas().len(),
        live_replicas: live.len(),
        files: store.file_count().await?,
        uptime_seconds: state.started.elapsed().as_secs(),
    }))
}

async fn handle_replicas(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ReplicaResponse>> {
    let monitor = &state.monitor;
    let store = monitor.engine().store();
    let liveness = monitor.liveness().snapshot().await;

    let mut replicas = Vec::with_capacity(store.replicas().len());
    for replica in store.replicas() {
        let seen = liveness.iter().find(|l| l.replica_id == replica.id);
        let dates = store.update_dates(&replica.id).await?;
        replicas.push(ReplicaResponse {
            id: replica.id.clone(),
            name: replica.name.clone(),
            replica_type: replica.replica_type.to_string(),
            alive: seen.map(|l| l.healthy).unwrap_or(false),
            last_seen_ms_ago: seen.map(|l| l.last_seen_ms_ago),
            checksum_updated: dates.checksum_updated,
            filelist_updated: dates.filelist_updated,
        });
    }
    Ok(Json(replicas))
}

async fn handle_missing(
    State(state): State<Arc<AppState>>,
    Path(replica_id): Path<String>,
) -> ApiResult<FileListResponse> {
    let files = state.monitor.engine().missing_files(&replica_id).await?;
    Ok(Json(FileListResponse { replica_id, files }))
}

async fn handle_corrupt(
    State(state): State<Arc<AppState>>,
    Path(replica_id): Path<String>,
) -> ApiResult<FileListResponse> {
    let files = state.monitor.engine().corrupt_files(&replica_id).await?;
    Ok(Json(FileListResponse { replica_id, files }))
}

async fn handle_batches(State(state): State<Arc<AppState>>) -> ApiResult<BatchesResponse> {
    let monitor = &state.monitor;
    let batches = monitor.coordinator().pending().await;
    Ok(Json(BatchesResponse {
        in_flight: batches.len(),
        corrections_pending: monitor.repair().pending().await,
        batches,
        corrections: monitor.repair().pending_corrections().await,
    }))
}

async fn handle_file(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> ApiResult<FileReport> {
    match state.monitor.engine().file_report(&filename).await? {
        Some(report) => Ok(Json(report)),
        None => Err(Error::UnknownFile(filename).into()),
    }
}

async fn handle_sweep(State(state): State<Arc<AppState>>) -> ApiResult<SweepReport> {
    tracing::info!("Consistency sweep requested through the API");
    let report = state.monitor.engine().sweep().await?;
    Ok(Json(report))
}

async fn handle_correct(
    State(state): State<Arc<AppState>>,
    Path((replica_id, filename)): Path<(String, String)>,
    Json(request): Json<CorrectRequest>,
) -> ApiResult<RepairResponse> {
    tracing::info!("Correction of '{}' on replica {} requested through the API", filename, replica_id);
    let reply = state
        .monitor
        .replace_corrupt_copy(&filename, &replica_id, &request.credentials)
        .await?;
    repair_response(filename, replica_id, reply)
}

async fn handle_upload(
    State(state): State<Arc<AppState>>,
    Path((replica_id, filename)): Path<(String, String)>,
) -> ApiResult<RepairResponse> {
    tracing::info!("Upload of the missing '{}' to replica {} requested through the API", filename, replica_id);
    let reply = state.monitor.upload_missing_file(&filename, &replica_id).await?;
    repair_response(filename, replica_id, reply)
}

fn repair_response(filename: String, replica_id: String, reply: CorrectionReply) -> ApiResult<RepairResponse> {
    if !reply.ok {
        return Err(Error::RepairFailed(reply.error.unwrap_or_default()).into());
    }
    Ok(Json(RepairResponse {
        filename,
        replica_id,
        removed_bytes: reply.removed_file.map(|f| f.len()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveConfig;
    use crate::notify::RecordingNotifier;
    use crate::state::{ChecksumStatus, ReplicaStore};
    use crate::transport::LocalTransport;

    const CONFIG: &str = r#"
        [node]
        id = "monitor"
        role = "monitor"
        bind_address = "127.0.0.1:7700"

        [[replicas]]
        id = "ONE"
        name = "Replica one"

        [[replicas]]
        id = "TWO"
        name = "Replica two"
    "#;

    fn state() -> Arc<AppState> {
        let config = ArchiveConfig::from_str(CONFIG).unwrap();
        let store = Arc::new(ReplicaStore::in_memory(config.known_replicas()).unwrap());
        let monitor = Arc::new(MonitorServer::new(
            &config,
            store,
            Arc::new(LocalTransport::new()),
            Arc::new(RecordingNotifier::new()),
        ));
        HttpServer::new(config.api.clone(), "monitor".into(), monitor).state()
    }

    #[tokio::test]
    async fn test_health_and_replicas() {
        let state = state();
        state.monitor.liveness().sign_of_life("ONE").await;

        let Json(health) = handle_health(State(state.clone())).await.unwrap();
        assert_eq!(health.known_replicas, 2);
        assert_eq!(health.live_replicas, 1);
        assert_eq!(health.files, 0);

        let Json(replicas) = handle_replicas(State(state)).await.unwrap();
        assert!(replicas[0].alive);
        assert!(!replicas[1].alive);
        assert_eq!(replicas[1].last_seen_ms_ago, None);
    }

    #[tokio::test]
    async fn test_file_report_sweep_and_listings() {
        let state = state();
        let engine = state.monitor.engine().clone();
        engine.update_checksum_for_file("a.warc", Some("A"), "ONE").await.unwrap();
        engine.update_checksum_for_file("a.warc", Some("B"), "TWO").await.unwrap();
        engine.update_checksum_for_file("b.warc", None, "TWO").await.unwrap();

        let Json(report) = handle_sweep(State(state.clone())).await.unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.ties, 1);
        assert_eq!(report.no_checksums, 1);

        let Json(file) = handle_file(State(state.clone()), Path("a.warc".into())).await.unwrap();
        assert_eq!(file.replicas.len(), 2);
        assert_eq!(file.checksum, None);

        // A tie cannot be repaired
        let err = handle_correct(
            State(state.clone()),
            Path(("TWO".into(), "a.warc".into())),
            Json(CorrectRequest { credentials: "secret".into() }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        let Json(missing) = handle_missing(State(state.clone()), Path("TWO".into())).await.unwrap();
        assert_eq!(missing.files, vec!["b.warc"]);

        let Json(corrupt) = handle_corrupt(State(state.clone()), Path("ONE".into())).await.unwrap();
        assert!(corrupt.files.is_empty());
    }

    #[tokio::test]
    async fn test_file_request_persists_vote() {
        let state = state();
        let engine = state.monitor.engine().clone();
        engine.update_checksum_for_file("a.warc", Some("A"), "ONE").await.unwrap();
        engine.update_checksum_for_file("a.warc", Some("A"), "TWO").await.unwrap();

        let Json(file) = handle_file(State(state.clone()), Path("a.warc".into())).await.unwrap();
        assert_eq!(file.checksum.as_deref(), Some("A"));
        assert!(file.replicas.iter().all(|r| r.checksum_status == ChecksumStatus::Ok));

        let stored = engine.store().file_statuses("a.warc").await.unwrap();
        assert!(stored.iter().all(|r| r.checksum_status == ChecksumStatus::Ok));
    }

    #[tokio::test]
    async fn test_repair_preconditions() {
        let state = state();
        let engine = state.monitor.engine().clone();
        engine.update_checksum_for_file("a.warc", Some("A"), "ONE").await.unwrap();
        engine.update_checksum_for_file("a.warc", None, "TWO").await.unwrap();

        // ONE holds the only copy and it is good
        let err = handle_correct(
            State(state.clone()),
            Path(("ONE".into(), "a.warc".into())),
            Json(CorrectRequest { credentials: "secret".into() }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        // ONE is not missing the file
        let err = handle_upload(State(state.clone()), Path(("ONE".into(), "a.warc".into())))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        // TWO is missing it and the good copy on ONE is unreachable
        let err = handle_upload(State(state.clone()), Path(("TWO".into(), "a.warc".into())))
            .await
            .unwrap_err();
        assert!(matches!(err.0, Error::Transport(_)));
        assert_eq!(state.monitor.repair().pending().await, 0);

        let err = handle_upload(State(state.clone()), Path(("NOPE".into(), "a.warc".into())))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_failed_repair_maps_to_bad_gateway() {
        let reply = CorrectionReply {
            ok: false,
            removed_file: None,
            error: Some("wrong credentials".into()),
        };
        let err = repair_response("a.warc".into(), "ONE".into(), reply).unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);

        let reply = CorrectionReply {
            ok: true,
            removed_file: Some(b"rotten".to_vec()),
            error: None,
        };
        let Json(done) = repair_response("a.warc".into(), "ONE".into(), reply).unwrap();
        assert_eq!(done.removed_bytes, Some(6));
    }

    #[tokio::test]
    async fn test_not_found_errors() {
        let state = state();
        let err = handle_file(State(state.clone()), Path("nope".into())).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = handle_missing(State(state.clone()), Path("NOPE".into())).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let Json(batches) = handle_batches(State(state)).await.unwrap();
        assert_eq!(batches.in_flight, 0);
        assert_eq!(batches.corrections_pending, 0);
        assert!(batches.corrections.is_empty());
    }
}
