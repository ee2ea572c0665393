//! The RPC facade: a thin HTTPS translation layer over the supervision core.
//!
//! Request validation and field defaulting live here; everything stateful is
//! delegated to the supervisor task, the build store and the log sink.
//! Validation failures are 4xx and never recorded as per-port launch errors.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path as FsPath, PathBuf};
use std::time::Duration;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use siegeup_core::builds::BuildStore;
use siegeup_core::logs;
use siegeup_core::settings::DesiredServer;
use siegeup_core::supervisor::{SupervisorError, SupervisorHandle};

use crate::stats::{self, CpuTracker};

/// Upper bound on an uploaded archive body.
const MAX_UPLOAD_BYTES: usize = 2 * 1024 * 1024 * 1024;

/// Multipart field carrying the build archive.
const UPLOAD_FIELD: &str = "gameZip";

/// Shared state of the facade handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Command handle to the supervisor task.
    pub supervisor: SupervisorHandle,
    /// Build-version store.
    pub builds: BuildStore,
    /// Root of the per-port log directories.
    pub logs_root: PathBuf,
    /// Short git hash of the agent, computed once at startup.
    pub commit: String,
    /// CPU usage tracker polled by `/status`.
    pub cpu: CpuTracker,
}

/// Builds the facade router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/launch", post(launch))
        .route("/upload", post(upload))
        .route("/restart", post(restart))
        .route("/purge", post(purge))
        .route("/update", post(update))
        .route("/logs/:port", get(logs_tail))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Facade error, rendered as `{"error": <message>}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Request rejected by validation.
    #[error("{0}")]
    BadRequest(String),

    /// Referenced resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Unexpected failure; the detail stays in the server log, the client
    /// gets an opaque correlation reference.
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Internal(detail) => {
                let reference = rand::thread_rng().gen_range(100_000..=999_999);
                error!(reference, "internal error: {detail}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal error (ref {reference})"),
                )
            },
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::UnknownPort(port) => {
                Self::NotFound(format!("No server configured on port {port}"))
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct OkBody {
    ok: bool,
}

const OK: OkBody = OkBody { ok: true };

/// One server entry as submitted to `/launch`; optional fields are defaulted
/// here before the set reaches the core.
#[derive(Debug, Deserialize)]
struct IncomingServer {
    name: Option<String>,
    visible: Option<bool>,
    version: String,
    port: u16,
    args: Option<Vec<String>>,
    run: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct LaunchRequest {
    servers: Vec<IncomingServer>,
}

async fn launch(
    State(state): State<AppState>,
    Json(request): Json<LaunchRequest>,
) -> Result<Json<OkBody>, ApiError> {
    let servers = desired_from_request(request.servers)?;
    info!(servers = servers.len(), "desired set submitted");
    state.supervisor.apply_servers(servers).await?;
    Ok(Json(OK))
}

fn desired_from_request(servers: Vec<IncomingServer>) -> Result<Vec<DesiredServer>, ApiError> {
    let mut seen = HashSet::new();
    if !servers.iter().all(|s| seen.insert(s.port)) {
        return Err(ApiError::BadRequest(
            "Duplicate port detected in servers array".to_string(),
        ));
    }
    Ok(servers
        .into_iter()
        .enumerate()
        .map(|(i, s)| DesiredServer {
            name: s
                .name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| format!("Server {}", i + 1)),
            version: s.version,
            port: s.port,
            args: s.args.unwrap_or_default(),
            visible: s.visible.unwrap_or(true),
            run: s.run.unwrap_or(true),
        })
        .collect())
}

#[derive(Debug, Serialize)]
struct UploadBody {
    ok: bool,
    version: String,
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadBody>, ApiError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {e}")))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let version = version_from_filename(field.file_name());

        std::fs::create_dir_all(state.builds.root())
            .map_err(|e| ApiError::Internal(format!("cannot create build root: {e}")))?;
        let mut archive = tempfile::NamedTempFile::new_in(state.builds.root())
            .map_err(|e| ApiError::Internal(format!("cannot create upload temp file: {e}")))?;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Upload interrupted: {e}")))?
        {
            archive
                .write_all(&chunk)
                .map_err(|e| ApiError::Internal(format!("cannot spool upload: {e}")))?;
        }

        state
            .builds
            .ingest(&version, archive.path())
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to extract archive: {e}")))?;
        return Ok(Json(UploadBody { ok: true, version }));
    }
    Err(ApiError::BadRequest(format!("Missing {UPLOAD_FIELD} field")))
}

/// Version id for an upload: the archive base name without extension, or a
/// timestamped fallback when the client sent no usable name.
fn version_from_filename(file_name: Option<&str>) -> String {
    let stem = file_name
        .map(FsPath::new)
        .and_then(FsPath::file_stem)
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    if stem.is_empty() {
        format!("archive_{}", Utc::now().timestamp_millis())
    } else {
        stem
    }
}

#[derive(Debug, Deserialize)]
struct RestartQuery {
    port: u16,
}

async fn restart(
    State(state): State<AppState>,
    Query(query): Query<RestartQuery>,
) -> Result<Json<OkBody>, ApiError> {
    state.supervisor.restart(query.port).await?;
    Ok(Json(OK))
}

#[derive(Debug, Serialize)]
struct PurgeBody {
    ok: bool,
    purged: Vec<String>,
}

async fn purge(State(state): State<AppState>) -> Result<Json<PurgeBody>, ApiError> {
    let purged = state.supervisor.purge().await?;
    Ok(Json(PurgeBody { ok: true, purged }))
}

async fn update(State(state): State<AppState>) -> Json<OkBody> {
    info!("self-update requested; stopping all servers and exiting");
    let supervisor = state.supervisor.clone();
    tokio::spawn(async move {
        // Give the transport a moment to flush the acknowledgement.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = supervisor.stop_all().await;
        std::process::exit(0);
    });
    Json(OK)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    index: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogTailBody {
    name: String,
    size: u64,
    content: String,
}

async fn logs_tail(
    State(state): State<AppState>,
    Path(port): Path<u16>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogTailBody>, ApiError> {
    let index = query.index.unwrap_or(0);
    let tail = logs::tail(&state.logs_root, port, index)
        .await
        .map_err(|e| ApiError::Internal(format!("log read failed: {e}")))?
        .ok_or_else(|| ApiError::NotFound(format!("No log at index {index} for port {port}")))?;
    Ok(Json(LogTailBody {
        name: tail.file_name,
        size: tail.size,
        content: tail.content,
    }))
}

#[derive(Debug, Serialize)]
struct ServerEntry {
    #[serde(flatten)]
    server: DesiredServer,
    pid: Option<u32>,
    running: bool,
    #[serde(rename = "memoryMB")]
    memory_mb: u64,
    commit: String,
    #[serde(rename = "launchError")]
    launch_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    hostname: String,
    platform: String,
    #[serde(rename = "totalMemMB")]
    total_mem_mb: u64,
    #[serde(rename = "usedMemMB")]
    used_mem_mb: u64,
    #[serde(rename = "cpuUsage")]
    cpu_usage: f64,
    servers: Vec<ServerEntry>,
    archives: Vec<String>,
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusBody>, ApiError> {
    let observed = state.supervisor.status().await?;
    let memory = stats::read_memory().unwrap_or_default();
    let archives = state
        .builds
        .list()
        .map_err(|e| ApiError::Internal(format!("cannot list builds: {e}")))?;

    let servers = observed
        .into_iter()
        .map(|s| ServerEntry {
            memory_mb: s.pid.map(stats::process_rss_mb).unwrap_or(0),
            pid: s.pid,
            running: s.running,
            commit: state.commit.clone(),
            launch_error: s.launch_error,
            server: s.server,
        })
        .collect();

    Ok(Json(StatusBody {
        hostname: stats::hostname(),
        platform: std::env::consts::OS.to_string(),
        total_mem_mb: memory.total_mb,
        used_mem_mb: memory.used_mb,
        cpu_usage: state.cpu.usage_percent(),
        servers,
        archives,
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn test_state(dir: &FsPath) -> AppState {
        let builds = BuildStore::new(dir.join("builds"));
        AppState {
            supervisor: siegeup_core::supervisor::spawn(dir.to_path_buf(), builds.clone()),
            builds,
            logs_root: dir.join("logs"),
            commit: "abc1234".to_string(),
            cpu: CpuTracker::new(),
        }
    }

    fn json_request(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_version_from_filename() {
        assert_eq!(version_from_filename(Some("build.zip")), "build");
        assert_eq!(version_from_filename(Some("v2")), "v2");
        assert!(version_from_filename(Some("")).starts_with("archive_"));
        assert!(version_from_filename(None).starts_with("archive_"));
    }

    #[test]
    fn test_defaulting_fills_names_and_flags() {
        let incoming = vec![
            IncomingServer {
                name: None,
                visible: None,
                version: "v1".to_string(),
                port: 9001,
                args: None,
                run: None,
            },
            IncomingServer {
                name: Some("Lobby".to_string()),
                visible: Some(false),
                version: "v2".to_string(),
                port: 9002,
                args: Some(vec!["--map".to_string()]),
                run: Some(false),
            },
        ];
        let servers = desired_from_request(incoming).unwrap();
        assert_eq!(servers[0].name, "Server 1");
        assert!(servers[0].visible);
        assert!(servers[0].run);
        assert!(servers[0].args.is_empty());
        assert_eq!(servers[1].name, "Lobby");
        assert!(!servers[1].run);
    }

    #[tokio::test]
    async fn test_launch_rejects_duplicate_ports_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let body = r#"{"servers":[
            {"version":"v1","port":9001},
            {"version":"v2","port":9001}
        ]}"#;
        let response = app
            .clone()
            .oneshot(json_request("/launch", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Duplicate port detected in servers array");

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["servers"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_restart_unknown_port_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app
            .oneshot(json_request("/restart?port=4242", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logs_unknown_port_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app
            .oneshot(Request::builder().uri("/logs/9001").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_reports_desired_set_shape() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let body = r#"{"servers":[{"version":"v1","port":9001,"args":["--map","island"],"run":false}]}"#;
        let response = app
            .clone()
            .oneshot(json_request("/launch", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;

        assert!(json["hostname"].is_string());
        assert!(json["totalMemMB"].is_u64());
        let server = &json["servers"][0];
        assert_eq!(server["name"], "Server 1");
        assert_eq!(server["port"], 9001);
        assert_eq!(server["running"], false);
        assert_eq!(server["commit"], "abc1234");
        assert_eq!(server["memoryMB"], 0);
        assert!(server["pid"].is_null());
    }

    #[tokio::test]
    async fn test_purge_reports_removed_versions() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        std::fs::create_dir_all(state.builds.root().join("v-old")).unwrap();
        let app = router(state);

        let response = app.oneshot(json_request("/purge", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["purged"][0], "v-old");
    }
}
