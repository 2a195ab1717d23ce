//! HTTP API for remote control of supervised applications.
//!
//! Every route sits under `/api/v1` and sees the caller's [`Identity`] as a
//! request extension (see [`crate::caller`]). Lifecycle calls return as soon
//! as the supervisor accepted them; clients poll the application or its
//! logs to observe the outcome.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tailon_supervisor::{AppSnapshot, Identity, LogLine, Manager, Role, SupervisorError};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

use crate::auth::{self, Rule};
use crate::caller;

/// How often a log stream checks for new lines.
const LOG_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state for the API server
#[derive(Clone)]
pub struct ApiState {
    pub manager: Manager,
    pub default_role: Role,
    /// Cancelled when the daemon shuts down; ends open log streams.
    pub shutdown: CancellationToken,
}

/// Failed API request.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("access to application {0} denied")]
    Forbidden(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Supervisor(e) => match e {
                SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
                SupervisorError::AlreadyRunning(_) | SupervisorError::NotRunning(_) => {
                    StatusCode::CONFLICT
                }
                SupervisorError::SpawnFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                SupervisorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            },
        };
        if status.is_server_error() {
            warn!("Request failed: {self}");
        }
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// --- API Types ---

#[derive(Debug, Serialize, Deserialize)]
struct LifecycleResponse {
    status: String,
}

impl LifecycleResponse {
    fn new(status: &str) -> Json<Self> {
        Json(Self {
            status: status.to_string(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct StopParams {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
struct LogParams {
    #[serde(default)]
    stream: bool,
}

// --- Router ---

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/whoami", get(whoami))
        .route("/api/v1/apps", get(list_apps))
        .route("/api/v1/apps/:name", get(get_app))
        .route("/api/v1/apps/:name/start", post(start_app))
        .route("/api/v1/apps/:name/stop", post(stop_app))
        .route("/api/v1/apps/:name/restart", post(restart_app))
        .route("/api/v1/apps/:name/logs", get(get_logs))
        .layer(middleware::from_fn_with_state(state.clone(), caller::identify))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `listener` until `state.shutdown` is cancelled.
pub async fn serve(listener: TcpListener, state: ApiState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}

fn authorize(caller: &Identity, app: &str, rule: Rule) -> Result<(), ApiError> {
    if rule.allows(caller, app) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(app.to_string()))
    }
}

// --- Handlers ---

async fn whoami(Extension(caller): Extension<Identity>) -> Json<Identity> {
    Json(caller)
}

async fn list_apps(
    State(state): State<ApiState>,
    Extension(caller): Extension<Identity>,
) -> Json<BTreeMap<String, AppSnapshot>> {
    let apps = state
        .manager
        .get_apps()
        .await
        .into_iter()
        .filter_map(|(name, snap)| auth::visible_snapshot(&caller, snap).map(|s| (name, s)))
        .collect();
    Json(apps)
}

async fn get_app(
    State(state): State<ApiState>,
    Extension(caller): Extension<Identity>,
    Path(name): Path<String>,
) -> Result<Json<AppSnapshot>, ApiError> {
    authorize(&caller, &name, Rule::AppViewer)?;
    let snap = state.manager.get_app(&name).await?;
    auth::visible_snapshot(&caller, snap)
        .map(Json)
        .ok_or(ApiError::Forbidden(name))
}

async fn start_app(
    State(state): State<ApiState>,
    Extension(caller): Extension<Identity>,
    Path(name): Path<String>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    authorize(&caller, &name, Rule::AppOperator)?;
    state.manager.start_app(&caller, &name).await?;
    Ok(LifecycleResponse::new("started"))
}

async fn stop_app(
    State(state): State<ApiState>,
    Extension(caller): Extension<Identity>,
    Path(name): Path<String>,
    Query(params): Query<StopParams>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    authorize(&caller, &name, Rule::AppOperator)?;
    state.manager.stop_app(&caller, &name, params.force).await?;
    Ok(LifecycleResponse::new("stopped"))
}

async fn restart_app(
    State(state): State<ApiState>,
    Extension(caller): Extension<Identity>,
    Path(name): Path<String>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    authorize(&caller, &name, Rule::AppOperator)?;
    state.manager.restart_app(&caller, &name).await?;
    Ok(LifecycleResponse::new("restarted"))
}

async fn get_logs(
    State(state): State<ApiState>,
    Extension(caller): Extension<Identity>,
    Path(name): Path<String>,
    Query(params): Query<LogParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&caller, &name, Rule::AppViewer)?;
    let lines = state.manager.get_logs(&name).await?;

    let wants_stream = params.stream
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"));
    if wants_stream {
        return Ok(stream_logs(state, name, lines).into_response());
    }
    Ok(Json(lines).into_response())
}

/// Stream `initial` as server-sent events, then poll for newer lines until
/// the client disconnects or the daemon shuts down.
fn stream_logs(
    state: ApiState,
    name: String,
    initial: Vec<LogLine>,
) -> Sse<ReceiverStream<Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut last_seq = 0;
        let mut pending = initial;
        let mut ticker = tokio::time::interval(LOG_POLL_INTERVAL);
        ticker.tick().await;

        loop {
            for line in pending.drain(..) {
                last_seq = line.seq;
                let event = match Event::default().json_data(&line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(app = %name, "Failed to encode log line: {e}");
                        continue;
                    }
                };
                if tx.send(Ok(event)).await.is_err() {
                    debug!(app = %name, "Log stream client disconnected");
                    return;
                }
            }

            tokio::select! {
                _ = ticker.tick() => {}
                () = tx.closed() => return,
                () = state.shutdown.cancelled() => return,
            }

            pending = match state.manager.get_logs_since(&name, last_seq).await {
                Ok(lines) => lines,
                Err(e) => {
                    warn!(app = %name, "Log stream ended: {e}");
                    return;
                }
            };
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}
