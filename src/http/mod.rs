use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::rpc::{AgentAddr, StopOutcome};
use crate::scheduler::{Job, JobScheduler, SchedulerError};
use crate::shutdown::{FrontEnd, ShutdownError};
use crate::store::TaskLogStore;

#[derive(Clone)]
pub struct HttpState {
    pub scheduler: Arc<JobScheduler>,
    pub store: Arc<dyn TaskLogStore>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    accepting: bool,
    running: usize,
}

#[derive(Deserialize)]
struct StopRequest {
    id: i64,
    /// Defaults to the hosts recorded on the task log.
    #[serde(default)]
    hosts: Vec<AgentAddr>,
}

#[derive(Serialize)]
struct StopResponse {
    id: i64,
    signalled: usize,
    orphaned: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

pub fn router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/tasks/run", post(run_task_handler))
        .route("/api/task-logs/stop", post(stop_task_handler))
        .route("/api/task-logs/:id", get(get_task_log_handler))
        .layer(cors)
        .with_state(state)
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        accepting: state.scheduler.is_accepting(),
        running: state.scheduler.running(),
    })
}

async fn run_task_handler(State(state): State<HttpState>, Json(job): Json<Job>) -> Response {
    match state.scheduler.dispatch(job).await {
        Ok(log) => (StatusCode::ACCEPTED, Json(log)).into_response(),
        Err(e @ SchedulerError::ShuttingDown) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
        Err(e @ SchedulerError::InvalidJob(_)) => error_response(StatusCode::BAD_REQUEST, e),
        Err(e @ SchedulerError::Store(_)) => {
            tracing::error!(error = %e, "Failed to start task");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn stop_task_handler(
    State(state): State<HttpState>,
    Json(payload): Json<StopRequest>,
) -> Response {
    let hosts = if payload.hosts.is_empty() {
        match state.store.get(payload.id).await {
            Ok(Some(log)) => {
                let parsed: Result<Vec<AgentAddr>, _> =
                    log.hosts.iter().map(|h| h.parse::<AgentAddr>()).collect();
                match parsed {
                    Ok(hosts) => hosts,
                    Err(e) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
                }
            }
            Ok(None) => {
                return error_response(
                    StatusCode::NOT_FOUND,
                    format!("task log {} not found", payload.id),
                )
            }
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
        }
    } else {
        payload.hosts
    };

    let outcomes = state.scheduler.stop(payload.id, &hosts).await;
    let signalled = outcomes
        .iter()
        .filter(|o| **o == StopOutcome::Signalled)
        .count();

    Json(StopResponse {
        id: payload.id,
        signalled,
        orphaned: outcomes.len() - signalled,
    })
    .into_response()
}

async fn get_task_log_handler(State(state): State<HttpState>, Path(id): Path<i64>) -> Response {
    match state.store.get(id).await {
        Ok(Some(log)) => Json(log).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("task log {id} not found")),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// A running HTTP front end that the shutdown sequence can drain.
pub struct HttpServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
}

impl HttpServerHandle {
    pub async fn bind(addr: SocketAddr, state: HttpState) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::serve(listener, state)
    }

    pub fn serve(listener: TcpListener, state: HttpState) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let app = router(state);

        tracing::info!(addr = %local_addr, "Starting HTTP server");

        let signal = shutdown.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).with_graceful_shutdown(signal).await
        });

        Ok(Self {
            local_addr,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl FrontEnd for HttpServerHandle {
    async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.shutdown.cancel();
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        task.await??;
        tracing::info!(addr = %self.local_addr, "HTTP server stopped");
        Ok(())
    }
}
