//! JSON status API for the monitor.
//!
//! ## Endpoints
//!
//! - `GET /api/status` - uptime, backend count and running jobs
//! - `GET /api/backends` - every backend with its jobs' latest status
//! - `GET /api/backends/{host}/jobs/{id}` - one job's latest snapshot and coordinator state
//! - `GET /api/backends/{host}/jobs/{id}/progress` - live progress of a running job
//! - `POST /api/backends/{host}/jobs/{id}/run` - start a run in the background (202)
//! - `POST /api/backends/{host}/jobs/{id}/refresh` - refresh now and return the snapshot

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::context::AppContext;
use crate::core::{CoordinatorHandle, CoordinatorStatus, StatusSnapshot};
use crate::registry::Backend;
use crate::service::ServiceError;

/// Web server for the status API.
pub struct WebServer {
    bind_addr: SocketAddr,
    ctx: AppContext,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebServer {
    pub fn new(ctx: AppContext, bind_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            bind_addr,
            ctx,
            shutdown_tx,
        }
    }

    /// Bind and serve. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "Status API listening");
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, router(self.ctx.clone()))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/api/status", get(daemon_status))
        .route("/api/backends", get(list_backends))
        .route("/api/backends/{host}/jobs/{id}", get(job_status))
        .route("/api/backends/{host}/jobs/{id}/progress", get(job_progress))
        .route("/api/backends/{host}/jobs/{id}/run", post(run_job))
        .route("/api/backends/{host}/jobs/{id}/refresh", post(refresh_job))
        .with_state(ctx)
}

enum WebError {
    NotFound(String),
    Upstream(String),
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            WebError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            WebError::Upstream(message) => (StatusCode::BAD_GATEWAY, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ServiceError> for WebError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::UnknownJob { .. } => WebError::NotFound(error.to_string()),
            other => WebError::Upstream(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct JobView {
    job_id: String,
    status: Option<CoordinatorStatus>,
    snapshot: Option<Arc<StatusSnapshot>>,
}

impl JobView {
    async fn of(handle: &CoordinatorHandle) -> Self {
        Self {
            job_id: handle.job_id().to_string(),
            status: handle.status().await.ok(),
            snapshot: handle.latest(),
        }
    }
}

#[derive(Serialize)]
struct BackendView {
    host: String,
    jobs: Vec<JobView>,
}

fn backend(ctx: &AppContext, host: &str) -> Result<Arc<Backend>, WebError> {
    ctx.registry
        .get(host)
        .ok_or_else(|| WebError::NotFound(format!("Unknown server: {host}")))
}

fn coordinator<'a>(backend: &'a Backend, job_id: &str) -> Result<&'a CoordinatorHandle, WebError> {
    backend.service().coordinator(job_id).ok_or_else(|| {
        WebError::NotFound(format!("Job {job_id} is not monitored on {}", backend.host()))
    })
}

async fn daemon_status(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    let mut running = 0;
    for backend in ctx.registry.backends() {
        running += backend.progress().active_count().await;
    }
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "backends": ctx.registry.len(),
        "running_jobs": running,
    }))
}

async fn list_backends(State(ctx): State<AppContext>) -> Json<Vec<BackendView>> {
    let mut views = Vec::with_capacity(ctx.registry.len());
    for backend in ctx.registry.backends() {
        let mut jobs = Vec::new();
        for job_id in backend.service().job_ids() {
            if let Some(handle) = backend.service().coordinator(job_id) {
                jobs.push(JobView::of(handle).await);
            }
        }
        views.push(BackendView {
            host: backend.host().to_string(),
            jobs,
        });
    }
    Json(views)
}

async fn job_status(
    State(ctx): State<AppContext>,
    Path((host, job_id)): Path<(String, String)>,
) -> Result<Json<JobView>, WebError> {
    let backend = backend(&ctx, &host)?;
    let handle = coordinator(&backend, &job_id)?;
    Ok(Json(JobView::of(handle).await))
}

async fn job_progress(
    State(ctx): State<AppContext>,
    Path((host, job_id)): Path<(String, String)>,
) -> Result<Response, WebError> {
    let backend = backend(&ctx, &host)?;
    coordinator(&backend, &job_id)?;
    match backend.progress().get(&job_id).await {
        Some(progress) => Ok(Json(progress).into_response()),
        None => Err(WebError::NotFound(format!("Job {job_id} is not running"))),
    }
}

async fn run_job(
    State(ctx): State<AppContext>,
    Path((host, job_id)): Path<(String, String)>,
) -> Result<Response, WebError> {
    let backend = backend(&ctx, &host)?;
    coordinator(&backend, &job_id)?;

    let accepted = json!({ "host": &host, "job_id": &job_id, "accepted": true });
    tokio::spawn(async move {
        // Failures are already reported through the notification channel.
        let _ = backend.service().start_backup(&job_id).await;
    });
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

async fn refresh_job(
    State(ctx): State<AppContext>,
    Path((host, job_id)): Path<(String, String)>,
) -> Result<Json<Arc<StatusSnapshot>>, WebError> {
    let backend = backend(&ctx, &host)?;
    let snapshot = backend.service().refresh(&job_id).await?;
    Ok(Json(snapshot))
}
