use crate::db;
use crate::errors::{AppError, AppResult};
use crate::executor::JobExecutor;
use crate::insight_tree::load_insight_tree;
use crate::models::JobStatus;
use crate::worker::{Worker, WorkerHandle};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared state of the trigger server. `worker` is `None` when the process
/// cannot host a background loop.
pub struct ApiState {
    executor: JobExecutor,
    worker: Option<Worker>,
    running: Mutex<Option<WorkerHandle>>,
}

impl ApiState {
    pub fn new(executor: JobExecutor, worker: Option<Worker>) -> Self {
        Self {
            executor,
            worker,
            running: Mutex::new(None),
        }
    }

    /// Starts the worker unless it is already running. Returns false when no
    /// worker is configured.
    pub async fn start_worker(&self) -> bool {
        let Some(worker) = &self.worker else {
            return false;
        };
        let mut running = self.running.lock().await;
        if running.as_ref().map_or(true, WorkerHandle::is_finished) {
            *running = Some(worker.start());
        }
        true
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.running.lock().await.take() {
            handle.stop().await;
        }
    }

    async fn run_job(&self, job_id: &str) -> AppResult<JobStatus> {
        let lookup_id = job_id.to_string();
        let job = db::blocking(self.executor.database(), move |db| db.get_job(&lookup_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;
        let root_id = job.insight_id.clone();
        match db::blocking(self.executor.database(), move |db| load_insight_tree(db, &root_id)).await {
            Ok(tree) => self.executor.process_job(&job, Some(tree)).await,
            Err(AppError::NotFound(_)) => self.executor.process_job(&job, None).await,
            Err(error) => self.executor.record_failure(&job, &error).await,
        }
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs/{id}/run", post(run_job))
        .route("/worker/start", post(start_worker))
        .with_state(state)
}

/// Serves until Ctrl-C, then stops a running worker.
pub async fn serve(state: Arc<ApiState>, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "trigger api listening");
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %error, "failed to listen for shutdown signal");
            }
        })
        .await?;
    state.shutdown().await;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn run_job(State(state): State<Arc<ApiState>>, Path(job_id): Path<String>) -> Response {
    match state.run_job(&job_id).await {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({ "status": "processed", "jobStatus": status })),
        )
            .into_response(),
        Err(AppError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "job not found" }))).into_response()
        }
        Err(error) => {
            tracing::warn!(job_id = %job_id, error = %error, "manual job run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": error.to_string() })),
            )
                .into_response()
        }
    }
}

async fn start_worker(State(state): State<Arc<ApiState>>) -> Response {
    if state.start_worker().await {
        (StatusCode::OK, Json(json!({ "started": true }))).into_response()
    } else {
        (
            StatusCode::NOT_IMPLEMENTED,
            Json(json!({ "error": "this deployment cannot run a background worker" })),
        )
            .into_response()
    }
}
