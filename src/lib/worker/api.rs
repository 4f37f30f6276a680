use std::future::Future;

use axum::{
    Json, Router,
    extract::{Path, State as AxumState},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::stats::get_stats;
use super::types::{ApiState, NewTask, TaskServer};
use crate::tasks::Task;

impl TaskServer {
    pub fn new(state: ApiState, address: &str) -> Self {
        Self {
            state,
            address: address.to_string(),
        }
    }

    /// Serves until `shutdown` resolves.
    pub async fn start_server<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.address).await?;
        info!(address = %self.address, "TaskServer listening");
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/tasks", post(create_task))
        .route("/tasks/{id}", get(get_task))
        .route("/health", get(health))
        .route("/deployments", get(list_deployments))
        .route("/deployments/{container_id}", delete(stop_deployment))
        .with_state(state)
}

async fn create_task(
    AxumState(state): AxumState<ApiState>,
    Json(body): Json<NewTask>,
) -> impl IntoResponse {
    let mut task = Task::new(body.task_type, body.parameters);
    task.input_file = body.input_file;

    if let Err(e) = state.store.insert(&task).await {
        error!(task_id = %task.id, error = %e, "Failed to store task");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        );
    }
    if let Err(e) = state.queue.enqueue(&task).await {
        error!(task_id = %task.id, error = %e, "Failed to enqueue task");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        );
    }

    info!(task_id = %task.id, task_type = %task.task_type, "Task queued");
    (StatusCode::CREATED, Json(json!(task)))
}

async fn get_task(
    AxumState(state): AxumState<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.find_one(&id).await {
        Ok(Some(task)) => (StatusCode::OK, Json(json!(task))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Task with id {id} not found") })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn health(AxumState(state): AxumState<ApiState>) -> impl IntoResponse {
    let queue = match state.queue.stats().await {
        Ok(stats) => json!(stats),
        Err(e) => {
            warn!(error = %e, "Queue stats unavailable");
            json!({ "error": e.to_string() })
        }
    };
    let engine = match state.engine.ping().await {
        Ok(()) => json!({ "reachable": true }),
        Err(e) => json!({ "reachable": false, "error": e.to_string() }),
    };
    let deployments = state.deployer.running_deployments().await.len();

    let host = {
        let mut sys = state.sysinfo.lock().await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        get_stats(&sys, deployments as u64)
    };

    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "queue": queue,
        "engine": engine,
        "host": host,
    }))
}

async fn list_deployments(AxumState(state): AxumState<ApiState>) -> impl IntoResponse {
    Json(state.deployer.port_status().await)
}

async fn stop_deployment(
    AxumState(state): AxumState<ApiState>,
    Path(container_id): Path<String>,
) -> impl IntoResponse {
    match state.deployer.stop_container(&container_id).await {
        Ok(true) => {
            info!(container = %container_id, "Deployment stopped on request");
            (
                StatusCode::OK,
                format!("Deployment {container_id} stopped"),
            )
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            format!("Deployment {container_id} not found"),
        ),
        Err(e) => {
            error!(container = %container_id, error = %e, "Failed to stop deployment");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
