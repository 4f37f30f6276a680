use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Semaphore, watch};

use super::handlers::HandlerRegistry;
use crate::config::DispatchConfig;
use crate::container::ContainerEngine;
use crate::deployer::Deployer;
use crate::queue::WorkQueue;
use crate::tasks::{DeploymentInfo, FileRef, TaskStore, TaskType};

/// Process-wide consumer: claims tasks, caps concurrency, routes by type.
pub struct Dispatcher {
    pub(super) queue: Arc<dyn WorkQueue>,
    pub(super) store: Arc<dyn TaskStore>,
    pub(super) handlers: Arc<HandlerRegistry>,
    pub(super) config: DispatchConfig,
    pub(super) permits: Arc<Semaphore>,
    pub(super) shutdown: watch::Sender<bool>,
}

/// What a handler produced for a successful task.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub output_file: Option<FileRef>,
    /// Set for deployments; the task then moves to `running`.
    pub deployment: Option<DeploymentInfo>,
}

#[derive(Deserialize, Debug)]
pub struct HostStats {
    pub cpu_usage: f32,
    pub total_memory: u64,
    pub used_memory: u64,
    pub total_swap: u64,
    pub used_swap: u64,
    pub system_name: String,
    pub hostname: String,
    pub total_cpus: u64,
    pub disk_usage: f32,
    pub task_count: u64,
}

/// Shared state behind the control API.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub deployer: Arc<Deployer>,
    pub engine: Arc<dyn ContainerEngine>,
    pub sysinfo: Arc<Mutex<sysinfo::System>>,
    pub started_at: Instant,
}

pub struct TaskServer {
    pub state: ApiState,
    pub address: String,
}

/// Body of `POST /tasks`.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub input_file: Option<FileRef>,
}
