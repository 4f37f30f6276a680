use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// A running deployment as tracked by the deployer.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub task_id: String,
    pub port: u16,
    pub image_name: String,
    /// Set while a teardown is in flight; the entry stays tracked until the
    /// container is gone.
    pub stopping: bool,
    /// Expiry on the tokio clock; drives the cleanup tick.
    pub scheduled_stop: Instant,
    /// Same instant on the wall clock, for reporting.
    pub scheduled_stop_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub image_name: String,
    pub build_logs: String,
}

#[derive(Debug, Clone)]
pub struct LaunchedContainer {
    pub container_id: String,
    pub public_url: String,
    pub scheduled_stop_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningDeployment {
    /// Short (12 character) container id.
    pub container_id: String,
    pub task_id: String,
    pub port: u16,
    pub scheduled_stop_time: DateTime<Utc>,
    pub time_remaining_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortStatus {
    pub used_ports: Vec<u16>,
    pub running_containers: Vec<RunningDeployment>,
}
