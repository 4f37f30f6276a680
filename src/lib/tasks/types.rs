use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::state::valid_state_transition;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    ImageConvert,
    VideoTrim,
    PdfExtract,
    CsvAnalyze,
    GithubDeploy,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::ImageConvert,
        TaskType::VideoTrim,
        TaskType::PdfExtract,
        TaskType::CsvAnalyze,
        TaskType::GithubDeploy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ImageConvert => "image-convert",
            TaskType::VideoTrim => "video-trim",
            TaskType::PdfExtract => "pdf-extract",
            TaskType::CsvAnalyze => "csv-analyze",
            TaskType::GithubDeploy => "github-deploy",
        }
    }

    pub fn is_deployment(&self) -> bool {
        matches!(self, TaskType::GithubDeploy)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown task type: {s}"))
    }
}

/// Lifecycle status of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Pending,
    Processing,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Processing => "processing",
            State::Running => "running",
            State::Completed => "completed",
            State::Stopped => "stopped",
            State::Failed => "failed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
}

/// Deployment details carried by `github-deploy` tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentInfo {
    pub repo_url: String,
    pub public_url: Option<String>,
    pub container_id: Option<String>,
    pub port: Option<u16>,
    pub image_id: Option<String>,
    pub scheduled_stop_time: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub build_logs: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub status: State,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub input_file: Option<FileRef>,
    #[serde(default)]
    pub output_file: Option<FileRef>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub processing_time_ms: Option<u64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deployment_info: Option<DeploymentInfo>,
}

impl Task {
    pub fn new(task_type: TaskType, parameters: Map<String, Value>) -> Self {
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            task_type,
            status: State::Pending,
            progress: 0,
            input_file: None,
            output_file: None,
            parameters,
            error: None,
            processing_time_ms: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            deployment_info: None,
        }
    }

    pub fn with_input(mut self, input: FileRef) -> Self {
        self.input_file = Some(input);
        self
    }

    /// String form of a parameter; numbers and booleans are rendered as text.
    pub fn param(&self, key: &str) -> Option<String> {
        match self.parameters.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        }
    }

    /// Applies a partial update, rejecting status moves the state machine forbids.
    pub fn apply(&mut self, update: TaskUpdate) -> Result<(), StoreError> {
        if let Some(status) = update.status {
            if !valid_state_transition(self.task_type, &self.status, &status) {
                return Err(StoreError::InvalidTransition {
                    id: self.id.clone(),
                    from: self.status,
                    to: status,
                });
            }
            self.status = status;
        }
        if let Some(progress) = update.progress {
            self.progress = progress.min(100);
        }
        if update.output_file.is_some() {
            self.output_file = update.output_file;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        if update.processing_time_ms.is_some() {
            self.processing_time_ms = update.processing_time_ms;
        }
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
        if update.deployment_info.is_some() {
            self.deployment_info = update.deployment_info;
        }
        Ok(())
    }
}

/// Fields written on a status transition. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<State>,
    pub progress: Option<u8>,
    pub output_file: Option<FileRef>,
    pub error: Option<String>,
    pub processing_time_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deployment_info: Option<DeploymentInfo>,
}

impl TaskUpdate {
    pub fn processing(now: DateTime<Utc>) -> Self {
        TaskUpdate {
            status: Some(State::Processing),
            started_at: Some(now),
            progress: Some(0),
            ..Default::default()
        }
    }

    pub fn completed(output_file: Option<FileRef>, processing_time_ms: u64) -> Self {
        TaskUpdate {
            status: Some(State::Completed),
            progress: Some(100),
            output_file,
            processing_time_ms: Some(processing_time_ms),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn running(deployment: DeploymentInfo, processing_time_ms: u64) -> Self {
        TaskUpdate {
            status: Some(State::Running),
            progress: Some(100),
            processing_time_ms: Some(processing_time_ms),
            deployment_info: Some(deployment),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        TaskUpdate {
            status: Some(State::Failed),
            error: Some(error.into()),
            progress: Some(0),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn stopped(deployment: Option<DeploymentInfo>) -> Self {
        TaskUpdate {
            status: Some(State::Stopped),
            completed_at: Some(Utc::now()),
            deployment_info: deployment,
            ..Default::default()
        }
    }
}
