//! Error types for the dispatch engine.

use std::time::Duration;

use crate::tasks::types::{State, TaskType};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Deployment error: {0}")]
    Deploy(#[from] DeployError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Work queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Queue entry could not be decoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Task record store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: State, to: State },

    #[error("Task {id} already exists")]
    Duplicate { id: String },

    #[error("Database error: {0}")]
    Backend(String),

    #[error("Task record could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Container engine and runner errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Container API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("Container {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Container {name} exited with code {code}: {logs}")]
    NonZeroExit { name: String, code: i64, logs: String },

    #[error("Container engine error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Deployment orchestration errors. Every variant past validation names the
/// task and the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Invalid repository URL {url:?}: expected https://github.com/<owner>/<repo>[.git]")]
    InvalidUrl { url: String },

    #[error("Task {task_id} has no repository URL parameter")]
    MissingRepoUrl { task_id: String },

    #[error("No available ports in range {base}..{max}")]
    NoPortAvailable { base: u16, max: u16 },

    #[error("[{task_id}] clone: failed to clone repository or Dockerfile not found: {reason}")]
    Clone { task_id: String, reason: String },

    #[error("[{task_id}] build: docker build failed: {reason}")]
    Build { task_id: String, reason: String },

    #[error("[{task_id}] run: port {port} allocation failed: {reason}")]
    PortConflict {
        task_id: String,
        port: u16,
        reason: String,
    },

    #[error("[{task_id}] run: docker image {image} not found, build may have failed")]
    ImageNotFound { task_id: String, image: String },

    #[error("[{task_id}] run: failed to run container: {reason}")]
    Run { task_id: String, reason: String },

    #[error("Failed to tear down container {container_id}: {source}")]
    Teardown {
        container_id: String,
        #[source]
        source: ContainerError,
    },
}

/// Errors raised by task handlers before any container work happens.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("No handler registered for task type {0}")]
    NoHandler(TaskType),

    #[error("Task {id} has no input file")]
    MissingInput { id: String },

    #[error("Invalid parameters for task {id}: {reason}")]
    InvalidParameters { id: String, reason: String },

    #[error("Task {id} handler panicked")]
    Panicked { id: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
