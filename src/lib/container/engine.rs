use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::types::{BuildOutput, ContainerSpec};
use crate::error::ContainerError;

/// Narrow adapter over a container engine. Everything above it
/// (runner, deployer) is engine-agnostic.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn ping(&self) -> Result<(), ContainerError>;

    /// Creates a bridge network named `name` unless it already exists.
    async fn ensure_network(&self, name: &str) -> Result<(), ContainerError>;

    /// Returns the new container's id.
    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, ContainerError>;

    async fn start_container(&self, id: &str) -> Result<(), ContainerError>;

    /// Resolves with the exit code once the container stops running.
    async fn wait_container(&self, id: &str) -> Result<i64, ContainerError>;

    /// Combined stdout/stderr with timestamps. `tail` limits to the last lines.
    async fn container_logs(&self, id: &str, tail: Option<usize>)
    -> Result<String, ContainerError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), ContainerError>;

    async fn kill_container(&self, id: &str) -> Result<(), ContainerError>;

    /// Forced removal.
    async fn remove_container(&self, id: &str) -> Result<(), ContainerError>;

    async fn is_running(&self, id: &str) -> Result<bool, ContainerError>;

    /// Host ports currently published by running containers.
    async fn published_ports(&self) -> Result<Vec<u16>, ContainerError>;

    /// Builds `context` (which must hold a `Dockerfile`) into an image tagged `tag`.
    async fn build_image(&self, context: &Path, tag: &str) -> Result<BuildOutput, ContainerError>;

    async fn pull_image(&self, image: &str) -> Result<(), ContainerError>;

    async fn image_exists(&self, image: &str) -> Result<bool, ContainerError>;

    async fn remove_image(&self, image: &str) -> Result<(), ContainerError>;
}
