use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::engine::ContainerEngine;
use super::types::{ContainerSpec, RunOutput};
use crate::error::ContainerError;

pub const LOGS_UNAVAILABLE: &str = "Logs unavailable";

/// Trailing log characters embedded in a non-zero exit error.
const ERROR_LOG_TAIL: usize = 4000;

/// Runs one-shot containers with a wall-clock limit and guaranteed cleanup.
pub struct ContainerRunner {
    engine: Arc<dyn ContainerEngine>,
    stop_grace: Duration,
    // name -> container id for everything not yet cleaned up.
    active: Mutex<HashMap<String, String>>,
}

impl ContainerRunner {
    pub fn new(engine: Arc<dyn ContainerEngine>, stop_grace: Duration) -> Self {
        Self {
            engine,
            stop_grace,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub async fn active_containers(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Runs `spec` to completion, failing on timeout or a non-zero exit code.
    /// The container is stopped and removed on every path.
    pub async fn run_container(
        &self,
        spec: &ContainerSpec,
        timeout: Duration,
    ) -> Result<RunOutput, ContainerError> {
        let name = container_name();
        info!(container = %name, image = %spec.image, "Starting container");

        let id = self.engine.create_container(&name, spec).await?;
        self.active.lock().await.insert(name.clone(), id.clone());

        let result = self.execute(&name, &id, timeout).await;
        if let Err(e) = &result {
            error!(container = %name, error = %e, "Container failed");
        }
        self.cleanup(&name).await;
        result
    }

    async fn execute(
        &self,
        name: &str,
        id: &str,
        timeout: Duration,
    ) -> Result<RunOutput, ContainerError> {
        self.engine.start_container(id).await?;

        // Whichever branch loses is dropped, which cancels it.
        let exit_code = tokio::select! {
            code = self.engine.wait_container(id) => code?,
            _ = tokio::time::sleep(timeout) => {
                return Err(ContainerError::Timeout {
                    name: name.to_string(),
                    timeout,
                });
            }
        };

        let logs = match self.engine.container_logs(id, None).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(container = %name, error = %e, "Could not retrieve container logs");
                LOGS_UNAVAILABLE.to_string()
            }
        };
        info!(container = %name, exit_code, "Container completed");
        debug!(container = %name, logs = %logs, "Container logs");

        if exit_code != 0 {
            return Err(ContainerError::NonZeroExit {
                name: name.to_string(),
                code: exit_code,
                logs: tail_chars(&logs, ERROR_LOG_TAIL).to_string(),
            });
        }

        Ok(RunOutput {
            success: true,
            logs,
            exit_code,
        })
    }

    /// Stops (or kills) and force-removes the container registered as `name`.
    /// Failures are logged only; calling it for an unknown name does nothing.
    pub async fn cleanup(&self, name: &str) {
        let Some(id) = self.active.lock().await.remove(name) else {
            return;
        };

        if let Err(stop_err) = self.engine.stop_container(&id, self.stop_grace).await {
            debug!(container = %name, error = %stop_err, "Could not stop container");
            if let Err(kill_err) = self.engine.kill_container(&id).await {
                debug!(container = %name, error = %kill_err, "Could not kill container");
            }
        }

        match self.engine.remove_container(&id).await {
            Ok(()) => debug!(container = %name, "Removed container"),
            Err(e) => debug!(container = %name, error = %e, "Could not remove container"),
        }
    }

    /// Cleans up every container still registered.
    pub async fn cleanup_all(&self) {
        let names: Vec<String> = self.active.lock().await.keys().cloned().collect();
        if !names.is_empty() {
            info!(count = names.len(), "Cleaning up remaining containers");
        }
        for name in names {
            self.cleanup(&name).await;
        }
    }

    /// Pulls `image` unless the engine already has it.
    pub async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        if self.engine.image_exists(image).await? {
            return Ok(());
        }
        self.engine.pull_image(image).await
    }
}

fn container_name() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(9)
        .collect();
    format!("task_{millis}_{suffix}")
}

/// Last `max` characters of `s`, on a char boundary.
pub(crate) fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
