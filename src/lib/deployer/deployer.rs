use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::join_all;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::ports::PortProbe;
use super::repo::{BUILD_DESCRIPTOR, RepoFetcher, validate_url};
use super::types::{
    BuiltImage, Deployment, LaunchedContainer, PortStatus, RunningDeployment,
};
use crate::config::DeployConfig;
use crate::container::runner::tail_chars;
use crate::container::{ContainerEngine, ContainerSpec};
use crate::error::{ContainerError, DeployError};
use crate::tasks::{DeploymentInfo, Task, TaskStore, TaskUpdate};

const STOP_GRACE: Duration = Duration::from_secs(10);
const BUILD_LOG_LIMIT: usize = 10_000;
const BUILD_ERROR_LIMIT: usize = 2_000;
const STARTUP_LOG_LINES: usize = 100;
const EXITED_MESSAGE: &str = "deployment container exited unexpectedly";

pub const TASK_LABEL: &str = "r_dispatch.task-id";

#[derive(Default)]
struct DeployState {
    containers: HashMap<String, Deployment>,
    ports: BTreeSet<u16>,
}

enum Ending {
    Stopped,
    Exited,
}

/// Clones, builds and runs repositories as long-lived containers, each on its
/// own host port, and tears them down when their time-to-live runs out.
pub struct Deployer {
    engine: Arc<dyn ContainerEngine>,
    fetcher: Arc<dyn RepoFetcher>,
    probe: Arc<dyn PortProbe>,
    store: Arc<dyn TaskStore>,
    config: DeployConfig,
    state: Arc<Mutex<DeployState>>,
    /// Woken whenever a teardown finishes, successfully or not.
    settled: Arc<Notify>,
    stop_ticker: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Deployer {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        fetcher: Arc<dyn RepoFetcher>,
        probe: Arc<dyn PortProbe>,
        store: Arc<dyn TaskStore>,
        config: DeployConfig,
    ) -> Self {
        Self {
            engine,
            fetcher,
            probe,
            store,
            config,
            state: Arc::new(Mutex::new(DeployState::default())),
            settled: Arc::new(Notify::new()),
            stop_ticker: watch::channel(false).0,
            ticker: Mutex::new(None),
        }
    }

    /// Full pipeline for a `github-deploy` task: validate, allocate a port,
    /// clone, build, run.
    pub async fn deploy(&self, task: &Task) -> Result<DeploymentInfo, DeployError> {
        let repo_url = task
            .param("repoUrl")
            .or_else(|| task.param("githubUrl"))
            .ok_or_else(|| DeployError::MissingRepoUrl {
                task_id: task.id.clone(),
            })?;
        validate_url(&repo_url)?;

        let task_id = task.id.as_str();
        let port = self.allocate_port().await?;
        let built = match self.clone_and_build(&repo_url, task_id).await {
            Ok(built) => built,
            Err(e) => {
                self.release_port(port).await;
                return Err(e);
            }
        };

        // From here on `run_container` owns the port and releases it itself.
        let launched = match self.run_container(&built.image_name, task_id, port).await {
            Ok(launched) => launched,
            Err(e) => {
                remove_image_quietly(self.engine.as_ref(), &built.image_name).await;
                return Err(e);
            }
        };

        info!(
            task_id,
            container = %short_id(&launched.container_id),
            url = %launched.public_url,
            "Deployment running"
        );
        Ok(DeploymentInfo {
            repo_url,
            public_url: Some(launched.public_url),
            container_id: Some(launched.container_id),
            port: Some(port),
            image_id: Some(built.image_name),
            scheduled_stop_time: Some(launched.scheduled_stop_at),
            is_running: true,
            build_logs: Some(tail_chars(&built.build_logs, BUILD_LOG_LIMIT).to_string()),
        })
    }

    async fn clone_and_build(&self, repo_url: &str, task_id: &str) -> Result<BuiltImage, DeployError> {
        let clone_dir = self.clone_repository(repo_url, task_id).await?;
        self.build_image(&clone_dir, task_id).await
    }

    /// Claims the first port in range that is neither held by another
    /// deployment nor in use on the host.
    pub async fn allocate_port(&self) -> Result<u16, DeployError> {
        let mut from = self.config.base_port;
        loop {
            // Reserve under the lock, check the host outside it.
            let candidate = {
                let mut state = self.state.lock().await;
                let Some(port) =
                    (from..self.config.max_port).find(|port| !state.ports.contains(port))
                else {
                    return Err(DeployError::NoPortAvailable {
                        base: self.config.base_port,
                        max: self.config.max_port,
                    });
                };
                state.ports.insert(port);
                port
            };

            if self.probe.is_available(candidate).await {
                info!(port = candidate, "Allocated port");
                return Ok(candidate);
            }

            debug!(port = candidate, "Port in use on host, skipping");
            self.state.lock().await.ports.remove(&candidate);
            from = candidate.saturating_add(1);
        }
    }

    pub async fn release_port(&self, port: u16) {
        if self.state.lock().await.ports.remove(&port) {
            info!(port, "Released port");
        }
    }

    /// Shallow-clones `url` into `<workdir>/<task_id>` and checks for a
    /// `Dockerfile` at its root. The directory is removed on failure.
    pub async fn clone_repository(&self, url: &str, task_id: &str) -> Result<PathBuf, DeployError> {
        let clone_dir = self.config.workdir.join(task_id);

        let result = async {
            tokio::fs::create_dir_all(&clone_dir).await?;
            self.fetcher.fetch(url, &clone_dir).await?;
            if !tokio::fs::try_exists(clone_dir.join(BUILD_DESCRIPTOR)).await? {
                anyhow::bail!("{BUILD_DESCRIPTOR} not found at repository root");
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(task_id, dir = %clone_dir.display(), "Repository cloned");
                Ok(clone_dir)
            }
            Err(e) => {
                remove_dir(&clone_dir).await;
                Err(DeployError::Clone {
                    task_id: task_id.to_string(),
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    /// Builds `gh-deploy-<id8>` from `clone_dir`, then removes `clone_dir`.
    ///
    /// A failed build is fatal only when its output shows real errors; either
    /// way the image has to exist afterwards.
    pub async fn build_image(&self, clone_dir: &Path, task_id: &str) -> Result<BuiltImage, DeployError> {
        let image_name = image_name(task_id);
        let result = self.build_checked(clone_dir, task_id, &image_name).await;
        remove_dir(clone_dir).await;
        result
    }

    async fn build_checked(
        &self,
        clone_dir: &Path,
        task_id: &str,
        image_name: &str,
    ) -> Result<BuiltImage, DeployError> {
        let build_error = |reason: String| DeployError::Build {
            task_id: task_id.to_string(),
            reason,
        };

        let build = tokio::time::timeout(
            self.config.build_timeout,
            self.engine.build_image(clone_dir, image_name),
        )
        .await;
        let output = match build {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(build_error(e.to_string())),
            Err(_) => {
                remove_image_quietly(self.engine.as_ref(), image_name).await;
                return Err(build_error(format!(
                    "timed out after {:?}",
                    self.config.build_timeout
                )));
            }
        };

        if !output.succeeded && has_real_errors(&output.output) {
            error!(task_id, image = image_name, "Image build failed");
            remove_image_quietly(self.engine.as_ref(), image_name).await;
            return Err(build_error(
                tail_chars(output.output.trim(), BUILD_ERROR_LIMIT).to_string(),
            ));
        }

        match self.engine.image_exists(image_name).await {
            Ok(true) => {
                if output.succeeded {
                    info!(task_id, image = image_name, "Image built");
                } else {
                    warn!(task_id, image = image_name, "Image built with warnings");
                }
                Ok(BuiltImage {
                    image_name: image_name.to_string(),
                    build_logs: output.output,
                })
            }
            Ok(false) => Err(build_error(format!(
                "image {image_name} was not created"
            ))),
            Err(e) => Err(build_error(format!(
                "could not inspect image {image_name}: {e}"
            ))),
        }
    }

    /// Starts the built image detached with `port` published. On failure any
    /// created container is removed first and the port released last.
    pub async fn run_container(
        &self,
        image_name: &str,
        task_id: &str,
        port: u16,
    ) -> Result<LaunchedContainer, DeployError> {
        let mut created: Option<String> = None;
        let result = self.launch(image_name, task_id, port, &mut created).await;

        if result.is_err() {
            if let Some(id) = &created {
                if let Err(e) = self.engine.remove_container(id).await {
                    error!(container = %short_id(id), error = %e, "Failed to clean up container");
                } else {
                    info!(container = %short_id(id), "Cleaned up failed container");
                }
            }
            self.release_port(port).await;
        }
        result
    }

    async fn launch(
        &self,
        image_name: &str,
        task_id: &str,
        port: u16,
        created: &mut Option<String>,
    ) -> Result<LaunchedContainer, DeployError> {
        match self.engine.image_exists(image_name).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(DeployError::ImageNotFound {
                    task_id: task_id.to_string(),
                    image: image_name.to_string(),
                });
            }
            Err(e) => return Err(classify_run_error(task_id, image_name, port, e.to_string())),
        }

        if !self.probe.is_available(port).await {
            return Err(DeployError::PortConflict {
                task_id: task_id.to_string(),
                port,
                reason: "port became unavailable before container start".to_string(),
            });
        }

        let spec = ContainerSpec::new(image_name)
            .network(self.config.network.clone())
            .port(port, self.config.container_port)
            .label(TASK_LABEL, task_id);

        let id = self
            .engine
            .create_container(image_name, &spec)
            .await
            .map_err(|e| classify_run_error(task_id, image_name, port, e.to_string()))?;
        *created = Some(id.clone());

        self.engine
            .start_container(&id)
            .await
            .map_err(|e| classify_run_error(task_id, image_name, port, e.to_string()))?;

        tokio::time::sleep(self.config.settle_delay).await;

        let running = self.engine.is_running(&id).await.unwrap_or(false);
        if !running {
            let reason = match self.engine.container_logs(&id, Some(STARTUP_LOG_LINES)).await {
                Ok(logs) => {
                    error!(task_id, logs = %logs, "Container failed to start");
                    format!("container exited during startup. Check logs: {logs}")
                }
                Err(_) => "container failed to start and logs could not be retrieved".to_string(),
            };
            return Err(DeployError::Run {
                task_id: task_id.to_string(),
                reason,
            });
        }

        let scheduled_stop = Instant::now() + self.config.ttl;
        let now = Utc::now();
        let scheduled_stop_at = TimeDelta::from_std(self.config.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.state.lock().await.containers.insert(
            id.clone(),
            Deployment {
                task_id: task_id.to_string(),
                port,
                image_name: image_name.to_string(),
                stopping: false,
                scheduled_stop,
                scheduled_stop_at,
            },
        );

        Ok(LaunchedContainer {
            container_id: id,
            public_url: format!("http://{}:{}", self.config.public_host, port),
            scheduled_stop_at,
        })
    }

    /// Stops and removes a tracked deployment, removes its image and releases
    /// its port. Returns `Ok(false)` for containers that are not tracked.
    pub async fn stop_container(&self, container_id: &str) -> Result<bool, DeployError> {
        self.teardown(container_id, Ending::Stopped).await
    }

    async fn teardown(&self, container_id: &str, ending: Ending) -> Result<bool, DeployError> {
        let deployment = {
            let mut state = self.state.lock().await;
            match state.containers.get_mut(container_id) {
                Some(d) if !d.stopping => {
                    d.stopping = true;
                    d.clone()
                }
                Some(_) => {
                    debug!(container = %short_id(container_id), "Teardown already in progress");
                    return Ok(false);
                }
                None => {
                    warn!(container = %container_id, "Container not found in running deployments");
                    return Ok(false);
                }
            }
        };

        // Detached, so a caller dropped mid-teardown cannot orphan the
        // container or leak its port.
        let job = Teardown {
            engine: self.engine.clone(),
            store: self.store.clone(),
            state: self.state.clone(),
            settled: self.settled.clone(),
            container_id: container_id.to_string(),
            deployment,
            ending,
        };
        match tokio::spawn(job.run()).await {
            Ok(result) => result.map(|()| true),
            Err(e) => {
                if let Some(d) = self.state.lock().await.containers.get_mut(container_id) {
                    d.stopping = false;
                }
                self.settled.notify_waiters();
                Err(DeployError::Teardown {
                    container_id: container_id.to_string(),
                    source: ContainerError::Engine(format!("teardown task failed: {e}")),
                })
            }
        }
    }

    /// One cleanup tick: stops expired deployments and tears down any whose
    /// container is no longer running. Failures are logged per entry.
    pub async fn reap_expired(&self) {
        let now = Instant::now();
        let (expired, live): (Vec<_>, Vec<_>) = {
            let state = self.state.lock().await;
            state
                .containers
                .iter()
                .filter(|(_, d)| !d.stopping)
                .map(|(id, d)| (id.clone(), d.scheduled_stop <= now))
                .partition(|(_, is_expired)| *is_expired)
        };

        for (id, _) in expired {
            match self.stop_container(&id).await {
                Ok(_) => info!(container = %short_id(&id), "Automatically stopped expired deployment"),
                Err(e) => error!(container = %short_id(&id), error = %e, "Failed to auto-stop deployment"),
            }
        }

        for (id, _) in live {
            match self.engine.is_running(&id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(container = %short_id(&id), "Deployment container is no longer running");
                    if let Err(e) = self.teardown(&id, Ending::Exited).await {
                        error!(container = %short_id(&id), error = %e, "Failed to clean up exited deployment");
                    }
                }
                Err(e) => debug!(container = %short_id(&id), error = %e, "Could not inspect deployment"),
            }
        }
    }

    /// Spawns the periodic cleanup tick. The task holds only a weak reference
    /// and ends once the deployer is dropped or shut down.
    pub async fn start_cleanup_timer(self: &Arc<Self>) {
        let deployer = Arc::downgrade(self);
        let period = self.config.cleanup_interval;
        let mut stop = self.stop_ticker.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if *stop.borrow_and_update() {
                    break;
                }
                // Only the wait is raced; a reap in progress always runs to the end.
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => break,
                }
                let Some(deployer) = deployer.upgrade() else {
                    break;
                };
                deployer.reap_expired().await;
            }
            debug!("Cleanup timer stopped");
        });

        if let Some(previous) = self.ticker.lock().await.replace(handle) {
            // Teardowns started by the old tick run detached and still finish.
            previous.abort();
        }
    }

    /// Stops the cleanup tick, waiting out a reap already in progress, then
    /// stops every tracked deployment concurrently and waits for teardowns
    /// started elsewhere to settle.
    pub async fn shutdown(&self) {
        self.stop_ticker.send_replace(true);
        let ticker = self.ticker.lock().await.take();
        if let Some(handle) = ticker {
            match handle.await {
                Err(e) if !e.is_cancelled() => error!(error = %e, "Cleanup timer failed"),
                _ => {}
            }
        }

        let ids: Vec<String> = self.state.lock().await.containers.keys().cloned().collect();
        info!(count = ids.len(), "Stopping all deployments");
        let results = join_all(ids.iter().map(|id| self.stop_container(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                error!(container = %short_id(id), error = %e, "Failed to stop deployment during shutdown");
            }
        }

        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if !self.state.lock().await.containers.values().any(|d| d.stopping) {
                break;
            }
            settled.await;
        }
    }

    pub async fn running_deployments(&self) -> Vec<RunningDeployment> {
        let now = Instant::now();
        let state = self.state.lock().await;
        let mut running: Vec<RunningDeployment> = state
            .containers
            .iter()
            .map(|(id, d)| RunningDeployment {
                container_id: short_id(id).to_string(),
                task_id: d.task_id.clone(),
                port: d.port,
                scheduled_stop_time: d.scheduled_stop_at,
                time_remaining_ms: d.scheduled_stop.saturating_duration_since(now).as_millis()
                    as u64,
            })
            .collect();
        running.sort_by_key(|d| d.port);
        running
    }

    pub async fn port_status(&self) -> PortStatus {
        let used_ports = self.state.lock().await.ports.iter().copied().collect();
        PortStatus {
            used_ports,
            running_containers: self.running_deployments().await,
        }
    }

    /// Whether `container_id` is a tracked deployment.
    pub async fn is_tracked(&self, container_id: &str) -> bool {
        self.state.lock().await.containers.contains_key(container_id)
    }

}

/// Engine work for one teardown, owned so it can run on its own task.
struct Teardown {
    engine: Arc<dyn ContainerEngine>,
    store: Arc<dyn TaskStore>,
    state: Arc<Mutex<DeployState>>,
    settled: Arc<Notify>,
    container_id: String,
    deployment: Deployment,
    ending: Ending,
}

impl Teardown {
    async fn run(self) -> Result<(), DeployError> {
        let result = self.stop_and_remove().await;
        self.settled.notify_waiters();
        result
    }

    async fn stop_and_remove(&self) -> Result<(), DeployError> {
        let id = self.container_id.as_str();
        if let Err(e) = self.engine.stop_container(id, STOP_GRACE).await {
            debug!(container = %short_id(id), error = %e, "Could not stop container");
        }
        if let Err(source) = self.engine.remove_container(id).await {
            // Keep tracking it so a later tick can retry.
            if let Some(d) = self.state.lock().await.containers.get_mut(id) {
                d.stopping = false;
            }
            return Err(DeployError::Teardown {
                container_id: id.to_string(),
                source,
            });
        }
        remove_image_quietly(self.engine.as_ref(), &self.deployment.image_name).await;

        {
            let mut state = self.state.lock().await;
            state.containers.remove(id);
            if state.ports.remove(&self.deployment.port) {
                info!(port = self.deployment.port, "Released port");
            }
        }
        info!(
            container = %short_id(id),
            task_id = %self.deployment.task_id,
            "Deployment stopped and cleaned up"
        );

        self.record_end().await;
        Ok(())
    }

    async fn record_end(&self) {
        let task_id = self.deployment.task_id.as_str();
        let deployment_info = match self.store.find_one(task_id).await {
            Ok(Some(task)) => task.deployment_info.map(|mut info| {
                info.is_running = false;
                info
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(task_id, error = %e, "Could not load deployment record");
                None
            }
        };

        let update = match self.ending {
            Ending::Stopped => TaskUpdate::stopped(deployment_info),
            Ending::Exited => TaskUpdate {
                deployment_info,
                ..TaskUpdate::failed(EXITED_MESSAGE)
            },
        };
        if let Err(e) = self.store.update(task_id, update).await {
            warn!(task_id, error = %e, "Could not persist deployment end");
        }
    }
}

async fn remove_image_quietly(engine: &dyn ContainerEngine, image_name: &str) {
    if let Err(e) = engine.remove_image(image_name).await {
        warn!(image = image_name, error = %e, "Failed to remove image");
    }
}

/// Deterministic image (and container) name for a task.
pub fn image_name(task_id: &str) -> String {
    let prefix: String = task_id.chars().take(8).collect();
    format!("gh-deploy-{prefix}").to_lowercase()
}

/// Whether build output contains errors rather than warnings alone.
pub fn has_real_errors(output: &str) -> bool {
    ["ERROR", "Error", "error:", "failed", "returned a non-zero code"]
        .iter()
        .any(|marker| output.contains(marker))
}

fn classify_run_error(task_id: &str, image_name: &str, port: u16, message: String) -> DeployError {
    let task_id = task_id.to_string();
    if ["port is already allocated", "bind failed", "address already in use"]
        .iter()
        .any(|m| message.contains(m))
    {
        warn!(task_id = %task_id, port, error = %message, "Port allocation failed");
        return DeployError::PortConflict {
            task_id,
            port,
            reason: message,
        };
    }
    if ["Unable to find image", "pull access denied", "No such image"]
        .iter()
        .any(|m| message.contains(m))
    {
        return DeployError::ImageNotFound {
            task_id,
            image: image_name.to_string(),
        };
    }
    DeployError::Run {
        task_id,
        reason: message,
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "Removed clone directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove clone directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_names_are_short_and_lowercase() {
        assert_eq!(
            image_name("3F2A9C1B-aaaa-bbbb-cccc-000000000000"),
            "gh-deploy-3f2a9c1b"
        );
        assert_eq!(image_name("abc"), "gh-deploy-abc");
    }

    #[test]
    fn warnings_alone_are_not_fatal() {
        assert!(!has_real_errors(
            "DEPRECATED: The legacy builder is deprecated\nStep 1/3 : FROM node:20"
        ));
        assert!(has_real_errors(
            "The command '/bin/sh -c npm ci' returned a non-zero code: 1"
        ));
        assert!(has_real_errors("npm ERROR! missing script: build"));
        assert!(has_real_errors("error: failed to solve"));
    }

    #[test]
    fn run_errors_are_classified() {
        let conflict = classify_run_error(
            "t1",
            "gh-deploy-t1",
            3001,
            "Bind for 0.0.0.0:3001 failed: port is already allocated".into(),
        );
        assert!(matches!(conflict, DeployError::PortConflict { port: 3001, .. }));

        let missing = classify_run_error("t1", "gh-deploy-t1", 3001, "No such image: gh".into());
        assert!(matches!(missing, DeployError::ImageNotFound { .. }));

        let other = classify_run_error("t1", "gh-deploy-t1", 3001, "oom".into());
        assert!(other.to_string().starts_with("[t1] run:"));
    }

    #[test]
    fn short_ids_never_panic() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
