#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use r_dispatch::config::DeployConfig;
use r_dispatch::container::{BuildOutput, ContainerEngine, ContainerSpec};
use r_dispatch::deployer::{PortProbe, RepoFetcher};
use r_dispatch::error::ContainerError;
use r_dispatch::tasks::{Task, TaskType};
use serde_json::{Map, json};

/// Knobs and recordings for [`FakeEngine`].
#[derive(Debug)]
pub struct EngineState {
    pub exit_code: i64,
    pub logs: String,
    pub hang: bool,
    pub fail_create: Option<String>,
    pub fail_stop: bool,
    pub fail_logs: bool,
    pub fail_remove: bool,
    /// Containers report not running right after start.
    pub exits_on_start: bool,
    /// Simulated latency of stop and image removal calls.
    pub stop_delay: Option<Duration>,
    pub remove_image_delay: Option<Duration>,
    pub build: BuildOutput,
    pub build_creates_image: bool,
    pub images: HashSet<String>,
    pub published: Vec<u16>,
    pub running: HashMap<String, bool>,

    pub created: Vec<(String, ContainerSpec)>,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub killed: Vec<String>,
    pub removed: Vec<String>,
    pub removed_images: Vec<String>,
    pub image_removals_started: usize,
    next_id: u64,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            exit_code: 0,
            logs: "done".into(),
            hang: false,
            fail_create: None,
            fail_stop: false,
            fail_logs: false,
            fail_remove: false,
            exits_on_start: false,
            stop_delay: None,
            remove_image_delay: None,
            build: BuildOutput {
                succeeded: true,
                output: "Step 1/2 : FROM node:20\nSuccessfully built".into(),
            },
            build_creates_image: true,
            images: HashSet::new(),
            published: Vec::new(),
            running: HashMap::new(),
            created: Vec::new(),
            started: Vec::new(),
            stopped: Vec::new(),
            killed: Vec::new(),
            removed: Vec::new(),
            removed_images: Vec::new(),
            image_removals_started: 0,
            next_id: 0,
        }
    }
}

/// In-process container engine. Nothing touches a real daemon.
#[derive(Default)]
pub struct FakeEngine {
    pub state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(configure: impl FnOnce(&mut EngineState)) -> Arc<Self> {
        let engine = Self::default();
        configure(&mut engine.state.lock().unwrap());
        Arc::new(engine)
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    /// Marks a container as exited behind the engine's back.
    pub fn exit(&self, id: &str) {
        self.state().running.insert(id.to_string(), false);
    }
}

fn engine_error(message: &str) -> ContainerError {
    ContainerError::Engine(message.to_string())
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn ensure_network(&self, _name: &str) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, ContainerError> {
        let mut state = self.state();
        if let Some(message) = &state.fail_create {
            return Err(engine_error(message));
        }
        state.next_id += 1;
        let id = format!("{:016x}{:048x}", state.next_id, 0);
        state.created.push((name.to_string(), spec.clone()));
        state.running.insert(id.clone(), false);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ContainerError> {
        let mut state = self.state();
        let running = !state.exits_on_start;
        state.running.insert(id.to_string(), running);
        state.started.push(id.to_string());
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ContainerError> {
        let (hang, code) = {
            let state = self.state();
            (state.hang, state.exit_code)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        self.exit(id);
        Ok(code)
    }

    async fn container_logs(
        &self,
        _id: &str,
        _tail: Option<usize>,
    ) -> Result<String, ContainerError> {
        let state = self.state();
        if state.fail_logs {
            return Err(engine_error("log stream closed"));
        }
        Ok(state.logs.clone())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), ContainerError> {
        let delay = self.state().stop_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if state.fail_stop {
            return Err(engine_error("stop refused"));
        }
        state.stopped.push(id.to_string());
        state.running.insert(id.to_string(), false);
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), ContainerError> {
        let mut state = self.state();
        state.killed.push(id.to_string());
        state.running.insert(id.to_string(), false);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), ContainerError> {
        let mut state = self.state();
        if state.fail_remove {
            return Err(engine_error("removal in progress"));
        }
        state.removed.push(id.to_string());
        state.running.remove(id);
        Ok(())
    }

    async fn is_running(&self, id: &str) -> Result<bool, ContainerError> {
        Ok(self.state().running.get(id).copied().unwrap_or(false))
    }

    async fn published_ports(&self) -> Result<Vec<u16>, ContainerError> {
        Ok(self.state().published.clone())
    }

    async fn build_image(&self, context: &Path, tag: &str) -> Result<BuildOutput, ContainerError> {
        assert!(
            context.join("Dockerfile").exists(),
            "build context must hold a Dockerfile"
        );
        let mut state = self.state();
        if state.build_creates_image {
            state.images.insert(tag.to_string());
        }
        Ok(state.build.clone())
    }

    async fn pull_image(&self, image: &str) -> Result<(), ContainerError> {
        self.state().images.insert(image.to_string());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, ContainerError> {
        Ok(self.state().images.contains(image))
    }

    async fn remove_image(&self, image: &str) -> Result<(), ContainerError> {
        let delay = {
            let mut state = self.state();
            state.image_removals_started += 1;
            state.remove_image_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.images.remove(image);
        state.removed_images.push(image.to_string());
        Ok(())
    }
}

/// Writes a tiny repository into the destination instead of cloning.
#[derive(Default)]
pub struct FakeFetcher {
    pub without_dockerfile: bool,
    pub fail: bool,
    pub fetched: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RepoFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        self.fetched.lock().unwrap().push(url.to_string());
        if self.fail {
            anyhow::bail!("repository not found");
        }
        tokio::fs::write(dest.join("index.js"), "console.log('hi')").await?;
        if !self.without_dockerfile {
            tokio::fs::write(dest.join("Dockerfile"), "FROM node:20\nCMD node index.js").await?;
        }
        Ok(())
    }
}

/// Every port is free unless marked busy.
#[derive(Default)]
pub struct FakeProbe {
    pub busy: Mutex<HashSet<u16>>,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn occupy(&self, port: u16) {
        self.busy.lock().unwrap().insert(port);
    }
}

#[async_trait]
impl PortProbe for FakeProbe {
    async fn is_available(&self, port: u16) -> bool {
        !self.busy.lock().unwrap().contains(&port)
    }
}

pub fn deploy_config(workdir: &Path) -> DeployConfig {
    DeployConfig {
        base_port: 3000,
        max_port: 3005,
        ttl: Duration::from_secs(3600),
        cleanup_interval: Duration::from_secs(60),
        settle_delay: Duration::ZERO,
        workdir: workdir.to_path_buf(),
        network: None,
        ..DeployConfig::default()
    }
}

pub fn deploy_task(repo_url: &str) -> Task {
    let params: Map<String, serde_json::Value> =
        serde_json::from_value(json!({ "repoUrl": repo_url })).unwrap();
    Task::new(TaskType::GithubDeploy, params)
}
