use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
        ListContainersOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions, WaitContainerOptions,
    },
    errors::Error as BollardError,
    image::{BuildImageOptions, CreateImageOptions, RemoveImageOptions},
    models::{HostConfig, PortBinding},
    network::{CreateNetworkOptions, ListNetworksOptions},
};
use futures_util::stream::StreamExt;
use tracing::{debug, info};

use super::engine::ContainerEngine;
use super::types::{BuildOutput, ContainerSpec};
use crate::error::ContainerError;

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Docker daemon reached over its unix socket.
#[derive(Clone)]
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connects to the daemon at `socket`, pings it and logs its version.
    pub async fn connect(socket: &str) -> Result<Self, ContainerError> {
        let client = Docker::connect_with_unix(socket, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?;
        client.ping().await?;
        let version = client.version().await?;
        info!(
            socket,
            version = version.version.as_deref().unwrap_or("unknown"),
            api_version = version.api_version.as_deref().unwrap_or("unknown"),
            "Connected to Docker daemon"
        );
        Ok(Self { client })
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

async fn pack_context(context: PathBuf) -> Result<Vec<u8>, ContainerError> {
    tokio::task::spawn_blocking(move || {
        let mut archive = tar::Builder::new(Vec::new());
        archive.append_dir_all(".", &context)?;
        archive.into_inner()
    })
    .await
    .map_err(|e| ContainerError::Engine(format!("build context packing aborted: {e}")))?
    .map_err(ContainerError::from)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), ContainerError> {
        self.client.ping().await?;
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), ContainerError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let networks = self
            .client
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;

        // The name filter matches substrings.
        if networks.iter().any(|n| n.name.as_deref() == Some(name)) {
            debug!(network = name, "Network already exists");
            return Ok(());
        }

        self.client
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await?;
        info!(network = name, "Created network");
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, ContainerError> {
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .iter()
            .map(|mapping| {
                (
                    format!("{}/tcp", mapping.container),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(mapping.host.to_string()),
                    }]),
                )
            })
            .collect();
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .iter()
            .map(|mapping| (format!("{}/tcp", mapping.container), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            network_mode: spec.network.clone(),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: spec.cmd.clone(),
            labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        });

        let response = self
            .client
            .create_container(options, container_config)
            .await?;
        for warning in &response.warnings {
            debug!(container = name, warning = %warning, "Create warning");
        }
        debug!(container = name, id = %response.id, image = %spec.image, "Container created");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ContainerError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ContainerError> {
        let mut stream = self.client.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits arrive as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(ContainerError::Engine(format!(
                "wait stream for {id} ended without an exit status"
            ))),
        }
    }

    async fn container_logs(
        &self,
        id: &str,
        tail: Option<usize>,
    ) -> Result<String, ContainerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
            ..Default::default()
        };

        let mut stream = self.client.logs(id, Some(options));
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            logs.push_str(&chunk?.to_string());
        }
        Ok(logs)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), ContainerError> {
        self.client
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await?;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), ContainerError> {
        self.client
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), ContainerError> {
        match self
            .client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already gone.
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_running(&self, id: &str) -> Result<bool, ContainerError> {
        match self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(details
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn published_ports(&self) -> Result<Vec<u16>, ContainerError> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        let mut ports: Vec<u16> = containers
            .iter()
            .flat_map(|c| c.ports.iter().flatten())
            .filter_map(|p| p.public_port)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        Ok(ports)
    }

    async fn build_image(&self, context: &Path, tag: &str) -> Result<BuildOutput, ContainerError> {
        let archive = pack_context(context.to_path_buf()).await?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        info!(image = tag, context = %context.display(), "Building image");
        let mut stream = self.client.build_image(options, None, Some(archive.into()));
        let mut output = String::new();
        let mut succeeded = true;
        while let Some(event) = stream.next().await {
            match event {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        debug!(image = tag, "{}", line.trim_end());
                        output.push_str(&line);
                    }
                    if let Some(error) = info.error {
                        succeeded = false;
                        output.push_str(&error);
                        output.push('\n');
                    }
                }
                Err(e) => {
                    succeeded = false;
                    output.push_str(&e.to_string());
                    output.push('\n');
                    break;
                }
            }
        }

        Ok(BuildOutput { succeeded, output })
    }

    async fn pull_image(&self, image: &str) -> Result<(), ContainerError> {
        info!(image, "Pulling image");
        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = stream.next().await {
            if let Some(status) = progress?.status {
                debug!(image, status = %status, "Pull progress");
            }
        }
        info!(image, "Image pulled");
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, ContainerError> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_image(&self, image: &str) -> Result<(), ContainerError> {
        self.client
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await?;
        Ok(())
    }
}
