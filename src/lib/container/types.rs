use std::collections::HashMap;

use serde::Serialize;

/// What to run: image, environment, mounts and network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    /// `host:container[:mode]` bind mounts.
    pub binds: Vec<String>,
    pub network: Option<String>,
    pub ports: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
    pub cmd: Option<Vec<String>>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: &str, value: impl AsRef<str>) -> Self {
        self.env.push(format!("{key}={}", value.as_ref()));
        self
    }

    pub fn bind(mut self, bind: impl Into<String>) -> Self {
        self.binds.push(bind.into());
        self
    }

    pub fn network(mut self, network: Option<String>) -> Self {
        self.network = network;
        self
    }

    pub fn port(mut self, host: u16, container: u16) -> Self {
        self.ports.push(PortMapping { host, container });
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Host TCP port published to a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    pub success: bool,
    pub logs: String,
    pub exit_code: i64,
}

/// Result of an image build stream. `succeeded` is false when the daemon
/// reported an error; `output` carries everything the build printed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    pub succeeded: bool,
    pub output: String,
}
