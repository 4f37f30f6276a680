//! Host port availability checks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::debug;

use crate::container::ContainerEngine;

const BIND_TIMEOUT: Duration = Duration::from_secs(2);
const TCP_LISTEN_STATE: &str = "0A";

#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_available(&self, port: u16) -> bool;
}

/// Layered probe: kernel listening sockets, then ports published by running
/// containers, then a bind-and-release on the configured interface. The bind
/// test decides; the first two only short-circuit.
pub struct SystemPortProbe {
    engine: Arc<dyn ContainerEngine>,
    bind_host: String,
}

impl SystemPortProbe {
    pub fn new(engine: Arc<dyn ContainerEngine>, bind_host: impl Into<String>) -> Self {
        Self {
            engine,
            bind_host: bind_host.into(),
        }
    }

    async fn listening_ports() -> HashSet<u16> {
        let mut ports = HashSet::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(contents) = tokio::fs::read_to_string(table).await {
                ports.extend(parse_listening_ports(&contents));
            }
        }
        ports
    }

    async fn bind_test(&self, port: u16) -> bool {
        match tokio::time::timeout(BIND_TIMEOUT, TcpListener::bind((self.bind_host.as_str(), port)))
            .await
        {
            Ok(Ok(listener)) => {
                drop(listener);
                true
            }
            Ok(Err(e)) => {
                debug!(port, error = %e, "Bind test failed");
                false
            }
            Err(_) => {
                debug!(port, "Bind test timed out");
                false
            }
        }
    }
}

#[async_trait]
impl PortProbe for SystemPortProbe {
    async fn is_available(&self, port: u16) -> bool {
        if Self::listening_ports().await.contains(&port) {
            debug!(port, "Port is in use (listening socket)");
            return false;
        }

        match self.engine.published_ports().await {
            Ok(published) if published.contains(&port) => {
                debug!(port, "Port is in use by a container");
                return false;
            }
            Ok(_) => {}
            Err(e) => debug!(port, error = %e, "Could not list container ports"),
        }

        self.bind_test(port).await
    }
}

/// Local ports in LISTEN state from a `/proc/net/tcp{,6}` table.
pub fn parse_listening_ports(table: &str) -> Vec<u16> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            if *state != TCP_LISTEN_STATE {
                return None;
            }
            let (_, port_hex) = local.rsplit_once(':')?;
            u16::from_str_radix(port_hex, 16).ok()
        })
        .collect()
}
