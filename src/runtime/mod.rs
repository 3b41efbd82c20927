//! Container runtimes
//!
//! The orchestrator drives containers through [`ContainerRuntime`]. Two
//! backends exist: [`DockerCliRuntime`] shells out to a local `docker`
//! binary, and [`MemoryRuntime`] keeps containers in memory with named
//! volumes on disk, for dry runs and tests.

pub mod docker;
pub mod memory;

pub use docker::DockerCliRuntime;
pub use memory::MemoryRuntime;

use crate::build::BuildPlan;
use crate::compose::mounts::Mount;
use crate::compose::ports::PortBinding;
use crate::error::Result;
use crate::supervisor::RestartPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Label carrying the project a container belongs to
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
/// Label carrying the service a container runs
pub const SERVICE_LABEL: &str = "com.docker.compose.service";
/// Label holding the digest of the configuration a container was created from
pub const CONFIG_HASH_LABEL: &str = "com.docker.compose.config-hash";

/// Container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created but never started
    Created,
    Running,
    /// Being restarted by the runtime
    Restarting,
    Paused,
    /// Process has exited
    Exited,
    /// Failed to stop or remove cleanly
    Dead,
}

impl ContainerStatus {
    /// Map a status string as reported by docker
    pub fn from_docker(status: &str) -> Self {
        match status {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "restarting" => ContainerStatus::Restarting,
            "paused" => ContainerStatus::Paused,
            "exited" => ContainerStatus::Exited,
            _ => ContainerStatus::Dead,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Restarting => write!(f, "restarting"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Health check state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No health check configured
    None,
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn from_docker(status: &str) -> Self {
        match status {
            "starting" => HealthStatus::Starting,
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::None,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::None => write!(f, "-"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check as handed to a runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbe {
    /// Probe command; a single element is run through the shell
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

/// Everything a runtime needs to create one service container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name, unique on the host
    pub name: String,
    /// Service the container runs
    pub service: String,
    /// Image reference or built image tag
    pub image: String,
    /// Command override, image default when empty
    pub command: Vec<String>,
    /// Entrypoint override
    pub entrypoint: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<Mount>,
    pub labels: BTreeMap<String, String>,
    /// Project network the container joins
    pub network: Option<String>,
    /// Names the container answers to on the network
    pub aliases: Vec<String>,
    pub restart: Option<RestartPolicy>,
    pub healthcheck: Option<HealthProbe>,
}

impl ContainerSpec {
    /// Minimal spec for `service` running `image`
    pub fn new(name: &str, service: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            service: service.to_string(),
            image: image.to_string(),
            command: Vec::new(),
            entrypoint: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            ports: Vec::new(),
            mounts: Vec::new(),
            labels: BTreeMap::new(),
            network: None,
            aliases: Vec::new(),
            restart: None,
            healthcheck: None,
        }
    }
}

/// Observed state of a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub service: String,
    pub image: String,
    pub status: ContainerStatus,
    pub health: HealthStatus,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Restarts performed so far
    pub restart_count: u32,
    pub ports: Vec<PortBinding>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

/// Operations the orchestrator needs from a container backend
///
/// Implementations must be `Send + Sync`; the orchestrator starts the
/// services of a wave from concurrent tasks.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Whether the backend applies restart policies itself
    fn applies_restart_policy(&self) -> bool;

    /// Execute a prepared build and return the image reference to run.
    /// A failing recipe step is a [`crate::BerthError::Build`].
    async fn build_image(&self, plan: &BuildPlan) -> Result<String>;

    /// Whether an image is available locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Content id of a local image, `None` when it is not present
    async fn image_id(&self, image: &str) -> Result<Option<String>>;

    /// Create the named volume unless it exists; `true` when created
    async fn ensure_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<bool>;

    /// Delete the named volume and its data
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Create the project network unless it exists
    async fn ensure_network(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Whether the binding's host port can be taken
    async fn port_available(&self, binding: &PortBinding) -> Result<bool>;

    /// Create a container, returning its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, name: &str) -> Result<()>;

    /// Stop a running container, killing it after `timeout`
    async fn stop(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Remove a stopped container
    async fn remove(&self, name: &str) -> Result<()>;

    /// Current state, `None` when no such container exists
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>>;

    /// All containers labelled with `project`, sorted by name
    async fn list(&self, project: &str) -> Result<Vec<ContainerState>>;
}

/// Probe that checks the host port by binding it
pub(crate) async fn host_port_free(binding: &PortBinding) -> bool {
    let Some(port) = binding.host_port else {
        return true;
    };
    let ip = binding.host_ip.as_deref().unwrap_or("0.0.0.0");
    let addr = if ip.contains(':') {
        format!("[{}]:{}", ip, port)
    } else {
        format!("{}:{}", ip, port)
    };
    match binding.protocol {
        crate::compose::ports::Protocol::Tcp => tokio::net::TcpListener::bind(&addr).await.is_ok(),
        crate::compose::ports::Protocol::Udp => tokio::net::UdpSocket::bind(&addr).await.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ContainerStatus::from_docker("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_docker("exited"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::from_docker("removing"), ContainerStatus::Dead);
        assert_eq!(HealthStatus::from_docker("healthy"), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_docker(""), HealthStatus::None);
    }

    #[tokio::test]
    async fn test_ephemeral_binding_always_free() {
        let binding = PortBinding {
            host_ip: None,
            host_port: None,
            container_port: 80,
            protocol: Default::default(),
        };
        assert!(host_port_free(&binding).await);
    }

    #[tokio::test]
    async fn test_bound_port_is_taken() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let binding = PortBinding {
            host_ip: Some("127.0.0.1".to_string()),
            host_port: Some(port),
            container_port: port,
            protocol: Default::default(),
        };
        assert!(!host_port_free(&binding).await);
    }
}
