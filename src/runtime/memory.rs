//! In-process runtime
//!
//! Containers are records in memory; named volumes are real directories
//! managed by [`VolumeManager`], so their contents outlive containers the
//! same way they would under docker. Nothing is executed: a started
//! container stays running until it is stopped or [`MemoryRuntime::crash`]
//! reports an exit.

use super::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus, HealthStatus, PROJECT_LABEL,
};
use crate::build::BuildPlan;
use crate::compose::mounts::Mount;
use crate::compose::ports::PortBinding;
use crate::error::{BerthError, Result};
use crate::storage::VolumeManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use uuid::Uuid;

fn poisoned<T>(_: T) -> BerthError {
    BerthError::Lock("runtime state lock poisoned".to_string())
}

/// Container record
#[derive(Debug)]
struct Container {
    id: String,
    spec: ContainerSpec,
    status: ContainerStatus,
    health: HealthStatus,
    exit_code: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    restart_count: u32,
    /// Position in the runtime-wide start sequence of the latest start
    start_seq: Option<u64>,
}

impl Container {
    fn new(spec: ContainerSpec) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            spec,
            status: ContainerStatus::Created,
            health: HealthStatus::None,
            exit_code: None,
            started_at: None,
            finished_at: None,
            restart_count: 0,
            start_seq: None,
        }
    }

    fn start(&mut self, healthy_on_start: bool, seq: u64) -> Result<()> {
        if self.status == ContainerStatus::Running {
            return Err(BerthError::ContainerAlreadyRunning(self.spec.name.clone()));
        }
        if self.started_at.is_some() {
            self.restart_count += 1;
        }
        self.status = ContainerStatus::Running;
        self.started_at = Some(Utc::now());
        self.start_seq = Some(seq);
        self.finished_at = None;
        self.exit_code = None;
        self.health = match (&self.spec.healthcheck, healthy_on_start) {
            (None, _) => HealthStatus::None,
            (Some(_), true) => HealthStatus::Healthy,
            (Some(_), false) => HealthStatus::Starting,
        };
        Ok(())
    }

    fn exit(&mut self, code: i32) {
        self.status = ContainerStatus::Exited;
        self.exit_code = Some(code);
        self.finished_at = Some(Utc::now());
        if self.health != HealthStatus::None {
            self.health = HealthStatus::Unhealthy;
        }
    }

    fn publishes(&self, binding: &PortBinding) -> bool {
        self.status == ContainerStatus::Running
            && self.spec.ports.iter().any(|p| {
                p.host_port.is_some() && p.host_port == binding.host_port && p.protocol == binding.protocol
            })
    }

    fn state(&self) -> ContainerState {
        ContainerState {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            service: self.spec.service.clone(),
            image: self.spec.image.clone(),
            status: self.status,
            health: self.health,
            exit_code: self.exit_code,
            started_at: self.started_at,
            finished_at: self.finished_at,
            restart_count: self.restart_count,
            ports: self.spec.ports.clone(),
            labels: self.spec.labels.clone(),
        }
    }
}

/// Runtime keeping container state in memory
pub struct MemoryRuntime {
    /// Containers indexed by name
    containers: RwLock<HashMap<String, Container>>,
    images: RwLock<HashSet<String>>,
    /// Image id behind each built reference
    image_ids: RwLock<HashMap<String, String>>,
    networks: RwLock<HashSet<String>>,
    volumes: VolumeManager,
    /// Host ports held by something outside the stack
    occupied_ports: RwLock<HashSet<u16>>,
    /// Recipe steps containing this text fail
    failing_step: RwLock<Option<String>>,
    healthy_on_start: RwLock<bool>,
    builds: RwLock<Vec<String>>,
    starts: AtomicU64,
}

impl MemoryRuntime {
    /// Create a runtime keeping volume data under `volume_dir`
    pub fn new(volume_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            containers: RwLock::new(HashMap::new()),
            images: RwLock::new(HashSet::new()),
            image_ids: RwLock::new(HashMap::new()),
            networks: RwLock::new(HashSet::new()),
            volumes: VolumeManager::new(volume_dir)?,
            occupied_ports: RwLock::new(HashSet::new()),
            failing_step: RwLock::new(None),
            healthy_on_start: RwLock::new(true),
            builds: RwLock::new(Vec::new()),
            starts: AtomicU64::new(0),
        })
    }

    /// Named volume storage
    pub fn volumes(&self) -> &VolumeManager {
        &self.volumes
    }

    /// Make every build whose RUN step contains `needle` fail
    pub fn fail_builds_matching(&self, needle: &str) -> Result<()> {
        *self.failing_step.write().map_err(poisoned)? = Some(needle.to_string());
        Ok(())
    }

    /// Mark a host port as taken by a foreign process
    pub fn occupy_port(&self, port: u16) -> Result<()> {
        self.occupied_ports.write().map_err(poisoned)?.insert(port);
        Ok(())
    }

    /// Whether containers with a health check report healthy as soon as
    /// they start. When off they stay `starting` until [`Self::set_health`].
    pub fn set_healthy_on_start(&self, healthy: bool) -> Result<()> {
        *self.healthy_on_start.write().map_err(poisoned)? = healthy;
        Ok(())
    }

    pub fn set_health(&self, name: &str, health: HealthStatus) -> Result<()> {
        let mut containers = self.containers.write().map_err(poisoned)?;
        let container = containers
            .get_mut(name)
            .ok_or_else(|| BerthError::ContainerNotFound(name.to_string()))?;
        container.health = health;
        Ok(())
    }

    /// Report that the container's process exited with `exit_code`
    pub fn crash(&self, name: &str, exit_code: i32) -> Result<()> {
        let mut containers = self.containers.write().map_err(poisoned)?;
        let container = containers
            .get_mut(name)
            .ok_or_else(|| BerthError::ContainerNotFound(name.to_string()))?;
        if container.status != ContainerStatus::Running {
            return Err(BerthError::ContainerNotRunning(name.to_string()));
        }
        container.exit(exit_code);
        tracing::debug!("Container {} exited with code {}", name, exit_code);
        Ok(())
    }

    /// Image ids built so far, in order
    pub fn builds(&self) -> Result<Vec<String>> {
        Ok(self.builds.read().map_err(poisoned)?.clone())
    }

    /// Containers ordered by their latest start, earliest first
    pub fn start_order(&self) -> Result<Vec<String>> {
        let containers = self.containers.read().map_err(poisoned)?;
        let mut started: Vec<(u64, &String)> = containers
            .values()
            .filter_map(|c| c.start_seq.map(|seq| (seq, &c.spec.name)))
            .collect();
        started.sort();
        Ok(started.into_iter().map(|(_, name)| name.clone()).collect())
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn applies_restart_policy(&self) -> bool {
        false
    }

    async fn build_image(&self, plan: &BuildPlan) -> Result<String> {
        let failing = self.failing_step.read().map_err(poisoned)?.clone();
        for step in plan.recipe.run_steps() {
            tracing::debug!("RUN {}", step);
            if let Some(needle) = &failing {
                if step.contains(needle.as_str()) {
                    return Err(BerthError::Build(format!(
                        "step 'RUN {}' exited with code 1",
                        step
                    )));
                }
            }
        }

        let reference = plan.primary_tag().to_string();
        let mut images = self.images.write().map_err(poisoned)?;
        images.insert(plan.image_id.clone());
        images.insert(reference.clone());
        self.image_ids
            .write()
            .map_err(poisoned)?
            .insert(reference.clone(), plan.image_id.clone());
        self.builds.write().map_err(poisoned)?.push(plan.image_id.clone());

        Ok(reference)
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.images.read().map_err(poisoned)?.contains(image))
    }

    async fn image_id(&self, image: &str) -> Result<Option<String>> {
        if !self.images.read().map_err(poisoned)?.contains(image) {
            return Ok(None);
        }
        let ids = self.image_ids.read().map_err(poisoned)?;
        Ok(Some(ids.get(image).cloned().unwrap_or_else(|| image.to_string())))
    }

    async fn ensure_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<bool> {
        let labels: HashMap<String, String> = labels.clone().into_iter().collect();
        let (_, created) = self.volumes.ensure(name, &labels)?;
        Ok(created)
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.volumes.remove(name, false)
    }

    async fn ensure_network(&self, name: &str, _labels: &BTreeMap<String, String>) -> Result<()> {
        self.networks.write().map_err(poisoned)?.insert(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.networks.write().map_err(poisoned)?.remove(name);
        Ok(())
    }

    async fn port_available(&self, binding: &PortBinding) -> Result<bool> {
        let Some(port) = binding.host_port else {
            return Ok(true);
        };
        if self.occupied_ports.read().map_err(poisoned)?.contains(&port) {
            return Ok(false);
        }
        let containers = self.containers.read().map_err(poisoned)?;
        Ok(!containers.values().any(|c| c.publishes(binding)))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        for mount in &spec.mounts {
            if let Mount::Volume { name, .. } = mount {
                self.volumes.get(name)?;
            }
        }
        if let Some(network) = &spec.network {
            if !self.networks.read().map_err(poisoned)?.contains(network) {
                return Err(BerthError::Runtime(format!("network {} not found", network)));
            }
        }

        let mut containers = self.containers.write().map_err(poisoned)?;
        if containers.contains_key(&spec.name) {
            return Err(BerthError::ContainerExists(spec.name.clone()));
        }

        for name in spec.mounts.iter().filter_map(Mount::volume_name) {
            self.volumes.add_reference(name)?;
        }
        self.images.write().map_err(poisoned)?.insert(spec.image.clone());

        let container = Container::new(spec.clone());
        let id = container.id.clone();
        containers.insert(spec.name.clone(), container);
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        let healthy = *self.healthy_on_start.read().map_err(poisoned)?;
        let occupied = self.occupied_ports.read().map_err(poisoned)?.clone();
        let mut containers = self.containers.write().map_err(poisoned)?;

        let ports = containers
            .get(name)
            .ok_or_else(|| BerthError::ContainerNotFound(name.to_string()))?
            .spec
            .ports
            .clone();
        for binding in &ports {
            let Some(port) = binding.host_port else {
                continue;
            };
            if occupied.contains(&port) {
                return Err(BerthError::PortConflict {
                    port,
                    owner: "a process outside the stack".to_string(),
                });
            }
            if let Some(owner) = containers
                .values()
                .find(|c| c.spec.name != name && c.publishes(binding))
            {
                return Err(BerthError::PortConflict {
                    port,
                    owner: owner.spec.name.clone(),
                });
            }
        }

        let container = containers
            .get_mut(name)
            .ok_or_else(|| BerthError::ContainerNotFound(name.to_string()))?;
        container.start(healthy, self.starts.fetch_add(1, Ordering::SeqCst))
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<()> {
        let mut containers = self.containers.write().map_err(poisoned)?;
        let container = containers
            .get_mut(name)
            .ok_or_else(|| BerthError::ContainerNotFound(name.to_string()))?;
        if container.status != ContainerStatus::Running {
            return Err(BerthError::ContainerNotRunning(name.to_string()));
        }
        container.exit(0);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut containers = self.containers.write().map_err(poisoned)?;
        let container = containers
            .get(name)
            .ok_or_else(|| BerthError::ContainerNotFound(name.to_string()))?;
        if container.status == ContainerStatus::Running {
            return Err(BerthError::Container(format!(
                "Cannot remove running container {}",
                name
            )));
        }
        for volume in container.spec.mounts.iter().filter_map(Mount::volume_name) {
            self.volumes.remove_reference(volume)?;
        }
        containers.remove(name);
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>> {
        let containers = self.containers.read().map_err(poisoned)?;
        Ok(containers.get(name).map(Container::state))
    }

    async fn list(&self, project: &str) -> Result<Vec<ContainerState>> {
        let containers = self.containers.read().map_err(poisoned)?;
        let mut states: Vec<ContainerState> = containers
            .values()
            .filter(|c| c.spec.labels.get(PROJECT_LABEL).map(String::as_str) == Some(project))
            .map(Container::state)
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(name: &str) -> ContainerSpec {
        let mut spec = ContainerSpec::new(name, name, "redis:7");
        spec.labels.insert(PROJECT_LABEL.to_string(), "contacts".to_string());
        spec
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let temp = tempdir().unwrap();
        let runtime = MemoryRuntime::new(temp.path().to_path_buf()).unwrap();

        runtime.create(&spec("redis")).await.unwrap();
        assert!(runtime.create(&spec("redis")).await.is_err());

        runtime.start("redis").await.unwrap();
        assert!(runtime.start("redis").await.is_err());
        assert!(runtime.remove("redis").await.is_err());

        let state = runtime.inspect("redis").await.unwrap().unwrap();
        assert!(state.is_running());
        assert_eq!(state.health, HealthStatus::None);

        runtime.stop("redis", Duration::from_secs(1)).await.unwrap();
        runtime.remove("redis").await.unwrap();
        assert!(runtime.inspect("redis").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_crash_and_restart_counts() {
        let temp = tempdir().unwrap();
        let runtime = MemoryRuntime::new(temp.path().to_path_buf()).unwrap();
        runtime.create(&spec("redis")).await.unwrap();
        runtime.start("redis").await.unwrap();

        runtime.crash("redis", 137).unwrap();
        let state = runtime.inspect("redis").await.unwrap().unwrap();
        assert_eq!(state.status, ContainerStatus::Exited);
        assert_eq!(state.exit_code, Some(137));

        runtime.start("redis").await.unwrap();
        let state = runtime.inspect("redis").await.unwrap().unwrap();
        assert_eq!(state.restart_count, 1);
        assert_eq!(state.exit_code, None);
    }

    #[tokio::test]
    async fn test_volume_mount_requires_volume() {
        let temp = tempdir().unwrap();
        let runtime = MemoryRuntime::new(temp.path().to_path_buf()).unwrap();
        let mut db = spec("postgres");
        db.mounts.push(Mount::Volume {
            name: "contacts_postgres_data".to_string(),
            target: "/var/lib/postgresql/data".to_string(),
            read_only: false,
        });

        assert!(runtime.create(&db).await.is_err());
        assert!(runtime
            .ensure_volume("contacts_postgres_data", &BTreeMap::new())
            .await
            .unwrap());
        runtime.create(&db).await.unwrap();
        assert_eq!(runtime.volumes().get("contacts_postgres_data").unwrap().ref_count, 1);
        assert!(runtime.remove_volume("contacts_postgres_data").await.is_err());

        runtime.remove("postgres").await.unwrap();
        runtime.remove_volume("contacts_postgres_data").await.unwrap();
    }

    #[tokio::test]
    async fn test_port_conflicts() {
        let temp = tempdir().unwrap();
        let runtime = MemoryRuntime::new(temp.path().to_path_buf()).unwrap();

        let mut a = spec("a");
        a.ports.push(PortBinding::same(6379));
        let mut b = spec("b");
        b.ports.push(PortBinding::same(6379));
        runtime.create(&a).await.unwrap();
        runtime.create(&b).await.unwrap();

        assert!(runtime.port_available(&PortBinding::same(6379)).await.unwrap());
        runtime.start("a").await.unwrap();
        assert!(!runtime.port_available(&PortBinding::same(6379)).await.unwrap());
        assert!(matches!(
            runtime.start("b").await,
            Err(BerthError::PortConflict { port: 6379, .. })
        ));

        runtime.occupy_port(5432).unwrap();
        assert!(!runtime.port_available(&PortBinding::same(5432)).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_filters_by_project() {
        let temp = tempdir().unwrap();
        let runtime = MemoryRuntime::new(temp.path().to_path_buf()).unwrap();
        runtime.create(&spec("redis")).await.unwrap();
        runtime.create(&spec("app")).await.unwrap();
        runtime
            .create(&ContainerSpec::new("other", "other", "nginx"))
            .await
            .unwrap();

        let names: Vec<String> = runtime
            .list("contacts")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["app", "redis"]);
    }
}
