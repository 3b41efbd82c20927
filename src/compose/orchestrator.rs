//! Compose orchestrator
//!
//! Brings a parsed, interpolated composition up on a [`ContainerRuntime`]
//! and takes it down again. Startup runs in dependency waves; every
//! service of a wave is started from its own task once the dependencies it
//! names have reached their `depends_on` condition.

use super::config::{BuildConfig, ComposeConfig, DependencyCondition, HealthcheckTest, ServiceConfig};
use super::mounts::Mount;
use super::parser::ComposeParser;
use crate::build::{BuildContext, ImageBuilder};
use crate::compose::config::parse_duration;
use crate::env::EnvFile;
use crate::error::{BerthError, Result};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus, HealthProbe, HealthStatus,
    CONFIG_HASH_LABEL, PROJECT_LABEL, SERVICE_LABEL,
};
use crate::settings::Settings;
use crate::supervisor::{RestartDecision, RestartTracker};
use crate::topology::StartPlan;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// What `up` did
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpReport {
    pub project: String,
    /// Services started per wave, in start order
    pub waves: Vec<Vec<String>>,
    /// Built image per service
    pub built: BTreeMap<String, String>,
    /// Named volumes created by this run
    pub volumes_created: Vec<String>,
}

/// Per-service view for `ps`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub container: String,
    /// `None` when the container does not exist
    pub state: Option<ContainerState>,
}

/// A dependency a service waits on before it starts
#[derive(Debug, Clone)]
struct Gate {
    dependency: String,
    container: String,
    condition: DependencyCondition,
    timeout: Duration,
}

/// Compose orchestrator
pub struct ComposeOrchestrator {
    project: String,
    config: ComposeConfig,
    /// Composing environment, source of pass-through variables
    env: HashMap<String, String>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: Settings,
    working_dir: PathBuf,
    /// Built or resolved image per service
    images: HashMap<String, String>,
    /// Content id of each service's built image
    image_ids: HashMap<String, String>,
    /// Services explicitly stopped, exempt from restart policies
    stopped: HashSet<String>,
    restarts: RestartTracker,
}

impl ComposeOrchestrator {
    /// Create an orchestrator for an interpolated configuration
    pub fn new(
        project: &str,
        config: ComposeConfig,
        env: HashMap<String, String>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: Settings,
    ) -> Self {
        let restarts = match settings.backoff {
            Some(backoff) => RestartTracker::with_backoff(backoff),
            None => RestartTracker::new(),
        };
        Self {
            project: project.to_string(),
            config,
            env,
            runtime,
            settings,
            working_dir: PathBuf::from("."),
            images: HashMap::new(),
            image_ids: HashMap::new(),
            stopped: HashSet::new(),
            restarts,
        }
    }

    /// Directory relative paths (build contexts, env files, binds) resolve against
    pub fn working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    /// Startup plan for the configuration
    pub fn plan(&self) -> Result<StartPlan> {
        StartPlan::from_config(&self.config)
    }

    /// Container name of a service
    pub fn container_name(&self, service: &str) -> Result<String> {
        let config = self.config.service(service)?;
        Ok(config
            .container_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}-1", self.project, service)))
    }

    /// Runtime name of a declared volume
    pub fn volume_name(&self, volume: &str) -> String {
        self.config
            .volumes
            .get(volume)
            .and_then(|v| v.as_ref())
            .and_then(|v| v.name.clone())
            .unwrap_or_else(|| format!("{}_{}", self.project, volume))
    }

    fn network_name(&self) -> String {
        format!("{}_default", self.project)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(PROJECT_LABEL.to_string(), self.project.clone());
        labels
    }

    /// Bring the stack up. With `build`, images of services built from
    /// source are rebuilt even when present.
    pub async fn up(&mut self, build: bool) -> Result<UpReport> {
        tracing::info!(
            "Starting project {} on the {} runtime",
            self.project,
            self.runtime.name()
        );

        for warning in ComposeParser::validate(&self.config)? {
            tracing::warn!("{}", warning);
        }
        ComposeParser::check_container_names(&self.config, &self.project)?;
        let plan = self.plan()?;

        self.preflight_ports().await?;

        let mut report = UpReport {
            project: self.project.clone(),
            ..UpReport::default()
        };
        report.built = self.build_images(build).await?;

        self.runtime
            .ensure_network(&self.network_name(), &self.labels())
            .await?;
        report.volumes_created = self.ensure_volumes().await?;

        for wave in plan.waves() {
            let mut tasks = JoinSet::new();
            for service in wave {
                let spec = self.container_spec(service)?;
                let gates = self.gates(service)?;
                let runtime = Arc::clone(&self.runtime);
                let poll = self.settings.poll_interval;
                let stop_timeout = self.settings.stop_timeout;
                tasks.spawn(launch(runtime, spec, gates, poll, stop_timeout));
            }

            let mut started = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                let outcome = joined
                    .map_err(|e| BerthError::Runtime(format!("start task failed: {}", e)))
                    .and_then(|r| r);
                match outcome {
                    Ok(service) => started.push(service),
                    Err(e) => {
                        tasks.abort_all();
                        return Err(e);
                    }
                }
            }
            started.sort();
            for service in &started {
                self.stopped.remove(service);
                self.restarts.reset(service);
            }
            report.waves.push(started);
        }

        tracing::info!("Project {} is up", self.project);
        Ok(report)
    }

    /// Fail before anything starts if two services publish the same host
    /// port, or a port the stack needs is taken on the host
    async fn preflight_ports(&self) -> Result<()> {
        let mut owners: BTreeMap<(u16, String), String> = BTreeMap::new();
        for (name, service) in &self.config.services {
            for binding in service.port_bindings()? {
                let Some(port) = binding.host_port else {
                    continue;
                };
                let key = (port, binding.protocol.to_string());
                if let Some(other) = owners.insert(key, name.clone()) {
                    return Err(BerthError::PortConflict {
                        port,
                        owner: format!("published by both {} and {}", other, name),
                    });
                }
            }
        }

        for (name, service) in &self.config.services {
            let container = self.container_name(name)?;
            let running = self
                .runtime
                .inspect(&container)
                .await?
                .map(|s| s.is_running())
                .unwrap_or(false);
            if running {
                continue;
            }
            for binding in service.port_bindings()? {
                if !self.runtime.port_available(&binding).await? {
                    return Err(BerthError::PortConflict {
                        port: binding.host_port.unwrap_or_default(),
                        owner: format!("needed by {}, already in use on the host", name),
                    });
                }
            }
        }
        Ok(())
    }

    /// Build images for services with a build section. Existing images are
    /// reused unless `force` is set.
    async fn build_images(&mut self, force: bool) -> Result<BTreeMap<String, String>> {
        let mut built = BTreeMap::new();

        for (name, service) in &self.config.services {
            let Some((context, recipe)) = service.build_source() else {
                if let Some(image) = &service.image {
                    self.images.insert(name.clone(), image.clone());
                }
                continue;
            };

            let tag = service
                .image
                .clone()
                .unwrap_or_else(|| format!("{}-{}:latest", self.project, name));

            if !force && self.runtime.image_exists(&tag).await? {
                tracing::debug!("Reusing image {} for {}", tag, name);
                if let Some(id) = self.runtime.image_id(&tag).await? {
                    self.image_ids.insert(name.clone(), id);
                }
                self.images.insert(name.clone(), tag);
                continue;
            }

            let mut ctx = BuildContext::new(self.working_dir.join(&context)).tag(&tag);
            if let Some(recipe) = recipe {
                ctx = ctx.recipe_file(&recipe);
            }
            if let Some(BuildConfig::Full(full)) = &service.build {
                for (key, value) in full.args.iter().flatten() {
                    ctx = ctx.arg(key, value);
                }
                if let Some(target) = &full.target {
                    ctx = ctx.target(target);
                }
            }

            let plan = ImageBuilder::new(ctx).prepare()?;
            tracing::info!(
                "Building {} from {}",
                name,
                plan.context.context_dir.display()
            );
            let image = self.runtime.build_image(&plan).await.map_err(|e| match e {
                BerthError::Build(msg) => {
                    BerthError::Build(format!("service {}: {}", name, msg))
                }
                other => other,
            })?;

            let id = self
                .runtime
                .image_id(&image)
                .await?
                .unwrap_or_else(|| plan.image_id.clone());
            self.image_ids.insert(name.clone(), id);
            self.images.insert(name.clone(), image.clone());
            built.insert(name.clone(), image);
        }

        Ok(built)
    }

    /// Create every declared, non-external volume a service mounts
    async fn ensure_volumes(&self) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for (key, volume) in &self.config.volumes {
            let external = volume
                .as_ref()
                .and_then(|v| v.external)
                .unwrap_or(false);
            if external || self.config.volume_users(key)?.is_empty() {
                continue;
            }
            let name = self.volume_name(key);
            if self.runtime.ensure_volume(&name, &self.labels()).await? {
                tracing::info!("Created volume {}", name);
                created.push(name);
            }
        }
        Ok(created)
    }

    fn gates(&self, service: &str) -> Result<Vec<Gate>> {
        let config = self.config.service(service)?;
        config
            .dependencies()?
            .into_iter()
            .map(|dep| {
                let budget = self
                    .config
                    .service(&dep.service)?
                    .healthcheck
                    .as_ref()
                    .filter(|h| h.is_enabled())
                    .map(|h| h.readiness_budget())
                    .transpose()?;
                let timeout = match budget {
                    Some(budget) => budget.min(self.settings.readiness_timeout),
                    None => self.settings.readiness_timeout,
                };
                Ok(Gate {
                    container: self.container_name(&dep.service)?,
                    dependency: dep.service,
                    condition: dep.condition,
                    timeout,
                })
            })
            .collect()
    }

    /// Translate a service definition into a container spec
    pub fn container_spec(&self, service: &str) -> Result<ContainerSpec> {
        let config = self.config.service(service)?;
        let image = self
            .images
            .get(service)
            .cloned()
            .or_else(|| config.image.clone())
            .unwrap_or_else(|| format!("{}-{}:latest", self.project, service));

        let mut spec = ContainerSpec::new(&self.container_name(service)?, service, &image);
        spec.command = config.command_args().unwrap_or_default();
        spec.entrypoint = config
            .entrypoint
            .as_ref()
            .map(|e| e.to_args())
            .unwrap_or_default();
        spec.env = self.service_env(config)?;
        spec.working_dir = config.working_dir.clone();
        spec.ports = config.port_bindings()?;
        spec.mounts = config
            .mounts()?
            .into_iter()
            .map(|m| self.resolve_mount(m))
            .collect();
        spec.labels = self.labels();
        spec.labels
            .insert(SERVICE_LABEL.to_string(), service.to_string());
        spec.network = Some(self.network_name());
        spec.aliases = vec![service.to_string()];
        spec.restart = config.restart_policy()?;
        spec.healthcheck = health_probe(config)?;

        let hash = self.config_hash(&spec)?;
        spec.labels.insert(CONFIG_HASH_LABEL.to_string(), hash);
        Ok(spec)
    }

    /// Digest of everything a container is created from, its image's
    /// content id included
    fn config_hash(&self, spec: &ContainerSpec) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(spec)?);
        if let Some(id) = self.image_ids.get(&spec.service) {
            hasher.update(id.as_bytes());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Env files in order, then inline `environment` on top. Inline keys
    /// without a value pass through from the composing environment.
    fn service_env(&self, config: &ServiceConfig) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        for file in config.env_files() {
            let loaded = EnvFile::load(&self.working_dir.join(&file))?;
            for (key, value) in loaded.iter() {
                env.insert(key.to_string(), value.to_string());
            }
        }
        for (key, value) in config.environment_pairs() {
            match value.or_else(|| self.env.get(&key).cloned()) {
                Some(value) => {
                    env.insert(key, value);
                }
                None => {
                    env.remove(&key);
                }
            }
        }
        Ok(env)
    }

    fn resolve_mount(&self, mount: Mount) -> Mount {
        match mount {
            Mount::Volume {
                name,
                target,
                read_only,
            } => Mount::Volume {
                name: self.volume_name(&name),
                target,
                read_only,
            },
            Mount::Bind {
                source,
                target,
                read_only,
            } => {
                let path = if let Some(rest) = source.strip_prefix('~') {
                    dirs::home_dir()
                        .unwrap_or_default()
                        .join(rest.trim_start_matches('/'))
                } else if source == "." {
                    self.working_dir.clone()
                } else {
                    self.working_dir.join(source.trim_start_matches("./"))
                };
                Mount::Bind {
                    source: path.display().to_string(),
                    target,
                    read_only,
                }
            }
            anonymous => anonymous,
        }
    }

    /// Stop and remove the stack's containers, dependents first. Named
    /// volumes are only removed when `remove_volumes` is set.
    pub async fn down(&mut self, remove_volumes: bool) -> Result<()> {
        tracing::info!("Stopping project {}", self.project);

        let plan = self.plan()?;
        for service in plan.teardown_order() {
            self.stop_service(&service).await?;
            let container = self.container_name(&service)?;
            if self.runtime.inspect(&container).await?.is_some() {
                self.runtime.remove(&container).await?;
                tracing::info!("Removed {}", container);
            }
        }

        self.runtime.remove_network(&self.network_name()).await?;

        if remove_volumes {
            for (key, volume) in &self.config.volumes {
                if volume.as_ref().and_then(|v| v.external).unwrap_or(false) {
                    continue;
                }
                let name = self.volume_name(key);
                match self.runtime.remove_volume(&name).await {
                    Ok(()) => tracing::info!("Removed volume {}", name),
                    Err(BerthError::VolumeNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }

    /// Stop one service. It stays down regardless of its restart policy
    /// until the next `up`.
    pub async fn stop_service(&mut self, service: &str) -> Result<()> {
        let container = self.container_name(service)?;
        self.stopped.insert(service.to_string());

        match self.runtime.inspect(&container).await? {
            Some(state) if state.is_running() => {
                self.runtime
                    .stop(&container, self.settings.stop_timeout)
                    .await?;
                tracing::info!("Stopped {}", container);
            }
            _ => tracing::debug!("{} is not running", container),
        }
        Ok(())
    }

    /// React to a service's container exiting with `exit_code`: apply its
    /// restart policy, waiting out any backoff before restarting.
    pub async fn handle_exit(&mut self, service: &str, exit_code: i32) -> Result<RestartDecision> {
        let config = self.config.service(service)?;
        let policy = config.restart_policy()?;
        let decision = self.restarts.on_exit(
            service,
            policy,
            exit_code,
            self.stopped.contains(service),
        );

        match decision {
            RestartDecision::Restart { delay, attempt } => {
                if !delay.is_zero() {
                    tracing::info!(
                        "Restarting {} in {:?} (attempt {})",
                        service,
                        delay,
                        attempt
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    tracing::info!("Restarting {} (attempt {})", service, attempt);
                }
                let container = self.container_name(service)?;
                self.runtime.start(&container).await?;
            }
            RestartDecision::GiveUp => {
                tracing::warn!("{} exited with code {} and stays down", service, exit_code)
            }
            RestartDecision::Leave => {
                tracing::info!("{} exited with code {}", service, exit_code)
            }
        }

        Ok(decision)
    }

    /// Look for exited containers and apply restart policies once. Does
    /// nothing when the runtime restarts containers itself.
    pub async fn supervise_once(&mut self) -> Result<Vec<(String, RestartDecision)>> {
        if self.runtime.applies_restart_policy() {
            return Ok(Vec::new());
        }

        let mut decisions = Vec::new();
        for state in self.runtime.list(&self.project).await? {
            if state.status != ContainerStatus::Exited || self.stopped.contains(&state.service) {
                continue;
            }
            let exit_code = state.exit_code.unwrap_or_default();
            let decision = self.handle_exit(&state.service, exit_code).await?;
            decisions.push((state.service, decision));
        }
        Ok(decisions)
    }

    /// State of every service's container, sorted by service
    pub async fn status(&self) -> Result<Vec<ServiceStatus>> {
        let mut statuses = Vec::new();
        for service in self.config.services.keys() {
            let container = self.container_name(service)?;
            let state = self.runtime.inspect(&container).await?;
            statuses.push(ServiceStatus {
                service: service.clone(),
                container,
                state,
            });
        }
        Ok(statuses)
    }

    /// Containers the runtime knows for this project, including ones no
    /// longer in the configuration
    pub async fn ps(&self) -> Result<Vec<ContainerState>> {
        self.runtime.list(&self.project).await
    }
}

fn health_probe(config: &ServiceConfig) -> Result<Option<HealthProbe>> {
    let Some(check) = config.healthcheck.as_ref().filter(|h| h.is_enabled()) else {
        return Ok(None);
    };
    let test = match &check.test {
        Some(HealthcheckTest::Command(cmd)) => vec!["CMD-SHELL".to_string(), cmd.clone()],
        Some(HealthcheckTest::Array(arr)) => arr.clone(),
        None => return Ok(None),
    };
    Ok(Some(HealthProbe {
        test,
        interval: parse_duration(check.interval.as_deref().unwrap_or("30s"))?,
        timeout: parse_duration(check.timeout.as_deref().unwrap_or("30s"))?,
        retries: check.retries.unwrap_or(3),
        start_period: parse_duration(check.start_period.as_deref().unwrap_or("0s"))?,
    }))
}

/// Wait for every gate, then create and start the container
async fn launch(
    runtime: Arc<dyn ContainerRuntime>,
    spec: ContainerSpec,
    gates: Vec<Gate>,
    poll: Duration,
    stop_timeout: Duration,
) -> Result<String> {
    for gate in &gates {
        wait_for(runtime.as_ref(), gate, poll).await?;
    }

    match runtime.inspect(&spec.name).await? {
        Some(state) if state.labels.get(CONFIG_HASH_LABEL) != spec.labels.get(CONFIG_HASH_LABEL) => {
            tracing::info!("Recreating {}: configuration or image changed", spec.name);
            if state.is_running() {
                runtime.stop(&spec.name, stop_timeout).await?;
            }
            runtime.remove(&spec.name).await?;
            runtime.create(&spec).await?;
        }
        Some(state) if state.is_running() => {
            tracing::info!("{} is already running", spec.name);
            return Ok(spec.service);
        }
        Some(_) => {}
        None => {
            runtime.create(&spec).await?;
        }
    }
    runtime.start(&spec.name).await?;
    tracing::info!("Started {} ({})", spec.service, spec.name);
    Ok(spec.service)
}

async fn wait_for(runtime: &dyn ContainerRuntime, gate: &Gate, poll: Duration) -> Result<()> {
    let deadline = Instant::now() + gate.timeout;
    loop {
        let state = runtime
            .inspect(&gate.container)
            .await?
            .ok_or_else(|| BerthError::ContainerNotFound(gate.container.clone()))?;

        let ready = match gate.condition {
            DependencyCondition::Started => state.started_at.is_some() || state.is_running(),
            DependencyCondition::Healthy => match state.health {
                HealthStatus::Healthy => true,
                HealthStatus::Starting => false,
                HealthStatus::Unhealthy => {
                    return Err(BerthError::Runtime(format!(
                        "dependency {} is unhealthy",
                        gate.dependency
                    )))
                }
                HealthStatus::None => {
                    return Err(BerthError::Validation(format!(
                        "dependency {} has no health check to wait for",
                        gate.dependency
                    )))
                }
            },
            DependencyCondition::CompletedSuccessfully => match (state.status, state.exit_code) {
                (ContainerStatus::Exited, Some(0)) => true,
                (ContainerStatus::Exited, Some(code)) => {
                    return Err(BerthError::Runtime(format!(
                        "dependency {} exited with code {}",
                        gate.dependency, code
                    )))
                }
                _ => false,
            },
        };

        if ready {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(BerthError::ReadinessTimeout {
                service: gate.dependency.clone(),
                condition: gate.condition.to_string(),
                seconds: gate.timeout.as_secs(),
            });
        }
        tracing::debug!("Waiting for {} to be {}", gate.dependency, gate.condition);
        tokio::time::sleep(poll).await;
    }
}
