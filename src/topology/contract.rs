//! Stack composition contract
//!
//! The contacts stack is three services: the API, a password-protected
//! cache and a database whose state lives in a named volume. This module
//! checks a compose configuration (and optionally the API's build recipe)
//! against that shape.
//!
//! Violations break the contract and block `up`. Findings are gaps worth a
//! look that the stack runs with today; they are reported, never fixed.

use crate::build::BuildRecipe;
use crate::compose::config::{ComposeConfig, DependencyCondition, ServiceConfig};
use crate::compose::interpolate;
use crate::error::{BerthError, Result};
use crate::supervisor::RestartPolicy;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Names, ports and credentials the stack is expected to use
#[derive(Debug, Clone, Serialize)]
pub struct StackContract {
    /// API service
    pub app: String,
    /// Cache service
    pub cache: String,
    /// Database service
    pub database: String,
    /// Named volume holding database state
    pub data_volume: String,
    /// Shared env file every service loads
    pub env_file: String,
    /// Variable holding the cache password
    pub cache_password_var: String,
    pub app_port: u16,
    pub cache_port: u16,
    pub database_port: u16,
}

impl Default for StackContract {
    fn default() -> Self {
        Self {
            app: "app".to_string(),
            cache: "redis".to_string(),
            database: "postgres".to_string(),
            data_volume: "postgres_data".to_string(),
            env_file: ".env".to_string(),
            cache_password_var: "REDIS_PASSWORD".to_string(),
            app_port: 8000,
            cache_port: 6379,
            database_port: 5432,
        }
    }
}

/// A broken contract rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    MissingService { service: String },
    MissingContainerName { service: String },
    DuplicateContainerName { name: String, services: Vec<String> },
    AppDependencies { expected: Vec<String>, actual: Vec<String> },
    UndeclaredVolume { volume: String },
    VolumeUsers { volume: String, users: Vec<String> },
    MissingPortMapping { service: String, port: u16 },
    HostPortConflict { port: u16, services: Vec<String> },
    ExposedPortMismatch { expected: u16, exposed: Vec<u16> },
    LaunchPortMismatch { expected: u16, actual: u16 },
    LaunchNotPublic { host: String },
    LaunchCommandInvalid { reason: String },
    CachePasswordNotRequired { service: String, variable: String },
    RestartPolicy { service: String, expected: String, actual: Option<String> },
    MissingEnvFile { service: String, env_file: String },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::MissingService { service } => {
                write!(f, "service '{}' is not defined", service)
            }
            Violation::MissingContainerName { service } => {
                write!(f, "service '{}' has no container_name", service)
            }
            Violation::DuplicateContainerName { name, services } => write!(
                f,
                "container name '{}' is shared by {}",
                name,
                services.join(", ")
            ),
            Violation::AppDependencies { expected, actual } => write!(
                f,
                "app must depend on exactly [{}], found [{}]",
                expected.join(", "),
                actual.join(", ")
            ),
            Violation::UndeclaredVolume { volume } => {
                write!(f, "named volume '{}' is not declared", volume)
            }
            Violation::VolumeUsers { volume, users } => write!(
                f,
                "volume '{}' must be mounted by the database only, mounted by [{}]",
                volume,
                users.join(", ")
            ),
            Violation::MissingPortMapping { service, port } => {
                write!(f, "service '{}' does not publish {}:{}", service, port, port)
            }
            Violation::HostPortConflict { port, services } => write!(
                f,
                "host port {} is published by {}",
                port,
                services.join(", ")
            ),
            Violation::ExposedPortMismatch { expected, exposed } => write!(
                f,
                "build recipe exposes {:?}, expected {}",
                exposed, expected
            ),
            Violation::LaunchPortMismatch { expected, actual } => write!(
                f,
                "launch command listens on {}, expected {}",
                actual, expected
            ),
            Violation::LaunchNotPublic { host } => {
                write!(f, "launch command binds {} instead of 0.0.0.0", host)
            }
            Violation::LaunchCommandInvalid { reason } => {
                write!(f, "launch command is not a server launch: {}", reason)
            }
            Violation::CachePasswordNotRequired { service, variable } => write!(
                f,
                "service '{}' does not require the password from ${{{}}}",
                service, variable
            ),
            Violation::RestartPolicy {
                service,
                expected,
                actual,
            } => write!(
                f,
                "service '{}' restart policy is {}, expected {}",
                service,
                actual.as_deref().unwrap_or("unset"),
                expected
            ),
            Violation::MissingEnvFile { service, env_file } => {
                write!(f, "service '{}' does not load {}", service, env_file)
            }
        }
    }
}

/// A gap in the stack that does not break the contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    /// Dependencies restart on crash, the dependent does not
    RestartAsymmetry { service: String, dependencies: Vec<String> },
    /// Start order is "started", not "healthy"
    StartAfterOnly { service: String, dependency: String },
    /// Dependency has no health check to gate on
    NoHealthcheck { service: String },
    /// Restarts are unbounded
    UnboundedRestart { service: String, policy: String },
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Finding::RestartAsymmetry {
                service,
                dependencies,
            } => write!(
                f,
                "'{}' declares no restart policy while its dependencies [{}] restart always",
                service,
                dependencies.join(", ")
            ),
            Finding::StartAfterOnly {
                service,
                dependency,
            } => write!(
                f,
                "'{}' starts once '{}' is started, not once it is ready",
                service, dependency
            ),
            Finding::NoHealthcheck { service } => {
                write!(f, "'{}' has no health check", service)
            }
            Finding::UnboundedRestart { service, policy } => write!(
                f,
                "'{}' restarts without bound or backoff (restart: {})",
                service, policy
            ),
        }
    }
}

/// Result of a contract check
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContractReport {
    pub violations: Vec<Violation>,
    pub findings: Vec<Finding>,
}

impl ContractReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    /// Fail with every violation in one message
    pub fn into_result(self) -> Result<Vec<Finding>> {
        if self.violations.is_empty() {
            return Ok(self.findings);
        }
        let messages: Vec<String> = self.violations.iter().map(|v| v.to_string()).collect();
        Err(BerthError::Validation(messages.join("; ")))
    }
}

impl StackContract {
    /// Check `config`, and the API's build recipe when given. `config` is
    /// the file as written (`ComposeParser::parse_str`); variable references
    /// are part of the contract.
    pub fn check(&self, config: &ComposeConfig, recipe: Option<&BuildRecipe>) -> Result<ContractReport> {
        let mut report = ContractReport::default();

        let roles = [&self.app, &self.cache, &self.database];
        for role in roles {
            if !config.services.contains_key(role) {
                report.violations.push(Violation::MissingService {
                    service: role.clone(),
                });
            }
        }

        self.check_container_names(config, &mut report);
        self.check_host_ports(config, &mut report)?;
        self.check_volume(config, &mut report)?;

        if let Some(app) = config.services.get(&self.app) {
            self.check_app(app, recipe, &mut report)?;
        }
        if let Some(cache) = config.services.get(&self.cache) {
            self.check_cache(cache, &mut report)?;
        }
        if let Some(db) = config.services.get(&self.database) {
            self.check_published(&self.database, db, self.database_port, &mut report)?;
            self.check_restart_always(&self.database, db, &mut report)?;
        }

        for role in roles {
            if let Some(service) = config.services.get(role) {
                if !service.env_files().iter().any(|f| same_file(f, &self.env_file)) {
                    report.violations.push(Violation::MissingEnvFile {
                        service: role.clone(),
                        env_file: self.env_file.clone(),
                    });
                }
            }
        }

        self.collect_findings(config, &mut report)?;

        Ok(report)
    }

    fn check_container_names(&self, config: &ComposeConfig, report: &mut ContractReport) {
        let mut by_name: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (service_name, service) in &config.services {
            match service.container_name.as_deref() {
                Some(name) => by_name.entry(name).or_default().push(service_name.clone()),
                None => report.violations.push(Violation::MissingContainerName {
                    service: service_name.clone(),
                }),
            }
        }
        for (name, services) in by_name {
            if services.len() > 1 {
                report.violations.push(Violation::DuplicateContainerName {
                    name: name.to_string(),
                    services,
                });
            }
        }
    }

    fn check_host_ports(&self, config: &ComposeConfig, report: &mut ContractReport) -> Result<()> {
        let mut by_port: BTreeMap<(u16, String), Vec<String>> = BTreeMap::new();
        for (name, service) in &config.services {
            for binding in service.port_bindings()? {
                if let Some(port) = binding.host_port {
                    by_port
                        .entry((port, binding.protocol.to_string()))
                        .or_default()
                        .push(name.clone());
                }
            }
        }
        for ((port, _), services) in by_port {
            if services.len() > 1 {
                report
                    .violations
                    .push(Violation::HostPortConflict { port, services });
            }
        }
        Ok(())
    }

    fn check_volume(&self, config: &ComposeConfig, report: &mut ContractReport) -> Result<()> {
        if !config.volumes.contains_key(&self.data_volume) {
            report.violations.push(Violation::UndeclaredVolume {
                volume: self.data_volume.clone(),
            });
        }
        let users = config.volume_users(&self.data_volume)?;
        if users != [self.database.clone()] {
            report.violations.push(Violation::VolumeUsers {
                volume: self.data_volume.clone(),
                users,
            });
        }
        Ok(())
    }

    fn check_app(
        &self,
        app: &ServiceConfig,
        recipe: Option<&BuildRecipe>,
        report: &mut ContractReport,
    ) -> Result<()> {
        let mut expected = vec![self.cache.clone(), self.database.clone()];
        expected.sort();
        let actual = app.dependency_names();
        if actual != expected {
            report
                .violations
                .push(Violation::AppDependencies { expected, actual });
        }

        self.check_published(&self.app, app, self.app_port, report)?;

        if let Some(recipe) = recipe {
            let exposed = recipe.exposed_ports();
            if !exposed.contains(&self.app_port) {
                report.violations.push(Violation::ExposedPortMismatch {
                    expected: self.app_port,
                    exposed,
                });
            }

            match recipe.launch_command() {
                Ok(launch) => {
                    if launch.port != self.app_port {
                        report.violations.push(Violation::LaunchPortMismatch {
                            expected: self.app_port,
                            actual: launch.port,
                        });
                    }
                    if !launch.binds_all_interfaces() {
                        report
                            .violations
                            .push(Violation::LaunchNotPublic { host: launch.host });
                    }
                }
                Err(e) => report.violations.push(Violation::LaunchCommandInvalid {
                    reason: e.to_string(),
                }),
            }
        }

        Ok(())
    }

    fn check_cache(&self, cache: &ServiceConfig, report: &mut ContractReport) -> Result<()> {
        self.check_published(&self.cache, cache, self.cache_port, report)?;
        self.check_restart_always(&self.cache, cache, report)?;

        // Checked on the raw config: the password must come from the variable
        let args = cache.command_args().unwrap_or_default();
        let from_variable = args
            .iter()
            .position(|a| a == "--requirepass")
            .and_then(|i| args.get(i + 1))
            .map(|p| interpolate::references(p).contains(&self.cache_password_var))
            .unwrap_or(false);
        if !from_variable {
            report.violations.push(Violation::CachePasswordNotRequired {
                service: self.cache.clone(),
                variable: self.cache_password_var.clone(),
            });
        }
        Ok(())
    }

    fn check_published(
        &self,
        name: &str,
        service: &ServiceConfig,
        port: u16,
        report: &mut ContractReport,
    ) -> Result<()> {
        let published = service
            .port_bindings()?
            .iter()
            .any(|b| b.host_port == Some(port) && b.container_port == port);
        if !published {
            report.violations.push(Violation::MissingPortMapping {
                service: name.to_string(),
                port,
            });
        }
        Ok(())
    }

    fn check_restart_always(
        &self,
        name: &str,
        service: &ServiceConfig,
        report: &mut ContractReport,
    ) -> Result<()> {
        if service.restart_policy()? != Some(RestartPolicy::Always) {
            report.violations.push(Violation::RestartPolicy {
                service: name.to_string(),
                expected: RestartPolicy::Always.to_string(),
                actual: service.restart.clone(),
            });
        }
        Ok(())
    }

    fn collect_findings(&self, config: &ComposeConfig, report: &mut ContractReport) -> Result<()> {
        let mut unhealthy_checked = BTreeSet::new();

        for (name, service) in &config.services {
            let deps = service.dependencies()?;

            if service.restart_policy()?.is_none() && !deps.is_empty() {
                let restarting: Vec<String> = deps
                    .iter()
                    .filter(|d| {
                        config
                            .services
                            .get(&d.service)
                            .and_then(|s| s.restart_policy().ok().flatten())
                            == Some(RestartPolicy::Always)
                    })
                    .map(|d| d.service.clone())
                    .collect();
                if !restarting.is_empty() {
                    report.findings.push(Finding::RestartAsymmetry {
                        service: name.clone(),
                        dependencies: restarting,
                    });
                }
            }

            for dep in deps {
                if dep.condition == DependencyCondition::Started {
                    report.findings.push(Finding::StartAfterOnly {
                        service: name.clone(),
                        dependency: dep.service.clone(),
                    });
                }
                let has_check = config
                    .services
                    .get(&dep.service)
                    .and_then(|s| s.healthcheck.as_ref())
                    .map(|h| h.is_enabled())
                    .unwrap_or(false);
                if !has_check && unhealthy_checked.insert(dep.service.clone()) {
                    report.findings.push(Finding::NoHealthcheck {
                        service: dep.service,
                    });
                }
            }

            if let Some(policy) = service.restart_policy()? {
                if policy.is_unbounded() {
                    report.findings.push(Finding::UnboundedRestart {
                        service: name.clone(),
                        policy: policy.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

fn same_file(a: &str, b: &str) -> bool {
    a.trim_start_matches("./") == b.trim_start_matches("./")
}
