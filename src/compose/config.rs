//! Compose file configuration types

use super::mounts::Mount;
use super::ports::PortBinding;
use crate::error::{BerthError, Result};
use crate::supervisor::RestartPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Compose file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version (informational, ignored by modern tooling)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Named volumes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Option<VolumeConfig>>,
}

impl ComposeConfig {
    /// Look up a service by name
    pub fn service(&self, name: &str) -> Result<&ServiceConfig> {
        self.services
            .get(name)
            .ok_or_else(|| BerthError::ServiceNotFound(name.to_string()))
    }

    /// Services that mount the given named volume
    pub fn volume_users(&self, volume: &str) -> Result<Vec<String>> {
        let mut users = Vec::new();
        for (name, service) in &self.services {
            let uses = service
                .mounts()?
                .iter()
                .any(|m| m.volume_name() == Some(volume));
            if uses {
                users.push(name.clone());
            }
        }
        Ok(users)
    }
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
    /// Container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Command to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
    /// Entrypoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandConfig>,
    /// Environment file(s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<EnvFileConfig>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Port mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortConfig>>,
    /// Ports exposed to linked services only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<Vec<String>>,
    /// Volume mounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeMount>>,
    /// Restart policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    /// Service dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    /// Healthcheck configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl ServiceConfig {
    /// Declared dependency edges, sorted by service name
    pub fn dependencies(&self) -> Result<Vec<Dependency>> {
        let mut deps = match &self.depends_on {
            None => Vec::new(),
            Some(DependsOnConfig::Array(arr)) => arr
                .iter()
                .map(|s| Dependency {
                    service: s.clone(),
                    condition: DependencyCondition::Started,
                })
                .collect(),
            Some(DependsOnConfig::Map(map)) => map
                .iter()
                .map(|(s, c)| {
                    Ok(Dependency {
                        service: s.clone(),
                        condition: c.condition.parse()?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };
        deps.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(deps)
    }

    /// Names of the services this one depends on
    pub fn dependency_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match &self.depends_on {
            None => Vec::new(),
            Some(DependsOnConfig::Array(arr)) => arr.clone(),
            Some(DependsOnConfig::Map(map)) => map.keys().cloned().collect(),
        };
        names.sort();
        names
    }

    /// Env files in load order
    pub fn env_files(&self) -> Vec<String> {
        match &self.env_file {
            None => Vec::new(),
            Some(EnvFileConfig::Single(f)) => vec![f.clone()],
            Some(EnvFileConfig::Multiple(files)) => files.clone(),
        }
    }

    /// Inline environment as key/value pairs. `None` values pass through
    /// from the composing environment.
    pub fn environment_pairs(&self) -> Vec<(String, Option<String>)> {
        match &self.environment {
            None => Vec::new(),
            Some(EnvironmentConfig::Array(arr)) => arr
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (item.clone(), None),
                })
                .collect(),
            Some(EnvironmentConfig::Map(map)) => {
                let mut pairs: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                pairs.sort();
                pairs
            }
        }
    }

    /// Parsed restart policy, `None` when the service declares none
    pub fn restart_policy(&self) -> Result<Option<RestartPolicy>> {
        self.restart.as_deref().map(str::parse).transpose()
    }

    /// Parsed port bindings
    pub fn port_bindings(&self) -> Result<Vec<PortBinding>> {
        self.ports
            .iter()
            .flatten()
            .map(PortBinding::from_config)
            .collect()
    }

    /// Parsed volume mounts
    pub fn mounts(&self) -> Result<Vec<Mount>> {
        self.volumes
            .iter()
            .flatten()
            .map(Mount::from_config)
            .collect()
    }

    /// Command override in exec form
    pub fn command_args(&self) -> Option<Vec<String>> {
        self.command.as_ref().map(CommandConfig::to_args)
    }

    /// Build context and recipe file, if the service is built from source
    pub fn build_source(&self) -> Option<(String, Option<String>)> {
        match self.build.as_ref()? {
            BuildConfig::Simple(path) => Some((path.clone(), None)),
            BuildConfig::Full(full) => Some((
                full.context.clone().unwrap_or_else(|| ".".to_string()),
                full.dockerfile.clone(),
            )),
        }
    }
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Simple context path
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

/// Full build configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfigFull {
    /// Build context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Dockerfile path, relative to the context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Build arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<HashMap<String, String>>,
    /// Target stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

impl CommandConfig {
    /// Split into arguments. The shell form is split on whitespace, which
    /// matches how compose tokenizes unquoted commands.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            CommandConfig::Shell(s) => s.split_whitespace().map(str::to_string).collect(),
            CommandConfig::Exec(arr) => arr.clone(),
        }
    }
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(HashMap<String, Option<String>>),
}

/// Env file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvFileConfig {
    /// Single file
    Single(String),
    /// Multiple files
    Multiple(Vec<String>),
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Short syntax: "8080:80"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    /// Host IP to bind to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short syntax: "source:target:mode"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (volume, bind)
    #[serde(rename = "type")]
    pub mount_type: Option<String>,
    /// Source path or volume name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Target path in container
    pub target: String,
    /// Read only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(HashMap<String, DependsOnCondition>),
}

/// Depends on condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    #[serde(default = "default_condition")]
    pub condition: String,
}

fn default_condition() -> String {
    "service_started".to_string()
}

/// What a dependent waits for before it is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// Dependency container has been started
    Started,
    /// Dependency reports healthy
    Healthy,
    /// Dependency ran to completion with exit code 0
    CompletedSuccessfully,
}

impl std::str::FromStr for DependencyCondition {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "service_started" => Ok(Self::Started),
            "service_healthy" => Ok(Self::Healthy),
            "service_completed_successfully" => Ok(Self::CompletedSuccessfully),
            other => Err(BerthError::ComposeParse(format!(
                "Unknown depends_on condition '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Healthy => write!(f, "healthy"),
            Self::CompletedSuccessfully => write!(f, "completed successfully"),
        }
    }
}

/// A resolved dependency edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub service: String,
    pub condition: DependencyCondition,
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<HealthcheckTest>,
    /// Interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Start period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
    /// Disable healthcheck
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable: Option<bool>,
}

impl HealthcheckConfig {
    /// Whether the check actually runs
    pub fn is_enabled(&self) -> bool {
        if self.disable == Some(true) {
            return false;
        }
        match &self.test {
            None => false,
            Some(HealthcheckTest::Command(cmd)) => !cmd.trim().is_empty(),
            Some(HealthcheckTest::Array(arr)) => arr.first().map(String::as_str) != Some("NONE"),
        }
    }

    /// Longest a dependent should wait for this check to pass:
    /// start period plus (interval + timeout) for every retry.
    pub fn readiness_budget(&self) -> Result<Duration> {
        let interval = parse_duration(self.interval.as_deref().unwrap_or("30s"))?;
        let timeout = parse_duration(self.timeout.as_deref().unwrap_or("30s"))?;
        let start = parse_duration(self.start_period.as_deref().unwrap_or("0s"))?;
        let retries = self.retries.unwrap_or(3);
        interval
            .checked_add(timeout)
            .and_then(|per_try| per_try.checked_mul(retries))
            .and_then(|tries| tries.checked_add(start))
            .ok_or_else(|| {
                BerthError::InvalidConfig("healthcheck readiness budget overflows".to_string())
            })
    }
}

/// Healthcheck test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Command string
    Command(String),
    /// Command array
    Array(Vec<String>),
}

/// Volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Driver options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_opts: Option<HashMap<String, String>>,
    /// External volume, managed outside the project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
    /// Name override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Parse a compose duration such as `1m30s`, `500ms` or `10s`
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(BerthError::InvalidConfig("empty duration".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            digits.push(c);
            continue;
        }

        let mut unit = c.to_string();
        if c == 'm' && chars.peek() == Some(&'s') {
            unit.push('s');
            chars.next();
        } else if c == 'u' || c == 'n' {
            if chars.peek() == Some(&'s') {
                unit.push('s');
                chars.next();
            }
        }

        let value: f64 = digits
            .parse()
            .map_err(|_| BerthError::InvalidConfig(format!("invalid duration '{}'", s)))?;
        digits.clear();

        let secs = match unit.as_str() {
            "h" => value * 3600.0,
            "m" => value * 60.0,
            "s" => value,
            "ms" => value / 1_000.0,
            "us" => value / 1_000_000.0,
            "ns" => value / 1_000_000_000.0,
            _ => {
                return Err(BerthError::InvalidConfig(format!(
                    "invalid duration unit in '{}'",
                    s
                )))
            }
        };
        total = add_seconds(total, secs, s)?;
    }

    // A bare number is seconds
    if !digits.is_empty() {
        let value: f64 = digits
            .parse()
            .map_err(|_| BerthError::InvalidConfig(format!("invalid duration '{}'", s)))?;
        total = add_seconds(total, value, s)?;
    }

    Ok(total)
}

fn add_seconds(total: Duration, secs: f64, input: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .and_then(|d| total.checked_add(d))
        .ok_or_else(|| BerthError::InvalidConfig(format!("duration '{}' is out of range", input)))
}
