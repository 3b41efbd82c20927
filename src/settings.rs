//! Runtime settings
//!
//! Resolved in three layers: built-in defaults, then `BERTH_*` variables
//! from the process environment, then command line flags (applied by the
//! binary on top of [`Settings::from_env`]).

use crate::compose::config::parse_duration;
use crate::error::{BerthError, Result};
use crate::supervisor::Backoff;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Container backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Local docker engine through the `docker` CLI
    Docker,
    /// In-process runtime, nothing is executed
    Memory,
}

impl std::str::FromStr for RuntimeKind {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(RuntimeKind::Docker),
            "memory" => Ok(RuntimeKind::Memory),
            other => Err(BerthError::InvalidConfig(format!("unknown runtime '{}'", other))),
        }
    }
}

/// Berth settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Project name, defaults to the compose file's `name` or its directory
    pub project_name: Option<String>,
    /// Compose file, searched in the working directory when unset
    pub compose_file: Option<PathBuf>,
    /// Env files used for interpolation, in load order
    pub env_files: Vec<PathBuf>,
    /// State directory for the in-process runtime
    pub data_dir: PathBuf,
    pub runtime: RuntimeKind,
    /// Upper bound on waiting for a dependency to become healthy
    pub readiness_timeout: Duration,
    /// Interval between readiness polls
    pub poll_interval: Duration,
    /// Grace period before a stopping container is killed
    pub stop_timeout: Duration,
    /// Restart spacing; immediate restarts when unset
    pub backoff: Option<Backoff>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_name: None,
            compose_file: None,
            env_files: Vec::new(),
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("berth"),
            runtime: RuntimeKind::Docker,
            readiness_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(10),
            backoff: None,
        }
    }
}

impl Settings {
    /// Defaults overlaid with `BERTH_*` process environment variables
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let mut settings = Self::default();
        settings.apply_env(&vars)?;
        Ok(settings)
    }

    /// Overlay `BERTH_*` variables from `vars`
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(name) = get("BERTH_PROJECT_NAME") {
            self.project_name = Some(name.to_string());
        }
        if let Some(file) = get("BERTH_FILE") {
            self.compose_file = Some(PathBuf::from(file));
        }
        if let Some(files) = get("BERTH_ENV_FILE") {
            self.env_files = files
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(dir) = get("BERTH_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(runtime) = get("BERTH_RUNTIME") {
            self.runtime = runtime.parse()?;
        }
        if let Some(timeout) = get("BERTH_READINESS_TIMEOUT") {
            self.readiness_timeout = parse_duration(timeout)?;
        }
        if let Some(interval) = get("BERTH_POLL_INTERVAL") {
            let interval = parse_duration(interval)?;
            if interval.is_zero() {
                return Err(BerthError::InvalidConfig(
                    "BERTH_POLL_INTERVAL must be positive".to_string(),
                ));
            }
            self.poll_interval = interval;
        }
        if let Some(timeout) = get("BERTH_STOP_TIMEOUT") {
            self.stop_timeout = parse_duration(timeout)?;
        }
        if let Some(backoff) = get("BERTH_BACKOFF") {
            self.backoff = match backoff {
                "off" | "none" | "0" => None,
                "on" | "default" => Some(Backoff::default()),
                initial => Some(Backoff {
                    initial: parse_duration(initial)?,
                    ..Backoff::default()
                }),
            };
        }

        Ok(())
    }

    /// Directory for named volume data of `project`
    pub fn volume_dir(&self, project: &str) -> PathBuf {
        self.data_dir.join("volumes").join(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.runtime, RuntimeKind::Docker);
        assert!(settings.backoff.is_none());
        assert!(settings.data_dir.ends_with("berth"));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings
            .apply_env(&vars(&[
                ("BERTH_PROJECT_NAME", "contacts"),
                ("BERTH_ENV_FILE", ".env, .env.local"),
                ("BERTH_RUNTIME", "memory"),
                ("BERTH_READINESS_TIMEOUT", "1m30s"),
                ("BERTH_BACKOFF", "250ms"),
                ("UNRELATED", "x"),
            ]))
            .unwrap();

        assert_eq!(settings.project_name.as_deref(), Some("contacts"));
        assert_eq!(
            settings.env_files,
            vec![PathBuf::from(".env"), PathBuf::from(".env.local")]
        );
        assert_eq!(settings.runtime, RuntimeKind::Memory);
        assert_eq!(settings.readiness_timeout, Duration::from_secs(90));
        assert_eq!(
            settings.backoff.map(|b| b.initial),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut settings = Settings::default();
        assert!(settings
            .apply_env(&vars(&[("BERTH_RUNTIME", "podman")]))
            .is_err());
        assert!(settings
            .apply_env(&vars(&[("BERTH_POLL_INTERVAL", "0s")]))
            .is_err());
        assert!(settings
            .apply_env(&vars(&[("BERTH_READINESS_TIMEOUT", "soon")]))
            .is_err());
    }

    #[test]
    fn test_empty_values_ignored() {
        let mut settings = Settings::default();
        settings
            .apply_env(&vars(&[("BERTH_PROJECT_NAME", "  ")]))
            .unwrap();
        assert!(settings.project_name.is_none());
    }
}
