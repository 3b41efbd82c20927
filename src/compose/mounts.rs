//! Volume mount parsing

use super::config::VolumeMount;
use crate::error::{BerthError, Result};
use serde::{Deserialize, Serialize};

/// A resolved service mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mount {
    /// Named volume managed by the orchestrator
    Volume {
        name: String,
        target: String,
        read_only: bool,
    },
    /// Host path bind mount
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
    /// Anonymous volume, discarded with the container
    Anonymous { target: String },
}

impl Mount {
    /// Parse either compose syntax
    pub fn from_config(config: &VolumeMount) -> Result<Self> {
        match config {
            VolumeMount::Short(spec) => Self::parse(spec),
            VolumeMount::Long(long) => {
                if long.target.is_empty() {
                    return Err(BerthError::InvalidMount("missing target".to_string()));
                }
                let read_only = long.read_only.unwrap_or(false);
                match (long.mount_type.as_deref(), &long.source) {
                    (Some("bind"), Some(source)) => Ok(Mount::Bind {
                        source: source.clone(),
                        target: long.target.clone(),
                        read_only,
                    }),
                    (Some("volume") | None, Some(source)) => Ok(Mount::Volume {
                        name: source.clone(),
                        target: long.target.clone(),
                        read_only,
                    }),
                    (Some("volume") | None, None) => Ok(Mount::Anonymous {
                        target: long.target.clone(),
                    }),
                    (Some(other), _) => Err(BerthError::InvalidMount(format!(
                        "unsupported mount type '{}' for {}",
                        other, long.target
                    ))),
                }
            }
        }
    }

    /// Parse the short syntax: `[source:]target[:mode]`
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, mode) = match parts.as_slice() {
            [target] => (None, *target, None),
            [source, target] => (Some(*source), *target, None),
            [source, target, mode] => (Some(*source), *target, Some(*mode)),
            _ => return Err(BerthError::InvalidMount(spec.to_string())),
        };

        if target.is_empty() {
            return Err(BerthError::InvalidMount(spec.to_string()));
        }

        let read_only = match mode {
            None => false,
            Some(mode) => {
                let flags: Vec<&str> = mode.split(',').collect();
                if flags.iter().any(|f| !matches!(*f, "ro" | "rw" | "z" | "Z" | "nocopy")) {
                    return Err(BerthError::InvalidMount(format!(
                        "unknown mode '{}' in {}",
                        mode, spec
                    )));
                }
                flags.contains(&"ro")
            }
        };

        Ok(match source {
            None => Mount::Anonymous {
                target: target.to_string(),
            },
            Some(src) if is_host_path(src) => Mount::Bind {
                source: src.to_string(),
                target: target.to_string(),
                read_only,
            },
            Some(src) => Mount::Volume {
                name: src.to_string(),
                target: target.to_string(),
                read_only,
            },
        })
    }

    /// Named volume referenced by this mount
    pub fn volume_name(&self) -> Option<&str> {
        match self {
            Mount::Volume { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Path inside the container
    pub fn target(&self) -> &str {
        match self {
            Mount::Volume { target, .. } | Mount::Bind { target, .. } | Mount::Anonymous { target } => {
                target
            }
        }
    }
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::config::VolumeMountLong;

    #[test]
    fn test_named_volume() {
        let m = Mount::parse("postgres_data:/var/lib/postgresql/data").unwrap();
        assert_eq!(m.volume_name(), Some("postgres_data"));
        assert_eq!(m.target(), "/var/lib/postgresql/data");
    }

    #[test]
    fn test_bind_mounts() {
        let m = Mount::parse(".:/app").unwrap();
        assert!(matches!(m, Mount::Bind { ref source, .. } if source == "."));
        assert_eq!(m.volume_name(), None);

        let m = Mount::parse("/etc/app:/etc/app:ro").unwrap();
        assert!(matches!(m, Mount::Bind { read_only: true, .. }));
    }

    #[test]
    fn test_anonymous_and_invalid() {
        assert!(matches!(Mount::parse("/data").unwrap(), Mount::Anonymous { .. }));
        assert!(Mount::parse("data:/data:bogus").is_err());
        assert!(Mount::parse("a:b:c:d").is_err());
    }

    #[test]
    fn test_long_form() {
        let long = VolumeMount::Long(VolumeMountLong {
            mount_type: Some("volume".to_string()),
            source: Some("pgdata".to_string()),
            target: "/var/lib/postgresql/data".to_string(),
            read_only: None,
        });
        assert_eq!(Mount::from_config(&long).unwrap().volume_name(), Some("pgdata"));

        let tmpfs = VolumeMount::Long(VolumeMountLong {
            mount_type: Some("tmpfs".to_string()),
            source: None,
            target: "/tmp".to_string(),
            read_only: None,
        });
        assert!(Mount::from_config(&tmpfs).is_err());
    }
}
