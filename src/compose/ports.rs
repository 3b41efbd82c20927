//! Port binding parsing

use super::config::PortConfig;
use crate::error::{BerthError, Result};
use serde::{Deserialize, Serialize};

/// Network protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(BerthError::InvalidPort(format!("unknown protocol '{}'", other))),
        }
    }
}

/// A resolved `host:container` port binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Host interface, all interfaces when `None`
    pub host_ip: Option<String>,
    /// Published host port, `None` for an ephemeral port
    pub host_port: Option<u16>,
    /// Port inside the container
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortBinding {
    /// Binding that publishes `port` on the same host port
    pub fn same(port: u16) -> Self {
        Self {
            host_ip: None,
            host_port: Some(port),
            container_port: port,
            protocol: Protocol::Tcp,
        }
    }

    /// Parse either compose syntax
    pub fn from_config(config: &PortConfig) -> Result<Self> {
        match config {
            PortConfig::Short(spec) => Self::parse(spec),
            PortConfig::Long(long) => {
                let host_port = long
                    .published
                    .as_deref()
                    .map(|p| parse_port(p, p))
                    .transpose()?;
                let protocol = long
                    .protocol
                    .as_deref()
                    .map(str::parse)
                    .transpose()?
                    .unwrap_or_default();
                if long.target == 0 {
                    return Err(BerthError::InvalidPort("target port 0".to_string()));
                }
                Ok(Self {
                    host_ip: long.host_ip.clone(),
                    host_port,
                    container_port: long.target,
                    protocol,
                })
            }
        }
    }

    /// Parse the short syntax: `[ip:][host:]container[/protocol]`
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (ports, protocol) = match spec.rsplit_once('/') {
            Some((p, proto)) => (p, proto.parse()?),
            None => (spec, Protocol::Tcp),
        };

        // IPv6 host addresses are bracketed: [::1]:8000:8000
        let (host_ip, rest) = if let Some(stripped) = ports.strip_prefix('[') {
            let (ip, rest) = stripped
                .split_once("]:")
                .ok_or_else(|| BerthError::InvalidPort(spec.to_string()))?;
            (Some(ip.to_string()), rest)
        } else {
            (None, ports)
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let (host_ip, host_port, container_port) = match (host_ip, parts.as_slice()) {
            (None, [container]) => (None, None, *container),
            (None, [host, container]) => (None, Some(*host), *container),
            (None, [ip, host, container]) => (Some(ip.to_string()), Some(*host), *container),
            (Some(ip), [host, container]) => (Some(ip), Some(*host), *container),
            _ => return Err(BerthError::InvalidPort(spec.to_string())),
        };

        let host_port = match host_port {
            Some("") | None => None,
            Some(h) => Some(parse_port(h, spec)?),
        };

        Ok(Self {
            host_ip,
            host_port,
            container_port: parse_port(container_port, spec)?,
            protocol,
        })
    }
}

impl std::fmt::Display for PortBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{}:", ip)?;
        }
        if let Some(host) = self.host_port {
            write!(f, "{}:", host)?;
        }
        write!(f, "{}", self.container_port)?;
        if self.protocol != Protocol::Tcp {
            write!(f, "/{}", self.protocol)?;
        }
        Ok(())
    }
}

fn parse_port(value: &str, spec: &str) -> Result<u16> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => Err(BerthError::InvalidPort(spec.to_string())),
        Ok(port) => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::config::PortConfigLong;

    #[test]
    fn test_parse_short_forms() {
        let b = PortBinding::parse("8000:8000").unwrap();
        assert_eq!(b.host_port, Some(8000));
        assert_eq!(b.container_port, 8000);
        assert_eq!(b.protocol, Protocol::Tcp);

        let b = PortBinding::parse("127.0.0.1:6380:6379").unwrap();
        assert_eq!(b.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(b.host_port, Some(6380));
        assert_eq!(b.container_port, 6379);

        let b = PortBinding::parse("5432").unwrap();
        assert_eq!(b.host_port, None);

        let b = PortBinding::parse("53:53/udp").unwrap();
        assert_eq!(b.protocol, Protocol::Udp);

        let b = PortBinding::parse("[::1]:8000:80").unwrap();
        assert_eq!(b.host_ip.as_deref(), Some("::1"));
        assert_eq!(b.host_port, Some(8000));
    }

    #[test]
    fn test_parse_rejects_bad_ports() {
        assert!(PortBinding::parse("70000:80").is_err());
        assert!(PortBinding::parse("abc").is_err());
        assert!(PortBinding::parse("0:80").is_err());
        assert!(PortBinding::parse("80:80/sctp").is_err());
        assert!(PortBinding::parse("a:b:c:d").is_err());
    }

    #[test]
    fn test_long_form() {
        let long = PortConfig::Long(PortConfigLong {
            target: 8000,
            published: Some("8080".to_string()),
            host_ip: None,
            protocol: None,
        });
        let b = PortBinding::from_config(&long).unwrap();
        assert_eq!(b.host_port, Some(8080));
        assert_eq!(b.container_port, 8000);
    }

    #[test]
    fn test_display() {
        assert_eq!(PortBinding::same(6379).to_string(), "6379:6379");
        assert_eq!(PortBinding::parse("53:53/udp").unwrap().to_string(), "53:53/udp");
    }
}
