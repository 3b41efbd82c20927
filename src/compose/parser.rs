//! Compose file parser

use super::config::ComposeConfig;
use super::interpolate;
use crate::error::{BerthError, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Read a compose file without interpolation
    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let content = Self::read(path)?;
        Self::parse_str(&content)
    }

    /// Read a compose file and interpolate it against `env`
    pub fn parse_file_with_env(path: &Path, env: &HashMap<String, String>) -> Result<ComposeConfig> {
        let content = Self::read(path)?;
        Self::parse_with_env(&content, env)
    }

    fn read(path: &Path) -> Result<String> {
        std::fs::read_to_string(path).map_err(|e| {
            BerthError::ComposeParse(format!("Failed to read {}: {}", path.display(), e))
        })
    }

    /// Parse compose content as written, `${VAR}` references intact
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| BerthError::ComposeParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Parse compose content, substituting every variable reference first.
    /// Fails with [`BerthError::UndefinedVariables`] when a reference has no
    /// definition in `env`.
    pub fn parse_with_env(content: &str, env: &HashMap<String, String>) -> Result<ComposeConfig> {
        let mut doc: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| BerthError::ComposeParse(format!("Failed to parse YAML: {}", e)))?;
        interpolate::interpolate_value(&mut doc, env)?;
        serde_yaml::from_value(doc)
            .map_err(|e| BerthError::ComposeParse(format!("Invalid compose structure: {}", e)))
    }

    /// Variables referenced by the compose content
    pub fn referenced_variables(content: &str) -> Result<Vec<String>> {
        let doc: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| BerthError::ComposeParse(format!("Failed to parse YAML: {}", e)))?;
        Ok(interpolate::value_references(&doc))
    }

    /// Parse multiple compose files (with merging)
    pub fn parse_files(paths: &[&Path], env: &HashMap<String, String>) -> Result<ComposeConfig> {
        let mut config = ComposeConfig::default();

        for path in paths {
            let file_config = Self::parse_file_with_env(path, env)?;
            config = Self::merge_configs(config, file_config);
        }

        Ok(config)
    }

    /// Merge two compose configurations, overlay wins per field
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }
        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            match result.services.get_mut(&name) {
                Some(existing) => {
                    macro_rules! overlay_fields {
                        ($($field:ident),*) => {
                            $(if service.$field.is_some() {
                                existing.$field = service.$field;
                            })*
                        };
                    }
                    overlay_fields!(
                        image,
                        build,
                        container_name,
                        command,
                        entrypoint,
                        env_file,
                        environment,
                        ports,
                        expose,
                        volumes,
                        restart,
                        depends_on,
                        healthcheck,
                        working_dir
                    );
                }
                None => {
                    result.services.insert(name, service);
                }
            }
        }

        for (name, volume) in overlay.volumes {
            result.volumes.insert(name, volume);
        }

        result
    }

    /// Validate compose configuration. Returns warnings for suspicious but
    /// runnable configurations and fails on anything the orchestrator
    /// cannot materialize.
    pub fn validate(config: &ComposeConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if config.services.is_empty() {
            return Err(BerthError::Validation("No services defined".to_string()));
        }

        let mut container_names: HashSet<&str> = HashSet::new();

        for (name, service) in &config.services {
            // Service must have either image or build
            if service.image.is_none() && service.build.is_none() {
                return Err(BerthError::Validation(format!(
                    "Service '{}' must have either 'image' or 'build' specified",
                    name
                )));
            }

            if let Some(container_name) = service.container_name.as_deref() {
                if !container_names.insert(container_name) {
                    return Err(BerthError::Validation(format!(
                        "Container name '{}' is used by more than one service",
                        container_name
                    )));
                }
            }

            for dep in service.dependencies()? {
                if dep.service == *name {
                    return Err(BerthError::Validation(format!(
                        "Service '{}' depends on itself",
                        name
                    )));
                }
                if !config.services.contains_key(&dep.service) {
                    return Err(BerthError::Validation(format!(
                        "Service '{}' depends on undefined service '{}'",
                        name, dep.service
                    )));
                }
            }

            service.port_bindings()?;
            service.restart_policy()?;

            for mount in service.mounts()? {
                if let Some(volume) = mount.volume_name() {
                    if !config.volumes.contains_key(volume) {
                        return Err(BerthError::Validation(format!(
                            "Service '{}' mounts undeclared volume '{}'",
                            name, volume
                        )));
                    }
                }
            }

            if let Some(hc) = &service.healthcheck {
                if hc.is_enabled() {
                    hc.readiness_budget()?;
                }
            }
        }

        if let Some(project) = &config.name {
            Self::check_container_names(config, project)?;
        }

        for volume in config.volumes.keys() {
            if config.volume_users(volume)?.is_empty() {
                warnings.push(format!("Volume '{}' is declared but not mounted", volume));
            }
        }

        Ok(warnings)
    }

    /// Container names must be unique once the unnamed services get their
    /// `<project>-<service>-1` names
    pub fn check_container_names(config: &ComposeConfig, project: &str) -> Result<()> {
        let mut owners: HashMap<String, &str> = HashMap::new();
        for (name, service) in &config.services {
            let container = service
                .container_name
                .clone()
                .unwrap_or_else(|| format!("{}-{}-1", project, name));
            if let Some(other) = owners.insert(container.clone(), name) {
                return Err(BerthError::Validation(format!(
                    "Container name '{}' is used by both '{}' and '{}'",
                    container, other, name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = r#"
services:
  app:
    build: .
    container_name: app
    ports:
      - "8000:8000"
    depends_on:
      - redis
      - postgres
  redis:
    image: redis:7
    container_name: redis
    command: redis-server --requirepass ${REDIS_PASSWORD}
    restart: always
  postgres:
    image: postgres:16
    container_name: postgres
    restart: always
    volumes:
      - postgres_data:/var/lib/postgresql/data
volumes:
  postgres_data:
"#;

    #[test]
    fn test_parse_stack() {
        let config = ComposeParser::parse_str(STACK).unwrap();
        assert_eq!(config.services.len(), 3);
        assert!(config.volumes.contains_key("postgres_data"));
        assert!(ComposeParser::validate(&config).unwrap().is_empty());
    }

    #[test]
    fn test_validate_missing_image() {
        let yaml = r#"
services:
  web:
    ports:
      - "80:80"
"#;

        let config = ComposeParser::parse_str(yaml).unwrap();
        assert!(ComposeParser::validate(&config).is_err());
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let yaml = r#"
services:
  app:
    build: .
    depends_on: [redis, postgres]
  redis:
    image: redis
"#;
        let config = ComposeParser::parse_str(yaml).unwrap();
        let err = ComposeParser::validate(&config).unwrap_err();
        assert!(err.to_string().contains("postgres"));
    }

    #[test]
    fn test_validate_duplicate_container_name() {
        let yaml = r#"
services:
  a:
    image: x
    container_name: same
  b:
    image: y
    container_name: same
"#;
        let config = ComposeParser::parse_str(yaml).unwrap();
        assert!(ComposeParser::validate(&config).is_err());
    }

    #[test]
    fn test_explicit_name_colliding_with_derived_name() {
        let yaml = r#"
name: demo
services:
  db:
    image: postgres
  web:
    image: nginx
    container_name: demo-db-1
"#;
        let config = ComposeParser::parse_str(yaml).unwrap();
        let err = ComposeParser::validate(&config).unwrap_err();
        assert!(err.to_string().contains("demo-db-1"));

        assert!(ComposeParser::check_container_names(&config, "demo").is_err());
        assert!(ComposeParser::check_container_names(&config, "other").is_ok());
    }

    #[test]
    fn test_validate_undeclared_volume() {
        let yaml = r#"
services:
  db:
    image: postgres
    volumes:
      - pgdata:/var/lib/postgresql/data
"#;
        let config = ComposeParser::parse_str(yaml).unwrap();
        assert!(ComposeParser::validate(&config).is_err());
    }

    #[test]
    fn test_parse_with_env() {
        let mut env = HashMap::new();
        env.insert("REDIS_PASSWORD".to_string(), "pw".to_string());
        let config = ComposeParser::parse_with_env(STACK, &env).unwrap();
        let args = config.services["redis"].command_args().unwrap();
        assert_eq!(args, vec!["redis-server", "--requirepass", "pw"]);
    }

    #[test]
    fn test_parse_with_empty_env_fails() {
        let err = ComposeParser::parse_with_env(STACK, &HashMap::new()).unwrap_err();
        match err {
            BerthError::UndefinedVariables(names) => assert_eq!(names, vec!["REDIS_PASSWORD"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_referenced_variables() {
        assert_eq!(
            ComposeParser::referenced_variables(STACK).unwrap(),
            vec!["REDIS_PASSWORD"]
        );
    }

    #[test]
    fn test_merge_overlay() {
        let base = ComposeParser::parse_str(STACK).unwrap();
        let overlay = ComposeParser::parse_str(
            r#"
services:
  app:
    restart: on-failure
  worker:
    image: worker
"#,
        )
        .unwrap();
        let merged = ComposeParser::merge_configs(base, overlay);
        assert_eq!(merged.services.len(), 4);
        assert_eq!(merged.services["app"].restart.as_deref(), Some("on-failure"));
        assert_eq!(merged.services["app"].container_name.as_deref(), Some("app"));
    }

    #[test]
    fn test_find_compose_file() {
        let temp = tempfile::tempdir().unwrap();
        assert!(ComposeParser::find_compose_file(temp.path()).is_none());
        std::fs::write(temp.path().join("docker-compose.yml"), STACK).unwrap();
        let found = ComposeParser::find_compose_file(temp.path()).unwrap();
        assert!(found.ends_with("docker-compose.yml"));
    }
}
