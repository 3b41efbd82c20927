//! Startup planning
//!
//! Services are grouped into waves: every service in a wave depends only on
//! services from earlier waves, so a wave can be started concurrently once
//! the previous one is up.

use crate::compose::config::{ComposeConfig, Dependency};
use crate::error::{BerthError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Dependency-ordered startup plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPlan {
    waves: Vec<Vec<String>>,
    edges: BTreeMap<String, Vec<Dependency>>,
}

impl StartPlan {
    /// Plan every service of the configuration
    pub fn from_config(config: &ComposeConfig) -> Result<Self> {
        let mut edges = BTreeMap::new();
        for (name, service) in &config.services {
            let deps = service.dependencies()?;
            for dep in &deps {
                if !config.services.contains_key(&dep.service) {
                    return Err(BerthError::Validation(format!(
                        "Service '{}' depends on undefined service '{}'",
                        name, dep.service
                    )));
                }
            }
            edges.insert(name.clone(), deps);
        }

        let waves = Self::layer(&edges)?;
        Ok(Self { waves, edges })
    }

    /// Kahn's algorithm, one layer per wave. Names are sorted within a wave
    /// so plans are deterministic.
    fn layer(edges: &BTreeMap<String, Vec<Dependency>>) -> Result<Vec<Vec<String>>> {
        let mut remaining: BTreeMap<&str, BTreeSet<&str>> = edges
            .iter()
            .map(|(name, deps)| {
                (
                    name.as_str(),
                    deps.iter().map(|d| d.service.as_str()).collect(),
                )
            })
            .collect();

        let mut waves = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| *name)
                .collect();

            if ready.is_empty() {
                return Err(BerthError::DependencyCycle(Self::cycle_members(&remaining)));
            }

            for name in &ready {
                remaining.remove(name);
            }
            for deps in remaining.values_mut() {
                for name in &ready {
                    deps.remove(name);
                }
            }

            waves.push(ready.into_iter().map(str::to_string).collect());
        }

        Ok(waves)
    }

    /// Stuck services that reach themselves through their dependencies.
    /// Services merely waiting on a cycle are left out.
    fn cycle_members(stuck: &BTreeMap<&str, BTreeSet<&str>>) -> Vec<String> {
        stuck
            .iter()
            .filter(|(start, deps)| {
                let mut seen = BTreeSet::new();
                let mut pending: Vec<&str> = deps.iter().copied().collect();
                while let Some(node) = pending.pop() {
                    if node == **start {
                        return true;
                    }
                    if seen.insert(node) {
                        if let Some(next) = stuck.get(node) {
                            pending.extend(next.iter().copied());
                        }
                    }
                }
                false
            })
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// Startup waves, earliest first
    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    /// Flattened start order
    pub fn order(&self) -> Vec<String> {
        self.waves.iter().flatten().cloned().collect()
    }

    /// Stop order: dependents before their dependencies
    pub fn teardown_order(&self) -> Vec<String> {
        let mut order = self.order();
        order.reverse();
        order
    }

    /// Direct dependencies of `service`
    pub fn dependencies_of(&self, service: &str) -> &[Dependency] {
        self.edges.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Services that directly depend on `service`
    pub fn dependents_of(&self, service: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d.service == service))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Narrow the plan to `services` plus everything they transitively
    /// depend on
    pub fn restrict_to(&self, services: &[String]) -> Result<Self> {
        let mut keep = BTreeSet::new();
        let mut stack: Vec<String> = services.to_vec();

        while let Some(name) = stack.pop() {
            if !self.edges.contains_key(&name) {
                return Err(BerthError::ServiceNotFound(name));
            }
            if keep.insert(name.clone()) {
                stack.extend(self.dependencies_of(&name).iter().map(|d| d.service.clone()));
            }
        }

        let waves = self
            .waves
            .iter()
            .map(|wave| {
                wave.iter()
                    .filter(|s| keep.contains(*s))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|wave| !wave.is_empty())
            .collect();
        let edges = self
            .edges
            .iter()
            .filter(|(name, _)| keep.contains(*name))
            .map(|(name, deps)| (name.clone(), deps.clone()))
            .collect();

        Ok(Self { waves, edges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::config::DependencyCondition;
    use crate::compose::parser::ComposeParser;

    fn plan(yaml: &str) -> Result<StartPlan> {
        StartPlan::from_config(&ComposeParser::parse_str(yaml).unwrap())
    }

    const STACK: &str = r#"
services:
  app:
    build: .
    depends_on: [redis, postgres]
  redis:
    image: redis
  postgres:
    image: postgres
"#;

    #[test]
    fn test_app_waits_for_cache_and_database() {
        let plan = plan(STACK).unwrap();
        assert_eq!(
            plan.waves(),
            &[
                vec!["postgres".to_string(), "redis".to_string()],
                vec!["app".to_string()]
            ]
        );
        assert_eq!(plan.teardown_order(), vec!["app", "redis", "postgres"]);
        assert_eq!(plan.dependents_of("redis"), vec!["app"]);
        assert_eq!(plan.dependencies_of("app").len(), 2);
        assert!(plan
            .dependencies_of("app")
            .iter()
            .all(|d| d.condition == DependencyCondition::Started));
    }

    #[test]
    fn test_chain_order() {
        let yaml = r#"
services:
  web:
    image: nginx
    depends_on:
      - api
  api:
    image: node
    depends_on:
      - db
  db:
    image: postgres
"#;
        assert_eq!(plan(yaml).unwrap().order(), vec!["db", "api", "web"]);
    }

    #[test]
    fn test_circular_dependency_detection() {
        let yaml = r#"
services:
  a:
    image: nginx
    depends_on:
      - b
  b:
    image: nginx
    depends_on:
      - a
  c:
    image: nginx
"#;
        match plan(yaml).unwrap_err() {
            BerthError::DependencyCycle(services) => assert_eq!(services, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_excludes_waiting_services() {
        let yaml = r#"
services:
  app:
    image: nginx
    depends_on: [worker]
  worker:
    image: nginx
    depends_on: [queue]
  queue:
    image: redis
    depends_on: [broker]
  broker:
    image: redis
    depends_on: [queue]
"#;
        match plan(yaml).unwrap_err() {
            BerthError::DependencyCycle(services) => {
                assert_eq!(services, vec!["broker", "queue"])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let yaml = r#"
services:
  app:
    build: .
    depends_on: [redis]
"#;
        assert!(plan(yaml).is_err());
    }

    #[test]
    fn test_restrict_to_pulls_dependencies() {
        let yaml = r#"
services:
  app:
    build: .
    depends_on: [redis, postgres]
  redis:
    image: redis
  postgres:
    image: postgres
  adminer:
    image: adminer
    depends_on: [postgres]
"#;
        let full = plan(yaml).unwrap();
        let narrowed = full.restrict_to(&["app".to_string()]).unwrap();
        assert_eq!(narrowed.order(), vec!["postgres", "redis", "app"]);
        assert!(full.restrict_to(&["nope".to_string()]).is_err());
    }
}
