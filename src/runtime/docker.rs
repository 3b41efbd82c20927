//! Docker CLI runtime
//!
//! Drives a local docker engine through the `docker` binary. Restart
//! policies are handed to the engine with `--restart`, so the engine
//! supervises crashed containers itself.

use super::{
    host_port_free, ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus, HealthStatus,
    SERVICE_LABEL, PROJECT_LABEL,
};
use crate::build::BuildPlan;
use crate::compose::mounts::Mount;
use crate::compose::ports::PortBinding;
use crate::error::{BerthError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Runtime backed by the `docker` command line client
#[derive(Debug, Clone)]
pub struct DockerCliRuntime {
    binary: String,
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCliRuntime {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<Output> {
        self.run_with_env(args, &BTreeMap::new()).await
    }

    /// Run with `env` added to the client's environment. Values never
    /// appear in the logged command line.
    async fn run_with_env(&self, args: &[String], env: &BTreeMap<String, String>) -> Result<Output> {
        tracing::debug!(">>> {} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .envs(env)
            .output()
            .await
            .map_err(|e| BerthError::Runtime(format!("Failed to run {}: {}", self.binary, e)))
    }

    /// Run and fail with stderr unless the command succeeded
    async fn run_checked(&self, args: &[String]) -> Result<String> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(BerthError::Runtime(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Whether the command exits zero; output is discarded
    async fn succeeds(&self, args: &[String]) -> Result<bool> {
        Ok(self.run(args).await?.status.success())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Arguments for `docker build`
pub fn build_args(plan: &BuildPlan) -> Vec<String> {
    let ctx = &plan.context;
    let mut args = strings(&["build", "--file"]);
    args.push(ctx.recipe_file.display().to_string());

    let mut tags = ctx.tags.clone();
    if tags.is_empty() {
        tags.push(plan.image_id.replace("sha256:", "berth-build:")[..24].to_string());
    }
    for tag in tags {
        args.push("--tag".to_string());
        args.push(tag);
    }
    for (key, value) in &ctx.build_args {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }
    if let Some(target) = &ctx.target {
        args.push("--target".to_string());
        args.push(target.clone());
    }
    args.push(ctx.context_dir.display().to_string());
    args
}

fn publish_arg(binding: &PortBinding) -> String {
    let mut arg = String::new();
    if let Some(ip) = &binding.host_ip {
        if ip.contains(':') {
            arg.push_str(&format!("[{}]:", ip));
        } else {
            arg.push_str(&format!("{}:", ip));
        }
    }
    if let Some(port) = binding.host_port {
        arg.push_str(&format!("{}:", port));
    }
    arg.push_str(&format!("{}/{}", binding.container_port, binding.protocol));
    arg
}

fn mount_arg(mount: &Mount) -> String {
    match mount {
        Mount::Volume {
            name,
            target,
            read_only,
        } => format!("{}:{}{}", name, target, if *read_only { ":ro" } else { "" }),
        Mount::Bind {
            source,
            target,
            read_only,
        } => format!("{}:{}{}", source, target, if *read_only { ":ro" } else { "" }),
        Mount::Anonymous { target } => target.clone(),
    }
}

/// Quote a word for `/bin/sh`, leaving plain words untouched
fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

fn go_duration(d: Duration) -> String {
    format!("{}ms", d.as_millis())
}

/// Arguments for `docker create`
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = strings(&["create", "--name"]);
    args.push(spec.name.clone());

    let mut labels = spec.labels.clone();
    labels
        .entry(SERVICE_LABEL.to_string())
        .or_insert_with(|| spec.service.clone());
    for (key, value) in &labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    // values reach docker through its own environment, see `create`
    for key in spec.env.keys() {
        args.push("--env".to_string());
        args.push(key.clone());
    }
    for binding in &spec.ports {
        args.push("--publish".to_string());
        args.push(publish_arg(binding));
    }
    for mount in &spec.mounts {
        args.push("--volume".to_string());
        args.push(mount_arg(mount));
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
        for alias in &spec.aliases {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
    }
    if let Some(dir) = &spec.working_dir {
        args.push("--workdir".to_string());
        args.push(dir.clone());
    }
    if let Some(policy) = &spec.restart {
        args.push("--restart".to_string());
        args.push(policy.to_string());
    }
    if let Some(probe) = &spec.healthcheck {
        let test = match probe.test.first().map(String::as_str) {
            // docker runs --health-cmd through the shell
            Some("CMD") => probe.test[1..]
                .iter()
                .map(|w| shell_quote(w))
                .collect::<Vec<_>>()
                .join(" "),
            Some("CMD-SHELL") => probe.test[1..].join(" "),
            _ => probe.test.join(" "),
        };
        args.push("--health-cmd".to_string());
        args.push(test);
        args.push("--health-interval".to_string());
        args.push(go_duration(probe.interval));
        args.push("--health-timeout".to_string());
        args.push(go_duration(probe.timeout));
        args.push("--health-retries".to_string());
        args.push(probe.retries.to_string());
        args.push("--health-start-period".to_string());
        args.push(go_duration(probe.start_period));
    }
    if let Some((first, rest)) = spec.entrypoint.split_first() {
        // docker takes only the executable here; the rest joins the command
        args.push("--entrypoint".to_string());
        args.push(first.clone());
        args.push(spec.image.clone());
        args.extend(rest.iter().cloned());
    } else {
        args.push(spec.image.clone());
    }
    args.extend(spec.command.iter().cloned());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspect {
    id: String,
    name: String,
    #[serde(default)]
    restart_count: u32,
    state: InspectState,
    config: InspectConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    exit_code: i32,
    #[serde(default)]
    started_at: String,
    #[serde(default)]
    finished_at: String,
    #[serde(default)]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

/// Docker reports "never" as the zero time
fn docker_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.timestamp() > 0)
}

/// Parse one element of `docker inspect` output
pub fn parse_inspect(json: &str, ports: Vec<PortBinding>) -> Result<ContainerState> {
    let mut entries: Vec<Inspect> = serde_json::from_str(json)?;
    let entry = entries
        .pop()
        .ok_or_else(|| BerthError::Runtime("empty inspect output".to_string()))?;

    let status = ContainerStatus::from_docker(&entry.state.status);
    let exit_code = match status {
        ContainerStatus::Exited | ContainerStatus::Dead => Some(entry.state.exit_code),
        _ => None,
    };

    Ok(ContainerState {
        id: entry.id.chars().take(12).collect(),
        name: entry.name.trim_start_matches('/').to_string(),
        service: entry
            .config
            .labels
            .as_ref()
            .and_then(|l| l.get(SERVICE_LABEL).cloned())
            .unwrap_or_default(),
        image: entry.config.image,
        status,
        health: entry
            .state
            .health
            .map(|h| HealthStatus::from_docker(&h.status))
            .unwrap_or(HealthStatus::None),
        exit_code,
        started_at: docker_time(&entry.state.started_at),
        finished_at: docker_time(&entry.state.finished_at),
        restart_count: entry.restart_count,
        ports,
        labels: entry.config.labels.unwrap_or_default(),
    })
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn applies_restart_policy(&self) -> bool {
        true
    }

    async fn build_image(&self, plan: &BuildPlan) -> Result<String> {
        let args = build_args(plan);
        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(10).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(BerthError::Build(tail.join("\n")));
        }
        // first --tag follows "--tag"
        let reference = args
            .iter()
            .position(|a| a == "--tag")
            .and_then(|i| args.get(i + 1))
            .cloned()
            .unwrap_or_else(|| plan.image_id.clone());
        Ok(reference)
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.succeeds(&strings(&["image", "inspect", image])).await
    }

    async fn image_id(&self, image: &str) -> Result<Option<String>> {
        let output = self
            .run(&strings(&["image", "inspect", "--format", "{{.Id}}", image]))
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Some(id).filter(|id| !id.is_empty()))
    }

    async fn ensure_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<bool> {
        if self.succeeds(&strings(&["volume", "inspect", name])).await? {
            return Ok(false);
        }
        let mut args = strings(&["volume", "create"]);
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        self.run_checked(&args).await?;
        Ok(true)
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.run_checked(&strings(&["volume", "rm", name])).await?;
        Ok(())
    }

    async fn ensure_network(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        if self.succeeds(&strings(&["network", "inspect", name])).await? {
            return Ok(());
        }
        let mut args = strings(&["network", "create"]);
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        self.run_checked(&args).await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        if self.succeeds(&strings(&["network", "inspect", name])).await? {
            self.run_checked(&strings(&["network", "rm", name])).await?;
        }
        Ok(())
    }

    async fn port_available(&self, binding: &PortBinding) -> Result<bool> {
        Ok(host_port_free(binding).await)
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self.run_with_env(&create_args(spec), &spec.env).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout)
                .trim()
                .chars()
                .take(12)
                .collect());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("is already in use") {
            Err(BerthError::ContainerExists(spec.name.clone()))
        } else {
            Err(BerthError::Container(stderr.trim().to_string()))
        }
    }

    async fn start(&self, name: &str) -> Result<()> {
        let output = self.run(&strings(&["start", name])).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("port is already allocated") || stderr.contains("address already in use")
        {
            return Err(BerthError::PortConflict {
                port: 0,
                owner: stderr.trim().to_string(),
            });
        }
        Err(BerthError::Container(stderr.trim().to_string()))
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        self.run_checked(&[
            "stop".to_string(),
            "--time".to_string(),
            timeout.as_secs().to_string(),
            name.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.run_checked(&strings(&["rm", name])).await?;
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>> {
        let output = self
            .run(&strings(&["container", "inspect", name]))
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let ports_out = self.run(&strings(&["port", name])).await?;
        let ports = String::from_utf8_lossy(&ports_out.stdout)
            .lines()
            .filter_map(parse_port_line)
            .collect();
        parse_inspect(&String::from_utf8_lossy(&output.stdout), ports).map(Some)
    }

    async fn list(&self, project: &str) -> Result<Vec<ContainerState>> {
        let names = self
            .run_checked(&[
                "ps".to_string(),
                "--all".to_string(),
                "--filter".to_string(),
                format!("label={}={}", PROJECT_LABEL, project),
                "--format".to_string(),
                "{{.Names}}".to_string(),
            ])
            .await?;

        let mut names: Vec<&str> = names.lines().filter(|l| !l.is_empty()).collect();
        names.sort();

        let mut states = Vec::new();
        for name in names {
            if let Some(state) = self.inspect(name).await? {
                states.push(state);
            }
        }
        Ok(states)
    }
}

/// Parse a `docker port` line such as `8000/tcp -> 0.0.0.0:8000`
fn parse_port_line(line: &str) -> Option<PortBinding> {
    let (container, host) = line.split_once(" -> ")?;
    let (port, proto) = container.split_once('/')?;
    let (ip, host_port) = host.rsplit_once(':')?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    Some(PortBinding {
        host_ip: match ip {
            "0.0.0.0" | "::" => None,
            other => Some(other.to_string()),
        },
        host_port: host_port.parse().ok(),
        container_port: port.parse().ok()?,
        protocol: proto.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildContext, ImageBuilder};
    use crate::runtime::HealthProbe;
    use crate::supervisor::RestartPolicy;

    #[test]
    fn test_create_args_for_cache() {
        let mut spec = ContainerSpec::new("redis", "redis", "redis:7");
        spec.command = strings(&["redis-server", "--requirepass", "s3cret"]);
        spec.ports.push(PortBinding::same(6379));
        spec.restart = Some(RestartPolicy::Always);
        spec.network = Some("contacts_default".to_string());
        spec.aliases.push("redis".to_string());
        spec.env.insert("REDIS_PASSWORD".to_string(), "s3cret".to_string());
        spec.labels
            .insert(PROJECT_LABEL.to_string(), "contacts".to_string());

        let args = create_args(&spec);
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name redis"));
        assert!(joined.contains("--label com.docker.compose.project=contacts"));
        assert!(joined.contains("--label com.docker.compose.service=redis"));
        assert!(joined.contains("--publish 6379:6379/tcp"));
        assert!(joined.contains("--restart always"));
        assert!(joined.contains("--network contacts_default --network-alias redis"));
        assert!(joined.contains("--env REDIS_PASSWORD --publish"));
        assert!(!joined.contains("REDIS_PASSWORD=s3cret"));
        assert!(joined.ends_with("redis:7 redis-server --requirepass s3cret"));
    }

    #[test]
    fn test_health_cmd_exec_form_is_quoted() {
        let mut spec = ContainerSpec::new("redis", "redis", "redis:7");
        spec.healthcheck = Some(HealthProbe {
            test: strings(&["CMD", "redis-cli", "-a", "p w'd", "ping"]),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            retries: 5,
            start_period: Duration::ZERO,
        });
        let args = create_args(&spec);
        let at = args.iter().position(|a| a == "--health-cmd").unwrap();
        assert_eq!(args[at + 1], "redis-cli -a 'p w'\\''d' ping");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("pg_isready"), "pg_isready");
        assert_eq!(shell_quote("--port=5432"), "--port=5432");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_create_args_mounts_and_health() {
        let mut spec = ContainerSpec::new("postgres", "postgres", "postgres:16");
        spec.mounts.push(Mount::Volume {
            name: "contacts_postgres_data".to_string(),
            target: "/var/lib/postgresql/data".to_string(),
            read_only: false,
        });
        spec.mounts.push(Mount::Bind {
            source: "/srv/init".to_string(),
            target: "/docker-entrypoint-initdb.d".to_string(),
            read_only: true,
        });
        spec.healthcheck = Some(HealthProbe {
            test: strings(&["CMD-SHELL", "pg_isready -U postgres"]),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            retries: 5,
            start_period: Duration::ZERO,
        });

        let joined = create_args(&spec).join(" ");
        assert!(joined.contains("--volume contacts_postgres_data:/var/lib/postgresql/data"));
        assert!(joined.contains("--volume /srv/init:/docker-entrypoint-initdb.d:ro"));
        assert!(joined.contains("--health-cmd pg_isready -U postgres"));
        assert!(joined.contains("--health-interval 5000ms"));
        assert!(joined.contains("--health-retries 5"));
    }

    #[test]
    fn test_entrypoint_split() {
        let mut spec = ContainerSpec::new("app", "app", "contacts-app");
        spec.entrypoint = strings(&["/bin/sh", "-c"]);
        spec.command = strings(&["echo hi"]);
        let args = create_args(&spec);
        let tail: Vec<&str> = args.iter().rev().take(5).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["--entrypoint", "/bin/sh", "contacts-app", "-c", "echo hi"]);
    }

    #[test]
    fn test_build_args() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(
            temp.path().join("Dockerfile"),
            "FROM python:3.11-slim\nCMD [\"true\"]\n",
        )
        .unwrap();
        let plan = ImageBuilder::new(
            BuildContext::new(temp.path().to_path_buf())
                .tag("contacts-app:latest")
                .arg("PIP_NO_CACHE_DIR", "1"),
        )
        .prepare()
        .unwrap();

        let args = build_args(&plan);
        assert_eq!(args[0], "build");
        assert!(args.contains(&"contacts-app:latest".to_string()));
        assert!(args.contains(&"PIP_NO_CACHE_DIR=1".to_string()));
        assert_eq!(args.last().unwrap(), &temp.path().display().to_string());
    }

    #[test]
    fn test_parse_inspect() {
        let json = r#"[{
            "Id": "4f2a9c1b7e3d8a6f5c0b",
            "Name": "/redis",
            "RestartCount": 2,
            "State": {
                "Status": "exited",
                "ExitCode": 137,
                "StartedAt": "2024-05-01T10:00:00.123456789Z",
                "FinishedAt": "2024-05-01T10:05:00Z",
                "Health": {"Status": "unhealthy"}
            },
            "Config": {
                "Image": "redis:7",
                "Labels": {"com.docker.compose.service": "redis"}
            }
        }]"#;
        let state = parse_inspect(json, Vec::new()).unwrap();
        assert_eq!(state.id, "4f2a9c1b7e3d");
        assert_eq!(state.name, "redis");
        assert_eq!(state.service, "redis");
        assert_eq!(state.status, ContainerStatus::Exited);
        assert_eq!(state.exit_code, Some(137));
        assert_eq!(state.health, HealthStatus::Unhealthy);
        assert_eq!(state.restart_count, 2);
        assert!(state.started_at.is_some());
    }

    #[test]
    fn test_never_started_has_no_time() {
        let json = r#"[{
            "Id": "abc",
            "Name": "/app",
            "State": {"Status": "created", "ExitCode": 0, "StartedAt": "0001-01-01T00:00:00Z"},
            "Config": {"Image": "contacts-app", "Labels": null}
        }]"#;
        let state = parse_inspect(json, Vec::new()).unwrap();
        assert_eq!(state.status, ContainerStatus::Created);
        assert!(state.started_at.is_none());
        assert_eq!(state.exit_code, None);
    }

    #[test]
    fn test_parse_port_line() {
        let binding = parse_port_line("8000/tcp -> 0.0.0.0:8000").unwrap();
        assert_eq!(binding, PortBinding::same(8000));
        let v6 = parse_port_line("6379/tcp -> [::1]:6379").unwrap();
        assert_eq!(v6.host_ip.as_deref(), Some("::1"));
        assert!(parse_port_line("garbage").is_none());
    }
}
