//! Error types for Berth

use thiserror::Error;

/// Result type for Berth operations
pub type Result<T> = std::result::Result<T, BerthError>;

/// Berth error types
#[derive(Error, Debug)]
pub enum BerthError {
    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("Invalid composition: {0}")]
    Validation(String),

    #[error("Undefined variable(s): {}", .0.join(", "))]
    UndefinedVariables(Vec<String>),

    #[error("Required variable {name} is not set: {message}")]
    RequiredVariable { name: String, message: String },

    #[error("Env file parse error at line {line}: {message}")]
    EnvFileParse { line: usize, message: String },

    #[error("Invalid port specification: {0}")]
    InvalidPort(String),

    #[error("Invalid mount specification: {0}")]
    InvalidMount(String),

    #[error("Invalid restart policy: {0}")]
    InvalidRestartPolicy(String),

    #[error("Host port {port} is already in use ({owner})")]
    PortConflict { port: u16, owner: String },

    #[error("Circular dependency between services: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Build error: {0}")]
    Build(String),

    #[error("Dockerfile parse error at line {line}: {message}")]
    DockerfileParse { line: usize, message: String },

    #[error("Container error: {0}")]
    Container(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerExists(String),

    #[error("Container already running: {0}")]
    ContainerAlreadyRunning(String),

    #[error("Container not running: {0}")]
    ContainerNotRunning(String),

    #[error("Volume error: {0}")]
    Volume(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Service {service} did not become {condition} within {seconds}s")]
    ReadinessTimeout {
        service: String,
        condition: String,
        seconds: u64,
    },

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
