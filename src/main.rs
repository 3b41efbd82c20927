//! Berth - composition and orchestration for the contacts API stack
//!
//! This is the main CLI entry point for Berth.

use anyhow::{bail, Context};
use berth::build::BuildRecipe;
use berth::compose::{ComposeConfig, ComposeOrchestrator, ComposeParser};
use berth::docs::ReferenceIndex;
use berth::env::{resolve_environment, EnvContract, EnvFile};
use berth::runtime::{ContainerRuntime, DockerCliRuntime, MemoryRuntime};
use berth::settings::{RuntimeKind, Settings};
use berth::stack::ContactsStack;
use berth::topology::StartPlan;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Berth - contacts API stack orchestration
#[derive(Parser)]
#[command(name = "berth")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Compose, validate and run the contacts API container stack", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Compose file
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    /// Env file used for interpolation (repeatable, later files win)
    #[arg(long = "env-file", global = true)]
    env_file: Vec<PathBuf>,

    /// Project name
    #[arg(short, long = "project-name", global = true)]
    project_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the interpolated, validated compose configuration
    Config,

    /// Check the stack contract and the application settings
    Check,

    /// Print the startup waves
    Plan,

    /// Build and start the stack
    Up {
        /// Rebuild images even if they exist
        #[arg(long)]
        build: bool,
        /// Run against the in-process runtime; nothing is started
        #[arg(long)]
        dry_run: bool,
    },

    /// Stop and remove the stack's containers
    Down {
        /// Also remove named volumes
        #[arg(short, long)]
        volumes: bool,
    },

    /// List the stack's containers
    Ps {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Write the stack's compose file, build recipe, requirements and env template
    Render {
        /// Output directory
        dir: PathBuf,
    },

    /// Render the API reference index
    Docs {
        /// Write index.rst into this directory instead of printing it
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

/// A compose file with its interpolation environment
struct Project {
    name: String,
    dir: PathBuf,
    raw: String,
    env: HashMap<String, String>,
}

impl Project {
    fn load(settings: &Settings) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let compose_path = match &settings.compose_file {
            Some(path) => path.clone(),
            None => ComposeParser::find_compose_file(&cwd)
                .context("No compose file found in the current directory")?,
        };
        let raw = std::fs::read_to_string(&compose_path)
            .with_context(|| format!("Failed to read {}", compose_path.display()))?;
        let dir = compose_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.clone());

        let env_paths = if settings.env_files.is_empty() {
            let default = dir.join(".env");
            if default.is_file() {
                vec![default]
            } else {
                Vec::new()
            }
        } else {
            settings.env_files.clone()
        };
        let files = env_paths
            .iter()
            .map(|p| EnvFile::load(p).with_context(|| format!("Failed to load {}", p.display())))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let process: HashMap<String, String> = std::env::vars().collect();
        let env = resolve_environment(&files, Some(&process));

        let declared = ComposeParser::parse_str(&raw)?.name;
        let name = settings
            .project_name
            .clone()
            .or(declared)
            .unwrap_or_else(|| default_project_name(&dir));

        Ok(Self {
            name,
            dir,
            raw,
            env,
        })
    }

    /// Parsed with every reference substituted
    fn config(&self) -> anyhow::Result<ComposeConfig> {
        Ok(ComposeParser::parse_with_env(&self.raw, &self.env)?)
    }

    /// The app's build recipe, when it is built from a local context
    fn recipe(&self, config: &ComposeConfig, service: &str) -> anyhow::Result<Option<BuildRecipe>> {
        let Some((context, file)) = config.services.get(service).and_then(|s| s.build_source())
        else {
            return Ok(None);
        };
        let path = self
            .dir
            .join(context)
            .join(file.as_deref().unwrap_or(berth::build::DEFAULT_RECIPE_FILE));
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(BuildRecipe::parse_file(&path)?))
    }
}

fn default_project_name(dir: &Path) -> String {
    let base = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let name: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if name.is_empty() {
        "default".to_string()
    } else {
        name
    }
}

/// Contract and settings checks; returns false when anything blocks `up`
fn check(project: &Project) -> anyhow::Result<bool> {
    let config = project.config()?;
    let raw = ComposeParser::parse_str(&project.raw)?;
    let stack = ContactsStack::default();
    let recipe = project.recipe(&raw, &stack.contract().app)?;
    if recipe.is_none() {
        tracing::warn!("No build recipe found for {}", stack.contract().app);
    }

    for warning in ComposeParser::validate(&config)? {
        tracing::warn!("{}", warning);
    }

    let report = stack.contract().check(&raw, recipe.as_ref())?;
    for violation in &report.violations {
        tracing::error!("{}", violation);
    }
    for finding in &report.findings {
        tracing::warn!("{}", finding);
    }

    let settings = EnvContract::app().check(&project.env);
    for name in &settings.missing {
        tracing::error!("Application setting {} is not set", name);
    }
    for (name, kind) in &settings.malformed {
        tracing::error!("Application setting {} is not a valid {:?} value", name, kind);
    }
    for name in &settings.defaulted {
        tracing::debug!("Application setting {} uses its default", name);
    }

    Ok(report.is_ok() && settings.is_ok())
}

fn runtime_for(settings: &Settings, project: &str, dry_run: bool) -> anyhow::Result<Arc<dyn ContainerRuntime>> {
    if dry_run {
        let dir = std::env::temp_dir().join(format!("berth-dry-run-{}", uuid::Uuid::new_v4().simple()));
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(MemoryRuntime::new(dir)?);
        return Ok(runtime);
    }
    let runtime: Arc<dyn ContainerRuntime> = match settings.runtime {
        RuntimeKind::Docker => Arc::new(DockerCliRuntime::default()),
        RuntimeKind::Memory => Arc::new(MemoryRuntime::new(settings.volume_dir(project))?),
    };
    Ok(runtime)
}

fn orchestrator(
    project: &Project,
    settings: &Settings,
    dry_run: bool,
) -> anyhow::Result<ComposeOrchestrator> {
    let runtime = runtime_for(settings, &project.name, dry_run)?;
    Ok(ComposeOrchestrator::new(
        &project.name,
        project.config()?,
        project.env.clone(),
        runtime,
        settings.clone(),
    )
    .working_dir(project.dir.clone()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut settings = Settings::from_env()?;
    if let Some(file) = cli.file {
        settings.compose_file = Some(file);
    }
    if !cli.env_file.is_empty() {
        settings.env_files = cli.env_file;
    }
    if let Some(name) = cli.project_name {
        settings.project_name = Some(name);
    }

    match cli.command {
        Commands::Config => {
            let project = Project::load(&settings)?;
            let config = project.config()?;
            for warning in ComposeParser::validate(&config)? {
                tracing::warn!("{}", warning);
            }
            print!("{}", serde_yaml::to_string(&config)?);
        }

        Commands::Check => {
            let project = Project::load(&settings)?;
            if !check(&project)? {
                bail!("Stack {} does not satisfy its contract", project.name);
            }
            println!("Stack {} is valid", project.name);
        }

        Commands::Plan => {
            let project = Project::load(&settings)?;
            let plan = StartPlan::from_config(&project.config()?)?;
            for (i, wave) in plan.waves().iter().enumerate() {
                println!("{}: {}", i + 1, wave.join(", "));
            }
        }

        Commands::Up { build, dry_run } => {
            let project = Project::load(&settings)?;
            if !check(&project)? {
                bail!("Refusing to start {}: contract violations", project.name);
            }
            let mut orchestrator = orchestrator(&project, &settings, dry_run)?;
            let report = orchestrator.up(build).await?;

            for (service, image) in &report.built {
                println!("Built {} as {}", service, image);
            }
            for volume in &report.volumes_created {
                println!("Created volume {}", volume);
            }
            for (i, wave) in report.waves.iter().enumerate() {
                println!("Wave {}: started {}", i + 1, wave.join(", "));
            }
            if dry_run {
                println!("Dry run: nothing was started");
            }
        }

        Commands::Down { volumes } => {
            let project = Project::load(&settings)?;
            let mut orchestrator = orchestrator(&project, &settings, false)?;
            orchestrator.down(volumes).await?;
        }

        Commands::Ps { json } => {
            let project = Project::load(&settings)?;
            let orchestrator = orchestrator(&project, &settings, false)?;
            let statuses = orchestrator.status().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                println!(
                    "{:<12} {:<20} {:<12} {:<10} {:<8} PORTS",
                    "SERVICE", "CONTAINER", "STATUS", "HEALTH", "RESTARTS"
                );
                for status in statuses {
                    match status.state {
                        Some(state) => {
                            let ports: Vec<String> =
                                state.ports.iter().map(|p| p.to_string()).collect();
                            println!(
                                "{:<12} {:<20} {:<12} {:<10} {:<8} {}",
                                status.service,
                                status.container,
                                state.status.to_string(),
                                state.health.to_string(),
                                state.restart_count,
                                ports.join(", ")
                            );
                        }
                        None => println!(
                            "{:<12} {:<20} {:<12}",
                            status.service, status.container, "missing"
                        ),
                    }
                }
            }
        }

        Commands::Render { dir } => {
            for path in ContactsStack::default().write_to(&dir)? {
                println!("{}", path.display());
            }
        }

        Commands::Docs { out } => {
            let index = ReferenceIndex::default();
            match out {
                Some(dir) => println!("{}", index.write_to(&dir)?.display()),
                None => print!("{}", index.render_rst()),
            }
        }
    }

    Ok(())
}
