//! The contacts stack
//!
//! The three-service composition shipped under `deploy/`, expressed as
//! code: API built from source, password-protected cache, and a database
//! persisted in a named volume. Rendering produces the compose file, the
//! API's build recipe, its Python requirements and the env template.

use crate::build::{BuildRecipe, DEFAULT_RECIPE_FILE};
use crate::compose::config::{
    BuildConfig, CommandConfig, ComposeConfig, DependsOnConfig, EnvFileConfig, EnvironmentConfig,
    PortConfig, ServiceConfig, VolumeMount,
};
use crate::env::{EnvFile, APP_SETTINGS};
use crate::error::Result;
use crate::topology::StackContract;
use std::path::{Path, PathBuf};

/// File name of the rendered compose file
pub const COMPOSE_FILE: &str = "docker-compose.yml";
/// File name of the rendered env template
pub const ENV_TEMPLATE_FILE: &str = ".env.example";
/// Python requirements installed into the API image
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

const API_REQUIREMENTS: &[&str] = &[
    "fastapi",
    "uvicorn[standard]",
    "sqlalchemy[asyncio]",
    "asyncpg",
    "alembic",
    "pydantic[email]",
    "pydantic-settings",
    "python-jose[cryptography]",
    "passlib[bcrypt]",
    "python-multipart",
    "redis",
    "slowapi",
    "fastapi-mail",
    "cloudinary",
    "libgravatar",
    "pytest",
    "pytest-asyncio",
    "aiosqlite",
    "httpx",
];

/// Contacts stack definition
#[derive(Debug, Clone)]
pub struct ContactsStack {
    pub contract: StackContract,
    pub cache_image: String,
    pub database_image: String,
    /// Base image of the API build
    pub base_image: String,
    /// Source directory inside the API container
    pub app_dir: String,
    /// Where the database keeps its files
    pub database_data_dir: String,
    pub database_name: String,
    /// Packages the API image installs
    pub requirements: Vec<String>,
}

impl Default for ContactsStack {
    fn default() -> Self {
        Self {
            contract: StackContract::default(),
            cache_image: "redis:7".to_string(),
            database_image: "postgres:16".to_string(),
            base_image: "python:3.11-slim".to_string(),
            app_dir: "/app".to_string(),
            database_data_dir: "/var/lib/postgresql/data".to_string(),
            database_name: "contacts".to_string(),
            requirements: API_REQUIREMENTS.iter().map(|r| r.to_string()).collect(),
        }
    }
}

fn same_port(port: u16) -> Vec<PortConfig> {
    vec![PortConfig::Short(format!("{}:{}", port, port))]
}

impl ContactsStack {
    pub fn contract(&self) -> &StackContract {
        &self.contract
    }

    /// The composition, variable references left in place
    pub fn compose(&self) -> ComposeConfig {
        let c = &self.contract;
        let env_file = Some(EnvFileConfig::Single(c.env_file.clone()));

        let app = ServiceConfig {
            build: Some(BuildConfig::Simple(".".to_string())),
            container_name: Some(c.app.clone()),
            env_file: env_file.clone(),
            ports: Some(same_port(c.app_port)),
            volumes: Some(vec![VolumeMount::Short(format!(".:{}", self.app_dir))]),
            depends_on: Some(DependsOnConfig::Array(vec![
                c.cache.clone(),
                c.database.clone(),
            ])),
            ..ServiceConfig::default()
        };

        let cache = ServiceConfig {
            image: Some(self.cache_image.clone()),
            container_name: Some(c.cache.clone()),
            command: Some(CommandConfig::Shell(format!(
                "redis-server --requirepass ${{{}}}",
                c.cache_password_var
            ))),
            env_file: env_file.clone(),
            ports: Some(same_port(c.cache_port)),
            restart: Some("always".to_string()),
            ..ServiceConfig::default()
        };

        let database = ServiceConfig {
            image: Some(self.database_image.clone()),
            container_name: Some(c.database.clone()),
            env_file,
            environment: Some(EnvironmentConfig::Array(vec![format!(
                "PGDATA={}",
                self.database_data_dir
            )])),
            ports: Some(same_port(c.database_port)),
            volumes: Some(vec![VolumeMount::Short(format!(
                "{}:{}",
                c.data_volume, self.database_data_dir
            ))]),
            restart: Some("always".to_string()),
            ..ServiceConfig::default()
        };

        let mut config = ComposeConfig::default();
        config.services.insert(c.app.clone(), app);
        config.services.insert(c.cache.clone(), cache);
        config.services.insert(c.database.clone(), database);
        config.volumes.insert(c.data_volume.clone(), None);
        config
    }

    pub fn render_compose(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.compose())?)
    }

    /// Build recipe of the API image
    pub fn render_recipe(&self) -> String {
        let port = self.contract.app_port;
        [
            format!("FROM {}", self.base_image),
            String::new(),
            format!("WORKDIR {}", self.app_dir),
            String::new(),
            format!("COPY {} .", REQUIREMENTS_FILE),
            format!("RUN pip install --no-cache-dir -r {}", REQUIREMENTS_FILE),
            String::new(),
            "COPY . .".to_string(),
            String::new(),
            format!("EXPOSE {}", port),
            String::new(),
            format!(
                "CMD [\"uvicorn\", \"main:app\", \"--host\", \"0.0.0.0\", \"--port\", \"{}\"]",
                port
            ),
        ]
        .join("\n")
            + "\n"
    }

    /// One requirement per line, as pip reads it
    pub fn render_requirements(&self) -> String {
        let mut out = self.requirements.join("\n");
        out.push('\n');
        out
    }

    pub fn recipe(&self) -> Result<BuildRecipe> {
        BuildRecipe::parse(&self.render_recipe())
    }

    /// Env template: every application setting (placeholders for the
    /// required ones) plus what the database image reads
    pub fn env_template(&self) -> EnvFile {
        let c = &self.contract;
        let mut env = EnvFile::default();
        for setting in APP_SETTINGS {
            env.set(setting.name, setting.default.unwrap_or("change-me"));
        }
        env.set(
            "DB_URL",
            &format!(
                "postgresql+asyncpg://postgres:postgres@{}:{}/{}",
                c.database, c.database_port, self.database_name
            ),
        );
        env.set("REDIS_HOST", &c.cache);
        env.set("POSTGRES_USER", "postgres");
        env.set("POSTGRES_PASSWORD", "postgres");
        env.set("POSTGRES_DB", &self.database_name);
        env
    }

    pub fn render_env_template(&self) -> String {
        format!(
            "# Copy to {} and replace the placeholders\n{}",
            self.contract.env_file,
            self.env_template().render()
        )
    }

    /// Write compose file, build recipe, requirements and env template into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let files = [
            (COMPOSE_FILE, self.render_compose()?),
            (DEFAULT_RECIPE_FILE, self.render_recipe()),
            (REQUIREMENTS_FILE, self.render_requirements()),
            (ENV_TEMPLATE_FILE, self.render_env_template()),
        ];

        let mut written = Vec::new();
        for (name, content) in files {
            let path = dir.join(name);
            std::fs::write(&path, content)?;
            tracing::info!("Wrote {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildContext, ImageBuilder};
    use crate::compose::ComposeParser;
    use crate::env::EnvContract;
    use crate::topology::StartPlan;

    #[test]
    fn test_rendered_stack_satisfies_contract() {
        let stack = ContactsStack::default();
        let config = ComposeParser::parse_str(&stack.render_compose().unwrap()).unwrap();
        let recipe = stack.recipe().unwrap();

        let report = stack.contract().check(&config, Some(&recipe)).unwrap();
        assert!(report.is_ok(), "{:?}", report.violations);
        assert!(ComposeParser::validate(&config).unwrap().is_empty());
    }

    #[test]
    fn test_rendered_stack_plan() {
        let config = ContactsStack::default().compose();
        let plan = StartPlan::from_config(&config).unwrap();
        assert_eq!(plan.order(), vec!["postgres", "redis", "app"]);
    }

    #[test]
    fn test_recipe_launches_public_server() {
        let recipe = ContactsStack::default().recipe().unwrap();
        assert_eq!(recipe.base_image().as_deref(), Some("python:3.11-slim"));
        assert_eq!(recipe.exposed_ports(), vec![8000]);
        let launch = recipe.launch_command().unwrap();
        assert_eq!(launch.module, "main");
        assert_eq!(launch.app, "app");
        assert!(launch.binds_all_interfaces());
    }

    #[test]
    fn test_env_template_satisfies_settings_contract() {
        let env = EnvFile::parse(&ContactsStack::default().render_env_template()).unwrap();
        let check = EnvContract::app().check(&env.to_map());
        assert!(check.is_ok(), "{:?}", check);
        assert_eq!(env.get("REDIS_HOST"), Some("redis"));
        assert!(env.get("DB_URL").unwrap().contains("@postgres:5432/"));
    }

    const SHIPPED_COMPOSE: &str = include_str!("../deploy/docker-compose.yml");
    const SHIPPED_RECIPE: &str = include_str!("../deploy/Dockerfile");
    const SHIPPED_ENV: &str = include_str!("../deploy/.env.example");
    const SHIPPED_REQUIREMENTS: &str = include_str!("../deploy/requirements.txt");

    #[test]
    fn test_shipped_compose_matches_definition() {
        let shipped = ComposeParser::parse_str(SHIPPED_COMPOSE).unwrap();
        assert_eq!(
            serde_yaml::to_value(&shipped).unwrap(),
            serde_yaml::to_value(ContactsStack::default().compose()).unwrap()
        );
    }

    #[test]
    fn test_shipped_stack_satisfies_contract() {
        let stack = ContactsStack::default();
        let config = ComposeParser::parse_str(SHIPPED_COMPOSE).unwrap();
        let recipe = BuildRecipe::parse(SHIPPED_RECIPE).unwrap();

        let report = stack.contract().check(&config, Some(&recipe)).unwrap();
        assert!(report.is_ok(), "{:?}", report.violations);
        // The API has no restart policy while its dependencies do
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, crate::topology::Finding::RestartAsymmetry { service, .. } if service == "app")));
    }

    #[test]
    fn test_shipped_compose_requires_cache_password() {
        let empty = std::collections::HashMap::new();
        match ComposeParser::parse_with_env(SHIPPED_COMPOSE, &empty) {
            Err(crate::BerthError::UndefinedVariables(names)) => {
                assert_eq!(names, vec!["REDIS_PASSWORD".to_string()])
            }
            other => panic!("expected undefined variables, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_shipped_recipe_matches_definition() {
        let shipped = BuildRecipe::parse(SHIPPED_RECIPE).unwrap();
        let rendered = ContactsStack::default().recipe().unwrap();
        assert_eq!(shipped.base_image(), rendered.base_image());
        assert_eq!(shipped.working_dir(), Some("/app"));
        assert_eq!(shipped.exposed_ports(), vec![8000]);
        assert_eq!(shipped.run_steps(), rendered.run_steps());
        assert_eq!(
            shipped.launch_command().unwrap(),
            rendered.launch_command().unwrap()
        );
    }

    #[test]
    fn test_shipped_env_template_matches_definition() {
        let shipped = EnvFile::parse(SHIPPED_ENV).unwrap();
        let rendered = EnvFile::parse(&ContactsStack::default().render_env_template()).unwrap();
        assert_eq!(shipped, rendered);
    }

    #[test]
    fn test_shipped_requirements_match_definition() {
        assert_eq!(SHIPPED_REQUIREMENTS, ContactsStack::default().render_requirements());
    }

    #[test]
    fn test_write_to() {
        let temp = tempfile::tempdir().unwrap();
        let written = ContactsStack::default().write_to(temp.path()).unwrap();
        assert_eq!(written.len(), 4);
        assert!(temp.path().join("Dockerfile").exists());
        assert!(temp.path().join(REQUIREMENTS_FILE).exists());
        assert!(ComposeParser::find_compose_file(temp.path()).is_some());
    }

    #[test]
    fn test_rendered_directory_is_buildable() {
        let temp = tempfile::tempdir().unwrap();
        ContactsStack::default().write_to(temp.path()).unwrap();
        let ctx = BuildContext::new(temp.path().to_path_buf());
        let plan = ImageBuilder::new(ctx).prepare().unwrap();
        assert_eq!(
            plan.recipe.run_steps(),
            vec!["pip install --no-cache-dir -r requirements.txt"]
        );
    }
}
