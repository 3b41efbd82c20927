//! Image build step
//!
//! Prepares a build from a service's build context: locates and parses the
//! recipe, checks that everything it copies from the context exists, and
//! derives a content-addressed image id. Executing the recipe is the
//! runtime's job; a failing install step comes back as
//! [`BerthError::Build`] and aborts composition before anything starts.

use super::recipe::{BuildRecipe, DEFAULT_RECIPE_FILE};
use crate::error::{BerthError, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Dependency manifests folded into the image id when present
pub const DEPENDENCY_MANIFESTS: &[&str] = &["requirements.txt", "pyproject.toml", "poetry.lock"];

/// Build context for image building
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Context directory
    pub context_dir: PathBuf,
    /// Recipe path
    pub recipe_file: PathBuf,
    /// Build arguments
    pub build_args: BTreeMap<String, String>,
    /// Target stage (for multi-stage builds)
    pub target: Option<String>,
    /// Tags for the built image
    pub tags: Vec<String>,
}

impl BuildContext {
    /// Create a new build context using the default recipe file
    pub fn new(context_dir: PathBuf) -> Self {
        let recipe_file = context_dir.join(DEFAULT_RECIPE_FILE);
        Self {
            context_dir,
            recipe_file,
            build_args: BTreeMap::new(),
            target: None,
            tags: Vec::new(),
        }
    }

    /// Set recipe path, relative paths resolve against the context
    pub fn recipe_file(mut self, path: &str) -> Self {
        self.recipe_file = self.context_dir.join(path);
        self
    }

    /// Add build argument
    pub fn arg(mut self, key: &str, value: &str) -> Self {
        self.build_args.insert(key.to_string(), value.to_string());
        self
    }

    /// Set target stage
    pub fn target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    /// Add tag
    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }
}

/// A validated build, ready for a runtime to execute
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub context: BuildContext,
    pub recipe: BuildRecipe,
    /// `sha256:<hex>` over recipe, dependency manifests and build args
    pub image_id: String,
}

impl BuildPlan {
    /// Primary tag, falling back to the image id
    pub fn primary_tag(&self) -> &str {
        self.context
            .tags
            .first()
            .map(String::as_str)
            .unwrap_or(&self.image_id)
    }
}

/// Image builder
pub struct ImageBuilder {
    context: BuildContext,
}

impl ImageBuilder {
    /// Create a new image builder
    pub fn new(context: BuildContext) -> Self {
        Self { context }
    }

    /// Validate the context and produce a build plan
    pub fn prepare(&self) -> Result<BuildPlan> {
        let ctx = &self.context;

        if !ctx.context_dir.is_dir() {
            return Err(BerthError::Build(format!(
                "Build context {} is not a directory",
                ctx.context_dir.display()
            )));
        }

        let recipe_text = std::fs::read_to_string(&ctx.recipe_file).map_err(|e| {
            BerthError::Build(format!(
                "Failed to read recipe {}: {}",
                ctx.recipe_file.display(),
                e
            ))
        })?;
        let recipe = BuildRecipe::parse(&recipe_text)?;

        if let Some(target) = &ctx.target {
            if !recipe.stages.iter().any(|s| s.name.as_deref() == Some(target)) {
                return Err(BerthError::Build(format!("Unknown target stage '{}'", target)));
            }
        }

        for source in recipe.context_sources() {
            let is_pattern = source.contains(|c: char| matches!(c, '*' | '?' | '['));
            if source == "." || is_pattern || source.contains("://") {
                continue;
            }
            if !ctx.context_dir.join(source).exists() {
                return Err(BerthError::Build(format!(
                    "COPY source '{}' not found in build context {}",
                    source,
                    ctx.context_dir.display()
                )));
            }
        }

        let image_id = self.digest(&recipe_text)?;

        tracing::debug!(
            "Prepared build of {} from {} ({} stage(s))",
            image_id,
            ctx.recipe_file.display(),
            recipe.stages.len()
        );

        Ok(BuildPlan {
            context: ctx.clone(),
            recipe,
            image_id,
        })
    }

    fn digest(&self, recipe_text: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(recipe_text.as_bytes());

        for manifest in DEPENDENCY_MANIFESTS {
            let path = self.context.context_dir.join(manifest);
            if path.is_file() {
                hasher.update(manifest.as_bytes());
                hasher.update(std::fs::read(&path)?);
            }
        }

        for (k, v) in &self.context.build_args {
            hasher.update(format!("{}={}\n", k, v).as_bytes());
        }
        if let Some(target) = &self.context.target {
            hasher.update(target.as_bytes());
        }

        Ok(format!("sha256:{:x}", hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const RECIPE: &str = "FROM python:3.11-slim\nWORKDIR /app\nCOPY requirements.txt .\nRUN pip install -r requirements.txt\nCOPY . .\nEXPOSE 8000\nCMD [\"uvicorn\", \"main:app\", \"--host\", \"0.0.0.0\", \"--port\", \"8000\"]\n";

    fn context_with(files: &[(&str, &str)]) -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        for (name, content) in files {
            fs::write(temp.path().join(name), content).unwrap();
        }
        temp
    }

    #[test]
    fn test_prepare_valid_context() {
        let temp = context_with(&[("Dockerfile", RECIPE), ("requirements.txt", "fastapi\n")]);
        let plan = ImageBuilder::new(BuildContext::new(temp.path().to_path_buf()).tag("app:latest"))
            .prepare()
            .unwrap();
        assert!(plan.image_id.starts_with("sha256:"));
        assert_eq!(plan.image_id.len(), 71);
        assert_eq!(plan.primary_tag(), "app:latest");
        assert_eq!(plan.recipe.exposed_ports(), vec![8000]);
    }

    #[test]
    fn test_missing_manifest_fails() {
        let temp = context_with(&[("Dockerfile", RECIPE)]);
        let err = ImageBuilder::new(BuildContext::new(temp.path().to_path_buf()))
            .prepare()
            .unwrap_err();
        assert!(matches!(err, BerthError::Build(ref m) if m.contains("requirements.txt")));
    }

    #[test]
    fn test_missing_recipe_fails() {
        let temp = context_with(&[]);
        assert!(ImageBuilder::new(BuildContext::new(temp.path().to_path_buf()))
            .prepare()
            .is_err());
    }

    #[test]
    fn test_digest_tracks_dependencies() {
        let temp = context_with(&[("Dockerfile", RECIPE), ("requirements.txt", "fastapi\n")]);
        let ctx = BuildContext::new(temp.path().to_path_buf());
        let first = ImageBuilder::new(ctx.clone()).prepare().unwrap().image_id;
        let again = ImageBuilder::new(ctx.clone()).prepare().unwrap().image_id;
        assert_eq!(first, again);

        fs::write(temp.path().join("requirements.txt"), "fastapi\nredis\n").unwrap();
        let changed = ImageBuilder::new(ctx.clone()).prepare().unwrap().image_id;
        assert_ne!(first, changed);

        let with_arg = ImageBuilder::new(ctx.arg("PYTHON", "3.12")).prepare().unwrap().image_id;
        assert_ne!(changed, with_arg);
    }

    #[test]
    fn test_custom_recipe_and_unknown_target() {
        let temp = context_with(&[("Dockerfile.prod", "FROM alpine AS base\nCMD [\"true\"]\n")]);
        let ctx = BuildContext::new(temp.path().to_path_buf()).recipe_file("Dockerfile.prod");
        assert!(ImageBuilder::new(ctx.clone().target("base")).prepare().is_ok());
        assert!(ImageBuilder::new(ctx.target("release")).prepare().is_err());
    }
}
