//! API reference index
//!
//! The contacts API documents itself through autodoc stubs: one section per
//! module with an `automodule` directive. This renders that index as
//! reStructuredText for the documentation builder.

use crate::error::Result;
use std::path::{Path, PathBuf};

/// One documented module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDoc {
    /// Dotted import path
    pub module: String,
    /// Section heading
    pub title: String,
}

impl ModuleDoc {
    pub fn new(module: &str, title: &str) -> Self {
        Self {
            module: module.to_string(),
            title: title.to_string(),
        }
    }

    fn render(&self) -> String {
        format!(
            "{title}\n{underline}\n\n.. automodule:: {module}\n  :members:\n  :undoc-members:\n  :show-inheritance:\n",
            title = self.title,
            underline = "=".repeat(self.title.chars().count()),
            module = self.module,
        )
    }
}

/// Reference index for a set of modules
#[derive(Debug, Clone)]
pub struct ReferenceIndex {
    pub title: String,
    pub modules: Vec<ModuleDoc>,
}

impl Default for ReferenceIndex {
    fn default() -> Self {
        Self::contacts_api()
    }
}

impl ReferenceIndex {
    /// The contacts API's documented modules, application first, then tests
    pub fn contacts_api() -> Self {
        let modules = [
            ("main", "REST API main"),
            ("src.api.auth", "REST API auth routes"),
            ("src.api.contacts", "REST API contacts routes"),
            ("src.api.users", "REST API users routes"),
            ("src.conf.config", "REST API configuration"),
            ("src.database.db", "REST API database session"),
            ("src.database.models", "REST API database models"),
            ("src.repository.contacts", "REST API contacts repository"),
            ("src.repository.users", "REST API users repository"),
            ("src.schemas", "REST API schemas"),
            ("src.services.auth", "REST API auth service"),
            ("src.services.contacts", "REST API contacts service"),
            ("src.services.email", "REST API email service"),
            ("src.services.upload_file", "REST API upload file service"),
            ("src.services.users", "REST API users service"),
            ("tests.conftest", "Test fixtures"),
            ("tests.test_contact_repository_unit", "Contacts repository unit tests"),
            ("tests.test_users_repository_unit", "Users repository unit tests"),
            ("tests.test_integration_contacts", "Contacts integration tests"),
            ("tests.test_integration_users", "Users integration tests"),
        ]
        .iter()
        .map(|(module, title)| ModuleDoc::new(module, title))
        .collect();

        Self {
            title: "Rest API Service documentation".to_string(),
            modules,
        }
    }

    /// Sphinx `index.rst`
    pub fn render_rst(&self) -> String {
        let mut out = format!(
            "{}\n{}\n\n.. toctree::\n   :maxdepth: 2\n   :caption: Contents:\n\n",
            self.title,
            "=".repeat(self.title.chars().count())
        );
        for module in &self.modules {
            out.push_str(&module.render());
            out.push('\n');
        }
        out.push_str("Indices and tables\n==================\n\n* :ref:`genindex`\n* :ref:`modindex`\n* :ref:`search`\n");
        out
    }

    /// Write `index.rst` into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("index.rst");
        std::fs::write(&path, self.render_rst())?;
        Ok(path)
    }
}
