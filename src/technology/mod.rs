//! Language technologies for sandboxed execution.
//!
//! A technology knows which image runs a language, the command line that
//! builds and runs a submission, and how to turn raw source text into the
//! files that command expects:
//! - `dotnet`: `Runner.csproj` + `Program.cs`, `dotnet run`
//! - `python`: `main.py`, `python3 -u main.py`
//! - configured script languages from `[[languages]]` in codecell.toml

mod dotnet;
mod python;
mod script;
mod workspace;

pub(crate) use dotnet::DotNetTechnology;
pub(crate) use python::PythonTechnology;
pub(crate) use script::ScriptTechnology;
pub(crate) use workspace::Workspace;

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;

/// How to build and run code for one language.
pub(crate) trait Technology: Send + Sync {
    /// Request key this technology is registered under.
    fn key(&self) -> &str;

    /// Image the sandbox is created from.
    fn image(&self) -> &str;

    /// Argument vector executed in the working directory.
    fn command(&self) -> Vec<String>;

    /// Write the project files for `source_code` into `workspace`.
    fn materialize(&self, workspace: &mut Workspace, source_code: &str);
}

/// Lookup failure for a language key with no registered technology.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Language '{language}' is not supported")]
pub(crate) struct UnsupportedLanguage {
    pub language: String,
}

/// Static mapping from language key to technology.
#[derive(Clone, Default)]
pub(crate) struct TechnologyRegistry {
    technologies: BTreeMap<String, Arc<dyn Technology>>,
}

impl TechnologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in technologies plus the languages declared in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let image_for = |key: &str, default: &str| {
            config
                .images
                .get(key)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let mut registry = Self::new();
        registry.register(Arc::new(DotNetTechnology::new(image_for(
            dotnet::KEY,
            dotnet::DEFAULT_IMAGE,
        ))));
        registry.register(Arc::new(PythonTechnology::new(image_for(
            python::KEY,
            python::DEFAULT_IMAGE,
        ))));

        for language in &config.languages {
            registry.register(Arc::new(ScriptTechnology::from_config(language)?));
        }

        Ok(registry)
    }

    /// Register a technology, replacing any previous one with the same key.
    pub fn register(&mut self, technology: Arc<dyn Technology>) {
        self.technologies
            .insert(technology.key().to_string(), technology);
    }

    /// Resolve a request's language key.
    pub fn lookup(&self, language: &str) -> Result<Arc<dyn Technology>, UnsupportedLanguage> {
        self.technologies
            .get(language.trim())
            .cloned()
            .ok_or_else(|| UnsupportedLanguage {
                language: language.to_string(),
            })
    }

    /// Registered technologies in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Technology>> {
        self.technologies.values()
    }
}

impl std::fmt::Debug for TechnologyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.technologies.keys()).finish()
    }
}
