//! Single-file languages declared in configuration.

use anyhow::{bail, Context, Result};

use super::{Technology, Workspace};
use crate::config::LanguageConfig;

/// A language whose submission is one file run by a fixed command.
#[derive(Debug, Clone)]
pub(crate) struct ScriptTechnology {
    key: String,
    image: String,
    argv: Vec<String>,
    file: String,
}

impl ScriptTechnology {
    pub fn from_config(config: &LanguageConfig) -> Result<Self> {
        let argv = shell_words::split(&config.command)
            .with_context(|| format!("Invalid command for language '{}'", config.key))?;
        if argv.is_empty() {
            bail!("Language '{}' has an empty command", config.key);
        }
        if config.file.contains('/') || config.file.is_empty() {
            bail!(
                "Language '{}' must name a plain file, got '{}'",
                config.key,
                config.file
            );
        }

        Ok(Self {
            key: config.key.trim().to_string(),
            image: config.image.clone(),
            argv,
            file: config.file.clone(),
        })
    }
}

impl Technology for ScriptTechnology {
    fn key(&self) -> &str {
        &self.key
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn command(&self) -> Vec<String> {
        self.argv.clone()
    }

    fn materialize(&self, workspace: &mut Workspace, source_code: &str) {
        workspace.write(self.file.as_str(), source_code);
    }
}
