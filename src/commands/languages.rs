use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;

use crate::config::Config;
use crate::technology::{Technology, TechnologyRegistry};

pub async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path).context("Failed to load codecell.toml")?;
    config.validate().context("Invalid configuration")?;
    let registry = TechnologyRegistry::from_config(&config)?;

    println!("{}", "Supported languages:".bold());
    for technology in registry.iter() {
        println!("{}", format_language(technology.as_ref()));
    }
    Ok(())
}

/// One aligned listing row: key, image, command.
fn format_language(technology: &dyn Technology) -> String {
    format!(
        "  {:<10} {:<24} {}",
        technology.key().cyan(),
        technology.image(),
        technology.command().join(" ").dimmed()
    )
}
