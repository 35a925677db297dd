use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use nacc_domain::config::OrchestratorConfig;

/// nacc — the hub-and-spoke orchestrator.
#[derive(Debug, Parser)]
#[command(name = "nacc", version, about)]
pub struct Cli {
    /// Path to the orchestrator configuration file.
    #[arg(long, default_value = "nacc.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the orchestrator (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

/// Load and parse the orchestrator configuration file.
pub fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file '{}'", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config file '{}'", path.display()))
}
