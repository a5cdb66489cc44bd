//! CLI argument definitions for the Plotari binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Plotari: a conversational property-search assistant.
#[derive(Parser, Debug)]
#[command(name = "plotari", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", env = "PLOTARI_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory for the conversation database.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Keep conversations in memory only.
    #[arg(long = "ephemeral")]
    pub ephemeral: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Chat on stdin (the default).
    Chat {
        #[arg(long, default_value = "local")]
        user: String,

        /// Session to resume. A new one is started when omitted.
        #[arg(long)]
        session: Option<String>,
    },
    /// Purge expired conversations and exit.
    Sweep,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag / PLOTARI_CONFIG > ~/.plotari/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        default_config_path()
    }

    /// Data directory override, if any.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// The subcommand to run, `chat` when none is given.
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Chat {
            user: "local".to_string(),
            session: None,
        })
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".plotari").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".plotari").join("config.toml");
    }
    PathBuf::from("config.toml")
}
