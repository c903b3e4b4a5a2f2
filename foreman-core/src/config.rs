//! Configuration management
//!
//! Handles CLI argument parsing, optional TOML config files, and
//! validation of the timing parameters.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(about = "Block dispatch coordinator for distributed chunk processing", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the block service
    Start(StartCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct StartCommand {
    /// TOML config file; replaces the individual flags below
    #[arg(long, conflicts_with_all = ["block_file", "time_limit"])]
    pub config: Option<PathBuf>,

    /// JSON file listing the block offsets to distribute
    #[arg(long, required_unless_present = "config")]
    pub block_file: Option<PathBuf>,

    /// Seconds an in-flight block may go unconfirmed before it is failed
    #[arg(long, required_unless_present = "config")]
    pub time_limit: Option<u64>,

    /// Seconds between sweeper scans, also the drain poll interval
    #[arg(long, default_value_t = 60)]
    pub check_interval: u64,

    /// Maximum number of retry rounds for failed blocks
    #[arg(long, default_value_t = 2)]
    pub num_retries: u32,

    /// Path prefix for the shutdown status files (may carry a filename stem)
    #[arg(long)]
    pub out_prefix: Option<PathBuf>,

    /// Listener bind address
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Listener port
    #[arg(long, default_value_t = 9999)]
    pub port: u16,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub block_file: PathBuf,
    pub time_limit: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    #[serde(default)]
    pub out_prefix: Option<PathBuf>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_check_interval() -> u64 {
    60
}

fn default_num_retries() -> u32 {
    2
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9999
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Build the config from CLI arguments.
    pub fn from_cli() -> Result<Self, ConfigError> {
        let cli = Cli::parse();

        match cli.command {
            Commands::Start(cmd) => Self::from_start(cmd),
        }
    }

    /// Build the config from a parsed `start` command.
    pub fn from_start(cmd: StartCommand) -> Result<Self, ConfigError> {
        let config = match &cmd.config {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let block_file = cmd.block_file.ok_or_else(|| {
                    ConfigError::Invalid("--block-file is required".to_string())
                })?;
                let time_limit = cmd.time_limit.ok_or_else(|| {
                    ConfigError::Invalid("--time-limit is required".to_string())
                })?;
                Config {
                    block_file,
                    time_limit,
                    check_interval: cmd.check_interval,
                    num_retries: cmd.num_retries,
                    out_prefix: cmd.out_prefix,
                    host: cmd.host,
                    port: cmd.port,
                    log_level: cmd.log_level,
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Load a whole config from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// The sweeper must get at least one scan in before any block can
    /// expire, so the time limit has to exceed the check interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval == 0 {
            return Err(ConfigError::Invalid(
                "check_interval must be positive".to_string(),
            ));
        }
        if self.time_limit <= self.check_interval {
            return Err(ConfigError::Invalid(format!(
                "time_limit ({}) must be greater than check_interval ({})",
                self.time_limit, self.check_interval
            )));
        }
        Ok(())
    }
}
