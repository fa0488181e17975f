pub mod config;
pub mod validate;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::cli::config::{Config, StageConfig};
use crate::error::ConfigError;
use crate::utils::parse_duration_str;

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Stage-driven load testing for GraphQL rollups nodes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the GraphQL query suite against an endpoint
    Run {
        /// Path to the configuration file (YAML/JSON); built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// GraphQL endpoint, overrides the config file
        #[arg(short, long, env = "VOLLEY_ENDPOINT")]
        endpoint: Option<String>,

        /// Stage as DURATION:TARGET (e.g. 30s:10); repeat to build a schedule
        #[arg(short, long = "stage", value_parser = parse_stage_arg)]
        stages: Vec<StageConfig>,

        /// Print the final summary as JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Export final summary to a JSON file
        #[arg(long)]
        export_json: Option<PathBuf>,

        /// Export final metrics to a CSV file
        #[arg(long)]
        export_csv: Option<PathBuf>,
    },
    /// Check a configuration file without running it
    Validate {
        /// Path to the configuration file (YAML/JSON)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the JSON schema of the configuration file
    Schema {
        /// Write the schema to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Parses `30s:10` into a stage.
pub fn parse_stage_arg(s: &str) -> Result<StageConfig, String> {
    let (duration, target) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected DURATION:TARGET, got '{}'", s))?;
    if parse_duration_str(duration).is_none() {
        return Err(format!("invalid duration '{}'", duration));
    }
    let target = target
        .trim()
        .parse()
        .map_err(|_| format!("invalid target '{}'", target))?;
    Ok(StageConfig {
        duration: duration.trim().to_string(),
        target,
    })
}

/// Resolves the config for `run`: the file (or built-in defaults), then CLI overrides.
pub fn resolve_config(
    path: Option<&Path>,
    endpoint: Option<String>,
    stages: Vec<StageConfig>,
) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => Config::load(p)?,
        None => Config::rollups_default(),
    };
    if let Some(endpoint) = endpoint {
        config.endpoint = Some(endpoint);
    }
    if !stages.is_empty() {
        config.stages = Some(stages);
    }
    Ok(config)
}
