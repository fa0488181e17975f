use anyhow::{Context, Result};
use clap::Parser;
use schemars::schema_for;
use tracing::info;
use tracing_subscriber::EnvFilter;

use volley::cli::config::{Config, RunOptions};
use volley::cli::validate::run_validate;
use volley::cli::{resolve_config, Cli, Commands};
use volley::engine::Engine;
use volley::error::ConfigError;
use volley::stats::csv::generate_csv;
use volley::suite::GraphqlSuite;

/// Exit code for configuration problems found before the run starts.
const EXIT_CONFIG_ERROR: i32 = 2;

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the summary, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            config,
            endpoint,
            stages,
            json,
            export_json,
            export_csv,
        } => {
            let config = resolve_config(config.as_deref(), endpoint, stages)?;
            let options = RunOptions::try_from(config)?;
            info!(endpoint = %options.endpoint, "loading query suite");
            let suite = GraphqlSuite::rollups(
                &options.endpoint,
                options.request_timeout,
                options.stages.max_target(),
            )?;

            let summary = Engine::new(options).run(suite)?;

            if json {
                println!("{}", summary.to_json());
            } else {
                summary.print();
            }
            if let Some(path) = export_json {
                std::fs::write(&path, summary.to_json())
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!(path = %path.display(), "summary exported");
            }
            if let Some(path) = export_csv {
                std::fs::write(&path, generate_csv(&summary.report, &summary.thresholds))
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!(path = %path.display(), "metrics exported");
            }
            Ok(summary.exit_code())
        }
        Commands::Validate { config } => {
            run_validate(&config)?;
            Ok(0)
        }
        Commands::Schema { output } => {
            let schema = serde_json::to_string_pretty(&schema_for!(Config))?;
            match output {
                Some(path) => std::fs::write(&path, schema)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => println!("{}", schema),
            }
            Ok(0)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            if e.downcast_ref::<ConfigError>().is_some() {
                EXIT_CONFIG_ERROR
            } else {
                1
            }
        }
    };
    std::process::exit(code);
}
