use anyhow::Result;
use std::path::Path;

use crate::cli::config::{Config, RunOptions};
use crate::engine::abort_latency_bound;
use crate::utils::format_duration;

/// Validate a config file without running it: parse it, resolve every
/// duration and threshold, and print what the run would do.
pub fn run_validate(config_path: &Path) -> Result<RunOptions> {
    println!("Validating {}...", config_path.display());

    let options = match Config::load(config_path).and_then(RunOptions::try_from) {
        Ok(options) => options,
        Err(e) => {
            println!("  ✗ Validation failed: {}", e);
            return Err(e.into());
        }
    };

    println!("  ✓ Configuration valid");
    println!("    endpoint: {}", options.endpoint);
    println!(
        "    stages: {} stage(s), {} total, up to {} VUs",
        options.stages.stages().len(),
        format_duration(options.stages.total_duration()),
        options.stages.max_target()
    );
    for (metric, specs) in &options.thresholds {
        for spec in specs {
            let abort = if spec.abort_on_fail { " (abortOnFail)" } else { "" };
            println!("    threshold: {} {}{}", metric, spec.expression, abort);
        }
    }
    if options.threshold_count() > 0 {
        println!(
            "    breaches detected within {}",
            format_duration(abort_latency_bound(&options))
        );
    }

    Ok(options)
}
