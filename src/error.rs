use std::path::PathBuf;

/// Problems detected while turning a config file into [`RunOptions`](crate::cli::config::RunOptions).
///
/// All of these are raised before any VU is spawned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid duration '{value}' for {field} (expected e.g. \"500ms\", \"30s\", \"1m\")")]
    InvalidDuration { field: String, value: String },

    #[error("invalid threshold '{expression}' for metric '{metric}': {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("aggregation '{aggregation}' is not supported by metric '{metric}'")]
    UnsupportedAggregation { metric: String, aggregation: String },

    #[error("the stage schedule is empty; at least one stage is required")]
    EmptySchedule,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}
