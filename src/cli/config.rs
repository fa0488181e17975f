use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::engine::schedule::{Stage, StageSchedule};
use crate::error::ConfigError;
use crate::stats::threshold::ThresholdSpec;
use crate::utils::parse_duration_field;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct StageConfig {
    /// Length of the ramp (e.g., "30s", "1m")
    pub duration: String,
    /// VU count reached at the end of the stage
    pub target: usize,
}

/// A threshold is either a bare expression or an expression with `abortOnFail`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(default, alias = "abortOnFail")]
        abort_on_fail: bool,
    },
}

impl ThresholdEntry {
    pub fn expression(&self) -> &str {
        match self {
            ThresholdEntry::Expression(e) => e,
            ThresholdEntry::Detailed { threshold, .. } => threshold,
        }
    }

    pub fn abort_on_fail(&self) -> bool {
        matches!(
            self,
            ThresholdEntry::Detailed {
                abort_on_fail: true,
                ..
            }
        )
    }
}

/// Config file as written by the user (YAML or JSON).
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct Config {
    /// GraphQL endpoint the suite posts to
    pub endpoint: Option<String>,
    /// Ramping schedule (k6: stages)
    #[serde(alias = "schedule")]
    pub stages: Option<Vec<StageConfig>>,
    /// VU count the first stage ramps from (default: 0)
    #[serde(alias = "startVUs", alias = "startVus")]
    pub start_vus: Option<usize>,
    /// Pass/fail criteria per metric
    #[serde(alias = "criteria")]
    pub thresholds: Option<BTreeMap<String, Vec<ThresholdEntry>>>,
    /// Scheduler tick (default: "100ms")
    pub tick: Option<String>,
    /// How often thresholds are evaluated during the run (default: "1s")
    #[serde(alias = "evaluationInterval")]
    pub evaluation_interval: Option<String>,
    /// How long to wait for in-flight iterations at the end (default: "30s")
    #[serde(alias = "gracefulStop")]
    pub graceful_stop: Option<String>,
    /// Minimum time per iteration
    #[serde(alias = "minIterationDuration")]
    pub min_iteration_duration: Option<String>,
    /// Per-request timeout (default: "60s")
    #[serde(alias = "requestTimeout")]
    pub request_timeout: Option<String>,
}

impl Config {
    /// Reads a config file; `.json` is parsed as JSON, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parsed = if ext.eq_ignore_ascii_case("json") {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// The options the rollups load test ships with.
    pub fn rollups_default() -> Self {
        let stage = |duration: &str, target| StageConfig {
            duration: duration.to_string(),
            target,
        };
        let mut thresholds = BTreeMap::new();
        thresholds.insert(
            "http_req_failed".to_string(),
            vec![ThresholdEntry::Detailed {
                threshold: "rate<0.05".to_string(),
                abort_on_fail: true,
            }],
        );
        Self {
            endpoint: Some(RunOptions::DEFAULT_ENDPOINT.to_string()),
            stages: Some(vec![stage("1s", 1), stage("3s", 50), stage("1s", 0)]),
            // ramping starts from one VU, not zero
            start_vus: Some(1),
            thresholds: Some(thresholds),
            ..Default::default()
        }
    }
}

/// Validated, immutable options for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub stages: StageSchedule,
    pub thresholds: BTreeMap<String, Vec<ThresholdSpec>>,
    pub endpoint: String,
    pub tick: Duration,
    pub evaluation_interval: Duration,
    pub graceful_stop: Duration,
    pub min_iteration_duration: Option<Duration>,
    pub request_timeout: Duration,
}

impl RunOptions {
    pub const DEFAULT_ENDPOINT: &'static str = "http://localhost:8080/graphql";
    pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
    pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
    /// Longest accepted value for any duration option, and for the whole schedule.
    pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

    pub fn new(stages: StageSchedule) -> Self {
        Self {
            stages,
            thresholds: BTreeMap::new(),
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            tick: Self::DEFAULT_TICK,
            evaluation_interval: Self::DEFAULT_EVALUATION_INTERVAL,
            graceful_stop: Self::DEFAULT_GRACEFUL_STOP,
            min_iteration_duration: None,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn threshold_count(&self) -> usize {
        self.thresholds.values().map(Vec::len).sum()
    }
}

fn bounded_duration(field: &str, s: &str) -> Result<Duration, ConfigError> {
    let d = parse_duration_field(field, s)?;
    within_limit(field, d)
}

fn within_limit(field: &str, d: Duration) -> Result<Duration, ConfigError> {
    if d > RunOptions::MAX_DURATION {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!(
                "{:?} exceeds the limit of {:?}",
                d,
                RunOptions::MAX_DURATION
            ),
        });
    }
    Ok(d)
}

fn optional_duration(
    field: &str,
    value: Option<&String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    value.map_or(Ok(default), |v| bounded_duration(field, v))
}

fn non_zero(field: &str, d: Duration) -> Result<Duration, ConfigError> {
    if d.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(d)
}

impl TryFrom<Config> for RunOptions {
    type Error = ConfigError;

    fn try_from(config: Config) -> Result<Self, Self::Error> {
        let stages = config
            .stages
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let field = format!("stages[{}].duration", i);
                Ok(Stage::new(bounded_duration(&field, &s.duration)?, s.target))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        if stages.is_empty() {
            return Err(ConfigError::EmptySchedule);
        }
        // each stage is bounded, so the sum cannot overflow
        let total: Duration = stages.iter().map(|s| s.duration).sum();
        within_limit("stages", total)?;
        let schedule = StageSchedule::with_start(stages, config.start_vus.unwrap_or(0));

        let mut thresholds = BTreeMap::new();
        for (metric, entries) in config.thresholds.unwrap_or_default() {
            let specs = entries
                .iter()
                .map(|e| ThresholdSpec::parse(&metric, e.expression(), e.abort_on_fail()))
                .collect::<Result<Vec<_>, _>>()?;
            thresholds.insert(metric, specs);
        }

        let endpoint = config
            .endpoint
            .unwrap_or_else(|| Self::DEFAULT_ENDPOINT.to_string());
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                field: "endpoint".to_string(),
                reason: format!("'{}' is not an http(s) URL", endpoint),
            });
        }

        let tick = non_zero(
            "tick",
            optional_duration("tick", config.tick.as_ref(), Self::DEFAULT_TICK)?,
        )?;
        let evaluation_interval = non_zero(
            "evaluationInterval",
            optional_duration(
                "evaluationInterval",
                config.evaluation_interval.as_ref(),
                Self::DEFAULT_EVALUATION_INTERVAL,
            )?,
        )?;
        let graceful_stop = optional_duration(
            "gracefulStop",
            config.graceful_stop.as_ref(),
            Self::DEFAULT_GRACEFUL_STOP,
        )?;
        let min_iteration_duration = config
            .min_iteration_duration
            .as_ref()
            .map(|v| bounded_duration("minIterationDuration", v))
            .transpose()?;
        let request_timeout = non_zero(
            "requestTimeout",
            optional_duration(
                "requestTimeout",
                config.request_timeout.as_ref(),
                Self::DEFAULT_REQUEST_TIMEOUT,
            )?,
        )?;

        Ok(Self {
            stages: schedule,
            thresholds,
            endpoint,
            tick,
            evaluation_interval,
            graceful_stop,
            min_iteration_duration,
            request_timeout,
        })
    }
}
