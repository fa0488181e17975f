use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::engine::control::ControlState;
use crate::error::ConfigError;
use crate::stats::MetricSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Operator {
    pub fn apply(self, actual: f64, expected: f64) -> bool {
        match self {
            Operator::Lt => actual < expected,
            Operator::Le => actual <= expected,
            Operator::Gt => actual > expected,
            Operator::Ge => actual >= expected,
            Operator::Eq => (actual - expected).abs() < f64::EPSILON,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Eq => "==",
        }
    }
}

/// How a metric's samples are reduced to the single number a threshold compares.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Aggregation {
    Rate,
    Count,
    Value,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let agg = match s {
            "rate" => Aggregation::Rate,
            "count" => Aggregation::Count,
            "value" => Aggregation::Value,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            other => {
                // p(95), p(99.9) or the short p95 form
                let digits = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .or_else(|| other.strip_prefix('p'))
                    .ok_or_else(|| format!("unknown aggregation '{}'", other))?;
                let p: f64 = digits
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile '{}'", other))?;
                if !(p > 0.0 && p <= 100.0) {
                    return Err(format!("percentile must be in (0, 100], got {}", p));
                }
                Aggregation::Percentile(p)
            }
        };
        Ok(agg)
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Count => f.write_str("count"),
            Aggregation::Value => f.write_str("value"),
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdExpr {
    pub aggregation: Aggregation,
    pub op: Operator,
    pub value: f64,
}

impl ThresholdExpr {
    /// Parses `<aggregation> <op> <number>`; whitespace between the parts is optional.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let op_pos = s
            .find(['<', '>', '='])
            .ok_or_else(|| "missing comparison operator (<, <=, >, >=, ==)".to_string())?;
        let (lhs, rest) = s.split_at(op_pos);

        let (op, rhs) = if let Some(r) = rest.strip_prefix("<=") {
            (Operator::Le, r)
        } else if let Some(r) = rest.strip_prefix(">=") {
            (Operator::Ge, r)
        } else if let Some(r) = rest.strip_prefix("==") {
            (Operator::Eq, r)
        } else if let Some(r) = rest.strip_prefix('<') {
            (Operator::Lt, r)
        } else if let Some(r) = rest.strip_prefix('>') {
            (Operator::Gt, r)
        } else {
            return Err(format!("unknown operator in '{}'", rest));
        };

        let lhs = lhs.trim();
        if lhs.is_empty() {
            return Err("missing aggregation before the operator".to_string());
        }
        let aggregation = lhs.parse()?;
        let rhs = rhs.trim();
        let value: f64 = rhs
            .parse()
            .map_err(|_| format!("'{}' is not a number", rhs))?;
        if !value.is_finite() {
            return Err(format!("'{}' is not a finite number", rhs));
        }

        Ok(Self {
            aggregation,
            op,
            value,
        })
    }

    pub fn holds(&self, actual: f64) -> bool {
        self.op.apply(actual, self.value)
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.aggregation, self.op.as_str(), self.value)
    }
}

/// Whether `metric` can be reduced with `aggregation`. Names that are not
/// built in are custom script metrics and accept any aggregation.
pub fn supports(metric: &str, aggregation: &Aggregation) -> bool {
    use Aggregation::*;
    match metric {
        "http_req_failed" | "checks" => matches!(aggregation, Rate),
        "http_reqs" | "iterations" => matches!(aggregation, Count | Rate),
        "http_req_duration" | "iteration_duration" => {
            matches!(aggregation, Avg | Min | Max | Med | Percentile(_) | Count)
        }
        "vus" | "vus_max" => matches!(aggregation, Value),
        _ => true,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdSpec {
    pub metric: String,
    pub expression: ThresholdExpr,
    pub abort_on_fail: bool,
    /// Expression as written in the config
    pub source: String,
}

impl ThresholdSpec {
    pub fn parse(metric: &str, source: &str, abort_on_fail: bool) -> Result<Self, ConfigError> {
        let expression =
            ThresholdExpr::parse(source).map_err(|reason| ConfigError::InvalidThreshold {
                metric: metric.to_string(),
                expression: source.to_string(),
                reason,
            })?;
        if !supports(metric, &expression.aggregation) {
            return Err(ConfigError::UnsupportedAggregation {
                metric: metric.to_string(),
                aggregation: expression.aggregation.to_string(),
            });
        }
        Ok(Self {
            metric: metric.to_string(),
            expression,
            abort_on_fail,
            source: source.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStatus {
    Passed,
    Failed,
    /// The metric had no samples; nothing to compare.
    NoData,
    /// Crossed while the run was live and raised the abort.
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub abort_on_fail: bool,
    pub observed: Option<f64>,
    pub status: ThresholdStatus,
}

impl ThresholdResult {
    pub fn failed(&self) -> bool {
        matches!(self.status, ThresholdStatus::Failed | ThresholdStatus::Aborted)
    }
}

pub struct ThresholdEvaluator {
    thresholds: Vec<ThresholdSpec>,
    // one flag per threshold so a lasting breach is logged once
    breached: Vec<AtomicBool>,
    /// Index and breach-time result of the threshold that won the abort
    tripped: Mutex<Option<(usize, ThresholdResult)>>,
}

impl ThresholdEvaluator {
    pub fn new(thresholds: impl IntoIterator<Item = ThresholdSpec>) -> Self {
        let thresholds: Vec<_> = thresholds.into_iter().collect();
        let breached = thresholds.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            thresholds,
            breached,
            tripped: Mutex::new(None),
        }
    }

    pub fn from_map(map: &BTreeMap<String, Vec<ThresholdSpec>>) -> Self {
        Self::new(map.values().flatten().cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn evaluate(&self, snapshot: &MetricSnapshot) -> Vec<ThresholdResult> {
        self.thresholds
            .iter()
            .map(|spec| {
                let observed = snapshot.value(&spec.metric, &spec.expression.aggregation);
                let status = match observed {
                    None => ThresholdStatus::NoData,
                    Some(v) if spec.expression.holds(v) => ThresholdStatus::Passed,
                    Some(_) => ThresholdStatus::Failed,
                };
                ThresholdResult {
                    metric: spec.metric.clone(),
                    expression: spec.source.clone(),
                    abort_on_fail: spec.abort_on_fail,
                    observed,
                    status,
                }
            })
            .collect()
    }

    /// The threshold that aborted the run, as observed when it crossed.
    pub fn tripped(&self) -> Option<ThresholdResult> {
        self.tripped.lock().as_ref().map(|(_, r)| r.clone())
    }

    /// End-of-run results. Values come from `snapshot`, except the threshold
    /// that aborted the run keeps what it observed at the breach.
    pub fn finalize(&self, snapshot: &MetricSnapshot) -> Vec<ThresholdResult> {
        let mut results = self.evaluate(snapshot);
        if let Some((i, tripped)) = self.tripped.lock().as_ref() {
            results[*i] = tripped.clone();
        }
        results
    }

    /// Evaluates and raises the run abort for the first failing `abortOnFail`
    /// threshold. Breaches without `abortOnFail` are only logged.
    pub fn enforce(&self, snapshot: &MetricSnapshot, control: &ControlState) -> Vec<ThresholdResult> {
        let results = self.evaluate(snapshot);
        for (i, result) in results.iter().enumerate() {
            if !result.failed() {
                continue;
            }
            let observed = result.observed.unwrap_or_default();
            if result.abort_on_fail {
                let reason = format!(
                    "threshold '{}' on {} crossed (observed {:.4})",
                    result.expression, result.metric, observed
                );
                // held across the abort so readers never see the flag without the result
                let mut tripped = self.tripped.lock();
                if control.abort(reason) {
                    *tripped = Some((
                        i,
                        ThresholdResult {
                            status: ThresholdStatus::Aborted,
                            ..result.clone()
                        },
                    ));
                    error!(
                        metric = %result.metric,
                        threshold = %result.expression,
                        observed,
                        "threshold crossed, aborting run"
                    );
                }
            } else if !self.breached[i].swap(true, Ordering::Relaxed) {
                warn!(
                    metric = %result.metric,
                    threshold = %result.expression,
                    observed,
                    "threshold crossed"
                );
            }
        }
        results
    }

    /// Runs [`enforce`](Self::enforce) on its own thread every `interval`
    /// until the handle is stopped or the run is aborted.
    pub fn spawn<F>(
        self: Arc<Self>,
        interval: Duration,
        control: Arc<ControlState>,
        snapshot: F,
    ) -> std::io::Result<EvaluatorHandle>
    where
        F: Fn() -> MetricSnapshot + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name("threshold-evaluator".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let snap = snapshot();
                            self.enforce(&snap, &control);
                            if control.is_aborted() {
                                debug!("evaluator exiting after abort");
                                break;
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
            })?;

        Ok(EvaluatorHandle {
            shutdown: Some(shutdown_tx),
            thread: Some(handle),
        })
    }
}

pub struct EvaluatorHandle {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EvaluatorHandle {
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        // dropping the sender disconnects the channel and wakes the select
        self.shutdown.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("threshold evaluator thread panicked");
            }
        }
    }
}

impl Drop for EvaluatorHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Metric, RequestOutcome, StatsAggregator};
    use std::time::Instant;

    fn snapshot_with_failure_rate(failed: usize, total: usize) -> MetricSnapshot {
        let mut stats = StatsAggregator::new();
        for i in 0..total {
            let latency = Duration::from_millis(10);
            let outcome = if i < failed {
                RequestOutcome::failure("q", "boom", latency)
            } else {
                RequestOutcome::success("q", 200, latency)
            };
            stats.add(Metric::Request(outcome));
        }
        MetricSnapshot {
            stats,
            checks: BTreeMap::new(),
            elapsed: Duration::from_secs(1),
            live_vus: 1,
            max_live_vus: 1,
        }
    }

    fn failure_threshold(abort: bool) -> ThresholdSpec {
        ThresholdSpec::parse("http_req_failed", "rate < 0.05", abort).unwrap()
    }

    #[test]
    fn test_parse_expressions() {
        let expr = ThresholdExpr::parse("rate<0.05").unwrap();
        assert_eq!(expr.aggregation, Aggregation::Rate);
        assert_eq!(expr.op, Operator::Lt);
        assert_eq!(expr.value, 0.05);

        let expr = ThresholdExpr::parse("  p(95) <= 500 ").unwrap();
        assert_eq!(expr.aggregation, Aggregation::Percentile(95.0));
        assert_eq!(expr.op, Operator::Le);

        let expr = ThresholdExpr::parse("p99>=1").unwrap();
        assert_eq!(expr.aggregation, Aggregation::Percentile(99.0));
        assert_eq!(expr.op, Operator::Ge);

        assert_eq!(ThresholdExpr::parse("count==3").unwrap().op, Operator::Eq);
        assert_eq!(ThresholdExpr::parse("avg > 2").unwrap().op, Operator::Gt);
        assert_eq!(
            ThresholdExpr::parse("p(99.9)<1").unwrap().aggregation,
            Aggregation::Percentile(99.9)
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "rate",
            "< 0.05",
            "rate < abc",
            "rate = 1",
            "rate => 1",
            "speed < 1",
            "p(0) < 1",
            "p(101) < 1",
            "rate < inf",
        ] {
            assert!(ThresholdExpr::parse(bad).is_err(), "accepted '{}'", bad);
        }
    }

    #[test]
    fn test_threshold_definition_errors() {
        let err = ThresholdSpec::parse("http_req_failed", "rate << 1", true).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { .. }));

        let err = ThresholdSpec::parse("http_req_failed", "p(95) < 1", true).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedAggregation { .. }));

        // custom metrics accept any aggregation
        assert!(ThresholdSpec::parse("my_trend", "p(95) < 1", false).is_ok());
    }

    #[test]
    fn test_operators() {
        assert!(Operator::Lt.apply(1.0, 2.0));
        assert!(!Operator::Lt.apply(2.0, 2.0));
        assert!(Operator::Le.apply(2.0, 2.0));
        assert!(Operator::Gt.apply(3.0, 2.0));
        assert!(Operator::Ge.apply(2.0, 2.0));
        assert!(Operator::Eq.apply(2.0, 2.0));
        assert!(!Operator::Eq.apply(2.0, 2.1));
    }

    #[test]
    fn test_failure_rate_ten_percent_aborts() {
        let evaluator = ThresholdEvaluator::new([failure_threshold(true)]);
        let control = ControlState::new();
        let results = evaluator.enforce(&snapshot_with_failure_rate(10, 100), &control);
        assert!(results[0].failed());
        assert_eq!(results[0].observed, Some(0.1));
        assert!(control.is_aborted());
        assert!(control.is_stopped());
    }

    #[test]
    fn test_failure_rate_two_percent_does_not_abort() {
        let evaluator = ThresholdEvaluator::new([failure_threshold(true)]);
        let control = ControlState::new();
        let results = evaluator.enforce(&snapshot_with_failure_rate(2, 100), &control);
        assert_eq!(results[0].status, ThresholdStatus::Passed);
        assert!(!control.is_aborted());
    }

    #[test]
    fn test_breach_without_abort_on_fail_only_reports() {
        let evaluator = ThresholdEvaluator::new([failure_threshold(false)]);
        let control = ControlState::new();
        for _ in 0..3 {
            let results = evaluator.enforce(&snapshot_with_failure_rate(50, 100), &control);
            assert!(results[0].failed());
        }
        assert!(!control.is_aborted());
        assert!(!control.is_stopped());
    }

    #[test]
    fn test_abort_raised_once_across_breaches() {
        let evaluator = ThresholdEvaluator::new([
            failure_threshold(true),
            ThresholdSpec::parse("http_reqs", "count < 10", true).unwrap(),
        ]);
        let control = ControlState::new();
        evaluator.enforce(&snapshot_with_failure_rate(50, 100), &control);
        let first_reason = control.abort_reason();
        evaluator.enforce(&snapshot_with_failure_rate(90, 100), &control);
        assert_eq!(control.abort_reason(), first_reason);
        assert!(first_reason.unwrap().contains("http_req_failed"));
    }

    #[test]
    fn test_finalize_keeps_the_aborting_result() {
        let evaluator = ThresholdEvaluator::new([
            failure_threshold(true),
            ThresholdSpec::parse("http_reqs", "count > 0", false).unwrap(),
        ]);
        let control = ControlState::new();
        assert!(evaluator.tripped().is_none());
        evaluator.enforce(&snapshot_with_failure_rate(10, 100), &control);

        // in-flight requests pulled the rate back under the limit
        let results = evaluator.finalize(&snapshot_with_failure_rate(10, 1000));
        assert_eq!(results[0].status, ThresholdStatus::Aborted);
        assert_eq!(results[0].observed, Some(0.1));
        assert!(results[0].failed());
        assert_eq!(results[1].status, ThresholdStatus::Passed);
        assert_eq!(evaluator.tripped().unwrap().observed, Some(0.1));

        // a plain evaluation only sees the current value
        assert_eq!(
            evaluator.evaluate(&snapshot_with_failure_rate(10, 1000))[0].status,
            ThresholdStatus::Passed
        );
    }

    #[test]
    fn test_no_samples_is_no_data() {
        let evaluator = ThresholdEvaluator::new([failure_threshold(true)]);
        let control = ControlState::new();
        let results = evaluator.enforce(&snapshot_with_failure_rate(0, 0), &control);
        assert_eq!(results[0].status, ThresholdStatus::NoData);
        assert!(!control.is_aborted());
    }

    #[test]
    fn test_spawned_evaluator_aborts_within_interval() {
        let evaluator = Arc::new(ThresholdEvaluator::new([failure_threshold(true)]));
        let control = Arc::new(ControlState::new());
        let started = Instant::now();
        let handle = evaluator
            .spawn(Duration::from_millis(20), control.clone(), || {
                snapshot_with_failure_rate(10, 100)
            })
            .unwrap();

        while !control.is_aborted() && started.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
        assert!(control.is_aborted());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_spawned_evaluator_stops_on_request() {
        let evaluator = Arc::new(ThresholdEvaluator::new([failure_threshold(true)]));
        let control = Arc::new(ControlState::new());
        let handle = evaluator
            .spawn(Duration::from_secs(3600), control.clone(), || {
                snapshot_with_failure_rate(0, 0)
            })
            .unwrap();
        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!control.is_aborted());
    }
}
