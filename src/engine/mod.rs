pub mod control;
pub mod executor;
pub mod http_client;
pub mod schedule;

use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cli::config::RunOptions;
use crate::engine::control::ControlState;
use crate::engine::executor::{IterationScript, VuExecutor};
use crate::stats::threshold::{ThresholdEvaluator, ThresholdResult, ThresholdStatus};
use crate::stats::{Collector, ReportStats, ShardedAggregator};
use crate::utils::format_duration;

/// Exit code of a run stopped by an `abortOnFail` threshold.
pub const EXIT_ABORTED: i32 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted)
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub elapsed_secs: f64,
    pub max_live_vus: usize,
    pub aborted_by: Option<String>,
    /// VUs still inside an iteration when the graceful stop ran out
    pub stragglers: usize,
    pub thresholds: Vec<ThresholdResult>,
    pub report: ReportStats,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        match self.state {
            RunState::Aborted => EXIT_ABORTED,
            _ => 0,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn print(&self) {
        self.report.print();

        if !self.thresholds.is_empty() {
            println!("Thresholds:");
            for t in &self.thresholds {
                let observed = t
                    .observed
                    .map(|v| format!("{:.4}", v))
                    .unwrap_or_else(|| "no data".to_string());
                let mark = match t.status {
                    ThresholdStatus::Passed => "✓",
                    ThresholdStatus::Failed => "✗",
                    ThresholdStatus::NoData => "-",
                    ThresholdStatus::Aborted => "✗",
                };
                let abort = match (t.status, t.abort_on_fail) {
                    (ThresholdStatus::Aborted, _) => " [aborted the run]",
                    (_, true) => " [abortOnFail]",
                    _ => "",
                };
                println!(
                    "  {} {} {} (observed {}){}",
                    mark, t.metric, t.expression, observed, abort
                );
            }
            println!();
        }

        let state = match self.state {
            RunState::Completed => "completed",
            RunState::Aborted => "aborted",
            RunState::Running => "running",
            RunState::Pending => "pending",
        };
        println!(
            "Run {} after {:.2}s (max {} VUs)",
            state, self.elapsed_secs, self.max_live_vus
        );
        if let Some(reason) = &self.aborted_by {
            println!("Aborted by {}", reason);
        }
    }
}

/// Drives one run: owns the clock, the VU targets and the terminal state.
pub struct Engine {
    options: Arc<RunOptions>,
    state: RunState,
    control: Arc<ControlState>,
    collector: Arc<Collector>,
}

impl Engine {
    pub fn new(options: RunOptions) -> Self {
        let aggregator = ShardedAggregator::for_vus(options.stages.max_target());
        Self {
            options: Arc::new(options),
            state: RunState::Pending,
            control: Arc::new(ControlState::new()),
            collector: Arc::new(Collector::new(aggregator)),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Shared stop/abort signal, e.g. for wiring up an external cancel.
    pub fn control(&self) -> Arc<ControlState> {
        self.control.clone()
    }

    pub fn run<S: IterationScript>(self, script: S) -> anyhow::Result<RunSummary> {
        self.run_shared(Arc::new(script))
    }

    pub fn run_shared(mut self, script: Arc<dyn IterationScript>) -> anyhow::Result<RunSummary> {
        let options = self.options.clone();
        let schedule = &options.stages;

        self.state = RunState::Running;
        info!(
            stages = schedule.stages().len(),
            duration = %format_duration(schedule.total_duration()),
            max_vus = schedule.max_target(),
            thresholds = options.thresholds.values().map(Vec::len).sum::<usize>(),
            "run started"
        );

        let start = Instant::now();
        let evaluator = Arc::new(ThresholdEvaluator::from_map(&options.thresholds));
        let evaluator_handle = if evaluator.is_empty() {
            None
        } else {
            let collector = self.collector.clone();
            let control = self.control.clone();
            let handle = evaluator
                .clone()
                .spawn(options.evaluation_interval, self.control.clone(), move || {
                    collector.snapshot(start.elapsed(), control.live_vus(), control.max_live_vus())
                })
                .context("failed to start threshold evaluator")?;
            Some(handle)
        };

        let mut executor = VuExecutor::new(
            script,
            self.collector.clone(),
            self.control.clone(),
            options.min_iteration_duration,
        );

        let mut current_stage = None;
        loop {
            if self.control.is_aborted() {
                break;
            }
            let elapsed = start.elapsed();
            let Some(target) = schedule.target_at(elapsed) else {
                debug!("schedule exhausted");
                break;
            };

            let stage = schedule.stage_index_at(elapsed);
            if stage != current_stage {
                if let Some(i) = stage {
                    info!(
                        stage = i + 1,
                        of = schedule.stages().len(),
                        vus = schedule.stages()[i].target,
                        over = %format_duration(schedule.stages()[i].duration),
                        "entering stage"
                    );
                }
                current_stage = stage;
            }

            executor
                .scale_to(target)
                .context("failed to spawn VU thread")?;
            std::thread::sleep(options.tick);
        }

        // no threshold can flip the outcome once the evaluator is joined
        if let Some(handle) = evaluator_handle {
            handle.stop();
        }
        self.control.stop();
        // state and reason come from one read; a later external abort is ignored
        let aborted_by = self.control.abort_reason();
        if let Some(reason) = &aborted_by {
            warn!(reason = %reason, "run aborted, draining VUs");
        }

        let stragglers = executor.drain(options.graceful_stop);
        let elapsed = start.elapsed();

        let snapshot = self.collector.snapshot(
            elapsed,
            self.control.live_vus(),
            self.control.max_live_vus(),
        );
        let thresholds = evaluator.finalize(&snapshot);

        self.state = if aborted_by.is_some() {
            RunState::Aborted
        } else {
            RunState::Completed
        };
        info!(
            state = ?self.state,
            elapsed = %format_duration(elapsed),
            iterations = snapshot.stats.iterations.total_requests,
            requests = snapshot.stats.http.total_requests,
            "run finished"
        );

        Ok(RunSummary {
            state: self.state,
            elapsed_secs: elapsed.as_secs_f64(),
            max_live_vus: snapshot.max_live_vus,
            aborted_by,
            stragglers,
            thresholds,
            report: snapshot.to_report(),
        })
    }
}

/// Upper bound on how long after a breach the run notices it.
pub fn abort_latency_bound(options: &RunOptions) -> Duration {
    options.evaluation_interval.saturating_add(options.tick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::executor::VuContext;
    use crate::engine::schedule::{Stage, StageSchedule};
    use crate::stats::threshold::ThresholdSpec;
    use crate::stats::RequestOutcome;

    fn options(stages: Vec<Stage>) -> RunOptions {
        let mut opts = RunOptions::new(StageSchedule::new(stages));
        opts.tick = Duration::from_millis(10);
        opts.evaluation_interval = Duration::from_millis(20);
        opts.graceful_stop = Duration::from_secs(2);
        opts
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn request_script(
        fail: bool,
    ) -> impl Fn(&VuContext) -> anyhow::Result<()> + Send + Sync + 'static {
        move |vu: &VuContext| {
            std::thread::sleep(ms(5));
            let outcome = if fail {
                RequestOutcome::failure("query", "connection refused", ms(5))
            } else {
                RequestOutcome::success("query", 200, ms(5))
            };
            vu.check("query is status 200", !fail);
            vu.record_request(outcome);
            Ok(())
        }
    }

    #[test]
    fn test_engine_starts_pending() {
        let engine = Engine::new(options(vec![Stage::new(ms(50), 1)]));
        assert_eq!(engine.state(), RunState::Pending);
        assert!(!engine.state().is_terminal());
    }

    #[test]
    fn test_run_completes_after_schedule() {
        let engine = Engine::new(options(vec![
            Stage::new(ms(100), 3),
            Stage::new(ms(100), 0),
        ]));
        let summary = engine.run(request_script(false)).unwrap();

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.exit_code(), 0);
        assert!(summary.elapsed_secs >= 0.2);
        assert!(summary.max_live_vus >= 1 && summary.max_live_vus <= 3);
        assert!(summary.report.iterations > 0);
        assert_eq!(summary.report.failed_requests, 0);
        assert_eq!(summary.stragglers, 0);
        assert!(summary.aborted_by.is_none());
    }

    #[test]
    fn test_failure_threshold_aborts_run() {
        let mut opts = options(vec![
            Stage::new(Duration::ZERO, 2),
            Stage::new(Duration::from_secs(10), 2),
        ]);
        opts.thresholds.insert(
            "http_req_failed".to_string(),
            vec![ThresholdSpec::parse("http_req_failed", "rate<0.05", true).unwrap()],
        );
        let started = Instant::now();
        let summary = Engine::new(opts).run(request_script(true)).unwrap();

        assert_eq!(summary.state, RunState::Aborted);
        assert_eq!(summary.exit_code(), EXIT_ABORTED);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(summary.aborted_by.unwrap().contains("http_req_failed"));
        assert!(summary.thresholds[0].failed());
    }

    #[test]
    fn test_breach_without_abort_completes() {
        let mut opts = options(vec![Stage::new(ms(150), 2)]);
        opts.thresholds.insert(
            "http_req_failed".to_string(),
            vec![ThresholdSpec::parse("http_req_failed", "rate<0.05", false).unwrap()],
        );
        let summary = Engine::new(opts).run(request_script(true)).unwrap();

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.exit_code(), 0);
        assert!(summary.thresholds[0].failed());
        assert_eq!(summary.thresholds[0].observed, Some(1.0));
    }

    #[test]
    fn test_check_threshold_aborts_run() {
        let mut opts = options(vec![
            Stage::new(Duration::ZERO, 1),
            Stage::new(Duration::from_secs(10), 1),
        ]);
        opts.thresholds.insert(
            "checks".to_string(),
            vec![ThresholdSpec::parse("checks", "rate>0.9", true).unwrap()],
        );
        let summary = Engine::new(opts).run(request_script(true)).unwrap();
        assert_eq!(summary.state, RunState::Aborted);
        assert_eq!(summary.report.checks["query is status 200"].passes, 0);
    }

    #[test]
    fn test_passing_thresholds_reported() {
        let mut opts = options(vec![Stage::new(ms(120), 2)]);
        opts.thresholds.insert(
            "http_req_failed".to_string(),
            vec![ThresholdSpec::parse("http_req_failed", "rate<0.05", true).unwrap()],
        );
        opts.thresholds.insert(
            "vus_max".to_string(),
            vec![ThresholdSpec::parse("vus_max", "value<=2", false).unwrap()],
        );
        let summary = Engine::new(opts).run(request_script(false)).unwrap();
        assert_eq!(summary.state, RunState::Completed);
        assert!(summary.thresholds.iter().all(|t| !t.failed()));
        let json = summary.to_json();
        assert!(json.contains("\"state\": \"completed\""));
    }

    #[test]
    fn test_aborting_threshold_keeps_breach_result() {
        // `vus` reads 0 after the drain, so a fresh evaluation would pass
        let mut opts = options(vec![
            Stage::new(Duration::ZERO, 2),
            Stage::new(Duration::from_secs(10), 2),
        ]);
        opts.thresholds.insert(
            "vus".to_string(),
            vec![ThresholdSpec::parse("vus", "value<1", true).unwrap()],
        );
        let summary = Engine::new(opts).run(request_script(false)).unwrap();

        assert_eq!(summary.state, RunState::Aborted);
        let result = &summary.thresholds[0];
        assert_eq!(result.status, ThresholdStatus::Aborted);
        assert!(result.failed());
        assert!(result.observed.unwrap() >= 1.0);
        assert!(summary.aborted_by.as_deref().unwrap().contains("vus"));
        assert!(summary.to_json().contains("\"status\": \"aborted\""));
    }

    #[test]
    fn test_external_abort_drains_vus() {
        let engine = Engine::new(options(vec![
            Stage::new(Duration::ZERO, 2),
            Stage::new(Duration::from_secs(10), 2),
        ]));
        let control = engine.control();
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(ms(100));
            control.abort("operator cancel");
        });
        let summary = engine.run(request_script(false)).unwrap();
        trigger.join().unwrap();
        assert_eq!(summary.state, RunState::Aborted);
        assert_eq!(summary.aborted_by.as_deref(), Some("operator cancel"));
        assert_eq!(summary.stragglers, 0);
    }

    #[test]
    fn test_late_abort_never_splits_state_and_reason() {
        // aborts land around the end of the schedule, on either side of stop()
        for delay in [40, 55, 60, 65, 80] {
            let engine = Engine::new(options(vec![Stage::new(ms(60), 1)]));
            let control = engine.control();
            let trigger = std::thread::spawn(move || {
                std::thread::sleep(ms(delay));
                control.abort("late cancel");
            });
            let summary = engine.run(request_script(false)).unwrap();
            trigger.join().unwrap();
            assert_eq!(
                summary.state == RunState::Aborted,
                summary.aborted_by.is_some(),
                "delay {}ms gave {:?} / {:?}",
                delay,
                summary.state,
                summary.aborted_by
            );
        }
    }

    #[test]
    fn test_abort_latency_bound() {
        let opts = options(vec![Stage::new(ms(10), 1)]);
        assert_eq!(abort_latency_bound(&opts), ms(30));
    }
}
