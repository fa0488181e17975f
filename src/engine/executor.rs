use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::engine::control::{ControlState, LiveVuGuard};
use crate::stats::{Collector, Metric, RequestOutcome};

/// How often a sleeping VU or a draining executor re-checks its stop flags.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One iteration of user behaviour, run repeatedly by every VU.
///
/// An `Err` or a panic marks the iteration as failed; the VU carries on with
/// the next one.
pub trait IterationScript: Send + Sync + 'static {
    fn run_iteration(&self, vu: &VuContext) -> anyhow::Result<()>;
}

impl<F> IterationScript for F
where
    F: Fn(&VuContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn run_iteration(&self, vu: &VuContext) -> anyhow::Result<()> {
        self(vu)
    }
}

/// Per-VU handle given to the script: identity plus metric and check sinks.
pub struct VuContext {
    vu_id: usize,
    iteration: Cell<u64>,
    collector: Arc<Collector>,
    control: Arc<ControlState>,
    running: Arc<AtomicBool>,
}

impl VuContext {
    pub(crate) fn new(
        vu_id: usize,
        collector: Arc<Collector>,
        control: Arc<ControlState>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            vu_id,
            iteration: Cell::new(0),
            collector,
            control,
            running,
        }
    }

    pub fn vu_id(&self) -> usize {
        self.vu_id
    }

    /// Zero-based index of the iteration currently running on this VU.
    pub fn iteration(&self) -> u64 {
        self.iteration.get()
    }

    /// Records a named check and returns `passed` so it can be used inline.
    pub fn check(&self, name: &str, passed: bool) -> bool {
        self.collector.record_check(self.vu_id, name, passed);
        passed
    }

    pub fn record_request(&self, outcome: RequestOutcome) {
        self.collector.record_request(self.vu_id, outcome);
    }

    pub fn add_trend(&self, name: &str, value: f64) {
        self.collector.add(
            self.vu_id,
            Metric::Trend {
                name: name.to_string(),
                value,
            },
        );
    }

    pub fn add_rate(&self, name: &str, success: bool) {
        self.collector.add(
            self.vu_id,
            Metric::Rate {
                name: name.to_string(),
                success,
            },
        );
    }

    pub fn add_counter(&self, name: &str, value: f64) {
        self.collector.add(
            self.vu_id,
            Metric::Counter {
                name: name.to_string(),
                value,
            },
        );
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.collector.add(
            self.vu_id,
            Metric::Gauge {
                name: name.to_string(),
                value,
            },
        );
    }

    /// True once this VU was asked to stop, either by scale-down or by the
    /// end of the run. Long scripts may poll it between steps.
    pub fn is_stopping(&self) -> bool {
        !self.running.load(Ordering::Relaxed) || self.control.is_stopped()
    }
}

struct VuHandle {
    id: usize,
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl VuHandle {
    fn signal_stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Owns the VU threads and keeps their number at the scheduler's target.
pub struct VuExecutor {
    script: Arc<dyn IterationScript>,
    collector: Arc<Collector>,
    control: Arc<ControlState>,
    min_iteration_duration: Option<Duration>,
    active: Vec<VuHandle>,
    // told to stop, still finishing their current iteration
    draining: Vec<VuHandle>,
    next_vu_id: usize,
}

impl VuExecutor {
    pub fn new(
        script: Arc<dyn IterationScript>,
        collector: Arc<Collector>,
        control: Arc<ControlState>,
        min_iteration_duration: Option<Duration>,
    ) -> Self {
        Self {
            script,
            collector,
            control,
            min_iteration_duration,
            active: Vec::new(),
            draining: Vec::new(),
            next_vu_id: 0,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn draining_count(&self) -> usize {
        self.draining.len()
    }

    /// Moves the VU population towards `target`.
    ///
    /// New VUs are only spawned for the gap not already covered by VUs that
    /// are still draining, so the number of VU threads never exceeds `target`
    /// at the moment of spawning.
    pub fn scale_to(&mut self, target: usize) -> std::io::Result<()> {
        self.reap();

        let current = self.active.len();
        if target > current {
            if self.control.is_stopped() {
                return Ok(());
            }
            let in_flight = current + self.draining.len();
            let to_spawn = target.saturating_sub(in_flight);
            for _ in 0..to_spawn {
                let handle = self.spawn_vu()?;
                self.active.push(handle);
            }
            if to_spawn > 0 {
                debug!(
                    spawned = to_spawn,
                    active = self.active.len(),
                    vu_target = target,
                    "scaled up"
                );
            }
        } else if target < current {
            // newest VUs go first
            for handle in self.active.drain(target..).rev() {
                handle.signal_stop();
                self.draining.push(handle);
            }
            debug!(
                active = self.active.len(),
                draining = self.draining.len(),
                vu_target = target,
                "scaled down"
            );
        }
        Ok(())
    }

    /// Joins VU threads that have exited.
    pub fn reap(&mut self) {
        for list in [&mut self.active, &mut self.draining] {
            let (finished, still_running): (Vec<_>, Vec<_>) =
                list.drain(..).partition(|h| h.thread.is_finished());
            *list = still_running;
            for handle in finished {
                if handle.thread.join().is_err() {
                    warn!(vu = handle.id, "VU thread panicked outside its iteration");
                }
            }
        }
    }

    /// Signals every VU to stop and waits up to `graceful_stop` for in-flight
    /// iterations to finish. Returns how many VUs were left running.
    pub fn drain(&mut self, graceful_stop: Duration) -> usize {
        for handle in self.active.drain(..) {
            handle.signal_stop();
            self.draining.push(handle);
        }

        // `None` when the grace period runs past what `Instant` can hold
        let deadline = Instant::now().checked_add(graceful_stop);
        loop {
            self.reap();
            let expired = deadline.map_or(false, |d| Instant::now() >= d);
            if self.draining.is_empty() || expired {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let stragglers = self.draining.len();
        if stragglers > 0 {
            warn!(
                stragglers,
                graceful_stop = ?graceful_stop,
                "VUs still running after graceful stop, detaching"
            );
            // dropping a JoinHandle detaches the thread
            self.draining.clear();
        }
        stragglers
    }

    fn spawn_vu(&mut self) -> std::io::Result<VuHandle> {
        let id = self.next_vu_id;
        self.next_vu_id += 1;

        let running = Arc::new(AtomicBool::new(true));
        let ctx = VuContext::new(
            id,
            self.collector.clone(),
            self.control.clone(),
            running.clone(),
        );
        let script = self.script.clone();
        let min_iteration_duration = self.min_iteration_duration;

        let thread = std::thread::Builder::new()
            .name(format!("vu-{}", id))
            .spawn(move || vu_loop(ctx, script, min_iteration_duration))?;

        Ok(VuHandle {
            id,
            running,
            thread,
        })
    }
}

impl Drop for VuExecutor {
    fn drop(&mut self) {
        for handle in self.active.iter().chain(self.draining.iter()) {
            handle.signal_stop();
        }
    }
}

fn vu_loop(
    ctx: VuContext,
    script: Arc<dyn IterationScript>,
    min_iteration_duration: Option<Duration>,
) {
    let control = ctx.control.clone();
    let _live = LiveVuGuard::enter(&control);

    while !ctx.is_stopping() {
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| script.run_iteration(&ctx)));
        let duration = started.elapsed();

        let failed = match result {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                debug!(vu = ctx.vu_id, error = %e, "iteration failed");
                true
            }
            Err(_) => {
                warn!(vu = ctx.vu_id, "iteration panicked");
                true
            }
        };
        ctx.collector
            .add(ctx.vu_id, Metric::Iteration { duration, failed });
        ctx.iteration.set(ctx.iteration.get() + 1);

        if let Some(min) = min_iteration_duration {
            if duration < min {
                pause(&ctx, min - duration);
            }
        }
    }
}

/// Sleeps for `wait` but wakes early when the VU is told to stop.
fn pause(ctx: &VuContext, wait: Duration) {
    let deadline = Instant::now().checked_add(wait);
    while !ctx.is_stopping() {
        let nap = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    break;
                }
                (d - now).min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };
        std::thread::sleep(nap);
    }
}
