use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Shared state between the run controller, the threshold evaluator and VUs.
///
/// Abort is cooperative: raising it only flips flags that VUs observe
/// between iterations.
pub struct ControlState {
    /// Set once the run must wind down (natural end or abort)
    stopped: AtomicBool,
    /// Set by the first abort; never cleared
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    /// VU threads currently inside their iteration loop
    live_vus: AtomicUsize,
    /// High-water mark of `live_vus`
    max_live_vus: AtomicUsize,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            live_vus: AtomicUsize::new(0),
            max_live_vus: AtomicUsize::new(0),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Raise the abort signal. Returns `true` only for the call that actually
    /// raised it; later calls are no-ops and keep the first reason.
    ///
    /// The reason is stored under the same lock that guards the flag flip, so
    /// a reader that sees `is_aborted()` always finds the reason.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.abort_reason.lock();
        let won = self
            .aborted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            *slot = Some(reason.into());
            drop(slot);
            self.stop();
        }
        won
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().clone()
    }

    pub fn vu_started(&self) {
        let now = self.live_vus.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live_vus.fetch_max(now, Ordering::SeqCst);
    }

    pub fn vu_finished(&self) {
        self.live_vus.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live_vus(&self) -> usize {
        self.live_vus.load(Ordering::SeqCst)
    }

    pub fn max_live_vus(&self) -> usize {
        self.max_live_vus.load(Ordering::SeqCst)
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the live-VU gauge honest even if a VU thread unwinds.
pub(crate) struct LiveVuGuard<'a>(&'a ControlState);

impl<'a> LiveVuGuard<'a> {
    pub(crate) fn enter(state: &'a ControlState) -> Self {
        state.vu_started();
        Self(state)
    }
}

impl Drop for LiveVuGuard<'_> {
    fn drop(&mut self) {
        self.0.vu_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_control_state_stop() {
        let state = ControlState::new();
        assert!(!state.is_stopped());
        state.stop();
        assert!(state.is_stopped());
        assert!(!state.is_aborted());
    }

    #[test]
    fn test_abort_is_raised_once() {
        let state = ControlState::new();
        assert!(state.abort("first"));
        assert!(!state.abort("second"));
        assert!(state.is_aborted());
        assert!(state.is_stopped());
        assert_eq!(state.abort_reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_concurrent_abort_has_single_winner() {
        let state = Arc::new(ControlState::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let state = state.clone();
                std::thread::spawn(move || state.abort(format!("vu {}", i)))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(state.abort_reason().is_some());
    }

    #[test]
    fn test_aborted_flag_never_seen_without_reason() {
        for _ in 0..200 {
            let state = Arc::new(ControlState::new());
            let writer = {
                let state = state.clone();
                std::thread::spawn(move || state.abort("evaluator"))
            };
            while !state.is_aborted() {
                std::hint::spin_loop();
            }
            assert_eq!(state.abort_reason().as_deref(), Some("evaluator"));
            assert!(writer.join().unwrap());
        }
    }

    #[test]
    fn test_live_vu_gauges() {
        let state = ControlState::new();
        {
            let _a = LiveVuGuard::enter(&state);
            let _b = LiveVuGuard::enter(&state);
            assert_eq!(state.live_vus(), 2);
        }
        let _c = LiveVuGuard::enter(&state);
        assert_eq!(state.live_vus(), 1);
        assert_eq!(state.max_live_vus(), 2);
    }
}
