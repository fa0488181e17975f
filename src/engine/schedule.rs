use serde::Serialize;
use std::time::Duration;

/// One ramp window: over `duration`, move linearly from the previous target to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Ordered stages plus the VU count the first stage ramps from.
///
/// Stages are consumed strictly in declared order. Once the cumulative
/// duration has elapsed the schedule is exhausted and [`target_at`](Self::target_at)
/// returns `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSchedule {
    stages: Vec<Stage>,
    start_target: usize,
}

impl StageSchedule {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self::with_start(stages, 0)
    }

    pub fn with_start(stages: Vec<Stage>, start_target: usize) -> Self {
        Self {
            stages,
            start_target,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn start_target(&self) -> usize {
        self.start_target
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn total_duration(&self) -> Duration {
        self.stages
            .iter()
            .fold(Duration::ZERO, |acc, s| acc.saturating_add(s.duration))
    }

    /// Largest VU count the schedule ever asks for.
    pub fn max_target(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_target, usize::max)
    }

    pub fn is_complete(&self, elapsed: Duration) -> bool {
        elapsed >= self.total_duration()
    }

    /// Index of the stage whose window contains `elapsed`.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_start = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            let stage_end = stage_start.saturating_add(stage.duration);
            if elapsed < stage_end {
                return Some(i);
            }
            stage_start = stage_end;
        }
        None
    }

    /// Target VU count at `elapsed` since run start, or `None` once the schedule is exhausted.
    pub fn target_at(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_start = Duration::ZERO;
        let mut prev_target = self.start_target;

        for stage in &self.stages {
            let stage_end = stage_start.saturating_add(stage.duration);
            // zero-length stages never contain `elapsed`, so their target is taken as-is
            if elapsed < stage_end {
                let into_stage = (elapsed - stage_start).as_secs_f64();
                let progress = into_stage / stage.duration.as_secs_f64();
                let diff = stage.target as f64 - prev_target as f64;
                let value = (prev_target as f64 + diff * progress).round();
                return Some(value.max(0.0) as usize);
            }
            stage_start = stage_end;
            prev_target = stage.target;
        }
        None
    }
}
