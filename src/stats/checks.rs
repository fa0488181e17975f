use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// One named assertion result reported by an iteration script.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub timestamp: Instant,
}

impl CheckOutcome {
    pub fn new(name: impl Into<String>, passed: bool) -> Self {
        Self {
            name: name.into(),
            passed,
            timestamp: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckCounts {
    pub passes: u64,
    pub fails: u64,
}

impl CheckCounts {
    pub fn total(&self) -> u64 {
        self.passes + self.fails
    }

    pub fn rate(&self) -> Option<f64> {
        let total = self.total();
        (total > 0).then(|| self.passes as f64 / total as f64)
    }

    pub fn merged(self, other: CheckCounts) -> CheckCounts {
        CheckCounts {
            passes: self.passes + other.passes,
            fails: self.fails + other.fails,
        }
    }

    fn bump(&mut self, passed: bool) {
        if passed {
            self.passes += 1;
        } else {
            self.fails += 1;
        }
    }
}

type CheckShard = RwLock<HashMap<String, CheckCounts>>;

/// Thread-safe, append-only pass/fail counters keyed by check name.
///
/// Counters are split into shards picked by `vu_id % num_shards`, like
/// [`ShardedAggregator`](crate::stats::ShardedAggregator). Each record runs
/// inside one shard's write section, so a reader never sees a pass counted
/// without its total.
pub struct CheckRecorder {
    shards: Vec<CheckShard>,
}

impl Default for CheckRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckRecorder {
    pub fn new() -> Self {
        Self::with_shards(1)
    }

    pub fn with_shards(num_shards: usize) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn record(&self, name: &str, passed: bool) {
        self.record_for(0, name, passed);
    }

    /// Records into the shard owned by `vu_id`.
    pub fn record_for(&self, vu_id: usize, name: &str, passed: bool) {
        let mut counts = self.shards[vu_id % self.shards.len()].write();
        // avoid allocating the key on the hot path once a name is known
        if let Some(entry) = counts.get_mut(name) {
            entry.bump(passed);
        } else {
            counts.entry(name.to_string()).or_default().bump(passed);
        }
    }

    pub fn record_outcome(&self, outcome: CheckOutcome) {
        self.record(&outcome.name, outcome.passed);
    }

    pub fn counts(&self, name: &str) -> Option<CheckCounts> {
        self.shards
            .iter()
            .filter_map(|shard| shard.read().get(name).copied())
            .reduce(CheckCounts::merged)
    }

    /// Fraction of passed evaluations of `name`, `None` if it was never recorded.
    pub fn pass_rate(&self, name: &str) -> Option<f64> {
        self.counts(name).and_then(|c| c.rate())
    }

    /// Pass rate across every check name.
    pub fn total_rate(&self) -> Option<f64> {
        self.totals().rate()
    }

    pub fn totals(&self) -> CheckCounts {
        self.shards.iter().fold(CheckCounts::default(), |acc, shard| {
            shard.read().values().fold(acc, |acc, c| acc.merged(*c))
        })
    }

    /// Copy of all counters merged across shards, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, CheckCounts> {
        let mut merged = BTreeMap::new();
        for shard in &self.shards {
            for (name, counts) in shard.read().iter() {
                let entry: &mut CheckCounts = merged.entry(name.clone()).or_default();
                *entry = entry.merged(*counts);
            }
        }
        merged
    }
}
