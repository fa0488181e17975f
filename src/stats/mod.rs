use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::stats::checks::{CheckCounts, CheckRecorder};
use crate::stats::threshold::Aggregation;

pub mod checks;
pub mod csv;
pub mod threshold;

/// Highest latency the histograms track: one hour, in microseconds.
const MAX_TRACKED_MICROS: u64 = 60 * 60 * 1000 * 1000;

/// Custom trend values are stored with three decimals of precision.
const TREND_SCALE: f64 = 1000.0;

fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, MAX_TRACKED_MICROS, 2)
        .expect("histogram bounds are static and valid")
}

/// Result of a single network call, as seen by the transport.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub name: String,
    /// Counts towards `http_req_failed` when false; independent of checks.
    pub succeeded: bool,
    pub status: u16,
    pub latency: Duration,
    pub error: Option<String>,
    pub timestamp: Instant,
}

impl RequestOutcome {
    pub fn success(name: impl Into<String>, status: u16, latency: Duration) -> Self {
        Self {
            name: name.into(),
            succeeded: true,
            status,
            latency,
            error: None,
            timestamp: Instant::now(),
        }
    }

    /// A received response; statuses outside 200..=399 count as failed requests.
    pub fn from_status(name: impl Into<String>, status: u16, latency: Duration) -> Self {
        Self {
            succeeded: (200..400).contains(&status),
            ..Self::success(name, status, latency)
        }
    }

    pub fn failure(name: impl Into<String>, error: impl Into<String>, latency: Duration) -> Self {
        Self {
            name: name.into(),
            succeeded: false,
            status: 0,
            latency,
            error: Some(error.into()),
            timestamp: Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Metric {
    Request(RequestOutcome),
    Iteration { duration: Duration, failed: bool },
    // Custom metrics reported by scripts
    Trend { name: String, value: f64 },
    Rate { name: String, success: bool },
    Counter { name: String, value: f64 },
    Gauge { name: String, value: f64 },
}

#[derive(Clone)]
pub struct RequestStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Duration,
    pub histogram: Histogram<u64>,
}

impl RequestStats {
    pub fn new() -> Self {
        Self {
            total_requests: 0,
            failed_requests: 0,
            total_duration: Duration::ZERO,
            min_duration: None,
            max_duration: Duration::ZERO,
            histogram: new_histogram(),
        }
    }

    fn observe(&mut self, latency: Duration, failed: bool) {
        self.total_requests += 1;
        if failed {
            self.failed_requests += 1;
        }
        self.total_duration += latency;
        if self.min_duration.map_or(true, |min| latency < min) {
            self.min_duration = Some(latency);
        }
        if latency > self.max_duration {
            self.max_duration = latency;
        }
        let _ = self.histogram.record(micros(latency));
    }

    fn merge(&mut self, other: &RequestStats) {
        self.total_requests += other.total_requests;
        self.failed_requests += other.failed_requests;
        self.total_duration += other.total_duration;
        if let Some(other_min) = other.min_duration {
            if self.min_duration.map_or(true, |min| other_min < min) {
                self.min_duration = Some(other_min);
            }
        }
        if other.max_duration > self.max_duration {
            self.max_duration = other.max_duration;
        }
        self.histogram.add(&other.histogram).ok();
    }

    fn avg_ms(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_duration.as_secs_f64() * 1000.0 / self.total_requests as f64
    }

    fn quantile_ms(&self, q: f64) -> f64 {
        self.histogram.value_at_quantile(q) as f64 / 1000.0
    }

    fn aggregate_ms(&self, aggregation: &Aggregation) -> Option<f64> {
        if self.total_requests == 0 {
            return None;
        }
        match aggregation {
            Aggregation::Avg => Some(self.avg_ms()),
            Aggregation::Min => Some(self.min_duration.unwrap_or_default().as_secs_f64() * 1000.0),
            Aggregation::Max => Some(self.max_duration.as_secs_f64() * 1000.0),
            Aggregation::Med => Some(self.quantile_ms(0.5)),
            Aggregation::Percentile(p) => Some(self.quantile_ms(p / 100.0)),
            Aggregation::Count => Some(self.total_requests as f64),
            _ => None,
        }
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct TrendStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub histogram: Histogram<u64>,
}

impl TrendStats {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            histogram: new_histogram(),
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let scaled = (value.max(0.0) * TREND_SCALE).round() as u64;
        let _ = self.histogram.record(scaled.max(1));
    }

    fn merge(&mut self, other: &TrendStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.histogram.add(&other.histogram).ok();
    }

    fn aggregate(&self, aggregation: &Aggregation) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let quantile = |q: f64| self.histogram.value_at_quantile(q) as f64 / TREND_SCALE;
        match aggregation {
            Aggregation::Avg => Some(self.sum / self.count as f64),
            Aggregation::Min => Some(self.min),
            Aggregation::Max => Some(self.max),
            Aggregation::Med => Some(quantile(0.5)),
            Aggregation::Percentile(p) => Some(quantile(p / 100.0)),
            Aggregation::Count => Some(self.count as f64),
            _ => None,
        }
    }
}

/// One shard of run metrics. Owns every derived metric except checks.
#[derive(Clone)]
pub struct StatsAggregator {
    pub http: RequestStats,
    pub status_codes: HashMap<u16, u64>,
    pub errors: HashMap<String, u64>,
    pub requests: HashMap<String, RequestStats>,
    pub iterations: RequestStats,
    // Custom Metrics Storage
    pub trends: HashMap<String, TrendStats>,
    pub rates: HashMap<String, (u64, u64)>, // (total, success)
    pub counters: HashMap<String, f64>,
    pub gauges: HashMap<String, f64>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            http: RequestStats::new(),
            status_codes: HashMap::new(),
            errors: HashMap::new(),
            requests: HashMap::new(),
            iterations: RequestStats::new(),
            trends: HashMap::new(),
            rates: HashMap::new(),
            counters: HashMap::new(),
            gauges: HashMap::new(),
        }
    }

    pub fn add(&mut self, metric: Metric) {
        match metric {
            Metric::Request(outcome) => {
                let failed = !outcome.succeeded;
                self.http.observe(outcome.latency, failed);
                *self.status_codes.entry(outcome.status).or_insert(0) += 1;
                if let Some(err) = outcome.error {
                    *self.errors.entry(err).or_insert(0) += 1;
                }
                self.requests
                    .entry(outcome.name)
                    .or_default()
                    .observe(outcome.latency, failed);
            }
            Metric::Iteration { duration, failed } => {
                self.iterations.observe(duration, failed);
            }
            Metric::Trend { name, value } => {
                self.trends
                    .entry(name)
                    .or_insert_with(TrendStats::new)
                    .observe(value);
            }
            Metric::Rate { name, success } => {
                let entry = self.rates.entry(name).or_insert((0, 0));
                entry.0 += 1;
                if success {
                    entry.1 += 1;
                }
            }
            Metric::Counter { name, value } => {
                *self.counters.entry(name).or_insert(0.0) += value;
            }
            Metric::Gauge { name, value } => {
                self.gauges.insert(name, value);
            }
        }
    }

    pub fn merge_from(&mut self, other: &StatsAggregator) {
        self.http.merge(&other.http);
        for (code, count) in &other.status_codes {
            *self.status_codes.entry(*code).or_insert(0) += count;
        }
        for (err, count) in &other.errors {
            *self.errors.entry(err.clone()).or_insert(0) += count;
        }
        for (name, stats) in &other.requests {
            self.requests.entry(name.clone()).or_default().merge(stats);
        }
        self.iterations.merge(&other.iterations);
        for (name, trend) in &other.trends {
            self.trends
                .entry(name.clone())
                .or_insert_with(TrendStats::new)
                .merge(trend);
        }
        for (name, (total, success)) in &other.rates {
            let entry = self.rates.entry(name.clone()).or_insert((0, 0));
            entry.0 += total;
            entry.1 += success;
        }
        for (name, val) in &other.counters {
            *self.counters.entry(name.clone()).or_insert(0.0) += val;
        }
        // gauges: last shard wins, same as a last-write
        for (name, val) in &other.gauges {
            self.gauges.insert(name.clone(), *val);
        }
    }

    /// Fraction of requests that failed at the transport level, over the whole run so far.
    pub fn failure_rate(&self) -> Option<f64> {
        let total = self.http.total_requests;
        (total > 0).then(|| self.http.failed_requests as f64 / total as f64)
    }

    pub fn to_report(&self, checks: &BTreeMap<String, CheckCounts>) -> ReportStats {
        let grouped_requests = self
            .requests
            .iter()
            .map(|(name, stats)| {
                (
                    name.clone(),
                    RequestReport {
                        total_requests: stats.total_requests,
                        failed_requests: stats.failed_requests,
                        avg_latency_ms: stats.avg_ms(),
                        p95_latency_ms: stats.quantile_ms(0.95),
                        max_latency_ms: stats.max_duration.as_secs_f64() * 1000.0,
                    },
                )
            })
            .collect();

        let trends = self
            .trends
            .iter()
            .map(|(name, t)| {
                let get = |a: Aggregation| t.aggregate(&a).unwrap_or(0.0);
                (
                    name.clone(),
                    TrendReport {
                        avg: get(Aggregation::Avg),
                        min: get(Aggregation::Min),
                        max: get(Aggregation::Max),
                        p90: get(Aggregation::Percentile(90.0)),
                        p95: get(Aggregation::Percentile(95.0)),
                        p99: get(Aggregation::Percentile(99.0)),
                        count: t.count,
                    },
                )
            })
            .collect();

        let rates = self
            .rates
            .iter()
            .map(|(name, &(total, success))| {
                let rate = if total > 0 {
                    success as f64 / total as f64
                } else {
                    0.0
                };
                (
                    name.clone(),
                    RateReport {
                        total,
                        success,
                        rate,
                    },
                )
            })
            .collect();

        let http = &self.http;
        let has_requests = http.total_requests > 0;
        let quantile = |q: f64| if has_requests { http.quantile_ms(q) } else { 0.0 };

        ReportStats {
            total_requests: http.total_requests,
            failed_requests: http.failed_requests,
            http_req_failed_rate: self.failure_rate().unwrap_or(0.0),
            avg_latency_ms: http.avg_ms(),
            min_latency_ms: http.min_duration.unwrap_or_default().as_secs_f64() * 1000.0,
            max_latency_ms: http.max_duration.as_secs_f64() * 1000.0,
            p50_latency_ms: quantile(0.5),
            p90_latency_ms: quantile(0.9),
            p95_latency_ms: quantile(0.95),
            p99_latency_ms: quantile(0.99),
            status_codes: self.status_codes.iter().map(|(k, v)| (*k, *v)).collect(),
            errors: self.errors.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            checks: checks.clone(),
            grouped_requests,
            iterations: self.iterations.total_requests,
            failed_iterations: self.iterations.failed_requests,
            avg_iteration_ms: self.iterations.avg_ms(),
            trends,
            rates,
            counters: self.counters.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            gauges: self.gauges.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }
}

/// Sharded aggregator for reduced lock contention at high concurrency.
/// Metrics are distributed across N shards based on vu_id % num_shards.
pub struct ShardedAggregator {
    shards: Vec<RwLock<StatsAggregator>>,
}

impl ShardedAggregator {
    pub fn new(num_shards: usize) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| RwLock::new(StatsAggregator::new()))
            .collect();
        Self { shards }
    }

    /// Shard count for a run with up to `max_vus` concurrent VUs.
    pub fn for_vus(max_vus: usize) -> Self {
        // ~100 VUs per shard, never fewer shards than cores
        let num_shards = (max_vus / 100).max(num_cpus::get()).min(256);
        Self::new(num_shards)
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn add(&self, vu_id: usize, metric: Metric) {
        let idx = vu_id % self.shards.len();
        self.shards[idx].write().add(metric);
    }

    /// Merge all shards. Each shard is read under its own lock, so per-shard
    /// counters are never torn.
    pub fn merge(&self) -> StatsAggregator {
        let mut merged = StatsAggregator::new();
        for shard in &self.shards {
            merged.merge_from(&shard.read());
        }
        merged
    }
}

/// Everything VUs write into during a run: the sharded metric store and the check recorder.
pub struct Collector {
    aggregator: ShardedAggregator,
    checks: CheckRecorder,
}

impl Collector {
    pub fn new(aggregator: ShardedAggregator) -> Self {
        let checks = CheckRecorder::with_shards(aggregator.num_shards());
        Self { aggregator, checks }
    }

    pub fn add(&self, vu_id: usize, metric: Metric) {
        self.aggregator.add(vu_id, metric);
    }

    pub fn record_request(&self, vu_id: usize, outcome: RequestOutcome) {
        self.aggregator.add(vu_id, Metric::Request(outcome));
    }

    pub fn record_check(&self, vu_id: usize, name: &str, passed: bool) {
        self.checks.record_for(vu_id, name, passed);
    }

    pub fn checks(&self) -> &CheckRecorder {
        &self.checks
    }

    pub fn snapshot(&self, elapsed: Duration, live_vus: usize, max_live_vus: usize) -> MetricSnapshot {
        MetricSnapshot {
            stats: self.aggregator.merge(),
            checks: self.checks.snapshot(),
            elapsed,
            live_vus,
            max_live_vus,
        }
    }
}

/// Point-in-time view of all metrics, used by thresholds and the final report.
pub struct MetricSnapshot {
    pub stats: StatsAggregator,
    pub checks: BTreeMap<String, CheckCounts>,
    pub elapsed: Duration,
    pub live_vus: usize,
    pub max_live_vus: usize,
}

impl MetricSnapshot {
    /// Current value of `metric` under `aggregation`; `None` when there is no
    /// data yet or the pairing makes no sense.
    pub fn value(&self, metric: &str, aggregation: &Aggregation) -> Option<f64> {
        let per_second = |count: u64| {
            let secs = self.elapsed.as_secs_f64();
            (secs > 0.0).then(|| count as f64 / secs)
        };
        let stats = &self.stats;

        match metric {
            "http_req_failed" => match aggregation {
                Aggregation::Rate => stats.failure_rate(),
                _ => None,
            },
            "http_req_duration" => stats.http.aggregate_ms(aggregation),
            "http_reqs" => match aggregation {
                Aggregation::Count => Some(stats.http.total_requests as f64),
                Aggregation::Rate => per_second(stats.http.total_requests),
                _ => None,
            },
            "checks" => match aggregation {
                Aggregation::Rate => {
                    let totals = self.checks.values().fold(CheckCounts::default(), |acc, c| {
                        CheckCounts {
                            passes: acc.passes + c.passes,
                            fails: acc.fails + c.fails,
                        }
                    });
                    totals.rate()
                }
                _ => None,
            },
            "iterations" => match aggregation {
                Aggregation::Count => Some(stats.iterations.total_requests as f64),
                Aggregation::Rate => per_second(stats.iterations.total_requests),
                _ => None,
            },
            "iteration_duration" => stats.iterations.aggregate_ms(aggregation),
            "vus" => matches!(aggregation, Aggregation::Value).then_some(self.live_vus as f64),
            "vus_max" => {
                matches!(aggregation, Aggregation::Value).then_some(self.max_live_vus as f64)
            }
            custom => self.custom_value(custom, aggregation),
        }
    }

    fn custom_value(&self, name: &str, aggregation: &Aggregation) -> Option<f64> {
        let stats = &self.stats;
        if let Some(&(total, success)) = stats.rates.get(name) {
            return match aggregation {
                Aggregation::Rate if total > 0 => Some(success as f64 / total as f64),
                _ => None,
            };
        }
        if let Some(trend) = stats.trends.get(name) {
            return trend.aggregate(aggregation);
        }
        if let Some(&value) = stats.counters.get(name) {
            return match aggregation {
                Aggregation::Count => Some(value),
                Aggregation::Rate => {
                    let secs = self.elapsed.as_secs_f64();
                    (secs > 0.0).then(|| value / secs)
                }
                _ => None,
            };
        }
        if let Some(&value) = stats.gauges.get(name) {
            return matches!(aggregation, Aggregation::Value).then_some(value);
        }
        None
    }

    pub fn to_report(&self) -> ReportStats {
        self.stats.to_report(&self.checks)
    }
}

fn micros(d: Duration) -> u64 {
    (d.as_micros() as u64).clamp(1, MAX_TRACKED_MICROS)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestReport {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub max_latency_ms: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrendReport {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RateReport {
    pub total: u64,
    pub success: u64,
    pub rate: f64,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ReportStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub http_req_failed_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p90_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub status_codes: BTreeMap<u16, u64>,
    pub errors: BTreeMap<String, u64>,
    pub checks: BTreeMap<String, CheckCounts>,
    pub grouped_requests: BTreeMap<String, RequestReport>,
    pub iterations: u64,
    pub failed_iterations: u64,
    pub avg_iteration_ms: f64,
    // Custom Metrics
    pub trends: BTreeMap<String, TrendReport>,
    pub rates: BTreeMap<String, RateReport>,
    pub counters: BTreeMap<String, f64>,
    pub gauges: BTreeMap<String, f64>,
}

impl ReportStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn print(&self) {
        println!("\n--- Test Summary ---");

        if self.total_requests == 0 && self.checks.is_empty() && self.iterations == 0 {
            println!("No metrics collected.");
            println!("--------------------\n");
            return;
        }

        if self.total_requests > 0 {
            println!("Total Requests: {}", self.total_requests);
            println!(
                "Failed:         {} ({:.2}%)",
                self.failed_requests,
                self.http_req_failed_rate * 100.0
            );
            println!("Avg Latency:    {:.2}ms", self.avg_latency_ms);
            println!("Min Latency:    {:.2}ms", self.min_latency_ms);
            println!("Max Latency:    {:.2}ms", self.max_latency_ms);
            println!("P50 Latency:    {:.2}ms", self.p50_latency_ms);
            println!("P90 Latency:    {:.2}ms", self.p90_latency_ms);
            println!("P95 Latency:    {:.2}ms", self.p95_latency_ms);
            println!("P99 Latency:    {:.2}ms", self.p99_latency_ms);

            println!("\nStatus Codes:");
            for (code, count) in &self.status_codes {
                println!("  {}: {}", code, count);
            }
        }

        println!(
            "\nIterations:     {} ({} failed, avg {:.2}ms)",
            self.iterations, self.failed_iterations, self.avg_iteration_ms
        );

        if !self.grouped_requests.is_empty() {
            println!("\nGrouped Requests:");
            for (name, stats) in &self.grouped_requests {
                println!("  Request: {}", name);
                println!("    Count: {}", stats.total_requests);
                println!("    P95:   {:.2}ms", stats.p95_latency_ms);
                if stats.failed_requests > 0 {
                    println!("    Errors: {}", stats.failed_requests);
                }
            }
        }

        if !self.errors.is_empty() {
            println!("\nErrors:");
            for (err, count) in &self.errors {
                println!("  {}: {}", err, count);
            }
        }

        if !self.checks.is_empty() {
            println!("\nChecks:");
            for (name, counts) in &self.checks {
                let percent = counts.rate().unwrap_or(0.0) * 100.0;
                if counts.fails > 0 {
                    println!(
                        "  ✗ {} : {:.2}% ({} passed, {} failed)",
                        name, percent, counts.passes, counts.fails
                    );
                } else {
                    println!("  ✓ {} : 100% ({} passed)", name, counts.passes);
                }
            }
        }

        if !self.trends.is_empty() {
            println!("\nTrends:");
            for (name, t) in &self.trends {
                println!(
                    "  {}: avg={:.2}, p95={:.2}, count={}",
                    name, t.avg, t.p95, t.count
                );
            }
        }

        if !self.counters.is_empty() {
            println!("\nCounters:");
            for (name, val) in &self.counters {
                println!("  {}: {:.2}", name, val);
            }
        }

        if !self.gauges.is_empty() {
            println!("\nGauges:");
            for (name, val) in &self.gauges {
                println!("  {}: {:.2}", name, val);
            }
        }

        if !self.rates.is_empty() {
            println!("\nRates:");
            for (name, r) in &self.rates {
                println!(
                    "  {}: {:.2}% ({}/{})",
                    name,
                    r.rate * 100.0,
                    r.success,
                    r.total
                );
            }
        }

        println!("--------------------\n");
    }
}
