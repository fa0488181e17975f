use std::fmt::Write;

use crate::stats::threshold::{ThresholdResult, ThresholdStatus};
use crate::stats::ReportStats;

fn csv_safe(name: &str) -> String {
    name.replace([' ', ':', ','], "_")
}

/// Flat `metric_name,metric_type,value` rows for the end-of-run report.
pub fn generate_csv(report: &ReportStats, thresholds: &[ThresholdResult]) -> String {
    let mut out = String::from("metric_name,metric_type,value\n");

    // writing into a String cannot fail
    let _ = writeln!(out, "http_reqs,counter,{}", report.total_requests);
    let _ = writeln!(
        out,
        "http_req_failed,rate,{:.4}",
        report.http_req_failed_rate
    );
    for (suffix, value) in [
        ("avg", report.avg_latency_ms),
        ("min", report.min_latency_ms),
        ("max", report.max_latency_ms),
        ("p50", report.p50_latency_ms),
        ("p90", report.p90_latency_ms),
        ("p95", report.p95_latency_ms),
        ("p99", report.p99_latency_ms),
    ] {
        let _ = writeln!(out, "http_req_duration_{},trend,{:.3}", suffix, value);
    }
    let _ = writeln!(out, "iterations,counter,{}", report.iterations);
    let _ = writeln!(out, "iterations_failed,counter,{}", report.failed_iterations);
    let _ = writeln!(
        out,
        "iteration_duration_avg,trend,{:.3}",
        report.avg_iteration_ms
    );

    for (code, count) in &report.status_codes {
        let _ = writeln!(out, "http_req_status_{},counter,{}", code, count);
    }

    for (name, counts) in &report.checks {
        let safe_name = csv_safe(name);
        let _ = writeln!(out, "check_{}_passed,counter,{}", safe_name, counts.passes);
        let _ = writeln!(out, "check_{}_failed,counter,{}", safe_name, counts.fails);
    }

    for (name, trend) in &report.trends {
        let name = csv_safe(name);
        let _ = writeln!(out, "{}_count,counter,{}", name, trend.count);
        let _ = writeln!(out, "{}_avg,trend,{:.3}", name, trend.avg);
        let _ = writeln!(out, "{}_p95,trend,{:.3}", name, trend.p95);
    }
    for (name, value) in &report.counters {
        let _ = writeln!(out, "{},counter,{}", csv_safe(name), value);
    }
    for (name, value) in &report.gauges {
        let _ = writeln!(out, "{},gauge,{}", csv_safe(name), value);
    }
    for (name, rate) in &report.rates {
        let _ = writeln!(out, "{},rate,{:.4}", csv_safe(name), rate.rate);
    }

    for result in thresholds {
        let passed = match result.status {
            ThresholdStatus::Failed | ThresholdStatus::Aborted => 0,
            ThresholdStatus::Passed | ThresholdStatus::NoData => 1,
        };
        let _ = writeln!(
            out,
            "threshold_{}_{},threshold,{}",
            csv_safe(&result.metric),
            csv_safe(&result.expression),
            passed
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::checks::CheckCounts;
    use std::collections::BTreeMap;

    #[test]
    fn test_csv_generation() {
        let report = ReportStats {
            total_requests: 100,
            http_req_failed_rate: 0.05,
            avg_latency_ms: 45.5,
            p95_latency_ms: 100.0,
            status_codes: BTreeMap::from([(200, 95), (500, 5)]),
            checks: BTreeMap::from([(
                "testInputFound is status 200".to_string(),
                CheckCounts {
                    passes: 9,
                    fails: 1,
                },
            )]),
            ..Default::default()
        };
        let thresholds = vec![ThresholdResult {
            metric: "http_req_failed".to_string(),
            expression: "rate<0.05".to_string(),
            abort_on_fail: true,
            observed: Some(0.05),
            status: ThresholdStatus::Failed,
        }];

        let csv = generate_csv(&report, &thresholds);
        assert!(csv.starts_with("metric_name,metric_type,value\n"));
        assert!(csv.contains("http_reqs,counter,100"));
        assert!(csv.contains("http_req_failed,rate,0.0500"));
        assert!(csv.contains("http_req_duration_avg,trend,45.500"));
        assert!(csv.contains("http_req_status_500,counter,5"));
        assert!(csv.contains("check_testInputFound_is_status_200_failed,counter,1"));
        assert!(csv.contains("threshold_http_req_failed_rate<0.05,threshold,0"));
    }

    #[test]
    fn test_csv_rows_have_three_columns() {
        let report = ReportStats {
            counters: BTreeMap::from([("items, sold".to_string(), 3.0)]),
            ..Default::default()
        };
        for line in generate_csv(&report, &[]).lines() {
            assert_eq!(line.split(',').count(), 3, "bad row: {}", line);
        }
    }
}
