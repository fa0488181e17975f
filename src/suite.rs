//! GraphQL query suite for a rollups node: the default iteration script.
//!
//! Every iteration posts each query once, in order, and records two checks
//! per query: the status and the expected content of the body.

use anyhow::Context;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::engine::executor::{IterationScript, VuContext};
use crate::engine::http_client::HttpClient;
use crate::stats::RequestOutcome;

/// Application address the many-inputs query is scoped to.
pub const DAPP_ADDRESS: &str = "0xc812734eb42e12611CD2497569c451baD0f50A2d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Body contains this literal text
    Contains(&'static str),
    /// Every input carries exactly one notice, one report and one voucher
    OneOutputOfEachPerInput,
}

impl Expectation {
    pub fn matches(&self, body: &str) -> bool {
        match self {
            Expectation::Contains(needle) => body.contains(needle),
            Expectation::OneOutputOfEachPerInput => one_output_of_each_per_input(body),
        }
    }
}

fn one_output_of_each_per_input(body: &str) -> bool {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    let Some(inputs) = json.pointer("/data/inputs/edges").and_then(Value::as_array) else {
        return false;
    };
    inputs.iter().all(|input| {
        ["notices", "reports", "vouchers"].iter().all(|kind| {
            input
                .pointer(&format!("/node/{}/edges", kind))
                .and_then(Value::as_array)
                .is_some_and(|edges| edges.len() == 1)
        })
    })
}

#[derive(Debug, Clone, Copy)]
pub struct QueryCase {
    pub name: &'static str,
    pub query: &'static str,
    /// Appended to the endpoint as `/{suffix}`
    pub path_suffix: Option<&'static str>,
    pub expect: Expectation,
}

const MANY_INPUTS_QUERY: &str = "query { inputs { edges { node { id index payload \
    reports { edges { node { payload index } } } \
    notices { edges { node { payload index } } } \
    vouchers { edges { node { payload index } } } } } } }";

pub const ROLLUPS_CASES: &[QueryCase] = &[
    QueryCase {
        name: "testVoucherNotFound",
        query: "query { voucher(outputIndex: 99999) { index }}",
        path_suffix: None,
        expect: Expectation::Contains("voucher not found"),
    },
    QueryCase {
        name: "testVoucherFound",
        query: "query { voucher(outputIndex: 0) { index }}",
        path_suffix: None,
        expect: Expectation::Contains(r#"{"data":{"voucher":{"index":0}}}"#),
    },
    QueryCase {
        name: "testNoticeFound",
        query: "query { notice(outputIndex: 1) { index payload }}",
        path_suffix: None,
        expect: Expectation::Contains(r#"{"data":{"notice":{"index":1,"payload":"0xc258d6e5"#),
    },
    QueryCase {
        name: "testInputFound",
        query: r#"query { input(id: "1") { index }}"#,
        path_suffix: None,
        expect: Expectation::Contains(r#"{"data":{"input":{"index":1}}}"#),
    },
    QueryCase {
        name: "testReportFound",
        query: "query { report(reportIndex: 2) { index }}",
        path_suffix: None,
        expect: Expectation::Contains(r#"{"data":{"report":{"index":2}}}"#),
    },
    QueryCase {
        name: "testVouchers",
        query: "query { vouchers(first: 10) { edges { node { index }}}}",
        path_suffix: None,
        expect: Expectation::Contains(
            r#"{"data":{"vouchers":{"edges":[{"node":{"index":0}},{"node":{"index":2}}"#,
        ),
    },
    QueryCase {
        name: "testNotices",
        query: "query { notices(first: 10) { edges { node { index }}}}",
        path_suffix: None,
        expect: Expectation::Contains(
            r#"{"data":{"notices":{"edges":[{"node":{"index":1}},{"node":{"index":3}}"#,
        ),
    },
    QueryCase {
        name: "testReports",
        query: "query { reports(first: 10) { edges { node { index }}}}",
        path_suffix: None,
        expect: Expectation::Contains(
            r#"{"data":{"reports":{"edges":[{"node":{"index":0}},{"node":{"index":1}}"#,
        ),
    },
    QueryCase {
        name: "testInputs",
        query: "query { inputs(first: 10) { edges { node { index }}}}",
        path_suffix: None,
        expect: Expectation::Contains(
            r#"{"data":{"inputs":{"edges":[{"node":{"index":0}},{"node":{"index":1}}"#,
        ),
    },
    QueryCase {
        name: "testGetManyInputs",
        query: MANY_INPUTS_QUERY,
        path_suffix: Some(DAPP_ADDRESS),
        expect: Expectation::OneOutputOfEachPerInput,
    },
];

struct PreparedCase {
    case: QueryCase,
    url: String,
    body: String,
    status_check: String,
    content_check: String,
}

/// Runs [`ROLLUPS_CASES`] (or any other case list) against one endpoint.
pub struct GraphqlSuite {
    runtime: tokio::runtime::Runtime,
    client: HttpClient,
    cases: Vec<PreparedCase>,
}

impl GraphqlSuite {
    pub fn rollups(endpoint: &str, request_timeout: Duration, max_vus: usize) -> anyhow::Result<Self> {
        Self::new(endpoint, ROLLUPS_CASES, request_timeout, max_vus)
    }

    pub fn new(
        endpoint: &str,
        cases: &[QueryCase],
        request_timeout: Duration,
        max_vus: usize,
    ) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_cpus::get().max(2))
            .thread_name("volley-io")
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;
        let client = HttpClient::with_timeout(max_vus.max(1), request_timeout);

        let endpoint = endpoint.trim_end_matches('/');
        let cases = cases
            .iter()
            .map(|case| PreparedCase {
                case: *case,
                url: match case.path_suffix {
                    Some(suffix) => format!("{}/{}", endpoint, suffix),
                    None => endpoint.to_string(),
                },
                body: serde_json::json!({ "query": case.query }).to_string(),
                status_check: format!("{} is status 200", case.name),
                content_check: format!("{} response body contains expected content", case.name),
            })
            .collect();

        Ok(Self {
            runtime,
            client,
            cases,
        })
    }

    fn run_case(&self, vu: &VuContext, prepared: &PreparedCase) {
        let started = Instant::now();
        let result = self
            .runtime
            .block_on(self.client.post_json(&prepared.url, prepared.body.clone()));

        match result {
            Ok(response) => {
                vu.record_request(RequestOutcome::from_status(
                    prepared.case.name,
                    response.status,
                    response.latency,
                ));
                vu.check(&prepared.status_check, response.status == 200);
                vu.check(
                    &prepared.content_check,
                    prepared.case.expect.matches(&response.body_text()),
                );
            }
            Err(e) => {
                vu.record_request(RequestOutcome::failure(
                    prepared.case.name,
                    e.to_string(),
                    started.elapsed(),
                ));
                vu.check(&prepared.status_check, false);
                vu.check(&prepared.content_check, false);
            }
        }
    }
}

impl IterationScript for GraphqlSuite {
    fn run_iteration(&self, vu: &VuContext) -> anyhow::Result<()> {
        for prepared in &self.cases {
            self.run_case(vu, prepared);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::control::ControlState;
    use crate::stats::{Collector, ShardedAggregator};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn context() -> (VuContext, Arc<Collector>) {
        let collector = Arc::new(Collector::new(ShardedAggregator::new(1)));
        let ctx = VuContext::new(
            0,
            collector.clone(),
            Arc::new(ControlState::new()),
            Arc::new(AtomicBool::new(true)),
        );
        (ctx, collector)
    }

    /// Answers every connection with `body` and closes it.
    fn fixed_body_server(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 8192];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}/graphql", addr)
    }

    #[test]
    fn test_cases_in_order() {
        let names: Vec<_> = ROLLUPS_CASES.iter().map(|c| c.name).collect();
        assert_eq!(names.len(), 10);
        assert_eq!(names[0], "testVoucherNotFound");
        assert_eq!(names[9], "testGetManyInputs");
        assert_eq!(ROLLUPS_CASES[9].path_suffix, Some(DAPP_ADDRESS));
    }

    #[test]
    fn test_contains_expectation() {
        let expect = Expectation::Contains(r#"{"data":{"voucher":{"index":0}}}"#);
        assert!(expect.matches(r#"{"data":{"voucher":{"index":0}}}"#));
        assert!(!expect.matches(r#"{"data":{"voucher":{"index":1}}}"#));
        assert!(Expectation::Contains("voucher not found")
            .matches(r#"{"errors":[{"message":"voucher not found"}]}"#));
    }

    #[test]
    fn test_many_inputs_expectation() {
        let good = r#"{"data":{"inputs":{"edges":[
            {"node":{"notices":{"edges":[{}]},"reports":{"edges":[{}]},"vouchers":{"edges":[{}]}}},
            {"node":{"notices":{"edges":[{}]},"reports":{"edges":[{}]},"vouchers":{"edges":[{}]}}}
        ]}}}"#;
        assert!(Expectation::OneOutputOfEachPerInput.matches(good));

        let two_notices = r#"{"data":{"inputs":{"edges":[
            {"node":{"notices":{"edges":[{},{}]},"reports":{"edges":[{}]},"vouchers":{"edges":[{}]}}}
        ]}}}"#;
        assert!(!Expectation::OneOutputOfEachPerInput.matches(two_notices));

        let missing_vouchers = r#"{"data":{"inputs":{"edges":[
            {"node":{"notices":{"edges":[{}]},"reports":{"edges":[{}]}}}
        ]}}}"#;
        assert!(!Expectation::OneOutputOfEachPerInput.matches(missing_vouchers));

        assert!(!Expectation::OneOutputOfEachPerInput.matches("not json"));
        assert!(!Expectation::OneOutputOfEachPerInput.matches(r#"{"errors":[]}"#));
        // no inputs at all is vacuously fine
        assert!(Expectation::OneOutputOfEachPerInput.matches(r#"{"data":{"inputs":{"edges":[]}}}"#));
    }

    #[test]
    fn test_prepared_urls_and_bodies() {
        let suite =
            GraphqlSuite::rollups("http://node:8080/graphql/", Duration::from_secs(1), 1).unwrap();
        assert_eq!(suite.cases[0].url, "http://node:8080/graphql");
        assert_eq!(
            suite.cases[9].url,
            format!("http://node:8080/graphql/{}", DAPP_ADDRESS)
        );
        let body: Value = serde_json::from_str(&suite.cases[3].body).unwrap();
        assert_eq!(body["query"], r#"query { input(id: "1") { index }}"#);
        assert_eq!(suite.cases[3].status_check, "testInputFound is status 200");
    }

    #[test]
    fn test_unreachable_endpoint_fails_requests_and_checks() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let suite = GraphqlSuite::rollups(
            &format!("http://{}/graphql", addr),
            Duration::from_secs(2),
            1,
        )
        .unwrap();
        let (ctx, collector) = context();
        suite.run_iteration(&ctx).unwrap();

        let snap = collector.snapshot(Duration::from_secs(1), 1, 1);
        assert_eq!(snap.stats.http.total_requests, 10);
        assert_eq!(snap.stats.failure_rate(), Some(1.0));
        assert_eq!(snap.checks.len(), 20);
        assert!(snap.checks.values().all(|c| c.passes == 0 && c.fails == 1));
    }

    #[test]
    fn test_checks_against_live_server() {
        let url = fixed_body_server(r#"{"data":{"voucher":{"index":0}}}"#);
        let cases = [ROLLUPS_CASES[1], ROLLUPS_CASES[3]];
        let suite = GraphqlSuite::new(&url, &cases, Duration::from_secs(5), 1).unwrap();
        let (ctx, collector) = context();
        suite.run_iteration(&ctx).unwrap();

        let snap = collector.snapshot(Duration::from_secs(1), 1, 1);
        assert_eq!(snap.stats.failure_rate(), Some(0.0));
        assert_eq!(snap.checks["testVoucherFound is status 200"].passes, 1);
        assert_eq!(
            snap.checks["testVoucherFound response body contains expected content"].passes,
            1
        );
        assert_eq!(
            snap.checks["testInputFound response body contains expected content"].fails,
            1
        );
    }
}
