// Test runner: dispatch each spec to its executor, collect a run report

use crate::config::GraderConfig;
use crate::executor::build_report::BuildReportExecutor;
use crate::executor::http::run_http_test;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use testit_common::types::{RunEntry, RunReport, TestKind, TestResult, TestSpec};
use tracing::{debug, error, info};

pub struct TestRunner<'a> {
    config: &'a GraderConfig,
    target: &'a Path,
}

impl<'a> TestRunner<'a> {
    pub fn new(config: &'a GraderConfig, target: &'a Path) -> Self {
        Self { config, target }
    }

    /// Run every spec in order against the target.
    ///
    /// Build-report fan-out lands contiguously where its spec was. A fault
    /// inside one executor becomes a failing entry for that spec only.
    pub async fn run(&self, specs: &[TestSpec]) -> RunReport {
        info!(target = %self.target.display(), specs = specs.len(), "Running tests");
        let mut entries = Vec::with_capacity(specs.len());

        for (origin, spec) in specs.iter().enumerate() {
            let outcomes = match AssertUnwindSafe(self.run_one(spec)).catch_unwind().await {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    error!(test = %spec.name, "Executor panicked");
                    vec![(
                        spec.name.clone(),
                        TestResult::failed(format!(
                            "Error executing test '{}':\ninternal error",
                            spec.name
                        )),
                    )]
                }
            };

            for (name, result) in outcomes {
                debug!(test = %name, success = result.success, "Test finished");
                entries.push(RunEntry {
                    name,
                    result,
                    spec: spec.clone(),
                    origin,
                });
            }
        }

        let report = RunReport::from_entries(entries);
        info!(
            passed = report.passed,
            failed = report.failed,
            total = report.total,
            "Run complete"
        );
        report
    }

    async fn run_one(&self, spec: &TestSpec) -> Vec<(String, TestResult)> {
        match &spec.kind {
            TestKind::Http { test } => vec![(spec.name.clone(), run_http_test(&spec.name, test).await)],
            TestKind::BuildReport { content } => {
                BuildReportExecutor::new(self.config, self.target)
                    .run(&spec.name, content)
                    .await
            }
            TestKind::Invalid { reason } => vec![(spec.name.clone(), TestResult::failed(reason.clone()))],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::config_with;
    use serde_json::json;

    fn curl_spec(name: &str, body: &str, status: u16, expected: &str) -> serde_json::Value {
        let script = format!("printf '%s\\n%s' '{}' '{}'", body, status);
        json!({
            "name": name,
            "type": "curl",
            "test": {
                "command": shell_words::join(["sh", "-c", script.as_str(), "sh"]),
                "response-type": "text",
                "response": { "status": 200, "body": expected }
            }
        })
    }

    #[tokio::test]
    async fn test_run_keeps_order_and_isolates_invalid_specs() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(json!({}));
        let specs = TestSpec::parse_list(
            &json!([
                curl_spec("first", "ok", 200, "ok"),
                { "name": "weird", "type": "graphql" },
                curl_spec("third", "nope", 200, "ok"),
            ])
            .to_string(),
        )
        .unwrap();

        let report = TestRunner::new(&config, dir.path()).run(&specs).await;

        assert_eq!((report.total, report.passed, report.failed), (3, 1, 2));
        let names: Vec<_> = report.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["first", "weird", "third"]);
        assert_eq!(report.entries[1].result.reason, "Unknown test type 'graphql'");
        assert_eq!(
            report.entries.iter().map(|e| e.origin).collect::<Vec<_>>(),
            [0, 1, 2]
        );
    }

    #[tokio::test]
    async fn test_build_report_fan_out_is_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let report_xml = r#"<testsuite>
  <testcase name="a" classname="T"/>
  <testcase name="b" classname="T"><failure message="boom">expected 1 but was 2</failure></testcase>
  <testcase name="c" classname="T"/>
</testsuite>"#;
        std::fs::write(dir.path().join("fixture.xml"), report_xml).unwrap();
        let config = config_with(json!({
            "buildCommand": ["sh", "-c", "mkdir -p reports && cp fixture.xml reports/TEST-Suite.xml", "sh"],
            "reportDir": "reports"
        }));

        let specs = TestSpec::parse_list(
            &json!([
                curl_spec("before", "x", 200, "x"),
                { "name": "Suite", "type": "junit", "content": "Y2xhc3MgU3VpdGUge30=" },
                curl_spec("after", "x", 200, "x"),
            ])
            .to_string(),
        )
        .unwrap();

        let report = TestRunner::new(&config, dir.path()).run(&specs).await;

        let names: Vec<_> = report.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["before", "T.a", "T.b", "T.c", "after"]);
        assert_eq!((report.total, report.passed, report.failed), (5, 4, 1));
        assert!(report.entries[2].result.reason.contains("expected 1 but was 2"));
        assert!(report.entries[1..4].iter().all(|e| e.origin == 1 && e.spec.name == "Suite"));
    }

    #[tokio::test]
    async fn test_empty_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(json!({}));
        let report = TestRunner::new(&config, dir.path()).run(&[]).await;
        assert_eq!(report.total, 0);
        assert!(report.all_passed());
    }
}
