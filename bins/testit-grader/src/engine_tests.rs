/// Integration tests for the grading pipeline
///
/// These drive `Pipeline` end to end against real processes:
/// 1. The sample and submission "servers" are `sh -c "sleep 300"`
/// 2. HTTP specs use `sh` in place of curl, printing a canned body and status
/// 3. Hooks are real bash scripts dropped into the target directories
/// 4. The test bank is an in-memory fake that records every call
/// 5. Every run writes a real results artifact in a temp directory

#[cfg(test)]
mod pipeline_tests {
    use crate::config::GraderPaths;
    use crate::engine::tests::{config_with, wait_dead};
    use crate::pipeline::{GradeContext, Phase, Pipeline, PipelineStatus};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::{json, Value};
    use std::fs;
    use std::sync::Mutex;
    use testit_common::bank::{
        AdmissionFailure, BankError, ResultSummary, TestBank, UploadOutcome, UploadParams,
    };
    use testit_common::types::{CumulativeReport, FeedbackStatus, TestSpec};

    /// In-memory test bank.
    #[derive(Default)]
    struct FakeBank {
        unhealthy: bool,
        reject_upload: bool,
        failed_to_add: Vec<AdmissionFailure>,
        /// What `fetch_all_tests` returns.
        bank_tests: Vec<TestSpec>,
        calls: Mutex<Vec<String>>,
        uploads: Mutex<Vec<(String, Vec<TestSpec>)>>,
        results: Mutex<Vec<ResultSummary>>,
    }

    impl FakeBank {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    #[async_trait]
    impl TestBank for FakeBank {
        async fn is_healthy(&self) -> bool {
            self.record("health");
            !self.unhealthy
        }

        async fn upload_tests(
            &self,
            _assignment: &str,
            student_id: &str,
            tests: &[TestSpec],
            _params: &UploadParams,
        ) -> Result<UploadOutcome, BankError> {
            self.record("upload");
            self.uploads
                .lock()
                .unwrap()
                .push((student_id.to_string(), tests.to_vec()));
            if self.reject_upload {
                return Err(BankError::Rejected);
            }
            let admitted = tests
                .iter()
                .filter(|t| !self.failed_to_add.iter().any(|f| f.name == t.name))
                .cloned()
                .collect();
            Ok(UploadOutcome {
                admitted,
                failed_to_add: self.failed_to_add.clone(),
            })
        }

        async fn fetch_all_tests(
            &self,
            _assignment: &str,
            _student_id: &str,
            _params: &UploadParams,
        ) -> Result<Vec<TestSpec>, BankError> {
            self.record("fetch");
            Ok(self.bank_tests.clone())
        }

        async fn submit_results(
            &self,
            _assignment: &str,
            _student_id: &str,
            results: &[ResultSummary],
        ) -> Result<(), BankError> {
            self.record("submit-results");
            self.results.lock().unwrap().extend_from_slice(results);
            Ok(())
        }
    }

    /// A curl-shaped spec whose fake request always returns `ok` with 200.
    /// It passes iff `expected` is `ok`.
    fn curl_spec(name: &str, expected: &str) -> Value {
        json!({
            "name": name,
            "type": "curl",
            "test": {
                "command": shell_words::join(["sh", "-c", "printf 'ok\\n200'", "sh"]),
                "response-type": "text",
                "response": { "status": 200, "body": expected }
            }
        })
    }

    fn with_bank_fields(mut spec: Value, fields: Value) -> Value {
        for (k, v) in fields.as_object().unwrap() {
            spec[k] = v.clone();
        }
        spec
    }

    fn specs(values: Value) -> Vec<TestSpec> {
        TestSpec::parse_list(&values.to_string()).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: GraderPaths,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let paths = GraderPaths::from_root(dir.path());
            fs::create_dir_all(&paths.sample_target).unwrap();
            fs::create_dir_all(&paths.submission_target).unwrap();
            Self { _dir: dir, paths }
        }

        fn student_tests(&self, tests: Value) {
            fs::write(&self.paths.student_tests, tests.to_string()).unwrap();
        }

        fn default_tests(&self, tests: Value) {
            fs::write(&self.paths.default_tests, tests.to_string()).unwrap();
        }

        fn submission_hook(&self, file: &str, script: &str) {
            fs::write(self.paths.submission_target.join(file), script).unwrap();
        }

        fn artifact(&self) -> CumulativeReport {
            serde_json::from_str(&fs::read_to_string(&self.paths.results).unwrap()).unwrap()
        }
    }

    fn test_config(overrides: Value) -> crate::config::GraderConfig {
        let mut base = json!({
            "runCommand": ["sh", "-c", "sleep 300"],
            "setupCommand": ["true"],
            "serverWarmupSeconds": 0,
            "serverStopGraceSeconds": 2
        });
        for (k, v) in overrides.as_object().unwrap() {
            base[k] = v.clone();
        }
        config_with(base)
    }

    fn due() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 8, 8, 0, 0).unwrap()
    }

    fn ctx() -> GradeContext {
        GradeContext {
            assignment: "hw_1".into(),
            student_id: "s@uni.edu".into(),
            due_date: Some(due()),
        }
    }

    /// Test: An unhealthy bank stops the run after sample validation
    #[tokio::test]
    async fn test_health_abort_persists_only_sample_feedback() {
        let fixture = Fixture::new();
        fixture.student_tests(json!([curl_spec("good", "ok"), curl_spec("bad", "nope")]));
        fixture.submission_hook("pre-test.sh", "touch ran-pre-hook\n");
        let config = test_config(json!({}));
        let bank = FakeBank {
            unhealthy: true,
            ..Default::default()
        };

        let outcome = Pipeline::new(&config, &fixture.paths, &bank)
            .grade(&ctx())
            .await
            .unwrap();

        match &outcome.status {
            PipelineStatus::Aborted { phase, .. } => assert_eq!(*phase, Phase::HealthGate),
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(bank.calls(), ["health"]);
        assert!(!fixture.paths.submission_target.join("ran-pre-hook").exists());

        let artifact = fixture.artifact();
        let names: Vec<_> = artifact.tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            ["SAMPLE SOLUTION RESULT: good", "SAMPLE SOLUTION RESULT: bad"]
        );
        assert_eq!(artifact.tests[0].status, FeedbackStatus::Passed);
        assert_eq!(artifact.tests[1].status, FeedbackStatus::Failed);
        assert_eq!(artifact.score, 0.0);
        assert!(artifact.output.starts_with("Server is not running or not healthy."));
        assert!(artifact.output.contains("Some test cases did not pass sample implementation."));
    }

    /// Test: Full run with hooks, bank tests and both bonus items
    #[tokio::test]
    async fn test_full_grade_with_bonus_items() {
        let fixture = Fixture::new();
        fixture.submission_hook("pre-test.sh", "touch ran-pre-hook\nsleep 300 &\necho $! > daemon.pid\n");
        fixture.submission_hook("post-test.sh", "touch ran-post-hook\n");
        let config = test_config(json!({}));

        let early = "2024-03-01T00:00:00Z";
        let bank = FakeBank {
            bank_tests: specs(json!([
                with_bank_fields(curl_spec("default", "ok"), json!({
                    "isDefault": true, "score": 2, "max_score": 2
                })),
                with_bank_fields(curl_spec("mine-1", "ok"), json!({
                    "selfWritten": true, "createdAt": early
                })),
                with_bank_fields(curl_spec("mine-2", "ok"), json!({
                    "selfWritten": true, "createdAt": early
                })),
            ])),
            ..Default::default()
        };

        let outcome = Pipeline::new(&config, &fixture.paths, &bank)
            .grade(&ctx())
            .await
            .unwrap();

        assert_eq!(outcome.status, PipelineStatus::Completed);
        assert_eq!(bank.calls(), ["health", "upload", "fetch", "submit-results"]);
        assert!(fixture.paths.submission_target.join("ran-pre-hook").exists());
        assert!(fixture.paths.submission_target.join("ran-post-hook").exists());

        let pid: i32 = fs::read_to_string(fixture.paths.submission_target.join("daemon.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(wait_dead(pid).await, "pre-hook daemon should be reaped");

        let artifact = fixture.artifact();
        let names: Vec<_> = artifact.tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "default",
                "mine-1",
                "mine-2",
                "Passed all default tests",
                "Submitted at least 2 public tests before the deadline",
            ]
        );
        assert_eq!(artifact.score, 10.0);
        assert!(artifact.output.starts_with("No tests were uploaded."));
        assert!(artifact.output.contains("All available test cases passed your implementation!"));
        assert!(artifact.tests[1].provenance.as_ref().unwrap().self_written);

        let results = bank.results.lock().unwrap().clone();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.passed));
    }

    /// Test: Bank admission failures are listed but do not stop the run
    #[tokio::test]
    async fn test_failed_to_add_reported_and_upload_deduplicated() {
        let fixture = Fixture::new();
        fixture.student_tests(json!([
            curl_spec("a", "ok"),
            curl_spec("a", "ok"),
            curl_spec("b", "ok"),
        ]));
        let config = test_config(json!({}));
        let bank = FakeBank {
            failed_to_add: vec![AdmissionFailure {
                name: "a".into(),
                reason: "Test name already exists".into(),
            }],
            ..Default::default()
        };

        let outcome = Pipeline::new(&config, &fixture.paths, &bank)
            .grade(&ctx())
            .await
            .unwrap();
        assert_eq!(outcome.status, PipelineStatus::Completed);

        let uploads = bank.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "s@uni.edu");
        let uploaded: Vec<_> = uploads[0].1.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(uploaded, ["a", "b"]);

        let artifact = fixture.artifact();
        assert!(artifact.output.contains("Failed to upload all tests to the database."));
        assert!(artifact.output.contains("a: \tTest name already exists\n"));
        assert!(!artifact.output.contains("All tests successfully uploaded"));
        assert!(artifact.output.contains("No available tests to run on your implementation."));
    }

    /// Test: A rejected upload aborts before anything runs on the submission
    #[tokio::test]
    async fn test_upload_rejected_aborts() {
        let fixture = Fixture::new();
        fixture.student_tests(json!([curl_spec("a", "ok")]));
        let config = test_config(json!({}));
        let bank = FakeBank {
            reject_upload: true,
            ..Default::default()
        };

        let outcome = Pipeline::new(&config, &fixture.paths, &bank)
            .grade(&ctx())
            .await
            .unwrap();

        match &outcome.status {
            PipelineStatus::Aborted { phase, message } => {
                assert_eq!(*phase, Phase::Upload);
                assert!(message.contains("test bank rejected the upload"));
            }
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(bank.calls(), ["health", "upload"]);
        assert_eq!(fixture.artifact().tests.len(), 1);
    }

    /// Test: A failing pre-hook is fatal for the submission run
    #[tokio::test]
    async fn test_failing_pre_hook_aborts_submission_run() {
        let fixture = Fixture::new();
        fixture.student_tests(json!([curl_spec("a", "ok")]));
        fixture.submission_hook("pre-test.sh", "echo seeding failed >&2\nexit 3\n");
        let config = test_config(json!({}));
        let bank = FakeBank {
            bank_tests: specs(json!([curl_spec("a", "ok")])),
            ..Default::default()
        };

        let outcome = Pipeline::new(&config, &fixture.paths, &bank)
            .grade(&ctx())
            .await
            .unwrap();

        match &outcome.status {
            PipelineStatus::Aborted { phase, message } => {
                assert_eq!(*phase, Phase::SubmissionRun);
                assert!(message.contains("Pre-test hook"));
            }
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(bank.calls(), ["health", "upload", "fetch"]);
        let artifact = fixture.artifact();
        let names: Vec<_> = artifact.tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["SAMPLE SOLUTION RESULT: a"]);
    }

    /// Test: A public test created exactly at the cutoff counts, one second later does not
    #[tokio::test]
    async fn test_deadline_boundary_through_pipeline() {
        let config = test_config(json!({ "numPublicTestsForAccess": 1, "passDefaultTestsScore": 0 }));
        let cutoff = due() - chrono::Duration::hours(24);

        for (created_at, expected) in [
            (cutoff, FeedbackStatus::Passed),
            (cutoff + chrono::Duration::seconds(1), FeedbackStatus::Failed),
        ] {
            let fixture = Fixture::new();
            let bank = FakeBank {
                bank_tests: specs(json!([with_bank_fields(
                    curl_spec("mine", "ok"),
                    json!({ "selfWritten": true, "createdAt": created_at.to_rfc3339() })
                )])),
                ..Default::default()
            };

            Pipeline::new(&config, &fixture.paths, &bank)
                .grade(&ctx())
                .await
                .unwrap();

            let artifact = fixture.artifact();
            let bonus = artifact.tests.last().unwrap();
            assert_eq!(bonus.name, "Submitted at least 1 public tests before the deadline");
            assert_eq!(bonus.status, expected, "created at {}", created_at);
        }
    }

    /// Test: Setup and grading both contribute to one artifact
    #[tokio::test]
    async fn test_setup_then_grade_accumulate() {
        let fixture = Fixture::new();
        fixture.default_tests(json!([curl_spec("baseline", "ok")]));
        let config = test_config(json!({}));
        let bank = FakeBank {
            bank_tests: specs(json!([with_bank_fields(
                curl_spec("baseline", "ok"),
                json!({ "isDefault": true, "score": 4, "max_score": 4 })
            )])),
            ..Default::default()
        };
        let pipeline = Pipeline::new(&config, &fixture.paths, &bank);

        let setup = pipeline.setup("hw_1").await.unwrap();
        assert_eq!(setup.status, PipelineStatus::Completed);
        assert_eq!(setup.report.score, 0.0);
        {
            let uploads = bank.uploads.lock().unwrap();
            assert_eq!(uploads[0].0, "-1");
            assert_eq!(uploads[0].1[0].name, "baseline");
        }

        let graded = pipeline.grade(&ctx()).await.unwrap();
        assert_eq!(graded.status, PipelineStatus::Completed);

        let artifact = fixture.artifact();
        // 4 for the default test, 5 for passing all defaults; 0 of 2 public tests.
        assert_eq!(artifact.score, 9.0);
        assert_eq!(artifact.tests[0].name, "SAMPLE SOLUTION RESULT: baseline");
        assert_eq!(artifact.tests[1].name, "baseline");
        assert!(artifact
            .output
            .starts_with("All uploaded tests passed the sample implementation!\nAll tests successfully uploaded to the database!\n"));
        assert!(artifact.output.contains("\n\nNo tests were uploaded."));
    }

    /// Test: A sample server that cannot be installed aborts setup
    #[tokio::test]
    async fn test_setup_install_failure_aborts() {
        let fixture = Fixture::new();
        fixture.default_tests(json!([curl_spec("baseline", "ok")]));
        let config = test_config(json!({ "setupCommand": ["false"] }));
        let bank = FakeBank::default();

        let outcome = Pipeline::new(&config, &fixture.paths, &bank)
            .setup("hw_1")
            .await
            .unwrap();

        match &outcome.status {
            PipelineStatus::Aborted { phase, message } => {
                assert_eq!(*phase, Phase::SampleValidate);
                assert!(message.contains("Install step failed"));
            }
            other => panic!("expected abort, got {:?}", other),
        }
        assert!(bank.calls().is_empty());
    }
}
