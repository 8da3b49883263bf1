/// Grading Pipeline
///
/// **Responsibility:**
/// Drive one grading invocation from start to the persisted result artifact.
///
/// **Phases (strictly sequential, each gates the next):**
/// 1. Load: read the student's test specs (missing file = none)
/// 2. SampleValidate: run them against the reference target; only passing
///    specs, first per name, are admitted. Mismatches are reported, not fatal
/// 3. HealthGate: probe the test bank
/// 4. Upload: submit the admitted subset
/// 5. SubmissionRun: fetch the full test set and run it against the
///    submission, between the pre- and post-test hooks
/// 6. Score: add the bonus items
/// 7. Persist: report pass/fail to the bank, merge into the artifact
///
/// A fatal error in any phase skips the rest, but the feedback gathered so
/// far is still merged into the artifact along with the error text.
///
/// This module is the glue layer; it knows nothing about:
/// - How processes are managed (engine's job)
/// - How a single test runs (executor's job)
/// - How feedback is scored (evaluator's job)
use crate::config::{GraderConfig, GraderPaths};
use crate::engine::LifecycleManager;
use crate::evaluator;
use crate::report::merge_into;
use crate::runner::TestRunner;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use testit_common::bank::{dedup_by_name, ResultSummary, TestBank, INSTRUCTOR_ID};
use testit_common::types::{CumulativeReport, FeedbackItem, FeedbackStatus, RunReport, TestSpec};
use tracing::{error, info, instrument, warn};

const ALL_SAMPLE_PASSED: &str = "All uploaded tests passed the sample implementation!\n";
const ALL_UPLOADED: &str = "All tests successfully uploaded to the database!\n";
const UPLOAD_FAILURES: &str = "Failed to upload all tests to the database. Make sure test names are unique if you want them to be counted separately! Please see the following reasons:\n\n";
const NOT_ALL_PASSED: &str = "\nNot all available test cases passed your implementation. Please see the following breakdown.\n";
const NOTHING_TO_RUN: &str = "\nNo available tests to run on your implementation. You must have submitted at least one working test at some point to be able to run other students' tests.\n";
const ALL_PASSED: &str = "\nAll available test cases passed your implementation!\n";
const RESULTS_NOT_UPLOADED: &str = "\nError uploading results to the database. Please contact the assignment administrators. You can still see the results of the test cases below, but the updated statistics have not been uploaded.\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Load,
    SampleValidate,
    HealthGate,
    Upload,
    SubmissionRun,
    Score,
    Persist,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Load => "load",
            Phase::SampleValidate => "sample-validate",
            Phase::HealthGate => "health-gate",
            Phase::Upload => "upload",
            Phase::SubmissionRun => "submission-run",
            Phase::Score => "score",
            Phase::Persist => "persist",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStatus {
    Completed,
    Aborted { phase: Phase, message: String },
}

/// The artifact as it stands after this invocation, and how the run ended.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub report: CumulativeReport,
    pub status: PipelineStatus,
}

/// Who is being graded, and against which assignment.
#[derive(Debug, Clone)]
pub struct GradeContext {
    pub assignment: String,
    pub student_id: String,
    pub due_date: Option<DateTime<Utc>>,
}

/// Wording that differs between a student's grading run and instructor setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Grade,
    Setup,
}

impl Mode {
    fn no_tests(self) -> &'static str {
        match self {
            Mode::Grade => "No tests were uploaded. You must have submitted at least one working test at some point to be able to run other students' tests.\n",
            Mode::Setup => "No default tests were uploaded.\n",
        }
    }

    fn sample_mismatch(self) -> &'static str {
        match self {
            Mode::Grade => "Some test cases did not pass sample implementation. If you believe any of these to be a mistake, please contact the assignment administrators. Only test cases that pass this sample may be uploaded. You can find the outcomes of running your tests on THE SAMPLE SOLUTION below.\n",
            Mode::Setup => "Some test cases did not pass sample implementation. Only test cases that pass this sample may be uploaded. You can find the outcomes of running your tests on THE SAMPLE SOLUTION below.\n",
        }
    }

    fn administrators(self) -> &'static str {
        match self {
            Mode::Grade => "assignment",
            Mode::Setup => "database",
        }
    }
}

/// Narrative and feedback gathered so far.
#[derive(Debug, Default)]
struct Progress {
    output: String,
    tests: Vec<FeedbackItem>,
}

/// A target run: the report (empty if tests never ran) and the fatal fault, if any.
struct TargetRun {
    report: RunReport,
    fault: Option<anyhow::Error>,
}

pub struct Pipeline<'a> {
    config: &'a GraderConfig,
    paths: &'a GraderPaths,
    bank: &'a dyn TestBank,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a GraderConfig, paths: &'a GraderPaths, bank: &'a dyn TestBank) -> Self {
        Self {
            config,
            paths,
            bank,
        }
    }

    /// Grade one submission.
    #[instrument(skip(self, ctx), fields(assignment = %ctx.assignment))]
    pub async fn grade(&self, ctx: &GradeContext) -> Result<PipelineOutcome> {
        // Load
        let specs = load_specs(&self.paths.student_tests);
        info!(phase = %Phase::Load, specs = specs.len(), "Student tests loaded");

        // SampleValidate
        let mut progress = Progress::default();
        let admitted = match self
            .validate_on_sample(Mode::Grade, &specs, false, &mut progress)
            .await
        {
            Ok(admitted) => admitted,
            Err(e) => {
                let headline = format!(
                    "Could not run your tests on THE SAMPLE SOLUTION: {:#}. Please contact the assignment administrators.",
                    e
                );
                return self.abort(Phase::SampleValidate, headline, progress);
            }
        };

        // HealthGate + Upload
        if let Err((phase, headline)) = self
            .upload(Mode::Grade, &ctx.assignment, &ctx.student_id, admitted, &mut progress)
            .await
        {
            return self.abort(phase, headline, progress);
        }

        // SubmissionRun
        let params = self.config.upload_params();
        let all_tests = match self
            .bank
            .fetch_all_tests(&ctx.assignment, &ctx.student_id, &params)
            .await
        {
            Ok(tests) => tests,
            Err(e) => {
                let headline = format!(
                    "Error fetching tests from the database: {}. Please contact the assignment administrators.",
                    e
                );
                return self.abort(Phase::SubmissionRun, headline, progress);
            }
        };
        info!(phase = %Phase::SubmissionRun, tests = all_tests.len(), "Running bank tests on submission");

        let run = self
            .run_target(&self.paths.submission_target, true, &all_tests)
            .await;
        progress.tests.extend(evaluator::submission_feedback(&run.report));
        if let Some(e) = run.fault {
            let headline = format!("Could not run the tests on your implementation: {:#}", e);
            return self.abort(Phase::SubmissionRun, headline, progress);
        }

        let report = run.report;
        if report.failed > 0 {
            progress.output.push_str(NOT_ALL_PASSED);
        } else if report.total == 0 {
            progress.output.push_str(NOTHING_TO_RUN);
        } else {
            progress.output.push_str(ALL_PASSED);
        }

        // Score
        let bonus = evaluator::bonus_items(self.config, &report, &all_tests, ctx.due_date);
        info!(phase = %Phase::Score, items = bonus.len(), "Bonus items scored");
        progress.tests.extend(bonus);

        // Persist
        let summary: Vec<ResultSummary> = report
            .entries
            .iter()
            .map(|e| ResultSummary {
                name: e.name.clone(),
                passed: e.result.success,
            })
            .collect();
        if let Err(e) = self
            .bank
            .submit_results(&ctx.assignment, &ctx.student_id, &summary)
            .await
        {
            warn!(phase = %Phase::Persist, error = %e, "Failed to upload results");
            progress.output.push_str(RESULTS_NOT_UPLOADED);
        }

        let report = merge_into(
            &self.paths.results,
            CumulativeReport::contribution(progress.output, progress.tests),
        )?;
        info!(score = report.score, "Grading complete");
        Ok(PipelineOutcome {
            report,
            status: PipelineStatus::Completed,
        })
    }

    /// Validate the instructor's default tests and upload them as the baseline.
    #[instrument(skip(self))]
    pub async fn setup(&self, assignment: &str) -> Result<PipelineOutcome> {
        let specs = load_specs(&self.paths.default_tests);
        info!(phase = %Phase::Load, specs = specs.len(), "Default tests loaded");

        let mut progress = Progress::default();
        let admitted = match self
            .validate_on_sample(Mode::Setup, &specs, true, &mut progress)
            .await
        {
            Ok(admitted) => admitted,
            Err(e) => {
                let headline = format!("Could not run the default tests on THE SAMPLE SOLUTION: {:#}", e);
                println!("{}\n{}\n{}", headline, progress.output, summarize(&progress.tests));
                return self.abort(Phase::SampleValidate, headline, progress);
            }
        };

        if let Err((phase, headline)) = self
            .upload(Mode::Setup, assignment, INSTRUCTOR_ID, admitted, &mut progress)
            .await
        {
            println!("{}\n{}\n{}", headline, progress.output, summarize(&progress.tests));
            return self.abort(phase, headline, progress);
        }

        println!("{}", progress.output);
        println!("{}", summarize(&progress.tests));

        let report = merge_into(
            &self.paths.results,
            CumulativeReport::contribution(progress.output, progress.tests),
        )?;
        Ok(PipelineOutcome {
            report,
            status: PipelineStatus::Completed,
        })
    }

    /// Run `specs` against the reference target and return the admitted subset.
    ///
    /// Feedback and narrative are recorded in `progress` even when this fails.
    async fn validate_on_sample(
        &self,
        mode: Mode,
        specs: &[TestSpec],
        install_first: bool,
        progress: &mut Progress,
    ) -> Result<Vec<TestSpec>> {
        if specs.is_empty() {
            progress.output.push_str(mode.no_tests());
            return Ok(Vec::new());
        }

        let run = self
            .run_target(&self.paths.sample_target, install_first, specs)
            .await;
        progress.tests.extend(evaluator::sample_feedback(&run.report));
        if let Some(e) = run.fault {
            return Err(e);
        }

        if run.report.all_passed() {
            progress.output.push_str(ALL_SAMPLE_PASSED);
        } else {
            progress.output.push_str(mode.sample_mismatch());
        }

        let admitted = evaluator::admitted_subset(&run.report);
        info!(
            phase = %Phase::SampleValidate,
            passed = run.report.passed,
            total = run.report.total,
            admitted = admitted.len(),
            "Sample validation finished"
        );
        Ok(admitted)
    }

    /// HealthGate then Upload. On failure returns the phase and a headline.
    async fn upload(
        &self,
        mode: Mode,
        assignment: &str,
        student_id: &str,
        admitted: Vec<TestSpec>,
        progress: &mut Progress,
    ) -> std::result::Result<(), (Phase, String)> {
        if !self.bank.is_healthy().await {
            return Err((
                Phase::HealthGate,
                format!(
                    "Server is not running or not healthy. Please contact the {} administrators. In the meantime, here are the outcomes of running your tests on THE SAMPLE SOLUTION.",
                    mode.administrators()
                ),
            ));
        }

        let admitted = dedup_by_name(admitted);
        let outcome = self
            .bank
            .upload_tests(assignment, student_id, &admitted, &self.config.upload_params())
            .await
            .map_err(|e| {
                (
                    Phase::Upload,
                    format!(
                        "Error uploading tests to the database: {}. Please contact the {} administrators. In the meantime, here are the outcomes of running your tests on THE SAMPLE SOLUTION.",
                        e,
                        mode.administrators()
                    ),
                )
            })?;

        if !outcome.failed_to_add.is_empty() {
            progress.output.push_str(UPLOAD_FAILURES);
            for failure in &outcome.failed_to_add {
                progress
                    .output
                    .push_str(&format!("{}: \t{}\n", failure.name, failure.reason));
            }
            progress.output.push('\n');
        } else if !admitted.is_empty() {
            progress.output.push_str(ALL_UPLOADED);
        }
        info!(
            phase = %Phase::Upload,
            admitted = outcome.admitted.len(),
            rejected = outcome.failed_to_add.len(),
            "Tests uploaded"
        );
        Ok(())
    }

    /// pre-hook → start → run → stop → post-hook against one target.
    async fn run_target(&self, target: &Path, install_first: bool, specs: &[TestSpec]) -> TargetRun {
        let lifecycle = LifecycleManager::new(self.config);

        let pre_group = match lifecycle.run_pre_hook(target).await {
            Ok(group) => group,
            Err(e) => {
                return TargetRun {
                    report: RunReport::default(),
                    fault: Some(e),
                }
            }
        };

        let server = match lifecycle.start(target, install_first).await {
            Ok(server) => server,
            Err(e) => {
                let post = lifecycle.run_post_hook(pre_group, target).await;
                if let Err(hook_error) = post.hook {
                    warn!(error = %format!("{:#}", hook_error), "Post-test hook failed after server start failure");
                }
                return TargetRun {
                    report: RunReport::default(),
                    fault: Some(e),
                };
            }
        };

        let report = TestRunner::new(self.config, target).run(specs).await;

        if let Err(e) = lifecycle.stop(server).await {
            warn!(error = %format!("{:#}", e), "Failed to stop server cleanly");
        }

        let post = lifecycle.run_post_hook(pre_group, target).await;
        if !post.cleanup.is_clean() {
            warn!(failures = post.cleanup.failures.len(), "Leftover process groups could not be reaped");
        }
        TargetRun {
            report,
            fault: post.hook.err(),
        }
    }

    fn abort(&self, phase: Phase, headline: String, progress: Progress) -> Result<PipelineOutcome> {
        error!(%phase, "{}", headline);
        let output = format!("{}\n{}", headline, progress.output);
        let report = merge_into(
            &self.paths.results,
            CumulativeReport::contribution(output, progress.tests),
        )?;
        Ok(PipelineOutcome {
            report,
            status: PipelineStatus::Aborted {
                phase,
                message: headline,
            },
        })
    }
}

/// Read a spec list. A missing or unreadable file means no tests.
pub fn load_specs(path: &Path) -> Vec<TestSpec> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read tests");
            return Vec::new();
        }
    };
    match TestSpec::parse_list(&content) {
        Ok(specs) => specs,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Tests file is not a JSON list");
            Vec::new()
        }
    }
}

/// Plain-text listing for the setup console.
fn summarize(items: &[FeedbackItem]) -> String {
    let mut out = String::new();
    for item in items {
        let status = match item.status {
            FeedbackStatus::Passed => "Passed",
            FeedbackStatus::Failed => "Failed",
        };
        out.push_str(&format!("{}: {}\n{}\n\n", item.name, status, item.output));
    }
    out
}
