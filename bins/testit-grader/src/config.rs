// Grader configuration, filesystem layout and submission metadata
use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testit_common::bank::UploadParams;

/// Bound on `timeToDeadline` in either direction: a century.
const MAX_DEADLINE_LEAD_HOURS: f64 = 876_600.0;

/// Static grading configuration, read once from `config.json`.
///
/// Every threshold the pipeline consults lives here; it is passed to the
/// components that need it rather than held globally.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraderConfig {
    pub num_public_tests_for_access: u32,
    pub max_tests_per_student: u32,
    /// Hours before the due date by which public tests must exist to count.
    pub time_to_deadline: f64,
    pub hook_settle_seconds: f64,
    pub pom_path: String,
    #[serde(rename = "jUnitTestLocation")]
    pub junit_test_location: String,
    pub pass_default_tests_score: f64,
    pub public_tests_score: f64,

    #[serde(default)]
    pub max_num_returned_tests: Option<u32>,
    #[serde(default)]
    pub weight_returned_tests: Option<f64>,
    #[serde(default)]
    pub assignment_title: Option<String>,
    #[serde(default = "default_warmup")]
    pub server_warmup_seconds: f64,
    #[serde(default = "default_stop_grace")]
    pub server_stop_grace_seconds: f64,
    #[serde(default)]
    pub hook_timeout_seconds: Option<f64>,
    #[serde(default = "default_setup_command")]
    pub setup_command: Vec<String>,
    #[serde(default = "default_run_command")]
    pub run_command: Vec<String>,
    #[serde(default = "default_pre_test_script")]
    pub pre_test_script: String,
    #[serde(default = "default_post_test_script")]
    pub post_test_script: String,
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,
    #[serde(default = "default_test_source_extension")]
    pub test_source_extension: String,
    #[serde(default = "default_report_dir")]
    pub report_dir: String,
    #[serde(default = "default_report_prefix")]
    pub report_prefix: String,
}

fn default_warmup() -> f64 {
    5.0
}

fn default_stop_grace() -> f64 {
    10.0
}

fn default_setup_command() -> Vec<String> {
    vec!["bash".to_string(), "setup-server.sh".to_string()]
}

fn default_run_command() -> Vec<String> {
    vec!["bash".to_string(), "run-server.sh".to_string()]
}

fn default_pre_test_script() -> String {
    "pre-test.sh".to_string()
}

fn default_post_test_script() -> String {
    "post-test.sh".to_string()
}

fn default_build_command() -> Vec<String> {
    vec!["mvn".to_string(), "test".to_string(), "-f".to_string()]
}

fn default_test_source_extension() -> String {
    "java".to_string()
}

fn default_report_dir() -> String {
    "target/surefire-reports".to_string()
}

fn default_report_prefix() -> String {
    "TEST-".to_string()
}

impl GraderConfig {
    /// Load and validate the configuration file. A missing required key is fatal.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Grader config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Invalid grader config {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: GraderConfig =
            serde_json::from_str(content).context("Failed to parse grader config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let durations = [
            ("hookSettleSeconds", Some(self.hook_settle_seconds)),
            ("serverWarmupSeconds", Some(self.server_warmup_seconds)),
            ("serverStopGraceSeconds", Some(self.server_stop_grace_seconds)),
            ("hookTimeoutSeconds", self.hook_timeout_seconds),
        ];
        for (key, value) in durations {
            if let Some(v) = value {
                if Duration::try_from_secs_f64(v).is_err() {
                    bail!("'{}' must be a non-negative number of seconds, got {}", key, v);
                }
            }
        }
        if !self.time_to_deadline.is_finite()
            || self.time_to_deadline.abs() > MAX_DEADLINE_LEAD_HOURS
        {
            bail!(
                "'timeToDeadline' must be a number of hours between -{0} and {0}, got {1}",
                MAX_DEADLINE_LEAD_HOURS,
                self.time_to_deadline
            );
        }
        if self.run_command.is_empty() {
            bail!("'runCommand' must not be empty");
        }
        if self.build_command.is_empty() {
            bail!("'buildCommand' must not be empty");
        }
        Ok(())
    }

    pub fn upload_params(&self) -> UploadParams {
        UploadParams {
            num_public_tests_for_access: self.num_public_tests_for_access,
            max_tests_per_student: self.max_tests_per_student,
            max_num_returned_tests: self.max_num_returned_tests,
            weight_returned_tests: self.weight_returned_tests,
        }
    }

    pub fn hook_settle(&self) -> Duration {
        Duration::from_secs_f64(self.hook_settle_seconds)
    }

    pub fn server_warmup(&self) -> Duration {
        Duration::from_secs_f64(self.server_warmup_seconds)
    }

    pub fn server_stop_grace(&self) -> Duration {
        Duration::from_secs_f64(self.server_stop_grace_seconds)
    }

    pub fn hook_timeout(&self) -> Option<Duration> {
        self.hook_timeout_seconds.map(Duration::from_secs_f64)
    }

    /// Lead time before the due date, as a signed chrono duration.
    pub fn deadline_lead(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.time_to_deadline * 3_600_000.0).round() as i64)
    }
}

/// Where everything lives inside the grading container.
#[derive(Debug, Clone)]
pub struct GraderPaths {
    pub root: PathBuf,
    pub config: PathBuf,
    pub student_tests: PathBuf,
    pub default_tests: PathBuf,
    pub sample_target: PathBuf,
    pub submission_target: PathBuf,
    pub metadata: PathBuf,
    pub results: PathBuf,
}

impl GraderPaths {
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let source = root.join("source");
        let sample_target = source.join("sample-server");
        let submission_target = root.join("submission");
        Self {
            config: source.join("test-grader").join("config.json"),
            student_tests: submission_target.join("tests.json"),
            default_tests: sample_target.join("default-tests.json"),
            metadata: root.join("submission_metadata.json"),
            results: root.join("results").join("results.json"),
            sample_target,
            submission_target,
            root,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MetadataUser {
    email: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MetadataAssignment {
    title: String,
    #[serde(default)]
    due_date: Option<DateTime<FixedOffset>>,
}

/// The grading platform's description of the submission being graded.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionMetadata {
    users: Vec<MetadataUser>,
    assignment: MetadataAssignment,
}

impl SubmissionMetadata {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read submission metadata {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse submission metadata")
    }

    pub fn student_id(&self) -> Result<&str> {
        match self.users.first() {
            Some(user) => Ok(&user.email),
            None => bail!("Submission metadata lists no users"),
        }
    }

    /// Assignment key used by the bank: config override first, then metadata title.
    pub fn assignment_title(&self, config: &GraderConfig) -> String {
        let raw = config
            .assignment_title
            .as_deref()
            .unwrap_or(&self.assignment.title);
        sanitize_title(raw)
    }

    pub fn due_date(&self) -> Option<DateTime<Utc>> {
        self.assignment.due_date.map(|d| d.with_timezone(&Utc))
    }
}

/// Lower-case, trim, collapse whitespace runs to `_`, drop anything else
/// that is not a word character or `-`.
pub fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut in_space = false;
    for c in title.trim().to_lowercase().chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        if c.is_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn base_config_json() -> serde_json::Value {
        json!({
            "numPublicTestsForAccess": 2,
            "maxTestsPerStudent": 10,
            "timeToDeadline": 24,
            "hookSettleSeconds": 0,
            "pomPath": "pom.xml",
            "jUnitTestLocation": "src/test/java",
            "passDefaultTestsScore": 5,
            "publicTestsScore": 3
        })
    }

    #[test]
    fn test_load_defaults() {
        let config = GraderConfig::from_json(&base_config_json().to_string()).unwrap();

        assert_eq!(config.num_public_tests_for_access, 2);
        assert_eq!(config.server_warmup(), Duration::from_secs(5));
        assert_eq!(config.run_command, vec!["bash", "run-server.sh"]);
        assert_eq!(config.report_dir, "target/surefire-reports");
        assert_eq!(config.hook_timeout(), None);
        assert_eq!(config.deadline_lead(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_missing_required_key_is_fatal() {
        for key in ["numPublicTestsForAccess", "timeToDeadline", "hookSettleSeconds", "publicTestsScore"] {
            let mut value = base_config_json();
            value.as_object_mut().unwrap().remove(key);

            let err = GraderConfig::from_json(&value.to_string()).unwrap_err();
            assert!(
                format!("{:#}", err).contains(key),
                "error for {} should name the key: {:#}",
                key,
                err
            );
        }
    }

    #[test]
    fn test_negative_duration_rejected() {
        let mut value = base_config_json();
        value["serverWarmupSeconds"] = json!(-1);
        assert!(GraderConfig::from_json(&value.to_string()).is_err());
    }

    #[test]
    fn test_out_of_range_deadline_lead_rejected() {
        for hours in [-1e300, 1e18, -876_601.0] {
            let mut value = base_config_json();
            value["timeToDeadline"] = json!(hours);
            let err = GraderConfig::from_json(&value.to_string()).unwrap_err();
            assert!(err.to_string().contains("timeToDeadline"), "{:#}", err);
        }

        let mut value = base_config_json();
        value["timeToDeadline"] = json!(-876_600.0);
        let config = GraderConfig::from_json(&value.to_string()).unwrap();
        assert_eq!(config.deadline_lead(), -chrono::Duration::hours(876_600));
    }

    #[test]
    fn test_huge_duration_rejected() {
        let mut value = base_config_json();
        value["hookTimeoutSeconds"] = json!(1e300);
        assert!(GraderConfig::from_json(&value.to_string()).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = GraderConfig::load(&dir.path().join("config.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_upload_params_forwarded() {
        let mut value = base_config_json();
        value["maxNumReturnedTests"] = json!(7);
        let config = GraderConfig::from_json(&value.to_string()).unwrap();
        let params = config.upload_params();
        assert_eq!(params.max_tests_per_student, 10);
        assert_eq!(params.max_num_returned_tests, Some(7));
        assert_eq!(params.weight_returned_tests, None);
    }

    #[test]
    fn test_paths_layout() {
        let paths = GraderPaths::from_root("/autograder");
        assert_eq!(paths.config, Path::new("/autograder/source/test-grader/config.json"));
        assert_eq!(paths.student_tests, Path::new("/autograder/submission/tests.json"));
        assert_eq!(
            paths.default_tests,
            Path::new("/autograder/source/sample-server/default-tests.json")
        );
        assert_eq!(paths.results, Path::new("/autograder/results/results.json"));
    }

    #[test]
    fn test_sanitize_title() {
        assert_eq!(sanitize_title("  HW 3:  REST  API! "), "hw_3_rest_api");
        assert_eq!(sanitize_title("Project-2_final"), "project-2_final");
    }

    #[test]
    fn test_metadata() {
        let metadata: SubmissionMetadata = serde_json::from_value(json!({
            "users": [{ "email": "s@uni.edu", "name": "S" }],
            "assignment": { "title": "HW 1", "due_date": "2024-03-07T23:59:00.000000-08:00" }
        }))
        .unwrap();
        let config = GraderConfig::from_json(&base_config_json().to_string()).unwrap();

        assert_eq!(metadata.student_id().unwrap(), "s@uni.edu");
        assert_eq!(metadata.assignment_title(&config), "hw_1");
        assert_eq!(
            metadata.due_date().unwrap().to_rfc3339(),
            "2024-03-08T07:59:00+00:00"
        );

        let mut overridden = config.clone();
        overridden.assignment_title = Some("Override Me".into());
        assert_eq!(metadata.assignment_title(&overridden), "override_me");
    }
}
