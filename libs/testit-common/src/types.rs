use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A single declarative test, as authored by a student or instructor and as
/// stored in the test bank.
///
/// `name` + `kind` fully determine behaviour. Two specs sharing a `name` are
/// duplicates for admission purposes, whatever their payloads.
///
/// Built with [`TestSpec::from_value`], which never fails.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: TestKind,
    #[serde(flatten)]
    pub bank: BankMetadata,
}

/// Type-specific payload, tagged on the wire by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TestKind {
    /// Issue a request and check status and body.
    #[serde(rename = "curl", alias = "http")]
    Http { test: HttpTest },
    /// Inject a base64-encoded test source, build, and parse the XML report.
    #[serde(rename = "junit", alias = "build-report")]
    BuildReport { content: String },
    /// A spec that could not be understood. Never leaves the process.
    #[serde(skip)]
    Invalid { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTest {
    /// curl command line describing the request
    pub command: String,
    #[serde(rename = "response-type", default)]
    pub response_type: ResponseKind,
    #[serde(rename = "any-order", default)]
    pub any_order: bool,
    pub response: ExpectedResponse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Json,
    #[default]
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Fields the test bank attaches to a spec. Absent on freshly authored specs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankMetadata {
    #[serde(skip_serializing_if = "is_false")]
    pub is_default: bool,
    pub public: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub self_written: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Only meaningful for default tests.
    #[serde(skip_serializing_if = "is_zero")]
    pub score: f64,
    #[serde(rename = "max_score", skip_serializing_if = "is_zero")]
    pub max_score: f64,
}

impl Default for BankMetadata {
    fn default() -> Self {
        Self {
            is_default: false,
            public: true,
            self_written: false,
            created_at: None,
            score: 0.0,
            max_score: 0.0,
        }
    }
}

impl BankMetadata {
    /// Read the bank's fields one at a time. A field that does not parse
    /// keeps its default and is logged; it never touches the test payload.
    pub fn from_value(test: &str, value: &Value) -> Self {
        let defaults = Self::default();
        Self {
            is_default: lenient_field(test, value, "isDefault").unwrap_or(defaults.is_default),
            public: lenient_field(test, value, "public").unwrap_or(defaults.public),
            self_written: lenient_field(test, value, "selfWritten")
                .unwrap_or(defaults.self_written),
            created_at: lenient_field::<Timestamp>(test, value, "createdAt")
                .and_then(Timestamp::into_utc),
            score: lenient_field(test, value, "score").unwrap_or(defaults.score),
            max_score: lenient_field(test, value, "max_score").unwrap_or(defaults.max_score),
        }
    }
}

/// `createdAt` as banks send it: RFC 3339 text or epoch milliseconds.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Timestamp {
    Text(DateTime<Utc>),
    Millis(i64),
}

impl Timestamp {
    fn into_utc(self) -> Option<DateTime<Utc>> {
        match self {
            Timestamp::Text(at) => Some(at),
            Timestamp::Millis(ms) => DateTime::from_timestamp_millis(ms),
        }
    }
}

/// `None` when `key` is absent, null or unparsable (the last with a warning).
fn lenient_field<T: DeserializeOwned>(test: &str, value: &Value, key: &str) -> Option<T> {
    let raw = value.get(key).filter(|v| !v.is_null())?;
    match T::deserialize(raw) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(test, field = key, error = %e, "Ignoring unparsable bank field");
            None
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

impl TestSpec {
    /// Build a spec from an arbitrary JSON value without failing.
    ///
    /// A value that does not describe a known test becomes a [`TestKind::Invalid`]
    /// spec, so one malformed entry fails on its own instead of rejecting the
    /// whole file. `index` names entries that lack a usable `name`. Bank
    /// metadata is read separately and cannot invalidate the payload.
    pub fn from_value(index: usize, value: Value) -> Self {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let label = name
            .clone()
            .unwrap_or_else(|| format!("test #{}", index + 1));
        let description = value
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        let bank = BankMetadata::from_value(&label, &value);

        let kind = match value.get("type").and_then(Value::as_str) {
            None => TestKind::Invalid {
                reason: "Missing test type".to_string(),
            },
            Some(t) if !matches!(t, "curl" | "http" | "junit" | "build-report") => {
                TestKind::Invalid {
                    reason: format!("Unknown test type '{}'", t),
                }
            }
            Some(_) if name.is_none() => TestKind::Invalid {
                reason: format!("Malformed test '{}': missing field `name`", label),
            },
            Some(_) => match TestKind::deserialize(&value) {
                Ok(kind) => kind,
                Err(e) => TestKind::Invalid {
                    reason: format!("Malformed test '{}': {}", label, e),
                },
            },
        };

        TestSpec {
            name: label,
            description,
            kind,
            bank,
        }
    }

    /// Parse a JSON array of specs leniently (see [`TestSpec::from_value`]).
    pub fn parse_list(json: &str) -> serde_json::Result<Vec<TestSpec>> {
        let values: Vec<Value> = serde_json::from_str(json)?;
        Ok(values
            .into_iter()
            .enumerate()
            .map(|(i, v)| TestSpec::from_value(i, v))
            .collect())
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            TestKind::Http { .. } => "curl",
            TestKind::BuildReport { .. } => "junit",
            TestKind::Invalid { .. } => "invalid",
        }
    }
}

/// Serde adapter for spec lists received from the bank.
pub fn deserialize_spec_list<'de, D>(deserializer: D) -> Result<Vec<TestSpec>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values: Vec<Value> = Vec::deserialize(deserializer)?;
    Ok(values
        .into_iter()
        .enumerate()
        .map(|(i, v)| TestSpec::from_value(i, v))
        .collect())
}

/// Outcome of executing one spec, or one case inside a build report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    pub reason: String,
}

impl TestResult {
    pub fn passed(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
        }
    }
}

/// One line of a run report: the case name, its result, and the spec it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEntry {
    pub name: String,
    pub result: TestResult,
    pub spec: TestSpec,
    /// Position of `spec` in the input list; fan-out entries share it.
    pub origin: usize,
}

/// Aggregate of a single execution pass. Built once from its entries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunReport {
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
    pub entries: Vec<RunEntry>,
}

impl RunReport {
    pub fn from_entries(entries: Vec<RunEntry>) -> Self {
        let passed = entries.iter().filter(|e| e.result.success).count();
        Self {
            passed,
            failed: entries.len() - passed,
            total: entries.len(),
            entries,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStatus {
    Passed,
    Failed,
}

impl From<bool> for FeedbackStatus {
    fn from(success: bool) -> Self {
        if success {
            FeedbackStatus::Passed
        } else {
            FeedbackStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Hidden,
    AfterDueDate,
    AfterPublished,
    #[default]
    Visible,
}

/// Where a feedback item's test came from; drives bonus eligibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub public: bool,
    pub self_written: bool,
}

impl From<&BankMetadata> for Provenance {
    fn from(meta: &BankMetadata) -> Self {
        Self {
            is_default: meta.is_default,
            created_at: meta.created_at,
            public: meta.public,
            self_written: meta.self_written,
        }
    }
}

/// Output-facing projection of a test result, in the grading platform's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub name: String,
    pub status: FeedbackStatus,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub max_score: f64,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(rename = "extra_data", default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

/// The on-disk result artifact. Successive phases merge into it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CumulativeReport {
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub tests: Vec<FeedbackItem>,
}

pub const OUTPUT_SEPARATOR: &str = "\n\n";

impl CumulativeReport {
    /// A phase's contribution: score is the sum of its items' scores.
    pub fn contribution(output: String, tests: Vec<FeedbackItem>) -> Self {
        let score = tests.iter().map(|t| t.score).sum();
        Self {
            score,
            output,
            tests,
        }
    }

    /// Append another report: scores add, outputs concatenate, tests extend.
    pub fn absorb(&mut self, other: CumulativeReport) {
        self.score += other.score;
        if self.output.is_empty() {
            self.output = other.output;
        } else if !other.output.is_empty() {
            self.output.push_str(OUTPUT_SEPARATOR);
            self.output.push_str(&other.output);
        }
        self.tests.extend(other.tests);
        if self.tests.is_empty() {
            self.score = 0.0;
        }
    }
}
