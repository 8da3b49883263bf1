//! Test bank client.
//!
//! The test bank is the shared service holding every admitted test for an
//! assignment. This module owns its HTTP contract (routes, query shape, wire
//! types) so the grader and any tooling never drift from it, plus the
//! dedup-before-upload policy.
//!
//! Every call is a single request. A non-2xx status or an explicit
//! `success: false` is returned as a [`BankError`]; nothing is retried.

use crate::types::{deserialize_spec_list, TestSpec};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};

pub const HEALTH_ROUTE: &str = "/health";
pub const SUBMIT_TESTS_ROUTE: &str = "/submit-tests";
pub const SUBMIT_RESULTS_ROUTE: &str = "/submit-results";

/// Student id used when the instructor uploads the default tests.
pub const INSTRUCTOR_ID: &str = "-1";

#[derive(Debug, Error)]
pub enum BankError {
    #[error("request to test bank failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("test bank responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("test bank rejected the upload")]
    Rejected,
    #[error("malformed test bank response: {0}")]
    Malformed(String),
}

/// Engine configuration forwarded to the bank as query parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
    pub num_public_tests_for_access: u32,
    pub max_tests_per_student: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_num_returned_tests: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_returned_tests: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTestsResponse {
    success: bool,
    #[serde(default)]
    failed_to_add: Vec<AdmissionFailure>,
    #[serde(default, deserialize_with = "deserialize_spec_list")]
    tests: Vec<TestSpec>,
}

/// What came back from an upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    /// Uploaded specs the bank did not list as failures.
    pub admitted: Vec<TestSpec>,
    pub failed_to_add: Vec<AdmissionFailure>,
}

/// Pass/fail line sent back to the bank after a submission run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub name: String,
    pub passed: bool,
}

/// Keep the first spec for each name, preserving order.
pub fn dedup_by_name(specs: impl IntoIterator<Item = TestSpec>) -> Vec<TestSpec> {
    let mut seen = HashSet::new();
    specs
        .into_iter()
        .filter(|spec| seen.insert(spec.name.clone()))
        .collect()
}

/// Operations the grading pipeline needs from the test bank.
#[async_trait]
pub trait TestBank: Send + Sync {
    /// `true` only for a 200 response; transport errors count as unhealthy.
    async fn is_healthy(&self) -> bool;

    /// Upload specs for admission. Callers pass a list already deduplicated by name.
    async fn upload_tests(
        &self,
        assignment: &str,
        student_id: &str,
        tests: &[TestSpec],
        params: &UploadParams,
    ) -> Result<UploadOutcome, BankError>;

    /// The authoritative, deduplicated test set for the assignment.
    async fn fetch_all_tests(
        &self,
        assignment: &str,
        student_id: &str,
        params: &UploadParams,
    ) -> Result<Vec<TestSpec>, BankError>;

    async fn submit_results(
        &self,
        assignment: &str,
        student_id: &str,
        results: &[ResultSummary],
    ) -> Result<(), BankError>;
}

/// reqwest-backed [`TestBank`].
#[derive(Debug, Clone)]
pub struct TestBankClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

/// The bank keys students by an opaque id; it is base64 so it is not sent in plaintext.
pub fn encode_student_id(student_id: &str) -> String {
    general_purpose::STANDARD.encode(student_id.as_bytes())
}

impl TestBankClient {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.auth_token {
            Some(token) => builder.header(reqwest::header::AUTHORIZATION, token),
            None => builder,
        }
    }

    async fn post_tests(
        &self,
        assignment: &str,
        student_id: &str,
        tests: &[TestSpec],
        params: &UploadParams,
    ) -> Result<SubmitTestsResponse, BankError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("{}/{}", SUBMIT_TESTS_ROUTE, assignment),
            )
            .query(&[("id", encode_student_id(student_id))])
            .query(params)
            .json(tests)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BankError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SubmitTestsResponse =
            serde_json::from_str(&body).map_err(|e| BankError::Malformed(e.to_string()))?;
        if !parsed.success {
            return Err(BankError::Rejected);
        }
        Ok(parsed)
    }
}

#[async_trait]
impl TestBank for TestBankClient {
    async fn is_healthy(&self) -> bool {
        match self.request(reqwest::Method::GET, HEALTH_ROUTE).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                warn!(error = %e, "Test bank health probe failed");
                false
            }
        }
    }

    async fn upload_tests(
        &self,
        assignment: &str,
        student_id: &str,
        tests: &[TestSpec],
        params: &UploadParams,
    ) -> Result<UploadOutcome, BankError> {
        let unique = dedup_by_name(tests.iter().cloned());
        if unique.len() != tests.len() {
            warn!(
                dropped = tests.len() - unique.len(),
                "Duplicate test names in upload; keeping first occurrence"
            );
        }

        debug!(assignment, count = unique.len(), "Uploading tests");
        let response = self.post_tests(assignment, student_id, &unique, params).await?;

        let rejected: HashSet<&str> = response
            .failed_to_add
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        let admitted = unique
            .iter()
            .filter(|spec| !rejected.contains(spec.name.as_str()))
            .cloned()
            .collect();

        Ok(UploadOutcome {
            admitted,
            failed_to_add: response.failed_to_add,
        })
    }

    async fn fetch_all_tests(
        &self,
        assignment: &str,
        student_id: &str,
        params: &UploadParams,
    ) -> Result<Vec<TestSpec>, BankError> {
        // An empty submission admits nothing and returns the visible set.
        let response = self.post_tests(assignment, student_id, &[], params).await?;
        Ok(dedup_by_name(response.tests))
    }

    async fn submit_results(
        &self,
        assignment: &str,
        student_id: &str,
        results: &[ResultSummary],
    ) -> Result<(), BankError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("{}/{}", SUBMIT_RESULTS_ROUTE, assignment),
            )
            .query(&[("id", encode_student_id(student_id))])
            .json(results)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BankError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
