/// HTTP executor
///
/// Runs the spec's curl command with a status-code trailer appended
/// (`-w "\n%{http_code}"`), splits the trailer back off, then checks status
/// and body. Every failure, including ones in running the command at all,
/// comes back as a failing [`TestResult`] whose reason names the test.
use crate::comparator;
use anyhow::{bail, Context, Result};
use serde_json::Value;
use testit_common::types::{HttpTest, ResponseKind, TestResult};
use tokio::process::Command;
use tracing::debug;

/// Appended to every command so the status code lands on the last line of stdout.
const STATUS_TRAILER: [&str; 2] = ["-w", "\n%{http_code}"];

/// What the request produced.
#[derive(Debug)]
struct Response {
    status: u16,
    body: String,
}

/// Run one HTTP spec.
pub async fn run_http_test(name: &str, test: &HttpTest) -> TestResult {
    let response = match issue(&test.command).await {
        Ok(Ok(response)) => response,
        Ok(Err(stderr)) => {
            return TestResult::failed(format!("Error executing test '{}':\n{}", name, stderr));
        }
        Err(e) => {
            return TestResult::failed(format!("Error executing test '{}':\n{:#}", name, e));
        }
    };

    check(name, test, &response)
}

/// Run the command. The inner `Err` carries stderr of a command that ran but failed.
async fn issue(command: &str) -> Result<std::result::Result<Response, String>> {
    let mut argv = shell_words::split(command).context("Could not parse command")?;
    argv.extend(STATUS_TRAILER.iter().map(|s| s.to_string()));

    let Some((program, args)) = argv.split_first() else {
        bail!("Empty command");
    };

    debug!(program = %program, "Issuing request");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run '{}'", program))?;

    if !output.status.success() {
        return Ok(Err(String::from_utf8_lossy(&output.stderr).into_owned()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(Ok(split_status(&stdout)?))
}

/// Separate the trailing status line from the body.
fn split_status(stdout: &str) -> Result<Response> {
    let trimmed = stdout.trim();
    let (body, status_line) = match trimmed.rsplit_once('\n') {
        Some((body, status)) => (body, status),
        None => ("", trimmed),
    };
    let status = status_line
        .trim()
        .parse::<u16>()
        .with_context(|| format!("Could not read response status from '{}'", status_line))?;
    Ok(Response {
        status,
        body: body.to_string(),
    })
}

fn check(name: &str, test: &HttpTest, response: &Response) -> TestResult {
    let expected_status = test.response.status;
    if response.status != expected_status {
        return TestResult::failed(format!(
            "Test '{}' failed: Expected status {}, got {}",
            name, expected_status, response.status
        ));
    }

    match test.response_type {
        ResponseKind::Json => {
            let actual: Value = match serde_json::from_str(&response.body) {
                Ok(value) => value,
                Err(_) => {
                    return TestResult::failed(format!(
                        "Test '{}' failed: Response body is not valid JSON",
                        name
                    ));
                }
            };
            let Some(expected) = &test.response.json else {
                return TestResult::failed(format!(
                    "Test '{}' failed: No expected JSON body given",
                    name
                ));
            };
            if !comparator::equal(expected, &actual, test.any_order) {
                return TestResult::failed(format!(
                    "Test '{}' failed: Expected body {}, got {}",
                    name, expected, actual
                ));
            }
        }
        ResponseKind::Text => {
            let Some(expected) = test.response.body.as_deref() else {
                return TestResult::failed(format!(
                    "Test '{}' failed: No expected body given",
                    name
                ));
            };
            if response.body != expected {
                return TestResult::failed(format!(
                    "Test '{}' failed: Expected body {}, got {}",
                    name, expected, response.body
                ));
            }
        }
    }

    TestResult::passed(format!("Test '{}' Passed", name))
}
