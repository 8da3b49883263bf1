/// Build-report executor
///
/// A build-report spec carries a test source file instead of a request. The
/// executor drops that file into the target's test-source directory, runs
/// the external build/test command against the target's build descriptor,
/// and reads back the XML report the build leaves at a path keyed by the
/// test name. Each `<testcase>` in the report becomes its own result.
use crate::config::GraderConfig;
use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::{Component, Path, PathBuf};
use testit_common::types::TestResult;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// One `<testcase>` as read from the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportCase {
    pub name: String,
    /// Text of the `<error>` or `<failure>` child, if any.
    pub failure: Option<String>,
}

pub struct BuildReportExecutor<'a> {
    config: &'a GraderConfig,
    target: &'a Path,
}

impl<'a> BuildReportExecutor<'a> {
    pub fn new(config: &'a GraderConfig, target: &'a Path) -> Self {
        Self { config, target }
    }

    pub fn source_path(&self, test_name: &str) -> PathBuf {
        self.target
            .join(&self.config.junit_test_location)
            .join(format!("{}.{}", test_name, self.config.test_source_extension))
    }

    pub fn report_path(&self, test_name: &str) -> PathBuf {
        self.target
            .join(&self.config.report_dir)
            .join(format!("{}{}.xml", self.config.report_prefix, test_name))
    }

    /// Run one build-report spec, fanning out into one result per case.
    pub async fn run(&self, test_name: &str, content: &str) -> Vec<(String, TestResult)> {
        if !is_plain_file_stem(test_name) {
            warn!(test = test_name, "Refusing test name that is not a plain file name");
            return vec![(
                test_name.to_string(),
                TestResult::failed(format!(
                    "Invalid test name '{}': must be a plain file name",
                    test_name
                )),
            )];
        }

        match self.build_and_parse(test_name, content).await {
            Ok(Some(cases)) => cases
                .into_iter()
                .map(|case| {
                    let result = match case.failure {
                        Some(reason) => TestResult::failed(format!(
                            "Test '{}' Failed: {}",
                            case.name, reason
                        )),
                        None => TestResult::passed(format!("Test '{}' Passed", case.name)),
                    };
                    (case.name, result)
                })
                .collect(),
            Ok(None) => vec![(
                test_name.to_string(),
                TestResult::failed("Test report not found"),
            )],
            Err(e) => vec![(
                test_name.to_string(),
                TestResult::failed(format!("Error executing test '{}':\n{:#}", test_name, e)),
            )],
        }
    }

    /// `Ok(None)` when the build left no report behind.
    async fn build_and_parse(&self, test_name: &str, content: &str) -> Result<Option<Vec<ReportCase>>> {
        let source = general_purpose::STANDARD
            .decode(content.trim())
            .context("Test source is not valid base64")?;

        let source_path = self.source_path(test_name);
        if let Some(parent) = source_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&source_path, &source)
            .await
            .with_context(|| format!("Failed to write {}", source_path.display()))?;
        debug!(path = %source_path.display(), bytes = source.len(), "Test source written");

        let report_path = self.report_path(test_name);
        if tokio::fs::try_exists(&report_path).await.unwrap_or(false) {
            tokio::fs::remove_file(&report_path)
                .await
                .with_context(|| format!("Failed to remove stale {}", report_path.display()))?;
        }

        self.build().await?;

        let xml = match tokio::fs::read_to_string(&report_path).await {
            Ok(xml) => xml,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %report_path.display(), "Test report not found");
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", report_path.display()));
            }
        };

        let cases = parse_report(&xml)
            .with_context(|| format!("Could not parse test report {}", report_path.display()))?;
        info!(test = test_name, cases = cases.len(), "Parsed test report");
        Ok(Some(cases))
    }

    /// Run the build command. A non-zero exit is expected when tests fail;
    /// only the report decides the outcome.
    async fn build(&self) -> Result<()> {
        let (program, args) = self
            .config
            .build_command
            .split_first()
            .context("Empty build command")?;
        let descriptor = self.target.join(&self.config.pom_path);

        let output = Command::new(program)
            .args(args)
            .arg(&descriptor)
            .current_dir(self.target)
            .output()
            .await
            .with_context(|| format!("Failed to run build command '{}'", program))?;

        info!(status = %output.status, "Build command finished");
        debug!(stdout = %String::from_utf8_lossy(&output.stdout), "Build output");
        Ok(())
    }
}

/// The name becomes part of two file names under the target, so it must not
/// name a directory or climb out of one.
fn is_plain_file_stem(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && matches!(
            Path::new(name).components().collect::<Vec<_>>().as_slice(),
            [Component::Normal(_)]
        )
}

/// Read every `<testcase>` from a JUnit-style XML report.
///
/// A case fails if it has an `<error>` or `<failure>` child; the error wins
/// when both exist. The child's text is the reason, falling back to its
/// `message` attribute. Case names are `classname.name`.
pub fn parse_report(xml: &str) -> Result<Vec<ReportCase>> {
    let mut reader = Reader::from_str(xml);
    let mut cases = Vec::new();

    let mut current: Option<String> = None;
    let mut error: Option<Fault> = None;
    let mut failure: Option<Fault> = None;
    // Which failure-bearing element we are inside, if any.
    let mut capturing: Option<Capture> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"testcase" => {
                    current = Some(case_name(&e)?);
                    error = None;
                    failure = None;
                }
                b"error" if current.is_some() => {
                    error = Some(Fault::from_element(&e)?);
                    capturing = Some(Capture::Error);
                }
                b"failure" if current.is_some() => {
                    failure = Some(Fault::from_element(&e)?);
                    capturing = Some(Capture::Failure);
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"testcase" => cases.push(ReportCase {
                    name: case_name(&e)?,
                    failure: None,
                }),
                b"error" if current.is_some() => error = Some(Fault::from_element(&e)?),
                b"failure" if current.is_some() => failure = Some(Fault::from_element(&e)?),
                _ => {}
            },
            Event::Text(t) => {
                if let Some(which) = capturing {
                    which.push_text(&mut error, &mut failure, &t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some(which) = capturing {
                    which.push_text(&mut error, &mut failure, &String::from_utf8_lossy(&c));
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"error" | b"failure" => capturing = None,
                b"testcase" => {
                    if let Some(name) = current.take() {
                        cases.push(ReportCase {
                            name,
                            failure: error.take().or(failure.take()).map(Fault::into_reason),
                        });
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(cases)
}

/// An `<error>` or `<failure>` element.
#[derive(Debug, Default)]
struct Fault {
    message: String,
    text: String,
}

impl Fault {
    fn from_element(e: &BytesStart) -> Result<Self> {
        Ok(Self {
            message: attr(e, "message")?.unwrap_or_default(),
            text: String::new(),
        })
    }

    fn into_reason(self) -> String {
        let text = self.text.trim();
        if text.is_empty() {
            self.message
        } else {
            text.to_string()
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Capture {
    Error,
    Failure,
}

impl Capture {
    fn push_text(self, error: &mut Option<Fault>, failure: &mut Option<Fault>, text: &str) {
        let slot = match self {
            Capture::Error => error,
            Capture::Failure => failure,
        };
        if let Some(fault) = slot {
            fault.text.push_str(text);
        }
    }
}

fn case_name(e: &BytesStart) -> Result<String> {
    let name = attr(e, "name")?.unwrap_or_default();
    Ok(match attr(e, "classname")? {
        Some(class) if !class.is_empty() => format!("{}.{}", class, name),
        _ => name,
    })
}

fn attr(e: &BytesStart, key: &str) -> Result<Option<String>> {
    match e.try_get_attribute(key)? {
        Some(a) => Ok(Some(a.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}
