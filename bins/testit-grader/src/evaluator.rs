/// Feedback & Scoring
///
/// **Core Responsibility:**
/// Turn run reports into the feedback items the grading platform shows,
/// pick which validated tests get admitted, and compute the two bonus items.
///
/// **Critical Properties:**
/// - Knows nothing about processes, executors or the bank transport
/// - Pure functions: (run report, configuration, deadline) → feedback
///
/// **Scoring Rules:**
/// - Sample-phase items always score 0
/// - Submission items for default tests score their `score` when passed,
///   out of their `max_score` (split across fan-out cases); every other
///   test scores 0/0
/// - "Passed all default tests" holds iff no default-test result failed
///   (vacuously true when there are none)
/// - A self-written, public, non-default test is eligible for the public
///   tests bonus if it was created no later than `due - timeToDeadline`
/// - A bonus item whose configured value is 0 is omitted
use crate::config::GraderConfig;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use testit_common::types::{
    FeedbackItem, FeedbackStatus, Provenance, RunEntry, RunReport, TestSpec, Visibility,
};

pub const SAMPLE_PREFIX: &str = "SAMPLE SOLUTION RESULT: ";
pub const ALL_DEFAULTS_ITEM: &str = "Passed all default tests";

/// Reason text, preceded by the spec's description when it has one.
fn entry_output(entry: &RunEntry) -> String {
    match entry.spec.description.as_deref() {
        Some(description) if !description.is_empty() => {
            format!("Description: {}\n\n{}", description, entry.result.reason)
        }
        _ => entry.result.reason.clone(),
    }
}

/// Feedback for a run against the reference target.
pub fn sample_feedback(report: &RunReport) -> Vec<FeedbackItem> {
    report
        .entries
        .iter()
        .map(|entry| FeedbackItem {
            name: format!("{}{}", SAMPLE_PREFIX, entry.name),
            status: entry.result.success.into(),
            score: 0.0,
            max_score: 0.0,
            output: entry_output(entry),
            visibility: Visibility::Visible,
            provenance: None,
        })
        .collect()
}

/// Feedback for a run against the submission, with provenance attached.
///
/// A default test that fanned out splits its points evenly across its cases.
pub fn submission_feedback(report: &RunReport) -> Vec<FeedbackItem> {
    let mut cases_per_origin: HashMap<usize, usize> = HashMap::new();
    for entry in &report.entries {
        *cases_per_origin.entry(entry.origin).or_default() += 1;
    }

    report
        .entries
        .iter()
        .map(|entry| {
            let bank = &entry.spec.bank;
            let (score, max_score) = if bank.is_default {
                let share = cases_per_origin.get(&entry.origin).copied().unwrap_or(1) as f64;
                let score = if entry.result.success { bank.score } else { 0.0 };
                (score / share, bank.max_score / share)
            } else {
                (0.0, 0.0)
            };
            FeedbackItem {
                name: entry.name.clone(),
                status: entry.result.success.into(),
                score,
                max_score,
                output: entry_output(entry),
                visibility: Visibility::Visible,
                provenance: Some(Provenance::from(bank)),
            }
        })
        .collect()
}

/// Specs that passed the reference run, first occurrence of each name only.
///
/// A spec that fanned out into several cases is admitted as soon as one of
/// them passed.
pub fn admitted_subset(report: &RunReport) -> Vec<TestSpec> {
    let mut seen_names = HashSet::new();
    let mut admitted = Vec::new();
    for entry in &report.entries {
        if entry.result.success && seen_names.insert(entry.spec.name.as_str()) {
            admitted.push(entry.spec.clone());
        }
    }
    admitted
}

pub fn passed_all_defaults(report: &RunReport) -> bool {
    report
        .entries
        .iter()
        .filter(|e| e.spec.bank.is_default)
        .all(|e| e.result.success)
}

/// Count the student's own public tests that were in the bank early enough.
///
/// Without a due date every such test counts.
pub fn count_eligible_public_tests(
    tests: &[TestSpec],
    due_date: Option<DateTime<Utc>>,
    lead: chrono::Duration,
) -> usize {
    let cutoff = due_date.map(|due| due - lead);
    tests
        .iter()
        .filter(|t| t.bank.self_written && t.bank.public && !t.bank.is_default)
        .filter(|t| match (cutoff, t.bank.created_at) {
            (None, _) => true,
            (Some(cutoff), Some(created)) => created <= cutoff,
            (Some(_), None) => false,
        })
        .count()
}

pub fn public_tests_item_name(threshold: u32) -> String {
    format!("Submitted at least {} public tests before the deadline", threshold)
}

/// The synthetic items not tied to any one test.
pub fn bonus_items(
    config: &GraderConfig,
    report: &RunReport,
    tests: &[TestSpec],
    due_date: Option<DateTime<Utc>>,
) -> Vec<FeedbackItem> {
    let mut items = Vec::new();

    if config.pass_default_tests_score != 0.0 {
        let passed = passed_all_defaults(report);
        items.push(bonus(
            ALL_DEFAULTS_ITEM.to_string(),
            passed,
            config.pass_default_tests_score,
            if passed {
                "All default tests passed.".to_string()
            } else {
                "At least one default test failed.".to_string()
            },
        ));
    }

    if config.public_tests_score != 0.0 {
        let threshold = config.num_public_tests_for_access;
        let eligible = count_eligible_public_tests(tests, due_date, config.deadline_lead());
        let passed = eligible >= threshold as usize;
        items.push(bonus(
            public_tests_item_name(threshold),
            passed,
            config.public_tests_score,
            format!(
                "{} of your public tests were submitted at least {} hours before the deadline.",
                eligible, config.time_to_deadline
            ),
        ));
    }

    items
}

fn bonus(name: String, passed: bool, value: f64, output: String) -> FeedbackItem {
    FeedbackItem {
        name,
        status: FeedbackStatus::from(passed),
        score: if passed { value } else { 0.0 },
        max_score: value,
        output,
        visibility: Visibility::Visible,
        provenance: None,
    }
}
