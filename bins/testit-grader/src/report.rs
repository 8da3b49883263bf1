// Cumulative result artifact: read, merge, write back

use anyhow::{Context, Result};
use std::path::Path;
use testit_common::types::CumulativeReport;
use tracing::{info, warn};

/// Merge a phase's contribution into the artifact at `path`.
///
/// A missing file starts from empty. So does an unreadable one, with a
/// warning: the current phase's feedback must still reach the student.
/// The file is replaced atomically.
pub fn merge_into(path: &Path, contribution: CumulativeReport) -> Result<CumulativeReport> {
    let mut report = read_existing(path);
    report.absorb(contribution);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(&report).context("Failed to serialize results")?;
    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, json)
        .with_context(|| format!("Failed to write {}", staging.display()))?;
    std::fs::rename(&staging, path)
        .with_context(|| format!("Failed to move results into {}", path.display()))?;

    info!(
        path = %path.display(),
        score = report.score,
        tests = report.tests.len(),
        "Results persisted"
    );
    Ok(report)
}

fn read_existing(path: &Path) -> CumulativeReport {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CumulativeReport::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read existing results, starting fresh");
            return CumulativeReport::default();
        }
    };

    match serde_json::from_str(&content) {
        Ok(report) => report,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Existing results are not valid, starting fresh");
            CumulativeReport::default()
        }
    }
}
