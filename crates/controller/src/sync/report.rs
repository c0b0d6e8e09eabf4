//! Durable sync report for operator diagnosis.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::AppResult;
use crate::sync::diff::SyncReport;

/// Write the diff findings where an operator will look for them and
/// return the report path.
pub fn write_report(home: &Path, workflow: &str, report: &SyncReport) -> AppResult<PathBuf> {
    fs::create_dir_all(home)?;
    let name = format!("sync-report-{}.txt", Utc::now().format("%Y%m%d-%H%M%S"));
    let path = home.join(name);

    let mut lines = Vec::new();
    lines.push(format!(
        "sync report for workflow '{}' at {}",
        workflow,
        Utc::now().to_rfc3339()
    ));
    lines.push(format!(
        "findings: {} ({} illegal)",
        report.diffs.len(),
        report.illegal().len()
    ));
    lines.push(String::new());
    for diff in &report.diffs {
        lines.push(diff.to_string());
    }
    if report.has_illegal() {
        lines.push(String::new());
        lines.push(
            "illegal changes abort initialization. Revert the declaration, or \
             retry/clear the affected steps before running again."
                .to_string(),
        );
    }
    lines.push(String::new());

    fs::write(&path, lines.join("\n"))?;
    Ok(path)
}
