//! Persisted record of a batch run.
//!
//! The CLI writes a [`RunReport`] to `<result_dir>/run_report.json` when a
//! batch finishes so results can be inspected (or compared with a later
//! resumed run) without re-running anything.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use subtract_types::Result;

use crate::runner::BatchResults;
use crate::summary::PipelineSummary;

pub const REPORT_FILE: &str = "run_report.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    /// RFC 3339.
    pub started_at: String,
    /// RFC 3339.
    pub finished_at: String,
    pub steps: Vec<String>,
    pub parallel: bool,
    pub results: BatchResults,
    pub summary: PipelineSummary,
}

impl RunReport {
    /// Build a report for a batch that started at `started_at`.
    pub fn new(
        started_at: chrono::DateTime<chrono::Utc>,
        steps: Vec<String>,
        parallel: bool,
        results: BatchResults,
    ) -> Self {
        let summary = PipelineSummary::from_results(&results);
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: started_at.to_rfc3339(),
            finished_at: chrono::Utc::now().to_rfc3339(),
            steps,
            parallel,
            results,
            summary,
        }
    }
}

/// Write `report` to `<dir>/run_report.json`, creating `dir` if needed.
pub async fn save_report(report: &RunReport, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(REPORT_FILE);
    let json = serde_json::to_string_pretty(report)?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(path = %path.display(), run_id = %report.run_id, "Run report saved");
    Ok(path)
}

/// `Ok(None)` when no report has been written yet.
pub async fn load_report(dir: &Path) -> Result<Option<RunReport>> {
    let path = dir.join(REPORT_FILE);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    Ok(Some(serde_json::from_str(&json)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
