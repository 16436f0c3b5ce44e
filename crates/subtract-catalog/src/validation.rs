use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;
use subtract_types::WorkItem;

use crate::bids::FileMatcher;
use crate::catalog::{direction_token, DatasetLayout, SubjectCatalog};

/// Data-completeness report for one work item.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub subject_id: String,
    pub session_id: Option<String>,
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub data_summary: BTreeMap<String, serde_json::Value>,
}

impl ValidationReport {
    fn new(item: &WorkItem) -> Self {
        Self {
            subject_id: item.subject_id.clone(),
            session_id: item.session_id.clone(),
            valid: true,
            ..Default::default()
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn summary(&mut self, key: &str, value: serde_json::Value) {
        self.data_summary.insert(key.to_string(), value);
    }

    /// True when two or more phase-encoding directions were found.
    pub fn has_dual_phase_encoding(&self) -> bool {
        self.data_summary
            .get("dual_phase_encoding")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

impl SubjectCatalog {
    /// Check that an item has the raw data the pipeline needs.
    ///
    /// Missing companion files are warnings; missing diffusion data is an
    /// error.
    pub fn validate_subject(&self, subject_id: &str, session_id: Option<&str>) -> ValidationReport {
        let item = match session_id {
            Some(ses) => WorkItem::with_session(subject_id, ses),
            None => WorkItem::new(subject_id),
        };
        self.validate_item(&item)
    }

    pub fn validate_item(&self, item: &WorkItem) -> ValidationReport {
        let report = match self.layout() {
            DatasetLayout::Hierarchical => self.validate_hierarchical(item),
            DatasetLayout::Flat => self.validate_flat(item),
        };
        tracing::debug!(
            item = %item,
            valid = report.valid,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "Validated item"
        );
        report
    }

    fn validate_hierarchical(&self, item: &WorkItem) -> ValidationReport {
        let mut report = ValidationReport::new(item);
        report.summary("hierarchical", json!(true));

        if self.raw_item_dir(item).is_none() {
            report.error(format!("No raw data directory for {item}"));
            return report;
        }

        let dwi_files = match self.dwi_files(item) {
            Ok(files) => files,
            Err(e) => {
                report.error(e.to_string());
                return report;
            }
        };
        let anat_files = self.anat_files(item).unwrap_or_default();

        if dwi_files.is_empty() {
            report.error("No DWI files found");
        }
        for dwi in &dwi_files {
            let name = dwi.file_name();
            if dwi.bval.is_none() {
                report.warn(format!("Missing .bval file for {name}"));
            }
            if dwi.bvec.is_none() {
                report.warn(format!("Missing .bvec file for {name}"));
            }
            if dwi.json.is_none() {
                report.warn(format!("Missing .json file for {name}"));
            }
        }
        if anat_files.is_empty() {
            report.warn("No anatomical files found");
        }

        let groups = self.phase_encoding_groups(item).unwrap_or_default();
        let directions: Vec<&String> = groups.keys().collect();

        report.summary("dwi_files", json!(dwi_files.len()));
        report.summary("anat_files", json!(anat_files.len()));
        report.summary(
            "bval_files",
            json!(dwi_files.iter().filter(|d| d.bval.is_some()).count()),
        );
        report.summary(
            "bvec_files",
            json!(dwi_files.iter().filter(|d| d.bvec.is_some()).count()),
        );
        report.summary("phase_encoding_directions", json!(directions));
        report.summary("dual_phase_encoding", json!(groups.len() >= 2));
        report
    }

    fn validate_flat(&self, item: &WorkItem) -> ValidationReport {
        let mut report = ValidationReport::new(item);
        report.summary("hierarchical", json!(false));

        let Some(subject_dir) = self.raw_subject_dir(&item.subject_id) else {
            report.error(format!(
                "Subject directory does not exist: {}",
                self.data_dir().join(&item.subject_id).display()
            ));
            return report;
        };
        if !subject_dir.join("dwi").is_dir() {
            report.warn("No 'dwi' subdirectory found");
        }

        let dwi_files = self.dwi_files(item).unwrap_or_default();
        report.summary("dwi_files", json!(dwi_files.len()));
        if dwi_files.is_empty() {
            report.error("No DWI files found");
            return report;
        }

        let dir = self.raw_dwi_dir(item).unwrap_or(subject_dir);
        let count = |pattern: &str| {
            FileMatcher::new([pattern])
                .map(|m| m.files_in(&dir).len())
                .unwrap_or(0)
        };
        let bvals = count("*.bval");
        let bvecs = count("*.bvec");
        report.summary("bval_files", json!(bvals));
        report.summary("bvec_files", json!(bvecs));
        if bvals == 0 {
            report.warn("No .bval files found");
        }
        if bvecs == 0 {
            report.warn("No .bvec files found");
        }

        let allowed = &self.layout_config().phase_encoding_directions;
        let tagged = |label: &str| {
            dwi_files
                .iter()
                .filter(|d| direction_token(&d.file_name(), allowed).as_deref() == Some(label))
                .count()
        };
        let ap = tagged("AP");
        let pa = tagged("PA");
        report.summary("dual_phase_encoding", json!(ap > 0 && pa > 0));
        if ap > 0 && pa > 0 {
            report.summary("ap_files", json!(ap));
            report.summary("pa_files", json!(pa));
        }
        report
    }
}
