use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use subtract_types::WorkItem;

use crate::bids::FileMatcher;
use crate::catalog::{DatasetLayout, SubjectCatalog};

/// Dataset-wide overview used by the `status` and `validate` commands.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub layout: DatasetLayout,
    pub total_subjects: usize,
    /// Work items (subject or subject/session) that passed validation.
    pub valid_units: usize,
    pub units_with_dual_encoding: usize,
    pub subjects_with_sessions: usize,
    /// Per configured step, the number of units whose products exist.
    pub processing_status: BTreeMap<String, usize>,
    pub validation_errors: Vec<String>,
    pub validation_warnings: Vec<String>,
}

fn any_match(dir: &Path, pattern: &str) -> bool {
    FileMatcher::new([pattern])
        .map(|m| !m.files_in(dir).is_empty())
        .unwrap_or(false)
}

impl SubjectCatalog {
    /// Coarse per-step completion flags from the item's output area.
    pub fn processing_status(&self, item: &WorkItem) -> BTreeMap<String, bool> {
        let root = item.output_dir(self.analysis_dir());
        let dwi = root.join("dwi");
        let mrtrix = dwi.join("mrtrix3");

        let checks = [
            ("copy_data", root.join("processing_log.txt").is_file()),
            ("denoise", any_match(&dwi, "*denoised*")),
            ("degibbs", any_match(&dwi, "*degibbs*")),
            ("topup", dwi.join("Topup").is_dir()),
            ("eddy", dwi.join("Eddy").is_dir()),
            ("mdt", dwi.join("mdt").is_dir()),
            ("mrtrix_prep", mrtrix.is_dir()),
            ("tractography", any_match(&mrtrix, "tracks_*")),
            ("sift2", any_match(&mrtrix, "sift_*")),
            ("roi_registration", mrtrix.join("ROIs").is_dir()),
            (
                "connectome",
                any_match(&dwi.join("connectome").join("fingerprints"), "*fingerprint*"),
            ),
        ];
        checks
            .into_iter()
            .map(|(step, done)| (step.to_string(), done))
            .collect()
    }

    /// Validate every unit of `subjects` and tally completion of `steps`
    /// with the output-area heuristic of [`processing_status`].
    ///
    /// [`processing_status`]: SubjectCatalog::processing_status
    pub fn subjects_summary(&self, subjects: &[String], steps: &[String]) -> DatasetSummary {
        self.subjects_summary_with(subjects, steps, |_, _| None)
    }

    /// Like [`subjects_summary`](SubjectCatalog::subjects_summary), but
    /// `completed(item, step)` decides completion; `None` falls back to the
    /// output-area heuristic for that step.
    pub fn subjects_summary_with<F>(
        &self,
        subjects: &[String],
        steps: &[String],
        completed: F,
    ) -> DatasetSummary
    where
        F: Fn(&WorkItem, &str) -> Option<bool>,
    {
        let mut summary = DatasetSummary {
            layout: self.layout(),
            total_subjects: subjects.len(),
            valid_units: 0,
            units_with_dual_encoding: 0,
            subjects_with_sessions: 0,
            processing_status: steps.iter().map(|s| (s.clone(), 0)).collect(),
            validation_errors: Vec::new(),
            validation_warnings: Vec::new(),
        };

        for subject in subjects {
            if !self.subject_sessions(subject).is_empty() {
                summary.subjects_with_sessions += 1;
            }
            for item in self.expand_work_items(std::slice::from_ref(subject)) {
                let report = self.validate_item(&item);
                if report.valid {
                    summary.valid_units += 1;
                }
                if report.has_dual_phase_encoding() {
                    summary.units_with_dual_encoding += 1;
                }
                summary
                    .validation_errors
                    .extend(report.errors.iter().map(|e| format!("{item}: {e}")));
                summary
                    .validation_warnings
                    .extend(report.warnings.iter().map(|w| format!("{item}: {w}")));

                let heuristic = self.processing_status(&item);
                for (step, count) in summary.processing_status.iter_mut() {
                    let done = completed(&item, step)
                        .unwrap_or_else(|| heuristic.get(step).copied().unwrap_or(false));
                    if done {
                        *count += 1;
                    }
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subtract_types::SubtractConfig;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn status_reflects_output_area() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("raw");
        touch(&root.join("dataset_description.json"));
        let config = SubtractConfig::from_bids_dataset(&root);
        let catalog = SubjectCatalog::new(&config).unwrap();

        let item = WorkItem::new("01");
        let out = item.output_dir(&config.paths.analysis_dir);
        touch(&out.join("processing_log.txt"));
        touch(&out.join("dwi/sub-01_dir-AP_dwi_denoised.nii.gz"));
        std::fs::create_dir_all(out.join("dwi/Topup")).unwrap();

        let status = catalog.processing_status(&item);
        assert!(status["copy_data"]);
        assert!(status["denoise"]);
        assert!(status["topup"]);
        assert!(!status["eddy"]);
        assert!(!status["connectome"]);
    }

    #[test]
    fn summary_counts_units_and_sessions() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("raw");
        touch(&root.join("dataset_description.json"));
        for ses in ["a", "b"] {
            for dir in ["AP", "PA"] {
                touch(&root.join(format!("sub-01/ses-{ses}/dwi/sub-01_ses-{ses}_dir-{dir}_dwi.nii.gz")));
            }
        }
        std::fs::create_dir_all(root.join("sub-02/dwi")).unwrap();

        let config = SubtractConfig::from_bids_dataset(&root);
        let catalog = SubjectCatalog::new(&config).unwrap();
        let subjects = catalog.discover_subjects();
        let summary = catalog.subjects_summary(&subjects, &config.steps_to_run);

        assert_eq!(summary.total_subjects, 2);
        assert_eq!(summary.subjects_with_sessions, 1);
        assert_eq!(summary.valid_units, 2);
        assert_eq!(summary.units_with_dual_encoding, 2);
        assert!(summary
            .validation_errors
            .iter()
            .any(|e| e.starts_with("sub-02") && e.contains("No DWI files")));
        assert_eq!(summary.processing_status["copy_data"], 0);
        assert!(!summary.processing_status.contains_key("degibbs"));
    }

    #[test]
    fn completion_callback_overrides_heuristic() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("raw");
        touch(&root.join("dataset_description.json"));
        touch(&root.join("sub-01/dwi/sub-01_dir-AP_dwi.nii.gz"));
        let config = SubtractConfig::from_bids_dataset(&root);
        let catalog = SubjectCatalog::new(&config).unwrap();
        let item = WorkItem::new("01");
        let dwi = item.dwi_dir(&config.paths.analysis_dir);
        std::fs::create_dir_all(dwi.join("Eddy")).unwrap();
        std::fs::create_dir_all(dwi.join("Topup")).unwrap();

        let steps = vec!["topup".to_string(), "eddy".to_string()];
        let subjects = catalog.discover_subjects();
        let heuristic = catalog.subjects_summary(&subjects, &steps);
        assert_eq!(heuristic.processing_status["eddy"], 1);

        let summary = catalog.subjects_summary_with(&subjects, &steps, |_, step| {
            (step == "eddy").then_some(false)
        });
        assert_eq!(summary.processing_status["eddy"], 0, "callback wins");
        assert_eq!(summary.processing_status["topup"], 1, "unanswered steps use the heuristic");
    }
}
