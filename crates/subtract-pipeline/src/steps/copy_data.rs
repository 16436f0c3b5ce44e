use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use subtract_catalog::{AnatFile, DwiFile};
use subtract_types::{IoContext, Result, StepError, StepOutputs, StepResult, WorkItem};

use crate::step::{copy_file, ensure_dir, finish, Step, StepEnv};

// ---------------------------------------------------------------------------
// DwiCopy — where a raw diffusion image lands in the output area
// ---------------------------------------------------------------------------

/// A raw diffusion image and the stem it is copied under.
#[derive(Debug, Clone)]
pub(crate) struct DwiCopy {
    pub source: DwiFile,
    /// `<prefix>[_task-][_acq-][_dir-][_run-]_dwi`
    pub stem: String,
    pub ext: String,
    pub direction: Option<String>,
}

impl DwiCopy {
    pub fn image(&self, dwi_dir: &Path) -> PathBuf {
        dwi_dir.join(format!("{}{}", self.stem, self.ext))
    }

    pub fn companion(&self, dwi_dir: &Path, ext: &str) -> PathBuf {
        dwi_dir.join(format!("{}.{ext}", self.stem))
    }

    pub fn denoised(&self, dwi_dir: &Path) -> PathBuf {
        dwi_dir.join(format!("{}_denoised.nii.gz", self.stem))
    }

    pub fn degibbs(&self, dwi_dir: &Path) -> PathBuf {
        dwi_dir.join(format!("{}_denoised_degibbs.nii.gz", self.stem))
    }
}

/// Copy plan for an item's raw diffusion images. A missing `dir` entity is
/// filled in from the detected phase-encoding direction.
pub(crate) fn plan_dwi_copies(env: &StepEnv, item: &WorkItem) -> Result<Vec<DwiCopy>> {
    let prefix = item.file_prefix();
    let files = env.catalog.dwi_files(item)?;
    Ok(files
        .into_iter()
        .map(|source| {
            let direction = env.catalog.phase_encoding_direction(&source);
            let mut stem = prefix.clone();
            for key in ["task", "acq", "dir", "run"] {
                let value = match key {
                    "dir" => source.entities.get(key).cloned().or_else(|| direction.clone()),
                    _ => source.entities.get(key).cloned(),
                };
                if let Some(value) = value {
                    stem.push_str(&format!("_{key}-{value}"));
                }
            }
            stem.push_str("_dwi");
            DwiCopy {
                ext: source.extension(),
                stem,
                direction,
                source,
            }
        })
        .collect())
}

fn anat_target(prefix: &str, anat: &AnatFile) -> String {
    let mut name = prefix.to_string();
    for key in ["acq", "ce", "run"] {
        if let Some(value) = anat.entities.get(key) {
            name.push_str(&format!("_{key}-{value}"));
        }
    }
    name.push('_');
    name.push_str(&anat.suffix);
    name
}

fn nifti_ext(path: &Path) -> &'static str {
    if path.to_string_lossy().ends_with(".nii.gz") {
        ".nii.gz"
    } else {
        ".nii"
    }
}

// ---------------------------------------------------------------------------
// CopyData
// ---------------------------------------------------------------------------

/// Copies an item's raw diffusion and anatomical data into its output area
/// under prefix-based names, and writes the processing log.
pub struct CopyData {
    env: Arc<StepEnv>,
}

impl CopyData {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    fn log_path(&self, item: &WorkItem) -> PathBuf {
        self.env.item_dir(item).join("processing_log.txt")
    }

    async fn copy(
        &self,
        item: &WorkItem,
        plan: &[DwiCopy],
        anat: &[AnatFile],
        out: &mut StepOutputs,
    ) -> std::result::Result<(), StepError> {
        self.check_inputs(item)?;
        if plan.is_empty() {
            return Err(StepError::failed(format!("No DWI files found for {item}")));
        }
        let mut seen = HashSet::new();
        for copy in plan {
            if !seen.insert(copy.stem.as_str()) {
                return Err(StepError::failed(format!(
                    "Several raw images map to {}; add acq-/run- entities to tell them apart",
                    copy.stem
                )));
            }
        }

        let dwi_dir = self.env.dwi_dir(item);
        ensure_dir(&dwi_dir).await?;
        for copy in plan {
            let target = copy.image(&dwi_dir);
            copy_file(&copy.source.nii, &target).await?;
            out.push(target);
            let companions = [
                ("bval", &copy.source.bval),
                ("bvec", &copy.source.bvec),
                ("json", &copy.source.json),
            ];
            for (ext, source) in companions {
                if let Some(source) = source {
                    let target = copy.companion(&dwi_dir, ext);
                    copy_file(source, &target).await?;
                    out.push(target);
                }
            }
        }

        let prefix = item.file_prefix();
        if !anat.is_empty() {
            let anat_dir = self.env.item_dir(item).join("anat");
            ensure_dir(&anat_dir).await?;
            for file in anat {
                let name = anat_target(&prefix, file);
                let target = anat_dir.join(format!("{name}{}", nifti_ext(&file.nii)));
                copy_file(&file.nii, &target).await?;
                out.push(target);
                if let Some(json) = &file.json {
                    let target = anat_dir.join(format!("{name}.json"));
                    copy_file(json, &target).await?;
                    out.push(target);
                }
            }
        }

        let mut log = format!("SubTract Pipeline Processing Log\nSubject: {}\n", item.subject_id);
        if let Some(ses) = &item.session_id {
            log.push_str(&format!("Session: {ses}\n"));
        }
        log.push_str(&format!(
            "Data organization completed\nDWI files copied: {}\nAnatomical files copied: {}\n",
            plan.len(),
            anat.len()
        ));
        let log_path = self.log_path(item);
        tokio::fs::write(&log_path, log).await.at(&log_path)?;
        out.push(log_path);

        out.metric("dwi_files_copied", plan.len());
        out.metric("anat_files_copied", anat.len());
        Ok(())
    }
}

#[async_trait]
impl Step for CopyData {
    fn name(&self) -> &str {
        "copy_data"
    }

    fn force_overwrite(&self) -> bool {
        self.env.force_overwrite()
    }

    fn expected_outputs(&self, item: &WorkItem) -> Vec<PathBuf> {
        vec![self.log_path(item)]
    }

    fn check_inputs(&self, item: &WorkItem) -> std::result::Result<(), StepError> {
        match self.env.catalog.raw_item_dir(item) {
            Some(_) => Ok(()),
            None => Err(StepError::missing(item.output_dir(self.env.catalog.data_dir()))),
        }
    }

    async fn execute(&self, item: &WorkItem) -> Result<StepResult> {
        let start = Instant::now();
        let plan = plan_dwi_copies(&self.env, item)?;
        let anat = self.env.catalog.anat_files(item)?;
        let mut out = StepOutputs::new();
        let outcome = self.copy(item, &plan, &anat, &mut out).await;
        Ok(finish(self.name(), item, out, outcome, start.elapsed()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
