//! The step contract, the shared step environment, and helpers used by every
//! concrete step.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use subtract_catalog::SubjectCatalog;
use subtract_dispatch::{CommandDispatcher, CommandOutput, CommandSpec};
use subtract_types::{IoContext, Result, StepError, StepOutputs, StepResult, SubtractConfig, WorkItem};

// ---------------------------------------------------------------------------
// StepEnv — immutable collaborators shared by all steps of a run
// ---------------------------------------------------------------------------

/// Configuration, dispatcher and catalog handed to every step.
///
/// Built once per run and shared behind an `Arc`; nothing in it is mutated
/// while items are processed.
pub struct StepEnv {
    pub config: Arc<SubtractConfig>,
    pub dispatcher: Arc<dyn CommandDispatcher>,
    pub catalog: Arc<SubjectCatalog>,
}

impl StepEnv {
    pub fn new(
        config: Arc<SubtractConfig>,
        dispatcher: Arc<dyn CommandDispatcher>,
        catalog: Arc<SubjectCatalog>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            catalog,
        }
    }

    pub fn force_overwrite(&self) -> bool {
        self.config.processing.force_overwrite
    }

    /// `-nthreads` / `--nthr` value.
    pub fn threads(&self) -> String {
        self.config.processing.n_threads.to_string()
    }

    pub fn item_dir(&self, item: &WorkItem) -> PathBuf {
        item.output_dir(&self.config.paths.analysis_dir)
    }

    pub fn dwi_dir(&self, item: &WorkItem) -> PathBuf {
        item.dwi_dir(&self.config.paths.analysis_dir)
    }

    pub fn topup_dir(&self, item: &WorkItem) -> PathBuf {
        self.dwi_dir(item).join("Topup")
    }

    pub fn eddy_dir(&self, item: &WorkItem) -> PathBuf {
        self.dwi_dir(item).join("Eddy")
    }

    pub fn mdt_dir(&self, item: &WorkItem) -> PathBuf {
        self.dwi_dir(item).join("mdt")
    }

    pub fn mrtrix_dir(&self, item: &WorkItem) -> PathBuf {
        self.dwi_dir(item).join("mrtrix3")
    }

    pub fn roi_dir(&self, item: &WorkItem) -> PathBuf {
        self.mrtrix_dir(item).join("ROIs")
    }

    pub fn connectome_dir(&self, item: &WorkItem) -> PathBuf {
        self.dwi_dir(item).join("connectome")
    }

    /// Dispatch one command, mapping its failure into a [`StepError`].
    pub async fn run(&self, spec: CommandSpec) -> std::result::Result<CommandOutput, StepError> {
        Ok(self.dispatcher.run(spec).await?)
    }
}

// ---------------------------------------------------------------------------
// Step trait
// ---------------------------------------------------------------------------

/// A named pipeline stage.
///
/// Implementations must hold no per-item state: the same instance is invoked
/// for many items, possibly concurrently.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name used in the configured step list and as the result key.
    fn name(&self) -> &str;

    /// Whether skip-on-existing-output is disabled for this run.
    fn force_overwrite(&self) -> bool;

    /// Files this step leaves behind for `item`. Computed from names only.
    fn expected_outputs(&self, item: &WorkItem) -> Vec<PathBuf>;

    /// Files that must exist before this step can run for `item`.
    fn prerequisites(&self, _item: &WorkItem) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Verify the prerequisites, naming the first one that is missing.
    fn check_inputs(&self, item: &WorkItem) -> std::result::Result<(), StepError> {
        require_all(&self.prerequisites(item))
    }

    fn validate_inputs(&self, item: &WorkItem) -> bool {
        match self.check_inputs(item) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(step = self.name(), item = %item, error = %e, "Inputs not ready");
                false
            }
        }
    }

    /// Every expected output exists. A step that declares no outputs is
    /// never complete.
    fn outputs_complete(&self, item: &WorkItem) -> bool {
        let expected = self.expected_outputs(item);
        !expected.is_empty() && expected.iter().all(|p| p.exists())
    }

    /// True iff force is off and the step's outputs are complete.
    fn should_skip(&self, item: &WorkItem) -> bool {
        !self.force_overwrite() && self.outputs_complete(item)
    }

    /// Run the step. Anticipated failures come back as a failed
    /// [`StepResult`]; an `Err` means something unexpected went wrong.
    async fn execute(&self, item: &WorkItem) -> Result<StepResult>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn require(path: &Path) -> std::result::Result<(), StepError> {
    if path.exists() {
        Ok(())
    } else {
        Err(StepError::missing(path))
    }
}

pub fn require_all(paths: &[PathBuf]) -> std::result::Result<(), StepError> {
    paths.iter().try_for_each(|p| require(p))
}

pub async fn ensure_dir(dir: &Path) -> std::result::Result<(), StepError> {
    tokio::fs::create_dir_all(dir).await.at(dir)
}

pub async fn copy_file(from: &Path, to: &Path) -> std::result::Result<(), StepError> {
    require(from)?;
    tokio::fs::copy(from, to).await.at(to)?;
    tracing::debug!(from = %from.display(), to = %to.display(), "Copied");
    Ok(())
}

/// Seal a step body's outcome into a [`StepResult`], logging it. On failure
/// the outputs and warnings gathered before the error stay on the result.
pub fn finish(
    step: &str,
    item: &WorkItem,
    out: StepOutputs,
    outcome: std::result::Result<(), StepError>,
    elapsed: Duration,
) -> StepResult {
    match outcome {
        Ok(()) => {
            tracing::info!(
                step,
                item = %item,
                outputs = out.outputs.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Step completed"
            );
            out.into_result(elapsed)
        }
        Err(err) => {
            tracing::error!(
                step,
                item = %item,
                kind = err.kind(),
                partial_outputs = out.outputs.len(),
                error = %err,
                "Step failed"
            );
            StepResult::from_step_error(&err)
                .with_execution_time(elapsed)
                .with_outputs(out.outputs)
                .with_warnings(out.warnings)
        }
    }
}

/// File name without its `.nii.gz` / `.nii` extension.
pub(crate) fn nifti_stem(name: &str) -> &str {
    name.strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
