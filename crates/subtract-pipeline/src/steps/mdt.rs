use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use subtract_dispatch::CommandSpec;
use subtract_types::{Result, StepError, StepOutputs, StepResult, WorkItem};

use crate::step::{copy_file, ensure_dir, finish, Step, StepEnv};
use crate::steps::{model_dir, model_maps};

/// Microstructure model fitting with MDT on the eddy-corrected data.
///
/// Stages the corrected image, gradients and mask as `<prefix>.*` in the
/// `mdt` directory, builds a protocol, and fits each configured model.
pub struct Mdt {
    env: Arc<StepEnv>,
}

impl Mdt {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    fn mdt_file(&self, item: &WorkItem, suffix: &str) -> PathBuf {
        self.env
            .mdt_dir(item)
            .join(format!("{}{suffix}", item.file_prefix()))
    }

    fn eddy_file(&self, item: &WorkItem, suffix: &str) -> PathBuf {
        self.env
            .eddy_dir(item)
            .join(format!("{}{suffix}", item.file_prefix()))
    }

    async fn fit(&self, item: &WorkItem, out: &mut StepOutputs) -> std::result::Result<(), StepError> {
        self.check_inputs(item)?;
        let mdt_dir = self.env.mdt_dir(item);
        ensure_dir(&mdt_dir).await?;
        let prefix = item.file_prefix();

        let staged = [
            ("_eddy_unwarped.nii.gz", ".nii.gz"),
            ("_dwi.bval", ".bval"),
            ("_dwi.bvec", ".bvec"),
            ("_brain_mask.nii.gz", "_brain_mask.nii.gz"),
        ];
        for (from, to) in staged {
            let target = self.mdt_file(item, to);
            copy_file(&self.eddy_file(item, from), &target).await?;
            out.push(target);
        }

        self.env
            .run(
                CommandSpec::new("mdt-create-protocol")
                    .arg(format!("{prefix}.bvec"))
                    .arg(format!("{prefix}.bval"))
                    .arg("-o")
                    .arg(format!("{prefix}.prtcl"))
                    .cwd(&mdt_dir),
            )
            .await?;
        out.push(self.mdt_file(item, ".prtcl"));

        let models = &self.env.config.processing.mdt_models;
        for model in models {
            self.env
                .run(
                    CommandSpec::new("mdt-model-fit")
                        .arg(model)
                        .arg(format!("{prefix}.nii.gz"))
                        .arg(format!("{prefix}.prtcl"))
                        .arg(format!("{prefix}_brain_mask.nii.gz"))
                        .cwd(&mdt_dir),
                )
                .await?;
            out.push(model_dir(&self.env, item, model));
        }
        out.metric("models", models.clone());
        Ok(())
    }
}

#[async_trait]
impl Step for Mdt {
    fn name(&self) -> &str {
        "mdt"
    }

    fn force_overwrite(&self) -> bool {
        self.env.force_overwrite()
    }

    fn expected_outputs(&self, item: &WorkItem) -> Vec<PathBuf> {
        let mut outputs = vec![
            self.mdt_file(item, ".nii.gz"),
            self.mdt_file(item, ".bval"),
            self.mdt_file(item, ".bvec"),
            self.mdt_file(item, "_brain_mask.nii.gz"),
            self.mdt_file(item, ".prtcl"),
        ];
        for model in &self.env.config.processing.mdt_models {
            outputs.extend(model_maps(&self.env, item, model));
        }
        outputs
    }

    fn prerequisites(&self, item: &WorkItem) -> Vec<PathBuf> {
        vec![
            self.eddy_file(item, "_eddy_unwarped.nii.gz"),
            self.eddy_file(item, "_dwi.bval"),
            self.eddy_file(item, "_dwi.bvec"),
            self.eddy_file(item, "_brain_mask.nii.gz"),
        ]
    }

    async fn execute(&self, item: &WorkItem) -> Result<StepResult> {
        let start = Instant::now();
        let mut out = StepOutputs::new();
        let outcome = self.fit(item, &mut out).await;
        Ok(finish(self.name(), item, out, outcome, start.elapsed()))
    }
}
