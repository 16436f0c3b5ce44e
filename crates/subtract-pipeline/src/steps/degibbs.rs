use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use subtract_dispatch::CommandSpec;
use subtract_types::{Result, StepError, StepOutputs, StepResult, WorkItem};

use crate::step::{finish, Step, StepEnv};
use crate::steps::{plan_dwi_copies, DwiCopy};

/// Gibbs-ringing removal on the denoised images with `mrdegibbs`.
pub struct Degibbs {
    env: Arc<StepEnv>,
}

impl Degibbs {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    fn plan(&self, item: &WorkItem) -> Vec<DwiCopy> {
        plan_dwi_copies(&self.env, item).unwrap_or_default()
    }

    async fn degibbs(&self, item: &WorkItem, plan: &[DwiCopy], out: &mut StepOutputs) -> std::result::Result<(), StepError> {
        if plan.is_empty() {
            return Err(StepError::failed(format!("No denoised images for {item}")));
        }
        self.check_inputs(item)?;

        let dwi_dir = self.env.dwi_dir(item);
        for copy in plan {
            let output = copy.degibbs(&dwi_dir);
            self.env
                .run(
                    CommandSpec::new("mrdegibbs")
                        .path(copy.denoised(&dwi_dir))
                        .path(&output)
                        .arg("-force")
                        .arg("-nthreads")
                        .arg(self.env.threads()),
                )
                .await?;
            out.push(output);
        }
        out.metric("files_processed", plan.len());
        Ok(())
    }
}

#[async_trait]
impl Step for Degibbs {
    fn name(&self) -> &str {
        "degibbs"
    }

    fn force_overwrite(&self) -> bool {
        self.env.force_overwrite()
    }

    fn expected_outputs(&self, item: &WorkItem) -> Vec<PathBuf> {
        let dwi_dir = self.env.dwi_dir(item);
        self.plan(item).iter().map(|c| c.degibbs(&dwi_dir)).collect()
    }

    fn prerequisites(&self, item: &WorkItem) -> Vec<PathBuf> {
        let dwi_dir = self.env.dwi_dir(item);
        self.plan(item).iter().map(|c| c.denoised(&dwi_dir)).collect()
    }

    async fn execute(&self, item: &WorkItem) -> Result<StepResult> {
        let start = Instant::now();
        let plan = plan_dwi_copies(&self.env, item)?;
        let mut out = StepOutputs::new();
        let outcome = self.degibbs(item, &plan, &mut out).await;
        Ok(finish(self.name(), item, out, outcome, start.elapsed()))
    }
}
