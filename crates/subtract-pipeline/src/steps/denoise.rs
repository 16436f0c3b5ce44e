use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use subtract_dispatch::CommandSpec;
use subtract_types::{Result, StepError, StepOutputs, StepResult, WorkItem};

use crate::step::{finish, Step, StepEnv};
use crate::steps::{plan_dwi_copies, DwiCopy};

/// MP-PCA denoising of every copied diffusion image with `dwidenoise`.
pub struct Denoise {
    env: Arc<StepEnv>,
}

impl Denoise {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    fn plan(&self, item: &WorkItem) -> Vec<DwiCopy> {
        plan_dwi_copies(&self.env, item).unwrap_or_else(|e| {
            tracing::debug!(item = %item, error = %e, "No copy plan");
            Vec::new()
        })
    }

    async fn denoise(&self, item: &WorkItem, plan: &[DwiCopy], out: &mut StepOutputs) -> std::result::Result<(), StepError> {
        if plan.is_empty() {
            return Err(StepError::failed(format!("No DWI images to denoise for {item}")));
        }
        self.check_inputs(item)?;

        let dwi_dir = self.env.dwi_dir(item);
        for copy in plan {
            let output = copy.denoised(&dwi_dir);
            self.env
                .run(
                    CommandSpec::new("dwidenoise")
                        .path(copy.image(&dwi_dir))
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
impl Step for Denoise {
    fn name(&self) -> &str {
        "denoise"
    }

    fn force_overwrite(&self) -> bool {
        self.env.force_overwrite()
    }

    fn expected_outputs(&self, item: &WorkItem) -> Vec<PathBuf> {
        let dwi_dir = self.env.dwi_dir(item);
        self.plan(item).iter().map(|c| c.denoised(&dwi_dir)).collect()
    }

    fn prerequisites(&self, item: &WorkItem) -> Vec<PathBuf> {
        let dwi_dir = self.env.dwi_dir(item);
        self.plan(item).iter().map(|c| c.image(&dwi_dir)).collect()
    }

    async fn execute(&self, item: &WorkItem) -> Result<StepResult> {
        let start = Instant::now();
        let plan = plan_dwi_copies(&self.env, item)?;
        let mut out = StepOutputs::new();
        let outcome = self.denoise(item, &plan, &mut out).await;
        Ok(finish(self.name(), item, out, outcome, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::CopyData;
    use crate::testing::{env_with, raw_dual_pe, test_config, test_env};
    use subtract_dispatch::RecordingDispatcher;
    use subtract_types::CommandError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn runs_dwidenoise_per_image() {
        let tmp = TempDir::new().unwrap();
        raw_dual_pe(tmp.path(), "01");
        let (env, dispatcher) = test_env(tmp.path());
        let item = WorkItem::new("01");
        CopyData::new(env.clone()).execute(&item).await.unwrap();

        let step = Denoise::new(env.clone());
        let dwi = env.dwi_dir(&item);
        assert_eq!(
            step.expected_outputs(&item),
            vec![
                dwi.join("sub-01_dir-AP_dwi_denoised.nii.gz"),
                dwi.join("sub-01_dir-PA_dwi_denoised.nii.gz"),
            ]
        );

        let result = step.execute(&item).await.unwrap();
        assert!(result.is_success(), "{:?}", result.error_message());
        let calls = dispatcher.calls_to("dwidenoise");
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].args,
            vec![
                dwi.join("sub-01_dir-AP_dwi.nii.gz").display().to_string(),
                dwi.join("sub-01_dir-AP_dwi_denoised.nii.gz").display().to_string(),
                "-force".into(),
                "-nthreads".into(),
                "2".into(),
            ]
        );
    }

    #[tokio::test]
    async fn uncopied_inputs_are_missing_prerequisites() {
        let tmp = TempDir::new().unwrap();
        raw_dual_pe(tmp.path(), "01");
        let (env, dispatcher) = test_env(tmp.path());

        let result = Denoise::new(env).execute(&WorkItem::new("01")).await.unwrap();
        assert!(!result.is_success());
        assert!(result.error_message().unwrap().starts_with("Missing prerequisite"));
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn tool_failure_carries_exit_code() {
        let tmp = TempDir::new().unwrap();
        raw_dual_pe(tmp.path(), "01");
        let dispatcher = RecordingDispatcher::with_responder(|spec| {
            Err(CommandError::Exited {
                command: spec.display(),
                exit_code: 4,
                stderr: "dwidenoise: [ERROR] bad image".into(),
            })
        });
        let (env, _) = env_with(test_config(tmp.path()), dispatcher);
        let item = WorkItem::new("01");
        CopyData::new(env.clone()).execute(&item).await.unwrap();

        let result = Denoise::new(env).execute(&item).await.unwrap();
        assert!(!result.is_success());
        assert!(result.error_message().unwrap().contains("bad image"));
        assert_eq!(result.metric("exit_code"), Some(&serde_json::json!(4)));
    }
}
