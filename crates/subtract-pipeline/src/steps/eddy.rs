use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use subtract_dispatch::CommandSpec;
use subtract_types::{IoContext, Result, StepError, StepOutputs, StepResult, WorkItem};

use crate::step::{copy_file, ensure_dir, finish, Step, StepEnv};

/// Volume count assumed when `fslinfo` cannot provide one.
pub const FALLBACK_VOLUMES: usize = 100;

/// `dim4` value from `fslinfo` output.
pub(crate) fn parse_dim4(stdout: &str) -> Option<usize> {
    stdout.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next()? != "dim4" {
            return None;
        }
        fields.last()?.parse().ok()
    })
}

/// Eddy-current and motion correction with FSL `eddy`, using the TopUp field.
pub struct Eddy {
    env: Arc<StepEnv>,
}

impl Eddy {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    fn topup_file(&self, item: &WorkItem, suffix: &str) -> PathBuf {
        self.env
            .topup_dir(item)
            .join(format!("{}{suffix}", item.file_prefix()))
    }

    fn eddy_file(&self, item: &WorkItem, suffix: &str) -> PathBuf {
        self.env
            .eddy_dir(item)
            .join(format!("{}{suffix}", item.file_prefix()))
    }

    fn program(&self) -> (String, bool) {
        let processing = &self.env.config.processing;
        if processing.eddy_cuda {
            (processing.eddy_method.clone(), true)
        } else {
            ("eddy_openmp".to_string(), false)
        }
    }

    async fn volume_count(&self, dwi: &Path, out: &mut StepOutputs) -> usize {
        match self.env.run(CommandSpec::new("fslinfo").path(dwi)).await {
            Ok(info) => match parse_dim4(&info.stdout_text()) {
                Some(n) => n,
                None => {
                    out.warn(format!(
                        "Could not determine number of volumes, using {FALLBACK_VOLUMES}"
                    ));
                    FALLBACK_VOLUMES
                }
            },
            Err(e) => {
                out.warn(format!("fslinfo failed ({e}), using {FALLBACK_VOLUMES} volumes"));
                FALLBACK_VOLUMES
            }
        }
    }

    async fn correct(&self, item: &WorkItem, out: &mut StepOutputs) -> std::result::Result<(), StepError> {
        self.check_inputs(item)?;
        let eddy_dir = self.env.eddy_dir(item);
        ensure_dir(&eddy_dir).await?;
        let prefix = item.file_prefix();

        let staged = [
            ("_topup_dwi.nii.gz", "_dwi.nii.gz"),
            ("_topup_dwi.bval", "_dwi.bval"),
            ("_topup_dwi.bvec", "_dwi.bvec"),
            ("_dwi_Topup_fieldcoef.nii.gz", "_dwi_Topup_fieldcoef.nii.gz"),
            ("_dwi_Topup_movpar.txt", "_dwi_Topup_movpar.txt"),
        ];
        for (from, to) in staged {
            let target = self.eddy_file(item, to);
            copy_file(&self.topup_file(item, from), &target).await?;
            out.push(target);
        }
        let acq_params = eddy_dir.join("acq_params.txt");
        copy_file(&self.env.topup_dir(item).join("acq_params.txt"), &acq_params).await?;

        let dwi = self.eddy_file(item, "_dwi.nii.gz");
        let first_volume = self.eddy_file(item, "_1stVol.nii.gz");
        self.env
            .run(
                CommandSpec::new("fslroi")
                    .path(&dwi)
                    .path(&first_volume)
                    .args(["0", "1"]),
            )
            .await?;

        self.env
            .run(
                CommandSpec::new("bet")
                    .path(&first_volume)
                    .path(self.eddy_file(item, "_brain"))
                    .arg("-m")
                    .arg("-f")
                    .arg(self.env.config.processing.bet_threshold.to_string()),
            )
            .await?;
        out.push(self.eddy_file(item, "_brain_mask.nii.gz"));

        let volumes = self.volume_count(&dwi, out).await;
        let index = eddy_dir.join("index.txt");
        tokio::fs::write(&index, "1\n".repeat(volumes)).await.at(&index)?;

        let (program, cuda) = self.program();
        let mut spec = CommandSpec::new(&program)
            .args([
                format!("--imain={prefix}_dwi"),
                format!("--mask={prefix}_brain_mask.nii.gz"),
                "--index=index.txt".to_string(),
                "--acqp=acq_params.txt".to_string(),
                format!("--bvecs={prefix}_dwi.bvec"),
                format!("--bvals={prefix}_dwi.bval"),
                format!("--topup={prefix}_dwi_Topup"),
                "--flm=quadratic".to_string(),
                format!("--out={prefix}_eddy_unwarped"),
                "--data_is_shelled".to_string(),
            ])
            .cwd(&eddy_dir);
        if !cuda {
            spec = spec.arg(format!("--nthr={}", self.env.threads()));
        }
        self.env.run(spec).await?;

        out.push(self.eddy_file(item, "_eddy_unwarped.nii.gz"));
        out.metric("volumes", volumes);
        out.metric("eddy_method", program);
        out.metric("cuda_enabled", cuda);
        Ok(())
    }
}

#[async_trait]
impl Step for Eddy {
    fn name(&self) -> &str {
        "eddy"
    }

    fn force_overwrite(&self) -> bool {
        self.env.force_overwrite()
    }

    fn expected_outputs(&self, item: &WorkItem) -> Vec<PathBuf> {
        vec![
            self.eddy_file(item, "_eddy_unwarped.nii.gz"),
            self.eddy_file(item, "_dwi.bval"),
            self.eddy_file(item, "_dwi.bvec"),
            self.eddy_file(item, "_brain_mask.nii.gz"),
        ]
    }

    fn prerequisites(&self, item: &WorkItem) -> Vec<PathBuf> {
        vec![
            self.topup_file(item, "_topup_dwi.nii.gz"),
            self.topup_file(item, "_topup_dwi.bval"),
            self.topup_file(item, "_topup_dwi.bvec"),
            self.env.topup_dir(item).join("acq_params.txt"),
            self.topup_file(item, "_dwi_Topup_fieldcoef.nii.gz"),
            self.topup_file(item, "_dwi_Topup_movpar.txt"),
        ]
    }

    async fn execute(&self, item: &WorkItem) -> Result<StepResult> {
        let start = Instant::now();
        let mut out = StepOutputs::new();
        let outcome = self.correct(item, &mut out).await;
        Ok(finish(self.name(), item, out, outcome, start.elapsed()))
    }
}
