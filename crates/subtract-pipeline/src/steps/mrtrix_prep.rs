use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use subtract_dispatch::CommandSpec;
use subtract_types::{Result, StepError, StepOutputs, StepResult, WorkItem};

use crate::step::{copy_file, ensure_dir, finish, Step, StepEnv};

/// MRtrix3 preparation for tractography: fibre orientation distributions,
/// the five-tissue-type image coregistered to diffusion space, and the
/// grey/white-matter interface seed.
///
/// Two degraded paths are recorded as warnings rather than failures: a
/// missing FreeSurfer segmentation (the brain mask stands in for the 5TT
/// image) and a failed ANTs registration (the 5TT image is used
/// uncoregistered).
pub struct MrtrixPrep {
    env: Arc<StepEnv>,
}

impl MrtrixPrep {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    fn mdt_file(&self, item: &WorkItem, suffix: &str) -> PathBuf {
        self.env
            .mdt_dir(item)
            .join(format!("{}{suffix}", item.file_prefix()))
    }

    fn aseg(&self, item: &WorkItem) -> PathBuf {
        self.env
            .config
            .paths
            .base_path
            .join("FreeSurfer")
            .join(format!("sub-{}", item.subject_id))
            .join("mri")
            .join("aseg.mgz")
    }

    /// Run a tool inside the mrtrix directory with relative file names.
    async fn mrtrix(&self, item: &WorkItem, program: &str, args: &[&str]) -> std::result::Result<(), StepError> {
        let spec = CommandSpec::new(program)
            .args(args.iter().copied())
            .cwd(self.env.mrtrix_dir(item));
        self.env.run(spec).await.map(|_| ())
    }

    async fn five_tissue_type(&self, item: &WorkItem, mask_mif: &str, out: &mut StepOutputs) -> std::result::Result<(), StepError> {
        let aseg = self.aseg(item);
        if aseg.is_file() {
            let lut = self
                .env
                .config
                .paths
                .base_path
                .join("Templates")
                .join("FreeSurferColorLUT.txt");
            let aseg = aseg.display().to_string();
            let lut = lut.display().to_string();
            self.mrtrix(
                item,
                "5ttgen",
                &["freesurfer", &aseg, "-lut", &lut, "5tt_nocoreg_fs.mif", "-force"],
            )
            .await
        } else {
            out.warn(format!(
                "FreeSurfer aseg.mgz not found at {}, using the brain mask as 5TT placeholder",
                aseg.display()
            ));
            out.metric("placeholder_5tt", true);
            self.mrtrix(item, "mrconvert", &[mask_mif, "5tt_nocoreg_fs.mif", "-force"])
                .await
        }
    }

    async fn register(&self, item: &WorkItem) -> std::result::Result<(), StepError> {
        self.mrtrix(
            item,
            "antsRegistrationSyNQuick.sh",
            &["-d", "3", "-f", "mean_b0_brain.nii.gz", "-m", "5tt_fs_vol0.nii.gz", "-t", "r", "-o", "fs2diff_"],
        )
        .await?;
        let affine = self.env.mrtrix_dir(item).join("fs2diff_0GenericAffine.mat");
        if !affine.exists() {
            return Err(StepError::failed("ANTs registration produced no affine transform"));
        }
        self.mrtrix(
            item,
            "ConvertTransformFile",
            &["3", "fs2diff_0GenericAffine.mat", "fs2diff_0GenericAffine.txt"],
        )
        .await?;
        self.mrtrix(
            item,
            "transformconvert",
            &["fs2diff_0GenericAffine.txt", "itk_import", "fs2diff_mrtrix.txt", "-force"],
        )
        .await?;
        self.mrtrix(
            item,
            "mrtransform",
            &[
                "5tt_nocoreg_fs.mif",
                "-template",
                "mean_b0_brain.mif",
                "-linear",
                "fs2diff_mrtrix.txt",
                "-interp",
                "nearest",
                "5tt_coreg_fs_ants.mif",
                "-force",
            ],
        )
        .await
    }

    async fn prepare(&self, item: &WorkItem, out: &mut StepOutputs) -> std::result::Result<(), StepError> {
        self.check_inputs(item)?;
        let mrtrix_dir = self.env.mrtrix_dir(item);
        ensure_dir(&mrtrix_dir).await?;
        let prefix = item.file_prefix();

        for suffix in [".nii.gz", ".bval", ".bvec", "_brain_mask.nii.gz"] {
            copy_file(
                &self.mdt_file(item, suffix),
                &mrtrix_dir.join(format!("{prefix}{suffix}")),
            )
            .await?;
        }

        let dwi = format!("{prefix}.nii.gz");
        let dwi_mif = format!("{prefix}.mif");
        let bvec = format!("{prefix}.bvec");
        let bval = format!("{prefix}.bval");
        let mask = format!("{prefix}_brain_mask.nii.gz");
        let mask_mif = format!("{prefix}_brain_mask.mif");

        self.mrtrix(item, "mrconvert", &[&dwi, &dwi_mif, "-fslgrad", &bvec, &bval, "-force"])
            .await?;
        self.mrtrix(item, "mrconvert", &[&mask, &mask_mif, "-force"]).await?;

        // Response functions and multi-shell multi-tissue FODs.
        self.mrtrix(
            item,
            "dwi2response",
            &["dhollander", &dwi_mif, "wm.txt", "gm.txt", "csf.txt", "-voxels", "voxels.mif", "-force"],
        )
        .await?;
        self.mrtrix(
            item,
            "dwi2fod",
            &[
                "msmt_csd", &dwi_mif, "-mask", &mask_mif, "wm.txt", "wmfod.mif", "gm.txt", "gmfod.mif",
                "csf.txt", "csffod.mif", "-force",
            ],
        )
        .await?;
        self.mrtrix(item, "mrconvert", &["-coord", "3", "0", "wmfod.mif", "wmfod_vol0.mif", "-force"])
            .await?;
        self.mrtrix(item, "mrcat", &["csffod.mif", "gmfod.mif", "wmfod_vol0.mif", "vf.mif", "-force"])
            .await?;
        self.mrtrix(
            item,
            "mtnormalise",
            &[
                "wmfod.mif", "wmfod_norm.mif", "gmfod.mif", "gmfod_norm.mif", "csffod.mif",
                "csffod_norm.mif", "-mask", &mask_mif, "-force",
            ],
        )
        .await?;

        self.five_tissue_type(item, &mask_mif, out).await?;

        // Mean b0 in diffusion space, masked, as the registration target.
        self.mrtrix(item, "dwiextract", &[&dwi_mif, "b0s.mif", "-bzero", "-force"]).await?;
        self.mrtrix(item, "mrmath", &["b0s.mif", "mean", "mean_b0.mif", "-axis", "3", "-force"])
            .await?;
        self.mrtrix(item, "mrconvert", &["mean_b0.mif", "mean_b0.nii.gz", "-force"]).await?;
        self.mrtrix(item, "mrconvert", &["5tt_nocoreg_fs.mif", "5tt_nocoreg_fs.nii.gz", "-force"])
            .await?;
        self.mrtrix(item, "fslroi", &["5tt_nocoreg_fs.nii.gz", "5tt_fs_vol0.nii.gz", "0", "1"])
            .await?;
        self.mrtrix(item, "fslmaths", &["mean_b0.nii.gz", "-mas", &mask, "mean_b0_brain.nii.gz"])
            .await?;
        self.mrtrix(item, "mrconvert", &["mean_b0_brain.nii.gz", "mean_b0_brain.mif", "-force"])
            .await?;

        match self.register(item).await {
            Ok(()) => out.metric("coregistered", true),
            Err(e) => {
                out.warn(format!("ANTs registration failed ({e}), using uncoregistered 5TT image"));
                out.metric("coregistered", false);
                self.mrtrix(item, "mrconvert", &["5tt_nocoreg_fs.mif", "5tt_coreg_fs_ants.mif", "-force"])
                    .await?;
            }
        }

        self.mrtrix(
            item,
            "5tt2gmwmi",
            &["5tt_coreg_fs_ants.mif", "gmwmSeed_coreg_fs_ants.mif", "-force"],
        )
        .await?;

        out.extend(self.expected_outputs(item));
        Ok(())
    }
}

#[async_trait]
impl Step for MrtrixPrep {
    fn name(&self) -> &str {
        "mrtrix_prep"
    }

    fn force_overwrite(&self) -> bool {
        self.env.force_overwrite()
    }

    fn expected_outputs(&self, item: &WorkItem) -> Vec<PathBuf> {
        let dir = self.env.mrtrix_dir(item);
        let mut outputs = vec![dir.join(format!("{}.mif", item.file_prefix()))];
        outputs.extend(
            [
                "wmfod_norm.mif",
                "gmfod_norm.mif",
                "csffod_norm.mif",
                "5tt_coreg_fs_ants.mif",
                "gmwmSeed_coreg_fs_ants.mif",
                "mean_b0_brain.mif",
            ]
            .iter()
            .map(|name| dir.join(name)),
        );
        outputs
    }

    fn prerequisites(&self, item: &WorkItem) -> Vec<PathBuf> {
        [".nii.gz", ".bval", ".bvec", "_brain_mask.nii.gz"]
            .iter()
            .map(|suffix| self.mdt_file(item, suffix))
            .collect()
    }

    async fn execute(&self, item: &WorkItem) -> Result<StepResult> {
        let start = Instant::now();
        let mut out = StepOutputs::new();
        let outcome = self.prepare(item, &mut out).await;
        Ok(finish(self.name(), item, out, outcome, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::Mdt;
    use crate::testing::{env_with, test_config, test_env, touch, touch_all};
    use subtract_dispatch::{CommandOutput, RecordingDispatcher};
    use tempfile::TempDir;

    #[tokio::test]
    async fn without_aseg_or_affine_both_fallbacks_warn() {
        let tmp = TempDir::new().unwrap();
        let (env, dispatcher) = test_env(tmp.path());
        let item = WorkItem::new("01");
        touch_all(&Mdt::new(env.clone()).expected_outputs(&item));

        let result = MrtrixPrep::new(env).execute(&item).await.unwrap();
        assert!(result.is_success(), "{:?}", result.error_message());
        assert_eq!(result.warnings().len(), 2, "{:?}", result.warnings());
        assert_eq!(result.metric("coregistered"), Some(&serde_json::json!(false)));
        assert_eq!(result.metric("placeholder_5tt"), Some(&serde_json::json!(true)));

        let programs = dispatcher.programs();
        assert!(!programs.contains(&"5ttgen".to_string()));
        assert!(!programs.contains(&"ConvertTransformFile".to_string()));
        assert_eq!(programs.last().map(String::as_str), Some("5tt2gmwmi"));
        assert!(dispatcher
            .calls()
            .iter()
            .all(|c| c.cwd.as_deref().is_some_and(|d| d.ends_with("dwi/mrtrix3"))));
    }

    #[tokio::test]
    async fn registration_path_when_aseg_and_affine_exist() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        touch(&config.paths.base_path.join("FreeSurfer/sub-01/mri/aseg.mgz"));
        let dispatcher = RecordingDispatcher::with_responder(|spec| {
            if spec.program == "antsRegistrationSyNQuick.sh" {
                if let Some(cwd) = &spec.cwd {
                    std::fs::write(cwd.join("fs2diff_0GenericAffine.mat"), b"").unwrap();
                }
            }
            Ok(CommandOutput::default())
        });
        let (env, dispatcher) = env_with(config, dispatcher);
        let item = WorkItem::new("01");
        touch_all(&Mdt::new(env.clone()).expected_outputs(&item));

        let result = MrtrixPrep::new(env).execute(&item).await.unwrap();
        assert!(result.is_success(), "{:?}", result.error_message());
        assert!(result.warnings().is_empty(), "{:?}", result.warnings());
        let programs = dispatcher.programs();
        for tool in ["5ttgen", "ConvertTransformFile", "transformconvert", "mrtransform"] {
            assert!(programs.contains(&tool.to_string()), "{tool} not run");
        }
    }
}
