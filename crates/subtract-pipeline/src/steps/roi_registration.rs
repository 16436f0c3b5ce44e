use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use subtract_dispatch::CommandSpec;
use subtract_types::{IoContext, Result, StepError, StepOutputs, StepResult, WorkItem};

use crate::step::{ensure_dir, finish, Step, StepEnv};
use crate::steps::{hemisphere_name, parcellation, HEMISPHERES};

/// Name of a template region once it is in diffusion space.
fn dwi_name(region: &str) -> String {
    match region.strip_suffix("_fsaverage") {
        Some(base) => format!("{base}_DWI"),
        None => format!("{region}_DWI"),
    }
}

/// Moves template ROIs into each item's diffusion space with the affine from
/// `mrtrix_prep`, then combines each hemisphere's regions into a labelled
/// parcellation (label = position in the configured order + 1).
pub struct RoiRegistration {
    env: Arc<StepEnv>,
}

impl RoiRegistration {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    fn template(&self, region: &str) -> PathBuf {
        self.env
            .config
            .roi_template_dir()
            .join(format!("{region}.nii.gz"))
    }

    fn registered(&self, item: &WorkItem, region: &str) -> PathBuf {
        self.env
            .roi_dir(item)
            .join(format!("{}.mif", dwi_name(region)))
    }

    fn affine(&self, item: &WorkItem) -> PathBuf {
        self.env.mrtrix_dir(item).join("fs2diff_0GenericAffine.mat")
    }

    fn reference(&self, item: &WorkItem) -> PathBuf {
        self.env.mrtrix_dir(item).join("mean_b0_brain.mif")
    }

    async fn binarize(&self, input: &Path, output: &Path, out: &mut StepOutputs) -> std::result::Result<(), StepError> {
        let binarized = self
            .env
            .run(
                CommandSpec::new("mri_binarize")
                    .arg("--i")
                    .path(input)
                    .args(["--match", "1"])
                    .arg("--o")
                    .path(output),
            )
            .await;
        if let Err(e) = binarized {
            out.warn(format!("mri_binarize failed ({e}), thresholding with mrcalc"));
            self.env
                .run(
                    CommandSpec::new("mrcalc")
                        .path(input)
                        .args(["0", "-gt"])
                        .path(output)
                        .arg("-force"),
                )
                .await?;
        }
        Ok(())
    }

    async fn register_region(
        &self,
        item: &WorkItem,
        region: &str,
        reference_nii: &Path,
        out: &mut StepOutputs,
    ) -> std::result::Result<PathBuf, StepError> {
        tracing::info!(item = %item, region, "Transforming ROI");
        let roi_dir = self.env.roi_dir(item);
        let binarized = roi_dir.join(format!("{region}_binarized.nii.gz"));
        let registered_nii = roi_dir.join(format!("{}.nii.gz", dwi_name(region)));
        let registered = self.registered(item, region);

        self.binarize(&self.template(region), &binarized, out).await?;
        self.env
            .run(
                CommandSpec::new("antsApplyTransforms")
                    .args(["-d", "3"])
                    .arg("-i")
                    .path(&binarized)
                    .arg("-r")
                    .path(reference_nii)
                    .arg("-t")
                    .path(self.affine(item))
                    .arg("-o")
                    .path(&registered_nii)
                    .args(["-n", "NearestNeighbor"]),
            )
            .await?;
        self.env
            .run(
                CommandSpec::new("mrconvert")
                    .path(&registered_nii)
                    .path(&registered)
                    .arg("-force"),
            )
            .await?;
        let _ = tokio::fs::remove_file(&binarized).await;
        Ok(registered)
    }

    /// Label each hemisphere's regions into one image; voxels already
    /// labelled keep their first label.
    async fn parcellate(&self, item: &WorkItem, hemi: &str, out: &mut StepOutputs) -> std::result::Result<PathBuf, StepError> {
        let roi_dir = self.env.roi_dir(item);
        let target = parcellation(&self.env, item, hemi);
        let regions: Vec<(usize, PathBuf)> = self
            .env
            .config
            .rois
            .parcellation_order
            .iter()
            .enumerate()
            .map(|(i, name)| (i + 1, roi_dir.join(format!("{hemi}_{name}_DWI.mif"))))
            .collect();

        let Some((_, first)) = regions.iter().find(|(_, roi)| roi.exists()) else {
            return Err(StepError::failed(format!(
                "No registered ROIs for the {} hemisphere",
                hemisphere_name(hemi)
            )));
        };
        self.env
            .run(
                CommandSpec::new("mrcalc")
                    .path(first)
                    .args(["0", "-mult"])
                    .path(&target)
                    .arg("-force"),
            )
            .await?;

        for (label, roi) in &regions {
            if !roi.exists() {
                out.warn(format!("ROI file not found: {}", roi.display()));
                continue;
            }
            let staged = roi_dir.join(format!("temp_parc_{hemi}_{label}.mif"));
            self.env
                .run(
                    CommandSpec::new("mrcalc")
                        .path(roi)
                        .args(["1", "-eq"])
                        .path(&target)
                        .args(["0", "-eq", "-mult"])
                        .arg(label.to_string())
                        .arg("-mult")
                        .path(&target)
                        .arg("-add")
                        .path(&staged)
                        .arg("-force"),
                )
                .await?;
            tokio::fs::rename(&staged, &target).await.at(&staged)?;
        }
        Ok(target)
    }

    async fn register(&self, item: &WorkItem, out: &mut StepOutputs) -> std::result::Result<(), StepError> {
        self.check_inputs(item)?;
        let roi_dir = self.env.roi_dir(item);
        ensure_dir(&roi_dir).await?;

        let reference_nii = roi_dir.join("temp_reference.nii.gz");
        self.env
            .run(
                CommandSpec::new("mrconvert")
                    .path(self.reference(item))
                    .path(&reference_nii)
                    .arg("-force"),
            )
            .await?;

        let regions = &self.env.config.rois.regions;
        for region in regions {
            let registered = self
                .register_region(item, region, &reference_nii, out)
                .await?;
            out.push(registered);
        }
        let _ = tokio::fs::remove_file(&reference_nii).await;

        for hemi in HEMISPHERES {
            let parc = self.parcellate(item, hemi, out).await?;
            out.push(parc);
        }

        out.metric("rois_transformed", regions.len());
        out.metric("parcellations_created", HEMISPHERES.len());
        Ok(())
    }
}

#[async_trait]
impl Step for RoiRegistration {
    fn name(&self) -> &str {
        "roi_registration"
    }

    fn force_overwrite(&self) -> bool {
        self.env.force_overwrite()
    }

    fn expected_outputs(&self, item: &WorkItem) -> Vec<PathBuf> {
        let mut outputs: Vec<PathBuf> = self
            .env
            .config
            .rois
            .regions
            .iter()
            .map(|region| self.registered(item, region))
            .collect();
        outputs.extend(HEMISPHERES.iter().map(|hemi| parcellation(&self.env, item, hemi)));
        outputs
    }

    fn prerequisites(&self, item: &WorkItem) -> Vec<PathBuf> {
        let mut paths = vec![self.affine(item), self.reference(item)];
        paths.extend(self.env.config.rois.regions.iter().map(|r| self.template(r)));
        paths
    }

    async fn execute(&self, item: &WorkItem) -> Result<StepResult> {
        let start = Instant::now();
        let mut out = StepOutputs::new();
        let outcome = self.register(item, &mut out).await;
        Ok(finish(self.name(), item, out, outcome, start.elapsed()))
    }
}
