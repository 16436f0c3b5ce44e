use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use subtract_dispatch::CommandSpec;
use subtract_types::{Result, StepError, StepOutputs, StepResult, WorkItem};

use crate::step::{finish, Step, StepEnv};
use crate::steps::{model_maps, tracks, HEMISPHERES};

/// SIFT2 streamline weighting restricted to tissue with a neurite density
/// above the configured threshold.
pub struct Sift2 {
    env: Arc<StepEnv>,
}

impl Sift2 {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    fn ndi_map(&self, item: &WorkItem) -> Option<PathBuf> {
        model_maps(&self.env, item, "NODDIDA").into_iter().next()
    }

    fn mask(&self, item: &WorkItem) -> PathBuf {
        self.env.mrtrix_dir(item).join("ndi_5tt_mask.mif")
    }

    fn sift_file(&self, item: &WorkItem, kind: &str, hemi: &str) -> PathBuf {
        self.env.mrtrix_dir(item).join(format!(
            "{kind}_{}_BNST_{hemi}.txt",
            self.env.config.processing.track_label()
        ))
    }

    async fn filter(&self, item: &WorkItem, out: &mut StepOutputs) -> std::result::Result<(), StepError> {
        self.check_inputs(item)?;
        let ndi = self
            .ndi_map(item)
            .ok_or_else(|| StepError::failed("No NDI map: NODDIDA is not a known model"))?;
        let mrtrix_dir = self.env.mrtrix_dir(item);
        let fod = mrtrix_dir.join("wmfod_norm.mif");
        let processing = &self.env.config.processing;
        let mask = self.mask(item);

        tracing::info!(threshold = processing.sift2_ndi_threshold, "Creating NDI-weighted mask");
        self.env
            .run(
                CommandSpec::new("mrcalc")
                    .path(&ndi)
                    .arg(processing.sift2_ndi_threshold.to_string())
                    .arg("-gt")
                    .path(mrtrix_dir.join("5tt_coreg_fs_ants.mif"))
                    .arg("-mult")
                    .path(&mask)
                    .arg("-force")
                    .cwd(&mrtrix_dir),
            )
            .await?;
        out.push(mask.clone());

        for hemi in HEMISPHERES {
            let weights = self.sift_file(item, "sift", hemi);
            let mut spec = CommandSpec::new("tcksift2")
                .arg("-proc_mask")
                .path(&mask)
                .arg("-nthreads")
                .arg(self.env.threads())
                .path(tracks(&self.env, item, hemi))
                .path(&fod)
                .path(&weights);
            out.push(weights);
            if processing.sift2_output_mu {
                let mu = self.sift_file(item, "sift_mu", hemi);
                spec = spec.arg("-out_mu").path(&mu);
                out.push(mu);
            }
            if processing.sift2_output_coeffs {
                let coeffs = self.sift_file(item, "sift_coeffs", hemi);
                spec = spec.arg("-out_coeffs").path(&coeffs);
                out.push(coeffs);
            }
            self.env.run(spec.arg("-force").cwd(&mrtrix_dir)).await?;
        }

        out.metric("ndi_threshold", processing.sift2_ndi_threshold);
        out.metric("hemispheres_processed", HEMISPHERES.len());
        Ok(())
    }
}

#[async_trait]
impl Step for Sift2 {
    fn name(&self) -> &str {
        "sift2"
    }

    fn force_overwrite(&self) -> bool {
        self.env.force_overwrite()
    }

    fn expected_outputs(&self, item: &WorkItem) -> Vec<PathBuf> {
        let mut outputs = vec![self.mask(item)];
        outputs.extend(HEMISPHERES.iter().map(|hemi| self.sift_file(item, "sift", hemi)));
        outputs
    }

    fn prerequisites(&self, item: &WorkItem) -> Vec<PathBuf> {
        let dir = self.env.mrtrix_dir(item);
        let mut paths = vec![dir.join("wmfod_norm.mif"), dir.join("5tt_coreg_fs_ants.mif")];
        paths.extend(HEMISPHERES.iter().map(|hemi| tracks(&self.env, item, hemi)));
        paths.extend(self.ndi_map(item));
        paths
    }

    async fn execute(&self, item: &WorkItem) -> Result<StepResult> {
        let start = Instant::now();
        let mut out = StepOutputs::new();
        let outcome = self.filter(item, &mut out).await;
        Ok(finish(self.name(), item, out, outcome, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{env_with, test_config, touch_all};
    use subtract_dispatch::RecordingDispatcher;
    use tempfile::TempDir;

    #[tokio::test]
    async fn mask_then_weights_per_hemisphere() {
        let tmp = TempDir::new().unwrap();
        let (env, dispatcher) = env_with(test_config(tmp.path()), RecordingDispatcher::new());
        let item = WorkItem::new("01");
        let step = Sift2::new(env.clone());
        touch_all(&step.prerequisites(&item));

        let result = step.execute(&item).await.unwrap();
        assert!(result.is_success(), "{:?}", result.error_message());
        assert_eq!(dispatcher.programs(), vec!["mrcalc", "tcksift2", "tcksift2"]);

        let mask = &dispatcher.calls_to("mrcalc")[0];
        assert!(mask.args[0].ends_with("NODDIDA/NDI.nii.gz"));
        assert_eq!(mask.args[1], "0.1");

        let left = &dispatcher.calls_to("tcksift2")[0];
        assert!(left.args.iter().any(|a| a.ends_with("sift_1M_BNST_L.txt")));
        assert!(left.args.contains(&"-out_mu".to_string()));
        assert!(left.args.contains(&"-out_coeffs".to_string()));
        // mask + 3 files per hemisphere
        assert_eq!(result.outputs().len(), 7);
    }

    #[tokio::test]
    async fn optional_outputs_follow_config() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.processing.sift2_output_mu = false;
        config.processing.sift2_output_coeffs = false;
        let (env, dispatcher) = env_with(config, RecordingDispatcher::new());
        let item = WorkItem::new("01");
        let step = Sift2::new(env.clone());
        touch_all(&step.prerequisites(&item));

        let result = step.execute(&item).await.unwrap();
        assert!(result.is_success());
        for call in dispatcher.calls_to("tcksift2") {
            assert!(!call.args.iter().any(|a| a.starts_with("-out_")), "{:?}", call.args);
        }
        assert_eq!(result.outputs(), step.expected_outputs(&item).as_slice());
    }

    #[tokio::test]
    async fn missing_ndi_map_names_it() {
        let tmp = TempDir::new().unwrap();
        let (env, _) = env_with(test_config(tmp.path()), RecordingDispatcher::new());
        let item = WorkItem::new("01");
        let step = Sift2::new(env.clone());
        let prereqs = step.prerequisites(&item);
        touch_all(&prereqs[..prereqs.len() - 1]);

        let result = step.execute(&item).await.unwrap();
        assert!(!result.is_success());
        assert!(result.error_message().unwrap().contains("NDI.nii.gz"));
    }
}
