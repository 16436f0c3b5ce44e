use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use subtract_dispatch::CommandSpec;
use subtract_types::{Result, StepError, StepOutputs, StepResult, WorkItem};

use crate::step::{finish, Step, StepEnv};
use crate::steps::{hemisphere_name, tracks, HEMISPHERES};

/// Anatomically constrained probabilistic tractography with `tckgen`,
/// seeded from the grey/white-matter interface, one track file per
/// hemisphere.
pub struct Tractography {
    env: Arc<StepEnv>,
}

impl Tractography {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    async fn generate(&self, item: &WorkItem, out: &mut StepOutputs) -> std::result::Result<(), StepError> {
        self.check_inputs(item)?;
        let mrtrix_dir = self.env.mrtrix_dir(item);
        let processing = &self.env.config.processing;

        for hemi in HEMISPHERES {
            tracing::info!(item = %item, hemisphere = hemisphere_name(hemi), "Generating tracks");
            let track_file = tracks(&self.env, item, hemi);
            self.env
                .run(
                    CommandSpec::new("tckgen")
                        .arg("-act")
                        .path(mrtrix_dir.join("5tt_coreg_fs_ants.mif"))
                        .arg("-backtrack")
                        .arg("-seed_gmwmi")
                        .path(mrtrix_dir.join("gmwmSeed_coreg_fs_ants.mif"))
                        .arg("-nthreads")
                        .arg(self.env.threads())
                        .arg("-select")
                        .arg(processing.n_tracks.to_string())
                        .arg("-cutoff")
                        .arg(processing.track_cutoff.to_string())
                        .arg("-force")
                        .path(mrtrix_dir.join("wmfod_norm.mif"))
                        .path(&track_file)
                        .cwd(&mrtrix_dir),
                )
                .await?;
            out.push(track_file);
        }

        out.metric("track_files_generated", HEMISPHERES.len());
        out.metric("total_tracks", processing.n_tracks);
        Ok(())
    }
}

#[async_trait]
impl Step for Tractography {
    fn name(&self) -> &str {
        "tractography"
    }

    fn force_overwrite(&self) -> bool {
        self.env.force_overwrite()
    }

    fn expected_outputs(&self, item: &WorkItem) -> Vec<PathBuf> {
        HEMISPHERES
            .iter()
            .map(|hemi| tracks(&self.env, item, hemi))
            .collect()
    }

    fn prerequisites(&self, item: &WorkItem) -> Vec<PathBuf> {
        let dir = self.env.mrtrix_dir(item);
        ["wmfod_norm.mif", "5tt_coreg_fs_ants.mif", "gmwmSeed_coreg_fs_ants.mif"]
            .iter()
            .map(|name| dir.join(name))
            .collect()
    }

    async fn execute(&self, item: &WorkItem) -> Result<StepResult> {
        let start = Instant::now();
        let mut out = StepOutputs::new();
        let outcome = self.generate(item, &mut out).await;
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
    async fn one_tckgen_per_hemisphere_with_configured_count() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.processing.n_tracks = 500_000;
        let (env, dispatcher) = env_with(config, RecordingDispatcher::new());
        let item = WorkItem::new("01");
        let step = Tractography::new(env.clone());
        touch_all(&step.prerequisites(&item));

        let result = step.execute(&item).await.unwrap();
        assert!(result.is_success(), "{:?}", result.error_message());

        let calls = dispatcher.calls_to("tckgen");
        assert_eq!(calls.len(), 2);
        assert!(calls[0].args.contains(&"500000".to_string()));
        assert!(calls[0].args.last().unwrap().ends_with("tracks_500K_BNST_L.tck"));
        assert!(calls[1].args.last().unwrap().ends_with("tracks_500K_BNST_R.tck"));
        assert_eq!(result.outputs(), step.expected_outputs(&item).as_slice());
    }

    #[tokio::test]
    async fn missing_seed_image_fails_before_tckgen() {
        let tmp = TempDir::new().unwrap();
        let (env, dispatcher) = env_with(test_config(tmp.path()), RecordingDispatcher::new());
        let item = WorkItem::new("01");
        let step = Tractography::new(env.clone());
        touch_all(&step.prerequisites(&item)[..2]);

        let result = step.execute(&item).await.unwrap();
        assert!(!result.is_success());
        assert!(result.error_message().unwrap().contains("gmwmSeed_coreg_fs_ants.mif"));
        assert!(dispatcher.calls().is_empty());
    }

    #[test]
    fn other_track_count_does_not_reuse_existing_tracks() {
        let tmp = TempDir::new().unwrap();
        let step_with = |n_tracks| {
            let mut config = test_config(tmp.path());
            config.processing.n_tracks = n_tracks;
            Tractography::new(env_with(config, RecordingDispatcher::new()).0)
        };
        let item = WorkItem::new("01");
        let million = step_with(1_000_000);
        let more = step_with(1_500_000);
        touch_all(&million.expected_outputs(&item));

        assert!(million.should_skip(&item));
        assert_ne!(million.expected_outputs(&item), more.expected_outputs(&item));
        assert!(!more.should_skip(&item), "1.5M-track run must not reuse 1M tracks");
    }
}
