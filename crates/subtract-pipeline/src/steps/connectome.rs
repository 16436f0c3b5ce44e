use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use subtract_dispatch::CommandSpec;
use subtract_types::{Result, StepError, StepOutputs, StepResult, WorkItem};

use crate::step::{ensure_dir, finish, Step, StepEnv};
use crate::steps::{hemisphere_name, model_maps, parcellation, tracks, HEMISPHERES};

pub const MICROSTRUCTURE_FORMULA: &str = "NDI*0.35 + (1-ODI)*0.25 + w_stick0*0.25 + (1-w_ball)*0.15";

/// Microstructure-weighted connectivity fingerprints of each hemisphere's
/// seeded tracks against its parcellation.
pub struct Connectome {
    env: Arc<StepEnv>,
}

impl Connectome {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    /// NDI, ODI, stick and ball fractions, in formula order.
    fn microstructure_maps(&self, item: &WorkItem) -> Vec<PathBuf> {
        let mut maps = model_maps(&self.env, item, "NODDIDA");
        maps.extend(model_maps(&self.env, item, "BallStick_r1"));
        maps
    }

    fn composite(&self, item: &WorkItem) -> PathBuf {
        self.env
            .connectome_dir(item)
            .join("composite_microstructure.mif")
    }

    fn track_weights(&self, item: &WorkItem, hemi: &str) -> PathBuf {
        self.env.connectome_dir(item).join(format!(
            "track_weights_{}_BNST_{hemi}.txt",
            self.env.config.processing.track_label()
        ))
    }

    fn fingerprint(&self, item: &WorkItem, hemi: &str) -> PathBuf {
        self.env
            .connectome_dir(item)
            .join("fingerprints")
            .join(format!("{hemi}_BNST_fingerprint.csv"))
    }

    async fn build(&self, item: &WorkItem, out: &mut StepOutputs) -> std::result::Result<(), StepError> {
        self.check_inputs(item)?;
        let connectome_dir = self.env.connectome_dir(item);
        ensure_dir(&connectome_dir.join("fingerprints")).await?;

        let [ndi, odi, stick, ball] = <[PathBuf; 4]>::try_from(self.microstructure_maps(item))
            .map_err(|_| StepError::failed("Microstructure maps are incomplete"))?;
        let composite = self.composite(item);
        self.env
            .run(
                CommandSpec::new("mrcalc")
                    .path(&ndi)
                    .args(["0.35", "-mult"])
                    .path(&odi)
                    .args(["-neg", "1", "-add", "0.25", "-mult", "-add"])
                    .path(&stick)
                    .args(["0.25", "-mult", "-add"])
                    .path(&ball)
                    .args(["-neg", "1", "-add", "0.15", "-mult", "-add"])
                    .path(&composite)
                    .arg("-force")
                    .cwd(&connectome_dir),
            )
            .await?;
        out.push(composite.clone());

        for hemi in HEMISPHERES {
            tracing::info!(item = %item, hemisphere = hemisphere_name(hemi), "Sampling microstructure");
            let weights = self.track_weights(item, hemi);
            self.env
                .run(
                    CommandSpec::new("tcksample")
                        .path(tracks(&self.env, item, hemi))
                        .path(&composite)
                        .path(&weights)
                        .args(["-stat_tck", "mean"])
                        .cwd(&connectome_dir),
                )
                .await?;
            out.push(weights);
        }

        for hemi in HEMISPHERES {
            tracing::info!(item = %item, hemisphere = hemisphere_name(hemi), "Generating fingerprint");
            let fingerprint = self.fingerprint(item, hemi);
            self.env
                .run(
                    CommandSpec::new("tck2connectome")
                        .path(tracks(&self.env, item, hemi))
                        .path(parcellation(&self.env, item, hemi))
                        .path(&fingerprint)
                        .arg("-scale_invnodevol")
                        .arg("-scale_file")
                        .path(self.track_weights(item, hemi))
                        .args(["-stat_edge", "mean", "-vector", "-force"])
                        .cwd(&connectome_dir),
                )
                .await?;
            out.push(fingerprint);
        }

        out.metric("hemispheres_processed", HEMISPHERES.len());
        out.metric("fingerprints_generated", HEMISPHERES.len());
        out.metric("microstructure_formula", MICROSTRUCTURE_FORMULA);
        Ok(())
    }
}

#[async_trait]
impl Step for Connectome {
    fn name(&self) -> &str {
        "connectome"
    }

    fn force_overwrite(&self) -> bool {
        self.env.force_overwrite()
    }

    fn expected_outputs(&self, item: &WorkItem) -> Vec<PathBuf> {
        let mut outputs = vec![self.composite(item)];
        outputs.extend(HEMISPHERES.iter().map(|hemi| self.track_weights(item, hemi)));
        outputs.extend(HEMISPHERES.iter().map(|hemi| self.fingerprint(item, hemi)));
        outputs
    }

    fn prerequisites(&self, item: &WorkItem) -> Vec<PathBuf> {
        let mut paths = self.microstructure_maps(item);
        paths.extend(HEMISPHERES.iter().map(|hemi| tracks(&self.env, item, hemi)));
        paths.extend(HEMISPHERES.iter().map(|hemi| parcellation(&self.env, item, hemi)));
        paths
    }

    async fn execute(&self, item: &WorkItem) -> Result<StepResult> {
        let start = Instant::now();
        let mut out = StepOutputs::new();
        let outcome = self.build(item, &mut out).await;
        Ok(finish(self.name(), item, out, outcome, start.elapsed()))
    }
}
