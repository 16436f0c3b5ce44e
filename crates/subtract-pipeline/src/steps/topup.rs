use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use subtract_dispatch::CommandSpec;
use subtract_types::{IoContext, Result, StepError, StepOutputs, StepResult, WorkItem};

use crate::step::{copy_file, ensure_dir, finish, require, Step, StepEnv};
use crate::steps::{plan_dwi_copies, DwiCopy};

/// Readout time used when neither the side-car nor the configuration has one.
pub const DEFAULT_READOUT_TIME: f64 = 0.0959097;

/// Opposed phase-encoding pairs, in order of preference.
const PE_PAIRS: [(&str, &str); 2] = [("AP", "PA"), ("LR", "RL")];

/// Phase-encoding vector line of the acquisition parameters file.
fn acq_vector(direction: &str) -> &'static str {
    match direction {
        "AP" => "0 1 0",
        "PA" => "0 -1 0",
        "LR" => "1 0 0",
        _ => "-1 0 0",
    }
}

/// Total readout time from BIDS side-car metadata.
pub(crate) fn readout_from_metadata(meta: &serde_json::Value) -> Option<f64> {
    if let Some(t) = meta.get("TotalReadoutTime").and_then(|v| v.as_f64()) {
        return Some(t);
    }
    let spacing = meta.get("EffectiveEchoSpacing")?.as_f64()?;
    let matrix = meta.get("ReconMatrixPE")?.as_f64()?;
    Some((matrix - 1.0) * spacing)
}

/// Susceptibility distortion correction from an opposed phase-encoding pair
/// with FSL `topup` / `applytopup`.
///
/// Items without a pair succeed with a `skipped` metric; the eddy step then
/// reports the missing field estimate.
pub struct Topup {
    env: Arc<StepEnv>,
}

impl Topup {
    pub fn new(env: Arc<StepEnv>) -> Self {
        Self { env }
    }

    fn base(&self, item: &WorkItem) -> PathBuf {
        self.env
            .topup_dir(item)
            .join(format!("{}_dwi_Topup", item.file_prefix()))
    }

    fn corrected(&self, item: &WorkItem, ext: &str) -> PathBuf {
        self.env
            .topup_dir(item)
            .join(format!("{}_topup_dwi{ext}", item.file_prefix()))
    }

    /// Most processed version of a copied image that exists.
    fn source_image(&self, dwi_dir: &Path, copy: &DwiCopy) -> PathBuf {
        [copy.degibbs(dwi_dir), copy.denoised(dwi_dir)]
            .into_iter()
            .find(|p| p.exists())
            .unwrap_or_else(|| copy.image(dwi_dir))
    }

    async fn readout_time(&self, dwi_dir: &Path, pair: [&DwiCopy; 2]) -> f64 {
        for copy in pair {
            let json = copy.companion(dwi_dir, "json");
            let Ok(body) = tokio::fs::read_to_string(&json).await else {
                continue;
            };
            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(meta) => {
                    if let Some(t) = readout_from_metadata(&meta) {
                        return t;
                    }
                }
                Err(e) => tracing::warn!(path = %json.display(), error = %e, "Unreadable side-car"),
            }
        }
        match self.env.config.processing.readout_time {
            Some(t) => t,
            None => {
                tracing::warn!(readout_time = DEFAULT_READOUT_TIME, "Using default readout time");
                DEFAULT_READOUT_TIME
            }
        }
    }

    async fn correct(&self, item: &WorkItem, plan: &[DwiCopy], out: &mut StepOutputs) -> std::result::Result<(), StepError> {
        self.check_inputs(item)?;

        let pair = PE_PAIRS.iter().find_map(|(a, b)| {
            let first = plan.iter().find(|c| c.direction.as_deref() == Some(*a))?;
            let second = plan.iter().find(|c| c.direction.as_deref() == Some(*b))?;
            Some(((*a, *b), [first, second]))
        });
        let Some(((dir_a, dir_b), copies)) = pair else {
            out.warn(format!("{item} has no opposed phase-encoding pair, skipping TopUp"));
            out.metric("skipped", true);
            out.metric("reason", "no_dual_pe");
            return Ok(());
        };

        let dwi_dir = self.env.dwi_dir(item);
        let topup_dir = self.env.topup_dir(item);
        ensure_dir(&topup_dir).await?;
        let prefix = item.file_prefix();
        let inputs = copies.map(|c| self.source_image(&dwi_dir, c));
        crate::step::require_all(&inputs)?;

        let mut b0s = Vec::with_capacity(2);
        for (input, dir) in inputs.iter().zip([dir_a, dir_b]) {
            let b0 = topup_dir.join(format!("{prefix}_dir-{dir}_b0.nii.gz"));
            self.env
                .run(CommandSpec::new("fslroi").path(input).path(&b0).args(["0", "1"]))
                .await?;
            b0s.push(b0);
        }

        let merged = topup_dir.join(format!("{prefix}_dir-{dir_a}-{dir_b}_b0.nii.gz"));
        self.env
            .run(
                CommandSpec::new("fslmerge")
                    .arg("-t")
                    .path(&merged)
                    .path(&b0s[0])
                    .path(&b0s[1]),
            )
            .await?;

        let readout = self.readout_time(&dwi_dir, copies).await;
        let acq_params = topup_dir.join("acq_params.txt");
        let body = format!(
            "{} {readout}\n{} {readout}\n",
            acq_vector(dir_a),
            acq_vector(dir_b)
        );
        tokio::fs::write(&acq_params, body).await.at(&acq_params)?;

        let base = self.base(item);
        self.env
            .run(CommandSpec::new("topup").args([
                format!("--imain={}", merged.display()),
                format!("--datain={}", acq_params.display()),
                format!("--config={}", self.env.config.processing.topup_config),
                format!("--out={}", base.display()),
                format!("--nthr={}", self.env.threads()),
            ]))
            .await?;

        let corrected = self.corrected(item, ".nii.gz");
        self.env
            .run(CommandSpec::new("applytopup").args([
                format!("--imain={}", inputs[0].display()),
                "--inindex=1".to_string(),
                format!("--datain={}", acq_params.display()),
                format!("--topup={}", base.display()),
                "--method=jac".to_string(),
                format!("--out={}", corrected.display()),
            ]))
            .await?;

        for ext in ["bval", "bvec"] {
            let source = copies[0].companion(&dwi_dir, ext);
            require(&source)?;
            let target = self.corrected(item, &format!(".{ext}"));
            copy_file(&source, &target).await?;
            out.push(target);
        }

        out.extend(b0s);
        out.push(merged);
        out.push(acq_params);
        out.push(corrected);
        out.metric("pe_pair", format!("{dir_a}-{dir_b}"));
        out.metric("readout_time", readout);
        out.metric("source_images", inputs.iter().map(|p| p.display().to_string()).collect::<Vec<_>>());
        Ok(())
    }
}

#[async_trait]
impl Step for Topup {
    fn name(&self) -> &str {
        "topup"
    }

    fn force_overwrite(&self) -> bool {
        self.env.force_overwrite()
    }

    fn expected_outputs(&self, item: &WorkItem) -> Vec<PathBuf> {
        let dir = self.env.topup_dir(item);
        let base = self.base(item).display().to_string();
        vec![
            self.corrected(item, ".nii.gz"),
            self.corrected(item, ".bval"),
            self.corrected(item, ".bvec"),
            dir.join("acq_params.txt"),
            PathBuf::from(format!("{base}_fieldcoef.nii.gz")),
            PathBuf::from(format!("{base}_movpar.txt")),
        ]
    }

    fn prerequisites(&self, item: &WorkItem) -> Vec<PathBuf> {
        vec![self.env.dwi_dir(item)]
    }

    async fn execute(&self, item: &WorkItem) -> Result<StepResult> {
        let start = Instant::now();
        let plan = plan_dwi_copies(&self.env, item)?;
        let mut out = StepOutputs::new();
        let outcome = self.correct(item, &plan, &mut out).await;
        Ok(finish(self.name(), item, out, outcome, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{raw_dual_pe, test_env, touch, touch_all};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn readout_prefers_total_then_derived() {
        assert_eq!(readout_from_metadata(&json!({"TotalReadoutTime": 0.05})), Some(0.05));
        let derived = readout_from_metadata(&json!({
            "EffectiveEchoSpacing": 0.001,
            "ReconMatrixPE": 101
        }))
        .unwrap();
        assert!((derived - 0.1).abs() < 1e-9);
        assert_eq!(readout_from_metadata(&json!({"EchoTime": 0.08})), None);
    }

    #[tokio::test]
    async fn corrects_ap_pa_pair() {
        let tmp = TempDir::new().unwrap();
        raw_dual_pe(tmp.path(), "01");
        let (env, dispatcher) = test_env(tmp.path());
        let item = WorkItem::new("01");
        let dwi = env.dwi_dir(&item);
        touch_all(&[
            dwi.join("sub-01_dir-AP_dwi.nii.gz"),
            dwi.join("sub-01_dir-AP_dwi.bval"),
            dwi.join("sub-01_dir-AP_dwi.bvec"),
            dwi.join("sub-01_dir-AP_dwi_denoised.nii.gz"),
            dwi.join("sub-01_dir-PA_dwi.nii.gz"),
            dwi.join("sub-01_dir-PA_dwi_denoised.nii.gz"),
        ]);
        std::fs::write(dwi.join("sub-01_dir-AP_dwi.json"), r#"{"TotalReadoutTime": 0.042}"#).unwrap();

        let result = Topup::new(env.clone()).execute(&item).await.unwrap();
        assert!(result.is_success(), "{:?}", result.error_message());
        assert_eq!(
            dispatcher.programs(),
            vec!["fslroi", "fslroi", "fslmerge", "topup", "applytopup"]
        );

        let fslroi = &dispatcher.calls_to("fslroi")[0];
        assert!(fslroi.args[0].ends_with("sub-01_dir-AP_dwi_denoised.nii.gz"));
        let acq = std::fs::read_to_string(env.topup_dir(&item).join("acq_params.txt")).unwrap();
        assert_eq!(acq, "0 1 0 0.042\n0 -1 0 0.042\n");
        let topup = &dispatcher.calls_to("topup")[0];
        assert!(topup.args.contains(&"--config=b02b0.cnf".to_string()));
        assert!(topup.args.contains(&"--nthr=2".to_string()));
        assert!(env.topup_dir(&item).join("sub-01_topup_dwi.bval").is_file());
        assert_eq!(result.metric("pe_pair"), Some(&json!("AP-PA")));
    }

    #[tokio::test]
    async fn single_direction_is_skipped_successfully() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("raw/sub-02/dwi/sub-02_dir-AP_dwi.nii.gz"));
        let (env, dispatcher) = test_env(tmp.path());
        let item = WorkItem::new("02");
        std::fs::create_dir_all(env.dwi_dir(&item)).unwrap();

        let result = Topup::new(env).execute(&item).await.unwrap();
        assert!(result.is_success());
        assert!(result.was_skipped());
        assert_eq!(result.metric("reason"), Some(&json!("no_dual_pe")));
        assert_eq!(result.warnings().len(), 1);
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn configured_readout_used_without_sidecar() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("raw/sub-03/dwi/sub-03_dir-LR_dwi.nii.gz"));
        touch(&tmp.path().join("raw/sub-03/dwi/sub-03_dir-RL_dwi.nii.gz"));
        let mut config = crate::testing::test_config(tmp.path());
        config.processing.readout_time = Some(0.07);
        let (env, _) = crate::testing::env_with(config, subtract_dispatch::RecordingDispatcher::new());
        let item = WorkItem::new("03");
        let dwi = env.dwi_dir(&item);
        touch_all(&[
            dwi.join("sub-03_dir-LR_dwi.nii.gz"),
            dwi.join("sub-03_dir-LR_dwi.bval"),
            dwi.join("sub-03_dir-LR_dwi.bvec"),
            dwi.join("sub-03_dir-RL_dwi.nii.gz"),
        ]);

        let result = Topup::new(env.clone()).execute(&item).await.unwrap();
        assert!(result.is_success(), "{:?}", result.error_message());
        let acq = std::fs::read_to_string(env.topup_dir(&item).join("acq_params.txt")).unwrap();
        assert_eq!(acq, "1 0 0 0.07\n-1 0 0 0.07\n");
    }
}
