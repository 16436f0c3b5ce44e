//! Shared fixtures for the crate's unit tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use subtract_catalog::SubjectCatalog;
use subtract_dispatch::{CommandOutput, CommandSpec, RecordingDispatcher};
use subtract_types::{DispatchMode, SubtractConfig};

use crate::step::StepEnv;

pub(crate) fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"").unwrap();
}

pub(crate) fn touch_all(paths: &[PathBuf]) {
    for p in paths {
        touch(p);
    }
}

/// Hierarchical dataset at `<root>/raw` with outputs under
/// `<root>/derivatives/subtract`.
pub(crate) fn test_config(root: &Path) -> SubtractConfig {
    let raw = root.join("raw");
    touch(&raw.join("dataset_description.json"));
    let mut config = SubtractConfig::from_bids_dataset(&raw);
    config.processing.n_threads = 2;
    config.dispatch.mode = DispatchMode::Direct;
    config
}

pub(crate) fn env_with(
    config: SubtractConfig,
    dispatcher: RecordingDispatcher,
) -> (Arc<StepEnv>, Arc<RecordingDispatcher>) {
    let catalog = Arc::new(SubjectCatalog::new(&config).unwrap());
    let dispatcher = Arc::new(dispatcher);
    let env = StepEnv::new(Arc::new(config), dispatcher.clone(), catalog);
    (Arc::new(env), dispatcher)
}

pub(crate) fn test_env(root: &Path) -> (Arc<StepEnv>, Arc<RecordingDispatcher>) {
    env_with(test_config(root), RecordingDispatcher::new())
}

/// Raw AP/PA acquisitions (with companions) for `sub-<subject>`.
pub(crate) fn raw_dual_pe(root: &Path, subject: &str) {
    let dwi = root.join(format!("raw/sub-{subject}/dwi"));
    for dir in ["AP", "PA"] {
        for ext in ["nii.gz", "bval", "bvec", "json"] {
            touch(&dwi.join(format!("sub-{subject}_dir-{dir}_dwi.{ext}")));
        }
    }
}

const OUTPUT_EXTENSIONS: [&str; 7] = [".mif", ".nii.gz", ".txt", ".tck", ".csv", ".mat", ".prtcl"];

/// Create every not-yet-existing file argument of `spec` (resolved against
/// its working directory) whose directory exists.
pub(crate) fn materialize_outputs(spec: &CommandSpec) {
    for arg in &spec.args {
        let value = arg.rsplit('=').next().unwrap_or(arg);
        if !OUTPUT_EXTENSIONS.iter().any(|ext| value.ends_with(ext)) {
            continue;
        }
        let path = match &spec.cwd {
            Some(cwd) => cwd.join(value),
            None => PathBuf::from(value),
        };
        if !path.exists() && path.parent().is_some_and(Path::is_dir) {
            std::fs::write(&path, b"").unwrap();
        }
    }
}

/// Dispatcher whose tools "produce" their file arguments, so steps that
/// move or check tool products see them.
pub(crate) fn materializing() -> RecordingDispatcher {
    RecordingDispatcher::with_responder(|spec| {
        materialize_outputs(spec);
        Ok(CommandOutput::default())
    })
}
