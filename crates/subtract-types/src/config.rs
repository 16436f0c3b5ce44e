//! Run configuration.
//!
//! A [`SubtractConfig`] is built once (from YAML, from a dataset root, or
//! from a flat project directory) and then shared read-only by the catalog,
//! the runner, and every step.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Result, SubtractError};

/// Steps executed when the configuration does not name any.
pub const DEFAULT_STEPS: &[&str] = &[
    "copy_data",
    "denoise",
    "topup",
    "eddy",
    "mdt",
    "mrtrix_prep",
    "tractography",
    "sift2",
    "roi_registration",
    "connectome",
];

/// Top-level configuration for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtractConfig {
    pub paths: PathConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub rois: RoiConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default = "default_steps")]
    pub steps_to_run: Vec<String>,
    /// Regex a subject id must fully match to be processed.
    #[serde(default)]
    pub subject_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathConfig {
    pub base_path: PathBuf,
    pub data_dir: PathBuf,
    pub analysis_dir: PathBuf,
    pub result_dir: PathBuf,
    pub script_dir: PathBuf,
}

/// How raw data is laid out on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Session allow-list; `None` means every session found.
    #[serde(default)]
    pub sessions: Option<Vec<String>>,
    #[serde(default = "default_dwi_suffixes")]
    pub dwi_suffixes: Vec<String>,
    #[serde(default = "default_pe_directions")]
    pub phase_encoding_directions: Vec<String>,
    #[serde(default = "default_anat_suffixes")]
    pub anat_suffixes: Vec<String>,
    /// File whose presence at the data root marks a hierarchical dataset.
    #[serde(default = "default_marker_file")]
    pub marker_file: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            sessions: None,
            dwi_suffixes: default_dwi_suffixes(),
            phase_encoding_directions: default_pe_directions(),
            anat_suffixes: default_anat_suffixes(),
            marker_file: default_marker_file(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_n_threads")]
    pub n_threads: usize,
    /// Worker-pool size for parallel batches; falls back to `n_threads`.
    #[serde(default)]
    pub n_jobs: Option<usize>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub force_overwrite: bool,
    #[serde(default = "default_topup_config")]
    pub topup_config: String,
    /// Total readout time override in seconds.
    #[serde(default)]
    pub readout_time: Option<f64>,
    #[serde(default = "default_true")]
    pub eddy_cuda: bool,
    #[serde(default = "default_eddy_method")]
    pub eddy_method: String,
    #[serde(default = "default_bet_threshold")]
    pub bet_threshold: f64,
    #[serde(default = "default_n_tracks")]
    pub n_tracks: u64,
    #[serde(default = "default_cutoff")]
    pub track_cutoff: f64,
    #[serde(default = "default_cutoff")]
    pub sift2_ndi_threshold: f64,
    #[serde(default = "default_true")]
    pub sift2_output_mu: bool,
    #[serde(default = "default_true")]
    pub sift2_output_coeffs: bool,
    #[serde(default = "default_mdt_models")]
    pub mdt_models: Vec<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            n_threads: default_n_threads(),
            n_jobs: None,
            parallel: false,
            force_overwrite: false,
            topup_config: default_topup_config(),
            readout_time: None,
            eddy_cuda: true,
            eddy_method: default_eddy_method(),
            bet_threshold: default_bet_threshold(),
            n_tracks: default_n_tracks(),
            track_cutoff: default_cutoff(),
            sift2_ndi_threshold: default_cutoff(),
            sift2_output_mu: true,
            sift2_output_coeffs: true,
            mdt_models: default_mdt_models(),
        }
    }
}

impl ProcessingConfig {
    /// Label used in track file names: `1M`, `1500K`, `250`.
    ///
    /// Exact for every count, so runs with different track counts never
    /// share products.
    pub fn track_label(&self) -> String {
        match self.n_tracks {
            n if n >= 1_000_000 && n % 1_000_000 == 0 => format!("{}M", n / 1_000_000),
            n if n >= 1_000 && n % 1_000 == 0 => format!("{}K", n / 1_000),
            n => n.to_string(),
        }
    }

    /// Requested worker-pool size before clamping to the number of items.
    pub fn worker_limit(&self) -> usize {
        self.n_jobs.unwrap_or(self.n_threads).max(1)
    }
}

/// Template regions of interest and how they are combined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiConfig {
    /// Template ROI names; each is `<template_dir>/<name>.nii.gz`.
    #[serde(default = "default_roi_regions")]
    pub regions: Vec<String>,
    /// Directory of template ROIs; defaults to `<base_path>/ROIs`.
    #[serde(default)]
    pub template_dir: Option<PathBuf>,
    /// Region labels in parcellation order (label value = position + 1).
    #[serde(default = "default_parcellation_order")]
    pub parcellation_order: Vec<String>,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            regions: default_roi_regions(),
            template_dir: None,
            parcellation_order: default_parcellation_order(),
        }
    }
}

/// Where external commands run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Wrap every command in `conda run -n <env>`.
    #[default]
    Conda,
    /// Run tools straight from `PATH`.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub mode: DispatchMode,
    #[serde(default = "default_conda_executable")]
    pub conda_executable: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            conda_executable: default_conda_executable(),
        }
    }
}

fn default_steps() -> Vec<String> {
    DEFAULT_STEPS.iter().map(|s| s.to_string()).collect()
}

fn default_dwi_suffixes() -> Vec<String> {
    vec!["dwi".into()]
}

fn default_pe_directions() -> Vec<String> {
    ["AP", "PA", "LR", "RL"].iter().map(|s| s.to_string()).collect()
}

fn default_anat_suffixes() -> Vec<String> {
    ["T1w", "T2w", "FLAIR", "PD"].iter().map(|s| s.to_string()).collect()
}

fn default_marker_file() -> String {
    "dataset_description.json".into()
}

fn default_n_threads() -> usize {
    24
}

fn default_topup_config() -> String {
    "b02b0.cnf".into()
}

fn default_true() -> bool {
    true
}

fn default_eddy_method() -> String {
    "eddy_cuda10.2".into()
}

fn default_bet_threshold() -> f64 {
    0.2
}

fn default_n_tracks() -> u64 {
    1_000_000
}

fn default_cutoff() -> f64 {
    0.1
}

fn default_mdt_models() -> Vec<String> {
    vec!["NODDIDA".into(), "BallStick_r1".into()]
}

fn default_roi_regions() -> Vec<String> {
    let mut regions = Vec::new();
    for name in ["amygdala", "hippocampus", "vmPFC", "insula", "hypothalamus", "bnst"] {
        for hemi in ["L", "R"] {
            regions.push(format!("{hemi}_{name}_fsaverage"));
        }
    }
    regions
}

fn default_parcellation_order() -> Vec<String> {
    ["amygdala", "hippocampus", "vmPFC", "insula", "hypothalamus"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_conda_executable() -> String {
    "conda".into()
}

// ---------------------------------------------------------------------------
// Constructors and persistence
// ---------------------------------------------------------------------------

impl SubtractConfig {
    /// Defaults for everything but the paths.
    pub fn new(paths: PathConfig) -> Self {
        Self {
            paths,
            layout: LayoutConfig::default(),
            processing: ProcessingConfig::default(),
            rois: RoiConfig::default(),
            dispatch: DispatchConfig::default(),
            steps_to_run: default_steps(),
            subject_filter: None,
        }
    }

    /// Configuration for a hierarchical dataset rooted at `root`.
    ///
    /// Outputs go to `<parent>/derivatives/subtract`, results below that,
    /// and scripts/templates live in `<parent>/code`.
    pub fn from_bids_dataset(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let parent = root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let analysis_dir = parent.join("derivatives").join("subtract");
        Self::new(PathConfig {
            base_path: parent.clone(),
            data_dir: root,
            result_dir: analysis_dir.join("results"),
            analysis_dir,
            script_dir: parent.join("code"),
        })
    }

    /// Configuration for a flat project directory with
    /// `Data/`, `Analysis/`, `Results/` and `Scripts/`.
    pub fn from_flat_layout(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        Self::new(PathConfig {
            data_dir: base.join("Data"),
            analysis_dir: base.join("Analysis"),
            result_dir: base.join("Results"),
            script_dir: base.join("Scripts"),
            base_path: base,
        })
    }

    /// Load a YAML configuration. Relative paths are resolved against the
    /// directory containing the file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SubtractError::MissingPath(path.to_path_buf()));
        }
        let body = std::fs::read_to_string(path)?;
        let mut config: SubtractConfig = serde_yaml::from_str(&body)?;
        let anchor = path.parent().unwrap_or_else(|| Path::new("."));
        config.paths.resolve_against(anchor);
        if let Some(dir) = config.rois.template_dir.as_mut() {
            if dir.is_relative() {
                *dir = anchor.join(&*dir);
            }
        }
        config.validate()?;
        tracing::debug!(path = %path.display(), steps = config.steps_to_run.len(), "Configuration loaded");
        Ok(config)
    }

    /// Write the configuration as YAML, creating parent directories.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_yaml::to_string(self)?;
        std::fs::write(path, body)?;
        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Reject values no run could use.
    pub fn validate(&self) -> Result<()> {
        if self.processing.n_threads == 0 {
            return Err(SubtractError::Config("n_threads must be at least 1".into()));
        }
        if self.processing.n_jobs == Some(0) {
            return Err(SubtractError::Config("n_jobs must be at least 1".into()));
        }
        if self.processing.n_tracks == 0 {
            return Err(SubtractError::Config("n_tracks must be positive".into()));
        }
        Ok(())
    }

    /// Check the input roots and create the output roots.
    pub fn prepare_output_dirs(&self) -> Result<()> {
        for required in [&self.paths.base_path, &self.paths.data_dir] {
            if !required.exists() {
                return Err(SubtractError::MissingPath(required.clone()));
            }
        }
        std::fs::create_dir_all(&self.paths.analysis_dir)?;
        std::fs::create_dir_all(&self.paths.result_dir)?;
        Ok(())
    }

    /// Directory holding the template ROIs.
    pub fn roi_template_dir(&self) -> PathBuf {
        self.rois
            .template_dir
            .clone()
            .unwrap_or_else(|| self.paths.base_path.join("ROIs"))
    }
}

impl PathConfig {
    fn resolve_against(&mut self, anchor: &Path) {
        for p in [
            &mut self.base_path,
            &mut self.data_dir,
            &mut self.analysis_dir,
            &mut self.result_dir,
            &mut self.script_dir,
        ] {
            if p.is_relative() {
                *p = anchor.join(&*p);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
