use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use subtract_types::{LayoutConfig, Result, SubtractConfig, SubtractError, WorkItem};

use crate::bids::{self, file_name, AnatFile, DwiFile, FileMatcher};

/// How the raw dataset is organized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetLayout {
    /// `sub-*/[ses-*/]{dwi,anat}/` with a marker file at the root.
    Hierarchical,
    /// One directory per subject, files found by loose name heuristics.
    Flat,
}

/// Enumerates work items in a raw dataset and reports on their data.
///
/// The layout is detected once, at construction, and never changes afterwards.
/// All methods take `&self`, so a catalog can be shared across workers.
#[derive(Debug)]
pub struct SubjectCatalog {
    data_dir: PathBuf,
    analysis_dir: PathBuf,
    layout_config: LayoutConfig,
    filter: Option<Regex>,
    layout: DatasetLayout,
}

impl SubjectCatalog {
    pub fn new(config: &SubtractConfig) -> Result<Self> {
        let filter = config
            .subject_filter
            .as_deref()
            .map(compile_filter)
            .transpose()?;
        let layout = detect_layout(&config.paths.data_dir, &config.layout.marker_file);
        tracing::info!(data_dir = %config.paths.data_dir.display(), ?layout, "Dataset layout selected");

        Ok(Self {
            data_dir: config.paths.data_dir.clone(),
            analysis_dir: config.paths.analysis_dir.clone(),
            layout_config: config.layout.clone(),
            filter,
            layout,
        })
    }

    pub fn layout(&self) -> DatasetLayout {
        self.layout
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn analysis_dir(&self) -> &Path {
        &self.analysis_dir
    }

    pub(crate) fn layout_config(&self) -> &LayoutConfig {
        &self.layout_config
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Subject ids, sorted and unique, narrowed by the subject filter.
    pub fn discover_subjects(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(data_dir = %self.data_dir.display(), error = %e, "Data directory is not readable");
                return Vec::new();
            }
        };

        let subjects: BTreeSet<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                match self.layout {
                    DatasetLayout::Hierarchical => name.strip_prefix("sub-").map(str::to_string),
                    DatasetLayout::Flat if name.starts_with('.') => None,
                    DatasetLayout::Flat => Some(
                        name.strip_prefix("sub-").map(str::to_string).unwrap_or(name),
                    ),
                }
            })
            .filter(|id| !id.is_empty() && self.matches_filter(id))
            .collect();

        tracing::info!(count = subjects.len(), data_dir = %self.data_dir.display(), "Discovered subjects");
        subjects.into_iter().collect()
    }

    fn matches_filter(&self, subject_id: &str) -> bool {
        self.filter.as_ref().map_or(true, |re| re.is_match(subject_id))
    }

    /// Session ids for a subject; empty for flat datasets or subjects
    /// without a session level.
    pub fn subject_sessions(&self, subject_id: &str) -> Vec<String> {
        if self.layout == DatasetLayout::Flat {
            return Vec::new();
        }
        let dir = self.data_dir.join(format!("sub-{subject_id}"));
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let allowed: Option<Vec<&str>> = self
            .layout_config
            .sessions
            .as_ref()
            .map(|list| list.iter().map(|s| s.strip_prefix("ses-").unwrap_or(s)).collect());

        let mut sessions: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                e.file_name()
                    .to_string_lossy()
                    .strip_prefix("ses-")
                    .map(str::to_string)
            })
            .filter(|ses| allowed.as_ref().map_or(true, |a| a.contains(&ses.as_str())))
            .collect();
        sessions.sort();
        sessions
    }

    /// One item per (subject, session), or per subject when it has none.
    pub fn expand_work_items(&self, subjects: &[String]) -> Vec<WorkItem> {
        let mut items = Vec::new();
        for subject in subjects {
            let sessions = self.subject_sessions(subject);
            if sessions.is_empty() {
                items.push(WorkItem::new(subject.clone()));
            } else {
                items.extend(
                    sessions
                        .into_iter()
                        .map(|ses| WorkItem::with_session(subject.clone(), ses)),
                );
            }
        }
        items
    }

    /// Every work item in the dataset.
    pub fn work_items(&self) -> Vec<WorkItem> {
        self.expand_work_items(&self.discover_subjects())
    }

    // -----------------------------------------------------------------------
    // Raw data lookup
    // -----------------------------------------------------------------------

    /// Raw directory of a subject, if it exists.
    pub fn raw_subject_dir(&self, subject_id: &str) -> Option<PathBuf> {
        let candidates = match self.layout {
            DatasetLayout::Hierarchical => vec![self.data_dir.join(format!("sub-{subject_id}"))],
            DatasetLayout::Flat => vec![
                self.data_dir.join(subject_id),
                self.data_dir.join(format!("sub-{subject_id}")),
            ],
        };
        candidates.into_iter().find(|p| p.is_dir())
    }

    /// Raw directory of an item (the session directory when there is one).
    pub fn raw_item_dir(&self, item: &WorkItem) -> Option<PathBuf> {
        let subject = self.raw_subject_dir(&item.subject_id)?;
        match &item.session_id {
            Some(ses) => {
                let dir = subject.join(format!("ses-{ses}"));
                dir.is_dir().then_some(dir)
            }
            None => Some(subject),
        }
    }

    /// Directory holding the item's raw diffusion data.
    pub fn raw_dwi_dir(&self, item: &WorkItem) -> Option<PathBuf> {
        let base = self.raw_item_dir(item)?;
        let dwi = base.join("dwi");
        match self.layout {
            DatasetLayout::Hierarchical => dwi.is_dir().then_some(dwi),
            DatasetLayout::Flat if dwi.is_dir() => Some(dwi),
            DatasetLayout::Flat => Some(base),
        }
    }

    /// Raw diffusion images of an item with their companions.
    pub fn dwi_files(&self, item: &WorkItem) -> Result<Vec<DwiFile>> {
        let Some(dir) = self.raw_dwi_dir(item) else {
            return Ok(Vec::new());
        };
        match self.layout {
            DatasetLayout::Hierarchical => {
                bids::find_dwi_files(&dir, &self.layout_config.dwi_suffixes)
            }
            DatasetLayout::Flat => {
                let matcher = FileMatcher::new(["*.nii.gz", "*.nii"])?;
                Ok(matcher
                    .files_in(&dir)
                    .into_iter()
                    .filter(|p| file_name(p).to_lowercase().contains("dwi"))
                    .map(DwiFile::from_image)
                    .collect())
            }
        }
    }

    /// Raw anatomical images of an item.
    pub fn anat_files(&self, item: &WorkItem) -> Result<Vec<AnatFile>> {
        let Some(base) = self.raw_item_dir(item) else {
            return Ok(Vec::new());
        };
        bids::find_anat_files(&base.join("anat"), &self.layout_config.anat_suffixes)
    }

    /// Phase-encoding label of a raw image, if one can be determined.
    pub fn phase_encoding_direction(&self, dwi: &DwiFile) -> Option<String> {
        let allowed = &self.layout_config.phase_encoding_directions;
        dwi.phase_encoding_direction(allowed).or_else(|| match self.layout {
            DatasetLayout::Hierarchical => None,
            DatasetLayout::Flat => direction_token(&dwi.file_name(), allowed),
        })
    }

    /// Raw diffusion images grouped by phase-encoding direction. Images
    /// whose direction cannot be determined are left out.
    pub fn phase_encoding_groups(&self, item: &WorkItem) -> Result<BTreeMap<String, Vec<DwiFile>>> {
        let mut groups: BTreeMap<String, Vec<DwiFile>> = BTreeMap::new();
        for dwi in self.dwi_files(item)? {
            if let Some(dir) = self.phase_encoding_direction(&dwi) {
                groups.entry(dir).or_default().push(dwi);
            }
        }
        Ok(groups)
    }
}

fn compile_filter(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| SubtractError::InvalidFilter {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

fn detect_layout(data_dir: &Path, marker: &str) -> DatasetLayout {
    if data_dir.join(marker).is_file() {
        DatasetLayout::Hierarchical
    } else {
        tracing::warn!(
            data_dir = %data_dir.display(),
            marker,
            "Layout marker not found, falling back to flat layout"
        );
        DatasetLayout::Flat
    }
}

/// First configured direction appearing as a whole token of `name`.
pub(crate) fn direction_token(name: &str, allowed: &[String]) -> Option<String> {
    let tokens: Vec<&str> = name.split(['_', '-', '.']).collect();
    allowed
        .iter()
        .find(|dir| tokens.contains(&dir.as_str()))
        .cloned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
