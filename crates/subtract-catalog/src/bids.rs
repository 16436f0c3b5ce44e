//! Raw-file enumeration for one acquisition directory.
//!
//! Filenames follow the `key-value_key-value_suffix.ext` convention; entities
//! are parsed out of the name and companion files (`.bval`, `.bvec`, `.json`)
//! are paired with their image by shared stem.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Serialize;
use subtract_types::{Result, SubtractError};

/// Parsed filename entities, e.g. `{"sub": "001", "dir": "AP"}`.
pub type Entities = BTreeMap<String, String>;

const ENTITY_PATTERNS: &[(&str, &str)] = &[
    ("sub", r"sub-([a-zA-Z0-9]+)"),
    ("ses", r"ses-([a-zA-Z0-9]+)"),
    ("task", r"task-([a-zA-Z0-9]+)"),
    ("acq", r"acq-([a-zA-Z0-9]+)"),
    ("ce", r"ce-([a-zA-Z0-9]+)"),
    ("dir", r"dir-([a-zA-Z0-9]+)"),
    ("run", r"run-([0-9]+)"),
    ("mod", r"mod-([a-zA-Z0-9]+)"),
    ("echo", r"echo-([0-9]+)"),
    ("flip", r"flip-([0-9]+)"),
    ("inv", r"inv-([0-9]+)"),
    ("mt", r"mt-([a-zA-Z0-9]+)"),
    ("part", r"part-([a-zA-Z0-9]+)"),
    ("recording", r"recording-([a-zA-Z0-9]+)"),
];

fn entity_regexes() -> &'static [(&'static str, Regex)] {
    static COMPILED: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        ENTITY_PATTERNS
            .iter()
            .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (*name, re)))
            .collect()
    })
}

/// Split a NIfTI filename into `(stem, extension)`; extension keeps its dot.
pub fn split_nifti_name(name: &str) -> (&str, &str) {
    for ext in [".nii.gz", ".nii"] {
        if let Some(stem) = name.strip_suffix(ext) {
            return (stem, ext);
        }
    }
    (name, "")
}

/// Extract entities from a filename.
pub fn parse_entities(filename: &str) -> Entities {
    let (stem, _) = split_nifti_name(filename);
    entity_regexes()
        .iter()
        .filter_map(|(name, re)| {
            re.captures(stem)
                .and_then(|caps| caps.get(1))
                .map(|m| (name.to_string(), m.as_str().to_string()))
        })
        .collect()
}

/// Map a side-car `PhaseEncodingDirection` code to its two-letter label.
pub fn phase_encoding_label(code: &str) -> Option<&'static str> {
    match code {
        "j-" => Some("AP"),
        "j" => Some("PA"),
        "i-" => Some("RL"),
        "i" => Some("LR"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// DwiFile / AnatFile
// ---------------------------------------------------------------------------

/// A diffusion image and its companion files.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DwiFile {
    pub nii: PathBuf,
    pub bval: Option<PathBuf>,
    pub bvec: Option<PathBuf>,
    pub json: Option<PathBuf>,
    pub entities: Entities,
}

impl DwiFile {
    /// Pair `nii` with whatever companions sit beside it.
    pub fn from_image(nii: PathBuf) -> Self {
        let name = file_name(&nii);
        let (stem, _) = split_nifti_name(&name);
        let dir = nii.parent().map(Path::to_path_buf).unwrap_or_default();
        let companion = |ext: &str| {
            let p = dir.join(format!("{stem}.{ext}"));
            p.is_file().then_some(p)
        };
        Self {
            bval: companion("bval"),
            bvec: companion("bvec"),
            json: companion("json"),
            entities: parse_entities(&name),
            nii,
        }
    }

    pub fn file_name(&self) -> String {
        file_name(&self.nii)
    }

    /// Image extension including the leading dot (`.nii.gz` or `.nii`).
    pub fn extension(&self) -> String {
        let name = self.file_name();
        split_nifti_name(&name).1.to_string()
    }

    /// Side-car metadata, if present and parseable.
    pub fn metadata(&self) -> Option<serde_json::Value> {
        let path = self.json.as_ref()?;
        let body = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&body) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable JSON side-car");
                None
            }
        }
    }

    /// Phase-encoding label from the `dir-` entity (when it is one of
    /// `allowed`) or, failing that, from the side-car metadata.
    pub fn phase_encoding_direction(&self, allowed: &[String]) -> Option<String> {
        if let Some(dir) = self.entities.get("dir") {
            if allowed.iter().any(|a| a == dir) {
                return Some(dir.clone());
            }
        }
        let meta = self.metadata()?;
        let code = meta.get("PhaseEncodingDirection")?.as_str()?;
        phase_encoding_label(code).map(str::to_string)
    }
}

/// An anatomical image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnatFile {
    pub nii: PathBuf,
    pub json: Option<PathBuf>,
    pub entities: Entities,
    pub suffix: String,
}

// ---------------------------------------------------------------------------
// Directory scanning
// ---------------------------------------------------------------------------

/// Glob matcher over the file names of a single directory.
pub struct FileMatcher {
    set: GlobSet,
}

impl FileMatcher {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern.as_ref())
                .map_err(|e| SubtractError::Other(format!("bad glob pattern: {e}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| SubtractError::Other(format!("bad glob set: {e}")))?;
        Ok(Self { set })
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.set.is_match(name)
    }

    /// Sorted regular files in `dir` whose names match. A missing or
    /// unreadable directory yields nothing.
    pub fn files_in(&self, dir: &Path) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut matches: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && self.is_match(&file_name(p)))
            .collect();
        matches.sort();
        matches
    }
}

/// Diffusion images named `*_{suffix}.nii[.gz]` in `dir`.
pub fn find_dwi_files(dir: &Path, suffixes: &[String]) -> Result<Vec<DwiFile>> {
    let patterns = suffixes
        .iter()
        .flat_map(|s| [format!("*_{s}.nii.gz"), format!("*_{s}.nii")]);
    let matcher = FileMatcher::new(patterns)?;
    Ok(matcher
        .files_in(dir)
        .into_iter()
        .map(DwiFile::from_image)
        .collect())
}

/// Anatomical images named `*_{suffix}.nii[.gz]` in `dir`.
pub fn find_anat_files(dir: &Path, suffixes: &[String]) -> Result<Vec<AnatFile>> {
    let mut found = Vec::new();
    for suffix in suffixes {
        let matcher = FileMatcher::new([format!("*_{suffix}.nii.gz"), format!("*_{suffix}.nii")])?;
        for nii in matcher.files_in(dir) {
            let name = file_name(&nii);
            let (stem, _) = split_nifti_name(&name);
            let json = nii.with_file_name(format!("{stem}.json"));
            found.push(AnatFile {
                json: json.is_file().then_some(json),
                entities: parse_entities(&name),
                suffix: suffix.clone(),
                nii,
            });
        }
    }
    Ok(found)
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn parses_entities() {
        let e = parse_entities("sub-001_ses-02_acq-multiband_dir-AP_run-1_dwi.nii.gz");
        assert_eq!(e["sub"], "001");
        assert_eq!(e["ses"], "02");
        assert_eq!(e["acq"], "multiband");
        assert_eq!(e["dir"], "AP");
        assert_eq!(e["run"], "1");
        assert!(!e.contains_key("task"));
    }

    #[test]
    fn splits_extensions() {
        assert_eq!(split_nifti_name("a_dwi.nii.gz"), ("a_dwi", ".nii.gz"));
        assert_eq!(split_nifti_name("a_dwi.nii"), ("a_dwi", ".nii"));
        assert_eq!(split_nifti_name("a.bval"), ("a.bval", ""));
    }

    #[test]
    fn finds_both_extensions_and_pairs_companions() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        touch(&dir.join("sub-01_dir-AP_dwi.nii.gz"));
        touch(&dir.join("sub-01_dir-AP_dwi.bval"));
        touch(&dir.join("sub-01_dir-AP_dwi.bvec"));
        touch(&dir.join("sub-01_dir-PA_dwi.nii"));
        touch(&dir.join("sub-01_T1w.nii.gz"));

        let files = find_dwi_files(dir, &["dwi".to_string()]).unwrap();
        assert_eq!(files.len(), 2);

        let ap = files.iter().find(|f| f.entities["dir"] == "AP").unwrap();
        assert!(ap.bval.is_some() && ap.bvec.is_some());
        assert!(ap.json.is_none());
        assert_eq!(ap.extension(), ".nii.gz");

        let pa = files.iter().find(|f| f.entities["dir"] == "PA").unwrap();
        assert!(pa.bval.is_none());
        assert_eq!(pa.extension(), ".nii");
    }

    #[test]
    fn direction_falls_back_to_sidecar() {
        let tmp = TempDir::new().unwrap();
        let nii = tmp.path().join("sub-01_dwi.nii.gz");
        touch(&nii);
        std::fs::write(
            tmp.path().join("sub-01_dwi.json"),
            r#"{"PhaseEncodingDirection": "j-"}"#,
        )
        .unwrap();

        let dwi = DwiFile::from_image(nii);
        let allowed = vec!["AP".to_string(), "PA".to_string()];
        assert_eq!(dwi.phase_encoding_direction(&allowed), Some("AP".into()));
    }

    #[test]
    fn unlisted_dir_entity_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let nii = tmp.path().join("sub-01_dir-XY_dwi.nii.gz");
        touch(&nii);
        let dwi = DwiFile::from_image(nii);
        assert_eq!(dwi.phase_encoding_direction(&["AP".to_string()]), None);
    }

    #[test]
    fn pe_code_mapping() {
        assert_eq!(phase_encoding_label("j-"), Some("AP"));
        assert_eq!(phase_encoding_label("j"), Some("PA"));
        assert_eq!(phase_encoding_label("i-"), Some("RL"));
        assert_eq!(phase_encoding_label("i"), Some("LR"));
        assert_eq!(phase_encoding_label("k"), None);
    }

    #[test]
    fn anat_files_by_suffix() {
        let tmp = TempDir::new().unwrap();
        touch(&tmp.path().join("sub-01_T1w.nii.gz"));
        touch(&tmp.path().join("sub-01_T1w.json"));
        touch(&tmp.path().join("sub-01_FLAIR.nii"));

        let suffixes: Vec<String> = ["T1w", "T2w", "FLAIR"].iter().map(|s| s.to_string()).collect();
        let anat = find_anat_files(tmp.path(), &suffixes).unwrap();
        assert_eq!(anat.len(), 2);
        assert_eq!(anat[0].suffix, "T1w");
        assert!(anat[0].json.is_some());
        assert_eq!(anat[1].suffix, "FLAIR");
    }
}
