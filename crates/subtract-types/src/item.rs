use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One processing unit: a subject, optionally narrowed to a single session.
///
/// Two items are equal iff both fields match. An item with a session always
/// resolves to a different output area than the session-less item for the
/// same subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItem {
    pub subject_id: String,
    pub session_id: Option<String>,
}

impl WorkItem {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            session_id: None,
        }
    }

    pub fn with_session(subject_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            session_id: Some(session_id.into()),
        }
    }

    /// Result-map key: `"001"` or `"001_ses-01"`.
    pub fn key(&self) -> String {
        match &self.session_id {
            Some(ses) => format!("{}_ses-{}", self.subject_id, ses),
            None => self.subject_id.clone(),
        }
    }

    /// File-name prefix shared by every product of this item.
    pub fn file_prefix(&self) -> String {
        match &self.session_id {
            Some(ses) => format!("sub-{}_ses-{}", self.subject_id, ses),
            None => format!("sub-{}", self.subject_id),
        }
    }

    /// The item's exclusive output area below `analysis_root`.
    pub fn output_dir(&self, analysis_root: &Path) -> PathBuf {
        let subject = analysis_root.join(format!("sub-{}", self.subject_id));
        match &self.session_id {
            Some(ses) => subject.join(format!("ses-{ses}")),
            None => subject,
        }
    }

    /// `<output_dir>/dwi`, where every diffusion product lives.
    pub fn dwi_dir(&self, analysis_root: &Path) -> PathBuf {
        self.output_dir(analysis_root).join("dwi")
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(ses) => write!(f, "sub-{} ses-{}", self.subject_id, ses),
            None => write!(f, "sub-{}", self.subject_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_items_resolve_to_distinct_dirs() {
        let root = Path::new("/derivatives/subtract");
        let plain = WorkItem::new("001");
        let ses = WorkItem::with_session("001", "baseline");

        assert_eq!(plain.output_dir(root), root.join("sub-001"));
        assert_eq!(ses.output_dir(root), root.join("sub-001").join("ses-baseline"));
        assert_ne!(plain.output_dir(root), ses.output_dir(root));
        assert_ne!(plain, ses);
    }

    #[test]
    fn keys_and_prefixes() {
        let ses = WorkItem::with_session("001", "02");
        assert_eq!(ses.key(), "001_ses-02");
        assert_eq!(ses.file_prefix(), "sub-001_ses-02");
        assert_eq!(ses.to_string(), "sub-001 ses-02");

        let plain = WorkItem::new("abc");
        assert_eq!(plain.key(), "abc");
        assert_eq!(plain.file_prefix(), "sub-abc");
        assert_eq!(
            plain.dwi_dir(Path::new("/a")),
            PathBuf::from("/a/sub-abc/dwi")
        );
    }

    #[test]
    fn equality_requires_both_fields() {
        assert_eq!(WorkItem::new("1"), WorkItem::new("1"));
        assert_eq!(
            WorkItem::with_session("1", "a"),
            WorkItem::with_session("1", "a")
        );
        assert_ne!(
            WorkItem::with_session("1", "a"),
            WorkItem::with_session("1", "b")
        );
    }
}
