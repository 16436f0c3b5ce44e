//! Work-item catalog for SubTract.
//!
//! Discovers subjects and sessions in a raw dataset (hierarchical or flat
//! layout), locates their raw diffusion and anatomical files, validates data
//! completeness, and reports per-step processing status.

pub mod bids;
pub mod catalog;
pub mod status;
pub mod validation;

pub use bids::{parse_entities, phase_encoding_label, AnatFile, DwiFile, Entities, FileMatcher};
pub use catalog::{DatasetLayout, SubjectCatalog};
pub use status::DatasetSummary;
pub use validation::ValidationReport;
