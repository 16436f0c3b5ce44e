//! Processing steps and the batch runner for SubTract.
//!
//! This crate holds the step contract (skip-on-existing-outputs caching and
//! structured failures), the built-in diffusion MRI steps, the step registry,
//! and the runner that sequences steps per work item and fans out across
//! items, plus batch summaries, progress events and the persisted run report.

pub mod events;
pub mod registry;
pub mod report;
pub mod runner;
pub mod step;
pub mod steps;
pub mod summary;

#[cfg(test)]
mod testing;

pub use events::{EventEmitter, PipelineEvent};
pub use registry::{builtin_registry, StepRegistry};
pub use report::{load_report, save_report, RunReport, REPORT_FILE};
pub use runner::{BatchResults, FanOut, ItemResults, PipelineRunner, CRITICAL_STEPS};
pub use step::{Step, StepEnv};
pub use summary::{item_succeeded, PipelineSummary, StepStats};
