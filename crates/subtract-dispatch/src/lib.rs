//! Command dispatch for SubTract steps.
//!
//! Provides the `CommandDispatcher` trait, the `CommandSpec` builder, the
//! pure tool-to-environment `route` table, and `LocalDispatcher`, which
//! spawns tools either directly or inside their conda environment.
//! `RecordingDispatcher` records commands without running them.

pub mod dispatcher;
pub mod local;
pub mod recording;
pub mod routing;

pub use dispatcher::{decode_output, CommandDispatcher, CommandOutput, CommandSpec, BINARY_PLACEHOLDER};
pub use local::LocalDispatcher;
pub use recording::RecordingDispatcher;
pub use routing::{route, DEFAULT_CONTEXT};
