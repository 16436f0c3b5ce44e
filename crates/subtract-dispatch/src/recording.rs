use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use subtract_types::CommandError;

use crate::dispatcher::{CommandDispatcher, CommandOutput, CommandSpec};

type Responder = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync>;

// ---------------------------------------------------------------------------
// RecordingDispatcher
// ---------------------------------------------------------------------------

/// Dispatcher that records every command instead of spawning it.
///
/// By default each command succeeds with empty output; a responder can
/// simulate tool behaviour (writing products, failing, printing stdout).
pub struct RecordingDispatcher {
    calls: Mutex<Vec<CommandSpec>>,
    responder: Responder,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::with_responder(|_| Ok(CommandOutput::default()))
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    /// Commands seen so far, in dispatch order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }

    /// Commands whose program is `program`.
    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for RecordingDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandDispatcher for RecordingDispatcher {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        tracing::debug!(command = %spec.display(), "Recorded command");
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.clone());
        (self.responder)(&spec)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
