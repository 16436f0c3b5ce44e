//! Step registry: maps step names to shared [`Step`] instances.

use std::sync::Arc;

use indexmap::IndexMap;

use subtract_types::WorkItem;

use crate::step::{Step, StepEnv};
use crate::steps;

/// Name-keyed collection of steps, in registration order.
///
/// Built once before a run and read-only afterwards, so it is shared across
/// workers behind an `Arc`.
#[derive(Default)]
pub struct StepRegistry {
    steps: IndexMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under its own name, replacing any previous one.
    pub fn register(&mut self, step: impl Step + 'static) {
        self.register_arc(Arc::new(step));
    }

    pub fn register_arc(&mut self, step: Arc<dyn Step>) {
        let name = step.name().to_string();
        if self.steps.insert(name.clone(), step).is_some() {
            tracing::debug!(step = %name, "Replaced registered step");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Whether `name`'s expected outputs all exist for `item`, ignoring
    /// force-overwrite. `None` when no such step is registered.
    pub fn outputs_complete(&self, name: &str, item: &WorkItem) -> Option<bool> {
        self.steps.get(name).map(|step| step.outputs_complete(item))
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Registry with every built-in processing step, in pipeline order.
pub fn builtin_registry(env: Arc<StepEnv>) -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.register(steps::CopyData::new(env.clone()));
    registry.register(steps::Denoise::new(env.clone()));
    registry.register(steps::Degibbs::new(env.clone()));
    registry.register(steps::Topup::new(env.clone()));
    registry.register(steps::Eddy::new(env.clone()));
    registry.register(steps::Mdt::new(env.clone()));
    registry.register(steps::MrtrixPrep::new(env.clone()));
    registry.register(steps::Tractography::new(env.clone()));
    registry.register(steps::Sift2::new(env.clone()));
    registry.register(steps::RoiRegistration::new(env.clone()));
    registry.register(steps::Connectome::new(env));
    registry
}
