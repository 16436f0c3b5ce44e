//! Pipeline runner: configured steps in order for one work item, and a
//! sequential or bounded-parallel fan-out across many.
//!
//! A failed critical step ends its item's sequence; later steps are not
//! attempted and are absent from the item's results. Nothing a step does
//! aborts the batch: errors and panics escaping a step become failed
//! [`StepResult`]s here.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use tokio::sync::Semaphore;

use subtract_types::{ProcessingConfig, StepResult, WorkItem};

use crate::events::{EventEmitter, PipelineEvent};
use crate::registry::StepRegistry;
use crate::step::Step;
use crate::summary::item_succeeded;

/// Steps whose failure makes every later step meaningless for the item.
pub const CRITICAL_STEPS: &[&str] = &["copy_data", "denoise", "eddy"];

/// Step name → result, in execution order.
pub type ItemResults = IndexMap<String, StepResult>;

/// Item key → that item's results, in input order.
pub type BatchResults = IndexMap<String, ItemResults>;

// ---------------------------------------------------------------------------
// Fan-out mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    Sequential,
    /// Up to `limit` items at a time, never more workers than items.
    Parallel { limit: usize },
}

impl FanOut {
    pub fn from_config(processing: &ProcessingConfig) -> Self {
        if processing.parallel {
            FanOut::Parallel {
                limit: processing.worker_limit(),
            }
        } else {
            FanOut::Sequential
        }
    }

    pub fn is_parallel(self) -> bool {
        matches!(self, FanOut::Parallel { .. })
    }

    fn workers(self, items: usize) -> usize {
        match self {
            FanOut::Sequential => 1,
            FanOut::Parallel { limit } => limit.min(items).max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineRunner
// ---------------------------------------------------------------------------

/// Runs a fixed step sequence. Cheap to clone; the registry is shared
/// read-only between workers.
#[derive(Clone)]
pub struct PipelineRunner {
    registry: Arc<StepRegistry>,
    steps: Vec<String>,
    critical: BTreeSet<String>,
    events: Option<EventEmitter>,
}

impl PipelineRunner {
    pub fn new(registry: Arc<StepRegistry>, steps: Vec<String>) -> Self {
        Self {
            registry,
            steps,
            critical: CRITICAL_STEPS.iter().map(|s| s.to_string()).collect(),
            events: None,
        }
    }

    /// Replace the critical set.
    pub fn with_critical<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_events(mut self, emitter: EventEmitter) -> Self {
        self.events = Some(emitter);
        self
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    /// The registered step behind a configured name.
    pub fn step(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.registry.get(name)
    }

    pub fn is_critical(&self, step: &str) -> bool {
        self.critical.contains(step)
    }

    /// Configured names with no registered step.
    pub fn unregistered_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|name| !self.registry.has(name))
            .map(String::as_str)
            .collect()
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Run every configured step for `item`, stopping after a failed
    /// critical step.
    pub async fn run_item(&self, item: &WorkItem) -> ItemResults {
        let key = item.key();
        tracing::info!(item = %item, "Processing item");
        self.emit(PipelineEvent::ItemStarted { item: key.clone() });

        let mut results = ItemResults::new();
        for name in &self.steps {
            let Some(step) = self.registry.get(name) else {
                tracing::warn!(step = %name, "Step not registered, skipping");
                self.emit(PipelineEvent::StepNotRegistered { step: name.clone() });
                continue;
            };

            if step.should_skip(item) {
                tracing::info!(step = %name, item = %item, "Outputs exist, skipping");
                self.emit(PipelineEvent::StepSkipped {
                    item: key.clone(),
                    step: name.clone(),
                });
                results.insert(name.clone(), StepResult::skipped(step.expected_outputs(item)));
                continue;
            }

            self.emit(PipelineEvent::StepStarted {
                item: key.clone(),
                step: name.clone(),
            });
            let result = execute_isolated(step, item).await;

            if result.is_success() {
                self.emit(PipelineEvent::StepCompleted {
                    item: key.clone(),
                    step: name.clone(),
                    duration_ms: result.execution_time().as_millis() as u64,
                });
                results.insert(name.clone(), result);
                continue;
            }

            let critical = self.is_critical(name);
            let error = result.error_message().unwrap_or_default().to_string();
            tracing::error!(step = %name, item = %item, critical, error = %error, "Step failed");
            self.emit(PipelineEvent::StepFailed {
                item: key.clone(),
                step: name.clone(),
                error,
                critical,
            });
            results.insert(name.clone(), result);
            if critical {
                tracing::error!(step = %name, item = %item, "Critical step failed, stopping item");
                break;
            }
        }

        let success = item_succeeded(&results);
        tracing::info!(item = %item, success, steps = results.len(), "Item finished");
        self.emit(PipelineEvent::ItemCompleted {
            item: key,
            success,
            steps_recorded: results.len(),
        });
        results
    }

    /// Run every item. Results come back keyed by item in input order
    /// whatever the completion order was.
    pub async fn run_batch(&self, items: &[WorkItem], fan_out: FanOut) -> BatchResults {
        let started = Instant::now();
        tracing::info!(items = items.len(), steps = ?self.steps, ?fan_out, "Starting batch");
        self.emit(PipelineEvent::BatchStarted {
            items: items.len(),
            steps: self.steps.clone(),
            parallel: fan_out.is_parallel(),
        });

        let batch = match fan_out {
            FanOut::Sequential => {
                let mut batch = BatchResults::new();
                for item in items {
                    let results = self.run_item(item).await;
                    batch.insert(item.key(), results);
                }
                batch
            }
            FanOut::Parallel { .. } => self.run_parallel(items, fan_out.workers(items.len())).await,
        };

        let successful_items = batch.values().filter(|r| item_succeeded(r)).count();
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(items = batch.len(), successful_items, duration_ms, "Batch finished");
        self.emit(PipelineEvent::BatchCompleted {
            items: batch.len(),
            successful_items,
            duration_ms,
        });
        batch
    }

    async fn run_parallel(&self, items: &[WorkItem], workers: usize) -> BatchResults {
        tracing::debug!(workers, "Fanning out");
        let permits = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            let runner = self.clone();
            let item = item.clone();
            let permits = permits.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                runner.run_item(&item).await
            }));
        }

        let mut batch = BatchResults::new();
        for (item, handle) in items.iter().zip(handles) {
            let results = match handle.await {
                Ok(results) => results,
                Err(e) => {
                    tracing::error!(item = %item, error = %e, "Item worker died");
                    let mut results = ItemResults::new();
                    results.insert("runner".to_string(), StepResult::failed(join_error_text(e)));
                    results
                }
            };
            batch.insert(item.key(), results);
        }
        batch
    }
}

// ---------------------------------------------------------------------------
// Step isolation
// ---------------------------------------------------------------------------

/// Execute on its own task so a panic surfaces as a failed result instead of
/// tearing down the item's worker.
async fn execute_isolated(step: Arc<dyn Step>, item: &WorkItem) -> StepResult {
    let name = step.name().to_string();
    let owned = item.clone();
    let task = tokio::spawn(async move { step.execute(&owned).await });
    match task.await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::error!(step = %name, item = %item, error = %e, "Unexpected step error");
            StepResult::failed(e.to_string())
        }
        Err(e) => {
            tracing::error!(step = %name, item = %item, error = %e, "Step panicked");
            StepResult::failed(join_error_text(e))
        }
    }
}

fn join_error_text(err: tokio::task::JoinError) -> String {
    if err.is_panic() {
        format!("panicked: {}", panic_text(err.into_panic()))
    } else {
        err.to_string()
    }
}

fn panic_text(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use subtract_types::{Result, SubtractError};

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Error,
        Panic,
    }

    struct FakeStep {
        name: &'static str,
        behavior: Behavior,
        calls: Arc<AtomicUsize>,
        outputs: Vec<PathBuf>,
    }

    impl FakeStep {
        fn new(name: &'static str, behavior: Behavior) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let step = Self {
                name,
                behavior,
                calls: calls.clone(),
                outputs: Vec::new(),
            };
            (step, calls)
        }
    }

    #[async_trait]
    impl Step for FakeStep {
        fn name(&self) -> &str {
            self.name
        }
        fn force_overwrite(&self) -> bool {
            false
        }
        fn expected_outputs(&self, _item: &WorkItem) -> Vec<PathBuf> {
            self.outputs.clone()
        }
        async fn execute(&self, _item: &WorkItem) -> Result<StepResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => {
                    Ok(StepResult::succeeded(vec![]).with_execution_time(Duration::from_millis(5)))
                }
                Behavior::Fail => Ok(StepResult::failed(format!("{} failed", self.name))),
                Behavior::Error => Err(SubtractError::Config("bad state".into())),
                Behavior::Panic => panic!("boom in {}", self.name),
            }
        }
    }

    fn runner(steps: Vec<(&'static str, Behavior)>) -> (PipelineRunner, Vec<Arc<AtomicUsize>>) {
        let mut registry = StepRegistry::new();
        let mut counters = Vec::new();
        let mut names = Vec::new();
        for (name, behavior) in steps {
            let (step, calls) = FakeStep::new(name, behavior);
            registry.register(step);
            counters.push(calls);
            names.push(name.to_string());
        }
        (PipelineRunner::new(Arc::new(registry), names), counters)
    }

    #[test]
    fn worker_count_is_bounded_by_items() {
        assert_eq!(FanOut::Parallel { limit: 8 }.workers(3), 3);
        assert_eq!(FanOut::Parallel { limit: 2 }.workers(10), 2);
        assert_eq!(FanOut::Parallel { limit: 4 }.workers(0), 1);
        assert_eq!(FanOut::Sequential.workers(10), 1);
    }

    #[test]
    fn fan_out_from_config() {
        let mut processing = ProcessingConfig::default();
        assert_eq!(FanOut::from_config(&processing), FanOut::Sequential);
        processing.parallel = true;
        processing.n_jobs = Some(3);
        assert_eq!(FanOut::from_config(&processing), FanOut::Parallel { limit: 3 });
    }

    #[tokio::test]
    async fn critical_failure_truncates_item() {
        let (runner, calls) = runner(vec![
            ("copy_data", Behavior::Succeed),
            ("denoise", Behavior::Fail),
            ("topup", Behavior::Succeed),
        ]);
        let results = runner.run_item(&WorkItem::new("01")).await;
        assert_eq!(results.keys().collect::<Vec<_>>(), vec!["copy_data", "denoise"]);
        assert_eq!(calls[2].load(Ordering::SeqCst), 0, "topup must not run");
    }

    #[tokio::test]
    async fn non_critical_failure_continues() {
        let (runner, calls) = runner(vec![
            ("topup", Behavior::Fail),
            ("mdt", Behavior::Succeed),
        ]);
        let results = runner.run_item(&WorkItem::new("01")).await;
        assert!(!results["topup"].is_success());
        assert!(results["mdt"].is_success());
        assert_eq!(calls[1].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unexpected_error_becomes_failed_result() {
        let (runner, _) = runner(vec![("mdt", Behavior::Error), ("sift2", Behavior::Succeed)]);
        let results = runner.run_item(&WorkItem::new("01")).await;
        let failed = &results["mdt"];
        assert!(!failed.is_success());
        assert!(failed.error_message().unwrap().contains("bad state"));
        assert_eq!(failed.execution_time(), Duration::ZERO);
        assert!(results.contains_key("sift2"));
    }

    #[tokio::test]
    async fn panic_is_captured_and_critical_check_applies() {
        let (runner, calls) = runner(vec![("eddy", Behavior::Panic), ("mdt", Behavior::Succeed)]);
        let results = runner.run_item(&WorkItem::new("01")).await;
        assert_eq!(results.len(), 1);
        assert!(results["eddy"].error_message().unwrap().contains("boom in eddy"));
        assert_eq!(calls[1].load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unregistered_step_is_skipped_silently() {
        let (runner, _) = runner(vec![("mdt", Behavior::Succeed)]);
        let runner = PipelineRunner::new(
            runner.registry.clone(),
            vec!["nonexistent".into(), "mdt".into()],
        );
        assert_eq!(runner.unregistered_steps(), vec!["nonexistent"]);
        let results = runner.run_item(&WorkItem::new("01")).await;
        assert_eq!(results.keys().collect::<Vec<_>>(), vec!["mdt"]);
        assert!(item_succeeded(&results));
    }

    #[tokio::test]
    async fn existing_outputs_skip_execution() {
        let tmp = tempfile::TempDir::new().unwrap();
        let done = tmp.path().join("done.mif");
        std::fs::write(&done, b"").unwrap();
        let (mut step, calls) = FakeStep::new("mdt", Behavior::Succeed);
        step.outputs = vec![done.clone()];
        let mut registry = StepRegistry::new();
        registry.register(step);
        let runner = PipelineRunner::new(Arc::new(registry), vec!["mdt".into()]);

        let results = runner.run_item(&WorkItem::new("01")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(results["mdt"].was_skipped());
        assert_eq!(results["mdt"].outputs(), &[done]);
    }

    #[tokio::test]
    async fn parallel_batch_keeps_input_order() {
        let (runner, calls) = runner(vec![("mdt", Behavior::Succeed)]);
        let items: Vec<WorkItem> = ["03", "01", "02", "05", "04"].iter().map(|s| WorkItem::new(*s)).collect();
        let batch = runner.run_batch(&items, FanOut::Parallel { limit: 2 }).await;
        assert_eq!(batch.keys().collect::<Vec<_>>(), vec!["03", "01", "02", "05", "04"]);
        assert_eq!(calls[0].load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn events_follow_the_item_lifecycle() {
        let (runner, _) = runner(vec![("copy_data", Behavior::Fail), ("mdt", Behavior::Succeed)]);
        let emitter = EventEmitter::new(64);
        let mut rx = emitter.subscribe();
        let runner = runner.with_events(emitter);
        runner.run_batch(&[WorkItem::new("01")], FanOut::Sequential).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(PipelineEvent::BatchStarted { items: 1, .. })));
        assert!(seen.iter().any(|e| matches!(
            e,
            PipelineEvent::StepFailed { critical: true, step, .. } if step == "copy_data"
        )));
        assert!(!seen.iter().any(|e| matches!(e, PipelineEvent::StepStarted { step, .. } if step == "mdt")));
        assert!(matches!(
            seen.last(),
            Some(PipelineEvent::BatchCompleted { successful_items: 0, .. })
        ));
    }
}
