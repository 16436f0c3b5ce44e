//! Batch aggregation. Order-independent: the same per-item results give the
//! same summary however the batch was scheduled.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::runner::{BatchResults, ItemResults};

/// An item succeeded iff every recorded step succeeded. An item with no
/// recorded steps counts as successful.
pub fn item_succeeded(results: &ItemResults) -> bool {
    results.values().all(|r| r.is_success())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepStats {
    pub attempted: usize,
    pub succeeded: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub total_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub success_rate: f64,
    /// Per step, over the items that recorded it.
    pub step_stats: BTreeMap<String, StepStats>,
    pub total_execution_secs: f64,
    pub mean_execution_secs: f64,
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

impl PipelineSummary {
    pub fn from_results(batch: &BatchResults) -> Self {
        let total_items = batch.len();
        let successful_items = batch.values().filter(|r| item_succeeded(r)).count();

        let mut step_stats: BTreeMap<String, StepStats> = BTreeMap::new();
        let mut item_times = Vec::with_capacity(total_items);
        for results in batch.values() {
            let mut item_secs = 0.0;
            for (step, result) in results {
                let stats = step_stats.entry(step.clone()).or_default();
                stats.attempted += 1;
                if result.is_success() {
                    stats.succeeded += 1;
                }
                item_secs += result.execution_time().as_secs_f64();
            }
            item_times.push(item_secs);
        }
        for stats in step_stats.values_mut() {
            stats.success_rate = rate(stats.succeeded, stats.attempted);
        }

        let total_execution_secs: f64 = item_times.iter().sum();
        let mean_execution_secs = if item_times.is_empty() {
            0.0
        } else {
            total_execution_secs / item_times.len() as f64
        };

        Self {
            total_items,
            successful_items,
            failed_items: total_items - successful_items,
            success_rate: rate(successful_items, total_items),
            step_stats,
            total_execution_secs,
            mean_execution_secs,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_items == 0
    }
}

impl fmt::Display for PipelineSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Items: {} total, {} successful, {} failed ({:.1}%)",
            self.total_items,
            self.successful_items,
            self.failed_items,
            self.success_rate * 100.0
        )?;
        writeln!(
            f,
            "Execution time: {:.1}s total, {:.1}s per item",
            self.total_execution_secs, self.mean_execution_secs
        )?;
        for (step, stats) in &self.step_stats {
            writeln!(
                f,
                "  {step:<18} {}/{} ({:.1}%)",
                stats.succeeded,
                stats.attempted,
                stats.success_rate * 100.0
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
