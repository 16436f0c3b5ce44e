//! Step results: the immutable outcome of one step for one work item.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::StepError;

/// Outcome of running one step for one [`WorkItem`](crate::WorkItem).
///
/// `error_message` is present exactly when `success` is false. The
/// constructors are the only way to build one, and deserialization rejects
/// records that break the pairing.
/// Outputs may be recorded on failure (partial products) but are only
/// meaningful when the result is successful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StepResultRecord")]
pub struct StepResult {
    success: bool,
    outputs: Vec<PathBuf>,
    metrics: BTreeMap<String, serde_json::Value>,
    #[serde(with = "duration_secs")]
    execution_time: Duration,
    error_message: Option<String>,
    warnings: Vec<String>,
}

impl StepResult {
    /// A successful result with the given products.
    pub fn succeeded(outputs: Vec<PathBuf>) -> Self {
        Self {
            success: true,
            outputs,
            metrics: BTreeMap::new(),
            execution_time: Duration::ZERO,
            error_message: None,
            warnings: Vec::new(),
        }
    }

    /// A failed result carrying `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            outputs: Vec::new(),
            metrics: BTreeMap::new(),
            execution_time: Duration::ZERO,
            error_message: Some(message.into()),
            warnings: Vec::new(),
        }
    }

    /// Result recorded when a step's expected outputs already exist.
    pub fn skipped(outputs: Vec<PathBuf>) -> Self {
        Self::succeeded(outputs).with_metric("skipped", true)
    }

    /// Translate an anticipated step failure.
    pub fn from_step_error(err: &StepError) -> Self {
        let mut result = Self::failed(err.to_string()).with_metric("error_kind", err.kind());
        if let StepError::Command(cmd) = err {
            if let Some(code) = cmd.exit_code() {
                result = result.with_metric("exit_code", code);
            }
        }
        result
    }

    pub fn with_execution_time(mut self, elapsed: Duration) -> Self {
        self.execution_time = elapsed;
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// Attach partial products to a failed result.
    pub fn with_outputs(mut self, outputs: Vec<PathBuf>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn outputs(&self) -> &[PathBuf] {
        &self.outputs
    }

    pub fn metrics(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metrics
    }

    pub fn metric(&self, key: &str) -> Option<&serde_json::Value> {
        self.metrics.get(key)
    }

    /// True when this result was recorded without executing the step.
    pub fn was_skipped(&self) -> bool {
        self.metric("skipped").and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

// ---------------------------------------------------------------------------
// StepOutputs — what a step body accumulates before it is sealed
// ---------------------------------------------------------------------------

/// Products, metrics and warnings gathered while a step runs.
#[derive(Debug, Clone, Default)]
pub struct StepOutputs {
    pub outputs: Vec<PathBuf>,
    pub metrics: BTreeMap<String, serde_json::Value>,
    pub warnings: Vec<String>,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, output: impl Into<PathBuf>) {
        self.outputs.push(output.into());
    }

    pub fn extend(&mut self, outputs: impl IntoIterator<Item = PathBuf>) {
        self.outputs.extend(outputs);
    }

    pub fn metric(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.metrics.insert(key.into(), value.into());
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!("{warning}");
        self.warnings.push(warning);
    }

    /// Seal into a successful [`StepResult`].
    pub fn into_result(self, elapsed: Duration) -> StepResult {
        StepResult {
            success: true,
            outputs: self.outputs,
            metrics: self.metrics,
            execution_time: elapsed,
            error_message: None,
            warnings: self.warnings,
        }
    }
}

/// Unchecked wire form of a [`StepResult`].
#[derive(Deserialize)]
struct StepResultRecord {
    success: bool,
    #[serde(default)]
    outputs: Vec<PathBuf>,
    #[serde(default)]
    metrics: BTreeMap<String, serde_json::Value>,
    #[serde(with = "duration_secs")]
    execution_time: Duration,
    error_message: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

impl TryFrom<StepResultRecord> for StepResult {
    type Error = String;

    fn try_from(record: StepResultRecord) -> std::result::Result<Self, Self::Error> {
        match (record.success, &record.error_message) {
            (true, Some(message)) => {
                return Err(format!("successful step result carries an error message: {message}"));
            }
            (false, None) => return Err("failed step result has no error message".to_string()),
            _ => {}
        }
        Ok(Self {
            success: record.success,
            outputs: record.outputs,
            metrics: record.metrics,
            execution_time: record.execution_time,
            error_message: record.error_message,
            warnings: record.warnings,
        })
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandError;

    #[test]
    fn error_message_present_iff_failed() {
        let ok = StepResult::succeeded(vec![PathBuf::from("/a")]);
        assert!(ok.is_success());
        assert!(ok.error_message().is_none());

        let bad = StepResult::failed("boom");
        assert!(!bad.is_success());
        assert_eq!(bad.error_message(), Some("boom"));
    }

    #[test]
    fn skipped_is_success_with_marker() {
        let r = StepResult::skipped(vec![PathBuf::from("/x")]);
        assert!(r.is_success());
        assert!(r.was_skipped());
        assert!(!StepResult::succeeded(vec![]).was_skipped());
    }

    #[test]
    fn command_failure_records_exit_code() {
        let err = StepError::Command(CommandError::Exited {
            command: "topup".into(),
            exit_code: 2,
            stderr: "field map diverged".into(),
        });
        let r = StepResult::from_step_error(&err);
        assert!(!r.is_success());
        assert!(r.error_message().unwrap().contains("field map diverged"));
        assert_eq!(r.metric("exit_code"), Some(&serde_json::json!(2)));
        assert_eq!(r.metric("error_kind"), Some(&serde_json::json!("command_failed")));
    }

    #[test]
    fn outputs_seal_into_success() {
        let mut out = StepOutputs::new();
        out.push("/a/b.nii.gz");
        out.metric("files_processed", 1);
        out.warn("missing json side-car");
        let r = out.into_result(Duration::from_millis(1500));

        assert!(r.is_success());
        assert_eq!(r.outputs(), &[PathBuf::from("/a/b.nii.gz")]);
        assert_eq!(r.warnings().len(), 1);
        assert_eq!(r.execution_time(), Duration::from_millis(1500));
    }

    #[test]
    fn serializes_execution_time_as_seconds() {
        let r = StepResult::succeeded(vec![]).with_execution_time(Duration::from_millis(2500));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["execution_time"], serde_json::json!(2.5));

        let back: StepResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn rejects_records_that_break_the_error_pairing() {
        let silent_failure = serde_json::json!({
            "success": false,
            "outputs": [],
            "metrics": {},
            "execution_time": 1.0,
            "error_message": null,
            "warnings": [],
        });
        let err = serde_json::from_value::<StepResult>(silent_failure).unwrap_err();
        assert!(err.to_string().contains("no error message"));

        let noisy_success = serde_json::json!({
            "success": true,
            "outputs": [],
            "metrics": {},
            "execution_time": 1.0,
            "error_message": "boom",
            "warnings": [],
        });
        assert!(serde_json::from_value::<StepResult>(noisy_success).is_err());

        let failed = StepResult::failed("boom").with_outputs(vec![PathBuf::from("/partial")]);
        let back: StepResult = serde_json::from_value(serde_json::to_value(&failed).unwrap()).unwrap();
        assert_eq!(back, failed);
    }
}
