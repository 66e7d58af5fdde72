//! Stage execution records
//!
//! One row per invocation of a stage inside a run. The output column holds
//! a full snapshot of the run context so a crashed run can resume from its
//! last successful stage.

use std::collections::HashMap;

use boardstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::generate_id;

/// Named steps of the workflow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Prepare,
    Analyze,
    Implement,
    Test,
    Debug,
    Qa,
    FinalizePr,
    HumanValidation,
    Merge,
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Analyze => write!(f, "analyze"),
            Self::Implement => write!(f, "implement"),
            Self::Test => write!(f, "test"),
            Self::Debug => write!(f, "debug"),
            Self::Qa => write!(f, "qa"),
            Self::FinalizePr => write!(f, "finalize_pr"),
            Self::HumanValidation => write!(f, "human_validation"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

/// Outcome of a stage invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Succeeded,
    Failed,
    Skipped,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// One invocation of a stage inside a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub id: String,

    /// Owning run
    pub run_id: String,

    /// Which stage ran
    pub stage: StageName,

    /// Position within the run; strictly increasing
    pub ordinal: u32,

    /// Context snapshot the stage started from
    pub input: Value,

    /// Context snapshot after the stage finished
    pub output: Value,

    pub status: StageStatus,

    /// Error text when the stage failed
    pub error: Option<String>,

    pub started_at: i64,
    pub ended_at: Option<i64>,

    pub updated_at: i64,
}

impl StageExecution {
    /// Record the start of a stage
    pub fn started(run_id: impl Into<String>, stage: StageName, ordinal: u32, input: Value) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("stage"),
            run_id: run_id.into(),
            stage,
            ordinal,
            input,
            output: Value::Null,
            status: StageStatus::Started,
            error: None,
            started_at: now,
            ended_at: None,
            updated_at: now,
        }
    }

    /// Mark success, snapshotting the resulting context
    pub fn succeed(&mut self, output: Value) {
        let now = now_ms();
        self.output = output;
        self.status = StageStatus::Succeeded;
        self.ended_at = Some(now);
        self.updated_at = now;
    }

    /// Mark failure with an error message
    pub fn fail(&mut self, error: impl Into<String>) {
        let now = now_ms();
        self.status = StageStatus::Failed;
        self.error = Some(error.into());
        self.ended_at = Some(now);
        self.updated_at = now;
    }

    /// Mark skipped (e.g. stage not applicable for this run)
    pub fn skip(&mut self, reason: impl Into<String>) {
        let now = now_ms();
        self.status = StageStatus::Skipped;
        self.error = Some(reason.into());
        self.ended_at = Some(now);
        self.updated_at = now;
    }
}

impl Record for StageExecution {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "stage_executions"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("run_id".to_string(), IndexValue::String(self.run_id.clone()));
        fields.insert("stage".to_string(), IndexValue::String(self.stage.to_string()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("ordinal".to_string(), IndexValue::Int(self.ordinal as i64));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_name_display() {
        assert_eq!(StageName::FinalizePr.to_string(), "finalize_pr");
        assert_eq!(StageName::HumanValidation.to_string(), "human_validation");
        assert_eq!(StageName::Qa.to_string(), "qa");
    }

    #[test]
    fn test_stage_name_serde() {
        let json = serde_json::to_string(&StageName::FinalizePr).unwrap();
        assert_eq!(json, "\"finalize_pr\"");
        let stage: StageName = serde_json::from_str("\"human_validation\"").unwrap();
        assert_eq!(stage, StageName::HumanValidation);
    }

    #[test]
    fn test_stage_execution_lifecycle() {
        let mut exec = StageExecution::started("run_1", StageName::Prepare, 1, json!({"k": "v"}));
        assert_eq!(exec.status, StageStatus::Started);
        assert!(exec.ended_at.is_none());

        exec.succeed(json!({"workdir": "/tmp/x"}));
        assert_eq!(exec.status, StageStatus::Succeeded);
        assert!(exec.ended_at.is_some());
        assert_eq!(exec.output["workdir"], "/tmp/x");
    }

    #[test]
    fn test_stage_execution_failure() {
        let mut exec = StageExecution::started("run_1", StageName::Test, 4, Value::Null);
        exec.fail("tests failed: 3 of 10");
        assert_eq!(exec.status, StageStatus::Failed);
        assert!(exec.error.as_deref().unwrap().contains("tests failed"));
    }

    #[test]
    fn test_stage_execution_indexed_fields() {
        let exec = StageExecution::started("run_1", StageName::Analyze, 2, Value::Null);
        let fields = exec.indexed_fields();
        assert_eq!(fields.get("run_id"), Some(&IndexValue::String("run_1".into())));
        assert_eq!(fields.get("ordinal"), Some(&IndexValue::Int(2)));
        assert_eq!(fields.get("stage"), Some(&IndexValue::String("analyze".into())));
    }
}
