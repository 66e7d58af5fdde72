//! RunContext - the value-typed working state of a run
//!
//! Immutable task inputs plus accumulated stage outputs. Serialized whole
//! into `StageExecution.output` after every stage; recovery is loading the
//! latest snapshot.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::priority::TaskPriority;
use super::run::Run;
use super::task::Task;

/// Structured plan produced by the analyze stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPlan {
    pub summary: String,
    pub file_touches: Vec<String>,
    pub risks: Vec<String>,
    pub ambiguities: Vec<String>,
}

/// Result of a test or debug stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub executed: bool,
    pub passed: bool,
    pub total: u32,
    pub failed: u32,
    pub log_excerpt: String,
}

/// Result of the qa stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QaReport {
    pub passed: bool,
    pub findings: Vec<String>,
}

/// Reference to a pull request on the code host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
    pub branch: String,
    pub merged: bool,
}

/// Working context for one run, rebuilt from the last snapshot on recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    // Immutable inputs from the task
    pub task_id: String,
    pub run_id: String,
    pub external_item_id: i64,
    pub title: String,
    pub description: String,
    pub repository_url: String,
    pub user_language: String,
    pub priority: TaskPriority,
    pub is_reactivation: bool,

    // Accumulated stage outputs
    pub workdir: Option<String>,
    pub branch: Option<String>,
    pub plan: Option<AnalysisPlan>,
    pub changed_files: Vec<String>,
    pub test_report: Option<TestReport>,
    pub debug_attempts: u32,
    pub qa_report: Option<QaReport>,
    pub pr: Option<PullRequestRef>,

    // Validation loop state
    pub modification_instructions: Vec<String>,
    pub rejection_count: u32,
}

impl RunContext {
    /// Build the initial context for a run
    pub fn from_task_run(task: &Task, run: &Run) -> Self {
        let mut description = task.description.clone();
        if let Some(extra) = &run.new_requirements {
            description = format!(
                "[Reactivation {}] New request:\n{}\n\nOriginal description:\n{}",
                task.reactivation_count, extra, task.description
            );
        }

        Self {
            task_id: task.id.clone(),
            run_id: run.id.clone(),
            external_item_id: task.external_item_id,
            title: task.title.clone(),
            description,
            repository_url: task.repository_url.clone(),
            user_language: task.user_language.clone(),
            priority: task.priority,
            is_reactivation: run.is_reactivation,
            workdir: None,
            branch: None,
            plan: None,
            changed_files: Vec::new(),
            test_report: None,
            debug_attempts: 0,
            qa_report: None,
            pr: None,
            modification_instructions: Vec::new(),
            rejection_count: 0,
        }
    }

    /// Serialize for the `StageExecution.output` column
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Rebuild from a persisted snapshot
    pub fn from_snapshot(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Append a rejection's modification instructions
    pub fn add_modification_instructions(&mut self, instructions: impl Into<String>) {
        self.modification_instructions.push(instructions.into());
    }

    /// Whether the tests last ran green
    pub fn tests_passed(&self) -> bool {
        self.test_report.as_ref().map(|r| r.executed && r.passed).unwrap_or(false)
    }
}
