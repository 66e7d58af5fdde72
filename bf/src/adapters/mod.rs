//! Stage adapters
//!
//! Thin wrappers over the external collaborator calls. The scheduler only
//! sees the [`StageAdapter`] trait and typed per-stage outputs; adapter
//! implementations must be effect-idempotent when retried with the same
//! input, bounded in wall time, and prompt to stop on cancellation.

mod board;
mod codehost;
mod command;
mod stages;

pub use board::{BoardApi, BoardError, BoardUpdate, BoardUser, HttpBoardClient};
pub use codehost::{CodeHost, CodeHostError, GitCliHost};
pub use command::{CommandResult, run_command};
pub use stages::{
    AnalyzeAdapter, DebugAdapter, FinalizePrAdapter, ImplementAdapter, MergeAdapter, PrepareAdapter,
    QaAdapter, TestAdapter,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{AnalysisPlan, PullRequestRef, QaReport, RunContext, StageName, TestReport};
use crate::llm::LlmError;

/// Errors from stage adapter invocations
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Adapter timed out after {0:?}")]
    Timeout(Duration),

    #[error("Adapter cancelled")]
    Cancelled,

    /// Well-formed domain failure (tests failed, no such repo)
    #[error("{message}")]
    Logical { message: String, retryable: bool },

    #[error("Board error: {0}")]
    Board(#[from] BoardError),

    #[error("Code host error: {0}")]
    CodeHost(#[from] CodeHostError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

impl AdapterError {
    /// Whether the scheduler may retry the stage with the same input
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Timeout(_) => true,
            AdapterError::Cancelled => false,
            AdapterError::Logical { retryable, .. } => *retryable,
            AdapterError::Board(e) => e.is_retryable(),
            AdapterError::CodeHost(e) => e.is_retryable(),
            AdapterError::Llm(e) => e.is_retryable(),
        }
    }
}

/// Typed result of a stage invocation
#[derive(Debug, Clone)]
pub enum StageOutput {
    Prepared { workdir: String, branch: String },
    Analyzed { plan: AnalysisPlan },
    Implemented { changed_files: Vec<String> },
    Tested { report: TestReport },
    Debugged { note: String },
    QaChecked { report: QaReport },
    PrFinalized { pr: PullRequestRef },
    Merged { pr_url: String },
}

impl StageOutput {
    /// Fold the output into the run context
    pub fn apply_to(self, ctx: &mut RunContext) {
        match self {
            StageOutput::Prepared { workdir, branch } => {
                ctx.workdir = Some(workdir);
                ctx.branch = Some(branch);
            }
            StageOutput::Analyzed { plan } => {
                ctx.plan = Some(plan);
            }
            StageOutput::Implemented { changed_files } => {
                ctx.changed_files = changed_files;
            }
            StageOutput::Tested { report } => {
                ctx.test_report = Some(report);
            }
            StageOutput::Debugged { .. } => {
                ctx.debug_attempts += 1;
            }
            StageOutput::QaChecked { report } => {
                ctx.qa_report = Some(report);
            }
            StageOutput::PrFinalized { pr } => {
                ctx.pr = Some(pr);
            }
            StageOutput::Merged { pr_url } => {
                if let Some(pr) = &mut ctx.pr {
                    pr.merged = true;
                    pr.url = pr_url;
                }
            }
        }
    }
}

/// One stage of the workflow graph
#[async_trait]
pub trait StageAdapter: Send + Sync {
    /// Which stage this adapter implements
    fn name(&self) -> StageName;

    /// Per-call wall-time budget, enforced by the scheduler
    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    /// Run the stage against the current context
    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, AdapterError>;
}

/// Registry of stage adapters the engine dispatches against
///
/// `human_validation` is not an adapter; the engine suspends and hands
/// control to the validation coordinator there.
pub struct AdapterSet {
    adapters: HashMap<StageName, Arc<dyn StageAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter, replacing any previous one for the stage
    pub fn register(mut self, adapter: Arc<dyn StageAdapter>) -> Self {
        self.adapters.insert(adapter.name(), adapter);
        self
    }

    pub fn get(&self, stage: StageName) -> Option<Arc<dyn StageAdapter>> {
        self.adapters.get(&stage).cloned()
    }
}

impl Default for AdapterSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Run, Task};

    #[test]
    fn test_adapter_error_retryability() {
        assert!(AdapterError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!AdapterError::Cancelled.is_retryable());
        assert!(
            AdapterError::Logical {
                message: "flaky".into(),
                retryable: true
            }
            .is_retryable()
        );
        assert!(
            !AdapterError::Logical {
                message: "no such repo".into(),
                retryable: false
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_stage_output_application() {
        let task = Task::new(1, "t", "d");
        let run = Run::new(&task.id);
        let mut ctx = RunContext::from_task_run(&task, &run);

        StageOutput::Prepared {
            workdir: "/tmp/w".into(),
            branch: "boardflow/run_1".into(),
        }
        .apply_to(&mut ctx);
        assert_eq!(ctx.workdir.as_deref(), Some("/tmp/w"));

        StageOutput::Debugged { note: "retried".into() }.apply_to(&mut ctx);
        StageOutput::Debugged { note: "again".into() }.apply_to(&mut ctx);
        assert_eq!(ctx.debug_attempts, 2);

        StageOutput::PrFinalized {
            pr: PullRequestRef {
                number: 7,
                url: "https://example.com/pr/7".into(),
                branch: "boardflow/run_1".into(),
                merged: false,
            },
        }
        .apply_to(&mut ctx);
        StageOutput::Merged {
            pr_url: "https://example.com/pr/7".into(),
        }
        .apply_to(&mut ctx);
        assert!(ctx.pr.as_ref().unwrap().merged);
    }

    #[test]
    fn test_adapter_set_lookup() {
        let set = AdapterSet::new();
        assert!(set.get(StageName::Prepare).is_none());
    }
}
