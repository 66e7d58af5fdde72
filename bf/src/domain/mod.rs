//! Domain types for the boardflow orchestrator
//!
//! Entities persisted through boardstore: tasks, runs, stage executions,
//! validation requests/responses, webhook events, and queue entries.

mod context;
mod id;
mod priority;
mod queue;
mod run;
mod stage;
mod task;
mod validation;
mod webhook;

pub use context::{AnalysisPlan, PullRequestRef, QaReport, RunContext, TestReport};
pub use id::generate_id;
pub use priority::TaskPriority;
pub use queue::{QueueEntry, QueueStatus};
pub use run::{Run, RunStatus};
pub use stage::{StageExecution, StageName, StageStatus};
pub use task::{Task, TaskStatus, detect_user_language};
pub use validation::{
    AnalysisMethod, ValidationRequest, ValidationResponse, ValidationStatus, Verdict,
};
pub use webhook::{BoardEvent, BoardWebhookPayload, TaskSeed, WebhookEvent};
