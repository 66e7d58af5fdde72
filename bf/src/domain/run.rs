//! Run domain type
//!
//! One row per attempted execution of a task, including reactivations.

use std::collections::HashMap;

use boardstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    WaitingValidation,
    Completed,
    Failed,
    Abandoned,
    Timeout,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::WaitingValidation => write!(f, "waiting_validation"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Abandoned => write!(f, "abandoned"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// One end-to-end execution of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier
    pub id: String,

    /// Owning task
    pub task_id: String,

    /// Prior run this one reactivates, if any; must belong to the same task
    pub parent_run_id: Option<String>,

    /// Whether this run was spawned by a follow-up comment
    pub is_reactivation: bool,

    /// Text of the triggering comment, for reactivations
    pub reactivation_context: Option<String>,

    /// Requirements added by the triggering comment
    pub new_requirements: Option<String>,

    /// Current status
    pub status: RunStatus,

    /// Cooperative cancellation flag; the engine stops dispatching stages
    /// once it observes this set
    pub cancel_requested: bool,

    /// URL of the merged pull request, on success
    pub last_merged_pr_url: Option<String>,

    /// Last error message (if any)
    pub last_error: Option<String>,

    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Run {
    /// Create a new run for a task
    pub fn new(task_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("run"),
            task_id: task_id.into(),
            parent_run_id: None,
            is_reactivation: false,
            reactivation_context: None,
            new_requirements: None,
            status: RunStatus::Pending,
            cancel_requested: false,
            last_merged_pr_url: None,
            last_error: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a reactivation run chained to a prior run
    pub fn reactivation(
        task_id: impl Into<String>,
        parent_run_id: impl Into<String>,
        comment_text: impl Into<String>,
    ) -> Self {
        let comment_text = comment_text.into();
        let mut run = Self::new(task_id);
        run.parent_run_id = Some(parent_run_id.into());
        run.is_reactivation = true;
        run.new_requirements = Some(comment_text.clone());
        run.reactivation_context = Some(comment_text);
        run
    }

    /// Transition to a new status, stamping start/completion times
    pub fn set_status(&mut self, status: RunStatus) {
        let now = now_ms();
        if status == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if self.is_terminal_status(status) {
            self.completed_at = Some(now);
        }
        self.status = status;
        self.updated_at = now;
    }

    fn is_terminal_status(&self, status: RunStatus) -> bool {
        matches!(
            status,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Abandoned | RunStatus::Timeout
        )
    }

    /// Set an error
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.updated_at = now_ms();
    }

    /// Request cooperative cancellation
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
        self.updated_at = now_ms();
    }

    /// Whether the run is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.is_terminal_status(self.status)
    }

    /// Whether the run currently counts against the per-item running cap
    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Running
    }
}

impl Record for Run {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "runs"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("task_id".to_string(), IndexValue::String(self.task_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("is_reactivation".to_string(), IndexValue::Bool(self.is_reactivation));
        fields
    }
}
