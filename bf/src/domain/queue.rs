//! Queue entry domain type
//!
//! One row per pending/running workflow instance for a board item. Entries
//! in `waiting_validation` do not count against the per-item running cap.

use std::collections::HashMap;

use boardstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::generate_id;

/// Status of a queued workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Pending,
    Running,
    WaitingValidation,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::WaitingValidation => write!(f, "waiting_validation"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// One workflow instance waiting for, or holding, an item's execution slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Queue id, minted at enqueue time
    pub id: String,

    /// Board item this entry serializes against
    pub external_item_id: i64,

    /// Owning task, once known
    pub task_id: Option<String>,

    /// Run created for this entry, once started
    pub run_id: Option<String>,

    /// Webhook payload that produced the entry
    pub payload: Value,

    /// Queue priority 1-10, higher first
    pub priority: u8,

    pub status: QueueStatus,

    /// Opaque reference to the dispatched execution
    pub dispatch_ref: Option<String>,

    pub error: Option<String>,

    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,

    pub updated_at: i64,
}

impl QueueEntry {
    pub fn new(external_item_id: i64, payload: Value, priority: u8) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("queue"),
            external_item_id,
            task_id: None,
            run_id: None,
            payload,
            priority: priority.clamp(1, 10),
            status: QueueStatus::Pending,
            dispatch_ref: None,
            error: None,
            queued_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Builder method to attach the owning task
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Builder method to attach a pre-created run (reactivations)
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Transition to running, stamping the start time
    pub fn mark_running(&mut self, dispatch_ref: impl Into<String>) {
        let now = now_ms();
        self.status = QueueStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.dispatch_ref = Some(dispatch_ref.into());
        self.updated_at = now;
    }

    /// Release the running slot while a human decides
    pub fn mark_waiting_validation(&mut self) {
        self.status = QueueStatus::WaitingValidation;
        self.updated_at = now_ms();
    }

    /// Terminal transition
    pub fn finish(&mut self, status: QueueStatus, error: Option<String>) {
        let now = now_ms();
        self.status = status;
        self.error = error;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Whether the entry has reached a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled | QueueStatus::Timeout
        )
    }
}

impl Record for QueueEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "queue_entries"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "external_item_id".to_string(),
            IndexValue::Int(self.external_item_id),
        );
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("priority".to_string(), IndexValue::Int(self.priority as i64));
        fields.insert("queued_at".to_string(), IndexValue::Int(self.queued_at));
        fields
    }
}
