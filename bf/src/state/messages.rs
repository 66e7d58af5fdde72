//! State manager messages
//!
//! Commands and responses for the actor pattern.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{
    QueueEntry, Run, StageExecution, Task, ValidationRequest, ValidationResponse, WebhookEvent,
};

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

impl From<boardstore::StoreError> for StateError {
    fn from(e: boardstore::StoreError) -> Self {
        StateError::StoreError(e.to_string())
    }
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

type Reply<T> = oneshot::Sender<StateResponse<T>>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Task operations
    CreateTask {
        task: Task,
        reply: Reply<String>,
    },
    GetTask {
        id: String,
        reply: Reply<Option<Task>>,
    },
    GetTaskByItem {
        external_item_id: i64,
        reply: Reply<Option<Task>>,
    },
    UpdateTask {
        task: Task,
        reply: Reply<()>,
    },
    ListTasks {
        status_filter: Option<String>,
        reply: Reply<Vec<Task>>,
    },

    // Run operations
    CreateRun {
        run: Run,
        reply: Reply<String>,
    },
    GetRun {
        id: String,
        reply: Reply<Option<Run>>,
    },
    UpdateRun {
        run: Run,
        reply: Reply<()>,
    },
    ListRuns {
        task_filter: Option<String>,
        status_filter: Option<String>,
        reply: Reply<Vec<Run>>,
    },

    // Stage execution operations
    CreateStage {
        stage: StageExecution,
        reply: Reply<String>,
    },
    UpdateStage {
        stage: StageExecution,
        reply: Reply<()>,
    },
    ListStages {
        run_id: String,
        reply: Reply<Vec<StageExecution>>,
    },

    // Validation operations
    CreateValidation {
        request: ValidationRequest,
        reply: Reply<String>,
    },
    GetValidation {
        id: String,
        reply: Reply<Option<ValidationRequest>>,
    },
    UpdateValidation {
        request: ValidationRequest,
        reply: Reply<()>,
    },
    CreateValidationResponse {
        response: ValidationResponse,
        reply: Reply<String>,
    },
    ListValidationsForRun {
        run_id: String,
        reply: Reply<Vec<ValidationRequest>>,
    },

    // Webhook event log (month-partitioned)
    RecordWebhook {
        event: WebhookEvent,
        reply: Reply<String>,
    },
    UpdateWebhook {
        event: WebhookEvent,
        reply: Reply<()>,
    },
    FindWebhookByExternalId {
        source: String,
        external_event_id: String,
        reply: Reply<Option<WebhookEvent>>,
    },
    DropWebhookPartitionsBefore {
        cutoff_ms: i64,
        reply: Reply<usize>,
    },

    // Queue entries
    UpsertQueueEntry {
        entry: QueueEntry,
        reply: Reply<()>,
    },
    GetQueueEntry {
        id: String,
        reply: Reply<Option<QueueEntry>>,
    },
    ListQueueEntries {
        status_filter: Option<String>,
        queued_after: Option<i64>,
        reply: Reply<Vec<QueueEntry>>,
    },

    // Shutdown
    Shutdown,
}
