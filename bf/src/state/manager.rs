//! StateManager - actor that owns the boardstore handle
//!
//! Processes commands via channels for serialized access to persistent
//! state. Every orchestrator decision is preceded by a write through here.

use std::path::Path;

use boardstore::{Filter, FilterOp, Store, now_ms, partitioned_collection};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::domain::{
    QueueEntry, Run, StageExecution, Task, ValidationRequest, ValidationResponse, WebhookEvent,
};

use super::messages::{StateCommand, StateError, StateResponse};

/// Handle to send commands to the StateManager actor
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Open the store at `store_path` and spawn the actor
    pub fn spawn(store_path: impl AsRef<Path>) -> eyre::Result<Self> {
        let store = Store::open(store_path.as_ref())?;
        Ok(Self::spawn_with_store(store))
    }

    /// Spawn over an in-memory store, for tests
    pub fn spawn_in_memory() -> eyre::Result<Self> {
        let store = Store::open_in_memory()?;
        Ok(Self::spawn_with_store(store))
    }

    fn spawn_with_store(mut store: Store) -> Self {
        // Rebuild indexes so status-based queries are correct after restart
        for result in [
            store.rebuild_indexes::<Task>(),
            store.rebuild_indexes::<Run>(),
            store.rebuild_indexes::<QueueEntry>(),
            store.rebuild_indexes::<ValidationRequest>(),
        ] {
            if let Err(e) = result {
                error!(error = %e, "Index rebuild failed");
            }
        }

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Request actor shutdown
    pub async fn shutdown(&self) -> StateResponse<()> {
        self.tx.send(StateCommand::Shutdown).await.map_err(|_| StateError::ChannelError)
    }

    // === Task operations ===

    pub async fn create_task(&self, task: Task) -> StateResponse<String> {
        self.send(|reply| StateCommand::CreateTask { task, reply }).await
    }

    pub async fn get_task(&self, id: &str) -> StateResponse<Option<Task>> {
        let id = id.to_string();
        self.send(|reply| StateCommand::GetTask { id, reply }).await
    }

    pub async fn get_task_required(&self, id: &str) -> Result<Task, StateError> {
        self.get_task(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("Task {}", id)))
    }

    pub async fn get_task_by_item(&self, external_item_id: i64) -> StateResponse<Option<Task>> {
        self.send(|reply| StateCommand::GetTaskByItem {
            external_item_id,
            reply,
        })
        .await
    }

    pub async fn update_task(&self, task: Task) -> StateResponse<()> {
        self.send(|reply| StateCommand::UpdateTask { task, reply }).await
    }

    pub async fn list_tasks(&self, status_filter: Option<String>) -> StateResponse<Vec<Task>> {
        self.send(|reply| StateCommand::ListTasks { status_filter, reply }).await
    }

    // === Run operations ===

    pub async fn create_run(&self, run: Run) -> StateResponse<String> {
        self.send(|reply| StateCommand::CreateRun { run, reply }).await
    }

    pub async fn get_run(&self, id: &str) -> StateResponse<Option<Run>> {
        let id = id.to_string();
        self.send(|reply| StateCommand::GetRun { id, reply }).await
    }

    pub async fn get_run_required(&self, id: &str) -> Result<Run, StateError> {
        self.get_run(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("Run {}", id)))
    }

    pub async fn update_run(&self, run: Run) -> StateResponse<()> {
        self.send(|reply| StateCommand::UpdateRun { run, reply }).await
    }

    pub async fn list_runs(
        &self,
        task_filter: Option<String>,
        status_filter: Option<String>,
    ) -> StateResponse<Vec<Run>> {
        self.send(|reply| StateCommand::ListRuns {
            task_filter,
            status_filter,
            reply,
        })
        .await
    }

    // === Stage executions ===

    pub async fn create_stage(&self, stage: StageExecution) -> StateResponse<String> {
        self.send(|reply| StateCommand::CreateStage { stage, reply }).await
    }

    pub async fn update_stage(&self, stage: StageExecution) -> StateResponse<()> {
        self.send(|reply| StateCommand::UpdateStage { stage, reply }).await
    }

    /// Stage executions of a run, ordered by ordinal
    pub async fn list_stages(&self, run_id: &str) -> StateResponse<Vec<StageExecution>> {
        let run_id = run_id.to_string();
        self.send(|reply| StateCommand::ListStages { run_id, reply }).await
    }

    /// Latest successful stage snapshot of a run, for crash resume
    pub async fn latest_snapshot(&self, run_id: &str) -> StateResponse<Option<StageExecution>> {
        let stages = self.list_stages(run_id).await?;
        Ok(stages
            .into_iter()
            .filter(|s| s.status == crate::domain::StageStatus::Succeeded)
            .max_by_key(|s| s.ordinal))
    }

    // === Validations ===

    pub async fn create_validation(&self, request: ValidationRequest) -> StateResponse<String> {
        self.send(|reply| StateCommand::CreateValidation { request, reply }).await
    }

    pub async fn get_validation(&self, id: &str) -> StateResponse<Option<ValidationRequest>> {
        let id = id.to_string();
        self.send(|reply| StateCommand::GetValidation { id, reply }).await
    }

    pub async fn update_validation(&self, request: ValidationRequest) -> StateResponse<()> {
        self.send(|reply| StateCommand::UpdateValidation { request, reply }).await
    }

    pub async fn create_validation_response(&self, response: ValidationResponse) -> StateResponse<String> {
        self.send(|reply| StateCommand::CreateValidationResponse { response, reply })
            .await
    }

    pub async fn list_validations_for_run(&self, run_id: &str) -> StateResponse<Vec<ValidationRequest>> {
        let run_id = run_id.to_string();
        self.send(|reply| StateCommand::ListValidationsForRun { run_id, reply }).await
    }

    // === Webhook event log ===

    pub async fn record_webhook(&self, event: WebhookEvent) -> StateResponse<String> {
        self.send(|reply| StateCommand::RecordWebhook { event, reply }).await
    }

    pub async fn update_webhook(&self, event: WebhookEvent) -> StateResponse<()> {
        self.send(|reply| StateCommand::UpdateWebhook { event, reply }).await
    }

    pub async fn find_webhook_by_external_id(
        &self,
        source: &str,
        external_event_id: &str,
    ) -> StateResponse<Option<WebhookEvent>> {
        let source = source.to_string();
        let external_event_id = external_event_id.to_string();
        self.send(|reply| StateCommand::FindWebhookByExternalId {
            source,
            external_event_id,
            reply,
        })
        .await
    }

    pub async fn drop_webhook_partitions_before(&self, cutoff_ms: i64) -> StateResponse<usize> {
        self.send(|reply| StateCommand::DropWebhookPartitionsBefore { cutoff_ms, reply })
            .await
    }

    // === Queue entries ===

    pub async fn upsert_queue_entry(&self, entry: QueueEntry) -> StateResponse<()> {
        self.send(|reply| StateCommand::UpsertQueueEntry { entry, reply }).await
    }

    pub async fn get_queue_entry(&self, id: &str) -> StateResponse<Option<QueueEntry>> {
        let id = id.to_string();
        self.send(|reply| StateCommand::GetQueueEntry { id, reply }).await
    }

    pub async fn list_queue_entries(
        &self,
        status_filter: Option<String>,
        queued_after: Option<i64>,
    ) -> StateResponse<Vec<QueueEntry>> {
        self.send(|reply| StateCommand::ListQueueEntries {
            status_filter,
            queued_after,
            reply,
        })
        .await
    }
}

async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    while let Some(command) = rx.recv().await {
        if matches!(command, StateCommand::Shutdown) {
            info!("StateManager shutting down");
            break;
        }
        handle_command(&mut store, command);
    }
}

fn handle_command(store: &mut Store, command: StateCommand) {
    match command {
        StateCommand::CreateTask { task, reply } => {
            let id = task.id.clone();
            let _ = reply.send(store.insert(&task).map(|_| id).map_err(Into::into));
        }
        StateCommand::GetTask { id, reply } => {
            let _ = reply.send(store.get::<Task>(&id).map_err(Into::into));
        }
        StateCommand::GetTaskByItem {
            external_item_id,
            reply,
        } => {
            let result = store
                .list::<Task>(&[Filter::eq("external_item_id", external_item_id)])
                .map(|tasks| tasks.into_iter().next())
                .map_err(Into::into);
            let _ = reply.send(result);
        }
        StateCommand::UpdateTask { task, reply } => {
            let _ = reply.send(store.upsert(&task).map_err(Into::into));
        }
        StateCommand::ListTasks { status_filter, reply } => {
            let filters = status_filter
                .map(|s| vec![Filter::eq("internal_status", s)])
                .unwrap_or_default();
            let _ = reply.send(store.list::<Task>(&filters).map_err(Into::into));
        }

        StateCommand::CreateRun { run, reply } => {
            let id = run.id.clone();
            let _ = reply.send(store.insert(&run).map(|_| id).map_err(Into::into));
        }
        StateCommand::GetRun { id, reply } => {
            let _ = reply.send(store.get::<Run>(&id).map_err(Into::into));
        }
        StateCommand::UpdateRun { run, reply } => {
            let _ = reply.send(store.upsert(&run).map_err(Into::into));
        }
        StateCommand::ListRuns {
            task_filter,
            status_filter,
            reply,
        } => {
            let mut filters = Vec::new();
            if let Some(task_id) = task_filter {
                filters.push(Filter::eq("task_id", task_id));
            }
            if let Some(status) = status_filter {
                filters.push(Filter::eq("status", status));
            }
            let _ = reply.send(store.list::<Run>(&filters).map_err(Into::into));
        }

        StateCommand::CreateStage { stage, reply } => {
            let id = stage.id.clone();
            let _ = reply.send(store.insert(&stage).map(|_| id).map_err(Into::into));
        }
        StateCommand::UpdateStage { stage, reply } => {
            let _ = reply.send(store.upsert(&stage).map_err(Into::into));
        }
        StateCommand::ListStages { run_id, reply } => {
            let result = store
                .list::<StageExecution>(&[Filter::eq("run_id", run_id)])
                .map(|mut stages| {
                    stages.sort_by_key(|s| s.ordinal);
                    stages
                })
                .map_err(Into::into);
            let _ = reply.send(result);
        }

        StateCommand::CreateValidation { request, reply } => {
            let id = request.id.clone();
            let _ = reply.send(store.insert(&request).map(|_| id).map_err(Into::into));
        }
        StateCommand::GetValidation { id, reply } => {
            let _ = reply.send(store.get::<ValidationRequest>(&id).map_err(Into::into));
        }
        StateCommand::UpdateValidation { request, reply } => {
            let _ = reply.send(store.upsert(&request).map_err(Into::into));
        }
        StateCommand::CreateValidationResponse { response, reply } => {
            let id = response.id.clone();
            let _ = reply.send(store.insert(&response).map(|_| id).map_err(Into::into));
        }
        StateCommand::ListValidationsForRun { run_id, reply } => {
            let _ = reply.send(
                store
                    .list::<ValidationRequest>(&[Filter::eq("run_id", run_id)])
                    .map_err(Into::into),
            );
        }

        StateCommand::RecordWebhook { event, reply } => {
            let id = event.id.clone();
            let collection = partitioned_collection("webhook_events", event.received_at);
            let _ = reply.send(store.insert_into(&collection, &event).map(|_| id).map_err(Into::into));
        }
        StateCommand::UpdateWebhook { event, reply } => {
            let collection = partitioned_collection("webhook_events", event.received_at);
            let _ = reply.send(store.upsert_into(&collection, &event).map_err(Into::into));
        }
        StateCommand::FindWebhookByExternalId {
            source,
            external_event_id,
            reply,
        } => {
            let _ = reply.send(find_webhook(store, &source, &external_event_id).map_err(Into::into));
        }
        StateCommand::DropWebhookPartitionsBefore { cutoff_ms, reply } => {
            let _ = reply.send(
                store
                    .drop_partitions_before("webhook_events", cutoff_ms)
                    .map_err(Into::into),
            );
        }

        StateCommand::UpsertQueueEntry { entry, reply } => {
            let _ = reply.send(store.upsert(&entry).map_err(Into::into));
        }
        StateCommand::GetQueueEntry { id, reply } => {
            let _ = reply.send(store.get::<QueueEntry>(&id).map_err(Into::into));
        }
        StateCommand::ListQueueEntries {
            status_filter,
            queued_after,
            reply,
        } => {
            let mut filters = Vec::new();
            if let Some(status) = status_filter {
                filters.push(Filter::eq("status", status));
            }
            if let Some(after) = queued_after {
                filters.push(Filter::new("queued_at", FilterOp::Gt, after));
            }
            let _ = reply.send(store.list::<QueueEntry>(&filters).map_err(Into::into));
        }

        StateCommand::Shutdown => unreachable!("handled in actor_loop"),
    }
}

/// Look up a webhook by external id in the current and previous partition
fn find_webhook(
    store: &Store,
    source: &str,
    external_event_id: &str,
) -> Result<Option<WebhookEvent>, boardstore::StoreError> {
    let now = now_ms();
    let month_ms = 31 * 24 * 3600 * 1000;
    let filters = [
        Filter::eq("source", source),
        Filter::eq("external_event_id", external_event_id),
    ];

    for at in [now, now - month_ms] {
        let collection = partitioned_collection("webhook_events", at);
        let mut found = store.list_in::<WebhookEvent>(&collection, &filters)?;
        if let Some(event) = found.pop() {
            debug!(collection, external_event_id, "Found webhook by external id");
            return Ok(Some(event));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunStatus, StageName, TaskStatus};
    use serde_json::json;

    async fn spawn() -> StateManager {
        StateManager::spawn_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_task_crud_and_item_lookup() {
        let state = spawn().await;

        let task = Task::new(42, "title", "desc");
        let task_id = state.create_task(task.clone()).await.unwrap();
        assert_eq!(task_id, task.id);

        let by_item = state.get_task_by_item(42).await.unwrap().unwrap();
        assert_eq!(by_item.id, task.id);
        assert!(state.get_task_by_item(43).await.unwrap().is_none());

        let mut loaded = state.get_task_required(&task.id).await.unwrap();
        loaded.set_status(TaskStatus::InProgress);
        state.update_task(loaded).await.unwrap();

        let in_progress = state.list_tasks(Some("in_progress".into())).await.unwrap();
        assert_eq!(in_progress.len(), 1);
    }

    #[tokio::test]
    async fn test_run_listing_by_status() {
        let state = spawn().await;
        let task = Task::new(1, "t", "d");
        state.create_task(task.clone()).await.unwrap();

        let mut run = Run::new(&task.id);
        run.set_status(RunStatus::Running);
        state.create_run(run.clone()).await.unwrap();

        let running = state
            .list_runs(Some(task.id.clone()), Some("running".into()))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, run.id);

        let completed = state.list_runs(None, Some("completed".into())).await.unwrap();
        assert!(completed.is_empty());
    }

    #[tokio::test]
    async fn test_stage_ordering_and_snapshot() {
        let state = spawn().await;

        let mut s1 = StageExecution::started("run_1", StageName::Prepare, 1, json!({}));
        s1.succeed(json!({"step": 1}));
        let mut s2 = StageExecution::started("run_1", StageName::Analyze, 2, json!({}));
        s2.succeed(json!({"step": 2}));
        let s3 = StageExecution::started("run_1", StageName::Implement, 3, json!({}));

        // Insert out of order
        state.create_stage(s2).await.unwrap();
        state.create_stage(s3).await.unwrap();
        state.create_stage(s1).await.unwrap();

        let stages = state.list_stages("run_1").await.unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].ordinal, 1);
        assert_eq!(stages[2].ordinal, 3);

        // Latest snapshot is the highest succeeded ordinal
        let snapshot = state.latest_snapshot("run_1").await.unwrap().unwrap();
        assert_eq!(snapshot.ordinal, 2);
        assert_eq!(snapshot.output["step"], 2);
    }

    #[tokio::test]
    async fn test_webhook_idempotence_lookup() {
        let state = spawn().await;

        let event = WebhookEvent::new("board", "create_update", json!({"a": 1}), json!({}))
            .with_external_id(Some("update_900".into()));
        state.record_webhook(event.clone()).await.unwrap();

        let found = state
            .find_webhook_by_external_id("board", "update_900")
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().id, event.id);

        let missing = state
            .find_webhook_by_external_id("board", "update_901")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_queue_entry_listing() {
        let state = spawn().await;

        let entry = QueueEntry::new(5, json!({}), 7);
        state.upsert_queue_entry(entry.clone()).await.unwrap();

        let pending = state.list_queue_entries(Some("pending".into()), None).await.unwrap();
        assert_eq!(pending.len(), 1);

        let recent = state
            .list_queue_entries(None, Some(entry.queued_at - 1))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);

        let too_new = state
            .list_queue_entries(None, Some(entry.queued_at + 1))
            .await
            .unwrap();
        assert!(too_new.is_empty());
    }
}
