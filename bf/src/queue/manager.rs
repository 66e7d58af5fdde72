//! Queue manager implementation
//!
//! In-memory ordered lists per board item, backed by durable queue entry
//! rows. Dispatch hands the head entry to the scheduler via the broker's
//! `workflows` queue.

use std::collections::HashMap;
use std::sync::Arc;

use boardstore::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerMessage, WORKFLOWS};
use crate::config::OrchestratorConfig;
use crate::domain::{QueueEntry, QueueStatus, RunStatus};
use crate::state::StateManager;

/// Body of a workflow dispatch message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub queue_id: String,
    pub external_item_id: i64,
}

/// Snapshot of one item's queue
#[derive(Debug, Clone)]
pub struct ItemQueueStatus {
    pub external_item_id: i64,
    pub queue_size: usize,
    pub running: Option<RunningInfo>,
    pub pending: Vec<PendingInfo>,
}

#[derive(Debug, Clone)]
pub struct RunningInfo {
    pub queue_id: String,
    pub status: QueueStatus,
    pub started_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub queue_id: String,
    pub priority: u8,
    pub position: usize,
}

#[derive(Default)]
struct ItemQueue {
    entries: Vec<QueueEntry>,
}

impl ItemQueue {
    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.queued_at.cmp(&b.queued_at)));
    }

    fn running(&self) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.status == QueueStatus::Running)
    }

    fn first_pending(&self) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.status == QueueStatus::Pending)
    }

    fn find_mut(&mut self, queue_id: &str) -> Option<&mut QueueEntry> {
        self.entries.iter_mut().find(|e| e.id == queue_id)
    }

    /// 1-based position among pending entries
    fn position(&self, queue_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .filter(|e| e.status == QueueStatus::Pending)
            .position(|e| e.id == queue_id)
            .map(|i| i + 1)
    }
}

/// Per-item workflow queue manager
pub struct QueueManager {
    state: StateManager,
    broker: Arc<Broker>,
    config: OrchestratorConfig,
    queues: Mutex<HashMap<i64, Arc<Mutex<ItemQueue>>>>,
}

impl QueueManager {
    pub fn new(state: StateManager, broker: Arc<Broker>, config: OrchestratorConfig) -> Arc<Self> {
        Arc::new(Self {
            state,
            broker,
            config,
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// The broker this manager dispatches through
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    async fn item_queue(&self, external_item_id: i64) -> Arc<Mutex<ItemQueue>> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(external_item_id)
            .or_insert_with(|| Arc::new(Mutex::new(ItemQueue::default())))
            .clone()
    }

    async fn persist(&self, entry: &QueueEntry) {
        if let Err(e) = self.state.upsert_queue_entry(entry.clone()).await {
            warn!(queue_id = %entry.id, error = %e, "Failed to persist queue entry");
        }
    }

    /// Append a new entry and persist it; returns the entry
    pub async fn enqueue(
        &self,
        external_item_id: i64,
        payload: Value,
        task_id: Option<String>,
        run_id: Option<String>,
        priority: u8,
    ) -> QueueEntry {
        let lock = self.item_queue(external_item_id).await;
        let mut queue = lock.lock().await;

        let mut entry = QueueEntry::new(external_item_id, payload, priority);
        entry.task_id = task_id;
        entry.run_id = run_id;

        self.persist(&entry).await;
        queue.entries.push(entry.clone());
        queue.sort();

        info!(
            queue_id = %entry.id,
            external_item_id,
            priority,
            position = queue.position(&entry.id).unwrap_or(0),
            queue_size = queue.entries.len(),
            "Workflow enqueued"
        );
        entry
    }

    /// True iff the entry is the next pending one and nothing is running
    pub async fn should_execute_now(&self, external_item_id: i64, queue_id: &str) -> bool {
        let lock = self.item_queue(external_item_id).await;
        let queue = lock.lock().await;

        if queue.running().is_some() {
            return false;
        }
        queue.first_pending().map(|e| e.id == queue_id).unwrap_or(false)
    }

    /// Dispatch the head pending entry, if nothing is running
    ///
    /// Returns the dispatched queue id. An entry already handed to the
    /// broker (dispatch_ref set) is not dispatched twice.
    pub async fn dispatch_next(&self, external_item_id: i64) -> Option<String> {
        let lock = self.item_queue(external_item_id).await;
        let mut queue = lock.lock().await;

        if queue.running().is_some() {
            return None;
        }
        let head = queue.entries.iter_mut().find(|e| e.status == QueueStatus::Pending)?;
        if head.dispatch_ref.is_some() {
            return None;
        }

        let message = BrokerMessage::new(
            serde_json::to_value(DispatchMessage {
                queue_id: head.id.clone(),
                external_item_id,
            })
            .expect("dispatch message serializes"),
            head.priority,
        );
        head.dispatch_ref = Some(message.id.clone());
        let persisted = head.clone();
        let queue_id = head.id.clone();
        drop(queue);

        self.persist(&persisted).await;
        self.broker.publish(WORKFLOWS, message).await;
        debug!(queue_id = %queue_id, external_item_id, "Dispatched next workflow");
        Some(queue_id)
    }

    /// Transition pending -> running
    pub async fn mark_running(&self, external_item_id: i64, queue_id: &str, dispatch_ref: &str) {
        let lock = self.item_queue(external_item_id).await;
        let mut queue = lock.lock().await;

        if let Some(entry) = queue.find_mut(queue_id) {
            entry.mark_running(dispatch_ref);
            let persisted = entry.clone();
            drop(queue);
            self.persist(&persisted).await;
            info!(queue_id, external_item_id, "Workflow running");
        }
    }

    /// Transition running -> waiting_validation, freeing the slot
    ///
    /// The next pending entry is dispatched immediately; a run waiting on
    /// a human must not block new work on the item.
    pub async fn mark_waiting_validation(&self, external_item_id: i64, queue_id: &str) {
        let lock = self.item_queue(external_item_id).await;
        let persisted = {
            let mut queue = lock.lock().await;
            queue.find_mut(queue_id).map(|entry| {
                entry.mark_waiting_validation();
                entry.clone()
            })
        };

        if let Some(entry) = persisted {
            self.persist(&entry).await;
            info!(queue_id, external_item_id, "Workflow waiting for validation, slot released");
        }

        self.dispatch_next(external_item_id).await;
    }

    /// Re-take the running slot after a validation verdict
    ///
    /// Fails when another entry holds the slot; callers retry until the
    /// per-item invariant admits them.
    pub async fn resume_running(&self, external_item_id: i64, queue_id: &str) -> bool {
        let lock = self.item_queue(external_item_id).await;
        let mut queue = lock.lock().await;

        if queue.running().map(|e| e.id != queue_id).unwrap_or(false) {
            return false;
        }
        let Some(entry) = queue.find_mut(queue_id) else {
            return false;
        };
        entry.status = QueueStatus::Running;
        entry.updated_at = now_ms();
        let persisted = entry.clone();
        drop(queue);

        self.persist(&persisted).await;
        debug!(queue_id, external_item_id, "Workflow resumed running slot");
        true
    }

    /// Terminal transition; removes the entry and starts the next head
    pub async fn finish(
        &self,
        external_item_id: i64,
        queue_id: &str,
        status: QueueStatus,
        error: Option<String>,
    ) {
        let lock = self.item_queue(external_item_id).await;
        let persisted = {
            let mut queue = lock.lock().await;
            let finished = queue.find_mut(queue_id).map(|entry| {
                entry.finish(status, error);
                entry.clone()
            });
            if finished.is_some() {
                queue.entries.retain(|e| e.id != queue_id);
            }
            finished.map(|entry| (entry, queue.entries.len()))
        };

        if let Some((entry, remaining)) = persisted {
            self.persist(&entry).await;
            info!(queue_id, external_item_id, %status, remaining, "Workflow finished");
        }

        self.dispatch_next(external_item_id).await;
    }

    /// 1-based position of an entry among its item's pending entries
    pub async fn queue_position(&self, external_item_id: i64, queue_id: &str) -> Option<usize> {
        let lock = self.item_queue(external_item_id).await;
        let queue = lock.lock().await;
        queue.position(queue_id)
    }

    /// Snapshot of one item's queue
    pub async fn queue_status(&self, external_item_id: i64) -> ItemQueueStatus {
        let lock = self.item_queue(external_item_id).await;
        let queue = lock.lock().await;

        let running = queue.running().map(|e| RunningInfo {
            queue_id: e.id.clone(),
            status: e.status,
            started_at: e.started_at,
        });
        let pending = queue
            .entries
            .iter()
            .filter(|e| e.status == QueueStatus::Pending)
            .enumerate()
            .map(|(i, e)| PendingInfo {
                queue_id: e.id.clone(),
                priority: e.priority,
                position: i + 1,
            })
            .collect();

        ItemQueueStatus {
            external_item_id,
            queue_size: queue.entries.len(),
            running,
            pending,
        }
    }

    /// Reload non-terminal entries from the store and resume scheduling
    pub async fn recover(&self) -> usize {
        let window_ms = self.config.queue_recovery_window_hours * 3600 * 1000;
        let since = now_ms() - window_ms;

        let mut restored = 0;
        let mut items = Vec::new();
        for status in ["pending", "running", "waiting_validation"] {
            let entries = match self.state.list_queue_entries(Some(status.to_string()), Some(since)).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, status, "Queue recovery listing failed");
                    continue;
                }
            };
            for mut entry in entries {
                // A dispatch in flight at crash time is lost; re-dispatch
                entry.dispatch_ref = None;
                if entry.status == QueueStatus::Running {
                    entry.status = QueueStatus::Pending;
                }
                let item_id = entry.external_item_id;
                let lock = self.item_queue(item_id).await;
                let mut queue = lock.lock().await;
                queue.entries.push(entry);
                queue.sort();
                drop(queue);
                if !items.contains(&item_id) {
                    items.push(item_id);
                }
                restored += 1;
            }
        }

        for item_id in items {
            self.dispatch_next(item_id).await;
        }

        if restored > 0 {
            info!(restored, "Queue entries restored from store");
        }
        restored
    }

    /// Force expired entries to timeout; returns how many were expired
    pub async fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let workflow_timeout_ms = self.config.workflow_timeout_secs as i64 * 1000;
        let validation_timeout_ms = self.config.validation_timeout_secs as i64 * 1000;

        let item_ids: Vec<i64> = {
            let queues = self.queues.lock().await;
            queues.keys().copied().collect()
        };

        let mut expired = 0;
        for item_id in item_ids {
            let lock = self.item_queue(item_id).await;
            let queue = lock.lock().await;

            let stale: Vec<(String, Option<String>, i64)> = queue
                .entries
                .iter()
                .filter_map(|e| match (e.status, e.started_at) {
                    (QueueStatus::Running, Some(started)) if now - started > workflow_timeout_ms => {
                        Some((e.id.clone(), e.run_id.clone(), now - started))
                    }
                    (QueueStatus::WaitingValidation, Some(started))
                        if now - started > validation_timeout_ms =>
                    {
                        Some((e.id.clone(), e.run_id.clone(), now - started))
                    }
                    _ => None,
                })
                .collect();
            drop(queue);

            for (queue_id, run_id, elapsed_ms) in stale {
                warn!(queue_id = %queue_id, item_id, elapsed_s = elapsed_ms / 1000, "Workflow expired");
                self.finish(
                    item_id,
                    &queue_id,
                    QueueStatus::Timeout,
                    Some(format!("Timed out after {}s", elapsed_ms / 1000)),
                )
                .await;

                if let Some(run_id) = run_id {
                    if let Ok(Some(mut run)) = self.state.get_run(&run_id).await
                        && !run.is_terminal()
                    {
                        run.set_error("Workflow timeout");
                        run.set_status(RunStatus::Timeout);
                        let _ = self.state.update_run(run).await;
                    }
                }
                expired += 1;
            }
        }

        if expired > 0 {
            info!(expired, "Expired workflows cleaned up");
        }
        expired
    }

    /// Spawn the periodic sweeper task
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let interval = manager.config.queue_sweep_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                manager.sweep_expired().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::WORKFLOWS;
    use serde_json::json;

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig::default()
    }

    async fn make_manager() -> (Arc<QueueManager>, Arc<Broker>, StateManager) {
        let state = StateManager::spawn_in_memory().unwrap();
        let broker = Broker::new();
        let manager = QueueManager::new(state.clone(), broker.clone(), test_config());
        (manager, broker, state)
    }

    #[tokio::test]
    async fn test_single_active_per_item() {
        let (manager, _broker, _state) = make_manager().await;

        let first = manager.enqueue(1, json!({}), None, None, 5).await;
        let second = manager.enqueue(1, json!({}), None, None, 5).await;

        assert!(manager.should_execute_now(1, &first.id).await);
        assert!(!manager.should_execute_now(1, &second.id).await);

        manager.mark_running(1, &first.id, "d1").await;
        assert!(!manager.should_execute_now(1, &second.id).await);

        // Different item is unaffected
        let other = manager.enqueue(2, json!({}), None, None, 5).await;
        assert!(manager.should_execute_now(2, &other.id).await);
    }

    #[tokio::test]
    async fn test_priority_orders_pending_entries() {
        let (manager, _broker, _state) = make_manager().await;

        // Fill the slot so both stay pending
        let running = manager.enqueue(1, json!({}), None, None, 5).await;
        manager.mark_running(1, &running.id, "d").await;

        let low = manager.enqueue(1, json!({}), None, None, 3).await;
        let high = manager.enqueue(1, json!({}), None, None, 7).await;

        assert_eq!(manager.queue_position(1, &high.id).await, Some(1));
        assert_eq!(manager.queue_position(1, &low.id).await, Some(2));
    }

    #[tokio::test]
    async fn test_priority_never_preempts_running() {
        let (manager, _broker, _state) = make_manager().await;

        let running = manager.enqueue(1, json!({}), None, None, 3).await;
        manager.mark_running(1, &running.id, "d").await;

        let urgent = manager.enqueue(1, json!({}), None, None, 9).await;
        assert!(!manager.should_execute_now(1, &urgent.id).await);

        let status = manager.queue_status(1).await;
        assert_eq!(status.running.unwrap().queue_id, running.id);
    }

    #[tokio::test]
    async fn test_waiting_validation_frees_slot_and_dispatches_next() {
        let (manager, broker, _state) = make_manager().await;

        let first = manager.enqueue(1, json!({}), None, None, 5).await;
        let dispatched = manager.dispatch_next(1).await;
        assert_eq!(dispatched.as_deref(), Some(first.id.as_str()));
        broker.try_consume(WORKFLOWS).await.unwrap();
        manager.mark_running(1, &first.id, "d1").await;

        let second = manager.enqueue(1, json!({}), None, None, 5).await;
        assert!(!manager.should_execute_now(1, &second.id).await);

        manager.mark_waiting_validation(1, &first.id).await;

        // The second entry was dispatched to the broker
        let message = broker.try_consume(WORKFLOWS).await.unwrap();
        let dispatch: DispatchMessage = serde_json::from_value(message.body).unwrap();
        assert_eq!(dispatch.queue_id, second.id);
    }

    #[tokio::test]
    async fn test_finish_removes_entry_and_dispatches_next() {
        let (manager, broker, state) = make_manager().await;

        let first = manager.enqueue(1, json!({}), None, None, 5).await;
        manager.dispatch_next(1).await;
        broker.try_consume(WORKFLOWS).await.unwrap();
        manager.mark_running(1, &first.id, "d1").await;
        let second = manager.enqueue(1, json!({}), None, None, 5).await;

        manager.finish(1, &first.id, QueueStatus::Completed, None).await;

        let status = manager.queue_status(1).await;
        assert_eq!(status.queue_size, 1);

        // Terminal row persists
        let stored = state.get_queue_entry(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);

        // Next head dispatched
        let message = broker.try_consume(WORKFLOWS).await.unwrap();
        let dispatch: DispatchMessage = serde_json::from_value(message.body).unwrap();
        assert_eq!(dispatch.queue_id, second.id);
    }

    #[tokio::test]
    async fn test_dispatch_next_is_idempotent() {
        let (manager, broker, _state) = make_manager().await;

        manager.enqueue(1, json!({}), None, None, 5).await;
        assert!(manager.dispatch_next(1).await.is_some());
        assert!(manager.dispatch_next(1).await.is_none());

        assert!(broker.try_consume(WORKFLOWS).await.is_some());
        assert!(broker.try_consume(WORKFLOWS).await.is_none());
    }

    #[tokio::test]
    async fn test_resume_running_respects_slot() {
        let (manager, _broker, _state) = make_manager().await;

        let first = manager.enqueue(1, json!({}), None, None, 5).await;
        manager.mark_running(1, &first.id, "d1").await;
        manager.mark_waiting_validation(1, &first.id).await;

        let second = manager.enqueue(1, json!({}), None, None, 5).await;
        manager.mark_running(1, &second.id, "d2").await;

        // Slot is held by the second entry
        assert!(!manager.resume_running(1, &first.id).await);

        manager.finish(1, &second.id, QueueStatus::Completed, None).await;
        assert!(manager.resume_running(1, &first.id).await);
    }

    #[tokio::test]
    async fn test_sweeper_expires_stale_running_entry() {
        let state = StateManager::spawn_in_memory().unwrap();
        let broker = Broker::new();
        let config = OrchestratorConfig {
            workflow_timeout_secs: 0,
            ..OrchestratorConfig::default()
        };
        let manager = QueueManager::new(state.clone(), broker, config);

        let task = crate::domain::Task::new(1, "t", "d");
        state.create_task(task.clone()).await.unwrap();
        let mut run = crate::domain::Run::new(&task.id);
        run.set_status(RunStatus::Running);
        state.create_run(run.clone()).await.unwrap();

        let entry = manager.enqueue(1, json!({}), Some(task.id), Some(run.id.clone()), 5).await;
        manager.mark_running(1, &entry.id, "d").await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let expired = manager.sweep_expired().await;
        assert_eq!(expired, 1);

        let stored = state.get_queue_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Timeout);

        let stored_run = state.get_run_required(&run.id).await.unwrap();
        assert_eq!(stored_run.status, RunStatus::Timeout);
    }

    #[tokio::test]
    async fn test_recovery_restores_entries() {
        let state = StateManager::spawn_in_memory().unwrap();
        let broker = Broker::new();

        // Entries persisted by a previous process
        let mut running = QueueEntry::new(1, json!({}), 5);
        running.mark_running("lost-dispatch");
        state.upsert_queue_entry(running.clone()).await.unwrap();
        let pending = QueueEntry::new(1, json!({}), 5);
        state.upsert_queue_entry(pending).await.unwrap();
        let mut terminal = QueueEntry::new(2, json!({}), 5);
        terminal.finish(QueueStatus::Completed, None);
        state.upsert_queue_entry(terminal).await.unwrap();

        let manager = QueueManager::new(state, broker.clone(), test_config());
        let restored = manager.recover().await;
        assert_eq!(restored, 2);

        // Interrupted running entry is re-dispatched as the head
        let message = broker.try_consume(WORKFLOWS).await.unwrap();
        let dispatch: DispatchMessage = serde_json::from_value(message.body).unwrap();
        assert_eq!(dispatch.queue_id, running.id);
    }
}
