//! Ingress processing logic
//!
//! Separated from the HTTP layer so classification and queue interplay
//! are testable without a server.

use std::sync::Arc;

use boardstore::now_ms;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerMessage, WEBHOOKS};
use crate::config::Config;
use crate::domain::{BoardWebhookPayload, Run, Task, TaskStatus, WebhookEvent};
use crate::queue::QueueManager;
use crate::reactivation::ReactivationAnalyzer;
use crate::signature::is_agent_comment;
use crate::state::StateManager;

/// Outcome of processing one webhook delivery
#[derive(Debug, Clone)]
pub enum IngressResult {
    /// Platform challenge handshake; echo it back
    Challenge { challenge: String },
    /// Admitted and started immediately
    Accepted { queue_id: String },
    /// Admitted, waiting behind another workflow
    Queued {
        queue_id: String,
        position: usize,
        running_workflow_id: Option<String>,
    },
    /// Admitted as a new run of a finished task
    Reactivated { task_id: String, run_id: String },
    /// Persisted but not actionable
    Ignored { reason: String },
    /// Body could not be interpreted as a board payload
    Malformed { detail: String },
    /// Persistence failed; the broker should redeliver
    Failure { detail: String },
}

/// The ingress service
pub struct IngressService {
    state: StateManager,
    queue: Arc<QueueManager>,
    broker: Arc<Broker>,
    analyzer: ReactivationAnalyzer,
    config: Config,
}

impl IngressService {
    pub fn new(
        state: StateManager,
        queue: Arc<QueueManager>,
        broker: Arc<Broker>,
        analyzer: ReactivationAnalyzer,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            queue,
            broker,
            analyzer,
            config,
        })
    }

    /// Process one webhook delivery
    pub async fn process(&self, raw: Value, headers: Value, signature: Option<String>) -> IngressResult {
        // Challenge handshakes are answered without persistence
        if let Some(challenge) = raw.get("challenge").and_then(Value::as_str)
            && raw.get("event").map(Value::is_null).unwrap_or(true)
        {
            debug!(challenge, "Challenge handshake");
            return IngressResult::Challenge {
                challenge: challenge.to_string(),
            };
        }

        let payload: BoardWebhookPayload = match serde_json::from_value(raw.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return IngressResult::Malformed {
                    detail: format!("Invalid payload: {}", e),
                };
            }
        };

        let event_type = payload
            .event
            .as_ref()
            .map(|e| e.kind.clone())
            .or_else(|| payload.kind.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let external_id = payload.external_event_id();

        // Re-delivery of an already-processed event is logged but must not
        // enqueue twice
        let mut duplicate_of = None;
        if let Some(external_id) = &external_id {
            match self.state.find_webhook_by_external_id("board", external_id).await {
                Ok(Some(previous)) if previous.processed_at.is_some() => {
                    debug!(external_id, "Duplicate delivery, already processed");
                    duplicate_of = Some(previous.outcome.unwrap_or_else(|| "unknown".to_string()));
                }
                Ok(_) => {}
                Err(e) => {
                    return IngressResult::Failure {
                        detail: format!("Event log lookup failed: {}", e),
                    };
                }
            }
        }

        // Persist the raw payload before any interpretation
        let mut event = WebhookEvent::new("board", &event_type, raw, headers)
            .with_external_id(external_id)
            .with_signature(signature);
        if let Err(e) = self.state.record_webhook(event.clone()).await {
            return IngressResult::Failure {
                detail: format!("Failed to persist webhook: {}", e),
            };
        }
        self.broker
            .publish(WEBHOOKS, BrokerMessage::new(serde_json::json!({"event_id": event.id}), 5))
            .await;

        let result = match duplicate_of {
            Some(prior_outcome) => IngressResult::Ignored {
                reason: format!("duplicate delivery, first outcome: {}", prior_outcome),
            },
            None => self.classify_and_admit(&payload).await,
        };

        let outcome = match &result {
            IngressResult::Accepted { queue_id } => format!("accepted:{}", queue_id),
            IngressResult::Queued { queue_id, .. } => format!("queued:{}", queue_id),
            IngressResult::Reactivated { run_id, .. } => format!("reactivated:{}", run_id),
            IngressResult::Ignored { reason } => format!("ignored:{}", reason),
            IngressResult::Malformed { detail } | IngressResult::Failure { detail } => {
                format!("error:{}", detail)
            }
            IngressResult::Challenge { .. } => "challenge".to_string(),
        };
        event.mark_processed(outcome);
        if let Err(e) = self.state.update_webhook(event).await {
            warn!(error = %e, "Failed to record webhook outcome");
        }

        result
    }

    async fn classify_and_admit(&self, payload: &BoardWebhookPayload) -> IngressResult {
        let Some(event) = &payload.event else {
            return IngressResult::Ignored {
                reason: "no event".to_string(),
            };
        };

        if payload.is_item_creation() {
            return self.admit_creation(payload).await;
        }

        if payload.is_comment() {
            let Some(text) = payload.comment_text() else {
                return IngressResult::Ignored {
                    reason: "empty comment".to_string(),
                };
            };
            if is_agent_comment(text) {
                // Self-authored comments are persisted but never enqueued
                return IngressResult::Ignored {
                    reason: "agent comment".to_string(),
                };
            }
            return self.admit_comment(event.pulse_id, text, payload).await;
        }

        IngressResult::Ignored {
            reason: format!("event type {} is not actionable", event.kind),
        }
    }

    /// A new board item: create the task (once) and enqueue a workflow
    async fn admit_creation(&self, payload: &BoardWebhookPayload) -> IngressResult {
        let Some(seed) = payload.extract_task_seed() else {
            return IngressResult::Ignored {
                reason: "no task extractable".to_string(),
            };
        };

        let task = match self.state.get_task_by_item(seed.external_item_id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                let task = Task::new(seed.external_item_id, &seed.title, &seed.description)
                    .with_priority(seed.priority)
                    .with_repository(&seed.repository_url)
                    .with_creator(seed.creator_id.clone(), seed.creator_name.clone(), seed.creator_email.clone());
                match self.state.create_task(task.clone()).await {
                    Ok(_) => {
                        info!(task_id = %task.id, item_id = task.external_item_id, "Task created");
                        task
                    }
                    Err(e) => {
                        return IngressResult::Failure {
                            detail: format!("Failed to create task: {}", e),
                        };
                    }
                }
            }
            Err(e) => {
                return IngressResult::Failure {
                    detail: format!("Task lookup failed: {}", e),
                };
            }
        };

        self.enqueue_and_dispatch(&task, payload, None).await
    }

    /// A human comment: reactivate terminal tasks, ignore the rest
    async fn admit_comment(&self, item_id: i64, text: &str, payload: &BoardWebhookPayload) -> IngressResult {
        let task = match self.state.get_task_by_item(item_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                return IngressResult::Ignored {
                    reason: "comment on unknown item".to_string(),
                };
            }
            Err(e) => {
                return IngressResult::Failure {
                    detail: format!("Task lookup failed: {}", e),
                };
            }
        };

        if !task.is_terminal() {
            // The validation coordinator reads replies directly from the
            // board; a comment on an active task is conversational here
            return IngressResult::Ignored {
                reason: "comment on active task".to_string(),
            };
        }

        if task.is_locked {
            return IngressResult::Ignored {
                reason: "task is locked".to_string(),
            };
        }
        if !task.is_reactivatable(now_ms()) {
            return IngressResult::Ignored {
                reason: format!("task not reactivation-eligible ({})", task.internal_status),
            };
        }

        let decision = self.analyzer.analyze(text).await;
        if !decision.accepted {
            info!(
                task_id = %task.id,
                confidence = decision.confidence,
                reason = %decision.reason,
                "Reactivation refused"
            );
            return IngressResult::Ignored {
                reason: format!("reactivation refused: {}", decision.reason),
            };
        }

        let mut task = task;
        task.reactivation_count += 1;

        let run = match &task.last_run_id {
            Some(parent_run_id) => Run::reactivation(&task.id, parent_run_id, text),
            None => {
                // Terminal task that never ran; treat as a fresh run
                let mut run = Run::new(&task.id);
                run.is_reactivation = true;
                run.new_requirements = Some(text.to_string());
                run.reactivation_context = Some(text.to_string());
                run
            }
        };
        if let Err(e) = self.state.create_run(run.clone()).await {
            return IngressResult::Failure {
                detail: format!("Failed to create reactivation run: {}", e),
            };
        }
        task.set_status(TaskStatus::Pending);
        if let Err(e) = self.state.update_task(task.clone()).await {
            return IngressResult::Failure {
                detail: format!("Failed to update task: {}", e),
            };
        }

        info!(
            task_id = %task.id,
            run_id = %run.id,
            reactivation_count = task.reactivation_count,
            confidence = decision.confidence,
            "Task reactivated"
        );

        match self.enqueue_and_dispatch(&task, payload, Some(run.id.clone())).await {
            IngressResult::Accepted { .. } | IngressResult::Queued { .. } => IngressResult::Reactivated {
                task_id: task.id.clone(),
                run_id: run.id,
            },
            other => other,
        }
    }

    async fn enqueue_and_dispatch(
        &self,
        task: &Task,
        payload: &BoardWebhookPayload,
        run_id: Option<String>,
    ) -> IngressResult {
        let priority = task.priority.queue_priority();
        let payload_value = serde_json::to_value(payload).unwrap_or(Value::Null);

        let entry = self
            .queue
            .enqueue(
                task.external_item_id,
                payload_value,
                Some(task.id.clone()),
                run_id,
                priority,
            )
            .await;

        let dispatched = self.queue.dispatch_next(task.external_item_id).await;
        if dispatched.as_deref() == Some(entry.id.as_str()) {
            return IngressResult::Accepted { queue_id: entry.id };
        }

        let status = self.queue.queue_status(task.external_item_id).await;
        IngressResult::Queued {
            position: self
                .queue
                .queue_position(task.external_item_id, &entry.id)
                .await
                .unwrap_or(status.pending.len().max(1)),
            running_workflow_id: status.running.map(|r| r.queue_id),
            queue_id: entry.id,
        }
    }

    /// Configured reactivation threshold, for status output
    pub fn reactivation_threshold(&self) -> f64 {
        self.config.orchestrator.reactivation_confidence_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn make_service() -> (Arc<IngressService>, StateManager, Arc<Broker>, Arc<QueueManager>) {
        let state = StateManager::spawn_in_memory().unwrap();
        let broker = Broker::new();
        let config = Config::default();
        let queue = QueueManager::new(state.clone(), broker.clone(), config.orchestrator.clone());
        let analyzer = ReactivationAnalyzer::new(config.orchestrator.reactivation_confidence_threshold, None);
        let service = IngressService::new(state.clone(), queue.clone(), broker.clone(), analyzer, config);
        (service, state, broker, queue)
    }

    fn creation_payload(item_id: i64, title: &str) -> Value {
        json!({
            "type": "create_pulse",
            "event": {
                "type": "create_pulse",
                "pulseId": item_id,
                "pulseName": title,
                "priority": "high",
                "body": "Please add a health endpoint",
                "repositoryUrl": "https://example.com/acme/svc.git",
                "userId": 77,
                "userName": "Ada",
                "userEmail": "ada@example.com"
            }
        })
    }

    fn comment_payload(item_id: i64, update_id: i64, text: &str) -> Value {
        json!({
            "type": "create_update",
            "event": {
                "type": "create_update",
                "pulseId": item_id,
                "updateId": update_id,
                "textBody": text,
                "userId": 77,
                "userName": "Ada",
                "userEmail": "ada@example.com"
            }
        })
    }

    #[tokio::test]
    async fn test_challenge_echo() {
        let (service, _, _, _) = make_service().await;
        let result = service.process(json!({"challenge": "abc123"}), json!({}), None).await;
        match result {
            IngressResult::Challenge { challenge } => assert_eq!(challenge, "abc123"),
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_creation_accepted_and_persisted() {
        let (service, state, _, _) = make_service().await;

        let result = service
            .process(creation_payload(5028673529, "Add endpoint /v1/health"), json!({}), None)
            .await;
        let IngressResult::Accepted { queue_id } = result else {
            panic!("Expected accepted, got {:?}", result);
        };
        assert!(!queue_id.is_empty());

        let task = state.get_task_by_item(5028673529).await.unwrap().unwrap();
        assert_eq!(task.title, "Add endpoint /v1/health");
        assert_eq!(task.priority, crate::domain::TaskPriority::High);
        assert_eq!(task.creator_email.as_deref(), Some("ada@example.com"));
    }

    #[tokio::test]
    async fn test_second_creation_is_queued_behind_first() {
        let (service, state, _, queue) = make_service().await;

        let first = service.process(creation_payload(1, "T"), json!({}), None).await;
        let IngressResult::Accepted { queue_id: first_id } = first else {
            panic!("first should be accepted");
        };
        // A worker picks the first workflow up
        queue.mark_running(1, &first_id, "dispatch_1").await;

        let second = service.process(creation_payload(1, "T"), json!({}), None).await;
        match second {
            IngressResult::Queued {
                position,
                running_workflow_id,
                ..
            } => {
                assert_eq!(position, 1);
                assert_eq!(running_workflow_id.as_deref(), Some(first_id.as_str()));
            }
            other => panic!("Expected queued, got {:?}", other),
        }

        // Only one task exists
        let tasks = state.list_tasks(None).await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_comment_delivery_is_idempotent() {
        let (service, state, _, queue) = make_service().await;

        // Set up a completed task so the comment is a reactivation trigger
        let mut task = Task::new(7, "t", "d");
        let run = Run::new(&task.id);
        state.create_run(run.clone()).await.unwrap();
        task.set_last_run(&run.id);
        task.set_status(TaskStatus::Completed);
        state.create_task(task).await.unwrap();

        let payload = comment_payload(7, 900, "Please also add a readiness probe");
        let first = service.process(payload.clone(), json!({}), None).await;
        assert!(matches!(first, IngressResult::Reactivated { .. }));

        let second = service.process(payload, json!({}), None).await;
        match second {
            IngressResult::Ignored { reason } => assert!(reason.contains("duplicate")),
            other => panic!("Expected ignored duplicate, got {:?}", other),
        }

        // Exactly one queue entry for the item
        let status = queue.queue_status(7).await;
        assert_eq!(status.queue_size, 1);
    }

    #[tokio::test]
    async fn test_agent_comment_never_reactivates() {
        let (service, state, _, _) = make_service().await;

        let mut task = Task::new(7, "t", "d");
        task.set_status(TaskStatus::Completed);
        state.create_task(task).await.unwrap();

        let signed = crate::signature::sign_comment("Please also add a readiness probe");
        let result = service.process(comment_payload(7, 901, &signed), json!({}), None).await;
        match result {
            IngressResult::Ignored { reason } => assert_eq!(reason, "agent comment"),
            other => panic!("Expected ignored, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reactivation_creates_linked_run() {
        let (service, state, _, _) = make_service().await;

        let mut task = Task::new(7, "t", "d");
        let prior = Run::new(&task.id);
        state.create_run(prior.clone()).await.unwrap();
        task.set_last_run(&prior.id);
        task.set_status(TaskStatus::Completed);
        state.create_task(task.clone()).await.unwrap();

        let result = service
            .process(comment_payload(7, 902, "Please also add a readiness probe"), json!({}), None)
            .await;
        let IngressResult::Reactivated { task_id, run_id } = result else {
            panic!("Expected reactivated, got {:?}", result);
        };
        assert_eq!(task_id, task.id);

        let run = state.get_run_required(&run_id).await.unwrap();
        assert!(run.is_reactivation);
        assert_eq!(run.parent_run_id.as_deref(), Some(prior.id.as_str()));
        assert_eq!(
            run.reactivation_context.as_deref(),
            Some("Please also add a readiness probe")
        );

        let task = state.get_task_required(&task.id).await.unwrap();
        assert_eq!(task.reactivation_count, 1);
    }

    #[tokio::test]
    async fn test_conversational_comment_refused() {
        let (service, state, _, _) = make_service().await;

        let mut task = Task::new(7, "t", "d");
        task.set_status(TaskStatus::Completed);
        state.create_task(task).await.unwrap();

        let result = service.process(comment_payload(7, 903, "thanks!"), json!({}), None).await;
        match result {
            IngressResult::Ignored { reason } => assert!(reason.contains("reactivation refused")),
            other => panic!("Expected ignored, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_comment_on_active_task_ignored() {
        let (service, state, _, _) = make_service().await;

        let mut task = Task::new(7, "t", "d");
        task.set_status(TaskStatus::InProgress);
        state.create_task(task).await.unwrap();

        let result = service
            .process(comment_payload(7, 904, "Please add more things"), json!({}), None)
            .await;
        match result {
            IngressResult::Ignored { reason } => assert_eq!(reason, "comment on active task"),
            other => panic!("Expected ignored, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_locked_task_refuses_reactivation() {
        let (service, state, _, _) = make_service().await;

        let mut task = Task::new(7, "t", "d");
        task.set_status(TaskStatus::Completed);
        task.is_locked = true;
        state.create_task(task).await.unwrap();

        let result = service
            .process(comment_payload(7, 905, "Please add a readiness probe"), json!({}), None)
            .await;
        match result {
            IngressResult::Ignored { reason } => assert!(reason.contains("locked")),
            other => panic!("Expected ignored, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cooldown_refuses_reactivation() {
        let (service, state, _, _) = make_service().await;

        let mut task = Task::new(7, "t", "d");
        task.set_status(TaskStatus::Completed);
        task.cooldown_until = Some(now_ms() + 3_600_000);
        state.create_task(task).await.unwrap();

        let result = service
            .process(comment_payload(7, 906, "Please add a readiness probe"), json!({}), None)
            .await;
        match result {
            IngressResult::Ignored { reason } => assert!(reason.contains("not reactivation-eligible")),
            other => panic!("Expected ignored, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let (service, _, _, _) = make_service().await;
        let result = service
            .process(json!({"event": {"type": "create_pulse"}}), json!({}), None)
            .await;
        assert!(matches!(result, IngressResult::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_unknown_event_type_ignored_without_enqueue() {
        let (service, state, _, _) = make_service().await;

        let result = service
            .process(
                json!({"event": {"type": "change_column_value", "pulseId": 3}}),
                json!({}),
                None,
            )
            .await;
        assert!(matches!(result, IngressResult::Ignored { .. }));

        let entries = state.list_queue_entries(None, None).await.unwrap();
        assert!(entries.is_empty());
    }
}
