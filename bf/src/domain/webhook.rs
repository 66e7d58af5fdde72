//! Inbound webhook types
//!
//! The wire schema of board events and the append-only WebhookEvent log
//! record. Events are persisted before any interpretation so failures
//! downstream can be replayed from the log.

use std::collections::HashMap;

use boardstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::generate_id;
use super::priority::TaskPriority;

/// Webhook payload as delivered by the board platform
///
/// A challenge handshake carries `challenge` and no `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardWebhookPayload {
    #[serde(default)]
    pub challenge: Option<String>,

    /// Platform event type, e.g. "create_pulse" or "create_update"
    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub event: Option<BoardEvent>,
}

/// The event body of a board webhook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardEvent {
    #[serde(rename = "type")]
    pub kind: String,

    /// Board item the event concerns
    #[serde(rename = "pulseId")]
    pub pulse_id: i64,

    #[serde(rename = "pulseName", default)]
    pub pulse_name: Option<String>,

    #[serde(rename = "boardId", default)]
    pub board_id: Option<i64>,

    /// Priority label on the item
    #[serde(default)]
    pub priority: Option<String>,

    /// Free-text body (item description or comment text)
    #[serde(default)]
    pub body: Option<String>,

    #[serde(rename = "textBody", default)]
    pub text_body: Option<String>,

    /// External id of the update/comment, when the event is a comment
    #[serde(rename = "updateId", default)]
    pub update_id: Option<i64>,

    #[serde(rename = "repositoryUrl", default)]
    pub repository_url: Option<String>,

    /// Identity of the acting user
    #[serde(rename = "userId", default)]
    pub user_id: Option<i64>,

    #[serde(rename = "userName", default)]
    pub user_name: Option<String>,

    #[serde(rename = "userEmail", default)]
    pub user_email: Option<String>,
}

impl BoardWebhookPayload {
    /// Whether this is a platform challenge handshake
    pub fn is_challenge(&self) -> bool {
        self.challenge.is_some() && self.event.is_none()
    }

    /// Whether the event is the creation of a new board item
    pub fn is_item_creation(&self) -> bool {
        self.event
            .as_ref()
            .map(|e| e.kind == "create_pulse" || e.kind == "create_item")
            .unwrap_or(false)
    }

    /// Whether the event is a free-text comment on an item
    pub fn is_comment(&self) -> bool {
        self.event
            .as_ref()
            .map(|e| e.kind == "create_update" || e.kind == "create_reply")
            .unwrap_or(false)
    }

    /// Comment text, for comment events
    pub fn comment_text(&self) -> Option<&str> {
        let event = self.event.as_ref()?;
        event
            .text_body
            .as_deref()
            .or(event.body.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    /// External event id used for idempotent processing
    ///
    /// Only comment deliveries carry one; item creations are deduplicated
    /// at the task level by `external_item_id`.
    pub fn external_event_id(&self) -> Option<String> {
        let event = self.event.as_ref()?;
        event.update_id.map(|update_id| format!("update_{}", update_id))
    }

    /// Extract the task fields carried by an item-creation event
    pub fn extract_task_seed(&self) -> Option<TaskSeed> {
        let event = self.event.as_ref()?;
        let title = event.pulse_name.clone()?;
        if title.trim().is_empty() {
            return None;
        }

        Some(TaskSeed {
            external_item_id: event.pulse_id,
            title,
            description: event
                .body
                .clone()
                .or_else(|| event.text_body.clone())
                .unwrap_or_default(),
            priority: TaskPriority::from_label(event.priority.as_deref().unwrap_or("")),
            repository_url: event.repository_url.clone().unwrap_or_default(),
            creator_id: event.user_id.map(|id| id.to_string()),
            creator_name: event.user_name.clone(),
            creator_email: event.user_email.clone(),
        })
    }
}

/// Task fields extracted from an item-creation event
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSeed {
    pub external_item_id: i64,
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    pub repository_url: String,
    pub creator_id: Option<String>,
    pub creator_name: Option<String>,
    pub creator_email: Option<String>,
}

/// Immutable log entry for every inbound event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,

    /// Delivery source, e.g. "board"
    pub source: String,

    /// Platform event type
    pub event_type: String,

    /// External event id, when the platform provides one
    pub external_event_id: Option<String>,

    /// Raw payload exactly as received
    pub payload: Value,

    /// Request headers of the delivery
    pub headers: Value,

    /// Delivery signature, if present
    pub signature: Option<String>,

    pub received_at: i64,
    pub processed_at: Option<i64>,

    /// Processing outcome: accepted / queued / reactivated / ignored / error text
    pub outcome: Option<String>,

    pub updated_at: i64,
}

impl WebhookEvent {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, payload: Value, headers: Value) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("webhook"),
            source: source.into(),
            event_type: event_type.into(),
            external_event_id: None,
            payload,
            headers,
            signature: None,
            received_at: now,
            processed_at: None,
            outcome: None,
            updated_at: now,
        }
    }

    /// Builder method to attach the external event id
    pub fn with_external_id(mut self, external_id: Option<String>) -> Self {
        self.external_event_id = external_id;
        self
    }

    /// Builder method to attach the delivery signature
    pub fn with_signature(mut self, signature: Option<String>) -> Self {
        self.signature = signature;
        self
    }

    /// Record the processing outcome
    pub fn mark_processed(&mut self, outcome: impl Into<String>) {
        let now = now_ms();
        self.processed_at = Some(now);
        self.outcome = Some(outcome.into());
        self.updated_at = now;
    }
}

impl Record for WebhookEvent {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "webhook_events"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("source".to_string(), IndexValue::String(self.source.clone()));
        fields.insert("event_type".to_string(), IndexValue::String(self.event_type.clone()));
        if let Some(external_id) = &self.external_event_id {
            fields.insert(
                "external_event_id".to_string(),
                IndexValue::String(external_id.clone()),
            );
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> BoardWebhookPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_challenge_detection() {
        let payload = parse(json!({"challenge": "abc123"}));
        assert!(payload.is_challenge());

        let payload = parse(json!({
            "challenge": "abc123",
            "event": {"type": "create_pulse", "pulseId": 1}
        }));
        assert!(!payload.is_challenge());
    }

    #[test]
    fn test_extract_task_seed() {
        let payload = parse(json!({
            "type": "create_pulse",
            "event": {
                "type": "create_pulse",
                "pulseId": 5028673529i64,
                "pulseName": "Add endpoint /v1/health",
                "priority": "high",
                "body": "We need a health probe",
                "repositoryUrl": "https://example.com/acme/svc.git",
                "userId": 77,
                "userName": "Ada",
                "userEmail": "ada@example.com"
            }
        }));

        let seed = payload.extract_task_seed().unwrap();
        assert_eq!(seed.external_item_id, 5028673529);
        assert_eq!(seed.title, "Add endpoint /v1/health");
        assert_eq!(seed.priority, TaskPriority::High);
        assert_eq!(seed.creator_email.as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn test_extract_task_seed_requires_title() {
        let payload = parse(json!({
            "event": {"type": "create_pulse", "pulseId": 1}
        }));
        assert!(payload.extract_task_seed().is_none());
    }

    #[test]
    fn test_comment_detection_and_text() {
        let payload = parse(json!({
            "event": {
                "type": "create_update",
                "pulseId": 1,
                "updateId": 900,
                "textBody": "Please also add a readiness probe"
            }
        }));
        assert!(payload.is_comment());
        assert!(!payload.is_item_creation());
        assert_eq!(payload.comment_text(), Some("Please also add a readiness probe"));
        assert_eq!(payload.external_event_id().as_deref(), Some("update_900"));
    }

    #[test]
    fn test_item_creation_has_no_external_event_id() {
        let payload = parse(json!({
            "event": {"type": "create_pulse", "pulseId": 42, "pulseName": "T"}
        }));
        assert!(payload.external_event_id().is_none());
    }

    #[test]
    fn test_webhook_event_outcome() {
        let mut event = WebhookEvent::new("board", "create_pulse", json!({"k": 1}), json!({}));
        assert!(event.processed_at.is_none());

        event.mark_processed("accepted");
        assert!(event.processed_at.is_some());
        assert_eq!(event.outcome.as_deref(), Some("accepted"));
    }

    #[test]
    fn test_webhook_event_indexed_fields() {
        let event = WebhookEvent::new("board", "create_update", json!({}), json!({}))
            .with_external_id(Some("update_900".into()));
        let fields = event.indexed_fields();
        assert_eq!(
            fields.get("external_event_id"),
            Some(&IndexValue::String("update_900".into()))
        );
    }
}
