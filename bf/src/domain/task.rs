//! Task domain type
//!
//! One row per distinct board item the system has ever seen.

use std::collections::HashMap;

use boardstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;
use super::priority::TaskPriority;

/// Internal lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    WaitingValidation,
    Completed,
    Failed,
    Abandoned,
    QualityCheck,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::WaitingValidation => write!(f, "waiting_validation"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Abandoned => write!(f, "abandoned"),
            Self::QualityCheck => write!(f, "quality_check"),
        }
    }
}

/// A board item tracked by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Internal identifier
    pub id: String,

    /// Board-provided item id, unique per board
    pub external_item_id: i64,

    /// Item title
    pub title: String,

    /// Item description (the work request)
    pub description: String,

    /// Priority label from the board
    pub priority: TaskPriority,

    /// Target repository URL
    pub repository_url: String,

    /// Detected language of the requester, for outbound comments
    pub user_language: String,

    /// Board identity of the item creator
    pub creator_id: Option<String>,
    pub creator_email: Option<String>,
    pub creator_name: Option<String>,

    /// Internal lifecycle status
    pub internal_status: TaskStatus,

    /// Mirror of the board's status column, last value written
    pub board_status: Option<String>,

    /// Number of reactivations so far
    pub reactivation_count: u32,

    /// Webhooks arriving before this instant are not reactivated
    pub cooldown_until: Option<i64>,

    /// Locked tasks reject reactivation until unlocked externally
    pub is_locked: bool,

    /// Most recent run for this task
    pub last_run_id: Option<String>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Task {
    /// Create a new task for a board item
    pub fn new(external_item_id: i64, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = now_ms();
        let description = description.into();
        Self {
            id: generate_id("task"),
            external_item_id,
            title: title.into(),
            user_language: detect_user_language(&description).to_string(),
            description,
            priority: TaskPriority::default(),
            repository_url: String::new(),
            creator_id: None,
            creator_email: None,
            creator_name: None,
            internal_status: TaskStatus::Pending,
            board_status: None,
            reactivation_count: 0,
            cooldown_until: None,
            is_locked: false,
            last_run_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder method to set priority
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set the repository URL
    pub fn with_repository(mut self, url: impl Into<String>) -> Self {
        self.repository_url = url.into();
        self
    }

    /// Builder method to set the creator identity
    pub fn with_creator(
        mut self,
        id: Option<String>,
        name: Option<String>,
        email: Option<String>,
    ) -> Self {
        self.creator_id = id;
        self.creator_name = name;
        self.creator_email = email;
        self
    }

    /// Update the internal status
    pub fn set_status(&mut self, status: TaskStatus) {
        self.internal_status = status;
        self.updated_at = now_ms();
    }

    /// Remember the most recent run
    pub fn set_last_run(&mut self, run_id: impl Into<String>) {
        self.last_run_id = Some(run_id.into());
        self.updated_at = now_ms();
    }

    /// Record the board column value last written
    pub fn set_board_status(&mut self, label: impl Into<String>) {
        self.board_status = Some(label.into());
        self.updated_at = now_ms();
    }

    /// Whether the task is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.internal_status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Abandoned | TaskStatus::QualityCheck
        )
    }

    /// Whether a follow-up comment may spawn a new run right now
    ///
    /// Terminal statuses completed / failed / quality_check are eligible;
    /// abandoned is not. Locked tasks and tasks in cooldown refuse.
    pub fn is_reactivatable(&self, now: i64) -> bool {
        let eligible_status = matches!(
            self.internal_status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::QualityCheck
        );
        let cooled_down = self.cooldown_until.is_none_or(|until| now >= until);
        eligible_status && !self.is_locked && cooled_down
    }
}

impl Record for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "tasks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "external_item_id".to_string(),
            IndexValue::Int(self.external_item_id),
        );
        fields.insert(
            "internal_status".to_string(),
            IndexValue::String(self.internal_status.to_string()),
        );
        fields.insert("priority".to_string(), IndexValue::String(self.priority.to_string()));
        fields
    }
}

/// Best-effort language detection for outbound comments
///
/// English is the default; French and Spanish are recognized from a small
/// set of high-frequency words. This only selects the comment template,
/// never the interpretation of replies.
pub fn detect_user_language(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();

    const FRENCH: &[&str] = &[
        "le", "la", "les", "une", "des", "est", "ajoute", "ajouter", "corrige", "corriger", "merci",
        "pour", "dans", "avec", "fichier",
    ];
    const SPANISH: &[&str] = &[
        "el", "los", "una", "es", "añade", "añadir", "agrega", "corrige", "gracias", "para",
        "archivo", "por favor",
    ];

    let french_hits = words.iter().filter(|w| FRENCH.contains(w)).count();
    let spanish_hits = words.iter().filter(|w| SPANISH.contains(w)).count();

    if french_hits >= 2 && french_hits > spanish_hits {
        "fr"
    } else if spanish_hits >= 2 {
        "es"
    } else {
        "en"
    }
}
