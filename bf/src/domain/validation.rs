//! Human validation domain types
//!
//! A ValidationRequest is one prompt posted to the board; successive
//! reject-and-retry cycles chain requests via `parent_validation_id`.
//! Each request owns at most one interpreted ValidationResponse.

use std::collections::HashMap;

use boardstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

/// Status of a validation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Abandoned,
    Expired,
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Abandoned => write!(f, "abandoned"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Interpreted intent of a human reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
    Abandon,
    ClarificationNeeded,
    Question,
    Unclear,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reject => write!(f, "reject"),
            Self::Abandon => write!(f, "abandon"),
            Self::ClarificationNeeded => write!(f, "clarification_needed"),
            Self::Question => write!(f, "question"),
            Self::Unclear => write!(f, "unclear"),
        }
    }
}

/// How a reply was interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    Rule,
    Model,
}

impl std::fmt::Display for AnalysisMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rule => write!(f, "rule"),
            Self::Model => write!(f, "model"),
        }
    }
}

/// One validation prompt posted to the board
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub id: String,

    /// Owning run
    pub run_id: String,

    /// Comment id returned by the board, if posting succeeded
    pub external_comment_id: Option<String>,

    /// Body that was posted
    pub body: String,

    pub status: ValidationStatus,

    /// Rejections accumulated along this request's chain; never decreases
    pub rejection_count: u32,

    /// Previous request in the chain, for re-prompts after a rejection
    pub parent_validation_id: Option<String>,

    /// Instructions extracted from the rejecting reply
    pub modification_instructions: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl ValidationRequest {
    /// Create a fresh request for a run
    pub fn new(run_id: impl Into<String>, body: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("validation"),
            run_id: run_id.into(),
            external_comment_id: None,
            body: body.into(),
            status: ValidationStatus::Pending,
            rejection_count: 0,
            parent_validation_id: None,
            modification_instructions: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a re-prompt chained to a rejected request
    pub fn chained(parent: &ValidationRequest, body: impl Into<String>) -> Self {
        let mut request = Self::new(parent.run_id.clone(), body);
        request.parent_validation_id = Some(parent.id.clone());
        request.rejection_count = parent.rejection_count;
        request
    }

    /// Record the board comment id once posted
    pub fn set_external_comment(&mut self, comment_id: impl Into<String>) {
        self.external_comment_id = Some(comment_id.into());
        self.updated_at = now_ms();
    }

    /// Terminal transition
    pub fn set_status(&mut self, status: ValidationStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    /// Record a rejection, bumping the chain count
    pub fn record_rejection(&mut self, instructions: Option<String>) {
        self.rejection_count += 1;
        self.modification_instructions = instructions;
        self.status = ValidationStatus::Rejected;
        self.updated_at = now_ms();
    }
}

impl Record for ValidationRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "validation_requests"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("run_id".to_string(), IndexValue::String(self.run_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        if let Some(parent) = &self.parent_validation_id {
            fields.insert("parent_validation_id".to_string(), IndexValue::String(parent.clone()));
        }
        fields
    }
}

/// The interpreted human reply to a validation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub id: String,

    /// Owning request; at most one response per request
    pub validation_id: String,

    /// Raw reply text as received
    pub reply_text: String,

    pub verdict: Verdict,

    /// Interpreter confidence in [0, 1]
    pub confidence: f64,

    pub analysis_method: AnalysisMethod,

    /// Extracted modification instructions, for rejections
    pub modification_instructions: Option<String>,

    /// Identity of the replier
    pub reviewer_id: Option<String>,
    pub reviewer_name: Option<String>,

    /// Annotation added by the system (e.g. rejection-limit coercion)
    pub system_note: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl ValidationResponse {
    pub fn new(
        validation_id: impl Into<String>,
        reply_text: impl Into<String>,
        verdict: Verdict,
        confidence: f64,
        analysis_method: AnalysisMethod,
    ) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("response"),
            validation_id: validation_id.into(),
            reply_text: reply_text.into(),
            verdict,
            confidence: confidence.clamp(0.0, 1.0),
            analysis_method,
            modification_instructions: None,
            reviewer_id: None,
            reviewer_name: None,
            system_note: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder method to attach the replier identity
    pub fn with_reviewer(mut self, id: Option<String>, name: Option<String>) -> Self {
        self.reviewer_id = id;
        self.reviewer_name = name;
        self
    }

    /// Builder method to attach extracted instructions
    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.modification_instructions = instructions;
        self
    }

    /// Builder method to attach a system annotation
    pub fn with_system_note(mut self, note: impl Into<String>) -> Self {
        self.system_note = Some(note.into());
        self
    }
}

impl Record for ValidationResponse {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "validation_responses"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "validation_id".to_string(),
            IndexValue::String(self.validation_id.clone()),
        );
        fields.insert("verdict".to_string(), IndexValue::String(self.verdict.to_string()));
        fields
    }
}
