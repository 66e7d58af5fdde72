//! Human-validation coordinator
//!
//! Posts the validation prompt as a board comment, polls the item's
//! updates for an authorized reply, interprets it, and returns the
//! verdict. Rejections chain new requests via `parent_validation_id`;
//! the configured rejection limit coerces the chain to abandon.

use std::collections::HashSet;
use std::time::Duration;

use eyre::Result;
use tracing::{debug, info, warn};

use crate::adapters::{BoardApi, BoardUpdate};
use crate::config::OrchestratorConfig;
use crate::domain::{
    AnalysisMethod, RunContext, Task, ValidationRequest, ValidationResponse, ValidationStatus, Verdict,
};
use crate::signature::{is_agent_comment, sign_comment};
use crate::state::StateManager;

use super::interpreter::{Interpretation, ReplyInterpreter, strip_markup};
use super::message;

/// Clock-skew tolerance when comparing reply timestamps
const REPLY_GRACE_MS: i64 = 30_000;

/// Attempts when posting the validation comment
const POST_ATTEMPTS: u32 = 3;

/// Why a chain ended in abandonment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonKind {
    /// The human said so
    Explicit,
    /// The rejection limit was hit
    RejectionLimit,
}

/// Final verdict returned to the scheduler
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    Approved,
    /// Posting failed on permissions but the work itself succeeded
    AutoApproved { reason: String },
    Rejected {
        instructions: Option<String>,
        rejection_count: u32,
    },
    Abandoned { kind: AbandonKind },
    /// No authorized reply within the timeout
    Expired,
}

/// Result of posting a validation prompt
pub struct PostedValidation {
    pub request: ValidationRequest,
    /// Posting failed with an authorization error; the flow may
    /// auto-approve if the underlying work succeeded
    pub permissions_failure: bool,
}

/// The validation coordinator
pub struct ValidationCoordinator {
    state: StateManager,
    board: std::sync::Arc<dyn BoardApi>,
    interpreter: ReplyInterpreter,
    config: OrchestratorConfig,
}

impl ValidationCoordinator {
    pub fn new(
        state: StateManager,
        board: std::sync::Arc<dyn BoardApi>,
        interpreter: ReplyInterpreter,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            state,
            board,
            interpreter,
            config,
        }
    }

    /// Build and post the validation prompt, creating the request row
    ///
    /// A permissions failure on posting is reported rather than raised so
    /// the caller can decide on auto-approval; any other posting failure
    /// is an error.
    pub async fn request_validation(
        &self,
        ctx: &RunContext,
        task: &Task,
        parent: Option<&ValidationRequest>,
    ) -> Result<PostedValidation> {
        let timeout_minutes = self.config.validation_timeout_secs / 60;
        let body = message::validation_body(
            ctx,
            task.creator_name.as_deref(),
            self.config.max_rejections,
            timeout_minutes,
        );
        let signed = sign_comment(&body);

        let mut request = match parent {
            Some(parent) => ValidationRequest::chained(parent, &signed),
            None => ValidationRequest::new(&ctx.run_id, &signed),
        };

        let mut permissions_failure = false;
        match self.post_with_retry(ctx.external_item_id, &signed).await {
            Ok(comment_id) => {
                request.set_external_comment(&comment_id);
                info!(run_id = %ctx.run_id, comment_id, "Validation prompt posted");
            }
            Err(e) if e.is_permissions() => {
                warn!(run_id = %ctx.run_id, error = %e, "Validation prompt hit a permissions error");
                permissions_failure = true;
            }
            Err(e) => return Err(eyre::eyre!("Failed to post validation prompt: {}", e)),
        }

        self.state
            .create_validation(request.clone())
            .await
            .map_err(|e| eyre::eyre!("Failed to persist validation request: {}", e))?;

        Ok(PostedValidation {
            request,
            permissions_failure,
        })
    }

    async fn post_with_retry(&self, item_id: i64, body: &str) -> Result<String, crate::adapters::BoardError> {
        let mut delay = Duration::from_secs(2);
        let mut attempt = 1;
        loop {
            match self.board.post_update(item_id, body).await {
                Ok(comment_id) => return Ok(comment_id),
                Err(e) if e.is_retryable() && attempt < POST_ATTEMPTS => {
                    warn!(attempt, error = %e, "Posting validation prompt failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record an auto-approved verdict after a permissions failure
    pub async fn auto_approve(
        &self,
        request: &mut ValidationRequest,
        reason: impl Into<String>,
    ) -> Result<ValidationOutcome> {
        let reason = reason.into();
        let response = ValidationResponse::new(
            &request.id,
            "",
            Verdict::Approve,
            1.0,
            AnalysisMethod::Rule,
        )
        .with_system_note(format!("Auto-approved: {}", reason));

        request.set_status(ValidationStatus::Approved);
        self.persist_decision(request, &response).await?;

        info!(validation_id = %request.id, "Validation auto-approved");
        Ok(ValidationOutcome::AutoApproved { reason })
    }

    /// Poll the board for an authorized reply and interpret it
    pub async fn await_response(
        &self,
        request: &mut ValidationRequest,
        task: &Task,
        timeout: Duration,
    ) -> Result<ValidationOutcome> {
        let item_id = task.external_item_id;
        let check_interval = self.config.validation_poll_interval().max(Duration::from_secs(1));

        // Early-exit threshold: ~120s of silence for short timeouts,
        // ~300s for long ones
        let interval_secs = check_interval.as_secs().max(1);
        let max_no_change = if timeout <= Duration::from_secs(600) {
            (120 / interval_secs).max(4)
        } else {
            (300 / interval_secs).max(10)
        };

        info!(
            validation_id = %request.id,
            item_id,
            timeout_secs = timeout.as_secs(),
            "Waiting for human reply"
        );

        let mut watch = ReplyWatch::new(request, task);

        // Fast initial probes at 0, 2, 5 seconds; transient board errors
        // here only delay discovery
        for delay_secs in [0u64, 2, 5] {
            if delay_secs > 0 {
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            }
            match self.probe(&mut watch, item_id, task).await {
                Ok(Some(decision)) => return self.settle(request, decision).await,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Early reply probe failed"),
            }
        }

        let started = tokio::time::Instant::now();
        let mut consecutive_no_changes = 0u64;

        while started.elapsed() < timeout {
            tokio::time::sleep(check_interval).await;

            let before = watch.seen_update_count;
            match self.probe(&mut watch, item_id, task).await {
                Ok(Some(decision)) => return self.settle(request, decision).await,
                Ok(None) => {
                    if watch.seen_update_count > before {
                        consecutive_no_changes = 0;
                    } else {
                        consecutive_no_changes += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Reply polling failed");
                    consecutive_no_changes += 1;
                }
            }

            if consecutive_no_changes >= max_no_change {
                warn!(
                    validation_id = %request.id,
                    silent_secs = consecutive_no_changes * interval_secs,
                    "No board activity, stopping the wait early"
                );
                // One final look before giving up
                if let Ok(Some(decision)) = self.probe(&mut watch, item_id, task).await {
                    return self.settle(request, decision).await;
                }
                break;
            }
        }

        request.set_status(ValidationStatus::Expired);
        self.state
            .update_validation(request.clone())
            .await
            .map_err(|e| eyre::eyre!("Failed to persist expired validation: {}", e))?;

        info!(validation_id = %request.id, "Validation expired without an authorized reply");
        Ok(ValidationOutcome::Expired)
    }

    /// One polling pass; Some(..) when an authorized reply was interpreted
    async fn probe(
        &self,
        watch: &mut ReplyWatch,
        item_id: i64,
        task: &Task,
    ) -> Result<Option<Decision>> {
        let updates = self.board.list_updates(item_id).await?;
        watch.seen_update_count = updates.len();

        let (reply, intruders) = watch.find_authorized_reply(&updates);

        for intruder in intruders {
            if watch.notified_intruders.insert(intruder.id.clone()) {
                self.notify_unauthorized(item_id, task, &watch.creator_name, &intruder.name).await;
            }
        }

        let Some(reply) = reply else {
            return Ok(None);
        };
        watch.processed_reply_ids.insert(reply.id.clone());

        let text = strip_markup(&reply.body);
        let interpretation = self.interpreter.interpret(&text).await;
        debug!(
            reply_id = %reply.id,
            verdict = %interpretation.verdict,
            confidence = interpretation.confidence,
            "Reply interpreted"
        );

        // Non-verdicts keep the wait alive
        if matches!(
            interpretation.verdict,
            Verdict::Question | Verdict::Unclear | Verdict::ClarificationNeeded
        ) {
            debug!(reply_id = %reply.id, "Reply carries no verdict, continuing to wait");
            return Ok(None);
        }

        Ok(Some(Decision {
            reply: reply.clone(),
            interpretation,
        }))
    }

    async fn notify_unauthorized(&self, item_id: i64, task: &Task, creator_name: &str, intruder_name: &str) {
        warn!(item_id, intruder = intruder_name, "Unauthorized validation reply");
        let body = message::unauthorized_reply_comment(creator_name, intruder_name, &task.title);
        if let Err(e) = self.board.post_update(item_id, &sign_comment(&body)).await {
            warn!(error = %e, "Failed to post unauthorized-reply notification");
        }
    }

    /// Persist the interpreted verdict and map it to an outcome
    async fn settle(&self, request: &mut ValidationRequest, decision: Decision) -> Result<ValidationOutcome> {
        let Decision { reply, interpretation } = decision;
        let Interpretation {
            verdict,
            confidence,
            method,
            instructions,
        } = interpretation;

        let reviewer_id = reply.creator.as_ref().map(|c| c.id.clone());
        let reviewer_name = reply.creator.as_ref().map(|c| c.name.clone());

        let outcome = match verdict {
            Verdict::Approve => {
                request.set_status(ValidationStatus::Approved);
                let response = ValidationResponse::new(&request.id, &reply.body, verdict, confidence, method)
                    .with_reviewer(reviewer_id, reviewer_name);
                self.persist_decision(request, &response).await?;
                ValidationOutcome::Approved
            }
            Verdict::Reject => {
                let next_count = request.rejection_count + 1;
                if next_count >= self.config.max_rejections {
                    // Coerce to abandon; the chain must not loop again
                    request.rejection_count = next_count;
                    request.set_status(ValidationStatus::Abandoned);
                    let response =
                        ValidationResponse::new(&request.id, &reply.body, Verdict::Abandon, confidence, method)
                            .with_reviewer(reviewer_id, reviewer_name)
                            .with_system_note(format!(
                                "Rejection limit of {} reached, abandoning",
                                self.config.max_rejections
                            ));
                    self.persist_decision(request, &response).await?;
                    info!(validation_id = %request.id, "Rejection limit reached, chain abandoned");
                    ValidationOutcome::Abandoned {
                        kind: AbandonKind::RejectionLimit,
                    }
                } else {
                    request.record_rejection(instructions.clone());
                    let response =
                        ValidationResponse::new(&request.id, &reply.body, verdict, confidence, method)
                            .with_reviewer(reviewer_id, reviewer_name)
                            .with_instructions(instructions.clone())
                            .with_system_note(format!(
                                "Attempt {}/{}",
                                next_count, self.config.max_rejections
                            ));
                    self.persist_decision(request, &response).await?;
                    ValidationOutcome::Rejected {
                        instructions,
                        rejection_count: next_count,
                    }
                }
            }
            Verdict::Abandon => {
                request.set_status(ValidationStatus::Abandoned);
                let response = ValidationResponse::new(&request.id, &reply.body, verdict, confidence, method)
                    .with_reviewer(reviewer_id, reviewer_name);
                self.persist_decision(request, &response).await?;
                ValidationOutcome::Abandoned {
                    kind: AbandonKind::Explicit,
                }
            }
            // Filtered out in probe()
            Verdict::ClarificationNeeded | Verdict::Question | Verdict::Unclear => {
                unreachable!("non-verdicts never settle")
            }
        };

        Ok(outcome)
    }

    async fn persist_decision(
        &self,
        request: &ValidationRequest,
        response: &ValidationResponse,
    ) -> Result<()> {
        self.state
            .update_validation(request.clone())
            .await
            .map_err(|e| eyre::eyre!("Failed to persist validation request: {}", e))?;
        self.state
            .create_validation_response(response.clone())
            .await
            .map_err(|e| eyre::eyre!("Failed to persist validation response: {}", e))?;
        Ok(())
    }
}

struct Decision {
    reply: BoardUpdate,
    interpretation: Interpretation,
}

/// Intruder identity captured during a probe
struct Intruder {
    id: String,
    name: String,
}

/// Mutable scan state across polling passes
struct ReplyWatch {
    comment_id: Option<String>,
    reference_ts: i64,
    creator_id: Option<String>,
    creator_email: Option<String>,
    creator_name: String,
    seen_update_count: usize,
    processed_reply_ids: HashSet<String>,
    notified_intruders: HashSet<String>,
}

impl ReplyWatch {
    fn new(request: &ValidationRequest, task: &Task) -> Self {
        Self {
            comment_id: request.external_comment_id.clone(),
            reference_ts: request.created_at,
            // Task creator is the fallback authority until the posted
            // comment's creator is discovered from board data
            creator_id: task.creator_id.clone(),
            creator_email: task.creator_email.clone(),
            creator_name: task.creator_name.clone().unwrap_or_else(|| "the requester".to_string()),
            seen_update_count: 0,
            processed_reply_ids: HashSet::new(),
            notified_intruders: HashSet::new(),
        }
    }

    /// Locate the earliest authorized validation reply, collecting
    /// unauthorized attempts along the way
    fn find_authorized_reply<'a>(&mut self, updates: &'a [BoardUpdate]) -> (Option<&'a BoardUpdate>, Vec<Intruder>) {
        // Refresh the reference point from our own posted comment
        if let Some(comment_id) = &self.comment_id
            && let Some(own) = updates.iter().find(|u| &u.id == comment_id)
        {
            self.reference_ts = own.created_at;
            if let Some(creator) = &own.creator {
                self.creator_id = Some(creator.id.clone());
                self.creator_name = creator.name.clone();
                if creator.email.is_some() {
                    self.creator_email = creator.email.clone();
                }
            }
        }

        let threshold = self.reference_ts - REPLY_GRACE_MS;
        let mut intruders = Vec::new();
        let mut direct: Vec<&BoardUpdate> = Vec::new();
        let mut keyword: Vec<&BoardUpdate> = Vec::new();

        for update in updates {
            if Some(&update.id) == self.comment_id.as_ref()
                || update.created_at <= threshold
                || update.body.trim().is_empty()
                || is_agent_comment(&update.body)
                || self.processed_reply_ids.contains(&update.id)
            {
                continue;
            }

            if !self.is_authorized(update) {
                if let Some(creator) = &update.creator {
                    intruders.push(Intruder {
                        id: creator.id.clone(),
                        name: creator.name.clone(),
                    });
                }
                continue;
            }

            let replies_to_us = match (&update.reply_to_id, &self.comment_id) {
                (Some(reply_to), Some(ours)) => reply_to == ours,
                _ => false,
            };
            if replies_to_us {
                direct.push(update);
            } else if looks_like_validation_reply(&update.body) {
                keyword.push(update);
            }
        }

        // First by timestamp wins within the strongest tier
        direct.sort_by_key(|u| u.created_at);
        keyword.sort_by_key(|u| u.created_at);
        (direct.into_iter().next().or_else(|| keyword.into_iter().next()), intruders)
    }

    /// Only the creator of the validation request may answer; matched by
    /// user id, falling back to case-insensitive email comparison
    fn is_authorized(&self, update: &BoardUpdate) -> bool {
        let Some(creator) = &update.creator else {
            // Replies without identity cannot be authorized once we know
            // who we are waiting for
            return self.creator_id.is_none() && self.creator_email.is_none();
        };

        if let Some(expected) = &self.creator_id {
            return &creator.id == expected;
        }
        if let (Some(expected), Some(actual)) = (&self.creator_email, &creator.email) {
            return expected.eq_ignore_ascii_case(actual);
        }
        // Nobody identified to enforce against
        true
    }
}

/// Quick test for reply bodies that look like a verdict
fn looks_like_validation_reply(body: &str) -> bool {
    let cleaned = strip_markup(body);
    let lower = cleaned.to_lowercase();
    let exact = lower.trim_end_matches(['.', '!']).trim();
    if matches!(
        exact,
        "oui" | "yes" | "ok" | "okay" | "si" | "y" | "o" | "n" | "non" | "no" | "nope" | "valide" | "valid"
            | "approve" | "reject" | "lgtm" | "abandon" | "stop"
    ) {
        return true;
    }

    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        regex::Regex::new(
            r"(?xi)
            \b(oui|yes|ok|valide?|approved?|approve|accept|go|lgtm|merge|ship|deploy)\b
            | \b(non|no|nope|debug|fix|reject|refuse)\b
            | \b(abandon|stop)\b
            | looks?\s+good
            | c'?est\s+bon
            | je\s+valide
            | ne\s+marche\s+pas",
        )
        .unwrap()
    });
    pattern.is_match(&lower)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::BoardUser;
    use boardstore::now_ms;

    fn make_task() -> Task {
        Task::new(99, "Add endpoint", "desc").with_creator(
            Some("u-1".into()),
            Some("Ada".into()),
            Some("ada@example.com".into()),
        )
    }

    fn make_request(comment_id: &str) -> ValidationRequest {
        let mut request = ValidationRequest::new("run_1", "body");
        request.set_external_comment(comment_id);
        request
    }

    fn update(id: &str, body: &str, created_at: i64, reply_to: Option<&str>, user: Option<(&str, &str)>) -> BoardUpdate {
        BoardUpdate {
            id: id.to_string(),
            body: body.to_string(),
            created_at,
            reply_to_id: reply_to.map(String::from),
            creator: user.map(|(id, name)| BoardUser {
                id: id.to_string(),
                name: name.to_string(),
                email: Some(format!("{}@example.com", name.to_lowercase())),
            }),
        }
    }

    #[test]
    fn test_direct_reply_is_found() {
        let task = make_task();
        let request = make_request("c-1");
        let mut watch = ReplyWatch::new(&request, &task);

        let now = now_ms();
        // The posted comment is attributed to the integration user who
        // created the request; that identity is the reply authority
        let updates = vec![
            update("c-1", "validation prompt", now - 60_000, None, Some(("u-1", "Ada"))),
            update("c-2", "yes", now, Some("c-1"), Some(("u-1", "Ada"))),
        ];

        let (reply, intruders) = watch.find_authorized_reply(&updates);
        assert_eq!(reply.unwrap().id, "c-2");
        assert!(intruders.is_empty());
        // Reference point moved to the posted comment's timestamp
        assert_eq!(watch.reference_ts, now - 60_000);
    }

    #[test]
    fn test_unauthorized_reply_is_rejected_and_reported() {
        let task = make_task();
        let request = make_request("c-1");
        let mut watch = ReplyWatch::new(&request, &task);

        let now = now_ms();
        let updates = vec![update("c-2", "yes", now, Some("c-1"), Some(("u-2", "Grace")))];

        let (reply, intruders) = watch.find_authorized_reply(&updates);
        assert!(reply.is_none());
        assert_eq!(intruders.len(), 1);
        assert_eq!(intruders[0].name, "Grace");
    }

    #[test]
    fn test_email_fallback_authorization() {
        let mut task = make_task();
        task.creator_id = None;
        task.creator_email = Some("ADA@example.com".into());
        let request = make_request("c-1");
        let mut watch = ReplyWatch::new(&request, &task);

        let now = now_ms();
        // BoardUser email is ada@example.com; case differs from the task's
        let updates = vec![update("c-2", "yes", now, Some("c-1"), Some(("u-9", "Ada")))];

        let (reply, _) = watch.find_authorized_reply(&updates);
        assert!(reply.is_some());
    }

    #[test]
    fn test_agent_comments_never_satisfy_validation() {
        let task = make_task();
        let request = make_request("c-1");
        let mut watch = ReplyWatch::new(&request, &task);

        let now = now_ms();
        let signed = sign_comment("yes");
        let updates = vec![update("c-2", &signed, now, Some("c-1"), Some(("u-1", "Ada")))];

        let (reply, _) = watch.find_authorized_reply(&updates);
        assert!(reply.is_none());
    }

    #[test]
    fn test_old_updates_are_ignored_with_grace_window() {
        let task = make_task();
        let request = make_request("c-1");
        let mut watch = ReplyWatch::new(&request, &task);
        let reference = watch.reference_ts;

        // Within the 30s grace window: accepted
        let inside = vec![update("c-2", "yes", reference - 10_000, Some("c-1"), Some(("u-1", "Ada")))];
        let (reply, _) = watch.find_authorized_reply(&inside);
        assert!(reply.is_some());

        // Beyond the grace window: ignored
        let mut watch = ReplyWatch::new(&request, &task);
        let outside = vec![update("c-3", "yes", reference - 40_000, Some("c-1"), Some(("u-1", "Ada")))];
        let (reply, _) = watch.find_authorized_reply(&outside);
        assert!(reply.is_none());
    }

    #[test]
    fn test_first_reply_by_timestamp_wins() {
        let task = make_task();
        let request = make_request("c-1");
        let mut watch = ReplyWatch::new(&request, &task);

        let now = now_ms();
        let updates = vec![
            update("c-3", "no, fix it", now + 5_000, Some("c-1"), Some(("u-1", "Ada"))),
            update("c-2", "yes", now, Some("c-1"), Some(("u-1", "Ada"))),
        ];

        let (reply, _) = watch.find_authorized_reply(&updates);
        assert_eq!(reply.unwrap().id, "c-2");
    }

    #[test]
    fn test_keyword_fallback_without_reply_reference() {
        let task = make_task();
        let request = make_request("c-1");
        let mut watch = ReplyWatch::new(&request, &task);

        let now = now_ms();
        let updates = vec![
            update("c-2", "totally unrelated musing", now, None, Some(("u-1", "Ada"))),
            update("c-3", "ok merge it", now + 1000, None, Some(("u-1", "Ada"))),
        ];

        let (reply, _) = watch.find_authorized_reply(&updates);
        assert_eq!(reply.unwrap().id, "c-3");
    }

    #[test]
    fn test_looks_like_validation_reply() {
        assert!(looks_like_validation_reply("yes"));
        assert!(looks_like_validation_reply("Ok!"));
        assert!(looks_like_validation_reply("no, rename the handler"));
        assert!(looks_like_validation_reply("<p>je valide</p>"));
        assert!(!looks_like_validation_reply("what lovely weather"));
    }
}
