//! Intent-confidence scoring for follow-up comments
//!
//! The rule-based score is the baseline; the model, when available, may
//! refine mid-range scores. Reactivation is refused below the configured
//! threshold.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::llm::{CompletionRequest, LlmClient, LlmMessage};
use crate::signature::is_agent_comment;
use crate::validation::strip_markup;

/// Scores inside this band are worth a model refinement
const REFINE_LOW: f64 = 0.15;
const REFINE_HIGH: f64 = 0.75;

/// Outcome of analyzing a follow-up comment
#[derive(Debug, Clone)]
pub struct ReactivationDecision {
    pub accepted: bool,
    pub confidence: f64,
    pub reason: String,
}

/// The reactivation analyzer
pub struct ReactivationAnalyzer {
    threshold: f64,
    llm: Option<Arc<dyn LlmClient>>,
}

struct AnalyzerRegexes {
    greeting: Regex,
    acknowledgement: Regex,
    request: Regex,
    status_question: Regex,
}

fn regexes() -> &'static AnalyzerRegexes {
    static REGEXES: OnceLock<AnalyzerRegexes> = OnceLock::new();
    REGEXES.get_or_init(|| AnalyzerRegexes {
        greeting: Regex::new(r"(?i)^\s*(hi|hello|hey|bonjour|salut|hola|good\s+(morning|evening))\b[\s!.]*$").unwrap(),
        acknowledgement: Regex::new(
            r"(?i)^\s*(thanks?|thank\s+you|merci|gracias|ok|okay|great|nice|perfect|parfait|genial|cool|\+1|well\s+done)\b[\s!.]*$",
        )
        .unwrap(),
        request: Regex::new(
            r"(?xi)
            \b(add|create|implement|fix|change|update|remove|delete|rename|refactor|improve|support|make)\b
            | \b(ajoute[rz]?|corrige[rz]?|modifie[rz]?|implemente[rz]?|supprime[rz]?|cree[rz]?)\b
            | \b(añade|añadir|agrega|implementa|corrige|cambia|elimina)\b
            | \bplease\b | \bpourrais[- ]tu\b | \bpeux[- ]tu\b | \bpor\s+favor\b
            | \balso\b | \baussi\b | \btambien\b",
        )
        .unwrap(),
        status_question: Regex::new(r"(?i)\b(status|avancement|progress|done\s+yet|estado)\b").unwrap(),
    })
}

impl ReactivationAnalyzer {
    pub fn new(threshold: f64, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { threshold, llm }
    }

    /// Score a comment and decide whether it reactivates the task
    pub async fn analyze(&self, comment: &str) -> ReactivationDecision {
        if is_agent_comment(comment) {
            return ReactivationDecision {
                accepted: false,
                confidence: 0.0,
                reason: "comment carries the agent signature".to_string(),
            };
        }

        let cleaned = strip_markup(comment);
        let (mut confidence, mut reason) = rule_score(&cleaned);

        // Borderline scores get a second opinion when a model is available
        if let Some(llm) = &self.llm
            && (REFINE_LOW..REFINE_HIGH).contains(&confidence)
            && let Some(refined) = self.model_score(llm, &cleaned).await
        {
            confidence = refined;
            reason = format!("{} (model-refined)", reason);
        }

        let accepted = confidence >= self.threshold;
        debug!(confidence, accepted, %reason, "Reactivation analysis");
        ReactivationDecision {
            accepted,
            confidence,
            reason,
        }
    }

    async fn model_score(&self, llm: &Arc<dyn LlmClient>, cleaned: &str) -> Option<f64> {
        let request = CompletionRequest {
            system_prompt: "Rate from 0.0 to 1.0 how likely this comment is a request for new \
                            development work (as opposed to small talk or acknowledgement). \
                            Output ONLY the number."
                .to_string(),
            messages: vec![LlmMessage::user(cleaned.to_string())],
            max_tokens: 16,
        };

        match llm.complete(request).await {
            Ok(response) => response
                .content
                .and_then(|text| text.trim().parse::<f64>().ok())
                .map(|score| score.clamp(0.0, 1.0)),
            Err(e) => {
                warn!(error = %e, "Reactivation model scoring failed, keeping rule score");
                None
            }
        }
    }
}

/// Rule-based intent confidence
fn rule_score(cleaned: &str) -> (f64, String) {
    let word_count = cleaned.split_whitespace().count();

    if cleaned.len() < 4 {
        return (0.05, "too short to be a request".to_string());
    }
    if regexes().greeting.is_match(cleaned) {
        return (0.1, "greeting only".to_string());
    }
    if regexes().acknowledgement.is_match(cleaned) {
        return (0.1, "acknowledgement only".to_string());
    }
    if regexes().request.is_match(cleaned) {
        return (0.8, "imperative request keywords".to_string());
    }
    if regexes().status_question.is_match(cleaned) {
        return (0.3, "status question".to_string());
    }
    if word_count >= 4 {
        return (0.5, "substantial free text".to_string());
    }
    (0.2, "short free text".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::signature::sign_comment;

    fn analyzer() -> ReactivationAnalyzer {
        ReactivationAnalyzer::new(0.2, None)
    }

    #[tokio::test]
    async fn test_agent_comments_never_reactivate() {
        let signed = sign_comment("Please also add a readiness probe");
        let decision = analyzer().analyze(&signed).await;
        assert!(!decision.accepted);
        assert_eq!(decision.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_feature_request_reactivates() {
        let decision = analyzer().analyze("Please also add a readiness probe").await;
        assert!(decision.accepted);
        assert!(decision.confidence >= 0.2);
    }

    #[tokio::test]
    async fn test_french_request_reactivates() {
        let decision = analyzer().analyze("Ajoute aussi un endpoint de readiness").await;
        assert!(decision.accepted);
    }

    #[tokio::test]
    async fn test_greetings_and_thanks_refused() {
        for comment in ["hi!", "Hello", "thanks!", "merci", "ok", "great"] {
            let decision = analyzer().analyze(comment).await;
            assert!(!decision.accepted, "comment: {comment}");
        }
    }

    #[tokio::test]
    async fn test_very_short_comments_refused() {
        let decision = analyzer().analyze("ok").await;
        assert!(!decision.accepted);
        let decision = analyzer().analyze("..").await;
        assert!(!decision.accepted);
    }

    #[tokio::test]
    async fn test_substantial_text_passes_default_threshold() {
        let decision = analyzer().analyze("the new endpoint returns a 500 when the db is down").await;
        assert!(decision.accepted);
    }

    #[tokio::test]
    async fn test_high_threshold_refuses_mid_scores() {
        let strict = ReactivationAnalyzer::new(0.9, None);
        let decision = strict.analyze("the new endpoint returns a 500 when the db is down").await;
        assert!(!decision.accepted);
    }

    #[tokio::test]
    async fn test_model_refines_borderline_score() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(vec!["0.95".to_string()]));
        let analyzer = ReactivationAnalyzer::new(0.6, Some(llm));

        // "status" question rules at 0.3; the model raises it past the bar
        let decision = analyzer.analyze("what is the current status of this work").await;
        assert!(decision.accepted);
        assert!(decision.reason.contains("model-refined"));
    }

    #[tokio::test]
    async fn test_model_not_consulted_for_clear_requests() {
        // An exhausted mock would fail if consulted
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(vec![]));
        let analyzer = ReactivationAnalyzer::new(0.2, Some(llm));

        let decision = analyzer.analyze("Please add a retry to the uploader").await;
        assert!(decision.accepted);
        assert!(!decision.reason.contains("model-refined"));
    }
}
