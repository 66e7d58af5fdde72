//! Human reply interpretation
//!
//! The rule-based matcher is authoritative for the known keyword set; the
//! LLM only refines replies the rules cannot classify confidently.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::domain::{AnalysisMethod, Verdict};
use crate::llm::{CompletionRequest, LlmClient, LlmMessage};

/// Confidence below which the model refinement is consulted
const MODEL_REFINEMENT_THRESHOLD: f64 = 0.7;

/// Interpreted reply
#[derive(Debug, Clone)]
pub struct Interpretation {
    pub verdict: Verdict,
    pub confidence: f64,
    pub method: AnalysisMethod,
    pub instructions: Option<String>,
}

/// Reply interpreter with optional model refinement
pub struct ReplyInterpreter {
    llm: Option<Arc<dyn LlmClient>>,
}

fn regexes() -> &'static InterpreterRegexes {
    static REGEXES: OnceLock<InterpreterRegexes> = OnceLock::new();
    REGEXES.get_or_init(InterpreterRegexes::new)
}

struct InterpreterRegexes {
    markup: Regex,
    bold: Regex,
    abandon: Regex,
    rejection: Regex,
    approval: Regex,
    question: Regex,
    rejection_prefix: Regex,
}

impl InterpreterRegexes {
    fn new() -> Self {
        Self {
            markup: Regex::new(r"<[^>]+>").unwrap(),
            bold: Regex::new(r"\*\*([^*]+)\*\*").unwrap(),
            abandon: Regex::new(r"\b(abandon|abandonne[rz]?|stop|cancel|annule[rz]?|detener)\b").unwrap(),
            rejection: Regex::new(
                r"(?x)
                \b(non|no|nope|reject|rejette|refuse|debug|fix|redo|refais)\b
                | \b(probl[eè]me?s?|issue|error|bug|erreur)\b
                | ne\s+marche\s+pas
                | pas\s+(bon|ok|valide)",
            )
            .unwrap(),
            approval: Regex::new(
                r"(?x)
                \b(oui|yes|ok|okay|si|valide?|valida|approved?|approve|accept|go|lgtm)\b
                | \b(merge|ship|deploy|good|perfect|correct)\b
                | looks?\s+good
                | c'?est\s+bon
                | je\s+valide",
            )
            .unwrap(),
            question: Regex::new(r"^\s*(what|why|how|when|where|who|comment|pourquoi|quand|que|qui|por\s*que)\b")
                .unwrap(),
            rejection_prefix: Regex::new(r"^\s*(non|no|nope|debug|fix|redo|refais|reject)[\s,;:.!-]*").unwrap(),
        }
    }
}

impl ReplyInterpreter {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    /// Interpret a raw reply body
    pub async fn interpret(&self, reply: &str) -> Interpretation {
        let cleaned = strip_markup(reply);
        let rule = rule_based(&cleaned);

        // High-confidence keyword matches are never overridden
        if rule.confidence >= MODEL_REFINEMENT_THRESHOLD {
            return rule;
        }

        let Some(llm) = &self.llm else {
            return rule;
        };

        match self.model_refinement(llm, &cleaned).await {
            Some(refined) => refined,
            None => rule,
        }
    }

    async fn model_refinement(&self, llm: &Arc<dyn LlmClient>, cleaned: &str) -> Option<Interpretation> {
        let request = CompletionRequest {
            system_prompt: "Classify the intent of a reply to a code-review validation request. \
                            Output ONLY a JSON object: {\"verdict\": one of approve|reject|abandon|\
                            clarification_needed|question|unclear, \"confidence\": number 0-1}."
                .to_string(),
            messages: vec![LlmMessage::user(cleaned.to_string())],
            max_tokens: 128,
        };

        let response = match llm.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Reply model refinement failed, keeping rule verdict");
                return None;
            }
        };

        let text = response.content?;
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        let value: serde_json::Value = serde_json::from_str(&text[start..=end]).ok()?;

        let verdict = match value["verdict"].as_str()? {
            "approve" => Verdict::Approve,
            "reject" => Verdict::Reject,
            "abandon" => Verdict::Abandon,
            "clarification_needed" => Verdict::ClarificationNeeded,
            "question" => Verdict::Question,
            _ => Verdict::Unclear,
        };
        let confidence = value["confidence"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0);

        debug!(%verdict, confidence, "Model refinement used for reply");
        Some(Interpretation {
            instructions: if verdict == Verdict::Reject {
                extract_instructions(cleaned)
            } else {
                None
            },
            verdict,
            confidence,
            method: AnalysisMethod::Model,
        })
    }
}

/// Strip HTML tags, bold markers and invisible characters from a reply
pub fn strip_markup(text: &str) -> String {
    let no_invisible: String = text
        .chars()
        .filter(|c| !matches!(c, '\u{feff}' | '\u{200b}'))
        .map(|c| if c == '\u{a0}' { ' ' } else { c })
        .collect();
    let no_tags = regexes().markup.replace_all(&no_invisible, "");
    let no_bold = regexes().bold.replace_all(&no_tags, "$1");
    no_bold.trim().to_string()
}

/// Authoritative keyword matcher
fn rule_based(cleaned: &str) -> Interpretation {
    let lower = cleaned.to_lowercase();

    if lower.is_empty() {
        return Interpretation {
            verdict: Verdict::Unclear,
            confidence: 0.1,
            method: AnalysisMethod::Rule,
            instructions: None,
        };
    }

    // Exact short answers first
    let exact = lower.trim_end_matches(['.', '!']).trim();
    match exact {
        "oui" | "yes" | "ok" | "okay" | "si" | "y" | "o" | "valide" | "valid" | "approve" | "lgtm" => {
            return Interpretation {
                verdict: Verdict::Approve,
                confidence: 0.95,
                method: AnalysisMethod::Rule,
                instructions: None,
            };
        }
        "non" | "no" | "n" | "nope" | "reject" => {
            return Interpretation {
                verdict: Verdict::Reject,
                confidence: 0.95,
                method: AnalysisMethod::Rule,
                instructions: None,
            };
        }
        "abandon" | "stop" => {
            return Interpretation {
                verdict: Verdict::Abandon,
                confidence: 0.95,
                method: AnalysisMethod::Rule,
                instructions: None,
            };
        }
        _ => {}
    }

    if regexes().abandon.is_match(&lower) {
        return Interpretation {
            verdict: Verdict::Abandon,
            confidence: 0.9,
            method: AnalysisMethod::Rule,
            instructions: None,
        };
    }

    if regexes().rejection.is_match(&lower) {
        return Interpretation {
            verdict: Verdict::Reject,
            confidence: 0.85,
            method: AnalysisMethod::Rule,
            instructions: extract_instructions(cleaned),
        };
    }

    if regexes().approval.is_match(&lower) {
        return Interpretation {
            verdict: Verdict::Approve,
            confidence: 0.8,
            method: AnalysisMethod::Rule,
            instructions: None,
        };
    }

    if lower.ends_with('?') || regexes().question.is_match(&lower) {
        return Interpretation {
            verdict: Verdict::Question,
            confidence: 0.5,
            method: AnalysisMethod::Rule,
            instructions: None,
        };
    }

    Interpretation {
        verdict: Verdict::Unclear,
        confidence: 0.3,
        method: AnalysisMethod::Rule,
        instructions: None,
    }
}

/// Extract modification instructions from a rejecting reply
///
/// Strips the leading rejection keyword; a reply that is substantial
/// beyond the keyword becomes the instruction text.
pub fn extract_instructions(reply: &str) -> Option<String> {
    let stripped = regexes().rejection_prefix.replace(reply.trim(), "").trim().to_string();
    if stripped.len() > 10 {
        return Some(stripped);
    }
    let full = reply.trim();
    if full.len() > 5 {
        return Some(full.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    async fn interpret_rules(reply: &str) -> Interpretation {
        ReplyInterpreter::new(None).interpret(reply).await
    }

    #[tokio::test]
    async fn test_short_approvals() {
        for reply in ["yes", "ok", "oui", "valide", "LGTM", "Yes!"] {
            let result = interpret_rules(reply).await;
            assert_eq!(result.verdict, Verdict::Approve, "reply: {reply}");
            assert!(result.confidence >= 0.9);
            assert_eq!(result.method, AnalysisMethod::Rule);
        }
    }

    #[tokio::test]
    async fn test_short_rejections() {
        for reply in ["no", "non", "nope"] {
            let result = interpret_rules(reply).await;
            assert_eq!(result.verdict, Verdict::Reject, "reply: {reply}");
        }
    }

    #[tokio::test]
    async fn test_abandon_keywords() {
        for reply in ["abandon", "stop", "please stop this workflow"] {
            let result = interpret_rules(reply).await;
            assert_eq!(result.verdict, Verdict::Abandon, "reply: {reply}");
        }
    }

    #[tokio::test]
    async fn test_rejection_with_instructions() {
        let result = interpret_rules("no, rename the handler to 'healthz'").await;
        assert_eq!(result.verdict, Verdict::Reject);
        assert_eq!(result.instructions.as_deref(), Some("rename the handler to 'healthz'"));
    }

    #[tokio::test]
    async fn test_rejection_beats_approval_in_mixed_reply() {
        // "good" appears but the reply opens with a rejection
        let result = interpret_rules("no, the idea is good but fix the tests first").await;
        assert_eq!(result.verdict, Verdict::Reject);
    }

    #[tokio::test]
    async fn test_question_detection() {
        let result = interpret_rules("what does this change do?").await;
        assert_eq!(result.verdict, Verdict::Question);

        let result = interpret_rules("pourquoi ce fichier est modifie").await;
        assert_eq!(result.verdict, Verdict::Question);
    }

    #[tokio::test]
    async fn test_unclear_free_text() {
        let result = interpret_rules("interesting weather today").await;
        assert_eq!(result.verdict, Verdict::Unclear);
        assert!(result.confidence < 0.5);
    }

    #[test]
    fn test_strip_markup() {
        assert_eq!(strip_markup("<p>yes</p>"), "yes");
        assert_eq!(strip_markup("**no**, fix it"), "no, fix it");
        assert_eq!(strip_markup("\u{feff}ok\u{200b}"), "ok");
        assert_eq!(strip_markup("a\u{a0}b"), "a b");
    }

    #[test]
    fn test_extract_instructions_strips_prefix() {
        assert_eq!(
            extract_instructions("No, adjust file X and add tests").as_deref(),
            Some("adjust file X and add tests")
        );
        // Bare rejection keeps nothing
        assert_eq!(extract_instructions("no"), None);
        // Short but substantial reply falls back to the full text
        assert_eq!(extract_instructions("fix CI now").as_deref(), Some("fix CI now"));
    }

    #[tokio::test]
    async fn test_model_refines_unclear_reply() {
        let llm: Arc<dyn crate::llm::LlmClient> = Arc::new(MockLlmClient::new(vec![
            r#"{"verdict": "approve", "confidence": 0.82}"#.to_string(),
        ]));
        let interpreter = ReplyInterpreter::new(Some(llm));

        let result = interpreter.interpret("hmm I suppose that will work").await;
        assert_eq!(result.verdict, Verdict::Approve);
        assert_eq!(result.method, AnalysisMethod::Model);
    }

    #[tokio::test]
    async fn test_model_never_overrides_keyword_match() {
        // If the model were consulted, it would say approve; the rule-based
        // "no" must win
        let llm: Arc<dyn crate::llm::LlmClient> = Arc::new(MockLlmClient::new(vec![
            r#"{"verdict": "approve", "confidence": 0.99}"#.to_string(),
        ]));
        let interpreter = ReplyInterpreter::new(Some(llm.clone()));

        let result = interpreter.interpret("no").await;
        assert_eq!(result.verdict, Verdict::Reject);
        assert_eq!(result.method, AnalysisMethod::Rule);
    }

    #[tokio::test]
    async fn test_model_failure_keeps_rule_verdict() {
        let llm: Arc<dyn crate::llm::LlmClient> = Arc::new(MockLlmClient::new(vec![]));
        let interpreter = ReplyInterpreter::new(Some(llm));

        let result = interpreter.interpret("mysterious text lacking keywords").await;
        assert_eq!(result.verdict, Verdict::Unclear);
        assert_eq!(result.method, AnalysisMethod::Rule);
    }
}
