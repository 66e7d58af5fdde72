//! Agent comment signing
//!
//! Every comment the orchestrator posts carries a hidden HTML-comment
//! signature plus a visible footer. The ingress and the validation
//! coordinator use the signature to avoid self-triggering.

use regex::Regex;
use std::sync::OnceLock;

/// Fixed token inside the hidden signature
pub const SIGNATURE_TOKEN: &str = "AI_AGENT_SIGNATURE_";

/// Visible footer appended to every agent comment
pub const AGENT_FOOTER: &str = "\n\n---\n[AI-AGENT] - Automated workflow";

fn signature_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<!--\s*AI_AGENT_SIGNATURE_[0-9a-fA-F]{8}\s*-->").unwrap())
}

/// Wrap a comment body with the hidden signature and visible footer
pub fn sign_comment(body: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("<!-- {}{} -->\n{}{}", SIGNATURE_TOKEN, &uuid[..8], body, AGENT_FOOTER)
}

/// Whether a comment was produced by the agent
///
/// The hidden signature is authoritative; the visible footer is a fallback
/// for platforms that strip HTML comments.
pub fn is_agent_comment(text: &str) -> bool {
    if signature_pattern().is_match(text) || text.contains(SIGNATURE_TOKEN) {
        return true;
    }
    text.contains("[AI-AGENT]")
}
