//! Slug generation: a deterministic sanitizer plus an LLM-assisted
//! first-message slug. Uniqueness suffixing lives at the store boundary
//! ([`crate::db::Database::get_or_create_subagent`] and the `-1`, `-2`, …
//! retry loop in callers that create top-level conversations).

use crate::llm::{ContentBlock, LlmMessage, LlmRequest, LlmService, MessageRole, SystemContent};
use std::time::Duration;
use tokio::time::timeout;

const MAX_SLUG_LEN: usize = 60;
const GENERATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lowercase, keep `[a-z0-9-]`, map space/underscore to `-`, collapse runs,
/// trim, truncate to 60 chars then re-trim. Idempotent: `sanitize(sanitize(s))
/// == sanitize(s)`.
pub fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_dash = false;
    for ch in s.chars() {
        let mapped = if ch == ' ' || ch == '_' {
            Some('-')
        } else {
            let lower = ch.to_ascii_lowercase();
            if lower.is_ascii_lowercase() || lower.is_ascii_digit() {
                Some(lower)
            } else if ch == '-' {
                Some('-')
            } else {
                None
            }
        };
        match mapped {
            Some('-') => {
                if !last_was_dash {
                    out.push('-');
                }
                last_was_dash = true;
            }
            Some(c) => {
                out.push(c);
                last_was_dash = false;
            }
            None => {}
        }
    }

    let trimmed = out.trim_matches('-');
    let truncated: String = trimmed.chars().take(MAX_SLUG_LEN).collect();
    truncated.trim_matches('-').to_string()
}

/// Prompt the given model with the first user message, then sanitize the
/// reply. Falls back to `sanitize(first_message)` on any LLM failure or
/// timeout.
pub async fn generate_slug(llm: &dyn LlmService, first_message: &str) -> String {
    let truncated = if first_message.len() > 500 {
        format!("{}...", &first_message[..500])
    } else {
        first_message.to_string()
    };

    let request = LlmRequest {
        system: vec![SystemContent::new(
            "Generate a very short (3-6 words) title summarizing this request. \
             Output only the title, no quotes or punctuation.",
        )],
        messages: vec![LlmMessage {
            role: MessageRole::User,
            content: vec![ContentBlock::text(truncated)],
        }],
        tools: vec![],
        max_tokens: Some(32),
    };

    let result = timeout(GENERATE_TIMEOUT, llm.complete(&request)).await;
    let text = match result {
        Ok(Ok(response)) => response
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<String>(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e.message, "slug generation LLM error");
            String::new()
        }
        Err(_) => {
            tracing::warn!("slug generation timed out");
            String::new()
        }
    };

    let candidate = sanitize(&text);
    if candidate.is_empty() {
        sanitize(first_message)
    } else {
        candidate
    }
}
