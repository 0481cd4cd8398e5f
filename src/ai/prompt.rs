use crate::ai::contract::rca_schema;
use serde_json::Value;

const GUARDRAILS: &str = "You are a Home Assistant diagnostics agent. \
Analyze the incident and respond only with JSON matching the schema below. \
Do not include explanations or commentary. \
The recurrence_pattern must be a regular expression that matches this problem \
in the serialized event JSON without matching unrelated events.";

/// Keep the first `max_lines` lines of `text`, marking how many were dropped
fn truncate_lines(text: &str, max_lines: usize) -> String {
    let total = text.lines().count();
    if total <= max_lines {
        return text.to_string();
    }
    let mut kept: Vec<&str> = text.lines().take(max_lines).collect();
    let marker = format!("... ({} more lines truncated)", total - max_lines);
    kept.push(&marker);
    kept.join("\n")
}

/// Build the prompt asking a backend for an `RcaResult`
///
/// The context is pretty-printed with sorted keys. With `max_lines` set, only
/// that many context lines are embedded.
pub fn build_rca_prompt(context: &Value, max_lines: Option<usize>) -> String {
    let schema = format!("{:#}", rca_schema());
    let mut context_text = format!("{:#}", context);
    if let Some(limit) = max_lines {
        context_text = truncate_lines(&context_text, limit);
    }

    format!(
        "{}\n\nSchema:\n{}\n\nContext:\n{}\n",
        GUARDRAILS, schema, context_text
    )
}
