//! Structured root-cause diagnosis returned by RCA backends
//!
//! Backends return free text; [`parse_rca_result`] is the only way to turn that
//! text into an [`RcaResult`], so everything downstream can trust the schema.

use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A remediation step suggested by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAction {
    pub action: String,
    pub rationale: String,
}

/// Root-cause analysis of a new problem
///
/// Fields are declared in lexical order so serialized records keep sorted keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcaResult {
    #[serde(default)]
    pub candidate_actions: Vec<CandidateAction>,
    pub confidence: f64,
    pub impact: String,
    /// Regular expression recognising future occurrences of the same problem
    pub recurrence_pattern: String,
    pub risk: String,
    pub root_cause: String,
    pub summary: String,
    #[serde(default)]
    pub tests: Vec<String>,
}

impl RcaResult {
    fn validate(&self) -> Result<(), AnalysisError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(AnalysisError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// JSON Schema describing [`RcaResult`], embedded in every prompt
pub fn rca_schema() -> Value {
    json!({
        "title": "RcaResult",
        "type": "object",
        "required": [
            "summary",
            "root_cause",
            "impact",
            "confidence",
            "risk",
            "recurrence_pattern"
        ],
        "properties": {
            "summary": {
                "type": "string",
                "description": "One-line summary of the incident"
            },
            "root_cause": {
                "type": "string",
                "description": "Primary reason for the incident"
            },
            "impact": {
                "type": "string",
                "description": "Observed impact on the system"
            },
            "confidence": {
                "type": "number",
                "minimum": 0.0,
                "maximum": 1.0,
                "description": "Confidence score between 0 and 1"
            },
            "candidate_actions": {
                "type": "array",
                "description": "Proposed remediation steps",
                "items": {
                    "type": "object",
                    "required": ["action", "rationale"],
                    "properties": {
                        "action": {"type": "string", "description": "Short description of the action"},
                        "rationale": {"type": "string", "description": "Why the action may help"}
                    }
                }
            },
            "risk": {
                "type": "string",
                "description": "Overall risk assessment of acting"
            },
            "tests": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Checks to verify the issue is resolved"
            },
            "recurrence_pattern": {
                "type": "string",
                "description": "Regular expression matching future occurrences of this problem in the serialized event JSON"
            }
        }
    })
}

/// Return the body of the first fenced block opened by `fence`, trimmed
fn fenced_block<'a>(text: &'a str, fence: &str) -> Option<&'a str> {
    let start = text.find(fence)? + fence.len();
    let end = text[start..].find("```")?;
    Some(text[start..start + end].trim())
}

/// Extract the JSON object from a model response
///
/// Models sometimes wrap the object in markdown fences or surround it with
/// prose. Falls back to the trimmed input when no object is recognisable.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(body) = fenced_block(text, "```json") {
        return body;
    }
    if let Some(body) = fenced_block(text, "```") {
        if body.starts_with('{') && body.ends_with('}') {
            return body;
        }
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

/// Parse and validate a backend response
///
/// # Errors
///
/// Returns `AnalysisError::InvalidResponse` when the text is not JSON, does not
/// match the schema, or carries an out-of-range confidence.
pub fn parse_rca_result(text: &str) -> Result<RcaResult, AnalysisError> {
    let body = extract_json(text);
    let result: RcaResult = serde_json::from_str(body).map_err(|e| {
        AnalysisError::InvalidResponse(format!("response does not match schema: {}", e))
    })?;
    result.validate()?;
    Ok(result)
}
