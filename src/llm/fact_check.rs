use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::{LlmBackend, LlmError, LlmRequest};

const SYSTEM_PROMPT: &str = "You are a fact-checking assistant. Verify the claim you are given \
using current, reliable sources.\n\n\
Rate your confidence that the claim is accurate on a scale from 0 to 1:\n\
- 0.9-1.0: highly confident, confirmed by multiple reliable sources\n\
- 0.7-0.9: confident, supported by reliable sources\n\
- 0.5-0.7: moderately confident, partially supported\n\
- 0.3-0.5: low confidence, weak or conflicting evidence\n\
- 0.0-0.3: very low confidence, likely inaccurate\n\n\
Answer with JSON containing `confidence`, `sources` (URLs or references) and `reasoning`.";

/// Confidence used when the model's answer cannot be interpreted
pub const NEUTRAL_CONFIDENCE: f64 = 0.5;

/// Verdict of a fact check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactCheckResult {
    pub confidence: f64,
    pub sources: Vec<String>,
    pub reasoning: String,
}

impl FactCheckResult {
    /// A neutral verdict carrying `reasoning`
    pub fn neutral(reasoning: impl Into<String>) -> Self {
        Self {
            confidence: NEUTRAL_CONFIDENCE,
            sources: Vec::new(),
            reasoning: reasoning.into(),
        }
    }
}

fn response_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "sources": { "type": "array", "items": { "type": "string" } },
            "reasoning": { "type": "string" },
        },
        "required": ["confidence", "sources", "reasoning"],
    })
}

/// Interprets the model's answer
///
/// Answers that are not a JSON object yield a neutral verdict whose
/// reasoning is the raw text.
fn parse_verdict(content: &str) -> FactCheckResult {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(content.trim()) else {
        warn!("fact check answer is not JSON");
        return FactCheckResult::neutral(content);
    };

    let confidence = map
        .get("confidence")
        .and_then(|c| c.as_f64())
        .unwrap_or(NEUTRAL_CONFIDENCE)
        .clamp(0.0, 1.0);
    let sources = map
        .get("sources")
        .and_then(|s| s.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let reasoning = map
        .get("reasoning")
        .and_then(|r| r.as_str())
        .unwrap_or("No reasoning provided")
        .to_string();

    FactCheckResult {
        confidence,
        sources,
        reasoning,
    }
}

/// Asks `model` how confident it is that `claim` is accurate
///
/// Transport failures are returned as errors; callers that must not fail
/// fall back to `FactCheckResult::neutral`.
#[instrument(skip(backend, claim, context))]
pub async fn fact_check(
    backend: &dyn LlmBackend,
    model: &str,
    claim: &str,
    context: Option<&str>,
) -> Result<FactCheckResult, LlmError> {
    let mut user_prompt = format!("Please fact-check the following claim:\n\nClaim: {claim}");
    if let Some(context) = context.filter(|c| !c.is_empty()) {
        user_prompt.push_str(&format!("\n\nContext: {context}"));
    }

    let request = LlmRequest::new(model, SYSTEM_PROMPT, user_prompt)
        .temperature(0.1)
        .max_tokens(1000)
        .json_schema(response_schema());

    let response = backend.generate(request).await?;
    let verdict = parse_verdict(&response.content);
    debug!(confidence = verdict.confidence, "fact check finished");

    Ok(verdict)
}
