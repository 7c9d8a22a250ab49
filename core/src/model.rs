use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Metadata `source` value the inference gateway sets when its own guardrail
/// intercepted the prompt. Treated as an implicit BLOCK regardless of the
/// analysis payload.
pub const SECURITY_GUARDRAIL_SOURCE: &str = "security_guardrail";

/// The model's recommended action for an exchange.
///
/// The upstream gateway emits these as strings. An unrecognized value is a
/// schema violation, not a crash: it deserializes to `Unrecognized`, which the
/// pipeline treats as a reply with all side effects suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelAction {
    Reply,
    Block,
    Handoff,
    #[serde(other)]
    Unrecognized,
}

/// Structured per-message analysis returned alongside the reply.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelAnalysis {
    pub action: ModelAction,
    /// 0 = benign; higher is worse. The pipeline bans at a configured floor.
    pub toxicity_level: i32,
    /// Sales-qualification score in [0, 100], carried into handoff requests.
    pub customer_score: i32,
    /// Free-form intent label (e.g. "product_inquiry", "off_topic")
    pub intent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_info: Option<String>,
}

/// Token accounting reported by the gateway.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema)]
pub struct TokenUsage {
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
}

impl TokenUsage {
    pub fn total(&self) -> i32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Full structured outcome of one model invocation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelOutcome {
    pub reply: String,
    pub analysis: ModelAnalysis,
    #[serde(default)]
    pub tokens: TokenUsage,
    /// Which component produced the reply ("model", "security_guardrail", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ModelOutcome {
    /// Action after applying the guardrail override: a `security_guardrail`
    /// source forces `Block` no matter what the analysis says.
    pub fn effective_action(&self) -> ModelAction {
        if self.source.as_deref() == Some(SECURITY_GUARDRAIL_SOURCE) {
            return ModelAction::Block;
        }
        self.analysis.action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(action: ModelAction, source: Option<&str>) -> ModelOutcome {
        ModelOutcome {
            reply: "hello".to_string(),
            analysis: ModelAnalysis {
                action,
                toxicity_level: 0,
                customer_score: 50,
                intent: "product_inquiry".to_string(),
                missing_info: None,
            },
            tokens: TokenUsage::default(),
            source: source.map(str::to_string),
        }
    }

    #[test]
    fn action_parses_known_values() {
        let parsed: ModelAction = serde_json::from_str("\"HANDOFF\"").unwrap();
        assert_eq!(parsed, ModelAction::Handoff);
    }

    #[test]
    fn unknown_action_falls_back_to_unrecognized() {
        let parsed: ModelAction = serde_json::from_str("\"ESCALATE_HARD\"").unwrap();
        assert_eq!(parsed, ModelAction::Unrecognized);
    }

    #[test]
    fn guardrail_source_overrides_action() {
        let outcome = outcome(ModelAction::Reply, Some(SECURITY_GUARDRAIL_SOURCE));
        assert_eq!(outcome.effective_action(), ModelAction::Block);
    }

    #[test]
    fn plain_source_keeps_analysis_action() {
        let outcome = outcome(ModelAction::Handoff, Some("model"));
        assert_eq!(outcome.effective_action(), ModelAction::Handoff);
    }

    #[test]
    fn token_total_sums_both_sides() {
        let usage = TokenUsage {
            prompt_tokens: 120,
            completion_tokens: 45,
        };
        assert_eq!(usage.total(), 165);
    }
}
