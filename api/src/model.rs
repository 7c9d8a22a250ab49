use std::time::Duration;

use gatehouse_core::conversation::ConversationTurn;
use gatehouse_core::model::{ModelAction, ModelAnalysis, ModelOutcome, TokenUsage};
use gatehouse_core::sender::Sender;
use serde_json::json;
use thiserror::Error;

const MODEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("model gateway is not configured")]
    Unavailable,
}

/// The inference gateway. `Http` is the production arm; `Static` serves a
/// canned outcome for development and tests.
#[derive(Clone)]
pub enum ModelBackend {
    Http(HttpModel),
    Static(ModelOutcome),
    /// Always fails; exercises the fallback-reply path.
    Unavailable,
}

#[derive(Clone)]
pub struct HttpModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl ModelBackend {
    pub fn from_env() -> Self {
        match std::env::var("GATEHOUSE_MODEL_URL") {
            Ok(endpoint) => ModelBackend::Http(HttpModel {
                client: reqwest::Client::builder()
                    .timeout(MODEL_REQUEST_TIMEOUT)
                    .build()
                    .unwrap_or_default(),
                endpoint,
                api_key: std::env::var("GATEHOUSE_MODEL_API_KEY").ok(),
            }),
            Err(_) => {
                tracing::warn!(
                    "GATEHOUSE_MODEL_URL not set; serving a static model outcome (dev mode)"
                );
                ModelBackend::Static(static_outcome())
            }
        }
    }

    /// One model invocation with the sender's recent conversation as context.
    pub async fn invoke(
        &self,
        sender: &Sender,
        message: &str,
        turns: &[ConversationTurn],
    ) -> Result<ModelOutcome, ModelError> {
        match self {
            ModelBackend::Http(http) => {
                let mut request = http
                    .client
                    .post(&http.endpoint)
                    .json(&json!({
                        "sender": sender.key(),
                        "message": message,
                        "history": turns,
                    }));
                if let Some(key) = &http.api_key {
                    request = request.bearer_auth(key);
                }
                let outcome = request
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<ModelOutcome>()
                    .await?;
                Ok(outcome)
            }
            ModelBackend::Static(outcome) => Ok(outcome.clone()),
            ModelBackend::Unavailable => Err(ModelError::Unavailable),
        }
    }
}

fn static_outcome() -> ModelOutcome {
    ModelOutcome {
        reply: "Thanks for your message! An assistant will follow up shortly.".to_string(),
        analysis: ModelAnalysis {
            action: ModelAction::Reply,
            toxicity_level: 0,
            customer_score: 50,
            intent: "general".to_string(),
            missing_info: None,
        },
        tokens: TokenUsage::default(),
        source: Some("static".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn static_backend_echoes_its_outcome() {
        let backend = ModelBackend::Static(static_outcome());
        let sender = Sender::Customer(Uuid::now_v7());
        let outcome = backend.invoke(&sender, "hello", &[]).await.unwrap();
        assert_eq!(outcome.analysis.action, ModelAction::Reply);
    }

    #[tokio::test]
    async fn unavailable_backend_errors() {
        let backend = ModelBackend::Unavailable;
        let sender = Sender::anonymous("sess-1").unwrap();
        let result = backend.invoke(&sender, "hello", &[]).await;
        assert!(matches!(result, Err(ModelError::Unavailable)));
    }

    #[test]
    fn outcome_deserializes_from_gateway_payload() {
        let payload = json!({
            "reply": "Happy to help with that.",
            "analysis": {
                "action": "HANDOFF",
                "toxicity_level": 0,
                "customer_score": 85,
                "intent": "purchase_intent"
            },
            "tokens": { "prompt_tokens": 310, "completion_tokens": 42 },
            "source": "model"
        });
        let outcome: ModelOutcome = serde_json::from_value(payload).unwrap();
        assert_eq!(outcome.analysis.action, ModelAction::Handoff);
        assert_eq!(outcome.analysis.customer_score, 85);
        assert_eq!(outcome.tokens.total(), 352);
    }
}
