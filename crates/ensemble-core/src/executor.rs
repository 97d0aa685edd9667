use crate::EnsembleResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Runtime context handed to an agent's [`AgentExecutor::process`] call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Id of the task being executed.
    pub task_id: String,
    /// Id of the agent executing it.
    pub agent_id: String,
    /// Configuration forwarded from the task's metadata.
    pub config: HashMap<String, Value>,
    /// Completed outputs of the task's dependencies, keyed by task id.
    pub outputs: HashMap<String, Value>,
}

/// Contract implemented by concrete agents.
///
/// The core treats any returned error as task failure and never retries the
/// call itself; retry happens at the task level via re-queueing.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Execute the given input and return an opaque result payload.
    async fn process(&self, input: Value, ctx: &ExecutionContext) -> EnsembleResult<Value>;
}

/// Options for a single [`LlmClient::generate`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Model identifier, interpreted by the backend.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4".to_string(),
            temperature: 0.7,
            max_tokens: 2000,
        }
    }
}

/// Contract implemented by language-model backends.
///
/// Failures propagate as task failures; the core does not retry generation.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Produce a completion for the given prompt.
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> EnsembleResult<String>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::EnsembleError;
    use serde_json::json;

    struct Uppercase;

    #[async_trait]
    impl AgentExecutor for Uppercase {
        async fn process(&self, input: Value, _ctx: &ExecutionContext) -> EnsembleResult<Value> {
            let text = input
                .as_str()
                .ok_or_else(|| EnsembleError::Validation("expected string input".to_string()))?;
            Ok(json!(text.to_uppercase()))
        }
    }

    struct CannedLlm;

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn generate(&self, prompt: &str, options: &GenerateOptions) -> EnsembleResult<String> {
            Ok(format!("[{}] {}", options.model, prompt))
        }
    }

    #[tokio::test]
    async fn test_executor_contract() {
        let executor = Uppercase;
        let ctx = ExecutionContext::default();
        let out = executor.process(json!("hello"), &ctx).await.unwrap();
        assert_eq!(out, json!("HELLO"));

        let err = executor.process(json!(42), &ctx).await.unwrap_err();
        assert!(matches!(err, EnsembleError::Validation(_)));
    }

    #[tokio::test]
    async fn test_llm_client_contract() {
        let client = CannedLlm;
        let out = client
            .generate("summarize", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "[gpt-4] summarize");
    }

    #[test]
    fn test_generate_options_defaults() {
        let opts = GenerateOptions::default();
        assert_eq!(opts.max_tokens, 2000);
        assert!((opts.temperature - 0.7).abs() < f32::EPSILON);
    }
}
