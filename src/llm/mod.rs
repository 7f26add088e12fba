// =============================================================================
// StructuredLlm<T> — the only LLM abstraction the core depends on (§6, §9)
// =============================================================================
//
// No corpus repo demonstrated a concrete LLM SDK integration, so this module
// follows the specification's own design-notes abstraction directly: a
// generic `invoke(messages, timeout) -> T` bound to structured output, and a
// `with_fallback` combinator that substitutes a caller-supplied value on any
// failure (timeout, schema validation, provider error) instead of ever
// propagating a parse error up into a pipeline stage.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A chat model bound to structured output type `T`. Implementations must
/// never return a parse error to the caller of `invoke` — any
/// provider/schema failure should be surfaced as `anyhow::Error` so
/// `invoke_or_fallback` can catch it uniformly.
#[async_trait]
pub trait StructuredLlm<T>: Send + Sync
where
    T: DeserializeOwned + Send,
{
    async fn invoke(&self, messages: &[ChatMessage], timeout: Duration) -> anyhow::Result<T>;
}

/// Calls `invoke`, substituting `fallback()` on timeout or any other error.
/// This is the fallback-chain behavior every DecisionStage phase relies on
/// (§4.9, §7 `LLMFailed` policy): log at WARN, never panic, never bubble a
/// parse error past this boundary.
pub async fn invoke_or_fallback<T, F>(
    llm: &dyn StructuredLlm<T>,
    messages: &[ChatMessage],
    timeout: Duration,
    fallback: F,
) -> T
where
    T: DeserializeOwned + Send,
    F: FnOnce() -> T,
{
    match tokio::time::timeout(timeout, llm.invoke(messages, timeout)).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!(error = %e, "LLM call failed, using fallback");
            fallback()
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "LLM call timed out, using fallback");
            fallback()
        }
    }
}

/// Providers pluggable via this factory (§6): OpenAI-compatible, Anthropic,
/// Ollama. Construction detail (base URL, auth header shape) is
/// provider-specific and lives behind this enum so callers select a provider
/// by config, not by importing a concrete client type.
#[derive(Debug, Clone)]
pub enum LlmProvider {
    OpenAiCompatible { base_url: String, api_key: String, model: String },
    Anthropic { api_key: String, model: String },
    Ollama { base_url: String, model: String },
}

/// A `StructuredLlm` backed by an HTTP chat-completions endpoint with JSON
/// schema-bound structured output. One concrete implementation shared by all
/// three provider variants since they all speak a JSON request/response
/// dialect; differences are isolated to `build_request`.
pub struct HttpStructuredLlm<T> {
    provider: LlmProvider,
    client: reqwest::Client,
    _marker: std::marker::PhantomData<T>,
}

impl<T> HttpStructuredLlm<T> {
    pub fn new(provider: LlmProvider) -> Self {
        Self {
            provider,
            client: reqwest::Client::new(),
            _marker: std::marker::PhantomData,
        }
    }

    fn endpoint(&self) -> String {
        match &self.provider {
            LlmProvider::OpenAiCompatible { base_url, .. } => format!("{base_url}/chat/completions"),
            LlmProvider::Anthropic { .. } => "https://api.anthropic.com/v1/messages".to_string(),
            LlmProvider::Ollama { base_url, .. } => format!("{base_url}/api/chat"),
        }
    }
}

#[async_trait]
impl<T> StructuredLlm<T> for HttpStructuredLlm<T>
where
    T: DeserializeOwned + Send + Sync,
{
    async fn invoke(&self, messages: &[ChatMessage], timeout: Duration) -> anyhow::Result<T> {
        let body = serde_json::json!({
            "model": match &self.provider {
                LlmProvider::OpenAiCompatible { model, .. } => model,
                LlmProvider::Anthropic { model, .. } => model,
                LlmProvider::Ollama { model, .. } => model,
            },
            "messages": messages.iter().map(|m| serde_json::json!({"role": m.role, "content": m.content})).collect::<Vec<_>>(),
            "response_format": {"type": "json_object"},
        });

        let mut request = self.client.post(self.endpoint()).timeout(timeout).json(&body);
        request = match &self.provider {
            LlmProvider::OpenAiCompatible { api_key, .. } => request.bearer_auth(api_key),
            LlmProvider::Anthropic { api_key, .. } => request.header("x-api-key", api_key),
            LlmProvider::Ollama { .. } => request,
        };

        let response = request.send().await?.error_for_status()?;
        let raw: serde_json::Value = response.json().await?;
        let content = extract_content(&raw).ok_or_else(|| anyhow::anyhow!("no content in LLM response"))?;
        let parsed: T = serde_json::from_str(&content)?;
        Ok(parsed)
    }
}

fn extract_content(raw: &serde_json::Value) -> Option<String> {
    raw.pointer("/choices/0/message/content")
        .or_else(|| raw.pointer("/content/0/text"))
        .or_else(|| raw.pointer("/message/content"))
        .and_then(|v| v.as_str())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Echo {
        value: i32,
    }

    struct AlwaysFails;

    #[async_trait]
    impl StructuredLlm<Echo> for AlwaysFails {
        async fn invoke(&self, _messages: &[ChatMessage], _timeout: Duration) -> anyhow::Result<Echo> {
            anyhow::bail!("provider unavailable")
        }
    }

    #[tokio::test]
    async fn fallback_is_used_on_error() {
        let llm = AlwaysFails;
        let result = invoke_or_fallback(
            &llm,
            &[ChatMessage::user("hi")],
            Duration::from_secs(1),
            || Echo { value: -1 },
        )
        .await;
        assert_eq!(result, Echo { value: -1 });
    }

    struct AlwaysHangs;

    #[async_trait]
    impl StructuredLlm<Echo> for AlwaysHangs {
        async fn invoke(&self, _messages: &[ChatMessage], _timeout: Duration) -> anyhow::Result<Echo> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Echo { value: 0 })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_is_used_on_timeout() {
        let llm = AlwaysHangs;
        let result = invoke_or_fallback(
            &llm,
            &[ChatMessage::user("hi")],
            Duration::from_millis(10),
            || Echo { value: -2 },
        )
        .await;
        assert_eq!(result, Echo { value: -2 });
    }

    #[test]
    fn extract_content_handles_openai_shape() {
        let raw = serde_json::json!({"choices": [{"message": {"content": "{\"value\":1}"}}]});
        assert_eq!(extract_content(&raw), Some("{\"value\":1}".to_string()));
    }

    #[test]
    fn extract_content_handles_anthropic_shape() {
        let raw = serde_json::json!({"content": [{"text": "{\"value\":2}"}]});
        assert_eq!(extract_content(&raw), Some("{\"value\":2}".to_string()));
    }
}
