//! Google Gemini `generateContent` backend.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::sse::for_each_event;
use super::{Provider, ProviderConfig, ProviderResult, TokenUsage, parse_event_json, send_json};
use crate::errors::ProviderError;

pub const NAME: &str = "gemini";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    config: ProviderConfig,
    http: Client,
}

impl GeminiProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            http: Client::new(),
        }
    }

    fn build_body(&self, system_prompt: &str, user_message: &str) -> Value {
        json!({
            "systemInstruction": { "parts": [{ "text": system_prompt }] },
            "contents": [{ "role": "user", "parts": [{ "text": user_message }] }],
            "generationConfig": { "maxOutputTokens": self.config.max_tokens },
        })
    }

    fn url(&self, streaming: bool) -> String {
        let base = self.config.base_url_or(DEFAULT_BASE_URL);
        let model = self.config.model_or(DEFAULT_MODEL);
        if streaming {
            format!("{}/v1beta/models/{}:streamGenerateContent?alt=sse", base, model)
        } else {
            format!("{}/v1beta/models/{}:generateContent", base, model)
        }
    }
}

fn candidate_text(body: &Value) -> String {
    body["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
        .unwrap_or_default()
}

fn usage_from(body: &Value) -> Option<TokenUsage> {
    let meta = body.get("usageMetadata")?;
    Some(TokenUsage {
        input: meta["promptTokenCount"].as_u64().unwrap_or(0),
        output: meta["candidatesTokenCount"].as_u64().unwrap_or(0),
    })
}

pub(crate) fn parse_response(body: &Value) -> Result<(String, TokenUsage), String> {
    if body["candidates"].as_array().is_none_or(|c| c.is_empty()) {
        let reason = body["promptFeedback"]["blockReason"]
            .as_str()
            .unwrap_or("no candidates returned");
        return Err(reason.to_string());
    }
    Ok((candidate_text(body), usage_from(body).unwrap_or_default()))
}

#[derive(Debug, Default)]
pub(crate) struct StreamState {
    pub content: String,
    pub usage: TokenUsage,
    pub done: bool,
}

impl StreamState {
    /// Each chunk carries a text fragment and running usage totals. The last
    /// one also names a `finishReason`.
    pub fn apply(&mut self, chunk: &Value) {
        self.content.push_str(&candidate_text(chunk));
        if let Some(usage) = usage_from(chunk) {
            self.usage = usage;
        }
        if chunk["candidates"][0]["finishReason"].is_string() {
            self.done = true;
        }
    }

    pub fn finish(self) -> Result<(String, TokenUsage), ProviderError> {
        if !self.done {
            return Err(ProviderError::call_failed(NAME, "stream ended before completion"));
        }
        Ok((self.content, self.usage))
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn has_valid_api_key(&self) -> bool {
        self.config
            .api_key
            .as_deref()
            .is_some_and(|k| k.starts_with("AIza"))
    }

    async fn send_message(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<ProviderResult, ProviderError> {
        let api_key = match self.config.api_key.as_deref() {
            Some(key) if self.has_valid_api_key() => key,
            _ => {
                return Err(ProviderError::Unavailable {
                    provider: NAME.to_string(),
                });
            }
        };
        let streaming = self.config.streaming;
        let body = self.build_body(system_prompt, user_message);
        debug!(model = self.config.model_or(DEFAULT_MODEL), streaming, "sending message");

        let request = self
            .http
            .post(self.url(streaming))
            .header("x-goog-api-key", api_key);
        let response = send_json(NAME, request, &body).await?;

        let (content, token_usage) = if streaming {
            let mut state = StreamState::default();
            for_each_event(NAME, response, |event| {
                state.apply(&parse_event_json(NAME, &event.data)?);
                Ok(!state.done)
            })
            .await?;
            state.finish()?
        } else {
            let value: Value = response
                .json()
                .await
                .map_err(|e| ProviderError::call_failed(NAME, e))?;
            parse_response(&value).map_err(|m| ProviderError::call_failed(NAME, m))?
        };

        Ok(ProviderResult {
            content,
            token_usage,
            provider_name: NAME.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_switches_on_streaming() {
        let p = GeminiProvider::new(ProviderConfig::default());
        assert!(p.url(true).ends_with(":streamGenerateContent?alt=sse"));
        assert!(p.url(false).ends_with("gemini-2.0-flash:generateContent"));
    }

    #[test]
    fn streamed_and_blocking_usage_match() {
        let blocking = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Bonjour le monde" }] } }],
            "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 4 }
        });
        let (content, usage) = parse_response(&blocking).unwrap();

        let mut state = StreamState::default();
        state.apply(&json!({
            "candidates": [{ "content": { "parts": [{ "text": "Bonjour" }] } }],
            "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 1 }
        }));
        assert!(!state.done);
        state.apply(&json!({
            "candidates": [{ "content": { "parts": [{ "text": " le monde" }] }, "finishReason": "STOP" }],
            "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 4 }
        }));
        assert_eq!(state.finish().unwrap(), (content, usage));
    }

    #[test]
    fn stream_without_finish_reason_is_incomplete() {
        let mut state = StreamState::default();
        state.apply(&json!({
            "candidates": [{ "content": { "parts": [{ "text": "Bon" }] } }],
            "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 1 }
        }));
        assert!(matches!(state.finish(), Err(ProviderError::CallFailed { .. })));
    }

    #[test]
    fn blocked_prompt_is_an_error() {
        let body = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        assert_eq!(parse_response(&body).unwrap_err(), "SAFETY");
    }
}
