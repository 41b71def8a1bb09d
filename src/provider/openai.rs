//! OpenAI Chat Completions backend.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::sse::for_each_event;
use super::{Provider, ProviderConfig, ProviderResult, TokenUsage, parse_event_json, send_json};
use crate::errors::ProviderError;

pub const NAME: &str = "openai";
pub const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    config: ProviderConfig,
    http: Client,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            http: Client::new(),
        }
    }

    fn build_body(&self, system_prompt: &str, user_message: &str, stream: bool) -> Value {
        let mut body = json!({
            "model": self.config.model_or(DEFAULT_MODEL),
            "max_tokens": self.config.max_tokens,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_message },
            ],
        });
        if stream {
            body["stream"] = json!(true);
            // Without this the stream carries no token counts at all.
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }
}

fn usage_from(value: &Value) -> TokenUsage {
    TokenUsage {
        input: value["prompt_tokens"].as_u64().unwrap_or(0),
        output: value["completion_tokens"].as_u64().unwrap_or(0),
    }
}

pub(crate) fn parse_response(body: &Value) -> Result<(String, TokenUsage), String> {
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| "response has no message content".to_string())?
        .to_string();
    Ok((content, usage_from(&body["usage"])))
}

#[derive(Debug, Default)]
pub(crate) struct StreamState {
    pub content: String,
    pub usage: TokenUsage,
    pub done: bool,
}

impl StreamState {
    pub fn apply(&mut self, data: &str) -> Result<(), ProviderError> {
        if data.trim() == "[DONE]" {
            self.done = true;
            return Ok(());
        }
        let chunk = parse_event_json(NAME, data)?;
        if let Some(text) = chunk["choices"][0]["delta"]["content"].as_str() {
            self.content.push_str(text);
        }
        if chunk["usage"].is_object() {
            self.usage = usage_from(&chunk["usage"]);
        }
        Ok(())
    }

    /// The assembled reply, provided the `[DONE]` sentinel arrived.
    pub fn finish(self) -> Result<(String, TokenUsage), ProviderError> {
        if !self.done {
            return Err(ProviderError::call_failed(NAME, "stream ended before completion"));
        }
        Ok((self.content, self.usage))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn has_valid_api_key(&self) -> bool {
        self.config
            .api_key
            .as_deref()
            .is_some_and(|k| k.starts_with("sk-") && !k.starts_with("sk-ant-"))
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
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url_or(DEFAULT_BASE_URL)
        );
        let streaming = self.config.streaming;
        let body = self.build_body(system_prompt, user_message, streaming);
        debug!(model = self.config.model_or(DEFAULT_MODEL), streaming, "sending message");

        let request = self.http.post(&url).bearer_auth(api_key);
        let response = send_json(NAME, request, &body).await?;

        let (content, token_usage) = if streaming {
            let mut state = StreamState::default();
            for_each_event(NAME, response, |event| {
                state.apply(&event.data)?;
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
