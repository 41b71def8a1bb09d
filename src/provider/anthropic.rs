//! Anthropic Messages API backend.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::sse::for_each_event;
use super::{Provider, ProviderConfig, ProviderResult, TokenUsage, parse_event_json, send_json};
use crate::errors::ProviderError;

pub const NAME: &str = "anthropic";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    config: ProviderConfig,
    http: Client,
}

impl AnthropicProvider {
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
            "system": system_prompt,
            "messages": [{ "role": "user", "content": user_message }],
        });
        if stream {
            body["stream"] = json!(true);
        }
        body
    }
}

/// Extract text and usage from a non-streaming response body.
pub(crate) fn parse_response(body: &Value) -> Result<(String, TokenUsage), String> {
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| "response has no content array".to_string())?;
    let content = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect::<String>();
    let usage = TokenUsage {
        input: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
        output: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
    };
    Ok((content, usage))
}

/// Accumulates a streamed message into the same shape as a blocking one.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    pub content: String,
    pub usage: TokenUsage,
    pub done: bool,
}

impl StreamState {
    pub fn apply(&mut self, data: &Value) -> Result<(), String> {
        match data["type"].as_str() {
            Some("message_start") => {
                let usage = &data["message"]["usage"];
                self.usage.input = usage["input_tokens"].as_u64().unwrap_or(0);
                self.usage.output = usage["output_tokens"].as_u64().unwrap_or(0);
            }
            Some("content_block_delta") => {
                if data["delta"]["type"] == "text_delta" {
                    if let Some(text) = data["delta"]["text"].as_str() {
                        self.content.push_str(text);
                    }
                }
            }
            Some("message_delta") => {
                // Cumulative for the whole message, not an increment.
                if let Some(output) = data["usage"]["output_tokens"].as_u64() {
                    self.usage.output = output;
                }
            }
            Some("message_stop") => self.done = true,
            Some("error") => {
                let message = data["error"]["message"].as_str().unwrap_or("stream error");
                return Err(message.to_string());
            }
            _ => {}
        }
        Ok(())
    }

    /// The assembled message, provided `message_stop` arrived.
    pub fn finish(self) -> Result<(String, TokenUsage), ProviderError> {
        if !self.done {
            return Err(ProviderError::call_failed(NAME, "stream ended before completion"));
        }
        Ok((self.content, self.usage))
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn has_valid_api_key(&self) -> bool {
        self.config
            .api_key
            .as_deref()
            .is_some_and(|k| k.starts_with("sk-ant-"))
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
        let url = format!("{}/v1/messages", self.config.base_url_or(DEFAULT_BASE_URL));
        let streaming = self.config.streaming;
        let body = self.build_body(system_prompt, user_message, streaming);
        debug!(model = self.config.model_or(DEFAULT_MODEL), streaming, "sending message");

        let request = self
            .http
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION);
        let response = send_json(NAME, request, &body).await?;

        let (content, token_usage) = if streaming {
            let mut state = StreamState::default();
            for_each_event(NAME, response, |event| {
                let data = parse_event_json(NAME, &event.data)?;
                state
                    .apply(&data)
                    .map_err(|m| ProviderError::call_failed(NAME, m))?;
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

    fn provider(streaming: bool) -> AnthropicProvider {
        AnthropicProvider::new(ProviderConfig {
            api_key: Some("sk-ant-test".to_string()),
            streaming,
            ..ProviderConfig::default()
        })
    }

    #[test]
    fn build_body_includes_system_and_stream_flag() {
        let body = provider(true).build_body("be terse", "hi", true);
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["stream"], true);
        assert!(provider(false).build_body("s", "u", false).get("stream").is_none());
    }

    #[test]
    fn streamed_and_blocking_usage_match() {
        let blocking = json!({
            "content": [{ "type": "text", "text": "Hello world" }],
            "usage": { "input_tokens": 12, "output_tokens": 34 }
        });
        let (content, usage) = parse_response(&blocking).unwrap();

        let events = [
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 12, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0}),
            json!({"type": "ping"}),
            json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hello"}}),
            json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": " world"}}),
            json!({"type": "message_delta", "usage": {"output_tokens": 34}}),
            json!({"type": "message_stop"}),
        ];
        let mut state = StreamState::default();
        for event in &events {
            state.apply(event).unwrap();
        }
        assert!(state.done);
        assert_eq!(state.content, content);
        assert_eq!(state.usage, usage);
    }

    #[test]
    fn stream_error_event_fails() {
        let mut state = StreamState::default();
        let err = state
            .apply(&json!({"type": "error", "error": {"message": "overloaded"}}))
            .unwrap_err();
        assert_eq!(err, "overloaded");
    }

    /// Serve one canned `text/event-stream` response, then close the socket.
    async fn serve_stream_once(body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn streaming_provider(base_url: String) -> AnthropicProvider {
        AnthropicProvider::new(ProviderConfig {
            api_key: Some("sk-ant-test".to_string()),
            base_url: Some(base_url),
            streaming: true,
            ..ProviderConfig::default()
        })
    }

    #[tokio::test]
    async fn complete_stream_is_assembled() {
        let base = serve_stream_once(concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":3}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ))
        .await;
        let result = streaming_provider(base).send_message("s", "u").await.unwrap();
        assert_eq!(result.content, "Hello");
        assert_eq!(result.token_usage, TokenUsage { input: 12, output: 3 });
        assert_eq!(result.provider_name, NAME);
    }

    #[tokio::test]
    async fn stream_cut_before_message_stop_is_a_call_failure() {
        let base = serve_stream_once(concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
        ))
        .await;
        let err = streaming_provider(base).send_message("s", "u").await.unwrap_err();
        match err {
            ProviderError::CallFailed { provider, message } => {
                assert_eq!(provider, NAME);
                assert!(message.contains("before completion"), "{}", message);
            }
            other => panic!("expected CallFailed, got {:?}", other),
        }
    }

    #[test]
    fn unfinished_state_does_not_finish() {
        let mut state = StreamState::default();
        state
            .apply(&json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hel"}}))
            .unwrap();
        assert!(state.finish().is_err());
    }

    #[tokio::test]
    async fn send_without_key_is_unavailable() {
        let p = AnthropicProvider::new(ProviderConfig::default());
        assert!(!p.is_available());
        let err = p.send_message("s", "u").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }
}
