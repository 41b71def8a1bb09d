//! Model backends and the ordered fallback chain.
//!
//! Each backend implements [`Provider`]. A [`ProviderRegistry`] maps names to
//! constructors so backends are selected explicitly by name, and
//! [`ProviderRegistry::send_with_fallback`] walks an ordered list of names
//! until one of them answers. Earlier names always win ties.
//!
//! Availability is checked before each call, but a provider reported
//! available may still fail immediately afterwards; that failure is recorded
//! and the chain moves on.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod sse;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{ProviderError, ProviderFailure};

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

/// Default priority when configuration does not name one.
pub const DEFAULT_ORDER: [&str; 3] = ["anthropic", "openai", "gemini"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResult {
    pub content: String,
    pub token_usage: TokenUsage,
    pub provider_name: String,
}

/// Settings for constructing one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    /// Empty means the backend's default model.
    pub model: String,
    pub max_tokens: u32,
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub streaming: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: String::new(),
            max_tokens: 4096,
            base_url: None,
            timeout: Duration::from_secs(120),
            streaming: true,
        }
    }
}

impl ProviderConfig {
    pub(crate) fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        if self.model.is_empty() {
            default
        } else {
            &self.model
        }
    }

    pub(crate) fn base_url_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .unwrap_or(default)
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn has_valid_api_key(&self) -> bool;

    fn is_available(&self) -> bool {
        self.has_valid_api_key()
    }

    async fn send_message(
        &self,
        system_prompt: &str,
        user_message: &str,
    ) -> Result<ProviderResult, ProviderError>;
}

pub type ProviderConstructor = Arc<dyn Fn(ProviderConfig) -> Box<dyn Provider> + Send + Sync>;

/// Name-keyed constructors for every backend the process knows about.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    constructors: HashMap<String, ProviderConstructor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the three built-in HTTP backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("anthropic", |config| Box::new(AnthropicProvider::new(config)));
        registry.register("openai", |config| Box::new(OpenAiProvider::new(config)));
        registry.register("gemini", |config| Box::new(GeminiProvider::new(config)));
        registry
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(ProviderConfig) -> Box<dyn Provider> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn create(&self, name: &str, config: ProviderConfig) -> Result<Box<dyn Provider>, ProviderError> {
        let constructor =
            self.constructors
                .get(name)
                .ok_or_else(|| ProviderError::UnsupportedProvider {
                    name: name.to_string(),
                })?;
        Ok(constructor(config))
    }

    /// Try each named provider in order and return the first success.
    ///
    /// Unavailable providers are skipped without a call. Unknown names,
    /// call failures and timeouts are recorded and the next candidate is
    /// tried. Only when every candidate is exhausted does this fail, with
    /// `AllProvidersFailed` carrying each reason.
    pub async fn send_with_fallback(
        &self,
        system_prompt: &str,
        user_message: &str,
        order: &[String],
        configs: &HashMap<String, ProviderConfig>,
    ) -> Result<ProviderResult, ProviderError> {
        let mut failures = Vec::new();

        for name in order {
            let config = configs.get(name).cloned().unwrap_or_default();
            let timeout = config.timeout;
            let provider = match self.create(name, config) {
                Ok(p) => p,
                Err(e) => {
                    warn!(provider = %name, error = %e, "skipping provider");
                    failures.push(ProviderFailure {
                        provider: name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if !provider.is_available() {
                debug!(provider = %name, "provider unavailable, skipping");
                failures.push(ProviderFailure {
                    provider: name.clone(),
                    reason: "unavailable".to_string(),
                });
                continue;
            }

            let call = provider.send_message(system_prompt, user_message);
            let outcome = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::call_failed(
                    name,
                    format!("timed out after {}s", timeout.as_secs_f64()),
                )),
            };

            match outcome {
                Ok(mut result) => {
                    result.provider_name = name.clone();
                    info!(
                        provider = %name,
                        input_tokens = result.token_usage.input,
                        output_tokens = result.token_usage.output,
                        "provider call succeeded"
                    );
                    return Ok(result);
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "provider call failed, falling back");
                    failures.push(ProviderFailure {
                        provider: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(ProviderError::AllProvidersFailed { failures })
    }
}

/// A registry bundled with the order and settings it should be driven with.
#[derive(Clone)]
pub struct FallbackChain {
    registry: Arc<ProviderRegistry>,
    order: Vec<String>,
    configs: HashMap<String, ProviderConfig>,
}

impl FallbackChain {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        order: Vec<String>,
        configs: HashMap<String, ProviderConfig>,
    ) -> Self {
        Self {
            registry,
            order,
            configs,
        }
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub async fn send(&self, system_prompt: &str, user_message: &str) -> Result<ProviderResult, ProviderError> {
        self.registry
            .send_with_fallback(system_prompt, user_message, &self.order, &self.configs)
            .await
    }

    /// Names in the chain whose provider currently reports itself available.
    pub fn available(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| {
                let config = self.configs.get(*name).cloned().unwrap_or_default();
                self.registry
                    .create(name, config)
                    .map(|p| p.is_available())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

/// Send a JSON request and turn transport or HTTP errors into `CallFailed`.
pub(crate) async fn send_json(
    provider: &str,
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
) -> Result<reqwest::Response, ProviderError> {
    let response = request
        .header("content-type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| ProviderError::call_failed(provider, e))?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let snippet: String = text.chars().take(500).collect();
        return Err(ProviderError::call_failed(
            provider,
            format!("HTTP {}: {}", status.as_u16(), snippet),
        ));
    }
    Ok(response)
}

/// Parse an SSE data payload as JSON, naming the provider on failure.
pub(crate) fn parse_event_json(provider: &str, data: &str) -> Result<serde_json::Value, ProviderError> {
    serde_json::from_str(data)
        .map_err(|e| ProviderError::call_failed(provider, format!("malformed stream event: {}", e)))
}
