//! Configuration for the HITL control plane.
//!
//! Settings are read from `.hitl/hitl.toml` and layered:
//! defaults → file → environment (`HITL_*`, provider key variables, `.env`)
//! → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [providers]
//! order = ["anthropic", "openai", "gemini"]
//! timeout_secs = 120
//! streaming = true
//!
//! [providers.anthropic]
//! model = "claude-sonnet-4-20250514"
//! max_tokens = 8192
//!
//! [providers.openai]
//! api_key_env = "MY_OPENAI_KEY"
//!
//! [feedback]
//! max_retries = 3
//! persist_history = true
//!
//! [safety]
//! enabled = true
//! allowed = ["^scripts/"]
//! forbidden = ["\\.pem$"]
//!
//! [hitl]
//! enabled = true
//! auto_approve = ["QUERY_REVIEW"]
//! mode = "poll"
//! poll_interval_secs = 2
//! poll_timeout_secs = 3600
//! max_reruns = 3
//!
//! [logging]
//! level = "info"
//! file = ".hitl/logs/hitl.log"
//!
//! [[pipeline.phases]]
//! name = "Planning"
//! executor = "planner"
//! checkpoint = "DESIGN_APPROVAL"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::feedback::DEFAULT_MAX_RETRIES;
use crate::orchestrator::PhaseSpec;
use crate::provider::{DEFAULT_ORDER, ProviderConfig};
use crate::session::{Checkpoint, DEFAULT_MAX_RERUNS};

/// The name of the control plane's working directory.
pub const HITL_DIR: &str = ".hitl";

/// The configuration file inside [`HITL_DIR`].
pub const CONFIG_FILE: &str = "hitl.toml";

/// Per-backend overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the key, if not the conventional one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidersSection {
    #[serde(default = "default_order")]
    pub order: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default)]
    pub anthropic: ProviderSettings,
    #[serde(default)]
    pub openai: ProviderSettings,
    #[serde(default)]
    pub gemini: ProviderSettings,
}

fn default_order() -> Vec<String> {
    DEFAULT_ORDER.iter().map(|s| s.to_string()).collect()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            order: default_order(),
            timeout_secs: default_timeout_secs(),
            streaming: true,
            anthropic: ProviderSettings::default(),
            openai: ProviderSettings::default(),
            gemini: ProviderSettings::default(),
        }
    }
}

impl ProvidersSection {
    pub fn settings_for(&self, name: &str) -> Option<&ProviderSettings> {
        match name {
            "anthropic" => Some(&self.anthropic),
            "openai" => Some(&self.openai),
            "gemini" => Some(&self.gemini),
            _ => None,
        }
    }

    /// Resolve a [`ProviderConfig`] for every provider in `order`.
    pub fn resolve(&self, env: impl Fn(&str) -> Option<String>) -> HashMap<String, ProviderConfig> {
        self.order
            .iter()
            .map(|name| {
                let settings = self.settings_for(name).cloned().unwrap_or_default();
                let api_key = match settings.api_key_env.as_deref() {
                    Some(var) => env(var),
                    None => default_key_vars(name).iter().find_map(|var| env(var)),
                };
                let defaults = ProviderConfig::default();
                let config = ProviderConfig {
                    api_key: api_key.filter(|k| !k.trim().is_empty()),
                    model: settings.model.unwrap_or_default(),
                    max_tokens: settings.max_tokens.unwrap_or(defaults.max_tokens),
                    base_url: settings.base_url,
                    timeout: Duration::from_secs(self.timeout_secs),
                    streaming: self.streaming,
                };
                (name.clone(), config)
            })
            .collect()
    }
}

fn default_key_vars(name: &str) -> &'static [&'static str] {
    match name {
        "anthropic" => &["ANTHROPIC_API_KEY"],
        "openai" => &["OPENAI_API_KEY"],
        "gemini" => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        _ => &[],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Write each phase's retry history under `.hitl/feedback/`.
    #[serde(default)]
    pub persist_history: bool,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for FeedbackSection {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            persist_history: false,
        }
    }
}

/// Output gate settings. The pattern lists extend the built-in ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub forbidden: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed: Vec::new(),
            forbidden: Vec::new(),
        }
    }
}

/// How the driver behaves once a session pauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Return to the caller; a later `resume` continues the task.
    #[default]
    Exit,
    /// Poll the store until a reviewer decides.
    Poll,
}

impl std::fmt::Display for WaitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitMode::Exit => write!(f, "exit"),
            WaitMode::Poll => write!(f, "poll"),
        }
    }
}

impl std::str::FromStr for WaitMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exit" => Ok(WaitMode::Exit),
            "poll" => Ok(WaitMode::Poll),
            _ => anyhow::bail!("Invalid HITL mode '{}'. Valid values: exit, poll", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlSection {
    /// When false every checkpoint is approved automatically.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_approve: Vec<Checkpoint>,
    #[serde(default)]
    pub mode: WaitMode,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_timeout_secs: Option<u64>,
    /// Reruns a session may request before it needs user intervention.
    #[serde(default = "default_max_reruns")]
    pub max_reruns: u32,
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_max_reruns() -> u32 {
    DEFAULT_MAX_RERUNS
}

impl Default for HitlSection {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_approve: Vec::new(),
            mode: WaitMode::Exit,
            poll_interval_secs: default_poll_interval_secs(),
            poll_timeout_secs: None,
            max_reruns: DEFAULT_MAX_RERUNS,
        }
    }
}

impl HitlSection {
    pub fn auto_approves(&self, checkpoint: Checkpoint) -> bool {
        !self.enabled || self.auto_approve.contains(&checkpoint)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Empty means the built-in pipeline, see `default_pipeline`.
    #[serde(default)]
    pub phases: Vec<PhaseSpec>,
}

/// The complete hitl.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HitlToml {
    #[serde(default)]
    pub providers: ProvidersSection,
    #[serde(default)]
    pub feedback: FeedbackSection,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub hitl: HitlSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("Invalid boolean '{}' for {}", value, var),
    }
}

impl HitlToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse hitl.toml")
    }

    /// Load `.hitl/hitl.toml`, or defaults if the file doesn't exist.
    pub fn load_or_default(hitl_dir: &Path) -> Result<Self> {
        let path = hitl_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize hitl.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `HITL_*` environment overrides through `env`.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(order) = env("HITL_PROVIDER_ORDER") {
            self.providers.order = parse_list(&order);
        }
        if let Some(value) = env("HITL_PROVIDER_TIMEOUT_SECS") {
            self.providers.timeout_secs = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid HITL_PROVIDER_TIMEOUT_SECS '{}'", value))?;
        }
        if let Some(value) = env("HITL_STREAMING") {
            self.providers.streaming = parse_bool("HITL_STREAMING", &value)?;
        }
        if let Some(value) = env("HITL_MAX_RETRIES") {
            self.feedback.max_retries = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid HITL_MAX_RETRIES '{}'", value))?;
        }
        if let Some(value) = env("HITL_SAFETY_ENABLED") {
            self.safety.enabled = parse_bool("HITL_SAFETY_ENABLED", &value)?;
        }
        if let Some(value) = env("HITL_ENABLED") {
            self.hitl.enabled = parse_bool("HITL_ENABLED", &value)?;
        }
        if let Some(value) = env("HITL_MODE") {
            self.hitl.mode = value.parse()?;
        }
        if let Some(value) = env("HITL_AUTO_APPROVE") {
            self.hitl.auto_approve = parse_list(&value)
                .iter()
                .map(|s| s.parse::<Checkpoint>().map_err(anyhow::Error::msg))
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(value) = env("HITL_MAX_RERUNS") {
            self.hitl.max_reruns = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid HITL_MAX_RERUNS '{}'", value))?;
        }
        if let Some(value) = env("HITL_LOG_LEVEL") {
            self.logging.level = Some(value);
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.providers.order.is_empty() {
            warnings.push("providers.order is empty: every provider call will fail".to_string());
        }
        for name in &self.providers.order {
            if !DEFAULT_ORDER.contains(&name.as_str()) {
                warnings.push(format!(
                    "Unknown provider '{}' in providers.order (built-in: {})",
                    name,
                    DEFAULT_ORDER.join(", ")
                ));
            }
        }
        if self.providers.timeout_secs == 0 {
            warnings.push("providers.timeout_secs is 0: every call will time out".to_string());
        }
        if self.hitl.mode == WaitMode::Poll && self.hitl.poll_interval_secs == 0 {
            warnings.push("hitl.poll_interval_secs must be at least 1".to_string());
        }
        for pattern in self.safety.allowed.iter().chain(&self.safety.forbidden) {
            if let Err(e) = regex::Regex::new(pattern) {
                warnings.push(format!("Invalid safety pattern '{}': {}", pattern, e));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for phase in &self.pipeline.phases {
            if !seen.insert(phase.name.to_lowercase()) {
                warnings.push(format!("Duplicate pipeline phase '{}'", phase.name));
            }
            if phase.executor.trim().is_empty() {
                warnings.push(format!("Pipeline phase '{}' has no executor", phase.name));
            }
        }

        warnings
    }
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct HitlConfig {
    pub project_dir: PathBuf,
    pub hitl_dir: PathBuf,
    pub toml: HitlToml,
    pub verbose: bool,
}

impl HitlConfig {
    /// Load file and environment layers for `project_dir`.
    ///
    /// A `.env` file in the project directory is read first; variables
    /// already set in the process environment take precedence.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let env_file = project_dir.join(".env");
        if env_file.exists() {
            dotenvy::from_path(&env_file)
                .with_context(|| format!("Failed to load {}", env_file.display()))?;
        }
        let hitl_dir = project_dir.join(HITL_DIR);
        let mut toml = HitlToml::load_or_default(&hitl_dir)?;
        toml.apply_env(|var| std::env::var(var).ok())?;
        Ok(Self::from_parts(project_dir.to_path_buf(), toml))
    }

    pub fn from_parts(project_dir: PathBuf, toml: HitlToml) -> Self {
        let hitl_dir = project_dir.join(HITL_DIR);
        Self {
            project_dir,
            hitl_dir,
            toml,
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.hitl_dir.join(CONFIG_FILE)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.hitl_dir.join("sessions")
    }

    pub fn feedback_dir(&self) -> PathBuf {
        self.hitl_dir.join("feedback")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.hitl_dir.join("logs")
    }

    /// Artifacts are written relative to the project root.
    pub fn output_root(&self) -> &Path {
        &self.project_dir
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.toml.hitl.poll_interval_secs.max(1))
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        self.toml.hitl.poll_timeout_secs.map(Duration::from_secs)
    }

    pub fn provider_configs(&self) -> HashMap<String, ProviderConfig> {
        self.toml.providers.resolve(|var| std::env::var(var).ok())
    }

    /// Create the `.hitl/` layout. Returns true if it did not exist before.
    pub fn ensure_directories(&self) -> Result<bool> {
        let created = !self.hitl_dir.exists();
        for dir in [
            self.hitl_dir.clone(),
            self.sessions_dir(),
            self.feedback_dir(),
            self.log_dir(),
            self.hitl_dir.join("output"),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(created)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
