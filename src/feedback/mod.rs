//! Bounded-retry feedback loop.
//!
//! [`FeedbackLoopController::run_with_feedback`] validates a phase's outputs
//! and, while they fall short, asks a [`RetryProducer`] for more, feeding it
//! the unsatisfied deliverables and the validator's errors. The loop always
//! ends with a defined [`ValidationResult`]: either a pass or, after
//! `max_retries + 1` validations, an exhausted budget reported as
//! `passed == false`.
//!
//! Outputs from successive attempts are merged by name with last-producer-wins
//! semantics, see [`merge_outputs`].

pub mod validator;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::Artifact;

pub use validator::{
    DeliverableValidator, Issue, MatchSummary, RequirementSpec, ValidationResult, Validator,
};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Produces replacement or additional outputs for a failed validation.
#[async_trait]
pub trait RetryProducer: Send + Sync {
    async fn retry(
        &self,
        missing: &[String],
        feedback: &str,
        current: &[Artifact],
    ) -> Result<Vec<Artifact>>;
}

/// One iteration of the loop, kept in the controller's own history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub output_count: usize,
    pub passed: bool,
    pub match_summary: MatchSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackOutcome {
    pub passed: bool,
    pub outputs: Vec<Artifact>,
    pub retry_count: u32,
    pub validation: ValidationResult,
    pub history: Vec<RetryAttempt>,
}

pub struct FeedbackLoopController {
    max_retries: u32,
    validator: Arc<dyn Validator>,
    history: Vec<RetryAttempt>,
}

impl Default for FeedbackLoopController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl FeedbackLoopController {
    pub fn new(max_retries: u32) -> Self {
        Self::with_validator(max_retries, Arc::new(DeliverableValidator))
    }

    pub fn with_validator(max_retries: u32, validator: Arc<dyn Validator>) -> Self {
        Self {
            max_retries,
            validator,
            history: Vec::new(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn history(&self) -> &[RetryAttempt] {
        &self.history
    }

    pub fn reset_history(&mut self) {
        self.history.clear();
    }

    pub async fn run_with_feedback(
        &mut self,
        outputs: Vec<Artifact>,
        spec: &RequirementSpec,
        producer: Option<&dyn RetryProducer>,
    ) -> FeedbackOutcome {
        let mut outputs = outputs;
        let mut retry_count = 0u32;

        let validation = loop {
            let validation = self.validator.validate(&outputs, spec);
            self.history.push(RetryAttempt {
                attempt_number: retry_count + 1,
                timestamp: Utc::now(),
                output_count: outputs.len(),
                passed: validation.passed,
                match_summary: validation.match_summary.clone(),
                retry_error: None,
            });
            debug!(
                attempt = retry_count + 1,
                matched = validation.match_summary.matched,
                total = validation.match_summary.total,
                passed = validation.passed,
                "validated outputs"
            );

            if validation.passed || retry_count >= self.max_retries {
                break validation;
            }

            let missing = validation.match_summary.missing.clone();
            let feedback = build_feedback(&validation);
            match producer {
                Some(producer) => match producer.retry(&missing, &feedback, &outputs).await {
                    Ok(produced) => {
                        info!(
                            attempt = retry_count + 1,
                            produced = produced.len(),
                            "retry produced outputs"
                        );
                        outputs = merge_outputs(outputs, produced);
                    }
                    Err(e) => {
                        warn!(attempt = retry_count + 1, error = %e, "retry attempt failed");
                        if let Some(last) = self.history.last_mut() {
                            last.retry_error = Some(format!("{:#}", e));
                        }
                    }
                },
                None => debug!("no retry producer; re-validating unchanged outputs"),
            }
            retry_count += 1;
        };

        if !validation.passed {
            warn!(
                retries = retry_count,
                missing = ?validation.match_summary.missing,
                "retry budget exhausted"
            );
        }

        FeedbackOutcome {
            passed: validation.passed,
            outputs,
            retry_count,
            validation,
            history: self.history.clone(),
        }
    }

    /// One line per attempt, for logs and the CLI.
    pub fn summary(&self) -> String {
        if self.history.is_empty() {
            return "No attempts recorded".to_string();
        }
        self.history
            .iter()
            .map(|a| {
                let mut line = format!(
                    "Attempt {}: {} ({}/{} deliverables, {} outputs)",
                    a.attempt_number,
                    if a.passed { "PASS" } else { "FAIL" },
                    a.match_summary.matched,
                    a.match_summary.total,
                    a.output_count
                );
                if let Some(err) = &a.retry_error {
                    line.push_str(&format!(" retry error: {}", err));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn save_history(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&self.history)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write feedback history: {}", path.display()))
    }
}

/// Merge `produced` into `current` by case-insensitive name.
///
/// A produced artifact replaces an existing one with the same name in place;
/// new names are appended in production order. Artifacts with a blank name
/// cannot be addressed and are dropped.
pub fn merge_outputs(current: Vec<Artifact>, produced: Vec<Artifact>) -> Vec<Artifact> {
    let mut merged = current;
    for artifact in produced {
        if artifact.name.trim().is_empty() {
            warn!("dropping produced artifact without a name");
            continue;
        }
        let key = artifact.key();
        match merged.iter_mut().find(|a| a.key() == key) {
            Some(existing) => *existing = artifact,
            None => merged.push(artifact),
        }
    }
    merged
}

/// Structured feedback handed to the retry producer.
pub fn build_feedback(validation: &ValidationResult) -> String {
    let mut sections = vec!["The previous output did not satisfy the requirements.".to_string()];
    if !validation.match_summary.missing.is_empty() {
        let items: Vec<_> = validation
            .match_summary
            .missing
            .iter()
            .map(|m| format!("- {}", m))
            .collect();
        sections.push(format!("## Missing deliverables\n{}", items.join("\n")));
    }
    if !validation.errors.is_empty() {
        let items: Vec<_> = validation
            .errors
            .iter()
            .map(|e| format!("- {}: {}", e.kind, e.message))
            .collect();
        sections.push(format!("## Errors\n{}", items.join("\n")));
    }
    sections.push(
        "Produce only the missing or corrected deliverables. Existing outputs with the same name will be replaced."
            .to_string(),
    );
    sections.join("\n\n")
}
