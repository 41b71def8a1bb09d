//! Validators consulted by the feedback loop.

use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;

pub const MISSING_DELIVERABLE: &str = "MISSING_DELIVERABLE";
pub const EMPTY_OUTPUT: &str = "EMPTY_OUTPUT";
pub const UNEXPECTED_OUTPUT: &str = "UNEXPECTED_OUTPUT";

/// What a phase is expected to produce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSpec {
    pub deliverables: Vec<String>,
}

impl RequirementSpec {
    pub fn new<I, S>(deliverables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            deliverables: deliverables.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: String,
    pub message: String,
}

impl Issue {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub matched: usize,
    pub total: usize,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub passed: bool,
    pub match_summary: MatchSummary,
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

impl ValidationResult {
    /// Builds a result whose `passed` follows from the error list.
    pub fn from_issues(match_summary: MatchSummary, errors: Vec<Issue>, warnings: Vec<Issue>) -> Self {
        Self {
            passed: errors.is_empty(),
            match_summary,
            errors,
            warnings,
        }
    }
}

pub trait Validator: Send + Sync {
    fn validate(&self, outputs: &[Artifact], spec: &RequirementSpec) -> ValidationResult;
}

/// Checks that every required deliverable was produced with content.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeliverableValidator;

/// Lowercase, drop the extension and any directory, unify separators.
fn normalize(name: &str) -> String {
    let base = name.trim().rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    };
    stem.to_lowercase().replace(['-', ' '], "_")
}

fn artifact_matches(artifact: &Artifact, wanted: &str) -> bool {
    normalize(&artifact.name) == wanted
        || artifact
            .path
            .as_deref()
            .is_some_and(|p| normalize(p) == wanted)
}

impl Validator for DeliverableValidator {
    fn validate(&self, outputs: &[Artifact], spec: &RequirementSpec) -> ValidationResult {
        let mut errors = Vec::new();
        let mut missing = Vec::new();
        let mut used = vec![false; outputs.len()];

        for deliverable in &spec.deliverables {
            let wanted = normalize(deliverable);
            let found = outputs
                .iter()
                .enumerate()
                .filter(|(_, a)| artifact_matches(a, &wanted))
                .inspect(|(i, _)| used[*i] = true)
                .map(|(_, a)| a)
                .last();
            match found {
                None => {
                    missing.push(deliverable.clone());
                    errors.push(Issue::new(
                        MISSING_DELIVERABLE,
                        format!("required deliverable '{}' was not produced", deliverable),
                    ));
                }
                Some(a) if a.content.trim().is_empty() => {
                    missing.push(deliverable.clone());
                    errors.push(Issue::new(
                        EMPTY_OUTPUT,
                        format!("deliverable '{}' has no content", deliverable),
                    ));
                }
                Some(_) => {}
            }
        }

        let warnings = outputs
            .iter()
            .zip(&used)
            .filter(|(_, used)| !**used)
            .map(|(a, _)| {
                Issue::new(
                    UNEXPECTED_OUTPUT,
                    format!("'{}' does not match any required deliverable", a.name),
                )
            })
            .collect();

        let total = spec.deliverables.len();
        let summary = MatchSummary {
            matched: total - missing.len(),
            total,
            missing,
        };
        ValidationResult::from_issues(summary, errors, warnings)
    }
}
