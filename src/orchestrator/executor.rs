//! Executor backed by the provider fallback chain.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Executor, ExecutorRegistry, PhaseInput, PhaseOutput};
use crate::artifact::Artifact;
use crate::provider::FallbackChain;
use crate::util::{extract_json_object, truncate};

const OUTPUT_CONTRACT: &str = r#"Respond with a single JSON object of the form
{"summary": "<one paragraph>", "artifacts": [{"name": "<deliverable name>", "path": "<relative file path, optional>", "content": "<full file content>"}]}"#;

/// Asks the fallback chain for a phase's artifacts.
pub struct ProviderExecutor {
    chain: FallbackChain,
    role: String,
}

impl ProviderExecutor {
    pub fn new(chain: FallbackChain, role: impl Into<String>) -> Self {
        Self {
            chain,
            role: role.into(),
        }
    }

    fn system_prompt(&self) -> String {
        format!("{}\n\n{}", self.role, OUTPUT_CONTRACT)
    }

    fn user_message(input: &PhaseInput) -> String {
        let mut sections = vec![
            format!("# Phase: {}", input.phase),
            format!("## Request\n{}", input.request.trim()),
        ];
        if !input.prior_artifacts.is_empty() {
            let listed: Vec<_> = input
                .prior_artifacts
                .iter()
                .map(|a| {
                    format!(
                        "### {}{}\n{}",
                        a.name,
                        a.path
                            .as_deref()
                            .map(|p| format!(" ({})", p))
                            .unwrap_or_default(),
                        truncate(&a.content, 4000)
                    )
                })
                .collect();
            sections.push(format!("## Existing artifacts\n{}", listed.join("\n\n")));
        }
        if let Some(comment) = &input.reviewer_comment {
            sections.push(format!("## Reviewer comment\n{}", comment));
        }
        if let Some(feedback) = &input.feedback {
            sections.push(format!("## Feedback on previous attempt\n{}", feedback));
        }
        sections.join("\n\n")
    }
}

/// Interpret a model reply as phase output.
///
/// A reply without a usable JSON object becomes one artifact named after the
/// phase holding the raw text.
pub fn parse_output(phase: &str, text: &str) -> PhaseOutput {
    if let Some(json) = extract_json_object(text) {
        match serde_json::from_str::<PhaseOutput>(&json) {
            Ok(output) if !output.artifacts.is_empty() || output.summary.is_some() => {
                return output;
            }
            Ok(_) => debug!(phase, "reply JSON had no artifacts"),
            Err(e) => warn!(phase, error = %e, "reply JSON did not match the output contract"),
        }
    }
    PhaseOutput {
        artifacts: vec![Artifact::new(phase.to_lowercase(), text.trim())],
        summary: None,
    }
}

#[async_trait]
impl Executor for ProviderExecutor {
    async fn execute(&self, input: PhaseInput) -> Result<PhaseOutput> {
        let user = Self::user_message(&input);
        let result = self.chain.send(&self.system_prompt(), &user).await?;
        debug!(
            phase = %input.phase,
            provider = %result.provider_name,
            chars = result.content.len(),
            "executor received reply"
        );
        Ok(parse_output(&input.phase, &result.content))
    }
}

/// Registry with a provider-backed executor for each default phase type.
pub fn provider_executors(chain: &FallbackChain) -> ExecutorRegistry {
    let roles = [
        (
            "planner",
            "You are a software architect. Produce a design document for the request.",
        ),
        (
            "coder",
            "You are a senior engineer. Implement the approved design. Deliverables named 'implementation' and 'tests' are required.",
        ),
        (
            "verifier",
            "You are a reviewer. Check the implementation against the request and report risks before deployment.",
        ),
        (
            "deployer",
            "You are a release engineer. Produce deployment notes and any release artifacts.",
        ),
    ];
    let mut registry = ExecutorRegistry::new();
    for (phase_type, role) in roles {
        registry.register(
            phase_type,
            Arc::new(ProviderExecutor::new(chain.clone(), role)),
        );
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::SkillRegistry;
    use crate::provider::ProviderRegistry;
    use crate::provider::testing::{Behavior, register_fake};
    use std::collections::HashMap;

    #[test]
    fn parse_output_reads_contract_json() {
        let reply = r#"Sure! {"summary": "done", "artifacts": [{"name": "api", "path": "src/api.rs", "content": "fn a() {}"}]}"#;
        let output = parse_output("Coding", reply);
        assert_eq!(output.summary.as_deref(), Some("done"));
        assert_eq!(output.artifacts.len(), 1);
        assert_eq!(output.artifacts[0].path.as_deref(), Some("src/api.rs"));
    }

    #[test]
    fn parse_output_falls_back_to_raw_text() {
        let output = parse_output("Planning", "  # Design\nUse a queue.  ");
        assert_eq!(output.artifacts.len(), 1);
        assert_eq!(output.artifacts[0].name, "planning");
        assert_eq!(output.artifacts[0].content, "# Design\nUse a queue.");
    }

    #[test]
    fn user_message_includes_feedback_and_comment() {
        let input = PhaseInput {
            phase: "Coding".into(),
            request: "Build a CLI".into(),
            prior_artifacts: vec![Artifact::new("design", "use clap").with_path("docs/design.md")],
            feedback: Some("missing tests".into()),
            reviewer_comment: Some("keep it small".into()),
            ..PhaseInput::default()
        };
        let message = ProviderExecutor::user_message(&input);
        assert!(message.contains("## Request\nBuild a CLI"));
        assert!(message.contains("### design (docs/design.md)\nuse clap"));
        assert!(message.contains("## Reviewer comment\nkeep it small"));
        assert!(message.contains("## Feedback on previous attempt\nmissing tests"));
    }

    #[tokio::test]
    async fn executes_through_fallback_chain() {
        let mut providers = ProviderRegistry::new();
        register_fake(
            &mut providers,
            "fake",
            Behavior::Succeed(r#"{"artifacts":[{"name":"design","content":"plan"}]}"#.into()),
        );
        let chain = FallbackChain::new(
            Arc::new(providers),
            vec!["fake".to_string()],
            HashMap::new(),
        );
        let registry = provider_executors(&chain);
        assert_eq!(
            registry.phase_types(),
            vec!["coder", "deployer", "planner", "verifier"]
        );
        let output = registry
            .get_executor("planner")
            .unwrap()
            .execute(PhaseInput {
                phase: "Planning".into(),
                ..PhaseInput::default()
            })
            .await
            .unwrap();
        assert_eq!(output.artifacts[0].content, "plan");
    }

    #[tokio::test]
    async fn chain_failure_surfaces_as_error() {
        let mut providers = ProviderRegistry::new();
        register_fake(&mut providers, "down", Behavior::Fail("HTTP 503".into()));
        let chain = FallbackChain::new(
            Arc::new(providers),
            vec!["down".to_string()],
            HashMap::new(),
        );
        let executor = ProviderExecutor::new(chain, "role");
        let err = executor.execute(PhaseInput::default()).await.unwrap_err();
        assert!(err.to_string().contains("All providers failed"));
    }
}
