//! Pipeline definition, executor seam and the driver that sequences phases.
//!
//! A pipeline is an ordered list of [`PhaseSpec`]s. Each phase names the
//! executor type that produces its artifacts; the [`Driver`] looks executors
//! up through a [`SkillRegistry`] and knows nothing else about them.

pub mod driver;
pub mod executor;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::session::Checkpoint;

pub use driver::{Driver, DriverOutcome, DriverSettings, WaitPolicy};
pub use executor::ProviderExecutor;

/// One stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    /// Executor type looked up in the skill registry.
    pub executor: String,
    /// Pause for a reviewer after this phase's artifacts are persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    /// Required deliverables; non-empty enables the feedback loop.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliverables: Vec<String>,
}

impl PhaseSpec {
    pub fn new(name: &str, executor: &str) -> Self {
        Self {
            name: name.to_string(),
            executor: executor.to_string(),
            checkpoint: None,
            deliverables: Vec::new(),
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_deliverables<I, S>(mut self, deliverables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deliverables = deliverables.into_iter().map(Into::into).collect();
        self
    }
}

/// Planning → Coding → Verification → Deploy.
///
/// Planning pauses for design approval, Coding is held to its deliverables
/// by the feedback loop, Verification pauses for deploy approval.
pub fn default_pipeline() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec::new("Planning", "planner").with_checkpoint(Checkpoint::DesignApproval),
        PhaseSpec::new("Coding", "coder").with_deliverables(["implementation", "tests"]),
        PhaseSpec::new("Verification", "verifier").with_checkpoint(Checkpoint::DeployApproval),
        PhaseSpec::new("Deploy", "deployer"),
    ]
}

/// Everything an executor sees for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseInput {
    pub task_id: String,
    pub phase: String,
    /// The original request document.
    pub request: String,
    /// Artifacts produced by earlier phases or attempts.
    pub prior_artifacts: Vec<Artifact>,
    /// Deliverables the previous attempt failed to satisfy.
    pub missing: Vec<String>,
    /// Validator feedback from the previous attempt.
    pub feedback: Option<String>,
    /// Comment left by the reviewer at the last checkpoint.
    pub reviewer_comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOutput {
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, input: PhaseInput) -> Result<PhaseOutput>;
}

/// The driver's only view of how executors are found.
pub trait SkillRegistry: Send + Sync {
    fn get_executor(&self, phase_type: &str) -> Option<Arc<dyn Executor>>;
}

/// Name-keyed executor table.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, phase_type: &str, executor: Arc<dyn Executor>) {
        self.executors.insert(phase_type.to_string(), executor);
    }

    pub fn phase_types(&self) -> Vec<String> {
        let mut names: Vec<_> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl SkillRegistry for ExecutorRegistry {
    fn get_executor(&self, phase_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(phase_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Executor for Echo {
        async fn execute(&self, input: PhaseInput) -> Result<PhaseOutput> {
            Ok(PhaseOutput {
                artifacts: vec![Artifact::new(input.phase, input.request)],
                summary: None,
            })
        }
    }

    #[tokio::test]
    async fn registry_resolves_by_phase_type() {
        let mut registry = ExecutorRegistry::new();
        registry.register("echo", Arc::new(Echo));
        assert!(registry.get_executor("missing").is_none());
        let executor = registry.get_executor("echo").unwrap();
        let output = executor
            .execute(PhaseInput {
                phase: "Planning".to_string(),
                request: "build it".to_string(),
                ..PhaseInput::default()
            })
            .await
            .unwrap();
        assert_eq!(output.artifacts[0].name, "Planning");
        assert_eq!(registry.phase_types(), vec!["echo"]);
    }

    #[test]
    fn default_pipeline_checkpoints_resolve_forward() {
        let pipeline = default_pipeline();
        let names: Vec<_> = pipeline.iter().map(|p| p.name.as_str()).collect();
        for phase in &pipeline {
            if let Some(checkpoint) = phase.checkpoint {
                let next = checkpoint.next_phase();
                let here = names.iter().position(|n| *n == phase.name).unwrap();
                let there = names.iter().position(|n| *n == next).unwrap();
                assert!(there > here, "{} resumes backwards", phase.name);
            }
        }
        assert!(!pipeline[1].deliverables.is_empty());
    }
}
