//! The top-level control loop for one task.
//!
//! For each phase the driver marks the session running, asks the phase's
//! executor for artifacts, holds them to the phase's deliverables through the
//! feedback loop, passes every artifact through the output gate before it is
//! written, and pauses at the phase's checkpoint. A task's phases run
//! strictly in sequence; separate tasks may be driven concurrently.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use super::{Executor, PhaseInput, PhaseSpec, SkillRegistry};
use crate::artifact::Artifact;
use crate::config::HitlSection;
use crate::errors::{OrchestratorError, SessionError};
use crate::feedback::{FeedbackLoopController, RequirementSpec, RetryProducer, build_feedback};
use crate::safety::OutputGate;
use crate::session::{Checkpoint, PauseContext, Session, SessionStatus, SessionStore};

type Result<T> = std::result::Result<T, OrchestratorError>;

/// What happens after the driver pauses a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Return `Paused`; a later `resume` picks the task up.
    Exit,
    /// Poll the store for a decision. `None` waits indefinitely.
    Poll {
        interval: Duration,
        timeout: Option<Duration>,
    },
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub max_retries: u32,
    pub wait: WaitPolicy,
    pub hitl: HitlSection,
    /// Root that artifact paths are resolved against.
    pub output_root: PathBuf,
    /// Where per-phase retry histories are written, if anywhere.
    pub feedback_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOutcome {
    Completed,
    Paused { checkpoint: Checkpoint },
    Rejected { reason: String },
    Failed { error: String },
    /// Resume was requested for a session that is already running.
    AlreadyRunning,
    /// The rerun budget is spent; a person has to step in.
    InterventionRequired { reruns: u32 },
}

impl std::fmt::Display for DriverOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Paused { checkpoint } => write!(f, "paused at {}", checkpoint),
            Self::Rejected { reason } => write!(f, "rejected: {}", reason),
            Self::Failed { error } => write!(f, "failed: {}", error),
            Self::AlreadyRunning => write!(f, "already running"),
            Self::InterventionRequired { reruns } => {
                write!(f, "user intervention required after {} reruns", reruns)
            }
        }
    }
}

/// How a checkpoint was settled.
enum Decision {
    Approved,
    Rejected(String),
    Pending,
}

/// Result of persisting one phase's artifacts.
#[derive(Debug, Default)]
struct PersistReport {
    written: Vec<String>,
    refused: Vec<String>,
    masked: usize,
}

/// Re-runs a phase's executor with validator feedback.
struct ExecutorRetry {
    executor: Arc<dyn Executor>,
    template: PhaseInput,
}

#[async_trait]
impl RetryProducer for ExecutorRetry {
    async fn retry(
        &self,
        missing: &[String],
        feedback: &str,
        current: &[Artifact],
    ) -> anyhow::Result<Vec<Artifact>> {
        let input = PhaseInput {
            prior_artifacts: current.to_vec(),
            missing: missing.to_vec(),
            feedback: Some(feedback.to_string()),
            ..self.template.clone()
        };
        Ok(self.executor.execute(input).await?.artifacts)
    }
}

pub struct Driver {
    store: Arc<SessionStore>,
    skills: Arc<dyn SkillRegistry>,
    gate: Arc<OutputGate>,
    pipeline: Vec<PhaseSpec>,
    settings: DriverSettings,
}

impl Driver {
    pub fn new(
        store: Arc<SessionStore>,
        skills: Arc<dyn SkillRegistry>,
        gate: Arc<OutputGate>,
        pipeline: Vec<PhaseSpec>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            store,
            skills,
            gate,
            pipeline,
            settings,
        }
    }

    pub fn pipeline(&self) -> &[PhaseSpec] {
        &self.pipeline
    }

    /// Create the session for `task_id` and drive it from the first phase.
    pub async fn run(
        &self,
        task_id: &str,
        request_ref: &str,
        request: &str,
        metadata: Map<String, Value>,
    ) -> Result<DriverOutcome> {
        if self.pipeline.is_empty() {
            return Err(anyhow::anyhow!("Pipeline has no phases").into());
        }
        let id = task_id.to_string();
        let request_ref = request_ref.to_string();
        self.with_store(move |s| s.create(&id, &request_ref, metadata))
            .await?;
        info!(task_id, phases = self.pipeline.len(), "starting pipeline");
        self.drive(task_id, 0, request, Vec::new(), None).await
    }

    /// Continue an approved session from the phase its checkpoint maps to.
    ///
    /// A session that is already running is left alone.
    pub async fn resume(&self, task_id: &str, request: &str) -> Result<DriverOutcome> {
        let id = task_id.to_string();
        let before = self.with_store(move |s| s.require(&id)).await?;
        if before.status == SessionStatus::Running {
            info!(task_id, "resume ignored, session already running");
            return Ok(DriverOutcome::AlreadyRunning);
        }
        let id = task_id.to_string();
        let session = self.with_store(move |s| s.resume(&id)).await?;
        let carried = carried_artifacts(&session);
        let comment = session
            .hitl_context
            .as_ref()
            .and_then(|ctx| ctx.approver_comment.clone());
        let start = self.next_index(&session);
        info!(task_id, start, "resuming pipeline");
        self.drive(task_id, start, request, carried, comment).await
    }

    /// Send a paused session back through the pipeline from `from_phase`, or
    /// from the phase that paused.
    ///
    /// Once the session's rerun budget is spent nothing runs and the outcome
    /// is `InterventionRequired`.
    pub async fn rerun(
        &self,
        task_id: &str,
        from_phase: Option<&str>,
        request: &str,
    ) -> Result<DriverOutcome> {
        if let Some(name) = from_phase.filter(|name| self.phase_index(name).is_none()) {
            return Err(anyhow::anyhow!("Pipeline has no phase named '{}'", name).into());
        }
        let id = task_id.to_string();
        let from = from_phase.map(str::to_string);
        let session = self
            .with_store(move |s| s.request_rerun(&id, from.as_deref()))
            .await?;
        if session.status == SessionStatus::UserInterventionRequired {
            return Ok(DriverOutcome::InterventionRequired {
                reruns: session.rerun_count,
            });
        }
        let start = session
            .rerun_from
            .as_deref()
            .and_then(|name| self.phase_index(name))
            .unwrap_or(0);
        let carried = carried_artifacts(&session);
        let comment = session.hitl_context.as_ref().and_then(|ctx| {
            ctx.rejection_reason
                .clone()
                .or_else(|| ctx.approver_comment.clone())
        });
        info!(task_id, start, reruns = session.rerun_count, "rerunning pipeline");
        self.drive(task_id, start, request, carried, comment).await
    }

    fn phase_index(&self, name: &str) -> Option<usize> {
        self.pipeline
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Where a freshly resumed session continues.
    ///
    /// A manual fix reruns the phase that paused, unless it was approved as
    /// an exception, in which case the driver moves past it. Otherwise the
    /// checkpoint table names the target phase; if that phase is not in the
    /// pipeline, or is the phase that paused, the driver continues after the
    /// paused phase.
    fn next_index(&self, session: &Session) -> usize {
        let ctx = session.hitl_context.as_ref();
        let paused_at = ctx
            .and_then(|c| c.phase.as_deref())
            .and_then(|name| self.phase_index(name));
        let after_pause = paused_at.map_or(self.pipeline.len(), |i| i + 1);

        if let (Some(ctx), Some(paused_at)) = (ctx, paused_at) {
            if ctx.checkpoint == Checkpoint::ManualFix {
                return if ctx.is_exception {
                    after_pause
                } else {
                    paused_at
                };
            }
        }

        match session
            .current_phase
            .as_deref()
            .and_then(|name| self.phase_index(name))
        {
            Some(target) if Some(target) != paused_at => target,
            _ => after_pause,
        }
    }

    /// Run a store operation off the async workers.
    async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&SessionStore) -> std::result::Result<T, SessionError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .context("Session store task panicked")?
            .map_err(OrchestratorError::from)
    }

    /// Drive phases from `start`. Any error part way through marks the
    /// session `FAILED` before it is reported.
    async fn drive(
        &self,
        task_id: &str,
        start: usize,
        request: &str,
        carried: Vec<Artifact>,
        reviewer_comment: Option<String>,
    ) -> Result<DriverOutcome> {
        let error = match self
            .drive_phases(task_id, start, request, carried, reviewer_comment)
            .await
        {
            Ok(outcome) => return Ok(outcome),
            Err(error) => error,
        };
        let message = error.to_string();
        let id = task_id.to_string();
        let reason = message.clone();
        match self.with_store(move |s| s.fail(&id, &reason)).await {
            Ok(_) => {
                warn!(task_id, error = %message, "pipeline failed");
                Ok(DriverOutcome::Failed { error: message })
            }
            Err(e) => {
                warn!(task_id, error = %e, "could not mark session failed");
                Err(error)
            }
        }
    }

    async fn drive_phases(
        &self,
        task_id: &str,
        start: usize,
        request: &str,
        mut carried: Vec<Artifact>,
        mut reviewer_comment: Option<String>,
    ) -> Result<DriverOutcome> {
        let mut index = start;
        let mut phases_run = 0usize;
        let mut written = 0usize;
        // Persist results since the last pause, reported to the reviewer.
        let mut report = PersistReport::default();

        while let Some(spec) = self.pipeline.get(index) {
            let (id, phase) = (task_id.to_string(), spec.name.clone());
            self.with_store(move |s| s.update_phase(&id, &phase))
                .await?;
            let executor = self.skills.get_executor(&spec.executor).ok_or_else(|| {
                OrchestratorError::MissingExecutor {
                    phase_type: spec.executor.clone(),
                }
            })?;

            let input = PhaseInput {
                task_id: task_id.to_string(),
                phase: spec.name.clone(),
                request: request.to_string(),
                prior_artifacts: carried.clone(),
                reviewer_comment: reviewer_comment.take(),
                ..PhaseInput::default()
            };
            let output = executor.execute(input.clone()).await.map_err(|source| {
                OrchestratorError::Executor {
                    phase: spec.name.clone(),
                    source,
                }
            })?;
            phases_run += 1;

            let (artifacts, unmet) = if spec.deliverables.is_empty() {
                (output.artifacts, None)
            } else {
                let mut controller = FeedbackLoopController::new(self.settings.max_retries);
                let retry = ExecutorRetry {
                    executor: executor.clone(),
                    template: input,
                };
                let outcome = controller
                    .run_with_feedback(
                        output.artifacts,
                        &RequirementSpec::new(spec.deliverables.iter().cloned()),
                        Some(&retry as &dyn RetryProducer),
                    )
                    .await;
                if let Some(dir) = &self.settings.feedback_dir {
                    let path = dir.join(format!("{}-{}.json", task_id, spec.name.to_lowercase()));
                    if let Err(e) = controller.save_history(&path) {
                        warn!(task_id, error = %e, "failed to save feedback history");
                    }
                }
                let unmet = (!outcome.passed).then(|| outcome.validation.clone());
                (outcome.outputs, unmet)
            };

            let gate = self.gate.clone();
            let root = self.settings.output_root.clone();
            let id = task_id.to_string();
            let (artifacts, phase_report) = tokio::task::spawn_blocking(move || {
                let mut phase_report = PersistReport::default();
                persist(&gate, &root, &id, artifacts, &mut phase_report)
                    .map(|kept| (kept, phase_report))
            })
            .await
            .context("Artifact writer task panicked")??;
            report.absorb(phase_report);
            carried = crate::feedback::merge_outputs(carried, artifacts);

            let pause = match (&unmet, spec.checkpoint) {
                (Some(validation), _) => Some((
                    Checkpoint::ManualFix,
                    format!(
                        "{} did not produce its deliverables after {} retries.\n\n{}",
                        spec.name,
                        self.settings.max_retries,
                        build_feedback(validation)
                    ),
                )),
                (None, Some(checkpoint)) => Some((
                    checkpoint,
                    format!("{} finished. Review its artifacts before continuing.", spec.name),
                )),
                (None, None) => None,
            };

            let Some((checkpoint, message)) = pause else {
                index += 1;
                continue;
            };

            let context = PauseContext::new(message)
                .with_artifacts(
                    carried
                        .iter()
                        .map(|a| a.path.clone().unwrap_or_else(|| a.name.clone()))
                        .collect(),
                )
                .with_payload(json!({
                    "artifacts": carried,
                    "written": report.written,
                    "refused": report.refused,
                    "maskedSecrets": report.masked,
                }));
            let id = task_id.to_string();
            self.with_store(move |s| s.pause_for_hitl(&id, checkpoint, context))
                .await?;
            written += report.written.len();
            report = PersistReport::default();

            match self.settle(task_id, checkpoint).await? {
                Decision::Approved => {
                    let id = task_id.to_string();
                    let session = self.with_store(move |s| s.resume(&id)).await?;
                    reviewer_comment = session
                        .hitl_context
                        .as_ref()
                        .and_then(|ctx| ctx.approver_comment.clone());
                    index = self.next_index(&session);
                }
                Decision::Rejected(reason) => return Ok(DriverOutcome::Rejected { reason }),
                Decision::Pending => return Ok(DriverOutcome::Paused { checkpoint }),
            }
        }

        written += report.written.len();
        let id = task_id.to_string();
        let summary = json!({ "phasesRun": phases_run, "artifactsWritten": written });
        self.with_store(move |s| s.complete(&id, summary)).await?;
        info!(task_id, phases_run, written, "pipeline completed");
        Ok(DriverOutcome::Completed)
    }

    /// Auto-approve, wait for, or leave pending a freshly paused checkpoint.
    async fn settle(&self, task_id: &str, checkpoint: Checkpoint) -> Result<Decision> {
        if self.settings.hitl.auto_approves(checkpoint) {
            info!(task_id, %checkpoint, "auto-approving checkpoint");
            let id = task_id.to_string();
            self.with_store(move |s| s.approve(&id, Some("auto-approved")))
                .await?;
            return Ok(Decision::Approved);
        }
        match self.settings.wait {
            WaitPolicy::Exit => Ok(Decision::Pending),
            WaitPolicy::Poll { interval, timeout } => {
                self.wait_for_decision(task_id, interval, timeout).await
            }
        }
    }

    async fn wait_for_decision(
        &self,
        task_id: &str,
        interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<Decision> {
        let started = Instant::now();
        info!(task_id, ?timeout, "waiting for reviewer decision");
        loop {
            let id = task_id.to_string();
            let session = self.with_store(move |s| s.require(&id)).await?;
            match session.status {
                SessionStatus::Approved => return Ok(Decision::Approved),
                SessionStatus::Rejected => {
                    let reason = session
                        .hitl_context
                        .and_then(|ctx| ctx.rejection_reason)
                        .unwrap_or_default();
                    return Ok(Decision::Rejected(reason));
                }
                SessionStatus::PausedHitl => {}
                other => {
                    warn!(task_id, status = %other, "session left review outside this driver");
                    return Ok(Decision::Pending);
                }
            }
            if timeout.is_some_and(|t| started.elapsed() >= t) {
                info!(task_id, "stopped waiting, session stays paused");
                return Ok(Decision::Pending);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

impl PersistReport {
    fn absorb(&mut self, other: PersistReport) {
        self.written.extend(other.written);
        self.refused.extend(other.refused);
        self.masked += other.masked;
    }
}

/// Gate and write every artifact that names a path.
///
/// Returned artifacts carry sanitized content; refused ones are dropped.
fn persist(
    gate: &OutputGate,
    root: &Path,
    task_id: &str,
    artifacts: Vec<Artifact>,
    report: &mut PersistReport,
) -> Result<Vec<Artifact>> {
    let mut kept = Vec::with_capacity(artifacts.len());

    for mut artifact in artifacts {
        let Some(path) = artifact.path.clone() else {
            let check = gate.validate_content(&artifact.content);
            report.masked += check.violations.iter().map(|v| v.count).sum::<usize>();
            artifact.content = check.sanitized;
            kept.push(artifact);
            continue;
        };

        let check = gate.validate_file_write(&path, &artifact.content);
        report.masked += check
            .content_violations
            .iter()
            .map(|v| v.count)
            .sum::<usize>();
        if !check.allowed {
            let refusal = OrchestratorError::ForbiddenOutputPath {
                path: path.clone(),
                violations: check.violation_messages(),
            };
            warn!(task_id, error = %refusal, "artifact not written");
            report.refused.push(path);
            continue;
        }

        write_artifact(root, &path, &check.sanitized_content)?;
        report.written.push(path);
        artifact.content = check.sanitized_content;
        kept.push(artifact);
    }
    Ok(kept)
}

fn write_artifact(root: &Path, relative: &str, content: &str) -> Result<()> {
    let target = root.join(relative.replace('\\', "/"));
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&target, content)
        .with_context(|| format!("Failed to write artifact {}", target.display()))?;
    Ok(())
}

/// Artifacts stashed in the pause payload, for continuing after a restart.
fn carried_artifacts(session: &Session) -> Vec<Artifact> {
    session
        .hitl_context
        .as_ref()
        .and_then(|ctx| ctx.payload.get("artifacts"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}
