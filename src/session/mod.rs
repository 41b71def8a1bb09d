//! Session state machine for one task's lifecycle.
//!
//! A [`Session`] is the authoritative record of a task: its status, the
//! phase it is in, the checkpoint it is paused at and an append-only history
//! of every transition. Transitions are methods on `Session` so they can be
//! exercised without storage; [`store::SessionStore`] wraps them with
//! per-task locking and durable persistence.
//!
//! ```text
//! CREATED ─► RUNNING ─► PAUSED_HITL ─┬─► APPROVED ─► RUNNING (resume)
//!               │  ▲                 ├─► REJECTED (terminal)
//!               │  │                 └─► USER_INTERVENTION_REQUIRED
//!               │  └── phase advances
//!               ├─► COMPLETED (terminal)
//!               └─► FAILED (terminal)
//! ```
//!
//! A rerun is requested from `PAUSED_HITL` or `USER_INTERVENTION_REQUIRED`
//! and sends the session back to `CREATED`. Once a session has spent its
//! rerun budget it waits in `USER_INTERVENTION_REQUIRED` instead.

pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::errors::SessionError;

pub use store::SessionStore;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Created,
    Running,
    PausedHitl,
    Approved,
    Rejected,
    Failed,
    Completed,
    UserInterventionRequired,
}

/// Sessions may be sent back for another pass this many times by default.
pub const DEFAULT_MAX_RERUNS: u32 = 3;

fn default_max_reruns() -> u32 {
    DEFAULT_MAX_RERUNS
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::PausedHitl => "PAUSED_HITL",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
            Self::UserInterventionRequired => "USER_INTERVENTION_REQUIRED",
        }
    }

    /// Terminal sessions accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Failed | Self::Completed)
    }

    /// Check whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, PausedHitl)
                | (Created, Failed)
                | (Running, Running)
                | (Running, PausedHitl)
                | (Running, Completed)
                | (Running, Failed)
                | (PausedHitl, PausedHitl)
                | (PausedHitl, Approved)
                | (PausedHitl, Rejected)
                | (PausedHitl, UserInterventionRequired)
                | (PausedHitl, Created)
                | (Approved, Running)
                | (Approved, Failed)
                | (UserInterventionRequired, UserInterventionRequired)
                | (UserInterventionRequired, Created)
                | (UserInterventionRequired, Failed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(Self::Created),
            "RUNNING" => Ok(Self::Running),
            "PAUSED_HITL" => Ok(Self::PausedHitl),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "FAILED" => Ok(Self::Failed),
            "COMPLETED" => Ok(Self::Completed),
            "USER_INTERVENTION_REQUIRED" => Ok(Self::UserInterventionRequired),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// Named points in the pipeline where a human must decide.
///
/// The set is closed: new members may be added, existing ones are never
/// repurposed. Records written by a newer build deserialize unknown names
/// as `Unrecognized`, which resumes into the `"Unknown"` phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Checkpoint {
    PrdReview,
    QueryReview,
    DesignApproval,
    ManualFix,
    DeployApproval,
    #[serde(other)]
    Unrecognized,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 5] = [
        Checkpoint::PrdReview,
        Checkpoint::QueryReview,
        Checkpoint::DesignApproval,
        Checkpoint::ManualFix,
        Checkpoint::DeployApproval,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrdReview => "PRD_REVIEW",
            Self::QueryReview => "QUERY_REVIEW",
            Self::DesignApproval => "DESIGN_APPROVAL",
            Self::ManualFix => "MANUAL_FIX",
            Self::DeployApproval => "DEPLOY_APPROVAL",
            Self::Unrecognized => "UNRECOGNIZED",
        }
    }

    /// The phase a session resumes into after this checkpoint is approved.
    pub fn next_phase(&self) -> &'static str {
        match self {
            Self::PrdReview => "Planning",
            Self::QueryReview => "QueryExecution",
            Self::DesignApproval => "Coding",
            Self::ManualFix => "Coding",
            Self::DeployApproval => "Deploy",
            Self::Unrecognized => "Unknown",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Checkpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Checkpoint::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("Invalid checkpoint: {}", s))
    }
}

/// The three ways a reviewer can settle a checkpoint besides a plain
/// approve or reject.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HitlDecision {
    /// Let this task through once without changing the rule it broke.
    ExceptionApproval,
    /// Ask an administrator to change the rule itself.
    RuleOverride,
    /// Send the paused phase back for rework.
    Reject,
}

impl HitlDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExceptionApproval => "EXCEPTION_APPROVAL",
            Self::RuleOverride => "RULE_OVERRIDE",
            Self::Reject => "REJECT",
        }
    }
}

impl fmt::Display for HitlDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HitlDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "EXCEPTION_APPROVAL" => Ok(Self::ExceptionApproval),
            "RULE_OVERRIDE" => Ok(Self::RuleOverride),
            "REJECT" => Ok(Self::Reject),
            _ => Err(format!("Invalid HITL decision: {}", s)),
        }
    }
}

/// A rule change proposed through [`HitlDecision::RuleOverride`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleOverrideRequest {
    pub comment: String,
    #[serde(default)]
    pub proposed_change: Value,
    pub requires_admin_review: bool,
}

/// Free-form reviewer feedback kept next to the session records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub task_id: String,
    pub feedback: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub path: std::path::PathBuf,
}

/// What the driver hands the reviewer when it pauses.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PauseContext {
    pub message: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub payload: Value,
}

impl PauseContext {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Reviewer-facing payload attached to a session during and after a pause.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HitlContext {
    pub checkpoint: Checkpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub message: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub payload: Value,
    pub paused_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<HitlDecision>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_exception: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_override_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_override_request: Option<RuleOverrideRequest>,
    /// Phase a reject-for-rework decision sends back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerun_phase: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryEvent {
    SessionCreated,
    StatusChanged,
    PausedForHitl,
    HitlApproved,
    HitlRejected,
    SessionResumed,
    SessionCompleted,
    SessionFailed,
    HitlExceptionApproved,
    HitlRuleOverrideRequested,
    HitlRejectedForRework,
    RerunRequested,
    MaxRetriesExceeded,
    FeedbackSaved,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub event: HistoryEvent,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: Value,
}

/// One task's orchestration record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub task_id: String,
    pub request_ref: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_checkpoint: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hitl_context: Option<HitlContext>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub rerun_count: u32,
    #[serde(default = "default_max_reruns")]
    pub max_reruns: u32,
    /// Phase the next run starts from after a rerun request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerun_from: Option<String>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

/// Validate a task id before it is used as a storage key.
pub fn validate_task_id(task_id: &str) -> Result<(), SessionError> {
    let invalid = |reason: &str| SessionError::InvalidTaskId {
        task_id: task_id.to_string(),
        reason: reason.to_string(),
    };
    if task_id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if task_id.len() > 128 {
        return Err(invalid("must be at most 128 characters"));
    }
    if task_id == "." || task_id == ".." {
        return Err(invalid("must not be a relative directory name"));
    }
    if !task_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("may only contain letters, digits, '-', '_' and '.'"));
    }
    Ok(())
}

impl Session {
    /// Start a new lifecycle. Records `SESSION_CREATED`.
    pub fn new(
        task_id: &str,
        request_ref: &str,
        metadata: Map<String, Value>,
    ) -> Result<Self, SessionError> {
        validate_task_id(task_id)?;
        let now = Utc::now();
        let mut session = Self {
            task_id: task_id.to_string(),
            request_ref: request_ref.to_string(),
            status: SessionStatus::Created,
            current_phase: None,
            current_checkpoint: None,
            hitl_context: None,
            metadata,
            created_at: now,
            updated_at: now,
            rerun_count: 0,
            max_reruns: DEFAULT_MAX_RERUNS,
            rerun_from: None,
            history: Vec::new(),
        };
        session.record(
            HistoryEvent::SessionCreated,
            json!({ "requestRef": request_ref }),
        );
        Ok(session)
    }

    /// The append-only transition log.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn record(&mut self, event: HistoryEvent, detail: Value) {
        let timestamp = Utc::now();
        self.updated_at = timestamp;
        self.history.push(HistoryEntry {
            event,
            timestamp,
            detail,
        });
    }

    fn invalid(&self, operation: &str) -> SessionError {
        SessionError::InvalidState {
            task_id: self.task_id.clone(),
            status: self.status.to_string(),
            operation: operation.to_string(),
        }
    }

    fn ensure_transition(&self, next: SessionStatus, operation: &str) -> Result<(), SessionError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    /// Generic status change for driver-owned statuses.
    ///
    /// `PAUSED_HITL`, `APPROVED`, `REJECTED`, `USER_INTERVENTION_REQUIRED`
    /// and a return to `CREATED` belong to the HITL operations and are
    /// refused here.
    pub fn set_status(&mut self, next: SessionStatus, extra: Option<Value>) -> Result<(), SessionError> {
        if matches!(
            next,
            SessionStatus::Created
                | SessionStatus::PausedHitl
                | SessionStatus::Approved
                | SessionStatus::Rejected
                | SessionStatus::UserInterventionRequired
        ) {
            return Err(self.invalid(&format!("set status {} on", next)));
        }
        self.ensure_transition(next, &format!("set status {} on", next))?;
        let from = self.status;
        self.status = next;
        let mut detail = json!({ "from": from, "to": next });
        if let Some(extra) = extra {
            detail["extra"] = extra;
        }
        self.record(HistoryEvent::StatusChanged, detail);
        Ok(())
    }

    /// Enter `phase`, marking the session `RUNNING`.
    pub fn start_phase(&mut self, phase: &str) -> Result<(), SessionError> {
        self.ensure_transition(SessionStatus::Running, "start a phase on")?;
        let from = self.status;
        self.status = SessionStatus::Running;
        self.current_phase = Some(phase.to_string());
        self.record(
            HistoryEvent::StatusChanged,
            json!({ "from": from, "to": SessionStatus::Running, "phase": phase }),
        );
        Ok(())
    }

    /// Suspend for a human decision at `checkpoint`.
    ///
    /// Pausing again while already paused replaces the pending checkpoint
    /// (last write wins); the replacement is its own history entry.
    pub fn pause(&mut self, checkpoint: Checkpoint, context: PauseContext) -> Result<(), SessionError> {
        self.ensure_transition(SessionStatus::PausedHitl, "pause")?;
        let replaced = match (self.status, self.current_checkpoint) {
            (SessionStatus::PausedHitl, Some(previous)) => Some(previous),
            _ => None,
        };
        self.status = SessionStatus::PausedHitl;
        self.current_checkpoint = Some(checkpoint);
        self.hitl_context = Some(HitlContext {
            checkpoint,
            phase: self.current_phase.clone(),
            message: context.message.clone(),
            artifacts: context.artifacts,
            payload: context.payload,
            paused_at: Utc::now(),
            approved_at: None,
            approver_comment: None,
            rejected_at: None,
            rejection_reason: None,
            decision: None,
            is_exception: false,
            rule_override_at: None,
            rule_override_request: None,
            rerun_phase: None,
        });
        let mut detail = json!({ "checkpoint": checkpoint, "message": context.message });
        if let Some(previous) = replaced {
            detail["replaced"] = json!(previous);
        }
        self.record(HistoryEvent::PausedForHitl, detail);
        Ok(())
    }

    pub fn approve(&mut self, comment: Option<&str>) -> Result<(), SessionError> {
        if self.status != SessionStatus::PausedHitl {
            return Err(self.invalid("approve"));
        }
        let checkpoint = self.current_checkpoint.take();
        let now = Utc::now();
        if let Some(ctx) = self.hitl_context.as_mut() {
            ctx.approved_at = Some(now);
            ctx.approver_comment = comment.map(str::to_string);
        }
        self.status = SessionStatus::Approved;
        self.record(
            HistoryEvent::HitlApproved,
            json!({ "checkpoint": checkpoint, "comment": comment }),
        );
        Ok(())
    }

    pub fn reject(&mut self, reason: &str) -> Result<(), SessionError> {
        if self.status != SessionStatus::PausedHitl {
            return Err(self.invalid("reject"));
        }
        if reason.trim().is_empty() {
            return Err(SessionError::EmptyReason {
                task_id: self.task_id.clone(),
            });
        }
        let checkpoint = self.current_checkpoint.take();
        let now = Utc::now();
        if let Some(ctx) = self.hitl_context.as_mut() {
            ctx.rejected_at = Some(now);
            ctx.rejection_reason = Some(reason.to_string());
        }
        self.status = SessionStatus::Rejected;
        self.record(
            HistoryEvent::HitlRejected,
            json!({ "checkpoint": checkpoint, "reason": reason }),
        );
        Ok(())
    }

    /// Settle a paused checkpoint with one of the three reviewer decisions.
    ///
    /// `EXCEPTION_APPROVAL` approves with the exception flag set,
    /// `RULE_OVERRIDE` hands the session to an administrator and `REJECT`
    /// rejects it, recording the phase to rework. `comment` is the reason
    /// for a reject and may not be empty there.
    pub fn decide(
        &mut self,
        decision: HitlDecision,
        comment: &str,
        rule_override: Option<Value>,
    ) -> Result<(), SessionError> {
        if self.status != SessionStatus::PausedHitl {
            return Err(self.invalid(&format!("apply {} to", decision)));
        }
        if decision == HitlDecision::Reject && comment.trim().is_empty() {
            return Err(SessionError::EmptyReason {
                task_id: self.task_id.clone(),
            });
        }
        let now = Utc::now();
        let comment_opt = (!comment.is_empty()).then(|| comment.to_string());
        let paused_phase = self
            .hitl_context
            .as_ref()
            .and_then(|ctx| ctx.phase.clone())
            .or_else(|| self.current_phase.clone());

        match decision {
            HitlDecision::ExceptionApproval => {
                let checkpoint = self.current_checkpoint.take();
                if let Some(ctx) = self.hitl_context.as_mut() {
                    ctx.decision = Some(decision);
                    ctx.approved_at = Some(now);
                    ctx.approver_comment = comment_opt;
                    ctx.is_exception = true;
                }
                self.status = SessionStatus::Approved;
                self.record(
                    HistoryEvent::HitlExceptionApproved,
                    json!({ "checkpoint": checkpoint, "comment": comment }),
                );
            }
            HitlDecision::RuleOverride => {
                let proposed_change = rule_override.unwrap_or(Value::Null);
                if let Some(ctx) = self.hitl_context.as_mut() {
                    ctx.decision = Some(decision);
                    ctx.rule_override_at = Some(now);
                    ctx.rule_override_request = Some(RuleOverrideRequest {
                        comment: comment.to_string(),
                        proposed_change: proposed_change.clone(),
                        requires_admin_review: true,
                    });
                }
                self.status = SessionStatus::UserInterventionRequired;
                self.record(
                    HistoryEvent::HitlRuleOverrideRequested,
                    json!({
                        "checkpoint": self.current_checkpoint,
                        "comment": comment,
                        "ruleOverride": proposed_change,
                    }),
                );
            }
            HitlDecision::Reject => {
                let checkpoint = self.current_checkpoint.take();
                if let Some(ctx) = self.hitl_context.as_mut() {
                    ctx.decision = Some(decision);
                    ctx.rejected_at = Some(now);
                    ctx.rejection_reason = comment_opt;
                    ctx.rerun_phase = paused_phase.clone();
                }
                self.status = SessionStatus::Rejected;
                self.record(
                    HistoryEvent::HitlRejectedForRework,
                    json!({ "checkpoint": checkpoint, "phase": paused_phase, "reason": comment }),
                );
            }
        }
        Ok(())
    }

    /// Send a session waiting on a human back to `CREATED` so the pipeline
    /// can run again from `from_phase`, or from the phase that paused.
    ///
    /// Returns `false` once the rerun budget is spent; the session is then
    /// left in `USER_INTERVENTION_REQUIRED`.
    pub fn request_rerun(&mut self, from_phase: Option<&str>) -> Result<bool, SessionError> {
        if !matches!(
            self.status,
            SessionStatus::PausedHitl | SessionStatus::UserInterventionRequired
        ) {
            return Err(self.invalid("rerun"));
        }
        self.rerun_count += 1;
        if self.rerun_count > self.max_reruns {
            self.status = SessionStatus::UserInterventionRequired;
            self.record(
                HistoryEvent::MaxRetriesExceeded,
                json!({ "rerunCount": self.rerun_count, "maxReruns": self.max_reruns }),
            );
            return Ok(false);
        }
        let phase = from_phase
            .map(str::to_string)
            .or_else(|| self.hitl_context.as_ref().and_then(|ctx| ctx.phase.clone()))
            .or_else(|| self.current_phase.clone());
        self.status = SessionStatus::Created;
        self.current_checkpoint = None;
        self.rerun_from = phase.clone();
        self.record(
            HistoryEvent::RerunRequested,
            json!({ "fromPhase": phase, "rerunCount": self.rerun_count }),
        );
        Ok(true)
    }

    /// Continue after approval. Returns `false` when already running.
    pub fn resume(&mut self) -> Result<bool, SessionError> {
        match self.status {
            SessionStatus::Running => Ok(false),
            SessionStatus::Approved => {
                let checkpoint = self
                    .hitl_context
                    .as_ref()
                    .map(|ctx| ctx.checkpoint)
                    .unwrap_or(Checkpoint::Unrecognized);
                let phase = checkpoint.next_phase();
                self.status = SessionStatus::Running;
                self.current_phase = Some(phase.to_string());
                self.record(
                    HistoryEvent::SessionResumed,
                    json!({ "checkpoint": checkpoint, "phase": phase }),
                );
                Ok(true)
            }
            _ => Err(self.invalid("resume")),
        }
    }

    pub fn complete(&mut self, summary: Value) -> Result<(), SessionError> {
        self.ensure_transition(SessionStatus::Completed, "complete")?;
        self.status = SessionStatus::Completed;
        self.record(HistoryEvent::SessionCompleted, summary);
        Ok(())
    }

    pub fn fail(&mut self, error: &str) -> Result<(), SessionError> {
        self.ensure_transition(SessionStatus::Failed, "fail")?;
        let from = self.status;
        self.status = SessionStatus::Failed;
        self.current_checkpoint = None;
        self.record(
            HistoryEvent::SessionFailed,
            json!({ "from": from, "error": error }),
        );
        Ok(())
    }

    /// Note reviewer feedback stored at `record.path`.
    pub fn record_feedback(&mut self, record: &FeedbackRecord) {
        self.record(
            HistoryEvent::FeedbackSaved,
            json!({ "feedback": record.feedback, "file": record.path.display().to_string() }),
        );
    }

    /// Reviewer queue entry, if this session is waiting on a human.
    pub fn pending_request(&self, now: DateTime<Utc>) -> Option<PendingRequest> {
        if self.status != SessionStatus::PausedHitl {
            return None;
        }
        let ctx = self.hitl_context.as_ref()?;
        let checkpoint = self.current_checkpoint.unwrap_or(ctx.checkpoint);
        Some(PendingRequest {
            task_id: self.task_id.clone(),
            checkpoint,
            phase: ctx.phase.clone(),
            message: ctx.message.clone(),
            artifacts: ctx.artifacts.clone(),
            paused_at: ctx.paused_at,
            waiting_secs: (now - ctx.paused_at).num_seconds().max(0),
        })
    }
}

/// A session waiting for a reviewer, as shown in the pending queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub task_id: String,
    pub checkpoint: Checkpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub message: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub paused_at: DateTime<Utc>,
    pub waiting_secs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> Session {
        Session::new("T1", "docs/request.md", Map::new()).unwrap()
    }

    fn paused_session() -> Session {
        let mut s = new_session();
        s.start_phase("Planning").unwrap();
        s.pause(Checkpoint::DesignApproval, PauseContext::new("review design"))
            .unwrap();
        s
    }

    #[test]
    fn new_session_records_created() {
        let s = new_session();
        assert_eq!(s.status, SessionStatus::Created);
        assert_eq!(s.history().len(), 1);
        assert_eq!(s.history()[0].event, HistoryEvent::SessionCreated);
    }

    #[test]
    fn task_id_rejects_path_hostile_characters() {
        for bad in ["", ".", "..", "../x", "a/b", "a\\b", "x y", "t:1"] {
            assert!(
                matches!(validate_task_id(bad), Err(SessionError::InvalidTaskId { .. })),
                "expected {:?} to be rejected",
                bad
            );
        }
        assert!(validate_task_id(&"a".repeat(129)).is_err());
        for good in ["T1", "task-42", "run_2024.10.01"] {
            assert!(validate_task_id(good).is_ok());
        }
    }

    #[test]
    fn valid_transitions() {
        use SessionStatus::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(PausedHitl));
        assert!(PausedHitl.can_transition_to(Approved));
        assert!(PausedHitl.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
    }

    #[test]
    fn invalid_transitions() {
        use SessionStatus::*;
        assert!(!Created.can_transition_to(Approved));
        assert!(!Running.can_transition_to(Approved));
        assert!(!Running.can_transition_to(Rejected));
        assert!(!Approved.can_transition_to(Rejected));
        for terminal in [Rejected, Failed, Completed] {
            assert!(terminal.is_terminal());
            for next in [
                Created,
                Running,
                PausedHitl,
                Approved,
                Rejected,
                Failed,
                Completed,
                UserInterventionRequired,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn approve_and_reject_only_from_paused() {
        let mut created = new_session();
        assert!(matches!(
            created.approve(None),
            Err(SessionError::InvalidState { .. })
        ));
        assert!(matches!(
            created.reject("no"),
            Err(SessionError::InvalidState { .. })
        ));

        let mut running = new_session();
        running.start_phase("Coding").unwrap();
        assert!(running.approve(Some("ok")).is_err());

        let mut approved = paused_session();
        approved.approve(Some("ok")).unwrap();
        assert!(approved.approve(None).is_err());
        assert!(approved.reject("late").is_err());
    }

    #[test]
    fn approve_stamps_context_and_clears_checkpoint() {
        let mut s = paused_session();
        s.approve(Some("looks good")).unwrap();
        assert_eq!(s.status, SessionStatus::Approved);
        assert!(s.current_checkpoint.is_none());
        let ctx = s.hitl_context.as_ref().unwrap();
        assert!(ctx.approved_at.is_some());
        assert_eq!(ctx.approver_comment.as_deref(), Some("looks good"));
        assert_eq!(s.history().last().unwrap().event, HistoryEvent::HitlApproved);
    }

    #[test]
    fn reject_requires_reason() {
        let mut s = paused_session();
        assert!(matches!(
            s.reject("   "),
            Err(SessionError::EmptyReason { .. })
        ));
        assert_eq!(s.status, SessionStatus::PausedHitl);
        s.reject("wrong approach").unwrap();
        assert_eq!(s.status, SessionStatus::Rejected);
        assert_eq!(
            s.hitl_context.as_ref().unwrap().rejection_reason.as_deref(),
            Some("wrong approach")
        );
    }

    #[test]
    fn repeated_pause_overwrites_checkpoint_and_logs() {
        let mut s = paused_session();
        let before = s.history().len();
        s.pause(Checkpoint::ManualFix, PauseContext::new("fix it"))
            .unwrap();
        assert_eq!(s.current_checkpoint, Some(Checkpoint::ManualFix));
        assert_eq!(s.history().len(), before + 1);
        let last = s.history().last().unwrap();
        assert_eq!(last.detail["replaced"], json!("DESIGN_APPROVAL"));
    }

    #[test]
    fn resume_uses_checkpoint_table() {
        let mut s = paused_session();
        s.approve(None).unwrap();
        assert!(s.resume().unwrap());
        assert_eq!(s.status, SessionStatus::Running);
        assert_eq!(s.current_phase.as_deref(), Some("Coding"));
        // Second resume is a no-op.
        let len = s.history().len();
        assert!(!s.resume().unwrap());
        assert_eq!(s.history().len(), len);
    }

    #[test]
    fn resume_rejected_is_invalid() {
        let mut s = paused_session();
        s.reject("no").unwrap();
        assert!(matches!(s.resume(), Err(SessionError::InvalidState { .. })));
    }

    #[test]
    fn checkpoint_next_phase_table() {
        assert_eq!(Checkpoint::PrdReview.next_phase(), "Planning");
        assert_eq!(Checkpoint::QueryReview.next_phase(), "QueryExecution");
        assert_eq!(Checkpoint::DesignApproval.next_phase(), "Coding");
        assert_eq!(Checkpoint::ManualFix.next_phase(), "Coding");
        assert_eq!(Checkpoint::DeployApproval.next_phase(), "Deploy");
        assert_eq!(Checkpoint::Unrecognized.next_phase(), "Unknown");
    }

    #[test]
    fn unknown_checkpoint_deserializes_as_unrecognized() {
        let cp: Checkpoint = serde_json::from_str("\"SECURITY_SIGNOFF\"").unwrap();
        assert_eq!(cp, Checkpoint::Unrecognized);
        assert!("SECURITY_SIGNOFF".parse::<Checkpoint>().is_err());
        assert_eq!(
            "design-approval".parse::<Checkpoint>().unwrap(),
            Checkpoint::DesignApproval
        );
    }

    #[test]
    fn set_status_refuses_hitl_statuses() {
        let mut s = new_session();
        for target in [
            SessionStatus::Created,
            SessionStatus::PausedHitl,
            SessionStatus::Approved,
            SessionStatus::Rejected,
            SessionStatus::UserInterventionRequired,
        ] {
            assert!(s.set_status(target, None).is_err());
        }
        s.set_status(SessionStatus::Running, Some(json!({"by": "test"})))
            .unwrap();
        let last = s.history().last().unwrap();
        assert_eq!(last.event, HistoryEvent::StatusChanged);
        assert_eq!(last.detail["extra"]["by"], json!("test"));
    }

    #[test]
    fn pending_request_only_when_paused() {
        let s = paused_session();
        let pending = s.pending_request(Utc::now()).unwrap();
        assert_eq!(pending.task_id, "T1");
        assert_eq!(pending.checkpoint, Checkpoint::DesignApproval);
        assert_eq!(pending.phase.as_deref(), Some("Planning"));
        assert!(pending.waiting_secs >= 0);
        assert!(new_session().pending_request(Utc::now()).is_none());
    }

    #[test]
    fn serialized_round_trip_preserves_state() {
        let s = paused_session();
        let json = serde_json::to_string_pretty(&s).unwrap();
        assert!(json.contains("\"taskId\""));
        assert!(json.contains("\"currentCheckpoint\": \"DESIGN_APPROVAL\""));
        let loaded: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.status, s.status);
        assert_eq!(loaded.current_checkpoint, s.current_checkpoint);
        assert_eq!(loaded.history().len(), s.history().len());
    }

    #[test]
    fn exception_approval_flags_context_and_resumes() {
        let mut s = paused_session();
        s.decide(HitlDecision::ExceptionApproval, "ship it once", None)
            .unwrap();
        assert_eq!(s.status, SessionStatus::Approved);
        assert_eq!(s.current_checkpoint, None);
        let ctx = s.hitl_context.as_ref().unwrap();
        assert!(ctx.is_exception);
        assert_eq!(ctx.decision, Some(HitlDecision::ExceptionApproval));
        assert_eq!(ctx.approver_comment.as_deref(), Some("ship it once"));
        assert_eq!(s.history().last().unwrap().event, HistoryEvent::HitlExceptionApproved);
        assert!(s.resume().unwrap());
        assert_eq!(s.current_phase.as_deref(), Some("Coding"));
    }

    #[test]
    fn rule_override_requires_intervention() {
        let mut s = paused_session();
        s.decide(
            HitlDecision::RuleOverride,
            "naming rule is too strict",
            Some(json!({ "rule": "naming", "allow": "camelCase" })),
        )
        .unwrap();
        assert_eq!(s.status, SessionStatus::UserInterventionRequired);
        assert!(!s.is_terminal());
        let request = s
            .hitl_context
            .as_ref()
            .and_then(|ctx| ctx.rule_override_request.clone())
            .unwrap();
        assert!(request.requires_admin_review);
        assert_eq!(request.proposed_change["rule"], json!("naming"));
        assert!(s.pending_request(Utc::now()).is_none());
        assert!(matches!(s.resume(), Err(SessionError::InvalidState { .. })));
    }

    #[test]
    fn reject_for_rework_records_phase() {
        let mut s = paused_session();
        assert!(matches!(
            s.decide(HitlDecision::Reject, " ", None),
            Err(SessionError::EmptyReason { .. })
        ));
        assert_eq!(s.status, SessionStatus::PausedHitl);

        s.decide(HitlDecision::Reject, "wrong schema", None).unwrap();
        assert_eq!(s.status, SessionStatus::Rejected);
        let ctx = s.hitl_context.as_ref().unwrap();
        assert_eq!(ctx.rerun_phase.as_deref(), Some("Planning"));
        assert_eq!(ctx.rejection_reason.as_deref(), Some("wrong schema"));
        let last = s.history().last().unwrap();
        assert_eq!(last.event, HistoryEvent::HitlRejectedForRework);
        assert_eq!(last.detail["phase"], json!("Planning"));
    }

    #[test]
    fn decisions_only_from_paused() {
        let mut s = new_session();
        for decision in [
            HitlDecision::ExceptionApproval,
            HitlDecision::RuleOverride,
            HitlDecision::Reject,
        ] {
            assert!(matches!(
                s.decide(decision, "why", None),
                Err(SessionError::InvalidState { .. })
            ));
        }
    }

    #[test]
    fn decision_names_parse() {
        assert_eq!(
            "exception-approval".parse::<HitlDecision>(),
            Ok(HitlDecision::ExceptionApproval)
        );
        assert_eq!("RULE_OVERRIDE".parse::<HitlDecision>(), Ok(HitlDecision::RuleOverride));
        assert_eq!("reject".parse::<HitlDecision>(), Ok(HitlDecision::Reject));
        assert!("maybe".parse::<HitlDecision>().is_err());
    }

    #[test]
    fn rerun_returns_to_created_from_paused_phase() {
        let mut s = paused_session();
        assert!(s.request_rerun(None).unwrap());
        assert_eq!(s.status, SessionStatus::Created);
        assert_eq!(s.rerun_from.as_deref(), Some("Planning"));
        assert_eq!(s.rerun_count, 1);
        assert_eq!(s.current_checkpoint, None);
        let last = s.history().last().unwrap();
        assert_eq!(last.event, HistoryEvent::RerunRequested);
        assert_eq!(last.detail["rerunCount"], json!(1));

        s.start_phase("Planning").unwrap();
        assert_eq!(s.status, SessionStatus::Running);
    }

    #[test]
    fn rerun_budget_escalates_to_intervention() {
        let mut s = paused_session();
        s.max_reruns = 1;
        assert!(s.request_rerun(Some("Coding")).unwrap());
        assert_eq!(s.rerun_from.as_deref(), Some("Coding"));
        s.start_phase("Coding").unwrap();
        s.pause(Checkpoint::ManualFix, PauseContext::new("still failing"))
            .unwrap();

        assert!(!s.request_rerun(None).unwrap());
        assert_eq!(s.status, SessionStatus::UserInterventionRequired);
        assert_eq!(s.rerun_count, 2);
        assert_eq!(s.history().last().unwrap().event, HistoryEvent::MaxRetriesExceeded);

        // Still over budget, still waiting on an administrator.
        assert!(!s.request_rerun(None).unwrap());
        assert_eq!(s.status, SessionStatus::UserInterventionRequired);
        s.fail("abandoned").unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn rerun_refused_from_terminal_and_running() {
        let mut s = paused_session();
        s.reject("no").unwrap();
        assert!(matches!(s.request_rerun(None), Err(SessionError::InvalidState { .. })));

        let mut running = new_session();
        running.start_phase("Planning").unwrap();
        assert!(matches!(
            running.request_rerun(None),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn records_without_rerun_fields_load_with_defaults() {
        let s = new_session();
        let mut value = serde_json::to_value(&s).unwrap();
        let object = value.as_object_mut().unwrap();
        object.remove("rerunCount");
        object.remove("maxReruns");
        let loaded: Session = serde_json::from_value(value).unwrap();
        assert_eq!(loaded.rerun_count, 0);
        assert_eq!(loaded.max_reruns, DEFAULT_MAX_RERUNS);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let s = new_session();
        let mut value = serde_json::to_value(&s).unwrap();
        value["dashboardColor"] = json!("blue");
        let loaded: Session = serde_json::from_value(value).unwrap();
        assert_eq!(loaded.task_id, "T1");
    }
}
