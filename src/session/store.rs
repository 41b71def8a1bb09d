//! Durable, per-task serialized session storage.
//!
//! Each session lives in `<dir>/<taskId>.json`. Mutations on one task are
//! serialized twice over: an in-process mutex per task id, then an exclusive
//! `fs2` lock on `<dir>/<taskId>.lock` so a CLI invocation and a running
//! reviewer service cannot interleave writes. Records are replaced with a
//! temp-file + rename so readers never see a torn file.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::Utc;
use fs2::FileExt;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{
    Checkpoint, DEFAULT_MAX_RERUNS, FeedbackRecord, HitlDecision, PauseContext, PendingRequest,
    Session, SessionStatus, validate_task_id,
};
use crate::errors::SessionError;

type Result<T> = std::result::Result<T, SessionError>;

pub struct SessionStore {
    dir: PathBuf,
    feedback_dir: PathBuf,
    max_reruns: u32,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Holds both the in-process and the cross-process lock for one task.
struct TaskGuard<'a> {
    _local: std::sync::MutexGuard<'a, ()>,
    file: File,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = %e, "failed to release session lock file");
        }
    }
}

impl SessionStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create session directory: {}", dir.display()))?;
        Ok(Self {
            feedback_dir: dir.join("feedback"),
            dir,
            max_reruns: DEFAULT_MAX_RERUNS,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Where [`save_feedback`](Self::save_feedback) writes its records.
    pub fn with_feedback_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.feedback_dir = dir.into();
        self
    }

    /// Rerun budget stamped on sessions created from now on.
    pub fn with_max_reruns(mut self, max_reruns: u32) -> Self {
        self.max_reruns = max_reruns;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    fn task_mutex(&self, task_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(|_| SessionError::LockPoisoned)?;
        Ok(locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    fn lock_file(&self, task_id: &str) -> Result<File> {
        let path = self.dir.join(format!("{}.lock", task_id));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))
            .map_err(|e| SessionError::storage(task_id, e))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))
            .map_err(|e| SessionError::storage(task_id, e))?;
        Ok(file)
    }

    /// Forget the mutex for `task_id` once nobody else holds or awaits it.
    fn release_mutex(&self, task_id: &str, mutex: &Arc<Mutex<()>>) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        // Clones are only handed out under the map lock, so two owners
        // (the map and `mutex`) means no other caller can still use it.
        if Arc::strong_count(mutex) == 2 {
            locks.remove(task_id);
        }
    }

    /// Run `f` while holding both locks for `task_id`.
    fn locked<T>(&self, task_id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        validate_task_id(task_id)?;
        let mutex = self.task_mutex(task_id)?;
        let result = (|| -> Result<T> {
            let local = mutex.lock().map_err(|_| SessionError::LockPoisoned)?;
            let file = self.lock_file(task_id)?;
            let _guard = TaskGuard {
                _local: local,
                file,
            };
            f()
        })();
        self.release_mutex(task_id, &mutex);
        result
    }

    fn read(&self, task_id: &str) -> Result<Option<Session>> {
        let path = self.session_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read session file: {}", path.display()))
            .map_err(|e| SessionError::storage(task_id, e))?;
        let session = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse session file: {}", path.display()))
            .map_err(|e| SessionError::storage(task_id, e))?;
        Ok(Some(session))
    }

    fn write(&self, session: &Session) -> Result<()> {
        let task_id = session.task_id.as_str();
        let path = self.session_path(task_id);
        let tmp = self.dir.join(format!("{}.json.tmp", task_id));
        let write = || -> anyhow::Result<()> {
            let content = serde_json::to_string_pretty(session)?;
            let mut file = File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
                .with_context(|| format!("Failed to replace {}", path.display()))?;
            Ok(())
        };
        write().map_err(|e| SessionError::storage(task_id, e))
    }

    /// Load, mutate and persist one session under its lock.
    fn mutate(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut Session) -> Result<()>,
    ) -> Result<Session> {
        self.locked(task_id, || {
            let mut session = self.read(task_id)?.ok_or_else(|| SessionError::NotFound {
                task_id: task_id.to_string(),
            })?;
            f(&mut session)?;
            self.write(&session)?;
            Ok(session)
        })
    }

    /// Create a session. Fails with `DuplicateTask` while a live one exists;
    /// a terminal session under the same id is replaced by a fresh lifecycle.
    pub fn create(
        &self,
        task_id: &str,
        request_ref: &str,
        metadata: Map<String, Value>,
    ) -> Result<Session> {
        self.locked(task_id, || {
            if let Some(existing) = self.read(task_id)? {
                if !existing.is_terminal() {
                    return Err(SessionError::DuplicateTask {
                        task_id: task_id.to_string(),
                        status: existing.status.to_string(),
                    });
                }
                info!(task_id, previous = %existing.status, "replacing terminal session");
            }
            let mut session = Session::new(task_id, request_ref, metadata)?;
            session.max_reruns = self.max_reruns;
            self.write(&session)?;
            info!(task_id, request_ref, "session created");
            Ok(session)
        })
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Session>> {
        validate_task_id(task_id)?;
        self.read(task_id)
    }

    /// Like [`get`](Self::get) but an absent session is `NotFound`.
    pub fn require(&self, task_id: &str) -> Result<Session> {
        self.get(task_id)?.ok_or_else(|| SessionError::NotFound {
            task_id: task_id.to_string(),
        })
    }

    pub fn update_status(
        &self,
        task_id: &str,
        status: SessionStatus,
        extra: Option<Value>,
    ) -> Result<Session> {
        let session = self.mutate(task_id, |s| s.set_status(status, extra))?;
        debug!(task_id, %status, "status updated");
        Ok(session)
    }

    pub fn update_phase(&self, task_id: &str, phase: &str) -> Result<Session> {
        let session = self.mutate(task_id, |s| s.start_phase(phase))?;
        info!(task_id, phase, "phase started");
        Ok(session)
    }

    pub fn pause_for_hitl(
        &self,
        task_id: &str,
        checkpoint: Checkpoint,
        context: PauseContext,
    ) -> Result<Session> {
        let session = self.mutate(task_id, |s| {
            if let (SessionStatus::PausedHitl, Some(previous)) = (s.status, s.current_checkpoint) {
                if previous != checkpoint {
                    warn!(
                        task_id,
                        %previous,
                        %checkpoint,
                        "overwriting pending checkpoint"
                    );
                }
            }
            s.pause(checkpoint, context)
        })?;
        info!(task_id, %checkpoint, "paused for human review");
        Ok(session)
    }

    /// Approve the pending checkpoint. Because the pending queue is derived
    /// from session records, the task leaves the queue in the same write.
    pub fn approve(&self, task_id: &str, comment: Option<&str>) -> Result<Session> {
        let session = self.mutate(task_id, |s| s.approve(comment))?;
        info!(task_id, "checkpoint approved");
        Ok(session)
    }

    pub fn reject(&self, task_id: &str, reason: &str) -> Result<Session> {
        let session = self.mutate(task_id, |s| s.reject(reason))?;
        info!(task_id, reason, "checkpoint rejected");
        Ok(session)
    }

    /// Settle a paused checkpoint with a three-way reviewer decision. Like
    /// [`approve`](Self::approve), the task leaves the pending queue in the
    /// same write.
    pub fn decide(
        &self,
        task_id: &str,
        decision: HitlDecision,
        comment: &str,
        rule_override: Option<Value>,
    ) -> Result<Session> {
        let session = self.mutate(task_id, |s| s.decide(decision, comment, rule_override))?;
        info!(task_id, %decision, status = %session.status, "reviewer decision recorded");
        Ok(session)
    }

    /// Send a session back for another run. A session over its rerun budget
    /// comes back in `USER_INTERVENTION_REQUIRED`, which is not an error.
    pub fn request_rerun(&self, task_id: &str, from_phase: Option<&str>) -> Result<Session> {
        let session = self.mutate(task_id, |s| s.request_rerun(from_phase).map(|_| ()))?;
        if session.status == SessionStatus::UserInterventionRequired {
            warn!(
                task_id,
                reruns = session.rerun_count,
                max = session.max_reruns,
                "rerun budget exhausted, user intervention required"
            );
        } else {
            info!(
                task_id,
                from = session.rerun_from.as_deref().unwrap_or("-"),
                reruns = session.rerun_count,
                "rerun requested"
            );
        }
        Ok(session)
    }

    /// Store reviewer feedback as `<feedback dir>/<taskId>_<millis>.json`
    /// and note it in the session history.
    pub fn save_feedback(&self, task_id: &str, feedback: &str) -> Result<FeedbackRecord> {
        self.locked(task_id, || {
            let mut session = self.read(task_id)?.ok_or_else(|| SessionError::NotFound {
                task_id: task_id.to_string(),
            })?;
            let created_at = Utc::now();
            let stamp = created_at.timestamp_millis();
            let mut path = self.feedback_dir.join(format!("{}_{}.json", task_id, stamp));
            let mut n = 1;
            while path.exists() {
                path = self
                    .feedback_dir
                    .join(format!("{}_{}-{}.json", task_id, stamp, n));
                n += 1;
            }
            let record = FeedbackRecord {
                task_id: task_id.to_string(),
                feedback: feedback.to_string(),
                created_at,
                path,
            };
            let write = || -> anyhow::Result<()> {
                fs::create_dir_all(&self.feedback_dir).with_context(|| {
                    format!("Failed to create {}", self.feedback_dir.display())
                })?;
                let content = serde_json::to_string_pretty(&record)?;
                fs::write(&record.path, content)
                    .with_context(|| format!("Failed to write {}", record.path.display()))?;
                Ok(())
            };
            write().map_err(|e| SessionError::storage(task_id, e))?;
            session.record_feedback(&record);
            self.write(&session)?;
            info!(task_id, path = %record.path.display(), "feedback saved");
            Ok(record)
        })
    }

    /// Move an approved session back to `RUNNING`. Already running is a no-op.
    pub fn resume(&self, task_id: &str) -> Result<Session> {
        self.locked(task_id, || {
            let mut session = self.read(task_id)?.ok_or_else(|| SessionError::NotFound {
                task_id: task_id.to_string(),
            })?;
            if session.resume()? {
                self.write(&session)?;
                info!(
                    task_id,
                    phase = session.current_phase.as_deref().unwrap_or("Unknown"),
                    "session resumed"
                );
            } else {
                debug!(task_id, "resume ignored, session already running");
            }
            Ok(session)
        })
    }

    pub fn complete(&self, task_id: &str, summary: Value) -> Result<Session> {
        let session = self.mutate(task_id, |s| s.complete(summary))?;
        info!(task_id, "session completed");
        Ok(session)
    }

    pub fn fail(&self, task_id: &str, error: &str) -> Result<Session> {
        let session = self.mutate(task_id, |s| s.fail(error))?;
        warn!(task_id, error, "session failed");
        Ok(session)
    }

    /// Every readable session in the store, ordered by task id.
    pub fn list(&self) -> anyhow::Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {}", self.dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable session");
                    continue;
                }
            };
            match serde_json::from_str::<Session>(&content) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed session");
                }
            }
        }
        sessions.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(sessions)
    }

    /// The reviewer queue: every session currently paused, oldest first.
    pub fn pending_requests(&self) -> anyhow::Result<Vec<PendingRequest>> {
        let now = Utc::now();
        let mut pending: Vec<_> = self
            .list()?
            .iter()
            .filter_map(|s| s.pending_request(now))
            .collect();
        pending.sort_by_key(|p| p.paused_at);
        Ok(pending)
    }

    /// Sessions that have not reached a terminal status.
    pub fn list_active(&self) -> anyhow::Result<Vec<Session>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect())
    }
}
