//! The single run record shared between the orchestrator (writer) and any
//! observing UI (readers).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::PendingPlan;

pub const LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Ready,
    PlanningRun,
    AwaitingPlanApproval,
    StartingRun,
    Running,
    ReadingBrowser,
    Planning,
    ExecutingAction,
    VerifyingAction,
    Completed,
    Stopped,
    Failed,
    PausedMaxSteps,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Stopped | RunStatus::Failed | RunStatus::PausedMaxSteps
        )
    }

    /// Statuses only reachable while a loop is live.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunStatus::PlanningRun
                | RunStatus::StartingRun
                | RunStatus::Running
                | RunStatus::ReadingBrowser
                | RunStatus::Planning
                | RunStatus::ExecutingAction
                | RunStatus::VerifyingAction
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        f.write_str(&text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Plan,
    Observation,
    Decision,
    Execution,
    Verification,
    Done,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub at: DateTime<Utc>,
    pub kind: LogKind,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

/// Fixed-capacity ring of log entries; the oldest entry is evicted on push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<LogEntry>", into = "Vec<LogEntry>")]
pub struct LogRing {
    entries: VecDeque<LogEntry>,
}

impl LogRing {
    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self {
            entries: VecDeque::with_capacity(LOG_CAPACITY),
        }
    }
}

impl From<Vec<LogEntry>> for LogRing {
    fn from(entries: Vec<LogEntry>) -> Self {
        let mut ring = LogRing::default();
        for entry in entries {
            ring.push(entry);
        }
        ring
    }
}

impl From<LogRing> for Vec<LogEntry> {
    fn from(ring: LogRing) -> Self {
        ring.entries.into()
    }
}

/// The one global run record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeState {
    pub is_running: bool,
    pub cancel_requested: bool,
    pub session_id: Option<String>,
    pub tab_id: Option<String>,
    pub tab_group_id: Option<String>,
    pub goal: Option<String>,
    pub step: u32,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_result: Option<Value>,
    pub pending_plan: Option<PendingPlan>,
    pub logs: LogRing,
}

struct StoreInner {
    state: RuntimeState,
    next_log_id: u64,
    version: u64,
}

/// Owns the [`RuntimeState`]. Every mutation is broadcast in mutation order
/// and handed to the state writer (when a path is configured); both are
/// best-effort.
pub struct RuntimeStore {
    inner: Mutex<StoreInner>,
    tx: broadcast::Sender<RuntimeState>,
    writer: Option<Arc<StateWriter>>,
}

impl RuntimeStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        let state = path
            .as_deref()
            .and_then(load_state)
            .map(recover_after_restart)
            .unwrap_or_default();
        let next_log_id = state.logs.last().map(|e| e.id + 1).unwrap_or(1);
        let (tx, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(StoreInner {
                state,
                next_log_id,
                version: 0,
            }),
            tx,
            writer: path.map(|path| Arc::new(StateWriter::new(path))),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn snapshot(&self) -> RuntimeState {
        self.inner.lock().state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeState> {
        self.tx.subscribe()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut RuntimeState) -> R) -> R {
        let out = {
            let mut inner = self.inner.lock();
            let out = f(&mut inner.state);
            self.publish_locked(&mut inner);
            out
        };
        self.schedule_write();
        out
    }

    /// Appends to the run log and mirrors the entry to `tracing`.
    pub fn log(&self, kind: LogKind, message: impl Into<String>, data: Value) {
        let message = message.into();
        match kind {
            LogKind::Error => warn!(kind = ?kind, "{}", message),
            LogKind::Warning => warn!(kind = ?kind, "{}", message),
            LogKind::Observation => debug!(kind = ?kind, "{}", message),
            _ => info!(kind = ?kind, "{}", message),
        }
        {
            let mut inner = self.inner.lock();
            let id = inner.next_log_id;
            inner.next_log_id += 1;
            inner.state.logs.push(LogEntry {
                id,
                at: Utc::now(),
                kind,
                message,
                data,
            });
            self.publish_locked(&mut inner);
        }
        self.schedule_write();
    }

    /// Writes the newest state to disk on the calling thread.
    pub fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush();
        }
    }

    // Runs under the state lock so subscribers and the writer see versions
    // in mutation order.
    fn publish_locked(&self, inner: &mut StoreInner) {
        inner.version += 1;
        if let Some(writer) = &self.writer {
            writer.offer(inner.version, inner.state.clone());
        }
        // No listeners is fine.
        let _ = self.tx.send(inner.state.clone());
    }

    fn schedule_write(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let writer = writer.clone();
                handle.spawn_blocking(move || writer.flush());
            }
            Err(_) => writer.flush(),
        }
    }
}

impl Drop for RuntimeStore {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Coalescing file writer. Only the newest offered snapshot is kept, one
/// write runs at a time, and a version at or below the one on disk is
/// dropped.
struct StateWriter {
    path: PathBuf,
    pending: Mutex<Option<(u64, RuntimeState)>>,
    written: Mutex<u64>,
}

impl StateWriter {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            pending: Mutex::new(None),
            written: Mutex::new(0),
        }
    }

    fn offer(&self, version: u64, state: RuntimeState) {
        let mut pending = self.pending.lock();
        if pending.as_ref().map_or(true, |(v, _)| *v < version) {
            *pending = Some((version, state));
        }
    }

    fn flush(&self) {
        let mut written = self.written.lock();
        let Some((version, state)) = self.pending.lock().take() else {
            return;
        };
        if version <= *written {
            return;
        }
        match save_state(&self.path, &state) {
            Ok(()) => *written = version,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to persist runtime state")
            }
        }
    }
}

fn load_state(path: &Path) -> Option<RuntimeState> {
    let file = std::fs::File::open(path).ok()?;
    match serde_json::from_reader(std::io::BufReader::new(file)) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable runtime state");
            None
        }
    }
}

fn save_state(path: &Path, state: &RuntimeState) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    let writer = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
    serde_json::to_writer_pretty(writer, state)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// A loaded state can't belong to a live loop: this process just started.
fn recover_after_restart(mut state: RuntimeState) -> RuntimeState {
    if state.is_running || state.status.is_active() {
        state.status = RunStatus::Failed;
        state.last_error = Some("run interrupted by agent restart".to_string());
        state.ended_at = Some(Utc::now());
    }
    state.is_running = false;
    state.cancel_requested = false;
    state
}

/// Single-slot guard enforcing at most one active run.
#[derive(Debug, Default)]
pub struct RunSlot {
    busy: AtomicBool,
}

impl RunSlot {
    pub fn try_acquire(self: &Arc<Self>) -> Option<RunLease> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunLease { slot: self.clone() })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the slot when dropped.
#[derive(Debug)]
pub struct RunLease {
    slot: Arc<RunSlot>,
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

/// Pairs the run slot with the cancellation token of the run holding it.
/// Acquiring and stopping share one lock, so a stop that finds the slot
/// busy always reaches the token of the run that owns it.
#[derive(Debug, Default)]
pub struct RunControl {
    slot: Arc<RunSlot>,
    cancel: Mutex<CancellationToken>,
}

impl RunControl {
    pub fn begin(&self) -> Option<(RunLease, CancellationToken)> {
        let mut current = self.cancel.lock();
        let lease = self.slot.try_acquire()?;
        let token = CancellationToken::new();
        *current = token.clone();
        Some((lease, token))
    }

    /// Cancels the active run's token; `false` when nothing is running.
    pub fn stop(&self) -> bool {
        let current = self.cancel.lock();
        if !self.slot.is_busy() {
            return false;
        }
        current.cancel();
        true
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_busy()
    }
}
