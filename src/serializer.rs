//! Execution serializer: the single gate in front of the session input.
//!
//! Exactly one writer (human, wizard autopilot or plan executor) may hold
//! the token at a time, and only for the duration of one write. Ad hoc
//! writers are refused with `ExecutionLockBusy`; plan steps queue behind the
//! current holder instead.

use crate::error::{EngineError, EngineResult};
use crate::redact::Redact;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// How many completed writes are kept for inspection
const JOURNAL_CAPACITY: usize = 256;

/// Identity of a writer competing for the session input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Writer {
    Human,
    WizardAutopilot,
    PlanExecutor,
}

impl Writer {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::WizardAutopilot => "wizard_autopilot",
            Self::PlanExecutor => "plan_executor",
        }
    }
}

impl fmt::Display for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of serialized writes (the live session)
pub trait InputSink: Send + Sync {
    fn write_input(&self, data: &[u8]) -> EngineResult<()>;
}

/// A completed write, as recorded in the journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRecord {
    pub seq: u64,
    pub writer: Writer,
    /// Redacted, printable rendering of the payload
    pub preview: String,
    pub bytes: usize,
    pub timestamp: u64,
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<Writer>,
    /// Bumped on every acquire and forced release so stale guards are inert
    generation: u64,
}

/// Exclusive write token. Released on drop.
pub struct ExecutionGuard<'a> {
    serializer: &'a ExecutionSerializer,
    writer: Writer,
    generation: u64,
}

impl ExecutionGuard<'_> {
    pub fn writer(&self) -> Writer {
        self.writer
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.serializer.lock_state();
        if state.generation == self.generation && state.holder == Some(self.writer) {
            state.holder = None;
            drop(state);
            debug!("Execution lock released by {}", self.writer);
            self.serializer.released.notify_waiters();
        }
    }
}

pub struct ExecutionSerializer {
    state: Mutex<LockState>,
    released: Notify,
    sink: Arc<dyn InputSink>,
    redactor: Arc<dyn Redact>,
    journal: Mutex<VecDeque<WriteRecord>>,
    next_seq: Mutex<u64>,
}

impl ExecutionSerializer {
    pub fn new(sink: Arc<dyn InputSink>, redactor: Arc<dyn Redact>) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Notify::new(),
            sink,
            redactor,
            journal: Mutex::new(VecDeque::with_capacity(JOURNAL_CAPACITY)),
            next_seq: Mutex::new(0),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current holder, if any
    pub fn holder(&self) -> Option<Writer> {
        self.lock_state().holder
    }

    /// Take the token or fail immediately
    pub fn try_acquire(&self, writer: Writer) -> EngineResult<ExecutionGuard<'_>> {
        let mut state = self.lock_state();
        if let Some(holder) = state.holder {
            return Err(EngineError::ExecutionLockBusy { holder });
        }
        state.holder = Some(writer);
        state.generation += 1;
        debug!("Execution lock acquired by {}", writer);
        Ok(ExecutionGuard {
            serializer: self,
            writer,
            generation: state.generation,
        })
    }

    /// Wait until the token is free, then take it
    pub async fn acquire(&self, writer: Writer) -> ExecutionGuard<'_> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_acquire(writer) {
                Ok(guard) => return guard,
                Err(_) => notified.await,
            }
        }
    }

    /// Revoke the token regardless of who holds it (session stop)
    pub fn force_release(&self) {
        let mut state = self.lock_state();
        if let Some(holder) = state.holder.take() {
            warn!("Execution lock forcibly released from {}", holder);
        }
        state.generation += 1;
        drop(state);
        self.released.notify_waiters();
    }

    /// Perform one write under a held guard
    pub fn write(&self, guard: &ExecutionGuard<'_>, data: &[u8]) -> EngineResult<WriteRecord> {
        {
            let state = self.lock_state();
            if state.generation != guard.generation || state.holder != Some(guard.writer) {
                // Token was revoked by a session stop
                return Err(EngineError::SessionNotRunning);
            }
        }

        self.sink.write_input(data)?;

        let record = WriteRecord {
            seq: self.bump_seq(),
            writer: guard.writer,
            preview: self.redactor.redact(&printable(data)),
            bytes: data.len(),
            timestamp: current_timestamp_ms(),
        };
        debug!(
            "Write #{} by {}: {} bytes",
            record.seq, record.writer, record.bytes
        );

        let mut journal = self.journal.lock().unwrap_or_else(|e| e.into_inner());
        if journal.len() == JOURNAL_CAPACITY {
            journal.pop_front();
        }
        journal.push_back(record.clone());
        Ok(record)
    }

    /// Acquire without waiting, write, release
    pub fn try_write(&self, writer: Writer, data: &[u8]) -> EngineResult<WriteRecord> {
        let guard = self.try_acquire(writer)?;
        self.write(&guard, data)
    }

    /// Queue for the token, write, release
    pub async fn write_queued(&self, writer: Writer, data: &[u8]) -> EngineResult<WriteRecord> {
        let guard = self.acquire(writer).await;
        self.write(&guard, data)
    }

    /// Most recent writes, oldest first
    pub fn journal(&self, limit: usize) -> Vec<WriteRecord> {
        let journal = self.journal.lock().unwrap_or_else(|e| e.into_inner());
        let skip = journal.len().saturating_sub(limit);
        journal.iter().skip(skip).cloned().collect()
    }

    fn bump_seq(&self) -> u64 {
        let mut seq = self.next_seq.lock().unwrap_or_else(|e| e.into_inner());
        *seq += 1;
        *seq
    }
}

/// Render control bytes visibly for the journal
fn printable(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .chars()
        .map(|c| match c {
            '\r' => "⏎".to_string(),
            '\n' => "↵".to_string(),
            c if (c as u32) < 0x20 || c == '\x7f' => format!("^{}", ((c as u8) ^ 0x40) as char),
            c if c.is_control() => format!("\\u{{{:x}}}", c as u32),
            c => c.to_string(),
        })
        .collect()
}

/// Get current timestamp in milliseconds
pub(crate) fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
