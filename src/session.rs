//! Session Manager: zero-or-one live wizard session per workspace.
//!
//! Starting a session is a two-phase switch. The new process is spawned
//! first; only once it is running does it become current, and only then is
//! the previous one retired. A failed start leaves the old session untouched.
//!
//! Each session's reader thread feeds the Output Distributor and the Step
//! Detector directly. Output produced before the switch commits is held back
//! and flushed in order at commit time.

use crate::autopilot::SessionLiveness;
use crate::detector::{Phase, StateChannel};
use crate::distributor::{OutputChunk, OutputDistributor};
use crate::error::{EngineError, EngineResult};
use crate::pty::{PtyObserver, PtyProcess, PtySize};
use crate::serializer::{current_timestamp_ms, InputSink};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Process-level settings for new sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub size: PtySize,
    /// Time between SIGTERM and SIGKILL on stop
    pub stop_grace: Duration,
    /// Used when a start request names no directory
    pub default_workdir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            size: PtySize::default(),
            stop_grace: Duration::from_millis(2000),
            default_workdir: PathBuf::from("."),
        }
    }
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        session_id: String,
        command: String,
        workdir: String,
    },
    Exited {
        session_id: String,
        exit_code: i32,
    },
    Stopped {
        session_id: String,
    },
}

/// Reported by `session_status`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionStatus {
    pub running: bool,
    pub session_id: Option<String>,
    pub command: Option<String>,
    pub workdir: Option<String>,
    pub phase: Phase,
    pub exit_code: Option<i32>,
    pub created_at_ms: Option<u64>,
    pub last_activity_ms: Option<u64>,
}

/// State shared between a session's reader thread and the manager
struct SessionShared {
    id: String,
    command: String,
    workdir: PathBuf,
    created_at: u64,
    phase: Mutex<Phase>,
    last_activity: AtomicU64,
    exit_code: Mutex<Option<i32>>,
    /// Cleared once the session is stopped or replaced
    active: AtomicBool,
    exit_reported: AtomicBool,
    seq: AtomicU64,
    /// Output held back until the switch commits; `None` once committed
    pending: Mutex<Option<Vec<Vec<u8>>>>,
    distributor: Arc<OutputDistributor>,
    state: Arc<StateChannel>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionShared {
    fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    fn touch(&self) {
        self.last_activity
            .store(current_timestamp_ms(), Ordering::SeqCst);
    }

    /// Publish one chunk to the distributor and detector
    fn deliver(&self, data: &[u8]) {
        let chunk = OutputChunk {
            session_id: self.id.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: current_timestamp_ms(),
            data: data.to_vec(),
        };
        self.distributor.publish(chunk);

        if let Some(event) = self.state.ingest(data) {
            let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
            if phase.accepts_input() {
                *phase = if event.state.waiting_for_input {
                    Phase::WaitingForInput
                } else {
                    Phase::Running
                };
            }
        }
    }

    /// Make this the session the distributor and detector follow
    fn commit(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let Some(chunks) = pending.take() else {
            return;
        };
        self.distributor.reset(&self.id);
        self.state.session_started();
        for chunk in chunks {
            self.deliver(&chunk);
        }
    }

    fn status(&self) -> SessionStatus {
        let phase = self.phase();
        SessionStatus {
            running: phase.accepts_input(),
            session_id: Some(self.id.clone()),
            command: Some(self.command.clone()),
            workdir: Some(self.workdir.display().to_string()),
            phase,
            exit_code: *self.exit_code.lock().unwrap_or_else(|e| e.into_inner()),
            created_at_ms: Some(self.created_at),
            last_activity_ms: Some(self.last_activity.load(Ordering::SeqCst)),
        }
    }

    /// Record a child exit; returns false if it was already recorded
    fn record_exit(&self, exit_code: i32) -> bool {
        {
            let mut code = self.exit_code.lock().unwrap_or_else(|e| e.into_inner());
            if code.is_some() {
                return false;
            }
            *code = Some(exit_code);
        }
        self.set_phase(if exit_code == 0 {
            Phase::Completed
        } else {
            Phase::Failed
        });
        self.report_exit();
        true
    }

    /// Tell the detector and subscribers about the exit, once, after commit
    fn report_exit(&self) {
        let Some(exit_code) = *self.exit_code.lock().unwrap_or_else(|e| e.into_inner()) else {
            return;
        };
        let committed = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none();
        if !committed || !self.active.load(Ordering::SeqCst) {
            return;
        }
        if self.exit_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.session_ended(exit_code);
        let _ = self.events.send(SessionEvent::Exited {
            session_id: self.id.clone(),
            exit_code,
        });
    }
}

impl PtyObserver for SessionShared {
    fn on_output(&self, data: &[u8]) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        self.touch();

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(chunks) = pending.as_mut() {
            chunks.push(data.to_vec());
            return;
        }
        // Holding the lock keeps delivery ordered with a concurrent commit
        self.deliver(data);
    }

    fn on_exit(&self, exit_code: i32) {
        info!("Session {} exited with code {}", self.id, exit_code);
        self.record_exit(exit_code);
    }
}

struct LiveSession {
    shared: Arc<SessionShared>,
    pty: PtyProcess,
}

pub struct SessionManager {
    config: SessionConfig,
    current: Mutex<Option<Arc<LiveSession>>>,
    distributor: Arc<OutputDistributor>,
    state: Arc<StateChannel>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        distributor: Arc<OutputDistributor>,
        state: Arc<StateChannel>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            current: Mutex::new(None),
            distributor,
            state,
            events,
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<LiveSession>>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn distributor(&self) -> &Arc<OutputDistributor> {
        &self.distributor
    }

    pub fn state(&self) -> &Arc<StateChannel> {
        &self.state
    }

    /// Spawn `command` and make it the current session.
    ///
    /// Returns the new status and the id of the session it replaced, if any.
    pub async fn start(
        &self,
        command: &str,
        workdir: Option<&Path>,
    ) -> EngineResult<(SessionStatus, Option<String>)> {
        let workdir = workdir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.default_workdir.clone());
        let workdir = workdir.canonicalize().map_err(|e| {
            EngineError::Spawn(format!(
                "working directory {} is not usable: {}",
                workdir.display(),
                e
            ))
        })?;

        let now = current_timestamp_ms();
        let shared = Arc::new(SessionShared {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.trim().to_string(),
            workdir: workdir.clone(),
            created_at: now,
            phase: Mutex::new(Phase::Running),
            last_activity: AtomicU64::new(now),
            exit_code: Mutex::new(None),
            active: AtomicBool::new(true),
            exit_reported: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            pending: Mutex::new(Some(Vec::new())),
            distributor: Arc::clone(&self.distributor),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        });

        // Phase one: the new process must be up before anything changes
        let pty = PtyProcess::spawn(
            command,
            &workdir,
            self.config.size,
            Arc::clone(&shared) as Arc<dyn PtyObserver>,
        )?;

        // Phase two: switch, then retire the old session
        let new = Arc::new(LiveSession {
            shared: Arc::clone(&shared),
            pty,
        });
        let old = self.current().replace(Arc::clone(&new));
        let replaced = match old {
            Some(old) => {
                old.shared.active.store(false, Ordering::SeqCst);
                let id = old.shared.id.clone();
                let _ = self.events.send(SessionEvent::Stopped {
                    session_id: id.clone(),
                });
                self.retire(old);
                Some(id)
            }
            None => None,
        };

        shared.commit();
        info!("Session {} started: {}", shared.id, shared.command);
        let _ = self.events.send(SessionEvent::Started {
            session_id: shared.id.clone(),
            command: shared.command.clone(),
            workdir: shared.workdir.display().to_string(),
        });
        // A command that exits immediately may have finished before the switch
        shared.report_exit();

        Ok((self.status(), replaced))
    }

    /// Terminate the replaced session off the async runtime
    fn retire(&self, old: Arc<LiveSession>) {
        let grace = self.config.stop_grace;
        tokio::task::spawn_blocking(move || {
            let id = old.shared.id.clone();
            let code = old.pty.terminate(grace);
            old.shared.set_phase(Phase::Idle);
            debug!("Replaced session {} retired ({:?})", id, code);
        });
    }

    /// Stop the current session and wait for the process to go away.
    ///
    /// Returns `None` when nothing was running.
    pub async fn stop(&self) -> EngineResult<Option<SessionStatus>> {
        let Some(live) = self.current().take() else {
            debug!("Stop requested with no session");
            return Ok(None);
        };

        live.shared.active.store(false, Ordering::SeqCst);
        let grace = self.config.stop_grace;
        let terminated = {
            let live = Arc::clone(&live);
            tokio::task::spawn_blocking(move || live.pty.terminate(grace)).await
        };
        let code = match terminated {
            Ok(code) => code,
            Err(e) => {
                warn!("Terminate task failed: {}", e);
                None
            }
        };

        if let Some(code) = code {
            let mut exit_code = live.shared.exit_code.lock().unwrap_or_else(|e| e.into_inner());
            exit_code.get_or_insert(code);
        }
        live.shared.set_phase(Phase::Idle);
        self.state.session_stopped();
        let _ = self.events.send(SessionEvent::Stopped {
            session_id: live.shared.id.clone(),
        });
        info!("Session {} stopped", live.shared.id);

        Ok(Some(live.shared.status()))
    }

    /// Status of the current (or most recently exited) session.
    ///
    /// A child that died without the reader noticing is reaped here, so a
    /// dead process is never reported as running.
    pub fn status(&self) -> SessionStatus {
        let live = self.current().clone();
        let Some(live) = live else {
            return SessionStatus::default();
        };

        if live.shared.phase().accepts_input() && !live.pty.is_running() {
            if let Some(code) = live.pty.exit_code() {
                warn!(
                    "Session {} was dead but reported running, healing",
                    live.shared.id
                );
                live.shared.record_exit(code);
            }
        }
        live.shared.status()
    }

    pub fn current_id(&self) -> Option<String> {
        self.current().as_ref().map(|live| live.shared.id.clone())
    }

    /// Whether a session currently accepts input
    pub fn is_running(&self) -> bool {
        self.status().running
    }

    pub fn resize(&self, size: PtySize) -> EngineResult<()> {
        let live = self.current().clone();
        match live {
            Some(live) if live.shared.phase().accepts_input() => live.pty.resize(size),
            _ => Err(EngineError::SessionNotRunning),
        }
    }
}

impl InputSink for SessionManager {
    fn write_input(&self, data: &[u8]) -> EngineResult<()> {
        let live = self.current().clone();
        let Some(live) = live else {
            return Err(EngineError::SessionNotRunning);
        };
        if !live.shared.phase().accepts_input() {
            return Err(EngineError::SessionNotRunning);
        }
        // Before the write, so the reply to this input is seen as a change
        if self.state.input_sent().is_some() {
            let mut phase = live.shared.phase.lock().unwrap_or_else(|e| e.into_inner());
            if *phase == Phase::WaitingForInput {
                *phase = Phase::Running;
            }
        }
        live.pty.write_all(data)?;
        live.shared.touch();
        Ok(())
    }
}

impl SessionLiveness for SessionManager {
    fn is_running(&self) -> bool {
        SessionManager::is_running(self)
    }
}
