//! Autopilot Controller.
//!
//! Two automation paths share one safety contract:
//! - **wizard**: answers detected prompts with conservative defaults
//! - **plan executor**: runs approved plans step by step
//!
//! Both route every write through the [`ExecutionSerializer`] and every
//! candidate input through the policy engine. Neither writes while the
//! detector reports an error.

use crate::detector::{Confidence, Phase, PromptKind, StateChannel, StateEvent, StateSnapshot};
use crate::plan::{PlanManager, PlanStatus};
use crate::policy;
use crate::redact::Redact;
use crate::serializer::{current_timestamp_ms, ExecutionSerializer, Writer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Words that make a prompt unsafe to accept
const DESTRUCTIVE_KEYWORDS: &[&str] = &[
    "delete",
    "destroy",
    "remove",
    "overwrite",
    "drop",
    "purge",
    "wipe",
    "erase",
    "reset",
    "force",
    "uninstall",
];

/// Words that mean a free-text prompt wants a credential
const SECRET_KEYWORDS: &[&str] = &["password", "passphrase", "token", "api key", "apikey", "secret"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutopilotMode {
    #[default]
    Off,
    Wizard,
    PlanAuto,
}

impl AutopilotMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Wizard => "wizard",
            Self::PlanAuto => "plan_auto",
        }
    }
}

impl fmt::Display for AutopilotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer used for yes/no prompts that indicate no default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YesNoAnswer {
    Yes,
    #[default]
    No,
}

impl YesNoAnswer {
    pub const fn as_input(&self) -> &'static str {
        match self {
            Self::Yes => "y",
            Self::No => "n",
        }
    }
}

impl FromStr for YesNoAnswer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Ok(Self::Yes),
            "n" | "no" => Ok(Self::No),
            other => Err(format!("expected y or n, got {other:?}")),
        }
    }
}

/// What the operator configured the autopilot to be allowed to do
#[derive(Debug, Clone)]
pub struct AutopilotLimits {
    pub allow_wizard: bool,
    pub allow_plan_auto: bool,
    pub yes_no_fallback: YesNoAnswer,
}

impl Default for AutopilotLimits {
    fn default() -> Self {
        Self {
            allow_wizard: true,
            allow_plan_auto: true,
            yes_no_fallback: YesNoAnswer::No,
        }
    }
}

/// Outcome of looking at one detector snapshot in wizard mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WizardDecision {
    /// Nothing is being asked
    Wait,
    /// Type `input` followed by ENTER
    Send { input: String, reason: String },
    /// Leave the prompt to the human
    Hold { reason: String },
    /// The session is in an error state; automation must stop
    Halt { reason: String },
}

fn contains_keyword(text: &str, keywords: &[&str]) -> bool {
    let lower = text.to_lowercase();
    keywords.iter().any(|k| lower.contains(k))
}

/// Pick a conservative answer for the prompt described by `state`.
///
/// `last_answered` is the prompt the autopilot answered most recently; a
/// prompt that comes straight back is left to the human.
pub fn decide_wizard_input(
    state: &StateSnapshot,
    limits: &AutopilotLimits,
    last_answered: Option<&str>,
) -> WizardDecision {
    if let Some(error) = &state.last_error {
        return WizardDecision::Halt {
            reason: format!("error detected: {error}"),
        };
    }
    if state.phase == Phase::Failed {
        return WizardDecision::Halt {
            reason: "session failed".to_string(),
        };
    }
    if !state.waiting_for_input || state.phase != Phase::WaitingForInput {
        return WizardDecision::Wait;
    }
    if last_answered == Some(state.prompt.as_str()) {
        return WizardDecision::Hold {
            reason: format!("prompt repeated after an automatic answer: {}", state.prompt),
        };
    }

    match state.kind {
        Some(PromptKind::YesNo) => {
            if contains_keyword(&state.prompt, DESTRUCTIVE_KEYWORDS) {
                return WizardDecision::Send {
                    input: "n".to_string(),
                    reason: "destructive question, declining".to_string(),
                };
            }
            match state.default_choice.as_deref().map(str::to_ascii_lowercase) {
                Some(d) if d.starts_with('y') => WizardDecision::Send {
                    input: "y".to_string(),
                    reason: "accepting the indicated default".to_string(),
                },
                Some(d) if d.starts_with('n') => WizardDecision::Send {
                    input: "n".to_string(),
                    reason: "accepting the indicated default".to_string(),
                },
                _ => WizardDecision::Send {
                    input: limits.yes_no_fallback.as_input().to_string(),
                    reason: "no default indicated, using the configured answer".to_string(),
                },
            }
        }
        Some(PromptKind::NumericChoice) => {
            let Some(key) = state.default_choice.as_deref() else {
                return WizardDecision::Hold {
                    reason: "menu has no single default".to_string(),
                };
            };
            match state.options.iter().find(|o| o.key == key) {
                Some(option) if contains_keyword(&option.label, DESTRUCTIVE_KEYWORDS) => {
                    WizardDecision::Hold {
                        reason: format!("default option `{}` looks destructive", option.label),
                    }
                }
                Some(option) => WizardDecision::Send {
                    input: option.key.clone(),
                    reason: format!("selecting default option `{}`", option.label),
                },
                None => WizardDecision::Hold {
                    reason: "default option is not in the menu".to_string(),
                },
            }
        }
        Some(PromptKind::FreeText) => {
            if state.confidence.unwrap_or(Confidence::Low) < Confidence::Medium {
                return WizardDecision::Hold {
                    reason: "output stopped but no prompt was recognised".to_string(),
                };
            }
            if contains_keyword(&state.prompt, SECRET_KEYWORDS) {
                return WizardDecision::Hold {
                    reason: "prompt asks for a secret".to_string(),
                };
            }
            WizardDecision::Send {
                input: String::new(),
                reason: "pressing ENTER to accept the default".to_string(),
            }
        }
        _ => WizardDecision::Hold {
            reason: "prompt shape not recognised".to_string(),
        },
    }
}

/// Readiness of the session the autopilot drives
pub trait SessionLiveness: Send + Sync {
    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutopilotEventKind {
    Started,
    Stopped,
    WaitingForSession,
    SentInput,
    Paused,
    ErrorDetected,
    Completed,
    PlanStarted,
    PlanStepSent,
    PlanCompleted,
    PlanFailed,
}

/// Why the autopilot did or did not act
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutopilotEvent {
    pub seq: u64,
    pub timestamp: u64,
    pub kind: AutopilotEventKind,
    pub mode: AutopilotMode,
    pub message: String,
    /// Redacted input that was sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
}

/// Reported by `set_autopilot` and `state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutopilotState {
    pub mode: AutopilotMode,
    pub last_decision: Option<String>,
    /// Always true: automation halts on any detected error
    pub stop_on_error: bool,
    pub allowed_modes: Vec<AutopilotMode>,
}

#[derive(Default)]
struct Inner {
    mode: AutopilotMode,
    last_decision: Option<String>,
    last_answered: Option<String>,
    error_reported: bool,
}

pub struct AutopilotController {
    limits: AutopilotLimits,
    inner: Mutex<Inner>,
    serializer: Arc<ExecutionSerializer>,
    state: Arc<StateChannel>,
    plans: Arc<PlanManager>,
    liveness: Arc<dyn SessionLiveness>,
    redactor: Arc<dyn Redact>,
    events: broadcast::Sender<AutopilotEvent>,
    seq: AtomicU64,
}

impl AutopilotController {
    pub fn new(
        limits: AutopilotLimits,
        serializer: Arc<ExecutionSerializer>,
        state: Arc<StateChannel>,
        plans: Arc<PlanManager>,
        liveness: Arc<dyn SessionLiveness>,
        redactor: Arc<dyn Redact>,
    ) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            limits,
            inner: Mutex::new(Inner::default()),
            serializer,
            state,
            plans,
            liveness,
            redactor,
            events,
            seq: AtomicU64::new(0),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutopilotEvent> {
        self.events.subscribe()
    }

    pub fn mode(&self) -> AutopilotMode {
        self.inner().mode
    }

    /// Whether valid plans skip human approval
    pub fn auto_approve_plans(&self) -> bool {
        self.mode() == AutopilotMode::PlanAuto
    }

    pub fn snapshot(&self) -> AutopilotState {
        let inner = self.inner();
        let mut allowed_modes = vec![AutopilotMode::Off];
        if self.limits.allow_wizard {
            allowed_modes.push(AutopilotMode::Wizard);
        }
        if self.limits.allow_plan_auto {
            allowed_modes.push(AutopilotMode::PlanAuto);
        }
        AutopilotState {
            mode: inner.mode,
            last_decision: inner.last_decision.clone(),
            stop_on_error: true,
            allowed_modes,
        }
    }

    fn emit(
        &self,
        kind: AutopilotEventKind,
        message: impl Into<String>,
        input: Option<&str>,
        plan_id: Option<&str>,
    ) {
        let event = AutopilotEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: current_timestamp_ms(),
            kind,
            mode: self.mode(),
            message: self.redactor.redact(&message.into()),
            input: input.map(|i| self.redactor.redact(i)),
            plan_id: plan_id.map(str::to_string),
        };
        info!("Autopilot {:?}: {}", event.kind, event.message);
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn decided(&self, reason: &str) {
        self.inner().last_decision = Some(self.redactor.redact(reason));
    }

    /// Switch modes. Returns the effective state, which never exceeds the
    /// configured limits and is `off` while no session is running.
    pub fn set_mode(&self, requested: AutopilotMode) -> AutopilotState {
        let refused = match requested {
            AutopilotMode::Wizard if !self.limits.allow_wizard => {
                Some("wizard autopilot is not enabled")
            }
            AutopilotMode::PlanAuto if !self.limits.allow_plan_auto => {
                Some("plan auto-execution is not enabled")
            }
            _ => None,
        };

        let previous = self.mode();
        if let Some(reason) = refused {
            self.apply_mode(AutopilotMode::Off, reason);
            self.emit(AutopilotEventKind::Paused, format!("{requested} refused: {reason}"), None, None);
            return self.snapshot();
        }

        if requested != AutopilotMode::Off && !self.liveness.is_running() {
            self.apply_mode(AutopilotMode::Off, "waiting for a session");
            self.emit(
                AutopilotEventKind::WaitingForSession,
                format!("{requested} requested but no session is running"),
                None,
                None,
            );
            return self.snapshot();
        }

        self.apply_mode(requested, &format!("mode set to {requested}"));
        match (previous, requested) {
            (p, r) if p == r => {}
            (_, AutopilotMode::Off) => {
                self.emit(AutopilotEventKind::Stopped, "autopilot turned off", None, None)
            }
            (_, mode) => self.emit(AutopilotEventKind::Started, format!("{mode} autopilot on"), None, None),
        }
        self.snapshot()
    }

    fn apply_mode(&self, mode: AutopilotMode, reason: &str) {
        let mut inner = self.inner();
        inner.mode = mode;
        inner.last_decision = Some(reason.to_string());
        inner.last_answered = None;
        inner.error_reported = false;
    }

    /// The session went idle: automation always resets to off
    pub fn session_idle(&self) {
        if self.mode() != AutopilotMode::Off {
            self.apply_mode(AutopilotMode::Off, "session is idle");
            self.emit(AutopilotEventKind::Stopped, "session is idle, autopilot turned off", None, None);
        }
    }

    /// React to one detector snapshot (wizard mode)
    pub fn handle_state(&self, state: &StateSnapshot) {
        if state.phase == Phase::Idle {
            self.session_idle();
            return;
        }
        if self.mode() != AutopilotMode::Wizard {
            return;
        }

        if state.last_error.is_some() || state.phase == Phase::Failed {
            let first = !std::mem::replace(&mut self.inner().error_reported, true);
            if first {
                let reason = match &state.last_error {
                    Some(error) => format!("automation halted: {error}"),
                    None => "automation halted: session failed".to_string(),
                };
                self.decided(&reason);
                self.emit(AutopilotEventKind::ErrorDetected, reason, None, None);
            }
            return;
        }
        self.inner().error_reported = false;

        if state.completed {
            self.apply_mode(AutopilotMode::Off, "completion detected");
            self.emit(
                AutopilotEventKind::Completed,
                "completion detected, wizard autopilot turned off",
                None,
                None,
            );
            return;
        }

        let last_answered = self.inner().last_answered.clone();
        match decide_wizard_input(state, &self.limits, last_answered.as_deref()) {
            WizardDecision::Wait => {}
            WizardDecision::Halt { reason } => {
                self.decided(&reason);
                self.emit(AutopilotEventKind::ErrorDetected, reason, None, None);
            }
            WizardDecision::Hold { reason } => {
                self.decided(&reason);
                self.emit(AutopilotEventKind::Paused, reason, None, None);
            }
            WizardDecision::Send { input, reason } => self.send_answer(state, &input, &reason),
        }
    }

    fn send_answer(&self, state: &StateSnapshot, input: &str, reason: &str) {
        let verdict = policy::classify_wizard_input(input);
        if verdict.is_blocked() {
            let reason = format!("answer refused by policy: {}", verdict.reason);
            self.decided(&reason);
            self.emit(AutopilotEventKind::Paused, reason, Some(input), None);
            return;
        }

        let payload = format!("{input}\r");
        match self.serializer.try_write(Writer::WizardAutopilot, payload.as_bytes()) {
            Ok(_) => {
                self.inner().last_answered = Some(state.prompt.clone());
                let shown = if input.is_empty() { "ENTER" } else { input };
                let message = format!("answered `{}` with {}: {}", state.prompt, shown, reason);
                self.decided(&message);
                self.emit(AutopilotEventKind::SentInput, message, Some(shown), None);
            }
            Err(e) => {
                let reason = format!("answer not sent: {e}");
                self.decided(&reason);
                self.emit(AutopilotEventKind::Paused, reason, Some(input), None);
            }
        }
    }

    /// Start the wizard loop and the plan executor
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let wizard = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_wizard().await })
        };
        let executor = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_plans().await })
        };
        vec![wizard, executor]
    }

    async fn run_wizard(&self) {
        let mut rx = self.state.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => self.handle_state(&event.state),
                Err(RecvError::Lagged(n)) => {
                    warn!("Autopilot lagged by {} state events", n);
                    self.handle_state(&self.state.current().state);
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Wizard loop exiting");
    }

    async fn run_plans(&self) {
        loop {
            let id = self.plans.wait_and_dequeue().await;
            self.execute_plan(&id).await;
        }
    }

    fn fail_plan(&self, id: &str, reason: &str) {
        // Already failed by a session stop is fine
        if self.plans.fail(id, reason).is_ok() || self.plans.status_of(id) == Some(PlanStatus::Failed) {
            self.emit(AutopilotEventKind::PlanFailed, format!("plan failed: {reason}"), None, Some(id));
        }
    }

    /// Run one approved plan to completion or first failure
    pub async fn execute_plan(&self, id: &str) {
        if !self.liveness.is_running() {
            self.fail_plan(id, "no session is running");
            return;
        }
        let plan = match self.plans.begin_execution(id) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Plan {} not executed: {}", id, e);
                return;
            }
        };
        self.emit(
            AutopilotEventKind::PlanStarted,
            format!("executing plan `{}` ({} steps)", plan.title, plan.steps.len()),
            None,
            Some(id),
        );

        for step in &plan.steps {
            let number = step.index + 1;
            if self.plans.status_of(id) != Some(PlanStatus::Executing) {
                debug!("Plan {} no longer executing, stopping", id);
                return;
            }
            if !self.liveness.is_running() {
                self.fail_plan(id, "session is no longer running");
                return;
            }
            if let Some(error) = self.state.current().state.last_error {
                self.fail_plan(id, &format!("session is in an error state: {error}"));
                return;
            }

            // Checked again even though the plan passed validation
            let verdict = policy::classify(&step.command);
            if verdict.is_blocked() {
                self.fail_plan(id, &format!("step {number} is blocked: {}", verdict.reason));
                return;
            }

            // Subscribe before writing so the reply cannot be missed
            let mut rx = self.state.subscribe();
            if let Err(e) = self.plans.step_started(id, step.index) {
                warn!("Plan {} step {} not started: {}", id, number, e);
                return;
            }
            let payload = format!("{}\r", step.command);
            if let Err(e) = self
                .serializer
                .write_queued(Writer::PlanExecutor, payload.as_bytes())
                .await
            {
                self.fail_plan(id, &format!("step {number} could not be sent: {e}"));
                return;
            }
            self.emit(
                AutopilotEventKind::PlanStepSent,
                format!("step {number}/{}: {}", plan.steps.len(), step.command),
                Some(&step.command),
                Some(id),
            );

            if let Err(reason) = self.await_step_outcome(&mut rx).await {
                self.fail_plan(id, &format!("step {number} failed: {reason}"));
                return;
            }
        }

        match self.plans.complete(id) {
            Ok(_) => self.emit(AutopilotEventKind::PlanCompleted, "plan completed", None, Some(id)),
            Err(e) => warn!("Plan {} could not complete: {}", id, e),
        }
    }

    /// Wait until the session asks for input again (step done) or fails.
    /// Output that merely stopped mid-line, such as a progress counter, is
    /// not a prompt.
    async fn await_step_outcome(
        &self,
        rx: &mut broadcast::Receiver<StateEvent>,
    ) -> Result<(), String> {
        loop {
            let state = match rx.recv().await {
                Ok(event) => event.state,
                Err(RecvError::Lagged(_)) => self.state.current().state,
                Err(RecvError::Closed) => return Err("state channel closed".to_string()),
            };
            if state.phase == Phase::Idle {
                return Err("session stopped".to_string());
            }
            if let Some(error) = state.last_error {
                return Err(error);
            }
            let prompted = state.waiting_for_input
                && state.confidence.is_some_and(|c| c >= Confidence::Medium);
            if prompted || state.completed {
                return Ok(());
            }
        }
    }
}
