//! Tool-invocation surface.
//!
//! The one contract shared by the socket transport, the browser UI and any
//! automation client. Transports translate requests into calls on
//! [`ToolSurface`] and never reach into the components themselves, so the
//! human path and both automation paths go through the same policy and
//! serializer checks.

use crate::autopilot::{AutopilotController, AutopilotEvent, AutopilotMode, AutopilotState, SessionLiveness};
use crate::detector::{DetectorConfig, StateChannel, StateEvent, StepDetector};
use crate::distributor::{ChannelId, OutputChunk, OutputDistributor};
use crate::error::EngineResult;
use crate::plan::{Plan, PlanManager, PlanProposal};
use crate::policy::{self, PolicyVerdict};
use crate::protocol::Config;
use crate::pty::PtySize;
use crate::redact::{Redact, SecretRedactor};
use crate::scripts::{self, ScriptEntry};
use crate::serializer::{ExecutionSerializer, InputSink, WriteRecord, Writer};
use crate::session::{SessionConfig, SessionEvent, SessionManager, SessionStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Buffered state events per subscriber
const STATE_CHANNEL_CAPACITY: usize = 256;

/// Outcome of `send`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResult {
    pub accepted: bool,
    /// Policy verdict for commands (and for raw input in strict mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<PolicyVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<WriteRecord>,
}

/// Everything the AI collaborator is allowed to see
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiContext {
    /// Redacted tail of the session output
    pub text: String,
    pub state: StateEvent,
    pub autopilot: AutopilotState,
    pub session: SessionStatus,
}

/// Result of stopping the session
#[derive(Debug, Clone)]
pub struct StopOutcome {
    pub session: Option<SessionStatus>,
    pub aborted_plan: Option<String>,
    /// Approved plans that never started
    pub cancelled_plans: Vec<String>,
}

pub struct ToolSurface {
    sessions: Arc<SessionManager>,
    distributor: Arc<OutputDistributor>,
    state: Arc<StateChannel>,
    serializer: Arc<ExecutionSerializer>,
    plans: Arc<PlanManager>,
    autopilot: Arc<AutopilotController>,
    scripts_dir: PathBuf,
    tail_chars: usize,
    strict_input: bool,
}

impl ToolSurface {
    /// Wire every component from `config`
    pub fn new(config: &Config) -> Self {
        Self::with_redactor(config, Arc::new(SecretRedactor::new()))
    }

    pub fn with_redactor(config: &Config, redactor: Arc<dyn Redact>) -> Self {
        let distributor = Arc::new(OutputDistributor::new(
            config.tail_chars,
            config.queue_depth,
            Arc::clone(&redactor),
        ));
        let detector = StepDetector::new(
            &DetectorConfig {
                window_chars: config.window_chars,
                custom: config.patterns.clone(),
            },
            Arc::clone(&redactor),
        );
        let state = Arc::new(StateChannel::new(detector, STATE_CHANNEL_CAPACITY));
        let sessions = Arc::new(SessionManager::new(
            SessionConfig {
                size: config.size,
                stop_grace: config.stop_grace,
                default_workdir: config.workdir.clone(),
            },
            Arc::clone(&distributor),
            Arc::clone(&state),
        ));
        let serializer = Arc::new(ExecutionSerializer::new(
            Arc::clone(&sessions) as Arc<dyn InputSink>,
            Arc::clone(&redactor),
        ));
        let plans = Arc::new(PlanManager::new(config.plan_history));
        let autopilot = Arc::new(AutopilotController::new(
            config.autopilot.clone(),
            Arc::clone(&serializer),
            Arc::clone(&state),
            Arc::clone(&plans),
            Arc::clone(&sessions) as Arc<dyn SessionLiveness>,
            redactor,
        ));

        Self {
            sessions,
            distributor,
            state,
            serializer,
            plans,
            autopilot,
            scripts_dir: config.scripts_dir.clone(),
            tail_chars: config.tail_chars,
            strict_input: config.strict_input,
        }
    }

    /// Start the autopilot loops. Requires a tokio runtime.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        self.autopilot.spawn()
    }

    /// `read(tailChars, redact)`
    pub fn read(&self, tail_chars: Option<usize>, redact: bool) -> String {
        let max = tail_chars.unwrap_or(self.tail_chars);
        self.distributor.read_tail(max, redact)
    }

    /// `send(payload, asCommand)` on behalf of the human operator.
    ///
    /// A blocked command is not an error: it comes back unaccepted with the
    /// verdict explaining why.
    pub fn send(&self, payload: &str, as_command: bool) -> EngineResult<SendResult> {
        let (data, verdict) = if as_command {
            let verdict = policy::classify(payload);
            let line = payload.trim_matches(['\r', '\n']);
            (format!("{line}\r"), Some(verdict))
        } else if self.strict_input {
            (payload.to_string(), Some(policy::classify_wizard_input(payload)))
        } else {
            (payload.to_string(), None)
        };

        if let Some(v) = verdict.as_ref().filter(|v| v.is_blocked()) {
            info!("Send refused by policy ({}): {}", v.rule_id, v.reason);
            return Ok(SendResult {
                accepted: false,
                verdict,
                write: None,
            });
        }

        let record = self.serializer.try_write(Writer::Human, data.as_bytes())?;
        Ok(SendResult {
            accepted: true,
            verdict,
            write: Some(record),
        })
    }

    /// `state()`: the detector's last emitted event
    pub fn state(&self) -> StateEvent {
        self.state.current()
    }

    /// `submitPlan(plan)`: auto-approved only in `plan_auto` mode
    pub fn submit_plan(&self, proposal: PlanProposal) -> EngineResult<Plan> {
        self.plans
            .submit(proposal, self.autopilot.auto_approve_plans())
    }

    pub fn approve_plan(&self, id: &str) -> EngineResult<Plan> {
        self.plans.approve(id)
    }

    pub fn reject_plan(&self, id: &str, reason: Option<String>) -> EngineResult<Plan> {
        self.plans.reject(id, reason)
    }

    pub fn get_plan(&self, id: &str) -> EngineResult<Plan> {
        self.plans.get(id)
    }

    pub fn list_plans(&self) -> Vec<Plan> {
        self.plans.list()
    }

    /// `setAutopilot(mode)`: returns the mode actually in effect
    pub fn set_autopilot(&self, mode: AutopilotMode) -> AutopilotState {
        self.autopilot.set_mode(mode)
    }

    pub fn autopilot_state(&self) -> AutopilotState {
        self.autopilot.snapshot()
    }

    /// Start (or switch to) a session running `command`.
    ///
    /// Returns the new status and the id of the replaced session. Plans that
    /// were executing or queued against the replaced session are failed.
    pub async fn start_session(
        &self,
        command: &str,
        workdir: Option<&Path>,
    ) -> EngineResult<(SessionStatus, Option<String>)> {
        let (status, replaced) = self.sessions.start(command, workdir).await?;
        if replaced.is_some() {
            self.plans.cancel_queued("session replaced");
            self.plans.abort_executing("session replaced");
        }
        Ok((status, replaced))
    }

    /// Stop the session: fail the queued and executing plans, terminate the
    /// process, free the serializer and turn the autopilot off.
    pub async fn stop_session(&self) -> EngineResult<StopOutcome> {
        // Queued first, so the executor cannot pick one up after the abort
        let cancelled_plans = self.plans.cancel_queued("session stopped");
        let aborted_plan = self.plans.abort_executing("session stopped");
        let session = self.sessions.stop().await?;
        self.serializer.force_release();
        self.autopilot.session_idle();
        debug!("Session stopped (aborted plan: {:?})", aborted_plan);
        Ok(StopOutcome {
            session,
            aborted_plan,
            cancelled_plans,
        })
    }

    pub fn session_status(&self) -> SessionStatus {
        self.sessions.status()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> EngineResult<()> {
        self.sessions.resize(PtySize { rows, cols })
    }

    pub fn list_scripts(&self) -> EngineResult<Vec<ScriptEntry>> {
        scripts::list_scripts(&self.scripts_dir)
    }

    /// Redacted tail plus state, the exact input for the AI collaborator
    pub fn context(&self, tail_chars: Option<usize>) -> AiContext {
        AiContext {
            text: self.read(tail_chars, true),
            state: self.state(),
            autopilot: self.autopilot.snapshot(),
            session: self.session_status(),
        }
    }

    pub fn journal(&self, limit: usize) -> Vec<WriteRecord> {
        self.serializer.journal(limit)
    }

    pub fn execution_holder(&self) -> Option<Writer> {
        self.serializer.holder()
    }

    pub fn subscribe_output(&self) -> (ChannelId, mpsc::Receiver<OutputChunk>) {
        self.distributor.subscribe()
    }

    pub fn unsubscribe_output(&self, id: ChannelId) {
        self.distributor.unsubscribe(id);
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateEvent> {
        self.state.subscribe()
    }

    pub fn subscribe_autopilot(&self) -> broadcast::Receiver<AutopilotEvent> {
        self.autopilot.subscribe()
    }

    pub fn subscribe_plans(&self) -> broadcast::Receiver<Plan> {
        self.plans.subscribe()
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Phase;
    use crate::error::EngineError;
    use crate::plan::{PlanStatus, StepProposal};
    use crate::policy::Verdict;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn surface(workdir: &Path) -> ToolSurface {
        ToolSurface::new(&Config {
            workdir: workdir.to_path_buf(),
            scripts_dir: workdir.join("scripts"),
            stop_grace: Duration::from_millis(500),
            ..Config::default()
        })
    }

    fn proposal(commands: &[&str]) -> PlanProposal {
        PlanProposal {
            id: None,
            title: "demo".to_string(),
            steps: commands
                .iter()
                .map(|c| StepProposal {
                    command: c.to_string(),
                    rationale: String::new(),
                    risk: None,
                })
                .collect(),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_send_without_session() {
        let dir = tempdir().unwrap();
        let tools = surface(dir.path());
        assert!(matches!(
            tools.send("ls", true),
            Err(EngineError::SessionNotRunning)
        ));
    }

    #[tokio::test]
    async fn test_blocked_command_is_refused_with_reason() {
        let dir = tempdir().unwrap();
        let tools = surface(dir.path());
        let result = tools.send("sudo rm -rf /", true).unwrap();
        assert!(!result.accepted);
        let verdict = result.verdict.unwrap();
        assert_eq!(verdict.verdict, Verdict::Block);
        assert!(!verdict.reason.is_empty());
        assert!(tools.journal(10).is_empty());
    }

    #[tokio::test]
    async fn test_multi_line_command_is_refused() {
        let dir = tempdir().unwrap();
        let tools = surface(dir.path());
        tools.start_session("cat", None).await.unwrap();

        let result = tools.send("ls\nrm -rf ~", true).unwrap();
        assert!(!result.accepted);
        assert_eq!(result.verdict.unwrap().rule_id, "block.multiline");
        assert!(tools.journal(10).is_empty());

        let result = tools.send("ls -la\n", true).unwrap();
        assert!(result.accepted);
        assert_eq!(result.write.unwrap().bytes, 7);
        tools.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_strict_mode_limits_raw_input() {
        let dir = tempdir().unwrap();
        let tools = ToolSurface::new(&Config {
            workdir: dir.path().to_path_buf(),
            strict_input: true,
            ..Config::default()
        });
        let result = tools.send("rm -rf build\r", false).unwrap();
        assert!(!result.accepted);
    }

    #[tokio::test]
    async fn test_plan_needs_approval_outside_plan_auto() {
        let dir = tempdir().unwrap();
        let tools = surface(dir.path());
        let plan = tools.submit_plan(proposal(&["ls -la"])).unwrap();
        assert_eq!(plan.status, PlanStatus::PendingApproval);

        let plan = tools.reject_plan(&plan.id, None).unwrap();
        assert_eq!(plan.status, PlanStatus::Rejected);
        assert_eq!(tools.list_plans().len(), 1);
    }

    #[tokio::test]
    async fn test_autopilot_stays_off_without_session() {
        let dir = tempdir().unwrap();
        let tools = surface(dir.path());
        let state = tools.set_autopilot(AutopilotMode::Wizard);
        assert_eq!(state.mode, AutopilotMode::Off);
    }

    #[tokio::test]
    async fn test_context_is_redacted() {
        let dir = tempdir().unwrap();
        let tools = surface(dir.path());
        tools
            .start_session("printf 'API_KEY=abc123\\n'; sleep 5", None)
            .await
            .unwrap();
        assert!(wait_until(|| tools.read(None, false).contains("abc123")).await);

        let context = tools.context(None);
        assert!(!context.text.contains("abc123"), "{}", context.text);
        assert!(context.session.running);
        tools.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_plan_auto_end_to_end() {
        let dir = tempdir().unwrap();
        let tools = surface(dir.path());
        let _tasks = tools.spawn_background();

        tools.start_session("sh", None).await.unwrap();
        assert!(wait_until(|| tools.state().state.waiting_for_input).await);
        assert_eq!(tools.set_autopilot(AutopilotMode::PlanAuto).mode, AutopilotMode::PlanAuto);

        let plan = tools
            .submit_plan(proposal(&["mkdir example", "touch example/README.md"]))
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);

        let id = plan.id.clone();
        assert!(wait_until(|| tools.get_plan(&id).unwrap().status.is_terminal()).await);
        assert_eq!(tools.get_plan(&id).unwrap().status, PlanStatus::Completed);
        assert!(wait_until(|| dir.path().join("example/README.md").exists()).await);

        let writes = tools.journal(10);
        assert_eq!(writes.len(), 2);
        assert!(writes[0].preview.starts_with("mkdir example"));
        assert!(writes[1].preview.starts_with("touch example/README.md"));
        assert!(writes.iter().all(|w| w.writer == Writer::PlanExecutor));

        tools.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_fails_executing_plan_and_frees_serializer() {
        let dir = tempdir().unwrap();
        let tools = surface(dir.path());
        let _tasks = tools.spawn_background();

        tools.start_session("sh", None).await.unwrap();
        assert!(wait_until(|| tools.state().state.waiting_for_input).await);
        tools.set_autopilot(AutopilotMode::PlanAuto);

        let plan = tools.submit_plan(proposal(&["sleep 30", "ls"])).unwrap();
        let id = plan.id.clone();
        assert!(wait_until(|| tools.get_plan(&id).unwrap().status == PlanStatus::Executing).await);

        let outcome = tools.stop_session().await.unwrap();
        assert_eq!(outcome.aborted_plan.as_deref(), Some(id.as_str()));

        let plan = tools.get_plan(&id).unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        assert!(plan.reason.unwrap().contains("session stopped"));
        assert!(tools.execution_holder().is_none());
        assert_eq!(tools.state().state.phase, Phase::Idle);
        assert_eq!(tools.autopilot_state().mode, AutopilotMode::Off);
    }

    #[tokio::test]
    async fn test_stop_cancels_plans_waiting_in_queue() {
        let dir = tempdir().unwrap();
        let tools = surface(dir.path());
        let _tasks = tools.spawn_background();

        tools.start_session("sh", None).await.unwrap();
        assert!(wait_until(|| tools.state().state.waiting_for_input).await);
        tools.set_autopilot(AutopilotMode::PlanAuto);

        let running = tools.submit_plan(proposal(&["sleep 30"])).unwrap().id;
        assert!(wait_until(|| tools.get_plan(&running).unwrap().status == PlanStatus::Executing).await);
        let second = tools.submit_plan(proposal(&["ls"])).unwrap().id;
        let third = tools.submit_plan(proposal(&["pwd"])).unwrap().id;
        assert_eq!(tools.get_plan(&third).unwrap().status, PlanStatus::Approved);

        let outcome = tools.stop_session().await.unwrap();
        assert_eq!(outcome.aborted_plan.as_deref(), Some(running.as_str()));
        assert_eq!(outcome.cancelled_plans, vec![second.clone(), third.clone()]);
        for id in [&second, &third] {
            let plan = tools.get_plan(id).unwrap();
            assert_eq!(plan.status, PlanStatus::Failed);
            assert_eq!(plan.reason.as_deref(), Some("session stopped"));
            assert_eq!(plan.current_step, None);
        }
        assert!(tools
            .journal(10)
            .iter()
            .all(|w| w.preview.starts_with("sleep 30")));
    }

    #[tokio::test]
    async fn test_replacing_session_cancels_queued_plans() {
        let dir = tempdir().unwrap();
        let tools = surface(dir.path());
        let _tasks = tools.spawn_background();

        tools.start_session("sh", None).await.unwrap();
        assert!(wait_until(|| tools.state().state.waiting_for_input).await);
        tools.set_autopilot(AutopilotMode::PlanAuto);

        let running = tools.submit_plan(proposal(&["sleep 30"])).unwrap().id;
        assert!(wait_until(|| tools.get_plan(&running).unwrap().status == PlanStatus::Executing).await);
        let queued = tools.submit_plan(proposal(&["ls"])).unwrap().id;

        let (_, replaced) = tools.start_session("sh", None).await.unwrap();
        assert!(replaced.is_some());
        for id in [&running, &queued] {
            let plan = tools.get_plan(id).unwrap();
            assert_eq!(plan.status, PlanStatus::Failed);
            assert_eq!(plan.reason.as_deref(), Some("session replaced"));
        }

        tools.stop_session().await.unwrap();
    }
}
