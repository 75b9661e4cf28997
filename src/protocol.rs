//! Protocol types for the tool socket.
//!
//! Every request and response is one JSON object per line, tagged by
//! `type`. The same shapes are returned by [`crate::tools::ToolSurface`]
//! to in-process callers.

use crate::autopilot::{AutopilotEvent, AutopilotLimits, AutopilotMode, AutopilotState};
use crate::detector::{CustomPatterns, StateEvent};
use crate::plan::{Plan, PlanProposal};
use crate::pty::PtySize;
use crate::scripts::ScriptEntry;
use crate::serializer::WriteRecord;
use crate::session::{SessionEvent, SessionStatus};
use crate::tools::{AiContext, SendResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_true() -> bool {
    true
}

/// Message sent to the tool socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolRequest {
    /// Recent output, redacted unless `redact` is false
    Read {
        #[serde(default)]
        tail_chars: Option<usize>,
        #[serde(default = "default_true")]
        redact: bool,
    },
    /// Write to the session as the human operator
    Send {
        payload: String,
        /// Treat the payload as a shell command: classify it and append ENTER
        #[serde(default)]
        as_command: bool,
    },
    State,
    SubmitPlan {
        plan: PlanProposal,
    },
    ApprovePlan {
        id: String,
    },
    RejectPlan {
        id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    GetPlan {
        id: String,
    },
    ListPlans,
    SetAutopilot {
        mode: AutopilotMode,
    },
    StartSession {
        command: String,
        #[serde(default)]
        workdir: Option<String>,
    },
    StopSession,
    SessionStatus,
    Resize {
        rows: u16,
        cols: u16,
    },
    ListScripts,
    /// Redacted tail plus current state, as handed to the AI collaborator
    Context {
        #[serde(default)]
        tail_chars: Option<usize>,
    },
    /// Recent writes that passed the execution serializer
    Journal {
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Keep the connection open and stream one kind of event
    Subscribe {
        stream: StreamKind,
    },
    /// Stop the session and exit
    Shutdown,
}

/// Event streams available to `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Output,
    State,
    Autopilot,
    Plans,
    Session,
}

/// Response sent back through the tool socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResponse {
    Read {
        text: String,
    },
    Send(SendResult),
    /// Detector state; also streamed for `subscribe{stream: state}`
    State(StateEvent),
    /// One plan; also streamed for `subscribe{stream: plans}`
    Plan(Plan),
    Plans {
        plans: Vec<Plan>,
    },
    Autopilot(AutopilotState),
    SessionStatus(SessionStatus),
    SessionStarted {
        session: SessionStatus,
        /// Id of the session this one replaced
        #[serde(skip_serializing_if = "Option::is_none")]
        replaced: Option<String>,
    },
    SessionStopped {
        /// Final status, absent when nothing was running
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<SessionStatus>,
        #[serde(skip_serializing_if = "Option::is_none")]
        aborted_plan: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cancelled_plans: Vec<String>,
    },
    Resized,
    Scripts {
        scripts: Vec<ScriptEntry>,
    },
    Context(AiContext),
    Journal {
        writes: Vec<WriteRecord>,
    },
    Subscribed {
        stream: StreamKind,
    },
    /// Streamed output chunk (raw terminal text)
    Output {
        session_id: String,
        seq: u64,
        timestamp: u64,
        text: String,
    },
    AutopilotEvent(AutopilotEvent),
    SessionEvent(SessionEvent),
    /// Shutdown acknowledged
    ShutdownAck,
    Error {
        /// Stable error identifier
        code: String,
        message: String,
    },
}

impl ToolResponse {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<crate::error::EngineError> for ToolResponse {
    fn from(err: crate::error::EngineError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Unix socket path
    pub socket_path: PathBuf,
    /// Default working directory for new sessions
    pub workdir: PathBuf,
    /// Where `list_scripts` looks for `*.sh`
    pub scripts_dir: PathBuf,
    /// Characters kept in the output tail buffer
    pub tail_chars: usize,
    /// Characters of trailing output the detector classifies
    pub window_chars: usize,
    /// Per-subscriber output queue depth
    pub queue_depth: usize,
    /// Time between SIGTERM and SIGKILL on stop
    pub stop_grace: Duration,
    pub size: PtySize,
    /// Check raw `send` payloads with the wizard input classifier too
    pub strict_input: bool,
    pub autopilot: AutopilotLimits,
    pub patterns: CustomPatterns,
    /// Finished plans kept for `listPlans`
    pub plan_history: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/clouddeploy.sock"),
            workdir: PathBuf::from("."),
            scripts_dir: PathBuf::from("scripts"),
            tail_chars: 12000,
            window_chars: 4000,
            queue_depth: 256,
            stop_grace: Duration::from_millis(2000),
            size: PtySize::default(),
            strict_input: false,
            autopilot: AutopilotLimits::default(),
            patterns: CustomPatterns::default(),
            plan_history: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parsing_defaults() {
        let req: ToolRequest = serde_json::from_str(r#"{"type":"read"}"#).unwrap();
        assert!(matches!(
            req,
            ToolRequest::Read {
                tail_chars: None,
                redact: true
            }
        ));

        let req: ToolRequest =
            serde_json::from_str(r#"{"type":"send","payload":"ls -la"}"#).unwrap();
        assert!(matches!(req, ToolRequest::Send { as_command: false, .. }));

        let req: ToolRequest =
            serde_json::from_str(r#"{"type":"set_autopilot","mode":"plan_auto"}"#).unwrap();
        assert!(matches!(
            req,
            ToolRequest::SetAutopilot {
                mode: AutopilotMode::PlanAuto
            }
        ));
    }

    #[test]
    fn test_submit_plan_request() {
        let json = r#"{"type":"submit_plan","plan":{"title":"demo","steps":[
            {"command":"mkdir example","rationale":"workspace"},
            {"command":"ls -la","risk":"low"}]}}"#;
        match serde_json::from_str::<ToolRequest>(json).unwrap() {
            ToolRequest::SubmitPlan { plan } => {
                assert_eq!(plan.steps.len(), 2);
                assert_eq!(plan.steps[1].risk.as_deref(), Some("low"));
                assert!(plan.id.is_none());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_error_response_carries_code() {
        let resp = ToolResponse::from(crate::error::EngineError::SessionNotRunning);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"session_not_running\""));
    }

    #[test]
    fn test_state_response_is_flat() {
        let resp = ToolResponse::State(StateEvent {
            seq: 3,
            timestamp: 0,
            state: Default::default(),
        });
        let value: serde_json::Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["type"], "state");
        assert_eq!(value["phase"], "idle");
        assert_eq!(value["waiting_for_input"], false);
    }
}
