//! Unix domain socket server for the tool surface.
//!
//! Listens at the configured path (default `/tmp/clouddeploy.sock`) and
//! accepts one JSON request per line. Each request gets one JSON response
//! line. A `subscribe` request turns the connection into an event stream:
//! after the `subscribed` acknowledgement every event of the chosen kind is
//! written as its own line until the client disconnects. Requests may still
//! be sent on a subscribed connection.

use crate::distributor::{ChannelId, OutputChunk, Utf8Stream};
use crate::protocol::{StreamKind, ToolRequest, ToolResponse};
use crate::tools::ToolSurface;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Journal entries returned when a request names no limit
const DEFAULT_JOURNAL_LIMIT: usize = 50;

/// Socket server for tool requests
pub struct SocketServer {
    socket_path: PathBuf,
    tools: Arc<ToolSurface>,
    shutdown_tx: mpsc::Sender<()>,
}

impl SocketServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        tools: Arc<ToolSurface>,
        shutdown_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            tools,
            shutdown_tx,
        }
    }

    /// Bind and serve until the task is dropped
    pub async fn run(self) -> Result<()> {
        let path = self.socket_path.as_path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove existing socket")?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create socket directory {:?}", parent))?;
        }

        let listener = UnixListener::bind(path)
            .context(format!("Failed to bind socket at {}", path.display()))?;

        // Owner only: the socket can drive a shell
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path, perms) {
                warn!("Failed to set socket permissions: {}", e);
            }
        }

        info!("Socket server listening at {}", path.display());

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let tools = Arc::clone(&self.tools);
                    let shutdown_tx = self.shutdown_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, tools, shutdown_tx).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Live event source of a subscribed connection
enum Subscription {
    Output(ChannelId, mpsc::Receiver<OutputChunk>, Utf8Stream),
    State(broadcast::Receiver<crate::detector::StateEvent>),
    Autopilot(broadcast::Receiver<crate::autopilot::AutopilotEvent>),
    Plans(broadcast::Receiver<crate::plan::Plan>),
    Session(broadcast::Receiver<crate::session::SessionEvent>),
}

impl Subscription {
    fn open(tools: &ToolSurface, stream: StreamKind) -> Self {
        match stream {
            StreamKind::Output => {
                let (id, rx) = tools.subscribe_output();
                Self::Output(id, rx, Utf8Stream::new())
            }
            StreamKind::State => Self::State(tools.subscribe_state()),
            StreamKind::Autopilot => Self::Autopilot(tools.subscribe_autopilot()),
            StreamKind::Plans => Self::Plans(tools.subscribe_plans()),
            StreamKind::Session => Self::Session(tools.subscribe_sessions()),
        }
    }

    fn close(self, tools: &ToolSurface) {
        if let Self::Output(id, ..) = self {
            tools.unsubscribe_output(id);
        }
    }

    /// Next event to forward; `None` once the source is gone
    async fn next(&mut self) -> Option<ToolResponse> {
        match self {
            Self::Output(_, rx, decoder) => loop {
                let chunk = rx.recv().await?;
                let text = decoder.decode(&chunk.data);
                // Only the first bytes of a character so far
                if text.is_empty() {
                    continue;
                }
                return Some(ToolResponse::Output {
                    text,
                    session_id: chunk.session_id,
                    seq: chunk.seq,
                    timestamp: chunk.timestamp,
                });
            },
            Self::State(rx) => recv_broadcast(rx).await.map(ToolResponse::State),
            Self::Autopilot(rx) => recv_broadcast(rx).await.map(ToolResponse::AutopilotEvent),
            Self::Plans(rx) => recv_broadcast(rx).await.map(ToolResponse::Plan),
            Self::Session(rx) => recv_broadcast(rx).await.map(ToolResponse::SessionEvent),
        }
    }
}

async fn recv_broadcast<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(n)) => {
                warn!("Subscriber lagged by {} events - some updates were skipped", n);
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn next_event(subscription: &mut Option<Subscription>) -> Option<ToolResponse> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &ToolResponse) -> Result<()> {
    let response_json = serde_json::to_string(response)?;
    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    tools: Arc<ToolSurface>,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    // `next_line` keeps partial input across cancelled polls
    let mut lines = BufReader::new(reader).lines();
    let mut subscription: Option<Subscription> = None;

    debug!("New client connection");

    let result = async {
        loop {
            tokio::select! {
                result = lines.next_line() => {
                    let Some(line) = result? else {
                        debug!("Client disconnected");
                        break;
                    };

                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<ToolRequest>(trimmed) {
                        Ok(ToolRequest::Subscribe { stream }) => {
                            debug!("Client subscribed to {:?}", stream);
                            if let Some(old) = subscription.replace(Subscription::open(&tools, stream)) {
                                old.close(&tools);
                            }
                            write_response(&mut writer, &ToolResponse::Subscribed { stream }).await?;
                        }
                        Ok(request) => {
                            let response = handle_request(request, &tools, &shutdown_tx).await;
                            write_response(&mut writer, &response).await?;
                            if matches!(response, ToolResponse::ShutdownAck) {
                                break;
                            }
                        }
                        Err(e) => {
                            let response = ToolResponse::error("invalid_request", format!("Invalid JSON: {}", e));
                            write_response(&mut writer, &response).await?;
                        }
                    }
                }

                event = next_event(&mut subscription) => {
                    match event {
                        Some(response) => write_response(&mut writer, &response).await?,
                        None => {
                            debug!("Subscription source closed");
                            subscription = None;
                        }
                    }
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if let Some(sub) = subscription.take() {
        sub.close(&tools);
    }
    result
}

/// Handle a single request
async fn handle_request(
    request: ToolRequest,
    tools: &ToolSurface,
    shutdown_tx: &mpsc::Sender<()>,
) -> ToolResponse {
    match request {
        ToolRequest::Read { tail_chars, redact } => ToolResponse::Read {
            text: tools.read(tail_chars, redact),
        },

        ToolRequest::Send {
            payload,
            as_command,
        } => match tools.send(&payload, as_command) {
            Ok(result) => ToolResponse::Send(result),
            Err(e) => e.into(),
        },

        ToolRequest::State => ToolResponse::State(tools.state()),

        ToolRequest::SubmitPlan { plan } => match tools.submit_plan(plan) {
            Ok(plan) => ToolResponse::Plan(plan),
            Err(e) => e.into(),
        },

        ToolRequest::ApprovePlan { id } => match tools.approve_plan(&id) {
            Ok(plan) => ToolResponse::Plan(plan),
            Err(e) => e.into(),
        },

        ToolRequest::RejectPlan { id, reason } => match tools.reject_plan(&id, reason) {
            Ok(plan) => ToolResponse::Plan(plan),
            Err(e) => e.into(),
        },

        ToolRequest::GetPlan { id } => match tools.get_plan(&id) {
            Ok(plan) => ToolResponse::Plan(plan),
            Err(e) => e.into(),
        },

        ToolRequest::ListPlans => ToolResponse::Plans {
            plans: tools.list_plans(),
        },

        ToolRequest::SetAutopilot { mode } => ToolResponse::Autopilot(tools.set_autopilot(mode)),

        ToolRequest::StartSession { command, workdir } => {
            let workdir = workdir.map(PathBuf::from);
            match tools.start_session(&command, workdir.as_deref()).await {
                Ok((session, replaced)) => ToolResponse::SessionStarted { session, replaced },
                Err(e) => e.into(),
            }
        }

        ToolRequest::StopSession => match tools.stop_session().await {
            Ok(outcome) => ToolResponse::SessionStopped {
                session: outcome.session,
                aborted_plan: outcome.aborted_plan,
                cancelled_plans: outcome.cancelled_plans,
            },
            Err(e) => e.into(),
        },

        ToolRequest::SessionStatus => ToolResponse::SessionStatus(tools.session_status()),

        ToolRequest::Resize { rows, cols } => match tools.resize(rows, cols) {
            Ok(()) => ToolResponse::Resized,
            Err(e) => e.into(),
        },

        ToolRequest::ListScripts => match tools.list_scripts() {
            Ok(scripts) => ToolResponse::Scripts { scripts },
            Err(e) => e.into(),
        },

        ToolRequest::Context { tail_chars } => ToolResponse::Context(tools.context(tail_chars)),

        ToolRequest::Journal { limit } => ToolResponse::Journal {
            writes: tools.journal(limit.unwrap_or(DEFAULT_JOURNAL_LIMIT)),
        },

        ToolRequest::Subscribe { stream } => {
            // Handled by the connection loop
            ToolResponse::Subscribed { stream }
        }

        ToolRequest::Shutdown => {
            info!("Shutdown requested via socket");
            if let Err(e) = tools.stop_session().await {
                warn!("Failed to stop session on shutdown: {}", e);
            }
            let _ = shutdown_tx.send(()).await;
            ToolResponse::ShutdownAck
        }
    }
}

/// Client for connecting to the socket (for testing and integration)
pub struct SocketClient {
    socket_path: PathBuf,
}

impl SocketClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub async fn state(&self) -> Result<ToolResponse> {
        self.send_request(ToolRequest::State).await
    }

    /// Request shutdown
    pub async fn shutdown(&self) -> Result<ToolResponse> {
        self.send_request(ToolRequest::Shutdown).await
    }

    /// One request on a fresh connection
    pub async fn send_request(&self, request: ToolRequest) -> Result<ToolResponse> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .context("Failed to connect to socket")?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let request_json = serde_json::to_string(&request)?;
        writer.write_all(request_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response: ToolResponse = serde_json::from_str(line.trim())?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanProposal, PlanStatus, StepProposal};
    use crate::protocol::Config;
    use tempfile::tempdir;
    use tokio::time::{timeout, Duration};

    fn tools(dir: &Path) -> Arc<ToolSurface> {
        Arc::new(ToolSurface::new(&Config {
            workdir: dir.to_path_buf(),
            scripts_dir: dir.to_path_buf(),
            ..Config::default()
        }))
    }

    async fn read_response<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> ToolResponse {
        let mut line = String::new();
        timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    #[tokio::test]
    async fn test_socket_server_client() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);

        let server = SocketServer::new(socket_path.clone(), tools(dir.path()), shutdown_tx);
        let server_handle = tokio::spawn(async move {
            server.run().await.ok();
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = SocketClient::new(&socket_path);
        let response = client.state().await.unwrap();
        match response {
            ToolResponse::State(event) => assert!(!event.state.waiting_for_input),
            other => panic!("Unexpected response: {:?}", other),
        }

        let response = client.send_request(ToolRequest::ListScripts).await.unwrap();
        match response {
            ToolResponse::Scripts { scripts } => assert_eq!(scripts.last().unwrap().id, "shell"),
            other => panic!("Unexpected response: {:?}", other),
        }

        server_handle.abort();
    }

    #[tokio::test]
    async fn test_handle_request_errors_carry_codes() {
        let dir = tempdir().unwrap();
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let tools = tools(dir.path());

        let response = handle_request(
            ToolRequest::Send {
                payload: "ls".to_string(),
                as_command: true,
            },
            &tools,
            &shutdown_tx,
        )
        .await;
        match response {
            ToolResponse::Error { code, .. } => assert_eq!(code, "session_not_running"),
            other => panic!("Unexpected response: {:?}", other),
        }

        let response = handle_request(
            ToolRequest::ApprovePlan {
                id: "missing".to_string(),
            },
            &tools,
            &shutdown_tx,
        )
        .await;
        assert!(matches!(response, ToolResponse::Error { ref code, .. } if code == "plan_not_found"));

        let response = handle_request(
            ToolRequest::StartSession {
                command: "definitely-not-a-real-binary-xyz".to_string(),
                workdir: None,
            },
            &tools,
            &shutdown_tx,
        )
        .await;
        assert!(matches!(response, ToolResponse::Error { ref code, .. } if code == "spawn_error"));
    }

    #[tokio::test]
    async fn test_handle_request_shutdown() {
        let dir = tempdir().unwrap();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let tools = tools(dir.path());

        let response = handle_request(ToolRequest::Shutdown, &tools, &shutdown_tx).await;
        assert!(matches!(response, ToolResponse::ShutdownAck));

        let received = timeout(Duration::from_millis(200), shutdown_rx.recv())
            .await
            .ok()
            .flatten();
        assert!(received.is_some());
    }

    #[tokio::test]
    async fn test_handle_connection_invalid_json() {
        let dir = tempdir().unwrap();
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let (server_stream, client_stream) = UnixStream::pair().unwrap();
        let tools = tools(dir.path());

        let server_handle = tokio::spawn(async move {
            handle_connection(server_stream, tools, shutdown_tx)
                .await
                .unwrap();
        });

        let (reader, mut writer) = client_stream.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(b"not json\n").await.unwrap();
        writer.flush().await.unwrap();

        match read_response(&mut reader).await {
            ToolResponse::Error { code, message } => {
                assert_eq!(code, "invalid_request");
                assert!(message.contains("Invalid JSON"));
            }
            other => panic!("Unexpected response: {:?}", other),
        }

        drop(writer);
        server_handle.abort();
    }

    #[tokio::test]
    async fn test_subscription_streams_plan_updates() {
        let dir = tempdir().unwrap();
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let tools = tools(dir.path());
        let (server_stream, client_stream) = UnixStream::pair().unwrap();

        let server_tools = Arc::clone(&tools);
        let server_handle = tokio::spawn(async move {
            let _ = handle_connection(server_stream, server_tools, shutdown_tx).await;
        });

        let (reader, mut writer) = client_stream.into_split();
        let mut reader = BufReader::new(reader);
        writer
            .write_all(b"{\"type\":\"subscribe\",\"stream\":\"plans\"}\n")
            .await
            .unwrap();
        assert!(matches!(
            read_response(&mut reader).await,
            ToolResponse::Subscribed {
                stream: StreamKind::Plans
            }
        ));

        let plan = tools
            .submit_plan(PlanProposal {
                id: Some("p-1".to_string()),
                title: "inspect".to_string(),
                steps: vec![StepProposal {
                    command: "ls -la".to_string(),
                    rationale: String::new(),
                    risk: None,
                }],
            })
            .unwrap();
        assert_eq!(plan.status, PlanStatus::PendingApproval);

        match read_response(&mut reader).await {
            ToolResponse::Plan(update) => {
                assert_eq!(update.id, "p-1");
                assert_eq!(update.status, PlanStatus::PendingApproval);
            }
            other => panic!("Unexpected response: {:?}", other),
        }

        drop(writer);
        server_handle.abort();
    }

    #[tokio::test]
    async fn test_request_split_around_an_event_is_not_lost() {
        let dir = tempdir().unwrap();
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let tools = tools(dir.path());
        let (server_stream, client_stream) = UnixStream::pair().unwrap();

        let server_tools = Arc::clone(&tools);
        let server_handle = tokio::spawn(async move {
            let _ = handle_connection(server_stream, server_tools, shutdown_tx).await;
        });

        let (reader, mut writer) = client_stream.into_split();
        let mut reader = BufReader::new(reader);
        writer
            .write_all(b"{\"type\":\"subscribe\",\"stream\":\"plans\"}\n")
            .await
            .unwrap();
        assert!(matches!(
            read_response(&mut reader).await,
            ToolResponse::Subscribed { .. }
        ));

        // First half of a request, then an event wins the select
        writer.write_all(b"{\"type\":\"sta").await.unwrap();
        writer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tools
            .submit_plan(PlanProposal {
                id: Some("p-split".to_string()),
                title: "inspect".to_string(),
                steps: vec![StepProposal {
                    command: "pwd".to_string(),
                    rationale: String::new(),
                    risk: None,
                }],
            })
            .unwrap();
        assert!(matches!(read_response(&mut reader).await, ToolResponse::Plan(_)));

        writer.write_all(b"te\"}\n").await.unwrap();
        writer.flush().await.unwrap();
        match read_response(&mut reader).await {
            ToolResponse::State(event) => assert!(!event.state.waiting_for_input),
            other => panic!("Unexpected response: {:?}", other),
        }

        drop(writer);
        server_handle.abort();
    }
}
