// Session host daemon
//
// Accepts Unix socket connections, authenticates each socket with `hello`,
// dispatches control requests into the session registry and pushes PTY
// events onto each attached client's stream socket.

use crate::session::config::{process_alive, Config};
use crate::session::protocol::{
    encode_frame, request_type, CreateOrAttachRequest, DataEvent, ErrorCode, EventFrame,
    EventKind, ExitEvent, FrameDecoder, HelloResponse, ListSessionsResponse, RequestFrame,
    ResizeRequest, ResponseFrame, SessionRequest, ShutdownRequest, SocketRole, WriteRequest,
    PROTOCOL_VERSION,
};
use crate::session::registry::{
    ClientId, HostedSession, RegistryError, SessionRegistry, SpawnedSession,
};
use crate::session::replay::DEFAULT_REPLAY_CAP;
use crate::session::runtime::PtyEvent;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex};

/// Delay between acknowledging `shutdown` and tearing down
pub const SHUTDOWN_ACK_DELAY: Duration = Duration::from_millis(100);

/// How long to wait when checking whether an existing socket is live
pub const STALE_SOCKET_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors returned to clients as `{ok: false, error: {code, message}}`
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Protocol version mismatch: daemon speaks {expected}, client sent {actual}")]
    ProtocolMismatch { expected: u32, actual: u64 },

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Invalid hello: {0}")]
    InvalidHello(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Stream socket not connected for client {0}")]
    StreamNotConnected(ClientId),

    #[error("Unknown request type: {0}")]
    UnknownRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl HostError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HostError::ProtocolMismatch { .. } => ErrorCode::ProtocolMismatch,
            HostError::AuthFailed => ErrorCode::AuthFailed,
            HostError::InvalidHello(_) => ErrorCode::InvalidHello,
            HostError::NotAuthenticated => ErrorCode::NotAuthenticated,
            HostError::InvalidRole(_) => ErrorCode::InvalidRole,
            HostError::StreamNotConnected(_) => ErrorCode::StreamNotConnected,
            HostError::UnknownRequest(_) => ErrorCode::UnknownRequest,
            HostError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl From<RegistryError> for HostError {
    fn from(e: RegistryError) -> Self {
        HostError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for HostError {
    fn from(e: serde_json::Error) -> Self {
        HostError::Internal(e.to_string())
    }
}

// ============================================================================
// Connections
// ============================================================================

/// Item queued for a socket's writer task
#[derive(Debug)]
enum Outbound {
    Frame(Vec<u8>),
    /// Flush what is queued, then close the socket
    Close,
}

#[derive(Debug, Clone)]
struct SocketHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug, Default)]
struct ClientSockets {
    control: Option<SocketHandle>,
    stream: Option<SocketHandle>,
}

impl ClientSockets {
    fn slot(&mut self, role: SocketRole) -> &mut Option<SocketHandle> {
        match role {
            SocketRole::Control => &mut self.control,
            SocketRole::Stream => &mut self.stream,
        }
    }

    fn is_empty(&self) -> bool {
        self.control.is_none() && self.stream.is_none()
    }
}

/// Per-socket state: authentication outcome and outbound queue
pub struct Connection {
    id: u64,
    auth: Option<(ClientId, SocketRole)>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    fn new(id: u64, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, auth: None, tx }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.auth.as_ref().map(|(id, _)| id.as_str())
    }
}

/// Outcome of handling one request
pub struct Reply {
    pub response: ResponseFrame,
    /// Close the socket once the response is flushed
    pub close: bool,
}

// ============================================================================
// Shared daemon state
// ============================================================================

struct HostInner {
    sessions: SessionRegistry,
    clients: HashMap<ClientId, ClientSockets>,
}

impl HostInner {
    fn send_stream(&self, client_id: &str, bytes: &[u8]) {
        if let Some(stream) = self.clients.get(client_id).and_then(|c| c.stream.as_ref()) {
            let _ = stream.tx.send(Outbound::Frame(bytes.to_vec()));
        }
    }

    fn broadcast_exit(&self, session_id: &str, session: &HostedSession, exit_code: Option<i32>) {
        match event_bytes(EventKind::Exit, session_id, &ExitEvent { exit_code }) {
            Ok(bytes) => {
                for client_id in session.attached_clients() {
                    self.send_stream(client_id, &bytes);
                }
            }
            Err(e) => tracing::warn!(session_id, error = %e, "Failed to encode exit event"),
        }
    }

    fn release_socket(&mut self, conn_id: u64, client_id: &str, role: SocketRole) {
        let Some(sockets) = self.clients.get_mut(client_id) else {
            return;
        };
        let slot = sockets.slot(role);
        if slot.as_ref().map(|s| s.conn_id) == Some(conn_id) {
            *slot = None;
        }
        if sockets.is_empty() {
            self.clients.remove(client_id);
            self.sessions.detach_everywhere(client_id);
            tracing::debug!(client_id, "Client fully disconnected");
        }
    }
}

/// State shared by every connection task
pub struct HostState {
    token: String,
    inner: Mutex<HostInner>,
    shutdown: watch::Sender<bool>,
    next_conn_id: AtomicU64,
}

impl HostState {
    pub fn new(token: impl Into<String>, replay_cap: usize) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            token: token.into(),
            inner: Mutex::new(HostInner {
                sessions: SessionRegistry::new(replay_cap),
                clients: HashMap::new(),
            }),
            shutdown,
            next_conn_id: AtomicU64::new(1),
        })
    }

    fn open_connection(&self) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        (Connection::new(id, tx), rx)
    }

    /// Handle a request and build its response
    pub async fn handle_request(self: &Arc<Self>, conn: &mut Connection, request: RequestFrame) -> Reply {
        let is_hello = request.kind == request_type::HELLO;
        let id = request.id.clone();
        let kind = request.kind.clone();

        match self.dispatch(conn, request).await {
            Ok(payload) => Reply {
                response: ResponseFrame::success(id, payload),
                close: false,
            },
            Err(e) => {
                match &e {
                    HostError::Internal(message) => {
                        tracing::warn!(request = %kind, error = %message, "Request failed")
                    }
                    other => tracing::debug!(request = %kind, error = %other, "Request rejected"),
                }
                Reply {
                    response: ResponseFrame::failure(id, e.code(), e.to_string()),
                    close: is_hello,
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, conn: &mut Connection, request: RequestFrame) -> Result<Value, HostError> {
        if request.kind == request_type::HELLO {
            return self.hello(conn, &request.payload).await;
        }

        let (client_id, role) = conn.auth.clone().ok_or(HostError::NotAuthenticated)?;
        if role != SocketRole::Control {
            return Err(HostError::InvalidRole(format!(
                "{} requests are not accepted on a {} socket",
                request.kind, role
            )));
        }

        match request.kind.as_str() {
            request_type::CREATE_OR_ATTACH => {
                let req: CreateOrAttachRequest = parse_payload(&request.kind, request.payload)?;
                self.create_or_attach(&client_id, req).await
            }
            request_type::WRITE => {
                let req: WriteRequest = parse_payload(&request.kind, request.payload)?;
                let inner = self.inner.lock().await;
                inner.sessions.write(&req.session_id, &req.data)?;
                Ok(json!({}))
            }
            request_type::RESIZE => {
                let req: ResizeRequest = parse_payload(&request.kind, request.payload)?;
                let inner = self.inner.lock().await;
                inner.sessions.resize(&req.session_id, req.cols, req.rows)?;
                Ok(json!({}))
            }
            request_type::DETACH => {
                let req: SessionRequest = parse_payload(&request.kind, request.payload)?;
                let mut inner = self.inner.lock().await;
                let detached = inner.sessions.detach(&req.session_id, &client_id)?;
                Ok(json!({ "detached": detached }))
            }
            request_type::KILL => {
                let req: SessionRequest = parse_payload(&request.kind, request.payload)?;
                let mut inner = self.inner.lock().await;
                let session = inner.sessions.kill(&req.session_id)?;
                inner.broadcast_exit(&req.session_id, &session, None);
                Ok(json!({}))
            }
            request_type::LIST_SESSIONS => {
                let inner = self.inner.lock().await;
                let sessions = inner.sessions.list();
                Ok(serde_json::to_value(ListSessionsResponse { sessions })?)
            }
            request_type::SHUTDOWN => {
                let req: ShutdownRequest = if request.payload.is_null() {
                    ShutdownRequest::default()
                } else {
                    parse_payload(&request.kind, request.payload)?
                };
                tracing::info!(client_id = %client_id, kill_sessions = req.kill_sessions, "Shutdown requested");
                self.begin_shutdown(req.kill_sessions);
                Ok(json!({}))
            }
            other => Err(HostError::UnknownRequest(other.to_string())),
        }
    }

    async fn hello(&self, conn: &mut Connection, payload: &Value) -> Result<Value, HostError> {
        let token = payload
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| HostError::InvalidHello("missing token".to_string()))?;
        let version = payload
            .get("protocolVersion")
            .and_then(Value::as_u64)
            .ok_or_else(|| HostError::InvalidHello("missing protocolVersion".to_string()))?;
        let client_id = payload
            .get("clientId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HostError::InvalidHello("missing clientId".to_string()))?;
        let role = payload
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| HostError::InvalidHello("missing role".to_string()))?;

        if version != u64::from(PROTOCOL_VERSION) {
            return Err(HostError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }
        if token != self.token {
            tracing::warn!(client_id, "Rejected hello with bad token");
            return Err(HostError::AuthFailed);
        }
        let role: SocketRole = role.parse().map_err(HostError::InvalidRole)?;

        let mut inner = self.inner.lock().await;
        if let Some((previous_client, previous_role)) = conn.auth.take() {
            inner.release_socket(conn.id, &previous_client, previous_role);
        }
        let sockets = inner.clients.entry(client_id.to_string()).or_default();
        *sockets.slot(role) = Some(SocketHandle {
            conn_id: conn.id,
            tx: conn.tx.clone(),
        });
        conn.auth = Some((client_id.to_string(), role));
        tracing::debug!(client_id, %role, "Socket authenticated");

        Ok(serde_json::to_value(HelloResponse {
            protocol_version: PROTOCOL_VERSION,
            daemon_pid: std::process::id(),
        })?)
    }

    async fn create_or_attach(
        self: &Arc<Self>,
        client_id: &str,
        request: CreateOrAttachRequest,
    ) -> Result<Value, HostError> {
        let session_id = request.session_id.clone();
        let mut inner = self.inner.lock().await;

        let has_stream = inner
            .clients
            .get(client_id)
            .map(|c| c.stream.is_some())
            .unwrap_or(false);
        if !has_stream {
            return Err(HostError::StreamNotConnected(client_id.to_string()));
        }

        let outcome = inner.sessions.create_or_attach(client_id, request)?;
        drop(inner);

        if let Some(spawned) = outcome.spawned {
            tokio::spawn(pump_session(Arc::clone(self), session_id, spawned));
        }
        Ok(serde_json::to_value(outcome.response)?)
    }

    /// Tear down after the acknowledgement has had time to flush
    pub fn begin_shutdown(self: &Arc<Self>, kill_sessions: bool) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_ACK_DELAY).await;
            if kill_sessions {
                let mut inner = state.inner.lock().await;
                for (session_id, session) in inner.sessions.kill_all() {
                    inner.broadcast_exit(&session_id, &session, None);
                }
            }
            state.shutdown.send_replace(true);
        });
    }

    async fn connection_closed(&self, conn: &Connection) {
        if let Some((client_id, role)) = &conn.auth {
            let mut inner = self.inner.lock().await;
            inner.release_socket(conn.id, client_id, *role);
        }
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}

fn parse_payload<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, HostError> {
    serde_json::from_value(payload)
        .map_err(|e| HostError::Internal(format!("Invalid {} payload: {}", kind, e)))
}

fn event_bytes<P: Serialize>(
    event: EventKind,
    session_id: &str,
    payload: &P,
) -> Result<Vec<u8>, serde_json::Error> {
    encode_frame(&EventFrame::new(event, session_id, payload)?)
}

/// Forward a session's PTY events to its attached clients, in order
async fn pump_session(state: Arc<HostState>, session_id: String, spawned: SpawnedSession) {
    let SpawnedSession {
        instance,
        mut events,
    } = spawned;

    while let Some(event) = events.recv().await {
        match event {
            PtyEvent::Output { data, end_seq } => {
                let mut inner = state.inner.lock().await;
                let recipients = inner.sessions.recipients(&session_id, instance, end_seq);
                if recipients.is_empty() {
                    continue;
                }
                let payload = DataEvent {
                    data: String::from_utf8_lossy(&data).into_owned(),
                    seq: end_seq,
                };
                match event_bytes(EventKind::Data, &session_id, &payload) {
                    Ok(bytes) => {
                        for client_id in &recipients {
                            inner.send_stream(client_id, &bytes);
                        }
                    }
                    Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Failed to encode data event"),
                }
            }
            PtyEvent::Exited { exit_code } => {
                let mut inner = state.inner.lock().await;
                if let Some(session) = inner.sessions.remove_exited(&session_id, instance) {
                    tracing::info!(session_id = %session_id, exit_code = ?exit_code, "Session exited");
                    inner.broadcast_exit(&session_id, &session, exit_code);
                }
                break;
            }
        }
    }
}

async fn serve_connection(state: Arc<HostState>, stream: UnixStream) {
    let (mut reader, mut writer) = stream.into_split();
    let (mut conn, mut outbound) = state.open_connection();
    let tx = conn.tx.clone();

    let writer_task = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Frame(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => break,
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut shutdown = state.shutdown.subscribe();

    'read: loop {
        let n = tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "Connection read failed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        };

        for value in decoder.push(&buf[..n]) {
            // Frames without an id cannot be answered
            let Ok(request) = serde_json::from_value::<RequestFrame>(value) else {
                continue;
            };
            let reply = state.handle_request(&mut conn, request).await;
            match encode_frame(&reply.response) {
                Ok(bytes) => {
                    let _ = tx.send(Outbound::Frame(bytes));
                }
                Err(e) => tracing::warn!(error = %e, "Failed to encode response"),
            }
            if reply.close {
                let _ = tx.send(Outbound::Close);
                break 'read;
            }
        }
    }

    state.connection_closed(&conn).await;
    drop(conn);
    drop(tx);
    let _ = writer_task.await;
}

// ============================================================================
// Daemon lifecycle
// ============================================================================

/// Requests a graceful stop of a running [`HostServer`]
#[derive(Clone)]
pub struct ShutdownHandle {
    state: Arc<HostState>,
}

impl ShutdownHandle {
    pub fn shutdown(&self, kill_sessions: bool) {
        self.state.begin_shutdown(kill_sessions);
    }
}

/// A bound, not yet running daemon
pub struct HostServer {
    config: Config,
    state: Arc<HostState>,
    listener: UnixListener,
    /// Exclusive lock on the PID file, held for the daemon lifetime
    _pid_lock: std::fs::File,
}

impl HostServer {
    /// Claim the home directory and bind the socket
    pub async fn bind(config: Config) -> Result<Self> {
        Self::bind_with_replay_cap(config, DEFAULT_REPLAY_CAP).await
    }

    pub async fn bind_with_replay_cap(config: Config, replay_cap: usize) -> Result<Self> {
        config
            .ensure_dirs()
            .with_context(|| format!("Failed to create {}", config.home_dir.display()))?;

        clear_stale_socket(&config).await?;
        let pid_lock = acquire_pid_lock(&config)?;
        let token = config.ensure_token().context("Failed to create token file")?;

        let listener = UnixListener::bind(&config.socket_path)
            .with_context(|| format!("Failed to bind socket: {}", config.socket_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| {
                    format!(
                        "Failed to set socket permissions: {}",
                        config.socket_path.display()
                    )
                })?;
        }

        tracing::info!(
            socket = %config.socket_path.display(),
            pid = std::process::id(),
            "Terminal host listening"
        );

        Ok(Self {
            config,
            state: HostState::new(token, replay_cap),
            listener,
            _pid_lock: pid_lock,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Accept connections until shut down, then remove the socket and PID file
    pub async fn run(self) -> Result<()> {
        let mut shutdown = self.state.shutdown.subscribe();

        while !*shutdown.borrow() {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            tokio::spawn(serve_connection(Arc::clone(&self.state), stream));
                        }
                        Err(e) => tracing::warn!(error = %e, "Accept failed"),
                    }
                }
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!("Terminal host shutting down");
        drop(self.listener);
        self.config.remove_socket().ok();
        self.config.remove_pid().ok();
        Ok(())
    }
}

/// Unlink a socket nobody answers on; refuse to start if somebody does
async fn clear_stale_socket(config: &Config) -> Result<()> {
    if std::fs::symlink_metadata(&config.socket_path).is_err() {
        return Ok(());
    }

    let probe = tokio::time::timeout(
        STALE_SOCKET_PROBE_TIMEOUT,
        UnixStream::connect(&config.socket_path),
    )
    .await;

    if let Ok(Ok(_)) = probe {
        anyhow::bail!(
            "Terminal host already running on {}",
            config.socket_path.display()
        );
    }

    tracing::warn!(socket = %config.socket_path.display(), "Removing stale socket");
    config
        .remove_socket()
        .context("Failed to remove stale socket")
}

fn acquire_pid_lock(config: &Config) -> Result<std::fs::File> {
    use fs2::FileExt;
    use std::io::Write;

    if let Some(pid) = config.read_pid() {
        if pid != std::process::id() && !process_alive(pid) {
            tracing::info!(pid, "Removing stale PID file");
            config.remove_pid().context("Failed to remove stale PID file")?;
        }
    }

    let mut options = std::fs::OpenOptions::new();
    options.read(true).write(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(&config.pid_file)
        .with_context(|| format!("Failed to open {}", config.pid_file.display()))?;
    file.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!(
            "Another terminal host holds {} (PID {:?})",
            config.pid_file.display(),
            config.read_pid()
        )
    })?;

    file.set_len(0)?;
    file.write_all(std::process::id().to_string().as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "test-token";

    fn request(id: &str, kind: &str, payload: Value) -> RequestFrame {
        RequestFrame {
            id: id.to_string(),
            kind: kind.to_string(),
            payload,
        }
    }

    fn hello(client_id: &str, role: &str) -> RequestFrame {
        request(
            "h",
            request_type::HELLO,
            json!({
                "token": TOKEN,
                "protocolVersion": PROTOCOL_VERSION,
                "clientId": client_id,
                "role": role,
            }),
        )
    }

    fn error_code(reply: &Reply) -> Option<ErrorCode> {
        reply.response.error.as_ref().map(|e| e.code)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Value {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Outbound::Frame(bytes))) => serde_json::from_slice(&bytes).unwrap(),
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_requests_before_hello_are_rejected() {
        let state = HostState::new(TOKEN, 1024);
        let (mut conn, _rx) = state.open_connection();

        let reply = state
            .handle_request(&mut conn, request("1", request_type::LIST_SESSIONS, Value::Null))
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::NotAuthenticated));
        assert!(!reply.close);

        // Unknown types are still gated by authentication
        let reply = state
            .handle_request(&mut conn, request("2", "teleport", Value::Null))
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_hello_failures_close_connection() {
        let state = HostState::new(TOKEN, 1024);

        let cases = [
            (
                json!({"token": "nope", "protocolVersion": 1, "clientId": "c", "role": "control"}),
                ErrorCode::AuthFailed,
            ),
            (
                json!({"token": TOKEN, "protocolVersion": 2, "clientId": "c", "role": "control"}),
                ErrorCode::ProtocolMismatch,
            ),
            (
                json!({"token": TOKEN, "protocolVersion": 1, "role": "control"}),
                ErrorCode::InvalidHello,
            ),
            (
                json!({"token": TOKEN, "protocolVersion": 1, "clientId": "c", "role": "admin"}),
                ErrorCode::InvalidRole,
            ),
        ];

        for (payload, expected) in cases {
            let (mut conn, _rx) = state.open_connection();
            let reply = state
                .handle_request(&mut conn, request("h", request_type::HELLO, payload))
                .await;
            assert_eq!(error_code(&reply), Some(expected));
            assert!(reply.close);
            assert!(conn.client_id().is_none());
        }
    }

    #[tokio::test]
    async fn test_hello_reports_protocol_and_pid() {
        let state = HostState::new(TOKEN, 1024);
        let (mut conn, _rx) = state.open_connection();
        let reply = state.handle_request(&mut conn, hello("c1", "control")).await;

        assert!(reply.response.ok);
        let payload = reply.response.payload.unwrap();
        assert_eq!(payload["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(payload["daemonPid"], std::process::id());
        assert_eq!(conn.client_id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_stream_socket_only_accepts_hello() {
        let state = HostState::new(TOKEN, 1024);
        let (mut conn, _rx) = state.open_connection();
        state.handle_request(&mut conn, hello("c1", "stream")).await;

        let reply = state
            .handle_request(&mut conn, request("1", request_type::LIST_SESSIONS, Value::Null))
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::InvalidRole));
    }

    #[tokio::test]
    async fn test_unknown_request_type() {
        let state = HostState::new(TOKEN, 1024);
        let (mut conn, _rx) = state.open_connection();
        state.handle_request(&mut conn, hello("c1", "control")).await;

        let reply = state
            .handle_request(&mut conn, request("9", "teleport", json!({})))
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::UnknownRequest));
        assert_eq!(reply.response.id, "9");
    }

    #[tokio::test]
    async fn test_create_requires_stream_socket() {
        let state = HostState::new(TOKEN, 1024);
        let (mut conn, _rx) = state.open_connection();
        state.handle_request(&mut conn, hello("c1", "control")).await;

        let reply = state
            .handle_request(
                &mut conn,
                request(
                    "1",
                    request_type::CREATE_OR_ATTACH,
                    json!({"sessionId": "s1", "workspaceId": "w1", "cwd": "/", "cols": 80, "rows": 24}),
                ),
            )
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::StreamNotConnected));
        assert_eq!(state.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_session_is_internal_error() {
        let state = HostState::new(TOKEN, 1024);
        let (mut conn, _rx) = state.open_connection();
        state.handle_request(&mut conn, hello("c1", "control")).await;

        let reply = state
            .handle_request(
                &mut conn,
                request("1", request_type::WRITE, json!({"sessionId": "ghost", "data": "x"})),
            )
            .await;
        assert_eq!(error_code(&reply), Some(ErrorCode::InternalError));
        assert!(reply.response.error.unwrap().message.contains("ghost"));
    }

    #[tokio::test]
    async fn test_session_output_and_kill_reach_stream() {
        let state = HostState::new(TOKEN, 64 * 1024);
        let (mut control, _control_rx) = state.open_connection();
        let (mut stream, mut stream_rx) = state.open_connection();
        state.handle_request(&mut control, hello("c1", "control")).await;
        state.handle_request(&mut stream, hello("c1", "stream")).await;

        let reply = state
            .handle_request(
                &mut control,
                request(
                    "1",
                    request_type::CREATE_OR_ATTACH,
                    json!({
                        "sessionId": "s1",
                        "workspaceId": "w1",
                        "cwd": std::env::temp_dir(),
                        "cols": 80,
                        "rows": 24,
                        "shell": "sh",
                        "args": ["-c", "echo from-pty; sleep 30"],
                    }),
                ),
            )
            .await;
        assert!(reply.response.ok, "{:?}", reply.response.error);
        assert_eq!(reply.response.payload.as_ref().unwrap()["isNew"], true);

        let mut seen = String::new();
        while !seen.contains("from-pty") {
            let event = next_event(&mut stream_rx).await;
            assert_eq!(event["event"], "data");
            assert_eq!(event["sessionId"], "s1");
            seen.push_str(event["payload"]["data"].as_str().unwrap());
        }

        let reply = state
            .handle_request(&mut control, request("2", request_type::KILL, json!({"sessionId": "s1"})))
            .await;
        assert!(reply.response.ok);

        loop {
            let event = next_event(&mut stream_rx).await;
            if event["event"] == "exit" {
                assert_eq!(event["sessionId"], "s1");
                break;
            }
        }

        let reply = state
            .handle_request(&mut control, request("3", request_type::LIST_SESSIONS, Value::Null))
            .await;
        let sessions = &reply.response.payload.unwrap()["sessions"];
        assert_eq!(sessions.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_detaches_client() {
        let state = HostState::new(TOKEN, 1024);
        let (mut control, _crx) = state.open_connection();
        let (mut stream, _srx) = state.open_connection();
        state.handle_request(&mut control, hello("c1", "control")).await;
        state.handle_request(&mut stream, hello("c1", "stream")).await;

        let reply = state
            .handle_request(
                &mut control,
                request(
                    "1",
                    request_type::CREATE_OR_ATTACH,
                    json!({"sessionId": "s1", "workspaceId": "w1", "cwd": "", "cols": 80, "rows": 24,
                           "shell": "sh", "args": ["-c", "sleep 30"]}),
                ),
            )
            .await;
        assert!(reply.response.ok);

        state.connection_closed(&stream).await;
        state.connection_closed(&control).await;

        let inner = state.inner.lock().await;
        assert!(inner.clients.is_empty());
        assert_eq!(inner.sessions.list()[0].attached_clients, 0);
    }

    /// Beyond any kernel pid_max, so never a live process
    const DEAD_PID: u32 = 2_000_000_000;

    fn temp_config() -> (tempfile::TempDir, Config) {
        let temp = tempfile::TempDir::new().unwrap();
        let config = Config::for_home(temp.path().join("home"));
        (temp, config)
    }

    #[tokio::test]
    async fn test_bind_replaces_leftover_socket() {
        let (_temp, config) = temp_config();
        config.ensure_dirs().unwrap();
        drop(std::os::unix::net::UnixListener::bind(&config.socket_path).unwrap());
        assert!(config.socket_ready());

        let server = HostServer::bind(config.clone()).await.unwrap();
        assert!(config.socket_ready());
        UnixStream::connect(&config.socket_path).await.unwrap();
        assert_eq!(config.read_pid(), Some(std::process::id()));
        drop(server);
    }

    #[tokio::test]
    async fn test_bind_refuses_live_daemon_and_held_pid_lock() {
        let (_temp, config) = temp_config();
        let _first = HostServer::bind(config.clone()).await.unwrap();

        let err = HostServer::bind(config.clone()).await.err().unwrap();
        assert!(err.to_string().contains("already running"), "{err}");

        // Without a socket to answer, the PID file lock still refuses
        std::fs::remove_file(&config.socket_path).unwrap();
        let err = HostServer::bind(config.clone()).await.err().unwrap();
        assert!(err.to_string().contains("Another terminal host"), "{err}");
        assert_eq!(config.read_pid(), Some(std::process::id()));
    }

    #[tokio::test]
    async fn test_bind_removes_stale_pid_file() {
        let (_temp, config) = temp_config();
        config.ensure_dirs().unwrap();
        std::fs::write(&config.pid_file, DEAD_PID.to_string()).unwrap();

        let _server = HostServer::bind(config.clone()).await.unwrap();
        assert_eq!(config.read_pid(), Some(std::process::id()));
        assert!(config.socket_ready());
    }
}
