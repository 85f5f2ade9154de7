// Host client - runs inside the GUI process
//
// Lazily starts the daemon, connects a control and a stream socket, and
// exposes request/response calls plus a broadcast of pushed session events.
// There is no reconnect logic: a closed socket or a timed out request fails
// every pending request and publishes `ClientEvent::Disconnected`; the next
// call reconnects.

use crate::cli_paths::resolve_daemon_path;
use crate::session::config::Config;
use crate::session::protocol::{
    encode_frame, request_type, CreateOrAttachRequest, CreateOrAttachResponse, DataEvent,
    ErrorCode, ErrorEvent, EventKind, ExitEvent, FrameDecoder, HelloRequest,
    ListSessionsResponse, RequestFrame, ResizeRequest, ServerFrame, SessionId, SessionInfo,
    SessionRequest, ShutdownRequest, SocketRole, WriteRequest, PROTOCOL_VERSION,
};
use crate::session::spawn_lock::{SpawnLock, SPAWN_LOCK_EXPIRY};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::AbortHandle;

/// Per-request deadline
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a freshly spawned daemon has to create its socket
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Terminal host disconnected")]
    Disconnected,

    #[error("{code:?}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("Terminal host is not running (socket {})", .0.display())]
    NotRunning(PathBuf),

    #[error("Terminal host token missing at {}", .0.display())]
    MissingToken(PathBuf),

    #[error("Failed to spawn terminal host daemon {daemon} (home {}): {source}", .home.display())]
    Spawn {
        home: PathBuf,
        daemon: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Terminal host did not start within {timeout:?} (home {}, daemon {daemon}, socket {})",
        .home.display(),
        .socket.display()
    )]
    StartupTimeout {
        timeout: Duration,
        home: PathBuf,
        daemon: String,
        socket: PathBuf,
    },

    #[error("Invalid response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Wire error code, for errors the daemon returned
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events pushed by the daemon, plus the local disconnect notification
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Data {
        session_id: SessionId,
        data: String,
        seq: u64,
    },
    Exit {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
    Error {
        session_id: SessionId,
        message: String,
    },
    Disconnected,
}

/// How to start the daemon when nobody is listening
#[derive(Debug, Clone)]
pub enum DaemonLauncher {
    /// Spawn a detached daemon; `None` resolves the binary via `cli_paths`
    Spawn { program: Option<PathBuf> },
    /// Only connect to an already running daemon
    Never,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub launcher: DaemonLauncher,
    pub request_timeout: Duration,
    pub startup_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            launcher: DaemonLauncher::Spawn { program: None },
            request_timeout: REQUEST_TIMEOUT,
            startup_timeout: STARTUP_TIMEOUT,
        }
    }
}

type PendingMap = HashMap<String, oneshot::Sender<Result<Value, ClientError>>>;

/// One connected control + stream pair
struct Link {
    id: u64,
    control: Mutex<OwnedWriteHalf>,
    /// Kept so the daemon sees the stream socket close with the link
    _stream: Mutex<OwnedWriteHalf>,
    pending: StdMutex<PendingMap>,
    readers: StdMutex<Vec<AbortHandle>>,
}

impl Link {
    fn fail_pending(&self) {
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => return,
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(ClientError::Disconnected));
        }
    }

    fn resolve(&self, id: &str, result: Result<Value, ClientError>) {
        let tx = self.pending.lock().ok().and_then(|mut p| p.remove(id));
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }
}

struct Shared {
    state: StdMutex<ConnectionState>,
    link: StdMutex<Option<Arc<Link>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.lock().ok().and_then(|l| l.clone())
    }

    /// Tear down a link if it is still the current one
    fn close_link(&self, link_id: u64) {
        let link = match self.link.lock() {
            Ok(mut current) if current.as_ref().map(|l| l.id) == Some(link_id) => current.take(),
            _ => None,
        };
        let Some(link) = link else {
            return;
        };

        self.set_state(ConnectionState::Disconnected);
        link.fail_pending();
        if let Ok(readers) = link.readers.lock() {
            for reader in readers.iter() {
                reader.abort();
            }
        }
        tracing::info!("Terminal host connection closed");
        let _ = self.events.send(ClientEvent::Disconnected);
    }
}

/// Client handle for the session host daemon
pub struct HostClient {
    config: Config,
    options: ClientOptions,
    client_id: String,
    shared: Arc<Shared>,
    connect_lock: Mutex<()>,
    next_request_id: AtomicU64,
    next_link_id: AtomicU64,
}

impl HostClient {
    pub fn new(config: Config, options: ClientOptions) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            options,
            client_id: uuid::Uuid::new_v4().to_string(),
            shared: Arc::new(Shared {
                state: StdMutex::new(ConnectionState::Disconnected),
                link: StdMutex::new(None),
                events,
            }),
            connect_lock: Mutex::new(()),
            next_request_id: AtomicU64::new(1),
            next_link_id: AtomicU64::new(1),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Receive pushed session events and disconnect notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Connect (starting the daemon if allowed) unless already connected
    pub async fn ensure_connected(&self) -> Result<(), ClientError> {
        self.link().await.map(|_| ())
    }

    async fn link(&self) -> Result<Arc<Link>, ClientError> {
        let _guard = self.connect_lock.lock().await;
        if let Some(link) = self.shared.current_link() {
            return Ok(link);
        }

        self.shared.set_state(ConnectionState::Connecting);
        match self.connect().await {
            Ok(link) => {
                if let Ok(mut current) = self.shared.link.lock() {
                    *current = Some(Arc::clone(&link));
                }
                self.shared.set_state(ConnectionState::Connected);
                tracing::debug!(client_id = %self.client_id, "Connected to terminal host");
                Ok(link)
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<Arc<Link>, ClientError> {
        if self.config.socket_ready() {
            match self.open_link().await {
                Ok(link) => return Ok(link),
                Err(e) => tracing::debug!(error = %e, "Existing socket unusable"),
            }
        }

        let program = match &self.options.launcher {
            DaemonLauncher::Never => {
                return Err(ClientError::NotRunning(self.config.socket_path.clone()))
            }
            DaemonLauncher::Spawn { program } => program.clone(),
        };

        self.config.ensure_dirs()?;
        let daemon = resolve_daemon_path(program.as_deref());
        let daemon_label = daemon
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<not found>".to_string());

        match SpawnLock::try_acquire(&self.config.spawn_lock_file, SPAWN_LOCK_EXPIRY)? {
            Some(_lock) => {
                if !self.config.socket_ready() {
                    self.spawn_daemon(daemon, &daemon_label)?;
                }
                self.wait_for_socket(&daemon_label).await?;
            }
            None => {
                tracing::debug!("Another process is starting the terminal host");
                self.wait_for_socket(&daemon_label).await?;
            }
        }

        self.open_link().await
    }

    fn spawn_daemon(&self, daemon: Option<PathBuf>, label: &str) -> Result<(), ClientError> {
        let spawn_error = |source: std::io::Error| ClientError::Spawn {
            home: self.config.home_dir.clone(),
            daemon: label.to_string(),
            source,
        };

        let daemon = daemon.ok_or_else(|| {
            spawn_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "term-host-daemon binary not found",
            ))
        })?;

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.config.log_file())
            .map_err(spawn_error)?;

        let mut command = std::process::Command::new(&daemon);
        command
            .arg("--home")
            .arg(&self.config.home_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::from(log));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(spawn_error)?;
        tracing::info!(daemon = %daemon.display(), pid = child.id(), "Spawned terminal host daemon");

        // Reap the daemon if it exits while we are still around
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }

    async fn wait_for_socket(&self, daemon_label: &str) -> Result<(), ClientError> {
        let deadline = tokio::time::Instant::now() + self.options.startup_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.config.socket_ready() {
                return Ok(());
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
        Err(ClientError::StartupTimeout {
            timeout: self.options.startup_timeout,
            home: self.config.home_dir.clone(),
            daemon: daemon_label.to_string(),
            socket: self.config.socket_path.clone(),
        })
    }

    async fn open_link(&self) -> Result<Arc<Link>, ClientError> {
        let token = self
            .config
            .read_token()
            .ok_or_else(|| ClientError::MissingToken(self.config.token_file.clone()))?;

        let (control_read, control_write, control_rest) =
            self.open_socket(&token, SocketRole::Control).await?;
        let (stream_read, stream_write, stream_rest) =
            self.open_socket(&token, SocketRole::Stream).await?;

        let link = Arc::new(Link {
            id: self.next_link_id.fetch_add(1, Ordering::SeqCst),
            control: Mutex::new(control_write),
            _stream: Mutex::new(stream_write),
            pending: StdMutex::new(HashMap::new()),
            readers: StdMutex::new(Vec::new()),
        });

        let control_task = tokio::spawn(read_loop(
            Arc::clone(&self.shared),
            Arc::clone(&link),
            control_read,
            control_rest,
        ));
        let stream_task = tokio::spawn(read_loop(
            Arc::clone(&self.shared),
            Arc::clone(&link),
            stream_read,
            stream_rest,
        ));
        if let Ok(mut readers) = link.readers.lock() {
            readers.push(control_task.abort_handle());
            readers.push(stream_task.abort_handle());
        }

        Ok(link)
    }

    /// Connect one socket and complete its `hello`
    async fn open_socket(
        &self,
        token: &str,
        role: SocketRole,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf, FrameDecoder), ClientError> {
        let stream = UnixStream::connect(&self.config.socket_path).await?;
        let (mut reader, mut writer) = stream.into_split();

        let id = self.request_id();
        let hello = RequestFrame {
            id: id.clone(),
            kind: request_type::HELLO.to_string(),
            payload: serde_json::to_value(HelloRequest {
                token: token.to_string(),
                protocol_version: PROTOCOL_VERSION,
                client_id: self.client_id.clone(),
                role,
            })
            .map_err(|e| ClientError::Protocol(e.to_string()))?,
        };
        let bytes = encode_frame(&hello).map_err(|e| ClientError::Protocol(e.to_string()))?;
        writer.write_all(&bytes).await?;

        let mut decoder = FrameDecoder::new();
        let handshake = async {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Err(ClientError::Disconnected);
                }
                for value in decoder.push(&buf[..n]) {
                    if let Some(ServerFrame::Response(response)) = ServerFrame::from_value(value) {
                        if response.id == id {
                            return response_result(response.ok, response.payload, response.error)
                                .map(|_| ());
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(self.options.request_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::Timeout(request_type::HELLO.to_string())),
        }
        Ok((reader, writer, decoder))
    }

    fn request_id(&self) -> String {
        format!(
            "{}-{}",
            &self.client_id[..8],
            self.next_request_id.fetch_add(1, Ordering::SeqCst)
        )
    }

    async fn call<P: Serialize, T: DeserializeOwned>(
        &self,
        kind: &str,
        payload: &P,
    ) -> Result<T, ClientError> {
        let link = self.link().await?;
        let id = self.request_id();
        let frame = RequestFrame {
            id: id.clone(),
            kind: kind.to_string(),
            payload: serde_json::to_value(payload).map_err(|e| ClientError::Protocol(e.to_string()))?,
        };
        let bytes = encode_frame(&frame).map_err(|e| ClientError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = link.pending.lock() {
            pending.insert(id.clone(), tx);
        }

        let written = link.control.lock().await.write_all(&bytes).await;
        if written.is_err() {
            self.shared.close_link(link.id);
            return Err(ClientError::Disconnected);
        }

        let value = match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(ClientError::Disconnected),
            Err(_) => {
                tracing::warn!(request = kind, "Terminal host request timed out");
                self.shared.close_link(link.id);
                return Err(ClientError::Timeout(kind.to_string()));
            }
        };

        serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("{} response: {}", kind, e)))
    }

    pub async fn create_or_attach(
        &self,
        request: CreateOrAttachRequest,
    ) -> Result<CreateOrAttachResponse, ClientError> {
        self.call(request_type::CREATE_OR_ATTACH, &request).await
    }

    pub async fn write(&self, session_id: &str, data: &str) -> Result<(), ClientError> {
        let request = WriteRequest {
            session_id: session_id.to_string(),
            data: data.to_string(),
        };
        self.call::<_, Value>(request_type::WRITE, &request).await.map(|_| ())
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), ClientError> {
        let request = ResizeRequest {
            session_id: session_id.to_string(),
            cols,
            rows,
        };
        self.call::<_, Value>(request_type::RESIZE, &request).await.map(|_| ())
    }

    pub async fn detach(&self, session_id: &str) -> Result<(), ClientError> {
        let request = SessionRequest {
            session_id: session_id.to_string(),
        };
        self.call::<_, Value>(request_type::DETACH, &request).await.map(|_| ())
    }

    pub async fn kill(&self, session_id: &str) -> Result<(), ClientError> {
        let request = SessionRequest {
            session_id: session_id.to_string(),
        };
        self.call::<_, Value>(request_type::KILL, &request).await.map(|_| ())
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ClientError> {
        let response: ListSessionsResponse =
            self.call(request_type::LIST_SESSIONS, &Value::Null).await?;
        Ok(response.sessions)
    }

    /// Ask the daemon to exit; it acknowledges before going away
    pub async fn shutdown(&self, kill_sessions: bool) -> Result<(), ClientError> {
        let request = ShutdownRequest { kill_sessions };
        self.call::<_, Value>(request_type::SHUTDOWN, &request).await.map(|_| ())
    }

    /// Close both sockets and fail anything still pending
    pub fn dispose(&self) {
        if let Some(link) = self.shared.current_link() {
            self.shared.close_link(link.id);
        }
    }
}

impl Drop for HostClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn response_result(
    ok: bool,
    payload: Option<Value>,
    error: Option<crate::session::protocol::ErrorBody>,
) -> Result<Value, ClientError> {
    if ok {
        return Ok(payload.unwrap_or(Value::Null));
    }
    Err(match error {
        Some(body) => ClientError::Remote {
            code: body.code,
            message: body.message,
        },
        None => ClientError::Protocol("error response without body".to_string()),
    })
}

fn client_event(event: EventKind, session_id: SessionId, payload: Value) -> Option<ClientEvent> {
    match event {
        EventKind::Data => {
            let data: DataEvent = serde_json::from_value(payload).ok()?;
            Some(ClientEvent::Data {
                session_id,
                data: data.data,
                seq: data.seq,
            })
        }
        EventKind::Exit => {
            let exit: ExitEvent = serde_json::from_value(payload).unwrap_or(ExitEvent { exit_code: None });
            Some(ClientEvent::Exit {
                session_id,
                exit_code: exit.exit_code,
            })
        }
        EventKind::Error => {
            let error: ErrorEvent = serde_json::from_value(payload).ok()?;
            Some(ClientEvent::Error {
                session_id,
                message: error.message,
            })
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    link: Arc<Link>,
    mut reader: OwnedReadHalf,
    mut decoder: FrameDecoder,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "Terminal host socket read failed");
                break;
            }
        };

        for value in decoder.push(&buf[..n]) {
            match ServerFrame::from_value(value) {
                Some(ServerFrame::Response(response)) => {
                    let result = response_result(response.ok, response.payload, response.error);
                    link.resolve(&response.id, result);
                }
                Some(ServerFrame::Event(event)) => {
                    if let Some(event) = client_event(event.event, event.session_id, event.payload) {
                        let _ = shared.events.send(event);
                    }
                }
                None => {}
            }
        }
    }
    shared.close_link(link.id);
}
