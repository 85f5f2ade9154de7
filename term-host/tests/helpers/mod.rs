// Shared fixtures for integration tests

#![allow(dead_code)]

mod polling;
pub use polling::{wait_for, wait_for_value};

use agent_term_host::session::client::{ClientOptions, DaemonLauncher, HostClient};
use agent_term_host::session::config::Config;
use agent_term_host::session::protocol::{encode_frame, FrameDecoder, PROTOCOL_VERSION};
use agent_term_host::session::server::{HostServer, ShutdownHandle};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

/// RAII guard around a daemon running inside the test process
pub struct HostGuard {
    pub config: Config,
    handle: ShutdownHandle,
    task: JoinHandle<anyhow::Result<()>>,
    _home: TempDir,
}

impl HostGuard {
    pub async fn start() -> Self {
        let home = TempDir::new().expect("temp home");
        let config = Config::for_home(home.path());
        let server = HostServer::bind(config.clone())
            .await
            .expect("bind terminal host");
        let handle = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        Self {
            config,
            handle,
            task,
            _home: home,
        }
    }

    /// Client that never spawns a daemon of its own
    pub fn client(&self) -> HostClient {
        HostClient::new(
            self.config.clone(),
            ClientOptions {
                launcher: DaemonLauncher::Never,
                request_timeout: WAIT,
                startup_timeout: Duration::from_millis(500),
            },
        )
    }

    pub fn token(&self) -> String {
        self.config.read_token().expect("token written by daemon")
    }
}

impl Drop for HostGuard {
    fn drop(&mut self) {
        self.handle.shutdown(true);
        self.task.abort();
    }
}

/// Raw protocol connection for exercising error paths
pub struct RawConn {
    stream: UnixStream,
    decoder: FrameDecoder,
    queued: VecDeque<Value>,
    next_id: u64,
}

impl RawConn {
    pub async fn connect(config: &Config) -> Self {
        let stream = UnixStream::connect(&config.socket_path)
            .await
            .expect("connect to host socket");
        Self {
            stream,
            decoder: FrameDecoder::new(),
            queued: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Send a request and wait for its response frame
    pub async fn request(&mut self, kind: &str, payload: Value) -> Value {
        let id = format!("raw-{}", self.next_id);
        self.next_id += 1;
        let frame = json!({ "id": id, "type": kind, "payload": payload });
        self.stream
            .write_all(&encode_frame(&frame).expect("encode"))
            .await
            .expect("write frame");

        loop {
            let frame = self.next_frame().await.expect("connection closed before response");
            if frame.get("id").and_then(Value::as_str) == Some(id.as_str()) {
                return frame;
            }
        }
    }

    /// Write bytes as-is, bypassing frame encoding
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write raw bytes");
    }

    pub async fn hello(&mut self, token: &str, client_id: &str, role: &str) -> Value {
        self.request(
            "hello",
            json!({
                "token": token,
                "protocolVersion": PROTOCOL_VERSION,
                "clientId": client_id,
                "role": role,
            }),
        )
        .await
    }

    /// Next decoded frame, or `None` once the daemon closes the socket
    pub async fn next_frame(&mut self) -> Option<Value> {
        let mut buf = vec![0u8; 8192];
        loop {
            if let Some(frame) = self.queued.pop_front() {
                return Some(frame);
            }
            let n = tokio::time::timeout(WAIT, self.stream.read(&mut buf))
                .await
                .expect("timed out reading frame")
                .ok()?;
            if n == 0 {
                return None;
            }
            self.queued.extend(self.decoder.push(&buf[..n]));
        }
    }
}

pub fn error_code(response: &Value) -> Option<&str> {
    response
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
}
