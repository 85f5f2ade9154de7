// Session host protocol - shared frames for daemon <-> client communication
// Newline-delimited JSON over Unix sockets

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Exchanged in `hello`; any mismatch is a hard authentication failure
pub const PROTOCOL_VERSION: u32 = 1;

/// Lines longer than this are dropped by the decoder instead of parsed
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Stable session identifier supplied by the caller
pub type SessionId = String;

/// Role a socket plays for a logical client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketRole {
    /// Carries requests and their responses
    Control,
    /// Receives server-pushed session events
    Stream,
}

impl std::fmt::Display for SocketRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketRole::Control => write!(f, "control"),
            SocketRole::Stream => write!(f, "stream"),
        }
    }
}

impl std::str::FromStr for SocketRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => Ok(SocketRole::Control),
            "stream" => Ok(SocketRole::Stream),
            _ => Err(format!("Unknown socket role: {}", s)),
        }
    }
}

/// Error codes carried in `{ok: false, error: {code, message}}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProtocolMismatch,
    AuthFailed,
    InvalidHello,
    NotAuthenticated,
    InvalidRole,
    StreamNotConnected,
    UnknownRequest,
    InternalError,
}

// ============================================================================
// Envelopes
// ============================================================================

/// Client -> daemon request envelope
///
/// The payload stays untyped until the `type` is dispatched so that an
/// unknown type can still be answered with the request's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Daemon -> client response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Kind of server-pushed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Data,
    Exit,
    Error,
}

/// Daemon -> client push frame, always `type: "event"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub frame_type: EventTag,
    pub event: EventKind,
    pub session_id: SessionId,
    pub payload: Value,
}

/// Literal `"event"` discriminator for [`EventFrame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTag {
    Event,
}

impl EventFrame {
    pub fn new<P: Serialize>(
        event: EventKind,
        session_id: &str,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            frame_type: EventTag::Event,
            event,
            session_id: session_id.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

/// Anything the daemon can send, as seen by a client
#[derive(Debug, Clone)]
pub enum ServerFrame {
    Response(ResponseFrame),
    Event(EventFrame),
}

impl ServerFrame {
    /// Classify a decoded line; frames that fit neither shape yield `None`
    pub fn from_value(value: Value) -> Option<Self> {
        let is_event = value.get("type").and_then(Value::as_str) == Some("event");
        if is_event {
            serde_json::from_value(value).ok().map(ServerFrame::Event)
        } else {
            serde_json::from_value(value).ok().map(ServerFrame::Response)
        }
    }
}

// ============================================================================
// Request / response payloads
// ============================================================================

/// Request type names as they appear on the wire
pub mod request_type {
    pub const HELLO: &str = "hello";
    pub const CREATE_OR_ATTACH: &str = "createOrAttach";
    pub const WRITE: &str = "write";
    pub const RESIZE: &str = "resize";
    pub const DETACH: &str = "detach";
    pub const KILL: &str = "kill";
    pub const LIST_SESSIONS: &str = "listSessions";
    pub const SHUTDOWN: &str = "shutdown";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRequest {
    pub token: String,
    pub protocol_version: u32,
    pub client_id: String,
    pub role: SocketRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResponse {
    pub protocol_version: u32,
    pub daemon_pid: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrAttachRequest {
    pub session_id: SessionId,
    pub workspace_id: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    /// Program to run; defaults to `$SHELL`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_login_shell: Option<bool>,
    /// Replay offset already applied by the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub snapshot_ansi: String,
    pub cols: u16,
    pub rows: u16,
    pub base_seq: u64,
    pub end_seq: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrAttachResponse {
    pub is_new: bool,
    pub snapshot: Snapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub session_id: SessionId,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub session_id: SessionId,
    pub cols: u16,
    pub rows: u16,
}

/// Payload for requests that only name a session (`detach`, `kill`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownRequest {
    #[serde(default)]
    pub kill_sessions: bool,
}

/// Diagnostic view of a hosted session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub output_seq: u64,
    pub attached_clients: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

// ============================================================================
// Event payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataEvent {
    pub data: String,
    /// Value of the session's `outputSeq` after this chunk
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub message: String,
}

// ============================================================================
// Framing
// ============================================================================

/// Serialize a frame to JSON bytes with newline delimiter
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Streaming decoder for newline-delimited JSON
///
/// Partial writes accumulate until a newline arrives. Malformed, empty and
/// oversized lines are dropped without failing the connection.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Set while skipping the remainder of an oversized line
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Value> {
        let mut frames = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                self.buffer.clear();
                continue;
            }

            self.buffer.extend_from_slice(head);
            let line = std::mem::take(&mut self.buffer);
            if line.len() > MAX_FRAME_SIZE {
                continue;
            }
            if let Some(value) = parse_line(&line) {
                frames.push(value);
            }
        }

        if !self.discarding {
            self.buffer.extend_from_slice(rest);
            if self.buffer.len() > MAX_FRAME_SIZE {
                self.buffer.clear();
                self.discarding = true;
            }
        }

        frames
    }

    /// Bytes held waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_line(line: &[u8]) -> Option<Value> {
    let trimmed = line.strip_suffix(b"\r").unwrap_or(line);
    if trimmed.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match serde_json::from_slice::<Value>(trimmed) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decoder_yields_frames_across_partial_writes() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(br#"{"id":"1","ty"#).is_empty());
        let frames = decoder.push(b"pe\":\"hello\"}\n{\"id\":\"2\"");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "hello");
        assert_eq!(decoder.pending(), 9);

        let frames = decoder.push(b",\"type\":\"kill\"}\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], "2");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_skips_malformed_lines() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"not json\n\n[1,2]\n{\"id\":\"ok\"}\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], "ok");
    }

    #[test]
    fn decoder_drops_oversized_line_and_recovers() {
        let mut decoder = FrameDecoder::new();
        let huge = vec![b'x'; MAX_FRAME_SIZE + 10];
        assert!(decoder.push(&huge).is_empty());
        assert_eq!(decoder.pending(), 0);
        let frames = decoder.push(b"still junk\n{\"id\":\"after\"}\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], "after");
    }

    #[test]
    fn request_frame_keeps_unknown_types() {
        let raw = json!({"id": "7", "type": "teleport", "payload": {"x": 1}});
        let frame: RequestFrame = serde_json::from_value(raw).unwrap();
        assert_eq!(frame.id, "7");
        assert_eq!(frame.kind, "teleport");
        assert_eq!(frame.payload["x"], 1);
    }

    #[test]
    fn request_without_payload_defaults_to_null() {
        let frame: RequestFrame =
            serde_json::from_value(json!({"id": "1", "type": "listSessions"})).unwrap();
        assert!(frame.payload.is_null());
    }

    #[test]
    fn error_response_serializes_code_in_screaming_case() {
        let frame = ResponseFrame::failure("9", ErrorCode::StreamNotConnected, "no stream");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "STREAM_NOT_CONNECTED");
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn event_frame_shape() {
        let frame = EventFrame::new(
            EventKind::Data,
            "s1",
            &DataEvent {
                data: "hi".to_string(),
                seq: 2,
            },
        )
        .unwrap();
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"], "data");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["payload"]["seq"], 2);
    }

    #[test]
    fn server_frame_classifies_events_and_responses() {
        let event = json!({"type": "event", "event": "exit", "sessionId": "s", "payload": {}});
        assert!(matches!(
            ServerFrame::from_value(event),
            Some(ServerFrame::Event(_))
        ));

        let response = json!({"id": "1", "ok": true, "payload": {"sessions": []}});
        assert!(matches!(
            ServerFrame::from_value(response),
            Some(ServerFrame::Response(_))
        ));

        assert!(ServerFrame::from_value(json!({"hello": "world"})).is_none());
    }

    #[test]
    fn hello_uses_camel_case() {
        let hello: HelloRequest = serde_json::from_value(json!({
            "token": "t",
            "protocolVersion": 1,
            "clientId": "c",
            "role": "stream"
        }))
        .unwrap();
        assert_eq!(hello.role, SocketRole::Stream);
        assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn socket_role_roundtrip() {
        for role in [SocketRole::Control, SocketRole::Stream] {
            let parsed: SocketRole = role.to_string().parse().unwrap();
            assert_eq!(parsed, role);
        }
    }
}
