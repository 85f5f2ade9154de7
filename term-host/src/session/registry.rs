// Hosted PTY sessions owned by the daemon
//
// Sessions are keyed by the caller-supplied id and outlive any particular
// client. Each attached client carries the replay offset it was handed so
// broadcast output it already saw in a snapshot is never sent twice.

use crate::session::protocol::{
    CreateOrAttachRequest, CreateOrAttachResponse, SessionId, SessionInfo, Snapshot,
};
use crate::session::replay::DEFAULT_REPLAY_CAP;
use crate::session::runtime::{PtyEvent, PtyRuntime, SpawnConfig};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;

/// Exported to every hosted child
pub const SESSION_ID_ENV: &str = "TERM_HOST_SESSION_ID";
pub const WORKSPACE_ID_ENV: &str = "TERM_HOST_WORKSPACE_ID";

pub type ClientId = String;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Invalid session id")]
    InvalidSessionId,

    #[error("Failed to spawn session {session_id}: {message}")]
    Spawn {
        session_id: SessionId,
        message: String,
    },
}

/// A PTY plus the bookkeeping the daemon keeps for it
pub struct HostedSession {
    /// Distinguishes a session from a later one reusing the same id
    pub instance: u64,
    pub workspace_id: String,
    runtime: PtyRuntime,
    created_at: DateTime<Utc>,
    /// Attached client -> last output seq already delivered to it
    attached: HashMap<ClientId, u64>,
}

impl HostedSession {
    pub fn attached_clients(&self) -> impl Iterator<Item = &ClientId> {
        self.attached.keys()
    }

    fn info(&self, session_id: &str) -> SessionInfo {
        let (cols, rows) = self.runtime.size();
        SessionInfo {
            session_id: session_id.to_string(),
            workspace_id: self.workspace_id.clone(),
            pid: self.runtime.pid(),
            cols,
            rows,
            output_seq: self.runtime.output_seq(),
            attached_clients: self.attached.len(),
            created_at: self.created_at,
        }
    }

    fn snapshot(&self, since_seq: Option<u64>) -> Snapshot {
        let replay = self.runtime.replay_since(since_seq);
        let (cols, rows) = self.runtime.size();
        Snapshot {
            snapshot_ansi: String::from_utf8_lossy(&replay.data).into_owned(),
            cols,
            rows,
            base_seq: replay.base_seq,
            end_seq: replay.end_seq,
            truncated: replay.truncated,
        }
    }
}

/// Result of `create_or_attach`
pub struct AttachOutcome {
    pub response: CreateOrAttachResponse,
    /// Event stream of a freshly spawned PTY, to be pumped by the caller
    pub spawned: Option<SpawnedSession>,
}

pub struct SpawnedSession {
    pub instance: u64,
    pub events: mpsc::UnboundedReceiver<PtyEvent>,
}

pub struct SessionRegistry {
    sessions: HashMap<SessionId, HostedSession>,
    replay_cap: usize,
    next_instance: u64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAP)
    }
}

impl SessionRegistry {
    pub fn new(replay_cap: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            replay_cap,
            next_instance: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Spawn a session, or attach `client_id` to the existing one
    ///
    /// Resuming resizes the PTY when the requested geometry differs and
    /// returns the buffered output instead of spawning.
    pub fn create_or_attach(
        &mut self,
        client_id: &str,
        request: CreateOrAttachRequest,
    ) -> Result<AttachOutcome, RegistryError> {
        if request.session_id.trim().is_empty() {
            return Err(RegistryError::InvalidSessionId);
        }

        if let Some(session) = self.sessions.get_mut(&request.session_id) {
            let (cols, rows) = session.runtime.size();
            let wants_resize = request.cols > 0
                && request.rows > 0
                && (request.cols, request.rows) != (cols, rows);
            if wants_resize {
                if let Err(e) = session.runtime.resize(request.cols, request.rows) {
                    tracing::debug!(session_id = %request.session_id, error = %e, "Resize on attach failed");
                }
            }

            let snapshot = session.snapshot(request.since_seq);
            session
                .attached
                .insert(client_id.to_string(), snapshot.end_seq);

            return Ok(AttachOutcome {
                response: CreateOrAttachResponse {
                    is_new: false,
                    snapshot,
                    pid: session.runtime.pid(),
                },
                spawned: None,
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = spawn_config(&request);
        let runtime = PtyRuntime::spawn(config, self.replay_cap, events_tx).map_err(|e| {
            RegistryError::Spawn {
                session_id: request.session_id.clone(),
                message: format!("{:#}", e),
            }
        })?;

        let instance = self.next_instance;
        self.next_instance += 1;

        let mut session = HostedSession {
            instance,
            workspace_id: request.workspace_id.clone(),
            runtime,
            created_at: Utc::now(),
            attached: HashMap::new(),
        };
        let snapshot = session.snapshot(request.since_seq);
        session
            .attached
            .insert(client_id.to_string(), snapshot.end_seq);
        let pid = session.runtime.pid();

        tracing::info!(
            session_id = %request.session_id,
            workspace_id = %request.workspace_id,
            pid = ?pid,
            "Spawned session"
        );
        self.sessions.insert(request.session_id, session);

        Ok(AttachOutcome {
            response: CreateOrAttachResponse {
                is_new: true,
                snapshot,
                pid,
            },
            spawned: Some(SpawnedSession {
                instance,
                events: events_rx,
            }),
        })
    }

    /// Send input to a session; failures on a PTY that already exited are ignored
    pub fn write(&self, session_id: &str, data: &str) -> Result<(), RegistryError> {
        let session = self.get(session_id)?;
        if let Err(e) = session.runtime.write(data.as_bytes().to_vec()) {
            tracing::debug!(session_id, error = %e, "Write to exited session ignored");
        }
        Ok(())
    }

    /// Resize a session; failures racing process exit are ignored
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), RegistryError> {
        let session = self.get(session_id)?;
        if cols == 0 || rows == 0 {
            return Ok(());
        }
        if let Err(e) = session.runtime.resize(cols, rows) {
            tracing::debug!(session_id, error = %e, "Resize of exited session ignored");
        }
        Ok(())
    }

    /// Remove `client_id` from a session's attached set
    pub fn detach(&mut self, session_id: &str, client_id: &str) -> Result<bool, RegistryError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        Ok(session.attached.remove(client_id).is_some())
    }

    /// Detach a client from every session (its sockets are all gone)
    pub fn detach_everywhere(&mut self, client_id: &str) {
        for session in self.sessions.values_mut() {
            session.attached.remove(client_id);
        }
    }

    /// Terminate a session's PTY and purge it
    pub fn kill(&mut self, session_id: &str) -> Result<HostedSession, RegistryError> {
        let mut session = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        session.runtime.stop();
        tracing::info!(session_id, "Killed session");
        Ok(session)
    }

    /// Terminate everything, returning the removed sessions
    pub fn kill_all(&mut self) -> Vec<(SessionId, HostedSession)> {
        let mut killed: Vec<_> = self.sessions.drain().collect();
        for (_, session) in killed.iter_mut() {
            session.runtime.stop();
        }
        killed
    }

    /// Remove a session whose PTY exited, unless the id now names a newer session
    pub fn remove_exited(&mut self, session_id: &str, instance: u64) -> Option<HostedSession> {
        match self.sessions.get(session_id) {
            Some(session) if session.instance == instance => self.sessions.remove(session_id),
            _ => None,
        }
    }

    /// Clients that should receive output ending at `end_seq`
    ///
    /// Advances each recipient's delivered offset.
    pub fn recipients(&mut self, session_id: &str, instance: u64, end_seq: u64) -> Vec<ClientId> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Vec::new();
        };
        if session.instance != instance {
            return Vec::new();
        }
        session
            .attached
            .iter_mut()
            .filter_map(|(client_id, delivered)| {
                if end_seq <= *delivered {
                    return None;
                }
                *delivered = end_seq;
                Some(client_id.clone())
            })
            .collect()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|(id, session)| session.info(id))
            .collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    fn get(&self, session_id: &str) -> Result<&HostedSession, RegistryError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))
    }
}

fn spawn_config(request: &CreateOrAttachRequest) -> SpawnConfig {
    let mut env = request.env.clone().unwrap_or_default();
    env.insert(SESSION_ID_ENV.to_string(), request.session_id.clone());
    env.insert(WORKSPACE_ID_ENV.to_string(), request.workspace_id.clone());

    SpawnConfig {
        program: request.shell.clone().filter(|s| !s.trim().is_empty()),
        args: request.args.clone().unwrap_or_default(),
        cwd: (!request.cwd.is_empty()).then(|| PathBuf::from(&request.cwd)),
        cols: request.cols,
        rows: request.rows,
        env,
        login_shell: request.use_login_shell.unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh_request(session_id: &str, script: &str) -> CreateOrAttachRequest {
        CreateOrAttachRequest {
            session_id: session_id.to_string(),
            workspace_id: "w1".to_string(),
            cwd: std::env::temp_dir().to_string_lossy().to_string(),
            cols: 80,
            rows: 24,
            shell: Some("sh".to_string()),
            args: Some(vec!["-c".to_string(), script.to_string()]),
            ..Default::default()
        }
    }

    async fn next_output(events: &mut mpsc::UnboundedReceiver<PtyEvent>) -> (Vec<u8>, u64) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(PtyEvent::Output { data, end_seq })) => return (data, end_seq),
                Ok(Some(PtyEvent::Exited { .. })) => continue,
                _ => panic!("no output"),
            }
        }
    }

    #[tokio::test]
    async fn test_create_then_attach_returns_snapshot() {
        let mut registry = SessionRegistry::new(1024);
        let first = registry
            .create_or_attach("c1", sh_request("s1", "echo ready; sleep 30"))
            .unwrap();
        assert!(first.response.is_new);
        let mut spawned = first.spawned.expect("new session has events");
        let (_, end_seq) = next_output(&mut spawned.events).await;

        let second = registry
            .create_or_attach("c2", sh_request("s1", "ignored"))
            .unwrap();
        assert!(!second.response.is_new);
        assert!(second.spawned.is_none());
        assert!(second.response.snapshot.end_seq >= end_seq);
        assert!(second.response.snapshot.snapshot_ansi.contains("ready"));

        let info = registry.list();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].attached_clients, 2);
        assert_eq!(info[0].workspace_id, "w1");

        registry.kill("s1").unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_child_sees_session_env() {
        let mut registry = SessionRegistry::new(1024);
        let outcome = registry
            .create_or_attach(
                "c1",
                sh_request("env-check", "echo id=$TERM_HOST_SESSION_ID ws=$TERM_HOST_WORKSPACE_ID"),
            )
            .unwrap();
        let mut events = outcome.spawned.unwrap().events;
        let mut text = String::new();
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Output { data, .. } => text.push_str(&String::from_utf8_lossy(&data)),
                PtyEvent::Exited { .. } => break,
            }
        }
        assert!(text.contains("id=env-check ws=w1"), "output was {:?}", text);
    }

    #[tokio::test]
    async fn test_recipients_skip_output_already_in_snapshot() {
        let mut registry = SessionRegistry::new(1024);
        let outcome = registry
            .create_or_attach("c1", sh_request("s1", "sleep 30"))
            .unwrap();
        let instance = outcome.spawned.unwrap().instance;

        registry.sessions.get_mut("s1").unwrap().attached.insert("c2".into(), 10);

        let mut first = registry.recipients("s1", instance, 10);
        first.sort();
        assert_eq!(first, vec!["c1".to_string()]);

        let mut second = registry.recipients("s1", instance, 12);
        second.sort();
        assert_eq!(second, vec!["c1".to_string(), "c2".to_string()]);

        assert!(registry.recipients("s1", instance + 1, 20).is_empty());
        assert!(registry.remove_exited("s1", instance + 1).is_none());
        assert!(registry.remove_exited("s1", instance).is_some());
    }

    #[tokio::test]
    async fn test_detach_and_unknown_sessions() {
        let mut registry = SessionRegistry::new(1024);
        registry
            .create_or_attach("c1", sh_request("s1", "sleep 30"))
            .unwrap();

        assert!(registry.detach("s1", "c1").unwrap());
        assert!(!registry.detach("s1", "c1").unwrap());
        assert!(registry.contains("s1"));

        assert!(matches!(
            registry.write("missing", "x"),
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(registry.kill("missing"), Err(RegistryError::NotFound(_))));
        assert!(matches!(
            registry.create_or_attach("c1", CreateOrAttachRequest::default()),
            Err(RegistryError::InvalidSessionId)
        ));

        assert_eq!(registry.kill_all().len(), 1);
    }
}
