//! Turn event watcher.
//!
//! Polls the events directory, consumes every settled file (deleting it even
//! when it does not parse), and folds the events into a per-workspace set of
//! active agent sessions. A workspace is active while that set is non-empty.

use crate::activity::bus::TMP_SUFFIX;
use crate::activity::{AgentKind, AgentTurnEvent, Outcome, TurnEventType, TURN_EVENT_SCHEMA};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// Session component used when an event carries no session id
const DEFAULT_SESSION: &str = "default";

/// A turn finished in a workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnNotification {
    pub workspace_id: String,
    /// Absent on synthesized notifications
    pub agent: Option<AgentKind>,
    pub outcome: Option<Outcome>,
    pub session_id: Option<String>,
    /// True when the workspace went idle without an explicit `awaiting_user`
    pub synthesized: bool,
    pub at: DateTime<Utc>,
}

/// Result of one poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatcherUpdate {
    /// New active set, present only when it changed
    pub active_workspaces: Option<BTreeSet<String>>,
    pub notifications: Vec<TurnNotification>,
}

impl WatcherUpdate {
    pub fn is_empty(&self) -> bool {
        self.active_workspaces.is_none() && self.notifications.is_empty()
    }
}

/// Consumer side of the turn event directory
#[derive(Debug)]
pub struct TurnEventWatcher {
    dir: PathBuf,
    settle: Duration,
    /// workspace -> active `agent:session` keys
    sessions: BTreeMap<String, BTreeSet<String>>,
    published: BTreeSet<String>,
}

impl TurnEventWatcher {
    pub fn new(dir: impl Into<PathBuf>, settle: Duration) -> Self {
        Self {
            dir: dir.into(),
            settle,
            sessions: BTreeMap::new(),
            published: BTreeSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Last published active set
    pub fn active_workspaces(&self) -> &BTreeSet<String> {
        &self.published
    }

    /// Consume settled event files and fold them into the active set
    pub fn poll_once(&mut self, now: SystemTime) -> WatcherUpdate {
        let mut update = WatcherUpdate::default();
        let mut notified: HashSet<String> = HashSet::new();

        // File names only order events to the millisecond; `at` is exact
        let mut events: Vec<AgentTurnEvent> = self
            .settled_files(now)
            .iter()
            .filter_map(|path| consume(path))
            .collect();
        events.sort_by_key(|event| event.at);

        for event in events {
            if let Some(notification) = self.apply(event) {
                notified.insert(notification.workspace_id.clone());
                update.notifications.push(notification);
            }
        }

        let active: BTreeSet<String> = self
            .sessions
            .iter()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(workspace, _)| workspace.clone())
            .collect();

        if active != self.published {
            let at = Utc::now();
            for workspace in self.published.difference(&active) {
                if notified.contains(workspace) {
                    continue;
                }
                tracing::debug!(workspace_id = %workspace, "Workspace went idle without awaiting_user");
                update.notifications.push(TurnNotification {
                    workspace_id: workspace.clone(),
                    agent: None,
                    outcome: None,
                    session_id: None,
                    synthesized: true,
                    at,
                });
            }
            self.published = active.clone();
            update.active_workspaces = Some(active);
        }

        update
    }

    fn apply(&mut self, event: AgentTurnEvent) -> Option<TurnNotification> {
        let key = format!(
            "{}:{}",
            event.agent,
            event.session_id.as_deref().unwrap_or(DEFAULT_SESSION)
        );

        match event.event_type {
            TurnEventType::TurnStarted => {
                self.sessions
                    .entry(event.workspace_id)
                    .or_default()
                    .insert(key);
                None
            }
            TurnEventType::AwaitingUser => {
                if let Some(keys) = self.sessions.get_mut(&event.workspace_id) {
                    keys.remove(&key);
                    if keys.is_empty() {
                        self.sessions.remove(&event.workspace_id);
                    }
                }
                Some(TurnNotification {
                    workspace_id: event.workspace_id,
                    agent: Some(event.agent),
                    outcome: event.outcome,
                    session_id: event.session_id,
                    synthesized: false,
                    at: event.at,
                })
            }
        }
    }

    /// Event files old enough to read, oldest name first
    fn settled_files(&self, now: SystemTime) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to list turn events");
                }
                return Vec::new();
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name();
                !name.to_string_lossy().ends_with(TMP_SUFFIX)
            })
            .filter(|entry| {
                let Ok(meta) = entry.metadata() else {
                    return false;
                };
                if !meta.is_file() {
                    return false;
                }
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or(Duration::ZERO);
                age >= self.settle
            })
            .map(|entry| entry.path())
            .collect();
        files.sort();
        files
    }

    /// Poll on `interval`, sending non-empty updates until the receiver goes away
    pub async fn run(mut self, interval: Duration, tx: mpsc::Sender<WatcherUpdate>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if tx.is_closed() {
                tracing::debug!("Turn event receiver dropped, stopping watcher");
                break;
            }
            let update = self.poll_once(SystemTime::now());
            if update.is_empty() {
                continue;
            }
            if tx.send(update).await.is_err() {
                tracing::debug!("Turn event receiver dropped, stopping watcher");
                break;
            }
        }
    }
}

/// Read, delete and validate one event file
fn consume(path: &Path) -> Option<AgentTurnEvent> {
    let bytes = fs::read(path);
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete turn event");
        }
    }

    let bytes = bytes.ok()?;
    match serde_json::from_slice::<AgentTurnEvent>(&bytes) {
        Ok(event) if event.schema == TURN_EVENT_SCHEMA && !event.workspace_id.is_empty() => {
            Some(event)
        }
        Ok(event) => {
            tracing::debug!(path = %path.display(), schema = event.schema, "Dropping turn event");
            None
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Dropping malformed turn event");
            None
        }
    }
}
