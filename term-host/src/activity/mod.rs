//! Agent activity detection
//!
//! Heuristic detectors classify PTY traffic into agent turn boundaries and
//! publish them through a file-based event bus that a watcher folds into
//! per-workspace activity.

pub mod ansi;
pub mod bus;
pub mod detector;
pub mod marker;
pub mod process_tree;
pub mod watcher;

pub use ansi::strip_ansi;
pub use bus::TurnEventBus;
pub use detector::{ActivityDetector, DetectorContext};
pub use watcher::{TurnEventWatcher, TurnNotification, WatcherUpdate};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version stamped into every turn event file
pub const TURN_EVENT_SCHEMA: u32 = 1;

/// Agents with a known detection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
    Opencode,
}

/// How turns are inferred for an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStrategy {
    /// Agent process presence under the PTY, plus prompt text
    ProcessTree,
    /// Output sizes and silence, for TUIs that redraw while idle
    OutputShape,
    /// One JSON object per output line
    StructuredStream,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [
        AgentKind::Claude,
        AgentKind::Codex,
        AgentKind::Gemini,
        AgentKind::Opencode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
            AgentKind::Opencode => "opencode",
        }
    }

    /// Executable name the process matcher looks for
    pub fn binary_name(&self) -> &'static str {
        self.as_str()
    }

    pub fn strategy(&self) -> DetectionStrategy {
        match self {
            // Runs headless with `--output-format stream-json`
            AgentKind::Claude => DetectionStrategy::StructuredStream,
            AgentKind::Codex => DetectionStrategy::ProcessTree,
            AgentKind::Gemini | AgentKind::Opencode => DetectionStrategy::OutputShape,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentKind::ALL
            .into_iter()
            .find(|agent| agent.as_str() == s)
            .ok_or_else(|| format!("Unknown agent: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEventType {
    TurnStarted,
    AwaitingUser,
}

impl std::str::FromStr for TurnEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "turn_started" => Ok(TurnEventType::TurnStarted),
            "awaiting_user" => Ok(TurnEventType::AwaitingUser),
            _ => Err(format!("Unknown turn event type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failed,
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failed" => Ok(Outcome::Failed),
            _ => Err(format!("Unknown outcome: {}", s)),
        }
    }
}

/// One event file on the turn-event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTurnEvent {
    pub schema: u32,
    pub workspace_id: String,
    pub agent: AgentKind,
    #[serde(rename = "type")]
    pub event_type: TurnEventType,
    /// Only meaningful on `awaiting_user`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// A turn boundary inferred by a detector, before it is tied to a workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnSignal {
    pub event_type: TurnEventType,
    pub outcome: Option<Outcome>,
    /// Agent-provided correlation id, when the output carries one
    pub session_id: Option<String>,
}

impl TurnSignal {
    pub fn started() -> Self {
        Self {
            event_type: TurnEventType::TurnStarted,
            outcome: None,
            session_id: None,
        }
    }

    pub fn awaiting(outcome: Outcome) -> Self {
        Self {
            event_type: TurnEventType::AwaitingUser,
            outcome: Some(outcome),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}
