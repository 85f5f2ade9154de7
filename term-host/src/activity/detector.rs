//! Turn detectors.
//!
//! Each detector is a small state machine fed with PTY input and output and
//! periodically ticked. They never touch the clock or the process table
//! directly: both come in through [`DetectorContext`], so the same code runs
//! against `ps` in production and a fake table in tests.

use crate::activity::ansi::strip_ansi;
use crate::activity::process_tree::{matcher_for, AgentMatcher, BinaryMatcher, ProcessProbe};
use crate::activity::{AgentKind, DetectionStrategy, Outcome, TurnSignal};
use crate::session::config::ActivityConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::time::{Duration, Instant};

static QUESTION_PROGRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)question\s+\d+\s*/\s*\d+.*?unanswered").expect("failed to compile question matcher")
});
static SUBMIT_ANSWER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)enter\s+to\s+submit\s+answer").expect("failed to compile submit matcher")
});

/// Clock and process table access for one detector call
pub struct DetectorContext<'a> {
    pub now: Instant,
    /// PID of the PTY's child, when known
    pub root_pid: Option<u32>,
    pub probe: &'a dyn ProcessProbe,
}

impl DetectorContext<'_> {
    fn agent_present(&self, matcher: &dyn AgentMatcher) -> bool {
        self.root_pid
            .map(|pid| self.probe.agent_running_under(pid, matcher))
            .unwrap_or(false)
    }
}

fn contains_enter(input: &[u8]) -> bool {
    input.iter().any(|b| *b == b'\r' || *b == b'\n')
}

/// Detector state for one session
#[derive(Debug)]
pub enum ActivityDetector {
    ProcessTree(ProcessTreeDetector),
    OutputShape(OutputShapeDetector),
    StructuredStream(StructuredStreamDetector),
}

impl ActivityDetector {
    pub fn for_agent(agent: AgentKind, config: &ActivityConfig) -> Self {
        match agent.strategy() {
            DetectionStrategy::ProcessTree => {
                ActivityDetector::ProcessTree(ProcessTreeDetector::new(agent, config))
            }
            DetectionStrategy::OutputShape => {
                ActivityDetector::OutputShape(OutputShapeDetector::new(agent, config))
            }
            DetectionStrategy::StructuredStream => {
                ActivityDetector::StructuredStream(StructuredStreamDetector::new(agent, config))
            }
        }
    }

    pub fn agent(&self) -> AgentKind {
        match self {
            ActivityDetector::ProcessTree(d) => d.matcher.agent(),
            ActivityDetector::OutputShape(d) => d.matcher.agent(),
            ActivityDetector::StructuredStream(d) => d.agent,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            ActivityDetector::ProcessTree(d) => d.active,
            ActivityDetector::OutputShape(d) => d.active,
            ActivityDetector::StructuredStream(d) => d.in_turn,
        }
    }

    /// Bytes the user sent to the PTY
    pub fn on_input(&mut self, input: &[u8], ctx: &DetectorContext<'_>) -> Vec<TurnSignal> {
        match self {
            ActivityDetector::ProcessTree(d) => d.on_input(input, ctx),
            ActivityDetector::OutputShape(d) => d.on_input(input, ctx),
            ActivityDetector::StructuredStream(_) => Vec::new(),
        }
    }

    /// Text the PTY produced
    pub fn on_output(&mut self, output: &str, ctx: &DetectorContext<'_>) -> Vec<TurnSignal> {
        match self {
            ActivityDetector::ProcessTree(d) => d.on_output(output),
            ActivityDetector::OutputShape(d) => d.on_output(output, ctx),
            ActivityDetector::StructuredStream(d) => d.on_output(output),
        }
    }

    /// Advance timers
    pub fn tick(&mut self, ctx: &DetectorContext<'_>) -> Vec<TurnSignal> {
        match self {
            ActivityDetector::OutputShape(d) => d.tick(ctx),
            ActivityDetector::ProcessTree(_) | ActivityDetector::StructuredStream(_) => Vec::new(),
        }
    }
}

// ============================================================================
// Process tree
// ============================================================================

/// Turns start on Enter while the agent runs, and end when it exits or asks a question
#[derive(Debug)]
pub struct ProcessTreeDetector {
    matcher: BinaryMatcher,
    active: bool,
    /// ANSI-stripped recent output while a turn is active
    recent: String,
    recent_cap: usize,
}

impl ProcessTreeDetector {
    pub fn new(agent: AgentKind, config: &ActivityConfig) -> Self {
        Self {
            matcher: matcher_for(agent),
            active: false,
            recent: String::new(),
            recent_cap: config.prompt_buffer_bytes.max(64),
        }
    }

    pub fn on_input(&mut self, input: &[u8], ctx: &DetectorContext<'_>) -> Vec<TurnSignal> {
        if self.active || !contains_enter(input) || !ctx.agent_present(&self.matcher) {
            return Vec::new();
        }
        self.active = true;
        self.recent.clear();
        vec![TurnSignal::started()]
    }

    pub fn on_output(&mut self, output: &str) -> Vec<TurnSignal> {
        if !self.active {
            return Vec::new();
        }
        self.recent.push_str(&strip_ansi(output));
        trim_front(&mut self.recent, self.recent_cap);

        if QUESTION_PROGRESS.is_match(&self.recent) && SUBMIT_ANSWER.is_match(&self.recent) {
            self.active = false;
            self.recent.clear();
            return vec![TurnSignal::awaiting(Outcome::Success)];
        }
        Vec::new()
    }

    /// Process check; `hinted` marks a session whose turn start was recorded elsewhere
    ///
    /// A missing agent closes the turn. A present agent on a hinted session
    /// adopts the turn without announcing it again.
    pub fn check(&mut self, ctx: &DetectorContext<'_>, hinted: bool) -> Vec<TurnSignal> {
        if !self.active && !hinted {
            return Vec::new();
        }
        if ctx.agent_present(&self.matcher) {
            self.active = true;
            return Vec::new();
        }
        self.active = false;
        self.recent.clear();
        vec![TurnSignal::awaiting(Outcome::Success)]
    }

    /// Re-derive the active flag from the process tree alone
    pub fn resync(&mut self, ctx: &DetectorContext<'_>) -> bool {
        self.active = ctx.agent_present(&self.matcher);
        self.active
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

// ============================================================================
// Output shape
// ============================================================================

/// Silence detection that ignores redraws of the same size
#[derive(Debug)]
pub struct OutputShapeDetector {
    matcher: BinaryMatcher,
    tolerance: usize,
    silence: Duration,
    grace: Duration,
    rearm_check: Duration,
    rearm_min_bytes: usize,

    active: bool,
    ever_started: bool,
    last_len: Option<usize>,
    deadline: Option<Instant>,
    grace_until: Option<Instant>,
    burst_bytes: usize,
    last_novel_at: Option<Instant>,
    last_rearm_check: Option<Instant>,
}

impl OutputShapeDetector {
    pub fn new(agent: AgentKind, config: &ActivityConfig) -> Self {
        Self {
            matcher: matcher_for(agent),
            tolerance: config.tolerance_bytes,
            silence: config.silence(),
            grace: config.grace(),
            rearm_check: config.rearm_check(),
            rearm_min_bytes: config.rearm_min_bytes,
            active: false,
            ever_started: false,
            last_len: None,
            deadline: None,
            grace_until: None,
            burst_bytes: 0,
            last_novel_at: None,
            last_rearm_check: None,
        }
    }

    fn start(&mut self, now: Instant) -> Vec<TurnSignal> {
        self.active = true;
        self.ever_started = true;
        self.deadline = Some(now + self.silence);
        self.grace_until = None;
        self.burst_bytes = 0;
        vec![TurnSignal::started()]
    }

    pub fn on_input(&mut self, input: &[u8], ctx: &DetectorContext<'_>) -> Vec<TurnSignal> {
        if self.active || !contains_enter(input) || !ctx.agent_present(&self.matcher) {
            return Vec::new();
        }
        self.start(ctx.now)
    }

    pub fn on_output(&mut self, output: &str, ctx: &DetectorContext<'_>) -> Vec<TurnSignal> {
        let len = output.len();
        let repeating = self
            .last_len
            .map(|previous| len.abs_diff(previous) <= self.tolerance)
            .unwrap_or(false);
        self.last_len = Some(len);

        if repeating {
            return Vec::new();
        }

        let now = ctx.now;
        if self.active {
            self.deadline = Some(now + self.silence);
            return Vec::new();
        }
        if !self.ever_started {
            return Vec::new();
        }

        // Novel output while idle: accumulate a burst
        let burst_expired = self
            .last_novel_at
            .map(|at| now.duration_since(at) > self.silence)
            .unwrap_or(true);
        if burst_expired {
            self.burst_bytes = 0;
        }
        self.last_novel_at = Some(now);

        if self.grace_until.is_some_and(|until| now < until) {
            self.burst_bytes = 0;
            return Vec::new();
        }
        self.burst_bytes += len;
        if self.burst_bytes < self.rearm_min_bytes {
            return Vec::new();
        }

        let recently_checked = self
            .last_rearm_check
            .is_some_and(|at| now.duration_since(at) < self.rearm_check);
        if recently_checked {
            return Vec::new();
        }
        self.last_rearm_check = Some(now);

        if ctx.agent_present(&self.matcher) {
            tracing::debug!(agent = %self.matcher.agent(), bytes = self.burst_bytes, "Re-arming turn");
            return self.start(now);
        }
        self.burst_bytes = 0;
        Vec::new()
    }

    pub fn tick(&mut self, ctx: &DetectorContext<'_>) -> Vec<TurnSignal> {
        match self.deadline {
            Some(deadline) if self.active && ctx.now >= deadline => {
                self.active = false;
                self.deadline = None;
                self.grace_until = Some(ctx.now + self.grace);
                self.burst_bytes = 0;
                vec![TurnSignal::awaiting(Outcome::Success)]
            }
            _ => Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

// ============================================================================
// Structured stream
// ============================================================================

/// Reads one JSON object per output line (headless `stream-json` output)
#[derive(Debug)]
pub struct StructuredStreamDetector {
    agent: AgentKind,
    lines: String,
    line_cap: usize,
    /// Set once the session header has been seen
    session_id: Option<String>,
    in_turn: bool,
}

impl StructuredStreamDetector {
    pub fn new(agent: AgentKind, config: &ActivityConfig) -> Self {
        Self {
            agent,
            lines: String::new(),
            line_cap: config.line_buffer_bytes.max(1024),
            session_id: None,
            in_turn: false,
        }
    }

    /// Session id captured from the header line
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn on_output(&mut self, output: &str) -> Vec<TurnSignal> {
        self.lines.push_str(output);

        let mut signals = Vec::new();
        while let Some(pos) = self.lines.find('\n') {
            let line: String = self.lines.drain(..=pos).collect();
            if let Some(signal) = self.process_line(line.trim()) {
                signals.push(signal);
            }
        }

        // A partial line this long is not one of ours
        if self.lines.len() > self.line_cap {
            self.lines.clear();
        }
        signals
    }

    fn process_line(&mut self, line: &str) -> Option<TurnSignal> {
        if !line.starts_with('{') {
            return None;
        }
        let value: Value = serde_json::from_str(line).ok()?;
        let kind = value.get("type").and_then(Value::as_str)?;
        let subtype = value.get("subtype").and_then(Value::as_str);

        if kind == "system" && subtype == Some("init") {
            if let Some(id) = value.get("session_id").and_then(Value::as_str) {
                self.session_id = Some(id.to_string());
                self.in_turn = false;
            }
            return None;
        }
        self.session_id.as_ref()?;

        match kind {
            "assistant" | "user" if !self.in_turn => {
                self.in_turn = true;
                Some(TurnSignal::started().with_session(self.session_id.clone()))
            }
            "result" => {
                self.in_turn = false;
                let is_error = value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let outcome = if is_error || subtype != Some("success") {
                    Outcome::Failed
                } else {
                    Outcome::Success
                };
                Some(TurnSignal::awaiting(outcome).with_session(self.session_id.clone()))
            }
            _ => None,
        }
    }
}

/// Drop leading bytes until `text` fits in `cap`, on a char boundary
fn trim_front(text: &mut String, cap: usize) {
    if text.len() <= cap {
        return;
    }
    let mut cut = text.len() - cap;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}
