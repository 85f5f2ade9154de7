//! Process-tree inspection for agent detection.
//!
//! A [`ProcessProbe`] takes a snapshot of the OS process table; the generic
//! walk in [`ProcessTable::find_agent_under`] then asks an [`AgentMatcher`]
//! whether any descendant of a PTY's child is the agent. Agents differ only
//! in their matcher, never in the walk.

use crate::activity::AgentKind;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

/// Shells whose `-c` script is inspected for a wrapped agent
const SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "fish"];

/// Script runtimes whose entry point is inspected for a wrapped agent
const INTERPRETERS: &[&str] = &["node", "bun", "deno"];

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub command: String,
}

/// Snapshot of the process table.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    entries: Vec<ProcessEntry>,
}

impl ProcessTable {
    pub fn new(entries: Vec<ProcessEntry>) -> Self {
        Self { entries }
    }

    /// Parse `ps -axo pid=,ppid=,command=` output; unparsable rows are skipped.
    pub fn parse_ps(output: &str) -> Self {
        let entries = output
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let pid = parts.next()?.parse().ok()?;
                let ppid = parts.next()?.parse().ok()?;
                let command = parts.collect::<Vec<_>>().join(" ");
                Some(ProcessEntry { pid, ppid, command })
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[ProcessEntry] {
        &self.entries
    }

    /// All processes below `root`, breadth first (root excluded).
    pub fn descendants(&self, root: u32) -> Vec<&ProcessEntry> {
        let mut children: HashMap<u32, Vec<&ProcessEntry>> = HashMap::new();
        for entry in &self.entries {
            if entry.pid != entry.ppid {
                children.entry(entry.ppid).or_default().push(entry);
            }
        }

        let mut found = Vec::new();
        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(pid) = queue.pop_front() {
            for child in children.get(&pid).into_iter().flatten() {
                if seen.insert(child.pid) {
                    found.push(*child);
                    queue.push_back(child.pid);
                }
            }
        }
        found
    }

    /// First process at or below `root` that the matcher recognizes.
    pub fn find_agent_under(
        &self,
        root: u32,
        matcher: &dyn AgentMatcher,
    ) -> Option<&ProcessEntry> {
        let root_entry = self.entries.iter().find(|e| e.pid == root);
        root_entry
            .into_iter()
            .chain(self.descendants(root))
            .find(|entry| matcher.is_agent_command(&entry.command))
    }
}

/// Source of process table snapshots.
pub trait ProcessProbe: Send + Sync {
    fn snapshot(&self) -> std::io::Result<ProcessTable>;

    /// Whether `matcher`'s agent runs at or below `root`; probe failures count as absent.
    fn agent_running_under(&self, root: u32, matcher: &dyn AgentMatcher) -> bool {
        match self.snapshot() {
            Ok(table) => table.find_agent_under(root, matcher).is_some(),
            Err(e) => {
                tracing::debug!(error = %e, "Process snapshot failed");
                false
            }
        }
    }
}

/// Snapshots via `ps`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsProbe;

impl ProcessProbe for PsProbe {
    fn snapshot(&self) -> std::io::Result<ProcessTable> {
        let output = std::process::Command::new("ps")
            .args(["-axo", "pid=,ppid=,command="])
            .output()?;
        if !output.status.success() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("ps exited with {}", output.status),
            ));
        }
        Ok(ProcessTable::parse_ps(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Decides whether a command line belongs to a particular agent.
pub trait AgentMatcher: Send + Sync {
    fn agent(&self) -> AgentKind;
    fn is_agent_command(&self, cmdline: &str) -> bool;
}

/// Matches an agent by executable name, directly or behind a shell or script runtime.
#[derive(Debug, Clone)]
pub struct BinaryMatcher {
    agent: AgentKind,
    names: Vec<String>,
}

impl BinaryMatcher {
    pub fn new(agent: AgentKind, names: &[&str]) -> Self {
        Self {
            agent,
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    fn is_name(&self, token: &str) -> bool {
        let base = basename(token);
        let base = strip_script_extension(base);
        self.names.iter().any(|name| name == base)
    }

    fn matches_tokens(&self, tokens: &[&str], depth: usize) -> bool {
        let Some((first, rest)) = tokens.split_first() else {
            return false;
        };
        let program = basename(first);

        if self.names.iter().any(|name| name == program) {
            return true;
        }
        if depth > 2 {
            return false;
        }

        if SHELLS.contains(&program) {
            let Some(pos) = rest
                .iter()
                .position(|arg| arg.starts_with('-') && !arg.starts_with("--") && arg.ends_with('c'))
            else {
                return false;
            };
            let script: Vec<&str> = rest[pos + 1..]
                .iter()
                .map(|t| t.trim_matches(|c| c == '"' || c == '\''))
                .filter(|t| !t.is_empty())
                .collect();
            let script = match script.first() {
                Some(&"exec") => &script[1..],
                _ => &script[..],
            };
            return self.matches_tokens(script, depth + 1);
        }

        if INTERPRETERS.contains(&program) {
            return rest
                .iter()
                .find(|arg| !arg.starts_with('-') && **arg != "run")
                .map(|entry| self.is_name(entry))
                .unwrap_or(false);
        }

        false
    }
}

impl AgentMatcher for BinaryMatcher {
    fn agent(&self) -> AgentKind {
        self.agent
    }

    fn is_agent_command(&self, cmdline: &str) -> bool {
        let tokens: Vec<&str> = cmdline.split_whitespace().collect();
        self.matches_tokens(&tokens, 0)
    }
}

/// The matcher used for an agent family.
pub fn matcher_for(agent: AgentKind) -> BinaryMatcher {
    BinaryMatcher::new(agent, &[agent.binary_name()])
}

fn basename(token: &str) -> &str {
    Path::new(token)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(token)
}

fn strip_script_extension(name: &str) -> &str {
    [".js", ".mjs", ".cjs", ".ts"]
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(name)
}
