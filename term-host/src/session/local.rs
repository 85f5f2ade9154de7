// In-process PTY manager
//
// Runs PTYs inside the embedding process instead of the daemon. Keeps the
// same replay contract as the daemon (bounded buffer, truncation on
// reattach) and additionally feeds PTY input and output through the agent
// activity detectors, since it sees both sides of every session.

use crate::activity::marker::{ActivityMarker, MarkerStore};
use crate::activity::process_tree::{ProcessProbe, PsProbe};
use crate::activity::{
    ActivityDetector, AgentKind, DetectionStrategy, DetectorContext, Outcome, TurnEventBus,
    TurnEventType, TurnSignal,
};
use crate::session::config::{ActivityConfig, Config};
use crate::session::registry::{SESSION_ID_ENV, WORKSPACE_ID_ENV};
use crate::session::replay::DEFAULT_REPLAY_CAP;
use crate::session::runtime::{PtyEvent, PtyRuntime, SpawnConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How often `start_ticker` drives detector timers
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Markers older than this no longer trigger process scans
pub const MARKER_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

/// Events delivered to a session's current sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Data {
        session_id: String,
        data: String,
        /// Output seq after this chunk
        seq: u64,
    },
    Exit {
        session_id: String,
        exit_code: Option<i32>,
    },
}

pub type OutputSink = mpsc::UnboundedSender<LocalEvent>;

#[derive(Debug, Error)]
pub enum LocalError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Failed to spawn session {session_id}: {message}")]
    Spawn { session_id: String, message: String },
}

/// Parameters for `LocalPtyManager::spawn`
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub session_id: String,
    /// Turn events are only published for sessions with a workspace
    pub workspace_id: Option<String>,
    /// Agent expected in this PTY; selects the detector
    pub agent: Option<AgentKind>,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub use_login_shell: bool,
}

/// Replay handed back by `reattach`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReattachResult {
    pub replay: String,
    pub base_seq: u64,
    pub end_seq: u64,
    pub truncated: bool,
    pub cols: u16,
    pub rows: u16,
}

struct LocalSession {
    instance: u64,
    workspace_id: Option<String>,
    runtime: PtyRuntime,
    sink: OutputSink,
    /// Output seq already handed to the current sink
    delivered: u64,
    detector: Option<Arc<StdMutex<DetectorSlot>>>,
}

/// A session's detector and its process-check bookkeeping
///
/// Locked on its own so that a detector waiting on `ps` holds up only its
/// own session.
struct DetectorSlot {
    detector: ActivityDetector,
    last_process_check: Option<Instant>,
    /// Set once the first tick has looked at the process tree
    resynced: bool,
    /// Set when the session is torn down; later signals are dropped
    closed: bool,
}

impl DetectorSlot {
    fn new(detector: ActivityDetector) -> Self {
        Self {
            detector,
            last_process_check: None,
            resynced: false,
            closed: false,
        }
    }
}

/// What detection needs from a session, copied out before the sessions lock is released
struct DetectionJob {
    session_id: String,
    workspace_id: Option<String>,
    root_pid: Option<u32>,
    slot: Arc<StdMutex<DetectorSlot>>,
}

impl LocalSession {
    fn detection_job(&self, session_id: &str) -> Option<DetectionJob> {
        let slot = self.detector.as_ref()?;
        Some(DetectionJob {
            session_id: session_id.to_string(),
            workspace_id: self.workspace_id.clone(),
            root_pid: self.runtime.pid(),
            slot: Arc::clone(slot),
        })
    }
}

/// Signals ready to publish
struct Pending {
    session_id: String,
    workspace_id: Option<String>,
    agent: AgentKind,
    strategy: DetectionStrategy,
    pid: Option<u32>,
    signals: Vec<TurnSignal>,
}

struct Shared {
    sessions: StdMutex<HashMap<String, LocalSession>>,
    next_instance: AtomicU64,
    bus: TurnEventBus,
    markers: MarkerStore,
    activity: ActivityConfig,
    probe: Arc<dyn ProcessProbe>,
    replay_cap: usize,
}

/// PTY sessions owned by this process
#[derive(Clone)]
pub struct LocalPtyManager {
    shared: Arc<Shared>,
}

impl LocalPtyManager {
    /// Manager publishing into `config`'s event and marker directories
    pub fn new(config: &Config) -> Self {
        Self::with_probe(config, config.load_activity_config(), Arc::new(PsProbe))
    }

    pub fn with_probe(
        config: &Config,
        activity: ActivityConfig,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                sessions: StdMutex::new(HashMap::new()),
                next_instance: AtomicU64::new(1),
                bus: TurnEventBus::from_config(config),
                markers: MarkerStore::from_config(config),
                activity,
                probe,
                replay_cap: DEFAULT_REPLAY_CAP,
            }),
        }
    }

    /// Spawn a PTY and stream its output into `sink` from a dedicated thread
    pub fn spawn(&self, options: SpawnOptions, sink: OutputSink) -> Result<Option<u32>, LocalError> {
        let session_id = options.session_id.clone();
        let mut sessions = self.shared.lock_sessions();
        if sessions.contains_key(&session_id) {
            return Err(LocalError::AlreadyExists(session_id));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let runtime = PtyRuntime::spawn(spawn_config(&options), self.shared.replay_cap, events_tx)
            .map_err(|e| LocalError::Spawn {
                session_id: session_id.clone(),
                message: format!("{:#}", e),
            })?;
        let pid = runtime.pid();
        let instance = self.shared.next_instance.fetch_add(1, Ordering::SeqCst);
        let detector = options.agent.map(|agent| {
            Arc::new(StdMutex::new(DetectorSlot::new(ActivityDetector::for_agent(
                agent,
                &self.shared.activity,
            ))))
        });

        tracing::info!(
            session_id = %session_id,
            workspace_id = ?options.workspace_id,
            agent = ?options.agent,
            pid = ?pid,
            "Spawned local session"
        );
        sessions.insert(
            session_id.clone(),
            LocalSession {
                instance,
                workspace_id: options.workspace_id,
                runtime,
                sink,
                delivered: 0,
                detector,
            },
        );
        drop(sessions);

        // Detection may wait on `ps`, so the pump stays off the async workers
        let shared = Arc::clone(&self.shared);
        let pump_id = session_id.clone();
        let pump = std::thread::Builder::new()
            .name(format!("local-pty-{}", session_id))
            .spawn(move || pump_session(shared, pump_id, instance, events_rx));
        if let Err(e) = pump {
            if let Some(mut session) = self.shared.lock_sessions().remove(&session_id) {
                session.runtime.stop();
            }
            return Err(LocalError::Spawn {
                session_id,
                message: format!("failed to start output thread: {}", e),
            });
        }
        Ok(pid)
    }

    /// Send input; writes to an exited PTY are ignored
    pub fn write(&self, session_id: &str, data: &str) -> Result<(), LocalError> {
        let job = {
            let sessions = self.shared.lock_sessions();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| LocalError::NotFound(session_id.to_string()))?;

            if let Err(e) = session.runtime.write(data.as_bytes().to_vec()) {
                tracing::debug!(session_id, error = %e, "Write to exited session ignored");
            }
            session.detection_job(session_id)
        };

        if let Some(job) = job {
            self.shared.detect(job, |slot, ctx| slot.detector.on_input(data.as_bytes(), ctx));
        }
        Ok(())
    }

    /// Resize; failures racing process exit are ignored
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), LocalError> {
        let sessions = self.shared.lock_sessions();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| LocalError::NotFound(session_id.to_string()))?;
        if cols > 0 && rows > 0 {
            if let Err(e) = session.runtime.resize(cols, rows) {
                tracing::debug!(session_id, error = %e, "Resize of exited session ignored");
            }
        }
        Ok(())
    }

    /// Terminate a session and purge it; the sink receives an exit without a code
    pub fn kill(&self, session_id: &str) -> Result<(), LocalError> {
        let session = self
            .shared
            .lock_sessions()
            .remove(session_id)
            .ok_or_else(|| LocalError::NotFound(session_id.to_string()))?;
        tracing::info!(session_id, "Killed local session");
        self.shared.finish(session_id, session, None);
        Ok(())
    }

    /// Route future output to `sink` and return what it missed since `since_seq`
    pub fn reattach(
        &self,
        session_id: &str,
        sink: OutputSink,
        since_seq: Option<u64>,
    ) -> Result<ReattachResult, LocalError> {
        let mut sessions = self.shared.lock_sessions();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| LocalError::NotFound(session_id.to_string()))?;

        let replay = session.runtime.replay_since(since_seq);
        let (cols, rows) = session.runtime.size();
        session.sink = sink;
        session.delivered = replay.end_seq;

        Ok(ReattachResult {
            replay: String::from_utf8_lossy(&replay.data).into_owned(),
            base_seq: replay.base_seq,
            end_seq: replay.end_seq,
            truncated: replay.truncated,
            cols,
            rows,
        })
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.lock_sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Detector timers plus periodic process checks for process-tree sessions
    ///
    /// A session's first tick re-derives whether its agent is mid-turn from
    /// the process tree, unless a marker says a turn was already announced.
    /// May block on `ps`; `start_ticker` runs it off the async workers.
    pub fn tick(&self) {
        let jobs: Vec<DetectionJob> = {
            let sessions = self.shared.lock_sessions();
            sessions
                .iter()
                .filter_map(|(session_id, session)| session.detection_job(session_id))
                .collect()
        };

        let poll = self.shared.activity.process_poll();
        let markers = &self.shared.markers;
        for job in jobs {
            let key = job.session_id.clone();
            self.shared.detect(job, |slot, ctx| {
                let mut signals = slot.detector.tick(ctx);
                let first_tick = !std::mem::replace(&mut slot.resynced, true);
                let check_due = first_tick
                    || slot
                        .last_process_check
                        .map(|at| ctx.now.duration_since(at) >= poll)
                        .unwrap_or(true);

                if let ActivityDetector::ProcessTree(tree) = &mut slot.detector {
                    if check_due {
                        let hinted = markers.read(&key, MARKER_MAX_AGE).is_some();
                        if first_tick && !hinted && !tree.is_active() {
                            if tree.resync(ctx) {
                                tracing::debug!(session_id = %key, "Adopted turn of running agent");
                            }
                        } else if tree.is_active() || hinted {
                            signals.extend(tree.check(ctx, hinted));
                        }
                        slot.last_process_check = Some(ctx.now);
                    }
                }
                signals
            });
        }
    }

    /// Call `tick` every `TICK_INTERVAL` until the handle is aborted
    pub fn start_ticker(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let manager = manager.clone();
                if tokio::task::spawn_blocking(move || manager.tick()).await.is_err() {
                    tracing::warn!("Activity tick panicked, stopping ticker");
                    break;
                }
            }
        })
    }
}

impl Shared {
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, LocalSession>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn context(&self, root_pid: Option<u32>) -> DetectorContext<'_> {
        DetectorContext {
            now: Instant::now(),
            root_pid,
            probe: self.probe.as_ref(),
        }
    }

    /// Run `f` against the job's detector and publish what it signalled
    ///
    /// Only the job's slot is locked. Publishing happens under it so one
    /// session's events reach the bus in detection order.
    fn detect<F>(&self, job: DetectionJob, f: F)
    where
        F: FnOnce(&mut DetectorSlot, &DetectorContext<'_>) -> Vec<TurnSignal>,
    {
        let ctx = self.context(job.root_pid);
        let mut slot = lock_slot(&job.slot);
        if slot.closed {
            return;
        }
        let signals = f(&mut *slot, &ctx);
        if signals.is_empty() {
            return;
        }
        let agent = slot.detector.agent();
        self.publish(Pending {
            session_id: job.session_id,
            workspace_id: job.workspace_id,
            agent,
            strategy: agent.strategy(),
            pid: job.root_pid,
            signals,
        });
    }

    /// Write signals to the bus and keep process-tree markers in step
    fn publish(&self, pending: Pending) {
        // Sessions without a workspace are inert
        if pending.workspace_id.is_none() {
            return;
        }

        for signal in pending.signals {
            let correlation = signal
                .session_id
                .clone()
                .unwrap_or_else(|| pending.session_id.clone());
            tracing::debug!(
                session_id = %pending.session_id,
                agent = %pending.agent,
                event_type = ?signal.event_type,
                "Turn boundary detected"
            );
            if let Err(e) = self.bus.emit_turn_event(
                pending.workspace_id.as_deref(),
                pending.agent,
                signal.event_type,
                Some(&correlation),
                signal.outcome,
            ) {
                tracing::warn!(session_id = %pending.session_id, error = %e, "Failed to emit turn event");
            }

            if pending.strategy != DetectionStrategy::ProcessTree {
                continue;
            }
            let marker_result = match signal.event_type {
                TurnEventType::TurnStarted => self.markers.write(
                    &pending.session_id,
                    &ActivityMarker::now(pending.agent, pending.pid),
                ),
                TurnEventType::AwaitingUser => self.markers.clear(&pending.session_id),
            };
            if let Err(e) = marker_result {
                tracing::warn!(session_id = %pending.session_id, error = %e, "Failed to update activity marker");
            }
        }
    }

    fn handle_output(&self, session_id: &str, instance: u64, data: &[u8], end_seq: u64) {
        let (text, job) = {
            let mut sessions = self.lock_sessions();
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            if session.instance != instance {
                return;
            }

            let text = String::from_utf8_lossy(data).into_owned();
            if end_seq > session.delivered {
                session.delivered = end_seq;
                let _ = session.sink.send(LocalEvent::Data {
                    session_id: session_id.to_string(),
                    data: text.clone(),
                    seq: end_seq,
                });
            }

            (text, session.detection_job(session_id))
        };

        if let Some(job) = job {
            self.detect(job, |slot, ctx| slot.detector.on_output(&text, ctx));
        }
    }

    fn handle_exit(&self, session_id: &str, instance: u64, exit_code: Option<i32>) {
        let session = {
            let mut sessions = self.lock_sessions();
            match sessions.get(session_id) {
                Some(session) if session.instance == instance => sessions.remove(session_id),
                _ => None,
            }
        };
        if let Some(session) = session {
            tracing::info!(session_id, exit_code = ?exit_code, "Local session exited");
            self.finish(session_id, session, exit_code);
        }
    }

    /// Tear down a removed session, closing any open turn before the exit event
    fn finish(&self, session_id: &str, mut session: LocalSession, exit_code: Option<i32>) {
        session.runtime.stop();

        if let Some(slot) = &session.detector {
            let mut slot = lock_slot(slot);
            slot.closed = true;
            if slot.detector.is_active() {
                let agent = slot.detector.agent();
                self.publish(Pending {
                    session_id: session_id.to_string(),
                    workspace_id: session.workspace_id.clone(),
                    agent,
                    strategy: agent.strategy(),
                    pid: session.runtime.pid(),
                    signals: vec![TurnSignal::awaiting(Outcome::Success)],
                });
            }
        }

        let _ = session.sink.send(LocalEvent::Exit {
            session_id: session_id.to_string(),
            exit_code,
        });
    }
}

fn lock_slot(slot: &StdMutex<DetectorSlot>) -> MutexGuard<'_, DetectorSlot> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn pump_session(
    shared: Arc<Shared>,
    session_id: String,
    instance: u64,
    mut events: mpsc::UnboundedReceiver<PtyEvent>,
) {
    while let Some(event) = events.blocking_recv() {
        match event {
            PtyEvent::Output { data, end_seq } => {
                shared.handle_output(&session_id, instance, &data, end_seq);
            }
            PtyEvent::Exited { exit_code } => {
                shared.handle_exit(&session_id, instance, exit_code);
                break;
            }
        }
    }
}

fn spawn_config(options: &SpawnOptions) -> SpawnConfig {
    let mut env = options.env.clone();
    env.insert(SESSION_ID_ENV.to_string(), options.session_id.clone());
    if let Some(workspace_id) = &options.workspace_id {
        env.insert(WORKSPACE_ID_ENV.to_string(), workspace_id.clone());
    }

    SpawnConfig {
        program: options.shell.clone().filter(|s| !s.trim().is_empty()),
        args: options.args.clone(),
        cwd: options.cwd.clone(),
        cols: options.cols,
        rows: options.rows,
        env,
        login_shell: options.use_login_shell,
    }
}
