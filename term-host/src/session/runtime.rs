// PTY runtime management for hosted sessions
//
// Wraps portable-pty to provide:
// - Spawning PTY child processes with geometry, cwd and environment
// - Reading output into a bounded replay buffer
// - Sending input and resizing
// - Graceful and forced termination

use crate::session::replay::{Replay, ReplayBuffer};
use anyhow::{Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Default PTY size (columns x rows)
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// How long the wait task lets the reader drain after the child exits
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Events emitted by the PTY runtime, in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// PTY produced output; `end_seq` is the session's output_seq after it
    Output { data: Vec<u8>, end_seq: u64 },
    /// PTY process exited (`None` when killed or the status was unavailable)
    Exited { exit_code: Option<i32> },
}

/// What to run inside the PTY
#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    /// Program to execute; `$SHELL` (or /bin/sh) when absent
    pub program: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    pub env: HashMap<String, String>,
    /// Pass `-l` to the default shell
    pub login_shell: bool,
}

/// Handle for sending input to and controlling a PTY session
pub struct PtyRuntime {
    /// Channel for sending input to the PTY writer task
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Handle to the PTY master for resizing
    master: Arc<StdMutex<Box<dyn MasterPty + Send>>>,
    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Flag indicating if the session is still alive
    alive: Arc<AtomicBool>,
    /// PID of the child process (if available)
    child_pid: Option<u32>,
    /// Recent output for reattaching clients
    replay: Arc<StdMutex<ReplayBuffer>>,
    size: StdMutex<(u16, u16)>,
}

impl PtyRuntime {
    /// Spawn a new PTY session
    ///
    /// Output and exit events go to `events`; the replay buffer is always
    /// updated before the corresponding event is sent.
    pub fn spawn(
        config: SpawnConfig,
        replay_cap: usize,
        events: mpsc::UnboundedSender<PtyEvent>,
    ) -> Result<Self> {
        let cols = if config.cols == 0 { DEFAULT_COLS } else { config.cols };
        let rows = if config.rows == 0 { DEFAULT_ROWS } else { config.rows };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let portable_pty::PtyPair { master, slave } = pair;

        let cmd = build_command(&config);
        let child = slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {}", describe_program(&config)))?;
        // The child holds its own copy; keeping ours would delay EOF on exit
        drop(slave);

        let child_pid = child.process_id();

        let (input_tx, input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (reader_done_tx, reader_done_rx) = std::sync::mpsc::channel::<()>();

        let alive = Arc::new(AtomicBool::new(true));
        let replay = Arc::new(StdMutex::new(ReplayBuffer::new(replay_cap)));

        let reader = master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = master.take_writer().context("Failed to take PTY writer")?;
        let master_handle = Arc::new(StdMutex::new(master));

        Self::spawn_reader_task(reader, events.clone(), Arc::clone(&replay), reader_done_tx);
        Self::spawn_writer_task(writer, input_rx, Arc::clone(&alive));
        Self::spawn_wait_task(child, events, shutdown_rx, reader_done_rx, Arc::clone(&alive));

        Ok(Self {
            input_tx,
            master: master_handle,
            shutdown_tx: Some(shutdown_tx),
            alive,
            child_pid,
            replay,
            size: StdMutex::new((cols, rows)),
        })
    }

    /// Spawn the reader task that reads PTY output
    ///
    /// Chunks are cut on UTF-8 boundaries so every event decodes cleanly.
    fn spawn_reader_task(
        mut reader: Box<dyn Read + Send>,
        events: mpsc::UnboundedSender<PtyEvent>,
        replay: Arc<StdMutex<ReplayBuffer>>,
        done: std::sync::mpsc::Sender<()>,
    ) {
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            let mut carry: Vec<u8> = Vec::new();

            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        carry.extend_from_slice(&buf[..n]);
                        let keep = incomplete_utf8_tail(&carry);
                        let data: Vec<u8> = carry.drain(..carry.len() - keep).collect();
                        if data.is_empty() {
                            continue;
                        }
                        let end_seq = match replay.lock() {
                            Ok(mut replay) => replay.push(&data),
                            Err(_) => break,
                        };
                        if events.send(PtyEvent::Output { data, end_seq }).is_err() {
                            // Nobody listens any more; keep draining so the child never blocks
                            continue;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how Linux reports a closed PTY
                        tracing::debug!(error = %e, "PTY reader finished");
                        break;
                    }
                }
            }

            if !carry.is_empty() {
                if let Ok(mut replay) = replay.lock() {
                    let end_seq = replay.push(&carry);
                    let _ = events.send(PtyEvent::Output {
                        data: carry,
                        end_seq,
                    });
                }
            }
            let _ = done.send(());
        });
    }

    /// Spawn the writer task that sends input to PTY
    fn spawn_writer_task(
        mut writer: Box<dyn Write + Send>,
        mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        alive: Arc<AtomicBool>,
    ) {
        std::thread::spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });
    }

    /// Spawn the task that waits for child process to exit
    ///
    /// The exit event is sent after the reader has drained (or a short
    /// timeout), so it always follows the final output event.
    fn spawn_wait_task(
        mut child: Box<dyn portable_pty::Child + Send + Sync>,
        events: mpsc::UnboundedSender<PtyEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
        reader_done: std::sync::mpsc::Receiver<()>,
        alive: Arc<AtomicBool>,
    ) {
        std::thread::spawn(move || {
            let exit_code = loop {
                match shutdown_rx.try_recv() {
                    Ok(_) | Err(oneshot::error::TryRecvError::Closed) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break None;
                    }
                    Err(oneshot::error::TryRecvError::Empty) => {}
                }

                match child.try_wait() {
                    Ok(Some(status)) => break Some(status.exit_code() as i32),
                    Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Error waiting for PTY child");
                        break None;
                    }
                }
            };

            alive.store(false, Ordering::SeqCst);
            let _ = reader_done.recv_timeout(READER_DRAIN_TIMEOUT);
            let _ = events.send(PtyEvent::Exited { exit_code });
        });
    }

    /// Get the child process PID
    pub fn pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Check if the session is still alive
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Queue input for the PTY
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        if !self.is_alive() {
            anyhow::bail!("PTY has exited");
        }
        self.input_tx
            .send(data.into())
            .map_err(|_| anyhow::anyhow!("PTY writer has stopped"))
    }

    /// Resize the PTY window
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| anyhow::anyhow!("PTY master lock poisoned"))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to resize PTY")?;
        if let Ok(mut size) = self.size.lock() {
            *size = (cols, rows);
        }
        Ok(())
    }

    /// Current geometry as (cols, rows)
    pub fn size(&self) -> (u16, u16) {
        self.size
            .lock()
            .map(|size| *size)
            .unwrap_or((DEFAULT_COLS, DEFAULT_ROWS))
    }

    /// Total bytes emitted so far
    pub fn output_seq(&self) -> u64 {
        self.replay.lock().map(|r| r.output_seq()).unwrap_or(0)
    }

    /// Buffered output from `since_seq` onward
    pub fn replay_since(&self, since_seq: Option<u64>) -> Replay {
        match self.replay.lock() {
            Ok(replay) => replay.since(since_seq),
            Err(poisoned) => poisoned.into_inner().since(since_seq),
        }
    }

    /// Stop the PTY session
    pub fn stop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for PtyRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Number of trailing bytes that form an incomplete UTF-8 sequence
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    let n = bytes.len();
    for back in 1..=n.min(3) {
        let b = bytes[n - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match b {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

fn describe_program(config: &SpawnConfig) -> String {
    config
        .program
        .clone()
        .unwrap_or_else(default_shell)
}

/// The user's shell, or /bin/sh
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Build a CommandBuilder from the spawn configuration
fn build_command(config: &SpawnConfig) -> CommandBuilder {
    let mut cmd = match &config.program {
        Some(program) => {
            let mut cmd = CommandBuilder::new(program);
            cmd.args(&config.args);
            cmd
        }
        None => {
            let mut cmd = CommandBuilder::new(default_shell());
            if config.login_shell {
                cmd.arg("-l");
            }
            cmd.args(&config.args);
            cmd
        }
    };

    if let Some(cwd) = config.cwd.as_ref().filter(|p| p.is_dir()) {
        cmd.cwd(cwd);
    }
    if !config.env.contains_key("TERM") {
        cmd.env("TERM", "xterm-256color");
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    cmd
}
