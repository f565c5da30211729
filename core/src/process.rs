//! Child-process supervision: line-oriented stdio reading, graceful
//! termination, and PID tracking.
//!
//! Per-child lifecycle: `Starting → Running → Terminating → Exited`.
//! `Starting → Running` is implicit on a successful spawn. Stdout and
//! stderr are read by dedicated tasks that deliver whole lines, in order,
//! into one bounded queue; a partial line at EOF is discarded with a
//! warning rather than delivered.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::process::Child;
use tracing::debug;
use tracing::warn;

use uuid::Uuid;

use crate::error::GatewayErr;
use crate::error::Result;
use crate::spawn::SpawnSpec;
use crate::spawn::spawn_agent_child;

/// Queue depth between the reader tasks and the turn loop. Reading pauses
/// when the consumer falls this far behind.
const LINE_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Starting,
    Running,
    Terminating,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One whole line from the child, tagged by source stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildLine {
    pub stream: OutputStream,
    pub line: String,
}

/// PID → session map shared across the gateway. Entries are removed when
/// the owning task reaps the child.
#[derive(Clone, Default)]
pub struct ProcessTable {
    inner: Arc<Mutex<HashMap<u32, Uuid>>>,
}

impl ProcessTable {
    fn insert(&self, pid: u32, session: Uuid) {
        if let Ok(mut table) = self.inner.lock() {
            table.insert(pid, session);
        }
    }

    fn remove(&self, pid: u32) {
        if let Ok(mut table) = self.inner.lock() {
            table.remove(&pid);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|table| table.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session_for(&self, pid: u32) -> Option<Uuid> {
        self.inner
            .lock()
            .ok()
            .and_then(|table| table.get(&pid).copied())
    }
}

/// Launches children and hands out supervised handles.
#[derive(Clone)]
pub struct Supervisor {
    table: ProcessTable,
    grace_period: Duration,
}

impl Supervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            table: ProcessTable::default(),
            grace_period,
        }
    }

    pub fn process_table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Spawn one child for `session`. On success the child is `Running`,
    /// its stdin is already closed, and both output streams are being read.
    pub async fn spawn(&self, spec: &SpawnSpec, session: Uuid) -> Result<SupervisedChild> {
        let child = spawn_agent_child(spec).await?;
        self.supervise(child, session)
    }

    /// Wire supervision around an already-spawned child whose stdout and
    /// stderr were configured as pipes.
    pub fn supervise(&self, mut child: Child, session: Uuid) -> Result<SupervisedChild> {
        let pid = child.id();

        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayErr::CliSpawnFailed("child stdout pipe was not captured".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            GatewayErr::CliSpawnFailed("child stderr pipe was not captured".to_string())
        })?;

        if let Some(pid) = pid {
            self.table.insert(pid, session);
        }

        let exited = Arc::new(AtomicBool::new(false));
        let (tx, rx) = async_channel::bounded::<ChildLine>(LINE_QUEUE_CAPACITY);
        tokio::spawn(read_lines(stdout, OutputStream::Stdout, tx.clone()));
        tokio::spawn(read_lines(stderr, OutputStream::Stderr, tx));

        debug!(?pid, %session, "agent child running");
        Ok(SupervisedChild {
            session,
            pid,
            state: ChildState::Running,
            child,
            lines: rx,
            exited,
            table: self.table.clone(),
            grace_period: self.grace_period,
        })
    }
}

/// A running child plus its line queue. Dropping the handle kills the child
/// unless it has already been reaped, so an aborted turn never leaks a
/// process.
pub struct SupervisedChild {
    session: Uuid,
    pid: Option<u32>,
    state: ChildState,
    child: Child,
    lines: async_channel::Receiver<ChildLine>,
    exited: Arc<AtomicBool>,
    table: ProcessTable,
    grace_period: Duration,
}

impl SupervisedChild {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    /// Next line from either stream; `None` once both streams reached EOF.
    pub async fn next_line(&mut self) -> Option<ChildLine> {
        self.lines.recv().await.ok()
    }

    /// Begin termination. Graceful sends SIGTERM to the child's process
    /// group and schedules a SIGKILL after the grace period unless the
    /// child exits first; forceful kills immediately.
    pub async fn request_terminate(&mut self, forceful: bool) {
        if self.state == ChildState::Exited {
            return;
        }
        self.state = ChildState::Terminating;

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                if forceful {
                    signal_group(pid, libc::SIGKILL);
                    return;
                }
                signal_group(pid, libc::SIGTERM);
                let exited = self.exited.clone();
                let grace = self.grace_period;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if !exited.load(Ordering::SeqCst) {
                        debug!(pid, "grace period expired, killing child group");
                        signal_group(pid, libc::SIGKILL);
                    }
                });
                return;
            }
        }

        // No pid (already reaped) or non-unix platform: the runtime kill is
        // the only lever available.
        let _ = forceful;
        if let Err(err) = self.child.start_kill() {
            warn!(session = %self.session, "start_kill failed: {err}");
        }
    }

    /// Await child exit and release its PID-table entry.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.mark_exited();
        Ok(status)
    }

    fn mark_exited(&mut self) {
        self.state = ChildState::Exited;
        self.exited.store(true, Ordering::SeqCst);
        if let Some(pid) = self.pid {
            self.table.remove(pid);
        }
    }
}

impl Drop for SupervisedChild {
    fn drop(&mut self) {
        if self.state != ChildState::Exited {
            let _ = self.child.start_kill();
            if let Some(pid) = self.pid {
                self.table.remove(pid);
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    // Negative pid targets the process group created at spawn.
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

async fn read_lines<R>(reader: R, stream: OutputStream, tx: async_channel::Sender<ChildLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = String::new();
    loop {
        buf.clear();
        match reader.read_line(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if !buf.ends_with('\n') {
                    // Partial line at EOF: the record is incomplete.
                    warn!(?stream, "discarding partial line at EOF ({} bytes)", buf.len());
                    break;
                }
                let line = buf.trim_end_matches(['\r', '\n']).to_string();
                if tx.send(ChildLine { stream, line }).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                // I/O errors after Running are logical EOF, not a crash.
                debug!(?stream, "read error treated as EOF: {err}");
                break;
            }
        }
    }
}
