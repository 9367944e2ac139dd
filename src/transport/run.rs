//! Run a remote command to completion, stopping it cleanly on cancellation.
//!
//! A run moves through an explicit sequence of phases:
//!
//! ```text
//! Running ──cancel──▶ InterruptRequested ──grace expires──▶ ForceClosed ──grace expires──▶ Stopped (abandoned)
//!    │                        │                                  │
//!    │               interrupt fails ─────────────────────────▶ │
//!    └──────────── channel ends ────────────┴─────────────────────┴──────────────────────▶ Stopped
//! ```
//!
//! Output keeps flowing to the sink in every phase until the channel ends,
//! so bytes the remote emitted before stopping are never discarded.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ExitStatus, ProcessEvent, RemoteProcess, Session, TransportError};
use crate::cancel::CancelSignal;

/// Default time allowed for each stopping phase.
pub const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_secs(10);

/// Default cap on captured stderr.
pub const DEFAULT_STDERR_LIMIT: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to start remote command: {0}")]
    Start(#[source] TransportError),

    #[error("failed to write command output: {0}")]
    Sink(#[source] std::io::Error),
}

/// Where a run is in its stop sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    InterruptRequested,
    ForceClosed,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// How long each stopping phase may take before escalating.
    pub interrupt_grace: Duration,
    /// Maximum stderr bytes kept for diagnostics.
    pub stderr_limit: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            interrupt_grace: DEFAULT_INTERRUPT_GRACE,
            stderr_limit: DEFAULT_STDERR_LIMIT,
        }
    }
}

/// What happened during a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub exit: Option<ExitStatus>,
    pub stderr: String,
    pub stdout_bytes: u64,
    /// Cancellation was observed while the command was running.
    pub cancelled: bool,
    /// The session was closed underneath the command.
    pub forced_close: bool,
    /// The channel never ended, even after the forced close.
    pub abandoned: bool,
    /// Every phase the run passed through, in order.
    pub phases: Vec<RunPhase>,
}

/// Bounded stderr capture. Keeps the head of the stream.
#[derive(Debug)]
pub struct StderrBuffer {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl StderrBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if self.truncated {
            text.push_str("...(truncated)");
        }
        text
    }
}

struct Stopper<'a> {
    session: &'a dyn Session,
    grace: Duration,
    phase: RunPhase,
    phases: Vec<RunPhase>,
    deadline: Option<Instant>,
    forced_close: bool,
}

impl Stopper<'_> {
    fn enter(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.phases.push(phase);
    }

    async fn interrupt(&mut self, process: &mut dyn RemoteProcess) {
        match tokio::time::timeout(self.grace, process.interrupt()).await {
            Ok(Ok(())) => {
                debug!("interrupt sent to remote command");
                self.enter(RunPhase::InterruptRequested);
                self.deadline = Some(Instant::now() + self.grace);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to interrupt remote command, closing session");
                self.force_close().await;
            }
            Err(_) => {
                warn!(grace = ?self.grace, "interrupt request stalled, closing session");
                self.force_close().await;
            }
        }
    }

    async fn force_close(&mut self) {
        match tokio::time::timeout(self.grace, self.session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to close session"),
            Err(_) => warn!(grace = ?self.grace, "session close stalled"),
        }
        self.forced_close = true;
        self.enter(RunPhase::ForceClosed);
        self.deadline = Some(Instant::now() + self.grace);
    }
}

/// Run `command` on `session`, streaming stdout into `stdout`.
///
/// Returns once the remote channel has ended. When `cancel` fires the
/// command is interrupted and the run keeps waiting for it to stop; if the
/// interrupt cannot be sent, or is ignored for `interrupt_grace`, the
/// session is closed instead. A channel that outlives even that is
/// abandoned after a second grace period. Cancellation while the command
/// is still being started returns a cancelled report without output.
pub async fn run_command<W>(
    session: &dyn Session,
    command: &str,
    stdout: &mut W,
    cancel: &CancelSignal,
    opts: &RunOptions,
) -> Result<RunReport, RunError>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let started = tokio::select! {
        biased;
        res = session.exec(command) => Some(res),
        _ = cancel.cancelled() => None,
    };
    let mut process = match started {
        Some(res) => res.map_err(RunError::Start)?,
        None => {
            debug!("cancelled while starting remote command");
            return Ok(RunReport {
                exit: None,
                stderr: String::new(),
                stdout_bytes: 0,
                cancelled: true,
                forced_close: false,
                abandoned: false,
                phases: vec![RunPhase::Stopped],
            });
        }
    };

    let mut stopper = Stopper {
        session,
        grace: opts.interrupt_grace,
        phase: RunPhase::Running,
        phases: vec![RunPhase::Running],
        deadline: None,
        forced_close: false,
    };
    let mut stderr = StderrBuffer::new(opts.stderr_limit);
    let mut exit = None;
    let mut stdout_bytes = 0u64;
    let mut cancelled = false;
    let mut abandoned = false;
    let mut sink_error = None;

    loop {
        let deadline = stopper.deadline;
        let running = stopper.phase == RunPhase::Running && exit.is_none();
        tokio::select! {
            biased;
            _ = cancel.cancelled(), if running => {
                cancelled = true;
                stopper.interrupt(process.as_mut()).await;
            }
            _ = sleep_until_opt(deadline), if deadline.is_some() => {
                match stopper.phase {
                    // Exit status seen and the drain window is over.
                    RunPhase::Running => break,
                    RunPhase::InterruptRequested => {
                        warn!(
                            grace = ?opts.interrupt_grace,
                            "remote command ignored interrupt, closing session"
                        );
                        stopper.force_close().await;
                    }
                    RunPhase::ForceClosed | RunPhase::Stopped => {
                        warn!("remote command still attached after forced close, abandoning it");
                        abandoned = true;
                        break;
                    }
                }
            }
            event = process.next_event() => match event {
                Some(ProcessEvent::Stdout(chunk)) => {
                    if sink_error.is_some() {
                        continue;
                    }
                    match stdout.write_all(&chunk).await {
                        Ok(()) => stdout_bytes += chunk.len() as u64,
                        Err(e) => {
                            warn!(error = %e, "failed to write remote output, stopping command");
                            sink_error = Some(e);
                            if stopper.phase == RunPhase::Running {
                                stopper.interrupt(process.as_mut()).await;
                            }
                        }
                    }
                }
                Some(ProcessEvent::Stderr(chunk)) => stderr.push(&chunk),
                Some(ProcessEvent::Exited(status)) => {
                    debug!(status = %status, "remote command exited");
                    exit = Some(status);
                    if stopper.phase == RunPhase::Running {
                        stopper.deadline = Some(Instant::now() + opts.interrupt_grace);
                    }
                }
                None => break,
            },
        }
    }
    stopper.enter(RunPhase::Stopped);

    if let Err(e) = stdout.flush().await {
        sink_error.get_or_insert(e);
    }
    if let Some(e) = sink_error {
        return Err(RunError::Sink(e));
    }

    Ok(RunReport {
        exit,
        stderr: stderr.into_string(),
        stdout_bytes,
        cancelled,
        forced_close: stopper.forced_close,
        abandoned,
        phases: stopper.phases,
    })
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
