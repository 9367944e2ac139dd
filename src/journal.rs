//! Cursor-resume journal streaming.
//!
//! The remote `journalctl` keeps its resume position in a cursor file on the
//! remote host; the local copy is an append-only file. The two must move
//! together:
//!
//! - local file present, cursor present: resume after the cursor and append.
//! - local file missing: the cursor is stale, so it is force-deleted
//!   **before** streaming. Otherwise a fresh local file would silently start
//!   mid-journal.
//!
//! That reset is the only reconciliation performed. Journal content is never
//! parsed; remote stdout is appended byte for byte.
//!
//! # Example
//!
//! ```rust,ignore
//! use journal_mirror::journal::{RemoteJournal, StreamOptions, stream_from_remote};
//!
//! let journal = RemoteJournal::new("$HOME/machine-monitor-journald.cursor", true);
//! let session = connector.connect(&target, &cancel).await?;
//! let opts = StreamOptions::default();
//! let report = stream_from_remote(session, &journal, &local_path, &cancel, &opts).await?;
//! println!("appended {} bytes", report.bytes_written);
//! ```

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::OpenOptions;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::transport::run::{RunError, RunOptions, run_command};
use crate::transport::{ExitStatus, Session, TransportError};

/// Default remote cursor location, expanded by the remote shell.
pub const DEFAULT_CURSOR_PATH: &str = "$HOME/machine-monitor-journald.cursor";

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("local journal file {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to reset remote journald cursor with {command:?}: {reason}")]
    CursorReset { command: String, reason: String },

    #[error("failed to start {command:?} on remote host: {source}")]
    Start {
        command: String,
        #[source]
        source: TransportError,
    },

    #[error("remote command {command:?} failed with {status}: stderr={stderr:?}")]
    RemoteCommand {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("remote command {command:?} ended without an exit status: stderr={stderr:?}")]
    UnexpectedEnd { command: String, stderr: String },
}

/// The two remote command shapes issued against a host.
#[derive(Debug, Clone)]
pub struct RemoteJournal {
    cursor_path: String,
    use_sudo: bool,
}

impl RemoteJournal {
    pub fn new(cursor_path: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            cursor_path: cursor_path.into(),
            use_sudo,
        }
    }

    pub fn cursor_path(&self) -> &str {
        &self.cursor_path
    }

    /// Follow the journal from the cursor, creating and updating the cursor file.
    pub fn follow_command(&self) -> String {
        let sudo = if self.use_sudo { "sudo " } else { "" };
        format!(
            "{sudo}journalctl --follow --no-tail --cursor-file={}",
            remote_path_arg(&self.cursor_path)
        )
    }

    /// Delete the cursor file; succeeds when it is already absent.
    pub fn reset_cursor_command(&self) -> String {
        format!("rm --force {}", remote_path_arg(&self.cursor_path))
    }
}

impl Default for RemoteJournal {
    fn default() -> Self {
        Self::new(DEFAULT_CURSOR_PATH, true)
    }
}

/// Quote a remote path for the remote shell, keeping a leading `$HOME/` or
/// `~/` expandable.
pub fn remote_path_arg(path: &str) -> String {
    for prefix in ["$HOME/", "~/"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            return format!("\"$HOME\"/{}", shell_words::quote(rest));
        }
    }
    shell_words::quote(path).into_owned()
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub run: RunOptions,
}

/// Why a stream ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The remote command exited successfully on its own.
    Exited,
    /// Cancellation stopped the attempt.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct StreamReport {
    pub end: StreamEnd,
    /// The remote cursor was deleted because the local file was missing.
    pub cursor_reset: bool,
    pub bytes_written: u64,
}

/// Stream the remote journal into `local_path` until the remote command
/// ends or `cancel` fires.
///
/// Takes ownership of `session` and closes it on every path. Returns
/// `Ok` on a cancellation-induced stop even if the remote command reported
/// an error while being stopped.
pub async fn stream_from_remote(
    session: Box<dyn Session>,
    journal: &RemoteJournal,
    local_path: &Path,
    cancel: &CancelSignal,
    opts: &StreamOptions,
) -> Result<StreamReport, StreamError> {
    let result = stream(session.as_ref(), journal, local_path, cancel, opts).await;
    if let Err(e) = session.close().await {
        warn!(error = %e, "failed to close session");
    }
    result
}

async fn stream(
    session: &dyn Session,
    journal: &RemoteJournal,
    local_path: &Path,
    cancel: &CancelSignal,
    opts: &StreamOptions,
) -> Result<StreamReport, StreamError> {
    if cancel.is_cancelled() {
        return Ok(StreamReport {
            end: StreamEnd::Cancelled,
            cursor_reset: false,
            bytes_written: 0,
        });
    }

    let local_io = |source| StreamError::LocalIo {
        path: local_path.to_path_buf(),
        source,
    };

    let exists = tokio::fs::try_exists(local_path).await.map_err(local_io)?;
    let mut cursor_reset = false;
    if !exists {
        debug!(
            cursor = %journal.cursor_path(),
            local = %local_path.display(),
            "local journal file does not exist, removing remote journald cursor file"
        );
        if !reset_cursor(session, journal, cancel, opts).await? {
            return Ok(StreamReport {
                end: StreamEnd::Cancelled,
                cursor_reset: false,
                bytes_written: 0,
            });
        }
        cursor_reset = true;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(local_path)
        .await
        .map_err(local_io)?;

    let command = journal.follow_command();
    debug!(command = %command, "running command on remote host");
    let run = run_command(session, &command, &mut file, cancel, &opts.run).await;

    if let Err(e) = file.sync_all().await {
        warn!(error = %e, local = %local_path.display(), "failed to sync local journal file");
    }
    drop(file);

    let report = match run {
        Ok(report) => report,
        Err(RunError::Start(source)) => return Err(StreamError::Start { command, source }),
        Err(RunError::Sink(source)) => return Err(local_io(source)),
    };

    if report.cancelled || cancel.is_cancelled() {
        info!(
            bytes = report.stdout_bytes,
            forced_close = report.forced_close,
            "journal stream stopped on cancellation"
        );
        return Ok(StreamReport {
            end: StreamEnd::Cancelled,
            cursor_reset,
            bytes_written: report.stdout_bytes,
        });
    }

    match report.exit {
        Some(status) if status.success() => Ok(StreamReport {
            end: StreamEnd::Exited,
            cursor_reset,
            bytes_written: report.stdout_bytes,
        }),
        Some(status) => Err(StreamError::RemoteCommand {
            command,
            status,
            stderr: report.stderr,
        }),
        None => Err(StreamError::UnexpectedEnd {
            command,
            stderr: report.stderr,
        }),
    }
}

/// Force-delete the remote cursor. `Ok(false)` means cancellation
/// interrupted the reset and streaming must not start.
async fn reset_cursor(
    session: &dyn Session,
    journal: &RemoteJournal,
    cancel: &CancelSignal,
    opts: &StreamOptions,
) -> Result<bool, StreamError> {
    let command = journal.reset_cursor_command();
    debug!(command = %command, "running command on remote host");
    let report = run_command(session, &command, &mut tokio::io::sink(), cancel, &opts.run)
        .await
        .map_err(|e| StreamError::CursorReset {
            command: command.clone(),
            reason: e.to_string(),
        })?;

    if report.cancelled || cancel.is_cancelled() {
        return Ok(false);
    }
    match report.exit {
        Some(status) if status.success() => Ok(true),
        Some(status) => Err(StreamError::CursorReset {
            command,
            reason: format!("{status}: stderr={:?}", report.stderr),
        }),
        None => Err(StreamError::CursorReset {
            command,
            reason: format!("channel closed without exit status: stderr={:?}", report.stderr),
        }),
    }
}
