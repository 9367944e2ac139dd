//! In-memory fleet for integration tests.
//!
//! Each fake host keeps a journal (a list of entries), a cursor file and a
//! record of the commands it ran. `journalctl --follow --cursor-file` starts
//! after the cursor, emits new entries as they are appended and writes the
//! cursor back when it exits gracefully, like the real tool does on SIGTERM.
//! A session torn down without an interrupt loses the cursor update.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use journal_mirror::cancel::CancelSignal;
use journal_mirror::fleet::JournalLayout;
use journal_mirror::journal::{RemoteJournal, StreamOptions};
use journal_mirror::scheduler::{AttemptContext, BackoffPolicy, Scheduler, SchedulerConfig};
use journal_mirror::transport::run::RunOptions;
use journal_mirror::transport::{
    Connector, Credentials, ExitStatus, ProcessEvent, RemoteProcess, Route, Session, Target,
    TransportError,
};

/// How a fake `journalctl` reacts to SIGTERM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptBehavior {
    /// Save the cursor and exit.
    Obey,
    /// Accept the signal and keep running.
    Ignore,
    /// Refuse the signal request.
    Fail,
}

#[derive(Debug)]
struct FakeHost {
    journal: Vec<String>,
    cursor: Option<usize>,
    exit_when_drained: bool,
    interrupt: InterruptBehavior,
    refuse_connects: usize,
    follow_failure: Option<(u32, String)>,
    reset_failure: Option<(u32, String)>,
    follow_vanishes: bool,
    stall_exec: bool,
    commands: Vec<String>,
    targets: Vec<String>,
    connects: usize,
    open_sessions: usize,
    peak_sessions: usize,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            journal: Vec::new(),
            cursor: None,
            exit_when_drained: false,
            interrupt: InterruptBehavior::Obey,
            refuse_connects: 0,
            follow_failure: None,
            reset_failure: None,
            follow_vanishes: false,
            stall_exec: false,
            commands: Vec::new(),
            targets: Vec::new(),
            connects: 0,
            open_sessions: 0,
            peak_sessions: 0,
        }
    }
}

#[derive(Default)]
struct FleetState {
    hosts: HashMap<String, FakeHost>,
    open_total: usize,
    peak_total: usize,
}

/// Shared fake fleet, keyed by host address.
#[derive(Clone)]
pub struct FakeFleet {
    state: Arc<Mutex<FleetState>>,
    changed: Arc<watch::Sender<u64>>,
}

impl Default for FakeFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeFleet {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(FleetState::default())),
            changed: Arc::new(tx),
        }
    }

    fn bump(&self) {
        self.changed.send_modify(|v| *v += 1);
    }

    fn with_host<R>(&self, address: &str, f: impl FnOnce(&mut FakeHost) -> R) -> R {
        let mut state = self.state.lock();
        let host = state.hosts.entry(address.to_string()).or_default();
        f(host)
    }

    pub fn add_host(&self, address: &str) {
        self.with_host(address, |_| ());
    }

    pub fn append(&self, address: &str, entry: &str) {
        self.with_host(address, |h| h.journal.push(entry.to_string()));
        self.bump();
    }

    pub fn set_exit_when_drained(&self, address: &str, exit: bool) {
        self.with_host(address, |h| h.exit_when_drained = exit);
        self.bump();
    }

    pub fn set_interrupt(&self, address: &str, behavior: InterruptBehavior) {
        self.with_host(address, |h| h.interrupt = behavior);
    }

    pub fn refuse_connects(&self, address: &str, count: usize) {
        self.with_host(address, |h| h.refuse_connects = count);
    }

    pub fn fail_follow(&self, address: &str, code: u32, stderr: &str) {
        self.with_host(address, |h| h.follow_failure = Some((code, stderr.to_string())));
    }

    /// Make `rm` of the cursor file fail, leaving the cursor in place.
    pub fn fail_reset(&self, address: &str, code: u32, stderr: &str) {
        self.with_host(address, |h| h.reset_failure = Some((code, stderr.to_string())));
    }

    /// End the follow channel without an exit status.
    pub fn vanish_follow(&self, address: &str) {
        self.with_host(address, |h| h.follow_vanishes = true);
    }

    /// Commands are recorded but never start.
    pub fn stall_exec(&self, address: &str) {
        self.with_host(address, |h| h.stall_exec = true);
    }

    pub fn set_cursor(&self, address: &str, cursor: Option<usize>) {
        self.with_host(address, |h| h.cursor = cursor);
    }

    pub fn cursor(&self, address: &str) -> Option<usize> {
        self.with_host(address, |h| h.cursor)
    }

    pub fn commands(&self, address: &str) -> Vec<String> {
        self.with_host(address, |h| h.commands.clone())
    }

    pub fn targets(&self, address: &str) -> Vec<String> {
        self.with_host(address, |h| h.targets.clone())
    }

    pub fn connects(&self, address: &str) -> usize {
        self.with_host(address, |h| h.connects)
    }

    pub fn open_sessions(&self, address: &str) -> usize {
        self.with_host(address, |h| h.open_sessions)
    }

    pub fn peak_sessions(&self, address: &str) -> usize {
        self.with_host(address, |h| h.peak_sessions)
    }

    pub fn open_total(&self) -> usize {
        self.state.lock().open_total
    }

    pub fn peak_total(&self) -> usize {
        self.state.lock().peak_total
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            fleet: self.clone(),
        })
    }

    /// Open a session directly, bypassing the connector.
    pub fn session(&self, address: &str) -> Box<dyn Session> {
        self.open(address)
    }

    fn open(&self, address: &str) -> Box<dyn Session> {
        {
            let mut state = self.state.lock();
            let host = state.hosts.entry(address.to_string()).or_default();
            host.open_sessions += 1;
            host.peak_sessions = host.peak_sessions.max(host.open_sessions);
            state.open_total += 1;
            state.peak_total = state.peak_total.max(state.open_total);
        }
        Box::new(FakeSession {
            fleet: self.clone(),
            address: address.to_string(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

struct FakeConnector {
    fleet: FakeFleet,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        target: &Target,
        cancel: &CancelSignal,
    ) -> Result<Box<dyn Session>, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let address = target.destination().address.clone();
        let refused = self.fleet.with_host(&address, |h| {
            h.connects += 1;
            h.targets.push(target.to_string());
            if h.refuse_connects > 0 {
                h.refuse_connects -= 1;
                true
            } else {
                false
            }
        });
        if refused {
            return Err(TransportError::Connect {
                endpoint: target.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(self.fleet.open(&address))
    }
}

struct FakeSession {
    fleet: FakeFleet,
    address: String,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Session for FakeSession {
    async fn exec(&self, command: &str) -> Result<Box<dyn RemoteProcess>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let (start, stall) = self.fleet.with_host(&self.address, |h| {
            h.commands.push(command.to_string());
            (h.cursor.unwrap_or(0), h.stall_exec)
        });
        if stall {
            std::future::pending::<()>().await;
        }
        let kind = if command.starts_with("rm --force ") {
            ProcessKind::RemoveCursor
        } else if command.contains("journalctl --follow --no-tail --cursor-file=") {
            ProcessKind::Follow { position: start }
        } else {
            ProcessKind::Unknown
        };
        Ok(Box::new(FakeProcess {
            fleet: self.fleet.clone(),
            address: self.address.clone(),
            closed: Arc::clone(&self.closed),
            changed: self.fleet.changed.subscribe(),
            kind,
            interrupted: false,
            exited: false,
            pending_exit: None,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = self.fleet.state.lock();
            if let Some(host) = state.hosts.get_mut(&self.address) {
                host.open_sessions -= 1;
            }
            state.open_total -= 1;
        }
        self.fleet.bump();
        Ok(())
    }
}

enum ProcessKind {
    RemoveCursor,
    Follow { position: usize },
    Unknown,
}

struct FakeProcess {
    fleet: FakeFleet,
    address: String,
    closed: Arc<AtomicBool>,
    changed: watch::Receiver<u64>,
    kind: ProcessKind,
    interrupted: bool,
    exited: bool,
    pending_exit: Option<ExitStatus>,
}

impl FakeProcess {
    fn exit(&mut self, status: ExitStatus) -> Option<ProcessEvent> {
        self.exited = true;
        Some(ProcessEvent::Exited(status))
    }

    fn save_cursor(&self, position: usize) {
        self.fleet.with_host(&self.address, |h| h.cursor = Some(position));
    }
}

#[async_trait]
impl RemoteProcess for FakeProcess {
    async fn next_event(&mut self) -> Option<ProcessEvent> {
        loop {
            if self.exited || self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(status) = self.pending_exit.take() {
                return self.exit(status);
            }
            self.changed.borrow_and_update();

            match self.kind {
                ProcessKind::RemoveCursor => {
                    let failure = self.fleet.with_host(&self.address, |h| {
                        let failure = h.reset_failure.clone();
                        if failure.is_none() {
                            h.cursor = None;
                        }
                        failure
                    });
                    let Some((code, stderr)) = failure else {
                        return self.exit(ExitStatus::Code(0));
                    };
                    self.pending_exit = Some(ExitStatus::Code(code));
                    return Some(ProcessEvent::Stderr(stderr.into_bytes()));
                }
                ProcessKind::Unknown => {
                    return self.exit(ExitStatus::Code(127));
                }
                ProcessKind::Follow { position } => {
                    if self.interrupted {
                        self.save_cursor(position);
                        return self.exit(ExitStatus::Signal("TERM".into()));
                    }
                    let (failure, next, exit_when_drained, vanishes) =
                        self.fleet.with_host(&self.address, |h| {
                            (
                                h.follow_failure.clone(),
                                h.journal.get(position).cloned(),
                                h.exit_when_drained,
                                h.follow_vanishes,
                            )
                        });
                    if let Some((code, stderr)) = failure {
                        self.fleet.with_host(&self.address, |h| h.follow_failure = None);
                        if stderr.is_empty() {
                            return self.exit(ExitStatus::Code(code));
                        }
                        self.pending_exit = Some(ExitStatus::Code(code));
                        return Some(ProcessEvent::Stderr(stderr.into_bytes()));
                    }
                    if let Some(entry) = next {
                        self.kind = ProcessKind::Follow {
                            position: position + 1,
                        };
                        return Some(ProcessEvent::Stdout(entry.into_bytes()));
                    }
                    if vanishes {
                        self.exited = true;
                        return None;
                    }
                    if exit_when_drained {
                        self.save_cursor(position);
                        return self.exit(ExitStatus::Code(0));
                    }
                }
            }

            if self.changed.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn interrupt(&mut self) -> Result<(), TransportError> {
        let behavior = self.fleet.with_host(&self.address, |h| h.interrupt);
        match behavior {
            InterruptBehavior::Obey => {
                self.interrupted = true;
                Ok(())
            }
            InterruptBehavior::Ignore => Ok(()),
            InterruptBehavior::Fail => Err(TransportError::Channel("signal refused".into())),
        }
    }
}

pub fn route() -> Route {
    Route::direct(Arc::new(Credentials::new("core", "unused")))
}

pub fn stream_options(grace: Duration) -> StreamOptions {
    StreamOptions {
        run: RunOptions {
            interrupt_grace: grace,
            stderr_limit: 1024,
        },
    }
}

pub fn scheduler(
    fleet: &FakeFleet,
    dir: &Path,
    max_concurrent: usize,
    backoff: BackoffPolicy,
) -> Scheduler {
    Scheduler::new(
        SchedulerConfig {
            max_concurrent,
            backoff,
        },
        AttemptContext {
            connector: fleet.connector(),
            route: route(),
            layout: JournalLayout::new(dir),
            journal: RemoteJournal::default(),
            stream: stream_options(Duration::from_millis(200)),
        },
    )
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn read_file(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}
