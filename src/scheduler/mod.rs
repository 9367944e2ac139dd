//! Per-host work scheduler.
//!
//! Each host identity has at most one entry, and each entry at most one live
//! attempt task. An attempt connects, streams until the remote side stops or
//! the attempt is cancelled, and releases its session and file before the
//! task ends.
//!
//! ```text
//!            submit                     slot free               Ok / cancelled
//!   Idle ───────────▶ Scheduled ──────────────────▶ Running ───────────────────▶ Idle
//!                        ▲                             │
//!                        └──── backoff delay ──── error┘
//! ```
//!
//! A newer [`ReachabilityEvent`] for a host cancels the current attempt and
//! starts a new generation. The new generation's task first waits for the
//! old task to finish, so attempts for one host never overlap and the local
//! journal file never has two writers.
//!
//! Admission is bounded by a semaphore shared by all hosts. Failures back
//! off per host ([`BackoffPolicy`]); a clean stop resets the backoff and
//! leaves the host idle until the next event.

pub mod backoff;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

pub use backoff::BackoffPolicy;

use crate::cancel::{CancelHandle, CancelSignal};
use crate::fleet::{HostId, JournalLayout, ReachabilityEvent};
use crate::journal::{
    RemoteJournal, StreamEnd, StreamError, StreamOptions, StreamReport, stream_from_remote,
};
use crate::transport::{Connector, Route, TransportError};

/// Default number of attempts allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Why one attempt failed.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error("failed to connect: {0}")]
    Connect(#[from] TransportError),

    #[error("failed to stream journal: {0}")]
    Stream(#[from] StreamError),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub backoff: BackoffPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Everything an attempt needs besides the event itself.
pub struct AttemptContext {
    pub connector: Arc<dyn Connector>,
    pub route: Route,
    pub layout: JournalLayout,
    pub journal: RemoteJournal,
    pub stream: StreamOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Idle,
    Scheduled,
    Running,
}

/// Point-in-time view of one host, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub host: HostId,
    pub address: String,
    pub port: u16,
    pub generation: u64,
    pub state: HostState,
    pub failures: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
}

struct HostEntry {
    event: ReachabilityEvent,
    generation: u64,
    state: HostState,
    failures: u32,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
    cancel: CancelHandle,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Table {
    hosts: HashMap<HostId, HostEntry>,
    /// Tasks of retired hosts that may still be stopping.
    retiring: HashMap<HostId, JoinHandle<()>>,
    shutting_down: bool,
}

struct Inner {
    ctx: AttemptContext,
    backoff: BackoffPolicy,
    slots: Arc<Semaphore>,
    table: Mutex<Table>,
}

/// Drives mirroring attempts for every known host.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, ctx: AttemptContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                backoff: config.backoff,
                slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
                table: Mutex::new(Table::default()),
            }),
        }
    }

    /// Start (or restart) mirroring for the host in `event`.
    ///
    /// Any current attempt for the host is cancelled and a new one is
    /// scheduled immediately. Consecutive-failure count is kept. Returns
    /// `false` once the scheduler is shutting down.
    pub fn submit(&self, event: ReachabilityEvent) -> bool {
        let mut table = self.inner.table.lock();
        if table.shutting_down {
            debug!(host = %event.host, "ignoring event during shutdown");
            return false;
        }
        table.retiring.retain(|_, task| !task.is_finished());

        let host = event.host.clone();
        let previous = match table.hosts.get_mut(&host) {
            Some(entry) => {
                entry.cancel.cancel();
                entry.cancel = CancelHandle::new();
                entry.generation += 1;
                entry.event = event;
                entry.state = HostState::Scheduled;
                entry.next_attempt_at = Some(Utc::now());
                entry.task.take()
            }
            None => {
                let previous = table.retiring.remove(&host);
                table.hosts.insert(
                    host.clone(),
                    HostEntry {
                        event,
                        generation: 1,
                        state: HostState::Scheduled,
                        failures: 0,
                        next_attempt_at: Some(Utc::now()),
                        last_error: None,
                        last_success_at: None,
                        cancel: CancelHandle::new(),
                        task: None,
                    },
                );
                previous
            }
        };

        let Some(entry) = table.hosts.get_mut(&host) else {
            return false;
        };
        let generation = entry.generation;
        let signal = entry.cancel.signal();
        info!(
            host = %host,
            generation,
            address = %entry.event.address,
            port = entry.event.port,
            "scheduling journal mirror"
        );
        let span = info_span!("attempt", host = %host, generation);
        let inner = Arc::clone(&self.inner);
        entry.task = Some(tokio::spawn(
            drive(inner, host, generation, signal, previous).instrument(span),
        ));
        true
    }

    /// Stop mirroring `host` and forget it. Returns whether it was known.
    pub fn retire(&self, host: &HostId) -> bool {
        let mut table = self.inner.table.lock();
        table.retiring.retain(|_, task| !task.is_finished());
        let Some(mut entry) = table.hosts.remove(host) else {
            return false;
        };
        entry.cancel.cancel();
        if let Some(task) = entry.task.take() {
            table.retiring.insert(host.clone(), task);
        }
        info!(host = %host, "host retired");
        true
    }

    /// Cancel every attempt, refuse further submissions, and wait until all
    /// attempt tasks have released their sessions and files.
    pub async fn shutdown(&self) {
        let tasks: Vec<(HostId, JoinHandle<()>)> = {
            let mut table = self.inner.table.lock();
            table.shutting_down = true;
            let mut tasks: Vec<_> = table.retiring.drain().collect();
            for (host, entry) in table.hosts.iter_mut() {
                entry.cancel.cancel();
                if let Some(task) = entry.task.take() {
                    tasks.push((host.clone(), task));
                }
            }
            tasks
        };
        self.inner.slots.close();

        info!(tasks = tasks.len(), "waiting for attempts to stop");
        for (host, task) in tasks {
            if let Err(e) = task.await {
                warn!(host = %host, error = %e, "attempt task did not finish cleanly");
            }
        }
        info!("scheduler stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.table.lock().shutting_down
    }

    /// Status of every known host, ordered by identity.
    pub fn snapshot(&self) -> Vec<HostStatus> {
        let table = self.inner.table.lock();
        let mut statuses: Vec<HostStatus> = table
            .hosts
            .iter()
            .map(|(host, entry)| HostStatus {
                host: host.clone(),
                address: entry.event.address.clone(),
                port: entry.event.port,
                generation: entry.generation,
                state: entry.state,
                failures: entry.failures,
                next_attempt_at: entry.next_attempt_at,
                last_error: entry.last_error.clone(),
                last_success_at: entry.last_success_at,
            })
            .collect();
        statuses.sort_by(|a, b| a.host.cmp(&b.host));
        statuses
    }

    /// Status of one host.
    pub fn status(&self, host: &HostId) -> Option<HostStatus> {
        self.snapshot().into_iter().find(|s| &s.host == host)
    }
}

/// Body of one generation's task: wait for the predecessor, then attempt,
/// backing off after failures, until a clean stop or cancellation.
async fn drive(
    inner: Arc<Inner>,
    host: HostId,
    generation: u64,
    cancel: CancelSignal,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            warn!(error = %e, "previous attempt task did not finish cleanly");
        }
    }

    let mut delay = Duration::ZERO;
    loop {
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
        }

        let permit = tokio::select! {
            permit = Arc::clone(&inner.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = cancel.cancelled() => return,
        };

        let Some(event) = inner.begin(&host, generation, &cancel) else {
            return;
        };
        let outcome = inner.attempt(&event, &cancel).await;
        drop(permit);

        match outcome {
            Ok(report) => {
                inner.record_success(&host, generation, &report);
                return;
            }
            Err(e) if cancel.is_cancelled() => {
                debug!(error = %e, "attempt ended with an error after cancellation");
                return;
            }
            Err(e) => match inner.record_failure(&host, generation, &e) {
                Some(next) => delay = next,
                None => return,
            },
        }
    }
}

impl Inner {
    /// Mark the attempt running if its generation is still current.
    fn begin(
        &self,
        host: &HostId,
        generation: u64,
        cancel: &CancelSignal,
    ) -> Option<ReachabilityEvent> {
        let mut table = self.table.lock();
        if table.shutting_down || cancel.is_cancelled() {
            return None;
        }
        let entry = table.hosts.get_mut(host)?;
        if entry.generation != generation {
            return None;
        }
        entry.state = HostState::Running;
        entry.next_attempt_at = None;
        Some(entry.event.clone())
    }

    async fn attempt(
        &self,
        event: &ReachabilityEvent,
        cancel: &CancelSignal,
    ) -> Result<StreamReport, AttemptError> {
        let target = self.ctx.route.target(&event.address, event.port);
        debug!(target = %target, "connecting");
        let session = self.ctx.connector.connect(&target, cancel).await?;
        let local_path = self.ctx.layout.local_path(&event.host);
        let report = stream_from_remote(
            session,
            &self.ctx.journal,
            &local_path,
            cancel,
            &self.ctx.stream,
        )
        .await?;
        Ok(report)
    }

    fn record_success(&self, host: &HostId, generation: u64, report: &StreamReport) {
        match report.end {
            StreamEnd::Exited => info!(
                bytes = report.bytes_written,
                cursor_reset = report.cursor_reset,
                "remote journal stream ended"
            ),
            StreamEnd::Cancelled => info!(
                bytes = report.bytes_written,
                cursor_reset = report.cursor_reset,
                "journal mirror stopped"
            ),
        }
        let mut table = self.table.lock();
        if let Some(entry) = table.hosts.get_mut(host)
            && entry.generation == generation
        {
            entry.state = HostState::Idle;
            entry.failures = 0;
            entry.next_attempt_at = None;
            entry.last_error = None;
            entry.last_success_at = Some(Utc::now());
        }
    }

    /// Record a failure and return the delay before retrying, or `None` if
    /// this generation is no longer current.
    fn record_failure(
        &self,
        host: &HostId,
        generation: u64,
        error: &AttemptError,
    ) -> Option<Duration> {
        let mut table = self.table.lock();
        let entry = table.hosts.get_mut(host)?;
        if entry.generation != generation {
            return None;
        }
        entry.failures = entry.failures.saturating_add(1);
        let delay = self.backoff.delay(entry.failures);
        entry.state = HostState::Scheduled;
        entry.last_error = Some(error.to_string());
        entry.next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        warn!(
            error = %error,
            failures = entry.failures,
            retry_in = ?delay,
            "journal mirror attempt failed"
        );
        Some(delay)
    }
}
