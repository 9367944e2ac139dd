//! Host inventory file: the reachability source.
//!
//! The inventory is a TOML list of hosts. It is re-read whenever the file
//! changes and diffed against what was last applied, so only real changes
//! reach the scheduler:
//!
//! - a selected host with a new or changed address is submitted;
//! - a host that disappeared, or stopped matching the label selector, is
//!   retired;
//! - a host without an address is left alone until one appears.
//!
//! ```toml
//! [[hosts]]
//! namespace = "default"
//! name = "worker-0"
//! address = "10.0.0.5"
//! port = 22
//! labels = { role = "worker" }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher, recommended_watcher};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::fleet::{HostId, LabelSelector, ReachabilityEvent};
use crate::scheduler::Scheduler;

/// Quiet period after the last file event before reloading.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("failed to read inventory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse inventory {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid inventory {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("failed to watch inventory {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InventoryFile {
    #[serde(default)]
    hosts: Vec<InventoryHost>,
}

/// One `[[hosts]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryHost {
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl InventoryHost {
    pub fn id(&self) -> HostId {
        HostId {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// A parsed inventory, keyed by host identity.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: BTreeMap<HostId, InventoryHost>,
}

impl Inventory {
    pub fn parse(text: &str, path: &Path) -> Result<Self, InventoryError> {
        let file: InventoryFile = toml::from_str(text).map_err(|source| InventoryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let mut hosts = BTreeMap::new();
        for host in file.hosts {
            if host.name.trim().is_empty() {
                return Err(InventoryError::Invalid {
                    path: path.to_path_buf(),
                    reason: "host with empty name".into(),
                });
            }
            if matches!(&host.address, Some(a) if a.trim().is_empty()) {
                return Err(InventoryError::Invalid {
                    path: path.to_path_buf(),
                    reason: format!("host {} has an empty address", host.id()),
                });
            }
            let id = host.id();
            if hosts.insert(id.clone(), host).is_some() {
                return Err(InventoryError::Invalid {
                    path: path.to_path_buf(),
                    reason: format!("host {id} is listed more than once"),
                });
            }
        }
        Ok(Self { hosts })
    }

    pub async fn load(path: &Path) -> Result<Self, InventoryError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| InventoryError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text, path)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &InventoryHost> {
        self.hosts.values()
    }
}

/// Scheduler-facing side of the inventory, split out so the diff can be
/// exercised without spawning attempts.
pub trait FleetSink: Send + Sync {
    fn submit(&self, event: ReachabilityEvent) -> bool;
    fn retire(&self, host: &HostId) -> bool;
}

impl FleetSink for Scheduler {
    fn submit(&self, event: ReachabilityEvent) -> bool {
        Scheduler::submit(self, event)
    }

    fn retire(&self, host: &HostId) -> bool {
        Scheduler::retire(self, host)
    }
}

/// What one reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub submitted: usize,
    pub retired: usize,
    pub awaiting_address: usize,
}

/// Tracks the inventory file and the last listing applied to the fleet.
pub struct InventorySource {
    path: PathBuf,
    selector: LabelSelector,
    default_port: u16,
    /// Selected hosts and the event last submitted for each.
    applied: BTreeMap<HostId, Option<ReachabilityEvent>>,
}

impl InventorySource {
    pub fn new(path: impl Into<PathBuf>, selector: LabelSelector, default_port: u16) -> Self {
        Self {
            path: path.into(),
            selector,
            default_port,
            applied: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file and apply the difference. On error nothing is
    /// applied and the previous listing stays in effect.
    pub async fn reload(&mut self, sink: &dyn FleetSink) -> Result<ApplySummary, InventoryError> {
        let inventory = Inventory::load(&self.path).await?;
        Ok(self.apply(&inventory, sink))
    }

    pub fn apply(&mut self, inventory: &Inventory, sink: &dyn FleetSink) -> ApplySummary {
        let mut summary = ApplySummary::default();
        let mut next: BTreeMap<HostId, Option<ReachabilityEvent>> = BTreeMap::new();

        for host in inventory.hosts().filter(|h| self.selector.matches(&h.labels)) {
            let id = host.id();
            let previous = self.applied.get(&id).cloned().flatten();
            let Some(address) = &host.address else {
                debug!(host = %id, "host has no address yet, nothing to do");
                summary.awaiting_address += 1;
                next.insert(id, previous);
                continue;
            };
            let event = ReachabilityEvent::new(
                id.clone(),
                address.trim(),
                host.port.unwrap_or(self.default_port),
            );
            if previous.as_ref() != Some(&event) && sink.submit(event.clone()) {
                summary.submitted += 1;
            }
            next.insert(id, Some(event));
        }

        for id in self.applied.keys().filter(|id| !next.contains_key(*id)) {
            if sink.retire(id) {
                summary.retired += 1;
            }
        }

        self.applied = next;
        summary
    }
}

/// Reload the inventory whenever its file changes, until `shutdown` fires.
///
/// The parent directory is watched rather than the file itself so that
/// editors replacing the file atomically are still noticed.
pub async fn watch(
    mut source: InventorySource,
    sink: Scheduler,
    debounce: Duration,
    shutdown: CancelSignal,
) -> Result<(), InventoryError> {
    let path = source.path().to_path_buf();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path.file_name().map(|n| n.to_os_string());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) => {
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            let relevant = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if relevant {
                let _ = tx.send(());
            }
        }
        Err(e) => warn!(error = %e, "inventory watcher error"),
    })
    .map_err(|source| InventoryError::Watch {
        path: path.clone(),
        source,
    })?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|source| InventoryError::Watch {
            path: path.clone(),
            source,
        })?;
    info!(path = %path.display(), "watching inventory");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => {
                if event.is_none() {
                    break;
                }
            }
        }

        // Wait for the burst of events from one save to settle.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                more = tokio::time::timeout(debounce, rx.recv()) => match more {
                    Ok(Some(())) => continue,
                    Ok(None) | Err(_) => break,
                },
            }
        }

        if sink.is_shutting_down() {
            break;
        }
        match source.reload(&sink).await {
            Ok(summary) => info!(
                submitted = summary.submitted,
                retired = summary.retired,
                awaiting_address = summary.awaiting_address,
                "inventory reloaded"
            ),
            Err(e) => warn!(error = %e, "inventory reload failed, keeping previous listing"),
        }
    }

    debug!("inventory watcher stopped");
    Ok(())
}
