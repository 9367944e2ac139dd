//! Transport layer: authenticated sessions to fleet hosts.
//!
//! The traits here are the seam between the streaming engine and the wire:
//!
//! - [`Connector`] opens a [`Session`] to a [`Target`], directly or through
//!   one relay hop, honouring cancellation until the handshake completes.
//! - [`Session`] starts remote commands and can be closed at any time,
//!   including while a command is still running (the forced-close path).
//! - [`RemoteProcess`] yields the command's output and exit status and
//!   accepts an interrupt request.
//!
//! [`ssh`] implements them over SSH. Tests implement them in memory.
//! Nothing in this layer retries; a failed connect is reported to the caller.

pub mod run;
pub mod ssh;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::cancel::CancelSignal;

/// Errors raised while establishing or using a session.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("connection to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("authentication as {user} to {endpoint} was rejected")]
    AuthRejected { user: String, endpoint: String },

    #[error("relay {relay} could not open a tunnel to {target}: {reason}")]
    Relay {
        relay: String,
        target: String,
        reason: String,
    },

    #[error("invalid private key for {user}: {reason}")]
    InvalidKey { user: String, reason: String },

    #[error("channel error: {0}")]
    Channel(String),

    #[error("session is closed")]
    Closed,

    #[error("connection setup cancelled")]
    Cancelled,
}

/// Login material for one hop. The key text is wiped on drop.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub private_key: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            private_key: Zeroizing::new(private_key.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// One SSH hop: where to connect and who to log in as.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    pub credentials: Arc<Credentials>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16, credentials: Arc<Credentials>) -> Self {
        Self {
            address: address.into(),
            port,
            credentials,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Bracket bare IPv6 literals so the port stays unambiguous.
        if self.address.contains(':') && !self.address.starts_with('[') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// Connection topology for one attempt.
#[derive(Debug, Clone)]
pub enum Target {
    /// Connect straight to the host.
    Direct(Endpoint),
    /// Connect to `relay`, then tunnel a second session to `target` through it.
    Relayed { relay: Endpoint, target: Endpoint },
}

impl Target {
    /// The host whose journal is being mirrored.
    pub fn destination(&self) -> &Endpoint {
        match self {
            Target::Direct(endpoint) => endpoint,
            Target::Relayed { target, .. } => target,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Direct(endpoint) => write!(f, "{endpoint}"),
            Target::Relayed { relay, target } => write!(f, "{target} via {relay}"),
        }
    }
}

/// Process-wide routing: the credentials for fleet hosts and the optional relay.
#[derive(Debug, Clone)]
pub struct Route {
    pub credentials: Arc<Credentials>,
    pub relay: Option<Endpoint>,
}

impl Route {
    pub fn direct(credentials: Arc<Credentials>) -> Self {
        Self {
            credentials,
            relay: None,
        }
    }

    pub fn via_relay(credentials: Arc<Credentials>, relay: Endpoint) -> Self {
        Self {
            credentials,
            relay: Some(relay),
        }
    }

    /// The target for a host reachable at `address:port`.
    pub fn target(&self, address: &str, port: u16) -> Target {
        let target = Endpoint::new(address, port, Arc::clone(&self.credentials));
        match &self.relay {
            None => Target::Direct(target),
            Some(relay) => Target::Relayed {
                relay: relay.clone(),
                target,
            },
        }
    }
}

/// How a remote command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Code(u32),
    Signal(String),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit status {code}"),
            ExitStatus::Signal(name) => write!(f, "killed by signal {name}"),
        }
    }
}

/// One observation from a running remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exited(ExitStatus),
}

/// A command running on the remote host.
#[async_trait]
pub trait RemoteProcess: Send {
    /// Next output chunk or exit status; `None` once the channel is gone.
    ///
    /// Must be cancel-safe: it is raced against cancellation and timers.
    async fn next_event(&mut self) -> Option<ProcessEvent>;

    /// Ask the remote side to terminate the command.
    async fn interrupt(&mut self) -> Result<(), TransportError>;
}

/// An established session to exactly one host.
#[async_trait]
pub trait Session: Send + Sync {
    /// Start `command` on the remote host.
    async fn exec(&self, command: &str) -> Result<Box<dyn RemoteProcess>, TransportError>;

    /// Release the session. Commands still running on it end.
    ///
    /// Closing twice is harmless; the second call may report an error.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `target`.
    ///
    /// If `cancel` fires before the session is fully established this
    /// returns [`TransportError::Cancelled`] and drops any half-open socket.
    /// Cancellation after that point is the caller's to observe.
    async fn connect(
        &self,
        target: &Target,
        cancel: &CancelSignal,
    ) -> Result<Box<dyn Session>, TransportError>;
}

/// Run a setup step unless `cancel` fires first.
pub(crate) async fn unless_cancelled<T, F>(
    cancel: &CancelSignal,
    step: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    if cancel.is_cancelled() {
        return Err(TransportError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        res = step => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;

    fn creds(user: &str) -> Arc<Credentials> {
        Arc::new(Credentials::new(user, "KEY"))
    }

    #[test]
    fn test_route_direct_target() {
        let route = Route::direct(creds("core"));
        let target = route.target("10.0.0.5", 22);
        assert!(matches!(target, Target::Direct(_)));
        assert_eq!(target.destination().address, "10.0.0.5");
        assert_eq!(target.to_string(), "10.0.0.5:22");
    }

    #[test]
    fn test_route_relayed_target() {
        let relay = Endpoint::new("bastion.example", 2222, creds("jump"));
        let route = Route::via_relay(creds("core"), relay);
        let target = route.target("10.0.0.5", 22);
        match &target {
            Target::Relayed { relay, target } => {
                assert_eq!(relay.credentials.username, "jump");
                assert_eq!(target.credentials.username, "core");
            }
            Target::Direct(_) => panic!("expected relayed target"),
        }
        assert_eq!(target.to_string(), "10.0.0.5:22 via bastion.example:2222");
    }

    #[test]
    fn test_endpoint_display_brackets_ipv6() {
        let endpoint = Endpoint::new("fd00::5", 22, creds("core"));
        assert_eq!(endpoint.to_string(), "[fd00::5]:22");
    }

    #[test]
    fn test_credentials_debug_redacts_key() {
        let rendered = format!("{:?}", Credentials::new("core", "-----BEGIN SECRET-----"));
        assert!(rendered.contains("core"));
        assert!(!rendered.contains("BEGIN"));
    }

    #[test]
    fn test_exit_status_success() {
        assert!(ExitStatus::Code(0).success());
        assert!(!ExitStatus::Code(1).success());
        assert!(!ExitStatus::Signal("TERM".into()).success());
        assert_eq!(ExitStatus::Code(3).to_string(), "exit status 3");
    }

    #[tokio::test]
    async fn test_unless_cancelled_short_circuits() {
        let handle = CancelHandle::new();
        handle.cancel();
        let res: Result<(), _> = unless_cancelled(&handle.signal(), async { Ok(()) }).await;
        assert!(matches!(res, Err(TransportError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unless_cancelled_interrupts_pending_step() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        let step = async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok::<_, TransportError>(())
        };
        let canceller = async {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            handle.cancel();
        };
        let (res, ()) = tokio::join!(unless_cancelled(&signal, step), canceller);
        assert!(matches!(res, Err(TransportError::Cancelled)));
    }
}
