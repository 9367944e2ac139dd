//! SSH sessions over `russh`.
//!
//! A relayed target is reached by opening a `direct-tcpip` channel on the
//! relay session and running a second SSH handshake over that channel, so
//! the relay never sees the target's credentials. Closing the relay
//! session tears the tunnel (and the inner session) down with it.
//!
//! Host keys are not verified: fleet hosts are short-lived and re-keyed on
//! every boot, and the mirror only ever reads from them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::{
    Connector, Credentials, Endpoint, ExitStatus, ProcessEvent, RemoteProcess, Session, Target,
    TransportError, unless_cancelled,
};
use crate::cancel::CancelSignal;

/// SSH extended-data type code for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Connection tuning for [`SshConnector`].
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Upper bound for TCP connect plus handshake, per hop.
    pub connect_timeout: Duration,
    /// Keepalive probe interval; a silent peer is dropped after `keepalive_max` misses.
    pub keepalive_interval: Duration,
    pub keepalive_max: usize,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            keepalive_max: 3,
        }
    }
}

/// Decode the private key held in `credentials`.
pub fn parse_key(credentials: &Credentials) -> Result<Arc<KeyPair>, TransportError> {
    russh_keys::decode_secret_key(&credentials.private_key, None)
        .map(Arc::new)
        .map_err(|e| TransportError::InvalidKey {
            user: credentials.username.clone(),
            reason: e.to_string(),
        })
}

struct AcceptHostKey;

#[async_trait]
impl client::Handler for AcceptHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

type SshHandle = Handle<AcceptHostKey>;

/// [`Connector`] that speaks SSH.
pub struct SshConnector {
    options: SshOptions,
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(options.keepalive_interval),
            keepalive_max: options.keepalive_max,
            ..Default::default()
        };
        Self {
            options,
            config: Arc::new(config),
        }
    }

    async fn dial(&self, endpoint: &Endpoint) -> Result<SshHandle, TransportError> {
        let key = parse_key(&endpoint.credentials)?;
        debug!(endpoint = %endpoint, user = %endpoint.credentials.username, "dialing");

        let connecting = client::connect(
            Arc::clone(&self.config),
            (endpoint.address.as_str(), endpoint.port),
            AcceptHostKey,
        );
        let mut handle = tokio::time::timeout(self.options.connect_timeout, connecting)
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: endpoint.to_string(),
                timeout: self.options.connect_timeout,
            })?
            .map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        authenticate(&mut handle, endpoint, key).await?;
        Ok(handle)
    }

    async fn handshake_over<S>(
        &self,
        stream: S,
        endpoint: &Endpoint,
    ) -> Result<SshHandle, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let key = parse_key(&endpoint.credentials)?;
        let connecting = client::connect_stream(Arc::clone(&self.config), stream, AcceptHostKey);
        let mut handle = tokio::time::timeout(self.options.connect_timeout, connecting)
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: endpoint.to_string(),
                timeout: self.options.connect_timeout,
            })?
            .map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        authenticate(&mut handle, endpoint, key).await?;
        Ok(handle)
    }

    async fn open(&self, target: &Target) -> Result<SshSession, TransportError> {
        match target {
            Target::Direct(endpoint) => {
                let handle = self.dial(endpoint).await?;
                Ok(SshSession::new(handle, None))
            }
            Target::Relayed { relay, target } => {
                let relay_handle = self.dial(relay).await?;
                let tunnel = relay_handle
                    .channel_open_direct_tcpip(
                        target.address.clone(),
                        u32::from(target.port),
                        "127.0.0.1",
                        0,
                    )
                    .await
                    .map_err(|e| TransportError::Relay {
                        relay: relay.to_string(),
                        target: target.to_string(),
                        reason: e.to_string(),
                    })?;
                let handle = self.handshake_over(tunnel.into_stream(), target).await?;
                Ok(SshSession::new(handle, Some(relay_handle)))
            }
        }
    }
}

async fn authenticate(
    handle: &mut SshHandle,
    endpoint: &Endpoint,
    key: Arc<KeyPair>,
) -> Result<(), TransportError> {
    let user = endpoint.credentials.username.clone();
    let accepted = handle
        .authenticate_publickey(user.clone(), key)
        .await
        .map_err(|e| TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
    if !accepted {
        return Err(TransportError::AuthRejected {
            user,
            endpoint: endpoint.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &Target,
        cancel: &CancelSignal,
    ) -> Result<Box<dyn Session>, TransportError> {
        let session = unless_cancelled(cancel, self.open(target)).await?;
        info!(target = %target, "ssh session established");
        Ok(Box::new(session))
    }
}

/// An authenticated SSH session, possibly tunnelled through a relay.
pub struct SshSession {
    handle: SshHandle,
    relay: Option<SshHandle>,
    closed: AtomicBool,
}

impl SshSession {
    fn new(handle: SshHandle, relay: Option<SshHandle>) -> Self {
        Self {
            handle,
            relay,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Session for SshSession {
    async fn exec(&self, command: &str) -> Result<Box<dyn RemoteProcess>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        Ok(Box::new(SshProcess {
            channel,
            ended: false,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| TransportError::Channel(e.to_string()));
        if let Some(relay) = &self.relay {
            relay
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(|e| TransportError::Channel(e.to_string()))?;
        }
        inner
    }
}

struct SshProcess {
    channel: Channel<Msg>,
    ended: bool,
}

#[async_trait]
impl RemoteProcess for SshProcess {
    async fn next_event(&mut self) -> Option<ProcessEvent> {
        if self.ended {
            return None;
        }
        loop {
            let Some(msg) = self.channel.wait().await else {
                self.ended = true;
                return None;
            };
            match msg {
                ChannelMsg::Data { data } => return Some(ProcessEvent::Stdout(data.to_vec())),
                ChannelMsg::ExtendedData { data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                    return Some(ProcessEvent::Stderr(data.to_vec()));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(ProcessEvent::Exited(ExitStatus::Code(exit_status)));
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    return Some(ProcessEvent::Exited(ExitStatus::Signal(format!(
                        "{signal_name:?}"
                    ))));
                }
                ChannelMsg::Close => {
                    self.ended = true;
                    return None;
                }
                _ => {}
            }
        }
    }

    async fn interrupt(&mut self) -> Result<(), TransportError> {
        self.channel
            .signal(Sig::TERM)
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;
    use crate::transport::Route;

    #[test]
    fn test_parse_key_rejects_garbage() {
        let creds = Credentials::new("core", "not a private key");
        let err = parse_key(&creds).unwrap_err();
        match err {
            TransportError::InvalidKey { user, .. } => assert_eq!(user, "core"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_connect_with_bad_key_fails_before_dialing() {
        let connector = SshConnector::new(SshOptions::default());
        let route = Route::direct(Arc::new(Credentials::new("core", "garbage")));
        // Port 9 on a documentation address: never dialed because key parsing fails first.
        let target = route.target("192.0.2.1", 9);
        let err = connector
            .connect(&target, &CancelSignal::never())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::InvalidKey { .. }));
    }

    #[tokio::test]
    async fn test_connect_observes_prior_cancellation() {
        let connector = SshConnector::new(SshOptions::default());
        let route = Route::direct(Arc::new(Credentials::new("core", "garbage")));
        let handle = CancelHandle::new();
        handle.cancel();
        let err = connector
            .connect(&route.target("192.0.2.1", 22), &handle.signal())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Cancelled));
    }
}
