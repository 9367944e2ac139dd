//! Layered configuration.
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. a TOML file (`--config`, `JOURNAL_MIRROR_CONFIG`, or `config.toml` in
//!    the platform config directory when it exists)
//! 3. `JOURNAL_MIRROR_*` environment variables (a `.env` file is honoured)
//! 4. command-line flags
//!
//! Every layer is a [`Settings`] with optional fields; [`Config::resolve`]
//! applies defaults and validates the result. Key material is loaded
//! separately by [`Config::route`] so that files are only touched once the
//! rest of the configuration is known to be sane.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::fleet::{JournalLayout, LabelSelector};
use crate::journal::{DEFAULT_CURSOR_PATH, RemoteJournal, StreamOptions};
use crate::scheduler::backoff::{BackoffPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use crate::scheduler::{DEFAULT_MAX_CONCURRENT, SchedulerConfig};
use crate::transport::run::{DEFAULT_INTERRUPT_GRACE, DEFAULT_STDERR_LIMIT, RunOptions};
use crate::transport::ssh::{SshOptions, parse_key};
use crate::transport::{Credentials, Endpoint, Route, TransportError};

pub const ENV_PREFIX: &str = "JOURNAL_MIRROR_";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_HEALTH_PROBE_ADDR: &str = "127.0.0.1:8081";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid value {value:?} for `{key}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("local journal directory {path}: {reason}")]
    Directory { path: PathBuf, reason: String },

    #[error("failed to read private key {path}: {source}")]
    ReadKey {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("private key {path} is unusable: {source}")]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: TransportError,
    },
}

/// One configuration layer. Every field is optional so layers can be
/// stacked; flags, file keys and environment variables share these names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, clap::Args)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// User to log in as on fleet hosts
    #[arg(long)]
    pub ssh_user: Option<String>,

    /// Private key file for fleet hosts
    #[arg(long, value_name = "PATH")]
    pub ssh_private_key: Option<PathBuf>,

    /// SSH port used when the inventory gives none
    #[arg(long, value_name = "PORT")]
    pub ssh_port: Option<u16>,

    /// Relay host; enables connecting through it
    #[arg(long, value_name = "HOST")]
    pub bastion_host: Option<String>,

    #[arg(long, value_name = "PORT")]
    pub bastion_port: Option<u16>,

    /// Relay user (defaults to --ssh-user)
    #[arg(long)]
    pub bastion_user: Option<String>,

    /// Relay private key file (required with --bastion-host)
    #[arg(long, value_name = "PATH")]
    pub bastion_private_key: Option<PathBuf>,

    /// Directory receiving one journal file per host
    #[arg(long, value_name = "DIR")]
    pub local_journal_directory: Option<PathBuf>,

    /// Cursor file location on the remote hosts
    #[arg(long, value_name = "PATH")]
    pub remote_cursor_path: Option<String>,

    /// Run journalctl through sudo
    #[arg(long, value_name = "BOOL")]
    pub use_sudo: Option<bool>,

    /// Maximum attempts running at once
    #[arg(long, value_name = "N")]
    pub max_concurrent: Option<usize>,

    /// Delay after the first failure, e.g. 10s
    #[arg(long, value_name = "DURATION")]
    pub requeue_base_delay: Option<String>,

    /// Ceiling for failure backoff, e.g. 2m
    #[arg(long, value_name = "DURATION")]
    pub requeue_max_delay: Option<String>,

    /// Randomise backoff delays
    #[arg(long, value_name = "BOOL")]
    pub backoff_jitter: Option<bool>,

    #[arg(long, value_name = "DURATION")]
    pub connect_timeout: Option<String>,

    /// Time allowed for each stopping phase of a remote command
    #[arg(long, value_name = "DURATION")]
    pub interrupt_grace: Option<String>,

    #[arg(long, value_name = "DURATION")]
    pub keepalive_interval: Option<String>,

    /// Bytes of remote stderr kept for error reports
    #[arg(long, value_name = "BYTES")]
    pub stderr_limit: Option<usize>,

    /// Host inventory file (TOML)
    #[arg(long, value_name = "PATH")]
    pub inventory: Option<PathBuf>,

    /// Only mirror hosts whose labels match, e.g. role=worker,zone!=a
    #[arg(long, value_name = "SELECTOR")]
    pub label_selector: Option<String>,

    /// Address for /healthz, /readyz and /status; empty disables
    #[arg(long, value_name = "ADDR")]
    pub health_probe_bind_address: Option<String>,
}

macro_rules! overlay {
    ($base:ident, $over:ident; $($field:ident),* $(,)?) => {
        Settings { $($field: $over.$field.or($base.$field)),* }
    };
}

macro_rules! from_env {
    ($settings:ident; $($field:ident),* $(,)?) => {
        $(
            if let Some(value) = env_value(stringify!($field)) {
                $settings.$field = Some(parse_env(stringify!($field), &value)?);
            }
        )*
    };
}

impl Settings {
    /// `over` wins wherever it has a value.
    pub fn overlay(self, over: Settings) -> Settings {
        let base = self;
        overlay!(base, over;
            ssh_user, ssh_private_key, ssh_port, bastion_host, bastion_port,
            bastion_user, bastion_private_key, local_journal_directory,
            remote_cursor_path, use_sudo, max_concurrent, requeue_base_delay,
            requeue_max_delay, backoff_jitter, connect_timeout, interrupt_grace,
            keepalive_interval, stderr_limit, inventory, label_selector,
            health_probe_bind_address,
        )
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read `JOURNAL_MIRROR_<FIELD>` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        from_env!(settings;
            ssh_user, ssh_private_key, ssh_port, bastion_host, bastion_port,
            bastion_user, bastion_private_key, local_journal_directory,
            remote_cursor_path, use_sudo, max_concurrent, requeue_base_delay,
            requeue_max_delay, backoff_jitter, connect_timeout, interrupt_grace,
            keepalive_interval, stderr_limit, inventory, label_selector,
            health_probe_bind_address,
        );
        Ok(settings)
    }

    /// Stack file, environment and `flags` over the defaults.
    pub fn layered(config_file: Option<&Path>, flags: Settings) -> Result<Self, ConfigError> {
        let file = match config_file {
            Some(path) => Settings::from_file(path)?,
            None => match default_config_file() {
                Some(path) if path.is_file() => {
                    tracing::debug!(path = %path.display(), "using default config file");
                    Settings::from_file(&path)?
                }
                _ => Settings::default(),
            },
        };
        Ok(file.overlay(Settings::from_env()?).overlay(flags))
    }
}

fn env_value(field: &str) -> Option<String> {
    let key = format!("{ENV_PREFIX}{}", field.to_ascii_uppercase());
    dotenvy::var(key).ok()
}

fn parse_env<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: field,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// `config.toml` in the platform config directory.
pub fn default_config_file() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "journal-mirror")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn duration(
    key: &'static str,
    value: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(text) => humantime::parse_duration(text.trim()).map_err(|e| ConfigError::Invalid {
            key,
            value: text.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Relay settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BastionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key: PathBuf,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub ssh_user: String,
    pub ssh_private_key: PathBuf,
    pub ssh_port: u16,
    pub bastion: Option<BastionConfig>,
    pub local_journal_directory: PathBuf,
    pub remote_cursor_path: String,
    pub use_sudo: bool,
    pub max_concurrent: usize,
    pub requeue_base_delay: Duration,
    pub requeue_max_delay: Duration,
    pub backoff_jitter: bool,
    pub connect_timeout: Duration,
    pub interrupt_grace: Duration,
    pub keepalive_interval: Duration,
    pub stderr_limit: usize,
    pub inventory: Option<PathBuf>,
    pub label_selector: LabelSelector,
    pub health_probe_bind_address: Option<String>,
}

impl Config {
    pub fn resolve(settings: Settings) -> Result<Self, ConfigError> {
        let ssh_user = non_empty(settings.ssh_user).ok_or(ConfigError::Missing("ssh_user"))?;
        let ssh_private_key = settings
            .ssh_private_key
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::Missing("ssh_private_key"))?;

        let bastion = match non_empty(settings.bastion_host) {
            None => None,
            Some(host) => Some(BastionConfig {
                host,
                port: settings.bastion_port.unwrap_or(DEFAULT_SSH_PORT),
                user: non_empty(settings.bastion_user).unwrap_or_else(|| ssh_user.clone()),
                private_key: settings
                    .bastion_private_key
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or(ConfigError::Missing("bastion_private_key"))?,
            }),
        };

        let max_concurrent = settings.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT);
        if max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                key: "max_concurrent",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let label_text = settings.label_selector.unwrap_or_default();
        let label_selector = LabelSelector::parse(&label_text).map_err(|e| ConfigError::Invalid {
            key: "label_selector",
            value: label_text.clone(),
            reason: e.to_string(),
        })?;

        let local_journal_directory = settings
            .local_journal_directory
            .unwrap_or_else(|| PathBuf::from("."));
        check_directory(&local_journal_directory)?;

        Ok(Self {
            ssh_user,
            ssh_private_key,
            ssh_port: settings.ssh_port.unwrap_or(DEFAULT_SSH_PORT),
            bastion,
            local_journal_directory,
            remote_cursor_path: non_empty(settings.remote_cursor_path)
                .unwrap_or_else(|| DEFAULT_CURSOR_PATH.to_string()),
            use_sudo: settings.use_sudo.unwrap_or(true),
            max_concurrent,
            requeue_base_delay: duration(
                "requeue_base_delay",
                settings.requeue_base_delay.as_deref(),
                DEFAULT_BASE_DELAY,
            )?,
            requeue_max_delay: duration(
                "requeue_max_delay",
                settings.requeue_max_delay.as_deref(),
                DEFAULT_MAX_DELAY,
            )?,
            backoff_jitter: settings.backoff_jitter.unwrap_or(false),
            connect_timeout: duration(
                "connect_timeout",
                settings.connect_timeout.as_deref(),
                SshOptions::default().connect_timeout,
            )?,
            interrupt_grace: duration(
                "interrupt_grace",
                settings.interrupt_grace.as_deref(),
                DEFAULT_INTERRUPT_GRACE,
            )?,
            keepalive_interval: duration(
                "keepalive_interval",
                settings.keepalive_interval.as_deref(),
                SshOptions::default().keepalive_interval,
            )?,
            stderr_limit: settings.stderr_limit.unwrap_or(DEFAULT_STDERR_LIMIT),
            inventory: settings.inventory.filter(|p| !p.as_os_str().is_empty()),
            label_selector,
            health_probe_bind_address: match settings.health_probe_bind_address {
                None => Some(DEFAULT_HEALTH_PROBE_ADDR.to_string()),
                Some(addr) if addr.trim().is_empty() => None,
                Some(addr) => Some(addr.trim().to_string()),
            },
        })
    }

    /// Read and validate key material and build the connection route.
    pub fn route(&self) -> Result<Route, ConfigError> {
        let credentials = Arc::new(load_credentials(&self.ssh_user, &self.ssh_private_key)?);
        match &self.bastion {
            None => Ok(Route::direct(credentials)),
            Some(bastion) => {
                let relay_credentials = load_credentials(&bastion.user, &bastion.private_key)?;
                let relay = Endpoint::new(
                    bastion.host.clone(),
                    bastion.port,
                    Arc::new(relay_credentials),
                );
                Ok(Route::via_relay(credentials, relay))
            }
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            connect_timeout: self.connect_timeout,
            keepalive_interval: self.keepalive_interval,
            ..SshOptions::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent,
            backoff: BackoffPolicy::new(self.requeue_base_delay, self.requeue_max_delay)
                .with_jitter(self.backoff_jitter),
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            run: RunOptions {
                interrupt_grace: self.interrupt_grace,
                stderr_limit: self.stderr_limit,
            },
        }
    }

    pub fn remote_journal(&self) -> RemoteJournal {
        RemoteJournal::new(self.remote_cursor_path.clone(), self.use_sudo)
    }

    pub fn layout(&self) -> JournalLayout {
        JournalLayout::new(self.local_journal_directory.clone())
    }

    /// The effective configuration for display. Never includes key contents.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "ssh_user": self.ssh_user,
            "ssh_private_key": self.ssh_private_key,
            "ssh_port": self.ssh_port,
            "bastion": self.bastion.as_ref().map(|b| json!({
                "host": b.host,
                "port": b.port,
                "user": b.user,
                "private_key": b.private_key,
            })),
            "local_journal_directory": self.local_journal_directory,
            "remote_cursor_path": self.remote_cursor_path,
            "use_sudo": self.use_sudo,
            "max_concurrent": self.max_concurrent,
            "requeue_base_delay": humantime::format_duration(self.requeue_base_delay).to_string(),
            "requeue_max_delay": humantime::format_duration(self.requeue_max_delay).to_string(),
            "backoff_jitter": self.backoff_jitter,
            "connect_timeout": humantime::format_duration(self.connect_timeout).to_string(),
            "interrupt_grace": humantime::format_duration(self.interrupt_grace).to_string(),
            "keepalive_interval": humantime::format_duration(self.keepalive_interval).to_string(),
            "stderr_limit": self.stderr_limit,
            "inventory": self.inventory,
            "label_selector": self.label_selector.to_string(),
            "health_probe_bind_address": self.health_probe_bind_address,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn check_directory(path: &Path) -> Result<(), ConfigError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(ConfigError::Directory {
            path: path.to_path_buf(),
            reason: "not a directory".into(),
        }),
        Err(e) => Err(ConfigError::Directory {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

fn load_credentials(user: &str, key_path: &Path) -> Result<Credentials, ConfigError> {
    let text = Zeroizing::new(std::fs::read_to_string(key_path).map_err(|source| {
        ConfigError::ReadKey {
            path: key_path.to_path_buf(),
            source,
        }
    })?);
    let credentials = Credentials::new(user, text.as_str());
    parse_key(&credentials).map_err(|source| ConfigError::InvalidKey {
        path: key_path.to_path_buf(),
        source,
    })?;
    Ok(credentials)
}
