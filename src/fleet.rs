//! Fleet data model: host identities, reachability events and label selectors.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable identity of a fleet member, independent of its current address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl HostId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// File name of this host's local journal copy.
    ///
    /// Namespace and name are both part of it since names only need to be
    /// unique within a namespace.
    pub fn journal_file_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}-{}.log", sanitize(ns), sanitize(&self.name)),
            None => format!("{}.log", sanitize(&self.name)),
        }
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// "Host X is now reachable at address:port."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachabilityEvent {
    pub host: HostId,
    pub address: String,
    pub port: u16,
}

impl ReachabilityEvent {
    pub fn new(host: HostId, address: impl Into<String>, port: u16) -> Self {
        Self {
            host,
            address: address.into(),
            port,
        }
    }
}

/// Where local journal files live.
#[derive(Debug, Clone)]
pub struct JournalLayout {
    directory: PathBuf,
}

impl JournalLayout {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Local journal path for `host`. Pure function of the identity.
    pub fn local_path(&self, host: &HostId) -> PathBuf {
        self.directory.join(host.journal_file_name())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectorError {
    #[error("label selector term `{0}` is not of the form key=value or key!=value")]
    Malformed(String),

    #[error("label selector term `{0}` has an empty key")]
    EmptyKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
}

/// Equality-based label selector: `role=worker,zone!=us-east-1a`.
///
/// An empty selector matches every host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse(text: &str) -> Result<Self, SelectorError> {
        let mut requirements = Vec::new();
        for term in text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let requirement = if let Some((key, value)) = term.split_once("!=") {
                Requirement::NotEquals(key.trim().to_string(), value.trim().to_string())
            } else if let Some((key, value)) =
                term.split_once("==").or_else(|| term.split_once('='))
            {
                Requirement::Equals(key.trim().to_string(), value.trim().to_string())
            } else {
                return Err(SelectorError::Malformed(term.to_string()));
            };
            let key = match &requirement {
                Requirement::Equals(k, _) | Requirement::NotEquals(k, _) => k,
            };
            if key.is_empty() {
                return Err(SelectorError::EmptyKey(term.to_string()));
            }
            requirements.push(requirement);
        }
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .requirements
            .iter()
            .map(|req| match req {
                Requirement::Equals(k, v) => format!("{k}={v}"),
                Requirement::NotEquals(k, v) => format!("{k}!={v}"),
            })
            .collect();
        write!(f, "{}", terms.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_journal_file_name_namespaced() {
        let id = HostId::namespaced("default", "worker-0");
        assert_eq!(id.journal_file_name(), "default-worker-0.log");
        assert_eq!(id.to_string(), "default/worker-0");
    }

    #[test]
    fn test_journal_file_name_sanitizes_separators() {
        let id = HostId::namespaced("team a", "../etc/passwd");
        assert_eq!(id.journal_file_name(), "team_a-.._etc_passwd.log");
        assert_eq!(HostId::new("").journal_file_name(), "_.log");
    }

    #[test]
    fn test_local_path_is_deterministic() {
        let layout = JournalLayout::new("/var/log/fleet");
        let id = HostId::new("node-1");
        assert_eq!(layout.local_path(&id), layout.local_path(&id.clone()));
        assert_eq!(
            layout.local_path(&id),
            PathBuf::from("/var/log/fleet/node-1.log")
        );
    }

    #[test]
    fn test_selector_equality_and_inequality() {
        let sel = LabelSelector::parse("role=worker, zone!=a").unwrap();
        assert!(sel.matches(&labels(&[("role", "worker"), ("zone", "b")])));
        assert!(sel.matches(&labels(&[("role", "worker")])));
        assert!(!sel.matches(&labels(&[("role", "worker"), ("zone", "a")])));
        assert!(!sel.matches(&labels(&[("role", "control-plane")])));
        assert_eq!(sel.to_string(), "role=worker,zone!=a");
    }

    #[test]
    fn test_selector_double_equals() {
        let sel = LabelSelector::parse("role==worker").unwrap();
        assert!(sel.matches(&labels(&[("role", "worker")])));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let sel = LabelSelector::parse("  ").unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_selector_rejects_malformed_terms() {
        assert_eq!(
            LabelSelector::parse("role"),
            Err(SelectorError::Malformed("role".into()))
        );
        assert_eq!(
            LabelSelector::parse("=worker"),
            Err(SelectorError::EmptyKey("=worker".into()))
        );
    }
}
