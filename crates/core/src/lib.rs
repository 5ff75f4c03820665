//! Keel core types: resource keys, change events, outcomes and errors.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable identity of a managed resource and the unit of queue deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource key {0:?} (expect name or namespace/name)")]
pub struct ParseKeyError(String);

impl FromStr for ResourceKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::namespaced(ns, name)),
            _ => Err(ParseKeyError(s.to_string())),
        }
    }
}

/// A change notification translated from the remote watch.
#[derive(Debug, Clone)]
pub enum ChangeEvent<K> {
    /// Object was added or modified.
    Applied(K),
    /// Object was removed; carries the last known state.
    Deleted(K),
    /// The watch (re)listed from scratch; carries the complete current listing.
    Restarted(Vec<K>),
}

impl<K> ChangeEvent<K> {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Applied(_) => "applied",
            ChangeEvent::Deleted(_) => "deleted",
            ChangeEvent::Restarted(_) => "restarted",
        }
    }
}

/// Successful result of one reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    /// Observed state matches the target; retry state is cleared.
    Converged,
    /// A mutation was issued (or is pending); verify on a later pass.
    Requeue,
}

/// Failures reported by the remote store adapter.
///
/// A missing object on a read is not an error: lookups return `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Object vanished between read and write.
    #[error("not_found: {0}")]
    NotFound(ResourceKey),
    /// Concurrent modification or stale resourceVersion.
    #[error("conflict on {key}: {message}")]
    Conflict { key: ResourceKey, message: String },
    /// Store refused the request as malformed.
    #[error("invalid request for {key}: {message}")]
    Invalid { key: ResourceKey, message: String },
    /// Network or server side failure.
    #[error("remote store unavailable: {0}")]
    Transient(#[source] anyhow::Error),
}

/// Retry treatment of a failed reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Requeue with exponential backoff.
    Transient,
    /// Requeue after a short fixed delay, without backoff escalation.
    Conflict,
    /// Requeue with full escalation; the only class dropped at the attempt ceiling.
    Permanent,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid spec for {key}: {reason}")]
    InvalidSpec { key: ResourceKey, reason: String },
    /// A dependent object with the expected name is controlled by someone else.
    #[error("{key} exists and is not controlled by this resource")]
    NotOwned { key: ResourceKey },
}

impl ReconcileError {
    pub fn invalid_spec(key: &ResourceKey, reason: impl Into<String>) -> Self {
        ReconcileError::InvalidSpec { key: key.clone(), reason: reason.into() }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Store(StoreError::NotFound(_)) => ErrorClass::Conflict,
            ReconcileError::Store(StoreError::Conflict { .. }) => ErrorClass::Conflict,
            ReconcileError::Store(StoreError::Invalid { .. }) => ErrorClass::Permanent,
            ReconcileError::Store(StoreError::Transient(_)) => ErrorClass::Transient,
            ReconcileError::InvalidSpec { .. } => ErrorClass::Permanent,
            ReconcileError::NotOwned { .. } => ErrorClass::Permanent,
        }
    }
}

pub mod prelude {
    pub use super::{
        ChangeEvent, ErrorClass, ReconcileError, ReconcileOutcome, ResourceKey, StoreError,
    };
}
