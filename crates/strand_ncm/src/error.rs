//! Caller-facing error taxonomy for manager operations.

use std::fmt;
use std::sync::Arc;

use strand_membership::{MembershipError, NodesConfiguration};

/// Why an `update`, `overwrite`, or lifecycle operation was refused or
/// failed.
#[derive(Debug)]
pub enum NcmError {
    /// Manager shutdown was signaled; the request was refused.
    Shutdown,
    /// The caller's operation mode lacks the required capability.
    Access,
    /// Invalid input (e.g. overwriting with an empty configuration).
    InvalidParam,
    /// The compare-and-swap lost. Carries the winning configuration when the
    /// store reported it, so the caller can rebase and retry.
    VersionMismatch(Option<Arc<NodesConfiguration>>),
    /// An element of the update batch was rejected.
    FailedUpdate(MembershipError),
    /// The new configuration could not be encoded.
    Serialization(anyhow::Error),
    /// Transient store failure; the caller may retry the same request.
    Again(anyhow::Error),
    /// Any other store-reported failure, passed through.
    Store(anyhow::Error),
}

impl NcmError {
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, NcmError::VersionMismatch(_))
    }
}

impl fmt::Display for NcmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NcmError::Shutdown => write!(f, "manager shutdown signaled"),
            NcmError::Access => write!(f, "operation not permitted in this mode"),
            NcmError::InvalidParam => write!(f, "invalid parameter"),
            NcmError::VersionMismatch(Some(nc)) => {
                write!(f, "version mismatch, store holds version {}", nc.version())
            }
            NcmError::VersionMismatch(None) => write!(f, "version mismatch"),
            NcmError::FailedUpdate(err) => write!(f, "update rejected: {err}"),
            NcmError::Serialization(err) => write!(f, "serialization failed: {err}"),
            NcmError::Again(err) => write!(f, "transient store failure: {err}"),
            NcmError::Store(err) => write!(f, "store failure: {err}"),
        }
    }
}

impl std::error::Error for NcmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NcmError::FailedUpdate(err) => Some(err),
            _ => None,
        }
    }
}
