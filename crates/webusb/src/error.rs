//! WebUSB error types
//!
//! Every failure renders as `"<operation> error: <reason>"`. Precondition
//! violations are raised before the transport is touched; transport
//! failures are wrapped with the name of the operation that issued them.

use protocol::TransportError;
use thiserror::Error;

/// Error category, mirroring the DOMException names used by WebUSB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Device, interface or endpoint absent, or device disconnected
    NotFound,
    /// Device or interface not in the required opened/claimed state
    InvalidState,
    /// Endpoint transfer type does not fit the requested transfer
    InvalidAccess,
    /// Malformed caller input
    Type,
    /// Failure reported by the transport
    Transport,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("{op} error: {reason}")]
    NotFound { op: &'static str, reason: String },

    #[error("{op} error: {reason}")]
    InvalidState { op: &'static str, reason: String },

    #[error("{op} error: {reason}")]
    InvalidAccess { op: &'static str, reason: String },

    #[error("{op} error: {reason}")]
    Type { op: &'static str, reason: String },

    #[error("{op} error: {source}")]
    Transport {
        op: &'static str,
        source: TransportError,
    },
}

impl Error {
    pub fn not_found(op: &'static str, reason: impl Into<String>) -> Self {
        Error::NotFound {
            op,
            reason: reason.into(),
        }
    }

    pub fn invalid_state(op: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidState {
            op,
            reason: reason.into(),
        }
    }

    pub fn invalid_access(op: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidAccess {
            op,
            reason: reason.into(),
        }
    }

    pub fn type_error(op: &'static str, reason: impl Into<String>) -> Self {
        Error::Type {
            op,
            reason: reason.into(),
        }
    }

    /// Wrap a transport failure for `map_err`
    pub fn transport(op: &'static str) -> impl FnOnce(TransportError) -> Self {
        move |source| Error::Transport { op, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::InvalidAccess { .. } => ErrorKind::InvalidAccess,
            Error::Type { .. } => ErrorKind::Type,
            Error::Transport { .. } => ErrorKind::Transport,
        }
    }

    /// Name of the operation that failed
    pub fn operation(&self) -> &'static str {
        match self {
            Error::NotFound { op, .. }
            | Error::InvalidState { op, .. }
            | Error::InvalidAccess { op, .. }
            | Error::Type { op, .. }
            | Error::Transport { op, .. } => op,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
