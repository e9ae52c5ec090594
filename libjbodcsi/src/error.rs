//! CSI error types.
//!
//! All errors in the `libjbodcsi` crate are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer.
//!
//! Every variant maps onto exactly one entry of the standard CSI status
//! vocabulary through [`CsiError::code`], so callers can drive their
//! retry/backoff logic off [`StatusCode`] alone.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-visible status codes, mirroring the gRPC codes used by CSI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    AlreadyExists,
    Internal,
    Unavailable,
    DeadlineExceeded,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::AlreadyExists => "AlreadyExists",
            Self::Internal => "Internal",
            Self::Unavailable => "Unavailable",
            Self::DeadlineExceeded => "DeadlineExceeded",
        };
        f.write_str(name)
    }
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// A path named by the request is unknown for the volume.
    #[error("path {0} not found")]
    PathNotFound(String),

    /// The volume is not in the state the operation requires.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The request conflicts with an already established state.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The persisted registry could not be read or written.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The request did not complete before its deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// An unclassified internal error, including mount failures surfaced by
    /// the executor.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// The status code a caller observes for this error.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::InvalidArgument,
            Self::VolumeNotFound(_) | Self::PathNotFound(_) => StatusCode::NotFound,
            Self::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Self::AlreadyExists(_) => StatusCode::AlreadyExists,
            Self::BackendError(_) | Self::Internal(_) => StatusCode::Internal,
            Self::TransportError(_) => StatusCode::Unavailable,
            Self::DeadlineExceeded(_) => StatusCode::DeadlineExceeded,
        }
    }

    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn precondition<S: Into<String>>(msg: S) -> Self {
        Self::FailedPrecondition(msg.into())
    }
}

/// Failure reported by a [`MountExecutor`](crate::mounter::MountExecutor).
///
/// The executor either already knows the caller-visible classification
/// ([`ExecError::Status`], propagated unchanged) or only has an opaque OS
/// failure ([`ExecError::Os`], wrapped as [`CsiError::Internal`] with the OS
/// message preserved).
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Status(#[from] CsiError),

    #[error("{op} {}: {source}", .path.display())]
    Os {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    pub fn os(op: &'static str, path: impl Into<PathBuf>, source: impl Into<std::io::Error>) -> Self {
        Self::Os {
            op,
            path: path.into(),
            source: source.into(),
        }
    }
}

impl From<ExecError> for CsiError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Status(status) => status,
            other => CsiError::Internal(other.to_string()),
        }
    }
}
