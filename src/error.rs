//! Error types for the fileproc library.
//!
//! A single enum, [`FileProcError`], covers both sides of the wire:
//!
//! * **Server-side request failures**: `InvalidArgument`, `StagingFailure`,
//!   `TransformationFailed`, `TransmissionFailure`, `ReceiveFailure`. Each is
//!   terminal for the request that hit it and is reported to the caller as a
//!   non-OK gRPC status via `From<FileProcError> for tonic::Status`.
//!
//! * **Local failures**: configuration validation, client-side file I/O and
//!   RPC errors returned by [`crate::client::FileProcessorClient`].
//!
//! None of these are retried internally.

use std::path::PathBuf;
use thiserror::Error;
use tonic::{Code, Status};

/// All errors returned by the fileproc library.
#[derive(Debug, Error)]
pub enum FileProcError {
    // ── Request failures ──────────────────────────────────────────────────
    /// The leading parameter message was missing or malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A staged artifact could not be created, written, or read.
    #[error("Staging failed for '{path}': {source}")]
    StagingFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The collaborator exited non-zero, could not be launched, or did not
    /// produce its declared output.
    #[error("Transformation '{operation}' failed: {detail}")]
    TransformationFailed { operation: String, detail: String },

    /// The outbound stream broke after `sent_chunks` chunks were delivered.
    #[error("Transmission failed after {sent_chunks} chunks: {detail}")]
    TransmissionFailure { sent_chunks: u64, detail: String },

    /// The inbound stream broke before the caller half-closed it.
    #[error("Upload aborted: {0}")]
    ReceiveFailure(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Client-side errors ────────────────────────────────────────────────
    /// Connecting to the server or the call itself failed.
    #[error("RPC failed ({code:?}): {message}")]
    Rpc { code: Code, message: String },

    /// Reading the local input or writing the local output failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FileProcError {
    /// Build a [`FileProcError::StagingFailure`] for `path`.
    pub fn staging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StagingFailure {
            path: path.into(),
            source,
        }
    }

    /// Build a [`FileProcError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The gRPC status code this error surfaces as.
    pub fn code(&self) -> Code {
        match self {
            FileProcError::InvalidArgument(_) => Code::InvalidArgument,
            FileProcError::ReceiveFailure(_) => Code::Cancelled,
            FileProcError::Rpc { code, .. } => *code,
            _ => Code::Internal,
        }
    }

    /// Short kind label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            FileProcError::InvalidArgument(_) => "invalid_argument",
            FileProcError::StagingFailure { .. } => "staging_failure",
            FileProcError::TransformationFailed { .. } => "transformation_failed",
            FileProcError::TransmissionFailure { .. } => "transmission_failure",
            FileProcError::ReceiveFailure(_) => "receive_failure",
            FileProcError::InvalidConfig(_) => "invalid_config",
            FileProcError::Rpc { .. } => "rpc",
            FileProcError::Io { .. } => "io",
        }
    }
}

impl From<FileProcError> for Status {
    fn from(err: FileProcError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

impl From<Status> for FileProcError {
    fn from(status: Status) -> Self {
        FileProcError::Rpc {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

impl From<tonic::transport::Error> for FileProcError {
    fn from(err: tonic::transport::Error) -> Self {
        FileProcError::Rpc {
            code: Code::Unavailable,
            message: err.to_string(),
        }
    }
}
