//! Engine-level error taxonomy.
//!
//! Transport adapters map these variants onto their own status codes; every
//! variant renders a message suitable for returning to the caller.

use thiserror::Error;

use crate::isolate::IsolateError;
use crate::package::PackageError;
use crate::registry::RegistryError;

/// Top-level error kind exposed by the [`Engine`](crate::Engine).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request, unknown runtime, or a limit override above the
    /// configured maximum. Never allocates a sandbox.
    #[error("{0}")]
    Validation(String),

    /// Requested runtime or package does not exist.
    #[error("{0}")]
    NotFound(String),

    #[error("package {language}-{version} is already installed")]
    AlreadyInstalled { language: String, version: String },

    #[error("download failed: {0}")]
    Download(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },

    #[error("failed to extract package: {0}")]
    Extract(String),

    /// Sandbox init/cleanup failure or pipe/file I/O error inside the
    /// driver. Terminal for the job; cleanup still runs.
    #[error("sandbox error: {0}")]
    Sandbox(#[from] IsolateError),

    #[error("output limit exceeded")]
    OutputLimitExceeded,

    /// The job was cancelled before or during execution.
    #[error("job cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<PackageError> for EngineError {
    fn from(err: PackageError) -> Self {
        match err {
            PackageError::NotFound(message) => EngineError::NotFound(message),
            PackageError::AlreadyInstalled { language, version } => {
                EngineError::AlreadyInstalled { language, version }
            }
            PackageError::Download(message) => EngineError::Download(message),
            PackageError::Checksum { expected, actual } => {
                EngineError::Checksum { expected, actual }
            }
            PackageError::Extract(message) => EngineError::Extract(message),
            PackageError::Io(err) => EngineError::Internal(err.to_string()),
        }
    }
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownRuntime { .. } => EngineError::NotFound(err.to_string()),
            RegistryError::InvalidConstraint { .. } => EngineError::Validation(err.to_string()),
            RegistryError::BadMetadata { .. } | RegistryError::Io(_) => {
                EngineError::Internal(err.to_string())
            }
        }
    }
}
