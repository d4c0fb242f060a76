//! Sandbox driver for the `iso` kernel helper.
//!
//! `iso` is an out-of-process, privileged helper providing namespaced
//! execution with cgroup-based limits. This module wraps its stable CLI:
//! box allocation (`--init`), staged execution (`--run`) with output capture
//! in batch or streaming form, metadata parsing, and teardown (`--cleanup`).

use std::path::PathBuf;

use thiserror::Error;

pub use crate::isolate::command::{RunCommand, cleanup_command, init_command};
pub use crate::isolate::invoke::{
    OutputBudget, PidSlot, StreamChunk, StreamingIo, run_batch, run_streaming, signal_pid,
};
pub use crate::isolate::meta::{MetaFile, MetaParseError};
pub use crate::isolate::sandbox::{BOX_ID_RANGE, BoxAllocator, SandboxBox};

mod command;
mod invoke;
mod meta;
mod sandbox;

/// Errors from sandbox operations.
#[derive(Debug, Error)]
pub enum IsolateError {
    #[error("failed to initialize box {id}: {message}")]
    InitFailed { id: u32, message: String },

    #[error("failed to cleanup box {id}: {message}")]
    CleanupFailed { id: u32, message: String },

    #[error("failed to spawn sandbox helper: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("sandbox helper failed: {0}")]
    CommandFailed(String),

    #[error("helper binary not found at {0}")]
    BinaryNotFound(PathBuf),

    #[error("invalid file name: {0}")]
    InvalidPath(String),

    #[error("file {name}: {source}")]
    InvalidFile {
        name: String,
        #[source]
        source: crate::types::DecodeError,
    },

    #[error("execution cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
