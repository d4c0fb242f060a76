//! Core execution engine for a multi-language code runner.
//!
//! Polyrun accepts a request describing source files plus a language
//! runtime, materializes them into a fresh Linux sandbox driven by the
//! external `iso` helper, executes the compile and run stages under strict
//! resource limits, and returns a structured result or a live event
//! stream.
//!
//! # Components
//!
//! - **Runtime registry** — catalog of installed language packages with
//!   semver and alias resolution.
//! - **Package installer** — index fetch, checksum-verified download,
//!   in-process tar.gz extraction, live registry refresh.
//! - **Sandbox driver** — box allocation, file staging, `iso --run`
//!   invocation, metadata parsing, teardown.
//! - **Job core** — the compile→run pipeline in batch and streaming modes.
//! - **Concurrency gate** — process-wide job cap with FIFO waiting and
//!   cancellation-aware shutdown.
//!
//! Transport adapters wrap [`Engine::submit`] and [`Engine::stream`]; the
//! engine itself opens no sockets.

pub use crate::config::Config;
pub use crate::engine::Engine;
pub use crate::error::EngineError;
pub use crate::gate::ConcurrencyGate;
pub use crate::job::{Job, JobEvent, JobHandle};
pub use crate::package::{Installer, PackageInfo, PackageSpec};
pub use crate::protocol::{ClientMessage, CloseCode, ServerMessage};
pub use crate::registry::{Registry, Runtime, RuntimeInfo};
pub use crate::types::{ExecutionResult, JobRequest, SourceFile, StageResult};

pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod isolate;
pub mod job;
pub mod package;
pub mod protocol;
pub mod registry;
pub mod types;
