//! Engine facade.
//!
//! Owns the registry, installer, box allocator, and concurrency gate, and
//! exposes the two execution contracts (`submit`, `stream`) plus the
//! runtime/package management operations. Transport adapters hold an
//! `Arc<Engine>` and map its results onto their own framing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::EngineError;
use crate::gate::ConcurrencyGate;
use crate::isolate::BoxAllocator;
use crate::job::{Job, JobEvent};
use crate::package::{Installer, PackageInfo};
use crate::protocol::{ClientMessage, CloseCode, INIT_TIMEOUT, ServerMessage};
use crate::registry::{Registry, Runtime, RuntimeInfo};
use crate::types::{ExecutionResult, FileEncoding, JobRequest};

/// The core execution engine.
#[derive(Debug)]
pub struct Engine {
    config: Arc<Config>,
    registry: Arc<Registry>,
    installer: Installer,
    allocator: Arc<BoxAllocator>,
    gate: ConcurrencyGate,
}

impl Engine {
    /// Build an engine and load the runtime catalog from disk.
    pub async fn new(config: Config) -> Result<Arc<Self>, EngineError> {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new(config.clone()));
        registry.load_all().await?;

        let installer = Installer::new(config.clone(), registry.clone());
        let allocator = Arc::new(BoxAllocator::new(&config.iso_path));
        let gate = ConcurrencyGate::new(config.max_concurrent_jobs);

        info!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            data_directory = %config.data_directory.display(),
            "engine ready"
        );

        Ok(Arc::new(Self {
            config,
            registry,
            installer,
            allocator,
            gate,
        }))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Validate the request shape. Runs before any runtime resolution or
    /// sandbox allocation.
    pub fn validate(&self, request: &JobRequest) -> Result<(), EngineError> {
        if request.language.is_empty() {
            return Err(EngineError::Validation("language is required".into()));
        }
        if request.version.is_empty() {
            return Err(EngineError::Validation("version is required".into()));
        }
        if request.files.is_empty() {
            return Err(EngineError::Validation("files array is required".into()));
        }
        for (index, file) in request.files.iter().enumerate() {
            if file.content.is_empty() {
                return Err(EngineError::Validation(format!(
                    "files[{index}].content is required"
                )));
            }
        }
        Ok(())
    }

    /// Synchronous execute: run the job to completion and return the
    /// assembled result.
    #[instrument(skip_all, fields(language = %request.language, version = %request.version))]
    pub async fn submit(&self, request: JobRequest) -> Result<ExecutionResult, EngineError> {
        self.validate(&request)?;
        let runtime = self
            .registry
            .resolve(&request.language, &request.version)
            .await?;
        require_utf8_entry(&runtime, &request)?;
        let job = Job::new(
            self.config.clone(),
            self.allocator.clone(),
            runtime,
            &request,
        )?;
        job.execute(&self.gate).await
    }

    /// Streaming execute: drive one bidirectional session.
    ///
    /// `incoming` carries parsed client messages from the transport,
    /// `outgoing` receives server messages to forward to the peer. The
    /// returned close code ends the session. Event ordering follows the
    /// session grammar: `runtime`, `init_ack`, then per stage
    /// `stage_start`, `data*`, `stage_end`.
    #[instrument(skip_all)]
    pub async fn stream(
        self: &Arc<Self>,
        mut incoming: mpsc::Receiver<ClientMessage>,
        outgoing: mpsc::Sender<ServerMessage>,
    ) -> CloseCode {
        // Init phase: exactly one init message, within the timeout.
        let deadline = tokio::time::Instant::now() + INIT_TIMEOUT;
        let request = loop {
            match tokio::time::timeout_at(deadline, incoming.recv()).await {
                Err(_) => {
                    send(&outgoing, ServerMessage::error("initialization timeout")).await;
                    return CloseCode::InitTimeout;
                }
                Ok(None) => return CloseCode::Completed,
                Ok(Some(ClientMessage::Init(request))) => break request,
                Ok(Some(ClientMessage::Unknown(tag))) => {
                    send(
                        &outgoing,
                        ServerMessage::error(format!("unknown message type: {tag}")),
                    )
                    .await;
                }
                Ok(Some(_)) => return CloseCode::NotInitialized,
            }
        };

        if let Err(err) = self.validate(&request) {
            send(&outgoing, ServerMessage::error(err.to_string())).await;
            return CloseCode::Completed;
        }

        let runtime = match self
            .registry
            .resolve(&request.language, &request.version)
            .await
        {
            Ok(runtime) => runtime,
            Err(_) => {
                send(
                    &outgoing,
                    ServerMessage::error(format!(
                        "runtime not found: {}-{}",
                        request.language, request.version
                    )),
                )
                .await;
                return CloseCode::Completed;
            }
        };

        if let Err(err) = require_utf8_entry(&runtime, &request) {
            send(&outgoing, ServerMessage::error(err.to_string())).await;
            return CloseCode::Completed;
        }

        let job = match Job::new(
            self.config.clone(),
            self.allocator.clone(),
            runtime.clone(),
            &request,
        ) {
            Ok(job) => job,
            Err(err) => {
                send(&outgoing, ServerMessage::error(err.to_string())).await;
                return CloseCode::Completed;
            }
        };
        let handle = job.handle();

        send(
            &outgoing,
            ServerMessage::Runtime {
                language: runtime.language.clone(),
                version: runtime.version.to_string(),
            },
        )
        .await;
        send(&outgoing, ServerMessage::InitAck).await;

        let (event_tx, mut event_rx) = mpsc::channel::<JobEvent>(256);
        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(64);

        let mut task: JoinHandle<Result<(), EngineError>> = {
            let engine = self.clone();
            tokio::spawn(async move { job.execute_stream(&engine.gate, event_tx, stdin_rx).await })
        };

        // Main phase: interleave job events with peer messages.
        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => send(&outgoing, server_message(event)).await,
                    // Job is done emitting; collect its outcome.
                    None => break,
                },
                message = incoming.recv() => match message {
                    Some(ClientMessage::Init(_)) => {
                        handle.cancel();
                        let _ = finish(&mut event_rx, &mut task).await;
                        return CloseCode::AlreadyInitialized;
                    }
                    Some(ClientMessage::Data { stream, data, encoding }) => {
                        if stream != "stdin" {
                            handle.cancel();
                            let _ = finish(&mut event_rx, &mut task).await;
                            return CloseCode::InvalidStream;
                        }
                        match ClientMessage::decode_data(&data, encoding) {
                            Ok(bytes) => {
                                let _ = stdin_tx.send(bytes).await;
                            }
                            Err(err) => {
                                send(&outgoing, ServerMessage::error(err.to_string())).await;
                            }
                        }
                    }
                    Some(ClientMessage::Signal { signal }) => {
                        if handle.signal(&signal).is_err() {
                            handle.cancel();
                            let _ = finish(&mut event_rx, &mut task).await;
                            return CloseCode::InvalidSignal;
                        }
                    }
                    Some(ClientMessage::Unknown(tag)) => {
                        send(
                            &outgoing,
                            ServerMessage::error(format!("unknown message type: {tag}")),
                        )
                        .await;
                    }
                    // Peer disconnect cancels the job; cleanup still runs.
                    None => {
                        handle.cancel();
                        let _ = finish(&mut event_rx, &mut task).await;
                        return CloseCode::Completed;
                    }
                },
            }
        }

        match finish(&mut event_rx, &mut task).await {
            Ok(()) | Err(EngineError::Cancelled) => {}
            Err(err) => {
                warn!(%err, "streaming job failed");
                send(&outgoing, ServerMessage::error(err.to_string())).await;
            }
        }
        CloseCode::Completed
    }

    /// Snapshot of installed runtimes.
    pub async fn runtimes(&self) -> Vec<RuntimeInfo> {
        self.registry
            .list()
            .await
            .iter()
            .map(|runtime| RuntimeInfo::from(runtime.as_ref()))
            .collect()
    }

    /// Package index entries with installed flags.
    pub async fn packages(&self) -> Result<Vec<PackageInfo>, EngineError> {
        Ok(self.installer.list().await?)
    }

    /// Install the best index match for `(language, constraint)`.
    pub async fn install_package(
        &self,
        language: &str,
        constraint: &str,
    ) -> Result<(String, String), EngineError> {
        let pkg = self.installer.install(language, constraint).await?;
        Ok((pkg.language, pkg.version.to_string()))
    }

    pub async fn uninstall_package(
        &self,
        language: &str,
        version: &str,
    ) -> Result<(), EngineError> {
        Ok(self.installer.uninstall(language, version).await?)
    }

    /// Cancel all live jobs and wait for their cleanup, up to `deadline`.
    pub async fn shutdown(&self, deadline: Duration) {
        info!("shutting down engine");
        self.gate.shutdown(deadline).await;
    }
}

/// The entry script is handed a text entry point; binary-only submissions
/// are reserved to the `file` pseudo-runtime. Checked against the resolved
/// runtime's language, not the request string, so reaching `file` through
/// an alias or a provided language is exempted the same way.
fn require_utf8_entry(runtime: &Runtime, request: &JobRequest) -> Result<(), EngineError> {
    if runtime.language != "file"
        && !request
            .files
            .iter()
            .any(|file| file.encoding == FileEncoding::Utf8)
    {
        return Err(EngineError::Validation(
            "files must include at least one utf8-encoded file".into(),
        ));
    }
    Ok(())
}

async fn send(outgoing: &mpsc::Sender<ServerMessage>, message: ServerMessage) {
    if outgoing.send(message).await.is_err() {
        debug!("outgoing channel closed");
    }
}

fn server_message(event: JobEvent) -> ServerMessage {
    match event {
        JobEvent::StageStart { stage } => ServerMessage::StageStart { stage },
        JobEvent::StageEnd { stage, code } => ServerMessage::StageEnd { stage, code },
        JobEvent::Data { stream, bytes } => ServerMessage::data(stream, bytes),
        JobEvent::Error { message } => ServerMessage::Error { message },
    }
}

/// Drain remaining job events while waiting for the job task, so a full
/// event channel can never wedge a cancelled job.
async fn finish(
    events: &mut mpsc::Receiver<JobEvent>,
    task: &mut JoinHandle<Result<(), EngineError>>,
) -> Result<(), EngineError> {
    loop {
        tokio::select! {
            event = events.recv() => {
                if event.is_none() {
                    return match task.await {
                        Ok(outcome) => outcome,
                        Err(err) => Err(EngineError::Internal(err.to_string())),
                    };
                }
            }
            outcome = &mut *task => {
                return match outcome {
                    Ok(outcome) => outcome,
                    Err(err) => Err(EngineError::Internal(err.to_string())),
                };
            }
        }
    }
}
