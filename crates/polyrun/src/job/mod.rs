//! Job core.
//!
//! One job is one execution request: it owns its sandbox boxes, walks the
//! compile→run pipeline, applies per-request limit overrides, and exposes
//! batch and streaming execution modes. Cleanup of every allocated box
//! runs on every exit path, including cancellation.

use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::EngineError;
use crate::gate::ConcurrencyGate;
use crate::isolate::{
    BoxAllocator, IsolateError, OutputBudget, PidSlot, RunCommand, SandboxBox, StreamChunk,
    StreamingIo, run_batch, run_streaming, signal_pid,
};
use crate::registry::Runtime;
use crate::types::{
    EffectiveLimits, ExecutionResult, JobRequest, JobState, OutputStream, ResolvedFile, Stage,
    StageResult,
};

/// Event emitted by a streaming job, in the order of the session grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    StageStart {
        stage: Stage,
    },
    StageEnd {
        stage: Stage,
        code: i32,
    },
    Data {
        stream: OutputStream,
        bytes: Vec<u8>,
    },
    Error {
        message: String,
    },
}

/// Control handle usable while the job body runs on another task.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: Uuid,
    pid: PidSlot,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Forward a peer signal to the root process of the running box.
    /// Only `SIGINT`, `SIGTERM`, and `SIGKILL` are accepted.
    pub fn signal(&self, name: &str) -> Result<(), EngineError> {
        let signal = match name {
            "SIGINT" => Signal::SIGINT,
            "SIGTERM" => Signal::SIGTERM,
            "SIGKILL" => Signal::SIGKILL,
            _ => return Err(EngineError::Validation(format!("invalid signal: {name}"))),
        };
        signal_pid(&self.pid, signal);
        Ok(())
    }

    /// Cancel the job: the sandboxed process is killed and cleanup runs.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// One execution request.
#[derive(Debug)]
pub struct Job {
    id: Uuid,
    config: Arc<Config>,
    allocator: Arc<BoxAllocator>,
    runtime: Arc<Runtime>,
    files: Vec<ResolvedFile>,
    args: Vec<String>,
    stdin: Vec<u8>,
    limits: EffectiveLimits,
    state: JobState,
    boxes: Vec<SandboxBox>,
    budget: Arc<OutputBudget>,
    pid: PidSlot,
    cancel: CancellationToken,
}

impl Job {
    /// Build a job from a validated request.
    ///
    /// Per-request limit overrides are checked against the runtime's
    /// configured maximums here, before any sandbox is allocated; an
    /// override above its maximum is a validation failure.
    pub fn new(
        config: Arc<Config>,
        allocator: Arc<BoxAllocator>,
        runtime: Arc<Runtime>,
        request: &JobRequest,
    ) -> Result<Self, EngineError> {
        let files: Vec<ResolvedFile> = request
            .files
            .iter()
            .enumerate()
            .map(|(index, file)| ResolvedFile::from_source(index, file))
            .collect();

        let limits = effective_limits(&runtime, request)?;
        let budget = Arc::new(OutputBudget::new(runtime.limits.output_max_size));

        Ok(Self {
            id: Uuid::new_v4(),
            config,
            allocator,
            runtime,
            files,
            args: request.args.clone(),
            stdin: request.stdin.clone().into_bytes(),
            limits,
            state: JobState::Ready,
            boxes: Vec::new(),
            budget,
            pid: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn limits(&self) -> EffectiveLimits {
        self.limits
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            job_id: self.id,
            pid: self.pid.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Execute in batch mode: acquire a gate slot, run the pipeline,
    /// clean up, release.
    #[instrument(skip_all, fields(job_id = %self.id, language = %self.runtime.language))]
    pub async fn execute(
        mut self,
        gate: &ConcurrencyGate,
    ) -> Result<ExecutionResult, EngineError> {
        let slot = gate.acquire(self.id, &self.cancel).await?;
        info!("executing job");

        let outcome = self.run_pipeline().await;
        self.cleanup().await;
        drop(slot);
        outcome
    }

    /// Execute in streaming mode, emitting [`JobEvent`]s as stages
    /// progress. The caller feeds stdin through `stdin_rx` and forwards
    /// signals through the [`JobHandle`].
    #[instrument(skip_all, fields(job_id = %self.id, language = %self.runtime.language))]
    pub async fn execute_stream(
        mut self,
        gate: &ConcurrencyGate,
        events: mpsc::Sender<JobEvent>,
        stdin_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Result<(), EngineError> {
        let slot = gate.acquire(self.id, &self.cancel).await?;
        info!("executing job (streaming)");

        let outcome = self.run_pipeline_streaming(&events, stdin_rx).await;
        self.cleanup().await;
        drop(slot);
        outcome
    }

    async fn run_pipeline(&mut self) -> Result<ExecutionResult, EngineError> {
        let sandbox = self.alloc_box().await?;
        self.allocator
            .prime(&sandbox, &self.files)
            .await
            .map_err(map_isolate)?;
        self.state = JobState::Primed;

        let mut result = ExecutionResult {
            language: self.runtime.language.clone(),
            version: self.runtime.version.to_string(),
            compile: None,
            run: None,
            limits: Some(self.limits),
        };

        let mut active = sandbox;
        if self.runtime.compiled {
            debug!("running compile stage");
            let compile = self
                .invoke_batch(&active, Stage::Compile, self.file_names())
                .await?;
            let failed = stage_failed(&compile);
            result.compile = Some(compile);
            if failed {
                // A compile failure is a first-class outcome, not an
                // engine error; the run stage is skipped.
                self.state = JobState::Executed;
                return Ok(result);
            }

            active = self.promote_artifacts(&active).await?;
        }

        debug!("running execution stage");
        let run = self
            .invoke_batch(&active, Stage::Run, self.run_argv())
            .await?;
        result.run = Some(run);
        self.state = JobState::Executed;
        Ok(result)
    }

    async fn run_pipeline_streaming(
        &mut self,
        events: &mpsc::Sender<JobEvent>,
        stdin_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Result<(), EngineError> {
        let sandbox = self.alloc_box().await?;
        self.allocator
            .prime(&sandbox, &self.files)
            .await
            .map_err(map_isolate)?;
        self.state = JobState::Primed;

        let mut active = sandbox;
        if self.runtime.compiled {
            debug!("running compile stage");
            send_event(events, JobEvent::StageStart { stage: Stage::Compile }).await;
            let compile = self
                .invoke_streaming(&active, Stage::Compile, self.file_names(), Vec::new(), None, events)
                .await?;
            send_event(
                events,
                JobEvent::StageEnd {
                    stage: Stage::Compile,
                    code: compile.code.unwrap_or(0),
                },
            )
            .await;

            if stage_failed(&compile) {
                self.state = JobState::Executed;
                return Ok(());
            }

            active = self.promote_artifacts(&active).await?;
        }

        debug!("running execution stage");
        send_event(events, JobEvent::StageStart { stage: Stage::Run }).await;
        let initial_stdin = std::mem::take(&mut self.stdin);
        let run = self
            .invoke_streaming(
                &active,
                Stage::Run,
                self.run_argv(),
                initial_stdin,
                Some(stdin_rx),
                events,
            )
            .await?;
        send_event(
            events,
            JobEvent::StageEnd {
                stage: Stage::Run,
                code: run.code.unwrap_or(0),
            },
        )
        .await;

        self.state = JobState::Executed;
        Ok(())
    }

    async fn alloc_box(&mut self) -> Result<SandboxBox, EngineError> {
        let sandbox = self.allocator.alloc().await.map_err(map_isolate)?;
        self.boxes.push(sandbox.clone());
        Ok(sandbox)
    }

    /// Move the compiled `submission/` tree into a fresh box so the run
    /// stage sees the artifacts without re-compiling.
    async fn promote_artifacts(&mut self, from: &SandboxBox) -> Result<SandboxBox, EngineError> {
        let run_box = self.alloc_box().await?;
        tokio::fs::rename(from.submission_dir(), run_box.submission_dir())
            .await
            .map_err(|e| EngineError::Sandbox(IsolateError::Io(e)))?;
        Ok(run_box)
    }

    fn build_command(&self, sandbox: &SandboxBox, stage: Stage, argv: Vec<String>) -> Vec<String> {
        RunCommand::new(&self.config.iso_path, sandbox.id(), sandbox.meta_path())
            .language(&self.runtime.language)
            .env_vars(self.runtime.env_vars.iter().cloned())
            .pkg_dir(&self.runtime.pkg_dir)
            .max_processes(self.runtime.limits.max_process_count)
            .max_open_files(self.runtime.limits.max_open_files)
            .max_file_size(self.runtime.limits.max_file_size)
            .limits(self.limits.stage(stage))
            .share_net(!self.config.disable_networking)
            .stage(stage, argv)
            .build()
    }

    async fn invoke_batch(
        &self,
        sandbox: &SandboxBox,
        stage: Stage,
        argv: Vec<String>,
    ) -> Result<StageResult, EngineError> {
        let args = self.build_command(sandbox, stage, argv);
        let stdin = match stage {
            Stage::Run => self.stdin.clone(),
            Stage::Compile => Vec::new(),
        };
        run_batch(
            args,
            stdin,
            self.runtime.limits.output_max_size,
            sandbox.meta_path(),
            &self.cancel,
        )
        .await
        .map_err(map_isolate)
    }

    async fn invoke_streaming(
        &self,
        sandbox: &SandboxBox,
        stage: Stage,
        argv: Vec<String>,
        initial_stdin: Vec<u8>,
        stdin_rx: Option<mpsc::Receiver<Vec<u8>>>,
        events: &mpsc::Sender<JobEvent>,
    ) -> Result<StageResult, EngineError> {
        let args = self.build_command(sandbox, stage, argv);

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(128);
        let forwarder = {
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(chunk) = chunk_rx.recv().await {
                    let event = match chunk {
                        StreamChunk::Data { stream, bytes } => JobEvent::Data { stream, bytes },
                        StreamChunk::OutputLimitExceeded => JobEvent::Error {
                            message: "output limit exceeded".to_string(),
                        },
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
            })
        };

        let io = StreamingIo {
            chunks: chunk_tx,
            initial_stdin,
            stdin: stdin_rx,
            budget: self.budget.clone(),
            pid: self.pid.clone(),
        };

        let result = run_streaming(args, io, sandbox.meta_path(), &self.cancel).await;
        let _ = forwarder.await;
        result.map_err(map_isolate)
    }

    fn file_names(&self) -> Vec<String> {
        self.files.iter().map(|file| file.name.clone()).collect()
    }

    /// Run argv: the entry point (first submitted file) plus request args.
    fn run_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(1 + self.args.len());
        if let Some(first) = self.files.first() {
            argv.push(first.name.clone());
        }
        argv.extend(self.args.iter().cloned());
        argv
    }

    async fn cleanup(&mut self) {
        for sandbox in std::mem::take(&mut self.boxes) {
            if let Err(err) = self.allocator.cleanup(&sandbox).await {
                warn!(job_id = %self.id, box_id = sandbox.id(), %err, "failed to clean up box");
            }
        }
    }
}

fn stage_failed(result: &StageResult) -> bool {
    result.signal.is_some() || result.code.is_some_and(|code| code != 0)
}

async fn send_event(events: &mpsc::Sender<JobEvent>, event: JobEvent) {
    if events.send(event).await.is_err() {
        debug!("event receiver dropped");
    }
}

fn map_isolate(err: IsolateError) -> EngineError {
    match err {
        IsolateError::Cancelled => EngineError::Cancelled,
        other => EngineError::Sandbox(other),
    }
}

/// Start from the runtime's limits and apply request overrides, rejecting
/// any override above the configured maximum. A negative configured memory
/// maximum means uncapped, which admits any override.
fn effective_limits(
    runtime: &Runtime,
    request: &JobRequest,
) -> Result<EffectiveLimits, EngineError> {
    let mut limits = runtime.limits.effective();

    let apply_time = |name: &str, maximum: i64, requested: Option<i64>| -> Result<Option<i64>, EngineError> {
        let Some(requested) = requested else {
            return Ok(None);
        };
        // A negative override would disable the flag at invocation time,
        // bypassing a capped budget entirely.
        if maximum > 0 && (requested < 0 || requested > maximum) {
            return Err(EngineError::Validation(format!(
                "{name} cannot exceed {maximum}ms (requested {requested}ms)"
            )));
        }
        Ok(Some(requested))
    };

    if let Some(value) = apply_time("compile_timeout", limits.timeouts.compile, request.compile_timeout)? {
        limits.timeouts.compile = value;
    }
    if let Some(value) = apply_time("run_timeout", limits.timeouts.run, request.run_timeout)? {
        limits.timeouts.run = value;
    }
    if let Some(value) = apply_time("compile_cpu_time", limits.cpu_times.compile, request.compile_cpu_time)? {
        limits.cpu_times.compile = value;
    }
    if let Some(value) = apply_time("run_cpu_time", limits.cpu_times.run, request.run_cpu_time)? {
        limits.cpu_times.run = value;
    }

    let apply_memory = |name: &str, maximum: i64, requested: Option<i64>| -> Result<Option<i64>, EngineError> {
        let Some(requested) = requested else {
            return Ok(None);
        };
        if maximum >= 0 && (requested < 0 || requested > maximum) {
            return Err(EngineError::Validation(format!(
                "{name} cannot exceed {maximum} bytes (requested {requested})"
            )));
        }
        Ok(Some(requested))
    };

    if let Some(value) = apply_memory(
        "compile_memory_limit",
        limits.memory_limits.compile,
        request.compile_memory_limit,
    )? {
        limits.memory_limits.compile = value;
    }
    if let Some(value) = apply_memory(
        "run_memory_limit",
        limits.memory_limits.run,
        request.run_memory_limit,
    )? {
        limits.memory_limits.run = value;
    }

    Ok(limits)
}

#[cfg(test)]
mod tests {
    use semver::Version;

    use super::*;
    use crate::registry::RuntimeLimits;
    use crate::types::{SourceFile, StagePair};

    fn runtime(compiled: bool) -> Arc<Runtime> {
        Arc::new(Runtime {
            language: "python".into(),
            version: Version::parse("3.12.0").unwrap(),
            aliases: vec![],
            runtime: "python".into(),
            pkg_dir: "/data/packages/python/3.12.0".into(),
            compiled,
            env_vars: vec![],
            limits: RuntimeLimits {
                timeouts: StagePair {
                    compile: 10_000,
                    run: 3_000,
                },
                cpu_times: StagePair {
                    compile: 10_000,
                    run: 3_000,
                },
                memory_limits: StagePair {
                    compile: -1,
                    run: 512_000_000,
                },
                max_process_count: 64,
                max_open_files: 2048,
                max_file_size: 10_000_000,
                output_max_size: 1024,
            },
            platform: None,
        })
    }

    fn request() -> JobRequest {
        JobRequest {
            language: "python".into(),
            version: "3.12.0".into(),
            files: vec![SourceFile::new("main.py", "print('hi')")],
            ..Default::default()
        }
    }

    fn job(request: &JobRequest) -> Result<Job, EngineError> {
        Job::new(
            Arc::new(Config::default()),
            Arc::new(BoxAllocator::new("iso")),
            runtime(false),
            request,
        )
    }

    #[test]
    fn defaults_come_from_runtime() {
        let job = job(&request()).unwrap();
        assert_eq!(job.limits().timeouts.run, 3_000);
        assert_eq!(job.limits().memory_limits.run, 512_000_000);
        assert_eq!(job.state(), JobState::Ready);
    }

    #[test]
    fn overrides_within_maximums_apply() {
        let mut req = request();
        req.run_timeout = Some(50);
        req.run_memory_limit = Some(128_000_000);
        req.compile_memory_limit = Some(1_000_000_000); // compile max is uncapped

        let job = job(&req).unwrap();
        assert_eq!(job.limits().timeouts.run, 50);
        assert_eq!(job.limits().memory_limits.run, 128_000_000);
        assert_eq!(job.limits().memory_limits.compile, 1_000_000_000);
    }

    #[test]
    fn override_above_timeout_maximum_is_rejected() {
        let mut req = request();
        req.run_timeout = Some(60_000);
        let err = job(&req).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn override_above_memory_maximum_is_rejected() {
        let mut req = request();
        req.run_memory_limit = Some(1_000_000_000);
        let err = job(&req).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn unlimited_request_against_capped_memory_is_rejected() {
        let mut req = request();
        req.run_memory_limit = Some(-1);
        let err = job(&req).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn negative_time_override_against_capped_budget_is_rejected() {
        let mut req = request();
        req.run_timeout = Some(-1);
        let err = job(&req).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let mut req = request();
        req.compile_cpu_time = Some(-1);
        let err = job(&req).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn run_argv_places_entry_point_first() {
        let mut req = request();
        req.files.push(SourceFile::new("util.py", "x = 1"));
        req.args = vec!["--flag".into(), "value".into()];

        let job = job(&req).unwrap();
        assert_eq!(job.run_argv(), vec!["main.py", "--flag", "value"]);
        assert_eq!(job.file_names(), vec!["main.py", "util.py"]);
    }

    #[test]
    fn unnamed_files_get_positional_names() {
        let mut req = request();
        req.files = vec![
            SourceFile {
                name: None,
                content: "print('hi')".into(),
                encoding: Default::default(),
            },
            SourceFile {
                name: Some(String::new()),
                content: "x".into(),
                encoding: Default::default(),
            },
        ];

        let job = job(&req).unwrap();
        assert_eq!(job.file_names(), vec!["file0.code", "file1.code"]);
    }

    #[test]
    fn handle_rejects_unknown_signals() {
        let job = job(&request()).unwrap();
        let handle = job.handle();
        assert!(handle.signal("SIGKILL").is_ok());
        assert!(handle.signal("SIGSTOP").is_err());
        assert!(handle.signal("KILL").is_err());
    }

    #[test]
    fn stage_failed_detection() {
        let ok = StageResult {
            code: Some(0),
            ..Default::default()
        };
        assert!(!stage_failed(&ok));

        let nonzero = StageResult {
            code: Some(1),
            ..Default::default()
        };
        assert!(stage_failed(&nonzero));

        let signalled = StageResult {
            signal: Some("SIGKILL".into()),
            ..Default::default()
        };
        assert!(stage_failed(&signalled));
    }
}
