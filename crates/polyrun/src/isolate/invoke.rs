//! Process invocation and output capture.
//!
//! Spawns `iso --run`, feeds stdin, drains stdout/stderr, and merges the
//! metadata file into a [`StageResult`]. Two capture modes:
//!
//! - **batch**: each stream accumulates into its own buffer and into a
//!   combined buffer, all capped at the output limit; overflow stops
//!   appending while reads keep draining.
//! - **streaming**: chunks are forwarded as events under a single shared
//!   budget across both streams. The chunk that would breach the budget is
//!   trimmed to exactly reach it, a limit-exceeded event fires once, the
//!   process is killed, and draining continues so the stage still ends.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::isolate::IsolateError;
use crate::isolate::meta::MetaFile;
use crate::types::{OutputStream, StageResult, StageStatus, signal_name};

/// Shared slot holding the pid of the currently running helper process.
///
/// Signal forwarding and the output-limit kill go through this slot so they
/// never race the owning task's `&mut Child`.
pub type PidSlot = Arc<Mutex<Option<u32>>>;

/// Byte budget shared by stdout and stderr of one job.
///
/// The counter spans stages: output emitted by the compile stage draws down
/// the budget available to the run stage.
#[derive(Debug)]
pub struct OutputBudget {
    limit: Option<u64>,
    sent: AtomicU64,
    tripped: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// The whole chunk fits.
    All,
    /// Only the first `n` bytes fit; the budget is now exhausted.
    Truncated(usize),
    /// The budget was already exhausted.
    Closed,
}

impl OutputBudget {
    /// A budget of `limit` bytes; non-positive values disable accounting.
    pub fn new(limit: i64) -> Self {
        Self {
            limit: u64::try_from(limit).ok().filter(|_| limit > 0),
            sent: AtomicU64::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Bytes admitted so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Whether the limit-exceeded event has fired.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Reserve room for a chunk of `len` bytes.
    pub(crate) fn admit(&self, len: usize) -> Admission {
        let Some(limit) = self.limit else {
            return Admission::All;
        };

        let len = len as u64;
        let mut current = self.sent.load(Ordering::SeqCst);
        loop {
            let remaining = limit.saturating_sub(current);
            if remaining == 0 {
                return Admission::Closed;
            }
            let allowed = len.min(remaining);
            match self.sent.compare_exchange(
                current,
                current + allowed,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) if allowed == len => return Admission::All,
                Ok(_) => return Admission::Truncated(allowed as usize),
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark the budget breached. Returns true exactly once.
    pub(crate) fn trip(&self) -> bool {
        !self.tripped.swap(true, Ordering::SeqCst)
    }
}

/// Output of a streaming invocation, forwarded chunk by chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Data {
        stream: OutputStream,
        bytes: Vec<u8>,
    },
    /// Emitted exactly once when the combined budget is breached.
    OutputLimitExceeded,
}

/// I/O wiring for a streaming invocation.
pub struct StreamingIo {
    /// Where output chunks are delivered.
    pub chunks: mpsc::Sender<StreamChunk>,
    /// Bytes written to stdin before any streamed input.
    pub initial_stdin: Vec<u8>,
    /// Follow-up stdin bytes; `None` closes stdin after the initial
    /// payload (used by the compile stage).
    pub stdin: Option<mpsc::Receiver<Vec<u8>>>,
    /// Combined stdout+stderr budget, shared across the job's stages.
    pub budget: Arc<OutputBudget>,
    /// Slot the spawned pid is published into.
    pub pid: PidSlot,
}

/// Send a signal to the process currently registered in the slot.
pub fn signal_pid(pid: &PidSlot, signal: Signal) {
    let guard = pid.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(pid) = *guard {
        let _ = nix::sys::signal::kill(Pid::from_raw(pid as i32), signal);
    }
}

/// Run a stage with batch I/O: stdin written once, output buffered.
#[instrument(skip_all)]
pub async fn run_batch(
    args: Vec<String>,
    stdin: Vec<u8>,
    output_cap: i64,
    meta_path: &Path,
    cancel: &CancellationToken,
) -> Result<StageResult, IsolateError> {
    debug!(?args, "invoking sandbox helper");
    let mut child = spawn(&args)?;

    let pipe = child.stdin.take();
    let stdin_task = tokio::spawn(async move {
        if let Some(mut pipe) = pipe {
            if !stdin.is_empty() && pipe.write_all(&stdin).await.is_err() {
                return;
            }
            let _ = pipe.shutdown().await;
        }
    });

    let cap = usize::try_from(output_cap).ok().filter(|_| output_cap > 0);
    let combined = Arc::new(Mutex::new(Vec::new()));
    let stdout_task = tokio::spawn(drain_batch(child.stdout.take(), cap, combined.clone()));
    let stderr_task = tokio::spawn(drain_batch(child.stderr.take(), cap, combined.clone()));

    let status = wait_or_cancel(&mut child, cancel).await?;

    let _ = stdin_task.await;
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let output = std::mem::take(&mut *combined.lock().unwrap_or_else(PoisonError::into_inner));

    let mut result = StageResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        output: String::from_utf8_lossy(&output).into_owned(),
        ..Default::default()
    };
    finish_result(&mut result, status, meta_path).await?;

    debug!(
        code = ?result.code,
        signal = ?result.signal,
        status = ?result.status,
        "stage complete"
    );
    Ok(result)
}

/// Run a stage with streamed I/O and budget-enforced output events.
#[instrument(skip_all)]
pub async fn run_streaming(
    args: Vec<String>,
    io: StreamingIo,
    meta_path: &Path,
    cancel: &CancellationToken,
) -> Result<StageResult, IsolateError> {
    debug!(?args, "invoking sandbox helper (streaming)");
    let mut child = spawn(&args)?;

    {
        let mut slot = io.pid.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = child.id();
    }

    let pipe = child.stdin.take();
    let initial = io.initial_stdin;
    let stdin_rx = io.stdin;
    let stdin_cancel = cancel.clone();
    let stdin_task = tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        if !initial.is_empty() && pipe.write_all(&initial).await.is_err() {
            return;
        }
        if let Some(mut rx) = stdin_rx {
            loop {
                tokio::select! {
                    data = rx.recv() => match data {
                        Some(data) => {
                            if pipe.write_all(&data).await.is_err() {
                                break;
                            }
                            let _ = pipe.flush().await;
                        }
                        None => break,
                    },
                    _ = stdin_cancel.cancelled() => break,
                }
            }
        }
        let _ = pipe.shutdown().await;
    });

    let stdout_task = tokio::spawn(drain_streaming(
        child.stdout.take(),
        OutputStream::Stdout,
        io.chunks.clone(),
        io.budget.clone(),
        io.pid.clone(),
    ));
    let stderr_task = tokio::spawn(drain_streaming(
        child.stderr.take(),
        OutputStream::Stderr,
        io.chunks.clone(),
        io.budget.clone(),
        io.pid.clone(),
    ));

    let waited = wait_or_cancel(&mut child, cancel).await;

    {
        let mut slot = io.pid.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }
    stdin_task.abort();
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let status = waited?;

    let mut result = StageResult::default();
    finish_result(&mut result, status, meta_path).await?;

    debug!(
        code = ?result.code,
        signal = ?result.signal,
        status = ?result.status,
        sent = io.budget.sent(),
        "stage complete"
    );
    Ok(result)
}

fn spawn(args: &[String]) -> Result<Child, IsolateError> {
    let program = args
        .first()
        .ok_or_else(|| IsolateError::CommandFailed("empty command arguments".to_string()))?;
    Command::new(program)
        .args(&args[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(IsolateError::SpawnFailed)
}

async fn wait_or_cancel(
    child: &mut Child,
    cancel: &CancellationToken,
) -> Result<std::process::ExitStatus, IsolateError> {
    tokio::select! {
        status = child.wait() => status.map_err(IsolateError::Io),
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(IsolateError::Cancelled)
        }
    }
}

/// Merge process status and metadata into the result.
async fn finish_result(
    result: &mut StageResult,
    status: std::process::ExitStatus,
    meta_path: &Path,
) -> Result<(), IsolateError> {
    use std::os::unix::process::ExitStatusExt;

    result.code = status.code();
    if result.code.is_none()
        && let Some(signal) = status.signal()
    {
        result.signal = Some(signal_name(signal));
    }

    match MetaFile::load(meta_path).await {
        Ok(meta) => meta.apply_to(result),
        Err(IsolateError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %meta_path.display(), "no metadata file produced");
        }
        Err(err) => return Err(err),
    }

    if !status.success() && result.status.is_none() {
        result.status = Some(StageStatus::RuntimeError);
        if result.message.is_none() {
            result.message = Some("Runtime error".to_string());
        }
    }

    Ok(())
}

async fn drain_batch<R: AsyncRead + Unpin>(
    reader: Option<R>,
    cap: Option<usize>,
    combined: Arc<Mutex<Vec<u8>>>,
) -> Vec<u8> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };

    let mut own = Vec::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                append_capped(&mut own, &chunk[..n], cap);
                let mut combined = combined.lock().unwrap_or_else(PoisonError::into_inner);
                append_capped(&mut combined, &chunk[..n], cap);
            }
        }
    }
    own
}

fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: Option<usize>) {
    match cap {
        None => buf.extend_from_slice(chunk),
        Some(cap) => {
            let room = cap.saturating_sub(buf.len());
            buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }
}

async fn drain_streaming<R: AsyncRead + Unpin>(
    reader: Option<R>,
    stream: OutputStream,
    chunks: mpsc::Sender<StreamChunk>,
    budget: Arc<OutputBudget>,
    pid: PidSlot,
) {
    let Some(mut reader) = reader else { return };

    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => match budget.admit(n) {
                Admission::All => {
                    let _ = chunks
                        .send(StreamChunk::Data {
                            stream,
                            bytes: buf[..n].to_vec(),
                        })
                        .await;
                }
                Admission::Truncated(allowed) => {
                    let _ = chunks
                        .send(StreamChunk::Data {
                            stream,
                            bytes: buf[..allowed].to_vec(),
                        })
                        .await;
                    breach_budget(&chunks, &budget, &pid).await;
                }
                // Keep draining so the process can exit and the stage
                // still produces its end event; bytes are discarded.
                Admission::Closed => breach_budget(&chunks, &budget, &pid).await,
            },
        }
    }
}

async fn breach_budget(chunks: &mpsc::Sender<StreamChunk>, budget: &OutputBudget, pid: &PidSlot) {
    if budget.trip() {
        let _ = chunks.send(StreamChunk::OutputLimitExceeded).await;
        signal_pid(pid, Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn no_meta() -> std::path::PathBuf {
        std::env::temp_dir().join("polyrun-invoke-test-no-meta")
    }

    #[test]
    fn budget_admits_until_limit() {
        let budget = OutputBudget::new(10);
        assert_eq!(budget.admit(4), Admission::All);
        assert_eq!(budget.admit(4), Admission::All);
        assert_eq!(budget.admit(4), Admission::Truncated(2));
        assert_eq!(budget.admit(1), Admission::Closed);
        assert_eq!(budget.sent(), 10);
    }

    #[test]
    fn budget_exact_fit_then_closed() {
        let budget = OutputBudget::new(8);
        assert_eq!(budget.admit(8), Admission::All);
        assert_eq!(budget.admit(1), Admission::Closed);
    }

    #[test]
    fn budget_nonpositive_limit_is_unlimited() {
        for limit in [0, -1, -1024] {
            let budget = OutputBudget::new(limit);
            assert_eq!(budget.admit(usize::MAX / 2), Admission::All);
        }
    }

    #[test]
    fn budget_trips_once() {
        let budget = OutputBudget::new(1);
        assert!(budget.trip());
        assert!(!budget.trip());
        assert!(budget.is_tripped());
    }

    #[test]
    fn append_capped_respects_room() {
        let mut buf = vec![b'a'; 3];
        append_capped(&mut buf, b"bcdef", Some(5));
        assert_eq!(buf, b"aaabc");
        append_capped(&mut buf, b"x", Some(5));
        assert_eq!(buf, b"aaabc");

        let mut buf = Vec::new();
        append_capped(&mut buf, b"abc", None);
        assert_eq!(buf, b"abc");
    }

    #[tokio::test]
    async fn batch_captures_stdout_and_exit_code() {
        let cancel = CancellationToken::new();
        let result = run_batch(sh("printf hi"), Vec::new(), 1024, &no_meta(), &cancel)
            .await
            .unwrap();
        assert_eq!(result.stdout, "hi");
        assert_eq!(result.output, "hi");
        assert_eq!(result.code, Some(0));
        assert_eq!(result.signal, None);
    }

    #[tokio::test]
    async fn batch_separates_streams_but_interleaves_output() {
        let cancel = CancellationToken::new();
        let result = run_batch(
            sh("printf out; printf err >&2"),
            Vec::new(),
            1024,
            &no_meta(),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(result.stdout, "out");
        assert_eq!(result.stderr, "err");
        assert_eq!(result.output.len(), 6);
    }

    #[tokio::test]
    async fn batch_delivers_stdin_byte_for_byte() {
        let cancel = CancellationToken::new();
        // `abc` with no trailing newline must arrive as exactly three bytes.
        let result = run_batch(
            sh("data=$(cat); printf '%s\\n' \"${#data}\""),
            b"abc".to_vec(),
            1024,
            &no_meta(),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(result.stdout, "3\n");
        assert_eq!(result.code, Some(0));
    }

    #[tokio::test]
    async fn batch_caps_each_buffer() {
        let cancel = CancellationToken::new();
        let result = run_batch(
            sh("i=0; while [ $i -lt 100 ]; do printf 'XXXXXXXXXX'; i=$((i+1)); done"),
            Vec::new(),
            64,
            &no_meta(),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(result.stdout.len(), 64);
        assert_eq!(result.output.len(), 64);
        assert_eq!(result.code, Some(0));
    }

    #[tokio::test]
    async fn batch_nonzero_exit_marks_runtime_error() {
        let cancel = CancellationToken::new();
        let result = run_batch(sh("exit 3"), Vec::new(), 1024, &no_meta(), &cancel)
            .await
            .unwrap();
        assert_eq!(result.code, Some(3));
        assert_eq!(result.status, Some(StageStatus::RuntimeError));
    }

    #[tokio::test]
    async fn batch_cancellation_kills_and_errors() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_batch(sh("sleep 30"), Vec::new(), 1024, &no_meta(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, IsolateError::Cancelled));
    }

    #[tokio::test]
    async fn streaming_enforces_combined_budget() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(256);
        let budget = Arc::new(OutputBudget::new(57));
        let io = StreamingIo {
            chunks: tx,
            initial_stdin: Vec::new(),
            stdin: None,
            budget: budget.clone(),
            pid: Arc::new(Mutex::new(None)),
        };

        let result = run_streaming(
            sh("i=0; while [ $i -lt 200 ]; do printf 'XXXXXXXXXX'; i=$((i+1)); done"),
            io,
            &no_meta(),
            &cancel,
        )
        .await
        .unwrap();

        let mut data_bytes = 0usize;
        let mut limit_events = 0usize;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::Data { bytes, .. } => data_bytes += bytes.len(),
                StreamChunk::OutputLimitExceeded => limit_events += 1,
            }
        }
        assert_eq!(data_bytes, 57);
        assert_eq!(limit_events, 1);
        assert!(budget.is_tripped());
        // A SIGKILL may land after a fast process already exited; either
        // way the stage result is well-formed.
        assert!(!(result.code.is_some() && result.signal.is_some()));
    }

    #[tokio::test]
    async fn streaming_forwards_stdin_channel() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(64);
        let (stdin_tx, stdin_rx) = mpsc::channel(8);
        let io = StreamingIo {
            chunks: tx,
            initial_stdin: b"one ".to_vec(),
            stdin: Some(stdin_rx),
            budget: Arc::new(OutputBudget::unlimited()),
            pid: Arc::new(Mutex::new(None)),
        };

        stdin_tx.send(b"two".to_vec()).await.unwrap();
        drop(stdin_tx);

        let result = run_streaming(sh("cat"), io, &no_meta(), &cancel).await.unwrap();
        assert_eq!(result.code, Some(0));

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            if let StreamChunk::Data { bytes, .. } = chunk {
                collected.extend_from_slice(&bytes);
            }
        }
        assert_eq!(collected, b"one two");
    }

    #[tokio::test]
    async fn streaming_signal_kills_process() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(64);
        let pid: PidSlot = Arc::new(Mutex::new(None));
        let io = StreamingIo {
            chunks: tx,
            initial_stdin: Vec::new(),
            stdin: None,
            budget: Arc::new(OutputBudget::unlimited()),
            pid: pid.clone(),
        };

        let killer = {
            let pid = pid.clone();
            tokio::spawn(async move {
                // Wait for the pid to be published, then kill.
                for _ in 0..100 {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    let registered = pid.lock().unwrap_or_else(PoisonError::into_inner).is_some();
                    if registered {
                        signal_pid(&pid, Signal::SIGKILL);
                        return;
                    }
                }
            })
        };

        let result = run_streaming(sh("sleep 30"), io, &no_meta(), &cancel)
            .await
            .unwrap();
        killer.await.unwrap();

        assert_eq!(result.signal.as_deref(), Some("SIGKILL"));
        assert_eq!(result.code, None);
    }
}
