//! Core data model shared across the engine.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Declared encoding of a submitted source file.
///
/// Unknown tags fall back to [`FileEncoding::Utf8`] rather than rejecting the
/// request, matching the lenient contract of the execute endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEncoding {
    #[default]
    Utf8,
    Base64,
    Hex,
}

impl FileEncoding {
    /// Parse an encoding tag, treating anything unrecognized as `utf8`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "base64" => FileEncoding::Base64,
            "hex" => FileEncoding::Hex,
            _ => FileEncoding::Utf8,
        }
    }

    /// Decode file content according to this encoding.
    pub fn decode(&self, content: &str) -> Result<Vec<u8>, DecodeError> {
        match self {
            FileEncoding::Utf8 => Ok(content.as_bytes().to_vec()),
            FileEncoding::Base64 => BASE64.decode(content).map_err(|e| DecodeError {
                encoding: "base64",
                message: e.to_string(),
            }),
            FileEncoding::Hex => hex::decode(content).map_err(|e| DecodeError {
                encoding: "hex",
                message: e.to_string(),
            }),
        }
    }

    fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(FileEncoding::from_tag(&tag))
    }
}

/// Error decoding declared-encoding file content.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {encoding} content: {message}")]
pub struct DecodeError {
    pub encoding: &'static str,
    pub message: String,
}

/// A source file as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    /// File name relative to the submission directory. Defaults to
    /// `file<index>.code` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub content: String,

    #[serde(default, deserialize_with = "FileEncoding::deserialize_lenient")]
    pub encoding: FileEncoding,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            content: content.into(),
            encoding: FileEncoding::Utf8,
        }
    }
}

/// A submitted file with its name resolved, ready to stage into a box.
///
/// Content stays in its declared encoding; the sandbox driver decodes it
/// while priming.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub name: String,
    pub content: String,
    pub encoding: FileEncoding,
}

impl ResolvedFile {
    /// Resolve a request file, defaulting the name by position.
    pub fn from_source(index: usize, file: &SourceFile) -> Self {
        Self {
            name: file
                .name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| format!("file{index}.code")),
            content: file.content.clone(),
            encoding: file.encoding,
        }
    }
}

/// An execute request, shared by the synchronous and streaming paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub language: String,

    /// Semver version or constraint (`"*"` selects the highest installed).
    pub version: String,

    pub files: Vec<SourceFile>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub stdin: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_cpu_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_cpu_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_memory_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_memory_limit: Option<i64>,
}

/// A per-stage pair of limit values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePair {
    pub compile: i64,
    pub run: i64,
}

impl StagePair {
    pub fn uniform(value: i64) -> Self {
        Self {
            compile: value,
            run: value,
        }
    }

    pub fn get(&self, stage: Stage) -> i64 {
        match stage {
            Stage::Compile => self.compile,
            Stage::Run => self.run,
        }
    }

    pub fn set(&mut self, stage: Stage, value: i64) {
        match stage {
            Stage::Compile => self.compile = value,
            Stage::Run => self.run = value,
        }
    }
}

/// The limits a job actually runs under, echoed back in the response.
///
/// Times are integer milliseconds, memory is bytes (negative means uncapped).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveLimits {
    pub timeouts: StagePair,
    pub cpu_times: StagePair,
    pub memory_limits: StagePair,
}

impl EffectiveLimits {
    /// Collapse the pair view into the limits of one stage.
    pub fn stage(&self, stage: Stage) -> StageLimits {
        StageLimits {
            wall_ms: self.timeouts.get(stage),
            cpu_ms: self.cpu_times.get(stage),
            mem_bytes: self.memory_limits.get(stage),
        }
    }
}

/// Resource budget for a single stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLimits {
    /// Wall-clock budget in milliseconds; values ≤ 0 disable the limit.
    pub wall_ms: i64,
    /// CPU budget in milliseconds; values ≤ 0 disable the limit.
    pub cpu_ms: i64,
    /// Memory cap in bytes; negative means uncapped.
    pub mem_bytes: i64,
}

/// Execution stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Compile,
    Run,
}

impl Stage {
    /// Name of the package script that implements this stage.
    pub fn script(&self) -> &'static str {
        match self {
            Stage::Compile => "compile",
            Stage::Run => "run",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.script())
    }
}

/// Output stream of a sandboxed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        })
    }
}

/// Status tag reported by the sandbox helper's metadata file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    /// Wall-clock or CPU timeout.
    #[serde(rename = "TO")]
    Timeout,
    /// Output limit exceeded.
    #[serde(rename = "OL")]
    OutputLimit,
    /// Some other execution limit exceeded.
    #[serde(rename = "EL")]
    ExecutionLimit,
    /// Runtime error (non-zero exit).
    #[serde(rename = "RE")]
    RuntimeError,
    /// Killed by a signal.
    #[serde(rename = "SG")]
    Signalled,
    /// Internal sandbox error.
    #[serde(rename = "XX")]
    Internal,
}

impl StageStatus {
    /// Parse a metadata status tag. Unknown tags are reported as internal
    /// errors, the sandbox contract does not grow new tags silently.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "TO" => StageStatus::Timeout,
            "OL" => StageStatus::OutputLimit,
            "EL" => StageStatus::ExecutionLimit,
            "RE" => StageStatus::RuntimeError,
            "SG" => StageStatus::Signalled,
            _ => StageStatus::Internal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Timeout => "TO",
            StageStatus::OutputLimit => "OL",
            StageStatus::ExecutionLimit => "EL",
            StageStatus::RuntimeError => "RE",
            StageStatus::Signalled => "SG",
            StageStatus::Internal => "XX",
        }
    }

    /// Whether this status implies the process was force-killed, in which
    /// case the surfaced signal is `SIGKILL` regardless of `exitsig`.
    pub fn forced_kill(&self) -> bool {
        matches!(
            self,
            StageStatus::Timeout | StageStatus::OutputLimit | StageStatus::ExecutionLimit
        )
    }
}

/// Outcome of one compile or run stage.
///
/// Exactly one of `code` / `signal` is populated once the stage has been
/// merged with sandbox metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageResult {
    pub stdout: String,
    pub stderr: String,
    /// Interleaved stdout+stderr in arrival order.
    pub output: String,

    pub code: Option<i32>,
    pub signal: Option<String>,

    /// Peak memory in bytes.
    pub memory: i64,
    /// CPU time in milliseconds.
    pub cpu_time: i64,
    /// Wall time in milliseconds.
    pub wall_time: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Complete outcome of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub language: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<StageResult>,

    /// Absent when the compile stage failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<StageResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<EffectiveLimits>,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobState {
    #[default]
    Ready,
    Primed,
    Executed,
}

/// Map a POSIX signal number to its conventional name.
///
/// Numbers outside the portable set fall back to `SIG<N>`.
pub fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".into(),
        2 => "SIGINT".into(),
        3 => "SIGQUIT".into(),
        4 => "SIGILL".into(),
        5 => "SIGTRAP".into(),
        6 => "SIGABRT".into(),
        7 => "SIGBUS".into(),
        8 => "SIGFPE".into(),
        9 => "SIGKILL".into(),
        10 => "SIGUSR1".into(),
        11 => "SIGSEGV".into(),
        12 => "SIGUSR2".into(),
        13 => "SIGPIPE".into(),
        14 => "SIGALRM".into(),
        15 => "SIGTERM".into(),
        n => format!("SIG{n}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_from_tag_known() {
        assert_eq!(FileEncoding::from_tag("utf8"), FileEncoding::Utf8);
        assert_eq!(FileEncoding::from_tag("base64"), FileEncoding::Base64);
        assert_eq!(FileEncoding::from_tag("hex"), FileEncoding::Hex);
    }

    #[test]
    fn encoding_from_tag_unknown_falls_back_to_utf8() {
        assert_eq!(FileEncoding::from_tag("utf16"), FileEncoding::Utf8);
        assert_eq!(FileEncoding::from_tag(""), FileEncoding::Utf8);
    }

    #[test]
    fn decode_utf8_passes_bytes_through() {
        let decoded = FileEncoding::Utf8.decode("print('hi')").unwrap();
        assert_eq!(decoded, b"print('hi')");
    }

    #[test]
    fn decode_base64() {
        let decoded = FileEncoding::Base64.decode("aGVsbG8=").unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn decode_hex() {
        let decoded = FileEncoding::Hex.decode("68656c6c6f").unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn decode_invalid_base64_errors() {
        let err = FileEncoding::Base64.decode("not base64!").unwrap_err();
        assert_eq!(err.encoding, "base64");
    }

    #[test]
    fn decode_invalid_hex_errors() {
        let err = FileEncoding::Hex.decode("zz").unwrap_err();
        assert_eq!(err.encoding, "hex");
    }

    #[test]
    fn source_file_encoding_is_lenient() {
        let file: SourceFile =
            serde_json::from_str(r#"{"content":"x","encoding":"weird"}"#).unwrap();
        assert_eq!(file.encoding, FileEncoding::Utf8);

        let file: SourceFile =
            serde_json::from_str(r#"{"content":"x","encoding":"base64"}"#).unwrap();
        assert_eq!(file.encoding, FileEncoding::Base64);
    }

    #[test]
    fn source_file_encoding_defaults_to_utf8() {
        let file: SourceFile = serde_json::from_str(r#"{"content":"x"}"#).unwrap();
        assert_eq!(file.encoding, FileEncoding::Utf8);
        assert!(file.name.is_none());
    }

    #[test]
    fn job_request_minimal_json() {
        let request: JobRequest = serde_json::from_str(
            r#"{"language":"python","version":"3.12.0","files":[{"content":"print('hi')"}]}"#,
        )
        .unwrap();
        assert_eq!(request.language, "python");
        assert!(request.args.is_empty());
        assert!(request.stdin.is_empty());
        assert!(request.run_timeout.is_none());
    }

    #[test]
    fn stage_status_tags_round_trip() {
        for tag in ["TO", "OL", "EL", "RE", "SG", "XX"] {
            assert_eq!(StageStatus::from_tag(tag).as_str(), tag);
        }
    }

    #[test]
    fn stage_status_unknown_is_internal() {
        assert_eq!(StageStatus::from_tag("??"), StageStatus::Internal);
    }

    #[test]
    fn stage_status_forced_kill() {
        assert!(StageStatus::Timeout.forced_kill());
        assert!(StageStatus::OutputLimit.forced_kill());
        assert!(StageStatus::ExecutionLimit.forced_kill());
        assert!(!StageStatus::RuntimeError.forced_kill());
        assert!(!StageStatus::Signalled.forced_kill());
    }

    #[test]
    fn stage_status_serializes_as_tag() {
        let json = serde_json::to_string(&StageStatus::Timeout).unwrap();
        assert_eq!(json, r#""TO""#);
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(11), "SIGSEGV");
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(64), "SIG64");
    }

    #[test]
    fn stage_result_optional_fields_omitted() {
        let result = StageResult {
            stdout: "hi\n".into(),
            code: Some(0),
            ..Default::default()
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("status"));
        assert!(!json.contains("message"));
        // code/signal are always present, null when unset
        assert!(json.contains(r#""code":0"#));
        assert!(json.contains(r#""signal":null"#));
    }

    #[test]
    fn execution_result_omits_absent_stages() {
        let result = ExecutionResult {
            language: "python".into(),
            version: "3.12.0".into(),
            compile: None,
            run: Some(StageResult::default()),
            limits: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("compile"));
        assert!(json.contains("run"));
    }

    #[test]
    fn effective_limits_stage_view() {
        let limits = EffectiveLimits {
            timeouts: StagePair {
                compile: 10_000,
                run: 3_000,
            },
            cpu_times: StagePair {
                compile: 9_000,
                run: 2_000,
            },
            memory_limits: StagePair {
                compile: -1,
                run: 128_000_000,
            },
        };
        let run = limits.stage(Stage::Run);
        assert_eq!(run.wall_ms, 3_000);
        assert_eq!(run.cpu_ms, 2_000);
        assert_eq!(run.mem_bytes, 128_000_000);
        let compile = limits.stage(Stage::Compile);
        assert_eq!(compile.wall_ms, 10_000);
        assert_eq!(compile.mem_bytes, -1);
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn decode_never_panics(tag in ".*", content in ".*") {
            let _ = FileEncoding::from_tag(&tag).decode(&content);
        }

        #[test]
        fn signal_name_never_empty(signal in i32::MIN..i32::MAX) {
            prop_assert!(!signal_name(signal).is_empty());
        }

        #[test]
        fn utf8_decode_is_identity(content in ".*") {
            let decoded = FileEncoding::Utf8.decode(&content).unwrap();
            prop_assert_eq!(decoded, content.as_bytes());
        }
    }
}
