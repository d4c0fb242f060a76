//! Metadata-file parsing.
//!
//! After `iso --run` exits it leaves a line-oriented `key:value` file
//! describing resource usage and the exit condition. Recognized keys:
//! `cg-mem`, `exitcode`, `exitsig`, `message`, `status`, `time`,
//! `time-wall`.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use crate::isolate::IsolateError;
use crate::types::{StageResult, StageStatus, signal_name};

/// Error from strict metadata parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("metadata parse error at line {line_number}: {message} (line: {line:?})")]
pub struct MetaParseError {
    /// 1-indexed line number.
    pub line_number: usize,
    pub line: String,
    pub message: String,
}

/// Parsed metadata file.
#[derive(Debug, Clone, Default)]
pub struct MetaFile {
    entries: HashMap<String, String>,
}

impl MetaFile {
    /// Lenient parse: malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // Values may themselves contain colons (messages, timestamps);
            // only the first colon separates key from value.
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if !key.is_empty() {
                    entries.insert(key.to_string(), value.trim().to_string());
                }
            }
        }

        Self { entries }
    }

    /// Strict parse: any non-empty line without a `key:value` shape errors.
    pub fn try_parse(content: &str) -> Result<Self, MetaParseError> {
        let mut entries = HashMap::new();

        for (line_idx, line) in content.lines().enumerate() {
            let line_number = line_idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match trimmed.split_once(':') {
                Some((key, value)) => {
                    let key = key.trim();
                    if key.is_empty() {
                        return Err(MetaParseError {
                            line_number,
                            line: line.to_string(),
                            message: "empty key before colon".to_string(),
                        });
                    }
                    entries.insert(key.to_string(), value.trim().to_string());
                }
                None => {
                    return Err(MetaParseError {
                        line_number,
                        line: line.to_string(),
                        message: "missing colon separator".to_string(),
                    });
                }
            }
        }

        Ok(Self { entries })
    }

    /// Load and leniently parse a metadata file from disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, IsolateError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(Self::parse(&content))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn status(&self) -> Option<StageStatus> {
        self.get("status").map(StageStatus::from_tag)
    }

    /// CPU time in milliseconds (`time` is reported in seconds).
    pub fn cpu_time_ms(&self) -> Option<i64> {
        self.get_f64("time").map(|t| (t * 1000.0).round() as i64)
    }

    /// Wall time in milliseconds (`time-wall` is reported in seconds).
    pub fn wall_time_ms(&self) -> Option<i64> {
        self.get_f64("time-wall").map(|t| (t * 1000.0).round() as i64)
    }

    /// Peak cgroup memory in bytes (`cg-mem` is reported in units of 1000).
    pub fn memory_bytes(&self) -> Option<i64> {
        self.get_i64("cg-mem").map(|kb| kb * 1000)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.get("exitcode").and_then(|v| v.parse().ok())
    }

    /// Terminating signal number, if the process was killed.
    pub fn exit_signal(&self) -> Option<i32> {
        self.get("exitsig").and_then(|v| v.parse().ok())
    }

    pub fn message(&self) -> Option<String> {
        self.get("message").map(String::from)
    }

    /// Merge this metadata into a stage result, applying the status
    /// coercions of the helper contract:
    ///
    /// - `TO`/`OL`/`EL` force `signal = SIGKILL`;
    /// - a populated signal clears the exit code (exactly one of the two
    ///   survives).
    pub fn apply_to(&self, result: &mut StageResult) {
        if let Some(memory) = self.memory_bytes() {
            result.memory = memory;
        }
        if let Some(cpu) = self.cpu_time_ms() {
            result.cpu_time = cpu;
        }
        if let Some(wall) = self.wall_time_ms() {
            result.wall_time = wall;
        }
        if let Some(code) = self.exit_code() {
            result.code = Some(code);
        }
        if let Some(signal) = self.exit_signal() {
            result.signal = Some(signal_name(signal));
        }
        if let Some(status) = self.status() {
            result.status = Some(status);
        }
        if let Some(message) = self.message() {
            result.message = Some(message);
        }

        if result.status.is_some_and(|s| s.forced_kill()) {
            result.signal = Some(signal_name(9));
        }
        if result.signal.is_some() {
            result.code = None;
        }
    }
}
