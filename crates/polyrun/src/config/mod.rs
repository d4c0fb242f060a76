use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{EffectiveLimits, StagePair};

mod loader;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-language limit overrides.
///
/// The same key set appears in two places with different precedence: the
/// process config's `limit_overrides` table and a package's
/// `pkg-info.json`. Package values win over process values, which win over
/// process defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_process_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_open_files: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_max_size: Option<i64>,
}

/// Engine configuration.
///
/// `bind_address` and `request_body_limit` are carried for transport
/// adapters; the engine itself does not open sockets.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Transport listener address (consumed by adapters).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Root of the packages tree.
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,

    /// Path to the `iso` sandbox helper binary.
    #[serde(default = "default_iso_path")]
    pub iso_path: PathBuf,

    /// Size of the process-wide job semaphore.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Default wall-clock limits in milliseconds.
    #[serde(default = "default_compile_timeout")]
    pub compile_timeout: i64,
    #[serde(default = "default_run_timeout")]
    pub run_timeout: i64,

    /// Default CPU limits in milliseconds.
    #[serde(default = "default_compile_timeout")]
    pub compile_cpu_time: i64,
    #[serde(default = "default_run_timeout")]
    pub run_cpu_time: i64,

    /// Default memory caps in bytes; -1 means uncapped.
    #[serde(default = "default_memory_limit")]
    pub compile_memory_limit: i64,
    #[serde(default = "default_memory_limit")]
    pub run_memory_limit: i64,

    #[serde(default = "default_max_process_count")]
    pub max_process_count: i64,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: i64,
    /// Largest file a sandboxed process may create, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: i64,
    /// Cap on captured stdout/stderr, in bytes.
    #[serde(default = "default_output_max_size")]
    pub output_max_size: i64,

    /// When true the sandbox runs without `--share-net`.
    #[serde(default = "default_true")]
    pub disable_networking: bool,

    /// Unprivileged uid/gid range handed to the sandbox helper.
    #[serde(default = "default_runner_id_min")]
    pub runner_uid_min: u32,
    #[serde(default = "default_runner_id_max")]
    pub runner_uid_max: u32,
    #[serde(default = "default_runner_id_min")]
    pub runner_gid_min: u32,
    #[serde(default = "default_runner_id_max")]
    pub runner_gid_max: u32,

    /// Package index URL.
    #[serde(default = "default_repo_url")]
    pub repo_url: String,

    /// Per-language limit overrides, keyed by language name.
    #[serde(default)]
    pub limit_overrides: HashMap<String, LimitOverrides>,

    /// Transport-level request body cap in bytes (consumed by adapters).
    #[serde(default = "default_request_body_limit")]
    pub request_body_limit: usize,
}

impl Config {
    /// Default limits applied to a job before runtime and request overrides.
    pub fn default_limits(&self) -> EffectiveLimits {
        EffectiveLimits {
            timeouts: StagePair {
                compile: self.compile_timeout,
                run: self.run_timeout,
            },
            cpu_times: StagePair {
                compile: self.compile_cpu_time,
                run: self.run_cpu_time,
            },
            memory_limits: StagePair {
                compile: self.compile_memory_limit,
                run: self.run_memory_limit,
            },
        }
    }

    /// Process-level overrides for a language, if any.
    pub fn overrides_for(&self, language: &str) -> Option<&LimitOverrides> {
        self.limit_overrides.get(language)
    }

    /// Root of the packages tree: `<data_directory>/packages`.
    pub fn packages_dir(&self) -> PathBuf {
        self.data_directory.join("packages")
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_jobs must be positive".into(),
            ));
        }
        if self.runner_uid_min >= self.runner_uid_max {
            return Err(ConfigError::Invalid(
                "runner_uid_min must be less than runner_uid_max".into(),
            ));
        }
        if self.runner_gid_min >= self.runner_gid_max {
            return Err(ConfigError::Invalid(
                "runner_gid_min must be less than runner_gid_max".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            data_directory: default_data_directory(),
            iso_path: default_iso_path(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            compile_timeout: default_compile_timeout(),
            run_timeout: default_run_timeout(),
            compile_cpu_time: default_compile_timeout(),
            run_cpu_time: default_run_timeout(),
            compile_memory_limit: default_memory_limit(),
            run_memory_limit: default_memory_limit(),
            max_process_count: default_max_process_count(),
            max_open_files: default_max_open_files(),
            max_file_size: default_max_file_size(),
            output_max_size: default_output_max_size(),
            disable_networking: true,
            runner_uid_min: default_runner_id_min(),
            runner_uid_max: default_runner_id_max(),
            runner_gid_min: default_runner_id_min(),
            runner_gid_max: default_runner_id_max(),
            repo_url: default_repo_url(),
            limit_overrides: HashMap::new(),
            request_body_limit: default_request_body_limit(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:2000".into()
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("/polyrun")
}

fn default_iso_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/isolate")
}

fn default_max_concurrent_jobs() -> usize {
    64
}

fn default_compile_timeout() -> i64 {
    10_000
}

fn default_run_timeout() -> i64 {
    3_000
}

fn default_memory_limit() -> i64 {
    -1
}

fn default_max_process_count() -> i64 {
    64
}

fn default_max_open_files() -> i64 {
    2048
}

fn default_max_file_size() -> i64 {
    10_000_000
}

fn default_output_max_size() -> i64 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_runner_id_min() -> u32 {
    1001
}

fn default_runner_id_max() -> u32 {
    1500
}

fn default_repo_url() -> String {
    "https://packages.polyrun.dev/index".into()
}

fn default_request_body_limit() -> usize {
    2_000_000
}
