//! Command builders for the `iso` CLI.
//!
//! Assembles the exact argument vectors for `iso --init`, `iso --run`, and
//! `iso --cleanup`. The flag set and unit conversions are fixed by the
//! helper's contract; changing them breaks resource enforcement.

use std::path::PathBuf;

use crate::types::{Stage, StageLimits};

/// Arguments for `iso --init --cg -b<ID>`.
pub fn init_command(iso_path: &std::path::Path, box_id: u32) -> Vec<String> {
    vec![
        iso_path.to_string_lossy().into_owned(),
        "--init".to_string(),
        "--cg".to_string(),
        format!("-b{box_id}"),
    ]
}

/// Arguments for `iso --cleanup --cg -b<ID>`.
pub fn cleanup_command(iso_path: &std::path::Path, box_id: u32) -> Vec<String> {
    vec![
        iso_path.to_string_lossy().into_owned(),
        "--cleanup".to_string(),
        "--cg".to_string(),
        format!("-b{box_id}"),
    ]
}

/// Builder for one `iso --run` invocation.
#[derive(Debug)]
pub struct RunCommand {
    iso_path: PathBuf,
    box_id: u32,
    meta_path: PathBuf,
    language: String,
    env_vars: Vec<String>,
    pkg_dir: PathBuf,
    max_processes: i64,
    max_open_files: i64,
    max_file_size: i64,
    limits: StageLimits,
    share_net: bool,
    stage: Stage,
    argv: Vec<String>,
}

impl RunCommand {
    pub fn new(iso_path: impl Into<PathBuf>, box_id: u32, meta_path: impl Into<PathBuf>) -> Self {
        Self {
            iso_path: iso_path.into(),
            box_id,
            meta_path: meta_path.into(),
            language: String::new(),
            env_vars: Vec::new(),
            pkg_dir: PathBuf::new(),
            max_processes: 64,
            max_open_files: 2048,
            max_file_size: 10_000_000,
            limits: StageLimits {
                wall_ms: 0,
                cpu_ms: 0,
                mem_bytes: -1,
            },
            share_net: false,
            stage: Stage::Run,
            argv: Vec::new(),
        }
    }

    /// Language name, exported as `LANGUAGE` inside the sandbox.
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// `KEY=VALUE` environment lines captured at package install time.
    pub fn env_vars(mut self, vars: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env_vars.extend(vars.into_iter().map(Into::into));
        self
    }

    /// Package install directory, bind-mounted into the sandbox and
    /// providing the stage scripts.
    pub fn pkg_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pkg_dir = dir.into();
        self
    }

    pub fn max_processes(mut self, count: i64) -> Self {
        self.max_processes = count;
        self
    }

    pub fn max_open_files(mut self, count: i64) -> Self {
        self.max_open_files = count;
        self
    }

    /// Largest file the sandboxed process may create, in bytes.
    pub fn max_file_size(mut self, bytes: i64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Wall/CPU/memory budget for this stage.
    pub fn limits(mut self, limits: StageLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn share_net(mut self, enable: bool) -> Self {
        self.share_net = enable;
        self
    }

    /// Stage script to execute plus its arguments.
    pub fn stage(mut self, stage: Stage, argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stage = stage;
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn box_id(&self) -> u32 {
        self.box_id
    }

    /// Build the full argument vector, starting with the helper path.
    pub fn build(self) -> Vec<String> {
        let mut args = vec![
            self.iso_path.to_string_lossy().into_owned(),
            "--run".to_string(),
            format!("-b{}", self.box_id),
            format!("--meta={}", self.meta_path.display()),
            "--cg".to_string(),
            "-s".to_string(),
            "-c".to_string(),
            "/box/submission".to_string(),
            "-E".to_string(),
            "HOME=/tmp".to_string(),
        ];

        for var in &self.env_vars {
            args.push("-E".to_string());
            args.push(var.clone());
        }
        args.push("-E".to_string());
        args.push(format!("LANGUAGE={}", self.language));

        args.push(format!("--dir={}", self.pkg_dir.display()));
        args.push("--dir=/etc:noexec".to_string());

        args.push(format!("--processes={}", self.max_processes));
        args.push(format!("--open-files={}", self.max_open_files));
        args.push(format!("--fsize={}", self.max_file_size / 1000));

        // Sub-second budgets round up to one second so the helper can
        // enforce them; non-positive budgets omit the flag entirely.
        if self.limits.wall_ms > 0 {
            args.push(format!("--wall-time={}", (self.limits.wall_ms + 999) / 1000));
        }
        if self.limits.cpu_ms > 0 {
            args.push(format!("--time={}", (self.limits.cpu_ms + 999) / 1000));
        }
        args.push("--extra-time=0".to_string());

        if self.limits.mem_bytes >= 0 {
            args.push(format!("--cg-mem={}", self.limits.mem_bytes / 1000));
        }

        if self.share_net {
            args.push("--share-net".to_string());
        }

        args.push("--".to_string());
        args.push("/bin/bash".to_string());
        args.push(
            self.pkg_dir
                .join(self.stage.script())
                .to_string_lossy()
                .into_owned(),
        );
        args.extend(self.argv);

        args
    }
}
