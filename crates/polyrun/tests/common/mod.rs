#![allow(dead_code)]

//! Shared test fixtures.
//!
//! Engine-level tests run against a scripted stand-in for the `iso`
//! helper: it honors the helper's CLI and metadata contract (init prints a
//! box path, run writes a `key:value` metadata file, cleanup tears the box
//! down) but executes the stage scripts directly on the host. Language
//! packages are small bash scripts, so no real runtimes are needed.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use polyrun::{Config, Engine};

/// The scripted helper. Honors `--init`, `--run` (including `--wall-time`
/// enforcement via `timeout` and the `TO` metadata status), and
/// `--cleanup`.
const FAKE_HELPER: &str = r#"#!/bin/bash
set -u
base="$(dirname "$0")/boxes"

case "$1" in
  --init)
    id="${3#-b}"
    mkdir -p "$base/$id/box"
    echo "$base/$id"
    ;;
  --cleanup)
    id="${3#-b}"
    rm -rf "$base/$id"
    ;;
  --run)
    shift
    box_id=""
    meta=""
    wall=0
    while [ $# -gt 0 ]; do
      case "$1" in
        -b*) box_id="${1#-b}" ;;
        --meta=*) meta="${1#--meta=}" ;;
        --wall-time=*) wall="${1#--wall-time=}" ;;
        --) shift; break ;;
      esac
      shift
    done
    cd "$base/$box_id/box/submission" || exit 2
    if [ "$wall" -gt 0 ]; then
      timeout --signal=KILL "$wall" "$@"
    else
      "$@"
    fi
    code=$?
    {
      echo "time:0.010"
      echo "time-wall:0.020"
      echo "cg-mem:1024"
      if [ "$wall" -gt 0 ] && { [ $code -eq 124 ] || [ $code -eq 137 ]; }; then
        echo "status:TO"
        echo "message:Time limit exceeded"
      else
        echo "exitcode:$code"
      fi
    } > "$meta"
    exit $code
    ;;
  *)
    exit 64
    ;;
esac
"#;

/// Run script for interpreted packages: the entry point is executed as a
/// bash script with the remaining arguments.
const INTERPRETED_RUN: &str = r#"file="$1"
shift
exec bash "$file" "$@"
"#;

/// Compile script for compiled packages: syntax-check every source, then
/// concatenate them into the artifact.
const COMPILED_COMPILE: &str = r#"for src in "$@"; do
  bash -n "$src" || exit 1
done
cat "$@" > program.sh
echo "compiled $# file(s)"
"#;

/// Run script for compiled packages: ignore the entry name, execute the
/// artifact produced by the compile stage.
const COMPILED_RUN: &str = r#"shift
exec bash program.sh "$@"
"#;

pub struct TestEnv {
    dir: tempfile::TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");

        let helper = dir.path().join("iso");
        std::fs::write(&helper, FAKE_HELPER).expect("write helper");
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755))
            .expect("chmod helper");

        Self { dir }
    }

    pub fn config(&self) -> Config {
        Config {
            data_directory: self.dir.path().to_path_buf(),
            iso_path: self.dir.path().join("iso"),
            run_timeout: 2_000,
            compile_timeout: 5_000,
            ..Default::default()
        }
    }

    pub async fn engine(&self) -> Arc<Engine> {
        Engine::new(self.config()).await.expect("engine")
    }

    /// Directory the fake helper materializes boxes into.
    pub fn boxes_dir(&self) -> PathBuf {
        self.dir.path().join("boxes")
    }

    /// Count of live (not yet cleaned up) boxes.
    pub fn live_boxes(&self) -> usize {
        match std::fs::read_dir(self.boxes_dir()) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    /// Install an interpreted package fixture.
    pub fn add_interpreted(&self, language: &str, version: &str, aliases: &[&str]) {
        let dir = self.package_dir(language, version);
        self.write_pkg_info(&dir, language, version, aliases);
        std::fs::write(dir.join("run"), INTERPRETED_RUN).expect("write run");
    }

    /// Install a compiled package fixture.
    pub fn add_compiled(&self, language: &str, version: &str) {
        let dir = self.package_dir(language, version);
        self.write_pkg_info(&dir, language, version, &[]);
        std::fs::write(dir.join("compile"), COMPILED_COMPILE).expect("write compile");
        std::fs::write(dir.join("run"), COMPILED_RUN).expect("write run");
    }

    fn package_dir(&self, language: &str, version: &str) -> PathBuf {
        let dir = self
            .dir
            .path()
            .join("packages")
            .join(language)
            .join(version);
        std::fs::create_dir_all(&dir).expect("package dir");
        dir
    }

    fn write_pkg_info(&self, dir: &PathBuf, language: &str, version: &str, aliases: &[&str]) {
        let info = serde_json::json!({
            "language": language,
            "version": version,
            "aliases": aliases,
            "build_platform": "linux/amd64",
        });
        std::fs::write(dir.join("pkg-info.json"), info.to_string()).expect("write pkg-info");
        std::fs::write(dir.join(".installed"), "1700000000").expect("write sentinel");
    }
}
