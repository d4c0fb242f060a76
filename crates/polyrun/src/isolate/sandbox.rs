//! Box lifecycle for the `iso` helper.
//!
//! Allocates numbered sandbox boxes, stages submission files into them, and
//! tears them down. Box IDs are drawn from a process-wide atomic counter
//! modulo [`BOX_ID_RANGE`]; a given ID belongs to at most one live box.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::isolate::IsolateError;
use crate::isolate::command::{cleanup_command, init_command};
use crate::types::ResolvedFile;

/// Box IDs live in `[0, BOX_ID_RANGE)`.
pub const BOX_ID_RANGE: u32 = 1000;

/// One allocated sandbox box.
///
/// Owned exclusively by a single job from `--init` to `--cleanup`.
#[derive(Debug, Clone)]
pub struct SandboxBox {
    id: u32,
    root: PathBuf,
    meta_path: PathBuf,
}

impl SandboxBox {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Working directory of the box (`<init output>/box`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Metadata file written by `iso --run`.
    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Directory the submission files are staged into.
    pub fn submission_dir(&self) -> PathBuf {
        self.root.join("submission")
    }
}

/// Allocates and tears down sandbox boxes.
#[derive(Debug)]
pub struct BoxAllocator {
    iso_path: PathBuf,
    counter: AtomicU32,
    /// Namespaces metadata files so concurrent engine instances never
    /// collide on a box ID.
    instance: Uuid,
}

impl BoxAllocator {
    pub fn new(iso_path: impl Into<PathBuf>) -> Self {
        Self {
            iso_path: iso_path.into(),
            counter: AtomicU32::new(0),
            instance: Uuid::new_v4(),
        }
    }

    /// Allocate the next box: `iso --init --cg -b<ID>`.
    ///
    /// The helper prints the box base path; the working directory is its
    /// `box/` subdirectory.
    #[instrument(skip(self))]
    pub async fn alloc(&self) -> Result<SandboxBox, IsolateError> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) % BOX_ID_RANGE;
        let args = init_command(&self.iso_path, id);

        debug!(?args, "initializing sandbox box");
        let output = run_helper(&args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IsolateError::InitFailed {
                id,
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let base = stdout.trim();
        if base.is_empty() {
            return Err(IsolateError::InitFailed {
                id,
                message: "helper printed no box path".to_string(),
            });
        }

        let sandbox = SandboxBox {
            id,
            root: PathBuf::from(base).join("box"),
            meta_path: std::env::temp_dir()
                .join(format!("{}-{id}-metadata.txt", self.instance.simple())),
        };

        debug!(id, root = %sandbox.root.display(), "box initialized");
        Ok(sandbox)
    }

    /// Stage submission files into the box.
    ///
    /// Creates `<box>/submission/`, decodes each file per its declared
    /// encoding, and writes it mode 0644, creating any subdirectories the
    /// name implies. Names containing `..` or starting with `/` are
    /// rejected before anything is written.
    #[instrument(skip(self, files), fields(box_id = sandbox.id()))]
    pub async fn prime(
        &self,
        sandbox: &SandboxBox,
        files: &[ResolvedFile],
    ) -> Result<(), IsolateError> {
        let submission = sandbox.submission_dir();
        tokio::fs::create_dir_all(&submission).await?;
        set_mode(&submission, 0o700).await?;

        for file in files {
            if file.name.contains("..") || file.name.starts_with('/') {
                return Err(IsolateError::InvalidPath(file.name.clone()));
            }

            let data = file
                .encoding
                .decode(&file.content)
                .map_err(|source| IsolateError::InvalidFile {
                    name: file.name.clone(),
                    source,
                })?;

            let path = submission.join(&file.name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &data).await?;
            set_mode(&path, 0o644).await?;

            debug!(name = %file.name, len = data.len(), "staged submission file");
        }

        Ok(())
    }

    /// Tear the box down: `iso --cleanup --cg -b<ID>` plus metadata removal.
    ///
    /// Jobs call this for every box they ever allocated, on every exit path.
    #[instrument(skip(self), fields(box_id = sandbox.id()))]
    pub async fn cleanup(&self, sandbox: &SandboxBox) -> Result<(), IsolateError> {
        let args = cleanup_command(&self.iso_path, sandbox.id());

        debug!(?args, "cleaning up sandbox box");
        let output = run_helper(&args).await?;

        if let Err(err) = tokio::fs::remove_file(sandbox.meta_path()).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %sandbox.meta_path().display(), %err, "failed to remove metadata file");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(id = sandbox.id(), stderr = %stderr, "cleanup failed");
            return Err(IsolateError::CleanupFailed {
                id: sandbox.id(),
                message: stderr.trim().to_string(),
            });
        }

        debug!("box cleaned up");
        Ok(())
    }
}

async fn run_helper(args: &[String]) -> Result<std::process::Output, IsolateError> {
    let program = args
        .first()
        .ok_or_else(|| IsolateError::CommandFailed("empty command arguments".to_string()))?;
    Command::new(program)
        .args(&args[1..])
        .output()
        .await
        .map_err(IsolateError::SpawnFailed)
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), IsolateError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}
