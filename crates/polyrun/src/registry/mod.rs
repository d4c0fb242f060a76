//! Runtime registry.
//!
//! In-memory catalog of installed language runtimes, discovered under
//! `<data_dir>/packages/<language>/<version>/`. A package counts as
//! installed once its `.installed` sentinel exists; its `pkg-info.json`
//! describes the runtime(s) it provides, an executable `compile` script
//! marks it as compiled, and `.env` carries environment captured at
//! install time. The installer is the only writer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, LimitOverrides};
use crate::types::{EffectiveLimits, StagePair};

/// Sentinel marking a package directory as fully installed.
pub const INSTALLED_SENTINEL: &str = ".installed";

/// Package metadata file name.
pub const PKG_INFO: &str = "pkg-info.json";

/// Cached environment file name.
pub const ENV_FILE: &str = ".env";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no runtime found for {language}-{constraint}")]
    UnknownRuntime {
        language: String,
        constraint: String,
    },

    #[error("invalid version constraint {constraint:?}: {message}")]
    InvalidConstraint { constraint: String, message: String },

    #[error("bad package metadata in {dir}: {message}")]
    BadMetadata { dir: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolved per-runtime resource profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLimits {
    /// Wall-clock budgets in milliseconds.
    pub timeouts: StagePair,
    /// CPU budgets in milliseconds.
    pub cpu_times: StagePair,
    /// Memory caps in bytes; negative means uncapped.
    pub memory_limits: StagePair,
    pub max_process_count: i64,
    pub max_open_files: i64,
    pub max_file_size: i64,
    pub output_max_size: i64,
}

impl RuntimeLimits {
    /// The per-stage budget view used as a job's starting point.
    pub fn effective(&self) -> EffectiveLimits {
        EffectiveLimits {
            timeouts: self.timeouts,
            cpu_times: self.cpu_times,
            memory_limits: self.memory_limits,
        }
    }
}

/// An installed, resolvable language runtime.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub language: String,
    pub version: Version,
    pub aliases: Vec<String>,
    /// Language of the providing package; differs from `language` for
    /// runtimes spawned by a `provides` entry.
    pub runtime: String,
    /// Package install directory (bind-mounted into the sandbox).
    pub pkg_dir: PathBuf,
    /// Whether the package ships a compile stage.
    pub compiled: bool,
    /// `KEY=VALUE` lines captured at install time.
    pub env_vars: Vec<String>,
    pub limits: RuntimeLimits,
    /// `build_platform` from the package metadata, e.g. `linux/amd64`.
    pub platform: Option<String>,
}

impl Runtime {
    /// Whether `name` addresses this runtime by language or alias.
    pub fn matches_language(&self, name: &str) -> bool {
        self.language == name || self.aliases.iter().any(|alias| alias == name)
    }
}

/// Listing entry for the external runtimes endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub language: String,
    pub version: String,
    pub aliases: Vec<String>,
    pub runtime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

impl From<&Runtime> for RuntimeInfo {
    fn from(runtime: &Runtime) -> Self {
        let (os, arch) = match runtime.platform.as_deref().and_then(|p| p.split_once('/')) {
            Some((os, arch)) => (Some(os.to_string()), Some(arch.to_string())),
            None => (None, None),
        };
        Self {
            language: runtime.language.clone(),
            version: runtime.version.to_string(),
            aliases: runtime.aliases.clone(),
            runtime: runtime.runtime.clone(),
            platform: runtime.platform.clone(),
            os,
            arch,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PkgInfo {
    language: String,
    version: String,
    #[serde(default)]
    build_platform: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    provides: Vec<ProvideInfo>,
    #[serde(default)]
    limit_overrides: Option<LimitOverrides>,
}

#[derive(Debug, Deserialize)]
struct ProvideInfo {
    language: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    limit_overrides: Option<LimitOverrides>,
}

/// Catalog of installed runtimes. Single writer (the installer), many
/// readers.
#[derive(Debug)]
pub struct Registry {
    config: Arc<Config>,
    runtimes: RwLock<Vec<Arc<Runtime>>>,
}

impl Registry {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            runtimes: RwLock::new(Vec::new()),
        }
    }

    /// Populate the catalog from disk, replacing any previous contents.
    ///
    /// Per-package metadata errors are logged and skipped; only an
    /// unreadable packages tree is an error.
    #[instrument(skip(self))]
    pub async fn load_all(&self) -> Result<(), RegistryError> {
        let packages_dir = self.config.packages_dir();
        if !packages_dir.exists() {
            warn!(dir = %packages_dir.display(), "packages directory missing, creating it");
            tokio::fs::create_dir_all(&packages_dir).await?;
            *self.runtimes.write().await = Vec::new();
            return Ok(());
        }

        let mut loaded = Vec::new();
        let mut languages = tokio::fs::read_dir(&packages_dir).await?;
        while let Some(language) = languages.next_entry().await? {
            if !language.file_type().await?.is_dir() {
                continue;
            }

            let mut versions = match tokio::fs::read_dir(language.path()).await {
                Ok(versions) => versions,
                Err(err) => {
                    warn!(dir = %language.path().display(), %err, "failed to read language directory");
                    continue;
                }
            };

            while let Some(version) = versions.next_entry().await? {
                if !version.file_type().await?.is_dir() {
                    continue;
                }
                match self.read_package_dir(&version.path()).await {
                    Ok(runtimes) => loaded.extend(runtimes),
                    Err(err) => {
                        warn!(dir = %version.path().display(), %err, "skipping unloadable package");
                    }
                }
            }
        }

        let count = loaded.len();
        *self.runtimes.write().await = loaded;
        info!(count, "loaded runtimes");
        Ok(())
    }

    /// Register the runtimes of a freshly installed package directory.
    #[instrument(skip(self))]
    pub async fn upsert(&self, dir: &Path) -> Result<(), RegistryError> {
        let fresh = self.read_package_dir(dir).await?;
        let mut runtimes = self.runtimes.write().await;
        runtimes.retain(|rt| rt.pkg_dir != dir);
        runtimes.extend(fresh);
        Ok(())
    }

    /// Drop every runtime derived from the `(language, version)` package.
    #[instrument(skip(self))]
    pub async fn remove(&self, language: &str, version: &Version) {
        let mut runtimes = self.runtimes.write().await;
        runtimes.retain(|rt| !(rt.runtime == language && rt.version == *version));
    }

    /// Snapshot of the catalog.
    pub async fn list(&self) -> Vec<Arc<Runtime>> {
        self.runtimes.read().await.clone()
    }

    /// Highest-version runtime whose language or aliases match and whose
    /// version satisfies the constraint.
    pub async fn resolve(
        &self,
        language: &str,
        constraint: &str,
    ) -> Result<Arc<Runtime>, RegistryError> {
        let req = parse_constraint(constraint)?;
        let runtimes = self.runtimes.read().await;
        runtimes
            .iter()
            .filter(|rt| rt.matches_language(language) && req.matches(&rt.version))
            .max_by(|a, b| a.version.cmp(&b.version))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownRuntime {
                language: language.to_string(),
                constraint: constraint.to_string(),
            })
    }

    /// Exact-runtime lookup, addressing the providing package directly.
    pub async fn resolve_by_runtime(
        &self,
        runtime: &str,
        constraint: &str,
    ) -> Result<Arc<Runtime>, RegistryError> {
        let req = parse_constraint(constraint)?;
        let runtimes = self.runtimes.read().await;
        runtimes
            .iter()
            .filter(|rt| rt.runtime == runtime && req.matches(&rt.version))
            .max_by(|a, b| a.version.cmp(&b.version))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownRuntime {
                language: runtime.to_string(),
                constraint: constraint.to_string(),
            })
    }

    /// Whether `(language, version)` is currently installed.
    pub async fn is_installed(&self, language: &str, version: &Version) -> bool {
        let runtimes = self.runtimes.read().await;
        runtimes
            .iter()
            .any(|rt| rt.runtime == language && rt.version == *version)
    }

    async fn read_package_dir(&self, dir: &Path) -> Result<Vec<Arc<Runtime>>, RegistryError> {
        if !dir.join(INSTALLED_SENTINEL).exists() {
            return Ok(Vec::new());
        }

        let info_path = dir.join(PKG_INFO);
        let raw = tokio::fs::read_to_string(&info_path).await?;
        let info: PkgInfo = serde_json::from_str(&raw).map_err(|e| RegistryError::BadMetadata {
            dir: dir.to_path_buf(),
            message: e.to_string(),
        })?;

        let version =
            Version::parse(&info.version).map_err(|e| RegistryError::BadMetadata {
                dir: dir.to_path_buf(),
                message: format!("invalid version {:?}: {e}", info.version),
            })?;

        let compiled = dir.join("compile").is_file();
        let env_vars = read_env_file(&dir.join(ENV_FILE)).await?;

        let mut runtimes = Vec::new();
        if info.provides.is_empty() {
            runtimes.push(Arc::new(Runtime {
                language: info.language.clone(),
                version: version.clone(),
                aliases: info.aliases.clone(),
                runtime: info.language.clone(),
                pkg_dir: dir.to_path_buf(),
                compiled,
                env_vars: env_vars.clone(),
                limits: resolve_limits(
                    &self.config,
                    &info.language,
                    info.limit_overrides.as_ref(),
                ),
                platform: info.build_platform.clone(),
            }));
        } else {
            // One runtime per provided language, all sharing the package.
            for provide in &info.provides {
                runtimes.push(Arc::new(Runtime {
                    language: provide.language.clone(),
                    version: version.clone(),
                    aliases: provide.aliases.clone(),
                    runtime: info.language.clone(),
                    pkg_dir: dir.to_path_buf(),
                    compiled,
                    env_vars: env_vars.clone(),
                    limits: resolve_limits(
                        &self.config,
                        &provide.language,
                        provide.limit_overrides.as_ref(),
                    ),
                    platform: info.build_platform.clone(),
                }));
            }
        }

        debug!(dir = %dir.display(), count = runtimes.len(), "loaded package");
        Ok(runtimes)
    }
}

/// Parse a version constraint.
///
/// A bare version means equality (`"3.12.0"` only matches 3.12.0), unlike
/// the caret default of requirement syntax; `"*"` and range syntax pass
/// through.
pub(crate) fn parse_constraint(constraint: &str) -> Result<VersionReq, RegistryError> {
    let invalid = |message: String| RegistryError::InvalidConstraint {
        constraint: constraint.to_string(),
        message,
    };

    if let Ok(version) = Version::parse(constraint) {
        return VersionReq::parse(&format!("={version}")).map_err(|e| invalid(e.to_string()));
    }
    VersionReq::parse(constraint).map_err(|e| invalid(e.to_string()))
}

/// Resolve a runtime's limits: package overrides win over process-global
/// overrides, which win over process defaults.
fn resolve_limits(
    config: &Config,
    language: &str,
    pkg: Option<&LimitOverrides>,
) -> RuntimeLimits {
    let global = config.overrides_for(language);
    let pick = |field: fn(&LimitOverrides) -> Option<i64>, default: i64| -> i64 {
        pkg.and_then(field)
            .or_else(|| global.and_then(field))
            .unwrap_or(default)
    };

    RuntimeLimits {
        timeouts: StagePair {
            compile: pick(|o| o.compile_timeout, config.compile_timeout),
            run: pick(|o| o.run_timeout, config.run_timeout),
        },
        cpu_times: StagePair {
            compile: pick(|o| o.compile_cpu_time, config.compile_cpu_time),
            run: pick(|o| o.run_cpu_time, config.run_cpu_time),
        },
        memory_limits: StagePair {
            compile: pick(|o| o.compile_memory_limit, config.compile_memory_limit),
            run: pick(|o| o.run_memory_limit, config.run_memory_limit),
        },
        max_process_count: pick(|o| o.max_process_count, config.max_process_count),
        max_open_files: pick(|o| o.max_open_files, config.max_open_files),
        max_file_size: pick(|o| o.max_file_size, config.max_file_size),
        output_max_size: pick(|o| o.output_max_size, config.output_max_size),
    }
}

async fn read_env_file(path: &Path) -> Result<Vec<String>, RegistryError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = tokio::fs::read_to_string(path).await?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}
