//! Package installer.
//!
//! Fetches a line-oriented package index, resolves `(language,
//! version-constraint)` to a concrete package, downloads and verifies the
//! archive, extracts it into the installation tree, captures the package
//! environment, marks it installed, and refreshes the runtime registry.
//! Install is not atomic across a process crash; residue from a partial
//! install is detected and removed by the next attempt.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::registry::{INSTALLED_SENTINEL, Registry, parse_constraint};

/// Downloaded archive name inside the install directory.
const ARCHIVE_NAME: &str = "pkg.tar.gz";

/// Environment variables never cached from the `environment` script.
const ENV_EXCLUDES: [&str; 4] = ["PWD", "OLDPWD", "_", "SHLVL"];

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("{0}")]
    NotFound(String),

    #[error("package {language}-{version} is already installed")]
    AlreadyInstalled { language: String, version: String },

    #[error("download failed: {0}")]
    Download(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },

    #[error("failed to extract package: {0}")]
    Extract(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One line of the package index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub language: String,
    pub version: Version,
    /// Hex-encoded SHA-256 of the archive.
    pub checksum: String,
    /// Archive download URL.
    pub download: String,
}

/// Listing entry for the external packages endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub language: String,
    pub language_version: String,
    pub installed: bool,
}

/// Downloads, verifies, and installs language packages.
#[derive(Debug)]
pub struct Installer {
    config: Arc<Config>,
    registry: Arc<Registry>,
    client: reqwest::Client,
}

impl Installer {
    pub fn new(config: Arc<Config>, registry: Arc<Registry>) -> Self {
        Self {
            config,
            registry,
            client: reqwest::Client::new(),
        }
    }

    /// Parse the index: one `language,version,sha256-hex,url` record per
    /// line, blank lines ignored, malformed lines logged and skipped.
    pub fn parse_index(text: &str) -> Vec<PackageSpec> {
        let mut packages = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.split(',').collect();
            let &[language, version, checksum, download] = parts.as_slice() else {
                warn!(line, "invalid package index line");
                continue;
            };

            let version = match Version::parse(version) {
                Ok(version) => version,
                Err(err) => {
                    warn!(line, %err, "invalid package version");
                    continue;
                }
            };

            packages.push(PackageSpec {
                language: language.to_string(),
                version,
                checksum: checksum.to_string(),
                download: download.to_string(),
            });
        }
        packages
    }

    /// Fetch and parse the configured package index.
    #[instrument(skip(self))]
    pub async fn fetch_index(&self) -> Result<Vec<PackageSpec>, PackageError> {
        let response = self
            .client
            .get(&self.config.repo_url)
            .send()
            .await
            .map_err(|e| PackageError::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PackageError::Download(format!(
                "repository returned status {}",
                response.status()
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| PackageError::Download(e.to_string()))?;

        let packages = Self::parse_index(&text);
        debug!(count = packages.len(), "fetched package index");
        Ok(packages)
    }

    /// Highest-version index entry matching `(language, constraint)`.
    pub async fn find(
        &self,
        language: &str,
        constraint: &str,
    ) -> Result<PackageSpec, PackageError> {
        let req =
            parse_constraint(constraint).map_err(|e| PackageError::NotFound(e.to_string()))?;

        self.fetch_index()
            .await?
            .into_iter()
            .filter(|pkg| pkg.language == language && req.matches(&pkg.version))
            .max_by(|a, b| a.version.cmp(&b.version))
            .ok_or_else(|| {
                PackageError::NotFound(format!("no package found for {language}-{constraint}"))
            })
    }

    /// Index entries plus their installed state.
    pub async fn list(&self) -> Result<Vec<PackageInfo>, PackageError> {
        let packages = self.fetch_index().await?;
        Ok(packages
            .into_iter()
            .map(|pkg| PackageInfo {
                installed: self.is_installed(&pkg),
                language_version: pkg.version.to_string(),
                language: pkg.language,
            })
            .collect())
    }

    pub fn is_installed(&self, pkg: &PackageSpec) -> bool {
        self.install_path(&pkg.language, &pkg.version)
            .join(INSTALLED_SENTINEL)
            .exists()
    }

    fn install_path(&self, language: &str, version: &Version) -> PathBuf {
        self.config
            .packages_dir()
            .join(language)
            .join(version.to_string())
    }

    /// Install the best match for `(language, constraint)`.
    #[instrument(skip(self))]
    pub async fn install(
        &self,
        language: &str,
        constraint: &str,
    ) -> Result<PackageSpec, PackageError> {
        let pkg = self.find(language, constraint).await?;
        let install_path = self.install_path(&pkg.language, &pkg.version);

        if self.is_installed(&pkg) {
            return Err(PackageError::AlreadyInstalled {
                language: pkg.language,
                version: pkg.version.to_string(),
            });
        }

        info!(language = %pkg.language, version = %pkg.version, "installing package");

        // Residue from an interrupted install.
        if install_path.exists() {
            warn!(path = %install_path.display(), "removing residual package files");
            tokio::fs::remove_dir_all(&install_path).await?;
        }
        tokio::fs::create_dir_all(&install_path).await?;

        let archive = install_path.join(ARCHIVE_NAME);
        self.download(&pkg.download, &archive).await?;

        if let Err(err) = verify_checksum(&archive, &pkg.checksum).await {
            let _ = tokio::fs::remove_dir_all(&install_path).await;
            return Err(err);
        }

        extract_archive(&archive, &install_path).await?;

        if let Err(err) = cache_environment(&install_path).await {
            warn!(%err, "failed to cache package environment");
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        tokio::fs::write(
            install_path.join(INSTALLED_SENTINEL),
            timestamp.to_string(),
        )
        .await?;

        if let Err(err) = self.registry.upsert(&install_path).await {
            warn!(%err, "installed package failed to load into the registry");
        }

        info!(language = %pkg.language, version = %pkg.version, "package installed");
        Ok(pkg)
    }

    /// Remove an installed package and deregister its runtimes.
    #[instrument(skip(self))]
    pub async fn uninstall(&self, language: &str, version: &str) -> Result<(), PackageError> {
        let version = Version::parse(version)
            .map_err(|e| PackageError::NotFound(format!("invalid version {version:?}: {e}")))?;
        let install_path = self.install_path(language, &version);

        if !install_path.join(INSTALLED_SENTINEL).exists() {
            return Err(PackageError::NotFound(format!(
                "package {language}-{version} is not installed"
            )));
        }

        info!(language, %version, "uninstalling package");
        tokio::fs::remove_dir_all(&install_path).await?;
        self.registry.remove(language, &version).await;
        Ok(())
    }

    /// Stream an archive to disk.
    async fn download(&self, url: &str, dest: &Path) -> Result<(), PackageError> {
        debug!(url, dest = %dest.display(), "downloading package archive");

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PackageError::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PackageError::Download(format!(
                "download failed with status {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| PackageError::Download(e.to_string()))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// Verify the SHA-256 of a file against a hex digest.
async fn verify_checksum(path: &Path, expected: &str) -> Result<(), PackageError> {
    let path = path.to_path_buf();
    let expected = expected.to_lowercase();

    let actual = tokio::task::spawn_blocking(move || -> Result<String, std::io::Error> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| PackageError::Extract(e.to_string()))??;

    if actual != expected {
        return Err(PackageError::Checksum {
            expected,
            actual,
        });
    }
    Ok(())
}

/// Extract a gzipped tarball in place.
async fn extract_archive(archive: &Path, dest: &Path) -> Result<(), PackageError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<(), PackageError> {
        let file = std::fs::File::open(&archive)?;
        let decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(file));
        let mut tar = tar::Archive::new(decoder);
        tar.set_preserve_permissions(true);
        tar.unpack(&dest)
            .map_err(|e| PackageError::Extract(e.to_string()))
    })
    .await
    .map_err(|e| PackageError::Extract(e.to_string()))?
}

/// Source the package's `environment` script in a subshell and cache the
/// resulting variables (minus shell housekeeping) into `.env`.
async fn cache_environment(install_path: &Path) -> Result<(), PackageError> {
    if !install_path.join("environment").exists() {
        debug!("no environment script, skipping env capture");
        return Ok(());
    }

    let output = tokio::process::Command::new("bash")
        .arg("-c")
        .arg(format!(
            "cd {} && source environment && env",
            install_path.display()
        ))
        .output()
        .await?;

    if !output.status.success() {
        return Err(PackageError::Io(std::io::Error::other(format!(
            "environment script failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))));
    }

    let captured = String::from_utf8_lossy(&output.stdout);
    let filtered: Vec<&str> = captured
        .lines()
        .filter(|line| {
            line.split_once('=')
                .is_some_and(|(key, _)| !ENV_EXCLUDES.contains(&key))
        })
        .collect();

    tokio::fs::write(
        install_path.join(crate::registry::ENV_FILE),
        filtered.join("\n"),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Installer) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            data_directory: dir.path().to_path_buf(),
            ..Default::default()
        });
        let registry = Arc::new(Registry::new(config.clone()));
        let installer = Installer::new(config, registry);
        (dir, installer)
    }

    #[test]
    fn parse_index_reads_records() {
        let index = "\
go,1.16.2,aabbcc,https://example.test/go-1.16.2.tar.gz
python,3.12.0,ddeeff,https://example.test/python-3.12.0.tar.gz
";
        let packages = Installer::parse_index(index);
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].language, "go");
        assert_eq!(packages[0].version, Version::parse("1.16.2").unwrap());
        assert_eq!(packages[0].checksum, "aabbcc");
        assert_eq!(packages[1].download, "https://example.test/python-3.12.0.tar.gz");
    }

    #[test]
    fn parse_index_skips_blank_and_malformed_lines() {
        let index = "\n\ngo,1.16.2,aabbcc\nrust,not-a-version,x,y\n  \npython,3.12.0,dd,https://u\n";
        let packages = Installer::parse_index(index);
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].language, "python");
    }

    #[test]
    fn install_path_layout() {
        let (dir, installer) = fixture();
        let path = installer.install_path("go", &Version::parse("1.16.2").unwrap());
        assert_eq!(path, dir.path().join("packages/go/1.16.2"));
    }

    #[tokio::test]
    async fn checksum_accepts_matching_digest() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pkg.tar.gz");
        std::fs::write(&file, b"hello").unwrap();

        // sha256("hello")
        let digest = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        verify_checksum(&file, digest).await.unwrap();
        // case-insensitive on the expected side
        verify_checksum(&file, &digest.to_uppercase()).await.unwrap();
    }

    #[tokio::test]
    async fn checksum_rejects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pkg.tar.gz");
        std::fs::write(&file, b"hello").unwrap();

        let err = verify_checksum(&file, "00ff").await.unwrap_err();
        match err {
            PackageError::Checksum { expected, actual } => {
                assert_eq!(expected, "00ff");
                assert!(actual.starts_with("2cf24dba"));
            }
            other => panic!("expected checksum error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn extract_unpacks_gzipped_tarball() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("pkg.tar.gz");

        // Build a small archive: run script plus metadata.
        let gz = flate2::write::GzEncoder::new(
            std::fs::File::create(&archive_path).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(gz);
        let mut header = tar::Header::new_gnu();
        let run = b"#!/bin/bash\necho hi\n";
        header.set_size(run.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, "run", &run[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        extract_archive(&archive_path, &dest).await.unwrap();

        let content = std::fs::read_to_string(dest.join("run")).unwrap();
        assert!(content.contains("echo hi"));
    }

    #[tokio::test]
    async fn extract_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("pkg.tar.gz");
        std::fs::write(&archive_path, b"definitely not a tarball").unwrap();

        let err = extract_archive(&archive_path, dir.path()).await.unwrap_err();
        assert!(matches!(err, PackageError::Extract(_)));
    }

    #[tokio::test]
    async fn cache_environment_filters_housekeeping_vars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("environment"),
            "export RUNTIME_HOME=/opt/runtime\nexport EXTRA=1\n",
        )
        .unwrap();

        cache_environment(dir.path()).await.unwrap();

        let cached = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(cached.contains("RUNTIME_HOME=/opt/runtime"));
        assert!(cached.contains("EXTRA=1"));
        for excluded in ENV_EXCLUDES {
            assert!(
                !cached.lines().any(|l| l.starts_with(&format!("{excluded}="))),
                "{excluded} should be filtered"
            );
        }
    }

    #[tokio::test]
    async fn cache_environment_without_script_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        cache_environment(dir.path()).await.unwrap();
        assert!(!dir.path().join(".env").exists());
    }

    #[tokio::test]
    async fn uninstall_removes_directory() {
        let (dir, installer) = fixture();
        let pkg_dir = dir.path().join("packages/go/1.16.2");
        std::fs::create_dir_all(&pkg_dir).unwrap();
        std::fs::write(pkg_dir.join(INSTALLED_SENTINEL), "1700000000").unwrap();

        installer.uninstall("go", "1.16.2").await.unwrap();
        assert!(!pkg_dir.exists());
    }

    #[tokio::test]
    async fn uninstall_missing_package_errors() {
        let (_dir, installer) = fixture();
        let err = installer.uninstall("go", "1.16.2").await.unwrap_err();
        assert!(matches!(err, PackageError::NotFound(_)));

        let err = installer.uninstall("go", "not-a-version").await.unwrap_err();
        assert!(matches!(err, PackageError::NotFound(_)));
    }
}
