//! Configuration loading.
//!
//! Layers a TOML file (optional) under `POLYRUN_`-prefixed environment
//! variables using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError};

/// Environment variable prefix, e.g. `POLYRUN_MAX_CONCURRENT_JOBS=8`.
const ENV_PREFIX: &str = "POLYRUN";

impl Config {
    /// Load configuration from a file, with environment overrides on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the environment only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_toml_yields_defaults() {
        let config = Config::parse_toml("").unwrap();
        assert_eq!(config.max_concurrent_jobs, 64);
        assert_eq!(config.output_max_size, 1024);
    }

    #[test]
    fn parse_overriding_toml() {
        let toml = r#"
data_directory = "/srv/runner"
max_concurrent_jobs = 4
run_timeout = 500
disable_networking = false

[limit_overrides.java]
run_memory_limit = 512000000
max_process_count = 128
"#;
        let config = Config::parse_toml(toml).unwrap();
        assert_eq!(
            config.data_directory,
            std::path::PathBuf::from("/srv/runner")
        );
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.run_timeout, 500);
        assert!(!config.disable_networking);

        let java = config.overrides_for("java").unwrap();
        assert_eq!(java.run_memory_limit, Some(512_000_000));
        assert_eq!(java.max_process_count, Some(128));
        assert_eq!(java.run_timeout, None);
    }

    #[test]
    fn parse_invalid_ranges_rejected() {
        let toml = "runner_uid_min = 5000\nrunner_uid_max = 100\n";
        assert!(Config::parse_toml(toml).is_err());
    }
}
