//! Polyrun CLI
//!
//! A command-line front end for the polyrun engine: execute local source
//! files in a sandboxed runtime, list installed runtimes, and manage
//! language packages.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use polyrun::{Config, Engine, JobRequest, SourceFile};
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "polyrun")]
#[command(about = "Sandboxed multi-language code runner")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute source files in a sandboxed runtime
    Run {
        /// Source files; the first is the entry point
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,

        /// Language name or alias
        #[arg(short, long)]
        language: String,

        /// Version constraint (defaults to the highest installed)
        #[arg(short = 'r', long, default_value = "*")]
        runtime_version: String,

        /// File whose contents are fed to stdin
        #[arg(short, long)]
        stdin: Option<PathBuf>,

        /// Arguments passed to the program
        #[arg(last = true)]
        args: Vec<String>,

        /// Run wall-clock limit in milliseconds
        #[arg(long)]
        run_timeout: Option<i64>,

        /// Run memory limit in bytes
        #[arg(long)]
        run_memory_limit: Option<i64>,
    },

    /// List installed runtimes
    Runtimes,

    /// Manage language packages
    Packages {
        #[command(subcommand)]
        command: PackageCommands,
    },
}

#[derive(Subcommand)]
enum PackageCommands {
    /// List packages in the configured index
    List,

    /// Install a package
    Install {
        language: String,
        #[arg(default_value = "*")]
        version: String,
    },

    /// Uninstall a package
    Uninstall {
        language: String,
        version: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match cli.config {
        Some(ref path) => {
            info!(?path, "loading configuration");
            Config::from_file(path).context("failed to load configuration")?
        }
        None => {
            debug!("using environment configuration");
            Config::from_env().context("failed to load configuration")?
        }
    };

    let engine = Engine::new(config).await.context("failed to start engine")?;

    match cli.command {
        Commands::Run {
            files,
            language,
            runtime_version,
            stdin,
            args,
            run_timeout,
            run_memory_limit,
        } => {
            let mut sources = Vec::with_capacity(files.len());
            for path in &files {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                sources.push(SourceFile::new(name, content));
            }

            let stdin = match stdin {
                Some(ref path) => std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => String::new(),
            };

            let request = JobRequest {
                language,
                version: runtime_version,
                files: sources,
                args,
                stdin,
                run_timeout,
                run_memory_limit,
                ..Default::default()
            };

            let result = engine.submit(request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);

            // Propagate the program's exit code where there is one.
            let code = result.run.as_ref().and_then(|run| run.code).unwrap_or(1);
            engine.shutdown(Duration::from_secs(1)).await;
            std::process::exit(code);
        }

        Commands::Runtimes => {
            let runtimes = engine.runtimes().await;
            println!("{}", serde_json::to_string_pretty(&runtimes)?);
        }

        Commands::Packages { command } => match command {
            PackageCommands::List => {
                let packages = engine.packages().await?;
                println!("{}", serde_json::to_string_pretty(&packages)?);
            }
            PackageCommands::Install { language, version } => {
                let (language, version) = engine.install_package(&language, &version).await?;
                println!("installed {language}-{version}");
            }
            PackageCommands::Uninstall { language, version } => {
                engine.uninstall_package(&language, &version).await?;
                println!("uninstalled {language}-{version}");
            }
        },
    }

    Ok(())
}
