use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod demux;
mod runner;
mod sandbox;
mod server;
mod stats;
mod technology;

use config::{Overrides, RuntimeKind};

const DEFAULT_SERVER: &str = "http://127.0.0.1:50051";

#[derive(Parser)]
#[command(name = "codecell")]
#[command(
    author,
    version,
    about = "Run untrusted code in hardened, resource-limited sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text", env = "CODECELL_LOG_FORMAT")]
    log_format: LogFormat,

    /// Path to codecell.toml
    #[arg(long, global = true, env = "CODECELL_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the execution server
    Serve {
        /// Listen address
        #[arg(long, env = "CODECELL_ADDR")]
        addr: Option<String>,

        /// Container runtime: docker or gvisor
        #[arg(long, env = "CODECELL_RUNTIME")]
        runtime: Option<RuntimeKind>,

        /// Memory limit per sandbox (e.g. 512m, 1g)
        #[arg(long, env = "CODECELL_MEMORY_LIMIT")]
        memory_limit: Option<String>,

        /// CPU limit per sandbox (e.g. 1, 0.5)
        #[arg(long, env = "CODECELL_CPU_LIMIT")]
        cpu_limit: Option<String>,

        /// Apply a disk quota to each sandbox (needs overlay2 on xfs with pquota)
        #[arg(
            long,
            env = "CODECELL_ENABLE_STORAGE_OPT",
            num_args = 0..=1,
            default_missing_value = "true"
        )]
        enable_storage_opt: Option<bool>,
    },

    /// Run a source file on a server and stream its output
    Run {
        /// Source file to run
        file: PathBuf,

        /// Language key (see `codecell languages`)
        #[arg(short, long)]
        language: String,

        /// Timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// Line to send on stdin (repeatable, sent in order)
        #[arg(short, long = "input")]
        input: Vec<String>,

        /// Show resource statistics
        #[arg(long)]
        stats: bool,

        /// Server URL
        #[arg(long, env = "CODECELL_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Stop a running execution
    Stop {
        /// Request id printed by `codecell run`
        request_id: String,

        /// Kill immediately instead of cancelling
        #[arg(short, long)]
        force: bool,

        /// Server URL
        #[arg(long, env = "CODECELL_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// List supported languages
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Serve {
            addr,
            runtime,
            memory_limit,
            cpu_limit,
            enable_storage_opt,
        } => {
            let overrides = Overrides {
                addr,
                runtime,
                memory_limit,
                cpu_limit,
                enable_storage_opt,
            };
            commands::serve::run(config_path, overrides).await?;
        }
        Commands::Run {
            file,
            language,
            timeout,
            input,
            stats,
            server,
        } => {
            let options = commands::client::RunOptions {
                server,
                language,
                timeout,
                stdin: input,
                show_stats: stats,
            };
            let code = commands::client::run(&file, options).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Stop {
            request_id,
            force,
            server,
        } => {
            commands::client::stop(&server, &request_id, force).await?;
        }
        Commands::Languages => {
            commands::languages::run(config_path).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr so `run` output stays clean on stdout.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose {
        "codecell=debug"
    } else {
        "codecell=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}
