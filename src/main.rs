//! forge-relay - code generation relay with sandboxed runs and snippet sharing.
//!
//! Usage:
//!   forge-relay serve [--port 9000]       # Start HTTP server
//!   forge-relay run <file>                # Run one file with the server's limits

#[cfg(not(unix))]
compile_error!("forge-relay needs a Unix host to signal child processes.");

mod config;
mod error;
mod http_server;
mod inference;
mod relay;
mod sandbox;
mod share;
mod state;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::exit;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "forge-relay")]
#[command(about = "Code generation relay with sandboxed runs and snippet sharing")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[command(flatten)]
        config: config::Config,
    },
    /// Run a source file through the sandboxed executor
    Run {
        /// Source file to execute
        file: PathBuf,

        #[command(flatten)]
        executor: config::ExecutorConfig,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve { mut config } => {
            config.executor.resolve_interpreter_args();
            if config.inference.api_key.is_empty() {
                tracing::warn!("HUGGINGFACE_API_KEY is not set; /chat will fail upstream");
            }
            let state = state::AppState::new(config);
            if let Err(e) = http_server::run_server(state).await {
                error!(error = %e, "Server stopped");
                exit(1);
            }
        }
        Commands::Run { file, mut executor } => {
            executor.resolve_interpreter_args();
            let source = match tokio::fs::read_to_string(&file).await {
                Ok(source) => source,
                Err(e) => {
                    eprintln!("Error: read {}: {}", file.display(), e);
                    exit(1);
                }
            };
            match sandbox::run_source(&executor, &source).await {
                Ok(result) => {
                    print!("{}", result.stdout);
                    eprint!("{}", result.stderr);
                    if result.termination != sandbox::Termination::Exited {
                        eprintln!("Error: {:?}", result.termination);
                    }
                    exit(result.exit_code.unwrap_or(1));
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
    }
}
