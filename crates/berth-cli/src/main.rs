// ABOUTME: berth CLI entry point.
// ABOUTME: Provides init, spawn, reload, and request subcommands.

use berth_cli::{
    run_init, run_reload, run_request, run_spawn, LogSetup, RequestOptions, SpawnCommandOptions,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "berth")]
#[command(about = "Spawn-server supervisor and worker session tool")]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,

    /// Write logs to ~/.config/berth/berth.log instead of stderr
    #[arg(long, global = true)]
    log_to_file: bool,

    /// Log everything at INFO, not just berth-core (applies to --log-to-file too)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Spawn a worker and print its pid and address
    Spawn {
        /// Application root directory
        #[arg(long)]
        app_root: String,
        /// Keep the worker until Ctrl-C
        #[arg(long)]
        hold: bool,
    },
    /// Tell the spawn server to reload cached code for an application
    Reload {
        /// Application root directory
        #[arg(long)]
        app_root: String,
    },
    /// Spawn a worker and send it a single request
    Request {
        /// Application root directory
        #[arg(long)]
        app_root: String,
        /// Request header as NAME=VALUE (repeatable)
        #[arg(long = "header", short = 'H')]
        headers: Vec<String>,
        /// File to stream as the request body
        #[arg(long)]
        body_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    LogSetup::from_flags(cli.log_to_file, cli.verbose, berth_log::default_log_path("berth")).init();

    match cli.command {
        Commands::Init => run_init(),
        Commands::Spawn { app_root, hold } => {
            run_spawn(SpawnCommandOptions {
                config_path: cli.config,
                app_root,
                hold,
            })
            .await
        }
        Commands::Reload { app_root } => run_reload(cli.config, &app_root).await,
        Commands::Request {
            app_root,
            headers,
            body_file,
        } => {
            run_request(RequestOptions {
                config_path: cli.config,
                app_root,
                headers,
                body_file,
            })
            .await
        }
    }
}
