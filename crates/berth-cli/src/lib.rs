// ABOUTME: berth CLI library: config bootstrap, spawn, reload, and one-shot request commands.
// ABOUTME: Each command starts a supervisor from config and tears it down before returning.

pub mod init;

pub use berth_core::Config;
pub use init::run_init;

use anyhow::{bail, Context, Result};
use berth_core::{HeaderBlock, SpawnSupervisor, SpawnedWorker};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Size of each body chunk streamed to the worker.
const BODY_CHUNK: usize = 64 * 1024;

/// Options for `berth spawn`
pub struct SpawnCommandOptions {
    /// Path to configuration file
    pub config_path: Option<PathBuf>,
    /// Application root to spawn
    pub app_root: String,
    /// Keep the worker until Ctrl-C
    pub hold: bool,
}

/// Options for `berth request`
pub struct RequestOptions {
    /// Path to configuration file
    pub config_path: Option<PathBuf>,
    /// Application root to spawn
    pub app_root: String,
    /// Request headers as `NAME=VALUE`
    pub headers: Vec<String>,
    /// File streamed as the request body
    pub body_file: Option<PathBuf>,
}

/// Where logs go and how much of them, chosen from the global flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSetup {
    Stderr { verbose: bool },
    File { path: PathBuf, verbose: bool },
}

/// Crate whose records are kept at INFO when `--verbose` is not given.
const LOG_CRATE: &str = "berth_core";

impl LogSetup {
    /// `--log-to-file` falls back to stderr when there is no config directory.
    pub fn from_flags(log_to_file: bool, verbose: bool, log_path: Option<PathBuf>) -> Self {
        match log_path.filter(|_| log_to_file) {
            Some(path) => LogSetup::File { path, verbose },
            None => LogSetup::Stderr { verbose },
        }
    }

    pub fn init(&self) {
        match self {
            LogSetup::Stderr { verbose: true } => berth_log::init(),
            LogSetup::Stderr { verbose: false } => berth_log::init_for(LOG_CRATE),
            LogSetup::File { path, verbose: true } => berth_log::init_file(path),
            LogSetup::File { path, verbose: false } => berth_log::init_file_for(path, LOG_CRATE),
        }
    }
}

/// Load config from an explicit path, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Config::load().context("Failed to load config"),
    }
}

/// A token that fires on Ctrl-C.
pub fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

/// Split a `NAME=VALUE` argument.
pub fn parse_header_arg(arg: &str) -> Result<(&str, &str)> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name, value)),
        _ => bail!("Invalid header '{arg}', expected NAME=VALUE"),
    }
}

/// Build the header block for `berth request` from `NAME=VALUE` arguments.
pub fn build_headers(args: &[String]) -> Result<HeaderBlock> {
    let mut block = HeaderBlock::new();
    for arg in args {
        let (name, value) = parse_header_arg(arg)?;
        block
            .push(name, value)
            .with_context(|| format!("Invalid header '{arg}'"))?;
    }
    Ok(block)
}

async fn start_supervisor(config: &Config) -> Result<SpawnSupervisor> {
    SpawnSupervisor::start(config.spawn_server.clone())
        .await
        .context("Failed to start the spawn server")
}

async fn stop_supervisor(supervisor: &SpawnSupervisor) {
    // Use a fresh token so an earlier Ctrl-C does not skip the bounded stop.
    if let Err(e) = supervisor.shutdown(&CancellationToken::new()).await {
        tracing::warn!(error = %e, "Spawn server shutdown did not complete");
    }
}

fn describe(worker: &SpawnedWorker) -> String {
    format!(
        "pid={} address={} kind={}",
        worker.pid(),
        worker.address(),
        worker.kind()
    )
}

/// Spawn one worker and print its identity.
pub async fn run_spawn(options: SpawnCommandOptions) -> Result<()> {
    let config = load_config(options.config_path.as_deref())?;
    let cancel = ctrl_c_token();
    let supervisor = start_supervisor(&config).await?;

    let spawn_options = config.defaults.for_app(&options.app_root);
    let result = supervisor.spawn(&spawn_options, &cancel).await;
    let outcome: Result<()> = match result {
        Ok(worker) => {
            println!("{}", describe(&worker));
            if options.hold {
                tracing::info!(app_root = %options.app_root, "Holding worker until Ctrl-C");
                cancel.cancelled().await;
            }
            Ok(())
        }
        Err(e) => {
            if let Some(page) = e.error_page() {
                eprintln!("{page}");
            }
            Err(e).with_context(|| format!("Failed to spawn {}", options.app_root))
        }
    };

    stop_supervisor(&supervisor).await;
    outcome
}

/// Ask the spawn server to drop cached code for an application.
pub async fn run_reload(config_path: Option<PathBuf>, app_root: &str) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    let cancel = ctrl_c_token();
    let supervisor = start_supervisor(&config).await?;

    let outcome = supervisor
        .reload(app_root, &cancel)
        .await
        .with_context(|| format!("Failed to reload {app_root}"));
    if outcome.is_ok() {
        println!("Reloaded {app_root}");
    }

    stop_supervisor(&supervisor).await;
    outcome
}

/// Spawn a worker, send one request through a session, and copy the response to stdout.
pub async fn run_request(options: RequestOptions) -> Result<()> {
    let config = load_config(options.config_path.as_deref())?;
    let headers = build_headers(&options.headers)?;
    let cancel = ctrl_c_token();
    let supervisor = start_supervisor(&config).await?;

    let outcome = request_once(&supervisor, &config, &options, headers, &cancel).await;

    stop_supervisor(&supervisor).await;
    outcome
}

async fn request_once(
    supervisor: &SpawnSupervisor,
    config: &Config,
    options: &RequestOptions,
    headers: HeaderBlock,
    cancel: &CancellationToken,
) -> Result<()> {
    let worker = supervisor
        .spawn(&config.defaults.for_app(&options.app_root), cancel)
        .await
        .with_context(|| format!("Failed to spawn {}", options.app_root))?;
    tracing::info!(worker = %describe(&worker), "Worker ready");

    let mut session = worker
        .connect(|| tracing::debug!("Request session finished"), cancel)
        .await
        .context("Failed to connect to the worker")?;
    session.set_reader_timeout(config.session.reader_timeout_ms);
    session.set_writer_timeout(config.session.writer_timeout_ms);

    session
        .send_headers(headers.as_bytes())
        .await
        .context("Failed to send headers")?;

    if let Some(path) = &options.body_file {
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut buf = vec![0u8; BODY_CHUNK];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if n == 0 {
                break;
            }
            session
                .send_body_block(&buf[..n])
                .await
                .context("Failed to send request body")?;
        }
    }
    session.shutdown_writer().context("Failed to half-close the session")?;

    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; BODY_CHUNK];
    loop {
        let n = session
            .read(&mut buf)
            .await
            .context("Failed to read the response")?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n]).await?;
    }
    stdout.flush().await?;

    session.close_stream().context("Failed to close the session")?;
    Ok(())
}
