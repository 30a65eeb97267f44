// ABOUTME: Shared logging setup for the berth CLI and embedding servers
// ABOUTME: init()/init_file() log everything at INFO, init_for()/init_file_for() filter to one crate

use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Standard logging to stderr. Default: INFO level, RUST_LOG override.
pub fn init() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

/// Default location of the log file for `app_name`: ~/.config/berth/{app_name}.log
pub fn default_log_path(app_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("berth").join(format!("{app_name}.log")))
}

/// Append-mode file logging. Default: INFO level, RUST_LOG override, no ANSI colors.
///
/// The spawn server writes its own stderr into the same kind of file, so the
/// supervisor's records interleave with the helper's output when both point at
/// one path. If setup fails, prints a warning to stderr and continues without logging.
pub fn init_file(path: &Path) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if let Err(e) = init_file_inner(path, filter) {
        eprintln!("Warning: failed to set up file logging at {}: {e}", path.display());
    }
}

/// Append-mode file logging with the [`init_for`] filter.
pub fn init_file_for(path: &Path, crate_name: &str) {
    if let Err(e) = init_file_inner(path, crate_filter(crate_name)) {
        eprintln!("Warning: failed to set up file logging at {}: {e}", path.display());
    }
}

fn init_file_inner(path: &Path, filter: EnvFilter) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(filter)
        .with_ansi(false)
        .init();

    Ok(())
}

/// Crate-filtered logging to stderr. Default: INFO for the named crate, WARN for everything else.
pub fn init_for(crate_name: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(crate_filter(crate_name))
        .init();
}

fn crate_filter(crate_name: &str) -> EnvFilter {
    let directive = format!("{crate_name}=info");
    EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into())
        .add_directive(
            directive
                .parse()
                .unwrap_or_else(|_| tracing::Level::INFO.into()),
        )
}
