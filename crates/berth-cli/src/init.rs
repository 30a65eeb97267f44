// ABOUTME: Writes the default berth configuration file.
// ABOUTME: Leaves an existing config untouched and reports where it lives.

use anyhow::{Context, Result};
use berth_core::Config;

pub fn run_init() -> Result<()> {
    let existed = Config::config_path().exists();
    let path = Config::init().context("Failed to initialize config")?;

    if existed {
        println!("Config already exists at {}", path.display());
    } else {
        println!("Wrote default config to {}", path.display());
        println!("Edit [spawn_server] to point at your spawn server script.");
    }
    Ok(())
}
