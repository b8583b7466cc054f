//! State export command

use anyhow::{Context, Result};
use tracing::info;

use swing_trader::config::Config;
use swing_trader::state_store::create_state_store;

pub fn run(config_path: String) -> Result<()> {
    let config = Config::from_file(&config_path).context("Failed to load configuration")?;
    let store = create_state_store(&config.store.state_dir, false)?;

    store.export_json().context("Failed to export state")?;
    info!(
        "State exported to {}/swing_trader.json",
        config.store.state_dir
    );
    Ok(())
}
