use anyhow::{Result, bail};
use harbor_core::Config;
use std::path::Path;

use crate::config;

pub async fn run(config_path: &Path, force: bool) -> Result<()> {
    if !force && tokio::fs::try_exists(config_path).await.unwrap_or(false) {
        bail!(
            "{} already exists, pass --force to overwrite it",
            config_path.display()
        );
    }

    config::save_config(config_path, &Config::default()).await?;
    println!("Configuration file created at: {}", config_path.display());
    println!("\nPlease review and edit the configuration before starting the server.");
    Ok(())
}
