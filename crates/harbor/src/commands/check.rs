use anyhow::{Context, Result};
use harbor_core::CertManager;
use harbor_core::defender::read_overrides;
use std::path::Path;

use crate::{config, logging};

pub async fn run(config_path: &Path) -> Result<()> {
    logging::init_cli();

    let config = config::load_config(config_path).await?;
    let certs = CertManager::from_config(&config.tls).context("Failed to load TLS material")?;

    println!("Configuration {} is valid", config_path.display());

    for pair in certs.key_pairs() {
        let expires = pair
            .not_after()
            .map_or_else(|| "unknown".to_string(), |at| at.to_rfc3339());
        println!(
            "  key pair {:<12} names [{}] sha256 {} expires {}",
            pair.id(),
            pair.names().join(", "),
            pair.fingerprint(),
            expires
        );
    }

    for crl in certs.revocation_lists() {
        println!(
            "  revocation list {} issued by {}: {} revoked{}",
            crl.source().display(),
            crl.issuer(),
            crl.len(),
            if crl.is_stale() { " (stale)" } else { "" }
        );
    }

    if let Some(path) = &config.defender.overrides_file {
        let overrides = read_overrides(path)?;
        println!(
            "  defender overrides {}: {} entries",
            path.display(),
            overrides.len()
        );
    }

    Ok(())
}
