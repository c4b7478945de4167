use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use harbor_core::defender::{HostOverride, read_overrides, write_overrides};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::{config, logging};

async fn overrides_path(config_path: &Path) -> Result<PathBuf> {
    let config = config::load_config(config_path).await?;
    config.defender.overrides_file.with_context(|| {
        format!(
            "defender.overrides_file is not set in {}",
            config_path.display()
        )
    })
}

/// Unbans are applied once; they are kept this long so a pending reload
/// still sees them.
const UNBAN_RETENTION_DAYS: i64 = 7;

/// Drop expired bans, old unbans and any entry for `host`.
fn without_host(overrides: Vec<HostOverride>, host: IpAddr) -> Vec<HostOverride> {
    let now = Utc::now();
    let unban_cutoff = now - Duration::days(UNBAN_RETENTION_DAYS);
    overrides
        .into_iter()
        .filter(|o| o.host != host)
        .filter(|o| match o.banned_until {
            Some(until) => until > now,
            None => o.issued_at > unban_cutoff,
        })
        .collect()
}

pub async fn ban(config_path: &Path, host: IpAddr, minutes: u32) -> Result<()> {
    logging::init_cli();
    let path = overrides_path(config_path).await?;

    let until = Utc::now() + Duration::minutes(i64::from(minutes));
    let mut overrides = without_host(read_overrides(&path)?, host);
    overrides.push(HostOverride {
        host,
        banned_until: Some(until),
        issued_at: Utc::now(),
    });
    write_overrides(&path, &overrides)?;

    println!(
        "{} banned until {}, applied at the next start or SIGHUP",
        host,
        until.to_rfc3339()
    );
    Ok(())
}

pub async fn unban(config_path: &Path, host: IpAddr) -> Result<()> {
    logging::init_cli();
    let path = overrides_path(config_path).await?;

    let mut overrides = without_host(read_overrides(&path)?, host);
    overrides.push(HostOverride {
        host,
        banned_until: None,
        issued_at: Utc::now(),
    });
    write_overrides(&path, &overrides)?;

    println!("{} unbanned, applied at the next start or SIGHUP", host);
    Ok(())
}
