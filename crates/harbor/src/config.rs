use anyhow::{Context, Result};
use harbor_core::Config;
use std::path::Path;
use tokio::fs;

pub async fn load_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

    let config = Config::from_toml(&contents).context("Failed to parse configuration file")?;
    config.validate().context("Invalid configuration")?;

    Ok(config)
}

pub async fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let contents = config
        .to_toml()
        .context("Failed to serialize configuration")?;

    fs::write(path, contents)
        .await
        .context("Failed to write configuration file")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("harbor.toml");

        let mut config = Config::default();
        config.connections.max_connections = 42;
        save_config(&path, &config).await.unwrap();

        let loaded = load_config(&path).await.unwrap();
        assert_eq!(loaded.connections.max_connections, 42);
    }

    #[tokio::test]
    async fn test_missing_file_names_path() {
        let err = load_config(Path::new("/nonexistent/harbor.toml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/harbor.toml"));
    }
}
