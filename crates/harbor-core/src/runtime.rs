//! Process-wide services
//!
//! The registry, defender, transfer manager and certificate manager are
//! owned here and handed by reference to every protocol front end. Nothing
//! is global, so tests build as many isolated runtimes as they need.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::certs::CertManager;
use crate::config::Config;
use crate::defender::Defender;
use crate::metrics::Metrics;
use crate::quota::QuotaTracker;
use crate::registry::Registry;
use crate::transfer::Transfers;
use crate::vfs::Resolver;
use crate::Result;

/// Shared connection and transfer runtime
pub struct Runtime {
    config: Config,
    metrics: Metrics,
    resolver: Resolver,
    defender: Arc<Defender>,
    registry: Arc<Registry>,
    transfers: Arc<Transfers>,
    certs: Arc<CertManager>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Build every service from a validated configuration
    ///
    /// Loads certificates, revocation lists and defender overrides; any
    /// failure aborts startup.
    ///
    /// # Errors
    ///
    /// `Error::Config` for invalid settings, `Error::Certificate` for TLS
    /// material that does not load
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let metrics = Metrics::new();
        let defender = Arc::new(Defender::with_metrics(
            config.defender.clone(),
            metrics.clone(),
        ));
        if let Some(path) = &config.defender.overrides_file {
            defender.load_overrides(path)?;
        }

        let registry = Arc::new(
            Registry::new(config.connections.clone(), Arc::clone(&defender))
                .with_metrics(metrics.clone())
                .with_transfer_timeout(config.transfers.timeout()),
        );
        let transfers = Arc::new(
            Transfers::new(Arc::new(QuotaTracker::new()), &config.transfers)
                .with_metrics(metrics.clone()),
        );
        let certs = Arc::new(CertManager::from_config(&config.tls)?);

        Ok(Self {
            config,
            metrics,
            resolver: Resolver::new(),
            defender,
            registry,
            transfers,
            certs,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Start background tasks; calling it again is a no-op
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        if self.config.connections.idle_timeout().is_none()
            && self.config.transfers.timeout().is_none()
        {
            info!("Idle eviction and transfer timeouts disabled, no sweeper started");
            return;
        }
        *sweeper = Some(self.registry.spawn_idle_sweeper(self.shutdown.clone()));
        info!(
            idle_timeout_secs = self.config.connections.idle_timeout_secs,
            interval_secs = self.config.connections.idle_check_interval_secs,
            "Runtime started"
        );
    }

    /// Stop background tasks and drain every connection
    ///
    /// Returns the number of connections drained.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Idle sweeper ended abnormally");
            }
        }
        self.registry.shutdown().await
    }

    /// Re-read certificates and revocation lists
    ///
    /// # Errors
    ///
    /// The first load error; the running generation stays in force
    pub fn reload_certificates(&self) -> Result<()> {
        self.certs.reload()
    }

    /// Configuration the runtime was built from
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Shared metrics
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Virtual path resolver
    pub const fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Host scoring table
    pub const fn defender(&self) -> &Arc<Defender> {
        &self.defender
    }

    /// Connection registry
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Transfer manager
    pub const fn transfers(&self) -> &Arc<Transfers> {
        &self.transfers
    }

    /// Certificate manager
    pub const fn certs(&self) -> &Arc<CertManager> {
        &self.certs
    }
}
