//! Bundle installation
//!
//! Handles:
//! - Ordered install strategies (RAUC CLI first, D-Bus call as fallback)
//! - Best-effort backend diagnostics after a failed attempt
//! - Serialized execution: at most one install runs at a time
//! - Removal of the consumed bundle after success

pub mod rauc;

use crate::cache::PathMapping;
use crate::error::InstallError;
use async_trait::async_trait;
use std::path::Path;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub use rauc::{RaucCli, RaucDbus, RaucStatus};

/// One way of handing a bundle to the backend
#[async_trait]
pub trait InstallStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Install the bundle at the backend-visible `bundle` path
    async fn attempt(&self, bundle: &Path) -> Result<(), String>;
}

/// Backend status surface queried after a failure
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn status(&self) -> Result<String, String>;
}

pub struct InstallExecutor {
    strategies: Vec<Box<dyn InstallStrategy>>,
    probe: Option<Box<dyn StatusProbe>>,
    mapping: PathMapping,
    lock: Mutex<()>,
}

impl InstallExecutor {
    pub fn new(mapping: PathMapping) -> Self {
        Self {
            strategies: Vec::new(),
            probe: None,
            mapping,
            lock: Mutex::new(()),
        }
    }

    /// Default backend chain: `rauc install`, then the RAUC D-Bus installer
    pub fn rauc(mapping: PathMapping) -> Self {
        Self::new(mapping)
            .with_strategy(RaucCli::default())
            .with_strategy(RaucDbus::default())
            .with_probe(RaucStatus::default())
    }

    pub fn with_strategy(mut self, strategy: impl InstallStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn with_probe(mut self, probe: impl StatusProbe + 'static) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    /// Install the bundle at `path` (agent view). Concurrent callers wait for
    /// the running install to finish.
    pub async fn install(&self, path: &Path) -> Result<(), InstallError> {
        let _guard = self.lock.lock().await;

        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(InstallError::NotFound(path.to_path_buf()));
        }

        let host_path = self.mapping.to_host(path);
        info!("Installing bundle: {}", host_path.display());

        let mut failures = Vec::new();
        for strategy in &self.strategies {
            let started = Instant::now();
            match strategy.attempt(&host_path).await {
                Ok(()) => {
                    info!(
                        "Install via {} succeeded in {}s",
                        strategy.name(),
                        started.elapsed().as_secs()
                    );
                    if let Err(e) = tokio::fs::remove_file(path).await {
                        warn!("Failed to remove installed bundle {}: {}", path.display(), e);
                    }
                    return Ok(());
                }
                Err(e) => {
                    error!("Install via {} failed: {}", strategy.name(), e);
                    failures.push(format!("{}: {}", strategy.name(), e));
                    self.log_diagnostics().await;
                }
            }
        }

        if failures.is_empty() {
            failures.push("no install strategy configured".to_string());
        }
        Err(InstallError::AllStrategiesFailed(failures))
    }

    async fn log_diagnostics(&self) {
        let Some(probe) = &self.probe else {
            return;
        };
        match probe.status().await {
            Ok(status) => warn!("Backend status: {}", status.trim()),
            Err(e) => warn!("Backend status unavailable: {}", e),
        }
    }
}
