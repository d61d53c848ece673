//! Periodic update check
//!
//! Each tick resolves both versions, publishes the snapshot, notifies about a
//! newer build and installs it inline when auto-update is on. A failed
//! resolution leaves every piece of shared state untouched.

use crate::notify::messages;
use crate::pipeline::UpdatePipeline;
use crate::resolver::VersionResolver;
use crate::version::Version;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Version resolution failed
    Skipped,
    UpToDate,
    /// Newer build announced, auto-update off
    UpdateAvailable(String),
    Installed(String),
    InstallFailed(String),
}

pub struct Scheduler {
    pipeline: Arc<UpdatePipeline>,
    interval: Duration,
    auto_update: bool,
}

impl Scheduler {
    pub fn new(pipeline: Arc<UpdatePipeline>, interval: Duration, auto_update: bool) -> Self {
        Self {
            pipeline,
            interval,
            auto_update,
        }
    }

    pub async fn tick(&self) -> TickOutcome {
        let installed = match self.pipeline.resolver.installed().await {
            Ok(v) => v,
            Err(e) => {
                warn!("Could not read installed OS version: {}", e);
                return TickOutcome::Skipped;
            }
        };
        let latest = match self.pipeline.resolver.latest().await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Could not fetch latest version: {}", e);
                return TickOutcome::Skipped;
            }
        };

        info!("Installed: {}, latest: {}", installed, latest.version);
        self.pipeline.record(installed.clone(), &latest).await;

        if VersionResolver::compare(&latest.version, &installed) != Ordering::Greater {
            info!("System is up to date");
            return TickOutcome::UpToDate;
        }

        self.announce(&installed, &latest.version).await;
        if !self.auto_update {
            return TickOutcome::UpdateAvailable(latest.version.to_string());
        }

        info!("Auto-update enabled, installing {}", latest.version);
        match self.pipeline.install(&latest.version).await {
            Ok(()) => TickOutcome::Installed(latest.version.to_string()),
            Err(_) => TickOutcome::InstallFailed(latest.version.to_string()),
        }
    }

    async fn announce(&self, installed: &Version, latest: &Version) {
        info!("Update available: {} -> {}", installed, latest);
        self.pipeline
            .notifier
            .notify(
                messages::TITLE_AVAILABLE,
                &messages::update_available(installed, latest, self.auto_update),
            )
            .await;
    }

    /// Tick forever, sleeping the configured interval between checks
    pub async fn run(&self) {
        info!("Update checks every {}s", self.interval.as_secs());
        loop {
            self.tick().await;
            tokio::time::sleep(self.interval).await;
        }
    }
}
