//! Shared update context
//!
//! Owns every pipeline component plus the shared status snapshot. The
//! scheduler installs through `install`, the command listener through
//! `install_version`, which also enforces the upgrade-only policy against the
//! recorded installed version. One fetch + install runs at a time.

use crate::cache::BundleCache;
use crate::channel::{CommandChannel, InstallHandler, UpdateState};
use crate::error::PipelineError;
use crate::hub::HubClient;
use crate::install::InstallExecutor;
use crate::notify::{messages, NotificationSink};
use crate::resolver::{ManifestEntry, VersionResolver};
use crate::version::Version;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Mutex as FlowLock;
use tracing::{error, info, warn};

pub struct UpdatePipeline {
    pub resolver: VersionResolver,
    pub cache: BundleCache,
    pub executor: InstallExecutor,
    pub notifier: NotificationSink,
    pub channel: CommandChannel,
    hub: HubClient,
    reboot_delay: Duration,
    state: Mutex<Option<UpdateState>>,
    latest_entry: Mutex<Option<ManifestEntry>>,
    /// Version installed by this process, pending the reboot
    staged: Mutex<Option<Version>>,
    flow: FlowLock<()>,
}

impl UpdatePipeline {
    pub fn new(
        resolver: VersionResolver,
        cache: BundleCache,
        executor: InstallExecutor,
        notifier: NotificationSink,
        channel: CommandChannel,
        hub: HubClient,
        reboot_delay: Duration,
    ) -> Self {
        Self {
            resolver,
            cache,
            executor,
            notifier,
            channel,
            hub,
            reboot_delay,
            state: Mutex::new(None),
            latest_entry: Mutex::new(None),
            staged: Mutex::new(None),
            flow: FlowLock::new(()),
        }
    }

    pub fn state(&self) -> Option<UpdateState> {
        self.state.lock().clone()
    }

    /// Record the latest resolution and publish it on the bus
    pub async fn record(&self, installed: Version, latest: &ManifestEntry) {
        let snapshot = UpdateState {
            installed_version: installed,
            latest_version: latest.version.clone(),
        };
        *self.state.lock() = Some(snapshot.clone());
        *self.latest_entry.lock() = Some(latest.clone());
        self.channel.publish_state(&snapshot).await;
    }

    fn known_sha256(&self, version: &Version) -> Option<String> {
        self.latest_entry
            .lock()
            .as_ref()
            .filter(|entry| &entry.version == version)
            .and_then(|entry| entry.sha256.clone())
    }

    pub fn staged(&self) -> Option<Version> {
        self.staged.lock().clone()
    }

    /// Fetch and install `version`; reboot only when the install succeeded
    pub async fn install(&self, version: &Version) -> Result<(), PipelineError> {
        let _flow = self.flow.lock().await;

        // a flow that waited on the lock may find its work already done
        if let Some(staged) = self.staged() {
            if !version.is_newer_than(&staged) {
                info!("Version {} already installed, reboot pending", staged);
                return Err(PipelineError::AlreadyStaged(staged.to_string()));
            }
        }

        let sha256 = self.known_sha256(version);

        let bundle = match self.cache.fetch(version, sha256.as_deref()).await {
            Ok(path) => path,
            Err(e) => {
                error!("Download of {} failed: {}", version, e);
                self.notifier
                    .notify(messages::TITLE_FAILED, &messages::download_failed(version, &e.to_string()))
                    .await;
                return Err(e.into());
            }
        };

        self.cache.ensure_host_root().await;

        if let Err(e) = self.executor.install(&bundle).await {
            error!("Install of {} failed: {}", version, e);
            self.notifier
                .notify(messages::TITLE_FAILED, &messages::install_failed(version, &e.to_string()))
                .await;
            return Err(e.into());
        }

        info!("Version {} installed", version);
        *self.staged.lock() = Some(version.clone());
        self.channel.deactivate_entity().await;
        self.notifier
            .notify(messages::TITLE_INSTALLED, &messages::installed(version))
            .await;
        self.request_reboot().await;
        Ok(())
    }

    /// Give notifications time to land, then ask the hub to reboot
    async fn request_reboot(&self) {
        tokio::time::sleep(self.reboot_delay).await;
        match self.hub.reboot().await {
            Ok(()) => info!("Host reboot requested"),
            Err(e) => warn!("Reboot request failed: {}", e),
        }
    }
}

#[async_trait]
impl InstallHandler for UpdatePipeline {
    async fn install_version(&self, version: Version) -> Result<(), PipelineError> {
        let installed = self
            .state()
            .map(|state| state.installed_version)
            .ok_or(PipelineError::UnknownInstalled)?;

        if !version.is_newer_than(&installed) {
            error!(
                "Refusing install of {}: not newer than installed {}",
                version, installed
            );
            return Err(PipelineError::NotNewer {
                target: version.to_string(),
                installed: installed.to_string(),
            });
        }

        self.install(&version).await
    }
}
