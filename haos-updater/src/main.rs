use anyhow::{bail, Context, Result};
use haos_updater::cache::{BundleCache, CacheSettings, PathMapping};
use haos_updater::channel::{broker, mqtt::MqttBus, CommandChannel};
use haos_updater::config::RuntimeConfig;
use haos_updater::hub::HubClient;
use haos_updater::install::InstallExecutor;
use haos_updater::notify::NotificationSink;
use haos_updater::pipeline::UpdatePipeline;
use haos_updater::resolver::VersionResolver;
use haos_updater::scheduler::Scheduler;
use haos_updater::slot::pending_install_slot;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;

const MQTT_CLIENT_ID: &str = "umdu-haos-updater";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = RuntimeConfig::load().await;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(if config.debug {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        })
        .init();

    info!("UMDU HAOS Updater v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Model: {}, auto_update: {}, notifications: {}, check_interval: {}s",
        config.device_model, config.auto_update, config.notifications, config.check_interval
    );

    if config.hub.token.is_none() {
        bail!("SUPERVISOR_TOKEN is not set, the Supervisor API is unreachable");
    }
    let hub = HubClient::new(&config.hub).context("Failed to build Supervisor client")?;
    hub.ping()
        .await
        .context("Supervisor API is not reachable")?;

    let (slot_writer, slot_reader) = pending_install_slot();
    let mapping = PathMapping::new(config.agent_root.clone(), config.host_root.clone());

    let resolver = VersionResolver::new(
        hub.clone(),
        config.manifest_url.clone(),
        config.device_model.clone(),
        slot_writer,
    )
    .context("Failed to build manifest client")?;

    let cache = BundleCache::new(CacheSettings {
        dir: config.cache_dir.clone(),
        model: config.device_model.clone(),
        release_base_url: config.release_base_url.clone(),
        attempts: config.download_attempts,
        backoff: config.download_backoff(),
        mapping: mapping.clone(),
    })
    .context("Failed to build download client")?;

    let executor = InstallExecutor::rauc(mapping);
    let notifier = NotificationSink::new(hub.clone(), config.notifications);

    let mut inbound = None;
    let channel = if config.mqtt.enabled {
        match broker::resolve(&config.mqtt, &hub).await {
            Some(resolved) => {
                let (bus, rx) = MqttBus::connect(&resolved, MQTT_CLIENT_ID);
                inbound = Some(rx);
                CommandChannel::new(Arc::new(bus))
            }
            None => {
                warn!("MQTT enabled but no broker found, running without update entity");
                CommandChannel::disabled()
            }
        }
    } else {
        info!("MQTT disabled by configuration");
        CommandChannel::disabled()
    };

    let pipeline = Arc::new(UpdatePipeline::new(
        resolver,
        cache,
        executor,
        notifier,
        channel.clone(),
        hub,
        config.reboot_delay(),
    ));

    if let Some(rx) = inbound {
        match channel.announce().await {
            Ok(()) => {
                tokio::spawn(channel.listen(rx, slot_reader, pipeline.clone()));
            }
            Err(e) => warn!("MQTT update entity not announced: {}", e),
        }
    }

    Scheduler::new(pipeline, config.poll_interval(), config.auto_update)
        .run()
        .await;

    Ok(())
}
