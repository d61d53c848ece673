//! Persistent notifications in Home Assistant
//!
//! Notifications are diagnostic: delivery failures are logged and dropped.

use crate::hub::{HubClient, NotificationPayload};
use crate::version::Version;
use tracing::{debug, info, warn};

/// Stable id so a new notification replaces the previous one
pub const NOTIFICATION_ID: &str = "umdu_haos_updater";

pub struct NotificationSink {
    hub: HubClient,
    enabled: bool,
}

impl NotificationSink {
    pub fn new(hub: HubClient, enabled: bool) -> Self {
        Self { hub, enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns true when the hub accepted the notification
    pub async fn notify(&self, title: &str, message: &str) -> bool {
        if !self.enabled {
            debug!("Notifications disabled: {} - {}", title, message);
            return false;
        }

        let payload = NotificationPayload {
            title,
            message,
            notification_id: NOTIFICATION_ID,
        };
        match self.hub.create_notification(&payload).await {
            Ok(()) => {
                info!("Notification sent: {}", title);
                true
            }
            Err(e) => {
                warn!("Failed to send notification: {}", e);
                false
            }
        }
    }
}

pub mod messages {
    use super::Version;

    pub const TITLE_AVAILABLE: &str = "UMDU HAOS Update Available";
    pub const TITLE_INSTALLED: &str = "UMDU HAOS Update Installed";
    pub const TITLE_FAILED: &str = "UMDU HAOS Update Failed";

    pub fn update_available(installed: &Version, latest: &Version, auto_update: bool) -> String {
        let next_step = if auto_update {
            "The update will be installed automatically."
        } else {
            "Install it from the update entity or enable auto_update."
        };
        format!(
            "Version {} is available (installed: {}).\n{}",
            latest, installed, next_step
        )
    }

    pub fn installed(version: &Version) -> String {
        format!(
            "Update to version {} installed successfully.\nThe system will reboot in a few seconds to apply it.",
            version
        )
    }

    pub fn install_failed(version: &Version, reason: &str) -> String {
        format!("Failed to install version {}: {}", version, reason)
    }

    pub fn download_failed(version: &Version, reason: &str) -> String {
        format!("Failed to download version {}: {}", version, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NOTIFY_PATH: &str = "/core/api/services/persistent_notification/create";

    fn hub_for(server: &MockServer) -> HubClient {
        HubClient::new(&HubConfig {
            base_url: server.uri(),
            token: Some("tkn".to_string()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_notify_posts_stable_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(NOTIFY_PATH))
            .and(body_json(json!({
                "title": "t",
                "message": "m",
                "notification_id": "umdu_haos_updater"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let sink = NotificationSink::new(hub_for(&server), true);
        assert!(sink.notify("t", "m").await);
        assert!(sink.notify("t", "m").await);
    }

    #[tokio::test]
    async fn test_disabled_sink_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let sink = NotificationSink::new(hub_for(&server), false);
        assert!(!sink.enabled());
        assert!(!sink.notify("t", "m").await);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(NOTIFY_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = NotificationSink::new(hub_for(&server), true);
        assert!(!sink.notify("t", "m").await);
    }

    #[test]
    fn test_messages_mention_versions() {
        let installed = Version::parse("10.2").unwrap();
        let latest = Version::parse("10.3").unwrap();
        let text = messages::update_available(&installed, &latest, false);
        assert!(text.contains("10.3") && text.contains("10.2"));
        assert!(messages::installed(&latest).contains("10.3"));
    }
}
