//! Supervisor API client
//!
//! Thin wrapper over the hub endpoints the agent needs: OS info, broker
//! discovery (two API generations), notifications and host reboot.

use crate::channel::broker::BrokerInfo;
use crate::config::HubConfig;
use crate::error::AccessError;
use crate::version::Version;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const HUB_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HubClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

/// Standard Supervisor envelope: `{"result": "ok", "data": {...}}`
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct OsInfo {
    version: Option<String>,
}

/// `/services/mqtt` payload
#[derive(Debug, Deserialize)]
struct MqttServiceInfo {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    ssl: Option<bool>,
}

/// `/addons/core_mosquitto/info` payload; no credentials in this generation
#[derive(Debug, Deserialize)]
struct AddonInfo {
    hostname: Option<String>,
    ip_address: Option<String>,
    network: Option<HashMap<String, Option<u16>>>,
}

#[derive(Debug, Serialize)]
pub struct NotificationPayload<'a> {
    pub title: &'a str,
    pub message: &'a str,
    pub notification_id: &'a str,
}

impl HubClient {
    pub fn new(config: &HubConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(HUB_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_data<T: DeserializeOwned>(&self, endpoint: &str) -> Result<Option<T>, AccessError> {
        let request_error = |source: reqwest::Error| AccessError::Request {
            endpoint: endpoint.to_string(),
            source,
        };

        let response = self
            .authorized(self.http.get(self.url(endpoint)))
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AccessError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let envelope: Envelope<T> = response.json().await.map_err(request_error)?;
        Ok(envelope.data)
    }

    async fn post_json<B: Serialize + ?Sized>(&self, endpoint: &str, body: &B) -> Result<(), AccessError> {
        let response = self
            .authorized(self.http.post(self.url(endpoint)))
            .json(body)
            .send()
            .await
            .map_err(|source| AccessError::Request {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AccessError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Startup reachability check
    pub async fn ping(&self) -> Result<(), AccessError> {
        let endpoint = "/supervisor/ping";
        let response = self
            .authorized(self.http.get(self.url(endpoint)))
            .send()
            .await
            .map_err(|source| AccessError::Request {
                endpoint: endpoint.to_string(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AccessError::Status {
                endpoint: endpoint.to_string(),
                status: response.status().as_u16(),
            })
        }
    }

    /// Currently installed OS version
    pub async fn os_version(&self) -> Result<Version, AccessError> {
        let endpoint = "/os/info";
        let info: Option<OsInfo> = self.get_data(endpoint).await?;
        let raw = info
            .and_then(|i| i.version)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AccessError::MissingField {
                endpoint: endpoint.to_string(),
                field: "version",
            })?;

        Ok(Version::parse(&raw)?)
    }

    /// Broker info from the services API
    pub async fn mqtt_service(&self) -> Result<Option<BrokerInfo>, AccessError> {
        let info: Option<MqttServiceInfo> = self.get_data("/services/mqtt").await?;
        Ok(info.map(|i| BrokerInfo {
            host: i.host,
            port: i.port,
            username: i.username,
            password: i.password,
            tls: i.ssl,
        }))
    }

    /// Broker info from the legacy add-on API
    pub async fn mosquitto_addon(&self) -> Result<Option<BrokerInfo>, AccessError> {
        let info: Option<AddonInfo> = self.get_data("/addons/core_mosquitto/info").await?;
        Ok(info.map(|i| {
            let port = i
                .network
                .as_ref()
                .and_then(|n| n.get("1883/tcp").copied().flatten());
            BrokerInfo {
                host: i.hostname.or(i.ip_address),
                port,
                username: None,
                password: None,
                tls: None,
            }
        }))
    }

    pub async fn create_notification(&self, payload: &NotificationPayload<'_>) -> Result<(), AccessError> {
        self.post_json("/core/api/services/persistent_notification/create", payload)
            .await
    }

    pub async fn reboot(&self) -> Result<(), AccessError> {
        debug!("Requesting host reboot");
        self.post_json("/host/reboot", &serde_json::json!({})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HubClient {
        HubClient::new(&HubConfig {
            base_url: server.uri(),
            token: Some("tkn".to_string()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_os_version_is_authenticated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/os/info"))
            .and(header("authorization", "Bearer tkn"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": "ok",
                "data": {"version": "15.2"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let version = client_for(&server).os_version().await.unwrap();
        assert_eq!(version.as_str(), "15.2");
    }

    #[tokio::test]
    async fn test_os_version_missing_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/os/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"version": null}
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).os_version().await.unwrap_err();
        assert!(matches!(err, AccessError::MissingField { field: "version", .. }));
    }

    #[tokio::test]
    async fn test_os_version_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/os/info"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client_for(&server).os_version().await.unwrap_err();
        assert!(matches!(err, AccessError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_broker_info_shapes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/mqtt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"host": "core-mosquitto", "port": 8883, "username": "addons",
                         "password": "secret", "ssl": true}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/addons/core_mosquitto/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"hostname": "core-mosquitto", "network": {"1883/tcp": 1883}}
            })))
            .mount(&server)
            .await;

        let hub = client_for(&server);
        let modern = hub.mqtt_service().await.unwrap().unwrap();
        assert_eq!(modern.port, Some(8883));
        assert_eq!(modern.tls, Some(true));
        assert_eq!(modern.password.as_deref(), Some("secret"));

        let legacy = hub.mosquitto_addon().await.unwrap().unwrap();
        assert_eq!(legacy.host.as_deref(), Some("core-mosquitto"));
        assert_eq!(legacy.port, Some(1883));
        assert!(legacy.username.is_none());
    }
}
