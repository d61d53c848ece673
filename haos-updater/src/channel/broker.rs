//! Broker connection parameters
//!
//! Sources, in precedence order: explicit config, environment, hub services
//! API, hub legacy add-on API. Config and environment are merged field by
//! field, later disagreement only produces a warning. The hub is consulted
//! only when neither names a host, and a hub answer is used as a whole so its
//! credentials never travel to a broker it did not name.

use crate::config::MqttConfig;
use crate::hub::HubClient;
use tracing::{debug, info, warn};

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Partial broker info as reported by one source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerInfo {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBroker {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
}

impl BrokerInfo {
    pub fn from_config(config: &MqttConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.valid_port(),
            username: config.username.clone(),
            password: config.password.clone(),
            tls: config.tls,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            host: lookup("MQTT_HOST"),
            port: lookup("MQTT_PORT").and_then(|p| p.trim().parse().ok()),
            username: lookup("MQTT_USER"),
            password: lookup("MQTT_PASSWORD"),
            tls: lookup("MQTT_TLS").map(|v| matches!(v.trim(), "1" | "true" | "yes")),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Pick the first value in source order, warning about later disagreement
fn pick<T, F>(sources: &[(&str, BrokerInfo)], field: &str, secret: bool, get: F) -> Option<T>
where
    T: PartialEq + std::fmt::Debug,
    F: Fn(&BrokerInfo) -> Option<T>,
{
    let mut chosen: Option<(&str, T)> = None;
    for (name, info) in sources {
        let Some(value) = get(info) else { continue };
        if let Some((winner, current)) = &chosen {
            if *current != value {
                if secret {
                    warn!("MQTT {} from {} differs from {}, keeping {}", field, name, winner, winner);
                } else {
                    warn!(
                        "MQTT {} from {} ({:?}) differs from {} ({:?}), keeping {}",
                        field, name, value, winner, current, winner
                    );
                }
            }
            continue;
        }
        chosen = Some((*name, value));
    }
    chosen.map(|(_, value)| value)
}

/// Merge sources field by field; `None` when no source names a host
pub fn merge(sources: &[(&str, BrokerInfo)]) -> Option<ResolvedBroker> {
    let host = pick(sources, "host", false, |i| non_empty(&i.host).map(str::to_string))?;
    let tls = pick(sources, "tls", false, |i| i.tls).unwrap_or(false);
    let port = pick(sources, "port", false, |i| i.port.filter(|p| *p != 0))
        .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });
    let username = pick(sources, "username", false, |i| non_empty(&i.username).map(str::to_string));
    let password = pick(sources, "password", true, |i| non_empty(&i.password).map(str::to_string));

    Some(ResolvedBroker {
        host,
        port,
        username,
        password,
        tls,
    })
}

/// Broker named by local sources, otherwise by the hub
pub async fn resolve(config: &MqttConfig, hub: &HubClient) -> Option<ResolvedBroker> {
    resolve_with(BrokerInfo::from_config(config), BrokerInfo::from_env(), hub).await
}

pub async fn resolve_with(
    config: BrokerInfo,
    env: BrokerInfo,
    hub: &HubClient,
) -> Option<ResolvedBroker> {
    if let Some(local) = merge(&[("config", config), ("environment", env)]) {
        debug!("MQTT broker {} configured locally, skipping hub lookup", local.host);
        return Some(local);
    }

    match hub.mqtt_service().await {
        Ok(Some(info)) => {
            if let Some(broker) = merge(&[("services API", info)]) {
                info!("MQTT broker {} from services API", broker.host);
                return Some(broker);
            }
        }
        Ok(None) => debug!("Services API reports no MQTT service"),
        Err(e) => debug!("MQTT info via services API unavailable: {}", e),
    }

    match hub.mosquitto_addon().await {
        Ok(Some(info)) => {
            let broker = merge(&[("add-on API", info)]);
            if let Some(broker) = &broker {
                info!("MQTT broker {} from add-on API", broker.host);
            }
            broker
        }
        Ok(None) => None,
        Err(e) => {
            debug!("MQTT info via add-on API unavailable: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn info(host: Option<&str>, port: Option<u16>, user: Option<&str>) -> BrokerInfo {
        BrokerInfo {
            host: host.map(str::to_string),
            port,
            username: user.map(str::to_string),
            password: None,
            tls: None,
        }
    }

    #[test]
    fn test_no_host_anywhere() {
        let sources = [
            ("config", BrokerInfo::default()),
            ("environment", info(Some("  "), Some(1884), None)),
        ];
        assert!(merge(&sources).is_none());
    }

    #[test]
    fn test_first_non_empty_wins_per_field() {
        let sources = [
            ("config", info(None, None, Some("cfg-user"))),
            ("environment", info(Some("env-host"), None, None)),
            ("services API", info(Some("hub-host"), Some(1884), Some("hub-user"))),
        ];
        let broker = merge(&sources).unwrap();
        assert_eq!(broker.host, "env-host");
        assert_eq!(broker.port, 1884);
        assert_eq!(broker.username.as_deref(), Some("cfg-user"));
        assert!(!broker.tls);
    }

    #[test]
    fn test_default_ports() {
        let plain = [("config", info(Some("h"), None, None))];
        assert_eq!(merge(&plain).unwrap().port, DEFAULT_PORT);

        let mut tls = info(Some("h"), None, None);
        tls.tls = Some(true);
        assert_eq!(merge(&[("services API", tls)]).unwrap().port, DEFAULT_TLS_PORT);
    }

    fn hub_for(server: &MockServer) -> HubClient {
        HubClient::new(&HubConfig {
            base_url: server.uri(),
            token: Some("tkn".to_string()),
        })
        .unwrap()
    }

    async fn mount_services(server: &MockServer, expected: u64) {
        Mock::given(method("GET"))
            .and(path("/services/mqtt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": "ok",
                "data": {
                    "host": "core-mosquitto",
                    "port": 1884,
                    "username": "addons",
                    "password": "hub-secret",
                    "ssl": false
                }
            })))
            .expect(expected)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_local_host_never_receives_hub_credentials() {
        let server = MockServer::start().await;
        mount_services(&server, 0).await;
        Mock::given(method("GET"))
            .and(path("/addons/core_mosquitto/info"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let config = info(Some("broker.example.net"), None, None);
        let broker = resolve_with(config, BrokerInfo::default(), &hub_for(&server))
            .await
            .unwrap();

        assert_eq!(broker.host, "broker.example.net");
        assert_eq!(broker.port, DEFAULT_PORT);
        assert!(broker.username.is_none());
        assert!(broker.password.is_none());
    }

    #[tokio::test]
    async fn test_hub_answer_used_as_a_whole() {
        let server = MockServer::start().await;
        mount_services(&server, 1).await;

        // local credentials without a host do not mix with the hub's
        let config = info(None, Some(9999), Some("local-user"));
        let broker = resolve_with(config, BrokerInfo::default(), &hub_for(&server))
            .await
            .unwrap();

        assert_eq!(broker.host, "core-mosquitto");
        assert_eq!(broker.port, 1884);
        assert_eq!(broker.username.as_deref(), Some("addons"));
        assert_eq!(broker.password.as_deref(), Some("hub-secret"));
    }

    #[tokio::test]
    async fn test_legacy_api_when_services_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/mqtt"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/addons/core_mosquitto/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": "ok",
                "data": {"hostname": "core-mosquitto", "network": {"1883/tcp": 1883}}
            })))
            .mount(&server)
            .await;

        let broker = resolve_with(BrokerInfo::default(), BrokerInfo::default(), &hub_for(&server))
            .await
            .unwrap();
        assert_eq!(broker.host, "core-mosquitto");
        assert!(broker.username.is_none());
    }

    #[test]
    fn test_env_lookup() {
        let env = BrokerInfo::from_lookup(|key| match key {
            "MQTT_HOST" => Some("broker".to_string()),
            "MQTT_PORT" => Some("not-a-port".to_string()),
            "MQTT_TLS" => Some("true".to_string()),
            _ => None,
        });
        assert_eq!(env.host.as_deref(), Some("broker"));
        assert_eq!(env.port, None);
        assert_eq!(env.tls, Some(true));
    }
}
