//! Installed and published version resolution

use crate::error::{AccessError, ManifestError};
use crate::hub::HubClient;
use crate::slot::SlotWriter;
use crate::version::{self, Version};
use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering;
use std::time::Duration;
use tracing::debug;

const MANIFEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Latest published build for the configured model
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub version: Version,
    pub sha256: Option<String>,
}

pub struct VersionResolver {
    hub: HubClient,
    http: reqwest::Client,
    manifest_url: String,
    model: String,
    slot: SlotWriter,
}

impl VersionResolver {
    pub fn new(
        hub: HubClient,
        manifest_url: impl Into<String>,
        model: impl Into<String>,
        slot: SlotWriter,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(MANIFEST_TIMEOUT).build()?;
        Ok(Self {
            hub,
            http,
            manifest_url: manifest_url.into(),
            model: model.into(),
            slot,
        })
    }

    pub async fn installed(&self) -> Result<Version, AccessError> {
        self.hub.os_version().await
    }

    /// Fetch the manifest, bypassing intermediate caches, and record the
    /// result in the pending install slot.
    pub async fn latest(&self) -> Result<ManifestEntry, ManifestError> {
        let cache_buster = Utc::now().timestamp().to_string();
        let response = self
            .http
            .get(&self.manifest_url)
            .query(&[("t", cache_buster.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ManifestError::Status(status.as_u16()));
        }

        let document: Value = response.json().await?;
        let entry = parse_manifest(&document, &self.model)?;
        debug!("Manifest lists {} for {}", entry.version, self.model);

        self.slot.put(entry.version.clone());
        Ok(entry)
    }

    pub fn compare(a: &Version, b: &Version) -> Ordering {
        version::compare(a, b)
    }
}

/// Read `hassos.<model>`, either a bare version or `{version, sha256}`
pub fn parse_manifest(document: &Value, model: &str) -> Result<ManifestEntry, ManifestError> {
    let entry = document
        .get("hassos")
        .and_then(|h| h.get(model))
        .filter(|v| !v.is_null())
        .ok_or_else(|| ManifestError::MissingKey(model.to_string()))?;

    let malformed = || ManifestError::Malformed {
        model: model.to_string(),
    };

    let (raw_version, sha256) = match entry {
        Value::Object(fields) => {
            let version = fields
                .get("version")
                .and_then(scalar_to_string)
                .ok_or_else(malformed)?;
            let sha256 = fields
                .get("sha256")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase);
            (version, sha256)
        }
        other => (scalar_to_string(other).ok_or_else(malformed)?, None),
    };

    Ok(ManifestEntry {
        version: Version::parse(&raw_version)?,
        sha256,
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
