//! Error taxonomy for the update pipeline
//!
//! Each stage of the pipeline fails with its own error type so the caller can
//! apply the right policy (skip the tick, abort the install, disable the bus).

use std::path::PathBuf;
use thiserror::Error;

/// Hub (Supervisor API) unreachable, unauthorized or missing data
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("hub request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("hub returned HTTP {status} for {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("hub response for {endpoint} has no {field} field")]
    MissingField { endpoint: String, field: &'static str },

    #[error("hub reported an invalid version: {0}")]
    InvalidVersion(#[from] VersionError),
}

/// Remote manifest unreachable, malformed or missing the model key
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("manifest returned HTTP {0}")]
    Status(u16),

    #[error("manifest has no entry for model {0}")]
    MissingKey(String),

    #[error("manifest entry for model {model} is malformed")]
    Malformed { model: String },

    #[error("manifest version is invalid: {0}")]
    InvalidVersion(#[from] VersionError),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download of {url} failed after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: String,
    },

    #[error("cache directory {path} unavailable: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("bundle not found: {0}")]
    NotFound(PathBuf),

    #[error("all install strategies failed: {}", .0.join("; "))]
    AllStrategiesFailed(Vec<String>),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no available version is known yet")]
    NoPendingVersion,

    #[error("message bus is disabled")]
    Disabled,

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("install of {version} not performed: {source}")]
    Install {
        version: String,
        #[source]
        source: PipelineError,
    },
}

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("empty version string")]
    Empty,

    #[error("invalid version segment {segment:?} in {raw:?}")]
    InvalidSegment { raw: String, segment: String },
}

/// Failure of the combined fetch + install flow
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("installed version is not known yet")]
    UnknownInstalled,

    #[error("version {target} is not newer than installed {installed}")]
    NotNewer { target: String, installed: String },

    #[error("version {0} is already installed and waiting for reboot")]
    AlreadyStaged(String),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Install(#[from] InstallError),
}
