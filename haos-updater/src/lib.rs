//! UMDU HAOS Updater - unattended OS update agent for the UMDU K1 board
//!
//! This agent keeps Home Assistant OS current:
//! - Resolves the installed and the latest published OS version
//! - Downloads and caches the RAUC bundle for a newer version
//! - Installs it through RAUC and reboots the host
//! - Publishes an MQTT update entity and accepts remote install commands

pub mod cache;
pub mod channel;
pub mod config;
#[cfg(any(test, feature = "devkit"))]
pub mod devkit;
pub mod error;
pub mod hub;
pub mod install;
pub mod notify;
pub mod pipeline;
pub mod resolver;
pub mod scheduler;
pub mod slot;
pub mod version;
