//! RAUC backends
//!
//! - `RaucCli`: `rauc install <bundle>`, output streamed into the log
//! - `RaucDbus`: `InstallBundle` on the RAUC D-Bus installer via `busctl`,
//!   then wait for the installer to go idle and check `LastError`
//! - `RaucStatus`: `rauc status` for diagnostics

use super::{InstallStrategy, StatusProbe};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

const RAUC_SERVICE: &str = "de.pengutronix.rauc";
const RAUC_INSTALLER: &str = "de.pengutronix.rauc.Installer";

pub struct RaucCli {
    binary: String,
}

impl Default for RaucCli {
    fn default() -> Self {
        Self::with_binary("rauc")
    }
}

impl RaucCli {
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, bundle: &Path) -> Result<()> {
        let mut child = AsyncCommand::new(&self.binary)
            .arg("install")
            .arg(bundle)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.binary))?;

        let stdout = child.stdout.take().map(|out| tokio::spawn(log_lines(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(log_lines(err)));

        let status = child
            .wait()
            .await
            .context("Failed to wait for rauc install")?;

        for reader in [stdout, stderr].into_iter().flatten() {
            let _ = reader.await;
        }

        if status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "rauc install exited with code {}",
                status.code().unwrap_or(-1)
            ))
        }
    }
}

async fn log_lines<R: AsyncRead + Unpin>(reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            info!("RAUC: {}", line);
        }
    }
}

#[async_trait]
impl InstallStrategy for RaucCli {
    fn name(&self) -> &str {
        "rauc-cli"
    }

    async fn attempt(&self, bundle: &Path) -> Result<(), String> {
        self.run(bundle).await.map_err(|e| format!("{:#}", e))
    }
}

pub struct RaucDbus {
    busctl: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for RaucDbus {
    fn default() -> Self {
        Self {
            busctl: "busctl".to_string(),
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(3600),
        }
    }
}

impl RaucDbus {
    pub fn with_busctl(busctl: impl Into<String>) -> Self {
        Self {
            busctl: busctl.into(),
            ..Self::default()
        }
    }

    pub fn with_polling(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    async fn busctl(&self, args: &[&str]) -> Result<String> {
        let output = AsyncCommand::new(&self.busctl)
            .arg("--system")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.busctl))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(anyhow!(
                "{} {} failed: {}",
                self.busctl,
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }

    async fn property(&self, name: &str) -> Result<String> {
        let raw = self
            .busctl(&["get-property", RAUC_SERVICE, "/", RAUC_INSTALLER, name])
            .await?;
        Ok(parse_string_property(&raw))
    }

    async fn run(&self, bundle: &Path) -> Result<()> {
        let bundle = bundle.to_string_lossy().into_owned();
        self.busctl(&[
            "call",
            RAUC_SERVICE,
            "/",
            RAUC_INSTALLER,
            "InstallBundle",
            "sa{sv}",
            bundle.as_str(),
            "0",
        ])
        .await?;
        debug!("InstallBundle accepted, waiting for RAUC to finish");

        let started = Instant::now();
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let operation = self.property("Operation").await?;
            if operation == "idle" {
                break;
            }
            if started.elapsed() > self.timeout {
                return Err(anyhow!("RAUC still '{}' after {:?}", operation, self.timeout));
            }
        }

        let last_error = self.property("LastError").await?;
        if last_error.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("RAUC reported: {}", last_error))
        }
    }
}

/// `busctl get-property` prints `s "value"`; return the unquoted value
fn parse_string_property(raw: &str) -> String {
    let value = raw.strip_prefix("s ").unwrap_or(raw).trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

#[async_trait]
impl InstallStrategy for RaucDbus {
    fn name(&self) -> &str {
        "rauc-dbus"
    }

    async fn attempt(&self, bundle: &Path) -> Result<(), String> {
        self.run(bundle).await.map_err(|e| format!("{:#}", e))
    }
}

pub struct RaucStatus {
    binary: String,
}

impl Default for RaucStatus {
    fn default() -> Self {
        Self {
            binary: "rauc".to_string(),
        }
    }
}

#[async_trait]
impl StatusProbe for RaucStatus {
    async fn status(&self) -> Result<String, String> {
        let output = tokio::time::timeout(
            Duration::from_secs(10),
            AsyncCommand::new(&self.binary)
                .args(["status", "--output-format=json"])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| "rauc status timed out".to_string())?
        .map_err(|e| format!("Failed to execute rauc status: {}", e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string_property() {
        assert_eq!(parse_string_property("s \"idle\""), "idle");
        assert_eq!(parse_string_property("s \"\""), "");
        assert_eq!(parse_string_property("idle"), "idle");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_exit_codes() {
        let bundle = Path::new("/tmp/does-not-matter.raucb");

        assert!(RaucCli::with_binary("true").attempt(bundle).await.is_ok());

        let err = RaucCli::with_binary("false").attempt(bundle).await.unwrap_err();
        assert!(err.contains("exited with code 1"));
    }

    #[tokio::test]
    async fn test_cli_missing_binary() {
        let err = RaucCli::with_binary("rauc-binary-that-does-not-exist")
            .attempt(Path::new("/tmp/x.raucb"))
            .await
            .unwrap_err();
        assert!(err.contains("Failed to start"));
    }

    #[tokio::test]
    async fn test_dbus_missing_busctl() {
        let strategy = RaucDbus::with_busctl("busctl-that-does-not-exist")
            .with_polling(Duration::from_millis(1), Duration::from_millis(10));
        assert!(strategy.attempt(Path::new("/tmp/x.raucb")).await.is_err());
    }
}
