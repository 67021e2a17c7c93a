//! Heartbeat transports: HTTP, file, and log-only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use super::{HeartbeatRecord, HeartbeatTransport};
use crate::config::HeartbeatTarget;

/// Build the transport for a configured target.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built.
pub fn for_target(
    target: &HeartbeatTarget,
    timeout: Duration,
) -> anyhow::Result<Box<dyn HeartbeatTransport>> {
    Ok(match target {
        HeartbeatTarget::Http(url) => Box::new(HttpTransport::new(url.clone(), timeout)?),
        HeartbeatTarget::File(path) => Box::new(FileTransport::new(path.clone())),
        HeartbeatTarget::Log => Box::new(LogTransport),
    })
}

/// Posts each record as JSON.
pub struct HttpTransport {
    client: reqwest::Client,
    url: url::Url,
}

impl HttpTransport {
    /// Create a transport posting to `url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: url::Url, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nebula/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build heartbeat HTTP client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl HeartbeatTransport for HttpTransport {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    async fn send(&self, record: &HeartbeatRecord) -> anyhow::Result<()> {
        self.client
            .post(self.url.clone())
            .json(record)
            .send()
            .await
            .context("heartbeat request failed")?
            .error_for_status()
            .context("heartbeat endpoint rejected record")?;
        Ok(())
    }
}

/// Keeps the latest record in a local JSON file.
pub struct FileTransport {
    path: PathBuf,
}

impl FileTransport {
    /// Create a transport writing to `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl HeartbeatTransport for FileTransport {
    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }

    async fn send(&self, record: &HeartbeatRecord) -> anyhow::Result<()> {
        write_heartbeat_file(record, &self.path).await
    }
}

/// Log-only delivery; the emitter already logs every record.
pub struct LogTransport;

#[async_trait]
impl HeartbeatTransport for LogTransport {
    fn describe(&self) -> String {
        "log".to_owned()
    }

    async fn send(&self, _record: &HeartbeatRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Write a heartbeat record to disk atomically.
///
/// Writes to a temporary file first, then renames to the final path.
/// This ensures readers always see a complete file.
///
/// # Errors
///
/// Returns an error if serialization or file operations fail.
pub async fn write_heartbeat_file(record: &HeartbeatRecord, path: &Path) -> anyhow::Result<()> {
    let json =
        serde_json::to_string_pretty(record).context("failed to serialize heartbeat record")?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .context("failed to write heartbeat temp file")?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .context("failed to rename heartbeat temp file")?;

    debug!(path = %path.display(), "heartbeat file updated");
    Ok(())
}
