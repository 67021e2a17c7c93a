//! Heartbeat telemetry: record shape, emitter, and delivery transports.
//!
//! The emitter is driven by the supervisor's operational loop. Delivery is
//! fire-and-forget: failures and timeouts are logged and never surface to the
//! lifecycle state machine.

pub mod transport;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::NodeConfiguration;

/// Status label carried by a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Node is serving vault executions.
    Active,
    /// Kill switch fired; node is locked.
    Compromised,
    /// Operator stopped the node.
    Inactive,
}

impl NodeStatus {
    /// Wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Compromised => "COMPROMISED",
            Self::Inactive => "INACTIVE",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One liveness record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    /// Node identifier.
    pub node: String,
    /// Lifecycle-derived status.
    pub status: NodeStatus,
    /// Anomalies counted so far.
    pub anomaly_count: u32,
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
}

/// Delivery mechanism for heartbeat records.
#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    /// Short description of the destination, for logs.
    fn describe(&self) -> String;

    /// Deliver one record.
    async fn send(&self, record: &HeartbeatRecord) -> anyhow::Result<()>;
}

/// Formats and dispatches heartbeats on a fixed cadence.
pub struct TelemetryEmitter {
    transport: Box<dyn HeartbeatTransport>,
    interval: Duration,
    timeout: Duration,
}

impl TelemetryEmitter {
    /// Create an emitter around an explicit transport.
    ///
    /// # Errors
    ///
    /// Returns an error if `interval` is zero.
    pub fn new(
        transport: Box<dyn HeartbeatTransport>,
        interval: Duration,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!interval.is_zero(), "heartbeat interval must be non-zero");
        Ok(Self {
            transport,
            interval,
            timeout,
        })
    }

    /// Create an emitter for the configured target and cadence.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &NodeConfiguration) -> anyhow::Result<Self> {
        let transport =
            transport::for_target(config.heartbeat_target(), config.heartbeat_timeout())?;
        Self::new(
            transport,
            config.heartbeat_interval(),
            config.heartbeat_timeout(),
        )
    }

    /// Period between heartbeats.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Hand one record to the transport. Returns whether delivery succeeded.
    pub async fn emit(&self, record: &HeartbeatRecord) -> bool {
        let target = self.transport.describe();
        info!(
            destination = %target,
            status = %record.status,
            anomalies = record.anomaly_count,
            "HEARTBEAT -> sending telemetry"
        );

        match tokio::time::timeout(self.timeout, self.transport.send(record)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(destination = %target, error = %e, "heartbeat delivery failed");
                false
            }
            Err(_) => {
                warn!(
                    destination = %target,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "heartbeat delivery timed out"
                );
                false
            }
        }
    }
}
