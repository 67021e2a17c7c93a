//! Node lifecycle and the anomaly kill switch.
//!
//! [`NodeSupervisor`] owns the vault core handle and the validated
//! configuration inside its `Active` state. Every vault failure is counted;
//! when the count reaches the configured threshold the node locks: the
//! handle and configuration are dropped and the triggering call returns
//! [`NodeError::Lockout`]. Only the binary entry point turns that into a
//! process exit.
//!
//! All state lives behind one async mutex that is held across the vault
//! call, so the read-increment-compare of the anomaly count and the lock
//! transition form a single critical section.

use chrono::{SecondsFormat, Utc};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, NodeConfiguration};
use crate::credentials::{CoreSecrets, CredentialError};
use crate::telemetry::{HeartbeatRecord, NodeStatus, TelemetryEmitter};
use crate::vault::{VaultCore, VaultError, VaultInit, VaultOutput, VaultProvider};

/// Node version reported in the online message.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process exit codes used by the `nebula` binary.
pub mod exit_code {
    /// Operator shutdown or successful one-shot command.
    pub const SHUTDOWN: u8 = 0;
    /// Unexpected runtime failure outside the error taxonomy.
    pub const FAILURE: u8 = 1;
    /// Vault core could not be initialized (`EX_UNAVAILABLE`).
    pub const INITIALIZATION: u8 = 69;
    /// Configuration missing or invalid (`EX_CONFIG`).
    pub const CONFIGURATION: u8 = 78;
    /// Kill switch fired after too many anomalies.
    pub const LOCKOUT: u8 = 86;
}

/// Fatal node errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Configuration missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    /// Secrets policy refused the resolved credentials.
    #[error("credential error: {0}")]
    Credentials(#[from] CredentialError),
    /// Vault core initialization failed.
    #[error("vault core initialization failed: {0}")]
    Initialization(#[source] VaultError),
    /// Anomaly threshold reached; the node is locked.
    #[error("node {node_id} locked after {anomalies}/{threshold} anomalies")]
    Lockout {
        /// Node identifier.
        node_id: String,
        /// Anomalies counted when the lock fired.
        anomalies: u32,
        /// Configured threshold.
        threshold: u32,
    },
}

impl NodeError {
    /// Exit code the binary reports for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) => exit_code::CONFIGURATION,
            Self::Credentials(_) | Self::Initialization(_) => exit_code::INITIALIZATION,
            Self::Lockout { .. } => exit_code::LOCKOUT,
        }
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Before construction completes. Never observable on a built supervisor.
    Uninitialized,
    /// Serving vault executions.
    Active,
    /// Kill switch fired. Terminal.
    Locked,
    /// Stopped by the operator. Terminal.
    Inactive,
}

/// Result of one `execute_vault` call as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// The vault core transformed the payload.
    Success(VaultOutput),
    /// No payload: the node is not active, the input was empty, or the core
    /// failed.
    Unavailable,
}

impl ExecuteOutcome {
    /// Wire status label.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Success(_) => "SUCCESS",
            Self::Unavailable => "UNAVAILABLE",
        }
    }
}

/// One queued execution request from an ingress.
#[derive(Debug)]
pub struct VaultRequest {
    /// Payload to transform.
    pub data: Vec<u8>,
    /// Recipient public key.
    pub public_key: Vec<u8>,
    /// Where the outcome is delivered.
    pub reply: oneshot::Sender<ExecuteOutcome>,
}

/// Summary returned by [`NodeSupervisor::run`] after an operator stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Heartbeats emitted during the run.
    pub heartbeats: u64,
    /// Anomaly count at shutdown.
    pub anomaly_count: u32,
}

struct ActiveNode {
    // Held so credential-adjacent material lives exactly as long as the handle.
    _config: NodeConfiguration,
    vault: Box<dyn VaultCore>,
}

enum NodeState {
    Active(ActiveNode),
    Locked,
    Inactive,
}

impl NodeState {
    fn lifecycle(&self) -> LifecycleState {
        match self {
            Self::Active(_) => LifecycleState::Active,
            Self::Locked => LifecycleState::Locked,
            Self::Inactive => LifecycleState::Inactive,
        }
    }

    fn status(&self) -> NodeStatus {
        match self {
            Self::Active(_) => NodeStatus::Active,
            Self::Locked => NodeStatus::Compromised,
            Self::Inactive => NodeStatus::Inactive,
        }
    }
}

struct Inner {
    state: NodeState,
    anomaly_count: u32,
}

/// Supervisor guarding one vault core handle.
pub struct NodeSupervisor {
    node_id: String,
    threshold: u32,
    inner: Mutex<Inner>,
}

impl NodeSupervisor {
    /// Initialize the vault core and bring the node online.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Initialization`] if the provider rejects the
    /// identity material or secrets. No supervisor is created in that case.
    pub fn start(
        config: NodeConfiguration,
        secrets: &CoreSecrets,
        provider: &dyn VaultProvider,
    ) -> Result<Self, NodeError> {
        let init = VaultInit {
            hw_info: config.hw_id().to_owned(),
            seed: secrets.root_seed().clone(),
            license_signature: secrets.license_signature().clone(),
            audit_log_path: config.audit_log_path().to_owned(),
        };
        let vault = provider.initialize(init).map_err(|e| {
            error!(node_id = %config.node_id(), error = %e, "FATAL: vault core initialization failed");
            NodeError::Initialization(e)
        })?;

        let node_id = config.node_id().to_owned();
        let threshold = config.max_anomaly_score();
        info!(node_id = %node_id, version = VERSION, threshold, "node online");

        Ok(Self {
            node_id,
            threshold,
            inner: Mutex::new(Inner {
                state: NodeState::Active(ActiveNode {
                    _config: config,
                    vault,
                }),
                anomaly_count: 0,
            }),
        })
    }

    /// Node identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Anomaly count at which the kill switch fires.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Current lifecycle state.
    pub async fn lifecycle_state(&self) -> LifecycleState {
        self.inner.lock().await.state.lifecycle()
    }

    /// Anomalies counted so far.
    pub async fn anomaly_count(&self) -> u32 {
        self.inner.lock().await.anomaly_count
    }

    /// Whether the vault core handle is still held.
    pub async fn holds_vault_handle(&self) -> bool {
        matches!(self.inner.lock().await.state, NodeState::Active(_))
    }

    /// Snapshot the node as a heartbeat record.
    pub async fn heartbeat(&self) -> HeartbeatRecord {
        let inner = self.inner.lock().await;
        HeartbeatRecord {
            node: self.node_id.clone(),
            status: inner.state.status(),
            anomaly_count: inner.anomaly_count,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Forward one payload to the vault core.
    ///
    /// Vault failures never reach the caller: they are counted and reported
    /// as [`ExecuteOutcome::Unavailable`]. Empty inputs and calls on a node
    /// that is not active are unavailable without touching the count.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Lockout`] exactly once, from the call whose
    /// failure brings the count to the threshold. The node is already locked
    /// when the error is returned.
    pub async fn execute_vault(
        &self,
        data: &[u8],
        public_key: &[u8],
    ) -> Result<ExecuteOutcome, NodeError> {
        if data.is_empty() || public_key.is_empty() {
            warn!(
                data_len = data.len(),
                public_key_len = public_key.len(),
                "rejecting vault request with empty input"
            );
            return Ok(ExecuteOutcome::Unavailable);
        }

        let mut inner = self.inner.lock().await;
        let NodeState::Active(active) = &inner.state else {
            debug!(state = ?inner.state.lifecycle(), "vault request while node inactive");
            return Ok(ExecuteOutcome::Unavailable);
        };

        let result = active.vault.vault_execute(data, public_key).await;
        match result {
            Ok(output) => {
                info!(audit_ref = %short_ref(&output.audit_ref), "vault success");
                Ok(ExecuteOutcome::Success(output))
            }
            Err(e) => {
                inner.anomaly_count = inner.anomaly_count.saturating_add(1);
                warn!(
                    anomalies = inner.anomaly_count,
                    threshold = self.threshold,
                    error = %e,
                    "anomaly {}/{}",
                    inner.anomaly_count,
                    self.threshold
                );
                if inner.anomaly_count >= self.threshold {
                    return Err(self.kill_switch(&mut inner));
                }
                Ok(ExecuteOutcome::Unavailable)
            }
        }
    }

    /// Irreversibly lock the node: drop the vault handle and configuration.
    fn kill_switch(&self, inner: &mut Inner) -> NodeError {
        error!(
            node_id = %self.node_id,
            anomalies = inner.anomaly_count,
            threshold = self.threshold,
            "EMERGENCY: max anomalies reached, locking node"
        );
        let released = std::mem::replace(&mut inner.state, NodeState::Locked);
        drop(released);
        info!("vault core handle released, configuration discarded");

        NodeError::Lockout {
            node_id: self.node_id.clone(),
            anomalies: inner.anomaly_count,
            threshold: self.threshold,
        }
    }

    /// Stop an active node on operator request. A locked node stays locked.
    pub async fn deactivate(&self) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, NodeState::Active(_)) {
            inner.state = NodeState::Inactive;
        }
    }

    /// Run the operational loop.
    ///
    /// Emits a heartbeat immediately and then every emitter interval, serves
    /// queued requests in between, and stops when `shutdown` flips to `true`
    /// or its sender is dropped. A closed request channel only stops ingress.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Lockout`] when the kill switch fires. One final
    /// `COMPROMISED` heartbeat is emitted before returning.
    pub async fn run(
        &self,
        emitter: &TelemetryEmitter,
        mut requests: mpsc::Receiver<VaultRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ShutdownReport, NodeError> {
        let mut ticker = tokio::time::interval(emitter.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeats: u64 = 0;
        let mut ingress_open = true;

        info!(
            interval_secs = emitter.interval().as_secs(),
            "entering continuous operational mode"
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("system shutdown signal received");
                        self.deactivate().await;
                        let anomaly_count = self.anomaly_count().await;
                        return Ok(ShutdownReport { heartbeats, anomaly_count });
                    }
                }

                _ = ticker.tick() => {
                    let record = self.heartbeat().await;
                    emitter.emit(&record).await;
                    heartbeats = heartbeats.saturating_add(1);
                }

                request = requests.recv(), if ingress_open => {
                    let Some(request) = request else {
                        debug!("request ingress closed");
                        ingress_open = false;
                        continue;
                    };
                    match self.execute_vault(&request.data, &request.public_key).await {
                        Ok(outcome) => {
                            let _ = request.reply.send(outcome);
                        }
                        Err(err) => {
                            let _ = request.reply.send(ExecuteOutcome::Unavailable);
                            let record = self.heartbeat().await;
                            emitter.emit(&record).await;
                            return Err(err);
                        }
                    }
                }
            }
        }
    }
}

/// First 12 characters of an audit reference, for logs.
fn short_ref(audit_ref: &str) -> &str {
    audit_ref
        .char_indices()
        .nth(12)
        .map_or(audit_ref, |(idx, _)| &audit_ref[..idx])
}
