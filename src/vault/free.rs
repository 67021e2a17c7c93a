//! Free-tier vault core.
//!
//! Pass-through transformation with a burst limiter and an append-only JSON
//! audit trail. Audit references are derived from the inputs, so identical
//! requests produce identical references.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use super::{VaultCore, VaultError, VaultInit, VaultOutput, VaultProvider};

/// Maximum executions allowed inside one [`RATE_LIMIT_WINDOW`].
pub const MAX_BURST_REQUESTS: usize = 15;

/// Sliding window for the burst limiter.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(3);

/// Length of the placeholder post-quantum tag.
const PQC_TAG_LEN: usize = 16;

/// Prefix of every free-tier audit reference.
pub const AUDIT_REF_PREFIX: &str = "FREE-AUDIT-";

/// Provider for [`FreeVaultCore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeVaultProvider;

impl VaultProvider for FreeVaultProvider {
    fn initialize(&self, init: VaultInit) -> Result<Box<dyn VaultCore>, VaultError> {
        let core = FreeVaultCore::open(init)?;
        Ok(Box::new(core))
    }
}

#[derive(Serialize)]
struct AuditEntry<'a> {
    timestamp: String,
    audit_ref: &'a str,
    payload_len: usize,
    public_key_len: usize,
}

/// Sliding-window burst limiter.
#[derive(Debug)]
struct BurstLimiter {
    history: VecDeque<Instant>,
    max: usize,
    window: Duration,
}

impl BurstLimiter {
    fn new(max: usize, window: Duration) -> Self {
        Self {
            history: VecDeque::with_capacity(max),
            max,
            window,
        }
    }

    /// Record an attempt at `now`. Returns `false` when the burst is exhausted.
    fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.history.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
        if self.history.len() >= self.max {
            return false;
        }
        self.history.push_back(now);
        true
    }
}

/// Free-tier vault core handle.
pub struct FreeVaultCore {
    hw_info: String,
    audit_path: PathBuf,
    audit: Mutex<File>,
    limiter: Mutex<BurstLimiter>,
}

impl FreeVaultCore {
    /// Validate credentials and open the audit log for append.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidCredentials`] for empty identity, seed or
    /// license material and [`VaultError::AuditLog`] when the log cannot be
    /// opened.
    pub fn open(init: VaultInit) -> Result<Self, VaultError> {
        if init.hw_info.trim().is_empty() {
            return Err(VaultError::InvalidCredentials(
                "hardware identity is empty".to_owned(),
            ));
        }
        if init.seed.expose().is_empty() {
            return Err(VaultError::InvalidCredentials("root seed is empty".to_owned()));
        }
        if init.license_signature.expose().is_empty() {
            return Err(VaultError::InvalidCredentials(
                "license signature is empty".to_owned(),
            ));
        }

        let audit = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&init.audit_log_path)
            .map_err(|source| VaultError::AuditLog {
                path: init.audit_log_path.clone(),
                source,
            })?;

        debug!(audit_log = %init.audit_log_path.display(), "free vault core opened");

        Ok(Self {
            hw_info: init.hw_info,
            audit_path: init.audit_log_path,
            audit: Mutex::new(audit),
            limiter: Mutex::new(BurstLimiter::new(MAX_BURST_REQUESTS, RATE_LIMIT_WINDOW)),
        })
    }

    fn audit_ref(&self, data: &[u8], public_key: &[u8]) -> String {
        let mut hasher = Sha256::new();
        for part in [self.hw_info.as_bytes(), data, public_key] {
            let len = u64::try_from(part.len()).unwrap_or(u64::MAX);
            hasher.update(len.to_le_bytes());
            hasher.update(part);
        }
        let digest = hasher.finalize();
        format!("{AUDIT_REF_PREFIX}{}", hex::encode(&digest[..12]))
    }

    fn append_audit(&self, entry: &AuditEntry<'_>) -> Result<(), VaultError> {
        let audit_err = |source: std::io::Error| VaultError::AuditLog {
            path: self.audit_path.clone(),
            source,
        };
        let mut line = serde_json::to_vec(entry)
            .map_err(|e| VaultError::Execution(format!("failed to encode audit entry: {e}")))?;
        line.push(b'\n');

        let mut file = self
            .audit
            .lock()
            .map_err(|_| VaultError::Execution("audit log lock poisoned".to_owned()))?;
        file.write_all(&line).map_err(audit_err)?;
        file.flush().map_err(audit_err)
    }
}

#[async_trait]
impl VaultCore for FreeVaultCore {
    async fn vault_execute(
        &self,
        data: &[u8],
        public_key: &[u8],
    ) -> Result<VaultOutput, VaultError> {
        let admitted = self
            .limiter
            .lock()
            .map_err(|_| VaultError::Execution("rate limiter lock poisoned".to_owned()))?
            .try_acquire(Instant::now());
        if !admitted {
            return Err(VaultError::RateLimited);
        }

        let audit_ref = self.audit_ref(data, public_key);
        self.append_audit(&AuditEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            audit_ref: &audit_ref,
            payload_len: data.len(),
            public_key_len: public_key.len(),
        })?;

        Ok(VaultOutput {
            ciphertext: data.to_vec(),
            pqc_tag: vec![0_u8; PQC_TAG_LEN],
            audit_ref,
        })
    }
}
