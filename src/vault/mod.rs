//! Boundary contract toward the sealed vault core.
//!
//! The supervisor only knows two capabilities: initializing a core from
//! identity material and secrets ([`VaultProvider`]), and executing one
//! transformation ([`VaultCore::vault_execute`]). An execution either yields
//! all three outputs or fails as a unit with a [`VaultError`].

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::credentials::SecretValue;

#[cfg(feature = "free-core")]
pub mod free;

/// Vault core error types.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Credentials or identity material were rejected at initialization.
    #[error("invalid vault credentials: {0}")]
    InvalidCredentials(String),
    /// The audit log could not be opened or written.
    #[error("vault audit log unavailable at {}: {source}", path.display())]
    AuditLog {
        /// Audit log path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Too many executions inside the burst window.
    #[error("rate limit exceeded")]
    RateLimited,
    /// The core failed to transform the payload.
    #[error("vault execution failed: {0}")]
    Execution(String),
}

/// Inputs for vault core initialization.
#[derive(Debug, Clone)]
pub struct VaultInit {
    /// Hardware identity material.
    pub hw_info: String,
    /// Root seed.
    pub seed: SecretValue,
    /// License/authorization signature.
    pub license_signature: SecretValue,
    /// Audit log destination.
    pub audit_log_path: PathBuf,
}

/// Output of one successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultOutput {
    /// Transformed payload.
    pub ciphertext: Vec<u8>,
    /// Post-quantum ciphertext tag. Carried, not interpreted.
    pub pqc_tag: Vec<u8>,
    /// Opaque identifier for external audit correlation.
    pub audit_ref: String,
}

/// An initialized vault core handle.
#[async_trait]
pub trait VaultCore: Send + Sync {
    /// Transform `data` for `public_key`.
    async fn vault_execute(&self, data: &[u8], public_key: &[u8])
        -> Result<VaultOutput, VaultError>;
}

/// Factory for vault core handles.
pub trait VaultProvider: Send + Sync {
    /// Initialize a core from identity material and secrets.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError`] when credentials are rejected or the core's
    /// resources cannot be acquired.
    fn initialize(&self, init: VaultInit) -> Result<Box<dyn VaultCore>, VaultError>;
}
