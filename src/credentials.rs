//! Vault core secrets resolved from the process environment.
//!
//! The license signature and root seed come from `TITAN_LICENSE_KEY` and
//! `TITAN_ROOT_SEED`, optionally pre-seeded from a dotenv file. When a value
//! is unset the free-tier literal is used and the fallback is flagged; release
//! builds refuse flagged secrets unless explicitly allowed.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use tracing::warn;

/// Environment variable holding the license/authorization signature.
pub const LICENSE_KEY_VAR: &str = "TITAN_LICENSE_KEY";
/// Environment variable holding the root seed.
pub const ROOT_SEED_VAR: &str = "TITAN_ROOT_SEED";

const FALLBACK_LICENSE: &str = "FREE_LICENSE";
const FALLBACK_SEED: &str = "FREE_SEED";

/// Opaque secret value that never appears in logs.
///
/// Debug output always shows `__REDACTED__`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    /// Create a new secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value. Use only when handing it to the vault core.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// Errors raised by the secrets policy.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Fallback literals are in use where they are not tolerated.
    #[error("insecure default secrets in use for {}; set them or allow insecure defaults", .0.join(", "))]
    InsecureDefaults(Vec<&'static str>),
}

/// License signature and root seed for vault core initialization.
#[derive(Debug, Clone)]
pub struct CoreSecrets {
    license_signature: SecretValue,
    root_seed: SecretValue,
    fallbacks: Vec<&'static str>,
}

impl CoreSecrets {
    /// Resolve both secrets, falling back to the free-tier literals.
    ///
    /// Empty values count as unset. Every fallback is logged as a warning.
    pub fn resolve(env: impl Fn(&str) -> Option<String>) -> Self {
        let mut fallbacks = Vec::new();
        let mut lookup = |var: &'static str, fallback: &str| match env(var) {
            Some(value) if !value.trim().is_empty() => SecretValue::new(value),
            _ => {
                warn!(var, "secret unset, using insecure free-tier default");
                fallbacks.push(var);
                SecretValue::new(fallback)
            }
        };

        let license_signature = lookup(LICENSE_KEY_VAR, FALLBACK_LICENSE);
        let root_seed = lookup(ROOT_SEED_VAR, FALLBACK_SEED);

        Self {
            license_signature,
            root_seed,
            fallbacks,
        }
    }

    /// Build secrets from explicit values (no fallback flagged).
    pub fn from_values(license_signature: SecretValue, root_seed: SecretValue) -> Self {
        Self {
            license_signature,
            root_seed,
            fallbacks: Vec::new(),
        }
    }

    /// License/authorization signature.
    pub fn license_signature(&self) -> &SecretValue {
        &self.license_signature
    }

    /// Root seed.
    pub fn root_seed(&self) -> &SecretValue {
        &self.root_seed
    }

    /// Variables that fell back to insecure literals.
    pub fn insecure_fallbacks(&self) -> &[&'static str] {
        &self.fallbacks
    }

    /// Apply the fallback policy.
    ///
    /// `strict` is true for release builds; there fallbacks are refused unless
    /// `allow_insecure` is set.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InsecureDefaults`] when a fallback is in use
    /// under a strict policy without the override.
    pub fn enforce(&self, allow_insecure: bool, strict: bool) -> Result<(), CredentialError> {
        if self.fallbacks.is_empty() {
            return Ok(());
        }
        if strict && !allow_insecure {
            return Err(CredentialError::InsecureDefaults(self.fallbacks.clone()));
        }
        warn!(
            vars = ?self.fallbacks,
            "running with insecure default secrets (development mode)"
        );
        Ok(())
    }
}

/// Read a dotenv file into a key/value map.
///
/// # Errors
///
/// Returns an error if the file cannot be read or an entry fails to parse.
pub fn load_env_file(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read env file at {}", path.display()))?;

    let mut vars = BTreeMap::new();
    for item in iter {
        let (key, value) = item.with_context(|| {
            format!("failed to parse key-value entry in env file {}", path.display())
        })?;
        vars.insert(key, value);
    }
    Ok(vars)
}
