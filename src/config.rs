//! Node configuration loading and validation.
//!
//! The node reads a flat key/value file (TOML, or JSON when the extension is
//! `.json`), merges it over the built-in defaults, applies environment
//! overrides and then requires the identity keys `node_id` and `hw_id`.
//! A [`NodeConfiguration`] can only be obtained through this gate, so every
//! downstream component sees a complete record.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Keys that must be present and non-empty once defaults are merged.
pub const REQUIRED_KEYS: [&str; 2] = ["node_id", "hw_id"];

/// Environment variable overriding `heartbeat_target`.
pub const ENV_HEARTBEAT_TARGET: &str = "NEBULA_HEARTBEAT_TARGET";
/// Environment variable overriding `heartbeat_interval_secs`.
pub const ENV_HEARTBEAT_INTERVAL: &str = "NEBULA_HEARTBEAT_INTERVAL_SECS";
/// Environment variable overriding `max_anomaly_score`.
pub const ENV_MAX_ANOMALY_SCORE: &str = "NEBULA_MAX_ANOMALY_SCORE";

/// Errors raised while loading or validating the node configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration content is not a valid key/value mapping.
    #[error("failed to parse {format} config: {reason}")]
    Parse {
        /// Source format that was attempted.
        format: ConfigFormat,
        /// Parser message.
        reason: String,
    },
    /// Required identity keys are absent or empty after merging defaults.
    #[error("missing mandatory config keys: {}", .0.join(", "))]
    MissingKeys(Vec<&'static str>),
    /// A value is present but outside its accepted range or shape.
    #[error("invalid value for `{key}`: {reason}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Supported configuration source formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML document with top-level keys.
    Toml,
    /// JSON object with top-level keys.
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension. Anything but `.json` is TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Toml => f.write_str("TOML"),
            Self::Json => f.write_str("JSON"),
        }
    }
}

/// Where heartbeat records are delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatTarget {
    /// JSON `POST` to an HTTP(S) endpoint.
    Http(url::Url),
    /// Atomic rewrite of a local file with the latest record.
    File(PathBuf),
    /// Log-only delivery.
    Log,
}

impl HeartbeatTarget {
    /// Classify a target string.
    ///
    /// `log` and `log:*` select log-only delivery; otherwise the value must be
    /// an `http`, `https` or `file` URL.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the target is not understood.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw == "log" || raw.starts_with("log:") {
            return Ok(Self::Log);
        }

        let parsed = url::Url::parse(raw).map_err(|e| format!("'{raw}' is not a URL: {e}"))?;
        match parsed.scheme() {
            "http" | "https" => Ok(Self::Http(parsed)),
            "file" => parsed
                .to_file_path()
                .map(Self::File)
                .map_err(|()| format!("'{raw}' is not a usable file path")),
            other => Err(format!("unsupported heartbeat scheme '{other}'")),
        }
    }
}

impl fmt::Display for HeartbeatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => write!(f, "{url}"),
            Self::File(path) => write!(f, "file://{}", path.display()),
            Self::Log => f.write_str("log"),
        }
    }
}

/// Raw key/value record as it appears in the source, defaults applied.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default)]
    node_id: Option<String>,

    #[serde(default)]
    hw_id: Option<String>,

    #[serde(default = "default_audit_log", alias = "audit_log_path")]
    audit_log: String,

    #[serde(default = "default_heartbeat_target", alias = "heartbeat_url")]
    heartbeat_target: String,

    #[serde(default = "default_heartbeat_interval_secs")]
    heartbeat_interval_secs: u64,

    // Unset means the default, capped at the interval.
    #[serde(default)]
    heartbeat_timeout_secs: Option<u64>,

    #[serde(default = "default_max_anomaly_score")]
    max_anomaly_score: u32,

    #[serde(default)]
    allow_insecure_defaults: bool,
}

impl RawConfig {
    /// Apply environment overrides (env > file > defaults).
    ///
    /// Takes a resolver so tests never touch the process environment.
    fn apply_overrides(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = env(ENV_HEARTBEAT_TARGET) {
            self.heartbeat_target = v;
        }
        if let Some(v) = env(ENV_HEARTBEAT_INTERVAL) {
            match v.trim().parse() {
                Ok(n) => self.heartbeat_interval_secs = n,
                Err(_) => warn!(var = ENV_HEARTBEAT_INTERVAL, value = %v, "ignoring invalid env override"),
            }
        }
        if let Some(v) = env(ENV_MAX_ANOMALY_SCORE) {
            match v.trim().parse() {
                Ok(n) => self.max_anomaly_score = n,
                Err(_) => warn!(var = ENV_MAX_ANOMALY_SCORE, value = %v, "ignoring invalid env override"),
            }
        }
    }

    fn into_validated(self) -> Result<NodeConfiguration, ConfigError> {
        let node_id = non_empty(self.node_id);
        let hw_id = non_empty(self.hw_id);

        let mut missing = Vec::new();
        if node_id.is_none() {
            missing.push(REQUIRED_KEYS[0]);
        }
        if hw_id.is_none() {
            missing.push(REQUIRED_KEYS[1]);
        }
        let (Some(node_id), Some(hw_id)) = (node_id, hw_id) else {
            return Err(ConfigError::MissingKeys(missing));
        };

        if self.audit_log.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "audit_log",
                reason: "must not be empty".to_owned(),
            });
        }
        if !(1..=3600).contains(&self.heartbeat_interval_secs) {
            return Err(ConfigError::Invalid {
                key: "heartbeat_interval_secs",
                reason: "must be in [1, 3600]".to_owned(),
            });
        }
        let heartbeat_timeout_secs = self.heartbeat_timeout_secs.unwrap_or_else(|| {
            default_heartbeat_timeout_secs().min(self.heartbeat_interval_secs)
        });
        if !(1..=60).contains(&heartbeat_timeout_secs)
            || heartbeat_timeout_secs > self.heartbeat_interval_secs
        {
            return Err(ConfigError::Invalid {
                key: "heartbeat_timeout_secs",
                reason: "must be in [1, 60] and not exceed heartbeat_interval_secs".to_owned(),
            });
        }
        if self.max_anomaly_score == 0 {
            return Err(ConfigError::Invalid {
                key: "max_anomaly_score",
                reason: "must be >= 1".to_owned(),
            });
        }
        let heartbeat_target =
            HeartbeatTarget::parse(&self.heartbeat_target).map_err(|reason| {
                ConfigError::Invalid {
                    key: "heartbeat_target",
                    reason,
                }
            })?;

        Ok(NodeConfiguration {
            node_id,
            hw_id,
            audit_log_path: PathBuf::from(self.audit_log),
            heartbeat_target,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(heartbeat_timeout_secs),
            max_anomaly_score: self.max_anomaly_score,
            allow_insecure_defaults: self.allow_insecure_defaults,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// Validated node configuration. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfiguration {
    node_id: String,
    hw_id: String,
    audit_log_path: PathBuf,
    heartbeat_target: HeartbeatTarget,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    max_anomaly_score: u32,
    allow_insecure_defaults: bool,
}

impl NodeConfiguration {
    /// Node identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Hardware identity material handed to the vault core.
    pub fn hw_id(&self) -> &str {
        &self.hw_id
    }

    /// Audit log destination for the vault core.
    pub fn audit_log_path(&self) -> &Path {
        &self.audit_log_path
    }

    /// Heartbeat delivery target.
    pub fn heartbeat_target(&self) -> &HeartbeatTarget {
        &self.heartbeat_target
    }

    /// Period between heartbeats.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Upper bound on a single heartbeat delivery.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Anomaly count at which the kill switch fires.
    pub fn max_anomaly_score(&self) -> u32 {
        self.max_anomaly_score
    }

    /// Whether fallback secrets are tolerated in release builds.
    pub fn allow_insecure_defaults(&self) -> bool {
        self.allow_insecure_defaults
    }
}

/// Parse and validate configuration content.
///
/// # Errors
///
/// Returns [`ConfigError`] when the content does not parse, required keys are
/// missing, or a tunable is out of range.
pub fn parse_node_config(
    contents: &str,
    format: ConfigFormat,
    env: impl Fn(&str) -> Option<String>,
) -> Result<NodeConfiguration, ConfigError> {
    let mut raw: RawConfig = match format {
        ConfigFormat::Toml => toml::from_str(contents).map_err(|e| ConfigError::Parse {
            format,
            reason: e.to_string(),
        })?,
        ConfigFormat::Json => serde_json::from_str(contents).map_err(|e| ConfigError::Parse {
            format,
            reason: e.to_string(),
        })?,
    };
    raw.apply_overrides(&env);
    raw.into_validated()
}

/// Load and validate the node configuration from a file.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read, parsed, or validated.
pub fn load_node_config(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<NodeConfiguration, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    parse_node_config(&contents, ConfigFormat::from_path(path), env)
}

// Default value functions for serde.

fn default_audit_log() -> String {
    "nebula_audit.log".to_owned()
}

fn default_heartbeat_target() -> String {
    "https://api.nebula-hq.com/v1/heartbeat".to_owned()
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    5
}

fn default_max_anomaly_score() -> u32 {
    5
}
