//! Nebula: supervisory node for a sealed vault core.
//!
//! Accepts opaque payloads, forwards them to the vault core, counts every
//! failure as an anomaly, and locks the node for good once the anomaly
//! threshold is reached. Emits periodic heartbeat telemetry while running.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod ingress;
pub mod logging;
pub mod supervisor;
pub mod telemetry;
pub mod vault;
