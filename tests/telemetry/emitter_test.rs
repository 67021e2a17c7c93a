//! Tests for heartbeat records and the emitter.

use std::time::Duration;

use async_trait::async_trait;

use nebula::config::{parse_node_config, ConfigFormat};
use nebula::telemetry::transport::LogTransport;
use nebula::telemetry::{HeartbeatRecord, HeartbeatTransport, NodeStatus, TelemetryEmitter};

fn record(status: NodeStatus, anomaly_count: u32) -> HeartbeatRecord {
    HeartbeatRecord {
        node: "FREE-01".to_owned(),
        status,
        anomaly_count,
        timestamp: "2026-01-01T00:00:00.000Z".to_owned(),
    }
}

struct Refusing;

#[async_trait]
impl HeartbeatTransport for Refusing {
    fn describe(&self) -> String {
        "refusing".to_owned()
    }

    async fn send(&self, _record: &HeartbeatRecord) -> anyhow::Result<()> {
        anyhow::bail!("503 service unavailable")
    }
}

struct Stalled;

#[async_trait]
impl HeartbeatTransport for Stalled {
    fn describe(&self) -> String {
        "stalled".to_owned()
    }

    async fn send(&self, _record: &HeartbeatRecord) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

#[test]
fn record_serializes_with_wire_field_names() {
    let json = serde_json::to_value(record(NodeStatus::Active, 2)).expect("should serialize");

    assert_eq!(json["node"], "FREE-01");
    assert_eq!(json["status"], "ACTIVE");
    assert_eq!(json["anomaly_count"], 2);
    assert_eq!(json["timestamp"], "2026-01-01T00:00:00.000Z");
    assert_eq!(json.as_object().map(|o| o.len()), Some(4));
}

#[test]
fn status_labels_match_wire_values() {
    for (status, label) in [
        (NodeStatus::Active, "ACTIVE"),
        (NodeStatus::Compromised, "COMPROMISED"),
        (NodeStatus::Inactive, "INACTIVE"),
    ] {
        assert_eq!(status.as_str(), label);
        assert_eq!(status.to_string(), label);
        let json = serde_json::to_string(&status).expect("should serialize");
        assert_eq!(json, format!("\"{label}\""));
    }
}

#[tokio::test]
async fn log_transport_always_delivers() {
    let emitter = TelemetryEmitter::new(
        Box::new(LogTransport),
        Duration::from_secs(30),
        Duration::from_secs(5),
    )
    .expect("emitter should build");
    assert!(emitter.emit(&record(NodeStatus::Active, 0)).await);
    assert_eq!(emitter.interval(), Duration::from_secs(30));
}

#[tokio::test]
async fn delivery_failure_is_swallowed() {
    let emitter = TelemetryEmitter::new(
        Box::new(Refusing),
        Duration::from_secs(30),
        Duration::from_secs(5),
    )
    .expect("emitter should build");
    assert!(!emitter.emit(&record(NodeStatus::Compromised, 5)).await);
}

#[tokio::test(start_paused = true)]
async fn slow_delivery_is_cut_off_at_timeout() {
    let emitter = TelemetryEmitter::new(
        Box::new(Stalled),
        Duration::from_secs(30),
        Duration::from_secs(2),
    )
    .expect("emitter should build");

    let began = tokio::time::Instant::now();
    assert!(!emitter.emit(&record(NodeStatus::Active, 0)).await);
    assert_eq!(began.elapsed(), Duration::from_secs(2));
}

#[test]
fn emitter_follows_configured_cadence() {
    let toml = "node_id = \"n\"\nhw_id = \"h\"\nheartbeat_target = \"log\"\nheartbeat_interval_secs = 12\n";
    let config = parse_node_config(toml, ConfigFormat::Toml, |_| None).expect("config parses");

    let emitter = TelemetryEmitter::from_config(&config).expect("emitter builds");
    assert_eq!(emitter.interval(), Duration::from_secs(12));
}

#[test]
fn zero_interval_is_rejected() {
    let result = TelemetryEmitter::new(
        Box::new(LogTransport),
        Duration::ZERO,
        Duration::from_secs(1),
    );
    assert!(result.is_err());
}
