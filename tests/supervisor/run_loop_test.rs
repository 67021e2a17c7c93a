//! Tests for the operational loop: heartbeat cadence, request serving,
//! lockout and operator shutdown. All run on a paused clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use nebula::supervisor::{ExecuteOutcome, LifecycleState, NodeError, VaultRequest};
use nebula::telemetry::{HeartbeatRecord, HeartbeatTransport, NodeStatus, TelemetryEmitter};

use super::start;

type Sent = Arc<Mutex<Vec<(Instant, HeartbeatRecord)>>>;

struct RecordingTransport {
    sent: Sent,
}

#[async_trait]
impl HeartbeatTransport for RecordingTransport {
    fn describe(&self) -> String {
        "recording".to_owned()
    }

    async fn send(&self, record: &HeartbeatRecord) -> anyhow::Result<()> {
        self.sent
            .lock()
            .expect("lock")
            .push((Instant::now(), record.clone()));
        Ok(())
    }
}

struct FailingTransport;

#[async_trait]
impl HeartbeatTransport for FailingTransport {
    fn describe(&self) -> String {
        "failing".to_owned()
    }

    async fn send(&self, _record: &HeartbeatRecord) -> anyhow::Result<()> {
        anyhow::bail!("endpoint unreachable")
    }
}

struct HangingTransport;

#[async_trait]
impl HeartbeatTransport for HangingTransport {
    fn describe(&self) -> String {
        "hanging".to_owned()
    }

    async fn send(&self, _record: &HeartbeatRecord) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn recording_emitter(interval_secs: u64) -> (TelemetryEmitter, Sent) {
    let sent: Sent = Arc::default();
    let emitter = TelemetryEmitter::new(
        Box::new(RecordingTransport {
            sent: Arc::clone(&sent),
        }),
        Duration::from_secs(interval_secs),
        Duration::from_secs(1),
    )
    .expect("emitter should build");
    (emitter, sent)
}

async fn submit(tx: &mpsc::Sender<VaultRequest>, data: &[u8]) -> ExecuteOutcome {
    let (reply, outcome) = oneshot::channel();
    tx.send(VaultRequest {
        data: data.to_vec(),
        public_key: b"pk".to_vec(),
        reply,
    })
    .await
    .expect("loop should accept request");
    outcome.await.expect("loop should reply")
}

#[tokio::test(start_paused = true)]
async fn heartbeats_follow_configured_interval() {
    let (supervisor, _probe) = start(5, |_| false);
    let (emitter, sent) = recording_emitter(10);
    let (_request_tx, request_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let began = Instant::now();
    let driver = async {
        tokio::time::sleep(Duration::from_secs(35)).await;
        shutdown_tx.send(true).expect("loop is listening");
    };
    let (result, ()) = tokio::join!(supervisor.run(&emitter, request_rx, shutdown_rx), driver);

    let report = result.expect("operator shutdown is clean");
    assert_eq!(report.heartbeats, 4);

    let sent = sent.lock().expect("lock");
    let offsets: Vec<Duration> = sent.iter().map(|(at, _)| at.duration_since(began)).collect();
    assert_eq!(
        offsets,
        vec![
            Duration::ZERO,
            Duration::from_secs(10),
            Duration::from_secs(20),
            Duration::from_secs(30),
        ]
    );
    assert!(sent
        .iter()
        .all(|(_, record)| record.status == NodeStatus::Active && record.node == "FREE-01"));
}

#[tokio::test(start_paused = true)]
async fn operator_shutdown_after_successful_traffic() {
    let (supervisor, probe) = start(5, |_| false);
    let (emitter, sent) = recording_emitter(10);
    let (request_tx, request_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let driver = async {
        for data in [&b"one"[..], b"two", b"three"] {
            let outcome = submit(&request_tx, data).await;
            assert_eq!(outcome.status(), "SUCCESS");
        }
        tokio::time::sleep(Duration::from_secs(15)).await;
        shutdown_tx.send(true).expect("loop is listening");
    };
    let (result, ()) = tokio::join!(supervisor.run(&emitter, request_rx, shutdown_rx), driver);

    let report = result.expect("operator shutdown is clean");
    assert_eq!(report.anomaly_count, 0);
    assert_eq!(report.heartbeats, 2);
    assert_eq!(probe.calls(), 3);
    assert!(probe.released());
    assert_eq!(supervisor.lifecycle_state().await, LifecycleState::Inactive);
    assert!(sent
        .lock()
        .expect("lock")
        .iter()
        .all(|(_, record)| record.status == NodeStatus::Active));
}

#[tokio::test(start_paused = true)]
async fn lockout_ends_loop_with_compromised_heartbeat() {
    let (supervisor, probe) = start(5, |_| true);
    let (emitter, sent) = recording_emitter(30);
    let (request_tx, request_rx) = mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let driver = async {
        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(submit(&request_tx, b"payload").await);
        }
        outcomes
    };
    let (result, outcomes) = tokio::join!(supervisor.run(&emitter, request_rx, shutdown_rx), driver);

    let err = result.expect_err("fifth failure should end the loop");
    assert!(matches!(err, NodeError::Lockout { anomalies: 5, .. }));
    assert!(outcomes.iter().all(|o| *o == ExecuteOutcome::Unavailable));
    assert_eq!(probe.calls(), 5);
    assert!(probe.released());

    let sent = sent.lock().expect("lock");
    let (_, last) = sent.last().expect("final heartbeat should be emitted");
    assert_eq!(last.status, NodeStatus::Compromised);
    assert_eq!(last.anomaly_count, 5);
    assert_eq!(sent.len(), 2, "initial tick plus the final record");
}

#[tokio::test(start_paused = true)]
async fn failing_transport_does_not_disturb_node() {
    let (supervisor, _probe) = start(5, |_| false);
    let emitter = TelemetryEmitter::new(
        Box::new(FailingTransport),
        Duration::from_secs(10),
        Duration::from_secs(1),
    )
    .expect("emitter should build");
    let (request_tx, request_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let driver = async {
        tokio::time::sleep(Duration::from_secs(25)).await;
        let outcome = submit(&request_tx, b"payload").await;
        assert_eq!(outcome.status(), "SUCCESS");
        shutdown_tx.send(true).expect("loop is listening");
    };
    let (result, ()) = tokio::join!(supervisor.run(&emitter, request_rx, shutdown_rx), driver);

    let report = result.expect("operator shutdown is clean");
    assert_eq!(report.heartbeats, 3);
    assert_eq!(report.anomaly_count, 0);
}

#[tokio::test(start_paused = true)]
async fn hanging_transport_is_bounded_by_timeout() {
    let (supervisor, _probe) = start(5, |_| false);
    let emitter = TelemetryEmitter::new(
        Box::new(HangingTransport),
        Duration::from_secs(10),
        Duration::from_secs(1),
    )
    .expect("emitter should build");
    let (_request_tx, request_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let driver = async {
        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown_tx.send(true).expect("loop is listening");
    };
    let (result, ()) = tokio::join!(supervisor.run(&emitter, request_rx, shutdown_rx), driver);

    let report = result.expect("operator shutdown is clean");
    assert_eq!(report.heartbeats, 3);
    assert_eq!(supervisor.lifecycle_state().await, LifecycleState::Inactive);
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_interval_wait() {
    let (supervisor, _probe) = start(5, |_| false);
    let (emitter, sent) = recording_emitter(3600);
    let (_request_tx, request_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let began = Instant::now();
    let driver = async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown_tx.send(true).expect("loop is listening");
    };
    let (result, ()) = tokio::join!(supervisor.run(&emitter, request_rx, shutdown_rx), driver);

    result.expect("operator shutdown is clean");
    assert!(began.elapsed() < Duration::from_secs(6));
    assert_eq!(sent.lock().expect("lock").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_shutdown_sender_stops_loop() {
    let (supervisor, _probe) = start(5, |_| false);
    let (emitter, _sent) = recording_emitter(10);
    let (_request_tx, request_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    drop(shutdown_tx);

    let report = supervisor
        .run(&emitter, request_rx, shutdown_rx)
        .await
        .expect("closed shutdown channel stops cleanly");

    assert_eq!(report.heartbeats, 0);
    assert_eq!(supervisor.lifecycle_state().await, LifecycleState::Inactive);
}

#[tokio::test(start_paused = true)]
async fn closed_ingress_keeps_heartbeating() {
    let (supervisor, _probe) = start(5, |_| false);
    let (emitter, sent) = recording_emitter(10);
    let (request_tx, request_rx) = mpsc::channel::<VaultRequest>(8);
    drop(request_tx);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let driver = async {
        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown_tx.send(true).expect("loop is listening");
    };
    let (result, ()) = tokio::join!(supervisor.run(&emitter, request_rx, shutdown_rx), driver);

    assert_eq!(result.expect("clean shutdown").heartbeats, 3);
    assert_eq!(sent.lock().expect("lock").len(), 3);
}
