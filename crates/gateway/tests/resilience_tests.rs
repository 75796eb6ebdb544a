//! Fault-injection tests for the acquisition loop: connection loss, flaky
//! connects, partial reads, and shutdown behavior.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use domain::{
    ConnectionState, DataType, DeviceConfig, GatewayError, Protocol, ProtocolAdapter, Quality,
    Result, TagDefinition, Value,
};
use gateway::{AcquisitionLoop, TagStore, WriteCommand};

// --- Mock adapter with fault injection ---

#[derive(Default)]
struct Faults {
    // connect() fails this many times before succeeding
    connect_failures: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    // While set, every poll fails with a communication error
    fail_reads: AtomicBool,
    read_result: Mutex<HashMap<String, Value>>,
}

impl Faults {
    fn new(connect_failures: usize, read_result: Vec<(&str, Value)>) -> Arc<Self> {
        let faults = Self::default();
        faults
            .connect_failures
            .store(connect_failures, Ordering::SeqCst);
        *faults.read_result.lock().unwrap() = read_result
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Arc::new(faults)
    }

    fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

struct FaultAdapter {
    faults: Arc<Faults>,
    state: ConnectionState,
}

impl FaultAdapter {
    fn new(faults: Arc<Faults>) -> Box<Self> {
        Box::new(Self {
            faults,
            state: ConnectionState::Disconnected,
        })
    }
}

#[async_trait]
impl ProtocolAdapter for FaultAdapter {
    async fn connect(&mut self) -> Result<()> {
        self.faults.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.faults.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.faults
                .connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::Connection("injected failure".to_string()));
        }
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.faults.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state = ConnectionState::Disconnected;
    }

    async fn read_tags(&mut self) -> Result<HashMap<String, Value>> {
        if self.faults.fail_reads.load(Ordering::SeqCst) {
            return Err(GatewayError::Communication("injected read failure".to_string()));
        }
        Ok(self.faults.read_result.lock().unwrap().clone())
    }

    async fn write_tag(&mut self, _name: &str, _value: Value) -> Result<()> {
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }

    fn protocol(&self) -> Protocol {
        Protocol::Simulator
    }
}

fn device_config(tags: &[&str]) -> DeviceConfig {
    DeviceConfig {
        name: "plc-1".to_string(),
        protocol: Protocol::Simulator,
        connection: serde_json::json!({}),
        scan_rate_ms: 100,
        retry_delay_ms: 100,
        tags: tags
            .iter()
            .map(|t| TagDefinition {
                name: t.to_string(),
                address: "const:0".to_string(),
                data_type: DataType::UInt16,
                scale: 1.0,
                offset: 0.0,
            })
            .collect(),
    }
}

struct Harness {
    store: Arc<TagStore>,
    writes: mpsc::Sender<WriteCommand>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

fn spawn_loop(faults: Arc<Faults>, tags: &[&str]) -> Harness {
    let store = Arc::new(TagStore::new(ChronoDuration::seconds(60)));
    let (tx, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let acquisition = AcquisitionLoop::new(
        device_config(tags),
        FaultAdapter::new(faults),
        store.clone(),
        rx,
        cancel.clone(),
    );
    let task = tokio::spawn(acquisition.run());
    Harness {
        store,
        writes: tx,
        cancel,
        task,
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_failed_connects() {
    let faults = Faults::new(3, vec![("speed", Value::Int(42))]);
    let harness = spawn_loop(faults.clone(), &["speed"]);

    // Still inside the third retry delay: nothing may have been acquired yet
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(harness.store.read("speed").is_none());
    assert!(faults.connects.load(Ordering::SeqCst) <= 3);

    // Three retry delays plus one scan interval is enough to converge
    tokio::time::sleep(Duration::from_millis(750)).await;

    assert!(faults.connects.load(Ordering::SeqCst) >= 4);
    let value = harness.store.read("speed").expect("tag acquired");
    assert_eq!(value.value, Value::Int(42));
    assert_eq!(value.quality, Quality::Good);

    harness.cancel.cancel();
    harness.task.await.unwrap();
}

// A device that accepts connections but fails every read must cycle at the
// retry cadence, not spin connect/poll/disconnect back to back.
#[tokio::test(start_paused = true)]
async fn test_read_failures_pace_reconnects() {
    let faults = Faults::new(0, vec![("speed", Value::Int(1))]);
    faults.set_fail_reads(true);
    let harness = spawn_loop(faults.clone(), &["speed"]);

    tokio::time::sleep(Duration::from_millis(1000)).await;

    // retry_delay is 100ms, so one second allows roughly ten cycles
    let connects = faults.connects.load(Ordering::SeqCst);
    assert!(connects >= 2, "loop stopped retrying: {connects} connects");
    assert!(connects <= 12, "reconnects not paced by retry delay: {connects} connects");

    harness.cancel.cancel();
    harness.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_partial_read_updates_what_arrived() {
    let faults = Faults::new(0, vec![("a", Value::Int(1)), ("b", Value::Int(2))]);
    let harness = spawn_loop(faults.clone(), &["a", "b", "c"]);

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(harness.store.read("a").unwrap().value, Value::Int(1));
    assert_eq!(harness.store.read("b").unwrap().value, Value::Int(2));
    // "c" never arrived; it simply has no entry rather than a fake one
    assert!(harness.store.read("c").is_none());

    harness.cancel.cancel();
    harness.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poll_failure_marks_owned_tags_bad_then_recovers() {
    let faults = Faults::new(0, vec![("speed", Value::Int(7))]);
    let harness = spawn_loop(faults.clone(), &["speed"]);

    // Let a good poll land first
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(harness.store.read("speed").unwrap().quality, Quality::Good);

    faults.set_fail_reads(true);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Marked bad but the last value is retained
    let degraded = harness.store.read("speed").unwrap();
    assert_eq!(degraded.quality, Quality::Bad);
    assert_eq!(degraded.value, Value::Int(7));
    assert!(faults.disconnects.load(Ordering::SeqCst) >= 1);

    // Reads heal, reconnect succeeds, the next poll restores good quality
    faults.set_fail_reads(false);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(harness.store.read("speed").unwrap().quality, Quality::Good);

    harness.cancel.cancel();
    harness.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_write_refused_while_disconnected() {
    // Connects never succeed
    let faults = Faults::new(usize::MAX, vec![]);
    let harness = spawn_loop(faults, &["speed"]);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let (reply, confirm) = oneshot::channel();
    harness
        .writes
        .send(WriteCommand {
            name: "speed".to_string(),
            value: Value::Int(1),
            reply,
        })
        .await
        .unwrap();

    let result = confirm.await.unwrap();
    assert!(matches!(result, Err(GatewayError::Connection(_))));

    harness.cancel.cancel();
    harness.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_disconnects_adapter() {
    let faults = Faults::new(0, vec![("speed", Value::Int(1))]);
    let harness = spawn_loop(faults.clone(), &["speed"]);

    tokio::time::sleep(Duration::from_millis(250)).await;
    harness.cancel.cancel();
    harness.task.await.unwrap();

    assert!(faults.disconnects.load(Ordering::SeqCst) >= 1);
}
