//! Gateway orchestrator.
//!
//! Owns the store, spawns one acquisition loop per configured device, and
//! routes external writes to the loop that owns the target tag.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use adapters::AdapterFactory;
use domain::{DeviceConfig, GatewayError, Result, TagValue, Value};

use crate::acquisition::{AcquisitionLoop, WriteCommand};
use crate::store::TagStore;

/// Queued writes per device before senders start waiting.
const WRITE_QUEUE_DEPTH: usize = 16;

pub struct Gateway {
    store: Arc<TagStore>,
    /// Tag name to the write channel of the owning device loop
    routes: HashMap<String, mpsc::Sender<WriteCommand>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Validate the fleet configuration, build every adapter, and spawn the
    /// acquisition loops. Fails before anything is spawned, so a bad config
    /// never leaves half a gateway running.
    pub fn start(devices: Vec<DeviceConfig>, store: Arc<TagStore>) -> Result<Self> {
        Self::check_fleet(&devices)?;

        let mut adapters = Vec::with_capacity(devices.len());
        for device in &devices {
            adapters.push(AdapterFactory::create(device)?);
        }

        let cancel = CancellationToken::new();
        let mut routes = HashMap::new();
        let mut tasks = Vec::with_capacity(devices.len());

        for (device, adapter) in devices.into_iter().zip(adapters) {
            let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
            for name in device.tag_names() {
                routes.insert(name.to_string(), tx.clone());
            }
            let acquisition = AcquisitionLoop::new(
                device,
                adapter,
                store.clone(),
                rx,
                cancel.child_token(),
            );
            tasks.push(tokio::spawn(acquisition.run()));
        }

        info!(devices = tasks.len(), tags = routes.len(), "gateway started");
        Ok(Self {
            store,
            routes,
            cancel,
            tasks,
        })
    }

    /// Tag names must be unique across the whole fleet so reads and writes
    /// have exactly one owner.
    fn check_fleet(devices: &[DeviceConfig]) -> Result<()> {
        let mut device_names = HashSet::new();
        let mut tag_owners: HashMap<&str, &str> = HashMap::new();
        for device in devices {
            if !device_names.insert(device.name.as_str()) {
                return Err(GatewayError::InvalidConfig(format!(
                    "duplicate device name: {}",
                    device.name
                )));
            }
            for tag in device.tag_names() {
                if let Some(owner) = tag_owners.insert(tag, &device.name) {
                    return Err(GatewayError::InvalidConfig(format!(
                        "tag {tag} is configured on both {owner} and {}",
                        device.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn store(&self) -> Arc<TagStore> {
        self.store.clone()
    }

    /// Current value of one tag.
    pub fn read(&self, name: &str) -> Result<TagValue> {
        self.store
            .read(name)
            .ok_or_else(|| GatewayError::UnknownTag(name.to_string()))
    }

    /// Write a value through the owning device loop and wait for the device
    /// to confirm or refuse it.
    pub async fn write(&self, name: &str, value: Value) -> Result<()> {
        let route = self
            .routes
            .get(name)
            .ok_or_else(|| GatewayError::UnknownTag(name.to_string()))?;

        let (reply, confirm) = oneshot::channel();
        let command = WriteCommand {
            name: name.to_string(),
            value,
            reply,
        };
        route.send(command).await.map_err(|_| {
            GatewayError::Communication(format!("device loop for tag {name} is gone"))
        })?;
        confirm.await.map_err(|_| {
            GatewayError::Communication(format!("device loop for tag {name} dropped the write"))
        })?
    }

    /// Stop every acquisition loop and wait for the adapters to disconnect.
    pub async fn shutdown(self) {
        info!("gateway shutting down");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("acquisition task panicked during shutdown: {e}");
            }
        }
    }
}
