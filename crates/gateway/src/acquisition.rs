//! Per-device acquisition loop.
//!
//! Each configured device gets one task that owns its adapter outright. The
//! loop polls at the device scan rate while connected, falls back to a
//! retry cadence while disconnected, and services external write commands in
//! both states. Nothing else ever touches the adapter, so the protocol
//! sessions need no locking.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use domain::{DeviceConfig, GatewayError, ProtocolAdapter, Quality, Result, Value};

use crate::store::TagStore;
use std::sync::Arc;

/// An external write routed to the device task that owns the adapter.
pub struct WriteCommand {
    pub name: String,
    pub value: Value,
    pub reply: oneshot::Sender<Result<()>>,
}

pub struct AcquisitionLoop {
    config: DeviceConfig,
    adapter: Box<dyn ProtocolAdapter>,
    store: Arc<TagStore>,
    commands: mpsc::Receiver<WriteCommand>,
    cancel: CancellationToken,
    /// Set while a failure streak has already been logged at warn level.
    failure_logged: bool,
}

impl AcquisitionLoop {
    pub fn new(
        config: DeviceConfig,
        adapter: Box<dyn ProtocolAdapter>,
        store: Arc<TagStore>,
        commands: mpsc::Receiver<WriteCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            adapter,
            store,
            commands,
            cancel,
            failure_logged: false,
        }
    }

    /// Drive the device until cancelled.
    pub async fn run(mut self) {
        let device = self.config.name.clone();
        info!(device = %device, protocol = ?self.config.protocol, "starting acquisition loop");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if !self.adapter.is_connected() {
                match self.adapter.connect().await {
                    // failure_logged stays set until a poll succeeds, so a
                    // device that accepts connections but fails every read
                    // still logs once per streak
                    Ok(()) => info!(device = %device, "connected"),
                    Err(e) => {
                        if !self.failure_logged {
                            warn!(device = %device, "connect failed, retrying every {:?}: {e}",
                                self.config.retry_delay());
                            self.failure_logged = true;
                        }
                        if self.idle_wait(self.config.retry_delay()).await.is_break() {
                            break;
                        }
                        continue;
                    }
                }
            }

            match self.poll_cycle().await {
                std::ops::ControlFlow::Break(()) => break,
                // The connection dropped mid-cycle; pace the reconnect the
                // same way a failed connect is paced
                std::ops::ControlFlow::Continue(()) => {
                    if self.idle_wait(self.config.retry_delay()).await.is_break() {
                        break;
                    }
                }
            }
        }

        self.adapter.disconnect().await;
        info!(device = %device, "acquisition loop stopped");
    }

    /// One connected stretch: poll on the scan cadence, serve writes between
    /// polls. Returns `Break` on cancellation, `Continue` when the
    /// connection dropped and the outer loop should reconnect.
    async fn poll_cycle(&mut self) -> std::ops::ControlFlow<()> {
        let scan_rate = self.config.scan_rate();
        let mut timer = tokio::time::interval(scan_rate);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.adapter.is_connected() {
            tokio::select! {
                _ = self.cancel.cancelled() => return std::ops::ControlFlow::Break(()),
                _ = timer.tick() => self.poll_once().await,
                command = self.commands.recv() => match command {
                    Some(command) => self.serve_write(command).await,
                    // Orchestrator dropped the sender; treat as shutdown
                    None => return std::ops::ControlFlow::Break(()),
                },
            }
        }
        std::ops::ControlFlow::Continue(())
    }

    async fn poll_once(&mut self) {
        match self.adapter.read_tags().await {
            Ok(values) => {
                let count = values.len();
                for (name, value) in values {
                    self.store
                        .write(&name, value, Quality::Good, &self.config.name);
                }
                debug!(device = %self.config.name, tags = count, "poll complete");
                self.failure_logged = false;
            }
            Err(e) => {
                if !self.failure_logged {
                    warn!(device = %self.config.name, "poll failed, marking tags bad: {e}");
                    self.failure_logged = true;
                }
                self.adapter.disconnect().await;
                self.mark_owned_bad();
            }
        }
    }

    async fn serve_write(&mut self, command: WriteCommand) {
        let result = self.adapter.write_tag(&command.name, command.value).await;
        if let Err(GatewayError::Communication(_)) = &result {
            // The session is gone; readings are now suspect too
            self.adapter.disconnect().await;
            self.mark_owned_bad();
        }
        // Requester may have given up waiting
        let _ = command.reply.send(result);
    }

    fn mark_owned_bad(&self) {
        for name in self.config.tag_names() {
            self.store.set_quality(name, Quality::Bad);
        }
    }

    /// Wait out the retry delay, still answering writes (with a connection
    /// error) and reacting to cancellation.
    async fn idle_wait(&mut self, delay: Duration) -> std::ops::ControlFlow<()> {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return std::ops::ControlFlow::Break(()),
                _ = &mut deadline => return std::ops::ControlFlow::Continue(()),
                command = self.commands.recv() => match command {
                    Some(command) => {
                        let _ = command.reply.send(Err(GatewayError::Connection(format!(
                            "device {} is not connected",
                            self.config.name
                        ))));
                    }
                    None => return std::ops::ControlFlow::Break(()),
                },
            }
        }
    }
}
