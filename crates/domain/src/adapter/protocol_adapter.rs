use std::collections::HashMap;

use async_trait::async_trait;

use super::{ConnectionState, Protocol};
use crate::error::Result;
use crate::tag::Value;

/// Contract implemented once per wire protocol.
///
/// The acquisition loop and the orchestrator are written against this trait
/// and never branch on protocol type; the only protocol `match` lives in the
/// adapter factory.
///
/// `Send` but not `Sync`: an adapter is owned by exactly one acquisition
/// task and moves into it, it is never shared across tasks.
#[async_trait]
pub trait ProtocolAdapter: Send {
    /// Establish the underlying link.
    ///
    /// Idempotent: calling while already connected is a no-op. Must not retry
    /// internally; retry policy belongs to the acquisition loop.
    async fn connect(&mut self) -> Result<()>;

    /// Release the link. Safe to call repeatedly or before ever connecting.
    async fn disconnect(&mut self);

    /// Read every configured tag in as few round-trips as addressing allows.
    ///
    /// A tag whose underlying point cannot be read is omitted from the result;
    /// a failure of the link itself returns `GatewayError::Communication` and
    /// clears the adapter's connected flag.
    async fn read_tags(&mut self) -> Result<HashMap<String, Value>>;

    /// Write one value to the tag's protocol-native address, applying the
    /// inverse of any configured scaling.
    ///
    /// Fails with `UnknownTag` if the name is not configured for this adapter,
    /// `Communication` on link failure, `Rejected` on a device-level error.
    async fn write_tag(&mut self, name: &str, value: Value) -> Result<()>;

    /// Get current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Check if currently connected
    fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Get protocol identifier
    fn protocol(&self) -> Protocol;
}
