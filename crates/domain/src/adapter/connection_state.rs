use serde::{Deserialize, Serialize};

/// Connection state of one adapter's field link
///
/// Owned exclusively by the adapter and its acquisition loop; never shared
/// across devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected, no active connection attempt
    Disconnected,
    /// Currently attempting to establish the link
    Connecting,
    /// Link is up and operational
    Connected,
    /// A request failed while the link was up; a reconnect is required
    Faulted,
}

impl ConnectionState {
    /// Check if state allows a connection attempt
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Faulted)
    }

    /// Check if currently connected
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}
