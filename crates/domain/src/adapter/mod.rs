mod connection_state;
mod protocol;
mod protocol_adapter;

pub use connection_state::ConnectionState;
pub use protocol::Protocol;
pub use protocol_adapter::ProtocolAdapter;
