use thiserror::Error;

/// Gateway-level errors
///
/// `Connection` and `Communication` are absorbed by the acquisition loop and
/// turned into state transitions; `UnknownTag` and `Rejected` surface
/// synchronously to whoever issued a write.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("communication failure: {0}")]
    Communication(String),

    #[error("unknown tag: {0}")]
    UnknownTag(String),

    #[error("rejected by device: {0}")]
    Rejected(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
