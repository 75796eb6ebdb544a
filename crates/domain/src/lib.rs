//! Domain layer - Pure types shared by every part of the gateway
//!
//! This crate contains:
//! - Value Objects (Value, TagValue, Quality)
//! - The `ProtocolAdapter` contract and its `ConnectionState`
//! - Device/tag configuration records
//!
//! Principles:
//! - No I/O and no runtime dependencies
//! - Protocol adapters and the acquisition layer both build on this crate
//! - Testable in isolation

pub mod adapter;
pub mod config;
pub mod error;
pub mod tag;

// Re-export commonly used types
pub use adapter::{ConnectionState, Protocol, ProtocolAdapter};
pub use config::{DataType, DeviceConfig, TagDefinition};
pub use error::{GatewayError, Result};
pub use tag::{Quality, TagValue, Value};
