//! Protocol adapters for the acquisition gateway.
//!
//! Each module implements [`domain::ProtocolAdapter`] for one device family;
//! [`AdapterFactory`] turns a validated [`DeviceConfig`] into the right boxed
//! adapter. The vendor TCP codecs sit behind per-protocol client traits so
//! adapter behavior is testable without a live controller.

mod convert;
mod plan;

pub mod eip;
pub mod fins;
pub mod melsec;
pub mod modbus;
pub mod simulator;

pub use eip::{EipAdapter, EipConfig};
pub use fins::{FinsAdapter, FinsConfig};
pub use melsec::{MelsecAdapter, MelsecConfig};
pub use modbus::{ModbusAdapter, ModbusConfig};
pub use simulator::SimulatorAdapter;

use domain::{DeviceConfig, Protocol, ProtocolAdapter, Result};

/// Factory for creating protocol adapters
pub struct AdapterFactory;

impl AdapterFactory {
    /// Create the adapter a device configuration asks for.
    ///
    /// Validates the configuration first, so a bad address or duplicate tag
    /// name fails here instead of on the first poll.
    pub fn create(config: &DeviceConfig) -> Result<Box<dyn ProtocolAdapter>> {
        config.validate()?;
        match config.protocol {
            Protocol::Modbus => {
                Ok(Box::new(ModbusAdapter::from_config(config)?) as Box<dyn ProtocolAdapter>)
            }
            Protocol::EthernetIp => {
                Ok(Box::new(EipAdapter::from_config(config)?) as Box<dyn ProtocolAdapter>)
            }
            Protocol::Fins => {
                Ok(Box::new(FinsAdapter::from_config(config)?) as Box<dyn ProtocolAdapter>)
            }
            Protocol::Melsec => {
                Ok(Box::new(MelsecAdapter::from_config(config)?) as Box<dyn ProtocolAdapter>)
            }
            Protocol::Simulator => {
                Ok(Box::new(SimulatorAdapter::from_config(config)?) as Box<dyn ProtocolAdapter>)
            }
        }
    }
}
