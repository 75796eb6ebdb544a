use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::Protocol;
use crate::error::{GatewayError, Result};

/// Wire representation of one tag's value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl DataType {
    pub fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

/// One configured point: gateway tag name, protocol-native address, wire type
/// and an optional linear transform (engineering = raw * scale + offset).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagDefinition {
    pub name: String,
    /// Protocol-native address, parsed by the owning adapter at startup
    /// (e.g. "40001", "D100", "X1F", "Program:Main.Speed")
    pub address: String,
    pub data_type: DataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl TagDefinition {
    pub fn has_scaling(&self) -> bool {
        self.scale != 1.0 || self.offset != 0.0
    }

    /// Raw wire value to engineering value.
    pub fn to_engineering(&self, raw: f64) -> f64 {
        raw * self.scale + self.offset
    }

    /// Engineering value back to the raw wire value (used for writes).
    pub fn to_raw(&self, engineering: f64) -> f64 {
        (engineering - self.offset) / self.scale
    }
}

/// Immutable configuration of one field device.
///
/// Loaded once at startup; a change requires restarting the owning adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub protocol: Protocol,
    /// Per-protocol connection parameters, parsed by the adapter itself
    #[serde(default)]
    pub connection: serde_json::Value,
    #[serde(default = "default_scan_rate_ms")]
    pub scan_rate_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub tags: Vec<TagDefinition>,
}

fn default_scan_rate_ms() -> u64 {
    1000
}

fn default_retry_delay_ms() -> u64 {
    5000
}

impl DeviceConfig {
    pub fn scan_rate(&self) -> Duration {
        Duration::from_millis(self.scan_rate_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(|t| t.name.as_str())
    }

    /// Startup validation of the device record itself (cross-device checks
    /// such as unique tag ownership belong to the orchestrator).
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GatewayError::InvalidConfig(
                "device name cannot be empty".to_string(),
            ));
        }
        if self.scan_rate_ms == 0 {
            return Err(GatewayError::InvalidConfig(format!(
                "device {}: scan_rate_ms must be > 0",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for tag in &self.tags {
            if tag.name.is_empty() {
                return Err(GatewayError::InvalidConfig(format!(
                    "device {}: tag name cannot be empty",
                    self.name
                )));
            }
            if tag.scale == 0.0 {
                return Err(GatewayError::InvalidConfig(format!(
                    "tag {}: scale must be non-zero",
                    tag.name
                )));
            }
            if !seen.insert(tag.name.as_str()) {
                return Err(GatewayError::InvalidConfig(format!(
                    "device {}: duplicate tag {}",
                    self.name, tag.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tag(name: &str, scale: f64, offset: f64) -> TagDefinition {
        TagDefinition {
            name: name.to_string(),
            address: "40001".to_string(),
            data_type: DataType::UInt16,
            scale,
            offset,
        }
    }

    #[test]
    fn test_scaling_round_trip() {
        let t = tag("speed", 0.1, -5.0);
        let eng = t.to_engineering(1500.0);
        assert!((eng - 145.0).abs() < 1e-9);
        assert!((t.to_raw(eng) - 1500.0).abs() < 1e-9);
    }

    #[test]
    fn test_identity_scaling_detected() {
        assert!(!tag("a", 1.0, 0.0).has_scaling());
        assert!(tag("b", 0.1, 0.0).has_scaling());
        assert!(tag("c", 1.0, 2.0).has_scaling());
    }

    #[test]
    fn test_device_config_defaults() {
        let cfg: DeviceConfig = serde_json::from_value(json!({
            "name": "plc-1",
            "protocol": "modbus",
            "tags": [{"name": "speed", "address": "40001", "data_type": "uint16", "scale": 0.1}]
        }))
        .unwrap();

        assert_eq!(cfg.scan_rate_ms, 1000);
        assert_eq!(cfg.retry_delay_ms, 5000);
        assert_eq!(cfg.tags[0].scale, 0.1);
        assert_eq!(cfg.tags[0].offset, 0.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let cfg: DeviceConfig = serde_json::from_value(json!({
            "name": "plc-1",
            "protocol": "fins",
            "tags": [
                {"name": "speed", "address": "D100", "data_type": "uint16"},
                {"name": "speed", "address": "D101", "data_type": "uint16"}
            ]
        }))
        .unwrap();

        assert!(matches!(
            cfg.validate(),
            Err(GatewayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_scale_rejected() {
        let mut cfg: DeviceConfig = serde_json::from_value(json!({
            "name": "plc-1",
            "protocol": "melsec",
            "tags": [{"name": "speed", "address": "D0", "data_type": "int16"}]
        }))
        .unwrap();
        cfg.tags[0].scale = 0.0;

        assert!(cfg.validate().is_err());
    }
}
