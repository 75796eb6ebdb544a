use serde::{Deserialize, Serialize};

/// Closed enumeration of the implemented wire protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Modbus TCP or RTU register/coil protocol
    Modbus,
    /// EtherNet/IP symbolic tag protocol (Logix-style controllers)
    EthernetIp,
    /// FINS memory-area protocol (byte/area addressed)
    Fins,
    /// MELSEC device/register protocol (3E binary frame)
    Melsec,
    /// Built-in waveform simulator
    Simulator,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Modbus => "modbus",
            Self::EthernetIp => "ethernet-ip",
            Self::Fins => "fins",
            Self::Melsec => "melsec",
            Self::Simulator => "simulator",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_as_str() {
        assert_eq!(Protocol::Modbus.as_str(), "modbus");
        assert_eq!(Protocol::EthernetIp.as_str(), "ethernet-ip");
        assert_eq!(Protocol::Fins.as_str(), "fins");
        assert_eq!(Protocol::Melsec.as_str(), "melsec");
        assert_eq!(Protocol::Simulator.as_str(), "simulator");
    }

    #[test]
    fn test_protocol_serde_names() {
        let p: Protocol = serde_json::from_str("\"ethernet-ip\"").unwrap();
        assert_eq!(p, Protocol::EthernetIp);
        assert_eq!(serde_json::to_string(&Protocol::Melsec).unwrap(), "\"melsec\"");
    }
}
