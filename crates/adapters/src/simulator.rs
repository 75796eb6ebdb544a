use std::collections::HashMap;

use async_trait::async_trait;

use domain::{
    ConnectionState, DeviceConfig, GatewayError, Protocol, ProtocolAdapter, Result, TagDefinition,
    Value,
};

use crate::convert::{engineering_value, raw_from_value};

/// Waveform encoded in a simulated tag's native address:
/// `sine:<min>:<max>`, `ramp:<min>:<max>`, `const:<value>` or `toggle`.
#[derive(Debug, Clone, PartialEq)]
enum Waveform {
    Sine { min: f64, max: f64 },
    Ramp { min: f64, max: f64 },
    Const(f64),
    Toggle,
}

fn parse_waveform(address: &str) -> Result<Waveform> {
    let parts: Vec<&str> = address.split(':').collect();
    let num = |s: &str| -> Result<f64> {
        s.parse::<f64>().map_err(|_| {
            GatewayError::InvalidConfig(format!("invalid simulator address: {address}"))
        })
    };
    match parts.as_slice() {
        ["sine", min, max] => Ok(Waveform::Sine {
            min: num(min)?,
            max: num(max)?,
        }),
        ["ramp", min, max] => Ok(Waveform::Ramp {
            min: num(min)?,
            max: num(max)?,
        }),
        ["const", value] => Ok(Waveform::Const(num(value)?)),
        ["toggle"] => Ok(Waveform::Toggle),
        _ => Err(GatewayError::InvalidConfig(format!(
            "invalid simulator address: {address}"
        ))),
    }
}

struct SimPoint {
    tag: TagDefinition,
    waveform: Waveform,
    /// Last written value; once written, the point stops generating
    latched: Option<Value>,
}

/// Simulated device: generates values without any field link.
///
/// Raw values run through the same scale/offset path as the real adapters so
/// end-to-end behavior matches a genuine device.
pub struct SimulatorAdapter {
    device: String,
    points: Vec<SimPoint>,
    state: ConnectionState,
}

impl SimulatorAdapter {
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let points = config
            .tags
            .iter()
            .map(|tag| {
                Ok(SimPoint {
                    waveform: parse_waveform(&tag.address)?,
                    tag: tag.clone(),
                    latched: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            device: config.name.clone(),
            points,
            state: ConnectionState::Disconnected,
        })
    }

    fn generate_raw(waveform: &Waveform) -> f64 {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        match waveform {
            Waveform::Sine { min, max } => {
                let midpoint = min + (max - min) / 2.0;
                let amplitude = (max - min) / 2.0;
                // Sine wave: period 10 seconds
                let frequency = 0.1;
                midpoint
                    + amplitude * (since_epoch * frequency * 2.0 * std::f64::consts::PI).sin()
            }
            Waveform::Ramp { min, max } => {
                let period = 10.0;
                min + (max - min) * ((since_epoch % period) / period)
            }
            Waveform::Const(value) => *value,
            Waveform::Toggle => {
                if (since_epoch as u64) % 2 == 0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

#[async_trait]
impl ProtocolAdapter for SimulatorAdapter {
    async fn connect(&mut self) -> Result<()> {
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    async fn read_tags(&mut self) -> Result<HashMap<String, Value>> {
        if !self.state.is_connected() {
            return Err(GatewayError::Communication("not connected".to_string()));
        }

        let mut out = HashMap::with_capacity(self.points.len());
        for point in &self.points {
            let value = match &point.latched {
                Some(v) => v.clone(),
                None => {
                    let raw = Self::generate_raw(&point.waveform);
                    if point.tag.data_type.is_bool() {
                        Value::Bool(raw >= 0.5)
                    } else {
                        engineering_value(&point.tag, raw)
                    }
                }
            };
            out.insert(point.tag.name.clone(), value);
        }
        Ok(out)
    }

    async fn write_tag(&mut self, name: &str, value: Value) -> Result<()> {
        if !self.state.is_connected() {
            return Err(GatewayError::Communication("not connected".to_string()));
        }

        let point = self
            .points
            .iter_mut()
            .find(|p| p.tag.name == name)
            .ok_or_else(|| GatewayError::UnknownTag(name.to_string()))?;

        if point.tag.data_type.is_bool() {
            let b = value.as_bool().ok_or_else(|| {
                GatewayError::Rejected(format!("tag {name} expects a boolean value"))
            })?;
            point.latched = Some(Value::Bool(b));
        } else {
            // Round-trip through raw so the latched value reflects scaling
            let raw = raw_from_value(&point.tag, &value)?;
            point.latched = Some(engineering_value(&point.tag, raw));
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }

    fn protocol(&self) -> Protocol {
        Protocol::Simulator
    }
}
