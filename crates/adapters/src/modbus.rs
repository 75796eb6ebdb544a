use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;

use domain::{
    ConnectionState, DataType, DeviceConfig, GatewayError, Protocol, ProtocolAdapter, Result,
    TagDefinition, Value,
};

use crate::convert::{engineering_value, raw_from_value};

/// Registers a block read may skip over while still merging two points
const MAX_REGISTER_GAP: u16 = 8;
const MAX_BIT_GAP: u16 = 16;
/// Protocol limits per read request
const MAX_BLOCK_REGISTERS: u16 = 120;
const MAX_BLOCK_BITS: u16 = 1968;

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusConfig {
    #[serde(flatten)]
    pub transport: ModbusTransport,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Low-word-first ordering for 32/64-bit values
    #[serde(default)]
    pub word_swap: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ModbusTransport {
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    Rtu {
        serial_port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_parity")]
        parity: String,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_unit_id() -> u8 {
    1
}
fn default_timeout_ms() -> u64 {
    1000
}
fn default_tcp_port() -> u16 {
    502
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_parity() -> String {
    "None".to_string()
}
fn default_stop_bits() -> u8 {
    1
}

fn to_parity(parity: &str) -> Result<tokio_serial::Parity> {
    match parity.to_lowercase().as_str() {
        "n" | "none" => Ok(tokio_serial::Parity::None),
        "e" | "even" => Ok(tokio_serial::Parity::Even),
        "o" | "odd" => Ok(tokio_serial::Parity::Odd),
        _ => Err(GatewayError::InvalidConfig(format!(
            "invalid parity: {parity}"
        ))),
    }
}

fn to_stop_bits(stop_bits: u8) -> Result<tokio_serial::StopBits> {
    match stop_bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        _ => Err(GatewayError::InvalidConfig(format!(
            "invalid stop bits: {stop_bits}"
        ))),
    }
}

fn to_data_bits(data_bits: u8) -> Result<tokio_serial::DataBits> {
    match data_bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        _ => Err(GatewayError::InvalidConfig(format!(
            "invalid data bits: {data_bits}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum RegisterSpace {
    Coil,
    Discrete,
    Input,
    Holding,
}

impl RegisterSpace {
    fn is_bit(&self) -> bool {
        matches!(self, Self::Coil | Self::Discrete)
    }

    fn is_writable(&self) -> bool {
        matches!(self, Self::Coil | Self::Holding)
    }
}

/// Parse classic Modbus data-model notation (1/10001/30001/40001 bases, both
/// 5- and 6-digit forms) into a register space and zero-based address.
fn parse_address(address: &str) -> Result<(RegisterSpace, u16)> {
    let n: u32 = address.trim().parse().map_err(|_| {
        GatewayError::InvalidConfig(format!("invalid modbus address: {address}"))
    })?;

    let (space, base) = match n {
        1..=9999 => (RegisterSpace::Coil, 1),
        10001..=19999 => (RegisterSpace::Discrete, 10001),
        30001..=39999 => (RegisterSpace::Input, 30001),
        40001..=49999 => (RegisterSpace::Holding, 40001),
        100001..=165536 => (RegisterSpace::Discrete, 100001),
        300001..=365536 => (RegisterSpace::Input, 300001),
        400001..=465536 => (RegisterSpace::Holding, 400001),
        _ => {
            return Err(GatewayError::InvalidConfig(format!(
                "modbus address out of range: {address}"
            )));
        }
    };
    Ok((space, (n - base) as u16))
}

/// Width of one point in addressing units (bits for coil spaces, registers
/// for word spaces).
fn point_width(space: RegisterSpace, data_type: DataType) -> Result<u16> {
    match (space.is_bit(), data_type) {
        (true, DataType::Bool) => Ok(1),
        (true, _) => Err(GatewayError::InvalidConfig(format!(
            "{data_type:?} cannot live in a coil/discrete space"
        ))),
        (false, DataType::Bool) => Err(GatewayError::InvalidConfig(
            "bool tags must use coil or discrete addresses".to_string(),
        )),
        (false, DataType::Int16 | DataType::UInt16) => Ok(1),
        (false, DataType::Int32 | DataType::UInt32 | DataType::Float32) => Ok(2),
        (false, DataType::Float64) => Ok(4),
    }
}

#[derive(Debug, Clone)]
struct ModbusPoint {
    tag: TagDefinition,
    space: RegisterSpace,
    addr: u16,
    width: u16,
}

#[derive(Debug, Clone, PartialEq)]
struct Block {
    space: RegisterSpace,
    start: u16,
    count: u16,
    /// Indices into the point table
    points: Vec<usize>,
}

/// Batch contiguous (and near-contiguous) points of one register space into
/// single read requests. This is the protocol-specific optimization: a device
/// with 50 consecutive holding registers is polled in one round-trip.
fn plan_blocks(points: &[ModbusPoint]) -> Vec<Block> {
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by_key(|&i| (points[i].space, points[i].addr));

    let mut blocks: Vec<Block> = Vec::new();
    for i in order {
        let p = &points[i];
        let (max_gap, max_len) = if p.space.is_bit() {
            (MAX_BIT_GAP as u32, MAX_BLOCK_BITS as u32)
        } else {
            (MAX_REGISTER_GAP as u32, MAX_BLOCK_REGISTERS as u32)
        };

        // u32 arithmetic: top-of-range addresses (65535 + width) overflow u16
        let end = p.addr as u32 + p.width as u32;
        if let Some(last) = blocks.last_mut() {
            let merged_count = end.saturating_sub(last.start as u32);
            if last.space == p.space
                && (p.addr as u32) <= last.start as u32 + last.count as u32 + max_gap
                && merged_count <= max_len
            {
                last.count = last.count.max(merged_count as u16);
                last.points.push(i);
                continue;
            }
        }
        blocks.push(Block {
            space: p.space,
            start: p.addr,
            count: p.width,
            points: vec![i],
        });
    }
    blocks
}

/// Decode one numeric point from the registers of its block.
fn decode_registers(words: &[u16], data_type: DataType, word_swap: bool) -> Option<f64> {
    let pair = |w: &[u16]| -> u32 {
        if word_swap {
            ((w[1] as u32) << 16) | w[0] as u32
        } else {
            ((w[0] as u32) << 16) | w[1] as u32
        }
    };
    match data_type {
        DataType::UInt16 => Some(*words.first()? as f64),
        DataType::Int16 => Some(*words.first()? as i16 as f64),
        DataType::UInt32 => Some(pair(words.get(..2)?) as f64),
        DataType::Int32 => Some(pair(words.get(..2)?) as i32 as f64),
        DataType::Float32 => Some(f32::from_bits(pair(words.get(..2)?)) as f64),
        DataType::Float64 => {
            let w = words.get(..4)?;
            // pair() already honors word_swap; only the half order flips
            let (hi, lo) = if word_swap {
                (pair(&w[2..4]), pair(&w[..2]))
            } else {
                (pair(&w[..2]), pair(&w[2..4]))
            };
            Some(f64::from_bits(((hi as u64) << 32) | lo as u64))
        }
        DataType::Bool => None,
    }
}

/// Encode a raw numeric value into registers for a write.
fn encode_registers(raw: f64, data_type: DataType, word_swap: bool) -> Result<Vec<u16>> {
    let split = |v: u32| -> Vec<u16> {
        let hi = (v >> 16) as u16;
        let lo = v as u16;
        if word_swap { vec![lo, hi] } else { vec![hi, lo] }
    };
    let words = match data_type {
        DataType::UInt16 => vec![raw.round() as u16],
        DataType::Int16 => vec![raw.round() as i16 as u16],
        DataType::UInt32 => split(raw.round() as u32),
        DataType::Int32 => split(raw.round() as i32 as u32),
        DataType::Float32 => split((raw as f32).to_bits()),
        DataType::Float64 => {
            let bits = raw.to_bits();
            let hi = split((bits >> 32) as u32);
            let lo = split(bits as u32);
            if word_swap {
                [lo, hi].concat()
            } else {
                [hi, lo].concat()
            }
        }
        DataType::Bool => {
            return Err(GatewayError::InvalidConfig(
                "bool values are written as coils, not registers".to_string(),
            ));
        }
    };
    Ok(words)
}

/// Modbus TCP/RTU adapter
pub struct ModbusAdapter {
    device: String,
    config: ModbusConfig,
    points: Vec<ModbusPoint>,
    blocks: Vec<Block>,
    ctx: Option<Context>,
    state: ConnectionState,
}

impl ModbusAdapter {
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let modbus_config: ModbusConfig =
            serde_json::from_value(config.connection.clone()).map_err(|e| {
                GatewayError::InvalidConfig(format!(
                    "device {}: invalid modbus connection: {e}",
                    config.name
                ))
            })?;

        let points = config
            .tags
            .iter()
            .map(|tag| {
                let (space, addr) = parse_address(&tag.address)?;
                let width = point_width(space, tag.data_type)?;
                Ok(ModbusPoint {
                    tag: tag.clone(),
                    space,
                    addr,
                    width,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let blocks = plan_blocks(&points);

        Ok(Self {
            device: config.name.clone(),
            config: modbus_config,
            points,
            blocks,
            ctx: None,
            state: ConnectionState::Disconnected,
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn comm_failure(&mut self, context: &str, detail: impl std::fmt::Display) -> GatewayError {
        self.ctx = None;
        self.state = ConnectionState::Faulted;
        GatewayError::Communication(format!("{}: {context}: {detail}", self.device))
    }
}

#[async_trait]
impl ProtocolAdapter for ModbusAdapter {
    async fn connect(&mut self) -> Result<()> {
        if self.ctx.is_some() {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        let slave = Slave(self.config.unit_id);

        let ctx = match &self.config.transport {
            ModbusTransport::Tcp { host, port } => {
                let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
                    self.state = ConnectionState::Disconnected;
                    GatewayError::InvalidConfig(format!("invalid modbus endpoint {host}:{port}: {e}"))
                })?;
                match tokio::time::timeout(self.timeout(), tcp::connect_slave(addr, slave)).await {
                    Ok(Ok(ctx)) => ctx,
                    Ok(Err(e)) => {
                        self.state = ConnectionState::Disconnected;
                        return Err(GatewayError::Connection(format!(
                            "{}: tcp connect to {addr} failed: {e}",
                            self.device
                        )));
                    }
                    Err(_) => {
                        self.state = ConnectionState::Disconnected;
                        return Err(GatewayError::Connection(format!(
                            "{}: tcp connect to {addr} timed out",
                            self.device
                        )));
                    }
                }
            }
            ModbusTransport::Rtu {
                serial_port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                // Normalize port name for Windows
                let port_name = if cfg!(target_os = "windows") && !serial_port.starts_with(r"\\.\")
                {
                    format!(r"\\.\{serial_port}")
                } else {
                    serial_port.clone()
                };

                let builder = tokio_serial::new(&port_name, *baud_rate)
                    .data_bits(to_data_bits(*data_bits)?)
                    .parity(to_parity(parity)?)
                    .stop_bits(to_stop_bits(*stop_bits)?)
                    .timeout(self.timeout());

                let port = SerialStream::open(&builder).map_err(|e| {
                    self.state = ConnectionState::Disconnected;
                    GatewayError::Connection(format!(
                        "{}: failed to open serial port {port_name}: {e}",
                        self.device
                    ))
                })?;
                rtu::attach_slave(port, slave)
            }
        };

        self.ctx = Some(ctx);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn disconnect(&mut self) {
        // Dropping the context closes the socket/port
        self.ctx = None;
        self.state = ConnectionState::Disconnected;
    }

    async fn read_tags(&mut self) -> Result<HashMap<String, Value>> {
        if self.ctx.is_none() {
            return Err(GatewayError::Communication(format!(
                "{}: not connected",
                self.device
            )));
        }

        let timeout = self.timeout();
        let mut out = HashMap::with_capacity(self.points.len());

        for block in self.blocks.clone() {
            // Bit and register spaces come back as different payloads
            if block.space.is_bit() {
                let Some(ctx) = self.ctx.as_mut() else {
                    return Err(GatewayError::Communication(format!(
                        "{}: not connected",
                        self.device
                    )));
                };
                let fut = match block.space {
                    RegisterSpace::Coil => ctx.read_coils(block.start, block.count),
                    _ => ctx.read_discrete_inputs(block.start, block.count),
                };
                let bits = match tokio::time::timeout(timeout, fut).await {
                    Err(_) => return Err(self.comm_failure("read", "request timed out")),
                    Ok(Err(e)) => return Err(self.comm_failure("read", e)),
                    Ok(Ok(Err(exception))) => {
                        tracing::warn!(
                            device = %self.device,
                            start = block.start,
                            "modbus exception on bit block, omitting tags: {exception}"
                        );
                        continue;
                    }
                    Ok(Ok(Ok(bits))) => bits,
                };
                for &i in &block.points {
                    let p = &self.points[i];
                    if let Some(&bit) = bits.get((p.addr - block.start) as usize) {
                        out.insert(p.tag.name.clone(), Value::Bool(bit));
                    }
                }
            } else {
                let Some(ctx) = self.ctx.as_mut() else {
                    return Err(GatewayError::Communication(format!(
                        "{}: not connected",
                        self.device
                    )));
                };
                let fut = match block.space {
                    RegisterSpace::Input => ctx.read_input_registers(block.start, block.count),
                    _ => ctx.read_holding_registers(block.start, block.count),
                };
                let words = match tokio::time::timeout(timeout, fut).await {
                    Err(_) => return Err(self.comm_failure("read", "request timed out")),
                    Ok(Err(e)) => return Err(self.comm_failure("read", e)),
                    Ok(Ok(Err(exception))) => {
                        tracing::warn!(
                            device = %self.device,
                            start = block.start,
                            "modbus exception on register block, omitting tags: {exception}"
                        );
                        continue;
                    }
                    Ok(Ok(Ok(words))) => words,
                };
                for &i in &block.points {
                    let p = &self.points[i];
                    let offset = (p.addr - block.start) as usize;
                    let Some(slice) = words.get(offset..) else {
                        continue;
                    };
                    if let Some(raw) = decode_registers(slice, p.tag.data_type, self.config.word_swap)
                    {
                        out.insert(p.tag.name.clone(), engineering_value(&p.tag, raw));
                    }
                }
            }
        }

        Ok(out)
    }

    async fn write_tag(&mut self, name: &str, value: Value) -> Result<()> {
        let point = self
            .points
            .iter()
            .find(|p| p.tag.name == name)
            .ok_or_else(|| GatewayError::UnknownTag(name.to_string()))?
            .clone();

        if self.ctx.is_none() {
            return Err(GatewayError::Communication(format!(
                "{}: not connected",
                self.device
            )));
        }
        if !point.space.is_writable() {
            return Err(GatewayError::Rejected(format!(
                "tag {name} lives in a read-only register space"
            )));
        }

        let timeout = self.timeout();
        let result = if point.space == RegisterSpace::Coil {
            let bit = value.as_bool().ok_or_else(|| {
                GatewayError::Rejected(format!("tag {name} expects a boolean value"))
            })?;
            let Some(ctx) = self.ctx.as_mut() else {
                return Err(GatewayError::Communication(format!(
                    "{}: not connected",
                    self.device
                )));
            };
            tokio::time::timeout(timeout, ctx.write_single_coil(point.addr, bit)).await
        } else {
            let raw = raw_from_value(&point.tag, &value)?;
            let words = encode_registers(raw, point.tag.data_type, self.config.word_swap)?;
            let Some(ctx) = self.ctx.as_mut() else {
                return Err(GatewayError::Communication(format!(
                    "{}: not connected",
                    self.device
                )));
            };
            if words.len() == 1 {
                tokio::time::timeout(timeout, ctx.write_single_register(point.addr, words[0])).await
            } else {
                tokio::time::timeout(timeout, ctx.write_multiple_registers(point.addr, &words))
                    .await
            }
        };

        match result {
            Err(_) => Err(self.comm_failure("write", "request timed out")),
            Ok(Err(e)) => Err(self.comm_failure("write", e)),
            Ok(Ok(Err(exception))) => Err(GatewayError::Rejected(format!(
                "device refused write to {name}: {exception}"
            ))),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }

    fn protocol(&self) -> Protocol {
        Protocol::Modbus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &str, address: &str, data_type: DataType) -> TagDefinition {
        TagDefinition {
            name: name.to_string(),
            address: address.to_string(),
            data_type,
            scale: 1.0,
            offset: 0.0,
        }
    }

    fn point(name: &str, address: &str, data_type: DataType) -> ModbusPoint {
        let t = tag(name, address, data_type);
        let (space, addr) = parse_address(&t.address).unwrap();
        let width = point_width(space, data_type).unwrap();
        ModbusPoint {
            tag: t,
            space,
            addr,
            width,
        }
    }

    #[test]
    fn test_parse_classic_addresses() {
        assert_eq!(parse_address("1").unwrap(), (RegisterSpace::Coil, 0));
        assert_eq!(parse_address("10001").unwrap(), (RegisterSpace::Discrete, 0));
        assert_eq!(parse_address("30005").unwrap(), (RegisterSpace::Input, 4));
        assert_eq!(parse_address("40001").unwrap(), (RegisterSpace::Holding, 0));
        assert_eq!(
            parse_address("400123").unwrap(),
            (RegisterSpace::Holding, 122)
        );
    }

    #[test]
    fn test_parse_invalid_addresses() {
        assert!(parse_address("D100").is_err());
        assert!(parse_address("0").is_err());
        assert!(parse_address("25000").is_err());
    }

    #[test]
    fn test_bool_requires_bit_space() {
        assert!(point_width(RegisterSpace::Holding, DataType::Bool).is_err());
        assert!(point_width(RegisterSpace::Coil, DataType::Int16).is_err());
        assert_eq!(point_width(RegisterSpace::Coil, DataType::Bool).unwrap(), 1);
        assert_eq!(
            point_width(RegisterSpace::Holding, DataType::Float32).unwrap(),
            2
        );
    }

    #[test]
    fn test_plan_merges_contiguous_registers() {
        let points = vec![
            point("a", "40001", DataType::UInt16),
            point("b", "40002", DataType::UInt16),
            point("c", "40005", DataType::Float32),
        ];
        let blocks = plan_blocks(&points);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, 0);
        assert_eq!(blocks[0].count, 6);
        assert_eq!(blocks[0].points, vec![0, 1, 2]);
    }

    #[test]
    fn test_plan_splits_on_large_gap() {
        let points = vec![
            point("a", "40001", DataType::UInt16),
            point("b", "40500", DataType::UInt16),
        ];
        let blocks = plan_blocks(&points);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn test_plan_handles_top_of_range_addresses() {
        let points = vec![
            point("a", "465535", DataType::UInt16),
            point("b", "465536", DataType::UInt16),
        ];
        let blocks = plan_blocks(&points);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, 65534);
        assert_eq!(blocks[0].count, 2);
    }

    #[test]
    fn test_plan_separates_spaces() {
        let points = vec![
            point("a", "40001", DataType::UInt16),
            point("b", "1", DataType::Bool),
        ];
        let blocks = plan_blocks(&points);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn test_decode_int16() {
        assert_eq!(
            decode_registers(&[0xFFFF], DataType::Int16, false),
            Some(-1.0)
        );
        assert_eq!(
            decode_registers(&[0xFFFF], DataType::UInt16, false),
            Some(65535.0)
        );
    }

    #[test]
    fn test_decode_uint32_word_order() {
        let words = [0x0001, 0x0002];
        assert_eq!(
            decode_registers(&words, DataType::UInt32, false),
            Some(65538.0)
        );
        assert_eq!(
            decode_registers(&words, DataType::UInt32, true),
            Some(131073.0)
        );
    }

    #[test]
    fn test_decode_float32_round_trip() {
        let bits = 150.5f32.to_bits();
        let words = [(bits >> 16) as u16, bits as u16];
        assert_eq!(
            decode_registers(&words, DataType::Float32, false),
            Some(150.5)
        );

        let encoded = encode_registers(150.5, DataType::Float32, false).unwrap();
        assert_eq!(encoded, words);
    }

    #[test]
    fn test_encode_decode_float64() {
        for swap in [false, true] {
            let words = encode_registers(-1234.5678, DataType::Float64, swap).unwrap();
            assert_eq!(words.len(), 4);
            assert_eq!(
                decode_registers(&words, DataType::Float64, swap),
                Some(-1234.5678)
            );
        }
    }

    #[test]
    fn test_float64_word_swap_layout() {
        // 1.0f64 = 0x3FF0_0000_0000_0000
        assert_eq!(
            decode_registers(&[0x3FF0, 0x0000, 0x0000, 0x0000], DataType::Float64, false),
            Some(1.0)
        );
        // Fully swapped: low word of the low half first
        assert_eq!(
            decode_registers(&[0x0000, 0x0000, 0x0000, 0x3FF0], DataType::Float64, true),
            Some(1.0)
        );
        assert_eq!(
            encode_registers(1.0, DataType::Float64, true).unwrap(),
            vec![0x0000, 0x0000, 0x0000, 0x3FF0]
        );
    }

    #[test]
    fn test_decode_short_slice_is_none() {
        assert_eq!(decode_registers(&[1], DataType::UInt32, false), None);
        assert_eq!(decode_registers(&[], DataType::UInt16, false), None);
    }

    #[test]
    fn test_config_parses_tcp_and_rtu() {
        let tcp: ModbusConfig =
            serde_json::from_value(serde_json::json!({"host": "10.0.0.5"})).unwrap();
        assert!(matches!(tcp.transport, ModbusTransport::Tcp { port: 502, .. }));
        assert_eq!(tcp.unit_id, 1);

        let rtu: ModbusConfig = serde_json::from_value(
            serde_json::json!({"serial_port": "/dev/ttyUSB0", "baud_rate": 19200, "unit_id": 3}),
        )
        .unwrap();
        assert!(matches!(rtu.transport, ModbusTransport::Rtu { .. }));
        assert_eq!(rtu.unit_id, 3);
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_safe() {
        let config: DeviceConfig = serde_json::from_value(serde_json::json!({
            "name": "plc-1",
            "protocol": "modbus",
            "connection": {"host": "10.0.0.5"},
            "tags": [{"name": "speed", "address": "40001", "data_type": "uint16"}]
        }))
        .unwrap();
        let mut adapter = ModbusAdapter::from_config(&config).unwrap();
        adapter.disconnect().await;
        adapter.disconnect().await;
        assert!(!adapter.is_connected());
    }

    // The adapter (and the tokio-modbus context inside it) must be movable
    // into the acquisition task that will own it.
    #[tokio::test]
    async fn test_adapter_moves_into_owning_task() {
        let config: DeviceConfig = serde_json::from_value(serde_json::json!({
            "name": "plc-1",
            "protocol": "modbus",
            "connection": {"host": "10.0.0.5"},
            "tags": [{"name": "speed", "address": "40001", "data_type": "uint16"}]
        }))
        .unwrap();
        let mut adapter: Box<dyn ProtocolAdapter> =
            Box::new(ModbusAdapter::from_config(&config).unwrap());
        let handle = tokio::spawn(async move {
            adapter.disconnect().await;
            adapter.protocol()
        });
        assert_eq!(handle.await.unwrap(), Protocol::Modbus);
    }
}
