//! MELSEC device/register adapter (Mitsubishi Q/L/iQ controllers, 3E binary
//! frame).
//!
//! Tags address PLC devices by code and number: word devices (`D200`, `W1F0`,
//! `R100`) and bit devices (`M64`, `B20`, `X1F`, `Y0`). Bit devices are read
//! in word units, sixteen points per word, so a scan of 32 relays costs one
//! round-trip. The framing lives in [`Mc3eSession`] behind [`McClient`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use domain::{
    ConnectionState, DeviceConfig, GatewayError, Protocol, ProtocolAdapter, Result, TagDefinition,
    Value,
};

use crate::convert::{
    decode_words_low_first, encode_words_low_first, engineering_value, raw_from_value, word_count,
};
use crate::plan::{Span, plan_spans};

const MAX_WORD_GAP: u32 = 8;
const MAX_SPAN_WORDS: u32 = 480;

#[derive(Debug, Clone, Deserialize)]
pub struct MelsecConfig {
    pub host: String,
    #[serde(default = "default_melsec_port")]
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_melsec_port() -> u16 {
    5007
}
fn default_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum McDevice {
    D,
    W,
    R,
    M,
    B,
    X,
    Y,
}

impl McDevice {
    fn code(&self) -> u8 {
        match self {
            Self::D => 0xA8,
            Self::W => 0xB4,
            Self::R => 0xAF,
            Self::M => 0x90,
            Self::B => 0xA0,
            Self::X => 0x9C,
            Self::Y => 0x9D,
        }
    }

    fn is_bit_device(&self) -> bool {
        matches!(self, Self::M | Self::B | Self::X | Self::Y)
    }

    fn is_hex_addressed(&self) -> bool {
        matches!(self, Self::W | Self::B | Self::X | Self::Y)
    }
}

fn parse_address(address: &str) -> Result<(McDevice, u32)> {
    let invalid = || GatewayError::InvalidConfig(format!("invalid MELSEC address: {address}"));
    let s = address.trim();
    let (device, rest) = match s.chars().next().ok_or_else(invalid)? {
        'D' => (McDevice::D, &s[1..]),
        'W' => (McDevice::W, &s[1..]),
        'R' => (McDevice::R, &s[1..]),
        'M' => (McDevice::M, &s[1..]),
        'B' => (McDevice::B, &s[1..]),
        'X' => (McDevice::X, &s[1..]),
        'Y' => (McDevice::Y, &s[1..]),
        _ => return Err(invalid()),
    };
    if rest.is_empty() {
        return Err(invalid());
    }
    let number = if device.is_hex_addressed() {
        u32::from_str_radix(rest, 16).map_err(|_| invalid())?
    } else {
        rest.parse().map_err(|_| invalid())?
    };
    if number > 0x00FF_FFFF {
        return Err(invalid());
    }
    Ok((device, number))
}

/// Vendor-codec seam for MC protocol implementations.
///
/// For bit devices, `head` is a device number on a 16-point boundary and each
/// returned word packs sixteen consecutive points.
#[async_trait]
pub trait McClient: Send + Sync {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self);
    async fn read_words(&mut self, device: u8, head: u32, count: u16) -> Result<Vec<u16>>;
    async fn write_words(&mut self, device: u8, head: u32, words: &[u16]) -> Result<()>;
    async fn write_bit(&mut self, device: u8, head: u32, on: bool) -> Result<()>;
}

/// MC protocol QnA-compatible 3E binary frame session over TCP.
pub struct Mc3eSession {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl Mc3eSession {
    pub fn new(config: &MelsecConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: Duration::from_millis(config.timeout_ms),
            stream: None,
        }
    }

    fn comm_failure(&mut self, detail: impl std::fmt::Display) -> GatewayError {
        self.stream = None;
        GatewayError::Communication(format!("MELSEC {}:{}: {detail}", self.host, self.port))
    }

    /// Exchange one 3E request; returns the response data after the end code.
    async fn request(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut frame = BytesMut::with_capacity(11 + command.len());
        frame.put_slice(&[0x50, 0x00]); // subheader
        frame.put_u8(0x00); // network
        frame.put_u8(0xFF); // PC
        frame.put_u16_le(0x03FF); // request destination module
        frame.put_u8(0x00); // station
        frame.put_u16_le((2 + command.len()) as u16); // monitoring timer + command
        frame.put_u16_le(0x0010); // monitoring timer (x250ms)
        frame.put_slice(command);

        let timeout = self.timeout;
        let io = async {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| std::io::Error::other("not connected"))?;
            stream.write_all(&frame).await?;

            let mut head = [0u8; 9];
            stream.read_exact(&mut head).await?;
            if head[0] != 0xD0 || head[1] != 0x00 {
                return Err(std::io::Error::other("bad 3E response subheader"));
            }
            let len = u16::from_le_bytes([head[7], head[8]]) as usize;
            if len < 2 || len > 4096 {
                return Err(std::io::Error::other(format!("bad 3E response length {len}")));
            }
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            Ok::<Vec<u8>, std::io::Error>(body)
        };

        let body = match tokio::time::timeout(timeout, io).await {
            Err(_) => return Err(self.comm_failure("request timed out")),
            Ok(Err(e)) => return Err(self.comm_failure(e)),
            Ok(Ok(body)) => body,
        };

        let end_code = u16::from_le_bytes([body[0], body[1]]);
        if end_code != 0 {
            return Err(GatewayError::Rejected(format!(
                "MELSEC end code {end_code:#06x}"
            )));
        }
        Ok(body[2..].to_vec())
    }

    fn device_spec(head: u32, device: u8) -> [u8; 4] {
        [head as u8, (head >> 8) as u8, (head >> 16) as u8, device]
    }
}

#[async_trait]
impl McClient for Mc3eSession {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let endpoint = format!("{}:{}", self.host, self.port);
        let addr: SocketAddr = endpoint.parse().map_err(|e| {
            GatewayError::InvalidConfig(format!("invalid MELSEC endpoint {endpoint}: {e}"))
        })?;

        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Err(_) => Err(GatewayError::Connection(format!(
                "MELSEC connect to {endpoint} timed out"
            ))),
            Ok(Err(e)) => Err(GatewayError::Connection(format!(
                "MELSEC connect to {endpoint} failed: {e}"
            ))),
            Ok(Ok(stream)) => {
                self.stream = Some(stream);
                Ok(())
            }
        }
    }

    async fn close(&mut self) {
        self.stream = None;
    }

    async fn read_words(&mut self, device: u8, head: u32, count: u16) -> Result<Vec<u16>> {
        let mut command = BytesMut::with_capacity(10);
        command.put_u16_le(0x0401); // batch read
        command.put_u16_le(0x0000); // word units
        command.put_slice(&Self::device_spec(head, device));
        command.put_u16_le(count);

        let data = self.request(&command).await?;
        if data.len() < count as usize * 2 {
            return Err(self.comm_failure(format!(
                "short read: {} bytes for {count} words",
                data.len()
            )));
        }
        Ok(data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    async fn write_words(&mut self, device: u8, head: u32, words: &[u16]) -> Result<()> {
        let mut command = BytesMut::with_capacity(10 + words.len() * 2);
        command.put_u16_le(0x1401); // batch write
        command.put_u16_le(0x0000); // word units
        command.put_slice(&Self::device_spec(head, device));
        command.put_u16_le(words.len() as u16);
        for w in words {
            command.put_u16_le(*w);
        }
        self.request(&command).await?;
        Ok(())
    }

    async fn write_bit(&mut self, device: u8, head: u32, on: bool) -> Result<()> {
        let mut command = BytesMut::with_capacity(11);
        command.put_u16_le(0x1401); // batch write
        command.put_u16_le(0x0001); // bit units
        command.put_slice(&Self::device_spec(head, device));
        command.put_u16_le(1);
        // One point per nibble, high nibble first
        command.put_u8(if on { 0x10 } else { 0x00 });
        self.request(&command).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MelsecPoint {
    tag: TagDefinition,
    device: McDevice,
    number: u32,
    /// First word-unit this point occupies (for bit devices: number / 16)
    word_index: u32,
    width: u16,
}

/// MELSEC device/register adapter
pub struct MelsecAdapter {
    device_name: String,
    points: Vec<MelsecPoint>,
    spans: Vec<Span<McDevice>>,
    client: Box<dyn McClient>,
    state: ConnectionState,
}

impl MelsecAdapter {
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let melsec_config: MelsecConfig = serde_json::from_value(config.connection.clone())
            .map_err(|e| {
                GatewayError::InvalidConfig(format!(
                    "device {}: invalid MELSEC connection: {e}",
                    config.name
                ))
            })?;
        Self::with_client(
            config.name.clone(),
            &config.tags,
            Box::new(Mc3eSession::new(&melsec_config)),
        )
    }

    /// Build an adapter around any `McClient` (the test seam).
    pub fn with_client(
        device_name: impl Into<String>,
        tags: &[TagDefinition],
        client: Box<dyn McClient>,
    ) -> Result<Self> {
        let points = tags
            .iter()
            .map(|tag| {
                let (device, number) = parse_address(&tag.address)?;
                match (device.is_bit_device(), tag.data_type.is_bool()) {
                    (true, false) => Err(GatewayError::InvalidConfig(format!(
                        "tag {}: numeric types need a word device",
                        tag.name
                    ))),
                    (false, true) => Err(GatewayError::InvalidConfig(format!(
                        "tag {}: bool tags need a bit device",
                        tag.name
                    ))),
                    (true, true) => Ok(MelsecPoint {
                        tag: tag.clone(),
                        device,
                        number,
                        word_index: number / 16,
                        width: 1,
                    }),
                    (false, false) => Ok(MelsecPoint {
                        tag: tag.clone(),
                        device,
                        number,
                        word_index: number,
                        width: word_count(tag.data_type),
                    }),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let items: Vec<(McDevice, u32, u16)> = points
            .iter()
            .map(|p| (p.device, p.word_index, p.width))
            .collect();
        let spans = plan_spans(&items, MAX_WORD_GAP, MAX_SPAN_WORDS);

        Ok(Self {
            device_name: device_name.into(),
            points,
            spans,
            client,
            state: ConnectionState::Disconnected,
        })
    }
}

#[async_trait]
impl ProtocolAdapter for MelsecAdapter {
    async fn connect(&mut self) -> Result<()> {
        if self.state.is_connected() {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        match self.client.open().await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.client.close().await;
        self.state = ConnectionState::Disconnected;
    }

    async fn read_tags(&mut self) -> Result<HashMap<String, Value>> {
        if !self.state.is_connected() {
            return Err(GatewayError::Communication(format!(
                "{}: not connected",
                self.device_name
            )));
        }

        let mut out = HashMap::with_capacity(self.points.len());
        for span in &self.spans {
            // Bit devices: heads are word-unit indices, the wire wants points
            let head = if span.key.is_bit_device() {
                span.start * 16
            } else {
                span.start
            };
            let words = match self.client.read_words(span.key.code(), head, span.count).await {
                Ok(words) => words,
                Err(GatewayError::Rejected(reason)) => {
                    tracing::warn!(
                        device = %self.device_name,
                        head,
                        "MELSEC span rejected, omitting tags: {reason}"
                    );
                    continue;
                }
                Err(e) => {
                    self.state = ConnectionState::Faulted;
                    return Err(e);
                }
            };

            for &i in &span.points {
                let p = &self.points[i];
                let offset = (p.word_index - span.start) as usize;
                let Some(slice) = words.get(offset..) else {
                    continue;
                };
                if p.device.is_bit_device() {
                    if let Some(&word) = slice.first() {
                        let bit = (p.number % 16) as u16;
                        out.insert(p.tag.name.clone(), Value::Bool((word >> bit) & 1 == 1));
                    }
                } else if let Some(raw) = decode_words_low_first(slice, p.tag.data_type) {
                    out.insert(p.tag.name.clone(), engineering_value(&p.tag, raw));
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

        if !self.state.is_connected() {
            return Err(GatewayError::Communication(format!(
                "{}: not connected",
                self.device_name
            )));
        }

        let result = if point.device.is_bit_device() {
            let on = value.as_bool().ok_or_else(|| {
                GatewayError::Rejected(format!("tag {name} expects a boolean value"))
            })?;
            self.client
                .write_bit(point.device.code(), point.number, on)
                .await
        } else {
            let raw = raw_from_value(&point.tag, &value)?;
            let words = encode_words_low_first(raw, point.tag.data_type)?;
            self.client
                .write_words(point.device.code(), point.number, &words)
                .await
        };

        match result {
            Err(e @ GatewayError::Communication(_)) => {
                self.state = ConnectionState::Faulted;
                Err(e)
            }
            other => other,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }

    fn protocol(&self) -> Protocol {
        Protocol::Melsec
    }
}
