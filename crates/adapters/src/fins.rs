//! FINS memory-area adapter (Omron CS/CJ controllers).
//!
//! Tags address PLC memory by area and word offset (`D100`, `W12`, `H7`,
//! plain CIO `100`), optionally with a bit suffix (`D100.05`). The adapter
//! merges word ranges per area into batched reads; the wire framing lives in
//! [`FinsTcpSession`] behind the [`FinsClient`] seam.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
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
const MAX_SPAN_WORDS: u32 = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct FinsConfig {
    pub host: String,
    #[serde(default = "default_fins_port")]
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_fins_port() -> u16 {
    9600
}
fn default_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum FinsArea {
    Cio,
    Work,
    Holding,
    Dm,
}

impl FinsArea {
    /// Word-access area code
    fn word_code(&self) -> u8 {
        match self {
            Self::Cio => 0xB0,
            Self::Work => 0xB1,
            Self::Holding => 0xB2,
            Self::Dm => 0x82,
        }
    }

    /// Bit-access area code
    fn bit_code(&self) -> u8 {
        match self {
            Self::Cio => 0x30,
            Self::Work => 0x31,
            Self::Holding => 0x32,
            Self::Dm => 0x02,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FinsAddress {
    area: FinsArea,
    word: u16,
    bit: Option<u8>,
}

fn parse_address(address: &str) -> Result<FinsAddress> {
    let invalid = || GatewayError::InvalidConfig(format!("invalid FINS address: {address}"));
    let s = address.trim();

    let (area, rest) = match s.chars().next().ok_or_else(invalid)? {
        'D' => (FinsArea::Dm, &s[1..]),
        'W' => (FinsArea::Work, &s[1..]),
        'H' => (FinsArea::Holding, &s[1..]),
        c if c.is_ascii_digit() => (FinsArea::Cio, s),
        _ => return Err(invalid()),
    };

    let (word_str, bit) = match rest.split_once('.') {
        Some((w, b)) => {
            let bit: u8 = b.parse().map_err(|_| invalid())?;
            if bit > 15 {
                return Err(invalid());
            }
            (w, Some(bit))
        }
        None => (rest, None),
    };

    let word: u16 = word_str.parse().map_err(|_| invalid())?;
    Ok(FinsAddress { area, word, bit })
}

/// Vendor-codec seam: the four primitive memory-area operations the adapter
/// needs from a FINS implementation.
#[async_trait]
pub trait FinsClient: Send + Sync {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self);
    /// Read `count` words; returns big-endian bytes, two per word.
    async fn read_words(&mut self, area: u8, start: u16, count: u16) -> Result<Vec<u8>>;
    async fn write_words(&mut self, area: u8, start: u16, data: &[u8]) -> Result<()>;
    async fn write_bit(&mut self, area: u8, word: u16, bit: u8, on: bool) -> Result<()>;
}

/// First two payload bytes, if the device sent them.
fn end_code(response: &[u8]) -> Option<u16> {
    let bytes = response.get(..2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// FINS/TCP session: node-address handshake plus framed command exchange.
pub struct FinsTcpSession {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
    client_node: u8,
    server_node: u8,
    sid: u8,
}

impl FinsTcpSession {
    pub fn new(config: &FinsConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: Duration::from_millis(config.timeout_ms),
            stream: None,
            client_node: 0,
            server_node: 0,
            sid: 0,
        }
    }

    fn comm_failure(&mut self, detail: impl std::fmt::Display) -> GatewayError {
        self.stream = None;
        GatewayError::Communication(format!("FINS {}:{}: {detail}", self.host, self.port))
    }

    /// Exchange one FINS command, returning the response payload after the
    /// command code (end code + data).
    async fn request(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.sid = self.sid.wrapping_add(1);
        let mut frame = BytesMut::with_capacity(26 + command.len());
        // FINS/TCP header: magic, length, command 2 (frame send), error 0
        frame.put_slice(b"FINS");
        frame.put_u32(8 + 10 + command.len() as u32);
        frame.put_u32(2);
        frame.put_u32(0);
        // FINS command frame header
        frame.put_u8(0x80); // ICF: command, response required
        frame.put_u8(0x00); // RSV
        frame.put_u8(0x02); // GCT
        frame.put_u8(0x00); // DNA
        frame.put_u8(self.server_node); // DA1
        frame.put_u8(0x00); // DA2
        frame.put_u8(0x00); // SNA
        frame.put_u8(self.client_node); // SA1
        frame.put_u8(0x00); // SA2
        frame.put_u8(self.sid);
        frame.put_slice(command);

        let timeout = self.timeout;
        let io = async {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| std::io::Error::other("not connected"))?;
            stream.write_all(&frame).await?;

            let mut head = [0u8; 8];
            stream.read_exact(&mut head).await?;
            if &head[..4] != b"FINS" {
                return Err(std::io::Error::other("bad FINS/TCP magic"));
            }
            let len = u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize;
            // Command/error words, FINS header, echoed command code, end code
            if len < 8 + 10 + 2 + 2 || len > 4096 {
                return Err(std::io::Error::other(format!("bad FINS/TCP length {len}")));
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

        let mut buf = &body[..];
        let tcp_command = buf.get_u32();
        let tcp_error = buf.get_u32();
        if tcp_command != 2 || tcp_error != 0 {
            return Err(self.comm_failure(format!("FINS/TCP error {tcp_error:#x}")));
        }
        buf.advance(10); // FINS response frame header
        if buf.remaining() < 2 {
            return Err(self.comm_failure("short FINS response"));
        }
        buf.advance(2); // echoed command code
        Ok(buf.to_vec())
    }
}

#[async_trait]
impl FinsClient for FinsTcpSession {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let endpoint = format!("{}:{}", self.host, self.port);
        let addr: SocketAddr = endpoint
            .parse()
            .map_err(|e| GatewayError::InvalidConfig(format!("invalid FINS endpoint {endpoint}: {e}")))?;

        let connect = async {
            let mut stream = TcpStream::connect(addr).await?;

            // Node address handshake: client node 0 requests auto-assignment
            let mut hello = BytesMut::with_capacity(20);
            hello.put_slice(b"FINS");
            hello.put_u32(12);
            hello.put_u32(0);
            hello.put_u32(0);
            hello.put_u32(0);
            stream.write_all(&hello).await?;

            let mut reply = [0u8; 24];
            stream.read_exact(&mut reply).await?;
            if &reply[..4] != b"FINS" {
                return Err(std::io::Error::other("bad FINS/TCP magic"));
            }
            let error = u32::from_be_bytes([reply[12], reply[13], reply[14], reply[15]]);
            if error != 0 {
                return Err(std::io::Error::other(format!("handshake error {error:#x}")));
            }
            let client_node = reply[19];
            let server_node = reply[23];
            Ok::<(TcpStream, u8, u8), std::io::Error>((stream, client_node, server_node))
        };

        match tokio::time::timeout(self.timeout, connect).await {
            Err(_) => Err(GatewayError::Connection(format!(
                "FINS connect to {endpoint} timed out"
            ))),
            Ok(Err(e)) => Err(GatewayError::Connection(format!(
                "FINS connect to {endpoint} failed: {e}"
            ))),
            Ok(Ok((stream, client_node, server_node))) => {
                self.stream = Some(stream);
                self.client_node = client_node;
                self.server_node = server_node;
                Ok(())
            }
        }
    }

    async fn close(&mut self) {
        self.stream = None;
    }

    async fn read_words(&mut self, area: u8, start: u16, count: u16) -> Result<Vec<u8>> {
        let command = [
            0x01,
            0x01,
            area,
            (start >> 8) as u8,
            start as u8,
            0x00,
            (count >> 8) as u8,
            count as u8,
        ];
        let response = self.request(&command).await?;
        let code = end_code(&response).ok_or_else(|| self.comm_failure("short FINS response"))?;
        if code != 0 {
            return Err(GatewayError::Rejected(format!("FINS end code {code:#06x}")));
        }
        Ok(response[2..].to_vec())
    }

    async fn write_words(&mut self, area: u8, start: u16, data: &[u8]) -> Result<()> {
        let count = (data.len() / 2) as u16;
        let mut command = vec![
            0x01,
            0x02,
            area,
            (start >> 8) as u8,
            start as u8,
            0x00,
            (count >> 8) as u8,
            count as u8,
        ];
        command.extend_from_slice(data);
        let response = self.request(&command).await?;
        let code = end_code(&response).ok_or_else(|| self.comm_failure("short FINS response"))?;
        if code != 0 {
            return Err(GatewayError::Rejected(format!("FINS end code {code:#06x}")));
        }
        Ok(())
    }

    async fn write_bit(&mut self, area: u8, word: u16, bit: u8, on: bool) -> Result<()> {
        let command = [
            0x01,
            0x02,
            area,
            (word >> 8) as u8,
            word as u8,
            bit,
            0x00,
            0x01,
            if on { 0x01 } else { 0x00 },
        ];
        let response = self.request(&command).await?;
        let code = end_code(&response).ok_or_else(|| self.comm_failure("short FINS response"))?;
        if code != 0 {
            return Err(GatewayError::Rejected(format!("FINS end code {code:#06x}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct FinsPoint {
    tag: TagDefinition,
    address: FinsAddress,
    width: u16,
}

/// FINS memory-area adapter
pub struct FinsAdapter {
    device: String,
    points: Vec<FinsPoint>,
    spans: Vec<Span<FinsArea>>,
    client: Box<dyn FinsClient>,
    state: ConnectionState,
}

impl FinsAdapter {
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let fins_config: FinsConfig =
            serde_json::from_value(config.connection.clone()).map_err(|e| {
                GatewayError::InvalidConfig(format!(
                    "device {}: invalid FINS connection: {e}",
                    config.name
                ))
            })?;
        Self::with_client(
            config.name.clone(),
            &config.tags,
            Box::new(FinsTcpSession::new(&fins_config)),
        )
    }

    /// Build an adapter around any `FinsClient` (the test seam).
    pub fn with_client(
        device: impl Into<String>,
        tags: &[TagDefinition],
        client: Box<dyn FinsClient>,
    ) -> Result<Self> {
        let points = tags
            .iter()
            .map(|tag| {
                let address = parse_address(&tag.address)?;
                if tag.data_type.is_bool() {
                    // Bit tags read the containing word; default to bit 00
                    Ok(FinsPoint {
                        tag: tag.clone(),
                        address: FinsAddress {
                            bit: Some(address.bit.unwrap_or(0)),
                            ..address
                        },
                        width: 1,
                    })
                } else if address.bit.is_some() {
                    Err(GatewayError::InvalidConfig(format!(
                        "tag {}: bit suffix is only valid for bool tags",
                        tag.name
                    )))
                } else {
                    Ok(FinsPoint {
                        tag: tag.clone(),
                        address,
                        width: word_count(tag.data_type),
                    })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let items: Vec<(FinsArea, u32, u16)> = points
            .iter()
            .map(|p| (p.address.area, p.address.word as u32, p.width))
            .collect();
        let spans = plan_spans(&items, MAX_WORD_GAP, MAX_SPAN_WORDS);

        Ok(Self {
            device: device.into(),
            points,
            spans,
            client,
            state: ConnectionState::Disconnected,
        })
    }
}

#[async_trait]
impl ProtocolAdapter for FinsAdapter {
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
                self.device
            )));
        }

        let mut out = HashMap::with_capacity(self.points.len());
        for span in &self.spans {
            let bytes = match self
                .client
                .read_words(span.key.word_code(), span.start as u16, span.count)
                .await
            {
                Ok(bytes) => bytes,
                Err(GatewayError::Rejected(reason)) => {
                    // Area/offset not readable on this controller: omit its tags
                    tracing::warn!(
                        device = %self.device,
                        start = span.start,
                        "FINS span rejected, omitting tags: {reason}"
                    );
                    continue;
                }
                Err(e) => {
                    self.state = ConnectionState::Faulted;
                    return Err(e);
                }
            };

            let words: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();

            for &i in &span.points {
                let p = &self.points[i];
                let offset = (p.address.word as u32 - span.start) as usize;
                let Some(slice) = words.get(offset..) else {
                    continue;
                };
                match p.address.bit {
                    Some(bit) => {
                        if let Some(&word) = slice.first() {
                            out.insert(p.tag.name.clone(), Value::Bool((word >> bit) & 1 == 1));
                        }
                    }
                    None => {
                        if let Some(raw) = decode_words_low_first(slice, p.tag.data_type) {
                            out.insert(p.tag.name.clone(), engineering_value(&p.tag, raw));
                        }
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

        if !self.state.is_connected() {
            return Err(GatewayError::Communication(format!(
                "{}: not connected",
                self.device
            )));
        }

        let result = match point.address.bit {
            Some(bit) => {
                let on = value.as_bool().ok_or_else(|| {
                    GatewayError::Rejected(format!("tag {name} expects a boolean value"))
                })?;
                self.client
                    .write_bit(point.address.area.bit_code(), point.address.word, bit, on)
                    .await
            }
            None => {
                let raw = raw_from_value(&point.tag, &value)?;
                let words = encode_words_low_first(raw, point.tag.data_type)?;
                let mut data = Vec::with_capacity(words.len() * 2);
                for w in words {
                    data.extend_from_slice(&w.to_be_bytes());
                }
                self.client
                    .write_words(point.address.area.word_code(), point.address.word, &data)
                    .await
            }
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
        Protocol::Fins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::DataType;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            parse_address("D100").unwrap(),
            FinsAddress {
                area: FinsArea::Dm,
                word: 100,
                bit: None
            }
        );
        assert_eq!(
            parse_address("W12.05").unwrap(),
            FinsAddress {
                area: FinsArea::Work,
                word: 12,
                bit: Some(5)
            }
        );
        assert_eq!(parse_address("250").unwrap().area, FinsArea::Cio);
        assert_eq!(parse_address("H7").unwrap().area, FinsArea::Holding);
    }

    #[test]
    fn test_parse_invalid_addresses() {
        assert!(parse_address("Q100").is_err());
        assert!(parse_address("D").is_err());
        assert!(parse_address("D100.16").is_err());
        assert!(parse_address("").is_err());
    }

    #[test]
    fn test_end_code_tolerates_truncated_payload() {
        assert_eq!(end_code(&[]), None);
        assert_eq!(end_code(&[0x00]), None);
        assert_eq!(end_code(&[0x00, 0x01]), Some(1));
        assert_eq!(end_code(&[0x25, 0x02, 0xAA]), Some(0x2502));
    }

    fn tag(name: &str, address: &str, data_type: DataType, scale: f64) -> TagDefinition {
        TagDefinition {
            name: name.to_string(),
            address: address.to_string(),
            data_type,
            scale,
            offset: 0.0,
        }
    }

    /// Scripted FINS memory image with per-call accounting.
    struct FakeFins {
        dm: Vec<u16>,
        reads: Arc<Mutex<Vec<(u8, u16, u16)>>>,
        writes: Arc<Mutex<Vec<(u8, u16, Vec<u8>)>>>,
    }

    impl FakeFins {
        fn new(dm: Vec<u16>) -> Self {
            Self {
                dm,
                reads: Arc::new(Mutex::new(Vec::new())),
                writes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl FinsClient for FakeFins {
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) {}

        async fn read_words(&mut self, area: u8, start: u16, count: u16) -> Result<Vec<u8>> {
            self.reads.lock().unwrap().push((area, start, count));
            let mut bytes = Vec::new();
            for i in 0..count {
                let word = self.dm.get((start + i) as usize).copied().unwrap_or(0);
                bytes.extend_from_slice(&word.to_be_bytes());
            }
            Ok(bytes)
        }

        async fn write_words(&mut self, area: u8, start: u16, data: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push((area, start, data.to_vec()));
            Ok(())
        }

        async fn write_bit(&mut self, area: u8, word: u16, bit: u8, _on: bool) -> Result<()> {
            self.writes.lock().unwrap().push((area, word, vec![bit]));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_contiguous_words_read_in_one_request() {
        let mut dm = vec![0u16; 110];
        dm[100] = 1500;
        // f32 3.25 = 0x40500000, stored low word first
        dm[101] = 0x0000;
        dm[102] = 0x4050;

        let client = FakeFins::new(dm);
        let reads = client.reads.clone();
        let tags = vec![
            tag("speed", "D100", DataType::UInt16, 0.1),
            tag("flow", "D101", DataType::Float32, 1.0),
        ];
        let mut adapter = FinsAdapter::with_client("plc-2", &tags, Box::new(client)).unwrap();

        adapter.connect().await.unwrap();
        let values = adapter.read_tags().await.unwrap();

        assert_eq!(values.get("speed"), Some(&Value::Float(150.0)));
        assert_eq!(values.get("flow"), Some(&Value::Float(3.25)));
        // One merged read: D100..D102
        assert_eq!(reads.lock().unwrap().as_slice(), &[(0x82, 100, 3)]);
    }

    #[tokio::test]
    async fn test_bit_tag_reads_containing_word() {
        let mut dm = vec![0u16; 20];
        dm[10] = 1 << 5;
        let client = FakeFins::new(dm);
        let tags = vec![tag("alarm", "D10.05", DataType::Bool, 1.0)];
        let mut adapter = FinsAdapter::with_client("plc-2", &tags, Box::new(client)).unwrap();

        adapter.connect().await.unwrap();
        let values = adapter.read_tags().await.unwrap();
        assert_eq!(values.get("alarm"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_write_applies_inverse_scale() {
        let client = FakeFins::new(vec![0u16; 200]);
        let writes = client.writes.clone();
        let tags = vec![tag("speed", "D100", DataType::UInt16, 0.1)];
        let mut adapter = FinsAdapter::with_client("plc-2", &tags, Box::new(client)).unwrap();

        adapter.connect().await.unwrap();
        adapter.write_tag("speed", Value::Float(150.0)).await.unwrap();

        let recorded = writes.lock().unwrap();
        // 150.0 / 0.1 = 1500 raw
        assert_eq!(recorded.as_slice(), &[(0x82, 100, 1500u16.to_be_bytes().to_vec())]);
    }

    #[tokio::test]
    async fn test_unknown_tag_write() {
        let client = FakeFins::new(vec![]);
        let tags = vec![tag("speed", "D100", DataType::UInt16, 1.0)];
        let mut adapter = FinsAdapter::with_client("plc-2", &tags, Box::new(client)).unwrap();
        adapter.connect().await.unwrap();

        let err = adapter.write_tag("nope", Value::Int(1)).await.unwrap_err();
        assert_eq!(err, GatewayError::UnknownTag("nope".to_string()));
    }

    #[tokio::test]
    async fn test_bit_suffix_on_numeric_tag_rejected_at_startup() {
        let client = FakeFins::new(vec![]);
        let tags = vec![tag("speed", "D100.02", DataType::UInt16, 1.0)];
        let result = FinsAdapter::with_client("plc-2", &tags, Box::new(client));
        assert!(matches!(result, Err(GatewayError::InvalidConfig(_))));
    }
}
