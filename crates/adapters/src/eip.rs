//! EtherNet/IP tag adapter (Allen-Bradley Logix family).
//!
//! Unlike the register protocols, the controller exposes named tags and the
//! `address` field is simply the controller tag name (`Program:Main.Speed`,
//! `Motor.RPM`). Reads are batched through the CIP Multiple Service Packet;
//! encapsulation and CIP framing live in [`EipSession`] behind [`EipClient`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use domain::{
    ConnectionState, DataType, DeviceConfig, GatewayError, Protocol, ProtocolAdapter, Result,
    TagDefinition, Value,
};

use crate::convert::{engineering_value, raw_from_value};

/// How many tags to pack into one Multiple Service Packet request.
const BATCH_SIZE: usize = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct EipConfig {
    pub host: String,
    #[serde(default = "default_eip_port")]
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_eip_port() -> u16 {
    44818
}
fn default_timeout_ms() -> u64 {
    1000
}

/// A typed CIP atomic value as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CipValue {
    Bool(bool),
    Sint(i8),
    Int(i16),
    Dint(i32),
    Lint(i64),
    Real(f32),
    Lreal(f64),
}

impl CipValue {
    fn type_code(&self) -> u16 {
        match self {
            Self::Bool(_) => 0x00C1,
            Self::Sint(_) => 0x00C2,
            Self::Int(_) => 0x00C3,
            Self::Dint(_) => 0x00C4,
            Self::Lint(_) => 0x00C5,
            Self::Real(_) => 0x00CA,
            Self::Lreal(_) => 0x00CB,
        }
    }

    fn as_f64(&self) -> f64 {
        match *self {
            Self::Bool(b) => b as u8 as f64,
            Self::Sint(v) => v as f64,
            Self::Int(v) => v as f64,
            Self::Dint(v) => v as f64,
            Self::Lint(v) => v as f64,
            Self::Real(v) => v as f64,
            Self::Lreal(v) => v,
        }
    }

    fn decode(type_code: u16, data: &[u8]) -> Option<Self> {
        let mut buf = data;
        match type_code {
            0x00C1 => Some(Self::Bool(*data.first()? != 0)),
            0x00C2 => Some(Self::Sint(*data.first()? as i8)),
            0x00C3 => (buf.len() >= 2).then(|| Self::Int(buf.get_i16_le())),
            0x00C4 => (buf.len() >= 4).then(|| Self::Dint(buf.get_i32_le())),
            0x00C5 => (buf.len() >= 8).then(|| Self::Lint(buf.get_i64_le())),
            0x00CA => (buf.len() >= 4).then(|| Self::Real(buf.get_f32_le())),
            0x00CB => (buf.len() >= 8).then(|| Self::Lreal(buf.get_f64_le())),
            _ => None,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match *self {
            Self::Bool(b) => buf.put_u8(if b { 0xFF } else { 0x00 }),
            Self::Sint(v) => buf.put_i8(v),
            Self::Int(v) => buf.put_i16_le(v),
            Self::Dint(v) => buf.put_i32_le(v),
            Self::Lint(v) => buf.put_i64_le(v),
            Self::Real(v) => buf.put_f32_le(v),
            Self::Lreal(v) => buf.put_f64_le(v),
        }
    }

    /// Pick the CIP type a configured data type maps onto.
    fn from_raw(raw: f64, data_type: DataType) -> Self {
        match data_type {
            DataType::Bool => Self::Bool(raw != 0.0),
            DataType::Int16 | DataType::UInt16 => Self::Int(raw.round() as i16),
            DataType::Int32 | DataType::UInt32 => Self::Dint(raw.round() as i32),
            DataType::Float32 => Self::Real(raw as f32),
            DataType::Float64 => Self::Lreal(raw),
        }
    }
}

/// Vendor-codec seam for EtherNet/IP implementations.
///
/// `read_tags` returns one result per requested tag name, in order, so the
/// adapter can drop failed tags without losing the rest of the batch.
#[async_trait]
pub trait EipClient: Send + Sync {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self);
    async fn read_tags(&mut self, names: &[String]) -> Result<Vec<Result<CipValue>>>;
    async fn write_tag(&mut self, name: &str, value: CipValue) -> Result<()>;
}

/// Unconnected-messaging EtherNet/IP session over TCP.
pub struct EipSession {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
    session_handle: u32,
}

impl EipSession {
    pub fn new(config: &EipConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: Duration::from_millis(config.timeout_ms),
            stream: None,
            session_handle: 0,
        }
    }

    fn comm_failure(&mut self, detail: impl std::fmt::Display) -> GatewayError {
        self.stream = None;
        self.session_handle = 0;
        GatewayError::Communication(format!("EIP {}:{}: {detail}", self.host, self.port))
    }

    fn encap_header(command: u16, session: u32, length: u16) -> BytesMut {
        let mut h = BytesMut::with_capacity(24);
        h.put_u16_le(command);
        h.put_u16_le(length);
        h.put_u32_le(session);
        h.put_u32_le(0); // status
        h.put_slice(&[0u8; 8]); // sender context
        h.put_u32_le(0); // options
        h
    }

    /// Symbolic path for a controller tag name, one ANSI segment per
    /// dot-separated member.
    fn symbolic_path(name: &str) -> Vec<u8> {
        let mut path = Vec::new();
        for member in name.split('.') {
            path.push(0x91);
            path.push(member.len() as u8);
            path.extend_from_slice(member.as_bytes());
            if member.len() % 2 == 1 {
                path.push(0x00);
            }
        }
        path
    }

    fn read_request(name: &str) -> Vec<u8> {
        let path = Self::symbolic_path(name);
        let mut req = Vec::with_capacity(4 + path.len());
        req.push(0x4C); // Read Tag
        req.push((path.len() / 2) as u8);
        req.extend_from_slice(&path);
        req.extend_from_slice(&1u16.to_le_bytes()); // element count
        req
    }

    /// Exchange one SendRRData round-trip; returns the CIP reply payload.
    async fn send_rr_data(&mut self, cip: &[u8]) -> Result<Vec<u8>> {
        // interface handle + timeout + CPF (null address item, data item)
        let mut body = BytesMut::with_capacity(16 + cip.len());
        body.put_u32_le(0); // interface handle (CIP)
        body.put_u16_le(10); // encapsulation timeout (s)
        body.put_u16_le(2); // item count
        body.put_u16_le(0x0000); // null address item
        body.put_u16_le(0);
        body.put_u16_le(0x00B2); // unconnected data item
        body.put_u16_le(cip.len() as u16);
        body.put_slice(cip);

        let mut frame = Self::encap_header(0x006F, self.session_handle, body.len() as u16);
        frame.put_slice(&body);

        let timeout = self.timeout;
        let io = async {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| std::io::Error::other("not connected"))?;
            stream.write_all(&frame).await?;

            let mut head = [0u8; 24];
            stream.read_exact(&mut head).await?;
            let length = u16::from_le_bytes([head[2], head[3]]) as usize;
            let status = u32::from_le_bytes([head[8], head[9], head[10], head[11]]);
            if status != 0 {
                return Err(std::io::Error::other(format!(
                    "encapsulation status {status:#010x}"
                )));
            }
            let mut body = vec![0u8; length];
            stream.read_exact(&mut body).await?;
            Ok::<Vec<u8>, std::io::Error>(body)
        };

        let body = match tokio::time::timeout(timeout, io).await {
            Err(_) => return Err(self.comm_failure("request timed out")),
            Ok(Err(e)) => return Err(self.comm_failure(e)),
            Ok(Ok(body)) => body,
        };

        // Skip interface handle, timeout, item count, null address item, then
        // take the data item payload.
        if body.len() < 16 {
            return Err(self.comm_failure("short SendRRData reply"));
        }
        let data_len = u16::from_le_bytes([body[14], body[15]]) as usize;
        let Some(payload) = body.get(16..16 + data_len) else {
            return Err(self.comm_failure("truncated SendRRData reply"));
        };
        Ok(payload.to_vec())
    }

    /// Strip a CIP reply header, mapping the general status.
    fn cip_payload(reply: &[u8], what: &str) -> Result<(u8, Vec<u8>)> {
        if reply.len() < 4 {
            return Err(GatewayError::Communication(format!("short CIP reply to {what}")));
        }
        let status = reply[1 + 1]; // service, reserved, status
        let extended = reply[3] as usize;
        // The extended-status count is device-controlled; never trust it
        let data = reply.get(4 + extended * 2..).ok_or_else(|| {
            GatewayError::Communication(format!("truncated CIP reply to {what}"))
        })?;
        Ok((status, data.to_vec()))
    }
}

#[async_trait]
impl EipClient for EipSession {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let endpoint = format!("{}:{}", self.host, self.port);
        let addr: SocketAddr = endpoint.parse().map_err(|e| {
            GatewayError::InvalidConfig(format!("invalid EIP endpoint {endpoint}: {e}"))
        })?;

        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(GatewayError::Connection(format!(
                    "EIP connect to {endpoint} timed out"
                )));
            }
            Ok(Err(e)) => {
                return Err(GatewayError::Connection(format!(
                    "EIP connect to {endpoint} failed: {e}"
                )));
            }
            Ok(Ok(stream)) => stream,
        };
        self.stream = Some(stream);

        // RegisterSession: protocol version 1, no options
        let mut frame = Self::encap_header(0x0065, 0, 4);
        frame.put_u16_le(1);
        frame.put_u16_le(0);

        let timeout = self.timeout;
        let io = async {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| std::io::Error::other("not connected"))?;
            stream.write_all(&frame).await?;
            let mut reply = [0u8; 28];
            stream.read_exact(&mut reply).await?;
            Ok::<[u8; 28], std::io::Error>(reply)
        };
        let reply = match tokio::time::timeout(timeout, io).await {
            Err(_) => {
                let e = self.comm_failure("session registration timed out");
                return Err(GatewayError::Connection(e.to_string()));
            }
            Ok(Err(e)) => {
                let e = self.comm_failure(e);
                return Err(GatewayError::Connection(e.to_string()));
            }
            Ok(Ok(reply)) => reply,
        };

        self.session_handle = u32::from_le_bytes([reply[4], reply[5], reply[6], reply[7]]);
        if self.session_handle == 0 {
            self.stream = None;
            return Err(GatewayError::Connection(format!(
                "EIP {endpoint} refused session registration"
            )));
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let (Some(stream), handle) = (self.stream.as_mut(), self.session_handle)
            && handle != 0
        {
            // UnRegisterSession, best effort
            let frame = Self::encap_header(0x0066, handle, 0);
            let _ = tokio::time::timeout(self.timeout, stream.write_all(&frame)).await;
        }
        self.stream = None;
        self.session_handle = 0;
    }

    async fn read_tags(&mut self, names: &[String]) -> Result<Vec<Result<CipValue>>> {
        let mut results = Vec::with_capacity(names.len());
        for batch in names.chunks(BATCH_SIZE) {
            let requests: Vec<Vec<u8>> = batch.iter().map(|n| Self::read_request(n)).collect();

            // Multiple Service Packet to the Message Router
            let mut cip = BytesMut::new();
            cip.put_u8(0x0A);
            cip.put_u8(2);
            cip.put_slice(&[0x20, 0x02, 0x24, 0x01]);
            cip.put_u16_le(batch.len() as u16);
            let mut offset = 2 + batch.len() * 2;
            for req in &requests {
                cip.put_u16_le(offset as u16);
                offset += req.len();
            }
            for req in &requests {
                cip.put_slice(req);
            }

            let reply = self.send_rr_data(&cip).await?;
            let (status, payload) = Self::cip_payload(&reply, "multiple service packet")?;
            if status != 0 && status != 0x1E {
                return Err(GatewayError::Rejected(format!(
                    "CIP status {status:#04x} on batched read"
                )));
            }
            if payload.len() < 2 {
                return Err(self.comm_failure("empty multiple service reply"));
            }
            let count = u16::from_le_bytes([payload[0], payload[1]]) as usize;
            if count != batch.len() || payload.len() < 2 + count * 2 {
                return Err(self.comm_failure("malformed multiple service reply"));
            }

            for i in 0..count {
                let off = u16::from_le_bytes([payload[2 + i * 2], payload[3 + i * 2]]) as usize;
                let end = if i + 1 < count {
                    u16::from_le_bytes([payload[4 + i * 2], payload[5 + i * 2]]) as usize
                } else {
                    payload.len()
                };
                let Some(service_reply) = payload.get(off..end) else {
                    results.push(Err(GatewayError::Rejected(
                        "truncated service reply".to_string(),
                    )));
                    continue;
                };
                match Self::cip_payload(service_reply, &batch[i]) {
                    Ok((0, data)) if data.len() >= 2 => {
                        let type_code = u16::from_le_bytes([data[0], data[1]]);
                        match CipValue::decode(type_code, &data[2..]) {
                            Some(v) => results.push(Ok(v)),
                            None => results.push(Err(GatewayError::Rejected(format!(
                                "tag {}: unsupported CIP type {type_code:#06x}",
                                batch[i]
                            )))),
                        }
                    }
                    Ok((status, _)) => results.push(Err(GatewayError::Rejected(format!(
                        "tag {}: CIP status {status:#04x}",
                        batch[i]
                    )))),
                    Err(e) => results.push(Err(e)),
                }
            }
        }
        Ok(results)
    }

    async fn write_tag(&mut self, name: &str, value: CipValue) -> Result<()> {
        let path = Self::symbolic_path(name);
        let mut cip = BytesMut::with_capacity(8 + path.len());
        cip.put_u8(0x4D); // Write Tag
        cip.put_u8((path.len() / 2) as u8);
        cip.put_slice(&path);
        cip.put_u16_le(value.type_code());
        cip.put_u16_le(1); // element count
        value.encode(&mut cip);

        let reply = self.send_rr_data(&cip).await?;
        let (status, _) = Self::cip_payload(&reply, name)?;
        if status != 0 {
            return Err(GatewayError::Rejected(format!(
                "tag {name}: CIP status {status:#04x}"
            )));
        }
        Ok(())
    }
}

/// EtherNet/IP named-tag adapter
pub struct EipAdapter {
    device_name: String,
    tags: Vec<TagDefinition>,
    client: Box<dyn EipClient>,
    state: ConnectionState,
}

impl EipAdapter {
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let eip_config: EipConfig =
            serde_json::from_value(config.connection.clone()).map_err(|e| {
                GatewayError::InvalidConfig(format!(
                    "device {}: invalid EIP connection: {e}",
                    config.name
                ))
            })?;
        Ok(Self::with_client(
            config.name.clone(),
            &config.tags,
            Box::new(EipSession::new(&eip_config)),
        ))
    }

    /// Build an adapter around any `EipClient` (the test seam).
    pub fn with_client(
        device_name: impl Into<String>,
        tags: &[TagDefinition],
        client: Box<dyn EipClient>,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            tags: tags.to_vec(),
            client,
            state: ConnectionState::Disconnected,
        }
    }
}

#[async_trait]
impl ProtocolAdapter for EipAdapter {
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

        let names: Vec<String> = self.tags.iter().map(|t| t.address.clone()).collect();
        let replies = match self.client.read_tags(&names).await {
            Ok(replies) => replies,
            Err(e) => {
                if matches!(e, GatewayError::Communication(_)) {
                    self.state = ConnectionState::Faulted;
                }
                return Err(e);
            }
        };

        let mut out = HashMap::with_capacity(self.tags.len());
        for (tag, reply) in self.tags.iter().zip(replies) {
            match reply {
                Ok(CipValue::Bool(b)) if tag.data_type.is_bool() => {
                    out.insert(tag.name.clone(), Value::Bool(b));
                }
                Ok(cip) if !tag.data_type.is_bool() => {
                    out.insert(tag.name.clone(), engineering_value(tag, cip.as_f64()));
                }
                Ok(cip) => {
                    tracing::warn!(
                        device = %self.device_name,
                        tag = %tag.name,
                        "controller type {:#06x} does not match configured type, omitting",
                        cip.type_code()
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        device = %self.device_name,
                        tag = %tag.name,
                        "read failed, omitting: {e}"
                    );
                }
            }
        }
        Ok(out)
    }

    async fn write_tag(&mut self, name: &str, value: Value) -> Result<()> {
        let tag = self
            .tags
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| GatewayError::UnknownTag(name.to_string()))?
            .clone();

        if !self.state.is_connected() {
            return Err(GatewayError::Communication(format!(
                "{}: not connected",
                self.device_name
            )));
        }

        let cip = if tag.data_type.is_bool() {
            let on = value.as_bool().ok_or_else(|| {
                GatewayError::Rejected(format!("tag {name} expects a boolean value"))
            })?;
            CipValue::Bool(on)
        } else {
            CipValue::from_raw(raw_from_value(&tag, &value)?, tag.data_type)
        };

        match self.client.write_tag(&tag.address, cip).await {
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
        Protocol::EthernetIp
    }
}
