use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::GatewayError;

// Largest status record a session channel will buffer before the channel is
// torn down.
pub const MAX_STATUS_RECORD_SIZE: usize = 256 * 1024;

// Payload of the `tcpip-forward` and `cancel-tcpip-forward` global requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub host: String,
    pub port: u32,
}

impl ForwardRequest {
    // The gateway registers abstract names, never allocates ports: port 0 is
    // invalid, as is anything that does not fit a TCP port.
    pub fn service_port(&self) -> Option<u16> {
        match u16::try_from(self.port) {
            Ok(0) | Err(_) => None,
            Ok(port) => Some(port),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.host.len() + 4);
        put_string(&mut buf, &self.host);
        buf.put_u32(self.port);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, GatewayError> {
        let mut buf = payload;
        let request = ForwardRequest {
            host: take_string(&mut buf)?,
            port: take_u32(&mut buf)?,
        };
        if !buf.is_empty() {
            return Err(GatewayError::MalformedPayload);
        }
        Ok(request)
    }
}

// Payload of the `direct-tcpip` and `forwarded-tcpip` channel opens. For the
// latter, host and port hold the registered service coordinates while the
// origin fields carry the caller's origin unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelData {
    pub host: String,
    pub port: u32,
    pub origin_address: String,
    pub origin_port: u32,
}

impl TunnelData {
    pub fn service_port(&self) -> Option<u16> {
        match u16::try_from(self.port) {
            Ok(0) | Err(_) => None,
            Ok(port) => Some(port),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(4 + self.host.len() + 4 + 4 + self.origin_address.len() + 4);
        put_string(&mut buf, &self.host);
        buf.put_u32(self.port);
        put_string(&mut buf, &self.origin_address);
        buf.put_u32(self.origin_port);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, GatewayError> {
        let mut buf = payload;
        let data = TunnelData {
            host: take_string(&mut buf)?,
            port: take_u32(&mut buf)?,
            origin_address: take_string(&mut buf)?,
            origin_port: take_u32(&mut buf)?,
        };
        if !buf.is_empty() {
            return Err(GatewayError::MalformedPayload);
        }
        Ok(data)
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, GatewayError> {
    if buf.remaining() < 4 {
        return Err(GatewayError::MalformedPayload);
    }
    Ok(buf.get_u32())
}

fn take_string(buf: &mut &[u8]) -> Result<String, GatewayError> {
    let length = take_u32(buf)? as usize;
    if buf.remaining() < length {
        return Err(GatewayError::MalformedPayload);
    }
    let value = buf[..length].to_vec();
    buf.advance(length);
    String::from_utf8(value).map_err(|_| GatewayError::MalformedPayload)
}

// Incremental decoder for the session control stream: records are framed as a
// 32-bit big-endian length followed by that many bytes of JSON.
#[derive(Debug, Default)]
pub struct StatusRecordDecoder {
    buf: BytesMut,
}

impl StatusRecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    // Buffer more bytes from the channel and pop every complete record.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Bytes>, GatewayError> {
        self.buf.extend_from_slice(data);
        let mut records = Vec::new();
        loop {
            if self.buf.len() < 4 {
                break;
            }
            let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if length > MAX_STATUS_RECORD_SIZE {
                return Err(GatewayError::StatusRecordTooLarge(length));
            }
            if self.buf.len() < 4 + length {
                break;
            }
            self.buf.advance(4);
            records.push(self.buf.split_to(length).freeze());
        }
        Ok(records)
    }
}

// Frame a status record the way clients are expected to send them. Kept next
// to the decoder so the framing has a single authority; tests and client
// tooling share it.
pub fn encode_status_record(record: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + record.len());
    buf.put_u32(record.len() as u32);
    buf.put_slice(record);
    buf.freeze()
}
