// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry wire protocol.
//!
//! Every message, in both directions, travels as one length-prefixed frame:
//!
//! ```text
//! +----------------+-----------+------------------------+
//! | Length (2B BE) | Type (1B) | Body (Length - 1 bytes) |
//! +----------------+-----------+------------------------+
//! ```
//!
//! `Length` covers the type byte and the body. Strings inside a body are
//! encoded as `[2B BE length][UTF-8 bytes]`.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest value the length prefix can carry (type byte + body).
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Size of the server-issued session key.
pub const KEY_SIZE: usize = 32;

/// Size of the HMAC-SHA256 authentication tag.
pub const TAG_SIZE: usize = 32;

/// Packet type discriminant. Byte values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    HandshakeRequest = 0x01,
    HandshakeResponse = 0x02,
    StartRequest = 0x03,
    StartResponse = 0x04,
    HeartbeatRequest = 0x05,
    HeartbeatResponse = 0x06,
}

impl PacketType {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Self::HandshakeRequest),
            0x02 => Ok(Self::HandshakeResponse),
            0x03 => Ok(Self::StartRequest),
            0x04 => Ok(Self::StartResponse),
            0x05 => Ok(Self::HeartbeatRequest),
            0x06 => Ok(Self::HeartbeatResponse),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_byte(byte)
    }
}

/// One module instance as claimed by a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    /// Build hash, empty when the client has none.
    pub build_hash: String,
}

impl ModuleInfo {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        build_hash: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            build_hash: build_hash.into(),
        }
    }

    /// Encoded size of this module inside a handshake body.
    pub fn encoded_len(&self) -> usize {
        encoded_string_len(&self.name)
            + encoded_string_len(&self.version)
            + encoded_string_len(&self.build_hash)
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        put_string(buf, &self.name)?;
        put_string(buf, &self.version)?;
        put_string(buf, &self.build_hash)
    }

    fn decode(reader: &mut BodyReader<'_>) -> Result<Self, ProtocolError> {
        let name = reader.string()?;
        let version = reader.string()?;
        let build_hash = reader.string()?;
        Ok(Self {
            name,
            version,
            build_hash,
        })
    }
}

impl std::fmt::Display for ModuleInfo {
    /// `name version build_hash`, the exact form fed into the tag transcript.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.name, self.version, self.build_hash)
    }
}

/// A decoded telemetry packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Client claims the modules it runs.
    HandshakeRequest { modules: Vec<ModuleInfo> },

    /// Server issues the per-handshake key.
    HandshakeResponse { key: [u8; KEY_SIZE] },

    /// Client proves it derived the tag from the issued key.
    StartRequest { tag: [u8; TAG_SIZE] },

    /// Sent after every start request, whatever the verification outcome.
    StartResponse,

    /// Liveness signal.
    HeartbeatRequest,

    HeartbeatResponse,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::HandshakeRequest { .. } => PacketType::HandshakeRequest,
            Self::HandshakeResponse { .. } => PacketType::HandshakeResponse,
            Self::StartRequest { .. } => PacketType::StartRequest,
            Self::StartResponse => PacketType::StartResponse,
            Self::HeartbeatRequest => PacketType::HeartbeatRequest,
            Self::HeartbeatResponse => PacketType::HeartbeatResponse,
        }
    }

    /// Size of the body alone (no length prefix, no type byte).
    pub fn body_len(&self) -> usize {
        match self {
            Self::HandshakeRequest { modules } => {
                2 + modules.iter().map(ModuleInfo::encoded_len).sum::<usize>()
            }
            Self::HandshakeResponse { .. } => KEY_SIZE,
            Self::StartRequest { .. } => TAG_SIZE,
            Self::StartResponse | Self::HeartbeatRequest | Self::HeartbeatResponse => 0,
        }
    }

    /// Append the type-specific body to `buf`.
    pub fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Self::HandshakeRequest { modules } => {
                let count = u16::try_from(modules.len())
                    .map_err(|_| ProtocolError::TooManyModules(modules.len()))?;
                buf.put_u16(count);
                for module in modules {
                    module.encode(buf)?;
                }
            }
            Self::HandshakeResponse { key } => buf.put_slice(key),
            Self::StartRequest { tag } => buf.put_slice(tag),
            Self::StartResponse | Self::HeartbeatRequest | Self::HeartbeatResponse => {}
        }
        Ok(())
    }

    /// Encode a complete frame: length prefix, type byte and body.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let payload_len = 1 + self.body_len();
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload_len);
        // Checked above.
        buf.put_u16(payload_len as u16);
        buf.put_u8(self.packet_type().to_byte());
        self.encode_body(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a body of the given type. Bytes past the end of the body are ignored.
    pub fn decode(packet_type: PacketType, body: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = BodyReader::new(body);
        let packet = match packet_type {
            PacketType::HandshakeRequest => {
                let count = reader.u16()? as usize;
                // Each module needs at least three empty strings (6 bytes);
                // bound the allocation by what the body can actually hold.
                let mut modules = Vec::with_capacity(count.min(reader.remaining() / 6));
                for _ in 0..count {
                    modules.push(ModuleInfo::decode(&mut reader)?);
                }
                Self::HandshakeRequest { modules }
            }
            PacketType::HandshakeResponse => Self::HandshakeResponse {
                key: reader.array()?,
            },
            PacketType::StartRequest => Self::StartRequest {
                tag: reader.array()?,
            },
            PacketType::StartResponse => Self::StartResponse,
            PacketType::HeartbeatRequest => Self::HeartbeatRequest,
            PacketType::HeartbeatResponse => Self::HeartbeatResponse,
        };
        Ok(packet)
    }

    /// Decode from a raw type byte plus body, as produced by the reassembler.
    pub fn decode_raw(type_byte: u8, body: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode(PacketType::from_byte(type_byte)?, body)
    }
}

/// Encoded size of a length-prefixed string.
pub fn encoded_string_len(s: &str) -> usize {
    2 + s.len()
}

/// Append a length-prefixed string.
pub fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::FieldTooLong(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Read a length-prefixed string from the start of `raw`.
///
/// Returns the string and the number of bytes consumed.
pub fn read_string(raw: &[u8]) -> Result<(String, usize), ProtocolError> {
    let mut reader = BodyReader::new(raw);
    let s = reader.string()?;
    Ok((s, reader.position()))
}

/// Bounds-checked cursor over a packet body.
struct BodyReader<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { raw, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.raw.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.raw[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

/// Protocol error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Truncated body: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown packet type: {0:#04x}")]
    UnknownType(u8),

    #[error("String field is not valid UTF-8")]
    InvalidUtf8,

    #[error("String field too long: {0} bytes")]
    FieldTooLong(usize),

    #[error("Too many modules: {0}")]
    TooManyModules(usize),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}
