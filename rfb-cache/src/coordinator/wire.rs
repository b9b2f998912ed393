//! Coordinator IPC wire format.
//!
//! Frames are `u32` length (big-endian, counting the type byte and
//! payload), one type byte, then the payload. Parsing is incremental:
//! [`CoordMessage::parse`] returns `None` until a whole frame is buffered.

use crate::key::CacheKey;
use crate::store::IndexEntry;
use rfb_pixelbuffer::PixelFormat;

/// Coordinator protocol version carried in HELLO.
pub const COORDINATOR_PROTOCOL_VERSION: u32 = 1;

/// Serialised size of [`WireIndexEntry`].
pub const WIRE_INDEX_ENTRY_LEN: usize = 66;

/// Upper bound on a sane frame; anything larger is a corrupt peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Message type octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoordMsgType {
    Hello = 1,
    IndexUpdate = 2,
    WriteRequest = 3,
    WriteResponse = 4,
    Ping = 5,
    Pong = 6,
}

impl CoordMsgType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Hello),
            2 => Some(Self::IndexUpdate),
            3 => Some(Self::WriteRequest),
            4 => Some(Self::WriteResponse),
            5 => Some(Self::Ping),
            6 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// Fixed-layout index entry exchanged over coordinator IPC: 16-byte key,
/// shard/offset/size, dimensions, both hashes, quality code, cold flag and
/// 16 reserved bytes. Exactly 66 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireIndexEntry {
    pub key: [u8; 16],
    pub shard_id: u16,
    pub offset: u32,
    pub size: u32,
    pub width: u16,
    pub height: u16,
    pub stride_pixels: u16,
    pub canonical_hash: u64,
    pub actual_hash: u64,
    pub quality_code: u8,
    pub cold: bool,
}

impl WireIndexEntry {
    /// Serialise to the fixed 66-byte layout (big-endian fields).
    pub fn to_bytes(&self) -> [u8; WIRE_INDEX_ENTRY_LEN] {
        let mut out = [0u8; WIRE_INDEX_ENTRY_LEN];
        out[0..16].copy_from_slice(&self.key);
        out[16..18].copy_from_slice(&self.shard_id.to_be_bytes());
        out[18..22].copy_from_slice(&self.offset.to_be_bytes());
        out[22..26].copy_from_slice(&self.size.to_be_bytes());
        out[26..28].copy_from_slice(&self.width.to_be_bytes());
        out[28..30].copy_from_slice(&self.height.to_be_bytes());
        out[30..32].copy_from_slice(&self.stride_pixels.to_be_bytes());
        out[32..40].copy_from_slice(&self.canonical_hash.to_be_bytes());
        out[40..48].copy_from_slice(&self.actual_hash.to_be_bytes());
        out[48] = self.quality_code;
        out[49] = u8::from(self.cold);
        // out[50..66] reserved
        out
    }

    /// Parse the fixed 66-byte layout.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < WIRE_INDEX_ENTRY_LEN {
            return None;
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&data[0..16]);
        Some(Self {
            key,
            shard_id: u16::from_be_bytes([data[16], data[17]]),
            offset: u32::from_be_bytes([data[18], data[19], data[20], data[21]]),
            size: u32::from_be_bytes([data[22], data[23], data[24], data[25]]),
            width: u16::from_be_bytes([data[26], data[27]]),
            height: u16::from_be_bytes([data[28], data[29]]),
            stride_pixels: u16::from_be_bytes([data[30], data[31]]),
            canonical_hash: u64::from_be_bytes(data[32..40].try_into().ok()?),
            actual_hash: u64::from_be_bytes(data[40..48].try_into().ok()?),
            quality_code: data[48],
            cold: data[49] != 0,
        })
    }

    /// Build from an engine-side index entry. The pixel format itself is
    /// not carried over IPC; peers reconstruct it from their own index
    /// after the master's next index save, so the wire entry only needs
    /// the quality code for policy decisions.
    pub fn from_index_entry(key: &CacheKey, entry: &IndexEntry, actual_hash: u64) -> Self {
        Self {
            key: *key.as_bytes(),
            shard_id: entry.shard_id,
            offset: entry.offset,
            size: entry.size,
            width: entry.width,
            height: entry.height,
            stride_pixels: entry.stride_pixels,
            canonical_hash: entry.canonical_hash,
            actual_hash,
            quality_code: entry.quality_code,
            cold: entry.cold,
        }
    }

    /// Convert into an engine-side index entry with the given format.
    pub fn to_index_entry(&self, format: PixelFormat) -> (CacheKey, IndexEntry) {
        (
            CacheKey::from_bytes(self.key),
            IndexEntry {
                shard_id: self.shard_id,
                offset: self.offset,
                size: self.size,
                width: self.width,
                height: self.height,
                stride_pixels: self.stride_pixels,
                format,
                canonical_hash: self.canonical_hash,
                quality_code: self.quality_code,
                cold: self.cold,
            },
        )
    }
}

/// One framed coordinator message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordMessage {
    pub msg_type: CoordMsgType,
    pub payload: Vec<u8>,
}

impl CoordMessage {
    pub fn new(msg_type: CoordMsgType) -> Self {
        Self {
            msg_type,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(msg_type: CoordMsgType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Serialise the frame: length, type, payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.payload.len());
        out.extend_from_slice(&((1 + self.payload.len()) as u32).to_be_bytes());
        out.push(self.msg_type as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Incremental parse. Returns the message and the number of bytes
    /// consumed, or `None` when the buffer does not yet hold a full frame.
    /// Corrupt frames (unknown type, absurd length) yield an error.
    pub fn parse(data: &[u8]) -> std::io::Result<Option<(CoordMessage, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if frame_len == 0 || frame_len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("coordinator frame length {frame_len} out of range"),
            ));
        }
        if data.len() < 4 + frame_len {
            return Ok(None);
        }

        let msg_type = CoordMsgType::from_u8(data[4]).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown coordinator message type {}", data[4]),
            )
        })?;
        let payload = data[5..4 + frame_len].to_vec();
        Ok(Some((CoordMessage { msg_type, payload }, 4 + frame_len)))
    }
}

/// HELLO payload: protocol version, pid, 8 reserved bytes.
pub fn encode_hello(pid: u32) -> CoordMessage {
    let mut payload = Vec::with_capacity(16);
    payload.extend_from_slice(&COORDINATOR_PROTOCOL_VERSION.to_be_bytes());
    payload.extend_from_slice(&pid.to_be_bytes());
    payload.extend_from_slice(&[0u8; 8]);
    CoordMessage::with_payload(CoordMsgType::Hello, payload)
}

/// Decode a HELLO payload into (protocol version, pid).
pub fn decode_hello(payload: &[u8]) -> Option<(u32, u32)> {
    if payload.len() < 8 {
        return None;
    }
    Some((
        u32::from_be_bytes(payload[0..4].try_into().ok()?),
        u32::from_be_bytes(payload[4..8].try_into().ok()?),
    ))
}

/// INDEX_UPDATE payload: count then packed entries.
pub fn encode_index_update(entries: &[WireIndexEntry]) -> CoordMessage {
    let mut payload = Vec::with_capacity(4 + entries.len() * WIRE_INDEX_ENTRY_LEN);
    payload.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in entries {
        payload.extend_from_slice(&entry.to_bytes());
    }
    CoordMessage::with_payload(CoordMsgType::IndexUpdate, payload)
}

/// Decode an INDEX_UPDATE payload.
pub fn decode_index_update(payload: &[u8]) -> Option<Vec<WireIndexEntry>> {
    if payload.len() < 4 {
        return None;
    }
    let count = u32::from_be_bytes(payload[0..4].try_into().ok()?) as usize;
    let body = &payload[4..];
    if body.len() != count * WIRE_INDEX_ENTRY_LEN {
        return None;
    }
    let mut entries = Vec::with_capacity(count);
    for chunk in body.chunks_exact(WIRE_INDEX_ENTRY_LEN) {
        entries.push(WireIndexEntry::from_bytes(chunk)?);
    }
    Some(entries)
}

/// WRITE_REQUEST payload: entry, payload length, payload bytes.
pub fn encode_write_request(entry: &WireIndexEntry, payload_bytes: &[u8]) -> CoordMessage {
    let mut payload = Vec::with_capacity(WIRE_INDEX_ENTRY_LEN + 4 + payload_bytes.len());
    payload.extend_from_slice(&entry.to_bytes());
    payload.extend_from_slice(&(payload_bytes.len() as u32).to_be_bytes());
    payload.extend_from_slice(payload_bytes);
    CoordMessage::with_payload(CoordMsgType::WriteRequest, payload)
}

/// Decode a WRITE_REQUEST payload.
pub fn decode_write_request(payload: &[u8]) -> Option<(WireIndexEntry, Vec<u8>)> {
    let entry = WireIndexEntry::from_bytes(payload)?;
    let rest = &payload[WIRE_INDEX_ENTRY_LEN..];
    if rest.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes(rest[0..4].try_into().ok()?) as usize;
    let body = &rest[4..];
    if body.len() != len {
        return None;
    }
    Some((entry, body.to_vec()))
}

/// WRITE_RESPONSE payload: status (0 = ok) then the resulting entry.
pub fn encode_write_response(ok: bool, entry: &WireIndexEntry) -> CoordMessage {
    let mut payload = Vec::with_capacity(1 + WIRE_INDEX_ENTRY_LEN);
    payload.push(u8::from(!ok)); // 0 = success
    payload.extend_from_slice(&entry.to_bytes());
    CoordMessage::with_payload(CoordMsgType::WriteResponse, payload)
}

/// Decode a WRITE_RESPONSE payload into (ok, entry).
pub fn decode_write_response(payload: &[u8]) -> Option<(bool, WireIndexEntry)> {
    if payload.is_empty() {
        return None;
    }
    let entry = WireIndexEntry::from_bytes(&payload[1..])?;
    Some((payload[0] == 0, entry))
}
