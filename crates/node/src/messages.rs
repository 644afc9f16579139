//! P2P message framing and the payload codecs used by sync.

use std::time::{SystemTime, UNIX_EPOCH};

use btcnode_consensus::constants::{
    MAX_HEADERS_RESULTS, MAX_PROTOCOL_MESSAGE_LENGTH, NODE_WITNESS, PROTOCOL_VERSION,
};
use btcnode_consensus::Hash256;
use btcnode_primitives::block::BlockHeader;
use btcnode_primitives::encoding::{DecodeError, Decoder, Encoder};
use btcnode_primitives::hash::sha256d;

pub const MESSAGE_HEADER_SIZE: usize = 24;
const COMMAND_SIZE: usize = 12;
const MAX_LOCATOR_SIZE: usize = 101;
const MAX_INV_SIZE: usize = 50_000;
pub const USER_AGENT: &str = concat!("/btcnode:", env!("CARGO_PKG_VERSION"), "/");

#[derive(Debug, PartialEq, Eq)]
pub enum MessageError {
    Decode(DecodeError),
    BadMagic,
    BadChecksum,
    BadCommand,
    CommandTooLong(String),
    PayloadTooLarge(usize),
    TooManyItems { kind: &'static str, count: usize },
    TrailingBytes(&'static str),
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::Decode(err) => write!(f, "{err}"),
            MessageError::BadMagic => write!(f, "invalid magic"),
            MessageError::BadChecksum => write!(f, "invalid payload checksum"),
            MessageError::BadCommand => write!(f, "malformed command name"),
            MessageError::CommandTooLong(command) => write!(f, "command {command} too long"),
            MessageError::PayloadTooLarge(len) => write!(f, "payload of {len} bytes too large"),
            MessageError::TooManyItems { kind, count } => {
                write!(f, "{kind} message carries {count} items")
            }
            MessageError::TrailingBytes(kind) => write!(f, "trailing bytes in {kind} payload"),
        }
    }
}

impl std::error::Error for MessageError {}

impl From<DecodeError> for MessageError {
    fn from(err: DecodeError) -> Self {
        MessageError::Decode(err)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: String,
    pub length: usize,
    pub checksum: [u8; 4],
}

pub fn encode_frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Result<Vec<u8>, MessageError> {
    let cmd = command.as_bytes();
    if cmd.len() > COMMAND_SIZE {
        return Err(MessageError::CommandTooLong(command.to_string()));
    }
    if payload.len() > MAX_PROTOCOL_MESSAGE_LENGTH {
        return Err(MessageError::PayloadTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&magic);
    let mut command_bytes = [0u8; COMMAND_SIZE];
    command_bytes[..cmd.len()].copy_from_slice(cmd);
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&sha256d(payload)[..4]);
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn parse_frame_header(
    header: &[u8; MESSAGE_HEADER_SIZE],
    magic: [u8; 4],
) -> Result<FrameHeader, MessageError> {
    if header[..4] != magic {
        return Err(MessageError::BadMagic);
    }
    let raw = &header[4..16];
    let end = raw.iter().position(|byte| *byte == 0).unwrap_or(COMMAND_SIZE);
    // NUL padding only, and printable ASCII before it.
    if raw[end..].iter().any(|byte| *byte != 0)
        || !raw[..end].iter().all(|byte| byte.is_ascii_graphic())
    {
        return Err(MessageError::BadCommand);
    }
    let command = raw[..end].iter().map(|byte| *byte as char).collect();
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_PROTOCOL_MESSAGE_LENGTH {
        return Err(MessageError::PayloadTooLarge(length));
    }
    Ok(FrameHeader {
        command,
        length,
        checksum: [header[20], header[21], header[22], header[23]],
    })
}

pub fn verify_checksum(header: &FrameHeader, payload: &[u8]) -> Result<(), MessageError> {
    if sha256d(payload)[..4] != header.checksum {
        return Err(MessageError::BadChecksum);
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetHeadersRequest {
    pub version: i32,
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

/// `getheaders` asking for as many headers as the peer will send.
pub fn build_getheaders_payload(locator: &[Hash256]) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(4 + 9 + 32 * (locator.len() + 1));
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_hash_le(hash);
    }
    encoder.write_hash_le(&[0u8; 32]);
    encoder.into_inner()
}

pub fn parse_getheaders(payload: &[u8]) -> Result<GetHeadersRequest, MessageError> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le()?;
    let count = decoder.read_compact_size()?;
    if count > MAX_LOCATOR_SIZE {
        return Err(MessageError::TooManyItems {
            kind: "getheaders",
            count,
        });
    }
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(decoder.read_hash_le()?);
    }
    let stop = decoder.read_hash_le()?;
    if !decoder.is_empty() {
        return Err(MessageError::TrailingBytes("getheaders"));
    }
    Ok(GetHeadersRequest {
        version,
        locator,
        stop,
    })
}

pub fn build_headers_payload(headers: &[BlockHeader]) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(3 + headers.len() * 81);
    encoder.write_varint(headers.len() as u64);
    for header in headers {
        encoder.write_bytes(&header.consensus_encode());
        encoder.write_u8(0);
    }
    encoder.into_inner()
}

/// Each header is followed by a transaction count, always zero in practice
/// and ignored here.
pub fn parse_headers(payload: &[u8]) -> Result<Vec<BlockHeader>, MessageError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_compact_size()?;
    if count > MAX_HEADERS_RESULTS {
        return Err(MessageError::TooManyItems {
            kind: "headers",
            count,
        });
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        headers.push(BlockHeader::consensus_decode_from(&mut decoder)?);
        let _tx_count = decoder.read_varint()?;
    }
    if !decoder.is_empty() {
        return Err(MessageError::TrailingBytes("headers"));
    }
    Ok(headers)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inventory {
    pub inv_type: u32,
    pub hash: Hash256,
}

pub fn build_getdata_payload(items: &[Inventory]) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(9 + items.len() * 36);
    encoder.write_varint(items.len() as u64);
    for item in items {
        encoder.write_u32_le(item.inv_type);
        encoder.write_hash_le(&item.hash);
    }
    encoder.into_inner()
}

/// Shared layout of `inv`, `getdata` and `notfound`.
pub fn parse_inventory(payload: &[u8]) -> Result<Vec<Inventory>, MessageError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_compact_size()?;
    if count > MAX_INV_SIZE {
        return Err(MessageError::TooManyItems { kind: "inv", count });
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let inv_type = decoder.read_u32_le()?;
        let hash = decoder.read_hash_le()?;
        items.push(Inventory { inv_type, hash });
    }
    if !decoder.is_empty() {
        return Err(MessageError::TrailingBytes("inv"));
    }
    Ok(items)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: i32,
    pub services: u64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
}

/// We serve nothing, so no services are advertised besides witness support.
pub fn build_version_payload(start_height: i32, nonce: u64) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_u64_le(NODE_WITNESS);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    encoder.write_i64_le(timestamp);
    write_net_addr(&mut encoder, 0, [0u8; 16], 0);
    write_net_addr(&mut encoder, NODE_WITNESS, [0u8; 16], 0);
    encoder.write_u64_le(nonce);
    encoder.write_var_str(USER_AGENT);
    encoder.write_i32_le(start_height);
    encoder.write_u8(0);
    encoder.into_inner()
}

pub fn parse_version(payload: &[u8]) -> Result<VersionInfo, MessageError> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le()?;
    let services = decoder.read_u64_le()?;
    let _timestamp = decoder.read_i64_le()?;
    read_net_addr(&mut decoder)?;
    read_net_addr(&mut decoder)?;
    let nonce = decoder.read_u64_le()?;
    let user_agent = decoder.read_var_str()?;
    let start_height = decoder.read_i32_le()?;
    // The relay flag is optional and ignored.
    Ok(VersionInfo {
        version,
        services,
        nonce,
        user_agent,
        start_height,
    })
}

fn write_net_addr(encoder: &mut Encoder, services: u64, ip: [u8; 16], port: u16) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&ip);
    encoder.write_bytes(&port.to_be_bytes());
}

fn read_net_addr(decoder: &mut Decoder) -> Result<(), MessageError> {
    let _services = decoder.read_u64_le()?;
    let _ip = decoder.read_fixed::<16>()?;
    let _port = decoder.read_fixed::<2>()?;
    Ok(())
}
