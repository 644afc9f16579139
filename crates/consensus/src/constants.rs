//! Protocol-wide constants.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_016;
/// Oldest peer protocol version we are willing to talk to (headers-first era).
pub const MIN_PEER_PROTOCOL_VERSION: i32 = 70_001;

pub const NODE_NETWORK: u64 = 1;
pub const NODE_WITNESS: u64 = 1 << 3;

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_WITNESS_FLAG: u32 = 1 << 30;
/// Inventory type requesting a block with witness data attached.
pub const MSG_WITNESS_BLOCK: u32 = MSG_BLOCK | MSG_WITNESS_FLAG;

/// Serialized block header size.
pub const HEADER_SIZE: usize = 80;
/// Maximum number of headers a peer returns for one `getheaders`.
pub const MAX_HEADERS_RESULTS: usize = 2_000;
/// Largest serialized block accepted off the wire (network rule).
pub const MAX_BLOCK_SERIALIZED_SIZE: usize = 4_000_000;
/// Largest P2P message payload.
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 4_000_000;
