//! Network constants and chain parameters.

pub mod constants;
pub mod params;

pub use params::{
    chain_params, hash256_from_hex, hash256_to_hex, ChainParams, HexError, Network,
};

/// 32-byte hash in internal (little-endian, wire) byte order.
pub type Hash256 = [u8; 32];
