//! Per-network chain parameters.

use crate::constants::HEADER_SIZE;
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Self::Mainnet),
            "test" | "testnet" | "testnet3" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],
    /// Serialized genesis header.
    pub genesis_header: [u8; HEADER_SIZE],
    pub hash_genesis_block: Hash256,
    /// Highest (easiest) target a header may claim.
    pub pow_limit: Hash256,
    /// Header hashes that are never accepted into the chain.
    pub banned_hashes: Vec<Hash256>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex hash into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in 0..(64 - hex.len()) {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    bytes_from_hex(&padded, &mut bytes)?;
    bytes.reverse();
    Ok(bytes)
}

/// Renders an internal-order hash in display order.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

fn bytes_from_hex(hex: &str, out: &mut [u8]) -> Result<(), HexError> {
    if hex.len() != out.len() * 2 {
        return Err(HexError::InvalidLength);
    }
    for (i, byte_out) in out.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(
            hex.get(start..start + 2).ok_or(HexError::InvalidHex)?,
            16,
        )
        .map_err(|_| HexError::InvalidHex)?;
    }
    Ok(())
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_chain_params(),
        Network::Testnet => testnet_chain_params(),
        Network::Regtest => regtest_chain_params(),
    }
}

// Version 1, null prev hash, the shared genesis coinbase merkle root.
const GENESIS_PREFIX: &str = "01000000\
0000000000000000000000000000000000000000000000000000000000000000\
3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a";

const MAINNET_DNS_SEEDS: [&str; 4] = [
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "seed.bitcoinstats.com",
    "seed.bitcoin.jonasschnelli.ch",
];

const TESTNET_DNS_SEEDS: [&str; 2] = [
    "testnet-seed.bitcoin.jonasschnelli.ch",
    "seed.tbtc.petertodd.org",
];

const REGTEST_DNS_SEEDS: [&str; 0] = [];

fn genesis_header(time_bits_nonce: &str) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    let hex = format!("{GENESIS_PREFIX}{time_bits_nonce}");
    bytes_from_hex(&hex, &mut header).expect("genesis header hex");
    header
}

fn mainnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        message_start: [0xf9, 0xbe, 0xb4, 0xd9],
        default_port: 8_333,
        dns_seeds: &MAINNET_DNS_SEEDS,
        genesis_header: genesis_header("29ab5f49ffff001d1dac2b7c"),
        hash_genesis_block: hash256_from_hex(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        )
        .expect("mainnet genesis hash"),
        pow_limit: hash256_from_hex(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pow limit"),
        banned_hashes: Vec::new(),
    }
}

fn testnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        message_start: [0x0b, 0x11, 0x09, 0x07],
        default_port: 18_333,
        dns_seeds: &TESTNET_DNS_SEEDS,
        genesis_header: genesis_header("dae5494dffff001d1aa4ae18"),
        hash_genesis_block: hash256_from_hex(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        )
        .expect("testnet genesis hash"),
        pow_limit: hash256_from_hex(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pow limit"),
        banned_hashes: Vec::new(),
    }
}

fn regtest_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        message_start: [0xfa, 0xbf, 0xb5, 0xda],
        default_port: 18_444,
        dns_seeds: &REGTEST_DNS_SEEDS,
        genesis_header: genesis_header("dae5494dffff7f2002000000"),
        hash_genesis_block: hash256_from_hex(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        )
        .expect("regtest genesis hash"),
        pow_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pow limit"),
        banned_hashes: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_round_trip_reverses_bytes() {
        let hash = hash256_from_hex("0x01").expect("hex");
        assert_eq!(hash[0], 1);
        assert!(hash[1..].iter().all(|b| *b == 0));
        assert_eq!(
            hash256_to_hex(&hash),
            "0000000000000000000000000000000000000000000000000000000000000001"
        );
        assert_eq!(hash256_from_hex(""), Err(HexError::InvalidLength));
        assert_eq!(hash256_from_hex("zz"), Err(HexError::InvalidHex));
    }

    #[test]
    fn mainnet_genesis_fields() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(&params.genesis_header[0..4], &[1, 0, 0, 0]);
        assert!(params.genesis_header[4..36].iter().all(|b| *b == 0));
        // time 1231006505, bits 0x1d00ffff, nonce 2083236893
        assert_eq!(&params.genesis_header[68..72], &1_231_006_505u32.to_le_bytes());
        assert_eq!(&params.genesis_header[72..76], &0x1d00_ffffu32.to_le_bytes());
        assert_eq!(&params.genesis_header[76..80], &2_083_236_893u32.to_le_bytes());
    }

    #[test]
    fn testnet_and_regtest_share_genesis_time() {
        let testnet = chain_params(Network::Testnet);
        let regtest = chain_params(Network::Regtest);
        assert_eq!(&testnet.genesis_header[68..72], &1_296_688_602u32.to_le_bytes());
        assert_eq!(&regtest.genesis_header[68..72], &1_296_688_602u32.to_le_bytes());
        assert_eq!(&regtest.genesis_header[72..76], &0x207f_ffffu32.to_le_bytes());
        assert_eq!(&regtest.genesis_header[76..80], &2u32.to_le_bytes());
    }

    #[test]
    fn network_names_parse() {
        assert_eq!(Network::parse("main"), Some(Network::Mainnet));
        assert_eq!(Network::parse("Testnet3"), Some(Network::Testnet));
        assert_eq!(Network::parse("regtest"), Some(Network::Regtest));
        assert_eq!(Network::parse("signet"), None);
    }
}
