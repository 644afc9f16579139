use btcnode_consensus::{ChainParams, Hash256};
use btcnode_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, hash_meets_target, CompactError};

#[derive(Debug, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// True when `hash`, read as a little-endian integer, is at most the
/// header's own compact target.
pub fn verify_proof_of_work(header: &BlockHeader, hash: &Hash256) -> bool {
    match compact_to_u256(header.bits) {
        Ok(target) => !target.is_zero() && hash_meets_target(hash, &target),
        Err(_) => false,
    }
}

/// Proof-of-work check that also enforces the network's easiest allowed target.
pub fn validate_pow_header(
    header: &BlockHeader,
    hash: &Hash256,
    params: &ChainParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(header.bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target > pow_limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    if !hash_meets_target(hash, &target) {
        return Err(PowError::HashMismatch);
    }
    Ok(())
}
