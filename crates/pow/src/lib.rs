//! Compact targets, per-header work and proof-of-work checks.

pub mod difficulty;
pub mod validation;

pub use difficulty::{
    compact_to_target, compact_to_u256, header_work, u256_to_compact, ChainWork, CompactError,
};
pub use validation::{validate_pow_header, verify_proof_of_work, PowError};
