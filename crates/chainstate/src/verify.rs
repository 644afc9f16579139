//! Parallel block body verification.
//!
//! A request carries whole serialized blocks. Each block is decoded, its
//! txids and wtxids computed, and the merkle root (plus witness commitment,
//! when the block carries witness data) checked against the header.

use btcnode_consensus::Hash256;
use btcnode_primitives::block::{Block, BlockDecodeError};
use btcnode_primitives::hash::{sha256d, sha256d_pair};
use rayon::prelude::*;

const WITNESS_COMMITMENT_PREFIX: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

#[derive(Clone, Debug, Default)]
pub struct VerifyRequest {
    pub block_buffers: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyResponse {
    Valid {
        txids: Vec<Vec<Hash256>>,
        wtxids: Vec<Vec<Hash256>>,
    },
    Invalid {
        index: usize,
        error: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIds {
    pub txids: Vec<Hash256>,
    pub wtxids: Vec<Hash256>,
}

#[derive(Debug)]
pub enum VerifyError {
    Decode(BlockDecodeError),
    NoTransactions,
    FirstNotCoinbase,
    MerkleMismatch,
    MutatedMerkle,
    UnexpectedWitness,
    BadWitnessNonce,
    WitnessCommitmentMismatch,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::Decode(err) => write!(f, "{err}"),
            VerifyError::NoTransactions => write!(f, "block has no transactions"),
            VerifyError::FirstNotCoinbase => write!(f, "first transaction is not coinbase"),
            VerifyError::MerkleMismatch => write!(f, "merkle root mismatch"),
            VerifyError::MutatedMerkle => write!(f, "duplicate transaction in merkle tree"),
            VerifyError::UnexpectedWitness => write!(f, "witness data without commitment"),
            VerifyError::BadWitnessNonce => write!(f, "invalid coinbase witness reserved value"),
            VerifyError::WitnessCommitmentMismatch => write!(f, "witness commitment mismatch"),
        }
    }
}

impl std::error::Error for VerifyError {}

impl From<BlockDecodeError> for VerifyError {
    fn from(err: BlockDecodeError) -> Self {
        VerifyError::Decode(err)
    }
}

/// Merkle root over `ids` and whether the tree contains a duplicated
/// trailing pair (the CVE-2012-2459 malleation).
pub fn merkle_root(ids: &[Hash256]) -> (Hash256, bool) {
    if ids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = ids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let size = layer.len();
        let mut next = Vec::with_capacity(size.div_ceil(2));
        let mut i = 0usize;
        while i < size {
            let i2 = if i + 1 < size { i + 1 } else { i };
            if i2 == i + 1 && i2 + 1 == size && layer[i] == layer[i2] {
                mutated = true;
            }
            next.push(sha256d_pair(&layer[i], &layer[i2]));
            i += 2;
        }
        layer = next;
    }
    (layer[0], mutated)
}

pub fn verify_block(bytes: &[u8]) -> Result<BlockIds, VerifyError> {
    let block = Block::consensus_decode(bytes)?;
    let coinbase = block.transactions.first().ok_or(VerifyError::NoTransactions)?;
    if !coinbase.is_coinbase() {
        return Err(VerifyError::FirstNotCoinbase);
    }

    let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
    let (root, mutated) = merkle_root(&txids);
    if mutated {
        return Err(VerifyError::MutatedMerkle);
    }
    if root != block.header.merkle_root {
        return Err(VerifyError::MerkleMismatch);
    }

    // The coinbase wtxid is defined as zero.
    let mut wtxids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.wtxid()).collect();
    wtxids[0] = [0u8; 32];
    check_witness_commitment(&block, &wtxids)?;

    Ok(BlockIds { txids, wtxids })
}

fn check_witness_commitment(block: &Block, wtxids: &[Hash256]) -> Result<(), VerifyError> {
    let coinbase = &block.transactions[0];
    let commitment = coinbase
        .vout
        .iter()
        .rev()
        .find(|out| {
            out.script_pubkey.len() >= 38
                && out.script_pubkey[..6] == WITNESS_COMMITMENT_PREFIX
        })
        .map(|out| &out.script_pubkey[6..38]);

    let Some(commitment) = commitment else {
        if block.transactions.iter().any(|tx| tx.has_witness()) {
            return Err(VerifyError::UnexpectedWitness);
        }
        return Ok(());
    };

    let witness = &coinbase.vin[0].witness;
    if witness.len() != 1 || witness[0].len() != 32 {
        return Err(VerifyError::BadWitnessNonce);
    }
    let (witness_root, _) = merkle_root(wtxids);
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(&witness_root);
    preimage[32..].copy_from_slice(&witness[0]);
    if sha256d(&preimage)[..] != *commitment {
        return Err(VerifyError::WitnessCommitmentMismatch);
    }
    Ok(())
}

pub struct VerifyPool {
    pool: rayon::ThreadPool,
}

impl VerifyPool {
    /// `workers == 0` sizes the pool to the available cores.
    pub fn new(workers: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("verify-{index}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Verifies every block of the request; the first failing block (by
    /// position) decides the response.
    pub fn verify(&self, request: &VerifyRequest) -> VerifyResponse {
        let results: Vec<Result<BlockIds, VerifyError>> = self.pool.install(|| {
            request
                .block_buffers
                .par_iter()
                .map(|bytes| verify_block(bytes))
                .collect()
        });

        let mut txids = Vec::with_capacity(results.len());
        let mut wtxids = Vec::with_capacity(results.len());
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(ids) => {
                    txids.push(ids.txids);
                    wtxids.push(ids.wtxids);
                }
                Err(err) => {
                    return VerifyResponse::Invalid {
                        index,
                        error: err.to_string(),
                    }
                }
            }
        }
        VerifyResponse::Valid { txids, wtxids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(tag: u8) -> Hash256 {
        [tag; 32]
    }

    #[test]
    fn merkle_single_leaf_is_identity() {
        assert_eq!(merkle_root(&[id(7)]), (id(7), false));
        assert_eq!(merkle_root(&[]), ([0u8; 32], false));
    }

    #[test]
    fn merkle_odd_layer_duplicates_last() {
        let (three, mutated) = merkle_root(&[id(1), id(2), id(3)]);
        assert!(!mutated);
        let left = sha256d_pair(&id(1), &id(2));
        let right = sha256d_pair(&id(3), &id(3));
        assert_eq!(three, sha256d_pair(&left, &right));
    }

    #[test]
    fn merkle_detects_duplicated_pair() {
        let (honest, _) = merkle_root(&[id(1), id(2), id(3)]);
        let (forged, mutated) = merkle_root(&[id(1), id(2), id(3), id(3)]);
        assert_eq!(honest, forged);
        assert!(mutated);
    }
}
