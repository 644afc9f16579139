use btcnode_consensus::Hash256;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Double-SHA256 of two concatenated hashes, as used by merkle trees.
pub fn sha256d_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_empty_input() {
        let digest = sha256(b"");
        assert_eq!(digest[0], 0xe3);
        assert_eq!(digest[31], 0x55);
    }

    #[test]
    fn pair_hash_matches_concatenation() {
        let left = [1u8; 32];
        let right = [2u8; 32];
        let mut joined = Vec::new();
        joined.extend_from_slice(&left);
        joined.extend_from_slice(&right);
        assert_eq!(sha256d_pair(&left, &right), sha256d(&joined));
    }
}
