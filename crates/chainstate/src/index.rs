//! Hash lookup tables derived from the committed chain.

use std::collections::HashMap;

use btcnode_consensus::Hash256;

use crate::chain::Chain;

/// `hash -> height` and `prev_hash -> height`, rebuilt whole on every chain change.
#[derive(Debug, Default)]
pub struct ChainIndex {
    hash_to_height: HashMap<Hash256, i32>,
    prev_hash_to_height: HashMap<Hash256, i32>,
}

impl ChainIndex {
    pub fn rebuild(chain: &Chain) -> Self {
        let mut hash_to_height = HashMap::with_capacity(chain.len());
        let mut prev_hash_to_height = HashMap::with_capacity(chain.len());
        for (height, node) in chain.iter().enumerate() {
            let height = height as i32;
            hash_to_height.insert(node.hash, height);
            if height > 0 {
                prev_hash_to_height.insert(node.header.prev_block, height);
            }
        }
        Self {
            hash_to_height,
            prev_hash_to_height,
        }
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<i32> {
        self.hash_to_height.get(hash).copied()
    }

    /// Height of the block whose parent is `prev_hash`.
    pub fn child_height_of(&self, prev_hash: &Hash256) -> Option<i32> {
        self.prev_hash_to_height.get(prev_hash).copied()
    }
}
