//! In-memory header chain with cumulative work.

use btcnode_consensus::{ChainParams, Hash256};
use btcnode_pow::{header_work, ChainWork};
use btcnode_primitives::block::BlockHeader;
use btcnode_primitives::encoding::DecodeError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainNode {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub cumulative_work: ChainWork,
}

impl ChainNode {
    pub fn genesis(params: &ChainParams) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(&params.genesis_header)?;
        Ok(Self {
            cumulative_work: ChainWork::from(header_work(header.bits)),
            hash: params.hash_genesis_block,
            header,
        })
    }

    /// Node for `header` on top of `parent`. Linkage is the caller's concern.
    pub fn extend(parent: &ChainNode, header: BlockHeader, hash: Hash256) -> Self {
        let cumulative_work = parent.cumulative_work + ChainWork::from(header_work(header.bits));
        Self {
            header,
            hash,
            cumulative_work,
        }
    }
}

/// Height-indexed header sequence. Never empty: height 0 is genesis.
#[derive(Clone, Debug)]
pub struct Chain {
    nodes: Vec<ChainNode>,
}

impl Chain {
    pub fn new(genesis: ChainNode) -> Self {
        Self {
            nodes: vec![genesis],
        }
    }

    pub fn push(&mut self, node: ChainNode) {
        self.nodes.push(node);
    }

    pub fn append(&mut self, nodes: impl IntoIterator<Item = ChainNode>) {
        self.nodes.extend(nodes);
    }

    /// Keeps heights `0..=height`. Genesis is always retained.
    pub fn truncate(&mut self, height: i32) {
        let keep = usize::try_from(height).map_or(1, |h| h + 1).max(1);
        self.nodes.truncate(keep);
    }

    pub fn at(&self, height: i32) -> Option<&ChainNode> {
        usize::try_from(height).ok().and_then(|h| self.nodes.get(h))
    }

    pub fn tip(&self) -> &ChainNode {
        &self.nodes[self.nodes.len() - 1]
    }

    pub fn genesis(&self) -> &ChainNode {
        &self.nodes[0]
    }

    pub fn height(&self) -> i32 {
        self.nodes.len() as i32 - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChainNode> {
        self.nodes.iter()
    }

    /// Nodes strictly above `height`.
    pub fn above(&self, height: i32) -> &[ChainNode] {
        let start = usize::try_from(height.saturating_add(1)).unwrap_or(0).min(self.nodes.len());
        &self.nodes[start..]
    }
}
