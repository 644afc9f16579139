//! Regtest chains with real proof of work and scripted in-memory peers.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btcnode_chainstate::{Chain, ChainNode};
use btcnode_consensus::{chain_params, ChainParams, Hash256, Network};
use btcnode_pow::verify_proof_of_work;
use btcnode_primitives::block::{Block, BlockHeader};
use btcnode_primitives::encoding::Encoder;
use btcnode_primitives::outpoint::OutPoint;
use btcnode_primitives::transaction::{Transaction, TxIn, TxOut};

use crate::messages::{build_headers_payload, parse_getheaders, parse_inventory};
use crate::peer::{Expectation, Matcher, PeerError, PeerId, PeerLink, PeerPool, PendingExpectations};

const GENESIS_COINBASE: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";

pub fn regtest() -> ChainParams {
    chain_params(Network::Regtest)
}

fn hex_bytes(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("hex"))
        .collect()
}

fn coinbase(height: usize, salt: u8) -> Transaction {
    let mut script_sig = vec![0x04];
    script_sig.extend_from_slice(&(height as u32).to_le_bytes());
    script_sig.push(salt);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        vout: vec![TxOut {
            value: 50_0000_0000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn genesis_block(params: &ChainParams) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_bytes(&params.genesis_header);
    encoder.write_varint(1);
    encoder.write_bytes(&hex_bytes(GENESIS_COINBASE));
    encoder.into_inner()
}

/// Header over `prev` whose nonce satisfies the regtest target.
pub fn mine(prev: Hash256, merkle_root: Hash256, time: u32) -> BlockHeader {
    let mut header = BlockHeader {
        version: 4,
        prev_block: prev,
        merkle_root,
        time,
        bits: 0x207f_ffff,
        nonce: 0,
    };
    while !verify_proof_of_work(&header, &header.hash()) {
        header.nonce += 1;
    }
    header
}

/// A peer's view of the chain: headers and serialized blocks by height.
#[derive(Clone)]
pub struct MockChain {
    params: ChainParams,
    pub headers: Vec<BlockHeader>,
    blocks: Vec<Vec<u8>>,
}

impl MockChain {
    pub fn new(params: &ChainParams, height: usize, salt: u8) -> Self {
        let genesis = BlockHeader::consensus_decode(&params.genesis_header).expect("genesis");
        let mut chain = Self {
            params: params.clone(),
            headers: vec![genesis],
            blocks: vec![genesis_block(params)],
        };
        chain.extend(height, salt);
        chain
    }

    /// Shares heights `0..=at` with `self`, then grows `extra` new blocks.
    pub fn fork(&self, at: usize, extra: usize, salt: u8) -> Self {
        let mut chain = self.clone();
        chain.headers.truncate(at + 1);
        chain.blocks.truncate(at + 1);
        chain.extend(extra, salt);
        chain
    }

    fn extend(&mut self, count: usize, salt: u8) {
        for _ in 0..count {
            let height = self.headers.len();
            let tx = coinbase(height, salt);
            let prev = self.headers[height - 1].hash();
            let time = self.headers[0].time + 600 * height as u32;
            let header = mine(prev, tx.txid(), time);
            let block = Block {
                header: header.clone(),
                transactions: vec![tx],
            };
            self.blocks.push(block.consensus_encode());
            self.headers.push(header);
        }
    }

    pub fn hash(&self, height: usize) -> Hash256 {
        self.headers[height].hash()
    }

    pub fn block(&self, height: i32) -> &Vec<u8> {
        &self.blocks[height as usize]
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<usize> {
        self.headers.iter().position(|header| header.hash() == *hash)
    }

    pub fn block_by_hash(&self, hash: &Hash256) -> Option<&Vec<u8>> {
        self.height_of(hash).map(|height| &self.blocks[height])
    }

    pub fn to_chain(&self) -> Chain {
        let mut chain = Chain::new(ChainNode::genesis(&self.params).expect("genesis"));
        for header in &self.headers[1..] {
            let node = ChainNode::extend(chain.tip(), header.clone(), header.hash());
            chain.push(node);
        }
        chain
    }

    /// Re-grinds the header at `height` until it misses the target.
    pub fn break_pow(&mut self, height: usize) {
        let header = &mut self.headers[height];
        header.nonce = header.nonce.wrapping_add(1);
        while verify_proof_of_work(header, &header.hash()) {
            header.nonce = header.nonce.wrapping_add(1);
        }
    }

    /// Keeps the header but swaps in a coinbase that no longer matches its
    /// merkle root.
    pub fn corrupt_body(&mut self, height: usize) {
        let block = Block {
            header: self.headers[height].clone(),
            transactions: vec![coinbase(height, 0xee)],
        };
        self.blocks[height] = block.consensus_encode();
    }

    /// Header plus a transaction count with no transactions behind it.
    pub fn truncate_body(&mut self, height: usize) {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.headers[height].consensus_encode());
        encoder.write_varint(1);
        self.blocks[height] = encoder.into_inner();
    }
}

pub struct MockPeer {
    id: PeerId,
    connected: AtomicBool,
    chain: MockChain,
    scripted: Option<Mutex<VecDeque<Vec<BlockHeader>>>>,
    batch: AtomicUsize,
    withheld: Mutex<HashSet<Hash256>>,
    getdata_items: AtomicUsize,
    pending: PendingExpectations,
}

impl MockPeer {
    /// Serves `chain` the way a full node would.
    pub fn new(id: PeerId, chain: MockChain) -> Arc<Self> {
        Arc::new(Self {
            id,
            connected: AtomicBool::new(true),
            chain,
            scripted: None,
            batch: AtomicUsize::new(2_000),
            withheld: Mutex::new(HashSet::new()),
            getdata_items: AtomicUsize::new(0),
            pending: PendingExpectations::default(),
        })
    }

    /// Answers successive `getheaders` with `replies`, then with nothing.
    pub fn scripted(id: PeerId, replies: Vec<Vec<BlockHeader>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            connected: AtomicBool::new(true),
            chain: MockChain::new(&regtest(), 0, 0),
            scripted: Some(Mutex::new(replies.into())),
            batch: AtomicUsize::new(2_000),
            withheld: Mutex::new(HashSet::new()),
            getdata_items: AtomicUsize::new(0),
            pending: PendingExpectations::default(),
        })
    }

    pub fn with_batch(self: Arc<Self>, batch: usize) -> Arc<Self> {
        self.batch.store(batch, Ordering::Relaxed);
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn withhold(&self, hash: Hash256) {
        self.withheld.lock().expect("withheld").insert(hash);
    }

    pub fn getdata_items(&self) -> usize {
        self.getdata_items.load(Ordering::Relaxed)
    }

    fn headers_after(&self, locator: &[Hash256]) -> Vec<BlockHeader> {
        if let Some(scripted) = &self.scripted {
            return scripted
                .lock()
                .expect("scripted")
                .pop_front()
                .unwrap_or_default();
        }
        let start = locator
            .iter()
            .find_map(|hash| self.chain.height_of(hash))
            .unwrap_or(0);
        self.chain
            .headers
            .iter()
            .skip(start + 1)
            .take(self.batch.load(Ordering::Relaxed))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PeerLink for MockPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 18444 + self.id as u16))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send(&self, command: &str, payload: &[u8]) -> Result<(), PeerError> {
        if !self.is_connected() {
            return Err(PeerError::Disconnected);
        }
        match command {
            "getheaders" => {
                let request = parse_getheaders(payload)?;
                let reply = self.headers_after(&request.locator);
                self.pending
                    .dispatch("headers", &build_headers_payload(&reply));
            }
            "getdata" => {
                for item in parse_inventory(payload)? {
                    self.getdata_items.fetch_add(1, Ordering::Relaxed);
                    if self.withheld.lock().expect("withheld").contains(&item.hash) {
                        continue;
                    }
                    if let Some(block) = self.chain.block_by_hash(&item.hash) {
                        self.pending.dispatch("block", block);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn expect_raw(&self, command: &str, matcher: Matcher) -> Expectation {
        if !self.is_connected() {
            return Expectation::failed(PeerError::Disconnected);
        }
        self.pending.register(command, matcher)
    }
}

/// Picks peers in order instead of at random so tests are repeatable.
pub struct MockPool {
    peers: Vec<Arc<MockPeer>>,
    failures: Mutex<Vec<PeerId>>,
}

impl MockPool {
    pub fn new(peers: Vec<Arc<MockPeer>>) -> Arc<Self> {
        Arc::new(Self {
            peers,
            failures: Mutex::new(Vec::new()),
        })
    }

    pub fn failures(&self) -> Vec<PeerId> {
        self.failures.lock().expect("failures").clone()
    }
}

impl PeerPool for MockPool {
    fn peers(&self) -> Vec<Arc<dyn PeerLink>> {
        self.peers
            .iter()
            .filter(|peer| peer.is_connected())
            .map(|peer| Arc::clone(peer) as Arc<dyn PeerLink>)
            .collect()
    }

    fn random_peer(&self, exclude: &HashSet<PeerId>) -> Option<Arc<dyn PeerLink>> {
        self.peers
            .iter()
            .find(|peer| peer.is_connected() && !exclude.contains(&peer.id))
            .map(|peer| Arc::clone(peer) as Arc<dyn PeerLink>)
    }

    fn record_failure(&self, id: PeerId) {
        self.failures.lock().expect("failures").push(id);
        if let Some(peer) = self.peers.iter().find(|peer| peer.id == id) {
            peer.set_connected(false);
        }
    }
}
