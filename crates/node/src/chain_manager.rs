//! Owns the committed header chain and drives header sync and block
//! download against the peer pool.
//!
//! A sync attempt grows a candidate (the committed chain up to some base
//! height plus an uncommitted tail) from one peer's `headers` replies. The
//! candidate replaces the committed chain only when it carries strictly more
//! cumulative work, and only after the stores on disk reflect it.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use btcnode_chainstate::block_store::{BlockStore, BlockStoreError, DEFAULT_MAX_CHUNK_SIZE};
use btcnode_chainstate::header_store::{BlockLocation, ChainStore, ChainStoreError, HEADERS_FILE};
use btcnode_chainstate::{Chain, ChainIndex, ChainNode, VerifyPool, VerifyRequest, VerifyResponse};
use btcnode_consensus::{hash256_to_hex, ChainParams, Hash256};
use btcnode_pow::validate_pow_header;
use btcnode_primitives::block::BlockHeader;
use btcnode_primitives::encoding::DecodeError;

use crate::block_downloader::{BlockDownloader, RESPONSE_TIMEOUT};
use crate::messages::{build_getheaders_payload, parse_headers, MessageError};
use crate::peer::{PeerError, PeerId, PeerLink, PeerPool};

pub const DEFAULT_HEADER_CHUNK: i32 = 210_000;
pub const DEFAULT_BLOCK_BATCH: usize = 500;
/// Blocks requested and verified together inside one `download_blocks` call.
pub const DOWNLOAD_SUB_BATCH: usize = 100;
/// How long a peer that reported no new headers is left alone.
pub const AT_TIP_RECHECK: Duration = Duration::from_secs(60);
const LOCATOR_DENSE_ENTRIES: usize = 10;

#[derive(Clone, Debug)]
pub struct ChainManagerConfig {
    pub data_dir: PathBuf,
    pub max_chunk_size: u64,
    pub header_chunk: i32,
    pub verify_workers: usize,
    pub response_timeout: Duration,
    /// Added to the network's own banned hashes.
    pub banned_hashes: Vec<Hash256>,
}

impl ChainManagerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            header_chunk: DEFAULT_HEADER_CHUNK,
            verify_workers: 0,
            response_timeout: RESPONSE_TIMEOUT,
            banned_hashes: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub enum StorageError {
    Headers(ChainStoreError),
    Blocks(BlockStoreError),
    Io(std::io::Error),
    Genesis(DecodeError),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Headers(err) => write!(f, "{err}"),
            StorageError::Blocks(err) => write!(f, "{err}"),
            StorageError::Io(err) => write!(f, "{err}"),
            StorageError::Genesis(err) => write!(f, "invalid genesis header: {err}"),
        }
    }
}

#[derive(Debug)]
pub enum SyncError {
    Protocol(String),
    Peer(PeerError),
    Storage(StorageError),
    Worker(String),
}

impl SyncError {
    /// Storage and worker failures end the node; everything else only ends
    /// the current attempt with one peer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Storage(_) | SyncError::Worker(_))
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Protocol(message) => write!(f, "protocol violation: {message}"),
            SyncError::Peer(err) => write!(f, "{err}"),
            SyncError::Storage(err) => write!(f, "storage error: {err}"),
            SyncError::Worker(message) => write!(f, "verification worker failed: {message}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<PeerError> for SyncError {
    fn from(err: PeerError) -> Self {
        SyncError::Peer(err)
    }
}

impl From<MessageError> for SyncError {
    fn from(err: MessageError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<ChainStoreError> for SyncError {
    fn from(err: ChainStoreError) -> Self {
        SyncError::Storage(StorageError::Headers(err))
    }
}

impl From<BlockStoreError> for SyncError {
    fn from(err: BlockStoreError) -> Self {
        SyncError::Storage(StorageError::Blocks(err))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(StorageError::Io(err))
    }
}

impl From<DecodeError> for SyncError {
    fn from(err: DecodeError) -> Self {
        SyncError::Storage(StorageError::Genesis(err))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The peer had nothing past the candidate tip.
    AtTip,
    /// The candidate reached the requested height; more may follow.
    Capped,
    /// A header failed validation; the prefix before it was kept.
    Rejected(String),
}

/// Committed heights `0..=base` followed by headers not yet committed.
struct Candidate {
    base: i32,
    tail: Vec<ChainNode>,
    forked: bool,
}

impl Candidate {
    fn new(chain: &Chain) -> Self {
        Self {
            base: chain.height(),
            tail: Vec::new(),
            forked: false,
        }
    }

    fn height(&self) -> i32 {
        self.base + self.tail.len() as i32
    }

    fn tip<'a>(&'a self, chain: &'a Chain) -> &'a ChainNode {
        match self.tail.last() {
            Some(node) => node,
            None => chain.at(self.base).unwrap_or_else(|| chain.tip()),
        }
    }

    /// Cuts the candidate back so that `prev_hash` is its tip, returning the
    /// new tip height.
    fn rewind_to(&mut self, prev_hash: &Hash256, index: &ChainIndex) -> Option<i32> {
        if let Some(height) = index.height_of(prev_hash) {
            self.base = height;
            self.tail.clear();
            return Some(height);
        }
        let position = self.tail.iter().rposition(|node| node.hash == *prev_hash)?;
        self.tail.truncate(position + 1);
        Some(self.height())
    }
}

/// Locator for `chain`: the ten most recent hashes, then exponentially
/// sparser ancestors, always ending with genesis.
pub fn build_locator(chain: &Chain) -> Vec<Hash256> {
    let mut locator = Vec::new();
    let mut height = chain.height();
    let mut step: i32 = 1;
    while let Some(node) = chain.at(height) {
        locator.push(node.hash);
        if height == 0 {
            break;
        }
        if locator.len() >= LOCATOR_DENSE_ENTRIES {
            step = step.saturating_mul(2);
        }
        height = height.saturating_sub(step).max(0);
    }
    let genesis = chain.genesis().hash;
    if locator.last() != Some(&genesis) {
        locator.push(genesis);
    }
    locator
}

/// Rewrites every header marker that disagrees with the block index: heights
/// the block store holds point at their stored body, all others are cleared.
/// An interrupted block write or reorg leaves the two out of step.
fn reconcile_block_locations(headers: &mut ChainStore, blocks: &BlockStore) -> Result<usize, SyncError> {
    let mut repaired = 0;
    for (height, marker) in headers.block_locations()?.into_iter().enumerate() {
        let height = height as i32;
        let expected = if height <= blocks.height() {
            Some(blocks.location_at(height)?)
        } else {
            None
        };
        if marker != expected {
            headers.set_block_location(height, expected)?;
            repaired += 1;
        }
    }
    Ok(repaired)
}

pub struct ChainManager<P> {
    params: ChainParams,
    config: ChainManagerConfig,
    chain: Chain,
    index: ChainIndex,
    headers: ChainStore,
    blocks: BlockStore,
    pool: Arc<P>,
    downloader: BlockDownloader<P>,
    verifier: Arc<VerifyPool>,
    banned: HashSet<Hash256>,
    peers_at_tip: HashMap<PeerId, Instant>,
}

impl<P: PeerPool + 'static> ChainManager<P> {
    /// Opens (or seeds with genesis) the stores under `config.data_dir` and
    /// replays the stored headers.
    pub fn open(params: ChainParams, config: ChainManagerConfig, pool: Arc<P>) -> Result<Self, SyncError> {
        fs::create_dir_all(&config.data_dir)?;
        let genesis = ChainNode::genesis(&params)?;
        let mut chain = Chain::new(genesis.clone());

        let mut headers = ChainStore::open(config.data_dir.join(HEADERS_FILE))?;
        if headers.is_empty() {
            headers.init(&genesis)?;
            log_info!("initialized {} with genesis", headers.path().display());
        } else {
            headers.load(&mut chain, &params)?;
        }

        let mut blocks = BlockStore::open(&config.data_dir, config.max_chunk_size)?;
        if blocks.height() > chain.height() {
            log_warn!(
                "block store ends at {} past header tip {}; truncating",
                blocks.height(),
                chain.height()
            );
            blocks.truncate(chain.height())?;
        }
        let repaired = reconcile_block_locations(&mut headers, &blocks)?;
        if repaired > 0 {
            log_warn!("repaired {repaired} block location markers in {}", headers.path().display());
        }

        let verifier =
            VerifyPool::new(config.verify_workers).map_err(|err| SyncError::Worker(err.to_string()))?;
        let mut banned: HashSet<Hash256> = params.banned_hashes.iter().copied().collect();
        banned.extend(config.banned_hashes.iter().copied());
        let index = ChainIndex::rebuild(&chain);
        let downloader = BlockDownloader::new(Arc::clone(&pool), config.response_timeout);

        log_info!(
            "{} header tip {} {}, blocks stored through {}, {} verify workers",
            params.network.as_str(),
            chain.height(),
            hash256_to_hex(&chain.tip().hash),
            blocks.height(),
            verifier.workers()
        );
        Ok(Self {
            params,
            config,
            chain,
            index,
            headers,
            blocks,
            pool,
            downloader,
            verifier: Arc::new(verifier),
            banned,
            peers_at_tip: HashMap::new(),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn height(&self) -> i32 {
        self.chain.height()
    }

    pub fn block_height(&self) -> i32 {
        self.blocks.height()
    }

    pub fn height_of(&self, hash: &Hash256) -> Option<i32> {
        self.index.height_of(hash)
    }

    pub fn block_location(&mut self, height: i32) -> Result<Option<BlockLocation>, SyncError> {
        Ok(self.headers.block_location(height)?)
    }

    pub fn read_block(&self, height: i32) -> Result<Vec<u8>, SyncError> {
        Ok(self.blocks.read_block(height)?)
    }

    /// Pulls headers from one peer until it has nothing more, the candidate
    /// reaches `target_height`, or a header fails validation. Whatever valid
    /// candidate exists at that point is offered to `commit_peer_chain`.
    pub async fn sync_headers_from_peer(
        &mut self,
        peer: Arc<dyn PeerLink>,
        target_height: i32,
    ) -> Result<SyncOutcome, SyncError> {
        let mut candidate = Candidate::new(&self.chain);
        let mut locator = build_locator(&self.chain);
        loop {
            if candidate.height() >= target_height {
                self.commit_peer_chain(&candidate)?;
                return Ok(SyncOutcome::Capped);
            }
            if !peer.is_connected() {
                return Err(SyncError::Peer(PeerError::Disconnected));
            }

            let waiting = peer.expect_raw("headers", Box::new(|_: &[u8]| true));
            peer.send("getheaders", &build_getheaders_payload(&locator))
                .await?;
            let payload = waiting.wait(self.config.response_timeout).await?;
            let headers = parse_headers(&payload)?;

            let Some(first) = headers.first() else {
                self.commit_peer_chain(&candidate)?;
                return Ok(SyncOutcome::AtTip);
            };
            if first.prev_block != candidate.tip(&self.chain).hash {
                if candidate.forked {
                    return Err(SyncError::Protocol(format!(
                        "peer {} signalled a second fork in one sync",
                        peer.id()
                    )));
                }
                let Some(height) = candidate.rewind_to(&first.prev_block, &self.index) else {
                    return Err(SyncError::Protocol(format!(
                        "headers build on unknown block {}",
                        hash256_to_hex(&first.prev_block)
                    )));
                };
                candidate.forked = true;
                match self.index.child_height_of(&first.prev_block) {
                    Some(replaced) => log_info!(
                        "peer {} forks from height {height}, replacing committed headers from {replaced}",
                        peer.id()
                    ),
                    None => log_info!("peer {} forks from height {height}", peer.id()),
                }
            }

            let received = headers.len();
            for header in headers {
                let hash = header.hash();
                let parent = candidate.tip(&self.chain);
                if let Err(reason) = self.check_header(&header, &hash, &parent.hash) {
                    log_warn!(
                        "peer {} sent invalid header {} at height {}: {reason}",
                        peer.id(),
                        hash256_to_hex(&hash),
                        candidate.height() + 1
                    );
                    self.commit_peer_chain(&candidate)?;
                    return Ok(SyncOutcome::Rejected(reason));
                }
                let node = ChainNode::extend(parent, header, hash);
                candidate.tail.push(node);
            }
            log_debug!(
                "peer {} sent {received} headers, candidate height {}",
                peer.id(),
                candidate.height()
            );
            locator = vec![candidate.tip(&self.chain).hash];
        }
    }

    fn check_header(&self, header: &BlockHeader, hash: &Hash256, parent: &Hash256) -> Result<(), String> {
        if header.prev_block != *parent {
            return Err("header does not connect to its predecessor".to_string());
        }
        if self.banned.contains(hash) {
            return Err("banned block hash".to_string());
        }
        validate_pow_header(header, hash, &self.params).map_err(|err| err.to_string())
    }

    /// Adopts `candidate` if it has strictly more work than the committed
    /// chain. Returns whether the tip changed.
    fn commit_peer_chain(&mut self, candidate: &Candidate) -> Result<bool, SyncError> {
        let work = candidate.tip(&self.chain).cumulative_work;
        if work <= self.chain.tip().cumulative_work {
            if !candidate.tail.is_empty() {
                log_debug!(
                    "candidate at height {} has no more work than our tip {}; keeping ours",
                    candidate.height(),
                    self.chain.height()
                );
            }
            return Ok(false);
        }

        let reorg = candidate.base < self.chain.height();
        if reorg {
            log_warn!(
                "reorganizing from height {} to {} (fork at {})",
                self.chain.height(),
                candidate.height(),
                candidate.base
            );
            if self.blocks.height() > candidate.base {
                self.blocks.truncate(candidate.base)?;
            }
            self.headers.truncate(candidate.base)?;
        }
        self.headers.append(&candidate.tail)?;

        self.chain.truncate(candidate.base);
        self.chain.append(candidate.tail.iter().cloned());
        self.index = ChainIndex::rebuild(&self.chain);
        self.peers_at_tip.clear();
        log_info!(
            "header tip {} {}",
            self.chain.height(),
            hash256_to_hex(&self.chain.tip().hash)
        );
        Ok(true)
    }

    /// One header pass over every connected peer, in turn. Returns whether
    /// the committed tip changed.
    pub async fn sync_headers_from_peers(&mut self) -> Result<bool, SyncError> {
        let start_tip = self.chain.tip().hash;
        let now = Instant::now();
        self.peers_at_tip
            .retain(|_, seen| now.duration_since(*seen) < AT_TIP_RECHECK);

        for peer in self.pool.peers() {
            if self.peers_at_tip.contains_key(&peer.id()) {
                continue;
            }
            while peer.is_connected() {
                let tip_before = self.chain.tip().hash;
                let target = self.chain.height().saturating_add(self.config.header_chunk.max(1));
                match self.sync_headers_from_peer(Arc::clone(&peer), target).await {
                    Ok(SyncOutcome::AtTip) => {
                        self.peers_at_tip.insert(peer.id(), Instant::now());
                        break;
                    }
                    Ok(SyncOutcome::Capped) => {
                        if self.chain.tip().hash == tip_before {
                            break;
                        }
                    }
                    Ok(SyncOutcome::Rejected(reason)) => {
                        log_warn!("rejecting peer {}: {reason}", peer.id());
                        self.pool.record_failure(peer.id());
                        break;
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        log_warn!("header sync with peer {} failed: {err}", peer.id());
                        self.pool.record_failure(peer.id());
                        break;
                    }
                }
            }
        }
        Ok(self.chain.tip().hash != start_tip)
    }

    /// Downloads, verifies and stores up to `batch_size` blocks following the
    /// stored block tip. Stops at the first block that could not be fetched
    /// or failed verification. Returns the number of blocks stored.
    pub async fn download_blocks(&mut self, batch_size: usize) -> Result<usize, SyncError> {
        let start = self.blocks.height() + 1;
        let batch = i32::try_from(batch_size).unwrap_or(i32::MAX);
        let end = self
            .chain
            .height()
            .saturating_add(1)
            .min(start.saturating_add(batch));
        let mut height = start;
        let mut stored = 0usize;

        while height < end {
            let sub_end = end.min(height.saturating_add(DOWNLOAD_SUB_BATCH as i32));
            let hashes: Vec<Hash256> = (height..sub_end)
                .filter_map(|h| self.chain.at(h))
                .map(|node| node.hash)
                .collect();
            let mut fetched = self.downloader.download_batch(&hashes).await;

            let mut bodies = Vec::with_capacity(hashes.len());
            let mut servers = Vec::with_capacity(hashes.len());
            for hash in &hashes {
                match fetched.remove(hash) {
                    Some(block) => {
                        servers.push(block.peer);
                        bodies.push(block.body);
                    }
                    None => break,
                }
            }
            let fetched_all = bodies.len() == hashes.len();
            if bodies.is_empty() {
                log_warn!("could not download block at height {height}");
                break;
            }

            let verifier = Arc::clone(&self.verifier);
            let request = VerifyRequest {
                block_buffers: bodies,
            };
            let (request, response) = tokio::task::spawn_blocking(move || {
                let response = verifier.verify(&request);
                (request, response)
            })
            .await
            .map_err(|err| SyncError::Worker(err.to_string()))?;

            let count = request.block_buffers.len();
            let valid = match response {
                VerifyResponse::Valid { .. } => count,
                VerifyResponse::Invalid { index, error } => {
                    log_warn!("block at height {} is invalid: {error}", height + index as i32);
                    if let Some(peer) = servers.get(index) {
                        log_warn!("peer {peer} served an invalid block");
                        self.pool.record_failure(*peer);
                    }
                    index
                }
            };
            for body in request.block_buffers.into_iter().take(valid) {
                let block = self.blocks.append(&body)?;
                self.headers
                    .set_block_location(block.height, Some(block.location))?;
                stored += 1;
            }
            if valid < count || !fetched_all {
                break;
            }
            height = sub_end;
        }

        if stored > 0 {
            log_info!(
                "stored {stored} blocks, block tip {} of {}",
                self.blocks.height(),
                self.chain.height()
            );
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{regtest, MockChain, MockPeer, MockPool};

    fn config(dir: &std::path::Path) -> ChainManagerConfig {
        let mut config = ChainManagerConfig::new(dir);
        config.max_chunk_size = 4_096;
        config.verify_workers = 2;
        config.response_timeout = Duration::from_millis(50);
        config
    }

    fn manager(dir: &std::path::Path, pool: &Arc<MockPool>) -> ChainManager<MockPool> {
        ChainManager::open(regtest(), config(dir), Arc::clone(pool)).expect("open")
    }

    #[test]
    fn locator_is_dense_then_sparse() {
        let chain = MockChain::new(&regtest(), 100, 1).to_chain();
        let locator = build_locator(&chain);
        let heights: Vec<i32> = locator
            .iter()
            .map(|hash| {
                chain
                    .iter()
                    .position(|node| node.hash == *hash)
                    .expect("known") as i32
            })
            .collect();
        assert_eq!(
            heights,
            vec![100, 99, 98, 97, 96, 95, 94, 93, 92, 91, 89, 85, 77, 61, 29, 0]
        );

        let genesis_only = MockChain::new(&regtest(), 0, 1).to_chain();
        assert_eq!(build_locator(&genesis_only), vec![genesis_only.genesis().hash]);
    }

    #[tokio::test]
    async fn open_seeds_genesis_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = MockChain::new(&regtest(), 12, 1);
        let pool = MockPool::new(vec![MockPeer::new(1, remote.clone())]);
        {
            let mgr = manager(dir.path(), &pool);
            assert_eq!(mgr.height(), 0);
            assert_eq!(mgr.chain().tip().hash, regtest().hash_genesis_block);
        }
        let mut mgr = manager(dir.path(), &pool);
        assert!(mgr.sync_headers_from_peers().await.expect("sync"));
        assert_eq!(mgr.height(), 12);
        drop(mgr);

        let reopened = manager(dir.path(), &pool);
        assert_eq!(reopened.height(), 12);
        assert_eq!(reopened.chain().tip().hash, remote.hash(12));
        assert_eq!(reopened.height_of(&remote.hash(7)), Some(7));
    }

    #[tokio::test]
    async fn heavier_fork_replaces_local_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ours = MockChain::new(&regtest(), 10, 1);
        let theirs = ours.fork(6, 6, 2);
        let pool = MockPool::new(vec![MockPeer::new(1, ours.clone())]);
        let mut mgr = manager(dir.path(), &pool);
        mgr.sync_headers_from_peers().await.expect("sync ours");
        assert_eq!(mgr.download_blocks(100).await.expect("download"), 11);
        assert_eq!(mgr.block_height(), 10);

        let rival = MockPeer::new(2, theirs.clone());
        let outcome = mgr
            .sync_headers_from_peer(rival, i32::MAX)
            .await
            .expect("sync theirs");
        assert_eq!(outcome, SyncOutcome::AtTip);
        assert_eq!(mgr.height(), 12);
        assert_eq!(mgr.chain().tip().hash, theirs.hash(12));
        assert_eq!(mgr.height_of(&ours.hash(7)), None);
        assert_eq!(mgr.height_of(&theirs.hash(7)), Some(7));
        assert_eq!(mgr.block_height(), 6);
        assert!(mgr.block_location(6).expect("marker").is_some());
        assert_eq!(mgr.block_location(7).expect("marker"), None);
        drop(mgr);

        let len = std::fs::metadata(dir.path().join(HEADERS_FILE))
            .expect("headers")
            .len();
        assert_eq!(len, 13 * 87);
        let reopened = manager(dir.path(), &pool);
        assert_eq!(reopened.chain().tip().hash, theirs.hash(12));
        assert_eq!(reopened.block_height(), 6);
    }

    #[tokio::test]
    async fn lighter_fork_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ours = MockChain::new(&regtest(), 10, 1);
        let theirs = ours.fork(6, 3, 2);
        let pool = MockPool::new(vec![MockPeer::new(1, ours.clone())]);
        let mut mgr = manager(dir.path(), &pool);
        mgr.sync_headers_from_peers().await.expect("sync ours");

        let outcome = mgr
            .sync_headers_from_peer(MockPeer::new(2, theirs), i32::MAX)
            .await
            .expect("sync theirs");
        assert_eq!(outcome, SyncOutcome::AtTip);
        assert_eq!(mgr.height(), 10);
        assert_eq!(mgr.chain().tip().hash, ours.hash(10));
    }

    #[tokio::test]
    async fn second_fork_signal_aborts_without_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ours = MockChain::new(&regtest(), 10, 1);
        let pool = MockPool::new(vec![MockPeer::new(1, ours.clone())]);
        let mut mgr = manager(dir.path(), &pool);
        mgr.sync_headers_from_peers().await.expect("sync ours");

        let first = ours.fork(6, 3, 2);
        let second = first.fork(7, 5, 3);
        let liar = MockPeer::scripted(
            2,
            vec![first.headers[7..=9].to_vec(), second.headers[8..=12].to_vec()],
        );
        let result = mgr.sync_headers_from_peer(liar, i32::MAX).await;
        assert!(matches!(result, Err(SyncError::Protocol(_))));
        assert_eq!(mgr.chain().tip().hash, ours.hash(10));
    }

    #[tokio::test]
    async fn unknown_ancestor_is_a_protocol_violation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = MockPool::new(Vec::new());
        let mut mgr = manager(dir.path(), &pool);
        let stranger = MockChain::new(&regtest(), 6, 4);
        let peer = MockPeer::scripted(3, vec![stranger.headers[3..=6].to_vec()]);
        let result = mgr.sync_headers_from_peer(peer, i32::MAX).await;
        assert!(matches!(result, Err(SyncError::Protocol(_))));
        assert_eq!(mgr.height(), 0);
    }

    #[tokio::test]
    async fn capped_sync_commits_and_resumes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = MockChain::new(&regtest(), 12, 1);
        let peer = MockPeer::new(1, remote.clone()).with_batch(4);
        let pool = MockPool::new(vec![Arc::clone(&peer)]);
        let mut mgr = manager(dir.path(), &pool);

        let outcome = mgr
            .sync_headers_from_peer(Arc::clone(&peer) as Arc<dyn PeerLink>, 5)
            .await
            .expect("sync");
        assert_eq!(outcome, SyncOutcome::Capped);
        assert_eq!(mgr.height(), 8);

        mgr.config.header_chunk = 5;
        assert!(mgr.sync_headers_from_peers().await.expect("sync all"));
        assert_eq!(mgr.height(), 12);
        assert_eq!(mgr.chain().tip().hash, remote.hash(12));
        assert!(pool.failures().is_empty());
    }

    #[tokio::test]
    async fn invalid_header_keeps_valid_prefix_and_fails_peer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut remote = MockChain::new(&regtest(), 10, 1);
        remote.break_pow(5);
        let pool = MockPool::new(vec![MockPeer::new(7, remote.clone())]);
        let mut mgr = manager(dir.path(), &pool);

        assert!(mgr.sync_headers_from_peers().await.expect("sync"));
        assert_eq!(mgr.height(), 4);
        assert_eq!(mgr.chain().tip().hash, remote.hash(4));
        assert_eq!(pool.failures(), vec![7]);
    }

    #[tokio::test]
    async fn banned_hash_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = MockChain::new(&regtest(), 6, 1);
        let pool = MockPool::new(Vec::new());
        let mut config = config(dir.path());
        config.banned_hashes.push(remote.hash(3));
        let mut mgr = ChainManager::open(regtest(), config, Arc::clone(&pool)).expect("open");

        let outcome = mgr
            .sync_headers_from_peer(MockPeer::new(1, remote), i32::MAX)
            .await
            .expect("sync");
        assert_eq!(outcome, SyncOutcome::Rejected("banned block hash".to_string()));
        assert_eq!(mgr.height(), 2);
    }

    #[tokio::test]
    async fn disconnected_peer_is_recoverable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = MockChain::new(&regtest(), 3, 1);
        let peer = MockPeer::new(1, remote);
        peer.set_connected(false);
        let pool = MockPool::new(Vec::new());
        let mut mgr = manager(dir.path(), &pool);
        let err = mgr
            .sync_headers_from_peer(peer, i32::MAX)
            .await
            .expect_err("offline");
        assert!(!err.is_fatal());
        assert!(matches!(err, SyncError::Peer(PeerError::Disconnected)));
    }

    #[tokio::test]
    async fn downloads_store_and_mark_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = MockChain::new(&regtest(), 10, 1);
        let pool = MockPool::new(vec![MockPeer::new(1, remote.clone())]);
        let mut mgr = manager(dir.path(), &pool);
        mgr.sync_headers_from_peers().await.expect("sync");

        assert_eq!(mgr.download_blocks(4).await.expect("first batch"), 4);
        assert_eq!(mgr.block_height(), 3);
        assert_eq!(mgr.download_blocks(100).await.expect("rest"), 7);
        assert_eq!(mgr.download_blocks(100).await.expect("nothing"), 0);
        for height in 0..=10 {
            assert_eq!(&mgr.read_block(height).expect("read"), remote.block(height));
            assert!(mgr.block_location(height).expect("marker").is_some());
        }
    }

    #[tokio::test]
    async fn reopen_marks_block_stored_before_its_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = MockChain::new(&regtest(), 5, 1);
        let pool = MockPool::new(vec![MockPeer::new(1, remote.clone())]);
        let mut mgr = manager(dir.path(), &pool);
        mgr.sync_headers_from_peers().await.expect("sync");
        assert_eq!(mgr.download_blocks(3).await.expect("download"), 3);

        // Body written, marker update never reached.
        let stored = mgr.blocks.append(remote.block(3)).expect("append");
        assert_eq!(mgr.block_location(3).expect("marker"), None);
        drop(mgr);

        let mut mgr = manager(dir.path(), &pool);
        assert_eq!(mgr.block_height(), 3);
        assert_eq!(mgr.block_location(3).expect("marker"), Some(stored.location));
        assert_eq!(mgr.download_blocks(100).await.expect("rest"), 2);
        for height in 0..=5 {
            assert_eq!(
                mgr.block_location(height).expect("marker"),
                Some(mgr.blocks.location_at(height).expect("start"))
            );
        }
    }

    #[tokio::test]
    async fn reopen_clears_markers_above_truncated_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = MockChain::new(&regtest(), 10, 1);
        let pool = MockPool::new(vec![MockPeer::new(1, remote.clone())]);
        let mut mgr = manager(dir.path(), &pool);
        mgr.sync_headers_from_peers().await.expect("sync");
        assert_eq!(mgr.download_blocks(100).await.expect("download"), 11);

        // Blocks cut back for a reorg, headers not yet.
        mgr.blocks.truncate(6).expect("truncate");
        drop(mgr);

        let mut mgr = manager(dir.path(), &pool);
        assert_eq!(mgr.height(), 10);
        assert_eq!(mgr.block_height(), 6);
        assert!(mgr.block_location(6).expect("marker").is_some());
        for height in 7..=10 {
            assert_eq!(mgr.block_location(height).expect("marker"), None);
        }
        assert_eq!(mgr.download_blocks(100).await.expect("refill"), 4);
        assert_eq!(&mgr.read_block(10).expect("read"), remote.block(10));
    }

    #[tokio::test]
    async fn reopen_truncates_blocks_past_header_tip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = MockChain::new(&regtest(), 10, 1);
        let pool = MockPool::new(vec![MockPeer::new(1, remote.clone())]);
        let mut mgr = manager(dir.path(), &pool);
        mgr.sync_headers_from_peers().await.expect("sync");
        assert_eq!(mgr.download_blocks(100).await.expect("download"), 11);

        mgr.headers.truncate(6).expect("truncate headers");
        drop(mgr);

        let mut mgr = manager(dir.path(), &pool);
        assert_eq!(mgr.height(), 6);
        assert_eq!(mgr.block_height(), 6);
        for height in 0..=6 {
            assert!(mgr.block_location(height).expect("marker").is_some());
        }
        assert_eq!(&mgr.read_block(6).expect("read"), remote.block(6));
    }

    #[tokio::test]
    async fn download_halts_at_missing_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = MockChain::new(&regtest(), 10, 1);
        let peer = MockPeer::new(1, remote.clone());
        let pool = MockPool::new(vec![Arc::clone(&peer)]);
        let mut mgr = manager(dir.path(), &pool);
        mgr.sync_headers_from_peers().await.expect("sync");

        peer.withhold(remote.hash(4));
        assert_eq!(mgr.download_blocks(100).await.expect("download"), 4);
        assert_eq!(mgr.block_height(), 3);
        assert_eq!(mgr.block_location(4).expect("marker"), None);
    }

    #[tokio::test]
    async fn download_halts_at_invalid_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut remote = MockChain::new(&regtest(), 10, 1);
        remote.corrupt_body(6);
        let pool = MockPool::new(vec![MockPeer::new(1, remote.clone())]);
        let mut mgr = manager(dir.path(), &pool);
        mgr.sync_headers_from_peers().await.expect("sync");

        assert_eq!(mgr.download_blocks(100).await.expect("download"), 6);
        assert_eq!(mgr.block_height(), 5);
        assert_eq!(pool.failures(), vec![1]);
    }

    #[tokio::test]
    async fn peer_serving_bad_merkle_root_is_failed_and_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = MockChain::new(&regtest(), 10, 1);
        let mut tampered = remote.clone();
        tampered.corrupt_body(6);
        let pool = MockPool::new(vec![
            MockPeer::new(1, tampered),
            MockPeer::new(2, remote.clone()),
        ]);
        let mut mgr = manager(dir.path(), &pool);
        mgr.sync_headers_from_peers().await.expect("sync");

        assert_eq!(mgr.download_blocks(100).await.expect("first pass"), 6);
        assert_eq!(pool.failures(), vec![1]);
        assert_eq!(mgr.download_blocks(100).await.expect("second pass"), 5);
        assert_eq!(mgr.block_height(), 10);
        assert_eq!(&mgr.read_block(6).expect("read"), remote.block(6));
    }
}
