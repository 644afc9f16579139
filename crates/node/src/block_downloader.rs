//! Fetches full blocks by hash from whichever peers are available.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use btcnode_consensus::constants::{HEADER_SIZE, MSG_WITNESS_BLOCK};
use btcnode_consensus::{hash256_to_hex, Hash256};
use btcnode_primitives::block::RawBlock;
use btcnode_primitives::hash::sha256d;
use tokio::task::JoinSet;

use crate::messages::{build_getdata_payload, Inventory};
use crate::peer::{PeerError, PeerId, PeerPool};

pub const DOWNLOAD_ATTEMPTS: usize = 5;
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum DownloadError {
    Exhausted { hash: Hash256, last: String },
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::Exhausted { hash, last } => write!(
                f,
                "block {} not downloaded after {DOWNLOAD_ATTEMPTS} attempts: {last}",
                hash256_to_hex(hash)
            ),
        }
    }
}

impl std::error::Error for DownloadError {}

/// A block body and the peer that served it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadedBlock {
    pub peer: PeerId,
    pub body: Vec<u8>,
}

pub struct BlockDownloader<P> {
    pool: Arc<P>,
    timeout: Duration,
}

impl<P> Clone for BlockDownloader<P> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            timeout: self.timeout,
        }
    }
}

impl<P: PeerPool + 'static> BlockDownloader<P> {
    pub fn new(pool: Arc<P>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Serialized block whose header hashes to `hash`.
    pub async fn download_block(&self, hash: Hash256) -> Result<DownloadedBlock, DownloadError> {
        let mut tried = HashSet::new();
        let mut last = String::from("no peers available");
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            let peer = self
                .pool
                .random_peer(&tried)
                .or_else(|| self.pool.random_peer(&HashSet::new()));
            let Some(peer) = peer else {
                log_debug!(
                    "no peer for block {} (attempt {attempt}/{DOWNLOAD_ATTEMPTS})",
                    hash256_to_hex(&hash)
                );
                continue;
            };
            tried.insert(peer.id());

            let waiting = peer.expect_raw(
                "block",
                Box::new(move |payload: &[u8]| {
                    payload.len() >= HEADER_SIZE && sha256d(&payload[..HEADER_SIZE]) == hash
                }),
            );
            let request = build_getdata_payload(&[Inventory {
                inv_type: MSG_WITNESS_BLOCK,
                hash,
            }]);
            let result = match peer.send("getdata", &request).await {
                Ok(()) => waiting.wait(self.timeout).await,
                Err(err) => Err(err),
            };
            let error = match result {
                Ok(block) => {
                    let decoded = RawBlock::split(&block).map(|_| ());
                    match decoded {
                        Ok(()) => {
                            return Ok(DownloadedBlock {
                                peer: peer.id(),
                                body: block,
                            })
                        }
                        Err(err) => {
                            self.pool.record_failure(peer.id());
                            PeerError::Protocol(format!("undecodable block: {err}"))
                        }
                    }
                }
                Err(err) => err,
            };
            log_debug!(
                "block {} from peer {} failed (attempt {attempt}/{DOWNLOAD_ATTEMPTS}): {error}",
                hash256_to_hex(&hash),
                peer.id()
            );
            last = error.to_string();
        }
        Err(DownloadError::Exhausted { hash, last })
    }

    /// Downloads every hash concurrently. Failed hashes are absent from the
    /// result.
    pub async fn download_batch(&self, hashes: &[Hash256]) -> HashMap<Hash256, DownloadedBlock> {
        let mut tasks = JoinSet::new();
        for hash in hashes.iter().copied() {
            let downloader = self.clone();
            tasks.spawn(async move { (hash, downloader.download_block(hash).await) });
        }
        let mut out = HashMap::with_capacity(hashes.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((hash, Ok(block))) => {
                    out.insert(hash, block);
                }
                Ok((_, Err(err))) => log_warn!("{err}"),
                Err(err) => log_warn!("block download task failed: {err}"),
            }
        }
        out
    }
}
