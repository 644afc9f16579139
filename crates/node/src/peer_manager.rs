use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::{IteratorRandom, SliceRandom};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::p2p::TcpPeer;
use crate::peer::{PeerId, PeerLink, PeerPool};

pub const BANLIST_FILE_NAME: &str = "banlist.json";
/// Cool-down applied by `record_failure`.
pub const FAILURE_BAN_SECS: u64 = 60;

#[derive(Clone, Debug)]
pub struct BannedPeerInfo {
    pub addr: SocketAddr,
    pub banned_until: SystemTime,
}

#[derive(Debug, Deserialize, Serialize)]
struct BanListFile {
    version: u32,
    banned: Vec<BanListEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
struct BanListEntry {
    addr: SocketAddr,
    banned_until: u64,
}

const BANLIST_VERSION: u32 = 1;

/// Address bans with expiry, persisted as `banlist.json`.
#[derive(Default)]
pub struct BanList {
    banned: Mutex<HashMap<SocketAddr, SystemTime>>,
    revision: AtomicU64,
}

impl BanList {
    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        let now = SystemTime::now();
        let Ok(mut banned) = self.banned.lock() else {
            return false;
        };
        if let Some(until) = banned.get(&addr).copied() {
            if until > now {
                return true;
            }
            banned.remove(&addr);
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
        false
    }

    pub fn ban_for(&self, addr: SocketAddr, secs: u64) {
        if let Ok(mut banned) = self.banned.lock() {
            banned.insert(addr, SystemTime::now() + Duration::from_secs(secs));
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn unban(&self, addr: SocketAddr) -> bool {
        let Ok(mut banned) = self.banned.lock() else {
            return false;
        };
        let removed = banned.remove(&addr).is_some();
        if removed {
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn banned_peers(&self) -> Vec<BannedPeerInfo> {
        let now = SystemTime::now();
        let Ok(banned) = self.banned.lock() else {
            return Vec::new();
        };
        let mut out: Vec<BannedPeerInfo> = banned
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(addr, until)| BannedPeerInfo {
                addr: *addr,
                banned_until: *until,
            })
            .collect();
        out.sort_by_key(|entry| entry.addr.to_string());
        out
    }

    /// Bumped on every change; lets callers skip saving an unchanged list.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Relaxed)
    }

    pub fn load(&self, path: &Path) -> Result<usize, String> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.to_string()),
        };
        let file: BanListFile =
            serde_json::from_slice(&bytes).map_err(|err| format!("invalid banlist: {err}"))?;
        if file.version != BANLIST_VERSION {
            return Err(format!(
                "unsupported banlist version {} (expected {})",
                file.version, BANLIST_VERSION
            ));
        }
        let now = SystemTime::now();
        let mut inserted = 0usize;
        if let Ok(mut banned) = self.banned.lock() {
            for entry in file.banned {
                let until = UNIX_EPOCH + Duration::from_secs(entry.banned_until);
                if until <= now {
                    continue;
                }
                banned.insert(entry.addr, until);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let entries = self
            .banned_peers()
            .into_iter()
            .map(|entry| BanListEntry {
                addr: entry.addr,
                banned_until: entry
                    .banned_until
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            })
            .collect();
        let file = BanListFile {
            version: BANLIST_VERSION,
            banned: entries,
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|err| err.to_string())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| err.to_string())?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|err| err.to_string())?;
        if fs::rename(&tmp, path).is_err() {
            let _ = fs::remove_file(path);
            fs::rename(&tmp, path).map_err(|err| err.to_string())?;
        }
        Ok(())
    }
}

/// Owns the outbound connections, keyed by a monotonic [`PeerId`].
pub struct PeerManager {
    magic: [u8; 4],
    default_port: u16,
    dns_seeds: &'static [&'static str],
    connect: Vec<SocketAddr>,
    max_peers: usize,
    next_id: AtomicU64,
    peers: Mutex<HashMap<PeerId, Arc<TcpPeer>>>,
    bans: BanList,
    events_tx: mpsc::UnboundedSender<PeerId>,
    events_rx: Mutex<mpsc::UnboundedReceiver<PeerId>>,
}

impl PeerManager {
    /// With a non-empty `connect` list only those addresses are dialed;
    /// otherwise candidates come from the DNS seeds.
    pub fn new(
        magic: [u8; 4],
        default_port: u16,
        dns_seeds: &'static [&'static str],
        connect: Vec<SocketAddr>,
        max_peers: usize,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            magic,
            default_port,
            dns_seeds,
            connect,
            max_peers: max_peers.max(1),
            next_id: AtomicU64::new(1),
            peers: Mutex::new(HashMap::new()),
            bans: BanList::default(),
            events_tx,
            events_rx: Mutex::new(events_rx),
        }
    }

    pub fn bans(&self) -> &BanList {
        &self.bans
    }

    pub fn count(&self) -> usize {
        self.peers.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    /// Drops disconnected peers, then dials new candidates until the target
    /// count is reached or candidates run out. Returns the live peer count.
    pub async fn maintain(&self, start_height: i32) -> usize {
        self.reap_disconnected();
        let missing = self.max_peers.saturating_sub(self.count());
        if missing == 0 {
            return self.count();
        }

        let connected: HashSet<SocketAddr> = self
            .peers
            .lock()
            .map(|peers| peers.values().map(|peer| peer.addr()).collect())
            .unwrap_or_default();
        let mut candidates: Vec<SocketAddr> = self
            .candidate_addrs()
            .await
            .into_iter()
            .filter(|addr| !connected.contains(addr) && !self.bans.is_banned(*addr))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        let mut dialed = 0usize;
        for addr in candidates {
            if dialed >= missing {
                break;
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            match TcpPeer::connect(id, addr, self.magic, start_height, self.events_tx.clone())
                .await
            {
                Ok(peer) => {
                    log_info!(
                        "connected to peer {id} {addr} ({}), height {}",
                        peer.remote_user_agent(),
                        peer.remote_height()
                    );
                    if let Ok(mut peers) = self.peers.lock() {
                        peers.insert(id, peer);
                    }
                    dialed += 1;
                }
                Err(err) => {
                    log_debug!("failed to connect to {addr}: {err}");
                }
            }
        }
        self.count()
    }

    pub fn disconnect_all(&self) {
        let drained: Vec<Arc<TcpPeer>> = match self.peers.lock() {
            Ok(mut peers) => peers.drain().map(|(_, peer)| peer).collect(),
            Err(_) => Vec::new(),
        };
        for peer in drained {
            peer.disconnect();
        }
    }

    fn reap_disconnected(&self) {
        let mut gone: HashSet<PeerId> = HashSet::new();
        if let Ok(mut events) = self.events_rx.lock() {
            while let Ok(id) = events.try_recv() {
                gone.insert(id);
            }
        }
        if let Ok(mut peers) = self.peers.lock() {
            peers.retain(|id, peer| {
                let keep = peer.is_connected() && !gone.contains(id);
                if !keep {
                    log_info!("peer {id} {} disconnected", peer.addr());
                }
                keep
            });
        }
    }

    async fn candidate_addrs(&self) -> Vec<SocketAddr> {
        if !self.connect.is_empty() {
            return self.connect.clone();
        }
        let mut addrs = Vec::new();
        let mut seen = HashSet::new();
        for seed in self.dns_seeds {
            let host = format!("{seed}:{}", self.default_port);
            match tokio::net::lookup_host(host).await {
                Ok(entries) => {
                    for addr in entries {
                        if seen.insert(addr) {
                            addrs.push(addr);
                        }
                    }
                }
                Err(err) => {
                    log_debug!("failed to resolve {seed}: {err}");
                }
            }
        }
        addrs
    }
}

impl PeerPool for PeerManager {
    fn peers(&self) -> Vec<Arc<dyn PeerLink>> {
        let Ok(peers) = self.peers.lock() else {
            return Vec::new();
        };
        let mut out: Vec<(PeerId, Arc<dyn PeerLink>)> = peers
            .iter()
            .filter(|(_, peer)| peer.is_connected())
            .map(|(id, peer)| (*id, Arc::clone(peer) as Arc<dyn PeerLink>))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out.into_iter().map(|(_, peer)| peer).collect()
    }

    fn random_peer(&self, exclude: &HashSet<PeerId>) -> Option<Arc<dyn PeerLink>> {
        let peers = self.peers.lock().ok()?;
        peers
            .iter()
            .filter(|(id, peer)| peer.is_connected() && !exclude.contains(*id))
            .map(|(_, peer)| Arc::clone(peer) as Arc<dyn PeerLink>)
            .choose(&mut rand::thread_rng())
    }

    fn record_failure(&self, id: PeerId) {
        let removed = self.peers.lock().ok().and_then(|mut peers| peers.remove(&id));
        if let Some(peer) = removed {
            log_warn!(
                "disconnecting peer {id} {} for {FAILURE_BAN_SECS}s",
                peer.addr()
            );
            self.bans.ban_for(peer.addr(), FAILURE_BAN_SECS);
            peer.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn bans_expire_and_unban() {
        let bans = BanList::default();
        bans.ban_for(addr(1), 60);
        bans.ban_for(addr(2), 0);
        assert!(bans.is_banned(addr(1)));
        assert!(!bans.is_banned(addr(2)));
        assert!(!bans.is_banned(addr(3)));
        assert_eq!(bans.banned_peers().len(), 1);
        assert!(bans.unban(addr(1)));
        assert!(!bans.unban(addr(1)));
        assert!(bans.banned_peers().is_empty());
    }

    #[test]
    fn banlist_persists_live_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(BANLIST_FILE_NAME);
        let bans = BanList::default();
        bans.ban_for(addr(8333), 3600);
        bans.ban_for(addr(8334), 0);
        bans.save(&path).expect("save");

        let reloaded = BanList::default();
        assert_eq!(reloaded.load(&path).expect("load"), 1);
        assert!(reloaded.is_banned(addr(8333)));
        assert!(!reloaded.is_banned(addr(8334)));

        let missing = dir.path().join("none.json");
        assert_eq!(BanList::default().load(&missing).expect("missing"), 0);
        fs::write(&path, br#"{"version":9,"banned":[]}"#).expect("write");
        assert!(BanList::default().load(&path).is_err());
    }

    #[tokio::test]
    async fn empty_manager_has_no_peers() {
        let manager = PeerManager::new([0; 4], 18444, &[], Vec::new(), 4);
        assert_eq!(manager.maintain(0).await, 0);
        assert!(manager.peers().is_empty());
        assert!(manager.random_peer(&HashSet::new()).is_none());
        manager.record_failure(99);
        assert!(manager.bans().banned_peers().is_empty());
    }
}
