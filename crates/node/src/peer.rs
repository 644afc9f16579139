//! Transport-agnostic view of a connected peer.
//!
//! Sync code never reads a socket directly. It registers an expectation for
//! the reply it wants, sends the request, then awaits the expectation with a
//! timeout. Whatever owns the socket feeds inbound messages through
//! [`PendingExpectations::dispatch`].

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

pub type PeerId = u64;

/// Predicate over a raw message payload.
pub type Matcher = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerError {
    Disconnected,
    Timeout,
    Io(String),
    Protocol(String),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::Disconnected => write!(f, "peer disconnected"),
            PeerError::Timeout => write!(f, "peer response timed out"),
            PeerError::Io(message) => write!(f, "{message}"),
            PeerError::Protocol(message) => write!(f, "protocol violation: {message}"),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<std::io::Error> for PeerError {
    fn from(err: std::io::Error) -> Self {
        PeerError::Io(err.to_string())
    }
}

/// A single pending reply.
pub struct Expectation {
    rx: oneshot::Receiver<Result<Vec<u8>, PeerError>>,
}

impl Expectation {
    /// An expectation that already failed, for peers that are gone.
    pub fn failed(err: PeerError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }

    pub async fn wait(self, timeout: Duration) -> Result<Vec<u8>, PeerError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PeerError::Disconnected),
            Err(_) => Err(PeerError::Timeout),
        }
    }
}

struct Pending {
    command: String,
    matcher: Matcher,
    tx: oneshot::Sender<Result<Vec<u8>, PeerError>>,
}

/// Registered expectations of one peer, in registration order.
#[derive(Default)]
pub struct PendingExpectations {
    entries: Mutex<Vec<Pending>>,
}

impl PendingExpectations {
    pub fn register(&self, command: &str, matcher: Matcher) -> Expectation {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().expect("expectations lock");
        // Waiters that timed out leave a closed sender behind.
        entries.retain(|entry| !entry.tx.is_closed());
        entries.push(Pending {
            command: command.to_string(),
            matcher,
            tx,
        });
        Expectation { rx }
    }

    /// Hands `payload` to the first live expectation matching `command`.
    /// Returns false when nobody was waiting for it.
    pub fn dispatch(&self, command: &str, payload: &[u8]) -> bool {
        let mut entries = self.entries.lock().expect("expectations lock");
        let position = entries.iter().position(|entry| {
            entry.command == command && !entry.tx.is_closed() && (entry.matcher)(payload)
        });
        match position {
            Some(position) => {
                let entry = entries.remove(position);
                entry.tx.send(Ok(payload.to_vec())).is_ok()
            }
            None => false,
        }
    }

    pub fn fail_all(&self, err: PeerError) {
        let drained: Vec<Pending> = {
            let mut entries = self.entries.lock().expect("expectations lock");
            entries.drain(..).collect()
        };
        for entry in drained {
            let _ = entry.tx.send(Err(err.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("expectations lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    fn id(&self) -> PeerId;

    fn addr(&self) -> SocketAddr;

    fn is_connected(&self) -> bool;

    async fn send(&self, command: &str, payload: &[u8]) -> Result<(), PeerError>;

    /// Must be called before the request that triggers the reply is sent.
    fn expect_raw(&self, command: &str, matcher: Matcher) -> Expectation;
}

pub trait PeerPool: Send + Sync {
    fn peers(&self) -> Vec<Arc<dyn PeerLink>>;

    /// A connected peer chosen at random, skipping `exclude`.
    fn random_peer(&self, exclude: &HashSet<PeerId>) -> Option<Arc<dyn PeerLink>>;

    /// Puts the peer on a cool-down after misbehaviour or repeated failure.
    fn record_failure(&self, id: PeerId);
}
