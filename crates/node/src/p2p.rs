use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use btcnode_consensus::constants::{MIN_PEER_PROTOCOL_VERSION, NODE_NETWORK, NODE_WITNESS};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::messages::{
    build_version_payload, encode_frame, parse_frame_header, parse_version, verify_checksum,
    MessageError, MESSAGE_HEADER_SIZE,
};
use crate::peer::{Expectation, Matcher, PeerError, PeerId, PeerLink, PendingExpectations};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const SEND_TIMEOUT_SECS: u64 = 10;
const HANDSHAKE_READ_TIMEOUT_SECS: u64 = 30;
const REQUIRED_SERVICES: u64 = NODE_NETWORK | NODE_WITNESS;

impl From<MessageError> for PeerError {
    fn from(err: MessageError) -> Self {
        PeerError::Protocol(err.to_string())
    }
}

/// Outbound connection with a background reader. Replies are routed to
/// registered expectations; the manager hears about disconnects through
/// `events`.
pub struct TcpPeer {
    id: PeerId,
    addr: SocketAddr,
    magic: [u8; 4],
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    connected: AtomicBool,
    remote_height: AtomicI32,
    remote_user_agent: String,
    pending: PendingExpectations,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpPeer {
    pub async fn connect(
        id: PeerId,
        addr: SocketAddr,
        magic: [u8; 4],
        start_height: i32,
        events: mpsc::UnboundedSender<PeerId>,
    ) -> Result<Arc<Self>, PeerError> {
        let mut stream = timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| PeerError::Timeout)??;
        let remote = handshake(&mut stream, magic, start_height).await?;
        let (read_half, write_half) = stream.into_split();

        let peer = Arc::new(Self {
            id,
            addr,
            magic,
            writer: tokio::sync::Mutex::new(write_half),
            connected: AtomicBool::new(true),
            remote_height: AtomicI32::new(remote.start_height),
            remote_user_agent: remote.user_agent,
            pending: PendingExpectations::default(),
            reader: Mutex::new(None),
        });
        let handle = tokio::spawn(read_loop(Arc::downgrade(&peer), read_half, magic, events));
        if let Ok(mut reader) = peer.reader.lock() {
            *reader = Some(handle);
        }
        log_debug!(
            "peer {} ({addr}) connected: {} height {}",
            id,
            peer.remote_user_agent,
            remote.start_height
        );
        Ok(peer)
    }

    pub fn remote_height(&self) -> i32 {
        self.remote_height.load(Ordering::Relaxed)
    }

    pub fn remote_user_agent(&self) -> &str {
        &self.remote_user_agent
    }

    pub fn disconnect(&self) {
        self.mark_disconnected();
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.pending.fail_all(PeerError::Disconnected);
    }
}

#[async_trait]
impl PeerLink for TcpPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send(&self, command: &str, payload: &[u8]) -> Result<(), PeerError> {
        if !self.is_connected() {
            return Err(PeerError::Disconnected);
        }
        let frame = encode_frame(self.magic, command, payload)?;
        let mut writer = self.writer.lock().await;
        let result = timeout(
            Duration::from_secs(SEND_TIMEOUT_SECS),
            writer.write_all(&frame),
        )
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.mark_disconnected();
                Err(err.into())
            }
            Err(_) => Err(PeerError::Timeout),
        }
    }

    fn expect_raw(&self, command: &str, matcher: Matcher) -> Expectation {
        if !self.is_connected() {
            return Expectation::failed(PeerError::Disconnected);
        }
        self.pending.register(command, matcher)
    }
}

impl Drop for TcpPeer {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }
}

async fn read_loop(
    peer: Weak<TcpPeer>,
    mut reader: OwnedReadHalf,
    magic: [u8; 4],
    events: mpsc::UnboundedSender<PeerId>,
) {
    loop {
        let message = read_message(&mut reader, magic).await;
        let Some(peer) = peer.upgrade() else {
            return;
        };
        match message {
            Ok((command, payload)) => match command.as_str() {
                "ping" => {
                    if let Err(err) = peer.send("pong", &payload).await {
                        log_debug!("peer {} pong failed: {err}", peer.id);
                    }
                }
                _ => {
                    if !peer.pending.dispatch(&command, &payload) {
                        log_trace!("peer {} unsolicited {command}", peer.id);
                    }
                }
            },
            Err(err) => {
                log_debug!("peer {} ({}) read ended: {err}", peer.id, peer.addr);
                peer.mark_disconnected();
                let _ = events.send(peer.id);
                return;
            }
        }
    }
}

async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: [u8; 4],
) -> Result<(String, Vec<u8>), PeerError> {
    let mut raw = [0u8; MESSAGE_HEADER_SIZE];
    reader.read_exact(&mut raw).await?;
    let header = parse_frame_header(&raw, magic)?;
    let mut payload = vec![0u8; header.length];
    reader.read_exact(&mut payload).await?;
    verify_checksum(&header, &payload)?;
    Ok((header.command, payload))
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    magic: [u8; 4],
    command: &str,
    payload: &[u8],
) -> Result<(), PeerError> {
    let frame = encode_frame(magic, command, payload)?;
    timeout(Duration::from_secs(SEND_TIMEOUT_SECS), writer.write_all(&frame))
        .await
        .map_err(|_| PeerError::Timeout)??;
    Ok(())
}

async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    magic: [u8; 4],
    start_height: i32,
) -> Result<crate::messages::VersionInfo, PeerError> {
    let nonce: u64 = rand::random();
    write_message(stream, magic, "version", &build_version_payload(start_height, nonce)).await?;

    let mut remote = None;
    let mut got_verack = false;
    while remote.is_none() || !got_verack {
        let (command, payload) = timeout(
            Duration::from_secs(HANDSHAKE_READ_TIMEOUT_SECS),
            read_message(stream, magic),
        )
        .await
        .map_err(|_| PeerError::Timeout)??;
        match command.as_str() {
            "version" => {
                let info = parse_version(&payload)?;
                if info.nonce == nonce {
                    return Err(PeerError::Protocol("connected to self".to_string()));
                }
                if info.version < MIN_PEER_PROTOCOL_VERSION {
                    return Err(PeerError::Protocol(format!(
                        "peer protocol version {} too old",
                        info.version
                    )));
                }
                if info.services & REQUIRED_SERVICES != REQUIRED_SERVICES {
                    return Err(PeerError::Protocol(format!(
                        "peer services {:#x} lack network/witness",
                        info.services
                    )));
                }
                write_message(stream, magic, "verack", &[]).await?;
                remote = Some(info);
            }
            "verack" => got_verack = true,
            "ping" => write_message(stream, magic, "pong", &payload).await?,
            _ => {}
        }
    }
    remote.ok_or_else(|| PeerError::Protocol("missing version".to_string()))
}
