use std::{net::SocketAddr, sync::Arc, time::Duration};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time};
use tokio_util::codec::Framed;
use crate::{
    config::Config,
    scheduler::event::EventSender,
    storage::Torrent,
    Bitfield, InfoHash, PeerId,
};
use super::{ConnError, Connection, EgressLimiter, Message, MessageCodec, Result};

// An accepted socket whose opening bitfield has been read but which the
// event loop has not yet agreed to keep.
pub struct PendingConn {

    socket: Framed<TcpStream, MessageCodec>,

    peer_id: PeerId,

    name: String,

    info_hash: InfoHash,

    bitfield: Bitfield,

}

impl PendingConn {

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }
}

impl std::fmt::Debug for PendingConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConn")
            .field("peer_id", &self.peer_id)
            .field("info_hash", &self.info_hash)
            .finish()
    }
}

// Opens outbound connections and upgrades inbound sockets by exchanging the
// initial bitfield message in each direction.
pub struct Handshaker {

    peer_id: PeerId,

    timeout: Duration,

    initial_egress: u64,

    disable_throttling: bool,

    events: EventSender,

}

impl Handshaker {

    pub fn new(peer_id: PeerId, config: &Config, events: EventSender) -> Self {
        Self {
            peer_id,
            timeout: config.handshake_timeout,
            initial_egress: config.max_global_egress_bytes_per_sec,
            disable_throttling: config.disable_throttling,
            events,
        }
    }

    // Dials the remote, offers our bitfield and validates the reply. The
    // returned bitfield is the remote's.
    pub async fn initialize(
        &self,
        addr: SocketAddr,
        torrent: &dyn Torrent,
    ) -> Result<(Arc<Connection>, Bitfield)> {

        let stream = time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnError::HandshakeTimeout)??;
        let mut socket = Framed::new(stream, MessageCodec::new());

        time::timeout(self.timeout, socket.send(self.bitfield_message(torrent)))
            .await
            .map_err(|_| ConnError::HandshakeTimeout)??;

        let reply = self.read_bitfield(&mut socket).await?;
        if reply.info_hash != torrent.info_hash() {
            return Err(ConnError::InfoHashMismatch {
                ours: torrent.info_hash(),
                theirs: reply.info_hash,
            });
        }

        let conn = Connection::spawn(
            socket,
            reply.peer_id,
            reply.info_hash,
            false,
            self.limiter(torrent),
            self.events.clone(),
        );
        Ok((conn, reply.bitfield))
    }

    // Reads the remote's opening bitfield off an accepted socket. The event
    // loop decides whether to keep the result.
    pub async fn accept(&self, stream: TcpStream) -> Result<PendingConn> {
        let mut socket = Framed::new(stream, MessageCodec::new());
        let remote = self.read_bitfield(&mut socket).await?;
        Ok(PendingConn {
            socket,
            peer_id: remote.peer_id,
            name: remote.name,
            info_hash: remote.info_hash,
            bitfield: remote.bitfield,
        })
    }

    // Completes an accepted handshake by replying with our bitfield.
    pub async fn establish(
        &self,
        pc: PendingConn,
        torrent: &dyn Torrent,
    ) -> Result<(Arc<Connection>, Bitfield)> {

        if pc.info_hash != torrent.info_hash() {
            return Err(ConnError::InfoHashMismatch {
                ours: torrent.info_hash(),
                theirs: pc.info_hash,
            });
        }

        let mut socket = pc.socket;
        time::timeout(self.timeout, socket.send(self.bitfield_message(torrent)))
            .await
            .map_err(|_| ConnError::HandshakeTimeout)??;

        let conn = Connection::spawn(
            socket,
            pc.peer_id,
            pc.info_hash,
            true,
            self.limiter(torrent),
            self.events.clone(),
        );
        Ok((conn, pc.bitfield))
    }

    fn bitfield_message(&self, torrent: &dyn Torrent) -> Message {
        Message::Bitfield {
            peer_id: self.peer_id,
            name: torrent.name(),
            info_hash: torrent.info_hash(),
            bitfield: torrent.bitfield(),
        }
    }

    fn limiter(&self, torrent: &dyn Torrent) -> EgressLimiter {
        // Burst must cover the largest piece or payloads could never reserve.
        let burst = torrent.max_piece_length();
        if self.disable_throttling {
            EgressLimiter::unlimited(burst)
        } else {
            EgressLimiter::new(self.initial_egress, burst)
        }
    }

    async fn read_bitfield(
        &self,
        socket: &mut Framed<TcpStream, MessageCodec>,
    ) -> Result<RemoteBitfield> {
        let msg = match time::timeout(self.timeout, socket.next()).await {
            Err(_) => return Err(ConnError::HandshakeTimeout),
            Ok(None) => return Err(ConnError::NoHandshake),
            Ok(Some(msg)) => msg?,
        };
        match msg {
            Message::Bitfield { peer_id, name, info_hash, bitfield } => Ok(RemoteBitfield {
                peer_id,
                name,
                info_hash,
                bitfield,
            }),
            other => {
                tracing::warn!("handshake opened with {}", other);
                Err(ConnError::ExpectedBitfield)
            },
        }
    }
}

struct RemoteBitfield {
    peer_id: PeerId,
    name: String,
    info_hash: InfoHash,
    bitfield: Bitfield,
}
