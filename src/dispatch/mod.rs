use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant},
};
use tracing::Instrument;
use crate::{
    config::Config,
    conn::{Connection, ErrorCode, Message},
    scheduler::event::{Event, EventSender},
    storage::{StorageError, Torrent, TorrentStat},
    Bitfield, Digest, InfoHash, PeerId,
};

mod request;

pub use request::{PieceRequest, PieceRequestManager, RequestStatus};

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {

    #[error("peer {0} already has a session")]
    DuplicatePeer(PeerId),

    #[error("connection receiver already taken")]
    ReceiverTaken,

    #[error("dispatcher torn down")]
    TornDown,

}

// One remote peer participating in a torrent. Owned by exactly one
// dispatcher; lives as long as its connection.
pub struct Peer {

    id: PeerId,

    bitfield: Mutex<Bitfield>,

    conn: Arc<Connection>,

    last_good_piece_received: Mutex<Option<Instant>>,

    last_piece_sent: Mutex<Option<Instant>>,

}

impl Peer {

    pub fn id(&self) -> PeerId {
        self.id
    }

    fn has_piece(&self, idx: usize) -> bool {
        self.bitfield.lock().unwrap().has(idx)
    }
}

// Schedules piece requests for one torrent across its peers and serves
// their requests back. All transfer decisions for a torrent live here; the
// event loop only wires connections in and out.
pub struct Dispatcher {

    torrent: Arc<dyn Torrent>,

    created_at: Instant,

    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,

    requests: PieceRequestManager,

    events: EventSender,

    completed_once: AtomicBool,

    torn_down: AtomicBool,

    done_tx: watch::Sender<bool>,

    // Last time any peer delivered a good piece / we served one. Drives the
    // leecher and seeder idle-teardown checks.
    last_read: Mutex<Instant>,

    last_write: Mutex<Instant>,

}

impl Dispatcher {

    pub fn new(torrent: Arc<dyn Torrent>, config: &Config, events: EventSender) -> Arc<Self> {

        let timeout = config.piece_request_timeout(torrent.max_piece_length());
        let (done_tx, done_rx) = watch::channel(false);
        let now = Instant::now();

        let dispatcher = Arc::new(Dispatcher {
            // A torrent that starts out complete must not re-announce
            // completion.
            completed_once: AtomicBool::new(torrent.complete()),
            requests: PieceRequestManager::new(config.pipeline_limit, timeout),
            created_at: now,
            peers: Mutex::new(HashMap::new()),
            events,
            torn_down: AtomicBool::new(false),
            done_tx,
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
            torrent,
        });

        let watcher = dispatcher.clone();
        let span = tracing::info_span!("dispatcher", digest = %dispatcher.torrent.digest());
        tokio::spawn(watcher.run_request_watcher(done_rx).instrument(span));

        dispatcher
    }

    pub fn torrent(&self) -> &Arc<dyn Torrent> {
        &self.torrent
    }

    pub fn digest(&self) -> Digest {
        self.torrent.digest()
    }

    pub fn info_hash(&self) -> InfoHash {
        self.torrent.info_hash()
    }

    pub fn name(&self) -> String {
        self.torrent.name()
    }

    pub fn length(&self) -> u64 {
        self.torrent.length()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn complete(&self) -> bool {
        self.torrent.complete()
    }

    pub fn empty(&self) -> bool {
        self.peers.lock().unwrap().is_empty()
    }

    pub fn num_peers(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn stat(&self) -> TorrentStat {
        TorrentStat {
            name: self.torrent.name(),
            digest: self.torrent.digest(),
            info_hash: self.torrent.info_hash(),
            bitfield: self.torrent.bitfield(),
        }
    }

    pub fn last_good_piece_received(&self, peer_id: PeerId) -> Option<Instant> {
        let peers = self.peers.lock().unwrap();
        peers
            .get(&peer_id)
            .and_then(|p| *p.last_good_piece_received.lock().unwrap())
    }

    pub fn last_piece_sent(&self, peer_id: PeerId) -> Option<Instant> {
        let peers = self.peers.lock().unwrap();
        peers
            .get(&peer_id)
            .and_then(|p| *p.last_piece_sent.lock().unwrap())
    }

    pub fn last_read_time(&self) -> Instant {
        *self.last_read.lock().unwrap()
    }

    pub fn last_write_time(&self) -> Instant {
        *self.last_write.lock().unwrap()
    }

    // Adopts an activated connection. Spawns the message pump and seeds the
    // request pipeline against pieces the peer has and we lack.
    pub fn add_peer(
        self: Arc<Self>,
        peer_id: PeerId,
        bitfield: Bitfield,
        conn: Arc<Connection>,
    ) -> Result<()> {

        if self.torn_down.load(Ordering::SeqCst) {
            return Err(DispatchError::TornDown);
        }

        let (peer, receiver) = {
            let mut peers = self.peers.lock().unwrap();
            if peers.contains_key(&peer_id) {
                return Err(DispatchError::DuplicatePeer(peer_id));
            }
            let receiver = conn.receiver().ok_or(DispatchError::ReceiverTaken)?;
            let peer = Arc::new(Peer {
                id: peer_id,
                bitfield: Mutex::new(bitfield),
                conn,
                last_good_piece_received: Mutex::new(None),
                last_piece_sent: Mutex::new(None),
            });
            peers.insert(peer_id, peer.clone());
            (peer, receiver)
        };

        let span = tracing::info_span!(
            "peer",
            peer = %peer_id,
            digest = %self.torrent.digest(),
        );
        tokio::spawn(self.run_peer(peer, receiver).instrument(span));
        Ok(())
    }

    // Idempotently stops the watcher and closes every peer connection.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.done_tx.send(true);
        let peers: Vec<Arc<Peer>> = self.peers.lock().unwrap().values().cloned().collect();
        for peer in peers {
            peer.conn.clone().close().await;
        }
    }

    async fn run_peer(self: Arc<Self>, peer: Arc<Peer>, mut receiver: mpsc::Receiver<Message>) {

        tracing::debug!("peer session starting");
        self.maybe_request_more(&peer).await;

        while let Some(msg) = receiver.recv().await {
            self.handle_message(&peer, msg).await;
        }

        // The connection is gone; free the peer's reservations for others.
        tracing::debug!("peer session ended");
        let mut peers = self.peers.lock().unwrap();
        if let Some(current) = peers.get(&peer.id) {
            if Arc::ptr_eq(current, &peer) {
                peers.remove(&peer.id);
            }
        }
        drop(peers);
        self.requests.clear_peer(peer.id);
    }

    async fn handle_message(&self, peer: &Arc<Peer>, msg: Message) {
        match msg {

            // Bitfields only belong in handshakes.
            Message::Bitfield { .. } => {
                tracing::warn!("unexpected bitfield on established connection");
            },

            Message::AnnouncePiece { index } => {
                let idx = index as usize;
                if idx >= self.torrent.num_pieces() {
                    tracing::warn!("announced piece {} out of range", idx);
                    return;
                }
                peer.bitfield.lock().unwrap().set(idx, true);
                self.maybe_request_more(peer).await;
            },

            Message::PieceRequest { index, offset, length } => {
                self.handle_piece_request(peer, index, offset, length).await;
            },

            Message::PiecePayload { index, offset, length, payload } => {
                self.handle_piece_payload(peer, index, offset, length, payload).await;
            },

            // All receipt is synchronous; a cancel always arrives too late.
            Message::CancelPiece { index, .. } => {
                tracing::trace!("ignoring cancel for piece {}", index);
            },

            Message::Error { index, code: ErrorCode::PieceRequestFailed, error } => {
                tracing::warn!("piece {} request failed remotely: {}", index, error);
                self.requests.mark_invalid(peer.id, index as usize);
            },
        }
    }

    async fn handle_piece_request(&self, peer: &Arc<Peer>, index: u32, offset: u64, length: u64) {

        let idx = index as usize;
        let full_piece = idx < self.torrent.num_pieces()
            && offset == 0
            && length == self.torrent.piece_length(idx);
        if !full_piece {
            tracing::warn!(
                "rejecting non-full piece request {{ piece: {}, offset: {}, length: {} }}",
                index, offset, length,
            );
            self.send_error(peer, index, "chunk not supported").await;
            return;
        }

        let payload = match self.torrent.read_piece(idx) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("failed to read piece {}: {}", idx, e);
                self.send_error(peer, index, "failed to read piece").await;
                return;
            },
        };

        let msg = Message::PiecePayload {
            index,
            offset: 0,
            length: payload.len() as u64,
            payload: Bytes::from(payload),
        };
        if peer.conn.send(msg).await.is_err() {
            tracing::debug!("connection closed before piece {} was sent", idx);
            return;
        }

        let now = Instant::now();
        *peer.last_piece_sent.lock().unwrap() = Some(now);
        *self.last_write.lock().unwrap() = now;
        // The peer asked for it, so it will have it shortly; skipping the
        // announce-piece round trip.
        peer.bitfield.lock().unwrap().set(idx, true);
    }

    async fn handle_piece_payload(
        &self,
        peer: &Arc<Peer>,
        index: u32,
        offset: u64,
        length: u64,
        payload: Bytes,
    ) {

        let idx = index as usize;
        let full_piece = idx < self.torrent.num_pieces()
            && offset == 0
            && length == self.torrent.piece_length(idx);
        if !full_piece {
            tracing::warn!(
                "discarding non-full piece payload {{ piece: {}, offset: {}, length: {} }}",
                index, offset, length,
            );
            self.requests.mark_invalid(peer.id, idx);
            return;
        }

        match self.torrent.write_piece(idx, &payload) {

            Ok(()) => {
                let now = Instant::now();
                *peer.last_good_piece_received.lock().unwrap() = Some(now);
                *self.last_read.lock().unwrap() = now;
                self.requests.clear(idx);
                self.maybe_request_more(peer).await;
                self.announce_piece_to_others(peer.id, index);
                if self.torrent.complete() {
                    self.handle_complete().await;
                }
            },

            // Someone else delivered it first; the piece is good either way.
            Err(StorageError::PieceAlreadyComplete(_)) => {
                self.requests.clear(idx);
                self.maybe_request_more(peer).await;
            },

            Err(e) => {
                tracing::warn!("failed to write piece {}: {}", idx, e);
                self.requests.mark_invalid(peer.id, idx);
            },
        }
    }

    // Fills the peer's pipeline from pieces it has and we lack.
    async fn maybe_request_more(&self, peer: &Arc<Peer>) {
        let candidates = {
            let peer_bitfield = peer.bitfield.lock().unwrap();
            peer_bitfield.intersection(&self.torrent.bitfield().complement())
        };
        let reserved = self.requests.reserve_pieces(peer.id, &candidates);
        for idx in reserved {
            self.send_piece_request(peer, idx).await;
        }
    }

    async fn send_piece_request(&self, peer: &Arc<Peer>, idx: usize) {
        let msg = Message::PieceRequest {
            index: idx as u32,
            offset: 0,
            length: self.torrent.piece_length(idx),
        };
        tracing::debug!("requesting piece {} from {}", idx, peer.id);
        if peer.conn.send(msg).await.is_err() {
            self.requests.mark_unsent(peer.id, idx);
        }
    }

    async fn send_error(&self, peer: &Arc<Peer>, index: u32, error: &str) {
        let msg = Message::Error {
            index,
            code: ErrorCode::PieceRequestFailed,
            error: error.to_owned(),
        };
        if peer.conn.send(msg).await.is_err() {
            tracing::debug!("connection closed before error reply was sent");
        }
    }

    // Fire-and-forget availability broadcast after a piece lands.
    fn announce_piece_to_others(&self, from: PeerId, index: u32) {
        let peers: Vec<Arc<Peer>> = self.peers.lock().unwrap().values().cloned().collect();
        for other in peers {
            if other.id == from {
                continue;
            }
            if let Err(e) = other.conn.try_send(Message::AnnouncePiece { index }) {
                tracing::debug!("dropping piece announce to {}: {}", other.id, e);
            }
        }
    }

    async fn handle_complete(&self) {
        if self.completed_once.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(digest = %self.torrent.digest(), "torrent complete");
        self.events.send_detached(Event::DispatcherComplete {
            digest: self.torrent.digest(),
            info_hash: self.torrent.info_hash(),
        });

        // Links to other seeders carry nothing for either side now.
        let peers: Vec<Arc<Peer>> = self.peers.lock().unwrap().values().cloned().collect();
        for peer in peers {
            if peer.bitfield.lock().unwrap().complete() {
                tracing::debug!("closing connection to fellow seeder {}", peer.id);
                tokio::spawn(peer.conn.clone().close());
            }
        }
    }

    async fn run_request_watcher(self: Arc<Self>, mut done_rx: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.requests.timeout() / 2);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = done_rx.changed() => break,
                _ = ticker.tick() => self.resend_failed_requests().await,
            }
        }
    }

    // Walks failed requests and re-issues each against some peer that has
    // the piece. Expired and invalid requests must move to a different peer;
    // unsent ones may retry the same peer.
    pub(crate) async fn resend_failed_requests(&self) {

        let failed = self.requests.failed_requests();
        if failed.is_empty() {
            return;
        }
        tracing::debug!("retrying {} failed piece requests", failed.len());

        let peers: Vec<Arc<Peer>> = self.peers.lock().unwrap().values().cloned().collect();
        for req in failed {
            for peer in &peers {
                if req.status != RequestStatus::Unsent && peer.id == req.peer_id {
                    continue;
                }
                if !peer.has_piece(req.piece) {
                    continue;
                }
                if !self.requests.reserve(peer.id, req.piece) {
                    continue;
                }
                self.send_piece_request(peer, req.piece).await;
                break;
            }
        }
    }
}
