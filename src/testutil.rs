use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time,
};
use tokio_util::codec::Framed;
use crate::{
    config::Config,
    conn::{Connection, EgressLimiter, Message, MessageCodec},
    scheduler::event::{Event, EventSender},
    storage::{MemoryTorrentArchive, Torrent, TorrentMeta},
    tracker::{AnnounceClient, AnnounceRequest, AnnounceResponse, PeerInfo, TrackerError},
    Digest, InfoHash, PeerId,
};

const TEST_BURST: u64 = 16 * 1024 * 1024;

// Deterministic filler content.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// Fast announce cadence so multi-peer tests converge quickly.
pub fn test_config() -> Config {
    Config {
        announce_interval: Duration::from_millis(100),
        max_announce_interval: Duration::from_secs(1),
        ..Default::default()
    }
}

pub fn event_channel() -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(512);
    (EventSender::new(tx), rx)
}

pub async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    (accepted.unwrap().0, connected.unwrap())
}

// A connected pair of Connection objects over loopback. Each side's peer id
// is the identity of the other end, as a real handshake would leave it.
pub struct ConnPair {
    pub a: Arc<Connection>,
    pub b: Arc<Connection>,
}

pub async fn conn_pair(info_hash: InfoHash) -> ConnPair {
    conn_pair_ids(info_hash, PeerId::random(), PeerId::random()).await
}

async fn conn_pair_ids(info_hash: InfoHash, id_a: PeerId, id_b: PeerId) -> ConnPair {
    let (socket_a, socket_b) = socket_pair().await;
    let (events_a, _rx_a) = event_channel();
    let (events_b, _rx_b) = event_channel();
    let a = Connection::spawn(
        Framed::new(socket_a, MessageCodec::new()),
        id_b,
        info_hash,
        false,
        EgressLimiter::unlimited(TEST_BURST),
        events_a,
    );
    let b = Connection::spawn(
        Framed::new(socket_b, MessageCodec::new()),
        id_a,
        info_hash,
        true,
        EgressLimiter::unlimited(TEST_BURST),
        events_b,
    );
    ConnPair { a, b }
}

// A local connection against a default seeded torrent, with the remote end
// also wrapped as a Connection.
pub struct ConnFixture {
    pub local: Arc<Connection>,
    pub remote: Arc<Connection>,
    pub torrent: Arc<dyn Torrent>,
}

pub async fn conn_fixture() -> ConnFixture {
    let data = content(1024);
    let meta = TorrentMeta::from_content(&data, 256);
    let archive = MemoryTorrentArchive::new();
    let torrent = archive.seed(meta, &data).unwrap();
    conn_fixture_for(PeerId::random(), torrent).await
}

pub async fn conn_fixture_for(remote_peer: PeerId, torrent: Arc<dyn Torrent>) -> ConnFixture {
    let pair = conn_pair_ids(torrent.info_hash(), PeerId::random(), remote_peer).await;
    ConnFixture {
        local: pair.a,
        remote: pair.b,
        torrent,
    }
}

// A peer the test script drives by hand: the dispatcher side gets a real
// Connection, the test keeps the raw framed socket.
pub struct ScriptedPeer {
    pub peer_id: PeerId,
    pub conn: Arc<Connection>,
    pub socket: Framed<TcpStream, MessageCodec>,
}

pub async fn scripted_peer(info_hash: InfoHash) -> ScriptedPeer {
    let (local_socket, remote_socket) = socket_pair().await;
    let peer_id = PeerId::random();
    let (events, _rx) = event_channel();
    let conn = Connection::spawn(
        Framed::new(local_socket, MessageCodec::new()),
        peer_id,
        info_hash,
        false,
        EgressLimiter::unlimited(TEST_BURST),
        events,
    );
    ScriptedPeer {
        peer_id,
        conn,
        socket: Framed::new(remote_socket, MessageCodec::new()),
    }
}

impl ScriptedPeer {

    // Reads until `n` piece requests arrived, ignoring other traffic.
    // Returns the requested indices in ascending order.
    pub async fn expect_piece_requests(&mut self, n: usize) -> Vec<usize> {
        let mut indices = Vec::new();
        while indices.len() < n {
            let next = time::timeout(Duration::from_secs(600), self.socket.next())
                .await
                .expect("timed out waiting for piece request")
                .expect("socket closed waiting for piece request")
                .expect("read error waiting for piece request");
            if let Message::PieceRequest { index, .. } = next {
                indices.push(index as usize);
            }
        }
        indices.sort_unstable();
        indices
    }

    // True when nothing arrives within a generous window.
    pub async fn no_traffic(&mut self) -> bool {
        time::timeout(Duration::from_secs(600), self.socket.next())
            .await
            .is_err()
    }
}

// Waits for a specific torrent's completion event, skipping everything else.
pub async fn wait_for_dispatcher_complete(
    rx: &mut mpsc::Receiver<Event>,
    digest: Digest,
) -> anyhow::Result<()> {
    time::timeout(Duration::from_secs(30), async {
        while let Some(event) = rx.recv().await {
            if let Event::DispatcherComplete { digest: completed, .. } = event {
                if completed == digest {
                    return Ok(());
                }
            }
        }
        anyhow::bail!("event channel closed before completion")
    })
    .await?
}

// In-process tracker: every announce registers the caller and returns the
// rest of the swarm.
pub struct LocalTracker {

    swarms: Mutex<HashMap<InfoHash, HashMap<PeerId, PeerInfo>>>,

}

impl LocalTracker {

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            swarms: Mutex::new(HashMap::new()),
        })
    }

    // Plants a peer that never announces itself, the way origins are
    // resolved into a swarm.
    pub fn inject(&self, h: InfoHash, peer: PeerInfo) {
        self.swarms
            .lock()
            .unwrap()
            .entry(h)
            .or_default()
            .insert(peer.peer_id, peer);
    }
}

#[async_trait]
impl AnnounceClient for LocalTracker {
    async fn announce(&self, req: AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let mut swarms = self.swarms.lock().unwrap();
        let swarm = swarms.entry(req.info_hash).or_default();
        swarm.insert(req.peer.peer_id, req.peer.clone());
        Ok(AnnounceResponse {
            peers: swarm
                .values()
                .filter(|p| p.peer_id != req.peer.peer_id)
                .cloned()
                .collect(),
            interval: None,
        })
    }
}
