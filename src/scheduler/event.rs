use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use crate::{
    conn::{BlacklistedConn, Connection, PendingConn},
    scheduler::SchedulerError,
    storage::Torrent,
    tracker::PeerInfo,
    Bitfield, Digest, InfoHash, PeerId,
};

// Everything that can happen to the scheduler. Background tasks never touch
// scheduler state; they describe what happened with one of these and the
// event loop applies it.
pub(crate) enum Event {

    // The accept loop read a remote's opening bitfield.
    IncomingHandshake(PendingConn),

    FailedIncomingHandshake { peer_id: PeerId, info_hash: InfoHash },

    // An accepted handshake was reciprocated and upgraded to a connection.
    IncomingConn {
        conn: Arc<Connection>,
        bitfield: Bitfield,
        torrent: Arc<dyn Torrent>,
    },

    FailedOutgoingHandshake { peer_id: PeerId, info_hash: InfoHash },

    OutgoingConn {
        conn: Arc<Connection>,
        bitfield: Bitfield,
        torrent: Arc<dyn Torrent>,
    },

    ConnClosed(Arc<Connection>),

    // Fired by the announce ticker; picks the next torrent to announce.
    AnnounceTick,

    AnnounceResult {
        info_hash: InfoHash,
        peers: Vec<PeerInfo>,
    },

    AnnounceErr { info_hash: InfoHash },

    // A local download request for a torrent.
    NewTorrent {
        namespace: String,
        torrent: Arc<dyn Torrent>,
        result: oneshot::Sender<Result<(), SchedulerError>>,
    },

    // A dispatcher finished its torrent.
    DispatcherComplete {
        digest: Digest,
        info_hash: InfoHash,
    },

    PreemptionTick,

    EmitStats,

    BlacklistSnapshot(oneshot::Sender<Vec<BlacklistedConn>>),

    RemoveTorrent {
        digest: Digest,
        result: oneshot::Sender<Result<(), SchedulerError>>,
    },

    // Liveness check; applying it is a no-op.
    Probe,

    Shutdown,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::IncomingHandshake(pc) => {
                write!(f, "incoming handshake from {}", pc.peer_id())
            },
            Event::FailedIncomingHandshake { peer_id, .. } => {
                write!(f, "failed incoming handshake from {}", peer_id)
            },
            Event::IncomingConn { conn, .. } => write!(f, "incoming conn from {}", conn.peer_id()),
            Event::FailedOutgoingHandshake { peer_id, .. } => {
                write!(f, "failed outgoing handshake to {}", peer_id)
            },
            Event::OutgoingConn { conn, .. } => write!(f, "outgoing conn to {}", conn.peer_id()),
            Event::ConnClosed(conn) => write!(f, "conn to {} closed", conn.peer_id()),
            Event::AnnounceTick => write!(f, "announce tick"),
            Event::AnnounceResult { info_hash, peers } => {
                write!(f, "announce result for {} with {} peers", info_hash, peers.len())
            },
            Event::AnnounceErr { info_hash } => write!(f, "announce error for {}", info_hash),
            Event::NewTorrent { torrent, .. } => write!(f, "new torrent {}", torrent.digest()),
            Event::DispatcherComplete { digest, .. } => {
                write!(f, "dispatcher complete for {}", digest)
            },
            Event::PreemptionTick => write!(f, "preemption tick"),
            Event::EmitStats => write!(f, "emit stats"),
            Event::BlacklistSnapshot(_) => write!(f, "blacklist snapshot"),
            Event::RemoveTorrent { digest, .. } => write!(f, "remove torrent {}", digest),
            Event::Probe => write!(f, "probe"),
            Event::Shutdown => write!(f, "shutdown"),
        }
    }
}

// Handle for feeding the event loop. Cheap to clone into worker tasks.
#[derive(Clone)]
pub(crate) struct EventSender {

    tx: mpsc::Sender<Event>,

}

impl EventSender {

    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    // Blocks while the loop's buffer is full.
    pub async fn send(&self, event: Event) -> Result<(), SchedulerError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SchedulerError::SchedulerStopped)
    }

    // Bounded-time send, backing the liveness probe.
    pub async fn send_timeout(&self, event: Event, timeout: Duration) -> Result<(), SchedulerError> {
        match self.tx.send_timeout(event, timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(SchedulerError::SendEventTimedOut),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(SchedulerError::SchedulerStopped),
        }
    }

    // For callers that cannot await, e.g. a closing connection. Falls back
    // to a task when the buffer is momentarily full.
    pub fn send_detached(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(event)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tx.send(event).await.ok();
                });
            },
            // The loop is gone; nothing left to notify.
            Err(mpsc::error::TrySendError::Closed(_)) => {},
        }
    }
}
