use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use futures::{stream::SplitSink, stream::SplitStream, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::codec::Framed;
use tracing::Instrument;
use crate::{
    scheduler::event::{Event, EventSender},
    InfoHash, PeerId,
};

mod handshake;
mod limiter;
mod message;
mod state;

pub use handshake::{Handshaker, PendingConn};
pub use limiter::EgressLimiter;
pub use message::{ErrorCode, Message, MessageCodec, MAX_MESSAGE_BODY, MAX_PIECE_PAYLOAD};
pub use state::{BlacklistedConn, ConnectionState, StateError};

pub type Result<T> = std::result::Result<T, ConnError>;

// Capacity of the per-connection send and receive queues. A full send queue
// blocks the dispatcher, which is the intended back-pressure.
const QUEUE_CAPACITY: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum ConnError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message body of {0} bytes exceeds frame limit")]
    MessageTooLarge(usize),

    #[error("piece payload of {0} bytes exceeds payload limit")]
    PayloadTooLarge(u64),

    #[error("payload header says {header} bytes but payload is {actual}")]
    PayloadLengthMismatch { header: u64, actual: u64 },

    #[error("piece payload of {payload} bytes exceeds egress burst {burst}")]
    PayloadExceedsBurst { payload: u64, burst: u64 },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("peer closed before completing the handshake")]
    NoHandshake,

    #[error("expected a bitfield message to open the connection")]
    ExpectedBitfield,

    #[error("info hash mismatch: ours {ours}, theirs {theirs}")]
    InfoHashMismatch { ours: InfoHash, theirs: InfoHash },

    #[error("connection closed")]
    Closed,

    #[error("send queue full")]
    SendQueueFull,

}

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;
type MessageStream = SplitStream<Framed<TcpStream, MessageCodec>>;

// One authenticated duplex channel to a remote peer. Messages are exchanged
// through bounded queues drained by a dedicated reader and writer task; all
// socket I/O lives in those tasks.
pub struct Connection {

    peer_id: PeerId,

    info_hash: InfoHash,

    created_at: Instant,

    opened_by_remote: bool,

    limiter: EgressLimiter,

    send_tx: mpsc::Sender<Message>,

    // Taken exactly once by the dispatcher that adopts this connection.
    recv_rx: Mutex<Option<mpsc::Receiver<Message>>>,

    done_tx: watch::Sender<bool>,

    closed: AtomicBool,

    workers: Mutex<Vec<JoinHandle<()>>>,

    events: EventSender,

}

impl Connection {

    // Takes an already-handshaked socket and starts the worker pair.
    pub fn spawn(
        socket: Framed<TcpStream, MessageCodec>,
        peer_id: PeerId,
        info_hash: InfoHash,
        opened_by_remote: bool,
        limiter: EgressLimiter,
        events: EventSender,
    ) -> Arc<Self> {

        let (send_tx, send_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (recv_tx, recv_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (done_tx, done_rx) = watch::channel(false);
        let (sink, stream) = socket.split();

        let conn = Arc::new(Connection {
            peer_id,
            info_hash,
            created_at: Instant::now(),
            opened_by_remote,
            limiter,
            send_tx,
            recv_rx: Mutex::new(Some(recv_rx)),
            done_tx,
            closed: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            events,
        });

        let span = tracing::info_span!("conn", peer = %peer_id, hash = %info_hash);
        let reader = tokio::spawn(
            conn.clone().run_reader(stream, recv_tx, done_rx.clone()).instrument(span.clone()),
        );
        let writer = tokio::spawn(
            conn.clone().run_writer(sink, send_rx, done_rx).instrument(span),
        );
        conn.workers.lock().unwrap().extend([reader, writer]);

        conn
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn opened_by_remote(&self) -> bool {
        self.opened_by_remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_egress_bandwidth_limit(&self, bytes_per_sec: u64) {
        self.limiter.set_rate(bytes_per_sec);
    }

    pub fn egress_bandwidth_limit(&self) -> u64 {
        self.limiter.rate()
    }

    // Queues a message, waiting while the remote is slow to drain.
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.send_tx.send(msg).await.map_err(|_| ConnError::Closed)
    }

    // Queues a message only if there is room. Used for fire-and-forget
    // notifications that may be dropped under pressure.
    pub fn try_send(&self, msg: Message) -> Result<()> {
        self.send_tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnError::SendQueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnError::Closed,
        })
    }

    // Hands out the receive side. Returns None after the first call.
    pub fn receiver(&self) -> Option<mpsc::Receiver<Message>> {
        self.recv_rx.lock().unwrap().take()
    }

    // Idempotent. Stops both workers, waits for them to drop the socket and
    // reports the closure to the event loop.
    pub async fn close(self: Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.done_tx.send(true);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            worker.await.ok();
        }

        tracing::debug!(peer = %self.peer_id, hash = %self.info_hash, "connection closed");
        self.events.send_detached(Event::ConnClosed(self.clone()));
    }

    async fn run_reader(
        self: Arc<Self>,
        mut stream: MessageStream,
        recv_tx: mpsc::Sender<Message>,
        mut done_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = done_rx.changed() => break,

                next = stream.next() => match next {
                    Some(Ok(msg)) => {
                        tracing::trace!("read: {}", msg);
                        tokio::select! {
                            _ = done_rx.changed() => break,
                            sent = recv_tx.send(msg) => {
                                if sent.is_err() {
                                    break;
                                }
                            },
                        }
                    },
                    Some(Err(e)) => {
                        tracing::debug!("read error: {}", e);
                        break;
                    },
                    None => break,
                },
            }
        }
        // Dropping recv_tx tells the dispatcher's pump the peer is gone.
        drop(recv_tx);
        tokio::spawn(self.close());
    }

    async fn run_writer(
        self: Arc<Self>,
        mut sink: MessageSink,
        mut send_rx: mpsc::Receiver<Message>,
        mut done_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = done_rx.changed() => break,

                next = send_rx.recv() => match next {
                    Some(msg) => {
                        // A stalled socket must not outlive close(); racing
                        // the write against done lets teardown through.
                        tokio::select! {
                            _ = done_rx.changed() => break,
                            written = self.write_message(&mut sink, msg) => {
                                if let Err(e) = written {
                                    tracing::debug!("write error: {}", e);
                                    break;
                                }
                            },
                        }
                    },
                    None => break,
                },
            }
        }
        tokio::spawn(self.clone().close());
    }

    async fn write_message(&self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        // Piece payloads pay for their bytes before hitting the socket.
        if let Message::PiecePayload { length, .. } = &msg {
            let delay = self.limiter.reserve(*length)?;
            if delay > std::time::Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
        }
        tracing::trace!("send: {}", msg);
        sink.send(msg).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_id", &self.peer_id)
            .field("info_hash", &self.info_hash)
            .field("opened_by_remote", &self.opened_by_remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}
