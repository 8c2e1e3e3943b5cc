use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch, RwLock},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::Instrument;
use crate::{
    announce::{AnnounceQueue, Announcer},
    config::Config,
    conn::{BlacklistedConn, Connection, ConnectionState, Handshaker, PendingConn, StateError},
    dispatch::Dispatcher,
    storage::{StorageError, Torrent, TorrentArchive},
    tracker::{AnnounceClient, PeerInfo},
    Bitfield, Digest, InfoHash, PeerId,
};
use event::{Event, EventSender};

pub mod event;

#[cfg(test)]
mod tests;

pub type Result<T> = std::result::Result<T, SchedulerError>;

// The only errors that escape to download callers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {

    #[error("torrent not found")]
    TorrentNotFound,

    #[error("torrent timed out")]
    TorrentTimeout,

    #[error("torrent removed")]
    TorrentRemoved,

    #[error("scheduler stopped")]
    SchedulerStopped,

    #[error("event loop did not accept the event in time")]
    SendEventTimedOut,

}

// Per-torrent bookkeeping held by the event loop.
struct TorrentControl {

    namespace: String,

    dispatcher: Arc<Dispatcher>,

    // Download callers waiting for this torrent to finish.
    waiters: Vec<oneshot::Sender<Result<()>>>,

    complete: bool,

    // Whether a local download asked for this torrent, as opposed to it
    // existing purely to serve a remote.
    local_request: bool,

}

// Everything the event loop owns. Only Event application mutates this.
struct State {

    config: Config,

    peer_id: PeerId,

    listen_addr: SocketAddr,

    archive: Arc<dyn TorrentArchive>,

    announcer: Arc<Announcer>,

    handshaker: Arc<Handshaker>,

    conns: ConnectionState,

    controls: HashMap<InfoHash, TorrentControl>,

    // Secondary index for digest-keyed administration.
    digests: HashMap<Digest, InfoHash>,

    announce_queue: AnnounceQueue,

    events: EventSender,

}

impl State {

    // Applies one event. Returns true when the loop should stop.
    async fn apply(&mut self, event: Event) -> bool {
        match event {

            Event::IncomingHandshake(pc) => self.handle_incoming_handshake(pc),

            Event::FailedIncomingHandshake { peer_id, info_hash } => {
                // The remote may simply retry; no blacklist.
                self.conns.delete_pending(peer_id, info_hash);
            },

            Event::IncomingConn { conn, bitfield, torrent } => {
                if !self.connect_peer(conn.clone(), bitfield, torrent, String::new()) {
                    tokio::spawn(conn.close());
                }
            },

            Event::FailedOutgoingHandshake { peer_id, info_hash } => {
                self.conns.delete_pending(peer_id, info_hash);
                // We chose to dial; failure suggests an unhealthy peer.
                if let Err(e) = self.conns.blacklist(peer_id, info_hash) {
                    tracing::debug!("cannot blacklist {}: {}", peer_id, e);
                }
            },

            Event::OutgoingConn { conn, bitfield, torrent } => {
                if !self.controls.contains_key(&conn.info_hash()) {
                    // The torrent was torn down while the dial was in flight.
                    tracing::warn!("outgoing conn for unknown torrent {}", conn.info_hash());
                    tokio::spawn(conn.close());
                } else if !self.connect_peer(conn.clone(), bitfield, torrent, String::new()) {
                    tokio::spawn(conn.close());
                }
            },

            Event::ConnClosed(conn) => {
                if self.conns.delete_active(&conn) {
                    if let Err(e) = self.conns.blacklist(conn.peer_id(), conn.info_hash()) {
                        tracing::debug!("cannot blacklist {}: {}", conn.peer_id(), e);
                    }
                    self.retune_egress();
                }
            },

            Event::AnnounceTick => self.handle_announce_tick(),

            Event::AnnounceResult { info_hash, peers } => {
                self.handle_announce_result(info_hash, peers);
            },

            Event::AnnounceErr { info_hash } => self.announce_queue.ready(info_hash),

            Event::NewTorrent { namespace, torrent, result } => {
                self.handle_new_torrent(namespace, torrent, result);
            },

            Event::DispatcherComplete { digest, info_hash } => {
                self.handle_dispatcher_complete(digest, info_hash);
            },

            Event::PreemptionTick => self.handle_preemption_tick().await,

            Event::EmitStats => {
                tracing::info!(
                    target: "stats",
                    active_conns = self.conns.num_active_conns(),
                    torrents = self.controls.len(),
                    "scheduler gauges",
                );
            },

            Event::BlacklistSnapshot(result) => {
                let _ = result.send(self.conns.blacklist_snapshot());
            },

            Event::RemoveTorrent { digest, result } => {
                if let Some(h) = self.digests.get(&digest).copied() {
                    self.teardown_torrent(h, Err(SchedulerError::TorrentRemoved)).await;
                }
                if let Err(e) = self.archive.delete_torrent(digest) {
                    tracing::warn!("failed to delete torrent {}: {}", digest, e);
                }
                let _ = result.send(Ok(()));
            },

            Event::Probe => {},

            Event::Shutdown => {
                self.handle_shutdown().await;
                return true;
            },
        }
        false
    }

    fn handle_incoming_handshake(&mut self, pc: PendingConn) {

        let peer_id = pc.peer_id();
        let info_hash = pc.info_hash();
        if let Err(e) = self.conns.add_pending(peer_id, info_hash, &[]) {
            tracing::debug!("refusing handshake from {}: {}", peer_id, e);
            // Dropping the pending conn closes its socket.
            return;
        }

        let archive = self.archive.clone();
        let handshaker = self.handshaker.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let failure = Event::FailedIncomingHandshake { peer_id, info_hash };

            let Some(digest) = Digest::from_hex(pc.name()) else {
                tracing::warn!("handshake names undecodable blob {:?}", pc.name());
                events.send(failure).await.ok();
                return;
            };
            let torrent = match archive.create_torrent("", digest) {
                Ok(torrent) => torrent,
                Err(e) => {
                    tracing::warn!("cannot open torrent {} for remote: {}", digest, e);
                    events.send(failure).await.ok();
                    return;
                },
            };

            match handshaker.establish(pc, torrent.as_ref()).await {
                Ok((conn, bitfield)) => {
                    events.send(Event::IncomingConn { conn, bitfield, torrent }).await.ok();
                },
                Err(e) => {
                    tracing::debug!("failed to establish handshake with {}: {}", peer_id, e);
                    events.send(failure).await.ok();
                },
            }
        });
    }

    // Activates a connection and hands it to the torrent's dispatcher,
    // creating the torrent control if this is the first peer.
    fn connect_peer(
        &mut self,
        conn: Arc<Connection>,
        bitfield: Bitfield,
        torrent: Arc<dyn Torrent>,
        namespace: String,
    ) -> bool {

        let h = conn.info_hash();
        if !self.controls.contains_key(&h) {
            self.new_torrent_control(namespace, torrent, false);
        }

        if let Err(e) = self.conns.move_pending_to_active(&conn) {
            tracing::warn!("cannot activate conn to {}: {}", conn.peer_id(), e);
            return false;
        }

        let control = self.controls.get(&h).expect("control exists");
        if let Err(e) = control
            .dispatcher
            .clone()
            .add_peer(conn.peer_id(), bitfield, conn.clone())
        {
            tracing::warn!("dispatcher refused {}: {}", conn.peer_id(), e);
            self.conns.delete_active(&conn);
            return false;
        }

        tracing::info!(peer = %conn.peer_id(), hash = %h, "peer connected");
        self.retune_egress();
        true
    }

    fn new_torrent_control(
        &mut self,
        namespace: String,
        torrent: Arc<dyn Torrent>,
        local_request: bool,
    ) -> &mut TorrentControl {

        let h = torrent.info_hash();
        let digest = torrent.digest();
        let dispatcher = Dispatcher::new(torrent.clone(), &self.config, self.events.clone());

        tracing::info!(
            target: "network_event",
            op = "add_torrent",
            digest = %digest,
            hash = %h,
            "torrent added",
        );
        self.digests.insert(digest, h);
        self.announce_queue.add(h);
        self.controls.entry(h).or_insert(TorrentControl {
            namespace,
            complete: torrent.complete(),
            dispatcher,
            waiters: Vec::new(),
            local_request,
        })
    }

    // Pops the rotation until a torrent that is worth announcing comes up.
    // One pass over the ready list at most; skipped torrents go to the back.
    fn handle_announce_tick(&mut self) {
        let mut attempts = self.announce_queue.num_ready();
        while attempts > 0 {
            attempts -= 1;
            let Some(h) = self.announce_queue.next() else {
                return;
            };
            let Some(control) = self.controls.get(&h) else {
                tracing::warn!("announce queue holds unknown torrent {}", h);
                self.announce_queue.ready(h);
                continue;
            };
            if self.conns.saturated(h) {
                // Every slot is busy; asking for more peers is pointless.
                self.announce_queue.ready(h);
                continue;
            }
            self.spawn_announce(control.dispatcher.clone());
            return;
        }
    }

    fn spawn_announce(&self, dispatcher: Arc<Dispatcher>) {
        // Origins serve without ever announcing.
        if self.config.disable_announcing {
            return;
        }
        let announcer = self.announcer.clone();
        let events = self.events.clone();
        let local_peer = PeerInfo {
            peer_id: self.peer_id,
            ip: self.listen_addr.ip().to_string(),
            port: self.listen_addr.port(),
            origin: false,
            complete: dispatcher.complete(),
        };
        let info_hash = dispatcher.info_hash();
        let name = dispatcher.name();
        tokio::spawn(async move {
            match announcer.announce(&name, info_hash, local_peer).await {
                Ok(peers) => {
                    events.send(Event::AnnounceResult { info_hash, peers }).await.ok();
                },
                Err(e) => {
                    tracing::error!("announce for {} failed: {}", info_hash, e);
                    events.send(Event::AnnounceErr { info_hash }).await.ok();
                },
            }
        });
    }

    fn handle_announce_result(&mut self, h: InfoHash, peers: Vec<PeerInfo>) {

        self.announce_queue.ready(h);
        let Some(control) = self.controls.get(&h) else {
            return;
        };
        // A complete torrent serves inbound traffic; it needs no new peers.
        if control.complete {
            return;
        }
        let torrent = control.dispatcher.torrent().clone();
        let handout: Vec<PeerId> = peers.iter().map(|p| p.peer_id).collect();

        for peer in peers {
            if peer.peer_id == self.peer_id {
                continue;
            }
            if self.conns.blacklisted(peer.peer_id, h) {
                tracing::debug!("skipping blacklisted peer {}", peer.peer_id);
                continue;
            }
            let Some(addr) = peer.addr() else {
                tracing::warn!("tracker handed out unparseable address for {}", peer.peer_id);
                continue;
            };
            match self.conns.add_pending(peer.peer_id, h, &handout) {
                Ok(()) => self.spawn_outgoing_handshake(peer.peer_id, addr, torrent.clone()),
                Err(StateError::TorrentAtCapacity) => break,
                Err(e) => {
                    tracing::debug!("not dialing {}: {}", peer.peer_id, e);
                },
            }
        }
    }

    fn spawn_outgoing_handshake(
        &self,
        peer_id: PeerId,
        addr: SocketAddr,
        torrent: Arc<dyn Torrent>,
    ) {
        let handshaker = self.handshaker.clone();
        let events = self.events.clone();
        let info_hash = torrent.info_hash();
        tokio::spawn(async move {
            match handshaker.initialize(addr, torrent.as_ref()).await {
                Ok((conn, bitfield)) if conn.peer_id() == peer_id => {
                    events.send(Event::OutgoingConn { conn, bitfield, torrent }).await.ok();
                },
                Ok((conn, _)) => {
                    tracing::warn!(
                        "peer at {} identifies as {}, expected {}",
                        addr, conn.peer_id(), peer_id,
                    );
                    conn.close().await;
                    events.send(Event::FailedOutgoingHandshake { peer_id, info_hash }).await.ok();
                },
                Err(e) => {
                    tracing::debug!("failed to dial {} at {}: {}", peer_id, addr, e);
                    events.send(Event::FailedOutgoingHandshake { peer_id, info_hash }).await.ok();
                },
            }
        });
    }

    fn handle_new_torrent(
        &mut self,
        namespace: String,
        torrent: Arc<dyn Torrent>,
        result: oneshot::Sender<Result<()>>,
    ) {
        let h = torrent.info_hash();

        if let Some(control) = self.controls.get_mut(&h) {
            if control.complete {
                let _ = result.send(Ok(()));
            } else {
                control.local_request = true;
                control.waiters.push(result);
            }
            return;
        }

        let control = self.new_torrent_control(namespace, torrent, true);
        if control.complete {
            // The blob is already fully present locally.
            let _ = result.send(Ok(()));
        } else {
            control.waiters.push(result);
        }
        let dispatcher = self.controls.get(&h).expect("control exists").dispatcher.clone();
        // Announce straight away rather than waiting out a tick.
        self.spawn_announce(dispatcher);
    }

    fn handle_dispatcher_complete(&mut self, digest: Digest, h: InfoHash) {

        let Some(control) = self.controls.get_mut(&h) else {
            return;
        };
        control.complete = true;
        for waiter in control.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        let dispatcher = control.dispatcher.clone();

        // Nobody needs a second chance at a finished torrent.
        self.conns.clear_blacklist(h);
        self.announce_queue.eject(h);

        tracing::info!(
            target: "network_event",
            op = "torrent_complete",
            digest = %digest,
            "torrent complete",
        );
        // One more announce so the tracker learns we seed now.
        self.spawn_announce(dispatcher);
    }

    async fn handle_preemption_tick(&mut self) {

        let now = Instant::now();

        for conn in self.conns.active_conns() {
            let mut last_progress = conn.created_at();
            if let Some(control) = self.controls.get(&conn.info_hash()) {
                let received = control.dispatcher.last_good_piece_received(conn.peer_id());
                let sent = control.dispatcher.last_piece_sent(conn.peer_id());
                for t in [received, sent].into_iter().flatten() {
                    last_progress = last_progress.max(t);
                }
            }
            let stale = now.saturating_duration_since(last_progress) > self.config.conn_tti;
            let expired = now.saturating_duration_since(conn.created_at()) > self.config.conn_ttl;
            if stale || expired {
                tracing::info!(
                    peer = %conn.peer_id(),
                    hash = %conn.info_hash(),
                    stale,
                    expired,
                    "preempting connection",
                );
                tokio::spawn(conn.close());
            }
        }

        let mut teardowns = Vec::new();
        for (h, control) in self.controls.iter() {
            let dispatcher = &control.dispatcher;
            if control.complete {
                let idle = now.saturating_duration_since(dispatcher.last_write_time());
                if idle > self.config.seeder_tti {
                    teardowns.push((*h, Ok(())));
                }
            } else {
                let idle = now.saturating_duration_since(dispatcher.last_read_time());
                if idle > self.config.leecher_tti {
                    teardowns.push((*h, Err(SchedulerError::TorrentTimeout)));
                }
            }
        }
        for (h, result) in teardowns {
            tracing::info!(hash = %h, "tearing down idle torrent");
            self.teardown_torrent(h, result).await;
        }
    }

    async fn teardown_torrent(&mut self, h: InfoHash, result: Result<()>) {
        let Some(control) = self.controls.remove(&h) else {
            return;
        };
        self.digests.remove(&control.dispatcher.digest());
        self.announce_queue.eject(h);
        for waiter in control.waiters {
            let _ = waiter.send(result.clone());
        }
        control.dispatcher.teardown().await;
    }

    async fn handle_shutdown(&mut self) {
        let hashes: Vec<InfoHash> = self.controls.keys().copied().collect();
        for h in hashes {
            self.teardown_torrent(h, Err(SchedulerError::SchedulerStopped)).await;
        }
        for conn in self.conns.active_conns() {
            conn.close().await;
        }
    }

    // Splits the global egress budget evenly across active connections.
    fn retune_egress(&self) {
        if self.config.disable_throttling {
            return;
        }
        let conns = self.conns.active_conns();
        if conns.is_empty() {
            return;
        }
        let share = self.config.max_global_egress_bytes_per_sec / conns.len() as u64;
        let limit = share.max(self.config.min_conn_egress_bytes_per_sec);
        for conn in conns {
            conn.set_egress_bandwidth_limit(limit);
        }
    }
}

async fn run_event_loop(mut state: State, mut events_rx: mpsc::Receiver<Event>) {
    tracing::debug!("event loop starting");
    while let Some(event) = events_rx.recv().await {
        tracing::trace!("applying: {}", event);
        if state.apply(event).await {
            break;
        }
    }
    tracing::debug!("event loop stopped");
}

async fn run_listen_loop(
    listener: TcpListener,
    handshaker: Arc<Handshaker>,
    events: EventSender,
    mut done_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = done_rx.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    tracing::debug!("accepted connection from {}", addr);
                    let handshaker = handshaker.clone();
                    let events = events.clone();
                    tokio::spawn(async move {
                        match handshaker.accept(socket).await {
                            Ok(pc) => {
                                events.send(Event::IncomingHandshake(pc)).await.ok();
                            },
                            Err(e) => {
                                tracing::debug!("inbound handshake from {} failed: {}", addr, e);
                            },
                        }
                    });
                },
                Err(e) => tracing::warn!("accept error: {}", e),
            },
        }
    }
}

async fn run_ticker_loop(config: Config, events: EventSender, mut done_rx: watch::Receiver<bool>) {
    let mut preemption = time::interval(config.preemption_interval);
    let mut stats = time::interval(config.emit_stats_interval);
    preemption.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    stats.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = done_rx.changed() => break,
            _ = preemption.tick(), if !config.disable_preemption => {
                if events.send(Event::PreemptionTick).await.is_err() {
                    break;
                }
            },
            _ = stats.tick() => {
                if events.send(Event::EmitStats).await.is_err() {
                    break;
                }
            },
        }
    }
}

async fn run_announce_loop(
    announcer: Arc<Announcer>,
    events: EventSender,
    mut done_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = done_rx.changed() => break,
            _ = time::sleep(announcer.interval()) => {
                if events.send(Event::AnnounceTick).await.is_err() {
                    break;
                }
            },
        }
    }
}

// Everything one running scheduler generation owns. Replaced wholesale on
// reload.
struct Inner {

    config: Config,

    archive: Arc<dyn TorrentArchive>,

    client: Arc<dyn AnnounceClient>,

    events: EventSender,

    peer_id: PeerId,

    listen_addr: SocketAddr,

    done_tx: watch::Sender<bool>,

    tasks: Vec<JoinHandle<()>>,

    stopped: bool,

}

impl Inner {

    async fn start(
        config: Config,
        archive: Arc<dyn TorrentArchive>,
        client: Arc<dyn AnnounceClient>,
    ) -> std::io::Result<Self> {

        let peer_id = PeerId::random();
        let listener = TcpListener::bind(config.listen_addr).await?;
        let listen_addr = listener.local_addr()?;
        tracing::info!(peer = %peer_id, addr = %listen_addr, "scheduler starting");

        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        let events = EventSender::new(events_tx);
        let (done_tx, done_rx) = watch::channel(false);

        let handshaker = Arc::new(Handshaker::new(peer_id, &config, events.clone()));
        let announcer = Arc::new(Announcer::new(client.clone(), &config));

        let state = State {
            conns: ConnectionState::new(&config),
            controls: HashMap::new(),
            digests: HashMap::new(),
            announce_queue: if config.disable_announcing {
                AnnounceQueue::disabled()
            } else {
                AnnounceQueue::new()
            },
            peer_id,
            listen_addr,
            archive: archive.clone(),
            announcer: announcer.clone(),
            handshaker: handshaker.clone(),
            events: events.clone(),
            config: config.clone(),
        };

        let span = tracing::info_span!("scheduler", peer = %peer_id);
        let mut tasks = vec![
            tokio::spawn(run_event_loop(state, events_rx).instrument(span.clone())),
            tokio::spawn(
                run_listen_loop(listener, handshaker, events.clone(), done_rx.clone())
                    .instrument(span.clone()),
            ),
            tokio::spawn(
                run_ticker_loop(config.clone(), events.clone(), done_rx.clone())
                    .instrument(span.clone()),
            ),
        ];
        if !config.disable_announcing {
            tasks.push(tokio::spawn(
                run_announce_loop(announcer, events.clone(), done_rx).instrument(span),
            ));
        }

        Ok(Inner {
            config,
            archive,
            client,
            events,
            peer_id,
            listen_addr,
            done_tx,
            tasks,
            stopped: false,
        })
    }

    async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        tracing::info!(peer = %self.peer_id, "scheduler stopping");

        // The event loop drains and tears down; the other loops watch done.
        self.events.send(Event::Shutdown).await.ok();
        let _ = self.done_tx.send(true);
        for task in self.tasks.drain(..) {
            task.await.ok();
        }
    }
}

// The public face of the peer-to-peer scheduler. One per process.
pub struct Scheduler {

    inner: RwLock<Inner>,

}

impl Scheduler {

    pub async fn start(
        config: Config,
        archive: Arc<dyn TorrentArchive>,
        client: Arc<dyn AnnounceClient>,
    ) -> std::io::Result<Self> {
        let inner = Inner::start(config, archive, client).await?;
        Ok(Scheduler { inner: RwLock::new(inner) })
    }

    pub async fn peer_id(&self) -> PeerId {
        self.inner.read().await.peer_id
    }

    pub async fn listen_addr(&self) -> SocketAddr {
        self.inner.read().await.listen_addr
    }

    // Fetches the blob into local storage, waiting until every piece is
    // written and verified. Safe to call concurrently for the same digest.
    pub async fn download(&self, namespace: &str, digest: Digest) -> Result<()> {

        let (result_rx, length) = {
            let inner = self.inner.read().await;
            if inner.stopped {
                return Err(SchedulerError::SchedulerStopped);
            }
            let torrent = match inner.archive.create_torrent(namespace, digest) {
                Ok(torrent) => torrent,
                Err(StorageError::TorrentNotFound) => {
                    return Err(SchedulerError::TorrentNotFound);
                },
                Err(e) => {
                    tracing::error!("cannot open torrent {}: {}", digest, e);
                    return Err(SchedulerError::TorrentNotFound);
                },
            };
            let length = torrent.length();
            let (result_tx, result_rx) = oneshot::channel();
            inner
                .events
                .send(Event::NewTorrent {
                    namespace: namespace.to_owned(),
                    torrent,
                    result: result_tx,
                })
                .await?;
            (result_rx, length)
        };

        let started = Instant::now();
        let result = result_rx.await.map_err(|_| SchedulerError::SchedulerStopped)?;
        match &result {
            Ok(()) => {
                tracing::info!(
                    target: "stats",
                    digest = %digest,
                    size_bucket = size_bucket(length),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "download complete",
                );
            },
            Err(e) => {
                tracing::warn!(
                    target: "stats",
                    digest = %digest,
                    error = error_tag(e),
                    "download failed",
                );
            },
        }
        result
    }

    pub async fn blacklist_snapshot(&self) -> Result<Vec<BlacklistedConn>> {
        let (result_tx, result_rx) = oneshot::channel();
        self.inner
            .read()
            .await
            .events
            .send(Event::BlacklistSnapshot(result_tx))
            .await?;
        result_rx.await.map_err(|_| SchedulerError::SchedulerStopped)
    }

    pub async fn remove_torrent(&self, digest: Digest) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.inner
            .read()
            .await
            .events
            .send(Event::RemoveTorrent { digest, result: result_tx })
            .await?;
        result_rx.await.map_err(|_| SchedulerError::SchedulerStopped)?
    }

    // Checks that the event loop is accepting events within a bounded time.
    pub async fn probe(&self) -> Result<()> {
        let inner = self.inner.read().await;
        inner
            .events
            .send_timeout(Event::Probe, inner.config.probe_timeout)
            .await
    }

    // Idempotent; waits for every task the scheduler spawned at boot.
    pub async fn stop(&self) {
        self.inner.write().await.shutdown().await;
    }

    // Stops the running scheduler and boots a fresh one with the new
    // configuration. On failure the scheduler stays stopped; callers treat
    // that as fatal.
    pub async fn reload(&self, config: Config) -> std::io::Result<()> {
        let mut inner = self.inner.write().await;
        inner.shutdown().await;
        let archive = inner.archive.clone();
        let client = inner.client.clone();
        *inner = Inner::start(config, archive, client).await?;
        Ok(())
    }
}

fn size_bucket(length: u64) -> &'static str {
    const MB: u64 = 1024 * 1024;
    match length {
        l if l < 10 * MB => "xsmall",
        l if l < 100 * MB => "small",
        l if l < 1024 * MB => "medium",
        l if l < 10 * 1024 * MB => "large",
        _ => "xlarge",
    }
}

fn error_tag(e: &SchedulerError) -> &'static str {
    match e {
        SchedulerError::TorrentNotFound => "not_found",
        SchedulerError::TorrentTimeout => "timeout",
        SchedulerError::TorrentRemoved => "removed",
        SchedulerError::SchedulerStopped => "scheduler_stopped",
        SchedulerError::SendEventTimedOut => "unknown",
    }
}
