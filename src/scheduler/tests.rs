use std::{sync::Arc, time::Duration};
use tokio::time;
use crate::{
    announce::{AnnounceQueue, Announcer},
    conn::{ConnectionState, Handshaker},
    storage::{MemoryTorrentArchive, TorrentMeta},
    testutil::{self, LocalTracker},
    tracker::PeerInfo,
    Config, PeerId, Scheduler, SchedulerError,
};
use super::*;

const NAMESPACE: &str = "test/repo";

fn scenario_config() -> Config {
    Config {
        // Short blacklists so simultaneous-dial collisions resolve quickly.
        blacklist_duration: Duration::from_millis(500),
        ..testutil::test_config()
    }
}

async fn read_all(torrent: &Arc<dyn Torrent>) -> Vec<u8> {
    let mut all = Vec::new();
    for idx in 0..torrent.num_pieces() {
        all.extend(torrent.read_piece(idx).unwrap());
    }
    all
}

async fn start_seeder(
    tracker: &Arc<LocalTracker>,
    meta: &TorrentMeta,
    data: &[u8],
) -> anyhow::Result<Scheduler> {
    let archive = Arc::new(MemoryTorrentArchive::new());
    archive.seed(meta.clone(), data)?;
    let seeder = Scheduler::start(scenario_config(), archive, tracker.clone()).await?;
    // Registers the torrent and announces it as complete.
    seeder.download(NAMESPACE, meta.digest).await?;
    Ok(seeder)
}

async fn start_leecher(
    tracker: &Arc<LocalTracker>,
    meta: &TorrentMeta,
) -> anyhow::Result<(Scheduler, Arc<MemoryTorrentArchive>)> {
    start_leecher_with(tracker, meta, scenario_config()).await
}

async fn start_leecher_with(
    tracker: &Arc<LocalTracker>,
    meta: &TorrentMeta,
    config: Config,
) -> anyhow::Result<(Scheduler, Arc<MemoryTorrentArchive>)> {
    let archive = Arc::new(MemoryTorrentArchive::new());
    archive.register(meta.clone());
    let leecher = Scheduler::start(config, archive.clone(), tracker.clone()).await?;
    Ok((leecher, archive))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_from_single_seeder() -> anyhow::Result<()> {

    let tracker = LocalTracker::new();
    let data = testutil::content(1024 * 1024);
    let meta = TorrentMeta::from_content(&data, 256 * 1024);

    let seeder = start_seeder(&tracker, &meta, &data).await?;
    let (leecher, leecher_archive) = start_leecher(&tracker, &meta).await?;

    time::timeout(Duration::from_secs(30), leecher.download(NAMESPACE, meta.digest)).await??;

    let torrent = leecher_archive.get_torrent(NAMESPACE, meta.digest)?;
    assert!(torrent.complete());
    assert_eq!(read_all(&torrent).await, data);

    // A second download of a finished torrent returns straight away.
    leecher.download(NAMESPACE, meta.digest).await?;

    seeder.stop().await;
    leecher.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_leechers_one_seeder_slot() -> anyhow::Result<()> {

    let tracker = LocalTracker::new();
    let data = testutil::content(512 * 1024);
    let meta = TorrentMeta::from_content(&data, 128 * 1024);

    // The seeder accepts a single connection; both leechers must still
    // finish, one of them via the other.
    let seeder_archive = Arc::new(MemoryTorrentArchive::new());
    seeder_archive.seed(meta.clone(), &data)?;
    let seeder = Scheduler::start(
        Config {
            max_open_connections_per_torrent: 1,
            ..scenario_config()
        },
        seeder_archive,
        tracker.clone(),
    )
    .await?;
    seeder.download(NAMESPACE, meta.digest).await?;

    let (leecher_a, archive_a) = start_leecher(&tracker, &meta).await?;
    let (leecher_b, archive_b) = start_leecher(&tracker, &meta).await?;

    let (first, second) = time::timeout(Duration::from_secs(60), async {
        tokio::join!(
            leecher_a.download(NAMESPACE, meta.digest),
            leecher_b.download(NAMESPACE, meta.digest),
        )
    })
    .await?;
    first?;
    second?;

    for archive in [&archive_a, &archive_b] {
        let torrent = archive.get_torrent(NAMESPACE, meta.digest)?;
        assert!(torrent.complete());
        assert_eq!(read_all(&torrent).await, data);
    }

    seeder.stop().await;
    leecher_a.stop().await;
    leecher_b.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_piece_spread_across_many_peers() -> anyhow::Result<()> {

    let tracker = LocalTracker::new();
    let data = testutil::content(10 * 256);
    let meta = TorrentMeta::from_content(&data, 256);
    assert_eq!(meta.num_pieces(), 10);

    // Ten peers, each starting with a different single piece.
    let mut peers = Vec::new();
    for idx in 0..10 {
        let archive = Arc::new(MemoryTorrentArchive::new());
        archive.register(meta.clone());
        let torrent = archive.create_torrent(NAMESPACE, meta.digest)?;
        torrent.write_piece(idx, &data[idx * 256..(idx + 1) * 256])?;
        let scheduler = Scheduler::start(scenario_config(), archive.clone(), tracker.clone()).await?;
        peers.push((scheduler, archive));
    }

    let downloads = peers
        .iter()
        .map(|(scheduler, _)| scheduler.download(NAMESPACE, meta.digest));
    let results = time::timeout(Duration::from_secs(60), futures::future::join_all(downloads)).await?;
    for result in results {
        result?;
    }

    for (_, archive) in &peers {
        let torrent = archive.get_torrent(NAMESPACE, meta.digest)?;
        assert_eq!(read_all(&torrent).await, data);
    }

    for (scheduler, _) in &peers {
        scheduler.stop().await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_origin_serves_without_announcing() -> anyhow::Result<()> {

    let tracker = LocalTracker::new();
    let data = testutil::content(256 * 1024);
    let meta = TorrentMeta::from_content(&data, 64 * 1024);

    // The origin seeds but never announces; the tracker is told about it
    // out of band. Its torrent control only comes to life when the leecher
    // dials in.
    let origin_archive = Arc::new(MemoryTorrentArchive::new());
    origin_archive.seed(meta.clone(), &data)?;
    let origin = Scheduler::start(
        Config {
            disable_announcing: true,
            ..scenario_config()
        },
        origin_archive,
        tracker.clone(),
    )
    .await?;
    tracker.inject(
        meta.info_hash(),
        PeerInfo {
            peer_id: origin.peer_id().await,
            ip: origin.listen_addr().await.ip().to_string(),
            port: origin.listen_addr().await.port(),
            origin: true,
            complete: true,
        },
    );

    let (leecher, leecher_archive) = start_leecher(&tracker, &meta).await?;
    time::timeout(Duration::from_secs(30), leecher.download(NAMESPACE, meta.digest)).await??;

    let torrent = leecher_archive.get_torrent(NAMESPACE, meta.digest)?;
    assert_eq!(read_all(&torrent).await, data);

    origin.stop().await;
    leecher.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_leecher_times_out() -> anyhow::Result<()> {

    // Nobody has the blob; the leecher waits until preemption evicts it.
    let tracker = LocalTracker::new();
    let data = testutil::content(1024);
    let meta = TorrentMeta::from_content(&data, 256);

    let config = Config {
        leecher_tti: Duration::from_secs(2),
        preemption_interval: Duration::from_millis(500),
        ..scenario_config()
    };
    let (leecher, _) = start_leecher_with(&tracker, &meta, config).await?;

    let result = time::timeout(Duration::from_secs(30), leecher.download(NAMESPACE, meta.digest)).await?;
    assert_eq!(result, Err(SchedulerError::TorrentTimeout));

    leecher.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remove_torrent_fails_waiters() -> anyhow::Result<()> {

    let tracker = LocalTracker::new();
    let data = testutil::content(1024);
    let meta = TorrentMeta::from_content(&data, 256);
    let digest = meta.digest;

    let (leecher, _) = start_leecher(&tracker, &meta).await?;
    let leecher = Arc::new(leecher);

    let downloader = {
        let leecher = leecher.clone();
        tokio::spawn(async move { leecher.download(NAMESPACE, digest).await })
    };
    // Let the download register before removing it.
    time::sleep(Duration::from_millis(300)).await;
    leecher.remove_torrent(digest).await?;

    let result = time::timeout(Duration::from_secs(10), downloader).await??;
    assert_eq!(result, Err(SchedulerError::TorrentRemoved));

    leecher.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_dial_blacklists_peer() -> anyhow::Result<()> {

    let tracker = LocalTracker::new();
    let data = testutil::content(1024);
    let meta = TorrentMeta::from_content(&data, 256);

    // A dead peer: nothing listens on its port.
    let dead_peer = PeerId::random();
    let dead_port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };
    tracker.inject(
        meta.info_hash(),
        PeerInfo {
            peer_id: dead_peer,
            ip: "127.0.0.1".into(),
            port: dead_port,
            origin: false,
            complete: true,
        },
    );

    let config = Config {
        blacklist_duration: Duration::from_secs(60),
        ..scenario_config()
    };
    let (leecher, _) = start_leecher_with(&tracker, &meta, config).await?;
    let leecher = Arc::new(leecher);
    let downloader = {
        let leecher = leecher.clone();
        let digest = meta.digest;
        tokio::spawn(async move { leecher.download(NAMESPACE, digest).await })
    };

    let snapshot = time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = leecher.blacklist_snapshot().await.unwrap();
            if !snapshot.is_empty() {
                return snapshot;
            }
            time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await?;
    assert_eq!(snapshot[0].peer_id, dead_peer);
    assert_eq!(snapshot[0].info_hash, meta.info_hash());
    assert!(snapshot[0].remaining <= Duration::from_secs(60));

    leecher.remove_torrent(meta.digest).await?;
    downloader.await?.ok();
    leecher.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_fails_pending_downloads() -> anyhow::Result<()> {

    let tracker = LocalTracker::new();
    let data = testutil::content(1024);
    let meta = TorrentMeta::from_content(&data, 256);
    let digest = meta.digest;

    let (leecher, _) = start_leecher(&tracker, &meta).await?;
    let leecher = Arc::new(leecher);

    leecher.probe().await?;

    let downloader = {
        let leecher = leecher.clone();
        tokio::spawn(async move { leecher.download(NAMESPACE, digest).await })
    };
    time::sleep(Duration::from_millis(300)).await;

    leecher.stop().await;
    let result = time::timeout(Duration::from_secs(10), downloader).await??;
    assert_eq!(result, Err(SchedulerError::SchedulerStopped));

    // Stop is idempotent and everything afterwards reports stopped.
    leecher.stop().await;
    assert_eq!(
        leecher.download(NAMESPACE, digest).await,
        Err(SchedulerError::SchedulerStopped),
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_unknown_digest() -> anyhow::Result<()> {
    let tracker = LocalTracker::new();
    let archive = Arc::new(MemoryTorrentArchive::new());
    let scheduler = Scheduler::start(scenario_config(), archive, tracker.clone()).await?;

    let result = scheduler.download(NAMESPACE, crate::Digest([9; 20])).await;
    assert_eq!(result, Err(SchedulerError::TorrentNotFound));

    scheduler.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reload_rebuilds_scheduler() -> anyhow::Result<()> {

    let tracker = LocalTracker::new();
    let data = testutil::content(256 * 1024);
    let meta = TorrentMeta::from_content(&data, 64 * 1024);

    let seeder = start_seeder(&tracker, &meta, &data).await?;
    let (leecher, _) = start_leecher(&tracker, &meta).await?;

    let old_peer_id = leecher.peer_id().await;
    leecher.reload(scenario_config()).await?;
    assert_ne!(leecher.peer_id().await, old_peer_id);

    // The rebuilt scheduler is fully operational.
    leecher.probe().await?;
    time::timeout(Duration::from_secs(30), leecher.download(NAMESPACE, meta.digest)).await??;

    seeder.stop().await;
    leecher.stop().await;
    Ok(())
}

// State-level checks that need a hand-built event loop state.

fn test_state(config: Config) -> (State, tokio::sync::mpsc::Receiver<Event>) {
    let (events, rx) = testutil::event_channel();
    let peer_id = PeerId::random();
    let state = State {
        conns: ConnectionState::new(&config),
        controls: HashMap::new(),
        digests: HashMap::new(),
        announce_queue: AnnounceQueue::new(),
        peer_id,
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        archive: Arc::new(MemoryTorrentArchive::new()),
        announcer: Arc::new(Announcer::new(LocalTracker::new(), &config)),
        handshaker: Arc::new(Handshaker::new(peer_id, &config, events.clone())),
        events,
        config,
    };
    (state, rx)
}

fn leecher_torrent(pieces: usize) -> Arc<dyn Torrent> {
    let data = testutil::content(pieces * 256);
    let meta = TorrentMeta::from_content(&data, 256);
    let archive = MemoryTorrentArchive::new();
    archive.register(meta.clone());
    archive.create_torrent(NAMESPACE, meta.digest).unwrap()
}

async fn expect_announce_result(rx: &mut tokio::sync::mpsc::Receiver<Event>) -> InfoHash {
    loop {
        match time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("timed out waiting for announce result")
            .expect("event channel closed")
        {
            Event::AnnounceResult { info_hash, .. } => return info_hash,
            _ => continue,
        }
    }
}

async fn expect_no_announce(rx: &mut tokio::sync::mpsc::Receiver<Event>) {
    let waited = time::timeout(Duration::from_millis(200), async {
        loop {
            if let Some(Event::AnnounceResult { .. }) = rx.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(waited.is_err(), "unexpected announce");
}

#[tokio::test(start_paused = true)]
async fn test_announce_tick_skips_saturated_torrents() -> anyhow::Result<()> {

    let (mut state, mut rx) = test_state(Config {
        max_open_connections_per_torrent: 1,
        ..Config::default()
    });

    let t1 = leecher_torrent(1);
    let t2 = leecher_torrent(2);
    state.new_torrent_control(NAMESPACE.into(), t1.clone(), true);
    state.new_torrent_control(NAMESPACE.into(), t2.clone(), true);

    // T1's only slot is filled by an active connection.
    let fixture = testutil::conn_fixture_for(PeerId::random(), t1.clone()).await;
    state
        .conns
        .add_pending(fixture.local.peer_id(), t1.info_hash(), &[])
        .unwrap();
    state.conns.move_pending_to_active(&fixture.local).unwrap();

    // The tick passes over saturated T1 and announces T2.
    state.apply(Event::AnnounceTick).await;
    assert_eq!(expect_announce_result(&mut rx).await, t2.info_hash());

    // While T2 is parked pending, further ticks have nothing to announce.
    for _ in 0..3 {
        state.apply(Event::AnnounceTick).await;
        expect_no_announce(&mut rx).await;
    }

    // A freed slot puts T1 back in play.
    state.apply(Event::ConnClosed(fixture.local.clone())).await;
    state.apply(Event::AnnounceTick).await;
    assert_eq!(expect_announce_result(&mut rx).await, t1.info_hash());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_preemption_closes_stale_conns_and_idle_torrents() -> anyhow::Result<()> {

    let config = Config::default();
    let conn_tti = config.conn_tti;
    let leecher_tti = config.leecher_tti;
    let (mut state, _rx) = test_state(config);

    let torrent = leecher_torrent(4);
    let h = torrent.info_hash();
    state.new_torrent_control(NAMESPACE.into(), torrent.clone(), true);

    let fixture = testutil::conn_fixture_for(PeerId::random(), torrent.clone()).await;
    state
        .conns
        .add_pending(fixture.local.peer_id(), h, &[])
        .unwrap();
    state.conns.move_pending_to_active(&fixture.local).unwrap();

    // Young connection with no progress survives the tick.
    state.apply(Event::PreemptionTick).await;
    assert!(!fixture.local.is_closed());
    assert_eq!(state.conns.num_active_conns(), 1);

    // Push it past the no-progress deadline.
    time::advance(conn_tti + Duration::from_secs(1)).await;
    state.apply(Event::PreemptionTick).await;
    for _ in 0..50 {
        tokio::task::yield_now().await;
        if fixture.local.is_closed() {
            break;
        }
    }
    assert!(fixture.local.is_closed());

    // The incomplete torrent is evicted once idle past its deadline.
    assert!(state.controls.contains_key(&h));
    time::advance(leecher_tti + Duration::from_secs(1)).await;
    state.apply(Event::PreemptionTick).await;
    assert!(!state.controls.contains_key(&h));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_completed_waiters_signaled_once() -> anyhow::Result<()> {

    let (mut state, _rx) = test_state(Config::default());
    let torrent = leecher_torrent(2);
    let h = torrent.info_hash();
    let digest = torrent.digest();

    let (tx1, rx1) = tokio::sync::oneshot::channel();
    let (tx2, rx2) = tokio::sync::oneshot::channel();
    state
        .handle_new_torrent(NAMESPACE.into(), torrent.clone(), tx1);
    state
        .handle_new_torrent(NAMESPACE.into(), torrent.clone(), tx2);

    state.apply(Event::DispatcherComplete { digest, info_hash: h }).await;
    assert_eq!(rx1.await.unwrap(), Ok(()));
    assert_eq!(rx2.await.unwrap(), Ok(()));

    // Later downloads of the finished torrent complete immediately.
    let (tx3, rx3) = tokio::sync::oneshot::channel();
    state.handle_new_torrent(NAMESPACE.into(), torrent, tx3);
    assert_eq!(rx3.await.unwrap(), Ok(()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_incoming_handshake_respects_capacity() -> anyhow::Result<()> {

    let (mut state, _rx) = test_state(Config {
        max_open_connections_per_torrent: 1,
        ..Config::default()
    });
    let torrent = leecher_torrent(1);
    let h = torrent.info_hash();

    state.conns.add_pending(PeerId::random(), h, &[]).unwrap();

    // A second remote is refused; its socket is simply dropped.
    let fixture = testutil::conn_fixture_for(PeerId::random(), torrent.clone()).await;
    let refused = fixture.local.peer_id();
    assert!(matches!(
        state.conns.add_pending(refused, h, &[]),
        Err(StateError::TorrentAtCapacity)
    ));
    Ok(())
}
