use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use crate::{
    config::Config,
    tracker::{AnnounceClient, AnnounceRequest, PeerInfo, TrackerError},
    InfoHash,
};

// Rotation of torrents eligible to announce. A torrent is either in the
// ready queue, or in the pending set while an announce for it is in flight,
// or absent. Mutated only by the event loop.
pub enum AnnounceQueue {

    Active {
        ready: VecDeque<InfoHash>,
        pending: HashSet<InfoHash>,
    },

    // Origins only serve; they never announce for peers.
    Disabled,

}

impl AnnounceQueue {

    pub fn new() -> Self {
        AnnounceQueue::Active {
            ready: VecDeque::new(),
            pending: HashSet::new(),
        }
    }

    pub fn disabled() -> Self {
        AnnounceQueue::Disabled
    }

    // Joins the rotation at the back. Callers guarantee the hash is not
    // already tracked.
    pub fn add(&mut self, h: InfoHash) {
        if let AnnounceQueue::Active { ready, .. } = self {
            ready.push_back(h);
        }
    }

    // Pops the next torrent to announce and parks it as pending.
    pub fn next(&mut self) -> Option<InfoHash> {
        match self {
            AnnounceQueue::Active { ready, pending } => {
                let h = ready.pop_front()?;
                pending.insert(h);
                Some(h)
            },
            AnnounceQueue::Disabled => None,
        }
    }

    // Returns a pending torrent to the back of the rotation once its
    // announce round trip finishes.
    pub fn ready(&mut self, h: InfoHash) {
        if let AnnounceQueue::Active { ready, pending } = self {
            if pending.remove(&h) {
                ready.push_back(h);
            }
        }
    }

    // Drops the torrent from the rotation entirely.
    pub fn eject(&mut self, h: InfoHash) {
        if let AnnounceQueue::Active { ready, pending } = self {
            pending.remove(&h);
            ready.retain(|queued| *queued != h);
        }
    }

    // How many torrents could be popped right now. Bounds one tick's scan so
    // skipped torrents re-queued at the back are not popped again forever.
    pub fn num_ready(&self) -> usize {
        match self {
            AnnounceQueue::Active { ready, .. } => ready.len(),
            AnnounceQueue::Disabled => 0,
        }
    }
}

impl Default for AnnounceQueue {
    fn default() -> Self {
        Self::new()
    }
}

// Wraps the tracker client with the adaptive announce interval. The tracker
// may return its preferred interval with each response; we keep announcing
// at whatever it last asked for, within configured bounds.
pub struct Announcer {

    client: Arc<dyn AnnounceClient>,

    default_interval: Duration,

    max_interval: Duration,

    interval_millis: AtomicU64,

}

impl Announcer {

    pub fn new(client: Arc<dyn AnnounceClient>, config: &Config) -> Self {
        Self {
            client,
            default_interval: config.announce_interval,
            max_interval: config.max_announce_interval,
            interval_millis: AtomicU64::new(config.announce_interval.as_millis() as u64),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis.load(Ordering::Relaxed))
    }

    pub async fn announce(
        &self,
        name: &str,
        info_hash: InfoHash,
        local_peer: PeerInfo,
    ) -> Result<Vec<PeerInfo>, TrackerError> {

        let response = self
            .client
            .announce(AnnounceRequest {
                name: name.to_owned(),
                info_hash,
                peer: local_peer,
            })
            .await?;

        if let Some(secs) = response.interval {
            let requested = Duration::from_secs(secs);
            // Zero and out-of-range intervals fall back to the default.
            let next = if requested >= self.default_interval && requested <= self.max_interval {
                requested
            } else {
                self.default_interval
            };
            self.interval_millis
                .store(next.as_millis() as u64, Ordering::Relaxed);
        }

        Ok(response.peers)
    }
}
