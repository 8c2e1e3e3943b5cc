use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;
use crate::{config::Config, InfoHash, PeerId};
use super::Connection;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StateError {

    #[error("torrent is at connection capacity")]
    TorrentAtCapacity,

    #[error("connection already pending")]
    ConnAlreadyPending,

    #[error("connection already active")]
    ConnAlreadyActive,

    #[error("no pending connection to activate")]
    InvalidActiveTransition,

    #[error("connection closed")]
    ConnClosed,

    #[error("too many mutual connections")]
    TooManyMutualConns,

    #[error("peer already blacklisted")]
    AlreadyBlacklisted,

}

enum ConnSlot {
    Pending,
    Active(Arc<Connection>),
}

impl ConnSlot {
    fn is_active(&self) -> bool {
        matches!(self, ConnSlot::Active(_))
    }
}

// A snapshot entry of one blacklisted (peer, torrent) pair.
#[derive(Debug, Clone)]
pub struct BlacklistedConn {

    pub peer_id: PeerId,

    pub info_hash: InfoHash,

    pub remaining: Duration,

}

// Tracks every connection the scheduler has open or is opening, and which
// peers are temporarily barred. Owned and mutated by the event loop only.
pub struct ConnectionState {

    capacity: usize,

    max_mutual: usize,

    blacklist_duration: Duration,

    disable_blacklist: bool,

    conns: HashMap<InfoHash, HashMap<PeerId, ConnSlot>>,

    // Value is the entry's expiration time.
    blacklist: HashMap<(InfoHash, PeerId), Instant>,

}

impl ConnectionState {

    pub fn new(config: &Config) -> Self {
        Self {
            capacity: config.max_open_connections_per_torrent,
            max_mutual: config.max_mutual_connections,
            blacklist_duration: config.blacklist_duration,
            disable_blacklist: config.disable_blacklist,
            conns: HashMap::new(),
            blacklist: HashMap::new(),
        }
    }

    // Reserves a connection slot before any handshake work is spent on it.
    // `neighbors` is the tracker handout the peer arrived in; refusing peers
    // whose handout is already well connected to us keeps the mesh spread.
    pub fn add_pending(
        &mut self,
        peer_id: PeerId,
        h: InfoHash,
        neighbors: &[PeerId],
    ) -> Result<(), StateError> {

        // Check before materializing the torrent's map: a failed add must
        // leave no trace, or saturated() starts reading empty entries.
        match self.conns.get(&h) {
            Some(torrent_conns) => {
                if torrent_conns.len() == self.capacity {
                    return Err(StateError::TorrentAtCapacity);
                }
                match torrent_conns.get(&peer_id) {
                    Some(ConnSlot::Pending) => return Err(StateError::ConnAlreadyPending),
                    Some(ConnSlot::Active(_)) => return Err(StateError::ConnAlreadyActive),
                    None => {},
                }
                let mutual = neighbors
                    .iter()
                    .filter(|n| torrent_conns.contains_key(n))
                    .count();
                if mutual > self.max_mutual {
                    return Err(StateError::TooManyMutualConns);
                }
            },
            None if self.capacity == 0 => return Err(StateError::TorrentAtCapacity),
            None => {},
        }

        self.conns.entry(h).or_default().insert(peer_id, ConnSlot::Pending);
        Ok(())
    }

    pub fn delete_pending(&mut self, peer_id: PeerId, h: InfoHash) {
        if let Some(torrent_conns) = self.conns.get_mut(&h) {
            if matches!(torrent_conns.get(&peer_id), Some(ConnSlot::Pending)) {
                torrent_conns.remove(&peer_id);
                if torrent_conns.is_empty() {
                    self.conns.remove(&h);
                }
            }
        }
    }

    // The only path into the active state.
    pub fn move_pending_to_active(&mut self, c: &Arc<Connection>) -> Result<(), StateError> {
        if c.is_closed() {
            return Err(StateError::ConnClosed);
        }
        let slot = self
            .conns
            .get_mut(&c.info_hash())
            .and_then(|m| m.get_mut(&c.peer_id()));
        match slot {
            Some(slot) if matches!(slot, ConnSlot::Pending) => {
                *slot = ConnSlot::Active(c.clone());
                Ok(())
            },
            _ => Err(StateError::InvalidActiveTransition),
        }
    }

    // Removes an active entry, but only for the exact connection instance
    // given. A newer connection may have reused the same (hash, peer) key.
    pub fn delete_active(&mut self, c: &Arc<Connection>) -> bool {
        let Some(torrent_conns) = self.conns.get_mut(&c.info_hash()) else {
            return false;
        };
        match torrent_conns.get(&c.peer_id()) {
            Some(ConnSlot::Active(stored)) if Arc::ptr_eq(stored, c) => {
                torrent_conns.remove(&c.peer_id());
                if torrent_conns.is_empty() {
                    self.conns.remove(&c.info_hash());
                }
                true
            },
            _ => false,
        }
    }

    // A torrent is saturated when every slot is filled by an active
    // connection; announcing for more peers would be wasted.
    pub fn saturated(&self, h: InfoHash) -> bool {
        self.conns
            .get(&h)
            .map(|m| m.len() == self.capacity && m.values().all(ConnSlot::is_active))
            .unwrap_or(false)
    }

    pub fn blacklist(&mut self, peer_id: PeerId, h: InfoHash) -> Result<(), StateError> {
        if self.disable_blacklist {
            return Ok(());
        }
        let now = Instant::now();
        if let Some(expiration) = self.blacklist.get(&(h, peer_id)) {
            if *expiration > now {
                return Err(StateError::AlreadyBlacklisted);
            }
        }
        self.blacklist
            .insert((h, peer_id), now + self.blacklist_duration);
        Ok(())
    }

    pub fn blacklisted(&self, peer_id: PeerId, h: InfoHash) -> bool {
        self.blacklist
            .get(&(h, peer_id))
            .map(|expiration| *expiration > Instant::now())
            .unwrap_or(false)
    }

    // Dropped wholesale when a torrent completes; it no longer needs peers.
    pub fn clear_blacklist(&mut self, h: InfoHash) {
        self.blacklist.retain(|(hash, _), _| *hash != h);
    }

    pub fn blacklist_snapshot(&self) -> Vec<BlacklistedConn> {
        let now = Instant::now();
        self.blacklist
            .iter()
            .filter(|(_, expiration)| **expiration > now)
            .map(|((h, peer_id), expiration)| BlacklistedConn {
                peer_id: *peer_id,
                info_hash: *h,
                remaining: expiration.saturating_duration_since(now),
            })
            .collect()
    }

    pub fn active_conns(&self) -> Vec<Arc<Connection>> {
        self.conns
            .values()
            .flat_map(|m| m.values())
            .filter_map(|slot| match slot {
                ConnSlot::Active(c) => Some(c.clone()),
                ConnSlot::Pending => None,
            })
            .collect()
    }

    pub fn num_active_conns(&self) -> usize {
        self.conns
            .values()
            .flat_map(|m| m.values())
            .filter(|slot| slot.is_active())
            .count()
    }

    pub fn num_conns(&self, h: InfoHash) -> usize {
        self.conns.get(&h).map(|m| m.len()).unwrap_or(0)
    }
}
