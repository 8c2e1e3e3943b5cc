use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};
use sha1::{Digest as Sha1Digest, Sha1};
use crate::{Bitfield, Digest, InfoHash};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {

    #[error("torrent not found")]
    TorrentNotFound,

    #[error("piece {0} out of range")]
    PieceOutOfRange(usize),

    #[error("piece {0} already complete")]
    PieceAlreadyComplete(usize),

    #[error("piece {0} not yet downloaded")]
    PieceMissing(usize),

    #[error("piece {idx}: expected {expected} bytes, got {actual}")]
    PieceSizeMismatch {
        idx: usize,
        expected: u64,
        actual: u64,
    },

    #[error("piece {0} failed hash verification")]
    PieceHashMismatch(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

}

// Summary of a stored torrent, cheap enough to hand to handshake replies.
#[derive(Debug, Clone)]
pub struct TorrentStat {

    pub name: String,

    pub digest: Digest,

    pub info_hash: InfoHash,

    pub bitfield: Bitfield,

}

// Typed piece I/O over one stored blob. Implementations verify piece hashes
// on write and are safe to share across tasks.
pub trait Torrent: Send + Sync {

    fn name(&self) -> String;

    fn digest(&self) -> Digest;

    fn info_hash(&self) -> InfoHash;

    fn length(&self) -> u64;

    fn num_pieces(&self) -> usize;

    fn piece_length(&self, idx: usize) -> u64;

    fn max_piece_length(&self) -> u64;

    // Snapshot of the completion state.
    fn bitfield(&self) -> Bitfield;

    fn has_piece(&self, idx: usize) -> bool;

    fn complete(&self) -> bool;

    fn write_piece(&self, idx: usize, data: &[u8]) -> Result<()>;

    fn read_piece(&self, idx: usize) -> Result<Vec<u8>>;

}

// The blob store the scheduler runs against.
pub trait TorrentArchive: Send + Sync {

    // Opens the torrent for the digest, allocating empty piece storage if
    // this peer has none of it yet.
    fn create_torrent(&self, namespace: &str, digest: Digest) -> Result<Arc<dyn Torrent>>;

    fn get_torrent(&self, namespace: &str, digest: Digest) -> Result<Arc<dyn Torrent>>;

    fn stat(&self, namespace: &str, digest: Digest) -> Result<TorrentStat>;

    fn delete_torrent(&self, digest: Digest) -> Result<()>;

}

// Immutable description of a blob's torrent layout. The torrent's name is
// the blob digest rendered as hex, which is what travels in handshakes and
// tracker announces.
#[derive(Debug, Clone)]
pub struct TorrentMeta {

    pub name: String,

    pub digest: Digest,

    pub piece_length: u64,

    pub total_length: u64,

    pub piece_hashes: Vec<[u8; 20]>,

}

impl TorrentMeta {

    // Builds the full metainfo for a blob, hashing each piece.
    pub fn from_content(content: &[u8], piece_length: u64) -> Self {
        assert!(piece_length > 0, "piece length must be positive");
        let piece_hashes = content
            .chunks(piece_length as usize)
            .map(|chunk| {
                let mut hasher = Sha1::new();
                hasher.update(chunk);
                hasher.finalize().into()
            })
            .collect();
        let mut hasher = Sha1::new();
        hasher.update(content);
        let digest = Digest(hasher.finalize().into());

        Self {
            name: digest.hex(),
            digest,
            piece_length,
            total_length: content.len() as u64,
            piece_hashes,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    // Pieces are uniform except the trailing one.
    pub fn piece_length(&self, idx: usize) -> u64 {
        if idx + 1 == self.num_pieces() {
            self.total_length - self.piece_length * (self.num_pieces() as u64 - 1)
        } else {
            self.piece_length
        }
    }

    // Hash of the info layout, identifying the torrent on the wire.
    pub fn info_hash(&self) -> InfoHash {
        let mut hasher = Sha1::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.digest.as_bytes());
        hasher.update(self.piece_length.to_be_bytes());
        hasher.update(self.total_length.to_be_bytes());
        for hash in &self.piece_hashes {
            hasher.update(hash);
        }
        InfoHash(hasher.finalize().into())
    }
}

// In-memory archive. Backs tests and local single-process runs; durable
// stores implement the same traits elsewhere.
pub struct MemoryTorrentArchive {

    // Metainfo this peer can host, keyed by digest.
    metainfo: Mutex<HashMap<Digest, TorrentMeta>>,

    torrents: Mutex<HashMap<Digest, Arc<MemoryTorrent>>>,

}

impl MemoryTorrentArchive {

    pub fn new() -> Self {
        Self {
            metainfo: Mutex::new(HashMap::new()),
            torrents: Mutex::new(HashMap::new()),
        }
    }

    // Makes the blob's layout known to this archive. A torrent for it can
    // then be created with empty storage.
    pub fn register(&self, meta: TorrentMeta) {
        self.metainfo.lock().unwrap().insert(meta.digest, meta);
    }

    // Registers and fully populates a blob, as an origin would.
    pub fn seed(&self, meta: TorrentMeta, content: &[u8]) -> Result<Arc<dyn Torrent>> {
        self.register(meta.clone());
        let torrent = self.open(meta)?;
        for idx in 0..torrent.num_pieces() {
            let start = idx as u64 * torrent.meta.piece_length;
            let end = start + torrent.piece_length(idx);
            torrent.write_piece(idx, &content[start as usize..end as usize])?;
        }
        Ok(torrent)
    }

    fn open(&self, meta: TorrentMeta) -> Result<Arc<MemoryTorrent>> {
        let mut torrents = self.torrents.lock().unwrap();
        let torrent = torrents
            .entry(meta.digest)
            .or_insert_with(|| Arc::new(MemoryTorrent::new(meta)));
        Ok(torrent.clone())
    }
}

impl Default for MemoryTorrentArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl TorrentArchive for MemoryTorrentArchive {

    fn create_torrent(&self, _namespace: &str, digest: Digest) -> Result<Arc<dyn Torrent>> {
        let meta = self
            .metainfo
            .lock()
            .unwrap()
            .get(&digest)
            .cloned()
            .ok_or(StorageError::TorrentNotFound)?;
        Ok(self.open(meta)?)
    }

    fn get_torrent(&self, _namespace: &str, digest: Digest) -> Result<Arc<dyn Torrent>> {
        self.torrents
            .lock()
            .unwrap()
            .get(&digest)
            .cloned()
            .map(|t| t as Arc<dyn Torrent>)
            .ok_or(StorageError::TorrentNotFound)
    }

    fn stat(&self, namespace: &str, digest: Digest) -> Result<TorrentStat> {
        let torrent = self.get_torrent(namespace, digest)?;
        Ok(TorrentStat {
            name: torrent.name(),
            digest: torrent.digest(),
            info_hash: torrent.info_hash(),
            bitfield: torrent.bitfield(),
        })
    }

    fn delete_torrent(&self, digest: Digest) -> Result<()> {
        self.torrents.lock().unwrap().remove(&digest);
        Ok(())
    }
}

pub struct MemoryTorrent {

    meta: TorrentMeta,

    info_hash: InfoHash,

    pieces: RwLock<PieceStore>,

}

struct PieceStore {

    data: Vec<Option<Vec<u8>>>,

    bitfield: Bitfield,

}

impl MemoryTorrent {
    fn new(meta: TorrentMeta) -> Self {
        let num_pieces = meta.num_pieces();
        let info_hash = meta.info_hash();
        Self {
            meta,
            info_hash,
            pieces: RwLock::new(PieceStore {
                data: vec![None; num_pieces],
                bitfield: Bitfield::new(num_pieces),
            }),
        }
    }
}

impl Torrent for MemoryTorrent {

    fn name(&self) -> String {
        self.meta.name.clone()
    }

    fn digest(&self) -> Digest {
        self.meta.digest
    }

    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn length(&self) -> u64 {
        self.meta.total_length
    }

    fn num_pieces(&self) -> usize {
        self.meta.num_pieces()
    }

    fn piece_length(&self, idx: usize) -> u64 {
        self.meta.piece_length(idx)
    }

    fn max_piece_length(&self) -> u64 {
        self.meta.piece_length
    }

    fn bitfield(&self) -> Bitfield {
        self.pieces.read().unwrap().bitfield.clone()
    }

    fn has_piece(&self, idx: usize) -> bool {
        self.pieces.read().unwrap().bitfield.has(idx)
    }

    fn complete(&self) -> bool {
        self.pieces.read().unwrap().bitfield.complete()
    }

    fn write_piece(&self, idx: usize, data: &[u8]) -> Result<()> {
        if idx >= self.num_pieces() {
            return Err(StorageError::PieceOutOfRange(idx));
        }
        let expected = self.piece_length(idx);
        if data.len() as u64 != expected {
            return Err(StorageError::PieceSizeMismatch {
                idx,
                expected,
                actual: data.len() as u64,
            });
        }

        let mut hasher = Sha1::new();
        hasher.update(data);
        let hash: [u8; 20] = hasher.finalize().into();
        if hash != self.meta.piece_hashes[idx] {
            return Err(StorageError::PieceHashMismatch(idx));
        }

        let mut pieces = self.pieces.write().unwrap();
        if pieces.bitfield.has(idx) {
            return Err(StorageError::PieceAlreadyComplete(idx));
        }
        pieces.data[idx] = Some(data.to_vec());
        pieces.bitfield.set(idx, true);
        Ok(())
    }

    fn read_piece(&self, idx: usize) -> Result<Vec<u8>> {
        if idx >= self.num_pieces() {
            return Err(StorageError::PieceOutOfRange(idx));
        }
        self.pieces
            .read()
            .unwrap()
            .data[idx]
            .clone()
            .ok_or(StorageError::PieceMissing(idx))
    }
}
