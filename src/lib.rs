#![allow(dead_code)]

mod announce;
mod bitfield;
mod config;
mod conn;
mod dispatch;
mod scheduler;
mod storage;
mod tracker;

#[cfg(test)]
mod testutil;

pub use bitfield::Bitfield;
pub use config::Config;
pub use conn::BlacklistedConn;
pub use scheduler::{Scheduler, SchedulerError};
pub use storage::{
    MemoryTorrentArchive, StorageError, Torrent, TorrentArchive, TorrentMeta, TorrentStat,
};
pub use tracker::{
    AnnounceClient, AnnounceRequest, AnnounceResponse, ApiVersion, HttpAnnounceClient, PeerInfo,
    TrackerError,
};

// Identifiers are all 20 raw bytes, rendered as hex in logs.
macro_rules! id_type {
    ($name:ident) => {

        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; 20]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 20] {
                &self.0
            }

            pub fn hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                let bytes = hex::decode(s).ok()?;
                let bytes: [u8; 20] = bytes.try_into().ok()?;
                Some(Self(bytes))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl From<[u8; 20]> for $name {
            fn from(bytes: [u8; 20]) -> Self {
                Self(bytes)
            }
        }

        // On the tracker wire these are hex strings.
        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.hex())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                Self::from_hex(&s)
                    .ok_or_else(|| serde::de::Error::custom("expected 40 hex characters"))
            }
        }
    };
}

// Identity of a peer process, chosen at startup.
id_type!(PeerId);
// Hash of a torrent's info dictionary.
id_type!(InfoHash);
// Content hash of the blob a torrent carries.
id_type!(Digest);

impl PeerId {
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }
}
