use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct Config {

    // Address on which the scheduler listens for incoming peers.
    pub listen_addr: SocketAddr,

    // Baseline tracker announce interval, used until the tracker supplies one.
    pub announce_interval: Duration,

    // Ceiling on any tracker-supplied announce interval.
    pub max_announce_interval: Duration,

    // Idle time after which a complete torrent is torn down.
    pub seeder_tti: Duration,

    // Idle time after which an incomplete torrent is torn down.
    pub leecher_tti: Duration,

    // Idle time after which a connection with no transfer progress is closed.
    pub conn_tti: Duration,

    // Hard lifetime cap on any connection.
    pub conn_ttl: Duration,

    pub preemption_interval: Duration,

    pub emit_stats_interval: Duration,

    // Pending + active connections per torrent never exceed this.
    pub max_open_connections_per_torrent: usize,

    // Cap on handed-out peers we already have pending or active connections to.
    pub max_mutual_connections: usize,

    pub blacklist_duration: Duration,

    // Egress budget shared across all active connections.
    pub max_global_egress_bytes_per_sec: u64,

    // Floor for any single connection's egress rate.
    pub min_conn_egress_bytes_per_sec: u64,

    pub piece_request_min_timeout: Duration,

    // Scales the piece request timeout with piece size.
    pub piece_request_timeout_per_mb: Duration,

    // Max outstanding piece requests per peer.
    pub pipeline_limit: usize,

    pub handshake_timeout: Duration,

    pub disable_blacklist: bool,

    pub disable_preemption: bool,

    pub disable_throttling: bool,

    // Origin peers serve but never announce.
    pub disable_announcing: bool,

    // Capacity of the event loop channel.
    pub event_buffer: usize,

    // How long probe() waits for the event loop to accept an event.
    pub probe_timeout: Duration,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            announce_interval: Duration::from_secs(5),
            max_announce_interval: Duration::from_secs(60),
            seeder_tti: Duration::from_secs(5 * 60),
            leecher_tti: Duration::from_secs(15 * 60),
            conn_tti: Duration::from_secs(10 * 60),
            conn_ttl: Duration::from_secs(60 * 60),
            preemption_interval: Duration::from_secs(30),
            emit_stats_interval: Duration::from_secs(10),
            max_open_connections_per_torrent: 10,
            max_mutual_connections: 5,
            blacklist_duration: Duration::from_secs(30),
            max_global_egress_bytes_per_sec: 200 * 1024 * 1024,
            min_conn_egress_bytes_per_sec: 2 * 1024 * 1024,
            piece_request_min_timeout: Duration::from_secs(4),
            piece_request_timeout_per_mb: Duration::from_secs(4),
            pipeline_limit: 3,
            handshake_timeout: Duration::from_secs(5),
            disable_blacklist: false,
            disable_preemption: false,
            disable_throttling: false,
            disable_announcing: false,
            event_buffer: 512,
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl Config {

    // Piece request timeout grows with the torrent's piece size.
    pub fn piece_request_timeout(&self, max_piece_length: u64) -> Duration {
        let per_mb = self.piece_request_timeout_per_mb.as_secs_f64();
        let mbs = max_piece_length as f64 / (1024.0 * 1024.0);
        let scaled = Duration::from_secs_f64((per_mb * mbs).ceil());
        scaled.max(self.piece_request_min_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_request_timeout_small_pieces_hit_floor() {
        let config = Config::default();
        // 256 KiB pieces scale to 1s, below the 4s floor.
        assert_eq!(config.piece_request_timeout(256 * 1024), Duration::from_secs(4));
    }

    #[test]
    fn test_piece_request_timeout_scales_with_piece_size() {
        let config = Config::default();
        // 4 MiB pieces at 4s/MiB.
        assert_eq!(config.piece_request_timeout(4 * 1024 * 1024), Duration::from_secs(16));
        // Partial MiBs round up.
        assert_eq!(config.piece_request_timeout(1024 * 1024 + 1), Duration::from_secs(5));
    }
}
