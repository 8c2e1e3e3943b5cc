use std::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use url::Url;
use crate::{InfoHash, PeerId};

pub type Result<T> = std::result::Result<T, TrackerError>;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("tracker returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("no tracker hosts configured")]
    NoHosts,

    #[error("all tracker hosts failed, last error: {0}")]
    AllHostsFailed(String),

}

// One peer as the tracker describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {

    pub peer_id: PeerId,

    pub ip: String,

    pub port: u16,

    // Origins seed permanently and never announce for themselves.
    #[serde(default)]
    pub origin: bool,

    #[serde(default)]
    pub complete: bool,

}

impl PeerInfo {
    pub fn addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.ip, self.port).parse().ok()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnounceRequest {

    // The blob digest in hex.
    pub name: String,

    pub info_hash: InfoHash,

    // Ourselves, as we want the tracker to hand us out.
    pub peer: PeerInfo,

}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnounceResponse {

    #[serde(default)]
    pub peers: Vec<PeerInfo>,

    // Seconds until the tracker wants the next announce.
    pub interval: Option<u64>,

}

// The announce surface the scheduler depends on. Swapped for an in-process
// double in tests.
#[async_trait]
pub trait AnnounceClient: Send + Sync {

    async fn announce(&self, req: AnnounceRequest) -> Result<AnnounceResponse>;

}

// Which announce endpoint generation the tracker speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {

    // GET /announce with query parameters.
    V1,

    // POST /announce/{infohash} with a JSON body.
    V2,

}

// HTTP announce client balancing over a set of tracker hosts. Hosts are
// tried in rotation; the next request starts from a different host so load
// and failures spread.
pub struct HttpAnnounceClient {

    client: reqwest::Client,

    hosts: Vec<Url>,

    version: ApiVersion,

    cursor: AtomicUsize,

}

impl HttpAnnounceClient {

    // Hosts are `host:port` pairs; anything unparseable is dropped up front.
    pub fn new(hosts: Vec<String>, version: ApiVersion) -> Self {
        let hosts = hosts
            .into_iter()
            .filter_map(|host| match Url::parse(&format!("http://{}", host)) {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::warn!("ignoring invalid tracker host {}: {}", host, e);
                    None
                },
            })
            .collect();

        Self {
            client: reqwest::Client::builder()
                .timeout(ANNOUNCE_TIMEOUT)
                .build()
                .unwrap_or_default(),
            hosts,
            version,
            cursor: AtomicUsize::new(0),
        }
    }

    async fn announce_to(&self, host: &Url, req: &AnnounceRequest) -> Result<AnnounceResponse> {

        let response = match self.version {

            ApiVersion::V1 => {
                let url = format!(
                    "{}announce?name={}&info_hash={}&peer_id={}&ip={}&port={}&origin={}&complete={}",
                    host,
                    req.name,
                    urlencoding::encode_binary(req.info_hash.as_bytes()),
                    urlencoding::encode_binary(req.peer.peer_id.as_bytes()),
                    req.peer.ip,
                    req.peer.port,
                    req.peer.origin,
                    req.peer.complete,
                );
                self.client.get(url).send().await?
            },

            ApiVersion::V2 => {
                let url = format!("{}announce/{}", host, req.info_hash);
                self.client.post(url).json(req).send().await?
            },
        };

        if !response.status().is_success() {
            return Err(TrackerError::Status(response.status()));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl AnnounceClient for HttpAnnounceClient {

    async fn announce(&self, req: AnnounceRequest) -> Result<AnnounceResponse> {

        if self.hosts.is_empty() {
            return Err(TrackerError::NoHosts);
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        let mut last_error = String::new();
        for attempt in 0..self.hosts.len() {
            let host = &self.hosts[(start + attempt) % self.hosts.len()];
            match self.announce_to(host, &req).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!("announce to {} failed: {}", host, e);
                    last_error = e.to_string();
                },
            }
        }
        Err(TrackerError::AllHostsFailed(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Digest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    // Minimal single-request HTTP double; returns the raw request head and
    // body to the test through a channel.
    async fn serve_json_once(
        listener: TcpListener,
        body: String,
        seen_tx: mpsc::UnboundedSender<String>,
    ) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text
                    .lines()
                    .find_map(|line| {
                        let (key, value) = line.split_once(':')?;
                        key.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if raw.len() >= head_end + 4 + content_length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        seen_tx.send(String::from_utf8_lossy(&raw).into_owned()).unwrap();

        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body,
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
    }

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            name: Digest([7; 20]).hex(),
            info_hash: InfoHash([9; 20]),
            peer: PeerInfo {
                peer_id: PeerId([1; 20]),
                ip: "127.0.0.1".into(),
                port: 7001,
                origin: false,
                complete: true,
            },
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_v1_announce() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let host = listener.local_addr()?.to_string();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let response = serde_json::json!({
            "peers": [
                {"peer_id": PeerId([2; 20]).hex(), "ip": "10.0.0.2", "port": 7002, "origin": true, "complete": true},
            ],
            "interval": 30,
        });
        let server = tokio::spawn(serve_json_once(listener, response.to_string(), seen_tx));

        let client = HttpAnnounceClient::new(vec![host], ApiVersion::V1);
        let resp = client.announce(request()).await?;
        server.await?;

        assert_eq!(resp.interval, Some(30));
        assert_eq!(resp.peers.len(), 1);
        assert_eq!(resp.peers[0].peer_id, PeerId([2; 20]));
        assert!(resp.peers[0].origin);

        let seen = seen_rx.recv().await.unwrap();
        assert!(seen.starts_with("GET /announce?"));
        assert!(seen.contains(&format!("name={}", Digest([7; 20]).hex())));
        assert!(seen.contains("port=7001"));
        assert!(seen.contains("complete=true"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_v2_announce_posts_json() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let host = listener.local_addr()?.to_string();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let response = serde_json::json!({ "peers": [], "interval": null });
        let server = tokio::spawn(serve_json_once(listener, response.to_string(), seen_tx));

        let client = HttpAnnounceClient::new(vec![host], ApiVersion::V2);
        let resp = client.announce(request()).await?;
        server.await?;

        assert!(resp.peers.is_empty());
        assert_eq!(resp.interval, None);

        let seen = seen_rx.recv().await.unwrap();
        assert!(seen.starts_with(&format!("POST /announce/{} ", InfoHash([9; 20]))));
        // The JSON body carries our peer record.
        let body = seen.split("\r\n\r\n").nth(1).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(body)?;
        assert_eq!(parsed["peer"]["port"], 7001);
        assert_eq!(parsed["info_hash"], serde_json::json!(InfoHash([9; 20]).hex()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failover_to_healthy_host() -> anyhow::Result<()> {
        // A listener that is bound then dropped gives a dead host.
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.to_string()
        };
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let live = listener.local_addr()?.to_string();
        let (seen_tx, _seen_rx) = mpsc::unbounded_channel();

        let response = serde_json::json!({ "peers": [], "interval": 10 });
        let server = tokio::spawn(serve_json_once(listener, response.to_string(), seen_tx));

        let client = HttpAnnounceClient::new(vec![dead, live], ApiVersion::V2);
        // Regardless of which host rotation starts at, the live one answers.
        let resp = client.announce(request()).await?;
        let _ = client.announce(request()).await;
        server.await.ok();
        assert_eq!(resp.interval, Some(10));
        Ok(())
    }
}
