use std::{env, process, sync::Arc};
use swarm::{
    ApiVersion, Config, HttpAnnounceClient, MemoryTorrentArchive, Scheduler, TorrentMeta,
};

const DEFAULT_TRACKER: &str = "localhost:7602";
const DEFAULT_PIECE_LENGTH: u64 = 4 * 1024 * 1024;

// Runs a standalone peer: `swarm [tracker-host:port] [blob-file...]`.
// Named files are seeded into the swarm; the peer then serves until
// interrupted.
#[tokio::main]
async fn main() {

    // Set up logging.
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let mut args = env::args().skip(1);
    let tracker = args.next().unwrap_or_else(|| DEFAULT_TRACKER.to_owned());

    let archive = Arc::new(MemoryTorrentArchive::new());
    let client = Arc::new(HttpAnnounceClient::new(vec![tracker], ApiVersion::V2));

    let scheduler = match Scheduler::start(Config::default(), archive.clone(), client).await {
        Ok(scheduler) => scheduler,
        Err(e) => {
            tracing::error!("failed to start scheduler: {}", e);
            process::exit(1);
        },
    };
    tracing::info!("peer {} listening on {}", scheduler.peer_id().await, scheduler.listen_addr().await);

    for path in args {
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!("cannot read {}: {}", path, e);
                continue;
            },
        };
        let meta = TorrentMeta::from_content(&content, DEFAULT_PIECE_LENGTH);
        let digest = meta.digest;
        if let Err(e) = archive.seed(meta, &content) {
            tracing::error!("cannot seed {}: {}", path, e);
            continue;
        }
        // Registers the blob with the scheduler and announces it.
        match scheduler.download("", digest).await {
            Ok(()) => tracing::info!("seeding {} as {}", path, digest),
            Err(e) => tracing::error!("cannot register {}: {}", path, e),
        }
    }

    tokio::signal::ctrl_c().await.ok();
    scheduler.stop().await;
}
