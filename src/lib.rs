use std::time::Duration;

mod bitfield;
mod download;
mod peer_pool;
mod peers;
mod progress;
mod protocol;
mod scheduler;
mod storage;
mod store;
mod tracker;

pub use bitfield::BitField;
pub use download::Download;
pub use download::DownloadHandle;
pub use progress::DownloadProgress;
pub use progress::ProgressConsumer;
pub use protocol::peer::PeerId;
pub use protocol::Info;
pub use protocol::OutputFile;
pub use protocol::TorrentFile;
pub use store::Progress;
pub use tracker::Discovery;
pub use tracker::DiscoveryOutcome;
pub use tracker::DownloadStat;
pub use tracker::StaticPeers;
pub use tracker::TrackerSet;

/// Engine tuning knobs. The defaults are sane for real swarms; tests dial
/// the timeouts down.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cap on concurrent live sessions
    pub max_peers: usize,
    /// Concurrent piece leases per peer
    pub pieces_per_peer: usize,
    /// Outstanding block requests per lease
    pub blocks_per_piece: usize,
    /// Deadline for one request batch
    pub block_timeout: Duration,
    /// Cooling off period after a failed address
    pub backoff: Duration,
    /// Discovery cadence, overridden by tracker supplied intervals
    pub tracker_interval: Duration,
    /// Covers TCP dial plus the handshake exchange
    pub connect_timeout: Duration,
    /// Port advertised in tracker announces
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peers: 120,
            pieces_per_peer: 8,
            blocks_per_piece: 64,
            block_timeout: Duration::from_secs(30),
            backoff: Duration::from_secs(60),
            tracker_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            port: 6881,
        }
    }
}
