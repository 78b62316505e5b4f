use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, time::timeout};

use crate::{
    protocol::peer::PeerId,
    protocol::tracker::{parse_compact_peers, TrackerEvent, UdpRequest, UdpResponse, UdpResponseKind},
    store::Progress,
};

pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);
const UDP_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte counters reported to trackers
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadStat {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

impl DownloadStat {
    pub fn from_progress(progress: Progress, total_bytes: u64) -> Self {
        Self {
            downloaded: progress.completed_bytes,
            uploaded: 0,
            left: total_bytes - progress.completed_bytes,
        }
    }
}

/// Peer discovery seam the engine consumes. The tracker set implements it
/// in production, tests hand out fixed address lists.
pub trait Discovery: Send + 'static {
    fn discover(&mut self, stat: DownloadStat) -> impl Future<Output = DiscoveryOutcome> + Send;
}

#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    pub peers: Vec<SocketAddr>,
    /// Shortest re-announce interval the trackers asked for
    pub interval: Option<Duration>,
}

/// Fixed address list, mostly useful in tests and for `peer://` style runs
#[derive(Debug, Clone)]
pub struct StaticPeers {
    pub peers: Vec<SocketAddr>,
}

impl Discovery for StaticPeers {
    async fn discover(&mut self, _stat: DownloadStat) -> DiscoveryOutcome {
        DiscoveryOutcome {
            peers: self.peers.clone(),
            interval: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceResult {
    pub interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug)]
pub struct Tracker {
    url: Url,
    info_hash: [u8; 20],
    peer_id: PeerId,
    port: u16,
    /// `started` goes out once per tracker
    announced: bool,
}

impl Tracker {
    pub fn new(url: Url, info_hash: [u8; 20], peer_id: PeerId, port: u16) -> anyhow::Result<Self> {
        match url.scheme() {
            "http" | "https" | "udp" => {}
            rest => bail!("url scheme {rest} is not supported"),
        }
        Ok(Self {
            url,
            info_hash,
            peer_id,
            port,
            announced: false,
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_ref()
    }

    fn event(&self, stat: DownloadStat) -> TrackerEvent {
        if !self.announced {
            TrackerEvent::Started
        } else if stat.left == 0 {
            TrackerEvent::Completed
        } else {
            TrackerEvent::None
        }
    }

    pub async fn announce(&mut self, stat: DownloadStat) -> anyhow::Result<AnnounceResult> {
        let event = self.event(stat);
        let result = match self.url.scheme() {
            "http" | "https" => self.announce_http(stat, event).await,
            "udp" => self.announce_udp(stat, event).await,
            _ => unreachable!("scheme is checked on construction"),
        };
        if result.is_ok() {
            self.announced = true;
        }
        result
    }

    async fn announce_http(
        &self,
        stat: DownloadStat,
        event: TrackerEvent,
    ) -> anyhow::Result<AnnounceResult> {
        tracing::debug!("Announcing tracker {} via HTTP", self.url);
        let params = HttpAnnounceParams {
            port: self.port,
            uploaded: stat.uploaded,
            downloaded: stat.downloaded,
            left: stat.left,
            compact: 1,
            event: event.as_str(),
            numwant: Some(200),
        };
        // the raw 20 byte values cannot go through the form serializer
        let tracker_url = format!(
            "{}?{}&info_hash={}&peer_id={}",
            self.url,
            serde_urlencoded::to_string(&params)?,
            urlencode(&self.info_hash),
            urlencode(&self.peer_id.0),
        );
        let response = reqwest::get(tracker_url).await?;
        let announce_bytes = response.bytes().await?;
        let response: HttpAnnounceResponse = serde_bencode::from_bytes(&announce_bytes)?;
        if let Some(reason) = response.failure_reason {
            bail!("tracker failure: {reason}");
        }
        Ok(AnnounceResult {
            interval: response.interval.map(|secs| Duration::from_secs(secs as u64)),
            peers: response.peers(),
        })
    }

    async fn announce_udp(
        &self,
        stat: DownloadStat,
        event: TrackerEvent,
    ) -> anyhow::Result<AnnounceResult> {
        tracing::debug!("Announcing tracker {} via UDP", self.url);
        let addrs = self.url.socket_addrs(|| None)?;
        let addr = addrs.first().context("tracker host resolved to no address")?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        let connect_response = self.exchange(&socket, UdpRequest::Connect).await?;
        let UdpResponseKind::Connect { connection_id } = connect_response else {
            bail!("expected connect response, got {connect_response:?}");
        };

        let announce = UdpRequest::Announce {
            connection_id,
            info_hash: self.info_hash,
            peer_id: self.peer_id.0,
            downloaded: stat.downloaded,
            left: stat.left,
            uploaded: stat.uploaded,
            event,
            key: rand::random(),
            num_want: -1,
            port: self.port,
        };
        match self.exchange(&socket, announce).await? {
            UdpResponseKind::Announce { interval, peers, .. } => Ok(AnnounceResult {
                interval: Some(Duration::from_secs(interval as u64)),
                peers,
            }),
            UdpResponseKind::Error { message } => Err(anyhow!("tracker error: {message}")),
            other => Err(anyhow!("expected announce response, got {other:?}")),
        }
    }

    async fn exchange(
        &self,
        socket: &UdpSocket,
        request: UdpRequest,
    ) -> anyhow::Result<UdpResponseKind> {
        let transaction_id: u32 = rand::random();
        socket.send(&request.as_bytes(transaction_id)).await?;
        let mut buffer = [0_u8; 1024 * 4];
        let read = timeout(UDP_STEP_TIMEOUT, socket.recv(&mut buffer))
            .await
            .context("udp tracker timed out")??;
        let response = UdpResponse::from_bytes(&buffer[..read])?;
        if response.transaction_id != transaction_id {
            bail!(
                "transaction id mismatch: sent {transaction_id}, got {}",
                response.transaction_id
            );
        }
        Ok(response.kind)
    }
}

/// All trackers of a torrent, announced in turn
#[derive(Debug)]
pub struct TrackerSet {
    trackers: Vec<Tracker>,
}

impl TrackerSet {
    pub fn new(urls: Vec<Url>, info_hash: [u8; 20], peer_id: PeerId, port: u16) -> Self {
        let trackers = urls
            .into_iter()
            .filter_map(|url| match Tracker::new(url, info_hash, peer_id, port) {
                Ok(tracker) => Some(tracker),
                Err(e) => {
                    tracing::warn!("Skipping tracker: {e}");
                    None
                }
            })
            .collect();
        Self { trackers }
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

impl Discovery for TrackerSet {
    async fn discover(&mut self, stat: DownloadStat) -> DiscoveryOutcome {
        let mut outcome = DiscoveryOutcome::default();
        for tracker in &mut self.trackers {
            match timeout(ANNOUNCE_TIMEOUT, tracker.announce(stat)).await {
                Ok(Ok(result)) => {
                    tracing::debug!(
                        url = tracker.url(),
                        peers = result.peers.len(),
                        "Tracker announce succeeded"
                    );
                    outcome.peers.extend(result.peers);
                    outcome.interval = match (outcome.interval, result.interval) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
                Ok(Err(e)) => tracing::warn!(url = tracker.url(), "Announce failed: {e:#}"),
                Err(_) => tracing::warn!(url = tracker.url(), "Announce timed out"),
            }
        }
        outcome
    }
}

fn urlencode(bytes: &[u8; 20]) -> String {
    let mut encoded = String::with_capacity(3 * bytes.len());
    for byte in bytes {
        encoded.push('%');
        encoded.push_str(&hex::encode([*byte]));
    }
    encoded
}

#[derive(Serialize, Debug, Clone)]
struct HttpAnnounceParams {
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    numwant: Option<u32>,
}

#[derive(Deserialize, Debug, Clone)]
struct HttpAnnounceFullPeer {
    ip: String,
    port: u16,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum HttpPeerList {
    Full(Vec<HttpAnnounceFullPeer>),
    Compact(bytes::Bytes),
}

#[derive(Deserialize, Debug, Clone)]
struct HttpAnnounceResponse {
    interval: Option<u32>,
    peers: Option<HttpPeerList>,
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
}

impl HttpAnnounceResponse {
    pub fn peers(&self) -> Vec<SocketAddr> {
        match &self.peers {
            Some(HttpPeerList::Full(peers)) => peers
                .iter()
                .filter_map(|peer| {
                    let ip = IpAddr::from_str(&peer.ip).ok()?;
                    Some(SocketAddr::new(ip, peer.port))
                })
                .collect(),
            Some(HttpPeerList::Compact(bytes)) => parse_compact_peers(bytes),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{urlencode, HttpAnnounceResponse};

    #[test]
    fn compact_http_peer_list() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers12:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1a, 0xe2]);
        body.extend_from_slice(b"e");
        let response: HttpAnnounceResponse = serde_bencode::from_bytes(&body).unwrap();
        assert_eq!(response.interval, Some(1800));
        let peers = response.peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1], "10.0.0.2:6882".parse().unwrap());
    }

    #[test]
    fn dictionary_http_peer_list() {
        let body =
            b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eed2:ip8:10.0.0.24:porti6882eeee";
        let response: HttpAnnounceResponse = serde_bencode::from_bytes(body).unwrap();
        assert_eq!(response.interval, Some(900));
        let peers = response.peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1], "10.0.0.2:6882".parse().unwrap());
    }

    #[test]
    fn tracker_failure_is_reported() {
        let body = b"d14:failure reason9:not founde";
        let response: HttpAnnounceResponse = serde_bencode::from_bytes(body).unwrap();
        assert_eq!(response.failure_reason.as_deref(), Some("not found"));
    }

    #[test]
    fn info_hash_is_percent_encoded_per_byte() {
        let hash = [0xab_u8; 20];
        let encoded = urlencode(&hash);
        assert_eq!(encoded.len(), 60);
        assert!(encoded.starts_with("%ab%ab"));
    }
}
