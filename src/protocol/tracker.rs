use std::{
    io::{Cursor, Read, Write},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use anyhow::Context;
use bytes::Bytes;

/// BEP 15 connect magic
const PROTOCOL_ID: u64 = 0x41727101980;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    None,
    Completed,
    Started,
    Stopped,
}

impl TrackerEvent {
    pub fn as_u32(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }

    /// Form value for HTTP announces; `None` sends no event parameter
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            TrackerEvent::None => None,
            TrackerEvent::Completed => Some("completed"),
            TrackerEvent::Started => Some("started"),
            TrackerEvent::Stopped => Some("stopped"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum UdpRequest {
    Connect,
    Announce {
        /// Valid for a couple of minutes after the connect step
        connection_id: u64,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        downloaded: u64,
        left: u64,
        uploaded: u64,
        event: TrackerEvent,
        key: u32,
        /// -1 lets the tracker decide how many peers to return
        num_want: i32,
        port: u16,
    },
}

impl UdpRequest {
    pub fn as_bytes(&self, transaction_id: u32) -> Bytes {
        match self {
            UdpRequest::Connect => {
                let mut buffer = Cursor::new([0_u8; 16]);
                buffer.write_all(&PROTOCOL_ID.to_be_bytes()).unwrap();
                buffer.write_all(&0_u32.to_be_bytes()).unwrap();
                buffer.write_all(&transaction_id.to_be_bytes()).unwrap();
                Bytes::copy_from_slice(&buffer.into_inner())
            }
            UdpRequest::Announce {
                connection_id,
                info_hash,
                peer_id,
                downloaded,
                left,
                uploaded,
                event,
                key,
                num_want,
                port,
            } => {
                let mut writer = Cursor::new([0_u8; 98]);
                writer.write_all(&connection_id.to_be_bytes()).unwrap();
                writer.write_all(&1_u32.to_be_bytes()).unwrap();
                writer.write_all(&transaction_id.to_be_bytes()).unwrap();
                writer.write_all(info_hash).unwrap();
                writer.write_all(peer_id).unwrap();
                writer.write_all(&downloaded.to_be_bytes()).unwrap();
                writer.write_all(&left.to_be_bytes()).unwrap();
                writer.write_all(&uploaded.to_be_bytes()).unwrap();
                writer.write_all(&event.as_u32().to_be_bytes()).unwrap();
                writer.write_all(&0_u32.to_be_bytes()).unwrap();
                writer.write_all(&key.to_be_bytes()).unwrap();
                writer.write_all(&num_want.to_be_bytes()).unwrap();
                writer.write_all(&port.to_be_bytes()).unwrap();
                Bytes::copy_from_slice(&writer.into_inner())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct UdpResponse {
    pub transaction_id: u32,
    pub kind: UdpResponseKind,
}

#[derive(Debug, Clone)]
pub enum UdpResponseKind {
    Connect {
        connection_id: u64,
    },
    Announce {
        interval: u32,
        leechers: u32,
        seeders: u32,
        peers: Vec<SocketAddr>,
    },
    Error {
        message: String,
    },
}

fn read_u32(reader: &mut impl Read) -> Option<u32> {
    let mut buf = [0; 4];
    reader.read_exact(&mut buf).ok()?;
    Some(u32::from_be_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Option<u64> {
    let mut buf = [0; 8];
    reader.read_exact(&mut buf).ok()?;
    Some(u64::from_be_bytes(buf))
}

impl UdpResponse {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let action = read_u32(&mut cursor).context("read action")?;
        let transaction_id = read_u32(&mut cursor).context("read transaction id")?;

        let kind = match action {
            0 => {
                let connection_id = read_u64(&mut cursor).context("read connection id")?;
                UdpResponseKind::Connect { connection_id }
            }
            1 => {
                let interval = read_u32(&mut cursor).context("read interval")?;
                let leechers = read_u32(&mut cursor).context("read leechers")?;
                let seeders = read_u32(&mut cursor).context("read seeders")?;
                let rest = &bytes[cursor.position() as usize..];
                let peers = parse_compact_peers(rest);
                UdpResponseKind::Announce {
                    interval,
                    leechers,
                    seeders,
                    peers,
                }
            }
            3 => {
                let mut message = Vec::new();
                cursor.read_to_end(&mut message).ok();
                UdpResponseKind::Error {
                    message: String::from_utf8_lossy(&message).into_owned(),
                }
            }
            rest => return Err(anyhow::anyhow!("action {rest} is not recognized")),
        };
        Ok(UdpResponse {
            transaction_id,
            kind,
        })
    }
}

/// 6 bytes per peer: IPv4 and big endian port
pub fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::from(u32::from_be_bytes(chunk[0..4].try_into().unwrap()));
            let port = u16::from_be_bytes(chunk[4..6].try_into().unwrap());
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{parse_compact_peers, TrackerEvent, UdpRequest, UdpResponse, UdpResponseKind};

    #[test]
    fn connect_request_layout() {
        let bytes = UdpRequest::Connect.as_bytes(0xdead_beef);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..8], 0x41727101980_u64.to_be_bytes());
        assert_eq!(&bytes[8..12], 0_u32.to_be_bytes());
        assert_eq!(&bytes[12..], 0xdead_beef_u32.to_be_bytes());
    }

    #[test]
    fn announce_request_layout() {
        let request = UdpRequest::Announce {
            connection_id: 7,
            info_hash: [1; 20],
            peer_id: [2; 20],
            downloaded: 100,
            left: 200,
            uploaded: 50,
            event: TrackerEvent::Started,
            key: 9,
            num_want: -1,
            port: 6881,
        };
        let bytes = request.as_bytes(42);
        assert_eq!(bytes.len(), 98);
        assert_eq!(&bytes[..8], 7_u64.to_be_bytes());
        assert_eq!(&bytes[8..12], 1_u32.to_be_bytes());
        assert_eq!(&bytes[12..16], 42_u32.to_be_bytes());
        assert_eq!(&bytes[16..36], [1; 20]);
        assert_eq!(&bytes[36..56], [2; 20]);
        assert_eq!(&bytes[80..84], 2_u32.to_be_bytes());
        assert_eq!(&bytes[96..], 6881_u16.to_be_bytes());
    }

    #[test]
    fn parse_announce_response() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1_u32.to_be_bytes());
        bytes.extend_from_slice(&42_u32.to_be_bytes());
        bytes.extend_from_slice(&1800_u32.to_be_bytes());
        bytes.extend_from_slice(&3_u32.to_be_bytes());
        bytes.extend_from_slice(&5_u32.to_be_bytes());
        bytes.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        bytes.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0xe2]);

        let response = UdpResponse::from_bytes(&bytes).unwrap();
        assert_eq!(response.transaction_id, 42);
        let UdpResponseKind::Announce {
            interval,
            leechers,
            seeders,
            peers,
        } = response.kind
        else {
            panic!("expected announce response");
        };
        assert_eq!(interval, 1800);
        assert_eq!(leechers, 3);
        assert_eq!(seeders, 5);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1], "10.0.0.2:6882".parse().unwrap());
    }

    #[test]
    fn parse_error_response() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3_u32.to_be_bytes());
        bytes.extend_from_slice(&42_u32.to_be_bytes());
        bytes.extend_from_slice(b"no such torrent");
        let response = UdpResponse::from_bytes(&bytes).unwrap();
        let UdpResponseKind::Error { message } = response.kind else {
            panic!("expected error response");
        };
        assert_eq!(message, "no such torrent");
    }

    #[test]
    fn compact_peers_ignore_trailing_bytes() {
        let peers = parse_compact_peers(&[127, 0, 0, 1, 0x1a, 0xe1, 9, 9]);
        assert_eq!(peers.len(), 1);
    }
}
