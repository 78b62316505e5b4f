use std::{fmt::Display, io::Read};

use anyhow::{anyhow, ensure, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{bitfield::BitField, store::Block};

/// Peer id in the `-LE0001-` azureus style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id: [u8; 20] = rand::random();
        id[..8].copy_from_slice(b"-LE0001-");
        Self(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, Clone)]
pub struct HandShake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
}

impl HandShake {
    pub const SIZE: usize = 68;

    /// Handshake this client sends out. Reserved bits are all zero,
    /// no extensions are negotiated.
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        Self {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> anyhow::Result<Self> {
        ensure!(bytes[0] == 19, "protocol tag byte must be 19");
        ensure!(
            &bytes[1..20] == b"BitTorrent protocol",
            "unexpected protocol name"
        );
        let mut rest = &bytes[20..];

        let mut reserved = [0; 8];
        let mut info_hash = [0; 20];
        let mut peer_id = [0; 20];
        rest.read_exact(&mut reserved).context("reserved bytes")?;
        rest.read_exact(&mut info_hash).context("info hash bytes")?;
        rest.read_exact(&mut peer_id).context("peer id bytes")?;
        debug_assert!(rest.is_empty());

        Ok(Self {
            reserved,
            info_hash,
            peer_id: PeerId(peer_id),
        })
    }

    pub fn as_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0] = 19;
        out[1..20].copy_from_slice(b"BitTorrent protocol");
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(&self.info_hash);
        out[48..68].copy_from_slice(&self.peer_id.0);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        index: u32,
    },
    Bitfield {
        payload: BitField,
    },
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Bytes,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    /// BEP 10 extension frame. We advertise no extensions so these are
    /// accepted and dropped.
    Extended {
        payload: Bytes,
    },
}

impl Display for PeerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMessage::KeepAlive => write!(f, "KeepAlive"),
            PeerMessage::Choke => write!(f, "Choke"),
            PeerMessage::Unchoke => write!(f, "Unchoke"),
            PeerMessage::Interested => write!(f, "Interested"),
            PeerMessage::NotInterested => write!(f, "NotInterested"),
            PeerMessage::Have { index } => write!(f, "Have {index}"),
            PeerMessage::Bitfield { payload } => {
                write!(f, "Bitfield with length {}", payload.0.len())
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            } => write!(
                f,
                "Request for piece {index} with offset {begin} and length {length}"
            ),
            PeerMessage::Piece { index, begin, block } => write!(
                f,
                "Block for piece {index} with offset {begin} and length {}",
                block.len()
            ),
            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => write!(
                f,
                "Cancel for piece {index} with offset {begin} and length {length}"
            ),
            PeerMessage::Extended { .. } => write!(f, "Extended"),
        }
    }
}

impl PeerMessage {
    pub fn request(block: Block) -> Self {
        Self::Request {
            index: block.piece,
            begin: block.offset,
            length: block.length,
        }
    }

    pub fn cancel(block: Block) -> Self {
        Self::Cancel {
            index: block.piece,
            begin: block.offset,
            length: block.length,
        }
    }

    pub fn from_frame(frame: Bytes) -> anyhow::Result<Self> {
        if frame.is_empty() {
            return Ok(Self::KeepAlive);
        }
        let request_payload = |mut b: &[u8]| -> anyhow::Result<_> {
            let mut index = [0; 4];
            let mut begin = [0; 4];
            let mut length = [0; 4];
            b.read_exact(&mut index).context("index buffer")?;
            b.read_exact(&mut begin).context("begin buffer")?;
            b.read_exact(&mut length).context("length buffer")?;
            Ok((
                u32::from_be_bytes(index),
                u32::from_be_bytes(begin),
                u32::from_be_bytes(length),
            ))
        };
        let tag = frame[0];
        let payload = &frame[1..];
        match tag {
            0 => Ok(PeerMessage::Choke),
            1 => Ok(PeerMessage::Unchoke),
            2 => Ok(PeerMessage::Interested),
            3 => Ok(PeerMessage::NotInterested),
            4 => {
                let index = payload.get(0..4).context("have payload")?.try_into()?;
                Ok(PeerMessage::Have {
                    index: u32::from_be_bytes(index),
                })
            }
            5 => Ok(PeerMessage::Bitfield {
                payload: BitField::new(payload),
            }),
            6 => {
                let (index, begin, length) = request_payload(payload)?;
                Ok(PeerMessage::Request {
                    index,
                    begin,
                    length,
                })
            }
            7 => {
                let index: [u8; 4] = payload.get(0..4).context("piece index")?.try_into()?;
                let begin: [u8; 4] = payload.get(4..8).context("piece begin")?.try_into()?;
                let block = frame.slice(9..);
                Ok(PeerMessage::Piece {
                    index: u32::from_be_bytes(index),
                    begin: u32::from_be_bytes(begin),
                    block,
                })
            }
            8 => {
                let (index, begin, length) = request_payload(payload)?;
                Ok(PeerMessage::Cancel {
                    index,
                    begin,
                    length,
                })
            }
            20 => Ok(PeerMessage::Extended {
                payload: frame.slice(1..),
            }),
            t => Err(anyhow!("unsupported tag: {t}")),
        }
    }

    pub fn as_bytes(&self) -> Bytes {
        let request_to_bytes = |tag: u8, index: u32, begin: u32, length: u32| {
            let mut bytes = BytesMut::with_capacity(13);
            bytes.put_u8(tag);
            bytes.put_u32(index);
            bytes.put_u32(begin);
            bytes.put_u32(length);
            bytes.freeze()
        };
        match self {
            PeerMessage::KeepAlive => Bytes::new(),
            PeerMessage::Choke => Bytes::from_static(&[0]),
            PeerMessage::Unchoke => Bytes::from_static(&[1]),
            PeerMessage::Interested => Bytes::from_static(&[2]),
            PeerMessage::NotInterested => Bytes::from_static(&[3]),
            PeerMessage::Have { index } => {
                let mut bytes = BytesMut::with_capacity(5);
                bytes.put_u8(4);
                bytes.put_u32(*index);
                bytes.freeze()
            }
            PeerMessage::Bitfield { payload } => {
                let mut bytes = BytesMut::with_capacity(1 + payload.0.len());
                bytes.put_u8(5);
                bytes.extend_from_slice(&payload.0);
                bytes.freeze()
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            } => request_to_bytes(6, *index, *begin, *length),
            PeerMessage::Piece { index, begin, block } => {
                let mut bytes = BytesMut::with_capacity(9 + block.len());
                bytes.put_u8(7);
                bytes.put_u32(*index);
                bytes.put_u32(*begin);
                bytes.extend_from_slice(block);
                bytes.freeze()
            }
            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => request_to_bytes(8, *index, *begin, *length),
            PeerMessage::Extended { payload } => {
                let mut bytes = BytesMut::with_capacity(1 + payload.len());
                bytes.put_u8(20);
                bytes.extend_from_slice(payload);
                bytes.freeze()
            }
        }
    }
}

#[derive(Debug)]
pub struct MessageFramer;

/// Frames past this size terminate the session
const MAX_FRAME: usize = 1 << 24;

impl Decoder for MessageFramer {
    type Item = PeerMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            // Not enough data to read length marker.
            return Ok(None);
        }

        let length = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;

        if length == 0 {
            src.advance(4);
            return Ok(Some(PeerMessage::KeepAlive));
        }

        if length > MAX_FRAME {
            return Err(anyhow!(
                "frame length {length} is higher than allowed {MAX_FRAME}"
            ));
        }

        if src.len() < 4 + length {
            // Reserve space for the rest of the frame and ask for more bytes.
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(4 + length);
        frame.advance(4);
        PeerMessage::from_frame(frame.freeze())
            .map(Some)
            .map_err(|e| anyhow!("failed to construct peer message: {e}"))
    }
}

impl Encoder<PeerMessage> for MessageFramer {
    type Error = anyhow::Error;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.as_bytes();
        let length = bytes.len();
        if length > MAX_FRAME {
            return Err(anyhow!(
                "frame length {length} is higher than allowed {MAX_FRAME}"
            ));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use crate::bitfield::BitField;

    use super::{HandShake, MessageFramer, PeerId, PeerMessage};

    fn re_encode_message(msg: PeerMessage) {
        let mut framer = MessageFramer;
        let mut buffer = BytesMut::new();
        framer.encode(msg.clone(), &mut buffer).unwrap();
        let result = framer.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(msg, result);
        assert!(buffer.is_empty());
    }

    #[test]
    fn parse_peer_message() {
        re_encode_message(PeerMessage::KeepAlive);
        re_encode_message(PeerMessage::Choke);
        re_encode_message(PeerMessage::Unchoke);
        re_encode_message(PeerMessage::Interested);
        re_encode_message(PeerMessage::NotInterested);
        re_encode_message(PeerMessage::Have { index: 123 });
        re_encode_message(PeerMessage::Bitfield {
            payload: BitField::empty(300),
        });
        re_encode_message(PeerMessage::Request {
            index: 22,
            begin: 100,
            length: 200,
        });
        re_encode_message(PeerMessage::Piece {
            index: 22,
            begin: 100,
            block: Bytes::from_static(&[23, 222, 32]),
        });
        re_encode_message(PeerMessage::Cancel {
            index: 22,
            begin: 100,
            length: 200,
        });
        re_encode_message(PeerMessage::Extended {
            payload: Bytes::from_static(&[1, 22, 222]),
        });
    }

    #[test]
    fn partial_frame_needs_more_bytes() {
        let mut framer = MessageFramer;
        let mut buffer = BytesMut::new();
        framer
            .encode(PeerMessage::Have { index: 9 }, &mut buffer)
            .unwrap();
        let mut partial = BytesMut::from(&buffer[..3]);
        assert!(framer.decode(&mut partial).unwrap().is_none());
        let mut partial = BytesMut::from(&buffer[..6]);
        assert!(framer.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut framer = MessageFramer;
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&u32::MAX.to_be_bytes());
        buffer.extend_from_slice(&[7; 16]);
        assert!(framer.decode(&mut buffer).is_err());
    }

    #[test]
    fn handshake_round_trip() {
        let peer_id = PeerId::generate();
        assert_eq!(&peer_id.0[..8], b"-LE0001-");
        let handshake = HandShake::new([7; 20], peer_id);
        let parsed = HandShake::from_bytes(&handshake.as_bytes()).unwrap();
        assert_eq!(parsed.info_hash, [7; 20]);
        assert_eq!(parsed.peer_id, peer_id);
        assert_eq!(parsed.reserved, [0; 8]);
    }

    #[test]
    fn handshake_rejects_wrong_protocol() {
        let handshake = HandShake::new([7; 20], PeerId::generate());
        let mut bytes = handshake.as_bytes();
        bytes[1] = b'X';
        assert!(HandShake::from_bytes(&bytes).is_err());
    }
}
