//! The framing and parsing of the two wire protocols spoken with a peer: the
//! 68 byte opening handshake and the length prefixed peer messages that
//! follow it.
//!
//! Both codecs work on the same socket, one after the other: a session starts
//! out with [`HandshakeCodec`] and swaps it for [`PeerCodec`] once the
//! handshakes are exchanged. Any bytes the peer may have sent after its
//! handshake are kept in the framing buffer across the swap.

use std::{
    convert::TryFrom,
    io::{self, Cursor},
};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, BlockInfo, PieceIndex};

/// The protocol string that identifies the BitTorrent V1 protocol in the
/// handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The message sent at the beginning of a peer session by both sides of the
/// connection.
///
/// It is 68 bytes long and has the following structure:
///
/// `<pstrlen=19><pstr="BitTorrent protocol"><reserved><info hash><peer id>`
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, which must equal "BitTorrent protocol", as
    /// otherwise the connection is aborted.
    pub prot: [u8; 19],
    /// A reserved field, currently all zeros. This is where a client's
    /// supported extensions are announced.
    pub reserved: [u8; 8],
    /// The torrent's SHA1 info hash, used to identify the torrent in the
    /// handshake and to verify the peer.
    pub info_hash: [u8; 20],
    /// The arbitrary peer id, usually used to identify the torrent client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a new protocol version 1 handshake with the given info hash
    /// and peer id.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;

        // we should only be sending the bittorrent protocol string
        debug_assert_eq!(prot, PROTOCOL_STRING.as_bytes());

        buf.put_u8(prot.len() as u8);
        buf.extend_from_slice(&prot);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at the length prefix without advancing the buffer, as the rest
        // of the message may not have arrived yet
        let mut tmp_buf = Cursor::new(&buf);
        let prot_len = tmp_buf.get_u8() as usize;
        if prot_len != PROTOCOL_STRING.len() {
            // anything else cannot be a BitTorrent handshake
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake has invalid protocol string length",
            ));
        }

        let payload_len = prot_len + 8 + 20 + 20;
        if buf.len() < 1 + payload_len {
            return Ok(None);
        }
        // we have the full message in the buffer, so we can advance past the
        // length prefix
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake has invalid protocol string",
            ));
        }

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The ids of the messages of the peer wire protocol, as they appear on the
/// wire.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            id => Err(id),
        }
    }
}

/// A message of the peer wire protocol.
///
/// All message variants frame as `<4 byte big endian length><message id>
/// <payload>`; the keep alive message is just a zero length prefix with
/// neither id nor payload.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    /// The raw piece availability as sent by the peer. It is as long as the
    /// wire payload, so it may contain padding bits past the torrent's piece
    /// count, which the receiver is expected to strip.
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the id of the message, or `None` for a keep alive, which has
    /// no id on the wire.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke | Unchoke | Interested | NotInterested => {
                buf.put_u32(1);
                // checked above: these variants all have an id
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                let payload = bitfield.as_slice();
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(payload);
            }
            Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
        }

        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        // messages with an unknown id are skipped without breaking the
        // framing, hence the loop
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }

            // peek at the length prefix without advancing the buffer, as the
            // rest of the message may not have arrived yet
            let mut tmp_buf = Cursor::new(&buf);
            let msg_len = tmp_buf.get_u32() as usize;

            if msg_len == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            if buf.len() < 4 + msg_len {
                // reserve space for the rest of the message up front, mostly
                // relevant for the 16 KiB piece payloads, so that the buffer
                // doesn't need to grow while it trickles in
                buf.reserve(4 + msg_len - buf.len());
                return Ok(None);
            }

            // the full message is in the buffer, consume it
            buf.advance(4);
            let mut payload = buf.split_to(msg_len);
            let id = payload.get_u8();

            let id = match MessageId::try_from(id) {
                Ok(id) => id,
                Err(id) => {
                    // the length prefix was honoured, so the stream stays
                    // aligned and the message can simply be dropped
                    log::warn!("Received message with invalid id: {}", id);
                    continue;
                }
            };

            // A message whose declared length can't hold its id's payload is
            // as much a protocol violation as a bad handshake: erroring here
            // ends the session, which gets replaced.
            let min_payload_len = match id {
                MessageId::Have => 4,
                MessageId::Request | MessageId::Cancel => 12,
                MessageId::Piece => 8,
                _ => 0,
            };
            if payload.remaining() < min_payload_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{:?} message payload is too short", id),
                ));
            }

            let msg = match id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => Message::Have {
                    piece_index: payload.get_u32() as PieceIndex,
                },
                MessageId::Bitfield => {
                    Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
                }
                MessageId::Request => Message::Request(BlockInfo {
                    piece_index: payload.get_u32() as PieceIndex,
                    offset: payload.get_u32(),
                    len: payload.get_u32(),
                }),
                MessageId::Piece => {
                    let piece_index = payload.get_u32() as PieceIndex;
                    let offset = payload.get_u32();
                    Message::Block {
                        piece_index,
                        offset,
                        data: payload.to_vec(),
                    }
                }
                MessageId::Cancel => Message::Cancel(BlockInfo {
                    piece_index: payload.get_u32() as PieceIndex,
                    offset: payload.get_u32(),
                    len: payload.get_u32(),
                }),
            };

            return Ok(Some(msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_handshake() -> Handshake {
        Handshake::new([0xab; 20], *b"swl-0000000000000000")
    }

    // All peer message variants with payloads of a valid shape, in an
    // arbitrary order.
    fn test_messages() -> Vec<Message> {
        vec![
            Message::Bitfield(Bitfield::from_vec(vec![0b1010_0101, 0xff])),
            Message::KeepAlive,
            Message::Unchoke,
            Message::Have { piece_index: 42 },
            Message::Request(BlockInfo {
                piece_index: 1,
                offset: 0x4000,
                len: 0x4000,
            }),
            Message::Block {
                piece_index: 1,
                offset: 0x4000,
                data: (0..=255).cycle().take(300).collect(),
            },
            Message::Choke,
            Message::Interested,
            Message::NotInterested,
            Message::Cancel(BlockInfo {
                piece_index: 3,
                offset: 0,
                len: 0x1234,
            }),
        ]
    }

    // Decodes as many messages as the buffer currently holds.
    fn drain(codec: &mut PeerCodec, buf: &mut BytesMut) -> Vec<Message> {
        let mut msgs = Vec::new();
        while let Some(msg) = codec.decode(buf).unwrap() {
            msgs.push(msg);
        }
        msgs
    }

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = test_handshake();
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(handshake));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_decode_byte_by_byte() {
        let handshake = test_handshake();
        let mut encoded = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut encoded).unwrap();

        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        for (i, byte) in encoded.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let decoded = codec.decode(&mut buf).unwrap();
            if i < encoded.len() - 1 {
                assert_eq!(decoded, None);
            } else {
                assert_eq!(decoded, Some(handshake));
            }
        }
    }

    #[test]
    fn test_handshake_rejects_non_handshake() {
        // wrong protocol string length: rejected from the first byte
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[18]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());

        // right length but wrong protocol string
        let mut handshake = test_handshake();
        handshake.prot.copy_from_slice(b"BitTorrent randomly");
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.extend_from_slice(&handshake.prot);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(&handshake.info_hash);
        buf.extend_from_slice(&handshake.peer_id);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_peer_message_roundtrips() {
        for msg in test_messages() {
            let mut buf = BytesMut::new();
            PeerCodec.encode(msg.clone(), &mut buf).unwrap();
            let decoded = PeerCodec.decode(&mut buf).unwrap();
            assert_eq!(decoded, Some(msg));
            assert!(buf.is_empty());
        }
    }

    // The decoder must emit the same event sequence no matter how the byte
    // stream is partitioned into chunks.
    #[test]
    fn test_peer_decode_chunk_partition_equivalence() {
        let msgs = test_messages();
        let mut blob = BytesMut::new();
        for msg in msgs.iter() {
            PeerCodec.encode(msg.clone(), &mut blob).unwrap();
        }

        // the whole stream in a single chunk
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&blob);
        assert_eq!(drain(&mut PeerCodec, &mut buf), msgs);

        // chunk sizes that don't line up with any frame boundary, including
        // one byte at a time
        for chunk_len in &[1, 3, 7, 64] {
            let mut codec = PeerCodec;
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for chunk in blob.chunks(*chunk_len) {
                buf.extend_from_slice(chunk);
                decoded.extend(drain(&mut codec, &mut buf));
            }
            assert_eq!(decoded, msgs, "chunk size {}", chunk_len);
        }
    }

    #[test]
    fn test_peer_decode_skips_unknown_message_id() {
        let mut buf = BytesMut::new();
        // a 3 byte message with the undefined id 13
        buf.put_u32(3);
        buf.put_u8(13);
        buf.extend_from_slice(&[0xaa, 0xbb]);
        PeerCodec.encode(Message::Unchoke, &mut buf).unwrap();

        // the unknown message is skipped whole and the next frame parses
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::Unchoke)
        );
        assert!(buf.is_empty());
    }

    // A length prefix too small for the message id's payload must fail the
    // decode rather than panic partway into the parse.
    #[test]
    fn test_peer_decode_rejects_truncated_payloads() {
        // a have message with no piece index, just the id byte
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(MessageId::Have as u8);
        assert!(PeerCodec.decode(&mut buf).is_err());

        // a request missing its length field
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        buf.put_u8(MessageId::Request as u8);
        buf.put_u32(1);
        buf.put_u32(0);
        assert!(PeerCodec.decode(&mut buf).is_err());

        // a piece message cut off inside its begin field
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Piece as u8);
        buf.put_u32(1);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_peer_decode_keep_alive() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::KeepAlive)
        );
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), None);
    }
}
