//! The handshake and the length prefixed peer message codecs.
//!
//! Messages are sent on the wire as `<length prefix><message id><payload>`,
//! all integers big endian. A zero length prefix is a keep-alive and has
//! neither id nor payload (it must not be confused with id 0, choke):
//!
//! | id | message        | payload                                |
//! |----|----------------|----------------------------------------|
//! |  0 | choke          | -                                      |
//! |  1 | unchoke        | -                                      |
//! |  2 | interested     | -                                      |
//! |  3 | not interested | -                                      |
//! |  4 | have           | 4 byte piece index                     |
//! |  5 | bitfield       | packed bits, MSB first                 |
//! |  6 | request        | `<index><begin><length>`               |
//! |  7 | piece          | `<index><begin><block bytes>`          |
//! |  9 | port           | 2 byte DHT port (BEP-5 peer exchange)  |

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, Bitfield, PeerId, PieceIndex, Sha1Hash};

/// The protocol string new handshakes are created with.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// An upper bound on the length prefix, to bail out early on corrupt
/// streams: the largest legitimate frame is a piece message carrying one
/// maximum size block.
const MAX_FRAME_LEN: u32 = 9 + crate::MAX_BLOCK_LEN;

/// The handshake each side sends as the very first bytes of a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    /// The protocol string, `pstr` in the standard. Always
    /// [`PROTOCOL_STRING`] for handshakes we create.
    pub prot: Vec<u8>,
    /// Extension bits. Bit 0 of byte 7 signals DHT peer exchange support.
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId, dht_support: bool) -> Self {
        let mut reserved = [0; 8];
        if dht_support {
            reserved[7] |= 1;
        }
        Self {
            prot: PROTOCOL_STRING.as_bytes().to_vec(),
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & 1 != 0
    }

    /// The length of the serialized handshake, in bytes.
    pub fn len(&self) -> usize {
        49 + self.prot.len()
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        if handshake.prot.is_empty() || handshake.prot.len() > u8::MAX as usize {
            return Err(Error::BadHandshake);
        }
        buf.reserve(handshake.len());
        buf.put_u8(handshake.prot.len() as u8);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let prot_len = buf[0] as usize;
        if prot_len == 0 {
            return Err(Error::BadHandshake);
        }

        // the remaining payload is pstr + 8 reserved + 20 info hash
        // + 20 peer id
        if buf.len() < 1 + prot_len + 48 {
            return Ok(None);
        }
        buf.advance(1);

        let prot = buf.split_to(prot_len).to_vec();
        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf.split_to(8));
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf.split_to(20));
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf.split_to(20));

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id byte of a peer message. Keep-alives have no id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
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
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            9 => Ok(Self::Port),
            _ => Err(Error::MalformedMessage(format!("unknown message id {}", id))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request {
        index: PieceIndex,
        begin: u32,
        len: u32,
    },
    Piece {
        index: PieceIndex,
        begin: u32,
        block: Vec<u8>,
    },
    Port(u16),
}

impl Message {
    /// The message's id on the wire, or `None` for keep-alives.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have(_) => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request { .. } => Some(MessageId::Request),
            Self::Piece { .. } => Some(MessageId::Piece),
            Self::Port(_) => Some(MessageId::Port),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                // empty payload messages only carry their id; the unwrap
                // can't fail as the id is statically known here
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have(index) => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(index as u32);
            }
            Message::Bitfield(bitfield) => {
                let payload = bitfield.as_raw_slice();
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(payload);
            }
            Message::Request { index, begin, len } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(index as u32);
                buf.put_u32(begin);
                buf.put_u32(len);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.put_u32(9 + block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(index as u32);
                buf.put_u32(begin);
                buf.put_slice(&block);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut prefix = [0; 4];
        prefix.copy_from_slice(&buf[..4]);
        let frame_len = u32::from_be_bytes(prefix);
        if frame_len > MAX_FRAME_LEN {
            return Err(Error::MalformedMessage(format!(
                "length prefix {} exceeds the largest possible frame",
                frame_len
            )));
        }

        let frame_len = frame_len as usize;
        if buf.len() < 4 + frame_len {
            // there isn't a full frame in the buffer yet
            buf.reserve(4 + frame_len - buf.len());
            return Ok(None);
        }
        buf.advance(4);

        // a zero length frame is a keep-alive: no id, no payload
        if frame_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut payload = buf.split_to(frame_len);
        let id = MessageId::try_from(payload.get_u8())?;
        let payload_len = payload.len();

        let expect_len = |expected: usize| -> Result<()> {
            if payload_len != expected {
                Err(Error::MalformedMessage(format!(
                    "{:?} payload must be {} bytes, got {}",
                    id, expected, payload_len
                )))
            } else {
                Ok(())
            }
        };

        let msg = match id {
            MessageId::Choke => {
                expect_len(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect_len(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect_len(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect_len(0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect_len(4)?;
                Message::Have(payload.get_u32() as PieceIndex)
            }
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
            }
            MessageId::Request => {
                expect_len(12)?;
                Message::Request {
                    index: payload.get_u32() as PieceIndex,
                    begin: payload.get_u32(),
                    len: payload.get_u32(),
                }
            }
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(Error::MalformedMessage(format!(
                        "piece payload must be at least 8 bytes, got {}",
                        payload_len
                    )));
                }
                Message::Piece {
                    index: payload.get_u32() as PieceIndex,
                    begin: payload.get_u32(),
                    block: payload.to_vec(),
                }
            }
            MessageId::Port => {
                expect_len(2)?;
                Message::Port(payload.get_u16())
            }
        };

        Ok(Some(msg))
    }
}
