//! The wire codec: length-prefixed peer-protocol message framing plus
//! the one-off fixed-layout handshake record.
//!
//! Two [`tokio_util::codec::{Decoder, Encoder}`] implementations:
//! [`HandshakeCodec`] handles the single 68-byte handshake record, after
//! which the connection is re-framed (see [`super::PeerSession`]) onto
//! [`PeerCodec`] for every subsequent message.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    peer::extension::ExtensionBits,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The literal protocol identifier every BitTorrent v1 handshake carries.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The 68-byte fixed-layout opening exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    /// The protocol identifier string, expected to be
    /// [`PROTOCOL_STRING`].
    pub prot: Vec<u8>,
    /// The sender's extension bits.
    pub reserved: ExtensionBits,
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(
        info_hash: Sha1Hash,
        peer_id: PeerId,
        reserved: ExtensionBits,
    ) -> Self {
        Self { prot: PROTOCOL_STRING.as_bytes().to_vec(), reserved, info_hash, peer_id }
    }
}

pub(crate) struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>> {
        if src.is_empty() {
            return Ok(None);
        }
        let prot_len = src[0] as usize;
        // 1 (len byte) + prot_len + 8 (extension bits) + 20 (info hash) + 20
        // (peer id)
        let total_len = 1 + prot_len + 48;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut buf = src.split_to(total_len);
        buf.advance(1);
        let prot = buf.split_to(prot_len).to_vec();
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::Protocol(format!(
                "unexpected protocol string {:?}",
                String::from_utf8_lossy(&prot)
            )));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf.split_to(8));
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf.split_to(20));
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf.split_to(20));

        Ok(Some(Handshake {
            prot,
            reserved: ExtensionBits(reserved),
            info_hash,
            peer_id,
        }))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        dst: &mut BytesMut,
    ) -> Result<()> {
        dst.reserve(1 + handshake.prot.len() + 48);
        dst.put_u8(handshake.prot.len() as u8);
        dst.extend_from_slice(&handshake.prot);
        dst.extend_from_slice(&handshake.reserved.0);
        dst.extend_from_slice(&handshake.info_hash);
        dst.extend_from_slice(&handshake.peer_id);
        Ok(())
    }
}

/// The tag byte identifying a peer-protocol message. Used for logging and
/// for rejecting unknown/unexpected tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
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
    Extended = 20,
}

impl std::convert::TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            20 => Self::Extended,
            other => {
                return Err(Error::Protocol(format!(
                    "unknown message tag {}",
                    other
                )))
            }
        })
    }
}

/// A single peer-protocol message, including the virtual `KeepAlive` frame
/// used internally to represent a zero-length frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
    Extended { id: u8, payload: Vec<u8> },
}

impl Message {
    /// The tag this message is (or would be) framed with; `None` for
    /// `KeepAlive`, which has no tag byte.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have(_) => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }
}

pub(crate) struct PeerCodec;

/// An arbitrarily chosen upper bound on a single frame's length, to guard
/// against a peer claiming an absurd length and exhausting memory while we
/// wait for the rest of the frame to arrive. Far larger than any message
/// this engine sends or expects (the largest legitimate payload is a 16
/// KiB block plus a small header).
const MAX_FRAME_LEN: usize = 1 << 20;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if len > MAX_FRAME_LEN {
            return Err(Error::Framing(format!(
                "frame of length {} exceeds maximum of {}",
                len, MAX_FRAME_LEN
            )));
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut payload = src.split_to(len);
        let tag = payload.get_u8();
        let id = std::convert::TryFrom::try_from(tag)?;

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                expect_len(&payload, 4, "have")?;
                Message::Have(payload.get_u32() as PieceIndex)
            }
            MessageId::Bitfield => Message::Bitfield(Bitfield::from_vec(
                payload.to_vec(),
            )),
            MessageId::Request => {
                expect_len(&payload, 12, "request")?;
                Message::Request(read_block_info(&mut payload))
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(Error::Framing(
                        "piece message shorter than its fixed header"
                            .to_string(),
                    ));
                }
                let piece_index = payload.get_u32() as PieceIndex;
                let offset = payload.get_u32();
                Message::Block { piece_index, offset, data: payload.to_vec() }
            }
            MessageId::Cancel => {
                expect_len(&payload, 12, "cancel")?;
                Message::Cancel(read_block_info(&mut payload))
            }
            MessageId::Extended => {
                if payload.is_empty() {
                    return Err(Error::Framing(
                        "extended message missing sub-id".to_string(),
                    ));
                }
                let sub_id = payload.get_u8();
                Message::Extended { id: sub_id, payload: payload.to_vec() }
            }
        };

        Ok(Some(msg))
    }
}

fn expect_len(payload: &BytesMut, expected: usize, name: &str) -> Result<()> {
    if payload.len() != expected {
        return Err(Error::Framing(format!(
            "{} message payload is {} bytes, expected {}",
            name,
            payload.len(),
            expected
        )));
    }
    Ok(())
}

fn read_block_info(payload: &mut BytesMut) -> BlockInfo {
    let piece_index = payload.get_u32() as PieceIndex;
    let offset = payload.get_u32();
    let len = payload.get_u32();
    BlockInfo { piece_index, offset, len }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                dst.reserve(4);
                dst.put_u32(0);
            }
            Message::Choke => write_header(dst, MessageId::Choke, 0),
            Message::Unchoke => write_header(dst, MessageId::Unchoke, 0),
            Message::Interested => write_header(dst, MessageId::Interested, 0),
            Message::NotInterested => {
                write_header(dst, MessageId::NotInterested, 0)
            }
            Message::Have(index) => {
                write_header(dst, MessageId::Have, 4);
                dst.put_u32(index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                write_header(dst, MessageId::Bitfield, bytes.len());
                dst.extend_from_slice(&bytes);
            }
            Message::Request(block) => {
                write_header(dst, MessageId::Request, 12);
                put_block_info(dst, &block);
            }
            Message::Block { piece_index, offset, data } => {
                write_header(dst, MessageId::Piece, 8 + data.len());
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                write_header(dst, MessageId::Cancel, 12);
                put_block_info(dst, &block);
            }
            Message::Extended { id, payload } => {
                write_header(dst, MessageId::Extended, 1 + payload.len());
                dst.put_u8(id);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

fn write_header(dst: &mut BytesMut, id: MessageId, payload_len: usize) {
    dst.reserve(5 + payload_len);
    dst.put_u32(1 + payload_len as u32);
    dst.put_u8(id as u8);
}

fn put_block_info(dst: &mut BytesMut, block: &BlockInfo) {
    dst.put_u32(block.piece_index as u32);
    dst.put_u32(block.offset);
    dst.put_u32(block.len);
}

/// Validates a received bitfield against the known piece count (spec
/// §4.2): it must be exactly `ceil(num_pieces / 8)` bytes long, and no bit
/// past `num_pieces - 1` may be set.
pub(crate) fn validate_bitfield(
    bitfield: &Bitfield,
    num_pieces: usize,
) -> Result<()> {
    let expected_bytes = (num_pieces + 7) / 8;
    let actual_bytes = bitfield.len() / 8;
    if actual_bytes != expected_bytes {
        return Err(Error::Protocol(format!(
            "bitfield is {} bytes, expected {}",
            actual_bytes, expected_bytes
        )));
    }
    for index in num_pieces..bitfield.len() {
        if bitfield[index] {
            return Err(Error::Protocol(format!(
                "bitfield has spare bit {} set beyond piece count {}",
                index, num_pieces
            )));
        }
    }
    Ok(())
}
