//! The `ut_metadata` extension (BEP 9), used by the metadata fetcher to
//! retrieve a torrent's `info` dictionary over the wire when we only have
//! a magnet link.
//!
//! Each `ut_metadata` message is a bencoded dictionary immediately followed
//! (with no delimiter) by the raw metadata bytes for `data` messages. Since
//! `serde_bencode` only knows how to decode a single complete value, we
//! scan the dictionary's length ourselves before decoding it, then treat
//! whatever bytes follow as the block payload.

use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::time::timeout;

use super::{codec::Message, extension, PeerSession};
use crate::error::{Error, Result};
use crate::Sha1Hash;

pub(crate) const BLOCK_LEN: u32 = 16 * 1024;

/// Accumulates `ut_metadata` data blocks into the complete `info`
/// dictionary, and verifies the result against the torrent's info hash: a
/// metadata fetch is only trusted once the reassembled bytes hash to the
/// info hash we already know from the magnet link.
pub(crate) struct MetadataAssembler {
    total_size: u64,
    piece_count: u32,
    received: Vec<Option<Vec<u8>>>,
}

impl MetadataAssembler {
    pub fn new(total_size: u64) -> Self {
        let piece_count =
            ((total_size + BLOCK_LEN as u64 - 1) / BLOCK_LEN as u64) as u32;
        Self { total_size, piece_count, received: vec![None; piece_count as usize] }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// The indices of pieces not yet received, in order.
    pub fn missing_pieces(&self) -> impl Iterator<Item = u32> + '_ {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, block)| block.is_none())
            .map(|(index, _)| index as u32)
    }

    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|block| block.is_some())
    }

    /// Records a received data block. Fails if `piece` is out of range or
    /// its payload length doesn't match what's expected for that index
    /// (every piece is exactly [`BLOCK_LEN`] except possibly the last).
    pub fn insert(&mut self, piece: u32, payload: Vec<u8>) -> Result<()> {
        let slot = self.received.get_mut(piece as usize).ok_or_else(|| {
            Error::Protocol(format!(
                "ut_metadata piece index {} out of range (have {})",
                piece, self.piece_count
            ))
        })?;
        let expected_len = if piece + 1 == self.piece_count {
            self.total_size - (piece as u64) * BLOCK_LEN as u64
        } else {
            BLOCK_LEN as u64
        };
        if payload.len() as u64 != expected_len {
            return Err(Error::Protocol(format!(
                "ut_metadata piece {} is {} bytes, expected {}",
                piece,
                payload.len(),
                expected_len
            )));
        }
        *slot = Some(payload);
        Ok(())
    }

    /// Concatenates all received blocks and verifies the result hashes to
    /// `expected_info_hash`. Only call once [`Self::is_complete`] is true.
    pub fn finish(self, expected_info_hash: Sha1Hash) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.total_size as usize);
        for block in self.received {
            buf.extend_from_slice(&block.expect("finish called while incomplete"));
        }
        let digest = Sha1::digest(&buf);
        if digest.as_slice() != expected_info_hash {
            return Err(Error::InfoHashMismatch);
        }
        Ok(buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UtMetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u64, payload: Vec<u8> },
    Reject { piece: u32 },
}

#[derive(Debug, Serialize)]
struct OutgoingDict {
    msg_type: u8,
    piece: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IncomingDict {
    msg_type: u8,
    piece: u32,
    total_size: Option<u64>,
}

impl UtMetadataMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Request { piece } => Ok(serde_bencode::to_bytes(
                &OutgoingDict { msg_type: 0, piece: *piece, total_size: None },
            )?),
            Self::Data { piece, total_size, payload } => {
                let mut buf = serde_bencode::to_bytes(&OutgoingDict {
                    msg_type: 1,
                    piece: *piece,
                    total_size: Some(*total_size),
                })?;
                buf.extend_from_slice(payload);
                Ok(buf)
            }
            Self::Reject { piece } => Ok(serde_bencode::to_bytes(
                &OutgoingDict { msg_type: 2, piece: *piece, total_size: None },
            )?),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let dict_len = bencode_dict_len(buf)?;
        let dict: IncomingDict = serde_bencode::from_bytes(&buf[..dict_len])?;
        match dict.msg_type {
            0 => Ok(Self::Request { piece: dict.piece }),
            1 => {
                let total_size = dict.total_size.ok_or_else(|| {
                    Error::Protocol(
                        "ut_metadata data message missing total_size"
                            .to_string(),
                    )
                })?;
                Ok(Self::Data {
                    piece: dict.piece,
                    total_size,
                    payload: buf[dict_len..].to_vec(),
                })
            }
            2 => Ok(Self::Reject { piece: dict.piece }),
            other => Err(Error::Protocol(format!(
                "unknown ut_metadata msg_type {}",
                other
            ))),
        }
    }
}

/// Drives the metadata fetch to completion over an already-connected,
/// extension-capable session: requests every missing block in order,
/// abandoning the peer on a `reject` or on any protocol violation, and
/// returns the reassembled `info` dictionary bytes once they hash to
/// `expected_info_hash`.
pub(crate) async fn fetch_metadata(
    session: &mut PeerSession,
    expected_info_hash: Sha1Hash,
    request_timeout: Duration,
) -> Result<Vec<u8>> {
    let total_size = session.metadata_size().ok_or(Error::MetadataFailed)?;
    let peer_ut_metadata_id =
        session.ut_metadata_id().ok_or(Error::MetadataFailed)?;

    let mut assembler = MetadataAssembler::new(total_size);
    while !assembler.is_complete() {
        let piece = assembler
            .missing_pieces()
            .next()
            .expect("incomplete assembler always has a missing piece");
        let request = UtMetadataMessage::Request { piece }.encode()?;
        session.send_extended(peer_ut_metadata_id, request).await?;

        let msg = recv_with_timeout(session, request_timeout)
            .await?
            .ok_or(Error::MetadataFailed)?;
        let Message::Extended { id, payload } = msg else {
            // unrelated traffic (have/bitfield/keep-alive/choke) is already
            // applied to session state as a side effect of recv_frame;
            // nothing further to do with it here.
            continue;
        };
        if id != extension::UT_METADATA_ID {
            continue;
        }
        match UtMetadataMessage::decode(&payload)? {
            UtMetadataMessage::Data { piece: got_piece, payload: data, .. } => {
                if got_piece != piece {
                    return Err(Error::Protocol(format!(
                        "peer sent ut_metadata piece {} while awaiting {}",
                        got_piece, piece
                    )));
                }
                assembler.insert(got_piece, data)?;
            }
            UtMetadataMessage::Reject { .. } => return Err(Error::MetadataFailed),
            UtMetadataMessage::Request { .. } => {
                // we never serve metadata; ignore requests from the peer.
            }
        }
    }

    assembler.finish(expected_info_hash)
}

async fn recv_with_timeout(
    session: &mut PeerSession,
    request_timeout: Duration,
) -> Result<Option<Message>> {
    timeout(request_timeout, session.recv_frame()).await.map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "peer did not respond within the metadata request deadline",
        ))
    })?
}

/// Scans a buffer for the length, in bytes, of the single bencoded
/// dictionary at its start, without fully decoding it. Needed because
/// `data` messages append a raw byte block immediately after the
/// dictionary with no length prefix of its own.
fn bencode_dict_len(buf: &[u8]) -> Result<usize> {
    let mut pos = 0;
    scan_value(buf, &mut pos)?;
    Ok(pos)
}

fn scan_value(buf: &[u8], pos: &mut usize) -> Result<()> {
    let byte = *buf.get(*pos).ok_or_else(truncated)?;
    match byte {
        b'd' => {
            *pos += 1;
            while *buf.get(*pos).ok_or_else(truncated)? != b'e' {
                scan_value(buf, pos)?; // key
                scan_value(buf, pos)?; // value
            }
            *pos += 1;
        }
        b'l' => {
            *pos += 1;
            while *buf.get(*pos).ok_or_else(truncated)? != b'e' {
                scan_value(buf, pos)?;
            }
            *pos += 1;
        }
        b'i' => {
            *pos += 1;
            while *buf.get(*pos).ok_or_else(truncated)? != b'e' {
                *pos += 1;
            }
            *pos += 1;
        }
        b'0'..=b'9' => {
            let start = *pos;
            while *buf.get(*pos).ok_or_else(truncated)? != b':' {
                *pos += 1;
            }
            let len: usize = std::str::from_utf8(&buf[start..*pos])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    Error::Protocol("malformed bencode string length".to_string())
                })?;
            *pos += 1;
            if *pos + len > buf.len() {
                return Err(truncated());
            }
            *pos += len;
        }
        other => {
            return Err(Error::Protocol(format!(
                "unexpected bencode tag byte {:?}",
                other as char
            )))
        }
    }
    Ok(())
}

fn truncated() -> Error {
    Error::Protocol("truncated bencode value".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_tracks_missing_pieces_and_completes() {
        let data = vec![7u8; BLOCK_LEN as usize + 100];
        let mut assembler = MetadataAssembler::new(data.len() as u64);
        assert_eq!(assembler.piece_count(), 2);
        assert_eq!(assembler.missing_pieces().collect::<Vec<_>>(), vec![0, 1]);

        assembler.insert(0, data[..BLOCK_LEN as usize].to_vec()).unwrap();
        assert_eq!(assembler.missing_pieces().collect::<Vec<_>>(), vec![1]);
        assert!(!assembler.is_complete());

        assembler.insert(1, data[BLOCK_LEN as usize..].to_vec()).unwrap();
        assert!(assembler.is_complete());

        let expected_hash: Sha1Hash = Sha1::digest(&data).into();
        let assembled = assembler.finish(expected_hash).unwrap();
        assert_eq!(assembled, data);
    }

    #[test]
    fn assembler_rejects_wrong_block_length() {
        let mut assembler = MetadataAssembler::new(BLOCK_LEN as u64 * 2);
        assert!(assembler.insert(0, vec![0; 10]).is_err());
    }

    #[test]
    fn assembler_rejects_hash_mismatch() {
        let data = vec![1u8; BLOCK_LEN as usize];
        let mut assembler = MetadataAssembler::new(data.len() as u64);
        assembler.insert(0, data).unwrap();
        let err = assembler.finish([0; 20]).unwrap_err();
        assert!(matches!(err, Error::InfoHashMismatch));
    }

    #[test]
    fn roundtrips_request() {
        let msg = UtMetadataMessage::Request { piece: 3 };
        let encoded = msg.encode().unwrap();
        assert_eq!(UtMetadataMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn roundtrips_reject() {
        let msg = UtMetadataMessage::Reject { piece: 1 };
        let encoded = msg.encode().unwrap();
        assert_eq!(UtMetadataMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn roundtrips_data_with_trailing_payload() {
        let msg = UtMetadataMessage::Data {
            piece: 2,
            total_size: 40000,
            payload: vec![1, 2, 3, 4, 5],
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(UtMetadataMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_unknown_msg_type() {
        #[derive(Serialize)]
        struct Dict {
            msg_type: u8,
            piece: u32,
        }
        let encoded =
            serde_bencode::to_bytes(&Dict { msg_type: 9, piece: 0 }).unwrap();
        assert!(UtMetadataMessage::decode(&encoded).is_err());
    }

    #[test]
    fn decode_rejects_data_without_total_size() {
        #[derive(Serialize)]
        struct Dict {
            msg_type: u8,
            piece: u32,
        }
        let mut encoded =
            serde_bencode::to_bytes(&Dict { msg_type: 1, piece: 0 }).unwrap();
        encoded.extend_from_slice(&[1, 2, 3]);
        assert!(UtMetadataMessage::decode(&encoded).is_err());
    }
}
