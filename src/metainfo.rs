//! Parsing of the bencoded `.torrent` metainfo file into the `info`
//! dictionary the engine core needs a [`crate::TorrentDescriptor`] from.
//!
//! This is a collaborator of the engine core, not part of it (see spec
//! §6): the core never touches bencode, it only ever sees a
//! `TorrentDescriptor`.

use crate::{error::Result, Sha1Hash};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

/// A parsed `.torrent` file.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    /// The tracker's announce URL, if present (private trackers and some
    /// magnet-derived torrents may omit this).
    pub announce: Option<String>,
}

impl Metainfo {
    /// Parses a metainfo file from its raw bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// Computes the SHA-1 digest of the bencoded `info` dictionary: the
    /// torrent's identity, and the value every peer's handshake must agree
    /// on.
    pub fn info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }
}

/// The `info` dictionary of a metainfo file.
///
/// Only the single-file form (`length` present, `files` absent) is
/// supported; mapping pieces onto multiple files is out of scope for this
/// engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    /// The concatenation of all pieces' SHA-1 digests, 20 bytes each.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

impl Info {
    /// Splits the concatenated `pieces` string into its individual 20-byte
    /// digests, in piece-index order.
    pub fn piece_digests(&self) -> Result<Vec<Sha1Hash>> {
        if self.pieces.len() % 20 != 0 {
            return Err(crate::error::Error::Protocol(format!(
                "pieces string length {} is not a multiple of 20",
                self.pieces.len()
            )));
        }
        Ok(self
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut digest = [0; 20];
                digest.copy_from_slice(chunk);
                digest
            })
            .collect())
    }
}

/// An entry of a multi-file torrent's file list.
///
/// Kept for faithful parsing of arbitrary `.torrent` files even though
/// this engine only downloads single-file torrents; constructing a
/// [`crate::TorrentDescriptor`] from a multi-file metainfo fails cleanly
/// (see [`crate::TorrentDescriptor::from_metainfo`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

/// Raw bytes of the bencoded `info` dictionary, extracted without fully
/// decoding it. Used by the metadata fetcher, which assembles these bytes
/// block by block from the `ut_metadata` extension before parsing them
/// into an [`Info`].
pub fn decode_info(buf: &[u8]) -> Result<Info> {
    Ok(serde_bencode::from_bytes(buf)?)
}

/// Re-encodes raw pieces bytes retrieved from a `ByteBuf`-shaped wire
/// field, used only in tests to build fixture metainfo files.
#[cfg(test)]
fn piece_digests_bytes(digests: &[Sha1Hash]) -> ByteBuf {
    ByteBuf::from(digests.concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_info_hash_and_piece_digests() {
        let digests: Vec<Sha1Hash> = vec![[1; 20], [2; 20], [3; 20]];
        let info = Info {
            name: "file.bin".to_string(),
            pieces: piece_digests_bytes(&digests).into_vec(),
            piece_length: 16384,
            length: Some(40000),
            files: None,
            private: None,
        };
        assert_eq!(info.piece_digests().unwrap(), digests);

        let metainfo = Metainfo { info, announce: None };
        // info_hash is deterministic given the same info dictionary
        let a = metainfo.info_hash().unwrap();
        let b = metainfo.info_hash().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed_pieces_length() {
        let info = Info {
            name: "x".to_string(),
            pieces: vec![0; 19],
            piece_length: 16384,
            length: Some(1),
            files: None,
            private: None,
        };
        assert!(info.piece_digests().is_err());
    }
}
