//! Information about a torrent's storage layout: piece sizes, total length,
//! and the identity of the torrent and the local client.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::{error::*, metainfo::Metainfo, PeerId, PieceIndex, Sha1Hash};

/// The immutable input the engine core is given for a single download:
/// everything it needs to know about the torrent's shape and identity, but
/// nothing about where peers live or how the descriptor itself was obtained
/// (that's `metainfo`/`magnet`/`tracker`'s job).
///
/// Invariants: `sum(piece_sizes) == total_length`; all digests are 20
/// bytes; `piece_digests[i]` is the expected digest of piece `i`.
#[derive(Clone, Debug)]
pub struct TorrentDescriptor {
    /// The 20 byte digest of the bencoded info dictionary; the torrent's
    /// identity.
    pub info_hash: Sha1Hash,
    /// The nominal length of a piece, in bytes. Only the last piece may be
    /// shorter.
    pub piece_length: u32,
    /// The total length of the payload, in bytes.
    pub total_length: u64,
    /// The ordered, 20-byte-per-entry expected digests of each piece.
    pub piece_digests: Vec<Sha1Hash>,
    /// Our own 20 byte peer id, announced in the handshake.
    pub local_peer_id: PeerId,
    /// An advisory name for the downloaded artefact; not used by the core.
    pub name: String,
}

impl TorrentDescriptor {
    /// Builds a descriptor from a parsed metainfo file and a local peer id.
    ///
    /// Only single-file torrents are supported; mapping pieces onto
    /// multiple files is out of this engine's scope.
    pub fn from_metainfo(
        metainfo: &Metainfo,
        local_peer_id: PeerId,
    ) -> Result<Self> {
        Self::from_info(metainfo.info_hash()?, &metainfo.info, local_peer_id)
    }

    /// Builds a descriptor directly from an `info` dictionary and a known
    /// info hash. Used both by [`Self::from_metainfo`] and by the magnet
    /// flow, where the `info` dictionary is instead recovered via the
    /// metadata fetcher and the info hash comes from the magnet link
    /// rather than being recomputed.
    pub(crate) fn from_info(
        info_hash: Sha1Hash,
        info: &crate::metainfo::Info,
        local_peer_id: PeerId,
    ) -> Result<Self> {
        let total_length = info.length.ok_or_else(|| {
            Error::Protocol(
                "multi-file torrents are not supported".to_string(),
            )
        })?;
        let piece_digests = info.piece_digests()?;
        let descriptor = Self {
            info_hash,
            piece_length: info.piece_length as u32,
            total_length,
            piece_digests,
            local_peer_id,
            name: info.name.clone(),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_digests.len()
    }

    /// Returns the length, in bytes, of the piece at `index`.
    ///
    /// Per the single fixed rule for the last piece's size: it is
    /// `total_length mod piece_length` when that remainder is nonzero, else
    /// `piece_length`. Every other piece is exactly `piece_length` long.
    pub fn piece_size(&self, index: PieceIndex) -> Result<u32> {
        let piece_count = self.piece_count();
        if index >= piece_count {
            return Err(Error::Protocol(format!(
                "piece index {} out of bounds ({} pieces)",
                index, piece_count
            )));
        }
        if index + 1 < piece_count {
            return Ok(self.piece_length);
        }
        let remainder = self.total_length % self.piece_length as u64;
        let last_len =
            if remainder != 0 { remainder } else { self.piece_length as u64 };
        Ok(last_len as u32)
    }

    /// Validates the invariants of the data model: there is at least one
    /// piece, and the piece sizes sum up to the total length.
    fn validate(&self) -> Result<()> {
        if self.piece_digests.is_empty() {
            return Err(Error::Protocol("torrent has no pieces".to_string()));
        }
        let sum: u64 = (0..self.piece_count())
            .map(|i| self.piece_size(i).map(u64::from))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .sum();
        if sum != self.total_length {
            return Err(Error::Protocol(format!(
                "piece sizes sum to {} but total length is {}",
                sum, self.total_length
            )));
        }
        Ok(())
    }
}

/// A peer's network address, as delivered by a tracker in compact form
/// (IPv4 only; see [`crate::tracker::parse_compact_peers`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerAddress(pub SocketAddr);

impl PeerAddress {
    /// Builds a peer address from a compact 4-byte IPv4 address and a
    /// 2-byte big endian port, as found in a tracker's compact peer list.
    pub fn from_ipv4_compact(ip: [u8; 4], port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
    }
}

impl From<PeerAddress> for SocketAddr {
    fn from(addr: PeerAddress) -> Self {
        addr.0
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(total_length: u64, piece_length: u32) -> TorrentDescriptor {
        let piece_count = ((total_length + piece_length as u64 - 1)
            / piece_length as u64) as usize;
        TorrentDescriptor {
            info_hash: [0; 20],
            piece_length,
            total_length,
            piece_digests: vec![[0; 20]; piece_count],
            local_peer_id: *b"-LT0001-000000000000",
            name: "test".to_string(),
        }
    }

    #[test]
    fn piece_size_is_nominal_except_for_last() {
        // 6 bytes in pieces of 4: last piece is 2 bytes.
        let d = descriptor(6, 4);
        assert_eq!(d.piece_count(), 2);
        assert_eq!(d.piece_size(0).unwrap(), 4);
        assert_eq!(d.piece_size(1).unwrap(), 2);
    }

    #[test]
    fn piece_size_is_full_when_evenly_divisible() {
        // 8 bytes in pieces of 4: both pieces are full length.
        let d = descriptor(8, 4);
        assert_eq!(d.piece_count(), 2);
        assert_eq!(d.piece_size(0).unwrap(), 4);
        assert_eq!(d.piece_size(1).unwrap(), 4);
    }

    #[test]
    fn piece_size_rejects_out_of_bounds_index() {
        let d = descriptor(6, 4);
        assert!(d.piece_size(2).is_err());
    }

    #[test]
    fn validate_rejects_mismatched_sum() {
        let mut d = descriptor(6, 4);
        d.piece_digests.push([0; 20]);
        assert!(d.validate().is_err());
    }
}
