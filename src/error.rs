//! The crate-wide error type and a `Result` alias built around it.

use crate::PieceIndex;

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All the ways a download can fail, from a single frame read up to the
/// whole engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A transport read or write failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The length-prefix or layout rules of the wire protocol were
    /// violated (e.g. a handshake with the wrong protocol string length,
    /// a frame that didn't fit in its declared length).
    #[error("framing error: {0}")]
    Framing(String),

    /// A frame was structurally valid but semantically illegal at the
    /// point it was received (unexpected message in the current session
    /// state, a `piece` that doesn't match the outstanding request, a
    /// bitfield of the wrong length, an unknown message tag).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer's handshake announced a different info hash than ours.
    #[error("peer announced a mismatched info hash")]
    InfoHashMismatch,

    /// A downloaded piece's SHA-1 digest didn't match the expected one.
    #[error("piece {index} failed digest verification")]
    DigestMismatch { index: PieceIndex },

    /// The magnet/metadata flow could not recover a valid info dictionary
    /// from any peer.
    #[error("failed to fetch torrent metadata from any peer")]
    MetadataFailed,

    /// The scheduler or assembler terminated before every piece was
    /// verified, typically due to cancellation.
    #[error("download incomplete")]
    Incomplete,

    /// The assembler's defence-in-depth re-check of a piece's digest
    /// failed. Unreachable if workers enforce piece verification
    /// correctly; kept as a defensive contract.
    #[error("assembler integrity check failed for piece {index}")]
    IntegrityFailure { index: PieceIndex },

    /// A bencoded structure (metainfo, tracker response, extension
    /// handshake, ut_metadata message) failed to decode or encode.
    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// A magnet link could not be parsed.
    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    /// The tracker announce failed or returned a failure reason.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// An internal channel was closed while we still expected to use it.
    #[error("internal channel closed")]
    ChannelClosed,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
