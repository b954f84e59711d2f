//! The assembler: the terminal consumer of verified pieces.
//!
//! Collects `PieceResult`s off the scheduler's results channel until it
//! closes, re-verifies each one's digest as defence in depth, and hands
//! back the concatenated payload in index order.

use tokio::sync::mpsc;

use crate::{
    download::PieceResult,
    error::{Error, Result},
    TorrentDescriptor,
};

/// Drains `results` to completion and returns the reconstructed payload.
///
/// Fails with [`Error::IntegrityFailure`] if a result's bytes don't hash
/// to its expected digest (this should be unreachable, since the piece
/// worker already checked; this is kept as a defensive contract, not a
/// normal-path outcome) and with [`Error::Incomplete`] if
/// the channel closes before every piece has been verified.
pub(crate) async fn assemble(
    descriptor: &TorrentDescriptor,
    mut results: mpsc::Receiver<PieceResult>,
) -> Result<Vec<u8>> {
    let piece_count = descriptor.piece_count();
    let mut pieces: Vec<Option<Vec<u8>>> = vec![None; piece_count];
    let mut received = 0;

    while let Some(result) = results.recv().await {
        verify(descriptor, &result)?;
        if pieces[result.index].is_none() {
            received += 1;
        }
        pieces[result.index] = Some(result.bytes);
    }

    if received != piece_count {
        return Err(Error::Incomplete);
    }

    let mut payload = Vec::with_capacity(descriptor.total_length as usize);
    for piece in pieces {
        payload.extend(piece.expect("coverage checked above"));
    }
    Ok(payload)
}

fn verify(descriptor: &TorrentDescriptor, result: &PieceResult) -> Result<()> {
    use sha1::{Digest, Sha1};

    let expected = descriptor.piece_digests.get(result.index).ok_or_else(|| {
        Error::Protocol(format!(
            "assembler received out-of-range piece index {}",
            result.index
        ))
    })?;
    let digest = Sha1::digest(&result.bytes);
    if digest.as_slice() != *expected {
        return Err(Error::IntegrityFailure { index: result.index });
    }
    Ok(())
}
