//! The top-level entry point tying the engine's peer-swarm download core
//! to its external collaborators: given a torrent descriptor (or a
//! magnet link it must first resolve into one) and a candidate peer
//! list, runs the handshake/metadata/download/assembly pipeline to
//! completion and returns the verified payload.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    assembler, conf::Conf, error::Result, magnet, metainfo, peer::PeerSession,
    peer::metadata::fetch_metadata, torrent, Cancellation, PeerAddress,
    Sha1Hash, TorrentDescriptor,
};

/// An arbitrary but generous ceiling on how long a single peer connect
/// attempt (TCP + handshake) may take before being abandoned in favour of
/// the next candidate.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs torrent downloads according to a given [`Conf`].
pub struct Engine {
    conf: Conf,
}

impl Engine {
    pub fn new(conf: Conf) -> Self {
        Self { conf }
    }

    /// Downloads a torrent whose descriptor is already fully known (the
    /// ordinary `.torrent`-file flow: parse with [`metainfo`], build a
    /// descriptor, then call this).
    ///
    /// `peers` is the candidate peer list (typically from a tracker
    /// announce); connections are attempted up to
    /// `conf.torrent.max_connected_peer_count` of them concurrently.
    /// `cancellation` is the caller's handle for external cancellation:
    /// hold onto a clone and call [`Cancellation::signal`] from another
    /// task to abort the download early, in which case this returns
    /// [`crate::error::Error::Incomplete`].
    pub async fn download(
        &self,
        descriptor: TorrentDescriptor,
        peers: Vec<PeerAddress>,
        cancellation: Cancellation,
    ) -> Result<Vec<u8>> {
        let info_hash = descriptor.info_hash;
        let num_pieces = descriptor.piece_count();
        let descriptor = Arc::new(descriptor);

        let candidate_count = peers.len();
        let sessions =
            self.connect_sessions(info_hash, peers, Some(num_pieces)).await;
        log::info!(
            "Connected to {} of {} candidate peers",
            sessions.len(),
            candidate_count
        );

        let results_rx = torrent::run(
            Arc::clone(&descriptor),
            sessions,
            self.conf.torrent.request_timeout,
            self.conf.torrent.piece_requeue_cooldown,
            cancellation,
        )
        .await?;

        assembler::assemble(&descriptor, results_rx).await
    }

    /// Downloads a torrent starting only from a magnet link: connects to
    /// the candidate peers,
    /// fetches the `info` dictionary from the first one that supports and
    /// completes the `ut_metadata` extension, then proceeds exactly as
    /// [`Self::download`] using the recovered descriptor and whatever
    /// peers are still connected (plus the one that served metadata).
    pub async fn download_magnet(
        &self,
        magnet_uri: &str,
        peers: Vec<PeerAddress>,
        cancellation: Cancellation,
    ) -> Result<Vec<u8>> {
        let magnet = magnet::parse(magnet_uri)?;
        let info_hash = magnet.info_hash();

        let mut sessions =
            self.connect_sessions(info_hash, peers, None).await;

        let mut metadata_source = None;
        while let Some(mut session) = sessions.pop() {
            if session.metadata_size().is_none() {
                // peer didn't advertise the extension handshake's
                // metadata_size field; it can't serve us the info
                // dictionary.
                continue;
            }
            match fetch_metadata(
                &mut session,
                info_hash,
                self.conf.torrent.request_timeout,
            )
            .await
            {
                Ok(bytes) => {
                    metadata_source = Some((bytes, session));
                    break;
                }
                Err(err) => {
                    log::warn!(
                        "Peer {} failed to supply metadata: {}",
                        session.addr(),
                        err
                    );
                    session.close();
                }
            }
        }

        let (info_bytes, first_session) =
            metadata_source.ok_or(crate::error::Error::MetadataFailed)?;
        let info = metainfo::decode_info(&info_bytes)?;
        let descriptor = TorrentDescriptor::from_info(
            info_hash,
            &info,
            self.conf.engine.client_id,
        )?;
        let num_pieces = descriptor.piece_count();
        let descriptor = Arc::new(descriptor);

        let mut ready_sessions = Vec::with_capacity(sessions.len() + 1);
        for mut session in std::iter::once(first_session).chain(sessions) {
            if session.set_num_pieces(num_pieces).is_ok() {
                ready_sessions.push(session);
            }
        }

        let results_rx = torrent::run(
            Arc::clone(&descriptor),
            ready_sessions,
            self.conf.torrent.request_timeout,
            self.conf.torrent.piece_requeue_cooldown,
            cancellation,
        )
        .await?;

        assembler::assemble(&descriptor, results_rx).await
    }

    /// Connects to as many of `peers` as `conf.torrent.max_connected_peer_count`
    /// allows, in parallel, discarding ones that fail to connect,
    /// handshake, or (if `num_pieces` is already known) supply a valid
    /// bitfield.
    async fn connect_sessions(
        &self,
        info_hash: Sha1Hash,
        peers: Vec<PeerAddress>,
        num_pieces: Option<usize>,
    ) -> Vec<PeerSession> {
        let client_id = self.conf.engine.client_id;
        let max = self.conf.torrent.max_connected_peer_count;

        let attempts = peers.into_iter().take(max).map(|peer| {
            let addr: SocketAddr = peer.into();
            async move {
                let mut session =
                    PeerSession::outbound(addr, client_id, info_hash);
                if let Err(err) = session.connect(CONNECT_TIMEOUT).await {
                    log::warn!(
                        "Failed to connect to peer {}: {}",
                        addr,
                        err
                    );
                    return None;
                }
                if let Some(num_pieces) = num_pieces {
                    if let Err(err) = session.set_num_pieces(num_pieces) {
                        log::warn!(
                            "Peer {} sent an invalid bitfield: {}",
                            addr,
                            err
                        );
                        return None;
                    }
                }
                Some(session)
            }
        });

        futures::future::join_all(attempts).await.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{
        codec::{Handshake, HandshakeCodec, Message, PeerCodec},
        extension::ExtensionBits,
    };
    use crate::Bitfield;
    use futures::{SinkExt, StreamExt};
    use sha1::{Digest, Sha1};
    use tokio::net::TcpListener;
    use tokio_util::codec::{Framed, FramedParts};

    const INFO_HASH: Sha1Hash = [5; 20];
    const OUR_ID: crate::PeerId = *b"-LT0001-000000000001";
    const PEER_ID: crate::PeerId = *b"-LT0001-000000000002";

    fn sha1_hash(data: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(data);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        out
    }

    /// End-to-end single-peer, single-piece download, driven through the
    /// public [`Engine::download`] entry point against a hand-rolled fake
    /// peer on a loopback socket.
    #[tokio::test]
    async fn downloads_single_piece_from_single_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut handshake_socket = Framed::new(stream, HandshakeCodec);
            let _ = handshake_socket.next().await.unwrap().unwrap();
            let ours = Handshake::new(INFO_HASH, PEER_ID, ExtensionBits::none());
            handshake_socket.send(ours).await.unwrap();
            let parts = handshake_socket.into_parts();
            let parts = FramedParts::new(parts.io, PeerCodec);
            let mut socket = Framed::from_parts(parts);

            let mut bitfield: Bitfield = std::iter::repeat(false).take(1).collect();
            bitfield.set(0, true);
            socket.send(Message::Bitfield(bitfield)).await.unwrap();
            socket.send(Message::Unchoke).await.unwrap();

            loop {
                match socket.next().await.unwrap().unwrap() {
                    Message::Interested => {}
                    Message::Request(block) => {
                        socket
                            .send(Message::Block {
                                piece_index: block.piece_index,
                                offset: block.offset,
                                data: b"ABCD".to_vec(),
                            })
                            .await
                            .unwrap();
                        break;
                    }
                    other => panic!("unexpected message from engine: {:?}", other),
                }
            }
        });

        let descriptor = TorrentDescriptor {
            info_hash: INFO_HASH,
            piece_length: 4,
            total_length: 4,
            piece_digests: vec![sha1_hash(b"ABCD")],
            local_peer_id: OUR_ID,
            name: "test".to_string(),
        };

        let engine = Engine::new(Conf::new());
        let payload = engine
            .download(descriptor, vec![PeerAddress(addr)], Cancellation::new())
            .await
            .unwrap();
        assert_eq!(payload, b"ABCD");

        peer_task.await.unwrap();
    }

    /// External cancellation: a peer that never
    /// answers the only piece's request leaves the download stuck mid-flight
    /// until the caller signals cancellation, at which point it must
    /// resolve as incomplete rather than hang.
    #[tokio::test]
    async fn external_cancellation_unsticks_a_stalled_download() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut handshake_socket = Framed::new(stream, HandshakeCodec);
            let _ = handshake_socket.next().await.unwrap().unwrap();
            let ours = Handshake::new(INFO_HASH, PEER_ID, ExtensionBits::none());
            handshake_socket.send(ours).await.unwrap();
            let parts = handshake_socket.into_parts();
            let parts = FramedParts::new(parts.io, PeerCodec);
            let mut socket = Framed::from_parts(parts);

            let mut bitfield: Bitfield = std::iter::repeat(false).take(1).collect();
            bitfield.set(0, true);
            socket.send(Message::Bitfield(bitfield)).await.unwrap();
            socket.send(Message::Unchoke).await.unwrap();
            // receives the request but never answers it; just keeps the
            // socket open until dropped at the end of the test.
            let _ = socket.next().await.unwrap().unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let descriptor = TorrentDescriptor {
            info_hash: INFO_HASH,
            piece_length: 4,
            total_length: 4,
            piece_digests: vec![sha1_hash(b"ABCD")],
            local_peer_id: OUR_ID,
            name: "test".to_string(),
        };

        let mut conf = Conf::new();
        conf.torrent.request_timeout = Duration::from_secs(60);
        let engine = Engine::new(conf);
        let cancellation = Cancellation::new();
        let canceller = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.signal();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            engine.download(descriptor, vec![PeerAddress(addr)], cancellation),
        )
        .await
        .expect("cancellation must unstick the download well within the request timeout");
        assert!(matches!(result, Err(crate::error::Error::Incomplete)));

        peer_task.abort();
    }
}
