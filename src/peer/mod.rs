//! The peer session: owns a single peer's TCP connection from handshake
//! through the ordinary message exchange, tracking just enough protocol
//! state (choke/interest, piece availability, extension support) for the
//! piece worker and metadata fetcher built on top of it.

pub mod codec;
pub mod extension;
pub mod metadata;

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    error::{Error, Result},
    peer::{
        codec::{
            validate_bitfield, Handshake, HandshakeCodec, Message, PeerCodec,
            PROTOCOL_STRING,
        },
        extension::{ExtensionBits, ExtensionHandshake},
    },
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The choke/interest state of both ends of the connection. Both sides
/// start choked and uninterested.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Status {
    /// Whether the peer is choking us.
    pub is_choked: bool,
    /// Whether we've told the peer we're interested.
    pub is_interested: bool,
    /// Whether the peer has told us it's interested in us.
    pub is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: false,
            is_peer_interested: false,
        }
    }
}

/// An established, handshaken connection to a single peer.
///
/// This engine only ever leeches, never seeds, so there is no symmetric
/// "are we choking the peer" state to track: we always are, implicitly.
pub(crate) struct PeerSession {
    addr: SocketAddr,
    own_id: PeerId,
    info_hash: Sha1Hash,
    state: State,
    status: Status,
    /// The peer's announced id, learned from its handshake.
    peer_id: Option<PeerId>,
    /// The peer's piece availability, once known.
    bitfield: Option<Bitfield>,
    /// A bitfield received before we knew the torrent's piece count,
    /// pending validation (can happen during the metadata-fetch phase).
    pending_bitfield_bytes: Option<Vec<u8>>,
    num_pieces: Option<usize>,
    /// The peer's BEP 10 extension handshake, once received.
    peer_extension: Option<ExtensionHandshake>,
    socket: Option<Framed<TcpStream, PeerCodec>>,
}

impl PeerSession {
    /// Creates a session for an outbound connection that hasn't connected
    /// yet.
    pub fn outbound(addr: SocketAddr, own_id: PeerId, info_hash: Sha1Hash) -> Self {
        Self {
            addr,
            own_id,
            info_hash,
            state: State::default(),
            status: Status::default(),
            peer_id: None,
            bitfield: None,
            pending_bitfield_bytes: None,
            num_pieces: None,
            peer_extension: None,
            socket: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Tells the session the torrent's piece count, once known. The
    /// metadata fetcher connects before this is known; the swarm
    /// scheduler calls this once the `info` dictionary is in hand, at
    /// which point any bitfield that arrived early is validated
    /// retroactively.
    pub fn set_num_pieces(&mut self, num_pieces: usize) -> Result<()> {
        self.num_pieces = Some(num_pieces);
        if let Some(bytes) = self.pending_bitfield_bytes.take() {
            self.store_bitfield(Bitfield::from_vec(bytes))?;
        }
        Ok(())
    }

    /// Dials the peer, performs the BitTorrent handshake, and if the peer
    /// supports BEP 10, sends our extension handshake. On return the
    /// session is ready for [`Self::recv_frame`] and the `send_*` methods.
    pub async fn connect(&mut self, connect_timeout: std::time::Duration) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.state = State::Connecting;
        let socket = timeout(connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::Protocol("connect timed out".to_string()))??;
        log::info!("Connected to peer {}", self.addr);

        let mut handshake_socket = Framed::new(socket, HandshakeCodec);

        self.state = State::Handshaking;
        let handshake = Handshake::new(
            self.info_hash,
            self.own_id,
            ExtensionBits::with_extension_protocol(),
        );
        log::info!("Sending handshake to peer {}", self.addr);
        handshake_socket.send(handshake).await?;

        log::info!("Awaiting handshake from peer {}", self.addr);
        let peer_handshake =
            handshake_socket.next().await.ok_or(Error::ChannelClosed)??;
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        if peer_handshake.info_hash != self.info_hash {
            log::warn!("Peer {} sent mismatched info hash", self.addr);
            return Err(Error::InfoHashMismatch);
        }
        self.peer_id = Some(peer_handshake.peer_id);

        // switch to the ordinary message codec now that the handshake is
        // done, reusing the buffers in case either side already has data
        // from the other sitting in them
        let old_parts = handshake_socket.into_parts();
        let mut parts = FramedParts::new(old_parts.io, PeerCodec);
        parts.read_buf = old_parts.read_buf;
        parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(parts);

        if peer_handshake.reserved.supports_extension_protocol() {
            let ours = ExtensionHandshake::ours(None);
            let payload = ours.to_bytes()?;
            socket.send(Message::Extended { id: 0, payload }).await?;
        }

        self.state = State::Connected;
        self.socket = Some(socket);
        log::info!("Peer {} session state: {:?}", self.addr, self.state);
        Ok(())
    }

    fn socket_mut(&mut self) -> Result<&mut Framed<TcpStream, PeerCodec>> {
        self.socket.as_mut().ok_or(Error::ChannelClosed)
    }

    /// Receives the next message, applying its effect to the session's
    /// protocol state (choke/interest, piece availability, extension
    /// handshake) before handing it back to the caller. Returns `Ok(None)`
    /// if the connection closed cleanly.
    pub async fn recv_frame(&mut self) -> Result<Option<Message>> {
        let socket = self.socket_mut()?;
        let msg = match socket.next().await {
            Some(msg) => msg?,
            None => {
                self.state = State::Disconnected;
                return Ok(None);
            }
        };

        match &msg {
            Message::KeepAlive => {}
            Message::Choke => self.status.is_choked = true,
            Message::Unchoke => self.status.is_choked = false,
            Message::Interested => self.status.is_peer_interested = true,
            Message::NotInterested => self.status.is_peer_interested = false,
            Message::Have(index) => self.record_have(*index)?,
            Message::Bitfield(bitfield) => self.store_bitfield(bitfield.clone())?,
            Message::Extended { id: 0, payload } => {
                let handshake = ExtensionHandshake::from_bytes(payload)?;
                log::debug!(
                    "Peer {} extension handshake: {:?}",
                    self.addr,
                    handshake
                );
                self.peer_extension = Some(handshake);
            }
            Message::Extended { .. }
            | Message::Request(_)
            | Message::Block { .. }
            | Message::Cancel(_) => {}
        }

        log::debug!("Received from peer {}: {:?}", self.addr, msg);
        Ok(Some(msg))
    }

    fn record_have(&mut self, index: PieceIndex) -> Result<()> {
        // if we don't yet know the piece count (metadata-fetch phase) have
        // messages carry no information we can use yet, so they're
        // silently dropped.
        if let Some(num_pieces) = self.num_pieces {
            let bitfield = self.bitfield.get_or_insert_with(|| {
                std::iter::repeat(false).take(num_pieces).collect()
            });
            if index >= bitfield.len() {
                return Err(Error::Protocol(format!(
                    "peer {} announced have for out-of-range piece {}",
                    self.addr, index
                )));
            }
            bitfield.set(index, true);
        }
        Ok(())
    }

    fn store_bitfield(&mut self, bitfield: Bitfield) -> Result<()> {
        match self.num_pieces {
            Some(num_pieces) => {
                validate_bitfield(&bitfield, num_pieces)?;
                self.bitfield = Some(bitfield);
            }
            None => self.pending_bitfield_bytes = Some(bitfield.into_vec()),
        }
        Ok(())
    }

    /// Whether the peer has announced piece `index`. `false` if we don't
    /// yet have any availability information for the peer.
    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.bitfield
            .as_ref()
            .map(|b| b.get(index).map(|bit| *bit).unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn is_choked(&self) -> bool {
        self.status.is_choked
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    /// The peer's advertised `ut_metadata` message id, if it supports the
    /// extension.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.peer_extension.as_ref().and_then(|e| e.ut_metadata_id())
    }

    /// The size of the `info` dictionary the peer has advertised, if any.
    pub fn metadata_size(&self) -> Option<u64> {
        self.peer_extension.as_ref().and_then(|e| e.metadata_size)
    }

    pub async fn send_interested(&mut self) -> Result<()> {
        self.status.is_interested = true;
        self.socket_mut()?.send(Message::Interested).await
    }

    pub async fn send_not_interested(&mut self) -> Result<()> {
        self.status.is_interested = false;
        self.socket_mut()?.send(Message::NotInterested).await
    }

    pub async fn send_request(&mut self, block: BlockInfo) -> Result<()> {
        self.socket_mut()?.send(Message::Request(block)).await
    }

    /// Sends a raw extended message with the given sub-id. Used to talk
    /// `ut_metadata` once the peer's message id for it is known, via
    /// [`Self::ut_metadata_id`].
    pub async fn send_extended(&mut self, id: u8, payload: Vec<u8>) -> Result<()> {
        self.socket_mut()?.send(Message::Extended { id, payload }).await
    }

    pub fn close(&mut self) {
        self.socket = None;
        self.state = State::Disconnected;
    }
}
