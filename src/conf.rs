//! This module defines types used to configure the engine and its parts.

use std::time::Duration;

use crate::PeerId;

/// The default leechtorrent client id.
pub const LEECHTORRENT_CLIENT_ID: &PeerId = b"-LT0001-000000000000";

/// The advisory client name/version we report in the BEP 10 extension
/// handshake's `v` field.
pub const CLIENT_VERSION: &str = "leechtorrent/0.1.0";

/// The fixed Azureus-style prefix every generated peer id starts with,
/// identifying this client to the rest of the swarm (BEP 20).
const CLIENT_ID_PREFIX: &[u8; 8] = b"-LT0001-";

/// Generates a fresh peer id: the fixed client prefix followed by 12
/// random bytes, so that running multiple instances of the engine (or
/// repeated downloads by the same instance) don't collide in a swarm
/// that keys peers by id.
pub fn generate_peer_id() -> PeerId {
    use rand::Rng;
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    rand::thread_rng().fill(&mut id[8..]);
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, using the
    /// default leechtorrent client id, [`LEECHTORRENT_CLIENT_ID`].
    pub fn new() -> Self {
        Self {
            engine: EngineConf { client_id: *LEECHTORRENT_CLIENT_ID },
            torrent: TorrentConf::new(),
        }
    }

    /// Like [`Self::new`], but with a freshly randomised client id
    /// ([`generate_peer_id`]) instead of the fixed default. Prefer this for
    /// a real download; the fixed id is mainly useful for deterministic
    /// tests.
    pub fn with_random_client_id() -> Self {
        Self {
            engine: EngineConf { client_id: generate_peer_id() },
            torrent: TorrentConf::new(),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent download.
///
/// The engine applies a default instance of this to all torrents, but
/// individual torrents may override it.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The minimum number of peers we want to keep in the swarm at all
    /// times. This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we
    /// default to announcing every 30 minutes.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a
    /// tracker.
    pub tracker_error_threshold: usize,

    /// The deadline placed on a single transport read or write while a
    /// piece worker is waiting on a peer. A peer that misses this deadline
    /// is treated the same as one that errored: the in-flight task is
    /// re-enqueued.
    pub request_timeout: Duration,

    /// How long a worker waits before retrying after finding that the
    /// piece at the head of the task queue isn't one its peer advertises.
    /// Any value greater than zero is correctness-neutral; this is tuned
    /// purely to avoid a tight livelock loop.
    pub piece_requeue_cooldown: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults.
    pub fn new() -> Self {
        Self {
            // We always request at least 10 peers as anything less is a
            // waste of network round trip and it allows us to buffer up a
            // bit more than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs testing
            announce_interval: Duration::from_secs(30 * 60),
            // needs testing
            tracker_error_threshold: 15,
            request_timeout: Duration::from_secs(30),
            piece_requeue_cooldown: Duration::from_secs(1),
        }
    }
}

impl Default for TorrentConf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn generated_peer_ids_share_the_client_prefix_but_not_the_suffix() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_eq!(&a[..8], &CLIENT_ID_PREFIX[..]);
        assert_eq!(&b[..8], &CLIENT_ID_PREFIX[..]);
        assert_ne!(a, b);
    }

    #[test]
    fn with_random_client_id_does_not_reuse_the_fixed_default() {
        let conf = Conf::with_random_client_id();
        assert_ne!(conf.engine.client_id, *LEECHTORRENT_CLIENT_ID);
    }
}
