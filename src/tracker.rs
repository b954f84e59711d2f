//! HTTP tracker announce and compact peer-list parsing.
//!
//! Like [`crate::metainfo`] and [`crate::magnet`], this is an external
//! collaborator: it turns a [`crate::TorrentDescriptor`] and our own
//! listening port into the `Vec<PeerAddress>` the engine core consumes.
//! UDP trackers and DHT are out of this engine's scope.

use std::time::Duration;

use crate::{error::Error, error::Result, PeerAddress, TorrentDescriptor};

/// The response of a tracker announce.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// How long to wait, in seconds, before the next announce.
    pub interval: Duration,
    /// The peers the tracker knows about for this torrent.
    pub peers: Vec<PeerAddress>,
}

/// The event accompanying an announce request, per the tracker HTTP
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
    /// A periodic announce with no event to report.
    None,
}

impl Event {
    fn as_str(self) -> Option<&'static str> {
        match self {
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
            Event::Completed => Some("completed"),
            Event::None => None,
        }
    }
}

/// Announces to an HTTP tracker and returns the peers it reports.
///
/// `port` is the port we advertise we're listening on for incoming peer
/// connections (this engine only ever makes outbound connections, but the
/// field is required by the tracker protocol).
pub fn announce(
    announce_url: &str,
    descriptor: &TorrentDescriptor,
    port: u16,
    uploaded: u64,
    downloaded: u64,
    event: Event,
) -> Result<AnnounceResponse> {
    let left = descriptor.total_length.saturating_sub(downloaded);

    let mut url = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        announce_url,
        percent_encode_bytes(&descriptor.info_hash),
        percent_encode_bytes(&descriptor.local_peer_id),
        port,
        uploaded,
        downloaded,
        left,
    );
    if let Some(event) = event.as_str() {
        url.push_str("&event=");
        url.push_str(event);
    }

    log::info!("Announcing to tracker {}", announce_url);
    let body = reqwest::blocking::get(&url)
        .map_err(|e| Error::Tracker(e.to_string()))?
        .bytes()
        .map_err(|e| Error::Tracker(e.to_string()))?;

    parse_announce_response(&body)
}

/// Percent-encodes raw bytes the way a tracker announce requires: every
/// byte that isn't an unreserved URL character is escaped, since
/// `info_hash` and `peer_id` are arbitrary 20-byte binary strings, not
/// text.
fn percent_encode_bytes(bytes: &[u8]) -> String {
    use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<i64>,
    #[serde(with = "serde_bytes", default)]
    peers: Vec<u8>,
}

fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse> {
    let raw: RawAnnounceResponse = serde_bencode::from_bytes(body)?;
    if let Some(reason) = raw.failure_reason {
        return Err(Error::Tracker(reason));
    }
    let interval =
        Duration::from_secs(raw.interval.unwrap_or(30 * 60).max(0) as u64);
    let peers = parse_compact_peers(&raw.peers)?;
    Ok(AnnounceResponse { interval, peers })
}

/// Parses the tracker's compact peer list: a concatenation of 6-byte
/// records, each 4 bytes of big-endian IPv4 address followed by 2 bytes of
/// big-endian port. Fails if the buffer's length isn't a multiple of 6.
pub fn parse_compact_peers(buf: &[u8]) -> Result<Vec<PeerAddress>> {
    if buf.len() % 6 != 0 {
        return Err(Error::Protocol(format!(
            "compact peer list length {} is not a multiple of 6",
            buf.len()
        )));
    }
    Ok(buf
        .chunks_exact(6)
        .map(|chunk| {
            let ip = [chunk[0], chunk[1], chunk[2], chunk[3]];
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerAddress::from_ipv4_compact(ip, port)
        })
        .collect())
}

/// Used only by tests to build a fixture bencoded tracker response.
#[cfg(test)]
fn encode_compact_peers(peers: &[PeerAddress]) -> serde_bytes::ByteBuf {
    let mut buf = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        if let std::net::SocketAddr::V4(addr) = peer.0 {
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    serde_bytes::ByteBuf::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peer_list() {
        let buf = [127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 5, 0x00, 0x50];
        let peers = parse_compact_peers(&buf).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].0.to_string(), "127.0.0.1:6881");
        assert_eq!(peers[1].0.to_string(), "10.0.0.5:80");
    }

    #[test]
    fn rejects_truncated_compact_peer_list() {
        let buf = [127, 0, 0, 1, 0x1A];
        assert!(parse_compact_peers(&buf).is_err());
    }

    #[test]
    fn parses_announce_response_roundtrip() {
        let peers = vec![
            PeerAddress::from_ipv4_compact([127, 0, 0, 1], 6881),
            PeerAddress::from_ipv4_compact([10, 0, 0, 5], 80),
        ];
        #[derive(Serialize)]
        struct Resp {
            interval: i64,
            #[serde(with = "serde_bytes")]
            peers: Vec<u8>,
        }
        let encoded = serde_bencode::to_bytes(&Resp {
            interval: 1800,
            peers: encode_compact_peers(&peers).into_vec(),
        })
        .unwrap();

        let parsed = parse_announce_response(&encoded).unwrap();
        assert_eq!(parsed.interval, Duration::from_secs(1800));
        assert_eq!(parsed.peers, peers);
    }

    #[test]
    fn surfaces_tracker_failure_reason() {
        #[derive(Serialize)]
        struct Resp {
            #[serde(rename = "failure reason")]
            failure_reason: String,
        }
        let encoded = serde_bencode::to_bytes(&Resp {
            failure_reason: "unregistered torrent".to_string(),
        })
        .unwrap();
        let err = parse_announce_response(&encoded).unwrap_err();
        assert!(matches!(err, Error::Tracker(_)));
    }

    #[test]
    fn announce_hits_the_tracker_and_parses_its_response() {
        let peers = vec![PeerAddress::from_ipv4_compact([127, 0, 0, 1], 6881)];
        #[derive(Serialize)]
        struct Resp {
            interval: i64,
            #[serde(with = "serde_bytes")]
            peers: Vec<u8>,
        }
        let body = serde_bencode::to_bytes(&Resp {
            interval: 900,
            peers: encode_compact_peers(&peers).into_vec(),
        })
        .unwrap();

        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", mockito::Matcher::Regex("^/announce.*".to_string()))
            .with_status(200)
            .with_body(body)
            .create();

        let descriptor = TorrentDescriptor {
            info_hash: [1; 20],
            piece_length: 4,
            total_length: 4,
            piece_digests: vec![[0; 20]],
            local_peer_id: *b"-LT0001-000000000000",
            name: "test".to_string(),
        };
        let announce_url = format!("{}/announce", server.url());
        let response = announce(
            &announce_url,
            &descriptor,
            6881,
            0,
            0,
            Event::Started,
        )
        .unwrap();

        assert_eq!(response.interval, Duration::from_secs(900));
        assert_eq!(response.peers, peers);
        mock.assert();
    }
}
