//! Parsing of BitTorrent v1 magnet links.
//!
//! This, like [`crate::metainfo`] and [`crate::tracker`], is a collaborator
//! that feeds the engine core a piece of the torrent descriptor (here, just
//! the info hash and an advisory name); it is not part of the core itself.
//! Only the v1 (`urn:btih:`) magnet form is supported, matching this
//! engine's BitTorrent v1 scope.

use url::Url;

use crate::{error::Error, error::Result, Sha1Hash};

/// A parsed BitTorrent v1 magnet link:
/// `magnet:?xt=urn:btih:<info-hash>&dn=<name>&tr=<tracker-url>...`.
#[derive(Debug, Clone)]
pub struct Magnet {
    info_hash: Sha1Hash,
    display_name: Option<String>,
    trackers: Vec<Url>,
}

impl Magnet {
    /// The torrent's info hash, as carried in the magnet's `xt` parameter.
    pub fn info_hash(&self) -> Sha1Hash {
        self.info_hash
    }

    /// The advisory display name from the `dn` parameter, if present.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// The tracker announce URLs from the `tr` parameters, if any.
    pub fn trackers(&self) -> &[Url] {
        &self.trackers
    }
}

/// Parses a magnet URI.
///
/// Fails with [`Error::InvalidMagnet`] if the URI isn't a valid `magnet:`
/// URL, if it lacks a `xt=urn:btih:` info hash, or if that hash isn't a
/// 40-character hex string or 32-character base32 string (the two forms
/// BEP 9 allows).
pub fn parse(magnet: &str) -> Result<Magnet> {
    let url = Url::parse(magnet)
        .map_err(|e| Error::InvalidMagnet(format!("not a valid URI: {}", e)))?;
    if url.scheme() != "magnet" {
        return Err(Error::InvalidMagnet(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }

    let mut info_hash_str = None;
    let mut display_name = None;
    let mut trackers = Vec::new();
    for (key, value) in url.query_pairs() {
        match &*key {
            "xt" => {
                let xt = value.strip_prefix("urn:btih:").ok_or_else(|| {
                    if value.starts_with("urn:btmh:") {
                        Error::InvalidMagnet(
                            "v2 (btmh) magnet links are not supported"
                                .to_string(),
                        )
                    } else {
                        Error::InvalidMagnet(format!(
                            "unrecognised xt parameter {}",
                            value
                        ))
                    }
                })?;
                info_hash_str = Some(xt.to_string());
            }
            "dn" => display_name = Some(value.into_owned()),
            "tr" => {
                let tracker = Url::parse(&value).map_err(|e| {
                    Error::InvalidMagnet(format!(
                        "invalid tracker url {}: {}",
                        value, e
                    ))
                })?;
                trackers.push(tracker);
            }
            _ => {}
        }
    }

    let info_hash_str = info_hash_str.ok_or_else(|| {
        Error::InvalidMagnet("missing xt=urn:btih: parameter".to_string())
    })?;
    let info_hash = decode_info_hash(&info_hash_str)?;

    Ok(Magnet { info_hash, display_name, trackers })
}

/// Decodes an info hash that is either 40 hex characters or 32 base32
/// characters, the two encodings BEP 9 allows in a magnet's `xt`.
fn decode_info_hash(s: &str) -> Result<Sha1Hash> {
    let bytes = match s.len() {
        40 => hex::decode(s).map_err(|e| {
            Error::InvalidMagnet(format!("invalid hex info hash: {}", e))
        })?,
        32 => base32_decode(s).ok_or_else(|| {
            Error::InvalidMagnet("invalid base32 info hash".to_string())
        })?,
        n => {
            return Err(Error::InvalidMagnet(format!(
                "info hash must be 40 hex or 32 base32 characters, got {}",
                n
            )))
        }
    };
    if bytes.len() != 20 {
        return Err(Error::InvalidMagnet(format!(
            "decoded info hash is {} bytes, expected 20",
            bytes.len()
        )));
    }
    let mut info_hash = [0; 20];
    info_hash.copy_from_slice(&bytes);
    Ok(info_hash)
}

/// Decodes a RFC 4648 base32 string (no padding), the form BEP 9 uses for
/// the 32-character info hash alternative.
fn base32_decode(s: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u64 = 0;
    let mut bit_count = 0;
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    for c in s.to_ascii_uppercase().bytes() {
        let value = ALPHABET.iter().position(|&b| b == c)? as u64;
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    const HEX_MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=example&tr=http%3A%2F%2Ftracker.example%2Fannounce";

    #[test]
    fn parses_hex_info_hash_name_and_tracker() {
        let magnet = parse(HEX_MAGNET).unwrap();
        assert_eq!(
            magnet.info_hash(),
            hex::decode("0123456789abcdef0123456789abcdef01234567")
                .unwrap()
                .try_into()
                .unwrap()
        );
        assert_eq!(magnet.display_name(), Some("example"));
        assert_eq!(magnet.trackers().len(), 1);
        assert_eq!(magnet.trackers()[0].as_str(), "http://tracker.example/announce");
    }

    #[test]
    fn rejects_missing_xt() {
        assert!(parse("magnet:?dn=example").is_err());
    }

    #[test]
    fn rejects_v2_magnet() {
        let uri = "magnet:?xt=urn:btmh:1220deadbeef";
        assert!(parse(uri).is_err());
    }

    #[test]
    fn rejects_malformed_uri() {
        assert!(parse("not a uri").is_err());
    }

    #[test]
    fn accepts_magnet_without_tracker_or_name() {
        let magnet = parse(
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
        )
        .unwrap();
        assert_eq!(magnet.display_name(), None);
        assert!(magnet.trackers().is_empty());
    }
}
