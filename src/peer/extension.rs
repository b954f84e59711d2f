//! BEP 10 extension protocol handshake: the extension bits carried in the
//! handshake's 8 reserved bytes, and the bencoded `m` dictionary
//! exchanged afterwards to negotiate per-extension message IDs.

use std::collections::HashMap;

use crate::error::Result;

/// The 8 reserved handshake bytes, interpreted as a bit field.
///
/// Only bit 20 (counting from the low end of the 64-bit field, as BEP 10
/// defines it) is meaningful to this engine: it signals support for the
/// extension protocol. That bit lands in byte index 5 (counting from 0)
/// of the 8 bytes, as its `0x10` bit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ExtensionBits(pub [u8; 8]);

impl ExtensionBits {
    const EXTENSION_PROTOCOL_BYTE: usize = 5;
    const EXTENSION_PROTOCOL_MASK: u8 = 0x10;

    /// Extension bits with no bits set.
    pub fn none() -> Self {
        Self([0; 8])
    }

    /// Extension bits with just the BEP 10 extension protocol bit set.
    pub fn with_extension_protocol() -> Self {
        let mut bits = Self::none();
        bits.set_extension_protocol();
        bits
    }

    pub fn set_extension_protocol(&mut self) {
        self.0[Self::EXTENSION_PROTOCOL_BYTE] |= Self::EXTENSION_PROTOCOL_MASK;
    }

    /// Whether the BEP 10 extension protocol bit is set.
    pub fn supports_extension_protocol(&self) -> bool {
        self.0[Self::EXTENSION_PROTOCOL_BYTE] & Self::EXTENSION_PROTOCOL_MASK
            != 0
    }
}

/// The bencoded dictionary carried as the payload of extended message id 0
/// (the extension handshake), per BEP 10.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ExtensionHandshake {
    /// Maps an extension's name (e.g. `"ut_metadata"`) to the local
    /// message id the sender wants to use for it.
    pub m: HashMap<String, u8>,
    /// The size, in bytes, of the bencoded `info` dictionary, present once
    /// the sender knows it. Absent from the first handshake a magnet-only
    /// peer sends.
    #[serde(rename = "metadata_size")]
    pub metadata_size: Option<u64>,
    /// An advisory human-readable client name/version.
    pub v: Option<String>,
}

impl ExtensionHandshake {
    /// The extension name this engine requests under, matching BEP 9's
    /// canonical name.
    pub const UT_METADATA: &'static str = "ut_metadata";

    /// Builds the handshake this engine sends: it always offers
    /// `ut_metadata` under a fixed local id, and if it already has the
    /// `info` dictionary's size (serving, not fetching, metadata) includes
    /// it.
    pub fn ours(metadata_size: Option<u64>) -> Self {
        let mut m = HashMap::new();
        m.insert(Self::UT_METADATA.to_string(), UT_METADATA_ID);
        Self { m, metadata_size, v: Some(crate::conf::CLIENT_VERSION.to_string()) }
    }

    /// The peer's advertised message id for `ut_metadata`, if it supports
    /// the extension.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m.get(Self::UT_METADATA).copied()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }
}

/// The local message id this engine always advertises for `ut_metadata`.
/// Since we both send and interpret our own handshake's `m` dictionary,
/// any stable value works; this one simply avoids colliding with the
/// reserved extended handshake id 0.
pub(crate) const UT_METADATA_ID: u8 = 1;
