//! Identity and ordering types for Dispersy.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Length of a member or community digest in bytes.
pub const DIGEST_LEN: usize = 20;

fn digest(public_key: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(public_key);
    let result = hasher.finalize();
    let mut bytes = [0u8; DIGEST_LEN];
    bytes.copy_from_slice(&result);
    bytes
}

fn array_from(bytes: &[u8]) -> Option<[u8; DIGEST_LEN]> {
    if bytes.len() == DIGEST_LEN {
        let mut arr = [0u8; DIGEST_LEN];
        arr.copy_from_slice(bytes);
        Some(arr)
    } else {
        None
    }
}

/// The 20-byte digest of a member's public key.
///
/// Different public keys may collide on the same mid, so a mid alone never
/// identifies a member with certainty.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mid([u8; DIGEST_LEN]);

impl Mid {
    /// Derive the mid of a public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(digest(public_key))
    }

    /// Create a Mid from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        array_from(bytes).map(Self)
    }

    /// Get the raw bytes of this Mid.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, as used in footprints.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mid({})", &self.to_hex()[..8])
    }
}

/// A community identifier: the digest of the master member's public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cid([u8; DIGEST_LEN]);

impl Cid {
    /// Derive the cid from the master member's public key.
    pub fn from_master_key(public_key: &[u8]) -> Self {
        Self(digest(public_key))
    }

    /// Create a Cid from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        array_from(bytes).map(Self)
    }

    /// Get the raw bytes of this Cid.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, as used in footprints.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The master member's mid, which always equals the cid.
    pub fn as_mid(&self) -> Mid {
        Mid(self.0)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", &self.to_hex()[..8])
    }
}

/// A per-community logical clock value.
///
/// Global time only ever moves forward. Zero means "nothing claimed yet";
/// the first claimed value is one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct GlobalTime(u64);

impl GlobalTime {
    /// Create a GlobalTime with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this GlobalTime.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The time before anything was claimed.
    pub fn zero() -> Self {
        Self(0)
    }

    /// The next tick of the clock.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for GlobalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for GlobalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTime({})", self.0)
    }
}

/// Length of a conversion prefix: cid plus two version bytes.
pub const PREFIX_LEN: usize = DIGEST_LEN + 2;

/// The first 22 bytes of every packet: community id and conversion version.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversionPrefix {
    cid: Cid,
    version: [u8; 2],
}

impl ConversionPrefix {
    /// Build the prefix for a community and conversion version.
    pub fn new(cid: Cid, version: [u8; 2]) -> Self {
        Self { cid, version }
    }

    /// Parse the prefix from the start of a packet.
    pub fn from_packet(packet: &[u8]) -> Option<Self> {
        if packet.len() < PREFIX_LEN {
            return None;
        }
        let cid = Cid::from_bytes(&packet[..DIGEST_LEN])?;
        let version = [packet[DIGEST_LEN], packet[DIGEST_LEN + 1]];
        Some(Self { cid, version })
    }

    /// The community this prefix addresses.
    pub fn cid(&self) -> Cid {
        self.cid
    }

    /// The conversion version bytes.
    pub fn version(&self) -> [u8; 2] {
        self.version
    }

    /// The 22 raw bytes.
    pub fn to_bytes(&self) -> [u8; PREFIX_LEN] {
        let mut bytes = [0u8; PREFIX_LEN];
        bytes[..DIGEST_LEN].copy_from_slice(self.cid.as_bytes());
        bytes[DIGEST_LEN..].copy_from_slice(&self.version);
        bytes
    }
}

impl fmt::Debug for ConversionPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConversionPrefix({:?}, v{})",
            self.cid,
            hex::encode(self.version)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mid_is_twenty_bytes_of_sha1() {
        let mid = Mid::from_public_key(b"some public key");
        assert_eq!(mid.as_bytes().len(), 20);
        assert_eq!(mid.to_hex().len(), 40);
    }

    #[test]
    fn mid_deterministic() {
        assert_eq!(Mid::from_public_key(b"key"), Mid::from_public_key(b"key"));
        assert_ne!(Mid::from_public_key(b"key-1"), Mid::from_public_key(b"key-2"));
    }

    #[test]
    fn mid_from_invalid_length_fails() {
        assert!(Mid::from_bytes(&[0u8; 16]).is_none());
        assert!(Mid::from_bytes(&[0u8; 32]).is_none());
    }

    #[test]
    fn cid_equals_master_mid() {
        let key = b"master public key";
        let cid = Cid::from_master_key(key);
        assert_eq!(cid.as_mid(), Mid::from_public_key(key));
    }

    #[test]
    fn global_time_ordering() {
        assert!(GlobalTime::new(1) < GlobalTime::new(2));
        assert_eq!(GlobalTime::new(41).next(), GlobalTime::new(42));
    }

    #[test]
    fn global_time_saturating_next() {
        assert_eq!(GlobalTime::new(u64::MAX).next().value(), u64::MAX);
    }

    #[test]
    fn prefix_roundtrip() {
        let cid = Cid::from_master_key(b"master");
        let prefix = ConversionPrefix::new(cid, [0, 1]);
        let mut packet = prefix.to_bytes().to_vec();
        packet.extend_from_slice(b"rest of the packet");

        let parsed = ConversionPrefix::from_packet(&packet).unwrap();
        assert_eq!(parsed, prefix);
        assert_eq!(parsed.cid(), cid);
        assert_eq!(parsed.version(), [0, 1]);
    }

    #[test]
    fn prefix_from_short_packet_fails() {
        assert!(ConversionPrefix::from_packet(&[0u8; 21]).is_none());
    }
}
