//! Error types for the Dispersy wire format.

use thiserror::Error;

/// Errors that can occur while framing or parsing packets.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Packet shorter than its declared layout
    #[error("packet truncated: need {needed} bytes, have {actual}")]
    Truncated {
        /// Bytes required by the layout.
        needed: usize,
        /// Bytes actually present.
        actual: usize,
    },

    /// Trailing bytes do not form whole signatures
    #[error("signature block of {0} bytes is not a multiple of the signature length")]
    RaggedSignatures(usize),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}
