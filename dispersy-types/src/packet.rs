//! Packet framing - the on-the-wire layout shared by every conversion.
//!
//! ```text
//! +-----------+-------------+----------------+------------------------+
//! | prefix 22 | body len u32| body (msgpack) | signatures (n * 64)    |
//! +-----------+-------------+----------------+------------------------+
//! ```
//!
//! Signatures cover everything before the signature block. A signature slot
//! filled with zeros is a signature that has not been made yet (used while a
//! multi-member message travels between its signers).

use serde::{Deserialize, Serialize};

use crate::{ConversionPrefix, GlobalTime, Mid, Payload, WireError, PREFIX_LEN};

/// Length of one signature slot.
pub const SIGNATURE_LEN: usize = 64;

/// A signature slot that has not been filled in.
pub const EMPTY_SIGNATURE: [u8; SIGNATURE_LEN] = [0u8; SIGNATURE_LEN];

const LEN_FIELD: usize = 4;

/// How a signer is identified inside the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignerField {
    /// Only the 20-byte digest; the receiver must already know the key.
    Mid(Mid),
    /// The full public key.
    PublicKey(Vec<u8>),
}

/// The encoded body of a packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireBody {
    /// Meta-message name.
    pub name: String,
    /// Signers in signing order (empty for unauthenticated messages).
    pub signers: Vec<SignerField>,
    /// Global time claimed by the creator.
    pub global_time: GlobalTime,
    /// Per-author sequence number, when the distribution uses them.
    pub sequence_number: Option<u32>,
    /// Message payload.
    pub payload: Payload,
}

/// A parsed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Community and conversion version.
    pub prefix: ConversionPrefix,
    /// Decoded body.
    pub body: WireBody,
    /// Number of leading bytes covered by the signatures.
    pub signed_len: usize,
    /// Signature slots, in signer order.
    pub signatures: Vec<[u8; SIGNATURE_LEN]>,
}

impl Frame {
    /// Encode the signed part of a packet: prefix, length and body.
    ///
    /// Append one [`SIGNATURE_LEN`] slot per signer to obtain the full packet.
    pub fn encode_signed_part(
        prefix: &ConversionPrefix,
        body: &WireBody,
    ) -> Result<Vec<u8>, WireError> {
        let encoded = rmp_serde::to_vec(body).map_err(WireError::Serialization)?;
        let len = u32::try_from(encoded.len())
            .map_err(|_| WireError::InvalidData("body exceeds u32 length".into()))?;

        let mut packet = Vec::with_capacity(PREFIX_LEN + LEN_FIELD + encoded.len());
        packet.extend_from_slice(&prefix.to_bytes());
        packet.extend_from_slice(&len.to_be_bytes());
        packet.extend_from_slice(&encoded);
        Ok(packet)
    }

    /// Parse a complete packet.
    pub fn parse(packet: &[u8]) -> Result<Self, WireError> {
        let header = PREFIX_LEN + LEN_FIELD;
        if packet.len() < header {
            return Err(WireError::Truncated {
                needed: header,
                actual: packet.len(),
            });
        }
        let prefix = ConversionPrefix::from_packet(packet).ok_or(WireError::Truncated {
            needed: PREFIX_LEN,
            actual: packet.len(),
        })?;

        let mut len_bytes = [0u8; LEN_FIELD];
        len_bytes.copy_from_slice(&packet[PREFIX_LEN..header]);
        let body_len = u32::from_be_bytes(len_bytes) as usize;

        let signed_len = header.saturating_add(body_len);
        if packet.len() < signed_len {
            return Err(WireError::Truncated {
                needed: signed_len,
                actual: packet.len(),
            });
        }

        let body: WireBody = rmp_serde::from_slice(&packet[header..signed_len])
            .map_err(WireError::Deserialization)?;

        let tail = &packet[signed_len..];
        if tail.len() % SIGNATURE_LEN != 0 {
            return Err(WireError::RaggedSignatures(tail.len()));
        }
        let signatures = tail
            .chunks_exact(SIGNATURE_LEN)
            .map(|chunk| {
                let mut slot = [0u8; SIGNATURE_LEN];
                slot.copy_from_slice(chunk);
                slot
            })
            .collect();

        Ok(Self {
            prefix,
            body,
            signed_len,
            signatures,
        })
    }
}
