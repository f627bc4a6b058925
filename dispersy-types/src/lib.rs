//! # dispersy-types
//!
//! Wire format types for the Dispersy message synchronization engine.
//!
//! This crate provides the foundational types used across all Dispersy crates:
//! - [`Mid`], [`Cid`], [`GlobalTime`], [`ConversionPrefix`] - Identity and ordering types
//! - [`Frame`] - Packet framing (prefix, body, signature slots)
//! - [`Payload`] - Built-in and application message payloads
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;
mod packet;

pub use error::WireError;
pub use ids::{Cid, ConversionPrefix, GlobalTime, Mid, DIGEST_LEN, PREFIX_LEN};
pub use messages::{
    BloomBits, DestroyDegree, Payload, PayloadKind, Permission, PermissionGrant,
};
pub use packet::{Frame, SignerField, WireBody, EMPTY_SIGNATURE, SIGNATURE_LEN};
