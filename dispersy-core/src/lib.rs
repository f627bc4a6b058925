//! # dispersy-core
//!
//! Pure protocol logic for Dispersy (no I/O, instant tests).
//!
//! This crate implements the message model and the validation state of a
//! community without threads, sockets or disk access:
//!
//! - [`member`]: Ed25519 identities and their mids
//! - [`policy`] and [`compatibility`]: the four policy axes and which
//!   combinations are allowed
//! - [`meta`]: meta-messages, message instances and the per-community registry
//! - [`conversion`]: packet encode/decode with signature verification
//! - [`timeline`]: the global clock and the permission history
//! - [`bloom`]: bloom filters and the time-bucketed sync index
//! - [`sequence`]: per-author sequence numbers
//! - [`delay`]: packets parked until a dependency arrives
//!
//! ## Design Philosophy
//!
//! Validation never throws. Every check returns
//! `Result<_, ProtocolOutcome>` where the outcome is either a delay naming
//! the missing dependency or a final drop. The running engine
//! (`dispersy-engine`) interprets these outcomes: it sends requests, parks
//! packets and informs senders.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bloom;
pub mod compatibility;
pub mod conversion;
pub mod delay;
pub mod footprint;
pub mod member;
pub mod meta;
pub mod outcome;
pub mod policy;
pub mod sequence;
pub mod timeline;

pub use bloom::{BloomBucket, BloomFilter, BloomIndex, SyncAdvert};
pub use compatibility::{check_policy_combination, PolicyError};
pub use conversion::{Conversion, ConversionError, MemberResolver, DEFAULT_VERSION};
pub use delay::{release_pattern, DelayQueue, DelayQueueError, DelayedPacket};
pub use footprint::{FootprintError, FootprintPattern, FootprintQuery};
pub use member::{Member, MemberError, PUBLIC_KEY_LEN};
pub use meta::{
    CheckFn, HandleFn, Message, MetaBuilder, MetaMessage, MetaRegistry, SignatureError,
    RESERVED_PREFIX,
};
pub use outcome::{DelayTrigger, DropReason, ProtocolOutcome};
pub use policy::{
    AllowSignature, Authentication, AuthenticationImpl, Destination, DestinationImpl,
    Distribution, DistributionImpl, KeyEncoding, Resolution, SyncDirection,
};
pub use sequence::{SequenceCheck, SequenceTracker};
pub use timeline::{Standing, Timeline};
