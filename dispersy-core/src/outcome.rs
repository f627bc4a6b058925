//! Protocol verdicts for messages that cannot be accepted.
//!
//! Validation returns `Result<T, ProtocolOutcome>`. A [`DelayTrigger`] names
//! the dependency that has not arrived yet; a [`DropReason`] is final.

use dispersy_types::{GlobalTime, Mid};
use thiserror::Error;

/// A dependency whose absence postpones a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayTrigger {
    /// The public key of a signer is unknown.
    MissingMember {
        /// The unknown mid.
        mid: Mid,
    },
    /// Earlier sequence numbers of this author have not arrived.
    MissingSequence {
        /// The author.
        member: Mid,
        /// Meta-message name.
        message: String,
        /// First missing number (inclusive).
        missing_low: u32,
        /// Last missing number (inclusive).
        missing_high: u32,
    },
    /// The grants proving the signer's rights have not arrived.
    MissingProof {
        /// The signer.
        member: Mid,
        /// Global time of the message needing the proof.
        global_time: GlobalTime,
    },
    /// The author's subjective set for a cluster is unknown.
    MissingSubjectiveSet {
        /// The author.
        member: Mid,
        /// Cluster identifier.
        cluster: u8,
    },
    /// The author's similarity bits for a cluster are unknown.
    MissingSimilarity {
        /// The author.
        member: Mid,
        /// Cluster identifier.
        cluster: u8,
    },
}

impl DelayTrigger {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            DelayTrigger::MissingMember { .. } => "missing member",
            DelayTrigger::MissingSequence { .. } => "missing sequence numbers",
            DelayTrigger::MissingProof { .. } => "missing proof",
            DelayTrigger::MissingSubjectiveSet { .. } => "missing subjective set",
            DelayTrigger::MissingSimilarity { .. } => "missing similarity",
        }
    }
}

/// Why a packet or message was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The packet does not parse.
    Malformed(String),
    /// No conversion is registered for the packet's prefix.
    UnknownConversion,
    /// No meta-message is registered under the packet's name.
    UnknownMessage(String),
    /// A signature does not verify.
    InvalidSignature,
    /// A required signature slot is empty.
    Unsigned,
    /// The packet's fields disagree with its meta-message.
    PolicyMismatch(String),
    /// Already stored.
    Duplicate,
    /// Older than what the distribution keeps.
    Stale,
    /// The sequence gap is larger than we are willing to request.
    SequenceGapTooLarge,
    /// The global time is further ahead of our clock than we accept.
    GlobalTimeTooHigh {
        /// Global time carried by the message.
        global_time: GlobalTime,
        /// Our clock when it arrived.
        local: GlobalTime,
    },
    /// The community no longer accepts messages at this global time.
    Destroyed,
    /// The signer lacks the right; the grant history proves it.
    ByProof {
        /// Packets the sender should receive to correct itself.
        proof: Vec<Vec<u8>>,
    },
    /// Rejected by a community callback.
    Rejected(String),
}

/// The verdict on a message that was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolOutcome {
    /// Park the packet until the trigger is satisfied.
    #[error("delayed: {}", .0.label())]
    Delay(DelayTrigger),

    /// Discard the packet.
    #[error("dropped: {0:?}")]
    Drop(DropReason),
}

impl ProtocolOutcome {
    /// Shorthand for a drop.
    pub fn drop(reason: DropReason) -> Self {
        ProtocolOutcome::Drop(reason)
    }

    /// Shorthand for a rejection with a message.
    pub fn rejected(reason: impl Into<String>) -> Self {
        ProtocolOutcome::Drop(DropReason::Rejected(reason.into()))
    }

    /// Whether the packet should be parked.
    pub fn is_delay(&self) -> bool {
        matches!(self, ProtocolOutcome::Delay(_))
    }
}

impl From<DelayTrigger> for ProtocolOutcome {
    fn from(trigger: DelayTrigger) -> Self {
        ProtocolOutcome::Delay(trigger)
    }
}

impl From<DropReason> for ProtocolOutcome {
    fn from(reason: DropReason) -> Self {
        ProtocolOutcome::Drop(reason)
    }
}
