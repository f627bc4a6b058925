//! The four policy axes of a meta-message, and their per-message state.
//!
//! Each axis is a closed enum. The meta-level enums ([`Authentication`],
//! [`Resolution`], [`Distribution`], [`Destination`]) describe what a message
//! type requires; the `*Impl` enums carry what one concrete message holds.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use dispersy_types::{GlobalTime, SIGNATURE_LEN};

use crate::member::Member;
use crate::meta::Message;

/// Decides whether this process is willing to co-sign a multi-member message.
pub type AllowSignature = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// How a signer is written into the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    /// Only the mid; receivers must already know the public key.
    Mid,
    /// The full public key.
    PublicKey,
}

/// Who must sign a message.
#[derive(Clone)]
pub enum Authentication {
    /// Unsigned.
    NoAuthentication,
    /// Signed by exactly one member.
    Member {
        /// Signer encoding on the wire.
        encoding: KeyEncoding,
    },
    /// Signed by a fixed number of members, in declared order.
    MultiMember {
        /// Number of required signers.
        count: usize,
        /// Consulted before co-signing a request; `None` refuses every request.
        allow_signature: Option<AllowSignature>,
    },
}

impl Authentication {
    /// Single-member authentication with the signer written as a mid.
    pub fn member() -> Self {
        Authentication::Member {
            encoding: KeyEncoding::Mid,
        }
    }

    /// Short variant name, used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Authentication::NoAuthentication => "NoAuthentication",
            Authentication::Member { .. } => "MemberAuthentication",
            Authentication::MultiMember { .. } => "MultiMemberAuthentication",
        }
    }
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::NoAuthentication => f.write_str("NoAuthentication"),
            Authentication::Member { encoding } => f
                .debug_struct("MemberAuthentication")
                .field("encoding", encoding)
                .finish(),
            Authentication::MultiMember {
                count,
                allow_signature,
            } => f
                .debug_struct("MultiMemberAuthentication")
                .field("count", count)
                .field("allow_signature", &allow_signature.is_some())
                .finish(),
        }
    }
}

/// What permission a signer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Anyone may create it.
    Public,
    /// Every signer needs the `permit` right in the timeline.
    Linear,
}

impl Resolution {
    /// Short variant name, used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Resolution::Public => "PublicResolution",
            Resolution::Linear => "LinearResolution",
        }
    }
}

/// Order in which last-sync messages are preferred when answering a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Oldest first.
    Ascending,
    /// Newest first.
    Descending,
}

/// How a message is ordered, retained and synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Forwarded but never stored.
    Relay,
    /// Sent once, never stored.
    Direct,
    /// Every message is stored and synced.
    FullSync {
        /// Stamp a strictly increasing per-author sequence number.
        enable_sequence_number: bool,
    },
    /// Only the newest `history_size` messages per author are kept.
    LastSync {
        /// Messages retained per author.
        history_size: usize,
        /// Stamp a strictly increasing per-author sequence number.
        enable_sequence_number: bool,
        /// Preference order when answering syncs.
        direction: SyncDirection,
    },
}

impl Distribution {
    /// Full sync without sequence numbers.
    pub fn full_sync() -> Self {
        Distribution::FullSync {
            enable_sequence_number: false,
        }
    }

    /// Last sync of `history_size` messages, newest first.
    pub fn last_sync(history_size: usize) -> Self {
        Distribution::LastSync {
            history_size,
            enable_sequence_number: false,
            direction: SyncDirection::Descending,
        }
    }

    /// Whether messages of this distribution are stored and synced.
    pub fn is_synced(&self) -> bool {
        matches!(
            self,
            Distribution::FullSync { .. } | Distribution::LastSync { .. }
        )
    }

    /// Whether messages carry a per-author sequence number.
    pub fn has_sequence_number(&self) -> bool {
        match self {
            Distribution::FullSync {
                enable_sequence_number,
            }
            | Distribution::LastSync {
                enable_sequence_number,
                ..
            } => *enable_sequence_number,
            Distribution::Relay | Distribution::Direct => false,
        }
    }

    /// Short variant name, used in error messages and footprints.
    pub fn name(&self) -> &'static str {
        match self {
            Distribution::Relay => "RelayDistribution",
            Distribution::Direct => "DirectDistribution",
            Distribution::FullSync { .. } => "FullSyncDistribution",
            Distribution::LastSync { .. } => "LastSyncDistribution",
        }
    }
}

/// Who receives a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Explicit socket addresses.
    Address,
    /// Explicit members, resolved to addresses through routing.
    Member,
    /// A random subset of the community.
    Community {
        /// Number of candidates to send to.
        node_count: usize,
    },
    /// Members whose subjective set for `cluster` contains the receiver.
    Subjective {
        /// Cluster identifier.
        cluster: u8,
        /// Number of candidates to send to.
        node_count: usize,
    },
    /// Members whose similarity bits overlap the receiver's.
    Similarity {
        /// Cluster identifier.
        cluster: u8,
        /// Minimum number of overlapping bits.
        threshold: u32,
        /// Number of candidates to send to.
        node_count: usize,
    },
}

impl Destination {
    /// Short variant name, used in error messages and footprints.
    pub fn name(&self) -> &'static str {
        match self {
            Destination::Address => "AddressDestination",
            Destination::Member => "MemberDestination",
            Destination::Community { .. } => "CommunityDestination",
            Destination::Subjective { .. } => "SubjectiveDestination",
            Destination::Similarity { .. } => "SimilarityDestination",
        }
    }

    /// Number of candidates a community-wide message is sent to.
    pub fn node_count(&self) -> Option<usize> {
        match self {
            Destination::Community { node_count }
            | Destination::Subjective { node_count, .. }
            | Destination::Similarity { node_count, .. } => Some(*node_count),
            Destination::Address | Destination::Member => None,
        }
    }
}

/// Signing state of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationImpl {
    /// Unsigned message.
    NoAuthentication,
    /// One signer and its signature once made.
    Member {
        /// The signer.
        member: Member,
        /// The signature, or `None` while unsigned.
        signature: Option<[u8; SIGNATURE_LEN]>,
    },
    /// Several signers in declared order.
    MultiMember {
        /// The signers.
        members: Vec<Member>,
        /// One slot per signer.
        signatures: Vec<Option<[u8; SIGNATURE_LEN]>>,
    },
}

impl AuthenticationImpl {
    /// State for a message signed by `member` (signature added on encode).
    pub fn member(member: Member) -> Self {
        AuthenticationImpl::Member {
            member,
            signature: None,
        }
    }

    /// State for a multi-member message with every slot empty.
    pub fn multi_member(members: Vec<Member>) -> Self {
        let signatures = vec![None; members.len()];
        AuthenticationImpl::MultiMember {
            members,
            signatures,
        }
    }

    /// All signers, in order.
    pub fn members(&self) -> Vec<Member> {
        match self {
            AuthenticationImpl::NoAuthentication => Vec::new(),
            AuthenticationImpl::Member { member, .. } => vec![member.clone()],
            AuthenticationImpl::MultiMember { members, .. } => members.clone(),
        }
    }

    /// The single signer, for member-authenticated messages.
    pub fn member_ref(&self) -> Option<&Member> {
        match self {
            AuthenticationImpl::Member { member, .. } => Some(member),
            _ => None,
        }
    }

    /// Whether every signature slot is filled.
    pub fn is_signed(&self) -> bool {
        match self {
            AuthenticationImpl::NoAuthentication => true,
            AuthenticationImpl::Member { signature, .. } => signature.is_some(),
            AuthenticationImpl::MultiMember { signatures, .. } => {
                signatures.iter().all(Option::is_some)
            }
        }
    }
}

/// Ordering state of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributionImpl {
    /// Global time claimed by the creator.
    pub global_time: GlobalTime,
    /// Per-author sequence number, when the meta enables them.
    pub sequence_number: Option<u32>,
}

impl DistributionImpl {
    /// State without a sequence number.
    pub fn new(global_time: GlobalTime) -> Self {
        Self {
            global_time,
            sequence_number: None,
        }
    }

    /// State with a sequence number.
    pub fn with_sequence(global_time: GlobalTime, sequence_number: u32) -> Self {
        Self {
            global_time,
            sequence_number: Some(sequence_number),
        }
    }
}

/// Addressing state of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationImpl {
    /// Send to these addresses.
    Address(Vec<SocketAddr>),
    /// Send to these members.
    Member(Vec<Member>),
    /// Send to community candidates.
    Community,
    /// Subjective cluster delivery.
    Subjective {
        /// Cluster identifier.
        cluster: u8,
    },
    /// Similarity cluster delivery.
    Similarity {
        /// Cluster identifier.
        cluster: u8,
    },
}

impl DestinationImpl {
    /// The empty per-message state matching a meta destination.
    ///
    /// Address and member destinations start without recipients; received
    /// messages never carry them.
    pub fn from_meta(destination: &Destination) -> Self {
        match destination {
            Destination::Address => DestinationImpl::Address(Vec::new()),
            Destination::Member => DestinationImpl::Member(Vec::new()),
            Destination::Community { .. } => DestinationImpl::Community,
            Destination::Subjective { cluster, .. } => DestinationImpl::Subjective {
                cluster: *cluster,
            },
            Destination::Similarity { cluster, .. } => DestinationImpl::Similarity {
                cluster: *cluster,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_only_on_synced_distributions() {
        assert!(!Distribution::Direct.has_sequence_number());
        assert!(!Distribution::full_sync().has_sequence_number());
        assert!(Distribution::FullSync {
            enable_sequence_number: true
        }
        .has_sequence_number());
    }

    #[test]
    fn synced_distributions() {
        assert!(Distribution::full_sync().is_synced());
        assert!(Distribution::last_sync(1).is_synced());
        assert!(!Distribution::Relay.is_synced());
    }

    #[test]
    fn multi_member_starts_unsigned() {
        let auth = AuthenticationImpl::multi_member(vec![Member::generate(), Member::generate()]);
        assert!(!auth.is_signed());
        assert_eq!(auth.members().len(), 2);
    }

    #[test]
    fn destination_impl_follows_meta_cluster() {
        let meta = Destination::Subjective {
            cluster: 3,
            node_count: 10,
        };
        assert_eq!(
            DestinationImpl::from_meta(&meta),
            DestinationImpl::Subjective { cluster: 3 }
        );
        assert_eq!(meta.node_count(), Some(10));
    }

    #[test]
    fn authentication_debug_hides_callback() {
        let auth = Authentication::MultiMember {
            count: 2,
            allow_signature: Some(Arc::new(|_| true)),
        };
        assert!(format!("{auth:?}").contains("allow_signature: true"));
    }
}
