//! Message payloads for Dispersy.
//!
//! Every packet carries exactly one [`Payload`]. The built-in `dispersy-*`
//! messages each have a dedicated variant; community-defined messages carry
//! opaque application bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{GlobalTime, Mid, WireError};

/// A right that can be granted on a message name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    /// May create messages of this type.
    Permit,
    /// May grant rights on this message type to others.
    Authorize,
    /// May revoke rights on this message type from others.
    Revoke,
}

impl Permission {
    /// All three rights, in grant order.
    pub const ALL: [Permission; 3] = [Permission::Authorize, Permission::Revoke, Permission::Permit];
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Permit => "permit",
            Permission::Authorize => "authorize",
            Permission::Revoke => "revoke",
        };
        f.write_str(name)
    }
}

/// One (member, message, permission) triplet inside an authorize or revoke.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Full public key of the member receiving or losing the right.
    pub member_public_key: Vec<u8>,
    /// Name of the meta-message the right applies to.
    pub message: String,
    /// The right itself.
    pub permission: Permission,
}

/// How thoroughly a destroyed community is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestroyDegree {
    /// Freeze: keep data, accept nothing newer than the destroy message.
    SoftKill,
    /// Purge everything except the destroy message and its proof chain.
    HardKill,
}

/// Serialized bloom filter bits as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomBits {
    /// Number of hash slices.
    pub slices: u8,
    /// Bits per slice.
    pub bits_per_slice: u32,
    /// Packed bit array, `slices * bits_per_slice / 8` bytes.
    pub bits: Vec<u8>,
}

/// Discriminator naming the schema of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// `dispersy-identity`
    Identity,
    /// `dispersy-identity-request`
    IdentityRequest,
    /// `dispersy-authorize`
    Authorize,
    /// `dispersy-revoke`
    Revoke,
    /// `dispersy-missing-proof`
    MissingProof,
    /// `dispersy-missing-sequence`
    MissingSequence,
    /// `dispersy-sync`
    Sync,
    /// `dispersy-signature-request`
    SignatureRequest,
    /// `dispersy-signature-response`
    SignatureResponse,
    /// `dispersy-destroy-community`
    DestroyCommunity,
    /// `dispersy-subjective-set`
    SubjectiveSet,
    /// `dispersy-subjective-set-request`
    SubjectiveSetRequest,
    /// `dispersy-similarity`
    Similarity,
    /// `dispersy-similarity-request`
    SimilarityRequest,
    /// Community-defined message.
    Application,
}

impl PayloadKind {
    /// The payload descriptor used in footprints.
    pub fn footprint(&self) -> &'static str {
        match self {
            PayloadKind::Identity => "IdentityPayload",
            PayloadKind::IdentityRequest => "IdentityRequestPayload",
            PayloadKind::Authorize => "AuthorizePayload",
            PayloadKind::Revoke => "RevokePayload",
            PayloadKind::MissingProof => "MissingProofPayload",
            PayloadKind::MissingSequence => "MissingSequencePayload",
            PayloadKind::Sync => "SyncPayload",
            PayloadKind::SignatureRequest => "SignatureRequestPayload",
            PayloadKind::SignatureResponse => "SignatureResponsePayload",
            PayloadKind::DestroyCommunity => "DestroyCommunityPayload",
            PayloadKind::SubjectiveSet => "SubjectiveSetPayload",
            PayloadKind::SubjectiveSetRequest => "SubjectiveSetRequestPayload",
            PayloadKind::Similarity => "SimilarityPayload",
            PayloadKind::SimilarityRequest => "SimilarityRequestPayload",
            PayloadKind::Application => "ApplicationPayload",
        }
    }
}

/// The payload of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    /// Announces the signer's public key (the key travels in the authentication field).
    Identity,
    /// Ask for the public key(s) behind a mid.
    IdentityRequest {
        /// The unknown member.
        mid: Mid,
    },
    /// Grant rights.
    Authorize {
        /// The grants.
        permissions: Vec<PermissionGrant>,
    },
    /// Withdraw rights.
    Revoke {
        /// The revocations.
        permissions: Vec<PermissionGrant>,
    },
    /// Ask for the grant chain proving a member's rights at a global time.
    MissingProof {
        /// The member whose rights are in question.
        member: Mid,
        /// The time at which the rights were needed.
        global_time: GlobalTime,
    },
    /// Ask for a range of one author's sequence numbers.
    MissingSequence {
        /// The author.
        member: Mid,
        /// The meta-message name.
        message: String,
        /// First missing sequence number (inclusive).
        missing_low: u32,
        /// Last missing sequence number (inclusive).
        missing_high: u32,
    },
    /// Advertise one bloom bucket.
    Sync {
        /// Lower bound of the bucket.
        time_low: u64,
        /// Upper bound of the bucket; zero means open-ended.
        time_high: u64,
        /// Which packets in the range the sender already has.
        bloom: BloomBits,
    },
    /// Ask a co-signer to sign the embedded message.
    SignatureRequest {
        /// Identifier chosen by the requester.
        identifier: u64,
        /// The partially signed packet.
        message: Vec<u8>,
    },
    /// A co-signature in reply to a request.
    SignatureResponse {
        /// Identifier of the request.
        identifier: u64,
        /// The signature over the embedded message.
        signature: Vec<u8>,
    },
    /// Destroy the community.
    DestroyCommunity {
        /// How much to remove.
        degree: DestroyDegree,
    },
    /// A member's subjective set for one cluster.
    SubjectiveSet {
        /// Cluster identifier.
        cluster: u8,
        /// Members in the set.
        subjective_set: BloomBits,
    },
    /// Ask for subjective sets.
    SubjectiveSetRequest {
        /// Cluster identifier.
        cluster: u8,
        /// Members whose sets are wanted.
        members: Vec<Mid>,
    },
    /// A member's similarity bits for one cluster.
    Similarity {
        /// Cluster identifier.
        cluster: u8,
        /// Similarity bitstream.
        similarity: Vec<u8>,
    },
    /// Ask for similarity bits.
    SimilarityRequest {
        /// Cluster identifier.
        cluster: u8,
        /// Members whose bits are wanted.
        members: Vec<Mid>,
    },
    /// Community-defined payload.
    Application {
        /// Opaque bytes interpreted by the community's handler.
        data: Vec<u8>,
    },
}

impl Payload {
    /// The schema this payload belongs to.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Identity => PayloadKind::Identity,
            Payload::IdentityRequest { .. } => PayloadKind::IdentityRequest,
            Payload::Authorize { .. } => PayloadKind::Authorize,
            Payload::Revoke { .. } => PayloadKind::Revoke,
            Payload::MissingProof { .. } => PayloadKind::MissingProof,
            Payload::MissingSequence { .. } => PayloadKind::MissingSequence,
            Payload::Sync { .. } => PayloadKind::Sync,
            Payload::SignatureRequest { .. } => PayloadKind::SignatureRequest,
            Payload::SignatureResponse { .. } => PayloadKind::SignatureResponse,
            Payload::DestroyCommunity { .. } => PayloadKind::DestroyCommunity,
            Payload::SubjectiveSet { .. } => PayloadKind::SubjectiveSet,
            Payload::SubjectiveSetRequest { .. } => PayloadKind::SubjectiveSetRequest,
            Payload::Similarity { .. } => PayloadKind::Similarity,
            Payload::SimilarityRequest { .. } => PayloadKind::SimilarityRequest,
            Payload::Application { .. } => PayloadKind::Application,
        }
    }

    /// Convenience constructor for application payloads.
    pub fn application(data: impl Into<Vec<u8>>) -> Self {
        Payload::Application { data: data.into() }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }
}
