//! The `dispersy-*` meta-messages every community registers.
//!
//! They are added to the registry before the community's own messages, so an
//! application message can never shadow one of them.

use dispersy_core::{
    Authentication, Destination, Distribution, KeyEncoding, MetaMessage, MetaRegistry,
    PolicyError, Resolution, RESERVED_PREFIX,
};
use dispersy_types::{Cid, PayloadKind};

use crate::config::SyncConfig;

/// Announces a member's public key.
pub const IDENTITY: &str = "dispersy-identity";
/// Asks for the public key behind a mid.
pub const IDENTITY_REQUEST: &str = "dispersy-identity-request";
/// Grants rights.
pub const AUTHORIZE: &str = "dispersy-authorize";
/// Withdraws rights.
pub const REVOKE: &str = "dispersy-revoke";
/// Asks for the grants proving a member's rights.
pub const MISSING_PROOF: &str = "dispersy-missing-proof";
/// Asks for a range of sequence numbers.
pub const MISSING_SEQUENCE: &str = "dispersy-missing-sequence";
/// Advertises one bloom bucket.
pub const SYNC: &str = "dispersy-sync";
/// Carries a multi-member message to a co-signer.
pub const SIGNATURE_REQUEST: &str = "dispersy-signature-request";
/// Carries one co-signature back.
pub const SIGNATURE_RESPONSE: &str = "dispersy-signature-response";
/// Soft or hard kill.
pub const DESTROY_COMMUNITY: &str = "dispersy-destroy-community";
/// A member's subjective set for one cluster.
pub const SUBJECTIVE_SET: &str = "dispersy-subjective-set";
/// Asks for subjective sets.
pub const SUBJECTIVE_SET_REQUEST: &str = "dispersy-subjective-set-request";
/// A member's similarity bits for one cluster.
pub const SIMILARITY: &str = "dispersy-similarity";
/// Asks for similarity bits.
pub const SIMILARITY_REQUEST: &str = "dispersy-similarity-request";

/// Whether `name` belongs to a built-in message.
pub fn is_builtin(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

fn request(cid: Cid, name: &str, payload: PayloadKind) -> Result<MetaMessage, PolicyError> {
    MetaMessage::builder(name, payload)
        .authentication(Authentication::NoAuthentication)
        .distribution(Distribution::Direct)
        .destination(Destination::Address)
        .build(cid)
}

/// Build the built-in meta-messages for community `cid`.
pub fn builtin_metas(cid: Cid, sync: &SyncConfig) -> Result<Vec<MetaMessage>, PolicyError> {
    let community = Destination::Community {
        node_count: sync.member_count,
    };

    Ok(vec![
        MetaMessage::builder(IDENTITY, PayloadKind::Identity)
            .authentication(Authentication::Member {
                encoding: KeyEncoding::PublicKey,
            })
            .distribution(Distribution::last_sync(1))
            .destination(community)
            .build(cid)?,
        request(cid, IDENTITY_REQUEST, PayloadKind::IdentityRequest)?,
        MetaMessage::builder(AUTHORIZE, PayloadKind::Authorize)
            .distribution(Distribution::full_sync())
            .destination(community)
            .build(cid)?,
        MetaMessage::builder(REVOKE, PayloadKind::Revoke)
            .distribution(Distribution::full_sync())
            .destination(community)
            .build(cid)?,
        request(cid, MISSING_PROOF, PayloadKind::MissingProof)?,
        request(cid, MISSING_SEQUENCE, PayloadKind::MissingSequence)?,
        MetaMessage::builder(SYNC, PayloadKind::Sync)
            .distribution(Distribution::Direct)
            .destination(community)
            .build(cid)?,
        MetaMessage::builder(SIGNATURE_REQUEST, PayloadKind::SignatureRequest)
            .authentication(Authentication::NoAuthentication)
            .distribution(Distribution::Direct)
            .destination(Destination::Member)
            .build(cid)?,
        request(cid, SIGNATURE_RESPONSE, PayloadKind::SignatureResponse)?,
        MetaMessage::builder(DESTROY_COMMUNITY, PayloadKind::DestroyCommunity)
            .resolution(Resolution::Linear)
            .distribution(Distribution::full_sync())
            .destination(community)
            .build(cid)?,
        MetaMessage::builder(SUBJECTIVE_SET, PayloadKind::SubjectiveSet)
            .distribution(Distribution::last_sync(1))
            .destination(community)
            .build(cid)?,
        request(cid, SUBJECTIVE_SET_REQUEST, PayloadKind::SubjectiveSetRequest)?,
        MetaMessage::builder(SIMILARITY, PayloadKind::Similarity)
            .distribution(Distribution::last_sync(1))
            .destination(community)
            .build(cid)?,
        request(cid, SIMILARITY_REQUEST, PayloadKind::SimilarityRequest)?,
    ])
}

/// A registry holding the built-ins followed by `metas`.
///
/// Fails on a reserved or duplicate name, or on a meta-message built for a
/// different community.
pub fn build_registry(
    cid: Cid,
    sync: &SyncConfig,
    metas: Vec<MetaMessage>,
) -> Result<MetaRegistry, PolicyError> {
    let mut registry = MetaRegistry::new();
    for meta in builtin_metas(cid, sync)? {
        registry.add_builtin(meta)?;
    }
    for meta in metas {
        if meta.cid() != cid {
            return Err(PolicyError::ImplementationMismatch("community"));
        }
        registry.add(meta)?;
    }
    Ok(registry)
}
