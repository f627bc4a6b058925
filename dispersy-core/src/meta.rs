//! Meta-messages and message instances.
//!
//! A [`MetaMessage`] is the immutable template for one message name within a
//! community: four policies, a payload kind and optional `check` / `handle`
//! callbacks. [`MetaMessage::implement`] produces a [`Message`], which becomes
//! wire-ready once a conversion has encoded (and signed) it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dispersy_types::{Cid, GlobalTime, Payload, PayloadKind, SIGNATURE_LEN};

use crate::compatibility::{check_policy_combination, PolicyError};
use crate::footprint::{
    authentication_footprint, destination_footprint, distribution_footprint, FootprintQuery,
};
use crate::member::Member;
use crate::outcome::ProtocolOutcome;
use crate::policy::{
    Authentication, AuthenticationImpl, Destination, DestinationImpl, Distribution,
    DistributionImpl, Resolution,
};

/// Prefix reserved for the built-in messages.
pub const RESERVED_PREFIX: &str = "dispersy-";

/// Community-specific validation run before a message is accepted.
pub type CheckFn = Arc<dyn Fn(&Message) -> Result<(), ProtocolOutcome> + Send + Sync>;

/// Community-specific processing of an accepted message.
pub type HandleFn = Arc<dyn Fn(&Message) + Send + Sync>;

struct MetaInner {
    name: String,
    cid: Cid,
    authentication: Authentication,
    resolution: Resolution,
    distribution: Distribution,
    destination: Destination,
    payload: PayloadKind,
    check: Option<CheckFn>,
    handle: Option<HandleFn>,
}

/// The template for one message name in one community.
#[derive(Clone)]
pub struct MetaMessage(Arc<MetaInner>);

/// Builder for [`MetaMessage`].
pub struct MetaBuilder {
    name: String,
    payload: PayloadKind,
    authentication: Authentication,
    resolution: Resolution,
    distribution: Distribution,
    destination: Destination,
    check: Option<CheckFn>,
    handle: Option<HandleFn>,
}

impl MetaBuilder {
    /// Set the authentication policy.
    pub fn authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = authentication;
        self
    }

    /// Set the resolution policy.
    pub fn resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Set the distribution policy.
    pub fn distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    /// Set the destination policy.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Install a validation callback.
    pub fn check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Message) -> Result<(), ProtocolOutcome> + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    /// Install a processing callback.
    pub fn handle<F>(mut self, handle: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.handle = Some(Arc::new(handle));
        self
    }

    /// Validate the policy combination and create the meta-message.
    pub fn build(self, cid: Cid) -> Result<MetaMessage, PolicyError> {
        check_policy_combination(
            &self.authentication,
            &self.resolution,
            &self.distribution,
            &self.destination,
        )?;
        Ok(MetaMessage(Arc::new(MetaInner {
            name: self.name,
            cid,
            authentication: self.authentication,
            resolution: self.resolution,
            distribution: self.distribution,
            destination: self.destination,
            payload: self.payload,
            check: self.check,
            handle: self.handle,
        })))
    }
}

impl MetaMessage {
    /// Start a meta-message definition.
    ///
    /// Defaults to member authentication, public resolution, direct
    /// distribution and a community destination of ten nodes.
    pub fn builder(name: impl Into<String>, payload: PayloadKind) -> MetaBuilder {
        MetaBuilder {
            name: name.into(),
            payload,
            authentication: Authentication::member(),
            resolution: Resolution::Public,
            distribution: Distribution::Direct,
            destination: Destination::Community { node_count: 10 },
            check: None,
            handle: None,
        }
    }

    /// Message name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Owning community.
    pub fn cid(&self) -> Cid {
        self.0.cid
    }

    /// Authentication policy.
    pub fn authentication(&self) -> &Authentication {
        &self.0.authentication
    }

    /// Resolution policy.
    pub fn resolution(&self) -> Resolution {
        self.0.resolution
    }

    /// Distribution policy.
    pub fn distribution(&self) -> Distribution {
        self.0.distribution
    }

    /// Destination policy.
    pub fn destination(&self) -> Destination {
        self.0.destination
    }

    /// Payload schema.
    pub fn payload_kind(&self) -> PayloadKind {
        self.0.payload
    }

    /// Run the community's check callback, if any.
    pub fn check(&self, message: &Message) -> Result<(), ProtocolOutcome> {
        match &self.0.check {
            Some(check) => check(message),
            None => Ok(()),
        }
    }

    /// Run the community's handle callback, if any.
    pub fn handle(&self, message: &Message) {
        if let Some(handle) = &self.0.handle {
            handle(message);
        }
    }

    /// Whether a handle callback is installed.
    pub fn has_handler(&self) -> bool {
        self.0.handle.is_some()
    }

    /// Start a footprint query for messages of this type.
    pub fn footprint_query(&self) -> FootprintQuery {
        FootprintQuery::new(self.0.name.clone(), self.0.cid)
    }

    /// Create a message instance; the packet stays empty until encoded.
    pub fn implement(
        &self,
        authentication: AuthenticationImpl,
        distribution: DistributionImpl,
        destination: DestinationImpl,
        payload: Payload,
    ) -> Result<Message, PolicyError> {
        let auth_ok = match (&self.0.authentication, &authentication) {
            (Authentication::NoAuthentication, AuthenticationImpl::NoAuthentication) => true,
            (Authentication::Member { .. }, AuthenticationImpl::Member { .. }) => true,
            (
                Authentication::MultiMember { count, .. },
                AuthenticationImpl::MultiMember {
                    members,
                    signatures,
                },
            ) => members.len() == *count && signatures.len() == *count,
            _ => false,
        };
        if !auth_ok {
            return Err(PolicyError::ImplementationMismatch("authentication"));
        }

        if distribution.sequence_number.is_some() != self.0.distribution.has_sequence_number() {
            return Err(PolicyError::ImplementationMismatch("distribution"));
        }

        let dest_ok = match (&self.0.destination, &destination) {
            (Destination::Address, DestinationImpl::Address(_)) => true,
            (Destination::Member, DestinationImpl::Member(_)) => true,
            (Destination::Community { .. }, DestinationImpl::Community) => true,
            (Destination::Subjective { cluster: a, .. }, DestinationImpl::Subjective { cluster: b }) => {
                a == b
            }
            (Destination::Similarity { cluster: a, .. }, DestinationImpl::Similarity { cluster: b }) => {
                a == b
            }
            _ => false,
        };
        if !dest_ok {
            return Err(PolicyError::ImplementationMismatch("destination"));
        }

        if payload.kind() != self.0.payload {
            return Err(PolicyError::PayloadMismatch {
                message: self.0.name.clone(),
                payload: payload.kind().footprint(),
            });
        }

        Ok(Message {
            meta: self.clone(),
            authentication,
            distribution,
            destination,
            payload,
            packet: Vec::new(),
            signed_len: 0,
        })
    }
}

impl fmt::Debug for MetaMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaMessage")
            .field("name", &self.0.name)
            .field("authentication", &self.0.authentication)
            .field("resolution", &self.0.resolution)
            .field("distribution", &self.0.distribution)
            .field("destination", &self.0.destination)
            .finish()
    }
}

/// Errors adding a signature to an existing message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// The member is not one of the declared signers.
    #[error("member is not a signer of this message")]
    NotASigner,
    /// The member's slot is already filled.
    #[error("member has already signed")]
    AlreadySigned,
    /// An earlier signer has not signed yet.
    #[error("earlier signers have not signed")]
    OutOfOrder,
    /// The signature does not verify.
    #[error("signature does not verify")]
    Invalid,
    /// Only encoded multi-member messages accept extra signatures.
    #[error("message does not accept additional signatures")]
    NotMultiMember,
}

/// A concrete message.
#[derive(Clone)]
pub struct Message {
    meta: MetaMessage,
    authentication: AuthenticationImpl,
    distribution: DistributionImpl,
    destination: DestinationImpl,
    payload: Payload,
    packet: Vec<u8>,
    signed_len: usize,
}

impl Message {
    /// The template.
    pub fn meta(&self) -> &MetaMessage {
        &self.meta
    }

    /// Message name.
    pub fn name(&self) -> &str {
        self.meta.name()
    }

    /// Signing state.
    pub fn authentication(&self) -> &AuthenticationImpl {
        &self.authentication
    }

    /// Ordering state.
    pub fn distribution(&self) -> &DistributionImpl {
        &self.distribution
    }

    /// Global time stamped on the message.
    pub fn global_time(&self) -> GlobalTime {
        self.distribution.global_time
    }

    /// Addressing state.
    pub fn destination(&self) -> &DestinationImpl {
        &self.destination
    }

    /// Replace the recipients, e.g. after resolving a reply address.
    pub fn set_destination(&mut self, destination: DestinationImpl) {
        self.destination = destination;
    }

    /// Payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Wire bytes; empty until encoded.
    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    /// The bytes covered by signatures.
    pub fn signed_part(&self) -> &[u8] {
        &self.packet[..self.signed_len]
    }

    /// The single signer, for member-authenticated messages.
    pub fn author(&self) -> Option<&Member> {
        self.authentication.member_ref()
    }

    /// The structural descriptor matched by delayed-packet patterns.
    pub fn footprint(&self) -> String {
        format!(
            "{} Community:{} {} {} {} {}",
            self.meta.name(),
            self.meta.cid().to_hex(),
            authentication_footprint(&self.authentication),
            distribution_footprint(&self.meta.distribution(), &self.distribution),
            destination_footprint(&self.destination),
            self.payload.kind().footprint()
        )
    }

    pub(crate) fn set_encoded(
        &mut self,
        authentication: AuthenticationImpl,
        packet: Vec<u8>,
        signed_len: usize,
    ) {
        self.authentication = authentication;
        self.packet = packet;
        self.signed_len = signed_len;
    }

    /// Add a co-signature to an encoded multi-member message.
    ///
    /// Signers sign in declared order; the packet is regenerated in place.
    pub fn add_signature(
        &mut self,
        member: &Member,
        signature: [u8; SIGNATURE_LEN],
    ) -> Result<(), SignatureError> {
        let AuthenticationImpl::MultiMember {
            members,
            signatures,
        } = &mut self.authentication
        else {
            return Err(SignatureError::NotMultiMember);
        };
        if self.packet.is_empty() {
            return Err(SignatureError::NotMultiMember);
        }
        let index = members
            .iter()
            .position(|m| m == member)
            .ok_or(SignatureError::NotASigner)?;
        if signatures[index].is_some() {
            return Err(SignatureError::AlreadySigned);
        }
        if signatures[..index].iter().any(Option::is_none) {
            return Err(SignatureError::OutOfOrder);
        }
        if !member.verify(&self.packet[..self.signed_len], &signature) {
            return Err(SignatureError::Invalid);
        }
        signatures[index] = Some(signature);
        let offset = self.signed_len + index * SIGNATURE_LEN;
        self.packet[offset..offset + SIGNATURE_LEN].copy_from_slice(&signature);
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("name", &self.meta.name())
            .field("authentication", &self.authentication)
            .field("distribution", &self.distribution)
            .field("payload", &self.payload.kind())
            .field("packet_len", &self.packet.len())
            .finish()
    }
}

/// The meta-messages of one community, by name.
#[derive(Debug, Default, Clone)]
pub struct MetaRegistry {
    metas: BTreeMap<String, MetaMessage>,
}

impl MetaRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in meta-message.
    pub fn add_builtin(&mut self, meta: MetaMessage) -> Result<(), PolicyError> {
        self.insert(meta)
    }

    /// Register a community-defined meta-message.
    pub fn add(&mut self, meta: MetaMessage) -> Result<(), PolicyError> {
        if meta.name().starts_with(RESERVED_PREFIX) {
            return Err(PolicyError::ReservedName(meta.name().to_string()));
        }
        self.insert(meta)
    }

    fn insert(&mut self, meta: MetaMessage) -> Result<(), PolicyError> {
        if self.metas.contains_key(meta.name()) {
            return Err(PolicyError::DuplicateName(meta.name().to_string()));
        }
        self.metas.insert(meta.name().to_string(), meta);
        Ok(())
    }

    /// Look up a meta-message.
    pub fn get(&self, name: &str) -> Option<&MetaMessage> {
        self.metas.get(name)
    }

    /// All registered meta-messages.
    pub fn iter(&self) -> impl Iterator<Item = &MetaMessage> {
        self.metas.values()
    }

    /// Number of registered meta-messages.
    pub fn len(&self) -> usize {
        self.metas.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::DropReason;

    fn cid() -> Cid {
        Cid::from_master_key(b"master")
    }

    fn post() -> MetaMessage {
        MetaMessage::builder("post", PayloadKind::Application)
            .distribution(Distribution::full_sync())
            .build(cid())
            .unwrap()
    }

    #[test]
    fn invalid_combination_creates_nothing() {
        let result = MetaMessage::builder("bad", PayloadKind::Application)
            .authentication(Authentication::NoAuthentication)
            .distribution(Distribution::full_sync())
            .build(cid());
        assert!(result.is_err());
    }

    #[test]
    fn implement_checks_payload_kind() {
        let err = post()
            .implement(
                AuthenticationImpl::member(Member::generate()),
                DistributionImpl::new(GlobalTime::new(1)),
                DestinationImpl::Community,
                Payload::Identity,
            )
            .unwrap_err();
        assert!(matches!(err, PolicyError::PayloadMismatch { .. }));
    }

    #[test]
    fn implement_checks_sequence_numbers() {
        let err = post()
            .implement(
                AuthenticationImpl::member(Member::generate()),
                DistributionImpl::with_sequence(GlobalTime::new(1), 1),
                DestinationImpl::Community,
                Payload::application(vec![]),
            )
            .unwrap_err();
        assert_eq!(err, PolicyError::ImplementationMismatch("distribution"));
    }

    #[test]
    fn footprint_lists_every_policy() {
        let member = Member::generate();
        let message = post()
            .implement(
                AuthenticationImpl::member(member.clone()),
                DistributionImpl::new(GlobalTime::new(5)),
                DestinationImpl::Community,
                Payload::application(vec![1]),
            )
            .unwrap();
        assert_eq!(
            message.footprint(),
            format!(
                "post Community:{} MemberAuthentication:{} FullSyncDistribution:5:0 CommunityDestination ApplicationPayload",
                cid().to_hex(),
                member.mid().to_hex()
            )
        );
        assert!(post().footprint_query().build().unwrap().matches(&message.footprint()));
    }

    #[test]
    fn registry_rejects_reserved_and_duplicate_names() {
        let mut registry = MetaRegistry::new();
        registry.add(post()).unwrap();
        assert_eq!(
            registry.add(post()).unwrap_err(),
            PolicyError::DuplicateName("post".into())
        );

        let reserved = MetaMessage::builder("dispersy-fake", PayloadKind::Application)
            .build(cid())
            .unwrap();
        assert!(matches!(
            registry.add(reserved.clone()),
            Err(PolicyError::ReservedName(_))
        ));
        registry.add_builtin(reserved).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn check_callback_is_consulted() {
        let meta = MetaMessage::builder("post", PayloadKind::Application)
            .check(|_| Err(ProtocolOutcome::drop(DropReason::Rejected("no".into()))))
            .build(cid())
            .unwrap();
        let message = meta
            .implement(
                AuthenticationImpl::member(Member::generate()),
                DistributionImpl::new(GlobalTime::new(1)),
                DestinationImpl::Community,
                Payload::application(vec![]),
            )
            .unwrap();
        assert!(meta.check(&message).is_err());
    }

    #[test]
    fn add_signature_requires_encoded_multi_member_message() {
        let mut message = post()
            .implement(
                AuthenticationImpl::member(Member::generate()),
                DistributionImpl::new(GlobalTime::new(1)),
                DestinationImpl::Community,
                Payload::application(vec![]),
            )
            .unwrap();
        let signer = Member::generate();
        assert_eq!(
            message.add_signature(&signer, [0u8; SIGNATURE_LEN]),
            Err(SignatureError::NotMultiMember)
        );
    }
}
