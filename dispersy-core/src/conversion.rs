//! Conversion between [`Message`]s and wire packets.
//!
//! A conversion is identified by its 22-byte prefix (community id plus a
//! version). Encoding signs every slot whose member has a private key;
//! decoding resolves signers, verifies signatures and rebuilds the message
//! against the community's [`MetaRegistry`].

use dispersy_types::{
    Cid, ConversionPrefix, Frame, Mid, SignerField, WireBody, WireError, EMPTY_SIGNATURE,
    SIGNATURE_LEN,
};
use thiserror::Error;

use crate::compatibility::PolicyError;
use crate::member::{Member, MemberError};
use crate::meta::{Message, MetaRegistry};
use crate::outcome::{DelayTrigger, DropReason, ProtocolOutcome};
use crate::policy::{Authentication, AuthenticationImpl, DestinationImpl, DistributionImpl, KeyEncoding};

/// Conversion version used for new communities.
pub const DEFAULT_VERSION: [u8; 2] = [0x00, 0x01];

/// Errors while encoding a message.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// Framing failed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The message does not fit its meta-message.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// A required signature could not be made.
    #[error(transparent)]
    Member(#[from] MemberError),

    /// The message belongs to another community.
    #[error("message for community {0} encoded with a foreign conversion")]
    WrongCommunity(Cid),
}

/// Lookup of members while decoding.
pub trait MemberResolver {
    /// Every known member whose public key hashes to `mid`.
    fn members_by_mid(&self, mid: &Mid) -> Vec<Member>;

    /// The member with this public key.
    ///
    /// Called before the signature is checked, so implementations should
    /// not persist the key here.
    fn member_from_public_key(&self, public_key: &[u8]) -> Result<Member, MemberError>;
}

/// One versioned wire format of a community.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conversion {
    prefix: ConversionPrefix,
}

impl Conversion {
    /// A conversion for community `cid` at `version`.
    pub fn new(cid: Cid, version: [u8; 2]) -> Self {
        Self {
            prefix: ConversionPrefix::new(cid, version),
        }
    }

    /// The packet prefix this conversion reads and writes.
    pub fn prefix(&self) -> ConversionPrefix {
        self.prefix
    }

    /// Encode and sign `message`, storing the packet inside it.
    pub fn encode(&self, message: &mut Message) -> Result<(), ConversionError> {
        let meta = message.meta().clone();
        if meta.cid() != self.prefix.cid() {
            return Err(ConversionError::WrongCommunity(meta.cid()));
        }

        let signers = match (meta.authentication(), message.authentication()) {
            (Authentication::Member { encoding }, AuthenticationImpl::Member { member, .. }) => {
                vec![signer_field(member, *encoding)]
            }
            (_, auth) => auth
                .members()
                .iter()
                .map(|m| signer_field(m, KeyEncoding::Mid))
                .collect(),
        };

        let body = WireBody {
            name: meta.name().to_string(),
            signers,
            global_time: message.global_time(),
            sequence_number: message.distribution().sequence_number,
            payload: message.payload().clone(),
        };
        let mut packet = Frame::encode_signed_part(&self.prefix, &body)?;
        let signed_len = packet.len();

        let authentication = match message.authentication() {
            AuthenticationImpl::NoAuthentication => AuthenticationImpl::NoAuthentication,
            AuthenticationImpl::Member { member, .. } => {
                let signature = member.sign(&packet)?;
                AuthenticationImpl::Member {
                    member: member.clone(),
                    signature: Some(signature),
                }
            }
            AuthenticationImpl::MultiMember {
                members,
                signatures,
            } => {
                let mut filled = Vec::with_capacity(members.len());
                for (member, existing) in members.iter().zip(signatures) {
                    let signature = match existing {
                        Some(signature) => Some(*signature),
                        None if member.has_private_key() => Some(member.sign(&packet)?),
                        None => None,
                    };
                    filled.push(signature);
                }
                AuthenticationImpl::MultiMember {
                    members: members.clone(),
                    signatures: filled,
                }
            }
        };

        match &authentication {
            AuthenticationImpl::NoAuthentication => {}
            AuthenticationImpl::Member { signature, .. } => {
                packet.extend_from_slice(signature.as_ref().unwrap_or(&EMPTY_SIGNATURE));
            }
            AuthenticationImpl::MultiMember { signatures, .. } => {
                for signature in signatures {
                    packet.extend_from_slice(signature.as_ref().unwrap_or(&EMPTY_SIGNATURE));
                }
            }
        }

        message.set_encoded(authentication, packet, signed_len);
        Ok(())
    }

    /// Decode a packet into a message of this community.
    ///
    /// With `allow_unsigned`, empty multi-member signature slots are accepted;
    /// this is only used for packets carried inside a signature request.
    pub fn decode(
        &self,
        packet: &[u8],
        registry: &MetaRegistry,
        resolver: &dyn MemberResolver,
        allow_unsigned: bool,
    ) -> Result<Message, ProtocolOutcome> {
        let frame = Frame::parse(packet).map_err(|e| DropReason::Malformed(e.to_string()))?;
        if frame.prefix != self.prefix {
            return Err(DropReason::UnknownConversion.into());
        }

        let body = frame.body;
        let meta = registry
            .get(&body.name)
            .ok_or_else(|| DropReason::UnknownMessage(body.name.clone()))?
            .clone();
        if body.payload.kind() != meta.payload_kind() {
            return Err(mismatch("payload kind"));
        }
        if frame.signatures.len() != body.signers.len() {
            return Err(mismatch("signature count"));
        }

        let signed = &packet[..frame.signed_len];
        let authentication = match meta.authentication() {
            Authentication::NoAuthentication => {
                if !body.signers.is_empty() {
                    return Err(mismatch("unexpected signer"));
                }
                AuthenticationImpl::NoAuthentication
            }
            Authentication::Member { encoding } => {
                let [field] = body.signers.as_slice() else {
                    return Err(mismatch("signer count"));
                };
                let signature = &frame.signatures[0];
                if *signature == EMPTY_SIGNATURE {
                    return Err(DropReason::Unsigned.into());
                }
                let member = match (field, encoding) {
                    (SignerField::PublicKey(key), KeyEncoding::PublicKey) => {
                        let member = resolver
                            .member_from_public_key(key)
                            .map_err(|e| DropReason::Malformed(e.to_string()))?;
                        if !member.verify(signed, signature) {
                            return Err(DropReason::InvalidSignature.into());
                        }
                        member
                    }
                    (SignerField::Mid(mid), KeyEncoding::Mid) => {
                        resolve_signer(resolver, mid, signed, signature)?
                    }
                    _ => return Err(mismatch("signer encoding")),
                };
                AuthenticationImpl::Member {
                    member,
                    signature: Some(*signature),
                }
            }
            Authentication::MultiMember { count, .. } => {
                if body.signers.len() != *count {
                    return Err(mismatch("signer count"));
                }
                let mut members = Vec::with_capacity(*count);
                let mut signatures = Vec::with_capacity(*count);
                for (field, signature) in body.signers.iter().zip(&frame.signatures) {
                    let SignerField::Mid(mid) = field else {
                        return Err(mismatch("signer encoding"));
                    };
                    if *signature == EMPTY_SIGNATURE {
                        if !allow_unsigned {
                            return Err(DropReason::Unsigned.into());
                        }
                        let candidates = resolver.members_by_mid(mid);
                        let member = candidates
                            .into_iter()
                            .next()
                            .ok_or(DelayTrigger::MissingMember { mid: *mid })?;
                        members.push(member);
                        signatures.push(None);
                    } else {
                        members.push(resolve_signer(resolver, mid, signed, signature)?);
                        signatures.push(Some(*signature));
                    }
                }
                AuthenticationImpl::MultiMember {
                    members,
                    signatures,
                }
            }
        };

        let distribution = DistributionImpl {
            global_time: body.global_time,
            sequence_number: body.sequence_number,
        };
        let destination = DestinationImpl::from_meta(&meta.destination());
        let mut message = meta
            .implement(authentication.clone(), distribution, destination, body.payload)
            .map_err(|e| DropReason::PolicyMismatch(e.to_string()))?;
        message.set_encoded(authentication, packet.to_vec(), frame.signed_len);
        Ok(message)
    }
}

fn signer_field(member: &Member, encoding: KeyEncoding) -> SignerField {
    match encoding {
        KeyEncoding::Mid => SignerField::Mid(member.mid()),
        KeyEncoding::PublicKey => SignerField::PublicKey(member.public_key().to_vec()),
    }
}

fn mismatch(what: &str) -> ProtocolOutcome {
    DropReason::PolicyMismatch(what.to_string()).into()
}

/// Find the member behind `mid` whose key verifies the signature.
///
/// Several public keys may share a mid, so each candidate is tried.
fn resolve_signer(
    resolver: &dyn MemberResolver,
    mid: &Mid,
    signed: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<Member, ProtocolOutcome> {
    let candidates = resolver.members_by_mid(mid);
    if candidates.is_empty() {
        return Err(DelayTrigger::MissingMember { mid: *mid }.into());
    }
    candidates
        .into_iter()
        .find(|member| member.verify(signed, signature))
        .ok_or_else(|| DropReason::InvalidSignature.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaMessage;
    use crate::policy::Distribution;
    use dispersy_types::{GlobalTime, Payload, PayloadKind};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Known(Mutex<HashMap<Mid, Vec<Member>>>);

    impl Known {
        fn add(&self, member: &Member) {
            self.0
                .lock()
                .unwrap()
                .entry(member.mid())
                .or_default()
                .push(member.public_only());
        }
    }

    impl MemberResolver for Known {
        fn members_by_mid(&self, mid: &Mid) -> Vec<Member> {
            self.0.lock().unwrap().get(mid).cloned().unwrap_or_default()
        }

        fn member_from_public_key(&self, public_key: &[u8]) -> Result<Member, MemberError> {
            let member = Member::from_public_key(public_key)?;
            self.add(&member);
            Ok(member)
        }
    }

    fn cid() -> Cid {
        Cid::from_master_key(b"master")
    }

    fn registry() -> MetaRegistry {
        let mut registry = MetaRegistry::new();
        registry
            .add(
                MetaMessage::builder("post", PayloadKind::Application)
                    .distribution(Distribution::full_sync())
                    .build(cid())
                    .unwrap(),
            )
            .unwrap();
        registry
            .add(
                MetaMessage::builder("hello", PayloadKind::Application)
                    .authentication(Authentication::Member {
                        encoding: KeyEncoding::PublicKey,
                    })
                    .build(cid())
                    .unwrap(),
            )
            .unwrap();
        registry
            .add(
                MetaMessage::builder("contract", PayloadKind::Application)
                    .authentication(Authentication::MultiMember {
                        count: 2,
                        allow_signature: None,
                    })
                    .build(cid())
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    fn post(registry: &MetaRegistry, author: &Member) -> Message {
        registry
            .get("post")
            .unwrap()
            .implement(
                AuthenticationImpl::member(author.clone()),
                DistributionImpl::new(GlobalTime::new(1)),
                DestinationImpl::Community,
                Payload::application(b"hi".to_vec()),
            )
            .unwrap()
    }

    #[test]
    fn encoded_message_decodes_for_known_member() {
        let registry = registry();
        let conversion = Conversion::new(cid(), DEFAULT_VERSION);
        let author = Member::generate();
        let mut message = post(&registry, &author);
        conversion.encode(&mut message).unwrap();

        let known = Known::default();
        known.add(&author);
        let decoded = conversion
            .decode(message.packet(), &registry, &known, false)
            .unwrap();
        assert_eq!(decoded.author(), Some(&author));
        assert_eq!(decoded.payload(), message.payload());
        assert_eq!(decoded.footprint(), message.footprint());
    }

    #[test]
    fn unknown_mid_delays_the_packet() {
        let registry = registry();
        let conversion = Conversion::new(cid(), DEFAULT_VERSION);
        let author = Member::generate();
        let mut message = post(&registry, &author);
        conversion.encode(&mut message).unwrap();

        let outcome = conversion
            .decode(message.packet(), &registry, &Known::default(), false)
            .unwrap_err();
        assert_eq!(
            outcome,
            ProtocolOutcome::Delay(DelayTrigger::MissingMember { mid: author.mid() })
        );
    }

    #[test]
    fn public_key_encoding_needs_no_prior_knowledge() {
        let registry = registry();
        let conversion = Conversion::new(cid(), DEFAULT_VERSION);
        let author = Member::generate();
        let mut message = registry
            .get("hello")
            .unwrap()
            .implement(
                AuthenticationImpl::member(author.clone()),
                DistributionImpl::new(GlobalTime::new(3)),
                DestinationImpl::Community,
                Payload::application(vec![]),
            )
            .unwrap();
        conversion.encode(&mut message).unwrap();

        let known = Known::default();
        let decoded = conversion
            .decode(message.packet(), &registry, &known, false)
            .unwrap();
        assert_eq!(decoded.author(), Some(&author));
        assert_eq!(known.members_by_mid(&author.mid()).len(), 1);
    }

    #[test]
    fn tampered_packet_fails_signature() {
        let registry = registry();
        let conversion = Conversion::new(cid(), DEFAULT_VERSION);
        let author = Member::generate();
        let mut message = post(&registry, &author);
        conversion.encode(&mut message).unwrap();

        let mut packet = message.packet().to_vec();
        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        let known = Known::default();
        known.add(&author);
        assert_eq!(
            conversion.decode(&packet, &registry, &known, false).unwrap_err(),
            ProtocolOutcome::Drop(DropReason::InvalidSignature)
        );
    }

    #[test]
    fn foreign_prefix_is_dropped() {
        let registry = registry();
        let author = Member::generate();
        let mut message = post(&registry, &author);
        Conversion::new(cid(), DEFAULT_VERSION)
            .encode(&mut message)
            .unwrap();

        let other = Conversion::new(cid(), [0x00, 0x02]);
        assert_eq!(
            other
                .decode(message.packet(), &registry, &Known::default(), false)
                .unwrap_err(),
            ProtocolOutcome::Drop(DropReason::UnknownConversion)
        );
    }

    #[test]
    fn multi_member_signatures_complete_in_order() {
        let registry = registry();
        let conversion = Conversion::new(cid(), DEFAULT_VERSION);
        let first = Member::generate();
        let second = Member::generate();
        let mut message = registry
            .get("contract")
            .unwrap()
            .implement(
                AuthenticationImpl::multi_member(vec![first.clone(), second.public_only()]),
                DistributionImpl::new(GlobalTime::new(2)),
                DestinationImpl::Community,
                Payload::application(vec![]),
            )
            .unwrap();
        conversion.encode(&mut message).unwrap();
        assert!(!message.authentication().is_signed());

        let known = Known::default();
        known.add(&first);
        known.add(&second);
        assert_eq!(
            conversion
                .decode(message.packet(), &registry, &known, false)
                .unwrap_err(),
            ProtocolOutcome::Drop(DropReason::Unsigned)
        );
        let request = conversion
            .decode(message.packet(), &registry, &known, true)
            .unwrap();

        let signature = second.sign(request.signed_part()).unwrap();
        message.add_signature(&second, signature).unwrap();
        assert!(message.authentication().is_signed());
        assert!(conversion
            .decode(message.packet(), &registry, &known, false)
            .is_ok());
    }
}
