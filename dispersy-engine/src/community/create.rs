//! Creating local messages.
//!
//! A local message is implemented from its meta-message, stamped with a
//! claimed global time (and a sequence number when the distribution uses
//! them), encoded and signed with the default conversion, and then
//! published: checked against our own timeline, stored, handled and
//! forwarded.

use std::net::SocketAddr;
use std::time::Duration;

use dispersy_core::{
    AuthenticationImpl, BloomFilter, DestinationImpl, DistributionImpl, DropReason, Member,
    MemberError, Message, PolicyError, ProtocolOutcome, SignatureError,
};
use dispersy_types::{DestroyDegree, Payload, Permission, PermissionGrant};

use super::incoming::next_signer;
use super::{builtin, Community, PendingSignature};
use crate::error::{DispersyError, Result};
use crate::scheduler::Task;

/// Receives the progress of a signature request.
///
/// Called with `Some(message)` after every accepted co-signature and with
/// `None` when the request times out. It runs while the community is locked.
pub type SignatureCallback = Box<dyn FnMut(Option<Message>) + Send>;

impl Community {
    /// Create and publish a message signed by our member.
    pub fn create_message(&mut self, name: &str, payload: Payload) -> Result<Message> {
        let authentication = AuthenticationImpl::member(self.my_member.clone());
        self.create_message_with(name, authentication, None, payload)
    }

    /// Create and publish a message with explicit signers and recipients.
    ///
    /// Without `destination` the meta-message's own is used; address and
    /// member destinations need one to have any recipient.
    pub fn create_message_with(
        &mut self,
        name: &str,
        authentication: AuthenticationImpl,
        destination: Option<DestinationImpl>,
        payload: Payload,
    ) -> Result<Message> {
        let message = self.implement(name, authentication, destination, payload)?;
        self.publish(&message)?;
        Ok(message)
    }

    fn implement(
        &mut self,
        name: &str,
        authentication: AuthenticationImpl,
        destination: Option<DestinationImpl>,
        payload: Payload,
    ) -> Result<Message> {
        let meta = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| DispersyError::UnknownMessage(name.to_string()))?;

        let global_time = if meta.distribution().is_synced() {
            self.timeline.claim_global_time()
        } else {
            self.timeline.global_time()
        };
        let distribution = match (meta.distribution().has_sequence_number(), authentication.member_ref()) {
            (false, _) => DistributionImpl::new(global_time),
            (true, Some(author)) => {
                let sequence_number = self.sequences.next(author, name);
                DistributionImpl::with_sequence(global_time, sequence_number)
            }
            (true, None) => return Err(PolicyError::ImplementationMismatch("distribution").into()),
        };
        let destination =
            destination.unwrap_or_else(|| DestinationImpl::from_meta(&meta.destination()));

        let mut message = meta.implement(authentication, distribution, destination, payload)?;
        self.default_conversion().encode(&mut message)?;
        Ok(message)
    }

    /// Check, store, handle and forward a complete local message.
    pub(super) fn publish(&mut self, message: &Message) -> Result<()> {
        let synced = message.meta().distribution().is_synced();
        if synced && !self.timeline.accepts(message.global_time()) {
            return Err(ProtocolOutcome::drop(DropReason::Destroyed).into());
        }
        self.timeline.check(message)?;
        message.meta().check(message)?;

        self.store(message)?;
        self.timeline.update_global_time(message.global_time());
        self.remember(message);
        if synced || !builtin::is_builtin(message.name()) {
            self.handle(None, message);
        }
        self.forward(message);

        let released: Vec<_> = self
            .delayed
            .release(&message.footprint())
            .into_iter()
            .map(|delayed| (delayed.source, delayed.packet))
            .collect();
        if !released.is_empty() {
            tracing::debug!("{} released {} delayed packet(s)", message.name(), released.len());
            self.on_incoming_packets(released);
        }
        Ok(())
    }

    /// An unsigned request or reply to one address; the caller forwards it.
    pub(super) fn create_direct(
        &mut self,
        name: &str,
        payload: Payload,
        address: SocketAddr,
    ) -> Result<Message> {
        self.implement(
            name,
            AuthenticationImpl::NoAuthentication,
            Some(DestinationImpl::Address(vec![address])),
            payload,
        )
    }

    /// Publish our member's public key.
    pub fn create_identity(&mut self) -> Result<Message> {
        self.create_message(builtin::IDENTITY, Payload::Identity)
    }

    /// Grant rights; signed by the master member when `sign_with_master`.
    pub fn create_authorize(
        &mut self,
        grants: Vec<(Member, String, Permission)>,
        sign_with_master: bool,
    ) -> Result<Message> {
        let permissions = self.grants(grants)?;
        let signer = self.grant_signer(sign_with_master)?;
        self.create_message_with(
            builtin::AUTHORIZE,
            AuthenticationImpl::member(signer),
            None,
            Payload::Authorize { permissions },
        )
    }

    /// Withdraw rights; signed by the master member when `sign_with_master`.
    pub fn create_revoke(
        &mut self,
        grants: Vec<(Member, String, Permission)>,
        sign_with_master: bool,
    ) -> Result<Message> {
        let permissions = self.grants(grants)?;
        let signer = self.grant_signer(sign_with_master)?;
        self.create_message_with(
            builtin::REVOKE,
            AuthenticationImpl::member(signer),
            None,
            Payload::Revoke { permissions },
        )
    }

    fn grants(&self, grants: Vec<(Member, String, Permission)>) -> Result<Vec<PermissionGrant>> {
        grants
            .into_iter()
            .map(|(member, message, permission)| {
                if self.registry.get(&message).is_none() {
                    return Err(DispersyError::UnknownMessage(message));
                }
                Ok(PermissionGrant {
                    member_public_key: member.public_key().to_vec(),
                    message,
                    permission,
                })
            })
            .collect()
    }

    fn grant_signer(&self, sign_with_master: bool) -> Result<Member> {
        let signer = if sign_with_master {
            &self.master
        } else {
            &self.my_member
        };
        if !signer.has_private_key() {
            return Err(MemberError::NoPrivateKey(signer.mid()).into());
        }
        Ok(signer.clone())
    }

    /// Destroy the community.
    pub fn create_destroy_community(&mut self, degree: DestroyDegree) -> Result<Message> {
        self.create_message(
            builtin::DESTROY_COMMUNITY,
            Payload::DestroyCommunity { degree },
        )
    }

    /// Publish the members we accept subjective messages from in `cluster`.
    pub fn create_subjective_set(&mut self, cluster: u8, members: &[Member]) -> Result<Message> {
        let sync = &self.context.config.sync;
        let mut filter = BloomFilter::new(sync.bloom_slices, sync.bloom_bits_per_slice);
        for member in members {
            filter.add(member.public_key());
        }
        self.create_message(
            builtin::SUBJECTIVE_SET,
            Payload::SubjectiveSet {
                cluster,
                subjective_set: filter.to_bits(),
            },
        )
    }

    /// Publish our similarity bits for `cluster`.
    pub fn create_similarity(&mut self, cluster: u8, similarity: Vec<u8>) -> Result<Message> {
        self.create_message(
            builtin::SIMILARITY,
            Payload::Similarity {
                cluster,
                similarity,
            },
        )
    }

    /// Build a multi-member message, signed in every slot whose member we
    /// hold the key of.
    ///
    /// The message is not published; pass it to
    /// [`create_signature_request`](Self::create_signature_request).
    pub fn create_multi_member_message(
        &mut self,
        name: &str,
        signers: Vec<Member>,
        payload: Payload,
    ) -> Result<Message> {
        self.implement(name, AuthenticationImpl::multi_member(signers), None, payload)
    }

    /// Ask the remaining signers of `message` to co-sign it.
    ///
    /// Signers sign in slot order, so the request goes to the first one that
    /// has not signed yet; each co-signature sends the updated message on to
    /// the next. Once every signer has signed, the message is published and
    /// the callback receives it. Without completion within `timeout` (default
    /// from the configuration) the callback receives `None` and later
    /// responses are dropped. Returns the request identifier.
    pub fn create_signature_request(
        &mut self,
        message: Message,
        callback: SignatureCallback,
        timeout: Option<Duration>,
    ) -> Result<u64> {
        if !matches!(message.authentication(), AuthenticationImpl::MultiMember { .. }) {
            return Err(SignatureError::NotMultiMember.into());
        }
        if next_signer(&message).is_none() {
            return Err(SignatureError::AlreadySigned.into());
        }

        let identifier = loop {
            let identifier = rand::random::<u64>();
            if !self.signature_requests.contains_key(&identifier) {
                break identifier;
            }
        };
        let sent = self.request_next_signature(identifier, &message)?;

        let timeout = timeout.unwrap_or_else(|| self.context.config.signature.timeout());
        let community = self.this.clone();
        let task = self.context.scheduler.register(
            Task::call(move || {
                if let Some(community) = community.upgrade() {
                    let pending = community.lock().signature_requests.remove(&identifier);
                    if let Some(mut pending) = pending {
                        tracing::debug!("signature request {} timed out", identifier);
                        (pending.callback)(None);
                    }
                }
                Ok(())
            })
            .delay(timeout),
        );

        self.signature_requests.insert(
            identifier,
            PendingSignature {
                message,
                callback,
                timeout: task,
            },
        );
        tracing::debug!("signature request {} sent to {} address(es)", identifier, sent);
        Ok(identifier)
    }

    /// Send `message` to its first unsigned signer under `identifier`.
    ///
    /// Returns the number of addresses the request went to.
    pub(super) fn request_next_signature(&mut self, identifier: u64, message: &Message) -> Result<usize> {
        let signer = next_signer(message).ok_or(SignatureError::AlreadySigned)?;
        let request = self.implement(
            builtin::SIGNATURE_REQUEST,
            AuthenticationImpl::NoAuthentication,
            Some(DestinationImpl::Member(vec![signer])),
            Payload::SignatureRequest {
                identifier,
                message: message.packet().to_vec(),
            },
        )?;
        Ok(self.forward(&request))
    }

    /// Advertise bloom buckets to random candidates.
    ///
    /// Returns the number of sync messages sent.
    pub fn sync_round(&mut self) -> Result<usize> {
        let mut sent = 0;
        for advert in self.dispersy_sync_bloom_filters() {
            let message = self.implement(
                builtin::SYNC,
                AuthenticationImpl::member(self.my_member.clone()),
                None,
                Payload::Sync {
                    time_low: advert.time_low,
                    time_high: advert.time_high,
                    bloom: advert.bloom,
                },
            )?;
            sent += self.forward(&message);
        }
        tracing::debug!("sync round for {}: {} message(s) sent", self.cid, sent);
        Ok(sent)
    }
}
