//! Processing of received packets.
//!
//! Every packet takes the same path: decode, validate, store, handle. A
//! message that cannot be accepted yields a [`ProtocolOutcome`]. A delay parks
//! the packet and asks the sender for whatever is missing; a drop is logged,
//! and when it carries proof the proof goes back to the sender. Each accepted
//! message offers its footprint to the delay queue, and the packets it
//! releases are processed in the same batch.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;

use dispersy_core::{
    Authentication, AuthenticationImpl, BloomFilter, DelayTrigger, DelayedPacket, Destination,
    Distribution, DropReason, Member, Message, ProtocolOutcome, SequenceCheck, SyncDirection,
};
use dispersy_types::{DestroyDegree, GlobalTime, Mid, Payload, SIGNATURE_LEN};

use super::{builtin, Community};

/// The verdict on one packet.
pub type Verdict = Result<Message, ProtocolOutcome>;

/// Keep packets until `limit` bytes have been collected.
fn within_limit(packets: impl IntoIterator<Item = Vec<u8>>, limit: usize) -> Vec<Vec<u8>> {
    let mut total = 0;
    let mut out = Vec::new();
    for packet in packets {
        if total >= limit {
            break;
        }
        total += packet.len();
        out.push(packet);
    }
    out
}

/// The first signer of a multi-member message that has not signed yet.
pub(super) fn next_signer(message: &Message) -> Option<Member> {
    match message.authentication() {
        AuthenticationImpl::MultiMember {
            members,
            signatures,
        } => members
            .iter()
            .zip(signatures)
            .find(|(_, signature)| signature.is_none())
            .map(|(member, _)| member.clone()),
        _ => None,
    }
}

impl Community {
    /// Process packets received from the network.
    ///
    /// Returns one verdict per processed packet, in processing order. Packets
    /// released from the delay queue along the way are processed and reported
    /// after the packet that released them.
    pub fn on_incoming_packets(
        &mut self,
        packets: Vec<(Option<SocketAddr>, Vec<u8>)>,
    ) -> Vec<Verdict> {
        let mut queue: VecDeque<(Option<SocketAddr>, Vec<u8>)> = packets.into_iter().collect();
        let mut verdicts = Vec::with_capacity(queue.len());

        while let Some((source, packet)) = queue.pop_front() {
            let verdict = self.process_packet(source, &packet);
            match &verdict {
                Ok(message) => {
                    for released in self.delayed.release(&message.footprint()) {
                        tracing::debug!("releasing delayed packet ({})", released.trigger.label());
                        queue.push_back((released.source, released.packet));
                    }
                }
                Err(ProtocolOutcome::Delay(trigger)) => self.on_delay(source, packet, trigger),
                Err(ProtocolOutcome::Drop(reason)) => self.on_drop(source, reason),
            }
            verdicts.push(verdict);
        }
        verdicts
    }

    fn process_packet(&mut self, source: Option<SocketAddr>, packet: &[u8]) -> Verdict {
        let message = self.decode(packet, false)?;
        self.validate(&message)?;
        self.accept(source, &message)?;
        Ok(message)
    }

    /// Every check a received message must pass, cheapest first.
    fn validate(&self, message: &Message) -> Result<(), ProtocolOutcome> {
        let meta = message.meta();
        let is_builtin = builtin::is_builtin(message.name());

        if let Some((_, degree)) = self.timeline.destroyed() {
            let refused = if meta.distribution().is_synced() {
                !self.timeline.accepts(message.global_time())
            } else {
                degree == DestroyDegree::HardKill && !is_builtin
            };
            if refused {
                return Err(DropReason::Destroyed.into());
            }
        }

        let local = self.timeline.global_time();
        let range = self.context.config.sync.acceptable_global_time_range;
        if message.global_time().value() > local.value().saturating_add(range) {
            return Err(DropReason::GlobalTimeTooHigh {
                global_time: message.global_time(),
                local,
            }
            .into());
        }

        if meta.distribution().is_synced()
            && self
                .context
                .database
                .has_packet(self.database_id, message.packet())
        {
            return Err(DropReason::Duplicate.into());
        }

        if let (Some(sequence_number), Some(author)) =
            (message.distribution().sequence_number, message.author())
        {
            match self.sequences.check(author, message.name(), sequence_number) {
                SequenceCheck::Next => {}
                SequenceCheck::Duplicate => return Err(DropReason::Duplicate.into()),
                SequenceCheck::Gap {
                    missing_low,
                    missing_high,
                } => {
                    return Err(DelayTrigger::MissingSequence {
                        member: author.mid(),
                        message: message.name().to_string(),
                        missing_low,
                        missing_high,
                    }
                    .into())
                }
                SequenceCheck::GapTooLarge => return Err(DropReason::SequenceGapTooLarge.into()),
            }
        }

        if let Distribution::LastSync { history_size, .. } = meta.distribution() {
            self.check_history(message, history_size)?;
        }

        self.timeline.check(message)?;
        self.check_destination(message)?;
        if is_builtin {
            self.check_builtin(message)?;
        }
        meta.check(message)
    }

    /// A last-sync message older than everything its author still has
    /// stored would be pruned straight away.
    fn check_history(&self, message: &Message, history_size: usize) -> Result<(), ProtocolOutcome> {
        let Some(author) = message.authentication().members().first().map(Member::mid) else {
            return Ok(());
        };
        let history = self.context.database.messages_by_author(
            self.database_id,
            self.name_id(message.name()),
            &author,
        );
        if history.len() >= history_size {
            let oldest_kept = &history[history.len() - history_size];
            if message.global_time() <= oldest_kept.global_time {
                return Err(DropReason::Stale.into());
            }
        }
        Ok(())
    }

    fn check_destination(&self, message: &Message) -> Result<(), ProtocolOutcome> {
        let Some(author) = message.author() else {
            return Ok(());
        };
        if *author == self.my_member {
            return Ok(());
        }
        let mid = author.mid();

        match message.meta().destination() {
            Destination::Subjective { cluster, .. } => {
                let set = self.subjective_sets.get(&(mid, cluster)).ok_or(
                    DelayTrigger::MissingSubjectiveSet {
                        member: mid,
                        cluster,
                    },
                )?;
                if set.contains(self.my_member.public_key()) {
                    Ok(())
                } else {
                    Err(ProtocolOutcome::rejected("not in the author's subjective set"))
                }
            }
            Destination::Similarity {
                cluster, threshold, ..
            } => {
                let theirs = self.similarities.get(&(mid, cluster)).ok_or(
                    DelayTrigger::MissingSimilarity {
                        member: mid,
                        cluster,
                    },
                )?;
                let mine = self.my_similarity.get(&cluster).ok_or_else(|| {
                    ProtocolOutcome::rejected(format!("no similarity of our own for cluster {}", cluster))
                })?;
                let overlap: u32 = mine
                    .iter()
                    .zip(theirs)
                    .map(|(a, b)| (a & b).count_ones())
                    .sum();
                if overlap >= threshold {
                    Ok(())
                } else {
                    Err(ProtocolOutcome::rejected(format!(
                        "similarity {} below threshold {}",
                        overlap, threshold
                    )))
                }
            }
            _ => Ok(()),
        }
    }

    fn check_builtin(&self, message: &Message) -> Result<(), ProtocolOutcome> {
        match message.payload() {
            Payload::Sync { bloom, .. } => BloomFilter::from_bits(bloom)
                .map(|_| ())
                .ok_or_else(|| DropReason::Malformed("sync bloom filter".to_string()).into()),
            Payload::SubjectiveSet { subjective_set, .. } => BloomFilter::from_bits(subjective_set)
                .map(|_| ())
                .ok_or_else(|| DropReason::Malformed("subjective set".to_string()).into()),
            Payload::SignatureRequest { message: packet, .. } => self.signable(packet).map(|_| ()),
            Payload::SignatureResponse {
                identifier,
                signature,
            } => self.check_signature_response(*identifier, signature),
            _ => Ok(()),
        }
    }

    /// Decode a packet carried by a signature request and check that we may
    /// co-sign it now.
    fn signable(&self, packet: &[u8]) -> Result<Message, ProtocolOutcome> {
        let inner = self.decode(packet, true)?;
        let Authentication::MultiMember {
            allow_signature, ..
        } = inner.meta().authentication()
        else {
            return Err(ProtocolOutcome::rejected("not a multi-member message"));
        };
        let AuthenticationImpl::MultiMember {
            members,
            signatures,
        } = inner.authentication()
        else {
            return Err(ProtocolOutcome::rejected("not a multi-member message"));
        };

        let index = members
            .iter()
            .position(|member| *member == self.my_member)
            .ok_or_else(|| ProtocolOutcome::rejected("we are not a signer"))?;
        if signatures[index].is_some() {
            return Err(ProtocolOutcome::rejected("already signed"));
        }
        if signatures[..index].iter().any(Option::is_none) {
            return Err(ProtocolOutcome::rejected("earlier signers have not signed"));
        }
        match allow_signature {
            Some(allow) if allow(&inner) => Ok(inner),
            _ => Err(ProtocolOutcome::rejected("signature refused")),
        }
    }

    fn check_signature_response(
        &self,
        identifier: u64,
        signature: &[u8],
    ) -> Result<(), ProtocolOutcome> {
        let pending = self
            .signature_requests
            .get(&identifier)
            .ok_or_else(|| ProtocolOutcome::rejected("no pending signature request"))?;
        let signature: [u8; SIGNATURE_LEN] = signature
            .try_into()
            .map_err(|_| DropReason::Malformed("signature length".to_string()))?;
        let signer = next_signer(&pending.message)
            .ok_or_else(|| ProtocolOutcome::rejected("request is already signed"))?;
        let mut message = pending.message.clone();
        message
            .add_signature(&signer, signature)
            .map_err(|e| ProtocolOutcome::rejected(e.to_string()))
    }

    fn accept(&mut self, source: Option<SocketAddr>, message: &Message) -> Result<(), ProtocolOutcome> {
        if let Err(e) = self.store(message) {
            tracing::error!("failed to store {}: {}", message.name(), e);
            return Err(ProtocolOutcome::rejected(format!("storage failed: {}", e)));
        }
        self.timeline.update_global_time(message.global_time());
        for signer in message.authentication().members() {
            self.context.members.intern(&signer);
        }
        if let Some(address) = source {
            self.add_candidate(address, message.author().map(Member::mid));
        }
        self.remember(message);
        self.handle(source, message);
        Ok(())
    }

    /// Run the processing that follows acceptance.
    pub(super) fn handle(&mut self, source: Option<SocketAddr>, message: &Message) {
        if !builtin::is_builtin(message.name()) {
            message.meta().handle(message);
            return;
        }

        match message.payload() {
            Payload::IdentityRequest { mid } => {
                if let Some(address) = source {
                    let packets = self.stored_packets(builtin::IDENTITY, mid);
                    if packets.is_empty() {
                        tracing::debug!("no identity stored for {}", mid);
                    }
                    self.send(address, &packets);
                }
            }
            Payload::MissingProof {
                member,
                global_time,
            } => {
                if let Some(address) = source {
                    self.on_missing_proof(address, member, *global_time);
                }
            }
            Payload::MissingSequence {
                member,
                message: name,
                missing_low,
                missing_high,
            } => {
                if let Some(address) = source {
                    self.on_missing_sequence(address, member, name, *missing_low, *missing_high);
                }
            }
            Payload::Sync {
                time_low,
                time_high,
                bloom,
            } => {
                if let (Some(address), Some(filter)) = (source, BloomFilter::from_bits(bloom)) {
                    self.on_sync(address, *time_low, *time_high, &filter);
                }
            }
            Payload::SignatureRequest {
                identifier,
                message: packet,
            } => {
                if let Some(address) = source {
                    self.on_signature_request(address, *identifier, packet);
                }
            }
            Payload::SignatureResponse {
                identifier,
                signature,
            } => self.on_signature_response(*identifier, signature),
            Payload::DestroyCommunity { degree } => self.on_destroy(message, *degree),
            Payload::SubjectiveSetRequest { members, .. } => {
                if let Some(address) = source {
                    self.on_stored_request(address, builtin::SUBJECTIVE_SET, members);
                }
            }
            Payload::SimilarityRequest { members, .. } => {
                if let Some(address) = source {
                    self.on_stored_request(address, builtin::SIMILARITY, members);
                }
            }
            Payload::Identity
            | Payload::Authorize { .. }
            | Payload::Revoke { .. }
            | Payload::SubjectiveSet { .. }
            | Payload::Similarity { .. }
            | Payload::Application { .. } => {}
        }
    }

    fn on_missing_proof(&self, address: SocketAddr, mid: &Mid, global_time: GlobalTime) {
        let mut packets: Vec<Vec<u8>> = Vec::new();
        for member in self.context.members.get_by_mid(mid) {
            for packet in self.timeline.proof_for(&member, global_time) {
                if !packets.contains(&packet) {
                    packets.push(packet);
                }
            }
        }
        tracing::debug!("sending {} proof packet(s) for {} to {}", packets.len(), mid, address);
        self.send(address, &packets);
    }

    fn on_missing_sequence(
        &self,
        address: SocketAddr,
        mid: &Mid,
        name: &str,
        missing_low: u32,
        missing_high: u32,
    ) {
        if self.registry.get(name).is_none() {
            tracing::debug!("missing-sequence for unknown message {}", name);
            return;
        }
        let stored = self
            .context
            .database
            .messages_by_author(self.database_id, self.name_id(name), mid)
            .into_iter()
            .filter(|m| {
                m.sequence_number
                    .is_some_and(|n| missing_low <= n && n <= missing_high)
            })
            .map(|m| m.packet);
        let packets = within_limit(stored, self.context.config.sync.missing_sequence_response_limit);
        tracing::debug!(
            "sending {} packet(s) of {} [{}, {}] to {}",
            packets.len(),
            name,
            missing_low,
            missing_high,
            address
        );
        self.send(address, &packets);
    }

    /// Answer a sync with the stored packets the bloom filter lacks.
    ///
    /// Last-sync messages kept newest first go out before everything else,
    /// newest first; the rest follow oldest first.
    fn on_sync(&self, address: SocketAddr, time_low: u64, time_high: u64, bloom: &BloomFilter) {
        let high = (time_high != 0).then(|| GlobalTime::new(time_high));
        let descending: HashSet<u32> = self
            .registry
            .iter()
            .filter(|meta| {
                matches!(
                    meta.distribution(),
                    Distribution::LastSync {
                        direction: SyncDirection::Descending,
                        ..
                    }
                )
            })
            .map(|meta| self.name_id(meta.name()))
            .collect();

        let mut missing: Vec<_> = self
            .context
            .database
            .messages_in_range(self.database_id, GlobalTime::new(time_low), high)
            .into_iter()
            .filter(|m| !bloom.contains(&m.packet))
            .collect();
        missing.sort_by_key(|m| {
            let time = m.global_time.value();
            if descending.contains(&m.name) {
                (false, u64::MAX - time)
            } else {
                (true, time)
            }
        });

        let packets = within_limit(
            missing.into_iter().map(|m| m.packet),
            self.context.config.sync.response_limit,
        );
        tracing::debug!(
            "sync [{}, {}] from {}: sending {} packet(s)",
            time_low,
            time_high,
            address,
            packets.len()
        );
        self.send(address, &packets);
    }

    fn on_signature_request(&mut self, address: SocketAddr, identifier: u64, packet: &[u8]) {
        let inner = match self.signable(packet) {
            Ok(inner) => inner,
            Err(outcome) => {
                tracing::debug!("not signing request {}: {}", identifier, outcome);
                return;
            }
        };
        let signature = match self.my_member.sign(inner.signed_part()) {
            Ok(signature) => signature,
            Err(e) => {
                tracing::warn!("cannot sign request {}: {}", identifier, e);
                return;
            }
        };
        let payload = Payload::SignatureResponse {
            identifier,
            signature: signature.to_vec(),
        };
        match self.create_direct(builtin::SIGNATURE_RESPONSE, payload, address) {
            Ok(response) => {
                tracing::debug!("signed {} for request {}", inner.name(), identifier);
                self.forward(&response);
            }
            Err(e) => tracing::warn!("failed to answer signature request {}: {}", identifier, e),
        }
    }

    fn on_signature_response(&mut self, identifier: u64, signature: &[u8]) {
        let Some(mut pending) = self.signature_requests.remove(&identifier) else {
            return;
        };
        let (Some(signer), Ok(signature)) = (
            next_signer(&pending.message),
            <[u8; SIGNATURE_LEN]>::try_from(signature),
        ) else {
            self.signature_requests.insert(identifier, pending);
            return;
        };
        if let Err(e) = pending.message.add_signature(&signer, signature) {
            tracing::debug!("ignoring signature for request {}: {}", identifier, e);
            self.signature_requests.insert(identifier, pending);
            return;
        }

        if !pending.message.authentication().is_signed() {
            let partial = pending.message.clone();
            (pending.callback)(Some(partial.clone()));
            self.signature_requests.insert(identifier, pending);
            match self.request_next_signature(identifier, &partial) {
                Ok(sent) => tracing::debug!(
                    "signature request {} passed on to {} address(es)",
                    identifier,
                    sent
                ),
                Err(e) => tracing::warn!("cannot pass on signature request {}: {}", identifier, e),
            }
            return;
        }

        self.context.scheduler.unregister(&pending.timeout);
        tracing::debug!("signature request {} complete", identifier);
        if let Err(e) = self.publish(&pending.message) {
            tracing::warn!("signed {} was refused: {}", pending.message.name(), e);
        }
        (pending.callback)(Some(pending.message));
    }

    fn on_destroy(&mut self, message: &Message, degree: DestroyDegree) {
        tracing::info!("community {} destroyed ({:?}) at {}", self.cid, degree, message.global_time());
        if degree != DestroyDegree::HardKill {
            return;
        }

        let mut keep = vec![message.packet().to_vec()];
        for signer in message.authentication().members() {
            keep.extend(self.timeline.proof_for(&signer, message.global_time()));
        }
        let purged = self.context.database.purge_messages(self.database_id, &keep);

        self.bloom.clear();
        for stored in self
            .context
            .database
            .messages_in_range(self.database_id, GlobalTime::zero(), None)
        {
            self.bloom.add(stored.global_time, &stored.packet);
        }
        self.delayed.clear();
        self.sequences.clear();
        tracing::info!("hard kill of {} purged {} message(s)", self.cid, purged);
    }

    fn on_stored_request(&self, address: SocketAddr, name: &str, members: &[Mid]) {
        let packets: Vec<Vec<u8>> = members
            .iter()
            .flat_map(|mid| self.stored_packets(name, mid))
            .collect();
        self.send(address, &packets);
    }

    fn on_delay(&mut self, source: Option<SocketAddr>, packet: Vec<u8>, trigger: &DelayTrigger) {
        let enqueued = DelayedPacket::new(self.cid, source, packet, trigger.clone())
            .and_then(|delayed| self.delayed.enqueue(delayed));
        match enqueued {
            Ok(true) => tracing::debug!("delaying packet: {}", trigger.label()),
            Ok(false) => tracing::debug!("packet already delayed: {}", trigger.label()),
            Err(e) => {
                tracing::warn!("dropping packet: {}", e);
                return;
            }
        }

        let Some(address) = source else {
            return;
        };
        let (name, payload) = match trigger.clone() {
            DelayTrigger::MissingMember { mid } => {
                (builtin::IDENTITY_REQUEST, Payload::IdentityRequest { mid })
            }
            DelayTrigger::MissingSequence {
                member,
                message,
                missing_low,
                missing_high,
            } => (
                builtin::MISSING_SEQUENCE,
                Payload::MissingSequence {
                    member,
                    message,
                    missing_low,
                    missing_high,
                },
            ),
            DelayTrigger::MissingProof {
                member,
                global_time,
            } => (
                builtin::MISSING_PROOF,
                Payload::MissingProof {
                    member,
                    global_time,
                },
            ),
            DelayTrigger::MissingSubjectiveSet { member, cluster } => (
                builtin::SUBJECTIVE_SET_REQUEST,
                Payload::SubjectiveSetRequest {
                    cluster,
                    members: vec![member],
                },
            ),
            DelayTrigger::MissingSimilarity { member, cluster } => (
                builtin::SIMILARITY_REQUEST,
                Payload::SimilarityRequest {
                    cluster,
                    members: vec![member],
                },
            ),
        };
        match self.create_direct(name, payload, address) {
            Ok(request) => {
                self.forward(&request);
            }
            Err(e) => tracing::warn!("failed to create {}: {}", name, e),
        }
    }

    fn on_drop(&self, source: Option<SocketAddr>, reason: &DropReason) {
        match (reason, source) {
            (DropReason::ByProof { proof }, Some(address)) => {
                tracing::debug!("dropping message by proof, informing {}", address);
                self.send(address, proof);
            }
            (reason, source) => tracing::debug!("dropping packet from {:?}: {:?}", source, reason),
        }
    }
}
