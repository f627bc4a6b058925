//! The community runtime.
//!
//! A [`Community`] binds one community row of the database to everything
//! needed to take part in it:
//!
//! - the meta-message registry, built-ins first (see [`builtin`])
//! - the conversion table, one conversion marked default
//! - the [`Timeline`] with the global clock and permission history
//! - the bloom [`BloomIndex`] summarising stored messages for sync
//! - per-author sequence tracking and the delay queue
//!
//! The [`Dispersy`](crate::Dispersy) context keeps every loaded community
//! behind a mutex and all mutating methods take `&mut self`, so a community
//! is only ever worked on by one thread at a time.
//!
//! Received packets go through [`Community::on_incoming_packets`]; local
//! messages are built by the `create_*` methods.

pub mod builtin;
mod create;
mod incoming;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use dispersy_core::{
    BloomFilter, BloomIndex, Conversion, ConversionError, DelayQueue, DropReason, Member,
    MetaMessage, MetaRegistry, Message, ProtocolOutcome, SequenceTracker, SyncAdvert, Timeline,
    DEFAULT_VERSION,
};
use dispersy_types::{Cid, ConversionPrefix, GlobalTime, Mid, Payload};
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::dispersy::Context;
use crate::error::Result;
use crate::scheduler::TaskId;
use crate::store::{Candidate, CommunityRow, StoredMessage};

pub use create::SignatureCallback;
pub use incoming::Verdict;

/// A signature request waiting for co-signers.
struct PendingSignature {
    message: Message,
    callback: SignatureCallback,
    timeout: TaskId,
}

/// One loaded community.
pub struct Community {
    context: Arc<Context>,
    this: Weak<Mutex<Community>>,
    database_id: u64,
    cid: Cid,
    master: Member,
    my_member: Member,
    registry: MetaRegistry,
    name_ids: HashMap<String, u32>,
    conversions: Vec<Conversion>,
    default_conversion: usize,
    timeline: Timeline,
    bloom: BloomIndex,
    sequences: SequenceTracker,
    delayed: DelayQueue,
    signature_requests: HashMap<u64, PendingSignature>,
    subjective_sets: HashMap<(Mid, u8), BloomFilter>,
    similarities: HashMap<(Mid, u8), Vec<u8>>,
    my_similarity: HashMap<u8, Vec<u8>>,
}

impl Community {
    pub(crate) fn new(
        context: Arc<Context>,
        this: Weak<Mutex<Community>>,
        row: &CommunityRow,
        master: Member,
        my_member: Member,
        registry: MetaRegistry,
    ) -> Self {
        let name_ids = registry
            .iter()
            .map(|meta| {
                (
                    meta.name().to_string(),
                    context.database.name_id(meta.name()),
                )
            })
            .collect();
        let sync = &context.config.sync;
        let bloom = BloomIndex::new(sync.bloom_step, sync.bloom_slices, sync.bloom_bits_per_slice);
        let delayed = DelayQueue::new(context.config.delay.max_delayed);

        Self {
            database_id: row.id,
            cid: row.cid,
            timeline: Timeline::new(master.clone()),
            master,
            my_member,
            registry,
            name_ids,
            conversions: vec![Conversion::new(row.cid, DEFAULT_VERSION)],
            default_conversion: 0,
            bloom,
            sequences: SequenceTracker::new(),
            delayed,
            signature_requests: HashMap::new(),
            subjective_sets: HashMap::new(),
            similarities: HashMap::new(),
            my_similarity: HashMap::new(),
            context,
            this,
        }
    }

    /// Community id.
    pub fn cid(&self) -> Cid {
        self.cid
    }

    /// Id of the community row in the database.
    pub fn database_id(&self) -> u64 {
        self.database_id
    }

    /// The master member; its key hashes to the cid.
    pub fn master_member(&self) -> &Member {
        &self.master
    }

    /// The member we sign as.
    pub fn my_member(&self) -> &Member {
        &self.my_member
    }

    /// Permission history and clock.
    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// The highest global time seen or claimed.
    pub fn global_time(&self) -> GlobalTime {
        self.timeline.global_time()
    }

    /// Advance the global clock and return the new value.
    pub fn claim_global_time(&mut self) -> GlobalTime {
        self.timeline.claim_global_time()
    }

    /// Look up a meta-message by name.
    pub fn get_meta_message(&self, name: &str) -> Option<&MetaMessage> {
        self.registry.get(name)
    }

    /// All meta-messages, built-ins included.
    pub fn meta_messages(&self) -> impl Iterator<Item = &MetaMessage> {
        self.registry.iter()
    }

    /// The conversion used for outgoing packets.
    pub fn default_conversion(&self) -> &Conversion {
        &self.conversions[self.default_conversion]
    }

    /// The conversion matching a packet prefix.
    pub fn get_conversion(&self, prefix: &ConversionPrefix) -> Option<&Conversion> {
        self.conversions.iter().find(|c| c.prefix() == *prefix)
    }

    /// Register another wire version, optionally making it the default.
    pub fn add_conversion(&mut self, conversion: Conversion, default: bool) -> Result<()> {
        if conversion.prefix().cid() != self.cid {
            return Err(ConversionError::WrongCommunity(conversion.prefix().cid()).into());
        }
        let index = match self.conversions.iter().position(|c| *c == conversion) {
            Some(index) => index,
            None => {
                self.conversions.push(conversion);
                self.conversions.len() - 1
            }
        };
        if default {
            self.default_conversion = index;
        }
        Ok(())
    }

    /// The bucket covering `global_time`, created on demand.
    pub fn get_bloom_filter(&mut self, global_time: GlobalTime) -> &dispersy_core::BloomBucket {
        self.bloom.get_bloom_filter(global_time)
    }

    /// The sync index, newest bucket first.
    pub fn bloom_index(&self) -> &BloomIndex {
        &self.bloom
    }

    /// The buckets to advertise in the next sync round.
    pub fn dispersy_sync_bloom_filters(&self) -> Vec<SyncAdvert> {
        self.bloom.select_for_sync(&mut rand::thread_rng())
    }

    /// Number of parked packets.
    pub fn delayed_count(&self) -> usize {
        self.delayed.len()
    }

    /// Routing candidates, most recently seen first.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.context.database.candidates(self.database_id)
    }

    /// Record a peer, optionally with the member seen at that address.
    pub fn add_candidate(&self, address: SocketAddr, mid: Option<Mid>) {
        self.context
            .database
            .add_candidate(self.database_id, Candidate { address, mid });
    }

    /// Stored packets signed first by `mid` for message `name`, oldest first.
    pub fn stored_packets(&self, name: &str, mid: &Mid) -> Vec<Vec<u8>> {
        self.context
            .database
            .messages_by_author(self.database_id, self.name_id(name), mid)
            .into_iter()
            .map(|stored| stored.packet)
            .collect()
    }

    fn name_id(&self, name: &str) -> u32 {
        match self.name_ids.get(name) {
            Some(id) => *id,
            None => self.context.database.name_id(name),
        }
    }

    fn decode(&self, packet: &[u8], allow_unsigned: bool) -> std::result::Result<Message, ProtocolOutcome> {
        let prefix = ConversionPrefix::from_packet(packet)
            .ok_or_else(|| DropReason::Malformed("packet shorter than its prefix".to_string()))?;
        let conversion = self
            .get_conversion(&prefix)
            .ok_or(DropReason::UnknownConversion)?;
        conversion.decode(packet, &self.registry, &*self.context.members, allow_unsigned)
    }

    fn send(&self, address: SocketAddr, packets: &[Vec<u8>]) {
        if packets.is_empty() {
            return;
        }
        if let Err(e) = self.context.transport.send(address, packets) {
            tracing::warn!("failed to send {} packet(s) to {}: {}", packets.len(), address, e);
        }
    }

    /// Send a message to the recipients its destination names.
    ///
    /// Returns the number of addresses the packet went to.
    fn forward(&self, message: &Message) -> usize {
        use dispersy_core::DestinationImpl;

        let packets = [message.packet().to_vec()];
        let addresses: Vec<SocketAddr> = match message.destination() {
            DestinationImpl::Address(addresses) => addresses.clone(),
            DestinationImpl::Member(members) => {
                let mids: Vec<Mid> = members.iter().map(Member::mid).collect();
                self.candidates()
                    .into_iter()
                    .filter(|c| c.mid.is_some_and(|mid| mids.contains(&mid)))
                    .map(|c| c.address)
                    .collect()
            }
            DestinationImpl::Community
            | DestinationImpl::Subjective { .. }
            | DestinationImpl::Similarity { .. } => {
                let count = message.meta().destination().node_count().unwrap_or(0);
                let candidates = self.candidates();
                candidates
                    .choose_multiple(&mut rand::thread_rng(), count)
                    .map(|c| c.address)
                    .collect()
            }
        };

        for address in &addresses {
            self.send(*address, &packets);
        }
        tracing::debug!(
            "forwarded {} to {} address(es)",
            message.name(),
            addresses.len()
        );
        addresses.len()
    }

    /// Store a synced message and index it.
    ///
    /// Returns false when the packet was already stored.
    fn store(&mut self, message: &Message) -> Result<bool> {
        let meta = message.meta();
        if !meta.distribution().is_synced() {
            return Ok(false);
        }
        let name = self.name_id(message.name());
        let author = message.authentication().members().first().map(Member::mid);
        let stored = self.context.database.store_message(
            self.database_id,
            StoredMessage {
                name,
                author,
                global_time: message.global_time(),
                sequence_number: message.distribution().sequence_number,
                packet: message.packet().to_vec(),
            },
        )?;
        if !stored {
            return Ok(false);
        }

        self.bloom.add(message.global_time(), message.packet());
        if let (Some(sequence_number), Some(member)) =
            (message.distribution().sequence_number, message.author())
        {
            self.sequences.accept(member, message.name(), sequence_number);
        }
        if let (dispersy_core::Distribution::LastSync { history_size, .. }, Some(author)) =
            (meta.distribution(), author)
        {
            let history =
                self.context
                    .database
                    .messages_by_author(self.database_id, name, &author);
            if history.len() > history_size {
                for old in &history[..history.len() - history_size] {
                    self.context.database.delete_message(self.database_id, &old.packet);
                }
            }
        }
        Ok(true)
    }

    /// Rebuild the in-memory state from the stored message log.
    pub(crate) fn load_from_store(&mut self) {
        let stored = self
            .context
            .database
            .messages_in_range(self.database_id, GlobalTime::zero(), None);
        let total = stored.len();
        let mut loaded = 0;

        for row in stored {
            let message = match self.decode(&row.packet, false) {
                Ok(message) => message,
                Err(outcome) => {
                    tracing::warn!("skipping stored packet of {}: {}", self.cid, outcome);
                    continue;
                }
            };
            self.bloom.add(message.global_time(), message.packet());
            if let (Some(sequence_number), Some(member)) =
                (message.distribution().sequence_number, message.author())
            {
                self.sequences.accept(member, message.name(), sequence_number);
            }
            self.remember(&message);
            self.timeline.update_global_time(message.global_time());
            loaded += 1;
        }
        tracing::info!("loaded {} of {} stored messages for {}", loaded, total, self.cid);
    }

    /// Apply the state carried by an accepted message.
    fn remember(&mut self, message: &Message) {
        if !builtin::is_builtin(message.name()) {
            return;
        }
        let author = message.author().map(Member::mid);
        match (message.payload(), author) {
            (Payload::Authorize { .. } | Payload::Revoke { .. }, _) => self.timeline.apply(message),
            (Payload::DestroyCommunity { degree }, _) => {
                self.timeline.destroy(message.global_time(), *degree)
            }
            (
                Payload::SubjectiveSet {
                    cluster,
                    subjective_set,
                },
                Some(author),
            ) => match BloomFilter::from_bits(subjective_set) {
                Some(filter) => {
                    self.subjective_sets.insert((author, *cluster), filter);
                }
                None => tracing::warn!("ignoring malformed subjective set from {}", author),
            },
            (
                Payload::Similarity {
                    cluster,
                    similarity,
                },
                Some(author),
            ) => {
                if author == self.my_member.mid() {
                    self.my_similarity.insert(*cluster, similarity.clone());
                }
                self.similarities
                    .insert((author, *cluster), similarity.clone());
            }
            _ => {}
        }
    }

}

impl fmt::Debug for Community {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Community")
            .field("cid", &self.cid)
            .field("database_id", &self.database_id)
            .field("my_member", &self.my_member.mid())
            .field("global_time", &self.timeline.global_time())
            .field("meta_messages", &self.registry.len())
            .field("delayed", &self.delayed.len())
            .finish()
    }
}
