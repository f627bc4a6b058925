//! Storage layer for dispersy-engine.
//!
//! The engine consumes a relational-style store holding communities, member
//! keys, message-name ids, routing candidates and the message log. The
//! [`Database`] trait is that contract; [`MemoryDatabase`] implements it in
//! memory.

mod memory;

pub use memory::MemoryDatabase;

use std::net::SocketAddr;

use dispersy_types::{Cid, GlobalTime, Mid};
use zeroize::Zeroizing;

use crate::error::StoreError;

/// Routing rows of this community id are copied into every new community.
pub const BOOTSTRAP_COMMUNITY: u64 = 0;

/// Routing candidates kept per community.
pub const MAX_CANDIDATES: usize = 256;

/// A stored community.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunityRow {
    /// Database id.
    pub id: u64,
    /// Community id.
    pub cid: Cid,
    /// Public key of the master member.
    pub master_public_key: Vec<u8>,
    /// Public key of the member we act as.
    pub user_public_key: Vec<u8>,
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Id of the message name (see [`Database::name_id`]).
    pub name: u32,
    /// Mid of the first signer.
    pub author: Option<Mid>,
    /// Global time of the message.
    pub global_time: GlobalTime,
    /// Sequence number, if the distribution uses them.
    pub sequence_number: Option<u32>,
    /// The packet.
    pub packet: Vec<u8>,
}

/// A peer we can send to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Where to send.
    pub address: SocketAddr,
    /// The member last seen at that address, if any.
    pub mid: Option<Mid>,
}

/// Request to create a community row with everything it needs.
#[derive(Debug, Clone)]
pub struct NewCommunity<'a> {
    /// Community id.
    pub cid: Cid,
    /// Master public key.
    pub master_public_key: &'a [u8],
    /// Master private key, only when we created the community.
    pub master_private_key: Option<&'a [u8]>,
    /// Our public key.
    pub user_public_key: &'a [u8],
}

/// Trait for storage backends.
///
/// Methods take `&self`; implementations serialise access internally.
pub trait Database: Send + Sync {
    /// Insert the community, its users, the master key (if given) and a copy
    /// of the bootstrap routing rows. Either everything is stored or nothing.
    fn create_community(&self, new: NewCommunity<'_>) -> Result<CommunityRow, StoreError>;

    /// Get a community by cid.
    fn community(&self, cid: &Cid) -> Result<CommunityRow, StoreError>;

    /// All stored communities.
    fn communities(&self) -> Vec<CommunityRow>;

    /// Remember a public key. Returns its mid.
    fn store_user(&self, public_key: &[u8]) -> Mid;

    /// Public keys whose mid is `mid`.
    fn users_by_mid(&self, mid: &Mid) -> Vec<Vec<u8>>;

    /// Store a private key for `public_key`.
    fn store_key(&self, public_key: &[u8], private_key: &[u8]);

    /// The private key for `public_key`, if we hold it.
    fn private_key(&self, public_key: &[u8]) -> Option<Zeroizing<Vec<u8>>>;

    /// The id of a message name, created on first use and stable afterwards.
    fn name_id(&self, name: &str) -> u32;

    /// Add or refresh a routing candidate.
    ///
    /// Tables are bounded by [`MAX_CANDIDATES`]; the least recently seen
    /// candidate goes first.
    fn add_candidate(&self, community: u64, candidate: Candidate);

    /// Routing candidates of a community, most recently seen first.
    fn candidates(&self, community: u64) -> Vec<Candidate>;

    /// Append to the message log. Returns `false` if the packet is already stored.
    fn store_message(&self, community: u64, message: StoredMessage) -> Result<bool, StoreError>;

    /// Whether this exact packet is stored.
    fn has_packet(&self, community: u64, packet: &[u8]) -> bool;

    /// Messages with `low <= global_time <= high` (no upper bound when
    /// `high` is `None`), ordered by global time.
    fn messages_in_range(
        &self,
        community: u64,
        low: GlobalTime,
        high: Option<GlobalTime>,
    ) -> Vec<StoredMessage>;

    /// Messages of one name by one author, ordered by global time.
    fn messages_by_author(&self, community: u64, name: u32, author: &Mid) -> Vec<StoredMessage>;

    /// Remove one packet from the log.
    fn delete_message(&self, community: u64, packet: &[u8]) -> bool;

    /// Remove every packet of the community except those in `keep`.
    /// Returns the number removed.
    fn purge_messages(&self, community: u64, keep: &[Vec<u8>]) -> usize;
}
