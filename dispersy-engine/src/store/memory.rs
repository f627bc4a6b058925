//! In-memory storage backend.

use std::collections::{BTreeMap, HashMap};

use dispersy_types::{Cid, GlobalTime, Mid};
use parking_lot::Mutex;
use zeroize::Zeroizing;

use super::{
    Candidate, CommunityRow, Database, NewCommunity, StoredMessage, BOOTSTRAP_COMMUNITY,
    MAX_CANDIDATES,
};
use crate::error::StoreError;

#[derive(Default)]
struct Tables {
    communities: BTreeMap<u64, CommunityRow>,
    next_community: u64,
    users: HashMap<Vec<u8>, Mid>,
    keys: HashMap<Vec<u8>, Zeroizing<Vec<u8>>>,
    names: HashMap<String, u32>,
    routing: HashMap<u64, Vec<Candidate>>,
    messages: HashMap<u64, Vec<StoredMessage>>,
}

impl Tables {
    fn user(&mut self, public_key: &[u8]) -> Mid {
        *self
            .users
            .entry(public_key.to_vec())
            .or_insert_with(|| Mid::from_public_key(public_key))
    }
}

/// Store that lives as long as the process.
///
/// One lock covers every table, so each method is a transaction.
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<Tables>,
}

impl MemoryDatabase {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose bootstrap routing table holds `candidates`.
    pub fn with_bootstrap(candidates: impl IntoIterator<Item = Candidate>) -> Self {
        let db = Self::new();
        for candidate in candidates {
            db.add_candidate(BOOTSTRAP_COMMUNITY, candidate);
        }
        db
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("MemoryDatabase")
            .field("communities", &tables.communities.len())
            .field("users", &tables.users.len())
            .field("keys", &format!("[{} REDACTED]", tables.keys.len()))
            .finish()
    }
}

impl Database for MemoryDatabase {
    fn create_community(&self, new: NewCommunity<'_>) -> Result<CommunityRow, StoreError> {
        let mut tables = self.tables.lock();
        if tables.communities.values().any(|row| row.cid == new.cid) {
            return Err(StoreError::DuplicateCommunity(new.cid));
        }

        tables.next_community += 1;
        let row = CommunityRow {
            id: tables.next_community,
            cid: new.cid,
            master_public_key: new.master_public_key.to_vec(),
            user_public_key: new.user_public_key.to_vec(),
        };
        tables.communities.insert(row.id, row.clone());
        tables.user(new.master_public_key);
        tables.user(new.user_public_key);
        if let Some(private_key) = new.master_private_key {
            tables.keys.insert(
                new.master_public_key.to_vec(),
                Zeroizing::new(private_key.to_vec()),
            );
        }
        let bootstrap = tables
            .routing
            .get(&BOOTSTRAP_COMMUNITY)
            .cloned()
            .unwrap_or_default();
        tables.routing.insert(row.id, bootstrap);

        tracing::debug!("stored community {} as #{}", row.cid, row.id);
        Ok(row)
    }

    fn community(&self, cid: &Cid) -> Result<CommunityRow, StoreError> {
        self.tables
            .lock()
            .communities
            .values()
            .find(|row| row.cid == *cid)
            .cloned()
            .ok_or(StoreError::UnknownCommunity(*cid))
    }

    fn communities(&self) -> Vec<CommunityRow> {
        self.tables.lock().communities.values().cloned().collect()
    }

    fn store_user(&self, public_key: &[u8]) -> Mid {
        self.tables.lock().user(public_key)
    }

    fn users_by_mid(&self, mid: &Mid) -> Vec<Vec<u8>> {
        self.tables
            .lock()
            .users
            .iter()
            .filter(|(_, m)| *m == mid)
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn store_key(&self, public_key: &[u8], private_key: &[u8]) {
        let mut tables = self.tables.lock();
        tables.user(public_key);
        tables
            .keys
            .insert(public_key.to_vec(), Zeroizing::new(private_key.to_vec()));
    }

    fn private_key(&self, public_key: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        self.tables.lock().keys.get(public_key).cloned()
    }

    fn name_id(&self, name: &str) -> u32 {
        let mut tables = self.tables.lock();
        let next = tables.names.len() as u32 + 1;
        *tables.names.entry(name.to_string()).or_insert(next)
    }

    fn add_candidate(&self, community: u64, candidate: Candidate) {
        let mut tables = self.tables.lock();
        let routing = tables.routing.entry(community).or_default();
        if let Some(pos) = routing.iter().position(|c| c.address == candidate.address) {
            let existing = routing.remove(pos);
            routing.insert(
                0,
                Candidate {
                    address: candidate.address,
                    mid: candidate.mid.or(existing.mid),
                },
            );
        } else {
            routing.insert(0, candidate);
            routing.truncate(MAX_CANDIDATES);
        }
    }

    fn candidates(&self, community: u64) -> Vec<Candidate> {
        self.tables
            .lock()
            .routing
            .get(&community)
            .cloned()
            .unwrap_or_default()
    }

    fn store_message(&self, community: u64, message: StoredMessage) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        if !tables.communities.contains_key(&community) {
            return Err(StoreError::UnknownCommunityId(community));
        }
        let log = tables.messages.entry(community).or_default();
        if log.iter().any(|m| m.packet == message.packet) {
            return Ok(false);
        }
        let pos = log.partition_point(|m| m.global_time <= message.global_time);
        log.insert(pos, message);
        Ok(true)
    }

    fn has_packet(&self, community: u64, packet: &[u8]) -> bool {
        self.tables
            .lock()
            .messages
            .get(&community)
            .is_some_and(|log| log.iter().any(|m| m.packet == packet))
    }

    fn messages_in_range(
        &self,
        community: u64,
        low: GlobalTime,
        high: Option<GlobalTime>,
    ) -> Vec<StoredMessage> {
        let tables = self.tables.lock();
        let Some(log) = tables.messages.get(&community) else {
            return Vec::new();
        };
        log.iter()
            .filter(|m| m.global_time >= low && high.map_or(true, |high| m.global_time <= high))
            .cloned()
            .collect()
    }

    fn messages_by_author(&self, community: u64, name: u32, author: &Mid) -> Vec<StoredMessage> {
        let tables = self.tables.lock();
        let Some(log) = tables.messages.get(&community) else {
            return Vec::new();
        };
        log.iter()
            .filter(|m| m.name == name && m.author.as_ref() == Some(author))
            .cloned()
            .collect()
    }

    fn delete_message(&self, community: u64, packet: &[u8]) -> bool {
        let mut tables = self.tables.lock();
        let Some(log) = tables.messages.get_mut(&community) else {
            return false;
        };
        let before = log.len();
        log.retain(|m| m.packet != packet);
        log.len() != before
    }

    fn purge_messages(&self, community: u64, keep: &[Vec<u8>]) -> usize {
        let mut tables = self.tables.lock();
        let Some(log) = tables.messages.get_mut(&community) else {
            return 0;
        };
        let before = log.len();
        log.retain(|m| keep.contains(&m.packet));
        before - log.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_community<'a>(cid: Cid, master: &'a [u8], user: &'a [u8]) -> NewCommunity<'a> {
        NewCommunity {
            cid,
            master_public_key: master,
            master_private_key: Some(b"secret"),
            user_public_key: user,
        }
    }

    fn stored(name: u32, author: Mid, gt: u64, packet: &[u8]) -> StoredMessage {
        StoredMessage {
            name,
            author: Some(author),
            global_time: GlobalTime::new(gt),
            sequence_number: None,
            packet: packet.to_vec(),
        }
    }

    #[test]
    fn create_community_stores_all_rows() {
        let bootstrap = Candidate {
            address: "127.0.0.1:6421".parse().unwrap(),
            mid: None,
        };
        let db = MemoryDatabase::with_bootstrap([bootstrap]);
        let cid = Cid::from_master_key(b"master");
        let row = db.create_community(new_community(cid, b"master", b"me")).unwrap();

        assert_eq!(db.community(&cid).unwrap(), row);
        assert!(db.private_key(b"master").is_some());
        assert_eq!(db.users_by_mid(&Mid::from_public_key(b"me")), vec![b"me".to_vec()]);
        assert_eq!(db.candidates(row.id), vec![bootstrap]);
    }

    #[test]
    fn duplicate_community_changes_nothing() {
        let db = MemoryDatabase::new();
        let cid = Cid::from_master_key(b"master");
        db.create_community(new_community(cid, b"master", b"me")).unwrap();
        let err = db
            .create_community(new_community(cid, b"master", b"other"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCommunity(_)));
        assert_eq!(db.communities().len(), 1);
        assert!(db.users_by_mid(&Mid::from_public_key(b"other")).is_empty());
    }

    #[test]
    fn name_ids_are_stable() {
        let db = MemoryDatabase::new();
        let post = db.name_id("post");
        let like = db.name_id("like");
        assert_ne!(post, like);
        assert_eq!(db.name_id("post"), post);
    }

    #[test]
    fn message_log_is_ordered_and_deduplicated() {
        let db = MemoryDatabase::new();
        let cid = Cid::from_master_key(b"master");
        let row = db.create_community(new_community(cid, b"master", b"me")).unwrap();
        let author = Mid::from_public_key(b"me");

        assert!(db.store_message(row.id, stored(1, author, 5, b"b")).unwrap());
        assert!(db.store_message(row.id, stored(1, author, 2, b"a")).unwrap());
        assert!(!db.store_message(row.id, stored(1, author, 2, b"a")).unwrap());
        assert!(db.has_packet(row.id, b"a"));

        let all = db.messages_in_range(row.id, GlobalTime::new(1), None);
        let packets: Vec<_> = all.iter().map(|m| m.packet.clone()).collect();
        assert_eq!(packets, vec![b"a".to_vec(), b"b".to_vec()]);

        let early = db.messages_in_range(row.id, GlobalTime::new(1), Some(GlobalTime::new(3)));
        assert_eq!(early.len(), 1);
    }

    #[test]
    fn purge_keeps_listed_packets() {
        let db = MemoryDatabase::new();
        let cid = Cid::from_master_key(b"master");
        let row = db.create_community(new_community(cid, b"master", b"me")).unwrap();
        let author = Mid::from_public_key(b"me");
        for (gt, packet) in [(1, b"x"), (2, b"y"), (3, b"z")] {
            db.store_message(row.id, stored(1, author, gt, packet)).unwrap();
        }
        assert_eq!(db.purge_messages(row.id, &[b"y".to_vec()]), 2);
        assert_eq!(db.messages_by_author(row.id, 1, &author).len(), 1);
    }

    #[test]
    fn candidates_are_refreshed_not_duplicated() {
        let db = MemoryDatabase::new();
        let address = "10.0.0.1:1".parse().unwrap();
        let mid = Mid::from_public_key(b"peer");
        db.add_candidate(7, Candidate { address, mid: Some(mid) });
        db.add_candidate(7, Candidate { address, mid: None });
        assert_eq!(db.candidates(7), vec![Candidate { address, mid: Some(mid) }]);
    }

    #[test]
    fn routing_table_keeps_the_most_recent_candidates() {
        let db = MemoryDatabase::new();
        for port in 0..MAX_CANDIDATES as u16 + 10 {
            let address = std::net::SocketAddr::from(([10, 0, 0, 1], port));
            db.add_candidate(7, Candidate { address, mid: None });
        }
        let candidates = db.candidates(7);
        assert_eq!(candidates.len(), MAX_CANDIDATES);
        assert_eq!(candidates[0].address.port(), MAX_CANDIDATES as u16 + 9);
        assert!(candidates.iter().all(|c| c.address.port() >= 10));
    }
}
