//! The member cache.
//!
//! Members are interned by public key so every part of the engine shares one
//! [`Member`] per identity. This is the one structure touched directly from
//! several threads; lookups take a read lock and creation re-checks under
//! the write lock before inserting.

use std::collections::HashMap;
use std::sync::Arc;

use dispersy_core::{Member, MemberError, MemberResolver};
use dispersy_types::Mid;
use parking_lot::RwLock;

use crate::store::Database;

#[derive(Default)]
struct Interned {
    by_key: HashMap<Vec<u8>, Member>,
    by_mid: HashMap<Mid, Vec<Member>>,
}

/// Process-wide member cache backed by the database.
pub struct MemberCache {
    database: Arc<dyn Database>,
    members: RwLock<Interned>,
}

impl MemberCache {
    /// An empty cache over `database`.
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self {
            database,
            members: RwLock::new(Interned::default()),
        }
    }

    /// The member with this public key, creating it on first use.
    ///
    /// If the database holds the matching private key, the member can sign.
    /// Only for keys we trust, such as a community's own master and user
    /// keys; keys read off the wire go through [`lookup`](Self::lookup).
    pub fn get_or_create(&self, public_key: &[u8]) -> Result<Member, MemberError> {
        let member = self.lookup(public_key)?;
        self.intern(&member);
        Ok(member)
    }

    /// The member with this public key, without remembering it.
    pub fn lookup(&self, public_key: &[u8]) -> Result<Member, MemberError> {
        if let Some(member) = self.members.read().by_key.get(public_key) {
            return Ok(member.clone());
        }
        match self.database.private_key(public_key) {
            Some(private_key) => Member::from_private_key(&private_key),
            None => Member::from_public_key(public_key),
        }
    }

    /// Remember a member whose signature has been verified.
    pub fn intern(&self, member: &Member) {
        if self.members.read().by_key.contains_key(member.public_key()) {
            return;
        }
        let mut members = self.members.write();
        if members.by_key.contains_key(member.public_key()) {
            return;
        }
        self.database.store_user(member.public_key());
        Self::insert(&mut members, member.clone());
    }

    /// Intern a member that holds its private key, storing the key.
    ///
    /// Replaces a public-only entry for the same identity.
    pub fn add_private(&self, member: &Member) {
        if let Some(private_key) = member.private_key() {
            self.database.store_key(member.public_key(), &private_key);
        }
        let mut members = self.members.write();
        if let Some(existing) = members.by_key.get(member.public_key()) {
            if existing.has_private_key() || !member.has_private_key() {
                return;
            }
            let mid = member.mid();
            if let Some(list) = members.by_mid.get_mut(&mid) {
                list.retain(|m| m.public_key() != member.public_key());
            }
        }
        Self::insert(&mut members, member.clone());
    }

    fn insert(members: &mut Interned, member: Member) {
        members
            .by_mid
            .entry(member.mid())
            .or_default()
            .push(member.clone());
        members.by_key.insert(member.public_key().to_vec(), member);
    }

    /// Every known member with this mid, loading stored keys on demand.
    pub fn get_by_mid(&self, mid: &Mid) -> Vec<Member> {
        let cached = self
            .members
            .read()
            .by_mid
            .get(mid)
            .cloned()
            .unwrap_or_default();
        let stored = self.database.users_by_mid(mid);
        if stored.len() <= cached.len() {
            return cached;
        }
        stored
            .iter()
            .filter_map(|key| match self.get_or_create(key) {
                Ok(member) => Some(member),
                Err(e) => {
                    tracing::warn!("stored key for {} is invalid: {}", mid, e);
                    None
                }
            })
            .collect()
    }

    /// Number of interned members.
    pub fn len(&self) -> usize {
        self.members.read().by_key.len()
    }

    /// Whether nothing is interned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MemberResolver for MemberCache {
    fn members_by_mid(&self, mid: &Mid) -> Vec<Member> {
        self.get_by_mid(mid)
    }

    fn member_from_public_key(&self, public_key: &[u8]) -> Result<Member, MemberError> {
        self.lookup(public_key)
    }
}

impl std::fmt::Debug for MemberCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberCache")
            .field("members", &self.len())
            .finish()
    }
}
