//! The timeline: a community's clock and permission history.
//!
//! Rights are granted and withdrawn by `dispersy-authorize` and
//! `dispersy-revoke` messages, each stamped with a global time. Checking a
//! message replays that history up to the message's own global time. The
//! master member implicitly holds every right.

use std::collections::HashMap;

use dispersy_types::{DestroyDegree, GlobalTime, Payload, Permission, PermissionGrant};

use crate::member::Member;
use crate::meta::Message;
use crate::outcome::{DelayTrigger, DropReason, ProtocolOutcome};
use crate::policy::Resolution;

#[derive(Debug, Clone)]
struct Change {
    global_time: GlobalTime,
    granted: bool,
    proof: Vec<u8>,
}

/// The state of a right at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Standing {
    /// Held; the packets prove it (empty for the master).
    Granted(Vec<Vec<u8>>),
    /// Withdrawn; the revoke packet proves it.
    Revoked(Vec<Vec<u8>>),
    /// No grant is known.
    Unknown,
}

type GrantKey = (Vec<u8>, String, Permission);

/// Clock and permission history of one community.
#[derive(Debug, Clone)]
pub struct Timeline {
    master: Member,
    global_time: GlobalTime,
    changes: HashMap<GrantKey, Vec<Change>>,
    destroyed: Option<(GlobalTime, DestroyDegree)>,
}

impl Timeline {
    /// A fresh timeline for the community owned by `master`.
    pub fn new(master: Member) -> Self {
        Self {
            master,
            global_time: GlobalTime::zero(),
            changes: HashMap::new(),
            destroyed: None,
        }
    }

    /// The highest global time seen or claimed.
    pub fn global_time(&self) -> GlobalTime {
        self.global_time
    }

    /// Advance the clock and return the new value.
    pub fn claim_global_time(&mut self) -> GlobalTime {
        self.global_time = self.global_time.next();
        self.global_time
    }

    /// Move the clock forward to at least `global_time`.
    pub fn update_global_time(&mut self, global_time: GlobalTime) {
        if global_time > self.global_time {
            self.global_time = global_time;
        }
    }

    /// Whether `member` held `permission` on `message` at `global_time`.
    ///
    /// When a grant and a revoke share a global time, the revoke wins.
    pub fn standing(
        &self,
        member: &Member,
        message: &str,
        permission: Permission,
        global_time: GlobalTime,
    ) -> Standing {
        if *member == self.master {
            return Standing::Granted(Vec::new());
        }
        let key = (member.public_key().to_vec(), message.to_string(), permission);
        let last = self.changes.get(&key).and_then(|changes| {
            changes
                .iter()
                .filter(|change| change.global_time <= global_time)
                .last()
        });
        match last {
            Some(change) if change.granted => Standing::Granted(vec![change.proof.clone()]),
            Some(change) => Standing::Revoked(vec![change.proof.clone()]),
            None => Standing::Unknown,
        }
    }

    fn require(
        &self,
        member: &Member,
        message: &str,
        permission: Permission,
        global_time: GlobalTime,
    ) -> Result<(), ProtocolOutcome> {
        match self.standing(member, message, permission, global_time) {
            Standing::Granted(_) => Ok(()),
            Standing::Revoked(proof) => Err(DropReason::ByProof { proof }.into()),
            Standing::Unknown => Err(DelayTrigger::MissingProof {
                member: member.mid(),
                global_time,
            }
            .into()),
        }
    }

    /// Whether the signers of `message` held the rights it needs.
    ///
    /// Authorize and revoke messages additionally require the author to hold
    /// the matching right on every message named in the payload.
    pub fn check(&self, message: &Message) -> Result<(), ProtocolOutcome> {
        let global_time = message.global_time();
        let signers = message.authentication().members();

        if message.meta().resolution() == Resolution::Linear {
            for signer in &signers {
                self.require(signer, message.name(), Permission::Permit, global_time)?;
            }
        }

        let (grants, needed) = match message.payload() {
            Payload::Authorize { permissions } => (permissions, Permission::Authorize),
            Payload::Revoke { permissions } => (permissions, Permission::Revoke),
            _ => return Ok(()),
        };
        for signer in &signers {
            for grant in grants {
                self.require(signer, &grant.message, needed, global_time)?;
            }
        }
        Ok(())
    }

    fn record(&mut self, grant: &PermissionGrant, change: Change) {
        let key = (
            grant.member_public_key.clone(),
            grant.message.clone(),
            grant.permission,
        );
        let changes = self.changes.entry(key).or_default();
        if changes
            .iter()
            .any(|c| c.global_time == change.global_time && c.granted == change.granted)
        {
            return;
        }
        changes.push(change);
        // Grants before revokes at the same time, so the revoke is replayed last.
        changes.sort_by_key(|c| (c.global_time, !c.granted));
    }

    /// Apply an accepted `dispersy-authorize` or `dispersy-revoke`.
    pub fn apply(&mut self, message: &Message) {
        let (grants, granted) = match message.payload() {
            Payload::Authorize { permissions } => (permissions, true),
            Payload::Revoke { permissions } => (permissions, false),
            _ => return,
        };
        for grant in grants {
            self.record(
                grant,
                Change {
                    global_time: message.global_time(),
                    granted,
                    proof: message.packet().to_vec(),
                },
            );
        }
        self.update_global_time(message.global_time());
    }

    /// Grant packets that establish `member`'s rights up to `global_time`.
    pub fn proof_for(&self, member: &Member, global_time: GlobalTime) -> Vec<Vec<u8>> {
        let mut proof: Vec<Vec<u8>> = Vec::new();
        for ((public_key, _, _), changes) in &self.changes {
            if public_key.as_slice() != member.public_key() {
                continue;
            }
            for change in changes.iter().filter(|c| c.global_time <= global_time) {
                if !proof.contains(&change.proof) {
                    proof.push(change.proof.clone());
                }
            }
        }
        proof
    }

    /// Every grant packet in the history.
    pub fn all_proofs(&self) -> Vec<Vec<u8>> {
        let mut proof: Vec<Vec<u8>> = Vec::new();
        for change in self.changes.values().flatten() {
            if !proof.contains(&change.proof) {
                proof.push(change.proof.clone());
            }
        }
        proof
    }

    /// Mark the community destroyed at `global_time`.
    pub fn destroy(&mut self, global_time: GlobalTime, degree: DestroyDegree) {
        self.destroyed = Some((global_time, degree));
    }

    /// The destroy time and degree, if destroyed.
    pub fn destroyed(&self) -> Option<(GlobalTime, DestroyDegree)> {
        self.destroyed
    }

    /// Whether a message at `global_time` may still be accepted.
    pub fn accepts(&self, global_time: GlobalTime) -> bool {
        match self.destroyed {
            None => true,
            Some((_, DestroyDegree::HardKill)) => false,
            Some((at, DestroyDegree::SoftKill)) => global_time <= at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::{Conversion, DEFAULT_VERSION};
    use crate::meta::MetaMessage;
    use crate::policy::{AuthenticationImpl, DestinationImpl, Distribution, DistributionImpl};
    use dispersy_types::{Cid, PayloadKind};

    struct Fixture {
        master: Member,
        cid: Cid,
        conversion: Conversion,
    }

    impl Fixture {
        fn new() -> Self {
            let master = Member::generate();
            let cid = Cid::from_master_key(master.public_key());
            Self {
                master,
                cid,
                conversion: Conversion::new(cid, DEFAULT_VERSION),
            }
        }

        fn grant_meta(&self, name: &str, kind: PayloadKind) -> MetaMessage {
            MetaMessage::builder(name, kind)
                .distribution(Distribution::full_sync())
                .build(self.cid)
                .unwrap()
        }

        fn grant(
            &self,
            signer: &Member,
            to: &Member,
            message: &str,
            permission: Permission,
            time: u64,
            revoke: bool,
        ) -> Message {
            let permissions = vec![PermissionGrant {
                member_public_key: to.public_key().to_vec(),
                message: message.into(),
                permission,
            }];
            let (meta, payload) = if revoke {
                (
                    self.grant_meta("dispersy-revoke", PayloadKind::Revoke),
                    Payload::Revoke { permissions },
                )
            } else {
                (
                    self.grant_meta("dispersy-authorize", PayloadKind::Authorize),
                    Payload::Authorize { permissions },
                )
            };
            let mut message = meta
                .implement(
                    AuthenticationImpl::member(signer.clone()),
                    DistributionImpl::new(GlobalTime::new(time)),
                    DestinationImpl::Community,
                    payload,
                )
                .unwrap();
            self.conversion.encode(&mut message).unwrap();
            message
        }

        fn linear(&self, author: &Member, time: u64) -> Message {
            let meta = MetaMessage::builder("vote", PayloadKind::Application)
                .resolution(Resolution::Linear)
                .distribution(Distribution::full_sync())
                .build(self.cid)
                .unwrap();
            let mut message = meta
                .implement(
                    AuthenticationImpl::member(author.clone()),
                    DistributionImpl::new(GlobalTime::new(time)),
                    DestinationImpl::Community,
                    Payload::application(vec![]),
                )
                .unwrap();
            self.conversion.encode(&mut message).unwrap();
            message
        }
    }

    #[test]
    fn claimed_times_strictly_increase() {
        let mut timeline = Timeline::new(Member::generate());
        let a = timeline.claim_global_time();
        let b = timeline.claim_global_time();
        assert!(b > a);
        timeline.update_global_time(GlobalTime::new(100));
        assert_eq!(timeline.claim_global_time(), GlobalTime::new(101));
        timeline.update_global_time(GlobalTime::new(5));
        assert_eq!(timeline.global_time(), GlobalTime::new(101));
    }

    #[test]
    fn master_holds_every_right() {
        let f = Fixture::new();
        let timeline = Timeline::new(f.master.clone());
        timeline.check(&f.linear(&f.master, 3)).unwrap();
    }

    #[test]
    fn missing_grant_delays_for_proof() {
        let f = Fixture::new();
        let timeline = Timeline::new(f.master.clone());
        let author = Member::generate();
        assert_eq!(
            timeline.check(&f.linear(&author, 3)).unwrap_err(),
            ProtocolOutcome::Delay(DelayTrigger::MissingProof {
                member: author.mid(),
                global_time: GlobalTime::new(3)
            })
        );
    }

    #[test]
    fn grant_permits_later_messages_only() {
        let f = Fixture::new();
        let mut timeline = Timeline::new(f.master.clone());
        let author = Member::generate();
        let grant = f.grant(&f.master, &author, "vote", Permission::Permit, 5, false);
        timeline.check(&grant).unwrap();
        timeline.apply(&grant);

        timeline.check(&f.linear(&author, 6)).unwrap();
        assert!(timeline.check(&f.linear(&author, 4)).unwrap_err().is_delay());
        assert_eq!(timeline.global_time(), GlobalTime::new(5));
    }

    #[test]
    fn revoke_wins_at_equal_time_and_carries_proof() {
        let f = Fixture::new();
        let mut timeline = Timeline::new(f.master.clone());
        let author = Member::generate();
        timeline.apply(&f.grant(&f.master, &author, "vote", Permission::Permit, 5, false));
        let revoke = f.grant(&f.master, &author, "vote", Permission::Permit, 5, true);
        timeline.apply(&revoke);

        let outcome = timeline.check(&f.linear(&author, 7)).unwrap_err();
        assert_eq!(
            outcome,
            ProtocolOutcome::Drop(DropReason::ByProof {
                proof: vec![revoke.packet().to_vec()]
            })
        );
    }

    #[test]
    fn authorizing_requires_the_authorize_right() {
        let f = Fixture::new();
        let mut timeline = Timeline::new(f.master.clone());
        let delegate = Member::generate();
        let other = Member::generate();

        let attempt = f.grant(&delegate, &other, "vote", Permission::Permit, 4, false);
        assert!(timeline.check(&attempt).unwrap_err().is_delay());

        timeline.apply(&f.grant(&f.master, &delegate, "vote", Permission::Authorize, 2, false));
        timeline.check(&attempt).unwrap();
    }

    #[test]
    fn proof_lists_member_grants() {
        let f = Fixture::new();
        let mut timeline = Timeline::new(f.master.clone());
        let author = Member::generate();
        let grant = f.grant(&f.master, &author, "vote", Permission::Permit, 2, false);
        timeline.apply(&grant);
        assert_eq!(
            timeline.proof_for(&author, GlobalTime::new(10)),
            vec![grant.packet().to_vec()]
        );
        assert!(timeline.proof_for(&author, GlobalTime::new(1)).is_empty());
        assert_eq!(timeline.all_proofs().len(), 1);
    }

    #[test]
    fn soft_kill_freezes_at_destroy_time() {
        let mut timeline = Timeline::new(Member::generate());
        timeline.destroy(GlobalTime::new(10), DestroyDegree::SoftKill);
        assert!(timeline.accepts(GlobalTime::new(10)));
        assert!(!timeline.accepts(GlobalTime::new(11)));
        timeline.destroy(GlobalTime::new(10), DestroyDegree::HardKill);
        assert!(!timeline.accepts(GlobalTime::new(1)));
    }
}
