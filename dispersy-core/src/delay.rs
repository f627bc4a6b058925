//! Packets parked on a missing identity, proof, sequence range, subjective
//! set or similarity.
//!
//! Each [`DelayedPacket`] carries the footprint pattern of the message that
//! satisfies its trigger. Accepting a message offers its footprint to
//! [`DelayQueue::release`]; matching packets come back in the order they
//! were parked and go through validation again.

use std::net::SocketAddr;

use dispersy_types::Cid;

use crate::footprint::{FootprintError, FootprintPattern, FootprintQuery};
use crate::outcome::DelayTrigger;

/// Why a packet could not be parked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelayQueueError {
    /// Every slot is taken.
    #[error("delay queue full (capacity: {capacity})")]
    Full {
        /// Parked packets allowed.
        capacity: usize,
    },

    /// The release pattern did not compile.
    #[error(transparent)]
    Pattern(#[from] FootprintError),
}

/// The footprint pattern that satisfies a trigger.
pub fn release_pattern(cid: Cid, trigger: &DelayTrigger) -> Result<FootprintPattern, FootprintError> {
    match trigger {
        DelayTrigger::MissingMember { mid } => FootprintQuery::new("dispersy-identity", cid)
            .members(vec![*mid])
            .build(),
        DelayTrigger::MissingSequence {
            member,
            message,
            missing_high,
            ..
        } => FootprintQuery::new(message.clone(), cid)
            .members(vec![*member])
            .sequence_number(*missing_high)
            .build(),
        DelayTrigger::MissingProof { .. } => FootprintQuery::new("dispersy-authorize", cid).build(),
        DelayTrigger::MissingSubjectiveSet { member, .. } => {
            FootprintQuery::new("dispersy-subjective-set", cid)
                .members(vec![*member])
                .build()
        }
        DelayTrigger::MissingSimilarity { member, .. } => {
            FootprintQuery::new("dispersy-similarity", cid)
                .members(vec![*member])
                .build()
        }
    }
}

/// A packet parked until a matching message is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedPacket {
    /// What the packet waits for.
    pub pattern: FootprintPattern,
    /// Where the packet came from.
    pub source: Option<SocketAddr>,
    /// The raw packet.
    pub packet: Vec<u8>,
    /// The dependency that was missing.
    pub trigger: DelayTrigger,
}

impl DelayedPacket {
    /// Park `packet` until the message satisfying `trigger` arrives.
    pub fn new(
        cid: Cid,
        source: Option<SocketAddr>,
        packet: Vec<u8>,
        trigger: DelayTrigger,
    ) -> Result<Self, DelayQueueError> {
        Ok(Self {
            pattern: release_pattern(cid, &trigger)?,
            source,
            packet,
            trigger,
        })
    }
}

/// Parked packets of one community.
///
/// Packets leave the queue only through [`release`](Self::release) or
/// [`clear`](Self::clear); nothing expires silently.
#[derive(Debug)]
pub struct DelayQueue {
    max_size: usize,
    delayed: Vec<DelayedPacket>,
}

impl DelayQueue {
    /// Create a new queue with the given maximum size.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            delayed: Vec::new(),
        }
    }

    /// Park a packet.
    ///
    /// Returns `Ok(false)` when the same packet already waits on the same
    /// pattern, and an error if the queue is full.
    pub fn enqueue(&mut self, delayed: DelayedPacket) -> Result<bool, DelayQueueError> {
        if self
            .delayed
            .iter()
            .any(|d| d.packet == delayed.packet && d.pattern == delayed.pattern)
        {
            return Ok(false);
        }
        if self.delayed.len() >= self.max_size {
            return Err(DelayQueueError::Full {
                capacity: self.max_size,
            });
        }
        self.delayed.push(delayed);
        Ok(true)
    }

    /// Remove and return every packet waiting on a message with `footprint`,
    /// in the order they were parked.
    pub fn release(&mut self, footprint: &str) -> Vec<DelayedPacket> {
        let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|d| d.pattern.matches(footprint));
        self.delayed = kept;
        released
    }

    /// Number of parked packets.
    pub fn len(&self) -> usize {
        self.delayed.len()
    }

    /// Check if nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.delayed.is_empty()
    }

    /// Iterate over the parked packets.
    pub fn iter(&self) -> impl Iterator<Item = &DelayedPacket> {
        self.delayed.iter()
    }

    /// Drop every parked packet.
    pub fn clear(&mut self) {
        self.delayed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispersy_types::{GlobalTime, Mid};

    fn cid() -> Cid {
        Cid::from_master_key(b"master")
    }

    fn identity_footprint(mid: &Mid) -> String {
        format!(
            "dispersy-identity Community:{} MemberAuthentication:{} LastSyncDistribution:3:0 CommunityDestination IdentityPayload",
            cid().to_hex(),
            mid.to_hex()
        )
    }

    fn missing_member(mid: Mid, packet: Vec<u8>) -> DelayedPacket {
        DelayedPacket::new(cid(), None, packet, DelayTrigger::MissingMember { mid }).unwrap()
    }

    #[test]
    fn identity_releases_packets_of_that_member() {
        let mut queue = DelayQueue::new(10);
        let alice = Mid::from_public_key(b"alice");
        let bob = Mid::from_public_key(b"bob");
        queue.enqueue(missing_member(alice, vec![1])).unwrap();
        queue.enqueue(missing_member(bob, vec![2])).unwrap();
        queue.enqueue(missing_member(alice, vec![3])).unwrap();

        let released = queue.release(&identity_footprint(&alice));
        let packets: Vec<_> = released.iter().map(|d| d.packet.clone()).collect();
        assert_eq!(packets, vec![vec![1], vec![3]]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn queue_respects_max_size() {
        let mut queue = DelayQueue::new(1);
        let mid = Mid::from_public_key(b"m");
        queue.enqueue(missing_member(mid, vec![1])).unwrap();
        assert_eq!(
            queue.enqueue(missing_member(mid, vec![2])),
            Err(DelayQueueError::Full { capacity: 1 })
        );
        assert_eq!(
            DelayQueueError::Full { capacity: 1 }.to_string(),
            "delay queue full (capacity: 1)"
        );
    }

    #[test]
    fn same_packet_is_parked_once() {
        let mut queue = DelayQueue::new(10);
        let mid = Mid::from_public_key(b"m");
        assert!(queue.enqueue(missing_member(mid, vec![1])).unwrap());
        assert!(!queue.enqueue(missing_member(mid, vec![1])).unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn sequence_delay_waits_for_highest_missing_number() {
        let mut queue = DelayQueue::new(10);
        let author = Mid::from_public_key(b"author");
        let trigger = DelayTrigger::MissingSequence {
            member: author,
            message: "post".into(),
            missing_low: 3,
            missing_high: 3,
        };
        queue
            .enqueue(DelayedPacket::new(cid(), None, vec![4], trigger).unwrap())
            .unwrap();

        let footprint = |seq: u32| {
            format!(
                "post Community:{} MemberAuthentication:{} FullSyncDistribution:{}:{} CommunityDestination ApplicationPayload",
                cid().to_hex(),
                author.to_hex(),
                GlobalTime::new(9),
                seq
            )
        };
        assert!(queue.release(&footprint(2)).is_empty());
        assert_eq!(queue.release(&footprint(3)).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn missing_proof_waits_for_any_authorize() {
        let trigger = DelayTrigger::MissingProof {
            member: Mid::from_public_key(b"m"),
            global_time: GlobalTime::new(4),
        };
        let pattern = release_pattern(cid(), &trigger).unwrap();
        assert!(pattern.matches(&format!(
            "dispersy-authorize Community:{} MemberAuthentication:{} FullSyncDistribution:2:0 CommunityDestination AuthorizePayload",
            cid().to_hex(),
            Mid::from_public_key(b"master").to_hex()
        )));
    }

    #[test]
    fn clear_removes_all() {
        let mut queue = DelayQueue::new(10);
        queue
            .enqueue(missing_member(Mid::from_public_key(b"m"), vec![1]))
            .unwrap();
        queue.clear();
        assert!(queue.is_empty());
    }
}
