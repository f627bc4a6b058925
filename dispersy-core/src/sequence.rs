//! Per-author sequence number tracking.
//!
//! Distributions with sequence numbers require every author to number its
//! messages of one type 1, 2, 3, ... without gaps. The tracker remembers the
//! highest contiguous number accepted per (author, message name) and tells
//! the caller whether an incoming number is the next one, a duplicate, or
//! leaves a gap that must be requested first.

use std::collections::HashMap;

use crate::member::Member;

/// Verdict on an incoming sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Exactly the next number.
    Next,
    /// Already accepted.
    Duplicate,
    /// Numbers `missing_low..=missing_high` have not arrived yet.
    Gap {
        /// First missing number.
        missing_low: u32,
        /// Last missing number.
        missing_high: u32,
    },
    /// The gap is larger than [`SequenceTracker::MAX_GAP`].
    GapTooLarge,
}

/// Tracks the last contiguous sequence number per author and message.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: HashMap<(Member, String), u32>,
}

impl SequenceTracker {
    /// Maximum number of missing messages we are willing to request at once.
    /// Prevents a single packet with a huge number from parking forever.
    pub const MAX_GAP: u32 = 10_000;

    /// A tracker with nothing accepted.
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest contiguous number accepted, or 0.
    pub fn last(&self, member: &Member, message: &str) -> u32 {
        self.last
            .get(&(member.clone(), message.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Classify an incoming number.
    pub fn check(&self, member: &Member, message: &str, sequence_number: u32) -> SequenceCheck {
        let last = self.last(member, message);
        if sequence_number <= last {
            SequenceCheck::Duplicate
        } else if sequence_number == last + 1 {
            SequenceCheck::Next
        } else if sequence_number - last - 1 > Self::MAX_GAP {
            SequenceCheck::GapTooLarge
        } else {
            SequenceCheck::Gap {
                missing_low: last + 1,
                missing_high: sequence_number - 1,
            }
        }
    }

    /// Record an accepted number.
    ///
    /// Only the next number advances the tracker; anything else is ignored.
    pub fn accept(&mut self, member: &Member, message: &str, sequence_number: u32) {
        let entry = self
            .last
            .entry((member.clone(), message.to_string()))
            .or_insert(0);
        if sequence_number == *entry + 1 {
            *entry = sequence_number;
        }
    }

    /// The number a locally created message should carry.
    ///
    /// Nothing is reserved: the tracker only moves once the message is
    /// accepted, so a message that is refused leaves no hole behind it.
    pub fn next(&self, member: &Member, message: &str) -> u32 {
        self.last(member, message) + 1
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.last.clear();
    }
}
