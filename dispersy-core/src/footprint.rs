//! Footprints: structural descriptors of messages.
//!
//! A footprint is a single line such as
//!
//! ```text
//! post Community:<cid> MemberAuthentication:<mid> FullSyncDistribution:7:0 CommunityDestination ApplicationPayload
//! ```
//!
//! Delayed packets wait on a [`FootprintPattern`], an anchored regular
//! expression over that line built from a [`FootprintQuery`] where every
//! omitted field is a wildcard.

use std::fmt;

use dispersy_types::{Cid, GlobalTime, Mid};
use regex::Regex;

use crate::policy::{AuthenticationImpl, DestinationImpl, Distribution, DistributionImpl};

/// Descriptor of a message's authentication state.
pub fn authentication_footprint(authentication: &AuthenticationImpl) -> String {
    match authentication {
        AuthenticationImpl::NoAuthentication => "NoAuthentication".to_string(),
        AuthenticationImpl::Member { member, .. } => {
            format!("MemberAuthentication:{}", member.mid().to_hex())
        }
        AuthenticationImpl::MultiMember { members, .. } => {
            let mids: Vec<String> = members.iter().map(|m| m.mid().to_hex()).collect();
            format!("MultiMemberAuthentication:{}", mids.join(","))
        }
    }
}

/// Descriptor of a message's distribution state.
pub fn distribution_footprint(meta: &Distribution, state: &DistributionImpl) -> String {
    let time = state.global_time.value();
    match meta {
        Distribution::Relay | Distribution::Direct => format!("{}:{}", meta.name(), time),
        Distribution::FullSync { .. } | Distribution::LastSync { .. } => format!(
            "{}:{}:{}",
            meta.name(),
            time,
            state.sequence_number.unwrap_or(0)
        ),
    }
}

/// Descriptor of a message's destination state.
pub fn destination_footprint(destination: &DestinationImpl) -> String {
    match destination {
        DestinationImpl::Address(_) => "AddressDestination".to_string(),
        DestinationImpl::Member(_) => "MemberDestination".to_string(),
        DestinationImpl::Community => "CommunityDestination".to_string(),
        DestinationImpl::Subjective { cluster } => format!("SubjectiveDestination:{cluster}"),
        DestinationImpl::Similarity { cluster } => format!("SimilarityDestination:{cluster}"),
    }
}

/// A partial description of the message a delayed packet waits for.
#[derive(Debug, Clone)]
pub struct FootprintQuery {
    name: String,
    cid: Cid,
    members: Option<Vec<Mid>>,
    global_time: Option<GlobalTime>,
    sequence_number: Option<u32>,
}

impl FootprintQuery {
    /// Any message named `name` in community `cid`.
    pub fn new(name: impl Into<String>, cid: Cid) -> Self {
        Self {
            name: name.into(),
            cid,
            members: None,
            global_time: None,
            sequence_number: None,
        }
    }

    /// Only messages signed by exactly these members, in order.
    pub fn members(mut self, members: Vec<Mid>) -> Self {
        self.members = Some(members);
        self
    }

    /// Only messages created at this global time.
    pub fn global_time(mut self, global_time: GlobalTime) -> Self {
        self.global_time = Some(global_time);
        self
    }

    /// Only synced messages carrying this sequence number.
    pub fn sequence_number(mut self, sequence_number: u32) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    /// Compile into a pattern.
    pub fn build(&self) -> Result<FootprintPattern, FootprintError> {
        let authentication = match &self.members {
            None => r"\S+".to_string(),
            Some(mids) if mids.is_empty() => "NoAuthentication".to_string(),
            Some(mids) => {
                let hex: Vec<String> = mids.iter().map(Mid::to_hex).collect();
                format!(r"\w+Authentication:{}", hex.join(","))
            }
        };
        let time = self
            .global_time
            .map(|t| t.value().to_string())
            .unwrap_or_else(|| r"\d+".to_string());
        let sequence = match self.sequence_number {
            Some(n) => format!(":{n}"),
            None => r"(?::\d+)?".to_string(),
        };
        let source = format!(
            r"^{} Community:{} {} \w+Distribution:{}{} \S+ \S+$",
            regex::escape(&self.name),
            self.cid.to_hex(),
            authentication,
            time,
            sequence
        );
        FootprintPattern::compile(&source)
    }
}

/// A footprint pattern that does not compile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FootprintError {
    /// The generated regular expression was refused.
    #[error("invalid footprint pattern: {0}")]
    Pattern(String),
}

/// An anchored regular expression over footprints.
#[derive(Clone)]
pub struct FootprintPattern(Regex);

impl FootprintPattern {
    fn compile(source: &str) -> Result<Self, FootprintError> {
        Regex::new(source)
            .map(Self)
            .map_err(|e| FootprintError::Pattern(e.to_string()))
    }

    /// Whether a footprint satisfies this pattern.
    pub fn matches(&self, footprint: &str) -> bool {
        self.0.is_match(footprint)
    }

    /// The regular expression source.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for FootprintPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for FootprintPattern {}

impl fmt::Debug for FootprintPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FootprintPattern({})", self.as_str())
    }
}

impl fmt::Display for FootprintPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
