//! Shared fixtures: peers wired to mock transports.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dispersy_core::{
    AllowSignature, Authentication, Distribution, Member, Message, MetaMessage, PolicyError,
    Resolution,
};
use dispersy_engine::{
    CommunityHandle, Dispersy, EngineConfig, MemoryDatabase, MockTransport, Verdict,
};
use dispersy_types::{Cid, PayloadKind};

/// How often each application message was handled.
#[derive(Debug, Default, Clone)]
pub struct Counters {
    pub posts: Arc<AtomicUsize>,
    pub numbered: Arc<AtomicUsize>,
    pub doubles: Arc<AtomicUsize>,
    pub triples: Arc<AtomicUsize>,
    pub ranked: Arc<AtomicUsize>,
}

impl Counters {
    pub fn posts(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }

    pub fn numbered(&self) -> usize {
        self.numbered.load(Ordering::SeqCst)
    }

    pub fn doubles(&self) -> usize {
        self.doubles.load(Ordering::SeqCst)
    }

    pub fn triples(&self) -> usize {
        self.triples.load(Ordering::SeqCst)
    }

    pub fn ranked(&self) -> usize {
        self.ranked.load(Ordering::SeqCst)
    }
}

fn counting(name: &str, counter: Arc<AtomicUsize>, cid: Cid) -> Result<MetaMessage, PolicyError> {
    let distribution = if name == "numbered" || name == "ranked" {
        Distribution::FullSync {
            enable_sequence_number: true,
        }
    } else {
        Distribution::full_sync()
    };
    let mut builder = MetaMessage::builder(name, PayloadKind::Application).distribution(distribution);
    let signers = match name {
        "double" => 2,
        "triple" => 3,
        _ => 0,
    };
    if signers > 0 {
        let allow: AllowSignature = Arc::new(|_: &Message| true);
        builder = builder.authentication(Authentication::MultiMember {
            count: signers,
            allow_signature: Some(allow),
        });
    }
    if name == "ranked" {
        builder = builder.resolution(Resolution::Linear);
    }
    builder
        .handle(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build(cid)
}

/// The application messages every test community defines.
pub fn definitions(counters: &Counters) -> impl FnOnce(Cid) -> Result<Vec<MetaMessage>, PolicyError> {
    let counters = counters.clone();
    move |cid| {
        Ok(vec![
            counting("post", counters.posts, cid)?,
            counting("numbered", counters.numbered, cid)?,
            counting("double", counters.doubles, cid)?,
            counting("triple", counters.triples, cid)?,
            counting("ranked", counters.ranked, cid)?,
        ])
    }
}

/// Engine configuration that keeps background sync rounds out of the way.
pub fn quiet_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sync.interval_ms = 60_000;
    config
}

/// One participant.
pub struct Peer {
    pub dispersy: Dispersy,
    pub transport: MockTransport,
    pub member: Member,
    pub address: SocketAddr,
    pub counters: Counters,
}

impl Peer {
    pub fn new(port: u16) -> Self {
        dispersy_engine::logging::init("warn");
        let transport = MockTransport::new();
        let dispersy = Dispersy::new(
            quiet_config(),
            Arc::new(MemoryDatabase::new()),
            Arc::new(transport.clone()),
        );
        Self {
            dispersy,
            transport,
            member: Member::generate(),
            address: SocketAddr::from(([127, 0, 0, 1], port)),
            counters: Counters::default(),
        }
    }

    pub fn create(&self) -> CommunityHandle {
        self.dispersy
            .create_community(&self.member, definitions(&self.counters))
            .unwrap()
    }

    pub fn join(&self, master_public_key: &[u8]) -> CommunityHandle {
        self.dispersy
            .join_community(master_public_key, &self.member, definitions(&self.counters))
            .unwrap()
    }

    /// Feed packets as if they arrived from `from`.
    pub fn receive(&self, from: &Peer, packets: Vec<Vec<u8>>) -> Vec<Verdict> {
        self.dispersy
            .process_packets(packets.into_iter().map(|p| (from.address, p)).collect())
    }

    /// Everything this peer sent to `to` since the last drain.
    ///
    /// Packets sent elsewhere are discarded.
    pub fn drain_to(&self, to: &Peer) -> Vec<Vec<u8>> {
        self.transport
            .take_sent()
            .into_iter()
            .filter(|(address, _)| *address == to.address)
            .map(|(_, packet)| packet)
            .collect()
    }
}

/// Names of the accepted messages, in order; `None` for anything refused.
pub fn accepted(verdicts: &[Verdict]) -> Vec<Option<String>> {
    verdicts
        .iter()
        .map(|verdict| verdict.as_ref().ok().map(|m| m.name().to_string()))
        .collect()
}
