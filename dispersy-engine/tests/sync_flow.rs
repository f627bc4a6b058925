//! Two peers exchanging packets through mock transports.

mod common;

use std::time::{Duration, Instant};

use common::{accepted, Peer};
use dispersy_core::{DelayTrigger, DropReason, ProtocolOutcome};
use dispersy_engine::community::builtin;
use dispersy_engine::Database;
use dispersy_types::{DestroyDegree, Payload, Permission};

#[test]
fn unknown_author_is_delayed_until_its_identity_arrives() {
    let m = Peer::new(7001);
    let n = Peer::new(7002);
    let community_m = m.create();
    let master = community_m.lock().master_member().public_key().to_vec();
    let community_n = n.join(&master);

    let post = community_m
        .lock()
        .create_message("post", Payload::application("hello"))
        .unwrap()
        .packet()
        .to_vec();

    let verdicts = n.receive(&m, vec![post]);
    assert_eq!(verdicts.len(), 1);
    assert!(matches!(
        &verdicts[0],
        Err(ProtocolOutcome::Delay(DelayTrigger::MissingMember { mid })) if *mid == m.member.mid()
    ));
    assert_eq!(community_n.lock().delayed_count(), 1);
    assert_eq!(n.counters.posts(), 0);

    // n asks m for the identity, m answers from its store
    let requests = n.drain_to(&m);
    assert_eq!(requests.len(), 1);
    let verdicts = m.receive(&n, requests);
    assert_eq!(accepted(&verdicts), vec![Some(builtin::IDENTITY_REQUEST.to_string())]);
    let identity = m.drain_to(&n);
    assert_eq!(identity.len(), 1);

    let verdicts = n.receive(&m, identity);
    assert_eq!(
        accepted(&verdicts),
        vec![Some(builtin::IDENTITY.to_string()), Some("post".to_string())]
    );
    assert_eq!(n.counters.posts(), 1);
    assert_eq!(community_n.lock().delayed_count(), 0);
}

#[test]
fn sequence_gap_is_filled_by_a_missing_sequence_request() {
    let m = Peer::new(7011);
    let n = Peer::new(7012);
    let community_m = m.create();
    let master = community_m.lock().master_member().public_key().to_vec();
    let community_n = n.join(&master);

    let identity = community_m
        .lock()
        .stored_packets(builtin::IDENTITY, &m.member.mid());
    assert!(n.receive(&m, identity).iter().all(Result::is_ok));

    let packets: Vec<Vec<u8>> = (0..4u8)
        .map(|i| {
            community_m
                .lock()
                .create_message("numbered", Payload::application(vec![i]))
                .unwrap()
                .packet()
                .to_vec()
        })
        .collect();

    let verdicts = n.receive(&m, vec![packets[0].clone(), packets[1].clone()]);
    assert!(verdicts.iter().all(Result::is_ok));

    let verdicts = n.receive(&m, vec![packets[3].clone()]);
    assert!(matches!(
        &verdicts[0],
        Err(ProtocolOutcome::Delay(DelayTrigger::MissingSequence {
            missing_low: 3,
            missing_high: 3,
            ..
        }))
    ));
    assert_eq!(community_n.lock().delayed_count(), 1);

    let request = n.drain_to(&m);
    assert_eq!(request.len(), 1);
    let verdicts = m.receive(&n, request);
    assert_eq!(accepted(&verdicts), vec![Some(builtin::MISSING_SEQUENCE.to_string())]);
    let reply = m.drain_to(&n);
    assert_eq!(reply, vec![packets[2].clone()]);

    let verdicts = n.receive(&m, reply);
    assert_eq!(
        accepted(&verdicts),
        vec![Some("numbered".to_string()), Some("numbered".to_string())]
    );
    let last = verdicts[1].as_ref().unwrap();
    assert_eq!(last.distribution().sequence_number, Some(4));
    assert_eq!(n.counters.numbered(), 4);

    let verdicts = n.receive(&m, vec![packets[1].clone()]);
    assert!(matches!(
        &verdicts[0],
        Err(ProtocolOutcome::Drop(DropReason::Duplicate))
    ));
}

#[test]
fn sync_round_pulls_everything_the_peer_lacks() {
    let m = Peer::new(7021);
    let n = Peer::new(7022);
    let community_m = m.create();
    for text in ["one", "two"] {
        community_m
            .lock()
            .create_message("post", Payload::application(text))
            .unwrap();
    }
    let master = community_m.lock().master_member().public_key().to_vec();
    let community_n = n.join(&master);

    // m must know n to verify its sync message
    let identity_n = community_n
        .lock()
        .stored_packets(builtin::IDENTITY, &n.member.mid());
    assert!(m.receive(&n, identity_n).iter().all(Result::is_ok));
    m.transport.take_sent();

    community_n
        .lock()
        .add_candidate(m.address, Some(m.member.mid()));
    let sent = community_n.lock().sync_round().unwrap();
    assert_eq!(sent, 1);

    let syncs = n.drain_to(&m);
    let verdicts = m.receive(&n, syncs);
    assert_eq!(accepted(&verdicts), vec![Some(builtin::SYNC.to_string())]);

    let missing = m.drain_to(&n);
    let verdicts = n.receive(&m, missing);
    let names = accepted(&verdicts);
    assert!(names.iter().all(Option::is_some), "{:?}", names);
    assert_eq!(names[0].as_deref(), Some(builtin::IDENTITY));
    assert_eq!(n.counters.posts(), 2);
    assert_eq!(
        community_n.lock().global_time(),
        community_m.lock().global_time()
    );
}

#[test]
fn hard_kill_waits_for_proof_then_purges() {
    let m = Peer::new(7031);
    let n = Peer::new(7032);
    let community_m = m.create();
    let master = community_m.lock().master_member().public_key().to_vec();
    let community_n = n.join(&master);

    let mut packets = community_m
        .lock()
        .stored_packets(builtin::IDENTITY, &m.member.mid());
    packets.push(
        community_m
            .lock()
            .create_message("post", Payload::application("before"))
            .unwrap()
            .packet()
            .to_vec(),
    );
    assert!(n.receive(&m, packets).iter().all(Result::is_ok));
    assert_eq!(
        community_n.lock().stored_packets("post", &m.member.mid()).len(),
        1
    );

    let destroy = community_m
        .lock()
        .create_destroy_community(DestroyDegree::HardKill)
        .unwrap()
        .packet()
        .to_vec();
    assert!(community_m
        .lock()
        .create_message("post", Payload::application("after"))
        .is_err());

    let verdicts = n.receive(&m, vec![destroy]);
    assert!(matches!(
        &verdicts[0],
        Err(ProtocolOutcome::Delay(DelayTrigger::MissingProof { .. }))
    ));

    let request = n.drain_to(&m);
    let verdicts = m.receive(&n, request);
    assert_eq!(accepted(&verdicts), vec![Some(builtin::MISSING_PROOF.to_string())]);
    let proof = m.drain_to(&n);
    assert!(!proof.is_empty());

    let verdicts = n.receive(&m, proof);
    assert_eq!(
        accepted(&verdicts).last().cloned().flatten().as_deref(),
        Some(builtin::DESTROY_COMMUNITY)
    );
    let community = community_n.lock();
    assert!(matches!(
        community.timeline().destroyed(),
        Some((_, DestroyDegree::HardKill))
    ));
    assert!(community.stored_packets("post", &m.member.mid()).is_empty());
}

#[test]
fn packets_handed_to_the_engine_are_processed_on_the_scheduler() {
    let m = Peer::new(7041);
    let n = Peer::new(7042);
    let community_m = m.create();
    let master = community_m.lock().master_member().public_key().to_vec();
    n.join(&master);
    n.dispersy.start().unwrap();

    let post = community_m
        .lock()
        .create_message("post", Payload::application("queued"))
        .unwrap()
        .packet()
        .to_vec();
    n.dispersy.on_incoming_packets(vec![(m.address, post)]);

    let deadline = Instant::now() + Duration::from_secs(5);
    while n.transport.sent_to(m.address).is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(n.transport.sent_to(m.address).len(), 1);

    n.dispersy.stop().unwrap();
}

#[test]
fn refused_create_leaves_no_sequence_gap() {
    let m = Peer::new(7051);
    let n = Peer::new(7052);
    let community_m = m.create();
    let master = community_m.lock().master_member().public_key().to_vec();
    let community_n = n.join(&master);

    // n holds no permit yet
    assert!(community_n
        .lock()
        .create_message("ranked", Payload::application("too early"))
        .is_err());

    let grant = community_m
        .lock()
        .create_authorize(
            vec![(n.member.public_only(), "ranked".to_string(), Permission::Permit)],
            true,
        )
        .unwrap()
        .packet()
        .to_vec();
    assert_eq!(
        accepted(&n.receive(&m, vec![grant])),
        vec![Some(builtin::AUTHORIZE.to_string())]
    );

    let ranked = community_n
        .lock()
        .create_message("ranked", Payload::application("allowed"))
        .unwrap();
    assert_eq!(ranked.distribution().sequence_number, Some(1));
    assert_eq!(n.counters.ranked(), 1);

    let mut packets = community_n
        .lock()
        .stored_packets(builtin::IDENTITY, &n.member.mid());
    packets.push(ranked.packet().to_vec());
    let verdicts = m.receive(&n, packets);
    assert_eq!(
        accepted(&verdicts),
        vec![Some(builtin::IDENTITY.to_string()), Some("ranked".to_string())]
    );
    assert_eq!(community_m.lock().delayed_count(), 0);
    assert_eq!(m.counters.ranked(), 1);
}

#[test]
fn far_future_global_time_is_dropped() {
    let m = Peer::new(7061);
    let n = Peer::new(7062);
    let community_m = m.create();
    let master = community_m.lock().master_member().public_key().to_vec();
    let community_n = n.join(&master);

    let identity = community_m
        .lock()
        .stored_packets(builtin::IDENTITY, &m.member.mid());
    assert!(n.receive(&m, identity).iter().all(Result::is_ok));
    let (clock, buckets) = {
        let community = community_n.lock();
        (community.global_time(), community.bloom_index().len())
    };

    let range = n.dispersy.config().sync.acceptable_global_time_range;
    let far = {
        let mut community = community_m.lock();
        while community.global_time().value() <= clock.value() + range {
            community.claim_global_time();
        }
        community
            .create_message("post", Payload::application("from the future"))
            .unwrap()
            .packet()
            .to_vec()
    };

    let verdicts = n.receive(&m, vec![far]);
    assert!(matches!(
        &verdicts[0],
        Err(ProtocolOutcome::Drop(DropReason::GlobalTimeTooHigh { .. }))
    ));
    let community = community_n.lock();
    assert_eq!(community.global_time(), clock);
    assert_eq!(community.bloom_index().len(), buckets);
    assert_eq!(n.counters.posts(), 0);
}

#[test]
fn forged_identity_is_not_remembered() {
    let m = Peer::new(7071);
    let n = Peer::new(7072);
    let community_m = m.create();
    let master = community_m.lock().master_member().public_key().to_vec();
    n.join(&master);

    let mut identity = community_m
        .lock()
        .stored_packets(builtin::IDENTITY, &m.member.mid())
        .remove(0);
    let last = identity.len() - 1;
    identity[last] ^= 0xff;

    let verdicts = n.receive(&m, vec![identity]);
    assert!(matches!(
        &verdicts[0],
        Err(ProtocolOutcome::Drop(DropReason::InvalidSignature))
    ));
    assert!(n.dispersy.members().get_by_mid(&m.member.mid()).is_empty());
    assert!(n.dispersy.database().users_by_mid(&m.member.mid()).is_empty());
}
