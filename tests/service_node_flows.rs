//! End-to-end flows over the public API: registration, election
//! convergence, vote quorums and the proof-of-service exchange.

use std::sync::Arc;

use bitcoin_hashes::Hash;

use servicenode::net::InvKind;
use servicenode::params::MIN_PING_SECONDS;
use servicenode::registry::LocalIdentity;
use servicenode::sync::{SYNC_FINISHED, SYNC_LIST};
use servicenode::test_utils::{
    harness, signed_announce, test_addr, Harness, MockPeer, NodeKeys,
};
use servicenode::{
    ChainAdapter, Message, OutPoint, PaymentVote, ScriptBuf, ServiceNodeState, TxOut,
};

/// Accept a signed announce into a harness registry.
fn register(h: &Harness, seed: u8, announce_age: i64) -> (OutPoint, NodeKeys) {
    let (announce, keys) = signed_announce(seed, &h.chain, false, announce_age);
    let outpoint = announce.outpoint;
    h.registry
        .process_announce(None, announce, &h.sync, None, &h.bus)
        .expect("valid announce is accepted");
    (outpoint, keys)
}

#[test]
fn register_and_rank() {
    let h = harness(1000);
    h.sync.force_asset(SYNC_FINISHED);

    let (outpoint, _keys) = register(&h, 1, 0);
    assert_eq!(h.registry.size(), 1);
    assert!(h.registry.has(&outpoint));

    // the accepted announce is relayed to the network
    assert!(h.bus.relayed_kinds().contains(&(InvKind::Announce as u32)));

    // a single registered node ranks first at any known height
    assert_eq!(h.registry.get_rank(&outpoint, 900, 0, &h.sync), Some(1));
    let ranks = h.registry.get_ranks(900, 0, &h.sync).unwrap();
    assert_eq!(ranks.len(), 1);
    assert_eq!(ranks[0].0, 1);
    assert_eq!(ranks[0].1.outpoint, outpoint);
}

#[test]
fn duplicate_announce_leaves_registry_unchanged() {
    let h = harness(1000);
    h.sync.force_asset(SYNC_FINISHED);

    let (announce, _keys) = signed_announce(1, &h.chain, false, 0);
    h.registry.process_announce(None, announce.clone(), &h.sync, None, &h.bus).unwrap();
    let before = h.registry.get(&announce.outpoint).unwrap();

    // the identical announce short-circuits on the seen cache
    h.registry.process_announce(None, announce.clone(), &h.sync, None, &h.bus).unwrap();
    let after = h.registry.get(&announce.outpoint).unwrap();
    assert_eq!(before.sig_time, after.sig_time);
    assert_eq!(before.sig, after.sig);
    assert_eq!(h.registry.size(), 1);
}

#[test]
fn stale_announce_is_rejected() {
    let h = harness(1000);
    h.sync.force_asset(SYNC_FINISHED);

    let (outpoint, keys) = register(&h, 1, 0);

    // an announce with an older sig_time for the same outpoint
    let (mut old, _) = signed_announce(2, &h.chain, false, 600);
    old.outpoint = outpoint;
    old.pubkey_collateral = keys.collateral.public_key().clone();
    old.pubkey_operator = keys.operator.public_key().clone();
    old.sign(&keys.collateral, false, h.chain.adjusted_time() - 600);

    let err = h.registry.process_announce(None, old, &h.sync, None, &h.bus).unwrap_err();
    assert_eq!(err, servicenode::RegistryError::StaleSigTime);
    assert_eq!(h.registry.get(&outpoint).unwrap().sig_time, h.chain.adjusted_time());
}

#[test]
fn election_converges_across_replicas() {
    let a = harness(1000);
    let b = harness(1000);
    a.sync.force_asset(SYNC_FINISHED);
    b.sync.force_asset(SYNC_FINISHED);

    // replay the same twenty announces into two independent replicas;
    // collaterals must exist on both chain views
    for seed in 1..=20u8 {
        let (announce, _keys) = signed_announce(seed, &a.chain, false, 2 * 3600);
        let coin = a.chain.utxo(&announce.outpoint).unwrap();
        b.chain.add_collateral_at(&announce.outpoint, coin.clone());
        a.registry.process_announce(None, announce.clone(), &a.sync, None, &a.bus).unwrap();
        b.registry.process_announce(None, announce, &b.sync, None, &b.bus).unwrap();
    }
    assert_eq!(a.registry.size(), 20);
    assert_eq!(b.registry.size(), 20);

    let (count_a, winner_a) = a.registry.next_payee(1010, true, &a.ledger, &a.sync);
    let (count_b, winner_b) = b.registry.next_payee(1010, true, &b.ledger, &b.sync);
    assert_eq!(count_a, 20);
    assert_eq!(count_b, 20);
    let winner_a = winner_a.expect("twenty eligible candidates");
    let winner_b = winner_b.expect("twenty eligible candidates");
    assert_eq!(winner_a.outpoint, winner_b.outpoint);

    // and the full rankings agree as well
    let ranks_a = a.registry.get_ranks(909, 0, &a.sync).unwrap();
    let ranks_b = b.registry.get_ranks(909, 0, &b.sync).unwrap();
    let order_a: Vec<OutPoint> = ranks_a.iter().map(|(_, info)| info.outpoint).collect();
    let order_b: Vec<OutPoint> = ranks_b.iter().map(|(_, info)| info.outpoint).collect();
    assert_eq!(order_a, order_b);
}

#[test]
fn vote_quorum_decides_coinbase_validity() {
    let h = harness(1000);
    h.sync.force_asset(SYNC_FINISHED);
    h.ledger.updated_block_tip(1000, &h.registry, &h.sync, None, &h.bus);

    let p1 = ScriptBuf::new_p2pkh(&servicenode::KeyId::from_byte_array([1u8; 20]));
    let p2 = ScriptBuf::new_p2pkh(&servicenode::KeyId::from_byte_array([2u8; 20]));

    // seven voters back P1, one backs P2
    for voter in 1..=7u8 {
        let voter_outpoint =
            OutPoint::new(servicenode::Txid::from_byte_array([voter; 32]), 0);
        let vote = PaymentVote::new(voter_outpoint, 1010, p1.clone());
        assert!(h.ledger.add_or_update_payment_vote(&vote));
    }
    let outlier = OutPoint::new(servicenode::Txid::from_byte_array([8u8; 32]), 0);
    assert!(h.ledger.add_or_update_payment_vote(&PaymentVote::new(outlier, 1010, p2.clone())));

    let amount = h.ledger.payment_amount(1010);
    let coinbase_p1 = vec![TxOut { value: amount, script_pubkey: p1.clone() }];
    let coinbase_p2 = vec![TxOut { value: amount, script_pubkey: p2.clone() }];

    assert!(h.ledger.is_transaction_valid(&coinbase_p1, 1010));
    assert!(!h.ledger.is_transaction_valid(&coinbase_p2, 1010));

    // a height with no tally accepts anything
    assert!(h.ledger.is_transaction_valid(&coinbase_p2, 1011));
}

#[test]
fn vote_boundaries_follow_storage_window() {
    let h = harness(8000);
    h.sync.force_asset(SYNC_FINISHED);
    h.ledger.updated_block_tip(8000, &h.registry, &h.sync, None, &h.bus);

    let peer = MockPeer::new(1, test_addr(200));
    let payee = ScriptBuf::new_p2pkh(&servicenode::KeyId::from_byte_array([1u8; 20]));
    let limit = h.ledger.storage_limit(h.registry.size());

    // a vote below the window is rejected outright
    let voter = OutPoint::new(servicenode::Txid::from_byte_array([1u8; 32]), 0);
    let stale = PaymentVote::new(voter, 8000 - limit - 1, payee.clone());
    let err = h
        .ledger
        .process_vote(&peer, stale, &h.registry, &h.sync, false, &h.bus)
        .unwrap_err();
    assert_eq!(err, servicenode::PaymentError::OutOfRange);

    // too far into the future as well
    let eager = PaymentVote::new(voter, 8000 + 21, payee);
    let err = h
        .ledger
        .process_vote(&peer, eager, &h.registry, &h.sync, false, &h.bus)
        .unwrap_err();
    assert_eq!(err, servicenode::PaymentError::OutOfRange);
}

#[test]
fn accepted_ping_updates_liveness_and_relays() {
    let h = harness(1000);
    h.sync.force_asset(SYNC_FINISHED);

    let (outpoint, keys) = register(&h, 1, 2 * 3600);
    let first_ping_time = h.registry.get(&outpoint).unwrap().last_ping.unwrap().sig_time;

    // a fresh ping a full interval later is accepted and relayed
    let peer = MockPeer::new(7, test_addr(77));
    let mut ping = servicenode::ServiceNodePing::new(outpoint, &*h.chain).unwrap();
    h.chain.advance_time(MIN_PING_SECONDS as i32);
    ping.sign(&keys.operator, false, h.chain.adjusted_time());
    h.registry.process_ping(&peer, ping.clone(), &h.sync, None, &h.bus).unwrap();

    let stored = h.registry.get(&outpoint).unwrap().last_ping.unwrap();
    assert!(stored.sig_time > first_ping_time);
    assert!(h.bus.relayed_kinds().contains(&(InvKind::Ping as u32)));

    // an immediate re-ping is too early; the known node absorbs it
    // quietly and keeps the stored ping
    let mut again = servicenode::ServiceNodePing::new(outpoint, &*h.chain).unwrap();
    again.sign(&keys.operator, false, h.chain.adjusted_time() + 30);
    h.registry.process_ping(&peer, again, &h.sync, None, &h.bus).unwrap();
    assert_eq!(h.registry.get(&outpoint).unwrap().last_ping.unwrap().sig_time, stored.sig_time);
}

#[test]
fn unknown_ping_asks_for_the_announce() {
    let h = harness(1000);
    h.sync.force_asset(SYNC_FINISHED);

    let keys = servicenode::test_utils::node_keys(9);
    let unknown = OutPoint::new(servicenode::Txid::from_byte_array([0x77u8; 32]), 0);
    let peer = MockPeer::new(3, test_addr(33));
    let mut ping = servicenode::ServiceNodePing::new(unknown, &*h.chain).unwrap();
    ping.sign(&keys.operator, false, h.chain.adjusted_time());

    let err = h.registry.process_ping(&peer, ping, &h.sync, None, &h.bus).unwrap_err();
    assert_eq!(err, servicenode::RegistryError::UnknownNode);
    assert_eq!(peer.sent_commands(), vec!["dsegfn"]);
}

#[test]
fn dseg_serves_the_list_and_rate_limits() {
    let h = harness(1000);
    h.sync.force_asset(SYNC_FINISHED);

    for seed in 1..=3u8 {
        register(&h, seed, 0);
    }

    let peer = MockPeer::new(5, test_addr(55));
    h.registry.process_dseg_request(&peer, OutPoint::null(), &h.sync).unwrap();
    // an announce and a ping inventory per node
    assert_eq!(peer.inventories.lock().len(), 6);
    let status = peer.sent.lock().iter().find_map(|message| match message {
        Message::SyncStatusCount { item_id, count } => Some((*item_id, *count)),
        _ => None,
    });
    assert_eq!(status, Some((SYNC_LIST, 3)));

    // asking again right away is abuse on mainnet
    let err = h.registry.process_dseg_request(&peer, OutPoint::null(), &h.sync).unwrap_err();
    assert_eq!(err, servicenode::RegistryError::ListRequestAbuse);
}

#[test]
fn same_address_duplicates_get_banned_once_one_is_verified() {
    let h = harness(1000);
    h.sync.force_asset(SYNC_FINISHED);

    // two nodes behind one address, a third elsewhere
    let (real, real_keys) = {
        let (mut announce, keys) = signed_announce(1, &h.chain, false, 2 * 3600);
        announce.addr = test_addr(10);
        announce.sign(&keys.collateral, false, announce.sig_time);
        let outpoint = announce.outpoint;
        h.registry.process_announce(None, announce, &h.sync, None, &h.bus).unwrap();
        (outpoint, keys)
    };
    let impostor = {
        let (mut announce, keys) = signed_announce(2, &h.chain, false, 2 * 3600);
        announce.addr = test_addr(10);
        announce.sign(&keys.collateral, false, announce.sig_time);
        let outpoint = announce.outpoint;
        h.registry.process_announce(None, announce, &h.sync, None, &h.bus).unwrap();
        outpoint
    };
    register(&h, 3, 2 * 3600);

    // drive the real node to verified through repeated broadcast
    // verifications signed by the third node
    let initiator = h.registry.get_ranks(999, 0, &h.sync).unwrap()
        .into_iter()
        .map(|(_, info)| info.outpoint)
        .find(|outpoint| *outpoint != real && *outpoint != impostor)
        .unwrap();
    let initiator_keys = servicenode::test_utils::node_keys(3);
    let peer = MockPeer::new(9, test_addr(99));
    for nonce in 1..=5i32 {
        let mut verify = servicenode::ServiceNodeVerification::challenge(
            test_addr(10),
            nonce,
            h.chain.tip_height() - 1,
        );
        verify.outpoint1 = real;
        verify.outpoint2 = initiator;
        let block_hash = h.chain.block_hash(verify.block_height).unwrap();
        verify.sign_reply(&real_keys.operator, &block_hash, false);
        verify.sign_broadcast(&initiator_keys.operator, &block_hash, false);
        h.registry.process_verify(&peer, verify, &h.sync, None, &h.bus).unwrap();
    }
    assert!(h.registry.get(&real).unwrap().is_pose_verified());
    // each accepted broadcast also bumped the impostor
    assert_eq!(h.registry.get(&impostor).unwrap().pose_ban_score, 5);

    // the next full check trips the ban
    h.registry.check(&h.sync, None);
    let banned = h.registry.get(&impostor).unwrap();
    assert_eq!(banned.state, ServiceNodeState::PoSeBanned);
    assert_eq!(banned.pose_ban_height, h.registry.cached_height() + 3);
}

#[test]
fn verify_challenge_roundtrip() {
    let h = harness(1000);
    h.sync.force_asset(SYNC_FINISHED);
    h.registry.updated_block_tip(1000, &h.sync, &h.ledger, false);

    // a populated registry so the challenge stripe is non-empty
    let mut keys_by_outpoint = Vec::new();
    for seed in 1..=22u8 {
        let (outpoint, keys) = register(&h, seed, 2 * 3600);
        keys_by_outpoint.push((outpoint, keys));
    }

    // our own node is whichever ranks first at tip - 1
    let ranks = h.registry.get_ranks(999, 0, &h.sync).unwrap();
    let my_outpoint = ranks[0].1.outpoint;
    let my_keys = keys_by_outpoint
        .iter()
        .find(|(outpoint, _)| *outpoint == my_outpoint)
        .map(|(_, keys)| keys)
        .unwrap();
    let local = LocalIdentity { outpoint: my_outpoint, operator: my_keys.operator.clone() };

    // the verification step schedules direct connections
    h.registry.do_full_verification_step(&h.sync, Some(&local), &h.bus);
    let pending = h.bus.pending_service_nodes.lock().clone();
    assert!(!pending.is_empty());

    // the connection comes up; the challenge goes out
    let target_addr = pending[0];
    let target_peer = Arc::new(MockPeer::new(42, target_addr));
    h.bus.add_peer(target_peer.clone());
    h.registry.process_pending_verify_requests(&h.bus);
    let challenge = target_peer
        .sent
        .lock()
        .iter()
        .find_map(|message| match message {
            Message::Verify(verify) => Some(verify.clone()),
            _ => None,
        })
        .expect("challenge sent");
    assert!(challenge.is_challenge());

    // the responder owns the challenged address and signs a reply
    let (target_outpoint, target_keys) = keys_by_outpoint
        .iter()
        .find(|(outpoint, _)| {
            h.registry.get(outpoint).map(|node| node.addr == target_addr).unwrap_or(false)
        })
        .cloned()
        .expect("target is a registered node");
    let responder_local =
        LocalIdentity { outpoint: target_outpoint, operator: target_keys.operator.clone() };
    let responder_view = MockPeer::new(43, test_addr(250));
    h.registry
        .process_verify(&responder_view, challenge.clone(), &h.sync, Some(&responder_local), &h.bus)
        .unwrap();
    let reply = responder_view
        .sent
        .lock()
        .iter()
        .find_map(|message| match message {
            Message::Verify(verify) => Some(verify.clone()),
            _ => None,
        })
        .expect("reply sent");
    assert!(reply.is_reply());

    // the initiator matches the reply against the registry, completes the
    // exchange and broadcasts it
    let score_before = h.registry.get(&target_outpoint).unwrap().pose_ban_score;
    h.registry
        .process_verify(&*target_peer, reply, &h.sync, Some(&local), &h.bus)
        .unwrap();
    let score_after = h.registry.get(&target_outpoint).unwrap().pose_ban_score;
    assert_eq!(score_after, score_before - 1);
    assert!(h.bus.relayed_kinds().contains(&(InvKind::Verify as u32)));
}
