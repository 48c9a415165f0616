//! Golden-layout tests for the canonical hashes and legacy signature
//! strings. These layouts are verified by peers running the original
//! software, so each preimage is rebuilt here byte by byte.

use bitcoin_hashes::{sha256d, Hash};

use servicenode::consensus::{serialize, Encodable, VarInt};
use servicenode::crypto::MessageSigner;
use servicenode::hash_types::Txid;
use servicenode::params::PROTOCOL_VERSION;
use servicenode::registry::{ServiceNodePing, ServiceNodeVerification};
use servicenode::test_utils::{announce_for, signed_announce, MockChain};
use servicenode::{ChainAdapter, NetAddress, OutPoint, PaymentVote, ScriptBuf};

fn sha256d_of(preimage: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(preimage).to_byte_array()
}

fn hex_reversed(bytes: &[u8; 32]) -> String {
    let mut rev = *bytes;
    rev.reverse();
    hex::encode(rev)
}

const DUMMY_PAD: [u8; 5] = [0x00, 0xFF, 0xFF, 0xFF, 0xFF];

#[test]
fn announce_hash_preimage() {
    let chain = MockChain::with_height(1000);
    let (announce, _keys) = announce_for(1, &chain);

    let mut preimage = Vec::new();
    preimage.extend_from_slice(&serialize(&announce.outpoint));
    // dummy values matching the old hashing format
    preimage.extend_from_slice(&DUMMY_PAD);
    preimage.extend_from_slice(&serialize(&announce.pubkey_collateral));
    preimage.extend_from_slice(&announce.sig_time.to_le_bytes());

    assert_eq!(announce.hash().to_byte_array(), sha256d_of(&preimage));
}

#[test]
fn ping_hash_preimages() {
    let chain = MockChain::with_height(1000);
    let outpoint = OutPoint::new(Txid::from_byte_array([7u8; 32]), 3);
    let ping = ServiceNodePing::new(outpoint, &chain).unwrap();

    // legacy layout: outpoint, pad, time; block hash deliberately absent
    let mut legacy = Vec::new();
    legacy.extend_from_slice(&serialize(&ping.outpoint));
    legacy.extend_from_slice(&DUMMY_PAD);
    legacy.extend_from_slice(&ping.sig_time.to_le_bytes());
    assert_eq!(ping.hash(false).to_byte_array(), sha256d_of(&legacy));

    // current layout covers the full field set
    let mut current = Vec::new();
    current.extend_from_slice(&serialize(&ping.outpoint));
    current.extend_from_slice(&serialize(&ping.block_hash));
    current.extend_from_slice(&ping.sig_time.to_le_bytes());
    current.push(ping.sentinel_is_current as u8);
    current.extend_from_slice(&ping.sentinel_version.to_le_bytes());
    current.extend_from_slice(&ping.daemon_version.to_le_bytes());
    assert_eq!(ping.hash(true).to_byte_array(), sha256d_of(&current));
}

#[test]
fn vote_hash_preimage() {
    let payee = ScriptBuf::new_p2pkh(&servicenode::KeyId::from_byte_array([9u8; 20]));
    let voter = OutPoint::new(Txid::from_byte_array([1u8; 32]), 0);
    let vote = PaymentVote::new(voter, 1010, payee.clone());

    // payee first, then height, then voter; does not match serialization
    let mut preimage = Vec::new();
    preimage.extend_from_slice(&serialize(&payee));
    preimage.extend_from_slice(&1010i32.to_le_bytes());
    preimage.extend_from_slice(&serialize(&voter));

    assert_eq!(vote.hash().to_byte_array(), sha256d_of(&preimage));
}

#[test]
fn verify_hash_preimage() {
    let addr = NetAddress::new_ipv4(std::net::Ipv4Addr::new(5, 6, 7, 8), 12919);
    let mut verify = ServiceNodeVerification::challenge(addr, 42, 999);
    verify.outpoint1 = OutPoint::new(Txid::from_byte_array([1u8; 32]), 0);
    verify.outpoint2 = OutPoint::new(Txid::from_byte_array([2u8; 32]), 1);

    let mut preimage = Vec::new();
    preimage.extend_from_slice(&serialize(&verify.outpoint1));
    preimage.extend_from_slice(&DUMMY_PAD);
    preimage.extend_from_slice(&serialize(&verify.outpoint2));
    preimage.extend_from_slice(&DUMMY_PAD);
    preimage.extend_from_slice(&serialize(&addr));
    preimage.extend_from_slice(&42i32.to_le_bytes());
    preimage.extend_from_slice(&999i32.to_le_bytes());

    assert_eq!(verify.hash().to_byte_array(), sha256d_of(&preimage));
}

#[test]
fn announce_legacy_signature_string() {
    let chain = MockChain::with_height(1000);
    let (announce, keys) = signed_announce(1, &chain, false, 0);

    // ip:port ++ sig_time ++ reversed-hex key ids ++ protocol version
    let collateral_id = keys.collateral.public_key().key_id();
    let operator_id = keys.operator.public_key().key_id();
    let mut collateral_hex = collateral_id.to_byte_array();
    collateral_hex.reverse();
    let mut operator_hex = operator_id.to_byte_array();
    operator_hex.reverse();
    let expected = format!(
        "{}{}{}{}{}",
        announce.addr.to_ip_port_string(),
        announce.sig_time,
        hex::encode(collateral_hex),
        hex::encode(operator_hex),
        PROTOCOL_VERSION
    );

    MessageSigner::verify(&expected, keys.collateral.public_key(), &announce.sig)
        .expect("announce signature covers exactly the documented string");
}

#[test]
fn ping_legacy_signature_string() {
    let chain = MockChain::with_height(1000);
    let key = servicenode::test_utils::operator_key(3);
    let outpoint = OutPoint::new(Txid::from_byte_array([0xABu8; 32]), 1);
    let mut ping = ServiceNodePing::new(outpoint, &chain).unwrap();
    ping.sign(&key, false, chain.adjusted_time());

    let txid_hex = hex_reversed(&outpoint.txid.to_byte_array());
    let expected = format!(
        "CTxIn(COutPoint({}, {}), scriptSig=){}{}",
        &txid_hex[..10],
        outpoint.vout,
        hex_reversed(&ping.block_hash.to_byte_array()),
        ping.sig_time
    );

    MessageSigner::verify(&expected, key.public_key(), &ping.sig)
        .expect("ping signature covers exactly the documented string");
}

#[test]
fn vote_legacy_signature_string() {
    let key = servicenode::test_utils::operator_key(4);
    let payee = ScriptBuf::new_p2pkh(&servicenode::KeyId::from_byte_array([0xCDu8; 20]));
    let voter = OutPoint::new(Txid::from_byte_array([0xEFu8; 32]), 2);
    let mut vote = PaymentVote::new(voter, 4242, payee);
    vote.sign(&key, false);

    let txid_hex = hex_reversed(&voter.txid.to_byte_array());
    let expected = format!(
        "{}-{}{}OP_DUP OP_HASH160 {} OP_EQUALVERIFY OP_CHECKSIG",
        txid_hex,
        2,
        4242,
        "cd".repeat(20)
    );

    MessageSigner::verify(&expected, key.public_key(), &vote.sig)
        .expect("vote signature covers exactly the documented string");
}

#[test]
fn verify_legacy_signature_strings() {
    let chain = MockChain::with_height(1000);
    let responder = servicenode::test_utils::operator_key(5);
    let initiator = servicenode::test_utils::operator_key(6);
    let addr = NetAddress::new_ipv4(std::net::Ipv4Addr::new(5, 6, 7, 8), 12919);
    let block_hash = chain.block_hash(999).unwrap();

    let mut verify = ServiceNodeVerification::challenge(addr, 777, 999);
    verify.outpoint1 = OutPoint::new(Txid::from_byte_array([1u8; 32]), 0);
    verify.outpoint2 = OutPoint::new(Txid::from_byte_array([2u8; 32]), 1);
    verify.sign_reply(&responder, &block_hash, false);
    verify.sign_broadcast(&initiator, &block_hash, false);

    let message1 =
        format!("{}{}{}", addr.to_ip_port_string(), 777, hex_reversed(&block_hash.to_byte_array()));
    MessageSigner::verify(&message1, responder.public_key(), &verify.sig1)
        .expect("reply signature covers exactly the documented string");

    let message2 = format!(
        "{}{}{}",
        message1,
        verify.outpoint1.to_short_string(),
        verify.outpoint2.to_short_string()
    );
    MessageSigner::verify(&message2, initiator.public_key(), &verify.sig2)
        .expect("broadcast signature covers exactly the documented string");
}

#[test]
fn varint_prefix_sizes_on_wire() {
    // spot check the compact-size prefixes embedded in the preimages above
    assert_eq!(serialize(&VarInt(33)).len(), 1);
    assert_eq!(serialize(&VarInt(0xFD)).len(), 3);
    let mut buf = Vec::new();
    VarInt(25).consensus_encode(&mut buf).unwrap();
    assert_eq!(buf, vec![25]);
}
