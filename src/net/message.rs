//! The typed wire message set of this subsystem.
//!
//! Commands and payload layouts match the deployed protocol. Peers at the
//! legacy serialization version get `TxIn`-enveloped outpoints and the
//! trailing count on payment-sync requests; the encoder branches on the
//! peer's send version, the decoder on the peer's advertised version.

use std::io;

use crate::consensus::{encode, Decodable, Encodable};
use crate::net::peer::Inv;
use crate::params::LEGACY_OUTPOINT_VERSION;
use crate::payments::PaymentVote;
use crate::primitives::{LegacyTxIn, OutPoint};
use crate::registry::{ServiceNodeAnnounce, ServiceNodePing, ServiceNodeVerification};

/// Wire command strings.
pub mod command {
    pub const ANNOUNCE: &str = "mnannounce";
    pub const PING: &str = "mnping";
    pub const DSEG: &str = "dsegfn";
    pub const VERIFY: &str = "mnverify";
    pub const PAYMENT_SYNC: &str = "fnpaymentsync";
    pub const PAYMENT_VOTE: &str = "fnpaymentvote";
    pub const SYNC_STATUS_COUNT: &str = "syncstatuscountfn";
    pub const INV: &str = "inv";
    pub const GETDATA: &str = "getdata";
    pub const GETSPORKS: &str = "getsporks";
    pub const REJECT: &str = "reject";
}

/// A message of this subsystem, ready for a peer's frame layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Announce(ServiceNodeAnnounce),
    Ping(ServiceNodePing),
    /// Request one entry, or the full registry with the null outpoint.
    DsegRequest(OutPoint),
    Verify(ServiceNodeVerification),
    /// Request all payment votes. Legacy peers send a count we ignore.
    PaymentSync { legacy_count: i32 },
    PaymentVote(PaymentVote),
    SyncStatusCount { item_id: i32, count: i32 },
    Inv(Vec<Inv>),
    GetData(Vec<Inv>),
    GetSporks,
    Reject { message: String, code: u8, reason: String },
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Announce(_) => command::ANNOUNCE,
            Message::Ping(_) => command::PING,
            Message::DsegRequest(_) => command::DSEG,
            Message::Verify(_) => command::VERIFY,
            Message::PaymentSync { .. } => command::PAYMENT_SYNC,
            Message::PaymentVote(_) => command::PAYMENT_VOTE,
            Message::SyncStatusCount { .. } => command::SYNC_STATUS_COUNT,
            Message::Inv(_) => command::INV,
            Message::GetData(_) => command::GETDATA,
            Message::GetSporks => command::GETSPORKS,
            Message::Reject { .. } => command::REJECT,
        }
    }

    /// Serialize the payload for a peer speaking `version`.
    pub fn encode_payload(&self, version: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        self.encode_payload_to(&mut payload, version).expect("in-memory writers don't error");
        payload
    }

    fn encode_payload_to<W: io::Write + ?Sized>(
        &self,
        w: &mut W,
        version: u32,
    ) -> Result<usize, io::Error> {
        match self {
            Message::Announce(announce) => announce.encode_with_version(w, version),
            Message::Ping(ping) => ping.encode_with_version(w, version),
            Message::DsegRequest(outpoint) => {
                if version == LEGACY_OUTPOINT_VERSION {
                    LegacyTxIn(*outpoint).consensus_encode(w)
                } else {
                    outpoint.consensus_encode(w)
                }
            }
            Message::Verify(verify) => verify.encode_with_version(w, version),
            Message::PaymentSync { legacy_count } => {
                if version == LEGACY_OUTPOINT_VERSION {
                    legacy_count.consensus_encode(w)
                } else {
                    Ok(0)
                }
            }
            Message::PaymentVote(vote) => vote.encode_with_version(w, version),
            Message::SyncStatusCount { item_id, count } => {
                Ok(item_id.consensus_encode(w)? + count.consensus_encode(w)?)
            }
            Message::Inv(invs) | Message::GetData(invs) => invs.consensus_encode(w),
            Message::GetSporks => Ok(0),
            Message::Reject { message, code, reason } => Ok(message.consensus_encode(w)?
                + code.consensus_encode(w)?
                + reason.consensus_encode(w)?),
        }
    }

    /// Decode a payload received from a peer speaking `version`.
    pub fn decode_payload(
        cmd: &str,
        payload: &[u8],
        version: u32,
    ) -> Result<Message, encode::Error> {
        let mut cursor = payload;
        let r = &mut cursor;
        let message = match cmd {
            command::ANNOUNCE => {
                Message::Announce(ServiceNodeAnnounce::decode_with_version(r, version)?)
            }
            command::PING => Message::Ping(ServiceNodePing::decode_with_version(r, version)?),
            command::DSEG => {
                let outpoint = if version == LEGACY_OUTPOINT_VERSION {
                    LegacyTxIn::consensus_decode(r)?.0
                } else {
                    OutPoint::consensus_decode(r)?
                };
                Message::DsegRequest(outpoint)
            }
            command::VERIFY => {
                Message::Verify(ServiceNodeVerification::decode_with_version(r, version)?)
            }
            command::PAYMENT_SYNC => {
                let legacy_count = if version == LEGACY_OUTPOINT_VERSION {
                    i32::consensus_decode(r)?
                } else {
                    0
                };
                Message::PaymentSync { legacy_count }
            }
            command::PAYMENT_VOTE => {
                Message::PaymentVote(PaymentVote::decode_with_version(r, version)?)
            }
            command::SYNC_STATUS_COUNT => Message::SyncStatusCount {
                item_id: i32::consensus_decode(r)?,
                count: i32::consensus_decode(r)?,
            },
            command::INV => Message::Inv(Vec::<Inv>::consensus_decode(r)?),
            command::GETDATA => Message::GetData(Vec::<Inv>::consensus_decode(r)?),
            command::GETSPORKS => Message::GetSporks,
            command::REJECT => Message::Reject {
                message: String::consensus_decode(r)?,
                code: u8::consensus_decode(r)?,
                reason: String::consensus_decode(r)?,
            },
            _ => return Err(encode::Error::ParseFailed("unknown command")),
        };
        if !cursor.is_empty() {
            return Err(encode::Error::ParseFailed("payload not consumed entirely"));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::peer::InvKind;
    use crate::params::PROTOCOL_VERSION;
    use crate::test_utils::{announce_for, MockChain};

    fn round_trip(message: Message, version: u32) -> Message {
        let payload = message.encode_payload(version);
        Message::decode_payload(message.command(), &payload, version).unwrap()
    }

    #[test]
    fn dseg_round_trip_both_versions() {
        let chain = MockChain::with_height(100);
        let (announce, _) = announce_for(1, &chain);
        for version in [LEGACY_OUTPOINT_VERSION, PROTOCOL_VERSION] {
            let message = Message::DsegRequest(announce.outpoint);
            assert_eq!(round_trip(message.clone(), version), message);
            // null request stands for "send everything"
            let all = Message::DsegRequest(OutPoint::null());
            assert_eq!(round_trip(all.clone(), version), all);
        }
    }

    #[test]
    fn dseg_legacy_payload_is_a_txin() {
        let message = Message::DsegRequest(OutPoint::null());
        assert_eq!(message.encode_payload(LEGACY_OUTPOINT_VERSION).len(), 41);
        assert_eq!(message.encode_payload(PROTOCOL_VERSION).len(), 36);
    }

    #[test]
    fn payment_sync_count_only_for_legacy_peers() {
        let message = Message::PaymentSync { legacy_count: 6000 };
        assert_eq!(message.encode_payload(PROTOCOL_VERSION).len(), 0);
        assert_eq!(message.encode_payload(LEGACY_OUTPOINT_VERSION).len(), 4);
        let decoded = Message::decode_payload(
            command::PAYMENT_SYNC,
            &message.encode_payload(LEGACY_OUTPOINT_VERSION),
            LEGACY_OUTPOINT_VERSION,
        )
        .unwrap();
        assert_eq!(decoded, Message::PaymentSync { legacy_count: 6000 });
    }

    #[test]
    fn inv_and_status_round_trip() {
        let invs = Message::Inv(vec![
            Inv::new(InvKind::Announce, [1u8; 32]),
            Inv::new(InvKind::PaymentVote, [2u8; 32]),
        ]);
        assert_eq!(round_trip(invs.clone(), PROTOCOL_VERSION), invs);

        let status = Message::SyncStatusCount { item_id: 2, count: 17 };
        assert_eq!(round_trip(status.clone(), PROTOCOL_VERSION), status);

        let reject = Message::Reject {
            message: "fnpaymentsync".to_string(),
            code: 0x11,
            reason: "Version must be 70210 or greater".to_string(),
        };
        assert_eq!(round_trip(reject.clone(), PROTOCOL_VERSION), reject);
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(Message::decode_payload("mnfoo", &[], PROTOCOL_VERSION).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let message = Message::SyncStatusCount { item_id: 2, count: 17 };
        let mut payload = message.encode_payload(PROTOCOL_VERSION);
        payload.push(0);
        assert!(Message::decode_payload(
            command::SYNC_STATUS_COUNT,
            &payload,
            PROTOCOL_VERSION
        )
        .is_err());
    }
}
