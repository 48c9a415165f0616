//! Error types for the service-node subsystem.
//!
//! Every ingress path resolves to a subsystem error whose `dos_score`
//! feeds the peer's misbehavior counter; a score of zero means "drop and
//! log", never a ban signal.

use thiserror::Error;

use crate::consensus::encode;

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("encoding error: {0}")]
    Encode(#[from] encode::Error),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejections raised while processing announces, pings, list requests and
/// verification messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("invalid net address")]
    InvalidAddress,

    #[error("wrong port for this network")]
    WrongPort,

    #[error("signature time too far in the future")]
    SigTimeFromFuture,

    #[error("invalid announce signature")]
    InvalidSignature,

    #[error("invalid ping signature")]
    InvalidPingSignature,

    #[error("announce is older than the stored entry")]
    StaleSigTime,

    #[error("collateral pubkey does not match the stored entry")]
    CollateralPubkeyMismatch,

    #[error("node is banned by proof-of-service")]
    PoSeBanned,

    #[error("collateral UTXO not found")]
    CollateralMissing,

    #[error("collateral UTXO carries the wrong amount")]
    CollateralWrongAmount,

    #[error("collateral UTXO pays a different key")]
    CollateralWrongPubkey,

    #[error("collateral is not buried deep enough yet")]
    CollateralTooNew,

    #[error("signature predates collateral confirmation")]
    SigTimeBeforeConfirmation,

    #[error("unknown service node")]
    UnknownNode,

    #[error("ping referenced an unknown block hash")]
    UnknownBlockHash,

    #[error("ping referenced a block that is too old")]
    BlockHashTooOld,

    #[error("ping arrived too early")]
    PingTooEarly,

    #[error("node requires a fresh announce")]
    NewStartRequired,

    #[error("node protocol is outdated")]
    UpdateRequired,

    #[error("a node attempted to verify itself")]
    SelfVerification,

    #[error("verification reply we never asked for")]
    UnexpectedVerifyReply,

    #[error("verification nonce mismatch")]
    WrongVerifyNonce,

    #[error("verification block height mismatch")]
    WrongVerifyHeight,

    #[error("address already verified recently")]
    AlreadyVerified,

    #[error("no registered node matched the verification reply")]
    NoRealNode,

    #[error("verification is outside the accepted block window")]
    VerifyOutdated,

    #[error("verified node is not ranked high enough")]
    VerifyRankTooLow,

    #[error("peer exceeded its verification request budget")]
    VerifyRateLimited,

    #[error("peer re-requested the full list too soon")]
    ListRequestAbuse,

    #[error("unknown block height")]
    UnknownHeight,
}

impl RegistryError {
    /// Misbehavior score reported to the peer bus.
    pub fn dos_score(&self) -> u32 {
        use RegistryError::*;
        match self {
            Malformed(_) | InvalidSignature | SelfVerification => 100,
            ListRequestAbuse => 34,
            CollateralPubkeyMismatch
            | CollateralWrongAmount
            | CollateralWrongPubkey
            | InvalidPingSignature => 33,
            UnexpectedVerifyReply | WrongVerifyNonce | WrongVerifyHeight | AlreadyVerified
            | NoRealNode | VerifyRateLimited => 20,
            SigTimeFromFuture => 1,
            _ => 0,
        }
    }
}

/// Rejections raised by the payment ledger.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaymentError {
    #[error("peer version below the payment protocol minimum")]
    ObsoleteVersion,

    #[error("vote height outside the storage window")]
    OutOfRange,

    #[error("vote from an unknown service node")]
    UnknownVoter,

    #[error("voter protocol too old")]
    VoterProtocolTooOld,

    #[error("voter rank {rank} above the voting quorum")]
    RankOutOfBounds { rank: usize, severe: bool },

    #[error("invalid vote signature")]
    InvalidSignature { banable: bool },

    #[error("unknown block height")]
    UnknownHeight,

    #[error("voter already voted for this height")]
    AlreadyVoted,

    #[error("peer re-requested the payment list too soon")]
    RateLimited,

    #[error("not ready to serve payment data")]
    NotSynced,
}

impl PaymentError {
    pub fn dos_score(&self) -> u32 {
        use PaymentError::*;
        match self {
            RankOutOfBounds { severe: true, .. } => 20,
            InvalidSignature { banable: true } => 20,
            RateLimited => 20,
            _ => 0,
        }
    }
}

/// Failures of the staged sync process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("timed out waiting for {asset} with no peer serving it")]
    AssetTimedOut { asset: &'static str },

    #[error("cannot advance out of the failed state without a reset")]
    AdvanceFromFailed,
}
