use alloy::primitives::{Address, U256};
use thiserror::Error;

/// Failures of the signature authority.
///
/// `SignerMismatch` is the only variant produced for a well-formed
/// signature; every other variant means the bytes could not be turned into
/// a signer at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("high-s signature rejected (EIP-2 malleability)")]
    HighS,

    #[error("recovery failed: {0}")]
    Recovery(String),

    #[error("signed by {recovered}, expected {expected}")]
    SignerMismatch { expected: Address, recovered: Address },
}

/// Errors returned by a token ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient balance: {holder} holds {available} of token {id}, needs {required}")]
    InsufficientBalance {
        holder: Address,
        id: U256,
        available: U256,
        required: U256,
    },

    #[error("balance overflow crediting {holder}")]
    Overflow { holder: Address },

    #[error("operator {operator} may not move tokens owned by {owner}")]
    Unauthorized { operator: Address, owner: Address },

    #[error("receiver {account} rejected the transfer")]
    ReceiverRejected { account: Address },

    #[error("receiver code at {account} is no longer live")]
    ReceiverGone { account: Address },
}

/// Errors returned by payment channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel already initialized")]
    AlreadyInitialized,

    #[error("channel not initialized")]
    NotInitialized,

    #[error("channel already settled")]
    AlreadySettled,

    /// Another `close`/`cancel` is disbursing; it may still be rolled back.
    #[error("settlement in progress")]
    SettlementInProgress,

    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("caller {caller} is not the channel receiver")]
    CallerNotReceiver { caller: Address },

    #[error("caller {caller} is not the channel sender")]
    CallerNotSender { caller: Address },

    #[error("payment expired at {expiration} (now {now})")]
    PaymentExpired { now: u64, expiration: u64 },

    #[error("channel not expired until {expiration} (now {now})")]
    NotYetExpired { now: u64, expiration: u64 },

    #[error("insufficient escrow: requested {requested}, available {available}")]
    InsufficientEscrow { requested: U256, available: U256 },

    #[error("ledger transfer failed: {0}")]
    LedgerTransferFailed(#[source] LedgerError),

    #[error("ledger query failed: {0}")]
    Ledger(#[source] LedgerError),
}

/// Errors returned by the channel factory.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("unsupported token contract {token} (factory ledger is {ledger})")]
    UnsupportedToken { token: Address, ledger: Address },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Errors returned by event log backends.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised while reading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}
