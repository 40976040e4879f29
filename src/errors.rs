/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The error type threaded through the controller and its collaborators.
//!
//! Errors raised while executing a transaction are captured into the returned trace
//! rather than propagated, and are then classified: a [subjective](ChainError::is_subjective)
//! failure is local to this node (the transaction is retained for retry), while every
//! other failure is deterministic across nodes and evicts the transaction. Errors raised
//! while applying a received block abort the in-flight block and propagate to the caller
//! of `push_block`. [`ChainError::Consistency`] is reserved for broken internal
//! invariants and is never recoverable.

use std::fmt::{self, Display, Formatter};

use crate::token_db::TokenDbError;
use crate::types::basic::ActionName;
use crate::types::basic::CryptoHash;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainError {
    /// An action's required authority is not satisfied by the provided keys.
    TxMissingSigs(String),
    /// The transaction expired before the pending block's time.
    ExpiredTx(String),
    /// The transaction's expiration exceeds the maximum transaction lifetime.
    TxExpTooFar(String),
    /// The transaction's TaPoS reference does not match the block summary ring.
    InvalidRefBlock(String),
    /// A transaction with the same id has already been accepted and has not expired.
    TxDuplicate(CryptoHash),
    /// A block lookup failed.
    UnknownBlock(String),
    /// A received block does not link onto any known block.
    UnlinkableBlock(String),
    /// A received block header fails validation against its parent state.
    BlockValidation(String),
    /// A signature does not verify, or a key is malformed.
    InvalidSignature(String),
    /// Execution exceeded its wall-clock deadline. The only subjective failure.
    Deadline,
    /// An operation that requires a pending block was called without one.
    NoPendingBlock,
    /// Block production was attempted on a read-only controller.
    ReadOnly,
    /// No apply handler is registered for the action.
    UnknownAction(ActionName),
    /// An action payload could not be decoded.
    InvalidActionData(String),
    /// An apply handler rejected the action against the token database.
    TokenDb(TokenDbError),
    /// An internal invariant does not hold. Fatal; the chain state is undefined.
    Consistency(String),
    /// An I/O failure while opening or reading a persistent store.
    Io(String),
}

impl ChainError {
    /// Whether this failure is node-local. Subjective failures keep the transaction in
    /// the unapplied map for retry; objective failures evict it, keeping block assembly
    /// deterministic across nodes.
    pub fn is_subjective(&self) -> bool {
        matches!(self, ChainError::Deadline)
    }
}

impl Display for ChainError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::TxMissingSigs(msg) => write!(f, "missing required signatures: {}", msg),
            ChainError::ExpiredTx(msg) => write!(f, "transaction expired: {}", msg),
            ChainError::TxExpTooFar(msg) => {
                write!(f, "transaction expiration too far in the future: {}", msg)
            }
            ChainError::InvalidRefBlock(msg) => {
                write!(f, "transaction reference block mismatch: {}", msg)
            }
            ChainError::TxDuplicate(id) => write!(f, "duplicate transaction {}", id),
            ChainError::UnknownBlock(msg) => write!(f, "unknown block: {}", msg),
            ChainError::UnlinkableBlock(msg) => write!(f, "unlinkable block: {}", msg),
            ChainError::BlockValidation(msg) => write!(f, "block validation failed: {}", msg),
            ChainError::InvalidSignature(msg) => write!(f, "invalid signature: {}", msg),
            ChainError::Deadline => write!(f, "execution deadline exceeded"),
            ChainError::NoPendingBlock => write!(f, "no pending block"),
            ChainError::ReadOnly => write!(f, "the state database is read-only"),
            ChainError::UnknownAction(name) => {
                write!(f, "no apply handler registered for action {}", name)
            }
            ChainError::InvalidActionData(msg) => write!(f, "invalid action data: {}", msg),
            ChainError::TokenDb(err) => write!(f, "token database: {}", err),
            ChainError::Consistency(msg) => write!(f, "consistency violation: {}", msg),
            ChainError::Io(msg) => write!(f, "i/o failure: {}", msg),
        }
    }
}

impl From<TokenDbError> for ChainError {
    fn from(err: TokenDbError) -> ChainError {
        ChainError::TokenDb(err)
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> ChainError {
        ChainError::Io(err.to_string())
    }
}
