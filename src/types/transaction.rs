/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Actions, transactions, and the receipts and traces produced by executing them.
//!
//! A [`Transaction`] is an expiring, TaPoS-bound list of [`Action`]s. A
//! [`SignedTransaction`] attaches signatures; [`TransactionMetadata`] wraps a signed
//! transaction with its canonical and signed ids, a write-once cache of the signer keys
//! recovered from the signatures, and the once-only `accepted` signal latch.
//!
//! Executing a transaction yields a [`TransactionTrace`]. Failure does not propagate out
//! of the push path: it is captured in [`TransactionTrace::except`] and classified as
//! subjective or objective by the controller.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::Digest;
use std::cell::{Cell, OnceCell};
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

use crate::errors::ChainError;

use super::basic::{
    ActionName, BlockId, ChainId, CryptoHash, CryptoHasher, DomainName, Name, PublicKey,
    SignatureBytes, Timestamp,
};

/// One authorized operation on the token database: a named action against a `key` inside
/// a `domain`, with a borsh-encoded payload interpreted by the action's apply handler.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Action {
    pub name: ActionName,
    pub domain: DomainName,
    pub key: Name,
    pub data: Vec<u8>,
}

impl Action {
    pub fn digest(&self) -> CryptoHash {
        CryptoHash::digest_of(self)
    }
}

/// The unsigned body of a transaction.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub expiration: Timestamp,
    pub ref_block_num: u16,
    pub ref_block_prefix: u32,
    pub actions: Vec<Action>,
}

impl Transaction {
    /// The canonical transaction id: the hash of the unsigned body.
    pub fn id(&self) -> CryptoHash {
        CryptoHash::digest_of(self)
    }

    /// Checks this transaction's TaPoS reference against a candidate block id.
    pub fn verify_reference_block(&self, id: &BlockId) -> bool {
        self.ref_block_num == id.block_num().summary_slot()
            && self.ref_block_prefix == id.tapos_prefix()
    }
}

/// A signature over a transaction's signing digest, paired with the key that produced it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AccountSignature {
    pub key: PublicKey,
    pub signature: SignatureBytes,
}

/// A transaction together with its signatures.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedTransaction {
    pub trx: Transaction,
    pub signatures: Vec<AccountSignature>,
}

impl SignedTransaction {
    /// The digest that transaction signatures are made over: the chain id concatenated
    /// with the canonical transaction id, so a signature cannot be replayed on another
    /// chain.
    pub fn signing_digest(id: &CryptoHash, chain_id: &ChainId) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(chain_id.bytes());
        hasher.update(id.bytes());
        CryptoHash::new(hasher.finalize().into())
    }

    /// The signed id: the canonical id hashed together with the signatures, so two
    /// differently-signed copies of the same transaction are distinguishable.
    pub fn signed_id(&self) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(self.trx.id().bytes());
        hasher.update(
            borsh::to_vec(&self.signatures).expect("borsh serialization cannot fail"),
        );
        CryptoHash::new(hasher.finalize().into())
    }
}

/// A signed transaction wrapped with derived ids and per-process bookkeeping. Lives from
/// arrival until the transaction is committed in an irreversible block or dropped from
/// the unapplied map. In-memory only; never serialized.
pub struct TransactionMetadata {
    pub trx: SignedTransaction,
    /// Hash of the unsigned body.
    pub id: CryptoHash,
    /// Hash of the body including signatures; the key of the unapplied map.
    pub signed_id: CryptoHash,
    /// Signer keys recovered by verifying each signature. Write-once: fork-switch
    /// replays re-authorize the same transaction without re-verifying.
    recovered_keys: OnceCell<BTreeSet<PublicKey>>,
    /// Whether the `accepted_transaction` signal has been emitted for this transaction.
    pub accepted: Cell<bool>,
}

impl TransactionMetadata {
    pub fn new(trx: SignedTransaction) -> Rc<TransactionMetadata> {
        let id = trx.trx.id();
        let signed_id = trx.signed_id();
        Rc::new(TransactionMetadata {
            trx,
            id,
            signed_id,
            recovered_keys: OnceCell::new(),
            accepted: Cell::new(false),
        })
    }

    /// Verifies every signature against the signing digest and returns the set of signer
    /// keys. The result is cached across calls; a transaction with any invalid signature
    /// fails with [`ChainError::InvalidSignature`].
    pub fn recover_keys(&self, chain_id: &ChainId) -> Result<&BTreeSet<PublicKey>, ChainError> {
        if let Some(keys) = self.recovered_keys.get() {
            return Ok(keys);
        }

        let digest = SignedTransaction::signing_digest(&self.id, chain_id);
        let mut keys = BTreeSet::new();
        for sig in &self.trx.signatures {
            let verifying_key = sig
                .key
                .verifying_key()
                .map_err(|_| ChainError::InvalidSignature(format!("malformed key {}", sig.key)))?;
            verifying_key
                .verify_strict(&digest.bytes(), &sig.signature.signature())
                .map_err(|_| {
                    ChainError::InvalidSignature(format!(
                        "signature by {} does not verify over transaction {}",
                        sig.key, self.id
                    ))
                })?;
            keys.insert(sig.key);
        }

        let _ = self.recovered_keys.set(keys);
        Ok(self.recovered_keys.get().expect("recovered keys were just set"))
    }
}

/// Terminal status of an executed transaction, recorded in its receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum TransactionStatus {
    Executed,
    SoftFail,
    HardFail,
}

/// A transaction receipt included in a block.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TransactionReceipt {
    pub status: TransactionStatus,
    pub trx: SignedTransaction,
}

impl TransactionReceipt {
    pub fn digest(&self) -> CryptoHash {
        CryptoHash::digest_of(self)
    }
}

/// The part of a transaction receipt that is echoed into a trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionReceiptHeader {
    pub status: TransactionStatus,
}

/// Receipt of one executed action: enough to recompute the block's action digest-tree
/// root deterministically.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ActionReceipt {
    pub name: ActionName,
    pub domain: DomainName,
    pub key: Name,
    pub act_digest: CryptoHash,
}

impl ActionReceipt {
    pub fn digest(&self) -> CryptoHash {
        CryptoHash::digest_of(self)
    }
}

/// Trace of one executed action.
#[derive(Clone, Debug)]
pub struct ActionTrace {
    pub receipt: ActionReceipt,
}

/// The result of pushing one transaction. Returned unconditionally: a failed execution
/// carries the error in `except` and leaves the pending block untouched.
#[derive(Debug)]
pub struct TransactionTrace {
    pub id: CryptoHash,
    pub status: TransactionStatus,
    pub elapsed: Duration,
    /// Number of signatures the transaction carried, recorded for resource accounting.
    pub signature_count: u32,
    pub action_traces: Vec<ActionTrace>,
    pub receipt: Option<TransactionReceiptHeader>,
    pub except: Option<ChainError>,
}
