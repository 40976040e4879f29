//! Shared scaffolding for the integration tests: deterministic keys, configuration
//! pointing at scratch directories, transaction builders, and a block production
//! helper driving the full start → push → finalize → sign → commit pipeline.

pub mod logging;

use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use ed25519_dalek::{Signer, SigningKey};

use tokenchain::config::{Config, GenesisState};
use tokenchain::contracts::{self, token::NewDomain};
use tokenchain::controller::Controller;
use tokenchain::errors::ChainError;
use tokenchain::state_db::objects::ChainConfig;
use tokenchain::types::authority::Authority;
use tokenchain::types::basic::{
    CryptoHash, DomainName, Name, PublicKey, SignatureBytes, Timestamp, BLOCK_INTERVAL_MS,
    PRODUCER_REPETITIONS,
};
use tokenchain::types::transaction::{
    AccountSignature, Action, SignedTransaction, Transaction, TransactionMetadata,
};

/// A deterministic signing key derived from a single-byte seed.
pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn public_key(key: &SigningKey) -> PublicKey {
    PublicKey::from(key.verifying_key())
}

/// A configuration rooted at `dir` with a genesis at timestamp 0 held by `genesis_key`.
pub fn test_config(dir: &Path, genesis_key: PublicKey) -> Config {
    Config {
        shared_memory_dir: dir.join("state"),
        shared_memory_size: 256 << 20,
        read_only: false,
        block_log_dir: dir.join("blocks"),
        tokendb_dir: dir.join("tokens"),
        genesis: GenesisState {
            initial_key: genesis_key,
            initial_timestamp: Timestamp::from_millis(0),
            initial_configuration: ChainConfig::default(),
        },
        log_events: false,
    }
}

/// The timestamp of production slot `k * PRODUCER_REPETITIONS`, so that slot index `k`
/// maps to producer index `k % schedule_len`.
pub fn slot_timestamp(k: u64) -> Timestamp {
    Timestamp::from_millis(k * PRODUCER_REPETITIONS * BLOCK_INTERVAL_MS)
}

pub fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

/// An action creating `domain` with every authority held by `creator`.
pub fn newdomain_action(domain: &str, creator: PublicKey) -> Action {
    let payload = NewDomain {
        name: DomainName::new(domain),
        creator,
        issue: Authority::single_key(creator),
        transfer: Authority::owner(),
        manage: Authority::single_key(creator),
    };
    Action {
        name: contracts::NEWDOMAIN,
        domain: DomainName::new(domain),
        key: Name::new(domain),
        data: borsh::to_vec(&payload).unwrap(),
    }
}

/// Wraps actions into a transaction expiring an hour past `now`.
pub fn transaction_with(actions: Vec<Action>, now: Timestamp) -> Transaction {
    Transaction {
        expiration: now.plus_seconds(3600),
        ref_block_num: 0,
        ref_block_prefix: 0,
        actions,
    }
}

/// Signs a transaction with each given key and wraps it into metadata.
pub fn sign_transaction(
    controller: &Controller,
    trx: Transaction,
    keys: &[&SigningKey],
) -> Rc<TransactionMetadata> {
    let digest = SignedTransaction::signing_digest(&trx.id(), &controller.chain_id());
    let signatures = keys
        .iter()
        .map(|key| AccountSignature {
            key: public_key(key),
            signature: SignatureBytes::from(key.sign(&digest.bytes())),
        })
        .collect();
    TransactionMetadata::new(SignedTransaction { trx, signatures })
}

/// Finalizes, signs, and commits the currently pending block.
pub fn seal_block(controller: &mut Controller, signer: &SigningKey) -> Result<(), ChainError> {
    controller.finalize_block()?;
    let key = signer.clone();
    controller
        .sign_block(&move |digest: &CryptoHash| Ok(SignatureBytes::from(key.sign(&digest.bytes()))))?;
    controller.commit_block()
}

/// Drives one block through the full pipeline. Fails if any transaction's trace carries
/// an exception.
pub fn produce_block(
    controller: &mut Controller,
    slot: u64,
    confirm_count: u16,
    signer: &SigningKey,
    trxs: &[Rc<TransactionMetadata>],
) -> Result<(), ChainError> {
    controller.start_block(slot_timestamp(slot), confirm_count)?;
    for trx in trxs {
        let trace = controller.push_transaction(trx, deadline())?;
        if let Some(except) = &trace.except {
            return Err(except.clone());
        }
    }
    seal_block(controller, signer)
}
