/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator, and the genesis state the chain id is
//! derived from.

use borsh::{BorshDeserialize, BorshSerialize};
use std::path::PathBuf;

use crate::state_db::objects::ChainConfig;
use crate::types::basic::{ChainId, CryptoHash, PublicKey, Timestamp};

/// Operator-provided configuration for a [`Controller`](crate::controller::Controller).
#[derive(Clone)]
pub struct Config {
    /// Directory of the general-purpose state database.
    pub shared_memory_dir: PathBuf,
    /// Byte capacity of the state database.
    pub shared_memory_size: u64,
    /// Open the state database read-only, disabling block production.
    pub read_only: bool,
    /// Directory of the append-only block log.
    pub block_log_dir: PathBuf,
    /// Directory of the token database.
    pub tokendb_dir: PathBuf,
    pub genesis: GenesisState,
    /// Install the default logging handlers for every emitted event.
    pub log_events: bool,
}

/// The initial key, timestamp, and chain configuration. Hashing the genesis state yields
/// the chain id, so two chains with different genesis configurations can never accept
/// each other's transactions or blocks.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct GenesisState {
    pub initial_key: PublicKey,
    pub initial_timestamp: Timestamp,
    pub initial_configuration: ChainConfig,
}

impl GenesisState {
    pub fn compute_chain_id(&self) -> ChainId {
        ChainId::new(CryptoHash::digest_of(self).bytes())
    }
}
