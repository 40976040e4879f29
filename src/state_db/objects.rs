/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The typed indexes registered in the state database, and accessors that put their
//! entries at the right [`paths`](super::paths).
//!
//! Three indexes exist: the singleton [`GlobalPropertyObject`], the 65,536-entry
//! [`BlockSummaryObject`] ring that backs TaPoS reference-block verification, and the
//! [`TransactionObject`] dedup index keyed both by transaction id and by expiration.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::errors::ChainError;
use crate::types::basic::{BlockId, BlockNum, CryptoHash, Timestamp};
use crate::types::block::ProducerSchedule;

use super::paths;
use super::{StateDb, StateIndex};

/// Chain-wide configuration fixed at genesis and consulted during validation.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ChainConfig {
    /// Maximum number of seconds a transaction's expiration may lie past the pending
    /// block's time.
    pub max_transaction_lifetime: u32,
}

impl Default for ChainConfig {
    fn default() -> ChainConfig {
        ChainConfig { max_transaction_lifetime: 3600 }
    }
}

/// Singleton chain state: the chain configuration and the at-most-one proposed producer
/// schedule together with the block number it was proposed in. The proposal is cleared
/// when it is promoted into a block header's pending schedule.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct GlobalPropertyObject {
    pub proposed_schedule_block_num: Option<BlockNum>,
    pub proposed_schedule: Option<ProducerSchedule>,
    pub configuration: ChainConfig,
}

impl StateIndex for GlobalPropertyObject {
    const NAME: &'static str = "global_property";
    const PREFIXES: &'static [[u8; 1]] = &[paths::GLOBAL_PROPERTIES];
}

/// One slot of the block summary ring: the id of the most recent block whose number maps
/// to the slot.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockSummaryObject {
    pub block_id: BlockId,
}

impl StateIndex for BlockSummaryObject {
    const NAME: &'static str = "block_summary";
    const PREFIXES: &'static [[u8; 1]] = &[paths::BLOCK_SUMMARY];
}

/// A dedup entry for an accepted input transaction, retained until its expiration
/// passes.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TransactionObject {
    pub expiration: Timestamp,
}

impl StateIndex for TransactionObject {
    const NAME: &'static str = "transaction";
    const PREFIXES: &'static [[u8; 1]] =
        &[paths::TRANSACTION_BY_ID, paths::TRANSACTION_BY_EXPIRATION];
}

impl StateDb {
    pub fn global_property(&self) -> Result<GlobalPropertyObject, ChainError> {
        self.assert_registered::<GlobalPropertyObject>();
        let bytes = self.get(&paths::GLOBAL_PROPERTIES).ok_or_else(|| {
            ChainError::Consistency("global property object missing from state database".to_string())
        })?;
        GlobalPropertyObject::try_from_slice(&bytes).map_err(|err| {
            ChainError::Consistency(format!("corrupt global property object: {}", err))
        })
    }

    pub fn set_global_property(&self, gpo: &GlobalPropertyObject) {
        self.assert_registered::<GlobalPropertyObject>();
        self.set(
            &paths::GLOBAL_PROPERTIES,
            &borsh::to_vec(&gpo).expect("borsh serialization cannot fail"),
        );
    }

    pub fn block_summary(&self, slot: u16) -> Result<BlockSummaryObject, ChainError> {
        self.assert_registered::<BlockSummaryObject>();
        let key = paths::combine(&paths::BLOCK_SUMMARY, &slot.to_be_bytes());
        let bytes = self.get(&key).ok_or_else(|| {
            ChainError::Consistency(format!("block summary slot {} missing", slot))
        })?;
        BlockSummaryObject::try_from_slice(&bytes)
            .map_err(|err| ChainError::Consistency(format!("corrupt block summary: {}", err)))
    }

    pub fn set_block_summary(&self, slot: u16, summary: &BlockSummaryObject) {
        self.assert_registered::<BlockSummaryObject>();
        let key = paths::combine(&paths::BLOCK_SUMMARY, &slot.to_be_bytes());
        self.set(&key, &borsh::to_vec(&summary).expect("borsh serialization cannot fail"));
    }

    /// Records an accepted input transaction in the dedup index, failing if an entry
    /// with the same id is already present.
    pub fn insert_transaction(
        &self,
        id: &CryptoHash,
        expiration: Timestamp,
    ) -> Result<(), ChainError> {
        self.assert_registered::<TransactionObject>();

        let by_id_key = paths::combine(&paths::TRANSACTION_BY_ID, &id.bytes());
        if self.get(&by_id_key).is_some() {
            return Err(ChainError::TxDuplicate(*id));
        }

        let object = TransactionObject { expiration };
        self.set(&by_id_key, &borsh::to_vec(&object).expect("borsh serialization cannot fail"));

        let by_expiration_key = paths::combine(
            &paths::TRANSACTION_BY_EXPIRATION,
            &paths::combine(&expiration.millis().to_be_bytes(), &id.bytes()),
        );
        self.set(&by_expiration_key, &[]);
        Ok(())
    }

    /// Removes every dedup entry whose expiration lies before `now`. Returns how many
    /// entries were cleared.
    pub fn clear_expired_transactions(&self, now: Timestamp) -> usize {
        self.assert_registered::<TransactionObject>();

        let mut cleared = 0;
        while let Some((key, _)) = self.first_with_prefix(&paths::TRANSACTION_BY_EXPIRATION) {
            let suffix = &key[paths::TRANSACTION_BY_EXPIRATION.len()..];
            let expiration = Timestamp::from_millis(u64::from_be_bytes(
                suffix[..8].try_into().expect("expiration key carries 8 expiration bytes"),
            ));
            if expiration >= now {
                break;
            }
            self.remove(&key);
            let by_id_key = paths::combine(&paths::TRANSACTION_BY_ID, &suffix[8..]);
            self.remove(&by_id_key);
            cleared += 1;
        }
        cleared
    }
}
