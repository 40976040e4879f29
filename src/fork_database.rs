/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The in-memory DAG of candidate block states and the chain-selection rules over it.
//!
//! Every block the node has seen but not yet discarded lives here as a
//! [`BlockState`]. The database selects its [`head`](ForkDatabase::head) as the
//! highest-weight block by `(dpos_irreversible_blocknum, block_num, timestamp)`, ties
//! broken by id bytes. The controller's *applied* head may briefly differ during a fork
//! switch; [`ForkDatabase::fetch_branch_from`] supplies the two branches between any two
//! blocks and their lowest common ancestor for exactly that maneuver.
//!
//! # Irreversibility signal
//!
//! The database accepts a callback (a plain function value, never a typed back-pointer
//! into the controller) that fires exactly once per applied in-current-chain block, in
//! ascending height order, as the head's `last_irreversible` number passes it. A
//! monotonic mark records how far signals have fired; blocks strictly below the mark are
//! pruned, together with any forks hanging off them.
//!
//! # Persistence
//!
//! Reversible block states are written to `fork_db.dat` on [`close`](ForkDatabase::close)
//! and reloaded on open, so a cleanly restarted node resumes from its reversible window.
//! After a crash the file is simply absent or stale and the node rebuilds from the block
//! log instead.

use borsh::{BorshDeserialize, BorshSerialize};
use std::cell::Cell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::errors::ChainError;
use crate::types::basic::{BlockId, BlockNum};
use crate::types::block::{BlockHeaderState, BlockState, HeaderConfirmation, SignedBlock};

const FORK_DB_FILE: &str = "fork_db.dat";

/// Callback invoked for each block passing irreversibility.
pub type IrreversibleCallback = Box<dyn Fn(&Rc<BlockState>)>;

#[derive(BorshSerialize, BorshDeserialize)]
struct StoredBlockState {
    header_state: BlockHeaderState,
    bft_irreversible_blocknum: BlockNum,
    block: SignedBlock,
    validated: bool,
    in_current_chain: bool,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct StoredForkDatabase {
    states: Vec<StoredBlockState>,
    irreversible_mark: BlockNum,
}

pub struct ForkDatabase {
    index: HashMap<BlockId, Rc<BlockState>>,
    head: Option<Rc<BlockState>>,
    irreversible: Option<IrreversibleCallback>,
    /// Highest block number for which the irreversibility signal has fired.
    irreversible_mark: BlockNum,
    dir: PathBuf,
}

impl ForkDatabase {
    /// Opens the fork database, reloading the reversible window persisted by a previous
    /// clean shutdown if present.
    pub fn open(dir: &Path) -> Result<ForkDatabase, ChainError> {
        fs::create_dir_all(dir)?;

        let mut fork_db = ForkDatabase {
            index: HashMap::new(),
            head: None,
            irreversible: None,
            irreversible_mark: BlockNum::new(0),
            dir: dir.to_path_buf(),
        };

        let path = dir.join(FORK_DB_FILE);
        if path.is_file() {
            let bytes = fs::read(&path)?;
            let stored = StoredForkDatabase::try_from_slice(&bytes)
                .map_err(|err| ChainError::Io(format!("corrupt fork database file: {}", err)))?;
            for entry in stored.states {
                let state = Rc::new(BlockState {
                    block: entry.block,
                    trxs: Vec::new(),
                    validated: Cell::new(entry.validated),
                    in_current_chain: Cell::new(entry.in_current_chain),
                    header_state: entry.header_state,
                });
                state.header_state.set_bft_irreversible(entry.bft_irreversible_blocknum);
                fork_db.index.insert(state.id, state);
            }
            fork_db.irreversible_mark = stored.irreversible_mark;
            fork_db.recompute_head();
        }

        Ok(fork_db)
    }

    /// Persists the reversible window and drops the in-memory state.
    pub fn close(&mut self) -> Result<(), ChainError> {
        let stored = StoredForkDatabase {
            states: self
                .index
                .values()
                .map(|state| StoredBlockState {
                    header_state: state.header_state.clone(),
                    bft_irreversible_blocknum: state.bft_irreversible_blocknum.get(),
                    block: state.block.clone(),
                    validated: state.validated.get(),
                    in_current_chain: state.in_current_chain.get(),
                })
                .collect(),
            irreversible_mark: self.irreversible_mark,
        };
        let bytes = borsh::to_vec(&stored).expect("borsh serialization cannot fail");
        fs::write(self.dir.join(FORK_DB_FILE), bytes)?;
        self.index.clear();
        self.head = None;
        Ok(())
    }

    /// Registers the irreversibility callback. At most one is held.
    pub fn set_irreversible_callback(&mut self, callback: IrreversibleCallback) {
        self.irreversible = Some(callback);
    }

    /// Initializes the database with its root block state. Only legal while empty.
    pub fn set(&mut self, root: Rc<BlockState>) {
        assert!(self.index.is_empty(), "fork database is already initialized");
        self.irreversible_mark = BlockNum::new(root.block_num.int().saturating_sub(1));
        self.index.insert(root.id, root.clone());
        self.head = Some(root);
    }

    pub fn head(&self) -> Option<Rc<BlockState>> {
        self.head.clone()
    }

    pub fn get_block(&self, id: &BlockId) -> Option<Rc<BlockState>> {
        self.index.get(id).cloned()
    }

    pub fn get_block_in_current_chain_by_num(&self, num: BlockNum) -> Option<Rc<BlockState>> {
        self.index
            .values()
            .find(|state| state.block_num == num && state.in_current_chain.get())
            .cloned()
    }

    /// Links a received block onto its parent, validates its header, and inserts the
    /// resulting state. `trust` skips the producer signature check.
    pub fn add(&mut self, block: SignedBlock, trust: bool) -> Result<Rc<BlockState>, ChainError> {
        let parent = self.get_block(&block.header.previous).ok_or_else(|| {
            ChainError::UnlinkableBlock(format!(
                "block at height {} links to unknown block {}",
                block.header.block_num(),
                block.header.previous
            ))
        })?;
        let state = Rc::new(BlockState::from_received(&parent, block, trust)?);
        self.add_block_state(state)
    }

    /// Inserts an already-derived block state, reselects the head, and advances
    /// irreversibility.
    pub fn add_block_state(
        &mut self,
        state: Rc<BlockState>,
    ) -> Result<Rc<BlockState>, ChainError> {
        if self.index.contains_key(&state.id) {
            return Err(ChainError::BlockValidation(format!(
                "block {} is already present in the fork database",
                state.id
            )));
        }
        if !self.index.contains_key(&state.header.previous) {
            return Err(ChainError::UnlinkableBlock(format!(
                "block {} links to unknown block {}",
                state.id, state.header.previous
            )));
        }

        self.index.insert(state.id, state.clone());
        self.recompute_head();
        self.advance_irreversibility();
        Ok(state)
    }

    /// Attaches a producer confirmation to its block. Reaching a confirmation quorum
    /// (strictly more than two thirds of the active schedule) raises the block's BFT
    /// irreversibility number, propagates it to descendants, and may advance the
    /// irreversibility signal.
    pub fn add_confirmation(&mut self, confirmation: &HeaderConfirmation) -> Result<(), ChainError> {
        let state = self.get_block(&confirmation.block_id).ok_or_else(|| {
            ChainError::UnknownBlock(format!(
                "confirmation references unknown block {}",
                confirmation.block_id
            ))
        })?;

        let count = state.header_state.add_confirmation(confirmation)?;
        if count >= state.active_schedule.required_confirmations() {
            state.header_state.set_bft_irreversible(state.block_num);
            self.propagate_bft_irreversibility(&state);
            self.recompute_head();
            self.advance_irreversibility();
        }
        Ok(())
    }

    pub fn mark_in_current_chain(&self, state: &Rc<BlockState>, in_chain: bool) {
        state.in_current_chain.set(in_chain);
    }

    /// Marking a block invalid removes it from the database entirely, so it can never
    /// again be selected as head.
    pub fn set_validity(&mut self, state: &Rc<BlockState>, valid: bool) {
        if valid {
            state.validated.set(true);
        } else {
            self.index.remove(&state.id);
            self.recompute_head();
        }
    }

    /// Returns the two branches from the lowest common ancestor of `a` and `b` up to
    /// each of them: `(a_branch, b_branch)`, both ordered descendant-first and excluding
    /// the ancestor itself.
    pub fn fetch_branch_from(
        &self,
        a: &BlockId,
        b: &BlockId,
    ) -> Result<(Vec<Rc<BlockState>>, Vec<Rc<BlockState>>), ChainError> {
        let mut first = self
            .get_block(a)
            .ok_or_else(|| ChainError::UnknownBlock(format!("no block state for {}", a)))?;
        let mut second = self
            .get_block(b)
            .ok_or_else(|| ChainError::UnknownBlock(format!("no block state for {}", b)))?;

        let mut first_branch = Vec::new();
        let mut second_branch = Vec::new();

        while first.block_num > second.block_num {
            first_branch.push(first.clone());
            first = self.parent_of(&first)?;
        }
        while second.block_num > first.block_num {
            second_branch.push(second.clone());
            second = self.parent_of(&second)?;
        }
        while first.id != second.id {
            first_branch.push(first.clone());
            second_branch.push(second.clone());
            first = self.parent_of(&first)?;
            second = self.parent_of(&second)?;
        }

        Ok((first_branch, second_branch))
    }

    fn parent_of(&self, state: &Rc<BlockState>) -> Result<Rc<BlockState>, ChainError> {
        self.get_block(&state.header.previous).ok_or_else(|| {
            ChainError::UnknownBlock(format!(
                "branch walk from {} reached unknown block {}",
                state.id, state.header.previous
            ))
        })
    }

    fn recompute_head(&mut self) {
        self.head = self
            .index
            .values()
            .max_by_key(|state| {
                (
                    state.dpos_irreversible_blocknum,
                    state.block_num,
                    state.header.timestamp,
                    state.id.bytes(),
                )
            })
            .cloned();
    }

    fn propagate_bft_irreversibility(&self, from: &Rc<BlockState>) {
        let mut frontier = vec![from.id];
        while let Some(id) = frontier.pop() {
            let bft = self
                .index
                .get(&id)
                .expect("propagation frontier only holds indexed blocks")
                .bft_irreversible_blocknum
                .get();
            for child in self.index.values().filter(|s| s.header.previous == id) {
                child.header_state.set_bft_irreversible(bft);
                frontier.push(child.id);
            }
        }
    }

    /// Fires the irreversibility callback for each block the head's `last_irreversible`
    /// number has newly passed, in ascending height order, then prunes everything below
    /// the mark.
    ///
    /// The mark only advances through blocks that are applied (validated) and on the
    /// current chain: a block can pass irreversibility before the controller has
    /// executed it (its insertion is what moved the head), and it must not be promoted
    /// to the block log until it has. Such a block is picked up by the next advance.
    fn advance_irreversibility(&mut self) {
        let lib = match &self.head {
            Some(head) => head.last_irreversible(),
            None => return,
        };

        while self.irreversible_mark < lib {
            let next_num = BlockNum::new(self.irreversible_mark.int() + 1);
            let next = match self.index.values().find(|state| {
                state.block_num == next_num
                    && state.in_current_chain.get()
                    && state.validated.get()
            }) {
                Some(state) => state.clone(),
                None => break,
            };

            self.irreversible_mark = next_num;
            if let Some(callback) = &self.irreversible {
                callback(&next);
            }
        }

        let mark = self.irreversible_mark;
        let pruned: Vec<BlockId> = self
            .index
            .values()
            .filter(|state| state.block_num < mark)
            .map(|state| state.id)
            .collect();
        for id in pruned {
            self.index.remove(&id);
        }
    }
}
