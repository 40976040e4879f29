/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The block-production and chain-advancement controller.
//!
//! The [`Controller`] orchestrates the three persistence layers (undo-log state
//! database, token database with savepoints, append-only block log), the fork database,
//! and the apply-handler registry, keeping them mutually consistent under crashes,
//! reorganizations, and adversarial inputs.
//!
//! ## Block assembly
//!
//! `start_block` opens a [`PendingState`]: one undo session on the state database, one
//! savepoint session on the token database, and the under-construction block state.
//! `push_transaction` executes a transaction into it (inside nested sessions of its
//! own), `finalize_block` seals the digest-tree roots and the block id, `sign_block`
//! attaches the producer signature, and `commit_block` inserts the block into the fork
//! database and seals both sessions. `abort_block` returns the included transactions to
//! the unapplied map and unwinds everything.
//!
//! ## Received blocks and fork switching
//!
//! `push_block` links a received block into the fork database and then calls
//! `maybe_switch_forks`: if the fork database's head moved to another branch, the
//! controller pops its applied blocks back to the common ancestor and replays the
//! winning branch, restoring the previous chain if any block of the new one fails to
//! apply. The controller's `head` is the currently *applied* head; it differs from
//! `fork_db.head()` only transiently inside this maneuver.
//!
//! ## Irreversibility
//!
//! The fork database fires a callback for each block its head's `last_irreversible`
//! number passes. The callback appends the block to the block log, emits the
//! `irreversible_block` signal, commits the state database up to the block, and pops
//! the token database savepoints at or below it.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::authorization::AuthorizationChecker;
use crate::block_log::BlockLog;
use crate::config::Config;
use crate::contracts::{ApplyHandler, ApplyHandlerRegistry};
use crate::errors::ChainError;
use crate::events::*;
use crate::fork_database::ForkDatabase;
use crate::state_db::objects::{BlockSummaryObject, GlobalPropertyObject, TransactionObject};
use crate::state_db::{Session, StateDb};
use crate::token_db::{TokenDb, TokenDbSession};
use crate::transaction_context::TransactionContext;
use crate::types::basic::{
    ActionName, BlockId, BlockNum, ChainId, CryptoHash, Name, PublicKey, SignatureBytes, Timestamp,
};
use crate::types::block::{
    BlockHeader, BlockHeaderState, BlockState, HeaderConfirmation, ProducerKey, ProducerSchedule,
    SignedBlock,
};
use crate::types::merkle::merkle;
use crate::types::transaction::{
    ActionReceipt, ActionTrace, Transaction, TransactionMetadata, TransactionReceipt,
    TransactionReceiptHeader, TransactionStatus, TransactionTrace,
};

/// Deadline used when replaying received or logged blocks: effectively unbounded, since
/// the transactions were already accepted into a block.
const REPLAY_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

/// Everything that exists only while a block is being assembled. Dropping it unwinds
/// both store sessions, so no failure path can leak a session or a savepoint.
struct PendingState {
    db_session: Session,
    token_session: TokenDbSession,
    block_state: BlockState,
    /// Receipts of every action executed into this block, in execution order.
    actions: Vec<ActionReceipt>,
}

/// A scope-bound undo for the three vectors that grow while a transaction is pushed:
/// the pending block's transaction receipts, its transaction metadata list, and the
/// executed action receipts. Capture it before growing them; either
/// [`cancel`](BlockRestorePoint::cancel) it on success or [`run`](BlockRestorePoint::run)
/// it to truncate all three back, keeping the pending block well-formed.
#[must_use]
struct BlockRestorePoint {
    block_transactions: usize,
    state_transactions: usize,
    actions: usize,
}

impl BlockRestorePoint {
    fn capture(pending: &PendingState) -> BlockRestorePoint {
        BlockRestorePoint {
            block_transactions: pending.block_state.block.transactions.len(),
            state_transactions: pending.block_state.trxs.len(),
            actions: pending.actions.len(),
        }
    }

    fn cancel(self) {}

    fn run(self, pending: &mut PendingState) {
        pending.block_state.block.transactions.truncate(self.block_transactions);
        pending.block_state.trxs.truncate(self.state_transactions);
        pending.actions.truncate(self.actions);
    }
}

pub struct Controller {
    config: Config,
    chain_id: ChainId,
    state_db: StateDb,
    token_db: TokenDb,
    blog: Rc<RefCell<BlockLog>>,
    fork_db: ForkDatabase,
    /// The currently applied head. Differs from `fork_db.head()` only transiently
    /// inside `maybe_switch_forks`.
    head: Rc<BlockState>,
    pending: Option<PendingState>,
    /// Transactions that were undone by `pop_block` or `abort_block`, or that failed
    /// subjectively. Entries leave when re-applied in another block or when they fail
    /// deterministically. Producers query this when scheduling new transactions.
    unapplied_transactions: IndexMap<CryptoHash, Rc<TransactionMetadata>>,
    apply_handlers: ApplyHandlerRegistry,
    signals: Rc<SignalHub>,
    replaying: Rc<Cell<bool>>,
}

impl Controller {
    /// Opens the three persistent stores, wires the irreversibility callback, restores
    /// or initializes the chain state, and replays any blocks the block log holds past
    /// the current head.
    pub fn new(config: Config) -> Result<Controller, ChainError> {
        let chain_id = config.genesis.compute_chain_id();
        let state_db =
            StateDb::open(&config.shared_memory_dir, config.read_only, config.shared_memory_size)?;
        let token_db = TokenDb::open(&config.tokendb_dir)?;
        let blog = Rc::new(RefCell::new(BlockLog::open(&config.block_log_dir)?));
        let mut fork_db = ForkDatabase::open(&config.shared_memory_dir)?;
        let signals = Rc::new(SignalHub::new(config.log_events));
        let replaying = Rc::new(Cell::new(false));

        {
            let state_db = state_db.clone();
            let token_db = token_db.clone();
            let blog = blog.clone();
            let signals = signals.clone();
            let replaying = replaying.clone();
            fork_db.set_irreversible_callback(Box::new(move |block| {
                on_irreversible(&state_db, &token_db, &blog, &signals, replaying.get(), block)
            }));
        }

        state_db.register_index::<GlobalPropertyObject>();
        state_db.register_index::<BlockSummaryObject>();
        state_db.register_index::<TransactionObject>();

        let head = match fork_db.head() {
            Some(head) => {
                while state_db.revision() > head.block_num.int() as u64 {
                    log::warn!(
                        "state database revision {} is greater than head block {}, undoing pending changes",
                        state_db.revision(),
                        head.block_num
                    );
                    if state_db.undo_depth() == 0 {
                        return Err(ChainError::Consistency(
                            "state database is ahead of the fork database and holds no undo state"
                                .to_string(),
                        ));
                    }
                    state_db.undo();
                }
                if state_db.revision() != head.block_num.int() as u64 {
                    return Err(ChainError::Consistency(format!(
                        "fork database head {} is inconsistent with state database revision {}",
                        head.block_num,
                        state_db.revision()
                    )));
                }
                head
            }
            None => {
                Self::initialize_genesis(&config, chain_id, &state_db, &token_db, &blog, &mut fork_db)?
            }
        };

        let mut controller = Controller {
            config,
            chain_id,
            state_db,
            token_db,
            blog,
            fork_db,
            head,
            pending: None,
            unapplied_transactions: IndexMap::new(),
            apply_handlers: ApplyHandlerRegistry::token_lifecycle(),
            signals,
            replaying,
        };
        controller.replay_block_log()?;
        Ok(controller)
    }

    /// Sets the fork database head to the genesis state and seeds the state database's
    /// indexes: all 65,536 block summary slots, the genesis id at its slot, and the
    /// global property object.
    fn initialize_genesis(
        config: &Config,
        chain_id: ChainId,
        state_db: &StateDb,
        token_db: &TokenDb,
        blog: &Rc<RefCell<BlockLog>>,
        fork_db: &mut ForkDatabase,
    ) -> Result<Rc<BlockState>, ChainError> {
        log::warn!("initializing new blockchain with genesis state");

        if state_db.revision() != 0 || !token_db.is_pristine() {
            log::warn!(
                "store snapshots are ahead of an empty fork database, discarding them and rebuilding from the block log"
            );
            state_db.clear();
            token_db.clear();
        }

        let schedule = ProducerSchedule::genesis(config.genesis.initial_key);
        let genesis_header =
            BlockHeaderState::genesis(schedule, config.genesis.initial_timestamp, chain_id);
        let genesis_state = Rc::new(BlockState::genesis(genesis_header));

        fork_db.set(genesis_state.clone());
        state_db.set_revision(genesis_state.block_num.int() as u64);

        for slot in 0..=u16::MAX {
            state_db.set_block_summary(slot, &BlockSummaryObject { block_id: BlockId::zero() });
        }
        state_db.set_block_summary(
            genesis_state.block_num.summary_slot(),
            &BlockSummaryObject { block_id: genesis_state.id },
        );
        state_db.set_global_property(&GlobalPropertyObject {
            proposed_schedule_block_num: None,
            proposed_schedule: None,
            configuration: config.genesis.initial_configuration.clone(),
        });

        if blog.borrow().head().is_none() {
            blog.borrow_mut().append(&genesis_state.block);
        }

        Ok(genesis_state)
    }

    /// Replays blocks the block log holds past the current head through
    /// `push_block(trust = true)`. Irreversibility promotion suppresses log appends for
    /// blocks the log already has.
    fn replay_block_log(&mut self) -> Result<(), ChainError> {
        let log_head_num = match self.blog.borrow().head_block_num() {
            Some(num) => num,
            None => return Ok(()),
        };
        if log_head_num <= self.head.block_num {
            return Ok(());
        }

        self.replaying.set(true);
        log::info!(
            "existing block log, attempting to replay {} blocks",
            log_head_num.int() - self.head.block_num.int()
        );
        let started = Instant::now();
        loop {
            let next = self.blog.borrow().read_block_by_num(self.head.block_num.next())?;
            let next = match next {
                Some(block) => block,
                None => break,
            };
            let block_num = next.header.block_num();
            self.push_block(next, true)?;
            if block_num.int() % 100 == 0 {
                log::info!("replayed block {} of {}", block_num, log_head_num);
            }
        }
        self.replaying.set(false);
        log::info!(
            "replayed blocks up to {} in {:.3} seconds",
            self.head.block_num,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /* ↓↓↓ Block assembly ↓↓↓ */

    /// Opens a pending block at timestamp `when`, whose producer confirms
    /// `confirm_count` previous blocks. Promotes the proposed producer schedule to
    /// pending if its proposal block has become irreversible, and clears expired
    /// entries from the transaction dedup index.
    pub fn start_block(&mut self, when: Timestamp, confirm_count: u16) -> Result<(), ChainError> {
        if self.pending.is_some() {
            return Err(ChainError::Consistency(
                "it is not valid to start a block when one is already pending".to_string(),
            ));
        }
        if self.config.read_only {
            return Err(ChainError::ReadOnly);
        }
        if self.state_db.revision() != self.head.block_num.int() as u64 {
            return Err(ChainError::Consistency(format!(
                "state database revision {} does not match head block {}",
                self.state_db.revision(),
                self.head.block_num
            )));
        }

        let (block_state, was_pending_promoted) =
            BlockState::new_pending(&self.head, when, confirm_count)?;
        block_state.in_current_chain.set(true);

        let db_session = self.state_db.start_undo_session();
        let token_session = self.token_db.new_savepoint_session(block_state.block_num.int() as u64);
        let mut pending =
            PendingState { db_session, token_session, block_state, actions: Vec::new() };

        let mut gpo = self.state_db.global_property()?;
        if let (Some(proposed_num), Some(proposed)) =
            (gpo.proposed_schedule_block_num, gpo.proposed_schedule.clone())
        {
            if proposed_num <= pending.block_state.dpos_irreversible_blocknum
                && pending.block_state.pending_schedule.producers.is_empty()
                && !was_pending_promoted
            {
                log::info!(
                    "promoting proposed schedule (set in block {}) to pending; current block: {} lib: {} schedule version: {}",
                    proposed_num,
                    pending.block_state.block_num,
                    pending.block_state.dpos_irreversible_blocknum,
                    proposed.version
                );
                pending.block_state.header_state.set_new_producers(proposed)?;
                gpo.proposed_schedule_block_num = None;
                gpo.proposed_schedule = None;
                self.state_db.set_global_property(&gpo);
            }
        }

        self.state_db.clear_expired_transactions(when);
        self.pending = Some(pending);
        Ok(())
    }

    /// Pushes an input transaction into the open pending block. Returns a trace
    /// unconditionally; execution failure is signaled through `trace.except` and leaves
    /// the pending block exactly as it was.
    pub fn push_transaction(
        &mut self,
        trx: &Rc<TransactionMetadata>,
        deadline: Instant,
    ) -> Result<Rc<TransactionTrace>, ChainError> {
        self.push_transaction_with(trx, deadline, false)
    }

    fn push_transaction_with(
        &mut self,
        trx: &Rc<TransactionMetadata>,
        deadline: Instant,
        implicit: bool,
    ) -> Result<Rc<TransactionTrace>, ChainError> {
        let restore = match self.pending.as_ref() {
            Some(pending) => BlockRestorePoint::capture(pending),
            None => return Err(ChainError::NoPendingBlock),
        };

        match self.exec_transaction(trx, deadline, implicit) {
            Ok((receipts, action_traces, elapsed, signature_count)) => {
                let pending = self.pending.as_mut().expect("pending block checked above");

                if !implicit {
                    pending.block_state.block.transactions.push(TransactionReceipt {
                        status: TransactionStatus::Executed,
                        trx: trx.trx.clone(),
                    });
                    pending.block_state.trxs.push(trx.clone());
                }
                pending.actions.extend(receipts);

                let trace = Rc::new(TransactionTrace {
                    id: trx.id,
                    status: TransactionStatus::Executed,
                    elapsed,
                    signature_count,
                    action_traces,
                    receipt: Some(TransactionReceiptHeader {
                        status: TransactionStatus::Executed,
                    }),
                    except: None,
                });

                // The accept signal fires only once per transaction, even across
                // fork-switch replays.
                if !trx.accepted.get() {
                    self.signals.emit_accepted_transaction(trx);
                    trx.accepted.set(true);
                }
                self.signals.emit_applied_transaction(&trace);

                restore.cancel();

                if !implicit {
                    self.unapplied_transactions.shift_remove(&trx.signed_id);
                }
                Ok(trace)
            }
            Err(except) => {
                // Truncate the three growing vectors back to their pre-call sizes, so
                // the pending block stays well-formed whatever the handlers did before
                // failing.
                restore.run(self.pending.as_mut().expect("pending block checked above"));

                if !implicit {
                    if except.is_subjective() {
                        self.unapplied_transactions.insert(trx.signed_id, trx.clone());
                    } else {
                        self.unapplied_transactions.shift_remove(&trx.signed_id);
                    }
                }
                let trace = Rc::new(TransactionTrace {
                    id: trx.id,
                    status: TransactionStatus::HardFail,
                    elapsed: Duration::ZERO,
                    signature_count: trx.trx.signatures.len() as u32,
                    action_traces: Vec::new(),
                    receipt: None,
                    except: Some(except),
                });
                Ok(trace)
            }
        }
    }

    /// Executes one transaction inside nested sessions on both stores. Success squashes
    /// the nested sessions into the block's; any failure unwinds them, so the stores
    /// never keep a partially executed transaction.
    fn exec_transaction(
        &self,
        trx: &Rc<TransactionMetadata>,
        deadline: Instant,
        implicit: bool,
    ) -> Result<(Vec<ActionReceipt>, Vec<ActionTrace>, Duration, u32), ChainError> {
        let block_num = self
            .pending
            .as_ref()
            .expect("exec_transaction requires a pending block")
            .block_state
            .block_num;

        let db_session = self.state_db.start_undo_session();
        let token_session = self.token_db.new_savepoint_session(block_num.int() as u64);

        let mut context = TransactionContext::new(
            self.state_db.clone(),
            self.token_db.clone(),
            &self.apply_handlers,
            &trx.trx,
            trx.id,
            deadline,
        );
        if implicit {
            context.init_for_implicit_trx();
        } else {
            context.init_for_input_trx()?;
        }

        if !implicit {
            let keys = trx.recover_keys(&self.chain_id)?;
            let mut checker = AuthorizationChecker::new(&self.token_db, keys);
            for action in &trx.trx.trx.actions {
                if !checker.satisfied(action) {
                    return Err(ChainError::TxMissingSigs(format!(
                        "{} action in domain {} with key {} failed authorization",
                        action.name, action.domain, action.key
                    )));
                }
            }
        }

        context.exec()?;
        let finalized = context.finalize();

        db_session.squash();
        token_session.squash();
        Ok(finalized)
    }

    /// Computes the action and transaction digest-tree roots over everything pushed so
    /// far, assigns the block id, and records it in the block summary ring.
    pub fn finalize_block(&mut self) -> Result<(), ChainError> {
        let pending = self.pending.as_mut().ok_or(ChainError::NoPendingBlock)?;

        let action_digests = pending.actions.iter().map(|a| a.digest()).collect();
        pending.block_state.header_state.header.action_mroot = merkle(action_digests);

        let trx_digests =
            pending.block_state.block.transactions.iter().map(|t| t.digest()).collect();
        pending.block_state.header_state.header.transaction_mroot = merkle(trx_digests);

        let id = pending.block_state.header_state.header.id();
        pending.block_state.header_state.id = id;

        self.state_db
            .set_block_summary(id.block_num().summary_slot(), &BlockSummaryObject { block_id: id });
        Ok(())
    }

    /// Requests a signature over the pending block's signing digest and installs it,
    /// re-verifying it against the scheduled producer key. A callback failure
    /// propagates unchanged.
    pub fn sign_block(
        &mut self,
        signer: &dyn Fn(&CryptoHash) -> Result<SignatureBytes, ChainError>,
    ) -> Result<(), ChainError> {
        self.sign_block_with(signer, false)
    }

    fn sign_block_with(
        &mut self,
        signer: &dyn Fn(&CryptoHash) -> Result<SignatureBytes, ChainError>,
        trust: bool,
    ) -> Result<(), ChainError> {
        let pending = self.pending.as_mut().ok_or(ChainError::NoPendingBlock)?;

        let digest = pending.block_state.header_state.sig_digest();
        let signature = signer(&digest)?;
        if !trust {
            if let Err(err) = pending.block_state.header_state.verify_producer_signature(&signature)
            {
                log::error!(
                    "signature over block {} failed verification: {}",
                    pending.block_state.block_num,
                    err
                );
                return Err(err);
            }
        }

        pending.block_state.block.header = pending.block_state.header_state.header.clone();
        pending.block_state.block.producer_signature = signature;
        Ok(())
    }

    /// Commits the pending block: inserts it into the fork database (local production
    /// path), advances the applied head, emits the block signals, and seals both store
    /// sessions. Irreversibility promotion runs as part of the fork database insertion.
    pub fn commit_block(&mut self) -> Result<(), ChainError> {
        self.commit_block_impl(true)
    }

    fn commit_block_impl(&mut self, add_to_fork_db: bool) -> Result<(), ChainError> {
        let pending = self.pending.take().ok_or(ChainError::NoPendingBlock)?;

        if add_to_fork_db {
            pending.block_state.validated.set(true);

            let PendingState { db_session, token_session, block_state, .. } = pending;
            let state = Rc::new(block_state);
            let added = self
                .fork_db
                .add_block_state(state)
                .expect("pending block could not be inserted into the fork database");
            self.signals.emit_accepted_block_header(&added);

            let new_head = self.fork_db.head().expect("fork database has a head after insertion");
            assert!(
                Rc::ptr_eq(&added, &new_head),
                "committed block did not become the new head in fork database"
            );
            self.head = new_head;

            self.signals.emit_accepted_block(&added);
            db_session.push();
            token_session.accept();
        } else {
            let PendingState { db_session, token_session, block_state, .. } = pending;
            self.signals.emit_accepted_block(&Rc::new(block_state));
            db_session.push();
            token_session.accept();
        }
        Ok(())
    }

    /// Discards the pending block, returning every transaction it had included to the
    /// unapplied map. Both store sessions unwind as the pending state drops.
    pub fn abort_block(&mut self) {
        if let Some(pending) = self.pending.take() {
            for trx in &pending.block_state.trxs {
                self.unapplied_transactions.insert(trx.signed_id, trx.clone());
            }
        }
    }

    /* ↓↓↓ Received blocks ↓↓↓ */

    /// Applies a received block by replaying it through the assembly pipeline: the
    /// canned signer returns the received producer signature, so any divergence between
    /// this node's execution and the producer's surfaces as a signature mismatch. Any
    /// failure aborts the in-flight block and propagates.
    fn apply_block(&mut self, block: &SignedBlock, trust: bool) -> Result<(), ChainError> {
        match self.apply_block_inner(block, trust) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::error!("failed to apply block {}: {}", block.header.block_num(), err);
                self.abort_block();
                Err(err)
            }
        }
    }

    fn apply_block_inner(&mut self, block: &SignedBlock, trust: bool) -> Result<(), ChainError> {
        self.start_block(block.header.timestamp, block.header.confirmed)?;
        self.adopt_new_producers_from(&block.header)?;

        let deadline = Instant::now() + REPLAY_DEADLINE;
        for receipt in &block.transactions {
            let metadata = TransactionMetadata::new(receipt.trx.clone());
            let trace = self.push_transaction_with(&metadata, deadline, false)?;
            if let Some(except) = &trace.except {
                return Err(except.clone());
            }
        }

        self.finalize_block()?;
        let signature = block.producer_signature;
        self.sign_block_with(&move |_digest: &CryptoHash| Ok(signature), trust)?;
        self.commit_block_impl(false)?;
        Ok(())
    }

    /// Brings the pending block's schedule transition in line with a received header.
    /// A proposed schedule reaches other nodes only through the `new_producers` header
    /// field, so a replica installs it from there; a node that promoted its own
    /// proposal in `start_block` instead checks that the header agrees.
    fn adopt_new_producers_from(&mut self, header: &BlockHeader) -> Result<(), ChainError> {
        let pending = self.pending.as_mut().ok_or(ChainError::NoPendingBlock)?;
        let local = pending.block_state.header_state.header.new_producers.clone();
        match (&header.new_producers, local) {
            (Some(from_header), Some(local)) => {
                if *from_header != local {
                    return Err(ChainError::BlockValidation(
                        "block's new producer schedule does not match the locally promoted proposal"
                            .to_string(),
                    ));
                }
                Ok(())
            }
            (Some(from_header), None) => {
                pending.block_state.header_state.set_new_producers(from_header.clone())
            }
            (None, Some(_)) => Err(ChainError::BlockValidation(
                "block does not carry the locally promoted pending schedule".to_string(),
            )),
            (None, None) => Ok(()),
        }
    }

    /// Integrates an externally received block: links it into the fork database, emits
    /// the header-accepted signal, and switches forks if the head moved.
    pub fn push_block(&mut self, block: SignedBlock, trust: bool) -> Result<(), ChainError> {
        if self.pending.is_some() {
            return Err(ChainError::Consistency(
                "it is not valid to push a block when there is a pending block".to_string(),
            ));
        }

        let new_header_state = self.fork_db.add(block, trust)?;
        self.signals.emit_accepted_block_header(&new_header_state);
        self.maybe_switch_forks(trust)
    }

    /// Integrates a producer confirmation, which may advance BFT irreversibility and
    /// with it the fork database head.
    pub fn push_confirmation(&mut self, confirmation: &HeaderConfirmation) -> Result<(), ChainError> {
        if self.pending.is_some() {
            return Err(ChainError::Consistency(
                "it is not valid to push a confirmation when there is a pending block".to_string(),
            ));
        }

        self.fork_db.add_confirmation(confirmation)?;
        self.signals.emit_accepted_confirmation(confirmation);
        self.maybe_switch_forks(false)
    }

    /// Brings the applied chain in line with the fork database's selected head.
    ///
    /// Fast path: the new head extends the applied head and is simply applied. Reorg
    /// path: the applied branch is unwound to the common ancestor and the winning
    /// branch replayed; if any of its blocks fails, the remainder of the branch is
    /// marked invalid, the applied prefix popped, the previous branch restored with
    /// `trust = true`, and the original failure re-raised.
    fn maybe_switch_forks(&mut self, trust: bool) -> Result<(), ChainError> {
        let new_head = self.fork_db.head().expect("fork database always has a head");

        if new_head.header.previous == self.head.id {
            let block = new_head.block.clone();
            match self.apply_block(&block, trust) {
                Ok(()) => {
                    self.fork_db.mark_in_current_chain(&new_head, true);
                    self.fork_db.set_validity(&new_head, true);
                    self.head = new_head;
                    Ok(())
                }
                Err(err) => {
                    // Removing the block from the fork database also removes it from
                    // head candidacy, so there is no need to unmark it.
                    self.fork_db.set_validity(&new_head, false);
                    Err(err)
                }
            }
        } else if new_head.id != self.head.id {
            log::info!(
                "switching forks from {} (block number {}) to {} (block number {})",
                self.head.id,
                self.head.block_num,
                new_head.id,
                new_head.block_num
            );

            let (new_branch, old_branch) =
                self.fork_db.fetch_branch_from(&new_head.id, &self.head.id)?;

            for state in &old_branch {
                self.fork_db.mark_in_current_chain(state, false);
                self.pop_block()
                    .expect("loss of sync between fork database and state database during fork switch");
            }
            let lca_id = match old_branch.last() {
                Some(oldest) => oldest.header.previous,
                None => self.head.id,
            };
            assert!(
                self.head.id == lca_id,
                "loss of sync between fork database and state database during fork switch"
            );

            let mut applied: Vec<Rc<BlockState>> = Vec::new();
            let mut failure: Option<(usize, ChainError)> = None;
            for (index, state) in new_branch.iter().enumerate().rev() {
                let block = state.block.clone();
                match self.apply_block(&block, false) {
                    Ok(()) => {
                        self.head = state.clone();
                        self.fork_db.mark_in_current_chain(state, true);
                        self.fork_db.set_validity(state, true);
                        applied.push(state.clone());
                    }
                    Err(err) => {
                        failure = Some((index, err));
                        break;
                    }
                }
            }

            if let Some((failed_index, except)) = failure {
                log::error!("exception thrown while switching forks: {}", except);

                // The failing block and everything built on it can never be valid.
                for state in &new_branch[0..=failed_index] {
                    self.fork_db.set_validity(state, false);
                }

                // Pop the successfully applied prefix of the bad branch, newest first.
                for state in applied.iter().rev() {
                    self.fork_db.mark_in_current_chain(state, false);
                    self.pop_block().expect(
                        "loss of sync between fork database and state database during fork switch reversal",
                    );
                }
                assert!(
                    self.head.id == lca_id,
                    "loss of sync between fork database and state database during fork switch reversal"
                );

                // Restore the previous chain; these blocks were validated before.
                for state in old_branch.iter().rev() {
                    let block = state.block.clone();
                    self.apply_block(&block, true)
                        .expect("previously validated block failed to re-apply during fork switch reversal");
                    self.head = state.clone();
                    self.fork_db.mark_in_current_chain(state, true);
                    self.fork_db.set_validity(state, true);
                }

                return Err(except);
            }

            log::info!("successfully switched fork to new head {}", new_head.id);
            Ok(())
        } else {
            Ok(())
        }
    }

    /// Unwinds the applied head block: its transactions return to the unapplied map,
    /// the state database undoes one session, and the token database rolls back to its
    /// latest savepoint.
    pub fn pop_block(&mut self) -> Result<(), ChainError> {
        let prev = self.fork_db.get_block(&self.head.header.previous).ok_or_else(|| {
            ChainError::Consistency("attempt to pop beyond last irreversible block".to_string())
        })?;

        for trx in &self.head.trxs {
            self.unapplied_transactions.insert(trx.signed_id, trx.clone());
        }
        self.head = prev;
        self.state_db.undo();
        self.token_db.rollback_to_latest_savepoint();
        Ok(())
    }

    /* ↓↓↓ Producer schedule ↓↓↓ */

    /// Records a proposed producer schedule in the global property object. Returns
    /// `false` without effect if a proposal from an earlier block is still waiting, or
    /// if the proposal would not change the schedule next in line.
    pub fn set_proposed_producers(
        &mut self,
        producers: Vec<ProducerKey>,
    ) -> Result<bool, ChainError> {
        let pending = self.pending.as_ref().ok_or(ChainError::NoPendingBlock)?;
        let mut gpo = self.state_db.global_property()?;
        let cur_block_num = self.head.block_num.next();

        if producers.is_empty() {
            return Ok(false);
        }
        if let Some(proposed_num) = gpo.proposed_schedule_block_num {
            if proposed_num != cur_block_num {
                // A proposal set in a previous block is still waiting to become pending.
                return Ok(false);
            }
            if let Some(proposed) = &gpo.proposed_schedule {
                if proposed.producers == producers {
                    return Ok(false);
                }
            }
        }

        let next_in_line = if pending.block_state.pending_schedule.producers.is_empty() {
            &pending.block_state.active_schedule
        } else {
            &pending.block_state.pending_schedule
        };
        if next_in_line.producers == producers {
            return Ok(false);
        }

        let schedule = ProducerSchedule { version: next_in_line.version + 1, producers };
        gpo.proposed_schedule_block_num = Some(cur_block_num);
        gpo.proposed_schedule = Some(schedule);
        self.state_db.set_global_property(&gpo);
        Ok(true)
    }

    pub fn active_producers(&self) -> ProducerSchedule {
        match &self.pending {
            Some(pending) => pending.block_state.active_schedule.clone(),
            None => self.head.active_schedule.clone(),
        }
    }

    pub fn pending_producers(&self) -> ProducerSchedule {
        match &self.pending {
            Some(pending) => pending.block_state.pending_schedule.clone(),
            None => self.head.pending_schedule.clone(),
        }
    }

    pub fn proposed_producers(&self) -> Result<Option<ProducerSchedule>, ChainError> {
        Ok(self.state_db.global_property()?.proposed_schedule)
    }

    /* ↓↓↓ Validation helpers ↓↓↓ */

    /// Asserts that a transaction's expiration lies within
    /// `[pending_block_time, pending_block_time + max_transaction_lifetime]`.
    pub fn validate_expiration(&self, trx: &Transaction) -> Result<(), ChainError> {
        let now = self.pending_block_time()?;
        let configuration = self.state_db.global_property()?.configuration;

        if trx.expiration < now {
            return Err(ChainError::ExpiredTx(format!(
                "expiration is {} and pending block time is {}",
                trx.expiration, now
            )));
        }
        let latest = now.plus_seconds(configuration.max_transaction_lifetime as u64);
        if trx.expiration > latest {
            return Err(ChainError::TxExpTooFar(format!(
                "expiration is {} but the maximum transaction lifetime ends at {}",
                trx.expiration, latest
            )));
        }
        Ok(())
    }

    /// Asserts that a transaction's TaPoS reference matches the block summary ring, so
    /// the transaction is bound to this fork.
    pub fn validate_tapos(&self, trx: &Transaction) -> Result<(), ChainError> {
        let summary = self.state_db.block_summary(trx.ref_block_num)?;
        if !trx.verify_reference_block(&summary.block_id) {
            return Err(ChainError::InvalidRefBlock(
                "transaction reference block does not match; is it from a different fork?"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Runs the authorization checker over every action of `trx` and returns the subset
    /// of `candidate_keys` actually needed.
    pub fn get_required_keys(
        &self,
        trx: &Transaction,
        candidate_keys: &BTreeSet<PublicKey>,
    ) -> Result<BTreeSet<PublicKey>, ChainError> {
        let mut checker = AuthorizationChecker::new(&self.token_db, candidate_keys);
        for action in &trx.actions {
            if !checker.satisfied(action) {
                return Err(ChainError::TxMissingSigs(format!(
                    "{} action in domain {} with key {} failed authorization",
                    action.name, action.domain, action.key
                )));
            }
        }
        Ok(checker.used_keys())
    }

    /* ↓↓↓ Queries ↓↓↓ */

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn head_block_num(&self) -> BlockNum {
        self.head.block_num
    }

    pub fn head_block_id(&self) -> BlockId {
        self.head.id
    }

    pub fn head_block_time(&self) -> Timestamp {
        self.head.header.timestamp
    }

    pub fn head_block_producer(&self) -> Name {
        self.head.header.producer.clone()
    }

    pub fn head_block_state(&self) -> Rc<BlockState> {
        self.head.clone()
    }

    pub fn pending_block_state(&self) -> Option<&BlockState> {
        self.pending.as_ref().map(|pending| &pending.block_state)
    }

    pub fn pending_block_time(&self) -> Result<Timestamp, ChainError> {
        self.pending
            .as_ref()
            .map(|pending| pending.block_state.header_state.header.timestamp)
            .ok_or(ChainError::NoPendingBlock)
    }

    pub fn last_irreversible_block_num(&self) -> BlockNum {
        self.head.last_irreversible()
    }

    /// The id of the last irreversible block, served from the block summary ring when
    /// its slot still holds it, falling back to the fork database and block log.
    pub fn last_irreversible_block_id(&self) -> Result<BlockId, ChainError> {
        let lib_num = self.last_irreversible_block_num();
        let summary = self.state_db.block_summary(lib_num.summary_slot())?;
        if summary.block_id.block_num() == lib_num {
            return Ok(summary.block_id);
        }
        self.get_block_id_for_num(lib_num)
    }

    pub fn fetch_block_by_id(&self, id: &BlockId) -> Result<Option<SignedBlock>, ChainError> {
        if let Some(state) = self.fork_db.get_block(id) {
            return Ok(Some(state.block.clone()));
        }
        let candidate = self.fetch_block_by_number(id.block_num())?;
        Ok(candidate.filter(|block| block.id() == *id))
    }

    pub fn fetch_block_by_number(
        &self,
        block_num: BlockNum,
    ) -> Result<Option<SignedBlock>, ChainError> {
        if let Some(state) = self.fork_db.get_block_in_current_chain_by_num(block_num) {
            return Ok(Some(state.block.clone()));
        }
        self.blog.borrow().read_block_by_num(block_num)
    }

    pub fn get_block_id_for_num(&self, block_num: BlockNum) -> Result<BlockId, ChainError> {
        if let Some(state) = self.fork_db.get_block_in_current_chain_by_num(block_num) {
            return Ok(state.id);
        }
        let block = self.blog.borrow().read_block_by_num(block_num)?;
        block
            .map(|b| b.id())
            .ok_or_else(|| ChainError::UnknownBlock(format!("could not find block {}", block_num)))
    }

    pub fn get_unapplied_transactions(&self) -> Vec<Rc<TransactionMetadata>> {
        self.unapplied_transactions.values().cloned().collect()
    }

    pub fn is_known_unapplied_transaction(&self, signed_id: &CryptoHash) -> bool {
        self.unapplied_transactions.contains_key(signed_id)
    }

    pub fn drop_unapplied_transaction(&mut self, trx: &Rc<TransactionMetadata>) {
        self.unapplied_transactions.shift_remove(&trx.signed_id);
    }

    /// Reserved hook for CPU/network metering; no enforcement obligation.
    pub fn should_enforce_runtime_limits(&self) -> bool {
        false
    }

    /* ↓↓↓ Extension points ↓↓↓ */

    /// Installs or replaces the apply handler for an action name.
    pub fn set_apply_handler(&mut self, name: ActionName, handler: ApplyHandler) {
        self.apply_handlers.set_apply_handler(name, handler);
    }

    pub fn find_apply_handler(&self, name: ActionName) -> Option<ApplyHandler> {
        self.apply_handlers.find_apply_handler(name)
    }

    /// Read access to the token database, for query surfaces layered on top.
    pub fn token_db(&self) -> &TokenDb {
        &self.token_db
    }

    /// Read access to the state database.
    pub fn state_db(&self) -> &StateDb {
        &self.state_db
    }

    /* ↓↓↓ Signal registration ↓↓↓ */

    pub fn on_accepted_transaction(&self, handler: HandlerPtr<AcceptedTransactionEvent>) {
        self.signals.on_accepted_transaction(handler);
    }

    pub fn on_applied_transaction(&self, handler: HandlerPtr<AppliedTransactionEvent>) {
        self.signals.on_applied_transaction(handler);
    }

    pub fn on_accepted_block_header(&self, handler: HandlerPtr<AcceptedBlockHeaderEvent>) {
        self.signals.on_accepted_block_header(handler);
    }

    pub fn on_accepted_block(&self, handler: HandlerPtr<AcceptedBlockEvent>) {
        self.signals.on_accepted_block(handler);
    }

    pub fn on_irreversible_block(&self, handler: HandlerPtr<IrreversibleBlockEvent>) {
        self.signals.on_irreversible_block(handler);
    }

    pub fn on_accepted_confirmation(&self, handler: HandlerPtr<AcceptedConfirmationEvent>) {
        self.signals.on_accepted_confirmation(handler);
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.abort_block();
        if let Err(err) = self.fork_db.close() {
            log::error!("failed to persist fork database: {}", err);
        }
        if let Err(err) = self.state_db.flush() {
            log::error!("failed to flush state database: {}", err);
        }
        if let Err(err) = self.token_db.flush() {
            log::error!("failed to flush token database: {}", err);
        }
    }
}

/// Promotion of a block past irreversibility: append it to the block log (unless
/// replaying from that very log), emit the signal, commit the state database up to it,
/// and pop the token database savepoints at or below it.
///
/// Kept free of the [`Controller`] type on purpose: the fork database invokes this
/// through a plain function value over the shared store handles, never through a typed
/// back-pointer into the controller.
fn on_irreversible(
    state_db: &StateDb,
    token_db: &TokenDb,
    blog: &Rc<RefCell<BlockLog>>,
    signals: &SignalHub,
    replaying: bool,
    block: &Rc<BlockState>,
) {
    {
        let mut blog = blog.borrow_mut();
        let log_head_num = blog
            .head_block_num()
            .expect("block log holds at least the genesis block once initialized");
        let log_head_id = blog.head_id().expect("block log head id is cached");

        let block_num = block.block_num;
        if block_num == log_head_num.next() {
            assert!(
                block.header.previous == log_head_id,
                "irreversible block does not link to block log head"
            );
            if !replaying {
                blog.append(&block.block);
            }
        } else if block_num > log_head_num {
            log::warn!(
                "skipped blocks; irreversible block {} is more than one past block log head {}",
                block_num,
                log_head_num
            );
        } else if block_num == log_head_num {
            assert!(
                block.id == log_head_id,
                "irreversible block at the block log head height has a mismatched id"
            );
        }
    }

    signals.emit_irreversible_block(block);
    state_db.commit(block.block_num.int() as u64);
    token_db.pop_savepoints(block.block_num.int() as u64);
}
