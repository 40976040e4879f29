/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Execution of one transaction against the pending sessions.
//!
//! A context moves through three states: initialized (input or implicit), executing,
//! finalized. Input initialization records the transaction in the dedup index (a
//! duplicate id is an objective failure) and counts its signatures for accounting;
//! implicit transactions skip both. [`TransactionContext::exec`] dispatches each action
//! to its registered apply handler and collects an [`ActionReceipt`] per action, in
//! order. The wall-clock deadline is checked cooperatively before each action; exceeding
//! it raises [`ChainError::Deadline`], the one subjective failure.
//!
//! The context does not open store sessions itself; the controller wraps each execution
//! in a nested state-DB session and token-DB savepoint, so a deterministic per-action
//! failure unwinds the whole transaction and the pending block stays well-formed.

use std::time::Instant;

use crate::contracts::{ApplyContext, ApplyHandlerRegistry};
use crate::errors::ChainError;
use crate::state_db::StateDb;
use crate::token_db::TokenDb;
use crate::types::basic::CryptoHash;
use crate::types::transaction::{ActionReceipt, ActionTrace, SignedTransaction};

enum ContextState {
    Constructed,
    Initialized,
    Executed,
}

pub struct TransactionContext<'a> {
    state_db: StateDb,
    token_db: TokenDb,
    handlers: &'a ApplyHandlerRegistry,
    trx: &'a SignedTransaction,
    id: CryptoHash,
    deadline: Instant,
    start: Instant,
    state: ContextState,
    signature_count: u32,
    executed: Vec<ActionReceipt>,
}

impl<'a> TransactionContext<'a> {
    pub fn new(
        state_db: StateDb,
        token_db: TokenDb,
        handlers: &'a ApplyHandlerRegistry,
        trx: &'a SignedTransaction,
        id: CryptoHash,
        deadline: Instant,
    ) -> TransactionContext<'a> {
        TransactionContext {
            state_db,
            token_db,
            handlers,
            trx,
            id,
            deadline,
            start: Instant::now(),
            state: ContextState::Constructed,
            signature_count: 0,
            executed: Vec::new(),
        }
    }

    /// Initializes for an input transaction: records the signature count and registers
    /// the transaction id in the dedup index until its expiration.
    pub fn init_for_input_trx(&mut self) -> Result<(), ChainError> {
        self.signature_count = self.trx.signatures.len() as u32;
        self.state_db.insert_transaction(&self.id, self.trx.trx.expiration)?;
        self.state = ContextState::Initialized;
        Ok(())
    }

    /// Initializes for an implicit transaction: no dedup entry, no signature
    /// accounting.
    pub fn init_for_implicit_trx(&mut self) {
        self.state = ContextState::Initialized;
    }

    /// Dispatches every action to its apply handler, in order. A deterministic handler
    /// failure propagates as the transaction's failure; nothing is partially committed
    /// because the controller unwinds the surrounding sessions.
    pub fn exec(&mut self) -> Result<(), ChainError> {
        assert!(
            matches!(self.state, ContextState::Initialized),
            "transaction context executed before initialization"
        );

        for action in &self.trx.trx.actions {
            self.check_deadline()?;

            let handler = self
                .handlers
                .find_apply_handler(action.name)
                .ok_or(ChainError::UnknownAction(action.name))?;

            let mut apply_ctx = ApplyContext {
                state_db: &self.state_db,
                token_db: &self.token_db,
                action,
                trx_id: self.id,
            };
            handler(&mut apply_ctx)?;

            self.executed.push(ActionReceipt {
                name: action.name,
                domain: action.domain.clone(),
                key: action.key.clone(),
                act_digest: action.digest(),
            });
        }

        self.state = ContextState::Executed;
        Ok(())
    }

    /// Wraps up execution: returns the executed action receipts, the matching traces,
    /// the elapsed wall-clock time, and the recorded signature count. Resource billing
    /// beyond the elapsed time is a reserved hook.
    pub fn finalize(
        self,
    ) -> (Vec<ActionReceipt>, Vec<ActionTrace>, std::time::Duration, u32) {
        assert!(
            matches!(self.state, ContextState::Executed),
            "transaction context finalized before execution"
        );
        let traces =
            self.executed.iter().map(|receipt| ActionTrace { receipt: receipt.clone() }).collect();
        (self.executed, traces, self.start.elapsed(), self.signature_count)
    }

    fn check_deadline(&self) -> Result<(), ChainError> {
        if Instant::now() >= self.deadline {
            return Err(ChainError::Deadline);
        }
        Ok(())
    }
}
