/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications emitted when significant things happen in the controller.
//!
//! Six signals exist: `accepted_transaction`, `applied_transaction`,
//! `accepted_block_header`, `accepted_block`, `irreversible_block`, and
//! `accepted_confirmation`. Each carries an inner event struct with a timestamp taken
//! when the occurrence completed.
//!
//! Signals fire synchronously, in a fixed order relative to state transitions, and
//! handlers must not mutate controller state. A panicking handler is caught and logged,
//! never propagated: a faulty observer must never cause this node to fork.
//!
//! Default logging handlers for every event type are defined in
//! [`logging`](crate::logging) and installed when the controller's configuration enables
//! them.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::SystemTime;

use crate::types::block::{BlockState, HeaderConfirmation};
use crate::types::transaction::{TransactionMetadata, TransactionTrace};

/// Pointer to a handler closure, parametrised by the event type.
pub type HandlerPtr<T> = Box<dyn Fn(&T)>;

/// A transaction was accepted into a pending block for the first time. Emitted at most
/// once per transaction.
pub struct AcceptedTransactionEvent {
    pub timestamp: SystemTime,
    pub trx: Rc<TransactionMetadata>,
}

/// A transaction was executed into the pending block (possibly again, after a fork
/// switch). Includes the full trace.
pub struct AppliedTransactionEvent {
    pub timestamp: SystemTime,
    pub trace: Rc<TransactionTrace>,
}

/// A block header was linked into the fork database and passed header validation.
pub struct AcceptedBlockHeaderEvent {
    pub timestamp: SystemTime,
    pub block: Rc<BlockState>,
}

/// A block was fully applied and committed to the controller's current chain.
pub struct AcceptedBlockEvent {
    pub timestamp: SystemTime,
    pub block: Rc<BlockState>,
}

/// A block passed irreversibility: it has been promoted to the block log and both
/// stores have released its undo state.
pub struct IrreversibleBlockEvent {
    pub timestamp: SystemTime,
    pub block: Rc<BlockState>,
}

/// A producer confirmation was accepted.
pub struct AcceptedConfirmationEvent {
    pub timestamp: SystemTime,
    pub confirmation: HeaderConfirmation,
}

/// The controller's signal registry: handler lists per event type, shared with the
/// fork database's irreversibility callback.
pub struct SignalHub {
    accepted_transaction: RefCell<Vec<HandlerPtr<AcceptedTransactionEvent>>>,
    applied_transaction: RefCell<Vec<HandlerPtr<AppliedTransactionEvent>>>,
    accepted_block_header: RefCell<Vec<HandlerPtr<AcceptedBlockHeaderEvent>>>,
    accepted_block: RefCell<Vec<HandlerPtr<AcceptedBlockEvent>>>,
    irreversible_block: RefCell<Vec<HandlerPtr<IrreversibleBlockEvent>>>,
    accepted_confirmation: RefCell<Vec<HandlerPtr<AcceptedConfirmationEvent>>>,
}

impl SignalHub {
    /// An empty hub, optionally pre-loaded with the default logging handlers.
    pub fn new(log_events: bool) -> SignalHub {
        use crate::logging::Logger;

        let hub = SignalHub {
            accepted_transaction: RefCell::new(Vec::new()),
            applied_transaction: RefCell::new(Vec::new()),
            accepted_block_header: RefCell::new(Vec::new()),
            accepted_block: RefCell::new(Vec::new()),
            irreversible_block: RefCell::new(Vec::new()),
            accepted_confirmation: RefCell::new(Vec::new()),
        };
        if log_events {
            hub.accepted_transaction.borrow_mut().push(AcceptedTransactionEvent::get_logger());
            hub.applied_transaction.borrow_mut().push(AppliedTransactionEvent::get_logger());
            hub.accepted_block_header.borrow_mut().push(AcceptedBlockHeaderEvent::get_logger());
            hub.accepted_block.borrow_mut().push(AcceptedBlockEvent::get_logger());
            hub.irreversible_block.borrow_mut().push(IrreversibleBlockEvent::get_logger());
            hub.accepted_confirmation.borrow_mut().push(AcceptedConfirmationEvent::get_logger());
        }
        hub
    }

    /* ↓↓↓ Handler registration ↓↓↓ */

    pub fn on_accepted_transaction(&self, handler: HandlerPtr<AcceptedTransactionEvent>) {
        self.accepted_transaction.borrow_mut().push(handler);
    }

    pub fn on_applied_transaction(&self, handler: HandlerPtr<AppliedTransactionEvent>) {
        self.applied_transaction.borrow_mut().push(handler);
    }

    pub fn on_accepted_block_header(&self, handler: HandlerPtr<AcceptedBlockHeaderEvent>) {
        self.accepted_block_header.borrow_mut().push(handler);
    }

    pub fn on_accepted_block(&self, handler: HandlerPtr<AcceptedBlockEvent>) {
        self.accepted_block.borrow_mut().push(handler);
    }

    pub fn on_irreversible_block(&self, handler: HandlerPtr<IrreversibleBlockEvent>) {
        self.irreversible_block.borrow_mut().push(handler);
    }

    pub fn on_accepted_confirmation(&self, handler: HandlerPtr<AcceptedConfirmationEvent>) {
        self.accepted_confirmation.borrow_mut().push(handler);
    }

    /* ↓↓↓ Emission ↓↓↓ */

    pub(crate) fn emit_accepted_transaction(&self, trx: &Rc<TransactionMetadata>) {
        let event = AcceptedTransactionEvent { timestamp: SystemTime::now(), trx: trx.clone() };
        Self::emit(&self.accepted_transaction.borrow(), &event);
    }

    pub(crate) fn emit_applied_transaction(&self, trace: &Rc<TransactionTrace>) {
        let event = AppliedTransactionEvent { timestamp: SystemTime::now(), trace: trace.clone() };
        Self::emit(&self.applied_transaction.borrow(), &event);
    }

    pub(crate) fn emit_accepted_block_header(&self, block: &Rc<BlockState>) {
        let event = AcceptedBlockHeaderEvent { timestamp: SystemTime::now(), block: block.clone() };
        Self::emit(&self.accepted_block_header.borrow(), &event);
    }

    pub(crate) fn emit_accepted_block(&self, block: &Rc<BlockState>) {
        let event = AcceptedBlockEvent { timestamp: SystemTime::now(), block: block.clone() };
        Self::emit(&self.accepted_block.borrow(), &event);
    }

    pub(crate) fn emit_irreversible_block(&self, block: &Rc<BlockState>) {
        let event = IrreversibleBlockEvent { timestamp: SystemTime::now(), block: block.clone() };
        Self::emit(&self.irreversible_block.borrow(), &event);
    }

    pub(crate) fn emit_accepted_confirmation(&self, confirmation: &HeaderConfirmation) {
        let event = AcceptedConfirmationEvent {
            timestamp: SystemTime::now(),
            confirmation: confirmation.clone(),
        };
        Self::emit(&self.accepted_confirmation.borrow(), &event);
    }

    /// Observers listening to signals might panic. Unless those panics are caught they
    /// could impact consensus or cause this node to fork, so they are swallowed and
    /// logged here and never bubble out.
    fn emit<T>(handlers: &[HandlerPtr<T>], event: &T) {
        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                log::error!("signal handler threw exception");
            }
        }
    }
}
