/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The apply-handler registry and the surface the controller exposes to handlers.
//!
//! An apply handler is a plain function registered under a packed action name. Handlers
//! run inside the pending block's sessions: every store write they make goes through the
//! open state-DB session and token-DB savepoint, so a failing transaction unwinds
//! without a trace. The registry is owned by the controller; there are no globals.

pub mod token;

use borsh::BorshDeserialize;
use indexmap::IndexMap;

use crate::errors::ChainError;
use crate::state_db::StateDb;
use crate::token_db::TokenDb;
use crate::types::basic::{ActionName, CryptoHash};
use crate::types::transaction::Action;

pub const NEWDOMAIN: ActionName = ActionName::constant("newdomain");
pub const ISSUETOKEN: ActionName = ActionName::constant("issuetoken");
pub const TRANSFER: ActionName = ActionName::constant("transfer");
pub const NEWGROUP: ActionName = ActionName::constant("newgroup");
pub const UPDATEGROUP: ActionName = ActionName::constant("updategroup");
pub const UPDATEDOMAIN: ActionName = ActionName::constant("updatedomain");
pub const NEWACCOUNT: ActionName = ActionName::constant("newaccount");
pub const UPDATEOWNER: ActionName = ActionName::constant("updateowner");
pub const TRANSFEREVT: ActionName = ActionName::constant("transferevt");

/// Decodes a borsh-encoded action payload.
pub fn decode<T: BorshDeserialize>(data: &[u8]) -> Result<T, ChainError> {
    T::try_from_slice(data)
        .map_err(|err| ChainError::InvalidActionData(format!("payload does not decode: {}", err)))
}

/// What an apply handler gets to see and touch: both stores (writes land in the pending
/// sessions), the action being applied, and the id of its enclosing transaction.
pub struct ApplyContext<'a> {
    pub state_db: &'a StateDb,
    pub token_db: &'a TokenDb,
    pub action: &'a Action,
    pub trx_id: CryptoHash,
}

impl ApplyContext<'_> {
    /// Decodes this action's payload.
    pub fn data<T: BorshDeserialize>(&self) -> Result<T, ChainError> {
        decode(&self.action.data)
    }
}

/// An apply handler: performs one action's effect on the stores, raising on
/// deterministic failure.
pub type ApplyHandler = fn(&mut ApplyContext) -> Result<(), ChainError>;

/// The controller-owned map from packed action name to apply handler.
pub struct ApplyHandlerRegistry {
    handlers: IndexMap<ActionName, ApplyHandler>,
}

impl ApplyHandlerRegistry {
    pub fn new() -> ApplyHandlerRegistry {
        ApplyHandlerRegistry { handlers: IndexMap::new() }
    }

    /// A registry with the domain-management and token-lifecycle handlers installed.
    pub fn token_lifecycle() -> ApplyHandlerRegistry {
        let mut registry = ApplyHandlerRegistry::new();
        registry.set_apply_handler(NEWDOMAIN, token::apply_newdomain);
        registry.set_apply_handler(ISSUETOKEN, token::apply_issuetoken);
        registry.set_apply_handler(TRANSFER, token::apply_transfer);
        registry.set_apply_handler(NEWGROUP, token::apply_newgroup);
        registry.set_apply_handler(UPDATEGROUP, token::apply_updategroup);
        registry.set_apply_handler(UPDATEDOMAIN, token::apply_updatedomain);
        registry.set_apply_handler(NEWACCOUNT, token::apply_newaccount);
        registry.set_apply_handler(UPDATEOWNER, token::apply_updateowner);
        registry.set_apply_handler(TRANSFEREVT, token::apply_transferevt);
        registry
    }

    pub fn set_apply_handler(&mut self, name: ActionName, handler: ApplyHandler) {
        self.handlers.insert(name, handler);
    }

    pub fn find_apply_handler(&self, name: ActionName) -> Option<ApplyHandler> {
        self.handlers.get(&name).copied()
    }
}

impl Default for ApplyHandlerRegistry {
    fn default() -> ApplyHandlerRegistry {
        ApplyHandlerRegistry::new()
    }
}
