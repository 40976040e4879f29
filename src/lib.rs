/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A delegated-proof-of-stake block-production and chain-advancement controller with a
//! domain/token state model.
//!
//! The [`controller::Controller`] is the process's chain state: it assembles pending
//! blocks out of authorized transactions, integrates blocks received from peers through
//! the [`fork_database`], and coordinates the dual-store transaction boundary between
//! the undoable [`state_db`], the savepoint-based [`token_db`], and the append-only
//! [`block_log`], promoting blocks into the log as DPoS/BFT irreversibility passes
//! them.
//!
//! Transaction pool policy, networking, RPC, and wallets live outside this crate; the
//! narrow interfaces they plug into are the controller's public operations and the
//! [`events`] signals.

pub mod authorization;

pub mod block_log;

pub mod config;

pub mod contracts;

pub mod controller;

pub mod errors;

pub mod events;

pub mod fork_database;

pub mod logging;

pub mod state_db;

pub mod token_db;

pub mod transaction_context;

pub mod types;

// Re-exports of the handful of types nearly every user touches.
pub use config::{Config, GenesisState};
pub use controller::Controller;
pub use errors::ChainError;
