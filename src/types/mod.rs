/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Inert data types shared across the components of the chain controller.
//!
//! The types defined in [`basic`] follow the newtype pattern: they are sent around and
//! inspected, but have no active behavior beyond conversions and formatting. [`block`]
//! defines block headers, signed blocks, and the derived header state that drives fork
//! choice. [`transaction`] defines actions, transactions, and the receipt and trace types
//! produced by executing them. [`authority`] defines the permission structures consulted
//! by the authorization checker, and [`merkle`] the digest-tree root used by block
//! finalization.

pub mod authority;

pub mod basic;

pub mod block;

pub mod merkle;

pub mod transaction;
