/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Byte prefixes that locate each registered index inside the state database.
//!
//! Single-object indexes (the global property object) live directly at their one-byte
//! prefix. Keyed indexes store each entry at the prefix followed by the borsh
//! serialization of the key. The transaction dedup index is stored twice: once keyed by
//! id for duplicate detection, and once keyed by big-endian expiration followed by id so
//! that expired entries can be cleared with an ordered scan.

pub const GLOBAL_PROPERTIES: [u8; 1] = [0];

pub const BLOCK_SUMMARY: [u8; 1] = [1];

pub const TRANSACTION_BY_ID: [u8; 1] = [2];

pub const TRANSACTION_BY_EXPIRATION: [u8; 1] = [3];

/// Concatenates a prefix and a serialized key into a full store key.
pub fn combine(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut combined = Vec::with_capacity(prefix.len() + key.len());
    combined.extend_from_slice(prefix);
    combined.extend_from_slice(key);
    combined
}
