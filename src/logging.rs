/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The crate logs through the [log](https://docs.rs/log/latest/log/) facade; set up any
//! logging implementation to get the messages printed. The default handlers defined here
//! are installed when the controller's configuration enables event logging.
//!
//! ## Log message format
//!
//! Event log messages are CSVs with at least two values. The first two are always:
//! 1. The name of the [event](crate::events) in PascalCase.
//! 2. The time the event was emitted (seconds since the Unix epoch).
//!
//! The rest differ per event kind. Hashes and keys are printed as the first seven
//! characters of their Base64 encoding, for example:
//!
//! ```text
//! AcceptedBlock, 1701329264, fNGCJyk, 42
//! ```

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const ACCEPTED_TRANSACTION: &str = "AcceptedTransaction";
pub const APPLIED_TRANSACTION: &str = "AppliedTransaction";
pub const ACCEPTED_BLOCK_HEADER: &str = "AcceptedBlockHeader";
pub const ACCEPTED_BLOCK: &str = "AcceptedBlock";
pub const IRREVERSIBLE_BLOCK: &str = "IrreversibleBlock";
pub const ACCEPTED_CONFIRMATION: &str = "AcceptedConfirmation";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger: Sized {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> HandlerPtr<Self>;
}

impl Logger for AcceptedTransactionEvent {
    fn get_logger() -> HandlerPtr<Self> {
        Box::new(|event: &AcceptedTransactionEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ACCEPTED_TRANSACTION,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.trx.id.bytes()),
                event.trx.trx.trx.actions.len()
            )
        })
    }
}

impl Logger for AppliedTransactionEvent {
    fn get_logger() -> HandlerPtr<Self> {
        Box::new(|event: &AppliedTransactionEvent| {
            log::info!(
                "{}, {}, {}, {:?}, {}",
                APPLIED_TRANSACTION,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.trace.id.bytes()),
                event.trace.status,
                event
                    .trace
                    .except
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "ok".to_string())
            )
        })
    }
}

impl Logger for AcceptedBlockHeaderEvent {
    fn get_logger() -> HandlerPtr<Self> {
        Box::new(|event: &AcceptedBlockHeaderEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ACCEPTED_BLOCK_HEADER,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.id.bytes()),
                event.block.block_num
            )
        })
    }
}

impl Logger for AcceptedBlockEvent {
    fn get_logger() -> HandlerPtr<Self> {
        Box::new(|event: &AcceptedBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ACCEPTED_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.id.bytes()),
                event.block.block_num
            )
        })
    }
}

impl Logger for IrreversibleBlockEvent {
    fn get_logger() -> HandlerPtr<Self> {
        Box::new(|event: &IrreversibleBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                IRREVERSIBLE_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.id.bytes()),
                event.block.block_num
            )
        })
    }
}

impl Logger for AcceptedConfirmationEvent {
    fn get_logger() -> HandlerPtr<Self> {
        Box::new(|event: &AcceptedConfirmationEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ACCEPTED_CONFIRMATION,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.confirmation.block_id.bytes()),
                event.confirmation.producer
            )
        })
    }
}

/// A more readable representation of a byte sequence: the first 7 characters of its
/// Base64 encoding.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
