//! Tests of the block assembly pipeline on a single producer: genesis, transaction
//! execution and failure classification, expiration and TaPoS validation, producer
//! schedule proposal and promotion, irreversibility promotion into the block log, and
//! clean-restart and crash recovery.

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use log::LevelFilter;
use tempfile::TempDir;

use common::logging::setup_logger;
use common::*;

use tokenchain::controller::Controller;
use tokenchain::errors::ChainError;
use tokenchain::types::basic::{BlockNum, DomainName, Timestamp};
use tokenchain::types::block::ProducerKey;
use tokenchain::types::basic::Name;

#[test]
fn genesis_and_single_transaction() {
    setup_logger(LevelFilter::Debug);

    let dir = TempDir::new().unwrap();
    let genesis_key = signing_key(0);
    let mut controller = Controller::new(test_config(dir.path(), public_key(&genesis_key))).unwrap();

    assert_eq!(controller.head_block_num(), BlockNum::new(1));

    let accepted_blocks = Rc::new(Cell::new(0usize));
    {
        let accepted_blocks = accepted_blocks.clone();
        controller.on_accepted_block(Box::new(move |_| accepted_blocks.set(accepted_blocks.get() + 1)));
    }

    let trx = sign_transaction(
        &controller,
        transaction_with(vec![newdomain_action("music", public_key(&genesis_key))], slot_timestamp(1)),
        &[&genesis_key],
    );
    produce_block(&mut controller, 1, 0, &genesis_key, &[trx.clone()]).unwrap();

    assert_eq!(controller.head_block_num(), BlockNum::new(2));
    assert_eq!(controller.state_db().revision(), 2);
    // A sole producer finalizes each block as it commits it, so the new block is already
    // in the block log.
    assert_eq!(controller.last_irreversible_block_num(), BlockNum::new(2));
    assert_eq!(
        controller.last_irreversible_block_id().unwrap(),
        controller.head_block_id()
    );
    assert!(controller
        .token_db()
        .read_domain(&DomainName::new("music"), |domain| domain.name.clone())
        .is_ok());
    assert!(!controller.is_known_unapplied_transaction(&trx.signed_id));
    assert_eq!(accepted_blocks.get(), 1);
}

#[test]
fn subjective_failure_retains_the_transaction() {
    let dir = TempDir::new().unwrap();
    let genesis_key = signing_key(0);
    let mut controller = Controller::new(test_config(dir.path(), public_key(&genesis_key))).unwrap();

    controller.start_block(slot_timestamp(1), 0).unwrap();
    let trx = sign_transaction(
        &controller,
        transaction_with(vec![newdomain_action("music", public_key(&genesis_key))], slot_timestamp(1)),
        &[&genesis_key],
    );

    // The deadline is already over when execution starts.
    let trace = controller.push_transaction(&trx, Instant::now()).unwrap();
    assert_eq!(trace.except, Some(ChainError::Deadline));

    // Subjective failure: the transaction stays available for retry.
    assert!(controller.is_known_unapplied_transaction(&trx.signed_id));

    // A failed push leaves the pending block exactly as it was.
    let pending = controller.pending_block_state().unwrap();
    assert!(pending.block.transactions.is_empty());
    assert!(pending.trxs.is_empty());

    // The same transaction still executes on retry with a sane deadline.
    let trace = controller.push_transaction(&trx, deadline()).unwrap();
    assert_eq!(trace.except, None);
    assert!(!controller.is_known_unapplied_transaction(&trx.signed_id));
}

#[test]
fn objective_failure_evicts_the_transaction() {
    let dir = TempDir::new().unwrap();
    let genesis_key = signing_key(0);
    let intruder_key = signing_key(9);
    let mut controller = Controller::new(test_config(dir.path(), public_key(&genesis_key))).unwrap();

    controller.start_block(slot_timestamp(1), 0).unwrap();

    // Validly signed, but by a key that does not satisfy the creator authority.
    let trx = sign_transaction(
        &controller,
        transaction_with(vec![newdomain_action("music", public_key(&genesis_key))], slot_timestamp(1)),
        &[&intruder_key],
    );
    let trace = controller.push_transaction(&trx, deadline()).unwrap();
    assert!(matches!(trace.except, Some(ChainError::TxMissingSigs(_))));
    assert!(!controller.is_known_unapplied_transaction(&trx.signed_id));

    let pending = controller.pending_block_state().unwrap();
    assert!(pending.block.transactions.is_empty());
    assert!(pending.trxs.is_empty());
}

#[test]
fn duplicate_transactions_are_rejected_deterministically() {
    let dir = TempDir::new().unwrap();
    let genesis_key = signing_key(0);
    let mut controller = Controller::new(test_config(dir.path(), public_key(&genesis_key))).unwrap();

    controller.start_block(slot_timestamp(1), 0).unwrap();
    let trx = sign_transaction(
        &controller,
        transaction_with(vec![newdomain_action("music", public_key(&genesis_key))], slot_timestamp(1)),
        &[&genesis_key],
    );

    let first = controller.push_transaction(&trx, deadline()).unwrap();
    assert_eq!(first.except, None);

    let second = controller.push_transaction(&trx, deadline()).unwrap();
    assert_eq!(second.except, Some(ChainError::TxDuplicate(trx.id)));

    // The failed duplicate did not disturb the pending block.
    let pending = controller.pending_block_state().unwrap();
    assert_eq!(pending.block.transactions.len(), 1);
    assert_eq!(pending.trxs.len(), 1);
}

#[test]
fn aborted_blocks_return_transactions_to_the_unapplied_map() {
    let dir = TempDir::new().unwrap();
    let genesis_key = signing_key(0);
    let mut controller = Controller::new(test_config(dir.path(), public_key(&genesis_key))).unwrap();

    controller.start_block(slot_timestamp(1), 0).unwrap();
    let trx = sign_transaction(
        &controller,
        transaction_with(vec![newdomain_action("music", public_key(&genesis_key))], slot_timestamp(1)),
        &[&genesis_key],
    );
    let trace = controller.push_transaction(&trx, deadline()).unwrap();
    assert_eq!(trace.except, None);

    controller.abort_block();
    assert!(controller.is_known_unapplied_transaction(&trx.signed_id));
    assert_eq!(controller.head_block_num(), BlockNum::new(1));
    assert_eq!(controller.state_db().revision(), 1);
    // Aborting also unwound the token database writes.
    assert!(!controller.token_db().exists_domain(&DomainName::new("music")));

    // Including the transaction in the next block removes it from the unapplied map.
    produce_block(&mut controller, 2, 0, &genesis_key, &[trx.clone()]).unwrap();
    assert!(!controller.is_known_unapplied_transaction(&trx.signed_id));
    assert!(controller.token_db().exists_domain(&DomainName::new("music")));
}

#[test]
fn expiration_and_tapos_validation() {
    let dir = TempDir::new().unwrap();
    let genesis_key = signing_key(0);
    let mut controller = Controller::new(test_config(dir.path(), public_key(&genesis_key))).unwrap();

    produce_block(&mut controller, 1, 0, &genesis_key, &[]).unwrap();
    controller.start_block(slot_timestamp(2), 0).unwrap();
    let now = controller.pending_block_time().unwrap();

    let mut trx = transaction_with(vec![], now);
    trx.expiration = Timestamp::from_millis(now.millis() - 1);
    assert!(matches!(controller.validate_expiration(&trx), Err(ChainError::ExpiredTx(_))));

    trx.expiration = now.plus_seconds(2 * 3600);
    assert!(matches!(controller.validate_expiration(&trx), Err(ChainError::TxExpTooFar(_))));

    trx.expiration = now.plus_seconds(60);
    assert_eq!(controller.validate_expiration(&trx), Ok(()));

    // TaPoS: referencing the head block verifies; a corrupted prefix does not.
    let head_id = controller.head_block_id();
    trx.ref_block_num = head_id.block_num().summary_slot();
    trx.ref_block_prefix = head_id.tapos_prefix();
    assert_eq!(controller.validate_tapos(&trx), Ok(()));

    trx.ref_block_prefix = head_id.tapos_prefix().wrapping_add(1);
    assert!(matches!(controller.validate_tapos(&trx), Err(ChainError::InvalidRefBlock(_))));
}

#[test]
fn proposed_producers_promote_through_pending_to_active() {
    let dir = TempDir::new().unwrap();
    let genesis_key = signing_key(0);
    let alice_key = signing_key(1);
    let bob_key = signing_key(2);
    let mut controller = Controller::new(test_config(dir.path(), public_key(&genesis_key))).unwrap();

    let new_producers = vec![
        ProducerKey { producer_name: Name::new("alice"), signing_key: public_key(&alice_key) },
        ProducerKey { producer_name: Name::new("bob"), signing_key: public_key(&bob_key) },
    ];

    // Block 2 proposes the schedule.
    controller.start_block(slot_timestamp(1), 0).unwrap();
    assert!(controller.set_proposed_producers(new_producers.clone()).unwrap());
    // Re-proposing the identical schedule changes nothing.
    assert!(!controller.set_proposed_producers(new_producers.clone()).unwrap());
    seal_block(&mut controller, &genesis_key).unwrap();
    assert!(controller.proposed_producers().unwrap().is_some());

    // Block 3: the proposal's block is irreversible, so it becomes the pending
    // schedule and leaves the global property object.
    controller.start_block(slot_timestamp(2), 0).unwrap();
    assert!(controller.proposed_producers().unwrap().is_none());
    assert_eq!(controller.pending_producers().version, 1);
    assert_eq!(controller.pending_producers().producers.len(), 2);
    assert_eq!(controller.active_producers().version, 0);
    seal_block(&mut controller, &genesis_key).unwrap();

    // Block 4: the pending schedule's block is irreversible, so it becomes active.
    // Slot 3 maps to producer index 1, bob.
    produce_block(&mut controller, 3, 0, &bob_key, &[]).unwrap();
    assert_eq!(controller.active_producers().version, 1);
    assert_eq!(controller.head_block_producer(), Name::new("bob"));

    // With two producers and no confirmations, irreversibility stalls at the last
    // single-producer block and never regresses.
    assert_eq!(controller.last_irreversible_block_num(), BlockNum::new(3));
    produce_block(&mut controller, 4, 0, &alice_key, &[]).unwrap();
    assert_eq!(controller.last_irreversible_block_num(), BlockNum::new(3));
}

#[test]
fn irreversibility_flushes_to_the_block_log() {
    let dir = TempDir::new().unwrap();
    let genesis_key = signing_key(0);
    let mut controller = Controller::new(test_config(dir.path(), public_key(&genesis_key))).unwrap();

    let irreversible = Rc::new(Cell::new(0usize));
    {
        let irreversible = irreversible.clone();
        controller.on_irreversible_block(Box::new(move |_| irreversible.set(irreversible.get() + 1)));
    }

    let mut ids = Vec::new();
    for slot in 1..=12u64 {
        let trx = sign_transaction(
            &controller,
            transaction_with(
                vec![newdomain_action(&format!("domain{}", slot), public_key(&genesis_key))],
                slot_timestamp(slot),
            ),
            &[&genesis_key],
        );
        produce_block(&mut controller, slot, 0, &genesis_key, &[trx]).unwrap();
        ids.push(controller.head_block_id());
    }

    assert_eq!(controller.head_block_num(), BlockNum::new(13));
    assert_eq!(controller.last_irreversible_block_num(), BlockNum::new(13));
    // Genesis and the twelve produced blocks each fired the irreversibility signal.
    assert_eq!(irreversible.get(), 13);

    // The block log holds the full prefix in order; everything but the head has been
    // pruned from the fork database, so these reads come from the log.
    for (i, id) in ids.iter().enumerate() {
        let block_num = BlockNum::new(i as u32 + 2);
        let block = controller.fetch_block_by_number(block_num).unwrap().unwrap();
        assert_eq!(block.id(), *id);
    }

    // Undo capacity was freed: only the head block's session is still held.
    assert_eq!(controller.state_db().revision(), 13);
    assert_eq!(controller.state_db().undo_depth(), 1);
    assert_eq!(controller.token_db().savepoint_count(), 1);
}

#[test]
fn clean_restart_resumes_from_persisted_stores() {
    let dir = TempDir::new().unwrap();
    let genesis_key = signing_key(0);
    let config = test_config(dir.path(), public_key(&genesis_key));

    {
        let mut controller = Controller::new(config.clone()).unwrap();
        let trx = sign_transaction(
            &controller,
            transaction_with(vec![newdomain_action("music", public_key(&genesis_key))], slot_timestamp(1)),
            &[&genesis_key],
        );
        produce_block(&mut controller, 1, 0, &genesis_key, &[trx]).unwrap();
        produce_block(&mut controller, 2, 0, &genesis_key, &[]).unwrap();
        produce_block(&mut controller, 3, 0, &genesis_key, &[]).unwrap();
    }

    let controller = Controller::new(config).unwrap();
    assert_eq!(controller.head_block_num(), BlockNum::new(4));
    assert_eq!(controller.state_db().revision(), 4);
    assert!(controller.token_db().exists_domain(&DomainName::new("music")));
}

#[test]
fn crash_recovery_replays_the_block_log() {
    let dir = TempDir::new().unwrap();
    let genesis_key = signing_key(0);
    let config = test_config(dir.path(), public_key(&genesis_key));

    {
        let mut controller = Controller::new(config.clone()).unwrap();
        let trx = sign_transaction(
            &controller,
            transaction_with(vec![newdomain_action("music", public_key(&genesis_key))], slot_timestamp(1)),
            &[&genesis_key],
        );
        produce_block(&mut controller, 1, 0, &genesis_key, &[trx]).unwrap();
        produce_block(&mut controller, 2, 0, &genesis_key, &[]).unwrap();
    }

    // Simulate a crash that lost everything except the block log.
    std::fs::remove_file(dir.path().join("state/state.db")).unwrap();
    std::fs::remove_file(dir.path().join("state/fork_db.dat")).unwrap();
    std::fs::remove_file(dir.path().join("tokens/token.db")).unwrap();

    let controller = Controller::new(config).unwrap();
    assert_eq!(controller.head_block_num(), BlockNum::new(3));
    assert_eq!(controller.state_db().revision(), 3);
    assert!(controller.token_db().exists_domain(&DomainName::new("music")));
}
