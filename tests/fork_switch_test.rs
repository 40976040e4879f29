//! Tests of fork switching, failed-reorg recovery, and BFT irreversibility through
//! producer confirmations, on a chain whose schedule has been handed over from the
//! genesis producer to two named producers.

mod common;

use ed25519_dalek::{Signer, SigningKey};
use log::LevelFilter;
use tempfile::TempDir;

use common::logging::setup_logger;
use common::*;

use tokenchain::controller::Controller;
use tokenchain::errors::ChainError;
use tokenchain::types::basic::{BlockNum, DomainName, Name, SignatureBytes};
use tokenchain::types::block::{HeaderConfirmation, ProducerKey, SignedBlock};
use tokenchain::types::transaction::{AccountSignature, SignedTransaction};

struct TwoProducerChain {
    controller: Controller,
    /// The signed blocks produced so far (block 2 first), for feeding into replicas.
    blocks: Vec<SignedBlock>,
}

/// Builds the chain `G -> 2 -> 3 -> 4 -> A(5)`: block 2 proposes the `[alice, bob]`
/// schedule, block 3 promotes it to pending, block 4 (bob's) runs under it, and block 5
/// (alice's, confirming one ancestor) leaves DPoS irreversibility resting at block 3 so
/// that blocks 4 and 5 stay reversible and forkable.
fn two_producer_chain(
    dir: &TempDir,
    genesis_key: &SigningKey,
    alice_key: &SigningKey,
    bob_key: &SigningKey,
) -> TwoProducerChain {
    let mut controller = Controller::new(test_config(dir.path(), public_key(genesis_key))).unwrap();
    let mut blocks = Vec::new();

    controller.start_block(slot_timestamp(1), 0).unwrap();
    assert!(controller
        .set_proposed_producers(vec![
            ProducerKey { producer_name: Name::new("alice"), signing_key: public_key(alice_key) },
            ProducerKey { producer_name: Name::new("bob"), signing_key: public_key(bob_key) },
        ])
        .unwrap());
    seal_block(&mut controller, genesis_key).unwrap();
    blocks.push(controller.head_block_state().block.clone());

    produce_block(&mut controller, 2, 0, genesis_key, &[]).unwrap();
    blocks.push(controller.head_block_state().block.clone());

    // Slot 3 maps to bob, slot 4 to alice.
    produce_block(&mut controller, 3, 0, bob_key, &[]).unwrap();
    blocks.push(controller.head_block_state().block.clone());

    produce_block(&mut controller, 4, 1, alice_key, &[]).unwrap();
    blocks.push(controller.head_block_state().block.clone());

    assert_eq!(controller.head_block_num(), BlockNum::new(5));
    assert_eq!(controller.last_irreversible_block_num(), BlockNum::new(3));

    TwoProducerChain { controller, blocks }
}

/// A replica fed the same blocks through `push_block`.
fn replica_of(dir: &TempDir, genesis_key: &SigningKey, blocks: &[SignedBlock]) -> Controller {
    let mut replica = Controller::new(test_config(dir.path(), public_key(genesis_key))).unwrap();
    for block in blocks {
        replica.push_block(block.clone(), false).unwrap();
    }
    replica
}

#[test]
fn fork_switch_to_a_better_branch() {
    setup_logger(LevelFilter::Debug);

    let genesis_key = signing_key(0);
    let alice_key = signing_key(1);
    let bob_key = signing_key(2);

    let dir1 = TempDir::new().unwrap();
    let TwoProducerChain { controller: mut ctrl1, blocks } =
        two_producer_chain(&dir1, &genesis_key, &alice_key, &bob_key);
    let a_id = ctrl1.head_block_id();

    // B extends A on ctrl1: alice at slot 6, no confirmations, carrying a transaction.
    let b_trx = sign_transaction(
        &ctrl1,
        transaction_with(vec![newdomain_action("bdomain", public_key(&genesis_key))], slot_timestamp(6)),
        &[&genesis_key],
    );
    produce_block(&mut ctrl1, 6, 0, &alice_key, &[b_trx.clone()]).unwrap();
    assert_eq!(ctrl1.last_irreversible_block_num(), BlockNum::new(3));

    // C extends A on a replica: bob at slot 7, confirming A, which advances DPoS
    // irreversibility past B's.
    let dir2 = TempDir::new().unwrap();
    let mut ctrl2 = replica_of(&dir2, &genesis_key, &blocks);
    assert_eq!(ctrl2.head_block_id(), a_id);

    let c_trx = sign_transaction(
        &ctrl2,
        transaction_with(vec![newdomain_action("cdomain", public_key(&genesis_key))], slot_timestamp(7)),
        &[&genesis_key],
    );
    produce_block(&mut ctrl2, 7, 1, &bob_key, &[c_trx]).unwrap();
    let c_block = ctrl2.head_block_state().block.clone();
    assert!(ctrl2.head_block_state().dpos_irreversible_blocknum > BlockNum::new(3));

    // ctrl1 sees C: same height as B but higher irreversibility, so it switches.
    ctrl1.push_block(c_block.clone(), false).unwrap();

    assert_eq!(ctrl1.head_block_id(), c_block.id());
    assert_eq!(ctrl1.head_block_num(), BlockNum::new(6));
    assert_eq!(ctrl1.state_db().revision(), 6);

    // B was popped: its transaction is back in the unapplied map and its writes undone.
    assert!(ctrl1.is_known_unapplied_transaction(&b_trx.signed_id));
    assert!(!ctrl1.token_db().exists_domain(&DomainName::new("bdomain")));
    assert!(ctrl1.token_db().exists_domain(&DomainName::new("cdomain")));

    // The current chain now answers height 6 with C.
    assert_eq!(ctrl1.get_block_id_for_num(BlockNum::new(6)).unwrap(), c_block.id());
}

#[test]
fn failed_reorg_restores_the_previous_chain() {
    let genesis_key = signing_key(0);
    let alice_key = signing_key(1);
    let bob_key = signing_key(2);

    let dir1 = TempDir::new().unwrap();
    let TwoProducerChain { controller: mut ctrl1, blocks } =
        two_producer_chain(&dir1, &genesis_key, &alice_key, &bob_key);

    let b_trx = sign_transaction(
        &ctrl1,
        transaction_with(vec![newdomain_action("bdomain", public_key(&genesis_key))], slot_timestamp(6)),
        &[&genesis_key],
    );
    produce_block(&mut ctrl1, 6, 0, &alice_key, &[b_trx.clone()]).unwrap();
    let b_id = ctrl1.head_block_id();

    // Produce a valid C on a replica, then corrupt its transaction's signatures: still
    // validly signed (so key recovery passes), but by a key that does not satisfy the
    // creator authority. The header, and therefore the block id and producer signature,
    // are untouched.
    let dir2 = TempDir::new().unwrap();
    let mut ctrl2 = replica_of(&dir2, &genesis_key, &blocks);
    let c_trx = sign_transaction(
        &ctrl2,
        transaction_with(vec![newdomain_action("cdomain", public_key(&genesis_key))], slot_timestamp(7)),
        &[&genesis_key],
    );
    produce_block(&mut ctrl2, 7, 1, &bob_key, &[c_trx]).unwrap();

    let mut bad_block = ctrl2.head_block_state().block.clone();
    let body_digest = SignedTransaction::signing_digest(
        &bad_block.transactions[0].trx.trx.id(),
        &ctrl1.chain_id(),
    );
    bad_block.transactions[0].trx.signatures = vec![AccountSignature {
        key: public_key(&bob_key),
        signature: SignatureBytes::from(bob_key.sign(&body_digest.bytes())),
    }];

    let err = ctrl1.push_block(bad_block.clone(), false).unwrap_err();
    assert!(matches!(err, ChainError::TxMissingSigs(_)));

    // The previous chain is back: B is the applied head, its transaction was re-applied
    // (and so left the unapplied map), and its writes are present again.
    assert_eq!(ctrl1.head_block_id(), b_id);
    assert_eq!(ctrl1.head_block_num(), BlockNum::new(6));
    assert_eq!(ctrl1.state_db().revision(), 6);
    assert!(!ctrl1.is_known_unapplied_transaction(&b_trx.signed_id));
    assert!(ctrl1.token_db().exists_domain(&DomainName::new("bdomain")));
    assert!(!ctrl1.token_db().exists_domain(&DomainName::new("cdomain")));

    // The bad block was marked invalid and removed from head candidacy entirely.
    assert!(ctrl1.fetch_block_by_id(&bad_block.id()).unwrap().is_none());

    // The node keeps producing on the restored chain.
    produce_block(&mut ctrl1, 8, 0, &alice_key, &[]).unwrap();
    assert_eq!(ctrl1.head_block_num(), BlockNum::new(7));
}

#[test]
fn confirmations_advance_bft_irreversibility() {
    let genesis_key = signing_key(0);
    let alice_key = signing_key(1);
    let bob_key = signing_key(2);

    let dir = TempDir::new().unwrap();
    let TwoProducerChain { controller: mut ctrl, .. } =
        two_producer_chain(&dir, &genesis_key, &alice_key, &bob_key);

    let head = ctrl.head_block_state();
    let digest = head.sig_digest();
    let head_id = head.id;
    assert_eq!(ctrl.last_irreversible_block_num(), BlockNum::new(3));

    // One confirmation out of two producers is not a quorum.
    ctrl.push_confirmation(&HeaderConfirmation {
        block_id: head_id,
        producer: Name::new("alice"),
        signature: SignatureBytes::from(alice_key.sign(&digest.bytes())),
    })
    .unwrap();
    assert_eq!(ctrl.last_irreversible_block_num(), BlockNum::new(3));

    // A confirmation from outside the active schedule is rejected.
    let err = ctrl
        .push_confirmation(&HeaderConfirmation {
            block_id: head_id,
            producer: Name::new("genesis"),
            signature: SignatureBytes::from(genesis_key.sign(&digest.bytes())),
        })
        .unwrap_err();
    assert!(matches!(err, ChainError::BlockValidation(_)));

    // A duplicate confirmation is rejected.
    let err = ctrl
        .push_confirmation(&HeaderConfirmation {
            block_id: head_id,
            producer: Name::new("alice"),
            signature: SignatureBytes::from(alice_key.sign(&digest.bytes())),
        })
        .unwrap_err();
    assert!(matches!(err, ChainError::BlockValidation(_)));

    // The second producer's confirmation reaches the quorum: the head becomes BFT
    // irreversible and the whole prefix flushes.
    ctrl.push_confirmation(&HeaderConfirmation {
        block_id: head_id,
        producer: Name::new("bob"),
        signature: SignatureBytes::from(bob_key.sign(&digest.bytes())),
    })
    .unwrap();

    assert_eq!(ctrl.last_irreversible_block_num(), BlockNum::new(5));
    assert_eq!(ctrl.state_db().undo_depth(), 0);
    assert_eq!(ctrl.token_db().savepoint_count(), 0);
    let logged = ctrl.fetch_block_by_number(BlockNum::new(5)).unwrap().unwrap();
    assert_eq!(logged.id(), head_id);
}
