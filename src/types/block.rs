/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Block headers, signed blocks, producer schedules, and the derived header state that
//! drives fork choice.
//!
//! [`BlockHeaderState`] is the per-block metadata the fork database keeps for every
//! candidate block: the producer schedules (active, pending, and the hash binding the
//! pending one into producer signatures), the confirmation ledger from which DPoS
//! irreversibility is derived, and the BFT irreversibility number advanced by explicit
//! producer confirmations. `last_irreversible` is the maximum of the two numbers.
//!
//! Deriving the state of a child block happens in two flavors that share
//! [`BlockHeaderState::generate_next`]: [`BlockState::new_pending`] for locally produced
//! blocks and [`BlockHeaderState::next`] for externally received ones, where the received
//! header is validated against what this node would have produced in its place.

use borsh::{BorshDeserialize, BorshSerialize};
use std::cell::{Cell, RefCell};
use std::cmp::max;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::rc::Rc;

use crate::errors::ChainError;

use super::basic::{
    BlockId, BlockNum, ChainId, CryptoHash, Name, PublicKey, SignatureBytes, Timestamp,
    PRODUCER_REPETITIONS,
};
use super::transaction::{TransactionMetadata, TransactionReceipt};

/// A producer and the key its blocks must be signed with.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProducerKey {
    pub producer_name: Name,
    pub signing_key: PublicKey,
}

/// A versioned list of producers. Versions increase by one with each adopted proposal.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProducerSchedule {
    pub version: u32,
    pub producers: Vec<ProducerKey>,
}

impl ProducerSchedule {
    /// The schedule installed at genesis: version 0, a single producer holding the
    /// genesis key.
    pub fn genesis(initial_key: PublicKey) -> ProducerSchedule {
        ProducerSchedule {
            version: 0,
            producers: vec![ProducerKey {
                producer_name: Name::new("genesis"),
                signing_key: initial_key,
            }],
        }
    }

    /// The producer scheduled at a given timestamp. Producers take
    /// [`PRODUCER_REPETITIONS`] consecutive slots each, round-robin.
    pub fn scheduled_producer(&self, when: Timestamp) -> &ProducerKey {
        let index = (when.slot() / PRODUCER_REPETITIONS) as usize % self.producers.len();
        &self.producers[index]
    }

    /// Confirmations required for a block to pass: strictly more than two thirds of the
    /// schedule.
    pub fn required_confirmations(&self) -> usize {
        self.producers.len() * 2 / 3 + 1
    }

    pub fn schedule_hash(&self) -> CryptoHash {
        CryptoHash::digest_of(self)
    }
}

/// The header of a block. The block's id is the header digest stamped with the block
/// number in its high 32 bits.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockHeader {
    pub timestamp: Timestamp,
    pub producer: Name,
    /// How many of this block's ancestors the producer confirms on top of the implicit
    /// confirmation of the block itself.
    pub confirmed: u16,
    pub previous: BlockId,
    pub transaction_mroot: CryptoHash,
    pub action_mroot: CryptoHash,
    pub schedule_version: u32,
    pub new_producers: Option<ProducerSchedule>,
}

impl BlockHeader {
    pub fn digest(&self) -> CryptoHash {
        CryptoHash::digest_of(self)
    }

    pub fn block_num(&self) -> BlockNum {
        self.previous.block_num().next()
    }

    pub fn id(&self) -> BlockId {
        BlockId::from_digest(self.digest(), self.block_num())
    }
}

/// A block as it travels between nodes and into the block log: the header, the
/// producer's signature, and the receipts of the transactions it includes.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedBlock {
    pub header: BlockHeader,
    pub producer_signature: SignatureBytes,
    pub transactions: Vec<TransactionReceipt>,
}

impl SignedBlock {
    pub fn id(&self) -> BlockId {
        self.header.id()
    }
}

/// A producer's explicit confirmation of a block, contributing towards BFT
/// irreversibility.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HeaderConfirmation {
    pub block_id: BlockId,
    pub producer: Name,
    pub signature: SignatureBytes,
}

/// Per-block metadata derived while linking a block onto its parent.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct BlockHeaderState {
    /// Zero until the header is finalized (locally produced blocks) or validated
    /// (received blocks).
    pub id: BlockId,
    pub block_num: BlockNum,
    pub header: BlockHeader,
    /// Highest block that has gathered the required confirmations but whose
    /// irreversibility has not yet been implied by enough producers.
    pub dpos_proposed_irreversible_blocknum: BlockNum,
    pub dpos_irreversible_blocknum: BlockNum,
    /// Advanced in place when producer confirmations reach a quorum, and propagated to
    /// descendant states by the fork database.
    #[borsh(skip)]
    pub bft_irreversible_blocknum: Cell<BlockNum>,
    /// Block number at which the pending schedule was set; it is promoted to active
    /// once this number is irreversible.
    pub pending_schedule_lib_num: BlockNum,
    pub pending_schedule_hash: CryptoHash,
    pub pending_schedule: ProducerSchedule,
    pub active_schedule: ProducerSchedule,
    /// Key the block at this state must be signed with.
    pub block_signing_key: PublicKey,
    /// Per active producer, the highest block number that producer has implied to be
    /// irreversible by building on top of it.
    pub producer_to_last_implied_irb: BTreeMap<Name, BlockNum>,
    /// Remaining confirmations needed for each not-yet-proposed-irreversible ancestor,
    /// oldest first, ending with this block.
    pub confirm_count: Vec<u8>,
    #[borsh(skip)]
    pub confirmations: RefCell<Vec<HeaderConfirmation>>,
}

impl BlockHeaderState {
    /// The header state of the genesis block: a single-key schedule both active and
    /// pending, the chain id recorded as the genesis action root, and every
    /// irreversibility number at 1.
    pub fn genesis(
        initial_schedule: ProducerSchedule,
        initial_timestamp: Timestamp,
        chain_id: ChainId,
    ) -> BlockHeaderState {
        let producer = initial_schedule.producers[0].clone();
        let header = BlockHeader {
            timestamp: initial_timestamp,
            producer: producer.producer_name.clone(),
            confirmed: 1,
            previous: BlockId::zero(),
            transaction_mroot: CryptoHash::zero(),
            action_mroot: CryptoHash::new(chain_id.bytes()),
            schedule_version: 0,
            new_producers: None,
        };
        let id = header.id();
        let block_num = header.block_num();

        let mut producer_to_last_implied_irb = BTreeMap::new();
        producer_to_last_implied_irb.insert(producer.producer_name.clone(), block_num);

        BlockHeaderState {
            id,
            block_num,
            header,
            dpos_proposed_irreversible_blocknum: block_num,
            dpos_irreversible_blocknum: block_num,
            bft_irreversible_blocknum: Cell::new(block_num),
            pending_schedule_lib_num: block_num,
            pending_schedule_hash: initial_schedule.schedule_hash(),
            pending_schedule: initial_schedule.clone(),
            active_schedule: initial_schedule,
            block_signing_key: producer.signing_key,
            producer_to_last_implied_irb,
            confirm_count: Vec::new(),
            confirmations: RefCell::new(Vec::new()),
        }
    }

    /// The point past which no competing chain can win: the maximum of the DPoS and BFT
    /// irreversibility numbers.
    pub fn last_irreversible(&self) -> BlockNum {
        max(self.dpos_irreversible_blocknum, self.bft_irreversible_blocknum.get())
    }

    /// Raises the BFT irreversibility number; it never moves backwards.
    pub fn set_bft_irreversible(&self, block_num: BlockNum) {
        if block_num > self.bft_irreversible_blocknum.get() {
            self.bft_irreversible_blocknum.set(block_num);
        }
    }

    /// Derives the header state of a child block at timestamp `when`, promoting the
    /// pending schedule to active if its proposal block has become irreversible.
    ///
    /// Returns the new state and whether the promotion happened, since a block that
    /// promotes the pending schedule must not set a new one in the same breath.
    pub fn generate_next(
        &self,
        when: Timestamp,
    ) -> Result<(BlockHeaderState, bool), ChainError> {
        if when <= self.header.timestamp {
            return Err(ChainError::BlockValidation(format!(
                "block timestamp {} does not advance past parent timestamp {}",
                when, self.header.timestamp
            )));
        }

        let mut next = self.clone();
        next.block_num = self.block_num.next();
        next.confirmations.borrow_mut().clear();
        next.header = BlockHeader {
            timestamp: when,
            producer: Name::new(""),
            confirmed: 0,
            previous: self.id,
            transaction_mroot: CryptoHash::zero(),
            action_mroot: CryptoHash::zero(),
            schedule_version: 0,
            new_producers: None,
        };
        next.id = BlockId::zero();

        let was_pending_promoted = next.maybe_promote_pending();

        let producer_key = next.active_schedule.scheduled_producer(when).clone();
        next.header.producer = producer_key.producer_name;
        next.header.schedule_version = next.active_schedule.version;
        next.block_signing_key = producer_key.signing_key;

        let required = next.active_schedule.required_confirmations().min(u8::MAX as usize);
        next.confirm_count.push(required as u8);

        Ok((next, was_pending_promoted))
    }

    /// Promotes the pending schedule to active if the block that set it has become
    /// irreversible. Producers entering the schedule start implying irreversibility at
    /// the current irreversible block, so a schedule change never rewinds it.
    fn maybe_promote_pending(&mut self) -> bool {
        if self.pending_schedule.producers.is_empty()
            || self.dpos_irreversible_blocknum < self.pending_schedule_lib_num
        {
            return false;
        }

        let new_active = self.pending_schedule.clone();
        self.producer_to_last_implied_irb.retain(|name, _| {
            new_active.producers.iter().any(|p| &p.producer_name == name)
        });
        for producer in &new_active.producers {
            self.producer_to_last_implied_irb
                .entry(producer.producer_name.clone())
                .or_insert(self.dpos_irreversible_blocknum);
        }

        self.active_schedule = new_active;
        self.pending_schedule =
            ProducerSchedule { version: self.active_schedule.version, producers: Vec::new() };
        self.pending_schedule_hash = self.pending_schedule.schedule_hash();
        true
    }

    /// Applies the producer's confirmation count: this block implicitly confirms itself
    /// and explicitly confirms `num_prev_blocks` ancestors. The newest ancestor whose
    /// remaining count reaches zero becomes the proposed irreversible block.
    pub fn set_confirmed(&mut self, num_prev_blocks: u16) {
        self.header.confirmed = num_prev_blocks;

        let mut blocks_to_confirm = num_prev_blocks as u32 + 1;
        let mut i = self.confirm_count.len();
        while i > 0 && blocks_to_confirm > 0 {
            i -= 1;
            self.confirm_count[i] = self.confirm_count[i].saturating_sub(1);
            if self.confirm_count[i] == 0 {
                let confirmed_num =
                    self.block_num.int() - (self.confirm_count.len() as u32 - 1 - i as u32);
                self.dpos_proposed_irreversible_blocknum = BlockNum::new(confirmed_num);
                self.confirm_count.drain(0..=i);
                return;
            }
            blocks_to_confirm -= 1;
        }
    }

    /// Records that this block's producer implies irreversibility of the proposed
    /// irreversible block, then recomputes the DPoS irreversible block as the number
    /// that more than two thirds of the active producers imply.
    pub fn bump_dpos_irreversibility(&mut self) {
        self.producer_to_last_implied_irb
            .insert(self.header.producer.clone(), self.dpos_proposed_irreversible_blocknum);
        self.dpos_irreversible_blocknum =
            max(self.dpos_irreversible_blocknum, self.calc_dpos_last_irreversible());
    }

    fn calc_dpos_last_irreversible(&self) -> BlockNum {
        let mut implied: Vec<BlockNum> = self
            .active_schedule
            .producers
            .iter()
            .map(|p| {
                self.producer_to_last_implied_irb
                    .get(&p.producer_name)
                    .copied()
                    .unwrap_or(self.dpos_irreversible_blocknum)
            })
            .collect();
        if implied.is_empty() {
            return self.dpos_irreversible_blocknum;
        }
        implied.sort();
        implied[(implied.len() - 1) / 3]
    }

    /// Installs a proposed schedule as this block's pending schedule and records it in
    /// the header for other nodes to adopt.
    pub fn set_new_producers(&mut self, schedule: ProducerSchedule) -> Result<(), ChainError> {
        if schedule.version != self.active_schedule.version + 1 {
            return Err(ChainError::BlockValidation(format!(
                "new producer schedule version {} does not follow active version {}",
                schedule.version, self.active_schedule.version
            )));
        }
        if !self.pending_schedule.producers.is_empty() {
            return Err(ChainError::BlockValidation(
                "a pending producer schedule is already set".to_string(),
            ));
        }

        self.pending_schedule = schedule.clone();
        self.pending_schedule_hash = schedule.schedule_hash();
        self.pending_schedule_lib_num = self.block_num;
        self.header.new_producers = Some(schedule);
        Ok(())
    }

    /// The digest producer signatures are made over: the header digest combined with the
    /// pending schedule hash, binding the schedule transition into the signature.
    pub fn sig_digest(&self) -> CryptoHash {
        CryptoHash::combine(&self.header.digest(), &self.pending_schedule_hash)
    }

    /// Checks `signature` over [`Self::sig_digest`] against the scheduled producer's
    /// signing key.
    pub fn verify_producer_signature(
        &self,
        signature: &SignatureBytes,
    ) -> Result<(), ChainError> {
        let key = self.block_signing_key.verifying_key().map_err(|_| {
            ChainError::InvalidSignature(format!(
                "malformed producer signing key {}",
                self.block_signing_key
            ))
        })?;
        key.verify_strict(&self.sig_digest().bytes(), &signature.signature())
            .map_err(|_| {
                ChainError::InvalidSignature(format!(
                    "producer signature over block {} does not verify against key {}",
                    self.block_num, self.block_signing_key
                ))
            })
    }

    /// Derives and validates the header state for an externally received block header.
    /// `trust` skips the producer signature check for blocks validated upstream.
    pub fn next(
        &self,
        header: &BlockHeader,
        producer_signature: &SignatureBytes,
        trust: bool,
    ) -> Result<BlockHeaderState, ChainError> {
        if header.previous != self.id {
            return Err(ChainError::UnlinkableBlock(format!(
                "header at {} does not link to {}",
                header.block_num(),
                self.id
            )));
        }

        let (mut next, was_pending_promoted) = self.generate_next(header.timestamp)?;
        next.set_confirmed(header.confirmed);
        next.bump_dpos_irreversibility();

        if let Some(new_producers) = &header.new_producers {
            if was_pending_promoted {
                return Err(ChainError::BlockValidation(
                    "cannot set new producers in the same block that promotes the pending schedule"
                        .to_string(),
                ));
            }
            next.set_new_producers(new_producers.clone())?;
        }

        if header.producer != next.header.producer {
            return Err(ChainError::BlockValidation(format!(
                "block signed by {} but {} is scheduled at {}",
                header.producer, next.header.producer, header.timestamp
            )));
        }
        if header.schedule_version != next.header.schedule_version {
            return Err(ChainError::BlockValidation(format!(
                "block claims schedule version {} but version {} is active",
                header.schedule_version, next.header.schedule_version
            )));
        }

        next.header = header.clone();
        next.id = header.id();

        if !trust {
            next.verify_producer_signature(producer_signature)?;
        }

        Ok(next)
    }

    /// Attaches a producer confirmation after checking that the producer is in the
    /// active schedule, has not confirmed this block before, and signed the block's
    /// signing digest. Returns how many confirmations the block now has.
    pub fn add_confirmation(&self, confirmation: &HeaderConfirmation) -> Result<usize, ChainError> {
        if self.confirmations.borrow().iter().any(|c| c.producer == confirmation.producer) {
            return Err(ChainError::BlockValidation(format!(
                "producer {} already confirmed block {}",
                confirmation.producer, self.block_num
            )));
        }

        let producer_key = self
            .active_schedule
            .producers
            .iter()
            .find(|p| p.producer_name == confirmation.producer)
            .ok_or_else(|| {
                ChainError::BlockValidation(format!(
                    "confirming producer {} is not in the active schedule",
                    confirmation.producer
                ))
            })?;

        let key = producer_key.signing_key.verifying_key().map_err(|_| {
            ChainError::InvalidSignature(format!(
                "malformed signing key {} for producer {}",
                producer_key.signing_key, confirmation.producer
            ))
        })?;
        key.verify_strict(&self.sig_digest().bytes(), &confirmation.signature.signature())
            .map_err(|_| {
                ChainError::InvalidSignature(format!(
                    "confirmation by {} over block {} does not verify",
                    confirmation.producer, self.block_num
                ))
            })?;

        let mut confirmations = self.confirmations.borrow_mut();
        confirmations.push(confirmation.clone());
        Ok(confirmations.len())
    }
}

/// A block header state paired with the full block payload and the metadata of the
/// transactions that produced it. Lives in the fork database from insertion until it is
/// pruned past irreversibility; never persisted to the block log (the log stores only
/// the [`SignedBlock`]).
pub struct BlockState {
    pub header_state: BlockHeaderState,
    pub block: SignedBlock,
    /// Metadata of the transactions executed into this block. Populated for locally
    /// produced blocks; empty for blocks received from peers.
    pub trxs: Vec<Rc<TransactionMetadata>>,
    /// Whether this block has been fully applied by the controller.
    pub validated: Cell<bool>,
    /// Whether this block lies on the chain the controller currently has applied.
    pub in_current_chain: Cell<bool>,
}

impl Deref for BlockState {
    type Target = BlockHeaderState;

    fn deref(&self) -> &BlockHeaderState {
        &self.header_state
    }
}

impl BlockState {
    pub fn genesis(header_state: BlockHeaderState) -> BlockState {
        let block = SignedBlock {
            header: header_state.header.clone(),
            producer_signature: SignatureBytes::zero(),
            transactions: Vec::new(),
        };
        BlockState {
            header_state,
            block,
            trxs: Vec::new(),
            validated: Cell::new(true),
            in_current_chain: Cell::new(true),
        }
    }

    /// Starts the in-progress state of a locally produced block extending `head` at
    /// timestamp `when`. Returns the state and whether the pending schedule was promoted
    /// to active for this block.
    pub fn new_pending(
        head: &BlockState,
        when: Timestamp,
        confirm_count: u16,
    ) -> Result<(BlockState, bool), ChainError> {
        let (mut header_state, was_pending_promoted) = head.header_state.generate_next(when)?;
        header_state.set_confirmed(confirm_count);
        header_state.bump_dpos_irreversibility();

        let block = SignedBlock {
            header: header_state.header.clone(),
            producer_signature: SignatureBytes::zero(),
            transactions: Vec::new(),
        };
        Ok((
            BlockState {
                header_state,
                block,
                trxs: Vec::new(),
                validated: Cell::new(false),
                in_current_chain: Cell::new(false),
            },
            was_pending_promoted,
        ))
    }

    /// Links an externally received block onto `parent`, validating its header.
    pub fn from_received(
        parent: &BlockState,
        block: SignedBlock,
        trust: bool,
    ) -> Result<BlockState, ChainError> {
        let header_state =
            parent.header_state.next(&block.header, &block.producer_signature, trust)?;
        Ok(BlockState {
            header_state,
            block,
            trxs: Vec::new(),
            validated: Cell::new(trust),
            in_current_chain: Cell::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> PublicKey {
        PublicKey::new([seed; 32])
    }

    fn two_producer_schedule() -> ProducerSchedule {
        ProducerSchedule {
            version: 0,
            producers: vec![
                ProducerKey { producer_name: Name::new("alice"), signing_key: key(1) },
                ProducerKey { producer_name: Name::new("bob"), signing_key: key(2) },
            ],
        }
    }

    fn slot(k: u64) -> Timestamp {
        Timestamp::from_millis(k * PRODUCER_REPETITIONS * crate::types::basic::BLOCK_INTERVAL_MS)
    }

    fn derive(parent: &BlockHeaderState, k: u64, confirmed: u16) -> BlockHeaderState {
        let (mut next, _) = parent.generate_next(slot(k)).unwrap();
        next.set_confirmed(confirmed);
        next.bump_dpos_irreversibility();
        next.id = next.header.id();
        next
    }

    #[test]
    fn sole_producer_finalizes_every_block() {
        let schedule = ProducerSchedule::genesis(key(0));
        let genesis = BlockHeaderState::genesis(
            schedule,
            Timestamp::from_millis(0),
            ChainId::new([9; 32]),
        );

        let block2 = derive(&genesis, 1, 0);
        assert_eq!(block2.block_num, BlockNum::new(2));
        assert_eq!(block2.dpos_irreversible_blocknum, BlockNum::new(2));

        let block3 = derive(&block2, 2, 0);
        assert_eq!(block3.dpos_irreversible_blocknum, BlockNum::new(3));
    }

    #[test]
    fn two_producers_advance_irreversibility_through_confirmations() {
        let genesis = BlockHeaderState::genesis(
            two_producer_schedule(),
            Timestamp::from_millis(0),
            ChainId::new([9; 32]),
        );

        // Slot 2 is alice's; without confirmations nothing becomes proposed.
        let block2 = derive(&genesis, 2, 0);
        assert_eq!(block2.header.producer, Name::new("alice"));
        assert_eq!(block2.dpos_irreversible_blocknum, BlockNum::new(1));

        // Bob confirms block 2, which makes it proposed irreversible, but only bob
        // implies it so far.
        let block3 = derive(&block2, 3, 1);
        assert_eq!(block3.header.producer, Name::new("bob"));
        assert_eq!(block3.dpos_proposed_irreversible_blocknum, BlockNum::new(2));
        assert_eq!(block3.dpos_irreversible_blocknum, BlockNum::new(1));

        // Alice confirms block 3; now both producers imply block 2 or later, so the
        // irreversible block advances to 2.
        let block4 = derive(&block3, 4, 1);
        assert_eq!(block4.dpos_proposed_irreversible_blocknum, BlockNum::new(3));
        assert_eq!(block4.dpos_irreversible_blocknum, BlockNum::new(2));
    }

    #[test]
    fn pending_schedule_promotes_once_its_block_is_irreversible() {
        let schedule = ProducerSchedule::genesis(key(0));
        let genesis = BlockHeaderState::genesis(
            schedule,
            Timestamp::from_millis(0),
            ChainId::new([9; 32]),
        );

        let mut block2 = derive(&genesis, 1, 0);
        let proposed = ProducerSchedule { version: 1, ..two_producer_schedule() };
        block2.set_new_producers(proposed.clone()).unwrap();
        assert_eq!(block2.header.new_producers, Some(proposed.clone()));

        // Block 2 is instantly irreversible under a sole producer, so the very next
        // derivation promotes the pending schedule to active.
        let (block3, was_promoted) = block2.generate_next(slot(2)).unwrap();
        assert!(was_promoted);
        assert_eq!(block3.active_schedule, proposed);
        assert!(block3.pending_schedule.producers.is_empty());
        // Slot 2 under the new two-producer schedule belongs to alice.
        assert_eq!(block3.header.producer, Name::new("alice"));
    }

    #[test]
    fn received_headers_must_name_the_scheduled_producer() {
        let schedule = ProducerSchedule::genesis(key(0));
        let genesis = BlockHeaderState::genesis(
            schedule,
            Timestamp::from_millis(0),
            ChainId::new([9; 32]),
        );

        let mut header = derive(&genesis, 1, 0).header;
        header.producer = Name::new("mallory");
        let result = genesis.next(&header, &SignatureBytes::zero(), true);
        assert!(result.is_err());
    }
}
