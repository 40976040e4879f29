/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Newtypes for the primitive quantities that flow through the controller: block
//! identifiers and numbers, timestamps, hashes, names, keys, and signatures.
//!
//! All of these types are borsh-serializable so that they can be hashed, stored in the
//! state database, and written to the block log with a single canonical encoding.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, SignatureError, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt::{self, Debug, Display, Formatter};

pub use sha2::Sha256 as CryptoHasher;

/// Interval between consecutive block production slots, in milliseconds.
pub const BLOCK_INTERVAL_MS: u64 = 500;

/// Number of consecutive slots assigned to a producer before the schedule rotates to the
/// next one.
pub const PRODUCER_REPETITIONS: u64 = 12;

/// Id of the blockchain, derived from the hash of the genesis configuration.
#[derive(Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ChainId([u8; 32]);

impl ChainId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

/// Height of a block in the chain. The genesis block has number 1.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct BlockNum(u32);

impl BlockNum {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> BlockNum {
        BlockNum(self.0 + 1)
    }

    /// Slot of this block number in the 65,536-entry block summary ring.
    pub fn summary_slot(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl Display for BlockNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The id of a block: a 32-byte content hash of its header whose high 32 bits are
/// overwritten with the block number, so that the number can be recovered from the id
/// alone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct BlockId([u8; 32]);

impl BlockId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Recovers the block number encoded in the high 32 bits of the id.
    pub fn block_num(&self) -> BlockNum {
        BlockNum(u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]))
    }

    /// The 32-bit TaPoS prefix: the little-endian word at bytes 8..12 of the id, which a
    /// transaction embeds to bind itself to a specific fork.
    pub fn tapos_prefix(&self) -> u32 {
        u32::from_le_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }

    /// Stamps a header digest with a block number, producing the block's id.
    pub fn from_digest(digest: CryptoHash, block_num: BlockNum) -> BlockId {
        let mut bytes = digest.bytes();
        bytes[0..4].copy_from_slice(&block_num.int().to_be_bytes());
        BlockId(bytes)
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::logging::first_seven_base64_chars(&self.0))
    }
}

impl Debug for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Hashes a byte string.
    pub fn digest(bytes: &[u8]) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(bytes);
        CryptoHash(hasher.finalize().into())
    }

    /// Hashes the borsh serialization of a value.
    pub fn digest_of<T: BorshSerialize>(value: &T) -> CryptoHash {
        CryptoHash::digest(&borsh::to_vec(value).expect("borsh serialization cannot fail"))
    }

    /// Hashes the concatenation of two digests.
    pub fn combine(left: &CryptoHash, right: &CryptoHash) -> CryptoHash {
        let mut hasher = Sha256::new();
        hasher.update(left.0);
        hasher.update(right.0);
        CryptoHash(hasher.finalize().into())
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::logging::first_seven_base64_chars(&self.0))
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A point in time, in milliseconds since the Unix epoch. Block timestamps are expected
/// to fall on slot boundaries but this is not enforced by the type.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub const fn millis(&self) -> u64 {
        self.0
    }

    pub fn plus_millis(&self, ms: u64) -> Timestamp {
        Timestamp(self.0 + ms)
    }

    pub fn plus_seconds(&self, secs: u64) -> Timestamp {
        Timestamp(self.0 + secs * 1000)
    }

    /// The production slot this timestamp falls in.
    pub fn slot(&self) -> u64 {
        self.0 / BLOCK_INTERVAL_MS
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// An identifier within a domain: a token, group, account, or producer name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct Name(String);

impl Name {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for Name {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// The name of a domain. The reserved domains [`DomainName::ACCOUNT`] and
/// [`DomainName::GROUP`] scope the account- and group-lifecycle actions.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct DomainName(String);

impl DomainName {
    pub const ACCOUNT: &'static str = "account";
    pub const GROUP: &'static str = "group";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn account() -> Self {
        Self(Self::ACCOUNT.to_string())
    }

    pub fn group() -> Self {
        Self(Self::GROUP.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_account(&self) -> bool {
        self.0 == Self::ACCOUNT
    }
}

impl Display for DomainName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for DomainName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// The name of an action, packed into 64 bits with the base-32 alphabet
/// `.12345abcdefghijklmnopqrstuvwxyz`: twelve 5-bit symbols followed by one 4-bit symbol.
/// Packed names make cheap registry keys and are recovered losslessly for display.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct ActionName(u64);

impl ActionName {
    /// Packs a name, panicking on invalid input. Only for compile-time literals; use
    /// [`ActionName::new`] for untrusted input.
    pub const fn constant(name: &str) -> ActionName {
        match Self::pack(name.as_bytes()) {
            Some(int) => ActionName(int),
            None => panic!("invalid action name literal"),
        }
    }

    /// Packs a name of up to 13 characters from the base-32 alphabet.
    pub fn new(name: &str) -> Result<ActionName, InvalidNameError> {
        Self::pack(name.as_bytes())
            .map(ActionName)
            .ok_or_else(|| InvalidNameError(name.to_string()))
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    const fn symbol(c: u8) -> Option<u8> {
        match c {
            b'.' => Some(0),
            b'1'..=b'5' => Some(c - b'1' + 1),
            b'a'..=b'z' => Some(c - b'a' + 6),
            _ => None,
        }
    }

    const fn pack(bytes: &[u8]) -> Option<u64> {
        if bytes.len() > 13 {
            return None;
        }
        let mut value: u64 = 0;
        let mut i = 0;
        while i < bytes.len() {
            let sym = match Self::symbol(bytes[i]) {
                Some(sym) => sym,
                None => return None,
            };
            if i < 12 {
                value |= (sym as u64 & 0x1f) << (64 - 5 * (i + 1));
            } else {
                // The 13th character only has 4 bits of room.
                if sym > 0x0f {
                    return None;
                }
                value |= sym as u64 & 0x0f;
            }
            i += 1;
        }
        Some(value)
    }
}

impl Display for ActionName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        const ALPHABET: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";
        let mut chars = [b'.'; 13];
        for (i, c) in chars.iter_mut().enumerate() {
            let sym = if i < 12 {
                ((self.0 >> (64 - 5 * (i + 1))) & 0x1f) as usize
            } else {
                (self.0 & 0x0f) as usize
            };
            *c = ALPHABET[sym];
        }
        let name = std::str::from_utf8(&chars).expect("alphabet is ASCII");
        f.write_str(name.trim_end_matches('.'))
    }
}

impl Debug for ActionName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A name could not be packed into an [`ActionName`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidNameError(pub String);

impl Display for InvalidNameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "name {:?} is not packable into 64 bits", self.0)
    }
}

/// An Ed25519 public key in byte form. Converted to an [`ed25519_dalek::VerifyingKey`]
/// at verification boundaries.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::from_bytes(&self.0)
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(key: VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::logging::first_seven_base64_chars(&self.0))
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An Ed25519 signature in byte form.
#[derive(Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 64])
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }

    pub fn signature(&self) -> Signature {
        Signature::from_bytes(&self.0)
    }
}

impl From<Signature> for SignatureBytes {
    fn from(sig: Signature) -> Self {
        Self(sig.to_bytes())
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::logging::first_seven_base64_chars(&self.0))
    }
}

/// A quantity of the chain's fungible unit held by an account.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshSerialize, BorshDeserialize,
)]
pub struct Balance(u64);

impl Balance {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub fn checked_sub(&self, rhs: Balance) -> Option<Balance> {
        self.0.checked_sub(rhs.0).map(Balance)
    }

    pub fn checked_add(&self, rhs: Balance) -> Option<Balance> {
        self.0.checked_add(rhs.0).map(Balance)
    }
}

impl Display for Balance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
