/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The domain-scoped token database.
//!
//! Stores four record kinds: [`Domain`]s with their issue/transfer/manage authorities,
//! per-domain [`Token`]s with owner key sets, [`Group`](crate::types::authority::Group)
//! trees, and [`Account`]s with owner key sets and a fungible balance. Reads are offered
//! callback-style (`read_domain(&name, |domain| ...)`) so that the authorization path
//! can borrow records without cloning them.
//!
//! Unlike the state database's nested sessions, rollback here is organized as a
//! *savepoint stack keyed by block number*. [`TokenDb::new_savepoint_session`] pushes a
//! savepoint and returns a handle whose [`accept`](TokenDbSession::accept) seals it and
//! whose drop rolls back to it; [`TokenDb::rollback_to_latest_savepoint`] reverts to the
//! top savepoint without popping it (how a popped block is unwound), and
//! [`TokenDb::pop_savepoints`] discards all savepoints at or below a block number when
//! irreversibility passes it.

use borsh::{BorshDeserialize, BorshSerialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::errors::ChainError;
use crate::types::authority::{Authority, Group};
use crate::types::basic::{Balance, DomainName, Name, PublicKey};

const SNAPSHOT_FILE: &str = "token.db";

/// A domain: a namespace of tokens governed by three authorities.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Domain {
    pub name: DomainName,
    pub creator: PublicKey,
    pub issue: Authority,
    pub transfer: Authority,
    pub manage: Authority,
}

/// A non-fungible token inside a domain, held by its owner key set.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Token {
    pub domain: DomainName,
    pub name: Name,
    pub owner: Vec<PublicKey>,
}

/// An account: an owner key set and a fungible balance.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Account {
    pub name: Name,
    pub owner: Vec<PublicKey>,
    pub balance: Balance,
}

/// Failures reported by token database operations. All of them are deterministic and
/// therefore objective transaction failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenDbError {
    DomainExists(DomainName),
    DomainNotFound(DomainName),
    TokenExists(DomainName, Name),
    TokenNotFound(DomainName, Name),
    GroupExists(Name),
    GroupNotFound(Name),
    AccountExists(Name),
    AccountNotFound(Name),
    BalanceInsufficient(Name),
    BalanceOverflow(Name),
}

impl Display for TokenDbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TokenDbError::DomainExists(name) => write!(f, "domain {} already exists", name),
            TokenDbError::DomainNotFound(name) => write!(f, "domain {} does not exist", name),
            TokenDbError::TokenExists(domain, name) => {
                write!(f, "token {} in domain {} already exists", name, domain)
            }
            TokenDbError::TokenNotFound(domain, name) => {
                write!(f, "token {} in domain {} does not exist", name, domain)
            }
            TokenDbError::GroupExists(name) => write!(f, "group {} already exists", name),
            TokenDbError::GroupNotFound(name) => write!(f, "group {} does not exist", name),
            TokenDbError::AccountExists(name) => write!(f, "account {} already exists", name),
            TokenDbError::AccountNotFound(name) => write!(f, "account {} does not exist", name),
            TokenDbError::BalanceInsufficient(name) => {
                write!(f, "account {} has insufficient balance", name)
            }
            TokenDbError::BalanceOverflow(name) => {
                write!(f, "balance of account {} would overflow", name)
            }
        }
    }
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
enum RecordKey {
    Domain(DomainName),
    Token(DomainName, Name),
    Group(Name),
    Account(Name),
}

#[derive(Clone, BorshSerialize, BorshDeserialize)]
enum RecordValue {
    Domain(Domain),
    Token(Token),
    Group(Group),
    Account(Account),
}

/// First-touch old values of the records written since the savepoint was pushed.
#[derive(BorshSerialize, BorshDeserialize)]
struct Savepoint {
    seq: u64,
    /// An open savepoint belongs to a live [`TokenDbSession`] and is skipped by
    /// [`TokenDb::pop_savepoints`].
    open: bool,
    undo: BTreeMap<RecordKey, Option<RecordValue>>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct Snapshot {
    domains: BTreeMap<DomainName, Domain>,
    tokens: BTreeMap<(DomainName, Name), Token>,
    groups: BTreeMap<Name, Group>,
    accounts: BTreeMap<Name, Account>,
    savepoints: Vec<Savepoint>,
}

struct TokenDbInner {
    domains: BTreeMap<DomainName, Domain>,
    tokens: BTreeMap<(DomainName, Name), Token>,
    groups: BTreeMap<Name, Group>,
    accounts: BTreeMap<Name, Account>,
    savepoints: Vec<Savepoint>,
    dir: PathBuf,
}

/// A cheaply cloneable handle to the token database. All clones share the same store.
#[derive(Clone)]
pub struct TokenDb {
    inner: Rc<RefCell<TokenDbInner>>,
}

impl TokenDb {
    /// Opens the token database at `dir`, loading the snapshot left by a previous clean
    /// shutdown if one exists.
    pub fn open(dir: &Path) -> Result<TokenDb, ChainError> {
        fs::create_dir_all(dir)?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let inner = if snapshot_path.is_file() {
            let bytes = fs::read(&snapshot_path)?;
            let snapshot = Snapshot::try_from_slice(&bytes)
                .map_err(|err| ChainError::Io(format!("corrupt token snapshot: {}", err)))?;
            TokenDbInner {
                domains: snapshot.domains,
                tokens: snapshot.tokens,
                groups: snapshot.groups,
                accounts: snapshot.accounts,
                savepoints: snapshot.savepoints,
                dir: dir.to_path_buf(),
            }
        } else {
            TokenDbInner {
                domains: BTreeMap::new(),
                tokens: BTreeMap::new(),
                groups: BTreeMap::new(),
                accounts: BTreeMap::new(),
                savepoints: Vec::new(),
                dir: dir.to_path_buf(),
            }
        };

        Ok(TokenDb { inner: Rc::new(RefCell::new(inner)) })
    }

    /// Writes a snapshot of the store, including sealed savepoints, to disk.
    pub fn flush(&self) -> Result<(), ChainError> {
        let inner = self.inner.borrow();
        let snapshot = Snapshot {
            domains: inner.domains.clone(),
            tokens: inner.tokens.clone(),
            groups: inner.groups.clone(),
            accounts: inner.accounts.clone(),
            savepoints: inner
                .savepoints
                .iter()
                .filter(|sp| !sp.open)
                .map(|sp| Savepoint { seq: sp.seq, open: false, undo: sp.undo.clone() })
                .collect(),
        };
        let bytes = borsh::to_vec(&snapshot).expect("borsh serialization cannot fail");
        fs::write(inner.dir.join(SNAPSHOT_FILE), bytes)?;
        Ok(())
    }

    /// Whether the store holds no records and no savepoints.
    pub fn is_pristine(&self) -> bool {
        let inner = self.inner.borrow();
        inner.domains.is_empty()
            && inner.tokens.is_empty()
            && inner.groups.is_empty()
            && inner.accounts.is_empty()
            && inner.savepoints.is_empty()
    }

    /// Discards all records and savepoints. Used when the on-disk snapshot is found to
    /// be out of step with the fork database at startup.
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.domains.clear();
        inner.tokens.clear();
        inner.groups.clear();
        inner.accounts.clear();
        inner.savepoints.clear();
    }

    /* ↓↓↓ Savepoints ↓↓↓ */

    /// Pushes a savepoint keyed by block number and returns the session handle guarding
    /// it.
    pub fn new_savepoint_session(&self, block_num: u64) -> TokenDbSession {
        self.inner.borrow_mut().savepoints.push(Savepoint {
            seq: block_num,
            open: true,
            undo: BTreeMap::new(),
        });
        TokenDbSession { db: self.clone(), seq: block_num, disposed: false }
    }

    /// Reverts every write made since the top savepoint was pushed, leaving the
    /// savepoint in place.
    pub fn rollback_to_latest_savepoint(&self) {
        let mut inner = self.inner.borrow_mut();
        let undo = {
            let top = inner.savepoints.last_mut().expect("rollback with no savepoints");
            std::mem::take(&mut top.undo)
        };
        for (key, old) in undo {
            inner.apply(key, old);
        }
    }

    /// Discards all sealed savepoints with block number ≤ `block_num`, making their
    /// writes unrevertable. Fired when irreversibility passes `block_num`.
    pub fn pop_savepoints(&self, block_num: u64) {
        let mut inner = self.inner.borrow_mut();
        loop {
            match inner.savepoints.first() {
                Some(sp) if !sp.open && sp.seq <= block_num => {}
                _ => break,
            }
            inner.savepoints.remove(0);
        }
    }

    /// Number of savepoints currently held.
    pub fn savepoint_count(&self) -> usize {
        self.inner.borrow().savepoints.len()
    }

    fn seal(&self, seq: u64) {
        let mut inner = self.inner.borrow_mut();
        let top = inner.savepoints.last_mut().expect("session seal with no savepoints");
        assert!(top.seq == seq && top.open, "session seal does not match the top savepoint");
        top.open = false;
    }

    fn squash(&self, seq: u64) {
        let mut inner = self.inner.borrow_mut();
        let top = inner.savepoints.pop().expect("session squash with no savepoints");
        assert!(top.seq == seq && top.open, "session squash does not match the top savepoint");
        let parent = inner
            .savepoints
            .last_mut()
            .expect("cannot squash the outermost savepoint session");
        for (key, old) in top.undo {
            parent.undo.entry(key).or_insert(old);
        }
    }

    fn rollback_and_pop(&self, seq: u64) {
        let mut inner = self.inner.borrow_mut();
        let top = inner.savepoints.pop().expect("session rollback with no savepoints");
        assert!(top.seq == seq && top.open, "session rollback does not match the top savepoint");
        for (key, old) in top.undo {
            inner.apply(key, old);
        }
    }

    /* ↓↓↓ Domains ↓↓↓ */

    pub fn exists_domain(&self, name: &DomainName) -> bool {
        self.inner.borrow().domains.contains_key(name)
    }

    pub fn add_domain(&self, domain: Domain) -> Result<(), TokenDbError> {
        let mut inner = self.inner.borrow_mut();
        if inner.domains.contains_key(&domain.name) {
            return Err(TokenDbError::DomainExists(domain.name));
        }
        inner.write(RecordKey::Domain(domain.name.clone()), Some(RecordValue::Domain(domain)));
        Ok(())
    }

    pub fn read_domain<R>(
        &self,
        name: &DomainName,
        f: impl FnOnce(&Domain) -> R,
    ) -> Result<R, TokenDbError> {
        let inner = self.inner.borrow();
        let domain =
            inner.domains.get(name).ok_or_else(|| TokenDbError::DomainNotFound(name.clone()))?;
        Ok(f(domain))
    }

    pub fn update_domain(
        &self,
        name: &DomainName,
        f: impl FnOnce(&mut Domain),
    ) -> Result<(), TokenDbError> {
        let mut inner = self.inner.borrow_mut();
        let mut domain = inner
            .domains
            .get(name)
            .cloned()
            .ok_or_else(|| TokenDbError::DomainNotFound(name.clone()))?;
        f(&mut domain);
        inner.write(RecordKey::Domain(name.clone()), Some(RecordValue::Domain(domain)));
        Ok(())
    }

    /* ↓↓↓ Tokens ↓↓↓ */

    pub fn exists_token(&self, domain: &DomainName, name: &Name) -> bool {
        self.inner.borrow().tokens.contains_key(&(domain.clone(), name.clone()))
    }

    pub fn add_token(&self, token: Token) -> Result<(), TokenDbError> {
        let mut inner = self.inner.borrow_mut();
        let key = (token.domain.clone(), token.name.clone());
        if inner.tokens.contains_key(&key) {
            return Err(TokenDbError::TokenExists(token.domain, token.name));
        }
        inner.write(RecordKey::Token(key.0, key.1), Some(RecordValue::Token(token)));
        Ok(())
    }

    pub fn read_token<R>(
        &self,
        domain: &DomainName,
        name: &Name,
        f: impl FnOnce(&Token) -> R,
    ) -> Result<R, TokenDbError> {
        let inner = self.inner.borrow();
        let token = inner
            .tokens
            .get(&(domain.clone(), name.clone()))
            .ok_or_else(|| TokenDbError::TokenNotFound(domain.clone(), name.clone()))?;
        Ok(f(token))
    }

    pub fn update_token(
        &self,
        domain: &DomainName,
        name: &Name,
        f: impl FnOnce(&mut Token),
    ) -> Result<(), TokenDbError> {
        let mut inner = self.inner.borrow_mut();
        let key = (domain.clone(), name.clone());
        let mut token = inner
            .tokens
            .get(&key)
            .cloned()
            .ok_or_else(|| TokenDbError::TokenNotFound(domain.clone(), name.clone()))?;
        f(&mut token);
        inner.write(RecordKey::Token(key.0, key.1), Some(RecordValue::Token(token)));
        Ok(())
    }

    /* ↓↓↓ Groups ↓↓↓ */

    pub fn exists_group(&self, name: &Name) -> bool {
        self.inner.borrow().groups.contains_key(name)
    }

    pub fn add_group(&self, group: Group) -> Result<(), TokenDbError> {
        let mut inner = self.inner.borrow_mut();
        if inner.groups.contains_key(&group.name) {
            return Err(TokenDbError::GroupExists(group.name));
        }
        inner.write(RecordKey::Group(group.name.clone()), Some(RecordValue::Group(group)));
        Ok(())
    }

    pub fn read_group<R>(
        &self,
        name: &Name,
        f: impl FnOnce(&Group) -> R,
    ) -> Result<R, TokenDbError> {
        let inner = self.inner.borrow();
        let group =
            inner.groups.get(name).ok_or_else(|| TokenDbError::GroupNotFound(name.clone()))?;
        Ok(f(group))
    }

    pub fn update_group(
        &self,
        name: &Name,
        f: impl FnOnce(&mut Group),
    ) -> Result<(), TokenDbError> {
        let mut inner = self.inner.borrow_mut();
        let mut group = inner
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| TokenDbError::GroupNotFound(name.clone()))?;
        f(&mut group);
        inner.write(RecordKey::Group(name.clone()), Some(RecordValue::Group(group)));
        Ok(())
    }

    /* ↓↓↓ Accounts ↓↓↓ */

    pub fn exists_account(&self, name: &Name) -> bool {
        self.inner.borrow().accounts.contains_key(name)
    }

    pub fn add_account(&self, account: Account) -> Result<(), TokenDbError> {
        let mut inner = self.inner.borrow_mut();
        if inner.accounts.contains_key(&account.name) {
            return Err(TokenDbError::AccountExists(account.name));
        }
        inner.write(RecordKey::Account(account.name.clone()), Some(RecordValue::Account(account)));
        Ok(())
    }

    pub fn read_account<R>(
        &self,
        name: &Name,
        f: impl FnOnce(&Account) -> R,
    ) -> Result<R, TokenDbError> {
        let inner = self.inner.borrow();
        let account =
            inner.accounts.get(name).ok_or_else(|| TokenDbError::AccountNotFound(name.clone()))?;
        Ok(f(account))
    }

    pub fn update_account(
        &self,
        name: &Name,
        f: impl FnOnce(&mut Account),
    ) -> Result<(), TokenDbError> {
        let mut inner = self.inner.borrow_mut();
        let mut account = inner
            .accounts
            .get(name)
            .cloned()
            .ok_or_else(|| TokenDbError::AccountNotFound(name.clone()))?;
        f(&mut account);
        inner.write(RecordKey::Account(name.clone()), Some(RecordValue::Account(account)));
        Ok(())
    }

    /// Moves `amount` between two accounts, failing without effect if the source
    /// balance is insufficient.
    pub fn transfer_balance(
        &self,
        from: &Name,
        to: &Name,
        amount: Balance,
    ) -> Result<(), TokenDbError> {
        let remaining = self
            .read_account(from, |a| a.balance.checked_sub(amount))?
            .ok_or_else(|| TokenDbError::BalanceInsufficient(from.clone()))?;
        // Read the destination before writing anything so a missing account leaves the
        // source untouched.
        let credited = self
            .read_account(to, |a| a.balance.checked_add(amount))?
            .ok_or_else(|| TokenDbError::BalanceOverflow(to.clone()))?;

        self.update_account(from, |a| a.balance = remaining)?;
        self.update_account(to, |a| a.balance = credited)?;
        Ok(())
    }
}

impl TokenDbInner {
    fn write(&mut self, key: RecordKey, value: Option<RecordValue>) {
        let old = self.current(&key);
        if let Some(savepoint) = self.savepoints.last_mut() {
            savepoint.undo.entry(key.clone()).or_insert(old);
        }
        self.apply(key, value);
    }

    fn current(&self, key: &RecordKey) -> Option<RecordValue> {
        match key {
            RecordKey::Domain(name) => self.domains.get(name).cloned().map(RecordValue::Domain),
            RecordKey::Token(domain, name) => {
                self.tokens.get(&(domain.clone(), name.clone())).cloned().map(RecordValue::Token)
            }
            RecordKey::Group(name) => self.groups.get(name).cloned().map(RecordValue::Group),
            RecordKey::Account(name) => self.accounts.get(name).cloned().map(RecordValue::Account),
        }
    }

    fn apply(&mut self, key: RecordKey, value: Option<RecordValue>) {
        match (key, value) {
            (RecordKey::Domain(name), Some(RecordValue::Domain(domain))) => {
                self.domains.insert(name, domain);
            }
            (RecordKey::Domain(name), None) => {
                self.domains.remove(&name);
            }
            (RecordKey::Token(domain, name), Some(RecordValue::Token(token))) => {
                self.tokens.insert((domain, name), token);
            }
            (RecordKey::Token(domain, name), None) => {
                self.tokens.remove(&(domain, name));
            }
            (RecordKey::Group(name), Some(RecordValue::Group(group))) => {
                self.groups.insert(name, group);
            }
            (RecordKey::Group(name), None) => {
                self.groups.remove(&name);
            }
            (RecordKey::Account(name), Some(RecordValue::Account(account))) => {
                self.accounts.insert(name, account);
            }
            (RecordKey::Account(name), None) => {
                self.accounts.remove(&name);
            }
            _ => unreachable!("record key and value kinds always match"),
        }
    }
}

/// A handle to an open savepoint. [`accept`](TokenDbSession::accept) seals the
/// savepoint, [`squash`](TokenDbSession::squash) folds it into the enclosing one, and
/// dropping the handle rolls back to (and discards) the savepoint.
pub struct TokenDbSession {
    db: TokenDb,
    seq: u64,
    disposed: bool,
}

impl TokenDbSession {
    /// Seals the savepoint: its writes stay in place, revertable as a unit until
    /// [`TokenDb::pop_savepoints`] passes its block number.
    pub fn accept(mut self) {
        self.disposed = true;
        self.db.seal(self.seq);
    }

    /// Folds this savepoint into the enclosing one, as if its writes had been made
    /// there directly.
    pub fn squash(mut self) {
        self.disposed = true;
        self.db.squash(self.seq);
    }
}

impl Drop for TokenDbSession {
    fn drop(&mut self) {
        if !self.disposed {
            self.db.rollback_and_pop(self.seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> TokenDb {
        TokenDb::open(dir.path()).unwrap()
    }

    fn test_domain(name: &str) -> Domain {
        let key = PublicKey::new([7; 32]);
        Domain {
            name: DomainName::new(name),
            creator: key,
            issue: Authority::single_key(key),
            transfer: Authority::owner(),
            manage: Authority::single_key(key),
        }
    }

    #[test]
    fn dropped_session_rolls_back() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let session = db.new_savepoint_session(2);
        db.add_domain(test_domain("music")).unwrap();
        assert!(db.exists_domain(&DomainName::new("music")));
        drop(session);

        assert!(!db.exists_domain(&DomainName::new("music")));
        assert_eq!(db.savepoint_count(), 0);
    }

    #[test]
    fn rollback_to_latest_savepoint_keeps_the_savepoint() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let session = db.new_savepoint_session(2);
        db.add_domain(test_domain("music")).unwrap();
        session.accept();

        db.rollback_to_latest_savepoint();
        assert!(!db.exists_domain(&DomainName::new("music")));
        assert_eq!(db.savepoint_count(), 1);

        // The surviving savepoint can host the replacement block's writes and be rolled
        // back to again.
        db.add_domain(test_domain("books")).unwrap();
        db.rollback_to_latest_savepoint();
        assert!(!db.exists_domain(&DomainName::new("books")));
    }

    #[test]
    fn squash_folds_into_enclosing_savepoint() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let block = db.new_savepoint_session(2);
        let trx = db.new_savepoint_session(2);
        db.add_domain(test_domain("music")).unwrap();
        trx.squash();

        // Dropping the block session reverts the squashed transaction's writes.
        drop(block);
        assert!(!db.exists_domain(&DomainName::new("music")));
    }

    #[test]
    fn pop_savepoints_discards_up_to_block_num() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        for block_num in 2..5u64 {
            let session = db.new_savepoint_session(block_num);
            session.accept();
        }
        db.pop_savepoints(3);
        assert_eq!(db.savepoint_count(), 1);
    }

    #[test]
    fn transfer_balance_is_atomic() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let alice = Name::new("alice");
        db.add_account(Account {
            name: alice.clone(),
            owner: vec![PublicKey::new([1; 32])],
            balance: Balance::new(10),
        })
        .unwrap();

        // Missing destination: the source keeps its balance.
        let missing = Name::new("missing");
        assert_eq!(
            db.transfer_balance(&alice, &missing, Balance::new(4)),
            Err(TokenDbError::AccountNotFound(missing))
        );
        assert_eq!(db.read_account(&alice, |a| a.balance).unwrap(), Balance::new(10));
    }
}
