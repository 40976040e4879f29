/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The undo-capable general-purpose state database.
//!
//! The state database is a byte-keyed store with typed indexes layered on top (see
//! [`objects`] and [`paths`]) and *nested undo sessions*. A [`Session`] captures every
//! write made while it is the innermost open session. Dropping a session reverts its
//! writes; [`Session::push`] seals the session so that its writes survive until either
//! [`StateDb::undo`] reverts them or [`StateDb::commit`] makes them permanent;
//! [`Session::squash`] folds a nested session into its parent, which is how a
//! transaction's writes become part of its enclosing block without becoming separately
//! undoable.
//!
//! The *revision* is the block number the store's contents correspond to: it is bumped
//! by each opened session and decremented by each undo or squash, and the controller
//! maintains the invariant that `revision == head.block_num` whenever no block is being
//! assembled.
//!
//! The whole store, including sealed undo sessions for the reversible tail of the chain,
//! is flushed to a snapshot file on clean shutdown and reloaded on open, so a restarted
//! node can still unwind reversible blocks during a fork switch.

pub mod objects;

pub mod paths;

use borsh::{BorshDeserialize, BorshSerialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::errors::ChainError;

const SNAPSHOT_FILE: &str = "state.db";

/// A typed index registrable in the state database. Registration is idempotent and must
/// happen before the index's accessors are used.
pub trait StateIndex {
    const NAME: &'static str;
    /// The key prefixes this index occupies.
    const PREFIXES: &'static [[u8; 1]];
}

/// A cheaply cloneable handle to the state database. All clones share the same store.
#[derive(Clone)]
pub struct StateDb {
    inner: Rc<RefCell<StateDbInner>>,
}

struct StateDbInner {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    undo_stack: Vec<UndoLevel>,
    revision: u64,
    registered: HashSet<&'static str>,
    dir: PathBuf,
    read_only: bool,
    capacity: u64,
    used: u64,
}

/// The first-touch old values of every key written at one session depth.
#[derive(BorshSerialize, BorshDeserialize)]
struct UndoLevel {
    revision: u64,
    /// An open level belongs to a live [`Session`] and is skipped by [`StateDb::commit`].
    open: bool,
    old_values: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct Snapshot {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    undo_stack: Vec<UndoLevel>,
    revision: u64,
}

impl StateDb {
    /// Opens the state database at `dir`, loading the snapshot left by a previous clean
    /// shutdown if one exists.
    pub fn open(dir: &Path, read_only: bool, capacity: u64) -> Result<StateDb, ChainError> {
        fs::create_dir_all(dir)?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let (data, undo_stack, revision) = if snapshot_path.is_file() {
            let bytes = fs::read(&snapshot_path)?;
            let snapshot = Snapshot::try_from_slice(&bytes)
                .map_err(|err| ChainError::Io(format!("corrupt state snapshot: {}", err)))?;
            (snapshot.data, snapshot.undo_stack, snapshot.revision)
        } else {
            (BTreeMap::new(), Vec::new(), 0)
        };

        let used = data.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum();
        Ok(StateDb {
            inner: Rc::new(RefCell::new(StateDbInner {
                data,
                undo_stack,
                revision,
                registered: HashSet::new(),
                dir: dir.to_path_buf(),
                read_only,
                capacity,
                used,
            })),
        })
    }

    /// Registers a typed index. Registering the same index twice is a no-op.
    pub fn register_index<T: StateIndex>(&self) {
        self.inner.borrow_mut().registered.insert(T::NAME);
    }

    pub(crate) fn assert_registered<T: StateIndex>(&self) {
        assert!(
            self.inner.borrow().registered.contains(T::NAME),
            "index {} accessed before registration",
            T::NAME
        );
    }

    /// The block number the store's contents correspond to.
    pub fn revision(&self) -> u64 {
        self.inner.borrow().revision
    }

    /// Sets the revision directly. Only legal while no undo sessions exist, i.e. at
    /// genesis initialization.
    pub fn set_revision(&self, revision: u64) {
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.undo_stack.is_empty(),
            "cannot set revision while undo sessions exist"
        );
        inner.revision = revision;
    }

    /// Number of undoable session levels currently held.
    pub fn undo_depth(&self) -> usize {
        self.inner.borrow().undo_stack.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.borrow().data.get(key).cloned()
    }

    pub fn set(&self, key: &[u8], value: &[u8]) {
        self.inner.borrow_mut().set(key.to_vec(), value.to_vec())
    }

    pub fn remove(&self, key: &[u8]) {
        self.inner.borrow_mut().remove(key)
    }

    /// The smallest key-value pair whose key starts with `prefix`.
    pub fn first_with_prefix(&self, prefix: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.borrow();
        inner
            .data
            .range(prefix.to_vec()..)
            .next()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Opens a nested undo session and bumps the revision.
    pub fn start_undo_session(&self) -> Session {
        let mut inner = self.inner.borrow_mut();
        assert!(!inner.read_only, "cannot open an undo session on a read-only state database");
        inner.revision += 1;
        let revision = inner.revision;
        inner.undo_stack.push(UndoLevel {
            revision,
            open: true,
            old_values: BTreeMap::new(),
        });
        Session { db: self.clone(), revision, disposed: false }
    }

    /// Reverts the writes of the most recent session level and decrements the revision.
    pub fn undo(&self) {
        self.inner.borrow_mut().undo()
    }

    /// Makes all sealed sessions with revision ≤ `revision` permanent, freeing their
    /// undo state. Open sessions and everything above them are left untouched.
    pub fn commit(&self, revision: u64) {
        let mut inner = self.inner.borrow_mut();
        loop {
            match inner.undo_stack.first() {
                Some(level) if !level.open && level.revision <= revision => {}
                _ => break,
            }
            inner.undo_stack.remove(0);
        }
    }

    /// Writes a snapshot of the store, including sealed undo sessions, to disk.
    pub fn flush(&self) -> Result<(), ChainError> {
        let inner = self.inner.borrow();
        if inner.read_only {
            return Ok(());
        }
        let snapshot = Snapshot {
            data: inner.data.clone(),
            undo_stack: inner
                .undo_stack
                .iter()
                .filter(|level| !level.open)
                .map(|level| UndoLevel {
                    revision: level.revision,
                    open: false,
                    old_values: level.old_values.clone(),
                })
                .collect(),
            revision: inner.revision,
        };
        let bytes = borsh::to_vec(&snapshot).expect("borsh serialization cannot fail");
        fs::write(inner.dir.join(SNAPSHOT_FILE), bytes)?;
        Ok(())
    }

    /// Discards all contents and undo state, resetting the revision to 0. Used when the
    /// on-disk snapshot is found to be out of step with the fork database at startup.
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.data.clear();
        inner.undo_stack.clear();
        inner.revision = 0;
        inner.used = 0;
    }

    fn seal(&self, revision: u64) {
        let mut inner = self.inner.borrow_mut();
        let top = inner.undo_stack.last_mut().expect("session seal with empty undo stack");
        assert!(
            top.revision == revision && top.open,
            "session seal does not match the innermost undo level"
        );
        top.open = false;
    }

    fn squash(&self, revision: u64) {
        let mut inner = self.inner.borrow_mut();
        let top = inner.undo_stack.pop().expect("session squash with empty undo stack");
        assert!(
            top.revision == revision && top.open,
            "session squash does not match the innermost undo level"
        );
        let parent = inner
            .undo_stack
            .last_mut()
            .expect("cannot squash the outermost undo session");
        for (key, old_value) in top.old_values {
            parent.old_values.entry(key).or_insert(old_value);
        }
        inner.revision -= 1;
    }

    fn undo_open(&self, revision: u64) {
        {
            let inner = self.inner.borrow();
            let top = inner.undo_stack.last().expect("session undo with empty undo stack");
            assert!(
                top.revision == revision && top.open,
                "session undo does not match the innermost undo level"
            );
        }
        self.undo()
    }
}

impl StateDbInner {
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        assert!(!self.read_only, "write to a read-only state database");

        let old = self.data.get(&key).cloned();
        let delta = (key.len() + value.len()) as u64;
        let freed = old.as_ref().map(|v| (key.len() + v.len()) as u64).unwrap_or(0);
        assert!(
            self.used + delta <= self.capacity + freed,
            "state database capacity of {} bytes exceeded",
            self.capacity
        );
        self.used = self.used + delta - freed;

        if let Some(level) = self.undo_stack.last_mut() {
            level.old_values.entry(key.clone()).or_insert(old);
        }
        self.data.insert(key, value);
    }

    fn remove(&mut self, key: &[u8]) {
        assert!(!self.read_only, "write to a read-only state database");

        if let Some(old) = self.data.remove(key) {
            self.used -= (key.len() + old.len()) as u64;
            if let Some(level) = self.undo_stack.last_mut() {
                level.old_values.entry(key.to_vec()).or_insert(Some(old));
            }
        }
    }

    fn undo(&mut self) {
        let level = self.undo_stack.pop().expect("undo with empty undo stack");
        for (key, old_value) in level.old_values {
            if let Some(current) = self.data.remove(&key) {
                self.used -= (key.len() + current.len()) as u64;
            }
            if let Some(value) = old_value {
                self.used += (key.len() + value.len()) as u64;
                self.data.insert(key, value);
            }
        }
        self.revision -= 1;
    }
}

/// A handle to an open undo session. Exactly one of [`push`](Session::push),
/// [`squash`](Session::squash), or dropping the handle must dispose of it; dropping
/// reverts every write made since the session was opened.
pub struct Session {
    db: StateDb,
    revision: u64,
    disposed: bool,
}

impl Session {
    /// Seals the session: its writes stay in place and remain undoable as a unit until
    /// committed.
    pub fn push(mut self) {
        self.disposed = true;
        self.db.seal(self.revision);
    }

    /// Folds this session's undo state into the enclosing session, as if its writes had
    /// been made there directly.
    pub fn squash(mut self) {
        self.disposed = true;
        self.db.squash(self.revision);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.disposed {
            self.db.undo_open(self.revision);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> StateDb {
        StateDb::open(dir.path(), false, 1 << 20).unwrap()
    }

    #[test]
    fn dropped_session_reverts_writes() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.set(b"k", b"committed");

        let session = db.start_undo_session();
        db.set(b"k", b"speculative");
        db.set(b"k2", b"new");
        assert_eq!(db.revision(), 1);
        drop(session);

        assert_eq!(db.get(b"k"), Some(b"committed".to_vec()));
        assert_eq!(db.get(b"k2"), None);
        assert_eq!(db.revision(), 0);
    }

    #[test]
    fn pushed_session_survives_until_undo() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let session = db.start_undo_session();
        db.set(b"k", b"v1");
        session.push();
        assert_eq!(db.get(b"k"), Some(b"v1".to_vec()));

        db.undo();
        assert_eq!(db.get(b"k"), None);
        assert_eq!(db.revision(), 0);
    }

    #[test]
    fn squash_folds_into_parent() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let outer = db.start_undo_session();
        db.set(b"a", b"outer");
        let inner = db.start_undo_session();
        db.set(b"b", b"inner");
        inner.squash();
        assert_eq!(db.revision(), 1);

        // Undoing the outer session now reverts the inner session's writes too.
        drop(outer);
        assert_eq!(db.get(b"a"), None);
        assert_eq!(db.get(b"b"), None);
    }

    #[test]
    fn commit_frees_sealed_sessions_only() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let s1 = db.start_undo_session();
        db.set(b"a", b"1");
        s1.push();
        let s2 = db.start_undo_session();
        db.set(b"b", b"2");

        db.commit(2);
        assert_eq!(db.undo_depth(), 1, "the open session must not be committed away");
        s2.push();
        db.commit(2);
        assert_eq!(db.undo_depth(), 0);
        assert_eq!(db.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn snapshot_round_trips_through_flush() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_db(&dir);
            let session = db.start_undo_session();
            db.set(b"k", b"v");
            session.push();
            db.flush().unwrap();
        }
        let db = open_db(&dir);
        assert_eq!(db.get(b"k"), Some(b"v".to_vec()));
        assert_eq!(db.revision(), 1);
        // The reversible session is still undoable after a restart.
        db.undo();
        assert_eq!(db.get(b"k"), None);
    }
}
