use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, MutexGuard};

use log::debug;

use crate::constants::{DbFlags, TransactionFlags, WriteFlags, CORE_DBS, DEFAULT_MAX_KEY_SIZE};
use crate::error::MdbError;

use super::env::{Environment, Snapshot, WriterState};
use super::tree::{DbTree, SpaceBudget};
use super::{Dbi, Result};

/// Reader lock table slot, released on drop
#[derive(Debug)]
pub(crate) struct ReaderSlot<'env> {
    readers: &'env AtomicU32,
}

impl<'env> ReaderSlot<'env> {
    pub(crate) fn acquire(readers: &'env AtomicU32, max_readers: u32) -> Result<Self> {
        readers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max_readers).then_some(n + 1)
            })
            .map_err(|_| MdbError::ReadersFull)?;
        Ok(ReaderSlot { readers })
    }
}

impl Drop for ReaderSlot<'_> {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub(crate) enum TxnState<'env> {
    /// Reader pinned to a committed snapshot
    Read {
        snapshot: Arc<Snapshot>,
        _slot: ReaderSlot<'env>,
    },
    /// The single writer, working on a private copy
    Write {
        working: Snapshot,
        space: SpaceBudget,
        /// Handles opened by this transaction, published on commit
        created: Vec<Dbi>,
        writer: MutexGuard<'env, WriterState>,
    },
}

/// A transaction against an [`Environment`].
///
/// Values returned by [`Transaction::get`] borrow from the transaction and
/// stay valid until it commits or aborts. Dropping an unfinished
/// transaction aborts it.
#[derive(Debug)]
pub struct Transaction<'env> {
    env: &'env Environment,
    flags: TransactionFlags,
    id: u64,
    state: Option<TxnState<'env>>,
}

fn index_of(dbi: Dbi) -> Result<usize> {
    dbi.checked_sub(CORE_DBS)
        .map(|i| i as usize)
        .ok_or(MdbError::BadDbi)
}

fn handle_of(index: usize) -> Dbi {
    index as Dbi + CORE_DBS
}

fn check_compatible(tree: &DbTree, flags: DbFlags) -> Result<()> {
    let persistent = DbFlags::DUPSORT | DbFlags::DUPFIXED;
    if tree.flags & persistent != flags & persistent {
        return Err(MdbError::Incompatible);
    }
    Ok(())
}

impl<'env> Transaction<'env> {
    pub(crate) fn new(env: &'env Environment, flags: TransactionFlags, state: TxnState<'env>) -> Self {
        let id = match &state {
            TxnState::Read { snapshot, .. } => snapshot.txnid,
            TxnState::Write { working, .. } => working.txnid,
        };
        debug!(
            "begin {} txn {}",
            if flags.contains(TransactionFlags::RDONLY) { "read" } else { "write" },
            id
        );
        Transaction {
            env,
            flags,
            id,
            state: Some(state),
        }
    }

    /// Transaction ID
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.flags.contains(TransactionFlags::RDONLY)
    }

    /// Whether the transaction has neither committed nor aborted
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    /// Open a named database, creating it with `DbFlags::CREATE`.
    ///
    /// A handle opened by a write transaction is usable by other
    /// transactions once this one commits.
    pub fn dbi_open(&mut self, name: &str, flags: DbFlags) -> Result<Dbi> {
        if name.is_empty() || name.len() > DEFAULT_MAX_KEY_SIZE {
            return Err(MdbError::BadValSize);
        }
        let env = self.env;
        match self.state.as_mut().ok_or(MdbError::BadTxn)? {
            TxnState::Read { snapshot, .. } => {
                match snapshot.dbs.iter().position(|db| db.name == name) {
                    Some(index) => {
                        check_compatible(&snapshot.dbs[index], flags)?;
                        let dbi = handle_of(index);
                        env.register_handle(dbi)?;
                        Ok(dbi)
                    }
                    None if flags.contains(DbFlags::CREATE) => Err(MdbError::Other(libc::EACCES)),
                    None => Err(MdbError::NotFound),
                }
            }
            TxnState::Write {
                working,
                space,
                created,
                ..
            } => {
                let index = match working.dbs.iter().position(|db| db.name == name) {
                    Some(index) => {
                        check_compatible(&working.dbs[index], flags)?;
                        index
                    }
                    None => {
                        if !flags.contains(DbFlags::CREATE) {
                            return Err(MdbError::NotFound);
                        }
                        if working.dbs.len() >= env.max_dbs() as usize {
                            return Err(MdbError::DbsFull);
                        }
                        space.reserve(DbTree::header_len(name))?;
                        working.dbs.push(Arc::new(DbTree::new(name, flags)));
                        debug!("created database {:?}", name);
                        working.dbs.len() - 1
                    }
                };
                let dbi = handle_of(index);
                if !created.contains(&dbi) {
                    created.push(dbi);
                }
                Ok(dbi)
            }
        }
    }

    fn tree(&self, dbi: Dbi) -> Result<&DbTree> {
        let index = index_of(dbi)?;
        let (dbs, visible) = match self.state.as_ref().ok_or(MdbError::BadTxn)? {
            TxnState::Read { snapshot, .. } => (&snapshot.dbs, false),
            TxnState::Write { working, created, .. } => (&working.dbs, created.contains(&dbi)),
        };
        if !visible && !self.env.is_handle_open(dbi)? {
            return Err(MdbError::BadDbi);
        }
        dbs.get(index).map(Arc::as_ref).ok_or(MdbError::BadDbi)
    }

    fn tree_mut(&mut self, dbi: Dbi) -> Result<(&mut DbTree, &mut SpaceBudget)> {
        let index = index_of(dbi)?;
        let env = self.env;
        match self.state.as_mut().ok_or(MdbError::BadTxn)? {
            TxnState::Read { .. } => Err(MdbError::Other(libc::EACCES)),
            TxnState::Write {
                working,
                space,
                created,
                ..
            } => {
                if !created.contains(&dbi) && !env.is_handle_open(dbi)? {
                    return Err(MdbError::BadDbi);
                }
                let tree = working.dbs.get_mut(index).ok_or(MdbError::BadDbi)?;
                Ok((Arc::make_mut(tree), space))
            }
        }
    }

    /// Flags of an open database
    pub fn dbi_flags(&self, dbi: Dbi) -> Result<DbFlags> {
        Ok(self.tree(dbi)?.flags)
    }

    /// Get the data stored under `key`; the first item of a DUPSORT key.
    pub fn get(&self, dbi: Dbi, key: &[u8]) -> Result<&[u8]> {
        self.tree(dbi)?.get(key)
    }

    /// Store a key/data pair
    pub fn put(&mut self, dbi: Dbi, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        let (tree, space) = self.tree_mut(dbi)?;
        tree.put(key, data, flags, space)
    }

    /// Delete `key`, or only the pair `key`/`data` in a DUPSORT database.
    pub fn del(&mut self, dbi: Dbi, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        let (tree, space) = self.tree_mut(dbi)?;
        tree.del(key, data, space)
    }

    /// Commit the transaction. A read-only transaction just releases its snapshot.
    pub fn commit(&mut self) -> Result<()> {
        match self.state.take().ok_or(MdbError::BadTxn)? {
            TxnState::Read { .. } => Ok(()),
            TxnState::Write {
                working,
                created,
                mut writer,
                ..
            } => self.env.commit_write(&mut writer, working, created),
        }
    }

    /// Abort the transaction. Aborting twice is a no-op.
    pub fn abort(&mut self) {
        if self.state.take().is_some() {
            debug!("txn {} aborted", self.id);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}
