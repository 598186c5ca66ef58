use std::slice;

use log::{debug, info};

use crate::config::RetryBudgets;
use crate::constants::{DbFlags, DbiType, TransactionFlags, WriteFlags};
use crate::engine::{Dbi, Environment};
use crate::error::{Error, Result};
use crate::policy::{ErrorPolicy, RetryBudget};

/// A named sub-database requested by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbiDecl {
    pub name: String,
    pub kind: DbiType,
}

impl DbiDecl {
    pub fn new(name: impl Into<String>, kind: DbiType) -> Self {
        DbiDecl {
            name: name.into(),
            kind,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("sub-database name cannot be empty"));
        }
        if self.kind.contains(DbiType::DUPFIXED) && !self.kind.contains(DbiType::DUPSORT) {
            return Err(Error::InvalidArgument("DUPFIXED requires DUPSORT"));
        }
        Ok(())
    }

    /// Engine flags to open this sub-database with. Always creates.
    pub fn open_flags(&self) -> DbFlags {
        let mut flags = DbFlags::CREATE;
        if self.kind.contains(DbiType::DUPSORT) {
            flags |= DbFlags::DUPSORT;
        }
        if self.kind.contains(DbiType::DUPFIXED) {
            flags |= DbFlags::DUPFIXED;
        }
        flags
    }
}

/// An opened sub-database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbiDescriptor {
    /// Engine handle
    pub handle: Dbi,
    pub name: String,
    /// Declared type
    pub kind: DbiType,
    /// Flags reported by the engine
    pub db_flags: DbFlags,
    /// Flags applied to every put
    pub put_flags: WriteFlags,
    pub dupsort: bool,
    pub dupfixed: bool,
}

/// Default put flags for a sub-database of type `kind` with engine flags `db_flags`.
pub fn default_put_flags(kind: DbiType, db_flags: DbFlags) -> WriteFlags {
    let mut flags = WriteFlags::empty();
    if kind.contains(DbiType::NOOVERWRITE) {
        flags |= WriteFlags::NOOVERWRITE;
    }
    if kind.contains(DbiType::APPENDABLE) {
        flags |= if db_flags.contains(DbFlags::DUPSORT) {
            WriteFlags::APPENDDUP
        } else {
            WriteFlags::APPEND
        };
    }
    flags
}

/// Descriptors of every declared sub-database, indexed by declaration order.
#[derive(Debug, Default)]
pub struct DbiRegistry {
    dbis: Vec<DbiDescriptor>,
}

impl DbiRegistry {
    /// Open or create every declared sub-database in one write transaction.
    ///
    /// A retry at any step restarts the whole registry, since aborting the
    /// transaction invalidates every handle it opened.
    pub fn open(
        env: &Environment,
        policy: &ErrorPolicy<'_>,
        decls: &[DbiDecl],
        retry: &RetryBudgets,
    ) -> Result<Self> {
        if decls.is_empty() {
            return Err(Error::InvalidArgument("no sub-databases declared"));
        }
        for decl in decls {
            decl.validate()?;
        }

        let mut txn_budget = RetryBudget::new(retry.txn);
        let mut open_budget = RetryBudget::new(retry.dbi_open);
        let mut flags_budget = RetryBudget::new(retry.dbi_flags);

        'restart: loop {
            let mut txn = match env.begin_txn(TransactionFlags::empty()) {
                Ok(txn) => txn,
                Err(status) => {
                    let verdict = policy.evaluate_with_budget(Some(status), None, &mut txn_budget);
                    if verdict.is_retry() {
                        continue 'restart;
                    }
                    return Err(verdict.into_error());
                }
            };

            let mut dbis = Vec::with_capacity(decls.len());
            for decl in decls {
                let handle = match txn.dbi_open(&decl.name, decl.open_flags()) {
                    Ok(handle) => handle,
                    Err(status) => {
                        let verdict =
                            policy.evaluate_with_budget(Some(status), Some(&mut txn), &mut open_budget);
                        if verdict.is_retry() {
                            continue 'restart;
                        }
                        return Err(verdict.into_error());
                    }
                };

                let db_flags = match txn.dbi_flags(handle) {
                    Ok(flags) => flags,
                    Err(status) => {
                        let verdict =
                            policy.evaluate_with_budget(Some(status), Some(&mut txn), &mut flags_budget);
                        if verdict.is_retry() {
                            continue 'restart;
                        }
                        return Err(verdict.into_error());
                    }
                };

                let descriptor = DbiDescriptor {
                    handle,
                    name: decl.name.clone(),
                    kind: decl.kind,
                    db_flags,
                    put_flags: default_put_flags(decl.kind, db_flags),
                    dupsort: db_flags.contains(DbFlags::DUPSORT),
                    dupfixed: db_flags.contains(DbFlags::DUPFIXED),
                };
                debug!(
                    "dbi {:?} opened as {} (flags {:?}, put flags {:?})",
                    descriptor.name, descriptor.handle, descriptor.db_flags, descriptor.put_flags
                );
                dbis.push(descriptor);
            }

            if let Err(status) = txn.commit() {
                let verdict = policy.evaluate_with_budget(Some(status), Some(&mut txn), &mut txn_budget);
                if verdict.is_retry() {
                    continue 'restart;
                }
                return Err(verdict.into_error());
            }

            info!("{} sub-databases ready", dbis.len());
            return Ok(DbiRegistry { dbis });
        }
    }

    /// Descriptor at `index`
    pub fn get(&self, index: usize) -> Result<&DbiDescriptor> {
        self.dbis
            .get(index)
            .ok_or(Error::InvalidArgument("sub-database index out of range"))
    }

    pub fn iter(&self) -> slice::Iter<'_, DbiDescriptor> {
        self.dbis.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dbis.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dbis.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.dbis.clear();
    }
}
