//! Batched operations executed in a single transaction.
//!
//! A [`Batch`] queues PUT, GET and DEL operations against the sub-databases
//! of a store. A key or value may be a [`Lookup`] of an earlier operation's
//! resolved key or value, which lets one GET feed a later operation without
//! the caller copying bytes. `execute` runs the whole queue in one
//! transaction, retries it as a unit on transient engine failures, and
//! always leaves the batch empty.

mod exec;
mod op;
mod resolve;

pub use exec::BatchResults;
pub use op::{Descriptor, Lookup, OpKind, Operation, Source};

use log::{debug, error, warn};

use crate::config::Config;
use crate::constants::TransactionFlags;
use crate::dbi::DbiRegistry;
use crate::engine::Environment;
use crate::error::{Error, MdbError, Result};
use crate::policy::{ErrorPolicy, Safety, Verdict};

use self::exec::{Failure, Scratch};

/// Outcome of one execution attempt that did not fail outright
enum Attempt {
    Done(BatchResults),
    Retry(MdbError),
}

/// A fixed-capacity queue of operations.
///
/// `'s` borrows the store, `'a` the caller's key, value and destination
/// bytes, which must stay alive until the batch executes.
#[derive(Debug)]
pub struct Batch<'s, 'a> {
    env: Option<&'s Environment>,
    dbis: &'s DbiRegistry,
    config: &'s Config,
    ops: Vec<Operation<'a>>,
    /// Set by the first write operation, cleared only by execute
    read_write: bool,
}

impl<'s, 'a> Batch<'s, 'a> {
    pub(crate) fn new(env: Option<&'s Environment>, dbis: &'s DbiRegistry, config: &'s Config) -> Self {
        Batch {
            env,
            dbis,
            config,
            ops: Vec::with_capacity(config.batch_capacity),
            read_write: false,
        }
    }

    /// Queue an operation on the sub-database at index `dbi`.
    pub fn enqueue(
        &mut self,
        dbi: usize,
        kind: OpKind,
        key: Descriptor<'a>,
        value: Descriptor<'a>,
    ) -> Result<()> {
        if self.env.is_none() {
            return Err(Error::NotInitialized);
        }
        self.dbis.get(dbi)?;

        let op = Operation {
            dbi,
            kind,
            key,
            value,
        };
        op.validate()?;
        if op.lookups().any(|lookup| lookup.index >= self.ops.len()) {
            return Err(Error::InvalidArgument("lookup must reference an earlier operation"));
        }
        if self.ops.len() >= self.config.batch_capacity {
            return Err(Error::BatchFull {
                capacity: self.config.batch_capacity,
            });
        }

        if kind.is_write() && !self.read_write {
            debug!("batch reclassified as read-write");
            self.read_write = true;
        }
        self.ops.push(op);
        Ok(())
    }

    /// Queue a PUT with the sub-database's default put flags.
    pub fn put(&mut self, dbi: usize, key: &'a [u8], value: &'a [u8]) -> Result<()> {
        self.enqueue(dbi, OpKind::Put, Descriptor::Bytes(key), Descriptor::Bytes(value))
    }

    /// Queue a GET whose value is returned through [`BatchResults::value`].
    pub fn get(&mut self, dbi: usize, key: &'a [u8]) -> Result<()> {
        self.enqueue(dbi, OpKind::Get, Descriptor::Bytes(key), Descriptor::None)
    }

    /// Queue a GET that copies the value into `buf`.
    pub fn get_into(&mut self, dbi: usize, key: &'a [u8], buf: &'a mut [u8]) -> Result<()> {
        self.enqueue(dbi, OpKind::Get, Descriptor::Bytes(key), Descriptor::Buffer(buf))
    }

    /// Queue a DEL of `key` and all of its values.
    pub fn del(&mut self, dbi: usize, key: &'a [u8]) -> Result<()> {
        self.enqueue(dbi, OpKind::Del, Descriptor::Bytes(key), Descriptor::None)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.config.batch_capacity
    }

    /// Whether the next execute runs in a read-write transaction
    #[inline]
    pub fn is_read_write(&self) -> bool {
        self.read_write
    }

    /// Drop every queued operation and reset the classification.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.read_write = false;
    }

    /// Execute every queued operation in one transaction.
    ///
    /// The batch is empty afterwards, whatever the outcome.
    pub fn execute(&mut self) -> Result<BatchResults> {
        let outcome = self.run();
        if let Err(err) = &outcome {
            debug!("batch of {} failed: {}", self.ops.len(), err);
        }
        self.clear();
        outcome
    }

    fn run(&mut self) -> Result<BatchResults> {
        let env = self.env.ok_or(Error::NotInitialized)?;
        if self.ops.is_empty() {
            return Err(Error::InvalidArgument("batch is empty"));
        }

        let policy = ErrorPolicy::new(env, self.config.map_size_max);
        let attempts = self.config.retry.batch;
        let mut last = None;
        for attempt in 1..=attempts {
            match self.attempt(env, &policy)? {
                Attempt::Done(results) => {
                    debug!(
                        "batch of {} executed ({}, attempt {})",
                        self.ops.len(),
                        if self.read_write { "read-write" } else { "read-only" },
                        attempt
                    );
                    return Ok(results);
                }
                Attempt::Retry(status) => {
                    warn!("batch attempt {}/{} hit {}, retrying", attempt, attempts, status);
                    last = Some(status);
                }
            }
        }

        // Config::validate rejects a zero batch budget, so at least one
        // attempt ran and set `last`
        let last = last.unwrap_or(MdbError::Other(libc::EIO));
        error!("batch failed after {} attempts: {}", attempts, last);
        Err(Error::RetryExhausted { attempts, last })
    }

    fn attempt(&mut self, env: &Environment, policy: &ErrorPolicy<'_>) -> Result<Attempt> {
        let flags = if self.read_write {
            TransactionFlags::empty()
        } else {
            TransactionFlags::RDONLY
        };

        let mut txn = match env.begin_txn(flags) {
            Ok(txn) => txn,
            Err(status) => return settle(policy.evaluate(Some(status), None)),
        };

        let outcome = if self.read_write {
            let scratch = Scratch::new(self.config.scratch_size);
            exec::run_write(&mut txn, &mut self.ops, self.dbis, scratch)
        } else {
            exec::run_read(&txn, &mut self.ops, self.dbis)
        };

        let results = match outcome {
            Ok(results) => results,
            Err(Failure::Engine { index, status }) => {
                debug!("op {} failed: {}", index, status);
                return settle(policy.evaluate(Some(status), Some(&mut txn)));
            }
            Err(Failure::Invalid(err)) => return Err(err),
        };

        if !self.read_write {
            txn.abort();
            return Ok(Attempt::Done(results));
        }
        match txn.commit() {
            Ok(()) => Ok(Attempt::Done(results)),
            Err(status) => settle(policy.evaluate(Some(status), Some(&mut txn))),
        }
    }
}

/// Turn a non-success verdict into a retry or the error that ends the batch.
fn settle(verdict: Verdict) -> Result<Attempt> {
    match (verdict.safety, verdict.status) {
        (Safety::Retry, Some(status)) => Ok(Attempt::Retry(status)),
        _ => Err(verdict.into_error()),
    }
}
