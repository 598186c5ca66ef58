//! Classification of engine statuses into retry decisions.
//!
//! Every engine call made by the store goes through [`ErrorPolicy`]. It is
//! the only place that looks at raw [`MdbError`] values: it decides whether
//! the caller should proceed, retry or give up, aborts the transaction when
//! the status invalidates it, and grows the map when the engine runs out of
//! space.

use log::{debug, error, info, warn};

use crate::engine::{Environment, Transaction};
use crate::error::{Error, MdbError};

/// Outcome of evaluating an engine status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Safety {
    Success,
    Retry,
    Fail,
}

/// Decision for one engine status, with its mapped error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub safety: Safety,
    /// Negative POSIX-style code, 0 on success
    pub errno: i32,
    /// The engine status that produced this verdict
    pub status: Option<MdbError>,
}

impl Verdict {
    const SUCCESS: Verdict = Verdict {
        safety: Safety::Success,
        errno: 0,
        status: None,
    };

    #[inline]
    pub fn is_success(&self) -> bool {
        self.safety == Safety::Success
    }

    #[inline]
    pub fn is_retry(&self) -> bool {
        self.safety == Safety::Retry
    }

    /// Error surfaced to callers when this verdict ends an operation
    pub fn into_error(self) -> Error {
        match self.status {
            Some(status) => Error::from(status),
            None => Error::Engine(MdbError::Other(-self.errno)),
        }
    }
}

/// Bounded number of retries for one kind of engine call
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    remaining: usize,
    attempts: usize,
}

impl RetryBudget {
    pub fn new(retries: usize) -> Self {
        RetryBudget {
            remaining: retries,
            attempts: 0,
        }
    }

    /// Retries still available
    #[inline]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Retries spent so far
    #[inline]
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    fn spend(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        self.attempts += 1;
        true
    }
}

/// Map an engine status to a negative POSIX-style error code.
///
/// Statuses without an entry pass through negated.
pub fn errno_for(status: MdbError) -> i32 {
    match status {
        MdbError::NotFound => -libc::ENOENT,
        MdbError::KeyExist => -libc::EEXIST,
        MdbError::MapFull | MdbError::DbsFull | MdbError::PageFull => -libc::ENOSPC,
        MdbError::ReadersFull | MdbError::MapResized => -libc::EAGAIN,
        MdbError::TxnFull | MdbError::CursorFull => -libc::EOVERFLOW,
        MdbError::Incompatible => -libc::EPROTO,
        MdbError::VersionMismatch
        | MdbError::Invalid
        | MdbError::BadTxn
        | MdbError::BadValSize => -libc::EINVAL,
        MdbError::PageNotFound | MdbError::Corrupted | MdbError::Panic => -libc::EIO,
        MdbError::BadRslot => -libc::EBUSY,
        MdbError::BadDbi => -libc::ESTALE,
        status => -status.code(),
    }
}

/// Statuses caused by momentary pressure on engine resources
fn is_transient(status: MdbError) -> bool {
    matches!(
        status,
        MdbError::MapResized
            | MdbError::PageFull
            | MdbError::TxnFull
            | MdbError::CursorFull
            | MdbError::BadRslot
            | MdbError::ReadersFull
    )
}

/// Error policy bound to one environment
#[derive(Debug, Clone, Copy)]
pub struct ErrorPolicy<'e> {
    env: &'e Environment,
    map_size_max: usize,
}

impl<'e> ErrorPolicy<'e> {
    pub fn new(env: &'e Environment, map_size_max: usize) -> Self {
        ErrorPolicy { env, map_size_max }
    }

    /// Evaluate an engine status.
    ///
    /// `NotFound` and `KeyExist` fail without touching `txn`. Every other
    /// failure aborts `txn` first. `MapFull` retries when the map could be
    /// doubled within the maximum.
    pub fn evaluate(&self, status: Option<MdbError>, txn: Option<&mut Transaction<'_>>) -> Verdict {
        let Some(status) = status else {
            return Verdict::SUCCESS;
        };
        let errno = errno_for(status);
        let verdict = |safety| Verdict {
            safety,
            errno,
            status: Some(status),
        };

        match status {
            MdbError::NotFound | MdbError::KeyExist => verdict(Safety::Fail),
            status if is_transient(status) => {
                abort(txn);
                debug!("transient engine status {} ({})", status.code(), status);
                verdict(Safety::Retry)
            }
            MdbError::MapFull => {
                abort(txn);
                if self.expand() {
                    verdict(Safety::Retry)
                } else {
                    error!("map size expansion failed");
                    verdict(Safety::Fail)
                }
            }
            status => {
                abort(txn);
                error!("engine failure {} ({})", status.code(), status);
                verdict(Safety::Fail)
            }
        }
    }

    /// Evaluate an engine status, turning a retry into a failure once
    /// `budget` is spent.
    pub fn evaluate_with_budget(
        &self,
        status: Option<MdbError>,
        txn: Option<&mut Transaction<'_>>,
        budget: &mut RetryBudget,
    ) -> Verdict {
        let mut verdict = self.evaluate(status, txn);
        if verdict.is_retry() {
            if budget.spend() {
                warn!(
                    "retrying after {} ({} retries left)",
                    verdict.status.map_or(0, |s| s.code()),
                    budget.remaining()
                );
            } else {
                warn!("retry budget exhausted after {} retries", budget.attempts());
                verdict.safety = Safety::Fail;
            }
        }
        verdict
    }

    /// Double the map size unless that goes past the maximum.
    fn expand(&self) -> bool {
        let current = self.env.map_size();
        let desired = current.saturating_mul(2);
        if desired > self.map_size_max {
            warn!(
                "desired map size {} exceeds max {}",
                desired, self.map_size_max
            );
            return false;
        }
        match self.env.set_map_size(desired) {
            Ok(()) => {
                info!("map size expanded from {} to {} bytes", current, desired);
                true
            }
            Err(err) => {
                error!("set map size to {} failed: {}", desired, err);
                false
            }
        }
    }
}

fn abort(txn: Option<&mut Transaction<'_>>) {
    if let Some(txn) = txn {
        txn.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [MdbError; 21] = [
        MdbError::KeyExist,
        MdbError::NotFound,
        MdbError::PageNotFound,
        MdbError::Corrupted,
        MdbError::Panic,
        MdbError::VersionMismatch,
        MdbError::Invalid,
        MdbError::MapFull,
        MdbError::DbsFull,
        MdbError::ReadersFull,
        MdbError::TlsFull,
        MdbError::TxnFull,
        MdbError::CursorFull,
        MdbError::PageFull,
        MdbError::MapResized,
        MdbError::Incompatible,
        MdbError::BadRslot,
        MdbError::BadTxn,
        MdbError::BadValSize,
        MdbError::BadDbi,
        MdbError::Other(libc::EACCES),
    ];

    #[test]
    fn test_errno_table() {
        assert_eq!(errno_for(MdbError::NotFound), -libc::ENOENT);
        assert_eq!(errno_for(MdbError::KeyExist), -libc::EEXIST);
        assert_eq!(errno_for(MdbError::MapFull), -libc::ENOSPC);
        assert_eq!(errno_for(MdbError::DbsFull), -libc::ENOSPC);
        assert_eq!(errno_for(MdbError::ReadersFull), -libc::EAGAIN);
        assert_eq!(errno_for(MdbError::TxnFull), -libc::EOVERFLOW);
        assert_eq!(errno_for(MdbError::Incompatible), -libc::EPROTO);
        assert_eq!(errno_for(MdbError::Corrupted), -libc::EIO);
        assert_eq!(errno_for(MdbError::BadRslot), -libc::EBUSY);
        assert_eq!(errno_for(MdbError::BadDbi), -libc::ESTALE);
    }

    #[test]
    fn test_unmapped_status_passes_through_negated() {
        assert_eq!(errno_for(MdbError::Other(libc::EACCES)), -libc::EACCES);
        assert_eq!(errno_for(MdbError::TlsFull), 30789);
    }

    #[test]
    fn test_transient_set() {
        let transient: Vec<_> = ALL.iter().copied().filter(|s| is_transient(*s)).collect();
        assert_eq!(
            transient,
            vec![
                MdbError::ReadersFull,
                MdbError::TxnFull,
                MdbError::CursorFull,
                MdbError::PageFull,
                MdbError::MapResized,
                MdbError::BadRslot,
            ]
        );
    }

    #[test]
    fn test_retry_budget_spends_down() {
        let mut budget = RetryBudget::new(2);
        assert!(budget.spend());
        assert!(budget.spend());
        assert!(!budget.spend());
        assert_eq!(budget.attempts(), 2);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_fail_verdict_errors() {
        let verdict = Verdict {
            safety: Safety::Fail,
            errno: errno_for(MdbError::KeyExist),
            status: Some(MdbError::KeyExist),
        };
        assert!(matches!(verdict.into_error(), Error::Conflict));
    }

    #[test]
    fn test_public_errors_carry_table_errno() {
        // Errors built without a policy verdict report the same errno
        for status in ALL {
            assert_eq!(Error::from(status).errno(), errno_for(status), "{:?}", status);
        }
    }
}
