//! Embedded storage engine.
//!
//! A compact LMDB-shaped engine: one environment per directory, named
//! sub-databases addressed by integer handles, many concurrent readers
//! pinned to committed snapshots and a single exclusive writer. Committed
//! state is written through a memory map of the data file. Commits alternate
//! between two meta pages and never overwrite the payload the live header
//! points at. Every primitive reports failures as an [`MdbError`] status.

mod env;
mod meta;
mod tree;
mod txn;

pub use env::Environment;
pub use meta::{EnvInfo, Stat};
pub use txn::Transaction;

use crate::error::MdbError;

/// Database handle
pub type Dbi = u32;

/// Result of an engine primitive
pub type Result<T> = std::result::Result<T, MdbError>;
