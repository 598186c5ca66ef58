// src/lib.rs
//! Embedded transactional key-value store.
//!
//! Operations are queued into a [`Batch`] and executed in one transaction
//! with bounded retries. Every engine status goes through the
//! [`ErrorPolicy`], which decides whether to proceed, retry or fail.

pub mod batch;
pub mod config;
pub mod constants;
pub mod dbi;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod policy;
pub mod segments;
pub mod store;

pub use batch::{Batch, BatchResults, Descriptor, Lookup, OpKind, Source};
pub use config::{Config, RetryBudgets};
pub use constants::{DbFlags, DbiType, EnvFlags, TransactionFlags, WriteFlags, DEFAULT_ENV_MODE};
pub use dbi::{DbiDecl, DbiDescriptor, DbiRegistry};
pub use engine::{Dbi, EnvInfo, Environment, Stat, Transaction};
pub use error::{Error, ErrorKind, MdbError, Result};
pub use policy::{ErrorPolicy, RetryBudget, Safety, Verdict};
pub use segments::Segments;
pub use store::{Metrics, Store};
