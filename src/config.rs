use crate::constants::{
    EnvFlags, DEFAULT_BATCH_CAPACITY, DEFAULT_MAP_SIZE, DEFAULT_MAP_SIZE_MAX, DEFAULT_MAX_DBS,
    DEFAULT_MAX_READERS, DEFAULT_RETRY_BATCH, DEFAULT_RETRY_DBI_FLAGS, DEFAULT_RETRY_DBI_OPEN,
    DEFAULT_RETRY_TXN, DEFAULT_SCRATCH_SIZE,
};
use crate::error::{Error, Result};

/// Configuration for a store
#[derive(Debug, Clone)]
pub struct Config {
    /// Map size the environment starts with (default: 256MB)
    pub map_size: usize,

    /// Map size expansion never goes past this (default: 1GB)
    pub map_size_max: usize,

    /// Maximum number of named sub-databases (default: 16)
    pub max_dbs: u32,

    /// Maximum concurrent read transactions (default: 126)
    pub max_readers: u32,

    /// Flags passed to the engine when opening the environment
    pub env_flags: EnvFlags,

    /// Retry budgets for transient engine failures
    pub retry: RetryBudgets,

    /// Operations held by one batch (default: 8)
    pub batch_capacity: usize,

    /// Bytes available for GET results of read-write batches (default: 64KB)
    pub scratch_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryBudgets {
    /// Transaction begin/commit retries during DBI setup (default: 2)
    pub txn: usize,

    /// DBI open retries (default: 3)
    pub dbi_open: usize,

    /// DBI flags query retries (default: 3)
    pub dbi_flags: usize,

    /// Whole-batch execution attempts (default: 3)
    pub batch: usize,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            txn: DEFAULT_RETRY_TXN,
            dbi_open: DEFAULT_RETRY_DBI_OPEN,
            dbi_flags: DEFAULT_RETRY_DBI_FLAGS,
            batch: DEFAULT_RETRY_BATCH,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            map_size_max: DEFAULT_MAP_SIZE_MAX,
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
            env_flags: EnvFlags::empty(),
            retry: RetryBudgets::default(),
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            scratch_size: DEFAULT_SCRATCH_SIZE,
        }
    }
}

impl Config {
    /// Set the initial map size
    pub fn with_map_size(mut self, size: usize) -> Self {
        self.map_size = size;
        self
    }

    /// Set the maximum map size reachable through expansion
    pub fn with_map_size_max(mut self, size: usize) -> Self {
        self.map_size_max = size;
        self
    }

    /// Set the maximum number of named sub-databases
    pub fn with_max_dbs(mut self, max_dbs: u32) -> Self {
        self.max_dbs = max_dbs;
        self
    }

    /// Set the maximum number of concurrent readers
    pub fn with_max_readers(mut self, max_readers: u32) -> Self {
        self.max_readers = max_readers;
        self
    }

    /// Set the environment flags
    pub fn with_env_flags(mut self, flags: EnvFlags) -> Self {
        self.env_flags = flags;
        self
    }

    /// Set the retry budgets
    pub fn with_retry(mut self, retry: RetryBudgets) -> Self {
        self.retry = retry;
        self
    }

    /// Set the batch capacity
    pub fn with_batch_capacity(mut self, capacity: usize) -> Self {
        self.batch_capacity = capacity;
        self
    }

    /// Set the scratch size for read-write GET results
    pub fn with_scratch_size(mut self, size: usize) -> Self {
        self.scratch_size = size;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.map_size == 0 || self.map_size_max == 0 {
            return Err(Error::InvalidArgument("map size cannot be zero"));
        }
        if self.map_size > self.map_size_max {
            return Err(Error::InvalidArgument("initial map size exceeds maximum"));
        }
        if self.max_readers == 0 {
            return Err(Error::InvalidArgument("max readers cannot be zero"));
        }
        if self.batch_capacity == 0 {
            return Err(Error::InvalidArgument("batch capacity cannot be zero"));
        }
        if self.retry.batch == 0 {
            return Err(Error::InvalidArgument("batch retry budget cannot be zero"));
        }
        Ok(())
    }
}
