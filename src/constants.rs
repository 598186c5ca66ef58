use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        const NOSUBDIR = 0x4000;
        const NOSYNC = 0x10000;
        const RDONLY = 0x20000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        const DUPSORT = 0x04;
        const DUPFIXED = 0x10;
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
        const NODUPDATA = 0x20;
        const APPEND = 0x20000;
        const APPENDDUP = 0x40000;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransactionFlags: u32 {
        // Reuse environment flags
        const RDONLY = EnvFlags::RDONLY.bits();
    }
}

bitflags! {
    /// Logical type of a named sub-database, as declared by the caller.
    ///
    /// The empty set is the default type: overwriting puts, unique keys.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbiType: u32 {
        /// Reject puts on existing keys.
        const NOOVERWRITE = 1 << 0;
        /// Sorted duplicate values per key.
        const DUPSORT = 1 << 1;
        /// Duplicates share one fixed size. Requires `DUPSORT`.
        const DUPFIXED = 1 << 2;
        /// Append-only inserts with strictly increasing keys.
        const APPENDABLE = 1 << 3;
    }
}

// Page and version constants
pub const PAGE_SIZE: usize = 4096;
/// Magic number for data files
pub const MDB_MAGIC: u32 = 0xBEEF_DEAD;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 9;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 70;
/// Core database identifiers reserved by the engine
pub const CORE_DBS: u32 = 2;
/// Meta pages at the start of the data file; commits alternate between them
pub const META_PAGES: usize = 2;

pub const DEFAULT_MAX_KEY_SIZE: usize = 511;
pub const DEFAULT_MAX_READERS: u32 = 126;

/// Data file name inside the environment directory
pub const DATA_FILE: &str = "data.mdb";
/// Lock file name inside the environment directory
pub const LOCK_FILE: &str = "lock.mdb";
/// Lock file suffix when the environment path is the data file itself
pub const LOCK_SUFFIX: &str = "-lock";

pub const KIB: usize = 1024;
pub const MIB: usize = KIB * 1024;
pub const GIB: usize = MIB * 1024;

/// Initial map size
pub const DEFAULT_MAP_SIZE: usize = 256 * MIB;
/// Upper bound for map size expansion
pub const DEFAULT_MAP_SIZE_MAX: usize = GIB;
/// Maximum named sub-databases
pub const DEFAULT_MAX_DBS: u32 = 16;

pub const DEFAULT_RETRY_TXN: usize = 2;
pub const DEFAULT_RETRY_DBI_OPEN: usize = 3;
pub const DEFAULT_RETRY_DBI_FLAGS: usize = 3;
pub const DEFAULT_RETRY_BATCH: usize = 3;

/// Operations held by one batch
pub const DEFAULT_BATCH_CAPACITY: usize = 8;
/// Scratch bytes available to read-write GET results
pub const DEFAULT_SCRATCH_SIZE: usize = 64 * KIB;

/// Owner-only mode for the data and lock files
pub const DEFAULT_ENV_MODE: u32 = 0o600;
