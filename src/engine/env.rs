use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use log::{debug, info, warn};
use memmap2::{Mmap, MmapMut};

use crate::constants::{
    EnvFlags, TransactionFlags, DATA_FILE, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS,
    LOCK_FILE, LOCK_SUFFIX, META_PAGES, PAGE_SIZE,
};
use crate::error::MdbError;

use super::meta::{self, EnvInfo, MetaHeader, Stat, META_SIZE};
use super::tree::{DbTree, SpaceBudget};
use super::txn::{ReaderSlot, Transaction, TxnState};
use super::{Dbi, Result};

/// Committed state seen by transactions
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    /// Transaction ID that produced this state
    pub(crate) txnid: u64,
    /// Named databases, indexed by handle minus the core databases.
    /// Shared with readers; a writer copies a tree only when it changes it.
    pub(crate) dbs: Vec<Arc<DbTree>>,
    /// File offset of the encoded payload
    pub(crate) payload_offset: usize,
    /// Encoded payload size
    pub(crate) payload_len: usize,
    /// Length of the data file
    pub(crate) image_len: usize,
}

/// State owned by the single writer
#[derive(Debug, Default)]
pub(crate) struct WriterState {
    /// Data file, absent for read-only environments
    data_file: Option<File>,
    /// Writable map of the data file
    map: Option<MmapMut>,
}

/// Storage environment
#[derive(Debug)]
pub struct Environment {
    /// Path to the data file
    path: Option<PathBuf>,
    /// Environment flags
    flags: EnvFlags,
    /// Page size
    page_size: usize,
    /// Maximum number of named databases
    max_dbs: u32,
    /// Maximum number of readers
    max_readers: u32,
    /// Current map size
    map_size: AtomicUsize,
    /// Number of readers
    pub(crate) num_readers: AtomicU32,
    /// Lock file, held while the environment is open
    lock_file: Option<File>,
    /// Writer lock and the files it writes
    writer: Mutex<WriterState>,
    /// Last committed snapshot
    committed: RwLock<Arc<Snapshot>>,
    /// Handles opened through committed transactions and not closed since
    handles: Mutex<BTreeSet<Dbi>>,
}

impl Environment {
    /// Create an environment handle. It must be opened before use.
    pub fn create() -> Result<Self> {
        Ok(Environment {
            path: None,
            flags: EnvFlags::empty(),
            page_size: PAGE_SIZE,
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
            map_size: AtomicUsize::new(DEFAULT_MAP_SIZE),
            num_readers: AtomicU32::new(0),
            lock_file: None,
            writer: Mutex::new(WriterState::default()),
            committed: RwLock::new(Arc::new(Snapshot::default())),
            handles: Mutex::new(BTreeSet::new()),
        })
    }

    /// Set the maximum number of named databases. Only before `open`.
    pub fn set_max_dbs(&mut self, dbs: u32) -> Result<()> {
        if self.is_open() {
            return Err(MdbError::Other(libc::EINVAL));
        }
        self.max_dbs = dbs;
        Ok(())
    }

    /// Set the maximum number of concurrent readers. Only before `open`.
    pub fn set_max_readers(&mut self, readers: u32) -> Result<()> {
        if self.is_open() || readers == 0 {
            return Err(MdbError::Other(libc::EINVAL));
        }
        self.max_readers = readers;
        Ok(())
    }

    /// Set the map size.
    ///
    /// Zero keeps the current size. The size never drops below the data
    /// already committed. Fails while a write transaction is active.
    pub fn set_map_size(&self, size: usize) -> Result<()> {
        let _writer = match self.writer.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(MdbError::Other(libc::EINVAL)),
            Err(TryLockError::Poisoned(_)) => return Err(MdbError::Panic),
        };

        let size = if size == 0 { self.map_size() } else { size };
        let floor = self.snapshot()?.image_len;
        let size = size.max(floor);
        self.map_size.store(size, Ordering::SeqCst);
        debug!("map size set to {}", size);
        Ok(())
    }

    /// Open the environment at `path` with file `mode`.
    ///
    /// `path` is a directory holding the data and lock files, or the data
    /// file itself with `NOSUBDIR`.
    pub fn open<P: AsRef<Path>>(&mut self, path: P, flags: EnvFlags, mode: u32) -> Result<()> {
        if self.is_open() {
            return Err(MdbError::Other(libc::EINVAL));
        }

        let path = path.as_ref();
        let (data_path, lock_path) = if flags.contains(EnvFlags::NOSUBDIR) {
            let mut lock = OsString::from(path.as_os_str());
            lock.push(LOCK_SUFFIX);
            (path.to_path_buf(), PathBuf::from(lock))
        } else {
            (path.join(DATA_FILE), path.join(LOCK_FILE))
        };
        let readonly = flags.contains(EnvFlags::RDONLY);

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(&lock_path)?;
        lock_env(&lock_file, readonly)?;

        let mut options = OpenOptions::new();
        options.read(true);
        if !readonly {
            options.write(true).create(true).mode(mode);
        }
        let data_file = options.open(&data_path)?;
        let file_size = data_file.metadata()?.len() as usize;

        let snapshot = if file_size == 0 {
            Snapshot::default()
        } else {
            self.read_image(&data_file, file_size)?
        };
        let fresh = file_size == 0;

        self.flags = flags;
        self.path = Some(data_path);
        self.lock_file = Some(lock_file);
        *self.committed.write().map_err(|_| MdbError::Panic)? = Arc::new(snapshot);
        {
            let writer = self.writer.get_mut().map_err(|_| MdbError::Panic)?;
            writer.data_file = if readonly { None } else { Some(data_file) };
            writer.map = None;
        }

        if fresh && !readonly {
            // Initialize meta pages of a new data file
            let live = self.snapshot()?;
            let mut next = (*live).clone();
            let (flags, page_size, map_size) = (self.flags, self.page_size, self.map_size());
            let writer = self.writer.get_mut().map_err(|_| MdbError::Panic)?;
            Self::write_image(flags, page_size, map_size, writer, &live, &mut next)?;
            *self.committed.get_mut().map_err(|_| MdbError::Panic)? = Arc::new(next);
        }

        info!(
            "environment opened at {} (map size {}, max dbs {}, max readers {})",
            path.display(),
            self.map_size(),
            self.max_dbs,
            self.max_readers
        );
        Ok(())
    }

    /// Read an existing data file, starting from the newest meta page whose
    /// header and payload both validate.
    fn read_image(&self, data_file: &File, file_size: usize) -> Result<Snapshot> {
        if file_size < META_SIZE {
            return Err(MdbError::Invalid);
        }
        let map = unsafe { Mmap::map(data_file)? };

        let mut newest: Option<(MetaHeader, Vec<DbTree>)> = None;
        let mut first_err = None;
        for page in 0..META_PAGES {
            match self.read_meta(&map, page) {
                Ok((meta, dbs)) => {
                    if newest.as_ref().map_or(true, |(best, _)| meta.txnid > best.txnid) {
                        newest = Some((meta, dbs));
                    }
                }
                Err(err) => {
                    debug!("meta page {} rejected: {}", page, err);
                    if err != MdbError::Invalid && first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        let (meta, dbs) = newest.ok_or(first_err.unwrap_or(MdbError::Invalid))?;

        // Keep the larger of the configured and the recorded map size
        if meta.mapsize as usize > self.map_size() {
            self.map_size.store(meta.mapsize as usize, Ordering::SeqCst);
        }

        Ok(Snapshot {
            txnid: meta.txnid,
            dbs: dbs.into_iter().map(Arc::new).collect(),
            payload_offset: meta.payload_offset as usize,
            payload_len: meta.payload_len as usize,
            image_len: file_size,
        })
    }

    fn read_meta(&self, map: &[u8], page: usize) -> Result<(MetaHeader, Vec<DbTree>)> {
        let at = page * self.page_size;
        let meta = MetaHeader::decode(map.get(at..).ok_or(MdbError::Invalid)?)?;
        if meta.page_size as usize != self.page_size {
            return Err(MdbError::Invalid);
        }

        let start = meta.payload_offset as usize;
        if meta.payload_len > 0 && start < META_PAGES * self.page_size {
            return Err(MdbError::Corrupted);
        }
        let end = start
            .checked_add(meta.payload_len as usize)
            .filter(|end| *end <= map.len())
            .ok_or(MdbError::Corrupted)?;
        let dbs = meta::decode_payload(&meta, &map[start..end])?;
        Ok((meta, dbs))
    }

    /// Write `next` through the map of the data file.
    ///
    /// The payload goes where it does not overlap the one `live` points at,
    /// and is flushed before the header for `next.txnid` lands in its meta
    /// page. A crash at any point leaves the previous header and payload
    /// intact.
    pub(crate) fn write_image(
        flags: EnvFlags,
        page_size: usize,
        map_size: usize,
        writer: &mut WriterState,
        live: &Snapshot,
        next: &mut Snapshot,
    ) -> Result<()> {
        let payload = meta::encode_payload(&next.dbs);
        let offset = meta::place_payload(live.payload_offset, live.payload_len, payload.len(), page_size);
        let len = meta::payload_end(offset, payload.len(), page_size)
            .max(meta::payload_end(live.payload_offset, live.payload_len, page_size));
        if len > map_size {
            return Err(MdbError::MapFull);
        }

        let data_file = writer.data_file.as_ref().ok_or(MdbError::Other(libc::EACCES))?;
        if writer.map.as_ref().map_or(true, |map| map.len() != len) {
            writer.map = None;
            data_file.set_len(len as u64)?;
            writer.map = Some(unsafe { MmapMut::map_mut(data_file)? });
        }
        let map = writer.map.as_mut().ok_or(MdbError::Panic)?;

        map[offset..offset + payload.len()].copy_from_slice(&payload);
        let sync = !flags.contains(EnvFlags::NOSYNC);
        if sync && !payload.is_empty() {
            map.flush_range(offset, payload.len())?;
        }

        let mut header = MetaHeader::new(page_size, next.dbs.len(), next.txnid, map_size);
        header.payload_offset = offset as u64;
        header.payload_len = payload.len() as u64;
        header.checksum = crc32fast::hash(&payload);
        let at = meta::meta_page(next.txnid) * page_size;
        map[at..at + META_SIZE].copy_from_slice(&header.encode());
        if sync {
            map.flush_range(at, page_size)?;
        }

        next.payload_offset = offset;
        next.payload_len = payload.len();
        next.image_len = len;
        Ok(())
    }

    /// Begin a transaction. `RDONLY` begins a reader.
    pub fn begin_txn(&self, flags: TransactionFlags) -> Result<Transaction<'_>> {
        if !self.is_open() {
            return Err(MdbError::Other(libc::EINVAL));
        }

        if flags.contains(TransactionFlags::RDONLY) {
            let slot = ReaderSlot::acquire(&self.num_readers, self.max_readers)?;
            let snapshot = self.snapshot()?;
            return Ok(Transaction::new(self, flags, TxnState::Read { snapshot, _slot: slot }));
        }

        if self.flags.contains(EnvFlags::RDONLY) {
            return Err(MdbError::Other(libc::EACCES));
        }

        let writer = self.writer.lock().map_err(|_| MdbError::Panic)?;
        // Trees are shared until the writer first changes them
        let mut working = (*self.snapshot()?).clone();
        working.txnid += 1;
        let space = SpaceBudget {
            used: working.payload_len,
            limit: (self.map_size() / self.page_size).saturating_sub(META_PAGES) * self.page_size,
        };
        Ok(Transaction::new(
            self,
            flags,
            TxnState::Write {
                working,
                space,
                created: Vec::new(),
                writer,
            },
        ))
    }

    /// Publish a committed write transaction.
    pub(crate) fn commit_write(
        &self,
        writer: &mut MutexGuard<'_, WriterState>,
        mut working: Snapshot,
        created: Vec<Dbi>,
    ) -> Result<()> {
        let live = self.snapshot()?;
        Self::write_image(self.flags, self.page_size, self.map_size(), writer, &live, &mut working)?;
        let txnid = working.txnid;
        *self.committed.write().map_err(|_| MdbError::Panic)? = Arc::new(working);
        self.handles
            .lock()
            .map_err(|_| MdbError::Panic)?
            .extend(created);
        debug!("txn {} committed", txnid);
        Ok(())
    }

    /// Close a database handle. Later use of the handle fails with `BadDbi`.
    pub fn dbi_close(&self, dbi: Dbi) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.remove(&dbi);
        }
    }

    pub(crate) fn is_handle_open(&self, dbi: Dbi) -> Result<bool> {
        Ok(self.handles.lock().map_err(|_| MdbError::Panic)?.contains(&dbi))
    }

    pub(crate) fn register_handle(&self, dbi: Dbi) -> Result<()> {
        self.handles.lock().map_err(|_| MdbError::Panic)?.insert(dbi);
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Result<Arc<Snapshot>> {
        Ok(self.committed.read().map_err(|_| MdbError::Panic)?.clone())
    }

    /// Environment information
    pub fn info(&self) -> Result<EnvInfo> {
        let snapshot = self.snapshot()?;
        let pages = snapshot.image_len.max(META_PAGES * self.page_size) / self.page_size;
        Ok(EnvInfo {
            map_size: self.map_size(),
            last_pgno: pages - 1,
            last_txnid: snapshot.txnid,
            max_readers: self.max_readers,
            num_readers: self.num_readers.load(Ordering::SeqCst),
        })
    }

    /// Environment statistics
    pub fn stat(&self) -> Result<Stat> {
        let snapshot = self.snapshot()?;
        Ok(Stat {
            psize: self.page_size as u32,
            leaf_pages: snapshot.payload_len.div_ceil(self.page_size),
            databases: snapshot.dbs.len(),
            entries: snapshot.dbs.iter().map(|db| db.len()).sum(),
        })
    }

    /// Close the environment, releasing the map and both files.
    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }
        if let Ok(writer) = self.writer.get_mut() {
            if let Some(map) = writer.map.take() {
                if !self.flags.contains(EnvFlags::NOSYNC) {
                    if let Err(err) = map.flush() {
                        warn!("final flush failed: {}", err);
                    }
                }
            }
            writer.data_file = None;
        }
        if let Ok(handles) = self.handles.get_mut() {
            handles.clear();
        }
        if let Ok(committed) = self.committed.get_mut() {
            *committed = Arc::new(Snapshot::default());
        }
        self.lock_file = None;
        if let Some(path) = self.path.take() {
            info!("environment closed at {}", path.display());
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.path.is_some()
    }

    #[inline]
    pub fn map_size(&self) -> usize {
        self.map_size.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max_dbs(&self) -> u32 {
        self.max_dbs
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Path to the data file
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.close();
    }
}

/// Take the lock file for this process: exclusive for writers, shared for
/// read-only environments. Fails at once if another holder conflicts.
fn lock_env(lock_file: &File, readonly: bool) -> Result<()> {
    let mode = if readonly { libc::LOCK_SH } else { libc::LOCK_EX };
    let result = unsafe { libc::flock(lock_file.as_raw_fd(), mode | libc::LOCK_NB) };
    if result != 0 {
        let err = io::Error::last_os_error();
        warn!("lock file busy: {}", err);
        return Err(err.into());
    }
    Ok(())
}
