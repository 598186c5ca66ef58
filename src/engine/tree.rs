use std::collections::BTreeMap;

use crate::constants::{DbFlags, WriteFlags, DEFAULT_MAX_KEY_SIZE};
use crate::error::MdbError;

use super::Result;

/// Encoded size of one length prefix
pub(crate) const LEN_PREFIX: usize = 4;

/// One named database: sorted keys, each with one or more sorted data items.
#[derive(Debug, Clone)]
pub(crate) struct DbTree {
    /// Database name
    pub(crate) name: String,
    /// Persistent database flags (DUPSORT, DUPFIXED)
    pub(crate) flags: DbFlags,
    /// Key to data items; a non-DUPSORT key always holds exactly one item
    pub(crate) entries: BTreeMap<Vec<u8>, Vec<Vec<u8>>>,
}

/// Byte accounting for a write transaction against the map size.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpaceBudget {
    pub(crate) used: usize,
    pub(crate) limit: usize,
}

impl SpaceBudget {
    pub(crate) fn reserve(&mut self, bytes: usize) -> Result<()> {
        let used = self.used.checked_add(bytes).ok_or(MdbError::MapFull)?;
        if used > self.limit {
            return Err(MdbError::MapFull);
        }
        self.used = used;
        Ok(())
    }

    pub(crate) fn release(&mut self, bytes: usize) {
        self.used = self.used.saturating_sub(bytes);
    }
}

impl DbTree {
    pub(crate) fn new(name: &str, flags: DbFlags) -> Self {
        DbTree {
            name: name.to_owned(),
            flags: flags & (DbFlags::DUPSORT | DbFlags::DUPFIXED),
            entries: BTreeMap::new(),
        }
    }

    #[inline]
    pub(crate) fn is_dupsort(&self) -> bool {
        self.flags.contains(DbFlags::DUPSORT)
    }

    /// Encoded size of the tree header (name and flags)
    pub(crate) fn header_len(name: &str) -> usize {
        LEN_PREFIX + name.len() + 4 + 8
    }

    /// Encoded size of a key with no data items
    fn key_len(key: &[u8]) -> usize {
        LEN_PREFIX + key.len() + LEN_PREFIX
    }

    fn item_len(data: &[u8]) -> usize {
        LEN_PREFIX + data.len()
    }

    pub(crate) fn encoded_len(&self) -> usize {
        Self::header_len(&self.name)
            + self
                .entries
                .iter()
                .map(|(k, items)| {
                    Self::key_len(k) + items.iter().map(|d| Self::item_len(d)).sum::<usize>()
                })
                .sum::<usize>()
    }

    /// Number of key/data pairs
    pub(crate) fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub(crate) fn get(&self, key: &[u8]) -> Result<&[u8]> {
        validate_key(key)?;
        self.entries
            .get(key)
            .and_then(|items| items.first())
            .map(Vec::as_slice)
            .ok_or(MdbError::NotFound)
    }

    pub(crate) fn put(
        &mut self,
        key: &[u8],
        data: &[u8],
        flags: WriteFlags,
        space: &mut SpaceBudget,
    ) -> Result<()> {
        validate_key(key)?;

        if flags.intersects(WriteFlags::APPEND | WriteFlags::APPENDDUP) {
            self.check_append(key, data, flags)?;
        }

        let dupsort = self.is_dupsort();
        match self.entries.get_mut(key) {
            Some(_) if flags.contains(WriteFlags::NOOVERWRITE) => Err(MdbError::KeyExist),
            Some(items) if dupsort => {
                if self.flags.contains(DbFlags::DUPFIXED)
                    && items.first().map_or(false, |d| d.len() != data.len())
                {
                    return Err(MdbError::BadValSize);
                }
                match items.binary_search_by(|d| d.as_slice().cmp(data)) {
                    Ok(_) if flags.contains(WriteFlags::NODUPDATA) => Err(MdbError::KeyExist),
                    // Identical pair already stored
                    Ok(_) => Ok(()),
                    Err(pos) => {
                        space.reserve(Self::item_len(data))?;
                        items.insert(pos, data.to_vec());
                        Ok(())
                    }
                }
            }
            Some(items) => {
                let old = items.first().map_or(0, Vec::len);
                if data.len() > old {
                    space.reserve(data.len() - old)?;
                } else {
                    space.release(old - data.len());
                }
                *items = vec![data.to_vec()];
                Ok(())
            }
            None => {
                space.reserve(Self::key_len(key) + Self::item_len(data))?;
                self.entries.insert(key.to_vec(), vec![data.to_vec()]);
                Ok(())
            }
        }
    }

    /// Delete `key`, or only the `data` item of `key` in a DUPSORT tree.
    pub(crate) fn del(
        &mut self,
        key: &[u8],
        data: Option<&[u8]>,
        space: &mut SpaceBudget,
    ) -> Result<()> {
        validate_key(key)?;
        let dupsort = self.is_dupsort();
        let items = self.entries.get_mut(key).ok_or(MdbError::NotFound)?;

        match data {
            Some(data) if dupsort => {
                let pos = items
                    .binary_search_by(|d| d.as_slice().cmp(data))
                    .map_err(|_| MdbError::NotFound)?;
                items.remove(pos);
                space.release(Self::item_len(data));
                if items.is_empty() {
                    self.entries.remove(key);
                    space.release(Self::key_len(key));
                }
            }
            _ => {
                let freed = items.iter().map(|d| Self::item_len(d)).sum::<usize>();
                self.entries.remove(key);
                space.release(freed + Self::key_len(key));
            }
        }
        Ok(())
    }

    fn check_append(&self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        let Some((last_key, last_items)) = self.entries.last_key_value() else {
            return Ok(());
        };
        match key.cmp(last_key.as_slice()) {
            std::cmp::Ordering::Greater => Ok(()),
            std::cmp::Ordering::Equal
                if self.is_dupsort() && flags.contains(WriteFlags::APPENDDUP) =>
            {
                match last_items.last() {
                    Some(last) if data <= last.as_slice() => Err(MdbError::KeyExist),
                    _ => Ok(()),
                }
            }
            _ => Err(MdbError::KeyExist),
        }
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > DEFAULT_MAX_KEY_SIZE {
        return Err(MdbError::BadValSize);
    }
    Ok(())
}
