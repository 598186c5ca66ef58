use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::convert::TryInto;

use crate::constants::{DbFlags, MDB_MAGIC, META_PAGES, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH};
use crate::error::MdbError;

use super::tree::DbTree;
use super::Result;

/// Packed library version stored in every meta header
pub(crate) const MDB_VERSION: u32 = VERSION_MAJOR << 24 | VERSION_MINOR << 16 | VERSION_PATCH;

/// Encoded size of the meta header
pub(crate) const META_SIZE: usize = 4 + 4 + 4 + 4 + 8 + 8 + 8 + 8 + 4 + 4;

/// Meta header written at the start of one of the meta pages
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MetaHeader {
    /// Magic number identifying the data file
    pub(crate) magic: u32,
    /// Version number
    pub(crate) version: u32,
    /// Page size for this environment
    pub(crate) page_size: u32,
    /// Number of named databases in the payload
    pub(crate) num_dbs: u32,
    /// txnid that committed this image
    pub(crate) txnid: u64,
    /// Size of mmap region when committed
    pub(crate) mapsize: u64,
    /// File offset of the payload
    pub(crate) payload_offset: u64,
    /// Payload length in bytes
    pub(crate) payload_len: u64,
    /// CRC-32 of the payload
    pub(crate) checksum: u32,
}

/// Environment information matching MDB_envinfo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    /// Size of the data memory map
    pub map_size: usize,
    /// ID of the last used page
    pub last_pgno: usize,
    /// ID of the last committed transaction
    pub last_txnid: u64,
    /// Max reader slots in the environment
    pub max_readers: u32,
    /// Reader slots in use
    pub num_readers: u32,
}

/// Environment statistics matching MDB_stat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Size of a database page
    pub psize: u32,
    /// Number of pages holding data
    pub leaf_pages: usize,
    /// Number of named databases
    pub databases: usize,
    /// Number of key/data pairs across all named databases
    pub entries: usize,
}

/// `len` rounded up to whole pages
pub(crate) fn page_align(len: usize, page_size: usize) -> usize {
    len.div_ceil(page_size) * page_size
}

/// End of the data file region used by a payload, never inside the meta pages.
pub(crate) fn payload_end(offset: usize, len: usize, page_size: usize) -> usize {
    let meta_end = META_PAGES * page_size;
    if len == 0 {
        return meta_end;
    }
    meta_end.max(offset + page_align(len, page_size))
}

/// Offset for a new payload of `new_len` bytes that leaves the live payload
/// at `live_offset..live_offset + live_len` untouched.
///
/// The new payload goes right after the meta pages when it fits in front of
/// the live one, and right after the live payload otherwise.
pub(crate) fn place_payload(
    live_offset: usize,
    live_len: usize,
    new_len: usize,
    page_size: usize,
) -> usize {
    let start = META_PAGES * page_size;
    if live_len == 0 || start + page_align(new_len, page_size) <= live_offset {
        return start;
    }
    payload_end(live_offset, live_len, page_size)
}

/// Meta page written by transaction `txnid`
pub(crate) fn meta_page(txnid: u64) -> usize {
    (txnid % META_PAGES as u64) as usize
}

impl MetaHeader {
    pub(crate) fn new(page_size: usize, num_dbs: usize, txnid: u64, mapsize: usize) -> Self {
        MetaHeader {
            magic: MDB_MAGIC,
            version: MDB_VERSION,
            page_size: page_size as u32,
            num_dbs: num_dbs as u32,
            txnid,
            mapsize: mapsize as u64,
            payload_offset: 0,
            payload_len: 0,
            checksum: 0,
        }
    }

    /// Encode the header followed by a CRC-32 of the encoded fields.
    pub(crate) fn encode(&self) -> [u8; META_SIZE] {
        let mut buf = [0u8; META_SIZE];
        let mut w = Writer(Vec::with_capacity(META_SIZE));
        w.u32(self.magic);
        w.u32(self.version);
        w.u32(self.page_size);
        w.u32(self.num_dbs);
        w.u64(self.txnid);
        w.u64(self.mapsize);
        w.u64(self.payload_offset);
        w.u64(self.payload_len);
        w.u32(self.checksum);
        let crc = crc32fast::hash(&w.0);
        w.u32(crc);
        buf.copy_from_slice(&w.0);
        buf
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < META_SIZE {
            return Err(MdbError::Invalid);
        }
        let mut r = Reader(&bytes[..META_SIZE]);
        let meta = MetaHeader {
            magic: r.u32()?,
            version: r.u32()?,
            page_size: r.u32()?,
            num_dbs: r.u32()?,
            txnid: r.u64()?,
            mapsize: r.u64()?,
            payload_offset: r.u64()?,
            payload_len: r.u64()?,
            checksum: r.u32()?,
        };
        let crc = r.u32()?;
        if meta.magic != MDB_MAGIC {
            return Err(MdbError::Invalid);
        }
        if meta.version != MDB_VERSION {
            return Err(MdbError::VersionMismatch);
        }
        if crc != crc32fast::hash(&bytes[..META_SIZE - 4]) {
            return Err(MdbError::Corrupted);
        }
        Ok(meta)
    }
}

/// Serialize the named databases into a payload.
pub(crate) fn encode_payload<D: Borrow<DbTree>>(dbs: &[D]) -> Vec<u8> {
    let trees = || dbs.iter().map(Borrow::<DbTree>::borrow);
    let mut w = Writer(Vec::with_capacity(trees().map(DbTree::encoded_len).sum()));
    for db in trees() {
        w.bytes(db.name.as_bytes());
        w.u32(db.flags.bits());
        w.u64(db.entries.len() as u64);
        for (key, items) in &db.entries {
            w.bytes(key);
            w.u32(items.len() as u32);
            for item in items {
                w.bytes(item);
            }
        }
    }
    w.0
}

/// Rebuild the named databases from a payload, checking it against the header.
pub(crate) fn decode_payload(meta: &MetaHeader, payload: &[u8]) -> Result<Vec<DbTree>> {
    if payload.len() as u64 != meta.payload_len {
        return Err(MdbError::Corrupted);
    }
    if crc32fast::hash(payload) != meta.checksum {
        return Err(MdbError::Corrupted);
    }

    let mut r = Reader(payload);
    let mut dbs = Vec::with_capacity(meta.num_dbs as usize);
    for _ in 0..meta.num_dbs {
        let name = std::str::from_utf8(r.bytes()?).map_err(|_| MdbError::Corrupted)?;
        let flags = DbFlags::from_bits(r.u32()?).ok_or(MdbError::Corrupted)?;
        let num_keys = r.u64()?;
        let mut entries = BTreeMap::new();
        for _ in 0..num_keys {
            let key = r.bytes()?.to_vec();
            let num_items = r.u32()?;
            let items = (0..num_items)
                .map(|_| r.bytes().map(<[u8]>::to_vec))
                .collect::<Result<Vec<_>>>()?;
            entries.insert(key, items);
        }
        let mut db = DbTree::new(name, flags);
        db.entries = entries;
        dbs.push(db);
    }
    if !r.0.is_empty() {
        return Err(MdbError::Corrupted);
    }
    Ok(dbs)
}

struct Writer(Vec<u8>);

impl Writer {
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.0.extend_from_slice(v);
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.0.len() < n {
            return Err(MdbError::Corrupted);
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().map_err(|_| MdbError::Corrupted)?))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().map_err(|_| MdbError::Corrupted)?))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{WriteFlags, PAGE_SIZE};
    use crate::engine::tree::SpaceBudget;

    fn sample() -> Vec<DbTree> {
        let mut space = SpaceBudget { used: 0, limit: usize::MAX };
        let mut users = DbTree::new("users", DbFlags::empty());
        users.put(b"u1", b"alice", WriteFlags::empty(), &mut space).unwrap();
        let mut tags = DbTree::new("tags", DbFlags::DUPSORT | DbFlags::DUPFIXED);
        tags.put(b"t", b"0001", WriteFlags::empty(), &mut space).unwrap();
        tags.put(b"t", b"0002", WriteFlags::empty(), &mut space).unwrap();
        vec![users, tags]
    }

    #[test]
    fn test_payload_length_matches_tree_accounting() {
        let dbs = sample();
        let payload = encode_payload(&dbs);
        assert_eq!(payload.len(), dbs.iter().map(DbTree::encoded_len).sum::<usize>());
    }

    #[test]
    fn test_image_restores_databases() {
        let dbs = sample();
        let payload = encode_payload(&dbs);
        let mut meta = MetaHeader::new(PAGE_SIZE, dbs.len(), 7, PAGE_SIZE * 16);
        meta.payload_len = payload.len() as u64;
        meta.checksum = crc32fast::hash(&payload);

        let meta = MetaHeader::decode(&meta.encode()).unwrap();
        assert_eq!(meta.txnid, 7);
        let restored = decode_payload(&meta, &payload).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].name, "users");
        assert_eq!(restored[0].get(b"u1").unwrap(), b"alice");
        assert_eq!(restored[1].flags, DbFlags::DUPSORT | DbFlags::DUPFIXED);
        assert_eq!(restored[1].len(), 2);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let dbs = sample();
        let mut payload = encode_payload(&dbs);
        let mut meta = MetaHeader::new(PAGE_SIZE, dbs.len(), 1, PAGE_SIZE * 16);
        meta.payload_len = payload.len() as u64;
        meta.checksum = crc32fast::hash(&payload);
        let last = payload.len() - 1;
        payload[last] ^= 0xff;
        assert_eq!(decode_payload(&meta, &payload).err(), Some(MdbError::Corrupted));
    }

    #[test]
    fn test_header_validation() {
        let mut meta = MetaHeader::new(PAGE_SIZE, 0, 0, PAGE_SIZE);
        meta.magic = 0;
        assert_eq!(MetaHeader::decode(&meta.encode()), Err(MdbError::Invalid));

        let mut meta = MetaHeader::new(PAGE_SIZE, 0, 0, PAGE_SIZE);
        meta.version += 1;
        assert_eq!(MetaHeader::decode(&meta.encode()), Err(MdbError::VersionMismatch));
    }

    #[test]
    fn test_header_checksum_detects_torn_meta() {
        let mut meta = MetaHeader::new(PAGE_SIZE, 2, 3, PAGE_SIZE * 16);
        meta.payload_offset = (2 * PAGE_SIZE) as u64;
        let mut bytes = meta.encode();
        bytes[20] ^= 0x01;
        assert_eq!(MetaHeader::decode(&bytes), Err(MdbError::Corrupted));
    }

    #[test]
    fn test_payload_end_is_page_aligned() {
        assert_eq!(payload_end(0, 0, PAGE_SIZE), 2 * PAGE_SIZE);
        assert_eq!(payload_end(2 * PAGE_SIZE, 1, PAGE_SIZE), 3 * PAGE_SIZE);
        assert_eq!(payload_end(3 * PAGE_SIZE, PAGE_SIZE + 1, PAGE_SIZE), 5 * PAGE_SIZE);
    }

    #[test]
    fn test_new_payload_never_overlaps_live_one() {
        let start = 2 * PAGE_SIZE;
        // Nothing live yet
        assert_eq!(place_payload(0, 0, 100, PAGE_SIZE), start);
        // Live payload at the front: write behind it
        assert_eq!(place_payload(start, 100, 100, PAGE_SIZE), 3 * PAGE_SIZE);
        // Live payload further back with room in front
        assert_eq!(place_payload(3 * PAGE_SIZE, 100, PAGE_SIZE, PAGE_SIZE), start);
        // Not enough room in front
        assert_eq!(place_payload(3 * PAGE_SIZE, 100, PAGE_SIZE + 1, PAGE_SIZE), 4 * PAGE_SIZE);
    }

    #[test]
    fn test_meta_pages_alternate() {
        assert_eq!(meta_page(0), 0);
        assert_eq!(meta_page(1), 1);
        assert_eq!(meta_page(2), 0);
    }
}
