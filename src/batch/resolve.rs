//! Resolution of key and value descriptors within one execution attempt.

use std::ops::Range;

use crate::error::{Error, Result};

use super::op::{Descriptor, Operation, Source};

/// Bytes a GET produced during the current attempt
#[derive(Debug, Clone)]
pub(crate) enum Produced<'t> {
    /// Engine memory, valid while the read-only transaction lives
    Borrowed(&'t [u8]),
    /// Copy in the attempt's scratch arena
    Scratch(Range<usize>),
    /// Copied into the caller's destination buffer, with this length
    Copied(usize),
}

/// Everything a lookup may dereference during an attempt
pub(crate) struct View<'r, 'a> {
    pub(crate) ops: &'r [Operation<'a>],
    /// One slot per operation executed so far
    pub(crate) produced: &'r [Option<Produced<'r>>],
    pub(crate) scratch: &'r [u8],
}

impl<'r, 'a: 'r> View<'r, 'a> {
    /// Bytes of the key or value of operation `index`.
    ///
    /// Every lookup must point strictly backwards, so resolution takes at
    /// most `index` steps.
    pub(crate) fn resolve(&self, index: usize, source: Source) -> Result<&'r [u8]> {
        let op = self
            .ops
            .get(index)
            .ok_or(Error::InvalidArgument("lookup index out of range"))?;

        match source {
            Source::Key => self.descriptor(index, &op.key),
            Source::Value => match self.produced.get(index).and_then(Option::as_ref) {
                Some(produced) => self.produced_bytes(op, produced),
                None => self.descriptor(index, &op.value),
            },
        }
    }

    fn descriptor(&self, index: usize, descriptor: &'r Descriptor<'a>) -> Result<&'r [u8]> {
        match descriptor {
            Descriptor::Bytes(bytes) if bytes.is_empty() => {
                Err(Error::InvalidArgument("zero-length bytes descriptor"))
            }
            Descriptor::Bytes(bytes) => Ok(*bytes),
            Descriptor::Lookup(lookup) if lookup.index >= index => {
                Err(Error::InvalidArgument("lookup must reference an earlier operation"))
            }
            Descriptor::Lookup(lookup) => self.resolve(lookup.index, lookup.source),
            Descriptor::Buffer(_) => Err(Error::InvalidArgument("destination buffer holds no result")),
            Descriptor::None => Err(Error::InvalidArgument("descriptor resolves to no data")),
        }
    }

    fn produced_bytes(&self, op: &'r Operation<'a>, produced: &Produced<'r>) -> Result<&'r [u8]> {
        match produced {
            Produced::Borrowed(bytes) => Ok(*bytes),
            Produced::Scratch(range) => self
                .scratch
                .get(range.clone())
                .ok_or(Error::InvalidArgument("scratch range out of bounds")),
            Produced::Copied(len) => match &op.value {
                Descriptor::Buffer(buf) => buf
                    .get(..*len)
                    .ok_or(Error::InvalidArgument("buffer range out of bounds")),
                _ => Err(Error::InvalidArgument("destination buffer holds no result")),
            },
        }
    }
}
