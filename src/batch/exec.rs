use std::ops::Range;

use log::debug;

use crate::dbi::DbiRegistry;
use crate::engine::Transaction;
use crate::error::{Error, MdbError, Result};

use super::op::{Descriptor, OpKind, Operation, Source};
use super::resolve::{Produced, View};

/// Why an attempt stopped before finishing its operations
#[derive(Debug)]
pub(crate) enum Failure {
    /// An engine call failed; the status still needs the error policy
    Engine { index: usize, status: MdbError },
    /// The batch itself is malformed
    Invalid(Error),
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        Failure::Invalid(err)
    }
}

fn engine(index: usize) -> impl Fn(MdbError) -> Failure {
    move |status| Failure::Engine { index, status }
}

/// Bounded copy space for GET results of read-write batches
#[derive(Debug)]
pub(crate) struct Scratch {
    buf: Vec<u8>,
    capacity: usize,
}

impl Scratch {
    pub(crate) fn new(capacity: usize) -> Self {
        Scratch {
            buf: Vec::new(),
            capacity,
        }
    }

    /// Copy `bytes` in, failing rather than truncating once the space runs out.
    fn store(&mut self, bytes: &[u8]) -> Result<Range<usize>> {
        let available = self.capacity - self.buf.len();
        if bytes.len() > available {
            return Err(Error::ScratchExhausted {
                needed: bytes.len(),
                available,
            });
        }
        let start = self.buf.len();
        self.buf.extend_from_slice(bytes);
        Ok(start..self.buf.len())
    }
}

/// Results of an executed batch, indexed by operation position
#[derive(Debug, Default)]
pub struct BatchResults {
    arena: Vec<u8>,
    /// Where in `arena` each GET without a destination buffer landed
    spans: Vec<Option<Range<usize>>>,
    /// Recorded value size of each GET
    sizes: Vec<Option<usize>>,
}

impl BatchResults {
    /// Value returned by the GET at `index`, when it had no destination buffer
    pub fn value(&self, index: usize) -> Option<&[u8]> {
        let span = self.spans.get(index)?.clone()?;
        self.arena.get(span)
    }

    /// Size of the value returned by the GET at `index`
    pub fn size(&self, index: usize) -> Option<usize> {
        self.sizes.get(index).copied().flatten()
    }

    /// Number of executed operations
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// Run the GETs of a read-only batch.
///
/// GET results stay in engine memory while the attempt runs and are copied
/// into the returned results before the transaction can end.
pub(crate) fn run_read<'t>(
    txn: &'t Transaction<'_>,
    ops: &mut [Operation<'_>],
    dbis: &DbiRegistry,
) -> std::result::Result<BatchResults, Failure> {
    let mut produced: Vec<Option<Produced<'t>>> = Vec::with_capacity(ops.len());

    for index in 0..ops.len() {
        let op = &ops[index];
        if op.kind != OpKind::Get {
            return Err(Error::InvalidArgument("write operation in read-only batch").into());
        }
        let handle = dbis.get(op.dbi)?.handle;

        let value = {
            let view = View {
                ops,
                produced: &produced,
                scratch: &[],
            };
            let key = view.resolve(index, Source::Key)?;
            debug!("op {}: get from dbi {} ({} byte key)", index, handle, key.len());
            txn.get(handle, key).map_err(engine(index))?
        };

        let slot = match copy_to_destination(&mut ops[index].value, value)? {
            Some(copied) => copied,
            None => Produced::Borrowed(value),
        };
        produced.push(Some(slot));
    }

    let mut results = BatchResults::default();
    for produced in &produced {
        let (span, size) = match produced {
            Some(Produced::Borrowed(bytes)) => {
                let start = results.arena.len();
                results.arena.extend_from_slice(bytes);
                (Some(start..results.arena.len()), Some(bytes.len()))
            }
            Some(Produced::Copied(len)) => (None, Some(*len)),
            _ => (None, None),
        };
        results.spans.push(span);
        results.sizes.push(size);
    }
    Ok(results)
}

/// Run every operation of a read-write batch.
///
/// GET results are copied into `scratch`, since later writes in the same
/// transaction may invalidate engine memory.
pub(crate) fn run_write(
    txn: &mut Transaction<'_>,
    ops: &mut [Operation<'_>],
    dbis: &DbiRegistry,
    mut scratch: Scratch,
) -> std::result::Result<BatchResults, Failure> {
    let mut produced: Vec<Option<Produced<'static>>> = Vec::with_capacity(ops.len());

    for index in 0..ops.len() {
        let op = &ops[index];
        let dbi = dbis.get(op.dbi)?;
        let view = View {
            ops,
            produced: &produced,
            scratch: &scratch.buf,
        };
        let key = view.resolve(index, Source::Key)?;

        let slot = match op.kind {
            OpKind::Put => {
                let value = view.resolve(index, Source::Value)?;
                debug!(
                    "op {}: put to dbi {} ({} byte key, {} byte value)",
                    index,
                    dbi.handle,
                    key.len(),
                    value.len()
                );
                txn.put(dbi.handle, key, value, dbi.put_flags)
                    .map_err(engine(index))?;
                None
            }
            OpKind::Del => {
                let value = match op.value {
                    Descriptor::None => None,
                    _ => Some(view.resolve(index, Source::Value)?),
                };
                debug!("op {}: del from dbi {}", index, dbi.handle);
                txn.del(dbi.handle, key, value).map_err(engine(index))?;
                None
            }
            OpKind::Get => {
                debug!("op {}: get from dbi {} ({} byte key)", index, dbi.handle, key.len());
                let value = txn.get(dbi.handle, key).map_err(engine(index))?;
                let slot = match copy_to_destination(&mut ops[index].value, value)? {
                    Some(copied) => copied,
                    None => Produced::Scratch(scratch.store(value)?),
                };
                Some(slot)
            }
        };
        produced.push(slot);
    }

    let mut results = BatchResults {
        arena: Vec::new(),
        spans: Vec::with_capacity(ops.len()),
        sizes: Vec::with_capacity(ops.len()),
    };
    for produced in produced {
        let (span, size) = match produced {
            Some(Produced::Scratch(range)) => {
                let len = range.len();
                (Some(range), Some(len))
            }
            Some(Produced::Copied(len)) => (None, Some(len)),
            _ => (None, None),
        };
        results.spans.push(span);
        results.sizes.push(size);
    }
    results.arena = scratch.buf;
    Ok(results)
}

/// Copy a GET result into the caller's buffer, if the operation has one.
fn copy_to_destination(
    destination: &mut Descriptor<'_>,
    value: &[u8],
) -> Result<Option<Produced<'static>>> {
    match destination {
        Descriptor::Buffer(buf) => {
            if buf.len() < value.len() {
                return Err(Error::BufferTooSmall {
                    needed: value.len(),
                    available: buf.len(),
                });
            }
            buf[..value.len()].copy_from_slice(value);
            Ok(Some(Produced::Copied(value.len())))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_never_truncates() {
        let mut scratch = Scratch::new(8);
        assert_eq!(scratch.store(b"abcd").unwrap(), 0..4);
        assert_eq!(scratch.store(b"efg").unwrap(), 4..7);
        match scratch.store(b"hi") {
            Err(Error::ScratchExhausted { needed, available }) => {
                assert_eq!(needed, 2);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(scratch.buf, b"abcdefg");
    }

    #[test]
    fn test_destination_buffer_checks_size() {
        let mut small = [0u8; 2];
        let mut dest = Descriptor::Buffer(&mut small);
        assert!(matches!(
            copy_to_destination(&mut dest, b"abc"),
            Err(Error::BufferTooSmall { needed: 3, available: 2 })
        ));

        let mut big = [0u8; 8];
        let mut dest = Descriptor::Buffer(&mut big);
        assert!(matches!(
            copy_to_destination(&mut dest, b"abc"),
            Ok(Some(Produced::Copied(3)))
        ));
        assert!(matches!(copy_to_destination(&mut Descriptor::None, b"abc"), Ok(None)));
    }
}
