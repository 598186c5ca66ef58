use crate::error::{Error, Result};

/// Kind of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Put,
    Get,
    /// Delete a key, or one key/data pair of a DUPSORT sub-database
    Del,
}

impl OpKind {
    /// Whether the operation needs a read-write transaction
    #[inline]
    pub fn is_write(self) -> bool {
        !matches!(self, OpKind::Get)
    }
}

/// Which side of an earlier operation a lookup reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Key,
    Value,
}

/// Reference to the resolved key or value of an earlier operation in the
/// same batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    pub source: Source,
    /// Position of the earlier operation, counted from the start of the batch
    pub index: usize,
}

impl Lookup {
    pub fn key(index: usize) -> Self {
        Lookup {
            source: Source::Key,
            index,
        }
    }

    pub fn value(index: usize) -> Self {
        Lookup {
            source: Source::Value,
            index,
        }
    }
}

/// Key or value of a queued operation
#[derive(Debug, Default)]
pub enum Descriptor<'a> {
    /// No bytes. For a GET value: return the result through `BatchResults`.
    #[default]
    None,
    /// Caller bytes, kept alive until the batch executes
    Bytes(&'a [u8]),
    /// Destination for the value of a GET
    Buffer(&'a mut [u8]),
    Lookup(Lookup),
}

impl<'a> Descriptor<'a> {
    pub(crate) fn lookup(&self) -> Option<Lookup> {
        match self {
            Descriptor::Lookup(lookup) => Some(*lookup),
            _ => None,
        }
    }

    /// Check that a present span is non-empty.
    fn check_present(&self) -> Result<()> {
        match self {
            Descriptor::Bytes(bytes) if bytes.is_empty() => {
                Err(Error::InvalidArgument("zero-length bytes descriptor"))
            }
            Descriptor::Buffer(buf) if buf.is_empty() => {
                Err(Error::InvalidArgument("zero-length destination buffer"))
            }
            _ => Ok(()),
        }
    }
}

/// One queued unit of work
#[derive(Debug)]
pub struct Operation<'a> {
    /// Index of the target sub-database in the registry
    pub dbi: usize,
    pub kind: OpKind,
    pub key: Descriptor<'a>,
    pub value: Descriptor<'a>,
}

impl<'a> Operation<'a> {
    /// Check the shape of both descriptors for this kind of operation.
    pub(crate) fn validate(&self) -> Result<()> {
        self.key.check_present()?;
        self.value.check_present()?;

        if !matches!(self.key, Descriptor::Bytes(_) | Descriptor::Lookup(_)) {
            return Err(Error::InvalidArgument("key must be bytes or a lookup"));
        }
        let value_ok = match self.kind {
            OpKind::Put => matches!(self.value, Descriptor::Bytes(_) | Descriptor::Lookup(_)),
            OpKind::Get => matches!(self.value, Descriptor::Buffer(_) | Descriptor::None),
            OpKind::Del => !matches!(self.value, Descriptor::Buffer(_)),
        };
        if !value_ok {
            return Err(Error::InvalidArgument("value descriptor does not fit operation kind"));
        }
        Ok(())
    }

    /// Lookups carried by the key and value
    pub(crate) fn lookups(&self) -> impl Iterator<Item = Lookup> {
        self.key.lookup().into_iter().chain(self.value.lookup())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op<'a>(kind: OpKind, key: Descriptor<'a>, value: Descriptor<'a>) -> Operation<'a> {
        Operation {
            dbi: 0,
            kind,
            key,
            value,
        }
    }

    #[test]
    fn test_descriptor_shapes() {
        let mut buf = [0u8; 8];
        assert!(op(OpKind::Put, Descriptor::Bytes(b"k"), Descriptor::Bytes(b"v")).validate().is_ok());
        assert!(op(OpKind::Get, Descriptor::Bytes(b"k"), Descriptor::None).validate().is_ok());
        assert!(op(OpKind::Get, Descriptor::Lookup(Lookup::value(0)), Descriptor::Buffer(&mut buf))
            .validate()
            .is_ok());
        assert!(op(OpKind::Del, Descriptor::Bytes(b"k"), Descriptor::None).validate().is_ok());

        assert!(op(OpKind::Put, Descriptor::Bytes(b"k"), Descriptor::None).validate().is_err());
        assert!(op(OpKind::Get, Descriptor::None, Descriptor::None).validate().is_err());
        assert!(op(OpKind::Get, Descriptor::Bytes(b"k"), Descriptor::Bytes(b"v")).validate().is_err());
    }

    #[test]
    fn test_zero_length_spans_rejected() {
        let mut empty: [u8; 0] = [];
        assert!(op(OpKind::Put, Descriptor::Bytes(b""), Descriptor::Bytes(b"v")).validate().is_err());
        assert!(op(OpKind::Get, Descriptor::Bytes(b"k"), Descriptor::Buffer(&mut empty))
            .validate()
            .is_err());
    }

    #[test]
    fn test_classification_kinds() {
        assert!(OpKind::Put.is_write());
        assert!(OpKind::Del.is_write());
        assert!(!OpKind::Get.is_write());
    }
}
