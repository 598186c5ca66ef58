use std::slice;

use crate::error::{Error, Result};

/// An ordered list of borrowed byte parts forming one key or value.
///
/// Parts are not copied until the list is packed with [`Segments::copy_to`]
/// or [`Segments::to_vec`]. Used to assemble composite keys such as
/// `principal | type | id`.
#[derive(Debug, Clone, Default)]
pub struct Segments<'a> {
    parts: Vec<&'a [u8]>,
}

impl<'a> Segments<'a> {
    pub fn new() -> Self {
        Segments { parts: Vec::new() }
    }

    /// Append a part. Zero-length parts are rejected.
    pub fn add(&mut self, part: &'a [u8]) -> Result<()> {
        if part.is_empty() {
            return Err(Error::InvalidArgument("segment cannot be empty"));
        }
        self.parts.push(part);
        Ok(())
    }

    /// Append a part, builder style.
    pub fn with(mut self, part: &'a [u8]) -> Result<Self> {
        self.add(part)?;
        Ok(self)
    }

    /// Total size in bytes
    pub fn size(&self) -> usize {
        self.parts.iter().map(|part| part.len()).sum()
    }

    /// Number of parts
    #[inline]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, &'a [u8]> {
        self.parts.iter()
    }

    /// Copy every part contiguously into `dst`. Returns the bytes written.
    pub fn copy_to(&self, dst: &mut [u8]) -> Result<usize> {
        if self.parts.is_empty() {
            return Err(Error::InvalidArgument("no segments to copy"));
        }
        let size = self.size();
        if dst.len() < size {
            return Err(Error::BufferTooSmall {
                needed: size,
                available: dst.len(),
            });
        }

        let mut offset = 0;
        for part in &self.parts {
            dst[offset..offset + part.len()].copy_from_slice(part);
            offset += part.len();
        }
        Ok(offset)
    }

    /// Pack every part into a new buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size()];
        self.copy_to(&mut buf)?;
        Ok(buf)
    }
}
