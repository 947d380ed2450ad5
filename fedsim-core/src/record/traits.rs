//! Serialization traits for the weight record wire format.

/// An error that can occur while parsing a binary buffer.
///
/// Parsing failures are not recoverable in a meaningful way, the record is
/// simply rejected, so a flexible, context-carrying error type fits better
/// than a dedicated enum.
pub type DecodeError = anyhow::Error;

/// A type that can write itself into a pre-allocated byte buffer.
pub trait ToBytes {
    /// Gets the length of the buffer this type serializes into.
    fn buffer_length(&self) -> usize;

    /// Writes this type into `buffer`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is shorter than [`buffer_length`][Self::buffer_length].
    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T);
}

/// A cursor over a byte slice with length-checked reads.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Gets the number of bytes not yet consumed.
    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    /// Consumes and returns the next `length` bytes.
    pub(crate) fn take(&mut self, length: usize) -> Result<&'a [u8], DecodeError> {
        use anyhow::anyhow;
        if self.remaining() < length {
            return Err(anyhow!(
                "buffer exhausted at offset {}: {} bytes requested, {} remaining",
                self.offset,
                length,
                self.remaining()
            ));
        }
        let slice = &self.bytes[self.offset..self.offset + length];
        self.offset += length;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
