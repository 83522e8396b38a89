//! Bounds-checked sequential reads and writes of fixed-width big-endian
//! integers over a byte buffer with an explicit cursor.

use crate::error::ProtocolError;

/// Writes integers into a caller-provided buffer, advancing a cursor.
pub struct ByteWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> ByteWriter<'a> {
    /// Starts writing at the beginning of `buffer`
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Number of bytes written so far
    pub fn position(&self) -> usize {
        self.position
    }

    /// Writes one byte, or fails with `BufferTooSmall` when the buffer is full
    pub fn write_u8(&mut self, value: u8) -> Result<(), ProtocolError> {
        self.write_bytes(&[value])
    }

    /// Writes a big-endian u16
    pub fn write_u16(&mut self, value: u16) -> Result<(), ProtocolError> {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Writes a big-endian two's complement i16
    pub fn write_i16(&mut self, value: i16) -> Result<(), ProtocolError> {
        self.write_bytes(&value.to_be_bytes())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let end = self.position + bytes.len();
        if end > self.buffer.len() {
            return Err(ProtocolError::BufferTooSmall {
                needed: end,
                available: self.buffer.len(),
            });
        }
        self.buffer[self.position..end].copy_from_slice(bytes);
        self.position = end;
        Ok(())
    }
}

/// Reads integers out of a byte slice, advancing a cursor.
pub struct ByteReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    /// Starts reading at the beginning of `buffer`
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Number of bytes consumed so far
    pub fn position(&self) -> usize {
        self.position
    }

    /// Reads one byte, or fails with `Truncated` past the end of the input
    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let [byte] = self.read_array::<1>()?;
        Ok(byte)
    }

    /// Reads a big-endian u16
    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    /// Reads a big-endian two's complement i16
    pub fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(i16::from_be_bytes(self.read_array()?))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let end = self.position + N;
        if end > self.buffer.len() {
            return Err(ProtocolError::Truncated {
                needed: end,
                available: self.buffer.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buffer[self.position..end]);
        self.position = end;
        Ok(out)
    }
}
