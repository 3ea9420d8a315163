use bytes::Bytes;
use glam::Vec3;

use super::{
    zigzag_decode, Value, ValueKind, PACKED_LONG_BASE, PACKED_ONE_BYTE_MAX,
    PACKED_THREE_BYTE_PREFIX, PACKED_TWO_BYTE_MAX,
};
use crate::error::{constants, ProtocolError, Result};

/// Forward-only decoder over a borrowed message buffer.
///
/// Every read either consumes exactly the bytes it decodes or fails with
/// [`ProtocolError::TruncatedInput`] leaving the position untouched.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unread tail, borrowed.
    pub fn remaining_slice(&self) -> &'a [u8] {
        &self.buffer[self.position..]
    }

    /// Independent copy of the unread tail. The reader itself is not advanced.
    pub fn copy_remaining(&self) -> Bytes {
        Bytes::copy_from_slice(self.remaining_slice())
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(ProtocolError::TruncatedInput { needed, remaining });
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        self.ensure(count)?;
        let start = self.position;
        self.position += count;
        Ok(&self.buffer[start..self.position])
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.read_bytes(count).map(|_| ())
    }

    /// Carve the next `len` bytes into a bounded reader and advance past them.
    pub fn sub_reader(&mut self, len: usize) -> Result<BitReader<'a>> {
        Ok(BitReader::new(self.read_bytes(len)?))
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.ensure(1)?;
        match self.buffer[self.position] {
            0 => {
                self.position += 1;
                Ok(false)
            }
            1 => {
                self.position += 1;
                Ok(true)
            }
            _ => Err(ProtocolError::MalformedInput(constants::ERR_INVALID_BOOL.into())),
        }
    }

    pub fn read_u64_packed(&mut self) -> Result<u64> {
        self.ensure(1)?;
        let first = self.buffer[self.position];
        let value = if u64::from(first) <= PACKED_ONE_BYTE_MAX {
            self.position += 1;
            u64::from(first)
        } else if first < PACKED_THREE_BYTE_PREFIX {
            let bytes = self.peek(2)?;
            self.position += 2;
            PACKED_ONE_BYTE_MAX + (u64::from(first - 241) << 8) + u64::from(bytes[1])
        } else if first == PACKED_THREE_BYTE_PREFIX {
            let bytes = self.peek(3)?;
            self.position += 3;
            PACKED_TWO_BYTE_MAX + 1 + (u64::from(bytes[1]) << 8) + u64::from(bytes[2])
        } else {
            let count = usize::from(first - PACKED_LONG_BASE);
            let bytes = self.peek(1 + count)?;
            let mut raw = [0u8; 8];
            raw[..count].copy_from_slice(&bytes[1..]);
            self.position += 1 + count;
            u64::from_le_bytes(raw)
        };
        Ok(value)
    }

    fn peek(&self, count: usize) -> Result<&'a [u8]> {
        self.ensure(count)?;
        Ok(&self.buffer[self.position..self.position + count])
    }

    pub fn read_u32_packed(&mut self) -> Result<u32> {
        let start = self.position;
        let value = self.read_u64_packed()?;
        u32::try_from(value).map_err(|_| {
            self.position = start;
            ProtocolError::MalformedInput(format!("packed value {value} exceeds u32"))
        })
    }

    pub fn read_u16_packed(&mut self) -> Result<u16> {
        let start = self.position;
        let value = self.read_u64_packed()?;
        u16::try_from(value).map_err(|_| {
            self.position = start;
            ProtocolError::MalformedInput(format!("packed value {value} exceeds u16"))
        })
    }

    pub fn read_i64_packed(&mut self) -> Result<i64> {
        Ok(zigzag_decode(self.read_u64_packed()?))
    }

    pub fn read_i32_packed(&mut self) -> Result<i32> {
        let start = self.position;
        let value = self.read_i64_packed()?;
        i32::try_from(value).map_err(|_| {
            self.position = start;
            ProtocolError::MalformedInput(format!("packed value {value} exceeds i32"))
        })
    }

    pub fn read_i16_packed(&mut self) -> Result<i16> {
        let start = self.position;
        let value = self.read_i64_packed()?;
        i16::try_from(value).map_err(|_| {
            self.position = start;
            ProtocolError::MalformedInput(format!("packed value {value} exceeds i16"))
        })
    }

    pub fn read_f32_packed(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32_packed()?.swap_bytes()))
    }

    pub fn read_f64_packed(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64_packed()?.swap_bytes()))
    }

    pub fn read_byte_array(&mut self) -> Result<&'a [u8]> {
        let start = self.position;
        let len = self.read_u64_packed()?;
        let remaining = self.remaining();
        match usize::try_from(len) {
            Ok(len) if len <= remaining => self.read_bytes(len),
            _ => {
                self.position = start;
                Err(ProtocolError::TruncatedInput {
                    needed: usize::try_from(len).unwrap_or(usize::MAX),
                    remaining,
                })
            }
        }
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_byte_array()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::MalformedInput(constants::ERR_INVALID_UTF8.into()))
    }

    pub fn read_vec3_packed(&mut self) -> Result<Vec3> {
        let x = self.read_f32_packed()?;
        let y = self.read_f32_packed()?;
        let z = self.read_f32_packed()?;
        Ok(Vec3::new(x, y, z))
    }

    /// Packed object of a kind known from context.
    pub fn read_value(&mut self, kind: ValueKind) -> Result<Value> {
        Value::read_from(kind, self)
    }
}
