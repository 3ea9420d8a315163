use bytes::Bytes;
use glam::Vec3;

use super::{
    significant_bytes, zigzag_encode, Value, PACKED_LONG_BASE, PACKED_ONE_BYTE_MAX,
    PACKED_THREE_BYTE_MAX, PACKED_THREE_BYTE_PREFIX, PACKED_TWO_BYTE_MAX,
};

/// Append-only encoder producing the packed wire format.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    buffer: Vec<u8>,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Reuse an existing allocation; previous contents are discarded.
    pub fn from_vec(mut buffer: Vec<u8>) -> Self {
        buffer.clear();
        Self { buffer }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buffer)
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Raw bytes without a length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_u64_packed(&mut self, value: u64) {
        if value <= PACKED_ONE_BYTE_MAX {
            self.buffer.push(value as u8);
        } else if value <= PACKED_TWO_BYTE_MAX {
            let rest = value - PACKED_ONE_BYTE_MAX;
            self.buffer.push(((rest >> 8) as u8) + 241);
            self.buffer.push((rest & 0xFF) as u8);
        } else if value <= PACKED_THREE_BYTE_MAX {
            let rest = value - (PACKED_TWO_BYTE_MAX + 1);
            self.buffer.push(PACKED_THREE_BYTE_PREFIX);
            self.buffer.push((rest >> 8) as u8);
            self.buffer.push((rest & 0xFF) as u8);
        } else {
            let count = significant_bytes(value).max(3);
            self.buffer.push(PACKED_LONG_BASE + count as u8);
            self.buffer.extend_from_slice(&value.to_le_bytes()[..count]);
        }
    }

    pub fn write_u32_packed(&mut self, value: u32) {
        self.write_u64_packed(u64::from(value));
    }

    pub fn write_u16_packed(&mut self, value: u16) {
        self.write_u64_packed(u64::from(value));
    }

    pub fn write_i64_packed(&mut self, value: i64) {
        self.write_u64_packed(zigzag_encode(value));
    }

    pub fn write_i32_packed(&mut self, value: i32) {
        self.write_i64_packed(i64::from(value));
    }

    pub fn write_i16_packed(&mut self, value: i16) {
        self.write_i64_packed(i64::from(value));
    }

    pub fn write_f32_packed(&mut self, value: f32) {
        self.write_u32_packed(value.to_bits().swap_bytes());
    }

    pub fn write_f64_packed(&mut self, value: f64) {
        self.write_u64_packed(value.to_bits().swap_bytes());
    }

    /// Packed length followed by the bytes.
    pub fn write_byte_array(&mut self, bytes: &[u8]) {
        self.write_u64_packed(bytes.len() as u64);
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_byte_array(value.as_bytes());
    }

    pub fn write_vec3_packed(&mut self, value: Vec3) {
        self.write_f32_packed(value.x);
        self.write_f32_packed(value.y);
        self.write_f32_packed(value.z);
    }

    /// Packed object without a type tag.
    pub fn write_value(&mut self, value: &Value) {
        value.write_to(self);
    }
}
