//! Packed values.
//!
//! A [`Value`] is written without a type tag: both sides agree on the
//! [`ValueKind`] from context (variable declaration order, declared RPC
//! return type), so the reader is always told what to expect.

use bytes::Bytes;
use glam::Vec3;

use super::{BitReader, BitWriter};
use crate::error::Result;

/// Type descriptor for a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Unit,
    Bool,
    U8,
    U16,
    U32,
    U64,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Vec3,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Unit => "unit",
            ValueKind::Bool => "bool",
            ValueKind::U8 => "u8",
            ValueKind::U16 => "u16",
            ValueKind::U32 => "u32",
            ValueKind::U64 => "u64",
            ValueKind::I16 => "i16",
            ValueKind::I32 => "i32",
            ValueKind::I64 => "i64",
            ValueKind::F32 => "f32",
            ValueKind::F64 => "f64",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::Vec3 => "vec3",
        }
    }
}

/// A typed value serializable to and from the packed wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Bytes),
    Vec3(Vec3),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Unit => ValueKind::Unit,
            Value::Bool(_) => ValueKind::Bool,
            Value::U8(_) => ValueKind::U8,
            Value::U16(_) => ValueKind::U16,
            Value::U32(_) => ValueKind::U32,
            Value::U64(_) => ValueKind::U64,
            Value::I16(_) => ValueKind::I16,
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::F32(_) => ValueKind::F32,
            Value::F64(_) => ValueKind::F64,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Vec3(_) => ValueKind::Vec3,
        }
    }

    /// Zero value of a kind; used as the initial state of declared fields.
    pub fn default_for(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Unit => Value::Unit,
            ValueKind::Bool => Value::Bool(false),
            ValueKind::U8 => Value::U8(0),
            ValueKind::U16 => Value::U16(0),
            ValueKind::U32 => Value::U32(0),
            ValueKind::U64 => Value::U64(0),
            ValueKind::I16 => Value::I16(0),
            ValueKind::I32 => Value::I32(0),
            ValueKind::I64 => Value::I64(0),
            ValueKind::F32 => Value::F32(0.0),
            ValueKind::F64 => Value::F64(0.0),
            ValueKind::String => Value::String(String::new()),
            ValueKind::Bytes => Value::Bytes(Bytes::new()),
            ValueKind::Vec3 => Value::Vec3(Vec3::ZERO),
        }
    }

    pub fn write_to(&self, writer: &mut BitWriter) {
        match self {
            Value::Unit => {}
            Value::Bool(v) => writer.write_bool(*v),
            Value::U8(v) => writer.write_u8(*v),
            Value::U16(v) => writer.write_u16_packed(*v),
            Value::U32(v) => writer.write_u32_packed(*v),
            Value::U64(v) => writer.write_u64_packed(*v),
            Value::I16(v) => writer.write_i16_packed(*v),
            Value::I32(v) => writer.write_i32_packed(*v),
            Value::I64(v) => writer.write_i64_packed(*v),
            Value::F32(v) => writer.write_f32_packed(*v),
            Value::F64(v) => writer.write_f64_packed(*v),
            Value::String(v) => writer.write_string(v),
            Value::Bytes(v) => writer.write_byte_array(v),
            Value::Vec3(v) => writer.write_vec3_packed(*v),
        }
    }

    pub fn read_from(kind: ValueKind, reader: &mut BitReader<'_>) -> Result<Self> {
        Ok(match kind {
            ValueKind::Unit => Value::Unit,
            ValueKind::Bool => Value::Bool(reader.read_bool()?),
            ValueKind::U8 => Value::U8(reader.read_u8()?),
            ValueKind::U16 => Value::U16(reader.read_u16_packed()?),
            ValueKind::U32 => Value::U32(reader.read_u32_packed()?),
            ValueKind::U64 => Value::U64(reader.read_u64_packed()?),
            ValueKind::I16 => Value::I16(reader.read_i16_packed()?),
            ValueKind::I32 => Value::I32(reader.read_i32_packed()?),
            ValueKind::I64 => Value::I64(reader.read_i64_packed()?),
            ValueKind::F32 => Value::F32(reader.read_f32_packed()?),
            ValueKind::F64 => Value::F64(reader.read_f64_packed()?),
            ValueKind::String => Value::String(reader.read_string()?),
            ValueKind::Bytes => Value::Bytes(Bytes::copy_from_slice(reader.read_byte_array()?)),
            ValueKind::Vec3 => Value::Vec3(reader.read_vec3_packed()?),
        })
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        let mut writer = BitWriter::new();
        self.write_to(&mut writer);
        writer.len()
    }
}

macro_rules! impl_from_primitive {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    };
}

impl_from_primitive! {
    bool => Bool,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    String => String,
    Bytes => Bytes,
    Vec3 => Vec3,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}
