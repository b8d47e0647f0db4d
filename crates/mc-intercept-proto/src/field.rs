//! Field kinds, field values and their wire encoding.
//!
//! A wire class declares an ordered list of fields, each with a [`FieldKind`]. The kind fixes
//! both the semantic [`ValueType`] (what accessors match on) and the wire encoding (fixed vs
//! variable width). Values live in [`FieldValue`] slots inside a wire handle.

use std::fmt;

use bytes::{Buf, BufMut};
use serde::Deserialize;

use crate::codec::{
    ensure_remaining, read_byte_array, read_len, read_string, write_byte_array, write_len, write_string,
};
use crate::codec::{ProtoDecode, ProtoEncode};
use crate::error::ProtoError;
use crate::types::{BlockPos, Uuid, VarInt, VarLong};

/// Declared field type of a wire class slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Bool,
    Byte,
    Short,
    Int,
    VarInt,
    Long,
    VarLong,
    Float,
    Double,
    String,
    Uuid,
    ByteArray,
    /// Exactly this many bytes, no length prefix.
    FixedBytes(usize),
    /// Everything left in the packet. Only valid as the last field on the wire.
    Remaining,
    ShortArray,
    IntArray,
    BlockPos,
}

/// Semantic type an accessor matches against, independent of wire width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
    Uuid,
    ByteArray,
    ShortArray,
    IntArray,
    BlockPos,
}

impl FieldKind {
    pub fn value_type(self) -> ValueType {
        match self {
            FieldKind::Bool => ValueType::Bool,
            FieldKind::Byte => ValueType::Byte,
            FieldKind::Short => ValueType::Short,
            FieldKind::Int | FieldKind::VarInt => ValueType::Int,
            FieldKind::Long | FieldKind::VarLong => ValueType::Long,
            FieldKind::Float => ValueType::Float,
            FieldKind::Double => ValueType::Double,
            FieldKind::String => ValueType::String,
            FieldKind::Uuid => ValueType::Uuid,
            FieldKind::ByteArray | FieldKind::FixedBytes(_) | FieldKind::Remaining => {
                ValueType::ByteArray
            }
            FieldKind::ShortArray => ValueType::ShortArray,
            FieldKind::IntArray => ValueType::IntArray,
            FieldKind::BlockPos => ValueType::BlockPos,
        }
    }

    /// Value a freshly instantiated slot of this kind holds.
    pub fn default_value(self) -> FieldValue {
        if let FieldKind::FixedBytes(len) = self {
            return FieldValue::ByteArray(vec![0; len]);
        }
        match self.value_type() {
            ValueType::Bool => FieldValue::Bool(false),
            ValueType::Byte => FieldValue::Byte(0),
            ValueType::Short => FieldValue::Short(0),
            ValueType::Int => FieldValue::Int(0),
            ValueType::Long => FieldValue::Long(0),
            ValueType::Float => FieldValue::Float(0.0),
            ValueType::Double => FieldValue::Double(0.0),
            ValueType::String => FieldValue::String(String::new()),
            ValueType::Uuid => FieldValue::Uuid(Uuid::ZERO),
            ValueType::ByteArray => FieldValue::ByteArray(Vec::new()),
            ValueType::ShortArray => FieldValue::ShortArray(Vec::new()),
            ValueType::IntArray => FieldValue::IntArray(Vec::new()),
            ValueType::BlockPos => FieldValue::BlockPos(BlockPos::new(0, 0, 0)),
        }
    }
}

impl ValueType {
    /// Parse console or config text into a value of this type. Arrays are comma separated,
    /// byte arrays are hex and block positions are `x,y,z`.
    pub fn parse(self, text: &str) -> Result<FieldValue, ProtoError> {
        let bad = || ProtoError::InvalidData(format!("cannot read {text:?} as {self:?}"));
        fn list<T: std::str::FromStr>(text: &str) -> Option<Vec<T>> {
            if text.is_empty() {
                return Some(Vec::new());
            }
            text.split(',').map(|p| p.trim().parse().ok()).collect()
        }
        let value = match self {
            ValueType::Bool => FieldValue::Bool(text.parse().map_err(|_| bad())?),
            ValueType::Byte => FieldValue::Byte(text.parse().map_err(|_| bad())?),
            ValueType::Short => FieldValue::Short(text.parse().map_err(|_| bad())?),
            ValueType::Int => FieldValue::Int(text.parse().map_err(|_| bad())?),
            ValueType::Long => FieldValue::Long(text.parse().map_err(|_| bad())?),
            ValueType::Float => FieldValue::Float(text.parse().map_err(|_| bad())?),
            ValueType::Double => FieldValue::Double(text.parse().map_err(|_| bad())?),
            ValueType::String => FieldValue::String(text.to_string()),
            ValueType::Uuid => FieldValue::Uuid(text.parse()?),
            ValueType::ByteArray => {
                if text.len() % 2 != 0 {
                    return Err(bad());
                }
                let bytes = (0..text.len())
                    .step_by(2)
                    .map(|i| text.get(i..i + 2).and_then(|h| u8::from_str_radix(h, 16).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .ok_or_else(bad)?;
                FieldValue::ByteArray(bytes)
            }
            ValueType::ShortArray => FieldValue::ShortArray(list(text).ok_or_else(bad)?),
            ValueType::IntArray => FieldValue::IntArray(list(text).ok_or_else(bad)?),
            ValueType::BlockPos => match list::<i32>(text).as_deref() {
                Some(&[x, y, z]) => FieldValue::BlockPos(BlockPos::new(x, y, z)),
                _ => return Err(bad()),
            },
        };
        Ok(value)
    }
}

/// Value held by one slot of a wire handle.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Only valid in nullable (boxed) slots.
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Uuid(Uuid),
    ByteArray(Vec<u8>),
    ShortArray(Vec<i16>),
    IntArray(Vec<i32>),
    BlockPos(BlockPos),
}

impl FieldValue {
    pub fn value_type(&self) -> Option<ValueType> {
        Some(match self {
            FieldValue::Null => return None,
            FieldValue::Bool(_) => ValueType::Bool,
            FieldValue::Byte(_) => ValueType::Byte,
            FieldValue::Short(_) => ValueType::Short,
            FieldValue::Int(_) => ValueType::Int,
            FieldValue::Long(_) => ValueType::Long,
            FieldValue::Float(_) => ValueType::Float,
            FieldValue::Double(_) => ValueType::Double,
            FieldValue::String(_) => ValueType::String,
            FieldValue::Uuid(_) => ValueType::Uuid,
            FieldValue::ByteArray(_) => ValueType::ByteArray,
            FieldValue::ShortArray(_) => ValueType::ShortArray,
            FieldValue::IntArray(_) => ValueType::IntArray,
            FieldValue::BlockPos(_) => ValueType::BlockPos,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Byte(v) => write!(f, "{v}"),
            FieldValue::Short(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Long(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Double(v) => write!(f, "{v}"),
            FieldValue::String(v) => write!(f, "{v:?}"),
            FieldValue::Uuid(v) => write!(f, "{v}"),
            FieldValue::ByteArray(v) => write!(f, "byte[{}]", v.len()),
            FieldValue::ShortArray(v) => write!(f, "{v:?}"),
            FieldValue::IntArray(v) => write!(f, "{v:?}"),
            FieldValue::BlockPos(v) => write!(f, "{v}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed access
// ---------------------------------------------------------------------------

/// Rust type that a field accessor can be parameterized over.
pub trait FieldType: Sized + 'static {
    /// Name used in error messages.
    const NAME: &'static str;

    /// Whether a slot declared as `kind` is assignable to this type.
    fn matches(kind: FieldKind) -> bool;

    fn from_value(value: &FieldValue) -> Option<Self>;

    fn into_value(self) -> FieldValue;
}

macro_rules! field_type {
    ($ty:ty, $name:literal, $value_type:ident, $variant:ident) => {
        impl FieldType for $ty {
            const NAME: &'static str = $name;

            fn matches(kind: FieldKind) -> bool {
                kind.value_type() == ValueType::$value_type
            }

            fn from_value(value: &FieldValue) -> Option<Self> {
                match value {
                    FieldValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }

            fn into_value(self) -> FieldValue {
                FieldValue::$variant(self)
            }
        }
    };
}

field_type!(bool, "bool", Bool, Bool);
field_type!(i8, "i8", Byte, Byte);
field_type!(i16, "i16", Short, Short);
field_type!(i32, "i32", Int, Int);
field_type!(i64, "i64", Long, Long);
field_type!(f32, "f32", Float, Float);
field_type!(f64, "f64", Double, Double);
field_type!(String, "String", String, String);
field_type!(Uuid, "Uuid", Uuid, Uuid);
field_type!(Vec<u8>, "Vec<u8>", ByteArray, ByteArray);
field_type!(Vec<i16>, "Vec<i16>", ShortArray, ShortArray);
field_type!(Vec<i32>, "Vec<i32>", IntArray, IntArray);
field_type!(BlockPos, "BlockPos", BlockPos, BlockPos);

/// The generic view: every slot, whatever its declared kind.
impl FieldType for FieldValue {
    const NAME: &'static str = "FieldValue";

    fn matches(_kind: FieldKind) -> bool {
        true
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        Some(value.clone())
    }

    fn into_value(self) -> FieldValue {
        self
    }
}

// ---------------------------------------------------------------------------
// Wire encoding
// ---------------------------------------------------------------------------

/// Encode one slot. Nullable slots carry a leading presence flag.
pub fn encode_value(
    kind: FieldKind,
    nullable: bool,
    value: &FieldValue,
    buf: &mut impl BufMut,
) -> Result<(), ProtoError> {
    if nullable {
        buf.put_u8(u8::from(!value.is_null()));
        if value.is_null() {
            return Ok(());
        }
    }
    match (kind, value) {
        (FieldKind::Bool, FieldValue::Bool(v)) => buf.put_u8(u8::from(*v)),
        (FieldKind::Byte, FieldValue::Byte(v)) => buf.put_i8(*v),
        (FieldKind::Short, FieldValue::Short(v)) => buf.put_i16(*v),
        (FieldKind::Int, FieldValue::Int(v)) => buf.put_i32(*v),
        (FieldKind::VarInt, FieldValue::Int(v)) => VarInt(*v).proto_encode(buf),
        (FieldKind::Long, FieldValue::Long(v)) => buf.put_i64(*v),
        (FieldKind::VarLong, FieldValue::Long(v)) => VarLong(*v).proto_encode(buf),
        (FieldKind::Float, FieldValue::Float(v)) => buf.put_f32(*v),
        (FieldKind::Double, FieldValue::Double(v)) => buf.put_f64(*v),
        (FieldKind::String, FieldValue::String(v)) => write_string(buf, v)?,
        (FieldKind::Uuid, FieldValue::Uuid(v)) => v.proto_encode(buf),
        (FieldKind::ByteArray, FieldValue::ByteArray(v)) => write_byte_array(buf, v)?,
        (FieldKind::FixedBytes(len), FieldValue::ByteArray(v)) => {
            if v.len() != len {
                return Err(ProtoError::InvalidData(format!(
                    "fixed field takes {len} bytes, got {}",
                    v.len()
                )));
            }
            buf.put_slice(v);
        }
        (FieldKind::Remaining, FieldValue::ByteArray(v)) => buf.put_slice(v),
        (FieldKind::ShortArray, FieldValue::ShortArray(v)) => {
            write_len(buf, v.len())?;
            for s in v {
                buf.put_i16(*s);
            }
        }
        (FieldKind::IntArray, FieldValue::IntArray(v)) => {
            write_len(buf, v.len())?;
            for i in v {
                VarInt(*i).proto_encode(buf);
            }
        }
        (FieldKind::BlockPos, FieldValue::BlockPos(v)) => v.proto_encode(buf),
        (kind, value) => {
            return Err(ProtoError::InvalidData(format!(
                "value {value} does not fit a {kind:?} field"
            )))
        }
    }
    Ok(())
}

/// Decode one slot.
pub fn decode_value(
    kind: FieldKind,
    nullable: bool,
    buf: &mut impl Buf,
) -> Result<FieldValue, ProtoError> {
    if nullable {
        ensure_remaining(buf, 1)?;
        if buf.get_u8() == 0 {
            return Ok(FieldValue::Null);
        }
    }
    let value = match kind {
        FieldKind::Bool => {
            ensure_remaining(buf, 1)?;
            FieldValue::Bool(buf.get_u8() != 0)
        }
        FieldKind::Byte => {
            ensure_remaining(buf, 1)?;
            FieldValue::Byte(buf.get_i8())
        }
        FieldKind::Short => {
            ensure_remaining(buf, 2)?;
            FieldValue::Short(buf.get_i16())
        }
        FieldKind::Int => {
            ensure_remaining(buf, 4)?;
            FieldValue::Int(buf.get_i32())
        }
        FieldKind::VarInt => FieldValue::Int(VarInt::proto_decode(buf)?.0),
        FieldKind::Long => {
            ensure_remaining(buf, 8)?;
            FieldValue::Long(buf.get_i64())
        }
        FieldKind::VarLong => FieldValue::Long(VarLong::proto_decode(buf)?.0),
        FieldKind::Float => {
            ensure_remaining(buf, 4)?;
            FieldValue::Float(buf.get_f32())
        }
        FieldKind::Double => {
            ensure_remaining(buf, 8)?;
            FieldValue::Double(buf.get_f64())
        }
        FieldKind::String => FieldValue::String(read_string(buf)?),
        FieldKind::Uuid => FieldValue::Uuid(Uuid::proto_decode(buf)?),
        FieldKind::ByteArray => FieldValue::ByteArray(read_byte_array(buf)?),
        FieldKind::FixedBytes(len) => {
            ensure_remaining(buf, len)?;
            FieldValue::ByteArray(buf.copy_to_bytes(len).to_vec())
        }
        FieldKind::Remaining => FieldValue::ByteArray(buf.copy_to_bytes(buf.remaining()).to_vec()),
        FieldKind::ShortArray => {
            let len = read_len(buf)?;
            ensure_remaining(buf, len * 2)?;
            FieldValue::ShortArray((0..len).map(|_| buf.get_i16()).collect())
        }
        FieldKind::IntArray => {
            let len = read_len(buf)?;
            let mut values = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                values.push(VarInt::proto_decode(buf)?.0);
            }
            FieldValue::IntArray(values)
        }
        FieldKind::BlockPos => FieldValue::BlockPos(BlockPos::proto_decode(buf)?),
    };
    Ok(value)
}
