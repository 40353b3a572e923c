//! Client in-memory representation of Quarry values.
//!
//! [`Value`] is the tagged form every codec decodes into and encodes from.
//! Destination mapping for callers goes through [`FromValue`] (results) and
//! [`IntoValue`] (query arguments).

use crate::error::{Error, Result};

/// Microseconds between the Unix epoch and 2000-01-01T00:00:00Z, the wire
/// epoch for datetimes.
pub const EPOCH_2000_UNIX_MICROS: i64 = 946_684_800_000_000;

/// An arbitrary-precision integer in wire form: base-10000 digits, most
/// significant first, scaled by `weight`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigInt {
    pub negative: bool,
    pub weight: i16,
    pub digits: Vec<u16>,
}

/// A bounded or unbounded range over an ordered scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeValue {
    pub lower: Option<Value>,
    pub upper: Option<Value>,
    pub inc_lower: bool,
    pub inc_upper: bool,
    pub empty: bool,
}

/// A decoded object field, in shape order.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub name: String,
    pub value: Value,
}

/// A Quarry value held by the client.
///
/// Every variant owns its storage; nothing borrows from the network buffer
/// it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value: a NULL field or a missing optional argument.
    Nothing,
    Uuid([u8; 16]),
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Raw JSON text; parsing into a document model is the caller's choice.
    Json(String),
    /// Microseconds since 2000-01-01T00:00:00Z.
    DateTime(i64),
    /// Microseconds.
    Duration(i64),
    BigInt(BigInt),
    Enum(String),
    Array(Vec<Value>),
    Set(Vec<Value>),
    Tuple(Vec<Value>),
    Object(Vec<ObjectField>),
    NamedTuple(Vec<(String, Value)>),
    Range(Box<RangeValue>),
}

impl Value {
    pub fn is_nothing(&self) -> bool {
        matches!(self, Value::Nothing)
    }

    /// Short name used in conversion error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nothing => "nothing",
            Value::Uuid(_) => "uuid",
            Value::Bool(_) => "bool",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "json",
            Value::DateTime(_) => "datetime",
            Value::Duration(_) => "duration",
            Value::BigInt(_) => "bigint",
            Value::Enum(_) => "enum",
            Value::Array(_) => "array",
            Value::Set(_) => "set",
            Value::Tuple(_) => "tuple",
            Value::Object(_) => "object",
            Value::NamedTuple(_) => "named tuple",
            Value::Range(_) => "range",
        }
    }
}

fn mismatch(value: &Value, want: &str) -> Error {
    Error::InvalidArgument(format!("cannot convert {} into {}", value.kind(), want))
}

/// Conversion from a decoded [`Value`] into a caller destination.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

macro_rules! from_value_scalar {
    ($ty:ty, $variant:ident, $want:literal) => {
        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self> {
                match value {
                    Value::$variant(v) => Ok(v),
                    other => Err(mismatch(&other, $want)),
                }
            }
        }
    };
}

from_value_scalar!(bool, Bool, "bool");
from_value_scalar!(i16, Int16, "int16");
from_value_scalar!(i32, Int32, "int32");
from_value_scalar!(f32, Float32, "float32");
from_value_scalar!(f64, Float64, "float64");
from_value_scalar!(Vec<u8>, Bytes, "bytes");
from_value_scalar!([u8; 16], Uuid, "uuid");

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int64(v) => Ok(v),
            other => Err(mismatch(&other, "int64")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Str(v) | Value::Json(v) | Value::Enum(v) => Ok(v),
            other => Err(mismatch(&other, "str")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Nothing => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) | Value::Set(items) | Value::Tuple(items) => {
                items.into_iter().map(T::from_value).collect()
            }
            other => Err(mismatch(&other, "sequence")),
        }
    }
}

/// Conversion from a caller argument into a [`Value`].
pub trait IntoValue {
    fn into_value(self) -> Value;
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

macro_rules! into_value_scalar {
    ($ty:ty, $variant:ident) => {
        impl IntoValue for $ty {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
        }
    };
}

into_value_scalar!(bool, Bool);
into_value_scalar!(i16, Int16);
into_value_scalar!(i32, Int32);
into_value_scalar!(i64, Int64);
into_value_scalar!(f32, Float32);
into_value_scalar!(f64, Float64);
into_value_scalar!(String, Str);
into_value_scalar!(Vec<u8>, Bytes);
into_value_scalar!([u8; 16], Uuid);

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::Str(self.to_string())
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Nothing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_conversions_round_trip() {
        assert_eq!(i64::from_value(27i64.into_value()).unwrap(), 27);
        assert_eq!(
            String::from_value("hello".into_value()).unwrap(),
            "hello".to_string()
        );
        assert!(bool::from_value(Value::Bool(true)).unwrap());
    }

    #[test]
    fn mismatched_conversions_fail() {
        match i64::from_value(Value::Str("not a number".into())) {
            Err(Error::InvalidArgument(msg)) => assert!(msg.contains("int64")),
            other => panic!("expected InvalidArgumentError, got {:?}", other),
        }
    }

    #[test]
    fn optionals_map_nothing_to_none() {
        assert_eq!(Option::<i64>::from_value(Value::Nothing).unwrap(), None);
        assert_eq!(
            Option::<i64>::from_value(Value::Int64(3)).unwrap(),
            Some(3)
        );
        assert_eq!(None::<i64>.into_value(), Value::Nothing);
    }

    #[test]
    fn sequences_convert_element_wise() {
        let set = Value::Set(vec![Value::Int32(1), Value::Int32(2)]);
        assert_eq!(Vec::<i32>::from_value(set).unwrap(), vec![1, 2]);
    }
}
