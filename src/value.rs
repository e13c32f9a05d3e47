//! Provides [Value], the self-describing datum carried by the codec, and the
//! conversions between Rust types and values.
use bytes::Bytes;

/// Argument lists of an invocation or getter. Each inner list is one
/// parenthesised parameter group.
pub type ArgLists = Vec<Vec<Value>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    Binary(Bytes),
    List(Vec<Value>),
    /// Key value pairs in wire order. Keys may repeat, the first occurrence
    /// wins.
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Marker byte that precedes this value on the wire.
    pub fn marker(&self) -> Marker {
        match self {
            Value::Null => Marker::Null,
            Value::String(_) => Marker::String,
            Value::Byte(_) => Marker::Byte,
            Value::Short(_) => Marker::Short,
            Value::Int(_) => Marker::Int,
            Value::Long(_) => Marker::Long,
            Value::Float(_) => Marker::Float,
            Value::Double(_) => Marker::Double,
            Value::Boolean(_) => Marker::Boolean,
            Value::Binary(_) => Marker::Binary,
            Value::List(_) => Marker::ListStart,
            Value::Object(_) => Marker::ObjectStart,
        }
    }

    /// Look up the first entry with `key` if this is an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(entries) => entries
                .iter()
                .find(|(entry_key, _)| entry_key == key)
                .map(|(_, value)| value),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Marker {
    Null = 0x00,
    String = 0x01,
    Byte = 0x02,
    Short = 0x03,
    Int = 0x04,
    Long = 0x05,
    Float = 0x06,
    Double = 0x07,
    Boolean = 0x08,
    Binary = 0x09,
    ListStart = 0x0A,
    ObjectStart = 0x0B,
    /// Terminates a list or an object. Not a value.
    End = 0x0C,
}

impl Marker {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Marker::Null,
            0x01 => Marker::String,
            0x02 => Marker::Byte,
            0x03 => Marker::Short,
            0x04 => Marker::Int,
            0x05 => Marker::Long,
            0x06 => Marker::Float,
            0x07 => Marker::Double,
            0x08 => Marker::Boolean,
            0x09 => Marker::Binary,
            0x0A => Marker::ListStart,
            0x0B => Marker::ObjectStart,
            0x0C => Marker::End,
            _ => return None,
        })
    }

    /// Payload size for markers with a fixed width payload.
    pub(crate) fn fixed_width(self) -> Option<usize> {
        match self {
            Marker::Null | Marker::End => Some(0),
            Marker::Byte | Marker::Boolean => Some(1),
            Marker::Short => Some(2),
            Marker::Int | Marker::Float => Some(4),
            Marker::Long | Marker::Double => Some(8),
            Marker::String | Marker::Binary | Marker::ListStart | Marker::ObjectStart => None,
        }
    }
}

impl std::fmt::Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Error returned by [FromValue] when a value has the wrong shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Expected {expected} value, found {actual}")]
pub struct TypeMismatch {
    pub expected: &'static str,
    pub actual: Marker,
}

impl TypeMismatch {
    fn new(expected: &'static str, value: &Value) -> Self {
        Self {
            expected,
            actual: value.marker(),
        }
    }
}

/// Writer half of the typed conversion: turns a Rust value into a [Value].
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Reader half of the typed conversion: extracts a Rust value from a [Value].
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, TypeMismatch>;
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, TypeMismatch> {
        Ok(value)
    }
}

macro_rules! scalar_conversion {
    ($type:ty, $variant:ident, $name:literal) => {
        impl IntoValue for $type {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
        }

        impl FromValue for $type {
            fn from_value(value: Value) -> Result<Self, TypeMismatch> {
                match value {
                    Value::$variant(inner) => Ok(inner),
                    other => Err(TypeMismatch::new($name, &other)),
                }
            }
        }

        impl From<$type> for Value {
            fn from(inner: $type) -> Self {
                Value::$variant(inner)
            }
        }
    };
}

scalar_conversion!(String, String, "string");
scalar_conversion!(i8, Byte, "byte");
scalar_conversion!(i16, Short, "short");
scalar_conversion!(i32, Int, "int");
scalar_conversion!(i64, Long, "long");
scalar_conversion!(f32, Float, "float");
scalar_conversion!(f64, Double, "double");
scalar_conversion!(bool, Boolean, "boolean");
scalar_conversion!(Bytes, Binary, "binary");

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::String(self.to_string())
    }
}

impl From<&str> for Value {
    fn from(string: &str) -> Self {
        Value::String(string.to_string())
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Null
    }
}

impl FromValue for () {
    fn from_value(value: Value) -> Result<Self, TypeMismatch> {
        match value {
            Value::Null => Ok(()),
            other => Err(TypeMismatch::new("null", &other)),
        }
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(inner) => inner.into_value(),
            None => Value::Null,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, TypeMismatch> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(IntoValue::into_value).collect())
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, TypeMismatch> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(TypeMismatch::new("list", &other)),
        }
    }
}
