use bytes::BufMut;

use crate::decode::MAX_DEPTH;
use crate::value::{Marker, Value};

/// Error returned from [encode].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("Payload of {len} bytes does not fit a 32 bit length prefix")]
    LengthOverflow { len: usize },
    #[error("Value is nested deeper than {} levels", MAX_DEPTH)]
    TooDeep,
}

/// Write the marker and payload of `value` to `sink`.
///
/// Values nested deeper than [MAX_DEPTH] are rejected, as the decoder would
/// reject them. On error `sink` may hold a partially written value.
pub fn encode(value: &Value, sink: &mut impl BufMut) -> Result<(), EncodeError> {
    encode_at(value, sink, 0)
}

/// Check that `value` can be encoded when it sits inside `depth` enclosing
/// containers. Nothing is written.
pub fn check(value: &Value, depth: usize) -> Result<(), EncodeError> {
    match value {
        Value::String(string) => check_length(string.len()),
        Value::Binary(data) => check_length(data.len()),
        Value::List(items) => {
            let depth = enter(depth)?;
            items.iter().try_for_each(|item| check(item, depth))
        }
        Value::Object(entries) => {
            let depth = enter(depth)?;
            entries.iter().try_for_each(|(key, item)| {
                check_length(key.len())?;
                check(item, depth)
            })
        }
        _ => Ok(()),
    }
}

/// Encode `value` into a fresh buffer.
pub fn to_vec(value: &Value) -> Result<Vec<u8>, EncodeError> {
    let mut data = Vec::new();
    encode(value, &mut data)?;
    Ok(data)
}

fn encode_at(value: &Value, sink: &mut impl BufMut, depth: usize) -> Result<(), EncodeError> {
    sink.put_u8(value.marker() as u8);
    match value {
        Value::Null => {}
        Value::String(string) => put_length_prefixed(string.as_bytes(), sink)?,
        Value::Byte(byte) => sink.put_i8(*byte),
        Value::Short(short) => sink.put_i16(*short),
        Value::Int(int) => sink.put_i32(*int),
        Value::Long(long) => sink.put_i64(*long),
        Value::Float(float) => sink.put_f32(*float),
        Value::Double(double) => sink.put_f64(*double),
        Value::Boolean(boolean) => sink.put_u8(*boolean as u8),
        Value::Binary(data) => put_length_prefixed(data, sink)?,
        Value::List(items) => {
            let depth = enter(depth)?;
            for item in items {
                encode_at(item, sink, depth)?;
            }
            sink.put_u8(Marker::End as u8);
        }
        Value::Object(entries) => {
            let depth = enter(depth)?;
            for (key, item) in entries {
                sink.put_u8(Marker::String as u8);
                put_length_prefixed(key.as_bytes(), sink)?;
                encode_at(item, sink, depth)?;
            }
            sink.put_u8(Marker::End as u8);
        }
    }
    Ok(())
}

fn enter(depth: usize) -> Result<usize, EncodeError> {
    let depth = depth + 1;
    if depth > MAX_DEPTH {
        Err(EncodeError::TooDeep)
    } else {
        Ok(depth)
    }
}

fn check_length(len: usize) -> Result<(), EncodeError> {
    if len > u32::MAX as usize {
        Err(EncodeError::LengthOverflow { len })
    } else {
        Ok(())
    }
}

fn put_length_prefixed(data: &[u8], sink: &mut impl BufMut) -> Result<(), EncodeError> {
    use std::convert::TryFrom as _;

    let len = u32::try_from(data.len()).map_err(|_| EncodeError::LengthOverflow { len: data.len() })?;
    sink.put_u32(len);
    sink.put_slice(data);
    Ok(())
}
