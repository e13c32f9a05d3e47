//! Cursor based decoding of [Value]s.
//!
//! [decode] reads exactly one marker byte and returns an [Input] that is bound
//! to the value behind it. The payload is consumed only when one of the
//! `read_*` methods or [Input::skip] is called. These methods take the input
//! by value so that a payload is consumed at most once. An [Input] that is
//! dropped without being read leaves the [Source] in the middle of a value.
//!
//! Lists and objects are revealed one element at a time by [ListInput] and
//! [ObjectInput].
use bytes::{Buf as _, Bytes};

use crate::value::{Marker, Value};

/// Maximum nesting of lists and objects for [Input::read_value] and
/// [Input::skip].
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid marker byte {byte:#04x} at position {position}")]
    InvalidMarker { byte: u8, position: usize },
    #[error("Unexpected marker {actual} at position {position}. Expected {expected}")]
    UnexpectedMarker {
        expected: Marker,
        actual: Marker,
        position: usize,
    },
    #[error("Unexpected end marker at position {position}")]
    UnexpectedEnd { position: usize },
    #[error("Input truncated at position {position}, {needed} more bytes required")]
    Truncated { position: usize, needed: usize },
    #[error("Invalid UTF-8 string at position {position}")]
    InvalidUtf8 { position: usize },
    #[error("Invalid boolean byte {byte:#04x} at position {position}")]
    InvalidBoolean { byte: u8, position: usize },
    #[error("Cursor already emptied at position {position}")]
    AlreadyEmptied { position: usize },
    #[error("Values nested deeper than {} levels at position {position}", MAX_DEPTH)]
    TooDeep { position: usize },
}

impl DecodeError {
    /// Returns true if the error is caused by missing input and decoding
    /// could succeed with more data.
    pub fn is_truncated(&self) -> bool {
        matches!(self, DecodeError::Truncated { .. })
    }
}

/// Byte slice that is consumed by [Input]s and keeps track of the position.
#[derive(Debug, Clone)]
pub struct Source<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Source<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes that have not been consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        self.data
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() < len {
            return Err(DecodeError::Truncated {
                position: self.position,
                needed: len - self.data.len(),
            });
        }
        let (taken, rest) = self.data.split_at(len);
        self.data = rest;
        self.position += len;
        Ok(taken)
    }

    /// Read one marker byte. Returns the marker and its position.
    fn read_marker(&mut self) -> Result<(Marker, usize), DecodeError> {
        let position = self.position;
        let byte = self.take(1)?[0];
        let marker = Marker::from_u8(byte).ok_or(DecodeError::InvalidMarker { byte, position })?;
        Ok((marker, position))
    }

    fn read_length(&mut self) -> Result<usize, DecodeError> {
        let mut data = self.take(4)?;
        Ok(data.get_u32() as usize)
    }

    fn read_str(&mut self) -> Result<&'a str, DecodeError> {
        let len = self.read_length()?;
        let position = self.position;
        let data = self.take(len)?;
        std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8 { position })
    }

    fn skip_payload(&mut self, marker: Marker, depth: usize) -> Result<(), DecodeError> {
        if let Some(width) = marker.fixed_width() {
            self.take(width)?;
            return Ok(());
        }
        match marker {
            Marker::String | Marker::Binary => {
                let len = self.read_length()?;
                self.take(len)?;
            }
            Marker::ListStart | Marker::ObjectStart => {
                let depth = depth + 1;
                if depth > MAX_DEPTH {
                    return Err(DecodeError::TooDeep {
                        position: self.position,
                    });
                }
                // Object keys are regular string values, so both containers
                // skip the same way.
                loop {
                    let (child, _) = self.read_marker()?;
                    if child == Marker::End {
                        break;
                    }
                    self.skip_payload(child, depth)?;
                }
            }
            _ => unreachable!("fixed width markers are handled above"),
        }
        Ok(())
    }
}

/// Read the next marker from `source` and return an [Input] for the value.
pub fn decode<'s, 'a>(source: &'s mut Source<'a>) -> Result<Input<'s, 'a>, DecodeError> {
    Input::new(source)
}

/// Decode a complete value from `data`. Trailing bytes are ignored.
pub fn from_slice(data: &[u8]) -> Result<Value, DecodeError> {
    decode(&mut Source::new(data))?.read_value()
}

/// Finds where the first value of a growing buffer ends. Bytes that have been
/// scanned by an earlier call are not looked at again.
///
/// Only markers and length prefixes are inspected, so a complete frame may
/// still fail to decode.
#[derive(Debug, Default, Clone)]
pub struct Framer {
    /// Length of the complete items at the start of the buffer
    scanned: usize,
    /// Containers opened and not closed yet
    depth: usize,
}

impl Framer {
    /// Scan `data`, which must extend the data passed to earlier calls.
    ///
    /// Returns the length of the first value once `data` holds all of it. If
    /// the value cannot be decoded, returns the length up to the byte where
    /// decoding fails.
    pub fn frame_len(&mut self, data: &[u8]) -> Option<usize> {
        while let Some(&byte) = data.get(self.scanned) {
            let marker = match Marker::from_u8(byte) {
                Some(marker) => marker,
                None => return Some(self.scanned + 1),
            };
            let item_len = match (marker, marker.fixed_width()) {
                (_, Some(width)) => 1 + width,
                (Marker::String, None) | (Marker::Binary, None) => {
                    let mut prefix = data.get(self.scanned + 1..self.scanned + 5)?;
                    (prefix.get_u32() as usize).saturating_add(5)
                }
                (_, None) => 1,
            };
            if data.len() < self.scanned.saturating_add(item_len) {
                return None;
            }
            self.scanned += item_len;
            match marker {
                Marker::ListStart | Marker::ObjectStart => self.depth += 1,
                Marker::End if self.depth > 0 => self.depth -= 1,
                _ => {}
            }
            if self.depth == 0 || self.depth > MAX_DEPTH {
                return Some(self.scanned);
            }
        }
        None
    }
}

/// Read-once view of a single encoded value.
#[derive(Debug)]
#[must_use = "an input must be read or skipped to keep the source positioned"]
pub struct Input<'s, 'a> {
    source: &'s mut Source<'a>,
    marker: Marker,
    position: usize,
}

impl<'s, 'a> Input<'s, 'a> {
    /// Consume the marker byte of the next value.
    pub fn new(source: &'s mut Source<'a>) -> Result<Self, DecodeError> {
        let (marker, position) = source.read_marker()?;
        if marker == Marker::End {
            return Err(DecodeError::UnexpectedEnd { position });
        }
        Ok(Self {
            source,
            marker,
            position,
        })
    }

    /// Marker of the value. Never [Marker::End].
    pub fn marker(&self) -> Marker {
        self.marker
    }

    /// Position of the marker byte in the source.
    pub fn position(&self) -> usize {
        self.position
    }

    fn expect(&self, expected: Marker) -> Result<(), DecodeError> {
        if self.marker == expected {
            Ok(())
        } else {
            Err(DecodeError::UnexpectedMarker {
                expected,
                actual: self.marker,
                position: self.position,
            })
        }
    }

    fn take_fixed(self, expected: Marker) -> Result<&'a [u8], DecodeError> {
        self.expect(expected)?;
        let width = expected.fixed_width().unwrap_or(0);
        self.source.take(width)
    }

    pub fn read_null(self) -> Result<(), DecodeError> {
        self.take_fixed(Marker::Null)?;
        Ok(())
    }

    pub fn read_string(self) -> Result<String, DecodeError> {
        self.expect(Marker::String)?;
        self.source.read_str().map(str::to_string)
    }

    pub fn read_byte(self) -> Result<i8, DecodeError> {
        Ok(self.take_fixed(Marker::Byte)?.get_i8())
    }

    pub fn read_short(self) -> Result<i16, DecodeError> {
        Ok(self.take_fixed(Marker::Short)?.get_i16())
    }

    pub fn read_int(self) -> Result<i32, DecodeError> {
        Ok(self.take_fixed(Marker::Int)?.get_i32())
    }

    pub fn read_long(self) -> Result<i64, DecodeError> {
        Ok(self.take_fixed(Marker::Long)?.get_i64())
    }

    pub fn read_float(self) -> Result<f32, DecodeError> {
        Ok(self.take_fixed(Marker::Float)?.get_f32())
    }

    pub fn read_double(self) -> Result<f64, DecodeError> {
        Ok(self.take_fixed(Marker::Double)?.get_f64())
    }

    pub fn read_boolean(self) -> Result<bool, DecodeError> {
        let position = self.position + 1;
        match self.take_fixed(Marker::Boolean)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            byte => Err(DecodeError::InvalidBoolean { byte, position }),
        }
    }

    pub fn read_binary(self) -> Result<Bytes, DecodeError> {
        self.expect(Marker::Binary)?;
        let len = self.source.read_length()?;
        Ok(Bytes::copy_from_slice(self.source.take(len)?))
    }

    pub fn read_list(self) -> Result<ListInput<'s, 'a>, DecodeError> {
        self.expect(Marker::ListStart)?;
        Ok(ListInput {
            source: self.source,
            lookahead: Lookahead::NotFetched,
        })
    }

    pub fn read_object(self) -> Result<ObjectInput<'s, 'a>, DecodeError> {
        self.expect(Marker::ObjectStart)?;
        Ok(ObjectInput {
            source: self.source,
            lookahead: ObjectLookahead::NotFetched,
        })
    }

    /// Decode the complete value including all nested values.
    pub fn read_value(self) -> Result<Value, DecodeError> {
        self.read_value_at(0)
    }

    fn read_value_at(self, depth: usize) -> Result<Value, DecodeError> {
        Ok(match self.marker {
            Marker::Null => {
                self.read_null()?;
                Value::Null
            }
            Marker::String => Value::String(self.read_string()?),
            Marker::Byte => Value::Byte(self.read_byte()?),
            Marker::Short => Value::Short(self.read_short()?),
            Marker::Int => Value::Int(self.read_int()?),
            Marker::Long => Value::Long(self.read_long()?),
            Marker::Float => Value::Float(self.read_float()?),
            Marker::Double => Value::Double(self.read_double()?),
            Marker::Boolean => Value::Boolean(self.read_boolean()?),
            Marker::Binary => Value::Binary(self.read_binary()?),
            Marker::ListStart => {
                let depth = check_depth(self.source, depth)?;
                let mut list = self.read_list()?;
                let mut items = Vec::new();
                while list.has_next()? {
                    items.push(list.next()?.read_value_at(depth)?);
                }
                Value::List(items)
            }
            Marker::ObjectStart => {
                let depth = check_depth(self.source, depth)?;
                let mut object = self.read_object()?;
                let mut entries = Vec::new();
                while object.has_next()? {
                    let (key, input) = object.next()?;
                    entries.push((key, input.read_value_at(depth)?));
                }
                Value::Object(entries)
            }
            Marker::End => unreachable!("Input is never constructed for an end marker"),
        })
    }

    /// Consume the value without interpreting its payload.
    pub fn skip(self) -> Result<(), DecodeError> {
        self.source.skip_payload(self.marker, 0)
    }
}

fn check_depth(source: &Source<'_>, depth: usize) -> Result<usize, DecodeError> {
    let depth = depth + 1;
    if depth > MAX_DEPTH {
        Err(DecodeError::TooDeep {
            position: source.position(),
        })
    } else {
        Ok(depth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookahead {
    NotFetched,
    HasNext { marker: Marker, position: usize },
    Ended,
}

/// Sequential reader for the elements of an encoded list.
#[derive(Debug)]
pub struct ListInput<'s, 'a> {
    source: &'s mut Source<'a>,
    lookahead: Lookahead,
}

impl<'s, 'a> ListInput<'s, 'a> {
    /// Returns true if there is another element. Consumes the end marker when
    /// the list is exhausted. Calling this repeatedly does not advance the
    /// source.
    pub fn has_next(&mut self) -> Result<bool, DecodeError> {
        if self.lookahead == Lookahead::NotFetched {
            let (marker, position) = self.source.read_marker()?;
            self.lookahead = if marker == Marker::End {
                Lookahead::Ended
            } else {
                Lookahead::HasNext { marker, position }
            };
        }
        Ok(matches!(self.lookahead, Lookahead::HasNext { .. }))
    }

    /// Input for the next element. The input must be read or skipped before
    /// the list is used again.
    pub fn next(&mut self) -> Result<Input<'_, 'a>, DecodeError> {
        if !self.has_next()? {
            return Err(DecodeError::AlreadyEmptied {
                position: self.source.position(),
            });
        }
        match std::mem::replace(&mut self.lookahead, Lookahead::NotFetched) {
            Lookahead::HasNext { marker, position } => Ok(Input {
                source: &mut *self.source,
                marker,
                position,
            }),
            _ => unreachable!("has_next() returned true"),
        }
    }

    /// Skip all elements that have not been read and the end marker.
    pub fn skip_remaining(mut self) -> Result<(), DecodeError> {
        while self.has_next()? {
            self.next()?.skip()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ObjectLookahead {
    NotFetched,
    HasNext {
        key: String,
        marker: Marker,
        position: usize,
    },
    Ended,
}

/// Sequential reader for the entries of an encoded object.
#[derive(Debug)]
pub struct ObjectInput<'s, 'a> {
    source: &'s mut Source<'a>,
    lookahead: ObjectLookahead,
}

impl<'s, 'a> ObjectInput<'s, 'a> {
    /// Returns true if there is another entry. Reads the key and the marker
    /// of the value, or the end marker. Calling this repeatedly does not
    /// advance the source.
    pub fn has_next(&mut self) -> Result<bool, DecodeError> {
        if self.lookahead == ObjectLookahead::NotFetched {
            let (key_marker, key_position) = self.source.read_marker()?;
            self.lookahead = match key_marker {
                Marker::End => ObjectLookahead::Ended,
                Marker::String => {
                    let key = self.source.read_str()?.to_string();
                    let (marker, position) = self.source.read_marker()?;
                    if marker == Marker::End {
                        return Err(DecodeError::UnexpectedEnd { position });
                    }
                    ObjectLookahead::HasNext {
                        key,
                        marker,
                        position,
                    }
                }
                actual => {
                    return Err(DecodeError::UnexpectedMarker {
                        expected: Marker::String,
                        actual,
                        position: key_position,
                    })
                }
            };
        }
        Ok(matches!(self.lookahead, ObjectLookahead::HasNext { .. }))
    }

    /// Key and value input of the next entry. The input must be read or
    /// skipped before the object is used again.
    pub fn next(&mut self) -> Result<(String, Input<'_, 'a>), DecodeError> {
        if !self.has_next()? {
            return Err(DecodeError::AlreadyEmptied {
                position: self.source.position(),
            });
        }
        match std::mem::replace(&mut self.lookahead, ObjectLookahead::NotFetched) {
            ObjectLookahead::HasNext {
                key,
                marker,
                position,
            } => Ok((
                key,
                Input {
                    source: &mut *self.source,
                    marker,
                    position,
                },
            )),
            _ => unreachable!("has_next() returned true"),
        }
    }

    /// Skip all entries that have not been read and the end marker.
    pub fn skip_remaining(mut self) -> Result<(), DecodeError> {
        while self.has_next()? {
            self.next()?.1.skip()?;
        }
        Ok(())
    }
}
