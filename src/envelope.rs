//! Two-stage MessagePack envelope decoding
//!
//! Responses are plain MessagePack. Some requests carry a proprietary header
//! in front of the MessagePack body whose only understood field is the
//! leading little-endian `u32`: the number of header bytes that follow it.
//! Nothing else in the header is interpreted.

use rmp::Marker;
use rmpv::Value;
use thiserror::Error;

/// Nesting limit handed to the MessagePack reader
pub const DEFAULT_MAX_DEPTH: usize = 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed MessagePack: {0}")]
    Malformed(#[from] rmpv::decode::Error),
    #[error("{trailing} trailing bytes after a complete value")]
    TrailingBytes { trailing: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("reserved marker 0xc1 at offset {offset}")]
    ReservedMarker { offset: usize },
    #[error("header of {header_size} bytes does not fit a {len}-byte message")]
    HeaderOutOfBounds { header_size: u64, len: usize },
}

/// How the structured payload was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// The whole buffer was the payload
    Bare,
    /// The payload followed a length-prefixed header
    Headered { header_size: usize },
}

/// A successfully decoded message body
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEnvelope {
    value: Value,
    framing: Framing,
}

impl DecodedEnvelope {
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

#[derive(Debug, Clone)]
pub struct EnvelopeDecoder {
    max_depth: usize,
}

impl Default for EnvelopeDecoder {
    fn default() -> Self {
        EnvelopeDecoder {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl EnvelopeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Decode a captured buffer; only requests get the header-stripping retry
    pub fn decode(&self, bytes: &[u8], is_request: bool) -> Result<DecodedEnvelope, DecodeError> {
        let direct = match self.parse(bytes) {
            Ok(value) => {
                return Ok(DecodedEnvelope {
                    value,
                    framing: Framing::Bare,
                })
            }
            Err(err) => err,
        };

        if !is_request || bytes.len() < 4 {
            return Err(direct);
        }

        let offset = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let header_size = 4 + u64::from(offset);
        if header_size == 0 || header_size >= bytes.len() as u64 {
            return Err(DecodeError::HeaderOutOfBounds {
                header_size,
                len: bytes.len(),
            });
        }

        let header_size = header_size as usize;
        let value = self.parse(&bytes[header_size..])?;
        Ok(DecodedEnvelope {
            value,
            framing: Framing::Headered { header_size },
        })
    }

    /// Parse exactly one value spanning the whole buffer
    fn parse(&self, bytes: &[u8]) -> Result<Value, DecodeError> {
        let mut cursor = bytes;
        let value = rmpv::decode::read_value_with_max_depth(&mut cursor, self.max_depth)?;
        if !cursor.is_empty() {
            return Err(DecodeError::TrailingBytes {
                trailing: cursor.len(),
            });
        }
        // rmpv reads 0xc1 as nil
        if let Some(offset) = reserved_marker(bytes) {
            return Err(DecodeError::ReservedMarker { offset });
        }
        if !strings_are_utf8(&value) {
            return Err(DecodeError::InvalidUtf8);
        }
        Ok(value)
    }
}

/// Offset of the first reserved marker in the value starting at `bytes[0]`
///
/// Only called on buffers rmpv already parsed, so running off the end just
/// ends the walk.
fn reserved_marker(bytes: &[u8]) -> Option<usize> {
    let mut pos = 0usize;
    let mut pending: u64 = 1;
    while pending > 0 {
        pending -= 1;
        let at = pos;
        let marker = Marker::from_u8(*bytes.get(pos)?);
        pos += 1;

        let (payload, children) = match marker {
            Marker::Reserved => return Some(at),
            Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => (0, 0),
            Marker::U8 | Marker::I8 => (1, 0),
            Marker::U16 | Marker::I16 => (2, 0),
            Marker::U32 | Marker::I32 | Marker::F32 => (4, 0),
            Marker::U64 | Marker::I64 | Marker::F64 => (8, 0),
            Marker::FixStr(len) => (u64::from(len), 0),
            Marker::Str8 | Marker::Bin8 => (be_len(bytes, &mut pos, 1)?, 0),
            Marker::Str16 | Marker::Bin16 => (be_len(bytes, &mut pos, 2)?, 0),
            Marker::Str32 | Marker::Bin32 => (be_len(bytes, &mut pos, 4)?, 0),
            Marker::FixArray(len) => (0, u64::from(len)),
            Marker::Array16 => (0, be_len(bytes, &mut pos, 2)?),
            Marker::Array32 => (0, be_len(bytes, &mut pos, 4)?),
            Marker::FixMap(len) => (0, 2 * u64::from(len)),
            Marker::Map16 => (0, 2 * be_len(bytes, &mut pos, 2)?),
            Marker::Map32 => (0, 2 * be_len(bytes, &mut pos, 4)?),
            // ext payloads carry a type byte before the data
            Marker::FixExt1 => (2, 0),
            Marker::FixExt2 => (3, 0),
            Marker::FixExt4 => (5, 0),
            Marker::FixExt8 => (9, 0),
            Marker::FixExt16 => (17, 0),
            Marker::Ext8 => (be_len(bytes, &mut pos, 1)? + 1, 0),
            Marker::Ext16 => (be_len(bytes, &mut pos, 2)? + 1, 0),
            Marker::Ext32 => (be_len(bytes, &mut pos, 4)? + 1, 0),
        };

        pos = pos.checked_add(usize::try_from(payload).ok()?)?;
        pending = pending.checked_add(children)?;
    }
    None
}

fn be_len(bytes: &[u8], pos: &mut usize, width: usize) -> Option<u64> {
    let raw = bytes.get(*pos..*pos + width)?;
    *pos += width;
    Some(raw.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
}

fn strings_are_utf8(value: &Value) -> bool {
    match value {
        Value::String(s) => s.is_str(),
        Value::Array(items) => items.iter().all(strings_are_utf8),
        Value::Map(entries) => entries
            .iter()
            .all(|(key, value)| strings_are_utf8(key) && strings_are_utf8(value)),
        _ => true,
    }
}
