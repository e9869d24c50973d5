//! Typed value encoding: the single typed boundary the core exposes.
//!
//! Every other layer (`StoreManager`, `LockManager`, `TtlNamespace`) is
//! byte-oriented; callers marshal through [`encode`]/[`decode`] with a
//! [`TypeTag`] describing the shape on both sides, so the wire format never
//! has to know what an SPL type is -- only the caller does.
//!
//! # Format
//!
//! Scalars are fixed-width little-endian. Strings and blobs are
//! length-prefixed: a length `< 255` is a single length byte; otherwise the
//! byte `0xFF` is followed by a 4-byte little-endian `u32` length (the
//! "tagged 5-byte length"). Composites recurse using the same
//! length-prefix rule for their element count.

use crate::error::{DpsError, ErrorCode};

/// Textual descriptor of a value's type shape. Used only for diagnostics,
/// `putSafe`/`getSafe` drift detection, and cross-language readability --
/// never interpreted structurally by the codec itself.
pub type TypeTag = str;

const LONG_LEN_MARKER: u8 = 0xFF;

/// A typed value the codec can encode/decode.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    /// 64-bit signed integer (SPL `int64`).
    Int64(i64),
    /// IEEE-754 double (SPL `float64`).
    Float64(f64),
    /// Boolean.
    Bool(bool),
    /// Byte-oriented string (SPL `rstring`).
    Rstring(String),
    /// Unicode string (SPL `ustring`); same wire shape as `Rstring`.
    Ustring(String),
    /// Opaque byte blob (SPL `blob`).
    Blob(Vec<u8>),
    /// Homogeneous list.
    List(Vec<TypedValue>),
    /// Named-field tuple, encoded in declaration order.
    Tuple(Vec<(String, TypedValue)>),
}

fn push_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.len() < LONG_LEN_MARKER as usize {
        buf.push(bytes.len() as u8);
    } else {
        buf.push(LONG_LEN_MARKER);
        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    }
    buf.extend_from_slice(bytes);
}

fn read_len_prefixed<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8], DpsError> {
    let marker = *buf
        .get(*pos)
        .ok_or_else(|| DpsError::new(ErrorCode::CodecMalformed))?;
    *pos += 1;
    let len = if marker == LONG_LEN_MARKER {
        let bytes: [u8; 4] = buf
            .get(*pos..*pos + 4)
            .ok_or_else(|| DpsError::new(ErrorCode::CodecMalformed))?
            .try_into()
            .map_err(|_| DpsError::new(ErrorCode::CodecMalformed))?;
        *pos += 4;
        u32::from_le_bytes(bytes) as usize
    } else {
        marker as usize
    };
    let slice = buf
        .get(*pos..*pos + len)
        .ok_or_else(|| DpsError::new(ErrorCode::CodecMalformed))?;
    *pos += len;
    Ok(slice)
}

fn type_discriminant(value: &TypedValue) -> u8 {
    match value {
        TypedValue::Int64(_) => 0,
        TypedValue::Float64(_) => 1,
        TypedValue::Bool(_) => 2,
        TypedValue::Rstring(_) => 3,
        TypedValue::Ustring(_) => 4,
        TypedValue::Blob(_) => 5,
        TypedValue::List(_) => 6,
        TypedValue::Tuple(_) => 7,
    }
}

fn encode_into(buf: &mut Vec<u8>, value: &TypedValue) {
    buf.push(type_discriminant(value));
    match value {
        TypedValue::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        TypedValue::Float64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        TypedValue::Bool(v) => buf.push(u8::from(*v)),
        TypedValue::Rstring(s) | TypedValue::Ustring(s) => {
            push_len_prefixed(buf, s.as_bytes());
        }
        TypedValue::Blob(b) => push_len_prefixed(buf, b),
        TypedValue::List(items) => {
            push_len_prefixed(buf, &(items.len() as u32).to_le_bytes());
            for item in items {
                encode_into(buf, item);
            }
        }
        TypedValue::Tuple(fields) => {
            push_len_prefixed(buf, &(fields.len() as u32).to_le_bytes());
            for (name, v) in fields {
                push_len_prefixed(buf, name.as_bytes());
                encode_into(buf, v);
            }
        }
    }
}

fn decode_from(buf: &[u8], pos: &mut usize) -> Result<TypedValue, DpsError> {
    let tag = *buf
        .get(*pos)
        .ok_or_else(|| DpsError::new(ErrorCode::CodecMalformed))?;
    *pos += 1;
    match tag {
        0 => {
            let bytes: [u8; 8] = buf
                .get(*pos..*pos + 8)
                .ok_or_else(|| DpsError::new(ErrorCode::CodecMalformed))?
                .try_into()
                .map_err(|_| DpsError::new(ErrorCode::CodecMalformed))?;
            *pos += 8;
            Ok(TypedValue::Int64(i64::from_le_bytes(bytes)))
        }
        1 => {
            let bytes: [u8; 8] = buf
                .get(*pos..*pos + 8)
                .ok_or_else(|| DpsError::new(ErrorCode::CodecMalformed))?
                .try_into()
                .map_err(|_| DpsError::new(ErrorCode::CodecMalformed))?;
            *pos += 8;
            Ok(TypedValue::Float64(f64::from_le_bytes(bytes)))
        }
        2 => {
            let b = *buf
                .get(*pos)
                .ok_or_else(|| DpsError::new(ErrorCode::CodecMalformed))?;
            *pos += 1;
            Ok(TypedValue::Bool(b != 0))
        }
        3 | 4 => {
            let slice = read_len_prefixed(buf, pos)?;
            let s = String::from_utf8(slice.to_vec())
                .map_err(|_| DpsError::new(ErrorCode::CodecMalformed))?;
            Ok(if tag == 3 {
                TypedValue::Rstring(s)
            } else {
                TypedValue::Ustring(s)
            })
        }
        5 => {
            let slice = read_len_prefixed(buf, pos)?;
            Ok(TypedValue::Blob(slice.to_vec()))
        }
        6 => {
            let count_bytes = read_len_prefixed(buf, pos)?;
            let count = u32::from_le_bytes(
                count_bytes
                    .try_into()
                    .map_err(|_| DpsError::new(ErrorCode::CodecMalformed))?,
            );
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_from(buf, pos)?);
            }
            Ok(TypedValue::List(items))
        }
        7 => {
            let count_bytes = read_len_prefixed(buf, pos)?;
            let count = u32::from_le_bytes(
                count_bytes
                    .try_into()
                    .map_err(|_| DpsError::new(ErrorCode::CodecMalformed))?,
            );
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name_slice = read_len_prefixed(buf, pos)?;
                let name = String::from_utf8(name_slice.to_vec())
                    .map_err(|_| DpsError::new(ErrorCode::CodecMalformed))?;
                fields.push((name, decode_from(buf, pos)?));
            }
            Ok(TypedValue::Tuple(fields))
        }
        _ => Err(DpsError::new(ErrorCode::CodecMalformed)),
    }
}

/// Encodes `value` to a self-describing byte sequence. The `type_tag` is
/// accepted for API symmetry with `decode` and diagnostics but is not
/// structurally required by this format (the discriminant byte is
/// self-describing); it is not re-validated here.
pub fn encode(value: &TypedValue, _type_tag: &TypeTag) -> Result<Vec<u8>, DpsError> {
    let mut buf = Vec::new();
    encode_into(&mut buf, value);
    Ok(buf)
}

/// Decodes `bytes` produced by [`encode`]. Errors with
/// [`ErrorCode::CodecMalformed`] if trailing bytes remain or a length
/// prefix is inconsistent with the buffer.
pub fn decode(bytes: &[u8], _type_tag: &TypeTag) -> Result<TypedValue, DpsError> {
    let mut pos = 0;
    let value = decode_from(bytes, &mut pos)?;
    if pos != bytes.len() {
        return Err(DpsError::new(ErrorCode::CodecMalformed));
    }
    Ok(value)
}

/// Raw mode: stores a string value's UTF-8 bytes without a length prefix,
/// so native backend tools (e.g. `redis-cli GET`) can read it directly.
/// Rejected for anything but `Rstring`/`Ustring`.
pub fn encode_raw(value: &TypedValue) -> Result<Vec<u8>, DpsError> {
    match value {
        TypedValue::Rstring(s) | TypedValue::Ustring(s) => Ok(s.clone().into_bytes()),
        _ => Err(DpsError::with_context(
            ErrorCode::CodecMalformed,
            "raw mode only supports rstring/ustring",
        )),
    }
}

/// Decodes exactly one value from the front of `bytes` and returns how many
/// bytes it occupied, without requiring the rest of the buffer to be
/// consumed. Used to walk a concatenation of codec-encoded key/value blocks
/// (`StoreManager::serialize`/`deserialize`) where each block's own length
/// prefixes are the only framing -- there is no outer length on top.
pub fn encoded_len(bytes: &[u8]) -> Result<usize, DpsError> {
    let mut pos = 0;
    decode_from(bytes, &mut pos)?;
    Ok(pos)
}

/// Inverse of [`encode_raw`]. `as_ustring` selects whether the recovered
/// string is tagged `Ustring` (`true`) or `Rstring` (`false`).
pub fn decode_raw(bytes: &[u8], as_ustring: bool) -> Result<TypedValue, DpsError> {
    let s = String::from_utf8(bytes.to_vec())
        .map_err(|_| DpsError::new(ErrorCode::CodecMalformed))?;
    Ok(if as_ustring {
        TypedValue::Ustring(s)
    } else {
        TypedValue::Rstring(s)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn typed_value_strategy() -> impl Strategy<Value = TypedValue> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(TypedValue::Int64),
            any::<f64>().prop_map(TypedValue::Float64),
            any::<bool>().prop_map(TypedValue::Bool),
            ".*".prop_map(TypedValue::Rstring),
            proptest::collection::vec(any::<u8>(), 0..300).prop_map(TypedValue::Blob),
        ];
        leaf.prop_recursive(3, 64, 8, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..8).prop_map(TypedValue::List),
                proptest::collection::vec((".*", inner), 0..8).prop_map(TypedValue::Tuple),
            ]
        })
    }

    proptest! {
        #[test]
        fn round_trip(value in typed_value_strategy()) {
            let encoded = encode(&value, "any").unwrap();
            let decoded = decode(&encoded, "any").unwrap();
            prop_assert_eq!(decoded, value);
        }
    }

    #[test]
    fn long_string_uses_tagged_length() {
        let s = "x".repeat(1000);
        let encoded = encode(&TypedValue::Rstring(s.clone()), "rstring").unwrap();
        // discriminant + 0xFF marker + 4-byte length + payload
        assert_eq!(encoded[0], 3);
        assert_eq!(encoded[1], LONG_LEN_MARKER);
        let decoded = decode(&encoded, "rstring").unwrap();
        assert_eq!(decoded, TypedValue::Rstring(s));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = encode(&TypedValue::Int64(42), "int64").unwrap();
        encoded.push(0);
        let err = decode(&encoded, "int64").unwrap_err();
        assert_eq!(err.code, ErrorCode::CodecMalformed);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let encoded = encode(&TypedValue::Rstring("hello".into()), "rstring").unwrap();
        let err = decode(&encoded[..encoded.len() - 1], "rstring").unwrap_err();
        assert_eq!(err.code, ErrorCode::CodecMalformed);
    }

    #[test]
    fn raw_mode_round_trips_strings() {
        let raw = encode_raw(&TypedValue::Rstring("plain-text".into())).unwrap();
        assert_eq!(raw, b"plain-text");
        let decoded = decode_raw(&raw, false).unwrap();
        assert_eq!(decoded, TypedValue::Rstring("plain-text".into()));
    }

    #[test]
    fn raw_mode_rejects_non_string_types() {
        let err = encode_raw(&TypedValue::Int64(1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::CodecMalformed);
    }

    #[test]
    fn encoded_len_stops_at_the_value_boundary() {
        let first = encode(&TypedValue::Int64(7), "int64").unwrap();
        let second = encode(&TypedValue::Rstring("tail".into()), "rstring").unwrap();
        let mut concatenated = first.clone();
        concatenated.extend_from_slice(&second);

        let consumed = encoded_len(&concatenated).unwrap();
        assert_eq!(consumed, first.len());
        let remainder_len = encoded_len(&concatenated[consumed..]).unwrap();
        assert_eq!(remainder_len, second.len());
    }

    #[test]
    fn nested_tuple_round_trips() {
        let value = TypedValue::Tuple(vec![
            ("name".to_string(), TypedValue::Rstring("alpha".to_string())),
            (
                "tags".to_string(),
                TypedValue::List(vec![TypedValue::Int64(1), TypedValue::Int64(2)]),
            ),
        ]);
        let encoded = encode(&value, "tuple").unwrap();
        let decoded = decode(&encoded, "tuple").unwrap();
        assert_eq!(decoded, value);
    }
}
