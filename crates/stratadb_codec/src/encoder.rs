//! Canonical binary encoder.

use crate::value::Value;

/// Type tag bytes in the binary format.
pub(crate) const TAG_NULL: u8 = 0x00;
pub(crate) const TAG_BOOL: u8 = 0x01;
pub(crate) const TAG_INTEGER: u8 = 0x02;
pub(crate) const TAG_BYTES: u8 = 0x03;
pub(crate) const TAG_TEXT: u8 = 0x04;
pub(crate) const TAG_ARRAY: u8 = 0x05;
pub(crate) const TAG_MAP: u8 = 0x06;

/// Encodes a value to its canonical binary form.
///
/// The output is deterministic: map entries encode in sorted key order
/// (the order [`Value::map`] maintains), so equal values always produce
/// equal bytes.
#[must_use]
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.encode(value);
    encoder.into_bytes()
}

/// A canonical binary encoder.
pub struct Encoder {
    buffer: Vec<u8>,
}

impl Encoder {
    /// Creates a new encoder.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Encodes a value into the buffer.
    pub fn encode(&mut self, value: &Value) {
        match value {
            Value::Null => self.buffer.push(TAG_NULL),
            Value::Bool(b) => {
                self.buffer.push(TAG_BOOL);
                self.buffer.push(u8::from(*b));
            }
            Value::Integer(n) => {
                self.buffer.push(TAG_INTEGER);
                self.buffer.extend_from_slice(&n.to_le_bytes());
            }
            Value::Bytes(bytes) => {
                self.buffer.push(TAG_BYTES);
                self.push_len(bytes.len());
                self.buffer.extend_from_slice(bytes);
            }
            Value::Text(text) => {
                self.buffer.push(TAG_TEXT);
                self.push_len(text.len());
                self.buffer.extend_from_slice(text.as_bytes());
            }
            Value::Array(items) => {
                self.buffer.push(TAG_ARRAY);
                self.push_len(items.len());
                for item in items {
                    self.encode(item);
                }
            }
            Value::Map(pairs) => {
                self.buffer.push(TAG_MAP);
                self.push_len(pairs.len());
                for (key, item) in pairs {
                    self.push_len(key.len());
                    self.buffer.extend_from_slice(key.as_bytes());
                    self.encode(item);
                }
            }
        }
    }

    /// Consumes the encoder and returns the encoded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    fn push_len(&mut self, len: usize) {
        self.buffer.extend_from_slice(&(len as u32).to_le_bytes());
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_null_is_single_byte() {
        assert_eq!(encode_value(&Value::Null), vec![TAG_NULL]);
    }

    #[test]
    fn encode_bool() {
        assert_eq!(encode_value(&Value::Bool(false)), vec![TAG_BOOL, 0]);
        assert_eq!(encode_value(&Value::Bool(true)), vec![TAG_BOOL, 1]);
    }

    #[test]
    fn encode_integer_little_endian() {
        let bytes = encode_value(&Value::int(1));
        assert_eq!(bytes[0], TAG_INTEGER);
        assert_eq!(&bytes[1..], &1i64.to_le_bytes());
    }

    #[test]
    fn equal_maps_encode_identically() {
        let a = Value::map(vec![
            ("x".to_string(), Value::int(1)),
            ("y".to_string(), Value::int(2)),
        ]);
        let b = Value::map(vec![
            ("y".to_string(), Value::int(2)),
            ("x".to_string(), Value::int(1)),
        ]);
        assert_eq!(encode_value(&a), encode_value(&b));
    }
}
