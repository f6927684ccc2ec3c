//! Binary decoder.

use crate::encoder::{TAG_ARRAY, TAG_BOOL, TAG_BYTES, TAG_INTEGER, TAG_MAP, TAG_NULL, TAG_TEXT};
use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Decodes a value from its binary form.
///
/// The entire input must be consumed; trailing bytes are an error.
/// Map entries are re-canonicalised on the way in, so a decoded value
/// always satisfies the sorted-map invariant regardless of input order.
pub fn decode_value(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.decode()?;
    if decoder.pos < bytes.len() {
        return Err(CodecError::TrailingBytes {
            remaining: bytes.len() - decoder.pos,
        });
    }
    Ok(value)
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn decode(&mut self) -> CodecResult<Value> {
        let offset = self.pos;
        let tag = self.take_byte()?;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => Ok(Value::Bool(self.take_byte()? != 0)),
            TAG_INTEGER => {
                let raw = self.take_bytes(8)?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(raw);
                Ok(Value::Integer(i64::from_le_bytes(arr)))
            }
            TAG_BYTES => {
                let len = self.take_len()?;
                Ok(Value::Bytes(self.take_bytes(len)?.to_vec()))
            }
            TAG_TEXT => {
                let len = self.take_len()?;
                let text_offset = self.pos;
                let raw = self.take_bytes(len)?.to_vec();
                String::from_utf8(raw)
                    .map(Value::Text)
                    .map_err(|_| CodecError::InvalidUtf8 {
                        offset: text_offset,
                    })
            }
            TAG_ARRAY => {
                let count = self.take_len()?;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.decode()?);
                }
                Ok(Value::Array(items))
            }
            TAG_MAP => {
                let count = self.take_len()?;
                let mut pairs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let key_len = self.take_len()?;
                    let key_offset = self.pos;
                    let raw = self.take_bytes(key_len)?.to_vec();
                    let key = String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8 {
                        offset: key_offset,
                    })?;
                    let value = self.decode()?;
                    pairs.push((key, value));
                }
                Ok(Value::map(pairs))
            }
            tag => Err(CodecError::InvalidTag { tag, offset }),
        }
    }

    fn take_byte(&mut self) -> CodecResult<u8> {
        if self.pos >= self.bytes.len() {
            return Err(CodecError::UnexpectedEnd { offset: self.pos });
        }
        let byte = self.bytes[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn take_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.bytes.len() - self.pos < len {
            return Err(CodecError::UnexpectedEnd {
                offset: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_len(&mut self) -> CodecResult<usize> {
        let raw = self.take_bytes(4)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(raw);
        Ok(u32::from_le_bytes(arr) as usize)
    }
}
