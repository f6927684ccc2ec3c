//! Error types for value encoding and decoding.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The input ended before the value was complete.
    #[error("unexpected end of input at byte {offset}")]
    UnexpectedEnd {
        /// Byte offset where more input was expected.
        offset: usize,
    },

    /// An unknown type tag was encountered.
    #[error("invalid type tag {tag:#04x} at byte {offset}")]
    InvalidTag {
        /// The offending tag byte.
        tag: u8,
        /// Byte offset of the tag.
        offset: usize,
    },

    /// A text field is not valid UTF-8.
    #[error("invalid UTF-8 in text at byte {offset}")]
    InvalidUtf8 {
        /// Byte offset of the text field.
        offset: usize,
    },

    /// Input remained after a complete value was decoded.
    #[error("trailing bytes after value: {remaining} bytes")]
    TrailingBytes {
        /// Number of undecoded bytes.
        remaining: usize,
    },
}
