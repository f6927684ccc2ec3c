//! Dynamic value type and key paths.

use std::fmt;

/// A dynamic StrataDB value.
///
/// Values are what object stores hold and what codecs translate to and
/// from stored bytes. Floats are intentionally not supported: every value
/// has exactly one canonical encoding, which keeps stored-state equality
/// checks byte-stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Text string (UTF-8).
    Text(String),
    /// Array of values.
    Array(Vec<Value>),
    /// Map with string keys, kept sorted for canonical form.
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Creates a text value.
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Creates an integer value.
    #[must_use]
    pub const fn int(n: i64) -> Self {
        Value::Integer(n)
    }

    /// Creates a map value with entries sorted by key.
    ///
    /// Later duplicates of a key win, matching insertion-order update
    /// semantics.
    #[must_use]
    pub fn map(pairs: Vec<(String, Value)>) -> Self {
        let mut sorted: Vec<(String, Value)> = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match sorted.binary_search_by(|(k, _)| k.as_str().cmp(&key)) {
                Ok(i) => sorted[i].1 = value,
                Err(i) => sorted.insert(i, (key, value)),
            }
        }
        Value::Map(sorted)
    }

    /// Looks up a field in a map value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .binary_search_by(|(k, _)| k.as_str().cmp(name))
                .ok()
                .map(|i| &pairs[i].1),
            _ => None,
        }
    }

    /// Returns the text content if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content if this is an integer value.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Produces the order-preserving ASCII index key for a scalar value.
    ///
    /// Returns `None` for values that have no index key of their own:
    /// `Null`, `Array` (arrays participate in indices only through
    /// multi-entry expansion), `Map`, and text containing ASCII control
    /// characters (which would collide with index entry separators).
    ///
    /// Within one type, string ordering of the produced keys matches the
    /// natural ordering of the values. Keys of different types sort by
    /// their type tag: booleans, then integers, then text, then bytes.
    #[must_use]
    pub fn index_key(&self) -> Option<String> {
        match self {
            Value::Null | Value::Array(_) | Value::Map(_) => None,
            Value::Bool(b) => Some(if *b { "b1" } else { "b0" }.to_string()),
            Value::Integer(n) => {
                // Flip the sign bit so the unsigned image orders the same
                // way as the signed value, then fix the decimal width.
                let biased = (*n ^ i64::MIN) as u64;
                Some(format!("i{biased:020}"))
            }
            Value::Text(s) => {
                if s.bytes().any(|b| b < 0x20 || b == 0x7F) {
                    return None;
                }
                Some(format!("s{s}"))
            }
            Value::Bytes(b) => {
                let mut key = String::with_capacity(1 + b.len() * 2);
                key.push('x');
                for byte in b {
                    key.push_str(&format!("{byte:02x}"));
                }
                Some(key)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// A dotted field path into nested map values.
///
/// `KeyPath::new("address.city")` resolves `value["address"]["city"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    /// Creates a key path from a dotted string.
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            segments: path.as_ref().split('.').map(str::to_string).collect(),
        }
    }

    /// Creates a key path from explicit segments.
    #[must_use]
    pub fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// Returns the path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Resolves the path against a value.
    ///
    /// Returns `None` as soon as a segment is missing or the current
    /// value is not a map.
    #[must_use]
    pub fn extract<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let mut current = value;
        for segment in &self.segments {
            current = current.field(segment)?;
        }
        Some(current)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_sorts_entries() {
        let value = Value::map(vec![
            ("b".to_string(), Value::int(2)),
            ("a".to_string(), Value::int(1)),
        ]);
        if let Value::Map(pairs) = &value {
            assert_eq!(pairs[0].0, "a");
            assert_eq!(pairs[1].0, "b");
        } else {
            panic!("expected map");
        }
    }

    #[test]
    fn map_later_duplicate_wins() {
        let value = Value::map(vec![
            ("k".to_string(), Value::int(1)),
            ("k".to_string(), Value::int(2)),
        ]);
        assert_eq!(value.field("k"), Some(&Value::int(2)));
    }

    #[test]
    fn field_lookup() {
        let value = Value::map(vec![("name".to_string(), Value::text("ada"))]);
        assert_eq!(value.field("name"), Some(&Value::text("ada")));
        assert_eq!(value.field("missing"), None);
        assert_eq!(Value::int(1).field("name"), None);
    }

    #[test]
    fn key_path_extracts_nested() {
        let value = Value::map(vec![(
            "address".to_string(),
            Value::map(vec![("city".to_string(), Value::text("oslo"))]),
        )]);

        assert_eq!(
            KeyPath::new("address.city").extract(&value),
            Some(&Value::text("oslo"))
        );
        assert_eq!(KeyPath::new("address.zip").extract(&value), None);
        assert_eq!(KeyPath::new("address.city.extra").extract(&value), None);
    }

    // === Index keys ===

    #[test]
    fn index_key_integers_order() {
        let cases = [i64::MIN, -100, -1, 0, 1, 42, i64::MAX];
        let keys: Vec<String> = cases
            .iter()
            .map(|n| Value::int(*n).index_key().unwrap())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn index_key_text_passthrough() {
        assert_eq!(Value::text("abc").index_key(), Some("sabc".to_string()));
        // Control characters cannot be index keys
        assert_eq!(Value::text("a\u{1f}b").index_key(), None);
        assert_eq!(Value::text("a\nb").index_key(), None);
    }

    #[test]
    fn index_key_type_tags_separate_types() {
        let b = Value::Bool(true).index_key().unwrap();
        let i = Value::int(0).index_key().unwrap();
        let s = Value::text("").index_key().unwrap();
        let x = Value::Bytes(vec![]).index_key().unwrap();
        assert!(b < i && i < s && s < x);
    }

    #[test]
    fn index_key_non_scalars_have_none() {
        assert_eq!(Value::Null.index_key(), None);
        assert_eq!(Value::Array(vec![Value::int(1)]).index_key(), None);
        assert_eq!(Value::map(vec![]).index_key(), None);
    }

    #[test]
    fn index_key_bytes_hex_order() {
        let a = Value::Bytes(vec![0x01]).index_key().unwrap();
        let b = Value::Bytes(vec![0x02]).index_key().unwrap();
        let c = Value::Bytes(vec![0x01, 0x00]).index_key().unwrap();
        assert!(a < b);
        assert!(a < c && c < b);
    }
}
