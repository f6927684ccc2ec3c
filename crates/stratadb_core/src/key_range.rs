//! Key ranges over lexicographically ordered keys.

use std::ops::Bound;

/// A bounded interval over keys with explicit inclusivity.
///
/// Keys compare by unsigned lexicographic byte order (the natural `str`
/// ordering). A range with no bounds includes every key.
///
/// # Example
///
/// ```rust
/// use stratadb_core::KeyRange;
///
/// let range = KeyRange::bound("a", "c", false, true);
/// assert!(range.includes("a"));
/// assert!(range.includes("b"));
/// assert!(!range.includes("c"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Option<(String, bool)>,
    upper: Option<(String, bool)>,
}

impl KeyRange {
    /// A range bounded below only.
    pub fn lower_bound(key: impl Into<String>, exclusive: bool) -> Self {
        Self {
            lower: Some((key.into(), exclusive)),
            upper: None,
        }
    }

    /// A range bounded above only.
    pub fn upper_bound(key: impl Into<String>, exclusive: bool) -> Self {
        Self {
            lower: None,
            upper: Some((key.into(), exclusive)),
        }
    }

    /// A range bounded on both sides.
    pub fn bound(
        lower: impl Into<String>,
        upper: impl Into<String>,
        lower_exclusive: bool,
        upper_exclusive: bool,
    ) -> Self {
        Self {
            lower: Some((lower.into(), lower_exclusive)),
            upper: Some((upper.into(), upper_exclusive)),
        }
    }

    /// A range containing exactly one key.
    pub fn only(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            lower: Some((key.clone(), false)),
            upper: Some((key, false)),
        }
    }

    /// Returns the lower bound as `(key, exclusive)`.
    #[must_use]
    pub fn lower(&self) -> Option<(&str, bool)> {
        self.lower.as_ref().map(|(k, e)| (k.as_str(), *e))
    }

    /// Returns the upper bound as `(key, exclusive)`.
    #[must_use]
    pub fn upper(&self) -> Option<(&str, bool)> {
        self.upper.as_ref().map(|(k, e)| (k.as_str(), *e))
    }

    /// Whether `key` falls inside the range. Total over all keys.
    #[must_use]
    pub fn includes(&self, key: &str) -> bool {
        if let Some((lower, exclusive)) = &self.lower {
            let lower = lower.as_str();
            if key < lower || (*exclusive && key == lower) {
                return false;
            }
        }
        if let Some((upper, exclusive)) = &self.upper {
            let upper = upper.as_str();
            if key > upper || (*exclusive && key == upper) {
                return false;
            }
        }
        true
    }
}

/// Translates an optional range into `BTreeMap`-compatible bounds.
///
/// Returns `None` when the interval is provably empty (inverted or
/// equal-with-exclusion), which `BTreeMap::range` would panic on.
pub(crate) fn string_bounds(range: Option<&KeyRange>) -> Option<(Bound<String>, Bound<String>)> {
    let Some(range) = range else {
        return Some((Bound::Unbounded, Bound::Unbounded));
    };
    if let (Some((lo, lo_ex)), Some((hi, hi_ex))) = (range.lower(), range.upper()) {
        if lo > hi || (lo == hi && (lo_ex || hi_ex)) {
            return None;
        }
    }
    let lower = match range.lower() {
        Some((k, true)) => Bound::Excluded(k.to_string()),
        Some((k, false)) => Bound::Included(k.to_string()),
        None => Bound::Unbounded,
    };
    let upper = match range.upper() {
        Some((k, true)) => Bound::Excluded(k.to_string()),
        Some((k, false)) => Bound::Included(k.to_string()),
        None => Bound::Unbounded,
    };
    Some((lower, upper))
}
