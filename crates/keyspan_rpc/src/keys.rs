//! Region key-range helpers.
//!
//! Region ranges are lexicographic and end-exclusive. An empty `end_key` is
//! the explicit "+infinity" sentinel: a region whose `end_key` is empty covers
//! everything from `start_key` onward. Every range comparison in the workspace
//! goes through these helpers so the sentinel has exactly one interpretation.

use std::cmp::Ordering;

/// Compares two end keys, treating an empty key as +infinity.
pub fn end_key_cmp(a: &[u8], b: &[u8]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

/// Checks whether `key` falls within `[start, end)` where empty bounds are open.
pub fn key_in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    let lower_ok = start.is_empty() || key >= start;
    let upper_ok = end.is_empty() || key < end;
    lower_ok && upper_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_end_key_is_infinite() {
        assert_eq!(end_key_cmp(b"", b""), Ordering::Equal);
        assert_eq!(end_key_cmp(b"", b"zzz"), Ordering::Greater);
        assert_eq!(end_key_cmp(b"zzz", b""), Ordering::Less);
        assert_eq!(end_key_cmp(b"a", b"b"), Ordering::Less);
    }

    #[test]
    fn range_membership_with_open_bounds() {
        assert!(key_in_range(b"m", b"", b""));
        assert!(key_in_range(b"m", b"a", b"z"));
        assert!(!key_in_range(b"z", b"a", b"z"));
        assert!(key_in_range(b"z", b"a", b""));
        assert!(!key_in_range(b"0", b"a", b""));
    }
}
