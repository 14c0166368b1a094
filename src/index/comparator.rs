//! Key comparators used by the B+tree to order binary keys.

use std::cmp::Ordering;

/// Comparator over two binary keys.
pub type KeyComparator = fn(&[u8], &[u8]) -> Ordering;

/// Lexicographic byte-wise order.
pub fn default_comparator(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_comparator_orders_lexicographically() {
        assert_eq!(default_comparator(b"abc", b"def"), Ordering::Less);
        assert_eq!(default_comparator(b"abc", b"abc"), Ordering::Equal);
        assert_eq!(default_comparator(b"def", b"abc"), Ordering::Greater);
    }
}
