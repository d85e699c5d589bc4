//! Page-boundary aware content generators.
//!
//! Off-by-one errors in the page cache show up at page edges, so tests
//! should write content that ends just before, exactly at, and just after
//! a boundary. The byte pattern is deterministic and does not repeat
//! within a page of up to 251 bytes, which makes misplaced pages visible.

/// `size` bytes of a deterministic, non-trivial pattern.
#[allow(clippy::cast_possible_truncation)]
pub fn patterned(size: usize) -> Vec<u8> {
    (0..size).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

/// One byte short of a full page.
pub fn page_minus_one(page_size: usize) -> Vec<u8> {
    patterned(page_size.saturating_sub(1))
}

/// One byte into the second page.
pub fn page_plus_one(page_size: usize) -> Vec<u8> {
    patterned(page_size + 1)
}

/// Content covering `pages` full pages plus `tail` bytes.
pub fn spanning_pages(page_size: usize, pages: usize, tail: usize) -> Vec<u8> {
    patterned(page_size * pages + tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(page_minus_one(16).len(), 15);
        assert_eq!(page_plus_one(16).len(), 17);
        assert_eq!(spanning_pages(16, 3, 5).len(), 53);
        assert!(page_minus_one(0).is_empty());
    }

    #[test]
    fn test_pattern_is_deterministic() {
        assert_eq!(patterned(64), patterned(64));
        assert_ne!(patterned(8)[0], patterned(8)[1]);
    }
}
