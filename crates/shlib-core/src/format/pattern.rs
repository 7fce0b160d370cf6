use super::{BinaryFormatParser, ParseFailure, SectionMatch};

/// Fallback for platforms without a section-table parser: there is never a
/// known section, so callers search the whole image.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericPatternParser;

impl BinaryFormatParser for GenericPatternParser {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn parse(&self, _data: &[u8]) -> Result<SectionMatch, ParseFailure> {
        Err(ParseFailure::NoMetadataSection)
    }
}

/// Finds the last occurrence of `needle` in `haystack`.
///
/// The scan runs backwards from the end: read-only data sits near the end of
/// a release binary, while debug builds append their symbols after it. A
/// rolling sum over the window skips positions that cannot match; exact
/// comparison settles sum collisions.
pub fn find_pattern(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    let n = needle.len();
    if n == 0 || n > haystack.len() {
        return None;
    }

    let sum = |bytes: &[u8]| {
        bytes
            .iter()
            .fold(0u64, |acc, &b| acc.wrapping_add(u64::from(b)))
    };
    let target = sum(needle);
    let mut i = haystack.len() - n;
    let mut window = sum(&haystack[i..]);

    loop {
        if window == target && &haystack[i..i + n] == needle {
            return Some(i);
        }
        if i == 0 {
            return None;
        }
        i -= 1;
        window = window
            .wrapping_sub(u64::from(haystack[i + n]))
            .wrapping_add(u64::from(haystack[i]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || needle.len() > haystack.len() {
            return None;
        }
        (0..=haystack.len() - needle.len())
            .rev()
            .find(|&i| &haystack[i..i + needle.len()] == needle)
    }

    #[test]
    fn test_needle_at_start_end_and_absent() {
        let needle = b"MARKER";
        let mut data = vec![b'.'; 64];

        data[..6].copy_from_slice(needle);
        assert_eq!(find_pattern(&data, needle), Some(0));
        assert_eq!(find_pattern(&data, needle), naive(&data, needle));

        let mut data = vec![b'.'; 64];
        data[58..].copy_from_slice(needle);
        assert_eq!(find_pattern(&data, needle), Some(58));
        assert_eq!(find_pattern(&data, needle), naive(&data, needle));

        let data = vec![b'.'; 64];
        assert_eq!(find_pattern(&data, needle), None);
    }

    #[test]
    fn test_last_occurrence_wins() {
        let data = b"abcXYZabcXYZabc";
        assert_eq!(find_pattern(data, b"XYZ"), Some(9));
    }

    #[test]
    fn test_sum_collisions_are_rejected() {
        // "ad" and "bc" have the same byte sum.
        let data = b"bcbcbcad";
        assert_eq!(find_pattern(data, b"ad"), Some(6));
        assert_eq!(find_pattern(b"bcbcbc", b"ad"), None);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(find_pattern(b"", b"x"), None);
        assert_eq!(find_pattern(b"abc", b""), None);
        assert_eq!(find_pattern(b"ab", b"abc"), None);
        assert_eq!(find_pattern(b"abc", b"abc"), Some(0));
    }

    #[test]
    fn test_matches_naive_scan_on_pseudo_random_data() {
        let mut state = 0x2545_f491_u32;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                b'a' + (state % 4) as u8
            })
            .collect();
        for needle in [&b"ab"[..], b"dcba", b"aaaa", b"abcdabcd", b"ddddddddd"] {
            assert_eq!(find_pattern(&data, needle), naive(&data, needle), "{needle:?}");
        }
    }
}
