//! Incremental substring search over chunked input.
//!
//! The scan result distinguishes a complete match from a pattern prefix that
//! was still alive at the end of the haystack, so a caller feeding chunks
//! can resume the scan on the next chunk without rescanning old bytes.

/// Outcome of one [`kmp`] scan.
///
/// `length == pattern.len()` is a complete match starting at `offset`. A
/// shorter `length` is the number of pattern bytes matched at the tail of
/// the haystack (`offset` points at where that prefix begins). `length == 0`
/// with `offset == haystack.len()` means nothing matched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KmpResult {
    pub offset: usize,
    pub length: usize,
}

/// Carried scan state of a delimiter search across chunk boundaries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KmpState {
    /// Where the next scan resumes inside the read window.
    pub offset: usize,
    /// How many pattern bytes already matched at the previous chunk tail.
    pub matched: usize,
}

/// Searches `pattern` in `haystack[offset..]`, Knuth-Morris-Pratt with a
/// partial-match result at the haystack tail.
///
/// `carried` seeds the automaton with a prefix length already matched by a
/// previous scan; the bytes of that prefix must sit in the haystack right
/// before `offset` (so `carried <= offset`). Carrying the state instead of
/// rescanning is what makes a delimiter straddling two chunks match exactly
/// once — including the case where the carried prefix turns out to be a
/// false start and the automaton has to demote it through the failure
/// links.
pub fn kmp(haystack: &[u8], pattern: &[u8], offset: usize, carried: usize) -> KmpResult {
    let len = haystack.len();
    let mut result = KmpResult {
        offset: len,
        length: 0,
    };

    if len == 0 || pattern.is_empty() {
        return result;
    }
    if offset >= len {
        // No new bytes to scan; the carried state passes through untouched.
        result.offset = offset.saturating_sub(carried);
        result.length = carried;
        return result;
    }

    // Single byte patterns take the direct search path; there is no carry
    // to speak of because any hit completes the match.
    if pattern.len() == 1 {
        if let Some(pos) = memchr::memchr(pattern[0], &haystack[offset..]) {
            result.offset = offset + pos;
            result.length = 1;
        }
        return result;
    }

    let m = pattern.len();
    let mut table = vec![0isize; m + 1];
    table[0] = -1;
    let mut i = 1;
    let mut j = 0isize;
    while i < m {
        if pattern[i] == pattern[j as usize] {
            table[i] = table[j as usize];
        } else {
            table[i] = j;
            while j >= 0 && pattern[i] != pattern[j as usize] {
                j = table[j as usize];
            }
        }
        i += 1;
        j += 1;
    }
    table[i] = j;

    let mut j = offset as isize;
    let mut k = carried.min(m.saturating_sub(1)) as isize;
    while (j as usize) < len {
        if pattern[k as usize] == haystack[j as usize] {
            j += 1;
            k += 1;
            if k as usize == m {
                result.offset = (j - k) as usize;
                result.length = m;
                return result;
            }
        } else {
            k = table[k as usize];
            if k < 0 {
                j += 1;
                k += 1;
            }
        }
    }

    result.offset = (j - k) as usize;
    result.length = k as usize;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_complete_match() {
        let res = kmp(b"GET / HTTP/1.1\r\n\r\n", b"\r\n\r\n", 0, 0);
        assert_eq!(res, KmpResult { offset: 14, length: 4 });
    }

    #[test]
    fn reports_partial_prefix_at_tail() {
        let res = kmp(b"abc\r\n", b"\r\n\r\n", 0, 0);
        assert_eq!(res.offset, 3);
        assert_eq!(res.length, 2);
    }

    #[test]
    fn resumes_across_chunks() {
        // First chunk ends with two delimiter bytes matched; the window then
        // grows and the scan resumes carrying that state.
        let first = kmp(b"A\r\n", b"\r\n\r\n", 0, 0);
        assert_eq!(first, KmpResult { offset: 1, length: 2 });
        let second = kmp(b"A\r\n\r\n", b"\r\n\r\n", 3, first.length);
        assert_eq!(second, KmpResult { offset: 1, length: 4 });
    }

    #[test]
    fn false_carry_is_demoted_not_trusted() {
        // "A\r\n" leaves a two byte carry, but the next chunk does not
        // continue the delimiter. The suffix "\r\n" appearing later must
        // not be mistaken for a full match.
        let window = b"A\r\nB\r\nC";
        let res = kmp(window, b"\r\n\r\n", 3, 2);
        assert_eq!(res.length, 0);
        assert_eq!(res.offset, window.len());
        // Only once the real delimiter arrives does the scan complete.
        let window = b"A\r\nB\r\nC\r\n\r\n";
        let res = kmp(window, b"\r\n\r\n", 7, 0);
        assert_eq!(res, KmpResult { offset: 7, length: 4 });
    }

    #[test]
    fn single_byte_uses_direct_search() {
        assert_eq!(
            kmp(b"hello\nworld", b"\n", 0, 0),
            KmpResult { offset: 5, length: 1 }
        );
        assert_eq!(
            kmp(b"hello\nworld", b"\n", 6, 0),
            KmpResult { offset: 11, length: 0 }
        );
    }

    #[test]
    fn empty_inputs_match_nothing() {
        assert_eq!(kmp(b"", b"x", 0, 0), KmpResult { offset: 0, length: 0 });
        assert_eq!(kmp(b"abc", b"", 0, 0), KmpResult { offset: 3, length: 0 });
    }

    #[test]
    fn repeated_prefix_backtracks() {
        let res = kmp(b"aabaabaab", b"aabaac", 0, 0);
        // The scan ends with the live prefix "aab" at offset 6.
        assert_eq!(res, KmpResult { offset: 6, length: 3 });
    }
}
