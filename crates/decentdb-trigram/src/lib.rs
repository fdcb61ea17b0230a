//! Trigram inverted-index primitives.
//!
//! Text is canonicalized (ASCII upper-fold, runs of non-alphanumerics
//! collapsed to one separator) and cut into 3-byte windows packed into u32
//! tokens. Postings are delta-encoded varint lists of sorted rowids. Write
//! transactions buffer posting changes in [`TrigramDelta`]s; the buffers are
//! applied to the on-disk lists at checkpoint and merged into reads before
//! that.

use std::collections::BTreeSet;

use decentdb_error::{DecentError, Result};
use decentdb_types::RowId;
use decentdb_types::varint::{read_varint, write_varint};
use hashbrown::HashMap;

/// Canonical separator standing in for any run of non-alphanumerics.
const SEPARATOR: u8 = b' ';

/// Upper-fold and collapse: `"foo-bar  Baz"` → `"FOO BAR BAZ"`.
#[must_use]
pub fn canonicalize(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut pending_separator = false;
    for &byte in text {
        if byte.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push(SEPARATOR);
            }
            pending_separator = false;
            out.push(byte.to_ascii_uppercase());
        } else {
            pending_separator = true;
        }
    }
    out
}

/// Pack a 3-byte window into a 24-bit token.
#[must_use]
pub fn pack_trigram(window: &[u8]) -> u32 {
    (u32::from(window[0]) << 16) | (u32::from(window[1]) << 8) | u32::from(window[2])
}

/// Sorted, deduplicated trigram tokens of a value's canonical form.
#[must_use]
pub fn trigrams_of(text: &[u8]) -> Vec<u32> {
    let canonical = canonicalize(text);
    let mut tokens: Vec<u32> = canonical.windows(3).map(pack_trigram).collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens
}

/// Trigrams extractable from a LIKE pattern: each literal run between
/// `%`/`_` wildcards is canonicalized separately. An empty result means the
/// trigram index cannot drive the query.
#[must_use]
pub fn pattern_trigrams(pattern: &[u8]) -> Vec<u32> {
    let mut tokens = Vec::new();
    for run in pattern.split(|b| *b == b'%' || *b == b'_') {
        tokens.extend(trigrams_of(run));
    }
    tokens.sort_unstable();
    tokens.dedup();
    tokens
}

/// Case-insensitive LIKE match (`%` any run, `_` one char), used to verify
/// candidate rows after posting intersection.
#[must_use]
pub fn matches_like(pattern: &[u8], value: &[u8]) -> bool {
    fn upper(b: u8) -> u8 {
        b.to_ascii_uppercase()
    }
    // Iterative matcher with backtracking on the last `%`.
    let (mut p, mut v) = (0_usize, 0_usize);
    let mut star: Option<(usize, usize)> = None;
    while v < value.len() {
        if p < pattern.len() && (pattern[p] == b'_' || upper(pattern[p]) == upper(value[v])) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == b'%' {
            star = Some((p, v));
            p += 1;
        } else if let Some((sp, sv)) = star {
            p = sp + 1;
            v = sv + 1;
            star = Some((sp, sv + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'%' {
        p += 1;
    }
    p == pattern.len()
}

// ---------------------------------------------------------------------------
// Posting lists
// ---------------------------------------------------------------------------

/// Delta-encode a sorted rowid list as varints.
pub fn encode_postings(rowids: &[RowId]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(rowids.len());
    let mut prev = 0_u64;
    for (i, &rowid) in rowids.iter().enumerate() {
        if i > 0 && rowid <= prev {
            return Err(DecentError::internal("posting list must be strictly sorted"));
        }
        let delta = if i == 0 { rowid } else { rowid - prev };
        write_varint(&mut out, delta);
        prev = rowid;
    }
    Ok(out)
}

/// Decode a delta-encoded posting list.
pub fn decode_postings(bytes: &[u8]) -> Result<Vec<RowId>> {
    let mut out = Vec::new();
    let mut pos = 0;
    let mut prev = 0_u64;
    while pos < bytes.len() {
        let delta = read_varint(bytes, &mut pos)?;
        let rowid = if out.is_empty() {
            delta
        } else {
            prev.checked_add(delta)
                .ok_or_else(|| DecentError::corruption("posting delta overflows u64"))?
        };
        if !out.is_empty() && rowid <= prev {
            return Err(DecentError::corruption("posting list not strictly sorted"));
        }
        out.push(rowid);
        prev = rowid;
    }
    Ok(out)
}

/// Intersect two sorted rowid lists.
#[must_use]
pub fn intersect(a: &[RowId], b: &[RowId]) -> Vec<RowId> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0_usize, 0_usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Delta buffers
// ---------------------------------------------------------------------------

/// Buffered posting changes for one `(index, trigram)` pair. Applied to the
/// on-disk list only at checkpoint; cleared on rollback.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrigramDelta {
    pub adds: BTreeSet<RowId>,
    pub removes: BTreeSet<RowId>,
}

impl TrigramDelta {
    pub fn add(&mut self, rowid: RowId) {
        self.removes.remove(&rowid);
        self.adds.insert(rowid);
    }

    pub fn remove(&mut self, rowid: RowId) {
        self.adds.remove(&rowid);
        self.removes.insert(rowid);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty()
    }

    /// Sorted merge of the on-disk list with this delta.
    #[must_use]
    pub fn apply(&self, existing: &[RowId]) -> Vec<RowId> {
        let mut out: Vec<RowId> = existing
            .iter()
            .copied()
            .filter(|rowid| !self.removes.contains(rowid))
            .collect();
        for &rowid in &self.adds {
            if let Err(pos) = out.binary_search(&rowid) {
                out.insert(pos, rowid);
            }
        }
        out
    }
}

/// Per-index delta buffer: trigram token → pending changes.
pub type TrigramDeltaMap = HashMap<u32, TrigramDelta>;

/// Record the posting changes for inserting `rowid` with `value`.
pub fn buffer_insert(map: &mut TrigramDeltaMap, value: &[u8], rowid: RowId) {
    for token in trigrams_of(value) {
        map.entry(token).or_default().add(rowid);
    }
}

/// Record the posting changes for deleting `rowid` with `value`.
pub fn buffer_delete(map: &mut TrigramDeltaMap, value: &[u8], rowid: RowId) {
    for token in trigrams_of(value) {
        map.entry(token).or_default().remove(rowid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_canonicalize_folds_and_collapses() {
        assert_eq!(canonicalize(b"foo-bar  Baz"), b"FOO BAR BAZ");
        assert_eq!(canonicalize(b"  leading"), b"LEADING");
        assert_eq!(canonicalize(b"!!!"), b"");
        assert_eq!(canonicalize(b"a1b2"), b"A1B2");
    }

    #[test]
    fn test_trigrams_are_case_insensitive() {
        assert_eq!(trigrams_of(b"Alice"), trigrams_of(b"ALICE"));
        assert_eq!(trigrams_of(b"alice"), trigrams_of(b"aLiCe"));
    }

    #[test]
    fn test_short_values_have_no_trigrams() {
        assert!(trigrams_of(b"ab").is_empty());
        assert!(trigrams_of(b"").is_empty());
        assert_eq!(trigrams_of(b"abc").len(), 1);
    }

    #[test]
    fn test_pattern_trigrams_split_on_wildcards() {
        // "cde" is one trigram; "%a%" has none long enough.
        assert_eq!(pattern_trigrams(b"%cde%").len(), 1);
        assert!(pattern_trigrams(b"%a%").is_empty());
        assert!(pattern_trigrams(b"%ab_cd%").is_empty());
        assert!(!pattern_trigrams(b"%abcd%").is_empty());
    }

    #[test]
    fn test_pattern_trigrams_subset_of_value_trigrams() {
        let value = trigrams_of(b"abcdefgh");
        for token in pattern_trigrams(b"%cde%") {
            assert!(value.contains(&token));
        }
    }

    #[test]
    fn test_matches_like() {
        assert!(matches_like(b"%cde%", b"abcdefgh"));
        assert!(matches_like(b"%CDE%", b"abcdefgh"));
        assert!(matches_like(b"a%", b"alice"));
        assert!(matches_like(b"_lice", b"Alice"));
        assert!(matches_like(b"%", b""));
        assert!(!matches_like(b"%xyz%", b"abcdefgh"));
        assert!(!matches_like(b"a_", b"abc"));
    }

    #[test]
    fn test_postings_round_trip() {
        let rowids = vec![1_u64, 2, 10, 1000, 1_000_000];
        let bytes = encode_postings(&rowids).unwrap();
        assert_eq!(decode_postings(&bytes).unwrap(), rowids);
    }

    #[test]
    fn test_postings_reject_unsorted() {
        assert!(encode_postings(&[3, 2]).is_err());
        assert!(encode_postings(&[3, 3]).is_err());
    }

    #[test]
    fn test_intersect() {
        assert_eq!(intersect(&[1, 3, 5, 7], &[2, 3, 6, 7, 9]), vec![3, 7]);
        assert!(intersect(&[1, 2], &[3, 4]).is_empty());
    }

    #[test]
    fn test_delta_add_remove_cancel() {
        let mut delta = TrigramDelta::default();
        delta.add(5);
        delta.remove(5);
        assert!(delta.adds.is_empty());
        assert_eq!(delta.apply(&[5]), Vec::<u64>::new());

        delta.add(5);
        assert_eq!(delta.apply(&[]), vec![5]);
    }

    #[test]
    fn test_delta_apply_merges_sorted() {
        let mut delta = TrigramDelta::default();
        delta.add(4);
        delta.add(1);
        delta.remove(3);
        assert_eq!(delta.apply(&[2, 3, 5]), vec![1, 2, 4, 5]);
        // Adding an already-present rowid does not duplicate it.
        let mut delta = TrigramDelta::default();
        delta.add(2);
        assert_eq!(delta.apply(&[2]), vec![2]);
    }

    #[test]
    fn test_buffer_insert_delete_round_trip() {
        let mut map = TrigramDeltaMap::default();
        buffer_insert(&mut map, b"alice", 7);
        assert!(map.values().all(|d| d.adds.contains(&7)));
        buffer_delete(&mut map, b"alice", 7);
        assert!(map.values().all(|d| d.removes.contains(&7)));
    }

    proptest! {
        #[test]
        fn prop_postings_round_trip(
            set in proptest::collection::btree_set(any::<u64>(), 0..200)
        ) {
            let rowids: Vec<u64> = set.into_iter().collect();
            let bytes = encode_postings(&rowids).unwrap();
            prop_assert_eq!(decode_postings(&bytes).unwrap(), rowids);
        }

        #[test]
        fn prop_like_agrees_with_substring(
            needle in "[a-z]{3,6}",
            hay in "[a-z]{0,30}",
        ) {
            let pattern = format!("%{needle}%");
            let expected = hay.to_uppercase().contains(&needle.to_uppercase());
            prop_assert_eq!(matches_like(pattern.as_bytes(), hay.as_bytes()), expected);
        }

        #[test]
        fn prop_value_contains_pattern_trigrams(
            needle in "[a-z0-9]{3,8}",
            prefix in "[a-z0-9]{0,10}",
            suffix in "[a-z0-9]{0,10}",
        ) {
            let value = format!("{prefix}{needle}{suffix}");
            let value_tokens = trigrams_of(value.as_bytes());
            let pattern = format!("%{needle}%");
            for token in pattern_trigrams(pattern.as_bytes()) {
                prop_assert!(value_tokens.contains(&token));
            }
        }
    }
}
