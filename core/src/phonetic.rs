//! Phonetic index contract: N consecutive syllables -> candidate tokens.
//!
//! The decoder only depends on the [`PhoneticIndex`] trait. A search takes a
//! key sequence and fills per-library `(begin, end)` token ranges into a
//! prepared [`PhraseRanges`]; the result flags say whether anything matched
//! (`SEARCH_OK`) and whether a longer sequence starting with these keys
//! could still match (`SEARCH_CONTINUED`) — the decoder grows its per-column
//! table cache while the index keeps reporting CONTINUED.
//!
//! [`FstPhoneticIndex`] is the bundled implementation: an FST map from the
//! encoded key sequence to a payload of coalesced per-library ranges.

use ahash::{AHashMap, AHashSet};
use fst::{Map, MapBuilder};

use crate::error::{CoreError, Result};
use crate::key::{MatchOptions, SyllableKey};
use crate::phrase_index::{library_of, PhraseRanges, PhraseToken, PHRASE_INDEX_LIBRARY_COUNT};

pub type SearchResult = u32;

pub const SEARCH_NONE: SearchResult = 0;
pub const SEARCH_OK: SearchResult = 1;
pub const SEARCH_CONTINUED: SearchResult = 2;

pub trait PhoneticIndex {
    /// Fill `ranges` with the candidate token ranges whose pronunciation
    /// matches `keys` exactly, one list per loaded library. Only `Some`
    /// slots are written; the caller prepares and clears them.
    fn search(
        &self,
        keys: &[SyllableKey],
        options: MatchOptions,
        ranges: &mut PhraseRanges,
    ) -> SearchResult;
}

#[derive(Debug, Clone)]
struct Payload {
    /// (library, begin, end) with tokens coalesced into contiguous runs.
    ranges: Vec<(u8, PhraseToken, PhraseToken)>,
}

/// FST-backed phonetic index: map from encoded key sequence to a payload
/// index, plus a prefix set answering CONTINUED for sequences that are not
/// themselves complete matches.
pub struct FstPhoneticIndex {
    map: Map<Vec<u8>>,
    payloads: Vec<Payload>,
    prefixes: AHashSet<Vec<u8>>,
}

impl std::fmt::Debug for FstPhoneticIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FstPhoneticIndex")
            .field("keys", &self.map.len())
            .field("prefixes", &self.prefixes.len())
            .finish()
    }
}

/// Big-endian per key, so byte order equals numeric order and the FST
/// builder sees keys in sorted order.
fn encode(keys: &[SyllableKey]) -> Vec<u8> {
    let mut out = Vec::with_capacity(keys.len() * 2);
    for key in keys {
        out.extend_from_slice(&key.as_u16().to_be_bytes());
    }
    out
}

impl PhoneticIndex for FstPhoneticIndex {
    fn search(
        &self,
        keys: &[SyllableKey],
        _options: MatchOptions,
        ranges: &mut PhraseRanges,
    ) -> SearchResult {
        let encoded = encode(keys);
        let mut result = SEARCH_NONE;
        if let Some(idx) = self.map.get(&encoded) {
            let payload = &self.payloads[idx as usize];
            let mut wrote = false;
            for &(lib, begin, end) in &payload.ranges {
                if let Some(slot) = ranges
                    .get_mut(lib as usize)
                    .and_then(|slot| slot.as_mut())
                {
                    slot.push((begin, end));
                    wrote = true;
                }
            }
            if wrote {
                result |= SEARCH_OK;
            }
        }
        if self.prefixes.contains(&encoded) {
            result |= SEARCH_CONTINUED;
        }
        result
    }
}

/// Builder collecting (key sequence, token) pairs.
#[derive(Debug, Default)]
pub struct FstPhoneticIndexBuilder {
    entries: AHashMap<Vec<u8>, Vec<PhraseToken>>,
}

impl FstPhoneticIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, keys: &[SyllableKey], token: PhraseToken) {
        self.entries.entry(encode(keys)).or_default().push(token);
    }

    pub fn build(self) -> Result<FstPhoneticIndex> {
        let mut sorted: Vec<(Vec<u8>, Vec<PhraseToken>)> = self.entries.into_iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        // proper prefixes of every key sequence, at key granularity
        let mut prefixes: AHashSet<Vec<u8>> = AHashSet::new();
        for (encoded, _) in &sorted {
            let mut cut = 2;
            while cut < encoded.len() {
                prefixes.insert(encoded[..cut].to_vec());
                cut += 2;
            }
        }

        let mut builder = MapBuilder::memory();
        let mut payloads = Vec::with_capacity(sorted.len());
        for (encoded, mut tokens) in sorted {
            tokens.sort_unstable();
            tokens.dedup();
            let mut ranges: Vec<(u8, PhraseToken, PhraseToken)> = Vec::new();
            for token in tokens {
                let lib = library_of(token);
                if lib >= PHRASE_INDEX_LIBRARY_COUNT {
                    return Err(CoreError::Range(format!(
                        "token {token:#x} names library {lib}"
                    )));
                }
                match ranges.last_mut() {
                    Some((l, _, end)) if *l as usize == lib && *end == token => *end = token + 1,
                    _ => ranges.push((lib as u8, token, token + 1)),
                }
            }
            builder
                .insert(&encoded, payloads.len() as u64)
                .map_err(|e| CoreError::Format(format!("fst build: {e}")))?;
            payloads.push(Payload { ranges });
        }
        let map = Map::new(
            builder
                .into_inner()
                .map_err(|e| CoreError::Format(format!("fst build: {e}")))?,
        )
        .map_err(|e| CoreError::Format(format!("fst build: {e}")))?;

        Ok(FstPhoneticIndex {
            map,
            payloads,
            prefixes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phrase_index::make_token;

    fn key(i: u8, f: u8, t: u8) -> SyllableKey {
        SyllableKey::new(i, f, t)
    }

    fn prepared() -> PhraseRanges {
        std::array::from_fn(|lib| if lib == 1 || lib == 2 { Some(Vec::new()) } else { None })
    }

    #[test]
    fn exact_match_fills_ranges_per_library() {
        let ni = key(8, 10, 3);
        let hao = key(9, 20, 3);
        let mut builder = FstPhoneticIndexBuilder::new();
        builder.add(&[ni], make_token(1, 2));
        builder.add(&[ni, hao], make_token(1, 5));
        builder.add(&[ni, hao], make_token(2, 7));
        let index = builder.build().unwrap();

        let mut ranges = prepared();
        let res = index.search(&[ni, hao], MatchOptions::default(), &mut ranges);
        assert_eq!(res & SEARCH_OK, SEARCH_OK);
        assert_eq!(
            ranges[1].as_deref().unwrap(),
            &[(make_token(1, 5), make_token(1, 6))]
        );
        assert_eq!(
            ranges[2].as_deref().unwrap(),
            &[(make_token(2, 7), make_token(2, 8))]
        );
    }

    #[test]
    fn contiguous_tokens_coalesce_into_one_range() {
        let wo = key(7, 3, 3);
        let mut builder = FstPhoneticIndexBuilder::new();
        for id in [4u32, 5, 6, 9] {
            builder.add(&[wo], make_token(1, id));
        }
        let index = builder.build().unwrap();

        let mut ranges = prepared();
        index.search(&[wo], MatchOptions::default(), &mut ranges);
        assert_eq!(
            ranges[1].as_deref().unwrap(),
            &[
                (make_token(1, 4), make_token(1, 7)),
                (make_token(1, 9), make_token(1, 10)),
            ]
        );
    }

    #[test]
    fn continued_reports_extendable_prefixes() {
        let ni = key(8, 10, 3);
        let hao = key(9, 20, 3);
        let ma = key(2, 4, 0);
        let mut builder = FstPhoneticIndexBuilder::new();
        builder.add(&[ni], make_token(1, 2));
        builder.add(&[ni, hao, ma], make_token(1, 8));
        let index = builder.build().unwrap();
        let opts = MatchOptions::default();

        let mut ranges = prepared();
        // a match that can also extend
        let res = index.search(&[ni], opts, &mut ranges);
        assert_eq!(res, SEARCH_OK | SEARCH_CONTINUED);

        // a pure prefix: no match yet, but extendable
        crate::phrase_index::FacadePhraseIndex::clear_ranges(&mut ranges);
        let res = index.search(&[ni, hao], opts, &mut ranges);
        assert_eq!(res, SEARCH_CONTINUED);
        assert!(ranges[1].as_deref().unwrap().is_empty());

        // a dead end
        crate::phrase_index::FacadePhraseIndex::clear_ranges(&mut ranges);
        let res = index.search(&[hao], opts, &mut ranges);
        assert_eq!(res, SEARCH_NONE);
    }

    #[test]
    fn unloaded_libraries_are_not_written() {
        let wo = key(7, 3, 3);
        let mut builder = FstPhoneticIndexBuilder::new();
        builder.add(&[wo], make_token(3, 1));
        let index = builder.build().unwrap();

        let mut ranges = prepared(); // library 3 not prepared
        let res = index.search(&[wo], MatchOptions::default(), &mut ranges);
        assert_eq!(res & SEARCH_OK, 0);
        assert!(ranges[3].is_none());
    }
}
