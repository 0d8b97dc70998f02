//! Single-gram: the bigram row for one previous token.
//!
//! Byte layout inside the chunk: a u32 total frequency followed by a sorted
//! array of (u32 token, u32 freq) pairs, tokens strictly ascending. The same
//! image is what the bigram store persists as a value, so a `SingleGram` can
//! wrap bytes loaded from the database directly.

use crate::chunk::MemoryChunk;
use crate::error::{CoreError, Result};
use crate::phrase_index::PhraseToken;

const HEADER: usize = 4;
const ITEM: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct SingleGram {
    chunk: MemoryChunk,
}

impl SingleGram {
    /// An empty single-gram with a zero total.
    pub fn new() -> Self {
        let mut chunk = MemoryChunk::new();
        chunk.set_size(HEADER);
        SingleGram { chunk }
    }

    /// Wrap a byte image, validating shape and sortedness.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_chunk(MemoryChunk::from_vec(bytes))
    }

    pub fn from_chunk(chunk: MemoryChunk) -> Result<Self> {
        if chunk.size() < HEADER || (chunk.size() - HEADER) % ITEM != 0 {
            return Err(CoreError::Format(format!(
                "single-gram image of {} bytes has no valid shape",
                chunk.size()
            )));
        }
        let gram = SingleGram { chunk };
        let mut prev: Option<PhraseToken> = None;
        for i in 0..gram.get_length() {
            let token = gram.token_at(i);
            if let Some(p) = prev {
                if token <= p {
                    return Err(CoreError::Format(format!(
                        "single-gram tokens not strictly ascending at {}",
                        token
                    )));
                }
            }
            prev = Some(token);
        }
        Ok(gram)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.chunk.as_slice()
    }

    pub fn get_total_freq(&self) -> u32 {
        // header is always present
        self.chunk.get_u32(0).unwrap_or(0)
    }

    pub fn set_total_freq(&mut self, total: u32) {
        self.chunk.set_u32(0, total);
    }

    /// Number of stored successor tokens.
    pub fn get_length(&self) -> usize {
        (self.chunk.size() - HEADER) / ITEM
    }

    fn token_at(&self, i: usize) -> PhraseToken {
        self.chunk
            .get_u32(HEADER + i * ITEM)
            .expect("item index within chunk")
    }

    fn freq_at(&self, i: usize) -> u32 {
        self.chunk
            .get_u32(HEADER + i * ITEM + 4)
            .expect("item index within chunk")
    }

    /// Binary search; Ok(slot) when present, Err(slot) for the insertion
    /// point.
    fn find(&self, token: PhraseToken) -> std::result::Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = self.get_length();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.token_at(mid).cmp(&token) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    pub fn get_freq(&self, token: PhraseToken) -> Option<u32> {
        self.find(token).ok().map(|i| self.freq_at(i))
    }

    /// Update an existing successor. The token must already be present.
    pub fn set_freq(&mut self, token: PhraseToken, freq: u32) -> Result<()> {
        match self.find(token) {
            Ok(i) => {
                self.chunk.set_u32(HEADER + i * ITEM + 4, freq);
                Ok(())
            }
            Err(_) => Err(CoreError::Logic(format!(
                "set_freq on missing successor {token}"
            ))),
        }
    }

    /// Insert a new successor, keeping the array sorted. The token must not
    /// already be present.
    pub fn insert_freq(&mut self, token: PhraseToken, freq: u32) -> Result<()> {
        match self.find(token) {
            Ok(_) => Err(CoreError::Logic(format!(
                "insert_freq on existing successor {token}"
            ))),
            Err(slot) => {
                let mut item = [0u8; ITEM];
                item[..4].copy_from_slice(&token.to_le_bytes());
                item[4..].copy_from_slice(&freq.to_le_bytes());
                self.chunk.insert_content(HEADER + slot * ITEM, &item)
            }
        }
    }

    /// Remove a successor; returns its frequency if it was present.
    pub fn remove_freq(&mut self, token: PhraseToken) -> Option<u32> {
        match self.find(token) {
            Ok(i) => {
                let freq = self.freq_at(i);
                self.chunk
                    .remove_content(HEADER + i * ITEM, ITEM)
                    .expect("slot within chunk");
                Some(freq)
            }
            Err(_) => None,
        }
    }

    /// Successors in `[begin, end)` with their normalized frequencies
    /// (`freq / total`, 0.0 when the total is zero).
    pub fn search(&self, begin: PhraseToken, end: PhraseToken) -> Vec<(PhraseToken, f32)> {
        let mut out = Vec::new();
        if begin >= end {
            return out;
        }
        let total = self.get_total_freq() as f32;
        let start = match self.find(begin) {
            Ok(i) => i,
            Err(i) => i,
        };
        for i in start..self.get_length() {
            let token = self.token_at(i);
            if token >= end {
                break;
            }
            let norm = if total > 0.0 {
                self.freq_at(i) as f32 / total
            } else {
                0.0
            };
            out.push((token, norm));
        }
        out
    }

    /// All successors as raw (token, freq) pairs, ascending by token.
    pub fn retrieve_all(&self) -> Vec<(PhraseToken, u32)> {
        (0..self.get_length())
            .map(|i| (self.token_at(i), self.freq_at(i)))
            .collect()
    }

    /// Remove every successor with `(token & mask) == value`, subtracting the
    /// removed frequencies from the total. Returns the number removed.
    pub fn mask_out(&mut self, mask: PhraseToken, value: PhraseToken) -> usize {
        let mut removed = 0usize;
        let mut freed: u32 = 0;
        let mut i = 0usize;
        while i < self.get_length() {
            if (self.token_at(i) & mask) == value {
                freed = freed.saturating_add(self.freq_at(i));
                self.chunk
                    .remove_content(HEADER + i * ITEM, ITEM)
                    .expect("slot within chunk");
                removed += 1;
            } else {
                i += 1;
            }
        }
        let total = self.get_total_freq();
        self.set_total_freq(total.saturating_sub(freed));
        removed
    }
}

/// Merge the system and user layers for one previous token.
///
/// The user layer is authoritative: its total and entries form the base.
/// Successors present only in the system layer are inserted with their
/// system frequency, which is also added to the total so normalization
/// stays consistent.
pub fn merge_single_gram(system: Option<&SingleGram>, user: Option<&SingleGram>) -> Option<SingleGram> {
    match (system, user) {
        (None, None) => None,
        (Some(s), None) => Some(s.clone()),
        (None, Some(u)) => Some(u.clone()),
        (Some(s), Some(u)) => {
            let sys = s.retrieve_all();
            let usr = u.retrieve_all();
            let mut total = u.get_total_freq();
            let mut items: Vec<(PhraseToken, u32)> = Vec::with_capacity(sys.len() + usr.len());
            let (mut i, mut j) = (0usize, 0usize);
            while i < sys.len() && j < usr.len() {
                let (st, sf) = sys[i];
                let (ut, uf) = usr[j];
                match st.cmp(&ut) {
                    std::cmp::Ordering::Less => {
                        items.push((st, sf));
                        total = total.saturating_add(sf);
                        i += 1;
                    }
                    std::cmp::Ordering::Greater => {
                        items.push((ut, uf));
                        j += 1;
                    }
                    std::cmp::Ordering::Equal => {
                        items.push((ut, uf));
                        i += 1;
                        j += 1;
                    }
                }
            }
            while i < sys.len() {
                let (st, sf) = sys[i];
                items.push((st, sf));
                total = total.saturating_add(sf);
                i += 1;
            }
            items.extend_from_slice(&usr[j..]);

            let mut bytes = Vec::with_capacity(HEADER + items.len() * ITEM);
            bytes.extend_from_slice(&total.to_le_bytes());
            for (token, freq) in items {
                bytes.extend_from_slice(&token.to_le_bytes());
                bytes.extend_from_slice(&freq.to_le_bytes());
            }
            Some(SingleGram {
                chunk: MemoryChunk::from_vec(bytes),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_stay_sorted_and_duplicates_are_rejected() {
        let mut g = SingleGram::new();
        assert_eq!(g.get_total_freq(), 0);
        assert_eq!(g.get_length(), 0);

        g.insert_freq(2, 10).unwrap();
        g.insert_freq(5, 20).unwrap();
        g.insert_freq(1, 5).unwrap();
        assert!(matches!(g.insert_freq(5, 3), Err(CoreError::Logic(_))));

        assert_eq!(g.get_length(), 3);
        assert_eq!(g.retrieve_all(), vec![(1, 5), (2, 10), (5, 20)]);
    }

    #[test]
    fn set_requires_presence_remove_returns_freq() {
        let mut g = SingleGram::new();
        g.insert_freq(3, 7).unwrap();
        g.set_freq(3, 42).unwrap();
        assert_eq!(g.get_freq(3), Some(42));
        assert!(matches!(g.set_freq(4, 1), Err(CoreError::Logic(_))));
        assert_eq!(g.remove_freq(3), Some(42));
        assert_eq!(g.remove_freq(3), None);
        assert_eq!(g.get_length(), 0);
    }

    #[test]
    fn search_normalizes_by_total() {
        let mut g = SingleGram::new();
        g.insert_freq(1, 1).unwrap();
        g.insert_freq(3, 3).unwrap();
        g.insert_freq(5, 5).unwrap();
        g.set_total_freq(9);

        let res = g.search(2, 6);
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].0, 3);
        assert_eq!(res[1].0, 5);
        assert!((res[0].1 - 3.0 / 9.0).abs() < 1e-6);
        assert!((res[1].1 - 5.0 / 9.0).abs() < 1e-6);

        // zero total normalizes to 0.0
        g.set_total_freq(0);
        assert!(g.search(0, 10).iter().all(|(_, f)| *f == 0.0));
    }

    #[test]
    fn byte_image_round_trips() {
        let mut g = SingleGram::new();
        g.insert_freq(9, 4).unwrap();
        g.insert_freq(700, 6).unwrap();
        g.set_total_freq(10);

        let restored = SingleGram::from_bytes(g.as_bytes().to_vec()).unwrap();
        assert_eq!(restored.get_total_freq(), 10);
        assert_eq!(restored.retrieve_all(), vec![(9, 4), (700, 6)]);
    }

    #[test]
    fn from_bytes_rejects_unsorted_or_ragged_images() {
        // ragged: 4 + 5 bytes
        assert!(SingleGram::from_bytes(vec![0u8; 9]).is_err());

        // unsorted tokens 2 then 1
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u32.to_le_bytes());
        for (t, f) in [(2u32, 1u32), (1u32, 2u32)] {
            bytes.extend_from_slice(&t.to_le_bytes());
            bytes.extend_from_slice(&f.to_le_bytes());
        }
        assert!(matches!(
            SingleGram::from_bytes(bytes),
            Err(CoreError::Format(_))
        ));
    }

    #[test]
    fn mask_out_removes_matching_and_adjusts_total() {
        let mut g = SingleGram::new();
        g.insert_freq(0x0100_0001, 2).unwrap();
        g.insert_freq(0x0100_0002, 3).unwrap();
        g.insert_freq(0x0200_0001, 5).unwrap();
        g.set_total_freq(10);

        let removed = g.mask_out(0xFF00_0000, 0x0100_0000);
        assert_eq!(removed, 2);
        assert_eq!(g.get_total_freq(), 5);
        assert_eq!(g.retrieve_all(), vec![(0x0200_0001, 5)]);
    }

    #[test]
    fn merge_prefers_user_layer_and_fills_from_system() {
        let mut s = SingleGram::new();
        s.insert_freq(1, 10).unwrap();
        s.insert_freq(3, 30).unwrap();
        s.set_total_freq(40);

        let mut u = SingleGram::new();
        u.insert_freq(2, 5).unwrap();
        u.insert_freq(3, 7).unwrap();
        u.set_total_freq(12);

        let merged = merge_single_gram(Some(&s), Some(&u)).unwrap();
        // user total wins; only the system-only token 1 adds its frequency
        assert_eq!(merged.get_total_freq(), 12 + 10);
        assert_eq!(merged.get_freq(1), Some(10));
        assert_eq!(merged.get_freq(2), Some(5));
        assert_eq!(merged.get_freq(3), Some(7));
    }

    #[test]
    fn merge_with_one_side_missing_copies_the_other() {
        let mut u = SingleGram::new();
        u.insert_freq(4, 9).unwrap();
        u.set_total_freq(9);

        assert!(merge_single_gram(None, None).is_none());
        let only_user = merge_single_gram(None, Some(&u)).unwrap();
        assert_eq!(only_user.retrieve_all(), vec![(4, 9)]);
        let only_system = merge_single_gram(Some(&u), None).unwrap();
        assert_eq!(only_system.get_total_freq(), 9);
    }
}
