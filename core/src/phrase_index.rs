//! Phrase storage: per-library phrase items behind a facade.
//!
//! A token is a 32-bit phrase identifier: the high 8 bits select the phrase
//! library, the low 24 bits the in-library id. Each library is a
//! `SubPhraseIndex` holding two byte buffers: an index buffer (one u32 offset
//! per id, 0 meaning absent) and a content buffer of concatenated phrase
//! items. The `FacadePhraseIndex` dispatches on the library bits and keeps
//! the global unigram total used by the language model.
//!
//! Phrase item layout inside a content buffer (little-endian, packed):
//!
//! ```text
//! u8  phrase length (Unicode codepoints, <= 16)
//! u8  pronunciation count
//! u32 unigram count
//! length x u32        codepoints
//! count  x (length x u16 syllable key, u32 frequency)
//! ```

use std::collections::BTreeMap;
use std::io::BufRead;

use tracing::warn;

use crate::chunk::MemoryChunk;
use crate::error::{CoreError, Result};
use crate::key::{keys_match, MatchOptions, SyllableKey};

pub type PhraseToken = u32;

/// The absent token; also the "no phrase starts here" marker in results.
pub const NULL_TOKEN: PhraseToken = 0;
/// Virtual beginning-of-sentence token (library 0 is reserved for control
/// tokens).
pub const SENTENCE_START: PhraseToken = 1;

pub const PHRASE_MASK: u32 = 0x00FF_FFFF;
pub const PHRASE_INDEX_LIBRARY_COUNT: usize = 16;
pub const MAX_PHRASE_LENGTH: usize = 16;

pub fn library_of(token: PhraseToken) -> usize {
    (token >> 24) as usize
}

pub fn make_token(library: usize, id: u32) -> PhraseToken {
    ((library as u32) << 24) | (id & PHRASE_MASK)
}

/// Per-library candidate ranges, as filled in by a phonetic index search.
/// `None` marks a library that is not loaded.
pub type PhraseRanges = [Option<Vec<(PhraseToken, PhraseToken)>>; PHRASE_INDEX_LIBRARY_COUNT];

const ITEM_HEADER: usize = 6;
const SEPARATOR: u8 = b'#';
/// Low content offsets are reserved so offset 0 can mean "absent".
const CONTENT_RESERVED: usize = 8;

fn read_u16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn item_total_len(phrase_len: usize, npron: usize) -> usize {
    ITEM_HEADER + 4 * phrase_len + npron * (2 * phrase_len + 4)
}

fn pron_offset(phrase_len: usize, nth: usize) -> usize {
    ITEM_HEADER + 4 * phrase_len + nth * (2 * phrase_len + 4)
}

fn item_pinyin_possibility(bytes: &[u8], options: MatchOptions, keys: &[SyllableKey]) -> f32 {
    let len = bytes[0] as usize;
    if keys.len() != len {
        return 0.0;
    }
    let npron = bytes[1] as usize;
    let mut matched: u64 = 0;
    let mut total: u64 = 0;
    for i in 0..npron {
        let off = pron_offset(len, i);
        let freq = read_u32(bytes, off + 2 * len) as u64;
        total += freq;
        let stored: Vec<SyllableKey> = (0..len)
            .map(|j| SyllableKey::from_u16(read_u16(bytes, off + 2 * j)))
            .collect();
        if keys_match(&stored, keys, options) {
            matched += freq;
        }
    }
    if total == 0 {
        0.0
    } else {
        matched as f32 / total as f32
    }
}

/// Add `delta` to the count of every pronunciation matching `keys`.
/// Fails softly with `CapacityOverflow` when the weight base would wrap.
fn item_increase_pinyin_possibility(
    bytes: &mut [u8],
    options: MatchOptions,
    keys: &[SyllableKey],
    delta: u32,
) -> Result<()> {
    let len = bytes[0] as usize;
    if keys.len() != len {
        return Err(CoreError::Range(format!(
            "pronunciation of {} keys against phrase of length {}",
            keys.len(),
            len
        )));
    }
    let npron = bytes[1] as usize;
    let mut total: u64 = 0;
    let mut matches: Vec<usize> = Vec::new();
    for i in 0..npron {
        let off = pron_offset(len, i);
        total += read_u32(bytes, off + 2 * len) as u64;
        let stored: Vec<SyllableKey> = (0..len)
            .map(|j| SyllableKey::from_u16(read_u16(bytes, off + 2 * j)))
            .collect();
        if keys_match(&stored, keys, options) {
            matches.push(off + 2 * len);
        }
    }
    if total + matches.len() as u64 * delta as u64 > u32::MAX as u64 {
        return Err(CoreError::CapacityOverflow);
    }
    for off in matches {
        let freq = read_u32(bytes, off) + delta;
        bytes[off..off + 4].copy_from_slice(&freq.to_le_bytes());
    }
    Ok(())
}

/// Read-only view of a phrase item inside a content buffer.
///
/// The view borrows the sub-index that produced it and is invalidated, like
/// any Rust borrow, by the next mutation.
#[derive(Debug, Clone, Copy)]
pub struct PhraseItemView<'a> {
    bytes: &'a [u8],
}

impl<'a> PhraseItemView<'a> {
    pub fn phrase_length(&self) -> u8 {
        self.bytes[0]
    }

    pub fn pronunciation_count(&self) -> u8 {
        self.bytes[1]
    }

    pub fn unigram_frequency(&self) -> u32 {
        read_u32(self.bytes, 2)
    }

    /// The phrase text, rebuilt from the stored codepoints.
    pub fn phrase_string(&self) -> String {
        let len = self.phrase_length() as usize;
        (0..len)
            .map(|i| {
                char::from_u32(read_u32(self.bytes, ITEM_HEADER + 4 * i)).unwrap_or('\u{FFFD}')
            })
            .collect()
    }

    pub fn get_nth_pronunciation(&self, nth: usize) -> Option<(Vec<SyllableKey>, u32)> {
        if nth >= self.pronunciation_count() as usize {
            return None;
        }
        let len = self.phrase_length() as usize;
        let off = pron_offset(len, nth);
        let keys = (0..len)
            .map(|j| SyllableKey::from_u16(read_u16(self.bytes, off + 2 * j)))
            .collect();
        Some((keys, read_u32(self.bytes, off + 2 * len)))
    }

    /// Fraction of the pronunciation weight matching `keys` under `options`;
    /// always within `[0, 1]`, and 0 when the weight base is empty.
    pub fn pinyin_possibility(&self, options: MatchOptions, keys: &[SyllableKey]) -> f32 {
        item_pinyin_possibility(self.bytes, options, keys)
    }
}

/// Owned phrase item, used when building a library and as the copy-out of
/// `remove_phrase_item`.
#[derive(Debug, Clone)]
pub struct PhraseItem {
    chunk: MemoryChunk,
}

impl Default for PhraseItem {
    fn default() -> Self {
        Self::new()
    }
}

impl PhraseItem {
    pub fn new() -> Self {
        let mut chunk = MemoryChunk::new();
        chunk.set_size(ITEM_HEADER);
        PhraseItem { chunk }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < ITEM_HEADER {
            return Err(CoreError::Format(format!(
                "phrase item of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let expect = item_total_len(bytes[0] as usize, bytes[1] as usize);
        if bytes.len() != expect {
            return Err(CoreError::Format(format!(
                "phrase item of {} bytes, layout requires {}",
                bytes.len(),
                expect
            )));
        }
        Ok(PhraseItem {
            chunk: MemoryChunk::from_vec(bytes),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.chunk.as_slice()
    }

    pub fn as_view(&self) -> PhraseItemView<'_> {
        PhraseItemView {
            bytes: self.chunk.as_slice(),
        }
    }

    pub fn phrase_length(&self) -> u8 {
        self.as_view().phrase_length()
    }

    pub fn pronunciation_count(&self) -> u8 {
        self.as_view().pronunciation_count()
    }

    pub fn unigram_frequency(&self) -> u32 {
        self.as_view().unigram_frequency()
    }

    pub fn set_unigram_frequency(&mut self, freq: u32) {
        self.chunk.set_u32(2, freq);
    }

    /// Set the phrase text. Only valid on a freshly constructed item.
    pub fn set_phrase(&mut self, phrase: &str) -> Result<()> {
        if self.phrase_length() != 0 || self.pronunciation_count() != 0 {
            return Err(CoreError::Logic(
                "set_phrase on an item that already has content".into(),
            ));
        }
        let count = phrase.chars().count();
        if count == 0 || count > MAX_PHRASE_LENGTH {
            return Err(CoreError::Range(format!(
                "phrase of {count} codepoints (limit {MAX_PHRASE_LENGTH})"
            )));
        }
        self.chunk.set_u8(0, count as u8);
        for (i, ch) in phrase.chars().enumerate() {
            self.chunk.set_u32(ITEM_HEADER + 4 * i, ch as u32);
        }
        Ok(())
    }

    /// Append one pronunciation (`phrase_length` keys plus its count).
    pub fn append_pronunciation(&mut self, keys: &[SyllableKey], freq: u32) -> Result<()> {
        let len = self.phrase_length() as usize;
        if keys.len() != len {
            return Err(CoreError::Range(format!(
                "pronunciation of {} keys for phrase of length {}",
                keys.len(),
                len
            )));
        }
        let npron = self.pronunciation_count();
        if npron == u8::MAX {
            return Err(CoreError::CapacityOverflow);
        }
        for key in keys {
            self.chunk.append_content(&key.as_u16().to_le_bytes());
        }
        self.chunk.append_content(&freq.to_le_bytes());
        self.chunk.set_u8(1, npron + 1);
        Ok(())
    }

    pub fn remove_nth_pronunciation(&mut self, nth: usize) -> Result<()> {
        let npron = self.pronunciation_count() as usize;
        if nth >= npron {
            return Err(CoreError::Range(format!(
                "pronunciation {nth} of {npron}"
            )));
        }
        let len = self.phrase_length() as usize;
        self.chunk
            .remove_content(pron_offset(len, nth), 2 * len + 4)?;
        self.chunk.set_u8(1, (npron - 1) as u8);
        Ok(())
    }

    pub fn get_nth_pronunciation(&self, nth: usize) -> Option<(Vec<SyllableKey>, u32)> {
        self.as_view().get_nth_pronunciation(nth)
    }

    pub fn pinyin_possibility(&self, options: MatchOptions, keys: &[SyllableKey]) -> f32 {
        self.as_view().pinyin_possibility(options, keys)
    }

    pub fn increase_pinyin_possibility(
        &mut self,
        options: MatchOptions,
        keys: &[SyllableKey],
        delta: u32,
    ) -> Result<()> {
        item_increase_pinyin_possibility(self.chunk.as_mut_slice(), options, keys, delta)
    }
}

/// One phrase library: index buffer, content buffer and the library's
/// unigram total.
#[derive(Debug, Default)]
pub struct SubPhraseIndex {
    total_freq: u32,
    index: MemoryChunk,
    content: MemoryChunk,
}

impl SubPhraseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_freq(&self) -> u32 {
        self.total_freq
    }

    /// Number of index slots, i.e. one past the largest assignable id.
    fn slot_count(&self) -> usize {
        self.index.size() / 4
    }

    fn item_offset(&self, token: PhraseToken) -> Option<usize> {
        let slot = (token & PHRASE_MASK) as usize * 4;
        let offset = self.index.get_u32(slot).ok()?;
        if offset == 0 {
            None
        } else {
            Some(offset as usize)
        }
    }

    fn item_bounds(&self, offset: usize) -> Option<(usize, usize)> {
        let len = self.content.get_u8(offset).ok()? as usize;
        let npron = self.content.get_u8(offset + 1).ok()? as usize;
        let end = offset + item_total_len(len, npron);
        if end > self.content.size() {
            warn!(offset, "phrase item overruns its content buffer");
            return None;
        }
        Some((offset, end))
    }

    pub fn get_phrase_item(&self, token: PhraseToken) -> Option<PhraseItemView<'_>> {
        let (begin, end) = self.item_bounds(self.item_offset(token)?)?;
        Some(PhraseItemView {
            bytes: &self.content.as_slice()[begin..end],
        })
    }

    /// Append an item to the content buffer and record its offset under the
    /// token's slot. An existing entry for the token is overwritten.
    pub fn add_phrase_item(&mut self, token: PhraseToken, item: &PhraseItem) -> Result<()> {
        let new_total = self
            .total_freq
            .checked_add(item.unigram_frequency())
            .ok_or(CoreError::CapacityOverflow)?;
        let mut offset = self.content.size();
        if offset == 0 {
            offset = CONTENT_RESERVED;
        }
        self.content.set_content(offset, item.as_bytes());
        self.index
            .set_u32((token & PHRASE_MASK) as usize * 4, offset as u32);
        self.total_freq = new_total;
        Ok(())
    }

    /// Clear the token's slot and copy the removed item out, subtracting its
    /// unigram count from the library total.
    pub fn remove_phrase_item(&mut self, token: PhraseToken) -> Result<PhraseItem> {
        let offset = self.item_offset(token).ok_or_else(|| {
            CoreError::Range(format!("remove_phrase_item on absent token {token:#x}"))
        })?;
        let (begin, end) = self
            .item_bounds(offset)
            .ok_or_else(|| CoreError::Format(format!("malformed item at offset {offset}")))?;
        let item = PhraseItem::from_bytes(self.content.as_slice()[begin..end].to_vec())?;
        self.index.set_u32((token & PHRASE_MASK) as usize * 4, 0);
        self.total_freq = self.total_freq.saturating_sub(item.unigram_frequency());
        Ok(item)
    }

    pub fn add_unigram_frequency(&mut self, token: PhraseToken, delta: u32) -> Result<()> {
        let offset = self.item_offset(token).ok_or_else(|| {
            CoreError::Range(format!("add_unigram_frequency on absent token {token:#x}"))
        })?;
        let freq = self.content.get_u32(offset + 2)?;
        let new_freq = freq.checked_add(delta).ok_or(CoreError::CapacityOverflow)?;
        let new_total = self
            .total_freq
            .checked_add(delta)
            .ok_or(CoreError::CapacityOverflow)?;
        self.content.set_u32(offset + 2, new_freq);
        self.total_freq = new_total;
        Ok(())
    }

    /// In-place update of a stored item's matching pronunciation counts.
    pub fn increase_pinyin_possibility(
        &mut self,
        token: PhraseToken,
        options: MatchOptions,
        keys: &[SyllableKey],
        delta: u32,
    ) -> Result<()> {
        let offset = self.item_offset(token).ok_or_else(|| {
            CoreError::Range(format!(
                "increase_pinyin_possibility on absent token {token:#x}"
            ))
        })?;
        let (begin, end) = self
            .item_bounds(offset)
            .ok_or_else(|| CoreError::Format(format!("malformed item at offset {offset}")))?;
        item_increase_pinyin_possibility(
            &mut self.content.as_mut_slice()[begin..end],
            options,
            keys,
            delta,
        )
    }

    /// In-library id range `(begin, end)` covering every assignable slot.
    pub fn token_range(&self) -> Option<(u32, u32)> {
        let slots = self.slot_count();
        if slots == 0 {
            None
        } else {
            Some((1, slots as u32))
        }
    }

    /// Load from an image: u32 total, three u32 offsets, `#`-separated index
    /// and content areas. Offsets are relative to the start of `chunk`.
    pub fn load(&mut self, chunk: &MemoryChunk, offset: usize, end: usize) -> Result<()> {
        let total = chunk.get_u32(offset)?;
        let index_one = chunk.get_u32(offset + 4)? as usize;
        let index_two = chunk.get_u32(offset + 8)? as usize;
        let index_three = chunk.get_u32(offset + 12)? as usize;

        let sep_ok = chunk.get_u8(offset + 16)? == SEPARATOR
            && index_two >= 1
            && chunk.get_u8(index_two - 1)? == SEPARATOR
            && index_three >= 1
            && chunk.get_u8(index_three - 1)? == SEPARATOR;
        if !sep_ok {
            return Err(CoreError::Format(
                "phrase index image separators are wrong".into(),
            ));
        }
        if index_one > index_two - 1 || index_two > index_three - 1 || index_three > end {
            return Err(CoreError::Format(
                "phrase index image offsets are inconsistent".into(),
            ));
        }

        self.index = chunk.get_sub_chunk(index_one, index_two - 1 - index_one)?;
        self.content = chunk.get_sub_chunk(index_two, index_three - 1 - index_two)?;
        self.total_freq = total;
        Ok(())
    }

    /// Write the image at `offset` into `new_chunk`; returns the end offset.
    pub fn store(&self, new_chunk: &mut MemoryChunk, offset: usize) -> Result<usize> {
        new_chunk.set_u32(offset, self.total_freq);
        let header = offset + 4;
        let mut pos = offset + 16;
        new_chunk.set_u8(pos, SEPARATOR);
        pos += 1;
        let index_one = pos;
        new_chunk.set_content(pos, self.index.as_slice());
        pos += self.index.size();
        new_chunk.set_u8(pos, SEPARATOR);
        pos += 1;
        let index_two = pos;
        new_chunk.set_content(pos, self.content.as_slice());
        pos += self.content.size();
        new_chunk.set_u8(pos, SEPARATOR);
        pos += 1;
        let index_three = pos;
        new_chunk.set_u32(header, index_one as u32);
        new_chunk.set_u32(header + 4, index_two as u32);
        new_chunk.set_u32(header + 8, index_three as u32);
        Ok(index_three)
    }
}

/// Facade over up to 16 phrase libraries, dispatching on the library bits of
/// each token. Keeps the global unigram total.
#[derive(Debug, Default)]
pub struct FacadePhraseIndex {
    total_freq: u32,
    subs: [Option<SubPhraseIndex>; PHRASE_INDEX_LIBRARY_COUNT],
}

impl FacadePhraseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn valid_library(library: usize) -> Result<usize> {
        if (1..PHRASE_INDEX_LIBRARY_COUNT).contains(&library) {
            Ok(library)
        } else {
            Err(CoreError::Range(format!(
                "library {library} outside 1..{PHRASE_INDEX_LIBRARY_COUNT}"
            )))
        }
    }

    pub fn is_loaded(&self, library: usize) -> bool {
        matches!(self.subs.get(library), Some(Some(_)))
    }

    /// Indices of the currently loaded libraries, ascending. Drives
    /// store/load cycles over a whole facade.
    pub fn loaded_libraries(&self) -> impl Iterator<Item = usize> + '_ {
        self.subs
            .iter()
            .enumerate()
            .filter_map(|(lib, sub)| sub.as_ref().map(|_| lib))
    }

    pub fn phrase_index_total_freq(&self) -> u32 {
        self.total_freq
    }

    /// Load one library from its binary image, replacing any previous load.
    pub fn load(&mut self, library: usize, chunk: &MemoryChunk) -> Result<()> {
        let library = Self::valid_library(library)?;
        let mut sub = SubPhraseIndex::new();
        sub.load(chunk, 0, chunk.size())?;
        if let Some(old) = self.subs[library].take() {
            self.total_freq = self.total_freq.saturating_sub(old.total_freq());
        }
        self.total_freq = self
            .total_freq
            .checked_add(sub.total_freq())
            .ok_or(CoreError::CapacityOverflow)?;
        self.subs[library] = Some(sub);
        Ok(())
    }

    /// Write one library's image into `chunk` (starting at offset 0).
    pub fn store(&self, library: usize, chunk: &mut MemoryChunk) -> Result<()> {
        let library = Self::valid_library(library)?;
        let sub = self.subs[library]
            .as_ref()
            .ok_or_else(|| CoreError::Range(format!("library {library} is not loaded")))?;
        sub.store(chunk, 0)?;
        Ok(())
    }

    pub fn unload(&mut self, library: usize) -> Result<()> {
        let library = Self::valid_library(library)?;
        let sub = self.subs[library]
            .take()
            .ok_or_else(|| CoreError::Range(format!("library {library} is not loaded")))?;
        self.total_freq = self.total_freq.saturating_sub(sub.total_freq());
        Ok(())
    }

    /// Ingest a text dictionary into one library.
    ///
    /// Line format: `keys phrase token freq`, where `keys` is a
    /// comma-separated list of packed syllable keys (decimal u16), one per
    /// codepoint of `phrase`. Lines starting with `#` and blank lines are
    /// skipped. Multiple lines with the same token become multiple
    /// pronunciations of one item; the item's unigram count is their sum.
    pub fn load_text<R: BufRead>(&mut self, library: usize, reader: R) -> Result<()> {
        let library = Self::valid_library(library)?;
        type Grouped = BTreeMap<PhraseToken, (String, Vec<(Vec<SyllableKey>, u32)>)>;
        let mut grouped: Grouped = BTreeMap::new();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let &[keys_s, phrase_s, token_s, freq_s] = fields.as_slice() else {
                return Err(CoreError::Format(format!(
                    "line {}: expected `keys phrase token freq`",
                    lineno + 1
                )));
            };
            let bad_field =
                |what: &str| CoreError::Format(format!("line {}: bad {what}", lineno + 1));
            let keys = keys_s
                .split(',')
                .map(|s| s.parse::<u16>().map(SyllableKey::from_u16))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|_| bad_field("syllable keys"))?;
            let token: PhraseToken = token_s.parse().map_err(|_| bad_field("token"))?;
            let freq: u32 = freq_s.parse().map_err(|_| bad_field("frequency"))?;
            let phrase = crate::utils::normalize(phrase_s);
            if library_of(token) != library {
                return Err(CoreError::Format(format!(
                    "line {}: token {token:#x} belongs to library {}, not {library}",
                    lineno + 1,
                    library_of(token)
                )));
            }
            if keys.len() != phrase.chars().count() {
                return Err(CoreError::Format(format!(
                    "line {}: {} keys for {} codepoints",
                    lineno + 1,
                    keys.len(),
                    phrase.chars().count()
                )));
            }
            let entry = grouped
                .entry(token)
                .or_insert_with(|| (phrase.clone(), Vec::new()));
            if entry.0 != phrase {
                return Err(CoreError::Format(format!(
                    "line {}: conflicting text for token {token:#x}",
                    lineno + 1
                )));
            }
            entry.1.push((keys, freq));
        }

        for (token, (phrase, prons)) in grouped {
            let mut item = PhraseItem::new();
            item.set_phrase(&phrase)?;
            let mut unigram: u32 = 0;
            for (keys, freq) in prons {
                item.append_pronunciation(&keys, freq)?;
                unigram = unigram.saturating_add(freq);
            }
            item.set_unigram_frequency(unigram);
            self.add_phrase_item(token, &item)?;
        }
        Ok(())
    }

    pub fn get_phrase_item(&self, token: PhraseToken) -> Option<PhraseItemView<'_>> {
        self.subs
            .get(library_of(token))?
            .as_ref()?
            .get_phrase_item(token)
    }

    pub fn add_phrase_item(&mut self, token: PhraseToken, item: &PhraseItem) -> Result<()> {
        let library = Self::valid_library(library_of(token))?;
        let new_total = self
            .total_freq
            .checked_add(item.unigram_frequency())
            .ok_or(CoreError::CapacityOverflow)?;
        let sub = self.subs[library].get_or_insert_with(SubPhraseIndex::new);
        sub.add_phrase_item(token, item)?;
        self.total_freq = new_total;
        Ok(())
    }

    pub fn remove_phrase_item(&mut self, token: PhraseToken) -> Result<PhraseItem> {
        let library = Self::valid_library(library_of(token))?;
        let sub = self.subs[library]
            .as_mut()
            .ok_or_else(|| CoreError::Range(format!("library {library} is not loaded")))?;
        let item = sub.remove_phrase_item(token)?;
        self.total_freq = self.total_freq.saturating_sub(item.unigram_frequency());
        Ok(item)
    }

    pub fn add_unigram_frequency(&mut self, token: PhraseToken, delta: u32) -> Result<()> {
        let library = Self::valid_library(library_of(token))?;
        let new_total = self
            .total_freq
            .checked_add(delta)
            .ok_or(CoreError::CapacityOverflow)?;
        let sub = self.subs[library]
            .as_mut()
            .ok_or_else(|| CoreError::Range(format!("library {library} is not loaded")))?;
        sub.add_unigram_frequency(token, delta)?;
        self.total_freq = new_total;
        Ok(())
    }

    pub fn increase_pinyin_possibility(
        &mut self,
        token: PhraseToken,
        options: MatchOptions,
        keys: &[SyllableKey],
        delta: u32,
    ) -> Result<()> {
        let library = Self::valid_library(library_of(token))?;
        let sub = self.subs[library]
            .as_mut()
            .ok_or_else(|| CoreError::Range(format!("library {library} is not loaded")))?;
        sub.increase_pinyin_possibility(token, options, keys, delta)
    }

    /// Token range `(begin, end)` of one library, if loaded.
    pub fn get_range(&self, library: usize) -> Option<(PhraseToken, PhraseToken)> {
        let sub = self.subs.get(library)?.as_ref()?;
        let (begin, end) = sub.token_range()?;
        Some((make_token(library, begin), make_token(library, end)))
    }

    /// Allocate an empty range list for every loaded library.
    pub fn prepare_ranges(&self) -> PhraseRanges {
        std::array::from_fn(|lib| self.subs[lib].as_ref().map(|_| Vec::new()))
    }

    /// Truncate every allocated range list for reuse.
    pub fn clear_ranges(ranges: &mut PhraseRanges) {
        for slot in ranges.iter_mut().flatten() {
            slot.clear();
        }
    }

    /// Reassemble the decoded sentence from a results vector, joining phrase
    /// texts with `delimiter`.
    pub fn convert_to_utf8(&self, results: &[PhraseToken], delimiter: &str) -> String {
        let mut parts = Vec::new();
        for &token in results {
            if token == NULL_TOKEN {
                continue;
            }
            match self.get_phrase_item(token) {
                Some(item) => parts.push(item.phrase_string()),
                None => warn!(token, "result token missing from phrase index"),
            }
        }
        parts.join(delimiter)
    }
}
