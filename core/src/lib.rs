//! libhanyu-core
//!
//! Sentence-level pinyin input-method core. Converts an already-parsed
//! syllable sequence into the most likely sequence of word tokens under an
//! interpolated bigram+unigram language model, honoring user-pinned
//! segments and learning from confirmed sentences.
//!
//! The crate is the storage-and-search half of an IME; syllable parsing and
//! the UI candidate plumbing live in frontend crates. Public pieces:
//!
//! - [`MemoryChunk`] - owned-or-shared byte buffer behind every packed
//!   structure
//! - [`PhraseItem`] / [`FacadePhraseIndex`] - per-library phrase storage
//!   with unigram counts and per-pronunciation weights
//! - [`SingleGram`] / [`Bigram`] - bigram rows and their redb-backed store,
//!   layered system/user
//! - [`PhoneticIndex`] / [`FstPhoneticIndex`] - the syllables-to-tokens
//!   search contract and a bundled FST implementation
//! - [`PinyinLookup`] - the lattice decoder: beam search, constraints,
//!   backtrace, training

use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{CoreError, Result};

pub mod chunk;
pub use chunk::MemoryChunk;

pub mod key;
pub use key::{keys_match, MatchOptions, SyllableKey};

pub mod phrase_index;
pub use phrase_index::{
    library_of, make_token, FacadePhraseIndex, PhraseItem, PhraseItemView, PhraseRanges,
    PhraseToken, SubPhraseIndex, MAX_PHRASE_LENGTH, NULL_TOKEN, PHRASE_INDEX_LIBRARY_COUNT,
    PHRASE_MASK, SENTENCE_START,
};

pub mod single_gram;
pub use single_gram::{merge_single_gram, SingleGram};

pub mod bigram;
pub use bigram::{AttachMode, Bigram, BIGRAM_MAGIC};

pub mod phonetic;
pub use phonetic::{
    FstPhoneticIndex, FstPhoneticIndexBuilder, PhoneticIndex, SearchResult, SEARCH_CONTINUED,
    SEARCH_NONE, SEARCH_OK,
};

pub mod lookup;
pub use lookup::{Constraint, Constraints, PinyinLookup};

/// Decoder configuration.
///
/// `lambda` is the weight of the bigram probability in the interpolation
/// `lambda * P(w2|w1) + (1 - lambda) * P(w2)`. The default 0.293 is the
/// deleted-interpolation estimate shipped by upstream libpinyin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub lambda: f32,
    /// Hypotheses kept per lattice column.
    pub beam_width: usize,
    /// Count added to pronunciation, unigram and user-bigram frequencies
    /// per confirmed word.
    pub train_factor: u32,
    /// Capacity of the per-request merged single-gram cache.
    pub merged_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lambda: 0.293,
            beam_width: 32,
            train_factor: 23,
            merged_cache_size: 256,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_toml<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_toml<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml_string(&self) -> std::result::Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.lambda.is_finite() || self.lambda <= 0.0 || self.lambda >= 1.0 {
            return Err(CoreError::Logic(format!(
                "lambda {} outside (0, 1)",
                self.lambda
            )));
        }
        if self.beam_width == 0 {
            return Err(CoreError::Logic("beam width of zero".into()));
        }
        Ok(())
    }
}

/// Utility helpers.
pub mod utils {
    /// Normalize input strings (NFC) and trim whitespace.
    pub fn normalize(s: &str) -> String {
        use unicode_normalization::UnicodeNormalization;
        s.nfc().collect::<String>().trim().to_string()
    }
}
