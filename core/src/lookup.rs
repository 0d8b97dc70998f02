//! Pinyin lattice decoder: beam search over syllable positions.
//!
//! For an input of N syllables the decoder keeps N+1 step columns. Column k
//! holds the hypotheses whose last phrase ends after k syllables; each
//! hypothesis records its landing token, the landing token of its
//! predecessor, the accumulated log-probability and the column it was
//! extended from. A column's index keys hypotheses by landing token: when
//! two extensions land on the same token, the better log-probability wins
//! and ties keep the incumbent.
//!
//! Advancing a column builds a table cache of candidate token ranges per
//! phrase length (grown while the phonetic index reports a continued
//! match), selects the top-W hypotheses, and extends them along two scoring
//! paths: the bigram path over every beam member, mixing the merged
//! system/user bigram with the unigram, and a unigram-only path from the
//! beam maximum that keeps unsupported-but-plausible words reachable.
//! Pinned positions bypass the cache and force their single token through.
//!
//! Training walks a confirmed result and feeds the pinned transitions back
//! into the user bigram layer and the phrase index counts.

use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use ahash::AHashMap;
use lru::LruCache;
use tracing::{debug, trace, warn};

use crate::bigram::Bigram;
use crate::error::{CoreError, Result};
use crate::key::{MatchOptions, SyllableKey};
use crate::phonetic::{PhoneticIndex, SEARCH_CONTINUED};
use crate::phrase_index::{
    FacadePhraseIndex, PhraseRanges, PhraseToken, MAX_PHRASE_LENGTH, NULL_TOKEN, SENTENCE_START,
};
use crate::single_gram::{merge_single_gram, SingleGram};
use crate::Config;

/// Per-position user directive on the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Constraint {
    #[default]
    None,
    /// The user fixed the phrase starting at this position.
    Pinned { token: PhraseToken },
    /// Strictly inside a pinned phrase that starts at `owner`.
    Blocked { owner: usize },
}

pub type Constraints = Vec<Constraint>;

fn constraint_at(constraints: &[Constraint], i: usize) -> Constraint {
    constraints.get(i).copied().unwrap_or(Constraint::None)
}

/// A candidate phrase may only cover unconstrained positions.
fn span_unconstrained(constraints: &[Constraint], begin: usize, len: usize) -> bool {
    (begin..begin + len).all(|i| constraint_at(constraints, i) == Constraint::None)
}

/// Clear the pinned span covering `index` (whether `index` is the pinned
/// head or a blocked tail position). Returns false when nothing was set.
fn clear_span(constraints: &mut [Constraint], index: usize) -> bool {
    if index >= constraints.len() {
        return false;
    }
    let owner = match constraints[index] {
        Constraint::None => return false,
        Constraint::Pinned { .. } => index,
        Constraint::Blocked { owner } => owner,
    };
    constraints[owner] = Constraint::None;
    let mut i = owner + 1;
    while i < constraints.len() {
        match constraints[i] {
            Constraint::Blocked { owner: o } if o == owner => {
                constraints[i] = Constraint::None;
                i += 1;
            }
            _ => break,
        }
    }
    true
}

#[derive(Debug, Clone, Copy)]
struct LookupValue {
    /// Landing token of the predecessor hypothesis.
    prev: PhraseToken,
    /// Token whose phrase ends at this column.
    token: PhraseToken,
    /// Accumulated natural-log probability.
    poss: f32,
    /// Column this hypothesis was extended from; -1 at the seed.
    last_step: i32,
}

#[derive(Debug, Default)]
struct Step {
    index: AHashMap<PhraseToken, usize>,
    content: Vec<LookupValue>,
}

/// The decoder. One instance serves one caller at a time; the per-request
/// step columns are rebuilt on every [`PinyinLookup::get_best_match`].
pub struct PinyinLookup {
    options: MatchOptions,
    config: Config,
    phonetic: Arc<dyn PhoneticIndex + Send + Sync>,
    phrase_index: Arc<RwLock<FacadePhraseIndex>>,
    system_bigram: Arc<Bigram>,
    user_bigram: Arc<Bigram>,
    steps: Vec<Step>,
    merged_cache: LruCache<PhraseToken, Option<Arc<SingleGram>>>,
    table_cache: Vec<PhraseRanges>,
}

impl PinyinLookup {
    pub fn new(
        options: MatchOptions,
        phonetic: Arc<dyn PhoneticIndex + Send + Sync>,
        phrase_index: Arc<RwLock<FacadePhraseIndex>>,
        system_bigram: Arc<Bigram>,
        user_bigram: Arc<Bigram>,
        lambda: f32,
    ) -> Self {
        let config = Config {
            lambda,
            ..Config::default()
        };
        Self::with_config(
            options,
            phonetic,
            phrase_index,
            system_bigram,
            user_bigram,
            config,
        )
    }

    pub fn with_config(
        options: MatchOptions,
        phonetic: Arc<dyn PhoneticIndex + Send + Sync>,
        phrase_index: Arc<RwLock<FacadePhraseIndex>>,
        system_bigram: Arc<Bigram>,
        user_bigram: Arc<Bigram>,
        config: Config,
    ) -> Self {
        let cache_capacity = NonZeroUsize::new(config.merged_cache_size)
            .unwrap_or(NonZeroUsize::new(256).unwrap());
        PinyinLookup {
            options,
            config,
            phonetic,
            phrase_index,
            system_bigram,
            user_bigram,
            steps: Vec::new(),
            merged_cache: LruCache::new(cache_capacity),
            table_cache: Vec::new(),
        }
    }

    pub fn set_options(&mut self, options: MatchOptions) {
        self.options = options;
    }

    pub fn options(&self) -> MatchOptions {
        self.options
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Guess the best sentence for `keys` under `constraints`.
    ///
    /// `prefixes` are the tokens preceding the sentence, used as bigram
    /// context at column 0; it must contain at least [`SENTENCE_START`].
    /// On success `results[k]` holds the token of the phrase starting at
    /// position k (or [`NULL_TOKEN`] inside a phrase span); on failure the
    /// vector is null-filled and false is returned.
    pub fn get_best_match(
        &mut self,
        prefixes: &[PhraseToken],
        keys: &[SyllableKey],
        constraints: &[Constraint],
        results: &mut Vec<PhraseToken>,
    ) -> bool {
        let nstep = keys.len() + 1;
        results.clear();
        results.resize(nstep, NULL_TOKEN);

        if prefixes.is_empty() {
            warn!("get_best_match without prefix tokens");
            return false;
        }

        self.steps.clear();
        self.steps.resize_with(nstep, Step::default);
        self.merged_cache.clear();
        self.table_cache.clear();

        // seed column 0, keyed by the landing token of each prefix
        for &prefix in prefixes {
            let step = &mut self.steps[0];
            if !step.index.contains_key(&prefix) {
                step.content.push(LookupValue {
                    prev: NULL_TOKEN,
                    token: prefix,
                    poss: 0.0,
                    last_step: -1,
                });
                step.index.insert(prefix, step.content.len() - 1);
            }
        }

        let phrase_index = Arc::clone(&self.phrase_index);
        let index = phrase_index.read().unwrap_or_else(|e| e.into_inner());
        debug!(nkeys = keys.len(), prefixes = prefixes.len(), "lattice search");

        let mut ctx = SearchCtx {
            options: self.options,
            lambda: self.config.lambda,
            beam_width: self.config.beam_width,
            phonetic: self.phonetic.as_ref(),
            index: &index,
            system: &self.system_bigram,
            user: &self.user_bigram,
            steps: &mut self.steps,
            merged_cache: &mut self.merged_cache,
            table_cache: &mut self.table_cache,
            keys,
            constraints,
        };

        for i in 0..keys.len() {
            let cache_len = ctx.prepare_table_cache(i);
            let Some((beam, max)) = ctx.beam_top(i) else {
                continue;
            };
            trace!(column = i, beam = beam.len(), cache_len, "column advance");
            ctx.search_bigram(i, cache_len, &beam);
            ctx.search_unigram(i, cache_len, &max);
        }

        ctx.final_step(results)
    }

    /// Feed a confirmed result back into the model.
    ///
    /// Positions pinned in `constraints` activate training, and the first
    /// word after each pinned run is trained too, so the successor of a
    /// confirmed word is learned alongside it. Each activated `(prev, cur)`
    /// transition bumps the matched pronunciation count, the unigram count
    /// and the user-layer bigram by the configured training factor; a
    /// counter at capacity skips that one update.
    pub fn train(
        &mut self,
        keys: &[SyllableKey],
        constraints: &[Constraint],
        results: &[PhraseToken],
    ) -> Result<()> {
        let phrase_index = Arc::clone(&self.phrase_index);
        let mut index = phrase_index.write().unwrap_or_else(|e| e.into_inner());
        let factor = self.config.train_factor;

        let mut last_token = SENTENCE_START;
        let mut train_next = false;
        for (i, &token) in results.iter().enumerate() {
            if token == NULL_TOKEN {
                continue;
            }
            let pinned = match constraint_at(constraints, i) {
                Constraint::Pinned { token: t } if t == token => true,
                Constraint::Pinned { token: t } => {
                    warn!(
                        position = i,
                        pinned = t,
                        result = token,
                        "pinned token differs from result, not training it"
                    );
                    false
                }
                _ => false,
            };
            if train_next || pinned {
                train_next = pinned;

                let Some(len) = index
                    .get_phrase_item(token)
                    .map(|item| item.phrase_length() as usize)
                else {
                    warn!(token, "confirmed token missing from phrase index");
                    last_token = token;
                    continue;
                };
                if i + len > keys.len() {
                    warn!(token, position = i, "confirmed phrase overruns the keys");
                    last_token = token;
                    continue;
                }

                match index.increase_pinyin_possibility(
                    token,
                    self.options,
                    &keys[i..i + len],
                    factor,
                ) {
                    Ok(()) => {}
                    Err(CoreError::CapacityOverflow) => {
                        debug!(token, "pronunciation count at capacity, skipped")
                    }
                    Err(e) => return Err(e),
                }
                match index.add_unigram_frequency(token, factor) {
                    Ok(()) => {}
                    Err(CoreError::CapacityOverflow) => {
                        debug!(token, "unigram count at capacity, skipped")
                    }
                    Err(e) => return Err(e),
                }
                self.train_bigram(last_token, token, factor)?;
            }
            last_token = token;
        }
        Ok(())
    }

    /// One load-merge-store transaction on the user layer for `(prev, cur)`.
    fn train_bigram(&self, prev: PhraseToken, cur: PhraseToken, factor: u32) -> Result<()> {
        let system = if self.system_bigram.is_attached() {
            self.system_bigram.load(prev)?
        } else {
            None
        };
        let mut user = match self.user_bigram.load(prev)? {
            Some(gram) => gram,
            None => {
                let mut gram = SingleGram::new();
                gram.set_total_freq(system.as_ref().map(|s| s.get_total_freq()).unwrap_or(0));
                gram
            }
        };
        if user.get_freq(cur).is_none() {
            let seed = system.as_ref().and_then(|s| s.get_freq(cur)).unwrap_or(0);
            user.insert_freq(cur, seed)?;
        }
        let total = user.get_total_freq();
        let Some(new_total) = total.checked_add(factor) else {
            debug!(prev, cur, "bigram total at capacity, skipped");
            return Ok(());
        };
        let freq = user.get_freq(cur).unwrap_or(0);
        let Some(new_freq) = freq.checked_add(factor) else {
            debug!(prev, cur, "bigram count at capacity, skipped");
            return Ok(());
        };
        user.set_total_freq(new_total);
        user.set_freq(cur, new_freq)?;
        self.user_bigram.store(prev, &user)
    }

    /// Pin `token` at position `index`. Overlapping pins are cleared first.
    /// Returns the phrase length, or 0 when the token is unknown or its
    /// span would overrun the constraints.
    pub fn add_constraint(
        &self,
        constraints: &mut Constraints,
        index: usize,
        token: PhraseToken,
    ) -> usize {
        let phrase_index = Arc::clone(&self.phrase_index);
        let guard = phrase_index.read().unwrap_or_else(|e| e.into_inner());
        let Some(len) = guard
            .get_phrase_item(token)
            .map(|item| item.phrase_length() as usize)
        else {
            return 0;
        };
        if len == 0 || index + len > constraints.len() {
            return 0;
        }
        for i in index..index + len {
            clear_span(constraints, i);
        }
        constraints[index] = Constraint::Pinned { token };
        for slot in constraints.iter_mut().take(index + len).skip(index + 1) {
            *slot = Constraint::Blocked { owner: index };
        }
        len
    }

    /// Clear the pinned span covering `index`.
    pub fn clear_constraint(&self, constraints: &mut Constraints, index: usize) -> bool {
        clear_span(constraints, index)
    }

    /// Reconcile constraints with a re-parsed key sequence: resize to the
    /// new length (padding with NONE), then drop every pin whose span
    /// overruns the keys or whose pronunciation no longer matches them.
    pub fn validate_constraint(&self, constraints: &mut Constraints, keys: &[SyllableKey]) -> bool {
        constraints.resize(keys.len(), Constraint::None);
        let phrase_index = Arc::clone(&self.phrase_index);
        let guard = phrase_index.read().unwrap_or_else(|e| e.into_inner());
        for i in 0..constraints.len() {
            if let Constraint::Pinned { token } = constraints[i] {
                let Some(item) = guard.get_phrase_item(token) else {
                    clear_span(constraints, i);
                    continue;
                };
                let len = item.phrase_length() as usize;
                if i + len > constraints.len() {
                    clear_span(constraints, i);
                    continue;
                }
                if item.pinyin_possibility(self.options, &keys[i..i + len]) < f32::EPSILON {
                    clear_span(constraints, i);
                }
            }
        }
        true
    }

    /// Reassemble the decoded sentence, joining phrases with `delimiter`.
    pub fn convert_to_utf8(&self, results: &[PhraseToken], delimiter: &str) -> String {
        let phrase_index = Arc::clone(&self.phrase_index);
        let guard = phrase_index.read().unwrap_or_else(|e| e.into_inner());
        guard.convert_to_utf8(results, delimiter)
    }
}

/// Borrowed view of everything one search needs; keeps the facade read lock
/// for the whole request so the candidate tables stay coherent.
struct SearchCtx<'a> {
    options: MatchOptions,
    lambda: f32,
    beam_width: usize,
    phonetic: &'a (dyn PhoneticIndex + Send + Sync),
    index: &'a FacadePhraseIndex,
    system: &'a Bigram,
    user: &'a Bigram,
    steps: &'a mut Vec<Step>,
    merged_cache: &'a mut LruCache<PhraseToken, Option<Arc<SingleGram>>>,
    table_cache: &'a mut Vec<PhraseRanges>,
    keys: &'a [SyllableKey],
    constraints: &'a [Constraint],
}

/// Flatten one cache entry into (begin, end) pairs, library ascending.
fn collect_ranges(ranges: &PhraseRanges) -> Vec<(PhraseToken, PhraseToken)> {
    ranges
        .iter()
        .flatten()
        .flat_map(|slot| slot.iter().copied())
        .collect()
}

impl<'a> SearchCtx<'a> {
    /// Fill the per-length candidate tables for phrases starting at
    /// `start`; returns how many lengths are cached (1..=returned).
    fn prepare_table_cache(&mut self, start: usize) -> usize {
        let max_len = MAX_PHRASE_LENGTH.min(self.keys.len() - start);
        let mut filled = 0;
        for l in 0..max_len {
            if self.table_cache.len() <= l {
                self.table_cache.push(self.index.prepare_ranges());
            } else {
                FacadePhraseIndex::clear_ranges(&mut self.table_cache[l]);
            }
            let result = self.phonetic.search(
                &self.keys[start..start + l + 1],
                self.options,
                &mut self.table_cache[l],
            );
            filled = l + 1;
            if result & SEARCH_CONTINUED == 0 {
                break;
            }
        }
        filled
    }

    /// Top-W hypotheses of column `i` by log-probability, best first.
    fn beam_top(&self, i: usize) -> Option<(Vec<LookupValue>, LookupValue)> {
        let content = &self.steps[i].content;
        if content.is_empty() {
            return None;
        }
        let mut beam = content.clone();
        beam.sort_unstable_by(|a, b| {
            b.poss
                .partial_cmp(&a.poss)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        beam.truncate(self.beam_width);
        let max = beam[0];
        Some((beam, max))
    }

    fn search_bigram(&mut self, i: usize, cache_len: usize, beam: &[LookupValue]) {
        match constraint_at(self.constraints, i) {
            Constraint::Blocked { .. } => {}
            Constraint::Pinned { token } => {
                for cur in beam {
                    let Some(merged) = self.merged_gram(cur.token) else {
                        continue;
                    };
                    let total = merged.get_total_freq();
                    if total == 0 {
                        continue;
                    }
                    let Some(freq) = merged.get_freq(token) else {
                        continue;
                    };
                    if freq == 0 {
                        continue;
                    }
                    let poss = freq as f32 / total as f32;
                    self.bigram_gen_next_step(i, cur, token, poss);
                }
            }
            Constraint::None => {
                for cur in beam {
                    let Some(merged) = self.merged_gram(cur.token) else {
                        continue;
                    };
                    for l in 1..=cache_len {
                        if !span_unconstrained(self.constraints, i, l) {
                            continue;
                        }
                        for (begin, end) in collect_ranges(&self.table_cache[l - 1]) {
                            for (token, poss) in merged.search(begin, end) {
                                self.bigram_gen_next_step(i, cur, token, poss);
                            }
                        }
                    }
                }
            }
        }
    }

    fn search_unigram(&mut self, i: usize, cache_len: usize, max: &LookupValue) {
        match constraint_at(self.constraints, i) {
            Constraint::Blocked { .. } => {}
            Constraint::Pinned { token } => {
                self.unigram_gen_next_step(i, max, token);
            }
            Constraint::None => {
                for l in 1..=cache_len {
                    if !span_unconstrained(self.constraints, i, l) {
                        continue;
                    }
                    for (begin, end) in collect_ranges(&self.table_cache[l - 1]) {
                        for token in begin..end {
                            self.unigram_gen_next_step(i, max, token);
                        }
                    }
                }
            }
        }
    }

    /// Phrase length, unigram probability and pinyin match likelihood of a
    /// candidate landing from column `i`. None when the token is unknown or
    /// its phrase overruns the input.
    fn item_stats(&self, i: usize, token: PhraseToken) -> Option<(usize, f32, f32)> {
        let item = self.index.get_phrase_item(token)?;
        let len = item.phrase_length() as usize;
        if len == 0 || i + len > self.keys.len() {
            return None;
        }
        let total = self.index.phrase_index_total_freq();
        let unigram_poss = if total > 0 {
            item.unigram_frequency() as f32 / total as f32
        } else {
            0.0
        };
        let pinyin_poss = item.pinyin_possibility(self.options, &self.keys[i..i + len]);
        Some((len, unigram_poss, pinyin_poss))
    }

    fn bigram_gen_next_step(
        &mut self,
        i: usize,
        cur: &LookupValue,
        token: PhraseToken,
        bigram_poss: f32,
    ) -> bool {
        let Some((len, unigram_poss, pinyin_poss)) = self.item_stats(i, token) else {
            return false;
        };
        if bigram_poss < f32::EPSILON && unigram_poss < f32::EPSILON {
            return false;
        }
        if pinyin_poss < f32::EPSILON {
            return false;
        }
        let mixed = self.lambda * bigram_poss + (1.0 - self.lambda) * unigram_poss;
        let poss = cur.poss + (mixed * pinyin_poss).ln();
        self.save_next_step(
            i + len,
            LookupValue {
                prev: cur.token,
                token,
                poss,
                last_step: i as i32,
            },
        )
    }

    fn unigram_gen_next_step(&mut self, i: usize, max: &LookupValue, token: PhraseToken) -> bool {
        let Some((len, unigram_poss, pinyin_poss)) = self.item_stats(i, token) else {
            return false;
        };
        if unigram_poss < f32::EPSILON {
            return false;
        }
        if pinyin_poss < f32::EPSILON {
            return false;
        }
        let poss = max.poss + (unigram_poss * pinyin_poss * (1.0 - self.lambda)).ln();
        self.save_next_step(
            i + len,
            LookupValue {
                prev: max.token,
                token,
                poss,
                last_step: i as i32,
            },
        )
    }

    /// Emit-or-merge into the landing column, keyed by the landing token.
    /// An existing entry survives unless strictly beaten.
    fn save_next_step(&mut self, pos: usize, next: LookupValue) -> bool {
        let step = &mut self.steps[pos];
        match step.index.entry(next.token) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                step.content.push(next);
                slot.insert(step.content.len() - 1);
                true
            }
            std::collections::hash_map::Entry::Occupied(entry) => {
                let existing = &mut step.content[*entry.get()];
                if existing.poss < next.poss {
                    *existing = next;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Merged system/user single-gram for one previous token, cached for
    /// the duration of the request.
    fn merged_gram(&mut self, prev: PhraseToken) -> Option<Arc<SingleGram>> {
        if let Some(cached) = self.merged_cache.get(&prev) {
            return cached.clone();
        }
        let system = if self.system.is_attached() {
            self.system.load(prev).unwrap_or_else(|e| {
                warn!(token = prev, error = %e, "system bigram load failed");
                None
            })
        } else {
            None
        };
        let user = if self.user.is_attached() {
            self.user.load(prev).unwrap_or_else(|e| {
                warn!(token = prev, error = %e, "user bigram load failed");
                None
            })
        } else {
            None
        };
        let merged = merge_single_gram(system.as_ref(), user.as_ref()).map(Arc::new);
        self.merged_cache.put(prev, merged.clone());
        merged
    }

    /// Pick the best hypothesis of the last column and walk its back
    /// pointers, writing the landing token of each visited phrase at its
    /// start column.
    fn final_step(&mut self, results: &mut Vec<PhraseToken>) -> bool {
        for slot in results.iter_mut() {
            *slot = NULL_TOKEN;
        }
        let Some(last) = self.steps.last() else {
            return false;
        };
        if last.content.is_empty() {
            return false;
        }
        let mut best = last.content[0];
        for value in &last.content[1..] {
            if value.poss > best.poss {
                best = *value;
            }
        }
        trace!(poss = best.poss, "backtrace from {}", best.token);
        while best.last_step >= 0 {
            let column = best.last_step as usize;
            results[column] = best.token;
            let step = &self.steps[column];
            let Some(&slot) = step.index.get(&best.prev) else {
                warn!(column, token = best.prev, "backtrace lost its predecessor");
                for entry in results.iter_mut() {
                    *entry = NULL_TOKEN;
                }
                return false;
            };
            best = step.content[slot];
        }
        true
    }
}
