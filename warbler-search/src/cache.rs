//! Two-generation language-model score cache
//!
//! Scores are expensive to compute and most of them are re-requested on the
//! very next frame. The cache keeps two generations: `retrieve` serves from
//! the new generation, promotes hits from the old one, and otherwise hands
//! out a slot holding `INVALID_SCORE` for the caller to fill. `clean` ages
//! the generations, dropping everything that was not touched since the last
//! call.

use rustc_hash::FxHashMap;

use crate::types::{PronunciationId, Score};

/// Opaque handle of a language-model history.
pub type HistoryHandle = u64;

pub type CacheKey = (HistoryHandle, PronunciationId);

/// Sentinel for a slot whose score has not been computed yet.
pub const INVALID_SCORE: Score = Score::INFINITY;

#[derive(Debug, Default)]
pub struct ScoreCache {
    new_gen: FxHashMap<CacheKey, Score>,
    old_gen: FxHashMap<CacheKey, Score>,
}

impl ScoreCache {
    pub fn new() -> Self {
        ScoreCache::default()
    }

    /// Look up the slot for `key`, promoting it from the old generation if
    /// needed. A fresh slot holds [`INVALID_SCORE`]; the caller computes
    /// and stores the score through the returned reference.
    pub fn retrieve(&mut self, key: CacheKey) -> &mut Score {
        match self.new_gen.entry(key) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let promoted = self.old_gen.remove(&key).unwrap_or(INVALID_SCORE);
                entry.insert(promoted)
            }
        }
    }

    pub fn is_cached(&self, key: &CacheKey) -> bool {
        self.new_gen.contains_key(key) || self.old_gen.contains_key(key)
    }

    /// Age the generations: what was retrieved since the last `clean`
    /// survives one more round, everything older is dropped. Returns the
    /// number of retained entries.
    pub fn clean(&mut self) -> usize {
        let retained = self.new_gen.len();
        std::mem::swap(&mut self.new_gen, &mut self.old_gen);
        self.new_gen.clear();
        retained
    }

    pub fn len(&self) -> usize {
        self.new_gen.len() + self.old_gen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.new_gen.is_empty() && self.old_gen.is_empty()
    }

    pub fn clear(&mut self) {
        self.new_gen.clear();
        self.old_gen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieve_hands_out_a_fillable_slot() {
        let mut cache = ScoreCache::new();
        let slot = cache.retrieve((1, 2));
        assert_eq!(*slot, INVALID_SCORE);
        *slot = 4.5;
        assert_eq!(*cache.retrieve((1, 2)), 4.5);
    }

    #[test]
    fn entries_survive_one_clean_without_touches() {
        let mut cache = ScoreCache::new();
        *cache.retrieve((1, 2)) = 4.5;

        assert_eq!(cache.clean(), 1);
        // Promoted back from the old generation.
        assert_eq!(*cache.retrieve((1, 2)), 4.5);
        assert_eq!(cache.clean(), 1);
    }

    #[test]
    fn untouched_entries_age_out_after_two_cleans() {
        let mut cache = ScoreCache::new();
        *cache.retrieve((1, 2)) = 4.5;

        assert_eq!(cache.clean(), 1);
        assert_eq!(cache.clean(), 0);
        assert_eq!(*cache.retrieve((1, 2)), INVALID_SCORE);
    }

    #[test]
    fn generations_keep_keys_distinct() {
        let mut cache = ScoreCache::new();
        *cache.retrieve((1, 2)) = 1.0;
        cache.clean();
        *cache.retrieve((3, 4)) = 2.0;

        assert!(cache.is_cached(&(1, 2)));
        assert!(cache.is_cached(&(3, 4)));
        assert_eq!(cache.len(), 2);
        // Touching the old key keeps it alive across the next clean.
        assert_eq!(*cache.retrieve((1, 2)), 1.0);
        cache.clean();
        assert!(cache.is_cached(&(1, 2)));
        assert!(cache.is_cached(&(3, 4)));
    }
}
