//! Pronunciation lexicon interface
//!
//! The builders only ever enumerate pronunciations and look up a handful of
//! special lemmata by name ("silence", "blank", "word-boundary",
//! "sentence-end"). Everything else about the lexicon stays outside this
//! crate.

use rustc_hash::FxHashMap;

use crate::types::{LemmaId, PhonemeId, PronunciationId};

/// One pronunciation: an ordered phoneme sequence plus the lemmata it spells.
#[derive(Debug, Clone)]
pub struct Pronunciation {
    pub id: PronunciationId,
    pub phonemes: Vec<PhonemeId>,
    pub lemmas: Vec<LemmaId>,
}

impl Pronunciation {
    pub fn len(&self) -> usize {
        self.phonemes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phonemes.is_empty()
    }
}

/// Read access to a pronunciation lexicon.
pub trait Lexicon {
    /// All pronunciations, in a stable order.
    fn pronunciations(&self) -> &[Pronunciation];

    /// The pronunciation of a special lemma ("silence", "blank",
    /// "word-boundary", "sentence-end", ...), if the lexicon defines it.
    /// Only the first pronunciation of the lemma is reported.
    fn special(&self, name: &str) -> Option<PronunciationId>;
}

/// An in-memory lexicon.
#[derive(Debug, Default)]
pub struct MemoryLexicon {
    pronunciations: Vec<Pronunciation>,
    specials: FxHashMap<String, PronunciationId>,
    next_lemma: LemmaId,
}

impl MemoryLexicon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a word with one pronunciation; returns the pronunciation id.
    pub fn add(&mut self, phonemes: &[PhonemeId]) -> PronunciationId {
        let id = self.pronunciations.len() as PronunciationId;
        let lemma = self.next_lemma;
        self.next_lemma += 1;
        self.pronunciations.push(Pronunciation {
            id,
            phonemes: phonemes.to_vec(),
            lemmas: vec![lemma],
        });
        id
    }

    /// Add a special lemma (e.g. "silence") with its pronunciation.
    pub fn add_special(&mut self, name: &str, phonemes: &[PhonemeId]) -> PronunciationId {
        let id = self.add(phonemes);
        self.specials.insert(name.to_string(), id);
        id
    }
}

impl Lexicon for MemoryLexicon {
    fn pronunciations(&self) -> &[Pronunciation] {
        &self.pronunciations
    }

    fn special(&self, name: &str) -> Option<PronunciationId> {
        self.specials.get(name).copied()
    }
}
