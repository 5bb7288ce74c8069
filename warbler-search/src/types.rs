//! Scalar id types shared across the search network and the decoders.

/// Index into the state arena of a search network. `0` is reserved/invalid.
pub type StateId = u32;

/// The reserved invalid state id.
pub const INVALID_STATE: StateId = 0;

/// Index into the de-duplicated exit list of a search network.
pub type ExitId = u32;

/// Phoneme identifier. `0` is the reserved context terminator ("#"),
/// standing in for "no phoneme" on either side of a word boundary.
pub type PhonemeId = u32;

/// The context terminator phoneme id.
pub const TERM: PhonemeId = 0;

/// Identifier of a pronunciation in the lexicon.
pub type PronunciationId = u32;

/// The reserved invalid pronunciation id.
pub const INVALID_PRONUNCIATION: PronunciationId = u32::MAX;

/// Identifier of a lemma (orthographic word) in the lexicon.
pub type LemmaId = u32;

/// Tied acoustic emission class, produced by the acoustic-context lookup.
pub type EmissionId = u32;

/// Index of a state-transition model in the acoustic model.
pub type TransitionModelIndex = u16;

/// Frame index within a segment.
pub type TimeframeIndex = u32;

/// Negative log score. Lower is better.
pub type Score = f32;
