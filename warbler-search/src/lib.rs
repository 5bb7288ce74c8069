//! Search-network compilation and online decoding
//!
//! This crate compiles a pronunciation lexicon and an acoustic context into
//! a persistent search network, minimizes it, and decodes feature streams
//! over the frozen form. The classic minimized HMM topology and the flat
//! CTC/RNA/attention label topologies share one network representation and
//! one decoding protocol.

pub mod acoustic;
pub mod builder;
pub mod cache;
pub mod graph;
pub mod lexicon;
pub mod search;
pub mod types;

pub use acoustic::{AcousticContext, ContextTable, HmmSequence, StateDescriptor};
pub use builder::{
    AedTreeBuilder, CtcTreeBuilder, LabelBuilderOptions, MinimizedBuilderOptions,
    MinimizedTreeBuilder, RnaTreeBuilder, TreeBuilder,
};
pub use cache::{HistoryHandle, ScoreCache, INVALID_SCORE};
pub use graph::{CompactNetwork, Edge, Exit, SearchNetwork, StateNetwork};
pub use lexicon::{Lexicon, MemoryLexicon, Pronunciation};
pub use search::{
    EmissionScorer, LanguageModel, ScoreVector, SearchAlgorithm, SegmentInfo, TimesyncSearch,
    Traceback, TracebackItem, WordLattice,
};
pub use types::{EmissionId, ExitId, PhonemeId, PronunciationId, Score, StateId, TimeframeIndex};
