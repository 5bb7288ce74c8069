//! Online decoding protocol
//!
//! A decoder is fed one segment at a time: `enter_segment`, any number of
//! `add_feature` calls interleaved with `decode_step`/`decode_more`, then
//! `finish_segment`. Partial results can be read at any point between
//! entering and finishing a segment.

use warbler_common::Result;

use crate::types::Score;

pub mod timesync;
pub mod traceback;

pub use timesync::{EmissionScorer, LanguageModel, TimesyncSearch};
pub use traceback::{ScoreVector, Traceback, TracebackItem, WordLattice, WordLatticeArc};

/// Metadata of the segment about to be decoded.
#[derive(Debug, Clone, Default)]
pub struct SegmentInfo {
    pub name: Option<String>,
    /// Expected number of frames, when the caller knows it up front.
    pub expected_frames: Option<u32>,
}

/// Where a decoder currently is in the segment protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Idle,
    Entered,
    Feeding,
    Finished,
}

/// The online decoding interface.
pub trait SearchAlgorithm {
    /// Discard all segment state and partial results.
    fn reset(&mut self);

    /// Begin a new segment. Fails when the previous segment was entered but
    /// never finished.
    fn enter_segment(&mut self, info: Option<&SegmentInfo>) -> Result<()>;

    /// Close the current segment; afterwards the traceback covers all fed
    /// frames.
    fn finish_segment(&mut self) -> Result<()>;

    /// Feed one frame of emission scores.
    fn add_feature(&mut self, feature: &[Score]) -> Result<()>;

    /// Feed several frames at once.
    fn add_features(&mut self, features: &[Vec<Score>]) -> Result<()> {
        for feature in features {
            self.add_feature(feature)?;
        }
        Ok(())
    }

    /// Decode one step if a frame is pending. Returns whether a step was
    /// actually performed.
    fn decode_step(&mut self) -> bool;

    /// Decode until no more pending frames can be processed. Returns
    /// whether any step was made.
    fn decode_more(&mut self) -> bool {
        let mut progressed = false;
        while self.decode_step() {
            progressed = true;
        }
        progressed
    }

    /// The best word sequence over everything decoded so far.
    fn current_best_traceback(&self) -> Traceback;

    /// The current best path as a single-path lattice.
    fn current_best_word_lattice(&self) -> WordLattice {
        WordLattice::from_traceback(&self.current_best_traceback())
    }

    fn reset_statistics(&mut self);

    fn log_statistics(&self);
}
