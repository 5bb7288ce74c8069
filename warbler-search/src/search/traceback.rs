//! Traceback and lattice types returned by the decoders.

use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

use crate::types::{PronunciationId, Score, TimeframeIndex};

/// Separated acoustic and language-model score halves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreVector {
    pub acoustic: Score,
    pub lm: Score,
}

impl ScoreVector {
    pub fn new(acoustic: Score, lm: Score) -> Self {
        ScoreVector { acoustic, lm }
    }

    pub fn total(&self) -> Score {
        self.acoustic + self.lm
    }
}

impl Add for ScoreVector {
    type Output = ScoreVector;

    fn add(self, rhs: ScoreVector) -> ScoreVector {
        ScoreVector {
            acoustic: self.acoustic + rhs.acoustic,
            lm: self.lm + rhs.lm,
        }
    }
}

impl AddAssign for ScoreVector {
    fn add_assign(&mut self, rhs: ScoreVector) {
        self.acoustic += rhs.acoustic;
        self.lm += rhs.lm;
    }
}

impl Sub for ScoreVector {
    type Output = ScoreVector;

    fn sub(self, rhs: ScoreVector) -> ScoreVector {
        ScoreVector {
            acoustic: self.acoustic - rhs.acoustic,
            lm: self.lm - rhs.lm,
        }
    }
}

/// One recognized word: which pronunciation ended at which timeframe, with
/// the accumulated score at that point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TracebackItem {
    pub pronunciation: PronunciationId,
    pub time: TimeframeIndex,
    pub scores: ScoreVector,
}

/// The best word sequence so far, oldest word first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Traceback {
    pub items: Vec<TracebackItem>,
}

impl Traceback {
    pub fn pronunciations(&self) -> Vec<PronunciationId> {
        self.items.iter().map(|item| item.pronunciation).collect()
    }

    /// Score accumulated over the whole traceback.
    pub fn final_scores(&self) -> ScoreVector {
        self.items.last().map(|item| item.scores).unwrap_or_default()
    }
}

/// A degenerate single-path lattice over the current best traceback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WordLattice {
    pub arcs: Vec<WordLatticeArc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WordLatticeArc {
    pub pronunciation: PronunciationId,
    pub begin: TimeframeIndex,
    pub end: TimeframeIndex,
    pub scores: ScoreVector,
}

impl WordLattice {
    /// Linearize a traceback: each item spans from the end of its
    /// predecessor, and carries the score difference as its arc score.
    pub fn from_traceback(traceback: &Traceback) -> Self {
        let mut arcs = Vec::with_capacity(traceback.items.len());
        let mut begin: TimeframeIndex = 0;
        let mut previous = ScoreVector::default();
        for item in &traceback.items {
            arcs.push(WordLatticeArc {
                pronunciation: item.pronunciation,
                begin,
                end: item.time,
                scores: item.scores - previous,
            });
            begin = item.time;
            previous = item.scores;
        }
        WordLattice { arcs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_arcs_carry_score_deltas() {
        let traceback = Traceback {
            items: vec![
                TracebackItem {
                    pronunciation: 3,
                    time: 10,
                    scores: ScoreVector::new(5.0, 1.0),
                },
                TracebackItem {
                    pronunciation: 7,
                    time: 25,
                    scores: ScoreVector::new(12.0, 3.0),
                },
            ],
        };

        let lattice = WordLattice::from_traceback(&traceback);
        assert_eq!(lattice.arcs.len(), 2);
        assert_eq!(lattice.arcs[0].begin, 0);
        assert_eq!(lattice.arcs[0].end, 10);
        assert_eq!(lattice.arcs[1].begin, 10);
        assert_eq!(lattice.arcs[1].scores, ScoreVector::new(7.0, 2.0));
        assert_eq!(traceback.final_scores().total(), 15.0);
    }
}
