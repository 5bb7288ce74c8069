//! Time-synchronous beam search over a compact network
//!
//! One hypothesis per (state, history) pair; each frame every hypothesis
//! either loops on its scoring state or advances along the network edges.
//! Non-scoring states (roots, skip-roots) are crossed for free within the
//! frame, and word exits charge the language model and extend the history
//! on the way through.

use std::collections::VecDeque;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::acoustic::AcousticContext;
use crate::cache::{HistoryHandle, ScoreCache, INVALID_SCORE};
use crate::graph::{CompactNetwork, Edge};
use crate::types::{EmissionId, PronunciationId, Score, StateId, TimeframeIndex};
use warbler_common::{Error, Result};

use super::traceback::{ScoreVector, Traceback, TracebackItem};
use super::{SearchAlgorithm, SegmentInfo, SegmentState};

/// Scores one emission class against one feature frame.
pub trait EmissionScorer {
    fn score(&self, feature: &[Score], emission: EmissionId) -> Score;
}

/// Language model over pronunciation sequences, addressed through opaque
/// history handles so scores can be cached per (history, word) pair.
pub trait LanguageModel {
    fn start(&self) -> HistoryHandle;
    fn score(&self, history: HistoryHandle, pronunciation: PronunciationId) -> Score;
    fn extend(&self, history: HistoryHandle, pronunciation: PronunciationId) -> HistoryHandle;
}

/// A language model that scores everything zero and keeps one history.
pub struct NullLanguageModel;

impl LanguageModel for NullLanguageModel {
    fn start(&self) -> HistoryHandle {
        0
    }

    fn score(&self, _history: HistoryHandle, _pronunciation: PronunciationId) -> Score {
        0.0
    }

    fn extend(&self, history: HistoryHandle, _pronunciation: PronunciationId) -> HistoryHandle {
        history
    }
}

fn default_beam_limit() -> usize {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TimesyncOptions {
    /// Maximum number of surviving hypotheses per frame.
    pub beam_limit: usize,
}

impl Default for TimesyncOptions {
    fn default() -> Self {
        TimesyncOptions {
            beam_limit: default_beam_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SearchStatistics {
    pub frames: u64,
    pub hypotheses_expanded: u64,
    pub word_ends: u64,
    pub pruned: u64,
}

struct TraceNode {
    predecessor: Option<Rc<TraceNode>>,
    item: TracebackItem,
}

#[derive(Clone)]
struct Hypothesis {
    state: StateId,
    history: HistoryHandle,
    scores: ScoreVector,
    trace: Option<Rc<TraceNode>>,
}

pub struct TimesyncSearch<'a> {
    network: &'a CompactNetwork,
    acoustic: &'a dyn AcousticContext,
    scorer: &'a dyn EmissionScorer,
    lm: &'a dyn LanguageModel,
    opts: TimesyncOptions,
    lm_cache: ScoreCache,
    hypotheses: Vec<Hypothesis>,
    pending: VecDeque<Vec<Score>>,
    time: TimeframeIndex,
    segment: SegmentState,
    stats: SearchStatistics,
}

impl<'a> TimesyncSearch<'a> {
    pub fn new(
        network: &'a CompactNetwork,
        acoustic: &'a dyn AcousticContext,
        scorer: &'a dyn EmissionScorer,
        lm: &'a dyn LanguageModel,
        opts: TimesyncOptions,
    ) -> Self {
        TimesyncSearch {
            network,
            acoustic,
            scorer,
            lm,
            opts,
            lm_cache: ScoreCache::new(),
            hypotheses: Vec::new(),
            pending: VecDeque::new(),
            time: 0,
            segment: SegmentState::Idle,
            stats: SearchStatistics::default(),
        }
    }

    pub fn statistics(&self) -> SearchStatistics {
        self.stats
    }

    fn relax(next: &mut FxHashMap<(StateId, HistoryHandle), Hypothesis>, candidate: Hypothesis) {
        match next.entry((candidate.state, candidate.history)) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                if candidate.scores.total() < entry.get().scores.total() {
                    entry.insert(candidate);
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(candidate);
            }
        }
    }

    fn expand_frame(&mut self, feature: &[Score]) {
        let network = self.network;
        let time = self.time;
        let mut next: FxHashMap<(StateId, HistoryHandle), Hypothesis> = FxHashMap::default();

        let hypotheses = std::mem::take(&mut self.hypotheses);
        for hyp in hypotheses {
            self.stats.hypotheses_expanded += 1;
            let non_scoring = network.is_non_scoring(hyp.state);

            // Loop transition.
            if !non_scoring {
                let emission = network.descriptor(hyp.state).emission;
                let mut scores = hyp.scores;
                scores.acoustic += self.scorer.score(feature, emission);
                Self::relax(
                    &mut next,
                    Hypothesis {
                        state: hyp.state,
                        history: hyp.history,
                        scores,
                        trace: hyp.trace.clone(),
                    },
                );
            }

            // Forward transitions, crossing non-scoring states and word
            // exits within the frame.
            let mut advanced = hyp.scores;
            if !non_scoring {
                advanced.acoustic += self
                    .acoustic
                    .forward_penalty(network.descriptor(hyp.state).transition_model);
            }

            let mut visited: FxHashSet<(StateId, HistoryHandle)> = FxHashSet::default();
            let mut stack: Vec<(Edge, ScoreVector, HistoryHandle, Option<Rc<TraceNode>>)> =
                network
                    .successors(hyp.state)
                    .iter()
                    .map(|edge| (*edge, advanced, hyp.history, hyp.trace.clone()))
                    .collect();

            while let Some((edge, scores, history, trace)) = stack.pop() {
                match edge {
                    Edge::State(target) if network.is_non_scoring(target) => {
                        if visited.insert((target, history)) {
                            for inner in network.successors(target) {
                                stack.push((*inner, scores, history, trace.clone()));
                            }
                        }
                    }
                    Edge::State(target) => {
                        let mut entered = scores;
                        entered.acoustic +=
                            self.scorer.score(feature, network.descriptor(target).emission);
                        Self::relax(
                            &mut next,
                            Hypothesis {
                                state: target,
                                history,
                                scores: entered,
                                trace,
                            },
                        );
                    }
                    Edge::Exit(exit_id) => {
                        let exit = network.exit(exit_id);
                        let slot = self.lm_cache.retrieve((history, exit.pronunciation));
                        if *slot == INVALID_SCORE {
                            *slot = self.lm.score(history, exit.pronunciation);
                        }
                        let mut ended = scores;
                        ended.lm += *slot;
                        let extended = self.lm.extend(history, exit.pronunciation);
                        let node = Rc::new(TraceNode {
                            predecessor: trace,
                            item: TracebackItem {
                                pronunciation: exit.pronunciation,
                                time,
                                scores: ended,
                            },
                        });
                        self.stats.word_ends += 1;
                        if visited.insert((exit.transit_state, extended)) {
                            for inner in network.successors(exit.transit_state) {
                                stack.push((*inner, ended, extended, Some(node.clone())));
                            }
                        }
                    }
                }
            }
        }

        let mut survivors: Vec<Hypothesis> = next.into_values().collect();
        survivors.sort_by(|a, b| a.scores.total().total_cmp(&b.scores.total()));
        if survivors.len() > self.opts.beam_limit {
            self.stats.pruned += (survivors.len() - self.opts.beam_limit) as u64;
            survivors.truncate(self.opts.beam_limit);
        }
        self.hypotheses = survivors;

        let retained = self.lm_cache.clean();
        debug!(frame = self.time, retained, "aged language model cache");

        self.time += 1;
        self.stats.frames += 1;
    }
}

impl<'a> SearchAlgorithm for TimesyncSearch<'a> {
    fn reset(&mut self) {
        self.hypotheses.clear();
        self.pending.clear();
        self.lm_cache.clear();
        self.time = 0;
        self.segment = SegmentState::Idle;
    }

    fn enter_segment(&mut self, info: Option<&SegmentInfo>) -> Result<()> {
        match self.segment {
            SegmentState::Entered | SegmentState::Feeding => {
                return Err(Error::Protocol("segment entered while one is open"));
            }
            SegmentState::Idle | SegmentState::Finished => {}
        }

        if let Some(info) = info {
            info!(name = info.name.as_deref(), "entering segment");
        }
        self.hypotheses = vec![Hypothesis {
            state: self.network.root_state(),
            history: self.lm.start(),
            scores: ScoreVector::default(),
            trace: None,
        }];
        self.pending.clear();
        self.lm_cache.clear();
        self.time = 0;
        self.segment = SegmentState::Entered;
        Ok(())
    }

    fn finish_segment(&mut self) -> Result<()> {
        match self.segment {
            SegmentState::Entered | SegmentState::Feeding => {}
            SegmentState::Idle | SegmentState::Finished => {
                return Err(Error::Protocol("no open segment to finish"));
            }
        }
        self.decode_more();
        self.segment = SegmentState::Finished;
        self.log_statistics();
        Ok(())
    }

    fn add_feature(&mut self, feature: &[Score]) -> Result<()> {
        match self.segment {
            SegmentState::Entered | SegmentState::Feeding => {}
            SegmentState::Idle | SegmentState::Finished => {
                return Err(Error::Protocol("feature fed outside a segment"));
            }
        }
        if feature.is_empty() {
            return Err(Error::Feature("empty feature frame".into()));
        }
        self.pending.push_back(feature.to_vec());
        self.segment = SegmentState::Feeding;
        Ok(())
    }

    fn decode_step(&mut self) -> bool {
        let Some(feature) = self.pending.pop_front() else {
            return false;
        };
        self.expand_frame(&feature);
        true
    }

    fn current_best_traceback(&self) -> Traceback {
        let best = self
            .hypotheses
            .iter()
            .min_by(|a, b| a.scores.total().total_cmp(&b.scores.total()));
        let Some(best) = best else {
            return Traceback::default();
        };

        let mut items = Vec::new();
        let mut node = best.trace.clone();
        while let Some(current) = node {
            items.push(current.item);
            node = current.predecessor.clone();
        }
        items.reverse();
        Traceback { items }
    }

    fn reset_statistics(&mut self) {
        self.stats = SearchStatistics::default();
    }

    fn log_statistics(&self) {
        info!(
            frames = self.stats.frames,
            hypotheses_expanded = self.stats.hypotheses_expanded,
            word_ends = self.stats.word_ends,
            pruned = self.stats.pruned,
            "search statistics"
        );
    }
}
