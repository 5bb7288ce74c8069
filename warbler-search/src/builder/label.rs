//! Label-topology builders
//!
//! Flat per-pronunciation networks for CTC, RNA and attention decoders.
//! No suffix sharing and no coarticulation: every pronunciation is one
//! chain of label states behind the root, optionally interleaved with
//! blank states, and every exit routes back to a root.

use tracing::info;

use crate::acoustic::{boundary, AcousticContext, StateDescriptor};
use crate::graph::{Edge, Exit, SearchNetwork};
use crate::lexicon::Lexicon;
use crate::types::{ExitId, PronunciationId, StateId, INVALID_STATE};
use warbler_common::{Error, Result};

use super::{BuilderBase, LabelBuilderOptions, TreeBuilder};

/// State and edge helpers shared by the CTC and AED builders.
struct LabelBuilderCore<'a> {
    lexicon: &'a dyn Lexicon,
    acoustic: &'a dyn AcousticContext,
    network: SearchNetwork,
    base: BuilderBase,
    word_boundary_root: StateId,
}

impl<'a> LabelBuilderCore<'a> {
    fn new(lexicon: &'a dyn Lexicon, acoustic: &'a dyn AcousticContext) -> Self {
        let mut core = LabelBuilderCore {
            lexicon,
            acoustic,
            network: SearchNetwork::new(),
            base: BuilderBase::new(),
            word_boundary_root: INVALID_STATE,
        };

        let root = core.create_root();
        core.network.root_state = root;
        core.network.ci_root_state = root;

        if lexicon.special("word-boundary").is_some() {
            core.word_boundary_root = core.create_root();
            core.network.other_root_states.insert(core.word_boundary_root);
        }
        core
    }

    fn create_root(&mut self) -> StateId {
        self.base
            .create_state(&mut self.network, StateDescriptor::root())
    }

    fn require_context_independent_labels(&self) -> Result<()> {
        for pron in self.lexicon.pronunciations() {
            for &phone in &pron.phonemes {
                if self.acoustic.is_context_dependent(phone) {
                    return Err(Error::InvalidModel(
                        "label topologies require context-independent labels".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Reuse an existing successor with the same descriptor, else extend.
    fn extend_state(&mut self, predecessor: StateId, desc: StateDescriptor) -> StateId {
        for edge in self.network.structure.successors(predecessor) {
            if let Edge::State(target) = edge {
                if self.network.structure.descriptor(*target) == desc {
                    return *target;
                }
            }
        }
        let state = self.base.create_state(&mut self.network, desc);
        self.network.structure.add_transition(predecessor, state);
        state
    }

    /// Add a transition unless a successor with the same descriptor already
    /// exists; label networks identify states by descriptor.
    fn add_transition(&mut self, predecessor: StateId, successor: StateId) {
        let desc = self.network.structure.descriptor(successor);
        for edge in self.network.structure.successors(predecessor) {
            if let Edge::State(target) = edge {
                if self.network.structure.descriptor(*target) == desc {
                    return;
                }
            }
        }
        self.network.structure.add_transition(predecessor, successor);
    }

    fn add_exit(
        &mut self,
        state: StateId,
        transit_state: StateId,
        pronunciation: PronunciationId,
    ) -> ExitId {
        let exit = self.base.create_exit(
            &mut self.network,
            Exit {
                pronunciation,
                transit_state,
            },
        );
        self.network.structure.add_exit_edge(state, exit);
        exit
    }

    /// Expand one pronunciation as a CTC chain: each label state may loop,
    /// blanks are inserted between labels, and the blank before a repeated
    /// label can be made mandatory.
    fn extend_pronunciation_ctc(
        &mut self,
        start: StateId,
        phonemes: &[crate::types::PhonemeId],
        opts: &LabelBuilderOptions,
        blank: StateDescriptor,
    ) -> StateId {
        let mut current = start;
        let mut prev_label: Option<StateId> = None;

        for (i, &phone) in phonemes.iter().enumerate() {
            let mut flags = boundary::NONE;
            if i == 0 {
                flags |= boundary::INITIAL_PHONE;
            }
            if i + 1 == phonemes.len() {
                flags |= boundary::FINAL_PHONE;
            }
            let hmm = self
                .acoustic
                .hmm_from_allophone(crate::types::TERM, phone, crate::types::TERM, flags);
            let phone_is_blank = hmm.len() == 1 && hmm[0] == blank;

            for (s, &desc) in hmm.iter().enumerate() {
                current = self.extend_state(current, desc);

                if opts.allow_label_loop {
                    self.add_transition(current, current);
                }

                if let Some(prev) = prev_label {
                    // Let the path skip the blank between two labels, except
                    // between equal labels when a separating blank is forced.
                    let repetition = prev != current
                        && self.network.structure.descriptor(prev)
                            == self.network.structure.descriptor(current);
                    if !(repetition && opts.force_blank_between_repeated_labels) {
                        self.add_transition(prev, current);
                    }
                }
                prev_label = Some(current);

                let last_in_word =
                    s + 1 == hmm.len() && (flags & boundary::FINAL_PHONE) != 0;
                if !phone_is_blank && !last_in_word {
                    current = self.extend_state(current, blank);
                    if opts.allow_blank_loop {
                        self.add_transition(current, current);
                    }
                }
            }
        }
        current
    }

    /// Expand one pronunciation as a plain chain without loops or blanks.
    fn extend_pronunciation_plain(
        &mut self,
        start: StateId,
        phonemes: &[crate::types::PhonemeId],
    ) -> StateId {
        let mut current = start;
        for (i, &phone) in phonemes.iter().enumerate() {
            let mut flags = boundary::NONE;
            if i == 0 {
                flags |= boundary::INITIAL_PHONE;
            }
            if i + 1 == phonemes.len() {
                flags |= boundary::FINAL_PHONE;
            }
            let hmm = self
                .acoustic
                .hmm_from_allophone(crate::types::TERM, phone, crate::types::TERM, flags);
            for &desc in hmm.iter() {
                current = self.extend_state(current, desc);
            }
        }
        current
    }

    /// Build the word-boundary token behind its own root, with an optional
    /// blank in front, and route its exit back to the main root.
    fn add_word_boundary_states<F>(
        &mut self,
        opts: Option<&LabelBuilderOptions>,
        blank: Option<StateDescriptor>,
        extend: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Self, StateId, &[crate::types::PhonemeId]) -> StateId,
    {
        let Some(wb) = self.lexicon.special("word-boundary") else {
            return Ok(());
        };
        let phonemes = self
            .lexicon
            .pronunciations()
            .iter()
            .find(|p| p.id == wb)
            .map(|p| p.phonemes.clone())
            .unwrap_or_default();
        if phonemes.is_empty() {
            return Err(Error::Lexicon(
                "the word-boundary lemma needs a non-empty pronunciation".into(),
            ));
        }

        let wb_root = self.word_boundary_root;
        let end = extend(self, wb_root, &phonemes);
        debug_assert_ne!(end, INVALID_STATE);
        self.add_exit(end, self.network.root_state, wb);

        if let (Some(opts), Some(blank)) = (opts, blank) {
            // An optional blank may precede the word-boundary token.
            let starts: Vec<StateId> = self
                .network
                .structure
                .successors(self.word_boundary_root)
                .iter()
                .filter_map(|e| e.as_state())
                .collect();
            let blank_before = self.extend_state(self.word_boundary_root, blank);
            for start in starts {
                self.network.structure.add_transition(blank_before, start);
            }
            if opts.allow_blank_loop {
                self.add_transition(blank_before, blank_before);
            }
        }
        Ok(())
    }
}

/// CTC topology: label loops, blank insertion, forced blanks between
/// repeated labels.
pub struct CtcTreeBuilder<'a> {
    core: LabelBuilderCore<'a>,
    opts: LabelBuilderOptions,
}

impl<'a> CtcTreeBuilder<'a> {
    pub fn new(
        lexicon: &'a dyn Lexicon,
        acoustic: &'a dyn AcousticContext,
        opts: LabelBuilderOptions,
    ) -> Self {
        CtcTreeBuilder {
            core: LabelBuilderCore::new(lexicon, acoustic),
            opts,
        }
    }

    pub fn finish(self) -> SearchNetwork {
        self.core.network
    }
}

impl<'a> TreeBuilder for CtcTreeBuilder<'a> {
    fn build(&mut self) -> Result<()> {
        self.core.require_context_independent_labels()?;
        let blank = self
            .core
            .acoustic
            .blank()
            .ok_or_else(|| Error::InvalidModel("CTC needs a blank unit".into()))?;

        let opts = self.opts.clone();
        self.core.add_word_boundary_states(Some(&opts), Some(blank), |core, start, phones| {
            core.extend_pronunciation_ctc(start, phones, &opts, blank)
        })?;

        let word_boundary = self.core.lexicon.special("word-boundary");
        let blank_lemma = self.core.lexicon.special("blank");
        let silence = self.core.lexicon.special("silence");

        let prons: Vec<(PronunciationId, Vec<crate::types::PhonemeId>)> = self
            .core
            .lexicon
            .pronunciations()
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| (p.id, p.phonemes.clone()))
            .collect();
        for (pron, phonemes) in prons {
            if Some(pron) == word_boundary {
                continue;
            }
            let last =
                self.core
                    .extend_pronunciation_ctc(self.core.network.root_state, &phonemes, &self.opts, blank);

            // Blank and silence do not announce a word boundary.
            if word_boundary.is_some() && Some(pron) != blank_lemma && Some(pron) != silence {
                self.core.add_exit(last, self.core.word_boundary_root, pron);
            } else {
                self.core.add_exit(last, self.core.network.root_state, pron);
            }
        }

        info!(
            states = self.core.network.state_count(),
            exits = self.core.network.exits.len(),
            "built CTC network"
        );
        Ok(())
    }

    fn network(&self) -> &SearchNetwork {
        &self.core.network
    }
}

/// RNA topology: a CTC network without label loops and without forced
/// blanks, so every frame advances.
pub struct RnaTreeBuilder<'a> {
    inner: CtcTreeBuilder<'a>,
}

impl<'a> RnaTreeBuilder<'a> {
    pub fn new(lexicon: &'a dyn Lexicon, acoustic: &'a dyn AcousticContext) -> Self {
        RnaTreeBuilder {
            inner: CtcTreeBuilder::new(lexicon, acoustic, LabelBuilderOptions::rna()),
        }
    }

    pub fn finish(self) -> SearchNetwork {
        self.inner.finish()
    }
}

impl<'a> TreeBuilder for RnaTreeBuilder<'a> {
    fn build(&mut self) -> Result<()> {
        self.inner.build()
    }

    fn network(&self) -> &SearchNetwork {
        self.inner.network()
    }
}

/// Attention-decoder topology: plain label chains, no blanks, no loops.
/// The lexicon must name a sentence-end lemma so decoding can stop.
pub struct AedTreeBuilder<'a> {
    core: LabelBuilderCore<'a>,
}

impl<'a> AedTreeBuilder<'a> {
    pub fn new(lexicon: &'a dyn Lexicon, acoustic: &'a dyn AcousticContext) -> Self {
        AedTreeBuilder {
            core: LabelBuilderCore::new(lexicon, acoustic),
        }
    }

    pub fn finish(self) -> SearchNetwork {
        self.core.network
    }
}

impl<'a> TreeBuilder for AedTreeBuilder<'a> {
    fn build(&mut self) -> Result<()> {
        self.core.require_context_independent_labels()?;

        let sentence_end = self
            .core
            .lexicon
            .special("sentence-end")
            .or_else(|| self.core.lexicon.special("sentence-boundary"))
            .ok_or_else(|| {
                Error::Lexicon("attention decoding needs a sentence-end lemma".into())
            })?;

        self.core
            .add_word_boundary_states(None, None, |core, start, phones| {
                core.extend_pronunciation_plain(start, phones)
            })?;

        let word_boundary = self.core.lexicon.special("word-boundary");
        let silence = self.core.lexicon.special("silence");

        let prons: Vec<(PronunciationId, Vec<crate::types::PhonemeId>)> = self
            .core
            .lexicon
            .pronunciations()
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| (p.id, p.phonemes.clone()))
            .collect();
        for (pron, phonemes) in prons {
            if Some(pron) == word_boundary {
                continue;
            }
            let last = self
                .core
                .extend_pronunciation_plain(self.core.network.root_state, &phonemes);

            if word_boundary.is_some() && pron != sentence_end && Some(pron) != silence {
                self.core.add_exit(last, self.core.word_boundary_root, pron);
            } else {
                self.core.add_exit(last, self.core.network.root_state, pron);
            }
        }

        info!(
            states = self.core.network.state_count(),
            exits = self.core.network.exits.len(),
            "built attention network"
        );
        Ok(())
    }

    fn network(&self) -> &SearchNetwork {
        &self.core.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acoustic::ContextTable;
    use crate::lexicon::MemoryLexicon;

    fn label_model() -> ContextTable {
        ContextTable::new(4)
            .all_context_independent()
            .with_blank(3)
            .with_silence(2)
    }

    #[test]
    fn ctc_inserts_blank_and_loops() {
        let acoustic = label_model();
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1]);

        let mut builder = CtcTreeBuilder::new(&lexicon, &acoustic, LabelBuilderOptions::ctc());
        builder.build().unwrap();
        let network = builder.network();

        // Root -> label state; the label loops on itself and carries the
        // word exit directly (final label, no trailing blank).
        let label = network
            .structure
            .successors(network.root_state)
            .iter()
            .find_map(|e| e.as_state())
            .unwrap();
        assert!(network
            .structure
            .successors(label)
            .contains(&Edge::State(label)));
        assert!(network
            .structure
            .successors(label)
            .iter()
            .any(|e| e.as_exit().is_some()));
    }

    #[test]
    fn ctc_forces_a_blank_between_repeated_labels() {
        let acoustic = label_model();
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1, 1]);

        let mut builder = CtcTreeBuilder::new(&lexicon, &acoustic, LabelBuilderOptions::ctc());
        builder.build().unwrap();
        let network = builder.network();

        let first = network
            .structure
            .successors(network.root_state)
            .iter()
            .find_map(|e| e.as_state())
            .unwrap();
        let label_desc = network.structure.descriptor(first);
        let blank_desc = acoustic.blank().unwrap();

        // The first instance may loop on itself but must not reach the
        // second instance directly; the blank is the only route.
        let direct: Vec<StateId> = network
            .structure
            .successors(first)
            .iter()
            .filter_map(|e| e.as_state())
            .filter(|s| network.structure.descriptor(*s) == label_desc)
            .collect();
        assert_eq!(direct, vec![first]);

        let blank = network
            .structure
            .successors(first)
            .iter()
            .filter_map(|e| e.as_state())
            .find(|s| network.structure.descriptor(*s) == blank_desc)
            .unwrap();
        let second = network
            .structure
            .successors(blank)
            .iter()
            .filter_map(|e| e.as_state())
            .find(|s| *s != blank && network.structure.descriptor(*s) == label_desc)
            .unwrap();
        assert_ne!(second, first);
    }

    #[test]
    fn ctc_requires_blank() {
        let acoustic = ContextTable::new(3).all_context_independent();
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1]);

        let mut builder = CtcTreeBuilder::new(&lexicon, &acoustic, LabelBuilderOptions::ctc());
        assert!(builder.build().is_err());
    }

    #[test]
    fn ctc_rejects_context_dependent_labels() {
        let acoustic = ContextTable::new(3).with_blank(2);
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1]);

        let mut builder = CtcTreeBuilder::new(&lexicon, &acoustic, LabelBuilderOptions::ctc());
        assert!(builder.build().is_err());
    }

    #[test]
    fn rna_labels_do_not_loop() {
        let acoustic = label_model();
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1]);

        let mut builder = RnaTreeBuilder::new(&lexicon, &acoustic);
        builder.build().unwrap();
        let network = builder.network();

        let label = network
            .structure
            .successors(network.root_state)
            .iter()
            .find_map(|e| e.as_state())
            .unwrap();
        assert!(!network
            .structure
            .successors(label)
            .contains(&Edge::State(label)));
    }

    #[test]
    fn rna_wires_a_blank_between_adjacent_positions() {
        let acoustic = label_model();
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1, 4]);

        let mut builder = RnaTreeBuilder::new(&lexicon, &acoustic);
        builder.build().unwrap();
        let network = builder.network();

        let first = network
            .structure
            .successors(network.root_state)
            .iter()
            .find_map(|e| e.as_state())
            .unwrap();
        let blank_desc = acoustic.blank().unwrap();
        let second_desc = acoustic
            .hmm_from_allophone(
                crate::types::TERM,
                4,
                crate::types::TERM,
                boundary::FINAL_PHONE,
            )[0];

        // The first position feeds a blank; the blank may loop and leads
        // on to the second position.
        let blank = network
            .structure
            .successors(first)
            .iter()
            .filter_map(|e| e.as_state())
            .find(|s| network.structure.descriptor(*s) == blank_desc)
            .unwrap();
        assert!(network
            .structure
            .successors(blank)
            .contains(&Edge::State(blank)));
        assert!(network
            .structure
            .successors(blank)
            .iter()
            .filter_map(|e| e.as_state())
            .any(|s| network.structure.descriptor(s) == second_desc));
    }

    #[test]
    fn aed_requires_sentence_end() {
        let acoustic = label_model();
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1]);

        let mut builder = AedTreeBuilder::new(&lexicon, &acoustic);
        assert!(builder.build().is_err());

        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1]);
        lexicon.add_special("sentence-end", &[2]);
        let mut builder = AedTreeBuilder::new(&lexicon, &acoustic);
        builder.build().unwrap();
    }

    #[test]
    fn word_boundary_gets_its_own_root() {
        let acoustic = label_model();
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1]);
        lexicon.add_special("word-boundary", &[2]);

        let mut builder = CtcTreeBuilder::new(&lexicon, &acoustic, LabelBuilderOptions::ctc());
        builder.build().unwrap();
        let network = builder.network();

        assert_eq!(network.other_root_states.len(), 1);
        let wb_root = *network.other_root_states.iter().next().unwrap();
        assert_ne!(wb_root, network.root_state);
        // The ordinary word ends at the word-boundary root.
        let mut routed = false;
        for state in 1..network.state_count() {
            for edge in network.structure.successors(state) {
                if let Edge::Exit(e) = edge {
                    if network.exit(*e).transit_state == wb_root {
                        routed = true;
                    }
                }
            }
        }
        assert!(routed);
    }
}
