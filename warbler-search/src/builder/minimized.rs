//! Minimized HMM network builder
//!
//! Builds the prefix-shared body of the vocabulary first, then the fan-in
//! and fan-out structures that stitch word ends to word starts across every
//! phoneme context, and finally minimizes the whole network. Suffix sharing
//! rests on two hashes: `predecessors` maps (successor set, descriptor) to
//! an existing state, and the suffix maps remember where each word's second
//! phoneme begins so the fan-in can be joined onto it.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::acoustic::{boundary, AcousticContext, HmmSequence, StateDescriptor, ENTRY_SKIP};
use crate::graph::{Edge, Exit, SearchNetwork};
use crate::lexicon::Lexicon;
use crate::types::{ExitId, PhonemeId, PronunciationId, StateId, TERM};
use warbler_common::Result;

use super::{
    BuilderBase, MinimizedBuilderOptions, RootKey, StatePredecessor, TreeBuilder,
};

pub(super) type SuffixMap = BTreeMap<RootKey, BTreeSet<Edge>>;

pub struct MinimizedTreeBuilder<'a> {
    lexicon: &'a dyn Lexicon,
    acoustic: &'a dyn AcousticContext,
    pub(super) opts: MinimizedBuilderOptions,
    pub(super) network: SearchNetwork,
    pub(super) base: BuilderBase,
    pub(super) roots: BTreeMap<RootKey, StateId>,
    initial_phonemes: BTreeSet<PhonemeId>,
    final_phonemes: BTreeSet<PhonemeId>,
    /// Starts of second phonemes, keyed by (first, second) phoneme pair.
    pub(super) initial_phone_suffix: SuffixMap,
    /// Exits of one-phoneme words, keyed by (phoneme, following initial).
    pub(super) initial_final_phone_suffix: SuffixMap,
    pub(super) predecessors: FxHashMap<StatePredecessor, StateId>,
    pub(super) state_unique_keys: FxHashMap<StateId, RootKey>,
    skip_roots: FxHashMap<StateId, StateId>,
    pub(super) skip_root_set: BTreeSet<StateId>,
}

impl<'a> TreeBuilder for MinimizedTreeBuilder<'a> {
    fn build(&mut self) -> Result<()> {
        self.build_body()?;
        self.build_fan_in_out();
        self.skip_root_transitions(1);
        for _ in 0..self.opts.minimization_iterations {
            self.minimize(false, false);
        }
        if self.opts.allow_cross_word_skips {
            self.add_cross_word_skips();
        }
        info!("network build complete");
        Ok(())
    }

    fn network(&self) -> &SearchNetwork {
        &self.network
    }
}

impl<'a> MinimizedTreeBuilder<'a> {
    pub fn new(
        lexicon: &'a dyn Lexicon,
        acoustic: &'a dyn AcousticContext,
        opts: MinimizedBuilderOptions,
    ) -> Self {
        if opts.allow_cross_word_skips && acoustic.transition_model_count() > 0 {
            // Cross-word skips assume one global forward/skip penalty.
            let forward = acoustic.forward_penalty(0);
            let skip = acoustic.skip_penalty(0);
            for model in 1..acoustic.transition_model_count() as u16 {
                if acoustic.skip_penalty(model) != skip {
                    warn!(
                        model,
                        value = acoustic.skip_penalty(model),
                        expected = skip,
                        "transition model disagrees on skip penalty"
                    );
                }
                if acoustic.forward_penalty(model) != forward {
                    warn!(
                        model,
                        value = acoustic.forward_penalty(model),
                        expected = forward,
                        "transition model disagrees on forward penalty"
                    );
                }
            }
        }

        let mut builder = MinimizedTreeBuilder {
            lexicon,
            acoustic,
            opts,
            network: SearchNetwork::new(),
            base: BuilderBase::new(),
            roots: BTreeMap::new(),
            initial_phonemes: BTreeSet::new(),
            final_phonemes: BTreeSet::new(),
            initial_phone_suffix: SuffixMap::new(),
            initial_final_phone_suffix: SuffixMap::new(),
            predecessors: FxHashMap::default(),
            state_unique_keys: FxHashMap::default(),
            skip_roots: FxHashMap::default(),
            skip_root_set: BTreeSet::new(),
        };

        let root = builder.create_root(TERM, TERM, 0);
        builder.network.root_state = root;
        builder.network.ci_root_state = root;
        builder
    }

    /// Take the finished network out of the builder.
    pub fn finish(self) -> SearchNetwork {
        self.network
    }

    fn hmm_for(
        &self,
        left: PhonemeId,
        central: PhonemeId,
        right: PhonemeId,
        flags: u8,
    ) -> HmmSequence {
        let mut hmm = self.acoustic.hmm_from_allophone(left, central, right, flags);
        if self.opts.repeat_silence && hmm.len() == 1 && Some(central) == self.acoustic.silence() {
            // A single-state silence could be crossed in one frame.
            let repeated = hmm[0];
            hmm.push(repeated);
        }
        hmm
    }

    fn build_body(&mut self) -> Result<()> {
        let mut ci_initial = 0u32;
        let mut cd_initial = 0u32;
        let mut ci_final = 0u32;
        let mut cd_final = 0u32;

        for pron in self.lexicon.pronunciations() {
            if pron.is_empty() {
                info!(pronunciation = pron.id, "ignoring zero-length pronunciation");
                continue;
            }
            let initial = pron.phonemes[0];
            let fin = pron.phonemes[pron.len() - 1];
            if self.initial_phonemes.insert(initial) {
                if self.acoustic.is_context_dependent(initial) {
                    cd_initial += 1;
                } else {
                    ci_initial += 1;
                }
            }
            if self.final_phonemes.insert(fin) {
                if self.acoustic.is_context_dependent(fin) {
                    cd_final += 1;
                } else {
                    ci_final += 1;
                }
            }
        }

        if (ci_initial == 0 || ci_final == 0) && !self.opts.add_ci_transitions {
            warn!(
                ci_initial,
                ci_final,
                "no context-independent initial or final phonemes; word-end \
                 detection may be unreliable without add-ci-transitions"
            );
        }
        info!(
            cd_initial,
            ci_initial, cd_final, ci_final, "collected word boundary phonemes"
        );

        let use_root_for_ci_exits = self.opts.use_root_for_ci_exits && !self.opts.add_ci_transitions;

        let prons: Vec<(PronunciationId, Vec<PhonemeId>)> = self
            .lexicon
            .pronunciations()
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| (p.id, p.phonemes.clone()))
            .collect();
        let initials: Vec<PhonemeId> = self.initial_phonemes.iter().copied().collect();
        let finals: Vec<PhonemeId> = self.final_phonemes.iter().copied().collect();

        for (pron_id, phones) in &prons {
            let len = phones.len();
            let mut current = self.network.root_state;
            for phone_index in 0..len - 1 {
                current = self.extend_phone(current, phone_index, phones, TERM, TERM);
            }

            let last = phones[len - 1];
            if (len - 1) < self.opts.min_phones as usize
                || !self.acoustic.is_context_dependent(last)
            {
                // Expand the fan-out statically, one tail per following
                // initial phoneme.
                for &initial in &initials {
                    let tail = self.extend_phone(current, len - 1, phones, TERM, initial);
                    let exit = if !self.acoustic.is_context_dependent(last) && use_root_for_ci_exits
                    {
                        self.add_exit(tail, TERM, TERM, 0, *pron_id)
                    } else {
                        self.add_exit(tail, last, initial, 0, *pron_id)
                    };
                    if len == 1 {
                        self.initial_final_phone_suffix
                            .entry(RootKey::new(phones[0], initial, 1))
                            .or_default()
                            .insert(Edge::Exit(exit));
                    }
                }
            } else if len == 1 {
                // Push the single phoneme entirely into the fan-in/out.
                self.add_exit(current, TERM, phones[0], -1, *pron_id);
                for &fin in &finals {
                    let transit = self.create_root(fin, phones[0], -1);
                    let exit = self.base.create_exit(
                        &mut self.network,
                        Exit {
                            pronunciation: *pron_id,
                            transit_state: transit,
                        },
                    );
                    let root = self.create_root(fin, phones[0], 0);
                    self.network.structure.add_exit_edge(root, exit);
                }
            } else {
                // Push the last phoneme into the fan-out.
                let exit = self.add_exit(current, phones[len - 2], phones[len - 1], -1, *pron_id);
                if len == 2 {
                    self.initial_phone_suffix
                        .entry(RootKey::new(phones[0], phones[1], 1))
                        .or_default()
                        .insert(Edge::Exit(exit));
                }
            }
        }

        debug!(
            states = self.network.state_count(),
            exits = self.network.exits.len(),
            roots = self.roots.len(),
            "built network body"
        );
        Ok(())
    }

    fn build_fan_in_out(&mut self) {
        let finals: Vec<PhonemeId> = self.final_phonemes.iter().copied().collect();
        let initials: Vec<PhonemeId> = self.initial_phonemes.iter().copied().collect();
        for &fin in &finals {
            for &initial in &initials {
                self.create_root(fin, initial, 0);
            }
        }

        // Fan-in: the initial word phonemes behind every depth-0 root, up to
        // the shared suffix joints recorded during the body pass.
        let roots: Vec<(RootKey, StateId)> = self.roots.iter().map(|(k, v)| (*k, *v)).collect();
        for &(key, root) in &roots {
            if key.depth != 0 || root == self.network.root_state {
                continue;
            }
            let initial = key.right;
            debug_assert!(self.initial_phonemes.contains(&initial));
            debug_assert_ne!(initial, TERM);

            let suffix_entries: Vec<(RootKey, BTreeSet<Edge>, u8)> = self
                .initial_phone_suffix
                .iter()
                .filter(|(k, _)| k.left == initial)
                .map(|(k, v)| (*k, v.clone(), boundary::INITIAL_PHONE))
                .chain(
                    self.initial_final_phone_suffix
                        .iter()
                        .filter(|(k, _)| k.left == initial)
                        .map(|(k, v)| {
                            (*k, v.clone(), boundary::INITIAL_PHONE | boundary::FINAL_PHONE)
                        }),
                )
                .collect();

            for (suffix_key, suffix, flags) in suffix_entries {
                let hmm = self.hmm_for(key.left, initial, suffix_key.right, flags);
                debug_assert!(!hmm.is_empty());
                let mut current = self.extend_fan_in(suffix, hmm[hmm.len() - 1]);
                for s in (0..hmm.len() - 1).rev() {
                    current = self.extend_fan_in(BTreeSet::from([Edge::State(current)]), hmm[s]);
                }
                self.network.structure.add_transition(root, current);
            }
        }

        debug!(
            states = self.network.state_count(),
            exits = self.network.exits.len(),
            roots = self.roots.len(),
            "built fan-in"
        );

        // Fan-out: the pushed final phonemes, delimited by the depth -1
        // roots on the left and the depth-0 roots on the right. The last
        // fan-out state is equivalent to the right root, so it inherits the
        // root's successor set.
        for &(left_key, left_root) in &roots {
            if left_key.depth != -1 {
                continue;
            }
            let fin = left_key.right;
            debug_assert!(self.final_phonemes.contains(&fin));

            let mut paths = 0u32;
            let right_roots: Vec<(RootKey, StateId)> = self
                .roots
                .iter()
                .filter(|(k, _)| {
                    k.depth == 0
                        && (k.left == fin || (self.opts.add_ci_transitions && k.left == TERM))
                })
                .map(|(k, v)| (*k, *v))
                .collect();
            for (right_key, right_root) in right_roots {
                paths += 1;
                let hmm = self.hmm_for(left_key.left, fin, right_key.right, boundary::FINAL_PHONE);
                debug_assert!(!hmm.is_empty());

                let target_set: BTreeSet<Edge> = self
                    .network
                    .structure
                    .successors(right_root)
                    .iter()
                    .copied()
                    .collect();
                let last = self.extend_fan_in(target_set, hmm[hmm.len() - 1]);
                let mut current = last;
                for s in (0..hmm.len() - 1).rev() {
                    current = self.extend_fan_in(BTreeSet::from([Edge::State(current)]), hmm[s]);
                }

                if right_key.right == TERM || !self.acoustic.is_context_dependent(right_key.right) {
                    self.network.uncoarticulated_word_end_states.insert(last);
                }
                self.network.structure.add_transition(left_root, current);
            }
            debug_assert!(paths > 0);
        }

        self.network.log_stats("after fan-in/out structure");
    }

    /// Splice non-scoring states out of scoring states' successor lists, so
    /// a skip transition never has to cross a root.
    fn skip_root_transitions(&mut self, start: StateId) {
        for state in start..self.network.state_count() {
            if self.network.structure.descriptor(state).is_non_scoring() {
                continue;
            }
            let edges: Vec<Edge> = self.network.structure.successors(state).to_vec();
            for edge in edges {
                let target = match edge {
                    Edge::State(t) => t,
                    Edge::Exit(_) => continue,
                };
                if !self.network.structure.descriptor(target).is_non_scoring() {
                    continue;
                }
                self.network.structure.remove_edge(state, edge);
                let spliced: Vec<Edge> = self.network.structure.successors(target).to_vec();
                for inner in spliced {
                    self.network.structure.add_edge(state, inner);
                }
            }
        }
    }

    /// Wire skip transitions across word boundaries: every state also sees
    /// the exits one transition ahead, re-routed through a skip-root that
    /// the decoder enters with the skip penalty.
    fn add_cross_word_skips(&mut self) {
        info!("adding cross-word skips");
        let old_count = self.network.state_count();

        for state in 1..old_count {
            let mut skip_exits: BTreeSet<Exit> = BTreeSet::new();
            for edge in self.network.structure.successors(state) {
                if let Edge::State(target) = edge {
                    for second in self.network.structure.successors(*target) {
                        if let Edge::Exit(e) = second {
                            skip_exits.insert(self.network.exit(*e));
                        }
                    }
                }
            }

            for mut exit in skip_exits {
                debug_assert_ne!(exit.pronunciation, crate::types::INVALID_PRONUNCIATION);
                if self.network.structure.descriptor(exit.transit_state).transition_model
                    == ENTRY_SKIP
                {
                    continue;
                }
                exit.transit_state = self.create_skip_root(exit.transit_state);
                let id = self.base.create_exit(&mut self.network, exit);
                self.network.structure.add_exit_edge(state, id);
            }
        }

        info!(
            skip_roots = self.network.state_count() - old_count,
            "added skip-roots"
        );
        self.network.cleanup();
    }

    pub(super) fn create_root(&mut self, left: PhonemeId, right: PhonemeId, depth: i32) -> StateId {
        let key = RootKey::new(left, right, depth);
        if let Some(existing) = self.roots.get(&key) {
            return *existing;
        }

        let state = self
            .base
            .create_state(&mut self.network, StateDescriptor::root());

        if depth == 0 && (left != TERM || right != TERM) {
            self.network.unpushed_coarticulated_root_states.insert(state);
        }
        if right == TERM || !self.acoustic.is_context_dependent(right) {
            self.network.uncoarticulated_word_end_states.insert(state);
        }
        if left != TERM || right != TERM {
            self.network.coarticulated_root_states.insert(state);
        }

        self.roots.insert(key, state);
        self.network.root_transit_descriptions.insert(state, (left, right));
        state
    }

    fn create_skip_root(&mut self, base_root: StateId) -> StateId {
        if let Some(existing) = self.skip_roots.get(&base_root) {
            return *existing;
        }
        let state = self
            .base
            .create_state(&mut self.network, StateDescriptor::skip_root());
        self.skip_roots.insert(base_root, state);
        self.network.structure.add_transition(state, base_root);
        self.skip_root_set.insert(state);
        self.network.coarticulated_root_states.insert(state);
        let transit = self
            .network
            .root_transit_descriptions
            .get(&base_root)
            .copied()
            .unwrap_or((TERM, TERM));
        self.network.root_transit_descriptions.insert(state, transit);
        state
    }

    fn add_exit(
        &mut self,
        predecessor: StateId,
        left: PhonemeId,
        right: PhonemeId,
        depth: i32,
        pronunciation: PronunciationId,
    ) -> ExitId {
        let transit_state = self.create_root(left, right, depth);
        let exit = self.base.create_exit(
            &mut self.network,
            Exit {
                pronunciation,
                transit_state,
            },
        );
        self.network.structure.add_exit_edge(predecessor, exit);
        exit
    }

    /// Expand one phoneme of a pronunciation into the network, reusing
    /// matching successor states where they exist.
    fn extend_phone(
        &mut self,
        mut current: StateId,
        phone_index: usize,
        phones: &[PhonemeId],
        mut left: PhonemeId,
        mut right: PhonemeId,
    ) -> StateId {
        let mut flags = boundary::NONE;
        if phone_index > 0 {
            left = phones[phone_index - 1];
        } else {
            flags |= boundary::INITIAL_PHONE;
        }
        if phone_index + 1 < phones.len() {
            right = phones[phone_index + 1];
        } else {
            flags |= boundary::FINAL_PHONE;
        }

        let hmm = self.hmm_for(left, phones[phone_index], right, flags);
        debug_assert!(!hmm.is_empty());

        let mut hmm_state = 0;
        if phone_index == 1 {
            // The first state of the second phoneme is a suffix joint: the
            // fan-in of coarticulated word starts merges here.
            current = self.extend_body_state(current, left, phones[phone_index], hmm[0]);
            hmm_state = 1;
        }
        for s in hmm_state..hmm.len() {
            current = self.extend_state(current, hmm[s], None);
        }
        current
    }

    fn extend_state(
        &mut self,
        predecessor: StateId,
        desc: StateDescriptor,
        unique_key: Option<RootKey>,
    ) -> StateId {
        for edge in self.network.structure.successors(predecessor) {
            if let Edge::State(target) = edge {
                if self.network.structure.descriptor(*target) == desc {
                    if let Some(key) = unique_key {
                        if self.state_unique_keys.get(target) != Some(&key) {
                            continue;
                        }
                    }
                    return *target;
                }
            }
        }

        let state = self.base.create_state(&mut self.network, desc);
        if let Some(key) = unique_key {
            self.state_unique_keys.insert(state, key);
        }
        self.network.structure.add_transition(predecessor, state);
        state
    }

    fn extend_body_state(
        &mut self,
        state: StateId,
        first: PhonemeId,
        second: PhonemeId,
        desc: StateDescriptor,
    ) -> StateId {
        let key = RootKey::new(first, second, 1);
        let result = self.extend_state(state, desc, Some(key));
        self.initial_phone_suffix
            .entry(key)
            .or_default()
            .insert(Edge::State(result));
        result
    }

    /// Create or reuse a state with exactly this successor set, building
    /// the fan-in backwards from shared suffixes.
    pub(super) fn extend_fan_in(
        &mut self,
        successors: BTreeSet<Edge>,
        desc: StateDescriptor,
    ) -> StateId {
        let pred = StatePredecessor {
            successors,
            descriptor: desc,
            word_end: false,
        };
        if let Some(existing) = self.predecessors.get(&pred) {
            return *existing;
        }
        let state = self.base.create_state(&mut self.network, desc);
        for edge in &pred.successors {
            self.network.structure.add_edge(state, *edge);
        }
        self.predecessors.insert(pred, state);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acoustic::ContextTable;
    use crate::lexicon::MemoryLexicon;

    fn options() -> MinimizedBuilderOptions {
        MinimizedBuilderOptions {
            minimization_iterations: 0,
            ..MinimizedBuilderOptions::default()
        }
    }

    #[test]
    fn builds_despite_missing_ci_boundary_phonemes() {
        // Both phones context dependent; the build warns but completes.
        let acoustic = ContextTable::new(3);
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1, 2]);

        let mut builder = MinimizedTreeBuilder::new(&lexicon, &acoustic, options());
        builder.build().unwrap();
        assert!(builder.network().state_count() > 1);
    }

    #[test]
    fn body_shares_word_prefixes() {
        let acoustic = ContextTable::new(5).context_independent(4).with_silence(4);
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1, 2, 3]); // k ae t
        lexicon.add(&[1, 2]); // k ae
        lexicon.add_special("silence", &[4]);

        let mut builder = MinimizedTreeBuilder::new(&lexicon, &acoustic, options());
        builder.build().unwrap();
        let network = builder.network();

        // The root fans out into at most one chain per distinct first
        // descriptor; both words start with the same "k" allophone.
        let root_successors: Vec<StateId> = network
            .structure
            .successors(network.root_state)
            .iter()
            .filter_map(|e| e.as_state())
            .collect();
        let first_descs: BTreeSet<StateDescriptor> = root_successors
            .iter()
            .map(|s| network.structure.descriptor(*s))
            .collect();
        assert_eq!(first_descs.len(), root_successors.len());
    }

    #[test]
    fn roots_and_exits_deduplicate_by_value() {
        let acoustic = ContextTable::new(3).context_independent(3).with_silence(3);
        let lexicon = MemoryLexicon::new();
        let mut builder = MinimizedTreeBuilder::new(&lexicon, &acoustic, options());

        let root = builder.create_root(1, 2, 0);
        assert_eq!(builder.create_root(1, 2, 0), root);
        assert_ne!(builder.create_root(1, 2, -1), root);
        assert_ne!(builder.create_root(2, 1, 0), root);

        let exit = builder.base.create_exit(
            &mut builder.network,
            Exit {
                pronunciation: 0,
                transit_state: root,
            },
        );
        assert_eq!(
            builder.base.create_exit(
                &mut builder.network,
                Exit {
                    pronunciation: 0,
                    transit_state: root,
                },
            ),
            exit
        );
        assert_ne!(
            builder.base.create_exit(
                &mut builder.network,
                Exit {
                    pronunciation: 1,
                    transit_state: root,
                },
            ),
            exit
        );
        assert_eq!(builder.network.exits.len(), 2);
    }

    #[test]
    fn zero_length_pronunciations_are_skipped() {
        let acoustic = ContextTable::new(3).all_context_independent().with_silence(2);
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[]);
        lexicon.add(&[1]);
        lexicon.add_special("silence", &[2]);

        let mut builder = MinimizedTreeBuilder::new(&lexicon, &acoustic, options());
        builder.build().unwrap();
        assert!(builder.network().state_count() > 1);
    }
}
