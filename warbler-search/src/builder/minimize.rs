//! Determinization and minimization of the built network
//!
//! Determinization joins sibling successors carrying the same descriptor;
//! minimization joins states with identical successor sets, walking from
//! the roots and hash-consing through `predecessors`. Both passes produce
//! old-to-new maps that are composed with the structure cleanup so the
//! builder's hashes stay usable across iterations.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::acoustic::StateDescriptor;
use crate::graph::{Edge, Exit};
use crate::types::{ExitId, StateId, TERM};

use super::minimized::{MinimizedTreeBuilder, SuffixMap};
use super::StatePredecessor;

/// Per-node progress of the backward minimization walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done(StateId),
}

impl<'a> MinimizedTreeBuilder<'a> {
    /// Run one determinize/minimize pass. Returns the map from old state
    /// ids to new ones; zero marks a state that did not survive.
    pub fn minimize(
        &mut self,
        force_determinization: bool,
        only_minimize_backwards: bool,
    ) -> Vec<StateId> {
        info!(force_determinization, "minimizing");

        let count = self.network.state_count() as usize;
        let mut fan_in: Vec<u32> = vec![0; count];
        let mut used_roots: BTreeSet<StateId> = BTreeSet::new();
        let mut active: VecDeque<StateId> = VecDeque::new();

        // Depth-0 roots stay alive even when nothing points at them yet.
        let useful_roots: BTreeSet<StateId> = self
            .roots
            .iter()
            .filter(|(key, _)| key.depth == 0)
            .map(|(_, state)| *state)
            .collect();

        for state in 1..count as StateId {
            active.push_back(state);
            for edge in self.network.structure.successors(state) {
                match edge {
                    Edge::Exit(e) => {
                        let transit = self.network.exits[*e as usize].transit_state;
                        used_roots.insert(transit);
                        fan_in[transit as usize] += 1;
                    }
                    Edge::State(t) => fan_in[*t as usize] += 1,
                }
            }
        }

        // Prune coarticulated roots no exit routes through.
        let old_roots = self.network.coarticulated_root_states.clone();
        for root in &old_roots {
            if !used_roots.contains(root) && !useful_roots.contains(root) {
                self.network.coarticulated_root_states.remove(root);
                self.network.root_transit_descriptions.remove(root);
                self.network.unpushed_coarticulated_root_states.remove(root);
                self.network.structure.clear_output_edges(*root);
            }
        }
        debug!(
            kept = self.network.coarticulated_root_states.len(),
            total = old_roots.len(),
            "pruned unused roots"
        );

        let mut determinize_map: Vec<StateId> = vec![0; count];
        let mut clashes = 0u32;

        if only_minimize_backwards {
            debug!("skipping determinization");
            for (state, entry) in determinize_map.iter_mut().enumerate() {
                *entry = state as StateId;
            }
        } else {
            while let Some(state) = active.pop_front() {
                let mut groups: BTreeMap<StateDescriptor, Vec<StateId>> = BTreeMap::new();
                for edge in self.network.structure.successors(state) {
                    if let Edge::State(t) = edge {
                        let mergeable = force_determinization
                            || fan_in.get(*t as usize).copied().unwrap_or(0) == 1;
                        if mergeable {
                            groups
                                .entry(self.network.structure.descriptor(*t))
                                .or_default()
                                .push(*t);
                        }
                    }
                }

                for (desc, members) in groups {
                    if members.len() < 2 {
                        continue;
                    }
                    let joined = self.network.structure.allocate_state(desc);
                    if joined as usize >= determinize_map.len() {
                        determinize_map.resize(joined as usize + 1, 0);
                    }
                    if self
                        .network
                        .uncoarticulated_word_end_states
                        .contains(&members[0])
                    {
                        self.network.uncoarticulated_word_end_states.insert(joined);
                    }
                    for &member in &members {
                        if self.opts.force_exact_word_ends
                            && self
                                .network
                                .uncoarticulated_word_end_states
                                .contains(&member)
                        {
                            self.network.uncoarticulated_word_end_states.insert(joined);
                        }
                        if determinize_map[member as usize] != 0 {
                            clashes += 1;
                        }
                        determinize_map[member as usize] = joined;
                        let moved: Vec<Edge> =
                            self.network.structure.successors(member).to_vec();
                        for edge in moved {
                            self.network.structure.add_edge(joined, edge);
                        }
                        self.network.structure.remove_edge(state, Edge::State(member));
                    }
                    self.network.structure.add_transition(state, joined);
                    active.push_back(joined);
                }
            }
            debug!(clashes, "determinized");
        }

        // Backward minimization hash-conses from the roots; the fan-in era
        // predecessor hash is parked and restored afterwards.
        let old_predecessors = std::mem::take(&mut self.predecessors);

        let mut marks: Vec<Mark> = vec![Mark::Unvisited; self.network.state_count() as usize];
        self.minimize_state(self.network.root_state, &mut marks);
        for root in self.network.coarticulated_root_states.clone() {
            self.minimize_state(root, &mut marks);
        }
        for root in self.skip_root_set.clone() {
            self.minimize_state(root, &mut marks);
        }
        for root in &useful_roots {
            let start = determinize_map
                .get(*root as usize)
                .copied()
                .filter(|m| *m != 0)
                .unwrap_or(*root);
            self.minimize_state(start, &mut marks);
        }
        let minimize_map: Vec<StateId> = marks
            .iter()
            .map(|mark| match mark {
                Mark::Done(id) => *id,
                Mark::Unvisited | Mark::InProgress => 0,
            })
            .collect();
        debug_assert_eq!(
            minimize_map[self.network.root_state as usize],
            self.network.root_state
        );

        let mut minimize_exits_map: Vec<ExitId> = Vec::new();
        if !self.opts.keep_roots {
            // Re-deduplicate the exit table under the minimized transit
            // states, then join per-pronunciation exits at each state.
            let old_exits = std::mem::take(&mut self.network.exits);
            self.base.rebuild_exit_hash(&self.network);
            minimize_exits_map.reserve(old_exits.len());
            for exit in &old_exits {
                let remapped = Exit {
                    pronunciation: exit.pronunciation,
                    transit_state: minimize_map[exit.transit_state as usize],
                };
                minimize_exits_map.push(self.base.create_exit(&mut self.network, remapped));
            }

            let old_count = self.network.state_count();
            for state in 1..old_count {
                if minimize_map
                    .get(state as usize)
                    .is_some_and(|m| *m == state)
                {
                    self.minimize_exits(state, &minimize_exits_map);
                } else {
                    self.network.structure.clear_output_edges(state);
                }
            }
        }

        let map_state = |map: &Vec<StateId>, s: StateId| -> StateId {
            map.get(s as usize).copied().unwrap_or(s)
        };
        self.network.root_state = map_state(&minimize_map, self.network.root_state);
        self.network.ci_root_state = self.network.root_state;

        Self::map_set(
            &mut self.network.coarticulated_root_states,
            &minimize_map,
            true,
        );
        Self::map_set(
            &mut self.network.unpushed_coarticulated_root_states,
            &minimize_map,
            true,
        );
        let mut skip_roots = std::mem::take(&mut self.skip_root_set);
        Self::map_set(&mut skip_roots, &minimize_map, true);
        self.skip_root_set = skip_roots;
        let force_word_ends = self.opts.force_exact_word_ends;
        Self::map_set(
            &mut self.network.uncoarticulated_word_end_states,
            &minimize_map,
            force_word_ends,
        );

        // Carry the transit contexts over to the surviving roots. A root
        // merged into the main root loses its coarticulation entirely.
        let old_transits = std::mem::take(&mut self.network.root_transit_descriptions);
        for (orig, transit) in old_transits {
            if orig == self.network.root_state || orig as usize >= minimize_map.len() {
                if orig == self.network.root_state
                    || self.network.coarticulated_root_states.contains(&orig)
                {
                    self.network.root_transit_descriptions.insert(orig, transit);
                }
                continue;
            }
            let mapped = minimize_map[orig as usize];
            if mapped == 0 {
                continue;
            }
            if mapped == self.network.root_state {
                self.network.coarticulated_root_states.remove(&mapped);
                self.network.unpushed_coarticulated_root_states.remove(&mapped);
                continue;
            }
            self.network.root_transit_descriptions.insert(mapped, transit);
        }

        // Compose determinization and minimization into one map.
        for (state, entry) in determinize_map.iter_mut().enumerate() {
            if *entry != 0 {
                *entry = map_state(&minimize_map, *entry);
            } else {
                *entry = map_state(&minimize_map, state as StateId);
            }
        }
        let mut minimize_map = determinize_map;

        // The cleanup renumbers both states and exits; fold its maps in.
        let cleanup = self.network.cleanup();
        let mut kept = 0u32;
        let mut lost = 0u32;
        for entry in minimize_map.iter_mut() {
            if *entry == 0 {
                continue;
            }
            match cleanup.state_map.get(entry) {
                Some(new) => {
                    *entry = *new;
                    kept += 1;
                }
                None => {
                    *entry = 0;
                    lost += 1;
                }
            }
        }
        debug!(kept, lost, "composed cleanup into state map");

        let final_exit_map: FxHashMap<ExitId, ExitId> = if minimize_exits_map.is_empty() {
            cleanup.exit_map.clone()
        } else {
            minimize_exits_map
                .iter()
                .enumerate()
                .filter_map(|(old, joined)| {
                    cleanup.exit_map.get(joined).map(|new| (old as ExitId, *new))
                })
                .collect()
        };

        self.predecessors = old_predecessors;
        self.update_hashes_from_map(&minimize_map, &final_exit_map);

        self.network.log_stats("after minimization");
        minimize_map
    }

    /// Depth-first hash-consing. Successors still on the recursion stack
    /// keep their original id in the key, which tolerates cycles at the
    /// cost of not merging through them.
    fn minimize_state(&mut self, state: StateId, marks: &mut Vec<Mark>) {
        if marks[state as usize] != Mark::Unvisited {
            return;
        }
        marks[state as usize] = Mark::InProgress;

        let mut successors: BTreeSet<Edge> = BTreeSet::new();
        let edges: Vec<Edge> = self.network.structure.successors(state).to_vec();
        for edge in edges {
            match edge {
                Edge::Exit(_) => {
                    successors.insert(edge);
                }
                Edge::State(target) => {
                    self.minimize_state(target, marks);
                    match marks[target as usize] {
                        Mark::InProgress => {
                            successors.insert(Edge::State(target));
                        }
                        Mark::Done(mapped) => {
                            successors.insert(Edge::State(mapped));
                        }
                        Mark::Unvisited => debug_assert!(false, "successor left unvisited"),
                    }
                }
            }
        }

        self.network.structure.clear_output_edges(state);

        let pred = StatePredecessor {
            successors,
            descriptor: self.network.structure.descriptor(state),
            word_end: self.opts.force_exact_word_ends
                && self.network.uncoarticulated_word_end_states.contains(&state),
        };
        if let Some(existing) = self.predecessors.get(&pred) {
            marks[state as usize] = Mark::Done(*existing);
        } else {
            marks[state as usize] = Mark::Done(state);
            for edge in &pred.successors {
                self.network.structure.add_edge(state, *edge);
            }
            self.predecessors.insert(pred, state);
        }
    }

    /// Join multiple exits for the same pronunciation at one state into a
    /// single exit whose transit root unions the original continuations.
    fn minimize_exits(&mut self, state: StateId, minimize_exits_map: &[ExitId]) {
        let mut exits_by_pron: BTreeMap<crate::types::PronunciationId, Vec<ExitId>> =
            BTreeMap::new();
        let mut successor_states: BTreeSet<StateId> = BTreeSet::new();
        for edge in self.network.structure.successors(state) {
            match edge {
                Edge::Exit(e) => {
                    let joined = minimize_exits_map[*e as usize];
                    exits_by_pron
                        .entry(self.network.exits[joined as usize].pronunciation)
                        .or_default()
                        .push(joined);
                }
                Edge::State(t) => {
                    successor_states.insert(*t);
                }
            }
        }
        if exits_by_pron.is_empty() {
            return;
        }

        self.network.structure.clear_output_edges(state);
        for successor in successor_states {
            self.network.structure.add_transition(state, successor);
        }

        for (pronunciation, exits) in exits_by_pron {
            if exits.len() == 1 {
                self.network.structure.add_exit_edge(state, exits[0]);
                continue;
            }

            let mut root_successors: BTreeSet<Edge> = BTreeSet::new();
            let mut lefts: BTreeSet<crate::types::PhonemeId> = BTreeSet::new();
            let mut rights: BTreeSet<crate::types::PhonemeId> = BTreeSet::new();
            for &exit in &exits {
                let transit = self.network.exits[exit as usize].transit_state;
                root_successors.extend(self.network.structure.successors(transit).iter().copied());
                let (left, right) = self
                    .network
                    .root_transit_descriptions
                    .get(&transit)
                    .copied()
                    .unwrap_or((TERM, TERM));
                lefts.insert(left);
                rights.insert(right);
            }

            let new_state_limit = self.network.state_count();
            let transit_state = self.extend_fan_in(root_successors, StateDescriptor::root());
            let joined = self.base.create_exit(
                &mut self.network,
                Exit {
                    pronunciation,
                    transit_state,
                },
            );
            self.network.structure.add_exit_edge(state, joined);

            if transit_state >= new_state_limit {
                self.network.coarticulated_root_states.insert(transit_state);
                let left = if lefts.len() == 1 {
                    *lefts.iter().next().unwrap_or(&TERM)
                } else {
                    TERM
                };
                let right = if rights.len() == 1 {
                    *rights.iter().next().unwrap_or(&TERM)
                } else {
                    TERM
                };
                self.network
                    .root_transit_descriptions
                    .insert(transit_state, (left, right));
                for &exit in &exits {
                    let old_transit = self.network.exits[exit as usize].transit_state;
                    if self
                        .network
                        .unpushed_coarticulated_root_states
                        .contains(&old_transit)
                    {
                        self.network
                            .unpushed_coarticulated_root_states
                            .insert(transit_state);
                    }
                    if self
                        .network
                        .uncoarticulated_word_end_states
                        .contains(&old_transit)
                    {
                        self.network
                            .uncoarticulated_word_end_states
                            .insert(transit_state);
                    }
                }
            }
        }
    }

    fn map_set(set: &mut BTreeSet<StateId>, map: &[StateId], force: bool) {
        let old = std::mem::take(set);
        for state in old {
            match map.get(state as usize) {
                None => {
                    set.insert(state);
                }
                Some(0) => {
                    debug_assert!(!force, "a protected state was dropped by minimization");
                }
                Some(mapped) => {
                    set.insert(*mapped);
                }
            }
        }
    }

    fn map_suffix_edges(
        edges: &BTreeSet<Edge>,
        map: &[StateId],
        exit_map: &FxHashMap<ExitId, ExitId>,
    ) -> BTreeSet<Edge> {
        let mut mapped = BTreeSet::new();
        for edge in edges {
            match edge {
                Edge::Exit(e) => {
                    if let Some(new) = exit_map.get(e) {
                        mapped.insert(Edge::Exit(*new));
                    }
                }
                Edge::State(s) => {
                    match map.get(*s as usize) {
                        Some(0) => {}
                        Some(new) => {
                            mapped.insert(Edge::State(*new));
                        }
                        None => {
                            mapped.insert(Edge::State(*s));
                        }
                    }
                }
            }
        }
        mapped
    }

    fn map_suffix_hash(
        hash: &mut SuffixMap,
        map: &[StateId],
        exit_map: &FxHashMap<ExitId, ExitId>,
    ) {
        let old = std::mem::take(hash);
        for (key, edges) in old {
            let mapped = Self::map_suffix_edges(&edges, map, exit_map);
            if !mapped.is_empty() {
                hash.insert(key, mapped);
            }
        }
    }

    /// Rewrite every builder hash through the given state and exit maps so
    /// that incremental extension and further minimization passes keep
    /// working on the renumbered network.
    fn update_hashes_from_map(&mut self, map: &[StateId], exit_map: &FxHashMap<ExitId, ExitId>) {
        let old_keys = std::mem::take(&mut self.state_unique_keys);
        for (state, key) in old_keys {
            match map.get(state as usize) {
                Some(0) | None => {}
                Some(new) => {
                    self.state_unique_keys.insert(*new, key);
                }
            }
        }

        Self::map_suffix_hash(&mut self.initial_phone_suffix, map, exit_map);
        Self::map_suffix_hash(&mut self.initial_final_phone_suffix, map, exit_map);

        let old_roots = std::mem::take(&mut self.roots);
        for (key, state) in old_roots {
            match map.get(state as usize) {
                Some(0) | None => {}
                Some(new) => {
                    self.roots.insert(key, *new);
                }
            }
        }

        self.base.rebuild_exit_hash(&self.network);

        let old_predecessors = std::mem::take(&mut self.predecessors);
        for (pred, state) in old_predecessors {
            let mapped_state = match map.get(state as usize) {
                Some(0) | None => continue,
                Some(new) => *new,
            };
            let successors = Self::map_suffix_edges(&pred.successors, map, exit_map);
            if successors.is_empty() {
                continue;
            }
            self.predecessors.insert(
                StatePredecessor {
                    successors,
                    descriptor: pred.descriptor,
                    word_end: pred.word_end,
                },
                mapped_state,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acoustic::ContextTable;
    use crate::builder::{MinimizedBuilderOptions, TreeBuilder};
    use crate::lexicon::MemoryLexicon;

    fn build_with_iterations(iterations: u32) -> (u32, u32) {
        let acoustic = ContextTable::new(6).context_independent(5).with_silence(5);
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1, 2, 3]);
        lexicon.add(&[1, 2, 4]);
        lexicon.add(&[2, 3]);
        lexicon.add_special("silence", &[5]);

        let opts = MinimizedBuilderOptions {
            minimization_iterations: iterations,
            ..MinimizedBuilderOptions::default()
        };
        let mut builder = MinimizedTreeBuilder::new(&lexicon, &acoustic, opts);
        builder.build().unwrap();
        let network = builder.network();
        (network.state_count(), network.exits.len() as u32)
    }

    #[test]
    fn minimization_shrinks_monotonically() {
        let (states0, exits0) = build_with_iterations(0);
        let (states1, exits1) = build_with_iterations(1);
        let (states2, exits2) = build_with_iterations(2);

        assert!(states1 <= states0);
        assert!(states2 <= states1);
        assert!(exits1 <= exits0);
        assert!(exits2 <= exits1);
    }

    #[test]
    fn minimization_reaches_a_fixpoint() {
        let (states2, exits2) = build_with_iterations(2);
        let (states3, exits3) = build_with_iterations(3);
        assert_eq!(states2, states3);
        assert_eq!(exits2, exits3);
    }

    #[test]
    fn root_survives_minimization_unmapped() {
        let acoustic = ContextTable::new(4).all_context_independent().with_silence(3);
        let mut lexicon = MemoryLexicon::new();
        lexicon.add(&[1, 2]);
        lexicon.add_special("silence", &[3]);

        let mut builder = MinimizedTreeBuilder::new(
            &lexicon,
            &acoustic,
            MinimizedBuilderOptions::default(),
        );
        builder.build().unwrap();
        let network = builder.network();
        assert_ne!(network.root_state, crate::types::INVALID_STATE);
        assert_eq!(network.root_state, network.ci_root_state);
    }
}
