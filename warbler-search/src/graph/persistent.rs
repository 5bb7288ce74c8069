//! Persistent search network
//!
//! Wraps the raw state arena with everything a decoder needs to interpret
//! it: the exit table, the distinguished root states, and the transit
//! context recorded for each coarticulated root.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;

use crate::types::{ExitId, PhonemeId, PronunciationId, StateId, INVALID_STATE};

use super::network::{CleanupResult, Edge, StateNetwork};

/// A word exit: which pronunciation ends here and where decoding continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Exit {
    pub pronunciation: PronunciationId,
    pub transit_state: StateId,
}

/// Result of [`SearchNetwork::cleanup`]: old-to-new maps for states and
/// exits. Exit ids change because the exit table is deduplicated and
/// compacted to the referenced entries.
#[derive(Debug, Default)]
pub struct NetworkCleanupResult {
    pub state_map: FxHashMap<StateId, StateId>,
    pub exit_map: FxHashMap<ExitId, ExitId>,
}

/// The compiled search network in its mutable, build-time form.
#[derive(Debug)]
pub struct SearchNetwork {
    pub structure: StateNetwork,
    pub exits: Vec<Exit>,
    /// Root for word starts after a context-independent phoneme (and the
    /// overall start of decoding).
    pub root_state: StateId,
    /// Root used for exits of context-independent words.
    pub ci_root_state: StateId,
    pub coarticulated_root_states: BTreeSet<StateId>,
    pub unpushed_coarticulated_root_states: BTreeSet<StateId>,
    pub other_root_states: BTreeSet<StateId>,
    pub uncoarticulated_word_end_states: BTreeSet<StateId>,
    /// (left, right) phoneme context carried across each coarticulated root.
    pub root_transit_descriptions: BTreeMap<StateId, (PhonemeId, PhonemeId)>,
}

impl SearchNetwork {
    pub fn new() -> Self {
        SearchNetwork {
            structure: StateNetwork::new(),
            exits: Vec::new(),
            root_state: INVALID_STATE,
            ci_root_state: INVALID_STATE,
            coarticulated_root_states: BTreeSet::new(),
            unpushed_coarticulated_root_states: BTreeSet::new(),
            other_root_states: BTreeSet::new(),
            uncoarticulated_word_end_states: BTreeSet::new(),
            root_transit_descriptions: BTreeMap::new(),
        }
    }

    pub fn is_root(&self, state: StateId) -> bool {
        state == self.root_state
            || state == self.ci_root_state
            || self.coarticulated_root_states.contains(&state)
            || self.other_root_states.contains(&state)
    }

    pub fn state_count(&self) -> u32 {
        self.structure.state_count()
    }

    pub fn exit(&self, id: ExitId) -> Exit {
        self.exits[id as usize]
    }

    /// All states decoding may start from or continue at: the roots plus
    /// every exit's transit state.
    fn start_states(&self) -> Vec<StateId> {
        let mut start: BTreeSet<StateId> = BTreeSet::new();
        start.insert(self.root_state);
        start.insert(self.ci_root_state);
        start.extend(self.coarticulated_root_states.iter().copied());
        start.extend(self.other_root_states.iter().copied());
        for exit in &self.exits {
            start.insert(exit.transit_state);
        }
        start.remove(&INVALID_STATE);
        start.into_iter().collect()
    }

    /// Garbage-collect the structure, renumber states, and compact the exit
    /// table to the deduplicated entries still referenced by some edge.
    pub fn cleanup(&mut self) -> NetworkCleanupResult {
        let start = self.start_states();
        let CleanupResult { state_map } = self.structure.cleanup(&start);

        // Remap transit states, deduplicate, and keep only referenced exits.
        let mut referenced: BTreeSet<ExitId> = BTreeSet::new();
        for state in 1..self.structure.state_count() {
            for edge in self.structure.successors(state) {
                if let Edge::Exit(e) = edge {
                    referenced.insert(*e);
                }
            }
        }

        let mut exit_map: FxHashMap<ExitId, ExitId> = FxHashMap::default();
        let mut new_exits: Vec<Exit> = Vec::new();
        let mut dedup: FxHashMap<Exit, ExitId> = FxHashMap::default();
        for (old_id, exit) in self.exits.iter().enumerate() {
            let old_id = old_id as ExitId;
            if !referenced.contains(&old_id) {
                continue;
            }
            let remapped = Exit {
                pronunciation: exit.pronunciation,
                transit_state: state_map[&exit.transit_state],
            };
            let new_id = *dedup.entry(remapped).or_insert_with(|| {
                new_exits.push(remapped);
                (new_exits.len() - 1) as ExitId
            });
            exit_map.insert(old_id, new_id);
        }
        self.exits = new_exits;

        // Rewrite exit edges with the compacted ids.
        for state in 1..self.structure.state_count() {
            let edges: Vec<Edge> = self.structure.successors(state).to_vec();
            for edge in edges {
                if let Edge::Exit(e) = edge {
                    let new = exit_map[&e];
                    if new != e {
                        self.structure.remove_edge(state, edge);
                        self.structure.add_exit_edge(state, new);
                    }
                }
            }
        }

        // Map the distinguished states and sets.
        let map = |s: StateId| state_map.get(&s).copied().unwrap_or(INVALID_STATE);
        self.root_state = map(self.root_state);
        self.ci_root_state = map(self.ci_root_state);
        let map_set = |set: &BTreeSet<StateId>| -> BTreeSet<StateId> {
            set.iter()
                .filter_map(|s| state_map.get(s).copied())
                .collect()
        };
        self.coarticulated_root_states = map_set(&self.coarticulated_root_states);
        self.unpushed_coarticulated_root_states = map_set(&self.unpushed_coarticulated_root_states);
        self.other_root_states = map_set(&self.other_root_states);
        self.uncoarticulated_word_end_states = map_set(&self.uncoarticulated_word_end_states);
        self.root_transit_descriptions = self
            .root_transit_descriptions
            .iter()
            .filter_map(|(s, d)| state_map.get(s).map(|n| (*n, *d)))
            .collect();

        NetworkCleanupResult {
            state_map,
            exit_map,
        }
    }

    pub fn log_stats(&self, occasion: &str) {
        let word_ends = &self.uncoarticulated_word_end_states;
        let root_overlap = word_ends
            .iter()
            .filter(|s| self.is_root(**s))
            .count();
        tracing::info!(
            occasion,
            states = self.state_count().saturating_sub(1),
            exits = self.exits.len(),
            coarticulated_roots = self.coarticulated_root_states.len(),
            unpushed_roots = self.unpushed_coarticulated_root_states.len(),
            uncoarticulated_word_ends = word_ends.len(),
            word_ends_that_are_roots = root_overlap,
            "network statistics"
        );
    }
}

impl Default for SearchNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acoustic::StateDescriptor;

    #[test]
    fn cleanup_deduplicates_and_compacts_exits() {
        let mut net = SearchNetwork::new();
        let root = net.structure.allocate_state(StateDescriptor::root());
        net.root_state = root;
        net.ci_root_state = root;
        let a = net.structure.allocate_state(StateDescriptor {
            emission: 1,
            transition_model: 2,
        });
        let b = net.structure.allocate_state(StateDescriptor {
            emission: 2,
            transition_model: 2,
        });
        net.structure.add_transition(root, a);
        net.structure.add_transition(root, b);

        // Three exit entries, two of which are equal after remapping and
        // one of which is never referenced.
        net.exits.push(Exit {
            pronunciation: 7,
            transit_state: root,
        });
        net.exits.push(Exit {
            pronunciation: 7,
            transit_state: root,
        });
        net.exits.push(Exit {
            pronunciation: 9,
            transit_state: root,
        });
        net.structure.add_exit_edge(a, 0);
        net.structure.add_exit_edge(b, 1);

        let result = net.cleanup();
        assert_eq!(net.exits.len(), 1);
        assert_eq!(result.exit_map[&0], result.exit_map[&1]);
        assert!(!result.exit_map.contains_key(&2));
        assert_eq!(net.exits[0].pronunciation, 7);
        assert_eq!(net.exits[0].transit_state, net.root_state);
    }
}
