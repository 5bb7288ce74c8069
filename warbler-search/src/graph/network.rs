//! State arena and successor edges
//!
//! States live in a growable vector addressed by `StateId`; id 0 is a
//! reserved dummy so that 0 can serve as "invalid" everywhere. Successor
//! edges share one namespace via the `Edge` union: either a plain transition
//! to another state or a word-exit label.

use rustc_hash::FxHashMap;

use crate::acoustic::StateDescriptor;
use crate::types::{ExitId, StateId};

/// A successor edge: a transition into another state, or a word exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Edge {
    State(StateId),
    Exit(ExitId),
}

impl Edge {
    pub fn as_state(&self) -> Option<StateId> {
        match self {
            Edge::State(s) => Some(*s),
            Edge::Exit(_) => None,
        }
    }

    pub fn as_exit(&self) -> Option<ExitId> {
        match self {
            Edge::State(_) => None,
            Edge::Exit(e) => Some(*e),
        }
    }
}

#[derive(Debug, Clone)]
struct State {
    descriptor: StateDescriptor,
    successors: Vec<Edge>,
}

/// Result of a `cleanup` pass: surviving states keyed by their old id.
/// Ids absent from the map are gone; holders must remap or drop them.
#[derive(Debug, Default)]
pub struct CleanupResult {
    pub state_map: FxHashMap<StateId, StateId>,
}

/// The mutable state graph used during construction.
#[derive(Debug)]
pub struct StateNetwork {
    states: Vec<State>,
}

impl StateNetwork {
    pub fn new() -> Self {
        // Index 0 is reserved as invalid.
        StateNetwork {
            states: vec![State {
                descriptor: StateDescriptor::root(),
                successors: Vec::new(),
            }],
        }
    }

    /// Number of arena slots, including the reserved slot 0.
    pub fn state_count(&self) -> u32 {
        self.states.len() as u32
    }

    pub fn allocate_state(&mut self, descriptor: StateDescriptor) -> StateId {
        let id = self.states.len() as StateId;
        self.states.push(State {
            descriptor,
            successors: Vec::new(),
        });
        id
    }

    pub fn descriptor(&self, state: StateId) -> StateDescriptor {
        self.states[state as usize].descriptor
    }

    pub fn successors(&self, state: StateId) -> &[Edge] {
        &self.states[state as usize].successors
    }

    /// Add an edge unless it is already present. Returns whether it was new.
    pub fn add_edge(&mut self, from: StateId, edge: Edge) -> bool {
        let successors = &mut self.states[from as usize].successors;
        if successors.contains(&edge) {
            return false;
        }
        successors.push(edge);
        true
    }

    /// Add a state transition (idempotent).
    pub fn add_transition(&mut self, from: StateId, to: StateId) -> bool {
        self.add_edge(from, Edge::State(to))
    }

    /// Add an exit label (idempotent).
    pub fn add_exit_edge(&mut self, from: StateId, exit: ExitId) -> bool {
        self.add_edge(from, Edge::Exit(exit))
    }

    pub fn remove_edge(&mut self, from: StateId, edge: Edge) {
        self.states[from as usize].successors.retain(|e| *e != edge);
    }

    pub fn clear_output_edges(&mut self, state: StateId) {
        self.states[state as usize].successors.clear();
    }

    /// Number of exits reachable from `state`, memoized. Cycles contribute
    /// zero to their own strongly connected component, matching the
    /// intention that a loop with no exit below it is a dead end.
    fn count_reachable_exits(&self, counts: &mut Vec<Option<u32>>, state: StateId) -> u32 {
        if let Some(count) = counts[state as usize] {
            return count;
        }
        counts[state as usize] = Some(0);
        let mut count = 0;
        for edge in self.states[state as usize].successors.clone() {
            match edge {
                Edge::Exit(_) => count += 1,
                Edge::State(t) => count += self.count_reachable_exits(counts, t),
            }
        }
        counts[state as usize] = Some(count);
        count
    }

    /// Garbage-collect unreachable states and compact ids.
    ///
    /// States from which no exit is reachable are cleared first, then edges
    /// into now-empty states are dropped, then everything not reachable from
    /// `start_states` is discarded and the survivors are renumbered in
    /// ascending old-id order. All previously held `StateId`s not present in
    /// the returned map are invalid afterwards.
    pub fn cleanup(&mut self, start_states: &[StateId]) -> CleanupResult {
        let n = self.states.len();

        // Clear dead ends.
        let mut counts: Vec<Option<u32>> = vec![None; n];
        let mut dead_ends = 0u32;
        for state in 1..n as StateId {
            if self.count_reachable_exits(&mut counts, state) == 0 {
                self.clear_output_edges(state);
                dead_ends += 1;
            }
        }

        // Drop edges into states that lost all their successors, repeating
        // until the removal no longer uncovers new empty states.
        let mut cleared = 0u32;
        loop {
            let mut changed = false;
            for state in 1..n {
                let empty: Vec<Edge> = self.states[state]
                    .successors
                    .iter()
                    .copied()
                    .filter(|e| match e {
                        Edge::State(t) => self.states[*t as usize].successors.is_empty(),
                        Edge::Exit(_) => false,
                    })
                    .collect();
                for edge in empty {
                    self.states[state].successors.retain(|e| *e != edge);
                    cleared += 1;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        tracing::debug!(dead_ends, cleared, "cleared dead-end states");

        // Mark everything reachable from the start states.
        let mut reachable = vec![false; n];
        let mut stack: Vec<StateId> = Vec::new();
        for &start in start_states {
            if !reachable[start as usize] {
                reachable[start as usize] = true;
                stack.push(start);
            }
        }
        while let Some(state) = stack.pop() {
            for edge in &self.states[state as usize].successors {
                if let Edge::State(t) = edge {
                    if !reachable[*t as usize] {
                        reachable[*t as usize] = true;
                        stack.push(*t);
                    }
                }
            }
        }

        // Renumber survivors in stable ascending order and rebuild the arena.
        let mut result = CleanupResult::default();
        let mut new_states = vec![State {
            descriptor: StateDescriptor::root(),
            successors: Vec::new(),
        }];
        for state in 1..n as StateId {
            if reachable[state as usize] {
                result
                    .state_map
                    .insert(state, new_states.len() as StateId);
                new_states.push(self.states[state as usize].clone());
            }
        }
        for state in new_states.iter_mut().skip(1) {
            for edge in state.successors.iter_mut() {
                if let Edge::State(t) = edge {
                    *t = *result
                        .state_map
                        .get(t)
                        .expect("edge into a state that was collected");
                }
            }
        }

        tracing::debug!(
            before = n,
            after = new_states.len(),
            "compacted state arena"
        );
        self.states = new_states;
        result
    }
}

impl Default for StateNetwork {
    fn default() -> Self {
        Self::new()
    }
}
