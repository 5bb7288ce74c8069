//! Frozen search network
//!
//! Compressed sparse-row form of a finished [`SearchNetwork`]. All edges
//! live in one flat array indexed by per-state offsets, so the decoder's
//! inner loop touches contiguous memory and never follows a `Vec` per
//! state.

use serde::{Deserialize, Serialize};

use crate::acoustic::StateDescriptor;
use crate::types::{ExitId, StateId};

use super::network::Edge;
use super::persistent::{Exit, SearchNetwork};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NetworkStats {
    pub states: u32,
    pub edges: u32,
    pub exits: u32,
    pub roots: u32,
}

/// Read-only compiled network.
#[derive(Debug)]
pub struct CompactNetwork {
    offsets: Vec<u32>,
    edges: Vec<Edge>,
    descriptors: Vec<StateDescriptor>,
    exits: Vec<Exit>,
    root_state: StateId,
    non_scoring: Vec<bool>,
    stats: NetworkStats,
}

impl CompactNetwork {
    pub fn from_network(network: &SearchNetwork) -> Self {
        let n = network.structure.state_count() as usize;
        let mut offsets = Vec::with_capacity(n + 1);
        let mut edges = Vec::new();
        let mut descriptors = Vec::with_capacity(n);
        let mut non_scoring = Vec::with_capacity(n);

        for state in 0..n as StateId {
            offsets.push(edges.len() as u32);
            edges.extend_from_slice(network.structure.successors(state));
            let desc = network.structure.descriptor(state);
            descriptors.push(desc);
            non_scoring.push(desc.is_non_scoring());
        }
        offsets.push(edges.len() as u32);

        let roots = 1 + network.coarticulated_root_states.len() as u32
            + network.other_root_states.len() as u32;
        let stats = NetworkStats {
            states: (n as u32).saturating_sub(1),
            edges: edges.len() as u32,
            exits: network.exits.len() as u32,
            roots,
        };
        tracing::debug!(
            states = stats.states,
            edges = stats.edges,
            exits = stats.exits,
            "froze search network"
        );

        CompactNetwork {
            offsets,
            edges,
            descriptors,
            exits: network.exits.clone(),
            root_state: network.root_state,
            non_scoring,
            stats,
        }
    }

    pub fn root_state(&self) -> StateId {
        self.root_state
    }

    pub fn successors(&self, state: StateId) -> &[Edge] {
        let from = self.offsets[state as usize] as usize;
        let to = self.offsets[state as usize + 1] as usize;
        &self.edges[from..to]
    }

    pub fn descriptor(&self, state: StateId) -> StateDescriptor {
        self.descriptors[state as usize]
    }

    /// Whether the state carries no emission and is crossed for free.
    pub fn is_non_scoring(&self, state: StateId) -> bool {
        self.non_scoring[state as usize]
    }

    pub fn exit(&self, id: ExitId) -> Exit {
        self.exits[id as usize]
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }
}
