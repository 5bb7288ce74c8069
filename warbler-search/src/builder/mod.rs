//! Network builders
//!
//! Each builder compiles a lexicon and an acoustic context into a
//! [`SearchNetwork`]. The minimized builder produces the classic
//! prefix-shared HMM network; the label builders produce the flat
//! topologies used by CTC, RNA and attention decoders.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::acoustic::StateDescriptor;
use crate::graph::{Edge, Exit, SearchNetwork};
use crate::types::{ExitId, PhonemeId, StateId};
use warbler_common::Result;

pub mod label;
pub mod minimized;
mod minimize;

pub use label::{AedTreeBuilder, CtcTreeBuilder, RnaTreeBuilder};
pub use minimized::MinimizedTreeBuilder;

/// Common interface of all network builders.
pub trait TreeBuilder {
    /// Compile the full network. Must be called exactly once.
    fn build(&mut self) -> Result<()>;

    fn network(&self) -> &SearchNetwork;
}

/// Identifies a root by its phoneme context and its depth relative to the
/// word boundary: -1 for the joints entered from pushed word ends, 0 for
/// the boundary root itself, +1 for the shared suffix joints inside the
/// following word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootKey {
    pub left: PhonemeId,
    pub right: PhonemeId,
    pub depth: i32,
}

impl RootKey {
    pub fn new(left: PhonemeId, right: PhonemeId, depth: i32) -> Self {
        RootKey { left, right, depth }
    }
}

/// Hash-consing key for suffix sharing: two states can be the same state
/// exactly when they carry the same descriptor, the same word-end marking,
/// and the same set of outgoing edges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatePredecessor {
    pub successors: BTreeSet<Edge>,
    pub descriptor: StateDescriptor,
    pub word_end: bool,
}

/// State and exit allocation shared by all builders.
#[derive(Debug, Default)]
pub struct BuilderBase {
    exit_hash: FxHashMap<Exit, ExitId>,
}

impl BuilderBase {
    pub fn new() -> Self {
        BuilderBase::default()
    }

    /// Allocate a fresh state. Sharing is the caller's business.
    pub fn create_state(
        &mut self,
        network: &mut SearchNetwork,
        descriptor: StateDescriptor,
    ) -> StateId {
        network.structure.allocate_state(descriptor)
    }

    /// Return the exit for this pronunciation/transit pair, creating it on
    /// first use.
    pub fn create_exit(&mut self, network: &mut SearchNetwork, exit: Exit) -> ExitId {
        if let Some(id) = self.exit_hash.get(&exit) {
            return *id;
        }
        let id = network.exits.len() as ExitId;
        network.exits.push(exit);
        self.exit_hash.insert(exit, id);
        id
    }

    /// Rebuild the exit lookup from the network's exit table, after a
    /// cleanup has renumbered and deduplicated it.
    pub fn rebuild_exit_hash(&mut self, network: &SearchNetwork) {
        self.exit_hash.clear();
        for (id, exit) in network.exits.iter().enumerate() {
            self.exit_hash.insert(*exit, id as ExitId);
        }
    }
}

fn default_min_phones() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_minimization_iterations() -> u32 {
    2
}

/// Options of the minimized HMM builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MinimizedBuilderOptions {
    /// Words shorter than this keep a static fan-out instead of pushing
    /// their last phoneme into the successor word.
    pub min_phones: u32,
    /// Add transitions that let context-independent words follow any
    /// coarticulated root directly.
    pub add_ci_transitions: bool,
    /// Route exits of context-independent words through the shared
    /// context-independent root instead of per-context roots.
    pub use_root_for_ci_exits: bool,
    /// Keep word-end states distinct during minimization so that word
    /// boundaries stay exact in the traceback.
    pub force_exact_word_ends: bool,
    /// Never merge or prune root states.
    pub keep_roots: bool,
    /// Wire skip transitions across word boundaries.
    pub allow_cross_word_skips: bool,
    /// Build silence with a doubled state sequence so a single frame can
    /// never cross it.
    pub repeat_silence: bool,
    /// Number of determinize/minimize passes over the finished body.
    pub minimization_iterations: u32,
}

impl Default for MinimizedBuilderOptions {
    fn default() -> Self {
        MinimizedBuilderOptions {
            min_phones: default_min_phones(),
            add_ci_transitions: false,
            use_root_for_ci_exits: default_true(),
            force_exact_word_ends: false,
            keep_roots: false,
            allow_cross_word_skips: false,
            repeat_silence: false,
            minimization_iterations: default_minimization_iterations(),
        }
    }
}

/// Options of the label-topology builders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LabelBuilderOptions {
    /// Each label state loops on itself.
    pub allow_label_loop: bool,
    /// The blank state loops on itself.
    pub allow_blank_loop: bool,
    /// Repeated identical labels must be separated by a blank frame.
    pub force_blank_between_repeated_labels: bool,
}

impl LabelBuilderOptions {
    pub fn ctc() -> Self {
        LabelBuilderOptions {
            allow_label_loop: true,
            allow_blank_loop: true,
            force_blank_between_repeated_labels: true,
        }
    }

    pub fn rna() -> Self {
        LabelBuilderOptions {
            allow_label_loop: false,
            allow_blank_loop: true,
            force_blank_between_repeated_labels: false,
        }
    }
}

impl Default for LabelBuilderOptions {
    fn default() -> Self {
        LabelBuilderOptions::ctc()
    }
}
