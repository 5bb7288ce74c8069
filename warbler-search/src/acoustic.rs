//! Acoustic-context interface
//!
//! The builder never scores anything; all it needs from the acoustic model is
//! the expansion of a phoneme-in-context into a chain of tied state
//! descriptors, plus a few classification queries. `AcousticContext` is that
//! seam. `ContextTable` is a small table-backed implementation sufficient for
//! tests and toy models.

use crate::types::{EmissionId, PhonemeId, Score, TransitionModelIndex, TERM};

/// Reserved emission marker for non-scoring states (roots, skip-roots).
pub const INVALID_EMISSION: EmissionId = EmissionId::MAX;

/// Transition-model slot reserved for word-entry roots.
pub const ENTRY: TransitionModelIndex = 0;

/// Transition-model slot reserved for skip-capable word-entry roots.
pub const ENTRY_SKIP: TransitionModelIndex = 1;

/// First transition-model index usable by real phone states.
pub const FIRST_PHONE_TRANSITION_MODEL: TransitionModelIndex = 2;

/// Boundary flags passed to the allophone lookup.
pub mod boundary {
    pub const NONE: u8 = 0;
    pub const INITIAL_PHONE: u8 = 1;
    pub const FINAL_PHONE: u8 = 2;
}

/// Acoustic identity of one search-network state.
///
/// Two states are interchangeable candidates during determinization iff their
/// descriptors are equal; minimization additionally compares successor sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateDescriptor {
    pub emission: EmissionId,
    pub transition_model: TransitionModelIndex,
}

impl StateDescriptor {
    /// Descriptor of a non-scoring root placeholder.
    pub fn root() -> Self {
        StateDescriptor {
            emission: INVALID_EMISSION,
            transition_model: ENTRY,
        }
    }

    /// Descriptor of a skip-capable root placeholder.
    pub fn skip_root() -> Self {
        StateDescriptor {
            emission: INVALID_EMISSION,
            transition_model: ENTRY_SKIP,
        }
    }

    /// Whether this state carries no acoustic emission (root placeholder).
    pub fn is_non_scoring(&self) -> bool {
        self.emission == INVALID_EMISSION
    }
}

/// Maximum number of descriptors a single phoneme may expand into.
pub const MAX_HMM_LENGTH: usize = 12;

/// Inline chain of state descriptors for one phoneme-in-context.
#[derive(Debug, Clone, Copy)]
pub struct HmmSequence {
    states: [StateDescriptor; MAX_HMM_LENGTH],
    len: usize,
}

impl HmmSequence {
    pub fn new() -> Self {
        HmmSequence {
            states: [StateDescriptor::root(); MAX_HMM_LENGTH],
            len: 0,
        }
    }

    pub fn push(&mut self, desc: StateDescriptor) {
        assert!(self.len < MAX_HMM_LENGTH, "phoneme expands into too many states");
        self.states[self.len] = desc;
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[StateDescriptor] {
        &self.states[..self.len]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StateDescriptor> {
        self.as_slice().iter()
    }
}

impl Default for HmmSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Index<usize> for HmmSequence {
    type Output = StateDescriptor;

    fn index(&self, idx: usize) -> &StateDescriptor {
        &self.as_slice()[idx]
    }
}

/// Context-dependent acoustic-unit lookup, consumed by the topology builders.
pub trait AcousticContext {
    /// Expand a phoneme with its left/right context and boundary flags into
    /// the ordered chain of state descriptors realizing it.
    ///
    /// Context phonemes that are invalid or context-independent must not
    /// influence the result; `TERM` on either side means "no context".
    fn hmm_from_allophone(
        &self,
        left: PhonemeId,
        central: PhonemeId,
        right: PhonemeId,
        boundary: u8,
    ) -> HmmSequence;

    /// Whether the phoneme's acoustic realization depends on its neighbours.
    fn is_context_dependent(&self, phone: PhonemeId) -> bool;

    /// Whether the id names a phoneme of this model. `TERM` is not valid.
    fn is_valid(&self, phone: PhonemeId) -> bool;

    /// The designated silence phoneme, if the model has one.
    fn silence(&self) -> Option<PhonemeId>;

    /// The descriptor of the blank unit, for label topologies (CTC/RNA).
    fn blank(&self) -> Option<StateDescriptor>;

    /// Number of state-transition models carried by the acoustic model.
    fn transition_model_count(&self) -> u32;

    /// Forward penalty of a transition model.
    fn forward_penalty(&self, model: TransitionModelIndex) -> Score;

    /// Skip penalty of a transition model.
    fn skip_penalty(&self, model: TransitionModelIndex) -> Score;
}

/// Table-backed acoustic context.
///
/// Emission ids are synthesized from (left, central, right, sub-state) so
/// that equal contexts always tie to the same emission class. Boundary flags
/// are deliberately tied across variants, like a decision tree that never
/// splits on them.
pub struct ContextTable {
    n_phones: u32,
    context_dependent: Vec<bool>,
    states_per_phone: u32,
    silence: Option<PhonemeId>,
    blank: Option<StateDescriptor>,
    forward_penalties: Vec<Score>,
    skip_penalties: Vec<Score>,
}

impl ContextTable {
    /// A table over phoneme ids `1..=n_phones`, all context-dependent,
    /// one state per phoneme.
    pub fn new(n_phones: u32) -> Self {
        ContextTable {
            n_phones,
            context_dependent: vec![true; n_phones as usize + 1],
            states_per_phone: 1,
            silence: None,
            blank: None,
            forward_penalties: vec![0.0; FIRST_PHONE_TRANSITION_MODEL as usize + 1],
            skip_penalties: vec![0.0; FIRST_PHONE_TRANSITION_MODEL as usize + 1],
        }
    }

    /// Mark a phoneme as context-independent.
    pub fn context_independent(mut self, phone: PhonemeId) -> Self {
        self.context_dependent[phone as usize] = false;
        self
    }

    /// Mark every phoneme as context-independent (label topologies).
    pub fn all_context_independent(mut self) -> Self {
        for cd in self.context_dependent.iter_mut() {
            *cd = false;
        }
        self
    }

    /// Expand every phoneme into `n` sub-states instead of one.
    pub fn states_per_phone(mut self, n: u32) -> Self {
        assert!(n >= 1 && n as usize <= MAX_HMM_LENGTH);
        self.states_per_phone = n;
        self
    }

    /// Declare the silence phoneme. Silence is context-independent.
    pub fn with_silence(mut self, phone: PhonemeId) -> Self {
        self.context_dependent[phone as usize] = false;
        self.silence = Some(phone);
        self
    }

    /// Declare a blank phoneme (context-independent, single-state); its
    /// descriptor becomes the model's blank unit.
    pub fn with_blank(mut self, phone: PhonemeId) -> Self {
        self.context_dependent[phone as usize] = false;
        self.blank = Some(self.descriptor(TERM, phone, TERM, 0));
        self
    }

    /// Override the forward/skip penalties of one transition model.
    pub fn with_penalties(
        mut self,
        model: TransitionModelIndex,
        forward: Score,
        skip: Score,
    ) -> Self {
        let idx = model as usize;
        if idx >= self.forward_penalties.len() {
            self.forward_penalties.resize(idx + 1, 0.0);
            self.skip_penalties.resize(idx + 1, 0.0);
        }
        self.forward_penalties[idx] = forward;
        self.skip_penalties[idx] = skip;
        self
    }

    fn descriptor(
        &self,
        left: PhonemeId,
        central: PhonemeId,
        right: PhonemeId,
        sub_state: u32,
    ) -> StateDescriptor {
        let base = self.n_phones + 1;
        let emission = ((central * base + left) * base + right) * self.states_per_phone + sub_state;
        StateDescriptor {
            emission,
            transition_model: FIRST_PHONE_TRANSITION_MODEL,
        }
    }
}

impl AcousticContext for ContextTable {
    fn hmm_from_allophone(
        &self,
        left: PhonemeId,
        central: PhonemeId,
        right: PhonemeId,
        _boundary: u8,
    ) -> HmmSequence {
        assert!(central != TERM && self.is_valid(central));

        // Context only matters for context-dependent phonemes, and only
        // context-dependent neighbours contribute.
        let mut history = TERM;
        let mut future = TERM;
        if self.is_context_dependent(central) {
            if self.is_valid(left) && self.is_context_dependent(left) {
                history = left;
            }
            if self.is_valid(right) && self.is_context_dependent(right) {
                future = right;
            }
        }

        let mut hmm = HmmSequence::new();
        for sub_state in 0..self.states_per_phone {
            hmm.push(self.descriptor(history, central, future, sub_state));
        }
        hmm
    }

    fn is_context_dependent(&self, phone: PhonemeId) -> bool {
        self.context_dependent
            .get(phone as usize)
            .copied()
            .unwrap_or(false)
    }

    fn is_valid(&self, phone: PhonemeId) -> bool {
        phone != TERM && phone <= self.n_phones
    }

    fn silence(&self) -> Option<PhonemeId> {
        self.silence
    }

    fn blank(&self) -> Option<StateDescriptor> {
        self.blank
    }

    fn transition_model_count(&self) -> u32 {
        self.forward_penalties.len() as u32
    }

    fn forward_penalty(&self, model: TransitionModelIndex) -> Score {
        self.forward_penalties[model as usize]
    }

    fn skip_penalty(&self, model: TransitionModelIndex) -> Score {
        self.skip_penalties[model as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_contexts_tie_to_equal_emissions() {
        let table = ContextTable::new(4);
        let a = table.hmm_from_allophone(1, 2, 3, boundary::NONE);
        let b = table.hmm_from_allophone(1, 2, 3, boundary::FINAL_PHONE);
        assert_eq!(a.as_slice(), b.as_slice());

        let c = table.hmm_from_allophone(4, 2, 3, boundary::NONE);
        assert_ne!(a[0], c[0]);
    }

    #[test]
    fn context_independent_phones_ignore_neighbours() {
        let table = ContextTable::new(4).context_independent(2);
        let a = table.hmm_from_allophone(1, 2, 3, boundary::NONE);
        let b = table.hmm_from_allophone(TERM, 2, TERM, boundary::NONE);
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn context_dependent_phones_drop_ci_neighbours() {
        let table = ContextTable::new(4).context_independent(1);
        let a = table.hmm_from_allophone(1, 2, 3, boundary::NONE);
        let b = table.hmm_from_allophone(TERM, 2, 3, boundary::NONE);
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn sub_states_expand_in_order() {
        let table = ContextTable::new(2).states_per_phone(3);
        let hmm = table.hmm_from_allophone(TERM, 1, TERM, boundary::INITIAL_PHONE);
        assert_eq!(hmm.len(), 3);
        assert!(hmm[0].emission < hmm[1].emission && hmm[1].emission < hmm[2].emission);
    }
}
