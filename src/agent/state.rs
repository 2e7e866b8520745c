use burn::prelude::*;

/// Per-instance lifecycle within a rollout. Stopping is irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceState {
    #[default]
    Active,
    Stopped,
}

impl InstanceState {
    pub fn is_active(self) -> bool {
        self == InstanceState::Active
    }

    pub fn is_stopped(self) -> bool {
        self == InstanceState::Stopped
    }

    pub fn after(self, action: NavAction) -> Self {
        match (self, action) {
            (InstanceState::Active, NavAction::Candidate(_)) => InstanceState::Active,
            _ => InstanceState::Stopped,
        }
    }
}

/// Decision for one instance at one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavAction {
    /// Move to the candidate at this index.
    Candidate(usize),
    /// Stay put; also the no-op for instances that already stopped.
    Stop,
}

/// Everything a rollout accumulates per step, aligned to the length-sorted order.
pub struct EpisodeState<B: Backend> {
    perm: Vec<usize>,
    states: Vec<InstanceState>,
    pub last_distance: Vec<f32>,
    pub last_ndtw: Vec<f32>,
    pub hidden_states: Vec<Tensor<B, 2>>,
    pub policy_log_probs: Vec<Tensor<B, 1>>,
    pub entropies: Vec<Tensor<B, 1>>,
    pub rewards: Vec<Vec<f32>>,
    pub masks: Vec<Vec<f32>>,
}

impl<B: Backend> EpisodeState<B> {
    pub fn new(perm: Vec<usize>, last_distance: Vec<f32>, last_ndtw: Vec<f32>) -> Self {
        let batch = perm.len();
        Self {
            perm,
            states: vec![InstanceState::Active; batch],
            last_distance,
            last_ndtw,
            hidden_states: Vec::new(),
            policy_log_probs: Vec::new(),
            entropies: Vec::new(),
            rewards: Vec::new(),
            masks: Vec::new(),
        }
    }

    pub fn perm(&self) -> &[usize] {
        &self.perm
    }

    pub fn batch_size(&self) -> usize {
        self.perm.len()
    }

    pub fn states(&self) -> &[InstanceState] {
        &self.states
    }

    pub fn state(&self, i: usize) -> InstanceState {
        self.states[i]
    }

    /// Applies this step's actions; stopped instances never come back.
    pub fn advance(&mut self, actions: &[NavAction]) {
        for (state, &action) in self.states.iter_mut().zip(actions) {
            *state = state.after(action);
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.states.iter().all(|s| s.is_stopped())
    }

    pub fn active_count(&self) -> usize {
        self.states.iter().filter(|s| s.is_active()).count()
    }
}
