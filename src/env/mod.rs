//! Navigation environment: the simulator seam the agent drives, plus an
//! in-memory graph environment and path-fidelity scoring.

pub(crate) mod graph;
pub(crate) mod graph_env;
mod ndtw;

pub use graph::{NavGraph, ScanSpec};
pub use graph_env::{Dataset, Episode, GraphEnv, ViewpointFeatures};
pub use ndtw::{NDTW_THRESHOLD, Ndtw, NdtwEvaluator};

/// Position 0 of an encoded instruction is replaced by the recurrent state,
/// so at least one more token position is needed.
pub const MIN_INSTRUCTION_WIDTH: usize = 2;

/// A viewpoint the agent can move to from its current location.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub viewpoint_id: String,
    /// Absolute discrete view (0..36) facing the candidate.
    pub point_id: usize,
    /// Index into the simulator's navigable-location list.
    pub nav_index: usize,
    /// Image feature followed by the relative angle encoding.
    pub feature: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Observation {
    pub instr_id: String,
    pub scan: String,
    pub viewpoint: String,
    pub view_index: usize,
    pub heading: f32,
    pub elevation: f32,
    pub distance: f32,
    /// Next viewpoint on the shortest path to the goal, or the current one at the goal.
    pub teacher: String,
    pub gt_path: Vec<String>,
    pub candidates: Vec<Candidate>,
    pub instr_encoding: Vec<i64>,
    /// Panoramic features, one row per discrete view.
    pub feature: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveAction {
    TurnLeft,
    TurnRight,
    LookUp,
    LookDown,
    /// Move to the navigable location at this index (0 is the current viewpoint).
    MoveTo(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimState {
    pub viewpoint: String,
    pub view_index: usize,
    pub heading: f32,
    pub elevation: f32,
    pub navigable: Vec<String>,
}

pub trait NavigationEnv {
    /// Load the next batch of episodes and return their first observations.
    fn reset(&mut self) -> Vec<Observation>;
    fn observations(&self) -> Vec<Observation>;
    fn make_action(&mut self, index: usize, action: PrimitiveAction);
    fn sim_state(&self, index: usize) -> SimState;
    fn reset_epoch(&mut self, shuffle: bool);
    fn batch_size(&self) -> usize;
    /// Width of the image part of candidate features.
    fn feature_size(&self) -> usize;
}
