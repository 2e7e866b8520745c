use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{AgentError, Result};
use crate::infra::{
    ELEVATION_LEVELS, NUM_VIEWS, VIEW_ANGLE, VIEWS_PER_LEVEL, angle_feature, elevation_level,
    heading_index, view_index,
};

use super::{
    Candidate, MIN_INSTRUCTION_WIDTH, NavGraph, NavigationEnv, NdtwEvaluator, Observation,
    PrimitiveAction, ScanSpec, SimState,
};

fn default_feature_size() -> usize {
    2048
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub instr_id: String,
    pub scan: String,
    /// Ground-truth path; the episode starts at the first viewpoint and ends at the last.
    pub path: Vec<String>,
    #[serde(default)]
    pub heading: f32,
    pub instr_encoding: Vec<i64>,
}

/// Precomputed image features of the 36 discrete views at one viewpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewpointFeatures {
    pub scan: String,
    pub viewpoint: String,
    pub views: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub scans: BTreeMap<String, ScanSpec>,
    pub episodes: Vec<Episode>,
    #[serde(default = "default_feature_size")]
    pub feature_size: usize,
    #[serde(default)]
    pub features: Vec<ViewpointFeatures>,
}

impl Dataset {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let dataset: Dataset = serde_json::from_reader(BufReader::new(file))?;
        debug!(
            "Loaded {} episodes over {} scans from {}",
            dataset.episodes.len(),
            dataset.scans.len(),
            path.as_ref().display()
        );
        Ok(dataset)
    }
}

/// Discretized panoramic simulator: 12 headings by 3 elevations, moves along graph edges.
#[derive(Debug, Clone)]
struct Simulator {
    graph: Arc<NavGraph>,
    viewpoint: String,
    heading_index: usize,
    elevation_level: usize,
}

impl Simulator {
    fn new(graph: Arc<NavGraph>, viewpoint: &str, heading: f32) -> Self {
        Self {
            graph,
            viewpoint: viewpoint.to_string(),
            heading_index: heading_index(heading),
            elevation_level: 1,
        }
    }

    fn heading(&self) -> f32 {
        self.heading_index as f32 * VIEW_ANGLE
    }

    fn elevation(&self) -> f32 {
        (self.elevation_level as f32 - 1.0) * VIEW_ANGLE
    }

    fn view_index(&self) -> usize {
        view_index(self.heading_index, self.elevation_level)
    }

    /// Current viewpoint first, then neighbors in id order.
    fn navigable(&self) -> Vec<String> {
        std::iter::once(self.viewpoint.clone())
            .chain(self.graph.neighbors(&self.viewpoint).iter().map(|(id, _)| id.clone()))
            .collect()
    }

    fn apply(&mut self, action: PrimitiveAction) {
        match action {
            PrimitiveAction::TurnLeft => {
                self.heading_index = (self.heading_index + VIEWS_PER_LEVEL - 1) % VIEWS_PER_LEVEL;
            }
            PrimitiveAction::TurnRight => {
                self.heading_index = (self.heading_index + 1) % VIEWS_PER_LEVEL;
            }
            PrimitiveAction::LookUp => {
                self.elevation_level = (self.elevation_level + 1).min(ELEVATION_LEVELS - 1);
            }
            PrimitiveAction::LookDown => {
                self.elevation_level = self.elevation_level.saturating_sub(1);
            }
            PrimitiveAction::MoveTo(index) => match self.navigable().get(index) {
                Some(target) => self.viewpoint = target.clone(),
                None => trace!("Ignoring move to navigable index {} at {}", index, self.viewpoint),
            },
        }
    }

    fn state(&self) -> SimState {
        SimState {
            viewpoint: self.viewpoint.clone(),
            view_index: self.view_index(),
            heading: self.heading(),
            elevation: self.elevation(),
            navigable: self.navigable(),
        }
    }
}

/// Batched in-memory environment over a set of navigation graphs.
pub struct GraphEnv {
    graphs: HashMap<String, Arc<NavGraph>>,
    episodes: Vec<Episode>,
    features: HashMap<(String, String), Vec<Vec<f32>>>,
    feature_size: usize,
    angle_feat_size: usize,
    batch_size: usize,
    cursor: usize,
    batch: Vec<Episode>,
    sims: Vec<Simulator>,
    rng: StdRng,
}

impl GraphEnv {
    pub fn new(dataset: Dataset, batch_size: usize, angle_feat_size: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(AgentError::InvalidConfig("batch size must be positive".to_string()));
        }
        if dataset.episodes.is_empty() {
            return Err(AgentError::InvalidConfig("dataset has no episodes".to_string()));
        }

        let mut graphs = HashMap::new();
        for (scan, spec) in &dataset.scans {
            graphs.insert(scan.clone(), Arc::new(NavGraph::new(scan, spec)?));
        }

        for episode in &dataset.episodes {
            let graph = graphs
                .get(&episode.scan)
                .ok_or_else(|| AgentError::UnknownScan(episode.scan.clone()))?;
            if episode.path.is_empty() {
                return Err(AgentError::InvalidConfig(format!(
                    "episode {} has an empty path",
                    episode.instr_id
                )));
            }
            if episode.instr_encoding.len() < MIN_INSTRUCTION_WIDTH {
                return Err(AgentError::InvalidConfig(format!(
                    "episode {} has an instruction encoding of width {}, need at least {}",
                    episode.instr_id,
                    episode.instr_encoding.len(),
                    MIN_INSTRUCTION_WIDTH
                )));
            }
            if let Some(missing) = episode.path.iter().find(|vp| !graph.contains(vp)) {
                return Err(AgentError::UnknownViewpoint {
                    scan: episode.scan.clone(),
                    viewpoint: missing.clone(),
                });
            }
        }

        let mut features = HashMap::new();
        for entry in dataset.features {
            if entry.views.len() != NUM_VIEWS
                || entry.views.iter().any(|row| row.len() != dataset.feature_size)
            {
                return Err(AgentError::InvalidConfig(format!(
                    "features for {}/{} must be {} views of size {}",
                    entry.scan, entry.viewpoint, NUM_VIEWS, dataset.feature_size
                )));
            }
            features.insert((entry.scan, entry.viewpoint), entry.views);
        }

        debug!(
            "Environment ready: {} episodes, batch size {}, {} viewpoints with features",
            dataset.episodes.len(),
            batch_size,
            features.len()
        );

        Ok(Self {
            graphs,
            episodes: dataset.episodes,
            features,
            feature_size: dataset.feature_size,
            angle_feat_size,
            batch_size,
            cursor: 0,
            batch: Vec::new(),
            sims: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    pub fn ndtw_evaluator(&self) -> NdtwEvaluator {
        NdtwEvaluator::new(self.graphs.values())
    }

    /// Takes the next slice of episodes, wrapping around with a reshuffle at the end.
    fn next_minibatch(&mut self) {
        let end = (self.cursor + self.batch_size).min(self.episodes.len());
        let mut batch: Vec<Episode> = self.episodes[self.cursor..end].to_vec();
        if batch.len() < self.batch_size {
            self.episodes.shuffle(&mut self.rng);
            self.cursor = (self.batch_size - batch.len()).min(self.episodes.len());
            batch.extend_from_slice(&self.episodes[..self.cursor]);
        } else {
            self.cursor += self.batch_size;
        }
        self.batch = batch;
    }

    fn image_feature(&self, scan: &str, viewpoint: &str, view: usize) -> Vec<f32> {
        self.features
            .get(&(scan.to_string(), viewpoint.to_string()))
            .and_then(|views| views.get(view))
            .cloned()
            .unwrap_or_else(|| vec![0.0; self.feature_size])
    }

    fn candidates(&self, sim: &Simulator) -> Vec<Candidate> {
        let Ok(here) = sim.graph.position(&sim.viewpoint) else {
            return Vec::new();
        };
        let scan = sim.graph.scan();

        sim.navigable()
            .into_iter()
            .enumerate()
            .skip(1)
            .filter_map(|(nav_index, viewpoint_id)| {
                let there = sim.graph.position(&viewpoint_id).ok()?;
                let heading = here.heading_to(&there);
                let elevation = here.elevation_to(&there);
                let point_id = view_index(heading_index(heading), elevation_level(elevation));

                let mut feature = self.image_feature(scan, &sim.viewpoint, point_id);
                feature.extend(angle_feature(
                    heading - sim.heading(),
                    elevation - sim.elevation(),
                    self.angle_feat_size,
                ));

                Some(Candidate {
                    viewpoint_id,
                    point_id,
                    nav_index,
                    feature,
                })
            })
            .collect()
    }

    fn panorama(&self, sim: &Simulator) -> Vec<Vec<f32>> {
        (0..NUM_VIEWS)
            .map(|view| {
                let heading = (view % VIEWS_PER_LEVEL) as f32 * VIEW_ANGLE;
                let elevation = ((view / VIEWS_PER_LEVEL) as f32 - 1.0) * VIEW_ANGLE;
                let mut row = self.image_feature(sim.graph.scan(), &sim.viewpoint, view);
                row.extend(angle_feature(
                    heading - sim.heading(),
                    elevation,
                    self.angle_feat_size,
                ));
                row
            })
            .collect()
    }

    fn observation(&self, episode: &Episode, sim: &Simulator) -> Observation {
        let goal = episode.path.last().unwrap_or(&sim.viewpoint);
        Observation {
            instr_id: episode.instr_id.clone(),
            scan: episode.scan.clone(),
            viewpoint: sim.viewpoint.clone(),
            view_index: sim.view_index(),
            heading: sim.heading(),
            elevation: sim.elevation(),
            distance: sim.graph.distance(&sim.viewpoint, goal),
            teacher: sim.graph.next_hop(&sim.viewpoint, goal),
            gt_path: episode.path.clone(),
            candidates: self.candidates(sim),
            instr_encoding: episode.instr_encoding.clone(),
            feature: self.panorama(sim),
        }
    }
}

impl NavigationEnv for GraphEnv {
    fn reset(&mut self) -> Vec<Observation> {
        self.next_minibatch();
        self.sims = self
            .batch
            .iter()
            .filter_map(|episode| {
                let graph = self.graphs.get(&episode.scan)?;
                let start = episode.path.first()?;
                Some(Simulator::new(graph.clone(), start, episode.heading))
            })
            .collect();
        self.observations()
    }

    fn observations(&self) -> Vec<Observation> {
        self.batch
            .iter()
            .zip(&self.sims)
            .map(|(episode, sim)| self.observation(episode, sim))
            .collect()
    }

    fn make_action(&mut self, index: usize, action: PrimitiveAction) {
        if let Some(sim) = self.sims.get_mut(index) {
            sim.apply(action);
        }
    }

    fn sim_state(&self, index: usize) -> SimState {
        match self.sims.get(index) {
            Some(sim) => sim.state(),
            None => SimState {
                viewpoint: String::new(),
                view_index: 0,
                heading: 0.0,
                elevation: 0.0,
                navigable: Vec::new(),
            },
        }
    }

    fn reset_epoch(&mut self, shuffle: bool) {
        if shuffle {
            self.episodes.shuffle(&mut self.rng);
        }
        self.cursor = 0;
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn feature_size(&self) -> usize {
        self.feature_size
    }
}
