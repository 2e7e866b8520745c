use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AgentError, Result};

use super::NavGraph;

/// Success threshold in meters used to normalize DTW.
pub const NDTW_THRESHOLD: f32 = 3.0;

/// Normalized dynamic time warping between a predicted and a reference path.
#[derive(Debug, Clone)]
pub struct Ndtw {
    graph: Arc<NavGraph>,
    threshold: f32,
}

impl Ndtw {
    pub fn new(graph: Arc<NavGraph>) -> Self {
        Self {
            graph,
            threshold: NDTW_THRESHOLD,
        }
    }

    pub fn dtw(&self, prediction: &[String], reference: &[String]) -> f32 {
        let n = prediction.len();
        let m = reference.len();
        let mut matrix = vec![vec![f32::INFINITY; m + 1]; n + 1];
        matrix[0][0] = 0.0;

        for i in 1..=n {
            for j in 1..=m {
                let best_previous = matrix[i - 1][j]
                    .min(matrix[i][j - 1])
                    .min(matrix[i - 1][j - 1]);
                let cost = self.graph.distance(&prediction[i - 1], &reference[j - 1]);
                matrix[i][j] = cost + best_previous;
            }
        }

        matrix[n][m]
    }

    pub fn score(&self, prediction: &[String], reference: &[String]) -> f32 {
        if prediction.is_empty() || reference.is_empty() {
            return 0.0;
        }
        let dtw = self.dtw(prediction, reference);
        (-dtw / (reference.len() as f32 * self.threshold)).exp()
    }
}

/// nDTW scorers keyed by scan id.
#[derive(Debug, Clone, Default)]
pub struct NdtwEvaluator {
    scorers: HashMap<String, Ndtw>,
}

impl NdtwEvaluator {
    pub fn new<'a>(graphs: impl IntoIterator<Item = &'a Arc<NavGraph>>) -> Self {
        let scorers = graphs
            .into_iter()
            .map(|graph| (graph.scan().to_string(), Ndtw::new(graph.clone())))
            .collect();
        Self { scorers }
    }

    pub fn score(&self, scan: &str, prediction: &[String], reference: &[String]) -> Result<f32> {
        self.scorers
            .get(scan)
            .map(|ndtw| ndtw.score(prediction, reference))
            .ok_or_else(|| AgentError::UnknownScan(scan.to_string()))
    }
}
