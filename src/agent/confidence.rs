//! Monte Carlo dropout confidence.
//!
//! The same visual step is replayed several times with dropout active and
//! without gradient tracking. Three signals are read off the ensemble and
//! averaged: how peaked the mean distribution is (normalized entropy), how
//! little the logits move between passes (variance) and how much mass the
//! favourite candidate gets (agreement).

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::backend::AutodiffBackend;

use crate::error::{AgentError, Result};

use super::encoder::{CrossModalEncoder, ExecutionMode, VisualRequest};
use super::features::to_f32_vec;

const LOG_EPSILON: f32 = 1e-10;

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceEstimator {
    samples: usize,
}

impl ConfidenceEstimator {
    pub fn new(samples: usize) -> Result<Self> {
        if samples < 2 {
            return Err(AgentError::InvalidConfig(format!(
                "confidence ensemble needs at least 2 passes, got {}",
                samples
            )));
        }
        Ok(Self { samples })
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Per-instance confidence for one visual step.
    pub fn estimate<B, M>(&self, encoder: &M, request: &VisualRequest<B>) -> Result<Vec<f32>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        M::InnerModule: CrossModalEncoder<B::InnerBackend>,
    {
        let model = encoder.valid();
        let request = request.clone().inner();

        let mut passes = Vec::with_capacity(self.samples);
        for _ in 0..self.samples {
            let response = model.step_visual(request.clone(), ExecutionMode::Stochastic)?;
            passes.push(response.logits);
        }

        let logits: Tensor<B::InnerBackend, 3> = Tensor::stack(passes, 0);
        to_f32_vec(combine(logits, request.cand_mask))
    }
}

/// Combines stacked logits `[passes, batch, candidates]` into `[batch]` confidences.
pub fn combine<B: Backend>(logits: Tensor<B, 3>, valid: Tensor<B, 2>) -> Tensor<B, 1> {
    let [_, batch, candidates] = logits.dims();
    let invalid = valid.clone().equal_elem(0.0);
    let counts = valid.clone().sum_dim(1).reshape([batch]);

    let mean_logits = logits.clone().mean_dim(0).reshape([batch, candidates]);
    let mean_probs = softmax(mean_logits.mask_fill(invalid, f32::NEG_INFINITY), 1);

    let entropy_conf = entropy_confidence(mean_probs.clone(), counts.clone());

    let variance = logits.var(0).reshape([batch, candidates]);
    let mean_variance = (variance * valid).sum_dim(1).reshape([batch]) / counts;
    let stability = mean_variance.neg().add_scalar(1.0);

    let agreement = mean_probs.max_dim(1).reshape([batch]);

    (entropy_conf + stability + agreement).div_scalar(3.0)
}

/// `1 - H(p) / ln(n)` per row, with `n` the number of valid candidates.
pub fn entropy_confidence<B: Backend>(probs: Tensor<B, 2>, counts: Tensor<B, 1>) -> Tensor<B, 1> {
    let [batch, _] = probs.dims();
    let entropy = (probs.clone() * probs.add_scalar(LOG_EPSILON).log())
        .sum_dim(1)
        .reshape([batch])
        .neg();

    // A single choice is certain by construction
    let single = counts.clone().lower_equal_elem(1.0);
    let max_entropy = counts.log().mask_fill(single, 1.0);
    (entropy / max_entropy).neg().add_scalar(1.0)
}
