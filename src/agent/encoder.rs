//! Seam between the agent and the cross-modal state encoder.
//!
//! The agent only ever talks to the encoder through [`CrossModalEncoder::forward`]
//! with one of two request shapes: a `Language` request once per rollout to
//! encode the instruction, and a `Visual` request per step to update the
//! recurrent state and score the candidates.

use burn::prelude::*;
use burn::tensor::Distribution;
use burn::tensor::backend::AutodiffBackend;

use crate::error::{AgentError, Result};

/// Whether dropout is active for a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Deterministic,
    Stochastic,
}

/// Inverted dropout driven by an explicit mode.
pub fn dropout<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    prob: f64,
    mode: ExecutionMode,
) -> Tensor<B, D> {
    if mode == ExecutionMode::Deterministic || prob <= 0.0 {
        return x;
    }
    let keep = 1.0 - prob;
    let mask = Tensor::<B, D>::random(x.shape(), Distribution::Bernoulli(keep), &x.device());
    x * mask.div_scalar(keep)
}

#[derive(Debug, Clone)]
pub struct LanguageRequest<B: Backend> {
    /// Token ids `[batch, seq_len]`
    pub tokens: Tensor<B, 2, Int>,
    /// 1.0 for real tokens, 0.0 for padding `[batch, seq_len]`
    pub mask: Tensor<B, 2>,
}

#[derive(Debug, Clone)]
pub struct LanguageResponse<B: Backend> {
    /// Initial recurrent state `[batch, hidden]`
    pub state: Tensor<B, 2>,
    /// Contextual token features `[batch, seq_len, hidden]`
    pub instruction: Tensor<B, 3>,
}

#[derive(Debug, Clone)]
pub struct VisualRequest<B: Backend> {
    /// Instruction features with position 0 holding the current state
    pub instruction: Tensor<B, 3>,
    pub lang_mask: Tensor<B, 2>,
    /// Angle encoding of the current heading `[batch, angle_feat_size]`
    pub action_feats: Tensor<B, 2>,
    /// Candidate features plus a zero stop slot `[batch, max_candidates + 1, feat]`
    pub cand_feats: Tensor<B, 3>,
    /// 1.0 for valid candidate slots `[batch, max_candidates + 1]`
    pub cand_mask: Tensor<B, 2>,
}

impl<B: AutodiffBackend> VisualRequest<B> {
    /// The same request on the inner backend, outside of gradient tracking.
    pub fn inner(self) -> VisualRequest<B::InnerBackend> {
        VisualRequest {
            instruction: self.instruction.inner(),
            lang_mask: self.lang_mask.inner(),
            action_feats: self.action_feats.inner(),
            cand_feats: self.cand_feats.inner(),
            cand_mask: self.cand_mask.inner(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisualResponse<B: Backend> {
    pub state: Tensor<B, 2>,
    /// Unmasked scores over candidates and the stop slot
    pub logits: Tensor<B, 2>,
    /// Optional per-instance confidence computed by the encoder itself
    pub confidence: Option<Tensor<B, 1>>,
}

#[derive(Debug, Clone)]
pub enum EncoderRequest<B: Backend> {
    Language(LanguageRequest<B>),
    Visual(VisualRequest<B>),
}

#[derive(Debug, Clone)]
pub enum EncoderResponse<B: Backend> {
    Language(LanguageResponse<B>),
    Visual(VisualResponse<B>),
}

pub trait CrossModalEncoder<B: Backend> {
    fn forward(&self, request: EncoderRequest<B>, mode: ExecutionMode) -> EncoderResponse<B>;

    fn encode_language(
        &self,
        request: LanguageRequest<B>,
        mode: ExecutionMode,
    ) -> Result<LanguageResponse<B>> {
        match self.forward(EncoderRequest::Language(request), mode) {
            EncoderResponse::Language(response) => Ok(response),
            EncoderResponse::Visual(_) => {
                Err(AgentError::UnexpectedEncoderResponse { expected: "language" })
            }
        }
    }

    fn step_visual(
        &self,
        request: VisualRequest<B>,
        mode: ExecutionMode,
    ) -> Result<VisualResponse<B>> {
        match self.forward(EncoderRequest::Visual(request), mode) {
            EncoderResponse::Visual(response) => Ok(response),
            EncoderResponse::Language(_) => {
                Err(AgentError::UnexpectedEncoderResponse { expected: "visual" })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    struct Echo;

    impl CrossModalEncoder<TestBackend> for Echo {
        fn forward(
            &self,
            request: EncoderRequest<TestBackend>,
            _mode: ExecutionMode,
        ) -> EncoderResponse<TestBackend> {
            // Always answers with a language response
            let device = Default::default();
            let batch = match &request {
                EncoderRequest::Language(r) => r.tokens.dims()[0],
                EncoderRequest::Visual(r) => r.cand_mask.dims()[0],
            };
            EncoderResponse::Language(LanguageResponse {
                state: Tensor::zeros([batch, 2], &device),
                instruction: Tensor::zeros([batch, 1, 2], &device),
            })
        }
    }

    #[test]
    fn test_deterministic_dropout_is_identity() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::ones([4, 8], &device);
        let y = dropout(x.clone(), 0.5, ExecutionMode::Deterministic);
        assert_eq!(
            y.into_data().to_vec::<f32>().unwrap(),
            x.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_stochastic_dropout_scales_kept_units() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::ones([16, 16], &device);
        let values = dropout(x, 0.5, ExecutionMode::Stochastic)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!(values.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_mismatched_response_is_reported() {
        let device = Default::default();
        let request = VisualRequest::<TestBackend> {
            instruction: Tensor::zeros([1, 2, 2], &device),
            lang_mask: Tensor::ones([1, 2], &device),
            action_feats: Tensor::zeros([1, 4], &device),
            cand_feats: Tensor::zeros([1, 1, 4], &device),
            cand_mask: Tensor::ones([1, 1], &device),
        };
        assert!(matches!(
            Echo.step_visual(request, ExecutionMode::Deterministic),
            Err(AgentError::UnexpectedEncoderResponse { expected: "visual" })
        ));
    }
}
