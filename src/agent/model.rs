//! Reference state encoder and critic networks.

use burn::module::Module;
use burn::nn::{
    Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig, Relu,
};
use burn::prelude::*;
use burn::tensor::activation::softmax;

use super::encoder::{
    CrossModalEncoder, EncoderRequest, EncoderResponse, ExecutionMode, LanguageRequest,
    LanguageResponse, VisualRequest, VisualResponse, dropout,
};

/// Additive mask value for attention; large but finite so fully masked rows stay defined.
const ATTENTION_MASK_VALUE: f32 = -1e4;

/// 0 for valid positions, a large negative value for masked ones.
fn additive_mask<B: Backend>(mask: Tensor<B, 2>) -> Tensor<B, 2> {
    mask.neg().add_scalar(1.0).mul_scalar(ATTENTION_MASK_VALUE)
}

#[derive(Debug, Config)]
pub struct EncoderConfig {
    /// Vocabulary size of the instruction tokenizer
    pub vocab_size: usize,
    /// Width of the recurrent state and token features
    pub hidden_size: usize,
    /// Image feature size per view
    pub feature_size: usize,
    /// Angle encoding size appended to image features
    pub angle_feat_size: usize,
    /// Dropout on the image part of candidate features
    pub feat_dropout: f64,
    /// Dropout on the state-action query
    pub hidden_dropout: f64,
    pub layer_norm_eps: f64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            feature_size: 2048,
            angle_feat_size: 128,
            feat_dropout: 0.3,
            hidden_dropout: 0.1,
            layer_norm_eps: 1e-12,
        }
    }
}

/// Recurrent cross-modal encoder.
///
/// The language pass embeds the instruction and pools a sentence state. Each
/// visual pass projects the previous state together with the current heading,
/// attends over instruction tokens and candidates with that query, fuses both
/// attended summaries and projects them into the next state. Candidate scores
/// are the scaled dot products used for the visual attention.
#[derive(Module, Debug)]
pub struct RecurrentEncoder<B: Backend> {
    embedding: Embedding<B>,
    lang_proj: Linear<B>,
    lang_norm: LayerNorm<B>,
    pooler: Linear<B>,
    action_state_project: Linear<B>,
    action_norm: LayerNorm<B>,
    img_projection: Linear<B>,
    cand_norm: LayerNorm<B>,
    vis_lang_norm: LayerNorm<B>,
    state_proj: Linear<B>,
    state_norm: LayerNorm<B>,
    feat_dropout: f64,
    hidden_dropout: f64,
    angle_feat_size: usize,
}

impl<B: Backend> RecurrentEncoder<B> {
    pub fn new(device: &B::Device, config: &EncoderConfig) -> Self {
        let hidden = config.hidden_size;
        let norm = || {
            LayerNormConfig::new(hidden)
                .with_epsilon(config.layer_norm_eps)
                .init(device)
        };

        Self {
            embedding: EmbeddingConfig::new(config.vocab_size, hidden).init(device),
            lang_proj: LinearConfig::new(hidden, hidden).init(device),
            lang_norm: norm(),
            pooler: LinearConfig::new(hidden, hidden).init(device),
            action_state_project: LinearConfig::new(hidden + config.angle_feat_size, hidden)
                .init(device),
            action_norm: norm(),
            img_projection: LinearConfig::new(config.feature_size + config.angle_feat_size, hidden)
                .init(device),
            cand_norm: norm(),
            vis_lang_norm: norm(),
            state_proj: LinearConfig::new(hidden * 2, hidden).init(device),
            state_norm: norm(),
            feat_dropout: config.feat_dropout,
            hidden_dropout: config.hidden_dropout,
            angle_feat_size: config.angle_feat_size,
        }
    }

    fn language(&self, request: LanguageRequest<B>) -> LanguageResponse<B> {
        let [batch, seq_len] = request.tokens.dims();
        let embedded = self.embedding.forward(request.tokens);
        let hidden = embedded.dims()[2];
        let tokens = self
            .lang_norm
            .forward(self.lang_proj.forward(embedded.clone()).tanh() + embedded);

        // Masked mean over real tokens
        let mask = request.mask.unsqueeze_dim::<3>(2);
        let counts = mask.clone().sum_dim(1).clamp_min(1.0);
        let pooled = (tokens.clone() * mask).sum_dim(1).div(counts).reshape([batch, hidden]);
        let state = self.pooler.forward(pooled).tanh();

        let rest = tokens.slice([0..batch, 1..seq_len, 0..hidden]);
        let instruction = Tensor::cat(vec![state.clone().unsqueeze_dim::<3>(1), rest], 1);

        LanguageResponse { state, instruction }
    }

    fn visual(&self, request: VisualRequest<B>, mode: ExecutionMode) -> VisualResponse<B> {
        let [batch, seq_len, hidden] = request.instruction.dims();
        let [_, num_cands, feat_dim] = request.cand_feats.dims();
        let scale = (hidden as f32).sqrt();

        let state = request
            .instruction
            .clone()
            .slice([0..batch, 0..1, 0..hidden])
            .reshape([batch, hidden]);
        let state_action = self.action_norm.forward(
            self.action_state_project
                .forward(Tensor::cat(vec![state, request.action_feats], 1))
                .tanh(),
        );

        // Dropout touches only the image part of candidate features
        let img_size = feat_dim - self.angle_feat_size;
        let img = request
            .cand_feats
            .clone()
            .slice([0..batch, 0..num_cands, 0..img_size]);
        let angles = request
            .cand_feats
            .slice([0..batch, 0..num_cands, img_size..feat_dim]);
        let cand_feats = Tensor::cat(vec![dropout(img, self.feat_dropout, mode), angles], 2);
        let cands = self
            .cand_norm
            .forward(self.img_projection.forward(cand_feats));

        let query = dropout(state_action.clone(), self.hidden_dropout, mode).unsqueeze_dim::<3>(2);

        let words = request
            .instruction
            .slice([0..batch, 1..seq_len, 0..hidden]);
        let word_mask = request.lang_mask.slice([0..batch, 1..seq_len]);
        let word_scores = words
            .clone()
            .matmul(query.clone())
            .reshape([batch, seq_len - 1])
            .div_scalar(scale)
            + additive_mask(word_mask);
        let attended_language = softmax(word_scores, 1)
            .unsqueeze_dim::<3>(1)
            .matmul(words)
            .reshape([batch, hidden]);

        let logits = cands
            .clone()
            .matmul(query)
            .reshape([batch, num_cands])
            .div_scalar(scale);
        let cand_scores = logits.clone() + additive_mask(request.cand_mask);
        let attended_visual = softmax(cand_scores, 1)
            .unsqueeze_dim::<3>(1)
            .matmul(cands)
            .reshape([batch, hidden]);

        let vis_lang = self
            .vis_lang_norm
            .forward(attended_language * attended_visual);
        let state = self
            .state_norm
            .forward(self.state_proj.forward(Tensor::cat(vec![state_action, vis_lang], 1)));

        VisualResponse {
            state,
            logits,
            confidence: None,
        }
    }
}

impl<B: Backend> CrossModalEncoder<B> for RecurrentEncoder<B> {
    fn forward(&self, request: EncoderRequest<B>, mode: ExecutionMode) -> EncoderResponse<B> {
        match request {
            EncoderRequest::Language(request) => EncoderResponse::Language(self.language(request)),
            EncoderRequest::Visual(request) => {
                EncoderResponse::Visual(self.visual(request, mode))
            }
        }
    }
}

#[derive(Debug, Config)]
pub struct CriticConfig {
    /// Width of the encoder state
    pub hidden_size: usize,
    pub inner_size: usize,
    pub dropout: f64,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            inner_size: 512,
            dropout: 0.5,
        }
    }
}

/// State-value head over the encoder state.
#[derive(Module, Debug)]
pub struct Critic<B: Backend> {
    input: Linear<B>,
    output: Linear<B>,
    activation: Relu,
    dropout: f64,
}

impl<B: Backend> Critic<B> {
    pub fn new(device: &B::Device, config: &CriticConfig) -> Self {
        Self {
            input: LinearConfig::new(config.hidden_size, config.inner_size).init(device),
            output: LinearConfig::new(config.inner_size, 1).init(device),
            activation: Relu::new(),
            dropout: config.dropout,
        }
    }

    /// Value estimate `[batch]` for states `[batch, hidden]`.
    pub fn forward(&self, state: Tensor<B, 2>, mode: ExecutionMode) -> Tensor<B, 1> {
        let [batch, _] = state.dims();
        let x = self.activation.forward(self.input.forward(state));
        let x = dropout(x, self.dropout, mode);
        self.output.forward(x).reshape([batch])
    }
}
