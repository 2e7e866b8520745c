//! Batch tensors built from observations.

use burn::prelude::*;

use crate::env::Observation;
use crate::error::{AgentError, Result};
use crate::infra::angle_feature;

pub const PADDING_IDX: i64 = 0;

/// Length of a padded encoding: position of the first padding token, or the
/// full width when there is none (or it sits at position 0).
pub fn sequence_length(encoding: &[i64]) -> usize {
    match encoding.iter().position(|&token| token == PADDING_IDX) {
        Some(0) | None => encoding.len(),
        Some(position) => position,
    }
}

/// Instance order by instruction length, longest first. Ties keep batch order.
pub fn length_permutation(obs: &[Observation]) -> Vec<usize> {
    let lengths: Vec<usize> = obs
        .iter()
        .map(|ob| sequence_length(&ob.instr_encoding))
        .collect();
    let mut perm: Vec<usize> = (0..obs.len()).collect();
    perm.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
    perm
}

pub fn permute<T: Clone>(items: &[T], perm: &[usize]) -> Vec<T> {
    perm.iter().map(|&i| items[i].clone()).collect()
}

/// Instructions in length order with their attention mask.
pub struct SortedBatch<B: Backend> {
    pub tokens: Tensor<B, 2, Int>,
    pub lang_mask: Tensor<B, 2>,
    pub lengths: Vec<usize>,
    pub perm: Vec<usize>,
}

pub fn sort_batch<B: Backend>(obs: &[Observation], device: &B::Device) -> SortedBatch<B> {
    let perm = length_permutation(obs);
    let width = obs
        .iter()
        .map(|ob| ob.instr_encoding.len())
        .max()
        .unwrap_or(0);

    let mut tokens = Vec::with_capacity(obs.len() * width);
    let mut mask = Vec::with_capacity(obs.len() * width);
    let mut lengths = Vec::with_capacity(obs.len());
    for &i in &perm {
        let encoding = &obs[i].instr_encoding;
        lengths.push(sequence_length(encoding));
        for j in 0..width {
            let token = encoding.get(j).copied().unwrap_or(PADDING_IDX);
            tokens.push(token);
            mask.push(if token == PADDING_IDX { 0.0f32 } else { 1.0 });
        }
    }

    SortedBatch {
        tokens: Tensor::from_data(TensorData::new(tokens, [obs.len(), width]), device),
        lang_mask: Tensor::from_data(TensorData::new(mask, [obs.len(), width]), device),
        lengths,
        perm,
    }
}

/// Angle encoding of each instance's current heading and elevation.
pub fn action_angle_features<B: Backend>(
    obs: &[Observation],
    angle_feat_size: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let values: Vec<f32> = obs
        .iter()
        .flat_map(|ob| angle_feature(ob.heading, ob.elevation, angle_feat_size))
        .collect();
    Tensor::from_data(TensorData::new(values, [obs.len(), angle_feat_size]), device)
}

/// Candidate features padded to the widest instance plus a zero stop slot.
pub struct CandidateBatch<B: Backend> {
    pub feats: Tensor<B, 3>,
    pub mask: Tensor<B, 2>,
    /// Candidates per instance including the stop slot
    pub lengths: Vec<usize>,
}

pub fn candidate_features<B: Backend>(
    obs: &[Observation],
    feat_dim: usize,
    device: &B::Device,
) -> Result<CandidateBatch<B>> {
    let lengths: Vec<usize> = obs.iter().map(|ob| ob.candidates.len() + 1).collect();
    let max_len = lengths.iter().copied().max().unwrap_or(1);

    let mut feats = vec![0.0f32; obs.len() * max_len * feat_dim];
    let mut mask = vec![0.0f32; obs.len() * max_len];
    for (i, ob) in obs.iter().enumerate() {
        for (j, candidate) in ob.candidates.iter().enumerate() {
            if candidate.feature.len() != feat_dim {
                return Err(AgentError::Tensor(format!(
                    "candidate {} of {} has {} features, expected {}",
                    candidate.viewpoint_id,
                    ob.instr_id,
                    candidate.feature.len(),
                    feat_dim
                )));
            }
            let offset = (i * max_len + j) * feat_dim;
            feats[offset..offset + feat_dim].copy_from_slice(&candidate.feature);
        }
        for slot in mask.iter_mut().skip(i * max_len).take(lengths[i]) {
            *slot = 1.0;
        }
    }

    Ok(CandidateBatch {
        feats: Tensor::from_data(TensorData::new(feats, [obs.len(), max_len, feat_dim]), device),
        mask: Tensor::from_data(TensorData::new(mask, [obs.len(), max_len]), device),
        lengths,
    })
}

pub(crate) fn to_f32_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| AgentError::Tensor(format!("{:?}", e)))
}

pub(crate) fn to_index_vec<B: Backend, const D: usize>(
    tensor: Tensor<B, D, Int>,
) -> Result<Vec<usize>> {
    let values = tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| AgentError::Tensor(format!("{:?}", e)))?;
    Ok(values.into_iter().map(|v| v.max(0) as usize).collect())
}
