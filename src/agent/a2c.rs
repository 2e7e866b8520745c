use burn::prelude::*;

use crate::error::{AgentError, Result};

use super::config::LossNormalization;
use super::encoder::ExecutionMode;
use super::features::to_f32_vec;
use super::model::Critic;
use super::state::EpisodeState;

/// Coefficient on the squared value error.
const VALUE_LOSS_COEF: f32 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct A2cSettings {
    pub gamma: f32,
    /// Entropy bonus; `None` outside of sampled rollouts.
    pub entropy_coef: Option<f32>,
    pub normalize: LossNormalization,
}

pub struct A2cOutcome<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub policy_loss: f32,
    pub critic_loss: f32,
    /// Number of unmasked steps
    pub total: f32,
}

/// Discounted returns per step, walking backwards from the bootstrap values.
pub fn discounted_returns(rewards: &[Vec<f32>], bootstrap: &[f32], gamma: f32) -> Vec<Vec<f32>> {
    let mut running = bootstrap.to_vec();
    let mut returns = vec![Vec::new(); rewards.len()];
    for t in (0..rewards.len()).rev() {
        for (g, &r) in running.iter_mut().zip(&rewards[t]) {
            *g = *g * gamma + r;
        }
        returns[t] = running.clone();
    }
    returns
}

pub fn a2c_loss<B: Backend>(
    critic: &Critic<B>,
    episode: &EpisodeState<B>,
    bootstrap: &[f32],
    settings: &A2cSettings,
    mode: ExecutionMode,
    device: &B::Device,
) -> Result<A2cOutcome<B>> {
    let steps = episode.rewards.len();
    if episode.hidden_states.len() != steps || episode.policy_log_probs.len() != steps {
        return Err(AgentError::Tensor(format!(
            "rollout history out of sync: {} rewards, {} states, {} log-probs",
            steps,
            episode.hidden_states.len(),
            episode.policy_log_probs.len()
        )));
    }
    if settings.entropy_coef.is_some() && episode.entropies.len() != steps {
        return Err(AgentError::Tensor(format!(
            "rollout history out of sync: {} rewards, {} entropies",
            steps,
            episode.entropies.len()
        )));
    }

    let returns = discounted_returns(&episode.rewards, bootstrap, settings.gamma);

    let mut policy_loss = Tensor::<B, 1>::zeros([1], device);
    let mut value_loss = Tensor::<B, 1>::zeros([1], device);
    let mut entropy_loss = Tensor::<B, 1>::zeros([1], device);
    let mut total = 0.0;

    for t in (0..steps).rev() {
        let mask = Tensor::<B, 1>::from_floats(episode.masks[t].as_slice(), device);
        let target = Tensor::<B, 1>::from_floats(returns[t].as_slice(), device);
        let value = critic.forward(episode.hidden_states[t].clone(), mode);

        let advantage = (target.clone() - value.clone()).detach();
        policy_loss = policy_loss
            + (episode.policy_log_probs[t].clone().neg() * advantage * mask.clone()).sum();
        value_loss = value_loss + ((target - value).powf_scalar(2.0) * mask.clone()).sum();

        if let Some(coef) = settings.entropy_coef {
            entropy_loss = entropy_loss
                + (episode.entropies[t].clone() * mask).sum().mul_scalar(-coef);
        }

        total += episode.masks[t].iter().sum::<f32>();
    }

    let divisor = match settings.normalize {
        LossNormalization::Total => total.max(1.0),
        LossNormalization::Batch => episode.batch_size().max(1) as f32,
        LossNormalization::None => 1.0,
    };

    let critic_loss = to_f32_vec(value_loss.clone())?.first().copied().unwrap_or(0.0);
    let policy_value = to_f32_vec(policy_loss.clone())?.first().copied().unwrap_or(0.0);

    let loss = (policy_loss + value_loss.mul_scalar(VALUE_LOSS_COEF) + entropy_loss)
        .div_scalar(divisor);

    Ok(A2cOutcome {
        loss,
        policy_loss: policy_value / divisor,
        critic_loss,
        total,
    })
}
