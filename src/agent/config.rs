use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// How actions are chosen during a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Feedback {
    /// Follow the oracle action (teacher forcing).
    Teacher,
    /// Greedy decoding with Monte Carlo dropout confidence.
    Argmax,
    /// Sample from the masked policy.
    Sample,
}

impl FromStr for Feedback {
    type Err = AgentError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "teacher" => Ok(Feedback::Teacher),
            "argmax" => Ok(Feedback::Argmax),
            "sample" => Ok(Feedback::Sample),
            other => Err(AgentError::InvalidConfig(format!("unknown feedback {}", other))),
        }
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Feedback::Teacher => "teacher",
            Feedback::Argmax => "argmax",
            Feedback::Sample => "sample",
        };
        f.write_str(name)
    }
}

/// Divisor applied to the actor-critic loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossNormalization {
    /// Number of active (unmasked) steps.
    Total,
    /// Batch size.
    Batch,
    None,
}

/// Agent hyperparameters.
#[derive(Debug, Config)]
pub struct AgentConfig {
    /// Maximum number of decisions per rollout
    pub episode_len: usize,
    /// Learning rate shared by both optimizers
    pub lr: f64,
    /// Discount factor
    pub gamma: f32,
    /// Imitation weight for teacher-only training
    pub teacher_weight: f32,
    /// Imitation weight mixed into reinforcement training
    pub ml_weight: f32,
    /// Entropy bonus coefficient (sample feedback only)
    pub entropy_coef: f32,
    /// Gradient norm clip applied to the state encoder
    pub max_grad_norm: f32,
    pub normalize_loss: LossNormalization,
    /// Label for instances that no longer take part in the imitation loss
    pub ignore_id: i64,
    /// Stochastic passes per step for the confidence ensemble
    pub mc_dropout_samples: usize,
    /// Stopping within this many meters of the goal counts as success
    pub success_distance: f32,
    /// Restore optimizer state together with the weights
    pub load_optimizer: bool,
    pub angle_feat_size: usize,
    /// Training iterations between metric summaries
    pub log_interval: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            episode_len: 20,
            lr: 1e-5,
            gamma: 0.9,
            teacher_weight: 1.0,
            ml_weight: 0.2,
            entropy_coef: 0.01,
            max_grad_norm: 40.0,
            normalize_loss: LossNormalization::Total,
            ignore_id: -100,
            mc_dropout_samples: 10,
            success_distance: 3.0,
            load_optimizer: false,
            angle_feat_size: 128,
            log_interval: 100,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.episode_len == 0 {
            return Err(AgentError::InvalidConfig("episode_len must be positive".to_string()));
        }
        if self.mc_dropout_samples < 2 {
            return Err(AgentError::InvalidConfig(format!(
                "mc_dropout_samples must be at least 2, got {}",
                self.mc_dropout_samples
            )));
        }
        if self.ignore_id >= 0 {
            return Err(AgentError::InvalidConfig(
                "ignore_id must not collide with a candidate index".to_string(),
            ));
        }
        if self.max_grad_norm <= 0.0 {
            return Err(AgentError::InvalidConfig("max_grad_norm must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.episode_len, 20);
        assert_eq!(config.gamma, 0.9);
        assert_eq!(config.ignore_id, -100);
        assert_eq!(config.mc_dropout_samples, 10);
        assert_eq!(config.normalize_loss, LossNormalization::Total);
        assert!(!config.load_optimizer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_mc_sample_is_rejected() {
        let config = AgentConfig {
            mc_dropout_samples: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::InvalidConfig(_))));
    }

    #[test]
    fn test_feedback_parsing() {
        assert_eq!("Sample".parse::<Feedback>().unwrap(), Feedback::Sample);
        assert_eq!("argmax".parse::<Feedback>().unwrap(), Feedback::Argmax);
        assert!("beam".parse::<Feedback>().is_err());
        assert_eq!(Feedback::Teacher.to_string(), "teacher");
    }
}
