use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::env::{NavigationEnv, NdtwEvaluator, Observation};
use crate::error::{AgentError, Result};

use super::checkpoint::{self, CRITIC, Checkpoint, STATE_ENCODER};
use super::clip::clip_grad_norm;
use super::confidence::ConfidenceEstimator;
use super::config::{AgentConfig, Feedback};
use super::encoder::{CrossModalEncoder, ExecutionMode};
use super::metrics::TrainingMetrics;
use super::model::Critic;
use super::reward::RewardShaper;

/// Viewpoint id, heading and elevation after a step.
pub type PathStep = (String, f32, f32);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trajectory {
    pub instr_id: String,
    pub path: Vec<PathStep>,
    /// One entry per step the instance was still active
    pub confidence: Vec<f32>,
}

impl Trajectory {
    pub fn start(ob: &Observation) -> Self {
        Self {
            instr_id: ob.instr_id.clone(),
            path: vec![(ob.viewpoint.clone(), ob.heading, ob.elevation)],
            confidence: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEntry {
    pub instr_id: String,
    pub trajectory: Vec<PathStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Vec<f32>>,
}

/// Navigation agent: owns the environment, both trainable components and their optimizers.
pub struct Agent<B, M, E>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    E: NavigationEnv,
{
    pub(super) env: E,
    pub(super) encoder: M,
    pub(super) critic: Critic<B>,
    encoder_optim: OptimizerAdaptor<Adam, M, B>,
    critic_optim: OptimizerAdaptor<Adam, Critic<B>, B>,
    pub(super) config: AgentConfig,
    pub(super) confidence: ConfidenceEstimator,
    pub(super) rewards: RewardShaper,
    pub(super) ndtw: NdtwEvaluator,
    pub(super) device: B::Device,
    pub(super) feedback: Feedback,
    pub(super) training: bool,
    /// Loss accumulated since the last optimizer step
    pub(super) loss: Option<Tensor<B, 1>>,
    pub(super) losses: Vec<f32>,
    pub(super) metrics: TrainingMetrics,
    results: BTreeMap<String, Trajectory>,
}

impl<B, M, E> Agent<B, M, E>
where
    B: AutodiffBackend,
    M: CrossModalEncoder<B> + AutodiffModule<B>,
    M::InnerModule: CrossModalEncoder<B::InnerBackend>,
    E: NavigationEnv,
{
    pub fn new(
        env: E,
        encoder: M,
        critic: Critic<B>,
        ndtw: NdtwEvaluator,
        config: AgentConfig,
        device: B::Device,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            env,
            encoder,
            critic,
            encoder_optim: AdamConfig::new().init(),
            critic_optim: AdamConfig::new().init(),
            confidence: ConfidenceEstimator::new(config.mc_dropout_samples)?,
            rewards: RewardShaper::new(config.success_distance),
            ndtw,
            device,
            feedback: Feedback::Argmax,
            training: false,
            loss: None,
            losses: Vec::new(),
            metrics: TrainingMetrics::default(),
            results: BTreeMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    pub fn encoder(&self) -> &M {
        &self.encoder
    }

    pub fn critic(&self) -> &Critic<B> {
        &self.critic
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn feedback(&self) -> Feedback {
        self.feedback
    }

    pub fn set_feedback(&mut self, feedback: Feedback) {
        self.feedback = feedback;
    }

    /// Pending loss per rollout, divided by the episode length.
    pub fn losses(&self) -> &[f32] {
        &self.losses
    }

    pub fn pending_loss(&self) -> Option<&Tensor<B, 1>> {
        self.loss.as_ref()
    }

    pub(super) fn execution_mode(&self) -> ExecutionMode {
        if self.training {
            ExecutionMode::Stochastic
        } else {
            ExecutionMode::Deterministic
        }
    }

    pub(super) fn add_loss(&mut self, loss: Tensor<B, 1>) {
        self.loss = Some(match self.loss.take() {
            Some(pending) => pending + loss,
            None => loss,
        });
    }

    /// Clears the pending loss and switches to training mode.
    pub fn zero_grad(&mut self) {
        self.loss = None;
        self.losses.clear();
        self.training = true;
    }

    /// Runs the rollouts of one training iteration, adding to the pending loss.
    pub fn accumulate_gradient(&mut self, feedback: Feedback) -> Result<()> {
        match feedback {
            Feedback::Teacher => {
                self.feedback = Feedback::Teacher;
                self.rollout(Some(self.config.teacher_weight), false, true)?;
            }
            Feedback::Sample => {
                if self.config.ml_weight != 0.0 {
                    self.feedback = Feedback::Teacher;
                    self.rollout(Some(self.config.ml_weight), false, true)?;
                }
                self.feedback = Feedback::Sample;
                self.rollout(None, true, true)?;
            }
            Feedback::Argmax => {
                return Err(AgentError::InvalidConfig(
                    "argmax feedback cannot drive training".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Backpropagates the pending loss, clips the encoder gradients by their
    /// global norm and steps both optimizers.
    pub fn optim_step(&mut self) -> Result<()> {
        let Some(loss) = self.loss.take() else {
            debug!("No pending loss, skipping optimizer step");
            return Ok(());
        };

        let mut grads = loss.backward();
        let mut encoder_grads = GradientsParams::from_module(&mut grads, &self.encoder);
        let critic_grads = GradientsParams::from_module(&mut grads, &self.critic);

        let norm = clip_grad_norm::<B, M>(&self.encoder, &mut encoder_grads, self.config.max_grad_norm);
        trace!("Encoder gradient norm {:.4}", norm);

        self.encoder = self
            .encoder_optim
            .step(self.config.lr, self.encoder.clone(), encoder_grads);
        self.critic = self
            .critic_optim
            .step(self.config.lr, self.critic.clone(), critic_grads);
        Ok(())
    }

    pub fn train(&mut self, n_iters: usize, feedback: Feedback) -> Result<()> {
        if feedback == Feedback::Argmax {
            return Err(AgentError::InvalidConfig(
                "argmax feedback cannot drive training".to_string(),
            ));
        }

        info!("Training for {} iterations with {} feedback", n_iters, feedback);
        self.zero_grad();

        for iter in 1..=n_iters {
            self.loss = None;
            self.accumulate_gradient(feedback)?;
            self.optim_step()?;

            self.metrics.iteration += 1;
            if self.config.log_interval > 0 && iter % self.config.log_interval == 0 {
                self.metrics.log_to_console();
            }
        }
        Ok(())
    }

    /// Evaluates without gradient steps.
    ///
    /// With `iters` set, runs that many shuffled batches. Otherwise walks the
    /// split in order until an instruction comes around a second time.
    pub fn test(&mut self, feedback: Feedback, iters: Option<usize>) -> Result<()> {
        self.feedback = feedback;
        self.training = false;
        self.loss = None;
        self.losses.clear();
        self.results.clear();
        self.env.reset_epoch(iters.is_some());

        match iters {
            Some(n) => {
                for _ in 0..n {
                    for trajectory in self.rollout(None, false, true)? {
                        self.results.insert(trajectory.instr_id.clone(), trajectory);
                    }
                    self.loss = None;
                }
            }
            None => loop {
                let mut looped = false;
                for trajectory in self.rollout(None, false, true)? {
                    if self.results.contains_key(&trajectory.instr_id) {
                        looped = true;
                    } else {
                        self.results.insert(trajectory.instr_id.clone(), trajectory);
                    }
                }
                self.loss = None;
                if looped {
                    break;
                }
            },
        }

        info!(
            "Evaluated {} instructions with {} feedback",
            self.results.len(),
            feedback
        );
        Ok(())
    }

    pub fn trajectories(&self) -> impl Iterator<Item = &Trajectory> {
        self.results.values()
    }

    pub fn results(&self, with_confidence: bool) -> Vec<ResultEntry> {
        self.results
            .values()
            .map(|trajectory| ResultEntry {
                instr_id: trajectory.instr_id.clone(),
                trajectory: trajectory.path.clone(),
                confidence: with_confidence.then(|| trajectory.confidence.clone()),
            })
            .collect()
    }

    pub fn write_results(&self, path: impl AsRef<Path>, with_confidence: bool) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &self.results(with_confidence))?;
        info!("Wrote {} results to {}", self.results.len(), path.display());
        Ok(())
    }

    pub fn save(&self, epoch: usize, path: impl AsRef<Path>) -> Result<()> {
        let mut snapshot = Checkpoint::default();
        snapshot.components.insert(
            STATE_ENCODER.to_string(),
            checkpoint::snapshot::<B, _, _>(epoch + 1, &self.encoder, &self.encoder_optim)?,
        );
        snapshot.components.insert(
            CRITIC.to_string(),
            checkpoint::snapshot::<B, _, _>(epoch + 1, &self.critic, &self.critic_optim)?,
        );
        snapshot.save(path.as_ref())?;
        info!("Saved checkpoint for epoch {} to {}", epoch, path.as_ref().display());
        Ok(())
    }

    /// Restores both components and returns the epoch the snapshot was taken at.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let snapshot = Checkpoint::load(path.as_ref())?;
        let encoder_state = snapshot.component(STATE_ENCODER)?;
        let critic_state = snapshot.component(CRITIC)?;

        self.encoder = checkpoint::restore_module::<B, _>(
            self.encoder.clone(),
            STATE_ENCODER,
            &encoder_state.parameters,
            &self.device,
        )?;
        self.critic = checkpoint::restore_module::<B, _>(
            self.critic.clone(),
            CRITIC,
            &critic_state.parameters,
            &self.device,
        )?;

        if self.config.load_optimizer {
            self.encoder_optim = checkpoint::restore_optimizer::<B, M, _>(
                AdamConfig::new().init(),
                &encoder_state.optimizer,
                &self.device,
            )?;
            self.critic_optim = checkpoint::restore_optimizer::<B, Critic<B>, _>(
                AdamConfig::new().init(),
                &critic_state.optimizer,
                &self.device,
            )?;
        }

        let epoch = encoder_state.epoch.saturating_sub(1);
        info!("Loaded checkpoint from {} (epoch {})", path.as_ref().display(), epoch);
        Ok(epoch)
    }
}
