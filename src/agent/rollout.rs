use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::Distribution;
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, trace};

use crate::env::{MIN_INSTRUCTION_WIDTH, NavigationEnv, Observation, PrimitiveAction};
use crate::error::{AgentError, Result};
use crate::infra::VIEWS_PER_LEVEL;

use super::a2c::{A2cSettings, a2c_loss};
use super::config::Feedback;
use super::encoder::{CrossModalEncoder, LanguageRequest, VisualRequest};
use super::features::{
    action_angle_features, candidate_features, permute, sort_batch, to_f32_vec, to_index_vec,
};
use super::lifecycle::{Agent, Trajectory};
use super::reward::PathSignal;
use super::state::{EpisodeState, NavAction};
use super::teacher::{TeacherLabel, imitation_loss, teacher_labels};

/// Keeps Gumbel noise finite at both ends of the uniform draw.
const GUMBEL_EPSILON: f64 = 1e-6;

impl<B, M, E> Agent<B, M, E>
where
    B: AutodiffBackend,
    M: CrossModalEncoder<B> + AutodiffModule<B>,
    M::InnerModule: CrossModalEncoder<B::InnerBackend>,
    E: NavigationEnv,
{
    /// Runs one batch of episodes with the current feedback mode.
    ///
    /// With `il_weight` the teacher cross-entropy is added to the pending loss;
    /// with `use_rl` (sampled rollouts only) the actor-critic loss is as well.
    /// Trajectories come back in instruction-length order.
    pub fn rollout(
        &mut self,
        il_weight: Option<f32>,
        use_rl: bool,
        reset: bool,
    ) -> Result<Vec<Trajectory>> {
        let use_rl = use_rl && self.feedback == Feedback::Sample;
        let mode = self.execution_mode();
        let device = self.device.clone();

        let obs = if reset {
            self.env.reset()
        } else {
            self.env.observations()
        };
        let batch_size = obs.len();
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let sorted = sort_batch::<B>(&obs, &device);
        let [_, width] = sorted.tokens.dims();
        if width < MIN_INSTRUCTION_WIDTH {
            return Err(AgentError::InvalidConfig(format!(
                "instruction encodings have width {}, need at least {}",
                width, MIN_INSTRUCTION_WIDTH
            )));
        }
        let perm = sorted.perm.clone();
        let lang_mask = sorted.lang_mask.clone();
        let mut perm_obs = permute(&obs, &perm);

        let language = self.encoder.encode_language(
            LanguageRequest {
                tokens: sorted.tokens,
                mask: sorted.lang_mask,
            },
            mode,
        )?;
        let mut state = language.state;
        let instruction = language.instruction;

        let mut trajectories: Vec<Trajectory> = perm_obs.iter().map(Trajectory::start).collect();
        let initial_ndtw = if use_rl {
            self.path_ndtw(&perm_obs, &trajectories)?
        } else {
            vec![0.0; batch_size]
        };
        let mut episode = EpisodeState::<B>::new(
            perm.clone(),
            perm_obs.iter().map(|ob| ob.distance).collect(),
            initial_ndtw,
        );
        let mut ml_loss: Option<Tensor<B, 1>> = None;

        for t in 0..self.config.episode_len {
            let (request, cand_lengths) =
                self.visual_request(&perm_obs, &instruction, &state, &lang_mask)?;
            let stop_slots: Vec<usize> = cand_lengths.iter().map(|len| len - 1).collect();

            let response = self.encoder.step_visual(request.clone(), mode)?;
            state = response.state;
            let (logits, invalid) = mask_invalid(response.logits, request.cand_mask.clone());

            let mut step_confidence = match response.confidence {
                Some(confidence) => to_f32_vec(confidence)?,
                None => vec![0.0; batch_size],
            };

            let choices: Vec<usize> = match self.feedback {
                Feedback::Teacher => {
                    let labels = teacher_labels(&perm_obs, episode.states())?;
                    let loss = imitation_loss(logits, &labels, &stop_slots, self.config.ignore_id);
                    ml_loss = Some(accumulate(ml_loss, loss));
                    labels
                        .iter()
                        .zip(&stop_slots)
                        .map(|(label, &stop)| match label {
                            TeacherLabel::Candidate(index) => *index,
                            _ => stop,
                        })
                        .collect()
                }
                Feedback::Argmax => {
                    let labels = teacher_labels(&perm_obs, episode.states())?;
                    let loss = imitation_loss(logits.clone(), &labels, &stop_slots, self.config.ignore_id);
                    ml_loss = Some(accumulate(ml_loss, loss));

                    step_confidence = self.confidence.estimate(&self.encoder, &request)?;

                    let chosen = logits.clone().argmax(1);
                    let log_probs = log_softmax(logits, 1)
                        .gather(1, chosen.clone())
                        .reshape([batch_size]);
                    episode.hidden_states.push(state.clone());
                    episode.policy_log_probs.push(log_probs);
                    to_index_vec(chosen)?
                }
                Feedback::Sample => {
                    let noise = Tensor::<B, 2>::random(
                        logits.shape(),
                        Distribution::Uniform(GUMBEL_EPSILON, 1.0 - GUMBEL_EPSILON),
                        &device,
                    );
                    let gumbel = noise.log().neg().log().neg();
                    let chosen = (logits.clone().detach() + gumbel).argmax(1);

                    let log_probs = log_softmax(logits, 1);
                    let entropy = (log_probs.clone().exp() * log_probs.clone().mask_fill(invalid, 0.0))
                        .sum_dim(1)
                        .reshape([batch_size])
                        .neg();
                    let chosen_log_probs = log_probs.gather(1, chosen.clone()).reshape([batch_size]);

                    episode.hidden_states.push(state.clone());
                    episode.policy_log_probs.push(chosen_log_probs);
                    episode.entropies.push(entropy);
                    to_index_vec(chosen)?
                }
            };

            // Stop slot, ignored label or an already stopped instance
            let actions: Vec<NavAction> = choices
                .iter()
                .enumerate()
                .map(|(i, &choice)| {
                    if episode.state(i).is_stopped() || choice >= stop_slots[i] {
                        NavAction::Stop
                    } else {
                        NavAction::Candidate(choice)
                    }
                })
                .collect();

            for (i, trajectory) in trajectories.iter_mut().enumerate() {
                if episode.state(i).is_active() {
                    trajectory.confidence.push(step_confidence[i]);
                }
            }

            self.make_equiv_action(&actions, &perm_obs, &perm, &mut trajectories)?;
            perm_obs = permute(&self.env.observations(), &perm);

            if use_rl {
                self.shape_rewards(&mut episode, &actions, &perm_obs, &trajectories)?;
            }

            episode.advance(&actions);
            trace!(
                "Step {}: {} of {} instances still active",
                t,
                episode.active_count(),
                batch_size
            );
            if episode.all_stopped() {
                break;
            }
        }

        if use_rl {
            // Bootstrap from the state one visual step past the last decision
            let (request, _) = self.visual_request(&perm_obs, &instruction, &state, &lang_mask)?;
            let last = self.encoder.step_visual(request, mode)?;
            let last_values = to_f32_vec(self.critic.forward(last.state, mode).detach())?;
            let bootstrap: Vec<f32> = last_values
                .iter()
                .zip(episode.states())
                .map(|(&value, s)| if s.is_active() { value } else { 0.0 })
                .collect();

            let settings = A2cSettings {
                gamma: self.config.gamma,
                entropy_coef: (self.feedback == Feedback::Sample).then_some(self.config.entropy_coef),
                normalize: self.config.normalize_loss,
            };
            let outcome = a2c_loss(&self.critic, &episode, &bootstrap, &settings, mode, &device)?;
            self.metrics
                .record_actor_critic(outcome.policy_loss, outcome.critic_loss, outcome.total);
            self.add_loss(outcome.loss);
        }

        if let (Some(weight), Some(ml_loss)) = (il_weight, ml_loss) {
            let weighted = ml_loss.mul_scalar(weight / batch_size as f32);
            let value = to_f32_vec(weighted.clone())?.first().copied().unwrap_or(0.0);
            self.metrics.record_imitation(value);
            self.add_loss(weighted);
        }

        let pending = match &self.loss {
            Some(loss) => to_f32_vec(loss.clone())?.first().copied().unwrap_or(0.0),
            None => 0.0,
        };
        self.losses.push(pending / self.config.episode_len as f32);

        for (trajectory, ob) in trajectories.iter().zip(&perm_obs) {
            self.metrics
                .record_trajectory(trajectory.path.len(), ob.distance < self.config.success_distance);
        }
        self.metrics.record_rollout();

        debug!(
            "Rollout with {} feedback: {} instances, mean path length {:.2}",
            self.feedback,
            batch_size,
            trajectories.iter().map(|t| t.path.len()).sum::<usize>() as f32 / batch_size as f32
        );

        Ok(trajectories)
    }

    /// Visual request for the current step, plus candidate counts including the stop slot.
    fn visual_request(
        &self,
        perm_obs: &[Observation],
        instruction: &Tensor<B, 3>,
        state: &Tensor<B, 2>,
        lang_mask: &Tensor<B, 2>,
    ) -> Result<(VisualRequest<B>, Vec<usize>)> {
        let feat_dim = self.env.feature_size() + self.config.angle_feat_size;
        let candidates = candidate_features::<B>(perm_obs, feat_dim, &self.device)?;

        // Position 0 of the instruction carries the recurrent state
        let [batch, seq_len, hidden] = instruction.dims();
        let instruction = Tensor::cat(
            vec![
                state.clone().unsqueeze_dim::<3>(1),
                instruction.clone().slice([0..batch, 1..seq_len, 0..hidden]),
            ],
            1,
        );

        let request = VisualRequest {
            instruction,
            lang_mask: lang_mask.clone(),
            action_feats: action_angle_features(perm_obs, self.config.angle_feat_size, &self.device),
            cand_feats: candidates.feats,
            cand_mask: candidates.mask,
        };
        Ok((request, candidates.lengths))
    }

    /// Turns candidate choices into primitive simulator actions and records the new positions.
    fn make_equiv_action(
        &mut self,
        actions: &[NavAction],
        perm_obs: &[Observation],
        perm: &[usize],
        trajectories: &mut [Trajectory],
    ) -> Result<()> {
        for (i, action) in actions.iter().enumerate() {
            let NavAction::Candidate(choice) = *action else {
                continue;
            };
            let ob = &perm_obs[i];
            let env_index = perm[i];
            let candidate = ob
                .candidates
                .get(choice)
                .ok_or_else(|| AgentError::SimulatorMismatch {
                    instr_id: ob.instr_id.clone(),
                    expected: format!("candidate {}", choice),
                    found: format!("{} candidates", ob.candidates.len()),
                })?;

            let target_level = candidate.point_id / VIEWS_PER_LEVEL;
            let mut level = ob.view_index / VIEWS_PER_LEVEL;
            while level < target_level {
                self.env.make_action(env_index, PrimitiveAction::LookUp);
                level += 1;
            }
            while level > target_level {
                self.env.make_action(env_index, PrimitiveAction::LookDown);
                level -= 1;
            }

            let mut turns = 0;
            loop {
                let view_index = self.env.sim_state(env_index).view_index;
                if view_index == candidate.point_id {
                    break;
                }
                if turns == VIEWS_PER_LEVEL {
                    return Err(AgentError::SimulatorMismatch {
                        instr_id: ob.instr_id.clone(),
                        expected: format!("view {}", candidate.point_id),
                        found: format!("view {}", view_index),
                    });
                }
                self.env.make_action(env_index, PrimitiveAction::TurnRight);
                turns += 1;
            }

            let sim = self.env.sim_state(env_index);
            if sim.navigable.get(candidate.nav_index) != Some(&candidate.viewpoint_id) {
                return Err(AgentError::SimulatorMismatch {
                    instr_id: ob.instr_id.clone(),
                    expected: candidate.viewpoint_id.clone(),
                    found: sim
                        .navigable
                        .get(candidate.nav_index)
                        .cloned()
                        .unwrap_or_default(),
                });
            }

            self.env
                .make_action(env_index, PrimitiveAction::MoveTo(candidate.nav_index));
            let sim = self.env.sim_state(env_index);
            trajectories[i]
                .path
                .push((sim.viewpoint, sim.heading, sim.elevation));
        }
        Ok(())
    }

    fn shape_rewards(
        &self,
        episode: &mut EpisodeState<B>,
        actions: &[NavAction],
        perm_obs: &[Observation],
        trajectories: &[Trajectory],
    ) -> Result<()> {
        let ndtws = self.path_ndtw(perm_obs, trajectories)?;
        let mut rewards = Vec::with_capacity(perm_obs.len());
        let mut masks = Vec::with_capacity(perm_obs.len());

        for (i, ob) in perm_obs.iter().enumerate() {
            let previous = PathSignal {
                distance: episode.last_distance[i],
                ndtw: episode.last_ndtw[i],
            };
            let current = PathSignal {
                distance: ob.distance,
                ndtw: ndtws[i],
            };
            let step = self
                .rewards
                .shape(&ob.instr_id, episode.state(i), actions[i], previous, current)?;
            rewards.push(step.reward);
            masks.push(step.mask);

            episode.last_distance[i] = current.distance;
            episode.last_ndtw[i] = current.ndtw;
        }

        episode.rewards.push(rewards);
        episode.masks.push(masks);
        Ok(())
    }

    fn path_ndtw(&self, perm_obs: &[Observation], trajectories: &[Trajectory]) -> Result<Vec<f32>> {
        perm_obs
            .iter()
            .zip(trajectories)
            .map(|(ob, trajectory)| {
                let path: Vec<String> = trajectory
                    .path
                    .iter()
                    .map(|(viewpoint, _, _)| viewpoint.clone())
                    .collect();
                self.ndtw.score(&ob.scan, &path, &ob.gt_path)
            })
            .collect()
    }
}

/// Sets padded candidate slots to -inf; returns the masked logits and the padding mask.
fn mask_invalid<B: Backend>(
    logits: Tensor<B, 2>,
    cand_mask: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2, Bool>) {
    let invalid = cand_mask.equal_elem(0.0);
    (logits.mask_fill(invalid.clone(), f32::NEG_INFINITY), invalid)
}

fn accumulate<B: Backend>(total: Option<Tensor<B, 1>>, loss: Tensor<B, 1>) -> Tensor<B, 1> {
    match total {
        Some(total) => total + loss,
        None => loss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::config::AgentConfig;
    use crate::agent::encoder::{
        EncoderRequest, EncoderResponse, ExecutionMode, LanguageResponse, VisualResponse,
    };
    use crate::agent::features::tests::observation;
    use crate::agent::model::tests::small_encoder_config;
    use crate::agent::model::{Critic, CriticConfig, RecurrentEncoder};
    use crate::env::graph_env::tests::{dataset, episode};
    use crate::env::{Episode, GraphEnv, SimState};
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{Linear, LinearConfig};
    use std::cell::Cell;

    type TestBackend = Autodiff<NdArray>;
    type TestAgent = Agent<TestBackend, RecurrentEncoder<TestBackend>, GraphEnv>;

    fn agent(episodes: Vec<Episode>, batch_size: usize) -> TestAgent {
        let device: <TestBackend as Backend>::Device = Default::default();
        let env = GraphEnv::new(dataset(episodes, 4), batch_size, 4, 11).unwrap();
        let ndtw = env.ndtw_evaluator();
        let encoder = RecurrentEncoder::<TestBackend>::new(&device, &small_encoder_config());
        let critic = Critic::<TestBackend>::new(
            &device,
            &CriticConfig {
                hidden_size: 8,
                inner_size: 6,
                dropout: 0.5,
            },
        );
        let config = AgentConfig {
            episode_len: 4,
            angle_feat_size: 4,
            mc_dropout_samples: 3,
            lr: 1e-3,
            ..AgentConfig::default()
        };
        Agent::new(env, encoder, critic, ndtw, config, device).unwrap()
    }

    /// Scores slots by position: positive `direction` makes the stop slot win,
    /// negative makes the first candidate win.
    #[derive(Module, Debug)]
    struct ScriptedEncoder<B: Backend> {
        state: Linear<B>,
        hidden: usize,
        direction: f64,
    }

    impl<B: Backend> CrossModalEncoder<B> for ScriptedEncoder<B> {
        fn forward(
            &self,
            request: EncoderRequest<B>,
            _mode: ExecutionMode,
        ) -> EncoderResponse<B> {
            match request {
                EncoderRequest::Language(request) => {
                    let [batch, seq_len] = request.tokens.dims();
                    let device = request.mask.device();
                    EncoderResponse::Language(LanguageResponse {
                        state: Tensor::zeros([batch, self.hidden], &device),
                        instruction: Tensor::zeros([batch, seq_len, self.hidden], &device),
                    })
                }
                EncoderRequest::Visual(request) => {
                    let [batch, num_cands] = request.cand_mask.dims();
                    let device = request.cand_mask.device();
                    let logits = Tensor::<B, 1, Int>::arange(0..num_cands as i64, &device)
                        .float()
                        .mul_scalar(100.0 * self.direction)
                        .unsqueeze::<2>()
                        .repeat_dim(0, batch);
                    EncoderResponse::Visual(VisualResponse {
                        state: self.state.forward(Tensor::zeros([batch, self.hidden], &device)),
                        logits,
                        confidence: None,
                    })
                }
            }
        }
    }

    /// Graph environment that counts observation reads and can distort what it reports.
    struct ScriptedEnv {
        inner: GraphEnv,
        reads: Cell<usize>,
        edit_observation: Option<fn(&mut Observation)>,
        edit_sim_state: Option<fn(&mut SimState)>,
    }

    impl ScriptedEnv {
        fn new(episodes: Vec<Episode>) -> Self {
            let batch_size = episodes.len();
            Self {
                inner: GraphEnv::new(dataset(episodes, 4), batch_size, 4, 11).unwrap(),
                reads: Cell::new(0),
                edit_observation: None,
                edit_sim_state: None,
            }
        }

        fn edited(&self, mut obs: Vec<Observation>) -> Vec<Observation> {
            if let Some(edit) = self.edit_observation {
                obs.iter_mut().for_each(edit);
            }
            obs
        }
    }

    impl NavigationEnv for ScriptedEnv {
        fn reset(&mut self) -> Vec<Observation> {
            let obs = self.inner.reset();
            self.edited(obs)
        }

        fn observations(&self) -> Vec<Observation> {
            self.reads.set(self.reads.get() + 1);
            self.edited(self.inner.observations())
        }

        fn make_action(&mut self, index: usize, action: PrimitiveAction) {
            self.inner.make_action(index, action);
        }

        fn sim_state(&self, index: usize) -> SimState {
            let mut state = self.inner.sim_state(index);
            if let Some(edit) = self.edit_sim_state {
                edit(&mut state);
            }
            state
        }

        fn reset_epoch(&mut self, shuffle: bool) {
            self.inner.reset_epoch(shuffle);
        }

        fn batch_size(&self) -> usize {
            self.inner.batch_size()
        }

        fn feature_size(&self) -> usize {
            self.inner.feature_size()
        }
    }

    type ScriptedAgent = Agent<TestBackend, ScriptedEncoder<TestBackend>, ScriptedEnv>;

    fn scripted_agent(env: ScriptedEnv, direction: f64, episode_len: usize) -> ScriptedAgent {
        let device: <TestBackend as Backend>::Device = Default::default();
        let ndtw = env.inner.ndtw_evaluator();
        let encoder = ScriptedEncoder {
            state: LinearConfig::new(8, 8).init(&device),
            hidden: 8,
            direction,
        };
        let critic = Critic::<TestBackend>::new(
            &device,
            &CriticConfig {
                hidden_size: 8,
                inner_size: 6,
                dropout: 0.0,
            },
        );
        let config = AgentConfig {
            episode_len,
            angle_feat_size: 4,
            mc_dropout_samples: 3,
            ..AgentConfig::default()
        };
        Agent::new(env, encoder, critic, ndtw, config, device).unwrap()
    }

    fn viewpoints(trajectory: &Trajectory) -> Vec<&str> {
        trajectory.path.iter().map(|(vp, _, _)| vp.as_str()).collect()
    }

    #[test]
    fn test_teacher_rollout_at_goal_stops_immediately() {
        let mut agent = agent(
            vec![
                episode("short", &["c"], &[1, 2, 0, 0]),
                episode("long", &["c"], &[1, 2, 3, 0]),
            ],
            2,
        );
        agent.set_feedback(Feedback::Teacher);
        let trajectories = agent.rollout(Some(1.0), false, true).unwrap();

        // Longest instruction first
        assert_eq!(trajectories[0].instr_id, "long");
        assert_eq!(trajectories[1].instr_id, "short");
        for trajectory in &trajectories {
            assert_eq!(viewpoints(trajectory), vec!["c"]);
            assert_eq!(trajectory.confidence.len(), 1);
        }
        assert!(agent.pending_loss().is_some());
        assert_eq!(agent.losses().len(), 1);
    }

    #[test]
    fn test_teacher_rollout_follows_shortest_path() {
        let mut agent = agent(
            vec![
                episode("forward", &["a", "b", "c"], &[1, 2, 3]),
                episode("turn", &["b", "d"], &[4, 5, 0]),
            ],
            2,
        );
        agent.set_feedback(Feedback::Teacher);
        let trajectories = agent.rollout(Some(1.0), false, true).unwrap();

        let forward = trajectories.iter().find(|t| t.instr_id == "forward").unwrap();
        let turn = trajectories.iter().find(|t| t.instr_id == "turn").unwrap();
        assert_eq!(viewpoints(forward), vec!["a", "b", "c"]);
        assert_eq!(viewpoints(turn), vec!["b", "d"]);
        assert_eq!(forward.confidence.len(), 3);
        assert_eq!(turn.confidence.len(), 2);
    }

    #[test]
    fn test_argmax_evaluation_covers_split_once() {
        let mut agent = agent(
            vec![
                episode("e1", &["a", "b", "c"], &[1, 2, 3]),
                episode("e2", &["b", "d"], &[4, 5, 0]),
                episode("e3", &["c", "b"], &[6, 0, 0]),
            ],
            2,
        );
        agent.test(Feedback::Argmax, None).unwrap();

        let results = agent.results(true);
        let ids: Vec<&str> = results.iter().map(|r| r.instr_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
        for trajectory in agent.trajectories() {
            assert!(trajectory.path.len() <= agent.config().episode_len + 1);
            assert!(!trajectory.confidence.is_empty());
            assert!(trajectory.confidence.iter().all(|c| c.is_finite()));
        }
        assert!(agent.results(false).iter().all(|r| r.confidence.is_none()));
    }

    #[test]
    fn test_sampled_training_steps_both_losses() {
        let mut agent = agent(
            vec![
                episode("e1", &["a", "b", "c"], &[1, 2, 3]),
                episode("e2", &["b", "d"], &[4, 5, 0]),
            ],
            2,
        );
        agent.train(2, Feedback::Sample).unwrap();

        assert_eq!(agent.metrics().iteration, 2);
        // One imitation and one sampled rollout per iteration
        assert_eq!(agent.losses().len(), 4);
        assert_eq!(agent.metrics().rl_loss.len(), 2);
        assert_eq!(agent.metrics().il_loss.len(), 2);
        assert!(agent.losses().iter().all(|l| l.is_finite()));
        assert!(agent.pending_loss().is_none());
    }

    #[test]
    fn test_padded_slots_never_win_argmax() {
        let device: <TestBackend as Backend>::Device = Default::default();
        let obs = vec![observation("one", &[1, 2], 1), observation("three", &[1, 2], 3)];
        let batch = candidate_features::<TestBackend>(&obs, 2, &device).unwrap();
        assert_eq!(batch.lengths, vec![2, 4]);

        // Later slots score higher, so padding would win if it were left unmasked
        let logits = Tensor::<TestBackend, 1, Int>::arange(0..4, &device)
            .float()
            .unsqueeze::<2>()
            .repeat_dim(0, 2);
        let (masked, _) = mask_invalid(logits, batch.mask);
        let chosen = to_index_vec(masked.argmax(1)).unwrap();

        // Each row lands on its own stop slot
        let stop_slots: Vec<usize> = batch.lengths.iter().map(|len| len - 1).collect();
        assert_eq!(chosen, stop_slots);
    }

    #[test]
    fn test_argmax_rollout_exits_once_every_instance_stops() {
        let env = ScriptedEnv::new(vec![
            episode("e1", &["c"], &[1, 2, 0]),
            episode("e2", &["c"], &[1, 2, 3]),
        ]);
        let mut agent = scripted_agent(env, 1.0, 3);
        agent.set_feedback(Feedback::Argmax);
        let trajectories = agent.rollout(None, false, true).unwrap();

        // A single visual step, then the loop breaks
        assert_eq!(agent.env().reads.get(), 1);
        for trajectory in &trajectories {
            assert_eq!(viewpoints(trajectory), vec!["c"]);
            assert_eq!(trajectory.confidence.len(), 1);
            // Identical ensemble passes with one dominant slot
            assert!((trajectory.confidence[0] - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_rollout_runs_every_step_while_instances_move() {
        let env = ScriptedEnv::new(vec![episode("e1", &["a", "b", "c"], &[1, 2, 3])]);
        let mut agent = scripted_agent(env, -1.0, 3);
        agent.set_feedback(Feedback::Argmax);
        let trajectories = agent.rollout(None, false, true).unwrap();

        assert_eq!(agent.env().reads.get(), 3);
        // First candidate each time: b from a, a from b
        assert_eq!(viewpoints(&trajectories[0]), vec!["a", "b", "a", "b"]);
        assert_eq!(trajectories[0].confidence.len(), 3);
    }

    #[test]
    fn test_wrong_navigable_viewpoint_is_reported() {
        let mut env = ScriptedEnv::new(vec![episode("e1", &["a", "b", "c"], &[1, 2, 3])]);
        env.edit_sim_state = Some(|state| {
            for viewpoint in state.navigable.iter_mut().skip(1) {
                *viewpoint = "elsewhere".to_string();
            }
        });
        let mut agent = scripted_agent(env, 1.0, 3);
        agent.set_feedback(Feedback::Teacher);

        assert!(matches!(
            agent.rollout(Some(1.0), false, true),
            Err(AgentError::SimulatorMismatch { .. })
        ));
    }

    #[test]
    fn test_move_without_progress_is_fatal() {
        let mut env = ScriptedEnv::new(vec![episode("e1", &["a", "b", "c"], &[1, 2, 3])]);
        env.edit_observation = Some(|ob| ob.distance = 5.0);
        let mut agent = scripted_agent(env, -1.0, 3);
        agent.set_feedback(Feedback::Sample);

        assert!(matches!(
            agent.rollout(None, true, true),
            Err(AgentError::ZeroMovement { .. })
        ));
    }

    #[test]
    fn test_single_token_instructions_are_rejected() {
        let mut env = ScriptedEnv::new(vec![episode("e1", &["a", "b"], &[7, 0])]);
        env.edit_observation = Some(|ob| ob.instr_encoding.truncate(1));
        let mut agent = scripted_agent(env, 1.0, 3);
        agent.set_feedback(Feedback::Teacher);

        assert!(matches!(
            agent.rollout(Some(1.0), false, true),
            Err(AgentError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_argmax_cannot_train() {
        let mut agent = agent(vec![episode("e1", &["a", "b"], &[1, 2])], 1);
        assert!(matches!(
            agent.train(1, Feedback::Argmax),
            Err(AgentError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_checkpoint_roundtrip_restores_critic() {
        let episodes = vec![episode("e1", &["a", "b", "c"], &[1, 2, 3])];
        let source = agent(episodes.clone(), 1);
        let mut target = agent(episodes, 1);

        let dir = std::env::temp_dir().join(format!("vln-agent-checkpoint-{}", std::process::id()));
        let path = dir.join("agent.json");
        source.save(4, &path).unwrap();
        let epoch = target.load(&path).unwrap();
        assert_eq!(epoch, 4);

        let device = Default::default();
        let state = Tensor::<TestBackend, 2>::ones([1, 8], &device);
        let expected =
            to_f32_vec(source.critic().forward(state.clone(), ExecutionMode::Deterministic)).unwrap();
        let restored =
            to_f32_vec(target.critic().forward(state, ExecutionMode::Deterministic)).unwrap();
        assert!((expected[0] - restored[0]).abs() < 1e-5);

        std::fs::remove_dir_all(dir).ok();
    }
}
