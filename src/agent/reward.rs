use crate::error::{AgentError, Result};

use super::state::{InstanceState, NavAction};

const STOP_SUCCESS_REWARD: f32 = 2.0;
const STOP_FAILURE_REWARD: f32 = -2.0;
const PROGRESS_REWARD: f32 = 1.0;
/// Within this many meters of the goal, walking away is penalized further.
const MISS_RADIUS: f32 = 1.0;
const MISS_PENALTY: f32 = 2.0;

/// Distance to goal and path fidelity at one point of a rollout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathSignal {
    pub distance: f32,
    pub ndtw: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReward {
    pub reward: f32,
    pub mask: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct RewardShaper {
    success_distance: f32,
}

impl RewardShaper {
    pub fn new(success_distance: f32) -> Self {
        Self { success_distance }
    }

    pub fn shape(
        &self,
        instr_id: &str,
        state: InstanceState,
        action: NavAction,
        previous: PathSignal,
        current: PathSignal,
    ) -> Result<StepReward> {
        if state.is_stopped() {
            return Ok(StepReward {
                reward: 0.0,
                mask: 0.0,
            });
        }

        let reward = match action {
            NavAction::Stop => {
                if current.distance < self.success_distance {
                    STOP_SUCCESS_REWARD + STOP_SUCCESS_REWARD * current.ndtw
                } else {
                    STOP_FAILURE_REWARD
                }
            }
            NavAction::Candidate(_) => {
                let progress = previous.distance - current.distance;
                let ndtw_gain = current.ndtw - previous.ndtw;
                let mut reward = if progress > 0.0 {
                    PROGRESS_REWARD + ndtw_gain
                } else if progress < 0.0 {
                    -PROGRESS_REWARD + ndtw_gain
                } else {
                    return Err(AgentError::ZeroMovement {
                        instr_id: instr_id.to_string(),
                        distance: current.distance,
                    });
                };
                if previous.distance <= MISS_RADIUS && progress < 0.0 {
                    reward -= MISS_PENALTY * (1.0 - previous.distance);
                }
                reward
            }
        };

        Ok(StepReward { reward, mask: 1.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(distance: f32, ndtw: f32) -> PathSignal {
        PathSignal { distance, ndtw }
    }

    #[test]
    fn test_progress_reward_includes_ndtw_gain() {
        let shaper = RewardShaper::new(3.0);
        let step = shaper
            .shape(
                "i",
                InstanceState::Active,
                NavAction::Candidate(0),
                signal(4.0, 0.5),
                signal(2.5, 0.7),
            )
            .unwrap();
        assert!((step.reward - 1.2).abs() < 1e-6);
        assert_eq!(step.mask, 1.0);
    }

    #[test]
    fn test_zero_movement_is_fatal() {
        let shaper = RewardShaper::new(3.0);
        let result = shaper.shape(
            "i",
            InstanceState::Active,
            NavAction::Candidate(1),
            signal(5.0, 0.1),
            signal(5.0, 0.1),
        );
        assert!(matches!(result, Err(AgentError::ZeroMovement { .. })));
    }

    #[test]
    fn test_stop_rewards() {
        let shaper = RewardShaper::new(3.0);
        let success = shaper
            .shape("i", InstanceState::Active, NavAction::Stop, signal(1.0, 0.5), signal(1.0, 0.5))
            .unwrap();
        assert!((success.reward - 3.0).abs() < 1e-6);

        let failure = shaper
            .shape("i", InstanceState::Active, NavAction::Stop, signal(4.0, 0.5), signal(4.0, 0.5))
            .unwrap();
        assert_eq!(failure.reward, -2.0);
    }

    #[test]
    fn test_walking_away_near_goal_is_penalized() {
        let shaper = RewardShaper::new(3.0);
        let step = shaper
            .shape(
                "i",
                InstanceState::Active,
                NavAction::Candidate(0),
                signal(0.5, 0.8),
                signal(1.5, 0.6),
            )
            .unwrap();
        // -1 + (0.6 - 0.8) - 2 * (1 - 0.5)
        assert!((step.reward - (-2.2)).abs() < 1e-6);
    }

    #[test]
    fn test_stopped_instances_are_masked() {
        let shaper = RewardShaper::new(3.0);
        let step = shaper
            .shape(
                "i",
                InstanceState::Stopped,
                NavAction::Stop,
                signal(5.0, 0.0),
                signal(5.0, 0.0),
            )
            .unwrap();
        assert_eq!(step, StepReward { reward: 0.0, mask: 0.0 });
    }
}
