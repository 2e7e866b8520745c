//! Moving-average training metrics

use std::collections::VecDeque;
use std::time::Instant;

/// Moving average calculator
#[derive(Debug, Clone)]
pub struct MovingAverage {
    values: VecDeque<f32>,
    window_size: usize,
    sum: f32,
}

impl MovingAverage {
    pub fn new(window_size: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f32) {
        if self.values.len() >= self.window_size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
    }

    pub fn average(&self) -> f32 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f32
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Losses and episode outcomes over recent rollouts
#[derive(Debug)]
pub struct TrainingMetrics {
    /// Weighted imitation loss per rollout
    pub il_loss: MovingAverage,
    /// Normalized policy-gradient loss
    pub rl_loss: MovingAverage,
    /// Summed squared value error
    pub critic_loss: MovingAverage,
    /// Unmasked steps per reinforcement rollout
    pub active_steps: MovingAverage,
    /// Viewpoints visited per trajectory
    pub path_length: MovingAverage,
    /// Fraction of trajectories ending within the success distance
    pub success_rate: MovingAverage,
    pub iteration: usize,
    pub rollouts: usize,
    start_time: Instant,
}

impl TrainingMetrics {
    pub fn new(window_size: usize) -> Self {
        Self {
            il_loss: MovingAverage::new(window_size),
            rl_loss: MovingAverage::new(window_size),
            critic_loss: MovingAverage::new(window_size),
            active_steps: MovingAverage::new(window_size),
            path_length: MovingAverage::new(window_size),
            success_rate: MovingAverage::new(window_size),
            iteration: 0,
            rollouts: 0,
            start_time: Instant::now(),
        }
    }

    pub fn record_imitation(&mut self, loss: f32) {
        self.il_loss.push(loss);
    }

    pub fn record_actor_critic(&mut self, rl_loss: f32, critic_loss: f32, active_steps: f32) {
        self.rl_loss.push(rl_loss);
        self.critic_loss.push(critic_loss);
        self.active_steps.push(active_steps);
    }

    pub fn record_trajectory(&mut self, length: usize, success: bool) {
        self.path_length.push(length as f32);
        self.success_rate.push(if success { 1.0 } else { 0.0 });
    }

    pub fn record_rollout(&mut self) {
        self.rollouts += 1;
    }

    pub fn rollouts_per_second(&self) -> f64 {
        let duration = self.start_time.elapsed().as_secs_f64();
        if duration > 0.0 {
            self.rollouts as f64 / duration
        } else {
            0.0
        }
    }

    pub fn log_to_console(&self) {
        tracing::info!(
            "Iteration {} | Rollouts {} | {:.2} rollouts/s",
            self.iteration,
            self.rollouts,
            self.rollouts_per_second()
        );
        tracing::info!(
            "  Episode: length={:.1}, success={:.1}%, active steps={:.1}",
            self.path_length.average(),
            self.success_rate.average() * 100.0,
            self.active_steps.average()
        );
        tracing::info!(
            "  Losses: IL={:.4}, RL={:.4}, critic={:.4}",
            self.il_loss.average(),
            self.rl_loss.average(),
            self.critic_loss.average()
        );
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_average() {
        let mut avg = MovingAverage::new(3);

        avg.push(1.0);
        assert!((avg.average() - 1.0).abs() < 1e-6);

        avg.push(2.0);
        avg.push(3.0);
        assert!((avg.average() - 2.0).abs() < 1e-6);

        avg.push(4.0); // Pushes out 1.0
        assert!((avg.average() - 3.0).abs() < 1e-6);
        assert_eq!(avg.len(), 3);
    }

    #[test]
    fn test_trajectory_outcomes() {
        let mut metrics = TrainingMetrics::new(10);
        metrics.record_trajectory(3, true);
        metrics.record_trajectory(5, false);

        assert!((metrics.path_length.average() - 4.0).abs() < 1e-6);
        assert!((metrics.success_rate.average() - 0.5).abs() < 1e-6);
        assert!(metrics.rl_loss.is_empty());
    }
}
