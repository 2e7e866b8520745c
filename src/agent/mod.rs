//! The navigation agent: cross-modal encoder and critic, rollouts under the
//! three feedback modes, and the training loop around them.

pub mod a2c;
pub mod checkpoint;
pub mod clip;
pub mod confidence;
pub mod config;
pub mod encoder;
pub mod features;
mod lifecycle;
pub mod metrics;
pub mod model;
pub mod reward;
mod rollout;
pub mod state;
pub mod teacher;

pub use checkpoint::Checkpoint;
pub use confidence::ConfidenceEstimator;
pub use config::{AgentConfig, Feedback, LossNormalization};
pub use encoder::{CrossModalEncoder, EncoderRequest, EncoderResponse, ExecutionMode};
pub use lifecycle::{Agent, PathStep, ResultEntry, Trajectory};
pub use metrics::TrainingMetrics;
pub use model::{Critic, CriticConfig, EncoderConfig, RecurrentEncoder};
pub use reward::RewardShaper;
pub use state::{InstanceState, NavAction};
