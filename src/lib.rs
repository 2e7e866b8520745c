//! Vision-and-language navigation agent.
//!
//! The agent reads an instruction, walks a viewpoint graph through a simulator
//! seam, and learns from a mix of teacher forcing and advantage actor-critic.
//! Greedy evaluation attaches a Monte-Carlo dropout confidence to every step.

pub mod agent;
pub mod env;
pub mod error;
pub mod infra;

pub use agent::{Agent, AgentConfig, Feedback, Trajectory};
pub use env::{GraphEnv, NavigationEnv, Observation};
pub use error::{AgentError, Result};
