//! `agentcron-core`: configuration and error types shared by every
//! agentcron crate.

pub mod config;
pub mod error;

pub use config::AgentcronConfig;
pub use error::{AgentcronError, Result};
