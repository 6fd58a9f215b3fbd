use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stop::StopInfo;

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AgentError {
    /// Cooperative cancellation. Not a failure: callers match on it to tell
    /// "stopped by user" apart from "failed".
    #[error("{}", .0.message())]
    Stopped(StopInfo),
    #[error("model error: {0}")]
    Model(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("action error: {0}")]
    Action(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl AgentError {
    pub fn is_stop(&self) -> bool {
        matches!(self, AgentError::Stopped(_))
    }

    /// Transport errors are only reliably classified by their text, so any
    /// message mentioning a timeout counts.
    pub fn is_timeout(&self) -> bool {
        match self {
            AgentError::Timeout(_) => true,
            AgentError::Stopped(_) => false,
            other => {
                let msg = other.to_string().to_lowercase();
                msg.contains("timeout") || msg.contains("timed out")
            }
        }
    }
}
