//! Cooperative cancellation.
//!
//! A [`StopSignalHandler`] is a latch that is set at most once and polled at
//! explicit checkpoints by the agent loop and the model client. Nothing is
//! interrupted mid-call: an in-flight model request or device action runs to
//! completion and the stop is observed at the next checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::AgentError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserRequest,
    Timeout,
    Error,
    Shutdown,
}

impl StopReason {
    pub fn description(self) -> &'static str {
        match self {
            StopReason::UserRequest => "User requested stop",
            StopReason::Timeout => "Task timeout",
            StopReason::Error => "Task error",
            StopReason::Shutdown => "System shutdown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StopInfo {
    pub reason: StopReason,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
}

impl StopInfo {
    pub fn new(reason: StopReason, message: Option<String>) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            message,
        }
    }

    /// The explicit message if one was given, otherwise the reason text.
    pub fn message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| self.reason.description().to_string())
    }
}

pub type StopCallback = Arc<dyn Fn(&StopInfo) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
struct StopState {
    info: Option<StopInfo>,
    callbacks: Vec<(CallbackId, StopCallback)>,
    next_callback: u64,
}

/// Shared as `Arc<StopSignalHandler>`; `stop()` may be called from any thread.
pub struct StopSignalHandler {
    state: Mutex<StopState>,
    latch: watch::Sender<bool>,
}

impl Default for StopSignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignalHandler {
    pub fn new() -> Self {
        let (latch, _) = watch::channel(false);
        Self {
            state: Mutex::new(StopState::default()),
            latch,
        }
    }

    fn state(&self) -> MutexGuard<'_, StopState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sets the latch. Only the first call records its reason and runs the
    /// callbacks; later calls are no-ops.
    pub fn stop(&self, reason: StopReason, message: Option<String>) {
        let (info, callbacks) = {
            let mut state = self.state();
            if state.info.is_some() {
                debug!(?reason, "stop already requested, ignoring");
                return;
            }
            let info = StopInfo::new(reason, message);
            state.info = Some(info.clone());
            self.latch.send_replace(true);
            (info, state.callbacks.clone())
        };
        info!(reason = ?info.reason, message = %info.message(), "stop requested");

        // Callbacks run unlocked so they may read the handler.
        for (id, callback) in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&info))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(callback = id.0, "stop callback failed: {err:#}"),
                Err(_) => error!(callback = id.0, "stop callback panicked"),
            }
        }
    }

    pub fn should_stop(&self) -> bool {
        *self.latch.borrow()
    }

    /// The checkpoint primitive: `Err(AgentError::Stopped)` iff a stop was requested.
    pub fn check_stop(&self) -> Result<(), AgentError> {
        if !self.should_stop() {
            return Ok(());
        }
        let info = self
            .stop_info()
            .unwrap_or_else(|| StopInfo::new(StopReason::UserRequest, None));
        Err(AgentError::Stopped(info))
    }

    pub fn stop_info(&self) -> Option<StopInfo> {
        self.state().info.clone()
    }

    pub fn stop_message(&self) -> String {
        self.state()
            .info
            .as_ref()
            .map(StopInfo::message)
            .unwrap_or_else(|| "Task stopped".to_string())
    }

    /// Parks until a stop is requested. Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_stop(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.latch.subscribe();
        let wait = rx.wait_for(|stopped| *stopped);
        match timeout {
            Some(limit) => matches!(tokio::time::timeout(limit, wait).await, Ok(Ok(_))),
            None => wait.await.is_ok(),
        }
    }

    /// Clears the latch for reuse on a new task. Must not race with a consumer
    /// that is still between `should_stop` and acting on it.
    pub fn reset(&self) {
        let mut state = self.state();
        state.info = None;
        self.latch.send_replace(false);
    }

    pub fn add_stop_callback(&self, callback: StopCallback) -> CallbackId {
        let mut state = self.state();
        let id = CallbackId(state.next_callback);
        state.next_callback += 1;
        state.callbacks.push((id, callback));
        id
    }

    pub fn remove_stop_callback(&self, id: CallbackId) -> bool {
        let mut state = self.state();
        let before = state.callbacks.len();
        state.callbacks.retain(|(existing, _)| *existing != id);
        state.callbacks.len() != before
    }
}
