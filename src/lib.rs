pub mod action;
pub mod agent;
pub mod device;
pub mod error;
pub mod model;
pub mod prompts;
pub mod recorder;
pub mod sink;
pub mod stop;
pub mod tracker;

pub use action::{parse_action, Action};
pub use agent::{
    ActionExecutor, ActionResult, AdbDevice, Agent, AgentConfig, ScreenCapture, Screenshot, StepResult,
    StepSnapshot,
};
pub use device::{Adb, AdbConfig};
pub use error::AgentError;
pub use model::{ChatTransport, Message, ModelClient, ModelConfig, ModelResponse, TimeoutConfig};
pub use prompts::Language;
pub use recorder::{ScriptDocument, ScriptRecorder};
pub use sink::{JsonlStepSink, MemoryStepSink, ScriptSink, StepSink};
pub use stop::{StopInfo, StopReason, StopSignalHandler};
pub use tracker::{PendingStep, StepData, StepTracker, TrackerConfig};
