use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use phone_hands::agent::{ActionExecutor, ActionResult, ScreenCapture, Screenshot, StepSnapshot};
use phone_hands::model::{ChatTransport, Message, ModelClient, ModelConfig, TimeoutConfig};
use phone_hands::recorder::ScriptDocument;
use phone_hands::sink::{MemoryStepSink, ScriptSink};
use phone_hands::stop::{StopReason, StopSignalHandler};
use phone_hands::tracker::{StepType, TrackerConfig};
use phone_hands::{Action, Agent, AgentConfig, AgentError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TAP: &str = "Tap the button.\ndo(action=\"Tap\", element=[500, 500])";

struct FakeScreen;

#[async_trait]
impl ScreenCapture for FakeScreen {
    async fn capture(&self, _device_id: Option<&str>) -> Screenshot {
        Screenshot {
            image_base64: B64.encode(b"fake-png"),
            width: 1080,
            height: 2400,
            is_sensitive: false,
            local_path: None,
        }
    }

    async fn current_app(&self, _device_id: Option<&str>) -> String {
        "Settings".to_string()
    }
}

/// Replays queued replies, then repeats a tap forever.
#[derive(Default)]
struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, AgentError>>>,
    calls: AtomicUsize,
    images_per_call: Mutex<Vec<usize>>,
    /// Raised while the request is in flight.
    stop_during_call: Mutex<Option<Arc<StopSignalHandler>>>,
}

impl ScriptedModel {
    fn new(replies: Vec<Result<String, AgentError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for ScriptedModel {
    async fn complete(&self, messages: &[Message], _timeout: Duration) -> Result<String, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let images: usize = messages.iter().map(Message::image_count).sum();
        self.images_per_call.lock().unwrap().push(images);
        if let Some(stop) = self.stop_during_call.lock().unwrap().as_ref() {
            stop.stop(StopReason::UserRequest, Some("cancelled mid-request".into()));
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(TAP.to_string()))
    }
}

type Behavior = Box<dyn Fn(usize, &Action) -> Result<ActionResult, AgentError> + Send + Sync>;

struct CountingExecutor {
    calls: Arc<AtomicUsize>,
    behavior: Behavior,
}

impl CountingExecutor {
    fn new() -> (Self, Arc<AtomicUsize>) {
        Self::with(Box::new(|_: usize, action: &Action| {
            Ok(match action {
                Action::Finish { message } => ActionResult::finish(true, message.clone()),
                _ => ActionResult::ok(),
            })
        }))
    }

    fn with(behavior: Behavior) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: calls.clone(),
                behavior,
            },
            calls,
        )
    }
}

#[async_trait]
impl ActionExecutor for CountingExecutor {
    async fn execute(
        &self,
        action: &Action,
        _device_id: Option<&str>,
        _width: u32,
        _height: u32,
    ) -> Result<ActionResult, AgentError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.behavior)(n, action)
    }
}

fn client(model: Arc<ScriptedModel>) -> ModelClient {
    let cfg = ModelConfig {
        model_name: "test-model".into(),
        timeouts: TimeoutConfig {
            enable_adaptive: false,
            ..TimeoutConfig::default()
        },
        ..ModelConfig::default()
    };
    ModelClient::with_transport(cfg, model)
}

fn config(dir: &tempfile::TempDir, max_steps: usize) -> AgentConfig {
    AgentConfig {
        max_steps,
        verbose: false,
        record_script: true,
        script_output_dir: dir.path().to_path_buf(),
        ..AgentConfig::default()
    }
}

#[tokio::test]
async fn max_steps_ends_the_run_with_a_fixed_message() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![]);
    let (executor, executed) = CountingExecutor::new();
    let mut agent = Agent::new(FakeScreen, executor, client(model.clone()), config(&dir, 3)).unwrap();

    let message = agent.run("open the wifi page").await.unwrap();

    assert_eq!(message, "Max steps reached");
    assert_eq!(agent.step_count(), 3);
    assert_eq!(model.calls(), 3);
    assert_eq!(executed.load(Ordering::SeqCst), 3);

    let rec = agent.recorder().unwrap();
    let numbers: Vec<usize> = rec.steps().iter().map(|s| s.step_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    let meta = rec.metadata().unwrap();
    assert_eq!(meta.total_steps, 3);
    assert_eq!(meta.success_rate, Some(100.0));
    assert_eq!(meta.model_name.as_deref(), Some("test-model"));

    let files: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert!(files.iter().any(|f| f.ends_with(".json")), "{files:?}");
    assert!(files.iter().any(|f| f.ends_with("_replay.py")), "{files:?}");
    assert!(dir.path().join("screenshots/step_003.png").exists());
}

#[tokio::test]
async fn only_the_newest_turn_carries_an_image() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![]);
    let (executor, _) = CountingExecutor::new();
    let mut agent = Agent::new(FakeScreen, executor, client(model.clone()), config(&dir, 3)).unwrap();
    agent.run("scroll down").await.unwrap();

    assert_eq!(*model.images_per_call.lock().unwrap(), vec![1, 1, 1]);
    let context = agent.context();
    assert!(context.iter().all(|m| m.image_count() == 0));
    // system + 3 x (user, assistant)
    assert_eq!(context.len(), 7);
}

#[tokio::test]
async fn finish_action_returns_its_message() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![
        Ok(TAP.to_string()),
        Ok("<think>done</think><answer>finish(message=\"All done\")</answer>".to_string()),
    ]);
    let (executor, executed) = CountingExecutor::new();
    let mut agent = Agent::new(FakeScreen, executor, client(model.clone()), config(&dir, 10)).unwrap();

    let message = agent.run("turn on dark mode").await.unwrap();

    assert_eq!(message, "All done");
    assert_eq!(agent.step_count(), 2);
    assert_eq!(executed.load(Ordering::SeqCst), 2);
    // the terminal finish is not part of the replayable script
    assert_eq!(agent.recorder().unwrap().steps().len(), 1);
}

#[tokio::test]
async fn unparseable_reply_finishes_with_the_raw_text() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![Ok("I cannot find that setting".to_string())]);
    let (executor, _) = CountingExecutor::new();
    let mut agent = Agent::new(FakeScreen, executor, client(model), config(&dir, 10)).unwrap();

    let message = agent.run("find the hidden menu").await.unwrap();
    assert_eq!(message, "I cannot find that setting");
    assert_eq!(agent.step_count(), 1);
}

#[tokio::test]
async fn stop_requested_in_callback_halts_before_the_next_step() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![]);
    let (executor, executed) = CountingExecutor::new();
    let mut agent = Agent::new(FakeScreen, executor, client(model.clone()), config(&dir, 10)).unwrap();
    let stop = agent.stop_handle();
    agent = agent.with_step_callback(Arc::new(move |snap: &StepSnapshot| {
        if snap.step_number == 2 {
            stop.stop(StopReason::UserRequest, Some("halted by operator".into()));
        }
    }));

    let message = agent.run("keep tapping").await.unwrap();

    assert_eq!(message, "halted by operator");
    assert_eq!(model.calls(), 2);
    assert_eq!(executed.load(Ordering::SeqCst), 2);
    let rec = agent.recorder().unwrap();
    assert_eq!(rec.steps().len(), 2);
    assert!(rec.metadata().unwrap().execution_time.is_some());
}

#[tokio::test]
async fn stop_from_another_thread_is_observed_at_the_next_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![]);
    let stop_slot: Arc<Mutex<Option<Arc<phone_hands::StopSignalHandler>>>> = Arc::new(Mutex::new(None));
    let slot = stop_slot.clone();
    let (executor, executed) = CountingExecutor::with(Box::new(move |n: usize, _: &Action| {
        if n == 2 {
            if let Some(stop) = slot.lock().unwrap().clone() {
                std::thread::spawn(move || stop.stop(StopReason::Shutdown, None))
                    .join()
                    .unwrap();
            }
        }
        Ok(ActionResult::ok())
    }));
    let mut agent = Agent::new(FakeScreen, executor, client(model.clone()), config(&dir, 10)).unwrap();
    *stop_slot.lock().unwrap() = Some(agent.stop_handle());

    let message = agent.run("keep tapping").await.unwrap();

    assert_eq!(message, "System shutdown");
    assert_eq!(model.calls(), 2);
    assert_eq!(executed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stop_before_run_issues_no_calls_until_reset() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![]);
    let (executor, executed) = CountingExecutor::new();
    let mut agent = Agent::new(FakeScreen, executor, client(model.clone()), config(&dir, 2)).unwrap();

    agent.stop(StopReason::UserRequest, None);
    let message = agent.run("anything").await.unwrap();
    assert_eq!(message, "User requested stop");
    assert_eq!(model.calls(), 0);
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    agent.reset();
    assert_eq!(agent.run("anything").await.unwrap(), "Max steps reached");
    assert_eq!(model.calls(), 2);
}

#[tokio::test]
async fn model_failure_is_terminal_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![Err(AgentError::Model("401 unauthorized".into()))]);
    let (executor, executed) = CountingExecutor::new();
    let mut agent = Agent::new(FakeScreen, executor, client(model.clone()), config(&dir, 10)).unwrap();

    let message = agent.run("open mail").await.unwrap();

    assert!(message.starts_with("Model error:"), "{message}");
    assert!(message.contains("401 unauthorized"));
    assert_eq!(model.calls(), 1);
    assert_eq!(executed.load(Ordering::SeqCst), 0);
    assert!(agent.recorder().unwrap().steps().is_empty());
}

#[tokio::test]
async fn executor_error_finishes_and_marks_the_step_failed() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![]);
    let (executor, executed) = CountingExecutor::with(Box::new(|_: usize, _: &Action| {
        Err(AgentError::Device("usb disconnected".into()))
    }));
    let mut agent = Agent::new(FakeScreen, executor, client(model), config(&dir, 10)).unwrap();

    let message = agent.run("tap").await.unwrap();

    assert!(message.contains("usb disconnected"), "{message}");
    assert_eq!(executed.load(Ordering::SeqCst), 1);
    let rec = agent.recorder().unwrap();
    let steps = rec.steps();
    assert_eq!(steps.len(), 1);
    assert!(!steps[0].success);
    assert!(steps[0].error_message.as_deref().unwrap().contains("usb disconnected"));
    assert_eq!(rec.metadata().unwrap().success_rate, Some(0.0));
}

#[tokio::test]
async fn recoverable_action_failure_continues_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![]);
    let (executor, _) = CountingExecutor::with(Box::new(|n: usize, _: &Action| {
        Ok(if n == 1 {
            ActionResult::failed("element not found")
        } else {
            ActionResult::ok()
        })
    }));
    let mut agent = Agent::new(FakeScreen, executor, client(model), config(&dir, 2)).unwrap();

    assert_eq!(agent.run("tap").await.unwrap(), "Max steps reached");
    let steps = agent.recorder().unwrap().steps();
    assert!(!steps[0].success);
    assert_eq!(steps[0].error_message.as_deref(), Some("element not found"));
    assert!(steps[1].success);
}

#[tokio::test]
async fn manual_stepping_requires_a_task_first() {
    let model = ScriptedModel::new(vec![]);
    let (executor, _) = CountingExecutor::new();
    let cfg = AgentConfig {
        verbose: false,
        ..AgentConfig::default()
    };
    let mut agent = Agent::new(FakeScreen, executor, client(model), cfg).unwrap();

    let err = agent.step(None).await.unwrap_err();
    assert!(matches!(err, AgentError::InvalidInput(_)));

    let first = agent.step(Some("open settings")).await.unwrap();
    assert!(!first.finished);
    assert_eq!(first.action, Some(Action::Tap { element: [500, 500], message: None }));
    assert_eq!(first.thinking, "Tap the button.");

    agent.step(None).await.unwrap();
    assert_eq!(agent.step_count(), 2);
    assert_eq!(agent.context().len(), 5);
}

#[tokio::test]
async fn empty_task_is_rejected() {
    let model = ScriptedModel::new(vec![]);
    let (executor, _) = CountingExecutor::new();
    let mut agent = Agent::new(FakeScreen, executor, client(model), AgentConfig::default()).unwrap();
    assert!(matches!(agent.run("   ").await, Err(AgentError::InvalidInput(_))));
}

#[tokio::test]
async fn callback_receives_serializable_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![]);
    let (executor, _) = CountingExecutor::new();
    let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut agent = Agent::new(FakeScreen, executor, client(model), config(&dir, 2))
        .unwrap()
        .with_step_callback(Arc::new(move |snap: &StepSnapshot| {
            sink.lock().unwrap().push(serde_json::to_value(snap).unwrap());
        }));

    agent.run_task("tap twice", Some("task-7")).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0]["task_id"], "task-7");
    assert_eq!(seen[0]["step_number"], 1);
    assert_eq!(seen[1]["action"]["action"], "Tap");
    assert_eq!(seen[1]["action"]["element"], serde_json::json!([500, 500]));
    assert_eq!(seen[1]["finished"], false);
}

#[derive(Default)]
struct CountingScriptSink {
    documents: Mutex<Vec<ScriptDocument>>,
}

#[async_trait]
impl ScriptSink for CountingScriptSink {
    async fn save_script(&self, document: &ScriptDocument) -> Result<(), AgentError> {
        self.documents.lock().unwrap().push(document.clone());
        Ok(())
    }
}

#[tokio::test]
async fn script_sink_receives_one_document_per_run() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![]);
    let (executor, _) = CountingExecutor::new();
    let scripts = Arc::new(CountingScriptSink::default());
    let mut agent = Agent::new(FakeScreen, executor, client(model), config(&dir, 2))
        .unwrap()
        .with_script_sink(scripts.clone());

    agent.run("tap twice").await.unwrap();

    let docs = scripts.documents.lock().unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].steps.len(), 2);
    let meta = docs[0].metadata.as_ref().unwrap();
    assert_eq!(meta.total_steps, 2);
    assert_eq!(meta.description, "tap twice");
}

#[tokio::test]
async fn step_telemetry_reaches_the_sink_after_the_run() {
    let mut replies = vec![Ok(TAP.to_string()); 6];
    replies.push(Ok("finish(message=\"ok\")".to_string()));
    let model = ScriptedModel::new(replies);
    let (executor, _) = CountingExecutor::new();
    let steps = Arc::new(MemoryStepSink::new());
    let cfg = AgentConfig {
        verbose: false,
        track_steps: true,
        ..AgentConfig::default()
    };
    let mut agent = Agent::new(FakeScreen, executor, client(model), cfg)
        .unwrap()
        .with_step_sink(steps.clone())
        .with_tracker_config(TrackerConfig {
            buffer_size: 2,
            flush_interval: Duration::from_secs(3600),
            backup_dir: None,
        });

    assert_eq!(agent.run_task("tap then finish", Some("task-42")).await.unwrap(), "ok");

    // several batches of two; the sink must see them in record order
    let stored = steps.steps();
    assert!(stored.iter().all(|s| s.task_id == "task-42"));
    let numbers: Vec<usize> = stored.iter().map(|s| s.step_number).collect();
    assert_eq!(numbers, (1..=7).collect::<Vec<_>>());
    assert_eq!(stored[0].step_type, StepType::Action);
    assert_eq!(stored[6].step_type, StepType::Completion);
    assert_eq!(stored[0].metadata.as_ref().unwrap()["current_app"], "Settings");
}

#[tokio::test(start_paused = true)]
async fn exhausted_timeouts_end_the_run_without_acting() {
    let model = ScriptedModel::new(
        (0..4)
            .map(|_| Err(AgentError::Timeout("request timed out".into())))
            .collect(),
    );
    let (executor, executed) = CountingExecutor::new();
    let cfg = AgentConfig {
        verbose: false,
        ..AgentConfig::default()
    };
    let mut agent = Agent::new(FakeScreen, executor, client(model.clone()), cfg).unwrap();

    let message = agent.run("open settings").await.unwrap();

    assert!(message.starts_with("Model error:"), "{message}");
    assert!(message.contains("timed out after 4 attempts"), "{message}");
    assert_eq!(model.calls(), 4);
    assert_eq!(executed.load(Ordering::SeqCst), 0);
    assert_eq!(agent.step_count(), 1);
}

#[tokio::test]
async fn stop_during_inference_leaves_no_image_in_context() {
    let model = ScriptedModel::new(vec![]);
    let (executor, executed) = CountingExecutor::new();
    let cfg = AgentConfig {
        verbose: false,
        ..AgentConfig::default()
    };
    let mut agent = Agent::new(FakeScreen, executor, client(model.clone()), cfg).unwrap();
    *model.stop_during_call.lock().unwrap() = Some(agent.stop_handle());

    assert_eq!(agent.run("open settings").await.unwrap(), "cancelled mid-request");
    assert_eq!(model.calls(), 1);
    assert_eq!(executed.load(Ordering::SeqCst), 0);
    let context = agent.context();
    assert_eq!(context.len(), 2);
    assert!(context.iter().all(|m| m.image_count() == 0));
}

/// Records which device each capability call was aimed at.
#[derive(Clone, Default)]
struct DeviceLog(Arc<Mutex<Vec<String>>>);

impl DeviceLog {
    fn push(&self, what: &str, device_id: Option<&str>) {
        self.0
            .lock()
            .unwrap()
            .push(format!("{what}:{}", device_id.unwrap_or("default")));
    }
}

#[async_trait]
impl ScreenCapture for DeviceLog {
    async fn capture(&self, device_id: Option<&str>) -> Screenshot {
        self.push("capture", device_id);
        FakeScreen.capture(device_id).await
    }

    async fn current_app(&self, device_id: Option<&str>) -> String {
        self.push("app", device_id);
        "Settings".to_string()
    }
}

#[async_trait]
impl ActionExecutor for DeviceLog {
    async fn execute(
        &self,
        action: &Action,
        device_id: Option<&str>,
        _width: u32,
        _height: u32,
    ) -> Result<ActionResult, AgentError> {
        self.push("execute", device_id);
        Ok(match action {
            Action::Finish { message } => ActionResult::finish(true, message.clone()),
            _ => ActionResult::ok(),
        })
    }
}

#[tokio::test]
async fn configured_device_is_used_for_capture_and_actions() {
    let model = ScriptedModel::new(vec![Ok(TAP.to_string()), Ok("finish(message=\"done\")".to_string())]);
    let log = DeviceLog::default();
    let cfg = AgentConfig {
        verbose: false,
        device_id: Some("emulator-5556".into()),
        ..AgentConfig::default()
    };
    let mut agent = Agent::new(log.clone(), log.clone(), client(model), cfg).unwrap();

    assert_eq!(agent.run("tap once").await.unwrap(), "done");
    let calls = log.0.lock().unwrap().clone();
    assert_eq!(calls.len(), 6);
    assert!(calls.iter().all(|c| c.ends_with(":emulator-5556")), "{calls:?}");
}

