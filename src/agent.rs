use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::Utc;
use image::codecs::png::{PngDecoder, PngEncoder};
use image::{ExtendedColorType, ImageDecoder, ImageEncoder};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs as async_fs;
use tracing::{debug, error, info, warn};

use crate::action::{parse_action, Action};
use crate::device::{app_for_package, package_for, Adb, AdbConfig, Capture};
use crate::error::AgentError;
use crate::model::{screen_info, Message, ModelClient, ModelResponse};
use crate::prompts::{system_prompt, Language};
use crate::recorder::ScriptRecorder;
use crate::sink::{ScriptSink, StepSink};
use crate::stop::{StopReason, StopSignalHandler};
use crate::tracker::{StepEntry, StepTracker, StepType, TrackerConfig};

// ========================= Core Types =========================

const FALLBACK_WIDTH: u32 = 1080;
const FALLBACK_HEIGHT: u32 = 2400;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Screenshot {
    pub image_base64: String,
    pub width: u32,
    pub height: u32,
    /// The device refused to capture (secure/payment overlay).
    pub is_sensitive: bool,
    /// Copy on disk, when the capture backend keeps one.
    pub local_path: Option<String>,
}

impl Screenshot {
    /// A flat black 1080x2400 frame used whenever capture fails.
    pub fn placeholder(is_sensitive: bool) -> Self {
        let pixels = vec![0u8; (FALLBACK_WIDTH * FALLBACK_HEIGHT * 3) as usize];
        let mut png = Vec::new();
        let image_base64 = match PngEncoder::new(&mut png).write_image(
            &pixels,
            FALLBACK_WIDTH,
            FALLBACK_HEIGHT,
            ExtendedColorType::Rgb8,
        ) {
            Ok(()) => B64.encode(&png),
            Err(e) => {
                warn!("failed to encode placeholder frame: {e}");
                String::new()
            }
        };
        Self {
            image_base64,
            width: FALLBACK_WIDTH,
            height: FALLBACK_HEIGHT,
            is_sensitive,
            local_path: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: Option<String>,
    pub should_finish: bool,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            should_finish: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            should_finish: false,
        }
    }

    pub fn finish(success: bool, message: Option<String>) -> Self {
        Self {
            success,
            message,
            should_finish: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepResult {
    pub success: bool,
    pub finished: bool,
    pub action: Option<Action>,
    pub thinking: String,
    pub message: Option<String>,
}

/// Owned, serializable view of one step handed to the step callback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub task_id: Option<String>,
    pub step_number: usize,
    pub thinking: String,
    pub action: Value,
    pub result: ActionResult,
    pub screenshot: Option<String>,
    pub success: bool,
    pub finished: bool,
}

pub type StepCallbackFn = Arc<dyn Fn(&StepSnapshot) + Send + Sync>;

// ========================= Pluggable Subsystems =========================

/// Screen capture never fails outright: implementations degrade to
/// [`Screenshot::placeholder`].
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self, device_id: Option<&str>) -> Screenshot;
    async fn current_app(&self, device_id: Option<&str>) -> String;
}

/// Applies one action to the device selected by `device_id` (`None` means the
/// executor's default). Recoverable failures come back as
/// `ActionResult { success: false, .. }`; `Err` is reserved for conditions the
/// driver should end the task on.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action: &Action,
        device_id: Option<&str>,
        width: u32,
        height: u32,
    ) -> Result<ActionResult, AgentError>;
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub device_id: Option<String>,
    pub lang: Language,
    /// Defaults to the built-in prompt for `lang`.
    pub system_prompt: Option<String>,
    pub verbose: bool,
    pub record_script: bool,
    pub script_output_dir: PathBuf,
    pub track_steps: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            device_id: None,
            lang: Language::Cn,
            system_prompt: None,
            verbose: true,
            record_script: false,
            script_output_dir: PathBuf::from("scripts"),
            track_steps: false,
        }
    }
}

enum RunEnd {
    Finished { success: bool, message: String },
    MaxSteps,
}

/// Drives one task at a time; use one instance per concurrently running task.
pub struct Agent<S, E>
where
    S: ScreenCapture,
    E: ActionExecutor,
{
    screen: S,
    executor: E,
    model: ModelClient,
    cfg: AgentConfig,
    stop: Arc<StopSignalHandler>,
    recorder: Option<ScriptRecorder>,
    tracker: Option<StepTracker>,
    tracker_cfg: TrackerConfig,
    step_sink: Option<Arc<dyn StepSink>>,
    script_sink: Option<Arc<dyn ScriptSink>>,
    step_callback: Option<StepCallbackFn>,
    context: Vec<Message>,
    step_count: usize,
    task_id: Option<String>,
}

impl<S, E> Agent<S, E>
where
    S: ScreenCapture,
    E: ActionExecutor,
{
    /// Fails only if recording is enabled and its output directory cannot be created.
    pub fn new(screen: S, executor: E, model: ModelClient, cfg: AgentConfig) -> Result<Self, AgentError> {
        let stop = Arc::new(StopSignalHandler::new());
        let recorder = if cfg.record_script {
            Some(ScriptRecorder::new(&cfg.script_output_dir)?)
        } else {
            None
        };
        Ok(Self {
            screen,
            executor,
            model: model.with_stop_handler(stop.clone()),
            cfg,
            stop,
            recorder,
            tracker: None,
            tracker_cfg: TrackerConfig::default(),
            step_sink: None,
            script_sink: None,
            step_callback: None,
            context: Vec::new(),
            step_count: 0,
            task_id: None,
        })
    }

    pub fn with_step_sink(mut self, sink: Arc<dyn StepSink>) -> Self {
        self.step_sink = Some(sink);
        self
    }

    pub fn with_script_sink(mut self, sink: Arc<dyn ScriptSink>) -> Self {
        self.script_sink = Some(sink);
        self
    }

    pub fn with_step_callback(mut self, callback: StepCallbackFn) -> Self {
        self.step_callback = Some(callback);
        self
    }

    pub fn with_tracker_config(mut self, cfg: TrackerConfig) -> Self {
        self.tracker_cfg = cfg;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn model(&self) -> &ModelClient {
        &self.model
    }

    pub fn recorder(&self) -> Option<&ScriptRecorder> {
        self.recorder.as_ref()
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn context(&self) -> Vec<Message> {
        self.context.clone()
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// Shared handle for stopping the run from another task or thread.
    pub fn stop_handle(&self) -> Arc<StopSignalHandler> {
        self.stop.clone()
    }

    pub fn script_summary(&self) -> Option<String> {
        self.recorder.as_ref().map(ScriptRecorder::summary)
    }

    /// Requests a cooperative stop and freezes the recording clock. An
    /// in-flight model or device call is not interrupted.
    pub fn stop(&mut self, reason: StopReason, message: Option<String>) {
        self.stop.stop(reason, message);
        if let (Some(rec), Some(info)) = (self.recorder.as_mut(), self.stop.stop_info()) {
            rec.stop_clock(info.timestamp);
        }
    }

    /// Clears conversation state and the stop latch for a new task.
    pub fn reset(&mut self) {
        self.context.clear();
        self.step_count = 0;
        self.task_id = None;
        self.stop.reset();
    }

    pub async fn run(&mut self, task: &str) -> Result<String, AgentError> {
        self.run_task(task, None).await
    }

    /// Runs `task` until it finishes, hits `max_steps`, or is stopped. The
    /// returned message says which. Only unexpected errors are returned as `Err`.
    pub async fn run_task(&mut self, task: &str, task_id: Option<&str>) -> Result<String, AgentError> {
        if task.trim().is_empty() {
            return Err(AgentError::InvalidInput("task description is empty".into()));
        }
        self.context.clear();
        self.step_count = 0;
        let task_id = task_id.map(str::to_string).unwrap_or_else(|| nanoid!());
        self.task_id = Some(task_id.clone());

        if let Some(rec) = self.recorder.as_mut() {
            rec.start_recording(task, self.cfg.device_id.as_deref(), Some(self.model.model_name()));
            info!(task_id = %task_id, "script recording started");
        }
        if self.cfg.track_steps {
            self.tracker = Some(StepTracker::new(
                task_id.clone(),
                self.tracker_cfg.clone(),
                self.step_sink.clone(),
            ));
        }

        info!(task_id = %task_id, max_steps = self.cfg.max_steps, "task started");
        let outcome = self.drive(task).await;

        let success = matches!(outcome, Ok(RunEnd::Finished { success: true, .. }));
        self.finalize(success).await;

        match outcome {
            Ok(RunEnd::Finished { message, .. }) => {
                info!(task_id = %task_id, steps = self.step_count, "task finished: {message}");
                Ok(message)
            }
            Ok(RunEnd::MaxSteps) => {
                warn!(task_id = %task_id, steps = self.step_count, "max steps reached");
                Ok("Max steps reached".to_string())
            }
            Err(AgentError::Stopped(info)) => {
                info!(task_id = %task_id, steps = self.step_count, reason = ?info.reason, "task stopped");
                Ok(info.message())
            }
            Err(err) => {
                error!(task_id = %task_id, "task failed: {err}");
                Err(err)
            }
        }
    }

    async fn drive(&mut self, task: &str) -> Result<RunEnd, AgentError> {
        let mut prompt = Some(task);
        loop {
            self.stop.check_stop()?;
            if self.step_count >= self.cfg.max_steps {
                return Ok(RunEnd::MaxSteps);
            }
            let result = self.execute_step(prompt.take()).await?;
            if result.finished {
                return Ok(RunEnd::Finished {
                    success: result.success,
                    message: result.message.unwrap_or_else(|| "Task completed".to_string()),
                });
            }
        }
    }

    /// Runs a single cycle. The first call of a session must carry the task.
    pub async fn step(&mut self, task: Option<&str>) -> Result<StepResult, AgentError> {
        let first = self.context.is_empty();
        let prompt = match task.filter(|t| !t.trim().is_empty()) {
            Some(t) if first => Some(t),
            _ if first => {
                return Err(AgentError::InvalidInput("task is required for the first step".into()))
            }
            _ => None,
        };
        self.stop.check_stop()?;
        self.execute_step(prompt).await
    }

    /// `task` is `Some` only for the opening turn of a conversation.
    async fn execute_step(&mut self, task: Option<&str>) -> Result<StepResult, AgentError> {
        self.step_count += 1;
        let step = self.step_count;
        let started = Instant::now();
        let device_id = self.cfg.device_id.clone();

        let screenshot = self.screen.capture(device_id.as_deref()).await;
        let current_app = self.screen.current_app(device_id.as_deref()).await;
        if screenshot.is_sensitive {
            debug!(step, "screen capture refused, using placeholder");
        }

        let info = screen_info(&current_app);
        let text = match task {
            Some(task) => {
                let prompt = self
                    .cfg
                    .system_prompt
                    .clone()
                    .unwrap_or_else(|| system_prompt(self.cfg.lang));
                self.context.push(Message::system(prompt));
                format!("{task}\n\n{info}")
            }
            None => format!("** Screen Info **\n\n{info}"),
        };
        self.context
            .push(Message::user(text, Some(&screenshot.image_base64)));

        let response = self.model.request(&self.context).await;
        // Only the turn being answered may hold an image.
        if let Some(last) = self.context.last_mut() {
            last.remove_images();
        }
        let response = match response {
            Ok(r) => r,
            Err(err) if err.is_stop() => return Err(err),
            Err(err) => {
                error!(step, "model request failed: {err}");
                let message = format!("Model error: {err}");
                self.track(
                    StepEntry {
                        success: false,
                        error_message: Some(message.clone()),
                        duration_ms: Some(elapsed_ms(started)),
                        ..StepEntry::new(StepType::Error, serde_json::json!({ "stage": "model" }))
                    },
                )
                .await;
                return Ok(StepResult {
                    success: false,
                    finished: true,
                    action: None,
                    thinking: String::new(),
                    message: Some(message),
                });
            }
        };

        let action = match parse_action(&response.action) {
            Ok(action) => action,
            Err(err) => {
                debug!(step, "unparseable action, finishing: {err}");
                Action::Finish {
                    message: Some(response.action.clone()),
                }
            }
        };
        self.log_step(step, &response, &action);

        self.stop.check_stop()?;
        let result = match self
            .executor
            .execute(&action, device_id.as_deref(), screenshot.width, screenshot.height)
            .await
        {
            Ok(result) => result,
            Err(err) if err.is_stop() => return Err(err),
            Err(err) => {
                error!(step, "action execution failed: {err}");
                ActionResult::finish(false, Some(err.to_string()))
            }
        };

        if !action.is_finish() {
            if let Some(rec) = self.recorder.as_mut() {
                let error_message = if result.success { None } else { result.message.clone() };
                rec.record_step(
                    &action,
                    &response.thinking,
                    result.success,
                    error_message,
                    Some(&screenshot.image_base64),
                )
                .await;
            }
        }

        self.context.push(Message::assistant(format!(
            "<think>{}</think><answer>{}</answer>",
            response.thinking, response.action
        )));

        let finished = action.is_finish() || result.should_finish;
        let message = result
            .message
            .clone()
            .or_else(|| action.message().map(str::to_string));
        let payload = action.to_payload();

        let step_type = if !result.success {
            StepType::Error
        } else if finished {
            StepType::Completion
        } else {
            StepType::Action
        };
        self.track(StepEntry {
            thinking: Some(response.thinking.clone()),
            action_result: serde_json::to_value(&result).ok(),
            screenshot_path: screenshot.local_path.clone(),
            duration_ms: Some(elapsed_ms(started)),
            success: result.success,
            error_message: if result.success { None } else { result.message.clone() },
            metadata: Some(serde_json::json!({ "current_app": current_app })),
            ..StepEntry::new(step_type, payload.clone())
        })
        .await;

        if finished {
            info!(step, "task complete: {}", message.as_deref().unwrap_or("done"));
        }

        if let Some(callback) = &self.step_callback {
            let snapshot = StepSnapshot {
                task_id: self.task_id.clone(),
                step_number: step,
                thinking: response.thinking.clone(),
                action: payload,
                result: result.clone(),
                screenshot: screenshot.local_path.clone(),
                success: result.success,
                finished,
            };
            callback(&snapshot);
        }

        self.stop.check_stop()?;
        Ok(StepResult {
            success: result.success,
            finished,
            action: Some(action),
            thinking: response.thinking,
            message,
        })
    }

    fn log_step(&self, step: usize, response: &ModelResponse, action: &Action) {
        if self.cfg.verbose {
            info!(step, thinking = %response.thinking, action = ?action, "model decided");
        } else {
            debug!(step, thinking = %response.thinking, action = ?action, "model decided");
        }
    }

    async fn track(&self, entry: StepEntry) {
        if let Some(tracker) = &self.tracker {
            tracker.record_step(entry).await;
        }
    }

    /// Finalizes and persists the recording, then drains telemetry. Runs once per `run_task`.
    async fn finalize(&mut self, success: bool) {
        if let Some(rec) = self.recorder.as_mut() {
            if let Some(info) = self.stop.stop_info() {
                rec.stop_clock(info.timestamp);
            }
            rec.finish_recording(success);
            if !rec.steps().is_empty() {
                match rec.save_script(None).await {
                    Ok(path) => {
                        let name = path.file_name().map(PathBuf::from).unwrap_or_default();
                        match rec.generate_python_script(&name).await {
                            Ok(py) => info!(json = %path.display(), replay = %py.display(), "script saved"),
                            Err(err) => warn!("failed to write replay script: {err}"),
                        }
                    }
                    Err(err) => warn!("failed to save script: {err}"),
                }
                if let Some(sink) = &self.script_sink {
                    if let Err(err) = sink.save_script(&rec.document()).await {
                        warn!("script sink failed: {err}");
                    }
                }
            }
        }
        if let Some(tracker) = self.tracker.take() {
            tracker.cleanup().await;
            let stats = tracker.statistics();
            info!(
                task_id = %stats.task_id,
                total = stats.total_steps,
                failed = stats.failed_steps,
                "step telemetry flushed"
            );
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ========================= ADB Adapter =========================

pub type ConfirmFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type TakeoverFn = Arc<dyn Fn(&str) + Send + Sync>;

const LONG_PRESS: Duration = Duration::from_millis(3000);
const SWIPE_DURATION: Duration = Duration::from_millis(500);
const MAX_WAIT_SECS: f64 = 600.0;

/// Real device backend: captures via `screencap` and acts via `input`.
#[derive(Clone)]
pub struct AdbDevice {
    adb: Adb,
    frame_dir: Option<PathBuf>,
    confirm: Option<ConfirmFn>,
    takeover: Option<TakeoverFn>,
}

impl AdbDevice {
    pub fn new(cfg: AdbConfig) -> Self {
        Self {
            adb: Adb::new(cfg),
            frame_dir: None,
            confirm: None,
            takeover: None,
        }
    }

    /// Keep every captured frame on disk under `dir`.
    pub fn with_frame_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.frame_dir = Some(dir.into());
        self
    }

    /// Asked before taps the model flagged as sensitive; `false` ends the task.
    pub fn with_confirmation(mut self, confirm: ConfirmFn) -> Self {
        self.confirm = Some(confirm);
        self
    }

    pub fn with_takeover(mut self, takeover: TakeoverFn) -> Self {
        self.takeover = Some(takeover);
        self
    }

    async fn save_frame(&self, png: &[u8]) -> Option<String> {
        let dir = self.frame_dir.as_ref()?;
        let name = format!("frame_{}_{}.png", Utc::now().format("%Y%m%d_%H%M%S_%3f"), nanoid!(8));
        let path = dir.join(name);
        let written = async {
            async_fs::create_dir_all(dir).await?;
            async_fs::write(&path, png).await
        }
        .await;
        match written {
            Ok(()) => Some(path.to_string_lossy().into_owned()),
            Err(e) => {
                warn!(path = %path.display(), "failed to keep frame: {e}");
                None
            }
        }
    }

    async fn run_action(&self, adb: &Adb, action: &Action, width: u32, height: u32) -> anyhow::Result<ActionResult> {
        let at = |p: [i32; 2]| scale(p, width, height);
        match action {
            Action::Launch { app } => {
                let package = match package_for(app) {
                    Some(pkg) => pkg.to_string(),
                    None if app.contains('.') => app.clone(),
                    None => return Ok(ActionResult::failed(format!("App not found: {app}"))),
                };
                adb.launch(&package).await?;
            }
            Action::Tap { element, message } => {
                if let (Some(msg), Some(confirm)) = (message, &self.confirm) {
                    if !confirm(msg) {
                        return Ok(ActionResult::finish(
                            false,
                            Some("User cancelled sensitive operation".into()),
                        ));
                    }
                }
                let (x, y) = at(*element);
                adb.tap(x, y).await?;
            }
            Action::DoubleTap { element } => {
                let (x, y) = at(*element);
                adb.double_tap(x, y).await?;
            }
            Action::LongPress { element } => {
                let (x, y) = at(*element);
                adb.long_press(x, y, LONG_PRESS).await?;
            }
            Action::Type { text } => adb.type_text(text).await?,
            Action::Swipe { start, end } => adb.swipe(at(*start), at(*end), SWIPE_DURATION).await?,
            Action::Back => adb.back().await?,
            Action::Home => adb.home().await?,
            Action::Wait { seconds } => {
                let pause = Duration::try_from_secs_f64(seconds.clamp(0.0, MAX_WAIT_SECS)).unwrap_or_default();
                tokio::time::sleep(pause).await;
                return Ok(ActionResult::ok());
            }
            Action::TakeOver { message } => {
                let msg = message.as_deref().unwrap_or("Manual operation required");
                match &self.takeover {
                    Some(takeover) => takeover(msg),
                    None => warn!("takeover requested: {msg}"),
                }
                return Ok(ActionResult::ok());
            }
            Action::Finish { message } => return Ok(ActionResult::finish(true, message.clone())),
            Action::Unknown { name, .. } => return Ok(ActionResult::failed(format!("Unknown action: {name}"))),
        }
        tokio::time::sleep(adb.config().settle_delay).await;
        Ok(ActionResult::ok())
    }
}

/// Maps a point on the 0..1000 grid onto a `width` x `height` frame.
pub fn scale(point: [i32; 2], width: u32, height: u32) -> (i32, i32) {
    let x = i64::from(point[0]) * i64::from(width) / 1000;
    let y = i64::from(point[1]) * i64::from(height) / 1000;
    (x as i32, y as i32)
}

fn png_dimensions(png: &[u8]) -> anyhow::Result<(u32, u32)> {
    let decoder = PngDecoder::new(Cursor::new(png))?;
    Ok(decoder.dimensions())
}

#[async_trait]
impl ScreenCapture for AdbDevice {
    async fn capture(&self, device_id: Option<&str>) -> Screenshot {
        match self.adb.for_device(device_id).screencap().await {
            Ok(Capture::Png(png)) => match png_dimensions(&png) {
                Ok((width, height)) => Screenshot {
                    local_path: self.save_frame(&png).await,
                    image_base64: B64.encode(&png),
                    width,
                    height,
                    is_sensitive: false,
                },
                Err(e) => {
                    warn!("unreadable screencap: {e:#}");
                    Screenshot::placeholder(false)
                }
            },
            Ok(Capture::Refused) => Screenshot::placeholder(true),
            Err(e) => {
                warn!("screencap failed: {e:#}");
                Screenshot::placeholder(false)
            }
        }
    }

    async fn current_app(&self, device_id: Option<&str>) -> String {
        match self.adb.for_device(device_id).current_package().await {
            Ok(Some(pkg)) => app_for_package(&pkg).map(str::to_string).unwrap_or(pkg),
            Ok(None) => "System Home".to_string(),
            Err(e) => {
                warn!("failed to read focused app: {e:#}");
                "System Home".to_string()
            }
        }
    }
}

#[async_trait]
impl ActionExecutor for AdbDevice {
    async fn execute(
        &self,
        action: &Action,
        device_id: Option<&str>,
        width: u32,
        height: u32,
    ) -> Result<ActionResult, AgentError> {
        let adb = self.adb.for_device(device_id);
        self.run_action(&adb, action, width, height)
            .await
            .map_err(|e| AgentError::Device(format!("{e:#}")))
    }
}
