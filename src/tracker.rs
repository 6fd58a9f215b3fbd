//! Fine-grained step telemetry.
//!
//! Steps are counted synchronously at record time and queued on a bounded
//! channel (twice the buffer size). Flushes run on spawned tasks gated by a
//! two-permit semaphore: one is kicked off whenever the queue reaches the
//! buffer size, and a periodic timer drains whatever is left. A producer that
//! outruns the sink waits on the full channel instead of growing memory.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::fs as async_fs;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::sink::StepSink;

const FLUSH_WORKERS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Thinking,
    Action,
    Screenshot,
    Error,
    Validation,
    Completion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    pub step_id: String,
    pub task_id: String,
    pub step_number: usize,
    pub step_type: StepType,
    pub step_data: Value,
    pub thinking: Option<String>,
    pub action_result: Option<Value>,
    pub screenshot_path: Option<String>,
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<Value>,
}

/// What a caller supplies for one step; the tracker assigns ids and numbering.
#[derive(Clone, Debug)]
pub struct StepEntry {
    pub step_type: StepType,
    pub step_data: Value,
    pub thinking: Option<String>,
    pub action_result: Option<Value>,
    pub screenshot_path: Option<String>,
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub metadata: Option<Value>,
}

impl StepEntry {
    pub fn new(step_type: StepType, step_data: Value) -> Self {
        Self {
            step_type,
            step_data,
            thinking: None,
            action_result: None,
            screenshot_path: None,
            duration_ms: None,
            success: true,
            error_message: None,
            metadata: None,
        }
    }

    pub fn into_data(self, task_id: &str, step_number: usize) -> StepData {
        StepData {
            step_id: nanoid!(),
            task_id: task_id.to_string(),
            step_number,
            step_type: self.step_type,
            step_data: self.step_data,
            thinking: self.thinking,
            action_result: self.action_result,
            screenshot_path: self.screenshot_path,
            duration_ms: self.duration_ms,
            success: self.success,
            error_message: self.error_message,
            timestamp: Utc::now(),
            metadata: self.metadata,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Queue depth that triggers a flush; the channel holds twice this.
    pub buffer_size: usize,
    pub flush_interval: Duration,
    /// Local JSON copy of every flushed batch. `None` disables it.
    pub backup_dir: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 50,
            flush_interval: Duration::from_secs(5),
            backup_dir: Some(PathBuf::from("backup/steps")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotInfo {
    pub local_path: String,
    pub file_size: u64,
    /// Hex SHA-256 of the file contents.
    pub file_hash: String,
    pub captured_at: DateTime<Utc>,
    pub step_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackerStats {
    pub task_id: String,
    pub total_steps: usize,
    pub successful_steps: usize,
    pub failed_steps: usize,
    /// Fraction in [0, 1].
    pub success_rate: f64,
    pub total_duration_ms: u64,
    pub average_step_duration_ms: f64,
    pub screenshots_count: usize,
    pub is_enabled: bool,
    pub queued: usize,
    pub flushes: usize,
}

pub type StepCallback = Arc<dyn Fn(&StepData) -> anyhow::Result<()> + Send + Sync>;

struct TrackerState {
    enabled: bool,
    step_number: usize,
    successful: usize,
    failed: usize,
    total_duration_ms: u64,
    steps: Vec<StepData>,
    screenshots: HashMap<String, ScreenshotInfo>,
    callbacks: Vec<StepCallback>,
}

struct Inner {
    task_id: String,
    cfg: TrackerConfig,
    sink: Option<Arc<dyn StepSink>>,
    tx: mpsc::Sender<StepData>,
    rx: Mutex<mpsc::Receiver<StepData>>,
    flushing: AtomicBool,
    flushes: AtomicUsize,
    workers: Semaphore,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<TrackerState>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    fn spawn_flush(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let Ok(_permit) = inner.workers.acquire().await else {
                return;
            };
            inner.flush().await;
        });
        let mut in_flight = lock(&self.in_flight);
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    fn drain(&self) -> Vec<StepData> {
        let mut rx = lock(&self.rx);
        let mut batch = Vec::new();
        while let Ok(step) = rx.try_recv() {
            batch.push(step);
        }
        batch
    }

    /// Drains the queue until empty. Re-entrant calls return immediately.
    async fn flush(&self) {
        loop {
            if self.flushing.swap(true, Ordering::AcqRel) {
                return;
            }
            let batch = self.drain();
            if !batch.is_empty() {
                self.persist(&batch).await;
            }
            self.flushing.store(false, Ordering::Release);
            if batch.is_empty() || self.queued() == 0 {
                return;
            }
        }
    }

    async fn persist(&self, batch: &[StepData]) {
        let seq = self.flushes.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(sink) = &self.sink {
            let saved = sink.save_batch(batch).await;
            if saved < batch.len() {
                warn!(task_id = %self.task_id, saved, total = batch.len(), "some steps were not persisted");
            }
        }
        if let Some(dir) = &self.cfg.backup_dir {
            if let Err(err) = self.write_backup(dir, batch, seq).await {
                error!(task_id = %self.task_id, "failed to write step backup: {err:#}");
            }
        }
        info!(task_id = %self.task_id, count = batch.len(), "flushed steps");
    }

    async fn write_backup(&self, dir: &Path, batch: &[StepData], seq: usize) -> anyhow::Result<()> {
        async_fs::create_dir_all(dir).await?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("{}_{}_{:04}.json", self.task_id, stamp, seq));
        async_fs::write(&path, serde_json::to_vec_pretty(batch)?).await?;
        debug!(path = %path.display(), "wrote step backup");
        Ok(())
    }
}

async fn screenshot_info(path: &str, step_id: &str) -> anyhow::Result<ScreenshotInfo> {
    let bytes = async_fs::read(path).await?;
    let digest = Sha256::digest(&bytes);
    let file_hash = hex::encode(digest);
    Ok(ScreenshotInfo {
        local_path: path.to_string(),
        file_size: bytes.len() as u64,
        file_hash,
        captured_at: Utc::now(),
        step_id: step_id.to_string(),
    })
}

/// A step opened with [`StepTracker::start_step`]. Fill in `entry` as the step
/// progresses; `finish_step` stamps the elapsed time.
pub struct PendingStep {
    pub entry: StepEntry,
    started: Instant,
}

impl PendingStep {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

pub struct StepTracker {
    inner: Arc<Inner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl StepTracker {
    /// Starts the periodic flush timer when called inside a tokio runtime;
    /// otherwise only size-triggered and explicit flushes happen.
    pub fn new(task_id: impl Into<String>, cfg: TrackerConfig, sink: Option<Arc<dyn StepSink>>) -> Self {
        let task_id = task_id.into();
        let buffer_size = cfg.buffer_size.max(1);
        let (tx, rx) = mpsc::channel(buffer_size * 2);
        let interval = cfg.flush_interval;
        let inner = Arc::new(Inner {
            task_id,
            cfg: TrackerConfig { buffer_size, ..cfg },
            sink,
            tx,
            rx: Mutex::new(rx),
            flushing: AtomicBool::new(false),
            flushes: AtomicUsize::new(0),
            workers: Semaphore::new(FLUSH_WORKERS),
            in_flight: Mutex::new(Vec::new()),
            state: Mutex::new(TrackerState {
                enabled: true,
                step_number: 0,
                successful: 0,
                failed: 0,
                total_duration_ms: 0,
                steps: Vec::new(),
                screenshots: HashMap::new(),
                callbacks: Vec::new(),
            }),
        });

        let timer = match tokio::runtime::Handle::try_current() {
            Ok(handle) if !interval.is_zero() => Some(handle.spawn(flush_timer(Arc::downgrade(&inner), interval))),
            _ => None,
        };
        info!(task_id = %inner.task_id, "step tracker started");
        Self {
            inner,
            timer: Mutex::new(timer),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    pub fn enable(&self) {
        lock(&self.inner.state).enabled = true;
    }

    pub fn disable(&self) {
        lock(&self.inner.state).enabled = false;
    }

    pub fn add_step_callback(&self, callback: StepCallback) {
        lock(&self.inner.state).callbacks.push(callback);
    }

    /// Returns the stored record, or `None` while tracking is disabled.
    /// Waits only when the queue is full and a flush is still draining it.
    pub async fn record_step(&self, entry: StepEntry) -> Option<StepData> {
        let (data, callbacks) = {
            let mut state = lock(&self.inner.state);
            if !state.enabled {
                return None;
            }
            state.step_number += 1;
            let data = entry.into_data(&self.inner.task_id, state.step_number);
            if data.success {
                state.successful += 1;
            } else {
                state.failed += 1;
            }
            state.total_duration_ms += data.duration_ms.unwrap_or(0);
            state.steps.push(data.clone());
            (data, state.callbacks.clone())
        };

        if let Some(path) = &data.screenshot_path {
            match screenshot_info(path, &data.step_id).await {
                Ok(info) => {
                    lock(&self.inner.state).screenshots.insert(path.clone(), info);
                }
                Err(err) => warn!(path = %path, "failed to record screenshot: {err:#}"),
            }
        }

        let threshold = self.inner.cfg.buffer_size;
        if self.inner.queued() >= threshold {
            self.inner.spawn_flush();
        }
        if self.inner.tx.send(data.clone()).await.is_err() {
            error!(task_id = %self.inner.task_id, "step queue closed");
        }
        if self.inner.queued() >= threshold {
            debug!(task_id = %self.inner.task_id, "buffer full, triggering flush");
            self.inner.spawn_flush();
        }

        for callback in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&data))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("step callback failed: {err:#}"),
                Err(_) => error!("step callback panicked"),
            }
        }
        Some(data)
    }

    /// Opens a timed step, or `None` while tracking is disabled.
    pub fn start_step(&self, step_type: StepType, step_data: Value) -> Option<PendingStep> {
        if !lock(&self.inner.state).enabled {
            return None;
        }
        Some(PendingStep {
            entry: StepEntry::new(step_type, step_data),
            started: Instant::now(),
        })
    }

    /// Records `pending` with `duration_ms` set to the time since `start_step`,
    /// unless the caller already set one. Numbering follows finish order.
    pub async fn finish_step(&self, pending: PendingStep) -> Option<StepData> {
        let elapsed = u64::try_from(pending.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut entry = pending.entry;
        if entry.duration_ms.is_none() {
            entry.duration_ms = Some(elapsed);
        }
        self.record_step(entry).await
    }

    pub fn statistics(&self) -> TrackerStats {
        let state = lock(&self.inner.state);
        let total = state.step_number;
        let denom = total.max(1) as f64;
        TrackerStats {
            task_id: self.inner.task_id.clone(),
            total_steps: total,
            successful_steps: state.successful,
            failed_steps: state.failed,
            success_rate: state.successful as f64 / denom,
            total_duration_ms: state.total_duration_ms,
            average_step_duration_ms: state.total_duration_ms as f64 / denom,
            screenshots_count: state.screenshots.len(),
            is_enabled: state.enabled,
            queued: self.inner.queued(),
            flushes: self.inner.flushes.load(Ordering::Acquire),
        }
    }

    /// All recorded steps, or only the most recent `limit`.
    pub fn get_steps(&self, limit: Option<usize>) -> Vec<StepData> {
        let state = lock(&self.inner.state);
        let skip = match limit {
            Some(n) if n > 0 => state.steps.len().saturating_sub(n),
            _ => 0,
        };
        state.steps[skip..].to_vec()
    }

    pub fn screenshots(&self) -> Vec<ScreenshotInfo> {
        lock(&self.inner.state).screenshots.values().cloned().collect()
    }

    /// Hands everything queued so far to the sink and waits for in-flight
    /// flushes. The tracker stays usable.
    pub async fn flush(&self) {
        self.inner.flush().await;
        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.inner.in_flight));
        for result in join_all(pending).await {
            if let Err(err) = result {
                error!(task_id = %self.inner.task_id, "flush task failed: {err}");
            }
        }
        self.inner.flush().await;
    }

    /// Stops the timer and flushes.
    pub async fn cleanup(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
        self.flush().await;
        info!(task_id = %self.inner.task_id, "step tracker cleaned up");
    }
}

impl Drop for StepTracker {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }
}

async fn flush_timer(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.queued() > 0 {
            inner.spawn_flush();
        }
    }
}
