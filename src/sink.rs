use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::recorder::ScriptDocument;
use crate::tracker::StepData;

/// Durable destination for step telemetry. Implementations must be
/// idempotent per `step_id`.
#[async_trait]
pub trait StepSink: Send + Sync {
    async fn save_step(&self, step: &StepData) -> Result<(), AgentError>;

    /// Returns how many steps were stored. A failing item is logged and skipped.
    async fn save_batch(&self, steps: &[StepData]) -> usize {
        let mut saved = 0;
        for step in steps {
            match self.save_step(step).await {
                Ok(()) => saved += 1,
                Err(err) => warn!(step_id = %step.step_id, "failed to persist step: {err}"),
            }
        }
        saved
    }
}

/// Receives one finalized script document per task.
#[async_trait]
pub trait ScriptSink: Send + Sync {
    async fn save_script(&self, document: &ScriptDocument) -> Result<(), AgentError>;
}

/// Keeps steps in memory; re-saving a step id replaces the earlier copy.
#[derive(Default)]
pub struct MemoryStepSink {
    steps: Mutex<Vec<StepData>>,
}

impl MemoryStepSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> Vec<StepData> {
        self.steps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.steps.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StepSink for MemoryStepSink {
    async fn save_step(&self, step: &StepData) -> Result<(), AgentError> {
        let mut steps = self.steps.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match steps.iter_mut().find(|s| s.step_id == step.step_id) {
            Some(existing) => *existing = step.clone(),
            None => steps.push(step.clone()),
        }
        Ok(())
    }
}

/// Appends one JSON object per line. A step id already present in the file
/// is not written again.
pub struct JsonlStepSink {
    path: PathBuf,
    /// Step ids on disk; loaded from the file on first write.
    written: tokio::sync::Mutex<Option<HashSet<String>>>,
}

impl JsonlStepSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            written: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn existing_ids(&self) -> Result<HashSet<String>, AgentError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(AgentError::Persistence(format!("read {}: {}", self.path.display(), e))),
        };
        Ok(text
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|v| v.get("step_id").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    /// Writes the lines whose ids are new and returns how many were new.
    async fn append(&self, lines: Vec<(String, Vec<u8>)>) -> Result<usize, AgentError> {
        let mut written = self.written.lock().await;
        if written.is_none() {
            *written = Some(self.existing_ids().await?);
        }
        let seen = written.get_or_insert_with(HashSet::new);

        let mut buf = Vec::new();
        let mut fresh = HashSet::new();
        for (id, line) in lines {
            if seen.contains(&id) || !fresh.insert(id.clone()) {
                debug!(step_id = %id, "step already written, skipping");
                continue;
            }
            buf.extend_from_slice(&line);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::Persistence(format!("create_dir: {}", e)))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AgentError::Persistence(format!("open {}: {}", self.path.display(), e)))?;
        file.write_all(&buf)
            .await
            .map_err(|e| AgentError::Persistence(format!("write: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| AgentError::Persistence(format!("flush: {}", e)))?;
        let count = fresh.len();
        seen.extend(fresh);
        Ok(count)
    }
}

fn to_line(step: &StepData) -> Result<(String, Vec<u8>), AgentError> {
    let mut line = serde_json::to_vec(step)
        .map_err(|e| AgentError::Persistence(format!("serialize step: {}", e)))?;
    line.push(b'\n');
    Ok((step.step_id.clone(), line))
}

#[async_trait]
impl StepSink for JsonlStepSink {
    async fn save_step(&self, step: &StepData) -> Result<(), AgentError> {
        self.append(vec![to_line(step)?]).await.map(|_| ())
    }

    /// Counts repeats of already-written ids as saved.
    async fn save_batch(&self, steps: &[StepData]) -> usize {
        let mut lines = Vec::with_capacity(steps.len());
        for step in steps {
            match to_line(step) {
                Ok(line) => lines.push(line),
                Err(err) => warn!(step_id = %step.step_id, "skipping step: {err}"),
            }
        }
        let count = lines.len();
        match self.append(lines).await {
            Ok(_) => count,
            Err(err) => {
                warn!(path = %self.path.display(), "failed to append steps: {err}");
                0
            }
        }
    }
}
