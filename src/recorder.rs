//! Replay-oriented record of one task: metadata plus the ordered list of
//! executed actions, saved as JSON alongside an optional standalone replayer.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tracing::{info, warn};

use crate::action::Action;
use crate::device::APP_PACKAGES;
use crate::error::AgentError;

const TASK_NAME_LIMIT: usize = 50;
const FILENAME_TASK_LIMIT: usize = 20;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptStep {
    pub step_number: usize,
    pub action_type: String,
    pub action_data: Value,
    pub thinking: String,
    /// Relative to the recorder's output directory.
    pub screenshot_path: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptMetadata {
    pub task_name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub total_steps: usize,
    pub device_id: Option<String>,
    pub model_name: Option<String>,
    pub success_rate: Option<f64>,
    pub execution_time: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptDocument {
    #[serde(default)]
    pub metadata: Option<ScriptMetadata>,
    #[serde(default)]
    pub steps: Vec<ScriptStep>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn success_rate(steps: &[ScriptStep]) -> f64 {
    if steps.is_empty() {
        return 0.0;
    }
    let ok = steps.iter().filter(|s| s.success).count();
    round2(ok as f64 / steps.len() as f64 * 100.0)
}

fn display_name(task: &str) -> String {
    if task.chars().count() > TASK_NAME_LIMIT {
        let head: String = task.chars().take(TASK_NAME_LIMIT).collect();
        format!("{head}...")
    } else {
        task.to_string()
    }
}

pub struct ScriptRecorder {
    output_dir: PathBuf,
    screenshot_dir: PathBuf,
    steps: Vec<ScriptStep>,
    metadata: Option<ScriptMetadata>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

impl ScriptRecorder {
    /// Creates `output_dir` and its `screenshots/` subdirectory.
    pub fn new(output_dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let output_dir = output_dir.as_ref().to_path_buf();
        let screenshot_dir = output_dir.join("screenshots");
        std::fs::create_dir_all(&screenshot_dir)
            .map_err(|e| AgentError::Persistence(format!("create_dir {}: {}", screenshot_dir.display(), e)))?;
        Ok(Self {
            output_dir,
            screenshot_dir,
            steps: Vec::new(),
            metadata: None,
            started_at: None,
            stopped_at: None,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn is_recording(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn start_recording(&mut self, task: &str, device_id: Option<&str>, model_name: Option<&str>) {
        let now = Utc::now();
        self.steps.clear();
        self.started_at = Some(now);
        self.stopped_at = None;
        self.metadata = Some(ScriptMetadata {
            task_name: display_name(task),
            description: task.to_string(),
            created_at: now,
            total_steps: 0,
            device_id: device_id.map(str::to_string),
            model_name: model_name.map(str::to_string),
            success_rate: None,
            execution_time: None,
        });
    }

    /// Appends a fully built step. Screenshot persistence failures are logged
    /// and leave `screenshot_path` empty.
    pub async fn record_step(
        &mut self,
        action: &Action,
        thinking: &str,
        success: bool,
        error_message: Option<String>,
        screenshot_base64: Option<&str>,
    ) -> &ScriptStep {
        let step_number = self.steps.len() + 1;
        let screenshot_path = match screenshot_base64.filter(|s| !s.is_empty()) {
            Some(data) => match self.save_screenshot(data, step_number).await {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(step = step_number, "failed to save screenshot: {err}");
                    None
                }
            },
            None => None,
        };

        let action_data = action.to_payload();
        let action_type = action_data
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        self.steps.push(ScriptStep {
            step_number,
            action_type,
            action_data,
            thinking: thinking.to_string(),
            screenshot_path,
            timestamp: Utc::now(),
            success,
            error_message,
        });
        if let Some(meta) = &mut self.metadata {
            meta.total_steps = self.steps.len();
        }
        &self.steps[step_number - 1]
    }

    async fn save_screenshot(&self, data: &str, step_number: usize) -> Result<String, AgentError> {
        let payload = match data.split_once(',') {
            Some((_, b64)) => b64,
            None => data,
        };
        let png = B64
            .decode(payload.trim())
            .map_err(|e| AgentError::Persistence(format!("b64 decode: {}", e)))?;
        let name = format!("step_{:03}.png", step_number);
        async_fs::write(self.screenshot_dir.join(&name), png)
            .await
            .map_err(|e| AgentError::Persistence(format!("write: {}", e)))?;
        Ok(format!("screenshots/{name}"))
    }

    /// Freezes the clock used for `execution_time`, e.g. at a stop request.
    pub fn stop_clock(&mut self, at: DateTime<Utc>) {
        if self.started_at.is_some() && self.stopped_at.is_none() {
            self.stopped_at = Some(at);
        }
    }

    /// Recomputes the derived metadata. Safe to call more than once; the step
    /// list is never touched.
    pub fn finish_recording(&mut self, success: bool) {
        let Some(started) = self.started_at else {
            return;
        };
        let end = self.stopped_at.unwrap_or_else(Utc::now);
        let elapsed = (end - started).num_milliseconds().max(0) as f64 / 1000.0;
        let rate = success_rate(&self.steps);
        if let Some(meta) = &mut self.metadata {
            meta.total_steps = self.steps.len();
            meta.execution_time = Some(round2(elapsed));
            meta.success_rate = Some(rate);
            info!(
                task = %meta.task_name,
                steps = meta.total_steps,
                success_rate = rate,
                task_success = success,
                "recording finished"
            );
        }
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }

    pub fn metadata(&self) -> Option<&ScriptMetadata> {
        self.metadata.as_ref()
    }

    pub fn document(&self) -> ScriptDocument {
        ScriptDocument {
            metadata: self.metadata.clone(),
            steps: self.steps.clone(),
        }
    }

    fn default_filename(&self) -> String {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let task: String = match &self.metadata {
            Some(meta) => meta
                .task_name
                .replace([' ', '/'], "_")
                .chars()
                .take(FILENAME_TASK_LIMIT)
                .collect(),
            None => "task".into(),
        };
        format!("{stamp}_{task}.json")
    }

    /// Writes `{metadata, steps}` as pretty JSON under the output directory.
    pub async fn save_script(&self, filename: Option<&str>) -> Result<PathBuf, AgentError> {
        let mut name = match filename.filter(|f| !f.is_empty()) {
            Some(f) => f.to_string(),
            None => self.default_filename(),
        };
        if !name.ends_with(".json") {
            name.push_str(".json");
        }
        let path = self.output_dir.join(name);
        let body = serde_json::to_vec_pretty(&self.document())
            .map_err(|e| AgentError::Persistence(format!("serialize script: {}", e)))?;
        async_fs::write(&path, body)
            .await
            .map_err(|e| AgentError::Persistence(format!("write {}: {}", path.display(), e)))?;
        info!(path = %path.display(), "script saved");
        Ok(path)
    }

    pub async fn load_script(path: impl AsRef<Path>) -> Result<ScriptDocument, AgentError> {
        let path = path.as_ref();
        let bytes = async_fs::read(path)
            .await
            .map_err(|e| AgentError::Persistence(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::Persistence(format!("parse {}: {}", path.display(), e)))
    }

    /// Emits `<stem>_replay.py` next to the saved script. The replayer needs
    /// only Python 3 and `adb` on PATH.
    pub async fn generate_python_script(&self, json_filename: impl AsRef<Path>) -> Result<PathBuf, AgentError> {
        let stem = json_filename
            .as_ref()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("script");
        let script_name = format!("{stem}_replay.py");
        let path = self.output_dir.join(&script_name);
        let packages: serde_json::Map<String, Value> = APP_PACKAGES
            .iter()
            .map(|(name, pkg)| (name.to_string(), Value::from(*pkg)))
            .collect();
        let packages = serde_json::to_string_pretty(&packages)
            .map_err(|e| AgentError::Persistence(format!("app table: {}", e)))?;
        let code = REPLAY_TEMPLATE
            .replace("@APP_PACKAGES@", &packages)
            .replace("@SCRIPT_NAME@", &script_name)
            .replace("@GENERATED_AT@", &Utc::now().to_rfc3339());
        async_fs::write(&path, code)
            .await
            .map_err(|e| AgentError::Persistence(format!("write {}: {}", path.display(), e)))?;
        Ok(path)
    }

    pub fn summary(&self) -> String {
        let Some(meta) = &self.metadata else {
            return "No recording in progress".to_string();
        };
        let mut out = String::new();
        let _ = writeln!(out, "Script Recording Summary:");
        let _ = writeln!(out, "Task: {}", meta.task_name);
        let _ = writeln!(out, "Steps: {}", meta.total_steps);
        let _ = writeln!(out, "Device: {}", meta.device_id.as_deref().unwrap_or("default"));
        let _ = writeln!(out, "Model: {}", meta.model_name.as_deref().unwrap_or("default"));
        if !self.steps.is_empty() {
            let _ = writeln!(out, "Success Rate: {}%", success_rate(&self.steps));
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for step in &self.steps {
                *counts.entry(step.action_type.as_str()).or_default() += 1;
            }
            let _ = writeln!(out, "Action Breakdown:");
            for (action, count) in counts {
                let _ = writeln!(out, "  {action}: {count}");
            }
        }
        out
    }
}

const REPLAY_TEMPLATE: &str = r##"#!/usr/bin/env python3
"""
Replay script generated by phone-hands on @GENERATED_AT@.

Usage:
    python @SCRIPT_NAME@ <script_file.json>

Requires adb on PATH.
"""

import base64
import json
import subprocess
import sys
import time
from pathlib import Path


def adb(device_id, *args):
    cmd = ["adb"]
    if device_id:
        cmd += ["-s", device_id]
    cmd += list(args)
    return subprocess.run(cmd, capture_output=True, text=True).stdout


APP_PACKAGES = @APP_PACKAGES@


def package_for(app):
    wanted = app.strip()
    for name, package in APP_PACKAGES.items():
        if name.lower() == wanted.lower():
            return package
    if "." in wanted:
        return wanted
    return None


def screen_size(device_id):
    out = adb(device_id, "shell", "wm", "size")
    for line in out.splitlines():
        if ":" in line:
            dims = line.split(":")[-1].strip()
            if "x" in dims:
                w, h = dims.split("x", 1)
                return int(w), int(h)
    return 1080, 2400


def to_pixels(point, size):
    return int(point[0] / 1000 * size[0]), int(point[1] / 1000 * size[1])


class Replay:
    def __init__(self, json_file):
        with open(json_file, "r", encoding="utf-8") as f:
            data = json.load(f)
        self.metadata = data.get("metadata") or {}
        self.steps = data.get("steps") or []

    def print_info(self):
        print("=" * 60)
        print("Task: %s" % self.metadata.get("task_name", "Unknown"))
        print("Description: %s" % self.metadata.get("description", ""))
        print("Total Steps: %s" % self.metadata.get("total_steps", len(self.steps)))
        print("Success Rate: %s%%" % self.metadata.get("success_rate", 0))
        if self.metadata.get("execution_time"):
            print("Original Execution Time: %ss" % self.metadata["execution_time"])
        print("=" * 60)

    def run_step(self, data, device_id, size):
        name = data.get("action")
        if name == "Launch":
            app = data.get("app")
            package = package_for(app) if app else None
            if package:
                print("Launching %s (%s)" % (app, package))
                adb(device_id, "shell", "monkey", "-p", package, "-c",
                    "android.intent.category.LAUNCHER", "1")
            else:
                print("App not found: %s" % app)
        elif name in ("Tap", "Double Tap", "Long Press"):
            element = data.get("element") or []
            if len(element) >= 2:
                x, y = to_pixels(element, size)
                print("%s at (%d, %d)" % (name, x, y))
                if name == "Long Press":
                    adb(device_id, "shell", "input", "swipe", str(x), str(y), str(x), str(y), "3000")
                else:
                    adb(device_id, "shell", "input", "tap", str(x), str(y))
                    if name == "Double Tap":
                        adb(device_id, "shell", "input", "tap", str(x), str(y))
        elif name in ("Type", "Type_Name"):
            text = data.get("text", "")
            if text:
                print("Typing %s" % text[:50])
                # ADB Keyboard accepts any Unicode; `input text` does not.
                encoded = base64.b64encode(text.encode("utf-8")).decode("ascii")
                adb(device_id, "shell", "am", "broadcast", "-a", "ADB_CLEAR_TEXT")
                adb(device_id, "shell", "am", "broadcast", "-a", "ADB_INPUT_B64", "--es", "msg", encoded)
        elif name == "Swipe":
            start, end = data.get("start") or [], data.get("end") or []
            if len(start) >= 2 and len(end) >= 2:
                sx, sy = to_pixels(start, size)
                ex, ey = to_pixels(end, size)
                print("Swiping (%d, %d) -> (%d, %d)" % (sx, sy, ex, ey))
                adb(device_id, "shell", "input", "swipe", str(sx), str(sy), str(ex), str(ey), "500")
        elif name == "Back":
            print("Back")
            adb(device_id, "shell", "input", "keyevent", "4")
        elif name == "Home":
            print("Home")
            adb(device_id, "shell", "input", "keyevent", "KEYCODE_HOME")
        elif name == "Wait":
            try:
                seconds = float(str(data.get("duration", "1")).replace("seconds", "").strip())
            except ValueError:
                seconds = 1.0
            print("Waiting %ss" % seconds)
            time.sleep(seconds)
        else:
            print("Unknown action: %s" % name)

    def replay(self, device_id=None, delay=1.0):
        self.print_info()
        print("Device: %s, delay %ss" % (device_id or "default", delay))
        input("Press Enter to start, or Ctrl+C to cancel...")
        size = screen_size(device_id)
        done = 0
        try:
            for i, step in enumerate(self.steps, 1):
                print("--- Step %d/%d: %s ---" % (i, len(self.steps), step.get("action_type")))
                if not step.get("success", True):
                    print("Skipping failed step: %s" % step.get("error_message"))
                    continue
                self.run_step(step.get("action_data") or {}, device_id, size)
                done += 1
                if delay > 0 and i < len(self.steps):
                    time.sleep(delay)
        except KeyboardInterrupt:
            print("\nReplay interrupted by user")
            return
        print("Replay completed: %d/%d steps" % (done, len(self.steps)))


def main():
    if len(sys.argv) != 2:
        print("Usage: python @SCRIPT_NAME@ <script_file.json>")
        sys.exit(1)
    if not Path(sys.argv[1]).exists():
        print("Script file not found: %s" % sys.argv[1])
        sys.exit(1)
    replay = Replay(sys.argv[1])
    device_id = input("Enter device ID (press Enter for default): ").strip() or None
    delay_str = input("Enter delay between actions in seconds (default 1.0): ").strip()
    try:
        delay = float(delay_str) if delay_str else 1.0
    except ValueError:
        delay = 1.0
    replay.replay(device_id=device_id, delay=delay)


if __name__ == "__main__":
    main()
"##;
