use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::action::{DO_MARKER, FINISH_MARKER};
use crate::error::AgentError;
use crate::stop::StopSignalHandler;

/// Hard ceiling for a single retried request, whatever the base timeout.
pub const MAX_RETRY_TIMEOUT: Duration = Duration::from_secs(120);
const MONITOR_CAPACITY: usize = 1000;

// ========================= Configuration =========================

#[derive(Clone, Debug)]
pub struct TimeoutConfig {
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    pub max_retries: u32,
    pub enable_adaptive: bool,
    /// Seconds added per character of text content.
    pub content_factor: f64,
    /// Seconds added per inlined image.
    pub image_factor: f64,
    pub model_timeouts: HashMap<String, Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let model_timeouts = [
            ("autoglm-phone-9b", 35),
            ("gpt-4-vision-preview", 30),
            ("claude-3", 25),
            ("gpt-3.5-turbo", 20),
        ]
        .into_iter()
        .map(|(name, secs)| (name.to_string(), Duration::from_secs(secs)))
        .collect();
        Self {
            base_timeout: Duration::from_secs(25),
            max_timeout: Duration::from_secs(90),
            max_retries: 3,
            enable_adaptive: true,
            content_factor: 0.001,
            image_factor: 8.0,
            model_timeouts,
        }
    }
}

impl TimeoutConfig {
    pub fn model_timeout(&self, model_name: &str) -> Duration {
        self.model_timeouts
            .get(model_name)
            .copied()
            .unwrap_or(self.base_timeout)
    }
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub base_url: String,   // e.g. "http://localhost:8000/v1"
    pub api_key: String,    // env PHONE_AGENT_API_KEY
    pub model_name: String, // e.g. "autoglm-phone-9b"
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    /// Merged verbatim into the request body.
    pub extra_body: Map<String, Value>,
    pub timeouts: TimeoutConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: env::var("PHONE_AGENT_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000/v1".into()),
            api_key: env::var("PHONE_AGENT_API_KEY").unwrap_or_else(|_| "EMPTY".into()),
            model_name: env::var("PHONE_AGENT_MODEL").unwrap_or_else(|_| "autoglm-phone-9b".into()),
            max_tokens: 3000,
            temperature: 0.0,
            top_p: 0.85,
            frequency_penalty: 0.2,
            extra_body: Map::new(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

// ========================= Conversation =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One chat turn in the OpenAI-compatible wire shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(content.into()),
        }
    }

    /// A user turn; the image (base64 PNG) goes first so the text reads as its caption.
    pub fn user(text: impl Into<String>, image_base64: Option<&str>) -> Self {
        let mut parts = Vec::new();
        if let Some(b64) = image_base64.filter(|b| !b.is_empty()) {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/png;base64,{b64}"),
                },
            });
        }
        parts.push(ContentPart::Text { text: text.into() });
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn remove_images(&mut self) {
        if let MessageContent::Parts(parts) = &mut self.content {
            parts.retain(|part| matches!(part, ContentPart::Text { .. }));
        }
    }

    pub fn image_count(&self) -> usize {
        match &self.content {
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| matches!(p, ContentPart::ImageUrl { .. }))
                .count(),
            MessageContent::Text(_) => 0,
        }
    }

    pub fn text_len(&self) -> usize {
        match &self.content {
            MessageContent::Text(text) => text.chars().count(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        }
    }
}

/// The `{"current_app": ...}` block appended to every user turn.
pub fn screen_info(current_app: &str) -> String {
    json!({ "current_app": current_app }).to_string()
}

// ========================= Response parsing =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub thinking: String,
    pub action: String,
    pub raw_content: String,
}

/// Splits raw model output into (thinking, action). Never fails: text with no
/// recognizable marker becomes the action verbatim.
pub fn parse_response(content: &str) -> (String, String) {
    for marker in [FINISH_MARKER, DO_MARKER] {
        if let Some(idx) = content.find(marker) {
            let thinking = content[..idx].trim().to_string();
            return (thinking, content[idx..].to_string());
        }
    }
    if let Some((before, after)) = content.split_once("<answer>") {
        let thinking = before.replace("<think>", "").replace("</think>", "");
        let action = after.replace("</answer>", "");
        return (thinking.trim().to_string(), action.trim().to_string());
    }
    (String::new(), content.to_string())
}

// ========================= Timeouts & retries =========================

#[derive(Clone, Debug)]
pub struct TimeoutStrategy {
    cfg: TimeoutConfig,
}

impl TimeoutStrategy {
    pub fn new(cfg: TimeoutConfig) -> Self {
        Self { cfg }
    }

    /// `clamp(base + chars * content_factor + images * image_factor, base, max)`.
    /// With adaptation off the per-model table applies, falling back to base.
    pub fn calculate_timeout(&self, model_name: &str, messages: &[Message]) -> Duration {
        if !self.cfg.enable_adaptive {
            return self.cfg.model_timeout(model_name);
        }
        let chars: usize = messages.iter().map(Message::text_len).sum();
        let images: usize = messages.iter().map(Message::image_count).sum();
        let secs = self.cfg.base_timeout.as_secs_f64()
            + chars as f64 * self.cfg.content_factor
            + images as f64 * self.cfg.image_factor;
        let secs = secs.clamp(
            self.cfg.base_timeout.as_secs_f64(),
            self.cfg.max_timeout.as_secs_f64().max(self.cfg.base_timeout.as_secs_f64()),
        );
        Duration::from_secs_f64(secs)
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            delays: [1, 2, 4].into_iter().map(Duration::from_secs).collect(),
        }
    }

    /// Delay before retry number `attempt + 1`; attempts past the table reuse its last entry.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(idx).copied().unwrap_or_default()
    }

    /// Request timeout for a given attempt: `base * 1.5^attempt`, capped at 120s on retries.
    pub fn timeout_for(&self, base: Duration, attempt: u32) -> Duration {
        if attempt == 0 {
            return base;
        }
        base.mul_f64(1.5_f64.powi(attempt as i32))
            .min(MAX_RETRY_TIMEOUT)
    }

    /// Runs `call` until it succeeds, fails with a non-timeout error, or the
    /// retry budget is spent. A pending stop aborts instead of sleeping.
    pub async fn run<T, F, Fut>(
        &self,
        stop: Option<&StopSignalHandler>,
        base_timeout: Duration,
        mut call: F,
    ) -> Result<T, AgentError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let mut attempt = 0;
        loop {
            let timeout = self.timeout_for(base_timeout, attempt);
            let err = match call(timeout).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.is_stop() || !err.is_timeout() {
                return Err(err);
            }
            if attempt >= self.max_retries {
                return Err(AgentError::Timeout(format!(
                    "Request timed out after {} attempts",
                    self.max_retries + 1
                )));
            }
            if let Some(stop) = stop {
                stop.check_stop()?;
            }
            let delay = self.delay_for(attempt);
            warn!(attempt = attempt + 1, ?delay, ?timeout, "model request timed out, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

// ========================= Monitoring =========================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestStat {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub duration_secs: f64,
    pub success: bool,
    pub timeout_secs: f64,
    pub is_timeout: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_requests: usize,
    pub success_rate: f64,
    pub timeout_rate: f64,
    pub average_duration: f64,
    pub models: Vec<String>,
}

/// Ring buffer of the most recent requests.
#[derive(Debug)]
pub struct TimeoutMonitor {
    stats: VecDeque<RequestStat>,
    capacity: usize,
}

impl Default for TimeoutMonitor {
    fn default() -> Self {
        Self::with_capacity(MONITOR_CAPACITY)
    }
}

impl TimeoutMonitor {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            stats: VecDeque::with_capacity(capacity.min(MONITOR_CAPACITY)),
            capacity,
        }
    }

    pub fn record(&mut self, model: &str, duration: Duration, success: bool, timeout: Duration) {
        self.stats.push_back(RequestStat {
            timestamp: Utc::now(),
            model: model.to_string(),
            duration_secs: duration.as_secs_f64(),
            success,
            timeout_secs: timeout.as_secs_f64(),
            is_timeout: !success && duration >= timeout,
        });
        while self.stats.len() > self.capacity {
            self.stats.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    fn recent(&self, hours: u32) -> impl Iterator<Item = &RequestStat> {
        let cutoff = Utc::now() - chrono::Duration::hours(i64::from(hours));
        self.stats.iter().filter(move |s| s.timestamp > cutoff)
    }

    pub fn timeout_rate(&self, hours: u32) -> f64 {
        let (total, timeouts) = self
            .recent(hours)
            .fold((0usize, 0usize), |(t, n), s| (t + 1, n + usize::from(s.is_timeout)));
        if total == 0 {
            return 0.0;
        }
        timeouts as f64 / total as f64
    }

    /// Mean duration of successful requests, optionally for one model.
    pub fn average_duration(&self, model: Option<&str>, hours: u32) -> f64 {
        let durations: Vec<f64> = self
            .recent(hours)
            .filter(|s| s.success && model.map_or(true, |m| s.model == m))
            .map(|s| s.duration_secs)
            .collect();
        if durations.is_empty() {
            return 0.0;
        }
        durations.iter().sum::<f64>() / durations.len() as f64
    }

    pub fn summary(&self, hours: u32) -> Option<PerformanceStats> {
        let recent: Vec<&RequestStat> = self.recent(hours).collect();
        if recent.is_empty() {
            return None;
        }
        let total = recent.len() as f64;
        let models: BTreeSet<String> = recent.iter().map(|s| s.model.clone()).collect();
        Some(PerformanceStats {
            total_requests: recent.len(),
            success_rate: recent.iter().filter(|s| s.success).count() as f64 / total,
            timeout_rate: recent.iter().filter(|s| s.is_timeout).count() as f64 / total,
            average_duration: recent.iter().map(|s| s.duration_secs).sum::<f64>() / total,
            models: models.into_iter().collect(),
        })
    }
}

// ========================= Transport =========================

/// One raw completion round-trip. Implementations must honor `timeout` and
/// report it as [`AgentError::Timeout`] (or a message mentioning it).
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(&self, messages: &[Message], timeout: Duration) -> Result<String, AgentError>;
}

/// OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiTransport {
    http: Client,
    cfg: ModelConfig,
}

impl OpenAiTransport {
    pub fn new(cfg: ModelConfig) -> Result<Self, AgentError> {
        let http = Client::builder()
            .build()
            .map_err(|e| AgentError::Model(format!("http client: {e}")))?;
        Ok(Self { http, cfg })
    }

    fn request_body(&self, messages: &[Message]) -> Value {
        let mut body = json!({
            "model": self.cfg.model_name,
            "messages": messages,
            "max_tokens": self.cfg.max_tokens,
            "temperature": self.cfg.temperature,
            "top_p": self.cfg.top_p,
            "frequency_penalty": self.cfg.frequency_penalty,
            "stream": false,
        });
        if let Some(obj) = body.as_object_mut() {
            for (key, value) in &self.cfg.extra_body {
                obj.insert(key.clone(), value.clone());
            }
        }
        body
    }
}

fn classify(err: reqwest::Error) -> AgentError {
    if err.is_timeout() {
        AgentError::Timeout(err.to_string())
    } else {
        AgentError::Model(err.to_string())
    }
}

#[async_trait]
impl ChatTransport for OpenAiTransport {
    async fn complete(&self, messages: &[Message], timeout: Duration) -> Result<String, AgentError> {
        let url = format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .timeout(timeout)
            .json(&self.request_body(messages))
            .send()
            .await
            .map_err(classify)?;
        let status = resp.status();
        let text = resp.text().await.map_err(classify)?;
        if !status.is_success() {
            return Err(AgentError::Model(format!("API error {status}: {text}")));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| AgentError::Model(format!("failed to parse response JSON: {e}")))?;
        v.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AgentError::Model("response missing choices[0].message.content".into()))
    }
}

// ========================= Client =========================

/// Adaptive-timeout, retrying, stop-aware wrapper around a [`ChatTransport`].
#[derive(Clone)]
pub struct ModelClient {
    cfg: ModelConfig,
    transport: Arc<dyn ChatTransport>,
    strategy: TimeoutStrategy,
    retry: RetryPolicy,
    monitor: Arc<Mutex<TimeoutMonitor>>,
    stop: Option<Arc<StopSignalHandler>>,
}

impl ModelClient {
    pub fn new(cfg: ModelConfig) -> Result<Self, AgentError> {
        let transport = Arc::new(OpenAiTransport::new(cfg.clone())?);
        Ok(Self::with_transport(cfg, transport))
    }

    pub fn with_transport(cfg: ModelConfig, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            strategy: TimeoutStrategy::new(cfg.timeouts.clone()),
            retry: RetryPolicy::new(cfg.timeouts.max_retries),
            cfg,
            transport,
            monitor: Arc::new(Mutex::new(TimeoutMonitor::default())),
            stop: None,
        }
    }

    pub fn with_stop_handler(mut self, stop: Arc<StopSignalHandler>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    pub fn model_name(&self) -> &str {
        &self.cfg.model_name
    }

    fn monitor(&self) -> MutexGuard<'_, TimeoutMonitor> {
        self.monitor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn request(&self, messages: &[Message]) -> Result<ModelResponse, AgentError> {
        self.request_with_timeout(messages, None).await
    }

    /// `timeout = None` uses the adaptive calculation.
    pub async fn request_with_timeout(
        &self,
        messages: &[Message],
        timeout: Option<Duration>,
    ) -> Result<ModelResponse, AgentError> {
        let timeout = timeout
            .unwrap_or_else(|| self.strategy.calculate_timeout(&self.cfg.model_name, messages));
        let started = Instant::now();
        let outcome = self
            .retry
            .run(self.stop.as_deref(), timeout, |t| self.attempt(messages, t))
            .await;
        let elapsed = started.elapsed();
        self.monitor()
            .record(&self.cfg.model_name, elapsed, outcome.is_ok(), timeout);
        debug!(model = %self.cfg.model_name, ?elapsed, ok = outcome.is_ok(), "model request finished");
        outcome
    }

    async fn attempt(&self, messages: &[Message], timeout: Duration) -> Result<ModelResponse, AgentError> {
        if let Some(stop) = &self.stop {
            stop.check_stop()?;
        }
        let raw_content = self.transport.complete(messages, timeout).await?;
        if let Some(stop) = &self.stop {
            stop.check_stop()?;
        }
        let (thinking, action) = parse_response(&raw_content);
        Ok(ModelResponse {
            thinking,
            action,
            raw_content,
        })
    }

    pub fn performance_stats(&self, hours: u32) -> Option<PerformanceStats> {
        self.monitor().summary(hours)
    }

    pub fn timeout_rate(&self, hours: u32) -> f64 {
        self.monitor().timeout_rate(hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::StopReason;
    use tokio::sync::Mutex as AsyncMutex;

    #[test]
    fn finish_marker_splits_thinking_from_action() {
        let raw = "Everything is done. finish(message=\"Sent\")";
        let (thinking, action) = parse_response(raw);
        assert_eq!(thinking, "Everything is done.");
        assert_eq!(action, "finish(message=\"Sent\")");
    }

    #[test]
    fn finish_marker_wins_over_do_marker() {
        let raw = "I could do(action=\"Back\") but finish(message=\"ok\")";
        let (thinking, action) = parse_response(raw);
        assert!(action.starts_with(FINISH_MARKER));
        assert!(!thinking.contains("finish"));
    }

    #[test]
    fn do_marker_splits() {
        let (thinking, action) =
            parse_response("Open the app first.\ndo(action=\"Launch\", app=\"Settings\")");
        assert_eq!(thinking, "Open the app first.");
        assert_eq!(action, "do(action=\"Launch\", app=\"Settings\")");
    }

    #[test]
    fn answer_tags_are_stripped() {
        let (thinking, action) =
            parse_response("<think>look at the screen</think><answer>Tap it</answer>");
        assert_eq!(thinking, "look at the screen");
        assert_eq!(action, "Tap it");
    }

    #[test]
    fn plain_text_becomes_the_action() {
        let (thinking, action) = parse_response("  no markers here ");
        assert_eq!(thinking, "");
        assert_eq!(action, "  no markers here ");
    }

    fn conversation(text: &str, images: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("sys")];
        for _ in 0..images {
            msgs.push(Message::user(text, Some("aGVsbG8=")));
        }
        msgs
    }

    #[test]
    fn adaptive_timeout_grows_linearly_and_clamps() {
        let strategy = TimeoutStrategy::new(TimeoutConfig::default());
        let one = strategy.calculate_timeout("m", &conversation("x", 1));
        // 25 + 4 chars * 0.001 + 8
        assert!((one.as_secs_f64() - 33.004).abs() < 1e-6);

        let many = strategy.calculate_timeout("m", &conversation("x", 20));
        assert_eq!(many, Duration::from_secs(90));

        let none = strategy.calculate_timeout("m", &[]);
        assert_eq!(none, Duration::from_secs(25));
    }

    #[test]
    fn disabled_adaptation_uses_model_table_or_base() {
        let cfg = TimeoutConfig {
            enable_adaptive: false,
            ..TimeoutConfig::default()
        };
        let strategy = TimeoutStrategy::new(cfg);
        let msgs = conversation("x", 3);
        assert_eq!(
            strategy.calculate_timeout("autoglm-phone-9b", &msgs),
            Duration::from_secs(35)
        );
        assert_eq!(strategy.calculate_timeout("other", &msgs), Duration::from_secs(25));
    }

    #[test]
    fn retry_delays_and_timeouts_follow_the_table() {
        let policy = RetryPolicy::new(5);
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(7), Duration::from_secs(4));

        let base = Duration::from_secs(40);
        assert_eq!(policy.timeout_for(base, 0), base);
        assert_eq!(policy.timeout_for(base, 1), Duration::from_secs(60));
        assert_eq!(policy.timeout_for(base, 2), Duration::from_secs(90));
        assert_eq!(policy.timeout_for(base, 3), MAX_RETRY_TIMEOUT);
    }

    #[test]
    fn remove_images_keeps_text() {
        let mut msg = Message::user("screen", Some("aGVsbG8="));
        assert_eq!(msg.image_count(), 1);
        msg.remove_images();
        assert_eq!(msg.image_count(), 0);
        assert_eq!(msg.text_len(), "screen".len());
    }

    #[test]
    fn user_message_serializes_to_openai_shape() {
        let v = serde_json::to_value(Message::user("hi", Some("AAA"))).unwrap();
        assert_eq!(v["role"], "user");
        assert_eq!(v["content"][0]["type"], "image_url");
        assert_eq!(v["content"][0]["image_url"]["url"], "data:image/png;base64,AAA");
        assert_eq!(v["content"][1], json!({"type": "text", "text": "hi"}));
    }

    #[test]
    fn monitor_is_bounded_and_computes_rates() {
        let mut monitor = TimeoutMonitor::with_capacity(3);
        let t = Duration::from_secs(10);
        monitor.record("a", Duration::from_secs(2), true, t);
        monitor.record("a", Duration::from_secs(11), false, t);
        monitor.record("b", Duration::from_secs(4), true, t);
        monitor.record("b", Duration::from_secs(1), false, t);
        assert_eq!(monitor.len(), 3);

        // remaining: a/11s timeout, b/4s ok, b/1s failed-not-timeout
        assert!((monitor.timeout_rate(24) - 1.0 / 3.0).abs() < 1e-9);
        assert!((monitor.average_duration(None, 24) - 4.0).abs() < 1e-9);
        assert_eq!(monitor.average_duration(Some("a"), 24), 0.0);

        let summary = monitor.summary(24).unwrap();
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.models, vec!["a".to_string(), "b".to_string()]);
        assert!((summary.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!(TimeoutMonitor::default().summary(24).is_none());
    }

    /// Replays scripted outcomes and records when and with what timeout it was called.
    struct ScriptedTransport {
        outcomes: AsyncMutex<VecDeque<Result<String, AgentError>>>,
        calls: AsyncMutex<Vec<(tokio::time::Instant, Duration)>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<String, AgentError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: AsyncMutex::new(outcomes.into()),
                calls: AsyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn complete(&self, _messages: &[Message], timeout: Duration) -> Result<String, AgentError> {
            self.calls.lock().await.push((tokio::time::Instant::now(), timeout));
            self.outcomes
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok("finish(message=\"done\")".into()))
        }
    }

    fn fixed_timeout_config() -> ModelConfig {
        ModelConfig {
            model_name: "test-model".into(),
            timeouts: TimeoutConfig {
                enable_adaptive: false,
                base_timeout: Duration::from_secs(20),
                ..TimeoutConfig::default()
            },
            ..ModelConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_timeouts_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            Err(AgentError::Timeout("request timed out".into())),
            Err(AgentError::Model("operation timed out".into())),
            Ok("Tap it. do(action=\"Tap\", element=[1, 2])".into()),
        ]);
        let client = ModelClient::with_transport(fixed_timeout_config(), transport.clone());

        let response = client.request(&[Message::system("s")]).await.unwrap();
        assert_eq!(response.thinking, "Tap it.");
        assert_eq!(response.action, "do(action=\"Tap\", element=[1, 2])");

        let calls = transport.calls.lock().await;
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].0 - calls[0].0, Duration::from_secs(1));
        assert_eq!(calls[2].0 - calls[1].0, Duration::from_secs(2));
        assert_eq!(calls[0].1, Duration::from_secs(20));
        assert_eq!(calls[1].1, Duration::from_secs(30));
        assert_eq!(calls[2].1, Duration::from_secs(45));

        let stats = client.performance_stats(24).unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.success_rate, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_timeouts_exhaust_retries() {
        let transport = ScriptedTransport::new(
            (0..4)
                .map(|_| Err(AgentError::Timeout("timed out".into())))
                .collect(),
        );
        let client = ModelClient::with_transport(fixed_timeout_config(), transport.clone());

        let err = client.request(&[]).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(ref m) if m.contains("4 attempts")));
        assert_eq!(transport.calls.lock().await.len(), 4);
        assert_eq!(client.performance_stats(24).unwrap().success_rate, 0.0);
    }

    #[tokio::test]
    async fn non_timeout_errors_are_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(AgentError::Model("401 unauthorized".into()))]);
        let client = ModelClient::with_transport(fixed_timeout_config(), transport.clone());

        let err = client.request(&[]).await.unwrap_err();
        assert!(matches!(err, AgentError::Model(_)));
        assert_eq!(transport.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn pending_stop_prevents_the_call() {
        let transport = ScriptedTransport::new(vec![]);
        let stop = Arc::new(StopSignalHandler::new());
        let client = ModelClient::with_transport(fixed_timeout_config(), transport.clone())
            .with_stop_handler(stop.clone());
        stop.stop(StopReason::UserRequest, Some("halt".into()));

        let err = client.request(&[]).await.unwrap_err();
        assert!(err.is_stop());
        assert!(transport.calls.lock().await.is_empty());
    }

    /// Times out once, then requests a stop so the retry sleep is skipped.
    struct StopDuringCall {
        stop: Arc<StopSignalHandler>,
        calls: AsyncMutex<usize>,
    }

    #[async_trait]
    impl ChatTransport for StopDuringCall {
        async fn complete(&self, _messages: &[Message], _timeout: Duration) -> Result<String, AgentError> {
            *self.calls.lock().await += 1;
            self.stop.stop(StopReason::UserRequest, None);
            Err(AgentError::Timeout("timed out".into()))
        }
    }

    #[tokio::test]
    async fn stop_during_retry_raises_cancellation() {
        let stop = Arc::new(StopSignalHandler::new());
        let transport = Arc::new(StopDuringCall {
            stop: stop.clone(),
            calls: AsyncMutex::new(0),
        });
        let client = ModelClient::with_transport(fixed_timeout_config(), transport.clone())
            .with_stop_handler(stop);

        let err = client.request(&[]).await.unwrap_err();
        assert!(err.is_stop());
        assert_eq!(*transport.calls.lock().await, 1);
    }
}
