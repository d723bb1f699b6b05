//! Prediction state tracking: the single in-memory record for one unit of work.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Notify;
pub use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::MetricMode;
use crate::webhook::{WebhookEventType, WebhookSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// Prediction output - a single value, or accumulated iterator items.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum PredictionOutput {
    Single(serde_json::Value),
    Stream(Vec<serde_json::Value>),
}

impl PredictionOutput {
    pub fn is_stream(&self) -> bool {
        matches!(self, PredictionOutput::Stream(_))
    }

    pub fn into_values(self) -> Vec<serde_json::Value> {
        match self {
            PredictionOutput::Single(v) => vec![v],
            PredictionOutput::Stream(v) => v,
        }
    }

    /// Get the final/only output value (last for stream, the value for single).
    pub fn final_value(&self) -> &serde_json::Value {
        match self {
            PredictionOutput::Single(v) => v,
            PredictionOutput::Stream(v) => v.last().unwrap_or(&serde_json::Value::Null),
        }
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Prediction lifecycle record. Owned exclusively by the lifecycle engine
/// from admission to finalization; other components only ever see
/// [`Prediction::snapshot`] output.
pub struct Prediction {
    id: String,
    input: serde_json::Value,
    cancel_token: CancellationToken,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    status: PredictionStatus,
    logs: String,
    outputs: Vec<serde_json::Value>,
    output: Option<PredictionOutput>,
    error: Option<String>,
    webhook: Option<WebhookSender>,
    webhook_events_filter: std::collections::HashSet<WebhookEventType>,
    completion: Arc<Notify>,
    /// User-emitted metrics. Merged with system metrics (predict_time) in terminal response.
    metrics: HashMap<String, serde_json::Value>,
    /// Set when the worker reported this prediction's slot as unusable
    /// (crashed, protocol error, explicit Failed-with-slot). The permit
    /// holder checks this after a terminal status to decide idle vs poisoned.
    slot_poisoned: bool,
    /// Content type captured at input-fetch time, keyed by the local path a
    /// file-like input was fetched/decoded to. Consulted by the output
    /// uploader as the highest-priority content-type source, ahead of
    /// extension-guessing, when a worker writes back one of these paths
    /// unchanged as an output.
    input_content_types: HashMap<String, String>,
}

impl Prediction {
    pub fn new(
        id: String,
        input: serde_json::Value,
        webhook: Option<WebhookSender>,
        webhook_events_filter: std::collections::HashSet<WebhookEventType>,
    ) -> Self {
        Self {
            id,
            input,
            cancel_token: CancellationToken::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: PredictionStatus::Starting,
            logs: String::new(),
            outputs: Vec::new(),
            output: None,
            error: None,
            webhook,
            webhook_events_filter,
            completion: Arc::new(Notify::new()),
            metrics: HashMap::new(),
            slot_poisoned: false,
            input_content_types: HashMap::new(),
        }
    }

    /// Record the content types captured while fetching this prediction's
    /// file-like inputs, keyed by local path.
    pub fn set_input_content_types(&mut self, content_types: HashMap<String, String>) {
        self.input_content_types = content_types;
    }

    /// Content type captured at fetch time for `path`, if it was a
    /// previously fetched input file.
    pub fn input_content_type(&self, path: &str) -> Option<&str> {
        self.input_content_types.get(path).map(String::as_str)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn status(&self) -> PredictionStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn webhook_events_filter(&self) -> &std::collections::HashSet<WebhookEventType> {
        &self.webhook_events_filter
    }

    /// First progress signal from the worker: records `started_at` once.
    pub fn set_processing(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = PredictionStatus::Processing;
    }

    fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
        if self.started_at.is_none() {
            self.started_at = self.completed_at;
        }
        // notify_one stores a permit so a future .notified().await will
        // consume it immediately. notify_waiters only wakes currently-
        // registered waiters and would race with the task that checks
        // is_terminal() then awaits — the notification can fire in
        // between. There is exactly one waiter per prediction, so
        // notify_one is semantically correct.
        self.completion.notify_one();
    }

    pub fn set_succeeded(&mut self, output: PredictionOutput) {
        self.status = PredictionStatus::Succeeded;
        self.output = Some(output);
        self.finish();
    }

    pub fn set_failed(&mut self, error: String) {
        self.status = PredictionStatus::Failed;
        self.error = Some(error);
        self.finish();
    }

    pub fn set_canceled(&mut self) {
        self.status = PredictionStatus::Canceled;
        self.finish();
    }

    /// Mark the worker-side slot backing this prediction unusable. Checked
    /// by the permit holder once the prediction reaches a terminal status.
    pub fn mark_slot_poisoned(&mut self) {
        self.slot_poisoned = true;
    }

    pub fn is_slot_poisoned(&self) -> bool {
        self.slot_poisoned
    }

    /// Elapsed wall-clock seconds from start to completion (0 if not yet started).
    pub fn predict_time(&self) -> f64 {
        let Some(started) = self.started_at else {
            return 0.0;
        };
        let completed = self.completed_at.unwrap_or_else(Utc::now);
        ((completed - started).num_milliseconds() as f64 / 1000.0).max(0.0)
    }

    pub fn append_log(&mut self, data: &str) {
        self.logs.push_str(data);
    }

    pub fn logs(&self) -> &str {
        &self.logs
    }

    /// Set a user metric with the given accumulation mode.
    ///
    /// - `Replace`: overwrites the value (or deletes if null).
    /// - `Increment`: adds to an existing numeric value. Errors silently if types mismatch.
    /// - `Append`: pushes onto an existing array, creating one if needed.
    ///
    /// Dot-path keys (e.g., "timing.preprocess") are resolved into nested objects.
    pub fn set_metric(&mut self, name: String, value: serde_json::Value, mode: MetricMode) {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() > 1 {
            self.set_metric_dotpath(&parts, value, mode);
            return;
        }

        match mode {
            MetricMode::Replace => {
                if value.is_null() {
                    self.metrics.remove(&name);
                } else {
                    self.metrics.insert(name, value);
                }
            }
            MetricMode::Increment => {
                let entry = self.metrics.entry(name).or_insert(serde_json::json!(0));
                if let (Some(existing), Some(delta)) = (entry.as_f64(), value.as_f64()) {
                    if entry.is_i64() && value.is_i64() {
                        *entry = serde_json::json!(existing as i64 + delta as i64);
                    } else if entry.is_u64() && value.is_u64() {
                        *entry = serde_json::json!(existing as u64 + delta as u64);
                    } else {
                        *entry = serde_json::json!(existing + delta);
                    }
                }
            }
            MetricMode::Append => {
                let entry = self
                    .metrics
                    .entry(name)
                    .or_insert(serde_json::Value::Array(vec![]));
                if let Some(arr) = entry.as_array_mut() {
                    arr.push(value);
                } else {
                    let existing = entry.take();
                    *entry = serde_json::json!([existing, value]);
                }
            }
        }
    }

    /// Resolve a dot-path key into nested objects and apply the metric.
    fn set_metric_dotpath(&mut self, parts: &[&str], value: serde_json::Value, mode: MetricMode) {
        debug_assert!(parts.len() > 1);

        let root_key = parts[0].to_string();

        let entry = self
            .metrics
            .entry(root_key)
            .or_insert_with(|| serde_json::json!({}));

        let mut current = entry;
        for &part in &parts[1..parts.len() - 1] {
            if !current.is_object() {
                *current = serde_json::json!({});
            }
            current = current
                .as_object_mut()
                .unwrap()
                .entry(part)
                .or_insert_with(|| serde_json::json!({}));
        }

        let leaf_key = parts[parts.len() - 1];

        if !current.is_object() {
            *current = serde_json::json!({});
        }
        let obj = current.as_object_mut().unwrap();

        match mode {
            MetricMode::Replace => {
                if value.is_null() {
                    obj.remove(leaf_key);
                } else {
                    obj.insert(leaf_key.to_string(), value);
                }
            }
            MetricMode::Increment => {
                let entry = obj.entry(leaf_key).or_insert(serde_json::json!(0));
                if let (Some(existing), Some(delta)) = (entry.as_f64(), value.as_f64()) {
                    if entry.is_i64() && value.is_i64() {
                        *entry = serde_json::json!(existing as i64 + delta as i64);
                    } else if entry.is_u64() && value.is_u64() {
                        *entry = serde_json::json!(existing as u64 + delta as u64);
                    } else {
                        *entry = serde_json::json!(existing + delta);
                    }
                }
            }
            MetricMode::Append => {
                let entry = obj
                    .entry(leaf_key)
                    .or_insert(serde_json::Value::Array(vec![]));
                if let Some(arr) = entry.as_array_mut() {
                    arr.push(value);
                } else {
                    let existing = entry.take();
                    *entry = serde_json::json!([existing, value]);
                }
            }
        }
    }

    pub fn metrics(&self) -> &HashMap<String, serde_json::Value> {
        &self.metrics
    }

    pub fn append_output(&mut self, output: serde_json::Value) {
        self.outputs.push(output);
        self.output = Some(PredictionOutput::Stream(self.outputs.clone()));
    }

    pub fn outputs(&self) -> &[serde_json::Value] {
        &self.outputs
    }

    pub fn output(&self) -> Option<&PredictionOutput> {
        self.output.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub async fn wait(&self) {
        if self.status.is_terminal() {
            return;
        }
        self.completion.notified().await;
    }

    pub fn completion(&self) -> Arc<Notify> {
        Arc::clone(&self.completion)
    }

    /// Take the webhook sender (for sending on drop / finalization).
    pub fn take_webhook(&mut self) -> Option<WebhookSender> {
        self.webhook.take()
    }

    pub fn webhook(&self) -> Option<&WebhookSender> {
        self.webhook.as_ref()
    }

    /// Build merged metrics object: user metrics + system metrics (predict_time).
    /// System metrics (predict_time) always win on conflict. Only attached on
    /// terminal snapshots, per the HTTP response contract.
    fn build_metrics(&self) -> Option<serde_json::Value> {
        if !self.is_terminal() {
            return if self.metrics.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(
                    self.metrics
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ))
            };
        }

        let predict_time = self.predict_time();

        let mut merged = serde_json::Map::new();
        for (k, v) in &self.metrics {
            merged.insert(k.clone(), v.clone());
        }
        merged.insert("predict_time".to_string(), serde_json::json!(predict_time));
        Some(serde_json::Value::Object(merged))
    }

    /// Build the full HTTP/webhook response shape for the current state.
    /// Called for both non-terminal (Starting/Processing) and terminal snapshots.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("id".to_string(), serde_json::json!(self.id));
        obj.insert(
            "status".to_string(),
            serde_json::json!(self.status.as_str()),
        );
        obj.insert("input".to_string(), self.input.clone());
        obj.insert(
            "output".to_string(),
            self.output
                .as_ref()
                .map(|o| serde_json::to_value(o).unwrap_or(serde_json::Value::Null))
                .unwrap_or(serde_json::Value::Null),
        );
        obj.insert("logs".to_string(), serde_json::json!(self.logs));
        if let Some(err) = &self.error {
            obj.insert("error".to_string(), serde_json::json!(err));
        }
        obj.insert(
            "created_at".to_string(),
            serde_json::json!(format_timestamp(self.created_at)),
        );
        if let Some(started) = self.started_at {
            obj.insert(
                "started_at".to_string(),
                serde_json::json!(format_timestamp(started)),
            );
        }
        if let Some(completed) = self.completed_at {
            obj.insert(
                "completed_at".to_string(),
                serde_json::json!(format_timestamp(completed)),
            );
        }
        if let Some(metrics) = self.build_metrics() {
            obj.insert("metrics".to_string(), metrics);
        }
        serde_json::Value::Object(obj)
    }
}
