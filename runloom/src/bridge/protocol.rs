//! Wire protocol types for server-worker communication.
//!
//! Two channels:
//! - **Control channel** (stdin/stdout): ControlRequest/ControlResponse —
//!   setup, healthcheck, cancel, shutdown signals.
//! - **Slot sockets**: SlotRequest/SlotResponse — prediction data, streaming
//!   logs and outputs (per-slot, avoids head-of-line blocking across
//!   concurrently-running predictions on the same worker).

use serde::{Deserialize, Serialize};

use super::transport::ChildTransportInfo;

// ============================================================================
// SlotId - unique identifier for prediction slots
// ============================================================================

/// Unique identifier for a prediction slot.
///
/// Uses UUID v4 for guaranteed uniqueness. Impossible to confuse with array
/// indices or accidentally reuse. Generated once per slot at worker startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(uuid::Uuid);

impl SlotId {
    /// Generate a new unique slot ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Parse a SlotId from string (UUID format).
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Control channel protocol (stdin/stdout)
// ============================================================================

/// Control messages from server to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Sent once immediately after spawn with the predictor reference, the
    /// socket info to dial, and the number of slot sockets the worker should
    /// open. The worker replies with exactly one `Ready` (or `Failed`/`Fatal`).
    Init {
        predictor_ref: String,
        num_slots: usize,
        transport_info: ChildTransportInfo,
        is_train: bool,
        is_async: bool,
    },

    /// Cancel prediction on a slot.
    Cancel {
        /// Unique slot ID to cancel.
        slot: SlotId,
    },

    /// Ask the worker to run its user-defined healthcheck. The server
    /// coalesces these: only one request is ever outstanding per worker.
    Healthcheck { id: String },

    /// Graceful shutdown - finish current work and exit.
    Shutdown,
}

/// Control messages from worker to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Worker is ready to accept predictions.
    Ready {
        /// Slot IDs for each socket (index 0 = first socket, etc).
        /// Server uses these IDs for all subsequent slot communication.
        slots: Vec<SlotId>,
        /// OpenAPI schema for the predictor.
        #[serde(skip_serializing_if = "Option::is_none")]
        schema: Option<serde_json::Value>,
    },

    /// Log message (used during setup before slots are active).
    Log {
        /// Log source (stdout or stderr).
        source: LogSource,
        /// Log data.
        data: String,
    },

    /// A structured log record produced by the worker's own logging
    /// machinery, re-emitted under the server's tracing dispatch at its
    /// original level and target.
    WorkerLog {
        level: String,
        target: String,
        message: String,
    },

    /// The worker's internal log buffer overflowed and dropped lines.
    DroppedLogs { count: u64, interval_millis: u64 },

    /// Slot is now idle (prediction completed, ready for next).
    Idle {
        /// Unique slot ID that became idle.
        slot: SlotId,
    },

    /// Slot prediction was cancelled.
    Cancelled {
        /// Unique slot ID that was cancelled.
        slot: SlotId,
    },

    /// Slot failed (poisoned, will not accept more predictions).
    Failed {
        /// Unique slot ID that failed.
        slot: SlotId,
        /// Error message.
        error: String,
    },

    /// Setup, or the worker process itself, hit an unrecoverable error.
    /// The worker aborts immediately after sending this.
    Fatal { reason: String },

    /// Reply to a `Healthcheck` request, correlated by id.
    HealthcheckResult {
        id: String,
        status: HealthcheckStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Worker is shutting down.
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthcheckStatus {
    Healthy,
    Unhealthy,
}

impl HealthcheckStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

// ============================================================================
// SlotOutcome - type-safe completion status (prevents Idle if poisoned)
// ============================================================================

/// Outcome of a slot operation - enforces that poisoned slots produce Failed.
///
/// This type makes it impossible to accidentally send `Idle` for a poisoned slot.
/// Use `into_control_response()` to get the appropriate `ControlResponse`.
#[derive(Debug)]
pub enum SlotOutcome {
    /// Slot completed normally, ready for more work.
    Idle(SlotId),
    /// Slot is poisoned, will not accept more predictions.
    Poisoned { slot: SlotId, error: String },
}

impl SlotOutcome {
    /// Create an idle outcome (slot ready for more work).
    pub fn idle(slot: SlotId) -> Self {
        Self::Idle(slot)
    }

    /// Create a poisoned outcome (slot permanently failed).
    pub fn poisoned(slot: SlotId, error: impl Into<String>) -> Self {
        Self::Poisoned {
            slot,
            error: error.into(),
        }
    }

    /// Get the slot ID.
    pub fn slot_id(&self) -> SlotId {
        match self {
            Self::Idle(slot) => *slot,
            Self::Poisoned { slot, .. } => *slot,
        }
    }

    /// Check if this outcome indicates the slot is poisoned.
    pub fn is_poisoned(&self) -> bool {
        matches!(self, Self::Poisoned { .. })
    }

    /// Convert to the appropriate ControlResponse.
    ///
    /// This is the ONLY way to create Idle/Failed responses from a completion,
    /// ensuring poisoned slots always produce Failed.
    pub fn into_control_response(self) -> ControlResponse {
        match self {
            Self::Idle(slot) => ControlResponse::Idle { slot },
            Self::Poisoned { slot, error } => ControlResponse::Failed { slot, error },
        }
    }
}

// ============================================================================
// Slot socket protocol (per-slot data channel)
// ============================================================================

/// Messages from server to worker on a slot socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotRequest {
    /// Run a prediction.
    Predict {
        /// Unique prediction ID.
        id: String,
        /// Input to the predictor (JSON object), already preprocessed
        /// (URL/base64 file inputs resolved to local paths).
        input: serde_json::Value,
        /// Per-prediction scratch directory for file outputs; removed by
        /// the server on finalization.
        output_dir: String,
    },
}

/// How a file-shaped output produced by the worker should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutputKind {
    /// The file holds a JSON value too large to inline over the socket.
    Oversized,
    /// The file is a genuine file-shaped model output (image, audio, ...)
    /// for the output postprocessor to upload or base64-encode.
    FileType,
}

/// How a metric value combines with any existing value under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricMode {
    Replace,
    Increment,
    Append,
}

/// Messages from worker to server on a slot socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotResponse {
    /// Log output during prediction (streaming).
    Log {
        id: String,
        source: LogSource,
        data: String,
    },

    /// Worker has begun executing the prediction body.
    Status { id: String },

    /// Streaming output (for generators). `index` is monotonically
    /// increasing per prediction id.
    Output {
        id: String,
        output: serde_json::Value,
        index: u64,
    },

    /// A file-shaped output the worker wrote to disk instead of inlining.
    FileOutput {
        id: String,
        filename: String,
        kind: FileOutputKind,
        index: u64,
    },

    Metric {
        id: String,
        name: String,
        value: serde_json::Value,
        mode: MetricMode,
    },

    /// Prediction completed successfully.
    Done {
        /// Prediction ID.
        id: String,
        /// Final output (for non-generators, or None if already streamed).
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        /// Prediction time in seconds.
        predict_time: f64,
    },

    /// Prediction failed.
    Failed {
        /// Prediction ID.
        id: String,
        /// Error message.
        error: String,
    },

    /// Prediction was cancelled.
    Cancelled {
        /// Prediction ID.
        id: String,
    },
}

/// Log source for streaming logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Fixed slot ID for deterministic tests
    fn test_slot_id() -> SlotId {
        SlotId(uuid::Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap())
    }

    fn test_transport_info() -> ChildTransportInfo {
        ChildTransportInfo {
            dir: std::path::PathBuf::from("/tmp/runloom-1"),
            num_slots: 1,
        }
    }

    // Control channel tests
    #[test]
    fn control_init_serializes() {
        let req = ControlRequest::Init {
            predictor_ref: "predict.py:Predictor".to_string(),
            num_slots: 1,
            transport_info: test_transport_info(),
            is_train: false,
            is_async: false,
        };
        insta::assert_json_snapshot!(req);
    }

    #[test]
    fn control_cancel_serializes() {
        let req = ControlRequest::Cancel {
            slot: test_slot_id(),
        };
        insta::assert_json_snapshot!(req);
    }

    #[test]
    fn control_healthcheck_serializes() {
        let req = ControlRequest::Healthcheck {
            id: "hc_1".to_string(),
        };
        insta::assert_json_snapshot!(req);
    }

    #[test]
    fn control_shutdown_serializes() {
        let req = ControlRequest::Shutdown;
        insta::assert_json_snapshot!(req);
    }

    #[test]
    fn control_ready_serializes() {
        let resp = ControlResponse::Ready {
            slots: vec![test_slot_id()],
            schema: None,
        };
        insta::assert_json_snapshot!(resp);
    }

    #[test]
    fn control_ready_with_schema_serializes() {
        let resp = ControlResponse::Ready {
            slots: vec![test_slot_id()],
            schema: Some(json!({
                "openapi": "3.0.2",
                "info": {"title": "Cog", "version": "0.1.0"}
            })),
        };
        insta::assert_json_snapshot!(resp);
    }

    #[test]
    fn control_idle_serializes() {
        let resp = ControlResponse::Idle {
            slot: test_slot_id(),
        };
        insta::assert_json_snapshot!(resp);
    }

    #[test]
    fn control_failed_serializes() {
        let resp = ControlResponse::Failed {
            slot: test_slot_id(),
            error: "segfault".to_string(),
        };
        insta::assert_json_snapshot!(resp);
    }

    #[test]
    fn control_fatal_serializes() {
        let resp = ControlResponse::Fatal {
            reason: "panic in setup".to_string(),
        };
        insta::assert_json_snapshot!(resp);
    }

    #[test]
    fn control_healthcheck_result_serializes() {
        let resp = ControlResponse::HealthcheckResult {
            id: "hc_1".to_string(),
            status: HealthcheckStatus::Unhealthy,
            error: Some("gpu unreachable".to_string()),
        };
        insta::assert_json_snapshot!(resp);
    }

    #[test]
    fn slot_outcome_idle_is_not_poisoned() {
        let outcome = SlotOutcome::idle(test_slot_id());
        assert!(!outcome.is_poisoned());
        assert!(matches!(
            outcome.into_control_response(),
            ControlResponse::Idle { .. }
        ));
    }

    #[test]
    fn slot_outcome_poisoned_always_produces_failed() {
        let outcome = SlotOutcome::poisoned(test_slot_id(), "boom");
        assert!(outcome.is_poisoned());
        assert!(matches!(
            outcome.into_control_response(),
            ControlResponse::Failed { .. }
        ));
    }

    // Slot socket tests
    #[test]
    fn slot_predict_serializes() {
        let req = SlotRequest::Predict {
            id: "pred_123".to_string(),
            input: json!({"text": "hello"}),
            output_dir: "/tmp/pred_123".to_string(),
        };
        insta::assert_json_snapshot!(req);
    }

    #[test]
    fn slot_output_serializes() {
        let resp = SlotResponse::Output {
            id: "pred_123".to_string(),
            output: json!("chunk 1"),
            index: 0,
        };
        insta::assert_json_snapshot!(resp);
    }

    #[test]
    fn slot_done_serializes() {
        let resp = SlotResponse::Done {
            id: "pred_123".to_string(),
            output: Some(json!("final result")),
            predict_time: 1.234,
        };
        insta::assert_json_snapshot!(resp);
    }

    #[test]
    fn slot_failed_serializes() {
        let resp = SlotResponse::Failed {
            id: "pred_123".to_string(),
            error: "ValueError: invalid input".to_string(),
        };
        insta::assert_json_snapshot!(resp);
    }

    #[test]
    fn slot_cancelled_serializes() {
        let resp = SlotResponse::Cancelled {
            id: "pred_123".to_string(),
        };
        insta::assert_json_snapshot!(resp);
    }

    #[test]
    fn metric_mode_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(MetricMode::Increment).unwrap(),
            json!("increment")
        );
    }
}
