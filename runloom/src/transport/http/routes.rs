//! HTTP route handlers.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use crate::health::Health;
use crate::health::{HealthResponse, SetupResult};
use crate::io::input::InputFetchError;
use crate::prediction::Prediction;
use crate::scheduler::dynamic::SchedulerError;
use crate::service::{CreatePredictionError, HealthSnapshot, PredictionService};
use crate::version::VersionInfo;
use crate::webhook::{TraceContext, WebhookConfig, WebhookEventType, WebhookSender};

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: HealthResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupResult>,
    pub version: VersionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_healthcheck_error: Option<String>,
}

impl HealthCheckResponse {
    pub fn from_snapshot(snapshot: HealthSnapshot, user_healthcheck_error: Option<String>) -> Self {
        // Determine response status
        let status = if user_healthcheck_error.is_some() {
            HealthResponse::Unhealthy
        } else if snapshot.is_busy() {
            HealthResponse::Busy
        } else {
            snapshot.state.into()
        };

        Self {
            status,
            setup: snapshot.setup_result,
            version: snapshot.version,
            user_healthcheck_error,
        }
    }
}

/// `context` carried by `/procedures` requests (dynamic mode only).
#[derive(Debug, Deserialize)]
pub struct ProcedureContext {
    pub procedure_source_url: String,
    #[allow(dead_code)]
    pub replicate_api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PredictionRequest {
    pub id: Option<String>,
    #[serde(
        default = "default_empty_input",
        deserialize_with = "deserialize_input"
    )]
    pub input: serde_json::Value,
    pub webhook: Option<String>,
    #[serde(default = "default_webhook_events_filter")]
    pub webhook_events_filter: Vec<WebhookEventType>,
    pub context: Option<ProcedureContext>,
}

impl Default for PredictionRequest {
    fn default() -> Self {
        Self {
            id: None,
            input: default_empty_input(),
            webhook: None,
            webhook_events_filter: default_webhook_events_filter(),
            context: None,
        }
    }
}

fn default_empty_input() -> serde_json::Value {
    serde_json::json!({})
}

fn deserialize_input<'de, D>(deserializer: D) -> Result<serde_json::Value, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(if value.is_null() {
        serde_json::json!({})
    } else {
        value
    })
}

fn default_webhook_events_filter() -> Vec<WebhookEventType> {
    vec![
        WebhookEventType::Start,
        WebhookEventType::Output,
        WebhookEventType::Logs,
        WebhookEventType::Completed,
    ]
}

/// A server-assigned prediction id: 26 characters, Crockford base32, encoding
/// a random v4 UUID's 128 bits padded to 130 (26 * 5).
fn generate_prediction_id() -> String {
    const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

    let uuid = uuid::Uuid::new_v4();
    let mut padded = [0u8; 17];
    padded[..16].copy_from_slice(uuid.as_bytes());

    let mut out = [0u8; 26];
    for (i, slot) in out.iter_mut().enumerate() {
        let bit_offset = i * 5;
        let byte_index = bit_offset / 8;
        let bit_in_byte = bit_offset % 8;
        let chunk = (padded[byte_index] as u16) << 8 | padded[byte_index + 1] as u16;
        let shift = 16 - bit_in_byte - 5;
        *slot = ALPHABET[((chunk >> shift) & 0x1f) as usize];
    }
    // SAFETY: every byte came from ALPHABET, which is ASCII.
    String::from_utf8(out.to_vec()).unwrap()
}

async fn health_check(State(service): State<Arc<PredictionService>>) -> Json<HealthCheckResponse> {
    let snapshot = service.health().await;

    // Run user healthcheck if ready (even when busy — healthcheck health
    // and slot availability are orthogonal concerns).
    let user_healthcheck_error = if snapshot.is_ready() {
        write_readiness_file();

        // Run user-defined healthcheck
        match service.healthcheck().await {
            Ok(result) if result.is_healthy() => None,
            Ok(result) => result.error,
            Err(e) => Some(format!("Healthcheck error: {}", e)),
        }
    } else {
        None
    };

    Json(HealthCheckResponse::from_snapshot(
        snapshot,
        user_healthcheck_error,
    ))
}

/// Write /var/run/cog/ready for K8s readiness probe.
fn write_readiness_file() {
    if std::env::var("KUBERNETES_SERVICE_HOST").is_err() {
        return;
    }

    let dir = std::path::Path::new("/var/run/cog");
    let file = dir.join("ready");

    if file.exists() {
        return;
    }

    if let Err(e) = std::fs::create_dir_all(dir) {
        tracing::warn!(error = %e, "Failed to create /var/run/cog directory");
        return;
    }

    if let Err(e) = std::fs::write(&file, b"") {
        tracing::warn!(error = %e, "Failed to write readiness file");
    }
}

fn should_respond_async(headers: &HeaderMap) -> bool {
    headers
        .get("prefer")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "respond-async")
        .unwrap_or(false)
}

fn extract_trace_context(headers: &HeaderMap) -> TraceContext {
    TraceContext {
        traceparent: headers
            .get("traceparent")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        tracestate: headers
            .get("tracestate")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
    }
}

fn build_webhook_sender(
    webhook: Option<String>,
    events_filter: HashSet<WebhookEventType>,
    trace_context: TraceContext,
) -> Option<WebhookSender> {
    let webhook_url = webhook?;
    Some(WebhookSender::with_trace_context(
        webhook_url,
        WebhookConfig {
            events_filter,
            ..Default::default()
        },
        trace_context,
    ))
}

/// Walk `input`'s top-level fields declared file-like by the worker's schema
/// (`PredictionService::file_like_fields()`), replacing any `http(s)://` URL
/// or `data:` URI value with the local path the server fetched/decoded it
/// to. Fields the schema doesn't mark file-like pass through unchanged, even
/// if their value happens to look like a URL — e.g. a free-text prompt.
///
/// Each resolved field's fetch-time content type is returned alongside the
/// rewritten input so later output-side content-type detection can consult
/// it as the highest-priority source.
async fn preprocess_input(
    service: &PredictionService,
    input: &serde_json::Value,
) -> Result<(serde_json::Value, std::collections::HashMap<String, String>), InputFetchError> {
    let Some(obj) = input.as_object() else {
        return Ok((input.clone(), std::collections::HashMap::new()));
    };

    let file_fields = service.file_like_fields().await;
    let mut content_types = std::collections::HashMap::new();
    let mut out = obj.clone();
    for (key, value) in out.iter_mut() {
        if !file_fields.contains(key) {
            continue;
        }
        if let serde_json::Value::String(s) = value
            && let Some(fetched) = service.input_fetcher().fetch_value(s).await?
        {
            let path = fetched.path.to_string_lossy().into_owned();
            if let Some(content_type) = fetched.content_type {
                content_types.insert(path.clone(), content_type);
            }
            *value = serde_json::Value::String(path);
        }
    }
    Ok((serde_json::Value::Object(out), content_types))
}

async fn create_prediction(
    State(service): State<Arc<PredictionService>>,
    headers: HeaderMap,
    body: Option<Json<PredictionRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let prediction_id = request.id.unwrap_or_else(generate_prediction_id);
    let respond_async = should_respond_async(&headers);
    let trace_context = extract_trace_context(&headers);
    create_prediction_with_id(
        service,
        prediction_id,
        request.input,
        request.webhook,
        request.webhook_events_filter,
        respond_async,
        trace_context,
        None,
    )
    .await
}

async fn create_prediction_idempotent(
    State(service): State<Arc<PredictionService>>,
    Path(prediction_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<PredictionRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    if let Some(ref req_id) = request.id
        && req_id != &prediction_id
    {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "detail": [{
                    "loc": ["body", "id"],
                    "msg": "prediction ID must match the ID supplied in the URL",
                    "type": "value_error"
                }]
            })),
        );
    }

    if let Some(existing) = service.supervisor().snapshot(&prediction_id) {
        return (StatusCode::ACCEPTED, Json(existing));
    }

    let respond_async = should_respond_async(&headers);
    let trace_context = extract_trace_context(&headers);
    create_prediction_with_id(
        service,
        prediction_id,
        request.input,
        request.webhook,
        request.webhook_events_filter,
        respond_async,
        trace_context,
        None,
    )
    .await
}

async fn create_procedure(
    State(service): State<Arc<PredictionService>>,
    headers: HeaderMap,
    body: Option<Json<PredictionRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let Some(context) = request.context else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "detail": [{
                    "loc": ["body", "context"],
                    "msg": "context.procedure_source_url is required",
                    "type": "value_error.missing"
                }]
            })),
        );
    };

    let prediction_id = request.id.unwrap_or_else(generate_prediction_id);
    let respond_async = should_respond_async(&headers);
    let trace_context = extract_trace_context(&headers);
    create_prediction_with_id(
        service,
        prediction_id,
        request.input,
        request.webhook,
        request.webhook_events_filter,
        respond_async,
        trace_context,
        Some(context.procedure_source_url),
    )
    .await
}

fn creation_error_response(err: CreatePredictionError) -> (StatusCode, Json<serde_json::Value>) {
    match err {
        CreatePredictionError::NotReady => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "Setup has not finished yet",
                "status": "failed"
            })),
        ),
        CreatePredictionError::NoDynamicScheduler => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "Dynamic mode is not configured",
                "status": "failed"
            })),
        ),
        CreatePredictionError::AtCapacity
        | CreatePredictionError::Scheduler(SchedulerError::NoCapacity) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "At capacity - all prediction slots busy",
                "status": "failed"
            })),
        ),
        CreatePredictionError::Scheduler(SchedulerError::SetupFailed(msg)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "error": format!("worker setup failed: {msg}"),
                "status": "failed"
            })),
        ),
    }
}

#[allow(clippy::too_many_arguments)]
async fn create_prediction_with_id(
    service: Arc<PredictionService>,
    prediction_id: String,
    input: serde_json::Value,
    webhook: Option<String>,
    webhook_events_filter: Vec<WebhookEventType>,
    respond_async: bool,
    trace_context: TraceContext,
    procedure_source_url: Option<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Err(errors) = service.validate_input(&input).await {
        let detail: Vec<serde_json::Value> = errors
            .into_iter()
            .map(|e| {
                serde_json::json!({
                    "loc": ["body", "input", e.field],
                    "msg": e.msg,
                    "type": e.error_type
                })
            })
            .collect();
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "detail": detail })),
        );
    }

    // The worker gets the raw (preprocessed, unmasked) input; the client
    // only ever sees `masked_input` echoed back, via the Prediction's own
    // stored input — this is what `create_prediction`/`create_procedure`
    // below use, keeping secrets out of every later snapshot and webhook.
    let masked_input = service.mask_secrets(&input).await;

    let events_filter: HashSet<WebhookEventType> = webhook_events_filter.into_iter().collect();
    let webhook_sender = build_webhook_sender(webhook, events_filter.clone(), trace_context);

    let (dispatch_input, content_types) = match preprocess_input(&service, &input).await {
        Ok(v) => v,
        Err(e) => {
            // No slot was ever acquired for this prediction, so build and
            // finalize a real `Prediction` here instead of going through
            // `PredictionService::create_prediction()` — the response still
            // gets the full, uniform snapshot shape (output/created_at/metrics).
            let mut failed =
                Prediction::new(prediction_id, masked_input, webhook_sender, events_filter);
            failed.set_failed(format!("input preprocessing failed: {e}"));
            let snapshot = failed.snapshot();
            if let Some(webhook) = failed.take_webhook() {
                webhook
                    .send_terminal(WebhookEventType::Completed, &snapshot)
                    .await;
            }
            return (StatusCode::OK, Json(snapshot));
        }
    };

    let output_dir = service
        .output_dir_for(&prediction_id)
        .to_string_lossy()
        .into_owned();

    if let Some(source_url) = procedure_source_url {
        let (lease, mut slot, handle) = match service
            .create_procedure(
                prediction_id.clone(),
                masked_input,
                webhook_sender,
                events_filter,
                &source_url,
            )
            .await
        {
            Ok(v) => v,
            Err(e) => return creation_error_response(e),
        };
        slot.prediction()
            .lock()
            .unwrap()
            .set_input_content_types(content_types);

        if respond_async {
            let snapshot = slot.prediction().lock().unwrap().snapshot();
            tokio::spawn(async move {
                let _ = service
                    .predict_procedure(&lease, &mut slot, output_dir, dispatch_input)
                    .await;
            });
            return (StatusCode::ACCEPTED, Json(snapshot));
        }

        let mut sync_guard = handle.sync_guard();
        let prediction = slot.prediction();
        let result_rx = {
            let (tx, rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                let result = service
                    .predict_procedure(&lease, &mut slot, output_dir, dispatch_input)
                    .await;
                let _ = tx.send(result);
            });
            rx
        };
        let _ = result_rx.await;
        sync_guard.disarm();
        let snapshot = prediction.lock().unwrap().snapshot();
        return (status_for_snapshot(&snapshot), Json(snapshot));
    }

    let (mut slot, handle) = match service
        .create_prediction(prediction_id.clone(), masked_input, webhook_sender, events_filter)
        .await
    {
        Ok(v) => v,
        Err(e) => return creation_error_response(e),
    };
    slot.prediction()
        .lock()
        .unwrap()
        .set_input_content_types(content_types);

    if respond_async {
        let snapshot = slot.prediction().lock().unwrap().snapshot();
        tokio::spawn(async move {
            let _ = service.predict(&mut slot, output_dir, dispatch_input).await;
        });
        return (StatusCode::ACCEPTED, Json(snapshot));
    }

    // Sync mode: spawn the prediction into a background task so the slot
    // lifetime is NOT tied to the HTTP connection. If the client disconnects,
    // dropping `sync_guard` fires cancel, but the slot/permit stays alive in
    // the spawned task until the worker acknowledges the cancel.
    let mut sync_guard = handle.sync_guard();
    let prediction = slot.prediction();
    let result_rx = {
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let result = service.predict(&mut slot, output_dir, dispatch_input).await;
            let _ = tx.send(result);
        });
        rx
    };

    // Wait for the prediction to complete. If the connection drops, axum
    // cancels this future, dropping sync_guard which fires cancel.
    let _ = result_rx.await;
    sync_guard.disarm();

    let snapshot = prediction.lock().unwrap().snapshot();
    (status_for_snapshot(&snapshot), Json(snapshot))
}

/// 200 for both success and failure (parity with the Python predictor -
/// prediction failure is data, not an HTTP error), 200 for canceled too.
fn status_for_snapshot(snapshot: &serde_json::Value) -> StatusCode {
    let _ = snapshot;
    StatusCode::OK
}

async fn cancel_prediction(
    State(service): State<Arc<PredictionService>>,
    Path(prediction_id): Path<String>,
) -> impl IntoResponse {
    let cancelled = service.cancel(&prediction_id);

    if cancelled {
        (StatusCode::OK, Json(serde_json::json!({})))
    } else {
        (StatusCode::NOT_FOUND, Json(serde_json::json!({})))
    }
}

async fn shutdown(State(service): State<Arc<PredictionService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.shutdown().await;
    (StatusCode::OK, Json(serde_json::json!({})))
}

async fn openapi_schema(State(service): State<Arc<PredictionService>>) -> impl IntoResponse {
    match service.schema().await {
        Some(schema) => (StatusCode::OK, Json(schema)),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "OpenAPI schema not available"
            })),
        ),
    }
}

pub fn routes(service: Arc<PredictionService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/openapi.json", get(openapi_schema))
        .route("/shutdown", post(shutdown))
        .route("/predictions", post(create_prediction))
        .route("/predictions/{id}", put(create_prediction_idempotent))
        .route("/predictions/{id}/cancel", post(cancel_prediction))
        .route("/procedures", post(create_procedure))
        .with_state(service)
}
