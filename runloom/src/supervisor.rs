//! Prediction supervisor - tracks in-flight predictions for lookup and cancellation.
//!
//! Separates lifecycle tracking from HTTP handlers, enabling:
//! - Polling a prediction's current snapshot from a second request (async mode)
//! - Cancellation by id without threading a handle through the transport layer
//! - Lock-free concurrent access via DashMap
//!
//! The supervisor does not own prediction execution — it just holds a
//! reference to the same `Arc<Mutex<Prediction>>` the orchestrator event loop
//! writes into and the permit holder (`PredictionSlot`) finalizes, and fires
//! the terminal webhook once the prediction completes.

use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;

use crate::orchestrator::Orchestrator;
use crate::prediction::{CancellationToken, Prediction};
use crate::webhook::WebhookEventType;

/// Handle to a submitted prediction for waiting and cancellation.
pub struct PredictionHandle {
    id: String,
    prediction: Arc<StdMutex<Prediction>>,
    supervisor: Arc<PredictionSupervisor>,
}

impl PredictionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(&self) {
        let notify = self.prediction.lock().unwrap().completion();
        notify.notified().await;
    }

    pub fn snapshot(&self) -> serde_json::Value {
        self.prediction.lock().unwrap().snapshot()
    }

    pub fn cancel(&self) {
        self.supervisor.cancel(&self.id);
    }

    pub fn is_complete(&self) -> bool {
        self.prediction.lock().unwrap().is_terminal()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.prediction.lock().unwrap().cancel_token()
    }

    /// Create a guard that cancels on drop (for sync predictions).
    ///
    /// On drop (e.g. HTTP connection closed), the guard calls
    /// `supervisor.cancel(id)` which fires the CancellationToken AND
    /// delegates to the orchestrator to cancel the worker subprocess.
    pub fn sync_guard(&self) -> SyncPredictionGuard {
        SyncPredictionGuard::new(self.id.clone(), Arc::clone(&self.supervisor))
    }
}

/// Guard for sync predictions - cancels on drop unless disarmed.
///
/// When the HTTP connection drops (client disconnect), axum drops the
/// response future which drops this guard. The guard calls
/// `supervisor.cancel(id)` to trigger both the CancellationToken
/// (Rust-side observers) and the orchestrator (worker subprocess cancel).
pub struct SyncPredictionGuard {
    prediction_id: Option<String>,
    supervisor: Arc<PredictionSupervisor>,
}

impl SyncPredictionGuard {
    pub fn new(prediction_id: String, supervisor: Arc<PredictionSupervisor>) -> Self {
        Self {
            prediction_id: Some(prediction_id),
            supervisor,
        }
    }

    pub fn disarm(&mut self) {
        self.prediction_id = None;
    }
}

impl Drop for SyncPredictionGuard {
    fn drop(&mut self) {
        if let Some(ref id) = self.prediction_id {
            self.supervisor.cancel(id);
        }
    }
}

/// Prediction supervisor with lock-free concurrent access.
pub struct PredictionSupervisor {
    predictions: DashMap<String, Arc<StdMutex<Prediction>>>,
    orchestrator: tokio::sync::RwLock<Option<Arc<dyn Orchestrator>>>,
}

impl PredictionSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            predictions: DashMap::new(),
            orchestrator: tokio::sync::RwLock::new(None),
        })
    }

    /// Set the orchestrator handle for cancel delegation.
    pub async fn set_orchestrator(&self, orchestrator: Arc<dyn Orchestrator>) {
        *self.orchestrator.write().await = Some(orchestrator);
    }

    /// Track a prediction already under construction elsewhere (the caller
    /// keeps its own `Arc` to finalize the permit once execution finishes).
    /// Spawns a task that fires the terminal webhook and drops the tracking
    /// entry once the prediction completes.
    pub fn track(self: &Arc<Self>, prediction: Arc<StdMutex<Prediction>>) -> PredictionHandle {
        let id = prediction.lock().unwrap().id().to_string();
        self.predictions.insert(id.clone(), Arc::clone(&prediction));

        let supervisor = Arc::clone(self);
        let watched = Arc::clone(&prediction);
        let watched_id = id.clone();
        tokio::spawn(async move {
            let notify = watched.lock().unwrap().completion();
            notify.notified().await;

            let (snapshot, webhook, filter) = {
                let mut p = watched.lock().unwrap();
                (p.snapshot(), p.take_webhook(), p.webhook_events_filter().clone())
            };

            if let Some(webhook) = webhook
                && filter.contains(&WebhookEventType::Completed)
            {
                webhook
                    .send_terminal(WebhookEventType::Completed, &snapshot)
                    .await;
            }

            supervisor.predictions.remove(&watched_id);
        });

        PredictionHandle {
            id,
            prediction,
            supervisor: Arc::clone(self),
        }
    }

    /// Cancel a prediction by ID.
    ///
    /// Fires the CancellationToken (for Rust-side observers like upload tasks)
    /// and delegates to the orchestrator to send `ControlRequest::Cancel` to the worker.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(entry) = self.predictions.get(id) else {
            return false;
        };
        entry.lock().unwrap().cancel_token().cancel();

        // Delegate to orchestrator to actually cancel the worker-side prediction.
        // This must be non-blocking since cancel() is sync, so we spawn a task.
        let id_owned = id.to_string();
        let orchestrator = self
            .orchestrator
            .try_read()
            .ok()
            .and_then(|guard| guard.clone());
        if let Some(orch) = orchestrator {
            tokio::spawn(async move {
                if let Err(e) = orch.cancel_by_prediction_id(&id_owned).await {
                    tracing::error!(
                        prediction_id = %id_owned,
                        error = %e,
                        "Failed to send cancel to orchestrator"
                    );
                }
            });
        }
        true
    }

    pub fn snapshot(&self, id: &str) -> Option<serde_json::Value> {
        self.predictions.get(id).map(|p| p.lock().unwrap().snapshot())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.predictions.contains_key(id)
    }

    pub fn remove(&self, id: &str) {
        self.predictions.remove(id);
    }
}

impl Default for PredictionSupervisor {
    fn default() -> Self {
        Self {
            predictions: DashMap::new(),
            orchestrator: tokio::sync::RwLock::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::WebhookEventType;

    fn tracked_prediction(id: &str) -> Arc<StdMutex<Prediction>> {
        Arc::new(StdMutex::new(Prediction::new(
            id.to_string(),
            serde_json::json!({"x": 1}),
            None,
            WebhookEventType::all(),
        )))
    }

    #[tokio::test]
    async fn track_and_complete_removes_entry() {
        let supervisor = PredictionSupervisor::new();
        let prediction = tracked_prediction("test-1");
        let handle = supervisor.track(Arc::clone(&prediction));

        assert_eq!(handle.id(), "test-1");
        assert!(supervisor.exists("test-1"));

        prediction
            .lock()
            .unwrap()
            .set_succeeded(crate::prediction::PredictionOutput::Single(serde_json::json!(
                "result"
            )));
        handle.wait().await;

        // terminal-webhook task removes the entry asynchronously; give it a tick.
        tokio::task::yield_now().await;
        assert!(!supervisor.exists("test-1"));
    }

    #[tokio::test]
    async fn cancel_prediction() {
        let supervisor = PredictionSupervisor::new();
        let prediction = tracked_prediction("test-cancel");
        let handle = supervisor.track(prediction);

        assert!(supervisor.cancel("test-cancel"));
        assert!(handle.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn cancel_unknown_returns_false() {
        let supervisor = PredictionSupervisor::new();
        assert!(!supervisor.cancel("nonexistent"));
    }

    #[tokio::test]
    async fn exists_check() {
        let supervisor = PredictionSupervisor::new();
        assert!(!supervisor.exists("exists-test"));
        supervisor.track(tracked_prediction("exists-test"));
        assert!(supervisor.exists("exists-test"));
    }

    #[tokio::test]
    async fn sync_guard_cancels_on_drop() {
        let supervisor = PredictionSupervisor::new();
        let handle = supervisor.track(tracked_prediction("test-sync-guard"));
        let cancel_token = handle.cancel_token();

        {
            let _guard = handle.sync_guard();
            assert!(!cancel_token.is_cancelled());
        }

        assert!(cancel_token.is_cancelled());
    }

    #[tokio::test]
    async fn sync_guard_disarm_prevents_cancel() {
        let supervisor = PredictionSupervisor::new();
        let handle = supervisor.track(tracked_prediction("test-disarm"));
        let cancel_token = handle.cancel_token();

        {
            let mut guard = handle.sync_guard();
            guard.disarm();
        }

        assert!(!cancel_token.is_cancelled());
    }
}
