//! Dynamic ("procedure") mode scheduling.
//!
//! `max_slots` slots, each bindable to a per-request predictor source URL.
//! A slot is bound to a source URL on first use; later requests for the same
//! URL reuse it (up to that predictor's declared `max_per_slot`). Requests for
//! an unseen URL take an empty slot, or evict an idle one. No empty or idle
//! slot means no capacity.
//!
//! Grounded on `crate::permit::pool::PermitPool`'s typestate idiom: a slot is
//! bound or empty the same way a permit is in-use, idle, or poisoned. Unlike
//! fixed mode, one `PermitPool` (and orchestrator) is spawned per *binding*,
//! not per process startup, since each dynamic slot may run a different
//! predictor over its lifetime.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::orchestrator::Orchestrator;
use crate::permit::PermitPool;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no capacity: all slots bound to other predictors")]
    NoCapacity,
    #[error("worker setup failed: {0}")]
    SetupFailed(String),
}

/// Spawns a worker bound to a source URL. Actual process spawning is left to
/// the caller (the bootstrap binary wires this to `orchestrator::spawn_worker`)
/// since the scheduler itself only owns slot bookkeeping.
#[async_trait]
pub trait DynamicWorkerSpawner: Send + Sync {
    async fn spawn(
        &self,
        source_url: &str,
    ) -> Result<(Arc<PermitPool>, Arc<dyn Orchestrator>), SchedulerError>;
}

struct Binding {
    source_url: String,
    current: usize,
    max_per_slot: usize,
    pool: Arc<PermitPool>,
    orchestrator: Arc<dyn Orchestrator>,
}

struct Slot {
    binding: Option<Binding>,
}

/// A granted slot, returned to the caller so it can dispatch via the bound
/// pool/orchestrator and later report completion.
pub struct SlotLease {
    pub index: usize,
    pub pool: Arc<PermitPool>,
    pub orchestrator: Arc<dyn Orchestrator>,
}

pub struct DynamicScheduler {
    slots: Vec<Mutex<Slot>>,
    default_max_per_slot: usize,
    spawner: Arc<dyn DynamicWorkerSpawner>,
}

impl DynamicScheduler {
    pub fn new(max_slots: usize, default_max_per_slot: usize, spawner: Arc<dyn DynamicWorkerSpawner>) -> Self {
        let slots = (0..max_slots)
            .map(|_| Mutex::new(Slot { binding: None }))
            .collect();
        Self {
            slots,
            default_max_per_slot: default_max_per_slot.max(1),
            spawner,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Run the admission algorithm for `source_url`.
    ///
    /// Step 1: reuse a slot already bound to this URL with headroom.
    /// Step 2: take an empty slot and spawn.
    /// Step 3: evict an idle slot (`current == 0`) and spawn.
    /// Step 4: no capacity.
    ///
    /// Ties within a class are broken by lowest slot index.
    pub async fn admit(&self, source_url: &str) -> Result<SlotLease, SchedulerError> {
        // Step 1: reuse with headroom. Single pass holding each slot's lock
        // briefly; lowest index wins because we scan in order and return on
        // the first match.
        for (index, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.lock().await;
            if let Some(binding) = &mut guard.binding
                && binding.source_url == source_url
                && binding.current < binding.max_per_slot
            {
                binding.current += 1;
                return Ok(SlotLease {
                    index,
                    pool: Arc::clone(&binding.pool),
                    orchestrator: Arc::clone(&binding.orchestrator),
                });
            }
        }

        // Step 2: empty slot.
        for (index, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.lock().await;
            if guard.binding.is_none() {
                return self.bind_and_spawn(index, guard, source_url).await;
            }
        }

        // Step 3: idle slot (current == 0), evict and rebind.
        for (index, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.lock().await;
            let is_idle = guard.binding.as_ref().is_some_and(|b| b.current == 0);
            if is_idle {
                guard.binding = None;
                return self.bind_and_spawn(index, guard, source_url).await;
            }
        }

        Err(SchedulerError::NoCapacity)
    }

    async fn bind_and_spawn(
        &self,
        index: usize,
        mut guard: tokio::sync::MutexGuard<'_, Slot>,
        source_url: &str,
    ) -> Result<SlotLease, SchedulerError> {
        let (pool, orchestrator) = self.spawner.spawn(source_url).await?;

        guard.binding = Some(Binding {
            source_url: source_url.to_string(),
            current: 1,
            max_per_slot: self.default_max_per_slot,
            pool: Arc::clone(&pool),
            orchestrator: Arc::clone(&orchestrator),
        });

        Ok(SlotLease {
            index,
            pool,
            orchestrator,
        })
    }

    /// Decrement the owning slot's `current` after a prediction finalizes.
    /// The slot stays bound (and reusable) until explicitly evicted.
    pub async fn release(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            let mut guard = slot.lock().await;
            if let Some(binding) = &mut guard.binding {
                binding.current = binding.current.saturating_sub(1);
            }
        }
    }

    /// Mark a slot's worker defunct: unbind unconditionally, regardless of
    /// `current`, so it can be rebound fresh on the next admission.
    pub async fn evict(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            let mut guard = slot.lock().await;
            guard.binding = None;
        }
    }

    /// Number of slots currently bound to a source URL (for health reporting).
    pub async fn bound_count(&self) -> usize {
        let mut count = 0;
        for slot in &self.slots {
            if slot.lock().await.binding.is_some() {
                count += 1;
            }
        }
        count
    }
}
