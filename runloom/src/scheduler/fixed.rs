//! Fixed-mode scheduling: one predictor, `max_per_slot` identical worker
//! processes, admitted via the shared `PermitPool`.

use std::sync::Arc;

use crate::permit::PermitPool;

/// Thin wrapper naming the fixed-mode use of `PermitPool` for parity with
/// `DynamicScheduler`. Fixed mode needs none of the per-slot source binding
/// bookkeeping dynamic mode requires — a permit is a permit — so this only
/// documents the mode, it doesn't add behavior over the pool itself.
#[derive(Clone)]
pub struct FixedScheduler {
    pool: Arc<PermitPool>,
}

impl FixedScheduler {
    pub fn new(pool: Arc<PermitPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<PermitPool> {
        &self.pool
    }

    pub fn num_slots(&self) -> usize {
        self.pool.num_slots()
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_pool_capacity() {
        let pool = Arc::new(PermitPool::new(3));
        let scheduler = FixedScheduler::new(pool);
        assert_eq!(scheduler.num_slots(), 3);
        assert_eq!(scheduler.available(), 3);
    }
}
