//! Slot scheduling: fixed mode (one predictor, one pool of identical workers)
//! and dynamic/"procedure" mode (many slots, each bindable to a per-request
//! predictor source URL, with idle-slot eviction).
//!
//! Both modes are built on the same permit/idle-token vocabulary as
//! `crate::permit::pool::PermitPool`. `FixedScheduler` is a thin name for
//! that pool used as-is; `DynamicScheduler` wraps one pool per bound slot
//! and adds the admission/eviction bookkeeping dynamic mode needs.

pub mod dynamic;
pub mod fixed;

pub use dynamic::{DynamicScheduler, DynamicWorkerSpawner, SchedulerError, SlotLease};
pub use fixed::FixedScheduler;
