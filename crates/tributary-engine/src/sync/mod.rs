//! Run execution: admission, single-flight bookkeeping and the per-page pipeline

mod batch;
pub mod registry;
pub mod synchronizer;

pub use registry::{Admission, EditGuard, RunSlot, SyncRegistry};
pub use synchronizer::{SyncContext, Synchronizer};
