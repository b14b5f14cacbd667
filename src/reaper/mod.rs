//! Background reclamation loops (spec §4.4, §4.5).
//!
//! Both reapers drive `StorageEngine` operations on independent timers and
//! maintain in-process, per-reaper `ReaperStats` (lost on restart, by
//! design — observability aids, not durable state).

pub mod expiry;
pub mod orphan;

use crate::models::ReaperStats;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared, mutex-guarded stats handle a reaper updates after each run and
/// a health/stats handler can read concurrently.
pub type SharedStats = Arc<Mutex<ReaperStats>>;

pub fn shared_stats() -> SharedStats {
    Arc::new(Mutex::new(ReaperStats::default()))
}
