//! snapsched - Scheduled snapshots and retention for Kubernetes persistent volumes.
//!
//! A `SnapshotSchedule` names a cron expression, a selector over the
//! PersistentVolumeClaims in its namespace and a retention policy. Each time
//! the expression fires, one `VolumeSnapshot` is taken per selected claim;
//! snapshots beyond the retention policy are pruned on every pass.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Trigger layer (operator)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ScheduleReconciler: due check | status persistence         │
//! ├──────────────┬───────────────┬──────────────┬───────────────┤
//! │ Cron         │ Provisioner   │ Retention    │ Status        │
//! ├──────────────┴───────────────┴──────────────┴───────────────┤
//! │  ObjectStore: KubeStore | MemoryStore                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use snapsched::config::ReconcilerConfig;
//! use snapsched::crd::ScheduleId;
//! use snapsched::reconciler::ScheduleReconciler;
//! use snapsched::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStore::new());
//!     let reconciler = ScheduleReconciler::new(store, ReconcilerConfig::default());
//!
//!     let outcome = reconciler.reconcile(&ScheduleId::new("apps", "hourly")).await;
//!     println!("requeue after {:?}", outcome.requeue_after);
//! }
//! ```

pub mod config;
pub mod crd;
pub mod error;
pub mod provisioner;
pub mod reconciler;
pub mod retention;
pub mod scheduling;
pub mod selector;
pub mod status;
pub mod store;

// Re-exports
pub use error::{Result, SnapschedError};
