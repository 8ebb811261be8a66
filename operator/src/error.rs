//! Error types for the snapsched operator

use thiserror::Error;

/// Main error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("CRD not installed. Please install the SnapshotSchedule CRD first.")]
    CrdNotInstalled,

    #[error("Reconciliation failed: {0}")]
    Reconcile(#[from] snapsched::SnapschedError),
}
