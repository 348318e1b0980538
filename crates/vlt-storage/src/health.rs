//! Storage health check

use opendal::Operator;
use vlt_core::{VltError, VltResult};

/// Verify the storage backend is reachable by listing the root
pub async fn check_health(op: &Operator) -> VltResult<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| VltError::Storage(format!("storage health check failed: {e}")))
}

/// Returns true if storage is reachable, false otherwise (non-panicking)
pub async fn is_healthy(op: &Operator) -> bool {
    check_health(op).await.is_ok()
}
