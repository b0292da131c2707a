//! Cooperative cancellation for kernel suspension points.
//!
//! Every wait an operation performs before its ResultAction is fixed (write
//! lock, container stability, boot rendezvous) goes through [`cancellable`].
//! Waits after that point pass `None` and run to completion.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::OperationError;

/// Awaits `fut`, aborting with [`OperationError::Cancelled`] if `cancel` fires first.
pub(crate) async fn cancellable<F: Future>(
    fut: F,
    cancel: Option<&CancellationToken>,
) -> Result<F::Output, OperationError> {
    match cancel {
        None => Ok(fut.await),
        Some(token) => {
            if token.is_cancelled() {
                return Err(OperationError::Cancelled);
            }
            tokio::select! {
                out = fut => Ok(out),
                _ = token.cancelled() => Err(OperationError::Cancelled),
            }
        }
    }
}
