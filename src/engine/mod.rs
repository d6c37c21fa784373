//! Execution engine: tick dispatch, order lifecycle, reconciliation and
//! square-off.

pub mod dispatcher;
pub mod orders;
pub mod reconcile;
pub mod squareoff;

pub use orders::OrderLifecycle;
pub use reconcile::{ReconcileConfig, Reconciler};
pub use squareoff::{SquareOff, SquareOffReport};

use std::future::Future;

use thiserror::Error;
use tracing::warn;

use crate::broker::{BrokerError, BrokerResult, OrderRow, PositionRow};

/// Engine-level failures. Broker rejections pass through; the rest mark
/// explicit decision points of the reconciliation and order lifecycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// Snapshot fetch retry bound exhausted; the cycle is abandoned.
    #[error("broker snapshot unavailable after {attempts} attempts")]
    SnapshotUnavailable { attempts: u32 },
    /// Entry order did not fill within the configured timeout.
    #[error("order {order_id} not filled within timeout")]
    FillTimeout { order_id: String },
    /// Entry order reached a terminal state other than complete.
    #[error("order {order_id} ended in state {status} before filling")]
    EntryRejected { order_id: String, status: String },
    /// Expected protective order missing from the broker snapshot.
    #[error("protective order missing for {symbol}, automation halted")]
    ProtectiveOrderMissing { symbol: String },
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Immediate retry on transient failures, bounded by `attempts`. Broker
/// rejections are never retried.
async fn with_retry<T, F, Fut>(attempts: u32, label: &str, mut call: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    let mut tried = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                tried += 1;
                warn!(attempt = tried, %err, "transient {} fetch failure", label);
                if tried >= attempts {
                    return Err(EngineError::SnapshotUnavailable { attempts: tried });
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Position snapshot with bounded retry.
pub(crate) async fn fetch_positions(
    broker: &dyn crate::broker::BrokerApi,
    attempts: u32,
) -> EngineResult<Vec<PositionRow>> {
    with_retry(attempts, "position", || broker.positions()).await
}

/// Order snapshot with bounded retry.
pub(crate) async fn fetch_orders(
    broker: &dyn crate::broker::BrokerApi,
    attempts: u32,
) -> EngineResult<Vec<OrderRow>> {
    with_retry(attempts, "order", || broker.orders()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;

    #[tokio::test]
    async fn test_retry_recovers_within_bound() {
        let broker = MockBroker::new();
        broker.fail_position_fetches(3).await;
        assert!(fetch_positions(&broker, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_retry_bound_exhaustion() {
        let broker = MockBroker::new();
        broker.fail_position_fetches(20).await;
        let err = fetch_positions(&broker, 10).await.unwrap_err();
        match err {
            EngineError::SnapshotUnavailable { attempts } => assert_eq!(attempts, 10),
            other => panic!("unexpected error {other}"),
        }
    }
}
