//! Exit/Square-off Controller.
//!
//! Terminal operation for a strategy run: cancel every live order, then
//! flatten every non-zero position with an opposite-side market order.
//! Idempotent, so it can be re-run against an already-flat book.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::EngineResult;
use crate::broker::{BrokerApi, OrderRequest, TransactionType};

/// Cancellation passes over the remaining live orders.
const CANCEL_PASSES: u32 = 5;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SquareOffReport {
    pub orders_cancelled: usize,
    pub positions_closed: usize,
}

pub struct SquareOff {
    broker: Arc<dyn BrokerApi>,
}

impl SquareOff {
    pub fn new(broker: Arc<dyn BrokerApi>) -> Self {
        Self { broker }
    }

    pub async fn run(&self) -> EngineResult<SquareOffReport> {
        let mut report = SquareOffReport::default();

        let orders = self.broker.orders().await?;
        let mut pending: Vec<String> = orders
            .iter()
            .filter(|o| o.status.is_live())
            .map(|o| o.order_id.clone())
            .collect();
        info!(live_orders = pending.len(), "square-off: cancelling live orders");

        let mut pass = 0;
        while !pending.is_empty() && pass < CANCEL_PASSES {
            pass += 1;
            let mut remaining = Vec::new();
            for order_id in pending {
                match self.broker.cancel_order(&order_id).await {
                    Ok(()) => {
                        report.orders_cancelled += 1;
                        info!(order_id = %order_id, "order cancelled");
                    }
                    Err(err) => {
                        warn!(order_id = %order_id, %err, pass, "cancel failed, will retry");
                        remaining.push(order_id);
                    }
                }
            }
            pending = remaining;
        }
        if !pending.is_empty() {
            error!(remaining = pending.len(), "orders still live after cancel passes");
        }

        for position in self.broker.positions().await? {
            if position.quantity == 0 {
                continue;
            }
            let side = if position.quantity > 0 {
                TransactionType::Sell
            } else {
                TransactionType::Buy
            };
            let quantity = position.quantity.unsigned_abs() as u32;
            let request = OrderRequest::market(
                &position.tradingsymbol,
                &position.exchange,
                side,
                quantity,
            );
            match self.broker.place_order(&request).await {
                Ok(order_id) => {
                    report.positions_closed += 1;
                    info!(
                        symbol = %position.tradingsymbol,
                        order_id = %order_id,
                        side = ?side,
                        quantity,
                        "position squared off"
                    );
                }
                Err(err) => {
                    error!(symbol = %position.tradingsymbol, %err, "square-off order failed");
                }
            }
        }

        info!(
            cancelled = report.orders_cancelled,
            closed = report.positions_closed,
            "square-off complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBroker, OrderStatus};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_plus_fifty_becomes_one_sell_of_fifty() {
        let broker = Arc::new(MockBroker::new());
        broker.set_ltp("INFY", dec!(1500)).await;
        broker.set_position("INFY", "NSE", 50, dec!(1480)).await;
        broker.set_position("TCS", "NSE", 0, dec!(4000)).await;

        let report = SquareOff::new(broker.clone()).run().await.unwrap();
        assert_eq!(report.positions_closed, 1);

        let log = broker.order_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].tradingsymbol, "INFY");
        assert_eq!(log[0].transaction_type, TransactionType::Sell);
        assert_eq!(log[0].quantity, 50);
        assert_eq!(log[0].status, OrderStatus::Complete);
    }

    #[tokio::test]
    async fn test_short_position_closed_with_buy() {
        let broker = Arc::new(MockBroker::new());
        broker.set_ltp("INFY", dec!(1500)).await;
        broker.set_position("INFY", "NSE", -30, dec!(1520)).await;

        SquareOff::new(broker.clone()).run().await.unwrap();

        let log = broker.order_log().await;
        assert_eq!(log[0].transaction_type, TransactionType::Buy);
        assert_eq!(log[0].quantity, 30);
    }

    #[tokio::test]
    async fn test_idempotent_second_run_is_a_no_op() {
        let broker = Arc::new(MockBroker::new());
        broker.set_ltp("INFY", dec!(1500)).await;
        broker.set_position("INFY", "NSE", 50, dec!(1480)).await;

        let squareoff = SquareOff::new(broker.clone());
        squareoff.run().await.unwrap();
        let second = squareoff.run().await.unwrap();

        assert_eq!(second, SquareOffReport::default());
        // The only order ever placed is the first run's sell.
        assert_eq!(broker.order_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_live_orders_cancelled_before_closing() {
        let broker = Arc::new(MockBroker::new());
        broker.set_ltp("INFY", dec!(1500)).await;
        let stop = OrderRequest::stop("INFY", "NSE", TransactionType::Sell, 10, dec!(1450));
        broker.place_order(&stop).await.unwrap();

        let report = SquareOff::new(broker.clone()).run().await.unwrap();
        assert_eq!(report.orders_cancelled, 1);
        assert_eq!(broker.live_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_retries_across_passes() {
        let broker = Arc::new(MockBroker::new());
        broker.set_ltp("INFY", dec!(1500)).await;
        let stop = OrderRequest::stop("INFY", "NSE", TransactionType::Sell, 10, dec!(1450));
        broker.place_order(&stop).await.unwrap();
        broker.fail_cancels(3).await;

        let report = SquareOff::new(broker.clone()).run().await.unwrap();
        // Three failed passes, success on the fourth.
        assert_eq!(report.orders_cancelled, 1);
        assert_eq!(broker.live_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_square_off_positions_end_flat() {
        let broker = Arc::new(MockBroker::new());
        broker.set_ltp("INFY", dec!(1500)).await;
        broker.set_position("INFY", "NSE", 50, dec!(1480)).await;

        SquareOff::new(broker.clone()).run().await.unwrap();

        let positions = broker.positions().await.unwrap();
        let infy = positions.iter().find(|p| p.tradingsymbol == "INFY").unwrap();
        assert_eq!(infy.quantity, 0);

        let log = broker.order_log().await;
        assert_eq!(log[0].status, OrderStatus::Complete);
    }
}
