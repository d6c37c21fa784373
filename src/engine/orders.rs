//! Order Lifecycle Manager.
//!
//! Owns the entry → fill → protective-order sequence for one trade. The
//! stop trigger derives from the realized average fill, so the fill poll
//! must finish before the stop can be placed. Repricing is always a
//! modify-in-place on the existing order id; cancel-then-recreate would
//! leave a window with no protective order.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use super::{EngineError, EngineResult};
use crate::broker::{BrokerApi, OrderModify, OrderRequest, OrderStatus, TransactionType};

pub struct OrderLifecycle {
    broker: Arc<dyn BrokerApi>,
    fill_poll_interval: Duration,
    fill_timeout: Duration,
}

impl OrderLifecycle {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        fill_poll_interval: Duration,
        fill_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            fill_poll_interval,
            fill_timeout,
        }
    }

    /// Submit the entry order. The caller transitions the record to
    /// pending-entry before releasing its lock.
    pub async fn place_entry(&self, request: &OrderRequest) -> EngineResult<String> {
        let order_id = self.broker.place_order(request).await?;
        info!(
            symbol = %request.tradingsymbol,
            order_id = %order_id,
            side = ?request.transaction_type,
            quantity = request.quantity,
            "entry order placed"
        );
        Ok(order_id)
    }

    /// Poll until the order completes and return its average fill price.
    ///
    /// A terminal non-complete status surfaces as `EntryRejected`. Past the
    /// timeout the order is cancelled (best effort) and `FillTimeout` is
    /// returned so the caller can reset the record instead of hanging.
    pub async fn wait_for_fill(&self, order_id: &str) -> EngineResult<Decimal> {
        let deadline = Instant::now() + self.fill_timeout;
        loop {
            let orders = self.broker.orders().await?;
            if let Some(row) = orders.iter().find(|o| o.order_id == order_id) {
                match row.status {
                    OrderStatus::Complete => {
                        info!(order_id = %order_id, fill = %row.average_price, "entry filled");
                        return Ok(row.average_price);
                    }
                    OrderStatus::Cancelled | OrderStatus::Rejected => {
                        return Err(EngineError::EntryRejected {
                            order_id: order_id.to_string(),
                            status: format!("{:?}", row.status),
                        });
                    }
                    _ => {}
                }
            }

            if Instant::now() >= deadline {
                warn!(order_id = %order_id, "fill poll timed out, cancelling entry");
                if let Err(err) = self.broker.cancel_order(order_id).await {
                    warn!(order_id = %order_id, %err, "could not cancel timed-out entry");
                }
                return Err(EngineError::FillTimeout {
                    order_id: order_id.to_string(),
                });
            }
            sleep(self.fill_poll_interval).await;
        }
    }

    /// Place the protective stop on the opposite side of the position.
    pub async fn attach_stop(
        &self,
        symbol: &str,
        exchange: &str,
        position_side: TransactionType,
        quantity: u32,
        trigger_price: Decimal,
    ) -> EngineResult<String> {
        let request = OrderRequest::stop(
            symbol,
            exchange,
            position_side.opposite(),
            quantity,
            trigger_price,
        );
        let order_id = self.broker.place_order(&request).await?;
        info!(
            symbol = %symbol,
            order_id = %order_id,
            trigger = %trigger_price,
            "stop-loss attached"
        );
        Ok(order_id)
    }

    /// Place a take-profit limit order on the opposite side.
    pub async fn attach_target(
        &self,
        symbol: &str,
        exchange: &str,
        position_side: TransactionType,
        quantity: u32,
        price: Decimal,
    ) -> EngineResult<String> {
        let request =
            OrderRequest::limit(symbol, exchange, position_side.opposite(), quantity, price);
        let order_id = self.broker.place_order(&request).await?;
        info!(symbol = %symbol, order_id = %order_id, price = %price, "take-profit attached");
        Ok(order_id)
    }

    /// Move a live stop order to a new trigger, in place.
    pub async fn reprice_stop(&self, order_id: &str, price: Decimal) -> EngineResult<()> {
        self.broker
            .modify_order(order_id, &OrderModify::reprice_stop(price))
            .await?;
        info!(order_id = %order_id, price = %price, "stop repriced");
        Ok(())
    }

    /// Cancel a live order. The caller clears the role slot on success.
    pub async fn cancel_pending(&self, order_id: &str) -> EngineResult<()> {
        self.broker.cancel_order(order_id).await?;
        info!(order_id = %order_id, "order cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBroker, OrderRequest};
    use rust_decimal_macros::dec;

    fn lifecycle(broker: Arc<MockBroker>) -> OrderLifecycle {
        OrderLifecycle::new(
            broker,
            Duration::from_millis(5),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_entry_fill_returns_average_price() {
        let broker = Arc::new(MockBroker::new());
        broker.set_ltp("INFY", dec!(1500)).await;
        let lc = lifecycle(broker.clone());

        let req = OrderRequest::market("INFY", "NSE", TransactionType::Buy, 10);
        let id = lc.place_entry(&req).await.unwrap();
        let fill = lc.wait_for_fill(&id).await.unwrap();
        assert_eq!(fill, dec!(1500));
    }

    #[tokio::test]
    async fn test_fill_arrives_while_polling() {
        let broker = Arc::new(MockBroker::new());
        broker.set_ltp("INFY", dec!(1500)).await;
        broker.hold_fills(true).await;
        let lc = lifecycle(broker.clone());

        let req = OrderRequest::market("INFY", "NSE", TransactionType::Buy, 10);
        let id = lc.place_entry(&req).await.unwrap();

        let filler = {
            let broker = broker.clone();
            let id = id.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(20)).await;
                broker.complete_order(&id, dec!(1501)).await;
            })
        };

        let fill = lc.wait_for_fill(&id).await.unwrap();
        filler.await.unwrap();
        assert_eq!(fill, dec!(1501));
    }

    #[tokio::test]
    async fn test_fill_timeout_cancels_entry() {
        let broker = Arc::new(MockBroker::new());
        broker.set_ltp("INFY", dec!(1500)).await;
        broker.hold_fills(true).await;
        let lc = lifecycle(broker.clone());

        let req = OrderRequest::market("INFY", "NSE", TransactionType::Buy, 10);
        let id = lc.place_entry(&req).await.unwrap();

        let err = lc.wait_for_fill(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::FillTimeout { .. }));
        assert_eq!(broker.live_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_entry_is_rejected_not_retried() {
        let broker = Arc::new(MockBroker::new());
        broker.set_ltp("INFY", dec!(1500)).await;
        broker.hold_fills(true).await;
        let lc = lifecycle(broker.clone());

        let req = OrderRequest::market("INFY", "NSE", TransactionType::Buy, 10);
        let id = lc.place_entry(&req).await.unwrap();
        broker.cancel_order(&id).await.unwrap();

        let err = lc.wait_for_fill(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::EntryRejected { .. }));
    }

    #[tokio::test]
    async fn test_attach_target_rests_opposite_limit() {
        let broker = Arc::new(MockBroker::new());
        let lc = lifecycle(broker.clone());

        let id = lc
            .attach_target("INFY", "NSE", TransactionType::Buy, 10, dec!(1550))
            .await
            .unwrap();

        let orders = broker.order_log().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, id);
        assert_eq!(orders[0].transaction_type, TransactionType::Sell);
        assert_eq!(orders[0].price, dec!(1550));
        assert_eq!(orders[0].status, OrderStatus::Open); // rests until touched
    }

    #[tokio::test]
    async fn test_reprice_moves_trigger_in_place() {
        let broker = Arc::new(MockBroker::new());
        let lc = lifecycle(broker.clone());

        let id = lc
            .attach_stop("INFY", "NSE", TransactionType::Buy, 10, dec!(1450))
            .await
            .unwrap();
        lc.reprice_stop(&id, dec!(1460)).await.unwrap();

        let orders = broker.order_log().await;
        assert_eq!(orders.len(), 1); // modified, not recreated
        assert_eq!(orders[0].trigger_price, dec!(1460));
    }
}
