//! In-memory paper broker.
//!
//! Implements [`BrokerApi`] against a mutable in-memory book so the engine
//! can be exercised without a live session: market orders fill instantly at
//! the configured last price, stop orders rest as `TRIGGER PENDING`, and
//! transient snapshot failures can be injected to test retry behavior.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::traits::{BrokerApi, BrokerError, BrokerResult};
use super::types::{
    AccountMargins, Instrument, MarginEstimate, OhlcBar, OrderKind, OrderModify, OrderRequest,
    OrderRow, OrderStatus, PositionRow, TransactionType,
};

#[derive(Debug, Default)]
struct Inner {
    ltp: HashMap<String, Decimal>,
    positions: HashMap<String, PositionRow>,
    orders: Vec<OrderRow>,
    instruments: Vec<Instrument>,
    bars: HashMap<u32, Vec<OhlcBar>>,
    next_order_id: u64,
    available_cash: Decimal,
    required_margin: Decimal,
    fail_position_fetches: u32,
    fail_order_fetches: u32,
    fail_cancels: u32,
    hold_fills: bool,
}

/// Paper broker for tests and dry runs.
pub struct MockBroker {
    inner: Mutex<Inner>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                available_cash: Decimal::new(100_000, 0),
                next_order_id: 1,
                ..Inner::default()
            }),
        }
    }

    pub async fn set_ltp(&self, symbol: &str, price: Decimal) {
        self.inner.lock().await.ltp.insert(symbol.to_string(), price);
    }

    pub async fn set_position(&self, symbol: &str, exchange: &str, quantity: i64, avg: Decimal) {
        let mut inner = self.inner.lock().await;
        inner.positions.insert(
            symbol.to_string(),
            PositionRow {
                tradingsymbol: symbol.to_string(),
                exchange: exchange.to_string(),
                quantity,
                average_price: avg,
                last_price: avg,
                pnl: Decimal::ZERO,
            },
        );
    }

    pub async fn set_margins(&self, available_cash: Decimal, required_margin: Decimal) {
        let mut inner = self.inner.lock().await;
        inner.available_cash = available_cash;
        inner.required_margin = required_margin;
    }

    pub async fn set_instruments(&self, instruments: Vec<Instrument>) {
        self.inner.lock().await.instruments = instruments;
    }

    pub async fn set_bars(&self, token: u32, bars: Vec<OhlcBar>) {
        self.inner.lock().await.bars.insert(token, bars);
    }

    /// The next `n` position snapshot fetches fail with a transport error.
    pub async fn fail_position_fetches(&self, n: u32) {
        self.inner.lock().await.fail_position_fetches = n;
    }

    /// The next `n` order snapshot fetches fail with a transport error.
    pub async fn fail_order_fetches(&self, n: u32) {
        self.inner.lock().await.fail_order_fetches = n;
    }

    /// The next `n` cancel calls fail with a transport error.
    pub async fn fail_cancels(&self, n: u32) {
        self.inner.lock().await.fail_cancels = n;
    }

    /// When set, market orders rest as OPEN instead of filling instantly.
    pub async fn hold_fills(&self, hold: bool) {
        self.inner.lock().await.hold_fills = hold;
    }

    /// Mark a resting order complete at the given fill price, applying the
    /// position delta as a real fill would.
    pub async fn complete_order(&self, order_id: &str, fill_price: Decimal) {
        let mut inner = self.inner.lock().await;
        let Some(idx) = inner.orders.iter().position(|o| o.order_id == order_id) else {
            return;
        };
        let row = inner.orders[idx].clone();
        inner.orders[idx].status = OrderStatus::Complete;
        inner.orders[idx].average_price = fill_price;
        inner.orders[idx].filled_quantity = row.quantity;
        apply_fill(&mut inner, &row, fill_price);
    }

    /// All orders placed so far, in placement order.
    pub async fn order_log(&self) -> Vec<OrderRow> {
        self.inner.lock().await.orders.clone()
    }

    pub async fn live_order_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .orders
            .iter()
            .filter(|o| o.status.is_live())
            .count()
    }
}

fn apply_fill(inner: &mut Inner, row: &OrderRow, fill_price: Decimal) {
    let signed = match row.transaction_type {
        TransactionType::Buy => row.quantity as i64,
        TransactionType::Sell => -(row.quantity as i64),
    };
    let entry = inner
        .positions
        .entry(row.tradingsymbol.clone())
        .or_insert_with(|| PositionRow {
            tradingsymbol: row.tradingsymbol.clone(),
            exchange: row.exchange.clone(),
            quantity: 0,
            average_price: fill_price,
            last_price: fill_price,
            pnl: Decimal::ZERO,
        });
    entry.quantity += signed;
    entry.last_price = fill_price;
    if entry.quantity != 0 {
        entry.average_price = fill_price;
    }
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn instruments(&self, exchange: &str) -> BrokerResult<Vec<Instrument>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .instruments
            .iter()
            .filter(|i| i.exchange == exchange)
            .cloned()
            .collect())
    }

    async fn ltp(&self, key: &str) -> BrokerResult<Decimal> {
        let inner = self.inner.lock().await;
        // Accept both "EXCHANGE:SYMBOL" keys and bare symbols.
        let symbol = key.split_once(':').map(|(_, s)| s).unwrap_or(key);
        inner
            .ltp
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::api(404, format!("no quote for {}", key)))
    }

    async fn historical_data(
        &self,
        instrument_token: u32,
        _from: NaiveDate,
        _to: NaiveDate,
        _interval: &str,
    ) -> BrokerResult<Vec<OhlcBar>> {
        let inner = self.inner.lock().await;
        Ok(inner.bars.get(&instrument_token).cloned().unwrap_or_default())
    }

    async fn positions(&self) -> BrokerResult<Vec<PositionRow>> {
        let mut inner = self.inner.lock().await;
        if inner.fail_position_fetches > 0 {
            inner.fail_position_fetches -= 1;
            return Err(BrokerError::Transport("injected snapshot failure".into()));
        }
        Ok(inner.positions.values().cloned().collect())
    }

    async fn orders(&self) -> BrokerResult<Vec<OrderRow>> {
        let mut inner = self.inner.lock().await;
        if inner.fail_order_fetches > 0 {
            inner.fail_order_fetches -= 1;
            return Err(BrokerError::Transport("injected snapshot failure".into()));
        }
        Ok(inner.orders.clone())
    }

    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<String> {
        let mut inner = self.inner.lock().await;
        let order_id = format!("MOCK{:06}", inner.next_order_id);
        inner.next_order_id += 1;

        let fill_now = order.order_type == OrderKind::Market && !inner.hold_fills;
        let status = match order.order_type {
            OrderKind::Market if fill_now => OrderStatus::Complete,
            OrderKind::Market => OrderStatus::Open,
            OrderKind::Limit => OrderStatus::Open,
            OrderKind::StopLoss | OrderKind::StopLossMarket => OrderStatus::TriggerPending,
        };

        let fill_price = inner
            .ltp
            .get(&order.tradingsymbol)
            .copied()
            .or(order.price)
            .unwrap_or(Decimal::ZERO);

        let row = OrderRow {
            order_id: order_id.clone(),
            tradingsymbol: order.tradingsymbol.clone(),
            exchange: order.exchange.clone(),
            status,
            transaction_type: order.transaction_type,
            quantity: order.quantity,
            filled_quantity: if fill_now { order.quantity } else { 0 },
            price: order.price.unwrap_or(Decimal::ZERO),
            trigger_price: order.trigger_price.unwrap_or(Decimal::ZERO),
            average_price: if fill_now { fill_price } else { Decimal::ZERO },
        };

        if fill_now {
            apply_fill(&mut inner, &row, fill_price);
        }
        inner.orders.push(row);
        Ok(order_id)
    }

    async fn modify_order(&self, order_id: &str, modify: &OrderModify) -> BrokerResult<()> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .orders
            .iter_mut()
            .find(|o| o.order_id == order_id && o.status.is_live())
            .ok_or_else(|| BrokerError::api(404, format!("no live order {}", order_id)))?;
        row.price = modify.price;
        row.trigger_price = modify.trigger_price;
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.fail_cancels > 0 {
            inner.fail_cancels -= 1;
            return Err(BrokerError::Transport("injected cancel failure".into()));
        }
        let row = inner
            .orders
            .iter_mut()
            .find(|o| o.order_id == order_id && o.status.is_live())
            .ok_or_else(|| BrokerError::api(404, format!("no live order {}", order_id)))?;
        row.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn basket_order_margins(
        &self,
        _orders: &[OrderRequest],
    ) -> BrokerResult<MarginEstimate> {
        let inner = self.inner.lock().await;
        Ok(MarginEstimate {
            required: inner.required_margin,
        })
    }

    async fn margins(&self) -> BrokerResult<AccountMargins> {
        let inner = self.inner.lock().await;
        Ok(AccountMargins {
            available_cash: inner.available_cash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_market_order_fills_and_moves_position() {
        let broker = MockBroker::new();
        broker.set_ltp("INFY", dec!(1500)).await;

        let req = OrderRequest::market("INFY", "NSE", TransactionType::Buy, 10);
        let id = broker.place_order(&req).await.unwrap();

        let orders = broker.orders().await.unwrap();
        assert_eq!(orders[0].order_id, id);
        assert_eq!(orders[0].status, OrderStatus::Complete);
        assert_eq!(orders[0].average_price, dec!(1500));

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions[0].quantity, 10);
    }

    #[tokio::test]
    async fn test_stop_order_rests_as_trigger_pending() {
        let broker = MockBroker::new();
        let req = OrderRequest::stop("INFY", "NSE", TransactionType::Sell, 10, dec!(1450));
        broker.place_order(&req).await.unwrap();
        assert_eq!(broker.live_order_count().await, 1);
    }

    #[tokio::test]
    async fn test_injected_snapshot_failures_are_transient_and_finite() {
        let broker = MockBroker::new();
        broker.fail_position_fetches(2).await;

        assert!(broker.positions().await.unwrap_err().is_transient());
        assert!(broker.positions().await.is_err());
        assert!(broker.positions().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_then_cancel_again_fails() {
        let broker = MockBroker::new();
        let req = OrderRequest::stop("INFY", "NSE", TransactionType::Sell, 10, dec!(1450));
        let id = broker.place_order(&req).await.unwrap();

        broker.cancel_order(&id).await.unwrap();
        assert!(broker.cancel_order(&id).await.is_err());
    }
}
