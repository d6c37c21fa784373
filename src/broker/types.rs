//! Type definitions for the brokerage API.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Instrument descriptor from the exchange instrument dump.
#[derive(Debug, Clone, Deserialize)]
pub struct Instrument {
    pub instrument_token: u32,
    pub tradingsymbol: String,
    pub name: String,
    pub exchange: String,
    #[serde(default)]
    pub expiry: Option<NaiveDate>,
    #[serde(default)]
    pub strike: Decimal,
    pub lot_size: u32,
    pub instrument_type: String,
}

/// One OHLC candle from the historical data endpoint.
#[derive(Debug, Clone)]
pub struct OhlcBar {
    pub date: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// Current-day position row from the positions snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionRow {
    pub tradingsymbol: String,
    pub exchange: String,
    /// Net quantity; negative for short positions.
    pub quantity: i64,
    #[serde(default)]
    pub average_price: Decimal,
    #[serde(default)]
    pub last_price: Decimal,
    #[serde(default)]
    pub pnl: Decimal,
}

/// Order row from the order book snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderRow {
    pub order_id: String,
    pub tradingsymbol: String,
    pub exchange: String,
    pub status: OrderStatus,
    pub transaction_type: TransactionType,
    pub quantity: u32,
    #[serde(default)]
    pub filled_quantity: u32,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub trigger_price: Decimal,
    #[serde(default)]
    pub average_price: Decimal,
}

/// Order status as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    Complete,
    Cancelled,
    Rejected,
    #[serde(rename = "TRIGGER PENDING")]
    TriggerPending,
    /// Interim statuses ("PUT ORDER REQ RECEIVED" etc.) we do not act on.
    #[serde(other)]
    Other,
}

impl OrderStatus {
    /// A live order is one that can still execute and can still be cancelled.
    pub fn is_live(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::TriggerPending)
    }
}

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Buy,
    Sell,
}

impl TransactionType {
    pub fn opposite(&self) -> Self {
        match self {
            TransactionType::Buy => TransactionType::Sell,
            TransactionType::Sell => TransactionType::Buy,
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    /// Stop-loss order with a limit price.
    #[serde(rename = "SL")]
    StopLoss,
    /// Stop-loss market order.
    #[serde(rename = "SL-M")]
    StopLossMarket,
}

/// New order request, form-encoded for the order placement endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub tradingsymbol: String,
    pub exchange: String,
    pub transaction_type: TransactionType,
    pub quantity: u32,
    pub order_type: OrderKind,
    pub product: String,
    pub variety: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<Decimal>,
}

impl OrderRequest {
    /// Intraday market order.
    pub fn market(
        tradingsymbol: &str,
        exchange: &str,
        transaction_type: TransactionType,
        quantity: u32,
    ) -> Self {
        Self {
            tradingsymbol: tradingsymbol.to_string(),
            exchange: exchange.to_string(),
            transaction_type,
            quantity,
            order_type: OrderKind::Market,
            product: "MIS".to_string(),
            variety: "regular".to_string(),
            price: None,
            trigger_price: None,
        }
    }

    /// Intraday stop-loss order; limit price equals the trigger price,
    /// matching how the strategies place protective stops.
    pub fn stop(
        tradingsymbol: &str,
        exchange: &str,
        transaction_type: TransactionType,
        quantity: u32,
        trigger_price: Decimal,
    ) -> Self {
        Self {
            tradingsymbol: tradingsymbol.to_string(),
            exchange: exchange.to_string(),
            transaction_type,
            quantity,
            order_type: OrderKind::StopLoss,
            product: "MIS".to_string(),
            variety: "regular".to_string(),
            price: Some(trigger_price),
            trigger_price: Some(trigger_price),
        }
    }

    /// Intraday limit order (used for take-profit legs).
    pub fn limit(
        tradingsymbol: &str,
        exchange: &str,
        transaction_type: TransactionType,
        quantity: u32,
        price: Decimal,
    ) -> Self {
        Self {
            tradingsymbol: tradingsymbol.to_string(),
            exchange: exchange.to_string(),
            transaction_type,
            quantity,
            order_type: OrderKind::Limit,
            product: "MIS".to_string(),
            variety: "regular".to_string(),
            price: Some(price),
            trigger_price: None,
        }
    }
}

/// In-place modification of a live order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderModify {
    pub price: Decimal,
    pub trigger_price: Decimal,
    pub order_type: OrderKind,
    pub variety: String,
}

impl OrderModify {
    /// Reprice a stop-loss order; limit and trigger move together.
    pub fn reprice_stop(price: Decimal) -> Self {
        Self {
            price,
            trigger_price: price,
            order_type: OrderKind::StopLoss,
            variety: "regular".to_string(),
        }
    }
}

/// Margin estimate from the basket margin simulation endpoint.
#[derive(Debug, Clone)]
pub struct MarginEstimate {
    pub required: Decimal,
}

/// Account margin snapshot.
#[derive(Debug, Clone)]
pub struct AccountMargins {
    /// Free cash in the equity segment.
    pub available_cash: Decimal,
}

/// One live quote update from the tick stream.
#[derive(Debug, Clone)]
pub struct Tick {
    pub instrument_token: u32,
    pub last_price: Decimal,
    pub open_interest: Option<u64>,
    pub volume_traded: Option<u64>,
    /// Best bid (top of the buy depth).
    pub bid: Option<Decimal>,
    /// Best ask (top of the sell depth).
    pub ask: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_status_liveness() {
        assert!(OrderStatus::Open.is_live());
        assert!(OrderStatus::TriggerPending.is_live());
        assert!(!OrderStatus::Complete.is_live());
        assert!(!OrderStatus::Cancelled.is_live());
        assert!(!OrderStatus::Rejected.is_live());
    }

    #[test]
    fn test_trigger_pending_deserializes_from_wire_form() {
        let status: OrderStatus = serde_json::from_str("\"TRIGGER PENDING\"").unwrap();
        assert_eq!(status, OrderStatus::TriggerPending);
    }

    #[test]
    fn test_unknown_status_maps_to_other() {
        let status: OrderStatus = serde_json::from_str("\"PUT ORDER REQ RECEIVED\"").unwrap();
        assert_eq!(status, OrderStatus::Other);
    }

    #[test]
    fn test_stop_order_price_equals_trigger() {
        let req = OrderRequest::stop("INFY", "NSE", TransactionType::Sell, 10, dec!(1450.5));
        assert_eq!(req.price, Some(dec!(1450.5)));
        assert_eq!(req.trigger_price, Some(dec!(1450.5)));
        assert_eq!(req.order_type, OrderKind::StopLoss);
    }

    #[test]
    fn test_transaction_type_opposite() {
        assert_eq!(TransactionType::Buy.opposite(), TransactionType::Sell);
        assert_eq!(TransactionType::Sell.opposite(), TransactionType::Buy);
    }
}
