//! Broker-agnostic trait for the brokerage API.
//!
//! Everything the execution engine needs from the broker goes through
//! [`BrokerApi`], so the engine can run against the live REST client or the
//! in-memory paper broker interchangeably.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;

use super::types::{
    AccountMargins, Instrument, MarginEstimate, OhlcBar, OrderModify, OrderRequest, OrderRow,
    PositionRow,
};

/// Broker call failure, split by how the caller should react.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Network/transport level failure. Safe to retry.
    #[error("transport error: {0}")]
    Transport(String),
    /// The broker understood the request and rejected it (invalid price tick,
    /// exchange closed, unknown order id). Not retried without operator
    /// intervention; the order must not be assumed placed.
    #[error("broker rejected request ({status}): {message}")]
    Api { status: u16, message: String },
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        BrokerError::Api {
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        BrokerError::Transport(err.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// The fixed external contract consumed from the brokerage.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Full instrument dump for an exchange segment ("NSE", "NFO").
    async fn instruments(&self, exchange: &str) -> BrokerResult<Vec<Instrument>>;

    /// Last traded price for an `EXCHANGE:SYMBOL` key.
    async fn ltp(&self, key: &str) -> BrokerResult<Decimal>;

    /// Historical candles for an instrument token.
    async fn historical_data(
        &self,
        instrument_token: u32,
        from: NaiveDate,
        to: NaiveDate,
        interval: &str,
    ) -> BrokerResult<Vec<OhlcBar>>;

    /// Current-day position snapshot. Ground truth for reconciliation.
    async fn positions(&self) -> BrokerResult<Vec<PositionRow>>;

    /// Current-day order snapshot. Ground truth for reconciliation.
    async fn orders(&self) -> BrokerResult<Vec<OrderRow>>;

    /// Place an order; returns the broker-assigned order id.
    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<String>;

    /// Modify a live order in place.
    async fn modify_order(&self, order_id: &str, modify: &OrderModify) -> BrokerResult<()>;

    /// Cancel a live order.
    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()>;

    /// Pre-trade margin simulation for a basket of orders.
    async fn basket_order_margins(&self, orders: &[OrderRequest]) -> BrokerResult<MarginEstimate>;

    /// Account margin snapshot.
    async fn margins(&self) -> BrokerResult<AccountMargins>;
}
