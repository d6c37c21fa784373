//! Brokerage connectivity: REST client, tick stream and the paper broker.

pub mod client;
pub mod mock;
pub mod ticker;
pub mod traits;
pub mod types;

pub use client::KiteClient;
pub use mock::MockBroker;
pub use ticker::{KiteTicker, TickMode, TickerEvent};
pub use traits::{BrokerApi, BrokerError, BrokerResult};
pub use types::{
    AccountMargins, Instrument, MarginEstimate, OhlcBar, OrderKind, OrderModify, OrderRequest,
    OrderRow, OrderStatus, PositionRow, Tick, TransactionType,
};
