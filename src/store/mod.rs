//! Instrument State Store.
//!
//! One record per traded instrument, each behind its own async mutex so the
//! tick consumer, the reconciliation cycle and spawned entry tasks serialize
//! per instrument without a global lock. Token lookup maps streamed tick
//! tokens back to records.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::broker::{Tick, TransactionType};
use crate::signal::SignalState;

/// Latest streamed quote, overwritten per tick (last write wins).
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveQuote {
    pub last_price: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub open_interest: Option<u64>,
    pub volume: Option<u64>,
}

/// Where the instrument stands in the trade cycle, re-derived every
/// reconciliation pass from the broker snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionState {
    #[default]
    Flat,
    PendingEntry,
    Open,
    PendingExit,
}

/// Live order ids by role. At most one per role at any time.
#[derive(Debug, Clone, Default)]
pub struct ActiveOrders {
    pub entry: Option<String>,
    pub stop_loss: Option<String>,
    pub take_profit: Option<String>,
}

impl ActiveOrders {
    pub fn clear(&mut self) {
        self.entry = None;
        self.stop_loss = None;
        self.take_profit = None;
    }
}

/// Everything the engine tracks for one instrument.
#[derive(Debug)]
pub struct InstrumentRecord {
    pub symbol: String,
    pub exchange: String,
    pub instrument_token: u32,
    pub lot_size: u32,
    /// Order quantity per entry, fixed at startup.
    pub quantity: u32,
    pub live_quote: Option<LiveQuote>,
    pub signal: SignalState,
    pub position_state: PositionState,
    pub active_orders: ActiveOrders,
    /// Direction of the open or pending trade.
    pub direction: Option<TransactionType>,
    /// Realized average fill of the last entry; bracket levels derive from
    /// this, never from the requested price.
    pub entry_fill_price: Option<Decimal>,
    /// Set on order-state desync; no further automated action when true.
    pub halted: bool,
}

impl InstrumentRecord {
    pub fn new(
        symbol: &str,
        exchange: &str,
        instrument_token: u32,
        lot_size: u32,
        quantity: u32,
        signal: SignalState,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            instrument_token,
            lot_size,
            quantity,
            live_quote: None,
            signal,
            position_state: PositionState::default(),
            active_orders: ActiveOrders::default(),
            direction: None,
            entry_fill_price: None,
            halted: false,
        }
    }

    /// Fold a streamed tick into the record: overwrite the quote and advance
    /// any tick-driven signal state.
    pub fn apply_tick(&mut self, tick: &Tick) {
        self.live_quote = Some(LiveQuote {
            last_price: tick.last_price,
            bid: tick.bid,
            ask: tick.ask,
            open_interest: tick.open_interest,
            volume: tick.volume_traded,
        });
        if let SignalState::Renko(renko) = &mut self.signal {
            renko.on_price(tick.last_price);
        }
    }

    pub fn last_price(&self) -> Option<Decimal> {
        self.live_quote.map(|q| q.last_price)
    }
}

pub type SharedRecord = Arc<Mutex<InstrumentRecord>>;

/// Registry of all instrument records, shared across tasks.
#[derive(Default)]
pub struct InstrumentStore {
    records: HashMap<String, SharedRecord>,
    by_token: HashMap<u32, String>,
}

impl InstrumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: InstrumentRecord) {
        let symbol = record.symbol.clone();
        self.by_token.insert(record.instrument_token, symbol.clone());
        self.records.insert(symbol, Arc::new(Mutex::new(record)));
    }

    pub fn get(&self, symbol: &str) -> Option<SharedRecord> {
        self.records.get(symbol).cloned()
    }

    /// Record for a streamed instrument token, if subscribed.
    pub fn by_token(&self, token: u32) -> Option<SharedRecord> {
        self.by_token
            .get(&token)
            .and_then(|symbol| self.records.get(symbol))
            .cloned()
    }

    /// All subscribed tokens, for the tick subscription.
    pub fn tokens(&self) -> Vec<u32> {
        self.by_token.keys().copied().collect()
    }

    /// Stable iteration order for the reconciliation cycle.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.records.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::RenkoState;
    use rust_decimal_macros::dec;

    fn renko_record(symbol: &str, token: u32) -> InstrumentRecord {
        InstrumentRecord::new(
            symbol,
            "NSE",
            token,
            1,
            10,
            SignalState::Renko(RenkoState::new(dec!(2))),
        )
    }

    fn tick(token: u32, price: Decimal) -> Tick {
        Tick {
            instrument_token: token,
            last_price: price,
            open_interest: None,
            volume_traded: None,
            bid: None,
            ask: None,
        }
    }

    #[test]
    fn test_tick_overwrites_quote_last_write_wins() {
        let mut record = renko_record("INFY", 1);
        record.apply_tick(&tick(1, dec!(100)));
        record.apply_tick(&tick(1, dec!(101)));
        assert_eq!(record.last_price(), Some(dec!(101)));
    }

    #[test]
    fn test_tick_advances_renko_state() {
        let mut record = renko_record("INFY", 1);
        record.apply_tick(&tick(1, dec!(100)));
        record.apply_tick(&tick(1, dec!(107)));
        match &record.signal {
            SignalState::Renko(renko) => assert_eq!(renko.brick_count(), 3),
            _ => panic!("expected renko signal"),
        }
    }

    #[test]
    fn test_token_lookup() {
        let mut store = InstrumentStore::new();
        store.insert(renko_record("INFY", 408065));
        store.insert(renko_record("TCS", 2953217));

        assert!(store.by_token(408065).is_some());
        assert!(store.by_token(999).is_none());
        assert_eq!(store.symbols(), vec!["INFY".to_string(), "TCS".to_string()]);
        let mut tokens = store.tokens();
        tokens.sort();
        assert_eq!(tokens, vec![408065, 2953217]);
    }
}
