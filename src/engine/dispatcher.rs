//! Tick dispatcher.
//!
//! Drains the ticker channel and folds tick batches into the instrument
//! store. Unknown tokens are skipped; within one batch later ticks for the
//! same token overwrite earlier ones via the record's last-write-wins quote.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::TickerEvent;
use crate::store::InstrumentStore;

/// Consume ticker events until the sender side closes.
pub async fn run(store: Arc<InstrumentStore>, mut rx: mpsc::Receiver<TickerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TickerEvent::Connected => info!("tick stream connected"),
            TickerEvent::Disconnected => warn!("tick stream disconnected"),
            TickerEvent::Ticks(ticks) => {
                for tick in &ticks {
                    match store.by_token(tick.instrument_token) {
                        Some(record) => record.lock().await.apply_tick(tick),
                        None => {
                            debug!(token = tick.instrument_token, "tick for unknown token")
                        }
                    }
                }
            }
        }
    }
    info!("tick dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Tick;
    use crate::signal::{RenkoState, SignalState};
    use crate::store::InstrumentRecord;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

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

    #[tokio::test]
    async fn test_dispatch_updates_known_and_skips_unknown() {
        let mut store = InstrumentStore::new();
        store.insert(InstrumentRecord::new(
            "INFY",
            "NSE",
            1,
            1,
            10,
            SignalState::Renko(RenkoState::new(dec!(2))),
        ));
        let store = Arc::new(store);

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run(store.clone(), rx));

        tx.send(TickerEvent::Connected).await.unwrap();
        tx.send(TickerEvent::Ticks(vec![
            tick(1, dec!(100)),
            tick(99, dec!(5)), // not subscribed
            tick(1, dec!(101)),
        ]))
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let record = store.get("INFY").unwrap();
        let record = record.lock().await;
        assert_eq!(record.last_price(), Some(dec!(101)));
    }
}
