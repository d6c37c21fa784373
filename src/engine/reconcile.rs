//! Reconciliation Loop.
//!
//! Runs on a fixed cadence. Each cycle re-fetches the broker position and
//! order snapshots (ground truth), re-derives every record's position state
//! from them, and acts on the decision table: enter when flat and the signal
//! qualifies, police the bracket when open, and halt the instrument on an
//! order-state desync. Order placement and fill polling run in spawned
//! tasks so a slow fill never delays the next cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::orders::OrderLifecycle;
use super::{fetch_orders, fetch_positions, EngineResult};
use crate::broker::{BrokerApi, OrderRequest, OrderRow, PositionRow, TransactionType};
use crate::indicators;
use crate::signal::SignalState;
use crate::store::{InstrumentStore, PositionState, SharedRecord};

/// Bar history window for per-cycle signal refresh, in days.
const SIGNAL_HISTORY_DAYS: i64 = 4;

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub poll_interval: Duration,
    /// Immediate retries per snapshot fetch before the cycle is abandoned.
    pub snapshot_retries: u32,
    /// Entry allowed only while required margin stays under this fraction of
    /// free cash.
    pub margin_utilization: Decimal,
    /// Fixed bracket distances from the realized fill. `None` disables the
    /// corresponding breach check (trend strategies trail instead).
    pub stoploss_points: Option<Decimal>,
    pub takeprofit_points: Option<Decimal>,
    pub fill_poll_interval: Duration,
    pub fill_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            snapshot_retries: 10,
            margin_utilization: Decimal::new(5, 1),
            stoploss_points: None,
            takeprofit_points: None,
            fill_poll_interval: Duration::from_millis(500),
            fill_timeout: Duration::from_secs(60),
        }
    }
}

/// How the protective stop trigger is derived once the fill is known.
#[derive(Debug, Clone, Copy)]
enum StopRule {
    /// Absolute price from the signal engine.
    Fixed(Decimal),
    /// Offset from the realized fill, on the losing side.
    PointsFromFill(Decimal),
}

impl StopRule {
    fn trigger(&self, direction: TransactionType, fill: Decimal) -> Decimal {
        match self {
            StopRule::Fixed(price) => *price,
            StopRule::PointsFromFill(points) => match direction {
                TransactionType::Buy => (fill - points).round_dp(1),
                TransactionType::Sell => (fill + points).round_dp(1),
            },
        }
    }
}

struct EntryPlan {
    request: OrderRequest,
    direction: TransactionType,
    stop: StopRule,
}

pub struct Reconciler {
    broker: Arc<dyn BrokerApi>,
    store: Arc<InstrumentStore>,
    lifecycle: Arc<OrderLifecycle>,
    cfg: ReconcileConfig,
    entry_tasks: JoinSet<()>,
}

impl Reconciler {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        store: Arc<InstrumentStore>,
        cfg: ReconcileConfig,
    ) -> Self {
        let lifecycle = Arc::new(OrderLifecycle::new(
            broker.clone(),
            cfg.fill_poll_interval,
            cfg.fill_timeout,
        ));
        Self {
            broker,
            store,
            lifecycle,
            cfg,
            entry_tasks: JoinSet::new(),
        }
    }

    /// Cycle until the shutdown flag is set, then drain in-flight entries.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                info!("shutdown observed, stopping reconciliation");
                break;
            }
            if let Err(err) = self.cycle().await {
                error!(%err, "reconciliation cycle abandoned");
            }
        }
        while self.entry_tasks.join_next().await.is_some() {}
    }

    /// One reconciliation pass over every instrument.
    pub async fn cycle(&mut self) -> EngineResult<()> {
        while self.entry_tasks.try_join_next().is_some() {}

        let positions = fetch_positions(self.broker.as_ref(), self.cfg.snapshot_retries).await?;
        let orders = fetch_orders(self.broker.as_ref(), self.cfg.snapshot_retries).await?;

        for symbol in self.store.symbols() {
            let Some(record) = self.store.get(&symbol) else {
                continue;
            };
            // An entry task may hold this lock through order placement;
            // skip and pick the instrument up next cycle.
            let Ok(mut rec) = record.try_lock() else {
                debug!(%symbol, "record busy, skipping this cycle");
                continue;
            };
            if rec.halted {
                debug!(%symbol, "automation halted, skipping");
                continue;
            }
            self.refresh_signal(&mut rec).await;
            self.evaluate(&record, &mut rec, &positions, &orders).await;
        }
        Ok(())
    }

    /// Re-derive signal state that depends on bar history.
    async fn refresh_signal(&self, rec: &mut crate::store::InstrumentRecord) {
        let token = rec.instrument_token;
        let symbol = rec.symbol.clone();
        match &mut rec.signal {
            SignalState::Renko(renko) => match self.recent_bars(token).await {
                Ok(bars) => renko.refresh_macd(indicators::macd(&bars, 12, 26, 9)),
                Err(err) => warn!(%symbol, %err, "MACD refresh failed"),
            },
            SignalState::Supertrend(state) => match self.recent_bars(token).await {
                Ok(bars) => state.refresh(&bars),
                Err(err) => warn!(%symbol, %err, "supertrend refresh failed"),
            },
            SignalState::OptionLeg(_) => {}
        }
    }

    async fn recent_bars(&self, token: u32) -> EngineResult<Vec<crate::broker::OhlcBar>> {
        let to = Utc::now().date_naive();
        let from = to - chrono::Duration::days(SIGNAL_HISTORY_DAYS);
        Ok(self.broker.historical_data(token, from, to, "5minute").await?)
    }

    async fn evaluate(
        &mut self,
        record: &SharedRecord,
        rec: &mut crate::store::InstrumentRecord,
        positions: &[PositionRow],
        orders: &[OrderRow],
    ) {
        let position = positions.iter().find(|p| p.tradingsymbol == rec.symbol);
        let broker_qty = position.map(|p| p.quantity).unwrap_or(0);

        if broker_qty != 0 {
            self.police_open_position(rec, broker_qty, position, orders).await;
            return;
        }

        // Broker is flat for this symbol.
        let entry_live = rec
            .active_orders
            .entry
            .as_deref()
            .and_then(|id| orders.iter().find(|o| o.order_id == id))
            .map(|o| o.status.is_live())
            .unwrap_or(false);
        if entry_live || rec.position_state == PositionState::PendingEntry {
            rec.position_state = PositionState::PendingEntry;
            return;
        }

        // Clear any leftover trade context before considering a new entry.
        rec.position_state = PositionState::Flat;
        rec.active_orders.clear();
        rec.direction = None;
        rec.entry_fill_price = None;

        let Some(direction) = rec.signal.entry_signal() else {
            return;
        };
        let Some(stop) = self.stop_rule(rec, direction) else {
            warn!(symbol = %rec.symbol, "entry signal without a stop price, skipping");
            return;
        };

        let request = OrderRequest::market(&rec.symbol, &rec.exchange, direction, rec.quantity);
        match self.margin_allows(&request).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!(symbol = %rec.symbol, %err, "margin check failed, skipping entry");
                return;
            }
        }

        info!(
            symbol = %rec.symbol,
            side = ?direction,
            quantity = rec.quantity,
            "entry qualified, dispatching order task"
        );
        rec.position_state = PositionState::PendingEntry;
        rec.direction = Some(direction);
        if let SignalState::OptionLeg(leg) = &mut rec.signal {
            leg.disarm();
        }
        self.spawn_entry(record.clone(), EntryPlan { request, direction, stop });
    }

    /// Decision steps for an instrument the broker reports as held.
    async fn police_open_position(
        &self,
        rec: &mut crate::store::InstrumentRecord,
        broker_qty: i64,
        position: Option<&PositionRow>,
        orders: &[OrderRow],
    ) {
        if rec.position_state == PositionState::PendingEntry {
            // The entry task is between its fill and the stop attach; it owns
            // the transition to Open and places the protective order itself.
            debug!(symbol = %rec.symbol, "entry in flight, deferring position checks");
            return;
        }
        rec.position_state = PositionState::Open;
        let direction = *rec.direction.get_or_insert(if broker_qty > 0 {
            TransactionType::Buy
        } else {
            TransactionType::Sell
        });
        if rec.entry_fill_price.is_none() {
            // Restart case: recover the fill from the broker's average price.
            rec.entry_fill_price = position.map(|p| p.average_price);
        }

        // The standing stop must exist; adopt a live order for the symbol if
        // the local id was lost on restart.
        let stop_id = rec
            .active_orders
            .stop_loss
            .clone()
            .filter(|id| {
                orders
                    .iter()
                    .any(|o| &o.order_id == id && o.status.is_live())
            })
            .or_else(|| {
                orders
                    .iter()
                    .find(|o| o.tradingsymbol == rec.symbol && o.status.is_live())
                    .map(|o| o.order_id.clone())
            });
        let Some(stop_id) = stop_id else {
            rec.halted = true;
            error!(
                symbol = %rec.symbol,
                "position open but no live protective order, halting instrument"
            );
            return;
        };
        rec.active_orders.stop_loss = Some(stop_id.clone());

        let ltp = match rec.last_price() {
            Some(price) => Some(price),
            None => {
                let key = format!("{}:{}", rec.exchange, rec.symbol);
                self.broker.ltp(&key).await.ok()
            }
        };
        let Some(ltp) = ltp else {
            debug!(symbol = %rec.symbol, "no live price yet, skipping bracket check");
            return;
        };

        // Bracket breach, stop side checked first.
        if let (Some(fill), Some(points)) = (rec.entry_fill_price, self.cfg.stoploss_points) {
            let stop_level = StopRule::PointsFromFill(points).trigger(direction, fill);
            let breached = match direction {
                TransactionType::Buy => ltp <= stop_level,
                TransactionType::Sell => ltp >= stop_level,
            };
            if breached {
                info!(symbol = %rec.symbol, %ltp, %stop_level, "stop-loss breached, exiting");
                self.force_exit(rec, &stop_id, direction, ltp).await;
                return;
            }
        }
        if let (Some(fill), Some(points)) = (rec.entry_fill_price, self.cfg.takeprofit_points) {
            let target_level = match direction {
                TransactionType::Buy => (fill + points).round_dp(1),
                TransactionType::Sell => (fill - points).round_dp(1),
            };
            let breached = match direction {
                TransactionType::Buy => ltp >= target_level,
                TransactionType::Sell => ltp <= target_level,
            };
            if breached {
                info!(symbol = %rec.symbol, %ltp, %target_level, "target reached, exiting");
                self.force_exit(rec, &stop_id, direction, ltp).await;
                return;
            }
        }

        // No breach: trail the stop to the signal's fresh level.
        let trail = match &rec.signal {
            SignalState::Renko(renko) => renko.stop_price(direction),
            SignalState::Supertrend(state) => state.stop_price(),
            SignalState::OptionLeg(_) => None,
        };
        if let Some(price) = trail {
            let current = orders
                .iter()
                .find(|o| o.order_id == stop_id)
                .map(|o| o.trigger_price);
            if current != Some(price) {
                if let Err(err) = self.lifecycle.reprice_stop(&stop_id, price).await {
                    warn!(symbol = %rec.symbol, %err, "trailing reprice failed");
                }
            }
        }
    }

    /// Convert the standing stop into an immediate exit by repricing it to a
    /// level that triggers at once. Never cancel-then-replace.
    async fn force_exit(
        &self,
        rec: &mut crate::store::InstrumentRecord,
        stop_id: &str,
        direction: TransactionType,
        ltp: Decimal,
    ) {
        let quote = rec.live_quote;
        let exit_price = match direction {
            TransactionType::Buy => quote.and_then(|q| q.ask).unwrap_or(ltp),
            TransactionType::Sell => quote.and_then(|q| q.bid).unwrap_or(ltp),
        };
        match self.lifecycle.reprice_stop(stop_id, exit_price).await {
            Ok(()) => rec.position_state = PositionState::PendingExit,
            Err(err) => error!(symbol = %rec.symbol, %err, "exit reprice failed"),
        }
    }

    fn stop_rule(
        &self,
        rec: &crate::store::InstrumentRecord,
        direction: TransactionType,
    ) -> Option<StopRule> {
        match &rec.signal {
            SignalState::Renko(renko) => renko.stop_price(direction).map(StopRule::Fixed),
            SignalState::Supertrend(state) => state.stop_price().map(StopRule::Fixed),
            SignalState::OptionLeg(_) => self.cfg.stoploss_points.map(StopRule::PointsFromFill),
        }
    }

    /// Pre-trade margin gate: required margin must stay under the configured
    /// fraction of free cash. Insufficiency is a skip, never an error.
    async fn margin_allows(&self, request: &OrderRequest) -> EngineResult<bool> {
        let estimate = self
            .broker
            .basket_order_margins(std::slice::from_ref(request))
            .await?;
        let margins = self.broker.margins().await?;
        let budget = self.cfg.margin_utilization * margins.available_cash;
        if estimate.required < budget {
            Ok(true)
        } else {
            warn!(
                symbol = %request.tradingsymbol,
                required = %estimate.required,
                budget = %budget,
                "insufficient margin, skipping entry"
            );
            Ok(false)
        }
    }

    fn spawn_entry(&mut self, record: SharedRecord, plan: EntryPlan) {
        let lifecycle = self.lifecycle.clone();
        self.entry_tasks.spawn(async move {
            Self::entry_task(lifecycle, record, plan).await;
        });
    }

    /// Entry sequence: submit under the record lock, poll the fill with the
    /// lock released, re-lock to attach the stop.
    async fn entry_task(lifecycle: Arc<OrderLifecycle>, record: SharedRecord, plan: EntryPlan) {
        let order_id = {
            let mut rec = record.lock().await;
            if rec.halted || rec.position_state != PositionState::PendingEntry {
                return;
            }
            match lifecycle.place_entry(&plan.request).await {
                Ok(id) => {
                    rec.active_orders.entry = Some(id.clone());
                    id
                }
                Err(err) => {
                    error!(symbol = %rec.symbol, %err, "entry placement failed");
                    rec.position_state = PositionState::Flat;
                    rec.direction = None;
                    return;
                }
            }
        };

        match lifecycle.wait_for_fill(&order_id).await {
            Ok(fill) => {
                let trigger = plan.stop.trigger(plan.direction, fill);
                let mut rec = record.lock().await;
                rec.entry_fill_price = Some(fill);
                rec.position_state = PositionState::Open;
                rec.active_orders.entry = None;
                match lifecycle
                    .attach_stop(
                        &rec.symbol,
                        &rec.exchange,
                        plan.direction,
                        plan.request.quantity,
                        trigger,
                    )
                    .await
                {
                    Ok(id) => rec.active_orders.stop_loss = Some(id),
                    Err(err) => {
                        // Open position with no protection: halt loudly and
                        // leave it to the operator.
                        error!(symbol = %rec.symbol, %err, "stop attach failed, halting");
                        rec.halted = true;
                    }
                }
            }
            Err(err) => {
                warn!(order_id = %order_id, %err, "entry did not complete");
                let mut rec = record.lock().await;
                rec.position_state = PositionState::Flat;
                rec.active_orders.entry = None;
                rec.direction = None;
            }
        }
    }
}
