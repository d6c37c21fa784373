//! Renko brick state machine with MACD confirmation.
//!
//! Bricks are tracked as a pair of price bounds around the last traded
//! price. A close beyond a bound shifts both bounds by whole bricks and
//! accumulates a signed brick count; the count only resets direction when
//! price breaks the opposite bound. Entries require two bricks in one
//! direction and a MACD crossover agreeing with it.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use crate::broker::{OhlcBar, TransactionType};
use crate::indicators::{self, MacdPoint};

/// ATR window used to size bricks, matching a 200-bar hourly lookback.
const BRICK_ATR_PERIOD: usize = 200;

/// Brick size from hourly history: `clamp(round(1.5 * ATR), 1, 10)`.
pub fn brick_size_from_atr(hourly_bars: &[OhlcBar]) -> Option<Decimal> {
    let atr = indicators::atr(hourly_bars, BRICK_ATR_PERIOD)?;
    let raw = (Decimal::new(15, 1) * atr).round_dp(0);
    Some(raw.clamp(Decimal::ONE, Decimal::TEN))
}

/// Last observed MACD-vs-signal relationship. Sticky: an exact tie keeps
/// the previous value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacdBias {
    #[default]
    Unset,
    Bullish,
    Bearish,
}

/// Renko signal state for one instrument.
#[derive(Debug, Clone)]
pub struct RenkoState {
    brick_size: Decimal,
    /// `(lower_bound, upper_bound)`, unset until the first price.
    bounds: Option<(Decimal, Decimal)>,
    brick_count: i64,
    macd_bias: MacdBias,
}

impl RenkoState {
    pub fn new(brick_size: Decimal) -> Self {
        Self {
            brick_size,
            bounds: None,
            brick_count: 0,
            macd_bias: MacdBias::Unset,
        }
    }

    pub fn brick_size(&self) -> Decimal {
        self.brick_size
    }

    pub fn brick_count(&self) -> i64 {
        self.brick_count
    }

    pub fn bounds(&self) -> Option<(Decimal, Decimal)> {
        self.bounds
    }

    pub fn macd_bias(&self) -> MacdBias {
        self.macd_bias
    }

    /// Fold one traded price into the brick state.
    pub fn on_price(&mut self, price: Decimal) {
        let Some((lower, upper)) = self.bounds else {
            self.bounds = Some((price - self.brick_size, price + self.brick_size));
            self.brick_count = 0;
            return;
        };

        if price > upper {
            let gap_dec = ((price - upper) / self.brick_size).floor();
            let gap = gap_dec.to_i64().unwrap_or(0);
            let new_lower = upper + gap_dec * self.brick_size - self.brick_size;
            let new_upper = upper + (gap_dec + Decimal::ONE) * self.brick_size;
            self.bounds = Some((new_lower, new_upper));
            self.brick_count = (self.brick_count + gap + 1).max(1);
            debug!(
                price = %price,
                lower = %new_lower,
                upper = %new_upper,
                bricks = self.brick_count,
                "renko brick up"
            );
        } else if price < lower {
            let gap_dec = ((lower - price) / self.brick_size).floor();
            let gap = gap_dec.to_i64().unwrap_or(0);
            let new_upper = lower - gap_dec * self.brick_size + self.brick_size;
            let new_lower = lower - (gap_dec + Decimal::ONE) * self.brick_size;
            self.bounds = Some((new_lower, new_upper));
            self.brick_count = (self.brick_count - gap - 1).min(-1);
            debug!(
                price = %price,
                lower = %new_lower,
                upper = %new_upper,
                bricks = self.brick_count,
                "renko brick down"
            );
        }
    }

    /// Update the MACD bias from the latest point, if one exists.
    pub fn refresh_macd(&mut self, point: Option<MacdPoint>) {
        if let Some(point) = point {
            if point.is_bullish() {
                self.macd_bias = MacdBias::Bullish;
            } else if point.is_bearish() {
                self.macd_bias = MacdBias::Bearish;
            }
        }
    }

    /// Entry direction, if the brick count and MACD bias agree.
    pub fn entry_signal(&self) -> Option<TransactionType> {
        match self.macd_bias {
            MacdBias::Bullish if self.brick_count >= 2 => Some(TransactionType::Buy),
            MacdBias::Bearish if self.brick_count <= -2 => Some(TransactionType::Sell),
            _ => None,
        }
    }

    /// Trailing stop for an open position: the bound behind the trade.
    pub fn stop_price(&self, direction: TransactionType) -> Option<Decimal> {
        let (lower, upper) = self.bounds?;
        match direction {
            TransactionType::Buy => Some(lower),
            TransactionType::Sell => Some(upper),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bullish_point() -> MacdPoint {
        MacdPoint {
            macd: dec!(1),
            signal: dec!(0),
        }
    }

    fn bearish_point() -> MacdPoint {
        MacdPoint {
            macd: dec!(-1),
            signal: dec!(0),
        }
    }

    #[test]
    fn test_initial_bounds_straddle_first_price() {
        let mut state = RenkoState::new(dec!(2));
        state.on_price(dec!(100));
        assert_eq!(state.bounds(), Some((dec!(98), dec!(102))));
        assert_eq!(state.brick_count(), 0);
    }

    #[test]
    fn test_multi_brick_jump_shifts_bounds_by_whole_bricks() {
        let mut state = RenkoState::new(dec!(2));
        state.on_price(dec!(100)); // bounds 98..102
        state.on_price(dec!(107)); // gap = floor(5/2) = 2

        assert_eq!(state.bounds(), Some((dec!(104), dec!(108))));
        assert_eq!(state.brick_count(), 3);
    }

    #[test]
    fn test_price_inside_bounds_is_a_no_op() {
        let mut state = RenkoState::new(dec!(2));
        state.on_price(dec!(100));
        state.on_price(dec!(101.5));
        assert_eq!(state.bounds(), Some((dec!(98), dec!(102))));
        assert_eq!(state.brick_count(), 0);
    }

    #[test]
    fn test_reversal_clamps_count_to_minus_one() {
        let mut state = RenkoState::new(dec!(2));
        state.on_price(dec!(100));
        state.on_price(dec!(107)); // count 3
        state.on_price(dec!(103)); // below lower bound 104, gap 0
        assert_eq!(state.brick_count(), -1);
        assert_eq!(state.bounds(), Some((dec!(102), dec!(106))));
    }

    #[test]
    fn test_count_monotonic_while_price_climbs() {
        let mut state = RenkoState::new(dec!(1));
        state.on_price(dec!(100));
        let mut last = state.brick_count();
        for step in 1..=20 {
            state.on_price(dec!(100) + Decimal::from(step) * dec!(1.5));
            assert!(state.brick_count() >= last);
            last = state.brick_count();
        }
    }

    #[test]
    fn test_entry_requires_bricks_and_macd_agreement() {
        let mut state = RenkoState::new(dec!(2));
        state.on_price(dec!(100));
        state.on_price(dec!(107)); // count 3

        assert_eq!(state.entry_signal(), None); // no MACD bias yet

        state.refresh_macd(Some(bearish_point()));
        assert_eq!(state.entry_signal(), None); // disagreeing bias

        state.refresh_macd(Some(bullish_point()));
        assert_eq!(state.entry_signal(), Some(TransactionType::Buy));
    }

    #[test]
    fn test_short_entry_on_negative_bricks() {
        let mut state = RenkoState::new(dec!(2));
        state.on_price(dec!(100));
        state.on_price(dec!(93)); // gap = floor(5/2) = 2, count -3
        state.refresh_macd(Some(bearish_point()));
        assert_eq!(state.entry_signal(), Some(TransactionType::Sell));
    }

    #[test]
    fn test_stop_price_tracks_bound_behind_trade() {
        let mut state = RenkoState::new(dec!(2));
        state.on_price(dec!(100));
        state.on_price(dec!(107));
        assert_eq!(state.stop_price(TransactionType::Buy), Some(dec!(104)));
        assert_eq!(state.stop_price(TransactionType::Sell), Some(dec!(108)));
    }

    #[test]
    fn test_macd_tie_keeps_previous_bias() {
        let mut state = RenkoState::new(dec!(1));
        state.refresh_macd(Some(bullish_point()));
        state.refresh_macd(Some(MacdPoint {
            macd: dec!(0.5),
            signal: dec!(0.5),
        }));
        assert_eq!(state.macd_bias(), MacdBias::Bullish);
    }
}
