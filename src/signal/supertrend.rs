//! Triple-Supertrend signal with a unanimity gate.
//!
//! Three parameterizations of the Supertrend line are evaluated over the
//! same 5-minute bars. Each keeps an independent direction flag that flips
//! only on a close-price crossover of its line between the last two bars;
//! entry fires only when all three agree. The stop price is a blend of the
//! lines nearest the close, recomputed fresh every cycle.

use rust_decimal::Decimal;

use crate::broker::{OhlcBar, TransactionType};
use crate::indicators;

/// The three (ATR period, multiplier) pairs, fastest first.
pub const PARAMS: [(usize, u32); 3] = [(7, 3), (10, 3), (11, 2)];

/// Direction of one Supertrend line relative to price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrendFlag {
    /// No crossover observed yet.
    #[default]
    Unset,
    Green,
    Red,
}

/// Supertrend signal state for one instrument.
#[derive(Debug, Clone, Default)]
pub struct SupertrendState {
    flags: [TrendFlag; 3],
    /// Latest line value per parameterization.
    lines: [Option<Decimal>; 3],
    last_close: Option<Decimal>,
}

impl SupertrendState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(&self) -> [TrendFlag; 3] {
        self.flags
    }

    /// Recompute the three lines from bar history and flip any flag whose
    /// line was crossed between the last two bars. Flags persist when no
    /// crossover happened, so repeated evaluation of the same window is
    /// idempotent.
    pub fn refresh(&mut self, bars: &[OhlcBar]) {
        if bars.len() < 2 {
            return;
        }
        let close = bars[bars.len() - 1].close;
        let prev_close = bars[bars.len() - 2].close;
        self.last_close = Some(close);

        for (slot, (period, multiplier)) in PARAMS.iter().enumerate() {
            let line = indicators::supertrend(bars, *period, Decimal::from(*multiplier));
            let last = line.get(bars.len() - 1).copied().flatten();
            let prev = line.get(bars.len() - 2).copied().flatten();
            self.lines[slot] = last;

            if let (Some(last), Some(prev)) = (last, prev) {
                if last > close && prev < prev_close {
                    self.flags[slot] = TrendFlag::Red;
                } else if last < close && prev > prev_close {
                    self.flags[slot] = TrendFlag::Green;
                }
            }
        }
    }

    /// Entry direction when all three flags agree.
    pub fn entry_signal(&self) -> Option<TransactionType> {
        match self.flags {
            [TrendFlag::Green, TrendFlag::Green, TrendFlag::Green] => Some(TransactionType::Buy),
            [TrendFlag::Red, TrendFlag::Red, TrendFlag::Red] => Some(TransactionType::Sell),
            _ => None,
        }
    }

    /// Blended stop price from the latest lines, rounded to the 0.1 tick.
    ///
    /// When all three lines sit on one side of the close, the two nearest
    /// lines are blended 60/40; with lines straddling the close the plain
    /// mean is used.
    pub fn stop_price(&self) -> Option<Decimal> {
        let close = self.last_close?;
        let mut lines = [self.lines[0]?, self.lines[1]?, self.lines[2]?];
        let three = Decimal::from(3);
        let w_near = Decimal::new(6, 1);
        let w_second = Decimal::new(4, 1);

        let sl = if lines.iter().min().copied().unwrap_or(close) > close {
            // All lines above: nearest is the smallest.
            lines.sort();
            w_near * lines[0] + w_second * lines[1]
        } else if lines.iter().max().copied().unwrap_or(close) < close {
            // All lines below: nearest is the largest.
            lines.sort();
            lines.reverse();
            w_near * lines[0] + w_second * lines[1]
        } else {
            (lines[0] + lines[1] + lines[2]) / three
        };

        Some(sl.round_dp(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn bars_from_closes(closes: &[Decimal]) -> Vec<OhlcBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| OhlcBar {
                date: Utc.with_ymd_and_hms(2024, 1, 1, 9, 15, 0).unwrap()
                    + chrono::Duration::minutes(5 * i as i64),
                open: *c,
                high: *c + dec!(1),
                low: *c - dec!(1),
                close: *c,
                volume: 1_000,
            })
            .collect()
    }

    fn v_shape_closes() -> Vec<Decimal> {
        // Long slide then a sharp recovery; enough history for the slowest
        // parameterization (period 11) to seed and flip.
        let mut closes = Vec::new();
        for i in 0..25 {
            closes.push(Decimal::from(300 - i * 4));
        }
        for i in 0..25 {
            closes.push(Decimal::from(200 + i * 6));
        }
        closes
    }

    #[test]
    fn test_flags_start_unset_and_no_entry() {
        let state = SupertrendState::new();
        assert_eq!(state.flags(), [TrendFlag::Unset; 3]);
        assert_eq!(state.entry_signal(), None);
    }

    #[test]
    fn test_unanimous_green_after_strong_reversal() {
        let closes = v_shape_closes();
        let bars = bars_from_closes(&closes);
        let mut state = SupertrendState::new();
        // Walk the history forward so each crossover is seen as it happens.
        for end in 13..=bars.len() {
            state.refresh(&bars[..end]);
        }
        assert_eq!(state.flags(), [TrendFlag::Green; 3]);
        assert_eq!(state.entry_signal(), Some(TransactionType::Buy));
    }

    #[test]
    fn test_mixed_flags_yield_no_entry() {
        let mut state = SupertrendState::new();
        state.flags = [TrendFlag::Green, TrendFlag::Green, TrendFlag::Red];
        assert_eq!(state.entry_signal(), None);
    }

    #[test]
    fn test_refresh_is_idempotent_on_same_window() {
        let closes = v_shape_closes();
        let bars = bars_from_closes(&closes);
        let mut state = SupertrendState::new();
        for end in 13..=bars.len() {
            state.refresh(&bars[..end]);
        }
        let before = state.flags();
        state.refresh(&bars);
        state.refresh(&bars);
        assert_eq!(state.flags(), before);
    }

    #[test]
    fn test_stop_blend_when_all_lines_below_close() {
        let mut state = SupertrendState::new();
        state.last_close = Some(dec!(100));
        state.lines = [Some(dec!(95)), Some(dec!(97)), Some(dec!(90))];
        // Nearest 97, second 95: 0.6*97 + 0.4*95 = 96.2
        assert_eq!(state.stop_price(), Some(dec!(96.2)));
    }

    #[test]
    fn test_stop_blend_when_all_lines_above_close() {
        let mut state = SupertrendState::new();
        state.last_close = Some(dec!(100));
        state.lines = [Some(dec!(105)), Some(dec!(103)), Some(dec!(110))];
        // Nearest 103, second 105: 0.6*103 + 0.4*105 = 103.8
        assert_eq!(state.stop_price(), Some(dec!(103.8)));
    }

    #[test]
    fn test_stop_mean_when_lines_straddle_close() {
        let mut state = SupertrendState::new();
        state.last_close = Some(dec!(100));
        state.lines = [Some(dec!(95)), Some(dec!(105)), Some(dec!(101))];
        // Mean of 95, 105, 101 = 100.333... -> 100.3
        assert_eq!(state.stop_price(), Some(dec!(100.3)));
    }

    #[test]
    fn test_stop_unavailable_without_all_lines() {
        let mut state = SupertrendState::new();
        state.last_close = Some(dec!(100));
        state.lines = [Some(dec!(95)), None, Some(dec!(101))];
        assert_eq!(state.stop_price(), None);
    }
}
