//! Pure indicator math over OHLC bar history.
//!
//! All series functions return `Vec<Option<Decimal>>` aligned with the input
//! bars; a `None` marks the warm-up region where the indicator is not yet
//! valid. The exponential averages use the adjusted weighting
//! `sum((1-a)^(t-i) x_i) / sum((1-a)^(t-i))` with a minimum observation
//! count, so values match the usual charting-platform output.

use rust_decimal::Decimal;

use crate::broker::OhlcBar;

/// MACD line and its signal line at one bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacdPoint {
    pub macd: Decimal,
    pub signal: Decimal,
}

impl MacdPoint {
    pub fn is_bullish(&self) -> bool {
        self.macd > self.signal
    }

    pub fn is_bearish(&self) -> bool {
        self.macd < self.signal
    }
}

/// Adjusted exponential moving average over a series with leading gaps.
///
/// `one_minus_alpha` is the decay factor; output is `None` until
/// `min_periods` observations have been seen.
fn ewm(
    values: &[Option<Decimal>],
    one_minus_alpha: Decimal,
    min_periods: usize,
) -> Vec<Option<Decimal>> {
    let mut out = Vec::with_capacity(values.len());
    let mut num = Decimal::ZERO;
    let mut den = Decimal::ZERO;
    let mut seen = 0usize;

    for value in values {
        match value {
            Some(x) => {
                num = *x + one_minus_alpha * num;
                den = Decimal::ONE + one_minus_alpha * den;
                seen += 1;
                if seen >= min_periods {
                    out.push(Some(num / den));
                } else {
                    out.push(None);
                }
            }
            None => out.push(None),
        }
    }
    out
}

/// Decay factor for an EWM parameterized by center of mass.
fn decay_com(com: usize) -> Decimal {
    Decimal::from(com) / Decimal::from(com + 1)
}

/// Decay factor for an EWM parameterized by span.
fn decay_span(span: usize) -> Decimal {
    Decimal::from(span - 1) / Decimal::from(span + 1)
}

/// True range per bar. The first bar has no previous close, so no value.
fn true_range(bars: &[OhlcBar]) -> Vec<Option<Decimal>> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            if i == 0 {
                return None;
            }
            let prev_close = bars[i - 1].close;
            let hl = bar.high - bar.low;
            let hpc = (bar.high - prev_close).abs();
            let lpc = (bar.low - prev_close).abs();
            Some(hl.max(hpc).max(lpc))
        })
        .collect()
}

/// Average True Range series, EWM with center of mass `period`.
pub fn atr_series(bars: &[OhlcBar], period: usize) -> Vec<Option<Decimal>> {
    ewm(&true_range(bars), decay_com(period), period)
}

/// Latest ATR value, if enough history exists.
pub fn atr(bars: &[OhlcBar], period: usize) -> Option<Decimal> {
    atr_series(bars, period).last().copied().flatten()
}

/// MACD series with the given fast/slow/signal spans.
pub fn macd_series(
    bars: &[OhlcBar],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Vec<Option<MacdPoint>> {
    let closes: Vec<Option<Decimal>> = bars.iter().map(|b| Some(b.close)).collect();
    let fast_ema = ewm(&closes, decay_span(fast), fast);
    let slow_ema = ewm(&closes, decay_span(slow), slow);

    let macd_line: Vec<Option<Decimal>> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    let signal_line = ewm(&macd_line, decay_span(signal), signal);

    macd_line
        .iter()
        .zip(&signal_line)
        .map(|(m, s)| match (m, s) {
            (Some(macd), Some(signal)) => Some(MacdPoint {
                macd: *macd,
                signal: *signal,
            }),
            _ => None,
        })
        .collect()
}

/// Latest MACD point, if enough history exists.
pub fn macd(bars: &[OhlcBar], fast: usize, slow: usize, signal: usize) -> Option<MacdPoint> {
    macd_series(bars, fast, slow, signal).last().copied().flatten()
}

/// Supertrend line for one (period, multiplier) parameterization.
///
/// Basic bands are `(high+low)/2 ± multiplier * ATR`. The final upper band
/// only tightens while the previous close stays at or below it and resets on
/// a breakout; mirrored for the lower band. The realized line follows the
/// lower band in an uptrend and the upper band in a downtrend, switching
/// exactly on a close crossover of the active band.
pub fn supertrend(bars: &[OhlcBar], period: usize, multiplier: Decimal) -> Vec<Option<Decimal>> {
    let n = bars.len();
    let atr = atr_series(bars, period);

    let mut upper: Vec<Option<Decimal>> = vec![None; n];
    let mut lower: Vec<Option<Decimal>> = vec![None; n];
    let two = Decimal::TWO;
    let basic_upper: Vec<Option<Decimal>> = bars
        .iter()
        .zip(&atr)
        .map(|(b, a)| a.map(|a| (b.high + b.low) / two + multiplier * a))
        .collect();
    let basic_lower: Vec<Option<Decimal>> = bars
        .iter()
        .zip(&atr)
        .map(|(b, a)| a.map(|a| (b.high + b.low) / two - multiplier * a))
        .collect();

    for i in 0..n {
        upper[i] = basic_upper[i];
        lower[i] = basic_lower[i];
        if i == 0 {
            continue;
        }
        if let (Some(bu), Some(prev_u)) = (basic_upper[i], upper[i - 1]) {
            if bars[i - 1].close <= prev_u {
                upper[i] = Some(bu.min(prev_u));
            }
        }
        if let (Some(bl), Some(prev_l)) = (basic_lower[i], lower[i - 1]) {
            if bars[i - 1].close >= prev_l {
                lower[i] = Some(bl.max(prev_l));
            }
        }
    }

    let mut line: Vec<Option<Decimal>> = vec![None; n];

    // Seed the line at the first close crossover of a band.
    let mut start = None;
    for i in 1..n {
        if let (Some(u_prev), Some(u)) = (upper[i - 1], upper[i]) {
            if bars[i - 1].close <= u_prev && bars[i].close > u {
                line[i] = lower[i];
                start = Some(i);
                break;
            }
        }
        if let (Some(l_prev), Some(l)) = (lower[i - 1], lower[i]) {
            if bars[i - 1].close >= l_prev && bars[i].close < l {
                line[i] = upper[i];
                start = Some(i);
                break;
            }
        }
    }
    let Some(start) = start else {
        return line;
    };

    for i in start + 1..n {
        let (Some(u), Some(l)) = (upper[i], lower[i]) else {
            continue;
        };
        if line[i - 1] == upper[i - 1] {
            line[i] = if bars[i].close <= u { Some(u) } else { Some(l) };
        } else if line[i - 1] == lower[i - 1] {
            line[i] = if bars[i].close >= l { Some(l) } else { Some(u) };
        }
    }

    line
}
