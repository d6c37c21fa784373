//! Option-leg selection for the long-straddle-leg strategy.
//!
//! Picks one contract from the derivatives instrument dump: the expiry at a
//! configured offset from the nearest, then the at-the-money strike shifted
//! by a configured number of strikes (towards out-of-the-money for both call
//! and put sides). The leg itself has no market-timing gate: entry is
//! qualified as soon as the record is flat and margin allows.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::broker::{Instrument, TransactionType};

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum OptionType {
    #[serde(rename = "CE")]
    Ce,
    #[serde(rename = "PE")]
    Pe,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Ce => "CE",
            OptionType::Pe => "PE",
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CE" => Ok(OptionType::Ce),
            "PE" => Ok(OptionType::Pe),
            other => Err(format!("unknown option type {:?}, expected CE or PE", other)),
        }
    }
}

/// Index quote key for the underlying spot price.
pub fn underlying_quote_key(underlying: &str) -> String {
    match underlying {
        "NIFTY" => "NSE:NIFTY 50".to_string(),
        "BANKNIFTY" => "NSE:NIFTY BANK".to_string(),
        other => format!("NSE:{}", other),
    }
}

/// Signal state for one option leg. Entry has no market-timing condition;
/// the leg is bought once on the first qualified cycle, and the bracket is
/// derived from the realized fill.
#[derive(Debug, Clone)]
pub struct OptionLegState {
    pub option_type: OptionType,
    pub expiry: Option<NaiveDate>,
    pub strike: Decimal,
    armed: bool,
}

impl OptionLegState {
    pub fn new(contract: &Instrument, option_type: OptionType) -> Self {
        Self {
            option_type,
            expiry: contract.expiry,
            strike: contract.strike,
            armed: true,
        }
    }

    /// Option legs are always bought; direction never depends on price.
    /// One shot per run: `None` once the entry has been dispatched.
    pub fn entry_signal(&self) -> Option<TransactionType> {
        if self.armed {
            Some(TransactionType::Buy)
        } else {
            None
        }
    }

    /// Called when the entry is dispatched so the leg is not re-bought
    /// after the bracket closes it.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

/// Pick the traded contract from the instrument dump.
///
/// `expiry_offset` indexes the sorted distinct expiries (0 = nearest);
/// `atm_offset` shifts the at-the-money strike index towards out-of-the-money
/// (up for calls, down for puts).
pub fn select_option_contract(
    instruments: &[Instrument],
    underlying: &str,
    underlying_ltp: Decimal,
    option_type: OptionType,
    expiry_offset: usize,
    atm_offset: i64,
) -> Option<Instrument> {
    let mut expiries: Vec<NaiveDate> = instruments
        .iter()
        .filter(|i| i.name == underlying && i.instrument_type == option_type.as_str())
        .filter_map(|i| i.expiry)
        .collect();
    expiries.sort();
    expiries.dedup();
    let expiry = *expiries.get(expiry_offset)?;

    let mut chain: Vec<&Instrument> = instruments
        .iter()
        .filter(|i| {
            i.name == underlying
                && i.instrument_type == option_type.as_str()
                && i.expiry == Some(expiry)
        })
        .collect();
    chain.sort_by_key(|i| i.strike);

    let atm_idx = chain
        .iter()
        .enumerate()
        .min_by_key(|(_, i)| (i.strike - underlying_ltp).abs())
        .map(|(idx, _)| idx)?;

    let target = match option_type {
        OptionType::Ce => atm_idx as i64 + atm_offset,
        OptionType::Pe => atm_idx as i64 - atm_offset,
    };
    chain.get(usize::try_from(target).ok()?).map(|i| (*i).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn contract(strike: Decimal, opt: &str, expiry: NaiveDate) -> Instrument {
        Instrument {
            instrument_token: (strike.mantissa() % 1_000_000) as u32,
            tradingsymbol: format!("NIFTY{}{}", strike, opt),
            name: "NIFTY".to_string(),
            exchange: "NFO".to_string(),
            expiry: Some(expiry),
            strike,
            lot_size: 50,
            instrument_type: opt.to_string(),
        }
    }

    fn chain() -> Vec<Instrument> {
        let near = NaiveDate::from_ymd_opt(2024, 6, 6).unwrap();
        let far = NaiveDate::from_ymd_opt(2024, 6, 13).unwrap();
        let mut out = Vec::new();
        for strike in [22300, 22350, 22400, 22450, 22500, 22550] {
            for expiry in [near, far] {
                out.push(contract(Decimal::from(strike), "CE", expiry));
                out.push(contract(Decimal::from(strike), "PE", expiry));
            }
        }
        out
    }

    #[test]
    fn test_atm_call_with_zero_offsets() {
        let picked = select_option_contract(&chain(), "NIFTY", dec!(22410), OptionType::Ce, 0, 0)
            .unwrap();
        assert_eq!(picked.strike, dec!(22400));
        assert_eq!(picked.expiry, NaiveDate::from_ymd_opt(2024, 6, 6));
    }

    #[test]
    fn test_call_offset_moves_strike_up() {
        let picked = select_option_contract(&chain(), "NIFTY", dec!(22410), OptionType::Ce, 0, 2)
            .unwrap();
        assert_eq!(picked.strike, dec!(22500));
    }

    #[test]
    fn test_put_offset_moves_strike_down() {
        let picked = select_option_contract(&chain(), "NIFTY", dec!(22410), OptionType::Pe, 0, 2)
            .unwrap();
        assert_eq!(picked.strike, dec!(22300));
    }

    #[test]
    fn test_expiry_offset_picks_next_weekly() {
        let picked = select_option_contract(&chain(), "NIFTY", dec!(22410), OptionType::Ce, 1, 0)
            .unwrap();
        assert_eq!(picked.expiry, NaiveDate::from_ymd_opt(2024, 6, 13));
    }

    #[test]
    fn test_offset_past_chain_end_is_none() {
        let picked = select_option_contract(&chain(), "NIFTY", dec!(22410), OptionType::Ce, 0, 10);
        assert!(picked.is_none());
    }

    #[test]
    fn test_unknown_underlying_is_none() {
        let picked =
            select_option_contract(&chain(), "FINNIFTY", dec!(22410), OptionType::Ce, 0, 0);
        assert!(picked.is_none());
    }

    #[test]
    fn test_option_type_parses_case_insensitively() {
        assert_eq!("ce".parse::<OptionType>().unwrap(), OptionType::Ce);
        assert_eq!("PE".parse::<OptionType>().unwrap(), OptionType::Pe);
        assert!("XX".parse::<OptionType>().is_err());
    }
}
