//! Stateful signal engines, one flavor per strategy.

pub mod options;
pub mod renko;
pub mod supertrend;

pub use options::{select_option_contract, underlying_quote_key, OptionLegState, OptionType};
pub use renko::{brick_size_from_atr, MacdBias, RenkoState};
pub use supertrend::{SupertrendState, TrendFlag};

use crate::broker::TransactionType;

/// The signal engine attached to one instrument record.
#[derive(Debug, Clone)]
pub enum SignalState {
    Renko(RenkoState),
    Supertrend(SupertrendState),
    OptionLeg(OptionLegState),
}

impl SignalState {
    /// Entry direction, if the engine currently qualifies one.
    pub fn entry_signal(&self) -> Option<TransactionType> {
        match self {
            SignalState::Renko(s) => s.entry_signal(),
            SignalState::Supertrend(s) => s.entry_signal(),
            SignalState::OptionLeg(s) => s.entry_signal(),
        }
    }
}
