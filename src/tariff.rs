//! Energy to money conversion
//!
//! Money is kept to 2 decimal places and energy to 3 at every display and
//! persistence boundary. Accumulators inside the engine stay unrounded.

use crate::error::{ChargeError, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Currency amount
pub type Money = Decimal;

pub const MONEY_DP: u32 = 2;
pub const ENERGY_DP: u32 = 3;

/// Round a currency amount half-up to 2 dp
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Round an energy amount half-up to 3 dp
pub fn round_energy(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(ENERGY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Fixed per-kWh tariff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tariff {
    rate_per_kwh: Money,
}

impl Tariff {
    pub fn new(rate_per_kwh: Money) -> Result<Self> {
        if rate_per_kwh <= Decimal::ZERO {
            return Err(ChargeError::validation(
                "billing.rate_per_kwh",
                "Must be positive",
            ));
        }
        Ok(Self { rate_per_kwh })
    }

    pub fn rate_per_kwh(&self) -> Money {
        self.rate_per_kwh
    }

    /// Unrounded cost of `energy_kwh`. Saturates instead of overflowing.
    pub fn cost(&self, energy_kwh: Decimal) -> Money {
        energy_kwh
            .checked_mul(self.rate_per_kwh)
            .unwrap_or(Decimal::MAX)
    }

    pub fn cost_rounded(&self, energy_kwh: Decimal) -> Money {
        round_money(self.cost(energy_kwh))
    }

    /// Energy that `money` buys at this rate
    pub fn energy_for(&self, money: Money) -> Decimal {
        money
            .checked_div(self.rate_per_kwh)
            .unwrap_or(Decimal::ZERO)
    }
}
