use std::collections::BTreeMap;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CurrencyError {
    #[error("no exchange rate configured for `{0}`")]
    UnknownCurrency(String),
    #[error("exchange rate for `{currency}` must be positive, got {rate}")]
    InvalidRate { currency: String, rate: Decimal },
}

/// Exchange rates quoted as units of each currency per one unit of `base`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateTable {
    pub base: String,
    #[serde(default)]
    pub rates: BTreeMap<String, Decimal>,
}

impl RateTable {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: normalize(&base.into()), rates: BTreeMap::new() }
    }

    pub fn with_rate(mut self, currency: &str, rate: Decimal) -> Self {
        self.rates.insert(normalize(currency), rate);
        self
    }

    pub fn validate(&self) -> Result<(), CurrencyError> {
        for (currency, rate) in &self.rates {
            if *rate <= Decimal::ZERO {
                return Err(CurrencyError::InvalidRate { currency: currency.clone(), rate: *rate });
            }
        }
        Ok(())
    }

    pub fn rate(&self, currency: &str) -> Result<Decimal, CurrencyError> {
        let currency = normalize(currency);
        if currency == self.base {
            return Ok(Decimal::ONE);
        }
        match self.rates.get(&currency) {
            Some(rate) if *rate > Decimal::ZERO => Ok(*rate),
            Some(rate) => Err(CurrencyError::InvalidRate { currency, rate: *rate }),
            None => Err(CurrencyError::UnknownCurrency(currency)),
        }
    }

    /// Convert through the base currency, rounded to cents.
    pub fn convert(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal, CurrencyError> {
        if normalize(from) == normalize(to) {
            return Ok(amount);
        }
        let base_amount = amount / self.rate(from)?;
        let converted = base_amount * self.rate(to)?;
        Ok(converted.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }
}

fn normalize(currency: &str) -> String {
    currency.trim().to_ascii_uppercase()
}
