//! Currency amounts
//!
//! Amounts use the `CUR:units.fraction` text form, with fractions in
//! units of 1e-8. The server never computes prices; it only compares
//! the configured fee against pending orders and forwards the value to
//! the merchant backend, so no arithmetic beyond equality is offered.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Fractional units per whole currency unit.
pub const FRACTION_BASE: u32 = 100_000_000;

/// A currency amount, e.g. `EUR:4.5`
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Amount {
    /// ISO-ish currency code, upper case, 1..=11 chars
    pub currency: String,
    /// Whole units
    pub units: u64,
    /// Fraction in 1e-8 units, always < FRACTION_BASE
    pub fraction: u32,
}

impl Amount {
    pub fn new(currency: &str, units: u64, fraction: u32) -> Self {
        Self {
            currency: currency.to_string(),
            units,
            fraction,
        }
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (currency, value) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidAmount(format!("missing ':' in '{s}'")))?;
        if currency.is_empty()
            || currency.len() > 11
            || !currency.chars().all(|c| c.is_ascii_alphabetic())
        {
            return Err(Error::InvalidAmount(format!("bad currency in '{s}'")));
        }
        let (units_s, frac_s) = match value.split_once('.') {
            Some((u, f)) => (u, Some(f)),
            None => (value, None),
        };
        let units: u64 = units_s
            .parse()
            .map_err(|_| Error::InvalidAmount(format!("bad units in '{s}'")))?;
        let fraction = match frac_s {
            None => 0,
            Some(f) if f.is_empty() || f.len() > 8 => {
                return Err(Error::InvalidAmount(format!("bad fraction in '{s}'")));
            }
            Some(f) => {
                let digits: u32 = f
                    .parse()
                    .map_err(|_| Error::InvalidAmount(format!("bad fraction in '{s}'")))?;
                digits * 10u32.pow(8 - f.len() as u32)
            }
        };
        Ok(Self {
            currency: currency.to_ascii_uppercase(),
            units,
            fraction,
        })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fraction == 0 {
            return write!(f, "{}:{}", self.currency, self.units);
        }
        let frac = format!("{:08}", self.fraction);
        write!(
            f,
            "{}:{}.{}",
            self.currency,
            self.units,
            frac.trim_end_matches('0')
        )
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
