//! Money as integer minor units (cents). Avoids float equality in the
//! grounding checks; the ±0.01 tolerance of the validator becomes ±1 cent.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Money {
    pub cents: i64,
}

impl Money {
    pub fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    /// Parse a decimal amount string like "29.99", "1,299.50" or "34".
    /// Thousands separators are stripped; at most two fraction digits.
    pub fn parse(s: &str) -> Option<Self> {
        let cleaned = s.replace(',', "");
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            return None;
        }
        let (whole, frac) = match cleaned.split_once('.') {
            Some((w, f)) => (w, f),
            None => (cleaned, ""),
        };
        if frac.len() > 2 {
            return None;
        }
        let whole: i64 = whole.parse().ok()?;
        let frac_cents: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().ok()? * 10,
            _ => frac.parse().ok()?,
        };
        Some(Self {
            cents: whole * 100 + frac_cents,
        })
    }

    /// True when the two amounts differ by at most one minor unit.
    pub fn approx_eq(&self, other: Money) -> bool {
        (self.cents - other.cents).abs() <= 1
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.cents / 100, (self.cents % 100).abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(Money::parse("29.99"), Some(Money::from_cents(2999)));
        assert_eq!(Money::parse("34"), Some(Money::from_cents(3400)));
        assert_eq!(Money::parse("1,299.50"), Some(Money::from_cents(129950)));
        assert_eq!(Money::parse("5.5"), Some(Money::from_cents(550)));
        assert_eq!(Money::parse(""), None);
        assert_eq!(Money::parse("1.999"), None);
    }

    #[test]
    fn approx_eq_is_one_cent() {
        assert!(Money::from_cents(2999).approx_eq(Money::from_cents(3000)));
        assert!(!Money::from_cents(2999).approx_eq(Money::from_cents(3001)));
    }

    #[test]
    fn displays_two_fraction_digits() {
        assert_eq!(Money::from_cents(2999).to_string(), "29.99");
        assert_eq!(Money::from_cents(500).to_string(), "5.00");
    }
}
