//! Currency amounts.
//!
//! Amounts are counts of atomic currency units ("raw"). One whole coin is
//! 10^29 raw, so amounts are held in a u128. The API/JSON representation is
//! the plain decimal string.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// A non-negative amount of atomic currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Amount(u128);

impl Amount {
    /// One whole coin, in raw.
    pub const UNIT: Self = Self(100_000_000_000_000_000_000_000_000_000);

    /// One hundredth of a coin ("centiraw"), the points exchange unit.
    pub const CENTI: Self = Self(1_000_000_000_000_000_000_000_000_000);

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u128 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    pub const fn saturating_mul(self, factor: u128) -> Self {
        Self(self.0.saturating_mul(factor))
    }

    /// Integer division; the caller keeps the remainder.
    pub const fn div_floor(self, divisor: u128) -> Self {
        if divisor == 0 {
            return Self(0);
        }
        Self(self.0 / divisor)
    }

    /// Parse the API string representation.
    pub fn from_api_string(s: &str) -> Result<Self, Error> {
        s.parse::<u128>()
            .map(Self)
            .map_err(|_| Error::InvalidAmount(s.to_string()))
    }

    pub fn serialize_for_api(self) -> String {
        self.0.to_string()
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, other: Self) {
        self.0 = self.0.saturating_add(other.0);
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), Add::add)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_api_string(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_decimal_string() {
        let amount = Amount::from_raw(123);
        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"123\"");

        let back: Amount = serde_json::from_str("\"123\"").unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn division_keeps_remainder_with_caller() {
        let amount = Amount::from_raw(100);
        let share = amount.div_floor(3);
        assert_eq!(share.raw(), 33);
        assert_eq!(amount.raw() - share.raw() * 3, 1);
    }

    #[test]
    fn centi_is_a_hundredth_of_unit() {
        assert_eq!(Amount::UNIT.raw(), Amount::CENTI.raw() * 100);
    }

    #[test]
    fn rejects_garbage_api_strings() {
        assert!(Amount::from_api_string("not-a-number").is_err());
        assert!(Amount::from_api_string("-5").is_err());
    }
}
