use crate::Error;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Largest number of decimals an [Amount] can be rendered with (`10^38` still fits in a `u128`).
pub const MAX_DECIMALS: u32 = 38;

/// A non-negative quantity of the payer asset, counted in its smallest unit.
///
/// Amounts serialize as base-unit strings so that values above `u64::MAX` survive JSON and
/// YAML round trips unchanged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn new(base_units: u128) -> Self {
        Self(base_units)
    }

    pub const fn get(self) -> u128 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Sum `amounts`, returning `None` on overflow.
    pub fn checked_sum<I>(amounts: I) -> Option<Amount>
    where
        I: IntoIterator<Item = Amount>,
    {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |total, amount| total.checked_add(amount))
    }

    /// Parse a decimal string such as `"12.5"` into base units using `decimals` fractional
    /// digits. Extra precision is rejected rather than rounded.
    pub fn parse_decimal(value: &str, decimals: u32) -> Result<Self, Error> {
        let scale = scale(decimals)?;
        let trimmed = value.trim();
        let (whole, fraction) = match trimmed.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (trimmed, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(Error::InvalidAmount(value.to_string()));
        }
        let is_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if !is_digits(whole) || !is_digits(fraction) {
            return Err(Error::InvalidAmount(value.to_string()));
        }
        let fraction = fraction.trim_end_matches('0');
        if fraction.len() as u32 > decimals {
            return Err(Error::TooPrecise {
                value: value.to_string(),
                decimals,
            });
        }

        let whole_units = if whole.is_empty() {
            0
        } else {
            whole.parse::<u128>().map_err(|_| Error::Overflow)?
        };
        let fraction_units = if fraction.is_empty() {
            0
        } else {
            // Right-pad to `decimals` digits: "5" with 3 decimals is 500 base units.
            let padding = 10u128.pow(decimals - fraction.len() as u32);
            fraction
                .parse::<u128>()
                .map_err(|_| Error::Overflow)?
                .checked_mul(padding)
                .ok_or(Error::Overflow)?
        };
        whole_units
            .checked_mul(scale)
            .and_then(|units| units.checked_add(fraction_units))
            .map(Amount)
            .ok_or(Error::Overflow)
    }

    /// Render as a decimal string with `decimals` fractional digits, trimming trailing zeros.
    pub fn to_decimal_string(self, decimals: u32) -> Result<String, Error> {
        let scale = scale(decimals)?;
        let whole = self.0 / scale;
        let fraction = self.0 % scale;
        if fraction == 0 {
            return Ok(whole.to_string());
        }
        let fraction = format!("{fraction:0width$}", width = decimals as usize);
        Ok(format!("{whole}.{}", fraction.trim_end_matches('0')))
    }
}

fn scale(decimals: u32) -> Result<u128, Error> {
    if decimals > MAX_DECIMALS {
        return Err(Error::UnsupportedDecimals(decimals));
    }
    Ok(10u128.pow(decimals))
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_decimal(s, 0)
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(value as u128)
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Destination (or source) account of a transfer.
///
/// Only emptiness is checked here; the transfer collaborator decides whether the string is a
/// valid account on its chain.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn new(value: impl AsRef<str>) -> Result<Self, Error> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            return Err(Error::EmptyAddress);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_decimal_amounts() {
        assert_eq!(Amount::parse_decimal("100", 2), Ok(Amount::new(10_000)));
        assert_eq!(Amount::parse_decimal("12.5", 2), Ok(Amount::new(1_250)));
        assert_eq!(Amount::parse_decimal(".05", 2), Ok(Amount::new(5)));
        assert_eq!(Amount::parse_decimal("7.", 2), Ok(Amount::new(700)));
        assert_eq!(Amount::parse_decimal(" 1.500 ", 2), Ok(Amount::new(150)));
        assert_eq!(
            Amount::parse_decimal("1", 18),
            Ok(Amount::new(1_000_000_000_000_000_000))
        );
    }

    #[test]
    fn rejects_malformed_amounts() {
        assert!(matches!(
            Amount::parse_decimal("", 2),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            Amount::parse_decimal(".", 2),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            Amount::parse_decimal("-1", 2),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            Amount::parse_decimal("1e3", 2),
            Err(Error::InvalidAmount(_))
        ));
        assert_eq!(
            Amount::parse_decimal("0.123", 2),
            Err(Error::TooPrecise {
                value: "0.123".to_string(),
                decimals: 2
            })
        );
        assert_eq!(
            Amount::parse_decimal("1", 39),
            Err(Error::UnsupportedDecimals(39))
        );
        assert_eq!(
            Amount::parse_decimal("340282366920938463463374607431768211456", 0),
            Err(Error::Overflow)
        );
    }

    #[test]
    fn renders_decimal_amounts() {
        assert_eq!(Amount::new(1_250).to_decimal_string(2).unwrap(), "12.5");
        assert_eq!(Amount::new(10_000).to_decimal_string(2).unwrap(), "100");
        assert_eq!(Amount::new(5).to_decimal_string(2).unwrap(), "0.05");
        assert_eq!(Amount::new(42).to_decimal_string(0).unwrap(), "42");
    }

    #[test]
    fn checked_sum_detects_overflow() {
        let amounts = [Amount::new(100), Amount::new(50), Amount::new(25)];
        assert_eq!(Amount::checked_sum(amounts), Some(Amount::new(175)));
        assert_eq!(
            Amount::checked_sum([Amount::new(u128::MAX), Amount::new(1)]),
            None
        );
        assert_eq!(Amount::checked_sum(std::iter::empty()), Some(Amount::ZERO));
    }

    #[test]
    fn amount_serializes_as_string() {
        let amount = Amount::new(u128::MAX);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, format!("\"{}\"", u128::MAX));
        let decoded: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, amount);
    }

    #[test]
    fn address_rejects_blank() {
        assert_eq!(Address::new("   "), Err(Error::EmptyAddress));
        assert_eq!(Address::new(" 0xAA ").unwrap().as_str(), "0xAA");
        assert!(serde_json::from_str::<Address>("\"\"").is_err());
    }

    proptest! {
        #[test]
        fn decimal_rendering_parses_back(units in any::<u64>(), decimals in 0u32..=18) {
            let amount = Amount::new(units as u128);
            let rendered = amount.to_decimal_string(decimals).unwrap();
            prop_assert_eq!(Amount::parse_decimal(&rendered, decimals).unwrap(), amount);
        }
    }
}
