//! Fixed-point smallest-unit arithmetic.
//!
//! Every monetary value in the ledger is an [`Amount`]: an integer count of
//! an asset's smallest units (wei, satoshi) backed by `i128` and encoded as
//! a canonical decimal-digit string. No floating point anywhere; division
//! always truncates toward zero so rounding never favors the user.

use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upper bound on per-asset decimals. 10^30 fits comfortably in i128.
pub const MAX_DECIMALS: u32 = 30;

/// An integer count of smallest units.
///
/// Negative values are permitted internally (intermediate subtraction
/// results, signed PnL); every public store operation validates
/// non-negativity before committing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(i128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Wrap a raw smallest-unit count.
    pub fn from_units(units: i128) -> Self {
        Amount(units)
    }

    /// The raw smallest-unit count.
    pub fn units(&self) -> i128 {
        self.0
    }

    /// Parse a canonical decimal-digit string (optional leading sign).
    ///
    /// # Errors
    /// `InvalidAmount` if the string is not an integer or overflows i128.
    pub fn parse(s: &str) -> Result<Self> {
        i128::from_str(s.trim())
            .map(Amount)
            .map_err(|_| LedgerError::InvalidAmount(format!("not an integer amount: {:?}", s)))
    }

    /// Convert a human-readable decimal string into smallest units.
    ///
    /// Multiplies by 10^decimals, truncating any excess fractional digits
    /// toward zero.
    ///
    /// # Errors
    /// `InvalidDecimals` if decimals > 30, `InvalidAmount` if the input is
    /// not a finite decimal number or the result overflows.
    pub fn to_smallest_unit(human: &str, decimals: u32) -> Result<Self> {
        let scale = pow10(decimals)?;
        let trimmed = human.trim();

        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };

        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(LedgerError::InvalidAmount(format!(
                "empty amount: {:?}",
                human
            )));
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(LedgerError::InvalidAmount(format!(
                "not a finite decimal number: {:?}",
                human
            )));
        }

        let int_units = if int_part.is_empty() {
            0i128
        } else {
            i128::from_str(int_part)
                .map_err(|_| LedgerError::InvalidAmount(format!("amount overflow: {:?}", human)))?
        };

        // Keep at most `decimals` fractional digits (truncation toward zero),
        // right-pad the rest.
        let kept: String = frac_part.chars().take(decimals as usize).collect();
        let frac_units = if kept.is_empty() {
            0i128
        } else {
            let padding = pow10(decimals - kept.len() as u32)?;
            let raw = i128::from_str(&kept)
                .map_err(|_| LedgerError::InvalidAmount(format!("amount overflow: {:?}", human)))?;
            raw.checked_mul(padding)
                .ok_or_else(|| LedgerError::InvalidAmount(format!("amount overflow: {:?}", human)))?
        };

        let magnitude = int_units
            .checked_mul(scale)
            .and_then(|v| v.checked_add(frac_units))
            .ok_or_else(|| LedgerError::InvalidAmount(format!("amount overflow: {:?}", human)))?;

        Ok(Amount(if negative { -magnitude } else { magnitude }))
    }

    /// Render this amount as a human-readable decimal string.
    ///
    /// Exact division by 10^decimals; trailing fractional zeros are trimmed
    /// so the output is canonical ("1.5", not "1.500000").
    ///
    /// # Errors
    /// `InvalidDecimals` if decimals > 30.
    pub fn to_readable_unit(&self, decimals: u32) -> Result<String> {
        let scale = pow10(decimals)?;
        let whole = self.0 / scale;
        let frac = (self.0 % scale).unsigned_abs();

        if frac == 0 {
            return Ok(whole.to_string());
        }

        let sign = if self.0 < 0 { "-" } else { "" };
        let mut frac_str = format!("{:0width$}", frac, width = decimals as usize);
        while frac_str.ends_with('0') {
            frac_str.pop();
        }
        Ok(format!("{}{}.{}", sign, whole.unsigned_abs(), frac_str))
    }

    /// Checked addition.
    ///
    /// # Errors
    /// `InvalidAmount` on i128 overflow.
    pub fn checked_add(&self, rhs: Amount) -> Result<Amount> {
        self.0
            .checked_add(rhs.0)
            .map(Amount)
            .ok_or_else(|| LedgerError::InvalidAmount("addition overflow".to_string()))
    }

    /// Checked subtraction. Negative results are allowed.
    pub fn checked_sub(&self, rhs: Amount) -> Result<Amount> {
        self.0
            .checked_sub(rhs.0)
            .map(Amount)
            .ok_or_else(|| LedgerError::InvalidAmount("subtraction overflow".to_string()))
    }

    /// Checked multiplication.
    pub fn checked_mul(&self, rhs: Amount) -> Result<Amount> {
        self.0
            .checked_mul(rhs.0)
            .map(Amount)
            .ok_or_else(|| LedgerError::InvalidAmount("multiplication overflow".to_string()))
    }

    /// Checked division, truncating toward zero.
    ///
    /// # Errors
    /// `DivisionByZero` if rhs is zero.
    pub fn checked_div(&self, rhs: Amount) -> Result<Amount> {
        if rhs.0 == 0 {
            return Err(LedgerError::DivisionByZero);
        }
        self.0
            .checked_div(rhs.0)
            .map(Amount)
            .ok_or_else(|| LedgerError::InvalidAmount("division overflow".to_string()))
    }

    /// `self * numerator / denominator`, truncating toward zero.
    ///
    /// Decomposed as `q*num + r*num/den` (with `self = q*den + r`) so that
    /// proportional shares of large amounts do not overflow the i128
    /// intermediate where the plain product would.
    pub fn mul_div(&self, numerator: Amount, denominator: Amount) -> Result<Amount> {
        if denominator.0 == 0 {
            return Err(LedgerError::DivisionByZero);
        }
        let quotient = self.0 / denominator.0;
        let remainder = self.0 % denominator.0;

        let whole = quotient
            .checked_mul(numerator.0)
            .ok_or_else(|| LedgerError::InvalidAmount("ratio overflow".to_string()))?;
        let part = remainder
            .checked_mul(numerator.0)
            .ok_or_else(|| LedgerError::InvalidAmount("ratio overflow".to_string()))?
            / denominator.0;

        whole
            .checked_add(part)
            .map(Amount)
            .ok_or_else(|| LedgerError::InvalidAmount("ratio overflow".to_string()))
    }

    /// `pct` percent of this amount, truncating toward zero.
    pub fn percentage(&self, pct: Amount) -> Result<Amount> {
        self.mul_div(pct, Amount(100))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn is_greater_or_equal(&self, rhs: Amount) -> bool {
        self.0 >= rhs.0
    }

    pub fn min(self, rhs: Amount) -> Amount {
        Amount(self.0.min(rhs.0))
    }

    pub fn max(self, rhs: Amount) -> Amount {
        Amount(self.0.max(rhs.0))
    }

    pub fn abs(&self) -> Amount {
        Amount(self.0.abs())
    }
}

fn pow10(decimals: u32) -> Result<i128> {
    if decimals > MAX_DECIMALS {
        return Err(LedgerError::InvalidDecimals(decimals));
    }
    Ok(10i128.pow(decimals))
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Amount::parse(s)
    }
}

impl TryFrom<String> for Amount {
    type Error = LedgerError;

    fn try_from(s: String) -> Result<Self> {
        Amount::parse(&s)
    }
}

impl From<Amount> for String {
    fn from(a: Amount) -> String {
        a.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(s: &str) -> Amount {
        Amount::parse(s).unwrap()
    }

    #[test]
    fn test_parse_roundtrip() {
        for s in ["0", "1", "-1", "1000000", "170141183460469231731687303715884105727"] {
            let amount = Amount::parse(s).expect("parse failed");
            assert_eq!(amount.to_string(), s, "roundtrip failed for {}", s);
        }
    }

    #[test]
    fn test_parse_rejects_non_integers() {
        for s in ["", "1.5", "abc", "NaN", "Infinity", "1e6", "1 000"] {
            assert!(
                matches!(Amount::parse(s), Err(LedgerError::InvalidAmount(_))),
                "expected InvalidAmount for {:?}",
                s
            );
        }
    }

    #[test]
    fn test_to_smallest_unit_basic() {
        assert_eq!(Amount::to_smallest_unit("1", 6).unwrap(), a("1000000"));
        assert_eq!(Amount::to_smallest_unit("1.5", 6).unwrap(), a("1500000"));
        assert_eq!(Amount::to_smallest_unit("0.000001", 6).unwrap(), a("1"));
        assert_eq!(Amount::to_smallest_unit("0", 18).unwrap(), Amount::ZERO);
        assert_eq!(Amount::to_smallest_unit(".5", 2).unwrap(), a("50"));
        assert_eq!(Amount::to_smallest_unit("-2.25", 2).unwrap(), a("-225"));
    }

    #[test]
    fn test_to_smallest_unit_truncates_excess_digits() {
        // 7th fractional digit is dropped, never rounded up.
        assert_eq!(
            Amount::to_smallest_unit("1.9999999", 6).unwrap(),
            a("1999999")
        );
        assert_eq!(
            Amount::to_smallest_unit("-1.9999999", 6).unwrap(),
            a("-1999999")
        );
    }

    #[test]
    fn test_to_smallest_unit_rejects_bad_input() {
        for s in ["", ".", "1.2.3", "one", "0x10", "1e6"] {
            assert!(
                matches!(
                    Amount::to_smallest_unit(s, 6),
                    Err(LedgerError::InvalidAmount(_))
                ),
                "expected InvalidAmount for {:?}",
                s
            );
        }
    }

    #[test]
    fn test_decimals_out_of_range() {
        assert!(matches!(
            Amount::to_smallest_unit("1", 31),
            Err(LedgerError::InvalidDecimals(31))
        ));
        assert!(matches!(
            a("10").to_readable_unit(31),
            Err(LedgerError::InvalidDecimals(31))
        ));
    }

    #[test]
    fn test_readable_roundtrip_within_budget() {
        // Exact round-trip when the human amount has <= d fractional digits.
        let cases = [
            ("1", 0),
            ("1.5", 6),
            ("0.000001", 6),
            ("123456.789", 8),
            ("-42.000042", 6),
            ("0.123456789012345678", 18),
        ];
        for (human, decimals) in cases {
            let units = Amount::to_smallest_unit(human, decimals).unwrap();
            let back = units.to_readable_unit(decimals).unwrap();
            assert_eq!(back, human, "roundtrip failed for {} @ {}", human, decimals);
        }
    }

    #[test]
    fn test_readable_trims_trailing_zeros() {
        assert_eq!(a("1500000").to_readable_unit(6).unwrap(), "1.5");
        assert_eq!(a("1000000").to_readable_unit(6).unwrap(), "1");
        assert_eq!(a("-500000").to_readable_unit(6).unwrap(), "-0.5");
    }

    #[test]
    fn test_checked_arithmetic() {
        assert_eq!(a("2").checked_add(a("3")).unwrap(), a("5"));
        assert_eq!(a("2").checked_sub(a("3")).unwrap(), a("-1"));
        assert_eq!(a("7").checked_mul(a("6")).unwrap(), a("42"));
        assert_eq!(a("7").checked_div(a("2")).unwrap(), a("3"));
        // Truncation toward zero, both signs.
        assert_eq!(a("-7").checked_div(a("2")).unwrap(), a("-3"));
    }

    #[test]
    fn test_overflow_is_an_error() {
        let max = Amount::from_units(i128::MAX);
        assert!(matches!(
            max.checked_add(a("1")),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            max.checked_mul(a("2")),
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(matches!(
            a("1").checked_div(Amount::ZERO),
            Err(LedgerError::DivisionByZero)
        ));
        assert!(matches!(
            a("1").mul_div(a("1"), Amount::ZERO),
            Err(LedgerError::DivisionByZero)
        ));
    }

    #[test]
    fn test_mul_div_rounds_down() {
        // 100 * 1 / 3 = 33.33.. -> 33
        assert_eq!(a("100").mul_div(a("1"), a("3")).unwrap(), a("33"));
        // 10 * 2 / 3 = 6.66.. -> 6
        assert_eq!(a("10").mul_div(a("2"), a("3")).unwrap(), a("6"));
        // negative result truncates toward zero: -7.5 -> -7
        assert_eq!(a("-5").mul_div(a("3"), a("2")).unwrap(), a("-7"));
    }

    #[test]
    fn test_mul_div_large_values_no_overflow() {
        // ~10^37 * share where the naive product would overflow i128.
        let big = Amount::from_units(10i128.pow(37));
        let share = big.mul_div(a("1"), a("3")).unwrap();
        assert_eq!(share.units(), 10i128.pow(37) / 3);
    }

    #[test]
    fn test_percentage() {
        assert_eq!(a("1000").percentage(a("5")).unwrap(), a("50"));
        // Round-down: 1% of 150 units = 1 unit, never 2.
        assert_eq!(a("150").percentage(a("1")).unwrap(), a("1"));
        assert_eq!(a("99").percentage(a("1")).unwrap(), Amount::ZERO);
    }

    #[test]
    fn test_comparisons() {
        assert!(a("2").is_greater_or_equal(a("2")));
        assert!(a("3").is_greater_or_equal(a("2")));
        assert!(!a("1").is_greater_or_equal(a("2")));
        assert_eq!(a("1").min(a("2")), a("1"));
        assert_eq!(a("1").max(a("2")), a("2"));
        assert!(Amount::ZERO.is_zero());
        assert!(a("1").is_positive());
        assert!(a("-1").is_negative());
        assert_eq!(a("-4").abs(), a("4"));
    }

    #[test]
    fn test_serde_canonical_string() {
        let amount = a("1500000");
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"1500000\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }
}
