//! Capacity quantities
//!
//! Converts between byte counts and resource quantity strings such as
//! `10Mi` or `1G`.

use crate::error::{Error, Result};

const BINARY_UNITS: [(&str, u64); 6] = [
    ("Ei", 1 << 60),
    ("Pi", 1 << 50),
    ("Ti", 1 << 40),
    ("Gi", 1 << 30),
    ("Mi", 1 << 20),
    ("Ki", 1 << 10),
];

/// Parse a capacity string into bytes.
///
/// Accepts plain integers, decimal fractions, binary (`Ki`..`Ei`) and
/// decimal (`m`, `k`..`E`) suffixes and decimal exponents (`1e3`). Fractional
/// byte counts round up. Arithmetic is exact; values beyond `u64` are errors.
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }
    let invalid = |what: &str| Error::CapacityParse(format!("{}: {}", what, s));

    let unsigned = s.strip_prefix('+').unwrap_or(s);
    if unsigned.starts_with('-') {
        return Err(invalid("negative capacity"));
    }

    let num_end = unsigned
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(num_end);
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return Err(invalid("invalid number"));
    }

    let mut mantissa: u128 = 0;
    for digit in whole.bytes().chain(fraction.bytes()) {
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add(u128::from(digit - b'0')))
            .ok_or_else(|| invalid("capacity overflows"))?;
    }

    let (factor, exponent) = suffix_scale(suffix.trim()).ok_or_else(|| invalid("unknown unit"))?;
    let exponent = exponent - fraction.len() as i64;

    let scaled = mantissa
        .checked_mul(factor)
        .ok_or_else(|| invalid("capacity overflows"))?;
    if scaled == 0 {
        return Ok(0);
    }

    let power = u32::try_from(exponent.unsigned_abs())
        .ok()
        .and_then(|e| 10u128.checked_pow(e));
    let bytes = if exponent >= 0 {
        power
            .and_then(|p| scaled.checked_mul(p))
            .ok_or_else(|| invalid("capacity overflows"))?
    } else {
        match power {
            Some(divisor) => scaled / divisor + u128::from(scaled % divisor != 0),
            // Less than one byte
            None => 1,
        }
    };

    u64::try_from(bytes).map_err(|_| invalid("capacity overflows"))
}

/// Multiplier and power of ten of a quantity suffix
fn suffix_scale(suffix: &str) -> Option<(u128, i64)> {
    let scale = match suffix {
        "" => (1, 0),
        "Ki" => (1 << 10, 0),
        "Mi" => (1 << 20, 0),
        "Gi" => (1 << 30, 0),
        "Ti" => (1 << 40, 0),
        "Pi" => (1 << 50, 0),
        "Ei" => (1 << 60, 0),
        "n" => (1, -9),
        "u" => (1, -6),
        "m" => (1, -3),
        "k" => (1, 3),
        "M" => (1, 6),
        "G" => (1, 9),
        "T" => (1, 12),
        "P" => (1, 15),
        "E" => (1, 18),
        _ => {
            let digits = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            let unsigned = digits.strip_prefix(|c: char| c == '+' || c == '-').unwrap_or(digits);
            if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            (1, digits.parse().ok()?)
        }
    };
    Some(scale)
}

/// Render bytes with the largest binary unit that divides them exactly
pub fn format_capacity(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    BINARY_UNITS
        .iter()
        .find(|(_, size)| bytes % size == 0)
        .map(|(unit, size)| format!("{}{}", bytes / size, unit))
        .unwrap_or_else(|| bytes.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_capacity() {
        assert_eq!(parse_capacity("10Mi").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_capacity("1Gi").unwrap(), 1 << 30);
        assert_eq!(parse_capacity("1.5Gi").unwrap(), 3 << 29);
        assert_eq!(parse_capacity("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_capacity("512").unwrap(), 512);
        assert_eq!(parse_capacity(" 2Ki ").unwrap(), 2048);
    }

    #[test]
    fn test_parse_capacity_milli_and_exponents() {
        assert_eq!(parse_capacity("1500m").unwrap(), 2);
        assert_eq!(parse_capacity("100m").unwrap(), 1);
        assert_eq!(parse_capacity("2000m").unwrap(), 2);
        assert_eq!(parse_capacity("1e3").unwrap(), 1000);
        assert_eq!(parse_capacity("1E3").unwrap(), 1000);
        assert_eq!(parse_capacity("2.5e2").unwrap(), 250);
        assert_eq!(parse_capacity("1e+6").unwrap(), 1_000_000);
        assert_eq!(parse_capacity("1e-3").unwrap(), 1);
        assert_eq!(parse_capacity("0.5").unwrap(), 1);
        assert_eq!(parse_capacity(".5Ki").unwrap(), 512);
        assert_eq!(parse_capacity("0e99").unwrap(), 0);
    }

    #[test]
    fn test_parse_capacity_is_exact() {
        // Beyond f64's 53-bit mantissa
        assert_eq!(
            parse_capacity("9007199254740993").unwrap(),
            9_007_199_254_740_993
        );
        assert_eq!(parse_capacity("18446744073709551615").unwrap(), u64::MAX);
        assert_eq!(parse_capacity("15Ei").unwrap(), 15 << 60);
    }

    #[test]
    fn test_parse_capacity_errors() {
        assert_matches!(parse_capacity(""), Err(Error::CapacityParse(_)));
        assert_matches!(parse_capacity("Mi"), Err(Error::CapacityParse(_)));
        assert_matches!(parse_capacity("10XB"), Err(Error::CapacityParse(_)));
        assert_matches!(parse_capacity("-1Gi"), Err(Error::CapacityParse(_)));
        assert_matches!(parse_capacity("1.2.3"), Err(Error::CapacityParse(_)));
        assert_matches!(parse_capacity("1e"), Err(Error::CapacityParse(_)));
        assert_matches!(parse_capacity("e3"), Err(Error::CapacityParse(_)));
    }

    #[test]
    fn test_parse_capacity_overflow() {
        assert_matches!(parse_capacity("16Ei"), Err(Error::CapacityParse(_)));
        assert_matches!(
            parse_capacity("18446744073709551616"),
            Err(Error::CapacityParse(_))
        );
        assert_matches!(parse_capacity("1e40"), Err(Error::CapacityParse(_)));
        assert_matches!(
            parse_capacity("999999999999999999999999999999999999999999"),
            Err(Error::CapacityParse(_))
        );
    }

    #[test]
    fn test_format_capacity() {
        assert_eq!(format_capacity(10 * 1024 * 1024), "10Mi");
        assert_eq!(format_capacity(1536 * 1024 * 1024), "1536Mi");
        assert_eq!(format_capacity(1000), "1000");
        assert_eq!(format_capacity(0), "0");
        assert_eq!(parse_capacity(&format_capacity(3 << 40)).unwrap(), 3 << 40);
    }
}
