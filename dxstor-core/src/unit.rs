//! Human-readable unit parsing
//!
//! Client settings carry funds as currency strings ("500 Gwei") and contract
//! durations as block-count strings ("30 d"). Parsing normalizes whitespace
//! and case; formatting picks the largest unit that divides the value with
//! no remainder, so `parse(format(parse(s)))` is always `parse(s)`.

use crate::error::{DxError, Result};

/// Available currency units, smallest to largest.
pub const CURRENCY_UNITS: [&str; 7] = [
    "wei",
    "kwei",
    "mwei",
    "gwei",
    "microether",
    "milliether",
    "ether",
];

/// Multiplier in wei for each currency unit.
fn currency_multiplier(unit: &str) -> Option<u128> {
    match unit {
        "wei" => Some(1),
        "kwei" => Some(1_000),
        "mwei" => Some(1_000_000),
        "gwei" => Some(1_000_000_000),
        "microether" => Some(1_000_000_000_000),
        "milliether" => Some(1_000_000_000_000_000),
        "ether" => Some(1_000_000_000_000_000_000),
        _ => None,
    }
}

/// Blocks produced per hour (15 second block time).
pub const BLOCKS_PER_HOUR: u64 = 240;
/// Blocks produced per day.
pub const BLOCKS_PER_DAY: u64 = 24 * BLOCKS_PER_HOUR;
/// Blocks produced per week.
pub const BLOCKS_PER_WEEK: u64 = 7 * BLOCKS_PER_DAY;
/// Blocks produced per 30-day month.
pub const BLOCKS_PER_MONTH: u64 = 30 * BLOCKS_PER_DAY;
/// Blocks produced per 365-day year.
pub const BLOCKS_PER_YEAR: u64 = 365 * BLOCKS_PER_DAY;

/// True if the string is entirely ASCII digits and non-empty.
pub fn contains_digit_only(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

fn amount_with_unit(normalized: &str, unit: &str) -> Result<u128> {
    let digits = &normalized[..normalized.len() - unit.len()];
    if !contains_digit_only(digits) {
        return Err(DxError::Validation(format!(
            "invalid currency amount: {:?}",
            digits
        )));
    }
    let amount: u128 = digits
        .parse()
        .map_err(|_| DxError::Validation(format!("currency amount out of range: {}", digits)))?;
    let multiplier = currency_multiplier(unit)
        .ok_or_else(|| DxError::Validation(format!("unknown currency unit: {}", unit)))?;
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| DxError::Validation(format!("currency overflow: {}", normalized)))
}

/// Parse a currency string into wei.
pub fn parse_currency(s: &str) -> Result<u128> {
    let normalized = normalize(s);

    // Check the compound units first: "kwei" also ends in "wei" and
    // "milliether" also ends in "ether".
    for unit in CURRENCY_UNITS.iter().rev() {
        if *unit == "wei" || *unit == "ether" {
            continue;
        }
        if normalized.ends_with(unit) {
            return amount_with_unit(&normalized, unit);
        }
    }
    if normalized.ends_with("ether") {
        return amount_with_unit(&normalized, "ether");
    }
    if normalized.ends_with("wei") {
        return amount_with_unit(&normalized, "wei");
    }

    Err(DxError::Validation(format!(
        "invalid currency unit in {:?}; valid units: {:?}",
        s, CURRENCY_UNITS
    )))
}

/// Format a wei amount using the largest unit that divides it exactly.
pub fn format_currency(wei: u128) -> String {
    if wei == 0 {
        return "0 wei".to_string();
    }
    let display = [
        ("ether", 1_000_000_000_000_000_000u128),
        ("milliether", 1_000_000_000_000_000),
        ("microether", 1_000_000_000_000),
        ("Gwei", 1_000_000_000),
        ("Mwei", 1_000_000),
        ("Kwei", 1_000),
    ];
    for (name, multiplier) in display {
        if wei % multiplier == 0 {
            return format!("{} {}", wei / multiplier, name);
        }
    }
    format!("{} wei", wei)
}

/// Parse a duration string into a block count. Recognized unit suffixes:
/// `b` (blocks), `h` (hours), `d` (days), `W` (weeks), `M` (months),
/// `y` (years). Units are case sensitive.
pub fn parse_period(s: &str) -> Result<u64> {
    let stripped: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if stripped.len() < 2 {
        return Err(DxError::Validation(format!("invalid period: {:?}", s)));
    }
    let (digits, unit) = stripped.split_at(stripped.len() - 1);
    if !contains_digit_only(digits) {
        return Err(DxError::Validation(format!(
            "invalid period amount: {:?}",
            digits
        )));
    }
    let amount: u64 = digits
        .parse()
        .map_err(|_| DxError::Validation(format!("period amount out of range: {}", digits)))?;
    let blocks_per_unit = match unit {
        "b" => 1,
        "h" => BLOCKS_PER_HOUR,
        "d" => BLOCKS_PER_DAY,
        "W" => BLOCKS_PER_WEEK,
        "M" => BLOCKS_PER_MONTH,
        "y" => BLOCKS_PER_YEAR,
        other => {
            return Err(DxError::Validation(format!(
                "unknown period unit: {:?}",
                other
            )))
        }
    };
    amount
        .checked_mul(blocks_per_unit)
        .ok_or_else(|| DxError::Validation(format!("period overflow: {}", s)))
}

/// Parse a storage host count, a plain digit string.
pub fn parse_storage_hosts(s: &str) -> Result<u64> {
    let stripped: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if !contains_digit_only(&stripped) {
        return Err(DxError::Validation(format!(
            "invalid storage host count: {:?}",
            s
        )));
    }
    stripped
        .parse()
        .map_err(|_| DxError::Validation(format!("storage host count out of range: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_digit_only() {
        assert!(contains_digit_only("1231232131232131231231321313"));
        assert!(!contains_digit_only("fjsdlkfjalkfjlkahdfklhf"));
        assert!(!contains_digit_only("21rfewf2rewf4r4"));
        assert!(!contains_digit_only(""));
    }

    #[test]
    fn test_parse_currency() {
        assert_eq!(parse_currency("100 wei").unwrap(), 100);
        assert_eq!(parse_currency("100 Gwei").unwrap(), 100_000_000_000);
        assert_eq!(parse_currency("100  Kwei").unwrap(), 100_000);
        assert_eq!(parse_currency("2 ether").unwrap(), 2_000_000_000_000_000_000);
        assert_eq!(
            parse_currency("5milliether").unwrap(),
            5_000_000_000_000_000
        );
    }

    #[test]
    fn test_parse_currency_fail() {
        for bad in ["100dxc", "100", "a1200gwei", "12.5 ether", ""] {
            assert!(parse_currency(bad).is_err(), "{:?} should fail", bad);
        }
    }

    #[test]
    fn test_format_currency() {
        assert_eq!(format_currency(0), "0 wei");
        assert_eq!(format_currency(999), "999 wei");
        assert_eq!(format_currency(5_000), "5 Kwei");
        assert_eq!(format_currency(7_000_000_000), "7 Gwei");
        assert_eq!(format_currency(1_000_000_000_000_000_000), "1 ether");
    }

    #[test]
    fn test_currency_roundtrip_idempotent() {
        for input in [
            "123 wei",
            "5 Kwei",
            "42 Mwei",
            "7 Gwei",
            "9 microether",
            "3 milliether",
            "2 ether",
        ] {
            let parsed = parse_currency(input).unwrap();
            let formatted = format_currency(parsed);
            assert_eq!(parse_currency(&formatted).unwrap(), parsed, "{}", input);
        }
    }

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("100 d").unwrap(), 100 * BLOCKS_PER_DAY);
        assert_eq!(parse_period("182 h").unwrap(), 182 * BLOCKS_PER_HOUR);
        assert_eq!(parse_period("179 W").unwrap(), 179 * BLOCKS_PER_WEEK);
        assert_eq!(parse_period("3000 M").unwrap(), 3000 * BLOCKS_PER_MONTH);
        assert_eq!(parse_period("10 y").unwrap(), 10 * BLOCKS_PER_YEAR);
        assert_eq!(parse_period("10000 b").unwrap(), 10000);
    }

    #[test]
    fn test_parse_period_fail() {
        for bad in ["10000 J", "100u0 d", "d", "", "10 H"] {
            assert!(parse_period(bad).is_err(), "{:?} should fail", bad);
        }
    }

    #[test]
    fn test_parse_storage_hosts() {
        assert_eq!(parse_storage_hosts("1231231").unwrap(), 1231231);
        assert_eq!(parse_storage_hosts("023123131").unwrap(), 23123131);
        assert!(parse_storage_hosts("12x3").is_err());
    }
}
