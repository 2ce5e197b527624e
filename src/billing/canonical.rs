//! Billing intervals, money units and cadence arithmetic.

use chrono::{DateTime, Days, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Billing interval unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Day,
    Week,
    Month,
    Year,
}

impl Interval {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(format!("unknown billing interval '{}'", other)),
        }
    }
}

/// Normalize a recurring amount to an equivalent 30-day cost.
///
/// Calendar variance is ignored: a month is 365/12 days and a year 365 days.
/// Only meant for comparing plans on different cadences.
#[must_use]
pub fn canonical_amount(amount: f64, interval: Interval, interval_count: u32) -> f64 {
    let per_unit = amount / f64::from(interval_count.max(1));
    match interval {
        Interval::Day => per_unit * 30.0,
        Interval::Week => per_unit / 7.0 * 30.0,
        Interval::Month => per_unit * 12.0 / 365.0 * 30.0,
        Interval::Year => per_unit / 365.0 * 30.0,
    }
}

/// Advance a timestamp by `count` billing intervals using calendar arithmetic.
///
/// Month ends clamp (Jan 31 + 1 month = Feb 28/29).
#[must_use]
pub fn add_intervals(start: i64, interval: Interval, count: u32) -> i64 {
    let Some(start_dt) = DateTime::<Utc>::from_timestamp(start, 0) else {
        return start;
    };
    let end = match interval {
        Interval::Day => start_dt.checked_add_days(Days::new(u64::from(count))),
        Interval::Week => start_dt.checked_add_days(Days::new(7 * u64::from(count))),
        Interval::Month => start_dt.checked_add_months(Months::new(count)),
        Interval::Year => start_dt.checked_add_months(Months::new(12 * count)),
    };
    end.map(|dt| dt.timestamp()).unwrap_or(start)
}

const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv",
    "xaf", "xof", "xpf",
];

/// Whether Stripe amounts in this currency have no minor unit.
#[must_use]
pub fn is_zero_decimal(currency: &str) -> bool {
    let currency = currency.to_ascii_lowercase();
    ZERO_DECIMAL_CURRENCIES.contains(&currency.as_str())
}

/// Convert a major-unit amount (12.50) into Stripe minor units (1250).
#[must_use]
pub fn to_minor_units(amount: f64, currency: &str) -> i64 {
    let cents = if is_zero_decimal(currency) { amount } else { amount * 100.0 };
    cents.round() as i64
}

/// Convert Stripe minor units back into a major-unit amount.
#[must_use]
pub fn to_major_units(amount: i64, currency: &str) -> f64 {
    if is_zero_decimal(currency) {
        amount as f64
    } else {
        amount as f64 / 100.0
    }
}

/// Human-readable amount, e.g. `"12.50 USD"` or `"-3.00 EUR"`.
#[must_use]
pub fn format_amount(amount: i64, currency: &str) -> String {
    let code = currency.to_ascii_uppercase();
    if is_zero_decimal(currency) {
        format!("{} {}", amount, code)
    } else {
        format!("{:.2} {}", to_major_units(amount, currency), code)
    }
}

/// Round half away from zero to `places` decimals.
#[must_use]
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap().timestamp()
    }

    #[test]
    fn test_canonical_amounts() {
        // 3000 * 12 / 365 * 30
        assert_eq!(round_to(canonical_amount(3000.0, Interval::Month, 1), 2), 2958.9);
        assert_eq!(round_to(canonical_amount(100.0, Interval::Day, 1), 2), 3000.0);
        assert_eq!(round_to(canonical_amount(1200.0, Interval::Year, 1), 2), 98.63);
        assert_eq!(round_to(canonical_amount(700.0, Interval::Week, 1), 2), 3000.0);
    }

    #[test]
    fn test_canonical_amount_divides_by_count() {
        let quarterly = canonical_amount(3000.0, Interval::Month, 3);
        let monthly = canonical_amount(1000.0, Interval::Month, 1);
        assert!((quarterly - monthly).abs() < 1e-9);
    }

    #[test]
    fn test_add_intervals_uses_calendar() {
        assert_eq!(add_intervals(ts(2024, 1, 31), Interval::Month, 1), ts(2024, 2, 29));
        assert_eq!(add_intervals(ts(2024, 3, 1), Interval::Year, 1), ts(2025, 3, 1));
        assert_eq!(add_intervals(ts(2024, 3, 1), Interval::Week, 2), ts(2024, 3, 15));
        assert_eq!(add_intervals(ts(2024, 3, 1), Interval::Day, 10), ts(2024, 3, 11));
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(to_minor_units(12.5, "usd"), 1250);
        assert_eq!(to_minor_units(19.999, "eur"), 2000);
        assert_eq!(to_minor_units(1200.0, "JPY"), 1200);
        assert_eq!(to_major_units(1250, "usd"), 12.5);
        assert_eq!(to_major_units(500, "jpy"), 500.0);
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(1250, "usd"), "12.50 USD");
        assert_eq!(format_amount(-300, "eur"), "-3.00 EUR");
        assert_eq!(format_amount(500, "jpy"), "500 JPY");
    }

    #[test]
    fn test_interval_parse() {
        assert_eq!("Month".parse::<Interval>().unwrap(), Interval::Month);
        assert!("fortnight".parse::<Interval>().is_err());
        assert_eq!(serde_json::to_string(&Interval::Year).unwrap(), "\"year\"");
    }
}
