// SPDX-License-Identifier: GPL-3.0

//! Compatibility-date validation.
//!
//! Compatibility dates are ISO `YYYY-MM-DD` scalars selecting runtime
//! behaviour. They are compared with numeric-aware collation so that
//! `2024-01-02` sorts before `2024-01-10`. Dates in the future are rejected;
//! dates beyond the runtime's supported maximum are downgraded to that
//! maximum with a warning.

use chrono::{Datelike, NaiveDate};
use thiserror::Error;

/// Errors raised while validating a compatibility date.
#[derive(Debug, Error)]
pub enum CompatError {
	/// The date was not a well-formed `YYYY-MM-DD` scalar.
	#[error("malformed compatibility date `{0}`, expected `YYYY-MM-DD`")]
	Malformed(String),
	/// The requested date is after today.
	#[error("compatibility date `{date}` is in the future (today is {today})")]
	FutureDate {
		/// The requested date.
		date: String,
		/// Today, as an ISO scalar.
		today: String,
	},
}

/// A parsed `(year, month, day)` triple; derives the numeric-aware ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DateKey(u16, u8, u8);

fn parse_date(date: &str) -> Result<DateKey, CompatError> {
	let malformed = || CompatError::Malformed(date.to_string());
	let bytes = date.as_bytes();
	if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
		return Err(malformed());
	}
	let year: u16 = date[0..4].parse().map_err(|_| malformed())?;
	let month: u8 = date[5..7].parse().map_err(|_| malformed())?;
	let day: u8 = date[8..10].parse().map_err(|_| malformed())?;
	if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
		return Err(malformed());
	}
	Ok(DateKey(year, month, day))
}

/// Validates `date` against `today` and the runtime's `supported` maximum.
///
/// Fails iff `date > today`. Warns and returns `supported` when the requested
/// date exceeds what the runtime implements; returns `date` unchanged
/// otherwise.
pub fn validate_compatibility_date(
	date: &str,
	supported: &str,
	today: NaiveDate,
) -> Result<String, CompatError> {
	let requested = parse_date(date)?;
	let maximum = parse_date(supported)?;
	let today_key = DateKey(today.year() as u16, today.month() as u8, today.day() as u8);

	if requested > today_key {
		return Err(CompatError::FutureDate {
			date: date.to_string(),
			today: today.format("%Y-%m-%d").to_string(),
		});
	}
	if requested > maximum {
		log::warn!(
			"compatibility date {date} is not supported by this runtime, falling back to {supported}"
		);
		return Ok(supported.to_string());
	}
	Ok(date.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn today() -> NaiveDate {
		NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
	}

	#[test]
	fn past_dates_pass_through() {
		let date = validate_compatibility_date("2024-01-02", "2024-06-01", today()).unwrap();
		assert_eq!(date, "2024-01-02");
	}

	#[test]
	fn future_dates_fail() {
		let result = validate_compatibility_date("2024-06-16", "2024-06-01", today());
		assert!(matches!(result, Err(CompatError::FutureDate { date, .. }) if date == "2024-06-16"));
	}

	#[test]
	fn unsupported_dates_downgrade() {
		let date = validate_compatibility_date("2024-06-10", "2024-06-01", today()).unwrap();
		assert_eq!(date, "2024-06-01");
	}

	#[test]
	fn collation_is_numeric_aware() {
		assert!(parse_date("2024-01-02").unwrap() < parse_date("2024-01-10").unwrap());
		assert!(parse_date("2023-12-31").unwrap() < parse_date("2024-01-01").unwrap());
	}

	#[test]
	fn malformed_dates_fail() {
		for bad in ["2024-1-02", "24-01-02", "2024/01/02", "2024-13-01", "garbage"] {
			assert!(matches!(
				validate_compatibility_date(bad, "2024-06-01", today()),
				Err(CompatError::Malformed(_))
			));
		}
	}
}
