// SPDX-License-Identifier: GPL-3.0

//! HTTP `Range` header parsing against a known body length.
//!
//! Mirrors the platform's behaviour: a single satisfiable range is honoured,
//! multiple ranges in one request collapse to the full body, and anything
//! that is not a `bytes=` specifier at all is ignored.

use thiserror::Error;

/// Raised when a single requested range cannot be satisfied for the length.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("range not satisfiable for body of length {0}")]
pub struct RangeError(pub u64);

/// A resolved byte window into a body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
	/// First byte offset, inclusive.
	pub offset: u64,
	/// Number of bytes.
	pub length: u64,
}

impl ByteRange {
	/// The full body of `length` bytes.
	pub fn full(length: u64) -> Self {
		Self { offset: 0, length }
	}
}

/// Parses a `Range` header value against a body of `length` bytes.
///
/// * `bytes=a-b` with `0 <= a <= b < length` resolves to bytes `a..=b`.
/// * `bytes=a-` resolves to the tail from `a`.
/// * `bytes=-n` resolves to the last `n` bytes (the whole body when
///   `n > length`).
/// * Multiple ranges collapse to the full body.
/// * Values that are not `bytes=` specifiers resolve to the full body.
/// * A single syntactically valid but unsatisfiable range is an error.
pub fn parse_range(header: Option<&str>, length: u64) -> Result<ByteRange, RangeError> {
	let Some(header) = header else {
		return Ok(ByteRange::full(length));
	};
	let Some(spec) = header.trim().strip_prefix("bytes=") else {
		return Ok(ByteRange::full(length));
	};

	let parts: Vec<&str> = spec.split(',').collect();
	if parts.len() != 1 {
		// Multiple ranges mirror the real product: respond with the full body.
		return Ok(ByteRange::full(length));
	}
	parse_single(parts[0].trim(), length)
}

fn parse_single(spec: &str, length: u64) -> Result<ByteRange, RangeError> {
	let Some((start, end)) = spec.split_once('-') else {
		return Ok(ByteRange::full(length));
	};
	match (start.is_empty(), end.is_empty()) {
		// `-n`: suffix of n bytes.
		(true, false) => {
			let n: u64 = end.parse().map_err(|_| RangeError(length))?;
			if n == 0 {
				return Err(RangeError(length));
			}
			let n = n.min(length);
			Ok(ByteRange { offset: length - n, length: n })
		},
		// `a-`: tail from a.
		(false, true) => {
			let a: u64 = start.parse().map_err(|_| RangeError(length))?;
			if a >= length {
				return Err(RangeError(length));
			}
			Ok(ByteRange { offset: a, length: length - a })
		},
		// `a-b`: inclusive window.
		(false, false) => {
			let a: u64 = start.parse().map_err(|_| RangeError(length))?;
			let b: u64 = end.parse().map_err(|_| RangeError(length))?;
			if a > b || a >= length {
				return Err(RangeError(length));
			}
			let b = b.min(length.saturating_sub(1));
			Ok(ByteRange { offset: a, length: b - a + 1 })
		},
		// Bare `-`.
		(true, true) => Ok(ByteRange::full(length)),
	}
}
