// SPDX-License-Identifier: GPL-3.0

//! Shared leaf utilities for the Ember workspace: persistence specifications,
//! compatibility-date validation, worker fingerprints and HTTP range parsing.

pub use compat::{CompatError, validate_compatibility_date};
pub use fingerprint::worker_fingerprint;
pub use persist::{PersistError, PersistSpec, Persistence};
pub use range::{ByteRange, RangeError, parse_range};
use std::net::TcpListener;

/// Compatibility-date validation with numeric-aware collation.
pub mod compat;
/// Stable worker fingerprints used to name durable state on disk.
pub mod fingerprint;
/// Persistence specifications: memory, conventional root, path or URL.
pub mod persist;
/// HTTP `Range` header parsing against a known body length.
pub mod range;

/// Reserved key prefix for internal records; user keys must never start with it.
pub const RESERVED_KEY_PREFIX: &str = "__MF";

/// Checks if the preferred port is available, otherwise returns a random available port.
pub fn find_free_port(preferred_port: Option<u16>) -> u16 {
	if let Some(port) = preferred_port &&
		TcpListener::bind(format!("127.0.0.1:{}", port)).is_ok()
	{
		return port;
	}

	TcpListener::bind("127.0.0.1:0")
		.expect("Failed to bind to an available port")
		.local_addr()
		.expect("Failed to retrieve local address. This should never occur.")
		.port()
}

#[cfg(test)]
mod tests {
	use super::*;
	use anyhow::Result;

	#[test]
	fn find_free_port_works() -> Result<()> {
		let port = find_free_port(None);
		let listener = TcpListener::bind(format!("127.0.0.1:{}", port));
		assert!(listener.is_ok());
		Ok(())
	}

	#[test]
	fn find_free_port_skips_busy_preferred_port() -> Result<()> {
		let listener = TcpListener::bind("127.0.0.1:0")?;
		let busy_port = listener.local_addr()?.port();
		let port = find_free_port(Some(busy_port));
		assert_ne!(port, busy_port);
		Ok(())
	}
}
