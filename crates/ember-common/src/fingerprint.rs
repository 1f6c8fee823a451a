// SPDX-License-Identifier: GPL-3.0

//! Stable worker fingerprints.
//!
//! Durable state on disk is named by a 32-hex fingerprint derived from the
//! namespace's unique key and the object's name. The derivation must match
//! the child runtime's own, byte for byte, or persisted SQLite files would be
//! orphaned across restarts.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

fn mac(key: &[u8], data: &[u8]) -> Vec<u8> {
	let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
	mac.update(data);
	mac.finalize().into_bytes().to_vec()
}

/// Derives the 32-hex fingerprint for `(unique_key, name)`.
///
/// `K = SHA-256(unique_key)`; the inner MAC is `HMAC-SHA256(K, name)`
/// truncated to its first 16 hex characters, the outer MAC is computed over
/// those ASCII characters and truncated the same way. The result is
/// `outer ∥ inner`.
pub fn worker_fingerprint(unique_key: &str, name: &str) -> String {
	let key = Sha256::digest(unique_key.as_bytes());
	let inner = hex::encode(mac(&key, name.as_bytes()))[..16].to_string();
	let outer = hex::encode(mac(&key, inner.as_bytes()))[..16].to_string();
	format!("{outer}{inner}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fingerprints_are_deterministic() {
		let a = worker_fingerprint("ember-kv-namespace", "NS");
		let b = worker_fingerprint("ember-kv-namespace", "NS");
		assert_eq!(a, b);
	}

	#[test]
	fn fingerprints_are_32_hex() {
		let fp = worker_fingerprint("ember-r2-bucket", "bucket");
		assert_eq!(fp.len(), 32);
		assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
	}

	#[test]
	fn fingerprints_vary_by_name_and_key() {
		let base = worker_fingerprint("unique", "a");
		assert_ne!(base, worker_fingerprint("unique", "b"));
		assert_ne!(base, worker_fingerprint("other", "a"));
	}

	#[test]
	fn tail_is_the_truncated_inner_mac() {
		let fp = worker_fingerprint("unique", "a");
		let key = Sha256::digest("unique".as_bytes());
		let inner = &hex::encode(mac(&key, b"a"))[..16];
		assert_eq!(&fp[16..], inner);
	}
}
