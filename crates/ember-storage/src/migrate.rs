// SPDX-License-Identifier: GPL-3.0

//! In-place migration of legacy on-disk layouts.
//!
//! Earlier releases stored each namespace at `<root>/<namespace>/db.sqlite`.
//! The current layout names files by worker fingerprint under the unique
//! key's directory. Legacy files are copied to their fingerprinted path at
//! startup and the legacy copy unlinked; failures are logged and ignored so
//! a broken old directory never blocks startup.

use ember_common::worker_fingerprint;
use std::path::{Path, PathBuf};

/// The current on-disk path for a namespace's metadata database.
pub fn namespace_db_path(root: &Path, unique_key: &str, namespace: &str) -> PathBuf {
	let fingerprint = worker_fingerprint(unique_key, namespace);
	root.join(unique_key).join(format!("{fingerprint}.sqlite"))
}

/// Migrates any legacy `<root>/<namespace>/db.sqlite` files for the given
/// namespaces into the fingerprinted layout.
pub fn migrate_legacy_layout(root: &Path, unique_key: &str, namespaces: &[String]) {
	for namespace in namespaces {
		let legacy = root.join(namespace).join("db.sqlite");
		if !legacy.is_file() {
			continue;
		}
		let target = namespace_db_path(root, unique_key, namespace);
		if target.exists() {
			log::warn!(
				"both legacy and current databases exist for namespace `{namespace}`, leaving legacy copy at {}",
				legacy.display()
			);
			continue;
		}
		if let Err(error) = relocate(&legacy, &target) {
			log::warn!(
				"failed to migrate legacy database for namespace `{namespace}`: {error}"
			);
		} else {
			log::info!(
				"migrated legacy database for namespace `{namespace}` to {}",
				target.display()
			);
		}
	}
}

fn relocate(legacy: &Path, target: &Path) -> std::io::Result<()> {
	if let Some(parent) = target.parent() {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::copy(legacy, target)?;
	std::fs::remove_file(legacy)?;
	// A stale write-ahead log would not match the copied database.
	let wal = legacy.with_extension("sqlite-wal");
	if wal.exists() {
		let _ = std::fs::remove_file(wal);
	}
	Ok(())
}
