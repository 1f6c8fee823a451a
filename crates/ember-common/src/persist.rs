// SPDX-License-Identifier: GPL-3.0

//! Persistence specifications for simulator state.
//!
//! Options accept `true` (use the conventional root for the product), `false`
//! or absent (keep state in memory), a filesystem path, or a URL with a
//! `memory:` or `file:` scheme. Any other scheme fails fast at configuration
//! time rather than surfacing as a confusing runtime error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Errors raised while resolving a persistence specification.
#[derive(Debug, Error)]
pub enum PersistError {
	/// The location was a URL with a scheme other than `memory:` or `file:`.
	#[error("unsupported persistence scheme `{0}:`, expected `memory:` or `file:`")]
	UnsupportedScheme(String),
	/// A `file:` URL did not contain a usable path.
	#[error("invalid `file:` persistence URL: {0}")]
	InvalidFileUrl(String),
}

/// How a simulator's state should be persisted, as written in options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PersistSpec {
	/// `true` selects the conventional on-disk root, `false` selects memory.
	Flag(bool),
	/// A filesystem path or a `memory:`/`file:` URL.
	Location(String),
}

impl Default for PersistSpec {
	fn default() -> Self {
		PersistSpec::Flag(false)
	}
}

/// A resolved persistence target.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Persistence {
	/// State lives in process memory and is lost on dispose.
	Memory,
	/// State lives under the given directory.
	Disk(PathBuf),
}

impl Persistence {
	/// The on-disk root, if any.
	pub fn path(&self) -> Option<&Path> {
		match self {
			Persistence::Memory => None,
			Persistence::Disk(path) => Some(path),
		}
	}
}

impl PersistSpec {
	/// Resolves the specification against the conventional `default_root` for `product`.
	///
	/// # Arguments
	/// * `default_root` - The instance-wide persistence root (e.g. `.ember`).
	/// * `product` - Subdirectory name used when the spec is `true`.
	pub fn resolve(&self, default_root: &Path, product: &str) -> Result<Persistence, PersistError> {
		match self {
			PersistSpec::Flag(false) => Ok(Persistence::Memory),
			PersistSpec::Flag(true) => Ok(Persistence::Disk(default_root.join(product))),
			PersistSpec::Location(location) => resolve_location(location),
		}
	}
}

fn resolve_location(location: &str) -> Result<Persistence, PersistError> {
	if let Ok(url) = Url::parse(location) {
		// Single-character schemes are Windows drive prefixes, not URLs.
		if url.scheme().len() > 1 {
			return match url.scheme() {
				"memory" => Ok(Persistence::Memory),
				"file" => {
					let path = url
						.to_file_path()
						.map_err(|_| PersistError::InvalidFileUrl(location.to_string()))?;
					Ok(Persistence::Disk(path))
				},
				other => Err(PersistError::UnsupportedScheme(other.to_string())),
			};
		}
	}
	Ok(Persistence::Disk(PathBuf::from(location)))
}
