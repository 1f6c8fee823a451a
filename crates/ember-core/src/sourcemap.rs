// SPDX-License-Identifier: GPL-3.0

//! The source-map registry.
//!
//! Stack traces emitted from the child runtime reference logical module
//! names; their source maps live on the host filesystem. Each registered
//! script has its trailing `sourceMappingURL` comment rewritten to a
//! loopback URL keyed by an opaque id, so the runtime never sees host
//! filesystem paths. Served maps get their `sourceRoot` rewritten to the
//! map's absolute directory and permissive CORS (added by the route layer).

use regex::Regex;
use sha2::{Digest, Sha256};
use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::{Mutex, OnceLock},
};

fn mapping_url_regex() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| {
		Regex::new(r"(?m)^//# sourceMappingURL=(?<url>\S+)[ \t]*$").expect("static regex parses")
	})
}

/// Registry of served source maps, keyed by opaque id.
#[derive(Default)]
pub struct SourceMapRegistry {
	inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
	maps: HashMap<String, PathBuf>,
	counter: u64,
}

impl SourceMapRegistry {
	/// Creates an empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	fn opaque_id(counter: u64, path: &Path) -> String {
		let mut hasher = Sha256::new();
		hasher.update(counter.to_le_bytes());
		hasher.update(path.to_string_lossy().as_bytes());
		hex::encode(&hasher.finalize()[..16])
	}

	/// Rewrites `script`'s trailing `sourceMappingURL` comment (if any) to
	/// `<base_url>/core/source-map/<id>` and registers the map's path.
	///
	/// Returns the id when a mapping URL was found and rewritten.
	pub fn register_script(
		&self,
		script: &mut String,
		script_dir: &Path,
		base_url: &str,
	) -> Option<String> {
		// Only the last mapping comment counts; bundlers occasionally leave
		// stale ones higher up.
		let (range, url) = {
			let captures: Vec<_> = mapping_url_regex().captures_iter(script.as_str()).collect();
			let capture = captures.last()?;
			(capture.get(0)?.range(), capture.name("url")?.as_str().to_string())
		};
		if url.starts_with("data:") || url.starts_with("http:") || url.starts_with("https:") {
			return None;
		}
		let map_path = script_dir.join(&url);

		let id = {
			let mut state = self.inner.lock().expect("registry lock poisoned");
			state.counter += 1;
			let id = Self::opaque_id(state.counter, &map_path);
			state.maps.insert(id.clone(), map_path);
			id
		};
		let replacement = format!("//# sourceMappingURL={base_url}/core/source-map/{id}");
		script.replace_range(range, &replacement);
		Some(id)
	}

	/// Loads and serves a registered map, rewriting `sourceRoot` to the
	/// map's absolute directory.
	pub fn serve(&self, id: &str) -> Option<serde_json::Value> {
		let path = {
			let state = self.inner.lock().expect("registry lock poisoned");
			state.maps.get(id)?.clone()
		};
		let contents = std::fs::read(&path).ok()?;
		let mut map: serde_json::Value = serde_json::from_slice(&contents).ok()?;
		let root = path.parent().unwrap_or(Path::new("/")).to_string_lossy().into_owned();
		if let Some(object) = map.as_object_mut() {
			object.insert("sourceRoot".to_string(), serde_json::Value::String(root));
		}
		Some(map)
	}
}
