// SPDX-License-Identifier: GPL-3.0

//! The static-site simulator.
//!
//! Assets are files under a site root, filtered by include/exclude globs.
//! A manifest of asset path to content hash is produced at start; values are
//! served directly from disk, never copied into the blob plane.

use crate::errors::SitesError;
use bytes::Bytes;
use glob::Pattern;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// The sites simulator for one site root.
#[derive(Clone, Debug)]
pub struct SitesGateway {
	root: PathBuf,
	include: Vec<Pattern>,
	exclude: Vec<Pattern>,
}

impl SitesGateway {
	/// Creates a gateway for `root` with optional include/exclude globs.
	pub fn new(
		root: PathBuf,
		include: &[String],
		exclude: &[String],
	) -> Result<Self, SitesError> {
		let include = include.iter().map(|p| Pattern::new(p)).collect::<Result<_, _>>()?;
		let exclude = exclude.iter().map(|p| Pattern::new(p)).collect::<Result<_, _>>()?;
		Ok(Self { root, include, exclude })
	}

	fn participates(&self, rel: &str) -> bool {
		if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(rel)) {
			return false;
		}
		!self.exclude.iter().any(|p| p.matches(rel))
	}

	/// Builds the manifest: forward-slash asset path to content hash.
	pub fn manifest(&self) -> Result<IndexMap<String, String>, SitesError> {
		let mut manifest = IndexMap::new();
		for entry in WalkDir::new(&self.root).sort_by_file_name() {
			let entry = entry.map_err(std::io::Error::other)?;
			if !entry.file_type().is_file() {
				continue;
			}
			let rel = entry
				.path()
				.strip_prefix(&self.root)
				.expect("walked path is under the root")
				.components()
				.map(|component| component.as_os_str().to_string_lossy())
				.collect::<Vec<_>>()
				.join("/");
			if !self.participates(&rel) {
				continue;
			}
			let contents = std::fs::read(entry.path())?;
			let hash = hex::encode(&Sha256::digest(&contents)[..16]);
			manifest.insert(rel, hash);
		}
		Ok(manifest)
	}

	/// Reads one asset; the path is relative to the site root.
	pub async fn get(&self, path: &str) -> Result<Bytes, SitesError> {
		let rel = path.trim_start_matches('/');
		if rel.is_empty() ||
			Path::new(rel)
				.components()
				.any(|component| matches!(component, std::path::Component::ParentDir))
		{
			return Err(SitesError::Traversal(path.to_string()));
		}
		if !self.participates(rel) {
			return Err(SitesError::NotFound(rel.to_string()));
		}
		match tokio::fs::read(self.root.join(rel)).await {
			Ok(contents) => Ok(Bytes::from(contents)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound =>
				Err(SitesError::NotFound(rel.to_string())),
			Err(e) => Err(e.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fixture() -> tempfile::TempDir {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("assets")).unwrap();
		std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
		std::fs::write(dir.path().join("assets/app.js"), "console.log(1)").unwrap();
		std::fs::write(dir.path().join("notes.txt"), "scratch").unwrap();
		dir
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn manifest_lists_files_with_hashes() {
		let dir = fixture();
		let gateway = SitesGateway::new(dir.path().to_path_buf(), &[], &[]).unwrap();
		let manifest = gateway.manifest().unwrap();

		let paths: Vec<&str> = manifest.keys().map(String::as_str).collect();
		assert_eq!(paths, vec!["assets/app.js", "index.html", "notes.txt"]);
		for hash in manifest.values() {
			assert_eq!(hash.len(), 32);
		}

		// The hash is content-derived.
		let again = gateway.manifest().unwrap();
		assert_eq!(manifest, again);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn include_and_exclude_filter_assets() {
		let dir = fixture();
		let gateway = SitesGateway::new(
			dir.path().to_path_buf(),
			&["**/*.html".into(), "**/*.js".into()],
			&["assets/**".into()],
		)
		.unwrap();
		let manifest = gateway.manifest().unwrap();
		let paths: Vec<&str> = manifest.keys().map(String::as_str).collect();
		assert_eq!(paths, vec!["index.html"]);

		assert!(matches!(gateway.get("notes.txt").await, Err(SitesError::NotFound(_))));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn assets_serve_from_disk() {
		let dir = fixture();
		let gateway = SitesGateway::new(dir.path().to_path_buf(), &[], &[]).unwrap();
		let body = gateway.get("assets/app.js").await.unwrap();
		assert_eq!(&body[..], b"console.log(1)");

		// Edits are visible immediately: nothing is copied at start.
		std::fs::write(dir.path().join("assets/app.js"), "console.log(2)").unwrap();
		let body = gateway.get("assets/app.js").await.unwrap();
		assert_eq!(&body[..], b"console.log(2)");
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn traversal_is_rejected() {
		let dir = fixture();
		let gateway = SitesGateway::new(dir.path().to_path_buf(), &[], &[]).unwrap();
		assert!(matches!(
			gateway.get("../outside").await,
			Err(SitesError::Traversal(_))
		));
	}

	#[test]
	fn bad_patterns_fail_fast() {
		let result = SitesGateway::new(PathBuf::from("/tmp"), &["[".into()], &[]);
		assert!(matches!(result, Err(SitesError::Pattern(_))));
	}
}
