// SPDX-License-Identifier: GPL-3.0

//! The write-once blob plane shared by the KV, R2 and cache simulators.
//!
//! Value bytes live apart from their metadata: on disk as randomly named
//! files under `<persist>/blobs/`, in memory as entries in a map. A blob is
//! written exactly once and never mutated in place; replacing a record swaps
//! its blob reference and the superseded blob is deleted by the caller.

use crate::errors::StoreError;
use bytes::Bytes;
use ember_common::ByteRange;
use std::{
	collections::HashMap,
	io::Write,
	path::{Path, PathBuf},
	sync::{
		Mutex,
		atomic::{AtomicU64, Ordering},
	},
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Blob identifiers are opaque single path components.
fn valid_id(id: &str) -> bool {
	!id.is_empty() && !id.contains(['/', '\\']) && id != "." && id != ".."
}

enum BlobPlane {
	Memory { counter: AtomicU64, blobs: Mutex<HashMap<String, Bytes>> },
	Disk { dir: PathBuf },
}

/// A write-once store of value bytes, addressed by opaque random ids.
pub struct BlobStore {
	inner: BlobPlane,
}

impl std::fmt::Debug for BlobStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match &self.inner {
			BlobPlane::Memory { .. } => f.debug_tuple("Memory").finish(),
			BlobPlane::Disk { dir } => f.debug_tuple("Disk").field(dir).finish(),
		}
	}
}

impl BlobStore {
	/// An in-process store; contents are lost on dispose.
	pub fn in_memory() -> Self {
		Self {
			inner: BlobPlane::Memory {
				counter: AtomicU64::new(0),
				blobs: Mutex::new(HashMap::new()),
			},
		}
	}

	/// A store rooted at `<root>/blobs`.
	pub fn on_disk(root: &Path) -> Self {
		Self { inner: BlobPlane::Disk { dir: root.join("blobs") } }
	}

	/// Writes `data` as a new blob and returns its id.
	pub async fn put(&self, data: Bytes) -> Result<String, StoreError> {
		match &self.inner {
			BlobPlane::Memory { counter, blobs } => {
				let id = format!("mem-{:016x}", counter.fetch_add(1, Ordering::Relaxed));
				blobs.lock().expect("blob map poisoned").insert(id.clone(), data);
				Ok(id)
			},
			BlobPlane::Disk { dir } => {
				tokio::fs::create_dir_all(dir).await?;
				let dir = dir.clone();
				let id = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
					let mut file = tempfile::Builder::new()
						.prefix("blob-")
						.rand_bytes(16)
						.tempfile_in(&dir)?;
					file.write_all(&data)?;
					file.flush()?;
					let (_, path) = file.keep().map_err(|e| e.error)?;
					Ok(path
						.file_name()
						.expect("kept temp file has a name")
						.to_string_lossy()
						.into_owned())
				})
				.await
				.map_err(std::io::Error::other)??;
				Ok(id)
			},
		}
	}

	/// Reads a whole blob; `None` when the id does not resolve.
	pub async fn get(&self, id: &str) -> Result<Option<Bytes>, StoreError> {
		if !valid_id(id) {
			return Ok(None);
		}
		match &self.inner {
			BlobPlane::Memory { blobs, .. } =>
				Ok(blobs.lock().expect("blob map poisoned").get(id).cloned()),
			BlobPlane::Disk { dir } => match tokio::fs::read(dir.join(id)).await {
				Ok(data) => Ok(Some(Bytes::from(data))),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
				Err(e) => Err(e.into()),
			},
		}
	}

	/// Reads a byte window of a blob without buffering the rest.
	pub async fn get_range(&self, id: &str, range: ByteRange) -> Result<Option<Bytes>, StoreError> {
		if !valid_id(id) {
			return Ok(None);
		}
		match &self.inner {
			BlobPlane::Memory { blobs, .. } => {
				let blobs = blobs.lock().expect("blob map poisoned");
				let Some(data) = blobs.get(id) else { return Ok(None) };
				let start = (range.offset as usize).min(data.len());
				let end = (range.offset + range.length).min(data.len() as u64) as usize;
				Ok(Some(data.slice(start..end)))
			},
			BlobPlane::Disk { dir } => {
				let mut file = match tokio::fs::File::open(dir.join(id)).await {
					Ok(file) => file,
					Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
					Err(e) => return Err(e.into()),
				};
				file.seek(std::io::SeekFrom::Start(range.offset)).await?;
				let mut buffer = vec![0u8; range.length as usize];
				let mut filled = 0;
				while filled < buffer.len() {
					let n = file.read(&mut buffer[filled..]).await?;
					if n == 0 {
						break;
					}
					filled += n;
				}
				buffer.truncate(filled);
				Ok(Some(Bytes::from(buffer)))
			},
		}
	}

	/// Deletes a blob; missing ids are ignored.
	pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
		if !valid_id(id) {
			return Ok(());
		}
		match &self.inner {
			BlobPlane::Memory { blobs, .. } => {
				blobs.lock().expect("blob map poisoned").remove(id);
				Ok(())
			},
			BlobPlane::Disk { dir } => match tokio::fs::remove_file(dir.join(id)).await {
				Ok(()) => Ok(()),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
				Err(e) => Err(e.into()),
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(flavor = "multi_thread")]
	async fn memory_roundtrip() {
		let store = BlobStore::in_memory();
		let id = store.put(Bytes::from_static(b"hello")).await.unwrap();
		assert_eq!(store.get(&id).await.unwrap(), Some(Bytes::from_static(b"hello")));
		store.delete(&id).await.unwrap();
		assert_eq!(store.get(&id).await.unwrap(), None);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn disk_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let store = BlobStore::on_disk(dir.path());
		let id = store.put(Bytes::from_static(b"abcdefghij")).await.unwrap();

		// Blobs land under the dedicated subdirectory with opaque names.
		assert!(dir.path().join("blobs").join(&id).exists());

		let range = store
			.get_range(&id, ByteRange { offset: 3, length: 4 })
			.await
			.unwrap()
			.unwrap();
		assert_eq!(&range[..], b"defg");

		store.delete(&id).await.unwrap();
		assert_eq!(store.get(&id).await.unwrap(), None);
		// Deleting again is fine.
		store.delete(&id).await.unwrap();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn ids_never_collide() {
		let store = BlobStore::in_memory();
		let a = store.put(Bytes::from_static(b"same")).await.unwrap();
		let b = store.put(Bytes::from_static(b"same")).await.unwrap();
		assert_ne!(a, b);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn traversal_ids_do_not_resolve() {
		let dir = tempfile::tempdir().unwrap();
		let store = BlobStore::on_disk(dir.path());
		assert_eq!(store.get("../escape").await.unwrap(), None);
		store.delete("../escape").await.unwrap();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn range_past_end_is_clamped() {
		let store = BlobStore::in_memory();
		let id = store.put(Bytes::from_static(b"short")).await.unwrap();
		let out = store
			.get_range(&id, ByteRange { offset: 3, length: 10 })
			.await
			.unwrap()
			.unwrap();
		assert_eq!(&out[..], b"rt");
	}
}
