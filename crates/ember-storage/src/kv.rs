// SPDX-License-Identifier: GPL-3.0

//! The key-value simulator.
//!
//! Values live in the blob plane, everything else (expiration, user
//! metadata) in the namespace's metadata database. Reads and lists filter
//! expired records; reclamation happens lazily on list.

use crate::{
	Clock,
	blob::BlobStore,
	errors::KvError,
	meta::{ListQuery, MetaStore},
	models::NewEntryRow,
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use ember_common::RESERVED_KEY_PREFIX;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Maximum value size: 25 MiB.
pub const MAX_VALUE_SIZE: u64 = 25 * 1024 * 1024;
/// Maximum serialised metadata size: 1 KiB.
pub const MAX_METADATA_SIZE: u64 = 1024;
/// Maximum key length in UTF-8 bytes.
pub const MAX_KEY_SIZE: usize = 512;
/// Minimum TTL and minimum distance of an absolute expiration, in seconds.
pub const MIN_TTL_SECS: i64 = 60;
/// Maximum (and default) page size for list.
pub const MAX_LIST_LIMIT: i64 = 1000;

/// Options accepted by [`KvGateway::put`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct KvPutOptions {
	/// Relative expiration in seconds from now.
	pub expiration_ttl: Option<i64>,
	/// Absolute expiration as a unix timestamp in seconds.
	pub expiration: Option<i64>,
	/// Arbitrary JSON metadata stored next to the value.
	pub metadata: Option<serde_json::Value>,
}

/// A value returned from [`KvGateway::get`].
#[derive(Clone, Debug)]
pub struct KvEntry {
	/// The stored bytes.
	pub value: Bytes,
	/// User metadata as stored.
	pub metadata: Option<serde_json::Value>,
	/// Absolute expiration in unix seconds, when set.
	pub expiration: Option<i64>,
}

/// Options accepted by [`KvGateway::list`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct KvListOptions {
	/// Only keys starting with this prefix.
	pub prefix: Option<String>,
	/// Page size, 1..=1000; defaults to 1000.
	pub limit: Option<i64>,
	/// Opaque cursor from a previous page.
	pub cursor: Option<String>,
}

/// One key in a list page.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KvKeyInfo {
	/// The key name.
	pub name: String,
	/// Absolute expiration in unix seconds, when set.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub expiration: Option<i64>,
	/// User metadata as stored.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metadata: Option<serde_json::Value>,
}

/// A page of keys.
#[derive(Clone, Debug, Serialize)]
pub struct KvListResult {
	/// Keys in lexicographic order.
	pub keys: Vec<KvKeyInfo>,
	/// Whether this is the final page.
	pub list_complete: bool,
	/// Cursor for the next page; empty when complete.
	pub cursor: String,
}

/// The KV simulator for one namespace.
#[derive(Clone)]
pub struct KvGateway {
	blob: Arc<BlobStore>,
	meta: MetaStore,
	clock: Clock,
}

impl KvGateway {
	/// Creates a gateway over the given planes.
	pub fn new(blob: Arc<BlobStore>, meta: MetaStore, clock: Clock) -> Self {
		Self { blob, meta, clock }
	}

	fn validate_key(key: &str) -> Result<(), KvError> {
		if key.is_empty() || key == "." || key == ".." {
			return Err(KvError::InvalidKey(format!("`{key}` is reserved")));
		}
		if key.len() > MAX_KEY_SIZE {
			return Err(KvError::InvalidKey(format!(
				"length of {} exceeds limit of {MAX_KEY_SIZE}",
				key.len()
			)));
		}
		if key.starts_with(RESERVED_KEY_PREFIX) {
			return Err(KvError::InvalidKey(format!(
				"`{RESERVED_KEY_PREFIX}` prefixed keys are reserved"
			)));
		}
		Ok(())
	}

	/// Computes the stored expiration in millis from put options.
	fn expiration_millis(&self, options: &KvPutOptions, now: i64) -> Result<Option<i64>, KvError> {
		if let Some(ttl) = options.expiration_ttl {
			if ttl < MIN_TTL_SECS {
				return Err(KvError::InvalidTtl(ttl, MIN_TTL_SECS));
			}
			return Ok(Some(now + ttl * 1000));
		}
		if let Some(expiration) = options.expiration {
			let expiration_ms = expiration * 1000;
			if expiration_ms <= now + MIN_TTL_SECS * 1000 {
				return Err(KvError::InvalidExpiration(expiration, MIN_TTL_SECS));
			}
			return Ok(Some(expiration_ms));
		}
		Ok(None)
	}

	/// Stores `value` under `key`.
	pub async fn put(
		&self,
		key: &str,
		value: Bytes,
		options: KvPutOptions,
	) -> Result<(), KvError> {
		Self::validate_key(key)?;
		if value.len() as u64 > MAX_VALUE_SIZE {
			return Err(KvError::ValueTooLarge(value.len() as u64, MAX_VALUE_SIZE));
		}
		let metadata = match &options.metadata {
			Some(metadata) => {
				let serialised =
					serde_json::to_string(metadata).expect("JSON values serialise");
				if serialised.len() as u64 > MAX_METADATA_SIZE {
					return Err(KvError::MetadataTooLarge(
						serialised.len() as u64,
						MAX_METADATA_SIZE,
					));
				}
				Some(serialised)
			},
			None => None,
		};
		let now = (self.clock)();
		let expiration = self.expiration_millis(&options, now)?;

		let size = value.len() as i64;
		let blob_id = self.blob.put(value).await?;
		let previous = self
			.meta
			.put(NewEntryRow {
				key,
				blob_id: &blob_id,
				size,
				uploaded: now,
				expiration,
				metadata: metadata.as_deref(),
				hashes: None,
				version: None,
			})
			.await?;
		if let Some(previous) = previous {
			self.blob.delete(&previous.blob_id).await?;
		}
		Ok(())
	}

	/// Fetches the value for `key`; `None` for missing or expired keys.
	///
	/// `cache_ttl` is validated (minimum 60 seconds) but is only a semantic
	/// hint locally: there is no edge cache between the caller and the store.
	pub async fn get(&self, key: &str, cache_ttl: Option<i64>) -> Result<Option<KvEntry>, KvError> {
		Self::validate_key(key)?;
		if let Some(cache_ttl) = cache_ttl &&
			cache_ttl < MIN_TTL_SECS
		{
			return Err(KvError::InvalidCacheTtl(cache_ttl, MIN_TTL_SECS));
		}
		let now = (self.clock)();
		let Some(row) = self.meta.get(key, now).await? else {
			return Ok(None);
		};
		let value = self
			.blob
			.get(&row.blob_id)
			.await?
			.ok_or(crate::errors::StoreError::MissingBlob(row.blob_id.clone()))?;
		let metadata = row
			.metadata
			.as_deref()
			.map(serde_json::from_str)
			.transpose()
			.unwrap_or_default();
		Ok(Some(KvEntry {
			value,
			metadata,
			expiration: row.expiration.map(|ms| ms / 1000),
		}))
	}

	/// Deletes `key`; deleting a missing key succeeds.
	pub async fn delete(&self, key: &str) -> Result<(), KvError> {
		Self::validate_key(key)?;
		if let Some(previous) = self.meta.delete(key).await? {
			self.blob.delete(&previous.blob_id).await?;
		}
		Ok(())
	}

	/// Lists keys lexicographically with opaque cursor pagination.
	pub async fn list(&self, options: KvListOptions) -> Result<KvListResult, KvError> {
		let limit = options.limit.unwrap_or(MAX_LIST_LIMIT);
		if !(1..=MAX_LIST_LIMIT).contains(&limit) {
			return Err(KvError::InvalidLimit(limit));
		}
		let now = (self.clock)();

		// Reclaim expired rows while we are here; they are invisible anyway.
		for blob_id in self.meta.sweep_expired(now).await? {
			self.blob.delete(&blob_id).await?;
		}

		let after = match &options.cursor {
			None => None,
			Some(cursor) => match decode_cursor(cursor) {
				Some(key) => Some(key),
				// Invalid cursors yield an empty, complete page.
				None =>
					return Ok(KvListResult {
						keys: vec![],
						list_complete: true,
						cursor: String::new(),
					}),
			},
		};

		let rows = self
			.meta
			.list(&ListQuery { prefix: options.prefix.clone(), after, limit: limit + 1, now })
			.await?;
		let complete = rows.len() as i64 <= limit;
		let keys: Vec<KvKeyInfo> = rows
			.into_iter()
			.take(limit as usize)
			.map(|row| KvKeyInfo {
				name: row.key,
				expiration: row.expiration.map(|ms| ms / 1000),
				metadata: row
					.metadata
					.as_deref()
					.map(serde_json::from_str)
					.transpose()
					.unwrap_or_default(),
			})
			.collect();
		let cursor = if complete {
			String::new()
		} else {
			keys.last().map(|info| encode_cursor(&info.name)).unwrap_or_default()
		};
		Ok(KvListResult { keys, list_complete: complete, cursor })
	}
}

fn encode_cursor(key: &str) -> String {
	BASE64.encode(key.as_bytes())
}

fn decode_cursor(cursor: &str) -> Option<String> {
	let bytes = BASE64.decode(cursor).ok()?;
	String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicI64, Ordering};

	fn fixed_clock(now: Arc<AtomicI64>) -> Clock {
		Arc::new(move || now.load(Ordering::Relaxed))
	}

	async fn gateway(now: Arc<AtomicI64>) -> KvGateway {
		KvGateway::new(
			Arc::new(BlobStore::in_memory()),
			MetaStore::in_memory().await.unwrap(),
			fixed_clock(now),
		)
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn put_get_list_roundtrip() {
		let gateway = gateway(Arc::new(AtomicI64::new(0))).await;
		gateway.put("k", Bytes::from_static(b"hello"), Default::default()).await.unwrap();

		let entry = gateway.get("k", None).await.unwrap().unwrap();
		assert_eq!(&entry.value[..], b"hello");
		assert!(entry.metadata.is_none());

		let page = gateway.list(Default::default()).await.unwrap();
		assert_eq!(page.keys, vec![KvKeyInfo { name: "k".into(), expiration: None, metadata: None }]);
		assert!(page.list_complete);
		assert_eq!(page.cursor, "");
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn ttl_controls_visibility_window() {
		let now = Arc::new(AtomicI64::new(1_000_000));
		let gateway = gateway(now.clone()).await;
		let options = KvPutOptions { expiration_ttl: Some(60), ..Default::default() };
		gateway.put("k", Bytes::from_static(b"v"), options).await.unwrap();

		// Visible through the whole window.
		now.store(1_000_000 + 59_999, Ordering::Relaxed);
		assert!(gateway.get("k", None).await.unwrap().is_some());

		// Gone at the boundary.
		now.store(1_000_000 + 60_000, Ordering::Relaxed);
		assert!(gateway.get("k", None).await.unwrap().is_none());
		assert!(gateway.list(Default::default()).await.unwrap().keys.is_empty());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn put_limits_are_enforced() {
		let gateway = gateway(Arc::new(AtomicI64::new(0))).await;

		let options = KvPutOptions { expiration_ttl: Some(30), ..Default::default() };
		assert!(matches!(
			gateway.put("k", Bytes::new(), options).await,
			Err(KvError::InvalidTtl(30, 60))
		));

		let options = KvPutOptions { expiration: Some(30), ..Default::default() };
		assert!(matches!(
			gateway.put("k", Bytes::new(), options).await,
			Err(KvError::InvalidExpiration(30, 60))
		));

		let metadata = serde_json::json!({ "pad": "x".repeat(1100) });
		let options = KvPutOptions { metadata: Some(metadata), ..Default::default() };
		assert!(matches!(
			gateway.put("k", Bytes::new(), options).await,
			Err(KvError::MetadataTooLarge(..))
		));

		assert!(matches!(
			gateway.put(&"k".repeat(600), Bytes::new(), Default::default()).await,
			Err(KvError::InvalidKey(_))
		));
		assert!(matches!(
			gateway.put("__MFinternal", Bytes::new(), Default::default()).await,
			Err(KvError::InvalidKey(_))
		));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn cache_ttl_is_validated_but_inert() {
		let gateway = gateway(Arc::new(AtomicI64::new(0))).await;
		gateway.put("k", Bytes::from_static(b"v"), Default::default()).await.unwrap();
		assert!(matches!(
			gateway.get("k", Some(10)).await,
			Err(KvError::InvalidCacheTtl(10, 60))
		));
		assert!(gateway.get("k", Some(60)).await.unwrap().is_some());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn pagination_covers_all_keys_without_gaps() {
		let gateway = gateway(Arc::new(AtomicI64::new(0))).await;
		for i in 0..25u32 {
			gateway
				.put(&format!("key-{i:02}"), Bytes::from_static(b"v"), Default::default())
				.await
				.unwrap();
		}

		let mut seen = Vec::new();
		let mut cursor: Option<String> = None;
		loop {
			let options =
				KvListOptions { limit: Some(10), cursor: cursor.clone(), ..Default::default() };
			let page = gateway.list(options).await.unwrap();
			seen.extend(page.keys.iter().map(|info| info.name.clone()));
			if page.list_complete {
				assert_eq!(page.cursor, "");
				break;
			}
			cursor = Some(page.cursor);
		}
		let expected: Vec<String> = (0..25).map(|i| format!("key-{i:02}")).collect();
		assert_eq!(seen, expected);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn invalid_cursor_yields_empty_page() {
		let gateway = gateway(Arc::new(AtomicI64::new(0))).await;
		gateway.put("k", Bytes::from_static(b"v"), Default::default()).await.unwrap();

		let options =
			KvListOptions { cursor: Some("!!not-base64!!".into()), ..Default::default() };
		let page = gateway.list(options).await.unwrap();
		assert!(page.keys.is_empty());
		assert!(page.list_complete);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn list_limit_is_validated() {
		let gateway = gateway(Arc::new(AtomicI64::new(0))).await;
		for bad in [0, -1, 1001] {
			let options = KvListOptions { limit: Some(bad), ..Default::default() };
			assert!(matches!(gateway.list(options).await, Err(KvError::InvalidLimit(_))));
		}
	}
}
