// SPDX-License-Identifier: GPL-3.0

//! The object-storage (R2) simulator.
//!
//! Objects pair a blob with rich metadata: an md5 etag, an optional checksum
//! ledger, HTTP metadata, custom metadata, an upload timestamp and a version.
//! Conditional gets/puts, ranged reads, delimited lists and multipart uploads
//! all operate on that pair.

use crate::{
	Clock,
	blob::BlobStore,
	errors::{R2Error, StoreError},
	meta::{ListQuery, MetaStore},
	models::{NewEntryRow, NewPartRow, NewUploadRow, upload_state},
};
use bytes::{Bytes, BytesMut};
use ember_common::{ByteRange, RESERVED_KEY_PREFIX, parse_range};
use indexmap::IndexMap;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::sync::{
	Arc,
	atomic::{AtomicU64, Ordering},
};

/// Maximum object size: 5 GiB.
pub const MAX_VALUE_SIZE: u64 = 5 * 1024 * 1024 * 1024;
/// Maximum key length in UTF-8 bytes.
pub const MAX_KEY_SIZE: usize = 1024;
/// Maximum total custom metadata size (keys plus values) in bytes.
pub const MAX_METADATA_SIZE: u64 = 2048;
/// Minimum size of every non-final multipart part.
pub const MIN_MULTIPART_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Maximum (and default) page size for list.
pub const MAX_LIST_LIMIT: i64 = 1000;

/// HTTP metadata stored with an object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct R2HttpMetadata {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content_type: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content_language: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content_disposition: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content_encoding: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_control: Option<String>,
	/// Unix millis for the `Expires` header.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_expiry: Option<i64>,
}

impl R2HttpMetadata {
	/// The `(header, value)` pairs this metadata contributes to a response.
	pub fn headers(&self) -> Vec<(&'static str, String)> {
		let mut headers = Vec::new();
		if let Some(value) = &self.content_type {
			headers.push(("content-type", value.clone()));
		}
		if let Some(value) = &self.content_language {
			headers.push(("content-language", value.clone()));
		}
		if let Some(value) = &self.content_disposition {
			headers.push(("content-disposition", value.clone()));
		}
		if let Some(value) = &self.content_encoding {
			headers.push(("content-encoding", value.clone()));
		}
		if let Some(value) = &self.cache_control {
			headers.push(("cache-control", value.clone()));
		}
		headers
	}
}

/// Conditions evaluated against the stored object, if any.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct R2Conditional {
	pub etag_matches: Option<String>,
	pub etag_does_not_match: Option<String>,
	/// Unix millis.
	pub uploaded_before: Option<i64>,
	/// Unix millis.
	pub uploaded_after: Option<i64>,
}

impl R2Conditional {
	fn is_empty(&self) -> bool {
		self.etag_matches.is_none() &&
			self.etag_does_not_match.is_none() &&
			self.uploaded_before.is_none() &&
			self.uploaded_after.is_none()
	}

	/// Evaluates against `existing` (`None` when the key is absent). Etag
	/// predicates dominate: once one is present (and necessarily satisfied,
	/// or we have already failed), the time predicates are ignored.
	fn check(&self, existing: Option<(&str, i64)>) -> bool {
		let Some((etag, uploaded)) = existing else {
			return self.etag_matches.is_none();
		};
		let mut etag_decided = false;
		if let Some(expected) = &self.etag_matches {
			if expected != etag {
				return false;
			}
			etag_decided = true;
		}
		if let Some(expected) = &self.etag_does_not_match {
			if expected == etag {
				return false;
			}
			etag_decided = true;
		}
		if !etag_decided {
			if let Some(before) = self.uploaded_before &&
				uploaded >= before
			{
				return false;
			}
			if let Some(after) = self.uploaded_after &&
				uploaded <= after
			{
				return false;
			}
		}
		true
	}
}

/// A requested byte window, from the op envelope or a `Range` header.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct R2Range {
	pub offset: Option<u64>,
	pub length: Option<u64>,
	pub suffix: Option<u64>,
}

/// Object metadata returned to callers and over the loopback surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct R2ObjectMeta {
	pub key: String,
	pub version: String,
	pub size: u64,
	pub etag: String,
	/// Unix millis.
	pub uploaded: i64,
	#[serde(default)]
	pub http_metadata: R2HttpMetadata,
	#[serde(default)]
	pub custom_metadata: IndexMap<String, String>,
	/// Lowercase hex digests as stored.
	#[serde(default)]
	pub checksums: IndexMap<String, String>,
	/// Resolved range for ranged gets.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub range: Option<ResolvedRange>,
}

/// The window actually served by a ranged get.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRange {
	pub offset: u64,
	pub length: u64,
}

/// Options accepted by [`R2Gateway::put`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct R2PutOptions {
	pub only_if: Option<R2Conditional>,
	pub http_metadata: Option<R2HttpMetadata>,
	pub custom_metadata: Option<IndexMap<String, String>>,
	/// Lowercase hex digests; at most one may be supplied.
	pub md5: Option<String>,
	pub sha1: Option<String>,
	pub sha256: Option<String>,
	pub sha384: Option<String>,
	pub sha512: Option<String>,
}

/// Options accepted by [`R2Gateway::get`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct R2GetOptions {
	pub only_if: Option<R2Conditional>,
	pub range: Option<R2Range>,
	/// Raw `Range` header; used when no structured range is given.
	pub range_header: Option<String>,
}

/// A fetched object: metadata plus the body, absent when a precondition
/// failed (the caller still receives the metadata handle).
#[derive(Clone, Debug)]
pub struct R2GetResult {
	pub meta: R2ObjectMeta,
	pub body: Option<Bytes>,
}

/// Options accepted by [`R2Gateway::list`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct R2ListOptions {
	pub prefix: Option<String>,
	pub cursor: Option<String>,
	pub limit: Option<i64>,
	pub start_after: Option<String>,
	pub delimiter: Option<String>,
	/// Which optional metadata fields to include: `httpMetadata`, `customMetadata`.
	pub include: Option<Vec<String>>,
}

/// A page of objects.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct R2Objects {
	pub objects: Vec<R2ObjectMeta>,
	pub truncated: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cursor: Option<String>,
	pub delimited_prefixes: Vec<String>,
}

/// A created multipart upload.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct R2Upload {
	pub key: String,
	pub upload_id: String,
}

/// A part reference supplied on completion.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct R2UploadedPart {
	pub part_number: i32,
	pub etag: String,
}

#[derive(Serialize, Deserialize, Default)]
struct StoredMetadata {
	#[serde(default)]
	http: R2HttpMetadata,
	#[serde(default)]
	custom: IndexMap<String, String>,
}

/// The R2 simulator for one bucket.
#[derive(Clone)]
pub struct R2Gateway {
	blob: Arc<BlobStore>,
	meta: MetaStore,
	clock: Clock,
	min_part_size: u64,
	id_counter: Arc<AtomicU64>,
}

impl R2Gateway {
	/// Creates a gateway over the given planes.
	pub fn new(blob: Arc<BlobStore>, meta: MetaStore, clock: Clock) -> Self {
		Self {
			blob,
			meta,
			clock,
			min_part_size: MIN_MULTIPART_PART_SIZE,
			id_counter: Arc::new(AtomicU64::new(0)),
		}
	}

	/// Overrides the minimum multipart part size; test hook.
	pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
		self.min_part_size = min_part_size;
		self
	}

	fn validate_key(key: &str) -> Result<(), R2Error> {
		if key.is_empty() || key.len() > MAX_KEY_SIZE || key.starts_with(RESERVED_KEY_PREFIX) {
			return Err(R2Error::InvalidObjectName);
		}
		Ok(())
	}

	fn opaque_id(&self) -> String {
		let counter = self.id_counter.fetch_add(1, Ordering::Relaxed);
		let mut hasher = Sha256::new();
		hasher.update(counter.to_le_bytes());
		hasher.update((self.clock)().to_le_bytes());
		hex::encode(&hasher.finalize()[..16])
	}

	fn row_to_meta(row: &crate::models::EntryRow) -> R2ObjectMeta {
		let stored: StoredMetadata = row
			.metadata
			.as_deref()
			.and_then(|metadata| serde_json::from_str(metadata).ok())
			.unwrap_or_default();
		let checksums: IndexMap<String, String> = row
			.hashes
			.as_deref()
			.and_then(|hashes| serde_json::from_str(hashes).ok())
			.unwrap_or_default();
		R2ObjectMeta {
			key: row.key.clone(),
			version: row.version.clone().unwrap_or_default(),
			size: row.size as u64,
			// The etag is the stored md5; the ledger always carries it.
			etag: checksums.get("md5").cloned().unwrap_or_default(),
			uploaded: row.uploaded,
			http_metadata: stored.http,
			custom_metadata: stored.custom,
			checksums,
			range: None,
		}
	}

	async fn existing(&self, key: &str) -> Result<Option<crate::models::EntryRow>, StoreError> {
		// R2 objects never expire; `now` only matters for products that set it.
		self.meta.get(key, i64::MIN).await
	}

	/// Verifies at most one supplied digest against `value` and returns the
	/// checksum ledger to store (always including md5).
	fn build_checksums(
		value: &[u8],
		options: &R2PutOptions,
	) -> Result<(IndexMap<String, String>, String), R2Error> {
		let md5_hex = hex::encode(Md5::digest(value));
		let mut ledger = IndexMap::new();
		ledger.insert("md5".to_string(), md5_hex.clone());

		let supplied: Vec<(&'static str, &String)> = [
			("md5", options.md5.as_ref()),
			("sha1", options.sha1.as_ref()),
			("sha256", options.sha256.as_ref()),
			("sha384", options.sha384.as_ref()),
			("sha512", options.sha512.as_ref()),
		]
		.into_iter()
		.filter_map(|(algo, digest)| digest.map(|digest| (algo, digest)))
		.collect();
		if supplied.len() > 1 {
			return Err(R2Error::InvalidDigestCount);
		}
		if let Some((algo, digest)) = supplied.first() {
			let expected = digest.to_ascii_lowercase();
			let actual = match *algo {
				"md5" => md5_hex.clone(),
				"sha1" => hex::encode(Sha1::digest(value)),
				"sha256" => hex::encode(Sha256::digest(value)),
				"sha384" => hex::encode(Sha384::digest(value)),
				"sha512" => hex::encode(Sha512::digest(value)),
				_ => unreachable!(),
			};
			if expected != actual {
				return Err(R2Error::BadDigest(*algo));
			}
			ledger.insert(algo.to_string(), actual);
		}
		Ok((ledger, md5_hex))
	}

	/// Stores `value` under `key`. With a failing `onlyIf` the store is
	/// untouched and the existing object's metadata rides on the error.
	pub async fn put(
		&self,
		key: &str,
		value: Bytes,
		options: R2PutOptions,
	) -> Result<R2ObjectMeta, R2Error> {
		Self::validate_key(key)?;
		if value.len() as u64 > MAX_VALUE_SIZE {
			return Err(R2Error::EntityTooLarge(MAX_VALUE_SIZE));
		}
		if let Some(custom) = &options.custom_metadata {
			let total: usize = custom.iter().map(|(k, v)| k.len() + v.len()).sum();
			if total as u64 > MAX_METADATA_SIZE {
				return Err(R2Error::MetadataTooLarge(MAX_METADATA_SIZE));
			}
		}

		// Digest verification happens before any mutation.
		let (ledger, _) = Self::build_checksums(&value, &options)?;

		let existing = self.existing(key).await?;
		if let Some(conditional) = &options.only_if &&
			!conditional.is_empty()
		{
			let current = existing.as_ref().map(Self::row_to_meta);
			let pair = current.as_ref().map(|meta| (meta.etag.as_str(), meta.uploaded));
			if !conditional.check(pair) {
				return Err(R2Error::PreconditionFailed(current.map(Box::new)));
			}
		}

		let now = (self.clock)();
		let version = self.opaque_id();
		let stored = StoredMetadata {
			http: options.http_metadata.clone().unwrap_or_default(),
			custom: options.custom_metadata.clone().unwrap_or_default(),
		};
		let metadata = serde_json::to_string(&stored).expect("metadata serialises");
		let hashes = serde_json::to_string(&ledger).expect("ledger serialises");

		let size = value.len() as i64;
		let blob_id = self.blob.put(value).await?;
		let previous = self
			.meta
			.put(NewEntryRow {
				key,
				blob_id: &blob_id,
				size,
				uploaded: now,
				expiration: None,
				metadata: Some(&metadata),
				hashes: Some(&hashes),
				version: Some(&version),
			})
			.await?;
		if let Some(previous) = previous {
			self.blob.delete(&previous.blob_id).await?;
		}

		Ok(R2ObjectMeta {
			key: key.to_string(),
			version,
			size: size as u64,
			etag: ledger.get("md5").cloned().unwrap_or_default(),
			uploaded: now,
			http_metadata: stored.http,
			custom_metadata: stored.custom,
			checksums: ledger,
			range: None,
		})
	}

	/// Fetches `key`'s metadata; `None` when absent.
	pub async fn head(&self, key: &str) -> Result<Option<R2ObjectMeta>, R2Error> {
		Self::validate_key(key)?;
		Ok(self.existing(key).await?.as_ref().map(Self::row_to_meta))
	}

	/// Fetches `key`, honouring conditionals and ranges. A failed
	/// precondition yields a bodiless result carrying the metadata.
	pub async fn get(
		&self,
		key: &str,
		options: R2GetOptions,
	) -> Result<Option<R2GetResult>, R2Error> {
		Self::validate_key(key)?;
		let Some(row) = self.existing(key).await? else {
			return Ok(None);
		};
		let mut meta = Self::row_to_meta(&row);

		if let Some(conditional) = &options.only_if &&
			!conditional.is_empty() &&
			!conditional.check(Some((meta.etag.as_str(), meta.uploaded)))
		{
			return Ok(Some(R2GetResult { meta, body: None }));
		}

		let size = row.size as u64;
		let range = match (&options.range, &options.range_header) {
			(Some(range), _) => resolve_structured_range(range, size)?,
			(None, Some(header)) =>
				parse_range(Some(header), size).map_err(|_| R2Error::InvalidRange)?,
			(None, None) => ByteRange::full(size),
		};
		let body = self
			.blob
			.get_range(&row.blob_id, range)
			.await?
			.ok_or(StoreError::MissingBlob(row.blob_id.clone()))?;
		if range.offset != 0 || range.length != size {
			meta.range = Some(ResolvedRange { offset: range.offset, length: range.length });
		}
		Ok(Some(R2GetResult { meta, body: Some(body) }))
	}

	/// Deletes each key; missing keys are ignored.
	pub async fn delete(&self, keys: &[String]) -> Result<(), R2Error> {
		for key in keys {
			Self::validate_key(key)?;
		}
		for key in keys {
			if let Some(previous) = self.meta.delete(key).await? {
				self.blob.delete(&previous.blob_id).await?;
			}
		}
		Ok(())
	}

	/// Lists objects with optional delimiter grouping.
	///
	/// Pages re-read the table at delivery time: inserts sorting after the
	/// cursor are observed, and deleted keys never reappear.
	pub async fn list(&self, options: R2ListOptions) -> Result<R2Objects, R2Error> {
		let limit = options.limit.unwrap_or(MAX_LIST_LIMIT);
		if !(1..=MAX_LIST_LIMIT).contains(&limit) {
			return Err(R2Error::InvalidMaxKeys);
		}
		let include = options.include.unwrap_or_default();
		let include_http = include.iter().any(|field| field == "httpMetadata");
		let include_custom = include.iter().any(|field| field == "customMetadata");
		let prefix = options.prefix.clone().unwrap_or_default();
		let delimiter = options.delimiter.clone();

		let mut after = match (&options.cursor, &options.start_after) {
			(Some(cursor), _) => Some(cursor.clone()),
			(None, Some(start_after)) => Some(start_after.clone()),
			(None, None) => None,
		};

		let mut objects = Vec::new();
		let mut prefixes: Vec<String> = Vec::new();
		let mut truncated = false;
		let mut cursor = None;
		let mut last_consumed: Option<String> = None;

		'pages: loop {
			let rows = self
				.meta
				.list(&ListQuery {
					prefix: options.prefix.clone(),
					after: after.clone(),
					limit: limit + 1,
					now: i64::MIN,
				})
				.await?;
			let exhausted = rows.len() as i64 <= limit;
			for row in rows.iter().take(limit as usize) {
				if objects.len() + prefixes.len() >= limit as usize {
					truncated = true;
					// The next page resumes strictly after the last key that
					// contributed to this one.
					cursor = last_consumed.clone();
					break 'pages;
				}
				last_consumed = Some(row.key.clone());
				let rest = &row.key[prefix.len()..];
				if let Some(delimiter) = &delimiter &&
					let Some(position) = rest.find(delimiter.as_str())
				{
					let group = format!("{prefix}{}{delimiter}", &rest[..position]);
					if prefixes.last() != Some(&group) {
						prefixes.push(group);
					}
					continue;
				}
				let mut meta = Self::row_to_meta(row);
				if !include_http {
					meta.http_metadata = R2HttpMetadata::default();
				}
				if !include_custom {
					meta.custom_metadata = IndexMap::new();
				}
				objects.push(meta);
			}
			if exhausted {
				break;
			}
			after = rows.get(limit as usize - 1).map(|row| row.key.clone());
			if after.is_none() {
				break;
			}
		}

		Ok(R2Objects { objects, truncated, cursor, delimited_prefixes: prefixes })
	}

	/// Starts a multipart upload.
	pub async fn create_multipart_upload(
		&self,
		key: &str,
		options: R2PutOptions,
	) -> Result<R2Upload, R2Error> {
		Self::validate_key(key)?;
		let upload_id = self.opaque_id();
		let stored = StoredMetadata {
			http: options.http_metadata.unwrap_or_default(),
			custom: options.custom_metadata.unwrap_or_default(),
		};
		let metadata = serde_json::to_string(&stored).expect("metadata serialises");
		self.meta
			.create_upload(NewUploadRow {
				upload_id: &upload_id,
				key,
				metadata: Some(&metadata),
				state: upload_state::IN_PROGRESS,
			})
			.await?;
		Ok(R2Upload { key: key.to_string(), upload_id })
	}

	async fn active_upload(
		&self,
		key: &str,
		upload_id: &str,
	) -> Result<crate::models::UploadRow, R2Error> {
		let upload = self.meta.get_upload(upload_id).await?.ok_or(R2Error::NoSuchUpload)?;
		if upload.key != key || upload.state != upload_state::IN_PROGRESS {
			return Err(R2Error::NoSuchUpload);
		}
		Ok(upload)
	}

	/// Records one part of an upload, returning its etag.
	pub async fn upload_part(
		&self,
		key: &str,
		upload_id: &str,
		part_number: i32,
		value: Bytes,
	) -> Result<String, R2Error> {
		Self::validate_key(key)?;
		self.active_upload(key, upload_id).await?;

		let etag = hex::encode(Md5::digest(&value));
		let size = value.len() as i64;
		let blob_id = self.blob.put(value).await?;
		let previous = self
			.meta
			.put_part(NewPartRow { upload_id, part_number, etag: &etag, blob_id: &blob_id, size })
			.await?;
		if let Some(previous) = previous {
			self.blob.delete(&previous).await?;
		}
		Ok(etag)
	}

	/// Completes an upload: stitches the referenced parts, in ascending part
	/// order, into a single value and atomically swaps the manifest.
	pub async fn complete_multipart_upload(
		&self,
		key: &str,
		upload_id: &str,
		parts: &[R2UploadedPart],
	) -> Result<R2ObjectMeta, R2Error> {
		Self::validate_key(key)?;
		let upload = self.active_upload(key, upload_id).await?;
		let uploaded_parts = self.meta.parts(upload_id).await?;

		let mut selected = Vec::with_capacity(parts.len());
		let mut last_number = i32::MIN;
		for reference in parts {
			if reference.part_number <= last_number {
				return Err(R2Error::InvalidPart);
			}
			last_number = reference.part_number;
			let row = uploaded_parts
				.iter()
				.find(|row| {
					row.part_number == reference.part_number && row.etag == reference.etag
				})
				.ok_or(R2Error::InvalidPart)?;
			selected.push(row.clone());
		}
		if selected.is_empty() {
			return Err(R2Error::BadUpload);
		}
		// Every part but the last must reach the minimum part size.
		if selected[..selected.len() - 1]
			.iter()
			.any(|row| (row.size as u64) < self.min_part_size)
		{
			return Err(R2Error::BadUpload);
		}

		let mut stitched = BytesMut::new();
		let mut etag_material = Vec::new();
		for row in &selected {
			let part = self
				.blob
				.get(&row.blob_id)
				.await?
				.ok_or(StoreError::MissingBlob(row.blob_id.clone()))?;
			stitched.extend_from_slice(&part);
			let mut digest = [0u8; 16];
			if let Ok(bytes) = hex::decode(&row.etag) &&
				bytes.len() == 16
			{
				digest.copy_from_slice(&bytes);
			}
			etag_material.extend_from_slice(&digest);
		}
		let etag = format!("{}-{}", hex::encode(Md5::digest(&etag_material)), selected.len());
		let stitched = stitched.freeze();

		let now = (self.clock)();
		let version = self.opaque_id();
		let mut ledger = IndexMap::new();
		ledger.insert("md5".to_string(), etag.clone());
		let hashes = serde_json::to_string(&ledger).expect("ledger serialises");

		let size = stitched.len() as i64;
		let blob_id = self.blob.put(stitched).await?;
		let (previous, part_blobs) = self
			.meta
			.finish_upload(
				upload_id,
				NewEntryRow {
					key,
					blob_id: &blob_id,
					size,
					uploaded: now,
					expiration: None,
					metadata: upload.metadata.as_deref(),
					hashes: Some(&hashes),
					version: Some(&version),
				},
			)
			.await?;
		if let Some(previous) = previous {
			self.blob.delete(&previous.blob_id).await?;
		}
		for blob_id in part_blobs {
			self.blob.delete(&blob_id).await?;
		}

		let stored: StoredMetadata = upload
			.metadata
			.as_deref()
			.and_then(|metadata| serde_json::from_str(metadata).ok())
			.unwrap_or_default();
		Ok(R2ObjectMeta {
			key: key.to_string(),
			version,
			size: size as u64,
			etag,
			uploaded: now,
			http_metadata: stored.http,
			custom_metadata: stored.custom,
			checksums: ledger,
			range: None,
		})
	}

	/// Aborts an upload and reclaims its part blobs.
	pub async fn abort_multipart_upload(
		&self,
		key: &str,
		upload_id: &str,
	) -> Result<(), R2Error> {
		Self::validate_key(key)?;
		self.active_upload(key, upload_id).await?;
		for blob_id in self.meta.abort_upload(upload_id).await? {
			self.blob.delete(&blob_id).await?;
		}
		Ok(())
	}
}

fn resolve_structured_range(range: &R2Range, size: u64) -> Result<ByteRange, R2Error> {
	match (range.offset, range.length, range.suffix) {
		(None, None, None) => Ok(ByteRange::full(size)),
		(_, _, Some(suffix)) => {
			if suffix == 0 || range.offset.is_some() || range.length.is_some() {
				return Err(R2Error::InvalidRange);
			}
			let suffix = suffix.min(size);
			Ok(ByteRange { offset: size - suffix, length: suffix })
		},
		(offset, length, None) => {
			let offset = offset.unwrap_or(0);
			if offset >= size && size > 0 {
				return Err(R2Error::InvalidRange);
			}
			let available = size - offset.min(size);
			let length = length.unwrap_or(available).min(available);
			if length == 0 && size > 0 {
				return Err(R2Error::InvalidRange);
			}
			Ok(ByteRange { offset, length })
		},
	}
}
