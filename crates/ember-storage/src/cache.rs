// SPDX-License-Identifier: GPL-3.0

//! The HTTP cache simulator.
//!
//! Entries are keyed by a cache key (usually the request URL) and partitioned
//! by named cache; each partition owns its own blob and metadata planes. A
//! put ingests a serialised HTTP response, a match returns it verbatim
//! without revalidation.

use crate::{
	Clock,
	blob::BlobStore,
	errors::{CacheError, StoreError},
	meta::MetaStore,
	models::NewEntryRow,
};
use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{
	Arc, OnceLock,
	atomic::{AtomicBool, Ordering},
};

/// Ceiling applied to every stored entry's freshness lifetime: one year.
pub const MAX_TTL_MILLIS: i64 = 365 * 24 * 60 * 60 * 1000;

fn status_line_regex() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"^HTTP/\d(?:\.\d)? (\d{3})").expect("static regex parses"))
}

/// A response as stored and returned by the cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedResponse {
	/// HTTP status code.
	pub status: u16,
	/// Header pairs in received order, chunked framing stripped.
	pub headers: Vec<(String, String)>,
	/// The stored body bytes.
	#[serde(skip)]
	pub body: Bytes,
}

#[derive(Serialize, Deserialize)]
struct StoredHead {
	status: u16,
	headers: Vec<(String, String)>,
}

/// The cache simulator for one partition.
#[derive(Clone)]
pub struct CacheGateway {
	blob: Arc<BlobStore>,
	meta: MetaStore,
	clock: Clock,
	warn_usage: Option<Arc<AtomicBool>>,
}

impl CacheGateway {
	/// Creates a gateway over the given planes.
	///
	/// When `warn_usage` is set, the first operation logs a reminder that the
	/// bound environment treats the cache as a no-op in production.
	pub fn new(
		blob: Arc<BlobStore>,
		meta: MetaStore,
		clock: Clock,
		warn_usage: bool,
	) -> Self {
		Self {
			blob,
			meta,
			clock,
			warn_usage: warn_usage.then(|| Arc::new(AtomicBool::new(false))),
		}
	}

	fn maybe_warn(&self) {
		if let Some(warned) = &self.warn_usage &&
			!warned.swap(true, Ordering::Relaxed)
		{
			log::warn!(
				"cache operations have no impact in this environment: requests served from a workers.dev subdomain are never cached in production"
			);
		}
	}

	/// Ingests a serialised HTTP response under `cache_key`.
	///
	/// Returns `false` without storing when `Cache-Control` forbids it
	/// (`no-store` or `private`).
	pub async fn put(&self, cache_key: &str, serialised: Bytes) -> Result<bool, CacheError> {
		self.maybe_warn();
		let (status, headers, body) = parse_serialised_response(&serialised)?;
		let headers = strip_chunked_framing(headers);

		let cache_control = header_value(&headers, "cache-control").unwrap_or_default();
		let directives = parse_cache_control(&cache_control);
		if directives.no_store || directives.private {
			return Ok(false);
		}

		let now = (self.clock)();
		let ttl = directives
			.s_maxage
			.or(directives.max_age)
			.map(|secs| secs.saturating_mul(1000))
			.unwrap_or(MAX_TTL_MILLIS)
			.clamp(0, MAX_TTL_MILLIS);
		if ttl == 0 {
			return Ok(false);
		}

		let head = StoredHead { status, headers };
		let metadata = serde_json::to_string(&head).expect("head serialises");
		let size = body.len() as i64;
		let blob_id = self.blob.put(body).await?;
		let previous = self
			.meta
			.put(NewEntryRow {
				key: cache_key,
				blob_id: &blob_id,
				size,
				uploaded: now,
				expiration: Some(now + ttl),
				metadata: Some(&metadata),
				hashes: None,
				version: None,
			})
			.await?;
		if let Some(previous) = previous {
			self.blob.delete(&previous.blob_id).await?;
		}
		Ok(true)
	}

	/// Returns the stored response for `cache_key`, without revalidation.
	pub async fn match_key(&self, cache_key: &str) -> Result<Option<CachedResponse>, CacheError> {
		self.maybe_warn();
		let now = (self.clock)();
		let Some(row) = self.meta.get(cache_key, now).await? else {
			return Ok(None);
		};
		let head: StoredHead = row
			.metadata
			.as_deref()
			.and_then(|metadata| serde_json::from_str(metadata).ok())
			.ok_or_else(|| CacheError::MalformedResponse("missing stored head".into()))?;
		let body = self
			.blob
			.get(&row.blob_id)
			.await?
			.ok_or(StoreError::MissingBlob(row.blob_id.clone()))?;
		Ok(Some(CachedResponse { status: head.status, headers: head.headers, body }))
	}

	/// Removes `cache_key` exactly; returns whether an entry existed.
	pub async fn delete(&self, cache_key: &str) -> Result<bool, CacheError> {
		self.maybe_warn();
		let Some(previous) = self.meta.delete(cache_key).await? else {
			return Ok(false);
		};
		self.blob.delete(&previous.blob_id).await?;
		Ok(true)
	}
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
	headers
		.iter()
		.find(|(header, _)| header.eq_ignore_ascii_case(name))
		.map(|(_, value)| value.clone())
}

/// Splits a serialised HTTP response into status, header pairs and body.
fn parse_serialised_response(
	serialised: &[u8],
) -> Result<(u16, Vec<(String, String)>, Bytes), CacheError> {
	let split = find_head_end(serialised)
		.ok_or_else(|| CacheError::MalformedResponse("missing header terminator".into()))?;
	let head = std::str::from_utf8(&serialised[..split.0])
		.map_err(|_| CacheError::MalformedResponse("head is not UTF-8".into()))?;
	let body = Bytes::copy_from_slice(&serialised[split.1..]);

	let mut lines = head.split("\r\n").flat_map(|line| line.split('\n'));
	let status_line = lines
		.next()
		.ok_or_else(|| CacheError::MalformedResponse("empty head".into()))?;
	let status: u16 = status_line_regex()
		.captures(status_line)
		.and_then(|captures| captures.get(1))
		.and_then(|code| code.as_str().parse().ok())
		.ok_or_else(|| CacheError::MalformedResponse(format!("bad status line `{status_line}`")))?;

	let mut headers = Vec::new();
	for line in lines {
		if line.is_empty() {
			continue;
		}
		let Some((name, value)) = line.split_once(':') else {
			return Err(CacheError::MalformedResponse(format!("bad header line `{line}`")));
		};
		headers.push((name.trim().to_string(), value.trim().to_string()));
	}
	Ok((status, headers, body))
}

fn find_head_end(serialised: &[u8]) -> Option<(usize, usize)> {
	if let Some(position) = serialised.windows(4).position(|window| window == b"\r\n\r\n") {
		return Some((position, position + 4));
	}
	serialised.windows(2).position(|window| window == b"\n\n").map(|p| (p, p + 2))
}

/// Removes chunked transfer-encoding from the framing headers.
///
/// Only a `Transfer-Encoding` header occupying its own header line is
/// touched; `chunked` is removed from its comma-separated token list and the
/// header is dropped when the list empties. Anything else is stored as-is.
fn strip_chunked_framing(headers: Vec<(String, String)>) -> Vec<(String, String)> {
	headers
		.into_iter()
		.filter_map(|(name, value)| {
			if !name.eq_ignore_ascii_case("transfer-encoding") {
				return Some((name, value));
			}
			let kept: Vec<&str> = value
				.split(',')
				.map(str::trim)
				.filter(|token| !token.eq_ignore_ascii_case("chunked") && !token.is_empty())
				.collect();
			if kept.is_empty() { None } else { Some((name, kept.join(", "))) }
		})
		.collect()
}

#[derive(Default)]
struct CacheControl {
	no_store: bool,
	private: bool,
	max_age: Option<i64>,
	s_maxage: Option<i64>,
}

fn parse_cache_control(value: &str) -> CacheControl {
	let mut directives = CacheControl::default();
	for token in value.split(',') {
		let token = token.trim();
		let (name, argument) = match token.split_once('=') {
			Some((name, argument)) => (name.trim(), Some(argument.trim())),
			None => (token, None),
		};
		match name.to_ascii_lowercase().as_str() {
			"no-store" => directives.no_store = true,
			"private" => directives.private = true,
			"max-age" => directives.max_age = argument.and_then(|a| a.parse().ok()),
			"s-maxage" => directives.s_maxage = argument.and_then(|a| a.parse().ok()),
			_ => {},
		}
	}
	directives
}
