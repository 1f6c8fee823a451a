// SPDX-License-Identifier: GPL-3.0

//! Error types for the storage simulators.
//!
//! Product-facing errors carry a stable numeric code (`v4code`) that
//! round-trips over the loopback HTTP surface in a JSON envelope; internal
//! failures (database, IO) are folded into each product's `Internal` variant
//! so user code only ever observes documented codes.

use std::error::Error as StdError;
use thiserror::Error;

/// Errors from the shared blob + metadata planes.
#[derive(Debug, Error)]
pub enum StoreError {
	/// Database error.
	#[error("database error: {0}")]
	Database(#[from] diesel::result::Error),
	/// Database connection error.
	#[error("database connection error: {0}")]
	Connection(#[from] diesel::result::ConnectionError),
	/// IO error.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// A record's blob reference did not resolve.
	#[error("missing blob `{0}`")]
	MissingBlob(String),
}

impl From<Box<dyn StdError + Send + Sync>> for StoreError {
	fn from(e: Box<dyn StdError + Send + Sync>) -> Self {
		// Migrations return boxed errors; surface them through IO.
		StoreError::Io(std::io::Error::other(e.to_string()))
	}
}

/// Errors surfaced by the KV simulator.
#[derive(Debug, Error)]
pub enum KvError {
	/// The key exceeds the 512-byte limit or is otherwise unusable.
	#[error("key is not valid: {0}")]
	InvalidKey(String),
	/// The value exceeds the 25 MiB limit.
	#[error("value length of {0} exceeds limit of {1}")]
	ValueTooLarge(u64, u64),
	/// The metadata exceeds the 1 KiB limit.
	#[error("metadata length of {0} exceeds limit of {1}")]
	MetadataTooLarge(u64, u64),
	/// The expiration TTL is below the 60 second minimum.
	#[error("invalid expiration_ttl of {0}, must be at least {1}")]
	InvalidTtl(i64, i64),
	/// The absolute expiration is not far enough in the future.
	#[error("invalid expiration of {0}, must be at least {1} seconds in the future")]
	InvalidExpiration(i64, i64),
	/// The cache TTL hint is below the minimum.
	#[error("invalid cache_ttl of {0}, must be at least {1}")]
	InvalidCacheTtl(i64, i64),
	/// The list limit is outside 1..=1000.
	#[error("invalid limit of {0}, must be in the range 1..=1000")]
	InvalidLimit(i64),
	/// The key does not exist.
	#[error("key not found")]
	NotFound,
	/// Internal failure.
	#[error(transparent)]
	Internal(#[from] StoreError),
}

impl KvError {
	/// Stable numeric code for the HTTP envelope.
	pub fn v4code(&self) -> u32 {
		match self {
			KvError::InvalidKey(_) => 10011,
			KvError::ValueTooLarge(..) => 10012,
			KvError::MetadataTooLarge(..) => 10013,
			KvError::InvalidTtl(..) => 10014,
			KvError::InvalidExpiration(..) => 10015,
			KvError::InvalidCacheTtl(..) => 10016,
			KvError::InvalidLimit(_) => 10017,
			KvError::NotFound => 10009,
			KvError::Internal(_) => 10001,
		}
	}

	/// HTTP status for the loopback surface.
	pub fn status(&self) -> u16 {
		match self {
			KvError::NotFound => 404,
			KvError::ValueTooLarge(..) | KvError::MetadataTooLarge(..) => 413,
			KvError::Internal(_) => 500,
			_ => 400,
		}
	}
}

/// Errors surfaced by the R2 simulator, mirroring the product's codes.
#[derive(Debug, Error)]
pub enum R2Error {
	/// The object does not exist.
	#[error("The specified key does not exist.")]
	NoSuchKey,
	/// The value exceeds the maximum object size.
	#[error("The object size exceeds the maximum allowed ({0} bytes)")]
	EntityTooLarge(u64),
	/// Custom metadata exceeds the limit.
	#[error("Your metadata headers exceed the maximum allowed metadata size ({0} bytes)")]
	MetadataTooLarge(u64),
	/// The key exceeds the 1024-byte limit or starts with the reserved prefix.
	#[error("The specified object name is not valid.")]
	InvalidObjectName,
	/// The list limit is outside 1..=1000.
	#[error("MaxKeys params must be positive integer <= 1000.")]
	InvalidMaxKeys,
	/// A conditional on the operation failed; carries the existing object when present.
	#[error("At least one of the pre-conditions you specified did not hold.")]
	PreconditionFailed(Option<Box<crate::r2::R2ObjectMeta>>),
	/// The requested range cannot be satisfied.
	#[error("The requested range is not satisfiable.")]
	InvalidRange,
	/// The multipart upload does not exist or is no longer active.
	#[error("The specified multipart upload does not exist.")]
	NoSuchUpload,
	/// A part referenced on completion was never uploaded or has a stale etag.
	#[error("One or more of the specified parts could not be found.")]
	InvalidPart,
	/// A supplied digest did not match the received value.
	#[error("The {0} checksum you specified did not match what we received.")]
	BadDigest(&'static str),
	/// More than one digest was supplied with a put.
	#[error("You may specify at most one checksum per upload.")]
	InvalidDigestCount,
	/// An intermediate part was smaller than the minimum part size.
	#[error("There was a problem with the multipart upload.")]
	BadUpload,
	/// Internal failure.
	#[error(transparent)]
	Internal(#[from] StoreError),
}

impl R2Error {
	/// Stable numeric code for the HTTP envelope (`v4code`).
	pub fn v4code(&self) -> u32 {
		match self {
			R2Error::NoSuchKey => 10007,
			R2Error::EntityTooLarge(_) => 100100,
			R2Error::MetadataTooLarge(_) => 10012,
			R2Error::InvalidObjectName => 10020,
			R2Error::InvalidMaxKeys => 10022,
			R2Error::NoSuchUpload => 10024,
			R2Error::InvalidPart => 10025,
			R2Error::InvalidDigestCount => 10029,
			R2Error::PreconditionFailed(_) => 10031,
			R2Error::BadDigest(_) => 10037,
			R2Error::InvalidRange => 10039,
			R2Error::BadUpload => 10048,
			R2Error::Internal(_) => 10001,
		}
	}

	/// HTTP status for the loopback surface.
	pub fn status(&self) -> u16 {
		match self {
			R2Error::NoSuchKey | R2Error::NoSuchUpload => 404,
			R2Error::EntityTooLarge(_) | R2Error::MetadataTooLarge(_) => 413,
			R2Error::PreconditionFailed(_) => 412,
			R2Error::InvalidRange => 416,
			R2Error::Internal(_) => 500,
			_ => 400,
		}
	}
}

/// Errors surfaced by the cache simulator.
#[derive(Debug, Error)]
pub enum CacheError {
	/// The stored entry does not exist or has expired.
	#[error("cache entry not found")]
	Miss,
	/// The serialised response could not be parsed.
	#[error("malformed serialised response: {0}")]
	MalformedResponse(String),
	/// Internal failure.
	#[error(transparent)]
	Internal(#[from] StoreError),
}

impl CacheError {
	/// Stable numeric code for the HTTP envelope.
	pub fn v4code(&self) -> u32 {
		match self {
			CacheError::Miss => 10021,
			CacheError::MalformedResponse(_) => 10022,
			CacheError::Internal(_) => 10001,
		}
	}

	/// HTTP status for the loopback surface.
	pub fn status(&self) -> u16 {
		match self {
			CacheError::Miss => 404,
			CacheError::MalformedResponse(_) => 400,
			CacheError::Internal(_) => 500,
		}
	}
}

/// Errors surfaced by the queue broker.
#[derive(Debug, Error)]
pub enum QueueError {
	/// Two workers declared themselves consumer of the same queue.
	#[error("Multiple consumers defined for queue \"{0}\"")]
	MultipleConsumers(String),
	/// The dead-letter chain contains a cycle through the named queue.
	#[error("Dead letter queue for queue \"{0}\" also has its own dead letter queue")]
	DeadLetterQueueCycle(String),
	/// A message or batch exceeds the size limits.
	#[error("message length of {size} exceeds limit of {limit}")]
	PayloadTooLarge {
		/// Observed size in bytes.
		size: u64,
		/// The applicable limit in bytes.
		limit: u64,
	},
	/// The batch contains more messages than permitted.
	#[error("batch message count of {0} exceeds limit of {1}")]
	TooManyMessages(usize, usize),
	/// The content type tag is not one of the supported values.
	#[error("unsupported queue content type `{0}`")]
	UnsupportedContentType(String),
	/// The queue has no registered producer or consumer.
	#[error("no such queue \"{0}\"")]
	NoSuchQueue(String),
}

impl QueueError {
	/// Stable numeric code for the HTTP envelope.
	pub fn v4code(&self) -> u32 {
		match self {
			QueueError::MultipleConsumers(_) => 10051,
			QueueError::DeadLetterQueueCycle(_) => 10052,
			QueueError::PayloadTooLarge { .. } => 10053,
			QueueError::TooManyMessages(..) => 10054,
			QueueError::UnsupportedContentType(_) => 10055,
			QueueError::NoSuchQueue(_) => 10056,
		}
	}

	/// HTTP status for the loopback surface.
	pub fn status(&self) -> u16 {
		match self {
			QueueError::PayloadTooLarge { .. } => 413,
			QueueError::NoSuchQueue(_) => 404,
			_ => 400,
		}
	}
}

/// Errors surfaced by the sites simulator.
#[derive(Debug, Error)]
pub enum SitesError {
	/// The asset does not exist or is filtered out.
	#[error("no such asset `{0}`")]
	NotFound(String),
	/// The path escapes the site root.
	#[error("asset path `{0}` escapes the site root")]
	Traversal(String),
	/// An include/exclude pattern failed to parse.
	#[error("invalid site filter pattern: {0}")]
	Pattern(#[from] glob::PatternError),
	/// IO error while walking or reading the site.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

/// Errors surfaced by the relational simulator.
#[derive(Debug, Error)]
pub enum D1Error {
	/// The statement failed to prepare or execute; the message comes from SQLite.
	#[error("{0}")]
	Statement(String),
	/// A parameter could not be bound.
	#[error("unsupported parameter at index {0}")]
	UnsupportedParameter(usize),
	/// The database file could not be opened.
	#[error("failed to open database: {0}")]
	Open(String),
	/// Internal failure.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

impl D1Error {
	/// Stable numeric code for the HTTP envelope.
	pub fn v4code(&self) -> u32 {
		match self {
			D1Error::Statement(_) => 10061,
			D1Error::UnsupportedParameter(_) => 10062,
			D1Error::Open(_) => 10063,
			D1Error::Io(_) => 10001,
		}
	}
}
