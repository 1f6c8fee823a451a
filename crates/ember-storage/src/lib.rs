// SPDX-License-Identifier: GPL-3.0

//! Storage simulators for Ember.
//!
//! A shared blob + metadata abstraction underlies the products:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                  loopback HTTP surface                      │
//! │        /kv  /r2  /cache  /queues  /d1  /sites               │
//! └────────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │ blob plane (write-once)  │   │ metadata plane (SQLite/WAL,  │
//! │ <persist>/blobs/<id>     │   │ one database per namespace)  │
//! └──────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! Each simulator attaches its own metadata shape and HTTP routes; the queue
//! broker is purely in-memory and delivers through a dispatcher.

pub use blob::BlobStore;
pub use cache::{CacheGateway, CachedResponse};
pub use d1::{D1Database, D1Result, D1Statement};
pub use errors::{CacheError, D1Error, KvError, QueueError, R2Error, SitesError, StoreError};
pub use kv::{KvEntry, KvGateway, KvListOptions, KvListResult, KvPutOptions};
pub use meta::{ListQuery, MetaStore};
pub use migrate::{migrate_legacy_layout, namespace_db_path};
pub use queue::{
	QueueBatch, QueueBroker, QueueConsumer, QueueContentType, QueueDispatchResult,
	QueueDispatcher, QueueMessage,
};
pub use r2::{
	R2Conditional, R2GetOptions, R2GetResult, R2Gateway, R2HttpMetadata, R2ListOptions,
	R2ObjectMeta, R2PutOptions, R2Range, R2UploadedPart,
};
pub use routes::{StorageRoutes, persist_header_value};
pub use sites::SitesGateway;
use std::sync::Arc;

/// The write-once blob plane.
pub mod blob;
/// The HTTP cache simulator.
pub mod cache;
/// The relational pass-through simulator.
pub mod d1;
/// Error types for every product.
pub mod errors;
/// The key-value simulator.
pub mod kv;
/// The per-namespace metadata plane.
pub mod meta;
/// Legacy on-disk layout migration.
pub mod migrate;
/// Row types for the metadata databases.
pub mod models;
/// The queue broker.
pub mod queue;
/// The object-storage simulator.
pub mod r2;
/// The loopback HTTP surface.
pub mod routes;
pub(crate) mod schema;
/// The static-site simulator.
pub mod sites;

/// A millisecond clock, injectable so tests can drive time.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// The wall clock in unix millis.
pub fn wall_clock() -> Clock {
	Arc::new(|| {
		std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|elapsed| elapsed.as_millis() as i64)
			.unwrap_or(0)
	})
}

/// Unique keys naming each product's durable state on disk. These feed the
/// worker fingerprint and must match the child runtime's own constants.
pub mod unique_keys {
	pub const KV: &str = "ember-kv-namespace";
	pub const R2: &str = "ember-r2-bucket";
	pub const CACHE: &str = "ember-cache";
	pub const D1: &str = "ember-d1-database";
	pub const DURABLE_OBJECTS: &str = "ember-durable-object";
	pub const SITES: &str = "ember-site";
}
