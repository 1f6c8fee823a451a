// SPDX-License-Identifier: GPL-3.0

//! The loopback HTTP surface for the storage simulators.
//!
//! Each product nests its routes under its own prefix; the persistence root
//! travels in the `MF-Persist` header so one router serves every namespace
//! and storage mode. Gateways are constructed on first use and cached per
//! `(persistence, namespace)` pair, which is what keeps two requests against
//! the same in-memory namespace looking at the same data.

mod cache;
mod d1;
mod kv;
mod queue;
mod r2;
mod sites;

use crate::{
	BlobStore, CacheGateway, Clock, D1Database, KvGateway, MetaStore, QueueBroker, R2Gateway,
	SitesGateway,
	errors::{D1Error, KvError, R2Error, StoreError},
	migrate::{migrate_legacy_layout, namespace_db_path},
	unique_keys,
};
use axum::{
	Router,
	http::HeaderMap,
	response::{IntoResponse, Response},
};
use ember_common::{PersistSpec, Persistence};
use std::{collections::HashMap, path::Path, sync::Arc};
use tokio::sync::Mutex;

/// Wire header names shared with the child runtime.
pub mod headers {
	pub const PERSIST: &str = "MF-Persist";
	pub const EXPIRATION: &str = "MF-Expiration";
	pub const EXPIRATION_TTL: &str = "MF-Expiration-TTL";
	pub const METADATA: &str = "MF-Metadata";
	pub const CACHE_TTL: &str = "MF-Cache-TTL";
	pub const KV_METADATA: &str = "CF-KV-Metadata";
	pub const R2_REQUEST: &str = "CF-R2-Request";
	pub const R2_METADATA_SIZE: &str = "CF-R2-Metadata-Size";
	pub const R2_ERROR: &str = "CF-R2-Error";
	pub const CACHE_NAMESPACE: &str = "CF-Cache-Namespace";
	pub const CACHE_STATUS: &str = "CF-Cache-Status";
	pub const CACHE_STORED: &str = "CF-Cache-Stored";
	pub const QUEUE_CONTENT_TYPE: &str = "MF-Queue-Content-Type";
	pub const QUEUE_BATCH_COUNT: &str = "MF-Queue-Batch-Count";
	pub const QUEUE_BATCH_BYTES: &str = "MF-Queue-Batch-Bytes";
}

/// The value the facade sends in `MF-Persist` for a resolved persistence.
pub fn persist_header_value(persistence: &Persistence) -> String {
	match persistence {
		Persistence::Memory => "memory:".to_string(),
		Persistence::Disk(path) => path.display().to_string(),
	}
}

fn persistence_from(request_headers: &HeaderMap) -> Persistence {
	match request_headers.get(headers::PERSIST).and_then(|value| value.to_str().ok()) {
		None | Some("") => Persistence::Memory,
		Some(value) => PersistSpec::Location(value.to_string())
			.resolve(Path::new(""), "")
			.unwrap_or(Persistence::Memory),
	}
}

type GatewayKey = (Persistence, String);

pub(crate) struct StorageState {
	pub(crate) clock: Clock,
	cache_warn_usage: bool,
	kv: Mutex<HashMap<GatewayKey, KvGateway>>,
	r2: Mutex<HashMap<GatewayKey, R2Gateway>>,
	cache: Mutex<HashMap<GatewayKey, CacheGateway>>,
	d1: Mutex<HashMap<GatewayKey, D1Database>>,
	sites: std::sync::Mutex<HashMap<String, SitesGateway>>,
	queue_broker: std::sync::Mutex<Option<QueueBroker>>,
}

/// The assembled loopback surface.
#[derive(Clone)]
pub struct StorageRoutes {
	state: Arc<StorageState>,
}

impl StorageRoutes {
	/// Creates the surface; `cache_warn_usage` arms the one-shot cache
	/// usage warning for workers.dev-like environments.
	pub fn new(clock: Clock, cache_warn_usage: bool) -> Self {
		Self {
			state: Arc::new(StorageState {
				clock,
				cache_warn_usage,
				kv: Mutex::new(HashMap::new()),
				r2: Mutex::new(HashMap::new()),
				cache: Mutex::new(HashMap::new()),
				d1: Mutex::new(HashMap::new()),
				sites: std::sync::Mutex::new(HashMap::new()),
				queue_broker: std::sync::Mutex::new(None),
			}),
		}
	}

	/// Registers a site gateway under its binding name.
	pub fn register_site(&self, name: &str, gateway: SitesGateway) {
		self.state.sites.lock().expect("sites map poisoned").insert(name.to_string(), gateway);
	}

	/// Registers the instance's queue broker.
	pub fn register_queue_broker(&self, broker: QueueBroker) {
		*self.state.queue_broker.lock().expect("broker slot poisoned") = Some(broker);
	}

	/// Assembles the axum router with every product nested under its prefix.
	pub fn router(&self) -> Router {
		Router::new()
			.nest("/kv", kv::router(self.state.clone()))
			.nest("/r2", r2::router(self.state.clone()))
			.nest("/cache", cache::router(self.state.clone()))
			.nest("/queues", queue::router(self.state.clone()))
			.nest("/d1", d1::router(self.state.clone()))
			.nest("/sites", sites::router(self.state.clone()))
	}
}

impl StorageState {
	pub(crate) async fn kv_gateway(
		&self,
		namespace: &str,
		request_headers: &HeaderMap,
	) -> Result<KvGateway, KvError> {
		let persistence = persistence_from(request_headers);
		let key = (persistence.clone(), namespace.to_string());
		let mut gateways = self.kv.lock().await;
		if let Some(gateway) = gateways.get(&key) {
			return Ok(gateway.clone());
		}
		let gateway = match &persistence {
			Persistence::Memory => KvGateway::new(
				Arc::new(BlobStore::in_memory()),
				MetaStore::in_memory().await?,
				self.clock.clone(),
			),
			Persistence::Disk(root) => {
				migrate_legacy_layout(root, unique_keys::KV, &[namespace.to_string()]);
				let meta = MetaStore::open(Some(&namespace_db_path(
					root,
					unique_keys::KV,
					namespace,
				)))
				.await?;
				KvGateway::new(Arc::new(BlobStore::on_disk(root)), meta, self.clock.clone())
			},
		};
		gateways.insert(key, gateway.clone());
		Ok(gateway)
	}

	pub(crate) async fn r2_gateway(
		&self,
		bucket: &str,
		request_headers: &HeaderMap,
	) -> Result<R2Gateway, R2Error> {
		let persistence = persistence_from(request_headers);
		let key = (persistence.clone(), bucket.to_string());
		let mut gateways = self.r2.lock().await;
		if let Some(gateway) = gateways.get(&key) {
			return Ok(gateway.clone());
		}
		let gateway = match &persistence {
			Persistence::Memory => R2Gateway::new(
				Arc::new(BlobStore::in_memory()),
				MetaStore::in_memory().await?,
				self.clock.clone(),
			),
			Persistence::Disk(root) => {
				migrate_legacy_layout(root, unique_keys::R2, &[bucket.to_string()]);
				let meta = MetaStore::open(Some(&namespace_db_path(
					root,
					unique_keys::R2,
					bucket,
				)))
				.await?;
				R2Gateway::new(Arc::new(BlobStore::on_disk(root)), meta, self.clock.clone())
			},
		};
		gateways.insert(key, gateway.clone());
		Ok(gateway)
	}

	pub(crate) async fn cache_gateway(
		&self,
		request_headers: &HeaderMap,
	) -> Result<CacheGateway, StoreError> {
		let persistence = persistence_from(request_headers);
		// The default partition is distinguished from named caches.
		let partition = request_headers
			.get(headers::CACHE_NAMESPACE)
			.and_then(|value| value.to_str().ok())
			.map(|name| format!("named/{name}"))
			.unwrap_or_else(|| "default".to_string());
		let key = (persistence.clone(), partition.clone());
		let mut gateways = self.cache.lock().await;
		if let Some(gateway) = gateways.get(&key) {
			return Ok(gateway.clone());
		}
		let gateway = match &persistence {
			Persistence::Memory => CacheGateway::new(
				Arc::new(BlobStore::in_memory()),
				MetaStore::in_memory().await?,
				self.clock.clone(),
				self.cache_warn_usage,
			),
			Persistence::Disk(root) => {
				let meta = MetaStore::open(Some(&namespace_db_path(
					root,
					unique_keys::CACHE,
					&partition,
				)))
				.await?;
				CacheGateway::new(
					Arc::new(BlobStore::on_disk(root)),
					meta,
					self.clock.clone(),
					self.cache_warn_usage,
				)
			},
		};
		gateways.insert(key, gateway.clone());
		Ok(gateway)
	}

	pub(crate) async fn d1_database(
		&self,
		database: &str,
		request_headers: &HeaderMap,
	) -> Result<D1Database, D1Error> {
		let persistence = persistence_from(request_headers);
		let key = (persistence.clone(), database.to_string());
		let mut databases = self.d1.lock().await;
		if let Some(db) = databases.get(&key) {
			return Ok(db.clone());
		}
		let db = match &persistence {
			Persistence::Memory => D1Database::open(None)?,
			Persistence::Disk(root) => D1Database::open(Some(&namespace_db_path(
				root,
				unique_keys::D1,
				database,
			)))?,
		};
		databases.insert(key, db.clone());
		Ok(db)
	}

	pub(crate) fn site(&self, name: &str) -> Option<SitesGateway> {
		self.sites.lock().expect("sites map poisoned").get(name).cloned()
	}

	pub(crate) fn queue_broker(&self) -> Option<QueueBroker> {
		self.queue_broker.lock().expect("broker slot poisoned").clone()
	}
}

/// Encodes a product error as the standard JSON envelope.
pub(crate) fn error_envelope(status: u16, message: String, v4code: u32) -> Response {
	let body = serde_json::json!({ "message": message, "v4code": v4code });
	(
		axum::http::StatusCode::from_u16(status)
			.unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR),
		axum::Json(body),
	)
		.into_response()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn persist_header_roundtrip() {
		let memory = Persistence::Memory;
		let disk = Persistence::Disk("/data/kv".into());

		let mut map = HeaderMap::new();
		map.insert(headers::PERSIST, persist_header_value(&memory).parse().unwrap());
		assert_eq!(persistence_from(&map), Persistence::Memory);

		let mut map = HeaderMap::new();
		map.insert(headers::PERSIST, persist_header_value(&disk).parse().unwrap());
		assert_eq!(persistence_from(&map), disk);

		// No header means memory.
		assert_eq!(persistence_from(&HeaderMap::new()), Persistence::Memory);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn memory_gateways_are_shared_per_namespace() {
		let routes = StorageRoutes::new(crate::wall_clock(), false);
		let headers = HeaderMap::new();
		let a = routes.state.kv_gateway("NS", &headers).await.unwrap();
		a.put("k", bytes::Bytes::from_static(b"v"), Default::default()).await.unwrap();

		// A second lookup of the same namespace sees the same data.
		let b = routes.state.kv_gateway("NS", &headers).await.unwrap();
		assert!(b.get("k", None).await.unwrap().is_some());

		// A different namespace does not.
		let c = routes.state.kv_gateway("OTHER", &headers).await.unwrap();
		assert!(c.get("k", None).await.unwrap().is_none());
	}
}
