// SPDX-License-Identifier: GPL-3.0

//! The plugin registry.
//!
//! Each product contributes its bindings and disk preparation here; the
//! assembler composes them in order (core first, storage middle, bindings
//! last) into the service graph.

use ember_common::{PersistSpec, Persistence};
use ember_core::{
	DiskService, NodeBinding, NodeBindingKind, Plugin, PluginCtx, PluginError, Service,
	WorkerBinding,
};
use ember_storage::{SitesGateway, migrate_legacy_layout, unique_keys};

/// Every plugin, in composition order.
pub(crate) fn registry() -> Vec<Box<dyn Plugin>> {
	vec![
		Box::new(CorePlugin),
		Box::new(KvPlugin),
		Box::new(R2Plugin),
		Box::new(D1Plugin),
		Box::new(CachePlugin),
		Box::new(SitesPlugin),
		Box::new(DurableObjectsPlugin),
		Box::new(QueuesPlugin),
		Box::new(HyperdrivePlugin),
	]
}

/// Resolves a product's persistence and prepares its root directory.
fn prepare_persistence(
	spec: Option<&PersistSpec>,
	ctx: &PluginCtx<'_>,
	product: &str,
) -> Result<Persistence, PluginError> {
	let persistence = spec
		.cloned()
		.unwrap_or_default()
		.resolve(ctx.persist_root, product)?;
	if let Persistence::Disk(root) = &persistence {
		std::fs::create_dir_all(root)?;
	}
	Ok(persistence)
}

/// Constants, blobs, WebAssembly modules and service bindings.
pub(crate) struct CorePlugin;

impl Plugin for CorePlugin {
	fn namespace(&self) -> &'static str {
		"core"
	}

	fn bindings(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, WorkerBinding)>, PluginError> {
		let worker = ctx.worker;
		let mut bindings = Vec::new();
		for (name, value) in &worker.bindings {
			bindings.push((name.clone(), WorkerBinding::Json { value: value.clone() }));
		}
		for (name, path) in &worker.text_blobs {
			let value = std::fs::read_to_string(path)?;
			bindings.push((name.clone(), WorkerBinding::Text { value }));
		}
		for (name, path) in &worker.data_blobs {
			let value = std::fs::read(path)?;
			bindings.push((name.clone(), WorkerBinding::Data { value }));
		}
		for (name, path) in &worker.wasm_modules {
			bindings.push((name.clone(), WorkerBinding::WasmModule { path: path.clone() }));
		}
		for (name, service) in &worker.service_bindings {
			bindings.push((name.clone(), WorkerBinding::Service { service: service.clone() }));
		}
		Ok(bindings)
	}

	fn node_bindings(&self, ctx: &PluginCtx<'_>) -> Vec<NodeBinding> {
		ctx.worker
			.bindings
			.iter()
			.map(|(name, value)| NodeBinding {
				name: name.clone(),
				kind: NodeBindingKind::Plain { value: value.clone() },
			})
			.collect()
	}
}

pub(crate) struct KvPlugin;

impl Plugin for KvPlugin {
	fn namespace(&self) -> &'static str {
		"kv"
	}

	fn bindings(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, WorkerBinding)>, PluginError> {
		Ok(ctx
			.worker
			.kv_namespaces
			.iter()
			.map(|namespace| {
				(
					namespace.clone(),
					WorkerBinding::KvNamespace { namespace: namespace.clone() },
				)
			})
			.collect())
	}

	fn node_bindings(&self, ctx: &PluginCtx<'_>) -> Vec<NodeBinding> {
		ctx.worker
			.kv_namespaces
			.iter()
			.map(|namespace| NodeBinding {
				name: namespace.clone(),
				kind: NodeBindingKind::KvNamespace { namespace: namespace.clone() },
			})
			.collect()
	}

	fn services(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, Service)>, PluginError> {
		if ctx.worker.kv_namespaces.is_empty() {
			return Ok(Vec::new());
		}
		let persistence =
			prepare_persistence(ctx.shared.kv_persist.as_ref(), ctx, self.namespace())?;
		if let Persistence::Disk(root) = &persistence {
			migrate_legacy_layout(root, unique_keys::KV, &ctx.worker.kv_namespaces);
		}
		Ok(Vec::new())
	}
}

pub(crate) struct R2Plugin;

impl Plugin for R2Plugin {
	fn namespace(&self) -> &'static str {
		"r2"
	}

	fn bindings(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, WorkerBinding)>, PluginError> {
		Ok(ctx
			.worker
			.r2_buckets
			.iter()
			.map(|bucket| (bucket.clone(), WorkerBinding::R2Bucket { bucket: bucket.clone() }))
			.collect())
	}

	fn node_bindings(&self, ctx: &PluginCtx<'_>) -> Vec<NodeBinding> {
		ctx.worker
			.r2_buckets
			.iter()
			.map(|bucket| NodeBinding {
				name: bucket.clone(),
				kind: NodeBindingKind::R2Bucket { bucket: bucket.clone() },
			})
			.collect()
	}

	fn services(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, Service)>, PluginError> {
		if ctx.worker.r2_buckets.is_empty() {
			return Ok(Vec::new());
		}
		let persistence =
			prepare_persistence(ctx.shared.r2_persist.as_ref(), ctx, self.namespace())?;
		if let Persistence::Disk(root) = &persistence {
			migrate_legacy_layout(root, unique_keys::R2, &ctx.worker.r2_buckets);
		}
		Ok(Vec::new())
	}
}

pub(crate) struct D1Plugin;

impl Plugin for D1Plugin {
	fn namespace(&self) -> &'static str {
		"d1"
	}

	fn bindings(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, WorkerBinding)>, PluginError> {
		Ok(ctx
			.worker
			.d1_databases
			.iter()
			.map(|database| {
				(database.clone(), WorkerBinding::D1Database { database: database.clone() })
			})
			.collect())
	}

	fn node_bindings(&self, ctx: &PluginCtx<'_>) -> Vec<NodeBinding> {
		ctx.worker
			.d1_databases
			.iter()
			.map(|database| NodeBinding {
				name: database.clone(),
				kind: NodeBindingKind::D1Database { database: database.clone() },
			})
			.collect()
	}

	fn services(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, Service)>, PluginError> {
		if !ctx.worker.d1_databases.is_empty() {
			prepare_persistence(ctx.shared.d1_persist.as_ref(), ctx, self.namespace())?;
		}
		Ok(Vec::new())
	}
}

pub(crate) struct CachePlugin;

impl Plugin for CachePlugin {
	fn namespace(&self) -> &'static str {
		"cache"
	}

	fn bindings(&self, _ctx: &PluginCtx<'_>) -> Result<Vec<(String, WorkerBinding)>, PluginError> {
		// The cache API is ambient; it has no named binding.
		Ok(Vec::new())
	}

	fn services(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, Service)>, PluginError> {
		prepare_persistence(ctx.shared.cache_persist.as_ref(), ctx, self.namespace())?;
		Ok(Vec::new())
	}
}

pub(crate) struct SitesPlugin;

impl SitesPlugin {
	/// The disk service name for a worker's site.
	pub(crate) fn service_name(worker_name: &str) -> String {
		format!("site:{worker_name}")
	}
}

impl Plugin for SitesPlugin {
	fn namespace(&self) -> &'static str {
		"sites"
	}

	fn bindings(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, WorkerBinding)>, PluginError> {
		let Some(site_path) = &ctx.worker.site_path else {
			return Ok(Vec::new());
		};
		let gateway = SitesGateway::new(
			site_path.clone(),
			&ctx.worker.site_include,
			&ctx.worker.site_exclude,
		)
		.map_err(|e| PluginError::Config(e.to_string()))?;
		let manifest = gateway.manifest().map_err(|e| PluginError::Config(e.to_string()))?;
		Ok(vec![
			(
				"__STATIC_CONTENT".to_string(),
				WorkerBinding::Service { service: Self::service_name(&ctx.worker_name()) },
			),
			(
				"__STATIC_CONTENT_MANIFEST".to_string(),
				WorkerBinding::Json {
					value: serde_json::to_value(manifest).expect("manifest serialises"),
				},
			),
		])
	}

	fn services(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, Service)>, PluginError> {
		let Some(site_path) = &ctx.worker.site_path else {
			return Ok(Vec::new());
		};
		Ok(vec![(
			Self::service_name(&ctx.worker_name()),
			Service::Disk(DiskService { path: site_path.clone(), writable: false }),
		)])
	}
}

pub(crate) struct DurableObjectsPlugin;

impl Plugin for DurableObjectsPlugin {
	fn namespace(&self) -> &'static str {
		"do"
	}

	fn bindings(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, WorkerBinding)>, PluginError> {
		Ok(ctx
			.worker
			.durable_objects
			.iter()
			.map(|(name, class_name)| {
				(
					name.clone(),
					WorkerBinding::DurableObjectNamespace {
						class_name: class_name.clone(),
						script_name: None,
					},
				)
			})
			.collect())
	}

	fn node_bindings(&self, ctx: &PluginCtx<'_>) -> Vec<NodeBinding> {
		ctx.worker
			.durable_objects
			.iter()
			.map(|(name, class_name)| NodeBinding {
				name: name.clone(),
				kind: NodeBindingKind::DurableObjectNamespace {
					class_name: class_name.clone(),
				},
			})
			.collect()
	}

	fn services(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, Service)>, PluginError> {
		if !ctx.worker.durable_objects.is_empty() {
			// Durable objects themselves run inside the runtime; the host
			// only prepares the directory their SQLite files land in.
			prepare_persistence(ctx.shared.durable_objects_persist.as_ref(), ctx, self.namespace())?;
		}
		Ok(Vec::new())
	}
}

pub(crate) struct QueuesPlugin;

impl Plugin for QueuesPlugin {
	fn namespace(&self) -> &'static str {
		"queues"
	}

	fn bindings(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, WorkerBinding)>, PluginError> {
		Ok(ctx
			.worker
			.queue_producers
			.iter()
			.map(|(name, queue)| (name.clone(), WorkerBinding::Queue { queue: queue.clone() }))
			.collect())
	}

	fn node_bindings(&self, ctx: &PluginCtx<'_>) -> Vec<NodeBinding> {
		ctx.worker
			.queue_producers
			.iter()
			.map(|(name, queue)| NodeBinding {
				name: name.clone(),
				kind: NodeBindingKind::Queue { queue: queue.clone() },
			})
			.collect()
	}
}

pub(crate) struct HyperdrivePlugin;

impl Plugin for HyperdrivePlugin {
	fn namespace(&self) -> &'static str {
		"hyperdrive"
	}

	fn bindings(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, WorkerBinding)>, PluginError> {
		Ok(ctx
			.worker
			.hyperdrives
			.iter()
			.map(|(name, connection_string)| {
				(
					name.clone(),
					WorkerBinding::Hyperdrive {
						connection_string: connection_string.clone(),
					},
				)
			})
			.collect())
	}
}
