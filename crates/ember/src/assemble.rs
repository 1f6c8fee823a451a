// SPDX-License-Identifier: GPL-3.0

//! Turns a merged configuration into a validated service graph.
//!
//! Each plugin contributes bindings and services per worker; the assembler
//! adds the worker services themselves (modules collected, compatibility
//! dates validated, source maps registered), the runtime-internal proxy
//! server worker, the entry and proxy sockets, and the loopback external.

use crate::{errors::EmberError, plugins};
use chrono::NaiveDate;
use ember_common::validate_compatibility_date;
use ember_core::{
	ENTRY_SOCKET, EmberConfig, ExternalService, LOOPBACK_SERVICE, ModuleDef, ModuleKind,
	NodeBinding, PluginCtx, Service, ServiceGraph, SocketSpec, SourceMapRegistry, WorkerConfig,
	WorkerService, WorkerStorage, collect_modules, plugin::default_persist_root,
};
use ember_storage::{QueueConsumer, SitesGateway};
use std::path::{Path, PathBuf};

/// The newest compatibility date the bundled runtime implements.
pub const SUPPORTED_COMPAT_DATE: &str = "2026-06-01";

/// The reserved runtime-internal proxy server worker.
pub(crate) const PROXY_SERVICE: &str = "ember:proxy";
/// The socket the proxy server listens on.
pub(crate) const PROXY_SOCKET: &str = "proxy";

/// Everything the facade needs from one assembly pass.
pub(crate) struct Assembled {
	pub graph: ServiceGraph,
	pub consumers: Vec<QueueConsumer>,
	pub sites: Vec<(String, SitesGateway)>,
	pub crons: Vec<String>,
	pub node_bindings: Vec<NodeBinding>,
}

fn worker_modules(
	worker: &WorkerConfig,
	modules_root: &Path,
	registry: &SourceMapRegistry,
	loopback_base: &str,
) -> Result<Vec<ModuleDef>, EmberError> {
	let mut modules = match &worker.script_path {
		Some(entry) => collect_modules(
			entry,
			worker.script.as_deref(),
			&worker.module_rules,
			modules_root,
		)?,
		None => {
			let script = worker.script.clone().unwrap_or_default();
			vec![ModuleDef {
				name: "worker.mjs".to_string(),
				kind: ModuleKind::ESModule,
				data: script.into_bytes(),
				source_map_id: None,
			}]
		},
	};

	// Rewrite trailing source-map URLs so runtime stack traces resolve on
	// the host without exposing filesystem paths.
	for module in &mut modules {
		if !matches!(module.kind, ModuleKind::ESModule | ModuleKind::CommonJS) {
			continue;
		}
		let Ok(mut text) = String::from_utf8(module.data.clone()) else { continue };
		let dir = modules_root
			.join(&module.name)
			.parent()
			.map(Path::to_path_buf)
			.unwrap_or_else(|| modules_root.to_path_buf());
		if let Some(id) = registry.register_script(&mut text, &dir, loopback_base) {
			module.source_map_id = Some(id);
			module.data = text.into_bytes();
		}
	}
	Ok(modules)
}

fn worker_storage(config: &EmberConfig, persist_root: &Path) -> Result<WorkerStorage, EmberError> {
	let spec = config.shared.durable_objects_persist.clone().unwrap_or_default();
	Ok(match spec.resolve(persist_root, "do").map_err(ember_core::PluginError::from)? {
		ember_common::Persistence::Memory => WorkerStorage::Memory,
		ember_common::Persistence::Disk(path) => WorkerStorage::Disk { path },
	})
}

pub(crate) fn assemble(
	config: &EmberConfig,
	loopback_port: u16,
	registry: &SourceMapRegistry,
	today: NaiveDate,
) -> Result<Assembled, EmberError> {
	config.validate()?;
	let persist_root = config
		.shared
		.persist_root
		.clone()
		.unwrap_or_else(default_persist_root);
	let loopback_base = format!("http://127.0.0.1:{loopback_port}");
	let registry_plugins = plugins::registry();

	let mut graph = ServiceGraph::default();
	let mut consumers = Vec::new();
	let mut sites = Vec::new();
	let mut crons = Vec::new();
	let mut node_bindings = Vec::new();
	let mut extra_services: Vec<(String, Service)> = Vec::new();

	for (worker_index, worker) in config.workers.iter().enumerate() {
		let ctx = PluginCtx {
			shared: &config.shared,
			worker,
			worker_index,
			loopback_port: Some(loopback_port),
			persist_root: &persist_root,
		};
		let worker_name = ctx.worker_name();

		let compatibility_date = worker
			.compatibility_date
			.as_deref()
			.map(|date| validate_compatibility_date(date, SUPPORTED_COMPAT_DATE, today))
			.transpose()?;

		let modules_root = worker
			.modules_root
			.clone()
			.or_else(|| {
				worker
					.script_path
					.as_ref()
					.and_then(|path| path.parent().map(Path::to_path_buf))
			})
			.unwrap_or_else(|| PathBuf::from("."));
		let modules = worker_modules(worker, &modules_root, registry, &loopback_base)?;

		let mut bindings = Vec::new();
		for plugin in &registry_plugins {
			bindings.extend(plugin.bindings(&ctx)?);
			node_bindings.extend(plugin.node_bindings(&ctx));
			extra_services.extend(plugin.services(&ctx)?);
		}

		let storage = if worker.durable_objects.is_empty() {
			WorkerStorage::None
		} else {
			worker_storage(config, &persist_root)?
		};

		graph.add_service(
			&worker_name,
			Service::Worker(WorkerService {
				compatibility_date,
				compatibility_flags: worker.compatibility_flags.clone(),
				modules,
				bindings,
				durable_object_classes: worker.durable_objects.values().cloned().collect(),
				storage,
			}),
		)?;

		if let Some(site_path) = &worker.site_path {
			sites.push((
				plugins::SitesPlugin::service_name(&worker_name),
				SitesGateway::new(
					site_path.clone(),
					&worker.site_include,
					&worker.site_exclude,
				)?,
			));
		}
		crons.extend(worker.crons.iter().cloned());
		consumers.extend(worker.queue_consumers.iter().map(|options| QueueConsumer {
			queue: options.queue.clone(),
			max_batch_size: options.max_batch_size.unwrap_or(5),
			max_batch_timeout_ms: options.max_batch_timeout_ms.unwrap_or(1000),
			max_retries: options.max_retries.unwrap_or(2),
			dead_letter_queue: options.dead_letter_queue.clone(),
		}));
	}

	for (name, service) in extra_services {
		graph.add_service(&name, service)?;
	}

	// The runtime-internal proxy server hosts the bridge's remote end.
	graph.add_service(PROXY_SERVICE, Service::Worker(WorkerService::default()))?;

	// Simulators always ride the loopback: the cache simulator is ambient.
	graph.add_service(
		LOOPBACK_SERVICE,
		Service::External(ExternalService {
			address: format!("127.0.0.1:{loopback_port}"),
			https: false,
		}),
	)?;

	let entry_service = config
		.workers
		.first()
		.map(|worker| {
			worker
				.name
				.clone()
				.unwrap_or_else(|| "worker-0".to_string())
		})
		.unwrap_or_else(|| PROXY_SERVICE.to_string());
	graph.add_socket(SocketSpec {
		name: ENTRY_SOCKET.to_string(),
		host: config.shared.host.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
		port: config.shared.port,
		service: entry_service,
	});
	graph.add_socket(SocketSpec {
		name: PROXY_SOCKET.to_string(),
		host: "127.0.0.1".to_string(),
		port: None,
		service: PROXY_SERVICE.to_string(),
	});

	graph.validate(true)?;

	Ok(Assembled { graph, consumers, sites, crons, node_bindings })
}

#[cfg(test)]
mod tests {
	use super::*;
	use ember_core::{SharedConfig, WorkerBinding};

	fn today() -> NaiveDate {
		NaiveDate::from_ymd_opt(2026, 6, 15).unwrap()
	}

	fn config() -> EmberConfig {
		EmberConfig {
			workers: vec![WorkerConfig {
				name: Some("api".into()),
				script: Some("export default {}".into()),
				compatibility_date: Some("2026-01-01".into()),
				kv_namespaces: vec!["NS".into()],
				crons: vec!["*/5 * * * *".into()],
				..Default::default()
			}],
			shared: SharedConfig::default(),
		}
	}

	#[test]
	fn assembly_produces_a_valid_graph() {
		let registry = SourceMapRegistry::new();
		let assembled = assemble(&config(), 3111, &registry, today()).unwrap();

		let graph = &assembled.graph;
		assert!(graph.services.contains_key("api"));
		assert!(graph.services.contains_key(PROXY_SERVICE));
		assert!(graph.services.contains_key(LOOPBACK_SERVICE));
		assert_eq!(graph.sockets[0].name, ENTRY_SOCKET);
		assert_eq!(graph.sockets[0].service, "api");
		assert_eq!(assembled.crons, vec!["*/5 * * * *"]);

		let Service::Worker(worker) = &graph.services["api"] else {
			panic!("expected a worker service");
		};
		assert_eq!(worker.compatibility_date.as_deref(), Some("2026-01-01"));
		assert!(worker.bindings.iter().any(|(name, binding)| {
			name == "NS" && matches!(binding, WorkerBinding::KvNamespace { .. })
		}));
		assert_eq!(worker.modules.len(), 1);
	}

	#[test]
	fn future_compatibility_dates_abort_assembly() {
		let mut config = config();
		config.workers[0].compatibility_date = Some("2026-07-01".into());
		let registry = SourceMapRegistry::new();
		let result = assemble(&config, 3111, &registry, today());
		assert!(matches!(
			result,
			Err(EmberError::Compat(ember_common::CompatError::FutureDate { .. }))
		));
	}

	#[test]
	fn unsupported_dates_downgrade() {
		let mut config = config();
		// After the supported maximum but not in the future.
		config.workers[0].compatibility_date = Some("2026-06-10".into());
		let registry = SourceMapRegistry::new();
		let assembled = assemble(&config, 3111, &registry, today()).unwrap();
		let Service::Worker(worker) = &assembled.graph.services["api"] else {
			panic!("expected a worker service");
		};
		assert_eq!(worker.compatibility_date.as_deref(), Some(SUPPORTED_COMPAT_DATE));
	}

	#[test]
	fn queue_consumer_defaults_fill_in() {
		let mut config = config();
		config.workers[0].queue_consumers =
			vec![ember_core::QueueConsumerOptions { queue: "q".into(), ..Default::default() }];
		let registry = SourceMapRegistry::new();
		let assembled = assemble(&config, 3111, &registry, today()).unwrap();
		assert_eq!(assembled.consumers.len(), 1);
		assert_eq!(assembled.consumers[0].max_batch_size, 5);
		assert_eq!(assembled.consumers[0].max_retries, 2);
	}

	#[test]
	fn zero_worker_configs_still_assemble() {
		let registry = SourceMapRegistry::new();
		let assembled =
			assemble(&EmberConfig::default(), 3111, &registry, today()).unwrap();
		// The entry socket falls back to the proxy worker.
		assert_eq!(assembled.graph.sockets[0].service, PROXY_SERVICE);
	}
}
