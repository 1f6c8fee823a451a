// SPDX-License-Identifier: GPL-3.0

//! Layered configuration.
//!
//! A configuration is a layered record: defaults ◁ file-config (narrowed to
//! a named environment) ◁ programmatic options. Scalars override per field,
//! arrays concatenate at the layer where they are defined, and maps union
//! with the later layer winning per key.

use crate::{bindings::validate_unique_bindings, modules::ModuleRule};
use ember_common::PersistSpec;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while assembling a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Two bindings on one worker share a name.
	#[error("duplicate binding name `{0}` on worker `{1}`")]
	DuplicateBinding(String, String),
	/// The named environment does not exist in the file config.
	#[error("no environment named `{0}` in the configuration file")]
	UnknownEnvironment(String),
	/// A persistence field failed to resolve.
	#[error(transparent)]
	Persist(#[from] ember_common::PersistError),
	/// No worker defines a script or script path.
	#[error("worker `{0}` has neither inline script nor script path")]
	MissingScript(String),
}

/// A queue consumer declaration as written in options.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConsumerOptions {
	pub queue: String,
	pub max_batch_size: Option<usize>,
	pub max_batch_timeout_ms: Option<u64>,
	pub max_retries: Option<u32>,
	pub dead_letter_queue: Option<String>,
}

/// Per-worker options; every plugin reads its slice of this record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
	pub name: Option<String>,
	/// Inline script source.
	pub script: Option<String>,
	/// Script entrypoint on disk.
	pub script_path: Option<PathBuf>,
	/// Root against which module logical names are computed.
	pub modules_root: Option<PathBuf>,
	/// Rules mapping glob patterns to module kinds.
	pub module_rules: Vec<ModuleRule>,
	pub compatibility_date: Option<String>,
	pub compatibility_flags: Vec<String>,
	pub routes: Vec<String>,
	/// JSON constant bindings.
	pub bindings: IndexMap<String, serde_json::Value>,
	/// Text blob bindings, path-valued.
	pub text_blobs: IndexMap<String, PathBuf>,
	/// Binary blob bindings, path-valued.
	pub data_blobs: IndexMap<String, PathBuf>,
	/// WebAssembly module bindings, path-valued.
	pub wasm_modules: IndexMap<String, PathBuf>,
	/// Service bindings: binding name to service name.
	pub service_bindings: IndexMap<String, String>,
	pub kv_namespaces: Vec<String>,
	pub r2_buckets: Vec<String>,
	pub d1_databases: Vec<String>,
	/// Durable object bindings: binding name to class name.
	pub durable_objects: IndexMap<String, String>,
	/// Queue producer bindings: binding name to queue name.
	pub queue_producers: IndexMap<String, String>,
	pub queue_consumers: Vec<QueueConsumerOptions>,
	/// Hyperdrive bindings: binding name to connection string.
	pub hyperdrives: IndexMap<String, String>,
	pub site_path: Option<PathBuf>,
	pub site_include: Vec<String>,
	pub site_exclude: Vec<String>,
	/// Cron specs for scheduled triggers.
	pub crons: Vec<String>,
}

/// Options shared across every worker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SharedConfig {
	pub host: Option<String>,
	pub port: Option<u16>,
	pub inspector_port: Option<u16>,
	/// Path to the child runtime binary.
	pub runtime_path: Option<PathBuf>,
	/// The conventional persistence root used by `true`-valued persist specs.
	pub persist_root: Option<PathBuf>,
	pub kv_persist: Option<PersistSpec>,
	pub r2_persist: Option<PersistSpec>,
	pub cache_persist: Option<PersistSpec>,
	pub d1_persist: Option<PersistSpec>,
	pub durable_objects_persist: Option<PersistSpec>,
	/// Warn on first cache use (workers.dev-like environments).
	pub cache_warn_usage: Option<bool>,
}

/// The full configuration of one instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmberConfig {
	pub workers: Vec<WorkerConfig>,
	pub shared: SharedConfig,
}

/// Structured file configuration: a top-level layer plus named environments.
/// (Parsing the file format itself happens upstream; this is the shape that
/// arrives here.)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileConfig {
	pub config: EmberConfig,
	pub envs: IndexMap<String, EmberConfig>,
}

impl FileConfig {
	/// Narrows to `env`: the environment's layer merged over the top level.
	pub fn resolve(&self, env: Option<&str>) -> Result<EmberConfig, ConfigError> {
		match env {
			None => Ok(self.config.clone()),
			Some(name) => {
				let layer = self
					.envs
					.get(name)
					.ok_or_else(|| ConfigError::UnknownEnvironment(name.to_string()))?;
				Ok(layer.clone().merge_over(self.config.clone()))
			},
		}
	}
}

/// Per-field layering: scalars override, arrays concatenate, maps union.
pub trait Layer: Sized {
	/// Merges `self` (the later layer) over `base`.
	fn merge_over(self, base: Self) -> Self;
}

fn union<V>(base: IndexMap<String, V>, over: IndexMap<String, V>) -> IndexMap<String, V> {
	let mut merged = base;
	merged.extend(over);
	merged
}

fn concat<T>(mut base: Vec<T>, over: Vec<T>) -> Vec<T> {
	base.extend(over);
	base
}

impl Layer for WorkerConfig {
	fn merge_over(self, base: Self) -> Self {
		WorkerConfig {
			name: self.name.or(base.name),
			script: self.script.or(base.script),
			script_path: self.script_path.or(base.script_path),
			modules_root: self.modules_root.or(base.modules_root),
			module_rules: concat(base.module_rules, self.module_rules),
			compatibility_date: self.compatibility_date.or(base.compatibility_date),
			compatibility_flags: concat(base.compatibility_flags, self.compatibility_flags),
			routes: concat(base.routes, self.routes),
			bindings: union(base.bindings, self.bindings),
			text_blobs: union(base.text_blobs, self.text_blobs),
			data_blobs: union(base.data_blobs, self.data_blobs),
			wasm_modules: union(base.wasm_modules, self.wasm_modules),
			service_bindings: union(base.service_bindings, self.service_bindings),
			kv_namespaces: concat(base.kv_namespaces, self.kv_namespaces),
			r2_buckets: concat(base.r2_buckets, self.r2_buckets),
			d1_databases: concat(base.d1_databases, self.d1_databases),
			durable_objects: union(base.durable_objects, self.durable_objects),
			queue_producers: union(base.queue_producers, self.queue_producers),
			queue_consumers: concat(base.queue_consumers, self.queue_consumers),
			hyperdrives: union(base.hyperdrives, self.hyperdrives),
			site_path: self.site_path.or(base.site_path),
			site_include: concat(base.site_include, self.site_include),
			site_exclude: concat(base.site_exclude, self.site_exclude),
			crons: concat(base.crons, self.crons),
		}
	}
}

impl Layer for SharedConfig {
	fn merge_over(self, base: Self) -> Self {
		SharedConfig {
			host: self.host.or(base.host),
			port: self.port.or(base.port),
			inspector_port: self.inspector_port.or(base.inspector_port),
			runtime_path: self.runtime_path.or(base.runtime_path),
			persist_root: self.persist_root.or(base.persist_root),
			kv_persist: self.kv_persist.or(base.kv_persist),
			r2_persist: self.r2_persist.or(base.r2_persist),
			cache_persist: self.cache_persist.or(base.cache_persist),
			d1_persist: self.d1_persist.or(base.d1_persist),
			durable_objects_persist: self
				.durable_objects_persist
				.or(base.durable_objects_persist),
			cache_warn_usage: self.cache_warn_usage.or(base.cache_warn_usage),
		}
	}
}

impl Layer for EmberConfig {
	fn merge_over(self, base: Self) -> Self {
		// Workers merge pairwise by index; the longer list's tail survives.
		let mut workers = Vec::with_capacity(self.workers.len().max(base.workers.len()));
		let mut base_workers = base.workers.into_iter();
		let mut over_workers = self.workers.into_iter();
		loop {
			match (base_workers.next(), over_workers.next()) {
				(Some(b), Some(o)) => workers.push(o.merge_over(b)),
				(Some(b), None) => workers.push(b),
				(None, Some(o)) => workers.push(o),
				(None, None) => break,
			}
		}
		EmberConfig { workers, shared: self.shared.merge_over(base.shared) }
	}
}

impl EmberConfig {
	/// Assembles the effective configuration:
	/// programmatic over (file ⊗ env) over defaults.
	pub fn merged(
		defaults: EmberConfig,
		file: Option<&FileConfig>,
		env: Option<&str>,
		programmatic: EmberConfig,
	) -> Result<EmberConfig, ConfigError> {
		let mut merged = defaults;
		if let Some(file) = file {
			merged = file.resolve(env)?.merge_over(merged);
		}
		merged = programmatic.merge_over(merged);
		merged.validate()?;
		Ok(merged)
	}

	/// Validates invariants that hold regardless of plugins: unique binding
	/// names per worker and a script for every worker.
	pub fn validate(&self) -> Result<(), ConfigError> {
		for (index, worker) in self.workers.iter().enumerate() {
			let name = worker
				.name
				.clone()
				.unwrap_or_else(|| format!("worker-{index}"));
			if worker.script.is_none() && worker.script_path.is_none() {
				return Err(ConfigError::MissingScript(name));
			}
			validate_unique_bindings(worker)
				.map_err(|binding| ConfigError::DuplicateBinding(binding, name.clone()))?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn worker(name: &str) -> WorkerConfig {
		WorkerConfig {
			name: Some(name.into()),
			script: Some("export default {}".into()),
			..Default::default()
		}
	}

	#[test]
	fn scalars_override_per_field() {
		let base = WorkerConfig {
			compatibility_date: Some("2024-01-01".into()),
			modules_root: Some("/base".into()),
			..worker("base")
		};
		let over = WorkerConfig {
			compatibility_date: Some("2024-06-01".into()),
			name: None,
			script: None,
			..Default::default()
		};
		let merged = over.merge_over(base);
		assert_eq!(merged.compatibility_date.as_deref(), Some("2024-06-01"));
		// Unset fields fall through to the base layer.
		assert_eq!(merged.name.as_deref(), Some("base"));
		assert_eq!(merged.modules_root, Some("/base".into()));
	}

	#[test]
	fn arrays_concatenate_at_their_source_layer() {
		let base = WorkerConfig {
			kv_namespaces: vec!["A".into()],
			compatibility_flags: vec!["nodejs_compat".into()],
			..worker("w")
		};
		let over = WorkerConfig {
			kv_namespaces: vec!["B".into(), "C".into()],
			..Default::default()
		};
		let merged = over.merge_over(base);
		assert_eq!(merged.kv_namespaces, vec!["A", "B", "C"]);
		assert_eq!(merged.compatibility_flags, vec!["nodejs_compat"]);
	}

	#[test]
	fn maps_union_with_the_later_layer_winning() {
		let base = WorkerConfig {
			bindings: IndexMap::from([
				("KEEP".to_string(), serde_json::json!(1)),
				("SHADOWED".to_string(), serde_json::json!("old")),
			]),
			..worker("w")
		};
		let over = WorkerConfig {
			bindings: IndexMap::from([
				("SHADOWED".to_string(), serde_json::json!("new")),
				("ADDED".to_string(), serde_json::json!(true)),
			]),
			..Default::default()
		};
		let merged = over.merge_over(base);
		assert_eq!(merged.bindings["KEEP"], serde_json::json!(1));
		assert_eq!(merged.bindings["SHADOWED"], serde_json::json!("new"));
		assert_eq!(merged.bindings["ADDED"], serde_json::json!(true));
	}

	#[test]
	fn full_layering_order_holds() {
		let defaults = EmberConfig {
			workers: vec![WorkerConfig {
				compatibility_date: Some("2023-01-01".into()),
				kv_namespaces: vec!["DEFAULTS".into()],
				..worker("w")
			}],
			..Default::default()
		};
		let file = FileConfig {
			config: EmberConfig {
				workers: vec![WorkerConfig {
					compatibility_date: Some("2024-01-01".into()),
					kv_namespaces: vec!["FILE".into()],
					..Default::default()
				}],
				..Default::default()
			},
			envs: IndexMap::from([(
				"staging".to_string(),
				EmberConfig {
					workers: vec![WorkerConfig {
						kv_namespaces: vec!["STAGING".into()],
						..Default::default()
					}],
					..Default::default()
				},
			)]),
		};
		let programmatic = EmberConfig {
			workers: vec![WorkerConfig {
				kv_namespaces: vec!["PROG".into()],
				..Default::default()
			}],
			..Default::default()
		};

		let merged =
			EmberConfig::merged(defaults, Some(&file), Some("staging"), programmatic).unwrap();
		let worker = &merged.workers[0];
		// programmatic over (file ⊗ env) over defaults.
		assert_eq!(worker.compatibility_date.as_deref(), Some("2024-01-01"));
		assert_eq!(worker.kv_namespaces, vec!["DEFAULTS", "FILE", "STAGING", "PROG"]);
	}

	#[test]
	fn unknown_environment_fails() {
		let file = FileConfig::default();
		let result = EmberConfig::merged(
			EmberConfig { workers: vec![worker("w")], ..Default::default() },
			Some(&file),
			Some("missing"),
			EmberConfig::default(),
		);
		assert!(matches!(result, Err(ConfigError::UnknownEnvironment(name)) if name == "missing"));
	}

	#[test]
	fn workers_without_scripts_fail_validation() {
		let config = EmberConfig {
			workers: vec![WorkerConfig { name: Some("w".into()), ..Default::default() }],
			..Default::default()
		};
		assert!(matches!(config.validate(), Err(ConfigError::MissingScript(name)) if name == "w"));
	}

	#[test]
	fn extra_programmatic_workers_survive() {
		let merged = EmberConfig::merged(
			EmberConfig { workers: vec![worker("a")], ..Default::default() },
			None,
			None,
			EmberConfig { workers: vec![WorkerConfig::default(), worker("b")], ..Default::default() },
		)
		.unwrap();
		assert_eq!(merged.workers.len(), 2);
		assert_eq!(merged.workers[1].name.as_deref(), Some("b"));
	}
}
