// SPDX-License-Identifier: GPL-3.0

//! Worker bindings: the names injected into a user worker's `env`.

use crate::config::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A single binding; exactly one of these shapes per name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerBinding {
	/// A JSON constant.
	Json { value: serde_json::Value },
	/// A text blob.
	Text { value: String },
	/// A binary blob.
	Data { value: Vec<u8> },
	/// A compiled WebAssembly module, loaded from disk by the runtime.
	WasmModule { path: PathBuf },
	/// A reference to another service in the graph.
	Service { service: String },
	/// A KV namespace.
	KvNamespace { namespace: String },
	/// An R2 bucket.
	R2Bucket { bucket: String },
	/// A relational database.
	D1Database { database: String },
	/// A durable-object namespace.
	DurableObjectNamespace {
		class_name: String,
		/// The worker defining the class; the binding's own worker when absent.
		script_name: Option<String>,
	},
	/// A queue producer.
	Queue { queue: String },
	/// An external-database record.
	Hyperdrive { connection_string: String },
}

/// Checks that no binding name appears twice across a worker's binding
/// sources; returns the offending name on failure.
pub fn validate_unique_bindings(worker: &WorkerConfig) -> Result<(), String> {
	let mut seen = std::collections::HashSet::new();
	let names = worker
		.bindings
		.keys()
		.chain(worker.text_blobs.keys())
		.chain(worker.data_blobs.keys())
		.chain(worker.wasm_modules.keys())
		.chain(worker.service_bindings.keys())
		.chain(worker.durable_objects.keys())
		.chain(worker.queue_producers.keys())
		.chain(worker.hyperdrives.keys())
		.chain(worker.kv_namespaces.iter())
		.chain(worker.r2_buckets.iter())
		.chain(worker.d1_databases.iter());
	for name in names {
		if !seen.insert(name.clone()) {
			return Err(name.clone());
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use indexmap::IndexMap;

	#[test]
	fn duplicate_names_across_sources_are_caught() {
		let worker = WorkerConfig {
			kv_namespaces: vec!["STORE".into()],
			service_bindings: IndexMap::from([("STORE".to_string(), "other".to_string())]),
			..Default::default()
		};
		assert_eq!(validate_unique_bindings(&worker), Err("STORE".to_string()));
	}

	#[test]
	fn distinct_names_pass() {
		let worker = WorkerConfig {
			kv_namespaces: vec!["KV".into()],
			r2_buckets: vec!["BUCKET".into()],
			bindings: IndexMap::from([("FLAG".to_string(), serde_json::json!(true))]),
			..Default::default()
		};
		assert!(validate_unique_bindings(&worker).is_ok());
	}

	#[test]
	fn bindings_serialise_with_a_type_tag() {
		let binding = WorkerBinding::KvNamespace { namespace: "NS".into() };
		let value = serde_json::to_value(&binding).unwrap();
		assert_eq!(value["type"], "kvNamespace");
		assert_eq!(value["namespace"], "NS");
	}
}
