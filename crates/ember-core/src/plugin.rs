// SPDX-License-Identifier: GPL-3.0

//! The plugin contract.
//!
//! Each product contributes a plugin: worker-visible bindings, host-side
//! node bindings (swapped for proxy stubs by the facade), and services for
//! the graph, preparing any disk state on the way. Plugins are composed,
//! never inherited; ordering is core first, storage middle, bindings last.

use crate::{
	bindings::WorkerBinding,
	config::{SharedConfig, WorkerConfig},
	graph::Service,
	modules::ModuleError,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by plugins while producing bindings or services.
#[derive(Debug, Error)]
pub enum PluginError {
	/// A plugin rejected its options.
	#[error("{0}")]
	Config(String),
	/// Disk preparation failed.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Module collection failed.
	#[error(transparent)]
	Module(#[from] ModuleError),
	/// A persistence spec failed to resolve.
	#[error(transparent)]
	Persist(#[from] ember_common::PersistError),
	/// A compatibility date was rejected.
	#[error(transparent)]
	Compat(#[from] ember_common::CompatError),
}

/// Everything a plugin sees while contributing to one worker.
pub struct PluginCtx<'a> {
	pub shared: &'a SharedConfig,
	pub worker: &'a WorkerConfig,
	pub worker_index: usize,
	/// The loopback server's bound port, once known.
	pub loopback_port: Option<u16>,
	/// The conventional persistence root.
	pub persist_root: &'a Path,
}

impl PluginCtx<'_> {
	/// The worker's effective name.
	pub fn worker_name(&self) -> String {
		self.worker
			.name
			.clone()
			.unwrap_or_else(|| format!("worker-{}", self.worker_index))
	}

	/// The loopback base URL, once the server is bound.
	pub fn loopback_url(&self) -> Option<String> {
		self.loopback_port.map(|port| format!("http://127.0.0.1:{port}"))
	}
}

/// What kind of proxy handle a node binding resolves to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NodeBindingKind {
	KvNamespace { namespace: String },
	R2Bucket { bucket: String },
	D1Database { database: String },
	Queue { queue: String },
	Service { service: String },
	DurableObjectNamespace { class_name: String },
	/// A plain value exposed as-is (constants, blobs).
	Plain { value: serde_json::Value },
}

/// A host-side placeholder the facade swaps for a live proxy stub.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeBinding {
	pub name: String,
	pub kind: NodeBindingKind,
}

/// A product plugin.
pub trait Plugin: Send + Sync {
	/// The plugin's namespace: its persistence subdirectory and route prefix.
	fn namespace(&self) -> &'static str;

	/// Worker-visible bindings for this worker.
	fn bindings(&self, ctx: &PluginCtx<'_>) -> Result<Vec<(String, WorkerBinding)>, PluginError>;

	/// Host-side placeholders for use outside user code.
	fn node_bindings(&self, _ctx: &PluginCtx<'_>) -> Vec<NodeBinding> {
		Vec::new()
	}

	/// Services this plugin adds to the graph, performing disk preparation
	/// (mkdir -p, legacy migration) as a side effect.
	fn services(&self, _ctx: &PluginCtx<'_>) -> Result<Vec<(String, Service)>, PluginError> {
		Ok(Vec::new())
	}
}

/// The conventional persistence root when none is configured.
pub fn default_persist_root() -> PathBuf {
	PathBuf::from(".ember")
}
