// SPDX-License-Identifier: GPL-3.0

//! The declarative service graph handed to the child runtime.
//!
//! A graph is an ordered collection of named services (workers, externals,
//! network policies, disk directories) plus the sockets the runtime must
//! bind. The assembled graph serialises onto the runtime's stdin.

use crate::{bindings::WorkerBinding, modules::ModuleDef};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Name of the entry socket every graph must expose.
pub const ENTRY_SOCKET: &str = "entry";
/// Name of the loopback external service simulators call back through.
pub const LOOPBACK_SERVICE: &str = "loopback";

/// Errors raised while assembling or validating a graph.
#[derive(Debug, Error)]
pub enum GraphError {
	/// Two services share a name.
	#[error("duplicate service name `{0}`")]
	DuplicateService(String),
	/// A binding or socket references a service that is not in the graph.
	#[error("service `{missing}` referenced by `{referenced_by}` does not exist")]
	MissingService {
		missing: String,
		referenced_by: String,
	},
	/// No entry socket was declared.
	#[error("the graph declares no `{ENTRY_SOCKET}` socket")]
	MissingEntrySocket,
	/// A simulator is enabled but the loopback external is absent.
	#[error("simulators are enabled but the `{LOOPBACK_SERVICE}` external is missing")]
	MissingLoopback,
}

/// Where a worker's durable state lives.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WorkerStorage {
	/// No durable-object storage.
	#[default]
	None,
	/// Ephemeral in-process storage.
	Memory,
	/// SQLite files under the given directory.
	Disk { path: PathBuf },
}

/// A worker service: user code plus its bindings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerService {
	pub compatibility_date: Option<String>,
	pub compatibility_flags: Vec<String>,
	pub modules: Vec<ModuleDef>,
	pub bindings: Vec<(String, WorkerBinding)>,
	pub durable_object_classes: Vec<String>,
	pub storage: WorkerStorage,
}

/// An external server reachable over the network.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalService {
	/// `host:port`.
	pub address: String,
	/// Speak HTTPS to the peer.
	#[serde(default)]
	pub https: bool,
}

/// A network-access policy service.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkService {
	/// CIDR allow list.
	pub allow: Vec<String>,
	/// CIDR deny list.
	pub deny: Vec<String>,
	/// Trust the system's TLS roots.
	pub tls_trust_system: bool,
}

/// A directory exposed to the runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskService {
	/// Absolute path of the directory.
	pub path: PathBuf,
	/// Whether the runtime may write to it.
	pub writable: bool,
}

/// A named node of the graph; exactly one of the four shapes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Service {
	Worker(WorkerService),
	External(ExternalService),
	Network(NetworkService),
	Disk(DiskService),
}

/// A socket the runtime must bind and report.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketSpec {
	/// The socket name echoed in `listen` control messages.
	pub name: String,
	pub host: String,
	/// Fixed port, or `None` for an ephemeral one.
	pub port: Option<u16>,
	/// The service receiving this socket's traffic.
	pub service: String,
}

/// The assembled graph.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceGraph {
	pub services: IndexMap<String, Service>,
	pub sockets: Vec<SocketSpec>,
}

impl ServiceGraph {
	/// Adds a service, rejecting duplicate names.
	pub fn add_service(&mut self, name: &str, service: Service) -> Result<(), GraphError> {
		if self.services.contains_key(name) {
			return Err(GraphError::DuplicateService(name.to_string()));
		}
		self.services.insert(name.to_string(), service);
		Ok(())
	}

	/// Adds a socket.
	pub fn add_socket(&mut self, socket: SocketSpec) {
		self.sockets.push(socket);
	}

	/// Names of sockets the supervisor must wait on.
	pub fn required_sockets(&self) -> Vec<String> {
		self.sockets.iter().map(|socket| socket.name.clone()).collect()
	}

	/// Validates the graph invariants.
	///
	/// Names are unique by construction; this checks that the entry socket
	/// exists, every referenced service resolves, and the loopback external
	/// is present whenever a simulator is enabled.
	pub fn validate(&self, simulators_enabled: bool) -> Result<(), GraphError> {
		if !self.sockets.iter().any(|socket| socket.name == ENTRY_SOCKET) {
			return Err(GraphError::MissingEntrySocket);
		}
		for socket in &self.sockets {
			if !self.services.contains_key(&socket.service) {
				return Err(GraphError::MissingService {
					missing: socket.service.clone(),
					referenced_by: format!("socket `{}`", socket.name),
				});
			}
		}
		for (name, service) in &self.services {
			let Service::Worker(worker) = service else { continue };
			for (binding, shape) in &worker.bindings {
				if let WorkerBinding::Service { service: target } = shape &&
					!self.services.contains_key(target)
				{
					return Err(GraphError::MissingService {
						missing: target.clone(),
						referenced_by: format!("binding `{binding}` of `{name}`"),
					});
				}
			}
		}
		if simulators_enabled && !self.services.contains_key(LOOPBACK_SERVICE) {
			return Err(GraphError::MissingLoopback);
		}
		Ok(())
	}

	/// The stdin payload for the child runtime.
	pub fn serialize(&self) -> Vec<u8> {
		serde_json::to_vec(self).expect("graph serialises")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry_socket() -> SocketSpec {
		SocketSpec {
			name: ENTRY_SOCKET.into(),
			host: "127.0.0.1".into(),
			port: None,
			service: "core".into(),
		}
	}

	fn worker_with_binding(binding: Option<(&str, WorkerBinding)>) -> Service {
		Service::Worker(WorkerService {
			bindings: binding
				.map(|(name, shape)| vec![(name.to_string(), shape)])
				.unwrap_or_default(),
			..Default::default()
		})
	}

	#[test]
	fn duplicate_names_are_rejected() {
		let mut graph = ServiceGraph::default();
		graph.add_service("core", worker_with_binding(None)).unwrap();
		let result = graph.add_service("core", worker_with_binding(None));
		assert!(matches!(result, Err(GraphError::DuplicateService(name)) if name == "core"));
	}

	#[test]
	fn entry_socket_is_required() {
		let mut graph = ServiceGraph::default();
		graph.add_service("core", worker_with_binding(None)).unwrap();
		assert!(matches!(graph.validate(false), Err(GraphError::MissingEntrySocket)));

		graph.add_socket(entry_socket());
		assert!(graph.validate(false).is_ok());
	}

	#[test]
	fn dangling_service_references_are_rejected() {
		let mut graph = ServiceGraph::default();
		graph
			.add_service(
				"core",
				worker_with_binding(Some((
					"BACKEND",
					WorkerBinding::Service { service: "missing".into() },
				))),
			)
			.unwrap();
		graph.add_socket(entry_socket());
		assert!(matches!(
			graph.validate(false),
			Err(GraphError::MissingService { missing, .. }) if missing == "missing"
		));
	}

	#[test]
	fn loopback_is_required_with_simulators() {
		let mut graph = ServiceGraph::default();
		graph.add_service("core", worker_with_binding(None)).unwrap();
		graph.add_socket(entry_socket());
		assert!(matches!(graph.validate(true), Err(GraphError::MissingLoopback)));

		graph
			.add_service(
				LOOPBACK_SERVICE,
				Service::External(ExternalService {
					address: "127.0.0.1:3111".into(),
					https: false,
				}),
			)
			.unwrap();
		assert!(graph.validate(true).is_ok());
	}

	#[test]
	fn graphs_serialise_to_tagged_json() {
		let mut graph = ServiceGraph::default();
		graph
			.add_service(
				"files",
				Service::Disk(DiskService { path: "/srv/files".into(), writable: false }),
			)
			.unwrap();
		graph.add_socket(entry_socket());

		let value: serde_json::Value =
			serde_json::from_slice(&graph.serialize()).unwrap();
		assert_eq!(value["services"]["files"]["type"], "disk");
		assert_eq!(value["sockets"][0]["name"], "entry");
	}
}
