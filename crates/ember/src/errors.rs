// SPDX-License-Identifier: GPL-3.0

//! The facade's error type.

use thiserror::Error;

/// Errors surfaced by the [`crate::Ember`] instance.
#[derive(Debug, Error)]
pub enum EmberError {
	/// Configuration failed to merge or validate.
	#[error(transparent)]
	Config(#[from] ember_core::ConfigError),
	/// The service graph failed validation.
	#[error(transparent)]
	Graph(#[from] ember_core::GraphError),
	/// A plugin rejected its options.
	#[error(transparent)]
	Plugin(#[from] ember_core::PluginError),
	/// Module collection failed.
	#[error(transparent)]
	Module(#[from] ember_core::ModuleError),
	/// The compatibility date was rejected.
	#[error(transparent)]
	Compat(#[from] ember_common::CompatError),
	/// The runtime supervisor failed.
	#[error(transparent)]
	Supervisor(#[from] ember_core::SupervisorError),
	/// A cron spec was rejected.
	#[error(transparent)]
	Cron(#[from] ember_core::CronError),
	/// A scheduled event could not be delivered.
	#[error(transparent)]
	Scheduled(#[from] ember_core::DispatchError),
	/// The queue broker rejected its configuration.
	#[error(transparent)]
	Queue(#[from] ember_storage::QueueError),
	/// A proxy operation failed.
	#[error(transparent)]
	Proxy(#[from] ember_proxy::ProxyError),
	/// A sites gateway failed to build.
	#[error(transparent)]
	Sites(#[from] ember_storage::SitesError),
	/// IO error.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// An HTTP dispatch failed.
	#[error("dispatch failed: {0}")]
	Dispatch(#[from] reqwest::Error),
	/// The instance has not been started (or was disposed).
	#[error("the instance is not started")]
	NotStarted,
	/// No binding with this name exists in the current configuration.
	#[error("no binding named `{0}` is configured")]
	UnknownBinding(String),
	/// The proxy returned a shape the typed handle does not understand.
	#[error("unexpected proxy result for `{0}`")]
	UnexpectedResult(String),
}
