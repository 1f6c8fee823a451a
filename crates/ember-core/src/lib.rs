// SPDX-License-Identifier: GPL-3.0

//! Core orchestration for Ember.
//!
//! ```text
//! options ──merge──▶ EmberConfig ──plugins──▶ ServiceGraph ──stdin──▶ runtime
//!                                                 │                     │
//!                                          module collector      control pipe
//!                                                                 (listen events)
//! ```
//!
//! The pieces compose in the facade crate: configuration merges in layers,
//! plugins turn the merged config into bindings and services, the collector
//! resolves user code into the module manifest, and the supervisor owns the
//! child runtime process end to end.

pub use bindings::WorkerBinding;
pub use config::{
	ConfigError, EmberConfig, FileConfig, Layer, QueueConsumerOptions, SharedConfig,
	WorkerConfig,
};
pub use cron::{CronError, CronScheduler, DispatchError, ScheduledDispatcher};
pub use graph::{
	DiskService, ENTRY_SOCKET, ExternalService, GraphError, LOOPBACK_SERVICE, NetworkService,
	Service, ServiceGraph, SocketSpec, WorkerService, WorkerStorage,
};
pub use modules::{ModuleDef, ModuleError, ModuleKind, ModuleRule, collect_modules, default_rules};
pub use plugin::{NodeBinding, NodeBindingKind, Plugin, PluginCtx, PluginError};
pub use sourcemap::SourceMapRegistry;
pub use supervisor::{ControlEvent, SocketPorts, Supervisor, SupervisorError};

/// Worker bindings.
pub mod bindings;
/// Layered configuration merge.
pub mod config;
/// Scheduled triggers.
pub mod cron;
/// The service graph.
pub mod graph;
/// The module collector.
pub mod modules;
/// The plugin contract.
pub mod plugin;
/// The source-map registry.
pub mod sourcemap;
/// The child-runtime supervisor.
pub mod supervisor;
