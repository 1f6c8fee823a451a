// SPDX-License-Identifier: GPL-3.0

//! A local emulator for a serverless edge-runtime platform.
//!
//! An [`Ember`] instance merges configuration, assembles a declarative
//! service graph, supervises a single child runtime process and backs the
//! platform bindings with local storage:
//!
//! ```text
//! ┌──────────── host ────────────┐      ┌──────── child runtime ────────┐
//! │ Ember                        │stdin │ entry socket  ◀── user traffic │
//! │  ├─ service graph ───────────┼─────▶│ user workers                   │
//! │  ├─ loopback server  ◀───────┼──────┤ simulator calls                │
//! │  │   (KV/R2/cache/queues/…)  │      │ proxy server  ◀── stubs ───────┼──┐
//! │  ├─ queue broker / cron      │      └────────────────────────────────┘  │
//! │  └─ proxy client ────────────┼──────────────────────────────────────────┘
//! └──────────────────────────────┘
//! ```
//!
//! `set_options` swaps configurations atomically from the caller's view: a
//! rejected configuration leaves the running instance untouched, while an
//! accepted one force-kills the previous runtime and poisons every
//! outstanding proxy stub before the new graph is issued.

pub use assemble::SUPPORTED_COMPAT_DATE;
pub use ember_common::{PersistSpec, Persistence};
pub use ember_core::{
	EmberConfig, FileConfig, ModuleKind, ModuleRule, QueueConsumerOptions, SharedConfig,
	SocketPorts, WorkerConfig,
};
pub use errors::EmberError;
pub use handles::{CacheHandle, D1Database, KvNamespace, QueueProducer, R2Bucket};

use crate::{
	assemble::{Assembled, PROXY_SOCKET, assemble},
	dispatch::{EntryPort, RuntimeQueueDispatcher, RuntimeScheduledDispatcher},
	router::LoopbackServer,
};
use bytes::Bytes;
use chrono::Utc;
use ember_core::{CronScheduler, NodeBinding, SourceMapRegistry, Supervisor, SupervisorError};
use ember_proxy::{ProxyClient, ProxyStub, ProxyValue};
use ember_storage::{QueueBroker, StorageRoutes, wall_clock};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod assemble;
mod dispatch;
/// The facade's error type.
pub mod errors;
/// Typed handles over proxy stubs.
pub mod handles;
mod plugins;
mod router;

/// The emulator instance.
pub struct Ember {
	config: EmberConfig,
	proxy: ProxyClient,
	routes: StorageRoutes,
	registry: Arc<SourceMapRegistry>,
	http: reqwest::Client,
	entry_port: EntryPort,
	supervisor: Option<Supervisor>,
	loopback: Option<LoopbackServer>,
	cron: Option<CronScheduler>,
	broker: Option<QueueBroker>,
	ports: Option<SocketPorts>,
	node_bindings: Vec<NodeBinding>,
	reload: Arc<tokio::sync::Mutex<()>>,
}

impl Ember {
	/// Creates an instance from merged options; call from within a tokio
	/// runtime (the proxy bridge spawns its drain task immediately).
	pub fn new(config: EmberConfig) -> Result<Self, EmberError> {
		config.validate()?;
		let cache_warn_usage = config.shared.cache_warn_usage.unwrap_or(false);
		Ok(Self {
			config,
			proxy: ProxyClient::new(),
			routes: StorageRoutes::new(wall_clock(), cache_warn_usage),
			registry: Arc::new(SourceMapRegistry::new()),
			http: reqwest::Client::new(),
			entry_port: EntryPort::default(),
			supervisor: None,
			loopback: None,
			cron: None,
			broker: None,
			ports: None,
			node_bindings: Vec::new(),
			reload: Arc::new(tokio::sync::Mutex::new(())),
		})
	}

	/// Starts the loopback server (idempotent) and returns its port.
	async fn ensure_loopback(&mut self) -> Result<u16, EmberError> {
		if let Some(loopback) = &self.loopback {
			return Ok(loopback.port);
		}
		let loopback =
			LoopbackServer::start(&self.routes, Arc::clone(&self.registry)).await?;
		let port = loopback.port;
		self.loopback = Some(loopback);
		Ok(port)
	}

	/// Builds the graph for the current config without touching the running
	/// instance.
	fn assemble_current(&self, loopback_port: u16) -> Result<Assembled, EmberError> {
		assemble(&self.config, loopback_port, &self.registry, Utc::now().date_naive())
	}

	/// Applies an assembled graph: wires the broker, sites and cron, spawns
	/// the runtime and records the reported ports.
	async fn apply(
		&mut self,
		assembled: Assembled,
		abort: Option<&CancellationToken>,
	) -> Result<SocketPorts, EmberError> {
		let broker = QueueBroker::new(
			assembled.consumers,
			Arc::new(RuntimeQueueDispatcher {
				http: self.http.clone(),
				entry: self.entry_port.clone(),
			}),
			wall_clock(),
		)?;
		self.routes.register_queue_broker(broker.clone());
		if let Some(old) = self.broker.replace(broker) {
			old.dispose().await;
		}

		for (name, gateway) in assembled.sites {
			self.routes.register_site(&name, gateway);
		}
		self.node_bindings = assembled.node_bindings;

		if let Some(mut cron) = self.cron.take() {
			cron.stop();
		}
		if !assembled.crons.is_empty() {
			self.cron = Some(CronScheduler::start(
				&assembled.crons,
				Utc::now(),
				Arc::new(RuntimeScheduledDispatcher {
					http: self.http.clone(),
					entry: self.entry_port.clone(),
				}),
			)?);
		}

		let runtime_path = self
			.config
			.shared
			.runtime_path
			.clone()
			.ok_or(EmberError::Supervisor(SupervisorError::MissingRuntime))?;
		// A lingering process from an earlier start must not outlive its graph.
		if let Some(mut old) = self.supervisor.take() {
			old.kill().await?;
		}
		let mut supervisor = Supervisor::new(runtime_path);
		let ports = supervisor
			.spawn(
				&assembled.graph.serialize(),
				&assembled.graph.required_sockets(),
				abort,
			)
			.await?;
		self.supervisor = Some(supervisor);

		self.entry_port.set(ports.entry());
		if let Some(port) = ports.sockets.get(PROXY_SOCKET) {
			let url = url::Url::parse(&format!("http://127.0.0.1:{port}/"))
				.expect("loopback URL parses");
			self.proxy.set_runtime_url(url);
		}
		self.ports = Some(ports.clone());
		Ok(ports)
	}

	/// Starts the instance and returns the runtime's bound socket ports.
	///
	/// Fails with a compatibility error when a worker requests a date in the
	/// future; dates past the runtime's supported maximum downgrade with a
	/// warning.
	pub async fn start(&mut self) -> Result<SocketPorts, EmberError> {
		self.start_with_abort(None).await
	}

	/// [`Ember::start`] with an abort token cancelling the wait on the
	/// runtime's listen events.
	pub async fn start_with_abort(
		&mut self,
		abort: Option<&CancellationToken>,
	) -> Result<SocketPorts, EmberError> {
		let reload = Arc::clone(&self.reload);
		let _guard = reload.lock().await;
		let loopback_port = self.ensure_loopback().await?;
		let assembled = self.assemble_current(loopback_port)?;
		self.apply(assembled, abort).await
	}

	/// Swaps in a new configuration.
	///
	/// Atomic from the caller's view: a configuration that fails validation
	/// or assembly leaves the previous runtime running and no stub poisoned.
	/// Once accepted, the old process is force-killed and every outstanding
	/// stub poisoned before the new graph is issued.
	pub async fn set_options(&mut self, config: EmberConfig) -> Result<SocketPorts, EmberError> {
		self.set_options_with_abort(config, None).await
	}

	/// [`Ember::set_options`] with an abort token cancelling the wait on the
	/// replacement runtime's listen events.
	pub async fn set_options_with_abort(
		&mut self,
		config: EmberConfig,
		abort: Option<&CancellationToken>,
	) -> Result<SocketPorts, EmberError> {
		let reload = Arc::clone(&self.reload);
		let _guard = reload.lock().await;
		let loopback_port = self.ensure_loopback().await?;

		// Everything fallible about the new configuration happens before the
		// old runtime is touched.
		config.validate()?;
		let assembled =
			assemble(&config, loopback_port, &self.registry, Utc::now().date_naive())?;
		if let Some(path) = &config.shared.runtime_path &&
			!path.exists()
		{
			return Err(EmberError::Supervisor(SupervisorError::Spawn {
				path: path.clone(),
				source: std::io::Error::from(std::io::ErrorKind::NotFound),
			}));
		}

		if let Some(mut supervisor) = self.supervisor.take() {
			supervisor.kill().await?;
		}
		self.proxy.poison_all();
		self.config = config;
		self.apply(assembled, abort).await
	}

	/// Reaps the runtime if it crashed, returning the forwarded exit code.
	///
	/// After a crash, in-flight and subsequent operations fail as
	/// unreachable until the next successful `set_options`.
	pub async fn check_runtime(&mut self) -> Option<i32> {
		match &mut self.supervisor {
			Some(supervisor) => supervisor.try_reap().await,
			None => None,
		}
	}

	/// Tears the instance down: kills the runtime, stops cron and the
	/// loopback server, and disposes the proxy transports.
	pub async fn dispose(mut self) -> Result<(), EmberError> {
		if let Some(mut supervisor) = self.supervisor.take() {
			supervisor.kill().await?;
		}
		if let Some(mut cron) = self.cron.take() {
			cron.stop();
		}
		if let Some(broker) = self.broker.take() {
			broker.dispose().await;
		}
		self.proxy.poison_all();
		self.proxy.dispose();
		if let Some(loopback) = self.loopback.take() {
			loopback.stop().await;
		}
		self.entry_port.set(None);
		Ok(())
	}

	/// The ports reported by the last successful (re)start.
	pub fn ready(&self) -> Result<&SocketPorts, EmberError> {
		self.ports.as_ref().ok_or(EmberError::NotStarted)
	}

	/// The loopback server's base URL, once started.
	pub fn loopback_url(&self) -> Option<String> {
		self.loopback
			.as_ref()
			.map(|loopback| format!("http://127.0.0.1:{}", loopback.port))
	}

	/// The entry socket's base URL, once the runtime reported it.
	pub fn entry_url(&self) -> Option<String> {
		self.entry_port.get().map(|port| format!("http://127.0.0.1:{port}"))
	}

	/// The proxy client; advanced callers can mint stubs directly.
	pub fn proxy(&self) -> &ProxyClient {
		&self.proxy
	}

	/// Host-side binding placeholders for the current configuration; their
	/// proxy-backed counterparts come from the typed handle constructors.
	pub fn node_bindings(&self) -> &[NodeBinding] {
		&self.node_bindings
	}

	async fn binding_stub(&self, name: &str) -> Result<ProxyStub, EmberError> {
		if !self.node_bindings.iter().any(|binding| binding.name == name) {
			return Err(EmberError::UnknownBinding(name.to_string()));
		}
		match self.proxy.bindings_stub().get(name).await? {
			ProxyValue::Stub(stub) => Ok(stub),
			_ => Err(EmberError::UnexpectedResult(name.to_string())),
		}
	}

	/// A handle to the KV namespace bound as `name`.
	pub async fn kv_namespace(&self, name: &str) -> Result<KvNamespace, EmberError> {
		Ok(KvNamespace { stub: self.binding_stub(name).await? })
	}

	/// A handle to the R2 bucket bound as `name`.
	pub async fn r2_bucket(&self, name: &str) -> Result<R2Bucket, EmberError> {
		Ok(R2Bucket { stub: self.binding_stub(name).await? })
	}

	/// A handle to the relational database bound as `name`.
	pub async fn d1_database(&self, name: &str) -> Result<D1Database, EmberError> {
		Ok(D1Database { stub: self.binding_stub(name).await? })
	}

	/// A handle to the queue producer bound as `name`.
	pub async fn queue_producer(&self, name: &str) -> Result<QueueProducer, EmberError> {
		Ok(QueueProducer { stub: self.binding_stub(name).await? })
	}

	/// A handle to the default cache.
	pub async fn cache(&self) -> Result<CacheHandle, EmberError> {
		let caches = match self.proxy.global_stub().get("caches").await? {
			ProxyValue::Stub(stub) => stub,
			_ => return Err(EmberError::UnexpectedResult("caches".into())),
		};
		match caches.get("default").await? {
			ProxyValue::Stub(stub) => Ok(CacheHandle { stub }),
			_ => Err(EmberError::UnexpectedResult("caches.default".into())),
		}
	}

	/// Forwards an HTTP request to the entry worker.
	pub async fn dispatch_fetch(
		&self,
		method: reqwest::Method,
		path_and_query: &str,
		headers: Vec<(String, String)>,
		body: Option<Bytes>,
	) -> Result<reqwest::Response, EmberError> {
		let entry = self.entry_url().ok_or(EmberError::NotStarted)?;
		let mut request = self
			.http
			.request(method, format!("{entry}{path_and_query}"));
		for (name, value) in headers {
			request = request.header(name, value);
		}
		if let Some(body) = body {
			request = request.body(body);
		}
		Ok(request.send().await?)
	}

	/// Triggers the scheduled handler once, outside any cron schedule.
	pub async fn dispatch_scheduled(&self, cron: &str) -> Result<(), EmberError> {
		use ember_core::cron::ScheduledDispatcher;
		let dispatcher = RuntimeScheduledDispatcher {
			http: self.http.clone(),
			entry: self.entry_port.clone(),
		};
		Ok(dispatcher.dispatch(cron, Utc::now()).await?)
	}
}
