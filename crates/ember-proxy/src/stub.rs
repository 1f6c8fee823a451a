// SPDX-License-Identifier: GPL-3.0

//! Host-side stubs for objects living in the runtime's proxy heap.

use crate::{
	client::ClientShared,
	errors::ProxyError,
	protocol::targets,
	value::Value,
};
use bytes::Bytes;
use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

/// Capacity of the per-stub known-property cache.
const PROPERTY_CACHE_CAPACITY: usize = 32;

/// What a property access or method call yields.
#[derive(Clone, Debug)]
pub enum ProxyValue {
	/// Plain data, fully materialised on the host.
	Value(Value),
	/// A nested remote object.
	Stub(ProxyStub),
	/// A remote function; invoke it with [`ProxyStub::call`] under this name.
	Method(String),
	/// A streamed body, buffered on arrival.
	Stream(Bytes),
	/// A remote promise; resolve it with [`ProxyStub::await_promise`].
	Promise(ProxyStub),
}

pub(crate) struct StubInner {
	pub(crate) address: u64,
	pub(crate) name: Option<String>,
	pub(crate) epoch: u64,
	pub(crate) shared: Arc<ClientShared>,
	pub(crate) properties: Mutex<HashMap<String, ProxyValue>>,
}

impl Drop for StubInner {
	fn drop(&mut self) {
		// Reserved addresses live for the whole epoch; everything else is
		// freed best-effort once the host lets go of it.
		if self.address != targets::GLOBAL && self.address != targets::BINDINGS {
			self.shared.enqueue_free(self.address, self.epoch);
		}
	}
}

/// A handle to an object inside the child runtime.
///
/// Cloning shares the handle; the runtime's heap entry is released when the
/// last clone drops. A stub minted before a reload fails every operation
/// with [`ProxyError::Poisoned`] afterwards.
#[derive(Clone)]
pub struct ProxyStub {
	pub(crate) inner: Arc<StubInner>,
}

impl std::fmt::Debug for ProxyStub {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProxyStub")
			.field("address", &self.inner.address)
			.field("name", &self.inner.name)
			.field("epoch", &self.inner.epoch)
			.finish()
	}
}

impl ProxyStub {
	/// The proxy-heap address.
	pub fn address(&self) -> u64 {
		self.inner.address
	}

	/// The name hint given when the stub was minted.
	pub fn name(&self) -> Option<&str> {
		self.inner.name.as_deref()
	}

	/// The reload epoch this stub belongs to.
	pub fn epoch(&self) -> u64 {
		self.inner.epoch
	}

	/// The serialised form used in `MF-Op-Target` and argument lists.
	pub fn as_value(&self) -> Value {
		Value::Stub { address: self.inner.address, name: self.inner.name.clone() }
	}

	fn check_epoch(&self) -> Result<(), ProxyError> {
		if self.inner.epoch < self.inner.shared.epoch() {
			return Err(ProxyError::Poisoned);
		}
		Ok(())
	}

	fn cached(&self, key: &str) -> Option<ProxyValue> {
		self.inner.properties.lock().expect("property cache poisoned").get(key).cloned()
	}

	fn cache(&self, key: &str, value: &ProxyValue) {
		// Only values that are stable across reads are cached: functions,
		// nested stubs and streams. Primitives always take a round-trip.
		if !matches!(value, ProxyValue::Method(_) | ProxyValue::Stub(_) | ProxyValue::Stream(_)) {
			return;
		}
		let mut properties = self.inner.properties.lock().expect("property cache poisoned");
		if properties.len() < PROPERTY_CACHE_CAPACITY {
			properties.insert(key.to_string(), value.clone());
		}
	}

	/// Whether `key` is answered locally without a round-trip: thenable
	/// probes and the reserved stub-identity keys.
	fn answered_locally(key: &str) -> bool {
		matches!(key, "then" | "catch" | "finally") || key.starts_with("__MF")
	}

	/// Reads a property asynchronously.
	pub async fn get(&self, key: &str) -> Result<ProxyValue, ProxyError> {
		self.check_epoch()?;
		if Self::answered_locally(key) {
			return Ok(ProxyValue::Value(Value::Undefined));
		}
		if let Some(cached) = self.cached(key) {
			return Ok(cached);
		}
		let value = ClientShared::op_get(&self.inner.shared, self, key, false).await?;
		let value = self.resolve_if_promise(value).await?;
		self.cache(key, &value);
		Ok(value)
	}

	/// Reads a property on the synchronous transport; accessor-style callers
	/// use this from non-async contexts. A remote promise comes back as
	/// [`ProxyValue::Promise`] for the caller to resolve asynchronously.
	pub fn get_sync(&self, key: &str) -> Result<ProxyValue, ProxyError> {
		self.check_epoch()?;
		if Self::answered_locally(key) {
			return Ok(ProxyValue::Value(Value::Undefined));
		}
		if let Some(cached) = self.cached(key) {
			return Ok(cached);
		}
		let value = ClientShared::op_get_sync(&self.inner.shared, self, key)?;
		self.cache(key, &value);
		Ok(value)
	}

	/// Calls a method. Arguments containing an unbuffered stream are routed
	/// with a length-prefixed envelope; `stream` carries the stream bytes.
	pub async fn call(
		&self,
		method: &str,
		args: Vec<Value>,
		stream: Option<Bytes>,
	) -> Result<ProxyValue, ProxyError> {
		self.check_epoch()?;
		let value = ClientShared::op_call(&self.inner.shared, self, method, args, stream).await?;
		self.resolve_if_promise(value).await
	}

	/// Resolves a remote promise to its settled value.
	pub async fn await_promise(&self, promise: &ProxyStub) -> Result<ProxyValue, ProxyError> {
		self.check_epoch()?;
		let value = ClientShared::op_get(&self.inner.shared, promise, "", false).await?;
		Ok(value)
	}

	async fn resolve_if_promise(&self, value: ProxyValue) -> Result<ProxyValue, ProxyError> {
		match value {
			ProxyValue::Promise(promise) => self.await_promise(&promise).await,
			other => Ok(other),
		}
	}

	/// Dispatches a fetch through this stub, preserving a streaming request
	/// body end to end; returns the raw response.
	pub async fn fetch(
		&self,
		method: &str,
		url: &str,
		headers: Vec<(String, String)>,
		body: Option<Bytes>,
	) -> Result<(u16, Vec<(String, String)>, Bytes), ProxyError> {
		self.check_epoch()?;
		self.inner.shared.op_fetch(self, method, url, headers, body).await
	}

	/// Calls the runtime's `writeHttpMetadata`, merging the returned headers
	/// into `headers` (the method mutates its argument by contract).
	pub async fn write_http_metadata(
		&self,
		headers: &mut Vec<(String, String)>,
	) -> Result<(), ProxyError> {
		let reply = self
			.call("writeHttpMetadata", vec![Value::Headers(headers.clone())], None)
			.await?;
		if let ProxyValue::Value(Value::Headers(returned)) = reply {
			for (name, value) in returned {
				match headers.iter_mut().find(|(existing, _)| *existing == name) {
					Some((_, slot)) => *slot = value,
					None => headers.push((name, value)),
				}
			}
		}
		Ok(())
	}
}
