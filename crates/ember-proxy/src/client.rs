// SPDX-License-Identifier: GPL-3.0

//! The proxy client: stub minting, reload epochs, FREE accounting and the
//! request/reply plumbing shared by both transports.

use crate::{
	errors::ProxyError,
	protocol::{Op, ResultType, headers, targets},
	stub::{ProxyStub, ProxyValue, StubInner},
	transport::{SyncRequest, SyncTransport},
	value::{Value, decode, encode},
};
use bytes::Bytes;
use std::{
	collections::HashMap,
	sync::{
		Arc, Mutex, RwLock,
		atomic::{AtomicU64, Ordering},
	},
};
use url::Url;

/// Capacity of the FREE queue; overflow drops messages (freeing is
/// best-effort, the heap is rebuilt on reload anyway).
const FREE_QUEUE_CAPACITY: usize = 1024;

struct FreeRequest {
	address: u64,
	epoch: u64,
}

pub(crate) struct ClientShared {
	base: RwLock<Option<Url>>,
	epoch: AtomicU64,
	http: reqwest::Client,
	sync: SyncTransport,
	free_tx: Mutex<Option<tokio::sync::mpsc::Sender<FreeRequest>>>,
}

enum Reply {
	Function,
	Data(Value),
	DataWithStream(Value, Bytes),
}

impl ClientShared {
	pub(crate) fn epoch(&self) -> u64 {
		self.epoch.load(Ordering::Acquire)
	}

	fn base(&self) -> Result<Url, ProxyError> {
		self.base
			.read()
			.expect("base url lock poisoned")
			.clone()
			.ok_or_else(|| ProxyError::Unreachable("runtime has not reported its socket".into()))
	}

	pub(crate) fn enqueue_free(&self, address: u64, epoch: u64) {
		if let Some(sender) = self.free_tx.lock().expect("free queue lock poisoned").as_ref() {
			// Overflow or a closed queue drops the FREE silently.
			let _ = sender.try_send(FreeRequest { address, epoch });
		}
	}

	pub(crate) fn mint(
		shared: &Arc<ClientShared>,
		address: u64,
		name: Option<String>,
	) -> ProxyStub {
		ProxyStub {
			inner: Arc::new(StubInner {
				address,
				name,
				epoch: shared.epoch(),
				shared: Arc::clone(shared),
				properties: Mutex::new(HashMap::new()),
			}),
		}
	}

	fn op_headers(
		op: Op,
		target: &Value,
		key: Option<&str>,
		stringified_size: Option<usize>,
		sync: bool,
	) -> Vec<(String, String)> {
		let mut list = vec![
			(headers::OP.to_string(), op.as_str().to_string()),
			(headers::OP_TARGET.to_string(), encode(target)),
		];
		if let Some(key) = key &&
			!key.is_empty()
		{
			list.push((headers::OP_KEY.to_string(), key.to_string()));
		}
		if let Some(size) = stringified_size {
			list.push((headers::OP_STRINGIFIED_SIZE.to_string(), size.to_string()));
		}
		if sync {
			list.push((headers::OP_SYNC.to_string(), "true".to_string()));
		}
		list
	}

	fn classify(
		status: u16,
		result_type: Option<&str>,
		stringified_size: Option<usize>,
		error_stack: Option<String>,
		body: Vec<u8>,
		context: &str,
	) -> Result<Reply, ProxyError> {
		if status != 200 {
			let message = String::from_utf8_lossy(&body).into_owned();
			return match error_stack {
				// A user error thrown inside the runtime: re-raise with the
				// host call site spliced onto the remote trace.
				Some(stack) => Err(ProxyError::Remote {
					message,
					stack: format!("{stack}\n    at {context} (ember host)"),
				}),
				None => Err(ProxyError::Internal(message)),
			};
		}
		match ResultType::parse(result_type) {
			ResultType::Function => Ok(Reply::Function),
			ResultType::Promise => {
				let wire = std::str::from_utf8(&body)
					.map_err(|_| ProxyError::Malformed("reply is not UTF-8".into()))?;
				Ok(Reply::Data(decode(wire)?))
			},
			ResultType::PromiseReadableStream => {
				let size = stringified_size.ok_or_else(|| {
					ProxyError::Malformed("stream reply without a stringified size".into())
				})?;
				if size > body.len() {
					return Err(ProxyError::Malformed(
						"stringified size exceeds the reply body".into(),
					));
				}
				let wire = std::str::from_utf8(&body[..size])
					.map_err(|_| ProxyError::Malformed("reply preamble is not UTF-8".into()))?;
				let value = decode(wire)?;
				Ok(Reply::DataWithStream(value, Bytes::copy_from_slice(&body[size..])))
			},
		}
	}

	fn into_proxy_value(shared: &Arc<ClientShared>, reply: Reply, context: &str) -> ProxyValue {
		match reply {
			Reply::Function => ProxyValue::Method(context.to_string()),
			Reply::DataWithStream(_, stream) => ProxyValue::Stream(stream),
			Reply::Data(Value::Stub { address, name })
				if name.as_deref() == Some("Promise") =>
				ProxyValue::Promise(Self::mint(shared, address, name)),
			Reply::Data(Value::Stub { address, name }) =>
				ProxyValue::Stub(Self::mint(shared, address, name)),
			Reply::Data(value) => ProxyValue::Value(value),
		}
	}

	fn map_send_error(error: reqwest::Error) -> ProxyError {
		if error.is_connect() {
			ProxyError::Unreachable(error.to_string())
		} else {
			ProxyError::Transport(error)
		}
	}

	pub(crate) async fn op_get(
		shared: &Arc<ClientShared>,
		target: &ProxyStub,
		key: &str,
		sync_marker: bool,
	) -> Result<ProxyValue, ProxyError> {
		let base = shared.base()?;
		let mut request = shared.http.post(base);
		for (name, value) in
			Self::op_headers(Op::Get, &target.as_value(), Some(key), None, sync_marker)
		{
			request = request.header(name, value);
		}
		let response = request.send().await.map_err(Self::map_send_error)?;
		let status = response.status().as_u16();
		let result_type = header_string(response.headers(), headers::OP_RESULT_TYPE);
		let size = header_usize(response.headers(), headers::OP_STRINGIFIED_SIZE);
		let stack = header_string(response.headers(), headers::ERROR_STACK);
		let body = response.bytes().await.map_err(ProxyError::Transport)?.to_vec();
		let reply =
			Self::classify(status, result_type.as_deref(), size, stack, body, key)?;
		Ok(Self::into_proxy_value(shared, reply, key))
	}

	pub(crate) fn op_get_sync(
		shared: &Arc<ClientShared>,
		target: &ProxyStub,
		key: &str,
	) -> Result<ProxyValue, ProxyError> {
		let base = shared.base()?;
		let request = SyncRequest {
			url: base.to_string(),
			headers: Self::op_headers(Op::Get, &target.as_value(), Some(key), None, true),
			body: Vec::new(),
		};
		let response = shared.sync.request(request)?;
		let result_type = find_header(&response.headers, headers::OP_RESULT_TYPE);
		let size =
			find_header(&response.headers, headers::OP_STRINGIFIED_SIZE).and_then(|v| v.parse().ok());
		let stack = find_header(&response.headers, headers::ERROR_STACK);
		let reply = Self::classify(
			response.status,
			result_type.as_deref(),
			size,
			stack,
			response.body,
			key,
		)?;
		Ok(Self::into_proxy_value(shared, reply, key))
	}

	pub(crate) async fn op_call(
		shared: &Arc<ClientShared>,
		target: &ProxyStub,
		method: &str,
		args: Vec<Value>,
		stream: Option<Bytes>,
	) -> Result<ProxyValue, ProxyError> {
		let base = shared.base()?;
		let serialised = encode(&Value::Array(args));
		let (body, size) = match stream {
			// A length-prefixed envelope separates the serialised arguments
			// from the raw stream bytes.
			Some(stream) => {
				let mut body = serialised.clone().into_bytes();
				body.extend_from_slice(&stream);
				(body, Some(serialised.len()))
			},
			None => (serialised.into_bytes(), None),
		};
		let mut request = shared.http.post(base);
		for (name, value) in
			Self::op_headers(Op::Call, &target.as_value(), Some(method), size, false)
		{
			request = request.header(name, value);
		}
		let response = request.body(body).send().await.map_err(Self::map_send_error)?;
		let status = response.status().as_u16();
		let result_type = header_string(response.headers(), headers::OP_RESULT_TYPE);
		let size = header_usize(response.headers(), headers::OP_STRINGIFIED_SIZE);
		let stack = header_string(response.headers(), headers::ERROR_STACK);
		let reply_body = response.bytes().await.map_err(ProxyError::Transport)?.to_vec();
		let reply =
			Self::classify(status, result_type.as_deref(), size, stack, reply_body, method)?;
		Ok(Self::into_proxy_value(shared, reply, method))
	}

	pub(crate) async fn op_fetch(
		&self,
		target: &ProxyStub,
		method: &str,
		url: &str,
		request_headers: Vec<(String, String)>,
		body: Option<Bytes>,
	) -> Result<(u16, Vec<(String, String)>, Bytes), ProxyError> {
		let base = self.base()?;
		let http_method = reqwest::Method::from_bytes(method.as_bytes())
			.map_err(|_| ProxyError::Malformed(format!("invalid method `{method}`")))?;
		let mut request = self.http.request(http_method, base);
		for (name, value) in request_headers {
			request = request.header(name, value);
		}
		// The op headers ride alongside the user's own; the proxy server
		// reconstructs the original request from `MF-URL`.
		for (name, value) in
			Self::op_headers(Op::Call, &target.as_value(), Some("fetch"), None, false)
		{
			request = request.header(name, value);
		}
		request = request.header("MF-URL", url);
		if let Some(body) = body {
			request = request.body(body);
		}
		let response = request.send().await.map_err(Self::map_send_error)?;
		let status = response.status().as_u16();
		let stack = header_string(response.headers(), headers::ERROR_STACK);
		let reply_headers: Vec<(String, String)> = response
			.headers()
			.iter()
			.map(|(name, value)| {
				(name.as_str().to_string(), value.to_str().unwrap_or_default().to_string())
			})
			.collect();
		let reply_body = response.bytes().await.map_err(ProxyError::Transport)?;
		if status == 500 &&
			let Some(stack) = stack
		{
			return Err(ProxyError::Remote {
				message: String::from_utf8_lossy(&reply_body).into_owned(),
				stack: format!("{stack}\n    at fetch (ember host)"),
			});
		}
		Ok((status, reply_headers, reply_body))
	}
}

fn header_string(map: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
	map.get(name).and_then(|value| value.to_str().ok()).map(str::to_string)
}

fn header_usize(map: &reqwest::header::HeaderMap, name: &str) -> Option<usize> {
	header_string(map, name).and_then(|value| value.parse().ok())
}

fn find_header(list: &[(String, String)], name: &str) -> Option<String> {
	list.iter()
		.find(|(header, _)| header.eq_ignore_ascii_case(name))
		.map(|(_, value)| value.clone())
}

/// The host side of the proxy bridge.
///
/// Owns the reload epoch, the FREE queue and both transports. Mint stubs
/// with [`ProxyClient::stub`] (or the reserved [`ProxyClient::global_stub`] /
/// [`ProxyClient::bindings_stub`]); bump the epoch with
/// [`ProxyClient::poison_all`] whenever the runtime's heap is rebuilt.
pub struct ProxyClient {
	shared: Arc<ClientShared>,
}

impl ProxyClient {
	/// Creates a client and spawns its FREE drain task; call from within the
	/// host's async runtime.
	pub fn new() -> Self {
		let (free_tx, mut free_rx) = tokio::sync::mpsc::channel::<FreeRequest>(FREE_QUEUE_CAPACITY);
		let shared = Arc::new(ClientShared {
			base: RwLock::new(None),
			epoch: AtomicU64::new(0),
			http: reqwest::Client::new(),
			sync: SyncTransport::new(),
			free_tx: Mutex::new(Some(free_tx)),
		});

		let weak = Arc::downgrade(&shared);
		tokio::spawn(async move {
			while let Some(free) = free_rx.recv().await {
				let Some(shared) = weak.upgrade() else { break };
				// Poisoning cancels FREEs from prior epochs: that heap is gone.
				if free.epoch != shared.epoch() {
					continue;
				}
				let Ok(base) = shared.base() else { continue };
				let target = Value::Stub { address: free.address, name: None };
				let mut request = shared.http.post(base);
				for (name, value) in
					ClientShared::op_headers(Op::Free, &target, None, None, false)
				{
					request = request.header(name, value);
				}
				if let Err(error) = request.send().await {
					log::debug!("FREE for address {} failed: {error}", free.address);
				}
			}
		});

		Self { shared }
	}

	/// Points the client at the runtime's proxy server after (re)start.
	pub fn set_runtime_url(&self, url: Url) {
		*self.shared.base.write().expect("base url lock poisoned") = Some(url);
	}

	/// The current reload epoch.
	pub fn epoch(&self) -> u64 {
		self.shared.epoch()
	}

	/// Bumps the epoch: every outstanding stub is poisoned and queued FREEs
	/// for the previous heap are cancelled.
	pub fn poison_all(&self) {
		self.shared.epoch.fetch_add(1, Ordering::AcqRel);
	}

	/// Mints a stub for an arbitrary heap address.
	pub fn stub(&self, address: u64, name: Option<String>) -> ProxyStub {
		ClientShared::mint(&self.shared, address, name)
	}

	/// The runtime's global scope.
	pub fn global_stub(&self) -> ProxyStub {
		ClientShared::mint(&self.shared, targets::GLOBAL, Some("global".into()))
	}

	/// The bindings object exposed to the entry worker.
	pub fn bindings_stub(&self) -> ProxyStub {
		ClientShared::mint(&self.shared, targets::BINDINGS, Some("env".into()))
	}

	/// Poisons outstanding stubs and tears down both transports.
	pub fn dispose(&self) {
		self.poison_all();
		self.shared.free_tx.lock().expect("free queue lock poisoned").take();
		self.shared.sync.dispose();
	}
}

impl Default for ProxyClient {
	fn default() -> Self {
		Self::new()
	}
}
