// SPDX-License-Identifier: GPL-3.0

//! The synchronous transport.
//!
//! A dedicated worker thread owns a blocking HTTP client. Callers hand it a
//! request with a reply slot and wait, bounded, on a condition variable; by
//! construction the only message that can satisfy the wait is the reply to
//! that request. Unbuffered stream bodies must not travel here: their chunks
//! could not be pulled while the calling thread is parked.

use crate::errors::ProxyError;
use std::{
	sync::{Arc, Condvar, Mutex, mpsc},
	thread::JoinHandle,
	time::Duration,
};

/// Bound on a single synchronous round-trip.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// A request handed to the worker thread.
#[derive(Debug)]
pub struct SyncRequest {
	pub url: String,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

/// The worker's reply.
#[derive(Debug)]
pub struct SyncResponse {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

struct ReplySlot {
	reply: Mutex<Option<Result<SyncResponse, String>>>,
	ready: Condvar,
}

struct Job {
	request: SyncRequest,
	slot: Arc<ReplySlot>,
}

/// The synchronous transport handle.
pub struct SyncTransport {
	sender: Mutex<Option<mpsc::Sender<Job>>>,
	worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncTransport {
	/// Spawns the worker thread.
	pub fn new() -> Self {
		let (sender, receiver) = mpsc::channel::<Job>();
		let worker = std::thread::Builder::new()
			.name("ember-proxy-sync".into())
			.spawn(move || {
				// The blocking client must be created off the async runtime.
				let client = reqwest::blocking::Client::new();
				while let Ok(job) = receiver.recv() {
					let outcome = execute(&client, job.request);
					*job.slot.reply.lock().expect("reply slot poisoned") = Some(outcome);
					job.slot.ready.notify_one();
				}
			})
			.expect("failed to spawn sync transport thread");
		Self { sender: Mutex::new(Some(sender)), worker: Mutex::new(Some(worker)) }
	}

	/// Executes one request, blocking the caller for at most [`SYNC_TIMEOUT`].
	pub fn request(&self, request: SyncRequest) -> Result<SyncResponse, ProxyError> {
		let slot = Arc::new(ReplySlot { reply: Mutex::new(None), ready: Condvar::new() });
		{
			let sender = self.sender.lock().expect("sender slot poisoned");
			let Some(sender) = sender.as_ref() else {
				return Err(ProxyError::Sync("transport is disposed".into()));
			};
			sender
				.send(Job { request, slot: Arc::clone(&slot) })
				.map_err(|_| ProxyError::Sync("transport worker is gone".into()))?;
		}

		let guard = slot.reply.lock().expect("reply slot poisoned");
		let (mut guard, timeout) = slot
			.ready
			.wait_timeout_while(guard, SYNC_TIMEOUT, |reply| reply.is_none())
			.map_err(|_| ProxyError::Sync("reply slot poisoned".into()))?;
		if timeout.timed_out() {
			return Err(ProxyError::Sync(format!(
				"no reply within {} seconds",
				SYNC_TIMEOUT.as_secs()
			)));
		}
		match guard.take().expect("predicate guarantees a reply") {
			Ok(response) => Ok(response),
			Err(message) => Err(ProxyError::Unreachable(message)),
		}
	}

	/// Stops the worker and joins it; in-flight requests finish first.
	pub fn dispose(&self) {
		self.sender.lock().expect("sender slot poisoned").take();
		if let Some(worker) = self.worker.lock().expect("worker slot poisoned").take() {
			let _ = worker.join();
		}
	}
}

impl Default for SyncTransport {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for SyncTransport {
	fn drop(&mut self) {
		self.sender.lock().expect("sender slot poisoned").take();
	}
}

fn execute(
	client: &reqwest::blocking::Client,
	request: SyncRequest,
) -> Result<SyncResponse, String> {
	let mut builder = client.post(&request.url);
	for (name, value) in &request.headers {
		builder = builder.header(name, value);
	}
	let response = builder.body(request.body).send().map_err(|e| e.to_string())?;
	let status = response.status().as_u16();
	let headers = response
		.headers()
		.iter()
		.map(|(name, value)| {
			(name.as_str().to_string(), value.to_str().unwrap_or_default().to_string())
		})
		.collect();
	let body = response.bytes().map_err(|e| e.to_string())?.to_vec();
	Ok(SyncResponse { status, headers, body })
}
