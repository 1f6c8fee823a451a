// SPDX-License-Identifier: GPL-3.0

//! The proxy bridge.
//!
//! Host code holds [`ProxyStub`]s for objects that live inside the child
//! runtime's proxy heap. Property reads may travel synchronously (a worker
//! thread owns a blocking HTTP client and the caller parks on a condition
//! variable) so accessor-style code works outside async contexts; method
//! calls and promise resolution travel asynchronously; unbuffered stream
//! bodies always take the async path with a length-prefixed envelope.
//!
//! Reloading the runtime rebuilds its heap: [`ProxyClient::poison_all`]
//! bumps the epoch, failing every outstanding stub and cancelling queued
//! FREE messages for the dead heap.

pub use client::ProxyClient;
pub use errors::ProxyError;
pub use stub::{ProxyStub, ProxyValue};
pub use transport::{SYNC_TIMEOUT, SyncRequest, SyncResponse, SyncTransport};
pub use value::{Value, ValueError, decode, encode};

/// Stub minting, epochs, FREE accounting and request plumbing.
pub mod client;
/// Error types for the bridge.
pub mod errors;
/// The wire protocol: headers, op kinds, reserved addresses.
pub mod protocol;
/// Host-side stub handles.
pub mod stub;
/// The synchronous transport worker.
pub mod transport;
/// The tagged node-graph serializer.
pub mod value;
