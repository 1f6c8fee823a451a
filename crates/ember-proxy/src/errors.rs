// SPDX-License-Identifier: GPL-3.0

//! Error types for the proxy bridge.

use thiserror::Error;

/// Errors surfaced by proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
	/// The stub was minted before the last reload; its remote object is gone.
	#[error(
		"attempted to use a stub from a previous reload; get a fresh handle after set_options/dispose"
	)]
	Poisoned,
	/// The runtime is not reachable (not started, crashed, or mid-reload).
	#[error("runtime not reachable: {0}")]
	Unreachable(String),
	/// The async transport failed.
	#[error("proxy transport error: {0}")]
	Transport(#[from] reqwest::Error),
	/// The sync transport worker is gone or the bounded wait elapsed.
	#[error("synchronous proxy transport failed: {0}")]
	Sync(String),
	/// The reply could not be decoded.
	#[error("malformed proxy reply: {0}")]
	Malformed(String),
	/// Serialisation of arguments or results failed.
	#[error(transparent)]
	Value(#[from] crate::value::ValueError),
	/// An error thrown by user code inside the runtime, re-raised here.
	#[error("{message}")]
	Remote {
		/// The remote error message.
		message: String,
		/// The remote stack with the host call site spliced on.
		stack: String,
	},
	/// A request body stream cannot travel on the synchronous path.
	#[error("unbuffered stream bodies must use the asynchronous transport")]
	StreamOnSyncPath,
	/// The proxy server itself failed (a 500 with no error stack).
	#[error("internal proxy error: {0}")]
	Internal(String),
}
