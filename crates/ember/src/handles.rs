// SPDX-License-Identifier: GPL-3.0

//! Typed handles over proxy stubs.
//!
//! These are the host-side counterparts of worker bindings: thin wrappers
//! that serialise arguments, call through the bridge and decode results.
//! They share their stub's lifetime, so a reload poisons them together.

use crate::errors::EmberError;
use bytes::Bytes;
use ember_proxy::{ProxyStub, ProxyValue, Value};
use indexmap::IndexMap;

/// Converts a proxy value to JSON for callers that want plain data.
pub(crate) fn value_to_json(value: &Value) -> serde_json::Value {
	match value {
		Value::Undefined | Value::Null => serde_json::Value::Null,
		Value::Bool(b) => serde_json::Value::Bool(*b),
		Value::Number(n) => serde_json::Number::from_f64(*n)
			.map(serde_json::Value::Number)
			.unwrap_or(serde_json::Value::Null),
		Value::String(s) => serde_json::Value::String(s.clone()),
		Value::Bytes(bytes) =>
			serde_json::Value::Array(bytes.iter().map(|byte| (*byte).into()).collect()),
		Value::Date(ms) => serde_json::Value::Number((*ms).into()),
		Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
		Value::Object(entries) => serde_json::Value::Object(
			entries.iter().map(|(key, child)| (key.clone(), value_to_json(child))).collect(),
		),
		Value::Headers(pairs) => serde_json::Value::Object(
			pairs
				.iter()
				.map(|(name, value)| {
					(name.clone(), serde_json::Value::String(value.clone()))
				})
				.collect(),
		),
		Value::Stub { address, name } => serde_json::json!({
			"address": address,
			"name": name,
		}),
		Value::Stream { length } => serde_json::json!({ "stream": true, "length": length }),
		Value::Request { url, .. } => serde_json::json!({ "request": url }),
		Value::Response { status, .. } => serde_json::json!({ "response": status }),
	}
}

/// Converts JSON into a proxy value for argument lists.
pub(crate) fn json_to_value(json: &serde_json::Value) -> Value {
	match json {
		serde_json::Value::Null => Value::Null,
		serde_json::Value::Bool(b) => Value::Bool(*b),
		serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
		serde_json::Value::String(s) => Value::String(s.clone()),
		serde_json::Value::Array(items) => Value::Array(items.iter().map(json_to_value).collect()),
		serde_json::Value::Object(entries) => Value::Object(
			entries
				.iter()
				.map(|(key, child)| (key.clone(), json_to_value(child)))
				.collect::<IndexMap<_, _>>(),
		),
	}
}

fn expect_data(value: ProxyValue, context: &str) -> Result<Value, EmberError> {
	match value {
		ProxyValue::Value(value) => Ok(value),
		ProxyValue::Stream(bytes) => Ok(Value::Bytes(bytes.to_vec())),
		_ => Err(EmberError::UnexpectedResult(context.to_string())),
	}
}

/// A KV namespace handle.
#[derive(Clone, Debug)]
pub struct KvNamespace {
	pub(crate) stub: ProxyStub,
}

impl KvNamespace {
	/// Stores `value` under `key`.
	pub async fn put(&self, key: &str, value: &str) -> Result<(), EmberError> {
		self.stub
			.call(
				"put",
				vec![Value::String(key.into()), Value::String(value.into())],
				None,
			)
			.await?;
		Ok(())
	}

	/// Fetches `key` as text; `None` for missing or expired keys.
	pub async fn get(&self, key: &str) -> Result<Option<String>, EmberError> {
		let reply = self.stub.call("get", vec![Value::String(key.into())], None).await?;
		match expect_data(reply, "get")? {
			Value::Null | Value::Undefined => Ok(None),
			Value::String(text) => Ok(Some(text)),
			Value::Bytes(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
			_ => Err(EmberError::UnexpectedResult("get".into())),
		}
	}

	/// Deletes `key`.
	pub async fn delete(&self, key: &str) -> Result<(), EmberError> {
		self.stub.call("delete", vec![Value::String(key.into())], None).await?;
		Ok(())
	}

	/// Lists keys; the result mirrors the platform's list shape.
	pub async fn list(&self) -> Result<serde_json::Value, EmberError> {
		let reply = self.stub.call("list", vec![], None).await?;
		Ok(value_to_json(&expect_data(reply, "list")?))
	}
}

/// An R2 bucket handle.
#[derive(Clone, Debug)]
pub struct R2Bucket {
	pub(crate) stub: ProxyStub,
}

impl R2Bucket {
	/// Stores `value` under `key` with optional put options.
	pub async fn put(
		&self,
		key: &str,
		value: &[u8],
		options: Option<serde_json::Value>,
	) -> Result<Option<serde_json::Value>, EmberError> {
		let mut args = vec![Value::String(key.into()), Value::Bytes(value.to_vec())];
		if let Some(options) = options {
			args.push(json_to_value(&options));
		}
		let reply = self.stub.call("put", args, None).await?;
		match expect_data(reply, "put")? {
			Value::Null | Value::Undefined => Ok(None),
			value => Ok(Some(value_to_json(&value))),
		}
	}

	/// Fetches `key`; `None` when absent.
	pub async fn get(&self, key: &str) -> Result<Option<Bytes>, EmberError> {
		let reply = self.stub.call("get", vec![Value::String(key.into())], None).await?;
		match reply {
			ProxyValue::Value(Value::Null | Value::Undefined) => Ok(None),
			ProxyValue::Value(Value::Bytes(bytes)) => Ok(Some(Bytes::from(bytes))),
			ProxyValue::Stream(bytes) => Ok(Some(bytes)),
			_ => Err(EmberError::UnexpectedResult("get".into())),
		}
	}

	/// Deletes `key`.
	pub async fn delete(&self, key: &str) -> Result<(), EmberError> {
		self.stub.call("delete", vec![Value::String(key.into())], None).await?;
		Ok(())
	}
}

/// A relational database handle.
#[derive(Clone, Debug)]
pub struct D1Database {
	pub(crate) stub: ProxyStub,
}

impl D1Database {
	/// Runs one statement.
	pub async fn query(
		&self,
		sql: &str,
		params: Vec<serde_json::Value>,
	) -> Result<serde_json::Value, EmberError> {
		let args = vec![
			Value::String(sql.into()),
			Value::Array(params.iter().map(json_to_value).collect()),
		];
		let reply = self.stub.call("query", args, None).await?;
		Ok(value_to_json(&expect_data(reply, "query")?))
	}

	/// Runs statements in one transaction; any failure rolls all back.
	pub async fn batch(
		&self,
		statements: Vec<serde_json::Value>,
	) -> Result<serde_json::Value, EmberError> {
		let args = vec![Value::Array(statements.iter().map(json_to_value).collect())];
		let reply = self.stub.call("batch", args, None).await?;
		Ok(value_to_json(&expect_data(reply, "batch")?))
	}
}

/// A queue producer handle.
#[derive(Clone, Debug)]
pub struct QueueProducer {
	pub(crate) stub: ProxyStub,
}

impl QueueProducer {
	/// Enqueues one message.
	pub async fn send(&self, body: serde_json::Value) -> Result<(), EmberError> {
		self.stub.call("send", vec![json_to_value(&body)], None).await?;
		Ok(())
	}
}

/// The default cache handle.
#[derive(Clone, Debug)]
pub struct CacheHandle {
	pub(crate) stub: ProxyStub,
}

impl CacheHandle {
	/// Looks up a cached response for `url`.
	pub async fn match_url(&self, url: &str) -> Result<Option<serde_json::Value>, EmberError> {
		let reply = self.stub.call("match", vec![Value::String(url.into())], None).await?;
		match expect_data(reply, "match")? {
			Value::Null | Value::Undefined => Ok(None),
			value => Ok(Some(value_to_json(&value))),
		}
	}

	/// Removes the entry for `url`; returns whether one existed.
	pub async fn delete_url(&self, url: &str) -> Result<bool, EmberError> {
		let reply = self.stub.call("delete", vec![Value::String(url.into())], None).await?;
		match expect_data(reply, "delete")? {
			Value::Bool(existed) => Ok(existed),
			_ => Err(EmberError::UnexpectedResult("delete".into())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn json_value_conversion_roundtrips() {
		let json = serde_json::json!({
			"nested": { "flag": true, "count": 3.0 },
			"items": [1.0, "two", null],
		});
		assert_eq!(value_to_json(&json_to_value(&json)), json);
	}

	#[test]
	fn bytes_become_number_arrays() {
		let json = value_to_json(&Value::Bytes(vec![1, 2, 255]));
		assert_eq!(json, serde_json::json!([1, 2, 255]));
	}
}
