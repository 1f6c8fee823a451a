// SPDX-License-Identifier: GPL-3.0

//! The tagged node-graph serializer shared with the runtime's proxy server.
//!
//! Values encode as a JSON array of tagged nodes; composite nodes reference
//! children by index and identical strings, byte buffers and stubs share one
//! node. The profile supports the reducers the bridge needs: headers,
//! requests/responses, stream placeholders and stubs. Host values are owned
//! trees, so encoding never meets a cycle; decoding rejects one.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use indexmap::IndexMap;
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;

/// Raised when a serialised payload cannot be decoded.
#[derive(Debug, Error)]
#[error("malformed serialised value: {0}")]
pub struct ValueError(pub String);

/// A value travelling over the proxy protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
	Undefined,
	Null,
	Bool(bool),
	Number(f64),
	String(String),
	/// Raw bytes (array buffers and buffered stream bodies).
	Bytes(Vec<u8>),
	/// Milliseconds since the unix epoch.
	Date(i64),
	Array(Vec<Value>),
	Object(IndexMap<String, Value>),
	/// A handle into the runtime's proxy heap.
	Stub {
		address: u64,
		name: Option<String>,
	},
	/// An unbuffered stream; its bytes travel out of band.
	Stream {
		length: Option<u64>,
	},
	Headers(Vec<(String, String)>),
	Request {
		method: String,
		url: String,
		headers: Vec<(String, String)>,
		body: Option<Box<Value>>,
	},
	Response {
		status: u16,
		headers: Vec<(String, String)>,
		body: Option<Box<Value>>,
	},
}

impl Value {
	/// Whether this value (or any child) is an unbuffered stream, which must
	/// not travel on the synchronous transport.
	pub fn contains_stream(&self) -> bool {
		match self {
			Value::Stream { .. } => true,
			Value::Array(items) => items.iter().any(Value::contains_stream),
			Value::Object(entries) => entries.values().any(Value::contains_stream),
			Value::Request { body, .. } | Value::Response { body, .. } =>
				body.as_deref().is_some_and(Value::contains_stream),
			_ => false,
		}
	}
}

#[derive(Hash, PartialEq, Eq)]
enum MemoKey {
	Str(String),
	Bytes(Vec<u8>),
	Stub(u64),
}

struct Encoder {
	nodes: Vec<serde_json::Value>,
	memo: HashMap<MemoKey, usize>,
}

impl Encoder {
	fn push(&mut self, node: serde_json::Value) -> usize {
		self.nodes.push(node);
		self.nodes.len() - 1
	}

	fn encode(&mut self, value: &Value) -> usize {
		match value {
			Value::Undefined => self.push(json!({ "t": "undefined" })),
			Value::Null => self.push(json!({ "t": "null" })),
			Value::Bool(b) => self.push(json!({ "t": "bool", "v": b })),
			Value::Number(n) => self.push(json!({ "t": "number", "v": n })),
			Value::Date(ms) => self.push(json!({ "t": "date", "v": ms })),
			Value::String(s) => {
				let key = MemoKey::Str(s.clone());
				if let Some(&index) = self.memo.get(&key) {
					return index;
				}
				let index = self.push(json!({ "t": "string", "v": s }));
				self.memo.insert(key, index);
				index
			},
			Value::Bytes(bytes) => {
				let key = MemoKey::Bytes(bytes.clone());
				if let Some(&index) = self.memo.get(&key) {
					return index;
				}
				let index =
					self.push(json!({ "t": "bytes", "v": BASE64.encode(bytes) }));
				self.memo.insert(key, index);
				index
			},
			Value::Stub { address, name } => {
				let key = MemoKey::Stub(*address);
				if let Some(&index) = self.memo.get(&key) {
					return index;
				}
				let index =
					self.push(json!({ "t": "stub", "address": address, "name": name }));
				self.memo.insert(key, index);
				index
			},
			Value::Stream { length } => self.push(json!({ "t": "stream", "length": length })),
			Value::Headers(pairs) => self.push(json!({ "t": "headers", "v": pairs })),
			Value::Array(items) => {
				// Reserve the slot first so children land after their parent.
				let index = self.push(serde_json::Value::Null);
				let children: Vec<usize> =
					items.iter().map(|item| self.encode(item)).collect();
				self.nodes[index] = json!({ "t": "array", "v": children });
				index
			},
			Value::Object(entries) => {
				let index = self.push(serde_json::Value::Null);
				let children: IndexMap<&String, usize> = entries
					.iter()
					.map(|(key, child)| (key, self.encode(child)))
					.collect();
				self.nodes[index] = json!({ "t": "object", "v": children });
				index
			},
			Value::Request { method, url, headers, body } => {
				let index = self.push(serde_json::Value::Null);
				let body = body.as_deref().map(|body| self.encode(body));
				self.nodes[index] = json!({
					"t": "request",
					"method": method,
					"url": url,
					"headers": headers,
					"body": body,
				});
				index
			},
			Value::Response { status, headers, body } => {
				let index = self.push(serde_json::Value::Null);
				let body = body.as_deref().map(|body| self.encode(body));
				self.nodes[index] = json!({
					"t": "response",
					"status": status,
					"headers": headers,
					"body": body,
				});
				index
			},
		}
	}
}

/// Encodes `value` as the wire string; the root is node 0.
pub fn encode(value: &Value) -> String {
	let mut encoder = Encoder { nodes: Vec::new(), memo: HashMap::new() };
	// The root slot is reserved up front so it always decodes from index 0.
	encoder.nodes.push(serde_json::Value::Null);
	let root = encoder.encode(value);
	if root != 0 {
		encoder.nodes[0] = json!({ "t": "ref", "v": root });
	}
	serde_json::Value::Array(encoder.nodes).to_string()
}

/// Decodes a wire string produced by [`encode`] (or the runtime's encoder).
pub fn decode(wire: &str) -> Result<Value, ValueError> {
	let nodes: Vec<serde_json::Value> =
		serde_json::from_str(wire).map_err(|e| ValueError(e.to_string()))?;
	if nodes.is_empty() {
		return Err(ValueError("empty node list".into()));
	}
	let mut in_progress = vec![false; nodes.len()];
	decode_node(&nodes, 0, &mut in_progress)
}

fn field<'a>(
	node: &'a serde_json::Value,
	name: &str,
	index: usize,
) -> Result<&'a serde_json::Value, ValueError> {
	node.get(name)
		.ok_or_else(|| ValueError(format!("node {index} is missing `{name}`")))
}

fn header_pairs(
	node: &serde_json::Value,
	index: usize,
) -> Result<Vec<(String, String)>, ValueError> {
	serde_json::from_value(field(node, "headers", index)?.clone())
		.map_err(|e| ValueError(e.to_string()))
}

fn decode_node(
	nodes: &[serde_json::Value],
	index: usize,
	in_progress: &mut Vec<bool>,
) -> Result<Value, ValueError> {
	let node = nodes
		.get(index)
		.ok_or_else(|| ValueError(format!("dangling reference to node {index}")))?;
	if in_progress[index] {
		return Err(ValueError(format!("cyclic reference through node {index}")));
	}
	in_progress[index] = true;
	let tag = field(node, "t", index)?
		.as_str()
		.ok_or_else(|| ValueError(format!("node {index} has a non-string tag")))?;

	let child_index = |value: &serde_json::Value| -> Result<usize, ValueError> {
		value
			.as_u64()
			.map(|i| i as usize)
			.ok_or_else(|| ValueError(format!("node {index} has a non-integer child")))
	};

	let decoded = match tag {
		"undefined" => Value::Undefined,
		"null" => Value::Null,
		"bool" => Value::Bool(
			field(node, "v", index)?
				.as_bool()
				.ok_or_else(|| ValueError(format!("node {index} bool payload")))?,
		),
		"number" => Value::Number(
			field(node, "v", index)?
				.as_f64()
				.ok_or_else(|| ValueError(format!("node {index} number payload")))?,
		),
		"date" => Value::Date(
			field(node, "v", index)?
				.as_i64()
				.ok_or_else(|| ValueError(format!("node {index} date payload")))?,
		),
		"string" => Value::String(
			field(node, "v", index)?
				.as_str()
				.ok_or_else(|| ValueError(format!("node {index} string payload")))?
				.to_string(),
		),
		"bytes" => {
			let encoded = field(node, "v", index)?
				.as_str()
				.ok_or_else(|| ValueError(format!("node {index} bytes payload")))?;
			Value::Bytes(
				BASE64.decode(encoded).map_err(|e| ValueError(e.to_string()))?,
			)
		},
		"stub" => Value::Stub {
			address: field(node, "address", index)?
				.as_u64()
				.ok_or_else(|| ValueError(format!("node {index} stub address")))?,
			name: node.get("name").and_then(|name| name.as_str()).map(str::to_string),
		},
		"stream" => Value::Stream {
			length: node.get("length").and_then(|length| length.as_u64()),
		},
		"headers" => Value::Headers(
			serde_json::from_value(field(node, "v", index)?.clone())
				.map_err(|e| ValueError(e.to_string()))?,
		),
		"array" => {
			let children = field(node, "v", index)?
				.as_array()
				.ok_or_else(|| ValueError(format!("node {index} array payload")))?;
			let mut items = Vec::with_capacity(children.len());
			for child in children {
				items.push(decode_node(nodes, child_index(child)?, in_progress)?);
			}
			Value::Array(items)
		},
		"object" => {
			let children = field(node, "v", index)?
				.as_object()
				.ok_or_else(|| ValueError(format!("node {index} object payload")))?;
			let mut entries = IndexMap::with_capacity(children.len());
			for (key, child) in children {
				entries.insert(
					key.clone(),
					decode_node(nodes, child_index(child)?, in_progress)?,
				);
			}
			Value::Object(entries)
		},
		"request" => {
			let body = match node.get("body").filter(|body| !body.is_null()) {
				Some(body) =>
					Some(Box::new(decode_node(nodes, child_index(body)?, in_progress)?)),
				None => None,
			};
			Value::Request {
				method: field(node, "method", index)?
					.as_str()
					.ok_or_else(|| ValueError(format!("node {index} request method")))?
					.to_string(),
				url: field(node, "url", index)?
					.as_str()
					.ok_or_else(|| ValueError(format!("node {index} request url")))?
					.to_string(),
				headers: header_pairs(node, index)?,
				body,
			}
		},
		"response" => {
			let body = match node.get("body").filter(|body| !body.is_null()) {
				Some(body) =>
					Some(Box::new(decode_node(nodes, child_index(body)?, in_progress)?)),
				None => None,
			};
			Value::Response {
				status: field(node, "status", index)?
					.as_u64()
					.and_then(|status| u16::try_from(status).ok())
					.ok_or_else(|| ValueError(format!("node {index} response status")))?,
				headers: header_pairs(node, index)?,
				body,
			}
		},
		"ref" => {
			let target = child_index(field(node, "v", index)?)?;
			decode_node(nodes, target, in_progress)?
		},
		other => return Err(ValueError(format!("unknown tag `{other}`"))),
	};
	in_progress[index] = false;
	Ok(decoded)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip(value: Value) {
		let wire = encode(&value);
		assert_eq!(decode(&wire).unwrap(), value);
	}

	#[test]
	fn primitives_roundtrip() {
		roundtrip(Value::Undefined);
		roundtrip(Value::Null);
		roundtrip(Value::Bool(true));
		roundtrip(Value::Number(1.5));
		roundtrip(Value::String("hello".into()));
		roundtrip(Value::Bytes(vec![0, 1, 255]));
		roundtrip(Value::Date(1_700_000_000_000));
	}

	#[test]
	fn composites_roundtrip() {
		roundtrip(Value::Array(vec![
			Value::Number(1.0),
			Value::Object(IndexMap::from([
				("a".to_string(), Value::Null),
				("b".to_string(), Value::String("x".into())),
			])),
		]));
	}

	#[test]
	fn reducers_roundtrip() {
		roundtrip(Value::Stub { address: 7, name: Some("KvNamespace".into()) });
		roundtrip(Value::Stream { length: Some(42) });
		roundtrip(Value::Stream { length: None });
		roundtrip(Value::Headers(vec![("a".into(), "1".into())]));
		roundtrip(Value::Request {
			method: "POST".into(),
			url: "http://localhost/".into(),
			headers: vec![("content-type".into(), "text/plain".into())],
			body: Some(Box::new(Value::Bytes(b"body".to_vec()))),
		});
		roundtrip(Value::Response {
			status: 200,
			headers: vec![],
			body: None,
		});
	}

	#[test]
	fn identical_subtrees_share_nodes() {
		let shared = Value::String("shared-and-long-enough-to-matter".into());
		let value = Value::Array(vec![shared.clone(), shared.clone(), shared]);
		let wire = encode(&value);
		// Three references, one string node.
		assert_eq!(wire.matches("shared-and-long-enough-to-matter").count(), 1);
		assert_eq!(
			decode(&wire).unwrap(),
			Value::Array(vec![
				Value::String("shared-and-long-enough-to-matter".into()),
				Value::String("shared-and-long-enough-to-matter".into()),
				Value::String("shared-and-long-enough-to-matter".into()),
			])
		);
	}

	#[test]
	fn stream_detection_descends() {
		let value = Value::Object(IndexMap::from([(
			"body".to_string(),
			Value::Array(vec![Value::Stream { length: None }]),
		)]));
		assert!(value.contains_stream());
		assert!(!Value::Array(vec![Value::Null]).contains_stream());
	}

	#[test]
	fn cycles_are_rejected() {
		// Node 0 is an array containing itself.
		let wire = r#"[{"t":"array","v":[0]}]"#;
		assert!(decode(wire).is_err());
	}

	#[test]
	fn garbage_is_rejected() {
		assert!(decode("not json").is_err());
		assert!(decode("[]").is_err());
		assert!(decode(r#"[{"t":"array","v":[9]}]"#).is_err());
		assert!(decode(r#"[{"t":"wat"}]"#).is_err());
	}
}
