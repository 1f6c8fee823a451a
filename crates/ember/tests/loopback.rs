// SPDX-License-Identifier: GPL-3.0

//! The loopback HTTP surface, exercised end to end over real sockets.

#![cfg(unix)]

use std::{os::unix::fs::PermissionsExt, path::PathBuf};

use ember::{Ember, EmberConfig, SharedConfig, WorkerConfig};

fn fake_runtime(dir: &std::path::Path) -> PathBuf {
	let path = dir.join("fake-runtime.sh");
	let body = concat!(
		"#!/bin/sh\n",
		"cat > /dev/null\n",
		"echo '{\"event\":\"listen\",\"socket\":\"entry\",\"port\":8787}' >&3\n",
		"echo '{\"event\":\"listen\",\"socket\":\"proxy\",\"port\":8788}' >&3\n",
		"sleep 600\n",
	);
	std::fs::write(&path, body).unwrap();
	let mut permissions = std::fs::metadata(&path).unwrap().permissions();
	permissions.set_mode(0o755);
	std::fs::set_permissions(&path, permissions).unwrap();
	path
}

async fn started(dir: &std::path::Path) -> Ember {
	let config = EmberConfig {
		workers: vec![WorkerConfig {
			name: Some("api".into()),
			script: Some("export default {}".into()),
			kv_namespaces: vec!["NS".into()],
			r2_buckets: vec!["B".into()],
			..Default::default()
		}],
		shared: SharedConfig { runtime_path: Some(fake_runtime(dir)), ..Default::default() },
	};
	let mut ember = Ember::new(config).unwrap();
	ember.start().await.unwrap();
	ember
}

#[tokio::test(flavor = "multi_thread")]
async fn kv_roundtrip_over_the_surface() {
	let _ = env_logger::builder().is_test(true).try_init();
	let dir = tempfile::tempdir().unwrap();
	let ember = started(dir.path()).await;
	let base = ember.loopback_url().unwrap();
	let client = reqwest::Client::new();

	let response = client
		.put(format!("{base}/kv/NS/values/k"))
		.body("hello")
		.send()
		.await
		.unwrap();
	assert_eq!(response.status().as_u16(), 204);

	let response = client.get(format!("{base}/kv/NS/values/k")).send().await.unwrap();
	assert_eq!(response.status().as_u16(), 200);
	assert_eq!(response.text().await.unwrap(), "hello");

	let response = client.get(format!("{base}/kv/NS")).send().await.unwrap();
	let page: serde_json::Value = response.json().await.unwrap();
	assert_eq!(page["keys"][0]["name"], "k");
	assert_eq!(page["list_complete"], true);
	assert_eq!(page["cursor"], "");

	ember.dispose().await.unwrap();
}

fn md5_hex(data: &[u8]) -> String {
	// The etag of a stored object is the md5 of its bytes; recompute it the
	// same way the simulator does.
	use md5::Digest;
	hex::encode(md5::Md5::digest(data))
}

#[tokio::test(flavor = "multi_thread")]
async fn r2_conditional_put_over_the_surface() {
	let dir = tempfile::tempdir().unwrap();
	let ember = started(dir.path()).await;
	let base = ember.loopback_url().unwrap();
	let client = reqwest::Client::new();

	let put = |envelope: serde_json::Value, body: &'static str| {
		let client = client.clone();
		let url = format!("{base}/r2/B");
		async move {
			client
				.put(url)
				.header("CF-R2-Request", envelope.to_string())
				.body(body)
				.send()
				.await
				.unwrap()
		}
	};

	let response = put(serde_json::json!({ "method": "put", "object": "o" }), "v1").await;
	assert_eq!(response.status().as_u16(), 200);
	let e1 = md5_hex(b"v1");

	// Matching etag: replacement succeeds with the new etag.
	let response = put(
		serde_json::json!({
			"method": "put",
			"object": "o",
			"onlyIf": { "etagMatches": e1 },
		}),
		"v2",
	)
	.await;
	assert_eq!(response.status().as_u16(), 200);
	let size: usize = response
		.headers()
		.get("CF-R2-Metadata-Size")
		.unwrap()
		.to_str()
		.unwrap()
		.parse()
		.unwrap();
	let body = response.bytes().await.unwrap();
	let meta: serde_json::Value = serde_json::from_slice(&body[..size]).unwrap();
	assert_eq!(meta["etag"], md5_hex(b"v2"));

	// Mismatching etag: precondition fails, stored value untouched.
	let response = put(
		serde_json::json!({
			"method": "put",
			"object": "o",
			"onlyIf": { "etagMatches": "zzzz" },
		}),
		"v3",
	)
	.await;
	assert_eq!(response.status().as_u16(), 412);

	let response = client
		.get(format!("{base}/r2/B"))
		.header(
			"CF-R2-Request",
			serde_json::json!({ "method": "get", "object": "o" }).to_string(),
		)
		.send()
		.await
		.unwrap();
	let size: usize = response
		.headers()
		.get("CF-R2-Metadata-Size")
		.unwrap()
		.to_str()
		.unwrap()
		.parse()
		.unwrap();
	let body = response.bytes().await.unwrap();
	assert_eq!(&body[size..], b"v2");

	ember.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn r2_ranges_over_the_surface() {
	let dir = tempfile::tempdir().unwrap();
	let ember = started(dir.path()).await;
	let base = ember.loopback_url().unwrap();
	let client = reqwest::Client::new();

	client
		.put(format!("{base}/r2/B"))
		.header(
			"CF-R2-Request",
			serde_json::json!({ "method": "put", "object": "k" }).to_string(),
		)
		.body("abcdefghijklmnopqrstuvwxyz")
		.send()
		.await
		.unwrap();

	let get = |envelope: serde_json::Value| {
		let client = client.clone();
		let url = format!("{base}/r2/B");
		async move {
			let response = client
				.get(url)
				.header("CF-R2-Request", envelope.to_string())
				.send()
				.await
				.unwrap();
			let size: usize = response
				.headers()
				.get("CF-R2-Metadata-Size")
				.unwrap()
				.to_str()
				.unwrap()
				.parse()
				.unwrap();
			let body = response.bytes().await.unwrap();
			let meta: serde_json::Value = serde_json::from_slice(&body[..size]).unwrap();
			(meta, body.slice(size..))
		}
	};

	// Structured range.
	let (meta, body) = get(serde_json::json!({
		"method": "get",
		"object": "k",
		"range": { "offset": 3, "length": 4 },
	}))
	.await;
	assert_eq!(&body[..], b"defg");
	assert_eq!(meta["range"], serde_json::json!({ "offset": 3, "length": 4 }));

	// Suffix via a Range header.
	let (_, body) = get(serde_json::json!({
		"method": "get",
		"object": "k",
		"rangeHeader": "bytes=-5",
	}))
	.await;
	assert_eq!(&body[..], b"vwxyz");

	// Multiple ranges collapse to the full body.
	let (meta, body) = get(serde_json::json!({
		"method": "get",
		"object": "k",
		"rangeHeader": "bytes=5-6,10-11",
	}))
	.await;
	assert_eq!(&body[..], b"abcdefghijklmnopqrstuvwxyz");
	assert!(meta.get("range").is_none());

	ember.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn kv_persistence_survives_reload() {
	let dir = tempfile::tempdir().unwrap();
	let persist = dir.path().join("state");
	let runtime = fake_runtime(dir.path());
	let config = EmberConfig {
		workers: vec![WorkerConfig {
			name: Some("api".into()),
			script: Some("export default {}".into()),
			kv_namespaces: vec!["NS".into()],
			..Default::default()
		}],
		shared: SharedConfig {
			runtime_path: Some(runtime),
			persist_root: Some(persist.clone()),
			kv_persist: Some(ember::PersistSpec::Flag(true)),
			..Default::default()
		},
	};
	let mut ember = Ember::new(config.clone()).unwrap();
	ember.start().await.unwrap();
	let base = ember.loopback_url().unwrap();
	let client = reqwest::Client::new();
	let persist_header = persist.join("kv").display().to_string();

	client
		.put(format!("{base}/kv/NS/values/a"))
		.header("MF-Persist", &persist_header)
		.body("1")
		.send()
		.await
		.unwrap();

	// The fingerprinted database landed on disk.
	assert!(persist.join("kv").is_dir());

	ember.set_options(config).await.unwrap();
	let response = client
		.get(format!("{base}/kv/NS/values/a"))
		.header("MF-Persist", &persist_header)
		.send()
		.await
		.unwrap();
	assert_eq!(response.text().await.unwrap(), "1");

	ember.dispose().await.unwrap();
}
