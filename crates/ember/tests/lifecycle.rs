// SPDX-License-Identifier: GPL-3.0

//! Instance lifecycle: start, reload, stub poisoning and teardown, driven
//! against a scripted stand-in for the child runtime.

#![cfg(unix)]

use ember::{Ember, EmberConfig, SharedConfig, WorkerConfig};
use ember_proxy::ProxyError;
use std::{os::unix::fs::PermissionsExt, path::PathBuf};

/// Writes an executable script that plays the runtime's part: drain stdin,
/// report the entry and proxy sockets on the control pipe, then linger.
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

fn config(runtime: PathBuf) -> EmberConfig {
	EmberConfig {
		workers: vec![WorkerConfig {
			name: Some("api".into()),
			script: Some("export default {}".into()),
			kv_namespaces: vec!["NS".into()],
			..Default::default()
		}],
		shared: SharedConfig { runtime_path: Some(runtime), ..Default::default() },
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn start_reports_runtime_ports() {
	let _ = env_logger::builder().is_test(true).try_init();
	let dir = tempfile::tempdir().unwrap();
	let mut ember = Ember::new(config(fake_runtime(dir.path()))).unwrap();

	let ports = ember.start().await.unwrap();
	assert_eq!(ports.entry(), Some(8787));
	assert_eq!(ports.sockets.get("proxy"), Some(&8788));
	assert!(ember.ready().is_ok());
	assert!(ember.loopback_url().is_some());
	assert_eq!(ember.entry_url().as_deref(), Some("http://127.0.0.1:8787"));

	// Plugins produced the host-side placeholder for the KV binding.
	assert!(ember.node_bindings().iter().any(|binding| binding.name == "NS"));
	let error = ember.kv_namespace("MISSING").await.unwrap_err();
	assert!(matches!(error, ember::EmberError::UnknownBinding(name) if name == "MISSING"));

	ember.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_poisons_previous_stubs() {
	let dir = tempfile::tempdir().unwrap();
	let runtime = fake_runtime(dir.path());
	let mut ember = Ember::new(config(runtime.clone())).unwrap();
	ember.start().await.unwrap();

	let stale = ember.proxy().stub(42, Some("KvNamespace".into()));
	ember.set_options(config(runtime)).await.unwrap();

	// Any operation on the pre-reload stub fails fast.
	let error = stale.get("get").await.unwrap_err();
	assert!(matches!(error, ProxyError::Poisoned));

	// A stub minted after the reload carries the current epoch.
	let fresh = ember.proxy().stub(43, None);
	assert_eq!(fresh.epoch(), ember.proxy().epoch());

	ember.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_reload_leaves_the_instance_untouched() {
	let dir = tempfile::tempdir().unwrap();
	let runtime = fake_runtime(dir.path());
	let mut ember = Ember::new(config(runtime.clone())).unwrap();
	ember.start().await.unwrap();

	let epoch_before = ember.proxy().epoch();
	let stub = ember.proxy().stub(7, None);

	// A future compatibility date fails assembly before the old runtime is
	// touched.
	let mut bad = config(runtime);
	bad.workers[0].compatibility_date = Some("2199-01-01".into());
	assert!(ember.set_options(bad).await.is_err());

	assert_eq!(ember.proxy().epoch(), epoch_before);
	assert_eq!(stub.epoch(), epoch_before);
	assert!(ember.ready().is_ok());

	ember.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_bindings_are_rejected_up_front() {
	let dir = tempfile::tempdir().unwrap();
	let mut config = config(fake_runtime(dir.path()));
	config.workers[0].r2_buckets = vec!["NS".into()];
	assert!(Ember::new(config).is_err());
}
