// SPDX-License-Identifier: GPL-3.0

//! The loopback HTTP server.
//!
//! One server on the loopback address hosts every simulator surface plus the
//! source-map registry. The runtime reaches it through the `loopback`
//! external service; host callers use it directly.

use crate::errors::EmberError;
use axum::{
	Router,
	extract::{Path, State},
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::get,
};
use ember_core::SourceMapRegistry;
use ember_storage::StorageRoutes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The running loopback server.
pub(crate) struct LoopbackServer {
	pub port: u16,
	shutdown: CancellationToken,
	handle: tokio::task::JoinHandle<()>,
}

impl LoopbackServer {
	/// Binds an ephemeral loopback port and serves the assembled router.
	pub(crate) async fn start(
		routes: &StorageRoutes,
		registry: Arc<SourceMapRegistry>,
	) -> Result<Self, EmberError> {
		let router = Router::new()
			.route("/core/source-map/:id", get(serve_source_map))
			.with_state(registry)
			.merge(routes.router());

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
		let port = listener.local_addr()?.port();
		let shutdown = CancellationToken::new();
		let token = shutdown.clone();
		let handle = tokio::spawn(async move {
			let server = axum::serve(listener, router)
				.with_graceful_shutdown(async move { token.cancelled().await });
			if let Err(error) = server.await {
				log::error!("loopback server failed: {error}");
			}
		});
		log::debug!("loopback server listening on 127.0.0.1:{port}");
		Ok(Self { port, shutdown, handle })
	}

	/// Stops the server and waits for it to wind down.
	pub(crate) async fn stop(self) {
		self.shutdown.cancel();
		let _ = self.handle.await;
	}
}

/// Serves a registered source map with permissive CORS so devtools anywhere
/// can fetch it.
async fn serve_source_map(
	State(registry): State<Arc<SourceMapRegistry>>,
	Path(id): Path<String>,
) -> Response {
	match registry.serve(&id) {
		Some(map) => (
			StatusCode::OK,
			[
				("content-type", "application/json"),
				("access-control-allow-origin", "*"),
			],
			map.to_string(),
		)
			.into_response(),
		None => StatusCode::NOT_FOUND.into_response(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ember_storage::wall_clock;

	#[tokio::test(flavor = "multi_thread")]
	async fn source_maps_serve_with_cors() {
		let dir = tempfile::tempdir().unwrap();
		let map_path = dir.path().join("a.js.map");
		std::fs::write(&map_path, r#"{"version":3,"mappings":""}"#).unwrap();

		let registry = Arc::new(SourceMapRegistry::new());
		let mut script = "//# sourceMappingURL=a.js.map".to_string();
		let id = registry
			.register_script(&mut script, dir.path(), "http://127.0.0.1:0")
			.unwrap();

		let routes = StorageRoutes::new(wall_clock(), false);
		let server = LoopbackServer::start(&routes, registry).await.unwrap();

		let url = format!("http://127.0.0.1:{}/core/source-map/{id}", server.port);
		let response = reqwest::get(&url).await.unwrap();
		assert_eq!(response.status().as_u16(), 200);
		assert_eq!(
			response.headers().get("access-control-allow-origin").unwrap(),
			"*"
		);
		let map: serde_json::Value = response.json().await.unwrap();
		assert_eq!(map["version"], 3);

		// Unknown ids are 404s.
		let missing = format!("http://127.0.0.1:{}/core/source-map/none", server.port);
		assert_eq!(reqwest::get(&missing).await.unwrap().status().as_u16(), 404);

		server.stop().await;
	}
}
