// SPDX-License-Identifier: GPL-3.0

//! Sites routes: the manifest on `GET /:site`, assets on `GET /:site/*path`.

use super::{StorageState, error_envelope};
use crate::errors::SitesError;
use axum::{
	Json, Router,
	extract::{Path, State},
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::get,
};
use std::sync::Arc;

pub(super) fn router(state: Arc<StorageState>) -> Router {
	Router::new()
		.route("/:site", get(manifest))
		.route("/:site/*path", get(asset))
		.with_state(state)
}

fn respond_error(error: SitesError) -> Response {
	match &error {
		SitesError::NotFound(_) => error_envelope(404, error.to_string(), 10071),
		SitesError::Traversal(_) => error_envelope(400, error.to_string(), 10072),
		_ => error_envelope(500, error.to_string(), 10001),
	}
}

async fn manifest(
	State(state): State<Arc<StorageState>>,
	Path(site): Path<String>,
) -> Response {
	let Some(gateway) = state.site(&site) else {
		return error_envelope(404, format!("no such site `{site}`"), 10070);
	};
	match gateway.manifest() {
		Ok(manifest) => Json(manifest).into_response(),
		Err(error) => respond_error(error),
	}
}

async fn asset(
	State(state): State<Arc<StorageState>>,
	Path((site, path)): Path<(String, String)>,
) -> Response {
	let Some(gateway) = state.site(&site) else {
		return error_envelope(404, format!("no such site `{site}`"), 10070);
	};
	match gateway.get(&path).await {
		Ok(body) => (StatusCode::OK, body).into_response(),
		Err(error) => respond_error(error),
	}
}
