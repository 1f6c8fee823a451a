// SPDX-License-Identifier: GPL-3.0

//! KV routes: `GET/PUT/DELETE /:namespace/values/*key` and list on
//! `GET /:namespace`.

use super::{StorageState, error_envelope, headers};
use crate::{
	errors::KvError,
	kv::{KvListOptions, KvPutOptions},
};
use axum::{
	Json, Router,
	extract::{Path, Query, State},
	http::{HeaderMap, StatusCode},
	response::{IntoResponse, Response},
	routing::get,
};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;

pub(super) fn router(state: Arc<StorageState>) -> Router {
	Router::new()
		.route("/:namespace", get(list))
		.route(
			"/:namespace/values/*key",
			get(get_value).put(put_value).delete(delete_value),
		)
		.with_state(state)
}

fn respond(error: KvError) -> Response {
	error_envelope(error.status(), error.to_string(), error.v4code())
}

fn header_i64(request_headers: &HeaderMap, name: &str) -> Option<i64> {
	request_headers.get(name).and_then(|value| value.to_str().ok()).and_then(|v| v.parse().ok())
}

#[derive(Deserialize)]
struct GetParams {
	cache_ttl: Option<i64>,
}

async fn get_value(
	State(state): State<Arc<StorageState>>,
	Path((namespace, key)): Path<(String, String)>,
	Query(params): Query<GetParams>,
	request_headers: HeaderMap,
) -> Response {
	let gateway = match state.kv_gateway(&namespace, &request_headers).await {
		Ok(gateway) => gateway,
		Err(error) => return respond(error),
	};
	match gateway.get(&key, params.cache_ttl).await {
		Ok(Some(entry)) => {
			let mut response_headers = HeaderMap::new();
			if let Some(metadata) = &entry.metadata &&
				let Ok(value) = metadata.to_string().parse()
			{
				response_headers.insert(headers::KV_METADATA, value);
			}
			if let Some(expiration) = entry.expiration &&
				let Ok(value) = expiration.to_string().parse()
			{
				response_headers.insert(headers::EXPIRATION, value);
			}
			(StatusCode::OK, response_headers, entry.value).into_response()
		},
		Ok(None) => respond(KvError::NotFound),
		Err(error) => respond(error),
	}
}

async fn put_value(
	State(state): State<Arc<StorageState>>,
	Path((namespace, key)): Path<(String, String)>,
	request_headers: HeaderMap,
	body: Bytes,
) -> Response {
	let gateway = match state.kv_gateway(&namespace, &request_headers).await {
		Ok(gateway) => gateway,
		Err(error) => return respond(error),
	};
	let metadata = request_headers
		.get(headers::METADATA)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| serde_json::from_str(value).ok());
	let options = KvPutOptions {
		expiration_ttl: header_i64(&request_headers, headers::EXPIRATION_TTL),
		expiration: header_i64(&request_headers, headers::EXPIRATION),
		metadata,
	};
	match gateway.put(&key, body, options).await {
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(error) => respond(error),
	}
}

async fn delete_value(
	State(state): State<Arc<StorageState>>,
	Path((namespace, key)): Path<(String, String)>,
	request_headers: HeaderMap,
) -> Response {
	let gateway = match state.kv_gateway(&namespace, &request_headers).await {
		Ok(gateway) => gateway,
		Err(error) => return respond(error),
	};
	match gateway.delete(&key).await {
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(error) => respond(error),
	}
}

async fn list(
	State(state): State<Arc<StorageState>>,
	Path(namespace): Path<String>,
	Query(options): Query<KvListOptions>,
	request_headers: HeaderMap,
) -> Response {
	let gateway = match state.kv_gateway(&namespace, &request_headers).await {
		Ok(gateway) => gateway,
		Err(error) => return respond(error),
	};
	match gateway.list(options).await {
		Ok(page) => Json(page).into_response(),
		Err(error) => respond(error),
	}
}
