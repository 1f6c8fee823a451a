// SPDX-License-Identifier: GPL-3.0

//! Cache routes: `GET/PUT/PURGE /*uri`, partitioned by `CF-Cache-Namespace`.

use super::{StorageState, error_envelope, headers};
use axum::{
	Router,
	extract::{Path, State},
	http::{HeaderMap, Method, StatusCode},
	response::{IntoResponse, Response},
	routing::any,
};
use bytes::Bytes;
use std::sync::Arc;

pub(super) fn router(state: Arc<StorageState>) -> Router {
	Router::new().route("/*uri", any(handle)).with_state(state)
}

async fn handle(
	State(state): State<Arc<StorageState>>,
	Path(uri): Path<String>,
	method: Method,
	request_headers: HeaderMap,
	body: Bytes,
) -> Response {
	let gateway = match state.cache_gateway(&request_headers).await {
		Ok(gateway) => gateway,
		Err(error) => return error_envelope(500, error.to_string(), 10001),
	};

	match method {
		Method::GET => match gateway.match_key(&uri).await {
			Ok(Some(cached)) => {
				let mut response_headers = HeaderMap::new();
				for (name, value) in &cached.headers {
					if let (Ok(name), Ok(value)) = (
						axum::http::HeaderName::try_from(name.as_str()),
						axum::http::HeaderValue::try_from(value.as_str()),
					) {
						response_headers.append(name, value);
					}
				}
				response_headers.insert(headers::CACHE_STATUS, "HIT".parse().expect("static"));
				(
					StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK),
					response_headers,
					cached.body,
				)
					.into_response()
			},
			Ok(None) => {
				let error = crate::errors::CacheError::Miss;
				error_envelope(error.status(), error.to_string(), error.v4code())
			},
			Err(error) => error_envelope(error.status(), error.to_string(), error.v4code()),
		},
		Method::PUT => match gateway.put(&uri, body).await {
			Ok(stored) => {
				let mut response_headers = HeaderMap::new();
				response_headers.insert(
					headers::CACHE_STORED,
					if stored { "true" } else { "false" }.parse().expect("static"),
				);
				(StatusCode::NO_CONTENT, response_headers).into_response()
			},
			Err(error) => error_envelope(error.status(), error.to_string(), error.v4code()),
		},
		_ if method.as_str() == "PURGE" => match gateway.delete(&uri).await {
			Ok(true) => StatusCode::OK.into_response(),
			Ok(false) => {
				let error = crate::errors::CacheError::Miss;
				error_envelope(error.status(), error.to_string(), error.v4code())
			},
			Err(error) => error_envelope(error.status(), error.to_string(), error.v4code()),
		},
		_ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{StorageRoutes, wall_clock};

	fn state() -> Arc<StorageState> {
		StorageRoutes::new(wall_clock(), false).state
	}

	fn purge() -> Method {
		Method::from_bytes(b"PURGE").unwrap()
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn put_match_purge_through_handlers() {
		let state = state();
		let key = "http://localhost/page".to_string();
		let serialised =
			Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<p>hi</p>");

		let response = handle(
			State(state.clone()),
			Path(key.clone()),
			Method::PUT,
			HeaderMap::new(),
			serialised,
		)
		.await;
		assert_eq!(response.status(), StatusCode::NO_CONTENT);
		assert_eq!(response.headers().get(headers::CACHE_STORED).unwrap(), "true");

		let response = handle(
			State(state.clone()),
			Path(key.clone()),
			Method::GET,
			HeaderMap::new(),
			Bytes::new(),
		)
		.await;
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(response.headers().get(headers::CACHE_STATUS).unwrap(), "HIT");
		assert_eq!(response.headers().get("content-type").unwrap(), "text/html");

		let response = handle(
			State(state.clone()),
			Path(key.clone()),
			purge(),
			HeaderMap::new(),
			Bytes::new(),
		)
		.await;
		assert_eq!(response.status(), StatusCode::OK);

		let response =
			handle(State(state), Path(key), Method::GET, HeaderMap::new(), Bytes::new()).await;
		assert_eq!(response.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn named_partitions_are_separate() {
		let state = state();
		let key = "http://localhost/page".to_string();
		let serialised = Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\nbody");

		let mut named = HeaderMap::new();
		named.insert(headers::CACHE_NAMESPACE, "sessions".parse().unwrap());
		handle(State(state.clone()), Path(key.clone()), Method::PUT, named.clone(), serialised)
			.await;

		// The default partition does not see it.
		let response = handle(
			State(state.clone()),
			Path(key.clone()),
			Method::GET,
			HeaderMap::new(),
			Bytes::new(),
		)
		.await;
		assert_eq!(response.status(), StatusCode::NOT_FOUND);

		let response =
			handle(State(state), Path(key), Method::GET, named, Bytes::new()).await;
		assert_eq!(response.status(), StatusCode::OK);
	}
}
