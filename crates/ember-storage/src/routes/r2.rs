// SPDX-License-Identifier: GPL-3.0

//! R2 routes: every operation travels through `GET|PUT /:bucket` with a JSON
//! op envelope in `CF-R2-Request`. Responses concatenate a metadata JSON
//! document and the value bytes; `CF-R2-Metadata-Size` carries the split.

use super::{StorageState, headers};
use crate::{
	errors::R2Error,
	r2::{R2GetOptions, R2ListOptions, R2PutOptions, R2UploadedPart},
};
use axum::{
	Router,
	extract::{Path, State},
	http::{HeaderMap, StatusCode},
	response::{IntoResponse, Response},
	routing::any,
};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;

pub(super) fn router(state: Arc<StorageState>) -> Router {
	Router::new().route("/:bucket", any(handle)).with_state(state)
}

/// The op envelope carried in `CF-R2-Request` (or, when
/// `CF-R2-Metadata-Size` is set, in the body's metadata prefix).
#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
enum R2Op {
	#[serde(rename_all = "camelCase")]
	Head { object: String },
	#[serde(rename_all = "camelCase")]
	Get {
		object: String,
		#[serde(flatten)]
		options: R2GetOptions,
	},
	#[serde(rename_all = "camelCase")]
	Put {
		object: String,
		#[serde(flatten)]
		options: R2PutOptions,
	},
	#[serde(rename_all = "camelCase")]
	Delete { objects: Vec<String> },
	#[serde(rename_all = "camelCase")]
	List {
		#[serde(flatten)]
		options: R2ListOptions,
	},
	#[serde(rename_all = "camelCase")]
	CreateMultipartUpload {
		object: String,
		#[serde(flatten)]
		options: R2PutOptions,
	},
	#[serde(rename_all = "camelCase")]
	UploadPart { object: String, upload_id: String, part_number: i32 },
	#[serde(rename_all = "camelCase")]
	CompleteMultipartUpload {
		object: String,
		upload_id: String,
		parts: Vec<R2UploadedPart>,
	},
	#[serde(rename_all = "camelCase")]
	AbortMultipartUpload { object: String, upload_id: String },
}

/// Encodes `metadata ∥ value` with the split in `CF-R2-Metadata-Size`.
fn encode(status: StatusCode, metadata: &serde_json::Value, value: Option<Bytes>) -> Response {
	encode_with_headers(status, metadata, value, HeaderMap::new())
}

fn respond_error(error: R2Error) -> Response {
	let envelope = serde_json::json!({
		"message": error.to_string(),
		"v4code": error.v4code(),
	});
	let mut response_headers = HeaderMap::new();
	if let Ok(value) = envelope.to_string().parse() {
		response_headers.insert(headers::R2_ERROR, value);
	}
	let status =
		StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	// A failed precondition still carries the existing object's metadata so
	// the caller can materialise a bodiless handle.
	if let R2Error::PreconditionFailed(Some(existing)) = &error {
		let metadata = serde_json::to_value(existing).expect("metadata serialises");
		return encode_with_headers(status, &metadata, None, response_headers);
	}
	(status, response_headers).into_response()
}

fn encode_with_headers(
	status: StatusCode,
	metadata: &serde_json::Value,
	value: Option<Bytes>,
	mut response_headers: HeaderMap,
) -> Response {
	let metadata = serde_json::to_vec(metadata).expect("metadata serialises");
	response_headers.insert(
		headers::R2_METADATA_SIZE,
		metadata.len().to_string().parse().expect("length is header-safe"),
	);
	let mut body = metadata;
	if let Some(value) = value {
		body.extend_from_slice(&value);
	}
	(status, response_headers, body).into_response()
}

async fn handle(
	State(state): State<Arc<StorageState>>,
	Path(bucket): Path<String>,
	request_headers: HeaderMap,
	body: Bytes,
) -> Response {
	let gateway = match state.r2_gateway(&bucket, &request_headers).await {
		Ok(gateway) => gateway,
		Err(error) => return respond_error(error),
	};

	// The envelope rides in the header, or in the body's metadata prefix when
	// a metadata size is given (streamed puts take that path).
	let metadata_size = request_headers
		.get(headers::R2_METADATA_SIZE)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.parse::<usize>().ok());
	let (envelope, value) = match metadata_size {
		Some(size) if size <= body.len() => {
			let value = body.slice(size..);
			(serde_json::from_slice::<R2Op>(&body[..size]), value)
		},
		_ => {
			let raw = request_headers
				.get(headers::R2_REQUEST)
				.and_then(|value| value.to_str().ok())
				.unwrap_or_default();
			(serde_json::from_str::<R2Op>(raw), body)
		},
	};
	let op = match envelope {
		Ok(op) => op,
		Err(error) =>
			return respond_error(R2Error::Internal(crate::errors::StoreError::Io(
				std::io::Error::other(format!("malformed op envelope: {error}")),
			))),
	};

	let result = match op {
		R2Op::Head { object } => match gateway.head(&object).await {
			Ok(Some(meta)) => Ok(encode(
				StatusCode::OK,
				&serde_json::to_value(&meta).expect("metadata serialises"),
				None,
			)),
			Ok(None) => Err(R2Error::NoSuchKey),
			Err(error) => Err(error),
		},
		R2Op::Get { object, options } => match gateway.get(&object, options).await {
			Ok(Some(result)) => Ok(encode(
				StatusCode::OK,
				&serde_json::to_value(&result.meta).expect("metadata serialises"),
				result.body,
			)),
			Ok(None) => Err(R2Error::NoSuchKey),
			Err(error) => Err(error),
		},
		R2Op::Put { object, options } => match gateway.put(&object, value, options).await {
			Ok(meta) => Ok(encode(
				StatusCode::OK,
				&serde_json::to_value(&meta).expect("metadata serialises"),
				None,
			)),
			Err(error) => Err(error),
		},
		R2Op::Delete { objects } => match gateway.delete(&objects).await {
			Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
			Err(error) => Err(error),
		},
		R2Op::List { options } => match gateway.list(options).await {
			Ok(page) => Ok(encode(
				StatusCode::OK,
				&serde_json::to_value(&page).expect("page serialises"),
				None,
			)),
			Err(error) => Err(error),
		},
		R2Op::CreateMultipartUpload { object, options } =>
			match gateway.create_multipart_upload(&object, options).await {
				Ok(upload) => Ok(encode(
					StatusCode::OK,
					&serde_json::to_value(&upload).expect("upload serialises"),
					None,
				)),
				Err(error) => Err(error),
			},
		R2Op::UploadPart { object, upload_id, part_number } =>
			match gateway.upload_part(&object, &upload_id, part_number, value).await {
				Ok(etag) => Ok(encode(
					StatusCode::OK,
					&serde_json::json!({ "etag": etag }),
					None,
				)),
				Err(error) => Err(error),
			},
		R2Op::CompleteMultipartUpload { object, upload_id, parts } =>
			match gateway.complete_multipart_upload(&object, &upload_id, &parts).await {
				Ok(meta) => Ok(encode(
					StatusCode::OK,
					&serde_json::to_value(&meta).expect("metadata serialises"),
					None,
				)),
				Err(error) => Err(error),
			},
		R2Op::AbortMultipartUpload { object, upload_id } =>
			match gateway.abort_multipart_upload(&object, &upload_id).await {
				Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
				Err(error) => Err(error),
			},
	};

	match result {
		Ok(response) => response,
		Err(error) => respond_error(error),
	}
}
