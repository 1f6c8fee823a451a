// SPDX-License-Identifier: GPL-3.0

//! Queue routes: `POST /:queue/message` and `POST /:queue/batch`.

use super::{StorageState, error_envelope, headers};
use crate::queue::QueueContentType;
use axum::{
	Json, Router,
	extract::{Path, State},
	http::{HeaderMap, StatusCode},
	response::{IntoResponse, Response},
	routing::post,
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;

pub(super) fn router(state: Arc<StorageState>) -> Router {
	Router::new()
		.route("/:queue/message", post(message))
		.route("/:queue/batch", post(batch))
		.with_state(state)
}

fn broker_or_error(state: &StorageState) -> Result<crate::QueueBroker, Response> {
	state
		.queue_broker()
		.ok_or_else(|| error_envelope(500, "queue broker is not configured".into(), 10001))
}

fn content_type_from(request_headers: &HeaderMap) -> Result<QueueContentType, Response> {
	let tag = request_headers
		.get(headers::QUEUE_CONTENT_TYPE)
		.and_then(|value| value.to_str().ok())
		.unwrap_or("text");
	QueueContentType::parse(tag)
		.map_err(|error| error_envelope(error.status(), error.to_string(), error.v4code()))
}

async fn message(
	State(state): State<Arc<StorageState>>,
	Path(queue): Path<String>,
	request_headers: HeaderMap,
	body: Bytes,
) -> Response {
	let broker = match broker_or_error(&state) {
		Ok(broker) => broker,
		Err(response) => return response,
	};
	let content_type = match content_type_from(&request_headers) {
		Ok(content_type) => content_type,
		Err(response) => return response,
	};
	match broker.send(&queue, body, content_type).await {
		Ok(()) => StatusCode::OK.into_response(),
		Err(error) => error_envelope(error.status(), error.to_string(), error.v4code()),
	}
}

/// One message of a batch request; bodies are base64 so the batch can be JSON.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
	body: String,
	#[serde(default)]
	content_type: Option<QueueContentType>,
}

async fn batch(
	State(state): State<Arc<StorageState>>,
	Path(queue): Path<String>,
	Json(messages): Json<Vec<WireMessage>>,
) -> Response {
	let broker = match broker_or_error(&state) {
		Ok(broker) => broker,
		Err(response) => return response,
	};
	let mut decoded = Vec::with_capacity(messages.len());
	for message in messages {
		let Ok(body) = BASE64.decode(&message.body) else {
			return error_envelope(400, "message body is not valid base64".into(), 10055);
		};
		decoded
			.push((Bytes::from(body), message.content_type.unwrap_or(QueueContentType::Text)));
	}
	let count = decoded.len();
	let bytes: usize = decoded.iter().map(|(body, _)| body.len()).sum();
	match broker.send_batch(&queue, decoded).await {
		Ok(()) => {
			let mut response_headers = HeaderMap::new();
			if let Ok(value) = count.to_string().parse() {
				response_headers.insert(headers::QUEUE_BATCH_COUNT, value);
			}
			if let Ok(value) = bytes.to_string().parse() {
				response_headers.insert(headers::QUEUE_BATCH_BYTES, value);
			}
			(StatusCode::OK, response_headers).into_response()
		},
		Err(error) => error_envelope(error.status(), error.to_string(), error.v4code()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		StorageRoutes,
		queue::{
			DeliveryError, QueueBatch, QueueBroker, QueueConsumer, QueueDispatchResult,
			QueueDispatcher,
		},
		wall_clock,
	};
	use async_trait::async_trait;
	use tokio::sync::Mutex;

	struct Recording {
		batches: Mutex<Vec<QueueBatch>>,
	}

	#[async_trait]
	impl QueueDispatcher for Recording {
		async fn dispatch(&self, batch: QueueBatch) -> Result<QueueDispatchResult, DeliveryError> {
			self.batches.lock().await.push(batch);
			Ok(QueueDispatchResult::default())
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn messages_flow_to_the_broker() {
		let routes = StorageRoutes::new(wall_clock(), false);
		let dispatcher = Arc::new(Recording { batches: Mutex::new(Vec::new()) });
		let broker = QueueBroker::new(
			vec![QueueConsumer {
				queue: "q".into(),
				max_batch_size: 1,
				max_batch_timeout_ms: 1000,
				max_retries: 0,
				dead_letter_queue: None,
			}],
			dispatcher.clone(),
			wall_clock(),
		)
		.unwrap();
		routes.register_queue_broker(broker);

		let response = message(
			State(routes.state.clone()),
			Path("q".into()),
			HeaderMap::new(),
			Bytes::from_static(b"payload"),
		)
		.await;
		assert_eq!(response.status(), StatusCode::OK);

		// Batch size 1 flushes immediately.
		tokio::time::sleep(std::time::Duration::from_millis(50)).await;
		let batches = dispatcher.batches.lock().await;
		assert_eq!(batches.len(), 1);
		assert_eq!(&batches[0].messages[0].body[..], b"payload");
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn batches_report_counts() {
		let routes = StorageRoutes::new(wall_clock(), false);
		let dispatcher = Arc::new(Recording { batches: Mutex::new(Vec::new()) });
		let broker = QueueBroker::new(vec![], dispatcher, wall_clock()).unwrap();
		routes.register_queue_broker(broker);

		let payload = BASE64.encode(b"data");
		let response = batch(
			State(routes.state.clone()),
			Path("q".into()),
			Json(vec![
				serde_json::from_value(serde_json::json!({ "body": payload })).unwrap(),
				serde_json::from_value(serde_json::json!({
					"body": payload,
					"contentType": "json",
				}))
				.unwrap(),
			]),
		)
		.await;
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(response.headers().get(headers::QUEUE_BATCH_COUNT).unwrap(), "2");
		assert_eq!(response.headers().get(headers::QUEUE_BATCH_BYTES).unwrap(), "8");
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn missing_broker_is_an_internal_error() {
		let routes = StorageRoutes::new(wall_clock(), false);
		let response = message(
			State(routes.state.clone()),
			Path("q".into()),
			HeaderMap::new(),
			Bytes::new(),
		)
		.await;
		assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
	}
}
