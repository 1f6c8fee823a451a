// SPDX-License-Identifier: GPL-3.0

//! Event dispatch into the child runtime.
//!
//! Queue batches and scheduled events are delivered to the entry worker
//! through reserved handler paths on the entry socket; `dispatch_fetch`
//! forwards plain HTTP the same way.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use ember_core::cron::{DispatchError, ScheduledDispatcher};
use ember_storage::queue::{DeliveryError, QueueBatch, QueueDispatchResult, QueueDispatcher};
use serde::Deserialize;
use std::sync::{Arc, RwLock};

/// Reserved path for queue batch delivery.
pub(crate) const QUEUE_HANDLER_PATH: &str = "/cdn-cgi/handler/queue";
/// Reserved path for scheduled events.
pub(crate) const SCHEDULED_HANDLER_PATH: &str = "/cdn-cgi/handler/scheduled";

/// The entry socket's bound port, shared with the dispatchers and updated on
/// every (re)start.
#[derive(Clone, Default)]
pub(crate) struct EntryPort(Arc<RwLock<Option<u16>>>);

impl EntryPort {
	pub(crate) fn set(&self, port: Option<u16>) {
		*self.0.write().expect("entry port lock poisoned") = port;
	}

	pub(crate) fn get(&self) -> Option<u16> {
		*self.0.read().expect("entry port lock poisoned")
	}
}

/// Delivers queue batches to the consumer worker over the entry socket.
pub(crate) struct RuntimeQueueDispatcher {
	pub http: reqwest::Client,
	pub entry: EntryPort,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct QueueHandlerReply {
	retry_all: bool,
	retries: Vec<String>,
}

#[async_trait]
impl QueueDispatcher for RuntimeQueueDispatcher {
	async fn dispatch(&self, batch: QueueBatch) -> Result<QueueDispatchResult, DeliveryError> {
		let port = self
			.entry
			.get()
			.ok_or_else(|| DeliveryError("runtime is not started".into()))?;
		let messages: Vec<serde_json::Value> = batch
			.messages
			.iter()
			.map(|message| {
				serde_json::json!({
					"id": message.id,
					"timestamp": message.timestamp,
					"body": BASE64.encode(&message.body),
					"contentType": message.content_type,
					"attempts": message.attempts,
				})
			})
			.collect();
		let response = self
			.http
			.post(format!("http://127.0.0.1:{port}{QUEUE_HANDLER_PATH}"))
			.json(&serde_json::json!({ "queue": batch.queue, "messages": messages }))
			.send()
			.await
			.map_err(|e| DeliveryError(e.to_string()))?;
		if !response.status().is_success() {
			return Err(DeliveryError(format!(
				"queue handler answered {}",
				response.status()
			)));
		}
		let reply: QueueHandlerReply =
			response.json().await.unwrap_or_default();
		Ok(QueueDispatchResult { retry_all: reply.retry_all, retries: reply.retries })
	}
}

/// Delivers scheduled events over the entry socket.
pub(crate) struct RuntimeScheduledDispatcher {
	pub http: reqwest::Client,
	pub entry: EntryPort,
}

#[async_trait]
impl ScheduledDispatcher for RuntimeScheduledDispatcher {
	async fn dispatch(
		&self,
		cron: &str,
		scheduled_time: DateTime<Utc>,
	) -> Result<(), DispatchError> {
		let port = self
			.entry
			.get()
			.ok_or_else(|| DispatchError("runtime is not started".into()))?;
		let mut url = url::Url::parse(&format!("http://127.0.0.1:{port}{SCHEDULED_HANDLER_PATH}"))
			.expect("static URL parses");
		url.query_pairs_mut()
			.append_pair("cron", cron)
			.append_pair("time", &scheduled_time.timestamp_millis().to_string());
		let response = self
			.http
			.post(url)
			.send()
			.await
			.map_err(|e| DispatchError(e.to_string()))?;
		if !response.status().is_success() {
			return Err(DispatchError(format!(
				"scheduled handler answered {}",
				response.status()
			)));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;
	use ember_storage::queue::{QueueContentType, QueueMessage};

	fn port_of(server: &mockito::ServerGuard) -> u16 {
		url::Url::parse(&server.url()).unwrap().port().unwrap()
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn queue_batches_post_to_the_handler_path() {
		let mut server = mockito::Server::new_async().await;
		let mock = server
			.mock("POST", QUEUE_HANDLER_PATH)
			.with_status(200)
			.with_body(r#"{"retryAll":false,"retries":["m2"]}"#)
			.create_async()
			.await;

		let entry = EntryPort::default();
		entry.set(Some(port_of(&server)));
		let dispatcher =
			RuntimeQueueDispatcher { http: reqwest::Client::new(), entry };

		let outcome = dispatcher
			.dispatch(QueueBatch {
				queue: "q".into(),
				messages: vec![QueueMessage {
					id: "m1".into(),
					timestamp: 0,
					body: Bytes::from_static(b"data"),
					content_type: QueueContentType::Text,
					attempts: 1,
				}],
			})
			.await
			.unwrap();
		assert!(!outcome.retry_all);
		assert_eq!(outcome.retries, vec!["m2".to_string()]);
		mock.assert_async().await;
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn scheduled_events_carry_cron_and_time() {
		let mut server = mockito::Server::new_async().await;
		let mock = server
			.mock("POST", SCHEDULED_HANDLER_PATH)
			.match_query(mockito::Matcher::AllOf(vec![
				mockito::Matcher::UrlEncoded("cron".into(), "*/5 * * * *".into()),
				mockito::Matcher::Regex("time=\\d+".into()),
			]))
			.with_status(200)
			.create_async()
			.await;

		let entry = EntryPort::default();
		entry.set(Some(port_of(&server)));
		let dispatcher =
			RuntimeScheduledDispatcher { http: reqwest::Client::new(), entry };
		dispatcher.dispatch("*/5 * * * *", Utc::now()).await.unwrap();
		mock.assert_async().await;
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn missing_runtime_is_a_delivery_error() {
		let dispatcher = RuntimeQueueDispatcher {
			http: reqwest::Client::new(),
			entry: EntryPort::default(),
		};
		let result = dispatcher
			.dispatch(QueueBatch { queue: "q".into(), messages: vec![] })
			.await;
		assert!(result.is_err());
	}
}
