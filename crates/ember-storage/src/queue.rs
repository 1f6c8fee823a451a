// SPDX-License-Identifier: GPL-3.0

//! The queue broker.
//!
//! One broker per instance. Producers enqueue messages; each queue has at
//! most one consumer, declared at configuration time. Pending messages are
//! batched by size and timeout, delivered through a [`QueueDispatcher`], and
//! retried on failure until they exhaust their retries and route to the
//! queue's dead-letter queue (or are dropped).

use crate::errors::QueueError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
	collections::HashMap,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
	time::Duration,
};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};

/// Maximum size of a single message body in bytes.
pub const MAX_MESSAGE_SIZE: u64 = 128_000;
/// Maximum number of messages per batch.
pub const MAX_BATCH_COUNT: usize = 100;
/// Maximum total body bytes per batch.
pub const MAX_BATCH_SIZE: u64 = 288_000;

/// How a message body should be interpreted by the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueContentType {
	Text,
	Json,
	Bytes,
	V8,
}

impl QueueContentType {
	/// Parses the wire tag used on the loopback surface.
	pub fn parse(tag: &str) -> Result<Self, QueueError> {
		match tag {
			"text" => Ok(Self::Text),
			"json" => Ok(Self::Json),
			"bytes" => Ok(Self::Bytes),
			"v8" => Ok(Self::V8),
			other => Err(QueueError::UnsupportedContentType(other.to_string())),
		}
	}
}

/// A message as delivered to a consumer.
#[derive(Clone, Debug)]
pub struct QueueMessage {
	/// Opaque message id.
	pub id: String,
	/// Enqueue time in unix millis.
	pub timestamp: i64,
	/// The raw body.
	pub body: Bytes,
	/// Body interpretation tag.
	pub content_type: QueueContentType,
	/// Delivery attempts so far (1 on first delivery).
	pub attempts: u32,
}

/// A batch handed to the dispatcher.
#[derive(Clone, Debug)]
pub struct QueueBatch {
	/// The queue the batch belongs to.
	pub queue: String,
	/// The messages, in enqueue order.
	pub messages: Vec<QueueMessage>,
}

/// Outcome of one delivery, echoing the consumer's acks and retries.
#[derive(Clone, Debug, Default)]
pub struct QueueDispatchResult {
	/// Retry every message in the batch.
	pub retry_all: bool,
	/// Ids to retry explicitly.
	pub retries: Vec<String>,
}

/// Raised when a batch cannot be delivered at all.
#[derive(Debug, Error)]
#[error("queue delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Delivers batches to a queue's consumer, normally over an internal service
/// binding into the child runtime.
#[async_trait]
pub trait QueueDispatcher: Send + Sync {
	/// Delivers `batch` and reports which messages the consumer retried.
	async fn dispatch(&self, batch: QueueBatch) -> Result<QueueDispatchResult, DeliveryError>;
}

/// A queue consumer declaration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QueueConsumer {
	/// The queue consumed.
	pub queue: String,
	/// Messages per delivered batch.
	#[serde(default = "default_batch_size")]
	pub max_batch_size: usize,
	/// How long a partial batch may wait before delivery, in millis.
	#[serde(default = "default_batch_timeout")]
	pub max_batch_timeout_ms: u64,
	/// Delivery attempts beyond the first before dead-lettering.
	#[serde(default = "default_retries")]
	pub max_retries: u32,
	/// Where exhausted messages go; dropped when absent.
	#[serde(default)]
	pub dead_letter_queue: Option<String>,
}

fn default_batch_size() -> usize {
	5
}
fn default_batch_timeout() -> u64 {
	1000
}
fn default_retries() -> u32 {
	2
}

struct QueueState {
	pending: Vec<QueueMessage>,
	flush: Option<JoinHandle<()>>,
}

struct BrokerInner {
	dispatcher: Arc<dyn QueueDispatcher>,
	consumers: HashMap<String, QueueConsumer>,
	queues: Mutex<HashMap<String, QueueState>>,
	clock: crate::Clock,
	id_counter: AtomicU64,
}

/// The per-instance queue broker.
#[derive(Clone)]
pub struct QueueBroker {
	inner: Arc<BrokerInner>,
}

impl QueueBroker {
	/// Builds a broker from the consumer declarations of every worker.
	///
	/// Fails when two workers consume the same queue or when dead-letter
	/// chains form a cycle.
	pub fn new(
		consumers: Vec<QueueConsumer>,
		dispatcher: Arc<dyn QueueDispatcher>,
		clock: crate::Clock,
	) -> Result<Self, QueueError> {
		let mut map = HashMap::new();
		for consumer in consumers {
			if map.contains_key(&consumer.queue) {
				return Err(QueueError::MultipleConsumers(consumer.queue));
			}
			map.insert(consumer.queue.clone(), consumer);
		}
		for queue in map.keys() {
			let mut visited = vec![queue.clone()];
			let mut current = queue;
			while let Some(dlq) =
				map.get(current).and_then(|consumer| consumer.dead_letter_queue.as_ref())
			{
				if visited.contains(dlq) {
					return Err(QueueError::DeadLetterQueueCycle(queue.clone()));
				}
				visited.push(dlq.clone());
				current = dlq;
			}
		}
		Ok(Self {
			inner: Arc::new(BrokerInner {
				dispatcher,
				consumers: map,
				queues: Mutex::new(HashMap::new()),
				clock,
				id_counter: AtomicU64::new(0),
			}),
		})
	}

	/// Enqueues one message.
	pub async fn send(
		&self,
		queue: &str,
		body: Bytes,
		content_type: QueueContentType,
	) -> Result<(), QueueError> {
		if body.len() as u64 > MAX_MESSAGE_SIZE {
			return Err(QueueError::PayloadTooLarge {
				size: body.len() as u64,
				limit: MAX_MESSAGE_SIZE,
			});
		}
		self.enqueue(queue, vec![(body, content_type)], 0).await
	}

	/// Enqueues a batch of messages atomically.
	pub async fn send_batch(
		&self,
		queue: &str,
		messages: Vec<(Bytes, QueueContentType)>,
	) -> Result<(), QueueError> {
		if messages.len() > MAX_BATCH_COUNT {
			return Err(QueueError::TooManyMessages(messages.len(), MAX_BATCH_COUNT));
		}
		let total: u64 = messages.iter().map(|(body, _)| body.len() as u64).sum();
		if total > MAX_BATCH_SIZE {
			return Err(QueueError::PayloadTooLarge { size: total, limit: MAX_BATCH_SIZE });
		}
		for (body, _) in &messages {
			if body.len() as u64 > MAX_MESSAGE_SIZE {
				return Err(QueueError::PayloadTooLarge {
					size: body.len() as u64,
					limit: MAX_MESSAGE_SIZE,
				});
			}
		}
		self.enqueue(queue, messages, 0).await
	}

	async fn enqueue(
		&self,
		queue: &str,
		messages: Vec<(Bytes, QueueContentType)>,
		attempts: u32,
	) -> Result<(), QueueError> {
		let Some(consumer) = self.inner.consumers.get(queue) else {
			// No consumer: accept and drop, the producer contract still holds.
			log::debug!("queue `{queue}` has no consumer, dropping {} message(s)", messages.len());
			return Ok(());
		};
		let now = (self.inner.clock)();
		let mut queues = self.inner.queues.lock().await;
		let state = queues
			.entry(queue.to_string())
			.or_insert_with(|| QueueState { pending: Vec::new(), flush: None });
		for (body, content_type) in messages {
			let id = format!("{:032x}", self.inner.id_counter.fetch_add(1, Ordering::Relaxed));
			state.pending.push(QueueMessage { id, timestamp: now, body, content_type, attempts });
		}

		if state.pending.len() >= consumer.max_batch_size {
			if let Some(flush) = state.flush.take() {
				flush.abort();
			}
			let broker = self.clone();
			let queue = queue.to_string();
			tokio::spawn(async move { broker.flush(&queue).await });
		} else if state.flush.is_none() {
			let broker = self.clone();
			let queue = queue.to_string();
			let timeout = Duration::from_millis(consumer.max_batch_timeout_ms);
			state.flush = Some(tokio::spawn(async move {
				tokio::time::sleep(timeout).await;
				broker.flush(&queue).await;
			}));
		}
		Ok(())
	}

	/// Delivers up to one batch of pending messages for `queue`.
	fn flush<'a>(
		&'a self,
		queue: &'a str,
	) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
		Box::pin(async move {
		let Some(consumer) = self.inner.consumers.get(queue) else { return };
		let batch = {
			let mut queues = self.inner.queues.lock().await;
			let Some(state) = queues.get_mut(queue) else { return };
			state.flush = None;
			if state.pending.is_empty() {
				return;
			}
			let take = state.pending.len().min(MAX_BATCH_COUNT);
			let mut messages: Vec<QueueMessage> = state.pending.drain(..take).collect();
			for message in &mut messages {
				message.attempts += 1;
			}
			QueueBatch { queue: queue.to_string(), messages }
		};

		let result = self.inner.dispatcher.dispatch(batch.clone()).await;
		let (retry_all, retries) = match result {
			Ok(outcome) => (outcome.retry_all, outcome.retries),
			Err(error) => {
				log::warn!("delivery to consumer of queue `{queue}` failed: {error}");
				(true, vec![])
			},
		};

		let mut exhausted = Vec::new();
		let mut requeue = Vec::new();
		for message in batch.messages {
			let should_retry = retry_all || retries.contains(&message.id);
			if !should_retry {
				continue;
			}
			if message.attempts > consumer.max_retries {
				exhausted.push(message);
			} else {
				requeue.push(message);
			}
		}

		if !requeue.is_empty() {
			let mut queues = self.inner.queues.lock().await;
			if let Some(state) = queues.get_mut(queue) {
				state.pending.extend(requeue);
				if state.flush.is_none() {
					let broker = self.clone();
					let queue = queue.to_string();
					let timeout = Duration::from_millis(consumer.max_batch_timeout_ms);
					state.flush = Some(tokio::spawn(async move {
						tokio::time::sleep(timeout).await;
						broker.flush(&queue).await;
					}));
				}
			}
		}

		if !exhausted.is_empty() {
			match &consumer.dead_letter_queue {
				Some(dead_letter_queue) => {
					log::warn!(
						"moving {} message(s) from `{queue}` to dead letter queue `{dead_letter_queue}`",
						exhausted.len()
					);
					let messages =
						exhausted.into_iter().map(|m| (m.body, m.content_type)).collect();
					// Dead-lettered messages start a fresh attempt counter.
					if let Err(error) = self.enqueue(dead_letter_queue, messages, 0).await {
						log::error!("failed to dead-letter messages: {error}");
					}
				},
				None => {
					log::warn!(
						"dropping {} message(s) from `{queue}` after exhausting retries",
						exhausted.len()
					);
				},
			}
		}
		})
	}

	/// Aborts pending flush timers; queued messages are dropped.
	pub async fn dispose(&self) {
		let mut queues = self.inner.queues.lock().await;
		for state in queues.values_mut() {
			if let Some(flush) = state.flush.take() {
				flush.abort();
			}
			state.pending.clear();
		}
	}
}
