// SPDX-License-Identifier: GPL-3.0

//! Scheduled triggers.
//!
//! Each cron spec drives one task that sleeps until the next fire time and
//! dispatches a scheduled event. Time is virtual: the scheduler anchors at a
//! start instant and advances with the tokio clock, so a paused test clock
//! drives the schedule deterministically.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use std::{str::FromStr, sync::Arc};
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors raised when parsing cron specs.
#[derive(Debug, Error)]
#[error("invalid cron spec `{spec}`: {message}")]
pub struct CronError {
	pub spec: String,
	pub message: String,
}

/// Raised when a scheduled event cannot be delivered.
#[derive(Debug, Error)]
#[error("scheduled dispatch failed: {0}")]
pub struct DispatchError(pub String);

/// Delivers scheduled events to a worker.
#[async_trait]
pub trait ScheduledDispatcher: Send + Sync {
	/// Dispatches one scheduled event for `cron` at `scheduled_time`.
	async fn dispatch(
		&self,
		cron: &str,
		scheduled_time: DateTime<Utc>,
	) -> Result<(), DispatchError>;
}

/// Normalises a 5-field spec to the 6-field form the parser expects.
fn normalise(spec: &str) -> String {
	if spec.split_whitespace().count() == 5 {
		format!("0 {spec}")
	} else {
		spec.to_string()
	}
}

/// Parses and validates a cron spec.
pub fn parse_spec(spec: &str) -> Result<Schedule, CronError> {
	Schedule::from_str(&normalise(spec)).map_err(|e| CronError {
		spec: spec.to_string(),
		message: e.to_string(),
	})
}

/// The running scheduler; dropping or stopping it cuts off dispatch.
pub struct CronScheduler {
	tasks: Vec<JoinHandle<()>>,
}

impl CronScheduler {
	/// Validates every spec and starts one task per spec, anchored at
	/// `start_at` (fires scheduled exactly at the anchor are delivered).
	pub fn start(
		specs: &[String],
		start_at: DateTime<Utc>,
		dispatcher: Arc<dyn ScheduledDispatcher>,
	) -> Result<Self, CronError> {
		// Validate everything before the first task starts: a bad spec must
		// not leave earlier schedules running.
		let schedules = specs
			.iter()
			.map(|spec| parse_spec(spec).map(|schedule| (spec.clone(), schedule)))
			.collect::<Result<Vec<_>, _>>()?;

		let tasks = schedules
			.into_iter()
			.map(|(spec, schedule)| {
				let dispatcher = Arc::clone(&dispatcher);
				tokio::spawn(async move {
					run_schedule(schedule, spec, start_at, dispatcher).await;
				})
			})
			.collect();
		Ok(Self { tasks })
	}

	/// Stops every schedule; no further dispatches occur.
	pub fn stop(&mut self) {
		for task in self.tasks.drain(..) {
			task.abort();
		}
	}
}

impl Drop for CronScheduler {
	fn drop(&mut self) {
		self.stop();
	}
}

async fn run_schedule(
	schedule: Schedule,
	spec: String,
	start_at: DateTime<Utc>,
	dispatcher: Arc<dyn ScheduledDispatcher>,
) {
	let origin = tokio::time::Instant::now();
	// Back the anchor off by a tick so a fire time equal to the anchor is
	// not skipped by the strictly-after iterator.
	let mut after = start_at - ChronoDuration::milliseconds(1);
	loop {
		let Some(next) = schedule.after(&after).next() else { break };
		let elapsed =
			ChronoDuration::from_std(origin.elapsed()).unwrap_or(ChronoDuration::zero());
		let now = start_at + elapsed;
		let wait = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);
		tokio::time::sleep(wait).await;
		if let Err(error) = dispatcher.dispatch(&spec, next).await {
			log::error!("{error}");
		}
		after = next;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::sync::Mutex;

	struct Recording {
		events: Mutex<Vec<(String, DateTime<Utc>)>>,
	}

	#[async_trait]
	impl ScheduledDispatcher for Recording {
		async fn dispatch(
			&self,
			cron: &str,
			scheduled_time: DateTime<Utc>,
		) -> Result<(), DispatchError> {
			self.events.lock().await.push((cron.to_string(), scheduled_time));
			Ok(())
		}
	}

	fn midnight() -> DateTime<Utc> {
		DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().to_utc()
	}

	#[test]
	fn five_field_specs_parse() {
		assert!(parse_spec("*/5 * * * *").is_ok());
		assert!(parse_spec("0 0 * * *").is_ok());
		assert!(parse_spec("not a cron").is_err());
		assert!(parse_spec("61 * * * *").is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn fires_at_anchor_and_every_interval() {
		let dispatcher = Arc::new(Recording { events: Mutex::new(Vec::new()) });
		let mut scheduler = CronScheduler::start(
			&["*/5 * * * *".to_string()],
			midnight(),
			dispatcher.clone(),
		)
		.unwrap();

		// Advance past 00:05:00; the paused clock auto-advances sleeps.
		tokio::time::sleep(std::time::Duration::from_secs(301)).await;

		let events = dispatcher.events.lock().await.clone();
		let times: Vec<String> =
			events.iter().map(|(_, time)| time.format("%H:%M:%S").to_string()).collect();
		assert_eq!(times, vec!["00:00:00", "00:05:00"]);

		// After stop, the schedule is dead.
		scheduler.stop();
		tokio::time::sleep(std::time::Duration::from_secs(600)).await;
		assert_eq!(dispatcher.events.lock().await.len(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn multiple_specs_run_independently() {
		let dispatcher = Arc::new(Recording { events: Mutex::new(Vec::new()) });
		let _scheduler = CronScheduler::start(
			&["*/5 * * * *".to_string(), "*/2 * * * *".to_string()],
			midnight(),
			dispatcher.clone(),
		)
		.unwrap();

		tokio::time::sleep(std::time::Duration::from_secs(121)).await;
		let events = dispatcher.events.lock().await.clone();
		let fives = events.iter().filter(|(cron, _)| cron == "*/5 * * * *").count();
		let twos = events.iter().filter(|(cron, _)| cron == "*/2 * * * *").count();
		// 00:00 for both, then 00:02 for the two-minute spec.
		assert_eq!(fives, 1);
		assert_eq!(twos, 2);
	}

	#[tokio::test(start_paused = true)]
	async fn invalid_specs_fail_before_any_task_starts() {
		let dispatcher = Arc::new(Recording { events: Mutex::new(Vec::new()) });
		let result = CronScheduler::start(
			&["*/5 * * * *".to_string(), "bad".to_string()],
			midnight(),
			dispatcher,
		);
		assert!(matches!(result, Err(CronError { spec, .. }) if spec == "bad"));
	}
}
