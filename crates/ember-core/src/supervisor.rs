// SPDX-License-Identifier: GPL-3.0

//! The child-runtime supervisor.
//!
//! One long-running runtime process hosts every worker. It receives the
//! serialised service graph on stdin, reports bound sockets as
//! newline-framed JSON on a dedicated control-pipe file descriptor, and has
//! stdout/stderr forwarded line by line to the host logger. Teardown sends
//! SIGKILL: the gentle signal would wait for open connections to drain.

use command_fds::{CommandFdExt, FdMapping};
use indexmap::IndexMap;
use serde::Deserialize;
use std::{
	io::BufRead,
	path::PathBuf,
	process::Stdio,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// The fd number the runtime receives its control pipe on.
const CONTROL_FD: i32 = 3;

/// Errors raised by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
	/// The runtime binary could not be spawned.
	#[error("failed to spawn runtime at `{path}`: {source}")]
	Spawn {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	/// IO against the child failed.
	#[error("runtime IO error: {0}")]
	Io(#[from] std::io::Error),
	/// The runtime exited before reporting every required socket.
	#[error("runtime exited with {code:?} before reporting sockets {missing:?}")]
	ExitedEarly {
		code: Option<i32>,
		missing: Vec<String>,
	},
	/// The control pipe closed before every required socket reported.
	#[error("control pipe closed before sockets {0:?} reported")]
	ControlClosed(Vec<String>),
	/// The caller aborted the wait for listen events.
	#[error("startup aborted")]
	Aborted,
	/// No runtime binary was configured.
	#[error("no runtime binary configured")]
	MissingRuntime,
}

/// A control-pipe message from the runtime.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum ControlEvent {
	/// A socket bound and is accepting connections.
	#[serde(rename = "listen")]
	Listen { socket: String, port: u16 },
	/// The inspector bound.
	#[serde(rename = "listen-inspector")]
	ListenInspector { port: u16 },
}

/// The ports reported by the runtime after (re)configuration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SocketPorts {
	/// Socket name to bound port.
	pub sockets: IndexMap<String, u16>,
	/// Inspector port, when an inspector socket was requested.
	pub inspector: Option<u16>,
}

impl SocketPorts {
	/// The entry socket's port, when bound.
	pub fn entry(&self) -> Option<u16> {
		self.sockets.get(crate::graph::ENTRY_SOCKET).copied()
	}
}

struct RuntimeProcess {
	child: tokio::process::Child,
	pid: u32,
}

/// Supervises the single child runtime process.
pub struct Supervisor {
	runtime_path: PathBuf,
	current: Option<RuntimeProcess>,
}

impl Supervisor {
	/// Creates a supervisor for the runtime binary at `runtime_path`.
	pub fn new(runtime_path: PathBuf) -> Self {
		Self { runtime_path, current: None }
	}

	/// Whether a runtime process is currently running.
	pub fn is_running(&self) -> bool {
		self.current.is_some()
	}

	/// Spawns the runtime with `graph` on stdin and waits until every socket
	/// in `required_sockets` has reported, or `abort` fires.
	///
	/// Any previously running process must be killed first; reloads do that
	/// after validating the replacement configuration.
	pub async fn spawn(
		&mut self,
		graph: &[u8],
		required_sockets: &[String],
		abort: Option<&CancellationToken>,
	) -> Result<SocketPorts, SupervisorError> {
		let (control_reader, control_writer) = os_pipe::pipe()?;

		let mut command = tokio::process::Command::new(&self.runtime_path);
		command
			.arg(format!("--control-fd={CONTROL_FD}"))
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		command
			.fd_mappings(vec![FdMapping {
				parent_fd: control_writer.into(),
				child_fd: CONTROL_FD,
			}])
			.map_err(|e| SupervisorError::Io(std::io::Error::other(format!("{e:?}"))))?;

		let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
			path: self.runtime_path.clone(),
			source,
		})?;
		let pid = child.id().unwrap_or_default();
		log::debug!("spawned runtime (pid {pid})");

		// The graph travels on stdin; closing it signals the end of config.
		let mut stdin = child.stdin.take().expect("stdin is piped");
		stdin.write_all(graph).await?;
		stdin.shutdown().await?;
		drop(stdin);

		forward_logs(&mut child);

		// Control messages are read on a plain thread: the pipe end is a
		// blocking fd and the reader thread ends at EOF.
		let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
		std::thread::Builder::new()
			.name("ember-runtime-control".into())
			.spawn(move || {
				let reader = std::io::BufReader::new(control_reader);
				for line in reader.lines() {
					let Ok(line) = line else { break };
					match serde_json::from_str::<ControlEvent>(&line) {
						Ok(event) => {
							if event_tx.send(event).is_err() {
								break;
							}
						},
						Err(error) => {
							log::debug!("ignoring malformed control message `{line}`: {error}");
						},
					}
				}
			})?;

		let mut ports = SocketPorts::default();
		let mut missing: Vec<String> = required_sockets.to_vec();
		let never = CancellationToken::new();
		let abort = abort.unwrap_or(&never);
		while !missing.is_empty() {
			tokio::select! {
				event = event_rx.recv() => match event {
					Some(ControlEvent::Listen { socket, port }) => {
						missing.retain(|name| name != &socket);
						ports.sockets.insert(socket, port);
					},
					Some(ControlEvent::ListenInspector { port }) => {
						ports.inspector = Some(port);
					},
					None => {
						kill_process(pid, &mut child).await;
						return Err(SupervisorError::ControlClosed(missing));
					},
				},
				status = child.wait() => {
					let code = status.map(|status| status.code()).unwrap_or(None);
					return Err(SupervisorError::ExitedEarly { code, missing });
				},
				_ = abort.cancelled() => {
					kill_process(pid, &mut child).await;
					return Err(SupervisorError::Aborted);
				},
			}
		}

		self.current = Some(RuntimeProcess { child, pid });
		Ok(ports)
	}

	/// Force-kills the current runtime and reaps it; returns the exit code
	/// when the child exited on its own terms.
	pub async fn kill(&mut self) -> Result<Option<i32>, SupervisorError> {
		let Some(mut process) = self.current.take() else {
			return Ok(None);
		};
		kill_process(process.pid, &mut process.child).await;
		Ok(None)
	}

	/// Reaps a crashed runtime, surfacing its exit code; `None` when the
	/// process is still running.
	pub async fn try_reap(&mut self) -> Option<i32> {
		let process = self.current.as_mut()?;
		match process.child.try_wait() {
			Ok(Some(status)) => {
				let code = status.code();
				log::error!("runtime (pid {}) exited unexpectedly with {code:?}", process.pid);
				self.current = None;
				code
			},
			_ => None,
		}
	}
}

/// SIGKILL, then reap. SIGTERM is deliberately avoided: the runtime treats
/// it as graceful and waits for open connections.
async fn kill_process(pid: u32, child: &mut tokio::process::Child) {
	if pid != 0 {
		let _ = nix::sys::signal::kill(
			nix::unistd::Pid::from_raw(pid as i32),
			nix::sys::signal::Signal::SIGKILL,
		);
	}
	if let Err(error) = child.wait().await {
		log::debug!("failed to reap runtime (pid {pid}): {error}");
	}
}

/// Forwards the runtime's stdout/stderr line by line to the host logger.
fn forward_logs(child: &mut tokio::process::Child) {
	if let Some(stdout) = child.stdout.take() {
		tokio::spawn(async move {
			let mut lines = BufReader::new(stdout).lines();
			while let Ok(Some(line)) = lines.next_line().await {
				log::info!(target: "ember::runtime", "{line}");
			}
		});
	}
	if let Some(stderr) = child.stderr.take() {
		tokio::spawn(async move {
			let mut lines = BufReader::new(stderr).lines();
			while let Ok(Some(line)) = lines.next_line().await {
				let lowered = line.to_ascii_lowercase();
				if lowered.contains("warn") {
					log::warn!(target: "ember::runtime", "{line}");
				} else {
					log::error!(target: "ember::runtime", "{line}");
				}
			}
		});
	}
}

#[cfg(all(test, unix))]
mod tests {
	use super::*;
	use std::os::unix::fs::PermissionsExt;

	fn init_logging() {
		let _ = env_logger::builder().is_test(true).try_init();
	}

	/// Writes an executable fake-runtime script.
	fn fake_runtime(dir: &std::path::Path, body: &str) -> PathBuf {
		let path = dir.join("fake-runtime.sh");
		std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
		let mut permissions = std::fs::metadata(&path).unwrap().permissions();
		permissions.set_mode(0o755);
		std::fs::set_permissions(&path, permissions).unwrap();
		path
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn spawn_reports_ports_and_kill_reaps() {
		init_logging();
		let dir = tempfile::tempdir().unwrap();
		let script = fake_runtime(
			dir.path(),
			concat!(
				"cat > /dev/null\n",
				"echo '{\"event\":\"listen-inspector\",\"port\":9229}' >&3\n",
				"echo '{\"event\":\"listen\",\"socket\":\"entry\",\"port\":8787}' >&3\n",
				"sleep 60",
			),
		);

		let mut supervisor = Supervisor::new(script);
		let ports = supervisor
			.spawn(b"{}", &["entry".to_string()], None)
			.await
			.unwrap();
		assert_eq!(ports.entry(), Some(8787));
		assert_eq!(ports.inspector, Some(9229));
		assert!(supervisor.is_running());

		supervisor.kill().await.unwrap();
		assert!(!supervisor.is_running());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn early_exit_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let script = fake_runtime(dir.path(), "cat > /dev/null\nexit 7");

		let mut supervisor = Supervisor::new(script);
		let result = supervisor.spawn(b"{}", &["entry".to_string()], None).await;
		match result {
			Err(SupervisorError::ExitedEarly { code, missing }) => {
				assert_eq!(code, Some(7));
				assert_eq!(missing, vec!["entry".to_string()]);
			},
			Err(SupervisorError::ControlClosed(missing)) => {
				// The pipe may close before the exit is observed.
				assert_eq!(missing, vec!["entry".to_string()]);
			},
			other => panic!("expected an early-exit error, got {other:?}"),
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn abort_kills_the_child() {
		let dir = tempfile::tempdir().unwrap();
		let script = fake_runtime(dir.path(), "cat > /dev/null\nsleep 60");

		let token = CancellationToken::new();
		let abort = token.clone();
		tokio::spawn(async move {
			tokio::time::sleep(std::time::Duration::from_millis(100)).await;
			abort.cancel();
		});

		let mut supervisor = Supervisor::new(script);
		let result = supervisor
			.spawn(b"{}", &["entry".to_string()], Some(&token))
			.await;
		assert!(matches!(result, Err(SupervisorError::Aborted)));
		assert!(!supervisor.is_running());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn missing_binary_is_a_spawn_error() {
		let mut supervisor = Supervisor::new(PathBuf::from("/nonexistent/runtime"));
		let result = supervisor.spawn(b"{}", &[], None).await;
		assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn graph_arrives_on_stdin() {
		let dir = tempfile::tempdir().unwrap();
		let out = dir.path().join("received");
		let script = fake_runtime(
			dir.path(),
			&format!(
				"cat > {}\necho '{{\"event\":\"listen\",\"socket\":\"entry\",\"port\":1}}' >&3\nsleep 60",
				out.display()
			),
		);

		let mut supervisor = Supervisor::new(script);
		supervisor
			.spawn(b"graph-bytes", &["entry".to_string()], None)
			.await
			.unwrap();
		let received = std::fs::read(&out).unwrap();
		assert_eq!(received, b"graph-bytes");
		supervisor.kill().await.unwrap();
	}
}
