//! Subprocess execution under a wall-clock budget and an output byte cap.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::ExecSettings;
use crate::observability::MetricsRegistry;

/// Exit code reported when the budget expires and the child is killed.
pub const EXEC_TIMEOUT_RC: i32 = 124;
/// Exit code reported when the child was terminated by a signal.
pub const EXEC_SIGNALED_RC: i32 = 128;

/// How long to wait for pipe EOF after the child has been reaped.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// A command template: the script path handed to the interpreter plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecRequest {
	pub path: String,
	#[serde(default)]
	pub args: Vec<String>,
}

impl ExecRequest {
	/// Parse a `{path, args?}` object; `None` if `path` is missing or empty.
	/// Non-string arguments are skipped.
	pub fn from_json(v: &serde_json::Value) -> Option<ExecRequest> {
		let path = v.get("path")?.as_str()?.trim();
		if path.is_empty() {
			return None;
		}
		let args = v
			.get("args")
			.and_then(|a| a.as_array())
			.map(|a| {
				a.iter()
					.filter_map(|x| x.as_str().map(str::to_string))
					.collect()
			})
			.unwrap_or_default();
		Some(ExecRequest {
			path: path.to_string(),
			args,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
	pub rc: i32,
	pub elapsed_ms: u64,
	pub stdout: String,
	pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ExecError {
	#[error("failed to spawn {interpreter}: {source}")]
	Spawn {
		interpreter: String,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to wait for child: {0}")]
	Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ExecPolicy {
	pub interpreter: String,
	pub timeout: Duration,
	pub max_output_bytes: usize,
}

impl From<&ExecSettings> for ExecPolicy {
	fn from(s: &ExecSettings) -> Self {
		Self {
			interpreter: s.interpreter.clone(),
			timeout: Duration::from_millis(s.timeout_ms.max(1)),
			max_output_bytes: s.max_output_bytes,
		}
	}
}

/// Seam used by the slave loop and startup sequence to run commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
	async fn run(&self, policy: &ExecPolicy, req: &ExecRequest) -> Result<ExecOutput, ExecError>;
}

/// Runs commands as real subprocesses.
pub struct ProcessRunner {
	metrics: Arc<MetricsRegistry>,
}

impl ProcessRunner {
	pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
		Self { metrics }
	}
}

#[async_trait]
impl CommandRunner for ProcessRunner {
	async fn run(&self, policy: &ExecPolicy, req: &ExecRequest) -> Result<ExecOutput, ExecError> {
		self.metrics.exec_runs_total.inc();
		let out = run_exec(policy, req).await?;
		if out.rc == EXEC_TIMEOUT_RC {
			self.metrics.exec_timeouts_total.inc();
		}
		self.metrics
			.exec_duration_seconds
			.observe(out.elapsed_ms as f64 / 1000.0);
		Ok(out)
	}
}

/// Run `interpreter path args...`, capturing at most `max_output_bytes` of
/// each stream. Output past the cap is read and discarded so the child never
/// blocks on a full pipe.
pub async fn run_exec(policy: &ExecPolicy, req: &ExecRequest) -> Result<ExecOutput, ExecError> {
	let started = Instant::now();
	let mut cmd = Command::new(&policy.interpreter);
	cmd.arg(&req.path)
		.args(&req.args)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true);

	debug!("exec {} {} {:?}", policy.interpreter, req.path, req.args);
	let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
		interpreter: policy.interpreter.clone(),
		source,
	})?;

	let cap = policy.max_output_bytes;
	let stdout = child.stdout.take().map(|s| tokio::spawn(read_capped(s, cap)));
	let stderr = child.stderr.take().map(|s| tokio::spawn(read_capped(s, cap)));

	let rc = match timeout(policy.timeout, child.wait()).await {
		Ok(Ok(status)) => exit_code(status),
		Ok(Err(e)) => return Err(ExecError::Wait(e)),
		Err(_) => {
			warn!(
				"exec {} exceeded {} ms, killing",
				req.path,
				policy.timeout.as_millis()
			);
			if let Err(e) = child.start_kill() {
				debug!("kill failed: {}", e);
			}
			if let Err(e) = child.wait().await {
				debug!("reap after kill failed: {}", e);
			}
			EXEC_TIMEOUT_RC
		}
	};

	let stdout = collect(stdout).await;
	let stderr = collect(stderr).await;

	Ok(ExecOutput {
		rc,
		elapsed_ms: started.elapsed().as_millis() as u64,
		stdout,
		stderr,
	})
}

/// Run each startup command in order. Failures are logged and skipped.
pub async fn run_startup_sequence(
	runner: &dyn CommandRunner,
	policy: &ExecPolicy,
	commands: &[serde_json::Value],
) {
	for (i, raw) in commands.iter().enumerate() {
		let Some(req) = ExecRequest::from_json(raw) else {
			warn!("startup exec #{} has no path, skipped", i + 1);
			continue;
		};
		match runner.run(policy, &req).await {
			Ok(out) => info!(
				"startup exec #{} {} rc={} elapsed={}ms",
				i + 1,
				req.path,
				out.rc,
				out.elapsed_ms
			),
			Err(e) => warn!("startup exec #{} {} failed: {}", i + 1, req.path, e),
		}
	}
}

fn exit_code(status: ExitStatus) -> i32 {
	status.code().unwrap_or(EXEC_SIGNALED_RC)
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Vec<u8> {
	let mut kept = Vec::new();
	let mut chunk = [0u8; 4096];
	loop {
		match reader.read(&mut chunk).await {
			Ok(0) | Err(_) => break,
			Ok(n) => {
				let room = cap.saturating_sub(kept.len());
				kept.extend_from_slice(&chunk[..n.min(room)]);
			}
		}
	}
	kept
}

async fn collect(handle: Option<tokio::task::JoinHandle<Vec<u8>>>) -> String {
	let Some(mut handle) = handle else {
		return String::new();
	};
	match timeout(DRAIN_GRACE, &mut handle).await {
		Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
		Ok(Err(e)) => {
			debug!("output reader failed: {}", e);
			String::new()
		}
		Err(_) => {
			// A grandchild may still hold the pipe open.
			handle.abort();
			String::new()
		}
	}
}
