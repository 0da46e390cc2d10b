//! Slave side: periodic registration with the master and command application.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper::header::{CONNECTION, CONTENT_TYPE};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::reference::{HttpTarget, parse_master_reference, resolve_target};
use crate::config::Settings;
use crate::exec::{ExecPolicy, ExecRequest};
use crate::scan::MAX_NODES;
use crate::state::AppState;

/// Largest register response the slave will read.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;
const IDLE_DELAY: Duration = Duration::from_secs(2);
const RETRY_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// What the slave knows about its own assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveTracking {
	pub applied_generation: u64,
	pub last_received_generation: u64,
	/// One-based; 0 when unassigned.
	pub current_slot: usize,
	pub current_slot_label: String,
	pub active_override_generation: u64,
}

#[derive(Debug, Default)]
pub struct SlaveState {
	inner: Mutex<SlaveTracking>,
}

impl SlaveState {
	pub async fn snapshot(&self) -> SlaveTracking {
		self.inner.lock().await.clone()
	}

	/// Forget everything learned from the previous master.
	pub async fn reset(&self) {
		*self.inner.lock().await = SlaveTracking::default();
	}

	async fn update<F: FnOnce(&mut SlaveTracking)>(&self, f: F) {
		f(&mut *self.inner.lock().await);
	}
}

/// Fields of a register response the slave acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterReply {
	pub waiting: bool,
	pub generation: u64,
	pub slot: usize,
	pub slot_label: String,
	pub commands: Vec<Value>,
}

impl RegisterReply {
	pub fn from_json(v: &Value) -> Self {
		let non_negative = |key: &str| v.get(key).and_then(Value::as_i64).unwrap_or(0).max(0) as u64;
		Self {
			waiting: v.get("status").and_then(Value::as_str) == Some("waiting"),
			generation: non_negative("generation"),
			slot: non_negative("slot") as usize,
			slot_label: v
				.get("slot_label")
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_string(),
			commands: v
				.get("commands")
				.and_then(Value::as_array)
				.cloned()
				.unwrap_or_default(),
		}
	}
}

/// Body posted to the master on every registration.
pub fn registration_body(settings: &Settings, ack_generation: u64) -> Value {
	let mut body = json!({
		"id": settings.sync.id,
		"ack_generation": ack_generation,
	});
	let caps = &settings.caps;
	for (key, value) in [
		("device", &caps.device),
		("role", &caps.role),
		("version", &caps.version),
	] {
		if !value.is_empty() {
			body[key] = json!(value);
		}
	}
	if !caps.caps.is_empty() {
		body["caps"] = json!(caps.caps);
	}
	body
}

fn register_interval(settings: &Settings) -> Duration {
	match settings.sync.register_interval_s {
		n if n > 0 => Duration::from_secs(n as u64),
		_ => DEFAULT_INTERVAL,
	}
}

fn request_timeout(settings: &Settings) -> Duration {
	match settings.sync.register_interval_s {
		n if n > 0 => Duration::from_millis(n as u64 * 1000),
		_ => DEFAULT_TIMEOUT,
	}
}

/// Handle to the background registration loop.
pub struct SlaveWorker {
	handle: JoinHandle<()>,
}

impl SlaveWorker {
	pub fn spawn(state: AppState, stop: watch::Receiver<bool>) -> Self {
		let handle = tokio::spawn(async move {
			SlaveLoop::new(state).run(stop).await;
		});
		Self { handle }
	}

	/// Wait for the loop to observe the stop signal and exit.
	pub async fn join(self) {
		if let Err(e) = self.handle.await {
			warn!("slave loop ended abnormally: {}", e);
		}
	}
}

/// Remembers the last failure so an unchanged one is logged once.
#[derive(Debug, Default)]
struct FailureLog {
	last: Option<String>,
	repeats: u64,
}

impl FailureLog {
	/// True when `msg` differs from the previous failure and should be logged.
	fn note(&mut self, msg: &str) -> bool {
		if self.last.as_deref() == Some(msg) {
			self.repeats += 1;
			return false;
		}
		self.last = Some(msg.to_string());
		self.repeats = 0;
		true
	}

	fn clear(&mut self) {
		if self.repeats > 0 {
			debug!("last failure repeated {} more times", self.repeats);
		}
		self.last = None;
		self.repeats = 0;
	}
}

struct SlaveLoop {
	state: AppState,
	client: Client<HttpConnector, Full<Bytes>>,
	unresolved: Option<String>,
	failures: FailureLog,
	target: Option<String>,
	waiting_logged: bool,
	slot: (usize, String),
}

impl SlaveLoop {
	fn new(state: AppState) -> Self {
		let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
		Self {
			state,
			client,
			unresolved: None,
			failures: FailureLog::default(),
			target: None,
			waiting_logged: false,
			slot: (0, String::new()),
		}
	}

	async fn run(mut self, mut stop: watch::Receiver<bool>) {
		while !*stop.borrow() {
			let delay = self.iterate().await;
			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = stop.changed() => {}
			}
		}
		debug!("slave loop stopped");
	}

	/// One registration attempt; returns how long to sleep afterwards.
	async fn iterate(&mut self) -> Duration {
		let settings = self.state.settings().await;
		if !settings.sync.is_slave() {
			return IDLE_DELAY;
		}
		let master = settings.sync.master_url.trim().to_string();
		if master.is_empty() {
			return RETRY_DELAY;
		}

		let Some(target) = self.resolve(&settings, &master).await else {
			return RETRY_DELAY;
		};
		let url = target.url();
		if self.target.as_deref() != Some(url.as_str()) {
			info!("registering with master at {}", url);
			self.target = Some(url.clone());
		}

		let ack = self.state.slave.snapshot().await.applied_generation;
		let body = registration_body(&settings, ack);
		let reply = match self.post(&url, &body, request_timeout(&settings)).await {
			Ok(v) => RegisterReply::from_json(&v),
			Err(e) => {
				self.state.metrics.sync_register_failures_total.inc();
				self.report(format!("register with {} failed: {:#}", url, e));
				return RETRY_DELAY;
			}
		};

		self.observe(&reply).await;
		if reply.generation > 0 {
			let policy = ExecPolicy::from(&settings.exec);
			if let Err(e) = self.apply(&reply, &policy).await {
				self.report(format!("generation {} not applied: {:#}", reply.generation, e));
				return register_interval(&settings);
			}
		}
		self.failures.clear();
		register_interval(&settings)
	}

	fn report(&mut self, msg: String) {
		if self.failures.note(&msg) {
			warn!("{}", msg);
		}
	}

	async fn resolve(&mut self, settings: &Settings, master: &str) -> Option<HttpTarget> {
		let target = match parse_master_reference(master) {
			Ok(reference) => {
				let nodes = self.state.scanner.nodes(MAX_NODES).await;
				resolve_target(&reference, &nodes)
			}
			Err(e) => {
				if self.unresolved.as_deref() != Some(master) {
					warn!("master reference {} is invalid: {}", master, e);
					self.unresolved = Some(master.to_string());
				}
				return None;
			}
		};
		match target {
			Some(t) => {
				self.unresolved = None;
				Some(t)
			}
			None => {
				if self.unresolved.as_deref() != Some(master) {
					info!("master {} not in node directory yet", master);
					self.unresolved = Some(master.to_string());
				}
				if settings.server.enable_scan {
					let cfg = self.state.scan_config().await;
					self.state.scanner.start_async(cfg);
				}
				None
			}
		}
	}

	async fn post(&self, url: &str, body: &Value, budget: Duration) -> Result<Value> {
		let req = Request::post(url)
			.header(CONTENT_TYPE, "application/json")
			.header(CONNECTION, "close")
			.body(Full::new(Bytes::from(serde_json::to_vec(body)?)))
			.context("building register request")?;

		let resp = timeout(budget, self.client.request(req))
			.await
			.map_err(|_| anyhow!("timed out after {} ms", budget.as_millis()))?
			.context("sending register request")?;
		if resp.status() != StatusCode::OK {
			return Err(anyhow!("master answered {}", resp.status()));
		}
		let bytes = timeout(budget, Limited::new(resp.into_body(), MAX_RESPONSE_BYTES).collect())
			.await
			.map_err(|_| anyhow!("timed out reading response"))?
			.map_err(|e| anyhow!("reading response: {}", e))?
			.to_bytes();
		serde_json::from_slice(&bytes).context("parsing register response")
	}

	async fn observe(&mut self, reply: &RegisterReply) {
		if reply.waiting {
			if !self.waiting_logged {
				info!("master has no free slot, waiting");
				self.waiting_logged = true;
			}
		} else {
			self.waiting_logged = false;
		}

		let slot = (reply.slot, reply.slot_label.clone());
		if slot != self.slot {
			match (slot.0, slot.1.is_empty()) {
				(0, _) => info!("no slot assigned"),
				(n, true) => info!("assigned slot {}", n),
				(n, false) => info!("assigned slot {} ({})", n, slot.1),
			}
			self.slot = slot;
		}

		self.state
			.slave
			.update(|t| {
				t.current_slot = reply.slot;
				t.current_slot_label = reply.slot_label.clone();
				if reply.generation > 0 {
					t.last_received_generation = reply.generation;
				}
			})
			.await;
	}

	/// Run the batch in order; the generation is acknowledged only if every
	/// command started.
	async fn apply(&self, reply: &RegisterReply, policy: &ExecPolicy) -> Result<()> {
		info!(
			"applying generation {} ({} commands)",
			reply.generation,
			reply.commands.len()
		);
		for (i, raw) in reply.commands.iter().enumerate() {
			let req = ExecRequest::from_json(raw).ok_or_else(|| anyhow!("command #{} has no path", i + 1))?;
			let out = self.state.runner.run(policy, &req).await?;
			debug!("command {} rc={} elapsed={}ms", req.path, out.rc, out.elapsed_ms);
			self.state.metrics.sync_commands_applied_total.inc();
		}
		let generation = reply.generation;
		self.state
			.slave
			.update(|t| {
				t.applied_generation = generation;
				t.last_received_generation = generation;
				t.active_override_generation = generation;
			})
			.await;
		Ok(())
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::observability::MetricsRegistry;

	#[test]
	fn reply_parses_registered_and_waiting() {
		let v = json!({
			"status": "registered",
			"generation": 3,
			"slot": 2,
			"slot_label": "rear",
			"commands": [{"path": "/opt/a.sh"}]
		});
		let r = RegisterReply::from_json(&v);
		assert!(!r.waiting);
		assert_eq!((r.generation, r.slot), (3, 2));
		assert_eq!(r.slot_label, "rear");
		assert_eq!(r.commands.len(), 1);

		let r = RegisterReply::from_json(&json!({"status": "waiting", "slot": null}));
		assert!(r.waiting);
		assert_eq!((r.generation, r.slot), (0, 0));
		assert!(r.commands.is_empty());
	}

	#[test]
	fn body_omits_empty_identity_fields() {
		let mut s = Settings::default();
		s.sync.id = "s1".into();
		s.caps.role = "camera".into();
		s.caps.caps = vec!["dvr".into()];
		let body = registration_body(&s, 7);
		assert_eq!(body["id"], "s1");
		assert_eq!(body["ack_generation"], 7);
		assert_eq!(body["role"], "camera");
		assert_eq!(body["caps"], json!(["dvr"]));
		assert!(body.get("device").is_none());
	}

	#[test]
	fn interval_and_timeout_defaults() {
		let mut s = Settings::default();
		s.sync.register_interval_s = 0;
		assert_eq!(register_interval(&s), DEFAULT_INTERVAL);
		assert_eq!(request_timeout(&s), DEFAULT_TIMEOUT);
		s.sync.register_interval_s = 2;
		assert_eq!(register_interval(&s), Duration::from_secs(2));
		assert_eq!(request_timeout(&s), Duration::from_millis(2000));
	}

	#[tokio::test]
	async fn reset_clears_tracking() {
		let st = SlaveState::default();
		st.update(|t| {
			t.applied_generation = 5;
			t.current_slot = 1;
		})
		.await;
		assert_eq!(st.snapshot().await.applied_generation, 5);
		st.reset().await;
		assert_eq!(st.snapshot().await, SlaveTracking::default());
	}

	#[test]
	fn identical_failures_are_logged_once() {
		let mut log = FailureLog::default();
		assert!(log.note("register with http://m failed: refused"));
		assert!(!log.note("register with http://m failed: refused"));
		assert!(!log.note("register with http://m failed: refused"));
		assert_eq!(log.repeats, 2);
		assert!(log.note("generation 3 not applied: spawn failed"));
		log.clear();
		assert!(log.note("generation 3 not applied: spawn failed"));
	}

	#[tokio::test]
	async fn repeated_register_failure_is_remembered_until_success() {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		drop(listener);

		let mut s = Settings::default();
		s.sync.role = "slave".into();
		s.sync.master_url = format!("http://127.0.0.1:{}", port);
		let metrics = Arc::new(MetricsRegistry::new().unwrap());
		let mut slave = SlaveLoop::new(AppState::new(s, metrics));

		assert_eq!(slave.iterate().await, RETRY_DELAY);
		let first = slave.failures.last.clone().unwrap();
		assert!(first.starts_with("register with"));
		assert_eq!(slave.iterate().await, RETRY_DELAY);
		assert_eq!(slave.failures.last.as_deref(), Some(first.as_str()));
		assert_eq!(slave.failures.repeats, 1);
		assert_eq!(slave.state.metrics.sync_register_failures_total.get(), 2);
	}
}
