//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener as StdTcpListener, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use autod::config::Settings;
use autod::exec::{CommandRunner, ExecError, ExecOutput, ExecPolicy, ExecRequest};
use autod::observability::MetricsRegistry;
use autod::state::AppState;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Records every command instead of spawning it.
#[derive(Default)]
pub struct RecordingRunner {
	calls: Mutex<Vec<ExecRequest>>,
}

impl RecordingRunner {
	pub fn calls(&self) -> Vec<ExecRequest> {
		self.calls.lock().unwrap().clone()
	}
}

#[async_trait]
impl CommandRunner for RecordingRunner {
	async fn run(&self, _policy: &ExecPolicy, req: &ExecRequest) -> Result<ExecOutput, ExecError> {
		self.calls.lock().unwrap().push(req.clone());
		Ok(ExecOutput {
			rc: 0,
			elapsed_ms: 1,
			stdout: format!("ran {}\n", req.path),
			stderr: String::new(),
		})
	}
}

pub fn metrics() -> Arc<MetricsRegistry> {
	Arc::new(MetricsRegistry::new().expect("metrics registry"))
}

/// A master named `m1` whose slot 3 carries one command.
pub fn master_settings() -> Settings {
	let mut s = Settings::default();
	s.server.bind = "127.0.0.1".into();
	s.caps.device = "ground".into();
	s.caps.role = "gs".into();
	s.sync.role = "master".into();
	s.sync.id = "m1".into();
	s.sync.register_interval_s = 1;
	s.sync.slots[2].name = "Cam".into();
	s.sync.slots[2].commands = vec![json!({"path": "/opt/cam.sh", "args": ["on"]})];
	s
}

pub fn slave_settings(id: &str, master_url: &str) -> Settings {
	let mut s = Settings::default();
	s.server.bind = "127.0.0.1".into();
	s.sync.role = "slave".into();
	s.sync.id = id.into();
	s.sync.master_url = master_url.into();
	s.sync.register_interval_s = 1;
	s
}

pub fn state_with(settings: Settings) -> (AppState, Arc<RecordingRunner>) {
	let runner = Arc::new(RecordingRunner::default());
	let state = AppState::with_runner(settings, metrics(), runner.clone());
	(state, runner)
}

pub fn app(state: &AppState) -> Router {
	autod::server::router(state.clone())
}

pub struct Reply {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl Reply {
	pub fn json(&self) -> Value {
		serde_json::from_slice(&self.body).unwrap_or(Value::Null)
	}

	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}
}

pub async fn send(app: &Router, req: Request<Body>) -> Result<Reply, Box<dyn std::error::Error>> {
	let resp = app.clone().oneshot(req).await?;
	let status = resp.status();
	let headers = resp.headers().clone();
	let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await?;
	Ok(Reply {
		status,
		headers,
		body,
	})
}

pub async fn call(
	app: &Router,
	method: Method,
	uri: &str,
	body: Option<Value>,
) -> Result<Reply, Box<dyn std::error::Error>> {
	let builder = Request::builder().method(method).uri(uri);
	let req = match body {
		Some(v) => builder
			.header("content-type", "application/json")
			.body(Body::from(v.to_string()))?,
		None => builder.body(Body::empty())?,
	};
	send(app, req).await
}

pub fn free_tcp_port() -> u16 {
	StdTcpListener::bind("127.0.0.1:0")
		.and_then(|l| l.local_addr())
		.map(|a| a.port())
		.expect("ephemeral tcp port")
}

pub fn free_udp_port() -> u16 {
	UdpSocket::bind("127.0.0.1:0")
		.and_then(|s| s.local_addr())
		.map(|a| a.port())
		.expect("ephemeral udp port")
}

/// A loopback UDP receiver with a read timeout.
pub fn udp_sink() -> (UdpSocket, SocketAddr) {
	let s = UdpSocket::bind("127.0.0.1:0").expect("bind sink");
	s.set_read_timeout(Some(Duration::from_secs(2)))
		.expect("sink timeout");
	let addr = s.local_addr().expect("sink addr");
	(s, addr)
}

/// Poll `check` every 50 ms until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	let deadline = tokio::time::Instant::now() + within;
	loop {
		if check().await {
			return true;
		}
		if tokio::time::Instant::now() >= deadline {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
}
