//! HTTP probe of a single peer: `GET /health`, then `GET /caps`.

use std::net::Ipv4Addr;
use std::time::Duration;

use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use hyper::header::CONNECTION;
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::debug;
use serde_json::Value;
use tokio::time::timeout;

use super::directory::NodeInfo;

/// Largest probe response kept in memory.
const MAX_RESPONSE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ProbeTimeouts {
	pub connect: Duration,
	pub health: Duration,
	pub caps: Duration,
}

/// HTTP client shared by every probe of one scan.
#[derive(Clone)]
pub struct Prober {
	client: Client<HttpConnector, Empty<Bytes>>,
	timeouts: ProbeTimeouts,
}

impl Prober {
	pub fn new(timeouts: ProbeTimeouts) -> Self {
		let mut connector = HttpConnector::new();
		connector.set_connect_timeout(Some(timeouts.connect));
		connector.set_nodelay(true);
		let client = Client::builder(TokioExecutor::new())
			.pool_max_idle_per_host(0)
			.build(connector);
		Self { client, timeouts }
	}

	/// Probe `ip:port`. `None` means the host did not answer as a peer: the
	/// health check failed, or `/caps` did not return a JSON object.
	pub async fn probe(&self, ip: Ipv4Addr, port: u16) -> Option<NodeInfo> {
		let budget = self.timeouts.connect + self.timeouts.health;
		self.get(ip, port, "/health", budget).await?;
		let budget = self.timeouts.connect + self.timeouts.caps;
		let body = self.get(ip, port, "/caps", budget).await?;
		parse_caps(&body)
	}

	/// Body of a `200` response, or `None` on any failure.
	async fn get(&self, ip: Ipv4Addr, port: u16, path: &str, budget: Duration) -> Option<Bytes> {
		let url = format!("http://{}:{}{}", ip, port, path);
		let req = Request::get(&url)
			.header(CONNECTION, "close")
			.body(Empty::new())
			.ok()?;
		let exchange = async {
			let resp = self.client.request(req).await.ok()?;
			if resp.status() != StatusCode::OK {
				debug!("{} answered {}", url, resp.status());
				return None;
			}
			Limited::new(resp.into_body(), MAX_RESPONSE)
				.collect()
				.await
				.ok()
				.map(|b| b.to_bytes())
		};
		timeout(budget, exchange).await.ok()?
	}
}

/// One-shot probe with a fresh client.
pub async fn probe_node(ip: Ipv4Addr, port: u16, t: &ProbeTimeouts) -> Option<NodeInfo> {
	Prober::new(*t).probe(ip, port).await
}

/// Extract labels from a `/caps` body. `sync_id` is read from the top level,
/// then `sync.id`, then `sync.sync_id`. Anything but a JSON object is `None`.
pub fn parse_caps(body: &[u8]) -> Option<NodeInfo> {
	let v: Value = serde_json::from_slice(body).ok()?;
	if !v.is_object() {
		return None;
	}
	let text = |key: &str| {
		v.get(key)
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string()
	};
	let sync_id = v
		.get("sync_id")
		.and_then(Value::as_str)
		.or_else(|| v.pointer("/sync/id").and_then(Value::as_str))
		.or_else(|| v.pointer("/sync/sync_id").and_then(Value::as_str))
		.unwrap_or_default()
		.to_string();

	Some(NodeInfo {
		role: text("role"),
		device: text("device"),
		version: text("version"),
		sync_id,
	})
}
