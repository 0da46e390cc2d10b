//! `GET /caps`: identity, capabilities and a runtime snapshot of this node.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::header::HOST;
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};

use crate::clock::unix_now;
use crate::config::{Settings, SseAnnounce};
use crate::netif;
use crate::state::AppState;
use crate::sync::{self, slave::SlaveTracking};

const DEFAULT_HOST: &str = "127.0.0.1";

/// Host part of a `Host` header, without port.
pub fn request_host(headers: &HeaderMap) -> String {
	let raw = headers
		.get(HOST)
		.and_then(|v| v.to_str().ok())
		.map(str::trim)
		.unwrap_or_default();
	let host = if let Some(rest) = raw.strip_prefix('[') {
		rest.split(']').next().unwrap_or_default()
	} else {
		raw.split(':').next().unwrap_or_default()
	};
	if host.is_empty() {
		DEFAULT_HOST.to_string()
	} else {
		host.to_string()
	}
}

/// Replace the `http://IP` prefix or `{IP}` placeholders with `host`.
pub fn substitute_host(url: &str, host: &str) -> String {
	if let Some(rest) = url.strip_prefix("http://IP") {
		format!("http://{}{}", host, rest)
	} else {
		url.replace("{IP}", host)
	}
}

#[derive(Debug, Default, PartialEq)]
pub struct Runtime {
	pub uptime_s: Option<f64>,
	pub loadavg: Option<[f64; 3]>,
	pub memfree_kb: Option<u64>,
	pub memavail_kb: Option<u64>,
}

pub fn parse_uptime(text: &str) -> Option<f64> {
	text.split_whitespace().next()?.parse().ok()
}

pub fn parse_loadavg(text: &str) -> Option<[f64; 3]> {
	let mut it = text.split_whitespace().map(|f| f.parse::<f64>().ok());
	Some([it.next()??, it.next()??, it.next()??])
}

/// `(MemFree, MemAvailable)` in kB.
pub fn parse_meminfo(text: &str) -> (Option<u64>, Option<u64>) {
	let field = |name: &str| {
		text.lines().find_map(|l| {
			let rest = l.strip_prefix(name)?.strip_prefix(':')?;
			rest.split_whitespace().next()?.parse().ok()
		})
	};
	(field("MemFree"), field("MemAvailable"))
}

async fn read_runtime() -> Runtime {
	let read = |p: &'static str| async move { tokio::fs::read_to_string(p).await.ok() };
	let (mem_free, mem_avail) = read("/proc/meminfo")
		.await
		.map(|t| parse_meminfo(&t))
		.unwrap_or((None, None));
	Runtime {
		uptime_s: read("/proc/uptime").await.as_deref().and_then(parse_uptime),
		loadavg: read("/proc/loadavg").await.as_deref().and_then(parse_loadavg),
		memfree_kb: mem_free,
		memavail_kb: mem_avail,
	}
}

fn announce_list(announce: &[SseAnnounce], host: &str) -> Value {
	Value::Array(
		announce
			.iter()
			.map(|a| json!({"name": a.name, "url": substitute_host(&a.url, host)}))
			.collect(),
	)
}

/// Assemble the caps document from already-gathered inputs.
pub fn caps_document(
	settings: &Settings,
	tracking: &SlaveTracking,
	runtime: &Runtime,
	host: &str,
) -> Value {
	let mut out = Map::new();
	let caps = &settings.caps;
	for (key, value) in [
		("device", &caps.device),
		("role", &caps.role),
		("version", &caps.version),
	] {
		if !value.is_empty() {
			out.insert(key.into(), json!(value));
		}
	}

	let mut list = caps.caps.clone();
	if let Some(extra) = sync::sync_capability(settings) {
		if !list.iter().any(|c| c.eq_ignore_ascii_case(extra)) {
			list.push(extra.to_string());
		}
	}
	out.insert("caps".into(), json!(list));
	out.insert("port".into(), json!(settings.server.port));
	out.insert("ts_unix".into(), json!(unix_now()));
	if let Some(up) = runtime.uptime_s {
		out.insert("uptime_s".into(), json!(up));
	}
	if let Some(load) = runtime.loadavg {
		out.insert("loadavg".into(), json!(load));
	}
	if let Some(kb) = runtime.memfree_kb {
		out.insert("memfree_kb".into(), json!(kb));
	}
	if let Some(kb) = runtime.memavail_kb {
		out.insert("memavail_kb".into(), json!(kb));
	}

	if caps.include_net_info {
		let ifaddrs: Vec<Value> = netif::non_loopback_interfaces()
			.iter()
			.map(|i| json!({"if": i.name, "ip": i.addr.to_string()}))
			.collect();
		out.insert("ifaddrs".into(), Value::Array(ifaddrs));
	}
	if !settings.announce.is_empty() {
		out.insert("sse".into(), announce_list(&settings.announce, host));
	}
	if settings.ui.serve && !settings.ui.path.is_empty() {
		out.insert(
			"ui".into(),
			json!({"path": settings.ui.path, "public": settings.ui.public}),
		);
	}
	out.insert(
		"scan_feature_enabled".into(),
		json!(settings.server.enable_scan),
	);
	if let Some(block) = sync::status_block(settings, tracking) {
		out.insert("sync".into(), block);
	}
	Value::Object(out)
}

pub async fn caps(State(state): State<AppState>, headers: HeaderMap) -> Response {
	let settings = state.settings().await;
	let tracking = state.slave.snapshot().await;
	let runtime = read_runtime().await;
	let host = request_host(&headers);
	Json(caps_document(&settings, &tracking, &runtime, &host)).into_response()
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use axum::http::HeaderValue;

	use super::*;

	#[test]
	fn host_header_drops_port() {
		let mut h = HeaderMap::new();
		assert_eq!(request_host(&h), "127.0.0.1");
		h.insert(HOST, HeaderValue::from_static("10.1.2.3:8080"));
		assert_eq!(request_host(&h), "10.1.2.3");
		h.insert(HOST, HeaderValue::from_static("[fe80::1]:8080"));
		assert_eq!(request_host(&h), "fe80::1");
	}

	#[test]
	fn announce_placeholders() {
		assert_eq!(
			substitute_host("http://IP:9000/events", "10.0.0.4"),
			"http://10.0.0.4:9000/events"
		);
		assert_eq!(
			substitute_host("http://{IP}:9100/s?h={IP}", "cam"),
			"http://cam:9100/s?h=cam"
		);
		assert_eq!(substitute_host("http://fixed/x", "cam"), "http://fixed/x");
	}

	#[test]
	fn proc_parsers() {
		assert_eq!(parse_uptime("1234.56 789.00\n"), Some(1234.56));
		assert_eq!(
			parse_loadavg("0.10 0.20 0.30 1/100 42\n"),
			Some([0.10, 0.20, 0.30])
		);
		assert_eq!(parse_loadavg("0.1"), None);
		let mem = "MemTotal: 100 kB\nMemFree:  40 kB\nMemAvailable: 70 kB\n";
		assert_eq!(parse_meminfo(mem), (Some(40), Some(70)));
	}

	#[test]
	fn document_adds_sync_capability_once() {
		let mut s = Settings::default();
		s.caps.role = "camera".into();
		s.caps.caps = vec!["dvr".into(), "sync-master".into()];
		s.caps.include_net_info = false;
		s.sync.role = "master".into();
		s.sync.id = "m1".into();
		let doc = caps_document(&s, &SlaveTracking::default(), &Runtime::default(), "h");
		assert_eq!(doc["caps"], json!(["dvr", "sync-master"]));
		assert_eq!(doc["role"], "camera");
		assert_eq!(doc["sync"]["role"], "master");
		assert!(doc.get("device").is_none());
		assert!(doc.get("ifaddrs").is_none());
		assert!(doc.get("ui").is_none());
	}
}
