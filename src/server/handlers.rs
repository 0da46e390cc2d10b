//! Handlers for `/exec`, `/udp`, `/nodes`, `/` and `/media`.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, LAST_MODIFIED};
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::{debug, info};
use serde_json::{Map, Value, json};
use tokio::net::UdpSocket;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use super::ApiError;
use super::body::{read_json, str_field};
use crate::exec::ExecRequest;
use crate::scan::MAX_NODES;
use crate::state::AppState;

/// Environment variable naming the media root.
pub const MEDIA_DIR_ENV: &str = "DVR_MEDIA_DIR";
const DEFAULT_MEDIA_DIR: &str = "/media";

pub async fn exec(State(state): State<AppState>, req: Request<Body>) -> Result<Response, ApiError> {
	let v = read_json(req).await?;
	let request = ExecRequest::from_json(&v).ok_or(ApiError::MissingPath)?;
	let policy = state.exec_policy().await;
	let out = state.runner.run(&policy, &request).await?;
	info!("exec {} rc={} elapsed={}ms", request.path, out.rc, out.elapsed_ms);
	Ok((StatusCode::OK, Json(out)).into_response())
}

/// A validated `/udp` request.
#[derive(Debug, PartialEq, Eq)]
pub struct UdpSend {
	pub host: String,
	pub port: u16,
	pub payload: Vec<u8>,
}

pub fn parse_udp(v: &Value) -> Result<UdpSend, ApiError> {
	let host = str_field(v, "host").ok_or(ApiError::InvalidRequest)?;
	let port = v
		.get("port")
		.and_then(Value::as_u64)
		.filter(|p| (1..=65535).contains(p))
		.ok_or(ApiError::InvalidRequest)? as u16;
	let text = v.get("payload").and_then(Value::as_str);
	let encoded = v.get("payload_base64").and_then(Value::as_str);
	let payload = match (text, encoded) {
		(Some(t), None) => t.as_bytes().to_vec(),
		(None, Some(b)) => STANDARD
			.decode(b.trim())
			.map_err(|_| ApiError::InvalidBase64)?,
		_ => return Err(ApiError::InvalidRequest),
	};
	Ok(UdpSend {
		host: host.to_string(),
		port,
		payload,
	})
}

async fn resolve_v4(host: &str, port: u16) -> Result<SocketAddr, ApiError> {
	let addrs = tokio::net::lookup_host((host, port))
		.await
		.map_err(|e| ApiError::ResolveFailed {
			detail: e.to_string(),
		})?;
	addrs
		.into_iter()
		.find(|a| matches!(a.ip(), IpAddr::V4(_)))
		.ok_or_else(|| ApiError::ResolveFailed {
			detail: format!("no IPv4 address for {}", host),
		})
}

pub async fn udp(req: Request<Body>) -> Result<Response, ApiError> {
	let v = read_json(req).await?;
	let send = parse_udp(&v)?;
	let target = resolve_v4(&send.host, send.port).await?;
	let failed = |e: std::io::Error| ApiError::SendFailed {
		detail: e.to_string(),
	};
	let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(failed)?;
	let sent = socket.send_to(&send.payload, target).await.map_err(failed)?;
	debug!("udp {} bytes to {}", sent, target);
	Ok((
		StatusCode::OK,
		Json(json!({
			"status": "sent",
			"bytes_sent": sent,
			"payload_length": send.payload.len(),
			"host": send.host,
			"port": send.port,
		})),
	)
		.into_response())
}

fn with_status(mut out: Map<String, Value>, state: &AppState, enabled: bool) -> Value {
	if let Value::Object(status) = json!(state.scanner.status()) {
		out.extend(status);
	}
	out.insert("scan_feature_enabled".into(), json!(enabled));
	Value::Object(out)
}

pub async fn nodes_get(State(state): State<AppState>) -> Response {
	let enabled = state.settings.read().await.server.enable_scan;
	let nodes = state.scanner.nodes(MAX_NODES).await;
	let mut out = Map::new();
	out.insert("nodes".into(), json!(nodes));
	(StatusCode::OK, Json(with_status(out, &state, enabled))).into_response()
}

pub async fn nodes_post(State(state): State<AppState>) -> Result<Response, ApiError> {
	let enabled = state.settings.read().await.server.enable_scan;
	if !enabled {
		return Err(ApiError::ScanDisabled);
	}
	let started = state.scanner.start_async(state.scan_config().await);
	let mut out = Map::new();
	out.insert("rescan".into(), json!(started.as_str()));
	Ok((StatusCode::ACCEPTED, Json(with_status(out, &state, enabled))).into_response())
}

pub async fn ui_root(State(state): State<AppState>) -> Result<Response, ApiError> {
	let ui = state.settings.read().await.ui.clone();
	if !ui.serve || ui.path.is_empty() {
		return Err(ApiError::NoUi);
	}
	let html = tokio::fs::read(&ui.path).await.map_err(|e| {
		debug!("ui file {} unreadable: {}", ui.path, e);
		ApiError::UiNotFound
	})?;
	Ok((
		StatusCode::OK,
		[(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))],
		html,
	)
		.into_response())
}

fn media_root() -> PathBuf {
	std::env::var_os(MEDIA_DIR_ENV)
		.filter(|v| !v.is_empty())
		.map(PathBuf::from)
		.unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_DIR))
}

pub fn media_content_type(path: &Path) -> &'static str {
	let ext = path
		.extension()
		.and_then(|e| e.to_str())
		.map(str::to_ascii_lowercase)
		.unwrap_or_default();
	match ext.as_str() {
		"mp4" | "m4v" => "video/mp4",
		"mkv" => "video/x-matroska",
		"ts" => "video/mp2t",
		"jpg" | "jpeg" => "image/jpeg",
		"png" => "image/png",
		_ => "application/octet-stream",
	}
}

/// Canonicalise `rel` under `root`; `Forbidden` when it escapes.
pub async fn resolve_media(root: &Path, rel: &str) -> Result<PathBuf, ApiError> {
	let rel = rel.trim_start_matches('/');
	if rel.is_empty() {
		return Err(ApiError::NotFound);
	}
	let base = tokio::fs::canonicalize(root)
		.await
		.map_err(|_| ApiError::NotFound)?;
	let full = tokio::fs::canonicalize(base.join(rel))
		.await
		.map_err(|_| ApiError::NotFound)?;
	if !full.starts_with(&base) {
		return Err(ApiError::Forbidden);
	}
	match tokio::fs::metadata(&full).await {
		Ok(m) if m.is_file() => Ok(full),
		_ => Err(ApiError::NotFound),
	}
}

fn http_date(t: std::time::SystemTime) -> Option<HeaderValue> {
	let dt: chrono::DateTime<chrono::Utc> = t.into();
	HeaderValue::from_str(&dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()).ok()
}

pub async fn media(State(state): State<AppState>, req: Request<Body>) -> Result<Response, ApiError> {
	let dvr = state
		.settings
		.read()
		.await
		.caps
		.caps
		.iter()
		.any(|c| c.eq_ignore_ascii_case("dvr"));
	if !dvr {
		return Err(ApiError::NotFound);
	}
	if req.method() != Method::GET && req.method() != Method::HEAD {
		return Err(ApiError::MethodNotAllowed);
	}
	let rel = req
		.uri()
		.path()
		.strip_prefix("/media")
		.unwrap_or_default()
		.to_string();
	let path = resolve_media(&media_root(), &rel).await?;
	let content_type = media_content_type(&path);
	let modified = tokio::fs::metadata(&path)
		.await
		.ok()
		.and_then(|m| m.modified().ok())
		.and_then(http_date);

	let mut resp = match ServeFile::new(&path).oneshot(req).await {
		Ok(r) => r.into_response(),
		Err(never) => match never {},
	};
	if resp.status().is_success() {
		resp.headers_mut()
			.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
	}
	if let Some(lm) = modified {
		resp.headers_mut().entry(LAST_MODIFIED).or_insert(lm);
	}
	Ok(resp)
}
