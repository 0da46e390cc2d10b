//! Relay control API.

use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path as UrlPath, State};
use axum::http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use flate2::read::GzDecoder;
use log::{info, warn};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};

use super::action::{ActionError, parse_action};
use super::{RelayError, RelayShared};

/// Largest request body the control API accepts.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

const TEXT: &str = "text/plain; charset=utf-8";
const JSON: &str = "application/json";
const HTML: &str = "text/html; charset=utf-8";

fn text(status: StatusCode, body: &'static str) -> Response {
	(status, [(CONTENT_TYPE, TEXT)], body).into_response()
}

fn json_reply(status: StatusCode, body: Value) -> Response {
	let mut s = body.to_string();
	s.push('\n');
	(status, [(CONTENT_TYPE, JSON)], s).into_response()
}

/// The single-page UI, kept in memory as loaded.
#[derive(Debug, Clone)]
pub struct UiAsset {
	body: Bytes,
	gzip: bool,
}

impl UiAsset {
	/// A `.gz`/`.gzip` name or a gzip magic header marks the asset as compressed.
	pub fn load(path: &Path) -> io::Result<UiAsset> {
		let body = std::fs::read(path)?;
		let by_name = path
			.extension()
			.and_then(|e| e.to_str())
			.is_some_and(|e| e.eq_ignore_ascii_case("gz") || e.eq_ignore_ascii_case("gzip"));
		let ui = UiAsset::from_bytes(body, by_name);
		info!(
			"UI asset {} loaded ({} bytes{})",
			path.display(),
			ui.body.len(),
			if ui.gzip { ", gzip" } else { "" }
		);
		Ok(ui)
	}

	pub fn from_bytes(body: Vec<u8>, gzip_hint: bool) -> UiAsset {
		let gzip = gzip_hint || body.starts_with(&[0x1f, 0x8b]);
		UiAsset {
			body: Bytes::from(body),
			gzip,
		}
	}

	pub fn is_gzip(&self) -> bool {
		self.gzip
	}

	fn respond(&self, accepts_gzip: bool) -> Response {
		if !self.gzip {
			return ([(CONTENT_TYPE, HTML)], self.body.clone()).into_response();
		}
		if accepts_gzip {
			return ([(CONTENT_TYPE, HTML), (CONTENT_ENCODING, "gzip")], self.body.clone()).into_response();
		}
		let mut plain = Vec::new();
		match GzDecoder::new(&self.body[..]).read_to_end(&mut plain) {
			Ok(_) => ([(CONTENT_TYPE, HTML)], plain).into_response(),
			Err(e) => {
				warn!("UI asset does not decompress: {}", e);
				text(StatusCode::INTERNAL_SERVER_ERROR, "ui decode failed\n")
			}
		}
	}
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
	headers
		.get_all(ACCEPT_ENCODING)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|item| {
			let mut parts = item.split(';');
			let coding = parts.next().unwrap_or("").trim();
			let refused = parts.any(|p| {
				p.trim()
					.strip_prefix("q=")
					.and_then(|q| q.trim().parse::<f32>().ok())
					== Some(0.0)
			});
			(coding.eq_ignore_ascii_case("gzip") || coding == "*") && !refused
		})
}

async fn status(State(shared): State<Arc<RelayShared>>) -> Response {
	let body = shared.engine().status_json();
	(StatusCode::OK, [(CONTENT_TYPE, JSON)], body).into_response()
}

async fn get_config(State(shared): State<Arc<RelayShared>>) -> Response {
	match tokio::fs::read(shared.config_path()).await {
		Ok(body) => (StatusCode::OK, [(CONTENT_TYPE, TEXT)], body).into_response(),
		Err(_) => text(StatusCode::NOT_FOUND, "missing config\n"),
	}
}

async fn post_config(State(shared): State<Arc<RelayShared>>, body: Bytes) -> Response {
	let text_body = String::from_utf8_lossy(&body).into_owned();
	let res = tokio::task::spawn_blocking(move || shared.replace_config(&text_body)).await;
	match res {
		Ok(Ok(())) => {
			info!("relay config replaced via API");
			json_reply(StatusCode::OK, json!({"ok": true}))
		}
		Ok(Err(RelayError::Config(e))) => {
			warn!("rejected relay config: {}", e);
			text(StatusCode::BAD_REQUEST, "bad ini\n")
		}
		Ok(Err(e @ RelayError::Bind { .. })) => {
			warn!("{}", e);
			text(StatusCode::INTERNAL_SERVER_ERROR, "bind failed\n")
		}
		Ok(Err(e @ RelayError::Persist { .. })) => {
			warn!("{}", e);
			text(StatusCode::INTERNAL_SERVER_ERROR, "persist failed\n")
		}
		Err(e) => {
			warn!("config task failed: {}", e);
			text(StatusCode::INTERNAL_SERVER_ERROR, "internal error\n")
		}
	}
}

async fn action(
	State(shared): State<Arc<RelayShared>>,
	UrlPath(verb): UrlPath<String>,
	body: Bytes,
) -> Response {
	let parsed: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
	let res = parse_action(&verb, &parsed).and_then(|req| shared.engine().apply_action(req));
	match res {
		Ok(()) => json_reply(StatusCode::OK, json!({"ok": true})),
		Err(ActionError::UnknownVerb) => text(StatusCode::NOT_FOUND, "unknown verb\n"),
		Err(ActionError::BadAction(why)) => {
			info!("action {} rejected: {}", verb, why);
			text(StatusCode::BAD_REQUEST, "bad action\n")
		}
	}
}

async fn reload(State(shared): State<Arc<RelayShared>>, method: Method, body: Bytes) -> Response {
	let sync = method == Method::POST
		&& serde_json::from_slice::<Value>(&body)
			.ok()
			.and_then(|v| v.get("sync").and_then(Value::as_bool))
			.unwrap_or(false);
	if !sync {
		shared.request_reload();
		return json_reply(StatusCode::OK, json!({"ok": true, "queued": true}));
	}
	match tokio::task::spawn_blocking(move || shared.reload_from_disk()).await {
		Ok(Ok(())) => json_reply(StatusCode::OK, json!({"ok": true, "reloaded": true})),
		Ok(Err(e)) => {
			warn!("sync reload failed: {}", e);
			json_reply(
				StatusCode::INTERNAL_SERVER_ERROR,
				json!({"ok": false, "error": "reload_failed"}),
			)
		}
		Err(e) => {
			warn!("reload task failed: {}", e);
			json_reply(
				StatusCode::INTERNAL_SERVER_ERROR,
				json!({"ok": false, "error": "reload_failed"}),
			)
		}
	}
}

async fn ui(State(shared): State<Arc<RelayShared>>, headers: HeaderMap) -> Response {
	match shared.ui() {
		Some(asset) => asset.respond(accepts_gzip(&headers)),
		None => text(StatusCode::NOT_FOUND, "UI not configured (start with --ui <file>)\n"),
	}
}

async fn favicon() -> StatusCode {
	StatusCode::NO_CONTENT
}

async fn not_found() -> StatusCode {
	StatusCode::NOT_FOUND
}

pub fn router(shared: Arc<RelayShared>) -> Router {
	Router::new()
		.route("/api/v1/status", get(status))
		.route("/api/v1/config", get(get_config).post(post_config))
		.route("/api/v1/action/{verb}", post(action))
		.route("/api/v1/reload", get(reload).post(reload))
		.route("/", get(ui))
		.route("/ui", get(ui))
		.route("/ui/", get(ui))
		.route("/ui/index.html", get(ui))
		.route("/favicon.ico", get(favicon))
		.fallback(not_found)
		.layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
		.with_state(shared)
}

async fn stopped(mut stop: watch::Receiver<bool>) {
	let _ = stop.wait_for(|s| *s).await;
}

/// Serve the control API, moving to a new listener whenever one arrives on
/// `rebind`. The old listener drains and closes after the new one is live.
pub async fn serve(
	shared: Arc<RelayShared>,
	mut listener: TcpListener,
	mut rebind: mpsc::UnboundedReceiver<std::net::TcpListener>,
	stop: watch::Receiver<bool>,
) -> io::Result<()> {
	loop {
		let (swap_tx, swap_rx) = oneshot::channel::<()>();
		let app = router(Arc::clone(&shared));
		let stop_rx = stop.clone();
		let server = tokio::spawn(async move {
			axum::serve(listener, app)
				.with_graceful_shutdown(async move {
					tokio::select! {
						_ = swap_rx => {}
						_ = stopped(stop_rx) => {}
					}
				})
				.await
		});

		let next = tokio::select! {
			next = rebind.recv() => next,
			_ = stopped(stop.clone()) => None,
		};
		let Some(next) = next else {
			drop(swap_tx);
			return server.await.map_err(io::Error::other)?;
		};
		let next = TcpListener::from_std(next)?;
		info!("control API moving to {}", next.local_addr()?);
		let _ = swap_tx.send(());
		server.await.map_err(io::Error::other)??;
		listener = next;
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use axum::http::HeaderValue;
	use flate2::Compression;
	use flate2::write::GzEncoder;
	use std::io::Write;

	fn headers(accept: &str) -> HeaderMap {
		let mut h = HeaderMap::new();
		h.insert(ACCEPT_ENCODING, HeaderValue::from_str(accept).unwrap());
		h
	}

	fn gz(data: &[u8]) -> Vec<u8> {
		let mut enc = GzEncoder::new(Vec::new(), Compression::default());
		enc.write_all(data).unwrap();
		enc.finish().unwrap()
	}

	#[test]
	fn accept_encoding_parsing() {
		assert!(accepts_gzip(&headers("gzip, deflate")));
		assert!(accepts_gzip(&headers("br;q=1.0, GZIP;q=0.5")));
		assert!(accepts_gzip(&headers("*")));
		assert!(!accepts_gzip(&headers("gzip;q=0")));
		assert!(!accepts_gzip(&headers("deflate")));
		assert!(!accepts_gzip(&HeaderMap::new()));
	}

	#[test]
	fn gzip_detected_by_magic_or_name() {
		assert!(UiAsset::from_bytes(gz(b"<html>"), false).is_gzip());
		assert!(UiAsset::from_bytes(b"<html>".to_vec(), true).is_gzip());
		assert!(!UiAsset::from_bytes(b"<html>".to_vec(), false).is_gzip());
	}

	#[tokio::test]
	async fn gzip_asset_served_by_client_capability() -> Result<(), Box<dyn std::error::Error>> {
		let asset = UiAsset::from_bytes(gz(b"<html>hi</html>"), false);

		let resp = asset.respond(true);
		assert_eq!(resp.headers()[CONTENT_ENCODING], "gzip");

		let resp = asset.respond(false);
		assert!(resp.headers().get(CONTENT_ENCODING).is_none());
		let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await?;
		assert_eq!(&body[..], b"<html>hi</html>");
		Ok(())
	}

	#[tokio::test]
	async fn plain_asset_is_html() -> Result<(), Box<dyn std::error::Error>> {
		let resp = UiAsset::from_bytes(b"<p>x</p>".to_vec(), false).respond(true);
		assert_eq!(resp.headers()[CONTENT_TYPE], HTML);
		let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await?;
		assert_eq!(&body[..], b"<p>x</p>");
		Ok(())
	}

	#[test]
	fn load_uses_extension_hint() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("index.html.gz");
		std::fs::write(&path, b"not really gzip").unwrap();
		assert!(UiAsset::load(&path).unwrap().is_gzip());
	}
}
