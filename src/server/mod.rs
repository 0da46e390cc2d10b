//! The autod HTTP surface.

pub mod body;
pub mod caps;
pub mod error;
pub mod handlers;

use std::net::SocketAddr;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{
	ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
	ACCESS_CONTROL_MAX_AGE, CACHE_CONTROL, CONNECTION, VARY,
};
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::limit::GlobalConcurrencyLimitLayer;

pub use error::ApiError;

use crate::health;
use crate::state::AppState;
use crate::sync::handler as sync_handler;

/// Requests served concurrently.
pub const MAX_IN_FLIGHT: usize = 4;

async fn method_not_allowed() -> ApiError {
	ApiError::MethodNotAllowed
}

async fn not_found() -> ApiError {
	ApiError::NotFound
}

/// Paths that stay same-origin when `ui_public=0`.
fn ui_scoped(path: &str) -> bool {
	matches!(path, "/" | "/caps" | "/sync/bind") || path == "/media" || path.starts_with("/media/")
}

async fn common_headers(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
	let cors = !ui_scoped(req.uri().path()) || state.settings.read().await.ui.public;
	let mut resp = if req.method() == Method::OPTIONS {
		let mut r = StatusCode::NO_CONTENT.into_response();
		let h = r.headers_mut();
		h.insert(
			ACCESS_CONTROL_ALLOW_METHODS,
			HeaderValue::from_static("GET, POST, OPTIONS"),
		);
		h.insert(
			ACCESS_CONTROL_ALLOW_HEADERS,
			HeaderValue::from_static("Content-Type"),
		);
		h.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
		r
	} else {
		next.run(req).await
	};

	let h = resp.headers_mut();
	h.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
	h.insert(CONNECTION, HeaderValue::from_static("close"));
	if cors {
		h.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
		h.insert(VARY, HeaderValue::from_static("Origin"));
	}
	resp
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(health::health).fallback(method_not_allowed))
		.route(
			"/metrics",
			get(health::metrics_handler).fallback(method_not_allowed),
		)
		.route("/caps", get(caps::caps).fallback(method_not_allowed))
		.route("/exec", post(handlers::exec).fallback(method_not_allowed))
		.route("/udp", post(handlers::udp).fallback(method_not_allowed))
		.route(
			"/nodes",
			get(handlers::nodes_get)
				.post(handlers::nodes_post)
				.fallback(method_not_allowed),
		)
		.route("/sync/register", any(sync_handler::register))
		.route("/sync/slaves", any(sync_handler::slaves))
		.route("/sync/push", any(sync_handler::push))
		.route("/sync/bind", any(sync_handler::bind))
		.route("/", get(handlers::ui_root).fallback(method_not_allowed))
		.route("/media/{*path}", any(handlers::media))
		.fallback(not_found)
		.layer(middleware::from_fn_with_state(state.clone(), common_headers))
		.layer(GlobalConcurrencyLimitLayer::new(MAX_IN_FLIGHT))
		.with_state(state)
}

/// Serve until `stop` turns true, then drain in-flight requests.
pub async fn serve(
	listener: TcpListener,
	state: AppState,
	mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
	axum::serve(
		listener,
		router(state).into_make_service_with_connect_info::<SocketAddr>(),
	)
	.with_graceful_shutdown(async move {
		let _ = stop.wait_for(|stopped| *stopped).await;
	})
	.await
}
